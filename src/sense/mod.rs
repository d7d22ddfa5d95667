//! SENSE parallel imaging
//!
//! - `refscan`: Reference scan reconstruction, sensitivities and noise covariance
//! - `unfold`: Regularized unfolding of aliased coil images

pub mod refscan;
pub mod unfold;

pub use refscan::{
    compute_sensitivities, noise_covariance, reconstruct_reference, resample, resolve_reference_scan,
    ReferenceImages, SensitivityMaps,
};
pub use unfold::{aliasing_groups, sense_unfold};
