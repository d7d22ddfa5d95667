//! Reconstruction settings
//!
//! Knobs that are chosen by the operator rather than read from the scan.
//! Every field has a default, so an empty JSON object is a valid config.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::assembly::{AveragingMode, BoundsPolicy};
use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    /// Edge fraction of the ringing filter per encoding axis
    pub filter_edges: [f64; 3],
    pub apply_ringing_filter: bool,
    pub averaging: AveragingMode,
    pub bounds: BoundsPolicy,
    /// Overrides the scan's SENSE regularization factor
    pub regularization: Option<f64>,
    /// Body-coil magnitude (fraction of max) below which sensitivities are zero
    pub body_threshold: f64,
    /// Order of the flow background-phase polynomial; `None` disables the fit
    pub background_order: Option<usize>,
    /// Compress the coil array before SENSE unfolding
    pub compress_coils: bool,
    /// Number of virtual coils; defaults to a quarter of the physical coils
    pub virtual_coils: Option<usize>,
    /// Overrides the scan's number of cardiac phases
    pub cardiac_phases: Option<usize>,
    /// Run independent (mix, stack) iterations on the rayon pool
    pub parallel: bool,
    /// Samples still carry the readout oversampling; it is cropped in image
    /// space. Disable when the reader already removed it.
    pub remove_readout_oversampling: bool,
    /// Zero-pad the in-plane axes of the final images to a square
    pub square_pad: bool,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            filter_edges: [0.25; 3],
            apply_ringing_filter: true,
            averaging: AveragingMode::Running,
            bounds: BoundsPolicy::Clip,
            regularization: None,
            body_threshold: 0.05,
            background_order: Some(3),
            compress_coils: false,
            virtual_coils: None,
            cardiac_phases: None,
            parallel: false,
            remove_readout_oversampling: true,
            square_pad: false,
        }
    }
}

impl ReconConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Virtual coil count for `channels` physical coils
    pub fn virtual_coil_count(&self, channels: usize) -> usize {
        self.virtual_coils
            .unwrap_or_else(|| channels.div_ceil(4))
            .clamp(1, channels.max(1))
    }
}
