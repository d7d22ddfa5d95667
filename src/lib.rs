//! recon-core: MR reconstruction pipeline engine
//!
//! Turns labeled raw k-space profiles into corrected, oriented images.
//!
//! # Modules
//! - `volume`: Multi-axis complex volume with named axes
//! - `labels`: Profile labels, selection criteria, relabeling
//! - `params`, `config`: Scan parameters and reconstruction settings (JSON)
//! - `reader`: Raw sample reader seam
//! - `assembly`: K-space sorting with averaging and zero fill
//! - `filter`: Ringing filter
//! - `fft`: Axis-selective centered FFT
//! - `compression`: Coil array compression
//! - `sense`: Reference scan, sensitivities and SENSE unfolding
//! - `homodyne`: Partial-Fourier reconstruction
//! - `epi`: Ramp-sample regridding and ghost correction
//! - `cardiac`: Retrospective binning and gap filling
//! - `flow`: Phase-contrast flow decoding
//! - `geometry`: Gradient nonlinearity, cropping, in-plane format
//! - `spectro`: Single-voxel spectroscopy
//! - `pipeline`: Reconstruction recipes
//! - `export`: Named outputs and NIfTI writer
//! - `profiling`: Injectable stage timing

// Core modules
pub mod error;
pub mod volume;
pub mod fft;
pub mod labels;
pub mod profiling;

// Scan description
pub mod params;
pub mod config;
pub mod reader;

// Reconstruction stages
pub mod assembly;
pub mod filter;
pub mod compression;
pub mod sense;
pub mod homodyne;
pub mod epi;
pub mod cardiac;
pub mod flow;
pub mod geometry;
pub mod spectro;

// Orchestration and output
pub mod pipeline;
pub mod export;

pub use error::{ReconError, Result};
pub use volume::{Axis, Shape, Volume};
pub use labels::{Label, LabelType, RawProfile, SelectionCriteria};
pub use params::ScanParameters;
pub use config::ReconConfig;
pub use reader::{InMemoryReader, SampleReader};
pub use profiling::{NoopRecorder, StageRecorder, TimingLog};
pub use export::ReconOutputs;
pub use pipeline::ReconContext;
