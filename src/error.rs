//! Error type shared by all reconstruction stages

use std::path::PathBuf;
use thiserror::Error;

use crate::volume::Axis;

#[derive(Error, Debug)]
pub enum ReconError {
    /// The scan is not of the kind the recipe expects (e.g. not EPI, not flow)
    #[error("input classification failed: {0}")]
    InputClassification(String),

    #[error("no reference scan found: {} does not exist", .0.display())]
    ReferenceScanMissing(PathBuf),

    #[error("grid bounds violated on {axis:?}: index {index} outside 0..{len}")]
    GridBounds { axis: Axis, index: i64, len: usize },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("missing scan parameter: {0}")]
    MissingParameter(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("no profiles matched the selection: {0}")]
    NoData(String),

    #[error("geometry transform error: {0}")]
    Geometry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReconError>;
