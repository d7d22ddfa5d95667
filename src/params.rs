//! Scan parameters (in-memory metadata store)
//!
//! Everything the pipeline needs to know about a scan besides the labels and
//! the raw samples: encoding per (mix, stack), geometry per location,
//! gradient coefficients and the flow/cardiac/EPI constants. Parsing vendor
//! parameter files is out of scope; parameters are loaded from JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ReconError, Result};
use crate::flow::FlowDirection;
use crate::geometry::{GeometryTransform, GradientNonlinearity, InPlaneTransform};

/// SENSE regularization used when the scan does not define one
pub const DEFAULT_REGULARIZATION: f64 = 2.0;

/// Encoding of one (mix, stack) combination
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackEncoding {
    pub mix: u16,
    pub stack: u16,
    /// Reconstructed matrix size per encoding axis without oversampling
    pub recon_resolution: [usize; 3],
    pub oversampling: [f64; 3],
    /// SENSE reduction factor per encoding axis
    pub sense_factors: [f64; 3],
    /// Sampled encoding numbers per axis `[min, max]`; the readout range
    /// is given without readout oversampling
    pub ranges: [[i32; 2]; 3],
    /// Integer image-space shift per axis (sub-FOV recentring)
    pub shifts: [i64; 3],
    /// Voxel sizes in mm
    pub voxel_sizes: [f64; 3],
    pub in_plane: InPlaneTransform,
}

impl Default for StackEncoding {
    fn default() -> Self {
        Self {
            mix: 0,
            stack: 0,
            recon_resolution: [1, 1, 1],
            oversampling: [1.0; 3],
            sense_factors: [1.0; 3],
            ranges: [[0, 0]; 3],
            shifts: [0; 3],
            voxel_sizes: [1.0; 3],
            in_plane: InPlaneTransform::default(),
        }
    }
}

impl StackEncoding {
    /// Matrix size per encoding axis
    ///
    /// # Arguments
    /// * `oversampled` - Include the oversampling factor of each axis
    /// * `folded` - Divide by the SENSE factors (acquired, aliased size)
    pub fn recon_resolution(&self, oversampled: [bool; 3], folded: bool) -> [usize; 3] {
        let mut out = [1; 3];
        for a in 0..3 {
            let mut n = self.recon_resolution[a] as f64;
            if oversampled[a] {
                n *= self.oversampling[a].max(1.0);
            }
            if folded {
                n /= self.sense_factors[a].max(1.0);
            }
            out[a] = (n.round() as usize).max(1);
        }
        out
    }

    /// Sampled encoding range of axis `enc`
    ///
    /// The readout range is scaled by the readout oversampling factor when
    /// `readout_oversampled` is set.
    pub fn range(&self, enc: usize, readout_oversampled: bool) -> [i32; 2] {
        let r = self.ranges[enc.min(2)];
        if enc == 0 && readout_oversampled {
            let os = self.oversampling[0].max(1.0);
            [
                (r[0] as f64 * os).round() as i32,
                ((r[1] + 1) as f64 * os).round() as i32 - 1,
            ]
        } else {
            r
        }
    }

    pub fn ranges(&self, readout_oversampled: bool) -> [[i32; 2]; 3] {
        [
            self.range(0, readout_oversampled),
            self.range(1, false),
            self.range(2, false),
        ]
    }

    /// True when any phase-encoding axis is undersampled
    pub fn is_sense(&self) -> bool {
        self.sense_factors.iter().any(|&f| f > 1.0)
    }
}

/// Scan-wide acquisition parameters
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanParameters {
    pub encodings: Vec<StackEncoding>,
    /// MPS to XYZ transform of every location
    pub geometry: Vec<GeometryTransform>,
    pub gradient_nonlinearity: Option<GradientNonlinearity>,
    pub regularization: Option<f64>,
    /// Velocity encoding per flow component in cm/s
    pub venc: Vec<f64>,
    pub hadamard: bool,
    /// Patient axis and sign of every flow-encoded component
    pub flow_directions: Vec<FlowDirection>,
    /// Concomitant-field coefficients per flow segment
    pub concomitant_factors: Vec<[f64; 4]>,
    pub cardiac_phases: Option<usize>,
    /// Cardiac cycle length in ms
    pub cardiac_cycle_length: Option<f64>,
    pub epi: bool,
    /// Readout positions of the ramp-sampled samples in encoding units
    pub nus_positions: Vec<f64>,
    /// File name of the SENSE reference scan
    pub reference_scan: Option<String>,
    /// Channels of the reference scan that belong to the body coil
    pub body_coil_channels: Vec<u16>,
}

impl ScanParameters {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Encoding of (mix, stack)
    pub fn encoding(&self, mix: u16, stack: u16) -> Result<&StackEncoding> {
        self.encodings
            .iter()
            .find(|e| e.mix == mix && e.stack == stack)
            .ok_or_else(|| ReconError::MissingParameter(format!("encoding of mix {} stack {}", mix, stack)))
    }

    /// SENSE regularization factor (defaults to 2)
    pub fn regularization(&self) -> f64 {
        self.regularization.unwrap_or(DEFAULT_REGULARIZATION)
    }

    pub fn is_epi(&self) -> bool {
        self.epi
    }

    /// Transforms of the given location ids, in the same order
    pub fn transforms(&self, locations: &[u16]) -> Result<Vec<GeometryTransform>> {
        locations
            .iter()
            .map(|&loc| {
                self.geometry
                    .iter()
                    .find(|t| t.location == loc)
                    .cloned()
                    .ok_or_else(|| ReconError::MissingParameter(format!("transform of location {}", loc)))
            })
            .collect()
    }
}
