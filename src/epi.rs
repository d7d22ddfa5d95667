//! EPI ramp-sample regridding and ghost correction
//!
//! Readout samples acquired on the gradient ramps lie at non-uniform
//! k-space positions and are interpolated onto the integer grid first.
//! Echoes read with alternating gradient polarity carry a linear phase
//! error along the readout (in image space), which shows up as N/2 ghosts.
//! A calibration acquisition without phase encoding measures that error per
//! echo number; every data profile is corrected with the model of its echo
//! before profiles are averaged.

use num_complex::Complex64;

use crate::assembly::{readout_placement, AssembledKSpace, AssemblyOptions};
use crate::error::{ReconError, Result};
use crate::fft::LineFft;
use crate::labels::RawProfile;
use crate::volume::Axis;

// ============================================================================
// Regridding
// ============================================================================

/// Linear interpolation of one line onto integer positions
///
/// Positions outside the sampled interval are filled with zero.
fn interpolate_line(positions: &[f64], samples: &[Complex64], target: &[f64]) -> Vec<Complex64> {
    target
        .iter()
        .map(|&t| {
            let upper = positions.partition_point(|&p| p < t);
            if upper == 0 {
                return if positions.first() == Some(&t) { samples[0] } else { Complex64::new(0.0, 0.0) };
            }
            if upper >= positions.len() {
                return Complex64::new(0.0, 0.0);
            }
            let (x0, x1) = (positions[upper - 1], positions[upper]);
            let w = (t - x0) / (x1 - x0);
            samples[upper - 1] * (1.0 - w) + samples[upper] * w
        })
        .collect()
}

/// Resample ramp-sampled profiles onto the uniform readout grid
///
/// # Arguments
/// * `profiles` - Raw profiles; sample `i` was taken at `positions[i]`
/// * `positions` - Strictly increasing readout positions in encoding units
/// * `range` - Target encoding numbers `[min, max]` (inclusive)
///
/// # Returns
/// Profiles with `max - min + 1` samples at the integer positions
pub fn regrid_readout(profiles: &[RawProfile], positions: &[f64], range: [i32; 2]) -> Result<Vec<RawProfile>> {
    if positions.windows(2).any(|w| w[1] <= w[0]) {
        return Err(ReconError::InvalidParameter(
            "non-uniform readout positions must be strictly increasing".to_string(),
        ));
    }
    let target: Vec<f64> = (range[0]..=range[1]).map(|k| k as f64).collect();
    profiles
        .iter()
        .map(|p| {
            if p.samples.len() != positions.len() {
                return Err(ReconError::ShapeMismatch(format!(
                    "{} samples for {} readout positions",
                    p.samples.len(),
                    positions.len()
                )));
            }
            Ok(RawProfile::new(p.label.clone(), interpolate_line(positions, &p.samples, &target)))
        })
        .collect()
}

// ============================================================================
// Ghost correction
// ============================================================================

/// Linear phase model `slope * (x - nx/2) + offset` of one echo
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LinePhase {
    pub slope: f64,
    pub offset: f64,
}

impl LinePhase {
    #[inline]
    pub fn at(&self, x: f64) -> f64 {
        self.slope * x + self.offset
    }
}

/// Phase models per (location, echo number)
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EpiCorrection {
    entries: Vec<(i64, i32, LinePhase)>,
}

impl EpiCorrection {
    pub fn get(&self, location: i64, grad: i32) -> Option<LinePhase> {
        self.entries
            .iter()
            .find(|(l, g, _)| *l == location && *g == grad)
            .map(|(_, _, p)| *p)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Derive the per-echo phase models from calibration data
///
/// `calibration` must be sorted with echo numbers on the phase-encode axis
/// ([`crate::assembly::PhaseEncodeSource::Grad`]) and transformed along the readout only.
/// The echo with the lowest number is the reference; for every echo `g`
///
/// ```text
/// p_g(x)  = Σ_channels cal_g(x) conj(cal_ref(x))
/// slope   = arg Σ_x p_g(x+1) conj(p_g(x))
/// offset  = arg Σ_x p_g(x) exp(-i slope (x - nx/2))
/// ```
pub fn epi_correction_data(calibration: &AssembledKSpace) -> Result<EpiCorrection> {
    let data = &calibration.data;
    let shape = data.shape();
    let nx = shape.len(Axis::Readout);
    let n_grad = shape.len(Axis::PhaseEncode);
    let locations = calibration.values(Axis::Location);
    if n_grad == 0 || nx < 2 {
        return Err(ReconError::NoData("calibration data has no usable echoes".to_string()));
    }

    let mut entries = Vec::new();
    for (l_index, &location) in locations.iter().enumerate() {
        for g in 0..n_grad {
            // p(x) summed over channels and every remaining axis of this location
            let mut p = vec![Complex64::new(0.0, 0.0); nx];
            let n_cells = shape.total() / nx;
            let counts_shape = shape.with(Axis::Readout, 1);
            for cell in 0..n_cells {
                let coords = counts_shape.coords(cell);
                if coords[Axis::PhaseEncode.index()] != 0 || coords[Axis::Location.index()] != l_index {
                    continue;
                }
                let mut ref_coords = coords;
                let mut cur_coords = coords;
                ref_coords[Axis::PhaseEncode.index()] = 0;
                cur_coords[Axis::PhaseEncode.index()] = g;
                let r = shape.offset(&ref_coords);
                let c = shape.offset(&cur_coords);
                for x in 0..nx {
                    p[x] += data.data()[c + x] * data.data()[r + x].conj();
                }
            }

            let slope = p.windows(2).map(|w| w[1] * w[0].conj()).sum::<Complex64>().arg();
            let center = (nx / 2) as f64;
            let offset = p
                .iter()
                .enumerate()
                .map(|(x, v)| v * Complex64::from_polar(1.0, -slope * (x as f64 - center)))
                .sum::<Complex64>()
                .arg();

            let grad = g as i64 - calibration.origin[1];
            entries.push((location, grad as i32, LinePhase { slope, offset }));
        }
        log::debug!("EPI calibration location {}: {} echoes", location, n_grad);
    }
    Ok(EpiCorrection { entries })
}

/// Remove the per-echo linear phase from every profile before averaging
///
/// Each profile is placed on the readout grid of `options`, transformed to
/// image space, recentred by `readout_shift` and multiplied by the inverse
/// phase model of its (location, echo). The result is transformed back and
/// unshifted, so the returned profiles already fill the whole grid and
/// assemble with the readout range removed from `options`. Repeated
/// acquisitions of one cell with different echo numbers are corrected
/// individually, which keeps the average independent of the read order.
///
/// # Arguments
/// * `profiles` - Profiles of one iteration, as read
/// * `correction` - Phase models from [`epi_correction_data`]
/// * `options` - Assembly options the profiles are destined for
/// * `readout_shift` - Image shift along the readout applied after the FFT
///
/// # Returns
/// Corrected profiles with the readout length of the assembled grid
pub fn correct_epi_profiles(
    profiles: &[RawProfile],
    correction: &EpiCorrection,
    options: &AssemblyOptions,
    readout_shift: i64,
) -> Result<Vec<RawProfile>> {
    let Some(first) = profiles.first() else {
        return Ok(Vec::new());
    };
    let n_samples = first.samples.len();
    let (nx, start) = readout_placement(options, n_samples)?;
    let center = (nx / 2) as f64;
    let mut fft = LineFft::new(nx);
    let mut missing = 0usize;

    let mut out = Vec::with_capacity(profiles.len());
    for p in profiles {
        if p.samples.len() != n_samples {
            return Err(ReconError::ShapeMismatch(format!(
                "profile with {} samples among profiles with {}",
                p.samples.len(),
                n_samples
            )));
        }
        let mut line = vec![Complex64::new(0.0, 0.0); nx];
        for (i, &v) in p.samples.iter().enumerate() {
            let x = start + i as i64;
            if (0..nx as i64).contains(&x) {
                line[x as usize] = v;
            }
        }

        match correction.get(p.label.location as i64, p.label.grad) {
            Some(phase) => {
                fft.k2i(&mut line);
                for (x, v) in line.iter_mut().enumerate() {
                    let shifted = (x as i64 + readout_shift).rem_euclid(nx as i64) as f64;
                    *v *= Complex64::from_polar(1.0, -phase.at(shifted - center));
                }
                fft.i2k(&mut line);
            }
            None => missing += 1,
        }
        out.push(RawProfile::new(p.label.clone(), line));
    }
    if missing > 0 {
        log::warn!("{} EPI lines without calibration left uncorrected", missing);
    }
    Ok(out)
}
