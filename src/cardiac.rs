//! Retrospective cardiac binning and gap filling
//!
//! Profiles of a retrospectively gated scan are acquired continuously; the
//! trigger delay of each profile decides its cardiac phase. After sorting,
//! (ky, kz, phase) cells that no heartbeat happened to hit are filled with
//! the same line of the nearest populated phase.

use crate::assembly::AssembledKSpace;
use crate::error::{ReconError, Result};
use crate::labels::{Label, LabelType};
use crate::volume::{Axis, N_AXES};

/// Average cardiac cycle length in ms
///
/// Uses the recorded RR intervals when present. Otherwise heartbeats are
/// delimited by a decrease of the trigger delay (a new trigger) and the
/// cycle is the mean of the largest delay seen in each complete beat.
pub fn estimate_cycle_length(labels: &[Label]) -> Option<f64> {
    let normal: Vec<&Label> = labels.iter().filter(|l| l.typ == LabelType::Normal).collect();

    let rr: Vec<f64> = normal.iter().map(|l| l.rr_interval).filter(|&r| r > 0.0).collect();
    if !rr.is_empty() {
        return Some(rr.iter().sum::<f64>() / rr.len() as f64);
    }

    let mut beats: Vec<f64> = Vec::new();
    let mut current = f64::NEG_INFINITY;
    let mut previous = f64::NEG_INFINITY;
    for l in &normal {
        if l.trigger_time < previous {
            beats.push(current);
            current = f64::NEG_INFINITY;
        }
        current = current.max(l.trigger_time);
        previous = l.trigger_time;
    }
    // the last beat is usually cut short by the end of the scan
    if beats.is_empty() && current.is_finite() {
        beats.push(current);
    }
    let beats: Vec<f64> = beats.into_iter().filter(|b| *b > 0.0).collect();
    if beats.is_empty() {
        return None;
    }
    Some(beats.iter().sum::<f64>() / beats.len() as f64)
}

/// Cardiac phase bin of one trigger delay
#[inline]
pub fn phase_bin(trigger_time: f64, cycle_length: f64, phases: usize) -> u16 {
    let scaled = (trigger_time / cycle_length * phases as f64).round().max(0.0);
    let bin = (scaled as usize).min(phases) % phases;
    bin as u16
}

/// Assign a cardiac phase to every profile
///
/// # Arguments
/// * `labels` - Scan labels
/// * `phases` - Number of cardiac phases to reconstruct
/// * `cycle_length` - Cycle length in ms; estimated from the labels when `None`
///
/// # Returns
/// Copy of the labels with `cardiac_phase` set to the bin index
pub fn retro_binning(labels: &[Label], phases: usize, cycle_length: Option<f64>) -> Result<Vec<Label>> {
    if phases == 0 {
        return Err(ReconError::InvalidParameter("number of cardiac phases must be positive".to_string()));
    }
    let cycle = match cycle_length {
        Some(c) => c,
        None => estimate_cycle_length(labels)
            .ok_or_else(|| ReconError::MissingParameter("cardiac cycle length".to_string()))?,
    };
    if cycle <= 0.0 {
        return Err(ReconError::InvalidParameter(format!("cardiac cycle length {} ms", cycle)));
    }
    log::info!("retrospective binning into {} phases, cycle length {:.1} ms", phases, cycle);

    Ok(labels
        .iter()
        .map(|l| {
            let mut l = l.clone();
            if l.typ == LabelType::Normal {
                l.cardiac_phase = phase_bin(l.trigger_time, cycle, phases);
            }
            l
        })
        .collect())
}

/// Fill unsampled cardiac phases from the nearest sampled phase
///
/// Distance is cyclic along the phase axis; ties go to the earlier phase.
/// Lines that were not sampled in any phase stay zero.
///
/// # Returns
/// Number of filled cells
pub fn retro_fill_holes(kspace: &mut AssembledKSpace) -> usize {
    let shape = kspace.data.shape();
    let counts_shape = kspace.counts_shape();
    let n_phases = shape.len(Axis::CardiacPhase);
    let nx = shape.len(Axis::Readout);
    if n_phases <= 1 {
        return 0;
    }

    let phase_axis = Axis::CardiacPhase.index();
    let mut filled = 0;
    for cell in 0..counts_shape.total() {
        let coords = counts_shape.coords(cell);
        if coords[phase_axis] != 0 {
            continue;
        }
        let line = |p: usize| -> [usize; N_AXES] {
            let mut c = coords;
            c[phase_axis] = p;
            c
        };
        let sampled: Vec<bool> = (0..n_phases)
            .map(|p| kspace.counts[counts_shape.offset(&line(p))] > 0)
            .collect();
        if sampled.iter().all(|&s| s) || !sampled.iter().any(|&s| s) {
            continue;
        }

        for p in 0..n_phases {
            if sampled[p] {
                continue;
            }
            let source = (1..=n_phases / 2 + 1).find_map(|d| {
                let before = (p + n_phases - d % n_phases) % n_phases;
                let after = (p + d) % n_phases;
                if sampled[before] {
                    Some(before)
                } else if sampled[after] {
                    Some(after)
                } else {
                    None
                }
            });
            if let Some(source) = source {
                let src = counts_shape.offset(&line(source)) * nx;
                let dst = counts_shape.offset(&line(p)) * nx;
                let data = kspace.data.data_mut();
                data.copy_within(src..src + nx, dst);
                filled += 1;
            }
        }
    }
    log::debug!("filled {} empty cardiac phase lines", filled);
    filled
}
