//! K-space assembly (sorting, averaging and zero filling)
//!
//! Raw profiles are placed into a dense [`Volume`] by their labels:
//!
//! - encoding axes with zero fill are centered, encoding number `k` lands
//!   on index `k + n/2` of an output of size `n`
//! - encoding axes without zero fill are packed, the smallest sampled
//!   number lands on index 0
//! - all other axes map the sorted distinct label values onto consecutive
//!   indices, unless a fixed extent is requested (index = label value)
//!
//! Profiles that land on the same cell are averaged. Contributions are put
//! into a canonical order before they are accumulated, so the result does
//! not depend on the order in which profiles were read.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{ReconError, Result};
use crate::labels::{unique, Label, RawProfile};
use crate::volume::{Axis, Shape, Volume, N_AXES};

/// How duplicate acquisitions of one cell are combined
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AveragingMode {
    /// Incremental mean while accumulating
    #[default]
    Running,
    /// Sum everything, divide by the count at the end
    Deferred,
}

/// What to do with profiles outside the destination grid
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundsPolicy {
    /// Drop the offending samples and log a warning
    #[default]
    Clip,
    /// Abort with [`ReconError::GridBounds`]
    Fail,
}

/// Label field that positions profiles along the phase-encode axis
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PhaseEncodeSource {
    #[default]
    Ky,
    /// Gradient echo number (EPI calibration echoes all have ky = 0)
    Grad,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssemblyOptions {
    /// Destination size along readout, phase encode and partition
    pub output_size: [usize; 3],
    /// Center-relative placement per encoding axis
    pub zero_fill: [bool; 3],
    /// Sampled readout range; places asymmetric echoes off-center
    pub readout_range: Option<[i32; 2]>,
    pub phase_source: PhaseEncodeSource,
    pub averaging: AveragingMode,
    pub bounds: BoundsPolicy,
    /// Non-encoding axes with a fixed length where index = label value
    pub fixed_extents: Vec<(Axis, usize)>,
}

impl AssemblyOptions {
    pub fn new(output_size: [usize; 3]) -> Self {
        Self {
            output_size,
            zero_fill: [true; 3],
            readout_range: None,
            phase_source: PhaseEncodeSource::Ky,
            averaging: AveragingMode::Running,
            bounds: BoundsPolicy::Clip,
            fixed_extents: Vec::new(),
        }
    }

    pub fn with_zero_fill(mut self, zero_fill: [bool; 3]) -> Self {
        self.zero_fill = zero_fill;
        self
    }

    pub fn with_readout_range(mut self, range: [i32; 2]) -> Self {
        self.readout_range = Some(range);
        self
    }

    pub fn with_phase_source(mut self, source: PhaseEncodeSource) -> Self {
        self.phase_source = source;
        self
    }

    pub fn with_averaging(mut self, averaging: AveragingMode) -> Self {
        self.averaging = averaging;
        self
    }

    pub fn with_bounds(mut self, bounds: BoundsPolicy) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_fixed_extent(mut self, axis: Axis, len: usize) -> Self {
        self.fixed_extents.retain(|(a, _)| *a != axis);
        self.fixed_extents.push((axis, len));
        self
    }

    fn fixed_extent(&self, axis: Axis) -> Option<usize> {
        self.fixed_extents.iter().find(|(a, _)| *a == axis).map(|(_, n)| *n)
    }
}

/// Assembled k-space together with its sampling bookkeeping
#[derive(Clone, Debug, PartialEq)]
pub struct AssembledKSpace {
    pub data: Volume,
    /// Number of profiles accumulated into every profile cell; laid out
    /// like `data` with readout length 1
    pub counts: Vec<u32>,
    /// Index of encoding number 0 along readout, phase encode and partition
    pub origin: [i64; 3],
    /// Label value at every index of each non-encoding axis
    pub axis_values: [Vec<i64>; N_AXES],
}

impl AssembledKSpace {
    pub fn counts_shape(&self) -> Shape {
        self.data.shape().with(Axis::Readout, 1)
    }

    /// Number of profiles accumulated at the profile cell of `coords`
    pub fn count(&self, coords: &[usize; N_AXES]) -> u32 {
        let mut c = *coords;
        c[0] = 0;
        self.counts[self.counts_shape().offset(&c)]
    }

    /// Label values along a non-encoding axis
    pub fn values(&self, axis: Axis) -> &[i64] {
        &self.axis_values[axis.index()]
    }
}

/// Label value of `label` along a non-encoding axis
pub fn label_value(label: &Label, axis: Axis) -> i64 {
    match axis {
        Axis::Readout => 0,
        Axis::PhaseEncode => label.ky as i64,
        Axis::Partition => label.kz as i64,
        Axis::Channel => label.channel as i64,
        Axis::Dynamic => label.dynamic as i64,
        Axis::CardiacPhase => label.cardiac_phase as i64,
        Axis::Echo => label.echo as i64,
        Axis::Location => label.location as i64,
        Axis::Mix => label.mix as i64,
        Axis::Stack => label.stack as i64,
        Axis::FlowSegment => label.flow_segment as i64,
    }
}

fn encoding_number(label: &Label, axis: Axis, source: PhaseEncodeSource) -> i64 {
    match (axis, source) {
        (Axis::PhaseEncode, PhaseEncodeSource::Grad) => label.grad as i64,
        _ => label_value(label, axis),
    }
}

fn out_of_bounds(policy: BoundsPolicy, axis: Axis, index: i64, len: usize) -> Result<()> {
    match policy {
        BoundsPolicy::Clip => {
            log::warn!("sample outside the grid along {:?}: index {} of {}, dropped", axis, index, len);
            Ok(())
        }
        BoundsPolicy::Fail => Err(ReconError::GridBounds { axis, index, len }),
    }
}

/// Lexicographic total order on sample vectors
fn compare_samples(a: &[Complex64], b: &[Complex64]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = x.re.total_cmp(&y.re).then(x.im.total_cmp(&y.im));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Readout length of the assembled grid and the index of the first sample
///
/// Samples falling outside the grid are handled by the bounds policy once
/// for all profiles.
pub fn readout_placement(options: &AssemblyOptions, n_samples: usize) -> Result<(usize, i64)> {
    if !options.zero_fill[0] {
        return Ok((n_samples, 0));
    }
    let n = options.output_size[0].max(1);
    let start = match options.readout_range {
        Some(r) => (n / 2) as i64 + r[0] as i64,
        None => (n / 2) as i64 - (n_samples / 2) as i64,
    };
    let end = start + n_samples as i64;
    if start < 0 || end > n as i64 {
        let index = if start < 0 { start } else { end - 1 };
        out_of_bounds(options.bounds, Axis::Readout, index, n)?;
    }
    Ok((n, start))
}

/// Sort profiles into a k-space grid
///
/// # Arguments
/// * `profiles` - Raw profiles of one (mix, stack) iteration
/// * `options` - Destination size, placement and averaging rules
///
/// # Returns
/// The assembled volume; cells that were never visited are exactly zero
pub fn assemble(profiles: &[RawProfile], options: &AssemblyOptions) -> Result<AssembledKSpace> {
    let first = profiles
        .first()
        .ok_or_else(|| ReconError::NoData("no profiles to assemble".to_string()))?;
    let n_samples = first.samples.len();
    if let Some(p) = profiles.iter().find(|p| p.samples.len() != n_samples) {
        return Err(ReconError::ShapeMismatch(format!(
            "profile with {} samples among profiles with {}",
            p.samples.len(),
            n_samples
        )));
    }

    let mut dims = [1usize; N_AXES];
    let mut origin = [0i64; 3];
    let mut axis_values: [Vec<i64>; N_AXES] = Default::default();

    let (nx, readout_start) = readout_placement(options, n_samples)?;
    dims[0] = nx;
    origin[0] = (nx / 2) as i64;

    // phase encode and partition placement
    for enc in 1..3 {
        let axis = Axis::spatial(enc);
        if options.zero_fill[enc] {
            let n = options.output_size[enc].max(1);
            dims[enc] = n;
            origin[enc] = (n / 2) as i64;
        } else {
            let numbers = profiles.iter().map(|p| encoding_number(&p.label, axis, options.phase_source));
            let (min, max) = numbers.fold((i64::MAX, i64::MIN), |(lo, hi), k| (lo.min(k), hi.max(k)));
            dims[enc] = (max - min + 1) as usize;
            origin[enc] = -min;
        }
    }

    // remaining axes
    for &axis in &Axis::ALL[3..] {
        let values = match options.fixed_extent(axis) {
            Some(n) => (0..n as i64).collect(),
            None => unique(profiles.iter().map(|p| label_value(&p.label, axis))),
        };
        dims[axis.index()] = values.len().max(1);
        axis_values[axis.index()] = values;
    }

    let shape = Shape::from_dims(dims);
    let counts_shape = shape.with(Axis::Readout, 1);

    // cell of every profile
    let mut contributions: Vec<(usize, usize)> = Vec::with_capacity(profiles.len());
    'profiles: for (p_index, profile) in profiles.iter().enumerate() {
        let mut coords = [0usize; N_AXES];
        for enc in 1..3 {
            let axis = Axis::spatial(enc);
            let index = encoding_number(&profile.label, axis, options.phase_source) + origin[enc];
            if index < 0 || index >= dims[enc] as i64 {
                out_of_bounds(options.bounds, axis, index, dims[enc])?;
                continue 'profiles;
            }
            coords[enc] = index as usize;
        }
        for &axis in &Axis::ALL[3..] {
            let value = label_value(&profile.label, axis);
            let values = &axis_values[axis.index()];
            let index = if options.fixed_extent(axis).is_some() {
                value
            } else {
                values.binary_search(&value).map(|i| i as i64).unwrap_or(-1)
            };
            if index < 0 || index >= dims[axis.index()] as i64 {
                out_of_bounds(options.bounds, axis, index, dims[axis.index()])?;
                continue 'profiles;
            }
            coords[axis.index()] = index as usize;
        }
        contributions.push((counts_shape.offset(&coords), p_index));
    }

    contributions.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| compare_samples(&profiles[a.1].samples, &profiles[b.1].samples))
    });

    let mut data = Volume::zeros(shape);
    let mut counts = vec![0u32; counts_shape.total()];
    {
        let out = data.data_mut();
        for &(cell, p_index) in &contributions {
            counts[cell] += 1;
            let n = counts[cell] as f64;
            let base = cell * nx;
            for (i, &v) in profiles[p_index].samples.iter().enumerate() {
                let x = readout_start + i as i64;
                if x < 0 || x >= nx as i64 {
                    continue;
                }
                let dst = &mut out[base + x as usize];
                match options.averaging {
                    AveragingMode::Running => *dst += (v - *dst) / n,
                    AveragingMode::Deferred => *dst += v,
                }
            }
        }

        if options.averaging == AveragingMode::Deferred {
            for (cell, &count) in counts.iter().enumerate() {
                if count > 1 {
                    let scale = 1.0 / count as f64;
                    for v in &mut out[cell * nx..(cell + 1) * nx] {
                        *v *= scale;
                    }
                }
            }
        }
    }

    log::debug!(
        "assembled {} profiles into {:?} ({} dropped)",
        contributions.len(),
        shape.dims(),
        profiles.len() - contributions.len()
    );

    Ok(AssembledKSpace { data, counts, origin, axis_values })
}
