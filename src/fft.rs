//! Centered FFT along named axes using rustfft
//!
//! `k2i` / `i2k` follow the usual MR convention: the k-space center sits at
//! index `n/2` and the image center at index `n/2`, i.e.
//! `k2i = fftshift(ifft(ifftshift(k)))` with `1/n` normalisation on
//! the inverse. Any subset of axes can be transformed, which allows staged
//! transforms (readout first for EPI correction, phase axes later).

use num_complex::Complex64;
use rustfft::{Fft, FftDirection, FftPlanner};
use std::collections::HashMap;
use std::sync::Arc;

use crate::volume::{Axis, Volume};

/// FFT workspace that caches plans and scratch buffers for reuse
pub struct FftWorkspace {
    planner: FftPlanner<f64>,
    plans: HashMap<(usize, bool), Arc<dyn Fft<f64>>>,
    scratch: Vec<Complex64>,
}

impl Default for FftWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

impl FftWorkspace {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
            plans: HashMap::new(),
            scratch: Vec::new(),
        }
    }

    fn plan(&mut self, n: usize, direction: FftDirection) -> Arc<dyn Fft<f64>> {
        let inverse = direction == FftDirection::Inverse;
        let planner = &mut self.planner;
        let plan = self
            .plans
            .entry((n, inverse))
            .or_insert_with(|| planner.plan_fft(n, direction))
            .clone();
        let needed = plan.get_inplace_scratch_len();
        if self.scratch.len() < needed {
            self.scratch.resize(needed, Complex64::new(0.0, 0.0));
        }
        plan
    }

    /// Centered 1-D transform of every lane along `axis`
    pub fn transform_axis(&mut self, data: &mut Volume, axis: Axis, direction: FftDirection) {
        let n = data.len(axis);
        if n <= 1 {
            return;
        }
        let plan = self.plan(n, direction);
        let scale = if direction == FftDirection::Inverse { 1.0 / n as f64 } else { 1.0 };
        let scratch = &mut self.scratch;

        data.for_each_lane_mut(axis, |_, lane| {
            // ifftshift
            lane.rotate_left(n / 2);
            plan.process_with_scratch(lane, scratch);
            // fftshift
            lane.rotate_right(n / 2);
            if direction == FftDirection::Inverse {
                for v in lane.iter_mut() {
                    *v *= scale;
                }
            }
        });
    }

    /// k-space to image space along `axes`
    pub fn k2i(&mut self, data: &mut Volume, axes: &[Axis]) {
        for &axis in axes {
            self.transform_axis(data, axis, FftDirection::Inverse);
        }
    }

    /// Image space to k-space along `axes`
    pub fn i2k(&mut self, data: &mut Volume, axes: &[Axis]) {
        for &axis in axes {
            self.transform_axis(data, axis, FftDirection::Forward);
        }
    }
}

/// k-space to image space along `axes` with a throwaway workspace
pub fn k2i(data: &mut Volume, axes: &[Axis]) {
    FftWorkspace::new().k2i(data, axes);
}

/// Image space to k-space along `axes` with a throwaway workspace
pub fn i2k(data: &mut Volume, axes: &[Axis]) {
    FftWorkspace::new().i2k(data, axes);
}

/// Apply the per-axis integer image shifts (sub-FOV recentring)
///
/// This is a circular shift, not a crop. Zero shifts are skipped.
pub fn shift_image(data: &Volume, shifts: &[(Axis, i64)]) -> Volume {
    let mut out = data.clone();
    for &(axis, shift) in shifts {
        if shift != 0 {
            out = out.roll(axis, shift);
        }
    }
    out
}

/// Cached forward/inverse plans for repeated 1-D transforms of one length
pub struct LineFft {
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
    scratch: Vec<Complex64>,
    n: usize,
}

impl LineFft {
    pub fn new(n: usize) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft(n, FftDirection::Forward);
        let inverse = planner.plan_fft(n, FftDirection::Inverse);
        let len = forward.get_inplace_scratch_len().max(inverse.get_inplace_scratch_len());
        Self { forward, inverse, scratch: vec![Complex64::new(0.0, 0.0); len], n }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Centered inverse transform of one line of length `n`
    pub fn k2i(&mut self, line: &mut [Complex64]) {
        let n = self.n;
        if n <= 1 {
            return;
        }
        line.rotate_left(n / 2);
        self.inverse.process_with_scratch(line, &mut self.scratch);
        line.rotate_right(n / 2);
        let scale = 1.0 / n as f64;
        for v in line.iter_mut() {
            *v *= scale;
        }
    }

    /// Centered forward transform of one line of length `n`
    pub fn i2k(&mut self, line: &mut [Complex64]) {
        let n = self.n;
        if n <= 1 {
            return;
        }
        line.rotate_left(n / 2);
        self.forward.process_with_scratch(line, &mut self.scratch);
        line.rotate_right(n / 2);
    }
}

/// 1-D centered inverse transform of a plain vector
pub fn k2i_1d(data: &mut [Complex64]) {
    if data.len() <= 1 {
        return;
    }
    LineFft::new(data.len()).k2i(data);
}

/// 1-D centered forward transform of a plain vector
pub fn i2k_1d(data: &mut [Complex64]) {
    if data.len() <= 1 {
        return;
    }
    LineFft::new(data.len()).i2k(data);
}

/// Index into a 3D array stored in Fortran order (column-major)
/// index = x + y*nx + z*nx*ny
#[inline(always)]
pub fn idx3d(i: usize, j: usize, k: usize, nx: usize, ny: usize) -> usize {
    i + j * nx + k * nx * ny
}
