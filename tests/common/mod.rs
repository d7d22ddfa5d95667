//! Common test utilities for recon-core integration tests

#![allow(dead_code)]

use num_complex::Complex64;
use recon_core::fft::{i2k, k2i_1d, i2k_1d};
use recon_core::geometry::InPlaneTransform;
use recon_core::params::StackEncoding;
use recon_core::{Axis, InMemoryReader, Label, Shape, Volume};

/// Route `log` output through the test harness
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Root mean square difference of the magnitudes
pub fn rmse(a: &[Complex64], b: &[Complex64]) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x.norm() - y.norm()).powi(2))
        .sum();
    (sum_sq / a.len() as f64).sqrt()
}

/// Largest complex difference
pub fn max_abs_diff(a: &[Complex64], b: &[Complex64]) -> f64 {
    a.iter().zip(b.iter()).fold(0.0, |m, (x, y)| m.max((x - y).norm()))
}

/// `n` x `n` checkerboard with 2x2 tiles
pub fn checkerboard(n: usize) -> Volume {
    Volume::from_fn(Shape::new([n, n, 1]), |c| {
        let value = if (c[0] / 2 + c[1] / 2) % 2 == 0 { 1.0 } else { 0.25 };
        Complex64::new(value, 0.0)
    })
}

/// Smooth object: a filled square with a gentle ramp
pub fn square_object(n: usize) -> Volume {
    Volume::from_fn(Shape::new([n, n, 1]), |c| {
        let inside = (n / 4..3 * n / 4).contains(&c[0]) && (n / 4..3 * n / 4).contains(&c[1]);
        Complex64::new(if inside { 1.0 + 0.05 * c[0] as f64 } else { 0.0 }, 0.0)
    })
}

/// Encoding of an unfolded `n` x `n` x 1 scan
pub fn encoding(n: usize) -> StackEncoding {
    let half = (n / 2) as i32;
    StackEncoding {
        recon_resolution: [n, n, 1],
        ranges: [[-half, half - 1], [-half, half - 1], [0, 0]],
        in_plane: InPlaneTransform::default(),
        ..StackEncoding::default()
    }
}

/// Labels and samples of a synthetic acquisition
#[derive(Default)]
pub struct SyntheticScan {
    pub labels: Vec<Label>,
    pub samples: Vec<Vec<Complex64>>,
}

impl SyntheticScan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every `step`-th phase-encode line of the 2-D `images`
    /// (one entry per channel along [`Axis::Channel`])
    ///
    /// Line `ky = step * m` of the full k-space is labeled `ky = m`, which is
    /// the folded numbering of an undersampled scan.
    pub fn acquire(&mut self, images: &Volume, step: usize, template: &Label) {
        let shape = images.shape();
        let [nx, ny, _] = shape.spatial();
        let nc = shape.len(Axis::Channel);
        let mut k = images.clone();
        i2k(&mut k, &[Axis::Readout, Axis::PhaseEncode]);

        let half = (ny / 2) as i32;
        for c in 0..nc {
            for j in 0..ny {
                let ky = j as i32 - half;
                if ky % step as i32 != 0 {
                    continue;
                }
                let start = c * nx * ny + j * nx;
                self.labels.push(Label {
                    ky: ky / step as i32,
                    channel: c as u16,
                    ..template.clone()
                });
                self.samples.push(k.data()[start..start + nx].to_vec());
            }
        }
    }

    /// Push one profile
    pub fn push(&mut self, label: Label, samples: Vec<Complex64>) {
        self.labels.push(label);
        self.samples.push(samples);
    }

    pub fn reader(&self) -> InMemoryReader {
        InMemoryReader::new(self.samples.clone())
    }
}

/// Multiply a k-space line by `exp(i phase(x))` in hybrid (x, ky) space
pub fn with_readout_phase(line: &[Complex64], phase: impl Fn(f64) -> f64) -> Vec<Complex64> {
    let mut hybrid = line.to_vec();
    k2i_1d(&mut hybrid);
    let center = (line.len() / 2) as f64;
    for (x, v) in hybrid.iter_mut().enumerate() {
        *v *= Complex64::from_polar(1.0, phase(x as f64 - center));
    }
    i2k_1d(&mut hybrid);
    hybrid
}
