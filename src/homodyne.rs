//! Partial-Fourier (homodyne) reconstruction
//!
//! For every encoding axis with asymmetric k-space coverage:
//!
//! 1. Low-resolution phase from the Hamming-windowed symmetric center
//! 2. Phase-corrected image, transformed back to k-space
//! 3. Unsampled samples whose mirror `-k` was sampled are replaced by the
//!    conjugate of the mirror (Hermitian symmetry of a real image)
//! 4. Inverse transform and re-application of the low-resolution phase
//!
//! Axes are processed one after another on image-space data. Fully
//! sampled axes are left untouched.

use num_complex::Complex64;
use std::f64::consts::PI;

use crate::fft::LineFft;
use crate::volume::{Axis, Volume};

/// True when the sampled range `[min, max]` is noticeably asymmetric
#[inline]
pub fn is_partial_fourier(range: [i32; 2]) -> bool {
    (range[0] + range[1]).abs() > 1
}

/// Homodyne reconstruction of image-space data
///
/// # Arguments
/// * `image` - Image-space volume (after the Fourier transform)
/// * `ranges` - Sampled encoding numbers `[min, max]` per encoding axis
///
/// # Returns
/// Volume of the same shape with the missing k-space half synthesized
pub fn homodyne(image: &Volume, ranges: [[i32; 2]; 3]) -> Volume {
    let mut out = image.clone();
    for (enc, &range) in ranges.iter().enumerate() {
        let axis = Axis::spatial(enc);
        if !is_partial_fourier(range) || out.len(axis) <= 1 {
            continue;
        }
        log::debug!("homodyne along {:?}, sampled range {:?}", axis, range);
        homodyne_axis(&mut out, axis, range);
    }
    out
}

fn homodyne_axis(data: &mut Volume, axis: Axis, range: [i32; 2]) {
    let n = data.len(axis);
    let center = (n / 2) as i64;
    let (kmin, kmax) = (range[0] as i64, range[1] as i64);
    let half = kmin.abs().min(kmax.abs());

    // Hamming window over the symmetric center [-half, half]
    let window: Vec<f64> = (0..n)
        .map(|i| {
            let k = i as i64 - center;
            if k.abs() > half {
                0.0
            } else {
                0.54 + 0.46 * (PI * k as f64 / (half + 1) as f64).cos()
            }
        })
        .collect();
    let sampled = |k: i64| k >= kmin && k <= kmax;

    let mut fft = LineFft::new(n);
    let mut low = vec![Complex64::new(0.0, 0.0); n];
    let mut kc = vec![Complex64::new(0.0, 0.0); n];

    data.for_each_lane_mut(axis, |_, lane| {
        // low-resolution phase
        low.copy_from_slice(lane);
        fft.i2k(&mut low);
        for (v, w) in low.iter_mut().zip(window.iter()) {
            *v *= *w;
        }
        fft.k2i(&mut low);
        let phase: Vec<Complex64> = low
            .iter()
            .map(|v| if v.norm() > 0.0 { v / v.norm() } else { Complex64::new(1.0, 0.0) })
            .collect();

        // phase-corrected k-space
        for ((c, v), p) in kc.iter_mut().zip(lane.iter()).zip(phase.iter()) {
            *c = v * p.conj();
        }
        fft.i2k(&mut kc);

        for i in 0..n {
            let k = i as i64 - center;
            let mirror = center - k;
            if !sampled(k) && sampled(-k) && mirror >= 0 && mirror < n as i64 {
                kc[i] = kc[mirror as usize].conj();
            }
        }

        fft.k2i(&mut kc);
        for ((v, c), p) in lane.iter_mut().zip(kc.iter()).zip(phase.iter()) {
            *v = c * p;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fft::{i2k, k2i};
    use crate::volume::Shape;

    fn object(n: usize) -> Volume {
        // smooth real object with a constant phase offset
        let phase = Complex64::from_polar(1.0, 0.7);
        Volume::from_fn(Shape::new([n, 4, 1]), |c| {
            let x = c[0] as f64 - (n / 2) as f64;
            let amp = if x.abs() < n as f64 / 4.0 { 1.0 + 0.5 * (x / n as f64).cos() } else { 0.0 };
            phase * amp * (1.0 + c[1] as f64)
        })
    }

    fn truncate(image: &Volume, range: [i32; 2]) -> Volume {
        let mut k = image.clone();
        i2k(&mut k, &[Axis::Readout]);
        let n = k.len(Axis::Readout) as i64;
        k.for_each_lane_mut(Axis::Readout, |_, lane| {
            for (i, v) in lane.iter_mut().enumerate() {
                let kx = i as i64 - n / 2;
                if kx < range[0] as i64 || kx > range[1] as i64 {
                    *v = Complex64::new(0.0, 0.0);
                }
            }
        });
        k2i(&mut k, &[Axis::Readout]);
        k
    }

    fn error(a: &Volume, b: &Volume) -> f64 {
        a.data().iter().zip(b.data().iter()).map(|(x, y)| (x - y).norm_sqr()).sum::<f64>().sqrt()
    }

    #[test]
    fn test_partial_fourier_detection() {
        assert!(!is_partial_fourier([-16, 15]));
        assert!(!is_partial_fourier([-16, 16]));
        assert!(is_partial_fourier([-10, 15]));
        assert!(!is_partial_fourier([0, 0]));
    }

    #[test]
    fn test_full_sampling_is_noop() {
        let image = object(32);
        let out = homodyne(&image, [[-16, 15], [-2, 1], [0, 0]]);
        assert_eq!(out, image);
    }

    #[test]
    fn test_homodyne_improves_on_zero_filling() {
        let truth = object(32);
        let range = [-8, 15];
        let zero_filled = truncate(&truth, range);
        let recon = homodyne(&zero_filled, [range, [-2, 1], [0, 0]]);

        let before = error(&zero_filled, &truth);
        let after = error(&recon, &truth);
        assert!(after < 0.5 * before, "homodyne error {} should be well below zero-fill error {}", after, before);
    }

    #[test]
    fn test_homodyne_keeps_phase() {
        let truth = object(32);
        let range = [-8, 15];
        let recon = homodyne(&truncate(&truth, range), [range, [-2, 1], [0, 0]]);
        // inside the object the phase stays at the true constant
        let i = 16 + 2 * 32;
        assert!((recon.data()[i].arg() - 0.7).abs() < 0.05, "phase {}", recon.data()[i].arg());
    }
}
