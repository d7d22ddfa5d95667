//! Ringing filter
//!
//! Separable Hamming taper applied in k-space before the Fourier transform.
//! The taper is scaled to the sampled extent of each axis, not to the grid
//! size, so zero-filled or partially sampled axes are tapered where their
//! data actually ends.

use crate::volume::{Axis, Volume};

/// Hamming taper for one encoding axis
///
/// # Arguments
/// * `n` - Grid size along the axis (k = 0 at index `n/2`)
/// * `edge` - Fraction of the sampled half-width that is tapered
/// * `range` - Sampled encoding numbers `[min, max]`
///
/// # Returns
/// Window weights, 1 in the untapered center
pub fn hamming_window(n: usize, edge: f64, range: [i32; 2]) -> Vec<f64> {
    let half_width = range[0].unsigned_abs().max(range[1].unsigned_abs()) as f64;
    if edge <= 0.0 || half_width == 0.0 {
        return vec![1.0; n];
    }
    let edge = edge.min(1.0);
    let flat = 1.0 - edge;

    (0..n)
        .map(|i| {
            let k = i as f64 - (n / 2) as f64;
            let u = (k.abs() / half_width).min(1.0);
            if u <= flat {
                1.0
            } else {
                0.54 + 0.46 * (std::f64::consts::PI * (u - flat) / edge).cos()
            }
        })
        .collect()
}

/// Apply the separable taper along the three encoding axes in place
pub fn ringing_filter(data: &mut Volume, edges: [f64; 3], ranges: [[i32; 2]; 3]) {
    for enc in 0..3 {
        let axis = Axis::spatial(enc);
        let n = data.len(axis);
        if n <= 1 || edges[enc] <= 0.0 {
            continue;
        }
        let window = hamming_window(n, edges[enc], ranges[enc]);
        data.for_each_lane_mut(axis, |_, lane| {
            for (v, w) in lane.iter_mut().zip(window.iter()) {
                *v *= *w;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Shape;
    use num_complex::Complex64;

    #[test]
    fn test_window_shape() {
        let w = hamming_window(16, 0.25, [-8, 7]);
        assert_eq!(w.len(), 16);
        // center untouched
        assert_eq!(w[8], 1.0);
        assert_eq!(w[10], 1.0);
        // edge of the sampled range reaches the Hamming minimum
        assert!((w[0] - 0.08).abs() < 1e-12, "edge weight {}", w[0]);
        // monotone decrease towards the edge
        for i in 1..8 {
            assert!(w[i] >= w[i - 1] - 1e-15);
        }
    }

    #[test]
    fn test_window_follows_sampled_extent() {
        // only [-4, 4] sampled on a 16 grid: taper ends at |k| = 4
        let w = hamming_window(16, 0.5, [-4, 4]);
        assert!((w[4] - 0.08).abs() < 1e-12);
        assert!((w[12] - 0.08).abs() < 1e-12);
        assert_eq!(w[8], 1.0);
    }

    #[test]
    fn test_zero_edge_is_noop() {
        let shape = Shape::new([4, 4, 1]);
        let original = Volume::from_fn(shape, |c| Complex64::new(1.0 + c[0] as f64, c[1] as f64));
        let mut data = original.clone();
        ringing_filter(&mut data, [0.0; 3], [[-2, 1]; 3]);
        assert_eq!(data, original);
    }

    #[test]
    fn test_filter_is_separable() {
        let shape = Shape::new([8, 8, 1]);
        let mut data = Volume::from_fn(shape, |_| Complex64::new(1.0, 0.0));
        ringing_filter(&mut data, [0.5, 0.5, 0.5], [[-4, 3], [-4, 3], [0, 0]]);
        let wx = hamming_window(8, 0.5, [-4, 3]);
        for j in 0..8 {
            for i in 0..8 {
                let v = data.data()[i + 8 * j].re;
                assert!((v - wx[i] * wx[j]).abs() < 1e-12);
            }
        }
    }
}
