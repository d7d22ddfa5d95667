//! Single-voxel spectroscopy
//!
//! The readout of a spectroscopy acquisition is the free induction decay.
//! It is decimated by the readout oversampling factor, the channels are
//! combined with the dominant singular vector of the (time x channel)
//! matrix and the result is transformed into a spectrum.

use nalgebra::DMatrix;
use num_complex::Complex64;

use crate::error::{ReconError, Result};
use crate::fft::k2i;
use crate::reader::remove_readout_oversampling;
use crate::volume::{Axis, Volume, N_AXES};

/// Decimate every readout line by `factor`
///
/// Lines are cropped in the spectral domain, so the spectral content inside
/// the reduced bandwidth is kept unchanged.
pub fn downsample_readout(data: &Volume, factor: f64) -> Result<Volume> {
    let shape = data.shape();
    let n = shape.len(Axis::Readout);
    if factor <= 1.0 || n <= 1 {
        return Ok(data.clone());
    }
    let lines: Vec<Complex64> = data
        .data()
        .chunks(n)
        .flat_map(|line| remove_readout_oversampling(line, factor))
        .collect();
    let m = lines.len() / (shape.total() / n).max(1);
    Volume::from_vec(shape.with(Axis::Readout, m), lines)
}

/// Combine channels with the dominant singular vector
///
/// Per combination of the non-readout axes the samples form a matrix `M`
/// (readout x channel). The combined signal is `M v1` where `v1` is the
/// right singular vector of the largest singular value, phased so that the
/// first sample is real and positive.
pub fn svd_coil_combine(data: &Volume) -> Result<Volume> {
    let shape = data.shape();
    let ns = shape.len(Axis::Readout);
    let nc = shape.len(Axis::Channel);
    let channel_stride = shape.stride(Axis::Channel);
    let out_shape = shape.with(Axis::Channel, 1);
    let mut out = Volume::zeros(out_shape);

    for line in 0..out_shape.total() / ns.max(1) {
        let coords: [usize; N_AXES] = out_shape.coords(line * ns);
        let start = shape.offset(&coords);
        let m = DMatrix::from_fn(ns, nc, |t, c| data.data()[start + t + c * channel_stride]);

        let svd = m.clone().svd(false, true);
        let v_t = svd
            .v_t
            .ok_or_else(|| ReconError::InvalidParameter("singular value decomposition failed".to_string()))?;
        let dominant = svd
            .singular_values
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |best, (i, &s)| if s > best.1 { (i, s) } else { best })
            .0;
        let weights = v_t.row(dominant).adjoint();
        let combined = &m * &weights;

        let first = combined[0];
        let phase = if first.norm() > 0.0 { first.conj() / first.norm() } else { Complex64::new(1.0, 0.0) };
        let dst_start = out_shape.offset(&coords);
        for (t, v) in combined.iter().enumerate() {
            out.data_mut()[dst_start + t] = v * phase;
        }
    }
    Ok(out)
}

/// Spectrum of a single-voxel acquisition
///
/// # Arguments
/// * `fid` - Assembled time-domain data, one line per channel
/// * `readout_oversampling` - Factor by which the readout is decimated
pub fn spectro_recon(fid: &Volume, readout_oversampling: f64) -> Result<Volume> {
    let decimated = downsample_readout(fid, readout_oversampling)?;
    let mut combined = if decimated.len(Axis::Channel) > 1 {
        svd_coil_combine(&decimated)?
    } else {
        decimated
    };
    k2i(&mut combined, &[Axis::Readout]);
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Shape;

    fn fid(ns: usize, gains: &[Complex64]) -> Volume {
        let shape = Shape::new([ns, 1, 1]).with(Axis::Channel, gains.len());
        Volume::from_fn(shape, |c| {
            let t = c[0] as f64;
            let signal = Complex64::from_polar((-t / 20.0).exp(), 2.0 * std::f64::consts::PI * 0.125 * t);
            signal * gains[c[Axis::Channel.index()]]
        })
    }

    #[test]
    fn test_downsample_halves_readout() {
        let data = fid(64, &[Complex64::new(1.0, 0.0)]);
        let out = downsample_readout(&data, 2.0).unwrap();
        assert_eq!(out.len(Axis::Readout), 32);
        assert_eq!(downsample_readout(&data, 1.0).unwrap(), data);
    }

    #[test]
    fn test_svd_combine_recovers_common_signal() {
        let gains = [Complex64::new(1.0, 0.0), Complex64::from_polar(0.5, 1.2), Complex64::from_polar(2.0, -0.4)];
        let data = fid(32, &gains);
        let combined = svd_coil_combine(&data).unwrap();
        assert_eq!(combined.len(Axis::Channel), 1);

        // rank-one data: the combination is the signal scaled by the gain norm
        let gain_norm = gains.iter().map(|g| g.norm_sqr()).sum::<f64>().sqrt();
        let reference = fid(32, &[Complex64::new(gain_norm, 0.0)]);
        for (a, b) in combined.data().iter().zip(reference.data().iter()) {
            assert!((a - b).norm() < 1e-9, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_spectrum_peak_position() {
        let data = fid(64, &[Complex64::new(1.0, 0.0), Complex64::new(0.0, 1.0)]);
        let spectrum = spectro_recon(&data, 1.0).unwrap();
        let magnitude = spectrum.magnitude();
        let peak = magnitude
            .iter()
            .enumerate()
            .fold((0, 0.0), |best, (i, &m)| if m > best.1 { (i, m) } else { best })
            .0;
        // 0.125 cycles per sample, 8 bins from the center of 64
        assert_eq!(peak, 32 - 8);
    }
}
