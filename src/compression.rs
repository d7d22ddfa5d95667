//! Coil array compression
//!
//! A channel-reduction matrix is derived once from the surface-coil
//! reference images: the eigenvectors of the coil Gram matrix, sorted by
//! decreasing eigenvalue, form a unitary basis in which the first rows
//! carry most of the signal. Keeping the first `k` rows gives `k` virtual
//! coils. With `k` equal to the physical coil count the transform is
//! unitary and compression followed by expansion is lossless.

use nalgebra::DMatrix;
use num_complex::Complex64;
use std::collections::HashMap;

use crate::error::{ReconError, Result};
use crate::labels::{Label, LabelType, RawProfile};
use crate::volume::{Axis, Volume};

/// Virtual-coils × physical-coils projection
#[derive(Clone, Debug, PartialEq)]
pub struct CompressionMatrix {
    matrix: DMatrix<Complex64>,
    /// Physical channel id of every column
    channel_ids: Vec<u16>,
    /// Eigenvalue of every row, descending
    eigenvalues: Vec<f64>,
}

impl CompressionMatrix {
    /// Derive the projection from reference coil images
    ///
    /// # Arguments
    /// * `coil_images` - Surface-coil images, one entry per physical channel
    ///   along [`Axis::Channel`]
    /// * `channel_ids` - Channel id of every index along [`Axis::Channel`]
    /// * `virtual_coils` - Number of rows to keep
    pub fn from_coil_images(coil_images: &Volume, channel_ids: &[u16], virtual_coils: usize) -> Result<Self> {
        let nc = coil_images.len(Axis::Channel);
        if channel_ids.len() != nc {
            return Err(ReconError::ShapeMismatch(format!(
                "{} channel ids for {} channels",
                channel_ids.len(),
                nc
            )));
        }
        if virtual_coils == 0 || virtual_coils > nc {
            return Err(ReconError::InvalidParameter(format!(
                "{} virtual coils for {} physical coils",
                virtual_coils, nc
            )));
        }

        let gram = coil_gram(coil_images);
        let eigen = gram.symmetric_eigen();
        let mut order: Vec<usize> = (0..nc).collect();
        order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

        let mut matrix = DMatrix::<Complex64>::zeros(virtual_coils, nc);
        let mut eigenvalues = Vec::with_capacity(virtual_coils);
        for (row, &col) in order.iter().take(virtual_coils).enumerate() {
            for c in 0..nc {
                matrix[(row, c)] = eigen.eigenvectors[(c, col)].conj();
            }
            eigenvalues.push(eigen.eigenvalues[col]);
        }

        log::info!(
            "array compression: {} physical -> {} virtual coils ({:.1}% of signal energy kept)",
            nc,
            virtual_coils,
            100.0 * eigenvalues.iter().sum::<f64>() / eigen.eigenvalues.iter().sum::<f64>().max(f64::MIN_POSITIVE)
        );

        Ok(Self { matrix, channel_ids: channel_ids.to_vec(), eigenvalues })
    }

    pub fn virtual_coils(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn physical_coils(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn channel_ids(&self) -> &[u16] {
        &self.channel_ids
    }

    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    pub fn matrix(&self) -> &DMatrix<Complex64> {
        &self.matrix
    }

    /// Project a volume onto the virtual coils
    pub fn compress(&self, data: &Volume) -> Result<Volume> {
        apply_channel_matrix(data, &self.matrix)
    }

    /// Map virtual-coil data back onto the physical coils
    pub fn expand(&self, data: &Volume) -> Result<Volume> {
        apply_channel_matrix(data, &self.matrix.adjoint())
    }

    /// Compressed sensitivities `A s` and noise covariance `A Ψ Aᴴ`
    pub fn compress_sensitivities(&self, sensitivity: &Volume, psi: &DMatrix<Complex64>) -> Result<(Volume, DMatrix<Complex64>)> {
        if psi.nrows() != self.physical_coils() || psi.ncols() != self.physical_coils() {
            return Err(ReconError::ShapeMismatch(format!(
                "noise covariance {}x{} for {} coils",
                psi.nrows(),
                psi.ncols(),
                self.physical_coils()
            )));
        }
        let s = self.compress(sensitivity)?;
        let psi = &self.matrix * psi * self.matrix.adjoint();
        Ok((s, psi))
    }

    /// Compress raw profiles that were read for all physical channels
    ///
    /// Profiles are grouped by their label (ignoring the channel). Repeated
    /// acquisitions with identical labels are paired across channels in the
    /// order they were read, so each one yields its own set of virtual-coil
    /// profiles, labeled with the virtual coil index as channel. Groups in
    /// which the channels were read a different number of times are
    /// rejected.
    pub fn compress_profiles(&self, profiles: &[RawProfile]) -> Result<Vec<RawProfile>> {
        let nc = self.physical_coils();
        let mut index: HashMap<ProfileKey, usize> = HashMap::new();
        let mut groups: Vec<(Label, Vec<Vec<&RawProfile>>)> = Vec::new();

        for p in profiles {
            let column = self
                .channel_ids
                .iter()
                .position(|&id| id == p.label.channel)
                .ok_or_else(|| ReconError::ShapeMismatch(format!("channel {} is not part of the coil array", p.label.channel)))?;
            let key = ProfileKey::of(&p.label);
            let g = *index.entry(key).or_insert_with(|| {
                groups.push((p.label.clone(), vec![Vec::new(); nc]));
                groups.len() - 1
            });
            groups[g].1[column].push(p);
        }

        let mut out = Vec::with_capacity(profiles.len() / nc.max(1) * self.virtual_coils());
        for (label, columns) in groups {
            let repeats = columns[0].len();
            if columns.iter().any(|c| c.len() != repeats) {
                return Err(ReconError::ShapeMismatch(format!(
                    "incomplete coil set for profile ky={} kz={}",
                    label.ky, label.kz
                )));
            }
            for r in 0..repeats {
                let n = columns[0][r].samples.len();
                for v in 0..self.virtual_coils() {
                    let mut samples = vec![Complex64::new(0.0, 0.0); n];
                    for (c, column) in columns.iter().enumerate() {
                        let a = self.matrix[(v, c)];
                        for (s, &x) in samples.iter_mut().zip(column[r].samples.iter()) {
                            *s += a * x;
                        }
                    }
                    let mut l = label.clone();
                    l.channel = v as u16;
                    out.push(RawProfile::new(l, samples));
                }
            }
        }
        Ok(out)
    }
}

/// Label fields that identify one acquisition apart from its channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ProfileKey {
    typ: LabelType,
    ints: [i64; 12],
    trigger_time: u64,
}

impl ProfileKey {
    fn of(l: &Label) -> Self {
        Self {
            typ: l.typ,
            ints: [
                l.mix as i64,
                l.stack as i64,
                l.dynamic as i64,
                l.cardiac_phase as i64,
                l.echo as i64,
                l.location as i64,
                l.flow_segment as i64,
                l.ky as i64,
                l.kz as i64,
                l.grad as i64,
                l.sign as i64,
                l.average as i64,
            ],
            trigger_time: l.trigger_time.to_bits(),
        }
    }
}

/// Σ_v x_v x_vᴴ over all voxels, x_v = channel vector at voxel v
fn coil_gram(data: &Volume) -> DMatrix<Complex64> {
    let nc = data.len(Axis::Channel);
    let stride = data.shape().stride(Axis::Channel);
    let outer = data.shape().total() / (nc * stride).max(1);
    let values = data.data();

    let mut gram = DMatrix::<Complex64>::zeros(nc, nc);
    let mut x = vec![Complex64::new(0.0, 0.0); nc];
    for o in 0..outer {
        for inner in 0..stride {
            let start = o * nc * stride + inner;
            for (c, xc) in x.iter_mut().enumerate() {
                *xc = values[start + c * stride];
            }
            for i in 0..nc {
                for j in 0..nc {
                    gram[(i, j)] += x[i] * x[j].conj();
                }
            }
        }
    }
    gram
}

/// Left-multiply the channel vector of every voxel by `matrix`
pub fn apply_channel_matrix(data: &Volume, matrix: &DMatrix<Complex64>) -> Result<Volume> {
    let nc = data.len(Axis::Channel);
    if matrix.ncols() != nc {
        return Err(ReconError::ShapeMismatch(format!(
            "{}x{} channel matrix for {} channels",
            matrix.nrows(),
            matrix.ncols(),
            nc
        )));
    }
    let rows = matrix.nrows();
    let stride = data.shape().stride(Axis::Channel);
    let outer = data.shape().total() / (nc * stride).max(1);

    let mut out = Volume::zeros(data.shape().with(Axis::Channel, rows));
    let src = data.data();
    let dst = out.data_mut();
    for o in 0..outer {
        for inner in 0..stride {
            let in_start = o * nc * stride + inner;
            let out_start = o * rows * stride + inner;
            for r in 0..rows {
                let mut acc = Complex64::new(0.0, 0.0);
                for c in 0..nc {
                    acc += matrix[(r, c)] * src[in_start + c * stride];
                }
                dst[out_start + r * stride] = acc;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Shape;

    fn coil_images() -> Volume {
        let shape = Shape::new([4, 4, 1]).with(Axis::Channel, 3);
        Volume::from_fn(shape, |c| {
            let (x, y, ch) = (c[0] as f64, c[1] as f64, c[3] as f64);
            Complex64::new(1.0 + x * (ch + 1.0), y - ch) + Complex64::new(0.0, 0.3 * x * y)
        })
    }

    #[test]
    fn test_full_compression_is_lossless() {
        let coil = coil_images();
        let a = CompressionMatrix::from_coil_images(&coil, &[0, 1, 2], 3).unwrap();
        let back = a.expand(&a.compress(&coil).unwrap()).unwrap();
        for (x, y) in coil.data().iter().zip(back.data().iter()) {
            assert!((x - y).norm() < 1e-9, "expected {}, got {}", x, y);
        }
    }

    #[test]
    fn test_eigenvalues_descending() {
        let a = CompressionMatrix::from_coil_images(&coil_images(), &[0, 1, 2], 2).unwrap();
        assert_eq!(a.virtual_coils(), 2);
        assert_eq!(a.physical_coils(), 3);
        assert!(a.eigenvalues()[0] >= a.eigenvalues()[1]);
    }

    #[test]
    fn test_rank_one_array_compresses_to_one_coil() {
        // all coils see the same image up to a complex weight
        let weights = [Complex64::new(1.0, 0.0), Complex64::new(0.0, 2.0), Complex64::new(-1.0, 1.0)];
        let shape = Shape::new([3, 3, 1]).with(Axis::Channel, 3);
        let coil = Volume::from_fn(shape, |c| weights[c[3]] * (1.0 + c[0] as f64 * 0.5 + c[1] as f64));
        let a = CompressionMatrix::from_coil_images(&coil, &[0, 1, 2], 1).unwrap();
        let back = a.expand(&a.compress(&coil).unwrap()).unwrap();
        for (x, y) in coil.data().iter().zip(back.data().iter()) {
            assert!((x - y).norm() < 1e-9);
        }
    }

    #[test]
    fn test_compress_profiles_matches_volume_compression() {
        let coil = coil_images();
        let a = CompressionMatrix::from_coil_images(&coil, &[4, 5, 6], 2).unwrap();
        let profiles: Vec<RawProfile> = (0..3)
            .map(|c| {
                let label = Label { channel: 4 + c as u16, ky: 1, ..Label::default() };
                RawProfile::new(label, vec![Complex64::new(c as f64 + 1.0, 0.5); 2])
            })
            .collect();
        let compressed = a.compress_profiles(&profiles).unwrap();
        assert_eq!(compressed.len(), 2);
        assert_eq!(compressed[1].label.channel, 1);
        assert_eq!(compressed[1].label.ky, 1);

        let expected: Complex64 = (0..3).map(|c| a.matrix()[(1, c)] * Complex64::new(c as f64 + 1.0, 0.5)).sum();
        assert!((compressed[1].samples[0] - expected).norm() < 1e-12);
    }

    #[test]
    fn test_incomplete_coil_set_is_rejected() {
        let a = CompressionMatrix::from_coil_images(&coil_images(), &[0, 1, 2], 2).unwrap();
        let profiles = vec![RawProfile::new(Label::default(), vec![Complex64::new(1.0, 0.0)])];
        assert!(a.compress_profiles(&profiles).is_err());
    }

    #[test]
    fn test_duplicate_acquisitions_survive_compression() {
        use crate::assembly::{assemble, AssemblyOptions};

        let coil = coil_images();
        let a = CompressionMatrix::from_coil_images(&coil, &[0, 1, 2], 3).unwrap();
        // two acquisitions of the same line with identical labels
        let mut profiles = Vec::new();
        for repeat in 0..2 {
            for c in 0..3u16 {
                let label = Label { channel: c, ky: 0, ..Label::default() };
                let value = Complex64::new(2.0 + 2.0 * repeat as f64 + c as f64, -0.5 * repeat as f64);
                profiles.push(RawProfile::new(label, vec![value; 4]));
            }
        }
        let compressed = a.compress_profiles(&profiles).unwrap();
        assert_eq!(compressed.len(), 6);

        let options = AssemblyOptions::new([4, 1, 1]);
        let plain = assemble(&profiles, &options).unwrap();
        let virtual_coils = assemble(&compressed, &options).unwrap();
        assert!(virtual_coils.counts.iter().all(|&n| n == 2));
        let restored = a.expand(&virtual_coils.data).unwrap();
        for (x, y) in plain.data.data().iter().zip(restored.data().iter()) {
            assert!((x - y).norm() < 1e-9, "expected {}, got {}", x, y);
        }
        // mean of the two acquisitions of channel 0
        assert!((plain.data.data()[0] - Complex64::new(3.0, -0.25)).norm() < 1e-12);
    }

    #[test]
    fn test_uneven_repeats_are_rejected() {
        let a = CompressionMatrix::from_coil_images(&coil_images(), &[0, 1, 2], 2).unwrap();
        let mut profiles: Vec<RawProfile> = (0..3u16)
            .map(|c| RawProfile::new(Label { channel: c, ..Label::default() }, vec![Complex64::new(1.0, 0.0)]))
            .collect();
        profiles.push(RawProfile::new(Label::default(), vec![Complex64::new(2.0, 0.0)]));
        assert!(a.compress_profiles(&profiles).is_err());
    }

    #[test]
    fn test_invalid_virtual_coil_count() {
        assert!(CompressionMatrix::from_coil_images(&coil_images(), &[0, 1, 2], 0).is_err());
        assert!(CompressionMatrix::from_coil_images(&coil_images(), &[0, 1, 2], 4).is_err());
    }
}
