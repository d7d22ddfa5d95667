//! Reference scan processing
//!
//! Body-coil and surface-coil images from the reference scan give the coil
//! sensitivities (`coil / body` where the body coil sees signal), noise
//! profiles give Ψ. Maps are resampled onto the grid of the scan that is
//! unfolded, with both fields of view centered on each other.

use nalgebra::DMatrix;
use num_complex::Complex64;
use std::path::{Path, PathBuf};

use crate::assembly::{assemble, AssemblyOptions};
use crate::compression::CompressionMatrix;
use crate::error::{ReconError, Result};
use crate::fft::k2i;
use crate::geometry::{crop_oversampling, trilinear};
use crate::labels::{Label, LabelType, RawProfile, SelectionCriteria};
use crate::params::ScanParameters;
use crate::reader::SampleReader;
use crate::volume::{Axis, Volume};

/// Reconstructed reference scan
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceImages {
    /// Body-coil image, channel length 1
    pub body: Volume,
    /// Surface-coil images, one per channel
    pub coil: Volume,
    /// Channel id of every surface-coil image
    pub channel_ids: Vec<u16>,
    /// Noise covariance of the surface coils
    pub psi: DMatrix<Complex64>,
    pub voxel_sizes: [f64; 3],
}

/// Sensitivities on the grid of a target scan
#[derive(Clone, Debug, PartialEq)]
pub struct SensitivityMaps {
    pub sensitivity: Volume,
    pub psi: DMatrix<Complex64>,
    pub body: Volume,
    pub coil: Volume,
}

impl SensitivityMaps {
    pub fn channels(&self) -> usize {
        self.sensitivity.len(Axis::Channel)
    }

    /// Sensitivities, Ψ and coil images in virtual-coil space
    pub fn compress(&self, matrix: &CompressionMatrix) -> Result<SensitivityMaps> {
        let (sensitivity, psi) = matrix.compress_sensitivities(&self.sensitivity, &self.psi)?;
        Ok(SensitivityMaps {
            sensitivity,
            psi,
            body: self.body.clone(),
            coil: matrix.compress(&self.coil)?,
        })
    }
}

/// Locate the reference scan next to the target scan
///
/// # Errors
/// [`ReconError::ReferenceScanMissing`] with the resolved path when the file
/// does not exist
pub fn resolve_reference_scan(folder: &Path, file_name: &str) -> Result<PathBuf> {
    let path = folder.join(file_name);
    if !path.exists() {
        return Err(ReconError::ReferenceScanMissing(path));
    }
    Ok(path)
}

/// Noise covariance from noise-only profiles
///
/// `Ψ_ij = mean(n_i n_j*)`, scaled to unit mean diagonal. Without noise
/// profiles Ψ is the identity.
pub fn noise_covariance(noise: &[RawProfile], channel_ids: &[u16]) -> Result<DMatrix<Complex64>> {
    let nc = channel_ids.len();
    if noise.is_empty() {
        return Ok(DMatrix::identity(nc, nc));
    }

    let mut per_channel: Vec<Vec<Complex64>> = vec![Vec::new(); nc];
    for p in noise {
        if let Some(c) = channel_ids.iter().position(|&id| id == p.label.channel) {
            per_channel[c].extend_from_slice(&p.samples);
        }
    }
    let n = per_channel[0].len();
    if n == 0 || per_channel.iter().any(|s| s.len() != n) {
        return Err(ReconError::ShapeMismatch(
            "noise samples are not available for every channel".to_string(),
        ));
    }

    let mut psi = DMatrix::<Complex64>::zeros(nc, nc);
    for i in 0..nc {
        for j in 0..=i {
            let sum: Complex64 = per_channel[i]
                .iter()
                .zip(per_channel[j].iter())
                .map(|(a, b)| a * b.conj())
                .sum();
            let v = sum / n as f64;
            psi[(i, j)] = v;
            psi[(j, i)] = v.conj();
        }
    }

    let mean_diag = (0..nc).map(|i| psi[(i, i)].re).sum::<f64>() / nc as f64;
    if mean_diag <= 0.0 {
        return Ok(DMatrix::identity(nc, nc));
    }
    Ok(psi / Complex64::new(mean_diag, 0.0))
}

/// Coil sensitivities `coil / body`
///
/// Voxels where the body coil magnitude is not above `threshold` times its
/// maximum get zero sensitivity.
pub fn compute_sensitivities(body: &Volume, coil: &Volume, threshold: f64) -> Result<Volume> {
    if body.shape() != coil.shape().with(Axis::Channel, 1) {
        return Err(ReconError::ShapeMismatch(format!(
            "body image {:?} does not match coil images {:?}",
            body.shape().dims(),
            coil.shape().dims()
        )));
    }
    let limit = threshold * body.max_abs();
    let nc = coil.len(Axis::Channel);
    let stride = coil.shape().stride(Axis::Channel);
    let outer = coil.shape().total() / (nc * stride).max(1);

    let mut out = Volume::zeros(coil.shape());
    let b = body.data();
    let c = coil.data();
    let dst = out.data_mut();
    for o in 0..outer {
        for inner in 0..stride {
            let reference = b[o * stride + inner];
            if reference.norm() <= limit || reference.norm() == 0.0 {
                continue;
            }
            for ch in 0..nc {
                let i = o * nc * stride + ch * stride + inner;
                dst[i] = c[i] / reference;
            }
        }
    }
    Ok(out)
}

/// Trilinear resampling of a volume onto another grid with the same center
///
/// # Arguments
/// * `data` - Source volume
/// * `source_voxels` - Source voxel sizes in mm
/// * `target_size` - Target grid size
/// * `target_voxels` - Target voxel sizes in mm
pub fn resample(data: &Volume, source_voxels: [f64; 3], target_size: [usize; 3], target_voxels: [f64; 3]) -> Volume {
    let sdims = data.shape().spatial();
    if sdims == target_size && source_voxels == target_voxels {
        return data.clone();
    }

    let mut positions = Vec::with_capacity(target_size.iter().product());
    for k in 0..target_size[2] {
        for j in 0..target_size[1] {
            for i in 0..target_size[0] {
                let t = [i, j, k];
                let mut p = [0.0; 3];
                for a in 0..3 {
                    let mm = (t[a] as f64 - (target_size[a] / 2) as f64) * target_voxels[a];
                    let vs = if source_voxels[a] > 0.0 { source_voxels[a] } else { 1.0 };
                    p[a] = mm / vs + (sdims[a] / 2) as f64;
                }
                positions.push(p);
            }
        }
    }

    let mut shape = data.shape();
    for (enc, &n) in target_size.iter().enumerate() {
        shape = shape.with(Axis::spatial(enc), n);
    }
    let n_src = data.shape().spatial_len();
    let n_dst = shape.spatial_len();
    let n_blocks = shape.total() / n_dst.max(1);

    let mut out = Volume::zeros(shape);
    for b in 0..n_blocks {
        let src = &data.data()[b * n_src..(b + 1) * n_src];
        let dst = &mut out.data_mut()[b * n_dst..(b + 1) * n_dst];
        for (v, d) in dst.iter_mut().enumerate() {
            *d = trilinear(src, sdims, positions[v]);
        }
    }
    out
}

impl ReferenceImages {
    /// Sensitivity maps on the grid of a target scan
    ///
    /// # Arguments
    /// * `target_size` - Full-FOV grid size of the target
    /// * `target_voxels` - Voxel sizes of the target in mm
    /// * `threshold` - Body-coil threshold as a fraction of its maximum
    pub fn sensitivities(&self, target_size: [usize; 3], target_voxels: [f64; 3], threshold: f64) -> Result<SensitivityMaps> {
        let body = resample(&self.body, self.voxel_sizes, target_size, target_voxels);
        let coil = resample(&self.coil, self.voxel_sizes, target_size, target_voxels);
        let sensitivity = compute_sensitivities(&body, &coil, threshold)?;
        Ok(SensitivityMaps { sensitivity, psi: self.psi.clone(), body, coil })
    }

    /// Build reference images directly from body and surface-coil images
    pub fn from_images(body: Volume, coil: Volume, channel_ids: Vec<u16>, voxel_sizes: [f64; 3]) -> Result<Self> {
        if channel_ids.len() != coil.len(Axis::Channel) {
            return Err(ReconError::ShapeMismatch(format!(
                "{} channel ids for {} coil images",
                channel_ids.len(),
                coil.len(Axis::Channel)
            )));
        }
        let nc = channel_ids.len();
        Ok(Self { body, coil, channel_ids, psi: DMatrix::identity(nc, nc), voxel_sizes })
    }
}

/// Reconstruct the reference scan
///
/// Profiles of mix 0, stack 0 are assembled, transformed and cropped.
/// Channels listed in `body_coil_channels` of the scan parameters form the
/// body-coil image (root sum of squares when there are several); the rest
/// are the surface coils. Without body-coil channels the root sum of
/// squares of the surface coils stands in for the body coil.
pub fn reconstruct_reference(reader: &dyn SampleReader, labels: &[Label], params: &ScanParameters) -> Result<ReferenceImages> {
    let enc = params.encoding(0, 0)?;
    let criteria = SelectionCriteria::for_iteration(0, 0);
    let profiles = reader.read(&criteria, labels)?;

    let (body_profiles, coil_profiles): (Vec<RawProfile>, Vec<RawProfile>) = profiles
        .into_iter()
        .partition(|p| params.body_coil_channels.contains(&p.label.channel));
    if coil_profiles.is_empty() {
        return Err(ReconError::NoData("reference scan has no surface-coil profiles".to_string()));
    }

    let size = enc.recon_resolution([false, true, true], false);
    let crop = [(Axis::PhaseEncode, enc.oversampling[1]), (Axis::Partition, enc.oversampling[2])];
    let image = |profiles: &[RawProfile]| -> Result<(Volume, Vec<u16>)> {
        let options = AssemblyOptions::new(size).with_readout_range(enc.range(0, false));
        let kspace = assemble(profiles, &options)?;
        let ids = kspace.values(Axis::Channel).iter().map(|&c| c as u16).collect();
        let mut data = kspace.data;
        k2i(&mut data, &Axis::SPATIAL);
        Ok((crop_oversampling(&data, &crop), ids))
    };

    let (coil, channel_ids) = image(&coil_profiles)?;
    let body = if body_profiles.is_empty() {
        coil.sum_of_squares(Axis::Channel)
    } else {
        let (body, _) = image(&body_profiles)?;
        if body.len(Axis::Channel) == 1 { body } else { body.sum_of_squares(Axis::Channel) }
    };

    let noise_criteria = SelectionCriteria::default().with_type(LabelType::Noise);
    let psi = match reader.read(&noise_criteria, labels) {
        Ok(noise) => noise_covariance(&noise, &channel_ids)?,
        Err(ReconError::NoData(_)) => DMatrix::identity(channel_ids.len(), channel_ids.len()),
        Err(e) => return Err(e),
    };

    log::info!(
        "reference scan: {} surface coils, grid {:?}",
        channel_ids.len(),
        coil.shape().spatial()
    );
    Ok(ReferenceImages { body, coil, channel_ids, psi, voxel_sizes: enc.voxel_sizes })
}
