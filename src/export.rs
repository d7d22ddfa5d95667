//! Named reconstruction outputs and NIfTI export
//!
//! Every recipe returns a [`ReconOutputs`] map (`data_{mix}_{stack}`,
//! `sensitivity_…`, `coil_ref_…`, `body_ref_…`). The writer stores the
//! magnitude as float32 NIfTI-1; axes beyond the three spatial ones are
//! flattened into a fourth dimension.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{ReconError, Result};
use crate::volume::Volume;

/// One exported array with its voxel sizes in mm
#[derive(Clone, Debug, PartialEq)]
pub struct OutputArray {
    pub data: Volume,
    pub voxel_sizes: [f64; 3],
}

/// Named output arrays of a reconstruction, sorted by name
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconOutputs {
    arrays: BTreeMap<String, OutputArray>,
}

impl ReconOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, data: Volume, voxel_sizes: [f64; 3]) {
        self.arrays.insert(name.into(), OutputArray { data, voxel_sizes });
    }

    pub fn get(&self, name: &str) -> Option<&Volume> {
        self.arrays.get(name).map(|a| &a.data)
    }

    pub fn array(&self, name: &str) -> Option<&OutputArray> {
        self.arrays.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.arrays.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OutputArray)> {
        self.arrays.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Move all arrays of `other` into `self`
    pub fn merge(&mut self, other: ReconOutputs) {
        self.arrays.extend(other.arrays);
    }
}

/// Output name of one (mix, stack) iteration
pub fn output_name(kind: &str, mix: u16, stack: u16) -> String {
    format!("{}_{}_{}", kind, mix, stack)
}

/// NIfTI dimensions: the spatial axes plus all others flattened
fn nifti_dims(volume: &Volume) -> Result<[i16; 8]> {
    let shape = volume.shape();
    let [nx, ny, nz] = shape.spatial();
    let nt = shape.total() / shape.spatial_len().max(1);
    let rank = if nt > 1 { 4 } else { 3 };
    let mut dim = [rank as i16, 1, 1, 1, 1, 1, 1, 1];
    for (d, &n) in dim[1..5].iter_mut().zip([nx, ny, nz, nt].iter()) {
        *d = i16::try_from(n).map_err(|_| ReconError::InvalidParameter(format!("dimension {} too large for NIfTI-1", n)))?;
    }
    Ok(dim)
}

/// Encode the magnitude of `volume` as an uncompressed NIfTI-1 file
///
/// The affine maps voxel indices to mm with the field of view centered on
/// the origin.
pub fn save_nifti(volume: &Volume, voxel_sizes: [f64; 3]) -> Result<Vec<u8>> {
    let dim = nifti_dims(volume)?;
    let [vx, vy, vz] = voxel_sizes;
    let mut header = [0u8; 348];

    header[0..4].copy_from_slice(&348i32.to_le_bytes());
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // FLOAT32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    let pixdim: [f32; 8] = [1.0, vx as f32, vy as f32, vz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset after the 4-byte extension flag
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    let half = |n: i16, v: f64| -((n / 2) as f64) * v;
    let srows: [[f64; 4]; 3] = [
        [vx, 0.0, 0.0, half(dim[1], vx)],
        [0.0, vy, 0.0, half(dim[2], vy)],
        [0.0, 0.0, vz, half(dim[3], vz)],
    ];
    for (r, row) in srows.iter().enumerate() {
        for (c, &value) in row.iter().enumerate() {
            let offset = 280 + r * 16 + c * 4;
            header[offset..offset + 4].copy_from_slice(&(value as f32).to_le_bytes());
        }
    }
    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(352 + volume.shape().total() * 4);
    buffer.write_all(&header)?;
    buffer.write_all(&[0u8; 4])?;
    for value in volume.magnitude() {
        buffer.write_all(&(value as f32).to_le_bytes())?;
    }
    Ok(buffer)
}

/// [`save_nifti`] followed by gzip compression (.nii.gz)
pub fn save_nifti_gz(volume: &Volume, voxel_sizes: [f64; 3]) -> Result<Vec<u8>> {
    let uncompressed = save_nifti(volume, voxel_sizes)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&uncompressed)?;
    Ok(encoder.finish()?)
}

/// Write one volume; `.nii.gz` paths are gzip compressed
pub fn save_nifti_to_file(path: &Path, volume: &Volume, voxel_sizes: [f64; 3]) -> Result<()> {
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        save_nifti_gz(volume, voxel_sizes)?
    } else {
        save_nifti(volume, voxel_sizes)?
    };
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Write every output array as `{folder}/{name}.nii[.gz]`
///
/// # Returns
/// The written paths in name order
pub fn export_outputs(outputs: &ReconOutputs, folder: &Path, compress: bool) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(folder)?;
    let extension = if compress { "nii.gz" } else { "nii" };
    let mut written = Vec::with_capacity(outputs.len());
    for (name, array) in outputs.iter() {
        let path = folder.join(format!("{}.{}", name, extension));
        save_nifti_to_file(&path, &array.data, array.voxel_sizes)?;
        log::info!("wrote {}", path.display());
        written.push(path);
    }
    Ok(written)
}
