//! Geometry correction and final image formatting
//!
//! Gradient nonlinearity makes a spin at true patient position `r` appear at
//! `r + d(r)`. The correction resamples every location's volume so that the
//! output voxel at `r` takes the value found at `r + d(r)` in the acquired
//! image. Each imaging location uses its own magnet-physical (MPS) to
//! patient (XYZ) transform, since one acquisition may contain slices or slabs
//! with different orientations.
//!
//! The displacement model is a solid spherical harmonic expansion of the
//! three gradient fields:
//!
//! ```text
//! Bx(r) = R0 Σ x_cos[n][m] (ρ/R0)^n P_n^m(cos θ) cos(mφ)
//! By(r) = R0 Σ y_sin[n][m] (ρ/R0)^n P_n^m(cos θ) sin(mφ)
//! Bz(r) = R0 Σ z[n]        (ρ/R0)^n P_n^0(cos θ)
//! d(r)  = (Bx - X, By - Y, Bz - Z)
//! ```
//!
//! With only `x_cos[1][1] = y_sin[1][1] = z[1] = 1` the fields are perfectly
//! linear and the displacement vanishes.

use nalgebra::{Matrix3, Vector3};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::{ReconError, Result};
use crate::fft::idx3d;
use crate::volume::{Axis, Volume};

/// Magnet-physical to patient transform of one imaging location
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeometryTransform {
    pub location: u16,
    /// Row-major matrix taking (M, P, S) offsets in mm to (X, Y, Z) in mm;
    /// may include scaling as well as rotation
    pub mps_to_xyz: [[f64; 3]; 3],
    /// Patient-space position of the volume center in mm
    pub offcentre: [f64; 3],
}

impl GeometryTransform {
    pub fn identity(location: u16) -> Self {
        Self {
            location,
            mps_to_xyz: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            offcentre: [0.0; 3],
        }
    }

    fn matrix(&self) -> Matrix3<f64> {
        let m = &self.mps_to_xyz;
        Matrix3::new(
            m[0][0], m[0][1], m[0][2],
            m[1][0], m[1][1], m[1][2],
            m[2][0], m[2][1], m[2][2],
        )
    }

    pub fn to_patient(&self, mps: [f64; 3]) -> [f64; 3] {
        let v = self.matrix() * Vector3::new(mps[0], mps[1], mps[2]);
        [
            v[0] + self.offcentre[0],
            v[1] + self.offcentre[1],
            v[2] + self.offcentre[2],
        ]
    }

    /// Inverse of the MPS to XYZ matrix
    pub fn inverse_matrix(&self) -> Result<Matrix3<f64>> {
        self.matrix().try_inverse().ok_or_else(|| {
            ReconError::Geometry(format!("MPS to XYZ matrix of location {} is singular", self.location))
        })
    }
}

/// Position in mm (relative to the volume center) of voxel `(i, j, k)`
#[inline]
pub fn voxel_position(ijk: [usize; 3], dims: [usize; 3], voxel_sizes: [f64; 3]) -> [f64; 3] {
    [
        (ijk[0] as f64 - (dims[0] / 2) as f64) * voxel_sizes[0],
        (ijk[1] as f64 - (dims[1] / 2) as f64) * voxel_sizes[1],
        (ijk[2] as f64 - (dims[2] / 2) as f64) * voxel_sizes[2],
    ]
}

/// Spherical harmonic description of the gradient coil fields
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradientNonlinearity {
    /// Normalisation radius R0 in mm
    pub radius: f64,
    /// x gradient, cosine terms, indexed `[n][m]`
    pub x_cos: Vec<Vec<f64>>,
    /// y gradient, sine terms, indexed `[n][m]`
    pub y_sin: Vec<Vec<f64>>,
    /// z gradient, zonal terms, indexed `[n]`
    pub z: Vec<f64>,
}

impl GradientNonlinearity {
    /// Perfectly linear gradients (zero displacement everywhere)
    pub fn ideal(radius: f64) -> Self {
        Self {
            radius,
            x_cos: vec![vec![0.0], vec![0.0, 1.0]],
            y_sin: vec![vec![0.0], vec![0.0, 1.0]],
            z: vec![0.0, 1.0],
        }
    }

    /// Displacement (dX, dY, dZ) in mm at patient position `xyz`
    pub fn displacement(&self, xyz: [f64; 3]) -> [f64; 3] {
        let [x, y, z] = xyz;
        let rho = (x * x + y * y + z * z).sqrt();
        if rho < 1e-12 || self.radius <= 0.0 {
            return [0.0; 3];
        }
        let cos_theta = z / rho;
        let phi = y.atan2(x);
        let r = rho / self.radius;

        let mut bx = 0.0;
        for (n, row) in self.x_cos.iter().enumerate() {
            for (m, &c) in row.iter().enumerate().take(n + 1) {
                if c != 0.0 {
                    bx += c * r.powi(n as i32) * legendre(n, m, cos_theta) * (m as f64 * phi).cos();
                }
            }
        }
        let mut by = 0.0;
        for (n, row) in self.y_sin.iter().enumerate() {
            for (m, &c) in row.iter().enumerate().take(n + 1) {
                if c != 0.0 {
                    by += c * r.powi(n as i32) * legendre(n, m, cos_theta) * (m as f64 * phi).sin();
                }
            }
        }
        let mut bz = 0.0;
        for (n, &c) in self.z.iter().enumerate() {
            if c != 0.0 {
                bz += c * r.powi(n as i32) * legendre(n, 0, cos_theta);
            }
        }

        [
            self.radius * bx - x,
            self.radius * by - y,
            self.radius * bz - z,
        ]
    }
}

/// Associated Legendre function P_n^m(x) without the Condon-Shortley phase
pub fn legendre(n: usize, m: usize, x: f64) -> f64 {
    if m > n {
        return 0.0;
    }
    // P_m^m = (2m-1)!! (1-x²)^(m/2)
    let somx2 = ((1.0 - x) * (1.0 + x)).max(0.0).sqrt();
    let mut pmm = 1.0;
    let mut fact = 1.0;
    for _ in 0..m {
        pmm *= fact * somx2;
        fact += 2.0;
    }
    if n == m {
        return pmm;
    }
    let mut pmmp1 = x * (2 * m + 1) as f64 * pmm;
    if n == m + 1 {
        return pmmp1;
    }
    let mut pnm = 0.0;
    for l in (m + 2)..=n {
        pnm = ((2 * l - 1) as f64 * x * pmmp1 - (l + m - 1) as f64 * pmm) / (l - m) as f64;
        pmm = pmmp1;
        pmmp1 = pnm;
    }
    pnm
}

/// Trilinear interpolation in a 3D complex block (zero outside)
///
/// Axes of length 1 are not interpolated along.
pub(crate) fn trilinear(block: &[Complex64], dims: [usize; 3], pos: [f64; 3]) -> Complex64 {
    let mut base = [0usize; 3];
    let mut frac = [0.0f64; 3];
    for a in 0..3 {
        if dims[a] == 1 {
            continue;
        }
        let p = pos[a];
        if p < 0.0 || p > (dims[a] - 1) as f64 {
            return Complex64::new(0.0, 0.0);
        }
        let f = p.floor();
        base[a] = (f as usize).min(dims[a] - 1);
        frac[a] = p - f;
    }

    let mut sum = Complex64::new(0.0, 0.0);
    for corner in 0..8 {
        let offs = [corner & 1, (corner >> 1) & 1, (corner >> 2) & 1];
        let mut w = 1.0;
        let mut idx = [0usize; 3];
        let mut valid = true;
        for a in 0..3 {
            let wa = if offs[a] == 1 { frac[a] } else { 1.0 - frac[a] };
            if wa == 0.0 {
                valid = false;
                break;
            }
            idx[a] = base[a] + offs[a];
            if idx[a] >= dims[a] {
                valid = false;
                break;
            }
            w *= wa;
        }
        if valid {
            sum += block[idx3d(idx[0], idx[1], idx[2], dims[0], dims[1])] * w;
        }
    }
    sum
}

/// Gradient nonlinearity correction per imaging location
///
/// # Arguments
/// * `data` - Image volume; every index along [`Axis::Location`] is one location
/// * `location_ids` - Location id of every index along [`Axis::Location`]
/// * `transforms` - MPS to XYZ transforms, looked up by location id
/// * `nonlinearity` - Gradient field expansion; `None` leaves the data untouched
/// * `voxel_sizes` - Voxel sizes in mm along readout, phase and slice
///
/// # Returns
/// Resampled volume with the same shape as the input
pub fn geometry_correction(
    data: &Volume,
    location_ids: &[u16],
    transforms: &[GeometryTransform],
    nonlinearity: Option<&GradientNonlinearity>,
    voxel_sizes: [f64; 3],
) -> Result<Volume> {
    let nonlinearity = match nonlinearity {
        Some(g) => g,
        None => {
            log::debug!("no gradient nonlinearity coefficients, geometry correction skipped");
            return Ok(data.clone());
        }
    };

    let shape = data.shape();
    let dims = shape.spatial();
    let n_spatial = shape.spatial_len();
    if location_ids.len() != shape.len(Axis::Location) {
        return Err(ReconError::ShapeMismatch(format!(
            "{} location ids for {} locations",
            location_ids.len(),
            shape.len(Axis::Location)
        )));
    }

    // source position (in voxel index units) for every output voxel, per location
    let mut source_maps: Vec<Vec<[f64; 3]>> = Vec::with_capacity(location_ids.len());
    for &loc in location_ids {
        let transform = transforms
            .iter()
            .find(|t| t.location == loc)
            .ok_or_else(|| ReconError::MissingParameter(format!("transform of location {}", loc)))?;
        let inverse = transform.inverse_matrix()?;

        let mut map = vec![[0.0; 3]; n_spatial];
        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    let mps = voxel_position([i, j, k], dims, voxel_sizes);
                    let xyz = transform.to_patient(mps);
                    let d = nonlinearity.displacement(xyz);
                    // displacement back into MPS, then into index units
                    let dm = inverse * Vector3::new(d[0], d[1], d[2]);
                    let mut src = [0.0; 3];
                    for a in 0..3 {
                        let vs = if voxel_sizes[a] > 0.0 { voxel_sizes[a] } else { 1.0 };
                        src[a] = (mps[a] + dm[a]) / vs + (dims[a] / 2) as f64;
                    }
                    map[idx3d(i, j, k, dims[0], dims[1])] = src;
                }
            }
        }
        source_maps.push(map);
    }

    let mut out = Volume::zeros(shape);
    let n_blocks = shape.total() / n_spatial.max(1);
    for b in 0..n_blocks {
        let start = b * n_spatial;
        let loc_index = shape.coords(start)[Axis::Location.index()];
        let map = &source_maps[loc_index];
        let block = &data.data()[start..start + n_spatial];
        let dst = &mut out.data_mut()[start..start + n_spatial];
        for (v, d) in dst.iter_mut().enumerate() {
            *d = trilinear(block, dims, map[v]);
        }
    }
    Ok(out)
}

/// In-plane reorientation into the radiological display convention
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InPlaneTransform {
    /// Swap the readout and phase-encode axes (applied after the flips)
    pub transpose: bool,
    pub flip_readout: bool,
    pub flip_phase: bool,
}

/// Apply an [`InPlaneTransform`] to the readout/phase-encode plane
pub fn format_in_plane(data: &Volume, transform: InPlaneTransform) -> Volume {
    let mut out = data.clone();
    if transform.flip_readout {
        let n = out.len(Axis::Readout);
        out = out.remap_axis(Axis::Readout, n, |i| Some(n - 1 - i));
    }
    if transform.flip_phase {
        let n = out.len(Axis::PhaseEncode);
        out = out.remap_axis(Axis::PhaseEncode, n, |i| Some(n - 1 - i));
    }
    if transform.transpose {
        out = transpose_in_plane(&out);
    }
    out
}

fn transpose_in_plane(data: &Volume) -> Volume {
    let shape = data.shape();
    let nx = shape.len(Axis::Readout);
    let ny = shape.len(Axis::PhaseEncode);
    let out_shape = shape.with(Axis::Readout, ny).with(Axis::PhaseEncode, nx);
    let plane = nx * ny;
    let n_planes = shape.total() / plane.max(1);

    let mut out = Volume::zeros(out_shape);
    for p in 0..n_planes {
        let src = &data.data()[p * plane..(p + 1) * plane];
        let dst = &mut out.data_mut()[p * plane..(p + 1) * plane];
        for j in 0..ny {
            for i in 0..nx {
                dst[j + i * ny] = src[i + j * nx];
            }
        }
    }
    out
}

/// Remove oversampling by a centered crop of `n / factor` samples per axis
pub fn crop_oversampling(data: &Volume, factors: &[(Axis, f64)]) -> Volume {
    let mut out = data.clone();
    for &(axis, factor) in factors {
        if factor > 1.0 {
            let n = out.len(axis);
            let new_len = ((n as f64 / factor).round() as usize).clamp(1, n);
            out = out.resize_symmetric(axis, new_len);
        }
    }
    out
}

/// Zero-pad the in-plane axes to a square of the larger extent
pub fn zeropad_square(data: &Volume) -> Volume {
    let res = data.len(Axis::Readout).max(data.len(Axis::PhaseEncode));
    data.resize_symmetric(Axis::Readout, res)
        .resize_symmetric(Axis::PhaseEncode, res)
}
