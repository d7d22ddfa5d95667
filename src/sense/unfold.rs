//! Regularized SENSE unfolding
//!
//! Every folded voxel is the superposition of the full-FOV voxels that alias
//! onto it. With E the encoding matrix of one aliasing group (rows =
//! channels, columns = aliasing positions), Ψ the noise covariance and λ
//! the Tikhonov factor, the unfolded values are
//!
//! ```text
//! u = (Eᴴ Ψ⁻¹ E + λ I)⁻¹ Eᴴ Ψ⁻¹ f
//! ```
//!
//! Groups with a single position skip the regularization and reduce to the
//! noise-weighted coil-combining division `Eᴴ Ψ⁻¹ f / (Eᴴ Ψ⁻¹ E)`.

use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use rayon::prelude::*;

use crate::error::{ReconError, Result};
use crate::fft::idx3d;
use crate::volume::{Axis, Volume};

/// Gram values at or below this are treated as "no sensitivity"
const GRAM_EPS: f64 = 1e-12;

/// Full-FOV indices that fold onto each folded index along one axis
///
/// Index `y` of a grid of size `full` lands on `(y - full/2 + folded/2) mod folded`,
/// which keeps both FOV centers aligned and allows non-integer factors.
pub fn aliasing_groups(full: usize, folded: usize) -> Vec<Vec<usize>> {
    let mut groups = vec![Vec::new(); folded];
    if folded == 0 {
        return groups;
    }
    for y in 0..full {
        let f = (y as i64 - (full / 2) as i64 + (folded / 2) as i64).rem_euclid(folded as i64) as usize;
        groups[f].push(y);
    }
    groups
}

/// Inverse of the noise covariance (`None` when Ψ is the identity)
fn psi_inverse(psi: &DMatrix<Complex64>) -> Option<DMatrix<Complex64>> {
    let is_identity = (0..psi.nrows()).all(|i| {
        (0..psi.ncols()).all(|j| {
            let expected = if i == j { 1.0 } else { 0.0 };
            (psi[(i, j)] - Complex64::new(expected, 0.0)).norm() < 1e-14
        })
    });
    if is_identity {
        return None;
    }
    if let Some(chol) = psi.clone().cholesky() {
        return Some(chol.inverse());
    }
    log::warn!("noise covariance is not positive definite, using its pseudo-inverse");
    match psi.clone().pseudo_inverse(1e-12) {
        Ok(inv) => Some(inv),
        Err(_) => None,
    }
}

/// Solve one aliasing group
///
/// `e` is channels × positions, `f` the folded channel vector.
fn solve_group(
    e: &DMatrix<Complex64>,
    f: &DVector<Complex64>,
    psi_inv: Option<&DMatrix<Complex64>>,
    lambda: f64,
) -> DVector<Complex64> {
    let m = e.ncols();
    // W = Ψ⁻¹ E, so Eᴴ Ψ⁻¹ = Wᴴ for Hermitian Ψ
    let w = match psi_inv {
        Some(p) => p * e,
        None => e.clone(),
    };
    let wh = w.adjoint();
    let mut gram = &wh * e;
    let rhs = &wh * f;

    if m == 1 {
        let g = gram[(0, 0)].re;
        let value = if g > GRAM_EPS { rhs[0] / g } else { Complex64::new(0.0, 0.0) };
        return DVector::from_element(1, value);
    }

    for i in 0..m {
        gram[(i, i)] += Complex64::new(lambda, 0.0);
    }
    if let Some(chol) = gram.clone().cholesky() {
        return chol.solve(&rhs);
    }
    // rank-deficient without regularization
    let svd = gram.svd(true, true);
    svd.solve(&rhs, GRAM_EPS)
        .unwrap_or_else(|_| DVector::from_element(m, Complex64::new(0.0, 0.0)))
}

/// SENSE unfolding of folded coil images
///
/// # Arguments
/// * `folded` - Aliased coil images; spatial size is the acquired grid,
///   one entry per coil along [`Axis::Channel`]
/// * `sensitivity` - Coil sensitivities on the full-FOV grid; any
///   non-encoding axis other than the channel may be 1 (broadcast) or
///   match `folded`
/// * `psi` - Noise covariance, channels × channels
/// * `output_size` - Full-FOV size per encoding axis
/// * `lambda` - Tikhonov regularization factor
///
/// # Returns
/// Unfolded image with the channel axis collapsed to length 1
pub fn sense_unfold(
    folded: &Volume,
    sensitivity: &Volume,
    psi: &DMatrix<Complex64>,
    output_size: [usize; 3],
    lambda: f64,
) -> Result<Volume> {
    let fshape = folded.shape();
    let sshape = sensitivity.shape();
    let nc = fshape.len(Axis::Channel);

    if sshape.spatial() != output_size {
        return Err(ReconError::ShapeMismatch(format!(
            "sensitivity grid {:?} does not match the output size {:?}",
            sshape.spatial(),
            output_size
        )));
    }
    if sshape.len(Axis::Channel) != nc || psi.nrows() != nc || psi.ncols() != nc {
        return Err(ReconError::ShapeMismatch(format!(
            "{} coils in the data, {} in the sensitivities, Ψ is {}x{}",
            nc,
            sshape.len(Axis::Channel),
            psi.nrows(),
            psi.ncols()
        )));
    }
    for &axis in &Axis::ALL[4..] {
        let s = sshape.len(axis);
        if s != 1 && s != fshape.len(axis) {
            return Err(ReconError::ShapeMismatch(format!(
                "sensitivity length {} along {:?} cannot broadcast to {}",
                s,
                axis,
                fshape.len(axis)
            )));
        }
    }

    let fdims = fshape.spatial();
    let groups: Vec<Vec<Vec<usize>>> = (0..3).map(|a| aliasing_groups(output_size[a], fdims[a])).collect();
    let psi_inv = psi_inverse(psi);

    let out_shape = {
        let mut s = fshape.with(Axis::Channel, 1);
        for (enc, &n) in output_size.iter().enumerate() {
            s = s.with(Axis::spatial(enc), n);
        }
        s
    };
    let mut out = Volume::zeros(out_shape);

    let n_folded = fshape.spatial_len();
    let n_full = out_shape.spatial_len();
    let f_channel_stride = fshape.stride(Axis::Channel);
    let s_channel_stride = sshape.stride(Axis::Channel);
    let n_blocks = out_shape.total() / n_full.max(1);

    for b in 0..n_blocks {
        let block_coords = out_shape.coords(b * n_full);

        let mut f_coords = block_coords;
        for c in f_coords.iter_mut().take(3) {
            *c = 0;
        }
        let f_base = fshape.offset(&f_coords);

        let mut s_coords = block_coords;
        for (a, c) in s_coords.iter_mut().enumerate() {
            if a < 4 || sshape.dims()[a] == 1 {
                *c = 0;
            }
        }
        let s_base = sshape.offset(&s_coords);

        let fdata = folded.data();
        let sdata = sensitivity.data();

        let solved: Vec<Vec<(usize, Complex64)>> = (0..n_folded)
            .into_par_iter()
            .map(|v| {
                let fi = v % fdims[0];
                let fj = (v / fdims[0]) % fdims[1];
                let fk = v / (fdims[0] * fdims[1]);

                let mut positions = Vec::new();
                for &k in &groups[2][fk] {
                    for &j in &groups[1][fj] {
                        for &i in &groups[0][fi] {
                            positions.push(idx3d(i, j, k, output_size[0], output_size[1]));
                        }
                    }
                }
                if positions.is_empty() {
                    return Vec::new();
                }

                let f = DVector::from_fn(nc, |c, _| fdata[f_base + c * f_channel_stride + v]);
                let e = DMatrix::from_fn(nc, positions.len(), |c, p| {
                    sdata[s_base + c * s_channel_stride + positions[p]]
                });
                let u = solve_group(&e, &f, psi_inv.as_ref(), lambda);
                positions.into_iter().zip(u.iter().copied()).collect()
            })
            .collect();

        let dst = &mut out.data_mut()[b * n_full..(b + 1) * n_full];
        for group in solved {
            for (p, value) in group {
                dst[p] = value;
            }
        }
    }

    Ok(out)
}
