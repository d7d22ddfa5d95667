//! Phase-contrast flow decoding
//!
//! Flow segments are reconstructed separately and stacked along
//! [`Axis::FlowSegment`]. Decoding then runs per location:
//!
//! 1. Concomitant-field phase removal per segment
//! 2. Segment combination (complex difference or inverse Hadamard)
//! 3. Background phase removal with a polynomial fitted to static tissue
//! 4. Reordering of the velocity components onto the patient axes
//!
//! After combination component 0 holds the magnitude and component `k`
//! carries the velocity-encoded phase `Δφ_k`, with `v = Δφ venc / π`.

use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::{ReconError, Result};
use crate::geometry::{voxel_position, GeometryTransform};
use crate::volume::{Axis, Volume};

/// Patient axis (0 = RL, 1 = AP, 2 = FH) and sign of one encoded component
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowDirection {
    pub axis: usize,
    pub sign: f64,
}

/// 4-point Hadamard encoding matrix, rows = segments
const HADAMARD: [[f64; 4]; 4] = [
    [1.0, 1.0, 1.0, 1.0],
    [1.0, -1.0, 1.0, -1.0],
    [1.0, 1.0, -1.0, -1.0],
    [1.0, -1.0, -1.0, 1.0],
];

/// Outlier cut for the background fit, in standard deviations
const BACKGROUND_SIGMA: f64 = 2.0;
const BACKGROUND_ITERATIONS: usize = 3;

/// Reject acquisitions with fewer than two flow segments
pub fn check_flow_scan(segments: &[u16]) -> Result<()> {
    if segments.len() < 2 {
        return Err(ReconError::InputClassification("this is not a flow scan".to_string()));
    }
    Ok(())
}

/// Velocity in units of `venc` for a phase difference in radians
#[inline]
pub fn phase_to_velocity(phase: f64, venc: f64) -> f64 {
    phase * venc / PI
}

// ============================================================================
// Concomitant field
// ============================================================================

/// Concomitant-field phase at patient position `xyz` (mm)
#[inline]
pub fn concomitant_phase(factors: &[f64; 4], xyz: [f64; 3]) -> f64 {
    let [x, y, z] = xyz;
    factors[0] * (x * x + y * y) + factors[1] * z * z + factors[2] * x * z + factors[3] * y * z
}

/// Remove the concomitant-field phase of every segment and location
///
/// # Arguments
/// * `data` - Image-space segments stacked along [`Axis::FlowSegment`]
/// * `transforms` - Transform of every index along [`Axis::Location`]
/// * `factors` - Quadratic coefficients of every segment
/// * `voxel_sizes` - Voxel sizes in mm
pub fn concomitant_field_correction(
    data: &Volume,
    transforms: &[GeometryTransform],
    factors: &[[f64; 4]],
    voxel_sizes: [f64; 3],
) -> Result<Volume> {
    let shape = data.shape();
    if transforms.len() != shape.len(Axis::Location) {
        return Err(ReconError::ShapeMismatch(format!(
            "{} transforms for {} locations",
            transforms.len(),
            shape.len(Axis::Location)
        )));
    }
    if factors.is_empty() {
        log::debug!("no concomitant-field factors, correction skipped");
        return Ok(data.clone());
    }
    if factors.len() < shape.len(Axis::FlowSegment) {
        return Err(ReconError::MissingParameter(format!(
            "concomitant factors for {} segments, {} given",
            shape.len(Axis::FlowSegment),
            factors.len()
        )));
    }

    let dims = shape.spatial();
    let n_spatial = shape.spatial_len();
    let mut out = data.clone();
    for b in 0..shape.total() / n_spatial.max(1) {
        let coords = shape.coords(b * n_spatial);
        let transform = &transforms[coords[Axis::Location.index()]];
        let f = &factors[coords[Axis::FlowSegment.index()]];
        let block = &mut out.data_mut()[b * n_spatial..(b + 1) * n_spatial];
        for (v, value) in block.iter_mut().enumerate() {
            let ijk = [v % dims[0], (v / dims[0]) % dims[1], v / (dims[0] * dims[1])];
            let xyz = transform.to_patient(voxel_position(ijk, dims, voxel_sizes));
            *value *= Complex64::from_polar(1.0, -concomitant_phase(f, xyz));
        }
    }
    Ok(out)
}

// ============================================================================
// Segment combination
// ============================================================================

/// Combine flow segments into magnitude and velocity-encoded components
///
/// Without Hadamard encoding segment 0 is the reference and component `k`
/// carries `arg(s_k conj(s_0))`. With Hadamard encoding (exactly 4
/// segments) the phases relative to segment 0 are decoded with the inverse
/// Hadamard matrix and reported as the equivalent two-point difference.
/// Component 0 is the mean magnitude in both modes.
pub fn divide_flow_segments(data: &Volume, hadamard: bool) -> Result<Volume> {
    let shape = data.shape();
    let n_seg = shape.len(Axis::FlowSegment);
    if n_seg < 2 {
        return Err(ReconError::InputClassification("this is not a flow scan".to_string()));
    }
    if hadamard && n_seg != 4 {
        return Err(ReconError::InvalidParameter(format!(
            "Hadamard flow encoding needs 4 segments, found {}",
            n_seg
        )));
    }

    let stride = shape.stride(Axis::FlowSegment);
    let src = data.data();
    let mut out = Volume::zeros(shape);
    let dst = out.data_mut();

    for o in 0..stride {
        let segments: Vec<Complex64> = (0..n_seg).map(|j| src[o + j * stride]).collect();
        let magnitude = segments.iter().map(|s| s.norm()).sum::<f64>() / n_seg as f64;
        let relative: Vec<f64> = segments.iter().map(|s| (s * segments[0].conj()).arg()).collect();

        dst[o] = Complex64::new(magnitude, 0.0);
        for k in 1..n_seg {
            let phase = if hadamard {
                let theta: f64 = (0..4).map(|j| HADAMARD[j][k] * relative[j]).sum::<f64>() / 4.0;
                2.0 * theta
            } else {
                relative[k]
            };
            dst[o + k * stride] = Complex64::from_polar(magnitude, phase);
        }
    }
    Ok(out)
}

// ============================================================================
// Background phase
// ============================================================================

/// Otsu threshold of non-negative values
///
/// Returns the upper edge of the background class, so `value >= threshold`
/// selects the foreground.
pub fn otsu_threshold(values: &[f64], bins: usize) -> f64 {
    if values.is_empty() || bins == 0 {
        return 0.0;
    }
    let min = values.iter().fold(f64::MAX, |a, &b| a.min(b));
    let max = values.iter().fold(f64::MIN, |a, &b| a.max(b));
    if (max - min).abs() < 1e-12 {
        return min;
    }

    let width = (max - min) / bins as f64;
    let mut histogram = vec![0usize; bins];
    for &v in values {
        histogram[(((v - min) / width) as usize).min(bins - 1)] += 1;
    }

    let total = values.len() as f64;
    let sum_total: f64 = histogram.iter().enumerate().map(|(i, &c)| i as f64 * c as f64).sum();
    let (mut sum_bg, mut weight_bg) = (0.0, 0.0);
    let (mut best, mut best_bin) = (0.0, 0);
    for (t, &count) in histogram.iter().enumerate() {
        weight_bg += count as f64;
        if weight_bg == 0.0 {
            continue;
        }
        let weight_fg = total - weight_bg;
        if weight_fg == 0.0 {
            break;
        }
        sum_bg += t as f64 * count as f64;
        let mean_bg = sum_bg / weight_bg;
        let mean_fg = (sum_total - sum_bg) / weight_fg;
        let variance = weight_bg * weight_fg * (mean_bg - mean_fg).powi(2);
        if variance > best {
            best = variance;
            best_bin = t;
        }
    }
    min + (best_bin + 1) as f64 * width
}

/// Monomials `u^a v^b` with `a + b <= order`
fn polynomial_terms(u: f64, v: f64, order: usize) -> Vec<f64> {
    let mut terms = Vec::with_capacity((order + 1) * (order + 2) / 2);
    for total in 0..=order {
        for a in 0..=total {
            terms.push(u.powi(a as i32) * v.powi((total - a) as i32));
        }
    }
    terms
}

/// Least-squares polynomial fit of `values` at `points`, with iterative
/// rejection of residuals above `BACKGROUND_SIGMA` standard deviations
///
/// Returns `None` when there are fewer points than polynomial terms.
pub fn fit_polynomial_2d(points: &[(f64, f64)], values: &[f64], order: usize) -> Option<Vec<f64>> {
    let n_terms = (order + 1) * (order + 2) / 2;
    let mut active: Vec<usize> = (0..points.len()).collect();
    let mut coefficients: Option<Vec<f64>> = None;

    for _ in 0..BACKGROUND_ITERATIONS {
        if active.len() < n_terms {
            break;
        }
        let a = DMatrix::from_fn(active.len(), n_terms, |r, c| {
            let (u, v) = points[active[r]];
            polynomial_terms(u, v, order)[c]
        });
        let b = DVector::from_fn(active.len(), |r, _| values[active[r]]);
        let svd = a.clone().svd(true, true);
        let Ok(c) = svd.solve(&b, 1e-12) else {
            break;
        };
        let residual = &b - &a * &c;
        coefficients = Some(c.iter().copied().collect());

        let sigma = (residual.iter().map(|r| r * r).sum::<f64>() / residual.len() as f64).sqrt();
        if sigma <= 1e-12 {
            break;
        }
        let kept: Vec<usize> = active
            .iter()
            .zip(residual.iter())
            .filter(|(_, r)| r.abs() <= BACKGROUND_SIGMA * sigma)
            .map(|(&i, _)| i)
            .collect();
        if kept.len() == active.len() {
            break;
        }
        active = kept;
    }
    coefficients
}

/// Evaluate a polynomial fitted by [`fit_polynomial_2d`]
pub fn eval_polynomial_2d(coefficients: &[f64], u: f64, v: f64, order: usize) -> f64 {
    polynomial_terms(u, v, order)
        .iter()
        .zip(coefficients.iter())
        .map(|(t, c)| t * c)
        .sum()
}

/// Remove slowly varying background phase from the velocity components
///
/// Per slice, static tissue is the part of the magnitude image above its
/// Otsu threshold; a polynomial of `order` is fitted to the phase of each
/// velocity component there and subtracted everywhere.
pub fn fit_flow_phase(data: &Volume, order: usize) -> Result<Volume> {
    let shape = data.shape();
    let n_seg = shape.len(Axis::FlowSegment);
    if n_seg < 2 {
        return Err(ReconError::InputClassification("this is not a flow scan".to_string()));
    }
    let [nx, ny, _] = shape.spatial();
    let plane = nx * ny;
    let stride = shape.stride(Axis::FlowSegment);
    let planes = stride / plane.max(1);

    let coordinate = |i: usize, j: usize| {
        (
            (i as f64 - (nx / 2) as f64) / nx.max(1) as f64,
            (j as f64 - (ny / 2) as f64) / ny.max(1) as f64,
        )
    };

    let mut out = data.clone();
    for p in 0..planes {
        let base = p * plane;
        let magnitude: Vec<f64> = data.data()[base..base + plane].iter().map(|v| v.norm()).collect();
        let threshold = otsu_threshold(&magnitude, 256);
        let static_voxels: Vec<usize> = (0..plane)
            .filter(|&v| magnitude[v] >= threshold && magnitude[v] > 0.0)
            .collect();
        let points: Vec<(f64, f64)> = static_voxels.iter().map(|&v| coordinate(v % nx, v / nx)).collect();

        for k in 1..n_seg {
            let start = k * stride + base;
            let phases: Vec<f64> = static_voxels.iter().map(|&v| data.data()[start + v].arg()).collect();
            let Some(coefficients) = fit_polynomial_2d(&points, &phases, order) else {
                log::warn!("too few static voxels for a background fit in plane {}", p);
                continue;
            };
            for (v, value) in out.data_mut()[start..start + plane].iter_mut().enumerate() {
                let (u, w) = coordinate(v % nx, v / nx);
                *value *= Complex64::from_polar(1.0, -eval_polynomial_2d(&coefficients, u, w, order));
            }
        }
    }
    Ok(out)
}

// ============================================================================
// Output format
// ============================================================================

/// Reorder decoded components onto (magnitude, RL, AP, FH) velocities
///
/// # Arguments
/// * `data` - Output of [`divide_flow_segments`], at most 3 velocity components
/// * `directions` - Patient axis and sign of every velocity component
/// * `venc` - Velocity encoding per component (a single value applies to all)
///
/// # Returns
/// Volume with 4 entries along [`Axis::FlowSegment`]: the magnitude followed
/// by the velocities along RL, AP and FH (real valued, zero if not encoded)
pub fn format_flow(data: &Volume, directions: &[FlowDirection], venc: &[f64]) -> Result<Volume> {
    let shape = data.shape();
    let n_seg = shape.len(Axis::FlowSegment);
    let components = n_seg.saturating_sub(1);
    if components > 3 {
        return Err(ReconError::InvalidParameter(format!("{} flow components", components)));
    }
    if directions.len() < components {
        return Err(ReconError::MissingParameter(format!(
            "flow direction of {} components, {} given",
            components,
            directions.len()
        )));
    }
    let venc_of = |k: usize| -> Result<f64> {
        match venc {
            [single] => Ok(*single),
            many => many
                .get(k)
                .copied()
                .ok_or_else(|| ReconError::MissingParameter(format!("venc of flow component {}", k))),
        }
    };
    if let Some(d) = directions.iter().take(components).find(|d| d.axis > 2) {
        return Err(ReconError::InvalidParameter(format!("flow axis {}", d.axis)));
    }

    let stride = shape.stride(Axis::FlowSegment);
    let mut out = Volume::zeros(shape.with(Axis::FlowSegment, 4));
    let src = data.data();
    let dst = out.data_mut();
    dst[..stride].copy_from_slice(&src[..stride]);
    for k in 1..=components {
        let direction = directions[k - 1];
        let venc = venc_of(k - 1)?;
        let target = (1 + direction.axis) * stride;
        for o in 0..stride {
            let v = direction.sign * phase_to_velocity(src[k * stride + o].arg(), venc);
            dst[target + o] = Complex64::new(v, 0.0);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Shape;

    fn segments(n_seg: usize, phase: impl Fn(usize, usize) -> f64) -> Volume {
        let shape = Shape::new([6, 6, 1]).with(Axis::FlowSegment, n_seg);
        Volume::from_fn(shape, |c| {
            let v = c[0] + 6 * c[1];
            Complex64::from_polar(2.0, phase(c[Axis::FlowSegment.index()], v))
        })
    }

    #[test]
    fn test_not_a_flow_scan() {
        let err = check_flow_scan(&[0]).unwrap_err();
        assert!(err.to_string().contains("this is not a flow scan"));
        assert!(check_flow_scan(&[0, 1]).is_ok());
    }

    #[test]
    fn test_difference_decoding() {
        let data = segments(2, |s, v| 0.3 + if s == 1 { 0.01 * v as f64 } else { 0.0 });
        let out = divide_flow_segments(&data, false).unwrap();
        for v in 0..36 {
            assert!((out.data()[v].re - 2.0).abs() < 1e-12);
            assert!((out.data()[36 + v].arg() - 0.01 * v as f64).abs() < 1e-12);
        }
    }

    #[test]
    fn test_hadamard_decoding() {
        let a = [0.2, -0.35, 0.5];
        let data = segments(4, |s, _| 0.4 + (0..3).map(|k| HADAMARD[s][k + 1] * a[k]).sum::<f64>());
        let out = divide_flow_segments(&data, true).unwrap();
        for k in 0..3 {
            let got = out.data()[(k + 1) * 36].arg();
            assert!((got - 2.0 * a[k]).abs() < 1e-12, "component {}: {} vs {}", k + 1, got, 2.0 * a[k]);
        }
        assert!(divide_flow_segments(&segments(3, |_, _| 0.0), true).is_err());
    }

    #[test]
    fn test_concomitant_correction_removes_quadratic_phase() {
        let factors = [[1e-3, 2e-3, 0.0, 5e-4], [0.0, 0.0, 1e-3, 0.0]];
        let t = GeometryTransform { offcentre: [3.0, -2.0, 10.0], ..GeometryTransform::identity(0) };
        let vs = [2.0, 2.0, 5.0];
        let shape = Shape::new([6, 6, 1]).with(Axis::FlowSegment, 2);
        let data = Volume::from_fn(shape, |c| {
            let xyz = t.to_patient(voxel_position([c[0], c[1], c[2]], [6, 6, 1], vs));
            Complex64::from_polar(1.5, concomitant_phase(&factors[c[Axis::FlowSegment.index()]], xyz))
        });
        let out = concomitant_field_correction(&data, &[t], &factors, vs).unwrap();
        for v in out.data() {
            assert!((v - Complex64::new(1.5, 0.0)).norm() < 1e-12);
        }
    }

    #[test]
    fn test_concomitant_correction_uses_transform_of_each_location() {
        let factors = [[2e-3, 1e-3, 5e-4, 0.0]];
        let transforms = [
            GeometryTransform { offcentre: [0.0, 0.0, -20.0], ..GeometryTransform::identity(0) },
            GeometryTransform {
                location: 1,
                mps_to_xyz: [[0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]],
                offcentre: [15.0, 4.0, 30.0],
            },
        ];
        let vs = [2.0, 2.0, 5.0];
        let shape = Shape::new([6, 6, 1]).with(Axis::Location, 2);
        let data = Volume::from_fn(shape, |c| {
            let t = &transforms[c[Axis::Location.index()]];
            let xyz = t.to_patient(voxel_position([c[0], c[1], c[2]], [6, 6, 1], vs));
            Complex64::from_polar(1.5, concomitant_phase(&factors[0], xyz))
        });

        let out = concomitant_field_correction(&data, &transforms, &factors, vs).unwrap();
        for v in out.data() {
            assert!((v - Complex64::new(1.5, 0.0)).norm() < 1e-12);
        }

        // the first transform alone leaves phase on the second location
        let first_only = [transforms[0].clone(), transforms[0].clone()];
        let wrong = concomitant_field_correction(&data, &first_only, &factors, vs).unwrap();
        assert!(wrong.data()[..36].iter().all(|v| (v - Complex64::new(1.5, 0.0)).norm() < 1e-12));
        assert!(wrong.data()[36..].iter().any(|v| v.arg().abs() > 0.1));
    }

    #[test]
    fn test_polynomial_fit_rejects_outliers() {
        let mut points = Vec::new();
        let mut values = Vec::new();
        for j in 0..10 {
            for i in 0..10 {
                let (u, v) = (i as f64 / 10.0 - 0.5, j as f64 / 10.0 - 0.5);
                points.push((u, v));
                values.push(0.1 + 0.5 * u - 0.2 * v + 0.3 * u * v);
            }
        }
        // a "vessel" with large phase
        values[55] += 2.0;
        values[56] += 2.0;
        let c = fit_polynomial_2d(&points, &values, 2).unwrap();
        let fitted = eval_polynomial_2d(&c, 0.1, -0.2, 2);
        let expected = 0.1 + 0.05 + 0.04 - 0.006;
        assert!((fitted - expected).abs() < 1e-9, "fitted {} expected {}", fitted, expected);
    }

    #[test]
    fn test_fit_flow_phase_removes_linear_background() {
        let shape = Shape::new([16, 16, 1]).with(Axis::FlowSegment, 2);
        let data = Volume::from_fn(shape, |c| {
            let inside = (4..12).contains(&c[0]) && (4..12).contains(&c[1]);
            let mag = if inside { 10.0 } else { 0.5 };
            let phase = if c[Axis::FlowSegment.index()] == 1 { 0.02 * c[0] as f64 - 0.01 * c[1] as f64 } else { 0.0 };
            Complex64::from_polar(mag, phase)
        });
        let out = fit_flow_phase(&data, 3).unwrap();
        for j in 4..12 {
            for i in 4..12 {
                let v = out.data()[256 + i + 16 * j];
                assert!(v.arg().abs() < 1e-8, "residual phase {} at ({}, {})", v.arg(), i, j);
            }
        }
    }

    #[test]
    fn test_format_flow_reorders_and_scales() {
        let data = segments(3, |s, _| match s { 1 => PI / 2.0, 2 => -PI / 4.0, _ => 0.0 });
        let decoded = divide_flow_segments(&data, false).unwrap();
        let directions = [FlowDirection { axis: 2, sign: -1.0 }, FlowDirection { axis: 0, sign: 1.0 }];
        let out = format_flow(&decoded, &directions, &[100.0]).unwrap();
        assert_eq!(out.len(Axis::FlowSegment), 4);
        // FH from component 1, sign flipped
        assert!((out.data()[3 * 36].re + 50.0).abs() < 1e-9);
        // RL from component 2
        assert!((out.data()[36].re + 25.0).abs() < 1e-9);
        // AP not encoded
        assert_eq!(out.data()[2 * 36].re, 0.0);
        assert!(format_flow(&decoded, &directions[..1], &[100.0]).is_err());
    }

    #[test]
    fn test_otsu_separates_two_levels() {
        let mut values = vec![1.0; 50];
        values.extend(vec![10.0; 50]);
        let t = otsu_threshold(&values, 256);
        assert!(t > 1.0 && t <= 10.0, "threshold {}", t);
    }
}
