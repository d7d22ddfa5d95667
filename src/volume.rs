//! Named-axis complex volumes
//!
//! Every multi-dimensional array in the pipeline is a [`Volume`]: a flat
//! `Vec<Complex64>` in Fortran (column-major) order with an explicit
//! [`Shape`] over the eleven reconstruction axes. Readout is the fastest
//! varying axis, so `index = x + y*nx + z*nx*ny + c*nx*ny*nz + ...`.
//!
//! Axis-selective operations take an [`Axis`] instead of an integer
//! position, so callers cannot silently transform or crop the wrong axis.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::{ReconError, Result};

/// Number of named axes in a [`Shape`]
pub const N_AXES: usize = 11;

/// Reconstruction axes in storage order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    Readout,
    PhaseEncode,
    Partition,
    Channel,
    Dynamic,
    CardiacPhase,
    Echo,
    Location,
    Mix,
    Stack,
    FlowSegment,
}

impl Axis {
    pub const ALL: [Axis; N_AXES] = [
        Axis::Readout,
        Axis::PhaseEncode,
        Axis::Partition,
        Axis::Channel,
        Axis::Dynamic,
        Axis::CardiacPhase,
        Axis::Echo,
        Axis::Location,
        Axis::Mix,
        Axis::Stack,
        Axis::FlowSegment,
    ];

    /// The three encoding axes (readout, phase encode, partition)
    pub const SPATIAL: [Axis; 3] = [Axis::Readout, Axis::PhaseEncode, Axis::Partition];

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Encoding axis for encoding direction 0, 1 or 2
    pub fn spatial(enc: usize) -> Axis {
        Axis::SPATIAL[enc.min(2)]
    }
}

/// Extent of a volume along every named axis
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: [usize; N_AXES],
}

impl Shape {
    /// Shape with the given encoding extents and length 1 on all other axes
    pub fn new(spatial: [usize; 3]) -> Self {
        let mut dims = [1; N_AXES];
        dims[..3].copy_from_slice(&spatial);
        Self { dims }
    }

    pub fn from_dims(dims: [usize; N_AXES]) -> Self {
        Self { dims }
    }

    /// Copy of this shape with `axis` set to `len`
    pub fn with(mut self, axis: Axis, len: usize) -> Self {
        self.dims[axis.index()] = len;
        self
    }

    #[inline]
    pub fn len(&self, axis: Axis) -> usize {
        self.dims[axis.index()]
    }

    pub fn dims(&self) -> &[usize; N_AXES] {
        &self.dims
    }

    pub fn spatial(&self) -> [usize; 3] {
        [self.dims[0], self.dims[1], self.dims[2]]
    }

    /// Number of voxels in the readout/phase/partition block
    pub fn spatial_len(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    pub fn total(&self) -> usize {
        self.dims.iter().product()
    }

    /// Distance in elements between neighbours along `axis`
    #[inline]
    pub fn stride(&self, axis: Axis) -> usize {
        self.dims[..axis.index()].iter().product()
    }

    #[inline]
    pub fn offset(&self, coords: &[usize; N_AXES]) -> usize {
        let mut offset = 0;
        let mut stride = 1;
        for (c, d) in coords.iter().zip(self.dims.iter()) {
            offset += c * stride;
            stride *= d;
        }
        offset
    }

    pub fn coords(&self, mut offset: usize) -> [usize; N_AXES] {
        let mut coords = [0; N_AXES];
        for (c, &d) in coords.iter_mut().zip(self.dims.iter()) {
            *c = offset % d;
            offset /= d;
        }
        coords
    }
}

/// Dense complex array over the named reconstruction axes
#[derive(Clone, Debug, PartialEq)]
pub struct Volume {
    shape: Shape,
    data: Vec<Complex64>,
}

impl Volume {
    pub fn zeros(shape: Shape) -> Self {
        Self {
            shape,
            data: vec![Complex64::new(0.0, 0.0); shape.total()],
        }
    }

    pub fn from_vec(shape: Shape, data: Vec<Complex64>) -> Result<Self> {
        if data.len() != shape.total() {
            return Err(ReconError::ShapeMismatch(format!(
                "{} samples for shape {:?} ({} expected)",
                data.len(),
                shape.dims(),
                shape.total()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Build a volume by evaluating `f` at every coordinate
    pub fn from_fn<F>(shape: Shape, f: F) -> Self
    where
        F: Fn(&[usize; N_AXES]) -> Complex64,
    {
        let data = (0..shape.total()).map(|i| f(&shape.coords(i))).collect();
        Self { shape, data }
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn len(&self, axis: Axis) -> usize {
        self.shape.len(axis)
    }

    pub fn data(&self) -> &[Complex64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [Complex64] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<Complex64> {
        self.data
    }

    #[inline]
    pub fn get(&self, coords: &[usize; N_AXES]) -> Complex64 {
        self.data[self.shape.offset(coords)]
    }

    #[inline]
    pub fn set(&mut self, coords: &[usize; N_AXES], value: Complex64) {
        let offset = self.shape.offset(coords);
        self.data[offset] = value;
    }

    /// Visit every 1-D lane along `axis`
    ///
    /// The lane is gathered into a contiguous buffer, handed to `f` together
    /// with the flat offset of its first element, and scattered back.
    pub fn for_each_lane_mut<F>(&mut self, axis: Axis, mut f: F)
    where
        F: FnMut(usize, &mut [Complex64]),
    {
        let n = self.shape.len(axis);
        let stride = self.shape.stride(axis);
        let outer = self.shape.total() / (n * stride).max(1);
        let mut buffer = vec![Complex64::new(0.0, 0.0); n];

        for o in 0..outer {
            for inner in 0..stride {
                let start = o * n * stride + inner;
                for (i, b) in buffer.iter_mut().enumerate() {
                    *b = self.data[start + i * stride];
                }
                f(start, &mut buffer);
                for (i, b) in buffer.iter().enumerate() {
                    self.data[start + i * stride] = *b;
                }
            }
        }
    }

    /// Rebuild the volume with `new_len` entries along `axis`
    ///
    /// `source(i)` names the input index copied into output index `i`;
    /// `None` leaves the output zero.
    pub fn remap_axis<F>(&self, axis: Axis, new_len: usize, source: F) -> Volume
    where
        F: Fn(usize) -> Option<usize>,
    {
        let n = self.shape.len(axis);
        let stride = self.shape.stride(axis);
        let outer = self.shape.total() / (n * stride).max(1);
        let mut out = Volume::zeros(self.shape.with(axis, new_len));

        for o in 0..outer {
            for i in 0..new_len {
                let src = match source(i) {
                    Some(s) if s < n => s,
                    _ => continue,
                };
                let src_start = (o * n + src) * stride;
                let dst_start = (o * new_len + i) * stride;
                out.data[dst_start..dst_start + stride]
                    .copy_from_slice(&self.data[src_start..src_start + stride]);
            }
        }
        out
    }

    /// Circular shift along `axis`; element `i` moves to `i + shift`
    pub fn roll(&self, axis: Axis, shift: i64) -> Volume {
        let n = self.shape.len(axis) as i64;
        if n == 0 || shift % n == 0 {
            return self.clone();
        }
        self.remap_axis(axis, n as usize, |i| {
            Some((i as i64 - shift).rem_euclid(n) as usize)
        })
    }

    /// Centered crop or zero-pad along `axis`
    ///
    /// Index `n/2` of the input lands on index `new_len/2` of the output,
    /// which keeps the FFT center fixed.
    pub fn resize_symmetric(&self, axis: Axis, new_len: usize) -> Volume {
        let n = self.shape.len(axis) as i64;
        let delta = n / 2 - (new_len as i64) / 2;
        self.remap_axis(axis, new_len, |i| {
            let src = i as i64 + delta;
            if src >= 0 && src < n {
                Some(src as usize)
            } else {
                None
            }
        })
    }

    /// Single index along `axis`, keeping the axis with length 1
    pub fn slice(&self, axis: Axis, index: usize) -> Volume {
        self.remap_axis(axis, 1, |_| Some(index))
    }

    /// Write `part` (length 1 along `axis`) into position `index`
    pub fn insert_slice(&mut self, axis: Axis, index: usize, part: &Volume) -> Result<()> {
        let expected = self.shape.with(axis, 1);
        if part.shape != expected || index >= self.shape.len(axis) {
            return Err(ReconError::ShapeMismatch(format!(
                "cannot insert {:?} at {:?}[{}] of {:?}",
                part.shape.dims(),
                axis,
                index,
                self.shape.dims()
            )));
        }
        let n = self.shape.len(axis);
        let stride = self.shape.stride(axis);
        let outer = self.shape.total() / (n * stride).max(1);
        for o in 0..outer {
            let dst = (o * n + index) * stride;
            let src = o * stride;
            self.data[dst..dst + stride].copy_from_slice(&part.data[src..src + stride]);
        }
        Ok(())
    }

    /// Concatenate volumes of length 1 along `axis`
    pub fn stack(axis: Axis, parts: &[Volume]) -> Result<Volume> {
        let first = parts
            .first()
            .ok_or_else(|| ReconError::ShapeMismatch("nothing to stack".to_string()))?;
        let mut out = Volume::zeros(first.shape.with(axis, parts.len()));
        for (i, part) in parts.iter().enumerate() {
            out.insert_slice(axis, i, part)?;
        }
        Ok(out)
    }

    pub fn magnitude(&self) -> Vec<f64> {
        self.data.iter().map(|v| v.norm()).collect()
    }

    /// Root-sum-of-squares along `axis`; the axis collapses to length 1
    pub fn sum_of_squares(&self, axis: Axis) -> Volume {
        let n = self.shape.len(axis);
        let stride = self.shape.stride(axis);
        let outer = self.shape.total() / (n * stride).max(1);
        let mut out = Volume::zeros(self.shape.with(axis, 1));

        for o in 0..outer {
            for inner in 0..stride {
                let start = o * n * stride + inner;
                let power: f64 = (0..n).map(|i| self.data[start + i * stride].norm_sqr()).sum();
                out.data[o * stride + inner] = Complex64::new(power.sqrt(), 0.0);
            }
        }
        out
    }

    /// Largest magnitude in the volume
    pub fn max_abs(&self) -> f64 {
        self.data.iter().fold(0.0, |m, v| m.max(v.norm()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: Shape) -> Volume {
        let data = (0..shape.total()).map(|i| Complex64::new(i as f64, 0.0)).collect();
        Volume::from_vec(shape, data).unwrap()
    }

    #[test]
    fn test_offset_coords_roundtrip() {
        let shape = Shape::new([4, 3, 2]).with(Axis::Channel, 5).with(Axis::FlowSegment, 2);
        for i in 0..shape.total() {
            assert_eq!(shape.offset(&shape.coords(i)), i, "offset/coords mismatch at {}", i);
        }
        assert_eq!(shape.stride(Axis::PhaseEncode), 4);
        assert_eq!(shape.stride(Axis::Channel), 24);
    }

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        let result = Volume::from_vec(Shape::new([2, 2, 1]), vec![Complex64::new(0.0, 0.0); 3]);
        assert!(result.is_err());
    }

    #[test]
    fn test_roll_moves_elements_forward() {
        let v = ramp(Shape::new([4, 1, 1]));
        let rolled = v.roll(Axis::Readout, 1);
        let re: Vec<f64> = rolled.data().iter().map(|c| c.re).collect();
        assert_eq!(re, vec![3.0, 0.0, 1.0, 2.0]);

        let back = rolled.roll(Axis::Readout, -1);
        assert_eq!(back, v);
    }

    #[test]
    fn test_resize_symmetric_keeps_center() {
        let v = ramp(Shape::new([1, 8, 1]));
        let cropped = v.resize_symmetric(Axis::PhaseEncode, 4);
        let re: Vec<f64> = cropped.data().iter().map(|c| c.re).collect();
        // center index 4 -> 2
        assert_eq!(re, vec![2.0, 3.0, 4.0, 5.0]);

        let padded = cropped.resize_symmetric(Axis::PhaseEncode, 8);
        assert_eq!(padded.data()[4].re, 4.0);
        assert_eq!(padded.data()[0].re, 0.0);
        assert_eq!(padded.data()[7].re, 0.0);
    }

    #[test]
    fn test_slice_and_insert() {
        let v = ramp(Shape::new([2, 2, 1]).with(Axis::Channel, 3));
        let s = v.slice(Axis::Channel, 1);
        assert_eq!(s.shape().len(Axis::Channel), 1);
        assert_eq!(s.data()[0].re, 4.0);

        let mut out = Volume::zeros(v.shape());
        for c in 0..3 {
            out.insert_slice(Axis::Channel, c, &v.slice(Axis::Channel, c)).unwrap();
        }
        assert_eq!(out, v);
    }

    #[test]
    fn test_sum_of_squares() {
        let shape = Shape::new([2, 1, 1]).with(Axis::Channel, 2);
        let data = vec![
            Complex64::new(3.0, 0.0), Complex64::new(0.0, 5.0),
            Complex64::new(0.0, 4.0), Complex64::new(12.0, 0.0),
        ];
        let v = Volume::from_vec(shape, data).unwrap();
        let sos = v.sum_of_squares(Axis::Channel);
        assert!((sos.data()[0].re - 5.0).abs() < 1e-12);
        assert!((sos.data()[1].re - 13.0).abs() < 1e-12);
    }

    #[test]
    fn test_for_each_lane_visits_all() {
        let mut v = ramp(Shape::new([3, 4, 2]));
        let mut lanes = 0;
        v.for_each_lane_mut(Axis::PhaseEncode, |_, lane| {
            assert_eq!(lane.len(), 4);
            lanes += 1;
            for x in lane.iter_mut() {
                *x *= 2.0;
            }
        });
        assert_eq!(lanes, 6);
        assert_eq!(v.data()[5].re, 10.0);
    }
}
