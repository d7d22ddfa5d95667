//! Raw sample reader seam
//!
//! Decoding vendor raw-data streams lives outside this crate. The pipeline
//! only needs something implementing [`SampleReader`]: given selection
//! criteria and the scan's labels, return the matched profiles.

use num_complex::Complex64;

use crate::error::{ReconError, Result};
use crate::fft::{i2k_1d, k2i_1d};
use crate::labels::{Label, RawProfile, SelectionCriteria};

pub trait SampleReader: Sync {
    /// Profiles whose label matches `criteria`, in acquisition order
    fn read(&self, criteria: &SelectionCriteria, labels: &[Label]) -> Result<Vec<RawProfile>>;
}

/// Reader over samples already held in memory
///
/// `samples[i]` belongs to `labels[i]` of the label set handed to `read`.
#[derive(Clone, Debug, Default)]
pub struct InMemoryReader {
    samples: Vec<Vec<Complex64>>,
    readout_oversampling: f64,
}

impl InMemoryReader {
    pub fn new(samples: Vec<Vec<Complex64>>) -> Self {
        Self { samples, readout_oversampling: 1.0 }
    }

    /// Remove readout oversampling by `factor` while reading
    pub fn with_oversampling_removal(mut self, factor: f64) -> Self {
        self.readout_oversampling = factor.max(1.0);
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl SampleReader for InMemoryReader {
    fn read(&self, criteria: &SelectionCriteria, labels: &[Label]) -> Result<Vec<RawProfile>> {
        if labels.len() != self.samples.len() {
            return Err(ReconError::ShapeMismatch(format!(
                "{} labels for {} sample vectors",
                labels.len(),
                self.samples.len()
            )));
        }

        let profiles: Vec<RawProfile> = labels
            .iter()
            .zip(self.samples.iter())
            .filter(|(label, _)| criteria.matches(label))
            .map(|(label, samples)| {
                let samples = if self.readout_oversampling > 1.0 {
                    remove_readout_oversampling(samples, self.readout_oversampling)
                } else {
                    samples.clone()
                };
                RawProfile::new(label.clone(), samples)
            })
            .collect();

        if profiles.is_empty() {
            return Err(ReconError::NoData(format!("no profiles match {:?}", criteria)));
        }
        log::debug!("read {} profiles for {:?}", profiles.len(), criteria);
        Ok(profiles)
    }
}

/// Crop the readout field of view of one k-space line by `factor`
///
/// The line is transformed to image space, cropped around its center and
/// transformed back, which keeps image intensities unchanged.
pub fn remove_readout_oversampling(samples: &[Complex64], factor: f64) -> Vec<Complex64> {
    let n = samples.len();
    let m = ((n as f64 / factor).round() as usize).clamp(1, n.max(1));
    if m >= n {
        return samples.to_vec();
    }
    let mut line = samples.to_vec();
    k2i_1d(&mut line);
    let start = n / 2 - m / 2;
    let mut cropped = line[start..start + m].to_vec();
    i2k_1d(&mut cropped);
    cropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LabelType;

    fn labels() -> Vec<Label> {
        (0..4)
            .map(|i| Label { mix: (i % 2) as u16, ky: i, ..Label::default() })
            .collect()
    }

    fn samples(n: usize) -> Vec<Vec<Complex64>> {
        (0..4)
            .map(|i| (0..n).map(|x| Complex64::new((i * n + x) as f64, 0.0)).collect())
            .collect()
    }

    #[test]
    fn test_read_filters_by_criteria() {
        let reader = InMemoryReader::new(samples(4));
        let profiles = reader.read(&SelectionCriteria::for_iteration(1, 0), &labels()).unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].label.ky, 1);
        assert_eq!(profiles[1].label.ky, 3);
        assert_eq!(profiles[1].samples[0].re, 12.0);
    }

    #[test]
    fn test_read_no_match_is_error() {
        let reader = InMemoryReader::new(samples(4));
        let criteria = SelectionCriteria::default().with_type(LabelType::EchoPhase);
        assert!(matches!(reader.read(&criteria, &labels()), Err(ReconError::NoData(_))));
    }

    #[test]
    fn test_read_label_count_mismatch() {
        let reader = InMemoryReader::new(samples(4));
        let result = reader.read(&SelectionCriteria::default(), &labels()[..2]);
        assert!(matches!(result, Err(ReconError::ShapeMismatch(_))));
    }

    #[test]
    fn test_oversampling_removal_keeps_center_image() {
        // a flat image of value 1 over 8 samples is a centered spike in k-space
        let mut line = vec![Complex64::new(0.0, 0.0); 8];
        line[4] = Complex64::new(8.0, 0.0);
        let reduced = remove_readout_oversampling(&line, 2.0);
        assert_eq!(reduced.len(), 4);

        let mut image = reduced;
        k2i_1d(&mut image);
        for v in &image {
            assert!((v - Complex64::new(1.0, 0.0)).norm() < 1e-12, "image intensity changed: {}", v);
        }
    }
}
