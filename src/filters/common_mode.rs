use crate::data_container::Section;
use crate::error::{DasError, Result};
use crate::filters::filter::{Filter, FilterConfig, FilterDomain};
use crate::math_tools::median;
use ndarray::{Array1, Zip};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Statistic used for the common-mode estimate of each sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommonModeEstimator {
    #[default]
    Median,
    Mean,
}

/// Removes the signal shared by all channels, e.g. laser phase noise.
///
/// For every sample the median (or mean) across the good channels is
/// subtracted from all channels, bad ones included.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CommonModeRemoval {
    #[serde(default)]
    pub estimator: CommonModeEstimator,
}

impl CommonModeRemoval {
    pub fn new(estimator: CommonModeEstimator) -> Self {
        CommonModeRemoval { estimator }
    }

    /// Per-sample common mode of `section`.
    pub fn estimate(&self, section: &Section) -> Result<Array1<f64>> {
        let good = section.good_channels();
        if good.is_empty() {
            return Err(DasError::InsufficientData {
                what: "good channels for the common-mode estimate",
                required: 1,
                available: 0,
            });
        }
        let data = section.data();
        let mut common = Array1::zeros(section.n_samples());
        Zip::from(&mut common)
            .and(data.columns())
            .par_for_each(|c, column| {
                let values: Vec<f64> = good.iter().map(|&i| column[i]).collect();
                *c = match self.estimator {
                    CommonModeEstimator::Median => median(&values),
                    CommonModeEstimator::Mean => values.iter().sum::<f64>() / values.len() as f64,
                };
            });
        // a column without finite values has no common mode
        common.mapv_inplace(|c| if c.is_finite() { c } else { 0.0 });
        Ok(common)
    }
}

impl Filter for CommonModeRemoval {
    fn config(&self) -> FilterConfig {
        FilterConfig {
            name: "Common Mode Removal".to_string(),
            description: format!(
                "Subtracts the per-sample {} across good channels from every channel.",
                match self.estimator {
                    CommonModeEstimator::Median => "median",
                    CommonModeEstimator::Mean => "mean",
                }
            ),
            hyperlink: None,
            domain: FilterDomain::Spatial,
        }
    }

    fn filter(&self, section: &mut Section) -> Result<()> {
        let start = Instant::now();
        let common = self.estimate(section)?;
        let mut data = section.data_mut();
        data -= &common;
        log::debug!("common mode removal. This took {:?}", start.elapsed());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_container::ChannelQuality;
    use crate::test_utils::{plane_wave_section, section_from};
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    #[test]
    fn test_removes_shared_signal() {
        let section = plane_wave_section(10, 1000, 0.0, 0);
        let mut noisy = section.clone();
        let shared = Array1::from_shape_fn(1000, |t| (0.05 * t as f64).sin());
        {
            let mut data = noisy.data_mut();
            data += &shared;
        }
        let out = CommonModeRemoval::new(CommonModeEstimator::Mean)
            .filtered(&noisy)
            .unwrap();
        let original = CommonModeRemoval::new(CommonModeEstimator::Mean)
            .filtered(&section)
            .unwrap();
        for (a, b) in out.data().iter().zip(original.data().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_median_ignores_bad_channels() {
        let mut data = Array2::from_elem((5, 4), 1.0);
        data.row_mut(0).fill(100.0);
        data.row_mut(3).fill(3.0);
        let mut section = section_from(data, 100.0, 1.0);
        section
            .set_quality(vec![
                ChannelQuality::Bad,
                ChannelQuality::Good,
                ChannelQuality::Good,
                ChannelQuality::Good,
                ChannelQuality::Good,
            ])
            .unwrap();
        let common = CommonModeRemoval::default().estimate(&section).unwrap();
        assert!(common.iter().all(|c| *c == 1.0));

        CommonModeRemoval::default().filter(&mut section).unwrap();
        assert_eq!(section.data()[[0, 0]], 99.0);
        assert_eq!(section.data()[[3, 2]], 2.0);
        assert_eq!(section.data()[[1, 1]], 0.0);
    }

    #[test]
    fn test_all_bad_channels_is_an_error() {
        let mut section = plane_wave_section(2, 50, 0.0, 0);
        section
            .set_quality(vec![ChannelQuality::Bad, ChannelQuality::Bad])
            .unwrap();
        let result = CommonModeRemoval::default().filtered(&section);
        assert!(matches!(result, Err(DasError::InsufficientData { .. })));
    }
}
