use crate::attributes::ApparentVelocity;
use crate::data_container::Section;
use crate::error::{DasError, Result};
use crate::filters::filter::{Filter, FilterConfig, FilterDomain};
use crate::filters::fk::{Bound, Direction, FanMask, FkFilter, FkMask, FkPadding};
use crate::math_tools::{percentile, TaperConfig};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Apparent velocity magnitudes (m/s) and propagation direction of the
/// coherent wavefield.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityRange {
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub direction: Direction,
}

/// Coherent part and residual of a section.
#[derive(Debug, Clone)]
pub struct SeparatedWavefield {
    pub coherent: Section,
    pub incoherent: Section,
    pub range: VelocityRange,
}

/// Splits a section into the energy inside a velocity fan and the rest.
///
/// The fan is derived from an apparent velocity estimate: the 10th to 90th
/// percentile of the valid velocity magnitudes with the dominant sign,
/// widened by `margin`. Without a usable estimate the `fallback` range is
/// used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WavefieldSeparation {
    pub fallback: Option<VelocityRange>,
    /// Relative widening of the estimated range on both ends.
    pub margin: f64,
    pub low_percentile: f64,
    pub high_percentile: f64,
    /// Relative taper width of the fan edges.
    pub edge: f64,
    pub taper: TaperConfig,
    pub padding: FkPadding,
}

impl Default for WavefieldSeparation {
    fn default() -> Self {
        WavefieldSeparation {
            fallback: None,
            margin: 0.2,
            low_percentile: 10.0,
            high_percentile: 90.0,
            edge: 0.1,
            taper: TaperConfig::default(),
            padding: FkPadding::NextPowerOfTwo,
        }
    }
}

impl WavefieldSeparation {
    pub fn with_fallback(range: VelocityRange) -> Self {
        WavefieldSeparation {
            fallback: Some(range),
            ..WavefieldSeparation::default()
        }
    }

    /// Velocity range from `estimate` if it has valid entries, otherwise the
    /// fallback.
    pub fn velocity_range(
        &self,
        section: &Section,
        estimate: Option<&ApparentVelocity>,
    ) -> Result<VelocityRange> {
        if !(0.0..1.0).contains(&self.margin) {
            return Err(DasError::InvalidParameter {
                parameter: "margin",
                value: self.margin,
                constraint: "must be in [0, 1)",
            });
        }
        if let Some(estimate) = estimate {
            if estimate.n_channels() != section.n_channels() {
                return Err(DasError::DimensionMismatch {
                    what: "apparent velocity channels",
                    expected: section.n_channels(),
                    actual: estimate.n_channels(),
                });
            }
            if let Some(range) = self.estimated_range(estimate) {
                return Ok(range);
            }
            log::warn!("apparent velocity estimate has no valid entries");
        }
        self.fallback.ok_or(DasError::InsufficientData {
            what: "valid apparent velocities or a fallback range",
            required: 1,
            available: 0,
        })
    }

    fn estimated_range(&self, estimate: &ApparentVelocity) -> Option<VelocityRange> {
        let valid = estimate.valid_velocities();
        let positive = valid.iter().filter(|v| **v > 0.0).count();
        let negative = valid.iter().filter(|v| **v < 0.0).count();
        let (direction, magnitudes): (Direction, Vec<f64>) = if positive > negative {
            (Direction::Positive, valid.iter().copied().filter(|v| *v > 0.0).collect())
        } else if negative > positive {
            (Direction::Negative, valid.iter().filter(|v| **v < 0.0).map(|v| -v).collect())
        } else {
            (Direction::Both, valid.iter().map(|v| v.abs()).collect())
        };
        if magnitudes.is_empty() {
            return None;
        }
        let low = percentile(&magnitudes, self.low_percentile);
        let high = percentile(&magnitudes, self.high_percentile);
        Some(VelocityRange {
            min: low * (1.0 - self.margin),
            max: high * (1.0 + self.margin),
            direction,
        })
    }

    fn fk_filter(&self, range: &VelocityRange) -> FkFilter {
        let vmax = (range.max > range.min).then_some(Bound::Value(range.max));
        FkFilter {
            mask: FkMask::Fan(FanMask {
                vmin: Some(Bound::Value(range.min)),
                vmax,
                edge: self.edge,
                direction: range.direction,
                ..FanMask::default()
            }),
            taper: self.taper,
            padding: self.padding,
            rezero: true,
        }
    }

    /// Separates `section` using `estimate`, or the estimate attached to the
    /// section when `None` is given.
    pub fn separate(
        &self,
        section: &Section,
        estimate: Option<&ApparentVelocity>,
    ) -> Result<SeparatedWavefield> {
        let start = Instant::now();
        let range = self.velocity_range(section, estimate.or(section.velocity()))?;
        log::debug!(
            "coherent wavefield between {:.1} and {:.1} m/s ({:?})",
            range.min,
            range.max,
            range.direction
        );
        let coherent = self.fk_filter(&range).filtered(section)?;
        let mut incoherent = section.clone();
        {
            let mut data = incoherent.data_mut();
            data -= coherent.data();
        }
        log::debug!("wavefield separation. This took {:?}", start.elapsed());
        Ok(SeparatedWavefield {
            coherent,
            incoherent,
            range,
        })
    }
}

impl Filter for WavefieldSeparation {
    fn config(&self) -> FilterConfig {
        FilterConfig {
            name: "Wavefield Separation".to_string(),
            description: "Keeps the coherent wavefield inside the apparent velocity fan \
                          estimated for the section."
                .to_string(),
            hyperlink: None,
            domain: FilterDomain::Decomposition,
        }
    }

    fn filter(&self, section: &mut Section) -> Result<()> {
        let separated = self.separate(section, None)?;
        section.replace_data(separated.coherent.into_data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{plane_wave, section_from, CHANNEL_SPACING, SAMPLING_RATE, VELOCITY};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};

    fn estimate(n_channels: usize, velocity: f64, spread: f64) -> ApparentVelocity {
        let mut values = Array2::from_shape_fn((n_channels, 3), |(c, w)| {
            velocity * (1.0 + spread * (((c + w) % 5) as f64 - 2.0))
        });
        values.row_mut(0).fill(f64::NAN);
        ApparentVelocity {
            velocity: values,
            coherence: Array2::ones((n_channels, 3)),
            window_times: Array1::zeros(3),
            window_length: 0.3,
        }
    }

    #[test]
    fn test_range_from_estimate() {
        let section = section_from(plane_wave(8, 200, VELOCITY, 0.0, 0), SAMPLING_RATE, CHANNEL_SPACING);
        let mut estimate = estimate(8, -VELOCITY, 0.01);
        estimate.velocity[[3, 1]] = 1500.0;
        let range = WavefieldSeparation::default()
            .velocity_range(&section, Some(&estimate))
            .unwrap();
        assert_eq!(range.direction, Direction::Negative);
        assert!(range.min < VELOCITY * 0.9 && range.min > VELOCITY * 0.7);
        assert!(range.max > VELOCITY * 1.2 && range.max < VELOCITY * 1.3);
    }

    #[test]
    fn test_separation_keeps_forward_wave() {
        let forward = plane_wave(32, 1000, VELOCITY, 0.0, 0);
        let backward = plane_wave(32, 1000, -VELOCITY, 0.0, 0);
        let mut section = section_from(&forward + &backward, SAMPLING_RATE, CHANNEL_SPACING);
        section.attach_velocity(estimate(32, VELOCITY, 0.2)).unwrap();

        let separated = WavefieldSeparation::default().separate(&section, None).unwrap();
        assert_eq!(separated.range.direction, Direction::Positive);
        let mut residual = 0.0;
        let mut signal = 0.0;
        for c in 6..26 {
            for t in 100..900 {
                residual += (separated.coherent.data()[[c, t]] - forward[[c, t]]).powi(2);
                signal += forward[[c, t]].powi(2);
            }
        }
        assert!(residual.sqrt() < 0.2 * signal.sqrt());

        let sum = separated.coherent.data() + separated.incoherent.data();
        for (a, b) in sum.iter().zip(section.data().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_fallback_and_errors() {
        let section = section_from(plane_wave(8, 256, VELOCITY, 0.0, 0), SAMPLING_RATE, CHANNEL_SPACING);
        let result = WavefieldSeparation::default().separate(&section, None);
        assert!(matches!(result, Err(DasError::InsufficientData { .. })));

        let result = WavefieldSeparation::default().separate(&section, Some(&estimate(6, VELOCITY, 0.01)));
        assert!(matches!(
            result,
            Err(DasError::DimensionMismatch {
                expected: 8,
                actual: 6,
                ..
            })
        ));

        let mut empty = estimate(8, VELOCITY, 0.01);
        empty.velocity.fill(f64::NAN);
        let fallback = VelocityRange {
            min: 1000.0,
            max: 3000.0,
            direction: Direction::Both,
        };
        let separated = WavefieldSeparation::with_fallback(fallback)
            .separate(&section, Some(&empty))
            .unwrap();
        assert_eq!(separated.range, fallback);
    }

    #[test]
    fn test_filter_keeps_coherent_part() {
        let mut section = section_from(plane_wave(16, 256, VELOCITY, 0.2, 3), SAMPLING_RATE, CHANNEL_SPACING);
        let separation = WavefieldSeparation::with_fallback(VelocityRange {
            min: 1500.0,
            max: 2500.0,
            direction: Direction::Positive,
        });
        let expected = separation.separate(&section, None).unwrap().coherent;
        separation.filter(&mut section).unwrap();
        assert_eq!(section.data(), expected.data());
    }
}
