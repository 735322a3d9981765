//! Channel attributes estimated from a section: apparent velocity and
//! coherence by slant stacking, channel quality and waveform turning points.

use crate::data_container::{ChannelQuality, Section};
use crate::error::{DasError, Result};
use crate::filters::fk::Direction;
use crate::math_tools::{median, median_absolute_deviation};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Apparent velocity and coherence per channel and time window.
///
/// Velocities are in m/s and signed: positive values belong to energy
/// travelling toward increasing channel index. Entries without a valid
/// estimate are `NaN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApparentVelocity {
    /// `channels × windows` apparent velocity.
    pub velocity: Array2<f64>,
    /// `channels × windows` value of the scan statistic at the chosen velocity.
    pub coherence: Array2<f64>,
    /// Centre of every window in seconds after the section start.
    pub window_times: Array1<f64>,
    /// Window length in seconds.
    pub window_length: f64,
}

impl ApparentVelocity {
    pub fn n_channels(&self) -> usize {
        self.velocity.nrows()
    }

    pub fn n_windows(&self) -> usize {
        self.velocity.ncols()
    }

    /// Median velocity over the valid windows of every channel, `NaN` for
    /// channels without any.
    pub fn channel_velocities(&self) -> Array1<f64> {
        self.velocity
            .axis_iter(Axis(0))
            .map(|row| median(&row.to_vec()))
            .collect()
    }

    /// All finite velocities.
    pub fn valid_velocities(&self) -> Vec<f64> {
        self.velocity.iter().copied().filter(|v| v.is_finite()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridSpacing {
    /// Trial velocities evenly spaced in velocity.
    #[default]
    Velocity,
    /// Trial velocities evenly spaced in slowness.
    Slowness,
}

/// Trial velocity magnitudes of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityGrid {
    pub min: f64,
    pub max: f64,
    pub count: usize,
    #[serde(default)]
    pub spacing: GridSpacing,
}

impl Default for VelocityGrid {
    fn default() -> Self {
        VelocityGrid {
            min: 500.0,
            max: 5000.0,
            count: 91,
            spacing: GridSpacing::Velocity,
        }
    }
}

impl VelocityGrid {
    pub fn values(&self) -> Result<Vec<f64>> {
        if !(self.min > 0.0 && self.min.is_finite()) {
            return Err(DasError::InvalidParameter {
                parameter: "min",
                value: self.min,
                constraint: "trial velocities must be positive",
            });
        }
        if !(self.max.is_finite() && self.max >= self.min) {
            return Err(DasError::InvalidParameter {
                parameter: "max",
                value: self.max,
                constraint: "must be finite and not below min",
            });
        }
        if self.count == 0 {
            return Err(DasError::InvalidParameter {
                parameter: "count",
                value: 0.0,
                constraint: "at least one trial velocity is needed",
            });
        }
        if self.count == 1 {
            return Ok(vec![self.min]);
        }
        let n = (self.count - 1) as f64;
        Ok((0..self.count)
            .map(|i| {
                let x = i as f64 / n;
                match self.spacing {
                    GridSpacing::Velocity => self.min + x * (self.max - self.min),
                    GridSpacing::Slowness => {
                        1.0 / (1.0 / self.max + (1.0 - x) * (1.0 / self.min - 1.0 / self.max))
                    }
                }
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatistic {
    /// Stacked energy over total energy of the aligned traces.
    #[default]
    Semblance,
    /// Mean normalized zero-lag correlation of the aligned traces with the
    /// centre channel.
    CrossCorrelation,
}

/// Slant-stack scan for the apparent velocity of every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocityScan {
    pub grid: VelocityGrid,
    pub direction: Direction,
    pub statistic: ScanStatistic,
    /// Channels in the spatial window. The window is centred on each channel,
    /// so an even count is used as the odd count one below it.
    pub channel_window: usize,
    /// Time window length in seconds.
    pub time_window: f64,
    /// Hop between time windows in seconds.
    pub time_step: f64,
    /// Windows whose best statistic stays below this get no velocity.
    pub min_coherence: f64,
    /// Trials within this of the best statistic count as ties.
    pub tie_tolerance: f64,
}

impl Default for VelocityScan {
    fn default() -> Self {
        VelocityScan {
            grid: VelocityGrid::default(),
            direction: Direction::Both,
            statistic: ScanStatistic::Semblance,
            channel_window: 5,
            time_window: 0.5,
            time_step: 0.25,
            min_coherence: 0.0,
            tie_tolerance: 1e-9,
        }
    }
}

/// Linear interpolation with zeros outside the trace.
fn interpolate(trace: ArrayView1<f64>, position: f64) -> f64 {
    let i = position.floor();
    let fraction = position - i;
    let sample = |k: f64| {
        if k >= 0.0 && (k as usize) < trace.len() {
            trace[k as usize]
        } else {
            0.0
        }
    };
    (1.0 - fraction) * sample(i) + fraction * sample(i + 1.0)
}

impl VelocityScan {
    /// Trial velocities in the scanned direction(s), ordered by magnitude.
    fn trials(&self) -> Result<Vec<f64>> {
        let mut magnitudes = self.grid.values()?;
        magnitudes.sort_by(|a, b| a.total_cmp(b));
        let mut trials = Vec::with_capacity(2 * magnitudes.len());
        for v in magnitudes {
            match self.direction {
                Direction::Both => trials.extend([v, -v]),
                Direction::Positive => trials.push(v),
                Direction::Negative => trials.push(-v),
            }
        }
        Ok(trials)
    }

    fn validate(&self) -> Result<()> {
        if self.channel_window < 3 {
            return Err(DasError::InvalidParameter {
                parameter: "channel_window",
                value: self.channel_window as f64,
                constraint: "at least three channels are needed",
            });
        }
        for (parameter, value) in [("time_window", self.time_window), ("time_step", self.time_step)] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(DasError::InvalidParameter {
                    parameter,
                    value,
                    constraint: "must be positive",
                });
            }
        }
        Ok(())
    }

    /// Scans `section` and returns a new attribute series.
    pub fn scan(&self, section: &Section) -> Result<ApparentVelocity> {
        let start = Instant::now();
        self.validate()?;
        let dx = section.channel_spacing();
        if dx <= 0.0 {
            return Err(DasError::InvalidMetadata {
                parameter: "channel_spacing",
                value: dx,
                constraint: "must be positive for a velocity scan",
            });
        }
        let (n_channels, n_samples) = section.data().dim();
        if self.channel_window > n_channels {
            return Err(DasError::InsufficientData {
                what: "channels in the spatial window",
                required: self.channel_window,
                available: n_channels,
            });
        }
        let half = (self.channel_window - 1) / 2;
        let fs = section.sampling_rate();
        let window = ((self.time_window * fs).round() as usize).max(2);
        if window > n_samples {
            return Err(DasError::InsufficientData {
                what: "samples in the time window",
                required: window,
                available: n_samples,
            });
        }
        let hop = ((self.time_step * fs).round() as usize).max(1);
        let starts: Vec<usize> = (0..=n_samples - window).step_by(hop).collect();
        let trials = self.trials()?;
        log::debug!(
            "velocity scan: {} trials, {} windows of {window} samples, {} channels per window",
            trials.len(),
            starts.len(),
            2 * half + 1
        );

        let data = section.data();
        let energy = data.mapv(|x| x * x);
        let mut velocity = Array2::from_elem((n_channels, starts.len()), f64::NAN);
        let mut coherence = Array2::from_elem((n_channels, starts.len()), f64::NAN);
        Zip::indexed(velocity.rows_mut())
            .and(coherence.rows_mut())
            .par_for_each(|c, mut velocity, mut coherence| {
                if c < half || c + half >= n_channels {
                    return;
                }
                for (w, &t0) in starts.iter().enumerate() {
                    let mut best = (f64::NEG_INFINITY, f64::NAN);
                    for &v in &trials {
                        // delay in samples per channel of offset
                        let moveout = dx / v * fs;
                        let stat = self.evaluate(data, &energy, c, half, t0..t0 + window, moveout);
                        if stat > best.0 + self.tie_tolerance {
                            best = (stat, v);
                        }
                    }
                    if best.0.is_finite() {
                        coherence[w] = best.0;
                        if best.0 >= self.min_coherence {
                            velocity[w] = best.1;
                        }
                    }
                }
            });

        let window_times = starts
            .iter()
            .map(|&t0| (t0 as f64 + window as f64 / 2.0) / fs)
            .collect();
        log::debug!("velocity scan. This took {:?}", start.elapsed());
        Ok(ApparentVelocity {
            velocity,
            coherence,
            window_times,
            window_length: window as f64 / fs,
        })
    }

    /// Statistic of the traces around channel `c` aligned for `moveout`
    /// samples per channel. The energy of each aligned trace is taken from
    /// interpolated squared samples so that fractional shifts do not lower it.
    fn evaluate(
        &self,
        data: &Array2<f64>,
        energy: &Array2<f64>,
        c: usize,
        half: usize,
        samples: std::ops::Range<usize>,
        moveout: f64,
    ) -> f64 {
        let channels = c - half..=c + half;
        let n_traces = (2 * half + 1) as f64;
        let shift = |j: usize| (j as f64 - c as f64) * moveout;
        match self.statistic {
            ScanStatistic::Semblance => {
                let mut stacked = 0.0;
                let mut total = 0.0;
                for t in samples {
                    let mut sum = 0.0;
                    for j in channels.clone() {
                        let position = t as f64 + shift(j);
                        sum += interpolate(data.row(j), position);
                        total += interpolate(energy.row(j), position);
                    }
                    stacked += sum * sum;
                }
                if total > 0.0 {
                    stacked / (n_traces * total)
                } else {
                    f64::NAN
                }
            }
            ScanStatistic::CrossCorrelation => {
                let reference = data.row(c);
                let reference_energy: f64 = samples.clone().map(|t| energy[[c, t]]).sum();
                let mut sum = 0.0;
                let mut pairs = 0;
                for j in channels.filter(|&j| j != c) {
                    let (mut cross, mut trace_energy) = (0.0, 0.0);
                    for t in samples.clone() {
                        let position = t as f64 + shift(j);
                        cross += interpolate(data.row(j), position) * reference[t];
                        trace_energy += interpolate(energy.row(j), position);
                    }
                    let norm = (trace_energy * reference_energy).sqrt();
                    if norm > 0.0 {
                        sum += cross / norm;
                        pairs += 1;
                    }
                }
                if pairs > 0 {
                    sum / pairs as f64
                } else {
                    f64::NAN
                }
            }
        }
    }
}

/// Energy-based channel quality check.
///
/// The log-energy of every channel is fitted with a robust polynomial along
/// the cable; channels more than `threshold` median absolute deviations
/// below the fit are bad.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelCheck {
    pub degree: usize,
    pub threshold: f64,
    /// Reclassify channels whose neighbourhood disagrees with them.
    pub continuity: bool,
    /// Neighbours on each side considered by the continuity check.
    pub adjacent: usize,
    /// Disagreeing channels tolerated in a neighbourhood.
    pub toleration: usize,
}

impl Default for ChannelCheck {
    fn default() -> Self {
        ChannelCheck {
            degree: 10,
            threshold: 5.0,
            continuity: true,
            adjacent: 2,
            toleration: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelReport {
    pub good: Vec<usize>,
    pub bad: Vec<usize>,
    /// `log10` of the energy of every channel.
    pub energy: Array1<f64>,
    /// Log-energy below which a channel is bad.
    pub threshold: Array1<f64>,
}

impl ChannelReport {
    pub fn quality(&self) -> Vec<ChannelQuality> {
        let mut quality = vec![ChannelQuality::Good; self.energy.len()];
        for &i in &self.bad {
            quality[i] = ChannelQuality::Bad;
        }
        quality
    }
}

/// Weighted least-squares polynomial on channel positions mapped to [-1, 1],
/// solved through a QR decomposition of the Vandermonde matrix.
fn polyfit(x: &Array1<f64>, y: &Array1<f64>, weights: &Array1<f64>, degree: usize) -> Option<Array1<f64>> {
    let rows: Vec<usize> = (0..y.len()).filter(|&i| weights[i] > 0.0).collect();
    if rows.is_empty() {
        return None;
    }
    let degree = degree.min(rows.len() - 1);
    let a = DMatrix::from_fn(rows.len(), degree + 1, |r, p| {
        weights[rows[r]].sqrt() * x[rows[r]].powi(p as i32)
    });
    let b = DVector::from_iterator(rows.len(), rows.iter().map(|&i| weights[i].sqrt() * y[i]));
    let qr = a.qr();
    let coefficients = qr.r().solve_upper_triangular(&(qr.q().transpose() * b))?;
    Some(x.mapv(|xi| {
        coefficients
            .iter()
            .enumerate()
            .map(|(p, c)| c * xi.powi(p as i32))
            .sum()
    }))
}

/// Iteratively reweighted polynomial fit ignoring samples further than
/// `threshold` median absolute deviations from the previous fit. Returns the
/// fit and the final weights.
fn robust_polyfit(y: &Array1<f64>, degree: usize, threshold: f64) -> Option<(Array1<f64>, Array1<f64>)> {
    let n = y.len();
    let x = Array1::from_shape_fn(n, |i| {
        if n > 1 {
            2.0 * i as f64 / (n - 1) as f64 - 1.0
        } else {
            0.0
        }
    });
    let finite = y.mapv(|v| if v.is_finite() { 1.0 } else { 0.0 });
    let mut weights = finite.clone();
    let mut fit = polyfit(&x, y, &weights, degree)?;
    for _ in 0..100 {
        let residuals: Vec<f64> = (0..n)
            .filter(|&i| finite[i] > 0.0)
            .map(|i| (y[i] - fit[i]).abs())
            .collect();
        let mad = median(&residuals);
        if !(mad > 0.0) {
            break;
        }
        weights = Array1::from_shape_fn(n, |i| {
            if finite[i] > 0.0 && (y[i] - fit[i]).abs() < threshold * mad {
                1.0
            } else {
                0.0
            }
        });
        let Some(new_fit) = polyfit(&x, y, &weights, degree) else {
            break;
        };
        let change = new_fit
            .iter()
            .zip(fit.iter())
            .map(|(new, old)| ((new - old) / old).abs())
            .filter(|c| !c.is_nan())
            .fold(0.0, f64::max);
        fit = new_fit;
        if change <= 1e-3 {
            break;
        }
    }
    Some((fit, weights))
}

/// Moves every member of `from` with at least `2 * adjacent + 1 - toleration`
/// members of `to` within `adjacent` channels over to `to`.
fn continuity(from: &mut Vec<usize>, to: &mut Vec<usize>, adjacent: usize, toleration: usize) {
    let needed = (2 * adjacent + 1).saturating_sub(toleration);
    for channel in from.clone() {
        let disagreeing = to.iter().filter(|&&o| o.abs_diff(channel) <= adjacent).count();
        if disagreeing >= needed {
            from.retain(|&c| c != channel);
            to.push(channel);
        }
    }
}

impl ChannelCheck {
    /// Classifies the channels of `section`.
    ///
    /// Channels without energy are always bad. With `continuity`, good
    /// channels surrounded by bad ones become bad and isolated bad channels
    /// become good.
    pub fn check(&self, section: &Section) -> Result<ChannelReport> {
        let n = section.n_channels();
        let energy: Array1<f64> = section
            .data()
            .axis_iter(Axis(0))
            .map(|row| row.mapv(|x| x * x).sum().log10())
            .collect();

        let (mut good, mut bad, threshold) = match robust_polyfit(&energy, self.degree, self.threshold) {
            Some((fit, weights)) => {
                let deviation = &energy - &fit;
                let inliers: Vec<f64> = deviation
                    .iter()
                    .zip(weights.iter())
                    .filter(|(_, w)| **w > 0.0)
                    .map(|(d, _)| d.abs())
                    .collect();
                let mad = median(&inliers);
                let limit = -self.threshold * mad;
                let (bad, good): (Vec<usize>, Vec<usize>) =
                    (0..n).partition(|&i| !(deviation[i] >= limit));
                (good, bad, fit.mapv(|f| f + limit))
            }
            None => {
                log::warn!("no channel carries energy, all channels are bad");
                (Vec::new(), (0..n).collect(), Array1::from_elem(n, f64::NAN))
            }
        };

        if self.continuity {
            continuity(&mut good, &mut bad, self.adjacent, self.toleration);
            continuity(&mut bad, &mut good, self.adjacent, self.toleration);
        }
        let dead: Vec<usize> = (0..n).filter(|&i| !energy[i].is_finite()).collect();
        good.retain(|i| !dead.contains(i));
        for i in dead {
            if !bad.contains(&i) {
                bad.push(i);
            }
        }
        good.sort_unstable();
        bad.sort_unstable();
        log::debug!("channel check: {} good, {} bad", good.len(), bad.len());
        Ok(ChannelReport {
            good,
            bad,
            energy,
            threshold,
        })
    }

    /// Runs [`check`](Self::check) and stores the result as the channel
    /// quality flags of `section`.
    pub fn apply(&self, section: &mut Section) -> Result<ChannelReport> {
        let report = self.check(section)?;
        section.set_quality(report.quality())?;
        section.record("channel check");
        Ok(report)
    }
}

/// Normalized zero-lag correlation of two traces, `NaN` if either is flat.
fn correlation(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let (ma, mb) = (a.mean().unwrap_or(0.0), b.mean().unwrap_or(0.0));
    let mut cross = 0.0;
    let (mut ea, mut eb) = (0.0, 0.0);
    for (x, y) in a.iter().zip(b.iter()) {
        cross += (x - ma) * (y - mb);
        ea += (x - ma) * (x - ma);
        eb += (y - mb) * (y - mb);
    }
    cross / (ea * eb).sqrt()
}

/// Positions between channels where the waveform changes abruptly, e.g.
/// where the cable turns.
///
/// The correlation of every pair of adjacent channels is compared with its
/// median; pairs more than `threshold` median absolute deviations below it
/// give a turning point at `i + 0.5`.
pub fn turning_points(section: &Section, threshold: f64) -> Vec<f64> {
    let data = section.data();
    let n = data.nrows();
    if n < 2 {
        return Vec::new();
    }
    let correlations: Vec<f64> = (0..n - 1)
        .map(|i| correlation(data.row(i), data.row(i + 1)))
        .collect();
    let center = median(&correlations);
    let mad = median_absolute_deviation(&correlations);
    correlations
        .iter()
        .enumerate()
        .filter(|(_, cc)| **cc < center - threshold * mad)
        .map(|(i, _)| i as f64 + 0.5)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::common_mode::CommonModeRemoval;
    use crate::filters::filter::Filter;
    use crate::filters::rank_reduction::RankReduction;
    use crate::test_utils::{plane_wave, plane_wave_section, section_from, CHANNEL_SPACING, SAMPLING_RATE, VELOCITY};
    use approx::assert_abs_diff_eq;

    fn full_record_scan() -> VelocityScan {
        VelocityScan {
            time_window: 1.0,
            time_step: 1.0,
            ..VelocityScan::default()
        }
    }

    #[test]
    fn test_grid_values() {
        let grid = VelocityGrid::default().values().unwrap();
        assert_eq!(grid.len(), 91);
        assert_abs_diff_eq!(grid[30], 2000.0, epsilon = 1e-9);
        let slowness = VelocityGrid {
            min: 1000.0,
            max: 4000.0,
            count: 4,
            spacing: GridSpacing::Slowness,
        }
        .values()
        .unwrap();
        assert_abs_diff_eq!(slowness[0], 1000.0, epsilon = 1e-9);
        assert_abs_diff_eq!(slowness[3], 4000.0, epsilon = 1e-9);
        assert_abs_diff_eq!(1.0 / slowness[1] - 1.0 / slowness[2], 0.00025, epsilon = 1e-12);
    }

    #[test]
    fn test_scan_recovers_velocity_and_sign() {
        for (velocity, statistic) in [
            (VELOCITY, ScanStatistic::Semblance),
            (-VELOCITY, ScanStatistic::Semblance),
            (VELOCITY, ScanStatistic::CrossCorrelation),
        ] {
            let section = section_from(plane_wave(12, 1000, velocity, 0.0, 0), SAMPLING_RATE, CHANNEL_SPACING);
            let scan = VelocityScan {
                statistic,
                ..full_record_scan()
            };
            let attribute = scan.scan(&section).unwrap();
            assert_eq!((attribute.n_channels(), attribute.n_windows()), (12, 1));
            for c in 2..10 {
                assert_abs_diff_eq!(attribute.velocity[[c, 0]], velocity, epsilon = 1e-9);
                assert!(attribute.coherence[[c, 0]] > 0.99);
            }
        }
    }

    #[test]
    fn test_boundary_channels_are_invalid() {
        let section = plane_wave_section(10, 600, 0.1, 1);
        let scan = VelocityScan {
            channel_window: 7,
            time_window: 0.2,
            time_step: 0.1,
            ..VelocityScan::default()
        };
        let attribute = scan.scan(&section).unwrap();
        assert_eq!(attribute.n_windows(), 5);
        for c in [0, 1, 2, 7, 8, 9] {
            assert!(attribute.velocity.row(c).iter().all(|v| v.is_nan()));
            assert!(attribute.coherence.row(c).iter().all(|v| v.is_nan()));
        }
        assert!(attribute.velocity.row(3).iter().any(|v| v.is_finite()));
        assert_abs_diff_eq!(attribute.window_times[0], 0.1, epsilon = 1e-12);
        assert!(attribute.channel_velocities()[0].is_nan());
    }

    #[test]
    fn test_direction_restricts_sign() {
        let section = plane_wave_section(8, 1000, 0.0, 0);
        let scan = VelocityScan {
            direction: Direction::Negative,
            ..full_record_scan()
        };
        let attribute = scan.scan(&section).unwrap();
        assert!(attribute.valid_velocities().iter().all(|v| *v < 0.0));
    }

    #[test]
    fn test_scan_errors() {
        let section = plane_wave_section(4, 500, 0.0, 0);
        let result = VelocityScan::default().scan(&section);
        assert!(matches!(result, Err(DasError::InsufficientData { required: 5, available: 4, .. })));

        let single = section_from(plane_wave(1, 500, VELOCITY, 0.0, 0), SAMPLING_RATE, 0.0);
        let result = VelocityScan::default().scan(&single);
        assert!(matches!(result, Err(DasError::InvalidMetadata { parameter: "channel_spacing", .. })));
    }

    #[test]
    fn test_even_window_spans_the_record() {
        let section = plane_wave_section(4, 500, 0.0, 0);
        let scan = VelocityScan {
            channel_window: 4,
            time_window: 0.4,
            time_step: 0.4,
            ..VelocityScan::default()
        };
        let attribute = scan.scan(&section).unwrap();
        assert!(attribute.velocity.row(0).iter().all(|v| v.is_nan()));
        assert!(attribute.velocity.row(3).iter().all(|v| v.is_nan()));
        for c in [1, 2] {
            assert!(attribute.velocity.row(c).iter().any(|v| v.is_finite()));
        }

        let too_wide = VelocityScan {
            channel_window: 5,
            ..scan.clone()
        };
        let result = too_wide.scan(&section);
        assert!(matches!(result, Err(DasError::InsufficientData { required: 5, available: 4, .. })));

        let narrow = VelocityScan {
            channel_window: 2,
            ..scan.clone()
        };
        assert!(matches!(
            narrow.scan(&section),
            Err(DasError::InvalidParameter { parameter: "channel_window", .. })
        ));
    }

    #[test]
    fn test_plane_wave_scenario() {
        let mut section = plane_wave_section(10, 1000, 0.1, 42);
        CommonModeRemoval::default().filter(&mut section).unwrap();
        RankReduction::default().filter(&mut section).unwrap();
        let attribute = full_record_scan().scan(&section).unwrap();
        let velocities = attribute.channel_velocities();
        for c in 2..8 {
            let error = (velocities[c] - VELOCITY).abs() / VELOCITY;
            assert!(error <= 0.05, "channel {c}: {}", velocities[c]);
        }
    }

    #[test]
    fn test_channel_check_finds_weak_and_dead_channels() {
        let mut data = plane_wave(20, 1000, VELOCITY, 0.1, 9);
        data.row_mut(7).fill(0.0);
        data.row_mut(12).mapv_inplace(|x| x * 0.01);
        let mut section = section_from(data, SAMPLING_RATE, CHANNEL_SPACING);
        let check = ChannelCheck {
            degree: 3,
            continuity: false,
            ..ChannelCheck::default()
        };
        let report = check.apply(&mut section).unwrap();
        assert_eq!(report.bad, vec![7, 12]);
        assert_eq!(report.good.len(), 18);
        assert!(report.energy[12] < report.threshold[12]);
        assert_eq!(section.quality().unwrap()[12], ChannelQuality::Bad);
        assert_eq!(section.good_channels().len(), 18);
    }

    #[test]
    fn test_continuity_reinstates_isolated_channel() {
        // four weak channels out of 40 stay a minority for the robust fit
        let mut data = plane_wave(40, 1000, VELOCITY, 0.1, 9);
        data.row_mut(3).mapv_inplace(|x| x * 0.01);
        for c in 20..23 {
            data.row_mut(c).mapv_inplace(|x| x * 0.01);
        }
        let section = section_from(data, SAMPLING_RATE, CHANNEL_SPACING);
        let check = ChannelCheck {
            degree: 3,
            ..ChannelCheck::default()
        };

        let plain = ChannelCheck {
            continuity: false,
            ..check
        }
        .check(&section)
        .unwrap();
        for c in [3, 20, 21, 22] {
            assert!(plain.bad.contains(&c), "channel {c} not flagged: {:?}", plain.bad);
        }

        let report = check.check(&section).unwrap();
        assert_eq!(report.bad, vec![20, 21, 22]);
    }

    #[test]
    fn test_polyfit_recovers_cubic() {
        let x = Array1::linspace(-1.0, 1.0, 21);
        let y = x.mapv(|v: f64| 0.5 - 2.0 * v + 0.25 * v.powi(3));
        let mut weights = Array1::ones(21);
        weights[4] = 0.0;
        weights[15] = 0.0;
        let mut corrupted = y.clone();
        corrupted[4] = 100.0;
        corrupted[15] = -100.0;
        let fit = polyfit(&x, &corrupted, &weights, 3).unwrap();
        for (a, b) in fit.iter().zip(y.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_turning_point_at_polarity_flip() {
        let mut data = plane_wave(16, 1000, VELOCITY, 0.05, 5);
        for c in 8..16 {
            data.row_mut(c).mapv_inplace(|x| -x);
        }
        let section = section_from(data, SAMPLING_RATE, CHANNEL_SPACING);
        assert_eq!(turning_points(&section, 5.0), vec![7.5]);
    }

    #[test]
    fn test_channel_velocities_ignore_invalid_windows() {
        let attribute = ApparentVelocity {
            velocity: ndarray::array![[f64::NAN, 1000.0, 3000.0, 2000.0], [f64::NAN; 4]],
            coherence: Array2::zeros((2, 4)),
            window_times: Array1::zeros(4),
            window_length: 0.1,
        };
        let velocities = attribute.channel_velocities();
        assert_abs_diff_eq!(velocities[0], 2000.0);
        assert!(velocities[1].is_nan());
    }
}
