//! Numerical helpers shared by all processing stages: window functions and
//! tapers, detrending, padding, normalization, channel stacking, discrete
//! integration / differentiation and robust statistics.
//!
//! Everything operating on a 2-D matrix assumes the section layout used
//! throughout the crate: rows are channels, columns are time samples.

use crate::error::{DasError, Result};
use interp1d::Interp1d;
use ndarray::{s, Array1, Array2, ArrayViewMut1, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt::{Display, Formatter};

/// Window shapes available for tapers and FIR design.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum WindowType {
    /// Tapered cosine window; the taper fraction sets the cosine part.
    Tukey,
    /// Flat window whose beginning and end are shaped by half Blackman windows.
    AdaptedBlackman,
    /// Original Blackman window
    Blackman,
    /// Hanning window
    Hanning,
    /// Hamming window
    Hamming,
    /// FlatTop
    FlatTop,
    /// No weighting
    Rectangular,
}

impl Display for WindowType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowType::Tukey => write!(f, "Tukey"),
            WindowType::AdaptedBlackman => write!(f, "Adapted Blackman"),
            WindowType::Blackman => write!(f, "Blackman"),
            WindowType::Hanning => write!(f, "Hanning"),
            WindowType::Hamming => write!(f, "Hamming"),
            WindowType::FlatTop => write!(f, "Flat Top"),
            WindowType::Rectangular => write!(f, "Rectangular"),
        }
    }
}

/// Computes the Blackman window value for a given sample.
///
/// Follows the numpy definition and clamps to [0.0, 1.0]. A zero-length window
/// (`m == 0`) yields 1.0.
fn blackman_window(n: f64, m: f64) -> f64 {
    let res = 0.42 - 0.5 * (2.0 * PI * n / m).cos() + 0.08 * (4.0 * PI * n / m).cos();
    if res.is_nan() {
        1.0
    } else {
        res.clamp(0.0, 1.0)
    }
}

/// Symmetric Tukey window of length `n` (scipy convention).
///
/// `alpha <= 0` gives a rectangular window, `alpha >= 1` a Hann window.
pub fn tukey(n: usize, alpha: f64) -> Array1<f64> {
    if n == 0 {
        return Array1::zeros(0);
    }
    if n == 1 || alpha <= 0.0 {
        return Array1::ones(n);
    }
    if alpha >= 1.0 {
        return window(WindowType::Hanning, n);
    }
    let m = (n - 1) as f64;
    let width = (alpha * m / 2.0).floor() as usize;
    Array1::from_shape_fn(n, |i| {
        let x = i as f64;
        if i <= width {
            0.5 * (1.0 + (PI * (-1.0 + 2.0 * x / (alpha * m))).cos())
        } else if i >= n - width - 1 {
            0.5 * (1.0 + (PI * (-2.0 / alpha + 1.0 + 2.0 * x / (alpha * m))).cos())
        } else {
            1.0
        }
    })
}

/// Full-length symmetric window of the given type.
///
/// `Tukey` uses `alpha = 0.5` and `AdaptedBlackman` tapers 10 % at each end;
/// use [`edge_taper`] to control the tapered fraction explicitly.
pub fn window(kind: WindowType, n: usize) -> Array1<f64> {
    if n <= 1 {
        return Array1::ones(n);
    }
    let m = (n - 1) as f64;
    let cosine_sum = |a: &[f64]| {
        Array1::from_shape_fn(n, |i| {
            let x = 2.0 * PI * i as f64 / m;
            a.iter()
                .enumerate()
                .map(|(k, ak)| {
                    let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
                    sign * ak * (k as f64 * x).cos()
                })
                .sum::<f64>()
        })
    };
    match kind {
        WindowType::Tukey => tukey(n, 0.5),
        WindowType::AdaptedBlackman => edge_taper(kind, n, 0.2),
        WindowType::Blackman => cosine_sum(&[0.42, 0.5, 0.08]),
        WindowType::Hanning => cosine_sum(&[0.5, 0.5]),
        WindowType::Hamming => cosine_sum(&[0.54, 0.46]),
        WindowType::FlatTop => cosine_sum(&[
            0.215_578_95,
            0.416_631_58,
            0.277_263_158,
            0.083_578_947,
            0.006_947_368,
        ]),
        WindowType::Rectangular => Array1::ones(n),
    }
}

/// Taper of length `n` where `fraction` of the samples (split over both ends)
/// are attenuated.
///
/// Window types without a notion of a flat part (`Hanning`, `Hamming`,
/// `Blackman`, `FlatTop`) are applied over the full length whenever the
/// fraction is non-zero.
pub fn edge_taper(kind: WindowType, n: usize, fraction: f64) -> Array1<f64> {
    if fraction <= 0.0 || n <= 1 {
        return Array1::ones(n);
    }
    match kind {
        WindowType::Tukey => tukey(n, fraction),
        WindowType::AdaptedBlackman => {
            // half Blackman ramps of `edge` samples at both ends
            let edge = (fraction.min(1.0) * (n - 1) as f64 / 2.0).round();
            let last = (n - 1) as f64;
            Array1::from_shape_fn(n, |i| {
                let t = i as f64;
                if t <= edge {
                    blackman_window(t, 2.0 * edge)
                } else if t >= last - edge {
                    blackman_window(t - (last - 2.0 * edge), 2.0 * edge)
                } else {
                    1.0
                }
            })
        }
        WindowType::Rectangular => Array1::ones(n),
        other => window(other, n),
    }
}

/// Two-axis taper applied before spectral transforms.
///
/// Fractions are the total tapered share of each axis (half at each end).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaperConfig {
    pub channel_fraction: f64,
    pub time_fraction: f64,
    pub window: WindowType,
}

impl Default for TaperConfig {
    fn default() -> Self {
        TaperConfig {
            channel_fraction: 0.02,
            time_fraction: 0.05,
            window: WindowType::Tukey,
        }
    }
}

impl TaperConfig {
    /// A taper that leaves the data untouched.
    pub fn none() -> Self {
        TaperConfig {
            channel_fraction: 0.0,
            time_fraction: 0.0,
            window: WindowType::Rectangular,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (parameter, value) in [
            ("channel_fraction", self.channel_fraction),
            ("time_fraction", self.time_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DasError::InvalidParameter {
                    parameter,
                    value,
                    constraint: "taper fraction must lie in [0, 1]",
                });
            }
        }
        Ok(())
    }
}

/// Multiplies `data` with the separable taper described by `taper`.
pub fn apply_taper(data: &mut Array2<f64>, taper: &TaperConfig) {
    let (n_channels, n_samples) = data.dim();
    let channel_window = edge_taper(taper.window, n_channels, taper.channel_fraction);
    let time_window = edge_taper(taper.window, n_samples, taper.time_fraction);
    Zip::from(data.axis_iter_mut(Axis(0)))
        .and(&channel_window)
        .par_for_each(|mut row, &wc| {
            Zip::from(&mut row).and(&time_window).for_each(|x, &wt| {
                *x *= wc * wt;
            });
        });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetrendType {
    /// Remove the mean of each channel.
    Constant,
    /// Remove a least-squares line from each channel.
    Linear,
}

/// Detrends one trace in place.
pub fn detrend_trace(trace: &mut ArrayViewMut1<f64>, kind: DetrendType) {
    let n = trace.len();
    if n == 0 {
        return;
    }
    let mean = trace.sum() / n as f64;
    match kind {
        DetrendType::Constant => trace.mapv_inplace(|x| x - mean),
        DetrendType::Linear => {
            let t_mean = (n - 1) as f64 / 2.0;
            let mut sxy = 0.0;
            let mut sxx = 0.0;
            for (i, x) in trace.iter().enumerate() {
                let dt = i as f64 - t_mean;
                sxy += dt * (x - mean);
                sxx += dt * dt;
            }
            let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
            for (i, x) in trace.iter_mut().enumerate() {
                *x -= mean + slope * (i as f64 - t_mean);
            }
        }
    }
}

/// Detrends every channel of `data` in place.
pub fn detrend(data: &mut Array2<f64>, kind: DetrendType) {
    Zip::from(data.axis_iter_mut(Axis(0))).par_for_each(|mut row| detrend_trace(&mut row, kind));
}

pub fn next_pow_2(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// Zero pads `data` with `dn = (channels, samples)` extra points, half before
/// (rounded down) and the rest after.
pub fn pad(data: &Array2<f64>, dn: (usize, usize)) -> Array2<f64> {
    let (n_channels, n_samples) = data.dim();
    let (c0, t0) = (dn.0 / 2, dn.1 / 2);
    let mut padded = Array2::zeros((n_channels + dn.0, n_samples + dn.1));
    padded
        .slice_mut(s![c0..c0 + n_channels, t0..t0 + n_samples])
        .assign(data);
    padded
}

/// Reverses [`pad`].
pub fn unpad(data: &Array2<f64>, dn: (usize, usize)) -> Array2<f64> {
    let (n_channels, n_samples) = data.dim();
    let (c0, t0) = (dn.0 / 2, dn.1 / 2);
    let (c1, t1) = (dn.0 - c0, dn.1 - t0);
    data.slice(s![c0..n_channels - c1, t0..n_samples - t1])
        .to_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Normalization {
    /// Divide each channel by its maximum absolute amplitude.
    Max,
    /// Subtract the mean and divide by the standard deviation per channel.
    ZScore,
}

/// Normalizes each channel in place.
///
/// Channels with zero amplitude are divided by the smallest non-zero scale of
/// the other channels so that dead channels stay finite.
pub fn normalize(data: &mut Array2<f64>, kind: Normalization) {
    let (offsets, mut scales): (Vec<f64>, Vec<f64>) = data
        .axis_iter(Axis(0))
        .map(|row| match kind {
            Normalization::Max => (0.0, row.iter().fold(0.0_f64, |a, x| a.max(x.abs()))),
            Normalization::ZScore => {
                let n = row.len().max(1) as f64;
                let mean = row.sum() / n;
                let var = row.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
                (mean, var.sqrt())
            }
        })
        .unzip();
    let smallest = scales
        .iter()
        .copied()
        .filter(|s| *s > 0.0)
        .fold(f64::INFINITY, f64::min);
    let fallback = if smallest.is_finite() { smallest } else { 1.0 };
    for s in scales.iter_mut().filter(|s| **s == 0.0) {
        *s = fallback;
    }
    for ((mut row, offset), scale) in data.axis_iter_mut(Axis(0)).zip(offsets).zip(scales) {
        row.mapv_inplace(|x| (x - offset) / scale);
    }
}

/// Averages `n` adjacent channels every `step` channels.
pub fn stack_channels(data: &Array2<f64>, n: usize, step: usize) -> Result<Array2<f64>> {
    if n == 0 || step == 0 {
        return Err(DasError::InvalidParameter {
            parameter: if n == 0 { "n" } else { "step" },
            value: 0.0,
            constraint: "stacking needs at least one channel and a positive step",
        });
    }
    let (n_channels, n_samples) = data.dim();
    if n > n_channels {
        return Err(DasError::InsufficientData {
            what: "channel stacking",
            required: n,
            available: n_channels,
        });
    }
    let begins: Vec<usize> = (0..=n_channels - n).step_by(step).collect();
    let mut stacked = Array2::zeros((begins.len(), n_samples));
    for (mut out, &b) in stacked.axis_iter_mut(Axis(0)).zip(begins.iter()) {
        if let Some(mean) = data.slice(s![b..b + n, ..]).mean_axis(Axis(0)) {
            out.assign(&mean);
        }
    }
    Ok(stacked)
}

/// Discrete integration rule with an exact discrete inverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrationRule {
    /// `y[i] = y[i-1] + h x[i]`
    Rectangle,
    /// `y[i] = y[i-1] + h (x[i] + x[i-1]) / 2` with an implicit zero before
    /// the first sample.
    Trapezoid,
}

fn integrate_lane(lane: &mut ArrayViewMut1<f64>, step: f64, rule: IntegrationRule) {
    let mut acc = 0.0;
    let mut prev = 0.0;
    for x in lane.iter_mut() {
        let current = *x;
        acc += match rule {
            IntegrationRule::Rectangle => step * current,
            IntegrationRule::Trapezoid => 0.5 * step * (current + prev),
        };
        prev = current;
        *x = acc;
    }
}

fn differentiate_lane(lane: &mut ArrayViewMut1<f64>, step: f64, rule: IntegrationRule) {
    let mut prev_y = 0.0;
    let mut prev_x = 0.0;
    for y in lane.iter_mut() {
        let current = *y;
        let x = match rule {
            IntegrationRule::Rectangle => (current - prev_y) / step,
            IntegrationRule::Trapezoid => 2.0 * (current - prev_y) / step - prev_x,
        };
        prev_y = current;
        prev_x = x;
        *y = x;
    }
}

/// Cumulative integral along `axis` with sample interval `step`.
pub fn integrate(data: &mut Array2<f64>, axis: Axis, step: f64, rule: IntegrationRule) {
    Zip::from(data.lanes_mut(axis)).par_for_each(|mut lane| integrate_lane(&mut lane, step, rule));
}

/// Exact discrete inverse of [`integrate`] with the same rule.
pub fn differentiate(data: &mut Array2<f64>, axis: Axis, step: f64, rule: IntegrationRule) {
    Zip::from(data.lanes_mut(axis))
        .par_for_each(|mut lane| differentiate_lane(&mut lane, step, rule));
}

/// Shape-preserving numerical derivative along `axis` (central differences in
/// the interior, one-sided at the ends, like `numpy.gradient`).
pub fn gradient(data: &Array2<f64>, axis: Axis, step: f64) -> Array2<f64> {
    let mut out = Array2::zeros(data.dim());
    Zip::from(out.lanes_mut(axis))
        .and(data.lanes(axis))
        .par_for_each(|mut o, x| {
            let n = x.len();
            if n < 2 {
                return;
            }
            o[0] = (x[1] - x[0]) / step;
            o[n - 1] = (x[n - 1] - x[n - 2]) / step;
            for i in 1..n - 1 {
                o[i] = (x[i + 1] - x[i - 1]) / (2.0 * step);
            }
        });
    out
}

/// Median of the finite values (numpy convention for even lengths). `NaN` if
/// there are none.
pub fn median(values: &[f64]) -> f64 {
    percentile(values, 50.0)
}

/// Linear-interpolation percentile (`q` in [0, 100]) of the finite values.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return f64::NAN;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Median absolute deviation around the median.
pub fn median_absolute_deviation(values: &[f64]) -> f64 {
    let m = median(values);
    let deviations: Vec<f64> = values.iter().map(|v| (v - m).abs()).collect();
    median(&deviations)
}

/// Fills `NaN` entries by linear interpolation between the nearest finite
/// neighbours; leading and trailing gaps take the nearest finite value.
///
/// Returns `None` if no entry is finite.
pub fn fill_invalid(values: &Array1<f64>) -> Option<Array1<f64>> {
    let valid: Vec<usize> = values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .map(|(i, _)| i)
        .collect();
    let (&first, &last) = (valid.first()?, valid.last()?);
    if first == last {
        return Some(Array1::from_elem(values.len(), values[first]));
    }
    let x: Vec<f64> = valid.iter().map(|&i| i as f64).collect();
    let y: Vec<f64> = valid.iter().map(|&i| values[i]).collect();
    let interpolator = Interp1d::new_unsorted(x, y).ok()?;
    let filled = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            if v.is_finite() {
                *v
            } else {
                interpolator.interpolate((i as f64).clamp(first as f64, last as f64))
            }
        })
        .collect();
    Some(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_tukey_matches_reference_values() {
        // scipy.signal.windows.tukey(8, 0.5)
        let w = tukey(8, 0.5);
        let expected = [0.0, 0.61126047, 1.0, 1.0, 1.0, 1.0, 0.61126047, 0.0];
        for (a, b) in w.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-7);
        }
        assert_eq!(tukey(5, 0.0), Array1::<f64>::ones(5));
    }

    #[test]
    fn test_windows_are_symmetric_and_peak_at_centre() {
        for kind in [
            WindowType::Blackman,
            WindowType::Hanning,
            WindowType::Hamming,
            WindowType::FlatTop,
            WindowType::AdaptedBlackman,
        ] {
            let w = window(kind, 33);
            for i in 0..33 {
                assert_abs_diff_eq!(w[i], w[32 - i], epsilon = 1e-12);
            }
            assert_abs_diff_eq!(w[16], 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_adapted_blackman_keeps_flat_centre() {
        let w = edge_taper(WindowType::AdaptedBlackman, 101, 0.2);
        assert_abs_diff_eq!(w[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(w[100], 0.0, epsilon = 1e-12);
        assert!(w.slice(s![10..=90]).iter().all(|&x| (x - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_linear_detrend_removes_ramp() {
        let mut data = Array2::from_shape_fn((2, 50), |(c, t)| 3.0 * c as f64 + 0.5 * t as f64);
        detrend(&mut data, DetrendType::Linear);
        assert!(data.iter().all(|x| x.abs() < 1e-10));
    }

    #[test]
    fn test_pad_unpad_round_trip() {
        let data = Array2::from_shape_fn((3, 5), |(c, t)| (c * 10 + t) as f64);
        let padded = pad(&data, (5, 3));
        assert_eq!(padded.dim(), (8, 8));
        assert_eq!(padded[[2, 1]], 0.0);
        assert_eq!(unpad(&padded, (5, 3)), data);
    }

    #[test]
    fn test_normalize_handles_dead_channel() {
        let mut data = array![[0.0, 2.0, -4.0], [0.0, 0.0, 0.0], [1.0, -1.0, 0.5]];
        normalize(&mut data, Normalization::Max);
        assert_abs_diff_eq!(data[[0, 2]], -1.0);
        assert!(data.row(1).iter().all(|x| *x == 0.0));
        assert_abs_diff_eq!(data[[2, 0]], 1.0);
    }

    #[test]
    fn test_stack_channels_averages_groups() {
        let data = Array2::from_shape_fn((5, 2), |(c, _)| c as f64);
        let stacked = stack_channels(&data, 2, 2).unwrap();
        assert_eq!(stacked, array![[0.5, 0.5], [2.5, 2.5]]);
        assert!(matches!(
            stack_channels(&data, 6, 1),
            Err(DasError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_integration_rules_have_exact_inverse() {
        let original = Array2::from_shape_fn((3, 40), |(c, t)| ((c + 1) as f64 * 0.3 * t as f64).sin());
        for rule in [IntegrationRule::Rectangle, IntegrationRule::Trapezoid] {
            for axis in [Axis(0), Axis(1)] {
                let mut data = original.clone();
                integrate(&mut data, axis, 0.01, rule);
                differentiate(&mut data, axis, 0.01, rule);
                for (a, b) in data.iter().zip(original.iter()) {
                    assert_abs_diff_eq!(a, b, epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_gradient_of_linear_ramp_is_constant() {
        let data = Array2::from_shape_fn((2, 10), |(_, t)| 2.0 * t as f64);
        let g = gradient(&data, Axis(1), 0.5);
        assert!(g.iter().all(|x| (x - 4.0).abs() < 1e-12));
    }

    #[test]
    fn test_robust_statistics() {
        assert_abs_diff_eq!(median(&[3.0, 1.0, 2.0, 10.0]), 2.5);
        assert_abs_diff_eq!(percentile(&[0.0, 10.0], 25.0), 2.5);
        assert_abs_diff_eq!(median_absolute_deviation(&[1.0, 2.0, 3.0, 100.0]), 1.0);
        assert!(median(&[f64::NAN]).is_nan());
    }

    #[test]
    fn test_fill_invalid_interpolates_and_extends() {
        let v = array![f64::NAN, 1.0, f64::NAN, 3.0, f64::NAN];
        let filled = fill_invalid(&v).unwrap();
        for (a, b) in filled.iter().zip([1.0, 1.0, 2.0, 3.0, 3.0].iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        assert_eq!(fill_invalid(&array![f64::NAN, 4.0]).unwrap(), array![4.0, 4.0]);
        assert!(fill_invalid(&array![f64::NAN]).is_none());
    }
}
