//! Synthetic sections shared by the unit tests.

use crate::data_container::Section;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;

pub const SAMPLING_RATE: f64 = 1000.0;
pub const CHANNEL_SPACING: f64 = 10.0;
pub const VELOCITY: f64 = 2000.0;
pub const PEAK_FREQUENCY: f64 = 25.0;

/// Ricker wavelet with peak frequency `f0` centred at `t = 0`.
pub fn ricker(t: f64, f0: f64) -> f64 {
    let a = (PI * f0 * t).powi(2);
    (1.0 - 2.0 * a) * (-a).exp()
}

/// Ricker pulses travelling toward increasing channel index at `velocity`
/// (negative velocities travel the other way), plus Gaussian noise.
///
/// Pulses leave the source-side channel at 0.15 s, 0.4 s and 0.65 s.
pub fn plane_wave(
    n_channels: usize,
    n_samples: usize,
    velocity: f64,
    noise: f64,
    seed: u64,
) -> Array2<f64> {
    let arrivals = [0.15, 0.4, 0.65];
    let mut data = Array2::from_shape_fn((n_channels, n_samples), |(c, t)| {
        let t = t as f64 / SAMPLING_RATE;
        let offset = if velocity > 0.0 { c } else { n_channels - 1 - c };
        let delay = offset as f64 * CHANNEL_SPACING / velocity.abs();
        arrivals
            .iter()
            .map(|t0| ricker(t - t0 - delay, PEAK_FREQUENCY))
            .sum()
    });
    if noise > 0.0 {
        let mut rng = StdRng::seed_from_u64(seed);
        if let Ok(normal) = Normal::new(0.0, noise) {
            data.mapv_inplace(|x| x + normal.sample(&mut rng));
        }
    }
    data
}

pub fn section_from(data: Array2<f64>, sampling_rate: f64, channel_spacing: f64) -> Section {
    Section::from_array(data, sampling_rate, channel_spacing).unwrap()
}

/// Strain-rate section of a plane wave at [`VELOCITY`] m/s.
pub fn plane_wave_section(n_channels: usize, n_samples: usize, noise: f64, seed: u64) -> Section {
    section_from(
        plane_wave(n_channels, n_samples, VELOCITY, noise, seed),
        SAMPLING_RATE,
        CHANNEL_SPACING,
    )
}
