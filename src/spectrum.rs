//! Spectral representations of a section.
//!
//! [`TimeSpectrum`] holds the per-channel real FFT, [`FkSpectrum`] the 2-D
//! frequency-wavenumber transform. Both are transient: they are built from a
//! data matrix, modified, and transformed back.

use crate::error::Result;
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, Axis, Zip};
use num_complex::Complex64;
use realfft::RealFftPlanner;
use rustfft::FftPlanner;

/// Sample frequencies of a length-`n` DFT with sample spacing `d` (numpy
/// `fftfreq` ordering: non-negative frequencies first).
pub fn fftfreq(n: usize, d: f64) -> Array1<f64> {
    let scale = 1.0 / (n as f64 * d);
    Array1::from_shape_fn(n, |i| {
        if i < n.div_ceil(2) {
            i as f64 * scale
        } else {
            (i as f64 - n as f64) * scale
        }
    })
}

/// Non-negative frequencies of a length-`n` real FFT with sample spacing `d`.
pub fn rfftfreq(n: usize, d: f64) -> Array1<f64> {
    let scale = 1.0 / (n as f64 * d);
    Array1::from_shape_fn(n / 2 + 1, |i| i as f64 * scale)
}

/// Per-channel real FFT of a `channels × samples` matrix.
#[derive(Debug, Clone)]
pub struct TimeSpectrum {
    /// Frequency axis in Hz.
    pub frequencies: Array1<f64>,
    /// `channels × (samples / 2 + 1)` complex spectrum.
    pub data: Array2<Complex64>,
    n_samples: usize,
}

impl TimeSpectrum {
    pub fn forward(data: &Array2<f64>, sampling_rate: f64) -> Result<TimeSpectrum> {
        let (n_channels, n_samples) = data.dim();
        let mut planner = RealFftPlanner::<f64>::new();
        let r2c = planner.plan_fft_forward(n_samples);
        let mut spectrum = Array2::zeros((n_channels, n_samples / 2 + 1));
        data.axis_iter(Axis(0))
            .into_par_iter()
            .zip(spectrum.axis_iter_mut(Axis(0)).into_par_iter())
            .try_for_each(|(row, mut out)| -> Result<()> {
                let mut input = row.to_vec();
                let mut output = r2c.make_output_vec();
                r2c.process(&mut input, &mut output)?;
                out.assign(&Array1::from_vec(output));
                Ok(())
            })?;
        Ok(TimeSpectrum {
            frequencies: rfftfreq(n_samples, 1.0 / sampling_rate),
            data: spectrum,
            n_samples,
        })
    }

    /// Builds a spectrum of a `n_samples` long signal from its one-sided bins.
    pub fn from_parts(data: Array2<Complex64>, sampling_rate: f64, n_samples: usize) -> TimeSpectrum {
        TimeSpectrum {
            frequencies: rfftfreq(n_samples, 1.0 / sampling_rate),
            data,
            n_samples,
        }
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Inverse transform back to a real `channels × samples` matrix.
    pub fn inverse(&self) -> Result<Array2<f64>> {
        let n_samples = self.n_samples;
        let mut planner = RealFftPlanner::<f64>::new();
        let c2r = planner.plan_fft_inverse(n_samples);
        let mut out = Array2::zeros((self.data.nrows(), n_samples));
        let norm = 1.0 / n_samples as f64;
        self.data
            .axis_iter(Axis(0))
            .into_par_iter()
            .zip(out.axis_iter_mut(Axis(0)).into_par_iter())
            .try_for_each(|(row, mut out)| -> Result<()> {
                let mut spectrum = row.to_vec();
                hermitian_edges(&mut spectrum, n_samples);
                let mut output = c2r.make_output_vec();
                c2r.process(&mut spectrum, &mut output)?;
                out.assign(&Array1::from_vec(output).mapv(|x| x * norm));
                Ok(())
            })?;
        Ok(out)
    }
}

/// The DC bin (and Nyquist bin for even lengths) of a real signal's spectrum
/// must be real for the inverse real FFT.
fn hermitian_edges(spectrum: &mut [Complex64], n_samples: usize) {
    if let Some(first) = spectrum.first_mut() {
        first.im = 0.0;
    }
    if n_samples % 2 == 0 {
        if let Some(last) = spectrum.last_mut() {
            last.im = 0.0;
        }
    }
}

/// 2-D frequency-wavenumber spectrum.
///
/// Rows follow the wavenumber axis in `fftfreq` order, columns the
/// non-negative frequencies. Negative frequencies are implied by Hermitian
/// symmetry: the value at `(-f, -k)` is the conjugate of `(f, k)`.
#[derive(Debug, Clone)]
pub struct FkSpectrum {
    /// Frequency axis in Hz (non-negative).
    pub frequencies: Array1<f64>,
    /// Wavenumber axis in cycles per metre.
    pub wavenumbers: Array1<f64>,
    /// `wavenumbers × frequencies` complex spectrum.
    pub data: Array2<Complex64>,
    n_samples: usize,
}

impl FkSpectrum {
    pub fn forward(
        data: &Array2<f64>,
        sampling_rate: f64,
        channel_spacing: f64,
    ) -> Result<FkSpectrum> {
        let n_channels = data.nrows();
        let time = TimeSpectrum::forward(data, sampling_rate)?;
        let mut spectrum = time.data;
        let fft = FftPlanner::<f64>::new().plan_fft_forward(n_channels);
        Zip::from(spectrum.columns_mut()).par_for_each(|mut column| {
            let mut buffer = column.to_vec();
            fft.process(&mut buffer);
            column.assign(&Array1::from_vec(buffer));
        });
        let spacing = if channel_spacing > 0.0 { channel_spacing } else { 1.0 };
        Ok(FkSpectrum {
            frequencies: time.frequencies,
            wavenumbers: fftfreq(n_channels, spacing),
            data: spectrum,
            n_samples: time.n_samples,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Apparent velocity `-f / k` of every bin, `f64::INFINITY` at `k = 0`.
    ///
    /// Positive velocities belong to energy propagating toward increasing
    /// channel index.
    pub fn velocities(&self) -> Array2<f64> {
        Array2::from_shape_fn(self.data.dim(), |(i, j)| {
            let k = self.wavenumbers[i];
            if k == 0.0 {
                f64::INFINITY
            } else {
                -self.frequencies[j] / k
            }
        })
    }

    /// Amplitude spectrum, e.g. for visualisation.
    pub fn amplitudes(&self) -> Array2<f64> {
        self.data.mapv(|c| c.norm())
    }

    /// Inverse transform back to a real `channels × samples` matrix.
    pub fn inverse(&self) -> Result<Array2<f64>> {
        let n_channels = self.data.nrows();
        let mut spectrum = self.data.clone();
        let ifft = FftPlanner::<f64>::new().plan_fft_inverse(n_channels);
        let norm = 1.0 / n_channels as f64;
        Zip::from(spectrum.columns_mut()).par_for_each(|mut column| {
            let mut buffer = column.to_vec();
            ifft.process(&mut buffer);
            column.assign(&Array1::from_vec(buffer).mapv(|c| c * norm));
        });
        TimeSpectrum {
            frequencies: self.frequencies.clone(),
            data: spectrum,
            n_samples: self.n_samples,
        }
        .inverse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    fn test_matrix(n_channels: usize, n_samples: usize) -> Array2<f64> {
        Array2::from_shape_fn((n_channels, n_samples), |(c, t)| {
            (0.07 * t as f64 + 0.4 * c as f64).sin() + 0.1 * ((c * t) % 7) as f64
        })
    }

    #[test]
    fn test_fftfreq_ordering() {
        let f = fftfreq(5, 0.5);
        let expected = [0.0, 0.4, 0.8, -0.8, -0.4];
        for (a, b) in f.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        assert_eq!(fftfreq(4, 1.0).to_vec(), vec![0.0, 0.25, -0.5, -0.25]);
        assert_eq!(rfftfreq(4, 0.25).to_vec(), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_time_spectrum_round_trip() {
        for n in [64, 65] {
            let data = test_matrix(4, n);
            let spectrum = TimeSpectrum::forward(&data, 100.0).unwrap();
            assert_eq!(spectrum.data.dim(), (4, n / 2 + 1));
            let back = spectrum.inverse().unwrap();
            for (a, b) in back.iter().zip(data.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_fk_spectrum_round_trip() {
        let data = test_matrix(7, 50);
        let spectrum = FkSpectrum::forward(&data, 200.0, 4.0).unwrap();
        assert_eq!(spectrum.data.dim(), (7, 26));
        let back = spectrum.inverse().unwrap();
        for (a, b) in back.iter().zip(data.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_plane_wave_energy_has_velocity_sign() {
        // x(t, c) = cos(2π (f t - k x)) propagates toward increasing channel index
        let (fs, dx) = (64.0, 1.0);
        let (f0, k0) = (8.0, 0.125);
        let data = Array2::from_shape_fn((16, 64), |(c, t)| {
            (2.0 * PI * (f0 * t as f64 / fs - k0 * c as f64 * dx)).cos()
        });
        let spectrum = FkSpectrum::forward(&data, fs, dx).unwrap();
        let amplitudes = spectrum.amplitudes();
        let (mut best, mut idx) = (0.0, (0, 0));
        for ((i, j), a) in amplitudes.indexed_iter() {
            if *a > best {
                best = *a;
                idx = (i, j);
            }
        }
        assert_abs_diff_eq!(spectrum.frequencies[idx.1], f0, epsilon = 1e-12);
        assert_abs_diff_eq!(spectrum.wavenumbers[idx.0], -k0, epsilon = 1e-12);
        assert_abs_diff_eq!(spectrum.velocities()[idx], f0 / k0, epsilon = 1e-9);
    }
}
