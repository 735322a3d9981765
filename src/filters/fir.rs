//! Windowed-sinc FIR design and zero-phase FIR filtering.

use crate::error::{DasError, Result};
use crate::filters::iir::odd_extension;
use crate::filters::time_domain::Band;
use crate::math_tools::{window, WindowType};
use ndarray::{Array1, ArrayViewMut2, Axis, Zip};
use std::f64::consts::PI;

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Designs a linear-phase FIR kernel with `taps` coefficients.
///
/// The passband gain is normalised to one at DC for low-pass and band-stop
/// designs, at Nyquist for high-pass and at the band centre for band-pass.
pub fn firwin(taps: usize, band: &Band, sampling_rate: f64, kind: WindowType) -> Result<Array1<f64>> {
    if taps == 0 {
        return Err(DasError::FilterDesign {
            parameter: "taps",
            value: 0.0,
            constraint: "FIR filter needs at least one tap".to_string(),
        });
    }
    band.validate(sampling_rate)?;
    let nyquist = sampling_rate / 2.0;
    let passes_nyquist = matches!(band, Band::Highpass { .. } | Band::Bandstop { .. });
    if passes_nyquist && taps % 2 == 0 {
        return Err(DasError::FilterDesign {
            parameter: "taps",
            value: taps as f64,
            constraint: "high-pass and band-stop FIR filters need an odd number of taps"
                .to_string(),
        });
    }
    let bands: Vec<(f64, f64)> = match *band {
        Band::Lowpass { freq } => vec![(0.0, freq / nyquist)],
        Band::Highpass { freq } => vec![(freq / nyquist, 1.0)],
        Band::Bandpass { low, high } => vec![(low / nyquist, high / nyquist)],
        Band::Bandstop { low, high } => vec![(0.0, low / nyquist), (high / nyquist, 1.0)],
    };

    let centre = (taps - 1) as f64 / 2.0;
    let mut h = Array1::from_shape_fn(taps, |i| {
        let m = i as f64 - centre;
        bands
            .iter()
            .map(|(left, right)| right * sinc(right * m) - left * sinc(left * m))
            .sum::<f64>()
    });
    h *= &window(kind, taps);

    let (left, right) = bands[0];
    let reference = if left == 0.0 {
        0.0
    } else if right == 1.0 {
        1.0
    } else {
        0.5 * (left + right)
    };
    let gain: f64 = h
        .iter()
        .enumerate()
        .map(|(i, c)| c * (PI * (i as f64 - centre) * reference).cos())
        .sum();
    Ok(h / gain)
}

/// Correlates `x` with the kernel centred at `centre`; samples outside the
/// (extended) trace count as zero.
fn centred_convolution(h: &Array1<f64>, x: &[f64], edge: usize, n: usize, centre: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            h.iter()
                .enumerate()
                .filter_map(|(j, c)| {
                    (i + edge + j)
                        .checked_sub(centre)
                        .and_then(|idx| x.get(idx))
                        .map(|v| c * v)
                })
                .sum()
        })
        .collect()
}

/// Zero-phase FIR filtering of one trace.
///
/// Odd kernels are applied once, centred on each sample. Even kernels have a
/// half-sample centre and are run forward and backward so the shifts cancel.
pub fn fir_filter_trace(h: &Array1<f64>, x: &[f64]) -> Vec<f64> {
    let n = x.len();
    let taps = h.len();
    if n == 0 || taps == 0 {
        return x.to_vec();
    }
    let edge = taps.min(n - 1);
    let centre = (taps - 1) / 2;
    let ext = odd_extension(x, edge);
    let forward = centred_convolution(h, &ext, edge, n, centre);
    if taps % 2 == 1 {
        return forward;
    }
    let mut reversed = forward;
    reversed.reverse();
    let ext = odd_extension(&reversed, edge);
    let mut backward = centred_convolution(h, &ext, edge, n, centre);
    backward.reverse();
    backward
}

/// Zero-phase FIR filtering of every channel in place.
pub fn fir_filter(h: &Array1<f64>, mut data: ArrayViewMut2<'_, f64>) {
    Zip::from(data.axis_iter_mut(Axis(0))).par_for_each(|mut row| {
        let filtered = fir_filter_trace(h, &row.to_vec());
        for (x, y) in row.iter_mut().zip(filtered) {
            *x = y;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn response(h: &Array1<f64>, freq: f64, fs: f64) -> f64 {
        let w = 2.0 * PI * freq / fs;
        let (re, im) = h.iter().enumerate().fold((0.0, 0.0), |(re, im), (i, c)| {
            (re + c * (w * i as f64).cos(), im - c * (w * i as f64).sin())
        });
        (re * re + im * im).sqrt()
    }

    #[test]
    fn test_firwin_lowpass_reference() {
        // scipy.signal.firwin(5, 0.5)
        let h = firwin(5, &Band::Lowpass { freq: 25.0 }, 100.0, WindowType::Hamming).unwrap();
        let expected = [
            0.0,
            0.203_712_369_200_737_2,
            0.592_575_261_598_525_6,
            0.203_712_369_200_737_2,
            0.0,
        ];
        for (a, b) in h.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_firwin_band_shapes() {
        let fs = 1000.0;
        let bp = firwin(101, &Band::Bandpass { low: 50.0, high: 150.0 }, fs, WindowType::Hamming)
            .unwrap();
        assert_abs_diff_eq!(response(&bp, 100.0, fs), 1.0, epsilon = 1e-3);
        assert!(response(&bp, 300.0, fs) < 0.01);
        let hp = firwin(101, &Band::Highpass { freq: 100.0 }, fs, WindowType::Hamming).unwrap();
        assert!(response(&hp, 10.0, fs) < 0.01);
        assert_abs_diff_eq!(response(&hp, 400.0, fs), 1.0, epsilon = 1e-2);
    }

    #[test]
    fn test_even_taps_rejected_for_highpass() {
        let err = firwin(100, &Band::Highpass { freq: 10.0 }, 100.0, WindowType::Hamming);
        assert!(matches!(err, Err(DasError::FilterDesign { parameter: "taps", .. })));
    }

    #[test]
    fn test_zero_phase_keeps_symmetric_pulse_centred() {
        let mut pulse = vec![0.0; 201];
        pulse[100] = 1.0;
        for taps in [31, 32] {
            let h = firwin(taps, &Band::Lowpass { freq: 50.0 }, 1000.0, WindowType::Hamming)
                .unwrap();
            let y = fir_filter_trace(&h, &pulse);
            let peak = y
                .iter()
                .enumerate()
                .fold((0, f64::MIN), |best, (i, v)| if *v > best.1 { (i, *v) } else { best });
            assert_eq!(peak.0, 100);
            for k in 1..20 {
                assert_abs_diff_eq!(y[100 - k], y[100 + k], epsilon = 1e-12);
            }
        }
    }
}
