//! Butterworth IIR design and zero-phase second-order-section filtering.
//!
//! Design goes through the analog zero-pole-gain prototype, frequency
//! transformation, bilinear transform and pairing into second-order sections.
//! Sections are stored as `[b0, b1, b2, 1, a1, a2]`.

use crate::error::{DasError, Result};
use crate::filters::time_domain::Band;
use ndarray::{ArrayViewMut2, Axis, Zip};
use num_complex::Complex64;
use std::f64::consts::PI;

pub type Sos = [f64; 6];

struct Zpk {
    zeros: Vec<Complex64>,
    poles: Vec<Complex64>,
    gain: f64,
}

fn prod(values: &[Complex64]) -> Complex64 {
    values.iter().fold(Complex64::new(1.0, 0.0), |acc, v| acc * v)
}

/// Analog Butterworth prototype with cutoff 1 rad/s.
fn butter_prototype(order: usize) -> Zpk {
    let n = order as f64;
    let poles = (0..order)
        .map(|i| {
            let m = -(n - 1.0) + 2.0 * i as f64;
            -Complex64::from_polar(1.0, PI * m / (2.0 * n))
        })
        .collect();
    Zpk {
        zeros: vec![],
        poles,
        gain: 1.0,
    }
}

fn lp2lp(zpk: Zpk, wo: f64) -> Zpk {
    let degree = (zpk.poles.len() - zpk.zeros.len()) as i32;
    Zpk {
        zeros: zpk.zeros.iter().map(|z| z * wo).collect(),
        poles: zpk.poles.iter().map(|p| p * wo).collect(),
        gain: zpk.gain * wo.powi(degree),
    }
}

fn lp2hp(zpk: Zpk, wo: f64) -> Zpk {
    let degree = zpk.poles.len() - zpk.zeros.len();
    let neg_z: Vec<Complex64> = zpk.zeros.iter().map(|z| -z).collect();
    let neg_p: Vec<Complex64> = zpk.poles.iter().map(|p| -p).collect();
    let gain = zpk.gain * (prod(&neg_z) / prod(&neg_p)).re;
    let mut zeros: Vec<Complex64> = zpk.zeros.iter().map(|z| wo / z).collect();
    zeros.extend(std::iter::repeat(Complex64::new(0.0, 0.0)).take(degree));
    Zpk {
        zeros,
        poles: zpk.poles.iter().map(|p| wo / p).collect(),
        gain,
    }
}

fn split_roots(roots: &[Complex64], wo: f64) -> Vec<Complex64> {
    let mut out: Vec<Complex64> = roots
        .iter()
        .map(|r| r + (r * r - wo * wo).sqrt())
        .collect();
    out.extend(roots.iter().map(|r| r - (r * r - wo * wo).sqrt()));
    out
}

fn lp2bp(zpk: Zpk, wo: f64, bw: f64) -> Zpk {
    let degree = zpk.poles.len() - zpk.zeros.len();
    let z_lp: Vec<Complex64> = zpk.zeros.iter().map(|z| z * bw / 2.0).collect();
    let p_lp: Vec<Complex64> = zpk.poles.iter().map(|p| p * bw / 2.0).collect();
    let mut zeros = split_roots(&z_lp, wo);
    zeros.extend(std::iter::repeat(Complex64::new(0.0, 0.0)).take(degree));
    Zpk {
        zeros,
        poles: split_roots(&p_lp, wo),
        gain: zpk.gain * bw.powi(degree as i32),
    }
}

fn lp2bs(zpk: Zpk, wo: f64, bw: f64) -> Zpk {
    let degree = zpk.poles.len() - zpk.zeros.len();
    let neg_z: Vec<Complex64> = zpk.zeros.iter().map(|z| -z).collect();
    let neg_p: Vec<Complex64> = zpk.poles.iter().map(|p| -p).collect();
    let gain = zpk.gain * (prod(&neg_z) / prod(&neg_p)).re;
    let z_hp: Vec<Complex64> = zpk.zeros.iter().map(|z| (bw / 2.0) / z).collect();
    let p_hp: Vec<Complex64> = zpk.poles.iter().map(|p| (bw / 2.0) / p).collect();
    let mut zeros = split_roots(&z_hp, wo);
    zeros.extend(std::iter::repeat(Complex64::new(0.0, wo)).take(degree));
    zeros.extend(std::iter::repeat(Complex64::new(0.0, -wo)).take(degree));
    Zpk {
        zeros,
        poles: split_roots(&p_hp, wo),
        gain,
    }
}

/// Bilinear transform with `fs = 2` (frequencies normalised to Nyquist).
fn bilinear(zpk: Zpk) -> Zpk {
    let fs2 = Complex64::new(4.0, 0.0);
    let degree = zpk.poles.len() - zpk.zeros.len();
    let num: Vec<Complex64> = zpk.zeros.iter().map(|z| fs2 - z).collect();
    let den: Vec<Complex64> = zpk.poles.iter().map(|p| fs2 - p).collect();
    let gain = zpk.gain * (prod(&num) / prod(&den)).re;
    let mut zeros: Vec<Complex64> = zpk.zeros.iter().map(|z| (fs2 + z) / (fs2 - z)).collect();
    zeros.extend(std::iter::repeat(Complex64::new(-1.0, 0.0)).take(degree));
    Zpk {
        zeros,
        poles: zpk.poles.iter().map(|p| (fs2 + p) / (fs2 - p)).collect(),
        gain,
    }
}

fn is_real(c: &Complex64) -> bool {
    c.im.abs() <= 1e-10 * c.norm().max(1.0)
}

/// Splits roots into real values and the upper-half-plane member of each
/// conjugate pair.
fn classify(roots: &[Complex64]) -> (Vec<f64>, Vec<Complex64>) {
    let real = roots.iter().filter(|r| is_real(r)).map(|r| r.re).collect();
    let complex = roots
        .iter()
        .filter(|r| !is_real(r) && r.im > 0.0)
        .copied()
        .collect();
    (real, complex)
}

fn quadratic_from_pair(root: Complex64) -> [f64; 3] {
    [1.0, -2.0 * root.re, root.norm_sqr()]
}

fn quadratic_from_reals(roots: &[f64]) -> [f64; 3] {
    match roots {
        [] => [1.0, 0.0, 0.0],
        [r] => [1.0, -r, 0.0],
        [r1, r2, ..] => [1.0, -(r1 + r2), r1 * r2],
    }
}

/// Pairs zeros and poles into second-order sections; the gain goes into the
/// first section.
fn zpk_to_sos(zpk: Zpk) -> Vec<Sos> {
    let (mut real_p, complex_p) = classify(&zpk.poles);
    let (real_z, mut complex_z) = classify(&zpk.zeros);

    // interleave low and high real zeros so band-pass sections get one of each
    let mut sorted = real_z;
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mut real_z = Vec::with_capacity(sorted.len());
    let (mut lo, mut hi) = (0, sorted.len());
    while lo < hi {
        hi -= 1;
        real_z.push(sorted[hi]);
        if lo < hi {
            real_z.push(sorted[lo]);
            lo += 1;
        }
    }

    let mut take_zeros = |count: usize| -> [f64; 3] {
        if count == 2 {
            if let Some(z) = complex_z.pop() {
                return quadratic_from_pair(z);
            }
        }
        let n = count.min(real_z.len());
        let taken: Vec<f64> = real_z.drain(real_z.len() - n..).collect();
        quadratic_from_reals(&taken)
    };

    let mut sections = Vec::new();
    for p in complex_p {
        let b = take_zeros(2);
        let a = quadratic_from_pair(p);
        sections.push([b[0], b[1], b[2], a[0], a[1], a[2]]);
    }
    while !real_p.is_empty() {
        let n = real_p.len().min(2);
        let poles: Vec<f64> = real_p.drain(real_p.len() - n..).collect();
        let b = take_zeros(n);
        let a = quadratic_from_reals(&poles);
        sections.push([b[0], b[1], b[2], a[0], a[1], a[2]]);
    }
    if let Some(first) = sections.first_mut() {
        for c in first.iter_mut().take(3) {
            *c *= zpk.gain;
        }
    }
    sections
}

/// Designs a digital Butterworth filter as second-order sections.
pub fn butter(order: usize, band: &Band, sampling_rate: f64) -> Result<Vec<Sos>> {
    if order == 0 {
        return Err(DasError::FilterDesign {
            parameter: "order",
            value: 0.0,
            constraint: "filter order must be at least 1".to_string(),
        });
    }
    band.validate(sampling_rate)?;
    let nyquist = sampling_rate / 2.0;
    let warp = |f: f64| 4.0 * (PI * (f / nyquist) / 2.0).tan();
    let prototype = butter_prototype(order);
    let analog = match *band {
        Band::Lowpass { freq } => lp2lp(prototype, warp(freq)),
        Band::Highpass { freq } => lp2hp(prototype, warp(freq)),
        Band::Bandpass { low, high } => {
            let (w1, w2) = (warp(low), warp(high));
            lp2bp(prototype, (w1 * w2).sqrt(), w2 - w1)
        }
        Band::Bandstop { low, high } => {
            let (w1, w2) = (warp(low), warp(high));
            lp2bs(prototype, (w1 * w2).sqrt(), w2 - w1)
        }
    };
    Ok(zpk_to_sos(bilinear(analog)))
}

/// Magnitude response of the cascade at frequency `freq`.
pub fn magnitude_response(sos: &[Sos], freq: f64, sampling_rate: f64) -> f64 {
    let w = 2.0 * PI * freq / sampling_rate;
    let z1 = Complex64::from_polar(1.0, -w);
    let z2 = z1 * z1;
    sos.iter()
        .map(|s| {
            let num = s[0] + s[1] * z1 + s[2] * z2;
            let den = s[3] + s[4] * z1 + s[5] * z2;
            (num / den).norm()
        })
        .product()
}

/// Steady-state initial conditions of each section for a unit step input.
fn sos_initial_conditions(sos: &[Sos]) -> Vec<[f64; 2]> {
    let mut scale = 1.0;
    sos.iter()
        .map(|s| {
            let (b0, b1, b2, a1, a2) = (s[0], s[1], s[2], s[4], s[5]);
            let (r0, r1) = (b1 - a1 * b0, b2 - a2 * b0);
            let det = 1.0 + a1 + a2;
            let zi = [scale * (r0 + r1) / det, scale * ((1.0 + a1) * r1 - a2 * r0) / det];
            scale *= (b0 + b1 + b2) / (1.0 + a1 + a2);
            zi
        })
        .collect()
}

/// Runs the cascade over `x` in place (transposed direct form II), starting
/// from `zi * x0`.
fn sosfilt(sos: &[Sos], zi: &[[f64; 2]], x0: f64, x: &mut [f64]) {
    for (s, z) in sos.iter().zip(zi.iter()) {
        let (mut z0, mut z1) = (z[0] * x0, z[1] * x0);
        for v in x.iter_mut() {
            let input = *v;
            let y = s[0] * input + z0;
            z0 = s[1] * input - s[4] * y + z1;
            z1 = s[2] * input - s[5] * y;
            *v = y;
        }
    }
}

fn default_padlen(sos: &[Sos]) -> usize {
    let zero_b2 = sos.iter().filter(|s| s[2] == 0.0).count();
    let zero_a2 = sos.iter().filter(|s| s[5] == 0.0).count();
    3 * (2 * sos.len() + 1 - zero_b2.min(zero_a2))
}

/// Odd extension of `x` by `edge` samples on both sides.
pub(crate) fn odd_extension(x: &[f64], edge: usize) -> Vec<f64> {
    let n = x.len();
    let mut out = Vec::with_capacity(n + 2 * edge);
    out.extend((1..=edge).rev().map(|i| 2.0 * x[0] - x[i]));
    out.extend_from_slice(x);
    out.extend((1..=edge).map(|i| 2.0 * x[n - 1] - x[n - 1 - i]));
    out
}

/// Forward-backward filtering of one trace.
pub fn sosfiltfilt_trace(sos: &[Sos], x: &[f64]) -> Vec<f64> {
    let n = x.len();
    if n == 0 || sos.is_empty() {
        return x.to_vec();
    }
    let edge = default_padlen(sos).min(n - 1);
    let zi = sos_initial_conditions(sos);
    let mut ext = odd_extension(x, edge);
    let x0 = ext[0];
    sosfilt(sos, &zi, x0, &mut ext);
    ext.reverse();
    let y0 = ext[0];
    sosfilt(sos, &zi, y0, &mut ext);
    ext.reverse();
    ext[edge..edge + n].to_vec()
}

/// Zero-phase filtering of every channel of `data` in place.
pub fn sosfiltfilt(sos: &[Sos], mut data: ArrayViewMut2<'_, f64>) {
    Zip::from(data.axis_iter_mut(Axis(0))).par_for_each(|mut row| {
        let filtered = sosfiltfilt_trace(sos, &row.to_vec());
        for (x, y) in row.iter_mut().zip(filtered) {
            *x = y;
        }
    });
}
