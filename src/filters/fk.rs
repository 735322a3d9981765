//! Frequency-wavenumber filtering.
//!
//! The section is tapered, zero padded, transformed with a 2-D FFT, multiplied
//! by a mask and transformed back. Masks are evaluated on the non-negative
//! frequency half-plane; the other half follows from Hermitian symmetry, so
//! a mask value at `(f, k)` also applies at `(-f, -k)`.

use crate::data_container::Section;
use crate::error::{DasError, Result};
use crate::filters::filter::{Filter, FilterConfig, FilterDomain};
use crate::math_tools::{apply_taper, next_pow_2, pad, unpad, TaperConfig};
use crate::spectrum::FkSpectrum;
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::time::Instant;

/// A bound of the fan mask.
///
/// A single value is tapered over a relative width `edge` around it, a pair
/// gives the start and end of the cosine taper explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bound {
    Value(f64),
    Taper(f64, f64),
}

impl Bound {
    fn nominal(&self) -> f64 {
        match *self {
            Bound::Value(v) => v,
            Bound::Taper(a, b) => 0.5 * (a + b),
        }
    }

    fn values(&self) -> Vec<f64> {
        match *self {
            Bound::Value(v) => vec![v],
            Bound::Taper(a, b) => vec![a, b],
        }
    }

    /// `(zero below, one above)` for a minimum bound.
    fn lower_taper(&self, edge: f64) -> (f64, f64) {
        match *self {
            Bound::Value(v) => (v * (1.0 - edge / 2.0).max(0.0), v * (1.0 + edge / 2.0)),
            Bound::Taper(a, b) => (a.min(b), a.max(b)),
        }
    }

    /// `(zero above, one below)` for a maximum bound.
    fn upper_taper(&self, edge: f64) -> (f64, f64) {
        match *self {
            Bound::Value(v) => (v * (1.0 + edge / 2.0), v * (1.0 - edge / 2.0)),
            Bound::Taper(a, b) => (a.max(b), a.min(b)),
        }
    }
}

fn lower_weight(p: f64, (zero, one): (f64, f64)) -> f64 {
    if p <= zero {
        0.0
    } else if p < one {
        0.5 - 0.5 * ((p - zero) / (one - zero) * PI).cos()
    } else {
        1.0
    }
}

fn upper_weight(p: f64, (zero, one): (f64, f64)) -> f64 {
    if p >= zero {
        0.0
    } else if p > one {
        0.5 - 0.5 * ((zero - p) / (zero - one) * PI).cos()
    } else {
        1.0
    }
}

/// Propagation directions kept by a fan mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Both,
    /// Keep energy travelling toward increasing channel index.
    Positive,
    /// Keep energy travelling toward decreasing channel index.
    Negative,
}

/// Fan mask built from frequency (Hz), wavenumber (1/m) and absolute
/// apparent velocity (m/s) bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanMask {
    pub fmin: Option<Bound>,
    pub fmax: Option<Bound>,
    pub kmin: Option<Bound>,
    pub kmax: Option<Bound>,
    pub vmin: Option<Bound>,
    pub vmax: Option<Bound>,
    /// Relative width of the cosine taper around single-value bounds.
    pub edge: f64,
    pub direction: Direction,
}

impl Default for FanMask {
    fn default() -> Self {
        FanMask {
            fmin: None,
            fmax: None,
            kmin: None,
            kmax: None,
            vmin: None,
            vmax: None,
            edge: 0.1,
            direction: Direction::Both,
        }
    }
}

impl FanMask {
    /// Keeps apparent velocities between `vmin` and `vmax` in `direction`.
    pub fn velocity(vmin: Option<f64>, vmax: Option<f64>, direction: Direction) -> Self {
        FanMask {
            vmin: vmin.map(Bound::Value),
            vmax: vmax.map(Bound::Value),
            direction,
            ..FanMask::default()
        }
    }

    fn bounds(&self) -> [(&'static str, Option<Bound>, Option<Bound>); 3] {
        [
            ("f", self.fmin, self.fmax),
            ("k", self.kmin, self.kmax),
            ("v", self.vmin, self.vmax),
        ]
    }

    fn validate(&self, sampling_rate: f64, channel_spacing: f64) -> Result<()> {
        if !self.edge.is_finite() || self.edge < 0.0 {
            return Err(DasError::InvalidMask {
                parameter: "edge",
                value: self.edge,
                constraint: "taper edge must be non-negative".to_string(),
            });
        }
        let f_nyquist = sampling_rate / 2.0;
        let k_nyquist = if channel_spacing > 0.0 {
            0.5 / channel_spacing
        } else {
            f64::INFINITY
        };
        for (quantity, min, max) in self.bounds() {
            let (min_name, max_name) = match quantity {
                "f" => ("fmin", "fmax"),
                "k" => ("kmin", "kmax"),
                _ => ("vmin", "vmax"),
            };
            for (name, bound) in [(min_name, min), (max_name, max)] {
                for value in bound.iter().flat_map(|b| b.values()) {
                    if !value.is_finite() || value < 0.0 || (quantity == "v" && value <= 0.0) {
                        return Err(DasError::InvalidMask {
                            parameter: name,
                            value,
                            constraint: if quantity == "v" {
                                "velocities must be positive".to_string()
                            } else {
                                "bounds must be non-negative".to_string()
                            },
                        });
                    }
                    let limit = match quantity {
                        "f" => f_nyquist,
                        "k" => k_nyquist,
                        _ => f64::INFINITY,
                    };
                    if value > limit {
                        return Err(DasError::InvalidMask {
                            parameter: name,
                            value,
                            constraint: format!("exceeds the Nyquist limit {limit}"),
                        });
                    }
                }
            }
            if let (Some(lo), Some(hi)) = (min, max) {
                if hi.nominal() != 0.0 && lo.nominal() >= hi.nominal() {
                    return Err(DasError::InvalidMask {
                        parameter: min_name,
                        value: lo.nominal(),
                        constraint: format!("must be below {max_name} = {}", hi.nominal()),
                    });
                }
            }
        }
        Ok(())
    }

    fn evaluate(&self, spectrum: &FkSpectrum) -> Array2<f64> {
        let velocities = spectrum.velocities();
        Array2::from_shape_fn(spectrum.data.dim(), |(i, j)| {
            let f = spectrum.frequencies[j];
            let k = spectrum.wavenumbers[i];
            let v = velocities[[i, j]];
            let mut weight = 1.0;
            for (quantity, min, max) in self.bounds() {
                let p = match quantity {
                    "f" => f.abs(),
                    "k" => k.abs(),
                    _ => v.abs(),
                };
                // zero-valued bounds are inactive
                if let Some(b) = min.filter(|b| b.nominal() != 0.0) {
                    weight *= lower_weight(p, b.lower_taper(self.edge));
                }
                if let Some(b) = max.filter(|b| b.nominal() != 0.0) {
                    weight *= upper_weight(p, b.upper_taper(self.edge));
                }
            }
            if f != 0.0 && k != 0.0 {
                match self.direction {
                    Direction::Positive if v < 0.0 => weight = 0.0,
                    Direction::Negative if v > 0.0 => weight = 0.0,
                    _ => {}
                }
            }
            weight
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolygonMode {
    /// Keep the inside of the polygon.
    #[default]
    Pass,
    /// Remove the inside of the polygon.
    Reject,
}

/// Polygon in the `(f >= 0, k)` plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolygonMask {
    /// `[frequency, wavenumber]` vertices.
    pub vertices: Vec<[f64; 2]>,
    #[serde(default)]
    pub mode: PolygonMode,
}

impl PolygonMask {
    fn validate(&self, sampling_rate: f64, channel_spacing: f64) -> Result<()> {
        if self.vertices.len() < 3 {
            return Err(DasError::InvalidMask {
                parameter: "vertices",
                value: self.vertices.len() as f64,
                constraint: "a polygon needs at least three vertices".to_string(),
            });
        }
        if let Some(v) = self.vertices.iter().find(|v| v[0] < 0.0 || !v[0].is_finite() || !v[1].is_finite()) {
            return Err(DasError::InvalidMask {
                parameter: "vertices",
                value: v[0],
                constraint: "vertex frequencies must be finite and non-negative".to_string(),
            });
        }
        let f_nyquist = 0.5 * sampling_rate;
        if let Some(v) = self.vertices.iter().find(|v| v[0] > f_nyquist) {
            return Err(DasError::InvalidMask {
                parameter: "vertex frequency",
                value: v[0],
                constraint: format!("must not exceed the temporal Nyquist frequency {f_nyquist} Hz"),
            });
        }
        if channel_spacing > 0.0 {
            let k_nyquist = 0.5 / channel_spacing;
            if let Some(v) = self.vertices.iter().find(|v| v[1].abs() > k_nyquist) {
                return Err(DasError::InvalidMask {
                    parameter: "vertex wavenumber",
                    value: v[1],
                    constraint: format!("magnitude must not exceed the spatial Nyquist wavenumber {k_nyquist} 1/m"),
                });
            }
        }
        let n = self.vertices.len();
        let twice_area: f64 = (0..n)
            .map(|i| {
                let (a, b) = (self.vertices[i], self.vertices[(i + 1) % n]);
                a[0] * b[1] - b[0] * a[1]
            })
            .sum();
        if twice_area.abs() <= f64::EPSILON {
            return Err(DasError::InvalidMask {
                parameter: "vertices",
                value: 0.5 * twice_area,
                constraint: "polygon area must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Even-odd rule point-in-polygon test.
    fn contains(&self, f: f64, k: f64) -> bool {
        let n = self.vertices.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (fi, ki) = (self.vertices[i][0], self.vertices[i][1]);
            let (fj, kj) = (self.vertices[j][0], self.vertices[j][1]);
            if (ki > k) != (kj > k) && f < (fj - fi) * (k - ki) / (kj - ki) + fi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    fn evaluate(&self, spectrum: &FkSpectrum) -> Array2<f64> {
        Array2::from_shape_fn(spectrum.data.dim(), |(i, j)| {
            let inside = self.contains(spectrum.frequencies[j], spectrum.wavenumbers[i]);
            match (self.mode, inside) {
                (PolygonMode::Pass, true) | (PolygonMode::Reject, false) => 1.0,
                _ => 0.0,
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FkMask {
    #[default]
    AllPass,
    Fan(FanMask),
    Polygon(PolygonMask),
}

impl FkMask {
    pub fn validate(&self, sampling_rate: f64, channel_spacing: f64) -> Result<()> {
        match self {
            FkMask::AllPass => Ok(()),
            FkMask::Fan(fan) => fan.validate(sampling_rate, channel_spacing),
            FkMask::Polygon(polygon) => polygon.validate(sampling_rate, channel_spacing),
        }
    }

    /// Mask weights in `[0, 1]` for every bin of `spectrum`.
    pub fn evaluate(&self, spectrum: &FkSpectrum) -> Array2<f64> {
        match self {
            FkMask::AllPass => Array2::ones(spectrum.data.dim()),
            FkMask::Fan(fan) => fan.evaluate(spectrum),
            FkMask::Polygon(polygon) => polygon.evaluate(spectrum),
        }
    }
}

/// Zero padding applied before the 2-D FFT.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FkPadding {
    /// Pad both axes to the next power of two.
    #[default]
    NextPowerOfTwo,
    None,
    /// Pad each axis by a fraction of its length, split over both ends.
    Fraction { channels: f64, samples: f64 },
}

impl FkPadding {
    fn amount(&self, (n_channels, n_samples): (usize, usize)) -> (usize, usize) {
        match *self {
            FkPadding::NextPowerOfTwo => (
                next_pow_2(n_channels) - n_channels,
                next_pow_2(n_samples) - n_samples,
            ),
            FkPadding::None => (0, 0),
            FkPadding::Fraction { channels, samples } => (
                (channels.max(0.0) * n_channels as f64).round() as usize,
                (samples.max(0.0) * n_samples as f64).round() as usize,
            ),
        }
    }
}

/// Filters a section with a mask in the frequency-wavenumber domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FkFilter {
    pub mask: FkMask,
    pub taper: TaperConfig,
    pub padding: FkPadding,
    /// Restore exact zeros of the input (e.g. muted traces) after filtering.
    pub rezero: bool,
}

impl Default for FkFilter {
    fn default() -> Self {
        FkFilter {
            mask: FkMask::AllPass,
            taper: TaperConfig::default(),
            padding: FkPadding::NextPowerOfTwo,
            rezero: true,
        }
    }
}

impl FkFilter {
    pub fn new(mask: FkMask) -> Self {
        FkFilter {
            mask,
            ..FkFilter::default()
        }
    }

    /// Tapered and padded FK spectrum of `section` and the mask on it.
    pub fn spectrum(&self, section: &Section) -> Result<(FkSpectrum, Array2<f64>)> {
        self.mask
            .validate(section.sampling_rate(), section.channel_spacing())?;
        self.taper.validate()?;
        let (spectrum, _) = self.transform(section)?;
        let mask = self.mask.evaluate(&spectrum);
        Ok((spectrum, mask))
    }

    fn transform(&self, section: &Section) -> Result<(FkSpectrum, (usize, usize))> {
        let mut tapered = section.data().clone();
        apply_taper(&mut tapered, &self.taper);
        let dn = self.padding.amount(tapered.dim());
        let padded = pad(&tapered, dn);
        let spectrum = FkSpectrum::forward(
            &padded,
            section.sampling_rate(),
            section.channel_spacing(),
        )?;
        Ok((spectrum, dn))
    }
}

impl Filter for FkFilter {
    fn config(&self) -> FilterConfig {
        FilterConfig {
            name: "FK Filter".to_string(),
            description: "Masks the 2-D frequency-wavenumber spectrum with a velocity fan or \
                          a polygon."
                .to_string(),
            hyperlink: None,
            domain: FilterDomain::FrequencyWavenumber,
        }
    }

    fn filter(&self, section: &mut Section) -> Result<()> {
        if self.mask == FkMask::AllPass {
            return Ok(());
        }
        let start = Instant::now();
        self.mask
            .validate(section.sampling_rate(), section.channel_spacing())?;
        self.taper.validate()?;

        let (mut spectrum, dn) = self.transform(section)?;
        let mask = self.mask.evaluate(&spectrum);
        Zip::from(&mut spectrum.data)
            .and(&mask)
            .for_each(|c, &m| *c *= m);
        let mut filtered = unpad(&spectrum.inverse()?, dn);
        if self.rezero {
            Zip::from(&mut filtered)
                .and(section.data())
                .for_each(|y, &x| {
                    if x == 0.0 {
                        *y = 0.0;
                    }
                });
        }
        section.replace_data(filtered)?;
        log::debug!("FK filter. This took {:?}", start.elapsed());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{plane_wave, section_from, CHANNEL_SPACING, SAMPLING_RATE};
    use approx::assert_abs_diff_eq;

    fn rms(values: impl Iterator<Item = f64>) -> f64 {
        let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v * v, n + 1));
        (sum / n.max(1) as f64).sqrt()
    }

    #[test]
    fn test_all_pass_is_identity() {
        let section = section_from(plane_wave(12, 300, 2000.0, 0.3, 1), SAMPLING_RATE, CHANNEL_SPACING);
        let out = FkFilter::new(FkMask::AllPass).filtered(&section).unwrap();
        assert_eq!(out.data(), section.data());
    }

    #[test]
    fn test_unit_fan_reproduces_input_without_taper() {
        let section = section_from(plane_wave(16, 256, 2000.0, 0.0, 0), SAMPLING_RATE, CHANNEL_SPACING);
        let filter = FkFilter {
            mask: FkMask::Fan(FanMask::default()),
            taper: TaperConfig::none(),
            padding: FkPadding::None,
            rezero: false,
        };
        let out = filter.filtered(&section).unwrap();
        for (a, b) in out.data().iter().zip(section.data().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_direction_separates_opposite_waves() {
        let (n_channels, n_samples) = (32, 1000);
        let forward = plane_wave(n_channels, n_samples, 2000.0, 0.0, 0);
        let backward = plane_wave(n_channels, n_samples, -2000.0, 0.0, 0);
        let section = section_from(&forward + &backward, SAMPLING_RATE, CHANNEL_SPACING);

        let keep_forward = FkFilter::new(FkMask::Fan(FanMask::velocity(
            Some(500.0),
            None,
            Direction::Positive,
        )));
        let out = keep_forward.filtered(&section).unwrap();
        let residual = rms((6..26).flat_map(|c| {
            let out = &out;
            let forward = &forward;
            (100..900).map(move |t| out.data()[[c, t]] - forward[[c, t]])
        }));
        let signal = rms((6..26).flat_map(|c| {
            let forward = &forward;
            (100..900).map(move |t| forward[[c, t]])
        }));
        assert!(residual < 0.2 * signal, "residual {residual} vs signal {signal}");
    }

    #[test]
    fn test_velocity_fan_mask_values() {
        let section = section_from(plane_wave(8, 64, 2000.0, 0.0, 0), SAMPLING_RATE, CHANNEL_SPACING);
        let filter = FkFilter::new(FkMask::Fan(FanMask {
            vmin: Some(Bound::Value(1000.0)),
            edge: 0.2,
            ..FanMask::default()
        }));
        let (spectrum, mask) = filter.spectrum(&section).unwrap();
        let velocities = spectrum.velocities();
        for ((i, j), m) in mask.indexed_iter() {
            let v = velocities[[i, j]].abs();
            if v <= 900.0 {
                assert_eq!(*m, 0.0);
            } else if v >= 1100.0 {
                assert_eq!(*m, 1.0);
            } else {
                assert!((0.0..=1.0).contains(m));
            }
        }
    }

    #[test]
    fn test_invalid_masks() {
        let section = section_from(plane_wave(8, 64, 2000.0, 0.0, 0), SAMPLING_RATE, CHANNEL_SPACING);
        let cases = [
            FkMask::Fan(FanMask {
                fmax: Some(Bound::Value(600.0)),
                ..FanMask::default()
            }),
            FkMask::Fan(FanMask {
                kmax: Some(Bound::Value(0.2)),
                ..FanMask::default()
            }),
            FkMask::Fan(FanMask::velocity(Some(3000.0), Some(1000.0), Direction::Both)),
            FkMask::Fan(FanMask::velocity(Some(-10.0), None, Direction::Both)),
            FkMask::Polygon(PolygonMask {
                vertices: vec![[0.0, 0.0], [10.0, 0.0], [20.0, 0.0]],
                mode: PolygonMode::Pass,
            }),
        ];
        for mask in cases {
            let result = FkFilter::new(mask).filtered(&section);
            assert!(matches!(result, Err(DasError::InvalidMask { .. })), "{result:?}");
        }
    }

    #[test]
    fn test_polygon_reject_removes_band() {
        let section = section_from(plane_wave(16, 512, 2000.0, 0.0, 0), SAMPLING_RATE, CHANNEL_SPACING);
        let k_nyquist = 0.5 / CHANNEL_SPACING;
        let polygon = PolygonMask {
            vertices: vec![
                [5.0, -k_nyquist],
                [60.0, -k_nyquist],
                [60.0, k_nyquist],
                [5.0, k_nyquist],
            ],
            mode: PolygonMode::Reject,
        };
        let (_, mask) = FkFilter::new(FkMask::Polygon(polygon.clone()))
            .spectrum(&section)
            .unwrap();
        assert!(mask.iter().all(|m| *m == 0.0 || *m == 1.0));
        let out = FkFilter::new(FkMask::Polygon(polygon)).filtered(&section).unwrap();
        let kept: f64 = out.data().iter().map(|x| x * x).sum();
        let input: f64 = section.data().iter().map(|x| x * x).sum();
        assert!(kept < 0.01 * input);
    }

    #[test]
    fn test_polygon_beyond_nyquist_is_rejected() {
        let section = section_from(plane_wave(16, 256, 2000.0, 0.0, 0), SAMPLING_RATE, CHANNEL_SPACING);
        let k_nyquist = 0.5 / CHANNEL_SPACING;
        let outside = PolygonMask {
            vertices: vec![
                [SAMPLING_RATE, 3.0 * k_nyquist],
                [3.0 * SAMPLING_RATE, 3.0 * k_nyquist],
                [3.0 * SAMPLING_RATE, 5.0 * k_nyquist],
            ],
            mode: PolygonMode::Pass,
        };
        let result = FkFilter::new(FkMask::Polygon(outside)).filtered(&section);
        assert!(matches!(
            result,
            Err(DasError::InvalidMask { parameter: "vertex frequency", .. })
        ));

        let wide = PolygonMask {
            vertices: vec![[0.0, 0.0], [100.0, 2.0 * k_nyquist], [100.0, 0.0]],
            mode: PolygonMode::Pass,
        };
        let result = FkFilter::new(FkMask::Polygon(wide)).filtered(&section);
        assert!(matches!(
            result,
            Err(DasError::InvalidMask { parameter: "vertex wavenumber", .. })
        ));
    }

    #[test]
    fn test_rezero_restores_dead_channel() {
        let mut data = plane_wave(16, 256, 2000.0, 0.1, 4);
        data.row_mut(5).fill(0.0);
        let section = section_from(data, SAMPLING_RATE, CHANNEL_SPACING);
        let filter = FkFilter::new(FkMask::Fan(FanMask::velocity(Some(1000.0), None, Direction::Both)));
        let out = filter.filtered(&section).unwrap();
        assert!(out.data().row(5).iter().all(|x| *x == 0.0));
        assert!(out.data().row(6).iter().any(|x| *x != 0.0));
    }

    #[test]
    fn test_mask_deserialises() {
        let filter: FkFilter = serde_json::from_str(
            r#"{"mask": {"type": "fan", "vmin": 1500.0, "vmax": [5000.0, 6000.0],
                         "direction": "positive"}}"#,
        )
        .unwrap();
        match filter.mask {
            FkMask::Fan(fan) => {
                assert_eq!(fan.vmin, Some(Bound::Value(1500.0)));
                assert_eq!(fan.vmax, Some(Bound::Taper(5000.0, 6000.0)));
                assert_eq!(fan.direction, Direction::Positive);
                assert_abs_diff_eq!(fan.edge, 0.1);
            }
            other => panic!("unexpected mask {other:?}"),
        }
        assert!(filter.rezero);
    }
}
