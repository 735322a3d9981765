//! Conversion between fibre strain (rate) and particle velocity.
//!
//! Along the fibre, a plane wave `u(t - x / c)` has strain `-u / c`, so
//! particle velocity follows from strain and the apparent velocity `c` of
//! every channel. Alternatively the strain rate is integrated along the cable.
//! Both methods can undo the low-pass response of the gauge length first.

use crate::attributes::ApparentVelocity;
use crate::data_container::{DataType, Section};
use crate::error::{DasError, Result};
use crate::math_tools::{differentiate, fill_invalid, integrate, IntegrationRule};
use crate::spectrum::fftfreq;
use ndarray::{Array1, Array2, Axis, Zip};
use num_complex::Complex64;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::time::Instant;

/// Apparent velocity (m/s, signed) used for the conversion.
#[derive(Debug, Clone, Copy)]
pub enum VelocitySource<'a> {
    /// One velocity for every channel.
    Scalar(f64),
    /// Median velocity of every channel of an attribute series.
    Attribute(&'a ApparentVelocity),
    /// One velocity per channel.
    PerChannel(&'a Array1<f64>),
}

impl VelocitySource<'_> {
    /// Velocity of every channel; invalid entries are filled by linear
    /// interpolation between valid channels.
    pub fn channel_velocities(&self, n_channels: usize) -> Result<Array1<f64>> {
        let raw = match self {
            VelocitySource::Scalar(v) => Array1::from_elem(n_channels, *v),
            VelocitySource::Attribute(attribute) => {
                check_channels("apparent velocity channels", n_channels, attribute.n_channels())?;
                attribute.channel_velocities()
            }
            VelocitySource::PerChannel(velocities) => {
                check_channels("channel velocities", n_channels, velocities.len())?;
                (*velocities).clone()
            }
        };
        let velocities = fill_invalid(&raw).ok_or(DasError::InsufficientData {
            what: "valid channel velocities",
            required: 1,
            available: 0,
        })?;
        if let Some(v) = velocities.iter().find(|v| !v.is_finite() || **v == 0.0) {
            return Err(DasError::InvalidParameter {
                parameter: "velocity",
                value: *v,
                constraint: "apparent velocities must be finite and non-zero",
            });
        }
        Ok(velocities)
    }
}

fn check_channels(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(DasError::DimensionMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionMethod {
    /// Particle velocity `-c × strain` of a plane wave.
    #[default]
    PlaneWave,
    /// Cumulative integral of the strain rate along the cable.
    SpatialIntegration,
}

/// Compensation of the spatial averaging over the gauge length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GaugeCorrection {
    None,
    /// Divides by `sin(π k L) / (π k L)` in the wavenumber domain; responses
    /// smaller in magnitude than `water_level` are raised to it.
    Sinc { water_level: f64 },
}

impl Default for GaugeCorrection {
    fn default() -> Self {
        GaugeCorrection::Sinc { water_level: 0.1 }
    }
}

impl GaugeCorrection {
    /// Clamped gauge response at wavenumber `k` (1/m).
    pub fn response(&self, k: f64, gauge_length: f64) -> f64 {
        match *self {
            GaugeCorrection::None => 1.0,
            GaugeCorrection::Sinc { water_level } => {
                let x = PI * k * gauge_length;
                let r = if x == 0.0 { 1.0 } else { x.sin() / x };
                if r.abs() < water_level {
                    if r < 0.0 {
                        -water_level
                    } else {
                        water_level
                    }
                } else {
                    r
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if let GaugeCorrection::Sinc { water_level } = *self {
            if !(water_level > 0.0 && water_level <= 1.0) {
                return Err(DasError::InvalidParameter {
                    parameter: "water_level",
                    value: water_level,
                    constraint: "must be in (0, 1]",
                });
            }
        }
        Ok(())
    }

    /// Divides (`remove`) or multiplies by the response along the channel axis.
    fn apply(&self, data: &mut Array2<f64>, channel_spacing: f64, gauge_length: f64, remove: bool) {
        let n_channels = data.nrows();
        if *self == GaugeCorrection::None || n_channels < 2 || gauge_length == 0.0 {
            return;
        }
        let response: Array1<f64> = fftfreq(n_channels, channel_spacing)
            .mapv(|k| self.response(k, gauge_length))
            .mapv(|r| if remove { 1.0 / r } else { r });
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(n_channels);
        let ifft = planner.plan_fft_inverse(n_channels);
        let norm = 1.0 / n_channels as f64;
        Zip::from(data.columns_mut()).par_for_each(|mut column| {
            let mut buffer: Vec<Complex64> = column.iter().map(|x| Complex64::new(*x, 0.0)).collect();
            fft.process(&mut buffer);
            for (b, r) in buffer.iter_mut().zip(response.iter()) {
                *b *= *r;
            }
            ifft.process(&mut buffer);
            for (x, b) in column.iter_mut().zip(buffer.iter()) {
                *x = b.re * norm;
            }
        });
    }
}

/// Options of the strain (rate) to velocity conversion.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub method: ConversionMethod,
    pub gauge_correction: GaugeCorrection,
}

fn require(section: &Section, operation: &'static str, allowed: &[DataType]) -> Result<()> {
    if allowed.contains(&section.data_type()) {
        Ok(())
    } else {
        Err(DasError::UnsupportedDataType {
            operation,
            data_type: section.data_type().to_string(),
        })
    }
}

/// Particle velocity from a strain-rate or strain section.
///
/// `source` is only read by [`ConversionMethod::PlaneWave`].
pub fn strain_rate_to_velocity(
    section: &Section,
    source: VelocitySource<'_>,
    config: &ConversionConfig,
) -> Result<Section> {
    let start = Instant::now();
    require(section, "strain to velocity conversion", &[DataType::StrainRate, DataType::Strain])?;
    config.gauge_correction.validate()?;
    let dx = section.channel_spacing();
    let gauge_length = section.gauge_length();

    let mut out = section.clone();
    match config.method {
        ConversionMethod::PlaneWave => {
            let velocities = source.channel_velocities(section.n_channels())?;
            if out.data_type() == DataType::StrainRate {
                out.integrate_time()?;
            }
            let mut data = out.data().clone();
            config.gauge_correction.apply(&mut data, dx, gauge_length, true);
            Zip::from(data.rows_mut())
                .and(&velocities)
                .for_each(|mut row, &c| row.mapv_inplace(|strain| -c * strain));
            out.replace_data(data)?;
        }
        ConversionMethod::SpatialIntegration => {
            if out.data_type() == DataType::Strain {
                out.differentiate_time()?;
            }
            let mut data = out.data().clone();
            config.gauge_correction.apply(&mut data, dx, gauge_length, true);
            integrate(&mut data, Axis(0), dx, IntegrationRule::Trapezoid);
            out.replace_data(data)?;
        }
    }
    out.set_data_type(DataType::Velocity);
    out.record(format!("strain to velocity ({:?})", config.method));
    log::debug!("strain to velocity conversion. This took {:?}", start.elapsed());
    Ok(out)
}

/// Strain from a particle-velocity section; inverts [`strain_rate_to_velocity`]
/// applied to strain.
pub fn velocity_to_strain(
    section: &Section,
    source: VelocitySource<'_>,
    config: &ConversionConfig,
) -> Result<Section> {
    require(section, "velocity to strain conversion", &[DataType::Velocity])?;
    config.gauge_correction.validate()?;
    let dx = section.channel_spacing();
    let gauge_length = section.gauge_length();

    let mut out = section.clone();
    let mut data = out.data().clone();
    match config.method {
        ConversionMethod::PlaneWave => {
            let velocities = source.channel_velocities(section.n_channels())?;
            Zip::from(data.rows_mut())
                .and(&velocities)
                .for_each(|mut row, &c| row.mapv_inplace(|u| -u / c));
            config.gauge_correction.apply(&mut data, dx, gauge_length, false);
            out.replace_data(data)?;
            out.set_data_type(DataType::Strain);
        }
        ConversionMethod::SpatialIntegration => {
            differentiate(&mut data, Axis(0), dx, IntegrationRule::Trapezoid);
            config.gauge_correction.apply(&mut data, dx, gauge_length, false);
            out.replace_data(data)?;
            out.set_data_type(DataType::StrainRate);
            out.integrate_time()?;
        }
    }
    out.record(format!("velocity to strain ({:?})", config.method));
    Ok(out)
}

/// Strain rate from a particle-velocity section; the exact inverse of
/// [`strain_rate_to_velocity`] applied to strain rate.
pub fn velocity_to_strain_rate(
    section: &Section,
    source: VelocitySource<'_>,
    config: &ConversionConfig,
) -> Result<Section> {
    let mut out = velocity_to_strain(section, source, config)?;
    out.differentiate_time()?;
    Ok(out)
}

/// Optical constants of the interrogator and fibre.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConversion {
    /// Vacuum wavelength in nm.
    pub wavelength: f64,
    /// Photo-elastic scaling factor for longitudinal strain.
    pub photoelastic_factor: f64,
    pub refractive_index: f64,
}

impl Default for PhaseConversion {
    fn default() -> Self {
        PhaseConversion {
            wavelength: 1550.0,
            photoelastic_factor: 0.78,
            refractive_index: 1.46,
        }
    }
}

/// Strain from optical phase shift in radians, using the section's gauge length.
pub fn phase_to_strain(section: &Section, optics: &PhaseConversion) -> Result<Section> {
    require(section, "phase to strain conversion", &[DataType::Phase])?;
    let gauge_length = section.gauge_length();
    if gauge_length <= 0.0 {
        return Err(DasError::InvalidMetadata {
            parameter: "gauge_length",
            value: gauge_length,
            constraint: "must be positive for phase conversion",
        });
    }
    let factor = optics.wavelength * 1e-9
        / (optics.photoelastic_factor * 4.0 * PI * optics.refractive_index * gauge_length);
    if !factor.is_finite() || factor == 0.0 {
        return Err(DasError::InvalidParameter {
            parameter: "photoelastic_factor",
            value: optics.photoelastic_factor,
            constraint: "optical constants must give a finite, non-zero factor",
        });
    }
    let mut out = section.clone();
    out.data_mut().mapv_inplace(|phase| phase * factor);
    out.set_data_type(DataType::Strain);
    out.record("phase to strain");
    Ok(out)
}
