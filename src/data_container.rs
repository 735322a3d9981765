//! This module defines the DAS section: a `channels × samples` matrix together
//! with its acquisition metadata, per-channel metadata, processing history and
//! optionally attached attribute estimates.

use crate::attributes::ApparentVelocity;
use crate::error::{DasError, Result};
use crate::filters::iir::{butter, sosfiltfilt};
use crate::filters::time_domain::Band;
use crate::math_tools::{
    apply_taper, detrend, differentiate, integrate, normalize, stack_channels, DetrendType,
    IntegrationRule, Normalization, TaperConfig,
};
use crate::spectrum::TimeSpectrum;
use chrono::{DateTime, Duration, Utc};
use ndarray::{s, Array1, Array2, ArrayViewMut2, Axis};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::Range;

/// Physical quantity held by a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    StrainRate,
    Strain,
    Velocity,
    /// Optical phase as recorded by the interrogator.
    Phase,
    Other,
}

impl Display for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::StrainRate => write!(f, "strain rate"),
            DataType::Strain => write!(f, "strain"),
            DataType::Velocity => write!(f, "particle velocity"),
            DataType::Phase => write!(f, "phase"),
            DataType::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelQuality {
    Good,
    Bad,
}

/// How channels are combined when reducing spatial sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelDecimation {
    /// Average groups of adjacent channels.
    #[default]
    Stack,
    /// Keep every n-th channel.
    Pick,
}

/// Acquisition metadata of a section.
///
/// # Fields
/// - `sampling_rate`: Samples per second (Hz).
/// - `channel_spacing`: Distance between adjacent channels in metres.
/// - `start_time`: Absolute time of the first sample.
/// - `start_distance`: Position of channel 0 along the fibre in metres.
/// - `gauge_length`: Gauge length of the interrogator in metres.
/// - `data_type`: The physical quantity of the samples.
/// - `scale`: Factor converting the stored values into physical units.
/// - `n_channels`, `n_samples`: Declared matrix dimensions.
/// - `coordinates`: Optional `[x, y]` position of every channel.
/// - `quality`: Optional per-channel quality flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionMeta {
    pub sampling_rate: f64,
    pub channel_spacing: f64,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub start_distance: f64,
    #[serde(default)]
    pub gauge_length: f64,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default = "unit_scale")]
    pub scale: f64,
    pub n_channels: usize,
    pub n_samples: usize,
    #[serde(default)]
    pub coordinates: Option<Vec<[f64; 2]>>,
    #[serde(default)]
    pub quality: Option<Vec<ChannelQuality>>,
}

fn unit_scale() -> f64 {
    1.0
}

impl SectionMeta {
    /// Metadata of a strain-rate section starting at the Unix epoch and at
    /// distance zero, with unit scale and unknown gauge length.
    pub fn new(n_channels: usize, n_samples: usize, sampling_rate: f64, channel_spacing: f64) -> Self {
        SectionMeta {
            sampling_rate,
            channel_spacing,
            start_time: DateTime::<Utc>::default(),
            start_distance: 0.0,
            gauge_length: 0.0,
            data_type: DataType::StrainRate,
            scale: 1.0,
            n_channels,
            n_samples,
            coordinates: None,
            quality: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.sampling_rate.is_finite() || self.sampling_rate <= 0.0 {
            return Err(DasError::InvalidMetadata {
                parameter: "sampling_rate",
                value: self.sampling_rate,
                constraint: "must be positive and finite",
            });
        }
        if !self.channel_spacing.is_finite() || self.channel_spacing < 0.0 {
            return Err(DasError::InvalidMetadata {
                parameter: "channel_spacing",
                value: self.channel_spacing,
                constraint: "must be non-negative and finite",
            });
        }
        if self.n_channels > 1 && self.channel_spacing == 0.0 {
            return Err(DasError::InvalidMetadata {
                parameter: "channel_spacing",
                value: self.channel_spacing,
                constraint: "must be positive when there is more than one channel",
            });
        }
        if !self.gauge_length.is_finite() || self.gauge_length < 0.0 {
            return Err(DasError::InvalidMetadata {
                parameter: "gauge_length",
                value: self.gauge_length,
                constraint: "must be non-negative and finite",
            });
        }
        if !self.scale.is_finite() || self.scale == 0.0 {
            return Err(DasError::InvalidMetadata {
                parameter: "scale",
                value: self.scale,
                constraint: "must be finite and non-zero",
            });
        }
        if !self.start_distance.is_finite() {
            return Err(DasError::InvalidMetadata {
                parameter: "start_distance",
                value: self.start_distance,
                constraint: "must be finite",
            });
        }
        if let Some(coordinates) = &self.coordinates {
            check_channel_count("channel coordinates", self.n_channels, coordinates.len())?;
        }
        if let Some(quality) = &self.quality {
            check_channel_count("channel quality flags", self.n_channels, quality.len())?;
        }
        Ok(())
    }
}

fn check_channel_count(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(DasError::DimensionMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

fn seconds(duration: f64) -> Duration {
    Duration::nanoseconds((duration * 1e9).round() as i64)
}

/// A DAS record: rows are channels, columns are time samples.
#[derive(Debug, Clone)]
pub struct Section {
    data: Array2<f64>,
    meta: SectionMeta,
    velocity: Option<ApparentVelocity>,
    history: Vec<String>,
}

impl Section {
    /// Creates a section, validating the matrix against the declared counts
    /// and the metadata invariants.
    pub fn new(data: Array2<f64>, meta: SectionMeta) -> Result<Section> {
        if data.dim() != (meta.n_channels, meta.n_samples) {
            return Err(DasError::ShapeMismatch {
                what: "data matrix",
                expected: (meta.n_channels, meta.n_samples),
                actual: data.dim(),
            });
        }
        if meta.n_channels == 0 || meta.n_samples == 0 {
            return Err(DasError::InsufficientData {
                what: "section",
                required: 1,
                available: 0,
            });
        }
        meta.validate()?;
        Ok(Section {
            data,
            meta,
            velocity: None,
            history: Vec::new(),
        })
    }

    /// Creates a strain-rate section whose counts are taken from the matrix.
    pub fn from_array(data: Array2<f64>, sampling_rate: f64, channel_spacing: f64) -> Result<Section> {
        let (n_channels, n_samples) = data.dim();
        let meta = SectionMeta::new(n_channels, n_samples, sampling_rate, channel_spacing);
        Section::new(data, meta)
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Mutable view of the samples; the shape cannot change through it.
    pub fn data_mut(&mut self) -> ArrayViewMut2<'_, f64> {
        self.data.view_mut()
    }

    pub fn into_data(self) -> Array2<f64> {
        self.data
    }

    /// Swaps in a new matrix of the same shape.
    pub(crate) fn replace_data(&mut self, data: Array2<f64>) -> Result<()> {
        if data.dim() != self.data.dim() {
            return Err(DasError::ShapeMismatch {
                what: "replacement data",
                expected: self.data.dim(),
                actual: data.dim(),
            });
        }
        self.data = data;
        Ok(())
    }

    pub fn meta(&self) -> &SectionMeta {
        &self.meta
    }

    pub fn n_channels(&self) -> usize {
        self.meta.n_channels
    }

    pub fn n_samples(&self) -> usize {
        self.meta.n_samples
    }

    pub fn sampling_rate(&self) -> f64 {
        self.meta.sampling_rate
    }

    pub fn channel_spacing(&self) -> f64 {
        self.meta.channel_spacing
    }

    pub fn gauge_length(&self) -> f64 {
        self.meta.gauge_length
    }

    pub fn data_type(&self) -> DataType {
        self.meta.data_type
    }

    pub(crate) fn set_data_type(&mut self, data_type: DataType) {
        self.meta.data_type = data_type;
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.meta.start_time
    }

    pub fn start_distance(&self) -> f64 {
        self.meta.start_distance
    }

    /// Record length in seconds.
    pub fn duration(&self) -> f64 {
        self.meta.n_samples as f64 / self.meta.sampling_rate
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.meta.start_time + seconds(self.duration())
    }

    /// Sample times in seconds relative to `start_time`.
    pub fn times(&self) -> Array1<f64> {
        Array1::from_shape_fn(self.meta.n_samples, |i| i as f64 / self.meta.sampling_rate)
    }

    /// Channel positions along the fibre in metres.
    pub fn distances(&self) -> Array1<f64> {
        Array1::from_shape_fn(self.meta.n_channels, |i| {
            self.meta.start_distance + i as f64 * self.meta.channel_spacing
        })
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Appends a step to the processing history.
    pub fn record(&mut self, step: impl Into<String>) {
        self.history.push(step.into());
    }

    pub fn velocity(&self) -> Option<&ApparentVelocity> {
        self.velocity.as_ref()
    }

    /// Attaches an apparent velocity estimate with one row per channel.
    pub fn attach_velocity(&mut self, velocity: ApparentVelocity) -> Result<()> {
        check_channel_count("apparent velocity channels", self.n_channels(), velocity.n_channels())?;
        self.velocity = Some(velocity);
        Ok(())
    }

    pub fn take_velocity(&mut self) -> Option<ApparentVelocity> {
        self.velocity.take()
    }

    fn invalidate_velocity(&mut self, operation: &str) {
        if self.velocity.take().is_some() {
            log::debug!("{operation} detached the apparent velocity estimate");
        }
    }

    pub fn quality(&self) -> Option<&[ChannelQuality]> {
        self.meta.quality.as_deref()
    }

    pub fn set_quality(&mut self, quality: Vec<ChannelQuality>) -> Result<()> {
        check_channel_count("channel quality flags", self.n_channels(), quality.len())?;
        self.meta.quality = Some(quality);
        Ok(())
    }

    /// Indices of channels not flagged as bad.
    pub fn good_channels(&self) -> Vec<usize> {
        match &self.meta.quality {
            Some(quality) => quality
                .iter()
                .enumerate()
                .filter(|(_, q)| **q == ChannelQuality::Good)
                .map(|(i, _)| i)
                .collect(),
            None => (0..self.n_channels()).collect(),
        }
    }

    pub fn coordinates(&self) -> Option<&[[f64; 2]]> {
        self.meta.coordinates.as_deref()
    }

    pub fn set_coordinates(&mut self, coordinates: Vec<[f64; 2]>) -> Result<()> {
        check_channel_count("channel coordinates", self.n_channels(), coordinates.len())?;
        self.meta.coordinates = Some(coordinates);
        Ok(())
    }

    fn set_shape(&mut self, data: Array2<f64>) -> Result<()> {
        let (n_channels, n_samples) = data.dim();
        self.meta.n_channels = n_channels;
        self.meta.n_samples = n_samples;
        self.data = data;
        self.meta.validate()
    }

    /// Keeps channels `channels` and samples `samples` (index ranges).
    pub fn trim(&mut self, channels: Range<usize>, samples: Range<usize>) -> Result<()> {
        if channels.start >= channels.end || channels.end > self.n_channels() {
            return Err(DasError::InvalidParameter {
                parameter: "channels",
                value: channels.end as f64,
                constraint: "channel range must be non-empty and within the section",
            });
        }
        if samples.start >= samples.end || samples.end > self.n_samples() {
            return Err(DasError::InvalidParameter {
                parameter: "samples",
                value: samples.end as f64,
                constraint: "sample range must be non-empty and within the section",
            });
        }
        let data = self
            .data
            .slice(s![channels.clone(), samples.clone()])
            .to_owned();
        self.meta.start_time += seconds(samples.start as f64 / self.meta.sampling_rate);
        self.meta.start_distance += channels.start as f64 * self.meta.channel_spacing;
        if let Some(coordinates) = self.meta.coordinates.as_mut() {
            *coordinates = coordinates[channels.clone()].to_vec();
        }
        if let Some(quality) = self.meta.quality.as_mut() {
            *quality = quality[channels.clone()].to_vec();
        }
        self.invalidate_velocity("trim");
        self.set_shape(data)?;
        self.record(format!("trim channels {channels:?} samples {samples:?}"));
        Ok(())
    }

    /// Keeps the channels positioned in `distance` (metres along the fibre)
    /// and the samples in `time` (seconds after `start_time`), both half-open.
    ///
    /// Bounds are rounded to the nearest channel and sample, ties to even.
    pub fn trim_physical(&mut self, distance: Range<f64>, time: Range<f64>) -> Result<()> {
        let spacing = self.meta.channel_spacing;
        let channel_index = |d: f64| {
            if spacing > 0.0 {
                ((d - self.meta.start_distance) / spacing)
                    .round_ties_even()
                    .clamp(0.0, self.n_channels() as f64) as usize
            } else if d > self.meta.start_distance {
                self.n_channels()
            } else {
                0
            }
        };
        let sample_index = |t: f64| {
            (t * self.meta.sampling_rate)
                .round_ties_even()
                .clamp(0.0, self.n_samples() as f64) as usize
        };
        let channels = channel_index(distance.start)..channel_index(distance.end);
        let samples = sample_index(time.start)..sample_index(time.end);
        self.trim(channels, samples)
    }

    /// Anti-alias filters and keeps every `factor`-th sample.
    ///
    /// The low-pass is a zero-phase order 8 Butterworth at 0.8 times the new
    /// Nyquist frequency.
    pub fn downsample(&mut self, factor: usize) -> Result<()> {
        if factor == 0 {
            return Err(DasError::InvalidParameter {
                parameter: "factor",
                value: 0.0,
                constraint: "downsampling factor must be at least 1",
            });
        }
        if factor == 1 {
            return Ok(());
        }
        let new_rate = self.meta.sampling_rate / factor as f64;
        let sos = butter(8, &Band::Lowpass { freq: 0.4 * new_rate }, self.meta.sampling_rate)?;
        let mut filtered = self.data.clone();
        sosfiltfilt(&sos, filtered.view_mut());
        let data = filtered.slice(s![.., ..;factor]).to_owned();
        self.meta.sampling_rate = new_rate;
        self.invalidate_velocity("downsample");
        self.set_shape(data)?;
        self.record(format!("downsample by {factor}"));
        Ok(())
    }

    /// Frequency below which 99 % of the spectral energy lies, averaged over
    /// channels with non-zero energy.
    pub fn effective_bandwidth(&self) -> Result<f64> {
        let spectrum = TimeSpectrum::forward(&self.data, self.meta.sampling_rate)?;
        let bandwidths: Vec<f64> = spectrum
            .data
            .axis_iter(Axis(0))
            .filter_map(|row| {
                let power: Vec<f64> = row.iter().map(|c| c.norm_sqr()).collect();
                let total: f64 = power.iter().sum();
                if total <= 0.0 {
                    return None;
                }
                let mut cumulative = 0.0;
                power.iter().position(|p| {
                    cumulative += p;
                    cumulative >= 0.99 * total
                })
            })
            .map(|i| spectrum.frequencies[i])
            .collect();
        if bandwidths.is_empty() {
            return Ok(0.0);
        }
        Ok(bandwidths.iter().sum::<f64>() / bandwidths.len() as f64)
    }

    /// Band-limited Fourier resampling to `new_rate` Hz.
    ///
    /// Fails with [`DasError::Aliasing`] when downsampling would fold energy
    /// above the new Nyquist frequency back into the band.
    pub fn resample(&mut self, new_rate: f64) -> Result<()> {
        if !new_rate.is_finite() || new_rate <= 0.0 {
            return Err(DasError::InvalidParameter {
                parameter: "new_rate",
                value: new_rate,
                constraint: "sampling rate must be positive and finite",
            });
        }
        let rate = self.meta.sampling_rate;
        if new_rate == rate {
            return Ok(());
        }
        if new_rate < rate {
            let bandwidth = self.effective_bandwidth()?;
            if new_rate / 2.0 < bandwidth {
                return Err(DasError::Aliasing {
                    requested_rate: new_rate,
                    bandwidth,
                    required_rate: 2.0 * bandwidth,
                });
            }
        }
        let n = self.n_samples();
        let n_new = ((n as f64 * new_rate / rate).round() as usize).max(1);
        let spectrum = TimeSpectrum::forward(&self.data, rate)?;
        let bins = n.min(n_new) / 2 + 1;
        let mut resampled = Array2::<Complex64>::zeros((self.n_channels(), n_new / 2 + 1));
        resampled
            .slice_mut(s![.., ..bins])
            .assign(&spectrum.data.slice(s![.., ..bins]));
        let shared = n.min(n_new);
        if shared % 2 == 0 && n != n_new {
            let factor = if n_new < n { 2.0 } else { 0.5 };
            resampled
                .column_mut(shared / 2)
                .mapv_inplace(|c| c * factor);
        }
        let data = TimeSpectrum::from_parts(resampled, new_rate, n_new).inverse()?
            * (n_new as f64 / n as f64);
        self.meta.sampling_rate = rate * n_new as f64 / n as f64;
        self.invalidate_velocity("resample");
        self.set_shape(data)?;
        self.record(format!("resample to {new_rate} Hz"));
        Ok(())
    }

    /// Reduces spatial sampling by `factor`.
    pub fn decimate_channels(&mut self, factor: usize, mode: ChannelDecimation) -> Result<()> {
        if factor == 0 {
            return Err(DasError::InvalidParameter {
                parameter: "factor",
                value: 0.0,
                constraint: "channel decimation factor must be at least 1",
            });
        }
        if factor == 1 {
            return Ok(());
        }
        let spacing = self.meta.channel_spacing;
        match mode {
            ChannelDecimation::Pick => {
                let picked: Vec<usize> = (0..self.n_channels()).step_by(factor).collect();
                let data = self.data.select(Axis(0), &picked);
                if let Some(coordinates) = self.meta.coordinates.as_mut() {
                    *coordinates = picked.iter().map(|&i| coordinates[i]).collect();
                }
                if let Some(quality) = self.meta.quality.as_mut() {
                    *quality = picked.iter().map(|&i| quality[i]).collect();
                }
                self.meta.channel_spacing = spacing * factor as f64;
                self.invalidate_velocity("channel decimation");
                self.set_shape(data)?;
            }
            ChannelDecimation::Stack => {
                let data = stack_channels(&self.data, factor, factor)?;
                let groups = data.nrows();
                if let Some(coordinates) = self.meta.coordinates.as_mut() {
                    *coordinates = (0..groups)
                        .map(|g| {
                            let group = &coordinates[g * factor..(g + 1) * factor];
                            let n = group.len() as f64;
                            [
                                group.iter().map(|c| c[0]).sum::<f64>() / n,
                                group.iter().map(|c| c[1]).sum::<f64>() / n,
                            ]
                        })
                        .collect();
                }
                if let Some(quality) = self.meta.quality.as_mut() {
                    *quality = (0..groups)
                        .map(|g| {
                            if quality[g * factor..(g + 1) * factor].contains(&ChannelQuality::Bad) {
                                ChannelQuality::Bad
                            } else {
                                ChannelQuality::Good
                            }
                        })
                        .collect();
                }
                self.meta.start_distance += 0.5 * (factor - 1) as f64 * spacing;
                self.meta.channel_spacing = spacing * factor as f64;
                self.invalidate_velocity("channel decimation");
                self.set_shape(data)?;
            }
        }
        self.record(format!("decimate channels by {factor} ({mode:?})"));
        Ok(())
    }

    pub fn detrend(&mut self, kind: DetrendType) {
        detrend(&mut self.data, kind);
        self.record(format!("detrend ({kind:?})"));
    }

    pub fn taper(&mut self, taper: &TaperConfig) -> Result<()> {
        taper.validate()?;
        apply_taper(&mut self.data, taper);
        self.record(format!("taper ({})", taper.window));
        Ok(())
    }

    pub fn normalize(&mut self, kind: Normalization) {
        normalize(&mut self.data, kind);
        self.record(format!("normalize ({kind:?})"));
    }

    /// Converts the stored values to physical units and resets `scale` to one.
    pub fn apply_scale(&mut self) {
        let scale = self.meta.scale;
        if scale != 1.0 {
            self.data.mapv_inplace(|x| x * scale);
            self.meta.scale = 1.0;
        }
        self.record("apply scale");
    }

    /// Strain rate to strain by cumulative trapezoidal integration in time.
    pub fn integrate_time(&mut self) -> Result<()> {
        if self.data_type() != DataType::StrainRate {
            return Err(DasError::UnsupportedDataType {
                operation: "time integration",
                data_type: self.data_type().to_string(),
            });
        }
        let dt = 1.0 / self.meta.sampling_rate;
        integrate(&mut self.data, Axis(1), dt, IntegrationRule::Trapezoid);
        self.meta.data_type = DataType::Strain;
        self.record("integrate in time");
        Ok(())
    }

    /// Strain to strain rate; the exact inverse of [`Section::integrate_time`].
    pub fn differentiate_time(&mut self) -> Result<()> {
        if self.data_type() != DataType::Strain {
            return Err(DasError::UnsupportedDataType {
                operation: "time differentiation",
                data_type: self.data_type().to_string(),
            });
        }
        let dt = 1.0 / self.meta.sampling_rate;
        differentiate(&mut self.data, Axis(1), dt, IntegrationRule::Trapezoid);
        self.meta.data_type = DataType::StrainRate;
        self.record("differentiate in time");
        Ok(())
    }

    pub fn trimmed(&self, channels: Range<usize>, samples: Range<usize>) -> Result<Section> {
        let mut out = self.clone();
        out.trim(channels, samples)?;
        Ok(out)
    }

    pub fn downsampled(&self, factor: usize) -> Result<Section> {
        let mut out = self.clone();
        out.downsample(factor)?;
        Ok(out)
    }

    pub fn resampled(&self, new_rate: f64) -> Result<Section> {
        let mut out = self.clone();
        out.resample(new_rate)?;
        Ok(out)
    }

    pub fn decimated_channels(&self, factor: usize, mode: ChannelDecimation) -> Result<Section> {
        let mut out = self.clone();
        out.decimate_channels(factor, mode)?;
        Ok(out)
    }
}
