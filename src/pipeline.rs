//! Ordered processing of a section.
//!
//! A [`Pipeline`] runs its stages one after the other on the same section:
//! filters change the data in place, a velocity scan attaches its apparent
//! velocity estimate, a channel check sets the quality flags and the
//! conversion stage turns strain rate into particle velocity. Later stages see
//! what earlier ones attached, so a [`WavefieldSeparation`] placed after a
//! velocity scan uses that scan's estimate.

use crate::attributes::{ChannelCheck, VelocityScan};
use crate::conversion::{strain_rate_to_velocity, ConversionConfig, VelocitySource};
use crate::data_container::Section;
use crate::error::{DasError, Result};
use crate::filters::common_mode::CommonModeRemoval;
use crate::filters::filter::Filter;
use crate::filters::fk::FkFilter;
use crate::filters::rank_reduction::RankReduction;
use crate::filters::time_domain::TimeDomainFilter;
use crate::filters::wavefield::WavefieldSeparation;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Apparent velocity used by a conversion stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversionSource {
    Scalar {
        velocity: f64,
    },
    /// The estimate attached by an earlier velocity scan.
    #[default]
    Attached,
    PerChannel {
        velocities: Vec<f64>,
    },
}

/// Strain rate (or strain) to particle velocity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionStage {
    pub source: ConversionSource,
    #[serde(flatten)]
    pub config: ConversionConfig,
}

impl ConversionStage {
    fn convert(&self, section: &Section) -> Result<Section> {
        match &self.source {
            ConversionSource::Scalar { velocity } => {
                strain_rate_to_velocity(section, VelocitySource::Scalar(*velocity), &self.config)
            }
            ConversionSource::Attached => {
                let attribute = section.velocity().ok_or(DasError::InsufficientData {
                    what: "attached apparent velocity estimate",
                    required: 1,
                    available: 0,
                })?;
                strain_rate_to_velocity(section, VelocitySource::Attribute(attribute), &self.config)
            }
            ConversionSource::PerChannel { velocities } => {
                let velocities = Array1::from_vec(velocities.clone());
                strain_rate_to_velocity(section, VelocitySource::PerChannel(&velocities), &self.config)
            }
        }
    }
}

/// A single step of a [`Pipeline`].
#[derive(Debug, Clone)]
pub enum Stage {
    Filter(Box<dyn Filter>),
    VelocityScan(VelocityScan),
    ChannelCheck(ChannelCheck),
    Conversion(ConversionStage),
}

impl Stage {
    pub fn name(&self) -> String {
        match self {
            Stage::Filter(filter) => filter.config().name,
            Stage::VelocityScan(_) => "Velocity Scan".to_string(),
            Stage::ChannelCheck(_) => "Channel Check".to_string(),
            Stage::Conversion(_) => "Strain to Velocity".to_string(),
        }
    }

    fn apply(&self, section: &mut Section) -> Result<()> {
        match self {
            Stage::Filter(filter) => filter.filter(section),
            Stage::VelocityScan(scan) => {
                let velocity = scan.scan(section)?;
                section.attach_velocity(velocity)
            }
            Stage::ChannelCheck(check) => {
                let report = check.apply(section)?;
                log::debug!("{} of {} channels are bad", report.bad.len(), section.n_channels());
                Ok(())
            }
            Stage::Conversion(conversion) => {
                *section = conversion.convert(section)?;
                Ok(())
            }
        }
    }
}

/// Ordered list of processing stages.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline::default()
    }

    pub fn with_filter(mut self, filter: impl Filter + 'static) -> Self {
        self.stages.push(Stage::Filter(Box::new(filter)));
        self
    }

    pub fn with_boxed_filter(mut self, filter: Box<dyn Filter>) -> Self {
        self.stages.push(Stage::Filter(filter));
        self
    }

    pub fn with_velocity_scan(mut self, scan: VelocityScan) -> Self {
        self.stages.push(Stage::VelocityScan(scan));
        self
    }

    pub fn with_channel_check(mut self, check: ChannelCheck) -> Self {
        self.stages.push(Stage::ChannelCheck(check));
        self
    }

    pub fn with_conversion(mut self, conversion: ConversionStage) -> Self {
        self.stages.push(Stage::Conversion(conversion));
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Runs all stages on a copy of `section`.
    pub fn run(&self, section: &Section) -> Result<Section> {
        let mut output = section.clone();
        self.run_in_place(&mut output)?;
        Ok(output)
    }

    /// Runs all stages on `section`.
    ///
    /// A failing stage leaves the section as the preceding stage produced it.
    pub fn run_in_place(&self, section: &mut Section) -> Result<()> {
        let total = Instant::now();
        for stage in &self.stages {
            let start = Instant::now();
            let name = stage.name();
            stage.apply(section).map_err(|err| {
                log::error!("{name} failed: {err}");
                err
            })?;
            section.record(name.as_str());
            log::info!("{name}. This took {:?}", start.elapsed());
        }
        log::info!(
            "pipeline with {} stages. This took {:?}",
            self.stages.len(),
            total.elapsed()
        );
        Ok(())
    }
}

/// Serializable description of a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageConfig {
    TimeDomain(TimeDomainFilter),
    Fk(FkFilter),
    CommonMode(CommonModeRemoval),
    RankReduction(RankReduction),
    Wavefield(WavefieldSeparation),
    VelocityScan(VelocityScan),
    ChannelCheck(ChannelCheck),
    Conversion(ConversionStage),
}

impl From<StageConfig> for Stage {
    fn from(config: StageConfig) -> Self {
        match config {
            StageConfig::TimeDomain(filter) => Stage::Filter(Box::new(filter)),
            StageConfig::Fk(filter) => Stage::Filter(Box::new(filter)),
            StageConfig::CommonMode(filter) => Stage::Filter(Box::new(filter)),
            StageConfig::RankReduction(filter) => Stage::Filter(Box::new(filter)),
            StageConfig::Wavefield(filter) => Stage::Filter(Box::new(filter)),
            StageConfig::VelocityScan(scan) => Stage::VelocityScan(scan),
            StageConfig::ChannelCheck(check) => Stage::ChannelCheck(check),
            StageConfig::Conversion(conversion) => Stage::Conversion(conversion),
        }
    }
}

/// Serializable pipeline description, e.g. read from a JSON file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub stages: Vec<StageConfig>,
}

impl PipelineConfig {
    pub fn build(&self) -> Pipeline {
        Pipeline {
            stages: self.stages.iter().cloned().map(Stage::from).collect(),
        }
    }
}

impl From<PipelineConfig> for Pipeline {
    fn from(config: PipelineConfig) -> Self {
        config.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::GaugeCorrection;
    use crate::data_container::DataType;
    use crate::filters::fk::Direction;
    use crate::filters::wavefield::VelocityRange;
    use crate::test_utils::{plane_wave_section, VELOCITY};

    fn full_record_scan() -> VelocityScan {
        VelocityScan {
            time_window: 1.0,
            time_step: 1.0,
            ..VelocityScan::default()
        }
    }

    #[test]
    fn test_plane_wave_scenario() {
        let section = plane_wave_section(10, 1000, 0.1, 42);
        let pipeline = Pipeline::new()
            .with_filter(CommonModeRemoval::default())
            .with_filter(RankReduction::default())
            .with_velocity_scan(full_record_scan());
        let output = pipeline.run(&section).unwrap();

        let velocities = output.velocity().unwrap().channel_velocities();
        for c in 2..8 {
            let error = (velocities[c] - VELOCITY).abs() / VELOCITY;
            assert!(error <= 0.05, "channel {c}: {}", velocities[c]);
        }
        assert!(velocities[0].is_nan() && velocities[9].is_nan());
        assert!(section.velocity().is_none());
        assert_eq!(
            output.history(),
            ["Common Mode Removal", "Rank Reduction", "Velocity Scan"]
        );
    }

    #[test]
    fn test_conversion_uses_attached_estimate() {
        let section = plane_wave_section(10, 1000, 0.1, 42);
        let conversion = ConversionStage {
            source: ConversionSource::Attached,
            config: ConversionConfig {
                gauge_correction: GaugeCorrection::None,
                ..ConversionConfig::default()
            },
        };
        let mut attached = section.clone();
        Pipeline::new()
            .with_velocity_scan(full_record_scan())
            .with_conversion(conversion.clone())
            .run_in_place(&mut attached)
            .unwrap();
        assert_eq!(attached.data_type(), DataType::Velocity);

        let estimate = full_record_scan().scan(&section).unwrap();
        let expected = strain_rate_to_velocity(
            &section,
            VelocitySource::Attribute(&estimate),
            &conversion.config,
        )
        .unwrap();
        assert_eq!(attached.data(), expected.data());

        let result = Pipeline::new().with_conversion(conversion).run(&section);
        assert!(matches!(result, Err(DasError::InsufficientData { .. })));
    }

    #[test]
    fn test_wavefield_after_scan() {
        let section = plane_wave_section(16, 1000, 0.0, 0);
        let fallback = VelocityRange {
            min: 100.0,
            max: 200.0,
            direction: Direction::Negative,
        };
        let output = Pipeline::new()
            .with_velocity_scan(full_record_scan())
            .with_filter(WavefieldSeparation::with_fallback(fallback))
            .run(&section)
            .unwrap();
        let kept: f64 = output.data().iter().map(|x| x * x).sum();
        let input: f64 = section.data().iter().map(|x| x * x).sum();
        assert!(kept > 0.5 * input);
    }

    #[test]
    fn test_failing_stage_is_reported() {
        let section = plane_wave_section(4, 200, 0.0, 0);
        let pipeline = Pipeline::new()
            .with_filter(TimeDomainFilter::bandpass(50.0, 10.0, 4));
        assert!(matches!(pipeline.run(&section), Err(DasError::FilterDesign { .. })));
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "stages": [
                {"stage": "time_domain", "band": {"type": "bandpass", "low": 5.0, "high": 100.0}},
                {"stage": "common_mode", "estimator": "mean"},
                {"stage": "rank_reduction", "selection": {"energy_fraction": 0.9}},
                {"stage": "fk", "mask": {"type": "fan", "vmin": 1000.0, "direction": "positive"}},
                {"stage": "velocity_scan", "time_window": 1.0, "time_step": 1.0},
                {"stage": "conversion", "source": {"type": "scalar", "velocity": 2000.0}, "method": "spatial_integration"}
            ]
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        let pipeline = config.build();
        let names: Vec<String> = pipeline.stages().iter().map(Stage::name).collect();
        assert_eq!(
            names,
            [
                "Time Domain band-pass 5-100 Hz",
                "Common Mode Removal",
                "Rank Reduction",
                "FK Filter",
                "Velocity Scan",
                "Strain to Velocity"
            ]
        );
        match &config.stages[5] {
            StageConfig::Conversion(stage) => {
                assert_eq!(stage.source, ConversionSource::Scalar { velocity: 2000.0 });
                assert_eq!(stage.config.gauge_correction, GaugeCorrection::default());
            }
            other => panic!("unexpected stage {other:?}"),
        }

        let output = pipeline.run(&plane_wave_section(10, 1000, 0.0, 0)).unwrap();
        assert_eq!(output.data_type(), DataType::Velocity);
        assert!(output.velocity().is_some());
        assert_eq!(output.history().last().unwrap(), "Strain to Velocity");
        assert!(output
            .history()
            .contains(&"strain to velocity (SpatialIntegration)".to_string()));
    }
}
