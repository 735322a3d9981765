use crate::data_container::Section;
use crate::error::{DasError, Result};
use crate::filters::filter::{Filter, FilterConfig, FilterDomain};
use crate::filters::fir::{fir_filter, firwin};
use crate::filters::iir::{butter, sosfiltfilt};
use crate::math_tools::WindowType;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Instant;

/// Frequency band of a time-domain filter, corner frequencies in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Band {
    Lowpass { freq: f64 },
    Highpass { freq: f64 },
    Bandpass { low: f64, high: f64 },
    Bandstop { low: f64, high: f64 },
}

impl Display for Band {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Band::Lowpass { freq } => write!(f, "low-pass {freq} Hz"),
            Band::Highpass { freq } => write!(f, "high-pass {freq} Hz"),
            Band::Bandpass { low, high } => write!(f, "band-pass {low}-{high} Hz"),
            Band::Bandstop { low, high } => write!(f, "band-stop {low}-{high} Hz"),
        }
    }
}

impl Band {
    /// Checks the corner frequencies against the sampling rate.
    pub fn validate(&self, sampling_rate: f64) -> Result<()> {
        let nyquist = sampling_rate / 2.0;
        let corners: Vec<(&'static str, f64)> = match *self {
            Band::Lowpass { freq } | Band::Highpass { freq } => vec![("freq", freq)],
            Band::Bandpass { low, high } | Band::Bandstop { low, high } => {
                vec![("low", low), ("high", high)]
            }
        };
        for (parameter, value) in corners {
            if !value.is_finite() || value <= 0.0 {
                return Err(DasError::FilterDesign {
                    parameter,
                    value,
                    constraint: "corner frequency must be positive".to_string(),
                });
            }
            if value >= nyquist {
                return Err(DasError::FilterDesign {
                    parameter,
                    value,
                    constraint: format!("must be below the Nyquist frequency {nyquist} Hz"),
                });
            }
        }
        if let Band::Bandpass { low, high } | Band::Bandstop { low, high } = *self {
            if low >= high {
                return Err(DasError::FilterDesign {
                    parameter: "low",
                    value: low,
                    constraint: format!("must be below the upper corner {high} Hz"),
                });
            }
        }
        Ok(())
    }
}

/// How the band is realised.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Design {
    /// Butterworth filter in second-order sections, run forward and backward.
    Iir { order: usize },
    /// Windowed-sinc kernel applied centred on each sample.
    Fir { taps: usize, window: WindowType },
}

impl Default for Design {
    fn default() -> Self {
        Design::Iir { order: 4 }
    }
}

/// Zero-phase band filter applied to every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeDomainFilter {
    pub band: Band,
    #[serde(default)]
    pub design: Design,
}

impl TimeDomainFilter {
    pub fn new(band: Band, design: Design) -> Self {
        TimeDomainFilter { band, design }
    }

    pub fn bandpass(low: f64, high: f64, order: usize) -> Self {
        Self::new(Band::Bandpass { low, high }, Design::Iir { order })
    }

    pub fn bandstop(low: f64, high: f64, order: usize) -> Self {
        Self::new(Band::Bandstop { low, high }, Design::Iir { order })
    }

    pub fn lowpass(freq: f64, order: usize) -> Self {
        Self::new(Band::Lowpass { freq }, Design::Iir { order })
    }

    pub fn highpass(freq: f64, order: usize) -> Self {
        Self::new(Band::Highpass { freq }, Design::Iir { order })
    }

    /// Switches to a Hamming-windowed FIR design with `taps` coefficients.
    pub fn fir(mut self, taps: usize) -> Self {
        self.design = Design::Fir {
            taps,
            window: WindowType::Hamming,
        };
        self
    }
}

impl Filter for TimeDomainFilter {
    fn config(&self) -> FilterConfig {
        let design = match self.design {
            Design::Iir { order } => format!("order {order} Butterworth"),
            Design::Fir { taps, window } => format!("{taps}-tap {window} windowed-sinc"),
        };
        FilterConfig {
            name: format!("Time Domain {}", self.band),
            description: format!(
                "Zero-phase {design} {} filter applied to every channel.",
                self.band
            ),
            hyperlink: None,
            domain: FilterDomain::Time,
        }
    }

    fn filter(&self, section: &mut Section) -> Result<()> {
        let start = Instant::now();
        let fs = section.sampling_rate();
        match self.design {
            Design::Iir { order } => {
                let sos = butter(order, &self.band, fs)?;
                log::debug!("{} with {} second-order sections", self.band, sos.len());
                sosfiltfilt(&sos, section.data_mut());
            }
            Design::Fir { taps, window } => {
                let kernel = firwin(taps, &self.band, fs, window)?;
                fir_filter(&kernel, section.data_mut());
            }
        }
        log::debug!("{} filter. This took {:?}", self.band, start.elapsed());
        Ok(())
    }
}
