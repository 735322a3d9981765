//! Error types for DAS section processing.
//!
//! Every variant carries the offending parameter, its value and the violated
//! constraint so that the caller can fix the configuration without looking at
//! the internals of the failing operation.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DasError {
    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("invalid metadata `{parameter}` = {value}: {constraint}")]
    InvalidMetadata {
        parameter: &'static str,
        value: f64,
        constraint: &'static str,
    },

    #[error(
        "resampling to {requested_rate} Hz aliases: effective bandwidth is {bandwidth:.3} Hz, \
         which needs at least {required_rate:.3} Hz"
    )]
    Aliasing {
        requested_rate: f64,
        bandwidth: f64,
        required_rate: f64,
    },

    #[error("filter design failed for `{parameter}` = {value}: {constraint}")]
    FilterDesign {
        parameter: &'static str,
        value: f64,
        constraint: String,
    },

    #[error("invalid FK mask `{parameter}` = {value}: {constraint}")]
    InvalidMask {
        parameter: &'static str,
        value: f64,
        constraint: String,
    },

    #[error("insufficient data for {what}: need {required}, have {available}")]
    InsufficientData {
        what: &'static str,
        required: usize,
        available: usize,
    },

    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid parameter `{parameter}` = {value}: {constraint}")]
    InvalidParameter {
        parameter: &'static str,
        value: f64,
        constraint: &'static str,
    },

    #[error("{operation} is not defined for {data_type} data")]
    UnsupportedDataType {
        operation: &'static str,
        data_type: String,
    },

    #[error("FFT error: {0}")]
    Fft(String),
}

impl From<realfft::FftError> for DasError {
    fn from(e: realfft::FftError) -> Self {
        DasError::Fft(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DasError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_parameter_and_constraint() {
        let err = DasError::FilterDesign {
            parameter: "high",
            value: 600.0,
            constraint: "must be below the Nyquist frequency 500 Hz".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("high"));
        assert!(msg.contains("600"));
        assert!(msg.contains("Nyquist"));

        let err = DasError::ShapeMismatch {
            what: "data matrix",
            expected: (6, 100),
            actual: (5, 100),
        };
        assert!(err.to_string().contains("(6, 100)"));
    }
}
