//! Error types shared by the tuner core.

use thiserror::Error;

use crate::audio::SampleEncoding;

/// Errors that end (or prevent) a tuning session.
///
/// "No pitch found" is deliberately absent: it is an ordinary
/// [`DetectedPitch`](crate::tuning::DetectedPitch) sentinel value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TunerError {
    /// The capture stream delivered a sample encoding the decoder cannot read.
    #[error("unsupported sample format: {bits_per_sample}-bit {encoding}")]
    UnsupportedFormat {
        bits_per_sample: u16,
        encoding: SampleEncoding,
    },

    /// The capture device does not exist or failed to initialise.
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The capture device failed twice in a row while reading.
    #[error("capture device read failure: {0}")]
    DeviceReadFailure(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for tuner operations
pub type TunerResult<T> = Result<T, TunerError>;
