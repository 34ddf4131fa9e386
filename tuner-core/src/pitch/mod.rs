//! # Pitch Detection Module
//!
//! The engine facade and the two interchangeable frequency estimators.
//!
//! ## Features
//! - [`SpectralPitchEstimator`]: FFT peaks refined by a time-domain scan
//! - [`ZeroCrossingAutocorrelationEstimator`]: XOR/popcount autocorrelation
//!   with subharmonic rejection
//! - [`PitchDetectionEngine`]: picks one at construction and resolves its
//!   frequency to the nearest equal-tempered note

pub mod bitstream;
pub mod spectral;

pub use bitstream::{ZeroCrossingAutocorrelationEstimator, ZeroCrossingBits};
pub use spectral::SpectralPitchEstimator;

use tracing::debug;

use crate::config::{EstimatorKind, TunerConfig};
use crate::error::{TunerError, TunerResult};
use crate::tuning::DetectedPitch;

/// Quarter-tone margin around an estimator's range inside which readings
/// are still reported.
const RANGE_TOLERANCE: f32 = 1.029_302_2; // 2^(1/24)

/// Capability shared by both estimator strategies.
pub trait PitchEstimator: Send {
    /// Samples per analysis window this estimator expects.
    fn required_window_size(&self) -> usize;

    /// Lowest and highest frequency the estimator reports, in Hz.
    fn frequency_range(&self) -> (f32, f32);

    /// Estimated fundamental in Hz, or 0 when nothing tonal was found.
    fn estimate(&self, window: &[f32]) -> f32;
}

/// Smallest power of two holding one period of `min_frequency`.
pub(crate) fn next_power_of_two_window(sample_rate: u32, min_frequency: f32) -> usize {
    let longest_period = (sample_rate as f32 / min_frequency).ceil() as usize;
    longest_period.max(1).next_power_of_two()
}

/// Turns analysis windows into [`DetectedPitch`] readings.
///
/// Holds no state between calls beyond the estimator's constants and its
/// scratch pools.
pub struct PitchDetectionEngine {
    estimator: Box<dyn PitchEstimator>,
    sample_rate: u32,
}

impl std::fmt::Debug for PitchDetectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PitchDetectionEngine")
            .field("sample_rate", &self.sample_rate)
            .field("window_size", &self.window_size())
            .field("range", &self.estimator.frequency_range())
            .finish()
    }
}

impl PitchDetectionEngine {
    /// Builds the engine with the estimator selected in `config`.
    pub fn new(sample_rate: u32, config: &TunerConfig) -> TunerResult<Self> {
        if sample_rate == 0 {
            return Err(TunerError::InvalidConfig("sample rate must be > 0".into()));
        }
        config.validate()?;
        let estimator: Box<dyn PitchEstimator> = match config.estimator {
            EstimatorKind::Spectral => Box::new(SpectralPitchEstimator::new(
                sample_rate,
                config.spectral.clone(),
            )),
            EstimatorKind::Bitstream => Box::new(ZeroCrossingAutocorrelationEstimator::new(
                sample_rate,
                config.bitstream.clone(),
            )),
        };
        let engine = Self::with_estimator(sample_rate, estimator);
        debug!(
            estimator = ?config.estimator,
            sample_rate,
            window = engine.window_size(),
            "pitch engine ready"
        );
        Ok(engine)
    }

    /// Wraps a custom estimator.
    pub fn with_estimator(sample_rate: u32, estimator: Box<dyn PitchEstimator>) -> Self {
        PitchDetectionEngine { estimator, sample_rate }
    }

    /// Window size the engine built from `config` would require, without
    /// building it.
    pub fn window_size_for(config: &TunerConfig, sample_rate: u32) -> usize {
        match config.estimator {
            EstimatorKind::Spectral => {
                SpectralPitchEstimator::window_size(sample_rate, &config.spectral)
            }
            EstimatorKind::Bitstream => {
                ZeroCrossingAutocorrelationEstimator::window_size(sample_rate, &config.bitstream)
            }
        }
    }

    pub fn window_size(&self) -> usize {
        self.estimator.required_window_size()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frequency_range(&self) -> (f32, f32) {
        self.estimator.frequency_range()
    }

    /// Estimates the pitch of one window.
    ///
    /// Readings outside the estimator's range (give or take a quarter tone)
    /// come back as [`DetectedPitch::NONE`].
    pub fn detect(&self, window: &[f32]) -> DetectedPitch {
        let frequency = self.estimator.estimate(window);
        let (min, max) = self.estimator.frequency_range();
        if !(frequency >= min / RANGE_TOLERANCE && frequency <= max * RANGE_TOLERANCE) {
            return DetectedPitch::NONE;
        }
        DetectedPitch::resolve(frequency, min, max)
    }
}
