//! Tuner configuration.
//!
//! Every field carries a serde default so a partial JSON file only needs the
//! values it overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::error::{TunerError, TunerResult};

/// Which frequency estimator the engine runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EstimatorKind {
    /// FFT peak picking refined in the time domain.
    #[default]
    Spectral,
    /// Zero-crossing bitstream autocorrelation.
    Bitstream,
}

impl std::str::FromStr for EstimatorKind {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spectral" | "fft" => Ok(Self::Spectral),
            "bitstream" | "acf" => Ok(Self::Bitstream),
            other => Err(TunerError::InvalidConfig(format!("unknown estimator '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpectralConfig {
    #[serde(default = "SpectralConfig::default_min_frequency")]
    pub min_frequency: f32,
    #[serde(default = "SpectralConfig::default_max_frequency")]
    pub max_frequency: f32,
    /// Scales the window: next_pow2(sr / min) * 2 * buffer_seconds samples.
    #[serde(default = "SpectralConfig::default_buffer_seconds")]
    pub buffer_seconds: usize,
    /// How many spectrum peaks are refined in the time domain.
    #[serde(default = "SpectralConfig::default_peak_count")]
    pub peak_count: usize,
    /// Bins must exceed the mean power times this to count as tonal.
    #[serde(default = "SpectralConfig::default_noise_multiplier")]
    pub noise_multiplier: f64,
    /// Upper bound on period hypotheses tried per peak.
    #[serde(default = "SpectralConfig::default_max_interval_steps")]
    pub max_interval_steps: usize,
}

impl SpectralConfig {
    fn default_min_frequency() -> f32 {
        60.0
    }
    fn default_max_frequency() -> f32 {
        1300.0
    }
    fn default_buffer_seconds() -> usize {
        3
    }
    fn default_peak_count() -> usize {
        5
    }
    fn default_noise_multiplier() -> f64 {
        1.5
    }
    fn default_max_interval_steps() -> usize {
        30
    }
}

impl Default for SpectralConfig {
    fn default() -> Self {
        Self {
            min_frequency: Self::default_min_frequency(),
            max_frequency: Self::default_max_frequency(),
            buffer_seconds: Self::default_buffer_seconds(),
            peak_count: Self::default_peak_count(),
            noise_multiplier: Self::default_noise_multiplier(),
            max_interval_steps: Self::default_max_interval_steps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BitstreamConfig {
    #[serde(default = "BitstreamConfig::default_min_frequency")]
    pub min_frequency: f32,
    #[serde(default = "BitstreamConfig::default_max_frequency")]
    pub max_frequency: f32,
    /// Scales the window: next_pow2(sr / min) * buffer_multiplier samples.
    #[serde(default = "BitstreamConfig::default_buffer_multiplier")]
    pub buffer_multiplier: usize,
    /// Samples above this switch the bitstream high.
    #[serde(default = "BitstreamConfig::default_high_threshold")]
    pub high_threshold: f32,
    /// Samples below this switch the bitstream low.
    #[serde(default = "BitstreamConfig::default_low_threshold")]
    pub low_threshold: f32,
    /// Fraction of the largest mismatch count a sub-period must stay under.
    #[serde(default = "BitstreamConfig::default_subharmonic_threshold")]
    pub subharmonic_threshold: f32,
}

impl BitstreamConfig {
    fn default_min_frequency() -> f32 {
        60.0
    }
    fn default_max_frequency() -> f32 {
        1300.0
    }
    fn default_buffer_multiplier() -> usize {
        2
    }
    fn default_high_threshold() -> f32 {
        0.0
    }
    fn default_low_threshold() -> f32 {
        -0.1
    }
    fn default_subharmonic_threshold() -> f32 {
        0.15
    }
}

impl Default for BitstreamConfig {
    fn default() -> Self {
        Self {
            min_frequency: Self::default_min_frequency(),
            max_frequency: Self::default_max_frequency(),
            buffer_multiplier: Self::default_buffer_multiplier(),
            high_threshold: Self::default_high_threshold(),
            low_threshold: Self::default_low_threshold(),
            subharmonic_threshold: Self::default_subharmonic_threshold(),
        }
    }
}

/// How multi-channel captures are reduced to the mono signal the
/// accumulator works on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelMix {
    /// Average all channels of a frame.
    #[default]
    Downmix,
    /// Keep a single channel (zero based).
    Select(u16),
}

/// What happens to a completed window while the detection queue is full.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DropPolicy {
    /// Discard the window that just completed.
    #[default]
    DropNewest,
    /// Evict the queued window so the latest one wins.
    DropOldest,
}

impl std::str::FromStr for DropPolicy {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "drop-newest" | "newest" => Ok(Self::DropNewest),
            "drop-oldest" | "oldest" | "latest-wins" => Ok(Self::DropOldest),
            other => Err(TunerError::InvalidConfig(format!("unknown drop policy '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Windows allowed to wait for the detection worker.
    #[serde(default = "PipelineConfig::default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub drop_policy: DropPolicy,
    /// How long a single capture read may block.
    #[serde(default = "PipelineConfig::default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl PipelineConfig {
    fn default_queue_capacity() -> usize {
        1
    }
    fn default_read_timeout_ms() -> u64 {
        500
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: Self::default_queue_capacity(),
            drop_policy: DropPolicy::default(),
            read_timeout_ms: Self::default_read_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmoothingConfig {
    /// Length of the aggregation window for displayed readings.
    #[serde(default = "SmoothingConfig::default_window_ms")]
    pub window_ms: u64,
}

impl SmoothingConfig {
    fn default_window_ms() -> u64 {
        300
    }
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            window_ms: Self::default_window_ms(),
        }
    }
}

/// Top-level tuner configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TunerConfig {
    #[serde(default)]
    pub estimator: EstimatorKind,
    #[serde(default)]
    pub spectral: SpectralConfig,
    #[serde(default)]
    pub bitstream: BitstreamConfig,
    #[serde(default)]
    pub channel_mix: ChannelMix,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub smoothing: SmoothingConfig,
}

impl TunerConfig {
    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> TunerResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| TunerError::InvalidConfig(format!("{}: {e}", path.display())))?;
        let config: TunerConfig = serde_json::from_str(&contents)
            .map_err(|e| TunerError::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`TunerConfig::load`], but falls back to defaults on any problem.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(err) => {
                warn!("{err}. Using defaults.");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> TunerResult<()> {
        check_range("spectral", self.spectral.min_frequency, self.spectral.max_frequency)?;
        check_range("bitstream", self.bitstream.min_frequency, self.bitstream.max_frequency)?;
        if self.spectral.buffer_seconds == 0 {
            return Err(TunerError::InvalidConfig("spectral.buffer_seconds must be > 0".into()));
        }
        if self.spectral.peak_count == 0 {
            return Err(TunerError::InvalidConfig("spectral.peak_count must be > 0".into()));
        }
        if self.spectral.max_interval_steps == 0 {
            return Err(TunerError::InvalidConfig("spectral.max_interval_steps must be > 0".into()));
        }
        if self.bitstream.buffer_multiplier < 2 {
            return Err(TunerError::InvalidConfig(
                "bitstream.buffer_multiplier must be >= 2".into(),
            ));
        }
        if self.bitstream.low_threshold > self.bitstream.high_threshold {
            return Err(TunerError::InvalidConfig(
                "bitstream.low_threshold must not exceed high_threshold".into(),
            ));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(TunerError::InvalidConfig("pipeline.queue_capacity must be > 0".into()));
        }
        Ok(())
    }
}

fn check_range(section: &str, min: f32, max: f32) -> TunerResult<()> {
    if !(min > 0.0) || !(max > min) {
        return Err(TunerError::InvalidConfig(format!(
            "{section}: frequency range [{min}, {max}] is empty"
        )));
    }
    Ok(())
}
