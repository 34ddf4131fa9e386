// tuner-core/src/lib.rs

//! The core logic for the chromatic tuner.
//! This crate turns a stream of raw capture buffers into pitch readings:
//! window accumulation, the two pitch estimators, note lookup and the
//! threaded detection session. It is completely headless and contains
//! no UI code.

pub mod audio;
pub mod capture;
pub mod config;
pub mod error;
pub mod fft;
pub mod pitch;
pub mod session;
pub mod smoothing;
pub mod tuning;

pub use audio::{
    AnalysisWindow, AudioBuffer, SampleEncoding, SampleWindowAccumulator, StreamFormat,
};
pub use capture::{
    CaptureBackend, CaptureDevice, CaptureStream, ReadError, ReplayStream, pick_device,
};
pub use config::{DropPolicy, EstimatorKind, TunerConfig};
pub use error::{TunerError, TunerResult};
pub use pitch::{PitchDetectionEngine, PitchEstimator};
pub use session::{SessionStats, TuningSession};
pub use smoothing::PitchAggregator;
pub use tuning::{DetectedPitch, Note, NoteTable};
