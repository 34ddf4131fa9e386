//! # Tuning Session
//!
//! Runs the detection pipeline for one capture stream on two threads:
//!
//! - **capture thread**: reads the stream, accumulates fixed-size windows
//!   and offers them into a bounded channel
//! - **detection worker**: takes one window at a time, detects its pitch and
//!   hands the result to the caller's sink, in window order
//!
//! When the queue is full the configured [`DropPolicy`] decides which window
//! is discarded. Nothing is ever queued without bound.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::audio::{AnalysisWindow, SampleWindowAccumulator, StreamFormat};
use crate::capture::CaptureStream;
use crate::config::{DropPolicy, TunerConfig};
use crate::error::{TunerError, TunerResult};
use crate::pitch::PitchDetectionEngine;
use crate::tuning::DetectedPitch;

/// Consecutive failed reads tolerated before the session gives up.
const READ_RETRIES: u32 = 1;

/// Counters of a running or finished session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Windows completed by the accumulator and offered to the worker.
    pub windows: u64,
    /// Windows discarded because the detection queue was full.
    pub dropped: u64,
    /// Results handed to the sink, sentinels included.
    pub detections: u64,
}

#[derive(Debug, Default)]
struct Counters {
    windows: AtomicU64,
    dropped: AtomicU64,
    detections: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            windows: self.windows.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running detection pipeline. Dropping it stops the session.
pub struct TuningSession {
    stop_flag: Arc<AtomicBool>,
    counters: Arc<Counters>,
    capture_handle: Option<JoinHandle<TunerResult<()>>>,
    worker_handle: Option<JoinHandle<TunerResult<()>>>,
}

impl std::fmt::Debug for TuningSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TuningSession")
            .field("stopping", &self.stop_flag.load(Ordering::Relaxed))
            .field("stats", &self.counters.snapshot())
            .finish()
    }
}

impl TuningSession {
    /// Spawns the capture thread and the detection worker.
    ///
    /// `sink` receives one [`DetectedPitch`] per analysed window, including
    /// the "no detection" sentinel.
    pub fn start<F>(
        stream: Box<dyn CaptureStream>,
        config: TunerConfig,
        sink: F,
    ) -> TunerResult<Self>
    where
        F: FnMut(DetectedPitch) + Send + 'static,
    {
        config.validate()?;

        let stop_flag = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());
        let (window_tx, window_rx) = crossbeam_channel::bounded(config.pipeline.queue_capacity);

        let capture = CaptureLoop {
            stream,
            config: config.clone(),
            window_tx,
            evict_rx: window_rx.clone(),
            stop_flag: Arc::clone(&stop_flag),
            counters: Arc::clone(&counters),
        };
        let worker = DetectionWorker {
            config,
            window_rx,
            stop_flag: Arc::clone(&stop_flag),
            counters: Arc::clone(&counters),
        };

        let worker_handle = thread::Builder::new()
            .name("tuner-detect".into())
            .spawn(move || worker.run(sink))
            .map_err(|err| {
                TunerError::DeviceUnavailable(format!("failed to spawn detection worker: {err}"))
            })?;

        let capture_handle = match thread::Builder::new()
            .name("tuner-capture".into())
            .spawn(move || capture.run())
        {
            Ok(handle) => handle,
            Err(err) => {
                // The capture loop went down with the failed spawn, closing
                // the worker's channel.
                stop_flag.store(true, Ordering::Release);
                let _ = worker_handle.join();
                return Err(TunerError::DeviceUnavailable(format!(
                    "failed to spawn capture thread: {err}"
                )));
            }
        };

        info!("tuning session started");
        Ok(TuningSession {
            stop_flag,
            counters,
            capture_handle: Some(capture_handle),
            worker_handle: Some(worker_handle),
        })
    }

    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    /// True once both threads have exited, either because the stream ended
    /// or because of a fatal error.
    pub fn is_finished(&self) -> bool {
        let done = |handle: &Option<JoinHandle<TunerResult<()>>>| {
            handle.as_ref().is_none_or(|h| h.is_finished())
        };
        done(&self.capture_handle) && done(&self.worker_handle)
    }

    /// Stops capture, waits for both threads and returns the error that
    /// ended the session, if any. The sink is not called after this returns.
    pub fn stop(mut self) -> TunerResult<()> {
        self.stop_flag.store(true, Ordering::Release);
        self.join()
    }

    /// Lets the stream run to its end, then behaves like [`stop`](Self::stop).
    pub fn wait(mut self) -> TunerResult<()> {
        self.join()
    }

    fn join(&mut self) -> TunerResult<()> {
        let capture = join_thread(self.capture_handle.take(), "capture");
        let worker = join_thread(self.worker_handle.take(), "detection");
        let result = capture.and(worker);
        let stats = self.counters.snapshot();
        match &result {
            Ok(()) => info!(
                windows = stats.windows,
                dropped = stats.dropped,
                detections = stats.detections,
                "tuning session stopped"
            ),
            Err(err) => error!(%err, windows = stats.windows, "tuning session failed"),
        }
        result
    }
}

impl Drop for TuningSession {
    fn drop(&mut self) {
        if self.capture_handle.is_some() || self.worker_handle.is_some() {
            self.stop_flag.store(true, Ordering::Release);
            let _ = self.join();
        }
    }
}

fn join_thread(handle: Option<JoinHandle<TunerResult<()>>>, name: &str) -> TunerResult<()> {
    match handle.map(JoinHandle::join) {
        None => Ok(()),
        Some(Ok(result)) => result,
        Some(Err(_)) => Err(TunerError::DeviceReadFailure(format!("{name} thread panicked"))),
    }
}

struct CaptureLoop {
    stream: Box<dyn CaptureStream>,
    config: TunerConfig,
    window_tx: Sender<AnalysisWindow>,
    evict_rx: Receiver<AnalysisWindow>,
    stop_flag: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl CaptureLoop {
    fn run(mut self) -> TunerResult<()> {
        let result = self.pump();
        self.stream.stop();
        if let Err(err) = &result {
            error!(%err, "capture stopped");
        }
        result
    }

    fn pump(&mut self) -> TunerResult<()> {
        let timeout = Duration::from_millis(self.config.pipeline.read_timeout_ms);
        let mut accumulator: Option<SampleWindowAccumulator> = None;
        let mut failures = 0;

        while !self.stop_flag.load(Ordering::Acquire) {
            let buffer = match self.stream.read(timeout) {
                Ok(Some(buffer)) => {
                    failures = 0;
                    buffer
                }
                Ok(None) => {
                    info!("capture stream ended");
                    return Ok(());
                }
                Err(err) => {
                    failures += 1;
                    if failures > READ_RETRIES {
                        return Err(TunerError::DeviceReadFailure(err.to_string()));
                    }
                    warn!(%err, "capture read failed, retrying");
                    continue;
                }
            };

            if accumulator.as_ref().is_none_or(|acc| acc.format() != buffer.format) {
                if accumulator.is_some() {
                    debug!(
                        format = ?buffer.format,
                        "stream format changed, discarding partial window"
                    );
                }
                accumulator = Some(self.accumulator_for(buffer.format)?);
            }
            if let Some(acc) = accumulator.as_mut() {
                acc.push(&buffer.bytes, |window| self.offer(window));
            }
        }
        Ok(())
    }

    fn accumulator_for(&self, format: StreamFormat) -> TunerResult<SampleWindowAccumulator> {
        let window_size = PitchDetectionEngine::window_size_for(&self.config, format.sample_rate);
        debug!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            window_size,
            "accumulating windows"
        );
        SampleWindowAccumulator::new(format, window_size, self.config.channel_mix)
    }

    fn offer(&self, window: AnalysisWindow) {
        match self.config.pipeline.drop_policy {
            DropPolicy::DropNewest => match self.window_tx.try_send(window) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(window)) => self.record_drop(&window, "newest"),
            },
            DropPolicy::DropOldest => {
                let mut pending = window;
                loop {
                    match self.window_tx.try_send(pending) {
                        Ok(()) | Err(TrySendError::Disconnected(_)) => break,
                        Err(TrySendError::Full(window)) => {
                            if let Ok(oldest) = self.evict_rx.try_recv() {
                                self.record_drop(&oldest, "oldest");
                            }
                            pending = window;
                        }
                    }
                }
            }
        }
        self.counters.windows.fetch_add(1, Ordering::Relaxed);
    }

    fn record_drop(&self, window: &AnalysisWindow, which: &str) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(sequence = window.sequence, which, "detection busy, window dropped");
    }
}

struct DetectionWorker {
    config: TunerConfig,
    window_rx: Receiver<AnalysisWindow>,
    stop_flag: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl DetectionWorker {
    fn run(self, sink: impl FnMut(DetectedPitch)) -> TunerResult<()> {
        let result = self.detect_all(sink);
        if result.is_err() {
            self.stop_flag.store(true, Ordering::Release);
        }
        result
    }

    fn detect_all(&self, mut sink: impl FnMut(DetectedPitch)) -> TunerResult<()> {
        let mut engine: Option<PitchDetectionEngine> = None;

        for window in self.window_rx.iter() {
            if self.stop_flag.load(Ordering::Acquire) {
                break;
            }
            if engine.as_ref().is_none_or(|e| e.sample_rate() != window.sample_rate) {
                engine = Some(PitchDetectionEngine::new(window.sample_rate, &self.config)?);
            }
            let Some(engine) = engine.as_ref() else {
                continue;
            };

            let pitch = engine.detect(&window.samples);
            debug!(
                sequence = window.sequence,
                frequency = pitch.estimated_frequency,
                note = %pitch.fundamental,
                "window analysed"
            );
            if self.stop_flag.load(Ordering::Acquire) {
                break;
            }
            sink(pitch);
            self.counters.detections.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
