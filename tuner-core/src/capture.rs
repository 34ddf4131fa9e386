//! # Capture Module
//!
//! Contract between the detection pipeline and whatever produces raw audio.
//! A [`CaptureBackend`] enumerates devices and opens a [`CaptureStream`];
//! the stream hands out format-tagged byte buffers until it ends or is
//! stopped.
//!
//! Two implementations ship with the crate:
//! - [`ReplayStream`], an in-memory stream over pre-recorded buffers
//! - `CpalBackend` (feature `cpal`), live capture through CPAL

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::audio::AudioBuffer;
use crate::error::{TunerError, TunerResult};

#[cfg(feature = "cpal")]
pub use self::live::CpalBackend;

/// Describes one input device as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDevice {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

/// A single failed read. The session retries once before giving up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("no audio delivered within {0:?}")]
    Timeout(Duration),
    #[error("capture device error: {0}")]
    Device(String),
}

pub trait CaptureBackend {
    fn devices(&self) -> TunerResult<Vec<CaptureDevice>>;

    /// Starts capture on `device`. Fails with [`TunerError::DeviceUnavailable`]
    /// when the device is missing or cannot be initialised.
    fn open(&self, device: &CaptureDevice) -> TunerResult<Box<dyn CaptureStream>>;
}

pub trait CaptureStream: Send {
    /// Waits up to `timeout` for the next buffer. `Ok(None)` means the
    /// stream has ended and will not deliver anything else.
    fn read(&mut self, timeout: Duration) -> Result<Option<AudioBuffer>, ReadError>;

    /// Releases the device. Safe to call more than once.
    fn stop(&mut self);
}

/// Chooses the device matching `preferred` by id or name, falling back to
/// the default device and then to the first one listed.
pub fn pick_device(
    devices: &[CaptureDevice],
    preferred: Option<&str>,
) -> TunerResult<CaptureDevice> {
    if let Some(wanted) = preferred {
        if let Some(device) = devices.iter().find(|d| d.id == wanted || d.name == wanted) {
            return Ok(device.clone());
        }
        warn!(device = wanted, "requested capture device not found, using fallback");
    }
    devices
        .iter()
        .find(|d| d.is_default)
        .or_else(|| devices.first())
        .cloned()
        .ok_or_else(|| TunerError::DeviceUnavailable("no capture devices available".into()))
}

/// Plays back a fixed sequence of reads, then ends.
#[derive(Debug, Default)]
pub struct ReplayStream {
    reads: VecDeque<Result<AudioBuffer, ReadError>>,
    pace: Option<Duration>,
    stopped: bool,
}

impl ReplayStream {
    pub fn new(reads: impl IntoIterator<Item = Result<AudioBuffer, ReadError>>) -> Self {
        ReplayStream {
            reads: reads.into_iter().collect(),
            pace: None,
            stopped: false,
        }
    }

    pub fn from_buffers(buffers: impl IntoIterator<Item = AudioBuffer>) -> Self {
        Self::new(buffers.into_iter().map(Ok))
    }

    /// Sleeps this long before every read, imitating a device's cadence.
    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    pub fn remaining(&self) -> usize {
        self.reads.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl CaptureStream for ReplayStream {
    fn read(&mut self, _timeout: Duration) -> Result<Option<AudioBuffer>, ReadError> {
        if self.stopped {
            return Ok(None);
        }
        if let Some(pace) = self.pace {
            thread::sleep(pace);
        }
        self.reads.pop_front().transpose()
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.reads.clear();
    }
}

#[cfg(feature = "cpal")]
mod live {
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
    use tracing::{debug, info, warn};

    use super::{CaptureBackend, CaptureDevice, CaptureStream, ReadError};
    use crate::audio::{AudioBuffer, SampleEncoding, StreamFormat};
    use crate::error::{TunerError, TunerResult};

    type Delivery = Result<AudioBuffer, ReadError>;

    fn unavailable(err: impl std::fmt::Display) -> TunerError {
        TunerError::DeviceUnavailable(err.to_string())
    }

    /// Live capture from the platform's default CPAL host.
    pub struct CpalBackend {
        host: cpal::Host,
    }

    impl CpalBackend {
        pub fn new() -> Self {
            CpalBackend {
                host: cpal::default_host(),
            }
        }
    }

    impl Default for CpalBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    impl CaptureBackend for CpalBackend {
        fn devices(&self) -> TunerResult<Vec<CaptureDevice>> {
            let default_name = self.host.default_input_device().and_then(|d| d.name().ok());
            let devices = self.host.input_devices().map_err(unavailable)?;
            Ok(devices
                .filter_map(|device| device.name().ok())
                .map(|name| CaptureDevice {
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    id: name.clone(),
                    name,
                })
                .collect())
        }

        fn open(&self, device: &CaptureDevice) -> TunerResult<Box<dyn CaptureStream>> {
            Ok(Box::new(CpalStream::open(device.id.clone())?))
        }
    }

    /// The CPAL stream handle is not `Send` on every platform, so it lives on
    /// its own thread until a stop signal arrives.
    struct CpalStream {
        deliveries: Receiver<Delivery>,
        shutdown_tx: Sender<()>,
        thread_handle: Option<JoinHandle<()>>,
    }

    impl CpalStream {
        fn open(id: String) -> TunerResult<Self> {
            let (delivery_tx, deliveries) = crossbeam_channel::unbounded::<Delivery>();
            let (ready_tx, ready_rx) = crossbeam_channel::bounded::<TunerResult<StreamFormat>>(1);
            let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);

            let thread_handle = thread::Builder::new()
                .name("tuner-cpal".into())
                .spawn(move || {
                    let stream = match build_stream(&id, delivery_tx) {
                        Ok((stream, format)) => {
                            let _ = ready_tx.send(Ok(format));
                            stream
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    };
                    let _ = shutdown_rx.recv();
                    if let Err(err) = stream.pause() {
                        debug!(%err, "pausing input stream failed");
                    }
                    drop(stream);
                    debug!(device = %id, "input stream released");
                })
                .map_err(unavailable)?;

            let format = ready_rx.recv().map_err(|_| {
                TunerError::DeviceUnavailable("capture thread exited during setup".into())
            })??;
            info!(
                sample_rate = format.sample_rate,
                channels = format.channels,
                bits = format.bits_per_sample,
                encoding = %format.encoding,
                "input stream started"
            );

            Ok(CpalStream {
                deliveries,
                shutdown_tx,
                thread_handle: Some(thread_handle),
            })
        }
    }

    impl CaptureStream for CpalStream {
        fn read(&mut self, timeout: Duration) -> Result<Option<AudioBuffer>, ReadError> {
            match self.deliveries.recv_timeout(timeout) {
                Ok(Ok(buffer)) => Ok(Some(buffer)),
                Ok(Err(err)) => Err(err),
                Err(RecvTimeoutError::Timeout) => Err(ReadError::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => Ok(None),
            }
        }

        fn stop(&mut self) {
            if let Some(handle) = self.thread_handle.take() {
                let _ = self.shutdown_tx.send(());
                if handle.join().is_err() {
                    warn!("capture thread panicked");
                }
            }
        }
    }

    impl Drop for CpalStream {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn build_stream(
        id: &str,
        delivery_tx: Sender<Delivery>,
    ) -> TunerResult<(cpal::Stream, StreamFormat)> {
        let host = cpal::default_host();
        let device = host
            .input_devices()
            .map_err(unavailable)?
            .find(|d| d.name().map(|name| name == id).unwrap_or(false))
            .ok_or_else(|| {
                TunerError::DeviceUnavailable(format!("no capture device named {id:?}"))
            })?;

        let supported = device.default_input_config().map_err(unavailable)?;
        let sample_format = supported.sample_format();
        let format = stream_format(sample_format, supported.sample_rate().0, supported.channels())?;
        let config: cpal::StreamConfig = supported.into();

        let error_tx = delivery_tx.clone();
        let stream = device
            .build_input_stream_raw(
                &config,
                sample_format,
                move |data: &cpal::Data, _: &cpal::InputCallbackInfo| {
                    let _ = delivery_tx.send(Ok(AudioBuffer {
                        format,
                        bytes: data.bytes().to_vec(),
                    }));
                },
                move |err| {
                    let _ = error_tx.send(Err(ReadError::Device(err.to_string())));
                },
                None,
            )
            .map_err(unavailable)?;
        stream.play().map_err(unavailable)?;
        Ok((stream, format))
    }

    fn stream_format(
        sample_format: cpal::SampleFormat,
        sample_rate: u32,
        channels: u16,
    ) -> TunerResult<StreamFormat> {
        let (bits_per_sample, encoding) = match sample_format {
            cpal::SampleFormat::I16 => (16, SampleEncoding::Int),
            cpal::SampleFormat::I32 => (32, SampleEncoding::Int),
            cpal::SampleFormat::F32 => (32, SampleEncoding::Float),
            cpal::SampleFormat::F64 => (64, SampleEncoding::Float),
            other => {
                let encoding = if other.is_float() {
                    SampleEncoding::Float
                } else {
                    SampleEncoding::Int
                };
                return Err(TunerError::UnsupportedFormat {
                    bits_per_sample: (other.sample_size() * 8) as u16,
                    encoding,
                });
            }
        };
        Ok(StreamFormat::new(sample_rate, bits_per_sample, channels, encoding))
    }
}
