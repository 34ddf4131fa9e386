//! # Audio Sample Module
//!
//! Decodes raw capture buffers into normalised mono samples and cuts them
//! into fixed-size analysis windows.
//!
//! ## Features
//! - Explicit per-encoding conversion (16/32-bit integer PCM, 32/64-bit float)
//! - Channel downmix or selection before accumulation
//! - Window emission that only depends on the total bytes delivered

use std::fmt;

use crate::config::ChannelMix;
use crate::error::{TunerError, TunerResult};

/// How each sample is stored in a capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleEncoding {
    /// Signed integer PCM.
    Int,
    /// IEEE 754 floating point.
    Float,
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleEncoding::Int => f.write_str("integer PCM"),
            SampleEncoding::Float => f.write_str("IEEE float"),
        }
    }
}

/// Format tag carried by every capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
    pub encoding: SampleEncoding,
}

impl StreamFormat {
    pub fn new(
        sample_rate: u32,
        bits_per_sample: u16,
        channels: u16,
        encoding: SampleEncoding,
    ) -> Self {
        StreamFormat {
            sample_rate,
            bits_per_sample,
            channels,
            encoding,
        }
    }

    /// Mono 32-bit float, the format synthetic signals are produced in.
    pub fn mono_f32(sample_rate: u32) -> Self {
        Self::new(sample_rate, 32, 1, SampleEncoding::Float)
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    fn sample_kind(&self) -> TunerResult<SampleKind> {
        match (self.encoding, self.bits_per_sample) {
            (SampleEncoding::Int, 16) => Ok(SampleKind::I16),
            (SampleEncoding::Int, 32) => Ok(SampleKind::I32),
            (SampleEncoding::Float, 32) => Ok(SampleKind::F32),
            (SampleEncoding::Float, 64) => Ok(SampleKind::F64),
            (encoding, bits_per_sample) => Err(TunerError::UnsupportedFormat {
                bits_per_sample,
                encoding,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleKind {
    I16,
    I32,
    F32,
    F64,
}

impl SampleKind {
    /// Converts one little-endian sample to a float in [-1, 1].
    fn decode(self, bytes: &[u8]) -> f32 {
        match self {
            SampleKind::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32_768.0,
            SampleKind::I32 => {
                let raw = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                (raw as f64 / 2_147_483_648.0) as f32
            }
            SampleKind::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            SampleKind::F64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                f64::from_le_bytes(raw) as f32
            }
        }
    }
}

/// One raw delivery from a capture device.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub format: StreamFormat,
    pub bytes: Vec<u8>,
}

impl AudioBuffer {
    /// Encodes mono float samples, mostly useful for synthetic input.
    pub fn from_samples(sample_rate: u32, samples: &[f32]) -> Self {
        AudioBuffer {
            format: StreamFormat::mono_f32(sample_rate),
            bytes: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
        }
    }
}

/// Fixed-length block of samples consumed by one detection call.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisWindow {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Position of this window in the stream, starting at 0.
    pub sequence: u64,
}

/// Turns arbitrarily sized byte deliveries into fixed-size windows.
///
/// Bytes of a frame split across two deliveries are carried over, so the
/// windows produced depend only on the total bytes pushed. A partial frame
/// left at the end of the stream never completes and is dropped.
#[derive(Debug)]
pub struct SampleWindowAccumulator {
    format: StreamFormat,
    kind: SampleKind,
    mix: ChannelMix,
    window_size: usize,
    carry: Vec<u8>,
    buffer: Vec<f32>,
    emitted: u64,
}

impl SampleWindowAccumulator {
    pub fn new(format: StreamFormat, window_size: usize, mix: ChannelMix) -> TunerResult<Self> {
        let kind = format.sample_kind()?;
        if format.sample_rate == 0 {
            return Err(TunerError::InvalidConfig("stream reports a zero sample rate".into()));
        }
        if format.channels == 0 {
            return Err(TunerError::InvalidConfig("stream has no channels".into()));
        }
        if let ChannelMix::Select(channel) = mix {
            if channel >= format.channels {
                return Err(TunerError::InvalidConfig(format!(
                    "channel {channel} selected but the stream has {}",
                    format.channels
                )));
            }
        }
        if window_size == 0 {
            return Err(TunerError::InvalidConfig("window size must be > 0".into()));
        }
        Ok(SampleWindowAccumulator {
            format,
            kind,
            mix,
            window_size,
            carry: Vec::new(),
            buffer: Vec::with_capacity(window_size),
            emitted: 0,
        })
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Mono samples waiting for the current window to fill.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Windows emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Appends `bytes`, calling `emit` once for every window completed.
    /// Returns the number of windows emitted by this call.
    pub fn push(&mut self, bytes: &[u8], mut emit: impl FnMut(AnalysisWindow)) -> usize {
        let frame_bytes = self.format.bytes_per_frame();
        let mut emitted = 0;
        let mut rest = bytes;

        if !self.carry.is_empty() {
            let needed = frame_bytes - self.carry.len();
            let take = needed.min(rest.len());
            self.carry.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.carry.len() < frame_bytes {
                return 0;
            }
            let frame = std::mem::take(&mut self.carry);
            emitted += self.append_frame(&frame, &mut emit);
        }

        let mut frames = rest.chunks_exact(frame_bytes);
        for frame in &mut frames {
            emitted += self.append_frame(frame, &mut emit);
        }
        self.carry.extend_from_slice(frames.remainder());
        emitted
    }

    /// Discards buffered samples and any partial frame.
    pub fn reset(&mut self) {
        self.carry.clear();
        self.buffer.clear();
    }

    fn append_frame(&mut self, frame: &[u8], emit: &mut impl FnMut(AnalysisWindow)) -> usize {
        let sample = self.mix_frame(frame);
        self.buffer.push(sample);
        if self.buffer.len() < self.window_size {
            return 0;
        }
        let samples = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.window_size));
        emit(AnalysisWindow {
            samples,
            sample_rate: self.format.sample_rate,
            sequence: self.emitted,
        });
        self.emitted += 1;
        1
    }

    fn mix_frame(&self, frame: &[u8]) -> f32 {
        let width = self.format.bytes_per_sample();
        match self.mix {
            ChannelMix::Select(channel) => {
                let start = channel as usize * width;
                self.kind.decode(&frame[start..start + width])
            }
            ChannelMix::Downmix => {
                let sum: f32 = frame.chunks_exact(width).map(|s| self.kind.decode(s)).sum();
                sum / self.format.channels as f32
            }
        }
    }
}
