// tuner-cli/src/main.rs

//! # Terminal Tuner
//!
//! Headless front end for `tuner-core`: captures from a device (or a
//! synthesized tone), runs a tuning session and prints one smoothed reading
//! per aggregation window.
//!
//! ## Architecture
//! - **Session threads**: capture and detection run inside `tuner-core`
//! - **Main thread**: aggregates readings and prints them
//! - **Communication**: crossbeam channels between the session sink, the
//!   stdin watcher and the main loop

mod cli;

use std::io::{self, BufRead};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tuner_core::{
    AudioBuffer, CaptureStream, DetectedPitch, PitchAggregator, ReplayStream, TuningSession,
};

use crate::cli::Args;

/// Length of one synthesized buffer, roughly a hardware period.
const TONE_CHUNK: Duration = Duration::from_millis(10);

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tuner=info,tuner_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = Args::parse();
    let config = args.tuner_config();
    config.validate().context("invalid configuration")?;

    if args.list_devices {
        return devices::list();
    }

    let stream: Box<dyn CaptureStream> = match args.tone {
        Some(frequency) => synthesized_tone(frequency, args.seconds),
        None => devices::open(args.device.as_deref())?,
    };

    let (reading_tx, reading_rx) = crossbeam_channel::unbounded::<DetectedPitch>();
    let mut aggregator = PitchAggregator::from_config(&config.smoothing);
    let session = TuningSession::start(stream, config, move |pitch| {
        let _ = reading_tx.send(pitch);
    })
    .context("failed to start tuning session")?;

    let stop_rx = watch_stdin();
    info!("tuning; press Enter to stop");

    loop {
        if stop_rx.try_recv().is_ok() {
            info!("stop requested");
            break;
        }
        match reading_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(pitch) => {
                if let Some(reading) = aggregator.push(pitch, Instant::now()) {
                    print_reading(&reading, args.json);
                }
            }
            Err(RecvTimeoutError::Timeout) if !session.is_finished() => {}
            Err(_) => break,
        }
    }

    let stats = session.stats();
    let result = session.stop();
    if let Some(reading) = aggregator.flush() {
        print_reading(&reading, args.json);
    }
    if stats.dropped > 0 {
        warn!(dropped = stats.dropped, windows = stats.windows, "some windows were skipped");
    }
    result.context("tuning session failed")
}

/// Sends once when a line is entered. End of input is not a stop request,
/// so piping from /dev/null keeps the session running.
fn watch_stdin() -> Receiver<()> {
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let mut line = String::new();
        if let Ok(n) = io::stdin().lock().read_line(&mut line) {
            if n > 0 {
                let _ = stop_tx.send(());
            }
        }
    });
    stop_rx
}

fn synthesized_tone(frequency: f32, seconds: f32) -> Box<dyn CaptureStream> {
    const SAMPLE_RATE: u32 = 44_100;
    let chunk = (SAMPLE_RATE as f32 * TONE_CHUNK.as_secs_f32()) as usize;
    let total = (SAMPLE_RATE as f32 * seconds.max(0.0)) as usize;
    let step = 2.0 * std::f32::consts::PI * frequency / SAMPLE_RATE as f32;

    let buffers: Vec<AudioBuffer> = (0..total)
        .step_by(chunk)
        .map(|start| {
            let samples: Vec<f32> = (start..(start + chunk).min(total))
                .map(|i| 0.5 * (step * i as f32).sin())
                .collect();
            AudioBuffer::from_samples(SAMPLE_RATE, &samples)
        })
        .collect();
    info!(frequency, seconds, "synthesizing test tone");
    Box::new(ReplayStream::from_buffers(buffers).paced(TONE_CHUNK))
}

fn print_reading(reading: &DetectedPitch, json: bool) {
    if json {
        let line = serde_json::json!({
            "note": reading.fundamental.to_string(),
            "frequency": reading.estimated_frequency,
            "cents": reading.error_in_cents,
        });
        println!("{line}");
    } else {
        println!(
            "{:<4} {:>8.2} Hz {:>+7.1} cents  {}",
            reading.fundamental.to_string(),
            reading.estimated_frequency,
            reading.error_in_cents,
            meter(reading.error_in_cents)
        );
    }
}

/// Needle over +-50 cents, one column per 5 cents.
fn meter(cents: f32) -> String {
    const HALF: i32 = 10;
    let position = ((cents / 5.0).round() as i32).clamp(-HALF, HALF);
    (-HALF..=HALF)
        .map(|i| match i {
            i if i == position => '*',
            0 => '|',
            _ => '-',
        })
        .collect()
}

#[cfg(feature = "cpal")]
mod devices {
    use anyhow::{Context, Result};
    use tracing::info;
    use tuner_core::capture::CpalBackend;
    use tuner_core::{CaptureBackend, CaptureStream, pick_device};

    pub fn list() -> Result<()> {
        let devices = CpalBackend::new().devices().context("listing capture devices")?;
        for device in devices {
            let marker = if device.is_default { "*" } else { " " };
            println!("{marker} {}", device.name);
        }
        Ok(())
    }

    pub fn open(preferred: Option<&str>) -> Result<Box<dyn CaptureStream>> {
        let backend = CpalBackend::new();
        let devices = backend.devices().context("listing capture devices")?;
        let device = pick_device(&devices, preferred)?;
        info!(device = %device.name, "opening capture device");
        backend
            .open(&device)
            .with_context(|| format!("failed to open {}", device.name))
    }
}

#[cfg(not(feature = "cpal"))]
mod devices {
    use anyhow::{Result, bail};
    use tuner_core::CaptureStream;

    const NO_CAPTURE: &str =
        "built without live capture; rebuild with `--features cpal` or pass --tone";

    pub fn list() -> Result<()> {
        bail!(NO_CAPTURE)
    }

    pub fn open(_preferred: Option<&str>) -> Result<Box<dyn CaptureStream>> {
        bail!(NO_CAPTURE)
    }
}
