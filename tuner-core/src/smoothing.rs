//! # Reading Aggregation
//!
//! Raw detections flicker between neighbouring notes when a string is
//! plucked. [`PitchAggregator`] collects readings over a short window and
//! reports the note seen most often, with its frequencies averaged.

use std::time::{Duration, Instant};

use crate::config::SmoothingConfig;
use crate::tuning::{DetectedPitch, Note};

#[derive(Debug, Clone)]
pub struct PitchAggregator {
    window: Duration,
    started: Option<Instant>,
    readings: Vec<DetectedPitch>,
}

impl PitchAggregator {
    pub fn new(window: Duration) -> Self {
        PitchAggregator {
            window,
            started: None,
            readings: Vec::new(),
        }
    }

    pub fn from_config(config: &SmoothingConfig) -> Self {
        Self::new(Duration::from_millis(config.window_ms))
    }

    /// Records `pitch` observed at `at`.
    ///
    /// Returns the aggregate of the previous window once `at` falls past its
    /// end. Sentinel readings are ignored, so a window without any positive
    /// detection yields nothing.
    pub fn push(&mut self, pitch: DetectedPitch, at: Instant) -> Option<DetectedPitch> {
        let started = *self.started.get_or_insert(at);
        let mut reading = None;
        if at.duration_since(started) >= self.window {
            reading = self.flush();
            self.started = Some(at);
        }
        if pitch.is_detected() {
            self.readings.push(pitch);
        }
        reading
    }

    /// Aggregates and clears whatever has been collected so far.
    pub fn flush(&mut self) -> Option<DetectedPitch> {
        let reading = aggregate(&self.readings);
        self.readings.clear();
        reading
    }

    pub fn pending(&self) -> usize {
        self.readings.len()
    }
}

struct Tally {
    note: Note,
    count: usize,
    frequency_sum: f64,
}

fn same_note(a: &Note, b: &Note) -> bool {
    a.name == b.name && a.octave == b.octave
}

/// Majority note of `readings`, ties going to the note seen first.
fn aggregate(readings: &[DetectedPitch]) -> Option<DetectedPitch> {
    let mut tallies: Vec<Tally> = Vec::new();
    for reading in readings {
        match tallies.iter_mut().find(|t| same_note(&t.note, &reading.fundamental)) {
            Some(tally) => {
                tally.count += 1;
                tally.frequency_sum += reading.estimated_frequency as f64;
            }
            None => tallies.push(Tally {
                note: reading.fundamental,
                count: 1,
                frequency_sum: reading.estimated_frequency as f64,
            }),
        }
    }

    let mut winner: Option<&Tally> = None;
    for tally in &tallies {
        if winner.is_none_or(|w| tally.count > w.count) {
            winner = Some(tally);
        }
    }
    let winner = winner?;
    let frequency = (winner.frequency_sum / winner.count as f64) as f32;
    Some(DetectedPitch {
        estimated_frequency: frequency,
        fundamental: winner.note,
        error_in_cents: winner.note.cents_error(frequency),
    })
}
