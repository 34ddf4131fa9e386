//! # Musical Tuning Module
//!
//! Equal-temperament note table and the cents arithmetic used to turn an
//! estimated frequency into a tuner reading.
//!
//! ## Features
//! - 12 pitch classes x 9 octaves (C0 to B8), anchored on A4 = 440 Hz
//! - Nearest-note lookup restricted to a detector's valid frequency range
//! - Cent deviation calculations for tuning accuracy

use once_cell::sync::Lazy;
use std::fmt;

/// Concert pitch the table is anchored on.
pub const A4_FREQUENCY: f32 = 440.0;

/// Number of octaves in the note table (0 through 8).
pub const OCTAVE_COUNT: u8 = 9;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "Eb", "E", "F", "F#", "G", "G#", "A", "Bb", "B",
];

/// Semitone distance from C0 to A4.
const A4_SEMITONES_FROM_C0: i32 = 4 * 12 + 9;

/// A single equal-tempered note.
///
/// The empty note (`Note::NONE`) stands for "no note".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Note {
    /// Pitch class name (e.g. "A", "C#", "Bb"), empty for the sentinel.
    pub name: &'static str,
    /// Frequency of this note in Hz.
    pub frequency: f32,
    /// Octave number in scientific pitch notation.
    pub octave: u8,
}

impl Note {
    /// The "no note" sentinel.
    pub const NONE: Note = Note {
        name: "",
        frequency: 0.0,
        octave: 0,
    };

    pub fn is_none(&self) -> bool {
        self.name.is_empty()
    }

    /// Frequency of the same pitch class at octave 0.
    pub fn base_frequency(&self) -> f32 {
        self.frequency / 2f32.powi(self.octave as i32)
    }

    /// Deviation of `estimated` from this note, in cents.
    pub fn cents_error(&self, estimated: f32) -> f32 {
        cents_error(estimated, self.frequency)
    }
}

impl Default for Note {
    fn default() -> Self {
        Note::NONE
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return Ok(());
        }
        write!(f, "{}{}", self.name, self.octave)
    }
}

/// Read-only table of every note the tuner can report, sorted by frequency.
#[derive(Debug)]
pub struct NoteTable {
    notes: Vec<Note>,
}

/// Built on first use and shared by every engine in the process.
static NOTES: Lazy<NoteTable> = Lazy::new(NoteTable::equal_tempered);

impl NoteTable {
    /// The process-wide table.
    pub fn global() -> &'static NoteTable {
        &NOTES
    }

    /// Builds the table from the 12 octave-0 pitch classes, stepping by the
    /// semitone ratio 2^(1/12) away from A4 and doubling per octave.
    fn equal_tempered() -> Self {
        let semitone = 2f64.powf(1.0 / 12.0);
        let bases: Vec<(&'static str, f64)> = NOTE_NAMES
            .iter()
            .enumerate()
            .map(|(i, &name)| {
                let steps = i as i32 - A4_SEMITONES_FROM_C0;
                (name, A4_FREQUENCY as f64 * semitone.powi(steps))
            })
            .collect();

        let mut notes = Vec::with_capacity(NOTE_NAMES.len() * OCTAVE_COUNT as usize);
        for octave in 0..OCTAVE_COUNT {
            for &(name, base) in &bases {
                notes.push(Note {
                    name,
                    frequency: (base * 2f64.powi(octave as i32)) as f32,
                    octave,
                });
            }
        }
        NoteTable { notes }
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Looks up a note by pitch class name and octave.
    pub fn find(&self, name: &str, octave: u8) -> Option<Note> {
        self.notes
            .iter()
            .find(|n| n.name == name && n.octave == octave)
            .copied()
    }

    /// Finds the note closest to `frequency` among the notes lying inside
    /// `[min_frequency, max_frequency]`.
    ///
    /// Returns [`Note::NONE`] when `frequency` is not positive or the range
    /// holds no note.
    pub fn closest_note(&self, frequency: f32, min_frequency: f32, max_frequency: f32) -> Note {
        if !(frequency > 0.0) {
            return Note::NONE;
        }
        self.notes
            .iter()
            .filter(|n| n.frequency >= min_frequency && n.frequency <= max_frequency)
            .min_by(|a, b| {
                let diff_a = (a.frequency - frequency).abs();
                let diff_b = (b.frequency - frequency).abs();
                diff_a.total_cmp(&diff_b)
            })
            .copied()
            .unwrap_or(Note::NONE)
    }
}

/// Calculates the deviation from a target frequency in cents.
///
/// - 100 cents = 1 semitone, 1200 cents = 1 octave
/// - Positive values indicate sharpness, negative values indicate flatness
///
/// Returns 0 when `target` is not positive.
pub fn cents_error(estimated: f32, target: f32) -> f32 {
    if target > 0.0 {
        (1200.0 * (estimated as f64 / target as f64).log2()) as f32
    } else {
        0.0
    }
}

/// Result of one detection call.
///
/// A frequency of 0 together with [`Note::NONE`] means nothing tonal was
/// found; it travels through the same path as real readings.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DetectedPitch {
    pub estimated_frequency: f32,
    pub fundamental: Note,
    pub error_in_cents: f32,
}

impl DetectedPitch {
    pub const NONE: DetectedPitch = DetectedPitch {
        estimated_frequency: 0.0,
        fundamental: Note::NONE,
        error_in_cents: 0.0,
    };

    /// Resolves `frequency` against the global table within the given range.
    pub fn resolve(frequency: f32, min_frequency: f32, max_frequency: f32) -> Self {
        if !(frequency > 0.0) || !frequency.is_finite() {
            return DetectedPitch::NONE;
        }
        let note = NoteTable::global().closest_note(frequency, min_frequency, max_frequency);
        if note.is_none() {
            return DetectedPitch::NONE;
        }
        DetectedPitch {
            estimated_frequency: frequency,
            fundamental: note,
            error_in_cents: note.cents_error(frequency),
        }
    }

    pub fn is_detected(&self) -> bool {
        !self.fundamental.is_none() && self.estimated_frequency > 0.0
    }
}
