//! FFT peak picking with a time-domain refinement scan.
//!
//! The spectrum only narrows the search: each strong bin maps to a small
//! range of candidate periods, and the period whose shifted copy of the
//! signal matches best wins.

use object_pool::Pool;
use tracing::trace;

use super::{PitchEstimator, next_power_of_two_window};
use crate::config::SpectralConfig;
use crate::fft::FftEngine;

/// Frequency-domain estimator (one of the two engine strategies).
pub struct SpectralPitchEstimator {
    sample_rate: u32,
    config: SpectralConfig,
    fft: FftEngine,
    spectra: Pool<Vec<f64>>,
    peaks: Pool<PeakScratch>,
}

/// Peak-value scratch: parallel bin indices and powers of the current top-K.
#[derive(Default)]
struct PeakScratch {
    indices: Vec<usize>,
    values: Vec<f64>,
}

impl SpectralPitchEstimator {
    pub fn new(sample_rate: u32, config: SpectralConfig) -> Self {
        SpectralPitchEstimator {
            sample_rate,
            config,
            fft: FftEngine::new(),
            spectra: Pool::new(1, Vec::new),
            peaks: Pool::new(1, PeakScratch::default),
        }
    }

    /// Window length for this estimator at `sample_rate`.
    pub fn window_size(sample_rate: u32, config: &SpectralConfig) -> usize {
        next_power_of_two_window(sample_rate, config.min_frequency) * 2 * config.buffer_seconds
    }

    /// Scratch buffers currently parked in this estimator's pools.
    pub fn pooled_buffers(&self) -> usize {
        self.fft.pooled_workspaces() + self.spectra.len() + self.peaks.len()
    }

    fn find_fundamental(&self, signal: &[f32]) -> f64 {
        let mut spectrum = self.spectra.pull(Vec::new);
        self.fft.power_spectrum_into(signal, &mut spectrum);
        let n = spectrum.len();
        if n == 0 {
            return 0.0;
        }

        let sample_rate = self.sample_rate as f64;
        let min_bin = (self.config.min_frequency as f64 * n as f64 / sample_rate) as usize;
        let max_bin =
            ((self.config.max_frequency as f64 * n as f64 / sample_rate) as usize + 1).min(n);
        if max_bin <= min_bin + self.config.peak_count {
            return 0.0;
        }

        let usable = &spectrum[min_bin..max_bin];
        let mean = usable.iter().sum::<f64>() / usable.len() as f64;
        let threshold = mean * self.config.noise_multiplier;
        if !usable.iter().any(|&power| power > threshold) {
            // Flat or silent spectrum.
            return 0.0;
        }

        let mut peaks = self.peaks.pull(PeakScratch::default);
        find_peaks(&spectrum, min_bin, max_bin, self.config.peak_count, &mut peaks);
        if peaks.indices.contains(&min_bin) {
            // The lowest usable bin is among the strongest: broadband noise.
            return 0.0;
        }

        let verify_length = (sample_rate / self.config.min_frequency as f64) as usize;
        let mut best_error = f64::INFINITY;
        let mut best_interval = 0;
        for &index in &peaks.indices {
            if index == 0 {
                continue;
            }
            let shortest = n / (index + 1);
            let longest = n / index;
            if let Some((interval, error)) = scan_intervals(
                signal,
                verify_length,
                shortest,
                longest,
                self.config.max_interval_steps,
            ) {
                if error < best_error {
                    best_error = error;
                    best_interval = interval;
                }
            }
        }

        trace!(peaks = ?peaks.indices, best_interval, best_error, "spectral refinement");
        if best_interval == 0 {
            return 0.0;
        }
        sample_rate / best_interval as f64
    }
}

impl PitchEstimator for SpectralPitchEstimator {
    fn required_window_size(&self) -> usize {
        Self::window_size(self.sample_rate, &self.config)
    }

    fn frequency_range(&self) -> (f32, f32) {
        (self.config.min_frequency, self.config.max_frequency)
    }

    fn estimate(&self, window: &[f32]) -> f32 {
        self.find_fundamental(window) as f32
    }
}

/// Keeps the `count` strongest bins of `values[start..end]`.
///
/// Seeds the set with the first `count` bins and only replaces the weakest
/// member with a strictly stronger bin, so a flat spectrum keeps `start`.
fn find_peaks(values: &[f64], start: usize, end: usize, count: usize, peaks: &mut PeakScratch) {
    peaks.indices.clear();
    peaks.values.clear();
    peaks.indices.extend(start..start + count);
    peaks.values.extend_from_slice(&values[start..start + count]);

    let mut weakest = weakest_peak(&peaks.values);
    for (index, &value) in values.iter().enumerate().take(end).skip(start + count) {
        if peaks.values[weakest] < value {
            peaks.values[weakest] = value;
            peaks.indices[weakest] = index;
            weakest = weakest_peak(&peaks.values);
        }
    }
}

fn weakest_peak(values: &[f64]) -> usize {
    let mut weakest = 0;
    for (i, &value) in values.iter().enumerate().skip(1) {
        if values[weakest] > value {
            weakest = i;
        }
    }
    weakest
}

/// Tries up to `max_steps` evenly spaced periods in `[shortest, longest]`,
/// both ends included, and returns the one with the smallest squared
/// difference between the signal and its shifted copy over the first
/// `length` samples.
fn scan_intervals(
    signal: &[f32],
    length: usize,
    shortest: usize,
    longest: usize,
    max_steps: usize,
) -> Option<(usize, f64)> {
    let span = longest.saturating_sub(shortest);
    let hypotheses = (span + 1).min(max_steps).max(1);
    let mut best: Option<(usize, f64)> = None;
    for step in 0..hypotheses {
        let interval = match hypotheses {
            1 => shortest,
            _ => shortest + span * step / (hypotheses - 1),
        };
        if interval == 0 || interval + length > signal.len() {
            continue;
        }
        let error: f64 = signal[..length]
            .iter()
            .zip(&signal[interval..interval + length])
            .map(|(&a, &b)| {
                let diff = a as f64 - b as f64;
                diff * diff
            })
            .sum();
        if best.is_none_or(|(_, e)| error < e) {
            best = Some((interval, error));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / 44_100.0).sin() as f32)
            .collect()
    }

    #[test]
    fn window_size_scales_with_buffer_seconds() {
        let config = SpectralConfig::default();
        // next_pow2(ceil(44100 / 60)) = 1024, times 2 * 3
        assert_eq!(SpectralPitchEstimator::window_size(44_100, &config), 6144);
    }

    #[test]
    fn find_peaks_keeps_strongest_bins() {
        let values = [0.0, 1.0, 9.0, 2.0, 7.0, 3.0, 8.0, 0.5];
        let mut peaks = PeakScratch::default();
        find_peaks(&values, 1, values.len(), 3, &mut peaks);
        let mut indices = peaks.indices.clone();
        indices.sort_unstable();
        assert_eq!(indices, vec![2, 4, 6]);
    }

    #[test]
    fn flat_spectrum_keeps_first_bin() {
        let values = [1.0; 16];
        let mut peaks = PeakScratch::default();
        find_peaks(&values, 4, 16, 5, &mut peaks);
        assert!(peaks.indices.contains(&4));
    }

    #[test]
    fn scan_prefers_true_period() {
        let signal = sine(441.0, 4096);
        let (interval, error) = scan_intervals(&signal, 735, 95, 105, 30).unwrap();
        assert_eq!(interval, 100);
        assert!(error < 1e-6);
    }

    #[test]
    fn scan_reaches_the_longest_period() {
        // Bin 75 of a 8192-point transform spans periods 107..=109.
        let signal = sine(44_100.0 / 109.0, 4096);
        let (interval, error) = scan_intervals(&signal, 800, 8192 / 76, 8192 / 75, 30).unwrap();
        assert_eq!(interval, 109);
        assert!(error < 1e-6);
    }

    #[test]
    fn scan_spreads_hypotheses_across_wide_ranges() {
        let signal = sine(44_100.0 / 160.0, 4096);
        // 5 hypotheses over [100, 160]: 100, 115, 130, 145, 160.
        let (interval, _) = scan_intervals(&signal, 735, 100, 160, 5).unwrap();
        assert_eq!(interval, 160);
    }

    #[test]
    fn detects_pure_tone_window() {
        let estimator = SpectralPitchEstimator::new(44_100, SpectralConfig::default());
        let signal = sine(440.0, estimator.required_window_size());
        let freq = estimator.estimate(&signal);
        assert!((439.0..=441.0).contains(&freq), "{freq}");
    }

    #[test]
    fn silence_is_not_a_pitch() {
        let estimator = SpectralPitchEstimator::new(44_100, SpectralConfig::default());
        assert_eq!(estimator.estimate(&vec![0.0; 6144]), 0.0);
    }

    #[test]
    fn scratch_returns_to_pool_on_early_exit() {
        let estimator = SpectralPitchEstimator::new(44_100, SpectralConfig::default());
        let before = estimator.pooled_buffers();
        estimator.estimate(&vec![0.0; 6144]);
        estimator.estimate(&sine(440.0, 6144));
        estimator.estimate(&[]);
        assert_eq!(estimator.pooled_buffers(), before);
    }
}
