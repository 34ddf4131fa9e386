//! Bitstream autocorrelation over zero crossings.
//!
//! The window is reduced to one bit per sample (is the waveform in its
//! positive phase?). Correlating the bitstream with shifted copies of itself
//! is then an XOR and a popcount per 64 samples instead of a multiply-add
//! per sample.

use object_pool::Pool;
use tracing::trace;

use super::{PitchEstimator, next_power_of_two_window};
use crate::config::BitstreamConfig;

/// Packed zero-crossing bitstream, one bit per sample, LSB first.
#[derive(Debug, Clone, PartialEq)]
pub struct ZeroCrossingBits {
    words: Vec<u64>,
    len: usize,
}

impl ZeroCrossingBits {
    /// Encodes `signal` with hysteresis: the bit turns on once a sample rises
    /// above `high`, off once one falls below `low`, and holds otherwise.
    pub fn from_signal(signal: &[f32], high: f32, low: f32) -> Self {
        // One spare word so shifted reads never run off the end.
        let mut words = vec![0u64; signal.len().div_ceil(64) + 1];
        let mut state = false;
        for (i, &sample) in signal.iter().enumerate() {
            if sample < low {
                state = false;
            } else if sample > high {
                state = true;
            }
            if state {
                words[i / 64] |= 1 << (i % 64);
            }
        }
        ZeroCrossingBits {
            words,
            len: signal.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: usize) -> bool {
        i < self.len && (self.words[i / 64] >> (i % 64)) & 1 == 1
    }

    /// 64 bits starting at bit `pos`.
    fn word_at(&self, pos: usize) -> u64 {
        let (q, r) = (pos / 64, pos % 64);
        let low = self.words.get(q).copied().unwrap_or(0);
        if r == 0 {
            return low;
        }
        let high = self.words.get(q + 1).copied().unwrap_or(0);
        (low >> r) | (high << (64 - r))
    }

    /// Number of positions in `[0, length)` where the stream disagrees with
    /// itself shifted by `offset`.
    ///
    /// # Panics
    /// If `offset + length` exceeds the stream length.
    pub fn mismatches(&self, offset: usize, length: usize) -> u32 {
        assert!(offset + length <= self.len, "correlation runs past the bitstream");
        let mut count = 0;
        let mut pos = 0;
        while pos < length {
            let mut diff = self.word_at(pos) ^ self.word_at(pos + offset);
            let remaining = length - pos;
            if remaining < 64 {
                diff &= (1u64 << remaining) - 1;
            }
            count += diff.count_ones();
            pos += 64;
        }
        count
    }

    /// Index of the first off-to-on transition at or after `from`.
    pub fn next_rising_edge(&self, from: usize) -> Option<usize> {
        (from.max(1)..self.len).find(|&i| !self.get(i - 1) && self.get(i))
    }
}

/// Autocorrelation estimator (the alternative engine strategy).
pub struct ZeroCrossingAutocorrelationEstimator {
    sample_rate: u32,
    config: BitstreamConfig,
    /// Shortest period allowed, in samples.
    min_period: f32,
    correlations: Pool<Vec<u32>>,
}

impl ZeroCrossingAutocorrelationEstimator {
    pub fn new(sample_rate: u32, config: BitstreamConfig) -> Self {
        let min_period = sample_rate as f32 / config.max_frequency;
        ZeroCrossingAutocorrelationEstimator {
            sample_rate,
            config,
            min_period,
            correlations: Pool::new(1, Vec::new),
        }
    }

    /// Window length for this estimator at `sample_rate`.
    pub fn window_size(sample_rate: u32, config: &BitstreamConfig) -> usize {
        next_power_of_two_window(sample_rate, config.min_frequency) * config.buffer_multiplier
    }

    pub fn pooled_buffers(&self) -> usize {
        self.correlations.len()
    }

    /// Mismatch count for every offset in `[0, len / 2)`.
    fn correlate(bits: &ZeroCrossingBits, counts: &mut Vec<u32>) {
        let half = bits.len() / 2;
        counts.clear();
        counts.extend((0..half).map(|offset| bits.mismatches(offset, half)));
    }

    /// Divides `estimate` by the largest divisor whose implied sub-periods
    /// all correlate strongly. Returns the (fractional) period and the
    /// divisor used.
    fn reject_subharmonics(&self, counts: &[u32], estimate: usize, max_count: u32) -> (f32, usize) {
        let threshold = self.config.subharmonic_threshold * max_count as f32;
        let max_divisor = (estimate as f32 / self.min_period) as usize;
        for divisor in (1..=max_divisor).rev() {
            let all_strong =
                (1..divisor).all(|k| count_near(counts, k * estimate, divisor) < threshold);
            if all_strong {
                return (estimate as f32 / divisor as f32, divisor);
            }
        }
        (estimate as f32, 1)
    }

    /// Measures the period between interpolated rising zero crossings,
    /// spanning as many whole cycles as the window holds.
    fn refine_period(&self, signal: &[f32], bits: &ZeroCrossingBits, period: f32) -> Option<f32> {
        let start = bits.next_rising_edge(1)?;
        let room = signal.len() as f32 - 1.0 - start as f32 - period / 2.0;
        if room < period {
            return None;
        }
        let target = start as f32 + (room / period).floor() * period - period / 2.0;
        let next = bits.next_rising_edge(target.ceil() as usize)?;
        // Count the cycles actually spanned rather than the ones aimed for.
        let cycles = ((next - start) as f32 / period).round();
        if cycles < 1.0 {
            return None;
        }

        let entry = self.crossing_fraction(signal, start);
        let exit = self.crossing_fraction(signal, next);
        let span = (next - start) as f32 + (exit - entry);
        Some(span / cycles)
    }

    /// Fractional position of the threshold crossing between samples
    /// `index - 1` (not above) and `index` (above).
    fn crossing_fraction(&self, signal: &[f32], index: usize) -> f32 {
        let prev = signal[index - 1];
        let dy = signal[index] - prev;
        if dy <= 0.0 {
            return 0.0;
        }
        (self.config.high_threshold - prev) / dy
    }
}

/// Lower of the two counts around the sub-period `numerator / divisor`,
/// which rarely lands on a whole offset.
fn count_near(counts: &[u32], numerator: usize, divisor: usize) -> f32 {
    let below = numerator / divisor;
    let above = if numerator % divisor == 0 {
        below
    } else {
        (below + 1).min(counts.len() - 1)
    };
    counts[below].min(counts[above]) as f32
}

impl PitchEstimator for ZeroCrossingAutocorrelationEstimator {
    fn required_window_size(&self) -> usize {
        Self::window_size(self.sample_rate, &self.config)
    }

    fn frequency_range(&self) -> (f32, f32) {
        (self.config.min_frequency, self.config.max_frequency)
    }

    fn estimate(&self, window: &[f32]) -> f32 {
        if window.len() < 4 {
            return 0.0;
        }
        let bits = ZeroCrossingBits::from_signal(
            window,
            self.config.high_threshold,
            self.config.low_threshold,
        );

        let mut counts = self.correlations.pull(Vec::new);
        Self::correlate(&bits, &mut counts);

        let max_count = counts.iter().copied().max().unwrap_or(0);
        if max_count == 0 {
            // Constant bitstream: silence or DC.
            return 0.0;
        }

        // Offset 0 always matches perfectly, so the search starts at 1.
        let Some((estimate, _)) = counts
            .iter()
            .enumerate()
            .skip(1)
            .min_by_key(|&(offset, &count)| (count, offset))
        else {
            return 0.0;
        };

        let (period, divisor) = self.reject_subharmonics(&counts, estimate, max_count);

        let refined = self.refine_period(window, &bits, period);
        trace!(estimate, divisor, period, ?refined, max_count, "bitstream correlation");
        match refined {
            Some(samples) if samples > 0.0 => self.sample_rate as f32 / samples,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sine_at(freq: f64, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let t = i as f64 / sample_rate as f64;
                (2.0 * std::f64::consts::PI * freq * t).sin() as f32
            })
            .collect()
    }

    fn sine(freq: f64, len: usize) -> Vec<f32> {
        sine_at(freq, 44_100, len)
    }

    #[test]
    fn hysteresis_holds_state_in_dead_band() {
        let signal = [-0.5, 0.2, -0.05, -0.05, 0.3, -0.2, -0.05, 0.01];
        let bits = ZeroCrossingBits::from_signal(&signal, 0.0, -0.1);
        let decoded: Vec<bool> = (0..signal.len()).map(|i| bits.get(i)).collect();
        assert_eq!(decoded, vec![false, true, true, true, true, false, false, true]);
    }

    #[test]
    fn mismatches_match_naive_count() {
        let signal: Vec<f32> = (0..300)
            .map(|i| if (i * 7 / 13) % 3 == 0 { 1.0 } else { -1.0 })
            .collect();
        let bits = ZeroCrossingBits::from_signal(&signal, 0.0, -0.1);
        for offset in [0, 1, 5, 63, 64, 65, 100, 149] {
            let naive = (0..150).filter(|&i| bits.get(i) != bits.get(i + offset)).count() as u32;
            assert_eq!(bits.mismatches(offset, 150), naive, "offset {offset}");
        }
        assert_eq!(bits.mismatches(0, 150), 0);
    }

    #[test]
    fn finds_rising_edges() {
        let bits = ZeroCrossingBits::from_signal(&[-1.0, -1.0, 1.0, 1.0, -1.0, 1.0], 0.0, -0.1);
        assert_eq!(bits.next_rising_edge(0), Some(2));
        assert_eq!(bits.next_rising_edge(3), Some(5));
        assert_eq!(bits.next_rising_edge(6), None);
    }

    #[test]
    fn window_size_is_twice_the_longest_period_power() {
        let config = BitstreamConfig::default();
        assert_eq!(ZeroCrossingAutocorrelationEstimator::window_size(44_100, &config), 2048);
        assert_eq!(ZeroCrossingAutocorrelationEstimator::window_size(48_000, &config), 2048);
    }

    #[test]
    fn detects_pure_tone() {
        let estimator =
            ZeroCrossingAutocorrelationEstimator::new(44_100, BitstreamConfig::default());
        let signal = sine(440.0, estimator.required_window_size());
        let freq = estimator.estimate(&signal);
        assert!((439.0..=441.0).contains(&freq), "{freq}");
    }

    #[test]
    fn locks_onto_fundamental_not_multiple() {
        let estimator =
            ZeroCrossingAutocorrelationEstimator::new(44_100, BitstreamConfig::default());
        for freq in [110.0, 196.0, 329.63, 659.25] {
            let signal = sine(freq, estimator.required_window_size());
            let estimated = estimator.estimate(&signal) as f64;
            assert!((estimated - freq).abs() < 0.5, "{freq}: {estimated}");
        }
    }

    #[rstest]
    #[case(748.66, 44_100)]
    #[case(1244.51, 48_000)]
    #[case(65.41, 48_000)]
    #[case(880.0, 8_000)]
    fn fractional_sub_periods_are_refined(#[case] freq: f64, #[case] sample_rate: u32) {
        let config = BitstreamConfig::default();
        let estimator = ZeroCrossingAutocorrelationEstimator::new(sample_rate, config);
        let signal = sine_at(freq, sample_rate, estimator.required_window_size());
        let estimated = estimator.estimate(&signal) as f64;
        let cents = 1200.0 * (estimated / freq).log2();
        assert!(cents.abs() < 1.0, "{freq} Hz at {sample_rate}: {estimated} ({cents:+.1} cents)");
    }

    #[test]
    fn sub_period_count_takes_the_better_neighbour() {
        let counts = [0, 40, 40, 51, 6, 40];
        // 7 / 2 = 3.5 sits between offsets 3 and 4.
        assert_eq!(count_near(&counts, 7, 2), 6.0);
        assert_eq!(count_near(&counts, 6, 2), 51.0);
        // Never reads past the end.
        assert_eq!(count_near(&counts, 11, 2), 40.0);
    }

    #[test]
    fn silence_is_not_a_pitch() {
        let estimator =
            ZeroCrossingAutocorrelationEstimator::new(44_100, BitstreamConfig::default());
        assert_eq!(estimator.estimate(&vec![0.0; 2048]), 0.0);
        assert_eq!(estimator.pooled_buffers(), 1);
    }
}
