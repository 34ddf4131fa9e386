//! # Fast Fourier Transform (FFT) Module
//!
//! Radix-2 decimation-in-time Cooley-Tukey transform producing the power
//! spectrum of a window of samples.
//!
//! ## Features
//! - Inputs of any length, zero-padded up to the next power of two
//! - Complex workspace pooled per engine and cleared before every use
//! - Squared-magnitude output over the full (padded) transform size

use object_pool::Pool;
use rustfft::num_complex::Complex;
use std::f64::consts::PI;

/// Size of the transform used for a window of `len` samples.
pub fn transform_size(len: usize) -> usize {
    if len == 0 { 0 } else { len.next_power_of_two() }
}

/// FFT engine owning its scratch arena.
///
/// Each engine keeps its own pool so engines on different threads never
/// contend for workspace.
pub struct FftEngine {
    workspace: Pool<Vec<Complex<f64>>>,
}

impl Default for FftEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FftEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FftEngine")
            .field("pooled_workspaces", &self.workspace.len())
            .finish()
    }
}

impl FftEngine {
    pub fn new() -> Self {
        FftEngine {
            workspace: Pool::new(1, Vec::new),
        }
    }

    /// Number of workspaces currently parked in the pool.
    pub fn pooled_workspaces(&self) -> usize {
        self.workspace.len()
    }

    /// Returns the power spectrum of `samples`.
    pub fn power_spectrum(&self, samples: &[f32]) -> Vec<f64> {
        let mut spectrum = Vec::new();
        self.power_spectrum_into(samples, &mut spectrum);
        spectrum
    }

    /// Writes the power spectrum of `samples` into `spectrum`, replacing its
    /// contents. The output length is [`transform_size`] of the input.
    pub fn power_spectrum_into(&self, samples: &[f32], spectrum: &mut Vec<f64>) {
        spectrum.clear();
        let n = transform_size(samples.len());
        if n == 0 {
            return;
        }

        // Returned to the pool when dropped, whichever way this function exits.
        let mut data = self.workspace.pull(Vec::new);
        data.clear();
        data.resize(n, Complex::new(0.0, 0.0));

        let bits = n.trailing_zeros();
        for (i, &sample) in samples.iter().enumerate() {
            data[reverse_bits(i, bits)] = Complex::new(sample as f64, 0.0);
        }

        butterflies(&mut data);

        spectrum.extend(data.iter().map(|c| c.norm_sqr()));
    }
}

fn reverse_bits(i: usize, bits: u32) -> usize {
    if bits == 0 {
        return 0;
    }
    i.reverse_bits() >> (usize::BITS - bits)
}

/// log2(n) butterfly stages over bit-reversed input.
fn butterflies(data: &mut [Complex<f64>]) {
    let n = data.len();
    let mut half = 1;
    while half < n {
        let span = half * 2;
        let alpha = -2.0 * PI / span as f64;
        for k in 0..half {
            // e^(-2*pi*i*k/span)
            let twiddle = Complex::from_polar(1.0, alpha * k as f64);
            let mut j = k;
            while j < n {
                let even = data[j];
                let odd = twiddle * data[j + half];
                data[j] = even + odd;
                data[j + half] = even - odd;
                j += span;
            }
        }
        half = span;
    }
}
