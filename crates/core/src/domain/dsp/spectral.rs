//! Short-time Fourier transform used by the equalizer and time-stretcher

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

/// Analysis frame length in samples
pub const N_FFT: usize = 2048;
/// Hop between successive frames in samples
pub const HOP: usize = 512;

/// Normalisation floor below which output samples are left untouched
const WINDOW_SUM_EPSILON: f32 = 1e-8;

/// Centered STFT with a periodic Hann window
pub struct Stft {
    n_fft: usize,
    hop: usize,
    window: Vec<f32>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl Stft {
    pub fn new(n_fft: usize, hop: usize) -> Self {
        let mut planner = FftPlanner::new();
        let window = (0..n_fft)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / n_fft as f32).cos())
            .collect();
        Self {
            n_fft,
            hop,
            window,
            forward: planner.plan_fft_forward(n_fft),
            inverse: planner.plan_fft_inverse(n_fft),
        }
    }

    /// Number of non-negative frequency bins per frame
    pub fn bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    pub fn hop(&self) -> usize {
        self.hop
    }

    /// Centre frequency of bin `k` in Hz
    pub fn bin_frequency(&self, k: usize, sample_rate: u32) -> f32 {
        k as f32 * sample_rate as f32 / self.n_fft as f32
    }

    /// Frames of `bins()` complex coefficients, signal zero-padded by half a frame on both sides
    pub fn analyze(&self, signal: &[f32]) -> Vec<Vec<Complex<f32>>> {
        let pad = self.n_fft / 2;
        let mut padded = vec![0.0f32; signal.len() + 2 * pad];
        padded[pad..pad + signal.len()].copy_from_slice(signal);

        let n_frames = 1 + (padded.len() - self.n_fft) / self.hop;
        let mut scratch = vec![Complex::new(0.0, 0.0); self.n_fft];

        (0..n_frames)
            .map(|t| {
                let start = t * self.hop;
                for (i, slot) in scratch.iter_mut().enumerate() {
                    *slot = Complex::new(padded[start + i] * self.window[i], 0.0);
                }
                self.forward.process(&mut scratch);
                scratch[..self.bins()].to_vec()
            })
            .collect()
    }

    /// Inverse of [`Stft::analyze`], trimmed or zero-extended to `length` samples
    pub fn synthesize(&self, frames: &[Vec<Complex<f32>>], length: usize) -> Vec<f32> {
        let pad = self.n_fft / 2;
        let bins = self.bins();
        let total = self.n_fft + self.hop * frames.len().saturating_sub(1);
        let mut output = vec![0.0f32; total];
        let mut window_sum = vec![0.0f32; total];
        let mut scratch = vec![Complex::new(0.0, 0.0); self.n_fft];
        let scale = 1.0 / self.n_fft as f32;

        for (t, frame) in frames.iter().enumerate() {
            // Rebuild the Hermitian-symmetric spectrum of a real signal
            for k in 0..self.n_fft {
                scratch[k] = if k < bins {
                    frame.get(k).copied().unwrap_or_default()
                } else {
                    frame
                        .get(self.n_fft - k)
                        .map(|c| c.conj())
                        .unwrap_or_default()
                };
            }
            self.inverse.process(&mut scratch);

            let start = t * self.hop;
            for i in 0..self.n_fft {
                let w = self.window[i];
                output[start + i] += scratch[i].re * scale * w;
                window_sum[start + i] += w * w;
            }
        }

        for (sample, &sum) in output.iter_mut().zip(window_sum.iter()) {
            if sum > WINDOW_SUM_EPSILON {
                *sample /= sum;
            }
        }

        let mut result: Vec<f32> = output.into_iter().skip(pad).take(length).collect();
        result.resize(length, 0.0);
        result
    }
}

impl Default for Stft {
    fn default() -> Self {
        Self::new(N_FFT, HOP)
    }
}
