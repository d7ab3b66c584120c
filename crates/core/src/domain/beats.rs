//! Beat overlay: beat positions and tempo for the waveform display

use super::audio::{Result, SampleBuffer};
use super::dsp::spectral::Stft;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Beat markers derived from a buffer; informational only
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BeatOverlay {
    /// Ascending beat positions in seconds
    pub beat_times: Vec<f64>,
    pub tempo_bpm: f64,
}

impl BeatOverlay {
    pub fn is_empty(&self) -> bool {
        self.beat_times.is_empty()
    }
}

/// Beat/tempo analysis backend
pub trait BeatDetector: Send + Sync {
    fn detect(&self, buffer: &SampleBuffer) -> Result<BeatOverlay>;

    fn name(&self) -> &'static str;
}

/// Spectral-flux onset envelope with autocorrelation tempo estimation
#[derive(Debug, Clone)]
pub struct OnsetBeatDetector {
    pub min_bpm: f64,
    pub max_bpm: f64,
    /// Centre of the tempo prior; ambiguous octaves resolve towards it
    pub prior_bpm: f64,
    /// Half-width of the search window around each predicted beat, as a fraction of the period
    pub tolerance: f64,
}

impl Default for OnsetBeatDetector {
    fn default() -> Self {
        Self {
            min_bpm: 60.0,
            max_bpm: 200.0,
            prior_bpm: 120.0,
            tolerance: 0.1,
        }
    }
}

impl OnsetBeatDetector {
    /// Half-wave rectified log-magnitude flux per STFT frame
    fn onset_envelope(&self, stft: &Stft, mono: &[f32]) -> Vec<f32> {
        let spectrum = stft.analyze(mono);
        let mut previous: Option<Vec<f32>> = None;
        let mut envelope = Vec::with_capacity(spectrum.len());

        for frame in &spectrum {
            let magnitude: Vec<f32> = frame.iter().map(|c| (1.0 + 10.0 * c.norm()).ln()).collect();
            let flux = match &previous {
                Some(prev) => magnitude
                    .iter()
                    .zip(prev.iter())
                    .map(|(m, p)| (m - p).max(0.0))
                    .sum(),
                None => 0.0,
            };
            envelope.push(flux);
            previous = Some(magnitude);
        }
        envelope
    }

    /// Best beat period in envelope frames
    fn estimate_period(&self, envelope: &[f32], frame_rate: f64) -> Option<usize> {
        let min_lag = ((60.0 * frame_rate / self.max_bpm).round() as usize).max(1);
        let max_lag = ((60.0 * frame_rate / self.min_bpm).round() as usize).min(envelope.len() / 2);
        if max_lag < min_lag {
            return None;
        }

        let mean = envelope.iter().sum::<f32>() / envelope.len() as f32;
        let centered: Vec<f32> = envelope.iter().map(|v| v - mean).collect();

        let mut best: Option<(usize, f64)> = None;
        for lag in min_lag..=max_lag {
            let corr: f64 = centered
                .iter()
                .zip(centered[lag..].iter())
                .map(|(a, b)| (*a as f64) * (*b as f64))
                .sum::<f64>()
                / (centered.len() - lag) as f64;
            let bpm = 60.0 * frame_rate / lag as f64;
            let octaves = (bpm / self.prior_bpm).log2();
            let score = corr * (-0.5 * octaves * octaves).exp();
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((lag, score));
            }
        }

        best.filter(|(_, score)| *score > 0.0).map(|(lag, _)| lag)
    }

    /// Step through the envelope one period at a time, snapping to local peaks
    fn track(&self, envelope: &[f32], period: usize) -> Vec<usize> {
        let radius = ((period as f64 * self.tolerance).round() as usize).max(1);
        let argmax = |lo: usize, hi: usize| -> usize {
            (lo..hi.min(envelope.len()))
                .fold(lo, |best, i| if envelope[i] > envelope[best] { i } else { best })
        };

        let mut beats = vec![argmax(0, period)];
        loop {
            let Some(&last) = beats.last() else { break };
            let predicted = last + period;
            if predicted >= envelope.len() {
                break;
            }
            let lo = predicted.saturating_sub(radius).max(last + 1);
            let next = argmax(lo, predicted + radius + 1);
            beats.push(next);
        }
        beats
    }
}

impl BeatDetector for OnsetBeatDetector {
    fn detect(&self, buffer: &SampleBuffer) -> Result<BeatOverlay> {
        let mono = buffer.to_mono();
        let stft = Stft::default();
        let envelope = self.onset_envelope(&stft, &mono);

        let peak = envelope.iter().cloned().fold(0.0f32, f32::max);
        if peak <= f32::EPSILON {
            debug!("No onsets found");
            return Ok(BeatOverlay::default());
        }

        let frame_rate = buffer.sample_rate() as f64 / stft.hop() as f64;
        let Some(period) = self.estimate_period(&envelope, frame_rate) else {
            debug!(frames = envelope.len(), "Too short for tempo estimation");
            return Ok(BeatOverlay::default());
        };

        let seconds_per_frame = stft.hop() as f64 / buffer.sample_rate() as f64;
        let duration = buffer.duration_secs();
        let beat_times: Vec<f64> = self
            .track(&envelope, period)
            .into_iter()
            .map(|frame| frame as f64 * seconds_per_frame)
            .filter(|t| *t <= duration)
            .collect();
        let tempo_bpm = 60.0 * frame_rate / period as f64;

        debug!(tempo_bpm, beats = beat_times.len(), "Beats detected");
        Ok(BeatOverlay {
            beat_times,
            tempo_bpm,
        })
    }

    fn name(&self) -> &'static str {
        "onset"
    }
}
