//! Effects engine
//!
//! Stateless transforms over a [`SampleBuffer`]. Every function returns a new
//! buffer; inputs are never modified. [`EffectsChain`] composes them in the
//! fixed order used when re-deriving the audible buffer from the original:
//!
//! volume → speed → pitch → reverb → echo → fade → equalizer

pub mod spectral;
pub mod stretch;

use crate::domain::audio::{AudioError, SampleBuffer};
use crate::domain::beats::{BeatDetector, BeatOverlay, OnsetBeatDetector};
use crate::domain::config::EffectTuning;
use crate::domain::params::EffectParams;
use serde::{Deserialize, Serialize};
use spectral::Stft;
use std::time::Instant;
use tracing::{debug, trace};

pub type Result<T> = std::result::Result<T, AudioError>;

/// Band edges of the three-band equalizer in Hz
pub mod bands {
    /// Bins strictly below this frequency belong to the bass band
    pub const BASS_UPPER: f32 = 200.0;
    /// Bins strictly above this frequency belong to the treble band
    pub const TREBLE_LOWER: f32 = 2000.0;
}

/// Convert a gain in decibels to a linear factor
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

fn ms_to_frames(ms: f32, sample_rate: u32) -> usize {
    (ms.max(0.0) as f64 * sample_rate as f64 / 1000.0).round() as usize
}

// ============================================================================
// EDITING
// ============================================================================

/// Keep `[start_secs, end_secs)` of the buffer
pub fn cut(buffer: &SampleBuffer, start_secs: f64, end_secs: f64) -> Result<SampleBuffer> {
    let duration = buffer.duration_secs();
    if !start_secs.is_finite()
        || !end_secs.is_finite()
        || start_secs < 0.0
        || end_secs <= start_secs
        || end_secs > duration + 1e-9
    {
        return Err(AudioError::validation(format!(
            "Invalid start or end time: [{}, {}] for a {:.3}s track",
            start_secs, end_secs, duration
        )));
    }

    let start = buffer.frame_at(start_secs);
    let end = buffer.frame_at(end_secs);
    trace!(start, end, "Cutting frames");
    Ok(buffer.slice_frames(start, end))
}

// ============================================================================
// GAIN AND TIME
// ============================================================================

/// Additive gain in dB; no clipping guard
pub fn change_volume(buffer: &SampleBuffer, gain_db: f32) -> Result<SampleBuffer> {
    let factor = db_to_linear(gain_db);
    buffer.map_channels(|c| Ok(c.iter().map(|s| s * factor).collect()))
}

/// Time-stretch each channel by `factor` keeping pitch; 2.0 plays twice as fast
pub fn change_speed(buffer: &SampleBuffer, factor: f32) -> Result<SampleBuffer> {
    if !(factor > 0.0) {
        return Err(AudioError::validation(format!(
            "Speed factor must be positive, got {}",
            factor
        )));
    }
    if factor == 1.0 {
        return Ok(buffer.clone());
    }
    buffer.map_channels(|c| stretch::time_stretch(c, factor as f64))
}

/// Shift each channel by `semitones` keeping duration
pub fn change_pitch(buffer: &SampleBuffer, semitones: f32) -> Result<SampleBuffer> {
    if semitones == 0.0 {
        return Ok(buffer.clone());
    }
    buffer.map_channels(|c| stretch::pitch_shift(c, semitones))
}

/// Resample every channel to `target_rate`
pub fn resample_to(buffer: &SampleBuffer, target_rate: u32) -> Result<SampleBuffer> {
    if buffer.sample_rate() == target_rate {
        return Ok(buffer.clone());
    }
    let ratio = target_rate as f64 / buffer.sample_rate() as f64;
    let channels = buffer
        .channels()
        .iter()
        .map(|c| stretch::resample(c, ratio))
        .collect::<Result<Vec<_>>>()?;
    SampleBuffer::new(channels, target_rate)
}

// ============================================================================
// SPACE
// ============================================================================

/// Moving-sum reverb, peak-normalised and quantised to 16-bit steps
///
/// Each output sample is `wet_level` times the sum of the `window` input
/// samples centred on it. The result holds the wet signal only.
pub fn add_reverb(buffer: &SampleBuffer, wet_level: f32, window: usize) -> Result<SampleBuffer> {
    if window == 0 {
        return Err(AudioError::validation("Reverb window must be at least 1 sample"));
    }
    // Window alignment of a centred ("same"-length) convolution
    let lead = (window - 1) / 2;

    let wet = buffer.map_channels(|samples| {
        let mut prefix = Vec::with_capacity(samples.len() + 1);
        prefix.push(0.0f64);
        let mut acc = 0.0f64;
        for &s in samples {
            acc += s as f64;
            prefix.push(acc);
        }
        let len = samples.len();
        Ok((0..len)
            .map(|n| {
                let hi = (n + lead + 1).min(len);
                let lo = (n + lead + 1).saturating_sub(window).min(hi);
                ((prefix[hi] - prefix[lo]) * wet_level as f64) as f32
            })
            .collect())
    })?;

    let peak = wet.peak();
    if peak == 0.0 {
        return Ok(SampleBuffer::silence(
            buffer.channel_count(),
            buffer.frames(),
            buffer.sample_rate(),
        ));
    }

    wet.map_channels(|c| {
        Ok(c.iter()
            .map(|s| (s / peak * 32767.0).trunc() / 32768.0)
            .collect())
    })
}

/// Mix in a copy delayed by `delay_ms` and attenuated by `10 * decay` dB
///
/// The mix saturates to [-1, 1] and the decayed tail past the input length
/// is dropped.
pub fn add_echo(buffer: &SampleBuffer, delay_ms: f32, decay: f32) -> Result<SampleBuffer> {
    let delay = ms_to_frames(delay_ms, buffer.sample_rate());
    let gain = db_to_linear(-10.0 * decay);
    buffer.map_channels(|c| {
        Ok(c.iter()
            .enumerate()
            .map(|(n, &s)| {
                let echo = if n >= delay { c[n - delay] * gain } else { 0.0 };
                (s + echo).clamp(-1.0, 1.0)
            })
            .collect())
    })
}

/// Linear fade from silence at the head and to silence at the tail
pub fn fade_in_out(buffer: &SampleBuffer, fade_in_ms: f32, fade_out_ms: f32) -> Result<SampleBuffer> {
    let frames = buffer.frames();
    let fade_in = ms_to_frames(fade_in_ms, buffer.sample_rate()).min(frames);
    let fade_out = ms_to_frames(fade_out_ms, buffer.sample_rate()).min(frames);

    buffer.map_channels(|c| {
        Ok(c.iter()
            .enumerate()
            .map(|(i, &s)| {
                let mut gain = 1.0f32;
                if i < fade_in {
                    gain *= i as f32 / fade_in as f32;
                }
                if i + fade_out >= frames && fade_out > 0 {
                    gain *= (frames - 1 - i) as f32 / fade_out as f32;
                }
                s * gain
            })
            .collect())
    })
}

// ============================================================================
// EQUALIZER
// ============================================================================

/// Three-band STFT equalizer over the mono fold of the buffer
///
/// Stereo input comes back as the same processed mono signal on both
/// channels; stereo separation is lost.
pub fn apply_equalizer(
    buffer: &SampleBuffer,
    bass_db: f32,
    mid_db: f32,
    treble_db: f32,
) -> Result<SampleBuffer> {
    let mono = buffer.to_mono();
    let stft = Stft::default();
    let sample_rate = buffer.sample_rate();
    let (bass, mid, treble) = (db_to_linear(bass_db), db_to_linear(mid_db), db_to_linear(treble_db));

    let gains: Vec<f32> = (0..stft.bins())
        .map(|k| {
            let freq = stft.bin_frequency(k, sample_rate);
            if freq < bands::BASS_UPPER {
                bass
            } else if freq <= bands::TREBLE_LOWER {
                mid
            } else {
                treble
            }
        })
        .collect();

    let mut spectrum = stft.analyze(&mono);
    for frame in &mut spectrum {
        for (bin, gain) in frame.iter_mut().zip(gains.iter()) {
            *bin *= *gain;
        }
    }
    let processed = stft.synthesize(&spectrum, mono.len());

    let channels = vec![processed; buffer.channel_count().count() as usize];
    SampleBuffer::new(channels, sample_rate)
}

// ============================================================================
// ANALYSIS
// ============================================================================

/// Beat positions and tempo of the mono fold, for display
pub fn detect_beats(buffer: &SampleBuffer) -> Result<BeatOverlay> {
    OnsetBeatDetector::default().detect(buffer)
}

// ============================================================================
// EFFECTS CHAIN
// ============================================================================

/// One configured step of the render pipeline
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum EffectStage {
    Volume { gain_db: f32 },
    Speed { factor: f32 },
    Pitch { semitones: f32 },
    Reverb { wet_level: f32, window: usize },
    Echo { delay_ms: f32, decay: f32 },
    Fade { in_ms: f32, out_ms: f32 },
    Equalizer { bass_db: f32, mid_db: f32, treble_db: f32 },
}

impl EffectStage {
    pub fn name(&self) -> &'static str {
        match self {
            EffectStage::Volume { .. } => "Volume",
            EffectStage::Speed { .. } => "Speed",
            EffectStage::Pitch { .. } => "Pitch",
            EffectStage::Reverb { .. } => "Reverb",
            EffectStage::Echo { .. } => "Echo",
            EffectStage::Fade { .. } => "Fade",
            EffectStage::Equalizer { .. } => "Equalizer",
        }
    }

    pub fn apply(&self, buffer: &SampleBuffer) -> Result<SampleBuffer> {
        match *self {
            EffectStage::Volume { gain_db } => change_volume(buffer, gain_db),
            EffectStage::Speed { factor } => change_speed(buffer, factor),
            EffectStage::Pitch { semitones } => change_pitch(buffer, semitones),
            EffectStage::Reverb { wet_level, window } => add_reverb(buffer, wet_level, window),
            EffectStage::Echo { delay_ms, decay } => add_echo(buffer, delay_ms, decay),
            EffectStage::Fade { in_ms, out_ms } => fade_in_out(buffer, in_ms, out_ms),
            EffectStage::Equalizer {
                bass_db,
                mid_db,
                treble_db,
            } => apply_equalizer(buffer, bass_db, mid_db, treble_db),
        }
    }
}

/// The stages an [`EffectParams`] set triggers, in render order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectsChain {
    stages: Vec<EffectStage>,
}

impl EffectsChain {
    /// Build the chain, skipping every stage whose trigger does not hold
    pub fn from_params(params: &EffectParams, tuning: &EffectTuning) -> Self {
        let mut stages = Vec::new();

        if params.volume_gain_db != 0.0 {
            stages.push(EffectStage::Volume {
                gain_db: params.volume_gain_db,
            });
        }
        if params.speed_factor != 1.0 {
            stages.push(EffectStage::Speed {
                factor: params.speed_factor,
            });
        }
        if params.pitch_semitones != 0.0 {
            stages.push(EffectStage::Pitch {
                semitones: params.pitch_semitones,
            });
        }
        if params.reverb_enabled {
            stages.push(EffectStage::Reverb {
                wet_level: tuning.reverb_wet_level,
                window: tuning.reverb_window,
            });
        }
        if params.echo_enabled {
            stages.push(EffectStage::Echo {
                delay_ms: tuning.echo_delay_ms,
                decay: tuning.echo_decay,
            });
        }
        if params.fade_enabled {
            stages.push(EffectStage::Fade {
                in_ms: tuning.fade_in_ms,
                out_ms: tuning.fade_out_ms,
            });
        }
        if params.has_eq() {
            stages.push(EffectStage::Equalizer {
                bass_db: params.bass_gain_db,
                mid_db: params.mid_gain_db,
                treble_db: params.treble_gain_db,
            });
        }

        Self { stages }
    }

    pub fn stages(&self) -> &[EffectStage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Render `original` through every stage; an empty chain returns a copy
    pub fn render(&self, original: &SampleBuffer) -> Result<SampleBuffer> {
        let mut current = original.clone();
        for stage in &self.stages {
            let started = Instant::now();
            current = stage.apply(&current)?;
            debug!(
                stage = stage.name(),
                frames = current.frames(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Effect applied"
            );
        }
        Ok(current)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audio::ChannelCount;
    use proptest::prelude::*;

    const SAMPLE_RATE: u32 = 22050;

    fn sine(freq: f32, seconds: f32) -> Vec<f32> {
        let frames = (seconds * SAMPLE_RATE as f32) as usize;
        (0..frames)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / SAMPLE_RATE as f32).sin() * 0.5)
            .collect()
    }

    fn stereo(left: Vec<f32>, right: Vec<f32>) -> SampleBuffer {
        SampleBuffer::new(vec![left, right], SAMPLE_RATE).unwrap()
    }

    // -------------------------------------------------------------------------
    // Cut
    // -------------------------------------------------------------------------

    #[test]
    fn test_cut_validation() {
        let buffer = SampleBuffer::mono(vec![0.0; SAMPLE_RATE as usize * 10], SAMPLE_RATE);
        for (start, end) in [(-1.0, 5.0), (6.0, 5.0), (0.0, 11.0), (3.0, 3.0)] {
            let err = cut(&buffer, start, end).unwrap_err();
            assert!(matches!(err, AudioError::Validation(_)), "{} {}", start, end);
        }

        let trimmed = cut(&buffer, 2.0, 8.0).unwrap();
        assert!((trimmed.duration_secs() - 6.0).abs() < 1e-9);
        assert!(cut(&buffer, 0.0, 10.0).is_ok());
    }

    #[test]
    fn test_cut_keeps_content() {
        let samples: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let buffer = SampleBuffer::mono(samples, 10);
        let trimmed = cut(&buffer, 2.0, 5.0).unwrap();
        let expected: Vec<f32> = (20..50).map(|i| i as f32).collect();
        assert_eq!(trimmed.channel(0), expected.as_slice());
    }

    // -------------------------------------------------------------------------
    // Gain, speed, pitch
    // -------------------------------------------------------------------------

    #[test]
    fn test_volume_is_additive_db() {
        let buffer = SampleBuffer::mono(vec![0.5, -0.25], SAMPLE_RATE);
        let louder = change_volume(&buffer, 6.0206).unwrap();
        assert!((louder.channel(0)[0] - 1.0).abs() < 1e-3);
        let back = change_volume(&louder, -6.0206).unwrap();
        assert!((back.channel(0)[1] + 0.25).abs() < 1e-5);
    }

    #[test]
    fn test_speed_changes_length_per_channel() {
        let buffer = stereo(sine(440.0, 1.0), sine(660.0, 1.0));
        let fast = change_speed(&buffer, 2.0).unwrap();
        assert_eq!(fast.channel_count(), ChannelCount::Stereo);
        assert_eq!(fast.frames(), buffer.frames() / 2);
        assert!(change_speed(&buffer, 0.0).is_err());
        assert_eq!(change_speed(&buffer, 1.0).unwrap(), buffer);
    }

    #[test]
    fn test_pitch_keeps_length() {
        let buffer = SampleBuffer::mono(sine(330.0, 1.0), SAMPLE_RATE);
        let shifted = change_pitch(&buffer, -3.0).unwrap();
        assert_eq!(shifted.frames(), buffer.frames());
        assert_ne!(shifted, buffer);
    }

    // -------------------------------------------------------------------------
    // Reverb, echo, fade
    // -------------------------------------------------------------------------

    #[test]
    fn test_reverb_normalises_to_full_scale() {
        let buffer = SampleBuffer::mono(sine(220.0, 0.5), SAMPLE_RATE);
        let wet = add_reverb(&buffer, 0.2, 1000).unwrap();
        assert_eq!(wet.frames(), buffer.frames());
        let peak = wet.peak();
        assert!(peak <= 1.0 && peak > 0.99, "peak {}", peak);
        // Quantised to 16-bit steps
        for s in wet.channel(0) {
            let scaled = s * 32768.0;
            assert!((scaled - scaled.round()).abs() < 1e-2);
        }
    }

    #[test]
    fn test_reverb_is_deterministic_and_silence_stays_silent() {
        let buffer = SampleBuffer::mono(sine(220.0, 0.2), SAMPLE_RATE);
        assert_eq!(
            add_reverb(&buffer, 0.2, 1000).unwrap(),
            add_reverb(&buffer, 0.2, 1000).unwrap()
        );

        let silent = SampleBuffer::silence(ChannelCount::Stereo, 5000, SAMPLE_RATE);
        assert_eq!(add_reverb(&silent, 0.2, 1000).unwrap(), silent);
    }

    #[test]
    fn test_reverb_window_alignment() {
        // Impulse at 10 spreads over [10 - lead, 10 - lead + window)
        let mut samples = vec![0.0f32; 32];
        samples[10] = 1.0;
        let wet = add_reverb(&SampleBuffer::mono(samples, 100), 0.2, 4).unwrap();
        let nonzero: Vec<usize> = wet
            .channel(0)
            .iter()
            .enumerate()
            .filter(|(_, s)| **s != 0.0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(nonzero, vec![9, 10, 11, 12]);
    }

    #[test]
    fn test_echo_truncates_and_saturates() {
        let mut samples = vec![0.0f32; 1000];
        samples[0] = 1.0;
        samples[100] = 0.9;
        let buffer = SampleBuffer::mono(samples, 1000);

        let echoed = add_echo(&buffer, 100.0, 0.5).unwrap();
        assert_eq!(echoed.frames(), 1000);
        // Delayed copy of the first impulse lands on the second and clips
        assert_eq!(echoed.channel(0)[100], 1.0);
        let expected = 0.9 * db_to_linear(-5.0);
        assert!((echoed.channel(0)[200] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_fade_ramps() {
        let buffer = SampleBuffer::mono(vec![1.0; 3000], 1000);
        let faded = fade_in_out(&buffer, 1000.0, 1000.0).unwrap();
        let c = faded.channel(0);
        assert_eq!(c[0], 0.0);
        assert!((c[500] - 0.5).abs() < 1e-6);
        assert_eq!(c[1500], 1.0);
        assert_eq!(c[2999], 0.0);
        assert!(c[2500] < 1.0 && c[2500] > 0.0);
    }

    #[test]
    fn test_fade_longer_than_buffer() {
        let buffer = SampleBuffer::mono(vec![1.0; 100], 1000);
        let faded = fade_in_out(&buffer, 1000.0, 1000.0).unwrap();
        assert_eq!(faded.frames(), 100);
        assert!(faded.channel(0).iter().all(|s| (0.0..=1.0).contains(s)));
    }

    // -------------------------------------------------------------------------
    // Equalizer
    // -------------------------------------------------------------------------

    #[test]
    fn test_equalizer_band_disjointness() {
        let low = SampleBuffer::mono(sine(100.0, 1.0), SAMPLE_RATE);
        let high = SampleBuffer::mono(sine(5000.0, 1.0), SAMPLE_RATE);

        let low_cut = apply_equalizer(&low, -20.0, 0.0, 0.0).unwrap();
        assert!(low_cut.rms() < low.rms() * 0.2);

        let high_same = apply_equalizer(&high, -20.0, 0.0, 0.0).unwrap();
        assert!((high_same.rms() - high.rms()).abs() < high.rms() * 0.01);
    }

    #[test]
    fn test_equalizer_duplicates_mono_to_stereo() {
        let buffer = stereo(sine(440.0, 0.5), sine(3000.0, 0.5));
        let eq = apply_equalizer(&buffer, 0.0, 3.0, 0.0).unwrap();
        assert_eq!(eq.channel_count(), ChannelCount::Stereo);
        assert_eq!(eq.channel(0), eq.channel(1));
        assert_eq!(eq.frames(), buffer.frames());
    }

    // -------------------------------------------------------------------------
    // Chain
    // -------------------------------------------------------------------------

    #[test]
    fn test_chain_order_and_triggers() {
        let params = EffectParams::neutral()
            .with_eq(1.0, 0.0, 0.0)
            .toggled_fade()
            .with_volume(-3.0)
            .toggled_reverb();
        let chain = EffectsChain::from_params(&params, &EffectTuning::default());
        let names: Vec<_> = chain.stages().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["Volume", "Reverb", "Fade", "Equalizer"]);

        assert!(EffectsChain::from_params(&EffectParams::neutral(), &EffectTuning::default()).is_empty());
    }

    #[test]
    fn test_chain_neutral_returns_original() {
        let buffer = stereo(sine(440.0, 0.3), sine(220.0, 0.3));
        let chain = EffectsChain::from_params(&EffectParams::neutral(), &EffectTuning::default());
        assert_eq!(chain.render(&buffer).unwrap(), buffer);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_render_is_pure(
            gain in -12.0f32..12.0,
            reverb in any::<bool>(),
            echo in any::<bool>(),
            fade in any::<bool>(),
            bass in -6.0f32..6.0,
        ) {
            let buffer = SampleBuffer::mono(sine(300.0, 0.25), SAMPLE_RATE);
            let mut params = EffectParams::neutral().with_volume(gain).with_eq(bass, 0.0, 0.0);
            params.reverb_enabled = reverb;
            params.echo_enabled = echo;
            params.fade_enabled = fade;

            let chain = EffectsChain::from_params(&params, &EffectTuning::default());
            let first = chain.render(&buffer).unwrap();
            let second = chain.render(&buffer).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
