//! Phase-vocoder time stretching, pitch shifting and sinc resampling

use super::spectral::Stft;
use crate::domain::audio::{AudioError, Result};
use num_complex::Complex;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::f32::consts::PI;

/// Input block size fed to the sinc resampler
const RESAMPLE_CHUNK: usize = 1024;

/// Wrap a phase into [-π, π]
fn wrap_phase(phase: f32) -> f32 {
    let wrapped = (phase + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped < -PI {
        wrapped + 2.0 * PI
    } else {
        wrapped
    }
}

/// Stretch `signal` in time by `rate` without changing pitch
///
/// `rate > 1` speeds up (shorter output), `rate < 1` slows down. The output
/// has `round(len / rate)` samples.
pub fn time_stretch(signal: &[f32], rate: f64) -> Result<Vec<f32>> {
    if !(rate > 0.0) || !rate.is_finite() {
        return Err(AudioError::validation(format!(
            "Stretch rate must be positive, got {}",
            rate
        )));
    }
    if signal.is_empty() {
        return Ok(Vec::new());
    }

    let stft = Stft::default();
    let spectrum = stft.analyze(signal);
    let bins = stft.bins();
    let zero = vec![Complex::new(0.0f32, 0.0); bins];

    // Expected phase advance per hop for each bin
    let phase_advance: Vec<f32> = (0..bins)
        .map(|k| 2.0 * PI * stft.hop() as f32 * k as f32 / stft.n_fft() as f32)
        .collect();
    let mut phase_acc: Vec<f32> = spectrum[0].iter().map(|c| c.arg()).collect();

    let mut stretched = Vec::new();
    let mut t = 0.0f64;
    while t < spectrum.len() as f64 {
        let i = t.floor() as usize;
        let alpha = (t - i as f64) as f32;
        let left = &spectrum[i];
        let right = spectrum.get(i + 1).unwrap_or(&zero);

        let frame: Vec<Complex<f32>> = (0..bins)
            .map(|k| {
                let mag = (1.0 - alpha) * left[k].norm() + alpha * right[k].norm();
                Complex::from_polar(mag, phase_acc[k])
            })
            .collect();
        stretched.push(frame);

        for k in 0..bins {
            let delta = right[k].arg() - left[k].arg() - phase_advance[k];
            phase_acc[k] += phase_advance[k] + wrap_phase(delta);
        }
        t += rate;
    }

    let length = (signal.len() as f64 / rate).round() as usize;
    Ok(stft.synthesize(&stretched, length))
}

/// Shift pitch by `semitones` while keeping the length of `signal`
pub fn pitch_shift(signal: &[f32], semitones: f32) -> Result<Vec<f32>> {
    if signal.is_empty() {
        return Ok(Vec::new());
    }
    let rate = 2f64.powf(-(semitones as f64) / 12.0);
    let stretched = time_stretch(signal, rate)?;
    let mut shifted = resample(&stretched, rate)?;
    shifted.resize(signal.len(), 0.0);
    Ok(shifted)
}

/// Band-limited resampling by `ratio` (output rate / input rate)
pub fn resample(samples: &[f32], ratio: f64) -> Result<Vec<f32>> {
    if samples.is_empty() {
        return Ok(Vec::new());
    }
    if (ratio - 1.0).abs() < 1e-12 {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| AudioError::processing(format!("Resampler setup failed: {}", e)))?;

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected + delay);
    let mut pos = 0;

    while samples.len() - pos >= resampler.input_frames_next() {
        let needed = resampler.input_frames_next();
        let input: [&[f32]; 1] = [&samples[pos..pos + needed]];
        let block = resampler
            .process(&input[..], None)
            .map_err(|e| AudioError::processing(format!("Resampling failed: {}", e)))?;
        output.extend_from_slice(&block[0]);
        pos += needed;
    }

    if pos < samples.len() {
        let tail: [&[f32]; 1] = [&samples[pos..]];
        let block = resampler
            .process_partial(Some(&tail[..]), None)
            .map_err(|e| AudioError::processing(format!("Resampling failed: {}", e)))?;
        output.extend_from_slice(&block[0]);
    }

    // Flush the filter delay line
    while output.len() < expected + delay {
        let block = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| AudioError::processing(format!("Resampling failed: {}", e)))?;
        if block[0].is_empty() {
            break;
        }
        output.extend_from_slice(&block[0]);
    }

    let mut result: Vec<f32> = output.into_iter().skip(delay).collect();
    result.resize(expected, 0.0);
    Ok(result)
}
