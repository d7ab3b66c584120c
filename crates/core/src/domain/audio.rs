//! Audio data and output abstractions
//!
//! This module defines the PCM container every other component passes around
//! and the platform-agnostic output sink interface. The cpal-backed sink lives
//! in the `infra` crate.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while editing, rendering or playing audio
#[derive(Debug, Error)]
pub enum AudioError {
    /// Bad time range, empty input or out-of-bounds request
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Another mutating operation is already in flight
    #[error("Still processing, please wait")]
    Busy,

    /// Unreadable file, unsupported layout or decoder failure
    #[error("Load failed: {0}")]
    Load(String),

    /// Effect rendering or cutting failed
    #[error("Processing failed: {0}")]
    Processing(String),

    /// Transient file could not be written or removed
    #[error("Resource error: {0}")]
    Resource(String),

    /// Background separation job failed
    #[error("Background job failed: {0}")]
    Job(String),

    /// Output device could not be opened or written
    #[error("Stream error: {0}")]
    Stream(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Closed classification of failures surfaced to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    Load,
    Processing,
    Resource,
    Job,
}

impl AudioError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AudioError::Validation(_) | AudioError::Busy => ErrorKind::Validation,
            AudioError::Load(_) => ErrorKind::Load,
            AudioError::Processing(_) | AudioError::Stream(_) => ErrorKind::Processing,
            AudioError::Resource(_) => ErrorKind::Resource,
            AudioError::Job(_) => ErrorKind::Job,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        AudioError::Validation(msg.into())
    }

    pub fn processing(msg: impl Into<String>) -> Self {
        AudioError::Processing(msg.into())
    }
}

/// Number of audio channels. Only mono and stereo material is editable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelCount {
    Mono,
    Stereo,
}

impl ChannelCount {
    pub fn count(&self) -> u16 {
        match self {
            ChannelCount::Mono => 1,
            ChannelCount::Stereo => 2,
        }
    }

    /// Map a raw channel count, rejecting anything other than mono or stereo
    pub fn from_count(count: usize) -> Result<Self> {
        match count {
            1 => Ok(ChannelCount::Mono),
            2 => Ok(ChannelCount::Stereo),
            n => Err(AudioError::Load(format!(
                "Unsupported number of channels: {}. Only mono or stereo is supported.",
                n
            ))),
        }
    }
}

/// Decoded PCM audio, channel-major, samples nominally in [-1.0, 1.0]
///
/// A buffer is never mutated once shared: every transform in the effects
/// engine builds a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl SampleBuffer {
    /// Create a buffer from per-channel sample vectors
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self> {
        ChannelCount::from_count(channels.len())?;
        if sample_rate == 0 {
            return Err(AudioError::Load("Sample rate must be positive".to_string()));
        }
        if channels.len() == 2 && channels[0].len() != channels[1].len() {
            return Err(AudioError::Load(format!(
                "Channel length mismatch: {} vs {} frames",
                channels[0].len(),
                channels[1].len()
            )));
        }
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    /// Create a mono buffer
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        debug_assert!(sample_rate > 0, "sample rate must be positive");
        Self {
            channels: vec![samples],
            sample_rate: sample_rate.max(1),
        }
    }

    /// De-interleave frames of `channel_count` samples each
    pub fn from_interleaved(data: &[f32], channel_count: usize, sample_rate: u32) -> Result<Self> {
        let layout = ChannelCount::from_count(channel_count)?;
        let n = layout.count() as usize;
        let mut channels = vec![Vec::with_capacity(data.len() / n); n];
        for frame in data.chunks_exact(n) {
            for (ch, &v) in frame.iter().enumerate() {
                channels[ch].push(v);
            }
        }
        Self::new(channels, sample_rate)
    }

    /// Silent buffer of the given layout and length
    pub fn silence(layout: ChannelCount, frames: usize, sample_rate: u32) -> Self {
        debug_assert!(sample_rate > 0, "sample rate must be positive");
        Self {
            channels: vec![vec![0.0; frames]; layout.count() as usize],
            sample_rate: sample_rate.max(1),
        }
    }

    /// Construct from channels already known to be consistent.
    pub(crate) fn from_parts(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        debug_assert!(matches!(channels.len(), 1 | 2));
        Self {
            channels,
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> ChannelCount {
        if self.channels.len() == 2 {
            ChannelCount::Stereo
        } else {
            ChannelCount::Mono
        }
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        self.channels.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of sample frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Frame index for a time offset, clamped to the buffer
    pub fn frame_at(&self, secs: f64) -> usize {
        let frame = (secs.max(0.0) * self.sample_rate as f64).round() as usize;
        frame.min(self.frames())
    }

    /// Average all channels into one
    pub fn to_mono(&self) -> Vec<f32> {
        match self.channels.as_slice() {
            [only] => only.clone(),
            [left, right] => left
                .iter()
                .zip(right.iter())
                .map(|(l, r)| (l + r) * 0.5)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Reshape to another channel layout (duplicate mono, fold stereo)
    pub fn with_layout(&self, layout: ChannelCount) -> SampleBuffer {
        if layout == self.channel_count() {
            return self.clone();
        }
        match layout {
            ChannelCount::Mono => Self::from_parts(vec![self.to_mono()], self.sample_rate),
            ChannelCount::Stereo => {
                let mono = self.channel(0).to_vec();
                Self::from_parts(vec![mono.clone(), mono], self.sample_rate)
            }
        }
    }

    /// Frame-interleaved copy of the whole buffer
    pub fn interleaved(&self) -> Vec<f32> {
        self.interleaved_range(0, self.frames())
    }

    /// Frame-interleaved copy of `[start, end)`
    pub fn interleaved_range(&self, start: usize, end: usize) -> Vec<f32> {
        let end = end.min(self.frames());
        let start = start.min(end);
        let n = self.channels.len();
        let mut out = Vec::with_capacity((end - start) * n);
        for i in start..end {
            for ch in &self.channels {
                out.push(ch[i]);
            }
        }
        out
    }

    /// Copy of frames `[start, end)`
    pub fn slice_frames(&self, start: usize, end: usize) -> SampleBuffer {
        let end = end.min(self.frames());
        let start = start.min(end);
        Self::from_parts(
            self.channels.iter().map(|c| c[start..end].to_vec()).collect(),
            self.sample_rate,
        )
    }

    /// Apply a transform to every channel independently
    pub fn map_channels<F>(&self, mut f: F) -> Result<SampleBuffer>
    where
        F: FnMut(&[f32]) -> Result<Vec<f32>>,
    {
        let channels = self
            .channels
            .iter()
            .map(|c| f(c))
            .collect::<Result<Vec<_>>>()?;
        if channels.len() == 2 && channels[0].len() != channels[1].len() {
            return Err(AudioError::processing(
                "Channel transforms produced different lengths",
            ));
        }
        Ok(Self::from_parts(channels, self.sample_rate))
    }

    /// Largest absolute sample value across all channels
    pub fn peak(&self) -> f32 {
        self.channels
            .iter()
            .flat_map(|c| c.iter())
            .fold(0.0f32, |acc, s| acc.max(s.abs()))
    }

    /// Root-mean-square level across all channels
    pub fn rms(&self) -> f32 {
        let count: usize = self.channels.iter().map(Vec::len).sum();
        if count == 0 {
            return 0.0;
        }
        let sum: f64 = self
            .channels
            .iter()
            .flat_map(|c| c.iter())
            .map(|&s| (s as f64) * (s as f64))
            .sum();
        (sum / count as f64).sqrt() as f32
    }

    /// Per-bin `(min, max)` pairs of the first channel for waveform drawing
    pub fn waveform_overview(&self, bins: usize) -> Vec<(f32, f32)> {
        let samples = self.channel(0);
        if bins == 0 || samples.is_empty() {
            return Vec::new();
        }
        let bins = bins.min(samples.len());
        (0..bins)
            .map(|b| {
                let start = b * samples.len() / bins;
                let end = ((b + 1) * samples.len() / bins).max(start + 1);
                samples[start..end]
                    .iter()
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                        (lo.min(v), hi.max(v))
                    })
            })
            .collect()
    }
}

/// Shape of a PCM output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub sample_rate: u32,
    pub channels: ChannelCount,
}

impl StreamSpec {
    pub fn of(buffer: &SampleBuffer) -> Self {
        Self {
            sample_rate: buffer.sample_rate(),
            channels: buffer.channel_count(),
        }
    }
}

/// An open float PCM output stream
///
/// `write` accepts frame-interleaved chunks and may block while the device
/// drains earlier chunks; that back-pressure is what paces playback.
pub trait OutputStream: Send {
    /// Queue one interleaved chunk for playback
    fn write(&mut self, interleaved: &[f32]) -> Result<()>;

    /// Stop playback and release the device
    fn close(&mut self) -> Result<()>;
}

/// Factory for output streams on some playback device
pub trait AudioSink: Send + Sync {
    /// Open a float PCM stream at the given rate and channel count
    fn open(&self, spec: StreamSpec) -> Result<Box<dyn OutputStream>>;

    /// Sink name for logging
    fn name(&self) -> &str;
}

/// Sink that accepts and discards audio, for headless use
#[derive(Debug, Default, Clone)]
pub struct NullSink {
    frames_written: Arc<AtomicU64>,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total frames accepted by every stream this sink opened
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }
}

struct NullStream {
    channels: usize,
    frames_written: Arc<AtomicU64>,
}

impl OutputStream for NullStream {
    fn write(&mut self, interleaved: &[f32]) -> Result<()> {
        let frames = (interleaved.len() / self.channels) as u64;
        self.frames_written.fetch_add(frames, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl AudioSink for NullSink {
    fn open(&self, spec: StreamSpec) -> Result<Box<dyn OutputStream>> {
        Ok(Box::new(NullStream {
            channels: spec.channels.count() as usize,
            frames_written: Arc::clone(&self.frames_written),
        }))
    }

    fn name(&self) -> &str {
        "null"
    }
}
