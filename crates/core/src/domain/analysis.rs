//! Vocal/instrumental source separation
//!
//! The separation model is an external collaborator behind [`SourceSeparator`].
//! [`separate_sources`] prepares its input (44.1 kHz, stereo) and reshapes its
//! output back to the caller's channel layout.

use super::audio::{AudioError, ChannelCount, Result, SampleBuffer};
use super::dsp;
use tracing::{debug, info};

/// Rate the separation service expects
pub const SEPARATION_SAMPLE_RATE: u32 = 44100;

/// Separated stems
#[derive(Debug, Clone, PartialEq)]
pub struct StemPair {
    pub vocal: SampleBuffer,
    pub instrumental: SampleBuffer,
}

/// Source-separation backend
pub trait SourceSeparator: Send + Sync {
    /// Split a stereo buffer sampled at [`SEPARATION_SAMPLE_RATE`]
    fn separate(&self, buffer: &SampleBuffer) -> Result<StemPair>;

    /// Name of the backend (for logging)
    fn name(&self) -> &'static str;
}

/// Bring a stem back to `layout`, keeping at most `frames` frames
///
/// Mono callers get the first stem channel, not a fold of both.
fn reshape_stem(stem: &SampleBuffer, layout: ChannelCount, frames: usize) -> SampleBuffer {
    let end = frames.min(stem.frames());
    let trimmed = stem.slice_frames(0, end);
    match layout {
        ChannelCount::Mono => SampleBuffer::mono(trimmed.channel(0).to_vec(), trimmed.sample_rate()),
        ChannelCount::Stereo => trimmed.with_layout(ChannelCount::Stereo),
    }
}

/// Run `separator` on `buffer` and return stems at the service rate
pub fn separate_sources(buffer: &SampleBuffer, separator: &dyn SourceSeparator) -> Result<StemPair> {
    if buffer.is_empty() {
        return Err(AudioError::validation("No audio to separate"));
    }

    let prepared = dsp::resample_to(buffer, SEPARATION_SAMPLE_RATE)?.with_layout(ChannelCount::Stereo);
    debug!(
        separator = separator.name(),
        frames = prepared.frames(),
        "Running source separation"
    );

    let stems = separator.separate(&prepared)?;
    let layout = buffer.channel_count();
    let frames = prepared.frames();

    let pair = StemPair {
        vocal: reshape_stem(&stems.vocal, layout, frames),
        instrumental: reshape_stem(&stems.instrumental, layout, frames),
    };
    info!(
        separator = separator.name(),
        duration_secs = pair.vocal.duration_secs(),
        "Source separation finished"
    );
    Ok(pair)
}
