//! Codec service interface
//!
//! Decoding, encoding and streaming reads are delegated to an implementation
//! of [`AudioCodec`]; the file-backed one lives in `cadenza-infra`.

use super::audio::{AudioError, Result, SampleBuffer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Output formats supported by export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Wav,
    Mp3,
    Aac,
    Ogg,
    Flac,
    M4a,
    Wma,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 7] = [
        ExportFormat::Wav,
        ExportFormat::Mp3,
        ExportFormat::Aac,
        ExportFormat::Ogg,
        ExportFormat::Flac,
        ExportFormat::M4a,
        ExportFormat::Wma,
    ];

    /// File extension without the dot
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Wav => "wav",
            ExportFormat::Mp3 => "mp3",
            ExportFormat::Aac => "aac",
            ExportFormat::Ogg => "ogg",
            ExportFormat::Flac => "flac",
            ExportFormat::M4a => "m4a",
            ExportFormat::Wma => "wma",
        }
    }

    /// Transcoder codec name; `None` for formats written directly
    pub fn codec(&self) -> Option<&'static str> {
        match self {
            ExportFormat::Wav => None,
            ExportFormat::Mp3 => Some("libmp3lame"),
            ExportFormat::Aac => Some("aac"),
            ExportFormat::Ogg => Some("libvorbis"),
            ExportFormat::Flac => Some("flac"),
            ExportFormat::M4a => Some("aac"),
            ExportFormat::Wma => Some("wmav2"),
        }
    }

    /// Transcoder container (muxer) name
    pub fn container(&self) -> &'static str {
        match self {
            ExportFormat::Wav => "wav",
            ExportFormat::Mp3 => "mp3",
            ExportFormat::Aac => "adts",
            ExportFormat::Ogg => "ogg",
            ExportFormat::Flac => "flac",
            ExportFormat::M4a => "ipod",
            ExportFormat::Wma => "asf",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().trim_start_matches('.').to_ascii_lowercase();
        ExportFormat::ALL
            .iter()
            .copied()
            .find(|f| f.extension() == wanted)
            .ok_or_else(|| AudioError::validation(format!("Unsupported export format: {}", s)))
    }
}

/// Tag and file information read alongside the samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioMetadata {
    pub title: String,
    pub artist: String,
    pub file_size_mb: f64,
}

impl Default for AudioMetadata {
    fn default() -> Self {
        Self {
            title: "Unknown".to_string(),
            artist: "Unknown".to_string(),
            file_size_mb: 0.0,
        }
    }
}

/// Result of decoding a file
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub buffer: SampleBuffer,
    /// Bits per second of the decoded PCM stream
    pub bitrate: u32,
    pub metadata: AudioMetadata,
}

impl DecodedAudio {
    /// Wrap a buffer with 16-bit PCM bitrate and default metadata
    pub fn from_buffer(buffer: SampleBuffer) -> Self {
        let bitrate = buffer.sample_rate() * buffer.channel_count().count() as u32 * 16;
        Self {
            buffer,
            bitrate,
            metadata: AudioMetadata::default(),
        }
    }
}

/// One-line description of the loaded track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSummary {
    pub duration_secs: f64,
    pub channels: u16,
    pub sample_rate: u32,
    pub bitrate: u32,
    pub title: String,
    pub artist: String,
    pub file_size_mb: f64,
}

impl TrackSummary {
    pub fn new(buffer: &SampleBuffer, bitrate: u32, metadata: &AudioMetadata) -> Self {
        Self {
            duration_secs: buffer.duration_secs(),
            channels: buffer.channel_count().count(),
            sample_rate: buffer.sample_rate(),
            bitrate,
            title: metadata.title.clone(),
            artist: metadata.artist.clone(),
            file_size_mb: metadata.file_size_mb,
        }
    }
}

impl fmt::Display for TrackSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Duration: {:.2}s | Channels: {} | Sample Rate: {} Hz | Bitrate: {:.1} kbps | Title: {} | Artist: {} | Size: {:.2} MB",
            self.duration_secs,
            self.channels,
            self.sample_rate,
            self.bitrate as f64 / 1000.0,
            self.title,
            self.artist,
            self.file_size_mb
        )
    }
}

/// Sequential reader over a rendered artifact
pub trait PcmReader: Send {
    /// Read up to `max_frames` interleaved frames; empty at end of stream
    fn read_chunk(&mut self, max_frames: usize) -> Result<Vec<f32>>;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;
}

/// File decode/encode collaborator
pub trait AudioCodec: Send + Sync {
    /// Decode a file into a mono or stereo buffer
    fn decode(&self, path: &Path) -> Result<DecodedAudio>;

    /// Write `buffer` to `path` in the given format
    fn encode(&self, buffer: &SampleBuffer, format: ExportFormat, path: &Path) -> Result<()>;

    /// Open `path` for streaming from `start_secs` up to `end_secs`
    fn open_reader(&self, path: &Path, start_secs: f64, end_secs: f64)
        -> Result<Box<dyn PcmReader>>;
}
