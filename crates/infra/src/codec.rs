//! File codec: symphonia decoding, hound WAV output and ffmpeg transcoding
//!
//! Every supported container is decoded in-process. WAV export is written
//! directly as 16-bit PCM; the other formats go through the external ffmpeg
//! binary, fed from a transient float WAV that is removed on every path.

use cadenza_core::domain::audio::{AudioError, Result, SampleBuffer};
use cadenza_core::domain::codec::{AudioCodec, AudioMetadata, DecodedAudio, ExportFormat, PcmReader};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use symphonia::core::audio::SampleBuffer as InterleavedSamples;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, StandardTagKey, Tag};
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};
use tracing::{debug, info, instrument, warn};

const PCM16_SCALE: f32 = 32767.0;

fn load_error(path: &Path, detail: impl std::fmt::Display) -> AudioError {
    AudioError::Load(format!("{}: {}", path.display(), detail))
}

// ============================================================================
// Decoding
// ============================================================================

fn metadata_from_tags(tags: &[Tag], file_size_mb: f64) -> AudioMetadata {
    let mut metadata = AudioMetadata {
        file_size_mb,
        ..AudioMetadata::default()
    };
    for tag in tags {
        let value = tag.value.to_string();
        if value.trim().is_empty() {
            continue;
        }
        match tag.std_key {
            Some(StandardTagKey::TrackTitle) => metadata.title = value,
            Some(StandardTagKey::Artist) => metadata.artist = value,
            _ => {}
        }
    }
    metadata
}

/// Decode `path` into planar samples plus its PCM bitrate and tags
#[instrument(skip_all, fields(path = %path.display()))]
pub fn decode_file(path: &Path) -> Result<DecodedAudio> {
    let file = File::open(path).map_err(|e| load_error(path, e))?;
    let file_size_mb = file
        .metadata()
        .map(|m| m.len() as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0);

    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let mut probed = get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| load_error(path, e))?;

    let mut tags: Vec<Tag> = Vec::new();
    if let Some(revision) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
        tags.extend(revision.tags().iter().cloned());
    }
    let mut format = probed.format;
    if let Some(revision) = format.metadata().current() {
        tags.extend(revision.tags().iter().cloned());
    }

    let track = format
        .default_track()
        .ok_or_else(|| load_error(path, "no default track"))?
        .clone();
    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| load_error(path, e))?;

    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let bits_per_sample = track.codec_params.bits_per_sample.unwrap_or(16);
    let mut channel_count = track.codec_params.channels.map(|c| c.count()).unwrap_or(0);
    let mut interleaved: Vec<f32> = Vec::new();
    let mut decode_errors = 0u32;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(SymphoniaError::DecodeError(_)) => {
                decode_errors += 1;
                continue;
            }
            Err(e) => return Err(load_error(path, e)),
        };
        if packet.track_id() != track.id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(_)) => {
                decode_errors += 1;
                continue;
            }
            Err(e) => return Err(load_error(path, e)),
        };
        let spec = *decoded.spec();
        if sample_rate == 0 {
            sample_rate = spec.rate;
        }
        if channel_count == 0 {
            channel_count = spec.channels.count();
        }
        let mut samples = InterleavedSamples::<f32>::new(decoded.capacity() as u64, spec);
        samples.copy_interleaved_ref(decoded);
        interleaved.extend_from_slice(samples.samples());
    }

    if decode_errors > 0 {
        warn!(decode_errors, "Skipped undecodable packets");
    }
    if sample_rate == 0 || channel_count == 0 {
        return Err(load_error(path, "unknown stream layout"));
    }

    let buffer = SampleBuffer::from_interleaved(&interleaved, channel_count, sample_rate)?;
    let bitrate = channel_count as u32 * bits_per_sample * sample_rate;
    let metadata = metadata_from_tags(&tags, file_size_mb);

    info!(
        frames = buffer.frames(),
        channels = channel_count,
        sample_rate,
        "Decoded audio"
    );
    Ok(DecodedAudio {
        buffer,
        bitrate,
        metadata,
    })
}

// ============================================================================
// Encoding
// ============================================================================

fn write_wav(buffer: &SampleBuffer, path: &Path, format: SampleFormat) -> Result<()> {
    let spec = WavSpec {
        channels: buffer.channel_count().count(),
        sample_rate: buffer.sample_rate(),
        bits_per_sample: if format == SampleFormat::Float { 32 } else { 16 },
        sample_format: format,
    };
    let io_error = |e: hound::Error| AudioError::Resource(format!("{}: {}", path.display(), e));

    let mut writer = WavWriter::create(path, spec).map_err(io_error)?;
    for sample in buffer.interleaved() {
        let sample = sample.clamp(-1.0, 1.0);
        match format {
            SampleFormat::Float => writer.write_sample(sample),
            SampleFormat::Int => writer.write_sample((sample * PCM16_SCALE).round() as i16),
        }
        .map_err(io_error)?;
    }
    writer.finalize().map_err(io_error)
}

/// Write `buffer` as 16-bit PCM WAV
pub fn write_wav_pcm16(buffer: &SampleBuffer, path: &Path) -> Result<()> {
    write_wav(buffer, path, SampleFormat::Int)
}

/// Transcode through ffmpeg from a transient float WAV
fn transcode(ffmpeg: &Path, buffer: &SampleBuffer, format: ExportFormat, path: &Path) -> Result<()> {
    let codec = format
        .codec()
        .ok_or_else(|| AudioError::processing(format!("{} needs no transcoding", format)))?;

    // Removed when dropped, on success and on failure alike
    let intermediate = tempfile::Builder::new()
        .prefix("cadenza_export_")
        .suffix(".wav")
        .tempfile()
        .map_err(|e| AudioError::Resource(format!("Cannot create intermediate file: {}", e)))?
        .into_temp_path();
    write_wav(buffer, &intermediate, SampleFormat::Float)?;

    debug!(codec, container = format.container(), "Invoking ffmpeg");
    let output = Command::new(ffmpeg)
        .arg("-y")
        .arg("-loglevel")
        .arg("error")
        .arg("-i")
        .arg(intermediate.as_os_str())
        .args(["-acodec", codec])
        .args(["-ar", &buffer.sample_rate().to_string()])
        .args(["-ac", &buffer.channel_count().count().to_string()])
        .args(["-f", format.container()])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| AudioError::Resource(format!("Cannot run {}: {}", ffmpeg.display(), e)))?;

    if !output.status.success() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Cannot remove partial export");
            }
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AudioError::processing(format!(
            "ffmpeg failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

// ============================================================================
// Preview reader
// ============================================================================

/// Streams PCM frames of a WAV file between two timestamps
pub struct WavRangeReader {
    reader: WavReader<BufReader<File>>,
    remaining_frames: u64,
    channels: u16,
    sample_rate: u32,
    sample_format: SampleFormat,
    scale: f32,
}

impl WavRangeReader {
    pub fn open(path: &Path, start_secs: f64, end_secs: f64) -> Result<Self> {
        let mut reader = WavReader::open(path).map_err(|e| load_error(path, e))?;
        let spec = reader.spec();
        let total = reader.duration() as u64;
        let frame_at = |secs: f64| ((secs.max(0.0) * spec.sample_rate as f64).round() as u64).min(total);
        let start = frame_at(start_secs);
        let end = frame_at(end_secs).max(start);

        reader
            .seek(start as u32)
            .map_err(|e| load_error(path, format!("seek failed: {}", e)))?;

        let scale = match spec.sample_format {
            SampleFormat::Float => 1.0,
            SampleFormat::Int => 1.0 / (1u64 << (spec.bits_per_sample - 1)) as f32,
        };
        Ok(Self {
            reader,
            remaining_frames: end - start,
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            sample_format: spec.sample_format,
            scale,
        })
    }
}

impl PcmReader for WavRangeReader {
    fn read_chunk(&mut self, max_frames: usize) -> Result<Vec<f32>> {
        let frames = (max_frames as u64).min(self.remaining_frames) as usize;
        let wanted = frames * self.channels as usize;
        let scale = self.scale;

        let chunk: std::result::Result<Vec<f32>, hound::Error> = match self.sample_format {
            SampleFormat::Float => self.reader.samples::<f32>().take(wanted).collect(),
            SampleFormat::Int => self
                .reader
                .samples::<i32>()
                .take(wanted)
                .map(|s| s.map(|v| v as f32 * scale))
                .collect(),
        };
        let chunk = chunk.map_err(|e| AudioError::Stream(format!("Preview read failed: {}", e)))?;

        self.remaining_frames -= (chunk.len() / self.channels as usize) as u64;
        if chunk.len() < wanted {
            self.remaining_frames = 0;
        }
        Ok(chunk)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Codec backed by local files and an external ffmpeg
#[derive(Debug, Clone)]
pub struct FileCodec {
    ffmpeg: PathBuf,
}

impl Default for FileCodec {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FileCodec {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    pub fn ffmpeg(&self) -> &Path {
        &self.ffmpeg
    }
}

impl AudioCodec for FileCodec {
    fn decode(&self, path: &Path) -> Result<DecodedAudio> {
        decode_file(path)
    }

    #[instrument(skip(self, buffer), fields(path = %path.display()))]
    fn encode(&self, buffer: &SampleBuffer, format: ExportFormat, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| AudioError::Resource(format!("{}: {}", parent.display(), e)))?;
        }
        match format {
            ExportFormat::Wav => write_wav_pcm16(buffer, path)?,
            other => transcode(&self.ffmpeg, buffer, other, path)?,
        }
        info!(%format, frames = buffer.frames(), "Encoded audio");
        Ok(())
    }

    fn open_reader(&self, path: &Path, start_secs: f64, end_secs: f64) -> Result<Box<dyn PcmReader>> {
        Ok(Box::new(WavRangeReader::open(path, start_secs, end_secs)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::domain::audio::ErrorKind;
    use tempfile::TempDir;

    fn ramp(frames: usize, sample_rate: u32) -> SampleBuffer {
        let left: Vec<f32> = (0..frames).map(|i| (i as f32 / frames as f32) - 0.5).collect();
        let right: Vec<f32> = left.iter().map(|s| -s * 0.5).collect();
        SampleBuffer::new(vec![left, right], sample_rate).unwrap()
    }

    #[test]
    fn test_wav_round_trip_through_symphonia() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ramp.wav");
        let buffer = ramp(22050, 22050);

        let codec = FileCodec::default();
        codec.encode(&buffer, ExportFormat::Wav, &path).unwrap();
        let decoded = codec.decode(&path).unwrap();

        assert_eq!(decoded.buffer.sample_rate(), 22050);
        assert_eq!(decoded.buffer.frames(), 22050);
        assert_eq!(decoded.bitrate, 2 * 16 * 22050);
        assert_eq!(decoded.metadata.title, "Unknown");
        assert!(decoded.metadata.file_size_mb > 0.0);
        let error: f32 = decoded
            .buffer
            .channel(1)
            .iter()
            .zip(buffer.channel(1))
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max);
        assert!(error < 1e-3, "max error {}", error);
    }

    #[test]
    fn test_decode_missing_file_is_load_error() {
        let err = decode_file(Path::new("/nonexistent/cadenza.wav")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Load);
    }

    #[test]
    fn test_range_reader_stops_at_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ramp.wav");
        let buffer = ramp(8000, 8000);
        write_wav_pcm16(&buffer, &path).unwrap();

        let mut reader = WavRangeReader::open(&path, 0.25, 0.5).unwrap();
        assert_eq!(reader.channels(), 2);
        let mut frames = 0;
        loop {
            let chunk = reader.read_chunk(300).unwrap();
            if chunk.is_empty() {
                break;
            }
            frames += chunk.len() / 2;
        }
        assert_eq!(frames, 2000);
    }

    #[test]
    fn test_transcode_failure_is_processing_error() {
        let dir = TempDir::new().unwrap();
        let codec = FileCodec::new(dir.path().join("no-ffmpeg-here"));
        let err = codec
            .encode(&ramp(100, 8000), ExportFormat::Mp3, &dir.path().join("x.mp3"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        // Only the (never written) target could remain
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_transcode_removes_partial_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        // Writes a truncated file to its last argument, then fails
        let tool = dir.path().join("broken-ffmpeg");
        fs::write(
            &tool,
            "#!/bin/sh\nfor last; do :; done\nprintf 'ID3' > \"$last\"\necho 'Conversion failed' >&2\nexit 1\n",
        )
        .unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let target = dir.path().join("out.mp3");
        let err = FileCodec::new(&tool)
            .encode(&ramp(100, 8000), ExportFormat::Mp3, &target)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Processing);
        assert!(err.to_string().contains("Conversion failed"));
        assert!(!target.exists());
    }
}
