//! In-memory collaborators for unit tests

use super::analysis::{SourceSeparator, StemPair};
use super::audio::{AudioError, Result, SampleBuffer};
use super::codec::{AudioCodec, DecodedAudio, ExportFormat, PcmReader};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Keeps encoded buffers in memory and leaves an empty marker file on disk
#[derive(Default)]
pub struct MemoryCodec {
    files: Mutex<HashMap<PathBuf, SampleBuffer>>,
}

impl MemoryCodec {
    pub fn insert(&self, path: impl Into<PathBuf>, buffer: SampleBuffer) {
        self.files.lock().unwrap().insert(path.into(), buffer);
    }

    pub fn get(&self, path: &Path) -> Option<SampleBuffer> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

struct MemoryReader {
    data: Vec<f32>,
    pos: usize,
    channels: u16,
    sample_rate: u32,
}

impl PcmReader for MemoryReader {
    fn read_chunk(&mut self, max_frames: usize) -> Result<Vec<f32>> {
        let end = (self.pos + max_frames * self.channels as usize).min(self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(chunk)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

impl AudioCodec for MemoryCodec {
    fn decode(&self, path: &Path) -> Result<DecodedAudio> {
        self.get(path)
            .map(DecodedAudio::from_buffer)
            .ok_or_else(|| AudioError::Load(format!("No such file: {}", path.display())))
    }

    fn encode(&self, buffer: &SampleBuffer, _format: ExportFormat, path: &Path) -> Result<()> {
        std::fs::write(path, b"").map_err(|e| AudioError::Resource(e.to_string()))?;
        self.insert(path, buffer.clone());
        Ok(())
    }

    fn open_reader(&self, path: &Path, start: f64, end: f64) -> Result<Box<dyn PcmReader>> {
        let buffer = self.decode(path)?.buffer;
        Ok(Box::new(MemoryReader {
            data: buffer.interleaved_range(buffer.frame_at(start), buffer.frame_at(end)),
            pos: 0,
            channels: buffer.channel_count().count(),
            sample_rate: buffer.sample_rate(),
        }))
    }
}

/// Left channel becomes the vocal, right channel the instrumental
pub struct SplitSeparator;

impl SourceSeparator for SplitSeparator {
    fn separate(&self, buffer: &SampleBuffer) -> Result<StemPair> {
        let left = buffer.channel(0).to_vec();
        let right = buffer.channel(1).to_vec();
        Ok(StemPair {
            vocal: SampleBuffer::new(vec![left.clone(), left], buffer.sample_rate())?,
            instrumental: SampleBuffer::new(vec![right.clone(), right], buffer.sample_rate())?,
        })
    }

    fn name(&self) -> &'static str {
        "split"
    }
}
