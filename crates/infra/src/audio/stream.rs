//! Output stream feeding a CPAL callback
//!
//! Chunks travel from the preview streamer to the device callback over a
//! bounded channel; the callback keeps a ring buffer so chunk boundaries never
//! line up with callback boundaries. When the device runs at a different rate
//! than the preview source, a linear resampler converts on the writer side.

use cadenza_core::domain::audio::{AudioError, OutputStream, Result};
use crossbeam::channel::{Receiver, SendTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Chunks in flight between writer and device callback
pub const CHANNEL_DEPTH: usize = 8;

/// How long a write may wait for the device before the stream is declared dead
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Ring buffer owned by the device callback
pub struct RingBuffer {
    buffer: Vec<f32>,
    capacity: usize,
    write_pos: usize,
    read_pos: usize,
}

impl RingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0.0; capacity],
            capacity,
            write_pos: 0,
            read_pos: 0,
        }
    }

    /// Write as many samples as fit and return the count
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let to_write = samples.len().min(self.available_write());
        for (i, &sample) in samples[..to_write].iter().enumerate() {
            self.buffer[(self.write_pos + i) % self.capacity] = sample;
        }
        self.write_pos = (self.write_pos + to_write) % self.capacity;
        to_write
    }

    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let to_read = out.len().min(self.available_read());
        for (i, slot) in out[..to_read].iter_mut().enumerate() {
            *slot = self.buffer[(self.read_pos + i) % self.capacity];
        }
        self.read_pos = (self.read_pos + to_read) % self.capacity;
        to_read
    }

    pub fn available_write(&self) -> usize {
        self.capacity - self.available_read() - 1
    }

    pub fn available_read(&self) -> usize {
        if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            self.capacity - (self.read_pos - self.write_pos)
        }
    }
}

/// Device-callback state: pulls chunks into the ring and plays them out
pub struct CallbackFeeder {
    ring: RingBuffer,
    carry: Vec<f32>,
    chunks: Receiver<Vec<f32>>,
}

impl CallbackFeeder {
    pub fn new(chunks: Receiver<Vec<f32>>, capacity: usize) -> Self {
        Self {
            ring: RingBuffer::with_capacity(capacity),
            carry: Vec::new(),
            chunks,
        }
    }

    /// Fill `data`, padding with silence on underrun
    pub fn fill(&mut self, data: &mut [f32]) {
        while self.ring.available_read() < data.len() {
            if self.carry.is_empty() {
                match self.chunks.try_recv() {
                    Ok(chunk) => self.carry = chunk,
                    Err(_) => break,
                }
            }
            let written = self.ring.write(&self.carry);
            self.carry.drain(..written);
            if written == 0 {
                break;
            }
        }
        let read = self.ring.read(data);
        data[read..].fill(0.0);
    }
}

/// Streaming linear resampler over interleaved frames
pub struct Resampler {
    channels: usize,
    step: f64,
    position: f64,
    tail: Vec<f32>,
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32, channels: u16) -> Self {
        if source_rate != target_rate {
            debug!(source_rate, target_rate, "Resampling preview output");
        }
        Self {
            channels: channels.max(1) as usize,
            step: source_rate as f64 / target_rate as f64,
            position: 0.0,
            tail: Vec::new(),
        }
    }

    pub fn is_bypass(&self) -> bool {
        self.step == 1.0
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_bypass() || input.is_empty() {
            return input.to_vec();
        }
        let ch = self.channels;

        // Previous chunk's last frame sits at index 0 so interpolation spans chunk edges
        let mut frames = std::mem::take(&mut self.tail);
        frames.extend_from_slice(input);
        let total = frames.len() / ch;
        if total == 0 {
            // Less than one frame and no carried tail; nothing to interpolate
            return Vec::new();
        }

        let mut out = Vec::with_capacity(((input.len() as f64 / self.step) as usize + 1) * ch);
        while self.position < (total - 1) as f64 {
            let i0 = self.position.floor() as usize;
            let frac = (self.position - i0 as f64) as f32;
            for c in 0..ch {
                let a = frames[i0 * ch + c];
                let b = frames[(i0 + 1) * ch + c];
                out.push(a + frac * (b - a));
            }
            self.position += self.step;
        }

        self.position -= (total - 1) as f64;
        self.tail = frames[(total - 1) * ch..total * ch].to_vec();
        out
    }
}

/// Writer side of a CPAL output stream
///
/// The CPAL stream itself lives on its own thread (it is not `Send` on every
/// host); dropping the chunk sender and signalling `stop` shuts it down.
pub struct CpalOutputStream {
    chunks: Option<Sender<Vec<f32>>>,
    stop: Option<Sender<()>>,
    device_thread: Option<JoinHandle<()>>,
    resampler: Resampler,
}

impl CpalOutputStream {
    pub(crate) fn new(
        chunks: Sender<Vec<f32>>,
        stop: Sender<()>,
        device_thread: JoinHandle<()>,
        resampler: Resampler,
    ) -> Self {
        Self {
            chunks: Some(chunks),
            stop: Some(stop),
            device_thread: Some(device_thread),
            resampler,
        }
    }
}

impl OutputStream for CpalOutputStream {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        let sender = self
            .chunks
            .as_ref()
            .ok_or_else(|| AudioError::Stream("Stream already closed".to_string()))?;
        let chunk = self.resampler.process(samples);
        sender
            .send_timeout(chunk, WRITE_TIMEOUT)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => {
                    AudioError::Stream("Audio device stopped consuming samples".to_string())
                }
                SendTimeoutError::Disconnected(_) => {
                    AudioError::Stream("Audio device thread exited".to_string())
                }
            })
    }

    fn close(&mut self) -> Result<()> {
        self.chunks = None;
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.device_thread.take() {
            handle
                .join()
                .map_err(|_| AudioError::Stream("Audio device thread panicked".to_string()))?;
        }
        debug!("Output stream closed");
        Ok(())
    }
}

impl Drop for CpalOutputStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close output stream");
        }
    }
}
