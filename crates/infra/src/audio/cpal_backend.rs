//! CPAL-based audio sink
//!
//! Opens the default output device. Windows uses WASAPI, Linux ALSA or
//! PulseAudio, macOS CoreAudio.

use super::stream::{CallbackFeeder, CpalOutputStream, Resampler, CHANNEL_DEPTH};
use cadenza_core::domain::audio::{AudioError, AudioSink, OutputStream, Result, StreamSpec};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig as CpalStreamConfig;
use crossbeam::channel::bounded;
use std::thread;
use tracing::{debug, error, info};

/// Seconds of audio the callback ring can hold
const RING_SECONDS: usize = 1;

/// Names of the output devices the default host can see
pub fn output_device_names() -> Result<Vec<String>> {
    let host = cpal::default_host();
    debug!("Using audio host: {:?}", host.id());
    let devices = host
        .output_devices()
        .map_err(|e| AudioError::Resource(format!("Cannot enumerate devices: {}", e)))?;

    #[allow(deprecated)]
    let names = devices
        .map(|d| d.name().unwrap_or_else(|_| "Unknown Device".to_string()))
        .collect();
    Ok(names)
}

/// Plays preview audio on the default output device
#[derive(Debug, Default, Clone)]
pub struct CpalSink;

impl CpalSink {
    pub fn new() -> Self {
        Self
    }
}

impl AudioSink for CpalSink {
    fn open(&self, spec: StreamSpec) -> Result<Box<dyn OutputStream>> {
        let channels = spec.channels.count();
        let (chunk_tx, chunk_rx) = bounded::<Vec<f32>>(CHANNEL_DEPTH);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<u32>>(1);

        let device_thread = thread::Builder::new()
            .name("cpal-output".to_string())
            .spawn(move || {
                let opened = (|| -> Result<(cpal::Stream, u32)> {
                    let host = cpal::default_host();
                    let device = host
                        .default_output_device()
                        .ok_or_else(|| AudioError::Stream("No default output device".to_string()))?;
                    let device_rate = device
                        .default_output_config()
                        .map(|c| c.sample_rate())
                        .unwrap_or(spec.sample_rate);

                    let config = CpalStreamConfig {
                        channels,
                        sample_rate: device_rate,
                        buffer_size: cpal::BufferSize::Default,
                    };
                    let mut feeder = CallbackFeeder::new(
                        chunk_rx,
                        device_rate as usize * channels as usize * RING_SECONDS,
                    );
                    let stream = device
                        .build_output_stream(
                            &config,
                            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| feeder.fill(data),
                            |err| error!("Output stream error: {}", err),
                            None,
                        )
                        .map_err(|e| AudioError::Stream(format!("Failed to build stream: {}", e)))?;
                    stream
                        .play()
                        .map_err(|e| AudioError::Stream(format!("Failed to start stream: {}", e)))?;
                    Ok((stream, device_rate))
                })();

                match opened {
                    Ok((stream, device_rate)) => {
                        let _ = ready_tx.send(Ok(device_rate));
                        // Keep the stream alive until closed
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioError::Resource(format!("Cannot spawn audio thread: {}", e)))?;

        let device_rate = ready_rx
            .recv()
            .map_err(|_| AudioError::Stream("Audio thread exited during startup".to_string()))??;

        info!(
            source_rate = spec.sample_rate,
            device_rate, channels, "Output stream opened"
        );
        Ok(Box::new(CpalOutputStream::new(
            chunk_tx,
            stop_tx,
            device_thread,
            Resampler::new(spec.sample_rate, device_rate, channels),
        )))
    }

    fn name(&self) -> &str {
        "cpal"
    }
}
