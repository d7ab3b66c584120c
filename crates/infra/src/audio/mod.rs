//! Audio output through CPAL
//!
//! CPAL abstracts the platform APIs:
//! - Windows: WASAPI
//! - Linux: ALSA/PulseAudio
//! - macOS: CoreAudio

pub mod cpal_backend;
pub mod stream;

pub use cpal_backend::{output_device_names, CpalSink};
pub use stream::CpalOutputStream;
