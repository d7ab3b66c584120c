//! Cadenza infrastructure layer
//!
//! Concrete collaborators for the core editor: CPAL playback, file decoding
//! and encoding, and an external source-separation program.

pub mod audio;
pub mod codec;
pub mod separation;

pub use audio::CpalSink;
pub use codec::FileCodec;
pub use separation::ExternalSeparator;
