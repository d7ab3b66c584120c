//! Domain entities and business rules

pub mod analysis;
pub mod audio;
pub mod beats;
pub mod codec;
pub mod command;
pub mod config;
pub mod dsp;
pub mod editor;
pub mod history;
pub mod jobs;
pub mod params;
pub mod preview;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

// Re-export specific items to avoid ambiguous glob imports
pub use analysis::{separate_sources, SourceSeparator, StemPair, SEPARATION_SAMPLE_RATE};
pub use audio::{
    AudioError, AudioSink, ChannelCount, ErrorKind, NullSink, OutputStream, SampleBuffer,
    StreamSpec,
};
pub use beats::{BeatDetector, BeatOverlay, OnsetBeatDetector};
pub use codec::{AudioCodec, AudioMetadata, DecodedAudio, ExportFormat, PcmReader, TrackSummary};
pub use command::{Command, CommandExecutor, CommandResult};
pub use config::{
    AppConfig, CadenzaConfig, ConfigError, ConfigManager, EffectTuning, PresetManager, ToolsConfig,
};
pub use dsp::{EffectStage, EffectsChain};
pub use editor::{Editor, EditorEvent, Operation, Services};
pub use history::{EditHistory, HistorySnapshot, SnapshotKind};
pub use jobs::{JobOutcome, SeparationJob};
pub use params::EffectParams;
pub use preview::{PreviewConfig, PreviewController, PreviewEvent, PreviewState, StopReason};
pub use session::{CutBounds, EditSession};
