//! Edit session: the original recording, the audible buffer and its history
//!
//! The audible ("active") buffer is always derived from the original by
//! re-running the whole effects chain. It is published through an
//! [`ArcSwapOption`] so preview and background readers see either the old or
//! the new buffer, never a partial one.

use super::audio::{AudioError, Result, SampleBuffer};
use super::beats::BeatOverlay;
use super::codec::{AudioMetadata, DecodedAudio, TrackSummary};
use super::config::EffectTuning;
use super::dsp::{self, EffectsChain};
use super::history::{EditHistory, HistorySnapshot, SnapshotKind};
use super::params::EffectParams;
use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Default start/end values for the cut fields, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CutBounds {
    pub start: f64,
    pub end: f64,
}

impl CutBounds {
    /// `[0, duration]` rounded to milliseconds
    pub fn full(duration_secs: f64) -> Self {
        Self {
            start: 0.0,
            end: (duration_secs * 1000.0).round() / 1000.0,
        }
    }
}

pub struct EditSession {
    source_path: Option<PathBuf>,
    metadata: AudioMetadata,
    bitrate: u32,
    original: Option<Arc<SampleBuffer>>,
    active: Arc<ArcSwapOption<SampleBuffer>>,
    history: EditHistory,
    params: EffectParams,
    beats: Option<BeatOverlay>,
    tuning: EffectTuning,
}

impl EditSession {
    pub fn new(history_limit: usize, tuning: EffectTuning) -> Self {
        Self {
            source_path: None,
            metadata: AudioMetadata::default(),
            bitrate: 0,
            original: None,
            active: Arc::new(ArcSwapOption::empty()),
            history: EditHistory::new(history_limit),
            params: EffectParams::neutral(),
            beats: None,
            tuning,
        }
    }

    /// Replace everything with a freshly decoded recording
    pub fn load(&mut self, decoded: DecodedAudio, source_path: Option<PathBuf>) -> CutBounds {
        let original = Arc::new(decoded.buffer);
        info!(
            frames = original.frames(),
            sample_rate = original.sample_rate(),
            channels = original.channel_count().count(),
            "Audio loaded"
        );

        self.source_path = source_path;
        self.metadata = decoded.metadata;
        self.bitrate = decoded.bitrate;
        self.params = EffectParams::neutral();
        self.beats = None;
        self.history.clear();
        self.history.push(HistorySnapshot::new(
            Arc::clone(&original),
            self.params,
            SnapshotKind::Load,
        ));
        self.active.store(Some(Arc::clone(&original)));
        self.original = Some(original);

        CutBounds::full(self.duration())
    }

    /// Render `params` against the original without committing anything
    pub fn render(&self, params: &EffectParams) -> Result<SampleBuffer> {
        let original = self
            .original
            .as_ref()
            .ok_or_else(|| AudioError::processing("No original audio loaded"))?;
        params.validate()?;
        EffectsChain::from_params(params, &self.tuning).render(original)
    }

    /// Re-derive the active buffer from the original and commit it
    pub fn apply_all(&mut self, params: EffectParams) -> Result<Arc<SampleBuffer>> {
        let rendered = self.render(&params)?;
        Ok(self.commit_render(params, rendered))
    }

    /// Publish a buffer rendered from the original and push its snapshot
    pub fn commit_render(&mut self, params: EffectParams, buffer: SampleBuffer) -> Arc<SampleBuffer> {
        let buffer = Arc::new(buffer);
        self.params = params;
        self.history.push(HistorySnapshot::new(
            Arc::clone(&buffer),
            params,
            SnapshotKind::Apply,
        ));
        self.active.store(Some(Arc::clone(&buffer)));
        debug!(
            undo_depth = self.history.undo_depth(),
            frames = buffer.frames(),
            "Render committed"
        );
        buffer
    }

    /// Cut the active buffer without committing
    pub fn prepare_cut(&self, start_secs: f64, end_secs: f64) -> Result<SampleBuffer> {
        let active = self
            .active_buffer()
            .ok_or_else(|| AudioError::processing("No audio loaded"))?;
        dsp::cut(&active, start_secs, end_secs)
    }

    /// Make `buffer` the new original and reset parameters to neutral
    pub fn commit_cut(&mut self, buffer: SampleBuffer) -> CutBounds {
        let buffer = Arc::new(buffer);
        self.params = EffectParams::neutral();
        self.history.push(HistorySnapshot::new(
            Arc::clone(&buffer),
            self.params,
            SnapshotKind::Cut,
        ));
        self.active.store(Some(Arc::clone(&buffer)));
        self.original = Some(buffer);
        info!(duration_secs = self.duration(), "Baseline cut");
        CutBounds::full(self.duration())
    }

    /// Cut the active buffer and rebase the original on the result
    pub fn cut_baseline(&mut self, start_secs: f64, end_secs: f64) -> Result<CutBounds> {
        let cut = self.prepare_cut(start_secs, end_secs)?;
        Ok(self.commit_cut(cut))
    }

    /// Step back one snapshot; `false` when there is nothing to undo
    ///
    /// The original buffer is left as is.
    pub fn undo(&mut self) -> bool {
        let Some(snapshot) = self.history.undo().cloned() else {
            return false;
        };
        self.restore(snapshot);
        true
    }

    /// Step forward one snapshot; `false` when there is nothing to redo
    pub fn redo(&mut self) -> bool {
        let Some(snapshot) = self.history.redo().cloned() else {
            return false;
        };
        self.restore(snapshot);
        true
    }

    fn restore(&mut self, snapshot: HistorySnapshot) {
        self.params = snapshot.params;
        self.active.store(Some(snapshot.buffer));
        debug!(
            undo_depth = self.history.undo_depth(),
            redo_depth = self.history.redo_depth(),
            "Snapshot restored"
        );
    }

    /// Neutral parameters and full-length cut bounds; history is untouched
    pub fn reset_effects(&mut self) -> Result<CutBounds> {
        if !self.is_loaded() {
            return Err(AudioError::validation("No audio to reset"));
        }
        self.params = EffectParams::neutral();
        Ok(CutBounds::full(self.duration()))
    }

    pub fn set_params(&mut self, params: EffectParams) {
        self.params = params;
    }

    pub fn set_beats(&mut self, beats: BeatOverlay) {
        self.beats = Some(beats);
    }

    pub fn is_loaded(&self) -> bool {
        self.original.is_some()
    }

    pub fn params(&self) -> EffectParams {
        self.params
    }

    pub fn tuning(&self) -> &EffectTuning {
        &self.tuning
    }

    pub fn original(&self) -> Option<Arc<SampleBuffer>> {
        self.original.clone()
    }

    /// The currently audible buffer
    pub fn active_buffer(&self) -> Option<Arc<SampleBuffer>> {
        self.active.load_full()
    }

    /// Shared handle to the active buffer for lock-free readers
    pub fn active_handle(&self) -> Arc<ArcSwapOption<SampleBuffer>> {
        Arc::clone(&self.active)
    }

    pub fn beats(&self) -> Option<&BeatOverlay> {
        self.beats.as_ref()
    }

    pub fn history(&self) -> &EditHistory {
        &self.history
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Duration of the active buffer in seconds (0 when nothing is loaded)
    pub fn duration(&self) -> f64 {
        self.active_buffer().map(|b| b.duration_secs()).unwrap_or(0.0)
    }

    pub fn cut_bounds(&self) -> Option<CutBounds> {
        self.is_loaded().then(|| CutBounds::full(self.duration()))
    }

    pub fn summary(&self) -> Option<TrackSummary> {
        self.active_buffer()
            .map(|b| TrackSummary::new(&b, self.bitrate, &self.metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE_RATE: u32 = 8000;

    fn ramp(seconds: f64) -> DecodedAudio {
        let frames = (seconds * SAMPLE_RATE as f64) as usize;
        let samples = (0..frames).map(|i| (i % 100) as f32 / 200.0).collect();
        DecodedAudio::from_buffer(SampleBuffer::mono(samples, SAMPLE_RATE))
    }

    fn loaded(seconds: f64) -> EditSession {
        let mut session = EditSession::new(0, EffectTuning::default());
        session.load(ramp(seconds), None);
        session
    }

    #[test]
    fn test_apply_without_audio_fails() {
        let mut session = EditSession::new(0, EffectTuning::default());
        let err = session.apply_all(EffectParams::neutral()).unwrap_err();
        assert!(matches!(err, AudioError::Processing(_)));
        assert!(session.reset_effects().is_err());
    }

    #[test]
    fn test_load_pushes_initial_snapshot() {
        let session = loaded(2.0);
        assert_eq!(session.history().undo_depth(), 1);
        assert_eq!(session.cut_bounds(), Some(CutBounds { start: 0.0, end: 2.0 }));
        assert_eq!(session.active_buffer(), session.original());
    }

    #[test]
    fn test_neutral_apply_equals_original() {
        let mut session = loaded(1.0);
        let applied = session.apply_all(EffectParams::neutral()).unwrap();
        assert_eq!(*applied, *session.original().unwrap());
        assert_eq!(session.history().undo_depth(), 2);
    }

    #[test]
    fn test_apply_is_not_incremental() {
        let mut session = loaded(1.0);
        let params = EffectParams::neutral().with_volume(-6.0);
        let first = session.apply_all(params).unwrap();
        let second = session.apply_all(params).unwrap();
        assert_eq!(*first, *second);
    }

    #[test]
    fn test_cut_rebases_original_and_is_undoable() {
        let mut session = loaded(4.0);
        session.apply_all(EffectParams::neutral().with_volume(6.0)).unwrap();
        let louder = session.active_buffer().unwrap();

        let bounds = session.cut_baseline(1.0, 3.0).unwrap();
        assert_eq!(bounds, CutBounds { start: 0.0, end: 2.0 });
        assert!(session.params().is_neutral());
        let original = session.original().unwrap();
        assert_eq!(original.frames(), 2 * SAMPLE_RATE as usize);
        // Effects heard before the cut are baked into the new baseline
        assert_eq!(original.channel(0)[0], louder.channel(0)[SAMPLE_RATE as usize]);

        assert!(session.undo());
        assert_eq!(session.active_buffer().unwrap(), louder);
        // Undo never restores the pre-cut original
        assert_eq!(session.original().unwrap().frames(), 2 * SAMPLE_RATE as usize);
    }

    #[test]
    fn test_undo_restores_parameters() {
        let mut session = loaded(1.0);
        let echo = EffectParams::neutral().toggled_echo();
        session.apply_all(echo).unwrap();
        session.apply_all(echo.toggled_fade()).unwrap();

        assert!(session.undo());
        assert_eq!(session.params(), echo);
        assert!(session.redo());
        assert!(session.params().fade_enabled);
        assert!(!session.redo());
    }

    #[test]
    fn test_reset_keeps_history() {
        let mut session = loaded(1.5);
        session.apply_all(EffectParams::neutral().with_volume(2.0)).unwrap();
        let bounds = session.reset_effects().unwrap();
        assert_eq!(bounds.end, 1.5);
        assert!(session.params().is_neutral());
        assert_eq!(session.history().undo_depth(), 2);
    }

    #[test]
    fn test_invalid_cut_leaves_state() {
        let mut session = loaded(2.0);
        assert!(session.cut_baseline(1.5, 1.0).is_err());
        assert_eq!(session.history().undo_depth(), 1);
        assert_eq!(session.duration(), 2.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_branch_discipline(applies in 1usize..6, undos in 1usize..6) {
            let mut session = loaded(0.25);
            for i in 0..applies {
                session.apply_all(EffectParams::neutral().with_volume(i as f32 + 1.0)).unwrap();
            }
            for _ in 0..undos {
                session.undo();
            }
            session.apply_all(EffectParams::neutral().toggled_fade()).unwrap();
            prop_assert!(!session.redo());
            prop_assert!(session.params().fade_enabled);
        }
    }
}
