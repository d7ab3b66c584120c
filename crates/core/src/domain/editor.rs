//! Editor: the interactive-thread facade over session, preview and jobs
//!
//! Mutating operations (load, cut, apply, export, separation) run on worker
//! threads and are serialised by a single processing flag: a second request
//! while one is in flight is rejected with [`AudioError::Busy`], never queued.
//! Workers only send a completion message; [`Editor::pump`] commits it to the
//! session on the interactive thread and turns it into [`EditorEvent`]s.

use super::analysis::{SourceSeparator, StemPair};
use super::audio::{AudioError, AudioSink, ErrorKind, Result, SampleBuffer};
use super::beats::{BeatDetector, BeatOverlay};
use super::codec::{AudioCodec, DecodedAudio, ExportFormat, TrackSummary};
use super::config::CadenzaConfig;
use super::dsp::{self, EffectsChain};
use super::jobs::{JobOutcome, SeparationJob};
use super::params::EffectParams;
use super::preview::{PreviewController, PreviewEvent};
use super::session::{CutBounds, EditSession};
use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// File names of persisted separation results
pub const VOCAL_FILE: &str = "vocal.wav";
pub const INSTRUMENTAL_FILE: &str = "instrumental.wav";

/// External collaborators the editor delegates to
#[derive(Clone)]
pub struct Services {
    pub codec: Arc<dyn AudioCodec>,
    pub sink: Arc<dyn AudioSink>,
    pub separator: Arc<dyn SourceSeparator>,
    pub beats: Arc<dyn BeatDetector>,
}

/// Mutating operations guarded by the processing flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Load,
    Cut,
    Apply,
    Export,
    Separate,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Load => "load",
            Operation::Cut => "cut",
            Operation::Apply => "apply",
            Operation::Export => "export",
            Operation::Separate => "separate",
        };
        f.write_str(name)
    }
}

/// Notifications for UI observers, drained on the interactive thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EditorEvent {
    Loaded { summary: TrackSummary },
    BufferChanged { duration_secs: f64 },
    CutBounds(CutBounds),
    BeatsUpdated(BeatOverlay),
    ParametersChanged(EffectParams),
    Exported { path: PathBuf, format: ExportFormat },
    Separated { vocal: PathBuf, instrumental: PathBuf },
    Status(String),
    Failed {
        operation: Operation,
        kind: ErrorKind,
        message: String,
    },
    ProcessingChanged(bool),
    Preview(PreviewEvent),
}

/// Worker results waiting to be committed
enum Completion {
    Loaded {
        decoded: DecodedAudio,
        path: PathBuf,
        beats: BeatOverlay,
    },
    Cut {
        buffer: SampleBuffer,
        beats: BeatOverlay,
    },
    Applied {
        params: EffectParams,
        buffer: SampleBuffer,
    },
    Exported {
        path: PathBuf,
        format: ExportFormat,
    },
    Separated {
        vocal: PathBuf,
        instrumental: PathBuf,
    },
    Failed {
        operation: Operation,
        error: AudioError,
    },
}

/// Processing flag plus the lock around the apply entry point
#[derive(Default)]
struct ProcessingGate {
    busy: AtomicBool,
    apply_lock: Arc<AtomicBool>,
}

/// Held apply lock; travels into the render worker and releases on drop
struct ApplyLease(Arc<AtomicBool>);

impl Drop for ApplyLease {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ProcessingGate {
    fn begin(&self) -> Result<()> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| AudioError::Busy)
    }

    fn end(&self) {
        self.busy.store(false, Ordering::Release);
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn lease_apply(&self) -> Result<ApplyLease> {
        self.apply_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ApplyLease(Arc::clone(&self.apply_lock)))
            .map_err(|_| AudioError::Busy)
    }

    #[cfg(test)]
    fn is_applying(&self) -> bool {
        self.apply_lock.load(Ordering::Acquire)
    }
}

fn analyse_beats(detector: &dyn BeatDetector, buffer: &SampleBuffer) -> BeatOverlay {
    match detector.detect(buffer) {
        Ok(overlay) => overlay,
        Err(e) => {
            warn!(error = %e, detector = detector.name(), "Beat detection failed");
            BeatOverlay::default()
        }
    }
}

/// Persist both stems into `dir`, removing whatever was written if either fails
fn write_stems(codec: &dyn AudioCodec, stems: &StemPair, dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let vocal = dir.join(VOCAL_FILE);
    let instrumental = dir.join(INSTRUMENTAL_FILE);
    let mut written = Vec::with_capacity(2);

    for (buffer, path) in [(&stems.vocal, &vocal), (&stems.instrumental, &instrumental)] {
        if let Err(e) = codec.encode(buffer, ExportFormat::Wav, path) {
            // A failed encode may still have left a truncated file behind
            written.push(path);
            for stale in written {
                if let Err(rm) = std::fs::remove_file(stale) {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %stale.display(), error = %rm, "Cannot remove partial stem");
                    }
                }
            }
            return Err(AudioError::Job(format!("Cannot persist stems: {}", e)));
        }
        written.push(path);
    }
    Ok((vocal, instrumental))
}

pub struct Editor {
    services: Services,
    config: CadenzaConfig,
    session: EditSession,
    gate: ProcessingGate,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    preview: PreviewController,
    preview_events: Receiver<PreviewEvent>,
    separation: Option<SeparationJob>,
    pending: Vec<EditorEvent>,
}

impl Editor {
    pub fn new(services: Services, config: CadenzaConfig) -> Self {
        let session = EditSession::new(config.app.history_limit, config.effects);
        let (preview, preview_events) = PreviewController::new(
            Arc::clone(&services.codec),
            Arc::clone(&services.sink),
            config.app.preview_config(),
        );
        let (completions_tx, completions_rx) = unbounded();
        Self {
            services,
            config,
            session,
            gate: ProcessingGate::default(),
            completions_tx,
            completions_rx,
            preview,
            preview_events,
            separation: None,
            pending: Vec::new(),
        }
    }

    pub fn session(&self) -> &EditSession {
        &self.session
    }

    pub fn preview(&self) -> &PreviewController {
        &self.preview
    }

    pub fn config(&self) -> &CadenzaConfig {
        &self.config
    }

    pub fn is_processing(&self) -> bool {
        self.gate.is_busy()
    }

    fn loaded_buffer(&self) -> Result<Arc<SampleBuffer>> {
        self.session
            .active_buffer()
            .ok_or_else(|| AudioError::validation("No audio loaded"))
    }

    /// Set the processing flag and hand `work` to a worker thread
    fn run_mutation<F>(&mut self, operation: Operation, work: F) -> Result<()>
    where
        F: FnOnce() -> Result<Completion> + Send + 'static,
    {
        self.gate.begin()?;

        let tx = self.completions_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-worker", operation))
            .spawn(move || {
                let completion = match catch_unwind(AssertUnwindSafe(work)) {
                    Ok(Ok(completion)) => completion,
                    Ok(Err(error)) => Completion::Failed { operation, error },
                    Err(_) => Completion::Failed {
                        operation,
                        error: AudioError::processing(format!("{} worker panicked", operation)),
                    },
                };
                let _ = tx.send(completion);
            });

        if let Err(e) = spawned {
            self.gate.end();
            return Err(AudioError::Resource(format!("Cannot spawn worker: {}", e)));
        }

        info!(%operation, "Operation started");
        self.pending.push(EditorEvent::ProcessingChanged(true));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mutating operations
    // ------------------------------------------------------------------

    /// Decode `path` in the background and replace the session on success
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let codec = Arc::clone(&self.services.codec);
        let detector = Arc::clone(&self.services.beats);

        self.run_mutation(Operation::Load, move || {
            let decoded = codec.decode(&path)?;
            let beats = analyse_beats(detector.as_ref(), &decoded.buffer);
            Ok(Completion::Loaded {
                decoded,
                path,
                beats,
            })
        })
    }

    /// Cut the active buffer to `[start_secs, end_secs)` and rebase on it
    pub fn cut(&mut self, start_secs: f64, end_secs: f64) -> Result<()> {
        let active = self.loaded_buffer()?;
        let duration = active.duration_secs();
        if !start_secs.is_finite()
            || !end_secs.is_finite()
            || start_secs < 0.0
            || end_secs <= start_secs
            || end_secs > duration + 1e-9
        {
            return Err(AudioError::validation(format!(
                "Invalid start or end time: [{}, {}] for a {:.3}s track",
                start_secs, end_secs, duration
            )));
        }
        let detector = Arc::clone(&self.services.beats);

        self.run_mutation(Operation::Cut, move || {
            let buffer = dsp::cut(&active, start_secs, end_secs)?;
            let beats = analyse_beats(detector.as_ref(), &buffer);
            Ok(Completion::Cut { buffer, beats })
        })
    }

    /// Re-render the original with `params` and commit the result
    pub fn apply_all(&mut self, params: EffectParams) -> Result<()> {
        params.validate()?;
        let original = self
            .session
            .original()
            .ok_or_else(|| AudioError::processing("No original audio loaded"))?;
        let tuning = *self.session.tuning();

        // Dropped with the closure, so a rejected start or a panicking render both release it
        let lease = self.gate.lease_apply()?;
        self.run_mutation(Operation::Apply, move || {
            let _lease = lease;
            let buffer = EffectsChain::from_params(&params, &tuning).render(&original)?;
            Ok(Completion::Applied { params, buffer })
        })
    }

    /// Apply the current parameters
    pub fn apply(&mut self) -> Result<()> {
        self.apply_all(self.session.params())
    }

    pub fn toggle_reverb(&mut self) -> Result<()> {
        self.apply_all(self.session.params().toggled_reverb())
    }

    pub fn toggle_echo(&mut self) -> Result<()> {
        self.apply_all(self.session.params().toggled_echo())
    }

    pub fn toggle_fade(&mut self) -> Result<()> {
        self.apply_all(self.session.params().toggled_fade())
    }

    /// Write the active buffer to `path`
    pub fn export(&mut self, format: ExportFormat, path: impl AsRef<Path>) -> Result<()> {
        let active = self.loaded_buffer()?;
        let path = path.as_ref().to_path_buf();
        let codec = Arc::clone(&self.services.codec);

        self.run_mutation(Operation::Export, move || {
            codec.encode(&active, format, &path)?;
            Ok(Completion::Exported { path, format })
        })
    }

    /// Start background vocal/instrumental separation of the active buffer
    pub fn separate_vocals(&mut self) -> Result<()> {
        let active = self.loaded_buffer()?;
        self.gate.begin()?;
        match SeparationJob::spawn(active, Arc::clone(&self.services.separator)) {
            Ok(job) => {
                self.separation = Some(job);
                info!(separator = self.services.separator.name(), "Separation started");
                self.pending.push(EditorEvent::ProcessingChanged(true));
                self.pending
                    .push(EditorEvent::Status("Separating vocals...".to_string()));
                Ok(())
            }
            Err(e) => {
                self.gate.end();
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // History and parameters
    // ------------------------------------------------------------------

    /// Replace the pending parameters without rendering
    pub fn set_params(&mut self, params: EffectParams) -> Result<()> {
        params.validate()?;
        self.session.set_params(params);
        self.pending.push(EditorEvent::ParametersChanged(params));
        Ok(())
    }

    /// Step back one snapshot; `Ok(false)` when there is nothing to undo
    pub fn undo(&mut self) -> Result<bool> {
        if self.gate.is_busy() {
            return Err(AudioError::Busy);
        }
        let moved = self.session.undo();
        if moved {
            self.push_state_events();
        } else {
            self.pending
                .push(EditorEvent::Status("Nothing to undo".to_string()));
        }
        Ok(moved)
    }

    /// Step forward one snapshot; `Ok(false)` when there is nothing to redo
    pub fn redo(&mut self) -> Result<bool> {
        if self.gate.is_busy() {
            return Err(AudioError::Busy);
        }
        let moved = self.session.redo();
        if moved {
            self.push_state_events();
        } else {
            self.pending
                .push(EditorEvent::Status("Nothing to redo".to_string()));
        }
        Ok(moved)
    }

    /// Neutral parameters and default cut bounds; `None` without audio
    pub fn reset(&mut self) -> Option<CutBounds> {
        match self.session.reset_effects() {
            Ok(bounds) => {
                self.pending
                    .push(EditorEvent::ParametersChanged(self.session.params()));
                self.pending.push(EditorEvent::CutBounds(bounds));
                self.pending
                    .push(EditorEvent::Status("Effects reset".to_string()));
                Some(bounds)
            }
            Err(e) => {
                self.pending.push(EditorEvent::Status(e.to_string()));
                None
            }
        }
    }

    fn push_state_events(&mut self) {
        self.pending.push(EditorEvent::BufferChanged {
            duration_secs: self.session.duration(),
        });
        self.pending
            .push(EditorEvent::ParametersChanged(self.session.params()));
        if let Some(bounds) = self.session.cut_bounds() {
            self.pending.push(EditorEvent::CutBounds(bounds));
        }
    }

    // ------------------------------------------------------------------
    // Preview
    // ------------------------------------------------------------------

    pub fn preview_range(&mut self, start_secs: f64, end_secs: f64) -> Result<()> {
        if self.gate.is_busy() {
            return Err(AudioError::Busy);
        }
        let active = self.loaded_buffer()?;
        self.preview.start(active, start_secs, end_secs)
    }

    pub fn seek(&mut self, position_secs: f64) -> Result<()> {
        self.preview.seek(position_secs)
    }

    pub fn stop_preview(&mut self) -> Result<()> {
        self.preview.stop()
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Commit finished work and return every event since the last pump
    pub fn pump(&mut self) -> Vec<EditorEvent> {
        let completions: Vec<Completion> = self.completions_rx.try_iter().collect();
        for completion in completions {
            self.commit(completion);
        }

        if let Some(outcome) = self.separation.as_mut().and_then(|job| job.try_result()) {
            self.separation = None;
            self.on_separation(outcome);
        }

        let preview_events: Vec<PreviewEvent> = self.preview_events.try_iter().collect();
        self.pending
            .extend(preview_events.into_iter().map(EditorEvent::Preview));

        std::mem::take(&mut self.pending)
    }

    /// Pump at the job poll interval until idle or `timeout` elapses
    pub fn wait_idle(&mut self, timeout: Duration) -> Vec<EditorEvent> {
        let deadline = Instant::now() + timeout;
        let interval = self.config.app.job_poll_interval();
        let mut events = self.pump();
        while self.gate.is_busy() && Instant::now() < deadline {
            thread::sleep(interval);
            events.extend(self.pump());
        }
        events
    }

    fn finish_operation(&mut self) {
        self.gate.end();
        self.pending.push(EditorEvent::ProcessingChanged(false));
    }

    fn commit(&mut self, completion: Completion) {
        match completion {
            Completion::Loaded {
                decoded,
                path,
                beats,
            } => {
                if let Err(e) = self.preview.stop() {
                    warn!(error = %e, "Failed to stop preview before load");
                }
                let bounds = self.session.load(decoded, Some(path));
                self.session.set_beats(beats.clone());
                if let Some(summary) = self.session.summary() {
                    info!(summary = %summary, "Track loaded");
                    self.pending.push(EditorEvent::Loaded { summary });
                }
                self.push_state_events();
                self.pending.push(EditorEvent::CutBounds(bounds));
                self.pending.push(EditorEvent::BeatsUpdated(beats));
            }
            Completion::Cut { buffer, beats } => {
                self.session.commit_cut(buffer);
                self.session.set_beats(beats.clone());
                self.push_state_events();
                self.pending.push(EditorEvent::BeatsUpdated(beats));
                self.pending
                    .push(EditorEvent::Status("Audio cut successfully".to_string()));
            }
            Completion::Applied { params, buffer } => {
                self.session.commit_render(params, buffer);
                self.push_state_events();
                self.pending
                    .push(EditorEvent::Status("Effects applied".to_string()));
            }
            Completion::Exported { path, format } => {
                info!(path = %path.display(), %format, "Exported");
                self.pending.push(EditorEvent::Exported { path, format });
            }
            Completion::Separated {
                vocal,
                instrumental,
            } => {
                info!(
                    vocal = %vocal.display(),
                    instrumental = %instrumental.display(),
                    "Separation saved"
                );
                self.pending.push(EditorEvent::Separated {
                    vocal,
                    instrumental,
                });
            }
            Completion::Failed { operation, error } => {
                error!(%operation, error = %error, "Operation failed");
                self.pending.push(EditorEvent::Failed {
                    operation,
                    kind: error.kind(),
                    message: error.to_string(),
                });
            }
        }
        self.finish_operation();
    }

    /// Persist successful stems on a worker; the flag stays set until they are written
    fn on_separation(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Success(stems) => {
                let dir = self
                    .session
                    .source_path()
                    .and_then(Path::parent)
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                let codec = Arc::clone(&self.services.codec);
                let tx = self.completions_tx.clone();

                let spawned = thread::Builder::new()
                    .name("separate-writer".to_string())
                    .spawn(move || {
                        let completion = match write_stems(codec.as_ref(), &stems, &dir) {
                            Ok((vocal, instrumental)) => Completion::Separated {
                                vocal,
                                instrumental,
                            },
                            Err(error) => Completion::Failed {
                                operation: Operation::Separate,
                                error,
                            },
                        };
                        let _ = tx.send(completion);
                    });

                if let Err(e) = spawned {
                    self.commit(Completion::Failed {
                        operation: Operation::Separate,
                        error: AudioError::Resource(format!("Cannot spawn writer: {}", e)),
                    });
                } else {
                    debug!("Persisting separation results");
                }
            }
            JobOutcome::Error(message) => {
                self.commit(Completion::Failed {
                    operation: Operation::Separate,
                    error: AudioError::Job(message),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audio::NullSink;
    use crate::domain::beats::OnsetBeatDetector;
    use crate::domain::testing::{MemoryCodec, SplitSeparator};
    use tempfile::TempDir;

    const SAMPLE_RATE: u32 = 8000;

    struct Fixture {
        dir: TempDir,
        codec: Arc<MemoryCodec>,
        editor: Editor,
    }

    fn fixture(seconds: f64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let codec = Arc::new(MemoryCodec::default());
        let frames = (seconds * SAMPLE_RATE as f64) as usize;
        let left: Vec<f32> = (0..frames).map(|i| ((i % 50) as f32 / 100.0) - 0.25).collect();
        let right: Vec<f32> = left.iter().map(|s| -s).collect();
        codec.insert(
            dir.path().join("song.wav"),
            SampleBuffer::new(vec![left, right], SAMPLE_RATE).unwrap(),
        );

        let mut config = CadenzaConfig::default();
        config.app.job_poll_interval_ms = 5;
        config.app.position_interval_ms = 20;
        let services = Services {
            codec: codec.clone(),
            sink: Arc::new(NullSink::new()),
            separator: Arc::new(SplitSeparator),
            beats: Arc::new(OnsetBeatDetector::default()),
        };
        Fixture {
            dir,
            codec,
            editor: Editor::new(services, config),
        }
    }

    fn loaded(seconds: f64) -> Fixture {
        let mut f = fixture(seconds);
        let path = f.dir.path().join("song.wav");
        f.editor.load(&path).unwrap();
        f.editor.wait_idle(Duration::from_secs(5));
        f
    }

    #[test]
    fn test_load_emits_summary_and_bounds() {
        let mut f = fixture(2.0);
        f.editor.load(f.dir.path().join("song.wav")).unwrap();
        assert!(f.editor.is_processing());
        let events = f.editor.wait_idle(Duration::from_secs(5));

        assert!(!f.editor.is_processing());
        assert!(events.iter().any(|e| matches!(e, EditorEvent::Loaded { .. })));
        assert!(events.contains(&EditorEvent::CutBounds(CutBounds { start: 0.0, end: 2.0 })));
        assert_eq!(events.last(), Some(&EditorEvent::ProcessingChanged(false)));
    }

    #[test]
    fn test_load_failure_keeps_previous_session() {
        let mut f = loaded(1.0);
        f.editor.load(f.dir.path().join("missing.wav")).unwrap();
        let events = f.editor.wait_idle(Duration::from_secs(5));

        assert!(events.iter().any(|e| matches!(
            e,
            EditorEvent::Failed {
                operation: Operation::Load,
                kind: ErrorKind::Load,
                ..
            }
        )));
        assert_eq!(f.editor.session().duration(), 1.0);
    }

    #[test]
    fn test_second_mutation_is_rejected() {
        let mut f = loaded(2.0);
        f.editor.cut(0.5, 1.5).unwrap();
        let err = f.editor.apply_all(EffectParams::neutral().with_volume(3.0)).unwrap_err();
        assert!(matches!(err, AudioError::Busy));
        assert!(matches!(f.editor.undo(), Err(AudioError::Busy)));

        f.editor.wait_idle(Duration::from_secs(5));
        assert_eq!(f.editor.session().duration(), 1.0);
        assert!(f.editor.session().params().is_neutral());
    }

    #[test]
    fn test_apply_then_undo_redo() {
        let mut f = loaded(1.0);
        f.editor.toggle_echo().unwrap();
        f.editor.wait_idle(Duration::from_secs(5));
        assert!(f.editor.session().params().echo_enabled);

        assert!(f.editor.undo().unwrap());
        assert!(!f.editor.session().params().echo_enabled);
        assert!(!f.editor.undo().unwrap());
        assert!(f.editor.redo().unwrap());
        assert!(f.editor.session().params().echo_enabled);
    }

    #[test]
    fn test_apply_without_audio() {
        let mut f = fixture(1.0);
        let err = f.editor.apply().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Processing);
        assert!(f.editor.reset().is_none());
        let events = f.editor.pump();
        assert!(events.contains(&EditorEvent::Status("Invalid input: No audio to reset".to_string())));
    }

    #[test]
    fn test_separation_writes_stems_next_to_source() {
        let mut f = loaded(0.5);
        f.editor.separate_vocals().unwrap();
        assert!(matches!(f.editor.export(ExportFormat::Wav, f.dir.path().join("x.wav")), Err(AudioError::Busy)));

        let events = f.editor.wait_idle(Duration::from_secs(10));
        let vocal = f.dir.path().join(VOCAL_FILE);
        let instrumental = f.dir.path().join(INSTRUMENTAL_FILE);
        assert!(events.contains(&EditorEvent::Separated {
            vocal: vocal.clone(),
            instrumental: instrumental.clone(),
        }));
        let stem = f.codec.get(&vocal).unwrap();
        assert_eq!(stem.sample_rate(), 44100);
        assert!(f.codec.get(&instrumental).is_some());
    }

    #[test]
    fn test_export_uses_active_buffer() {
        let mut f = loaded(1.0);
        f.editor.apply_all(EffectParams::neutral().with_volume(-6.0)).unwrap();
        f.editor.wait_idle(Duration::from_secs(5));

        let out = f.dir.path().join("out.flac");
        f.editor.export(ExportFormat::Flac, &out).unwrap();
        let events = f.editor.wait_idle(Duration::from_secs(5));
        assert!(events.contains(&EditorEvent::Exported {
            path: out.clone(),
            format: ExportFormat::Flac,
        }));
        let written = f.codec.get(&out).unwrap();
        assert_eq!(Some(Arc::new(written)), f.editor.session().active_buffer());
    }

    /// Delegates to a `MemoryCodec` but refuses to write one file name
    struct RefusingCodec {
        inner: MemoryCodec,
        refused: &'static str,
    }

    impl AudioCodec for RefusingCodec {
        fn decode(&self, path: &Path) -> Result<DecodedAudio> {
            self.inner.decode(path)
        }

        fn encode(&self, buffer: &SampleBuffer, format: ExportFormat, path: &Path) -> Result<()> {
            if path.file_name().is_some_and(|name| name == self.refused) {
                return Err(AudioError::Resource(format!("Disk full writing {}", path.display())));
            }
            self.inner.encode(buffer, format, path)
        }

        fn open_reader(
            &self,
            path: &Path,
            start: f64,
            end: f64,
        ) -> Result<Box<dyn crate::domain::codec::PcmReader>> {
            self.inner.open_reader(path, start, end)
        }
    }

    #[test]
    fn test_failed_stem_write_leaves_no_outputs() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("song.wav");
        let codec = RefusingCodec {
            inner: MemoryCodec::default(),
            refused: INSTRUMENTAL_FILE,
        };
        let left = vec![0.2f32; SAMPLE_RATE as usize / 2];
        let right = vec![-0.2f32; SAMPLE_RATE as usize / 2];
        codec
            .inner
            .insert(&source, SampleBuffer::new(vec![left, right], SAMPLE_RATE).unwrap());

        let services = Services {
            codec: Arc::new(codec),
            sink: Arc::new(NullSink::new()),
            separator: Arc::new(SplitSeparator),
            beats: Arc::new(OnsetBeatDetector::default()),
        };
        let mut config = CadenzaConfig::default();
        config.app.job_poll_interval_ms = 5;
        let mut editor = Editor::new(services, config);
        editor.load(&source).unwrap();
        editor.wait_idle(Duration::from_secs(5));

        editor.separate_vocals().unwrap();
        let events = editor.wait_idle(Duration::from_secs(10));

        assert!(events.iter().any(|e| matches!(
            e,
            EditorEvent::Failed { operation: Operation::Separate, kind: ErrorKind::Job, .. }
        )));
        assert!(!events.iter().any(|e| matches!(e, EditorEvent::Separated { .. })));
        assert!(!dir.path().join(VOCAL_FILE).exists());
        assert!(!dir.path().join(INSTRUMENTAL_FILE).exists());
        assert!(!editor.is_processing());
    }

    #[test]
    fn test_apply_lock_held_for_render() {
        let mut f = loaded(0.5);

        // Another apply still rendering
        let lease = f.editor.gate.lease_apply().unwrap();
        assert!(!f.editor.is_processing());
        assert!(matches!(f.editor.toggle_fade(), Err(AudioError::Busy)));
        assert!(!f.editor.is_processing());
        drop(lease);
        assert!(!f.editor.gate.is_applying());

        f.editor.toggle_fade().unwrap();
        f.editor.wait_idle(Duration::from_secs(5));
        assert!(!f.editor.gate.is_applying());
        assert!(f.editor.session().params().fade_enabled);
    }

    #[test]
    fn test_rejected_apply_releases_lock() {
        let mut f = fixture(0.5);
        f.editor.load(f.dir.path().join("song.wav")).unwrap();
        // Load sets the flag but leaves no original yet
        assert!(f.editor.apply().is_err());
        assert!(!f.editor.gate.is_applying());
        f.editor.wait_idle(Duration::from_secs(5));

        assert!(matches!(f.editor.export(ExportFormat::Wav, f.dir.path().join("a.wav")), Ok(())));
        assert!(matches!(f.editor.apply(), Err(AudioError::Busy)));
        assert!(!f.editor.gate.is_applying());
        f.editor.wait_idle(Duration::from_secs(5));
    }
}
