//! Time-range preview playback
//!
//! One preview session at a time. Starting renders the active buffer to a
//! transient WAV artifact, opens an output stream and spawns a supervisor
//! thread. The supervisor runs the playhead clock and owns a streaming thread
//! that pushes fixed-size chunks to the sink; when the range has played out
//! or a stop is requested it joins the streamer, deletes the artifact and
//! reports `Stopped`.
//!
//! State machine: `Idle → Starting → Streaming → Stopping → Idle`. A seek
//! stops the current session but keeps the artifact, then restarts at the
//! new offset with the same range end.

use super::audio::{AudioError, AudioSink, ChannelCount, OutputStream, Result, SampleBuffer, StreamSpec};
use super::codec::{AudioCodec, ExportFormat, PcmReader};
use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempPath;
use tracing::{debug, error, info, warn};

/// Smallest playhead movement worth reporting, in seconds
const POSITION_STEP_SECS: f64 = 0.1;
/// Poll period of the streamer while the device drains its queue
const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreviewState {
    Idle,
    Starting,
    Streaming,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The range played to its end
    Completed,
    /// Explicit stop, or replaced by a new preview
    Stopped,
    /// The output stream or reader failed
    Error,
}

/// Notifications for the UI playhead
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PreviewEvent {
    Started { start: f64, end: f64 },
    Position(f64),
    Stopped { reason: StopReason },
    Error(String),
}

#[derive(Debug, Clone)]
pub struct PreviewConfig {
    /// Frames per chunk written to the output stream
    pub chunk_frames: usize,
    /// Playhead clock tick
    pub position_interval: Duration,
    /// Directory for the transient preview artifact
    pub artifact_dir: PathBuf,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            chunk_frames: 512,
            position_interval: Duration::from_millis(100),
            artifact_dir: std::env::temp_dir(),
        }
    }
}

/// Per-session flags shared with the worker threads
struct SessionControl {
    id: u64,
    active: AtomicBool,
    retain_artifact: AtomicBool,
}

struct Inner {
    state: PreviewState,
    control: Option<Arc<SessionControl>>,
    supervisor: Option<JoinHandle<()>>,
    artifact: Option<TempPath>,
    range_start: f64,
    range_end: f64,
    position: f64,
}

struct Shared {
    inner: Mutex<Inner>,
    seeking: AtomicBool,
    events: Sender<PreviewEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: PreviewEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

pub struct PreviewController {
    codec: Arc<dyn AudioCodec>,
    sink: Arc<dyn AudioSink>,
    config: PreviewConfig,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    /// Serialises start/seek/stop
    op_lock: Mutex<()>,
}

impl PreviewController {
    /// Create a controller and the receiving end of its event stream
    pub fn new(
        codec: Arc<dyn AudioCodec>,
        sink: Arc<dyn AudioSink>,
        config: PreviewConfig,
    ) -> (Self, Receiver<PreviewEvent>) {
        let (events, rx) = unbounded();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: PreviewState::Idle,
                control: None,
                supervisor: None,
                artifact: None,
                range_start: 0.0,
                range_end: 0.0,
                position: 0.0,
            }),
            seeking: AtomicBool::new(false),
            events,
        });
        let controller = Self {
            codec,
            sink,
            config,
            shared,
            next_id: AtomicU64::new(1),
            op_lock: Mutex::new(()),
        };
        (controller, rx)
    }

    pub fn state(&self) -> PreviewState {
        self.shared.lock().state
    }

    /// Last reported playhead position in seconds
    pub fn position(&self) -> f64 {
        self.shared.lock().position
    }

    /// `(start, end)` of the configured range
    pub fn range(&self) -> (f64, f64) {
        let inner = self.shared.lock();
        (inner.range_start, inner.range_end)
    }

    pub fn artifact_path(&self) -> Option<PathBuf> {
        self.shared.lock().artifact.as_ref().map(|p| p.to_path_buf())
    }

    /// Suspend playhead notifications while the user drags the position
    pub fn set_seeking(&self, seeking: bool) {
        self.shared.seeking.store(seeking, Ordering::Release);
    }

    fn op_guard(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Play `[start_secs, end_secs)` of `buffer`, replacing any running preview
    pub fn start(&self, buffer: Arc<SampleBuffer>, start_secs: f64, end_secs: f64) -> Result<()> {
        let duration = buffer.duration_secs();
        if !start_secs.is_finite()
            || !end_secs.is_finite()
            || start_secs < 0.0
            || end_secs <= start_secs
            || end_secs > duration + 1e-9
        {
            return Err(AudioError::validation(format!(
                "Invalid preview range [{}, {}] for a {:.3}s track",
                start_secs, end_secs, duration
            )));
        }

        let _op = self.op_guard();
        self.stop_locked()?;

        {
            let mut inner = self.shared.lock();
            inner.state = PreviewState::Starting;
            inner.range_start = start_secs;
            inner.range_end = end_secs;
            inner.position = start_secs;
        }

        let artifact = match self.render_artifact(&buffer) {
            Ok(artifact) => artifact,
            Err(e) => {
                self.shared.lock().state = PreviewState::Idle;
                return Err(e);
            }
        };
        let path = artifact.to_path_buf();
        self.shared.lock().artifact = Some(artifact);

        if let Err(e) = self.launch(path, start_secs, end_secs) {
            self.abort_start();
            return Err(e);
        }
        Ok(())
    }

    /// Restart the running preview at `position_secs`
    pub fn seek(&self, position_secs: f64) -> Result<()> {
        let _op = self.op_guard();

        let (control, supervisor, end, path) = {
            let mut inner = self.shared.lock();
            if inner.state != PreviewState::Streaming {
                return Err(AudioError::validation("No preview is playing"));
            }
            if !(position_secs >= inner.range_start && position_secs <= inner.range_end) {
                return Err(AudioError::validation(format!(
                    "Seek position {:.3}s is outside the preview range [{:.3}, {:.3}]",
                    position_secs, inner.range_start, inner.range_end
                )));
            }
            let path = inner
                .artifact
                .as_ref()
                .map(|p| p.to_path_buf())
                .ok_or_else(|| AudioError::processing("Preview artifact missing"))?;
            (inner.control.clone(), inner.supervisor.take(), inner.range_end, path)
        };

        if let Some(control) = &control {
            control.retain_artifact.store(true, Ordering::Release);
            control.active.store(false, Ordering::Release);
        }
        join_supervisor(supervisor);

        // The range may have finished playing while we were stopping it
        if self.shared.lock().artifact.is_none() {
            return Err(AudioError::validation("Preview already finished"));
        }

        debug!(position_secs, "Preview seek");
        if let Err(e) = self.launch(path, position_secs, end) {
            self.abort_start();
            return Err(e);
        }
        Ok(())
    }

    /// Stop the running preview; a no-op when idle
    pub fn stop(&self) -> Result<()> {
        let _op = self.op_guard();
        self.stop_locked()
    }

    fn stop_locked(&self) -> Result<()> {
        let (control, supervisor) = {
            let mut inner = self.shared.lock();
            if inner.state == PreviewState::Idle {
                return Ok(());
            }
            inner.state = PreviewState::Stopping;
            (inner.control.clone(), inner.supervisor.take())
        };

        if let Some(control) = &control {
            control.active.store(false, Ordering::Release);
        }
        join_supervisor(supervisor);

        // The supervisor already cleaned up unless it never ran
        let leftover = {
            let mut inner = self.shared.lock();
            let leftover = inner.artifact.take();
            inner.control = None;
            inner.state = PreviewState::Idle;
            leftover
        };
        if let Some(path) = leftover {
            remove_artifact(path);
        }
        Ok(())
    }

    /// Tear down after a failed start or restart
    fn abort_start(&self) {
        let artifact = {
            let mut inner = self.shared.lock();
            inner.state = PreviewState::Idle;
            inner.control = None;
            inner.artifact.take()
        };
        if let Some(path) = artifact {
            remove_artifact(path);
        }
    }

    fn render_artifact(&self, buffer: &SampleBuffer) -> Result<TempPath> {
        let artifact = tempfile::Builder::new()
            .prefix("audio_preview_")
            .suffix(".wav")
            .tempfile_in(&self.config.artifact_dir)
            .map_err(|e| AudioError::Resource(format!("Cannot create preview file: {}", e)))?
            .into_temp_path();
        // On failure the TempPath drop removes the file
        self.codec.encode(buffer, ExportFormat::Wav, &artifact)?;
        debug!(path = %artifact.display(), "Preview artifact written");
        Ok(artifact)
    }

    /// Open reader and stream, then hand both to a new supervisor thread
    fn launch(&self, path: PathBuf, offset: f64, end: f64) -> Result<()> {
        let reader = self.codec.open_reader(&path, offset, end)?;
        let spec = StreamSpec {
            sample_rate: reader.sample_rate(),
            channels: ChannelCount::from_count(reader.channels() as usize)?,
        };
        let stream = self.sink.open(spec)?;

        let control = Arc::new(SessionControl {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            retain_artifact: AtomicBool::new(false),
        });

        let mut inner = self.shared.lock();
        inner.state = PreviewState::Streaming;
        inner.position = offset;
        inner.control = Some(Arc::clone(&control));

        let job = Supervisor {
            shared: Arc::clone(&self.shared),
            control,
            offset,
            end,
            chunk_frames: self.config.chunk_frames.max(1),
            interval: self.config.position_interval,
        };
        let handle = thread::Builder::new()
            .name("preview-clock".to_string())
            .spawn(move || job.run(reader, stream))
            .map_err(|e| AudioError::Resource(format!("Cannot spawn preview thread: {}", e)))?;
        inner.supervisor = Some(handle);
        drop(inner);

        info!(
            start = offset,
            end,
            sink = self.sink.name(),
            "Preview streaming"
        );
        self.shared.emit(PreviewEvent::Started { start: offset, end });
        Ok(())
    }
}

impl Drop for PreviewController {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Failed to stop preview on drop");
        }
    }
}

fn join_supervisor(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            error!("Preview supervisor panicked");
        }
    }
}

/// Delete a transient artifact; failures are only logged
fn remove_artifact(path: TempPath) {
    let shown = path.to_path_buf();
    if let Err(e) = path.close() {
        let err = AudioError::Resource(format!("Cannot delete {}: {}", shown.display(), e));
        warn!(error = %err, "Preview artifact left behind");
    } else {
        debug!(path = %shown.display(), "Preview artifact deleted");
    }
}

/// Playhead clock and owner of the streaming thread for one session
struct Supervisor {
    shared: Arc<Shared>,
    control: Arc<SessionControl>,
    offset: f64,
    end: f64,
    chunk_frames: usize,
    interval: Duration,
}

impl Supervisor {
    fn run(self, reader: Box<dyn PcmReader>, stream: Box<dyn OutputStream>) {
        let streamer = {
            let control = Arc::clone(&self.control);
            let chunk_frames = self.chunk_frames;
            thread::Builder::new()
                .name("preview-stream".to_string())
                .spawn(move || stream_chunks(reader, stream, &control, chunk_frames))
        };
        let streamer = match streamer {
            Ok(handle) => handle,
            Err(e) => {
                self.shared
                    .emit(PreviewEvent::Error(format!("Cannot spawn stream thread: {}", e)));
                self.finish(StopReason::Error);
                return;
            }
        };

        let duration = self.end - self.offset;
        let started = Instant::now();
        let mut last_reported = self.offset;
        let mut reason = StopReason::Stopped;

        loop {
            thread::sleep(self.interval);
            if !self.control.active.load(Ordering::Acquire) || streamer.is_finished() {
                break;
            }
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed >= duration {
                reason = StopReason::Completed;
                break;
            }
            let position = self.offset + elapsed;
            if !self.shared.seeking.load(Ordering::Acquire)
                && position - last_reported >= POSITION_STEP_SECS
                && position <= self.end
            {
                self.report_position(position);
                last_reported = position;
            }
        }

        self.control.active.store(false, Ordering::Release);
        match streamer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Preview stream failed");
                self.shared.emit(PreviewEvent::Error(e.to_string()));
                reason = StopReason::Error;
            }
            Err(_) => {
                error!("Preview stream thread panicked");
                self.shared
                    .emit(PreviewEvent::Error("Preview stream thread panicked".to_string()));
                reason = StopReason::Error;
            }
        }

        if reason == StopReason::Completed {
            self.report_position(self.end);
        }
        self.finish(reason);
    }

    fn report_position(&self, position: f64) {
        {
            let mut inner = self.shared.lock();
            if inner.control.as_ref().map(|c| c.id) != Some(self.control.id) {
                return;
            }
            inner.position = position;
        }
        self.shared.emit(PreviewEvent::Position(position));
    }

    /// Clean up this session unless a newer one has replaced it
    fn finish(&self, reason: StopReason) {
        let retain = self.control.retain_artifact.load(Ordering::Acquire);
        let artifact = {
            let mut inner = self.shared.lock();
            if inner.control.as_ref().map(|c| c.id) != Some(self.control.id) {
                return;
            }
            inner.control = None;
            if retain {
                // A seek relaunches on the same artifact
                inner.state = PreviewState::Starting;
                None
            } else {
                inner.state = PreviewState::Stopping;
                inner.artifact.take()
            }
        };
        if retain {
            return;
        }

        if let Some(path) = artifact {
            remove_artifact(path);
        }
        self.shared.lock().state = PreviewState::Idle;
        info!(?reason, "Preview stopped");
        self.shared.emit(PreviewEvent::Stopped { reason });
    }
}

/// Push chunks until the reader is exhausted or the session is deactivated
///
/// After the last chunk the stream stays open until the clock ends the
/// session, so queued audio is not cut off.
fn stream_chunks(
    mut reader: Box<dyn PcmReader>,
    mut stream: Box<dyn OutputStream>,
    control: &SessionControl,
    chunk_frames: usize,
) -> Result<()> {
    let mut pump = || -> Result<()> {
        while control.active.load(Ordering::Acquire) {
            let chunk = reader.read_chunk(chunk_frames)?;
            if chunk.is_empty() {
                break;
            }
            stream.write(&chunk)?;
        }
        while control.active.load(Ordering::Acquire) {
            thread::sleep(DRAIN_POLL);
        }
        Ok(())
    };
    let result = pump();
    let closed = stream.close();
    result.and(closed)
}
