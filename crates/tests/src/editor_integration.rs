//! Integration tests for the editor
//!
//! A real WAV file goes through the file codec, the effects chain, the
//! history, the preview controller (into a null sink) and back out to disk.

use cadenza_core::domain::{
    AudioError, BeatOverlay, CadenzaConfig, Command, CommandExecutor, CommandResult, CutBounds,
    EffectParams, Editor, EditorEvent, ErrorKind, ExportFormat, NullSink, OnsetBeatDetector,
    PresetManager, PreviewEvent, PreviewState, SampleBuffer, Services, SourceSeparator, StemPair,
    StopReason,
};
use cadenza_infra::codec::write_wav_pcm16;
use cadenza_infra::FileCodec;
use proptest::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const SAMPLE_RATE: u32 = 16000;
const WAIT: Duration = Duration::from_secs(20);

/// Swaps the channels: "vocals" are the right channel
struct SwapSeparator;

impl SourceSeparator for SwapSeparator {
    fn separate(&self, buffer: &SampleBuffer) -> cadenza_core::domain::audio::Result<StemPair> {
        let right = buffer.channel(1).to_vec();
        let left = buffer.channel(0).to_vec();
        Ok(StemPair {
            vocal: SampleBuffer::new(vec![right.clone(), right], buffer.sample_rate())?,
            instrumental: SampleBuffer::new(vec![left.clone(), left], buffer.sample_rate())?,
        })
    }

    fn name(&self) -> &'static str {
        "swap"
    }
}

fn generate_tone(seconds: f64) -> SampleBuffer {
    let frames = (seconds * SAMPLE_RATE as f64) as usize;
    let left: Vec<f32> = (0..frames)
        .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / SAMPLE_RATE as f32).sin() * 0.4)
        .collect();
    let right: Vec<f32> = left.iter().map(|s| s * 0.5).collect();
    SampleBuffer::new(vec![left, right], SAMPLE_RATE).unwrap()
}

struct Harness {
    dir: TempDir,
    input: PathBuf,
    sink: NullSink,
    editor: Editor,
}

fn harness_with(seconds: f64, history_limit: usize) -> Harness {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("tone.wav");
    write_wav_pcm16(&generate_tone(seconds), &input).unwrap();

    let mut config = CadenzaConfig::default();
    config.app.job_poll_interval_ms = 5;
    config.app.position_interval_ms = 20;
    config.app.history_limit = history_limit;

    let sink = NullSink::new();
    let services = Services {
        codec: Arc::new(FileCodec::default()),
        sink: Arc::new(sink.clone()),
        separator: Arc::new(SwapSeparator),
        beats: Arc::new(OnsetBeatDetector::default()),
    };
    Harness {
        dir,
        input,
        sink,
        editor: Editor::new(services, config),
    }
}

fn loaded(seconds: f64) -> Harness {
    let mut h = harness_with(seconds, 64);
    h.editor.load(&h.input).unwrap();
    settle(&mut h.editor);
    h
}

/// Wait for background work and fail the test on any failure event
fn settle(editor: &mut Editor) -> Vec<EditorEvent> {
    let events = editor.wait_idle(WAIT);
    assert!(!editor.is_processing(), "operation did not finish");
    for event in &events {
        if let EditorEvent::Failed { operation, message, .. } = event {
            panic!("{} failed: {}", operation, message);
        }
    }
    events
}

fn apply(editor: &mut Editor, params: EffectParams) {
    editor.apply_all(params).unwrap();
    settle(editor);
}

fn active(editor: &Editor) -> Arc<SampleBuffer> {
    editor.session().active_buffer().unwrap()
}

// ============================================================================
// LOADING
// ============================================================================

#[test]
fn test_load_reports_summary_and_default_cut() {
    let mut h = harness_with(2.0, 64);
    h.editor.load(&h.input).unwrap();
    let events = settle(&mut h.editor);

    let summary = events
        .iter()
        .find_map(|e| match e {
            EditorEvent::Loaded { summary } => Some(summary.clone()),
            _ => None,
        })
        .expect("loaded event");
    assert_eq!(summary.channels, 2);
    assert_eq!(summary.sample_rate, SAMPLE_RATE);
    assert_eq!(summary.bitrate, 2 * 16 * SAMPLE_RATE);
    assert!(summary.to_string().starts_with("Duration: 2.00s | Channels: 2"));
    assert!(events.contains(&EditorEvent::CutBounds(CutBounds { start: 0.0, end: 2.0 })));
    assert!(events
        .iter()
        .any(|e| matches!(e, EditorEvent::BeatsUpdated(BeatOverlay { .. }))));
    assert!(!h.editor.session().history().can_undo());
}

#[test]
fn test_failed_load_leaves_session_untouched() {
    let mut h = loaded(1.0);
    let before = active(&h.editor);

    h.editor.load(h.dir.path().join("missing.mp3")).unwrap();
    let events = h.editor.wait_idle(WAIT);
    assert!(events.iter().any(|e| matches!(
        e,
        EditorEvent::Failed { kind: ErrorKind::Load, .. }
    )));
    assert_eq!(active(&h.editor), before);
}

// ============================================================================
// HISTORY
// ============================================================================

#[test]
fn test_undo_redo_walks_the_history() {
    let mut h = loaded(1.0);
    let original = active(&h.editor);

    let gains = [-6.0, -3.0, 3.0];
    let mut rendered = Vec::new();
    for gain in gains {
        apply(&mut h.editor, EffectParams::neutral().with_volume(gain));
        rendered.push(active(&h.editor));
    }

    for expected in rendered.iter().rev().skip(1) {
        assert!(h.editor.undo().unwrap());
        assert_eq!(&active(&h.editor), expected);
    }
    assert!(h.editor.undo().unwrap());
    assert_eq!(active(&h.editor), original);
    assert!(!h.editor.undo().unwrap());

    for expected in &rendered {
        assert!(h.editor.redo().unwrap());
        assert_eq!(&active(&h.editor), expected);
    }
    assert!(!h.editor.redo().unwrap());
    assert_eq!(h.editor.session().params().volume_gain_db, 3.0);
}

#[test]
fn test_new_edit_discards_redo_branch() {
    let mut h = loaded(1.0);
    apply(&mut h.editor, EffectParams::neutral().with_volume(-6.0));
    apply(&mut h.editor, EffectParams::neutral().with_volume(-12.0));
    assert!(h.editor.undo().unwrap());
    assert!(h.editor.session().history().can_redo());

    apply(&mut h.editor, EffectParams::neutral().toggled_fade());
    assert!(!h.editor.session().history().can_redo());
    assert!(!h.editor.redo().unwrap());
}

#[test]
fn test_history_limit_drops_oldest() {
    let mut h = harness_with(0.5, 3);
    h.editor.load(&h.input).unwrap();
    settle(&mut h.editor);
    for gain in 1..=5 {
        apply(&mut h.editor, EffectParams::neutral().with_volume(gain as f32));
    }

    let mut undos = 0;
    while h.editor.undo().unwrap() {
        undos += 1;
    }
    assert_eq!(undos, 2);
    assert_eq!(h.editor.session().params().volume_gain_db, 3.0);
}

#[test]
fn test_apply_rerenders_from_original() {
    let mut h = loaded(1.0);
    apply(&mut h.editor, EffectParams::neutral().with_volume(-6.0));
    apply(&mut h.editor, EffectParams::neutral().with_volume(-6.0));
    let twice = active(&h.editor);

    let once = generate_tone(1.0);
    let expected = 10f32.powf(-6.0 / 20.0) * once.peak();
    assert!((twice.peak() - expected).abs() < 2e-3, "{} vs {}", twice.peak(), expected);
}

// ============================================================================
// CUT / EXPORT / SEPARATION
// ============================================================================

#[test]
fn test_cut_rejects_bad_ranges_without_mutation() {
    let mut h = loaded(2.0);
    for (start, end) in [(-0.1, 1.0), (1.0, 1.0), (1.5, 0.5), (0.0, 2.5)] {
        let err = h.editor.cut(start, end).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "[{}, {}]", start, end);
    }
    assert!(!h.editor.is_processing());
    assert_eq!(h.editor.session().duration(), 2.0);
}

#[test]
fn test_cut_then_export_round_trips() {
    let mut h = loaded(2.0);
    h.editor.cut(0.5, 1.25).unwrap();
    let events = settle(&mut h.editor);
    assert!(events.contains(&EditorEvent::CutBounds(CutBounds { start: 0.0, end: 0.75 })));
    assert!(h.editor.session().params().is_neutral());

    let out = h.dir.path().join("cut.wav");
    h.editor.export(ExportFormat::Wav, &out).unwrap();
    settle(&mut h.editor);

    let reloaded = cadenza_infra::codec::decode_file(&out).unwrap();
    assert_eq!(reloaded.buffer.frames(), (0.75 * SAMPLE_RATE as f64) as usize);
}

#[test]
fn test_second_operation_is_rejected_while_processing() {
    let mut h = loaded(2.0);
    h.editor.apply_all(EffectParams::neutral().with_pitch(2.0)).unwrap();

    assert!(matches!(h.editor.cut(0.0, 1.0), Err(AudioError::Busy)));
    assert!(matches!(h.editor.separate_vocals(), Err(AudioError::Busy)));
    assert!(matches!(h.editor.preview_range(0.0, 1.0), Err(AudioError::Busy)));
    assert!(matches!(h.editor.redo(), Err(AudioError::Busy)));

    settle(&mut h.editor);
    assert_eq!(h.editor.session().params().pitch_semitones, 2.0);
}

#[test]
fn test_separation_persists_stems_next_to_source() {
    let mut h = loaded(0.5);
    h.editor.separate_vocals().unwrap();
    let events = settle(&mut h.editor);

    let vocal = h.dir.path().join("vocal.wav");
    let instrumental = h.dir.path().join("instrumental.wav");
    assert!(events.contains(&EditorEvent::Separated {
        vocal: vocal.clone(),
        instrumental: instrumental.clone(),
    }));

    let vocal = cadenza_infra::codec::decode_file(&vocal).unwrap().buffer;
    let instrumental = cadenza_infra::codec::decode_file(&instrumental).unwrap().buffer;
    assert_eq!(vocal.sample_rate(), 44100);
    // Right channel was recorded at half level
    assert!(vocal.peak() < instrumental.peak() * 0.6);
}

// ============================================================================
// PREVIEW
// ============================================================================

fn collect_preview(editor: &mut Editor, timeout: Duration) -> Vec<PreviewEvent> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
        for event in editor.pump() {
            if let EditorEvent::Preview(event) = event {
                let stopped = matches!(event, PreviewEvent::Stopped { .. });
                seen.push(event);
                if stopped {
                    return seen;
                }
            }
        }
    }
    seen
}

#[test]
fn test_preview_range_plays_to_completion() {
    let mut h = loaded(5.0);
    let started = Instant::now();
    h.editor.preview_range(1.0, 4.0).unwrap();
    assert_eq!(h.editor.preview().state(), PreviewState::Streaming);
    let artifact = h.editor.preview().artifact_path().unwrap();
    assert!(artifact.exists());

    let events = collect_preview(&mut h.editor, Duration::from_secs(10));
    assert!(started.elapsed() >= Duration::from_millis(2900));
    assert_eq!(events.first(), Some(&PreviewEvent::Started { start: 1.0, end: 4.0 }));
    assert_eq!(events.last(), Some(&PreviewEvent::Stopped { reason: StopReason::Completed }));

    let positions: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            PreviewEvent::Position(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert!(positions.len() > 5);
    assert!(positions.windows(2).all(|w| w[1] >= w[0]));
    assert!(positions.iter().all(|p| (1.0..=4.0).contains(p)));
    assert_eq!(positions.last(), Some(&4.0));

    assert_eq!(h.editor.preview().state(), PreviewState::Idle);
    assert!(!artifact.exists());
    assert_eq!(h.sink.frames_written(), 3 * SAMPLE_RATE as u64);
}

#[test]
fn test_preview_seek_and_stop() {
    let mut h = loaded(5.0);
    h.editor.preview_range(1.0, 4.0).unwrap();

    for outside in [0.5, 4.5] {
        let err = h.editor.seek(outside).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
    h.editor.seek(3.0).unwrap();
    assert_eq!(h.editor.preview().range(), (1.0, 4.0));

    h.editor.stop_preview().unwrap();
    h.editor.stop_preview().unwrap();
    let events = collect_preview(&mut h.editor, Duration::from_secs(2));
    assert!(events.contains(&PreviewEvent::Started { start: 3.0, end: 4.0 }));
    assert_eq!(events.last(), Some(&PreviewEvent::Stopped { reason: StopReason::Stopped }));
    assert_eq!(h.editor.preview().state(), PreviewState::Idle);
}

// ============================================================================
// COMMANDS AND PRESETS
// ============================================================================

#[test]
fn test_shell_commands_drive_the_editor() {
    let mut h = loaded(1.0);
    let run = |editor: &mut Editor, line: &str| editor.execute(line.parse::<Command>().unwrap());

    let pending = run(&mut h.editor, "eq 6 0 -6").unwrap();
    assert!(matches!(pending, CommandResult::Parameters(p) if p.bass_gain_db == 6.0));
    assert_eq!(run(&mut h.editor, "apply").unwrap(), CommandResult::Started);
    settle(&mut h.editor);
    assert!(h.editor.session().params().has_eq());

    assert_eq!(run(&mut h.editor, "undo").unwrap(), CommandResult::History { moved: true });
    assert_eq!(
        run(&mut h.editor, "reset").unwrap(),
        CommandResult::Reset(Some(CutBounds { start: 0.0, end: 1.0 }))
    );
    let CommandResult::Status(status) = run(&mut h.editor, "status").unwrap() else {
        panic!("expected status");
    };
    assert!(status.contains("Undo: 0"));
}

#[test]
fn test_preset_feeds_apply() {
    let h = loaded(0.5);
    let presets = PresetManager::new(h.dir.path().join("presets"));
    let warm = EffectParams::neutral().with_eq(4.0, 0.0, -2.0).toggled_echo();

    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(presets.save_preset("warm", &warm)).unwrap();
    let loaded_params = runtime.block_on(presets.load_preset("warm")).unwrap();

    let mut editor = h.editor;
    apply(&mut editor, loaded_params);
    assert_eq!(editor.session().params(), warm);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_invalid_cuts_never_start_work(start in -2.0f64..4.0, len in -1.0f64..0.0) {
        let mut h = loaded(0.25);
        let result = h.editor.cut(start, start + len);
        prop_assert!(result.is_err());
        prop_assert!(!h.editor.is_processing());
        prop_assert_eq!(h.editor.session().duration(), 0.25);
    }
}
