//! Cadenza CLI
//!
//! ```bash
//! cadenza info song.mp3 --json
//! cadenza process song.mp3 -o out.flac --gain 3 --eq 2,0,-1 --reverb
//! cadenza preview song.mp3 --start 30 --end 45
//! cadenza separate song.mp3
//! cadenza preset save warm --eq 4,0,-2 --echo
//! cadenza shell song.mp3
//! ```

use anyhow::{bail, Context, Result};
use cadenza_core::domain::{
    BeatDetector, CadenzaConfig, Command, CommandExecutor, CommandResult, ConfigManager, EffectParams,
    Editor, EditorEvent, ExportFormat, OnsetBeatDetector, PresetManager, PreviewEvent, Services,
};
use cadenza_infra::{audio::output_device_names, CpalSink, ExternalSeparator, FileCodec};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Upper bound for any single background operation driven from the CLI
const OPERATION_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Parser)]
#[command(name = "cadenza")]
#[command(about = "Audio editor: effects, preview, separation and export", version, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show duration, format, tags and tempo of a file
    Info {
        input: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,

        /// Waveform width in characters
        #[arg(long, default_value_t = 60)]
        width: usize,
    },

    /// Cut, apply effects and export in one go
    Process {
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Export format; defaults to the output extension
        #[arg(short, long)]
        format: Option<ExportFormat>,

        /// Keep only START,END seconds
        #[arg(long, value_delimiter = ',')]
        cut: Option<Vec<f64>>,

        /// Start from a saved preset
        #[arg(long)]
        preset: Option<String>,

        #[command(flatten)]
        effects: EffectArgs,
    },

    /// Play a time range on the default output device
    Preview {
        input: PathBuf,

        #[arg(long, default_value_t = 0.0)]
        start: f64,

        /// End of the range; defaults to the end of the track
        #[arg(long)]
        end: Option<f64>,
    },

    /// Split into vocal.wav and instrumental.wav next to the input
    Separate { input: PathBuf },

    /// Manage effect presets
    Preset {
        #[command(subcommand)]
        action: PresetAction,
    },

    /// List output devices
    Devices,

    /// Interactive editing session reading commands from stdin
    Shell { input: Option<PathBuf> },
}

#[derive(Subcommand)]
enum PresetAction {
    Save {
        name: String,
        #[command(flatten)]
        effects: EffectArgs,
    },
    List,
    Show { name: String },
    Delete { name: String },
}

#[derive(Args, Default)]
struct EffectArgs {
    /// Volume change in dB
    #[arg(long, allow_hyphen_values = true)]
    gain: Option<f32>,

    /// Playback speed factor
    #[arg(long)]
    speed: Option<f32>,

    /// Pitch shift in semitones
    #[arg(long, allow_hyphen_values = true)]
    pitch: Option<f32>,

    /// Bass,mid,treble gains in dB
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    eq: Option<Vec<f32>>,

    #[arg(long)]
    reverb: bool,

    #[arg(long)]
    echo: bool,

    #[arg(long)]
    fade: bool,
}

impl EffectArgs {
    fn apply_to(&self, mut params: EffectParams) -> Result<EffectParams> {
        if let Some(gain) = self.gain {
            params = params.with_volume(gain);
        }
        if let Some(speed) = self.speed {
            params = params.with_speed(speed);
        }
        if let Some(pitch) = self.pitch {
            params = params.with_pitch(pitch);
        }
        match self.eq.as_deref() {
            Some([bass, mid, treble]) => params = params.with_eq(*bass, *mid, *treble),
            Some(other) => bail!("--eq takes three gains, got {}", other.len()),
            None => {}
        }
        params.reverb_enabled |= self.reverb;
        params.echo_enabled |= self.echo;
        params.fade_enabled |= self.fade;
        params.validate()?;
        Ok(params)
    }
}

// ============================================================================
// Setup
// ============================================================================

fn init_tracing(verbose: bool) {
    let default = if verbose { "cadenza=debug,debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

async fn load_config(path: Option<&Path>) -> Result<(CadenzaConfig, PathBuf)> {
    match path {
        Some(path) => {
            let config = CadenzaConfig::load_from_file(path)
                .await
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
            Ok((config, dir))
        }
        None => {
            let dir = ConfigManager::default_config_dir()?;
            let config = ConfigManager::new(dir.clone()).load().await;
            Ok((config, dir))
        }
    }
}

fn build_editor(config: &CadenzaConfig) -> Editor {
    let services = Services {
        codec: Arc::new(FileCodec::new(&config.tools.ffmpeg_path)),
        sink: Arc::new(CpalSink::new()),
        separator: Arc::new(ExternalSeparator::new(
            &config.tools.separator_program,
            config.tools.separator_args.clone(),
        )),
        beats: Arc::new(OnsetBeatDetector::default()),
    };
    Editor::new(services, config.clone())
}

fn print_event(event: &EditorEvent) {
    match event {
        EditorEvent::Loaded { summary } => println!("{}", summary),
        EditorEvent::Status(message) => println!("{}", message),
        EditorEvent::Exported { path, format } => println!("Exported {} ({})", path.display(), format),
        EditorEvent::Separated { vocal, instrumental } => {
            println!("Vocals: {}\nInstrumental: {}", vocal.display(), instrumental.display())
        }
        EditorEvent::Failed { operation, message, .. } => eprintln!("{} failed: {}", operation, message),
        EditorEvent::Preview(PreviewEvent::Position(pos)) => println!("  ▶ {:.1}s", pos),
        EditorEvent::Preview(PreviewEvent::Error(message)) => eprintln!("Preview error: {}", message),
        EditorEvent::Preview(PreviewEvent::Stopped { reason }) => println!("Preview {:?}", reason),
        other => debug!(?other, "Editor event"),
    }
}

/// Drive background work to completion and turn a failure event into an error
fn finish(editor: &mut Editor) -> Result<Vec<EditorEvent>> {
    let events = editor.wait_idle(OPERATION_TIMEOUT);
    for event in &events {
        print_event(event);
    }
    if editor.is_processing() {
        bail!("Timed out waiting for background work");
    }
    if let Some(EditorEvent::Failed { operation, message, .. }) =
        events.iter().find(|e| matches!(e, EditorEvent::Failed { .. }))
    {
        bail!("{} failed: {}", operation, message);
    }
    Ok(events)
}

fn load(editor: &mut Editor, input: &Path) -> Result<()> {
    editor.load(input)?;
    finish(editor).with_context(|| format!("Cannot open {}", input.display()))?;
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

fn sparkline(peaks: &[(f32, f32)]) -> String {
    const BARS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
    let loudest = peaks.iter().map(|(lo, hi)| hi - lo).fold(0.0f32, f32::max);
    if loudest <= 0.0 {
        return BARS[0].to_string().repeat(peaks.len());
    }
    peaks
        .iter()
        .map(|(lo, hi)| BARS[(((hi - lo) / loudest) * 7.0).round() as usize])
        .collect()
}

#[derive(Serialize)]
struct InfoReport {
    summary: cadenza_core::domain::TrackSummary,
    tempo_bpm: f64,
    beats: usize,
    peak: f32,
    rms: f32,
}

fn cmd_info(codec: &FileCodec, input: &Path, json: bool, width: usize) -> Result<()> {
    use cadenza_core::domain::AudioCodec;

    let decoded = codec
        .decode(input)
        .with_context(|| format!("Cannot open {}", input.display()))?;
    let beats = OnsetBeatDetector::default().detect(&decoded.buffer)?;
    let report = InfoReport {
        summary: cadenza_core::domain::TrackSummary::new(&decoded.buffer, decoded.bitrate, &decoded.metadata),
        tempo_bpm: beats.tempo_bpm,
        beats: beats.beat_times.len(),
        peak: decoded.buffer.peak(),
        rms: decoded.buffer.rms(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary);
        println!("Tempo: {:.1} BPM ({} beats) | Peak: {:.3} | RMS: {:.3}", report.tempo_bpm, report.beats, report.peak, report.rms);
        println!("{}", sparkline(&decoded.buffer.waveform_overview(width.max(1))));
    }
    Ok(())
}

async fn cmd_process(
    config: &CadenzaConfig,
    config_dir: &Path,
    input: &Path,
    output: &Path,
    format: Option<ExportFormat>,
    cut: Option<&[f64]>,
    preset: Option<&str>,
    effects: &EffectArgs,
) -> Result<()> {
    let format = match format {
        Some(format) => format,
        None => match output.extension().and_then(|e| e.to_str()) {
            Some(ext) => ext.parse()?,
            None => config.app.default_export_format,
        },
    };
    let base = match preset {
        Some(name) => PresetManager::new(config_dir.join(&config.app.preset_dir))
            .load_preset(name)
            .await?,
        None => EffectParams::neutral(),
    };
    let params = effects.apply_to(base)?;

    let mut editor = build_editor(config);
    load(&mut editor, input)?;

    match cut {
        Some([start, end]) => {
            editor.cut(*start, *end)?;
            finish(&mut editor)?;
        }
        Some(other) => bail!("--cut takes START,END, got {} values", other.len()),
        None => {}
    }
    if !params.is_neutral() {
        editor.apply_all(params)?;
        finish(&mut editor)?;
    }
    editor.export(format, output)?;
    finish(&mut editor)?;
    info!(output = %output.display(), "Processing complete");
    Ok(())
}

fn cmd_preview(config: &CadenzaConfig, input: &Path, start: f64, end: Option<f64>) -> Result<()> {
    let mut editor = build_editor(config);
    load(&mut editor, input)?;
    let end = end.unwrap_or_else(|| editor.session().duration());
    editor.preview_range(start, end)?;

    loop {
        std::thread::sleep(config.app.job_poll_interval());
        for event in editor.pump() {
            print_event(&event);
            if let EditorEvent::Preview(PreviewEvent::Stopped { .. }) = event {
                return Ok(());
            }
        }
    }
}

fn cmd_separate(config: &CadenzaConfig, input: &Path) -> Result<()> {
    let mut editor = build_editor(config);
    load(&mut editor, input)?;
    editor.separate_vocals()?;
    finish(&mut editor)?;
    Ok(())
}

async fn cmd_preset(config: &CadenzaConfig, config_dir: &Path, action: PresetAction) -> Result<()> {
    let presets = PresetManager::new(config_dir.join(&config.app.preset_dir));
    match action {
        PresetAction::Save { name, effects } => {
            presets.save_preset(&name, &effects.apply_to(EffectParams::neutral())?).await?;
            println!("Saved preset '{}'", name);
        }
        PresetAction::List => {
            for name in presets.list_presets().await? {
                println!("{}", name);
            }
        }
        PresetAction::Show { name } => {
            let params = presets.load_preset(&name).await?;
            println!("{}", serde_json::to_string_pretty(&params)?);
        }
        PresetAction::Delete { name } => {
            presets.delete_preset(&name).await?;
            println!("Deleted preset '{}'", name);
        }
    }
    Ok(())
}

async fn cmd_shell(config: &CadenzaConfig, input: Option<&Path>) -> Result<()> {
    let mut editor = build_editor(config);
    if let Some(input) = input {
        editor.execute(Command::Load {
            path: input.to_path_buf(),
        })?;
    }
    println!("Type commands (load, cut, gain, apply, preview, undo, export, quit ...)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(config.app.job_poll_interval());

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let outcome = line.parse::<Command>().and_then(|command| editor.execute(command));
                match outcome {
                    Ok(CommandResult::Quit) => break,
                    Ok(CommandResult::Status(status)) => println!("{}", status),
                    Ok(CommandResult::Parameters(params)) => println!("Pending: {:?}", params),
                    Ok(CommandResult::History { moved: false }) => {}
                    Ok(CommandResult::Reset(Some(bounds))) => println!("Cut range: {:.3}-{:.3}", bounds.start, bounds.end),
                    Ok(_) => {}
                    Err(e) => eprintln!("{}", e),
                }
            }
            _ = ticker.tick() => {
                for event in editor.pump() {
                    print_event(&event);
                }
            }
        }
    }

    editor.stop_preview()?;
    for event in editor.wait_idle(OPERATION_TIMEOUT) {
        print_event(&event);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let (config, config_dir) = load_config(cli.config.as_deref()).await?;
    debug!(config_dir = %config_dir.display(), "Configuration ready");

    match cli.command {
        Commands::Info { input, json, width } => {
            cmd_info(&FileCodec::new(&config.tools.ffmpeg_path), &input, json, width)
        }
        Commands::Process {
            input,
            output,
            format,
            cut,
            preset,
            effects,
        } => {
            cmd_process(
                &config,
                &config_dir,
                &input,
                &output,
                format,
                cut.as_deref(),
                preset.as_deref(),
                &effects,
            )
            .await
        }
        Commands::Preview { input, start, end } => cmd_preview(&config, &input, start, end),
        Commands::Separate { input } => cmd_separate(&config, &input),
        Commands::Preset { action } => cmd_preset(&config, &config_dir, action).await,
        Commands::Devices => {
            for name in output_device_names()? {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Shell { input } => cmd_shell(&config, input.as_deref()).await,
    }
}
