//! User-facing actions as data
//!
//! Every button of an editor front end maps onto one [`Command`]. Commands
//! can be parsed from the text lines of the interactive shell and executed
//! against anything implementing [`CommandExecutor`].

use super::audio::{AudioError, Result};
use super::codec::ExportFormat;
use super::editor::Editor;
use super::params::EffectParams;
use super::session::CutBounds;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Load { path: PathBuf },
    Cut { start: f64, end: f64 },
    /// Volume change in dB
    Gain { db: f32 },
    Speed { factor: f32 },
    Pitch { semitones: f32 },
    Equalizer { bass: f32, mid: f32, treble: f32 },
    Apply,
    ToggleReverb,
    ToggleEcho,
    ToggleFade,
    Undo,
    Redo,
    Reset,
    Preview { start: f64, end: f64 },
    Seek { position: f64 },
    Stop,
    Export { format: ExportFormat, path: PathBuf },
    Separate,
    Status,
    Quit,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Load { .. } => "load",
            Self::Cut { .. } => "cut",
            Self::Gain { .. } => "gain",
            Self::Speed { .. } => "speed",
            Self::Pitch { .. } => "pitch",
            Self::Equalizer { .. } => "eq",
            Self::Apply => "apply",
            Self::ToggleReverb => "reverb",
            Self::ToggleEcho => "echo",
            Self::ToggleFade => "fade",
            Self::Undo => "undo",
            Self::Redo => "redo",
            Self::Reset => "reset",
            Self::Preview { .. } => "preview",
            Self::Seek { .. } => "seek",
            Self::Stop => "stop",
            Self::Export { .. } => "export",
            Self::Separate => "separate",
            Self::Status => "status",
            Self::Quit => "quit",
        }
    }

    /// Whether the command starts background work that must be pumped
    pub fn is_background(&self) -> bool {
        matches!(
            self,
            Self::Load { .. }
                | Self::Cut { .. }
                | Self::Apply
                | Self::ToggleReverb
                | Self::ToggleEcho
                | Self::ToggleFade
                | Self::Export { .. }
                | Self::Separate
        )
    }
}

fn arg<T: FromStr>(args: &[&str], index: usize, what: &str) -> Result<T> {
    let raw = args
        .get(index)
        .ok_or_else(|| AudioError::validation(format!("Missing {}", what)))?;
    raw.parse()
        .map_err(|_| AudioError::validation(format!("Invalid {}: {}", what, raw)))
}

impl FromStr for Command {
    type Err = AudioError;

    /// Parse one shell line such as `cut 1.5 3` or `export mp3 out.mp3`
    fn from_str(line: &str) -> Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, args)) = words.split_first() else {
            return Err(AudioError::validation("Empty command"));
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            // Paths may contain spaces
            "load" => {
                if args.is_empty() {
                    return Err(AudioError::validation("Missing path"));
                }
                Self::Load {
                    path: PathBuf::from(args.join(" ")),
                }
            }
            "cut" => Self::Cut {
                start: arg(args, 0, "start time")?,
                end: arg(args, 1, "end time")?,
            },
            "gain" | "volume" => Self::Gain {
                db: arg(args, 0, "gain")?,
            },
            "speed" => Self::Speed {
                factor: arg(args, 0, "speed factor")?,
            },
            "pitch" => Self::Pitch {
                semitones: arg(args, 0, "pitch")?,
            },
            "eq" => Self::Equalizer {
                bass: arg(args, 0, "bass gain")?,
                mid: arg(args, 1, "mid gain")?,
                treble: arg(args, 2, "treble gain")?,
            },
            "apply" => Self::Apply,
            "reverb" => Self::ToggleReverb,
            "echo" => Self::ToggleEcho,
            "fade" => Self::ToggleFade,
            "undo" => Self::Undo,
            "redo" => Self::Redo,
            "reset" => Self::Reset,
            "preview" | "play" => Self::Preview {
                start: arg(args, 0, "start time")?,
                end: arg(args, 1, "end time")?,
            },
            "seek" => Self::Seek {
                position: arg(args, 0, "position")?,
            },
            "stop" => Self::Stop,
            "export" => {
                if args.len() < 2 {
                    return Err(AudioError::validation("Usage: export <format> <path>"));
                }
                Self::Export {
                    format: args[0].parse()?,
                    path: PathBuf::from(args[1..].join(" ")),
                }
            }
            "separate" => Self::Separate,
            "status" => Self::Status,
            "quit" | "exit" => Self::Quit,
            other => {
                return Err(AudioError::validation(format!("Unknown command: {}", other)));
            }
        };
        Ok(command)
    }
}

/// What a command produced synchronously
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// Work was handed to a background thread
    Started,
    /// Parameters were updated; call `apply` to hear them
    Parameters(EffectParams),
    History { moved: bool },
    Reset(Option<CutBounds>),
    Done,
    Status(String),
    Quit,
}

pub trait CommandExecutor {
    fn execute(&mut self, command: Command) -> Result<CommandResult>;
}

impl CommandExecutor for Editor {
    fn execute(&mut self, command: Command) -> Result<CommandResult> {
        let params = self.session().params();
        let result = match command {
            Command::Load { path } => {
                self.load(path)?;
                CommandResult::Started
            }
            Command::Cut { start, end } => {
                self.cut(start, end)?;
                CommandResult::Started
            }
            Command::Gain { db } => {
                let params = params.with_volume(db);
                self.set_params(params)?;
                CommandResult::Parameters(params)
            }
            Command::Speed { factor } => {
                let params = params.with_speed(factor);
                self.set_params(params)?;
                CommandResult::Parameters(params)
            }
            Command::Pitch { semitones } => {
                let params = params.with_pitch(semitones);
                self.set_params(params)?;
                CommandResult::Parameters(params)
            }
            Command::Equalizer { bass, mid, treble } => {
                let params = params.with_eq(bass, mid, treble);
                self.set_params(params)?;
                CommandResult::Parameters(params)
            }
            Command::Apply => {
                self.apply()?;
                CommandResult::Started
            }
            Command::ToggleReverb => {
                self.toggle_reverb()?;
                CommandResult::Started
            }
            Command::ToggleEcho => {
                self.toggle_echo()?;
                CommandResult::Started
            }
            Command::ToggleFade => {
                self.toggle_fade()?;
                CommandResult::Started
            }
            Command::Undo => CommandResult::History {
                moved: self.undo()?,
            },
            Command::Redo => CommandResult::History {
                moved: self.redo()?,
            },
            Command::Reset => CommandResult::Reset(self.reset()),
            Command::Preview { start, end } => {
                self.preview_range(start, end)?;
                CommandResult::Done
            }
            Command::Seek { position } => {
                self.seek(position)?;
                CommandResult::Done
            }
            Command::Stop => {
                self.stop_preview()?;
                CommandResult::Done
            }
            Command::Export { format, path } => {
                self.export(format, path)?;
                CommandResult::Started
            }
            Command::Separate => {
                self.separate_vocals()?;
                CommandResult::Started
            }
            Command::Status => CommandResult::Status(self.status_line()),
            Command::Quit => {
                self.stop_preview()?;
                CommandResult::Quit
            }
        };
        Ok(result)
    }
}

impl Editor {
    /// One-line description of the session for status displays
    pub fn status_line(&self) -> String {
        let session = self.session();
        let Some(summary) = session.summary() else {
            return "No audio loaded".to_string();
        };
        let history = session.history();
        format!(
            "{} | Active: {:.2}s | Undo: {} | Redo: {} | Preview: {:?}{}",
            summary,
            session.duration(),
            history.undo_depth().saturating_sub(1),
            history.redo_depth(),
            self.preview().state(),
            if self.is_processing() { " | Processing" } else { "" }
        )
    }
}
