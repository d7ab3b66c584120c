//! Source separation through an external program
//!
//! The prepared 44.1 kHz stereo buffer is written to a scratch directory,
//! the configured program is run on it, and the two stems it leaves behind
//! are decoded back. The scratch directory is removed on every path.

use crate::codec::{decode_file, write_wav_pcm16};
use cadenza_core::domain::analysis::{SourceSeparator, StemPair};
use cadenza_core::domain::audio::{AudioError, Result, SampleBuffer};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, instrument};

const INPUT_FILE: &str = "mixture.wav";

/// File names a two-stem model produces
pub const VOCAL_STEM: &str = "vocals.wav";
pub const ACCOMPANIMENT_STEM: &str = "accompaniment.wav";

#[derive(Debug, Clone)]
pub struct ExternalSeparator {
    program: PathBuf,
    args: Vec<String>,
}

impl ExternalSeparator {
    /// `args` may contain `{input}` and `{output}` placeholders
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn expand_args(&self, input: &Path, output: &Path) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
            })
            .collect()
    }
}

/// Depth-first search for `name` under `dir`
fn find_file(dir: &Path, name: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if path.file_name().is_some_and(|n| n == name) {
            return Some(path);
        }
    }
    subdirs.iter().find_map(|d| find_file(d, name))
}

fn load_stem(dir: &Path, name: &str) -> Result<SampleBuffer> {
    let path = find_file(dir, name)
        .ok_or_else(|| AudioError::Job(format!("Separator produced no {}", name)))?;
    decode_file(&path)
        .map(|decoded| decoded.buffer)
        .map_err(|e| AudioError::Job(e.to_string()))
}

impl SourceSeparator for ExternalSeparator {
    #[instrument(skip(self, buffer), fields(program = %self.program.display()))]
    fn separate(&self, buffer: &SampleBuffer) -> Result<StemPair> {
        let scratch = tempfile::Builder::new()
            .prefix("cadenza_separation_")
            .tempdir()
            .map_err(|e| AudioError::Resource(format!("Cannot create scratch directory: {}", e)))?;
        let input = scratch.path().join(INPUT_FILE);
        let output = scratch.path().join("stems");
        write_wav_pcm16(buffer, &input)?;

        let args = self.expand_args(&input, &output);
        debug!(?args, "Running separator");
        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| AudioError::Job(format!("Cannot run {}: {}", self.program.display(), e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(AudioError::Job(format!(
                "Separator failed ({}): {}",
                result.status,
                stderr.trim()
            )));
        }

        let stems = StemPair {
            vocal: load_stem(&output, VOCAL_STEM)?,
            instrumental: load_stem(&output, ACCOMPANIMENT_STEM)?,
        };
        info!(frames = stems.vocal.frames(), "Separation finished");
        Ok(stems)
    }

    fn name(&self) -> &'static str {
        "external"
    }
}
