//! Effect parameter set
//!
//! The recipe the effects engine re-applies to the original buffer on every
//! apply. Snapshots in the history own a copy of it.

use super::audio::{AudioError, Result};
use serde::{Deserialize, Serialize};

/// Every user-adjustable effect setting
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectParams {
    pub volume_gain_db: f32,
    /// Playback rate; must be strictly positive
    pub speed_factor: f32,
    pub pitch_semitones: f32,
    pub reverb_enabled: bool,
    pub echo_enabled: bool,
    pub fade_enabled: bool,
    pub bass_gain_db: f32,
    pub mid_gain_db: f32,
    pub treble_gain_db: f32,
}

impl Default for EffectParams {
    fn default() -> Self {
        Self::neutral()
    }
}

impl EffectParams {
    /// The no-op parameter set
    pub const fn neutral() -> Self {
        Self {
            volume_gain_db: 0.0,
            speed_factor: 1.0,
            pitch_semitones: 0.0,
            reverb_enabled: false,
            echo_enabled: false,
            fade_enabled: false,
            bass_gain_db: 0.0,
            mid_gain_db: 0.0,
            treble_gain_db: 0.0,
        }
    }

    /// True when applying these parameters leaves the buffer untouched
    pub fn is_neutral(&self) -> bool {
        *self == Self::neutral()
    }

    pub fn has_eq(&self) -> bool {
        self.bass_gain_db != 0.0 || self.mid_gain_db != 0.0 || self.treble_gain_db != 0.0
    }

    pub fn validate(&self) -> Result<()> {
        let values = [
            self.volume_gain_db,
            self.speed_factor,
            self.pitch_semitones,
            self.bass_gain_db,
            self.mid_gain_db,
            self.treble_gain_db,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(AudioError::validation("Effect parameters must be finite"));
        }
        if self.speed_factor <= 0.0 {
            return Err(AudioError::validation(format!(
                "Speed factor must be positive, got {}",
                self.speed_factor
            )));
        }
        Ok(())
    }

    pub fn with_volume(mut self, gain_db: f32) -> Self {
        self.volume_gain_db = gain_db;
        self
    }

    pub fn with_speed(mut self, factor: f32) -> Self {
        self.speed_factor = factor;
        self
    }

    pub fn with_pitch(mut self, semitones: f32) -> Self {
        self.pitch_semitones = semitones;
        self
    }

    pub fn with_eq(mut self, bass_db: f32, mid_db: f32, treble_db: f32) -> Self {
        self.bass_gain_db = bass_db;
        self.mid_gain_db = mid_db;
        self.treble_gain_db = treble_db;
        self
    }

    pub fn toggled_reverb(mut self) -> Self {
        self.reverb_enabled = !self.reverb_enabled;
        self
    }

    pub fn toggled_echo(mut self) -> Self {
        self.echo_enabled = !self.echo_enabled;
        self
    }

    pub fn toggled_fade(mut self) -> Self {
        self.fade_enabled = !self.fade_enabled;
        self
    }
}
