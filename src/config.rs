//! Engine configuration.
//!
//! Stored as JSON. A missing or unreadable file falls back to defaults so
//! the sequencer always starts.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

pub const MIN_TEMPO_BPM: f32 = 20.0;
pub const MAX_TEMPO_BPM: f32 = 400.0;
pub const MAX_STEPS: u16 = 64;
pub const MAX_TRACKS: u8 = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Frames per second of the process cycle.
    pub sample_rate: u32,
    /// Frames handled per process cycle.
    pub period_frames: u32,
    /// Quarter notes per minute.
    pub tempo_bpm: f32,
    /// Steps per pattern; each step is a sixteenth note.
    pub steps: u16,
    /// Rows in the pattern.
    pub tracks: u8,
    /// MIDI channel (0-15) stamped on emitted notes.
    pub midi_channel: u8,
    /// Note of track 0. Track n plays `base_note + n`.
    pub base_note: u8,
    /// Records in the process -> control ring.
    pub event_queue_len: usize,
    /// Records in the control -> process ring.
    pub command_queue_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            period_frames: 256,
            tempo_bpm: 120.0,
            steps: 16,
            tracks: 8,
            midi_channel: 9,
            base_note: 36,
            event_queue_len: 512,
            command_queue_len: 128,
        }
    }
}

impl EngineConfig {
    /// Load from disk. Returns defaults if the file doesn't exist or doesn't parse.
    pub fn load(path: &Path) -> Self {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) => {
                log::info!("No config at {} ({}), using defaults", path.display(), e);
                return Self::default();
            }
        };
        match serde_json::from_str(&data) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Ignoring malformed config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save to disk as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::InvalidConfig(msg));

        if self.sample_rate == 0 || self.period_frames == 0 {
            return fail("sample_rate and period_frames must be positive".into());
        }
        if !(MIN_TEMPO_BPM..=MAX_TEMPO_BPM).contains(&self.tempo_bpm) {
            return fail(format!(
                "tempo {} outside {}..={} BPM",
                self.tempo_bpm, MIN_TEMPO_BPM, MAX_TEMPO_BPM
            ));
        }
        if self.steps == 0 || self.steps > MAX_STEPS {
            return fail(format!("steps must be 1..={}", MAX_STEPS));
        }
        if self.tracks == 0 || self.tracks > MAX_TRACKS {
            return fail(format!("tracks must be 1..={}", MAX_TRACKS));
        }
        if self.midi_channel > 15 {
            return fail(format!("midi_channel {} above 15", self.midi_channel));
        }
        if self.base_note as u16 + self.tracks as u16 - 1 > 127 {
            return fail(format!(
                "base_note {} with {} tracks exceeds note 127",
                self.base_note, self.tracks
            ));
        }
        if self.event_queue_len == 0 || self.command_queue_len == 0 {
            return fail("queue lengths must be positive".into());
        }
        Ok(())
    }

    /// Wall-clock length of one process cycle.
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.period_frames as f64 / self.sample_rate as f64)
    }

    /// Frames per sixteenth-note step at `bpm`.
    pub fn frames_per_step(&self, bpm: f32) -> f64 {
        self.sample_rate as f64 * 60.0 / bpm as f64 / 4.0
    }
}
