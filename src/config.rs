//! Player options, persisted as JSON.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::time::RationalTime;

/// Clock source for the play head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimerMode {
    /// Wall clock scaled by speed.
    System,
    /// The audio stream's sample counter, when a stream is running at nominal speed.
    #[default]
    Audio,
}

/// Read-ahead/read-behind window around the play head, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    pub read_ahead_s: f64,
    pub read_behind_s: f64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            read_ahead_s: 4.0,
            read_behind_s: 0.5,
        }
    }
}

impl CacheOptions {
    pub fn read_ahead(&self) -> RationalTime {
        RationalTime::from_seconds(self.read_ahead_s.max(0.0))
    }

    pub fn read_behind(&self) -> RationalTime {
        RationalTime::from_seconds(self.read_behind_s.max(0.0))
    }
}

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerOptions {
    pub cache: CacheOptions,
    pub timer_mode: TimerMode,
    /// Requested device buffer size
    pub audio_buffer_frames: u32,
    /// Forced silence after a playback transition
    pub mute_timeout_ms: u64,
    /// Worker loop period
    pub sleep_timeout_ms: u64,
    /// Max outstanding decode requests per kind (video, audio)
    pub request_count: usize,
    pub diagnostics_interval_s: f64,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            cache: CacheOptions::default(),
            timer_mode: TimerMode::default(),
            audio_buffer_frames: 512,
            mute_timeout_ms: 500,
            sleep_timeout_ms: 5,
            request_count: 16,
            diagnostics_interval_s: 10.0,
        }
    }
}

impl PlayerOptions {
    pub fn mute_timeout(&self) -> Duration {
        Duration::from_millis(self.mute_timeout_ms)
    }

    pub fn sleep_timeout(&self) -> Duration {
        Duration::from_millis(self.sleep_timeout_ms.max(1))
    }

    pub fn diagnostics_interval(&self) -> Duration {
        Duration::from_secs_f64(self.diagnostics_interval_s.max(0.1))
    }

    /// Loads options from `path`, returning defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No options file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read options: {}", path.display()))?;
        let options: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse options: {}", path.display()))?;
        info!("Loaded options from {}", path.display());
        Ok(options)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }
        let text = serde_json::to_string_pretty(self).context("Failed to serialize options")?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write options: {}", path.display()))?;
        debug!("Saved options to {}", path.display());
        Ok(())
    }
}
