//! The two lock-guarded state blocks shared between the caller, the worker and
//! the audio callback.
//!
//! `ControlState` sits behind the main lock and is touched by the caller API,
//! `tick()` and the worker. `AudioState` sits behind its own lock so the
//! real-time callback only ever contends with short scalar updates and the
//! worker's audio cache inserts.

use std::collections::HashMap;
use std::time::Instant;

use super::cache::CacheInfo;
use super::time::{RationalTime, TimeRange};
use super::types::{AudioData, CacheDirection, LoopMode, Playback, VideoData};
use crate::config::CacheOptions;

/// Worker output waiting to be copied into the observables by `tick()`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Published {
    pub video: Option<VideoData>,
    pub audio: Vec<AudioData>,
    pub cache_info: CacheInfo,
}

#[derive(Debug)]
pub(crate) struct ControlState {
    pub playback: Playback,
    pub speed: f64,
    pub loop_mode: LoopMode,
    pub current_time: RationalTime,
    pub in_out_range: TimeRange,
    pub video_layer: usize,
    pub cache_options: CacheOptions,
    pub cache_direction: CacheDirection,
    /// Seconds; positive values delay audio against video.
    pub audio_offset: f64,
    pub playback_start_time: RationalTime,
    pub playback_start_instant: Instant,
    /// Bumped whenever outstanding requests no longer match intent.
    pub request_epoch: u64,
    /// One-shot flag consumed by the worker.
    pub clear_cache: bool,
    pub published: Published,
}

impl ControlState {
    pub fn new(time_range: TimeRange, speed: f64, cache_options: CacheOptions, now: Instant) -> Self {
        Self {
            playback: Playback::Stop,
            speed,
            loop_mode: LoopMode::Loop,
            current_time: time_range.start,
            in_out_range: time_range,
            video_layer: 0,
            cache_options,
            cache_direction: CacheDirection::Forward,
            audio_offset: 0.0,
            playback_start_time: time_range.start,
            playback_start_instant: now,
            request_epoch: 0,
            clear_cache: false,
            published: Published::default(),
        }
    }

    /// Restarts the clock reference at the current time.
    pub fn reanchor(&mut self, now: Instant) {
        self.playback_start_time = self.current_time;
        self.playback_start_instant = now;
    }
}

#[derive(Debug)]
pub(crate) struct AudioState {
    pub volume: f32,
    pub mute: bool,
    pub mute_timeout: Instant,
    pub speed: f64,
    /// Whole-second bucket -> audio layers.
    pub cache: HashMap<i64, AudioData>,
    /// Set by transitions; consumed by the audio callback.
    pub reset: bool,
}

impl AudioState {
    pub fn new(speed: f64, now: Instant) -> Self {
        Self {
            volume: 1.0,
            mute: false,
            mute_timeout: now,
            speed,
            cache: HashMap::new(),
            reset: false,
        }
    }
}
