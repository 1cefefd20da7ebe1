//! Window-retained video and audio caches.
//!
//! Video frames are keyed by integer frame index at the timeline rate; audio
//! is keyed by whole-second bucket. Both only ever hold entries inside the
//! live window computed by [`Cache::reserve_window`]: moving the window evicts,
//! and inserts outside it are refused.
//!
//! The video map belongs to the worker thread alone. The audio map lives in
//! [`AudioState`] so the audio callback can read it under the audio lock; the
//! worker keeps a private copy of the key set so bookkeeping never needs that
//! lock.

use log::trace;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::state::AudioState;
use super::time::{loop_range, to_ranges, RationalTime, TimeRange};
use super::types::{AudioData, CacheDirection, VideoData};

/// Cache hit/miss counters
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }
}

/// Observer-facing summary of what is cached, for cache-bar style displays.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CacheInfo {
    /// Cached video frames as a share of the live window, 0..=100.
    pub video_percentage: f32,
    pub video_ranges: Vec<TimeRange>,
    /// Ranges in seconds (rate 1).
    pub audio_ranges: Vec<TimeRange>,
}

/// Inputs of a window computation.
#[derive(Debug, Clone, Copy)]
pub struct WindowParams {
    pub direction: CacheDirection,
    pub current_time: RationalTime,
    pub read_ahead: RationalTime,
    pub read_behind: RationalTime,
    pub in_out_range: TimeRange,
    /// Full timeline extent; audio buckets are limited to it.
    pub time_range: TimeRange,
    pub audio_offset: f64,
}

pub struct Cache {
    rate: f64,
    video: HashMap<i64, VideoData>,
    audio: Arc<Mutex<AudioState>>,
    audio_keys: BTreeSet<i64>,
    /// Live window in request priority order.
    window_frames: Vec<i64>,
    window_frame_set: HashSet<i64>,
    window_seconds: Vec<i64>,
    window_second_set: HashSet<i64>,
    stats: CacheStats,
    info: CacheInfo,
    dirty: bool,
}

impl Cache {
    pub(crate) fn new(rate: f64, audio: Arc<Mutex<AudioState>>) -> Self {
        Self {
            rate,
            video: HashMap::new(),
            audio,
            audio_keys: BTreeSet::new(),
            window_frames: Vec::new(),
            window_frame_set: HashSet::new(),
            window_seconds: Vec::new(),
            window_second_set: HashSet::new(),
            stats: CacheStats::new(),
            info: CacheInfo::default(),
            dirty: false,
        }
    }

    /// Recomputes the live window and evicts everything outside it.
    ///
    /// The ahead side of the window starts at the current frame and runs in the
    /// cache direction for `read_ahead`; the behind side covers `read_behind`
    /// on the other side. Both are wrapped into the in/out range.
    pub fn reserve_window(&mut self, params: &WindowParams) {
        let rate = self.rate;
        let one = RationalTime::new(1.0, rate);
        let t = params.current_time.rescaled_to(rate).floor();
        let ahead = params.read_ahead.rescaled_to(rate).ceil();
        let behind = params.read_behind.rescaled_to(rate).ceil();
        let range = params.in_out_range.rescaled_to(rate);

        let (ahead_range, behind_range, ascending) = match params.direction {
            CacheDirection::Forward => (
                TimeRange::new(t, ahead + one),
                TimeRange::new(t - behind, behind),
                true,
            ),
            CacheDirection::Reverse => (
                TimeRange::new(t - ahead, ahead + one),
                TimeRange::new(t + one, behind),
                false,
            ),
        };

        let mut frames = Vec::new();
        let mut frame_set = HashSet::new();
        if range.duration.value > 0.0 {
            push_frames(&mut frames, &mut frame_set, &loop_range(&ahead_range, &range), ascending);
            if behind_range.duration.value > 0.0 {
                push_frames(&mut frames, &mut frame_set, &loop_range(&behind_range, &range), !ascending);
            }
        }

        let first_second = params.time_range.start.whole_seconds();
        let last_second = params.time_range.end_inclusive().whole_seconds();
        let mut seconds = Vec::new();
        let mut second_set = HashSet::new();
        for &frame in &frames {
            let s = (frame as f64 / rate - params.audio_offset).floor() as i64;
            if (first_second..=last_second).contains(&s) && second_set.insert(s) {
                seconds.push(s);
            }
        }

        let video_before = self.video.len();
        self.video.retain(|frame, _| frame_set.contains(frame));

        let stale_audio: Vec<i64> = self
            .audio_keys
            .iter()
            .filter(|s| !second_set.contains(s))
            .copied()
            .collect();
        if !stale_audio.is_empty() {
            let mut audio = self.audio.lock().unwrap_or_else(|e| e.into_inner());
            for s in &stale_audio {
                audio.cache.remove(s);
                self.audio_keys.remove(s);
            }
        }

        let evicted = video_before - self.video.len() + stale_audio.len();
        if evicted > 0 {
            trace!("Cache evicted {} entries", evicted);
        }
        if evicted > 0 || frames != self.window_frames || seconds != self.window_seconds {
            self.dirty = true;
        }

        self.window_frames = frames;
        self.window_frame_set = frame_set;
        self.window_seconds = seconds;
        self.window_second_set = second_set;
    }

    /// Live video window, nearest-first in the cache direction.
    pub fn video_window(&self) -> &[i64] {
        &self.window_frames
    }

    /// Live audio buckets, nearest-first in the cache direction.
    pub fn audio_window(&self) -> &[i64] {
        &self.window_seconds
    }

    pub fn in_video_window(&self, frame: i64) -> bool {
        self.window_frame_set.contains(&frame)
    }

    pub fn in_audio_window(&self, seconds: i64) -> bool {
        self.window_second_set.contains(&seconds)
    }

    pub fn contains_video(&self, frame: i64) -> bool {
        self.video.contains_key(&frame)
    }

    pub fn contains_audio(&self, seconds: i64) -> bool {
        self.audio_keys.contains(&seconds)
    }

    pub fn get_video(&self, frame: i64) -> Option<&VideoData> {
        let result = self.video.get(&frame);
        if result.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        result
    }

    /// Lookup that leaves the hit/miss counts alone.
    pub fn peek_video(&self, frame: i64) -> Option<&VideoData> {
        self.video.get(&frame)
    }

    /// Stores a frame. Returns false if `frame` is outside the live window.
    pub fn put_video(&mut self, frame: i64, data: VideoData) -> bool {
        if !self.in_video_window(frame) {
            return false;
        }
        self.video.insert(frame, data);
        self.dirty = true;
        true
    }

    /// Stores a second of audio. Returns false if `seconds` is outside the live window.
    pub fn put_audio(&mut self, seconds: i64, data: AudioData) -> bool {
        if !self.in_audio_window(seconds) {
            return false;
        }
        self.audio
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cache
            .insert(seconds, data);
        self.audio_keys.insert(seconds);
        self.dirty = true;
        true
    }

    /// The cached buckets among `center - 1..=center + 1`.
    pub fn audio_around(&self, center: i64) -> Vec<AudioData> {
        let audio = self.audio.lock().unwrap_or_else(|e| e.into_inner());
        (center - 1..=center + 1)
            .filter_map(|s| audio.cache.get(&s).cloned())
            .collect()
    }

    pub fn snapshot_info(&mut self) -> CacheInfo {
        if self.dirty {
            self.info = self.compute_info();
            self.dirty = false;
        }
        self.info.clone()
    }

    fn compute_info(&self) -> CacheInfo {
        let mut frames: Vec<i64> = self.video.keys().copied().collect();
        frames.sort_unstable();
        let frame_times: Vec<RationalTime> = frames
            .iter()
            .map(|&f| RationalTime::new(f as f64, self.rate))
            .collect();
        let second_times: Vec<RationalTime> = self
            .audio_keys
            .iter()
            .map(|&s| RationalTime::new(s as f64, 1.0))
            .collect();
        let video_percentage = if self.window_frames.is_empty() {
            0.0
        } else {
            (self.video.len() as f64 / self.window_frames.len() as f64 * 100.0) as f32
        };
        CacheInfo {
            video_percentage,
            video_ranges: to_ranges(&frame_times),
            audio_ranges: to_ranges(&second_times),
        }
    }

    /// Drops all entries, video and audio.
    pub fn clear(&mut self) {
        self.video.clear();
        self.audio
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cache
            .clear();
        self.audio_keys.clear();
        self.info = CacheInfo::default();
        self.dirty = false;
    }

    pub fn video_len(&self) -> usize {
        self.video.len()
    }

    pub fn audio_len(&self) -> usize {
        self.audio_keys.len()
    }

    /// Cached frame indices, unordered.
    pub fn video_frames(&self) -> impl Iterator<Item = i64> + '_ {
        self.video.keys().copied()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

fn push_frames(out: &mut Vec<i64>, seen: &mut HashSet<i64>, pieces: &[TimeRange], ascending: bool) {
    let mut push = |frame: i64| {
        if seen.insert(frame) {
            out.push(frame);
        }
    };
    if ascending {
        for piece in pieces {
            let (start, end) = piece_bounds(piece);
            (start..end).for_each(&mut push);
        }
    } else {
        for piece in pieces.iter().rev() {
            let (start, end) = piece_bounds(piece);
            (start..end).rev().for_each(&mut push);
        }
    }
}

fn piece_bounds(piece: &TimeRange) -> (i64, i64) {
    let start = piece.start.value.round() as i64;
    (start, start + piece.duration.value.round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const RATE: f64 = 24.0;

    fn cache() -> Cache {
        Cache::new(RATE, Arc::new(Mutex::new(AudioState::new(RATE, Instant::now()))))
    }

    fn frames(start: f64, duration: f64) -> TimeRange {
        TimeRange::new(RationalTime::new(start, RATE), RationalTime::new(duration, RATE))
    }

    fn params(direction: CacheDirection, frame: f64, in_out: TimeRange) -> WindowParams {
        WindowParams {
            direction,
            current_time: RationalTime::new(frame, RATE),
            read_ahead: RationalTime::from_seconds(1.0),
            read_behind: RationalTime::from_seconds(0.5),
            in_out_range: in_out,
            time_range: frames(0.0, 240.0),
            audio_offset: 0.0,
        }
    }

    fn video(frame: i64) -> VideoData {
        VideoData {
            time: RationalTime::new(frame as f64, RATE),
            layers: Vec::new(),
        }
    }

    #[test]
    fn test_forward_window_starts_at_current_frame() {
        let mut cache = cache();
        cache.reserve_window(&params(CacheDirection::Forward, 100.0, frames(0.0, 240.0)));
        let window = cache.video_window();
        assert_eq!(window.len(), 25 + 12);
        assert_eq!(&window[..3], &[100, 101, 102]);
        assert_eq!(window[24], 124);
        // Behind side, nearest first
        assert_eq!(&window[25..27], &[99, 98]);
        assert_eq!(*window.last().unwrap(), 88);
    }

    #[test]
    fn test_reverse_window_runs_backwards() {
        let mut cache = cache();
        cache.reserve_window(&params(CacheDirection::Reverse, 100.0, frames(0.0, 240.0)));
        let window = cache.video_window();
        assert_eq!(&window[..3], &[100, 99, 98]);
        assert_eq!(window[24], 76);
        assert_eq!(&window[25..27], &[101, 102]);
        assert_eq!(*window.last().unwrap(), 112);
    }

    #[test]
    fn test_window_wraps_at_out_point() {
        let mut cache = cache();
        cache.reserve_window(&params(CacheDirection::Forward, 235.0, frames(0.0, 240.0)));
        let window = cache.video_window();
        assert_eq!(&window[..6], &[235, 236, 237, 238, 239, 0]);
        assert!(cache.in_video_window(19));
        assert!(!cache.in_video_window(20));
    }

    #[test]
    fn test_window_larger_than_range_is_whole_range() {
        let mut cache = cache();
        cache.reserve_window(&params(CacheDirection::Forward, 50.0, frames(48.0, 10.0)));
        assert_eq!(cache.video_window().len(), 10);
        assert!((48..58).all(|f| cache.in_video_window(f)));
    }

    #[test]
    fn test_put_outside_window_is_refused() {
        let mut cache = cache();
        cache.reserve_window(&params(CacheDirection::Forward, 100.0, frames(0.0, 240.0)));
        assert!(cache.put_video(110, video(110)));
        assert!(!cache.put_video(200, video(200)));
        assert!(cache.contains_video(110));
        assert!(!cache.contains_video(200));
    }

    #[test]
    fn test_moving_window_evicts() {
        let mut cache = cache();
        let in_out = frames(0.0, 240.0);
        cache.reserve_window(&params(CacheDirection::Forward, 100.0, in_out));
        for f in 100..=124 {
            assert!(cache.put_video(f, video(f)));
        }
        cache.reserve_window(&params(CacheDirection::Forward, 120.0, in_out));
        assert!(!cache.contains_video(100));
        assert!(cache.contains_video(110));
        assert!(cache.contains_video(124));
    }

    #[test]
    fn test_cached_frames_stay_inside_window() {
        let mut cache = cache();
        let in_out = frames(48.0, 144.0);
        for step in 0..40 {
            let frame = 48.0 + (step * 17 % 144) as f64;
            let direction = if step % 3 == 0 { CacheDirection::Reverse } else { CacheDirection::Forward };
            cache.reserve_window(&params(direction, frame, in_out));
            let batch: Vec<i64> = cache.video_window().iter().take(10).copied().collect();
            for f in batch {
                cache.put_video(f, video(f));
            }
            let window: HashSet<i64> = cache.video_window().iter().copied().collect();
            assert!(cache.video_frames().all(|f| window.contains(&f)));
            assert!(cache.video_frames().all(|f| (48..192).contains(&f)));
        }
    }

    #[test]
    fn test_audio_buckets_follow_window_and_offset() {
        let mut cache = cache();
        cache.reserve_window(&params(CacheDirection::Forward, 100.0, frames(0.0, 240.0)));
        // Frames 88..=124 span 3.67s..5.17s
        assert_eq!(cache.audio_window(), &[4, 5, 3]);

        let mut shifted = params(CacheDirection::Forward, 100.0, frames(0.0, 240.0));
        shifted.audio_offset = 1.0;
        cache.reserve_window(&shifted);
        assert_eq!(cache.audio_window(), &[3, 4, 2]);

        // Buckets before the timeline start are dropped
        let mut early = params(CacheDirection::Forward, 0.0, frames(0.0, 240.0));
        early.audio_offset = 0.5;
        cache.reserve_window(&early);
        assert!(cache.audio_window().iter().all(|&s| s >= 0));
    }

    #[test]
    fn test_audio_put_is_visible_to_audio_state() {
        let audio = Arc::new(Mutex::new(AudioState::new(RATE, Instant::now())));
        let mut cache = Cache::new(RATE, Arc::clone(&audio));
        cache.reserve_window(&params(CacheDirection::Forward, 100.0, frames(0.0, 240.0)));
        assert!(cache.put_audio(4, AudioData { seconds: 4, layers: Vec::new() }));
        assert!(!cache.put_audio(9, AudioData { seconds: 9, layers: Vec::new() }));
        assert!(audio.lock().unwrap().cache.contains_key(&4));
        assert_eq!(cache.audio_around(5).len(), 1);

        cache.reserve_window(&params(CacheDirection::Forward, 200.0, frames(0.0, 240.0)));
        assert!(audio.lock().unwrap().cache.is_empty());
    }

    #[test]
    fn test_snapshot_info_coalesces_ranges() {
        let mut cache = cache();
        cache.reserve_window(&params(CacheDirection::Forward, 100.0, frames(0.0, 240.0)));
        for f in [100, 101, 102, 110, 111] {
            cache.put_video(f, video(f));
        }
        cache.put_audio(4, AudioData { seconds: 4, layers: Vec::new() });
        let info = cache.snapshot_info();
        assert_eq!(info.video_ranges, vec![frames(100.0, 3.0), frames(110.0, 2.0)]);
        assert_eq!(
            info.audio_ranges,
            vec![TimeRange::new(RationalTime::new(4.0, 1.0), RationalTime::new(1.0, 1.0))]
        );
        assert!((info.video_percentage - 5.0 / 37.0 * 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_clear_resets_everything() {
        let audio = Arc::new(Mutex::new(AudioState::new(RATE, Instant::now())));
        let mut cache = Cache::new(RATE, Arc::clone(&audio));
        cache.reserve_window(&params(CacheDirection::Forward, 100.0, frames(0.0, 240.0)));
        cache.put_video(100, video(100));
        cache.put_audio(4, AudioData { seconds: 4, layers: Vec::new() });
        cache.snapshot_info();
        cache.clear();
        assert_eq!(cache.video_len(), 0);
        assert_eq!(cache.audio_len(), 0);
        assert!(audio.lock().unwrap().cache.is_empty());
        assert_eq!(cache.snapshot_info(), CacheInfo::default());
    }

    #[test]
    fn test_stats_count_lookups() {
        let mut cache = cache();
        cache.reserve_window(&params(CacheDirection::Forward, 100.0, frames(0.0, 240.0)));
        cache.put_video(100, video(100));
        assert!(cache.get_video(100).is_some());
        assert!(cache.get_video(101).is_none());
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.stats().hit_rate(), 0.5);
    }

    #[test]
    fn test_peek_does_not_count() {
        let mut cache = cache();
        cache.reserve_window(&params(CacheDirection::Forward, 100.0, frames(0.0, 240.0)));
        cache.put_video(100, video(100));
        assert!(cache.peek_video(100).is_some());
        assert!(cache.peek_video(101).is_none());
        assert_eq!(cache.stats().hits() + cache.stats().misses(), 0);
    }
}
