//! Background worker: keeps the caches filled around the play head and
//! publishes what the caller thread should show next.
//!
//! One iteration:
//! 1. Snapshot the control state under the main lock
//! 2. Cancel outstanding requests when the request epoch moved
//! 3. Clear the caches when asked to (layer change)
//! 4. Reserve the window, request what is missing, ingest finished decodes
//! 5. Publish current video, the 3-second audio window and cache info

use log::{debug, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::cache::{Cache, WindowParams};
use super::requests::{Payload, RequestKind, RequestPipeline};
use super::state::{AudioState, ControlState};
use super::time::{RationalTime, TimeRange};
use super::types::{CacheDirection, IoInfo};
use crate::config::{CacheOptions, PlayerOptions};
use crate::core::io::DecodeService;
use crate::error::DecodeError;

#[derive(Debug, Clone, Copy)]
struct ControlSnapshot {
    current_time: RationalTime,
    in_out_range: TimeRange,
    video_layer: usize,
    cache_options: CacheOptions,
    cache_direction: CacheDirection,
    audio_offset: f64,
    request_epoch: u64,
    clear_cache: bool,
}

pub(crate) struct CacheWorker {
    control: Arc<Mutex<ControlState>>,
    cache: Cache,
    requests: RequestPipeline,
    time_range: TimeRange,
    has_video: bool,
    has_audio: bool,
    last_epoch: u64,
    last_layer: Option<usize>,
    /// Frame whose lookup already went into the cache stats.
    last_lookup: Option<i64>,
    diagnostics_interval: Duration,
    last_diagnostics: Instant,
}

impl CacheWorker {
    pub fn new(
        control: Arc<Mutex<ControlState>>,
        audio: Arc<Mutex<AudioState>>,
        decoder: Arc<dyn DecodeService>,
        time_range: TimeRange,
        io_info: &IoInfo,
        options: &PlayerOptions,
    ) -> Self {
        let rate = time_range.rate();
        let last_epoch = control.lock().unwrap_or_else(|e| e.into_inner()).request_epoch;
        Self {
            control,
            cache: Cache::new(rate, audio),
            requests: RequestPipeline::new(decoder, rate, options.request_count),
            time_range,
            has_video: io_info.has_video(),
            has_audio: io_info.audio().is_some(),
            last_epoch,
            last_layer: None,
            last_lookup: None,
            diagnostics_interval: options.diagnostics_interval(),
            last_diagnostics: Instant::now(),
        }
    }

    /// Runs `iterate` every `period` until `running` goes false.
    pub fn spawn(mut self, running: Arc<AtomicBool>, period: Duration) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("reelplay-cache-worker".to_string())
            .spawn(move || {
                trace!("Cache worker started");
                while running.load(Ordering::Acquire) {
                    self.iterate();
                    thread::sleep(period);
                }
                self.requests.cancel_all();
                trace!("Cache worker stopped");
            })
            .expect("Failed to spawn cache worker thread")
    }

    pub fn iterate(&mut self) {
        let snap = {
            let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
            let snap = ControlSnapshot {
                current_time: control.current_time,
                in_out_range: control.in_out_range,
                video_layer: control.video_layer,
                cache_options: control.cache_options,
                cache_direction: control.cache_direction,
                audio_offset: control.audio_offset,
                request_epoch: control.request_epoch,
                clear_cache: control.clear_cache,
            };
            control.clear_cache = false;
            snap
        };

        if snap.request_epoch != self.last_epoch {
            self.requests.cancel_all();
            self.last_epoch = snap.request_epoch;
        }
        if snap.clear_cache {
            debug!("Clearing caches");
            self.cache.clear();
        }
        if self.last_layer != Some(snap.video_layer) {
            self.requests.set_layer(snap.video_layer);
            self.last_layer = Some(snap.video_layer);
        }

        self.cache.reserve_window(&WindowParams {
            direction: snap.cache_direction,
            current_time: snap.current_time,
            read_ahead: snap.cache_options.read_ahead(),
            read_behind: snap.cache_options.read_behind(),
            in_out_range: snap.in_out_range,
            time_range: self.time_range,
            audio_offset: snap.audio_offset,
        });

        if self.has_video {
            for &frame in self.cache.video_window() {
                self.requests.ensure(RequestKind::Video, frame, &self.cache);
            }
        }
        if self.has_audio {
            for &seconds in self.cache.audio_window() {
                self.requests.ensure(RequestKind::Audio, seconds, &self.cache);
            }
        }
        self.ingest();
        self.publish(&snap);
        self.diagnostics(&snap);
    }

    fn ingest(&mut self) {
        for completed in self.requests.drain_completed() {
            match completed.result {
                Ok(Payload::Video(data)) => {
                    if !self.cache.put_video(completed.key, data) {
                        trace!("Dropped frame {} outside the window", completed.key);
                    }
                }
                Ok(Payload::Audio(data)) => {
                    if !self.cache.put_audio(completed.key, data) {
                        trace!("Dropped audio second {} outside the window", completed.key);
                    }
                }
                Err(DecodeError::Cancelled) => {
                    trace!("{:?} request {} cancelled", completed.kind, completed.key);
                }
                Err(e) => {
                    warn!("{:?} request {} failed: {}", completed.kind, completed.key, e);
                }
            }
        }
    }

    fn publish(&mut self, snap: &ControlSnapshot) {
        let rate = self.time_range.rate();
        let frame = snap.current_time.frame_at(rate);
        let video = if !self.time_range.contains(snap.current_time) {
            self.last_lookup = None;
            Some(None)
        } else if self.last_lookup == Some(frame) {
            self.cache.peek_video(frame).cloned().map(Some)
        } else {
            // Stats count one lookup per displayed frame
            self.last_lookup = Some(frame);
            self.cache.get_video(frame).cloned().map(Some)
        };
        let audio_center = (snap.current_time.to_seconds() - snap.audio_offset).floor() as i64;
        let audio = self.cache.audio_around(audio_center);
        let cache_info = self.cache.snapshot_info();

        let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        // A miss keeps the previous frame on screen
        if let Some(video) = video {
            control.published.video = video;
        }
        control.published.audio = audio;
        control.published.cache_info = cache_info;
    }

    fn diagnostics(&mut self, snap: &ControlSnapshot) {
        if self.last_diagnostics.elapsed() < self.diagnostics_interval {
            return;
        }
        self.last_diagnostics = Instant::now();
        let info = self.cache.snapshot_info();
        debug!(
            "Player diagnostics: time={:.3}s in/out=[{:.3}s, {:.3}s) video={:.1}% ({} frames) audio={}s \
             in-flight video={} audio={} issued={} failed={} hit rate={:.1}%",
            snap.current_time.to_seconds(),
            snap.in_out_range.start.to_seconds(),
            snap.in_out_range.end_exclusive().to_seconds(),
            info.video_percentage,
            self.cache.video_len(),
            self.cache.audio_len(),
            self.requests.in_flight(RequestKind::Video),
            self.requests.in_flight(RequestKind::Audio),
            self.requests.issued(),
            self.requests.failed(),
            self.cache.stats().hit_rate() * 100.0,
        );
    }

    #[cfg(test)]
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    #[cfg(test)]
    pub fn requests(&self) -> &RequestPipeline {
        &self.requests
    }
}
