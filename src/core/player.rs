//! Playback state machine and public API.
//!
//! A [`Player`] is bound to one [`Timeline`] for its whole life. It owns:
//! - the control state (main lock) and the audio state (audio lock)
//! - a background [`CacheWorker`] thread, joined on drop
//! - an optional real-time audio stream driving an [`AudioEngine`]
//!
//! The caller drives the play head with [`Player::tick`], typically once per
//! displayed frame; every observable value is updated there or directly by
//! the API call that changed it, with change-only notification.
//!
//! A player can follow another one ([`Player::set_external_time`]). The link
//! is two subscriptions on the leader holding weak references to the
//! follower, so neither player keeps the other alive.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use uuid::Uuid;

use super::cache::CacheInfo;
use super::cache_worker::CacheWorker;
use super::clock::{Boundary, ClockInputs, MonotonicClock, PlaybackClock, SystemClock};
use super::io::{DecodeService, Timeline};
use super::observer::{Observable, Subscription};
use super::state::{AudioState, ControlState};
use super::time::{external_time, loop_time, RationalTime, TimeRange};
use super::types::{AudioData, IoInfo, LoopMode, Playback, TimeAction, VideoData};
use crate::audio::{AudioDevice, AudioEngine, AudioStream, StreamClock};
use crate::config::{CacheOptions, PlayerOptions};
use crate::error::PlayerError;

/// Collaborators a player is created with besides its timeline and decoder.
pub struct PlayerContext {
    pub clock: Arc<dyn MonotonicClock>,
    /// `None` plays without sound.
    pub audio_device: Option<Box<dyn AudioDevice>>,
}

impl Default for PlayerContext {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            audio_device: None,
        }
    }
}

/// Observable player state, for UI and render collaborators.
pub struct PlayerObservers {
    pub playback: Observable<Playback>,
    pub loop_mode: Observable<LoopMode>,
    pub speed: Observable<f64>,
    pub current_time: Observable<RationalTime>,
    pub in_out_range: Observable<TimeRange>,
    pub video_layer: Observable<usize>,
    pub current_video: Observable<Option<VideoData>>,
    pub current_audio: Observable<Vec<AudioData>>,
    pub cache_options: Observable<CacheOptions>,
    pub cache_info: Observable<CacheInfo>,
    pub volume: Observable<f32>,
    pub mute: Observable<bool>,
    pub audio_offset: Observable<f64>,
}

struct Inner {
    time_range: TimeRange,
    options: PlayerOptions,
    clock: Arc<dyn MonotonicClock>,
    playback_clock: PlaybackClock,
    control: Arc<Mutex<ControlState>>,
    audio: Arc<Mutex<AudioState>>,
    stream_clock: Option<StreamClock>,
    following: AtomicBool,
    observers: PlayerObservers,
}

struct ExternalLink {
    leader: Uuid,
    _subscriptions: Vec<Subscription>,
}

pub struct Player {
    id: Uuid,
    timeline: Arc<dyn Timeline>,
    io_info: IoInfo,
    inner: Arc<Inner>,
    external: Mutex<Option<ExternalLink>>,
    audio_stream: Option<Box<dyn AudioStream>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Player {
    pub fn new(
        timeline: Arc<dyn Timeline>,
        decoder: Arc<dyn DecodeService>,
        options: PlayerOptions,
        context: PlayerContext,
    ) -> Result<Self, PlayerError> {
        let time_range = timeline.time_range();
        if !time_range.is_valid() || !(time_range.duration.value > 0.0) {
            return Err(PlayerError::InvalidTimeRange(format!("{:?}", time_range)));
        }
        validate_options(&options)?;

        let time_range = time_range.rescaled_to(time_range.rate());
        let rate = time_range.rate();
        let io_info = timeline.io_info();
        let clock = context.clock;
        let now = clock.now();

        let control = Arc::new(Mutex::new(ControlState::new(time_range, rate, options.cache, now)));
        let audio = Arc::new(Mutex::new(AudioState::new(rate, now)));

        let audio_stream = match (io_info.audio(), context.audio_device) {
            (Some(input), Some(device)) => open_audio(
                device.as_ref(),
                input,
                &options,
                Arc::clone(&control),
                Arc::clone(&audio),
                Arc::clone(&clock),
                rate,
            ),
            _ => None,
        };
        let stream_clock = audio_stream.as_ref().map(|s| s.clock().clone());

        let observers = PlayerObservers {
            playback: Observable::new(Playback::Stop),
            loop_mode: Observable::new(LoopMode::Loop),
            speed: Observable::new(rate),
            current_time: Observable::new(time_range.start),
            in_out_range: Observable::new(time_range),
            video_layer: Observable::new(0),
            current_video: Observable::new(None),
            current_audio: Observable::new(Vec::new()),
            cache_options: Observable::new(options.cache),
            cache_info: Observable::new(CacheInfo::default()),
            volume: Observable::new(1.0),
            mute: Observable::new(false),
            audio_offset: Observable::new(0.0),
        };

        let running = Arc::new(AtomicBool::new(true));
        let worker = CacheWorker::new(
            Arc::clone(&control),
            Arc::clone(&audio),
            decoder,
            time_range,
            &io_info,
            &options,
        )
        .spawn(Arc::clone(&running), options.sleep_timeout());

        let id = Uuid::new_v4();
        info!(
            "Player {} created: range=[{:.3}s, {:.3}s) @ {} fps, video layers={}, audio={}",
            id,
            time_range.start.to_seconds(),
            time_range.end_exclusive().to_seconds(),
            rate,
            io_info.video.len(),
            if stream_clock.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            id,
            timeline,
            io_info,
            inner: Arc::new(Inner {
                time_range,
                playback_clock: PlaybackClock::new(options.timer_mode, rate),
                options,
                clock,
                control,
                audio,
                stream_clock,
                following: AtomicBool::new(false),
                observers,
            }),
            external: Mutex::new(None),
            audio_stream,
            running,
            worker: Some(worker),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timeline(&self) -> &Arc<dyn Timeline> {
        &self.timeline
    }

    pub fn time_range(&self) -> TimeRange {
        self.inner.time_range
    }

    pub fn io_info(&self) -> &IoInfo {
        &self.io_info
    }

    pub fn options(&self) -> &PlayerOptions {
        &self.inner.options
    }

    pub fn observers(&self) -> &PlayerObservers {
        &self.inner.observers
    }

    pub fn playback(&self) -> Playback {
        self.inner.observers.playback.get()
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.inner.observers.loop_mode.get()
    }

    pub fn speed(&self) -> f64 {
        self.inner.observers.speed.get()
    }

    pub fn current_time(&self) -> RationalTime {
        self.inner.observers.current_time.get()
    }

    pub fn in_out_range(&self) -> TimeRange {
        self.inner.observers.in_out_range.get()
    }

    pub fn current_video(&self) -> Option<VideoData> {
        self.inner.observers.current_video.get()
    }

    pub fn cache_info(&self) -> CacheInfo {
        self.inner.observers.cache_info.get()
    }

    pub fn has_audio_stream(&self) -> bool {
        self.inner.stream_clock.as_ref().is_some_and(|c| c.is_running())
    }

    /// Requests a direction. Applies the Once restart and PingPong bounce
    /// rules; ignored while following another player.
    pub fn set_playback(&self, value: Playback) {
        self.inner.set_playback(value);
    }

    /// Moves the play head. Returns false when the (floored, looped) time is
    /// already current.
    pub fn seek(&self, time: RationalTime) -> bool {
        self.inner.seek(time)
    }

    pub fn set_loop(&self, value: LoopMode) {
        {
            let mut control = self.inner.control();
            if control.loop_mode == value {
                return;
            }
            control.loop_mode = value;
        }
        self.inner.observers.loop_mode.set_if_changed(value);
    }

    /// Playback rate in frames per second; the timeline rate plays in real time.
    pub fn set_speed(&self, speed: f64) {
        if !(speed.is_finite() && speed > 0.0) {
            warn!("Ignoring invalid speed {}", speed);
            return;
        }
        let now = self.inner.clock.now();
        let playing = {
            let mut control = self.inner.control();
            if control.speed == speed {
                return;
            }
            control.speed = speed;
            let playing = control.playback != Playback::Stop;
            if playing {
                control.reanchor(now);
            }
            playing
        };
        self.inner.audio().speed = speed;
        self.inner.observers.speed.set_if_changed(speed);
        if playing {
            self.inner.reset_audio(false);
        }
    }

    /// Sets the loop range, clamped to the timeline.
    pub fn set_in_out_range(&self, range: TimeRange) {
        self.inner.set_in_out_range(range);
    }

    pub fn set_in_point(&self) {
        let (current, range) = self.inner.time_and_in_out();
        self.inner
            .set_in_out_range(TimeRange::from_start_end_exclusive(current, range.end_exclusive()));
    }

    pub fn set_out_point(&self) {
        let (current, range) = self.inner.time_and_in_out();
        self.inner
            .set_in_out_range(TimeRange::from_start_end_inclusive(range.start, current));
    }

    pub fn reset_in_out_points(&self) {
        self.inner.set_in_out_range(self.inner.time_range);
    }

    /// Selects the video layer to decode. Cached frames belong to the old
    /// layer and are dropped.
    pub fn set_video_layer(&self, layer: usize) {
        {
            let mut control = self.inner.control();
            if control.video_layer == layer {
                return;
            }
            control.video_layer = layer;
            control.clear_cache = true;
            control.request_epoch += 1;
        }
        self.inner.observers.video_layer.set_if_changed(layer);
    }

    pub fn set_cache_options(&self, options: CacheOptions) {
        {
            let mut control = self.inner.control();
            if control.cache_options == options {
                return;
            }
            control.cache_options = options;
        }
        self.inner.observers.cache_options.set_if_changed(options);
    }

    /// Audio/video sync skew in seconds.
    pub fn set_audio_offset(&self, offset: f64) {
        if !offset.is_finite() {
            return;
        }
        let now = self.inner.clock.now();
        let playing = {
            let mut control = self.inner.control();
            if control.audio_offset == offset {
                return;
            }
            control.audio_offset = offset;
            let playing = control.playback != Playback::Stop;
            if playing {
                control.reanchor(now);
            }
            playing
        };
        self.inner.observers.audio_offset.set_if_changed(offset);
        if playing {
            self.inner.reset_audio(false);
        }
    }

    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.inner.audio().volume = volume;
        self.inner.observers.volume.set_if_changed(volume);
    }

    pub fn set_mute(&self, mute: bool) {
        self.inner.audio().mute = mute;
        self.inner.observers.mute.set_if_changed(mute);
    }

    pub fn frame_next(&self) {
        self.inner.set_playback(Playback::Stop);
        let current = self.current_time();
        self.seek(current + RationalTime::new(1.0, current.rate));
    }

    pub fn frame_prev(&self) {
        self.inner.set_playback(Playback::Stop);
        let current = self.current_time();
        self.seek(current - RationalTime::new(1.0, current.rate));
    }

    pub fn time_action(&self, action: TimeAction) {
        match action {
            TimeAction::Start => {
                self.inner.set_playback(Playback::Stop);
                self.seek(self.in_out_range().start);
            }
            TimeAction::End => {
                self.inner.set_playback(Playback::Stop);
                self.seek(self.in_out_range().end_inclusive());
            }
            TimeAction::FramePrev => self.frame_prev(),
            TimeAction::FrameNext => self.frame_next(),
        }
    }

    /// Follows `leader`'s playback and time, mapped onto this timeline by
    /// start offset. `None` detaches and resumes the local clock from the
    /// current time.
    pub fn set_external_time(&self, leader: Option<&Player>) {
        let mut link = self.external.lock().unwrap_or_else(|e| e.into_inner());
        *link = None;

        let Some(leader) = leader else {
            if self.inner.following.swap(false, Ordering::AcqRel) {
                let now = self.inner.clock.now();
                let playing = {
                    let mut control = self.inner.control();
                    control.reanchor(now);
                    control.playback != Playback::Stop
                };
                // The stream counter ran since the last mirrored transition
                if playing {
                    self.inner.reset_audio(false);
                }
                debug!("Player {} detached from external time", self.id);
            }
            return;
        };
        if Arc::ptr_eq(&self.inner, &leader.inner) {
            warn!("Player {} cannot follow itself", self.id);
            self.inner.following.store(false, Ordering::Release);
            return;
        }

        self.inner.following.store(true, Ordering::Release);
        let leader_range = leader.inner.time_range;
        let weak = Arc::downgrade(&self.inner);
        let playback_sub = leader.inner.observers.playback.observe({
            let weak = weak.clone();
            move |playback| {
                if let Some(me) = weak.upgrade() {
                    me.apply_playback(*playback);
                }
            }
        });
        let time_sub = leader.inner.observers.current_time.observe(move |time| {
            if let Some(me) = weak.upgrade() {
                let mapped = external_time(*time, &leader_range, &me.time_range);
                me.mirror_time(mapped);
            }
        });
        *link = Some(ExternalLink {
            leader: leader.id,
            _subscriptions: vec![playback_sub, time_sub],
        });
        debug!("Player {} following {}", self.id, leader.id);
    }

    pub fn is_following(&self) -> bool {
        self.inner.following.load(Ordering::Acquire)
    }

    /// Id of the player being followed, if any.
    pub fn leader(&self) -> Option<Uuid> {
        self.external
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|l| l.leader)
    }

    /// Advances the play head and publishes the worker's output. Call once
    /// per displayed frame.
    pub fn tick(&self) {
        if !self.is_following() {
            self.inner.advance_clock();
        }
        let published = self.inner.control().published.clone();
        let observers = &self.inner.observers;
        observers.current_video.set_if_changed(published.video);
        observers.current_audio.set_if_changed(published.audio);
        observers.cache_info.set_if_changed(published.cache_info);
    }

    #[cfg(test)]
    fn request_epoch(&self) -> u64 {
        self.inner.control().request_epoch
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.external
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(mut stream) = self.audio_stream.take() {
            stream.close();
        }
        debug!("Player {} dropped", self.id);
    }
}

impl Inner {
    fn control(&self) -> MutexGuard<'_, ControlState> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn audio(&self) -> MutexGuard<'_, AudioState> {
        self.audio.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn time_and_in_out(&self) -> (RationalTime, TimeRange) {
        let control = self.control();
        (control.current_time, control.in_out_range)
    }

    /// Flushes the audio path; `mute` also arms the mute timeout.
    fn reset_audio(&self, mute: bool) {
        {
            let mut audio = self.audio();
            audio.reset = true;
            if mute {
                audio.mute_timeout = self.clock.now() + self.options.mute_timeout();
            }
        }
        if let Some(clock) = &self.stream_clock {
            clock.reset_elapsed();
        }
    }

    fn set_playback(&self, requested: Playback) {
        if self.following.load(Ordering::Acquire) {
            debug!("Ignoring playback {:?} while following", requested);
            return;
        }
        self.transition(requested);
    }

    fn transition(&self, requested: Playback) {
        let (loop_mode, current, range) = {
            let control = self.control();
            (control.loop_mode, control.current_time, control.in_out_range)
        };
        let mut value = requested;
        match (loop_mode, requested) {
            (LoopMode::Once, Playback::Forward) if current == range.end_inclusive() => {
                self.seek(range.start);
            }
            (LoopMode::Once, Playback::Reverse) if current == range.start => {
                self.seek(range.end_inclusive());
            }
            (LoopMode::PingPong, Playback::Forward) if current == range.end_inclusive() => {
                value = Playback::Reverse;
            }
            (LoopMode::PingPong, Playback::Reverse) if current == range.start => {
                value = Playback::Forward;
            }
            _ => {}
        }
        self.apply_playback(value);
    }

    fn apply_playback(&self, value: Playback) -> bool {
        let now = self.clock.now();
        {
            let mut control = self.control();
            if control.playback == value {
                return false;
            }
            control.playback = value;
            control.reanchor(now);
            if value != Playback::Stop {
                control.cache_direction = value.into();
            }
            control.request_epoch += 1;
        }
        self.observers.playback.set_if_changed(value);
        if value != Playback::Stop {
            self.reset_audio(true);
        }
        true
    }

    fn seek(&self, time: RationalTime) -> bool {
        if !time.is_valid() {
            warn!("Ignoring seek to invalid time");
            return false;
        }
        let rate = self.time_range.rate();
        let now = self.clock.now();
        let (time, playing) = {
            let mut control = self.control();
            let (time, _) = loop_time(time.rescaled_to(rate).floor(), &control.in_out_range);
            if time == control.current_time {
                return false;
            }
            control.current_time = time;
            let playing = control.playback != Playback::Stop;
            if playing {
                control.reanchor(now);
            }
            control.request_epoch += 1;
            (time, playing)
        };
        self.observers.current_time.set_if_changed(time);
        if playing {
            self.reset_audio(true);
        }
        true
    }

    /// Time pushed by a leader: no audio reset and, while playing, no request
    /// cancellation, since the follower's own window keeps moving with it.
    fn mirror_time(&self, time: RationalTime) {
        let rate = self.time_range.rate();
        let now = self.clock.now();
        let time = {
            let mut control = self.control();
            let (time, _) = loop_time(time.rescaled_to(rate).floor(), &control.in_out_range);
            if time == control.current_time {
                return;
            }
            control.current_time = time;
            control.reanchor(now);
            if control.playback == Playback::Stop {
                control.request_epoch += 1;
            }
            time
        };
        self.observers.current_time.set_if_changed(time);
    }

    fn set_in_out_range(&self, range: TimeRange) {
        let rate = self.time_range.rate();
        let requested = range.rescaled_to(rate);
        let Some(clamped) = self.time_range.clamped(&requested) else {
            warn!("In/out range {:?} is outside the timeline", range);
            return;
        };
        let clamped = TimeRange::from_start_end_exclusive(
            clamped.start.floor(),
            clamped.end_exclusive().ceil(),
        );
        let current = {
            let mut control = self.control();
            if control.in_out_range == clamped {
                return;
            }
            control.in_out_range = clamped;
            control.request_epoch += 1;
            control.current_time
        };
        self.observers.in_out_range.set_if_changed(clamped);
        if !clamped.contains(current) {
            self.seek(current);
        }
    }

    fn advance_clock(&self) {
        let now = self.clock.now();
        let (playback, loop_mode, speed, in_out_range, start_time, start_instant) = {
            let control = self.control();
            if control.playback == Playback::Stop {
                return;
            }
            (
                control.playback,
                control.loop_mode,
                control.speed,
                control.in_out_range,
                control.playback_start_time,
                control.playback_start_instant,
            )
        };

        let audio_elapsed = self
            .stream_clock
            .as_ref()
            .filter(|c| c.is_running())
            .map(StreamClock::elapsed_seconds);
        let wall = now.saturating_duration_since(start_instant);
        let elapsed_seconds = self
            .playback_clock
            .elapsed_seconds(playback, speed, audio_elapsed, wall);
        let tick = self.playback_clock.advance(&ClockInputs {
            playback,
            loop_mode,
            in_out_range,
            start_time,
            elapsed_seconds,
        });

        {
            let mut control = self.control();
            // An API call re-anchored the clock in the meantime
            if control.playback != playback || control.playback_start_instant != start_instant {
                return;
            }
            control.current_time = tick.time;
            if tick.boundary == Some(Boundary::Looped) {
                control.reanchor(now);
            }
        }
        self.observers.current_time.set_if_changed(tick.time);

        match (tick.boundary, loop_mode) {
            (Some(Boundary::Looped), _) => self.reset_audio(false),
            (Some(Boundary::Reached), LoopMode::Once) => {
                self.transition(Playback::Stop);
            }
            (Some(Boundary::Reached), LoopMode::PingPong) => {
                self.transition(playback);
            }
            _ => {}
        }
    }
}

fn validate_options(options: &PlayerOptions) -> Result<(), PlayerError> {
    if options.request_count == 0 {
        return Err(PlayerError::InvalidOptions("request_count must be at least 1".into()));
    }
    if options.audio_buffer_frames == 0 {
        return Err(PlayerError::InvalidOptions("audio_buffer_frames must be at least 1".into()));
    }
    let cache = options.cache;
    if !(cache.read_ahead_s.is_finite() && cache.read_behind_s.is_finite()) {
        return Err(PlayerError::InvalidOptions(format!("cache window {:?}", cache)));
    }
    Ok(())
}

fn open_audio(
    device: &dyn AudioDevice,
    input: super::types::AudioInfo,
    options: &PlayerOptions,
    control: Arc<Mutex<ControlState>>,
    audio: Arc<Mutex<AudioState>>,
    clock: Arc<dyn MonotonicClock>,
    rate: f64,
) -> Option<Box<dyn AudioStream>> {
    let output = match device.output_info(&input) {
        Ok(output) => output,
        Err(e) => {
            warn!("Audio disabled: {}", e);
            return None;
        }
    };
    let mut engine = AudioEngine::new(control, audio, clock, rate, input, output);
    let result = device.open(
        output,
        options.audio_buffer_frames,
        Box::new(move |out| engine.render(out)),
        Box::new(|e| warn!("Audio device error: {}", e)),
    );
    match result {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Audio disabled: {}", e);
            None
        }
    }
}
