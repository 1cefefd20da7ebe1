//! Play head clock: elapsed-time sources and loop-mode policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::time::{loop_time, RationalTime, TimeRange};
use super::types::{LoopMode, Playback};
use crate::config::TimerMode;

/// Source of "now" shared by the play head, the mute timeout and tests.
pub trait MonotonicClock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl MonotonicClock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset_nanos: AtomicU64,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_nanos: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

impl MonotonicClock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }
}

/// What the clock ran into on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Wrapped around the in/out range (Loop).
    Looped,
    /// Clamped at an edge (Once, PingPong).
    Reached,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockTick {
    pub time: RationalTime,
    pub boundary: Option<Boundary>,
}

#[derive(Debug, Clone, Copy)]
pub struct ClockInputs {
    pub playback: Playback,
    pub loop_mode: LoopMode,
    pub in_out_range: TimeRange,
    pub start_time: RationalTime,
    /// Signed: already negated for reverse playback.
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PlaybackClock {
    timer_mode: TimerMode,
    nominal_rate: f64,
}

impl PlaybackClock {
    pub fn new(timer_mode: TimerMode, nominal_rate: f64) -> Self {
        Self {
            timer_mode,
            nominal_rate,
        }
    }

    pub fn nominal_rate(&self) -> f64 {
        self.nominal_rate
    }

    /// Seconds of timeline time since the playback start reference.
    ///
    /// `audio_elapsed` is the running stream's own counter, `None` without a
    /// running stream. It wins only in audio timer mode at nominal speed.
    pub fn elapsed_seconds(
        &self,
        playback: Playback,
        speed: f64,
        audio_elapsed: Option<f64>,
        wall: Duration,
    ) -> f64 {
        let seconds = match audio_elapsed {
            Some(audio) if self.timer_mode == TimerMode::Audio && speed == self.nominal_rate => audio,
            _ => wall.as_secs_f64() * speed / self.nominal_rate,
        };
        match playback {
            Playback::Reverse => -seconds,
            Playback::Forward => seconds,
            Playback::Stop => 0.0,
        }
    }

    /// Computes the play head for `inputs` and applies the loop mode.
    pub fn advance(&self, inputs: &ClockInputs) -> ClockTick {
        let range = inputs.in_out_range;
        let rate = range.rate();
        let start = inputs.start_time.rescaled_to(rate);
        if inputs.playback == Playback::Stop {
            return ClockTick {
                time: start,
                boundary: None,
            };
        }

        let candidate = RationalTime::new(start.value + inputs.elapsed_seconds * rate, rate).floor();
        let first = range.start.rescaled_to(rate);
        let last = range.end_inclusive().rescaled_to(rate);

        match inputs.loop_mode {
            LoopMode::Loop => {
                let (time, looped) = loop_time(candidate, &range);
                ClockTick {
                    time,
                    boundary: looped.then_some(Boundary::Looped),
                }
            }
            LoopMode::Once => match inputs.playback {
                Playback::Forward if candidate >= last => reached(last),
                Playback::Reverse if candidate <= first => reached(first),
                _ => inside(candidate, first, last),
            },
            LoopMode::PingPong => match inputs.playback {
                Playback::Forward if candidate > last => reached(last),
                Playback::Reverse if candidate < first => reached(first),
                _ => inside(candidate, first, last),
            },
        }
    }
}

fn reached(time: RationalTime) -> ClockTick {
    ClockTick {
        time,
        boundary: Some(Boundary::Reached),
    }
}

fn inside(candidate: RationalTime, first: RationalTime, last: RationalTime) -> ClockTick {
    ClockTick {
        time: candidate.max(first).min(last),
        boundary: None,
    }
}
