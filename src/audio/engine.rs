//! Real-time audio render path.
//!
//! [`AudioEngine::render`] runs on the device thread once per buffer period.
//! It never blocks on the main lock (`try_lock`, falling back to the last good
//! snapshot) and holds the audio lock only to copy scalars and `Arc`
//! handles. Anything that goes wrong degrades to silence.

use log::trace;
use ringbuf::{traits::*, HeapRb};
use std::sync::{Arc, Mutex, TryLockError};

use super::resample::AudioResampler;
use crate::core::clock::MonotonicClock;
use crate::core::state::{AudioState, ControlState};
use crate::core::time::RationalTime;
use crate::core::types::{AudioBuffer, AudioInfo, Playback};

/// Upper bound of input frames mixed per step.
const MIX_CHUNK_FRAMES: usize = 1024;

/// Fill iterations per callback before giving up.
const MAX_FILL_STEPS: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    playback: Playback,
    start_time: RationalTime,
    audio_offset: f64,
}

pub struct AudioEngine {
    control: Arc<Mutex<ControlState>>,
    audio: Arc<Mutex<AudioState>>,
    clock: Arc<dyn MonotonicClock>,
    nominal_rate: f64,
    input: AudioInfo,
    output: AudioInfo,
    resampler: Option<AudioResampler>,
    ring: HeapRb<f32>,
    /// Output frames since the last reset, emitted or not.
    frame_counter: u64,
    /// Next input frame to mix; `None` until derived from the start time.
    cursor: Option<i64>,
    snapshot: Snapshot,
    layers: Vec<Arc<AudioBuffer>>,
    silence: Option<Arc<AudioBuffer>>,
    mix: Vec<f32>,
}

impl AudioEngine {
    pub(crate) fn new(
        control: Arc<Mutex<ControlState>>,
        audio: Arc<Mutex<AudioState>>,
        clock: Arc<dyn MonotonicClock>,
        nominal_rate: f64,
        input: AudioInfo,
        output: AudioInfo,
    ) -> Self {
        let ratio = (output.sample_rate as f64 / input.sample_rate.max(1) as f64).ceil() as usize;
        let capacity = output.channels as usize
            * (output.sample_rate as usize + 4 * (MIX_CHUNK_FRAMES + 256) * ratio.max(1));
        Self {
            control,
            audio,
            clock,
            nominal_rate,
            input,
            output,
            resampler: None,
            ring: HeapRb::new(capacity),
            frame_counter: 0,
            cursor: None,
            snapshot: Snapshot {
                playback: Playback::Stop,
                start_time: RationalTime::INVALID,
                audio_offset: 0.0,
            },
            layers: Vec::new(),
            silence: None,
            mix: Vec::new(),
        }
    }

    pub fn frames_played(&self) -> u64 {
        self.frame_counter
    }

    pub fn output_info(&self) -> AudioInfo {
        self.output
    }

    /// Fills `out` (interleaved, device format).
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);

        let fresh = match self.control.try_lock() {
            Ok(control) => {
                self.snapshot = snapshot_of(&control);
                true
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                self.snapshot = snapshot_of(&poisoned.into_inner());
                true
            }
            Err(TryLockError::WouldBlock) => false,
        };

        let (speed, volume, mute, mute_timeout, reset, pending_reset) = {
            let mut audio = self.audio.lock().unwrap_or_else(|e| e.into_inner());
            // A reset is only honored together with a fresh start time.
            let reset = audio.reset && fresh;
            if reset {
                audio.reset = false;
            }
            (audio.speed, audio.volume, audio.mute, audio.mute_timeout, reset, audio.reset)
        };

        if reset {
            self.ring.clear();
            if let Some(resampler) = self.resampler.as_mut() {
                resampler.reset();
            }
            self.frame_counter = 0;
            self.cursor = None;
        }

        let out_channels = self.output.channels.max(1) as usize;
        let frames = (out.len() / out_channels) as u64;

        match self.snapshot.playback {
            Playback::Forward if !pending_reset => {
                self.fill(out.len(), volume);
                let ready = self.ring.occupied_len() >= out.len();
                let audible = speed == self.nominal_rate && !mute && self.clock.now() >= mute_timeout;
                if ready && audible {
                    self.ring.pop_slice(out);
                } else {
                    let available = self.ring.occupied_len().min(out.len());
                    self.ring.skip(available);
                }
                self.frame_counter += frames;
            }
            Playback::Forward | Playback::Reverse => {
                self.frame_counter += frames;
            }
            Playback::Stop => {}
        }
    }

    /// Mixes and resamples until the ring holds `needed` samples.
    fn fill(&mut self, needed: usize, volume: f32) {
        if !self
            .resampler
            .as_ref()
            .is_some_and(|r| r.matches(self.input, self.output))
        {
            match AudioResampler::new(self.input, self.output) {
                Ok(resampler) => self.resampler = Some(resampler),
                Err(_) => return,
            }
        }

        let in_rate = self.input.sample_rate as i64;
        let in_channels = self.input.channels as usize;
        let mut cursor = match self.cursor {
            Some(cursor) => cursor,
            None => {
                let start = self.snapshot.start_time.to_seconds() * in_rate as f64;
                let offset = (self.snapshot.audio_offset * in_rate as f64).round();
                let elapsed = self.frame_counter as f64 * in_rate as f64 / self.output.sample_rate as f64;
                (start.floor() - offset + elapsed.floor()) as i64
            }
        };

        let mut steps = 0;
        while self.ring.occupied_len() < needed && steps < MAX_FILL_STEPS {
            steps += 1;
            let second = cursor.div_euclid(in_rate);
            let offset = cursor.rem_euclid(in_rate) as usize;
            let chunk_frames = MIX_CHUNK_FRAMES.min(in_rate as usize - offset);

            self.gather_layers(second);
            self.mix.clear();
            self.mix.resize(chunk_frames * in_channels, 0.0);
            let start = offset * in_channels;
            for layer in &self.layers {
                let end = (start + self.mix.len()).min(layer.samples.len());
                if start >= end {
                    continue;
                }
                for (m, s) in self.mix.iter_mut().zip(&layer.samples[start..end]) {
                    *m += s * volume;
                }
            }

            let Some(resampler) = self.resampler.as_mut() else {
                break;
            };
            match resampler.process(&self.mix) {
                Ok(samples) => {
                    self.ring.push_slice(samples);
                }
                Err(e) => {
                    trace!("Resample failed: {}", e);
                    break;
                }
            }
            cursor += chunk_frames as i64;
        }
        self.cursor = Some(cursor);
    }

    /// Collects the matching-format layers of `second`, or a silence buffer.
    fn gather_layers(&mut self, second: i64) {
        self.layers.clear();
        {
            let audio = self.audio.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(data) = audio.cache.get(&second) {
                for layer in &data.layers {
                    if let Some(buffer) = &layer.audio {
                        if buffer.info == self.input {
                            self.layers.push(Arc::clone(buffer));
                        }
                    }
                }
            }
        }
        if self.layers.is_empty() {
            let input = self.input;
            let silence = self.silence.get_or_insert_with(|| {
                Arc::new(AudioBuffer::silence(input, input.sample_rate as usize))
            });
            self.layers.push(Arc::clone(silence));
        }
    }
}

fn snapshot_of(control: &ControlState) -> Snapshot {
    Snapshot {
        playback: control.playback,
        start_time: control.playback_start_time,
        audio_offset: control.audio_offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheOptions;
    use crate::core::clock::ManualClock;
    use crate::core::time::TimeRange;
    use crate::core::types::{AudioData, AudioLayer};
    use std::time::Duration;

    const RATE: f64 = 24.0;
    const MONO_1K: AudioInfo = AudioInfo {
        channels: 1,
        sample_rate: 1000,
    };

    struct Rig {
        control: Arc<Mutex<ControlState>>,
        audio: Arc<Mutex<AudioState>>,
        clock: Arc<ManualClock>,
        engine: AudioEngine,
    }

    fn rig() -> Rig {
        rig_with(MONO_1K)
    }

    fn rig_with(output: AudioInfo) -> Rig {
        let clock = Arc::new(ManualClock::new());
        let range = TimeRange::new(RationalTime::new(0.0, RATE), RationalTime::new(240.0, RATE));
        let control = Arc::new(Mutex::new(ControlState::new(
            range,
            RATE,
            CacheOptions::default(),
            clock.now(),
        )));
        let audio = Arc::new(Mutex::new(AudioState::new(RATE, clock.now())));
        let engine = AudioEngine::new(
            Arc::clone(&control),
            Arc::clone(&audio),
            clock.clone(),
            RATE,
            MONO_1K,
            output,
        );
        Rig {
            control,
            audio,
            clock,
            engine,
        }
    }

    fn ramp(second: i64) -> AudioLayer {
        let samples = (0..1000).map(|i| (second * 1000 + i) as f32 / 10000.0).collect();
        AudioLayer {
            audio: Some(Arc::new(AudioBuffer {
                info: MONO_1K,
                samples,
            })),
        }
    }

    fn constant(info: AudioInfo, value: f32) -> AudioLayer {
        AudioLayer {
            audio: Some(Arc::new(AudioBuffer {
                info,
                samples: vec![value; info.sample_rate as usize * info.channels as usize],
            })),
        }
    }

    fn put(rig: &Rig, second: i64, layers: Vec<AudioLayer>) {
        rig.audio
            .lock()
            .unwrap()
            .cache
            .insert(second, AudioData { seconds: second, layers });
    }

    fn play_from(rig: &Rig, seconds: f64) {
        {
            let mut control = rig.control.lock().unwrap();
            control.playback = Playback::Forward;
            control.playback_start_time = RationalTime::from_seconds(seconds).rescaled_to(RATE);
        }
        rig.audio.lock().unwrap().reset = true;
    }

    fn expected(from: i64, len: usize) -> Vec<f32> {
        (from..from + len as i64).map(|i| i as f32 / 10000.0).collect()
    }

    #[test]
    fn test_forward_plays_cached_audio_continuously() {
        let mut rig = rig();
        put(&rig, 0, vec![ramp(0)]);
        play_from(&rig, 0.0);

        let mut out = vec![0.0; 100];
        rig.engine.render(&mut out);
        assert_eq!(out, expected(0, 100));
        rig.engine.render(&mut out);
        assert_eq!(out, expected(100, 100));
        assert_eq!(rig.engine.frames_played(), 200);
    }

    #[test]
    fn test_silence_when_speed_differs_from_rate() {
        let mut rig = rig();
        put(&rig, 0, vec![ramp(0)]);
        play_from(&rig, 0.0);
        rig.audio.lock().unwrap().speed = 48.0;

        let mut out = vec![1.0; 100];
        rig.engine.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        // The clock still advanced
        assert_eq!(rig.engine.frames_played(), 100);
    }

    #[test]
    fn test_mute_and_mute_timeout_silence() {
        let mut rig = rig();
        put(&rig, 0, vec![ramp(0)]);
        play_from(&rig, 0.0);
        rig.audio.lock().unwrap().mute = true;

        let mut out = vec![0.0; 100];
        rig.engine.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));

        {
            let mut audio = rig.audio.lock().unwrap();
            audio.mute = false;
            audio.mute_timeout = rig.clock.now() + Duration::from_millis(500);
        }
        rig.engine.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));

        rig.clock.advance(Duration::from_millis(500));
        rig.engine.render(&mut out);
        // Silent buffers were consumed, so playback resumes in step with the clock
        assert_eq!(out, expected(200, 100));
    }

    #[test]
    fn test_reverse_only_advances_counter() {
        let mut rig = rig();
        put(&rig, 0, vec![ramp(0)]);
        rig.control.lock().unwrap().playback = Playback::Reverse;

        let mut out = vec![1.0; 64];
        rig.engine.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(rig.engine.frames_played(), 64);
    }

    #[test]
    fn test_stop_is_silent_and_still() {
        let mut rig = rig();
        let mut out = vec![1.0; 64];
        rig.engine.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(rig.engine.frames_played(), 0);
    }

    #[test]
    fn test_layers_are_mixed_with_volume() {
        let mut rig = rig();
        put(&rig, 0, vec![constant(MONO_1K, 0.25), constant(MONO_1K, 0.5)]);
        play_from(&rig, 0.0);
        rig.audio.lock().unwrap().volume = 0.5;

        let mut out = vec![0.0; 50];
        rig.engine.render(&mut out);
        assert!(out.iter().all(|&s| (s - 0.375).abs() < 1e-6));
    }

    #[test]
    fn test_mismatched_layer_format_is_ignored() {
        let mut rig = rig();
        let stereo = AudioInfo {
            channels: 2,
            sample_rate: 1000,
        };
        put(&rig, 0, vec![constant(stereo, 0.9), constant(MONO_1K, 0.1)]);
        play_from(&rig, 0.0);

        let mut out = vec![0.0; 10];
        rig.engine.render(&mut out);
        assert!(out.iter().all(|&s| (s - 0.1).abs() < 1e-6));
    }

    #[test]
    fn test_rolls_over_second_boundary() {
        let mut rig = rig();
        put(&rig, 0, vec![ramp(0)]);
        put(&rig, 1, vec![ramp(1)]);
        play_from(&rig, 0.9375);

        let mut out = vec![0.0; 100];
        rig.engine.render(&mut out);
        assert_eq!(out, expected(937, 100));
    }

    #[test]
    fn test_missing_second_is_silence() {
        let mut rig = rig();
        put(&rig, 1, vec![ramp(1)]);
        play_from(&rig, 0.0);

        let mut out = vec![1.0; 100];
        rig.engine.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_audio_offset_shifts_cursor() {
        let mut rig = rig();
        put(&rig, 0, vec![ramp(0)]);
        play_from(&rig, 0.5);
        rig.control.lock().unwrap().audio_offset = 0.25;

        let mut out = vec![0.0; 10];
        rig.engine.render(&mut out);
        assert_eq!(out, expected(250, 10));
    }

    #[test]
    fn test_reset_restarts_from_new_start_time() {
        let mut rig = rig();
        put(&rig, 0, vec![ramp(0)]);
        play_from(&rig, 0.0);
        let mut out = vec![0.0; 100];
        rig.engine.render(&mut out);

        play_from(&rig, 0.5);
        rig.engine.render(&mut out);
        assert_eq!(out, expected(500, 100));
        assert_eq!(rig.engine.frames_played(), 100);
    }

    #[test]
    fn test_contended_main_lock_defers_reset() {
        let mut rig = rig();
        put(&rig, 0, vec![ramp(0)]);
        play_from(&rig, 0.0);
        let control = Arc::clone(&rig.control);
        let guard = control.lock().unwrap();

        let mut out = vec![1.0; 100];
        rig.engine.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(rig.audio.lock().unwrap().reset);
        drop(guard);

        rig.engine.render(&mut out);
        assert_eq!(out, expected(0, 100));
    }

    #[test]
    fn test_resamples_to_device_rate_and_channels() {
        let stereo_2k = AudioInfo {
            channels: 2,
            sample_rate: 2000,
        };
        let mut rig = rig_with(stereo_2k);
        assert_eq!(rig.engine.output_info(), stereo_2k);
        put(&rig, 0, vec![constant(MONO_1K, 0.1)]);
        put(&rig, 1, vec![constant(MONO_1K, 0.2)]);
        play_from(&rig, 0.0);

        // 256 device frames per callback
        let mut buffers = Vec::new();
        for _ in 0..10 {
            let mut out = vec![0.0; 512];
            rig.engine.render(&mut out);
            buffers.push(out);
        }
        assert_eq!(rig.engine.frames_played(), 2560);

        // Device frames 256..512 come from the first second
        assert!(buffers[1].iter().all(|&s| (s - 0.1).abs() < 1e-3), "{:?}", &buffers[1][..8]);
        // Device frames 2304..2560 come from the second one
        assert!(buffers[9].iter().all(|&s| (s - 0.2).abs() < 1e-3), "{:?}", &buffers[9][..8]);
        for pair in buffers[9].chunks_exact(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }
}
