//! Synthetic media: a timeline of generated color frames and a sine tone,
//! decoded asynchronously on a [`Workers`] pool.
//!
//! Used by the demo binary and by tests that need a real asynchronous
//! decoder without media files.

use log::trace;
use std::collections::HashSet;
use std::f32::consts::TAU;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::io::{request_pair, DecodeRequest, DecodeService, RequestId, Timeline};
use super::time::{RationalTime, TimeRange};
use super::types::{
    AudioBuffer, AudioData, AudioInfo, AudioLayer, Image, ImageInfo, IoInfo, IoOptions,
    VideoData, VideoLayer, LAYER_OPTION,
};
use super::workers::Workers;
use crate::error::DecodeError;

#[derive(Debug, Clone)]
pub struct PatternOptions {
    pub start_frame: f64,
    pub duration_s: f64,
    pub rate: f64,
    pub image: ImageInfo,
    pub layers: usize,
    /// `None` makes a silent timeline.
    pub audio: Option<AudioInfo>,
    pub tone_hz: f32,
    /// Simulated decode cost per request.
    pub decode_delay: Duration,
}

impl Default for PatternOptions {
    fn default() -> Self {
        Self {
            start_frame: 0.0,
            duration_s: 10.0,
            rate: 24.0,
            image: ImageInfo {
                width: 64,
                height: 36,
            },
            layers: 1,
            audio: Some(AudioInfo {
                channels: 2,
                sample_rate: 48000,
            }),
            tone_hz: 440.0,
            decode_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatternTimeline {
    options: PatternOptions,
    range: TimeRange,
}

impl PatternTimeline {
    pub fn new(options: PatternOptions) -> Self {
        let range = TimeRange::new(
            RationalTime::new(options.start_frame, options.rate),
            RationalTime::new((options.duration_s * options.rate).round(), options.rate),
        );
        Self { options, range }
    }

    pub fn options(&self) -> &PatternOptions {
        &self.options
    }

    /// Decoder for this timeline running on `threads` worker threads.
    pub fn decoder(&self, threads: usize) -> PatternDecoder {
        PatternDecoder {
            source: Arc::new(self.clone()),
            workers: Workers::new(threads, "reelplay-decode"),
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn render_video(&self, time: RationalTime, layer: usize) -> Result<VideoData, DecodeError> {
        if !self.range.contains(time) {
            return Err(DecodeError::OutOfRange(format!(
                "frame {} outside [{}, {})",
                time.value,
                self.range.start.value,
                self.range.end_exclusive().value
            )));
        }
        if layer >= self.options.layers {
            return Err(DecodeError::Failed(format!("no video layer {}", layer)));
        }
        let info = self.options.image;
        let frame = (time.rescaled_to(self.options.rate).value - self.range.start.value) as u32;
        let red = (frame.wrapping_mul(7) % 256) as u8;
        let green = (layer as u32 * 80 % 256) as u8;
        let bar = frame % info.width.max(1);

        let mut pixels = Vec::with_capacity((info.width * info.height * 4) as usize);
        for _y in 0..info.height {
            for x in 0..info.width {
                if x == bar {
                    pixels.extend_from_slice(&[255, 255, 255, 255]);
                } else {
                    pixels.extend_from_slice(&[red, green, 255 - red, 255]);
                }
            }
        }
        Ok(VideoData {
            time,
            layers: vec![VideoLayer {
                image: Some(Arc::new(Image { info, pixels })),
                ..Default::default()
            }],
        })
    }

    fn render_audio(&self, seconds: i64) -> Result<AudioData, DecodeError> {
        let Some(info) = self.options.audio else {
            return Err(DecodeError::Failed("timeline has no audio".into()));
        };
        let first = self.range.start.to_seconds().floor() as i64;
        let end = self.range.end_exclusive().to_seconds().ceil() as i64;
        if seconds < first || seconds >= end {
            return Err(DecodeError::OutOfRange(format!("second {} outside [{}, {})", seconds, first, end)));
        }

        let rate = info.sample_rate as usize;
        let channels = info.channels as usize;
        // Phase restarts every second; whole-hertz tones stay continuous.
        let step = TAU * self.options.tone_hz / info.sample_rate as f32;
        let mut samples = Vec::with_capacity(rate * channels);
        for i in 0..rate {
            let s = (step * i as f32).sin() * 0.25;
            samples.extend(std::iter::repeat_n(s, channels));
        }
        Ok(AudioData {
            seconds,
            layers: vec![AudioLayer {
                audio: Some(Arc::new(AudioBuffer { info, samples })),
            }],
        })
    }
}

impl Timeline for PatternTimeline {
    fn time_range(&self) -> TimeRange {
        self.range
    }

    fn io_info(&self) -> IoInfo {
        IoInfo {
            video: vec![self.options.image; self.options.layers],
            audio: self.options.audio,
        }
    }
}

pub struct PatternDecoder {
    source: Arc<PatternTimeline>,
    workers: Workers,
    pending: Arc<Mutex<HashSet<RequestId>>>,
}

impl PatternDecoder {
    /// Requests queued or decoding and not cancelled.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn submit<T, F>(&self, render: F) -> DecodeRequest<T>
    where
        T: Send + 'static,
        F: FnOnce(&PatternTimeline) -> Result<T, DecodeError> + Send + 'static,
    {
        let (request, completer) = request_pair();
        let id = completer.id();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);

        let source = Arc::clone(&self.source);
        let pending = Arc::clone(&self.pending);
        let delay = self.source.options.decode_delay;
        self.workers.execute(move || {
            if !pending.lock().unwrap_or_else(|e| e.into_inner()).contains(&id) {
                trace!("Request {:?} cancelled before decode", id);
                return;
            }
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            let result = render(source.as_ref());
            let still_pending = pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            if !still_pending {
                trace!("Request {:?} cancelled during decode", id);
                return;
            }
            completer.complete(result);
        });
        request
    }
}

impl DecodeService for PatternDecoder {
    fn request_video(&self, time: RationalTime, options: &IoOptions) -> DecodeRequest<VideoData> {
        let layer = options
            .get(LAYER_OPTION)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        self.submit(move |source| source.render_video(time, layer))
    }

    fn request_audio(&self, seconds: i64, _options: &IoOptions) -> DecodeRequest<AudioData> {
        self.submit(move |source| source.render_audio(seconds))
    }

    fn cancel(&self, ids: &[RequestId]) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            pending.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::RequestPoll;
    use std::time::Instant;

    fn wait<T>(request: &DecodeRequest<T>) -> RequestPoll<T> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match request.poll() {
                RequestPoll::Pending if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(1))
                }
                other => return other,
            }
        }
    }

    fn small() -> PatternOptions {
        PatternOptions {
            duration_s: 2.0,
            image: ImageInfo {
                width: 4,
                height: 2,
            },
            audio: Some(AudioInfo {
                channels: 2,
                sample_rate: 1000,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_timeline_range_and_info() {
        let timeline = PatternTimeline::new(PatternOptions {
            start_frame: 100.0,
            layers: 2,
            ..small()
        });
        let range = timeline.time_range();
        assert_eq!(range.start, RationalTime::new(100.0, 24.0));
        assert_eq!(range.duration, RationalTime::new(48.0, 24.0));
        let info = timeline.io_info();
        assert_eq!(info.video.len(), 2);
        assert_eq!(info.audio().map(|a| a.sample_rate), Some(1000));
    }

    #[test]
    fn test_video_decode() {
        let timeline = PatternTimeline::new(small());
        let decoder = timeline.decoder(2);
        let request = decoder.request_video(RationalTime::new(5.0, 24.0), &IoOptions::new());
        let RequestPoll::Ready(Ok(video)) = wait(&request) else {
            panic!("decode did not complete");
        };
        assert_eq!(video.time, RationalTime::new(5.0, 24.0));
        let image = video.layers[0].image.as_ref().unwrap();
        assert_eq!(image.pixels.len(), 4 * 2 * 4);
        // Frame 5 paints the bar in column 1
        assert_eq!(&image.pixels[4..8], &[255, 255, 255, 255]);
        assert_eq!(decoder.pending_count(), 0);
    }

    #[test]
    fn test_layer_option_selects_layer() {
        let timeline = PatternTimeline::new(small());
        let decoder = timeline.decoder(1);
        let mut options = IoOptions::new();
        options.insert(LAYER_OPTION.to_string(), "1".to_string());
        let request = decoder.request_video(RationalTime::new(0.0, 24.0), &options);
        assert!(matches!(wait(&request), RequestPoll::Ready(Err(DecodeError::Failed(_)))));
    }

    #[test]
    fn test_out_of_range_requests_fail() {
        let timeline = PatternTimeline::new(small());
        let decoder = timeline.decoder(1);
        let video = decoder.request_video(RationalTime::new(48.0, 24.0), &IoOptions::new());
        let audio = decoder.request_audio(2, &IoOptions::new());
        assert!(matches!(wait(&video), RequestPoll::Ready(Err(DecodeError::OutOfRange(_)))));
        assert!(matches!(wait(&audio), RequestPoll::Ready(Err(DecodeError::OutOfRange(_)))));
    }

    #[test]
    fn test_audio_is_one_second() {
        let timeline = PatternTimeline::new(small());
        let decoder = timeline.decoder(1);
        let request = decoder.request_audio(1, &IoOptions::new());
        let RequestPoll::Ready(Ok(audio)) = wait(&request) else {
            panic!("decode did not complete");
        };
        assert_eq!(audio.seconds, 1);
        let buffer = audio.layers[0].audio.as_ref().unwrap();
        assert_eq!(buffer.frames(), 1000);
        assert_eq!(buffer.samples.len(), 2000);
        assert!(buffer.samples.iter().all(|s| s.abs() <= 0.25));
    }

    #[test]
    fn test_cancel_abandons_request() {
        let timeline = PatternTimeline::new(PatternOptions {
            decode_delay: Duration::from_millis(100),
            ..small()
        });
        let decoder = timeline.decoder(1);
        let request = decoder.request_video(RationalTime::new(1.0, 24.0), &IoOptions::new());
        decoder.cancel(&[request.id()]);
        assert_eq!(decoder.pending_count(), 0);
        assert!(matches!(wait(&request), RequestPoll::Abandoned));
    }
}
