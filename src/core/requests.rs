//! Outstanding decode requests, deduplicated by `(kind, key)`.
//!
//! Keys are frame indices at the timeline rate for video and whole seconds for
//! audio. The pipeline never blocks: `drain_completed` polls every outstanding
//! request once and hands back whatever finished.

use indexmap::IndexMap;
use log::{debug, trace};
use std::sync::Arc;

use super::cache::Cache;
use super::io::{DecodeRequest, DecodeService, RequestId, RequestPoll};
use super::time::RationalTime;
use super::types::{AudioData, IoOptions, VideoData, LAYER_OPTION};
use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Video,
    Audio,
}

enum Pending {
    Video(DecodeRequest<VideoData>),
    Audio(DecodeRequest<AudioData>),
}

impl Pending {
    fn id(&self) -> RequestId {
        match self {
            Pending::Video(r) => r.id(),
            Pending::Audio(r) => r.id(),
        }
    }

    fn poll(&self) -> Option<Result<Payload, DecodeError>> {
        fn lift<T>(poll: RequestPoll<T>, wrap: fn(T) -> Payload) -> Option<Result<Payload, DecodeError>> {
            match poll {
                RequestPoll::Pending => None,
                RequestPoll::Ready(result) => Some(result.map(wrap)),
                RequestPoll::Abandoned => Some(Err(DecodeError::Cancelled)),
            }
        }
        match self {
            Pending::Video(r) => lift(r.poll(), Payload::Video),
            Pending::Audio(r) => lift(r.poll(), Payload::Audio),
        }
    }
}

#[derive(Debug)]
pub enum Payload {
    Video(VideoData),
    Audio(AudioData),
}

/// A finished request.
#[derive(Debug)]
pub struct Completed {
    pub kind: RequestKind,
    pub key: i64,
    pub result: Result<Payload, DecodeError>,
}

pub struct RequestPipeline {
    decoder: Arc<dyn DecodeService>,
    rate: f64,
    options: IoOptions,
    max_per_kind: usize,
    pending: IndexMap<(RequestKind, i64), Pending>,
    video_in_flight: usize,
    audio_in_flight: usize,
    issued: u64,
    failed: u64,
}

impl RequestPipeline {
    pub fn new(decoder: Arc<dyn DecodeService>, rate: f64, max_per_kind: usize) -> Self {
        Self {
            decoder,
            rate,
            options: IoOptions::new(),
            max_per_kind: max_per_kind.max(1),
            pending: IndexMap::new(),
            video_in_flight: 0,
            audio_in_flight: 0,
            issued: 0,
            failed: 0,
        }
    }

    /// Selects the video layer passed to the decoder with every new request.
    pub fn set_layer(&mut self, layer: usize) {
        self.options.insert(LAYER_OPTION.to_string(), layer.to_string());
    }

    pub fn options(&self) -> &IoOptions {
        &self.options
    }

    /// Issues a request for `key` unless it is cached, already in flight, or
    /// the per-kind limit is reached. Returns whether a request was issued.
    pub fn ensure(&mut self, kind: RequestKind, key: i64, cache: &Cache) -> bool {
        let cached = match kind {
            RequestKind::Video => cache.contains_video(key),
            RequestKind::Audio => cache.contains_audio(key),
        };
        if cached || self.pending.contains_key(&(kind, key)) || self.in_flight(kind) >= self.max_per_kind {
            return false;
        }

        let pending = match kind {
            RequestKind::Video => {
                let time = RationalTime::new(key as f64, self.rate);
                self.video_in_flight += 1;
                Pending::Video(self.decoder.request_video(time, &self.options))
            }
            RequestKind::Audio => {
                self.audio_in_flight += 1;
                Pending::Audio(self.decoder.request_audio(key, &self.options))
            }
        };
        trace!("Request {:?} {:?} {}", pending.id(), kind, key);
        self.pending.insert((kind, key), pending);
        self.issued += 1;
        true
    }

    /// Forgets every outstanding request and asks the decoder to drop the work.
    pub fn cancel_all(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let ids: Vec<RequestId> = self.pending.values().map(Pending::id).collect();
        debug!("Cancelling {} requests", ids.len());
        self.decoder.cancel(&ids);
        self.pending.clear();
        self.video_in_flight = 0;
        self.audio_in_flight = 0;
    }

    pub fn drain_completed(&mut self) -> Vec<Completed> {
        let mut done = Vec::new();
        let mut video_done = 0;
        let mut audio_done = 0;
        self.pending.retain(|&(kind, key), pending| match pending.poll() {
            None => true,
            Some(result) => {
                match kind {
                    RequestKind::Video => video_done += 1,
                    RequestKind::Audio => audio_done += 1,
                }
                done.push(Completed { kind, key, result });
                false
            }
        });
        self.video_in_flight -= video_done;
        self.audio_in_flight -= audio_done;
        self.failed += done.iter().filter(|c| c.result.is_err()).count() as u64;
        done
    }

    pub fn in_flight(&self, kind: RequestKind) -> usize {
        match kind {
            RequestKind::Video => self.video_in_flight,
            RequestKind::Audio => self.audio_in_flight,
        }
    }

    pub fn is_in_flight(&self, kind: RequestKind, key: i64) -> bool {
        self.pending.contains_key(&(kind, key))
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::io::{request_pair, Completer};
    use crate::core::state::AudioState;
    use crate::core::time::TimeRange;
    use crate::core::types::CacheDirection;
    use crate::core::cache::WindowParams;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Decoder that parks completers until the test resolves them.
    #[derive(Default)]
    pub(crate) struct ManualDecoder {
        pub video: Mutex<Vec<(RationalTime, IoOptions, Completer<VideoData>)>>,
        pub audio: Mutex<Vec<(i64, Completer<AudioData>)>>,
        pub cancelled: Mutex<Vec<RequestId>>,
    }

    impl DecodeService for ManualDecoder {
        fn request_video(&self, time: RationalTime, options: &IoOptions) -> DecodeRequest<VideoData> {
            let (request, completer) = request_pair();
            self.video.lock().unwrap().push((time, options.clone(), completer));
            request
        }

        fn request_audio(&self, seconds: i64, _options: &IoOptions) -> DecodeRequest<AudioData> {
            let (request, completer) = request_pair();
            self.audio.lock().unwrap().push((seconds, completer));
            request
        }

        fn cancel(&self, ids: &[RequestId]) {
            self.cancelled.lock().unwrap().extend_from_slice(ids);
        }
    }

    fn cache_with_window() -> Cache {
        let audio = Arc::new(Mutex::new(AudioState::new(24.0, Instant::now())));
        let mut cache = Cache::new(24.0, audio);
        let range = TimeRange::new(RationalTime::new(0.0, 24.0), RationalTime::new(240.0, 24.0));
        cache.reserve_window(&WindowParams {
            direction: CacheDirection::Forward,
            current_time: RationalTime::new(0.0, 24.0),
            read_ahead: RationalTime::from_seconds(1.0),
            read_behind: RationalTime::from_seconds(0.0),
            in_out_range: range,
            time_range: range,
            audio_offset: 0.0,
        });
        cache
    }

    #[test]
    fn test_ensure_twice_issues_once() {
        let decoder = Arc::new(ManualDecoder::default());
        let mut pipeline = RequestPipeline::new(decoder.clone(), 24.0, 16);
        let cache = cache_with_window();
        assert!(pipeline.ensure(RequestKind::Video, 5, &cache));
        assert!(!pipeline.ensure(RequestKind::Video, 5, &cache));
        assert_eq!(decoder.video.lock().unwrap().len(), 1);
        assert_eq!(pipeline.in_flight(RequestKind::Video), 1);
        // Same key, other kind, is a separate request
        assert!(pipeline.ensure(RequestKind::Audio, 5, &cache));
    }

    #[test]
    fn test_ensure_skips_cached() {
        let decoder = Arc::new(ManualDecoder::default());
        let mut pipeline = RequestPipeline::new(decoder.clone(), 24.0, 16);
        let mut cache = cache_with_window();
        cache.put_video(3, VideoData::default());
        assert!(!pipeline.ensure(RequestKind::Video, 3, &cache));
        assert!(decoder.video.lock().unwrap().is_empty());
    }

    #[test]
    fn test_request_limit_per_kind() {
        let decoder = Arc::new(ManualDecoder::default());
        let mut pipeline = RequestPipeline::new(decoder.clone(), 24.0, 2);
        let cache = cache_with_window();
        assert!(pipeline.ensure(RequestKind::Video, 0, &cache));
        assert!(pipeline.ensure(RequestKind::Video, 1, &cache));
        assert!(!pipeline.ensure(RequestKind::Video, 2, &cache));
        assert!(pipeline.ensure(RequestKind::Audio, 0, &cache));
    }

    #[test]
    fn test_drain_returns_finished_and_frees_slot() {
        let decoder = Arc::new(ManualDecoder::default());
        let mut pipeline = RequestPipeline::new(decoder.clone(), 24.0, 16);
        let cache = cache_with_window();
        pipeline.ensure(RequestKind::Video, 7, &cache);
        pipeline.ensure(RequestKind::Video, 8, &cache);
        assert!(pipeline.drain_completed().is_empty());

        let (time, _, completer) = decoder.video.lock().unwrap().remove(0);
        assert_eq!(time, RationalTime::new(7.0, 24.0));
        completer.complete(Ok(VideoData { time, layers: Vec::new() }));

        let done = pipeline.drain_completed();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].key, 7);
        assert!(matches!(done[0].result, Ok(Payload::Video(_))));
        assert!(!pipeline.is_in_flight(RequestKind::Video, 7));
        assert!(pipeline.is_in_flight(RequestKind::Video, 8));
        assert_eq!(pipeline.in_flight(RequestKind::Video), 1);
    }

    #[test]
    fn test_decode_error_leaves_slot_empty() {
        let decoder = Arc::new(ManualDecoder::default());
        let mut pipeline = RequestPipeline::new(decoder.clone(), 24.0, 16);
        let cache = cache_with_window();
        pipeline.ensure(RequestKind::Audio, 0, &cache);
        let (_, completer) = decoder.audio.lock().unwrap().remove(0);
        completer.complete(Err(DecodeError::Failed("corrupt".into())));
        let done = pipeline.drain_completed();
        assert!(matches!(done[0].result, Err(DecodeError::Failed(_))));
        assert_eq!(pipeline.failed(), 1);
        // A later ensure may try again
        assert!(pipeline.ensure(RequestKind::Audio, 0, &cache));
    }

    #[test]
    fn test_cancel_all_drops_late_completions() {
        let decoder = Arc::new(ManualDecoder::default());
        let mut pipeline = RequestPipeline::new(decoder.clone(), 24.0, 16);
        let cache = cache_with_window();
        pipeline.ensure(RequestKind::Video, 1, &cache);
        pipeline.ensure(RequestKind::Audio, 0, &cache);
        pipeline.cancel_all();
        assert_eq!(decoder.cancelled.lock().unwrap().len(), 2);
        assert_eq!(pipeline.in_flight(RequestKind::Video), 0);

        let (_, _, completer) = decoder.video.lock().unwrap().remove(0);
        assert!(!completer.complete(Ok(VideoData::default())));
        assert!(pipeline.drain_completed().is_empty());
    }

    #[test]
    fn test_layer_option_is_forwarded() {
        let decoder = Arc::new(ManualDecoder::default());
        let mut pipeline = RequestPipeline::new(decoder.clone(), 24.0, 16);
        let cache = cache_with_window();
        pipeline.set_layer(2);
        pipeline.ensure(RequestKind::Video, 0, &cache);
        let video = decoder.video.lock().unwrap();
        assert_eq!(video[0].1.get(LAYER_OPTION).map(String::as_str), Some("2"));
    }
}
