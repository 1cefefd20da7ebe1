//! Seams to the external collaborators: the timeline being played and the
//! decode service that turns times into frames and one-second audio buffers.
//!
//! Decode requests are one-shot channels. The player holds the
//! [`DecodeRequest`] and polls it without blocking; the decoder holds the
//! matching [`Completer`]. Dropping the request is how cancellation reaches a
//! late completion: the send simply fails and the result is discarded.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicU64, Ordering};

use super::time::{RationalTime, TimeRange};
use super::types::{AudioData, IoInfo, IoOptions, VideoData};
use crate::error::DecodeError;

/// Time-addressable composition played by a [`crate::Player`].
pub trait Timeline: Send + Sync {
    fn time_range(&self) -> TimeRange;

    fn io_info(&self) -> IoInfo;
}

/// Asynchronous decoder. Implementations must not block in `request_*`.
pub trait DecodeService: Send + Sync {
    fn request_video(&self, time: RationalTime, options: &IoOptions) -> DecodeRequest<VideoData>;

    fn request_audio(&self, seconds: i64, options: &IoOptions) -> DecodeRequest<AudioData>;

    /// Best-effort: work already finished may still be delivered.
    fn cancel(&self, ids: &[RequestId]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        RequestId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// State of an outstanding request.
#[derive(Debug)]
pub enum RequestPoll<T> {
    Pending,
    Ready(Result<T, DecodeError>),
    /// The decoder dropped its completer without answering.
    Abandoned,
}

/// Player side of a decode request.
#[derive(Debug)]
pub struct DecodeRequest<T> {
    id: RequestId,
    rx: Receiver<Result<T, DecodeError>>,
}

impl<T> DecodeRequest<T> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn poll(&self) -> RequestPoll<T> {
        match self.rx.try_recv() {
            Ok(result) => RequestPoll::Ready(result),
            Err(TryRecvError::Empty) => RequestPoll::Pending,
            Err(TryRecvError::Disconnected) => RequestPoll::Abandoned,
        }
    }
}

/// Decoder side of a decode request.
#[derive(Debug)]
pub struct Completer<T> {
    id: RequestId,
    tx: Sender<Result<T, DecodeError>>,
}

impl<T> Completer<T> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Delivers the result. Returns false when the requester is gone.
    pub fn complete(self, result: Result<T, DecodeError>) -> bool {
        self.tx.try_send(result).is_ok()
    }
}

/// Creates a linked request/completer pair with a fresh id.
pub fn request_pair<T>() -> (DecodeRequest<T>, Completer<T>) {
    let id = RequestId::next();
    let (tx, rx) = bounded(1);
    (DecodeRequest { id, rx }, Completer { id, tx })
}

/// Fixed-range timeline with no media of its own, for hosts that only need
/// the time base.
#[derive(Debug, Clone)]
pub struct StaticTimeline {
    pub range: TimeRange,
    pub info: IoInfo,
}

impl Timeline for StaticTimeline {
    fn time_range(&self) -> TimeRange {
        self.range
    }

    fn io_info(&self) -> IoInfo {
        self.info.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_pair_delivers_once() {
        let (request, completer) = request_pair::<u32>();
        assert_eq!(request.id(), completer.id());
        assert!(matches!(request.poll(), RequestPoll::Pending));
        assert!(completer.complete(Ok(7)));
        assert!(matches!(request.poll(), RequestPoll::Ready(Ok(7))));
    }

    #[test]
    fn test_dropped_request_rejects_completion() {
        let (request, completer) = request_pair::<u32>();
        drop(request);
        assert!(!completer.complete(Ok(1)));
    }

    #[test]
    fn test_dropped_completer_is_abandoned() {
        let (request, completer) = request_pair::<u32>();
        drop(completer);
        assert!(matches!(request.poll(), RequestPoll::Abandoned));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = RequestId::next();
        let b = RequestId::next();
        assert_ne!(a, b);
    }
}
