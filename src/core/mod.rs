//! Playback engine: time math, caches, the request pipeline, the play-head
//! clock and the player state machine.
//!
//! Nothing here depends on a UI or a media format; collaborators plug in via
//! the [`io::Timeline`] and [`io::DecodeService`] traits.

pub mod cache;
pub(crate) mod cache_worker;
pub mod clock;
pub mod io;
pub mod observer;
pub mod pattern;
pub mod player;
pub mod requests;
pub(crate) mod state;
pub mod time;
pub mod types;
pub mod workers;

pub use cache::{CacheInfo, CacheStats};
pub use clock::{ManualClock, MonotonicClock, PlaybackClock, SystemClock};
pub use io::{Completer, DecodeRequest, DecodeService, RequestId, RequestPoll, StaticTimeline, Timeline};
pub use observer::{Observable, Subscription};
pub use pattern::{PatternDecoder, PatternOptions, PatternTimeline};
pub use player::{Player, PlayerContext, PlayerObservers};
pub use time::{RationalTime, TimeRange};
pub use types::{AudioData, AudioInfo, IoInfo, LoopMode, Playback, TimeAction, VideoData};
pub use workers::Workers;
