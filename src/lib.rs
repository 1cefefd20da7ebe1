//! reelplay - real-time timeline playback engine
//!
//! A [`Player`] turns a time-addressable [`Timeline`] plus an asynchronous
//! [`DecodeService`] into a moving play head with frame and audio caches and
//! A/V synchronized sound output.

pub mod audio;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod paths;

pub use crate::config::{CacheOptions, PlayerOptions, TimerMode};
pub use crate::core::io::{DecodeService, Timeline};
pub use crate::core::player::{Player, PlayerContext};
pub use crate::core::time::{RationalTime, TimeRange};
pub use crate::core::types::{LoopMode, Playback};
pub use crate::error::{AudioError, DecodeError, PlayerError};
