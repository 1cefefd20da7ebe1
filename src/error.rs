//! Error types for the playback engine.
//!
//! Decode failures are per-request and never fatal; device failures leave the
//! player without audio; construction errors reject malformed input up front.

use thiserror::Error;

/// Failure reported by the decode collaborator for a single request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Decode failed: {0}")]
    Failed(String),

    #[error("Time is outside the timeline: {0}")]
    OutOfRange(String),

    #[error("Request cancelled")]
    Cancelled,
}

/// Audio device and stream failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    #[error("No audio output device available")]
    NoDevice,

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to open audio stream: {0}")]
    Open(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Resampler error: {0}")]
    Resample(String),
}

/// Construction-time validation failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlayerError {
    #[error("Invalid timeline range: {0}")]
    InvalidTimeRange(String),

    #[error("Invalid player options: {0}")]
    InvalidOptions(String),
}
