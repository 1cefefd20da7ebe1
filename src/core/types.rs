//! Playback enums and the decoded media payloads that flow through the caches.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::time::RationalTime;

/// Play head direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Playback {
    #[default]
    Stop,
    Forward,
    Reverse,
}

/// What happens when the play head reaches the in/out boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LoopMode {
    #[default]
    Loop,
    Once,
    PingPong,
}

/// Which side of the current time the cache window favors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CacheDirection {
    #[default]
    Forward,
    Reverse,
}

impl From<Playback> for CacheDirection {
    fn from(playback: Playback) -> Self {
        match playback {
            Playback::Reverse => CacheDirection::Reverse,
            Playback::Stop | Playback::Forward => CacheDirection::Forward,
        }
    }
}

/// Jump targets for [`crate::Player::time_action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeAction {
    Start,
    End,
    FramePrev,
    FrameNext,
}

/// Options handed to the decode collaborator with every request.
pub type IoOptions = BTreeMap<String, String>;

/// Option key carrying the selected video layer.
pub const LAYER_OPTION: &str = "Layer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
}

/// Decoded RGBA8 frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub info: ImageInfo,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Transition {
    #[default]
    None,
    Dissolve,
}

/// One composited layer; `image_b` and `transition_value` describe a crossfade.
#[derive(Debug, Clone, Default)]
pub struct VideoLayer {
    pub image: Option<Arc<Image>>,
    pub image_b: Option<Arc<Image>>,
    pub transition: Transition,
    pub transition_value: f32,
}

fn same_image(a: &Option<Arc<Image>>, b: &Option<Arc<Image>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

// Images compare by identity: a re-decoded frame is a new frame.
impl PartialEq for VideoLayer {
    fn eq(&self, other: &Self) -> bool {
        same_image(&self.image, &other.image)
            && same_image(&self.image_b, &other.image_b)
            && self.transition == other.transition
            && self.transition_value == other.transition_value
    }
}

/// Everything needed to draw one timeline instant.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VideoData {
    pub time: RationalTime,
    pub layers: Vec<VideoLayer>,
}

/// Native audio format. Samples are interleaved `f32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AudioInfo {
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioInfo {
    pub fn is_valid(&self) -> bool {
        self.channels > 0 && self.sample_rate > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub info: AudioInfo,
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn silence(info: AudioInfo, frames: usize) -> Self {
        Self {
            info,
            samples: vec![0.0; frames * info.channels as usize],
        }
    }

    pub fn frames(&self) -> usize {
        if self.info.channels == 0 {
            0
        } else {
            self.samples.len() / self.info.channels as usize
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AudioLayer {
    pub audio: Option<Arc<AudioBuffer>>,
}

impl PartialEq for AudioLayer {
    fn eq(&self, other: &Self) -> bool {
        match (&self.audio, &other.audio) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

/// One second of timeline audio; overlapping clips are separate layers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioData {
    pub seconds: i64,
    pub layers: Vec<AudioLayer>,
}

/// Formats the timeline produces. An empty `video` list means no video.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IoInfo {
    pub video: Vec<ImageInfo>,
    pub audio: Option<AudioInfo>,
}

impl IoInfo {
    pub fn has_video(&self) -> bool {
        !self.video.is_empty()
    }

    pub fn audio(&self) -> Option<AudioInfo> {
        self.audio.filter(|a| a.is_valid())
    }
}
