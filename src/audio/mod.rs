//! Real-time audio output: device seam, resampling and the render callback.

pub mod device;
pub mod engine;
pub mod resample;

pub use device::{AudioCallback, AudioDevice, AudioStream, CpalDevice, ErrorCallback, StreamClock};
pub use engine::AudioEngine;
pub use resample::AudioResampler;
