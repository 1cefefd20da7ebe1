//! Audio output seam and its `cpal` implementation.
//!
//! The engine only sees interleaved `f32`; the device converts to whatever
//! sample format the hardware wants (f32/i16/u16) and counts delivered frames
//! so the play head can follow the audio clock.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::types::AudioInfo;
use crate::error::AudioError;

/// Fills one interleaved output buffer. Runs on the real-time thread.
pub type AudioCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Receives stream failures after the stream has started.
pub type ErrorCallback = Box<dyn FnMut(AudioError) + Send + 'static>;

#[derive(Debug)]
struct ClockInner {
    frames: AtomicU64,
    sample_rate: u32,
    running: AtomicBool,
}

/// Frames delivered to the device since the last reset. Shared between the
/// stream callback and the play head.
#[derive(Debug, Clone)]
pub struct StreamClock {
    inner: Arc<ClockInner>,
}

impl StreamClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(ClockInner {
                frames: AtomicU64::new(0),
                sample_rate,
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn advance(&self, frames: u64) {
        self.inner.frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.inner.frames.load(Ordering::Relaxed) as f64 / self.inner.sample_rate.max(1) as f64
    }

    pub fn reset_elapsed(&self) {
        self.inner.frames.store(0, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    pub fn set_running(&self, running: bool) {
        self.inner.running.store(running, Ordering::Relaxed);
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }
}

/// An open output stream. Dropping or closing it stops the callback.
pub trait AudioStream {
    fn clock(&self) -> &StreamClock;

    fn close(&mut self);

    fn elapsed_seconds(&self) -> f64 {
        self.clock().elapsed_seconds()
    }

    fn reset_elapsed(&self) {
        self.clock().reset_elapsed()
    }

    fn is_running(&self) -> bool {
        self.clock().is_running()
    }
}

/// Real-time output device.
pub trait AudioDevice {
    /// Format the device would open for a source in `preferred`.
    fn output_info(&self, preferred: &AudioInfo) -> Result<AudioInfo, AudioError>;

    fn open(
        &self,
        format: AudioInfo,
        buffer_frames: u32,
        callback: AudioCallback,
        error_callback: ErrorCallback,
    ) -> Result<Box<dyn AudioStream>, AudioError>;
}

/// Output device backed by `cpal`.
pub struct CpalDevice {
    device: cpal::Device,
    name: String,
}

impl CpalDevice {
    pub fn default_output() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Using default audio device: {}", name);
        Ok(Self { device, name })
    }

    /// Looks up an output device by name, falling back to the default device.
    pub fn by_name(name: &str) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let mut devices = host
            .output_devices()
            .map_err(|e| AudioError::Open(format!("Failed to enumerate devices: {}", e)))?;
        match devices.find(|d| d.name().ok().as_deref() == Some(name)) {
            Some(device) => {
                info!("Found requested audio device: {}", name);
                Ok(Self {
                    device,
                    name: name.to_string(),
                })
            }
            None => {
                warn!("Requested device '{}' not found, falling back to default device", name);
                Self::default_output()
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Supported config matching `format` exactly, if any.
    fn matching_format(&self, format: &AudioInfo) -> Option<SampleFormat> {
        let configs = self.device.supported_output_configs().ok()?;
        let mut matching: Vec<_> = configs
            .filter(|c| {
                c.channels() == format.channels
                    && c.min_sample_rate().0 <= format.sample_rate
                    && c.max_sample_rate().0 >= format.sample_rate
            })
            .map(|c| c.sample_format())
            .collect();
        // Prefer f32, the engine's native sample type
        matching.sort_by_key(|f| *f != SampleFormat::F32);
        matching.into_iter().next()
    }

    fn build<T>(
        &self,
        config: &StreamConfig,
        mut callback: AudioCallback,
        mut error_callback: ErrorCallback,
        clock: StreamClock,
    ) -> Result<cpal::Stream, AudioError>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = config.channels.max(1) as usize;
        let err_clock = clock.clone();
        let mut scratch: Vec<f32> = Vec::new();

        self.device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    if scratch.len() < data.len() {
                        scratch.resize(data.len(), 0.0);
                    }
                    let buffer = &mut scratch[..data.len()];
                    callback(buffer);
                    for (out, &sample) in data.iter_mut().zip(buffer.iter()) {
                        *out = T::from_sample(sample.clamp(-1.0, 1.0));
                    }
                    clock.advance((data.len() / channels) as u64);
                },
                move |err| {
                    error!("Audio stream error: {}", err);
                    err_clock.set_running(false);
                    error_callback(AudioError::Stream(err.to_string()));
                },
                None,
            )
            .map_err(|e| AudioError::Open(format!("Failed to build stream: {}", e)))
    }
}

impl AudioDevice for CpalDevice {
    fn output_info(&self, preferred: &AudioInfo) -> Result<AudioInfo, AudioError> {
        if self.matching_format(preferred).is_some() {
            return Ok(*preferred);
        }
        let default = self
            .device
            .default_output_config()
            .map_err(|e| AudioError::Open(format!("Failed to get default config: {}", e)))?;
        Ok(AudioInfo {
            channels: default.channels(),
            sample_rate: default.sample_rate().0,
        })
    }

    fn open(
        &self,
        format: AudioInfo,
        buffer_frames: u32,
        callback: AudioCallback,
        error_callback: ErrorCallback,
    ) -> Result<Box<dyn AudioStream>, AudioError> {
        let sample_format = match self.matching_format(&format) {
            Some(f) => f,
            None => self
                .device
                .default_output_config()
                .map_err(|e| AudioError::Open(format!("Failed to get default config: {}", e)))?
                .sample_format(),
        };
        let config = StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(buffer_frames),
        };
        debug!(
            "Audio config: sample_rate={}, channels={}, format={:?}, buffer_size={:?}",
            format.sample_rate, format.channels, sample_format, config.buffer_size
        );

        let clock = StreamClock::new(format.sample_rate);
        let stream = match sample_format {
            SampleFormat::F32 => self.build::<f32>(&config, callback, error_callback, clock.clone())?,
            SampleFormat::I16 => self.build::<i16>(&config, callback, error_callback, clock.clone())?,
            SampleFormat::U16 => self.build::<u16>(&config, callback, error_callback, clock.clone())?,
            other => {
                return Err(AudioError::UnsupportedFormat(format!("{:?}", other)));
            }
        };
        stream
            .play()
            .map_err(|e| AudioError::Open(format!("Failed to start stream: {}", e)))?;
        clock.set_running(true);
        info!("Audio stream started on {}", self.name);

        Ok(Box::new(CpalStream {
            stream: Some(stream),
            clock,
        }))
    }
}

struct CpalStream {
    stream: Option<cpal::Stream>,
    clock: StreamClock,
}

impl AudioStream for CpalStream {
    fn clock(&self) -> &StreamClock {
        &self.clock
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("Failed to pause audio stream: {}", e);
            }
            info!("Audio stream closed");
        }
        self.clock.set_running(false);
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.close();
    }
}
