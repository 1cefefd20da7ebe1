//! Streaming resampler from the timeline's audio format to the device format.
//!
//! Wraps rubato's `FastFixedIn`, which consumes fixed-size chunks. Arbitrary
//! input lengths are staged until a full chunk is available, so output lags
//! input by up to one chunk. Channel counts are adapted by repeating source
//! channels (`out[c] = in[c % in_channels]`).

use log::debug;
use rubato::{FastFixedIn, PolynomialDegree, Resampler as _};

use crate::core::types::AudioInfo;
use crate::error::AudioError;

/// Input frames per resampler chunk.
const CHUNK_FRAMES: usize = 256;

pub struct AudioResampler {
    input: AudioInfo,
    output: AudioInfo,
    /// `None` when sample rates match.
    inner: Option<FastFixedIn<f32>>,
    staging: Vec<Vec<f32>>,
    chunk_in: Vec<Vec<f32>>,
    chunk_out: Vec<Vec<f32>>,
    out: Vec<f32>,
}

impl AudioResampler {
    pub fn new(input: AudioInfo, output: AudioInfo) -> Result<Self, AudioError> {
        if !input.is_valid() || !output.is_valid() {
            return Err(AudioError::UnsupportedFormat(format!(
                "{:?} -> {:?}",
                input, output
            )));
        }
        let in_channels = input.channels as usize;
        let (inner, chunk_out) = if input.sample_rate == output.sample_rate {
            (None, Vec::new())
        } else {
            let resampler = FastFixedIn::<f32>::new(
                output.sample_rate as f64 / input.sample_rate as f64,
                1.0,
                PolynomialDegree::Septic,
                CHUNK_FRAMES,
                in_channels,
            )
            .map_err(|e| AudioError::Resample(format!("Failed to create resampler: {}", e)))?;
            let chunk_out = resampler.output_buffer_allocate(true);
            (Some(resampler), chunk_out)
        };
        debug!(
            "Audio resampler {}Hz/{}ch -> {}Hz/{}ch{}",
            input.sample_rate,
            input.channels,
            output.sample_rate,
            output.channels,
            if inner.is_none() { " (passthrough)" } else { "" }
        );
        Ok(Self {
            input,
            output,
            inner,
            staging: vec![Vec::with_capacity(CHUNK_FRAMES * 2); in_channels],
            chunk_in: vec![vec![0.0; CHUNK_FRAMES]; in_channels],
            chunk_out,
            out: Vec::new(),
        })
    }

    pub fn matches(&self, input: AudioInfo, output: AudioInfo) -> bool {
        self.input == input && self.output == output
    }

    /// Feeds interleaved input frames and returns whatever interleaved output
    /// is ready. The returned slice is valid until the next call.
    pub fn process(&mut self, input: &[f32]) -> Result<&[f32], AudioError> {
        let in_channels = self.input.channels as usize;
        let out_channels = self.output.channels as usize;
        self.out.clear();

        let Some(resampler) = self.inner.as_mut() else {
            for frame in input.chunks_exact(in_channels) {
                for c in 0..out_channels {
                    self.out.push(frame[c % in_channels]);
                }
            }
            return Ok(&self.out);
        };

        for frame in input.chunks_exact(in_channels) {
            for (c, sample) in frame.iter().enumerate() {
                self.staging[c].push(*sample);
            }
        }

        while self.staging[0].len() >= CHUNK_FRAMES {
            for (chunk, staged) in self.chunk_in.iter_mut().zip(self.staging.iter_mut()) {
                chunk.copy_from_slice(&staged[..CHUNK_FRAMES]);
                staged.drain(..CHUNK_FRAMES);
            }
            let (_, produced) = resampler
                .process_into_buffer(&self.chunk_in, &mut self.chunk_out, None)
                .map_err(|e| AudioError::Resample(e.to_string()))?;
            for i in 0..produced {
                for c in 0..out_channels {
                    self.out.push(self.chunk_out[c % in_channels][i]);
                }
            }
        }
        Ok(&self.out)
    }

    /// Drops staged input and filter history.
    pub fn reset(&mut self) {
        if let Some(resampler) = self.inner.as_mut() {
            resampler.reset();
        }
        for staged in &mut self.staging {
            staged.clear();
        }
        self.out.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(channels: u16, sample_rate: u32) -> AudioInfo {
        AudioInfo {
            channels,
            sample_rate,
        }
    }

    #[test]
    fn test_passthrough_same_format() {
        let mut r = AudioResampler::new(info(2, 48000), info(2, 48000)).unwrap();
        let input = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(r.process(&input).unwrap(), &input[..]);
    }

    #[test]
    fn test_mono_to_stereo_repeats_channel() {
        let mut r = AudioResampler::new(info(1, 44100), info(2, 44100)).unwrap();
        assert_eq!(r.process(&[0.5, -0.5]).unwrap(), &[0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn test_rate_conversion_output_length() {
        let mut r = AudioResampler::new(info(2, 48000), info(2, 44100)).unwrap();
        let frames = 4800;
        let input: Vec<f32> = (0..frames)
            .flat_map(|i| {
                let s = (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48000.0).sin() * 0.5;
                [s, s]
            })
            .collect();
        let out_frames = r.process(&input).unwrap().len() / 2;
        let expected = frames as f64 * 44100.0 / 48000.0;
        // Up to one chunk is held back in staging
        assert!(
            (out_frames as f64) <= expected + 10.0 && (out_frames as f64) >= expected - 300.0,
            "expected ~{}, got {}",
            expected,
            out_frames
        );
    }

    #[test]
    fn test_small_pushes_are_staged() {
        let mut r = AudioResampler::new(info(1, 48000), info(1, 44100)).unwrap();
        assert!(r.process(&[0.0; 100]).unwrap().is_empty());
        assert!(!r.process(&[0.0; 200]).unwrap().is_empty());
        r.reset();
        assert!(r.process(&[0.0; 100]).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_format_rejected() {
        assert!(AudioResampler::new(info(0, 48000), info(2, 48000)).is_err());
    }
}
