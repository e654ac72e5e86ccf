//! Audio resampling using rubato
//!
//! Converts a source stream chunk-by-chunk to the mixer's destination rate.
//! One [`StreamResampler`] lives per source slot for the duration of a mix
//! run and is rebuilt whenever that source reports a different format.

use crate::error::{Error, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use tracing::debug;

/// Chunked resampler for one interleaved stream
pub struct StreamResampler {
    /// None when input and output rates match (pass-through)
    inner: Option<FastFixedIn<f32>>,
    input_rate: u32,
    output_rate: u32,
    channels: u16,
    input_frames: usize,
}

impl StreamResampler {
    /// Create a resampler producing roughly `output_frames` frames per call
    ///
    /// # Arguments
    /// - `input_rate`: Source sample rate
    /// - `output_rate`: Destination sample rate
    /// - `channels`: Interleaved channel count of the stream being converted
    /// - `output_frames`: Frames the mixer needs per chunk
    pub fn new(input_rate: u32, output_rate: u32, channels: u16, output_frames: usize) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 || channels == 0 || output_frames == 0 {
            return Err(Error::Config(format!(
                "Invalid resampler parameters: {}Hz -> {}Hz, {} channels, {} frames",
                input_rate, output_rate, channels, output_frames
            )));
        }

        let input_frames =
            ((output_frames as u64 * input_rate as u64).div_ceil(output_rate as u64)) as usize;

        let inner = if input_rate == output_rate {
            None
        } else {
            debug!(
                "Creating resampler {}Hz -> {}Hz ({} channels, {} input frames per chunk)",
                input_rate, output_rate, channels, input_frames
            );
            Some(
                FastFixedIn::<f32>::new(
                    output_rate as f64 / input_rate as f64,
                    1.0, // max_relative_ratio (no runtime changes)
                    PolynomialDegree::Cubic,
                    input_frames,
                    channels as usize,
                )
                .map_err(|e| Error::Config(format!("Failed to create resampler: {}", e)))?,
            )
        };

        Ok(Self {
            inner,
            input_rate,
            output_rate,
            channels,
            input_frames,
        })
    }

    /// Input frames consumed per call
    pub fn input_frames(&self) -> usize {
        self.input_frames
    }

    /// Whether this resampler can be reused for a stream in the given format
    pub fn matches(&self, input_rate: u32, channels: u16) -> bool {
        self.input_rate == input_rate && self.channels == channels
    }

    /// Resample one chunk of exactly `input_frames()` interleaved frames
    ///
    /// Short input is zero-padded. Output is interleaved at the output rate.
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>> {
        let expected = self.input_frames * self.channels as usize;
        let mut padded;
        let input = if interleaved.len() < expected {
            padded = interleaved.to_vec();
            padded.resize(expected, 0.0);
            &padded[..]
        } else {
            &interleaved[..expected]
        };

        let Some(resampler) = self.inner.as_mut() else {
            return Ok(input.to_vec());
        };

        let planar_input = deinterleave(input, self.channels);
        let planar_output = resampler
            .process(&planar_input, None)
            .map_err(|e| Error::Decode(format!("Resampling failed: {}", e)))?;

        Ok(interleave(planar_output))
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }
}

/// Pad with silence or truncate so `samples` holds exactly `frames` frames
pub fn fit_to_frames(samples: &mut Vec<f32>, channels: u16, frames: usize) {
    samples.resize(frames * channels as usize, 0.0);
}

/// Convert interleaved samples to planar format.
///
/// Input:  [L, R, L, R, L, R, ...]
/// Output: [[L, L, L, ...], [R, R, R, ...]]
fn deinterleave(samples: &[f32], channels: u16) -> Vec<Vec<f32>> {
    let num_channels = channels as usize;
    let num_frames = samples.len() / num_channels;

    let mut planar = vec![Vec::with_capacity(num_frames); num_channels];

    for frame in samples.chunks_exact(num_channels) {
        for (ch_idx, sample) in frame.iter().enumerate() {
            planar[ch_idx].push(*sample);
        }
    }

    planar
}

/// Convert planar samples to interleaved format.
///
/// Input:  [[L, L, L, ...], [R, R, R, ...]]
/// Output: [L, R, L, R, L, R, ...]
fn interleave(planar: Vec<Vec<f32>>) -> Vec<f32> {
    if planar.is_empty() {
        return Vec::new();
    }

    let num_channels = planar.len();
    let num_frames = planar[0].len();
    let mut interleaved = Vec::with_capacity(num_frames * num_channels);

    for frame_idx in 0..num_frames {
        for channel in &planar {
            interleaved.push(channel[frame_idx]);
        }
    }

    interleaved
}
