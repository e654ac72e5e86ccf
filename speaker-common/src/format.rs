//! Sample format and downmix parameter types
//!
//! A [`SampleFormat`] describes a raw PCM stream: rate, channel count and bit
//! depth. Source pipelines start out with a configured default and switch to
//! the real format once their decoder has inspected the stream header.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Bit depths accepted for raw PCM streams
pub const SUPPORTED_BIT_DEPTHS: [u16; 4] = [8, 16, 24, 32];

/// PCM sample format metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleFormat {
    /// Frames per second
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
    /// Bits per sample as reported by the decoder
    pub bits_per_sample: u16,
}

impl SampleFormat {
    /// 44.1kHz, mono, 16 bit
    pub const DEFAULT: SampleFormat = SampleFormat {
        sample_rate: 44100,
        channels: 1,
        bits_per_sample: 16,
    };

    pub const fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    /// Check the format is usable by the mixer
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::InvalidInput("sample rate must be non-zero".to_string()));
        }
        if self.channels == 0 {
            return Err(Error::InvalidInput("channel count must be non-zero".to_string()));
        }
        if !SUPPORTED_BIT_DEPTHS.contains(&self.bits_per_sample) {
            return Err(Error::InvalidInput(format!(
                "unsupported bit depth {}",
                self.bits_per_sample
            )));
        }
        Ok(())
    }

    /// Number of interleaved samples in `frames` frames
    pub fn samples_for_frames(&self, frames: usize) -> usize {
        frames * self.channels as usize
    }

    /// Number of frames covering `ms` milliseconds (rounded down)
    pub fn frames_for_ms(&self, ms: u64) -> usize {
        (self.sample_rate as u64 * ms / 1000) as usize
    }

    /// Pack into a single word so it can live in an atomic slot
    pub fn to_bits(self) -> u64 {
        ((self.sample_rate as u64) << 32)
            | ((self.channels as u64) << 16)
            | self.bits_per_sample as u64
    }

    /// Inverse of [`SampleFormat::to_bits`]
    pub fn from_bits(bits: u64) -> Self {
        Self {
            sample_rate: (bits >> 32) as u32,
            channels: ((bits >> 16) & 0xFFFF) as u16,
            bits_per_sample: (bits & 0xFFFF) as u16,
        }
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Hz/{}ch/{}bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}

/// Per-source contribution to the combined output
///
/// The mixer ramps linearly from `start_db` to `target_db` over `transit_ms`
/// once the source starts producing samples. `transit_ms == 0` applies the
/// target gain immediately.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DownmixGain {
    pub start_db: f32,
    pub target_db: f32,
    pub transit_ms: u32,
}

impl DownmixGain {
    pub fn new(start_db: f32, target_db: f32, transit_ms: u32) -> Self {
        Self {
            start_db,
            target_db,
            transit_ms,
        }
    }

    /// Linear gain `elapsed_ms` after the ramp began
    pub fn linear_at(&self, elapsed_ms: u64) -> f32 {
        if self.transit_ms == 0 || elapsed_ms >= self.transit_ms as u64 {
            return db_to_linear(self.target_db);
        }
        let t = elapsed_ms as f32 / self.transit_ms as f32;
        db_to_linear(self.start_db + (self.target_db - self.start_db) * t)
    }
}

impl Default for DownmixGain {
    fn default() -> Self {
        Self::new(0.0, 0.0, 0)
    }
}

/// Convert decibels to a linear amplitude factor
pub fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}
