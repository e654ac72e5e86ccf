//! Multi-source mixer
//!
//! Combines the raw buffers of every source pipeline into one stream at a
//! fixed destination format.
//!
//! **Format table:** one slot per source holding the format that source's
//! samples are in. Slots are written only by the control plane
//! ([`Mixer::update_source_format`]) and read lock-free by the mix task.
//!
//! **Per-chunk processing (per source):**
//! 1. Take whole frames from the raw buffer (never waits; missing audio is silence)
//! 2. Remix to the destination channel count
//! 3. Resample to the destination rate
//! 4. Scale by the downmix gain ramp
//! 5. Sum, then clamp to [-1.0, 1.0]

use crate::audio::raw_buffer::RawBuffer;
use crate::audio::remix::remix;
use crate::audio::resampler::{fit_to_frames, StreamResampler};
use crate::error::{Error, Result};
use speaker_common::{DownmixGain, SampleFormat};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Format and ramp state for one source, shared with the mix task
#[derive(Debug)]
struct SourceSlot {
    format: AtomicU64,
    /// Set when the source (re)starts; the mix task restarts the gain ramp
    restart: AtomicBool,
}

impl SourceSlot {
    fn new(format: SampleFormat) -> Self {
        Self {
            format: AtomicU64::new(format.to_bits()),
            restart: AtomicBool::new(true),
        }
    }

    fn format(&self) -> SampleFormat {
        SampleFormat::from_bits(self.format.load(Ordering::Acquire))
    }
}

/// Mixer configuration and per-source format table
pub struct Mixer {
    destination: SampleFormat,
    downmix: DownmixGain,
    chunk_ms: u64,
    slots: Vec<SourceSlot>,
    buffers: Vec<Arc<RawBuffer>>,
}

impl Mixer {
    /// One-time setup
    ///
    /// # Arguments
    /// - `buffers`: Raw buffer of every source pipeline, by index
    /// - `source_format`: Format assumed for each source until it reports
    /// - `downmix`: Gain ramp applied to every source
    /// - `destination`: Output format
    /// - `chunk_ms`: Duration of one mixed chunk
    pub fn configure(
        buffers: Vec<Arc<RawBuffer>>,
        source_format: SampleFormat,
        downmix: DownmixGain,
        destination: SampleFormat,
        chunk_ms: u64,
    ) -> Result<Self> {
        if buffers.is_empty() {
            return Err(Error::Config("mixer needs at least one source".to_string()));
        }
        source_format
            .validate()
            .map_err(|e| Error::Config(format!("source format {}: {}", source_format, e)))?;
        destination
            .validate()
            .map_err(|e| Error::Config(format!("destination format {}: {}", destination, e)))?;
        if chunk_ms == 0 {
            return Err(Error::Config("chunk duration must be non-zero".to_string()));
        }

        debug!(
            "Mixer configured: {} sources, destination {}, {}ms chunks",
            buffers.len(),
            destination,
            chunk_ms
        );

        Ok(Self {
            destination,
            downmix,
            chunk_ms,
            slots: buffers.iter().map(|_| SourceSlot::new(source_format)).collect(),
            buffers,
        })
    }

    pub fn destination(&self) -> SampleFormat {
        self.destination
    }

    pub fn downmix(&self) -> DownmixGain {
        self.downmix
    }

    pub fn chunk_ms(&self) -> u64 {
        self.chunk_ms
    }

    pub fn source_count(&self) -> usize {
        self.slots.len()
    }

    /// Frames in one mixed chunk
    pub fn chunk_frames(&self) -> usize {
        self.destination.frames_for_ms(self.chunk_ms).max(1)
    }

    /// Replace the format of source `index`; other slots are untouched
    pub fn update_source_format(&self, index: usize, format: SampleFormat) -> Result<()> {
        let slot = self
            .slots
            .get(index)
            .ok_or_else(|| Error::Config(format!("no mixer slot for source {}", index)))?;
        format
            .validate()
            .map_err(|e| Error::Config(format!("source {} format {}: {}", index, format, e)))?;

        let previous = SampleFormat::from_bits(slot.format.swap(format.to_bits(), Ordering::AcqRel));
        if previous != format {
            debug!("Mixer slot {}: {} -> {}", index, previous, format);
        }
        Ok(())
    }

    pub fn source_format(&self, index: usize) -> Option<SampleFormat> {
        self.slots.get(index).map(SourceSlot::format)
    }

    /// Restart the downmix ramp for source `index` at its next samples
    pub fn restart_source(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            slot.restart.store(true, Ordering::Release);
        }
    }
}

/// Per-source state owned by the mix task
struct SlotState {
    resampler: Option<StreamResampler>,
    /// Milliseconds of audio mixed since the ramp restarted
    elapsed_ms: u64,
    scratch: Vec<f32>,
}

/// Mix task state: turns the shared [`Mixer`] into output chunks
pub struct MixerCore {
    mixer: Arc<Mixer>,
    slots: Vec<SlotState>,
    frames: usize,
}

impl MixerCore {
    pub fn new(mixer: Arc<Mixer>) -> Self {
        let slots = (0..mixer.source_count())
            .map(|_| SlotState {
                resampler: None,
                elapsed_ms: 0,
                scratch: Vec::new(),
            })
            .collect();
        let frames = mixer.chunk_frames();

        Self {
            mixer,
            slots,
            frames,
        }
    }

    /// Produce the next interleaved chunk in the destination format
    pub fn mix_chunk(&mut self) -> Vec<f32> {
        let destination = self.mixer.destination;
        let mut output = vec![0.0f32; destination.samples_for_frames(self.frames)];

        for index in 0..self.slots.len() {
            if let Some(contribution) = self.source_chunk(index) {
                for (out, sample) in output.iter_mut().zip(contribution) {
                    *out += sample;
                }
            }
        }

        for sample in output.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        output
    }

    /// One source's contribution, or None if it had nothing buffered
    fn source_chunk(&mut self, index: usize) -> Option<Vec<f32>> {
        let mixer = Arc::clone(&self.mixer);
        let destination = mixer.destination;
        let shared = &mixer.slots[index];
        let buffer = &mixer.buffers[index];
        let format = shared.format();
        let state = &mut self.slots[index];

        if shared.restart.swap(false, Ordering::AcqRel) {
            state.elapsed_ms = 0;
            state.resampler = None;
        }

        let rebuild = state
            .resampler
            .as_ref()
            .map_or(true, |r| !r.matches(format.sample_rate, destination.channels));
        if rebuild {
            match StreamResampler::new(
                format.sample_rate,
                destination.sample_rate,
                destination.channels,
                self.frames,
            ) {
                Ok(resampler) => state.resampler = Some(resampler),
                Err(e) => {
                    warn!("Source {} cannot be mixed at {}: {}", index, format, e);
                    state.resampler = None;
                    return None;
                }
            }
        }
        let resampler = state.resampler.as_mut()?;

        // Whole frames only, so a frame split by a concurrent write is never torn
        let channels = format.channels as usize;
        let wanted = resampler.input_frames() * channels;
        let available = buffer.available();
        let take = wanted.min(available - available % channels);
        if take == 0 {
            trace!("Source {} has nothing buffered", index);
            return None;
        }

        state.scratch.resize(take, 0.0);
        let read = buffer.read(&mut state.scratch[..take]);
        state.scratch.truncate(read - read % channels);

        let remixed = remix(&state.scratch, format.channels, destination.channels);
        let mut samples = match resampler.process(&remixed) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Source {} resampling failed: {}", index, e);
                return None;
            }
        };
        fit_to_frames(&mut samples, destination.channels, self.frames);

        let gain = mixer.downmix.linear_at(state.elapsed_ms);
        state.elapsed_ms += mixer.chunk_ms;
        if gain != 1.0 {
            for sample in samples.iter_mut() {
                *sample *= gain;
            }
        }

        Some(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MONO_8K: SampleFormat = SampleFormat::new(8000, 1, 16);

    fn mixer_with(sources: usize, downmix: DownmixGain) -> (Arc<Mixer>, Vec<Arc<RawBuffer>>) {
        let buffers: Vec<_> = (0..sources).map(|_| Arc::new(RawBuffer::new(4096))).collect();
        let mixer = Mixer::configure(buffers.clone(), MONO_8K, downmix, MONO_8K, 10).unwrap();
        (Arc::new(mixer), buffers)
    }

    #[test]
    fn test_configure_rejects_bad_setup() {
        let buffer = vec![Arc::new(RawBuffer::new(16))];
        assert!(Mixer::configure(vec![], MONO_8K, DownmixGain::default(), MONO_8K, 10).is_err());
        assert!(Mixer::configure(
            buffer.clone(),
            MONO_8K,
            DownmixGain::default(),
            SampleFormat::new(0, 1, 16),
            10
        )
        .is_err());
        assert!(Mixer::configure(buffer, MONO_8K, DownmixGain::default(), MONO_8K, 0).is_err());
    }

    #[test]
    fn test_update_touches_only_one_slot() {
        let (mixer, _) = mixer_with(3, DownmixGain::default());
        let stereo = SampleFormat::new(22050, 2, 16);

        mixer.update_source_format(1, stereo).unwrap();
        assert_eq!(mixer.source_format(0), Some(MONO_8K));
        assert_eq!(mixer.source_format(1), Some(stereo));
        assert_eq!(mixer.source_format(2), Some(MONO_8K));
    }

    #[test]
    fn test_update_rejects_bad_index_and_format() {
        let (mixer, _) = mixer_with(2, DownmixGain::default());

        let err = mixer.update_source_format(2, MONO_8K).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = mixer
            .update_source_format(0, SampleFormat::new(44100, 2, 12))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(mixer.source_format(0), Some(MONO_8K));
    }

    #[test]
    fn test_empty_buffers_mix_to_silence() {
        let (mixer, _) = mixer_with(2, DownmixGain::default());
        let mut core = MixerCore::new(mixer);

        let chunk = core.mix_chunk();
        assert_eq!(chunk.len(), 80);
        assert!(chunk.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_sources_are_summed_and_clamped() {
        let (mixer, buffers) = mixer_with(2, DownmixGain::default());
        buffers[0].write_blocking(&[0.25; 80], || false);
        buffers[1].write_blocking(&[0.5; 80], || false);

        let mut core = MixerCore::new(Arc::clone(&mixer));
        let chunk = core.mix_chunk();
        assert!(chunk.iter().all(|s| (*s - 0.75).abs() < 1e-6));

        buffers[0].write_blocking(&[0.9; 80], || false);
        buffers[1].write_blocking(&[0.9; 80], || false);
        let chunk = core.mix_chunk();
        assert!(chunk.iter().all(|s| *s == 1.0));
    }

    #[test]
    fn test_short_source_padded_with_silence() {
        let (mixer, buffers) = mixer_with(1, DownmixGain::default());
        buffers[0].write_blocking(&[0.5; 30], || false);

        let mut core = MixerCore::new(mixer);
        let chunk = core.mix_chunk();
        assert_eq!(chunk.len(), 80);
        assert!(chunk[..30].iter().all(|s| *s == 0.5));
        assert!(chunk[30..].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_stereo_source_downmixed_to_mono_destination() {
        let (mixer, buffers) = mixer_with(1, DownmixGain::default());
        mixer
            .update_source_format(0, SampleFormat::new(8000, 2, 16))
            .unwrap();

        let frames: Vec<f32> = (0..80).flat_map(|_| [0.2, 0.6]).collect();
        buffers[0].write_blocking(&frames, || false);

        let mut core = MixerCore::new(mixer);
        let chunk = core.mix_chunk();
        assert_eq!(chunk.len(), 80);
        assert!(chunk.iter().all(|s| (*s - 0.4).abs() < 1e-6));
        assert_eq!(buffers[0].available(), 0);
    }

    #[test]
    fn test_resampled_source_fills_chunk() {
        let (mixer, buffers) = mixer_with(1, DownmixGain::default());
        mixer
            .update_source_format(0, SampleFormat::new(16000, 1, 16))
            .unwrap();
        buffers[0].write_blocking(&[0.5; 320], || false);

        let mut core = MixerCore::new(mixer);
        let chunk = core.mix_chunk();
        assert_eq!(chunk.len(), 80);
        // One chunk at 8kHz consumes 10ms of 16kHz input
        assert_eq!(buffers[0].available(), 160);
    }

    #[test]
    fn test_downmix_ramp_applied_from_restart() {
        let (mixer, buffers) = mixer_with(1, DownmixGain::new(-20.0, 0.0, 20));
        let mut core = MixerCore::new(Arc::clone(&mixer));

        buffers[0].write_blocking(&[1.0; 80], || false);
        let first = core.mix_chunk();
        assert!((first[0] - 0.1).abs() < 1e-4);

        buffers[0].write_blocking(&[1.0; 160], || false);
        core.mix_chunk();
        let settled = core.mix_chunk();
        assert!((settled[0] - 1.0).abs() < 1e-6);

        mixer.restart_source(0);
        buffers[0].write_blocking(&[1.0; 80], || false);
        let restarted = core.mix_chunk();
        assert!((restarted[0] - 0.1).abs() < 1e-4);
    }
}
