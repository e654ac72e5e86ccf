//! Streaming audio decoder using symphonia
//!
//! Decodes an opened source packet-by-packet into interleaved f32 samples.
//! The stream format is only known for certain once the first packet has been
//! decoded, so every chunk carries the format it was decoded with.

use crate::error::{Error, Result};
use speaker_common::SampleFormat;
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// One decoded packet worth of audio
#[derive(Debug, Clone)]
pub struct DecodedChunk {
    /// Interleaved samples normalized to [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Format of `samples`
    pub format: SampleFormat,
}

/// Packet-at-a-time decoder over one opened source
pub struct StreamDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    bits_per_sample: u16,
    sample_buf: Option<SampleBuffer<f32>>,
}

impl StreamDecoder {
    /// Open a file by path (convenience for tools and tests)
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_file(file, path.extension().and_then(|e| e.to_str()))
    }

    /// Probe an already opened file
    ///
    /// # Arguments
    /// - `file`: Source opened by the reader element
    /// - `extension`: Optional file extension used as a format hint
    pub fn from_file(file: File, extension: Option<&str>) -> Result<Self> {
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // Create a hint to help the format registry guess the format
        let mut hint = Hint::new();
        if let Some(ext) = extension {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| Error::Decode(format!("Failed to probe format: {}", e)))?;

        let format = probed.format;

        // Get the default audio track
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode("No audio track found".to_string()))?;

        let track_id = track.id;
        let bits_per_sample = normalize_bit_depth(track.codec_params.bits_per_sample);

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("Failed to create decoder: {}", e)))?;

        debug!(
            "Opened stream: track={}, rate={:?}, channels={:?}, bits={}",
            track_id,
            track.codec_params.sample_rate,
            track.codec_params.channels.map(|c| c.count()),
            bits_per_sample
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            bits_per_sample,
            sample_buf: None,
        })
    }

    /// Decode the next packet
    ///
    /// Returns `Ok(None)` at end of stream. Corrupt packets are skipped with a
    /// warning; unrecoverable read or decode failures are returned as errors.
    pub fn next_chunk(&mut self) -> Result<Option<DecodedChunk>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    debug!("Reached end of stream");
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    debug!("Stream reset required, treating as end of stream");
                    return Ok(None);
                }
                Err(SymphoniaError::IoError(e)) => return Err(Error::Io(e)),
                Err(e) => return Err(Error::Decode(format!("Failed to read packet: {}", e))),
            };

            // Skip packets for other tracks
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(Error::Decode(format!("Decode failed: {}", e))),
            };

            let spec = *decoded.spec();
            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }

            let needs_new_buf = self
                .sample_buf
                .as_ref()
                .map_or(true, |buf| buf.capacity() < decoded.capacity() * spec.channels.count());
            if needs_new_buf {
                self.sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
            }

            let Some(buf) = self.sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            let format = SampleFormat::new(
                spec.rate,
                spec.channels.count() as u16,
                self.bits_per_sample,
            );

            return Ok(Some(DecodedChunk {
                samples: buf.samples().to_vec(),
                format,
            }));
        }
    }
}

/// Map a decoder-reported bit depth onto one the mixer accepts
///
/// Codecs without a fixed depth (MP3, Vorbis, AAC) report none and decode to
/// 16 bit on the reference transport.
fn normalize_bit_depth(bits: Option<u32>) -> u16 {
    match bits {
        Some(b) if b <= 8 => 8,
        Some(b) if b <= 16 => 16,
        Some(b) if b <= 24 => 24,
        Some(_) => 32,
        None => 16,
    }
}
