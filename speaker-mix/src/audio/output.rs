//! Audio output using cpal
//!
//! Hardware transport for the combined stream. The output sink pushes samples
//! into a lock-free ring buffer; the cpal callback drains it on the audio
//! thread and plays silence on underrun.
//!
//! cpal streams are not `Send` on every host, so the stream is built and owned
//! by a dedicated thread that lives until the transport is closed.

use crate::audio::transport::OutputTransport;
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat as CpalSampleFormat, StreamConfig};
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use speaker_common::SampleFormat;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Ring buffer length in milliseconds of destination audio
const RING_MS: u64 = 200;

/// State shared between the transport and the audio callback
struct CallbackShared {
    /// Set by `clear()`, consumed by the callback
    flush: AtomicBool,
    /// Callback found the ring empty
    underruns: AtomicU64,
    /// Stream error reported by cpal
    error_flag: AtomicBool,
}

/// cpal-backed output transport
pub struct CpalTransport {
    device_name: Option<String>,
    producer: Option<HeapProd<f32>>,
    shared: Arc<CallbackShared>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    stream_thread: Option<JoinHandle<()>>,
}

impl CpalTransport {
    /// Create a transport for the named device (None = default device)
    ///
    /// The device is opened by [`OutputTransport::configure`].
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            producer: None,
            shared: Arc::new(CallbackShared {
                flush: AtomicBool::new(false),
                underruns: AtomicU64::new(0),
                error_flag: AtomicBool::new(false),
            }),
            shutdown_tx: None,
            stream_thread: None,
        }
    }

    /// List available audio output devices
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();

        let devices: Vec<String> = host
            .output_devices()
            .map_err(|e| Error::Output(format!("Failed to enumerate devices: {}", e)))?
            .filter_map(|device| device.name().ok())
            .collect();

        debug!("Found {} output devices", devices.len());
        Ok(devices)
    }

    /// Callback underruns since configure
    pub fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    fn find_device(device_name: Option<&str>) -> Result<Device> {
        let host = cpal::default_host();

        if let Some(name) = device_name {
            let mut devices = host
                .output_devices()
                .map_err(|e| Error::Output(format!("Failed to enumerate devices: {}", e)))?;

            if let Some(dev) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
                info!("Found requested audio device: {}", name);
                return Ok(dev);
            }
            warn!("Requested device '{}' not found, falling back to default device", name);
        }

        let dev = host
            .default_output_device()
            .ok_or_else(|| Error::Output("No default output device found".to_string()))?;
        info!(
            "Using default audio device: {}",
            dev.name().unwrap_or_else(|_| "Unknown".to_string())
        );
        Ok(dev)
    }

    /// Find a device config matching the destination rate and channels
    ///
    /// Prefers f32 samples, accepts i16.
    fn find_config(device: &Device, format: SampleFormat) -> Result<(StreamConfig, CpalSampleFormat)> {
        let rate = cpal::SampleRate(format.sample_rate);
        let supported: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| Error::Output(format!("Failed to get device configs: {}", e)))?
            .filter(|c| {
                c.channels() == format.channels
                    && c.min_sample_rate() <= rate
                    && c.max_sample_rate() >= rate
            })
            .collect();

        for wanted in [CpalSampleFormat::F32, CpalSampleFormat::I16] {
            if let Some(range) = supported.iter().find(|c| c.sample_format() == wanted) {
                return Ok((range.clone().with_sample_rate(rate).config(), wanted));
            }
        }

        Err(Error::Output(format!(
            "Device does not support {} output",
            format
        )))
    }

    fn build_stream(
        device: &Device,
        config: &StreamConfig,
        sample_format: CpalSampleFormat,
        mut consumer: HeapCons<f32>,
        shared: Arc<CallbackShared>,
    ) -> Result<cpal::Stream> {
        let err_shared = Arc::clone(&shared);
        let on_error = move |err| {
            error!("Audio stream error: {}", err);
            err_shared.error_flag.store(true, Ordering::SeqCst);
        };

        let stream = match sample_format {
            CpalSampleFormat::F32 => device.build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if shared.flush.swap(false, Ordering::AcqRel) {
                        consumer.clear();
                    }
                    let read = consumer.pop_slice(data);
                    if read < data.len() {
                        data[read..].fill(0.0);
                        shared.underruns.fetch_add(1, Ordering::Relaxed);
                    }
                },
                on_error,
                None,
            ),
            CpalSampleFormat::I16 => device.build_output_stream(
                config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    if shared.flush.swap(false, Ordering::AcqRel) {
                        consumer.clear();
                    }
                    let mut underrun = false;
                    for out in data.iter_mut() {
                        *out = match consumer.try_pop() {
                            Some(sample) => (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16,
                            None => {
                                underrun = true;
                                0
                            }
                        };
                    }
                    if underrun {
                        shared.underruns.fetch_add(1, Ordering::Relaxed);
                    }
                },
                on_error,
                None,
            ),
            other => {
                return Err(Error::Output(format!("Unsupported sample format: {:?}", other)));
            }
        };

        stream.map_err(|e| Error::Output(format!("Failed to build stream: {}", e)))
    }
}

impl OutputTransport for CpalTransport {
    fn configure(&mut self, format: SampleFormat) -> Result<()> {
        let capacity = format.samples_for_frames(format.frames_for_ms(RING_MS));
        let (producer, consumer) = HeapRb::<f32>::new(capacity.max(1)).split();

        let device_name = self.device_name.clone();
        let shared = Arc::clone(&self.shared);
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name("cpal-output".to_string())
            .spawn(move || {
                let started = Self::find_device(device_name.as_deref()).and_then(|device| {
                    let (config, sample_format) = Self::find_config(&device, format)?;
                    debug!(
                        "Audio config: sample_rate={}, channels={}, format={:?}",
                        config.sample_rate.0, config.channels, sample_format
                    );
                    let stream =
                        Self::build_stream(&device, &config, sample_format, consumer, shared)?;
                    stream
                        .play()
                        .map_err(|e| Error::Output(format!("Failed to start stream: {}", e)))?;
                    Ok(stream)
                });

                match started {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        // Hold the stream until closed
                        let _ = shutdown_rx.recv();
                        drop(stream);
                        debug!("Audio stream closed");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        let started = ready_rx
            .recv()
            .map_err(|_| Error::Output("Audio stream thread exited during startup".to_string()))?;

        match started {
            Ok(()) => {
                info!("Audio stream started at {}", format);
                self.producer = Some(producer);
                self.shutdown_tx = Some(shutdown_tx);
                self.stream_thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                let _ = handle.join();
                Err(e)
            }
        }
    }

    fn write(&mut self, samples: &[f32]) -> Result<usize> {
        if self.shared.error_flag.swap(false, Ordering::SeqCst) {
            warn!("Audio stream reported an error; continuing");
        }
        let producer = self
            .producer
            .as_mut()
            .ok_or_else(|| Error::Output("Transport not configured".to_string()))?;
        Ok(producer.push_slice(samples))
    }

    fn clear(&mut self) {
        self.shared.flush.store(true, Ordering::Release);
    }

    fn close(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.stream_thread.take() {
            if handle.join().is_err() {
                error!("Audio stream thread panicked");
            }
        }
        self.producer = None;
        info!("Audio output closed");
    }
}

impl Drop for CpalTransport {
    fn drop(&mut self) {
        self.close();
    }
}
