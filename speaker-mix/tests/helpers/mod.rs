//! Test helpers for speaker-mix integration tests
//!
//! - WAV fixture generation (hound) inside a temporary storage root
//! - An [`Orchestrator`] over [`FsStorage`] + [`CaptureTransport`] with short
//!   timeouts, so tests can inspect the mixed output
//! - Event pumping utilities

#![allow(dead_code)]

use hound::{WavSpec, WavWriter};
use speaker_common::config::SystemConfig;
use speaker_common::{PipelineIndex, PipelineState, SampleFormat};
use speaker_mix::audio::{CaptureHandle, CaptureTransport};
use speaker_mix::{FsStorage, Orchestrator};
use std::f32::consts::PI;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Output format used by the test rig: 8 kHz mono keeps captures small
pub const DESTINATION: SampleFormat = SampleFormat::new(8000, 1, 16);

/// A WAV fixture to create under the storage root
pub struct Fixture {
    pub name: &'static str,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_ms: u64,
    pub amplitude: f32,
}

impl Fixture {
    pub fn tone(name: &'static str, sample_rate: u32, channels: u16, duration_ms: u64) -> Self {
        Self {
            name,
            sample_rate,
            channels,
            duration_ms,
            amplitude: 0.5,
        }
    }

    /// URI the file is reachable under
    pub fn uri(&self) -> String {
        format!("/spiffs/{}", self.name)
    }
}

/// Generate a 440 Hz sine WAV (16 bit) with every channel identical
pub fn generate_sine_wav(
    path: &Path,
    sample_rate: u32,
    channels: u16,
    duration_ms: u64,
    amplitude: f32,
) -> Result<(), hound::Error> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;

    let frames = sample_rate as u64 * duration_ms / 1000;
    for n in 0..frames {
        let t = n as f32 / sample_rate as f32;
        let value = (2.0 * PI * 440.0 * t).sin() * amplitude;
        let sample = (value * i16::MAX as f32) as i16;
        for _ in 0..channels {
            writer.write_sample(sample)?;
        }
    }

    writer.finalize()
}

/// Configuration with short poll and mount timeouts
pub fn test_config(root: &Path) -> SystemConfig {
    let mut config = SystemConfig::default();
    config.poll_timeout_ms = 20;
    config.storage.root = root.to_path_buf();
    config.storage.retry_interval_ms = 1;
    config.storage.max_mount_attempts = 3;
    config.mixer.default_source = DESTINATION;
    config.mixer.destination = DESTINATION;
    config.mixer.chunk_ms = 10;
    config.buffers.raw_buffer_ms = 250;
    config
}

/// An initialized orchestrator plus everything it plays from and into
pub struct TestRig {
    pub dir: TempDir,
    pub orchestrator: Orchestrator,
    pub output: CaptureHandle,
}

impl TestRig {
    /// Create the fixtures and initialize an orchestrator over them
    pub async fn new(fixtures: &[Fixture]) -> Self {
        let dir = TempDir::new().expect("tempdir");
        for f in fixtures {
            generate_sine_wav(
                &dir.path().join(f.name),
                f.sample_rate,
                f.channels,
                f.duration_ms,
                f.amplitude,
            )
            .expect("write fixture");
        }

        let config = test_config(dir.path());
        let storage = Arc::new(FsStorage::from_config(&config.storage));
        let transport = CaptureTransport::new();
        let output = transport.handle();

        let orchestrator = Orchestrator::initialize(config, storage, Box::new(transport))
            .await
            .expect("initialize");

        Self {
            dir,
            orchestrator,
            output,
        }
    }

    pub fn state(&self, index: PipelineIndex) -> PipelineState {
        self.orchestrator.get_state(index).expect("get_state")
    }

    /// Call `handle_events` until `done` holds or `timeout` passes
    pub async fn pump_until<F>(&mut self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(&Orchestrator) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            self.orchestrator.handle_events().await.expect("fatal event");
            if done(&self.orchestrator) {
                return true;
            }
        }
        false
    }

    /// Call `handle_events` for `duration`
    pub async fn pump_for(&mut self, duration: Duration) {
        self.pump_until(duration, |_| false).await;
    }

    pub async fn terminate(mut self) {
        self.orchestrator.terminate().await;
    }
}
