//! Output transport interface
//!
//! The output sink hands gain-adjusted, interleaved samples in the mixer's
//! destination format to an [`OutputTransport`]. The hardware path is
//! [`crate::audio::output::CpalTransport`]; the transports here serve
//! headless runs and tests.

use crate::error::Result;
use speaker_common::SampleFormat;
use std::sync::{Arc, Mutex};

/// Destination for the combined stream
pub trait OutputTransport: Send + 'static {
    /// Prepare the transport for `format`; called once before any write
    fn configure(&mut self, format: SampleFormat) -> Result<()>;

    /// Offer samples; returns how many were accepted
    ///
    /// A return value smaller than `samples.len()` means the transport is
    /// full and the caller should retry the remainder later.
    fn write(&mut self, samples: &[f32]) -> Result<usize>;

    /// Discard anything queued but not yet played
    fn clear(&mut self) {}

    /// Release the device; called once at terminate
    fn close(&mut self) {}
}

impl OutputTransport for Box<dyn OutputTransport> {
    fn configure(&mut self, format: SampleFormat) -> Result<()> {
        (**self).configure(format)
    }

    fn write(&mut self, samples: &[f32]) -> Result<usize> {
        (**self).write(samples)
    }

    fn clear(&mut self) {
        (**self).clear()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Transport that accepts and discards everything
#[derive(Debug, Default)]
pub struct NullTransport {
    written: u64,
}

impl NullTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples accepted so far
    pub fn written(&self) -> u64 {
        self.written
    }
}

impl OutputTransport for NullTransport {
    fn configure(&mut self, _format: SampleFormat) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, samples: &[f32]) -> Result<usize> {
        self.written += samples.len() as u64;
        Ok(samples.len())
    }
}

/// Shared view of what a [`CaptureTransport`] has received
#[derive(Debug, Clone, Default)]
pub struct CaptureHandle {
    inner: Arc<Mutex<CaptureState>>,
}

#[derive(Debug, Default)]
struct CaptureState {
    format: Option<SampleFormat>,
    samples: Vec<f32>,
    clears: usize,
    closed: bool,
}

impl CaptureHandle {
    fn lock(&self) -> std::sync::MutexGuard<'_, CaptureState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Format the transport was configured with
    pub fn format(&self) -> Option<SampleFormat> {
        self.lock().format
    }

    /// Total samples received
    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the last `count` samples received
    pub fn tail(&self, count: usize) -> Vec<f32> {
        let state = self.lock();
        let start = state.samples.len().saturating_sub(count);
        state.samples[start..].to_vec()
    }

    /// Peak absolute amplitude of the last `count` samples
    pub fn tail_peak(&self, count: usize) -> f32 {
        self.tail(count).iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
    }

    /// Number of `clear()` calls observed
    pub fn clears(&self) -> usize {
        self.lock().clears
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Transport that records every sample it receives
///
/// Used by integration tests and diagnostics to inspect the combined output.
#[derive(Debug, Default)]
pub struct CaptureTransport {
    handle: CaptureHandle,
}

impl CaptureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for inspecting captured output from another task
    pub fn handle(&self) -> CaptureHandle {
        self.handle.clone()
    }
}

impl OutputTransport for CaptureTransport {
    fn configure(&mut self, format: SampleFormat) -> Result<()> {
        self.handle.lock().format = Some(format);
        Ok(())
    }

    fn write(&mut self, samples: &[f32]) -> Result<usize> {
        self.handle.lock().samples.extend_from_slice(samples);
        Ok(samples.len())
    }

    fn clear(&mut self) {
        self.handle.lock().clears += 1;
    }

    fn close(&mut self) {
        self.handle.lock().closed = true;
    }
}
