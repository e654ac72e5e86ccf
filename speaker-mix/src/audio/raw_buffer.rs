//! Bounded raw sample buffer between a source pipeline and the mixer
//!
//! The decoder side writes with backpressure: when the buffer is full the
//! writer blocks until the mixer drains samples or the run is cancelled.
//! The mixer side never blocks; it takes whatever is available and treats the
//! rest of its chunk as silence.

use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};

/// Upper bound on one wait for free space; cancellation is checked in between
const SPACE_WAIT: Duration = Duration::from_millis(20);

/// Raw PCM buffer (interleaved f32, normalized to [-1.0, 1.0])
pub struct RawBuffer {
    ring: Mutex<HeapRb<f32>>,
    space: Condvar,
    capacity: usize,

    /// Reads that found fewer samples than requested
    underruns: AtomicU64,
}

impl RawBuffer {
    /// Create a buffer holding up to `capacity` samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        debug!("Creating raw buffer with capacity: {} samples", capacity);

        Self {
            ring: Mutex::new(HeapRb::new(capacity)),
            space: Condvar::new(),
            capacity,
            underruns: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeapRb<f32>> {
        self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write all samples, blocking while the buffer is full
    ///
    /// Returns `false` if `cancelled` reported true before everything was
    /// written; the remainder is dropped.
    pub fn write_blocking<F>(&self, samples: &[f32], cancelled: F) -> bool
    where
        F: Fn() -> bool,
    {
        let mut offset = 0;
        let mut ring = self.lock();

        while offset < samples.len() {
            if cancelled() {
                return false;
            }

            offset += ring.push_slice(&samples[offset..]);

            if offset < samples.len() {
                ring = match self.space.wait_timeout(ring, SPACE_WAIT) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
        }

        true
    }

    /// Pop up to `out.len()` samples; returns how many were copied
    pub fn read(&self, out: &mut [f32]) -> usize {
        let read = self.lock().pop_slice(out);
        self.space.notify_all();

        if read < out.len() {
            self.underruns.fetch_add(1, Ordering::Relaxed);
            trace!("Raw buffer underrun: wanted {}, got {}", out.len(), read);
        }
        read
    }

    /// Samples currently buffered
    pub fn available(&self) -> usize {
        self.lock().occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Drop all buffered samples and wake a blocked writer
    pub fn reset(&self) {
        let dropped = self.lock().clear();
        self.space.notify_all();
        if dropped > 0 {
            debug!("Raw buffer reset, dropped {} samples", dropped);
        }
    }

    /// Wake a writer blocked on free space so it re-checks cancellation
    pub fn wake(&self) {
        self.space.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_write_then_read() {
        let buffer = RawBuffer::new(8);
        assert!(buffer.write_blocking(&[0.1, 0.2, 0.3], || false));
        assert_eq!(buffer.available(), 3);

        let mut out = [0.0; 2];
        assert_eq!(buffer.read(&mut out), 2);
        assert_eq!(out, [0.1, 0.2]);
        assert_eq!(buffer.available(), 1);
    }

    #[test]
    fn test_short_read_counts_underrun() {
        let buffer = RawBuffer::new(8);
        let mut out = [0.0; 4];
        assert_eq!(buffer.read(&mut out), 0);
        assert_eq!(buffer.underruns(), 1);
    }

    #[test]
    fn test_reset_clears_samples() {
        let buffer = RawBuffer::new(8);
        buffer.write_blocking(&[1.0; 6], || false);
        buffer.reset();
        assert_eq!(buffer.available(), 0);
    }

    #[test]
    fn test_writer_blocks_until_reader_drains() {
        let buffer = Arc::new(RawBuffer::new(4));
        let writer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.write_blocking(&[0.5; 10], || false))
        };

        let mut total = 0;
        let mut out = [0.0; 4];
        while total < 10 {
            total += buffer.read(&mut out);
            thread::sleep(Duration::from_millis(1));
        }

        assert!(writer.join().unwrap());
        assert_eq!(total, 10);
    }

    #[test]
    fn test_cancel_releases_blocked_writer() {
        let buffer = Arc::new(RawBuffer::new(4));
        let cancel = Arc::new(AtomicBool::new(false));

        let writer = {
            let buffer = Arc::clone(&buffer);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || {
                buffer.write_blocking(&[0.5; 16], || cancel.load(Ordering::Relaxed))
            })
        };

        thread::sleep(Duration::from_millis(30));
        cancel.store(true, Ordering::Relaxed);
        buffer.wake();

        assert!(!writer.join().unwrap());
        assert_eq!(buffer.available(), 4);
    }
}
