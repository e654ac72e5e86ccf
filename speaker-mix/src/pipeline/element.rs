//! Shared element state and run control
//!
//! A pipeline's lifecycle state is written by both the control plane (commands)
//! and its worker (natural end of stream). [`StateCell`] keeps it in an atomic
//! so every transition is a compare-and-swap: the first writer wins and the
//! loser observes the state it lost to.

use speaker_common::PipelineState;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Lifecycle state in an atomic cell
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: PipelineState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub fn get(&self) -> PipelineState {
        PipelineState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Unconditional write; only for resets performed after the worker halted
    pub fn set(&self, state: PipelineState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }

    /// Move from `from` to `to`
    ///
    /// Returns the actual state on failure.
    pub fn transition(&self, from: PipelineState, to: PipelineState) -> Result<(), PipelineState> {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(PipelineState::from_u8)
    }

    /// Move to `to` from any state accepted by `allowed`
    ///
    /// Returns the previous state, or the rejected state on failure.
    pub fn transition_from<F>(&self, allowed: F, to: PipelineState) -> Result<PipelineState, PipelineState>
    where
        F: Fn(PipelineState) -> bool,
    {
        let mut current = self.get();
        loop {
            if !allowed(current) {
                return Err(current);
            }
            match self.transition(current, to) {
                Ok(()) => return Ok(current),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Stop and pause signals from the control plane to a worker
#[derive(Debug, Default)]
pub struct RunControl {
    stop: AtomicBool,
    paused: Mutex<bool>,
    wake: Condvar,
}

/// Upper bound on one pause wait; stop is re-checked in between
const PAUSE_WAIT: Duration = Duration::from_millis(50);

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.paused.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _guard = self.lock();
        self.wake.notify_all();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        *self.lock() = true;
    }

    pub fn resume(&self) {
        *self.lock() = false;
        self.wake.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.lock()
    }

    /// Block while paused
    ///
    /// Returns `false` if a stop was requested.
    pub fn wait_while_paused(&self) -> bool {
        let mut paused = self.lock();
        while *paused && !self.stop_requested() {
            paused = match self.wake.wait_timeout(paused, PAUSE_WAIT) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        !self.stop_requested()
    }
}
