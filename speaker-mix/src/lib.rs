//! # Speaker Mix Library (speaker-mix)
//!
//! Concurrent decode-and-mix playback of several audio sources into one
//! output stream.
//!
//! **Architecture:** N source pipelines (storage read → symphonia decode →
//! raw buffer) feed a mixer task (rubato resampling, downmix gain, sum),
//! which hands chunks over a bounded channel to an output sink (volume gain →
//! cpal transport). An [`Orchestrator`] drives every pipeline through its
//! lifecycle in response to commands and element events.

pub mod audio;
pub mod error;
pub mod event_bus;
pub mod orchestrator;
pub mod pipeline;
pub mod storage;

pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
pub use storage::{FsStorage, Storage};
