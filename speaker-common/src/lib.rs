//! # Speaker Common Library
//!
//! Shared code for the speaker mixing controller:
//! - Pipeline identity and lifecycle types
//! - Element event messages
//! - Sample format and downmix parameters
//! - Configuration loading

pub mod config;
pub mod error;
pub mod events;
pub mod format;
pub mod state;

pub use error::{Error, Result};
pub use events::{
    Completion, ElementError, ElementId, ElementKind, ElementStatus, EventCommand, EventMessage,
    PeripheralStatus, SourceKind,
};
pub use format::{DownmixGain, SampleFormat};
pub use state::{PipelineIndex, PipelineState};
