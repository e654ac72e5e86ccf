//! Error types for speaker-mix
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use speaker_common::{PipelineIndex, PipelineState};
use thiserror::Error;

/// Main error type for speaker-mix
#[derive(Error, Debug)]
pub enum Error {
    /// Storage, peripheral or output bring-up failure (fatal at startup)
    #[error("Initialization error: {0}")]
    Init(String),

    /// Command not allowed in the pipeline's current state
    #[error("Invalid state for {index}: {state} ({reason})")]
    InvalidState {
        index: PipelineIndex,
        state: PipelineState,
        reason: String,
    },

    /// Source index outside the configured range
    #[error("Invalid pipeline index {0}")]
    InvalidIndex(PipelineIndex),

    /// Audio decoding errors
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed configuration or format update (unrecoverable)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Audio output transport errors
    #[error("Audio output error: {0}")]
    Output(String),

    /// Shared library errors
    #[error(transparent)]
    Common(#[from] speaker_common::Error),
}

impl Error {
    pub fn invalid_state(index: PipelineIndex, state: PipelineState, reason: impl Into<String>) -> Self {
        Error::InvalidState {
            index,
            state,
            reason: reason.into(),
        }
    }

    /// True for errors that must stop the control loop
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Init(_))
    }
}

/// Convenience Result type using speaker-mix Error
pub type Result<T> = std::result::Result<T, Error>;
