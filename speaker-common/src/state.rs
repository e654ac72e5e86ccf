//! Pipeline identity and lifecycle types

use serde::{Deserialize, Serialize};

/// Identifies a pipeline: one of the source pipelines or the mix pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineIndex {
    /// Source pipeline (read → decode → raw buffer)
    Source(usize),
    /// Combined mixer + output pipeline
    Mix,
}

impl PipelineIndex {
    pub fn is_mix(&self) -> bool {
        matches!(self, PipelineIndex::Mix)
    }

    /// Source slot number, `None` for the mix pipeline
    pub fn source(&self) -> Option<usize> {
        match self {
            PipelineIndex::Source(index) => Some(*index),
            PipelineIndex::Mix => None,
        }
    }
}

impl std::fmt::Display for PipelineIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineIndex::Source(index) => write!(f, "source[{}]", index),
            PipelineIndex::Mix => write!(f, "mix"),
        }
    }
}

/// Lifecycle state shared by source and mix pipelines
///
/// `Init → Running → {Paused ⇄ Running} → Finished | Stopped → Init`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[repr(u8)]
pub enum PipelineState {
    /// Idle, ready to start
    Init = 0,
    /// Actively producing samples
    Running = 1,
    /// Suspended, resumable
    Paused = 2,
    /// Reached end of stream (gracefully or with an error)
    Finished = 3,
    /// Halted by command, pending reset
    Stopped = 4,
}

impl PipelineState {
    /// States from which `play` is accepted
    pub fn can_start(&self) -> bool {
        matches!(self, PipelineState::Init | PipelineState::Stopped)
    }

    /// States from which `stop` is accepted
    pub fn can_stop(&self) -> bool {
        matches!(self, PipelineState::Running | PipelineState::Paused)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`PipelineState::as_u8`]; unknown values map to `Init`
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PipelineState::Running,
            2 => PipelineState::Paused,
            3 => PipelineState::Finished,
            4 => PipelineState::Stopped,
            _ => PipelineState::Init,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Init => write!(f, "Init"),
            PipelineState::Running => write!(f, "Running"),
            PipelineState::Paused => write!(f, "Paused"),
            PipelineState::Finished => write!(f, "Finished"),
            PipelineState::Stopped => write!(f, "Stopped"),
        }
    }
}
