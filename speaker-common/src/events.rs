//! Element event messages
//!
//! Every pipeline element reports status changes and stream information as
//! [`EventMessage`] values. Messages are produced by element workers and
//! consumed exactly once by the controller that owns the pipelines.

use crate::format::SampleFormat;
use crate::state::PipelineIndex;
use serde::{Deserialize, Serialize};

/// Kind of element inside a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    /// Reads encoded bytes from storage
    Reader,
    /// Decodes encoded bytes to PCM
    Decoder,
    /// Writes decoded PCM into the raw buffer
    RawWriter,
    /// Combines all raw buffers
    Mixer,
    /// Writes the combined stream to the transport
    OutputWriter,
}

impl std::fmt::Display for ElementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementKind::Reader => write!(f, "reader"),
            ElementKind::Decoder => write!(f, "decoder"),
            ElementKind::RawWriter => write!(f, "raw"),
            ElementKind::Mixer => write!(f, "mixer"),
            ElementKind::OutputWriter => write!(f, "output"),
        }
    }
}

/// Identity of one element: which pipeline it belongs to and what it does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementId {
    pub pipeline: PipelineIndex,
    pub kind: ElementKind,
}

impl ElementId {
    pub fn new(pipeline: PipelineIndex, kind: ElementKind) -> Self {
        Self { pipeline, kind }
    }
}

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.pipeline, self.kind)
    }
}

/// Whether a message came from a pipeline element or a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Element,
    Peripheral,
}

/// Failure that ended a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ElementError {
    /// Could not open or read the source
    Io(String),
    /// Stream could not be probed or decoded
    Decode(String),
}

impl std::fmt::Display for ElementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementError::Io(msg) => write!(f, "I/O error: {}", msg),
            ElementError::Decode(msg) => write!(f, "decode error: {}", msg),
        }
    }
}

/// How a run reached `Finished`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// Graceful end of stream
    EndOfStream,
    /// Terminated by a read or decode failure
    Failed(ElementError),
}

impl Completion {
    pub fn is_error(&self) -> bool {
        matches!(self, Completion::Failed(_))
    }
}

/// Status payload of a status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementStatus {
    Running,
    Paused,
    Stopped,
    Finished(Completion),
}

/// Status payload reported by a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeripheralStatus {
    Mounted,
    Unmounted,
}

/// Command carried by a message, together with its payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCommand {
    /// Element state change
    ReportStatus(ElementStatus),
    /// Decoder detected the real stream format
    ReportMusicInfo(SampleFormat),
    /// Peripheral state change
    ReportPeripheral(PeripheralStatus),
}

/// One report travelling over the event bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Element that raised the report
    pub source: ElementId,
    /// Run generation of the pipeline when the report was raised
    pub run: u64,
    pub source_kind: SourceKind,
    pub command: EventCommand,
}

impl EventMessage {
    /// Status report from a pipeline element
    pub fn status(source: ElementId, run: u64, status: ElementStatus) -> Self {
        Self {
            source,
            run,
            source_kind: SourceKind::Element,
            command: EventCommand::ReportStatus(status),
        }
    }

    /// Music info report from a decoder
    pub fn music_info(source: ElementId, run: u64, format: SampleFormat) -> Self {
        Self {
            source,
            run,
            source_kind: SourceKind::Element,
            command: EventCommand::ReportMusicInfo(format),
        }
    }

    /// Report from a peripheral; peripherals are attributed to the mix pipeline
    pub fn peripheral(status: PeripheralStatus) -> Self {
        Self {
            source: ElementId::new(PipelineIndex::Mix, ElementKind::Reader),
            run: 0,
            source_kind: SourceKind::Peripheral,
            command: EventCommand::ReportPeripheral(status),
        }
    }

    /// `Some(completion)` if this is a finished report from an element
    pub fn finished(&self) -> Option<&Completion> {
        match (&self.source_kind, &self.command) {
            (SourceKind::Element, EventCommand::ReportStatus(ElementStatus::Finished(c))) => Some(c),
            _ => None,
        }
    }

    /// `Some(format)` if this is a music info report from a decoder
    pub fn decoded_format(&self) -> Option<SampleFormat> {
        match (&self.source_kind, self.source.kind, &self.command) {
            (SourceKind::Element, ElementKind::Decoder, EventCommand::ReportMusicInfo(format)) => {
                Some(*format)
            }
            _ => None,
        }
    }
}
