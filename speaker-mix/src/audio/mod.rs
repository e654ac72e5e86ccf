//! Audio building blocks: decoding, buffering, format conversion and output

pub mod decoder;
pub mod output;
pub mod raw_buffer;
pub mod remix;
pub mod resampler;
pub mod transport;

pub use decoder::{DecodedChunk, StreamDecoder};
pub use output::CpalTransport;
pub use raw_buffer::RawBuffer;
pub use transport::{CaptureHandle, CaptureTransport, NullTransport, OutputTransport};
