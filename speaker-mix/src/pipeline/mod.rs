//! Source pipelines, the mixer and the mix pipeline

pub mod element;
pub mod mix;
pub mod mixer;
pub mod sink;
pub mod source;

pub use mix::{MixCommand, MixPipeline};
pub use mixer::Mixer;
pub use sink::VolumeControl;
pub use source::SourcePipeline;
