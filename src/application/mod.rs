//! Application layer wiring the infrastructure together.

/// Pipeline assembly.
pub mod pipeline;

pub use pipeline::{ImagePipeline, PipelineError};
