//! GGUF conversion and quantization stages.
//!
//! Both stages drive external tools through a [`CommandRunner`](crate::process::CommandRunner)
//! and only report success once the tool exited cleanly *and* its output
//! file exists.

pub mod convert;
mod output;
pub mod quantize;
pub mod types;

pub use convert::ConversionStage;
pub use quantize::QuantizationStage;
pub use types::QuantVariant;
