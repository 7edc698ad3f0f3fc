//! SDXL GGUF Core - Stage orchestration for SDXL checkpoint to GGUF conversion.
//!
//! This crate turns a single-file SDXL checkpoint into quantized GGUF UNet
//! files in three stages: component extraction, conversion to a baseline
//! F16 GGUF, and quantization. Conversion and quantization are performed by
//! an external llama.cpp toolchain that the crate can provision and build.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sdxl_gguf_core::{
//!     HttpFetcher, PipelineOrchestrator, QuantVariant, RunConfig, SystemRunner,
//!     ToolchainSettings,
//! };
//!
//! #[tokio::main]
//! async fn main() -> sdxl_gguf_core::Result<()> {
//!     let orchestrator = PipelineOrchestrator::new(
//!         ToolchainSettings::default(),
//!         Arc::new(SystemRunner),
//!         Arc::new(HttpFetcher::new()?),
//!     );
//!
//!     let config = RunConfig::new("./output")
//!         .with_model_path("./sd_xl_base_1.0.safetensors")
//!         .with_variants(QuantVariant::ALL.to_vec());
//!     let report = orchestrator.run(&config).await?;
//!
//!     for artifact in report.quantized() {
//!         println!("{} ({} bytes)", artifact.path.display(), artifact.size);
//!     }
//!     Ok(())
//! }
//! ```

pub mod artifact;
pub mod config;
pub mod conversion;
pub mod error;
pub mod extract;
pub mod network;
pub mod pipeline;
pub mod process;
pub mod toolchain;

// Re-export commonly used types
pub use artifact::{ArtifactPathResolver, ArtifactTarget, Component, Stage, StageArtifact, StageResult};
pub use config::{CivitaiConfig, PathsConfig, ToolchainConfig, ToolchainSettings};
pub use conversion::{ConversionStage, QuantVariant, QuantizationStage};
pub use error::{NotFoundKind, PipelineError, ProvisionStep, Result};
pub use extract::{ComponentExtractor, ExtractedComponents, SafetensorsSplitter};
pub use network::{ArtifactFetcher, CivitaiDownloader, HttpFetcher, ModelDownloader};
pub use pipeline::{ModelSource, PipelineOrchestrator, RunConfig, RunPlan, RunReport, StageReport, StageStatus};
pub use process::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use toolchain::{BuildStatus, ProvisionOutcome, ProvisionWarning, Toolchain, ToolchainProvisioner};
