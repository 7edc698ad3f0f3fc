//! UNet sub-checkpoint → baseline F16 GGUF.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use super::output::PriorOutput;
use crate::artifact::{absolute, ArtifactPathResolver, ArtifactTarget, Stage, StageArtifact, StageResult};
use crate::config::ToolchainSettings;
use crate::error::NotFoundKind;
use crate::process::{CommandRunner, CommandSpec};
use crate::toolchain::Toolchain;
use crate::{PipelineError, Result};

/// Runs the toolchain's conversion script on an extracted UNet.
pub struct ConversionStage {
    resolver: ArtifactPathResolver,
    runner: Arc<dyn CommandRunner>,
    python: String,
    timeout: Option<Duration>,
}

impl ConversionStage {
    pub fn new(
        resolver: ArtifactPathResolver,
        runner: Arc<dyn CommandRunner>,
        settings: &ToolchainSettings,
    ) -> Self {
        Self {
            resolver,
            runner,
            python: settings.python.clone(),
            timeout: settings.command_timeout,
        }
    }

    /// Convert `unet_path` to `<base>-F16.gguf`.
    ///
    /// Success requires a zero exit status and the output file on disk.
    pub async fn convert(&self, unet_path: &Path, toolchain: &Toolchain) -> StageResult {
        if !unet_path.is_file() {
            error!("UNet file not found: {}", unet_path.display());
            return Err(PipelineError::input_not_found(unet_path));
        }

        let script = toolchain.converter_script();
        if !script.is_file() {
            return Err(PipelineError::NotFound {
                kind: NotFoundKind::Binary,
                path: script,
            });
        }

        let output_path = self.resolver.resolve(unet_path, ArtifactTarget::Baseline)?;
        let src = absolute(unet_path)?;
        let dst = absolute(&output_path)?;
        let prior = PriorOutput::set_aside(&src, &dst)?;

        info!("Converting UNet to GGUF: {}", unet_path.display());
        let spec = CommandSpec::new(&self.python)
            .path_arg(&absolute(&script)?)
            .arg("--src")
            .path_arg(&src)
            .arg("--dst")
            .path_arg(&dst)
            .current_dir(toolchain.root())
            .timeout(self.timeout);

        if let Err(e) = self.run_converter(&spec, &dst).await {
            prior.restore();
            return Err(e);
        }
        prior.discard();

        let artifact = StageArtifact::from_existing(Stage::Convert, None, output_path)?;
        info!(
            "GGUF conversion complete. Output saved to: {}",
            artifact.path.display()
        );
        Ok(artifact)
    }

    async fn run_converter(&self, spec: &CommandSpec, dst: &Path) -> Result<()> {
        let output = self
            .runner
            .run(spec)
            .await
            .map_err(|e| PipelineError::Conversion {
                message: e.to_string(),
                diagnostics: None,
            })?;
        if !output.stdout.trim().is_empty() {
            debug!("Converter output: {}", output.stdout.trim());
        }

        if !output.success() {
            error!("Conversion failed: `{}` {}", spec, output.exit_description());
            return Err(PipelineError::Conversion {
                message: format!("converter {}", output.exit_description()),
                diagnostics: output.diagnostics(),
            });
        }
        if !dst.is_file() {
            error!("Conversion failed: output file not created");
            return Err(PipelineError::Conversion {
                message: format!("output file not created: {}", dst.display()),
                diagnostics: output.diagnostics(),
            });
        }
        Ok(())
    }
}
