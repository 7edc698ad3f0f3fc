//! Baseline GGUF → quantized GGUF via `llama-quantize`.

use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, error, info, warn};

use super::output::PriorOutput;
use super::types::QuantVariant;
use crate::artifact::{absolute, ArtifactPathResolver, ArtifactTarget, Stage, StageArtifact, StageResult};
use crate::config::ToolchainSettings;
use crate::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::toolchain::Toolchain;
use crate::{PipelineError, Result};

/// Per-tensor progress lines, e.g. `[  12/ 1680]  input_blocks.0.0.weight`.
static PROGRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\s*(\d+)/\s*(\d+)\]\s+(\S+)").expect("valid progress regex")
});

/// Runs the built quantizer once per requested variant.
pub struct QuantizationStage {
    resolver: ArtifactPathResolver,
    runner: Arc<dyn CommandRunner>,
    timeout: Option<Duration>,
}

impl QuantizationStage {
    pub fn new(
        resolver: ArtifactPathResolver,
        runner: Arc<dyn CommandRunner>,
        settings: &ToolchainSettings,
    ) -> Self {
        Self {
            resolver,
            runner,
            timeout: settings.command_timeout,
        }
    }

    /// Quantize `gguf_path` to `<base>_<variant>.gguf`.
    pub async fn quantize(
        &self,
        gguf_path: &Path,
        variant: QuantVariant,
        toolchain: &Toolchain,
    ) -> StageResult {
        if !gguf_path.is_file() {
            error!("GGUF file not found: {}", gguf_path.display());
            return Err(PipelineError::input_not_found(gguf_path));
        }
        let binary = toolchain.locate_quantize_binary()?;

        let output_path = self
            .resolver
            .resolve(gguf_path, ArtifactTarget::Quantized(variant))?;
        let src = absolute(gguf_path)?;
        let dst = absolute(&output_path)?;
        let prior = PriorOutput::set_aside(&src, &dst)?;

        info!("Quantizing to {} ({})", variant, variant.description());
        let spec = CommandSpec::new(absolute(&binary)?.to_string_lossy())
            .path_arg(&src)
            .path_arg(&dst)
            .arg(variant.as_str())
            .current_dir(toolchain.root())
            .timeout(self.timeout);

        if let Err(e) = self.run_quantizer(&spec, variant, &dst).await {
            prior.restore();
            return Err(e);
        }
        prior.discard();

        let artifact = StageArtifact::from_existing(Stage::Quantize, Some(variant), output_path)?;
        info!(
            "Quantization complete. Output saved to: {}",
            artifact.path.display()
        );
        Ok(artifact)
    }

    async fn run_quantizer(
        &self,
        spec: &CommandSpec,
        variant: QuantVariant,
        dst: &Path,
    ) -> Result<()> {
        let output = self
            .runner
            .run(spec)
            .await
            .map_err(|e| PipelineError::Quantization {
                variant: variant.to_string(),
                message: e.to_string(),
                stderr: None,
            })?;
        log_quantizer_output(&output);

        if output.success() && dst.is_file() {
            return Ok(());
        }
        let message = if output.success() {
            format!("output file not created: {}", dst.display())
        } else {
            format!("llama-quantize {}", output.exit_description())
        };
        error!("Quantization to {} failed: {}", variant, message);
        let stderr = output.stderr.trim();
        Err(PipelineError::Quantization {
            variant: variant.to_string(),
            message,
            stderr: (!stderr.is_empty()).then(|| stderr.to_string()),
        })
    }
}

/// Count of tensors `llama-quantize` reported processing.
fn tensors_processed(text: &str) -> Option<(u64, u64)> {
    text.lines()
        .filter_map(|line| PROGRESS_PATTERN.captures(line))
        .filter_map(|caps| Some((caps[1].parse().ok()?, caps[2].parse().ok()?)))
        .last()
}

fn log_quantizer_output(output: &CommandOutput) {
    match tensors_processed(&output.stdout).or_else(|| tensors_processed(&output.stderr)) {
        Some((done, total)) => debug!("llama-quantize processed {done}/{total} tensors"),
        None => debug!("llama-quantize reported no tensor progress"),
    }

    let stdout = output.stdout.trim();
    if !stdout.is_empty() {
        info!("llama-quantize output:\n{}", stdout);
    }
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        warn!("llama-quantize stderr:\n{}", stderr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotFoundKind;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Writes the output file (argument 2) unless the variant is listed as failing.
    struct ScriptedQuantizer {
        calls: Mutex<Vec<CommandSpec>>,
        failing: Vec<&'static str>,
    }

    impl ScriptedQuantizer {
        fn new(failing: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                failing,
            })
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for ScriptedQuantizer {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            let variant = spec.args[2].as_str();
            if self.failing.contains(&variant) {
                return Ok(CommandOutput {
                    code: Some(1),
                    stdout: String::new(),
                    stderr: "llama_model_quantize: failed to quantize".into(),
                });
            }
            std::fs::write(&spec.args[1], b"Q").unwrap();
            Ok(CommandOutput {
                code: Some(0),
                stdout: "[   1/   2]  a.weight\n[   2/   2]  b.weight\n".into(),
                stderr: String::new(),
            })
        }
    }

    struct Fixture {
        _temp_dir: TempDir,
        toolchain: Toolchain,
        gguf: PathBuf,
        output_dir: PathBuf,
    }

    fn fixture(with_binary: bool) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("llama.cpp");
        std::fs::create_dir_all(root.join("build/bin")).unwrap();
        if with_binary {
            let name = if cfg!(windows) {
                "build/bin/llama-quantize.exe"
            } else {
                "build/bin/llama-quantize"
            };
            std::fs::write(root.join(name), b"").unwrap();
        }
        let gguf = temp_dir.path().join("model-F16.gguf");
        std::fs::write(&gguf, vec![0u8; 16]).unwrap();
        Fixture {
            toolchain: Toolchain::open(&root),
            gguf,
            output_dir: temp_dir.path().join("output"),
            _temp_dir: temp_dir,
        }
    }

    fn stage(fx: &Fixture, runner: Arc<ScriptedQuantizer>) -> QuantizationStage {
        QuantizationStage::new(
            ArtifactPathResolver::new(&fx.output_dir),
            runner,
            &ToolchainSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_quantize_success() {
        let fx = fixture(true);
        let runner = ScriptedQuantizer::new(vec![]);

        let artifact = stage(&fx, runner.clone())
            .quantize(&fx.gguf, QuantVariant::Q5KS, &fx.toolchain)
            .await
            .unwrap();
        assert_eq!(artifact.path, fx.output_dir.join("quantized/model_Q5_K_S.gguf"));
        assert_eq!(artifact.variant, Some(QuantVariant::Q5KS));

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].program.contains("llama-quantize"));
        assert_eq!(calls[0].args[2], "Q5_K_S");
        assert_eq!(calls[0].current_dir.as_deref(), Some(fx.toolchain.root()));
    }

    #[tokio::test]
    async fn test_quantize_failure_carries_variant_and_stderr() {
        let fx = fixture(true);
        let err = stage(&fx, ScriptedQuantizer::new(vec!["Q8_0"]))
            .quantize(&fx.gguf, QuantVariant::Q8_0, &fx.toolchain)
            .await
            .unwrap_err();
        match err {
            PipelineError::Quantization {
                variant, stderr, ..
            } => {
                assert_eq!(variant, "Q8_0");
                assert!(stderr.unwrap().contains("failed to quantize"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_found() {
        let fx = fixture(false);
        let runner = ScriptedQuantizer::new(vec![]);
        let err = stage(&fx, runner.clone())
            .quantize(&fx.gguf, QuantVariant::Q4KS, &fx.toolchain)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::NotFound {
                kind: NotFoundKind::Binary,
                ..
            }
        ));
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_input_checked_before_binary() {
        let fx = fixture(false);
        let err = stage(&fx, ScriptedQuantizer::new(vec![]))
            .quantize(&fx.gguf.with_file_name("gone.gguf"), QuantVariant::Q4KS, &fx.toolchain)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::NotFound {
                kind: NotFoundKind::Input,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_input_that_is_its_own_output_is_left_alone() {
        let fx = fixture(true);
        let quantized_dir = fx.output_dir.join("quantized");
        std::fs::create_dir_all(&quantized_dir).unwrap();
        let input = quantized_dir.join("model_Q8_0.gguf");
        std::fs::write(&input, b"user data").unwrap();
        let runner = ScriptedQuantizer::new(vec!["Q8_0"]);

        let err = stage(&fx, runner.clone())
            .quantize(&input, QuantVariant::Q8_0, &fx.toolchain)
            .await
            .unwrap_err();
        assert!(err.is_config_error(), "{err}");
        assert!(runner.calls.lock().unwrap().is_empty());
        assert_eq!(std::fs::read(&input).unwrap(), b"user data");
    }

    #[tokio::test]
    async fn test_failed_requantize_keeps_prior_output() {
        let fx = fixture(true);
        let quantized_dir = fx.output_dir.join("quantized");
        std::fs::create_dir_all(&quantized_dir).unwrap();
        let prior = quantized_dir.join("model_Q8_0.gguf");
        std::fs::write(&prior, b"Q8_0 from run 1").unwrap();

        let err = stage(&fx, ScriptedQuantizer::new(vec!["Q8_0"]))
            .quantize(&fx.gguf, QuantVariant::Q8_0, &fx.toolchain)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Quantization { .. }));
        assert_eq!(std::fs::read(&prior).unwrap(), b"Q8_0 from run 1");
        assert!(!quantized_dir.join("model_Q8_0.gguf.prev").exists());
    }

    #[test]
    fn test_tensors_processed() {
        let log = "llama_model_quantize_internal: meta size = 1\n\
                   [   1/ 1680]  input_blocks.0.0.weight - [320, 4], type = f16\n\
                   [1680/ 1680]  out.2.weight - [320, 4], type = f16\n";
        assert_eq!(tensors_processed(log), Some((1680, 1680)));
        assert_eq!(tensors_processed("no progress here"), None);
    }
}
