//! Stage orchestration: extract → convert → quantize.
//!
//! A run is validated up front ([`RunConfig::validate`]), so a bad skip/path
//! combination fails before anything is spawned. Stages then execute strictly
//! in order. A failed extract or convert halts the run and leaves later
//! stages `Pending`; quantize variants fail independently of each other.
//! Artifacts already written are never removed, so a failed run can be
//! resumed by skipping the stages that completed.

mod report;
mod run_config;

pub use report::{RunReport, StageReport, StageStatus};
pub use run_config::{ModelSource, RunConfig, RunPlan};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::artifact::{ArtifactPathResolver, Stage, StageArtifact, StageResult};
use crate::config::{PathsConfig, ToolchainSettings};
use crate::conversion::{ConversionStage, QuantizationStage};
use crate::extract::{ComponentExtractor, SafetensorsSplitter};
use crate::network::{ArtifactFetcher, CivitaiDownloader, ModelDownloader};
use crate::process::CommandRunner;
use crate::toolchain::{Toolchain, ToolchainProvisioner};
use crate::{PipelineError, Result};

/// Drives one or more pipeline runs against a toolchain root.
pub struct PipelineOrchestrator {
    settings: ToolchainSettings,
    runner: Arc<dyn CommandRunner>,
    fetcher: Arc<dyn ArtifactFetcher>,
    extractor: Arc<dyn ComponentExtractor>,
    downloader: Arc<dyn ModelDownloader>,
}

impl PipelineOrchestrator {
    /// Orchestrator with the safetensors splitter and a CivitAI downloader
    /// saving into the default download directory.
    pub fn new(
        settings: ToolchainSettings,
        runner: Arc<dyn CommandRunner>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        let downloader = Arc::new(CivitaiDownloader::new(
            PathsConfig::DEFAULT_DOWNLOAD_DIR,
            fetcher.clone(),
        ));
        Self {
            settings,
            runner,
            fetcher,
            extractor: Arc::new(SafetensorsSplitter),
            downloader,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ComponentExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn ModelDownloader>) -> Self {
        self.downloader = downloader;
        self
    }

    pub fn settings(&self) -> &ToolchainSettings {
        &self.settings
    }

    /// Execute `config`.
    ///
    /// Returns `Err` for problems that stop the run before any stage result
    /// exists: invalid configuration or a missing substitute file. Stage
    /// failures are recorded in the report. A failed toolchain provisioning
    /// is recorded against the first stage that needed the toolchain.
    pub async fn run(&self, config: &RunConfig) -> Result<RunReport> {
        let plan = config.validate()?;
        std::fs::create_dir_all(&config.output_dir).map_err(|e| {
            PipelineError::io("creating output directory", &config.output_dir, e)
        })?;
        let resolver = ArtifactPathResolver::new(&config.output_dir);
        let mut report = RunReport::new();

        // Step 1: extract
        let unet = match &plan.extract {
            Some(source) => {
                info!("STEP 1: Extracting model components");
                let stage = report.stage_mut(Stage::Extract);
                stage.start();
                let result = self.extract(source, &resolver).await;
                let unet = result.as_ref().ok().map(|a| a.path.clone());
                log_result(&result);
                stage.record(result);
                stage.finish();
                match unet {
                    Some(unet) => Some(unet),
                    None => return Ok(halted(report, Stage::Extract)),
                }
            }
            None => {
                let substitute = plan.unet_substitute.clone();
                if let Some(unet) = &substitute {
                    info!("Skipping extraction, using existing UNet: {}", unet.path.display());
                }
                let path = substitute.as_ref().map(|a| a.path.clone());
                report.stage_mut(Stage::Extract).skip(substitute);
                path
            }
        };

        if !plan.needs_toolchain() {
            info!("Skipping conversion and quantization as requested");
            report
                .stage_mut(Stage::Convert)
                .skip(plan.gguf_substitute.clone());
            report.stage_mut(Stage::Quantize).skip(None);
            return Ok(report);
        }

        let acquired = self.acquire_toolchain(&plan, &mut report).await;
        let toolchain = match acquired {
            Ok(toolchain) => toolchain,
            Err(e) => {
                // Charged to the first stage that needed the toolchain.
                let stage = if plan.convert {
                    Stage::Convert
                } else {
                    report
                        .stage_mut(Stage::Convert)
                        .skip(plan.gguf_substitute.clone());
                    Stage::Quantize
                };
                error!("Toolchain setup failed: {} ({})", e, e.kind());
                let stage_report = report.stage_mut(stage);
                stage_report.start();
                stage_report.record(Err(e));
                stage_report.finish();
                return Ok(halted(report, stage));
            }
        };

        // Step 2: convert
        let gguf = if plan.convert {
            let unet = unet.ok_or_else(|| {
                PipelineError::config("No UNet path available for conversion")
            })?;
            info!("STEP 2: Converting UNet to GGUF format");
            let stage = report.stage_mut(Stage::Convert);
            stage.start();
            let result = ConversionStage::new(resolver.clone(), self.runner.clone(), &self.settings)
                .convert(&unet, &toolchain)
                .await;
            let gguf = result.as_ref().ok().map(|a| a.path.clone());
            log_result(&result);
            stage.record(result);
            stage.finish();
            match gguf {
                Some(gguf) => Some(gguf),
                None => return Ok(halted(report, Stage::Convert)),
            }
        } else {
            let substitute = plan.gguf_substitute.clone();
            if let Some(gguf) = &substitute {
                info!("Skipping conversion, using existing GGUF: {}", gguf.path.display());
            }
            let path = substitute.as_ref().map(|a| a.path.clone());
            report.stage_mut(Stage::Convert).skip(substitute);
            path
        };

        // Step 3: quantize
        if plan.variants.is_empty() {
            info!("Skipping quantization as requested");
            report.stage_mut(Stage::Quantize).skip(None);
            return Ok(report);
        }
        let gguf: PathBuf = gguf
            .ok_or_else(|| PipelineError::config("No GGUF path available for quantization"))?;

        info!("STEP 3: Quantizing GGUF model");
        let quantizer = QuantizationStage::new(resolver, self.runner.clone(), &self.settings);
        let stage = report.stage_mut(Stage::Quantize);
        stage.start();
        for variant in &plan.variants {
            let result = quantizer.quantize(&gguf, *variant, &toolchain).await;
            log_result(&result);
            stage.record(result);
        }
        stage.finish();
        if stage.status == StageStatus::Failed {
            error!("Every requested quantization failed");
        }

        Ok(report)
    }

    async fn extract(&self, source: &ModelSource, resolver: &ArtifactPathResolver) -> StageResult {
        let checkpoint = match source {
            ModelSource::Local(path) => path.clone(),
            ModelSource::Civitai {
                name,
                version_id,
                token,
            } => self.downloader.download(name, version_id, token).await?,
        };
        let components = self.extractor.extract(&checkpoint, resolver).await?;
        StageArtifact::from_existing(Stage::Extract, None, components.unet)
    }

    /// Provision a fresh toolchain, or open the existing one when setup is skipped.
    async fn acquire_toolchain(&self, plan: &RunPlan, report: &mut RunReport) -> Result<Toolchain> {
        if plan.skip_setup {
            let toolchain = Toolchain::open(&self.settings.root);
            info!(
                "Skipping toolchain setup, using {} ({})",
                toolchain.root().display(),
                toolchain.status()
            );
            return Ok(toolchain);
        }

        let provisioner =
            ToolchainProvisioner::new(self.settings.clone(), self.runner.clone(), self.fetcher.clone());
        let outcome = provisioner.provision().await?;
        for warning in outcome.warnings() {
            warn!("Toolchain degraded: {}", warning);
        }
        report.provision_warnings = outcome.warnings().to_vec();
        Ok(outcome.into_toolchain())
    }
}

fn halted(report: RunReport, stage: Stage) -> RunReport {
    error!("{} stage failed; halting pipeline", stage);
    report
}

fn log_result(result: &StageResult) {
    match result {
        Ok(artifact) => info!(
            "{} artifact ready: {} ({} bytes)",
            artifact.stage,
            artifact.path.display(),
            artifact.size
        ),
        Err(e) => error!("{} ({})", e, e.kind()),
    }
}
