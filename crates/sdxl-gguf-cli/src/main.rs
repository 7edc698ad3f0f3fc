//! SDXL GGUF - convert and quantize SDXL checkpoints to GGUF.
//!
//! Thin command-line front end over `sdxl-gguf-core`: parses the run
//! configuration, wires the real process runner, HTTP fetcher and CivitAI
//! downloader into the orchestrator, and prints a size summary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use sdxl_gguf_core::{
    CivitaiConfig, CivitaiDownloader, HttpFetcher, PathsConfig, PipelineOrchestrator,
    QuantVariant, RunConfig, RunReport, StageStatus, SystemRunner, ToolchainSettings,
};
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "sdxl-gguf")]
#[command(about = "Modular SDXL model processing pipeline: extract, convert to GGUF, quantize")]
struct Args {
    /// Path to the SDXL model file
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Directory to save all outputs
    #[arg(long, default_value = PathsConfig::DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// Download the model from CivitAI
    #[arg(long)]
    civitai: bool,

    /// Name for the downloaded model file
    #[arg(long)]
    model_name: Option<String>,

    /// CivitAI model version ID
    #[arg(long)]
    model_version_id: Option<String>,

    /// CivitAI API token
    #[arg(long, env = CivitaiConfig::TOKEN_ENV_VAR, hide_env_values = true)]
    civitai_token: Option<String>,

    /// Directory to save downloaded models
    #[arg(long, default_value = PathsConfig::DEFAULT_DOWNLOAD_DIR)]
    download_dir: PathBuf,

    /// Skip extraction and use an existing UNet file
    #[arg(long)]
    skip_extract: bool,

    /// Path to an existing UNet file (if skipping extraction)
    #[arg(long)]
    unet_path: Option<PathBuf>,

    /// Skip llama.cpp setup (use if already set up)
    #[arg(long)]
    skip_setup: bool,

    /// Skip conversion and use an existing GGUF file
    #[arg(long)]
    skip_convert: bool,

    /// Path to an existing GGUF file (if skipping conversion)
    #[arg(long)]
    gguf_path: Option<PathBuf>,

    /// Skip quantization and only generate the F16 GGUF
    #[arg(long)]
    skip_quant: bool,

    /// Quantization types to generate (Q4_K_S, Q5_K_S, Q8_0, or `all`)
    #[arg(long, num_args = 1.., default_value = "Q5_K_S")]
    quant_types: Vec<String>,

    /// llama.cpp checkout directory
    #[arg(long, default_value = PathsConfig::DEFAULT_TOOLCHAIN_DIR)]
    toolchain_dir: PathBuf,

    /// Python interpreter for the converter
    #[arg(long, default_value = "python3")]
    python: String,

    /// Parallel build jobs for llama-quantize (capped at 10)
    #[arg(long)]
    jobs: Option<usize>,

    /// Kill any external command running longer than this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn run_config(&self) -> Result<RunConfig> {
        let variants = QuantVariant::parse_list(&self.quant_types)?;
        let mut config = RunConfig::new(&self.output_dir).with_variants(variants);

        if self.civitai {
            config = config.with_civitai(
                self.model_name.clone().unwrap_or_default(),
                self.model_version_id.clone().unwrap_or_default(),
                self.civitai_token.clone().unwrap_or_default(),
            );
        } else if let Some(model_path) = &self.model_path {
            config = config.with_model_path(model_path);
        }

        if self.skip_extract {
            config = config.skip_extract(self.unet_path.clone());
        }
        if self.skip_setup {
            config = config.skip_setup();
        }
        if self.skip_convert {
            config = config.skip_convert(self.gguf_path.clone());
        }
        if self.skip_quant {
            config = config.skip_quant();
        }
        Ok(config)
    }

    fn toolchain_settings(&self) -> ToolchainSettings {
        let mut settings = ToolchainSettings::default()
            .with_root(&self.toolchain_dir)
            .with_python(&self.python)
            .with_command_timeout(self.timeout_secs.map(Duration::from_secs));
        if let Some(jobs) = self.jobs {
            settings = settings.with_build_jobs(jobs);
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(log_level.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting SDXL GGUF pipeline");

    let config = args.run_config()?;
    let fetcher = Arc::new(HttpFetcher::new()?);
    let downloader = Arc::new(CivitaiDownloader::new(&args.download_dir, fetcher.clone()));
    let orchestrator =
        PipelineOrchestrator::new(args.toolchain_settings(), Arc::new(SystemRunner), fetcher)
            .with_downloader(downloader);

    let report = orchestrator.run(&config).await?;
    print_summary(&report);

    if !report.succeeded() {
        bail!("Processing pipeline failed");
    }
    info!("Processing pipeline complete!");
    Ok(())
}

fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

fn print_summary(report: &RunReport) {
    for warning in &report.provision_warnings {
        warn!("Toolchain warning: {}", warning);
    }

    for stage in report.stages() {
        match stage.status {
            StageStatus::Skipped => match &stage.substitute {
                Some(artifact) => info!("{}: skipped, using {}", stage.stage, artifact.path.display()),
                None => info!("{}: skipped", stage.stage),
            },
            StageStatus::Pending => info!("{}: not run", stage.stage),
            status => info!("{}: {}", stage.stage, status),
        }
        for e in stage.failures() {
            error!("  {}", e);
        }
    }

    let Some(baseline) = report.baseline() else {
        return;
    };
    info!(
        "Original model: {} ({:.2} MB, 100%)",
        baseline.path.display(),
        megabytes(baseline.size)
    );
    for artifact in report.quantized() {
        let variant = artifact
            .variant
            .map(|v| v.to_string())
            .unwrap_or_default();
        let percent = artifact.percent_of(baseline.size).unwrap_or(0.0);
        info!(
            "{}: {} ({:.2} MB, {:.1}% of original)",
            variant,
            artifact.path.display(),
            megabytes(artifact.size),
            percent
        );
    }
}
