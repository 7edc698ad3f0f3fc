//! Centralized configuration for the conversion pipeline.
//!
//! Pinned toolchain references, download locations and output directory
//! names live here as constants; [`ToolchainSettings`] holds the few values
//! an operator may override at runtime.

use std::path::PathBuf;
use std::time::Duration;

/// Pinned external toolchain (llama.cpp plus the ComfyUI-GGUF tooling).
pub struct ToolchainConfig;

impl ToolchainConfig {
    pub const REPO_URL: &'static str = "https://github.com/ggerganov/llama.cpp.git";
    pub const PINNED_TAG: &'static str = "b3600";

    pub const CONVERT_SCRIPT_URL: &'static str =
        "https://raw.githubusercontent.com/city96/ComfyUI-GGUF/main/tools/convert.py";
    pub const CONVERT_G_SCRIPT_URL: &'static str =
        "https://huggingface.co/Old-Fisherman/SDXL_Finetune_GGUF_Files/resolve/main/convert_g.py";
    pub const PATCH_URL: &'static str =
        "https://raw.githubusercontent.com/city96/ComfyUI-GGUF/main/tools/lcpp.patch";

    pub const CONVERT_SCRIPT_NAME: &'static str = "convert.py";
    pub const CONVERT_G_SCRIPT_NAME: &'static str = "convert_g.py";
    pub const PATCH_NAME: &'static str = "lcpp.patch";
    pub const MANIFEST_NAME: &'static str = "provision.json";

    /// In-tree Python package that provides the `gguf` module.
    pub const GGUF_PY_DIR: &'static str = "gguf-py";

    pub const BUILD_DIR: &'static str = "build";
    pub const BUILD_CONFIG: &'static str = "Debug";
    pub const BUILD_TARGET: &'static str = "llama-quantize";
    pub const MAX_BUILD_JOBS: usize = 10;

    /// Quantizer locations relative to the toolchain root, checked in order.
    pub const QUANTIZE_BINARY_CANDIDATES: [&'static str; 2] =
        ["build/bin/llama-quantize", "build/llama-quantize"];
}

/// Output directory layout below the run's output directory.
pub struct PathsConfig;

impl PathsConfig {
    pub const DEFAULT_OUTPUT_DIR: &'static str = "./output";
    pub const DEFAULT_DOWNLOAD_DIR: &'static str = "./downloads";
    pub const DEFAULT_TOOLCHAIN_DIR: &'static str = "./llama.cpp";
    pub const COMPONENTS_DIR_NAME: &'static str = "components";
    pub const GGUF_DIR_NAME: &'static str = "gguf";
    pub const QUANTIZED_DIR_NAME: &'static str = "quantized";
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
}

/// CivitAI download endpoint.
pub struct CivitaiConfig;

impl CivitaiConfig {
    pub const DOWNLOAD_API_BASE: &'static str = "https://civitai.com/api/download/models/";
    pub const TOKEN_ENV_VAR: &'static str = "CIVITAI_TOKEN";
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Runtime settings for provisioning and invoking the toolchain.
#[derive(Debug, Clone)]
pub struct ToolchainSettings {
    /// Root directory of the toolchain checkout
    pub root: PathBuf,
    /// Python interpreter used for the converter and the gguf install
    pub python: String,
    /// Parallel job count for the quantizer build
    pub build_jobs: usize,
    /// Wall-clock limit for each external invocation (none by default)
    pub command_timeout: Option<Duration>,
}

impl Default for ToolchainSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from(PathsConfig::DEFAULT_TOOLCHAIN_DIR),
            python: "python3".to_string(),
            build_jobs: default_build_jobs(),
            command_timeout: None,
        }
    }
}

impl ToolchainSettings {
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    /// Set the build job count, clamped to `1..=MAX_BUILD_JOBS`.
    pub fn with_build_jobs(mut self, jobs: usize) -> Self {
        self.build_jobs = jobs.clamp(1, ToolchainConfig::MAX_BUILD_JOBS);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }
}

fn default_build_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(ToolchainConfig::MAX_BUILD_JOBS)
}
