//! External conversion/quantization toolchain.
//!
//! The toolchain is a llama.cpp checkout pinned to a release tag, patched
//! for image-model tensors and built for `llama-quantize` only, plus the
//! ComfyUI-GGUF conversion script. [`ToolchainProvisioner`] creates it from
//! scratch; [`Toolchain::open`] inspects an existing one.

mod manifest;
mod provision;

pub use manifest::{sha256_file, FetchedArtifact, ToolchainManifest};
pub use provision::{ProvisionOutcome, ProvisionWarning, ToolchainProvisioner};

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::ToolchainConfig;
use crate::error::NotFoundKind;
use crate::{PipelineError, Result};

/// How far a toolchain tree has been set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BuildStatus {
    Absent,
    Cloned,
    Patched,
    Built,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::Absent => "absent",
            BuildStatus::Cloned => "cloned",
            BuildStatus::Patched => "patched",
            BuildStatus::Built => "built",
        };
        f.write_str(s)
    }
}

/// Handle to a toolchain tree at a fixed root.
#[derive(Debug, Clone)]
pub struct Toolchain {
    root: PathBuf,
    status: BuildStatus,
}

impl Toolchain {
    pub(crate) fn new(root: PathBuf, status: BuildStatus) -> Self {
        Self { root, status }
    }

    /// Inspect the tree at `root` without modifying it.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut toolchain = Self {
            root,
            status: BuildStatus::Absent,
        };
        toolchain.status = toolchain.detect_status();
        toolchain
    }

    fn detect_status(&self) -> BuildStatus {
        if self.quantize_binary().is_some() {
            return BuildStatus::Built;
        }
        if !self.root.join(".git").exists() {
            return BuildStatus::Absent;
        }
        match ToolchainManifest::load(&self.root) {
            Ok(Some(manifest)) if manifest.patch_applied => BuildStatus::Patched,
            _ => BuildStatus::Cloned,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn status(&self) -> BuildStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: BuildStatus) {
        self.status = status;
    }

    /// Path of the downloaded SDXL conversion script.
    pub fn converter_script(&self) -> PathBuf {
        self.root.join(ToolchainConfig::CONVERT_SCRIPT_NAME)
    }

    pub fn build_dir(&self) -> PathBuf {
        self.root.join(ToolchainConfig::BUILD_DIR)
    }

    /// Locations the quantizer may be built to, in lookup order.
    pub fn quantize_binary_candidates(&self) -> impl Iterator<Item = PathBuf> + '_ {
        ToolchainConfig::QUANTIZE_BINARY_CANDIDATES
            .iter()
            .map(move |rel| self.root.join(binary_name(rel)))
    }

    /// The first quantizer candidate that exists on disk.
    pub fn quantize_binary(&self) -> Option<PathBuf> {
        self.quantize_binary_candidates().find(|p| p.is_file())
    }

    /// Like [`Toolchain::quantize_binary`] but fails once every candidate
    /// has been checked.
    pub fn locate_quantize_binary(&self) -> Result<PathBuf> {
        self.quantize_binary().ok_or_else(|| PipelineError::NotFound {
            kind: NotFoundKind::Binary,
            path: self
                .quantize_binary_candidates()
                .last()
                .unwrap_or_else(|| self.build_dir()),
        })
    }
}

fn binary_name(rel: &str) -> String {
    if cfg!(windows) {
        format!("{rel}.exe")
    } else {
        rel.to_string()
    }
}
