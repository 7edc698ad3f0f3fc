//! Provisioning manifest written into the toolchain root.
//!
//! Records what was fetched and how the build went so an operator can tell
//! which toolchain produced a given artifact. The filesystem stays the source
//! of truth for build status; the manifest is informational.

use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ToolchainConfig;
use crate::{PipelineError, Result};

/// One pinned-URL artifact fetched during provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedArtifact {
    pub name: String,
    pub url: String,
    pub bytes: u64,
    /// Hex-encoded SHA-256 of the file contents
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainManifest {
    pub tag: String,
    pub provisioned_at: DateTime<Utc>,
    #[serde(default)]
    pub artifacts: Vec<FetchedArtifact>,
    pub patch_applied: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ToolchainManifest {
    pub fn new(
        artifacts: Vec<FetchedArtifact>,
        patch_applied: bool,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            tag: ToolchainConfig::PINNED_TAG.to_string(),
            provisioned_at: Utc::now(),
            artifacts,
            patch_applied,
            warnings,
        }
    }

    /// Read the manifest from `root`, `None` if there is none.
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let path = root.join(ToolchainConfig::MANIFEST_NAME);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PipelineError::io("reading toolchain manifest", &path, e)),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = root.join(ToolchainConfig::MANIFEST_NAME);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .map_err(|e| PipelineError::io("writing toolchain manifest", &path, e))
    }
}

/// Hex SHA-256 of a file, read in chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| PipelineError::io("opening file for hashing", path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| PipelineError::io("reading file for hashing", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
