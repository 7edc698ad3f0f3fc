//! CivitAI checkpoint download.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;
use url::Url;

use super::fetch::ArtifactFetcher;
use crate::config::CivitaiConfig;
use crate::{PipelineError, Result};

/// Downloads a checkpoint from a remote registry.
#[async_trait::async_trait]
pub trait ModelDownloader: Send + Sync {
    /// Download the model `version_id` and save it under `name`.
    async fn download(&self, name: &str, version_id: &str, token: &str) -> Result<PathBuf>;
}

/// [`ModelDownloader`] for the CivitAI download API.
pub struct CivitaiDownloader {
    output_dir: PathBuf,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl CivitaiDownloader {
    pub fn new(output_dir: impl Into<PathBuf>, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self {
            output_dir: output_dir.into(),
            fetcher,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

#[async_trait::async_trait]
impl ModelDownloader for CivitaiDownloader {
    async fn download(&self, name: &str, version_id: &str, token: &str) -> Result<PathBuf> {
        if name.trim().is_empty() || version_id.trim().is_empty() {
            return Err(PipelineError::config(
                "CivitAI download requires a model name and a version id",
            ));
        }

        let destination = self.output_dir.join(checkpoint_file_name(name));
        let url = download_url(version_id, token)?;

        info!(
            "Downloading model {} (version {}) to {}",
            name,
            version_id,
            destination.display()
        );

        self.fetcher
            .fetch(url.as_str(), &destination)
            .await
            .map_err(|e| PipelineError::Download {
                message: format!("{name} (version {version_id}): {e}"),
            })?;

        Ok(destination)
    }
}

/// `name` with a `.safetensors` extension appended when missing.
fn checkpoint_file_name(name: &str) -> String {
    if name.ends_with(".safetensors") {
        name.to_string()
    } else {
        format!("{name}.safetensors")
    }
}

fn download_url(version_id: &str, token: &str) -> Result<Url> {
    let base = Url::parse(CivitaiConfig::DOWNLOAD_API_BASE)
        .and_then(|base| base.join(version_id.trim()))
        .map_err(|e| PipelineError::config(format!("Invalid CivitAI version id: {e}")))?;
    Url::parse_with_params(base.as_str(), &[("token", token)])
        .map_err(|e| PipelineError::config(format!("Invalid CivitAI download URL: {e}")))
}
