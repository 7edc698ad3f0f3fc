//! Streaming file downloads.
//!
//! Downloads are written to a `.part` temp file next to the destination and
//! renamed into place once the body has been fully received.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::{CivitaiConfig, PathsConfig};
use crate::{PipelineError, Result};

/// Fetches a remote artifact to a local path.
#[async_trait::async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Download `url` to `destination`, returning the number of bytes written.
    async fn fetch(&self, url: &str, destination: &Path) -> Result<u64>;
}

/// [`ArtifactFetcher`] over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CivitaiConfig::REQUEST_TIMEOUT)
            .user_agent(concat!("sdxl-gguf/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn stream_to(&self, url: &str, temp_path: &Path) -> Result<u64> {
        // Drop the URL from transport errors, it may carry a token.
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::from(e.without_url()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Network {
                message: format!("HTTP {status} for {}", redact(url)),
            });
        }

        let mut file = tokio::fs::File::create(temp_path)
            .await
            .map_err(|e| PipelineError::io("creating download file", temp_path, e))?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::from(e.without_url()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| PipelineError::io("writing download file", temp_path, e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| PipelineError::io("flushing download file", temp_path, e))?;

        Ok(written)
    }
}

#[async_trait::async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<u64> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::io("creating download directory", parent, e))?;
        }

        let temp_path = temp_path_for(destination);
        debug!("Fetching {} -> {}", redact(url), temp_path.display());

        match self.stream_to(url, &temp_path).await {
            Ok(bytes) => {
                tokio::fs::rename(&temp_path, destination).await.map_err(|e| {
                    PipelineError::io("moving download into place", destination, e)
                })?;
                info!("Downloaded {} bytes to {}", bytes, destination.display());
                Ok(bytes)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }
}

fn temp_path_for(destination: &Path) -> PathBuf {
    PathBuf::from(format!(
        "{}{}",
        destination.display(),
        PathsConfig::DOWNLOAD_TEMP_SUFFIX
    ))
}

/// Strip the query string so credentials never reach the logs.
pub(crate) fn redact(url: &str) -> &str {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_path() {
        assert_eq!(
            temp_path_for(Path::new("/dl/model.safetensors")),
            PathBuf::from("/dl/model.safetensors.part")
        );
    }

    #[test]
    fn test_redact_drops_query() {
        assert_eq!(
            redact("https://civitai.com/api/download/models/1?token=secret"),
            "https://civitai.com/api/download/models/1"
        );
        assert_eq!(redact("https://example.com/a.py"), "https://example.com/a.py");
    }
}
