//! Network collaborators: artifact fetching and checkpoint download.

pub mod civitai;
pub mod fetch;

pub use civitai::{CivitaiDownloader, ModelDownloader};
pub use fetch::{ArtifactFetcher, HttpFetcher};
