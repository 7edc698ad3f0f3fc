//! Component extraction from a combined SDXL checkpoint.
//!
//! A single-file SDXL checkpoint bundles four sub-models under fixed
//! tensor-key prefixes. [`SafetensorsSplitter`] rewrites the safetensors
//! header per component and copies the raw tensor bytes; nothing is decoded.
//!
//! Safetensors layout: 8-byte little-endian header length, a JSON header
//! mapping tensor names to `{dtype, shape, data_offsets}`, then the data
//! buffer that the offsets index into.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::artifact::{ArtifactPathResolver, ArtifactTarget, Component};
use crate::config::PathsConfig;
use crate::{PipelineError, Result};

const METADATA_KEY: &str = "__metadata__";

/// Upper bound on the JSON header; anything larger is not a real checkpoint.
const MAX_HEADER_SIZE: u64 = 100_000_000;

/// Prefix → component routing, and whether the prefix is dropped from the
/// output key. Keys matching none of these belong to the UNet. Only VAE keys
/// lose their prefix; the text encoders keep the checkpoint's key layout.
const PREFIX_ROUTES: [(&str, Component, bool); 3] = [
    ("conditioner.embedders.0.", Component::ClipL, false),
    ("conditioner.embedders.1.", Component::ClipG, false),
    ("first_stage_model.", Component::Vae, true),
];

/// Paths of the four extracted sub-checkpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedComponents {
    pub unet: PathBuf,
    pub clip_l: PathBuf,
    pub clip_g: PathBuf,
    pub vae: PathBuf,
}

impl ExtractedComponents {
    pub fn get(&self, component: Component) -> &Path {
        match component {
            Component::Unet => &self.unet,
            Component::ClipL => &self.clip_l,
            Component::ClipG => &self.clip_g,
            Component::Vae => &self.vae,
        }
    }
}

/// Splits a checkpoint into its sub-model files.
#[async_trait::async_trait]
pub trait ComponentExtractor: Send + Sync {
    /// Extract `checkpoint` into the paths `resolver` derives for each component.
    async fn extract(
        &self,
        checkpoint: &Path,
        resolver: &ArtifactPathResolver,
    ) -> Result<ExtractedComponents>;
}

/// [`ComponentExtractor`] for `.safetensors` checkpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct SafetensorsSplitter;

#[async_trait::async_trait]
impl ComponentExtractor for SafetensorsSplitter {
    async fn extract(
        &self,
        checkpoint: &Path,
        resolver: &ArtifactPathResolver,
    ) -> Result<ExtractedComponents> {
        if !checkpoint.is_file() {
            return Err(PipelineError::input_not_found(checkpoint));
        }

        let outputs = ExtractedComponents {
            unet: resolver.resolve(checkpoint, ArtifactTarget::Component(Component::Unet))?,
            clip_l: resolver.resolve(checkpoint, ArtifactTarget::Component(Component::ClipL))?,
            clip_g: resolver.resolve(checkpoint, ArtifactTarget::Component(Component::ClipG))?,
            vae: resolver.resolve(checkpoint, ArtifactTarget::Component(Component::Vae))?,
        };

        info!("Extracting components from {}", checkpoint.display());
        let source = checkpoint.to_path_buf();
        let targets = outputs.clone();
        tokio::task::spawn_blocking(move || split_checkpoint(&source, &targets))
            .await
            .map_err(|e| PipelineError::Extraction {
                message: format!("extraction worker failed: {e}"),
            })??;

        for component in Component::ALL {
            info!("Saved {} to {}", component, outputs.get(component).display());
        }
        Ok(outputs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TensorEntry {
    dtype: String,
    shape: Vec<u64>,
    data_offsets: [u64; 2],
}

impl TensorEntry {
    fn len(&self) -> u64 {
        self.data_offsets[1] - self.data_offsets[0]
    }
}

struct Header {
    /// Absolute file offset of the data buffer
    data_start: u64,
    metadata: Option<Value>,
    tensors: Vec<(String, TensorEntry)>,
}

fn extraction_error(message: impl Into<String>) -> PipelineError {
    PipelineError::Extraction {
        message: message.into(),
    }
}

fn read_header(file: &mut File, path: &Path) -> Result<Header> {
    let file_len = file
        .metadata()
        .map_err(|e| PipelineError::io("reading checkpoint metadata", path, e))?
        .len();

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)
        .map_err(|_| extraction_error(format!("{} is too short to be safetensors", path.display())))?;
    let header_len = u64::from_le_bytes(len_bytes);
    if header_len == 0 || header_len > MAX_HEADER_SIZE || 8 + header_len > file_len {
        return Err(extraction_error(format!(
            "{} has an invalid safetensors header length ({header_len})",
            path.display()
        )));
    }

    let mut raw = vec![0u8; header_len as usize];
    file.read_exact(&mut raw)
        .map_err(|e| PipelineError::io("reading safetensors header", path, e))?;
    let mut entries: serde_json::Map<String, Value> = serde_json::from_slice(&raw)
        .map_err(|e| extraction_error(format!("malformed safetensors header: {e}")))?;

    let data_start = 8 + header_len;
    let data_len = file_len - data_start;
    let metadata = entries.remove(METADATA_KEY);

    let mut tensors = Vec::with_capacity(entries.len());
    for (name, value) in entries {
        let entry: TensorEntry = serde_json::from_value(value)
            .map_err(|e| extraction_error(format!("tensor {name}: {e}")))?;
        let [begin, end] = entry.data_offsets;
        if begin > end || end > data_len {
            return Err(extraction_error(format!(
                "tensor {name} has out-of-range offsets [{begin}, {end}]"
            )));
        }
        tensors.push((name, entry));
    }
    Ok(Header {
        data_start,
        metadata,
        tensors,
    })
}

/// Which component a tensor key belongs to, and its key inside that component.
fn route(key: &str) -> (Component, &str) {
    PREFIX_ROUTES
        .iter()
        .find_map(|(prefix, component, strip)| {
            let rest = key.strip_prefix(prefix)?;
            Some((*component, if *strip { rest } else { key }))
        })
        .unwrap_or((Component::Unet, key))
}

fn split_checkpoint(source: &Path, targets: &ExtractedComponents) -> Result<()> {
    let mut file =
        File::open(source).map_err(|e| PipelineError::io("opening checkpoint", source, e))?;
    let header = read_header(&mut file, source)?;

    let mut groups: BTreeMap<Component, Vec<(String, TensorEntry)>> = Component::ALL
        .iter()
        .map(|c| (*c, Vec::new()))
        .collect();
    for (key, entry) in &header.tensors {
        let (component, new_key) = route(key);
        if let Some(group) = groups.get_mut(&component) {
            group.push((new_key.to_string(), entry.clone()));
        }
    }

    if groups.get(&Component::Unet).map_or(true, Vec::is_empty) {
        return Err(extraction_error(format!(
            "no UNet tensors found in {}",
            source.display()
        )));
    }

    for (component, tensors) in groups {
        debug!("{}: {} tensors", component, tensors.len());
        write_component(
            &mut file,
            header.data_start,
            header.metadata.as_ref(),
            tensors,
            targets.get(component),
        )?;
    }
    Ok(())
}

fn write_component(
    source: &mut File,
    data_start: u64,
    metadata: Option<&Value>,
    mut tensors: Vec<(String, TensorEntry)>,
    destination: &Path,
) -> Result<()> {
    tensors.sort_by_key(|(_, entry)| entry.data_offsets[0]);

    let mut out_header = serde_json::Map::new();
    if let Some(metadata) = metadata {
        out_header.insert(METADATA_KEY.to_string(), metadata.clone());
    }
    let mut offset = 0u64;
    let mut copies = Vec::with_capacity(tensors.len());
    for (key, entry) in tensors {
        let len = entry.len();
        let rewritten = TensorEntry {
            data_offsets: [offset, offset + len],
            ..entry.clone()
        };
        out_header.insert(key, serde_json::to_value(rewritten)?);
        copies.push((data_start + entry.data_offsets[0], len));
        offset += len;
    }

    let mut header_bytes = serde_json::to_vec(&out_header)?;
    // Keep the data buffer 8-byte aligned.
    while header_bytes.len() % 8 != 0 {
        header_bytes.push(b' ');
    }

    let temp = temp_path(destination);
    let result = (|| -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(&temp)?);
        writer.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
        writer.write_all(&header_bytes)?;
        for (start, len) in copies {
            source.seek(SeekFrom::Start(start))?;
            let copied = std::io::copy(&mut (&mut *source).take(len), &mut writer)?;
            if copied != len {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "checkpoint ended inside tensor data",
                ));
            }
        }
        writer.flush()?;
        drop(writer);
        std::fs::rename(&temp, destination)
    })();

    result.map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        PipelineError::io("writing component", destination, e)
    })
}

fn temp_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(PathsConfig::DOWNLOAD_TEMP_SUFFIX);
    PathBuf::from(name)
}
