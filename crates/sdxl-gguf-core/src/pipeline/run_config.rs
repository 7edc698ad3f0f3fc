//! Run configuration and its validation.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::artifact::{Stage, StageArtifact};
use crate::config::PathsConfig;
use crate::conversion::QuantVariant;
use crate::{PipelineError, Result};

/// Where the checkpoint for the extract stage comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A checkpoint already on disk
    Local(PathBuf),
    /// A CivitAI model version, downloaded when the extract stage runs
    Civitai {
        name: String,
        version_id: String,
        token: String,
    },
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Local(path) => f.debug_tuple("Local").field(path).finish(),
            ModelSource::Civitai {
                name, version_id, ..
            } => f
                .debug_struct("Civitai")
                .field("name", name)
                .field("version_id", version_id)
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// Everything one pipeline run needs to know.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub source: Option<ModelSource>,
    pub output_dir: PathBuf,
    pub skip_extract: bool,
    /// Existing UNet to convert when extraction is skipped
    pub unet_path: Option<PathBuf>,
    /// Use the toolchain as found instead of provisioning a fresh one
    pub skip_setup: bool,
    pub skip_convert: bool,
    /// Existing baseline GGUF to quantize when conversion is skipped
    pub gguf_path: Option<PathBuf>,
    pub skip_quant: bool,
    pub variants: Vec<QuantVariant>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            source: None,
            output_dir: PathBuf::from(PathsConfig::DEFAULT_OUTPUT_DIR),
            skip_extract: false,
            unet_path: None,
            skip_setup: false,
            skip_convert: false,
            gguf_path: None,
            skip_quant: false,
            variants: vec![QuantVariant::DEFAULT],
        }
    }
}

impl RunConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(ModelSource::Local(path.into()));
        self
    }

    pub fn with_civitai(
        mut self,
        name: impl Into<String>,
        version_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        self.source = Some(ModelSource::Civitai {
            name: name.into(),
            version_id: version_id.into(),
            token: token.into(),
        });
        self
    }

    /// Skip extraction, optionally supplying the UNet to continue from.
    pub fn skip_extract(mut self, unet_path: Option<PathBuf>) -> Self {
        self.skip_extract = true;
        self.unet_path = unet_path;
        self
    }

    pub fn skip_setup(mut self) -> Self {
        self.skip_setup = true;
        self
    }

    /// Skip conversion, optionally supplying the baseline GGUF to continue from.
    pub fn skip_convert(mut self, gguf_path: Option<PathBuf>) -> Self {
        self.skip_convert = true;
        self.gguf_path = gguf_path;
        self
    }

    pub fn skip_quant(mut self) -> Self {
        self.skip_quant = true;
        self
    }

    pub fn with_variants(mut self, variants: Vec<QuantVariant>) -> Self {
        self.variants = variants;
        self
    }

    /// Check the skip/path combination and resolve what each stage will do.
    ///
    /// Runs before anything touches the toolchain or spawns a process.
    pub fn validate(&self) -> Result<RunPlan> {
        let extract = if self.skip_extract {
            None
        } else {
            Some(self.validated_source()?)
        };

        let unet_substitute = match (&self.unet_path, self.skip_extract) {
            (Some(path), true) => Some(existing(Stage::Extract, path)?),
            (None, true) if !self.skip_convert => {
                return Err(PipelineError::config(
                    "A UNet path is required when skipping extraction and not skipping conversion",
                ));
            }
            _ => None,
        };

        let gguf_substitute = match (&self.gguf_path, self.skip_convert) {
            (Some(path), true) => Some(existing(Stage::Convert, path)?),
            (None, true) if !self.skip_quant => {
                return Err(PipelineError::config(
                    "A GGUF path is required when skipping conversion and not skipping quantization",
                ));
            }
            _ => None,
        };

        let variants = if self.skip_quant {
            Vec::new()
        } else {
            dedup(&self.variants)
        };
        if !self.skip_quant && variants.is_empty() {
            return Err(PipelineError::config(
                "At least one quantization type is required unless quantization is skipped",
            ));
        }

        Ok(RunPlan {
            extract,
            unet_substitute,
            convert: !self.skip_convert,
            gguf_substitute,
            variants,
            skip_setup: self.skip_setup,
        })
    }

    fn validated_source(&self) -> Result<ModelSource> {
        match &self.source {
            None => Err(PipelineError::config(
                "A model path or CivitAI download is required when not skipping extraction",
            )),
            Some(ModelSource::Local(path)) => {
                if path.is_file() {
                    Ok(ModelSource::Local(path.clone()))
                } else {
                    Err(PipelineError::input_not_found(path))
                }
            }
            Some(ModelSource::Civitai {
                name,
                version_id,
                token,
            }) => {
                if [name, version_id, token].iter().any(|s| s.trim().is_empty()) {
                    return Err(PipelineError::config(
                        "A CivitAI download requires a model name, a version id and a token",
                    ));
                }
                Ok(ModelSource::Civitai {
                    name: name.clone(),
                    version_id: version_id.clone(),
                    token: token.clone(),
                })
            }
        }
    }
}

fn existing(stage: Stage, path: &Path) -> Result<StageArtifact> {
    if !path.is_file() {
        return Err(PipelineError::input_not_found(path));
    }
    StageArtifact::from_existing(stage, None, path)
}

fn dedup(variants: &[QuantVariant]) -> Vec<QuantVariant> {
    let mut out: Vec<QuantVariant> = Vec::with_capacity(variants.len());
    for v in variants {
        if !out.contains(v) {
            out.push(*v);
        }
    }
    out
}

/// A validated run: which stages execute and what skipped stages hand on.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub(crate) extract: Option<ModelSource>,
    pub(crate) unet_substitute: Option<StageArtifact>,
    pub(crate) convert: bool,
    pub(crate) gguf_substitute: Option<StageArtifact>,
    pub(crate) variants: Vec<QuantVariant>,
    pub(crate) skip_setup: bool,
}

impl RunPlan {
    pub fn runs(&self, stage: Stage) -> bool {
        match stage {
            Stage::Extract => self.extract.is_some(),
            Stage::Convert => self.convert,
            Stage::Quantize => !self.variants.is_empty(),
        }
    }

    /// Whether any stage needs the conversion toolchain.
    pub fn needs_toolchain(&self) -> bool {
        self.runs(Stage::Convert) || self.runs(Stage::Quantize)
    }

    pub fn variants(&self) -> &[QuantVariant] {
        &self.variants
    }
}
