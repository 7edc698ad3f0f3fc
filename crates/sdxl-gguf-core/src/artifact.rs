//! Canonical names and locations of stage artifacts.
//!
//! Every artifact name is derived from the checkpoint's base name plus a
//! stage-specific suffix, so a rerun with the same inputs lands on the same
//! paths and an earlier run's output can be picked up again:
//!
//! ```text
//! model.safetensors
//!   extract  -> components/model_unet.safetensors
//!   convert  -> gguf/model-F16.gguf
//!   quantize -> quantized/model_Q5_K_S.gguf
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::PathsConfig;
use crate::conversion::QuantVariant;
use crate::{PipelineError, Result};

/// Suffix the convert stage appends to the base name.
const BASELINE_SUFFIX: &str = "-F16";

/// Processing stage of the pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Extract,
    Convert,
    Quantize,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Extract, Stage::Convert, Stage::Quantize];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Convert => "convert",
            Stage::Quantize => "quantize",
        }
    }

    fn dir_name(&self) -> &'static str {
        match self {
            Stage::Extract => PathsConfig::COMPONENTS_DIR_NAME,
            Stage::Convert => PathsConfig::GGUF_DIR_NAME,
            Stage::Quantize => PathsConfig::QUANTIZED_DIR_NAME,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-checkpoint produced by extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    Unet,
    ClipL,
    ClipG,
    Vae,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::Unet,
        Component::ClipL,
        Component::ClipG,
        Component::Vae,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Unet => "unet",
            Component::ClipL => "clip_l",
            Component::ClipG => "clip_g",
            Component::Vae => "vae",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a path is being resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactTarget {
    /// Extracted sub-checkpoint (`<base>_<component>.safetensors`)
    Component(Component),
    /// Unquantized conversion output (`<base>-F16.gguf`)
    Baseline,
    /// Quantized variant (`<base>_<variant>.gguf`)
    Quantized(QuantVariant),
}

impl ArtifactTarget {
    pub fn stage(&self) -> Stage {
        match self {
            ArtifactTarget::Component(_) => Stage::Extract,
            ArtifactTarget::Baseline => Stage::Convert,
            ArtifactTarget::Quantized(_) => Stage::Quantize,
        }
    }

    fn file_name(&self, base: &str) -> String {
        match self {
            ArtifactTarget::Component(c) => format!("{base}_{c}.safetensors"),
            ArtifactTarget::Baseline => format!("{base}{BASELINE_SUFFIX}.gguf"),
            ArtifactTarget::Quantized(v) => format!("{base}_{v}.gguf"),
        }
    }
}

/// A file produced (or substituted) for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageArtifact {
    pub stage: Stage,
    /// Variant tag, set for quantized artifacts only
    pub variant: Option<QuantVariant>,
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
}

impl StageArtifact {
    /// Describe an existing file as an artifact of `stage`.
    pub fn from_existing(
        stage: Stage,
        variant: Option<QuantVariant>,
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let path = path.into();
        let metadata = std::fs::metadata(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PipelineError::input_not_found(&path),
            _ => PipelineError::io("reading artifact metadata", &path, e),
        })?;
        Ok(Self {
            stage,
            variant,
            path,
            size: metadata.len(),
        })
    }

    /// Size relative to `reference`, in percent.
    pub fn percent_of(&self, reference: u64) -> Option<f64> {
        (reference > 0).then(|| self.size as f64 / reference as f64 * 100.0)
    }
}

/// Outcome of one stage invocation.
pub type StageResult = Result<StageArtifact>;

/// Derives deterministic output paths below a run's output directory.
#[derive(Debug, Clone)]
pub struct ArtifactPathResolver {
    output_dir: PathBuf,
}

impl ArtifactPathResolver {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Directory holding the artifacts of `stage`.
    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.output_dir.join(stage.dir_name())
    }

    /// Canonical output path of `target` for `input`.
    ///
    /// Pure apart from creating the stage directory when it is missing.
    pub fn resolve(&self, input: &Path, target: ArtifactTarget) -> Result<PathBuf> {
        let base = base_name(input)?;
        let dir = self.stage_dir(target.stage());
        std::fs::create_dir_all(&dir)
            .map_err(|e| PipelineError::io("creating stage output directory", &dir, e))?;
        Ok(dir.join(target.file_name(&base)))
    }
}

/// `path` made absolute against the current directory, without touching disk.
pub fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()
        .map_err(|e| PipelineError::io("reading current directory", path, e))?;
    Ok(cwd.join(path))
}

/// The checkpoint base name of `path`, with any stage suffix stripped.
///
/// `model_unet.safetensors`, `model-F16.gguf` and `model_Q8_0.gguf` all
/// yield `model`.
pub fn base_name(path: &Path) -> Result<String> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            PipelineError::config(format!("Cannot derive a base name from {}", path.display()))
        })?;

    let mut suffixes: Vec<String> = Component::ALL
        .iter()
        .map(|c| format!("_{c}"))
        .chain(QuantVariant::ALL.iter().map(|v| format!("_{v}")))
        .collect();
    suffixes.push(BASELINE_SUFFIX.to_string());

    let mut base = stem;
    loop {
        let stripped = suffixes
            .iter()
            .filter_map(|suffix| base.strip_suffix(suffix.as_str()))
            .find(|rest| !rest.is_empty())
            .map(str::to_string);
        match stripped {
            Some(rest) => base = rest,
            None => return Ok(base),
        }
    }
}
