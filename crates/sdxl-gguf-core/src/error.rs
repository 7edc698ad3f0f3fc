//! Error types for the conversion pipeline.
//!
//! Every failure an external step can produce is classified here so the
//! orchestrator can decide whether a stage, a single variant, or the whole
//! run is affected.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Step of toolchain provisioning that failed fatally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    Clone,
    Fetch,
    Build,
}

impl ProvisionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionStep::Clone => "clone",
            ProvisionStep::Fetch => "fetch",
            ProvisionStep::Build => "build",
        }
    }
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of required file was missing before an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    Input,
    Binary,
}

impl std::fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotFoundKind::Input => f.write_str("input"),
            NotFoundKind::Binary => f.write_str("binary"),
        }
    }
}

/// Main error type for the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    // Run configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Toolchain bootstrap errors
    #[error("Toolchain provisioning failed at {step}: {message}")]
    Provision {
        step: ProvisionStep,
        message: String,
        /// Captured stdout/stderr of the failing command, if any
        diagnostics: Option<String>,
    },

    // Missing files detected before an invocation
    #[error("Required {kind} not found: {path}")]
    NotFound { kind: NotFoundKind, path: PathBuf },

    // External process ran but its postcondition failed
    #[error("Conversion failed: {message}")]
    Conversion {
        message: String,
        diagnostics: Option<String>,
    },

    #[error("Quantization to {variant} failed: {message}")]
    Quantization {
        variant: String,
        message: String,
        stderr: Option<String>,
    },

    // Collaborator errors
    #[error("Extraction failed: {message}")]
    Extraction { message: String },

    #[error("Download failed: {message}")]
    Download { message: String },

    // Process plumbing
    #[error("Failed to start {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("{program} did not finish within {after:?}")]
    Timeout { program: String, after: Duration },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Network errors
    #[error("Network error: {message}")]
    Network { message: String },
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Network {
            message: err.to_string(),
        }
    }
}

impl PipelineError {
    /// Create an IO error with a short context string and a path.
    pub fn io(context: &str, path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        PipelineError::Io {
            message: format!("{context}: {err}"),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Config {
            message: message.into(),
        }
    }

    pub fn input_not_found(path: impl Into<PathBuf>) -> Self {
        PipelineError::NotFound {
            kind: NotFoundKind::Input,
            path: path.into(),
        }
    }

    /// Short machine-readable classification used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Config { .. } => "config",
            PipelineError::Provision { .. } => "provision",
            PipelineError::NotFound { .. } => "not_found",
            PipelineError::Conversion { .. } => "conversion",
            PipelineError::Quantization { .. } => "quantization",
            PipelineError::Extraction { .. } => "extraction",
            PipelineError::Download { .. } => "download",
            PipelineError::Spawn { .. } => "spawn",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::Io { .. } => "io",
            PipelineError::Json { .. } => "json",
            PipelineError::Network { .. } => "network",
        }
    }

    /// Whether this error was raised by run validation, before any process ran.
    pub fn is_config_error(&self) -> bool {
        matches!(self, PipelineError::Config { .. })
    }
}
