//! Handling of an output file left behind by an earlier run.
//!
//! The earlier file is renamed to `<name>.prev` while the tool runs, so the
//! existence check after the run only sees this run's output. It is put back
//! if the run fails and removed once a new output is in place.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::{PipelineError, Result};

const BACKUP_SUFFIX: &str = ".prev";

/// An output path, with any earlier file at that path moved aside.
#[derive(Debug)]
pub(crate) struct PriorOutput {
    path: PathBuf,
    backup: Option<PathBuf>,
}

impl PriorOutput {
    /// Move an existing `output` aside before a tool writes it fresh.
    ///
    /// Fails with a config error when `output` is the same file as `input`;
    /// nothing is renamed in that case.
    pub(crate) fn set_aside(input: &Path, output: &Path) -> Result<Self> {
        if same_file(input, output) {
            return Err(PipelineError::config(format!(
                "input {} is also the output path for this stage; \
                 move it or pick a different output directory",
                input.display()
            )));
        }

        if !output.exists() {
            return Ok(Self {
                path: output.to_path_buf(),
                backup: None,
            });
        }

        let backup = backup_path(output);
        std::fs::rename(output, &backup)
            .map_err(|e| PipelineError::io("moving earlier output aside", output, e))?;
        debug!("Moved earlier output to {}", backup.display());
        Ok(Self {
            path: output.to_path_buf(),
            backup: Some(backup),
        })
    }

    /// The new output is in place; drop the earlier one.
    pub(crate) fn discard(self) {
        if let Some(backup) = self.backup {
            if let Err(e) = std::fs::remove_file(&backup) {
                warn!("Failed to remove {}: {}", backup.display(), e);
            }
        }
    }

    /// The run failed; put the earlier output back in place.
    pub(crate) fn restore(self) {
        let Some(backup) = self.backup else {
            return;
        };
        match std::fs::rename(&backup, &self.path) {
            Ok(()) => info!("Restored earlier output {}", self.path.display()),
            Err(e) => warn!(
                "Failed to restore earlier output from {}: {}",
                backup.display(),
                e
            ),
        }
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(BACKUP_SUFFIX);
    path.with_file_name(name)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
