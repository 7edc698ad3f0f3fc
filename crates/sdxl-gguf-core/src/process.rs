//! External process invocation.
//!
//! All toolchain commands go through the [`CommandRunner`] trait. The working
//! directory travels with each [`CommandSpec`] and is applied to the child
//! only; the orchestrator's own working directory is never changed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::{PipelineError, Result};

/// A fully described external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory of the child process
    pub current_dir: Option<PathBuf>,
    /// Wall-clock limit; the child is killed when it elapses
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Value of the argument following `flag`, if present.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Combined stdout/stderr for error reports, `None` if both are empty.
    pub fn diagnostics(&self) -> Option<String> {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => None,
            (false, true) => Some(stdout.to_string()),
            (true, false) => Some(stderr.to_string()),
            (false, false) => Some(format!("{stdout}\n{stderr}")),
        }
    }

    pub fn exit_description(&self) -> String {
        match self.code {
            Some(code) => format!("exited with status {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Runs external commands on behalf of the pipeline.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion and capture its output.
    ///
    /// A non-zero exit is not an error at this level; callers classify it.
    /// Errors are reserved for commands that could not be started or that
    /// exceeded their timeout.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait::async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        debug!("Running command: {} (cwd: {:?})", spec, spec.current_dir);

        let pending = cmd.output();
        let output = match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, pending).await.map_err(|_| {
                PipelineError::Timeout {
                    program: spec.program.clone(),
                    after: limit,
                }
            })?,
            None => pending.await,
        }
        .map_err(|e| PipelineError::Spawn {
            program: spec.program.clone(),
            message: e.to_string(),
        })?;

        let output = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!("{} {}", spec.program, output.exit_description());
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder_and_display() {
        let spec = CommandSpec::new("python3")
            .arg("convert.py")
            .arg("--src")
            .path_arg(Path::new("/models/my model_unet.safetensors"))
            .current_dir("/opt/llama.cpp");

        assert_eq!(spec.flag_value("--src"), Some("/models/my model_unet.safetensors"));
        assert_eq!(spec.flag_value("--dst"), None);
        assert_eq!(spec.current_dir, Some(PathBuf::from("/opt/llama.cpp")));
        assert_eq!(
            spec.to_string(),
            "python3 convert.py --src \"/models/my model_unet.safetensors\""
        );
    }

    #[test]
    fn test_output_diagnostics() {
        let output = CommandOutput {
            code: Some(1),
            stdout: "  ".into(),
            stderr: "boom\n".into(),
        };
        assert!(!output.success());
        assert_eq!(output.diagnostics().as_deref(), Some("boom"));
        assert_eq!(output.exit_description(), "exited with status 1");
        assert_eq!(CommandOutput::default().diagnostics(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_uses_child_working_dir() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let before = std::env::current_dir().unwrap();

        let spec = CommandSpec::new("sh")
            .args(["-c", "pwd; echo err >&2; exit 3"])
            .current_dir(temp_dir.path());
        let output = SystemRunner.run(&spec).await.unwrap();

        assert_eq!(output.code, Some(3));
        let reported = PathBuf::from(output.stdout.trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            temp_dir.path().canonicalize().unwrap()
        );
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_timeout() {
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Some(Duration::from_millis(100)));
        let err = SystemRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_system_runner_spawn_failure() {
        let spec = CommandSpec::new("definitely-not-a-real-program-3f9a");
        let err = SystemRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, PipelineError::Spawn { .. }));
    }
}
