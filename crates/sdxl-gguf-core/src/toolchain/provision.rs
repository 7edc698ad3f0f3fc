//! Destructive, from-scratch toolchain provisioning.
//!
//! Each call removes any existing tree, clones upstream, fetches the pinned
//! conversion artifacts, checks out the pinned tag, applies the patch and
//! builds `llama-quantize`. Clone, fetch and build failures are fatal; the
//! gguf install, the checkout and the patch are best-effort and surface as
//! [`ProvisionOutcome::Degraded`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::manifest::{sha256_file, FetchedArtifact, ToolchainManifest};
use super::{BuildStatus, Toolchain};
use crate::config::{ToolchainConfig, ToolchainSettings};
use crate::error::ProvisionStep;
use crate::network::ArtifactFetcher;
use crate::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::{PipelineError, Result};

/// A non-fatal provisioning step that did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionWarning {
    /// The in-tree gguf Python package could not be installed
    GgufInstall(String),
    /// The pinned tag could not be checked out; the patch was not attempted
    Checkout(String),
    /// The compatibility patch did not apply
    Patch(String),
}

impl fmt::Display for ProvisionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionWarning::GgufInstall(detail) => write!(f, "gguf install failed: {detail}"),
            ProvisionWarning::Checkout(detail) => write!(
                f,
                "checkout of {} failed, patch skipped: {detail}",
                ToolchainConfig::PINNED_TAG
            ),
            ProvisionWarning::Patch(detail) => write!(f, "patch did not apply: {detail}"),
        }
    }
}

/// Result of a successful provisioning call.
#[derive(Debug, Clone)]
pub enum ProvisionOutcome {
    /// Every step succeeded
    Ready(Toolchain),
    /// Built, but one or more best-effort steps failed
    Degraded {
        toolchain: Toolchain,
        warnings: Vec<ProvisionWarning>,
    },
}

impl ProvisionOutcome {
    fn from_parts(toolchain: Toolchain, warnings: Vec<ProvisionWarning>) -> Self {
        if warnings.is_empty() {
            ProvisionOutcome::Ready(toolchain)
        } else {
            ProvisionOutcome::Degraded {
                toolchain,
                warnings,
            }
        }
    }

    pub fn toolchain(&self) -> &Toolchain {
        match self {
            ProvisionOutcome::Ready(toolchain) => toolchain,
            ProvisionOutcome::Degraded { toolchain, .. } => toolchain,
        }
    }

    pub fn into_toolchain(self) -> Toolchain {
        match self {
            ProvisionOutcome::Ready(toolchain) => toolchain,
            ProvisionOutcome::Degraded { toolchain, .. } => toolchain,
        }
    }

    pub fn warnings(&self) -> &[ProvisionWarning] {
        match self {
            ProvisionOutcome::Ready(_) => &[],
            ProvisionOutcome::Degraded { warnings, .. } => warnings,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ProvisionOutcome::Degraded { .. })
    }
}

/// Builds a fresh toolchain tree at the configured root.
///
/// A root must not be shared by concurrent provisioners: every call starts
/// by deleting it.
pub struct ToolchainProvisioner {
    settings: ToolchainSettings,
    runner: Arc<dyn CommandRunner>,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl ToolchainProvisioner {
    pub fn new(
        settings: ToolchainSettings,
        runner: Arc<dyn CommandRunner>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        Self {
            settings,
            runner,
            fetcher,
        }
    }

    pub fn settings(&self) -> &ToolchainSettings {
        &self.settings
    }

    pub async fn provision(&self) -> Result<ProvisionOutcome> {
        let root = self.settings.root.clone();
        info!("Setting up toolchain at {}", root.display());

        let mut warnings = Vec::new();

        self.remove_existing(&root).await?;
        self.git_clone(&root).await?;
        let mut toolchain = Toolchain::new(root.clone(), BuildStatus::Cloned);

        if let Err(warning) = self.ensure_gguf_installed(&root).await {
            warn!("{}", warning);
            warnings.push(warning);
        }

        let artifacts = self.fetch_artifacts(&root).await?;

        let patch_applied = match self.checkout_and_patch(&root).await {
            Ok(()) => {
                toolchain.set_status(BuildStatus::Patched);
                true
            }
            Err(warning) => {
                warn!("{}", warning);
                warn!("Continuing without patch. This may affect compatibility.");
                warnings.push(warning);
                false
            }
        };

        self.build(&toolchain).await?;
        toolchain.set_status(BuildStatus::Built);

        let manifest = ToolchainManifest::new(
            artifacts,
            patch_applied,
            warnings.iter().map(ToString::to_string).collect(),
        );
        if let Err(e) = manifest.save(&root) {
            warn!("Failed to write toolchain manifest: {}", e);
        }

        info!("Toolchain setup complete ({} warning(s))", warnings.len());
        Ok(ProvisionOutcome::from_parts(toolchain, warnings))
    }

    // -- Steps --------------------------------------------------------------

    async fn remove_existing(&self, root: &Path) -> Result<()> {
        if tokio::fs::try_exists(root).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(root)
                .await
                .map_err(|e| PipelineError::io("removing existing toolchain", root, e))?;
            info!("Removed existing toolchain directory {}", root.display());
        }
        if let Some(parent) = root.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::io("creating toolchain parent dir", parent, e))?;
        }
        Ok(())
    }

    async fn git_clone(&self, root: &Path) -> Result<()> {
        info!("Cloning {}", ToolchainConfig::REPO_URL);
        let spec = self
            .command("git")
            .args(["clone", ToolchainConfig::REPO_URL])
            .path_arg(root);
        self.run_fatal(ProvisionStep::Clone, &spec).await?;
        Ok(())
    }

    async fn ensure_gguf_installed(&self, root: &Path) -> std::result::Result<(), ProvisionWarning> {
        let import_check = self
            .command(&self.settings.python)
            .args(["-c", "import gguf"]);
        if matches!(self.runner.run(&import_check).await, Ok(ref o) if o.success()) {
            info!("gguf already installed");
            return Ok(());
        }

        info!("Installing gguf-py...");
        let install = self
            .command(&self.settings.python)
            .args(["-m", "pip", "install"])
            .arg(format!("./{}", ToolchainConfig::GGUF_PY_DIR))
            .current_dir(root);
        self.run_best_effort(&install)
            .await
            .map(|_| ())
            .map_err(ProvisionWarning::GgufInstall)
    }

    async fn fetch_artifacts(&self, root: &Path) -> Result<Vec<FetchedArtifact>> {
        info!("Downloading conversion script and patch...");
        let wanted = [
            (ToolchainConfig::CONVERT_SCRIPT_NAME, ToolchainConfig::CONVERT_SCRIPT_URL),
            (ToolchainConfig::CONVERT_G_SCRIPT_NAME, ToolchainConfig::CONVERT_G_SCRIPT_URL),
            (ToolchainConfig::PATCH_NAME, ToolchainConfig::PATCH_URL),
        ];

        let mut fetched = Vec::with_capacity(wanted.len());
        for (name, url) in wanted {
            let dest = root.join(name);
            let bytes = self.fetcher.fetch(url, &dest).await.map_err(|e| {
                PipelineError::Provision {
                    step: ProvisionStep::Fetch,
                    message: format!("{name} from {url}: {e}"),
                    diagnostics: None,
                }
            })?;
            let sha256 = sha256_file(&dest).map_err(|e| PipelineError::Provision {
                step: ProvisionStep::Fetch,
                message: format!("{name} was not written: {e}"),
                diagnostics: None,
            })?;
            debug!("Fetched {} ({} bytes, sha256 {})", name, bytes, sha256);
            fetched.push(FetchedArtifact {
                name: name.to_string(),
                url: url.to_string(),
                bytes,
                sha256,
            });
        }
        Ok(fetched)
    }

    async fn checkout_and_patch(&self, root: &Path) -> std::result::Result<(), ProvisionWarning> {
        info!("Applying patch to toolchain...");
        let checkout = self
            .command("git")
            .arg("checkout")
            .arg(format!("tags/{}", ToolchainConfig::PINNED_TAG))
            .current_dir(root);
        self.run_best_effort(&checkout)
            .await
            .map_err(ProvisionWarning::Checkout)?;

        let apply = self
            .command("git")
            .args(["apply", ToolchainConfig::PATCH_NAME])
            .current_dir(root);
        self.run_best_effort(&apply)
            .await
            .map(|_| ())
            .map_err(ProvisionWarning::Patch)
    }

    async fn build(&self, toolchain: &Toolchain) -> Result<()> {
        info!("Building {}...", ToolchainConfig::BUILD_TARGET);
        let build_dir = toolchain.build_dir();
        tokio::fs::create_dir_all(&build_dir)
            .await
            .map_err(|e| PipelineError::io("creating build dir", &build_dir, e))?;

        let configure = self.command("cmake").arg("..").current_dir(&build_dir);
        self.run_fatal(ProvisionStep::Build, &configure).await?;

        let compile = self
            .command("cmake")
            .args(["--build", ".", "--config", ToolchainConfig::BUILD_CONFIG])
            .arg(format!("-j{}", self.settings.build_jobs))
            .args(["--target", ToolchainConfig::BUILD_TARGET])
            .current_dir(&build_dir);
        self.run_fatal(ProvisionStep::Build, &compile).await?;

        let binary = toolchain
            .locate_quantize_binary()
            .map_err(|e| PipelineError::Provision {
                step: ProvisionStep::Build,
                message: format!("build finished but produced no quantizer: {e}"),
                diagnostics: None,
            })?;
        info!("Built {}", binary.display());
        Ok(())
    }

    // -- Command helpers ----------------------------------------------------

    fn command(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program).timeout(self.settings.command_timeout)
    }

    async fn run_fatal(&self, step: ProvisionStep, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self
            .runner
            .run(spec)
            .await
            .map_err(|e| PipelineError::Provision {
                step,
                message: e.to_string(),
                diagnostics: None,
            })?;
        if !output.success() {
            return Err(PipelineError::Provision {
                step,
                message: format!("`{}` {}", spec, output.exit_description()),
                diagnostics: output.diagnostics(),
            });
        }
        Ok(output)
    }

    /// Run a step whose failure is reported rather than propagated.
    async fn run_best_effort(&self, spec: &CommandSpec) -> std::result::Result<CommandOutput, String> {
        match self.runner.run(spec).await {
            Ok(output) if output.success() => Ok(output),
            Ok(output) => Err(match output.diagnostics() {
                Some(diag) => format!("`{}` {}: {}", spec, output.exit_description(), diag),
                None => format!("`{}` {}", spec, output.exit_description()),
            }),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Simulates git/cmake/python by touching the files they would create.
    #[derive(Default)]
    struct FakeToolchainRunner {
        calls: Mutex<Vec<CommandSpec>>,
        fail_patch: bool,
        fail_build: bool,
        fail_clone: bool,
        gguf_installed: bool,
    }

    impl FakeToolchainRunner {
        fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, program: &str, first_arg: &str) -> usize {
            self.calls()
                .iter()
                .filter(|c| c.program == program && c.args.first().map(String::as_str) == Some(first_arg))
                .count()
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for FakeToolchainRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            let ok = CommandOutput {
                code: Some(0),
                ..Default::default()
            };
            let failed = |stderr: &str| CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: stderr.to_string(),
            };

            match (spec.program.as_str(), spec.args.first().map(String::as_str)) {
                ("git", Some("clone")) => {
                    if self.fail_clone {
                        return Ok(failed("fatal: unable to access"));
                    }
                    let root = PathBuf::from(spec.args.last().unwrap());
                    assert!(!root.exists(), "clone target must not exist");
                    std::fs::create_dir_all(root.join(".git")).unwrap();
                    Ok(ok)
                }
                ("git", Some("apply")) if self.fail_patch => Ok(failed("error: patch failed")),
                ("python3", Some("-c")) if !self.gguf_installed => {
                    Ok(failed("ModuleNotFoundError: No module named 'gguf'"))
                }
                ("cmake", Some("--build")) => {
                    if self.fail_build {
                        return Ok(failed("make: *** [all] Error 2"));
                    }
                    let build_dir = spec.current_dir.clone().unwrap();
                    let bin = build_dir.join("bin");
                    std::fs::create_dir_all(&bin).unwrap();
                    std::fs::write(bin.join(binary_name_for_test()), b"").unwrap();
                    Ok(ok)
                }
                _ => Ok(ok),
            }
        }
    }

    fn binary_name_for_test() -> &'static str {
        if cfg!(windows) {
            "llama-quantize.exe"
        } else {
            "llama-quantize"
        }
    }

    #[derive(Default)]
    struct FakeFetcher {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ArtifactFetcher for FakeFetcher {
        async fn fetch(&self, url: &str, destination: &Path) -> Result<u64> {
            if self.fail {
                return Err(PipelineError::Network {
                    message: format!("HTTP 404 for {url}"),
                });
            }
            std::fs::write(destination, url.as_bytes()).unwrap();
            Ok(url.len() as u64)
        }
    }

    fn provisioner(
        root: &Path,
        runner: Arc<FakeToolchainRunner>,
        fetcher: FakeFetcher,
    ) -> ToolchainProvisioner {
        let settings = ToolchainSettings::default()
            .with_root(root)
            .with_build_jobs(10);
        ToolchainProvisioner::new(settings, runner, Arc::new(fetcher))
    }

    #[tokio::test]
    async fn test_provision_ready() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("llama.cpp");
        let runner = Arc::new(FakeToolchainRunner {
            gguf_installed: true,
            ..Default::default()
        });

        let outcome = provisioner(&root, runner.clone(), FakeFetcher::default())
            .provision()
            .await
            .unwrap();

        assert!(!outcome.is_degraded());
        assert_eq!(outcome.toolchain().status(), BuildStatus::Built);
        assert!(root.join("convert.py").exists());
        assert!(root.join("convert_g.py").exists());
        assert!(root.join("lcpp.patch").exists());

        let manifest = ToolchainManifest::load(&root).unwrap().unwrap();
        assert!(manifest.patch_applied);
        assert_eq!(manifest.artifacts.len(), 3);

        // No pip install when gguf is importable.
        assert_eq!(runner.count("python3", "-m"), 0);

        let calls = runner.calls();
        let checkout = calls
            .iter()
            .find(|c| c.args.first().map(String::as_str) == Some("checkout"))
            .unwrap();
        assert_eq!(checkout.args[1], "tags/b3600");
        assert_eq!(checkout.current_dir.as_deref(), Some(root.as_path()));

        let compile = calls
            .iter()
            .find(|c| c.program == "cmake" && c.args[0] == "--build")
            .unwrap();
        assert_eq!(
            compile.args,
            vec!["--build", ".", "--config", "Debug", "-j10", "--target", "llama-quantize"]
        );
        assert_eq!(compile.current_dir, Some(root.join("build")));
    }

    #[tokio::test]
    async fn test_provision_is_destructive_each_call() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("llama.cpp");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("stale-build-output"), b"old").unwrap();

        let runner = Arc::new(FakeToolchainRunner {
            gguf_installed: true,
            ..Default::default()
        });
        let provisioner = provisioner(&root, runner.clone(), FakeFetcher::default());

        provisioner.provision().await.unwrap();
        assert_eq!(runner.count("git", "clone"), 1);
        assert!(!root.join("stale-build-output").exists());

        std::fs::write(root.join("marker"), b"from first run").unwrap();
        provisioner.provision().await.unwrap();
        assert_eq!(runner.count("git", "clone"), 2);
        assert!(!root.join("marker").exists());
        assert_eq!(runner.count("git", "pull"), 0);
    }

    #[tokio::test]
    async fn test_patch_failure_is_degraded_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("llama.cpp");
        let runner = Arc::new(FakeToolchainRunner {
            fail_patch: true,
            gguf_installed: true,
            ..Default::default()
        });

        let outcome = provisioner(&root, runner, FakeFetcher::default())
            .provision()
            .await
            .unwrap();

        assert!(outcome.is_degraded());
        assert_eq!(outcome.toolchain().status(), BuildStatus::Built);
        assert_eq!(outcome.warnings().len(), 1);
        assert!(matches!(outcome.warnings()[0], ProvisionWarning::Patch(_)));
        assert!(outcome.warnings()[0].to_string().contains("patch failed"));

        let manifest = ToolchainManifest::load(&root).unwrap().unwrap();
        assert!(!manifest.patch_applied);
        assert_eq!(manifest.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_gguf_is_installed_from_tree() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("llama.cpp");
        let runner = Arc::new(FakeToolchainRunner::default());

        let outcome = provisioner(&root, runner.clone(), FakeFetcher::default())
            .provision()
            .await
            .unwrap();
        assert!(!outcome.is_degraded());

        let install = runner
            .calls()
            .into_iter()
            .find(|c| c.program == "python3" && c.args.first().map(String::as_str) == Some("-m"))
            .unwrap();
        assert_eq!(install.args, vec!["-m", "pip", "install", "./gguf-py"]);
        assert_eq!(install.current_dir, Some(root));
    }

    #[tokio::test]
    async fn test_clone_failure_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeToolchainRunner {
            fail_clone: true,
            ..Default::default()
        });

        let err = provisioner(&temp_dir.path().join("llama.cpp"), runner.clone(), FakeFetcher::default())
            .provision()
            .await
            .unwrap_err();
        match err {
            PipelineError::Provision {
                step, diagnostics, ..
            } => {
                assert_eq!(step, ProvisionStep::Clone);
                assert!(diagnostics.unwrap().contains("unable to access"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeToolchainRunner {
            gguf_installed: true,
            ..Default::default()
        });

        let err = provisioner(
            &temp_dir.path().join("llama.cpp"),
            runner.clone(),
            FakeFetcher { fail: true },
        )
        .provision()
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Provision {
                step: ProvisionStep::Fetch,
                ..
            }
        ));
        assert_eq!(runner.count("cmake", ".."), 0);
    }

    #[tokio::test]
    async fn test_build_failure_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeToolchainRunner {
            gguf_installed: true,
            fail_build: true,
            ..Default::default()
        });

        let err = provisioner(&temp_dir.path().join("llama.cpp"), runner, FakeFetcher::default())
            .provision()
            .await
            .unwrap_err();
        match err {
            PipelineError::Provision {
                step, diagnostics, ..
            } => {
                assert_eq!(step, ProvisionStep::Build);
                assert!(diagnostics.unwrap().contains("Error 2"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
