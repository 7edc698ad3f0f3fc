//! Per-stage outcome records.

use std::fmt;

use crate::artifact::{Stage, StageArtifact, StageResult};
use crate::toolchain::ProvisionWarning;
use crate::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// Not attempted, either not reached or halted by an earlier failure
    Pending,
    Skipped,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Skipped => "skipped",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    /// Artifact handed on in place of this stage's output when skipped
    pub substitute: Option<StageArtifact>,
    /// One entry per invocation; quantize has one per variant
    pub results: Vec<StageResult>,
}

impl StageReport {
    fn pending(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            substitute: None,
            results: Vec::new(),
        }
    }

    pub(crate) fn skip(&mut self, substitute: Option<StageArtifact>) {
        self.status = StageStatus::Skipped;
        self.substitute = substitute;
    }

    pub(crate) fn start(&mut self) {
        self.status = StageStatus::Running;
    }

    pub(crate) fn record(&mut self, result: StageResult) {
        self.results.push(result);
    }

    /// Close the stage: succeeded if any invocation produced an artifact.
    pub(crate) fn finish(&mut self) {
        self.status = if self.artifacts().next().is_some() {
            StageStatus::Succeeded
        } else {
            StageStatus::Failed
        };
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &StageArtifact> {
        self.results.iter().filter_map(|r| r.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &PipelineError> {
        self.results.iter().filter_map(|r| r.as_ref().err())
    }

    /// The artifact the next stage consumes: the produced one, else the substitute.
    pub fn output(&self) -> Option<&StageArtifact> {
        self.artifacts().next().or(self.substitute.as_ref())
    }
}

/// Ordered outcome of one pipeline run.
#[derive(Debug)]
pub struct RunReport {
    stages: Vec<StageReport>,
    pub provision_warnings: Vec<ProvisionWarning>,
}

impl Default for RunReport {
    fn default() -> Self {
        Self {
            stages: Stage::ALL.iter().map(|s| StageReport::pending(*s)).collect(),
            provision_warnings: Vec::new(),
        }
    }
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage reports in execution order.
    pub fn stages(&self) -> &[StageReport] {
        &self.stages
    }

    pub fn stage(&self, stage: Stage) -> &StageReport {
        &self.stages[stage as usize]
    }

    pub(crate) fn stage_mut(&mut self, stage: Stage) -> &mut StageReport {
        &mut self.stages[stage as usize]
    }

    /// True when no stage failed.
    pub fn succeeded(&self) -> bool {
        self.stages.iter().all(|s| s.status != StageStatus::Failed)
    }

    /// The unquantized GGUF this run produced or was given.
    pub fn baseline(&self) -> Option<&StageArtifact> {
        self.stage(Stage::Convert).output()
    }

    pub fn quantized(&self) -> impl Iterator<Item = &StageArtifact> {
        self.stage(Stage::Quantize).artifacts()
    }

    pub fn is_degraded(&self) -> bool {
        !self.provision_warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::QuantVariant;
    use std::path::PathBuf;

    fn artifact(stage: Stage, variant: Option<QuantVariant>, name: &str) -> StageArtifact {
        StageArtifact {
            stage,
            variant,
            path: PathBuf::from(name),
            size: 10,
        }
    }

    #[test]
    fn test_new_report_is_pending() {
        let report = RunReport::new();
        let stages: Vec<Stage> = report.stages().iter().map(|s| s.stage).collect();
        assert_eq!(stages, Stage::ALL);
        assert!(report
            .stages()
            .iter()
            .all(|s| s.status == StageStatus::Pending));
        assert!(report.succeeded());
    }

    #[test]
    fn test_partial_quantize_succeeds() {
        let mut report = RunReport::new();
        let quantize = report.stage_mut(Stage::Quantize);
        quantize.start();
        quantize.record(Ok(artifact(Stage::Quantize, Some(QuantVariant::Q4KS), "a")));
        quantize.record(Err(PipelineError::Quantization {
            variant: "Q5_K_S".into(),
            message: "exit 1".into(),
            stderr: None,
        }));
        quantize.finish();

        let quantize = report.stage(Stage::Quantize);
        assert_eq!(quantize.status, StageStatus::Succeeded);
        assert_eq!(quantize.failures().count(), 1);
        assert_eq!(report.quantized().count(), 1);
        assert!(report.succeeded());
    }

    #[test]
    fn test_all_failures_fail_the_run() {
        let mut report = RunReport::new();
        let convert = report.stage_mut(Stage::Convert);
        convert.start();
        convert.record(Err(PipelineError::Conversion {
            message: "no output".into(),
            diagnostics: None,
        }));
        convert.finish();

        assert_eq!(report.stage(Stage::Convert).status, StageStatus::Failed);
        assert!(!report.succeeded());
        assert!(report.baseline().is_none());
    }

    #[test]
    fn test_baseline_falls_back_to_substitute() {
        let mut report = RunReport::new();
        report
            .stage_mut(Stage::Convert)
            .skip(Some(artifact(Stage::Convert, None, "model-F16.gguf")));
        assert_eq!(
            report.baseline().unwrap().path,
            PathBuf::from("model-F16.gguf")
        );
        assert_eq!(report.stage(Stage::Convert).status, StageStatus::Skipped);
    }
}
