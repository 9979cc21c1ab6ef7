use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::admission::{RetryError, RetryPolicy};
use crate::config::{Config, LanguageConfig, ResourceLimits};
use crate::error::{ExecutionError, GradeError, OutcomeError};
use crate::sandbox::{
    ExecutionDriver, ExecutionOutcome, Provisioner, SandboxBackend, SandboxHandle, Verdict,
};
use crate::submission::{
    CaseReport, GradeReport, Metrics, Submission, SubmissionStatus, TestCase,
};

pub const INFRASTRUCTURE_UNAVAILABLE: &str = "infrastructure unavailable";

static NEXT_WORKSPACE: AtomicU64 = AtomicU64::new(0);

/// Grades one submission against its test cases, in order, one sandbox at a time
pub struct TestCaseRunner {
    provisioner: Provisioner,
    driver: ExecutionDriver,
    retry: RetryPolicy,
    limits: ResourceLimits,
    languages: HashMap<String, LanguageConfig>,
    reuse_sandboxes: bool,
    workspace_root: PathBuf,
}

/// How grading stopped before every test case produced an outcome
enum Interrupted {
    Cancelled,
    Infrastructure(String),
}

impl TestCaseRunner {
    pub fn new(
        config: &Config,
        backend: Arc<dyn SandboxBackend>,
        workspace_root: PathBuf,
    ) -> Result<Self> {
        fs::create_dir_all(&workspace_root)?;

        let languages = config
            .languages
            .iter()
            .map(|l| (l.name.clone(), l.clone()))
            .collect();

        Ok(Self {
            provisioner: Provisioner::new(backend),
            driver: ExecutionDriver::new(config.engine.comparison),
            retry: RetryPolicy::new(&config.retry),
            limits: config.limits.clone(),
            languages,
            reuse_sandboxes: config.engine.reuse_sandboxes,
            workspace_root,
        })
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// Runs `cases` in the supplied order and stops at the first one that does not match
    ///
    /// Cancellation tears the in-flight sandbox down and returns
    /// [`GradeError::Cancelled`] without a report.
    pub async fn grade(
        &self,
        submission: &Submission,
        cases: &[TestCase],
        cancel: &CancellationToken,
    ) -> Result<GradeReport, GradeError> {
        let Some(language) = self.languages.get(&submission.language) else {
            return Ok(GradeReport::error_before_execution(format!(
                "language {} is not supported",
                submission.language
            )));
        };
        if cases.is_empty() {
            return Ok(GradeReport::error_before_execution(format!(
                "problem {} has no test cases",
                submission.problem_id
            )));
        }
        if cancel.is_cancelled() {
            return Err(GradeError::Cancelled(submission.id));
        }

        let workspace = match Workspace::create(&self.workspace_root, submission, language) {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("Failed to prepare workspace for submission {}: {e}", submission.id);
                return Ok(GradeReport::error_before_execution(INFRASTRUCTURE_UNAVAILABLE));
            }
        };

        let mut executed = Vec::with_capacity(cases.len());
        let result = self
            .run_cases(submission, language, workspace.path(), cases, cancel, &mut executed)
            .await;

        match result {
            Ok(()) => Ok(build_report(cases, &executed)),
            Err(Interrupted::Cancelled) => {
                log::info!(
                    "Grading of submission {} cancelled after {} test case(s)",
                    submission.id,
                    executed.len()
                );
                Err(GradeError::Cancelled(submission.id))
            }
            Err(Interrupted::Infrastructure(reason)) => {
                log::error!("Grading of submission {} failed: {reason}", submission.id);
                let metrics = metrics_of(&executed, false);
                Ok(GradeReport::new(
                    SubmissionStatus::Error,
                    metrics,
                    Some(INFRASTRUCTURE_UNAVAILABLE.to_string()),
                    visible_reports(cases, &executed),
                ))
            }
        }
    }

    async fn run_cases(
        &self,
        submission: &Submission,
        language: &LanguageConfig,
        code_dir: &Path,
        cases: &[TestCase],
        cancel: &CancellationToken,
        executed: &mut Vec<ExecutionOutcome>,
    ) -> Result<(), Interrupted> {
        let mut reusable: Option<SandboxHandle> = None;

        for (idx, case) in cases.iter().enumerate() {
            let handle = match reusable.take() {
                Some(handle) => match self.provisioner.recycle(handle).await {
                    Ok(handle) => handle,
                    Err(_) => self.acquire(language, code_dir, cancel).await?,
                },
                None => self.acquire(language, code_dir, cancel).await?,
            };

            let outcome = self.driver.run(&handle, case, cancel).await;
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.provisioner.release(handle).await;
                    return Err(match e {
                        ExecutionError::Cancelled => Interrupted::Cancelled,
                        ExecutionError::Infrastructure(e) => Interrupted::Infrastructure(e.to_string()),
                    });
                }
            };

            log::debug!(
                "Submission {} test case {} ({}): {} in {:.1}ms",
                submission.id,
                idx + 1,
                case.id,
                outcome.verdict,
                outcome.elapsed_ms
            );
            let matched = outcome.verdict == Verdict::Matched;
            executed.push(outcome);

            if matched && self.reuse_sandboxes && idx + 1 < cases.len() {
                reusable = Some(handle);
            } else {
                self.provisioner.release(handle).await;
            }

            if !matched {
                break;
            }
        }

        Ok(())
    }

    async fn acquire(
        &self,
        language: &LanguageConfig,
        code_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<SandboxHandle, Interrupted> {
        let acquired = self
            .retry
            .run("sandbox acquisition", cancel, || {
                self.provisioner.acquire(language, code_dir, &self.limits)
            })
            .await;

        match acquired {
            Ok(handle) if cancel.is_cancelled() => {
                self.provisioner.release(handle).await;
                Err(Interrupted::Cancelled)
            }
            Ok(handle) => Ok(handle),
            Err(RetryError::Cancelled) => Err(Interrupted::Cancelled),
            Err(RetryError::Exhausted(e)) => Err(Interrupted::Infrastructure(e.to_string())),
        }
    }
}

/// Maps the executed outcomes to the terminal report
fn build_report(cases: &[TestCase], executed: &[ExecutionOutcome]) -> GradeReport {
    let Some(deciding) = executed.last() else {
        return GradeReport::error_before_execution(INFRASTRUCTURE_UNAVAILABLE);
    };
    let all_matched = executed.len() == cases.len() && deciding.verdict == Verdict::Matched;

    let position = executed.len();
    let case = &cases[position - 1];
    let label = case_label(position, case);
    let (status, failure) = match deciding.verdict {
        Verdict::Matched => (SubmissionStatus::Accepted, None),
        Verdict::Mismatched => (
            SubmissionStatus::WrongAnswer,
            Some(OutcomeError::OutputMismatch { case: label }),
        ),
        Verdict::TimedOut => (
            SubmissionStatus::Error,
            Some(OutcomeError::Timeout { case: label }),
        ),
        Verdict::Faulted(_) if case.is_hidden => {
            (SubmissionStatus::Error, Some(OutcomeError::HiddenFault))
        }
        Verdict::Faulted(fault) => (
            SubmissionStatus::Error,
            Some(OutcomeError::RuntimeFault { case: label, fault }),
        ),
    };

    let diagnostic = failure.map(|failure| {
        let mut text = failure.to_string();
        let excerpt = deciding.stderr_excerpt.trim_end();
        if !case.is_hidden && !excerpt.is_empty() {
            text.push('\n');
            text.push_str(excerpt);
        }
        text
    });

    GradeReport::new(
        status,
        metrics_of(executed, all_matched),
        diagnostic,
        visible_reports(cases, executed),
    )
}

/// Time of the deciding test case, or the slowest one when every case matched
fn metrics_of(executed: &[ExecutionOutcome], all_matched: bool) -> Option<Metrics> {
    let last = executed.last()?;
    let execution_time_ms = if all_matched {
        executed.iter().map(|o| o.elapsed_ms).fold(0.0, f64::max)
    } else {
        last.elapsed_ms
    };
    let memory_usage_mb = executed.iter().map(|o| o.peak_memory_mb).fold(0.0, f64::max);

    Some(Metrics {
        execution_time_ms,
        memory_usage_mb,
    })
}

fn visible_reports(cases: &[TestCase], executed: &[ExecutionOutcome]) -> Vec<CaseReport> {
    cases
        .iter()
        .zip(executed)
        .enumerate()
        .filter(|(_, (case, _))| !case.is_hidden)
        .map(|(idx, (case, outcome))| CaseReport {
            position: idx + 1,
            test_case_id: case.id,
            verdict: outcome.verdict.label().to_string(),
            elapsed_ms: outcome.elapsed_ms,
            peak_memory_mb: outcome.peak_memory_mb,
        })
        .collect()
}

/// Hidden test cases are never told apart from each other
fn case_label(position: usize, case: &TestCase) -> String {
    if case.is_hidden {
        "a hidden test case".to_string()
    } else {
        format!("test case {position}")
    }
}

/// Host directory holding the submitted source, removed on drop
struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    fn create(root: &Path, submission: &Submission, language: &LanguageConfig) -> Result<Self> {
        let serial = NEXT_WORKSPACE.fetch_add(1, Ordering::Relaxed);
        let dir = root.join(format!("submission-{}-{serial}", submission.id));
        fs::create_dir_all(&dir)?;
        let workspace = Self { dir };

        let source = workspace.dir.join(&language.file_name);
        fs::write(&source, &submission.source_code)?;
        fs::set_permissions(&source, fs::Permissions::from_mode(0o444))?;
        fs::set_permissions(&workspace.dir, fs::Permissions::from_mode(0o755))?;

        Ok(workspace)
    }

    fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            log::warn!("Failed to remove workspace {}: {e}", self.dir.display());
        }
    }
}
