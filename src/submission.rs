use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type SubmissionId = i64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Accepted,
    WrongAnswer,
    Error,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::WrongAnswer => "wrong_answer",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "wrong_answer" => Ok(Self::WrongAnswer),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown submission status {other:?}")),
        }
    }
}

/// A submission as stored by the collaborator layer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Submission {
    pub id: SubmissionId,
    pub user_id: i64,
    pub problem_id: i64,
    pub source_code: String,
    pub language: String,
    pub status: SubmissionStatus,
    pub execution_time_ms: Option<f64>,
    pub memory_usage_mb: Option<f64>,
    pub diagnostic: Option<String>,
    /// Newest grading attempt that claimed this submission
    pub attempt: i64,
    pub submitted_at: Option<String>,
}

impl Submission {
    /// A fresh pending submission, as the collaborator layer would hand it over
    pub fn pending(
        id: SubmissionId,
        problem_id: i64,
        language: impl Into<String>,
        source_code: impl Into<String>,
    ) -> Self {
        Self {
            id,
            user_id: 0,
            problem_id,
            source_code: source_code.into(),
            language: language.into(),
            status: SubmissionStatus::Pending,
            execution_time_ms: None,
            memory_usage_mb: None,
            diagnostic: None,
            attempt: 0,
            submitted_at: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestCase {
    pub id: i64,
    pub problem_id: i64,
    pub input: String,
    pub expected_output: String,
    pub is_hidden: bool,
}

/// Time and memory of a grading attempt; always recorded together
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub execution_time_ms: f64,
    pub memory_usage_mb: f64,
}

/// Per test case detail; only ever built for visible test cases
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CaseReport {
    /// 1-based position in the supplied order
    pub position: usize,
    pub test_case_id: i64,
    pub verdict: String,
    pub elapsed_ms: f64,
    pub peak_memory_mb: f64,
}

/// Terminal result of grading one submission
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(into = "GradeSummary")]
pub struct GradeReport {
    status: SubmissionStatus,
    metrics: Option<Metrics>,
    diagnostic: Option<String>,
    cases: Vec<CaseReport>,
}

impl GradeReport {
    pub(crate) fn new(
        status: SubmissionStatus,
        metrics: Option<Metrics>,
        diagnostic: Option<String>,
        cases: Vec<CaseReport>,
    ) -> Self {
        debug_assert!(status.is_terminal());
        // Diagnostic text only accompanies the error status
        let diagnostic = diagnostic.filter(|_| status == SubmissionStatus::Error);
        Self {
            status,
            metrics,
            diagnostic,
            cases,
        }
    }

    /// An error that occurred before any test case could run
    pub(crate) fn error_before_execution(diagnostic: impl Into<String>) -> Self {
        Self::new(
            SubmissionStatus::Error,
            None,
            Some(diagnostic.into()),
            Vec::new(),
        )
    }

    pub fn status(&self) -> SubmissionStatus {
        self.status
    }

    pub fn metrics(&self) -> Option<Metrics> {
        self.metrics
    }

    pub fn execution_time_ms(&self) -> Option<f64> {
        self.metrics.map(|m| m.execution_time_ms)
    }

    pub fn memory_usage_mb(&self) -> Option<f64> {
        self.metrics.map(|m| m.memory_usage_mb)
    }

    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    pub fn cases(&self) -> &[CaseReport] {
        &self.cases
    }
}

/// Wire shape of a [`GradeReport`] handed back to the collaborator layer
#[derive(Serialize, Debug, Clone)]
pub struct GradeSummary {
    pub status: SubmissionStatus,
    pub execution_time_ms: Option<f64>,
    pub memory_usage_mb: Option<f64>,
    pub diagnostic: Option<String>,
    pub cases: Vec<CaseReport>,
}

impl From<GradeReport> for GradeSummary {
    fn from(report: GradeReport) -> Self {
        Self {
            status: report.status,
            execution_time_ms: report.execution_time_ms(),
            memory_usage_mb: report.memory_usage_mb(),
            diagnostic: report.diagnostic,
            cases: report.cases,
        }
    }
}
