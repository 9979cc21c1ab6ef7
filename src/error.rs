use thiserror::Error;

use crate::sandbox::Fault;
use crate::submission::SubmissionId;

/// The sandbox runtime could not hand out or run an environment
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("sandbox runtime unavailable: {0}")]
    Unavailable(String),

    #[error("failed to provision sandbox: {0}")]
    Failed(String),

    #[error("sandbox i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Admission refused because every slot and queue position is taken
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("grading capacity exhausted ({active} active, {queued} queued)")]
pub struct CapacityError {
    pub active: usize,
    pub queued: usize,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error("submission {0} is already being graded")]
    AlreadyInFlight(SubmissionId),

    #[error("engine is shutting down")]
    ShuttingDown,
}

/// Failure of a single execution that is not a property of the program
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Infrastructure(#[from] ProvisioningError),
}

/// First failing test case of a submission, rendered into the diagnostic
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OutcomeError {
    #[error("time limit exceeded on {case}")]
    Timeout { case: String },

    #[error("runtime error on {case}: {fault}")]
    RuntimeFault { case: String, fault: Fault },

    /// Fault of a hidden test case; neither the case nor the fault is named
    #[error("runtime error on a hidden test case")]
    HiddenFault,

    #[error("wrong answer on {case}")]
    OutputMismatch { case: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("submission {0} not found")]
    NotFound(SubmissionId),

    #[error("submission {0} is not pending")]
    NotPending(SubmissionId),

    #[error("refusing to persist non-terminal status for submission {0}")]
    NotTerminal(SubmissionId),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum GradeError {
    #[error("grading of submission {0} was cancelled")]
    Cancelled(SubmissionId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("grading task aborted: {0}")]
    Aborted(String),
}
