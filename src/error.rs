use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::ApiError;
use crate::ledger::LedgerError;

/// Local, pre-network rejection of a submission request. Never touches the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("idempotency key must not be empty")]
    EmptyIdempotencyKey,

    #[error("assessment label must not be empty")]
    EmptyLabel,

    #[error("assessment label exceeds {max} characters")]
    LabelTooLong { max: usize },

    #[error("score payload must contain at least one score")]
    EmptyPayload,

    #[error("score names must not be empty")]
    EmptyScoreName,

    #[error("score `{0}` is not a finite number")]
    NonFiniteScore(String),
}

/// Failures of the submit step, before a job id exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("insufficient tokens: {0}")]
    InsufficientTokens(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("submission timed out")]
    Timeout,

    #[error("duplicate submission: {0}")]
    DuplicateSubmission(String),
}

impl SubmissionError {
    /// Only transport-level failures may be retried, and only before a job id is issued.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkError(_) | Self::Timeout)
    }
}

impl From<ApiError> for SubmissionError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::InsufficientTokens(msg) => Self::InsufficientTokens(msg),
            ApiError::Duplicate(msg) => Self::DuplicateSubmission(msg),
            ApiError::Timeout => Self::Timeout,
            ApiError::Network(e) if e.is_timeout() => Self::Timeout,
            other => Self::NetworkError(other.to_string()),
        }
    }
}

impl From<LedgerError> for SubmissionError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientTokens { balance, required } => {
                Self::InsufficientTokens(format!("balance {balance}, required {required}"))
            }
            LedgerError::Timeout => Self::Timeout,
            other => Self::NetworkError(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("push channel connection failed: {0}")]
    PushConnectFailed(String),

    #[error("push channel authentication timed out")]
    PushAuthTimeout,

    #[error("status polling gave up after {attempts} attempts")]
    PollExhausted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("analysis failed: {0}")]
    ProcessingFailed(String),

    #[error("job exceeded its processing ceiling without a terminal status")]
    StaleTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconciliationError {
    #[error("job {job_id}: conflicting terminal outcomes ({accepted} vs {conflicting})")]
    InconsistentTerminalState {
        job_id: String,
        accepted: String,
        conflicting: String,
    },
}

/// Umbrella error surfaced by [`Workflow`](crate::orchestrator::Workflow).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),

    #[error("workflow cancelled")]
    Cancelled,

    #[error("workflow is shut down")]
    Closed,
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Submission(e) => match e {
                SubmissionError::InsufficientTokens(_) => ErrorKind::InsufficientTokens,
                SubmissionError::NetworkError(_) => ErrorKind::NetworkError,
                SubmissionError::Timeout => ErrorKind::Timeout,
                SubmissionError::DuplicateSubmission(_) => ErrorKind::DuplicateSubmission,
            },
            Self::Monitor(e) => match e {
                MonitorError::PushConnectFailed(_) => ErrorKind::PushConnectFailed,
                MonitorError::PushAuthTimeout => ErrorKind::PushAuthTimeout,
                MonitorError::PollExhausted { .. } => ErrorKind::PollExhausted,
            },
            Self::Job(e) => match e {
                JobError::ProcessingFailed(_) => ErrorKind::ProcessingFailed,
                JobError::StaleTimeout => ErrorKind::StaleTimeout,
            },
            Self::Reconciliation(_) => ErrorKind::InconsistentTerminalState,
            Self::Cancelled | Self::Closed => ErrorKind::Cancelled,
        }
    }
}

/// Stable classification handed to callers on every terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InsufficientTokens,
    NetworkError,
    Timeout,
    DuplicateSubmission,
    PushConnectFailed,
    PushAuthTimeout,
    PollExhausted,
    ProcessingFailed,
    StaleTimeout,
    InconsistentTerminalState,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::InsufficientTokens => "insufficient_tokens",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::DuplicateSubmission => "duplicate_submission",
            ErrorKind::PushConnectFailed => "push_connect_failed",
            ErrorKind::PushAuthTimeout => "push_auth_timeout",
            ErrorKind::PollExhausted => "poll_exhausted",
            ErrorKind::ProcessingFailed => "processing_failed",
            ErrorKind::StaleTimeout => "stale_timeout",
            ErrorKind::InconsistentTerminalState => "inconsistent_terminal_state",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
