use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::WorkflowState;
use crate::error::{ErrorKind, ValidationError};
use crate::ledger::{Reservation, TokenTransaction};

pub const MAX_LABEL_LEN: usize = 128;

/// A caller's request to have a scored assessment analysed.
/// Identity is the idempotency key; read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub idempotency_key: String,
    pub score_payload: BTreeMap<String, f64>,
    pub assessment_label: String,
}

impl SubmissionRequest {
    /// Builds a request with a fresh random idempotency key.
    pub fn new(assessment_label: impl Into<String>, score_payload: BTreeMap<String, f64>) -> Self {
        Self::with_key(Uuid::new_v4().to_string(), assessment_label, score_payload)
    }

    pub fn with_key(
        idempotency_key: impl Into<String>,
        assessment_label: impl Into<String>,
        score_payload: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            score_payload,
            assessment_label: assessment_label.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.idempotency_key.trim().is_empty() {
            return Err(ValidationError::EmptyIdempotencyKey);
        }
        let label = self.assessment_label.trim();
        if label.is_empty() {
            return Err(ValidationError::EmptyLabel);
        }
        if label.chars().count() > MAX_LABEL_LEN {
            return Err(ValidationError::LabelTooLong { max: MAX_LABEL_LEN });
        }
        if self.score_payload.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }
        for (name, score) in &self.score_payload {
            if name.trim().is_empty() {
                return Err(ValidationError::EmptyScoreName);
            }
            if !score.is_finite() {
                return Err(ValidationError::NonFiniteScore(name.clone()));
            }
        }
        Ok(())
    }
}

/// Which channel delivered a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Push,
    Poll,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSource::Push => write!(f, "push"),
            EventSource::Poll => write!(f, "poll"),
        }
    }
}

/// What happened to the job, independent of which channel saw it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEventKind {
    Started,
    Progress,
    Completed { result_id: String },
    Failed { reason: String },
}

pub const RANK_STARTED: u8 = 1;
pub const RANK_PROGRESS: u8 = 2;
pub const RANK_TERMINAL: u8 = 3;

impl JobEventKind {
    pub fn rank(&self) -> u8 {
        match self {
            JobEventKind::Started => RANK_STARTED,
            JobEventKind::Progress => RANK_PROGRESS,
            JobEventKind::Completed { .. } | JobEventKind::Failed { .. } => RANK_TERMINAL,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == RANK_TERMINAL
    }

    pub fn result_id(&self) -> Option<&str> {
        match self {
            JobEventKind::Completed { result_id } => Some(result_id),
            _ => None,
        }
    }
}

/// Free-form progress details forwarded to `on_progress`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressMeta {
    pub message: Option<String>,
    pub percent: Option<u8>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub source: EventSource,
    pub kind: JobEventKind,
    pub meta: ProgressMeta,
    pub received_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: impl Into<String>, source: EventSource, kind: JobEventKind) -> Self {
        Self {
            job_id: job_id.into(),
            source,
            kind,
            meta: ProgressMeta::default(),
            received_at: Utc::now(),
        }
    }

    pub fn with_meta(mut self, meta: ProgressMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn rank(&self) -> u8 {
        self.kind.rank()
    }
}

/// Configuration for retrying the submit call before a job id exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
        }
    }
}

impl RetryConfig {
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Where the job's reservation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    Unreserved,
    Reserved,
    Committed,
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// One accepted submission and everything the workflow knows about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Local attempt id; exists before the server issues `job_id`.
    pub id: String,
    pub job_id: Option<String>,
    pub idempotency_key: String,
    pub assessment_label: String,
    pub status: WorkflowState,
    pub state_history: Vec<WorkflowState>,
    pub terminal_rank: u8,
    pub result_id: Option<String>,
    pub failure: Option<JobFailure>,
    pub reservation: Option<Reservation>,
    pub settlement: Settlement,
    pub transactions: Vec<TokenTransaction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(request: &SubmissionRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: None,
            idempotency_key: request.idempotency_key.clone(),
            assessment_label: request.assessment_label.clone(),
            status: WorkflowState::Idle,
            state_history: Vec::new(),
            terminal_rank: 0,
            result_id: None,
            failure: None,
            reservation: None,
            settlement: Settlement::Unreserved,
            transactions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True while a refund is still owed on failure or cancellation.
    pub fn needs_refund(&self) -> bool {
        self.settlement == Settlement::Reserved
    }
}

/// Structured audit record produced once a job is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: Option<String>,
    pub idempotency_key: String,
    pub assessment_label: String,
    pub status: WorkflowState,
    pub state_transitions: Vec<WorkflowState>,
    pub result_id: Option<String>,
    pub failure: Option<JobFailure>,
    pub settlement: Settlement,
    pub transactions: Vec<TokenTransaction>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl AuditRecord {
    pub fn from_job(job: &Job) -> Self {
        let mut transitions = job.state_history.clone();
        transitions.push(job.status);

        Self {
            job_id: job.job_id.clone(),
            idempotency_key: job.idempotency_key.clone(),
            assessment_label: job.assessment_label.clone(),
            status: job.status,
            state_transitions: transitions,
            result_id: job.result_id.clone(),
            failure: job.failure.clone(),
            settlement: job.settlement,
            transactions: job.transactions.clone(),
            started_at: job.created_at,
            completed_at: job.updated_at,
            duration_ms: (job.updated_at - job.created_at).num_milliseconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores() -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("openness".to_string(), 71.0),
            ("neuroticism".to_string(), 32.5),
        ])
    }

    #[test]
    fn valid_request_passes() {
        let req = SubmissionRequest::new("big-five", scores());
        assert!(req.validate().is_ok());
        assert!(!req.idempotency_key.is_empty());
    }

    #[test]
    fn validation_rejects_bad_requests() {
        let req = SubmissionRequest::with_key("k", "  ", scores());
        assert_eq!(req.validate(), Err(ValidationError::EmptyLabel));

        let req = SubmissionRequest::with_key("k", "big-five", BTreeMap::new());
        assert_eq!(req.validate(), Err(ValidationError::EmptyPayload));

        let req = SubmissionRequest::with_key(
            "k",
            "big-five",
            BTreeMap::from([("grit".to_string(), f64::NAN)]),
        );
        assert_eq!(
            req.validate(),
            Err(ValidationError::NonFiniteScore("grit".into()))
        );

        let req = SubmissionRequest::with_key("", "big-five", scores());
        assert_eq!(req.validate(), Err(ValidationError::EmptyIdempotencyKey));

        let req = SubmissionRequest::with_key("k", "x".repeat(MAX_LABEL_LEN + 1), scores());
        assert_eq!(
            req.validate(),
            Err(ValidationError::LabelTooLong { max: MAX_LABEL_LEN })
        );
    }

    #[test]
    fn event_ranks() {
        assert_eq!(JobEventKind::Started.rank(), 1);
        assert_eq!(JobEventKind::Progress.rank(), 2);
        assert_eq!(
            JobEventKind::Completed {
                result_id: "r".into()
            }
            .rank(),
            3
        );
        assert!(JobEventKind::Failed { reason: "x".into() }.is_terminal());
    }

    #[test]
    fn event_kind_is_tagged() {
        let json = serde_json::to_value(JobEventKind::Completed {
            result_id: "res-1".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "completed");
        assert_eq!(json["result_id"], "res-1");
    }

    #[test]
    fn retry_config_exponential_backoff() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 1000,
        };
        assert_eq!(config.delay_for_attempt(1), 1000);
        assert_eq!(config.delay_for_attempt(2), 2000);
        assert_eq!(config.delay_for_attempt(3), 4000);
        assert_eq!(config.delay_for_attempt(64), u64::MAX);
    }

    #[test]
    fn new_job_defaults() {
        let req = SubmissionRequest::new("big-five", scores());
        let job = Job::new(&req);
        assert_eq!(job.status, WorkflowState::Idle);
        assert_eq!(job.idempotency_key, req.idempotency_key);
        assert_eq!(job.settlement, Settlement::Unreserved);
        assert!(!job.needs_refund());
        assert!(job.job_id.is_none());
    }

    #[test]
    fn audit_record_from_job() {
        let req = SubmissionRequest::with_key("key-9", "big-five", scores());
        let mut job = Job::new(&req);
        job.state_history.push(WorkflowState::Idle);
        job.status = WorkflowState::Validating;

        let record = AuditRecord::from_job(&job);
        assert_eq!(record.idempotency_key, "key-9");
        assert_eq!(
            record.state_transitions,
            vec![WorkflowState::Idle, WorkflowState::Validating]
        );
    }
}
