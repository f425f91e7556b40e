mod job;
mod state;

pub use job::{
    AuditRecord, EventSource, Job, JobEvent, JobEventKind, JobFailure, MAX_LABEL_LEN,
    ProgressMeta, RANK_PROGRESS, RANK_STARTED, RANK_TERMINAL, RetryConfig, Settlement,
    SubmissionRequest,
};
pub use state::{Input, StateMachine, Transition, WorkflowState};
