use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::job::Job;

/// States of the submission workflow.
///
/// idle → validating → submitting → queued → processing → completed,
/// with `failed` reachable from every active state and `cancelled`
/// reachable by explicit cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Idle,
    Validating,
    Submitting,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            WorkflowState::Validating
                | WorkflowState::Submitting
                | WorkflowState::Queued
                | WorkflowState::Processing
        )
    }

    /// Percentage reported through `on_status_change`.
    pub fn progress_percent(self) -> u8 {
        match self {
            WorkflowState::Validating => 10,
            WorkflowState::Submitting => 25,
            WorkflowState::Queued => 35,
            WorkflowState::Processing => 75,
            WorkflowState::Completed => 100,
            WorkflowState::Idle | WorkflowState::Failed | WorkflowState::Cancelled => 0,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowState::Idle => "idle",
            WorkflowState::Validating => "validating",
            WorkflowState::Submitting => "submitting",
            WorkflowState::Queued => "queued",
            WorkflowState::Processing => "processing",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Inputs that can move a job between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Submit,
    Validated,
    JobIssued,
    Started,
    Progress,
    Complete,
    Fail,
    Cancel,
}

/// The result of evaluating an input against the current state.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Moved {
        from: WorkflowState,
        to: WorkflowState,
    },
    /// Same state, e.g. a progress event while already processing.
    Stayed(WorkflowState),
    /// The input is not legal from the current state; nothing changed.
    Rejected { state: WorkflowState, input: Input },
}

impl Transition {
    pub fn changed(&self) -> bool {
        matches!(self, Transition::Moved { .. })
    }
}

/// Pure transition table plus the bookkeeping of applying it to a `Job`.
pub struct StateMachine;

impl StateMachine {
    /// Returns the target state for `input`, or `None` if the edge does not exist.
    pub fn target(state: WorkflowState, input: Input) -> Option<WorkflowState> {
        use Input::*;
        use WorkflowState::*;

        match (state, input) {
            (Idle, Submit) => Some(Validating),
            (Validating, Validated) => Some(Submitting),
            (Submitting, JobIssued) => Some(Queued),
            (Queued | Processing, Started | Progress) => Some(Processing),
            (Queued | Processing, Complete) => Some(Completed),
            (Validating | Submitting | Queued | Processing, Fail) => Some(Failed),
            (Validating | Submitting | Queued | Processing, Cancel) => Some(Cancelled),
            _ => None,
        }
    }

    /// Applies `input` to the job, recording history and timestamps.
    pub fn next(job: &mut Job, input: Input) -> Transition {
        let from = job.status;
        let Some(to) = Self::target(from, input) else {
            return Transition::Rejected { state: from, input };
        };
        if to == from {
            return Transition::Stayed(from);
        }

        job.state_history.push(from);
        job.status = to;
        job.updated_at = Utc::now();
        Transition::Moved { from, to }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::state_machine::SubmissionRequest;

    fn make_job() -> Job {
        let req = SubmissionRequest::new("big-five", BTreeMap::from([("grit".to_string(), 3.0)]));
        Job::new(&req)
    }

    #[test]
    fn happy_path_walks_all_states() {
        let mut job = make_job();
        for (input, expected) in [
            (Input::Submit, WorkflowState::Validating),
            (Input::Validated, WorkflowState::Submitting),
            (Input::JobIssued, WorkflowState::Queued),
            (Input::Started, WorkflowState::Processing),
            (Input::Complete, WorkflowState::Completed),
        ] {
            let t = StateMachine::next(&mut job, input);
            assert!(t.changed(), "{input:?} should move the job");
            assert_eq!(job.status, expected);
        }
        assert_eq!(
            job.state_history,
            vec![
                WorkflowState::Idle,
                WorkflowState::Validating,
                WorkflowState::Submitting,
                WorkflowState::Queued,
                WorkflowState::Processing,
            ]
        );
    }

    #[test]
    fn progress_while_processing_stays() {
        let mut job = make_job();
        job.status = WorkflowState::Processing;
        assert_eq!(
            StateMachine::next(&mut job, Input::Progress),
            Transition::Stayed(WorkflowState::Processing)
        );
        assert!(job.state_history.is_empty());
    }

    #[test]
    fn queued_can_complete_without_started() {
        let mut job = make_job();
        job.status = WorkflowState::Queued;
        StateMachine::next(&mut job, Input::Complete);
        assert_eq!(job.status, WorkflowState::Completed);
    }

    #[test]
    fn terminal_states_reject_everything() {
        for terminal in [
            WorkflowState::Completed,
            WorkflowState::Failed,
            WorkflowState::Cancelled,
        ] {
            for input in [Input::Started, Input::Complete, Input::Fail, Input::Cancel] {
                assert_eq!(StateMachine::target(terminal, input), None);
            }
        }
    }

    #[test]
    fn cancel_is_legal_from_every_active_state() {
        for state in [
            WorkflowState::Validating,
            WorkflowState::Submitting,
            WorkflowState::Queued,
            WorkflowState::Processing,
        ] {
            assert_eq!(
                StateMachine::target(state, Input::Cancel),
                Some(WorkflowState::Cancelled)
            );
        }
        assert_eq!(StateMachine::target(WorkflowState::Idle, Input::Cancel), None);
    }

    #[test]
    fn events_before_job_issued_are_rejected() {
        let mut job = make_job();
        job.status = WorkflowState::Submitting;
        let t = StateMachine::next(&mut job, Input::Complete);
        assert_eq!(
            t,
            Transition::Rejected {
                state: WorkflowState::Submitting,
                input: Input::Complete
            }
        );
        assert_eq!(job.status, WorkflowState::Submitting);
    }

    #[test]
    fn progress_mapping() {
        assert_eq!(WorkflowState::Validating.progress_percent(), 10);
        assert_eq!(WorkflowState::Submitting.progress_percent(), 25);
        assert_eq!(WorkflowState::Queued.progress_percent(), 35);
        assert_eq!(WorkflowState::Processing.progress_percent(), 75);
        assert_eq!(WorkflowState::Completed.progress_percent(), 100);
        assert_eq!(WorkflowState::Cancelled.progress_percent(), 0);
    }

    #[test]
    fn state_display() {
        assert_eq!(WorkflowState::Submitting.to_string(), "submitting");
        assert_eq!(WorkflowState::Cancelled.to_string(), "cancelled");
    }
}
