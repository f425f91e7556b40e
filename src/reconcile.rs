//! Merges the push and poll channels into one monotonic status stream.
//!
//! Each event carries a rank (started=1, progress=2, completed/failed=3). An
//! event is accepted only if it raises the job's rank; everything else is a
//! stale or duplicate delivery and is discarded. The rank check and update
//! happen under the tracker's map entry lock, so two concurrent terminal
//! events can never both be accepted.

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::ReconciliationError;
use crate::state_machine::{JobEvent, JobEventKind, RANK_TERMINAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Lower rank than what was already applied.
    Stale,
    /// Same rank as what was already applied.
    Duplicate,
    /// The job was torn down or cancelled.
    Sealed,
    /// No tracker exists for the job id.
    Untracked,
    /// Conflicting terminal outcome that lost to the one carrying a result id.
    ConflictLost,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted(JobEvent),
    Discarded { event: JobEvent, reason: DiscardReason },
    /// A conflicting terminal replaced the previously accepted one.
    Superseded { previous: JobEvent, winner: JobEvent },
}

#[derive(Debug, Default)]
struct Tracker {
    last_rank: u8,
    terminal: Option<JobEvent>,
    sealed: bool,
}

#[derive(Debug, Default)]
pub struct ReconciliationEngine {
    trackers: DashMap<String, Tracker>,
}

fn conflicting(a: &JobEventKind, b: &JobEventKind) -> bool {
    match (a, b) {
        (JobEventKind::Completed { result_id: x }, JobEventKind::Completed { result_id: y }) => x != y,
        (JobEventKind::Failed { .. }, JobEventKind::Failed { .. }) => false,
        _ => a.is_terminal() && b.is_terminal(),
    }
}

fn describe(event: &JobEvent) -> String {
    match &event.kind {
        JobEventKind::Completed { result_id } => format!("{} completed({result_id})", event.source),
        JobEventKind::Failed { reason } => format!("{} failed({reason})", event.source),
        other => format!("{} {other:?}", event.source),
    }
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a job at rank 0. Re-tracking an id resets it.
    pub fn track(&self, job_id: &str) {
        self.trackers.insert(job_id.to_string(), Tracker::default());
    }

    /// Marks the job as torn down; every later event is discarded.
    pub fn seal(&self, job_id: &str) {
        if let Some(mut tracker) = self.trackers.get_mut(job_id) {
            tracker.sealed = true;
        }
    }

    pub fn forget(&self, job_id: &str) {
        self.trackers.remove(job_id);
    }

    pub fn last_rank(&self, job_id: &str) -> Option<u8> {
        self.trackers.get(job_id).map(|t| t.last_rank)
    }

    pub fn is_sealed(&self, job_id: &str) -> bool {
        self.trackers.get(job_id).is_some_and(|t| t.sealed)
    }

    pub fn apply(&self, event: JobEvent) -> Result<Verdict, ReconciliationError> {
        let Some(mut tracker) = self.trackers.get_mut(&event.job_id) else {
            debug!(job_id = %event.job_id, "event for untracked job");
            return Ok(Verdict::Discarded {
                event,
                reason: DiscardReason::Untracked,
            });
        };

        if tracker.sealed {
            debug!(job_id = %event.job_id, source = %event.source, "late event after teardown");
            return Ok(Verdict::Discarded {
                event,
                reason: DiscardReason::Sealed,
            });
        }

        let rank = event.rank();
        if rank > tracker.last_rank {
            tracker.last_rank = rank;
            if rank == RANK_TERMINAL {
                tracker.terminal = Some(event.clone());
            }
            return Ok(Verdict::Accepted(event));
        }

        if rank == RANK_TERMINAL {
            if let Some(previous) = tracker.terminal.clone() {
                if previous.source != event.source && conflicting(&previous.kind, &event.kind) {
                    return match (previous.kind.result_id(), event.kind.result_id()) {
                        (None, Some(_)) => {
                            warn!(
                                job_id = %event.job_id,
                                previous = %describe(&previous),
                                winner = %describe(&event),
                                "conflicting terminal outcome superseded"
                            );
                            tracker.terminal = Some(event.clone());
                            Ok(Verdict::Superseded {
                                previous,
                                winner: event,
                            })
                        }
                        (Some(_), None) => Ok(Verdict::Discarded {
                            event,
                            reason: DiscardReason::ConflictLost,
                        }),
                        _ => Err(ReconciliationError::InconsistentTerminalState {
                            job_id: event.job_id.clone(),
                            accepted: describe(&previous),
                            conflicting: describe(&event),
                        }),
                    };
                }
            }
        }

        let reason = if rank < tracker.last_rank {
            DiscardReason::Stale
        } else {
            DiscardReason::Duplicate
        };
        Ok(Verdict::Discarded { event, reason })
    }
}
