//! Idempotency guard in front of the submit path.
//!
//! The first caller for a key gets a [`SubmissionPermit`] and is the only one
//! allowed to reach the ledger and the network. Everyone else arriving while
//! that attempt is unresolved, or within the replay window after it resolved,
//! receives a [`PendingSubmission`] that yields the same job id.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{SubmissionError, WorkflowError};
use crate::timer::TimerRegistry;

#[derive(Debug, Clone, PartialEq)]
enum SlotState {
    Pending,
    Resolved(String),
    Released(WorkflowError),
}

pub enum Acquire {
    Acquired(SubmissionPermit),
    AlreadyPending(PendingSubmission),
}

/// Proof that the holder owns the submit slot for `key`.
#[derive(Debug)]
pub struct SubmissionPermit {
    key: String,
}

impl SubmissionPermit {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// A duplicate caller's view of an in-flight or recently resolved submission.
#[derive(Debug)]
pub struct PendingSubmission {
    rx: watch::Receiver<SlotState>,
}

impl PendingSubmission {
    pub fn job_id(&self) -> Option<String> {
        match &*self.rx.borrow() {
            SlotState::Resolved(job_id) => Some(job_id.clone()),
            _ => None,
        }
    }

    /// Waits for the owning attempt to resolve and returns its outcome.
    pub async fn wait(mut self) -> Result<String, WorkflowError> {
        loop {
            match &*self.rx.borrow_and_update() {
                SlotState::Resolved(job_id) => return Ok(job_id.clone()),
                SlotState::Released(err) => return Err(err.clone()),
                SlotState::Pending => {}
            }
            if self.rx.changed().await.is_err() {
                // Slot expired while still pending.
                return Err(SubmissionError::Timeout.into());
            }
        }
    }
}

pub struct SubmissionGuard {
    slots: Arc<DashMap<String, watch::Sender<SlotState>>>,
    timers: TimerRegistry,
    pending_ttl: Duration,
    replay_window: Duration,
}

fn timer_id(key: &str) -> String {
    format!("guard:{key}")
}

impl SubmissionGuard {
    /// Slots stay pending for `pending_ttl` and replayable for `replay_window`.
    pub fn new(timers: TimerRegistry, pending_ttl: Duration, replay_window: Duration) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            timers,
            pending_ttl,
            replay_window,
        }
    }

    /// Claims `key`, or returns a handle on the submission already holding it.
    pub fn acquire(&self, key: &str) -> Acquire {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                debug!(key, "submission already pending for key");
                Acquire::AlreadyPending(PendingSubmission {
                    rx: occupied.get().subscribe(),
                })
            }
            Entry::Vacant(vacant) => {
                let (tx, _) = watch::channel(SlotState::Pending);
                vacant.insert(tx);
                self.expire_after(key, self.pending_ttl);
                Acquire::Acquired(SubmissionPermit {
                    key: key.to_string(),
                })
            }
        }
    }

    /// Records the job id for the key and keeps it replayable for the replay window.
    pub fn resolve(&self, permit: &SubmissionPermit, job_id: &str) {
        if let Some(tx) = self.slots.get(&permit.key) {
            tx.send_replace(SlotState::Resolved(job_id.to_string()));
        }
        self.expire_after(&permit.key, self.replay_window);
    }

    /// Frees the key after a definitive failure so a new attempt can proceed.
    /// Callers currently waiting on the key observe `err`.
    pub fn release(&self, permit: SubmissionPermit, err: WorkflowError) {
        self.timers.clear(&timer_id(&permit.key));
        if let Some((_, tx)) = self.slots.remove(&permit.key) {
            tx.send_replace(SlotState::Released(err));
        }
        debug!(key = %permit.key, "submission slot released");
    }

    /// Whether `key` is pending or inside its replay window.
    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn expire_after(&self, key: &str, ttl: Duration) {
        let slots = Arc::clone(&self.slots);
        let key = key.to_string();
        self.timers.set_timeout(timer_id(&key), ttl, async move {
            slots.remove(&key);
            debug!(key, "submission slot expired");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> (SubmissionGuard, TimerRegistry) {
        let timers = TimerRegistry::new();
        let guard = SubmissionGuard::new(
            timers.clone(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        );
        (guard, timers)
    }

    fn expect_permit(acq: Acquire) -> SubmissionPermit {
        match acq {
            Acquire::Acquired(p) => p,
            Acquire::AlreadyPending(_) => panic!("expected a permit"),
        }
    }

    fn expect_pending(acq: Acquire) -> PendingSubmission {
        match acq {
            Acquire::AlreadyPending(p) => p,
            Acquire::Acquired(_) => panic!("expected a pending submission"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquire_waits_for_first_job_id() {
        let (guard, _timers) = guard();
        let permit = expect_permit(guard.acquire("k"));
        let pending = expect_pending(guard.acquire("k"));
        assert_eq!(pending.job_id(), None);

        let waiter = tokio::spawn(pending.wait());
        guard.resolve(&permit, "job-1");
        assert_eq!(waiter.await.unwrap().unwrap(), "job-1");

        let replay = expect_pending(guard.acquire("k"));
        assert_eq!(replay.job_id().as_deref(), Some("job-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_slot_expires_after_replay_window() {
        let (guard, timers) = guard();
        let permit = expect_permit(guard.acquire("k"));
        guard.resolve(&permit, "job-1");
        assert!(timers.is_active("guard:k"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!guard.contains("k"));
        assert!(timers.is_empty());
        expect_permit(guard.acquire("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_slot_is_bounded_by_ttl() {
        let (guard, _timers) = guard();
        let _permit = expect_permit(guard.acquire("k"));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(guard.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn release_hands_error_to_waiters_and_frees_key() {
        let (guard, timers) = guard();
        let permit = expect_permit(guard.acquire("k"));
        let pending = expect_pending(guard.acquire("k"));

        guard.release(
            permit,
            SubmissionError::InsufficientTokens("balance 1, required 2".into()).into(),
        );
        let err = pending.wait().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InsufficientTokens);
        assert!(timers.is_empty());
        expect_permit(guard.acquire("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_do_not_interfere() {
        let (guard, _timers) = guard();
        expect_permit(guard.acquire("a"));
        expect_permit(guard.acquire("b"));
        assert_eq!(guard.len(), 2);
    }
}
