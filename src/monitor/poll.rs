use std::time::Duration;

use crate::api::RemoteStatus;

/// Adaptive delay between status polls.
///
/// `processing` polls fast, `queued` moderately, `completed` immediately (to
/// confirm a result id), everything else backs off exponentially. Every value
/// is clamped to `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    pub processing_delay: Duration,
    pub queued_delay: Duration,
    pub completed_delay: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            processing_delay: Duration::from_secs(2),
            queued_delay: Duration::from_secs(5),
            completed_delay: Duration::ZERO,
            max_attempts: 150,
        }
    }
}

impl PollPolicy {
    /// `status` is the last status seen, `None` when the last poll failed or
    /// nothing was seen yet.
    pub fn delay(&self, status: Option<RemoteStatus>, attempt: u32) -> Duration {
        let raw = match status {
            Some(RemoteStatus::Processing) => self.processing_delay,
            Some(RemoteStatus::Queued) => self.queued_delay,
            Some(RemoteStatus::Completed) => self.completed_delay,
            Some(RemoteStatus::Failed | RemoteStatus::Unknown) | None => self.backoff(attempt),
        };
        raw.min(self.max_delay)
    }

    /// `min(initial_delay * multiplier^attempt, max_delay)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
