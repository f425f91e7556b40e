//! Named timer arena.
//!
//! Business logic never calls `tokio::time` directly for deferred work: every
//! timeout and interval goes through a [`TimerRegistry`] under a string id so
//! that a whole job's timers can be torn down with one prefix clear.
//!
//! Registering an id that is already active aborts the previous timer first,
//! so ids are unique and repeated registration never accumulates tasks.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{trace, warn};

/// Shortest period an interval timer ticks at.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerKind {
    Timeout,
    Interval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimerHandle {
    pub id: String,
    pub kind: TimerKind,
    pub created_at: DateTime<Utc>,
}

struct Slot {
    handle: TimerHandle,
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    timers: DashMap<String, Slot>,
    generation: AtomicU64,
}

impl Inner {
    /// Drops the slot only if it still belongs to the timer that is finishing.
    fn retire(&self, id: &str, generation: u64) {
        self.timers.remove_if(id, |_, slot| slot.generation == generation);
    }
}

#[derive(Clone, Default)]
pub struct TimerRegistry {
    inner: Arc<Inner>,
}

impl TimerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` once after `delay`.
    ///
    /// The slot is released before `task` starts, so the task may register a
    /// new timer under its own id (self-rescheduling loops rely on this).
    pub fn set_timeout<F>(&self, id: impl Into<String>, delay: Duration, task: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = id.into();
        let generation = self.next_generation();
        let inner = Arc::clone(&self.inner);
        let timer_id = id.clone();

        self.install(id, TimerKind::Timeout, generation, async move {
            tokio::time::sleep(delay).await;
            inner.retire(&timer_id, generation);
            trace!(timer = %timer_id, "timeout fired");
            task.await;
        })
    }

    /// Calls `tick` every `period`, first after one full period, until the
    /// returned future yields `ControlFlow::Break` or the timer is cleared.
    ///
    /// A zero `period` is raised to [`MIN_PERIOD`].
    pub fn set_interval<F, Fut>(&self, id: impl Into<String>, period: Duration, mut tick: F) -> TimerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let id = id.into();
        let generation = self.next_generation();
        let inner = Arc::clone(&self.inner);
        let timer_id = id.clone();
        if period.is_zero() {
            warn!(timer = %timer_id, ?MIN_PERIOD, "zero interval period raised to the minimum");
        }
        let period = period.max(MIN_PERIOD);

        self.install(id, TimerKind::Interval, generation, async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tick().await.is_break() {
                    break;
                }
            }
            inner.retire(&timer_id, generation);
            trace!(timer = %timer_id, "interval finished");
        })
    }

    fn install<F>(&self, id: String, kind: TimerKind, generation: u64, fut: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = TimerHandle {
            id: id.clone(),
            kind,
            created_at: Utc::now(),
        };

        // Spawning under the entry lock keeps a zero-delay timer from retiring
        // before its slot exists.
        match self.inner.timers.entry(id) {
            Entry::Occupied(mut occupied) => {
                trace!(timer = %handle.id, "replacing active timer");
                let previous = occupied.insert(Slot {
                    handle: handle.clone(),
                    generation,
                    task: tokio::spawn(fut),
                });
                previous.task.abort();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    handle: handle.clone(),
                    generation,
                    task: tokio::spawn(fut),
                });
            }
        }
        handle
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Aborts the timer registered under `id`; `false` if none was active.
    pub fn clear(&self, id: &str) -> bool {
        match self.inner.timers.remove(id) {
            Some((_, slot)) => {
                slot.task.abort();
                true
            }
            None => false,
        }
    }

    /// Aborts every timer whose id starts with `prefix` and returns how many.
    pub fn clear_by_prefix(&self, prefix: &str) -> usize {
        let mut cleared = 0;
        self.inner.timers.retain(|id, slot| {
            if id.starts_with(prefix) {
                slot.task.abort();
                cleared += 1;
                false
            } else {
                true
            }
        });
        if cleared > 0 {
            trace!(prefix, cleared, "timers cleared");
        }
        cleared
    }

    /// Aborts every timer.
    pub fn clear_all(&self) -> usize {
        self.clear_by_prefix("")
    }

    /// Whether a timer is pending or ticking under `id`.
    pub fn is_active(&self, id: &str) -> bool {
        self.inner.timers.contains_key(id)
    }

    /// Handles of all live timers, sorted by id.
    pub fn active_timers(&self) -> Vec<TimerHandle> {
        self.active_timers_with_prefix("")
    }

    /// Handles of live timers under `prefix`, sorted by id.
    pub fn active_timers_with_prefix(&self, prefix: &str) -> Vec<TimerHandle> {
        let mut handles: Vec<TimerHandle> = self
            .inner
            .timers
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.value().handle.clone())
            .collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.inner.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.timers.is_empty()
    }
}

impl std::fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("active", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_and_releases_slot() {
        let timers = TimerRegistry::new();
        let hits = counter();
        let h = Arc::clone(&hits);
        timers.set_timeout("job:1:stale", Duration::from_millis(100), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.is_active("job:1:stale"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reregistering_an_id_replaces_the_previous_timer() {
        let timers = TimerRegistry::new();
        let first = counter();
        let second = counter();

        let f = Arc::clone(&first);
        timers.set_timeout("poll", Duration::from_millis(50), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = Arc::clone(&second);
        timers.set_timeout("poll", Duration::from_millis(80), async move {
            s.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timers.len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_prevents_firing() {
        let timers = TimerRegistry::new();
        let hits = counter();
        let h = Arc::clone(&hits);
        timers.set_timeout("t", Duration::from_millis(10), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.clear("t"));
        assert!(!timers.clear("t"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_by_prefix_only_touches_matching_ids() {
        let timers = TimerRegistry::new();
        for id in ["job:a:poll", "job:a:stale", "job:ab:poll", "guard:k"] {
            timers.set_timeout(id, Duration::from_secs(60), async {});
        }

        assert_eq!(timers.clear_by_prefix("job:a:"), 2);
        let remaining: Vec<String> = timers.active_timers().into_iter().map(|h| h.id).collect();
        assert_eq!(remaining, vec!["guard:k".to_string(), "job:ab:poll".to_string()]);
        assert!(timers.active_timers_with_prefix("job:a:").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn interval_ticks_until_break() {
        let timers = TimerRegistry::new();
        let ticks = counter();
        let t = Arc::clone(&ticks);
        let handle = timers.set_interval("heartbeat", Duration::from_millis(10), move || {
            let t = Arc::clone(&t);
            async move {
                if t.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
        });
        assert_eq!(handle.kind, TimerKind::Interval);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(!timers.is_active("heartbeat"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_interval_ticks_instead_of_panicking() {
        let timers = TimerRegistry::new();
        let ticks = counter();
        let t = Arc::clone(&ticks);
        timers.set_interval("job:1:push-retry", Duration::ZERO, move || {
            let t = Arc::clone(&t);
            async move {
                if t.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(!timers.is_active("job:1:push-retry"));
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_interval_stops_ticking() {
        let timers = TimerRegistry::new();
        let ticks = counter();
        let t = Arc::clone(&ticks);
        timers.set_interval("heartbeat", Duration::from_millis(10), move || {
            t.fetch_add(1, Ordering::SeqCst);
            async { ControlFlow::Continue(()) }
        });

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(timers.clear_all(), 1);
        let seen = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_may_reschedule_its_own_id() {
        let timers = TimerRegistry::new();
        let hits = counter();

        fn arm(timers: TimerRegistry, hits: Arc<AtomicUsize>) {
            let again = timers.clone();
            timers.set_timeout("loop", Duration::from_millis(10), async move {
                if hits.fetch_add(1, Ordering::SeqCst) + 1 < 4 {
                    arm(again, hits);
                }
            });
        }
        arm(timers.clone(), Arc::clone(&hits));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert!(timers.is_empty());
    }
}
