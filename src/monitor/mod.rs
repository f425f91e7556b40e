//! Job monitoring over two racing channels.
//!
//! [`JobMonitor::start`] opens a push subscription (authenticate, then
//! subscribe) and a self-rescheduling poll loop for one job. Both channels
//! funnel events into the same sink; deduplication is the reconciliation
//! engine's job, not the monitor's. [`JobMonitor::stop`] tears everything
//! down, including every timer under `job:{jobId}:`.

mod notifier;
mod poll;
mod push;
mod ws;

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

pub use notifier::{AuthMode, LocalNotifier};
pub use poll::PollPolicy;
pub use push::{InboundMessage, OutboundMessage, PushConnection, PushConnector};
pub use ws::WsPushConnector;

use crate::api::{AssessmentApi, RemoteStatus, StatusResponse};
use crate::error::MonitorError;
use crate::state_machine::{EventSource, JobEvent, JobEventKind, ProgressMeta};
use crate::timer::TimerRegistry;

/// Timer-id prefix owning every timer for a job.
pub fn job_scope(job_id: &str) -> String {
    format!("job:{job_id}:")
}

fn poll_timer_id(job_id: &str) -> String {
    format!("job:{job_id}:poll")
}

fn push_retry_timer_id(job_id: &str) -> String {
    format!("job:{job_id}:push-retry")
}

/// What the monitor reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorSignal {
    Event(JobEvent),
    /// A channel stopped delivering; the other one may still be alive.
    ChannelLost {
        job_id: String,
        channel: EventSource,
        error: MonitorError,
    },
}

pub type EventSink = Arc<dyn Fn(MonitorSignal) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll: PollPolicy,
    pub auth_token: String,
    pub auth_deadline: Duration,
    pub reconnect_interval: Duration,
    pub reconnect_attempts: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            auth_token: String::new(),
            auth_deadline: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(10),
            reconnect_attempts: 3,
        }
    }
}

struct Subscription {
    generation: u64,
    channels: HashSet<EventSource>,
    sink: EventSink,
    push_task: Option<JoinHandle<()>>,
    push_outbound: Option<mpsc::UnboundedSender<OutboundMessage>>,
}

struct Inner {
    api: Arc<dyn AssessmentApi>,
    push: Option<Arc<dyn PushConnector>>,
    timers: TimerRegistry,
    settings: MonitorSettings,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct JobMonitor {
    inner: Arc<Inner>,
}

impl JobMonitor {
    pub fn new(
        api: Arc<dyn AssessmentApi>,
        push: Option<Arc<dyn PushConnector>>,
        timers: TimerRegistry,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                push,
                timers,
                settings,
                subscriptions: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Starts both channels for `job_id`. A running subscription for the same
    /// job is torn down first.
    #[instrument(skip(self, sink))]
    pub fn start(&self, job_id: &str, sink: EventSink) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut subs = self.inner.subscriptions.lock();
            if let Some(previous) = subs.remove(job_id) {
                warn!("restarting an active subscription");
                self.teardown(job_id, previous);
            }
            subs.insert(
                job_id.to_string(),
                Subscription {
                    generation,
                    channels: HashSet::from([EventSource::Poll]),
                    sink,
                    push_task: None,
                    push_outbound: None,
                },
            );
        }

        self.arm_poll(job_id, generation, Some(RemoteStatus::Queued), 0);

        if let Some(connector) = self.inner.push.clone() {
            let monitor = self.clone();
            let job = job_id.to_string();
            let task = tokio::spawn(async move {
                match monitor.connect_push(connector.as_ref(), &job).await {
                    Ok(conn) => {
                        monitor.install_push(&job, generation, conn);
                    }
                    Err(err) => monitor.push_lost(&job, generation, err),
                }
            });
            let mut subs = self.inner.subscriptions.lock();
            match subs.get_mut(job_id) {
                Some(sub) if sub.generation == generation && sub.push_task.is_none() => {
                    sub.push_task = Some(task);
                }
                Some(sub) if sub.generation == generation => {
                    // The connect task already installed its pump.
                    drop(task);
                }
                _ => task.abort(),
            }
        }
        info!("monitoring started");
    }

    /// Unsubscribes the push channel and clears every timer of the job.
    /// Returns whether a subscription existed.
    #[instrument(skip(self))]
    pub fn stop(&self, job_id: &str) -> bool {
        let mut subs = self.inner.subscriptions.lock();
        match subs.remove(job_id) {
            Some(sub) => {
                self.teardown(job_id, sub);
                info!("monitoring stopped");
                true
            }
            None => {
                self.inner.timers.clear_by_prefix(&job_scope(job_id));
                false
            }
        }
    }

    pub fn is_monitoring(&self, job_id: &str) -> bool {
        self.inner.subscriptions.lock().contains_key(job_id)
    }

    pub fn channels(&self, job_id: &str) -> HashSet<EventSource> {
        self.inner
            .subscriptions
            .lock()
            .get(job_id)
            .map(|s| s.channels.clone())
            .unwrap_or_default()
    }

    fn teardown(&self, job_id: &str, sub: Subscription) {
        if let Some(outbound) = sub.push_outbound {
            let _ = outbound.send(OutboundMessage::Unsubscribe {
                job_id: job_id.to_string(),
            });
        }
        if let Some(task) = sub.push_task {
            task.abort();
        }
        let cleared = self.inner.timers.clear_by_prefix(&job_scope(job_id));
        debug!(job_id, cleared, "job timers cleared");
    }

    fn is_current(&self, job_id: &str, generation: u64) -> bool {
        self.inner
            .subscriptions
            .lock()
            .get(job_id)
            .is_some_and(|s| s.generation == generation)
    }

    fn emit(&self, job_id: &str, generation: u64, signal: MonitorSignal) {
        let sink = {
            let subs = self.inner.subscriptions.lock();
            match subs.get(job_id) {
                Some(sub) if sub.generation == generation => Arc::clone(&sub.sink),
                _ => {
                    debug!(job_id, "dropping signal for a stopped subscription");
                    return;
                }
            }
        };
        sink(signal);
    }

    // ── poll channel ────────────────────────────────────────────────

    fn arm_poll(&self, job_id: &str, generation: u64, last: Option<RemoteStatus>, attempt: u32) {
        // Holding the subscription lock while registering keeps `stop` from
        // slipping in between the check and the registration.
        let subs = self.inner.subscriptions.lock();
        match subs.get(job_id) {
            Some(sub) if sub.generation == generation && sub.channels.contains(&EventSource::Poll) => {}
            _ => return,
        }
        let delay = self.inner.settings.poll.delay(last, attempt);
        let monitor = self.clone();
        let job = job_id.to_string();
        self.inner.timers.set_timeout(poll_timer_id(job_id), delay, async move {
            monitor.poll_once(job, generation, attempt).await;
        });
    }

    async fn poll_once(&self, job_id: String, generation: u64, attempt: u32) {
        let attempt = attempt + 1;
        let (last, event) = match self.inner.api.status(&job_id).await {
            Ok(status) => {
                debug!(job_id = %job_id, attempt, status = ?status.status, "poll");
                (Some(status.status), poll_event(&job_id, status))
            }
            Err(err) => {
                warn!(job_id = %job_id, attempt, error = %err, "status poll failed");
                (None, None)
            }
        };

        let terminal = event.as_ref().is_some_and(|e| e.kind.is_terminal());
        if let Some(event) = event {
            self.emit(&job_id, generation, MonitorSignal::Event(event));
        }
        if terminal {
            return;
        }

        if self.inner.settings.poll.exhausted(attempt) {
            self.drop_channel(&job_id, generation, EventSource::Poll);
            self.emit(
                &job_id,
                generation,
                MonitorSignal::ChannelLost {
                    job_id: job_id.clone(),
                    channel: EventSource::Poll,
                    error: MonitorError::PollExhausted { attempts: attempt },
                },
            );
            return;
        }

        self.arm_poll(&job_id, generation, last, attempt);
    }

    fn drop_channel(&self, job_id: &str, generation: u64, channel: EventSource) {
        let mut subs = self.inner.subscriptions.lock();
        if let Some(sub) = subs.get_mut(job_id) {
            if sub.generation == generation {
                sub.channels.remove(&channel);
                if channel == EventSource::Push {
                    sub.push_outbound = None;
                }
            }
        }
    }

    // ── push channel ────────────────────────────────────────────────

    async fn connect_push(
        &self,
        connector: &dyn PushConnector,
        job_id: &str,
    ) -> Result<PushConnection, MonitorError> {
        let mut conn = connector.connect().await?;
        let closed = || MonitorError::PushConnectFailed("connection closed".into());

        conn.outbound
            .send(OutboundMessage::Authenticate {
                token: self.inner.settings.auth_token.clone(),
            })
            .map_err(|_| closed())?;

        let handshake = async {
            loop {
                match conn.inbound.recv().await {
                    Some(InboundMessage::Authenticated { .. }) => return Ok(()),
                    Some(InboundMessage::AuthError { message }) => {
                        return Err(MonitorError::PushConnectFailed(format!(
                            "authentication rejected: {message}"
                        )));
                    }
                    Some(other) => debug!(?other, "message before authentication ignored"),
                    None => return Err(closed()),
                }
            }
        };
        tokio::time::timeout(self.inner.settings.auth_deadline, handshake)
            .await
            .map_err(|_| MonitorError::PushAuthTimeout)??;

        conn.outbound
            .send(OutboundMessage::Subscribe {
                job_id: job_id.to_string(),
            })
            .map_err(|_| closed())?;
        Ok(conn)
    }

    /// Wires an authenticated connection into the subscription and starts
    /// pumping its messages. Returns false if the job is no longer monitored.
    fn install_push(&self, job_id: &str, generation: u64, conn: PushConnection) -> bool {
        let mut subs = self.inner.subscriptions.lock();
        let Some(sub) = subs.get_mut(job_id).filter(|s| s.generation == generation) else {
            return false;
        };

        let monitor = self.clone();
        let job = job_id.to_string();
        let mut inbound = conn.inbound;
        let pump = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                debug!(job_id = %job, payload = ?message, "push message");
                match message.into_event() {
                    Some(event) if event.job_id == job => {
                        monitor.emit(&job, generation, MonitorSignal::Event(event));
                    }
                    _ => {}
                }
            }
            monitor.push_lost(
                &job,
                generation,
                MonitorError::PushConnectFailed("notifier closed the connection".into()),
            );
        });

        sub.channels.insert(EventSource::Push);
        sub.push_outbound = Some(conn.outbound);
        // The replaced handle, if any, belongs to the finishing connect task.
        sub.push_task = Some(pump);
        info!(job_id, "push channel subscribed");
        true
    }

    fn push_lost(&self, job_id: &str, generation: u64, error: MonitorError) {
        warn!(job_id, error = %error, "push channel unavailable");
        self.drop_channel(job_id, generation, EventSource::Push);
        self.emit(
            job_id,
            generation,
            MonitorSignal::ChannelLost {
                job_id: job_id.to_string(),
                channel: EventSource::Push,
                error,
            },
        );
        self.arm_reconnect(job_id, generation);
    }

    fn arm_reconnect(&self, job_id: &str, generation: u64) {
        let attempts = self.inner.settings.reconnect_attempts;
        let Some(connector) = self.inner.push.clone() else {
            return;
        };
        if attempts == 0 {
            return;
        }

        let subs = self.inner.subscriptions.lock();
        if !subs.get(job_id).is_some_and(|s| s.generation == generation) {
            return;
        }
        let remaining = Arc::new(AtomicU32::new(attempts));
        let monitor = self.clone();
        let job = job_id.to_string();
        self.inner.timers.set_interval(
            push_retry_timer_id(job_id),
            self.inner.settings.reconnect_interval,
            move || {
                let monitor = monitor.clone();
                let connector = Arc::clone(&connector);
                let job = job.clone();
                let remaining = Arc::clone(&remaining);
                async move {
                    if !monitor.is_current(&job, generation) {
                        return ControlFlow::Break(());
                    }
                    match monitor.connect_push(connector.as_ref(), &job).await {
                        Ok(conn) => {
                            monitor.install_push(&job, generation, conn);
                            ControlFlow::Break(())
                        }
                        Err(err) => {
                            let left = remaining.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
                            debug!(job_id = %job, error = %err, left, "push reconnect failed");
                            if left == 0 {
                                warn!(job_id = %job, "giving up on the push channel");
                                ControlFlow::Break(())
                            } else {
                                ControlFlow::Continue(())
                            }
                        }
                    }
                }
            },
        );
    }
}

/// Maps a status response to the event it implies, if any.
///
/// `completed` without a result id yields nothing; the policy's zero
/// completed-delay makes the next poll an immediate confirmation check.
fn poll_event(job_id: &str, status: StatusResponse) -> Option<JobEvent> {
    let meta = ProgressMeta {
        message: status.message.clone(),
        percent: status.progress,
        metadata: serde_json::to_value(&status.token_info).unwrap_or_default(),
    };
    let kind = match status.status {
        RemoteStatus::Processing => JobEventKind::Progress,
        RemoteStatus::Completed => JobEventKind::Completed {
            result_id: status.result_id?,
        },
        RemoteStatus::Failed => JobEventKind::Failed {
            reason: status.error.unwrap_or_else(|| "analysis failed".to_string()),
        },
        RemoteStatus::Queued | RemoteStatus::Unknown => return None,
    };
    Some(JobEvent::new(job_id, EventSource::Poll, kind).with_meta(meta))
}
