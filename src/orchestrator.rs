//! Workflow state machine driver.
//!
//! One actor task owns the [`Job`] and applies every mutation in inbox order:
//! submit and cancel requests from [`Workflow`] handles, results of the
//! background submit task, monitor signals and timer expiries. Nothing else
//! writes to the job, so its transitions are linearizable.
//!
//! Timers and monitor sinks only hold a weak sender to the inbox; the actor
//! stops once every [`Workflow`] handle is dropped.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::api::{AssessmentApi, SubmitRequest, SubmitResponse};
use crate::error::{ErrorKind, JobError, SubmissionError, WorkflowError};
use crate::guard::{Acquire, SubmissionGuard, SubmissionPermit};
use crate::ledger::{LedgerError, Reservation, ReservationId, TokenLedger, TokenTransaction, TransactionKind};
use crate::monitor::{EventSink, JobMonitor, MonitorSettings, MonitorSignal, PushConnector, job_scope};
use crate::reconcile::{ReconciliationEngine, Verdict};
use crate::state_machine::{
    EventSource, Input, Job, JobEvent, JobEventKind, JobFailure, ProgressMeta, RetryConfig,
    Settlement, StateMachine, SubmissionRequest, Transition, WorkflowState,
};
use crate::timer::TimerRegistry;

/// Caller-facing callbacks. Every method defaults to a no-op.
///
/// Callbacks run on the workflow task and must return quickly.
pub trait WorkflowObserver: Send + Sync {
    fn on_status_change(&self, _state: WorkflowState, _progress: u8) {}
    fn on_progress(&self, _meta: &ProgressMeta) {}
    fn on_complete(&self, _result_id: &str) {}
    fn on_error(&self, _kind: ErrorKind, _message: &str) {}
    fn on_token_balance_update(&self, _balance: i64) {}
}

pub struct SilentObserver;

impl WorkflowObserver for SilentObserver {}

/// External collaborators injected into the workflow.
#[derive(Clone)]
pub struct WorkflowDeps {
    pub api: Arc<dyn AssessmentApi>,
    pub ledger: Arc<dyn TokenLedger>,
    pub push: Option<Arc<dyn PushConnector>>,
}

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub assessment_cost: u64,
    /// Tokens granted after a successful commit. Zero disables the bonus.
    pub completion_bonus: u64,
    /// Guard over `validating` + `submitting`.
    pub submission_timeout: Duration,
    /// Ceiling over `queued` + `processing`.
    pub job_ceiling: Duration,
    pub ledger_timeout: Duration,
    pub retry: RetryConfig,
    pub monitor: MonitorSettings,
    pub pending_ttl: Duration,
    pub replay_window: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            assessment_cost: 2,
            completion_bonus: 5,
            submission_timeout: Duration::from_secs(30),
            job_ceiling: Duration::from_secs(600),
            ledger_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            monitor: MonitorSettings::default(),
            pending_ttl: Duration::from_secs(60),
            replay_window: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub job_id: String,
    /// True when the call was answered from an earlier submission with the same key.
    pub deduplicated: bool,
}

type SubmitReply = oneshot::Sender<Result<SubmitOutcome, WorkflowError>>;

enum Command {
    Submit {
        request: SubmissionRequest,
        permit: SubmissionPermit,
        reply: SubmitReply,
    },
    Reserved {
        attempt: String,
        reservation: Reservation,
    },
    Submitted {
        attempt: String,
        response: SubmitResponse,
    },
    SubmitFailed {
        attempt: String,
        error: WorkflowError,
    },
    SubmissionTimeout {
        attempt: String,
    },
    StaleTimeout {
        job_id: String,
    },
    CommitRetry {
        attempt: String,
        reservation: Reservation,
        retry: u32,
    },
    Monitor(MonitorSignal),
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

fn deliver(me: &mpsc::WeakUnboundedSender<Command>, command: Command) {
    if let Some(tx) = me.upgrade() {
        let _ = tx.send(command);
    }
}

fn submission_timer_id(key: &str) -> String {
    format!("submission:{key}:timeout")
}

fn stale_timer_id(job_id: &str) -> String {
    format!("job:{job_id}:stale")
}

/// Lives outside the job scope so teardown leaves a pending commit alone.
fn commit_timer_id(reservation: &ReservationId) -> String {
    format!("settlement:{reservation}:commit")
}

/// Commit attempts after the first one, spaced by the submit retry backoff.
const COMMIT_RETRIES: u32 = 5;

async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(LedgerError::Timeout))
}

/// Cloneable handle to a running workflow.
#[derive(Clone)]
pub struct Workflow {
    tx: mpsc::UnboundedSender<Command>,
    guard: Arc<SubmissionGuard>,
    timers: TimerRegistry,
    snapshot: watch::Receiver<Option<Job>>,
}

impl Workflow {
    /// Starts the workflow actor on the current tokio runtime.
    pub fn spawn(
        deps: WorkflowDeps,
        config: WorkflowConfig,
        observer: Arc<dyn WorkflowObserver>,
    ) -> Self {
        let timers = TimerRegistry::new();
        let guard = Arc::new(SubmissionGuard::new(
            timers.clone(),
            config.pending_ttl,
            config.replay_window,
        ));
        let monitor = JobMonitor::new(
            Arc::clone(&deps.api),
            deps.push.clone(),
            timers.clone(),
            config.monitor.clone(),
        );
        let (tx, inbox) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(None);

        let actor = Actor {
            deps,
            config,
            observer,
            guard: Arc::clone(&guard),
            timers: timers.clone(),
            monitor,
            engine: ReconciliationEngine::new(),
            inbox,
            me: tx.downgrade(),
            snapshot: snapshot_tx,
            job: None,
            attempt: None,
            deferred: VecDeque::new(),
        };
        tokio::spawn(actor.run());

        Self {
            tx,
            guard,
            timers,
            snapshot,
        }
    }

    /// Submits `request`, resolving once a job id is issued or the attempt fails.
    ///
    /// Calls sharing an idempotency key never reach the ledger or the API
    /// twice: they wait on the first attempt and receive its job id.
    #[instrument(skip_all, fields(key = %request.idempotency_key))]
    pub async fn submit(&self, request: SubmissionRequest) -> Result<SubmitOutcome, WorkflowError> {
        let key = request.idempotency_key.clone();
        match self.guard.acquire(&key) {
            Acquire::AlreadyPending(pending) => {
                debug!("waiting on the in-flight submission");
                let job_id = pending.wait().await?;
                Ok(SubmitOutcome {
                    job_id,
                    deduplicated: true,
                })
            }
            Acquire::Acquired(permit) => {
                let (reply, rx) = oneshot::channel();
                let command = Command::Submit {
                    request,
                    permit,
                    reply,
                };
                if let Err(SendError(Command::Submit { permit, .. })) = self.tx.send(command) {
                    self.guard.release(permit, WorkflowError::Closed);
                    return Err(WorkflowError::Closed);
                }
                rx.await.map_err(|_| WorkflowError::Closed)?
            }
        }
    }

    /// Cancels the active job. Resolves after the monitor is stopped, the
    /// job's timers are cleared and any open reservation is refunded.
    /// Returns false when nothing was cancellable.
    pub async fn cancel(&self) -> Result<bool, WorkflowError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Cancel { reply })
            .map_err(|_| WorkflowError::Closed)?;
        rx.await.map_err(|_| WorkflowError::Closed)
    }

    pub fn snapshot(&self) -> Option<Job> {
        self.snapshot.borrow().clone()
    }

    /// Waits until the current job satisfies `predicate`.
    pub async fn wait_until(&self, predicate: impl Fn(&Job) -> bool) -> Result<Job, WorkflowError> {
        let mut rx = self.snapshot.clone();
        let job = rx
            .wait_for(|job| job.as_ref().is_some_and(&predicate))
            .await
            .map_err(|_| WorkflowError::Closed)?;
        job.clone().ok_or(WorkflowError::Closed)
    }

    /// Waits until the current job reaches a terminal state.
    pub async fn wait_terminal(&self) -> Result<Job, WorkflowError> {
        self.wait_until(Job::is_terminal).await
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    /// Cancels any active job, clears every timer and stops the actor.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// The submit attempt that currently owns the guard permit.
struct Attempt {
    id: String,
    permit: SubmissionPermit,
    reply: Option<SubmitReply>,
    abandoned: Arc<AtomicBool>,
}

impl Attempt {
    fn abandon(self, guard: &SubmissionGuard, err: WorkflowError) {
        self.abandoned.store(true, Ordering::Release);
        guard.release(self.permit, err.clone());
        if let Some(reply) = self.reply {
            let _ = reply.send(Err(err));
        }
    }
}

struct Actor {
    deps: WorkflowDeps,
    config: WorkflowConfig,
    observer: Arc<dyn WorkflowObserver>,
    guard: Arc<SubmissionGuard>,
    timers: TimerRegistry,
    monitor: JobMonitor,
    engine: ReconciliationEngine,
    inbox: mpsc::UnboundedReceiver<Command>,
    me: mpsc::WeakUnboundedSender<Command>,
    snapshot: watch::Sender<Option<Job>>,
    job: Option<Job>,
    attempt: Option<Attempt>,
    deferred: VecDeque<Command>,
}

impl Actor {
    async fn run(mut self) {
        debug!("workflow actor started");
        while let Some(command) = self.next_command().await {
            match command {
                Command::Submit {
                    request,
                    permit,
                    reply,
                } => self.on_submit(request, permit, reply).await,
                Command::Reserved {
                    attempt,
                    reservation,
                } => self.on_reserved(attempt, reservation).await,
                Command::Submitted { attempt, response } => self.on_submitted(attempt, response),
                Command::SubmitFailed { attempt, error } => {
                    if self.is_current_attempt(&attempt) {
                        self.terminate(Input::Fail, error).await;
                    } else {
                        debug!(attempt = %attempt, error = %error, "failure of an abandoned submission");
                    }
                }
                Command::SubmissionTimeout { attempt } => {
                    if self.is_current_attempt(&attempt) {
                        warn!("submission timed out before a job id was issued");
                        self.terminate(Input::Fail, SubmissionError::Timeout.into())
                            .await;
                    }
                }
                Command::StaleTimeout { job_id } => {
                    let monitored = self.job.as_ref().is_some_and(|job| {
                        job.status.is_active() && job.job_id.as_deref() == Some(job_id.as_str())
                    });
                    if monitored {
                        warn!(job_id = %job_id, "job exceeded its ceiling without a terminal status");
                        self.terminate(Input::Fail, JobError::StaleTimeout.into()).await;
                    }
                }
                Command::CommitRetry {
                    attempt,
                    reservation,
                    retry,
                } => self.on_commit_retry(attempt, reservation, retry).await,
                Command::Monitor(signal) => {
                    let batch = self.drain(signal);
                    self.on_signals(batch).await;
                }
                Command::Cancel { reply } => {
                    let cancelled = self.cancel().await;
                    let _ = reply.send(cancelled);
                }
                Command::Shutdown { reply } => {
                    self.close().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }
        self.close().await;
    }

    async fn next_command(&mut self) -> Option<Command> {
        match self.deferred.pop_front() {
            Some(command) => Some(command),
            None => self.inbox.recv().await,
        }
    }

    /// Collects the monitor signals queued directly behind `first`. Signals in
    /// one batch are treated as simultaneous. Draining stops at the first
    /// other command, which runs next, so inbox order holds across kinds.
    fn drain(&mut self, first: MonitorSignal) -> Vec<MonitorSignal> {
        let mut batch = vec![first];
        if !self.deferred.is_empty() {
            return batch;
        }
        while let Ok(command) = self.inbox.try_recv() {
            match command {
                Command::Monitor(signal) => batch.push(signal),
                other => {
                    self.deferred.push_back(other);
                    break;
                }
            }
        }
        batch
    }

    fn is_current_attempt(&self, attempt: &str) -> bool {
        self.attempt.as_ref().is_some_and(|a| a.id == attempt)
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.job.clone());
    }

    fn sink(&self) -> EventSink {
        let me = self.me.clone();
        Arc::new(move |signal| deliver(&me, Command::Monitor(signal)))
    }

    fn arm(&self, id: String, delay: Duration, command: Command) {
        let me = self.me.clone();
        self.timers
            .set_timeout(id, delay, async move { deliver(&me, command) });
    }

    // ── submit ──────────────────────────────────────────────────────

    async fn on_submit(&mut self, request: SubmissionRequest, permit: SubmissionPermit, reply: SubmitReply) {
        if let Some(active) = self.job.as_ref().filter(|job| job.status.is_active()) {
            if active.idempotency_key == request.idempotency_key {
                if let Some(job_id) = active.job_id.clone() {
                    debug!(job_id = %job_id, "key matches the active job");
                    self.guard.resolve(&permit, &job_id);
                    let _ = reply.send(Ok(SubmitOutcome {
                        job_id,
                        deduplicated: true,
                    }));
                    return;
                }
            }
            let err = WorkflowError::from(SubmissionError::DuplicateSubmission(format!(
                "another submission is {}",
                active.status
            )));
            warn!(error = %err, "submission rejected");
            self.guard.release(permit, err.clone());
            let _ = reply.send(Err(err));
            return;
        }

        if let Some(previous) = self.job.as_ref().and_then(|job| job.job_id.as_deref()) {
            self.engine.forget(previous);
        }

        let mut job = Job::new(&request);
        StateMachine::next(&mut job, Input::Submit);
        info!(label = %job.assessment_label, "submission started");
        let attempt = job.id.clone();
        let abandoned = Arc::new(AtomicBool::new(false));
        self.job = Some(job);
        self.attempt = Some(Attempt {
            id: attempt.clone(),
            permit,
            reply: Some(reply),
            abandoned: Arc::clone(&abandoned),
        });
        self.arm(
            submission_timer_id(&request.idempotency_key),
            self.config.submission_timeout,
            Command::SubmissionTimeout {
                attempt: attempt.clone(),
            },
        );
        self.publish();
        self.observer.on_status_change(
            WorkflowState::Validating,
            WorkflowState::Validating.progress_percent(),
        );

        if let Err(err) = request.validate() {
            self.terminate(Input::Fail, err.into()).await;
            return;
        }

        if let Some(job) = self.job.as_mut() {
            StateMachine::next(job, Input::Validated);
        }
        self.publish();
        self.observer.on_status_change(
            WorkflowState::Submitting,
            WorkflowState::Submitting.progress_percent(),
        );

        tokio::spawn(run_submission(
            Arc::clone(&self.deps.api),
            Arc::clone(&self.deps.ledger),
            self.config.clone(),
            request,
            attempt,
            abandoned,
            self.me.clone(),
        ));
    }

    async fn on_reserved(&mut self, attempt: String, reservation: Reservation) {
        let reserve = TokenTransaction::new(
            TransactionKind::Reserve,
            Some(reservation.id.clone()),
            reservation.amount,
            None,
        );

        if self.is_current_attempt(&attempt) {
            if let Some(job) = self.job.as_mut() {
                job.transactions.push(reserve);
                job.reservation = Some(reservation.clone());
                job.settlement = Settlement::Reserved;
            }
            self.publish();
            debug!(reservation = %reservation.id, amount = reservation.amount, "tokens reserved");
            self.observer.on_token_balance_update(reservation.balance);
            return;
        }

        warn!(attempt = %attempt, "reservation for an abandoned submission, refunding");
        let refunded = bounded(
            self.config.ledger_timeout,
            self.deps.ledger.refund(&reservation.id),
        )
        .await;
        match refunded {
            Ok(balance) => {
                if let Some(job) = self.job.as_mut().filter(|job| job.id == attempt) {
                    job.transactions.push(reserve);
                    job.transactions.push(TokenTransaction::new(
                        TransactionKind::Refund,
                        Some(reservation.id.clone()),
                        reservation.amount,
                        None,
                    ));
                    job.reservation = Some(reservation);
                    job.settlement = Settlement::Refunded;
                }
                self.publish();
                self.observer.on_token_balance_update(balance);
            }
            Err(err) => {
                error!(reservation = %reservation.id, error = %err, "late reservation could not be refunded");
            }
        }
    }

    fn on_submitted(&mut self, attempt: String, response: SubmitResponse) {
        if !self.is_current_attempt(&attempt) {
            warn!(job_id = %response.job_id, "job id for an abandoned submission ignored");
            return;
        }
        let Some(pending) = self.attempt.take() else {
            return;
        };
        let job_id = response.job_id;
        let Some(job) = self.job.as_mut() else {
            return;
        };

        job.job_id = Some(job_id.clone());
        for tx in job.transactions.iter_mut().filter(|tx| tx.job_id.is_none()) {
            tx.job_id = Some(job_id.clone());
        }
        StateMachine::next(job, Input::JobIssued);
        let key = job.idempotency_key.clone();

        self.timers.clear(&submission_timer_id(&key));
        self.guard.resolve(&pending.permit, &job_id);
        self.arm(
            stale_timer_id(&job_id),
            self.config.job_ceiling,
            Command::StaleTimeout {
                job_id: job_id.clone(),
            },
        );
        self.engine.track(&job_id);
        self.monitor.start(&job_id, self.sink());
        self.publish();

        info!(job_id = %job_id, "assessment queued");
        self.observer.on_status_change(
            WorkflowState::Queued,
            WorkflowState::Queued.progress_percent(),
        );
        if let Some(reply) = pending.reply {
            let _ = reply.send(Ok(SubmitOutcome {
                job_id,
                deduplicated: false,
            }));
        }
    }

    // ── monitoring ──────────────────────────────────────────────────

    async fn on_signals(&mut self, batch: Vec<MonitorSignal>) {
        let monitored = self
            .job
            .as_ref()
            .filter(|job| matches!(job.status, WorkflowState::Queued | WorkflowState::Processing))
            .and_then(|job| job.job_id.clone());
        let Some(job_id) = monitored else {
            debug!(signals = batch.len(), "signals outside monitoring ignored");
            return;
        };

        let mut terminal = None;
        let mut conflict = None;
        let mut lost = Vec::new();
        for signal in batch {
            match signal {
                MonitorSignal::Event(event) => match self.engine.apply(event) {
                    Ok(Verdict::Accepted(event)) if event.kind.is_terminal() => terminal = Some(event),
                    Ok(Verdict::Accepted(event)) => self.advance(event),
                    Ok(Verdict::Superseded { previous, winner }) => {
                        debug!(previous = ?previous.kind, winner = ?winner.kind, "terminal superseded within batch");
                        terminal = Some(winner);
                    }
                    Ok(Verdict::Discarded { event, reason }) => {
                        debug!(job_id = %event.job_id, source = %event.source, ?reason, "event discarded");
                    }
                    Err(err) => conflict = Some(err),
                },
                MonitorSignal::ChannelLost {
                    job_id: lost_job,
                    channel,
                    error,
                } if lost_job == job_id => lost.push((channel, error)),
                MonitorSignal::ChannelLost { .. } => {}
            }
        }

        if let Some(err) = conflict {
            error!(job_id = %job_id, error = %err, "channels disagree on the outcome");
            self.terminate(Input::Fail, err.into()).await;
            return;
        }
        if let Some(event) = terminal {
            self.finish(event).await;
            return;
        }
        for (channel, err) in lost {
            if self.monitor.channels(&job_id).is_empty() {
                self.terminate(Input::Fail, err.into()).await;
                return;
            }
            warn!(job_id = %job_id, %channel, error = %err, "channel lost, monitoring continues");
        }
    }

    fn advance(&mut self, event: JobEvent) {
        let input = match event.kind {
            JobEventKind::Started => Input::Started,
            JobEventKind::Progress => Input::Progress,
            JobEventKind::Completed { .. } | JobEventKind::Failed { .. } => return,
        };
        let Some(job) = self.job.as_mut() else {
            return;
        };
        job.terminal_rank = event.rank();
        let transition = StateMachine::next(job, input);
        self.publish();

        debug!(job_id = %event.job_id, source = %event.source, kind = ?event.kind, "event applied");
        if let Transition::Moved { to, .. } = transition {
            self.observer.on_status_change(to, to.progress_percent());
        }
        self.observer.on_progress(&event.meta);
    }

    async fn finish(&mut self, event: JobEvent) {
        if let Some(job) = self.job.as_mut() {
            job.terminal_rank = event.rank();
        }
        match event.kind {
            JobEventKind::Completed { result_id } => self.complete(result_id, event.source).await,
            JobEventKind::Failed { reason } => {
                self.terminate(Input::Fail, JobError::ProcessingFailed(reason).into())
                    .await;
            }
            JobEventKind::Started | JobEventKind::Progress => {}
        }
    }

    // ── terminal paths ──────────────────────────────────────────────

    async fn complete(&mut self, result_id: String, source: EventSource) {
        let Some(job) = self.job.as_mut() else {
            return;
        };
        if !StateMachine::next(job, Input::Complete).changed() {
            return;
        }
        job.result_id = Some(result_id.clone());
        self.teardown();

        let balance = self.settle_completion().await;
        self.publish();

        info!(result_id = %result_id, %source, "assessment completed");
        self.observer.on_status_change(
            WorkflowState::Completed,
            WorkflowState::Completed.progress_percent(),
        );
        self.observer.on_complete(&result_id);
        if let Some(balance) = balance {
            self.observer.on_token_balance_update(balance);
        }
    }

    /// Moves the job to `failed` or `cancelled`, tears everything down and
    /// refunds an open reservation. Returns false if the move was illegal.
    async fn terminate(&mut self, input: Input, err: WorkflowError) -> bool {
        let Some(job) = self.job.as_mut() else {
            return false;
        };
        let to = match StateMachine::next(job, input) {
            Transition::Moved { to, .. } => to,
            other => {
                debug!(?other, "terminal transition rejected");
                return false;
            }
        };
        job.failure = Some(JobFailure {
            kind: err.kind(),
            message: err.to_string(),
        });
        self.teardown();
        let attempt = self.attempt.take();
        if let Some(attempt) = &attempt {
            attempt.abandoned.store(true, Ordering::Release);
        }

        let balance = self.refund().await;
        self.publish();

        warn!(state = %to, kind = %err.kind(), error = %err, "workflow ended without a result");
        self.observer.on_status_change(to, to.progress_percent());
        self.observer.on_error(err.kind(), &err.to_string());
        if let Some(balance) = balance {
            self.observer.on_token_balance_update(balance);
        }
        if let Some(attempt) = attempt {
            attempt.abandon(&self.guard, err);
        }
        true
    }

    async fn cancel(&mut self) -> bool {
        if !self.job.as_ref().is_some_and(|job| job.status.is_active()) {
            debug!("nothing to cancel");
            return false;
        }
        info!("cancelling workflow");
        self.terminate(Input::Cancel, WorkflowError::Cancelled).await
    }

    /// Stops monitoring and clears every timer scoped to the current job.
    fn teardown(&self) {
        let Some(job) = self.job.as_ref() else {
            return;
        };
        self.timers.clear(&submission_timer_id(&job.idempotency_key));
        if let Some(job_id) = job.job_id.as_deref() {
            self.engine.seal(job_id);
            self.monitor.stop(job_id);
            self.timers.clear_by_prefix(&job_scope(job_id));
        }
    }

    /// Commits the open reservation of a completed job. A failed commit is
    /// retried on a timer; the job stays `Reserved` until one lands.
    async fn settle_completion(&mut self) -> Option<i64> {
        let job = self.job.as_ref()?;
        if job.settlement != Settlement::Reserved {
            return None;
        }
        let reservation = job.reservation.clone()?;
        let attempt = job.id.clone();

        match self.commit(&attempt, &reservation, 0).await {
            Ok(balance) => Some(balance),
            Err(err) => {
                warn!(reservation = %reservation.id, error = %err, "commit failed, retrying");
                self.schedule_commit(attempt, reservation, 1);
                None
            }
        }
    }

    fn schedule_commit(&self, attempt: String, reservation: Reservation, retry: u32) {
        let delay = Duration::from_millis(self.config.retry.delay_for_attempt(retry));
        self.arm(
            commit_timer_id(&reservation.id),
            delay,
            Command::CommitRetry {
                attempt,
                reservation,
                retry,
            },
        );
    }

    async fn on_commit_retry(&mut self, attempt: String, reservation: Reservation, retry: u32) {
        match self.commit(&attempt, &reservation, retry).await {
            Ok(balance) => {
                info!(reservation = %reservation.id, retry, "reservation committed on retry");
                self.publish();
                self.observer.on_token_balance_update(balance);
            }
            Err(err) if retry < COMMIT_RETRIES => {
                warn!(reservation = %reservation.id, retry, error = %err, "commit retry failed");
                self.schedule_commit(attempt, reservation, retry + 1);
            }
            Err(err) => {
                error!(
                    reservation = %reservation.id,
                    retries = retry,
                    error = %err,
                    "commit abandoned, reservation left open"
                );
                let err = WorkflowError::from(SubmissionError::from(err));
                self.observer.on_error(
                    err.kind(),
                    &format!("reservation {} could not be committed: {err}", reservation.id),
                );
            }
        }
    }

    /// Commits `reservation` and grants the completion bonus, returning the
    /// resulting balance. Bookkeeping lands on the current job only while it
    /// is still the attempt that made the reservation.
    async fn commit(&mut self, attempt: &str, reservation: &Reservation, retry: u32) -> Result<i64, LedgerError> {
        let ledger = Arc::clone(&self.deps.ledger);
        let limit = self.config.ledger_timeout;
        let bonus = self.config.completion_bonus;

        match bounded(limit, ledger.commit(&reservation.id)).await {
            Ok(()) => {}
            // A commit that timed out earlier may still have landed.
            Err(LedgerError::AlreadySettled(_)) if retry > 0 => {
                debug!(reservation = %reservation.id, "earlier commit already landed");
            }
            Err(err) => return Err(err),
        }
        debug!(reservation = %reservation.id, "reservation committed");

        let granted = if bonus == 0 {
            None
        } else {
            match bounded(limit, ledger.bonus(bonus)).await {
                Ok(balance) => Some(balance),
                Err(err) => {
                    warn!(error = %err, "completion bonus not granted");
                    None
                }
            }
        };

        if let Some(job) = self.job.as_mut().filter(|job| job.id == attempt) {
            job.settlement = Settlement::Committed;
            job.transactions.push(TokenTransaction::new(
                TransactionKind::Commit,
                Some(reservation.id.clone()),
                reservation.amount,
                job.job_id.clone(),
            ));
            if granted.is_some() {
                job.transactions.push(TokenTransaction::new(
                    TransactionKind::Bonus,
                    None,
                    bonus,
                    job.job_id.clone(),
                ));
            }
        }
        Ok(granted.unwrap_or(reservation.balance))
    }

    async fn refund(&mut self) -> Option<i64> {
        let ledger = Arc::clone(&self.deps.ledger);
        let limit = self.config.ledger_timeout;
        let job = self.job.as_mut()?;
        if !job.needs_refund() {
            return None;
        }
        let reservation = job.reservation.clone()?;

        match bounded(limit, ledger.refund(&reservation.id)).await {
            Ok(balance) => {
                job.settlement = Settlement::Refunded;
                job.transactions.push(TokenTransaction::new(
                    TransactionKind::Refund,
                    Some(reservation.id.clone()),
                    reservation.amount,
                    job.job_id.clone(),
                ));
                debug!(reservation = %reservation.id, balance, "reservation refunded");
                Some(balance)
            }
            Err(err) => {
                error!(reservation = %reservation.id, error = %err, "refund failed");
                None
            }
        }
    }

    async fn close(&mut self) {
        if self.job.as_ref().is_some_and(|job| job.status.is_active()) {
            self.terminate(Input::Cancel, WorkflowError::Cancelled).await;
        }
        let unsettled = self.timers.active_timers_with_prefix("settlement:").len();
        if unsettled > 0 {
            warn!(unsettled, "closing with commits still pending");
        }
        let cleared = self.timers.clear_all();
        debug!(cleared, "workflow closed");
    }
}

/// Reserve, then submit with bounded retries. Runs outside the actor and
/// reports back through the inbox.
async fn run_submission(
    api: Arc<dyn AssessmentApi>,
    ledger: Arc<dyn TokenLedger>,
    config: WorkflowConfig,
    request: SubmissionRequest,
    attempt: String,
    abandoned: Arc<AtomicBool>,
    me: mpsc::WeakUnboundedSender<Command>,
) {
    let reservation = match bounded(config.ledger_timeout, ledger.reserve(config.assessment_cost)).await {
        Ok(reservation) => reservation,
        Err(err) => {
            deliver(
                &me,
                Command::SubmitFailed {
                    attempt,
                    error: SubmissionError::from(err).into(),
                },
            );
            return;
        }
    };
    deliver(
        &me,
        Command::Reserved {
            attempt: attempt.clone(),
            reservation,
        },
    );

    let body = SubmitRequest {
        assessment_label: request.assessment_label,
        score_payload: request.score_payload,
        idempotency_key: request.idempotency_key,
    };
    let mut retries = 0;
    loop {
        if abandoned.load(Ordering::Acquire) {
            debug!(attempt = %attempt, "submission abandoned before reaching the api");
            return;
        }
        match api.submit(&body).await {
            Ok(response) => {
                deliver(&me, Command::Submitted { attempt, response });
                return;
            }
            Err(err) => {
                let err = SubmissionError::from(err);
                if err.is_retryable() && retries < config.retry.max_retries {
                    retries += 1;
                    let delay = Duration::from_millis(config.retry.delay_for_attempt(retries));
                    warn!(
                        retry = retries,
                        max_retries = config.retry.max_retries,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "submit failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                deliver(
                    &me,
                    Command::SubmitFailed {
                        attempt,
                        error: err.into(),
                    },
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::sim::{SimPlan, SimulatedAssessmentApi};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    fn scores() -> BTreeMap<String, f64> {
        BTreeMap::from([("openness".to_string(), 64.0)])
    }

    fn request() -> SubmissionRequest {
        SubmissionRequest::with_key("k", "big-five", scores())
    }

    /// A plan whose job stays queued for the whole test.
    fn parked() -> SimPlan {
        SimPlan {
            start_after: Duration::from_secs(3600),
            finish_after: Duration::from_secs(7200),
            ..SimPlan::default()
        }
    }

    /// In-memory ledger with a slow `reserve` and a number of failing commits.
    struct FlakyLedger {
        inner: InMemoryLedger,
        reserve_delay: Duration,
        failing_commits: AtomicUsize,
        commit_calls: AtomicUsize,
    }

    impl FlakyLedger {
        fn new(balance: i64) -> Self {
            Self {
                inner: InMemoryLedger::new(balance),
                reserve_delay: Duration::ZERO,
                failing_commits: AtomicUsize::new(0),
                commit_calls: AtomicUsize::new(0),
            }
        }

        fn reserve_delay(mut self, delay: Duration) -> Self {
            self.reserve_delay = delay;
            self
        }

        fn failing_commits(self, n: usize) -> Self {
            self.failing_commits.store(n, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl TokenLedger for FlakyLedger {
        async fn balance(&self) -> Result<i64, LedgerError> {
            self.inner.balance().await
        }

        async fn reserve(&self, cost: u64) -> Result<Reservation, LedgerError> {
            if !self.reserve_delay.is_zero() {
                tokio::time::sleep(self.reserve_delay).await;
            }
            self.inner.reserve(cost).await
        }

        async fn commit(&self, id: &ReservationId) -> Result<(), LedgerError> {
            self.commit_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_commits.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_commits.store(failing - 1, Ordering::SeqCst);
                return Err(LedgerError::Unavailable("ledger restarting".into()));
            }
            self.inner.commit(id).await
        }

        async fn refund(&self, id: &ReservationId) -> Result<i64, LedgerError> {
            self.inner.refund(id).await
        }

        async fn bonus(&self, amount: u64) -> Result<i64, LedgerError> {
            self.inner.bonus(amount).await
        }
    }

    #[derive(Default)]
    struct Errors(Mutex<Vec<ErrorKind>>);

    impl WorkflowObserver for Errors {
        fn on_error(&self, kind: ErrorKind, _message: &str) {
            self.0.lock().push(kind);
        }
    }

    fn spawn(
        ledger: Arc<dyn TokenLedger>,
        plan: SimPlan,
        observer: Arc<dyn WorkflowObserver>,
    ) -> (Workflow, Arc<SimulatedAssessmentApi>) {
        let api = Arc::new(SimulatedAssessmentApi::new(plan));
        let wf = Workflow::spawn(
            WorkflowDeps {
                api: api.clone(),
                ledger,
                push: None,
            },
            WorkflowConfig::default(),
            observer,
        );
        (wf, api)
    }

    fn workflow(balance: i64, plan: SimPlan) -> (Workflow, Arc<InMemoryLedger>, Arc<SimulatedAssessmentApi>) {
        let ledger = Arc::new(InMemoryLedger::new(balance));
        let (wf, api) = spawn(ledger.clone(), plan, Arc::new(SilentObserver));
        (wf, ledger, api)
    }

    fn signal(job_id: &str, source: EventSource, kind: JobEventKind) -> Command {
        Command::Monitor(MonitorSignal::Event(JobEvent::new(job_id, source, kind)))
    }

    fn completed(result_id: &str) -> JobEventKind {
        JobEventKind::Completed {
            result_id: result_id.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_request_fails_without_side_effects() {
        let (wf, ledger, api) = workflow(10, SimPlan::default());
        let err = wf
            .submit(SubmissionRequest::with_key("k", "", scores()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let job = wf.snapshot().unwrap();
        assert_eq!(job.status, WorkflowState::Failed);
        assert_eq!(job.state_history, vec![WorkflowState::Idle, WorkflowState::Validating]);
        assert_eq!(ledger.count(TransactionKind::Reserve), 0);
        assert_eq!(api.submit_calls(), 0);
        assert!(wf.timers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn different_key_while_active_is_rejected() {
        let (wf, ledger, _api) = workflow(10, SimPlan::default());
        wf.submit(SubmissionRequest::with_key("a", "big-five", scores()))
            .await
            .unwrap();

        let err = wf
            .submit(SubmissionRequest::with_key("b", "big-five", scores()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateSubmission);
        assert_eq!(ledger.count(TransactionKind::Reserve), 1);
        wf.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_without_a_job_is_a_no_op() {
        let (wf, _ledger, _api) = workflow(10, SimPlan::default());
        assert!(!wf.cancel().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_submit_failures() {
        let (wf, ledger, api) = workflow(10, SimPlan::default());
        api.fail_next_submits(2);

        let outcome = wf
            .submit(SubmissionRequest::with_key("k", "big-five", scores()))
            .await
            .unwrap();
        assert!(!outcome.deduplicated);
        assert_eq!(api.submit_calls(), 3);
        assert_eq!(ledger.count(TransactionKind::Reserve), 1);
        wf.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_refund_the_reservation() {
        let (wf, ledger, api) = workflow(10, SimPlan::default());
        api.fail_next_submits(3);

        let err = wf
            .submit(SubmissionRequest::with_key("k", "big-five", scores()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert_eq!(ledger.current_balance(), 10);
        assert_eq!(ledger.count(TransactionKind::Refund), 1);
        assert_eq!(wf.snapshot().unwrap().settlement, Settlement::Refunded);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_ceiling_fails_and_refunds() {
        let plan = SimPlan {
            start_after: Duration::from_secs(3600),
            finish_after: Duration::from_secs(7200),
            ..SimPlan::default()
        };
        let (wf, ledger, _api) = workflow(10, plan);
        wf.submit(SubmissionRequest::with_key("k", "big-five", scores()))
            .await
            .unwrap();

        let job = wf.wait_terminal().await.unwrap();
        assert_eq!(job.status, WorkflowState::Failed);
        assert_eq!(job.failure.unwrap().kind, ErrorKind::StaleTimeout);
        assert_eq!(ledger.current_balance(), 10);
        assert!(wf.timers().active_timers_with_prefix("job:").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_queued_between_signals_wins_over_a_later_completion() {
        let (wf, ledger, _api) = workflow(10, parked());
        let job_id = wf.submit(request()).await.unwrap().job_id;

        let (reply, cancelled) = oneshot::channel();
        wf.tx.send(signal(&job_id, EventSource::Push, JobEventKind::Started)).unwrap();
        wf.tx.send(Command::Cancel { reply }).unwrap();
        wf.tx.send(signal(&job_id, EventSource::Poll, completed("r"))).unwrap();

        assert!(cancelled.await.unwrap());
        tokio::time::sleep(Duration::from_secs(1)).await;

        let job = wf.snapshot().unwrap();
        assert_eq!(job.status, WorkflowState::Cancelled);
        assert_eq!(job.result_id, None);
        assert_eq!(job.settlement, Settlement::Refunded);
        assert_eq!(ledger.count(TransactionKind::Commit), 0);
        assert_eq!(ledger.count(TransactionKind::Bonus), 0);
        assert_eq!(ledger.current_balance(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn submission_slower_than_its_timeout_fails_and_refunds() {
        let (wf, ledger, api) = workflow(10, SimPlan::default());
        api.set_submit_latency(Duration::from_secs(60));

        let err = wf.submit(request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let job = wf.snapshot().unwrap();
        assert_eq!(job.status, WorkflowState::Failed);
        assert_eq!(job.failure.unwrap().kind, ErrorKind::Timeout);
        assert_eq!(job.settlement, Settlement::Refunded);
        assert_eq!(ledger.current_balance(), 10);

        // The api eventually issues a job id nobody is waiting for.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(api.job_count(), 1);
        let job = wf.snapshot().unwrap();
        assert_eq!(job.status, WorkflowState::Failed);
        assert_eq!(job.job_id, None);
        assert_eq!(ledger.count(TransactionKind::Refund), 1);
        assert_eq!(ledger.count(TransactionKind::Commit), 0);
        assert_eq!(api.status_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reservation_landing_after_cancel_is_refunded() {
        let ledger = Arc::new(FlakyLedger::new(10).reserve_delay(Duration::from_secs(5)));
        let (wf, api) = spawn(ledger.clone(), SimPlan::default(), Arc::new(SilentObserver));

        let submitter = wf.clone();
        let pending = tokio::spawn(async move { submitter.submit(request()).await });
        wf.wait_until(|job| job.status == WorkflowState::Submitting)
            .await
            .unwrap();
        assert!(wf.cancel().await.unwrap());
        assert_eq!(pending.await.unwrap().unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(wf.snapshot().unwrap().settlement, Settlement::Unreserved);

        let job = wf
            .wait_until(|job| job.settlement == Settlement::Refunded)
            .await
            .unwrap();
        assert_eq!(job.status, WorkflowState::Cancelled);
        assert_eq!(ledger.inner.current_balance(), 10);
        assert_eq!(ledger.inner.count(TransactionKind::Refund), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(api.submit_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn job_id_issued_after_cancel_is_ignored() {
        let (wf, ledger, api) = workflow(10, SimPlan::default());
        api.set_submit_latency(Duration::from_secs(5));

        let submitter = wf.clone();
        let pending = tokio::spawn(async move { submitter.submit(request()).await });
        wf.wait_until(|job| job.settlement == Settlement::Reserved)
            .await
            .unwrap();
        assert!(wf.cancel().await.unwrap());
        assert_eq!(pending.await.unwrap().unwrap_err().kind(), ErrorKind::Cancelled);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(api.job_count(), 1);
        let job = wf.snapshot().unwrap();
        assert_eq!(job.status, WorkflowState::Cancelled);
        assert_eq!(job.job_id, None);
        assert_eq!(job.settlement, Settlement::Refunded);
        assert_eq!(ledger.current_balance(), 10);
        assert_eq!(ledger.count(TransactionKind::Commit), 0);
        assert_eq!(api.status_calls(), 0);
        assert!(wf.timers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn channels_reporting_different_results_fail_the_job() {
        let (wf, ledger, _api) = workflow(10, parked());
        let job_id = wf.submit(request()).await.unwrap().job_id;

        wf.tx.send(signal(&job_id, EventSource::Push, completed("res-a"))).unwrap();
        wf.tx.send(signal(&job_id, EventSource::Poll, completed("res-b"))).unwrap();

        let job = wf.wait_terminal().await.unwrap();
        assert_eq!(job.status, WorkflowState::Failed);
        assert_eq!(job.result_id, None);
        assert_eq!(job.failure.unwrap().kind, ErrorKind::InconsistentTerminalState);
        assert_eq!(ledger.count(TransactionKind::Commit), 0);
        assert_eq!(ledger.current_balance(), 10);
        assert!(wf.timers().active_timers_with_prefix("job:").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn completion_with_a_result_supersedes_a_failure_in_the_same_batch() {
        let (wf, ledger, _api) = workflow(10, parked());
        let job_id = wf.submit(request()).await.unwrap().job_id;

        let failed = JobEventKind::Failed {
            reason: "worker crashed".into(),
        };
        wf.tx.send(signal(&job_id, EventSource::Poll, failed)).unwrap();
        wf.tx.send(signal(&job_id, EventSource::Push, completed("res-a"))).unwrap();

        let job = wf.wait_terminal().await.unwrap();
        assert_eq!(job.status, WorkflowState::Completed);
        assert_eq!(job.result_id.as_deref(), Some("res-a"));
        assert_eq!(job.failure, None);
        assert_eq!(ledger.count(TransactionKind::Commit), 1);
        assert_eq!(ledger.count(TransactionKind::Refund), 0);
        assert_eq!(ledger.current_balance(), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_commit_is_retried_until_it_lands() {
        let ledger = Arc::new(FlakyLedger::new(10).failing_commits(1));
        let (wf, _api) = spawn(ledger.clone(), SimPlan::default(), Arc::new(SilentObserver));
        wf.submit(request()).await.unwrap();

        let job = wf.wait_terminal().await.unwrap();
        assert_eq!(job.status, WorkflowState::Completed);
        assert_eq!(job.settlement, Settlement::Reserved);
        assert_eq!(wf.timers().active_timers_with_prefix("settlement:").len(), 1);

        let job = wf
            .wait_until(|job| job.settlement == Settlement::Committed)
            .await
            .unwrap();
        let commits = job
            .transactions
            .iter()
            .filter(|tx| tx.kind == TransactionKind::Commit)
            .count();
        assert_eq!(commits, 1);
        assert_eq!(ledger.commit_calls.load(Ordering::SeqCst), 2);
        assert_eq!(ledger.inner.count(TransactionKind::Commit), 1);
        assert_eq!(ledger.inner.current_balance(), 13);
        assert!(wf.timers().active_timers_with_prefix("settlement:").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn commit_that_never_lands_is_reported_once_retries_run_out() {
        let ledger = Arc::new(FlakyLedger::new(10).failing_commits(usize::MAX));
        let errors = Arc::new(Errors::default());
        let (wf, _api) = spawn(ledger.clone(), SimPlan::default(), errors.clone());
        wf.submit(request()).await.unwrap();
        wf.wait_terminal().await.unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        let job = wf.snapshot().unwrap();
        assert_eq!(job.status, WorkflowState::Completed);
        assert_eq!(job.settlement, Settlement::Reserved);
        assert_eq!(
            ledger.commit_calls.load(Ordering::SeqCst),
            1 + COMMIT_RETRIES as usize
        );
        assert_eq!(*errors.0.lock(), vec![ErrorKind::NetworkError]);
        assert!(wf.timers().active_timers_with_prefix("settlement:").is_empty());
    }
}
