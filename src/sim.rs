//! Simulated assessment backend.
//!
//! Implements [`AssessmentApi`] in-process: submissions are idempotent on
//! their key, and each job walks queued → processing → completed/failed on
//! a fixed schedule measured with tokio's clock, so paused-time tests and the
//! `demo` command see the same timeline. With a [`LocalNotifier`] attached the
//! backend also publishes the matching push notifications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::api::{ApiError, AssessmentApi, RemoteStatus, StatusResponse, SubmitRequest, SubmitResponse, TokenInfo};
use crate::monitor::{InboundMessage, LocalNotifier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOutcome {
    Complete,
    Fail(String),
}

/// Timeline every simulated job follows, relative to its submission.
#[derive(Debug, Clone)]
pub struct SimPlan {
    pub start_after: Duration,
    pub finish_after: Duration,
    pub outcome: SimOutcome,
    /// Publish push notifications when a notifier is attached.
    pub push: bool,
    /// Report `resultId` in completed status responses.
    pub poll_result_id: bool,
}

impl Default for SimPlan {
    fn default() -> Self {
        Self {
            start_after: Duration::from_secs(1),
            finish_after: Duration::from_secs(4),
            outcome: SimOutcome::Complete,
            push: true,
            poll_result_id: true,
        }
    }
}

struct SimJob {
    submitted_at: Instant,
    submitted_wall: chrono::DateTime<Utc>,
    plan: SimPlan,
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, SimJob>,
    by_key: HashMap<String, String>,
    failures_left: usize,
    next_id: u64,
}

pub struct SimulatedAssessmentApi {
    plan: Mutex<SimPlan>,
    state: Mutex<State>,
    notifier: Option<LocalNotifier>,
    submit_latency: Mutex<Duration>,
    submit_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

pub fn result_id_for(job_id: &str) -> String {
    format!("res-{job_id}")
}

impl SimulatedAssessmentApi {
    pub fn new(plan: SimPlan) -> Self {
        Self {
            plan: Mutex::new(plan),
            state: Mutex::new(State::default()),
            notifier: None,
            submit_latency: Mutex::new(Duration::ZERO),
            submit_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_notifier(mut self, notifier: LocalNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Plan for jobs submitted from now on.
    pub fn set_plan(&self, plan: SimPlan) {
        *self.plan.lock() = plan;
    }

    /// The next `n` submit calls fail with a retryable 503.
    pub fn fail_next_submits(&self, n: usize) {
        self.state.lock().failures_left = n;
    }

    pub fn set_submit_latency(&self, latency: Duration) {
        *self.submit_latency.lock() = latency;
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Distinct jobs created, i.e. accepted submissions.
    pub fn job_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    fn publish_timeline(&self, job_id: String, plan: SimPlan) {
        let Some(notifier) = self.notifier.clone().filter(|_| plan.push) else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(plan.start_after).await;
            notifier.publish(InboundMessage::AnalysisStarted {
                job_id: job_id.clone(),
                status: Some("processing".into()),
                message: Some("analysis started".into()),
                metadata: serde_json::Value::Null,
                timestamp: Some(Utc::now().to_rfc3339()),
            });

            tokio::time::sleep(plan.finish_after.saturating_sub(plan.start_after)).await;
            let message = match plan.outcome {
                SimOutcome::Complete => InboundMessage::AnalysisComplete {
                    result_id: result_id_for(&job_id),
                    job_id,
                    status: Some("completed".into()),
                    message: Some("analysis complete".into()),
                    metadata: serde_json::Value::Null,
                    timestamp: Some(Utc::now().to_rfc3339()),
                },
                SimOutcome::Fail(error) => InboundMessage::AnalysisFailed {
                    job_id,
                    error,
                    message: None,
                    metadata: serde_json::Value::Null,
                    timestamp: Some(Utc::now().to_rfc3339()),
                },
            };
            let delivered = notifier.publish(message);
            debug!(delivered, "simulated terminal notification published");
        });
    }
}

#[async_trait]
impl AssessmentApi for SimulatedAssessmentApi {
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitResponse, ApiError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.submit_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let created = {
            let mut state = self.state.lock();
            if state.failures_left > 0 {
                state.failures_left -= 1;
                return Err(ApiError::Status {
                    status: 503,
                    message: "service unavailable".into(),
                });
            }
            if let Some(job_id) = state.by_key.get(&request.idempotency_key) {
                return Ok(SubmitResponse {
                    job_id: job_id.clone(),
                    tokens_deducted: 0,
                    previous_balance: 0,
                    new_balance: 0,
                });
            }

            state.next_id += 1;
            let job_id = format!("job-{}", state.next_id);
            let plan = self.plan.lock().clone();
            state.by_key.insert(request.idempotency_key.clone(), job_id.clone());
            state.jobs.insert(
                job_id.clone(),
                SimJob {
                    submitted_at: Instant::now(),
                    submitted_wall: Utc::now(),
                    plan: plan.clone(),
                },
            );
            (job_id, plan)
        };

        let (job_id, plan) = created;
        debug!(job_id = %job_id, "simulated job created");
        self.publish_timeline(job_id.clone(), plan);
        Ok(SubmitResponse {
            job_id,
            tokens_deducted: 0,
            previous_balance: 0,
            new_balance: 0,
        })
    }

    async fn status(&self, job_id: &str) -> Result<StatusResponse, ApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let Some(job) = state.jobs.get(job_id) else {
            return Err(ApiError::Status {
                status: 404,
                message: format!("unknown job {job_id}"),
            });
        };

        let elapsed = job.submitted_at.elapsed();
        let plan = &job.plan;
        let mut response = StatusResponse {
            status: RemoteStatus::Queued,
            submitted_at: job.submitted_wall,
            completed_at: None,
            token_info: TokenInfo::default(),
            result_id: None,
            error: None,
            progress: None,
            message: None,
        };

        if elapsed < plan.start_after {
            return Ok(response);
        }
        if elapsed < plan.finish_after {
            let span = plan.finish_after.saturating_sub(plan.start_after).as_secs_f64();
            let done = (elapsed - plan.start_after).as_secs_f64();
            let percent = if span > 0.0 { (done / span * 100.0) as u8 } else { 0 };
            response.status = RemoteStatus::Processing;
            response.progress = Some(percent.min(99));
            response.message = Some("analysing scores".into());
            return Ok(response);
        }

        response.completed_at = Some(Utc::now());
        match &plan.outcome {
            SimOutcome::Complete => {
                response.status = RemoteStatus::Completed;
                response.progress = Some(100);
                if plan.poll_result_id {
                    response.result_id = Some(result_id_for(job_id));
                }
            }
            SimOutcome::Fail(error) => {
                response.status = RemoteStatus::Failed;
                response.error = Some(error.clone());
            }
        }
        Ok(response)
    }
}
