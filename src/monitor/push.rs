//! Push-channel message contract and connector seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::MonitorError;
use crate::state_machine::{EventSource, JobEvent, JobEventKind, ProgressMeta};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "authenticate")]
    Authenticate { token: String },

    #[serde(rename = "subscribe-assessment", rename_all = "camelCase")]
    Subscribe { job_id: String },

    #[serde(rename = "unsubscribe-assessment", rename_all = "camelCase")]
    Unsubscribe { job_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "authenticated")]
    Authenticated {
        #[serde(default, rename = "userId")]
        user_id: Option<String>,
    },

    #[serde(rename = "auth_error")]
    AuthError { message: String },

    #[serde(rename = "analysis-started", rename_all = "camelCase")]
    AnalysisStarted {
        job_id: String,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        metadata: serde_json::Value,
        #[serde(default)]
        timestamp: Option<String>,
    },

    #[serde(rename = "analysis-complete", rename_all = "camelCase")]
    AnalysisComplete {
        job_id: String,
        result_id: String,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        metadata: serde_json::Value,
        #[serde(default)]
        timestamp: Option<String>,
    },

    #[serde(rename = "analysis-failed", rename_all = "camelCase")]
    AnalysisFailed {
        job_id: String,
        error: String,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        metadata: serde_json::Value,
        #[serde(default)]
        timestamp: Option<String>,
    },
}

impl InboundMessage {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            InboundMessage::AnalysisStarted { job_id, .. }
            | InboundMessage::AnalysisComplete { job_id, .. }
            | InboundMessage::AnalysisFailed { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    /// Converts an analysis notification into a push-sourced job event.
    pub fn into_event(self) -> Option<JobEvent> {
        let (job_id, kind, message, metadata) = match self {
            InboundMessage::AnalysisStarted {
                job_id,
                message,
                metadata,
                ..
            } => (job_id, JobEventKind::Started, message, metadata),
            InboundMessage::AnalysisComplete {
                job_id,
                result_id,
                message,
                metadata,
                ..
            } => (job_id, JobEventKind::Completed { result_id }, message, metadata),
            InboundMessage::AnalysisFailed {
                job_id,
                error,
                message,
                metadata,
                ..
            } => (job_id, JobEventKind::Failed { reason: error }, message, metadata),
            InboundMessage::Authenticated { .. } | InboundMessage::AuthError { .. } => return None,
        };
        Some(JobEvent::new(job_id, EventSource::Push, kind).with_meta(ProgressMeta {
            message,
            percent: None,
            metadata,
        }))
    }
}

/// A live, bidirectional connection to the notifier.
pub struct PushConnection {
    pub outbound: mpsc::UnboundedSender<OutboundMessage>,
    pub inbound: mpsc::UnboundedReceiver<InboundMessage>,
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self) -> Result<PushConnection, MonitorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_wire_format() {
        let json = serde_json::to_value(OutboundMessage::Subscribe {
            job_id: "job-7".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "subscribe-assessment");
        assert_eq!(json["jobId"], "job-7");

        let json = serde_json::to_value(OutboundMessage::Authenticate {
            token: "t".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "authenticate");
        assert_eq!(json["token"], "t");
    }

    #[test]
    fn inbound_complete_becomes_completed_event() {
        let raw = r#"{
            "type": "analysis-complete",
            "jobId": "job-7",
            "resultId": "res-1",
            "status": "completed",
            "message": "done",
            "metadata": {"model": "v2"},
            "timestamp": "2026-01-05T10:00:00Z"
        }"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.job_id(), Some("job-7"));

        let event = msg.into_event().unwrap();
        assert_eq!(event.source, EventSource::Push);
        assert_eq!(event.kind.result_id(), Some("res-1"));
        assert_eq!(event.meta.message.as_deref(), Some("done"));
        assert_eq!(event.meta.metadata["model"], "v2");
    }

    #[test]
    fn inbound_failed_carries_reason() {
        let raw = r#"{"type": "analysis-failed", "jobId": "job-7", "error": "bad scores"}"#;
        let event = serde_json::from_str::<InboundMessage>(raw)
            .unwrap()
            .into_event()
            .unwrap();
        assert_eq!(
            event.kind,
            JobEventKind::Failed {
                reason: "bad scores".into()
            }
        );
    }

    #[test]
    fn auth_messages_are_not_job_events() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"type": "auth_error", "message": "expired"}"#).unwrap();
        assert_eq!(msg.job_id(), None);
        assert!(msg.into_event().is_none());

        let msg: InboundMessage = serde_json::from_str(r#"{"type": "authenticated"}"#).unwrap();
        assert!(matches!(msg, InboundMessage::Authenticated { user_id: None }));
    }
}
