//! Tipos de dados para requisições e respostas da Assessment API.
//!
//! Todas as structs derivam `Serialize` e `Deserialize` e usam `camelCase`
//! no JSON, conforme o formato esperado pelos endpoints `/assessment/*`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Corpo da requisição para `POST /assessment/submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Nome da avaliação (ex.: "big-five").
    pub assessment_label: String,
    /// Pontuações por dimensão.
    pub score_payload: BTreeMap<String, f64>,
    /// Chave de idempotência fornecida pelo chamador.
    pub idempotency_key: String,
}

/// Resposta de `POST /assessment/submit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    /// Identificador do job de análise criado pelo servidor.
    pub job_id: String,
    /// Tokens debitados pelo servidor para esta submissão.
    #[serde(default)]
    pub tokens_deducted: i64,
    #[serde(default)]
    pub previous_balance: i64,
    #[serde(default)]
    pub new_balance: i64,
}

/// Status de um job conforme reportado pelo servidor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    /// Qualquer valor desconhecido; tratado com backoff exponencial.
    #[serde(other)]
    Unknown,
}

/// Informações de consumo de tokens anexadas ao status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    #[serde(default)]
    pub tokens_deducted: i64,
    #[serde(default)]
    pub balance: Option<i64>,
}

/// Resposta de `GET /assessment/status/{jobId}`, usada pelo canal de polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: RemoteStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub token_info: TokenInfo,
    /// Presente quando `status == completed`.
    #[serde(default)]
    pub result_id: Option<String>,
    /// Presente quando `status == failed`.
    #[serde(default)]
    pub error: Option<String>,
    /// Progresso estimado (0–100), quando o servidor o informa.
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_request_uses_camel_case() {
        let req = SubmitRequest {
            assessment_label: "big-five".into(),
            score_payload: BTreeMap::from([("openness".to_string(), 72.5)]),
            idempotency_key: "key-1".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["assessmentLabel"], "big-five");
        assert_eq!(json["idempotencyKey"], "key-1");
        assert_eq!(json["scorePayload"]["openness"], 72.5);
    }

    #[test]
    fn submit_response_deserialize_from_api_format() {
        let json = r#"{
            "jobId": "job-42",
            "tokensDeducted": 2,
            "previousBalance": 10,
            "newBalance": 8
        }"#;
        let resp: SubmitResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.job_id, "job-42");
        assert_eq!(resp.tokens_deducted, 2);
        assert_eq!(resp.new_balance, 8);
    }

    #[test]
    fn status_response_with_optional_fields_missing() {
        let json = r#"{
            "status": "processing",
            "submittedAt": "2026-01-05T10:00:00Z"
        }"#;
        let resp: StatusResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.status, RemoteStatus::Processing);
        assert!(resp.completed_at.is_none());
        assert!(resp.result_id.is_none());
        assert_eq!(resp.token_info, TokenInfo::default());
    }

    #[test]
    fn unknown_status_is_tolerated() {
        let json = r#"{"status": "archived", "submittedAt": "2026-01-05T10:00:00Z"}"#;
        let resp: StatusResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.status, RemoteStatus::Unknown);
    }
}
