use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::{LedgerError, Reservation, ReservationId, TokenLedger};

/// Client for the remote token ledger service.
pub struct HttpTokenLedger {
    token: String,
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BalanceBody {
    balance: i64,
}

impl HttpTokenLedger {
    pub fn new(base_url: String, token: String, timeout: Duration) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        Ok(Self {
            token,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response, LedgerError> {
        self.client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(transport)
    }
}

fn transport(err: reqwest::Error) -> LedgerError {
    if err.is_timeout() {
        LedgerError::Timeout
    } else {
        LedgerError::Unavailable(err.to_string())
    }
}

async fn read<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    reservation: Option<&ReservationId>,
) -> Result<T, LedgerError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(match (status, reservation) {
            (StatusCode::NOT_FOUND, Some(id)) => LedgerError::UnknownReservation(id.clone()),
            (StatusCode::CONFLICT, Some(id)) => LedgerError::AlreadySettled(id.clone()),
            (StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT, _) => LedgerError::Timeout,
            _ => LedgerError::Unavailable(format!("status {}: {message}", status.as_u16())),
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| LedgerError::Unavailable(e.to_string()))
}

#[async_trait]
impl TokenLedger for HttpTokenLedger {
    async fn balance(&self) -> Result<i64, LedgerError> {
        let response = self
            .client
            .get(format!("{}/tokens/balance", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;
        read::<BalanceBody>(response, None).await.map(|b| b.balance)
    }

    async fn reserve(&self, cost: u64) -> Result<Reservation, LedgerError> {
        let response = self.post("/tokens/reserve", json!({ "amount": cost })).await?;
        if response.status() == StatusCode::PAYMENT_REQUIRED {
            let body = response.json::<BalanceBody>().await.unwrap_or(BalanceBody { balance: 0 });
            return Err(LedgerError::InsufficientTokens {
                balance: body.balance,
                required: cost,
            });
        }
        read(response, None).await
    }

    async fn commit(&self, id: &ReservationId) -> Result<(), LedgerError> {
        let response = self
            .post("/tokens/commit", json!({ "reservationId": id }))
            .await?;
        read::<serde_json::Value>(response, Some(id)).await.map(|_| ())
    }

    async fn refund(&self, id: &ReservationId) -> Result<i64, LedgerError> {
        let response = self
            .post("/tokens/refund", json!({ "reservationId": id }))
            .await?;
        read::<BalanceBody>(response, Some(id)).await.map(|b| b.balance)
    }

    async fn bonus(&self, amount: u64) -> Result<i64, LedgerError> {
        let response = self.post("/tokens/bonus", json!({ "amount": amount })).await?;
        read::<BalanceBody>(response, None).await.map(|b| b.balance)
    }
}
