//! Token ledger collaborator.
//!
//! The orchestrator never touches a balance directly: it reserves the cost of
//! an assessment before submitting, then settles the reservation with exactly
//! one of `commit` or `refund`. A `bonus` may follow a commit.

mod http;
mod memory;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpTokenLedger;
pub use memory::InMemoryLedger;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(pub String);

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A successful hold on `amount` tokens; `balance` is what remains spendable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    #[serde(rename = "reservationId")]
    pub id: ReservationId,
    pub amount: u64,
    pub balance: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Reserve,
    Commit,
    Refund,
    Bonus,
}

/// One ledger side effect issued on behalf of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransaction {
    pub reservation_id: Option<ReservationId>,
    pub amount: u64,
    pub kind: TransactionKind,
    /// Unset for a reservation whose submission never produced a job id.
    pub job_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl TokenTransaction {
    pub fn new(
        kind: TransactionKind,
        reservation_id: Option<ReservationId>,
        amount: u64,
        job_id: Option<String>,
    ) -> Self {
        Self {
            reservation_id,
            amount,
            kind,
            job_id,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("insufficient tokens: balance {balance}, required {required}")]
    InsufficientTokens { balance: i64, required: u64 },

    #[error("unknown reservation {0}")]
    UnknownReservation(ReservationId),

    #[error("reservation {0} is already settled")]
    AlreadySettled(ReservationId),

    #[error("ledger request timed out")]
    Timeout,

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TokenLedger: Send + Sync {
    async fn balance(&self) -> Result<i64, LedgerError>;

    /// Atomically checks the balance and holds `cost` tokens.
    async fn reserve(&self, cost: u64) -> Result<Reservation, LedgerError>;

    async fn commit(&self, id: &ReservationId) -> Result<(), LedgerError>;

    /// Returns the balance after the held tokens are released.
    async fn refund(&self, id: &ReservationId) -> Result<i64, LedgerError>;

    /// Returns the balance after the bonus is credited.
    async fn bonus(&self, amount: u64) -> Result<i64, LedgerError>;
}
