use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{
    LedgerError, Reservation, ReservationId, TokenLedger, TokenTransaction, TransactionKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldState {
    Reserved,
    Committed,
    Refunded,
}

#[derive(Debug)]
struct Hold {
    amount: u64,
    state: HoldState,
}

#[derive(Debug, Default)]
struct LedgerState {
    balance: i64,
    holds: HashMap<ReservationId, Hold>,
    transactions: Vec<TokenTransaction>,
}

/// Process-local ledger. Injected wherever a real ledger service is not
/// available (the demo command, tests).
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new(balance: i64) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                balance,
                ..Default::default()
            }),
        }
    }

    pub fn current_balance(&self) -> i64 {
        self.state.lock().balance
    }

    pub fn transactions(&self) -> Vec<TokenTransaction> {
        self.state.lock().transactions.clone()
    }

    pub fn count(&self, kind: TransactionKind) -> usize {
        self.state
            .lock()
            .transactions
            .iter()
            .filter(|t| t.kind == kind)
            .count()
    }

    fn settle(&self, id: &ReservationId, to: HoldState) -> Result<(u64, i64), LedgerError> {
        let mut state = self.state.lock();
        let hold = state
            .holds
            .get_mut(id)
            .ok_or_else(|| LedgerError::UnknownReservation(id.clone()))?;
        if hold.state != HoldState::Reserved {
            return Err(LedgerError::AlreadySettled(id.clone()));
        }
        hold.state = to;
        let amount = hold.amount;
        if to == HoldState::Refunded {
            state.balance += amount as i64;
        }
        let kind = match to {
            HoldState::Refunded => TransactionKind::Refund,
            _ => TransactionKind::Commit,
        };
        state
            .transactions
            .push(TokenTransaction::new(kind, Some(id.clone()), amount, None));
        Ok((amount, state.balance))
    }
}

#[async_trait]
impl TokenLedger for InMemoryLedger {
    async fn balance(&self) -> Result<i64, LedgerError> {
        Ok(self.current_balance())
    }

    async fn reserve(&self, cost: u64) -> Result<Reservation, LedgerError> {
        let mut state = self.state.lock();
        if state.balance < cost as i64 {
            return Err(LedgerError::InsufficientTokens {
                balance: state.balance,
                required: cost,
            });
        }
        state.balance -= cost as i64;
        let id = ReservationId(Uuid::new_v4().to_string());
        state.holds.insert(
            id.clone(),
            Hold {
                amount: cost,
                state: HoldState::Reserved,
            },
        );
        state.transactions.push(TokenTransaction::new(
            TransactionKind::Reserve,
            Some(id.clone()),
            cost,
            None,
        ));
        debug!(reservation = %id, cost, balance = state.balance, "tokens reserved");
        Ok(Reservation {
            id,
            amount: cost,
            balance: state.balance,
        })
    }

    async fn commit(&self, id: &ReservationId) -> Result<(), LedgerError> {
        self.settle(id, HoldState::Committed).map(|_| ())
    }

    async fn refund(&self, id: &ReservationId) -> Result<i64, LedgerError> {
        self.settle(id, HoldState::Refunded).map(|(_, balance)| balance)
    }

    async fn bonus(&self, amount: u64) -> Result<i64, LedgerError> {
        let mut state = self.state.lock();
        state.balance += amount as i64;
        state
            .transactions
            .push(TokenTransaction::new(TransactionKind::Bonus, None, amount, None));
        Ok(state.balance)
    }
}
