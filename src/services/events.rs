//! Event publication. Events describe ledger changes that already happened,
//! so publication is best-effort relative to the money movement: a failed
//! append is logged and retried a few times, never bubbled up to fail the
//! transaction it describes.

use std::time::Duration;

use bigdecimal::{BigDecimal, Zero};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db;
use crate::domain::balance::Currency;
use crate::domain::event::{
    AggregateType, BalanceDeltaPayload, BalanceInitializedPayload, DomainEvent, EventKind,
    RollbackEventPayload, TransactionEventPayload,
};
use crate::domain::transaction::Transaction;
use crate::error::AppError;

const MAX_APPEND_RETRIES: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 25;

#[derive(Clone)]
pub struct EventPublisher {
    pool: PgPool,
}

impl EventPublisher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn publish(&self, event: DomainEvent) {
        self.publish_batch(vec![event]).await;
    }

    /// Appends the batch atomically, retrying version-assignment conflicts.
    /// Concurrent appends to the same aggregate lose the unique race on
    /// (aggregate, version) and simply try again with a fresh version.
    pub async fn publish_batch(&self, events: Vec<DomainEvent>) {
        if events.is_empty() {
            return;
        }
        for attempt in 1..=MAX_APPEND_RETRIES {
            match db::events::append_batch(&self.pool, &events).await {
                Ok(()) => return,
                Err(e) if e.is_retryable() && attempt < MAX_APPEND_RETRIES => {
                    tracing::debug!(attempt, error = %e, "event append conflicted, retrying");
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64))
                        .await;
                }
                Err(e) => {
                    tracing::warn!(
                        count = events.len(),
                        error = %e,
                        "giving up on recording events"
                    );
                    return;
                }
            }
        }
    }
}

fn transaction_payload(tx: &Transaction, reason: Option<String>) -> TransactionEventPayload {
    TransactionEventPayload {
        transaction_id: tx.id,
        from_user_id: tx.from_user_id,
        to_user_id: tx.to_user_id,
        amount: tx.amount.clone(),
        currency: tx.currency,
        kind: tx.kind,
        reason,
    }
}

pub fn transaction_started(tx: &Transaction) -> Result<DomainEvent, AppError> {
    DomainEvent::new(
        AggregateType::Transaction,
        tx.id,
        EventKind::TransactionStarted,
        &transaction_payload(tx, None),
    )
}

pub fn transaction_succeeded(tx: &Transaction) -> Result<DomainEvent, AppError> {
    DomainEvent::new(
        AggregateType::Transaction,
        tx.id,
        EventKind::TransactionSucceeded,
        &transaction_payload(tx, None),
    )
}

pub fn transaction_failed(tx: &Transaction, reason: &str) -> Result<DomainEvent, AppError> {
    DomainEvent::new(
        AggregateType::Transaction,
        tx.id,
        EventKind::TransactionFailed,
        &transaction_payload(tx, Some(reason.to_string())),
    )
}

/// Recorded on the original transaction's stream, pointing at the
/// compensating transaction that reversed it.
pub fn transaction_rolled_back(
    original_id: Uuid,
    rollback_id: Uuid,
    requested_by: Option<Uuid>,
) -> Result<DomainEvent, AppError> {
    DomainEvent::new(
        AggregateType::Transaction,
        original_id,
        EventKind::TransactionRolledBack,
        &RollbackEventPayload {
            original_transaction_id: original_id,
            rollback_transaction_id: rollback_id,
            requested_by,
        },
    )
}

pub fn balance_initialized(user_id: Uuid, currency: Currency) -> Result<DomainEvent, AppError> {
    DomainEvent::new(
        AggregateType::Balance,
        user_id,
        EventKind::BalanceInitialized,
        &BalanceInitializedPayload {
            user_id,
            currency,
            initial_amount: BigDecimal::zero(),
        },
    )
}

/// One participant's side of a settled transaction. A positive delta becomes
/// `balance.credited`, a negative one `balance.debited` with the magnitude.
pub fn balance_delta(
    user_id: Uuid,
    transaction_id: Uuid,
    delta: &BigDecimal,
    currency: Currency,
    reason: &str,
) -> Result<DomainEvent, AppError> {
    let kind = if delta < &BigDecimal::zero() {
        EventKind::BalanceDebited
    } else {
        EventKind::BalanceCredited
    };
    DomainEvent::new(
        AggregateType::Balance,
        user_id,
        kind,
        &BalanceDeltaPayload {
            user_id,
            transaction_id,
            amount: delta.abs(),
            currency,
            reason: reason.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transaction::{TransactionKind, TransactionStatus};
    use chrono::Utc;

    fn sample_tx() -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            from_user_id: Some(Uuid::new_v4()),
            to_user_id: Some(Uuid::new_v4()),
            amount: "15.00".parse().unwrap(),
            currency: Currency::Eur,
            kind: TransactionKind::Transfer,
            status: TransactionStatus::Pending,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_transaction_events_target_the_transaction_stream() {
        let tx = sample_tx();
        let started = transaction_started(&tx).unwrap();
        assert_eq!(started.aggregate_type, AggregateType::Transaction);
        assert_eq!(started.aggregate_id, tx.id);
        assert_eq!(started.kind, EventKind::TransactionStarted);
    }

    #[test]
    fn test_failed_event_carries_reason() {
        let tx = sample_tx();
        let failed = transaction_failed(&tx, "insufficient funds").unwrap();
        assert_eq!(
            failed.payload.get("reason").and_then(|r| r.as_str()),
            Some("insufficient funds")
        );
    }

    #[test]
    fn test_balance_delta_sign_picks_event_kind() {
        let user = Uuid::new_v4();
        let tx_id = Uuid::new_v4();
        let credit =
            balance_delta(user, tx_id, &"10.00".parse().unwrap(), Currency::Usd, "credit").unwrap();
        assert_eq!(credit.kind, EventKind::BalanceCredited);

        let debit =
            balance_delta(user, tx_id, &"-10.00".parse().unwrap(), Currency::Usd, "debit").unwrap();
        assert_eq!(debit.kind, EventKind::BalanceDebited);
        assert_eq!(
            debit.payload.get("amount").and_then(|a| a.as_str()),
            Some("10.00")
        );
    }

    #[test]
    fn test_rollback_event_lands_on_original_stream() {
        let original = Uuid::new_v4();
        let rollback = Uuid::new_v4();
        let event = transaction_rolled_back(original, rollback, None).unwrap();
        assert_eq!(event.aggregate_id, original);
        assert_eq!(
            event
                .payload
                .get("rollback_transaction_id")
                .and_then(|v| v.as_str()),
            Some(rollback.to_string().as_str())
        );
    }
}
