//! Domain events: the append-only facts the event store records and the
//! projector folds back into read models.

use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;

use super::balance::Currency;
use super::transaction::TransactionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateType {
    User,
    Balance,
    Transaction,
}

impl AggregateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateType::User => "user",
            AggregateType::Balance => "balance",
            AggregateType::Transaction => "transaction",
        }
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(AggregateType::User),
            "balance" => Ok(AggregateType::Balance),
            "transaction" => Ok(AggregateType::Transaction),
            other => Err(AppError::Internal(format!(
                "unknown aggregate type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "transaction.started")]
    TransactionStarted,
    #[serde(rename = "transaction.succeeded")]
    TransactionSucceeded,
    #[serde(rename = "transaction.failed")]
    TransactionFailed,
    #[serde(rename = "transaction.rolled_back")]
    TransactionRolledBack,
    #[serde(rename = "balance.initialized")]
    BalanceInitialized,
    #[serde(rename = "balance.credited")]
    BalanceCredited,
    #[serde(rename = "balance.debited")]
    BalanceDebited,
    #[serde(rename = "user.registered")]
    UserRegistered,
    #[serde(rename = "user.updated")]
    UserUpdated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TransactionStarted => "transaction.started",
            EventKind::TransactionSucceeded => "transaction.succeeded",
            EventKind::TransactionFailed => "transaction.failed",
            EventKind::TransactionRolledBack => "transaction.rolled_back",
            EventKind::BalanceInitialized => "balance.initialized",
            EventKind::BalanceCredited => "balance.credited",
            EventKind::BalanceDebited => "balance.debited",
            EventKind::UserRegistered => "user.registered",
            EventKind::UserUpdated => "user.updated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transaction.started" => Ok(EventKind::TransactionStarted),
            "transaction.succeeded" => Ok(EventKind::TransactionSucceeded),
            "transaction.failed" => Ok(EventKind::TransactionFailed),
            "transaction.rolled_back" => Ok(EventKind::TransactionRolledBack),
            "balance.initialized" => Ok(EventKind::BalanceInitialized),
            "balance.credited" => Ok(EventKind::BalanceCredited),
            "balance.debited" => Ok(EventKind::BalanceDebited),
            "user.registered" => Ok(EventKind::UserRegistered),
            "user.updated" => Ok(EventKind::UserUpdated),
            other => Err(AppError::Internal(format!("unknown event type: {}", other))),
        }
    }
}

/// An event ready to append. Version is assigned by the store at insert.
#[derive(Debug, Clone)]
pub struct DomainEvent {
    pub aggregate_type: AggregateType,
    pub aggregate_id: Uuid,
    pub kind: EventKind,
    pub payload: Value,
    pub metadata: Option<Value>,
}

impl DomainEvent {
    pub fn new<P: Serialize>(
        aggregate_type: AggregateType,
        aggregate_id: Uuid,
        kind: EventKind,
        payload: &P,
    ) -> Result<Self, AppError> {
        Ok(Self {
            aggregate_type,
            aggregate_id,
            kind,
            payload: serde_json::to_value(payload)?,
            metadata: None,
        })
    }

    pub fn with_metadata(mut self, metadata: &EventMetadata) -> Result<Self, AppError> {
        self.metadata = Some(serde_json::to_value(metadata)?);
        Ok(self)
    }
}

/// A stored event. Immutable; versions per aggregate are {1..k} with no gaps.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: Uuid,
    pub aggregate_type: AggregateType,
    pub aggregate_id: Uuid,
    pub kind: EventKind,
    pub payload: Value,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub version: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Payload for transaction lifecycle events (started/succeeded/failed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEventPayload {
    pub transaction_id: Uuid,
    pub from_user_id: Option<Uuid>,
    pub to_user_id: Option<Uuid>,
    pub amount: BigDecimal,
    pub currency: Currency,
    pub kind: TransactionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload for `transaction.rolled_back`, appended to the original
/// transaction's stream and pointing at the compensating row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackEventPayload {
    pub original_transaction_id: Uuid,
    pub rollback_transaction_id: Uuid,
    pub requested_by: Option<Uuid>,
}

/// Payload for balance delta events (`balance.credited` / `balance.debited`).
/// `amount` is the unsigned magnitude; the kind carries the direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceDeltaPayload {
    pub user_id: Uuid,
    pub transaction_id: Uuid,
    pub amount: BigDecimal,
    pub currency: Currency,
    pub reason: String,
}

/// Payload for `balance.initialized`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInitializedPayload {
    pub user_id: Uuid,
    pub currency: Currency,
    pub initial_amount: BigDecimal,
}

/// Payload for `user.registered`, produced by the account layer above this
/// crate and consumed here by the projector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRegisteredPayload {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub role: String,
}

/// Payload for `user.updated`; only the changed fields are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserUpdatedPayload {
    pub user_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_labels_round_trip() {
        for kind in [
            EventKind::TransactionStarted,
            EventKind::TransactionSucceeded,
            EventKind::TransactionFailed,
            EventKind::TransactionRolledBack,
            EventKind::BalanceInitialized,
            EventKind::BalanceCredited,
            EventKind::BalanceDebited,
            EventKind::UserRegistered,
            EventKind::UserUpdated,
        ] {
            let parsed: EventKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_domain_event_serializes_payload() {
        let payload = BalanceDeltaPayload {
            user_id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4(),
            amount: "42.00".parse().unwrap(),
            currency: Currency::Usd,
            reason: "credit".to_string(),
        };
        let event = DomainEvent::new(
            AggregateType::Balance,
            payload.user_id,
            EventKind::BalanceCredited,
            &payload,
        )
        .unwrap();

        assert_eq!(event.aggregate_type, AggregateType::Balance);
        assert_eq!(event.payload["reason"], "credit");
        assert_eq!(event.payload["currency"], "USD");
        assert!(event.metadata.is_none());
    }

    #[test]
    fn test_metadata_omits_absent_fields() {
        let metadata = EventMetadata {
            correlation_id: None,
            source: Some("scheduler".to_string()),
        };
        let value = serde_json::to_value(&metadata).unwrap();
        assert!(value.get("correlation_id").is_none());
        assert_eq!(value["source"], "scheduler");
    }
}
