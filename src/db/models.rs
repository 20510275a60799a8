//! Row-level structs mapped straight from SQL. Enumerated columns stay as
//! TEXT here; `into_domain` converts them into the typed domain model and
//! treats an unparseable stored label as corrupt storage.

use chrono::{DateTime, Utc};
use sqlx::types::BigDecimal;
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::balance::Balance;
use crate::domain::event::Event;
use crate::domain::scheduled::{ScheduledExecution, ScheduledTransaction};
use crate::domain::transaction::Transaction;
use crate::error::AppError;

fn parse_label<T>(raw: &str, row_id: Uuid, field: &str) -> Result<T, AppError>
where
    T: FromStr<Err = AppError>,
{
    raw.parse().map_err(|_| {
        AppError::Internal(format!(
            "corrupt {} label {:?} on row {}",
            field, raw, row_id
        ))
    })
}

#[derive(Debug, Clone, FromRow)]
pub struct BalanceRow {
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub last_updated_at: DateTime<Utc>,
}

impl BalanceRow {
    pub fn into_domain(self) -> Result<Balance, AppError> {
        Ok(Balance {
            user_id: self.user_id,
            amount: self.amount,
            currency: parse_label(&self.currency, self.user_id, "currency")?,
            last_updated_at: self.last_updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TransactionRow {
    pub id: Uuid,
    pub from_user_id: Option<Uuid>,
    pub to_user_id: Option<Uuid>,
    pub amount: BigDecimal,
    pub currency: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl TransactionRow {
    pub fn into_domain(self) -> Result<Transaction, AppError> {
        Ok(Transaction {
            id: self.id,
            from_user_id: self.from_user_id,
            to_user_id: self.to_user_id,
            amount: self.amount,
            currency: parse_label(&self.currency, self.id, "currency")?,
            kind: parse_label(&self.kind, self.id, "type")?,
            status: parse_label(&self.status, self.id, "status")?,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ScheduledTransactionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub to_user_id: Option<Uuid>,
    pub schedule_type: String,
    pub execute_at: DateTime<Utc>,
    pub recurrence_pattern: Option<String>,
    pub recurrence_end_date: Option<DateTime<Utc>>,
    pub max_occurrences: Option<i32>,
    pub current_occurrence: i32,
    pub status: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub next_execution_at: Option<DateTime<Utc>>,
}

impl ScheduledTransactionRow {
    pub fn into_domain(self) -> Result<ScheduledTransaction, AppError> {
        let recurrence_pattern = self
            .recurrence_pattern
            .as_deref()
            .map(|raw| parse_label(raw, self.id, "recurrence_pattern"))
            .transpose()?;
        Ok(ScheduledTransaction {
            id: self.id,
            user_id: self.user_id,
            kind: parse_label(&self.kind, self.id, "type")?,
            amount: self.amount,
            currency: parse_label(&self.currency, self.id, "currency")?,
            to_user_id: self.to_user_id,
            schedule_kind: parse_label(&self.schedule_type, self.id, "schedule_type")?,
            execute_at: self.execute_at,
            recurrence_pattern,
            recurrence_end_date: self.recurrence_end_date,
            max_occurrences: self.max_occurrences,
            current_occurrence: self.current_occurrence,
            status: parse_label(&self.status, self.id, "status")?,
            is_active: self.is_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_executed_at: self.last_executed_at,
            next_execution_at: self.next_execution_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ScheduledExecutionRow {
    pub id: Uuid,
    pub scheduled_transaction_id: Uuid,
    pub executed_at: DateTime<Utc>,
    pub status: String,
    pub transaction_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub amount: BigDecimal,
    pub currency: String,
}

impl ScheduledExecutionRow {
    pub fn into_domain(self) -> Result<ScheduledExecution, AppError> {
        Ok(ScheduledExecution {
            id: self.id,
            scheduled_transaction_id: self.scheduled_transaction_id,
            executed_at: self.executed_at,
            status: parse_label(&self.status, self.id, "status")?,
            transaction_id: self.transaction_id,
            error_message: self.error_message,
            amount: self.amount,
            currency: parse_label(&self.currency, self.id, "currency")?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub version: i32,
}

impl EventRow {
    pub fn into_domain(self) -> Result<Event, AppError> {
        Ok(Event {
            id: self.id,
            aggregate_type: parse_label(&self.aggregate_type, self.id, "aggregate_type")?,
            aggregate_id: self.aggregate_id,
            kind: parse_label(&self.event_type, self.id, "event_type")?,
            payload: self.payload,
            metadata: self.metadata,
            created_at: self.created_at,
            version: self.version,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AuditLogRow {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub action: String,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::balance::Currency;
    use crate::domain::transaction::{TransactionKind, TransactionStatus};

    fn row(kind: &str, status: &str, currency: &str) -> TransactionRow {
        TransactionRow {
            id: Uuid::new_v4(),
            from_user_id: None,
            to_user_id: Some(Uuid::new_v4()),
            amount: "10.00".parse().unwrap(),
            currency: currency.to_string(),
            kind: kind.to_string(),
            status: status.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_transaction_row_converts_labels() {
        let tx = row("credit", "success", "USD").into_domain().unwrap();
        assert_eq!(tx.kind, TransactionKind::Credit);
        assert_eq!(tx.status, TransactionStatus::Success);
        assert_eq!(tx.currency, Currency::Usd);
    }

    #[test]
    fn test_corrupt_label_is_internal_error() {
        let err = row("wire", "success", "USD").into_domain().unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }
}
