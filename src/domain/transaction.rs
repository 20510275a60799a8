//! Transaction domain entity: the immutable record of one money movement
//! and the shape rules each movement kind must satisfy.

use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

use super::balance::{validate_amount, Currency};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Credit,
    Debit,
    Transfer,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Credit => "credit",
            TransactionKind::Debit => "debit",
            TransactionKind::Transfer => "transfer",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(TransactionKind::Credit),
            "debit" => Ok(TransactionKind::Debit),
            "transfer" => Ok(TransactionKind::Transfer),
            other => Err(AppError::Validation(format!(
                "unknown transaction type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "success" => Ok(TransactionStatus::Success),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(AppError::Validation(format!(
                "unknown transaction status: {}",
                other
            ))),
        }
    }
}

/// One money movement. Created pending by the processor and finalized by the
/// same call; terminal rows are never mutated again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub from_user_id: Option<Uuid>,
    pub to_user_id: Option<Uuid>,
    pub amount: BigDecimal,
    pub currency: Currency,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn involves(&self, user_id: Uuid) -> bool {
        self.from_user_id == Some(user_id) || self.to_user_id == Some(user_id)
    }

    pub fn with_status(mut self, status: TransactionStatus) -> Self {
        self.status = status;
        self
    }
}

/// A movement about to be recorded. The id is assigned here so callers can
/// reference the row even if the insert itself times out.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub id: Uuid,
    pub from_user_id: Option<Uuid>,
    pub to_user_id: Option<Uuid>,
    pub amount: BigDecimal,
    pub currency: Currency,
    pub kind: TransactionKind,
}

impl NewTransaction {
    pub fn credit(to_user_id: Uuid, amount: BigDecimal, currency: Currency) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_user_id: None,
            to_user_id: Some(to_user_id),
            amount,
            currency,
            kind: TransactionKind::Credit,
        }
    }

    pub fn debit(from_user_id: Uuid, amount: BigDecimal, currency: Currency) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_user_id: Some(from_user_id),
            to_user_id: None,
            amount,
            currency,
            kind: TransactionKind::Debit,
        }
    }

    pub fn transfer(
        from_user_id: Uuid,
        to_user_id: Uuid,
        amount: BigDecimal,
        currency: Currency,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_user_id: Some(from_user_id),
            to_user_id: Some(to_user_id),
            amount,
            currency,
            kind: TransactionKind::Transfer,
        }
    }

    /// Amount rules plus the participant shape for each kind: credit is
    /// to-only, debit is from-only, transfer carries both and from != to.
    pub fn validate(&self) -> Result<(), AppError> {
        validate_amount(&self.amount)?;
        match self.kind {
            TransactionKind::Credit => {
                if self.to_user_id.is_none() || self.from_user_id.is_some() {
                    return Err(AppError::Validation(
                        "credit must have a receiver and no sender".to_string(),
                    ));
                }
            }
            TransactionKind::Debit => {
                if self.from_user_id.is_none() || self.to_user_id.is_some() {
                    return Err(AppError::Validation(
                        "debit must have a sender and no receiver".to_string(),
                    ));
                }
            }
            TransactionKind::Transfer => match (self.from_user_id, self.to_user_id) {
                (Some(from), Some(to)) if from == to => {
                    return Err(AppError::Validation(
                        "transfer sender and receiver must differ".to_string(),
                    ));
                }
                (Some(_), Some(_)) => {}
                _ => {
                    return Err(AppError::Validation(
                        "transfer must have both a sender and a receiver".to_string(),
                    ));
                }
            },
        }
        Ok(())
    }
}

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Filter for transaction list queries. `normalized` clamps paging to sane
/// bounds before the filter reaches SQL.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub kind: Option<TransactionKind>,
    pub status: Option<TransactionStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl TransactionFilter {
    pub fn normalized(&self) -> (i64, i64) {
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }

    /// True when only default paging is in effect, which is the only shape
    /// the list cache stores.
    pub fn is_default_page(&self) -> bool {
        self.kind.is_none()
            && self.status.is_none()
            && self.since.is_none()
            && self.until.is_none()
            && self.limit.unwrap_or(DEFAULT_PAGE_LIMIT) == DEFAULT_PAGE_LIMIT
            && self.offset.unwrap_or(0) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Uuid {
        Uuid::new_v4()
    }

    fn amount() -> BigDecimal {
        "100.00".parse().unwrap()
    }

    #[test]
    fn test_credit_shape_is_valid() {
        let tx = NewTransaction::credit(user(), amount(), Currency::Usd);
        assert!(tx.validate().is_ok());
        assert_eq!(tx.kind, TransactionKind::Credit);
        assert!(tx.from_user_id.is_none());
    }

    #[test]
    fn test_debit_shape_is_valid() {
        let tx = NewTransaction::debit(user(), amount(), Currency::Eur);
        assert!(tx.validate().is_ok());
        assert!(tx.to_user_id.is_none());
    }

    #[test]
    fn test_transfer_to_self_rejected() {
        let u = user();
        let tx = NewTransaction::transfer(u, u, amount(), Currency::Usd);
        let err = tx.validate().unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_transfer_between_distinct_users_is_valid() {
        let tx = NewTransaction::transfer(user(), user(), amount(), Currency::Gbp);
        assert!(tx.validate().is_ok());
    }

    #[test]
    fn test_malformed_credit_rejected() {
        let mut tx = NewTransaction::credit(user(), amount(), Currency::Usd);
        tx.from_user_id = Some(user());
        assert!(tx.validate().is_err());
    }

    #[test]
    fn test_validate_checks_amount_rules() {
        let tx = NewTransaction::credit(user(), "-1.00".parse().unwrap(), Currency::Usd);
        assert!(tx.validate().is_err());
    }

    #[test]
    fn test_involves_matches_either_side() {
        let from = user();
        let to = user();
        let tx = Transaction {
            id: Uuid::new_v4(),
            from_user_id: Some(from),
            to_user_id: Some(to),
            amount: amount(),
            currency: Currency::Usd,
            kind: TransactionKind::Transfer,
            status: TransactionStatus::Success,
            created_at: Utc::now(),
        };
        assert!(tx.involves(from));
        assert!(tx.involves(to));
        assert!(!tx.involves(user()));
    }

    #[test]
    fn test_filter_normalized_clamps_limit() {
        let filter = TransactionFilter {
            limit: Some(10_000),
            offset: Some(-5),
            ..Default::default()
        };
        assert_eq!(filter.normalized(), (MAX_PAGE_LIMIT, 0));
    }

    #[test]
    fn test_filter_defaults() {
        let filter = TransactionFilter::default();
        assert_eq!(filter.normalized(), (DEFAULT_PAGE_LIMIT, 0));
        assert!(filter.is_default_page());
    }

    #[test]
    fn test_filtered_query_is_not_default_page() {
        let filter = TransactionFilter {
            status: Some(TransactionStatus::Failed),
            ..Default::default()
        };
        assert!(!filter.is_default_page());
    }
}
