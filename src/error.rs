use bigdecimal::BigDecimal;
use thiserror::Error;

use crate::domain::balance::Currency;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient funds: balance is {balance}, requested {requested}")]
    InsufficientFunds {
        balance: BigDecimal,
        requested: BigDecimal,
    },

    #[error("Currency mismatch: account holds {account}, request uses {requested}")]
    CurrencyMismatch {
        account: Currency,
        requested: Currency,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Storage conflict: {0}")]
    StorageConflict(String),

    #[error("Operation timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Storage error: {0}")]
    Storage(sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Errors the caller may retry with backoff: version races, lock/pool
    /// contention and deadlines. Everything else is a definitive outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::StorageConflict(_) | AppError::Timeout { .. }
        )
    }

    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        AppError::NotFound(format!("{} {}", entity, id))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db)
                if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
            {
                AppError::StorageConflict(format!(
                    "unique violation on {}",
                    db.constraint().unwrap_or("unknown constraint")
                ))
            }
            sqlx::Error::PoolTimedOut => {
                AppError::StorageConflict("connection pool timed out".to_string())
            }
            other => AppError::Storage(other),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("serialization failed: {}", err))
    }
}
