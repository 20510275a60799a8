//! Balance domain entity and the money rules shared by every operation:
//! the currency allow-list and amount validation.

use std::fmt;
use std::str::FromStr;

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

use super::transaction::TransactionKind;

/// Supported account currencies. Accounts are pinned to one of these at
/// creation; there is no conversion between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
    Jpy,
    Cad,
    Aud,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
            Currency::Jpy => "JPY",
            Currency::Cad => "CAD",
            Currency::Aud => "AUD",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "GBP" => Ok(Currency::Gbp),
            "JPY" => Ok(Currency::Jpy),
            "CAD" => Ok(Currency::Cad),
            "AUD" => Ok(Currency::Aud),
            other => Err(AppError::Validation(format!(
                "unsupported currency: {}",
                other
            ))),
        }
    }
}

/// Current state of one account. `amount >= 0` always; mutated only through
/// delta application inside a row-locked database transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub currency: Currency,
    pub last_updated_at: DateTime<Utc>,
}

/// One step of an account's reconstructed history: the signed delta a
/// successful transaction applied and the running balance after it.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceHistoryEntry {
    pub transaction_id: Uuid,
    pub kind: TransactionKind,
    pub counterparty: Option<Uuid>,
    pub delta: BigDecimal,
    pub running_balance: BigDecimal,
    pub occurred_at: DateTime<Utc>,
}

/// Largest amount a single operation may move.
pub fn max_operation_amount() -> BigDecimal {
    BigDecimal::from(1_000_000)
}

/// An operation amount must be strictly positive, use at most 2 fraction
/// digits, and stay within the per-operation limit.
pub fn validate_amount(amount: &BigDecimal) -> Result<(), AppError> {
    if amount <= &BigDecimal::zero() {
        return Err(AppError::Validation(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    if *amount != amount.with_scale(2) {
        return Err(AppError::Validation(format!(
            "amount must have at most 2 fraction digits, got {}",
            amount
        )));
    }
    if *amount > max_operation_amount() {
        return Err(AppError::Validation(format!(
            "amount exceeds the per-operation limit of {}, got {}",
            max_operation_amount(),
            amount
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> BigDecimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_currency_round_trip() {
        for code in ["USD", "EUR", "GBP", "JPY", "CAD", "AUD"] {
            let currency: Currency = code.parse().unwrap();
            assert_eq!(currency.to_string(), code);
        }
    }

    #[test]
    fn test_currency_parse_is_case_insensitive() {
        let currency: Currency = "usd".parse().unwrap();
        assert_eq!(currency, Currency::Usd);
    }

    #[test]
    fn test_unknown_currency_rejected() {
        let err = "BTC".parse::<Currency>().unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_validate_amount_accepts_two_fraction_digits() {
        assert!(validate_amount(&dec("10.50")).is_ok());
        assert!(validate_amount(&dec("0.01")).is_ok());
        assert!(validate_amount(&dec("1000000.00")).is_ok());
    }

    #[test]
    fn test_validate_amount_accepts_trailing_zero_scale() {
        // 1.5 and 1.50 are the same value; scale alone is not a defect.
        assert!(validate_amount(&dec("1.5")).is_ok());
        assert!(validate_amount(&dec("1.500")).is_ok());
    }

    #[test]
    fn test_validate_amount_rejects_zero_and_negative() {
        assert!(validate_amount(&dec("0")).is_err());
        assert!(validate_amount(&dec("-5.00")).is_err());
    }

    #[test]
    fn test_validate_amount_rejects_sub_cent_precision() {
        let err = validate_amount(&dec("1.005")).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_validate_amount_rejects_over_limit() {
        assert!(validate_amount(&dec("1000000.01")).is_err());
    }
}
