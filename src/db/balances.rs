//! Balance ledger storage. Delta application runs inside the caller's
//! database transaction with the account row locked, so the non-negativity
//! check and the write form one critical section.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction as SqlxTransaction};
use uuid::Uuid;

use crate::db::models::{BalanceRow, TransactionRow};
use crate::domain::balance::{Balance, BalanceHistoryEntry, Currency};
use crate::domain::transaction::{Transaction, TransactionKind};
use crate::error::AppError;

pub async fn fetch(pool: &PgPool, user_id: Uuid) -> Result<Option<Balance>, AppError> {
    let row = sqlx::query_as::<_, BalanceRow>(
        "SELECT user_id, amount, currency, last_updated_at FROM balances WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    row.map(BalanceRow::into_domain).transpose()
}

async fn lock_row(
    tx: &mut SqlxTransaction<'_, Postgres>,
    user_id: Uuid,
) -> Result<Option<BalanceRow>, AppError> {
    let row = sqlx::query_as::<_, BalanceRow>(
        "SELECT user_id, amount, currency, last_updated_at
         FROM balances
         WHERE user_id = $1
         FOR UPDATE",
    )
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row)
}

/// Result of applying one delta: the amount after the write and whether the
/// account row was created by this application.
#[derive(Debug, Clone)]
pub struct AppliedDelta {
    pub new_amount: BigDecimal,
    pub created: bool,
}

/// Applies a signed delta to one account under a row lock. Creates the
/// account with the request's currency on first touch, rejects a currency
/// mismatch, and rejects any delta that would take the amount negative.
pub async fn apply_delta(
    tx: &mut SqlxTransaction<'_, Postgres>,
    user_id: Uuid,
    delta: &BigDecimal,
    currency: Currency,
) -> Result<AppliedDelta, AppError> {
    let mut created = false;
    let row = match lock_row(tx, user_id).await? {
        Some(row) => row,
        None => {
            // First touch creates the row; ON CONFLICT absorbs a concurrent
            // creator and the relock then waits on whoever won.
            let inserted = sqlx::query(
                "INSERT INTO balances (user_id, amount, currency)
                 VALUES ($1, 0, $2)
                 ON CONFLICT (user_id) DO NOTHING",
            )
            .bind(user_id)
            .bind(currency.as_str())
            .execute(&mut **tx)
            .await?;
            created = inserted.rows_affected() > 0;
            lock_row(tx, user_id).await?.ok_or_else(|| {
                AppError::Internal(format!("balance row for {} missing after insert", user_id))
            })?
        }
    };
    let balance = row.into_domain()?;

    if balance.currency != currency {
        return Err(AppError::CurrencyMismatch {
            account: balance.currency,
            requested: currency,
        });
    }

    let new_amount = &balance.amount + delta;
    if new_amount < BigDecimal::zero() {
        return Err(AppError::InsufficientFunds {
            balance: balance.amount,
            requested: delta.abs(),
        });
    }

    sqlx::query("UPDATE balances SET amount = $2, last_updated_at = NOW() WHERE user_id = $1")
        .bind(user_id)
        .bind(&new_amount)
        .execute(&mut **tx)
        .await?;

    Ok(AppliedDelta {
        new_amount,
        created,
    })
}

/// The two legs of a transfer in canonical lock order: ascending account id,
/// independent of direction, so opposing transfers between the same pair
/// cannot deadlock on each other.
pub fn transfer_legs(
    from_user_id: Uuid,
    to_user_id: Uuid,
    amount: &BigDecimal,
) -> [(Uuid, BigDecimal); 2] {
    let debit = (from_user_id, -amount);
    let credit = (to_user_id, amount.clone());
    if from_user_id <= to_user_id {
        [debit, credit]
    } else {
        [credit, debit]
    }
}

/// The signed effect of a successful transaction on one participant.
pub fn signed_delta(tx: &Transaction, user_id: Uuid) -> BigDecimal {
    match tx.kind {
        TransactionKind::Credit if tx.to_user_id == Some(user_id) => tx.amount.clone(),
        TransactionKind::Debit if tx.from_user_id == Some(user_id) => -&tx.amount,
        TransactionKind::Transfer if tx.from_user_id == Some(user_id) => -&tx.amount,
        TransactionKind::Transfer if tx.to_user_id == Some(user_id) => tx.amount.clone(),
        _ => BigDecimal::zero(),
    }
}

fn counterparty(tx: &Transaction, user_id: Uuid) -> Option<Uuid> {
    if tx.from_user_id == Some(user_id) {
        tx.to_user_id
    } else {
        tx.from_user_id
    }
}

/// Reconstructs the account's history by replaying its successful
/// transactions chronologically. Returns the most recent `limit` entries in
/// chronological order, each with the running balance after it.
pub async fn history(
    pool: &PgPool,
    user_id: Uuid,
    limit: i64,
) -> Result<Vec<BalanceHistoryEntry>, AppError> {
    let rows = sqlx::query_as::<_, TransactionRow>(
        "SELECT id, from_user_id, to_user_id, amount, currency, type, status, created_at
         FROM transactions
         WHERE status = 'success' AND (from_user_id = $1 OR to_user_id = $1)
         ORDER BY created_at ASC, id ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let mut running = BigDecimal::zero();
    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let tx = row.into_domain()?;
        let delta = signed_delta(&tx, user_id);
        running += &delta;
        entries.push(BalanceHistoryEntry {
            transaction_id: tx.id,
            kind: tx.kind,
            counterparty: counterparty(&tx, user_id),
            delta,
            running_balance: running.clone(),
            occurred_at: tx.created_at,
        });
    }

    let keep = limit.max(0) as usize;
    if entries.len() > keep {
        entries.drain(..entries.len() - keep);
    }
    Ok(entries)
}

/// The account's amount as of `at`, from the same replay the history uses.
/// Agrees with the live balance when `at` is now, since balances only move
/// through successful transactions.
pub async fn amount_at(
    pool: &PgPool,
    user_id: Uuid,
    at: DateTime<Utc>,
) -> Result<BigDecimal, AppError> {
    let sum: Option<BigDecimal> = sqlx::query_scalar(
        "SELECT SUM(CASE
                WHEN type = 'credit' AND to_user_id = $1 THEN amount
                WHEN type = 'debit' AND from_user_id = $1 THEN -amount
                WHEN type = 'transfer' AND to_user_id = $1 THEN amount
                WHEN type = 'transfer' AND from_user_id = $1 THEN -amount
                ELSE 0
            END)
         FROM transactions
         WHERE status = 'success'
           AND (from_user_id = $1 OR to_user_id = $1)
           AND created_at <= $2",
    )
    .bind(user_id)
    .bind(at)
    .fetch_one(pool)
    .await?;
    Ok(sum.unwrap_or_else(BigDecimal::zero))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transaction::TransactionStatus;
    use chrono::Utc;

    fn dec(s: &str) -> BigDecimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_transfer_legs_order_is_direction_independent() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let forward = transfer_legs(a, b, &dec("50.00"));
        let reverse = transfer_legs(b, a, &dec("50.00"));
        // Both directions lock the lower id first.
        assert_eq!(forward[0].0, a);
        assert_eq!(reverse[0].0, a);
        // The legs still carry the right signs.
        assert_eq!(forward[0].1, dec("-50.00"));
        assert_eq!(forward[1].1, dec("50.00"));
        assert_eq!(reverse[0].1, dec("50.00"));
        assert_eq!(reverse[1].1, dec("-50.00"));
    }

    #[test]
    fn test_transfer_legs_net_to_zero() {
        let legs = transfer_legs(Uuid::new_v4(), Uuid::new_v4(), &dec("12.34"));
        assert_eq!(&legs[0].1 + &legs[1].1, BigDecimal::zero());
    }

    fn tx(
        kind: TransactionKind,
        from: Option<Uuid>,
        to: Option<Uuid>,
        amount: &str,
    ) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            from_user_id: from,
            to_user_id: to,
            amount: dec(amount),
            currency: Currency::Usd,
            kind,
            status: TransactionStatus::Success,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_signed_delta_per_role() {
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();

        let credit = tx(TransactionKind::Credit, None, Some(user), "100.00");
        assert_eq!(signed_delta(&credit, user), dec("100.00"));

        let debit = tx(TransactionKind::Debit, Some(user), None, "40.00");
        assert_eq!(signed_delta(&debit, user), dec("-40.00"));

        let outgoing = tx(TransactionKind::Transfer, Some(user), Some(other), "25.00");
        assert_eq!(signed_delta(&outgoing, user), dec("-25.00"));
        assert_eq!(signed_delta(&outgoing, other), dec("25.00"));
    }

    #[test]
    fn test_signed_delta_zero_for_uninvolved_user() {
        let movement = tx(
            TransactionKind::Transfer,
            Some(Uuid::new_v4()),
            Some(Uuid::new_v4()),
            "25.00",
        );
        assert_eq!(signed_delta(&movement, Uuid::new_v4()), BigDecimal::zero());
    }
}
