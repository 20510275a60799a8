//! Transaction row storage. Status moves are guarded updates: a row leaves
//! `pending` exactly once, so a finalizer and a timeout handler racing on the
//! same transaction cannot both win.

use sqlx::{PgPool, Postgres, Transaction as SqlxTransaction};
use uuid::Uuid;

use crate::db::models::TransactionRow;
use crate::domain::transaction::{NewTransaction, Transaction, TransactionFilter};
use crate::error::AppError;

/// Inserts the pending row. This happens outside the settlement transaction
/// so the attempt stays visible even when the outcome is `failed`.
pub async fn insert_pending(pool: &PgPool, new: &NewTransaction) -> Result<Transaction, AppError> {
    let row = sqlx::query_as::<_, TransactionRow>(
        "INSERT INTO transactions (id, from_user_id, to_user_id, amount, currency, type, status)
         VALUES ($1, $2, $3, $4, $5, $6, 'pending')
         RETURNING id, from_user_id, to_user_id, amount, currency, type, status, created_at",
    )
    .bind(new.id)
    .bind(new.from_user_id)
    .bind(new.to_user_id)
    .bind(&new.amount)
    .bind(new.currency.as_str())
    .bind(new.kind.as_str())
    .fetch_one(pool)
    .await?;
    row.into_domain()
}

/// Flips a pending transaction to `success` inside the settlement
/// transaction. Errors with `StateConflict` if the row already left pending.
pub async fn mark_succeeded(
    tx: &mut SqlxTransaction<'_, Postgres>,
    id: Uuid,
) -> Result<(), AppError> {
    let done =
        sqlx::query("UPDATE transactions SET status = 'success' WHERE id = $1 AND status = 'pending'")
            .bind(id)
            .execute(&mut **tx)
            .await?;
    if done.rows_affected() == 0 {
        return Err(AppError::StateConflict(format!(
            "transaction {} is no longer pending",
            id
        )));
    }
    Ok(())
}

/// Flips a pending transaction to `failed`. Returns whether this call was the
/// one that moved it; a false return means someone else settled it first.
pub async fn mark_failed(pool: &PgPool, id: Uuid) -> Result<bool, AppError> {
    let done =
        sqlx::query("UPDATE transactions SET status = 'failed' WHERE id = $1 AND status = 'pending'")
            .bind(id)
            .execute(pool)
            .await?;
    Ok(done.rows_affected() > 0)
}

pub async fn fetch(pool: &PgPool, id: Uuid) -> Result<Option<Transaction>, AppError> {
    let row = sqlx::query_as::<_, TransactionRow>(
        "SELECT id, from_user_id, to_user_id, amount, currency, type, status, created_at
         FROM transactions
         WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.map(TransactionRow::into_domain).transpose()
}

/// Transactions where the user is sender or receiver, newest first.
pub async fn list_for_user(
    pool: &PgPool,
    user_id: Uuid,
    filter: &TransactionFilter,
) -> Result<Vec<Transaction>, AppError> {
    let (limit, offset) = filter.normalized();
    let rows = sqlx::query_as::<_, TransactionRow>(
        "SELECT id, from_user_id, to_user_id, amount, currency, type, status, created_at
         FROM transactions
         WHERE (from_user_id = $1 OR to_user_id = $1)
           AND ($2::text IS NULL OR type = $2)
           AND ($3::text IS NULL OR status = $3)
           AND ($4::timestamptz IS NULL OR created_at >= $4)
           AND ($5::timestamptz IS NULL OR created_at <= $5)
         ORDER BY created_at DESC, id DESC
         LIMIT $6 OFFSET $7",
    )
    .bind(user_id)
    .bind(filter.kind.map(|k| k.as_str()))
    .bind(filter.status.map(|s| s.as_str()))
    .bind(filter.since)
    .bind(filter.until)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(TransactionRow::into_domain).collect()
}

/// All transactions, newest first. Admin surface.
pub async fn list_all(
    pool: &PgPool,
    filter: &TransactionFilter,
) -> Result<Vec<Transaction>, AppError> {
    let (limit, offset) = filter.normalized();
    let rows = sqlx::query_as::<_, TransactionRow>(
        "SELECT id, from_user_id, to_user_id, amount, currency, type, status, created_at
         FROM transactions
         WHERE ($1::text IS NULL OR type = $1)
           AND ($2::text IS NULL OR status = $2)
           AND ($3::timestamptz IS NULL OR created_at >= $3)
           AND ($4::timestamptz IS NULL OR created_at <= $4)
         ORDER BY created_at DESC, id DESC
         LIMIT $5 OFFSET $6",
    )
    .bind(filter.kind.map(|k| k.as_str()))
    .bind(filter.status.map(|s| s.as_str()))
    .bind(filter.since)
    .bind(filter.until)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(TransactionRow::into_domain).collect()
}
