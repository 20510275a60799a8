//! Projection table storage. These tables are derived entirely from the
//! event feed and are safe to drop and rebuild; only the projector writes
//! here. The checkpoint table records how far each projector has read.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool, Postgres, Transaction as SqlxTransaction};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct BalanceProjection {
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub last_version: i32,
    pub last_event_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TransactionProjection {
    pub id: Uuid,
    pub from_user_id: Option<Uuid>,
    pub to_user_id: Option<Uuid>,
    pub amount: BigDecimal,
    pub currency: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    /// The compensating transaction, when this one has been rolled back.
    pub rolled_back_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_version: i32,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UserProjection {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub role: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_version: i32,
}

/// Transaction-scoped advisory lock; released automatically at commit or
/// rollback. Returns false when another session already holds the key.
pub async fn try_advisory_lock(
    tx: &mut SqlxTransaction<'_, Postgres>,
    key: i64,
) -> Result<bool, AppError> {
    let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
        .bind(key)
        .fetch_one(&mut **tx)
        .await?;
    Ok(acquired)
}

pub async fn checkpoint(
    tx: &mut SqlxTransaction<'_, Postgres>,
    projector: &str,
) -> Result<Option<DateTime<Utc>>, AppError> {
    let watermark: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT watermark FROM projector_checkpoints WHERE projector = $1")
            .bind(projector)
            .fetch_optional(&mut **tx)
            .await?;
    Ok(watermark)
}

pub async fn advance_checkpoint(
    tx: &mut SqlxTransaction<'_, Postgres>,
    projector: &str,
    watermark: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO projector_checkpoints (projector, watermark, updated_at)
         VALUES ($1, $2, NOW())
         ON CONFLICT (projector)
         DO UPDATE SET watermark = EXCLUDED.watermark, updated_at = NOW()",
    )
    .bind(projector)
    .bind(watermark)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Empties every projection table ahead of a full replay. The checkpoint row
/// survives; the rebuild overwrites it when it finishes.
pub async fn clear_all(tx: &mut SqlxTransaction<'_, Postgres>) -> Result<(), AppError> {
    sqlx::query("DELETE FROM balance_projections")
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM transaction_projections")
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM user_projections")
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn upsert_balance(
    tx: &mut SqlxTransaction<'_, Postgres>,
    p: &BalanceProjection,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO balance_projections
            (user_id, amount, currency, last_version, last_event_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, NOW())
         ON CONFLICT (user_id)
         DO UPDATE SET amount = EXCLUDED.amount, currency = EXCLUDED.currency,
                       last_version = EXCLUDED.last_version,
                       last_event_at = EXCLUDED.last_event_at, updated_at = NOW()",
    )
    .bind(p.user_id)
    .bind(&p.amount)
    .bind(&p.currency)
    .bind(p.last_version)
    .bind(p.last_event_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn upsert_transaction(
    tx: &mut SqlxTransaction<'_, Postgres>,
    p: &TransactionProjection,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO transaction_projections
            (id, from_user_id, to_user_id, amount, currency, type, status,
             rolled_back_by, created_at, last_version, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
         ON CONFLICT (id)
         DO UPDATE SET status = EXCLUDED.status, rolled_back_by = EXCLUDED.rolled_back_by,
                       last_version = EXCLUDED.last_version, updated_at = NOW()",
    )
    .bind(p.id)
    .bind(p.from_user_id)
    .bind(p.to_user_id)
    .bind(&p.amount)
    .bind(&p.currency)
    .bind(&p.kind)
    .bind(&p.status)
    .bind(p.rolled_back_by)
    .bind(p.created_at)
    .bind(p.last_version)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn upsert_user(
    tx: &mut SqlxTransaction<'_, Postgres>,
    p: &UserProjection,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO user_projections
            (id, username, email, role, is_active, created_at, last_version, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
         ON CONFLICT (id)
         DO UPDATE SET username = EXCLUDED.username, email = EXCLUDED.email,
                       role = EXCLUDED.role, is_active = EXCLUDED.is_active,
                       last_version = EXCLUDED.last_version, updated_at = NOW()",
    )
    .bind(p.id)
    .bind(&p.username)
    .bind(&p.email)
    .bind(&p.role)
    .bind(p.is_active)
    .bind(p.created_at)
    .bind(p.last_version)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn fetch_balance(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Option<BalanceProjection>, AppError> {
    let row = sqlx::query_as::<_, BalanceProjection>(
        "SELECT user_id, amount, currency, last_version, last_event_at
         FROM balance_projections
         WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn fetch_transaction(
    pool: &PgPool,
    id: Uuid,
) -> Result<Option<TransactionProjection>, AppError> {
    let row = sqlx::query_as::<_, TransactionProjection>(
        "SELECT id, from_user_id, to_user_id, amount, currency, type, status,
                rolled_back_by, created_at, last_version
         FROM transaction_projections
         WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn fetch_user(pool: &PgPool, id: Uuid) -> Result<Option<UserProjection>, AppError> {
    let row = sqlx::query_as::<_, UserProjection>(
        "SELECT id, username, email, role, is_active, created_at, last_version
         FROM user_projections
         WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}
