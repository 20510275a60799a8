//! Audit log storage. Append-only record of state changes, keyed by the
//! entity they touched.

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::AuditLogRow;
use crate::error::AppError;

pub async fn insert(
    pool: &PgPool,
    entity_type: &str,
    entity_id: Uuid,
    action: &str,
    details: Option<Value>,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO audit_logs (id, entity_type, entity_id, action, details)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Uuid::new_v4())
    .bind(entity_type)
    .bind(entity_id)
    .bind(action)
    .bind(details)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_for_entity(
    pool: &PgPool,
    entity_type: &str,
    entity_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<Vec<AuditLogRow>, AppError> {
    let rows = sqlx::query_as::<_, AuditLogRow>(
        "SELECT id, entity_type, entity_id, action, details, created_at
         FROM audit_logs
         WHERE entity_type = $1 AND entity_id = $2
         ORDER BY created_at DESC, id DESC
         LIMIT $3 OFFSET $4",
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
