//! Audit trail recording. Writes are best-effort: an audit insert failing
//! must never fail the operation it describes, so the sink logs and moves on.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db;

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entity_type: &str, entity_id: Uuid, action: &str, details: Value);
}

#[derive(Clone)]
pub struct AuditRecorder {
    pool: PgPool,
}

impl AuditRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for AuditRecorder {
    async fn record(&self, entity_type: &str, entity_id: Uuid, action: &str, details: Value) {
        if let Err(e) =
            db::audit::insert(&self.pool, entity_type, entity_id, action, Some(details)).await
        {
            tracing::warn!(
                entity_type,
                entity_id = %entity_id,
                action,
                error = %e,
                "failed to write audit log entry"
            );
        }
    }
}
