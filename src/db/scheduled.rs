//! Scheduled transaction storage. Due rows are claimed with
//! `FOR UPDATE SKIP LOCKED` so concurrent engine instances each grab distinct
//! schedules; the claim is held until the post-execution state is written.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction as SqlxTransaction};
use uuid::Uuid;

use crate::db::models::{ScheduledExecutionRow, ScheduledTransactionRow};
use crate::domain::scheduled::{
    ScheduleFilter, ScheduleTransition, ScheduledExecution, ScheduledTransaction,
};
use crate::error::AppError;

pub async fn insert(pool: &PgPool, st: &ScheduledTransaction) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO scheduled_transactions
            (id, user_id, type, amount, currency, to_user_id, schedule_type,
             execute_at, recurrence_pattern, recurrence_end_date, max_occurrences,
             current_occurrence, status, is_active, created_at, updated_at,
             next_execution_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
    )
    .bind(st.id)
    .bind(st.user_id)
    .bind(st.kind.as_str())
    .bind(&st.amount)
    .bind(st.currency.as_str())
    .bind(st.to_user_id)
    .bind(st.schedule_kind.as_str())
    .bind(st.execute_at)
    .bind(st.recurrence_pattern.map(|p| p.as_str()))
    .bind(st.recurrence_end_date)
    .bind(st.max_occurrences)
    .bind(st.current_occurrence)
    .bind(st.status.as_str())
    .bind(st.is_active)
    .bind(st.created_at)
    .bind(st.updated_at)
    .bind(st.next_execution_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch(pool: &PgPool, id: Uuid) -> Result<Option<ScheduledTransaction>, AppError> {
    let row = sqlx::query_as::<_, ScheduledTransactionRow>(
        "SELECT id, user_id, type, amount, currency, to_user_id, schedule_type,
                execute_at, recurrence_pattern, recurrence_end_date, max_occurrences,
                current_occurrence, status, is_active, created_at, updated_at,
                last_executed_at, next_execution_at
         FROM scheduled_transactions
         WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.map(ScheduledTransactionRow::into_domain).transpose()
}

pub async fn list_for_user(
    pool: &PgPool,
    user_id: Uuid,
    filter: &ScheduleFilter,
) -> Result<Vec<ScheduledTransaction>, AppError> {
    let (limit, offset) = filter.normalized();
    let rows = sqlx::query_as::<_, ScheduledTransactionRow>(
        "SELECT id, user_id, type, amount, currency, to_user_id, schedule_type,
                execute_at, recurrence_pattern, recurrence_end_date, max_occurrences,
                current_occurrence, status, is_active, created_at, updated_at,
                last_executed_at, next_execution_at
         FROM scheduled_transactions
         WHERE user_id = $1
           AND ($2::text IS NULL OR status = $2)
           AND ($3::text IS NULL OR schedule_type = $3)
         ORDER BY created_at DESC, id DESC
         LIMIT $4 OFFSET $5",
    )
    .bind(user_id)
    .bind(filter.status.map(|s| s.as_str()))
    .bind(filter.schedule_kind.map(|k| k.as_str()))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(ScheduledTransactionRow::into_domain)
        .collect()
}

/// Cancels a schedule still in a live status. Returns false when the row was
/// already cancelled or completed (or does not exist).
pub async fn cancel(pool: &PgPool, id: Uuid) -> Result<bool, AppError> {
    let done = sqlx::query(
        "UPDATE scheduled_transactions
         SET status = 'cancelled', is_active = FALSE, next_execution_at = NULL, updated_at = NOW()
         WHERE id = $1 AND status IN ('active', 'paused')",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(done.rows_affected() > 0)
}

/// Claims the oldest due schedule, locking its row for the rest of the
/// caller's transaction. Rows locked by another claimer are skipped, not
/// waited on. Returns the raw row so the caller can still record an
/// execution against a row whose labels fail to parse.
pub async fn claim_next_due(
    tx: &mut SqlxTransaction<'_, Postgres>,
    now: DateTime<Utc>,
) -> Result<Option<ScheduledTransactionRow>, AppError> {
    let row = sqlx::query_as::<_, ScheduledTransactionRow>(
        "SELECT id, user_id, type, amount, currency, to_user_id, schedule_type,
                execute_at, recurrence_pattern, recurrence_end_date, max_occurrences,
                current_occurrence, status, is_active, created_at, updated_at,
                last_executed_at, next_execution_at
         FROM scheduled_transactions
         WHERE is_active AND status = 'active' AND execute_at <= $1
         ORDER BY execute_at ASC
         LIMIT 1
         FOR UPDATE SKIP LOCKED",
    )
    .bind(now)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row)
}

/// Writes the post-execution state onto a claimed row.
pub async fn apply_transition(
    tx: &mut SqlxTransaction<'_, Postgres>,
    id: Uuid,
    transition: &ScheduleTransition,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE scheduled_transactions
         SET status = $2, is_active = $3, current_occurrence = $4, execute_at = $5,
             next_execution_at = $6, last_executed_at = $7, updated_at = NOW()
         WHERE id = $1",
    )
    .bind(id)
    .bind(transition.status.as_str())
    .bind(transition.is_active)
    .bind(transition.current_occurrence)
    .bind(transition.execute_at)
    .bind(transition.next_execution_at)
    .bind(transition.last_executed_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Records one execution attempt, inside the claim transaction so the
/// attempt record and the schedule's new state land together.
pub async fn insert_execution(
    tx: &mut SqlxTransaction<'_, Postgres>,
    execution: &ScheduledExecution,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO scheduled_transaction_executions
            (id, scheduled_transaction_id, executed_at, status, transaction_id,
             error_message, amount, currency)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(execution.id)
    .bind(execution.scheduled_transaction_id)
    .bind(execution.executed_at)
    .bind(execution.status.as_str())
    .bind(execution.transaction_id)
    .bind(&execution.error_message)
    .bind(&execution.amount)
    .bind(execution.currency.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn list_executions(
    pool: &PgPool,
    scheduled_transaction_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<Vec<ScheduledExecution>, AppError> {
    let rows = sqlx::query_as::<_, ScheduledExecutionRow>(
        "SELECT id, scheduled_transaction_id, executed_at, status, transaction_id,
                error_message, amount, currency
         FROM scheduled_transaction_executions
         WHERE scheduled_transaction_id = $1
         ORDER BY executed_at DESC, id DESC
         LIMIT $2 OFFSET $3",
    )
    .bind(scheduled_transaction_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(ScheduledExecutionRow::into_domain)
        .collect()
}
