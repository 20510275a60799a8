//! Append-only event store. Versions per aggregate are dense, starting at 1:
//! the insert computes `MAX(version) + 1` in a subselect and the unique
//! constraint on (aggregate_type, aggregate_id, version) turns a concurrent
//! append into a unique violation, surfaced as a retryable `StorageConflict`.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction as SqlxTransaction};
use uuid::Uuid;

use crate::db::models::EventRow;
use crate::domain::event::{AggregateType, DomainEvent, Event};
use crate::error::AppError;

/// Appends one event, assigning the next version for its aggregate.
/// Returns the assigned version.
pub async fn append(tx: &mut SqlxTransaction<'_, Postgres>, event: &DomainEvent) -> Result<i32, AppError> {
    let version: i32 = sqlx::query_scalar(
        "INSERT INTO events (id, aggregate_type, aggregate_id, event_type, payload, metadata, version)
         VALUES ($1, $2, $3, $4, $5, $6,
                 (SELECT COALESCE(MAX(version), 0) + 1
                  FROM events
                  WHERE aggregate_type = $2 AND aggregate_id = $3))
         RETURNING version",
    )
    .bind(Uuid::new_v4())
    .bind(event.aggregate_type.as_str())
    .bind(event.aggregate_id)
    .bind(event.kind.as_str())
    .bind(&event.payload)
    .bind(&event.metadata)
    .fetch_one(&mut **tx)
    .await?;
    Ok(version)
}

/// Appends a batch atomically: all events land or none do. Events for the
/// same aggregate take consecutive versions in slice order.
pub async fn append_batch(pool: &PgPool, events: &[DomainEvent]) -> Result<(), AppError> {
    if events.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for event in events {
        append(&mut tx, event).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Full stream of one aggregate in version order. The foundation for replay:
/// versions come back as 1..=k with no gaps.
pub async fn by_aggregate(
    pool: &PgPool,
    aggregate_type: AggregateType,
    aggregate_id: Uuid,
) -> Result<Vec<Event>, AppError> {
    let rows = sqlx::query_as::<_, EventRow>(
        "SELECT id, aggregate_type, aggregate_id, event_type, payload, metadata, created_at, version
         FROM events
         WHERE aggregate_type = $1 AND aggregate_id = $2
         ORDER BY version ASC",
    )
    .bind(aggregate_type.as_str())
    .bind(aggregate_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(EventRow::into_domain).collect()
}

/// Events of one type across aggregates, oldest first.
pub async fn by_type(
    pool: &PgPool,
    event_type: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<Event>, AppError> {
    let rows = sqlx::query_as::<_, EventRow>(
        "SELECT id, aggregate_type, aggregate_id, event_type, payload, metadata, created_at, version
         FROM events
         WHERE event_type = $1
         ORDER BY created_at ASC, id ASC
         LIMIT $2 OFFSET $3",
    )
    .bind(event_type)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(EventRow::into_domain).collect()
}

/// Events strictly after the (created_at, id) cursor, in that order. This is
/// the projector's feed: the id tiebreak makes paging deterministic when
/// several events share a timestamp, and passing the nil uuid starts the page
/// at `after` inclusively.
pub async fn after_cursor(
    pool: &PgPool,
    after: DateTime<Utc>,
    after_id: Uuid,
    limit: i64,
) -> Result<Vec<Event>, AppError> {
    let rows = sqlx::query_as::<_, EventRow>(
        "SELECT id, aggregate_type, aggregate_id, event_type, payload, metadata, created_at, version
         FROM events
         WHERE (created_at, id) > ($1, $2)
         ORDER BY created_at ASC, id ASC
         LIMIT $3",
    )
    .bind(after)
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(EventRow::into_domain).collect()
}

/// Current (highest) version of an aggregate, 0 when it has no events.
pub async fn current_version(
    pool: &PgPool,
    aggregate_type: AggregateType,
    aggregate_id: Uuid,
) -> Result<i32, AppError> {
    let version: Option<i32> = sqlx::query_scalar(
        "SELECT MAX(version) FROM events WHERE aggregate_type = $1 AND aggregate_id = $2",
    )
    .bind(aggregate_type.as_str())
    .bind(aggregate_id)
    .fetch_one(pool)
    .await?;
    Ok(version.unwrap_or(0))
}

/// Distinct aggregates of one type that have any events. Used by full
/// rebuilds to enumerate what to replay.
pub async fn aggregate_ids(
    pool: &PgPool,
    aggregate_type: AggregateType,
) -> Result<Vec<Uuid>, AppError> {
    let ids: Vec<Uuid> = sqlx::query_scalar(
        "SELECT DISTINCT aggregate_id FROM events WHERE aggregate_type = $1",
    )
    .bind(aggregate_type.as_str())
    .fetch_all(pool)
    .await?;
    Ok(ids)
}
