//! Event replay into read models. The projector owns the `*_projections`
//! tables and the checkpoint row; the authoritative ledger tables are never
//! written here. A catch-up cycle re-reads a small overlap behind its
//! watermark and recomputes every touched aggregate from its full history,
//! so replaying an event that is already reflected is always a no-op.

use std::collections::BTreeSet;

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction as SqlxTransaction};
use uuid::Uuid;

use crate::db;
use crate::db::projections::{BalanceProjection, TransactionProjection, UserProjection};
use crate::domain::event::{
    AggregateType, BalanceDeltaPayload, BalanceInitializedPayload, Event, EventKind,
    RollbackEventPayload, TransactionEventPayload, UserRegisteredPayload, UserUpdatedPayload,
};
use crate::domain::transaction::TransactionStatus;
use crate::error::AppError;

const PROJECTOR_NAME: &str = "read_models";
// "proj" in ASCII; shared by every instance that projects these tables.
const ADVISORY_LOCK_KEY: i64 = 0x70726f6a;
const PAGE_SIZE: i64 = 500;

/// What one projector cycle did.
#[derive(Debug, Clone, Serialize)]
pub struct CatchUpReport {
    /// False when another instance held the lease and this cycle did nothing.
    pub acquired: bool,
    pub events_seen: usize,
    pub aggregates_refreshed: usize,
    pub fold_errors: usize,
    pub watermark: Option<DateTime<Utc>>,
}

impl CatchUpReport {
    fn not_acquired() -> Self {
        Self {
            acquired: false,
            events_seen: 0,
            aggregates_refreshed: 0,
            fold_errors: 0,
            watermark: None,
        }
    }
}

enum RefreshOutcome {
    Updated,
    Empty,
    Undecodable,
}

#[derive(Clone)]
pub struct ProjectorService {
    pool: PgPool,
    overlap: Duration,
}

impl ProjectorService {
    pub fn new(pool: PgPool, overlap_secs: u64) -> Self {
        Self {
            pool,
            overlap: Duration::seconds(overlap_secs as i64),
        }
    }

    /// One incremental cycle: find aggregates with events since the
    /// overlap-padded watermark, recompute each from full history, advance
    /// the watermark. Serialized across instances by an advisory lock; a
    /// second instance simply reports `acquired: false`.
    pub async fn catch_up(&self) -> Result<CatchUpReport, AppError> {
        let started_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        if !db::projections::try_advisory_lock(&mut tx, ADVISORY_LOCK_KEY).await? {
            tracing::debug!("projection lease held elsewhere, skipping cycle");
            return Ok(CatchUpReport::not_acquired());
        }

        let checkpoint = db::projections::checkpoint(&mut tx, PROJECTOR_NAME).await?;
        let from = match checkpoint {
            Some(watermark) => watermark - self.overlap,
            None => DateTime::<Utc>::UNIX_EPOCH,
        };

        let (touched, events_seen) = self.scan_touched(from).await?;

        let mut refreshed = 0usize;
        let mut fold_errors = 0usize;
        for (aggregate_type, aggregate_id) in touched {
            match self
                .refresh_aggregate(&mut tx, aggregate_type, aggregate_id)
                .await?
            {
                RefreshOutcome::Updated => refreshed += 1,
                RefreshOutcome::Empty => {}
                RefreshOutcome::Undecodable => fold_errors += 1,
            }
        }

        db::projections::advance_checkpoint(&mut tx, PROJECTOR_NAME, started_at).await?;
        tx.commit().await?;

        if events_seen > 0 {
            tracing::info!(
                events = events_seen,
                aggregates = refreshed,
                fold_errors,
                "projection catch-up complete"
            );
        }
        Ok(CatchUpReport {
            acquired: true,
            events_seen,
            aggregates_refreshed: refreshed,
            fold_errors,
            watermark: Some(started_at),
        })
    }

    /// Drops every projection row and replays all history. Same lease as
    /// catch-up, so an incremental cycle cannot interleave with a rebuild.
    pub async fn rebuild_all(&self) -> Result<CatchUpReport, AppError> {
        let started_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        if !db::projections::try_advisory_lock(&mut tx, ADVISORY_LOCK_KEY).await? {
            tracing::debug!("projection lease held elsewhere, skipping rebuild");
            return Ok(CatchUpReport::not_acquired());
        }

        db::projections::clear_all(&mut tx).await?;

        let mut refreshed = 0usize;
        let mut fold_errors = 0usize;
        for aggregate_type in [
            AggregateType::User,
            AggregateType::Balance,
            AggregateType::Transaction,
        ] {
            for aggregate_id in db::events::aggregate_ids(&self.pool, aggregate_type).await? {
                match self
                    .refresh_aggregate(&mut tx, aggregate_type, aggregate_id)
                    .await?
                {
                    RefreshOutcome::Updated => refreshed += 1,
                    RefreshOutcome::Empty => {}
                    RefreshOutcome::Undecodable => fold_errors += 1,
                }
            }
        }

        db::projections::advance_checkpoint(&mut tx, PROJECTOR_NAME, started_at).await?;
        tx.commit().await?;

        tracing::info!(aggregates = refreshed, fold_errors, "projection rebuild complete");
        Ok(CatchUpReport {
            acquired: true,
            events_seen: 0,
            aggregates_refreshed: refreshed,
            fold_errors,
            watermark: Some(started_at),
        })
    }

    /// Pages through the feed after `from`, collecting which aggregates have
    /// new events. Ordering is (created_at, id), so pages are stable even
    /// when many events share a timestamp.
    async fn scan_touched(
        &self,
        from: DateTime<Utc>,
    ) -> Result<(BTreeSet<(AggregateType, Uuid)>, usize), AppError> {
        let mut touched = BTreeSet::new();
        let mut events_seen = 0usize;
        let mut cursor = (from, Uuid::nil());
        loop {
            let page = db::events::after_cursor(&self.pool, cursor.0, cursor.1, PAGE_SIZE).await?;
            events_seen += page.len();
            for event in &page {
                touched.insert((event.aggregate_type, event.aggregate_id));
            }
            match page.last() {
                Some(last) if page.len() as i64 == PAGE_SIZE => {
                    cursor = (last.created_at, last.id);
                }
                _ => break,
            }
        }
        Ok((touched, events_seen))
    }

    /// Recomputes one aggregate's projection from its full event history.
    /// A history that does not fold is logged and left stale rather than
    /// poisoning the whole cycle.
    async fn refresh_aggregate(
        &self,
        tx: &mut SqlxTransaction<'_, Postgres>,
        aggregate_type: AggregateType,
        aggregate_id: Uuid,
    ) -> Result<RefreshOutcome, AppError> {
        let events = db::events::by_aggregate(&self.pool, aggregate_type, aggregate_id).await?;
        match aggregate_type {
            AggregateType::Balance => match fold_balance(&events) {
                Ok(Some(projection)) => {
                    db::projections::upsert_balance(tx, &projection).await?;
                    Ok(RefreshOutcome::Updated)
                }
                Ok(None) => Ok(RefreshOutcome::Empty),
                Err(e) => {
                    tracing::error!(aggregate_id = %aggregate_id, error = %e, "balance history does not fold");
                    Ok(RefreshOutcome::Undecodable)
                }
            },
            AggregateType::Transaction => match fold_transaction(&events) {
                Ok(Some(projection)) => {
                    db::projections::upsert_transaction(tx, &projection).await?;
                    Ok(RefreshOutcome::Updated)
                }
                Ok(None) => Ok(RefreshOutcome::Empty),
                Err(e) => {
                    tracing::error!(aggregate_id = %aggregate_id, error = %e, "transaction history does not fold");
                    Ok(RefreshOutcome::Undecodable)
                }
            },
            AggregateType::User => match fold_user(&events) {
                Ok(Some(projection)) => {
                    db::projections::upsert_user(tx, &projection).await?;
                    Ok(RefreshOutcome::Updated)
                }
                Ok(None) => Ok(RefreshOutcome::Empty),
                Err(e) => {
                    tracing::error!(aggregate_id = %aggregate_id, error = %e, "user history does not fold");
                    Ok(RefreshOutcome::Undecodable)
                }
            },
        }
    }

    pub async fn balance_projection(
        &self,
        user_id: Uuid,
    ) -> Result<Option<BalanceProjection>, AppError> {
        db::projections::fetch_balance(&self.pool, user_id).await
    }

    pub async fn transaction_projection(
        &self,
        id: Uuid,
    ) -> Result<Option<TransactionProjection>, AppError> {
        db::projections::fetch_transaction(&self.pool, id).await
    }

    pub async fn user_projection(&self, id: Uuid) -> Result<Option<UserProjection>, AppError> {
        db::projections::fetch_user(&self.pool, id).await
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(event: &Event) -> Result<T, AppError> {
    serde_json::from_value(event.payload.clone()).map_err(|e| {
        AppError::Internal(format!(
            "undecodable {} payload at version {}: {}",
            event.kind.as_str(),
            event.version,
            e
        ))
    })
}

/// Folds a balance stream. Events at or below the accumulated version are
/// skipped, so a duplicated event cannot double-apply a delta. Versions are
/// assigned at publish time and can trail the ledger commit order, so the
/// fold tolerates either ordering: a delta arriving without a prior
/// initialization starts the account at zero, and an initialization arriving
/// after deltas applies its starting amount on top of them instead of
/// resetting the accumulator.
fn fold_balance(events: &[Event]) -> Result<Option<BalanceProjection>, AppError> {
    let mut acc: Option<BalanceProjection> = None;
    for event in events {
        if acc
            .as_ref()
            .is_some_and(|p| event.version <= p.last_version)
        {
            continue;
        }
        match event.kind {
            EventKind::BalanceInitialized => {
                let payload: BalanceInitializedPayload = parse_payload(event)?;
                match acc.as_mut() {
                    Some(p) => {
                        p.amount += &payload.initial_amount;
                        p.currency = payload.currency.as_str().to_string();
                        p.last_version = event.version;
                        p.last_event_at = event.created_at;
                    }
                    None => {
                        acc = Some(BalanceProjection {
                            user_id: event.aggregate_id,
                            amount: payload.initial_amount,
                            currency: payload.currency.as_str().to_string(),
                            last_version: event.version,
                            last_event_at: event.created_at,
                        });
                    }
                }
            }
            EventKind::BalanceCredited | EventKind::BalanceDebited => {
                let payload: BalanceDeltaPayload = parse_payload(event)?;
                let mut p = acc.take().unwrap_or_else(|| BalanceProjection {
                    user_id: event.aggregate_id,
                    amount: BigDecimal::zero(),
                    currency: payload.currency.as_str().to_string(),
                    last_version: 0,
                    last_event_at: event.created_at,
                });
                if event.kind == EventKind::BalanceCredited {
                    p.amount += &payload.amount;
                } else {
                    p.amount -= &payload.amount;
                }
                p.last_version = event.version;
                p.last_event_at = event.created_at;
                acc = Some(p);
            }
            other => {
                return Err(AppError::Internal(format!(
                    "unexpected {} event on a balance stream",
                    other.as_str()
                )));
            }
        }
    }
    Ok(acc)
}

/// Folds a transaction stream: started establishes the row, terminal events
/// set the status, a rollback marker links to the compensating transaction.
fn fold_transaction(events: &[Event]) -> Result<Option<TransactionProjection>, AppError> {
    let mut acc: Option<TransactionProjection> = None;
    for event in events {
        if acc
            .as_ref()
            .is_some_and(|p| event.version <= p.last_version)
        {
            continue;
        }
        match event.kind {
            EventKind::TransactionStarted => {
                let payload: TransactionEventPayload = parse_payload(event)?;
                acc = Some(projection_from_payload(
                    event,
                    payload,
                    TransactionStatus::Pending,
                ));
            }
            EventKind::TransactionSucceeded | EventKind::TransactionFailed => {
                let status = if event.kind == EventKind::TransactionSucceeded {
                    TransactionStatus::Success
                } else {
                    TransactionStatus::Failed
                };
                match acc.as_mut() {
                    Some(p) => {
                        p.status = status.as_str().to_string();
                        p.last_version = event.version;
                    }
                    None => {
                        // Terminal event without the started one; the payload
                        // still describes the row completely.
                        let payload: TransactionEventPayload = parse_payload(event)?;
                        acc = Some(projection_from_payload(event, payload, status));
                    }
                }
            }
            EventKind::TransactionRolledBack => {
                let payload: RollbackEventPayload = parse_payload(event)?;
                let Some(p) = acc.as_mut() else {
                    return Err(AppError::Internal(
                        "rollback marker without transaction history".to_string(),
                    ));
                };
                p.rolled_back_by = Some(payload.rollback_transaction_id);
                p.last_version = event.version;
            }
            other => {
                return Err(AppError::Internal(format!(
                    "unexpected {} event on a transaction stream",
                    other.as_str()
                )));
            }
        }
    }
    Ok(acc)
}

fn projection_from_payload(
    event: &Event,
    payload: TransactionEventPayload,
    status: TransactionStatus,
) -> TransactionProjection {
    TransactionProjection {
        id: event.aggregate_id,
        from_user_id: payload.from_user_id,
        to_user_id: payload.to_user_id,
        amount: payload.amount,
        currency: payload.currency.as_str().to_string(),
        kind: payload.kind.as_str().to_string(),
        status: status.as_str().to_string(),
        rolled_back_by: None,
        created_at: event.created_at,
        last_version: event.version,
    }
}

/// Folds a user stream: registration establishes the row, updates patch the
/// fields they carry.
fn fold_user(events: &[Event]) -> Result<Option<UserProjection>, AppError> {
    let mut acc: Option<UserProjection> = None;
    for event in events {
        if acc
            .as_ref()
            .is_some_and(|p| event.version <= p.last_version)
        {
            continue;
        }
        match event.kind {
            EventKind::UserRegistered => {
                let payload: UserRegisteredPayload = parse_payload(event)?;
                acc = Some(UserProjection {
                    id: event.aggregate_id,
                    username: payload.username,
                    email: payload.email,
                    role: payload.role,
                    is_active: true,
                    created_at: event.created_at,
                    last_version: event.version,
                });
            }
            EventKind::UserUpdated => {
                let payload: UserUpdatedPayload = parse_payload(event)?;
                let Some(p) = acc.as_mut() else {
                    return Err(AppError::Internal(
                        "user update before registration".to_string(),
                    ));
                };
                if let Some(username) = payload.username {
                    p.username = username;
                }
                if let Some(email) = payload.email {
                    p.email = email;
                }
                if let Some(role) = payload.role {
                    p.role = role;
                }
                if let Some(is_active) = payload.is_active {
                    p.is_active = is_active;
                }
                p.last_version = event.version;
            }
            other => {
                return Err(AppError::Internal(format!(
                    "unexpected {} event on a user stream",
                    other.as_str()
                )));
            }
        }
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::balance::Currency;
    use crate::domain::transaction::TransactionKind;

    fn event<P: serde::Serialize>(
        aggregate_type: AggregateType,
        aggregate_id: Uuid,
        kind: EventKind,
        payload: &P,
        version: i32,
    ) -> Event {
        Event {
            id: Uuid::new_v4(),
            aggregate_type,
            aggregate_id,
            kind,
            payload: serde_json::to_value(payload).unwrap(),
            metadata: None,
            created_at: Utc::now(),
            version,
        }
    }

    fn delta(user_id: Uuid, amount: &str) -> BalanceDeltaPayload {
        BalanceDeltaPayload {
            user_id,
            transaction_id: Uuid::new_v4(),
            amount: amount.parse().unwrap(),
            currency: Currency::Usd,
            reason: "credit".to_string(),
        }
    }

    #[test]
    fn test_fold_balance_applies_deltas_in_order() {
        let user = Uuid::new_v4();
        let events = vec![
            event(
                AggregateType::Balance,
                user,
                EventKind::BalanceInitialized,
                &BalanceInitializedPayload {
                    user_id: user,
                    currency: Currency::Usd,
                    initial_amount: BigDecimal::zero(),
                },
                1,
            ),
            event(
                AggregateType::Balance,
                user,
                EventKind::BalanceCredited,
                &delta(user, "100.00"),
                2,
            ),
            event(
                AggregateType::Balance,
                user,
                EventKind::BalanceDebited,
                &delta(user, "30.00"),
                3,
            ),
        ];

        let p = fold_balance(&events).unwrap().unwrap();
        assert_eq!(p.amount, "70.00".parse().unwrap());
        assert_eq!(p.currency, "USD");
        assert_eq!(p.last_version, 3);
    }

    #[test]
    fn test_fold_balance_ignores_duplicated_events() {
        let user = Uuid::new_v4();
        let credited = event(
            AggregateType::Balance,
            user,
            EventKind::BalanceCredited,
            &delta(user, "50.00"),
            1,
        );
        let events = vec![credited.clone(), credited];

        let p = fold_balance(&events).unwrap().unwrap();
        assert_eq!(p.amount, "50.00".parse().unwrap());
        assert_eq!(p.last_version, 1);
    }

    #[test]
    fn test_fold_balance_is_deterministic() {
        let user = Uuid::new_v4();
        let events = vec![
            event(
                AggregateType::Balance,
                user,
                EventKind::BalanceCredited,
                &delta(user, "10.00"),
                1,
            ),
            event(
                AggregateType::Balance,
                user,
                EventKind::BalanceDebited,
                &delta(user, "4.00"),
                2,
            ),
        ];

        let first = fold_balance(&events).unwrap().unwrap();
        let second = fold_balance(&events).unwrap().unwrap();
        assert_eq!(first.amount, second.amount);
        assert_eq!(first.last_version, second.last_version);
    }

    #[test]
    fn test_fold_balance_starts_at_zero_without_initialization() {
        let user = Uuid::new_v4();
        let events = vec![event(
            AggregateType::Balance,
            user,
            EventKind::BalanceDebited,
            &delta(user, "5.00"),
            1,
        )];

        let p = fold_balance(&events).unwrap().unwrap();
        assert_eq!(p.amount, "-5.00".parse().unwrap());
    }

    #[test]
    fn test_fold_balance_late_initialization_keeps_prior_deltas() {
        // Version allocation can put the initialization event behind a
        // delta published by a concurrent operation.
        let user = Uuid::new_v4();
        let events = vec![
            event(
                AggregateType::Balance,
                user,
                EventKind::BalanceDebited,
                &delta(user, "30.00"),
                1,
            ),
            event(
                AggregateType::Balance,
                user,
                EventKind::BalanceInitialized,
                &BalanceInitializedPayload {
                    user_id: user,
                    currency: Currency::Usd,
                    initial_amount: BigDecimal::zero(),
                },
                2,
            ),
            event(
                AggregateType::Balance,
                user,
                EventKind::BalanceCredited,
                &delta(user, "100.00"),
                3,
            ),
        ];

        let p = fold_balance(&events).unwrap().unwrap();
        assert_eq!(p.amount, "70.00".parse().unwrap());
        assert_eq!(p.currency, "USD");
        assert_eq!(p.last_version, 3);
    }

    #[test]
    fn test_fold_balance_rejects_foreign_events() {
        let user = Uuid::new_v4();
        let events = vec![event(
            AggregateType::Balance,
            user,
            EventKind::UserRegistered,
            &serde_json::json!({}),
            1,
        )];
        assert!(fold_balance(&events).is_err());
    }

    fn tx_payload(id: Uuid, from: Option<Uuid>, to: Option<Uuid>) -> TransactionEventPayload {
        TransactionEventPayload {
            transaction_id: id,
            from_user_id: from,
            to_user_id: to,
            amount: "20.00".parse().unwrap(),
            currency: Currency::Gbp,
            kind: TransactionKind::Transfer,
            reason: None,
        }
    }

    #[test]
    fn test_fold_transaction_lifecycle_with_rollback_marker() {
        let id = Uuid::new_v4();
        let from = Some(Uuid::new_v4());
        let to = Some(Uuid::new_v4());
        let rollback_id = Uuid::new_v4();
        let events = vec![
            event(
                AggregateType::Transaction,
                id,
                EventKind::TransactionStarted,
                &tx_payload(id, from, to),
                1,
            ),
            event(
                AggregateType::Transaction,
                id,
                EventKind::TransactionSucceeded,
                &tx_payload(id, from, to),
                2,
            ),
            event(
                AggregateType::Transaction,
                id,
                EventKind::TransactionRolledBack,
                &RollbackEventPayload {
                    original_transaction_id: id,
                    rollback_transaction_id: rollback_id,
                    requested_by: None,
                },
                3,
            ),
        ];

        let p = fold_transaction(&events).unwrap().unwrap();
        assert_eq!(p.status, "success");
        assert_eq!(p.rolled_back_by, Some(rollback_id));
        assert_eq!(p.last_version, 3);
    }

    #[test]
    fn test_fold_transaction_tolerates_missing_started_event() {
        let id = Uuid::new_v4();
        let events = vec![event(
            AggregateType::Transaction,
            id,
            EventKind::TransactionFailed,
            &tx_payload(id, Some(Uuid::new_v4()), None),
            1,
        )];

        let p = fold_transaction(&events).unwrap().unwrap();
        assert_eq!(p.status, "failed");
        assert_eq!(p.kind, "transfer");
    }

    #[test]
    fn test_fold_user_applies_partial_updates() {
        let id = Uuid::new_v4();
        let events = vec![
            event(
                AggregateType::User,
                id,
                EventKind::UserRegistered,
                &UserRegisteredPayload {
                    user_id: id,
                    username: "ada".to_string(),
                    email: "ada@example.com".to_string(),
                    role: "user".to_string(),
                },
                1,
            ),
            event(
                AggregateType::User,
                id,
                EventKind::UserUpdated,
                &UserUpdatedPayload {
                    user_id: id,
                    username: None,
                    email: Some("ada@bank.example".to_string()),
                    role: None,
                    is_active: Some(false),
                },
                2,
            ),
        ];

        let p = fold_user(&events).unwrap().unwrap();
        assert_eq!(p.username, "ada");
        assert_eq!(p.email, "ada@bank.example");
        assert!(!p.is_active);
        assert_eq!(p.last_version, 2);
    }

    #[test]
    fn test_fold_user_rejects_update_before_registration() {
        let id = Uuid::new_v4();
        let events = vec![event(
            AggregateType::User,
            id,
            EventKind::UserUpdated,
            &UserUpdatedPayload {
                user_id: id,
                username: Some("ghost".to_string()),
                email: None,
                role: None,
                is_active: None,
            },
            1,
        )];
        assert!(fold_user(&events).is_err());
    }

    #[test]
    fn test_empty_history_folds_to_nothing() {
        assert!(fold_balance(&[]).unwrap().is_none());
        assert!(fold_transaction(&[]).unwrap().is_none());
        assert!(fold_user(&[]).unwrap().is_none());
    }
}
