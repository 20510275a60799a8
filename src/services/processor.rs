//! Transaction execution. Every movement follows the same shape: validate,
//! insert a pending row, settle the balance deltas and the status flip in one
//! database transaction under a deadline, then fan out side effects (events,
//! audit, cache invalidation) that never affect the outcome.

use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use serde_json::json;
use sqlx::PgPool;
use tokio::time::timeout;
use uuid::Uuid;

use crate::db;
use crate::domain::balance::Currency;
use crate::domain::event::{DomainEvent, EventMetadata};
use crate::domain::scheduled::ScheduledTransaction;
use crate::domain::transaction::{
    NewTransaction, Transaction, TransactionFilter, TransactionKind, TransactionStatus,
};
use crate::error::AppError;
use crate::services::audit::AuditSink;
use crate::services::cache::CacheService;
use crate::services::events::{self, EventPublisher};

/// Deadline for flipping a row to failed after the settlement deadline fired.
const FAILURE_MARK_TIMEOUT: Duration = Duration::from_secs(5);

/// One participant's applied delta, kept so the post-commit events can name
/// exact signed amounts without re-deriving them.
struct ParticipantDelta {
    user_id: Uuid,
    delta: BigDecimal,
    created: bool,
}

/// What triggered an execution. Rollbacks carry the original transaction so
/// its stream receives the rolled_back marker; scheduled runs carry the
/// schedule id for event correlation.
enum Origin {
    Direct,
    Scheduled { scheduled_transaction_id: Uuid },
    Rollback {
        original_id: Uuid,
        requested_by: Option<Uuid>,
    },
}

#[derive(Clone)]
pub struct TransactionProcessor {
    pool: PgPool,
    publisher: EventPublisher,
    audit: Arc<dyn AuditSink>,
    cache: Option<CacheService>,
    op_timeout: Duration,
}

impl TransactionProcessor {
    pub fn new(
        pool: PgPool,
        publisher: EventPublisher,
        audit: Arc<dyn AuditSink>,
        cache: Option<CacheService>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            publisher,
            audit,
            cache,
            op_timeout,
        }
    }

    pub async fn credit(
        &self,
        to_user_id: Uuid,
        amount: BigDecimal,
        currency: Currency,
    ) -> Result<Transaction, AppError> {
        self.run(
            NewTransaction::credit(to_user_id, amount, currency),
            Origin::Direct,
        )
        .await
    }

    pub async fn debit(
        &self,
        from_user_id: Uuid,
        amount: BigDecimal,
        currency: Currency,
    ) -> Result<Transaction, AppError> {
        self.run(
            NewTransaction::debit(from_user_id, amount, currency),
            Origin::Direct,
        )
        .await
    }

    pub async fn transfer(
        &self,
        from_user_id: Uuid,
        to_user_id: Uuid,
        amount: BigDecimal,
        currency: Currency,
    ) -> Result<Transaction, AppError> {
        self.run(
            NewTransaction::transfer(from_user_id, to_user_id, amount, currency),
            Origin::Direct,
        )
        .await
    }

    /// Executes one due schedule occurrence. Runs through the same pipeline
    /// as a direct call; the resulting events correlate back to the schedule.
    pub async fn execute_scheduled(
        &self,
        st: &ScheduledTransaction,
    ) -> Result<Transaction, AppError> {
        let new = match st.kind {
            TransactionKind::Credit => {
                NewTransaction::credit(st.user_id, st.amount.clone(), st.currency)
            }
            TransactionKind::Debit => {
                NewTransaction::debit(st.user_id, st.amount.clone(), st.currency)
            }
            TransactionKind::Transfer => {
                let to = st.to_user_id.ok_or_else(|| {
                    AppError::Validation("transfer schedule has no receiver".to_string())
                })?;
                NewTransaction::transfer(st.user_id, to, st.amount.clone(), st.currency)
            }
        };
        self.run(
            new,
            Origin::Scheduled {
                scheduled_transaction_id: st.id,
            },
        )
        .await
    }

    /// Compensates a successful transaction on behalf of a participant.
    pub async fn rollback(
        &self,
        transaction_id: Uuid,
        requested_by: Uuid,
    ) -> Result<Transaction, AppError> {
        let original = self.require_transaction(transaction_id).await?;
        if !original.involves(requested_by) {
            return Err(AppError::PermissionDenied(
                "only a participant can roll back a transaction".to_string(),
            ));
        }
        self.rollback_inner(original, Some(requested_by)).await
    }

    /// Same as [`rollback`](Self::rollback) minus the participant check; the
    /// caller has already established the admin capability.
    pub async fn rollback_by_admin(
        &self,
        transaction_id: Uuid,
        admin_id: Uuid,
    ) -> Result<Transaction, AppError> {
        let original = self.require_transaction(transaction_id).await?;
        self.rollback_inner(original, Some(admin_id)).await
    }

    async fn rollback_inner(
        &self,
        original: Transaction,
        requested_by: Option<Uuid>,
    ) -> Result<Transaction, AppError> {
        if original.status != TransactionStatus::Success {
            return Err(AppError::StateConflict(format!(
                "transaction {} is {}, only successful transactions can be rolled back",
                original.id, original.status
            )));
        }
        let compensation = compensation_of(&original)?;
        self.run(
            compensation,
            Origin::Rollback {
                original_id: original.id,
                requested_by,
            },
        )
        .await
    }

    /// The shared execution pipeline. The pending row is written first and
    /// survives every failure mode, so an attempt is never silently lost.
    async fn run(&self, new: NewTransaction, origin: Origin) -> Result<Transaction, AppError> {
        new.validate()?;
        let pending = db::transactions::insert_pending(&self.pool, &new).await?;
        tracing::debug!(
            transaction_id = %pending.id,
            kind = %pending.kind,
            amount = %pending.amount,
            "transaction accepted"
        );

        match events::transaction_started(&pending) {
            Ok(event) => self.publisher.publish(with_origin(event, &origin)).await,
            Err(e) => tracing::warn!(error = %e, "could not build started event"),
        }

        match timeout(self.op_timeout, self.settle(&pending)).await {
            Ok(Ok(deltas)) => {
                let settled = pending.with_status(TransactionStatus::Success);
                self.after_success(&settled, &deltas, &origin).await;
                Ok(settled)
            }
            Ok(Err(e)) => {
                self.after_failure(&pending, &e.to_string(), &origin).await;
                Err(e)
            }
            Err(_) => {
                let after_ms = self.op_timeout.as_millis() as u64;
                let reason = format!("settlement exceeded {}ms deadline", after_ms);
                self.after_failure(&pending, &reason, &origin).await;
                Err(AppError::Timeout { after_ms })
            }
        }
    }

    /// The critical section: balance deltas and the pending→success flip
    /// commit together or not at all.
    async fn settle(&self, pending: &Transaction) -> Result<Vec<ParticipantDelta>, AppError> {
        let mut tx = self.pool.begin().await?;
        let mut deltas = Vec::with_capacity(2);

        match pending.kind {
            TransactionKind::Credit => {
                let user_id = pending
                    .to_user_id
                    .ok_or_else(|| AppError::Internal("credit row has no receiver".to_string()))?;
                let applied =
                    db::balances::apply_delta(&mut tx, user_id, &pending.amount, pending.currency)
                        .await?;
                deltas.push(ParticipantDelta {
                    user_id,
                    delta: pending.amount.clone(),
                    created: applied.created,
                });
            }
            TransactionKind::Debit => {
                let user_id = pending
                    .from_user_id
                    .ok_or_else(|| AppError::Internal("debit row has no sender".to_string()))?;
                let delta = -&pending.amount;
                let applied =
                    db::balances::apply_delta(&mut tx, user_id, &delta, pending.currency).await?;
                deltas.push(ParticipantDelta {
                    user_id,
                    delta,
                    created: applied.created,
                });
            }
            TransactionKind::Transfer => {
                let from = pending
                    .from_user_id
                    .ok_or_else(|| AppError::Internal("transfer row has no sender".to_string()))?;
                let to = pending
                    .to_user_id
                    .ok_or_else(|| AppError::Internal("transfer row has no receiver".to_string()))?;
                // Legs run in canonical order so opposing transfers between
                // the same accounts cannot deadlock.
                for (user_id, delta) in db::balances::transfer_legs(from, to, &pending.amount) {
                    let applied =
                        db::balances::apply_delta(&mut tx, user_id, &delta, pending.currency)
                            .await?;
                    deltas.push(ParticipantDelta {
                        user_id,
                        delta,
                        created: applied.created,
                    });
                }
            }
        }

        db::transactions::mark_succeeded(&mut tx, pending.id).await?;
        tx.commit().await?;
        Ok(deltas)
    }

    async fn after_success(
        &self,
        settled: &Transaction,
        deltas: &[ParticipantDelta],
        origin: &Origin,
    ) {
        tracing::info!(
            transaction_id = %settled.id,
            kind = %settled.kind,
            amount = %settled.amount,
            currency = %settled.currency,
            "transaction settled"
        );

        match success_events(settled, deltas, origin) {
            Ok(batch) => {
                let batch = batch
                    .into_iter()
                    .map(|event| with_origin(event, origin))
                    .collect();
                self.publisher.publish_batch(batch).await;
            }
            Err(e) => tracing::warn!(error = %e, "could not build settlement events"),
        }

        self.audit
            .record(
                "transaction",
                settled.id,
                "succeeded",
                json!({
                    "kind": settled.kind.as_str(),
                    "amount": settled.amount.to_string(),
                    "currency": settled.currency.as_str(),
                    "from_user_id": settled.from_user_id,
                    "to_user_id": settled.to_user_id,
                }),
            )
            .await;
        if let Origin::Rollback {
            original_id,
            requested_by,
        } = origin
        {
            self.audit
                .record(
                    "transaction",
                    *original_id,
                    "rolled_back",
                    json!({
                        "rollback_transaction_id": settled.id,
                        "requested_by": requested_by,
                    }),
                )
                .await;
        }

        if let Some(cache) = &self.cache {
            // A read racing the settlement may have cached the pending row.
            cache.invalidate_transaction(settled.id).await;
            for delta in deltas {
                cache.invalidate_user(delta.user_id).await;
            }
        }
    }

    async fn after_failure(&self, pending: &Transaction, reason: &str, origin: &Origin) {
        tracing::warn!(
            transaction_id = %pending.id,
            kind = %pending.kind,
            reason,
            "transaction failed"
        );

        // Guarded flip: if the settlement actually committed before a
        // deadline fired, the row is already terminal and stays success.
        match timeout(
            FAILURE_MARK_TIMEOUT,
            db::transactions::mark_failed(&self.pool, pending.id),
        )
        .await
        {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => tracing::warn!(
                transaction_id = %pending.id,
                "transaction already left pending, keeping its status"
            ),
            Ok(Err(e)) => tracing::error!(
                transaction_id = %pending.id,
                error = %e,
                "could not mark transaction failed"
            ),
            Err(_) => tracing::error!(
                transaction_id = %pending.id,
                "timed out marking transaction failed"
            ),
        }

        match events::transaction_failed(pending, reason) {
            Ok(event) => self.publisher.publish(with_origin(event, origin)).await,
            Err(e) => tracing::warn!(error = %e, "could not build failed event"),
        }

        self.audit
            .record(
                "transaction",
                pending.id,
                "failed",
                json!({
                    "kind": pending.kind.as_str(),
                    "amount": pending.amount.to_string(),
                    "currency": pending.currency.as_str(),
                    "reason": reason,
                }),
            )
            .await;

        if let Some(cache) = &self.cache {
            cache.invalidate_transaction(pending.id).await;
        }
    }

    async fn require_transaction(&self, id: Uuid) -> Result<Transaction, AppError> {
        db::transactions::fetch(&self.pool, id)
            .await?
            .ok_or_else(|| AppError::not_found("transaction", id))
    }

    /// Single transaction lookup. A non-admin requester must be a
    /// participant; cached rows go through the same check.
    pub async fn get_transaction(
        &self,
        id: Uuid,
        requester: Option<Uuid>,
    ) -> Result<Transaction, AppError> {
        let key = CacheService::transaction_key(id);
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get_json::<Transaction>(&key).await {
                return check_participant(cached, requester);
            }
        }
        let tx = self.require_transaction(id).await?;
        if let Some(cache) = &self.cache {
            cache
                .put_json(&key, &tx, CacheService::transaction_ttl())
                .await;
        }
        check_participant(tx, requester)
    }

    /// A user's transactions, newest first. The unfiltered first page is
    /// served through the cache; any filter bypasses it.
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>, AppError> {
        let cacheable = filter.is_default_page();
        let key = CacheService::user_transactions_key(user_id);

        if cacheable {
            if let Some(cache) = &self.cache {
                if let Some(cached) = cache.get_json::<Vec<Transaction>>(&key).await {
                    return Ok(cached);
                }
            }
        }

        let transactions = db::transactions::list_for_user(&self.pool, user_id, filter).await?;
        if cacheable {
            if let Some(cache) = &self.cache {
                cache
                    .put_json(&key, &transactions, CacheService::list_ttl())
                    .await;
            }
        }
        Ok(transactions)
    }

    /// All transactions, newest first. Admin surface, uncached.
    pub async fn list_all(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>, AppError> {
        db::transactions::list_all(&self.pool, filter).await
    }
}

fn check_participant(
    tx: Transaction,
    requester: Option<Uuid>,
) -> Result<Transaction, AppError> {
    match requester {
        Some(user_id) if !tx.involves(user_id) => Err(AppError::PermissionDenied(
            "transaction does not involve the requesting user".to_string(),
        )),
        _ => Ok(tx),
    }
}

/// The compensating shape for a successful transaction: direction inverted,
/// same amount and currency. The compensation replays through the normal
/// pipeline, so the non-negativity check applies to it like any other
/// movement.
fn compensation_of(original: &Transaction) -> Result<NewTransaction, AppError> {
    let missing =
        |side: &str| AppError::Internal(format!("transaction {} has no {}", original.id, side));
    match original.kind {
        TransactionKind::Credit => {
            let to = original.to_user_id.ok_or_else(|| missing("receiver"))?;
            Ok(NewTransaction::debit(
                to,
                original.amount.clone(),
                original.currency,
            ))
        }
        TransactionKind::Debit => {
            let from = original.from_user_id.ok_or_else(|| missing("sender"))?;
            Ok(NewTransaction::credit(
                from,
                original.amount.clone(),
                original.currency,
            ))
        }
        TransactionKind::Transfer => {
            let from = original.from_user_id.ok_or_else(|| missing("sender"))?;
            let to = original.to_user_id.ok_or_else(|| missing("receiver"))?;
            Ok(NewTransaction::transfer(
                to,
                from,
                original.amount.clone(),
                original.currency,
            ))
        }
    }
}

fn success_events(
    settled: &Transaction,
    deltas: &[ParticipantDelta],
    origin: &Origin,
) -> Result<Vec<DomainEvent>, AppError> {
    let mut batch = Vec::with_capacity(deltas.len() + 2);
    for delta in deltas {
        if delta.created {
            batch.push(events::balance_initialized(delta.user_id, settled.currency)?);
        }
        batch.push(events::balance_delta(
            delta.user_id,
            settled.id,
            &delta.delta,
            settled.currency,
            settled.kind.as_str(),
        )?);
    }
    batch.push(events::transaction_succeeded(settled)?);
    if let Origin::Rollback {
        original_id,
        requested_by,
    } = origin
    {
        batch.push(events::transaction_rolled_back(
            *original_id,
            settled.id,
            *requested_by,
        )?);
    }
    Ok(batch)
}

fn with_origin(event: DomainEvent, origin: &Origin) -> DomainEvent {
    let metadata = match origin {
        Origin::Direct => return event,
        Origin::Scheduled {
            scheduled_transaction_id,
        } => EventMetadata {
            correlation_id: Some(*scheduled_transaction_id),
            source: Some("scheduler".to_string()),
        },
        Origin::Rollback { original_id, .. } => EventMetadata {
            correlation_id: Some(*original_id),
            source: Some("rollback".to_string()),
        },
    };
    match event.clone().with_metadata(&metadata) {
        Ok(tagged) => tagged,
        Err(e) => {
            tracing::warn!(error = %e, "could not attach event metadata");
            event
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::EventKind;
    use chrono::Utc;

    fn settled(kind: TransactionKind, from: Option<Uuid>, to: Option<Uuid>) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            from_user_id: from,
            to_user_id: to,
            amount: "75.00".parse().unwrap(),
            currency: Currency::Usd,
            kind,
            status: TransactionStatus::Success,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_compensation_inverts_a_credit_into_a_debit() {
        let user = Uuid::new_v4();
        let original = settled(TransactionKind::Credit, None, Some(user));
        let comp = compensation_of(&original).unwrap();
        assert_eq!(comp.kind, TransactionKind::Debit);
        assert_eq!(comp.from_user_id, Some(user));
        assert_eq!(comp.to_user_id, None);
        assert_eq!(comp.amount, original.amount);
    }

    #[test]
    fn test_compensation_inverts_a_debit_into_a_credit() {
        let user = Uuid::new_v4();
        let original = settled(TransactionKind::Debit, Some(user), None);
        let comp = compensation_of(&original).unwrap();
        assert_eq!(comp.kind, TransactionKind::Credit);
        assert_eq!(comp.to_user_id, Some(user));
        assert_eq!(comp.from_user_id, None);
    }

    #[test]
    fn test_compensation_swaps_transfer_direction() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let original = settled(TransactionKind::Transfer, Some(a), Some(b));
        let comp = compensation_of(&original).unwrap();
        assert_eq!(comp.kind, TransactionKind::Transfer);
        assert_eq!(comp.from_user_id, Some(b));
        assert_eq!(comp.to_user_id, Some(a));
    }

    #[test]
    fn test_compensation_rejects_malformed_rows() {
        let original = settled(TransactionKind::Transfer, Some(Uuid::new_v4()), None);
        assert!(compensation_of(&original).is_err());
    }

    #[test]
    fn test_participant_check_allows_admin_and_participants() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let tx = settled(TransactionKind::Transfer, Some(a), Some(b));

        assert!(check_participant(tx.clone(), None).is_ok());
        assert!(check_participant(tx.clone(), Some(a)).is_ok());
        assert!(check_participant(tx.clone(), Some(b)).is_ok());
        assert!(matches!(
            check_participant(tx, Some(Uuid::new_v4())),
            Err(AppError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_success_events_include_initialization_for_new_accounts() {
        let user = Uuid::new_v4();
        let tx = settled(TransactionKind::Credit, None, Some(user));
        let deltas = vec![ParticipantDelta {
            user_id: user,
            delta: "75.00".parse().unwrap(),
            created: true,
        }];

        let batch = success_events(&tx, &deltas, &Origin::Direct).unwrap();
        let kinds: Vec<_> = batch.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::BalanceInitialized,
                EventKind::BalanceCredited,
                EventKind::TransactionSucceeded,
            ]
        );
    }

    #[test]
    fn test_rollback_origin_adds_rolled_back_marker() {
        let user = Uuid::new_v4();
        let tx = settled(TransactionKind::Debit, Some(user), None);
        let deltas = vec![ParticipantDelta {
            user_id: user,
            delta: "-75.00".parse().unwrap(),
            created: false,
        }];
        let origin = Origin::Rollback {
            original_id: Uuid::new_v4(),
            requested_by: Some(user),
        };

        let batch = success_events(&tx, &deltas, &origin).unwrap();
        assert_eq!(
            batch.last().map(|e| e.kind),
            Some(EventKind::TransactionRolledBack)
        );
    }

    #[test]
    fn test_scheduled_origin_tags_events_with_correlation() {
        let schedule_id = Uuid::new_v4();
        let tx = settled(TransactionKind::Credit, None, Some(Uuid::new_v4()));
        let event = events::transaction_started(&tx).unwrap();

        let tagged = with_origin(
            event,
            &Origin::Scheduled {
                scheduled_transaction_id: schedule_id,
            },
        );
        let metadata = tagged.metadata.unwrap();
        assert_eq!(
            metadata.get("correlation_id").and_then(|v| v.as_str()),
            Some(schedule_id.to_string().as_str())
        );
        assert_eq!(
            metadata.get("source").and_then(|v| v.as_str()),
            Some("scheduler")
        );
    }
}
