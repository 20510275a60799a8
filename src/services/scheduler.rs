//! Scheduled transaction engine. Due schedules are claimed one row at a time
//! under `FOR UPDATE SKIP LOCKED`; the execution outcome and the schedule's
//! next state are written inside the same claim transaction, so a schedule is
//! executed exactly once per due occurrence no matter how many engine
//! instances poll concurrently.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db;
use crate::db::models::ScheduledTransactionRow;
use crate::domain::scheduled::{
    transition_after_failure, transition_after_success, CreateScheduleRequest, ExecutionStatus,
    ScheduleFilter, ScheduleStatus, ScheduleTransition, ScheduledExecution, ScheduledTransaction,
};
use crate::domain::transaction::DEFAULT_PAGE_LIMIT;
use crate::error::AppError;
use crate::services::audit::AuditSink;
use crate::services::processor::TransactionProcessor;

#[derive(Clone)]
pub struct SchedulerService {
    pool: PgPool,
    processor: TransactionProcessor,
    audit: Arc<dyn AuditSink>,
    batch_limit: u32,
}

impl SchedulerService {
    pub fn new(
        pool: PgPool,
        processor: TransactionProcessor,
        audit: Arc<dyn AuditSink>,
        batch_limit: u32,
    ) -> Self {
        Self {
            pool,
            processor,
            audit,
            batch_limit,
        }
    }

    pub async fn create(
        &self,
        user_id: Uuid,
        request: CreateScheduleRequest,
    ) -> Result<ScheduledTransaction, AppError> {
        let now = Utc::now();
        request.validate(user_id, now)?;

        let st = ScheduledTransaction::from_request(user_id, &request, now);
        db::scheduled::insert(&self.pool, &st).await?;
        tracing::info!(
            schedule_id = %st.id,
            user_id = %user_id,
            kind = %st.kind,
            schedule_kind = %st.schedule_kind,
            execute_at = %st.execute_at,
            "schedule created"
        );

        self.audit
            .record(
                "scheduled_transaction",
                st.id,
                "created",
                json!({
                    "user_id": user_id,
                    "kind": st.kind.as_str(),
                    "schedule_kind": st.schedule_kind.as_str(),
                    "amount": st.amount.to_string(),
                    "currency": st.currency.as_str(),
                    "execute_at": st.execute_at,
                }),
            )
            .await;
        Ok(st)
    }

    /// Single schedule lookup. A non-admin requester must own the schedule.
    pub async fn get(
        &self,
        id: Uuid,
        requester: Option<Uuid>,
    ) -> Result<ScheduledTransaction, AppError> {
        let st = db::scheduled::fetch(&self.pool, id)
            .await?
            .ok_or_else(|| AppError::not_found("scheduled transaction", id))?;
        check_owner(st, requester)
    }

    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        filter: &ScheduleFilter,
    ) -> Result<Vec<ScheduledTransaction>, AppError> {
        db::scheduled::list_for_user(&self.pool, user_id, filter).await
    }

    /// Cancels a live schedule. Completed and already-cancelled schedules are
    /// terminal; cancelling them is a conflict, not a no-op.
    pub async fn cancel(
        &self,
        id: Uuid,
        requester: Option<Uuid>,
    ) -> Result<ScheduledTransaction, AppError> {
        let st = self.get(id, requester).await?;
        if st.status.is_terminal() {
            return Err(AppError::StateConflict(format!(
                "schedule {} is already {}",
                st.id, st.status
            )));
        }

        // The update itself re-checks the status, so losing a race against an
        // execution that just completed the schedule still conflicts cleanly.
        if !db::scheduled::cancel(&self.pool, id).await? {
            return Err(AppError::StateConflict(format!(
                "schedule {} is no longer cancellable",
                id
            )));
        }

        self.audit
            .record(
                "scheduled_transaction",
                id,
                "cancelled",
                json!({ "requested_by": requester }),
            )
            .await;

        db::scheduled::fetch(&self.pool, id)
            .await?
            .ok_or_else(|| AppError::not_found("scheduled transaction", id))
    }

    pub async fn list_executions(
        &self,
        id: Uuid,
        requester: Option<Uuid>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<ScheduledExecution>, AppError> {
        // Ownership gate first; the executions themselves carry no user id.
        self.get(id, requester).await?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, 500);
        let offset = offset.unwrap_or(0).max(0);
        db::scheduled::list_executions(&self.pool, id, limit, offset).await
    }

    /// One poll: claims and executes due schedules until the batch limit is
    /// reached or nothing is due. Returns how many schedules were handled.
    pub async fn process_due(&self) -> Result<u32, AppError> {
        let mut handled = 0;
        while handled < self.batch_limit {
            let mut tx = self.pool.begin().await?;
            let Some(row) = db::scheduled::claim_next_due(&mut tx, Utc::now()).await? else {
                tx.commit().await?;
                break;
            };
            self.handle_claimed(tx, row).await?;
            handled += 1;
        }
        if handled > 0 {
            tracing::info!(handled, "scheduler poll finished");
        }
        Ok(handled)
    }

    /// Runs one claimed schedule. The claim transaction stays open until the
    /// execution record and the schedule's new state are both written.
    async fn handle_claimed(
        &self,
        mut tx: sqlx::Transaction<'_, sqlx::Postgres>,
        row: ScheduledTransactionRow,
    ) -> Result<(), AppError> {
        let schedule_id = row.id;
        let executed_at = Utc::now();
        let fallback = quarantine_transition(&row);

        let st = match row.into_domain() {
            Ok(st) => st,
            Err(e) => {
                // The row cannot be interpreted; pause it so the poll loop
                // stops re-claiming it every interval.
                return self.quarantine(tx, schedule_id, fallback, e).await;
            }
        };

        let (status, transaction_id, error_message, transition) =
            match st.dispatch_problem() {
                Some(problem) => {
                    tracing::warn!(schedule_id = %schedule_id, problem = %problem, "skipping undispatchable schedule");
                    (
                        ExecutionStatus::Skipped,
                        None,
                        Some(problem),
                        transition_after_failure(&st),
                    )
                }
                None => match self.processor.execute_scheduled(&st).await {
                    Ok(executed) => (
                        ExecutionStatus::Success,
                        Some(executed.id),
                        None,
                        transition_after_success(&st, executed_at),
                    ),
                    Err(e) => {
                        tracing::warn!(schedule_id = %schedule_id, error = %e, "scheduled execution failed");
                        (
                            ExecutionStatus::Failed,
                            None,
                            Some(e.to_string()),
                            transition_after_failure(&st),
                        )
                    }
                },
            };

        let execution = ScheduledExecution {
            id: Uuid::new_v4(),
            scheduled_transaction_id: st.id,
            executed_at,
            status,
            transaction_id,
            error_message: error_message.clone(),
            amount: st.amount.clone(),
            currency: st.currency,
        };
        db::scheduled::insert_execution(&mut tx, &execution).await?;
        db::scheduled::apply_transition(&mut tx, st.id, &transition).await?;
        tx.commit().await?;

        self.audit
            .record(
                "scheduled_transaction",
                st.id,
                match status {
                    ExecutionStatus::Success => "executed",
                    ExecutionStatus::Failed => "execution_failed",
                    ExecutionStatus::Skipped => "execution_skipped",
                },
                json!({
                    "transaction_id": transaction_id,
                    "occurrence": transition.current_occurrence,
                    "schedule_status": transition.status.as_str(),
                    "error": error_message,
                }),
            )
            .await;
        Ok(())
    }

    async fn quarantine(
        &self,
        mut tx: sqlx::Transaction<'_, sqlx::Postgres>,
        schedule_id: Uuid,
        transition: ScheduleTransition,
        cause: AppError,
    ) -> Result<(), AppError> {
        tracing::error!(schedule_id = %schedule_id, error = %cause, "pausing unreadable schedule row");
        db::scheduled::apply_transition(&mut tx, schedule_id, &transition).await?;
        tx.commit().await?;
        self.audit
            .record(
                "scheduled_transaction",
                schedule_id,
                "quarantined",
                json!({ "error": cause.to_string() }),
            )
            .await;
        Ok(())
    }
}

fn check_owner(
    st: ScheduledTransaction,
    requester: Option<Uuid>,
) -> Result<ScheduledTransaction, AppError> {
    match requester {
        Some(user_id) if st.user_id != user_id => Err(AppError::PermissionDenied(
            "schedule belongs to a different user".to_string(),
        )),
        _ => Ok(st),
    }
}

/// Pauses a row we could not parse, keeping its typed fields untouched.
fn quarantine_transition(row: &ScheduledTransactionRow) -> ScheduleTransition {
    ScheduleTransition {
        status: ScheduleStatus::Paused,
        is_active: row.is_active,
        current_occurrence: row.current_occurrence,
        execute_at: row.execute_at,
        next_execution_at: row.next_execution_at,
        last_executed_at: row.last_executed_at,
    }
}
