//! Scheduled transaction domain entity: creation rules, recurrence math and
//! the status transitions applied after each execution attempt.

use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

use super::balance::{validate_amount, Currency};
use super::transaction::{TransactionKind, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    OneTime,
    Recurring,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::OneTime => "one_time",
            ScheduleKind::Recurring => "recurring",
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_time" | "one-time" => Ok(ScheduleKind::OneTime),
            "recurring" => Ok(ScheduleKind::Recurring),
            other => Err(AppError::Validation(format!(
                "unknown schedule type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrencePattern {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RecurrencePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrencePattern::Daily => "daily",
            RecurrencePattern::Weekly => "weekly",
            RecurrencePattern::Monthly => "monthly",
            RecurrencePattern::Yearly => "yearly",
        }
    }
}

impl fmt::Display for RecurrencePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecurrencePattern {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(RecurrencePattern::Daily),
            "weekly" => Ok(RecurrencePattern::Weekly),
            "monthly" => Ok(RecurrencePattern::Monthly),
            "yearly" => Ok(RecurrencePattern::Yearly),
            other => Err(AppError::Validation(format!(
                "unknown recurrence pattern: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Cancelled,
    Completed,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Paused => "paused",
            ScheduleStatus::Cancelled => "cancelled",
            ScheduleStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScheduleStatus::Cancelled | ScheduleStatus::Completed)
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ScheduleStatus::Active),
            "paused" => Ok(ScheduleStatus::Paused),
            "cancelled" => Ok(ScheduleStatus::Cancelled),
            "completed" => Ok(ScheduleStatus::Completed),
            other => Err(AppError::Validation(format!(
                "unknown schedule status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "skipped" => Ok(ExecutionStatus::Skipped),
            other => Err(AppError::Validation(format!(
                "unknown execution status: {}",
                other
            ))),
        }
    }
}

/// A standing instruction to run a transaction once or on a recurrence.
/// Mutated only by the engine during execution attempts and cancellation.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: TransactionKind,
    pub amount: BigDecimal,
    pub currency: Currency,
    pub to_user_id: Option<Uuid>,
    pub schedule_kind: ScheduleKind,
    pub execute_at: DateTime<Utc>,
    pub recurrence_pattern: Option<RecurrencePattern>,
    pub recurrence_end_date: Option<DateTime<Utc>>,
    pub max_occurrences: Option<i32>,
    pub current_occurrence: i32,
    pub status: ScheduleStatus,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub next_execution_at: Option<DateTime<Utc>>,
}

impl ScheduledTransaction {
    pub fn from_request(
        user_id: Uuid,
        request: &CreateScheduleRequest,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind: request.kind,
            amount: request.amount.clone(),
            currency: request.currency,
            to_user_id: request.to_user_id,
            schedule_kind: request.schedule_kind,
            execute_at: request.execute_at,
            recurrence_pattern: request.recurrence_pattern,
            recurrence_end_date: request.recurrence_end_date,
            max_occurrences: request.max_occurrences,
            current_occurrence: 0,
            status: ScheduleStatus::Active,
            is_active: true,
            created_at: now,
            updated_at: now,
            last_executed_at: None,
            next_execution_at: Some(request.execute_at),
        }
    }

    /// A stored configuration the engine cannot dispatch at all. Such rows
    /// record a `skipped` execution instead of a failed transaction.
    pub fn dispatch_problem(&self) -> Option<String> {
        if self.kind == TransactionKind::Transfer {
            match self.to_user_id {
                None => return Some("transfer schedule has no receiver".to_string()),
                Some(to) if to == self.user_id => {
                    return Some("transfer schedule targets its own account".to_string())
                }
                Some(_) => {}
            }
        }
        None
    }
}

/// User-facing creation request, validated before any row is written.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateScheduleRequest {
    pub kind: TransactionKind,
    pub amount: BigDecimal,
    pub currency: Currency,
    pub to_user_id: Option<Uuid>,
    pub schedule_kind: ScheduleKind,
    pub execute_at: DateTime<Utc>,
    pub recurrence_pattern: Option<RecurrencePattern>,
    pub recurrence_end_date: Option<DateTime<Utc>>,
    pub max_occurrences: Option<i32>,
}

impl CreateScheduleRequest {
    pub fn validate(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), AppError> {
        validate_amount(&self.amount)?;

        match self.kind {
            TransactionKind::Transfer => match self.to_user_id {
                None => {
                    return Err(AppError::Validation(
                        "transfer schedule requires a receiver".to_string(),
                    ))
                }
                Some(to) if to == user_id => {
                    return Err(AppError::Validation(
                        "transfer schedule cannot target its own account".to_string(),
                    ))
                }
                Some(_) => {}
            },
            TransactionKind::Credit | TransactionKind::Debit => {
                if self.to_user_id.is_some() {
                    return Err(AppError::Validation(format!(
                        "{} schedule must not have a receiver",
                        self.kind
                    )));
                }
            }
        }

        if self.execute_at <= now {
            return Err(AppError::Validation(
                "execute_at must be in the future".to_string(),
            ));
        }

        match self.schedule_kind {
            ScheduleKind::Recurring => {
                if self.recurrence_pattern.is_none() {
                    return Err(AppError::Validation(
                        "recurring schedule requires a recurrence pattern".to_string(),
                    ));
                }
            }
            ScheduleKind::OneTime => {
                if self.recurrence_pattern.is_some()
                    || self.recurrence_end_date.is_some()
                    || self.max_occurrences.is_some()
                {
                    return Err(AppError::Validation(
                        "one-time schedule cannot carry recurrence settings".to_string(),
                    ));
                }
            }
        }

        if let Some(end) = self.recurrence_end_date {
            if end <= self.execute_at {
                return Err(AppError::Validation(
                    "recurrence_end_date must be after execute_at".to_string(),
                ));
            }
        }

        if let Some(max) = self.max_occurrences {
            if max <= 0 {
                return Err(AppError::Validation(
                    "max_occurrences must be positive".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// The execution outcome written back onto the schedule row, inside the same
/// claim transaction that selected it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleTransition {
    pub status: ScheduleStatus,
    pub is_active: bool,
    pub current_occurrence: i32,
    pub execute_at: DateTime<Utc>,
    pub next_execution_at: Option<DateTime<Utc>>,
    pub last_executed_at: Option<DateTime<Utc>>,
}

/// Next occurrence after `base` for a pattern. Month and year steps use
/// calendar arithmetic with end-of-month clamping (Jan 31 + 1 month = Feb 28).
/// `None` only when the result would leave the representable time range.
pub fn next_occurrence(
    pattern: RecurrencePattern,
    base: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match pattern {
        RecurrencePattern::Daily => base.checked_add_signed(Duration::days(1)),
        RecurrencePattern::Weekly => base.checked_add_signed(Duration::days(7)),
        RecurrencePattern::Monthly => base.checked_add_months(Months::new(1)),
        RecurrencePattern::Yearly => base.checked_add_months(Months::new(12)),
    }
}

/// Schedule state after a successful execution at `executed_at`.
/// One-time schedules complete; recurring ones advance to the next occurrence
/// unless `max_occurrences` is reached or the next occurrence would pass
/// `recurrence_end_date`, in which case they complete instead.
pub fn transition_after_success(
    st: &ScheduledTransaction,
    executed_at: DateTime<Utc>,
) -> ScheduleTransition {
    let occurrence = st.current_occurrence + 1;
    let completed = ScheduleTransition {
        status: ScheduleStatus::Completed,
        is_active: false,
        current_occurrence: occurrence,
        execute_at: st.execute_at,
        next_execution_at: None,
        last_executed_at: Some(executed_at),
    };

    if st.schedule_kind == ScheduleKind::OneTime {
        return completed;
    }
    if st.max_occurrences.is_some_and(|max| occurrence >= max) {
        return completed;
    }

    let Some(pattern) = st.recurrence_pattern else {
        // Recurring without a pattern cannot reschedule; treat as exhausted.
        return completed;
    };
    let next = match next_occurrence(pattern, executed_at) {
        Some(next) => next,
        None => return completed,
    };
    if st.recurrence_end_date.is_some_and(|end| next > end) {
        return completed;
    }

    ScheduleTransition {
        status: ScheduleStatus::Active,
        is_active: true,
        current_occurrence: occurrence,
        execute_at: next,
        next_execution_at: Some(next),
        last_executed_at: Some(executed_at),
    }
}

/// Schedule state after a failed (or skipped) execution attempt: recurring
/// pauses for manual intervention, one-time cancels. The occurrence counter
/// only counts successes.
pub fn transition_after_failure(st: &ScheduledTransaction) -> ScheduleTransition {
    match st.schedule_kind {
        ScheduleKind::Recurring => ScheduleTransition {
            status: ScheduleStatus::Paused,
            is_active: true,
            current_occurrence: st.current_occurrence,
            execute_at: st.execute_at,
            next_execution_at: st.next_execution_at,
            last_executed_at: st.last_executed_at,
        },
        ScheduleKind::OneTime => ScheduleTransition {
            status: ScheduleStatus::Cancelled,
            is_active: false,
            current_occurrence: st.current_occurrence,
            execute_at: st.execute_at,
            next_execution_at: None,
            last_executed_at: st.last_executed_at,
        },
    }
}

/// One execution attempt of a schedule; append-only audit.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledExecution {
    pub id: Uuid,
    pub scheduled_transaction_id: Uuid,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub transaction_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub amount: BigDecimal,
    pub currency: Currency,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleFilter {
    pub status: Option<ScheduleStatus>,
    pub schedule_kind: Option<ScheduleKind>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ScheduleFilter {
    pub fn normalized(&self) -> (i64, i64) {
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    fn base_request() -> CreateScheduleRequest {
        CreateScheduleRequest {
            kind: TransactionKind::Debit,
            amount: "25.00".parse().unwrap(),
            currency: Currency::Usd,
            to_user_id: None,
            schedule_kind: ScheduleKind::Recurring,
            execute_at: at(2026, 9, 1, 9),
            recurrence_pattern: Some(RecurrencePattern::Daily),
            recurrence_end_date: None,
            max_occurrences: None,
        }
    }

    fn schedule(request: &CreateScheduleRequest) -> ScheduledTransaction {
        ScheduledTransaction::from_request(Uuid::new_v4(), request, at(2026, 8, 20, 12))
    }

    #[test]
    fn test_next_occurrence_daily_and_weekly() {
        let base = at(2026, 8, 20, 9);
        assert_eq!(
            next_occurrence(RecurrencePattern::Daily, base),
            Some(at(2026, 8, 21, 9))
        );
        assert_eq!(
            next_occurrence(RecurrencePattern::Weekly, base),
            Some(at(2026, 8, 27, 9))
        );
    }

    #[test]
    fn test_next_occurrence_monthly_clamps_to_month_end() {
        assert_eq!(
            next_occurrence(RecurrencePattern::Monthly, at(2026, 1, 31, 9)),
            Some(at(2026, 2, 28, 9))
        );
        assert_eq!(
            next_occurrence(RecurrencePattern::Monthly, at(2024, 1, 31, 9)),
            Some(at(2024, 2, 29, 9))
        );
    }

    #[test]
    fn test_next_occurrence_yearly_handles_leap_day() {
        assert_eq!(
            next_occurrence(RecurrencePattern::Yearly, at(2024, 2, 29, 9)),
            Some(at(2025, 2, 28, 9))
        );
    }

    #[test]
    fn test_creation_sets_next_execution_to_execute_at() {
        let request = base_request();
        let st = schedule(&request);
        assert_eq!(st.status, ScheduleStatus::Active);
        assert_eq!(st.current_occurrence, 0);
        assert_eq!(st.next_execution_at, Some(request.execute_at));
    }

    #[test]
    fn test_one_time_completes_after_single_success() {
        let mut request = base_request();
        request.schedule_kind = ScheduleKind::OneTime;
        request.recurrence_pattern = None;
        let st = schedule(&request);

        let tr = transition_after_success(&st, at(2026, 9, 1, 9));
        assert_eq!(tr.status, ScheduleStatus::Completed);
        assert!(!tr.is_active);
        assert_eq!(tr.current_occurrence, 1);
        assert_eq!(tr.next_execution_at, None);
    }

    #[test]
    fn test_recurring_success_advances_to_next_occurrence() {
        let st = schedule(&base_request());
        let executed = at(2026, 9, 1, 9);

        let tr = transition_after_success(&st, executed);
        assert_eq!(tr.status, ScheduleStatus::Active);
        assert_eq!(tr.current_occurrence, 1);
        assert_eq!(tr.execute_at, at(2026, 9, 2, 9));
        assert_eq!(tr.next_execution_at, Some(at(2026, 9, 2, 9)));
        assert_eq!(tr.last_executed_at, Some(executed));
    }

    #[test]
    fn test_daily_schedule_after_three_executions() {
        let mut st = schedule(&base_request());
        let mut executed = at(2026, 9, 1, 9);
        for _ in 0..3 {
            let tr = transition_after_success(&st, executed);
            st.current_occurrence = tr.current_occurrence;
            st.execute_at = tr.execute_at;
            st.next_execution_at = tr.next_execution_at;
            st.last_executed_at = tr.last_executed_at;
            st.status = tr.status;
            st.is_active = tr.is_active;
            executed = tr.execute_at;
        }
        assert_eq!(st.status, ScheduleStatus::Active);
        assert_eq!(st.current_occurrence, 3);
        let last = st.last_executed_at.unwrap();
        assert_eq!(st.next_execution_at, Some(last + Duration::days(1)));
    }

    #[test]
    fn test_reaching_max_occurrences_completes() {
        let mut request = base_request();
        request.max_occurrences = Some(3);
        let mut st = schedule(&request);
        st.current_occurrence = 2;

        let tr = transition_after_success(&st, at(2026, 9, 3, 9));
        assert_eq!(tr.current_occurrence, 3);
        assert_eq!(tr.status, ScheduleStatus::Completed);
        assert_eq!(tr.next_execution_at, None);
    }

    #[test]
    fn test_max_occurrences_of_one_runs_exactly_once() {
        let mut request = base_request();
        request.max_occurrences = Some(1);
        let st = schedule(&request);

        let tr = transition_after_success(&st, at(2026, 9, 1, 9));
        assert_eq!(tr.status, ScheduleStatus::Completed);
        assert_eq!(tr.current_occurrence, 1);
    }

    #[test]
    fn test_passing_end_date_completes() {
        let mut request = base_request();
        request.recurrence_end_date = Some(at(2026, 9, 1, 12));
        let st = schedule(&request);

        // Next occurrence would be Sep 2, past the end date.
        let tr = transition_after_success(&st, at(2026, 9, 1, 9));
        assert_eq!(tr.status, ScheduleStatus::Completed);
        assert_eq!(tr.next_execution_at, None);
    }

    #[test]
    fn test_failure_pauses_recurring() {
        let st = schedule(&base_request());
        let tr = transition_after_failure(&st);
        assert_eq!(tr.status, ScheduleStatus::Paused);
        assert!(tr.is_active);
        assert_eq!(tr.current_occurrence, 0);
    }

    #[test]
    fn test_failure_cancels_one_time() {
        let mut request = base_request();
        request.schedule_kind = ScheduleKind::OneTime;
        request.recurrence_pattern = None;
        let st = schedule(&request);

        let tr = transition_after_failure(&st);
        assert_eq!(tr.status, ScheduleStatus::Cancelled);
        assert!(!tr.is_active);
        assert_eq!(tr.next_execution_at, None);
    }

    #[test]
    fn test_validate_rejects_past_execute_at() {
        let request = base_request();
        let err = request
            .validate(Uuid::new_v4(), at(2026, 9, 1, 9))
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_validate_rejects_recurring_without_pattern() {
        let mut request = base_request();
        request.recurrence_pattern = None;
        assert!(request.validate(Uuid::new_v4(), at(2026, 8, 20, 12)).is_err());
    }

    #[test]
    fn test_validate_rejects_one_time_with_recurrence_settings() {
        let mut request = base_request();
        request.schedule_kind = ScheduleKind::OneTime;
        assert!(request.validate(Uuid::new_v4(), at(2026, 8, 20, 12)).is_err());
    }

    #[test]
    fn test_validate_rejects_transfer_without_receiver() {
        let mut request = base_request();
        request.kind = TransactionKind::Transfer;
        assert!(request.validate(Uuid::new_v4(), at(2026, 8, 20, 12)).is_err());
    }

    #[test]
    fn test_validate_rejects_transfer_to_self() {
        let user = Uuid::new_v4();
        let mut request = base_request();
        request.kind = TransactionKind::Transfer;
        request.to_user_id = Some(user);
        assert!(request.validate(user, at(2026, 8, 20, 12)).is_err());
    }

    #[test]
    fn test_validate_rejects_credit_with_receiver() {
        let mut request = base_request();
        request.kind = TransactionKind::Credit;
        request.to_user_id = Some(Uuid::new_v4());
        assert!(request.validate(Uuid::new_v4(), at(2026, 8, 20, 12)).is_err());
    }

    #[test]
    fn test_validate_rejects_end_date_before_execute_at() {
        let mut request = base_request();
        request.recurrence_end_date = Some(at(2026, 8, 31, 9));
        assert!(request.validate(Uuid::new_v4(), at(2026, 8, 20, 12)).is_err());
    }

    #[test]
    fn test_validate_rejects_non_positive_max_occurrences() {
        let mut request = base_request();
        request.max_occurrences = Some(0);
        assert!(request.validate(Uuid::new_v4(), at(2026, 8, 20, 12)).is_err());
    }

    #[test]
    fn test_dispatch_problem_for_receiverless_transfer() {
        let mut request = base_request();
        request.kind = TransactionKind::Transfer;
        request.to_user_id = Some(Uuid::new_v4());
        let mut st = schedule(&request);
        st.to_user_id = None;
        assert!(st.dispatch_problem().is_some());
    }

    #[test]
    fn test_dispatch_problem_none_for_wellformed_schedule() {
        let st = schedule(&base_request());
        assert!(st.dispatch_problem().is_none());
    }

    #[test]
    fn test_schedule_kind_labels() {
        assert_eq!(ScheduleKind::OneTime.to_string(), "one_time");
        assert_eq!("one-time".parse::<ScheduleKind>().unwrap(), ScheduleKind::OneTime);
        assert_eq!("recurring".parse::<ScheduleKind>().unwrap(), ScheduleKind::Recurring);
    }
}
