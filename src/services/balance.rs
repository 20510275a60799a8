//! Balance reads. Amounts only ever move through the processor's settlement
//! path; this service serves the live balance (through the cache when one is
//! configured) and the replay-derived views.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db;
use crate::domain::balance::{Balance, BalanceHistoryEntry};
use crate::domain::transaction::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use crate::error::AppError;
use crate::services::cache::CacheService;

#[derive(Clone)]
pub struct BalanceService {
    pool: PgPool,
    cache: Option<CacheService>,
}

impl BalanceService {
    pub fn new(pool: PgPool, cache: Option<CacheService>) -> Self {
        Self { pool, cache }
    }

    /// The account's live balance. Served through the cache; the processor
    /// invalidates the key whenever the account's money moves.
    pub async fn get_balance(&self, user_id: Uuid) -> Result<Balance, AppError> {
        let key = CacheService::balance_key(user_id);
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get_json::<Balance>(&key).await {
                return Ok(cached);
            }
        }
        let balance = db::balances::fetch(&self.pool, user_id)
            .await?
            .ok_or_else(|| AppError::not_found("balance", user_id))?;
        if let Some(cache) = &self.cache {
            cache
                .put_json(&key, &balance, CacheService::balance_ttl())
                .await;
        }
        Ok(balance)
    }

    /// The most recent `limit` movements in chronological order, each with
    /// the running balance after it.
    pub async fn history(
        &self,
        user_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<BalanceHistoryEntry>, AppError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        db::balances::history(&self.pool, user_id, limit).await
    }

    /// The account's amount as of `at`, replayed from its successful
    /// transactions. Evaluated at "now" this agrees with the live balance.
    pub async fn amount_at(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<BigDecimal, AppError> {
        db::balances::amount_at(&self.pool, user_id, at).await
    }
}
