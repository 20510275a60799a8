//! Read-through cache on Redis. Every path fails open: a Redis error is
//! logged and treated as a miss (or a no-op for writes), never surfaced to
//! the caller.

use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;

const BALANCE_TTL: u64 = 300; // 5 minutes in seconds
const TRANSACTION_TTL: u64 = 600; // terminal rows change only on rollback
const LIST_TTL: u64 = 60;

#[derive(Clone)]
pub struct CacheService {
    redis_client: redis::Client,
}

impl CacheService {
    pub fn new(redis_url: &str) -> Result<Self, AppError> {
        let redis_client = redis::Client::open(redis_url)
            .map_err(|e| AppError::Internal(format!("invalid redis url: {}", e)))?;
        Ok(Self { redis_client })
    }

    pub fn balance_key(user_id: Uuid) -> String {
        format!("balance:{}", user_id)
    }

    pub fn transaction_key(id: Uuid) -> String {
        format!("transaction:{}", id)
    }

    pub fn user_transactions_key(user_id: Uuid) -> String {
        format!("transactions:user:{}", user_id)
    }

    async fn connection(&self) -> Option<redis::aio::MultiplexedConnection> {
        match self.redis_client.get_multiplexed_async_connection().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::warn!(error = %e, "redis unavailable, skipping cache");
                None
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = match conn.get(key).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed");
                return None;
            }
        };
        match raw {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(key, error = %e, "discarding undecodable cache entry");
                    None
                }
            },
            None => None,
        }
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        let serialized = match serde_json::to_string(value) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache serialization failed");
                return;
            }
        };
        let Some(mut conn) = self.connection().await else {
            return;
        };
        if let Err(e) = conn.set_ex::<_, _, ()>(key, serialized, ttl_secs).await {
            tracing::warn!(key, error = %e, "cache write failed");
        }
    }

    pub async fn delete(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let Some(mut conn) = self.connection().await else {
            return;
        };
        if let Err(e) = conn.del::<_, ()>(keys).await {
            tracing::warn!(?keys, error = %e, "cache invalidation failed");
        }
    }

    pub fn balance_ttl() -> u64 {
        BALANCE_TTL
    }

    pub fn transaction_ttl() -> u64 {
        TRANSACTION_TTL
    }

    pub fn list_ttl() -> u64 {
        LIST_TTL
    }

    /// Drops everything cached for a user whose money moved: live balance and
    /// the first page of their transaction list.
    pub async fn invalidate_user(&self, user_id: Uuid) {
        self.delete(&[
            Self::balance_key(user_id),
            Self::user_transactions_key(user_id),
        ])
        .await;
    }

    pub async fn invalidate_transaction(&self, id: Uuid) {
        self.delete(&[Self::transaction_key(id)]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_keys_are_namespaced() {
        let user = Uuid::from_u128(7);
        assert_eq!(
            CacheService::balance_key(user),
            format!("balance:{}", user)
        );
        assert_eq!(
            CacheService::user_transactions_key(user),
            format!("transactions:user:{}", user)
        );
        assert!(CacheService::transaction_key(user).starts_with("transaction:"));
    }

    #[test]
    fn test_new_rejects_malformed_url() {
        assert!(CacheService::new("not a url").is_err());
    }
}
