use std::env;
use std::time::Duration;

use dotenvy::dotenv;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    /// When unset, caching is disabled and every read goes to Postgres.
    pub redis_url: Option<String>,
    pub db_max_connections: u32,
    pub scheduler_interval_secs: u64,
    pub scheduler_batch_limit: u32,
    pub projector_interval_secs: u64,
    pub projector_overlap_secs: u64,
    pub operation_timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok(); // Load .env file if present

        Ok(Config {
            database_url: env::var("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL").ok(),
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,
            scheduler_interval_secs: env::var("SCHEDULER_INTERVAL_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            scheduler_batch_limit: env::var("SCHEDULER_BATCH_LIMIT")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
            projector_interval_secs: env::var("PROJECTOR_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,
            projector_overlap_secs: env::var("PROJECTOR_OVERLAP_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()?,
            operation_timeout_ms: env::var("OPERATION_TIMEOUT_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()?,
        })
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn projector_interval(&self) -> Duration {
        Duration::from_secs(self.projector_interval_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            database_url: "postgres://localhost/bankledger".to_string(),
            redis_url: None,
            db_max_connections: 5,
            scheduler_interval_secs: 30,
            scheduler_batch_limit: 10,
            projector_interval_secs: 60,
            projector_overlap_secs: 300,
            operation_timeout_ms: 10_000,
        }
    }

    #[test]
    fn test_duration_accessors() {
        let config = sample();
        assert_eq!(config.scheduler_interval(), Duration::from_secs(30));
        assert_eq!(config.projector_interval(), Duration::from_secs(60));
        assert_eq!(config.operation_timeout(), Duration::from_millis(10_000));
    }
}
