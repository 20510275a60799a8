use crate::config::Config;
use anyhow::{Context, Result};
use sqlx::PgPool;

pub struct ValidationReport {
    pub environment: bool,
    pub database: bool,
    pub redis: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.environment && self.database && self.redis
    }

    pub fn print(&self) {
        println!("\n=== Startup Validation Report ===");
        println!("Environment Variables: {}", status(self.environment));
        println!("Database Connectivity: {}", status(self.database));
        println!("Redis Connectivity:    {}", status(self.redis));

        if !self.errors.is_empty() {
            println!("\nErrors:");
            for error in &self.errors {
                println!("  ❌ {}", error);
            }
        }

        println!(
            "\nOverall Status: {}",
            if self.is_valid() { "✅ PASS" } else { "❌ FAIL" }
        );
        println!("=================================\n");
    }
}

fn status(ok: bool) -> &'static str {
    if ok { "✅ OK" } else { "❌ FAIL" }
}

pub async fn validate_environment(config: &Config, pool: &PgPool) -> Result<ValidationReport> {
    let mut report = ValidationReport {
        environment: true,
        database: true,
        redis: true,
        errors: Vec::new(),
    };

    if let Err(e) = validate_env_vars(config) {
        report.environment = false;
        report.errors.push(format!("Environment: {}", e));
    }

    if let Err(e) = validate_database(pool).await {
        report.database = false;
        report.errors.push(format!("Database: {}", e));
    }

    if let Err(e) = validate_redis(config.redis_url.as_deref()).await {
        report.redis = false;
        report.errors.push(format!("Redis: {}", e));
    }

    Ok(report)
}

fn validate_env_vars(config: &Config) -> Result<()> {
    if config.database_url.is_empty() {
        anyhow::bail!("DATABASE_URL is empty");
    }
    url::Url::parse(&config.database_url).context("DATABASE_URL is not a valid URL")?;

    if let Some(redis_url) = &config.redis_url {
        url::Url::parse(redis_url).context("REDIS_URL is not a valid URL")?;
    }

    if config.db_max_connections == 0 {
        anyhow::bail!("DB_MAX_CONNECTIONS must be greater than 0");
    }
    if config.scheduler_batch_limit == 0 {
        anyhow::bail!("SCHEDULER_BATCH_LIMIT must be greater than 0");
    }
    if config.operation_timeout_ms == 0 {
        anyhow::bail!("OPERATION_TIMEOUT_MS must be greater than 0");
    }

    Ok(())
}

async fn validate_database(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .fetch_one(pool)
        .await
        .context("Failed to connect to database")?;

    // Check if migrations are up to date
    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
        .fetch_one(pool)
        .await
        .context("Failed to check migrations table")?;

    if applied == 0 {
        anyhow::bail!("No migrations applied");
    }

    Ok(())
}

async fn validate_redis(redis_url: Option<&str>) -> Result<()> {
    // Caching is optional; an unset REDIS_URL just disables it.
    let Some(redis_url) = redis_url else {
        return Ok(());
    };

    let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;

    let mut conn = client
        .get_multiplexed_tokio_connection()
        .await
        .context("Failed to connect to Redis")?;

    redis::cmd("PING")
        .query_async::<_, String>(&mut conn)
        .await
        .context("Redis PING failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            database_url: "postgres://localhost:5432/bankledger".to_string(),
            redis_url: Some("redis://localhost:6379".to_string()),
            db_max_connections: 5,
            scheduler_interval_secs: 30,
            scheduler_batch_limit: 10,
            projector_interval_secs: 60,
            projector_overlap_secs: 300,
            operation_timeout_ms: 10_000,
        }
    }

    #[test]
    fn test_validate_env_vars_accepts_sample_config() {
        assert!(validate_env_vars(&sample()).is_ok());
    }

    #[test]
    fn test_validate_env_vars_empty_database_url() {
        let mut config = sample();
        config.database_url = String::new();
        assert!(validate_env_vars(&config).is_err());
    }

    #[test]
    fn test_validate_env_vars_invalid_redis_url() {
        let mut config = sample();
        config.redis_url = Some("not-a-url".to_string());
        assert!(validate_env_vars(&config).is_err());
    }

    #[test]
    fn test_validate_env_vars_zero_batch_limit() {
        let mut config = sample();
        config.scheduler_batch_limit = 0;
        assert!(validate_env_vars(&config).is_err());
    }

    #[tokio::test]
    async fn test_validate_redis_skips_when_unset() {
        assert!(validate_redis(None).await.is_ok());
    }
}
