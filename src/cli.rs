use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config::Config;
use crate::Services;

#[derive(Parser)]
#[command(name = "bankledger")]
#[command(about = "Bankledger - Balance, Transaction and Projection Engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run migrations and start the scheduler and projector workers (default)
    Serve,

    /// Transaction management commands
    #[command(subcommand)]
    Tx(TxCommands),

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Read model management commands
    #[command(subcommand)]
    Projector(ProjectorCommands),

    /// Configuration validation
    Config,
}

#[derive(Subcommand)]
pub enum TxCommands {
    /// Roll back a settled transaction without the participant check
    Rollback {
        /// Transaction UUID
        #[arg(value_name = "TX_ID")]
        tx_id: Uuid,

        /// Admin user recorded as the initiator of the rollback
        #[arg(short, long)]
        requested_by: Uuid,
    },
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

#[derive(Subcommand)]
pub enum ProjectorCommands {
    /// Drop all read models and replay the full event history
    Rebuild,

    /// Run a single incremental catch-up cycle
    CatchUp,
}

pub async fn handle_tx_rollback(
    config: &Config,
    tx_id: Uuid,
    requested_by: Uuid,
) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;
    let services = Services::new(config, pool)?;

    tracing::info!("Rolling back transaction {}", tx_id);
    let compensation = services.processor.rollback_by_admin(tx_id, requested_by).await?;

    println!(
        "✓ Transaction {} rolled back by compensating transaction {}",
        tx_id, compensation.id
    );
    Ok(())
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    use sqlx::migrate::Migrator;
    use std::path::Path;

    let pool = crate::db::create_pool(config).await?;
    let migrator = Migrator::new(Path::new("./migrations")).await?;

    tracing::info!("Running database migrations...");
    migrator.run(&pool).await?;

    tracing::info!("Database migrations completed");
    println!("✓ Database migrations completed");

    Ok(())
}

pub async fn handle_projector_rebuild(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;
    let services = Services::new(config, pool)?;

    tracing::info!("Rebuilding read models from event history...");
    let report = services.projector.rebuild_all().await?;
    if !report.acquired {
        anyhow::bail!("Another projector instance holds the lease; try again later");
    }

    println!("✓ Read models rebuilt:");
    println!("  Aggregates refreshed: {}", report.aggregates_refreshed);
    println!("  Fold errors:          {}", report.fold_errors);

    Ok(())
}

pub async fn handle_projector_catch_up(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;
    let services = Services::new(config, pool)?;

    let report = services.projector.catch_up().await?;
    if !report.acquired {
        anyhow::bail!("Another projector instance holds the lease; try again later");
    }

    println!("✓ Catch-up cycle complete:");
    println!("  Events seen:          {}", report.events_seen);
    println!("  Aggregates refreshed: {}", report.aggregates_refreshed);
    println!("  Fold errors:          {}", report.fold_errors);

    Ok(())
}

pub fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");

    println!("Configuration:");
    println!("  Database URL: {}", mask_password(&config.database_url));
    match &config.redis_url {
        Some(url) => println!("  Redis URL: {}", mask_password(url)),
        None => println!("  Redis URL: (unset, caching disabled)"),
    }
    println!("  DB Max Connections: {}", config.db_max_connections);
    println!("  Scheduler Interval: {}s", config.scheduler_interval_secs);
    println!("  Scheduler Batch Limit: {}", config.scheduler_batch_limit);
    println!("  Projector Interval: {}s", config.projector_interval_secs);
    println!("  Projector Overlap: {}s", config.projector_overlap_secs);
    println!("  Operation Timeout: {}ms", config.operation_timeout_ms);

    tracing::info!("Configuration is valid");
    println!("✓ Configuration is valid");

    Ok(())
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if let Some(slash_pos) = url[..colon_pos].rfind("//") {
                let prefix = &url[..slash_pos + 2];
                let user_start = slash_pos + 2;
                let user = &url[user_start..colon_pos];
                let suffix = &url[at_pos..];
                return format!("{}{}:****{}", prefix, user, suffix);
            }
        }
    }
    url.to_string()
}
