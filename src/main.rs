use std::path::Path;
use std::time::Duration;

use clap::Parser;
use sqlx::migrate::Migrator;
use tokio::sync::watch;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bankledger::cli::{self, Cli, Commands, DbCommands, ProjectorCommands, TxCommands};
use bankledger::{config, db, startup, worker, Services};

const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::Config::from_env()?;

    // Setup logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Some(Commands::Tx(TxCommands::Rollback {
            tx_id,
            requested_by,
        })) => cli::handle_tx_rollback(&config, tx_id, requested_by).await,
        Some(Commands::Db(DbCommands::Migrate)) => cli::handle_db_migrate(&config).await,
        Some(Commands::Projector(ProjectorCommands::Rebuild)) => {
            cli::handle_projector_rebuild(&config).await
        }
        Some(Commands::Projector(ProjectorCommands::CatchUp)) => {
            cli::handle_projector_catch_up(&config).await
        }
        Some(Commands::Config) => cli::handle_config_validate(&config),
        Some(Commands::Serve) | None => serve(config).await,
    }
}

async fn serve(config: config::Config) -> anyhow::Result<()> {
    // Database pool
    let pool = db::create_pool(&config).await?;

    // Run migrations
    let migrator = Migrator::new(Path::new("./migrations")).await?;
    migrator.run(&pool).await?;
    tracing::info!("Database migrations completed");

    let report = startup::validate_environment(&config, &pool).await?;
    report.print();
    if !report.is_valid() {
        anyhow::bail!("Startup validation failed");
    }

    let services = Services::new(&config, pool)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(worker::run_scheduler(
        services.scheduler.clone(),
        config.scheduler_interval(),
        shutdown_rx.clone(),
    ));
    let projector_handle = tokio::spawn(worker::run_projector(
        services.projector.clone(),
        config.projector_interval(),
        shutdown_rx,
    ));
    tracing::info!("Workers running; press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, draining workers");
    let _ = shutdown_tx.send(true);

    let drain = async {
        let _ = scheduler_handle.await;
        let _ = projector_handle.await;
    };
    if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("Workers did not stop in time, exiting anyway");
    }

    Ok(())
}
