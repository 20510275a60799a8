use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::services::{ProjectorService, SchedulerService};

/// Runs the scheduled transaction loop. Each cycle claims due rows with
/// `SELECT ... FOR UPDATE SKIP LOCKED`, so several workers can run against
/// the same database without executing a schedule twice.
pub async fn run_scheduler(
    scheduler: SchedulerService,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Scheduled transaction worker started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("Scheduled transaction worker stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = scheduler.process_due().await {
                    error!("Scheduler cycle error: {}", e);
                }
            }
        }
    }
}

/// Runs the projection catch-up loop. Cycles are serialized across
/// instances by an advisory lock, so running this alongside other workers
/// is safe; extra instances just skip their turn.
pub async fn run_projector(
    projector: ProjectorService,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Projection worker started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("Projection worker stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = projector.catch_up().await {
                    error!("Projector cycle error: {}", e);
                }
            }
        }
    }
}
