pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod services;
pub mod startup;
pub mod worker;

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::error::AppError;
use crate::services::{
    AuditRecorder, BalanceService, CacheService, EventPublisher, ProjectorService,
    SchedulerService, TransactionProcessor,
};

/// The wired service graph. Everything shares the one pool; the cache is
/// optional and absent when no Redis URL is configured.
#[derive(Clone)]
pub struct Services {
    pub balances: BalanceService,
    pub processor: TransactionProcessor,
    pub scheduler: SchedulerService,
    pub projector: ProjectorService,
}

impl Services {
    pub fn new(config: &Config, pool: PgPool) -> Result<Self, AppError> {
        let audit: Arc<dyn services::AuditSink> = Arc::new(AuditRecorder::new(pool.clone()));
        let cache = match &config.redis_url {
            Some(url) => Some(CacheService::new(url)?),
            None => None,
        };
        let publisher = EventPublisher::new(pool.clone());

        let balances = BalanceService::new(pool.clone(), cache.clone());
        let processor = TransactionProcessor::new(
            pool.clone(),
            publisher,
            audit.clone(),
            cache,
            config.operation_timeout(),
        );
        let scheduler = SchedulerService::new(
            pool.clone(),
            processor.clone(),
            audit,
            config.scheduler_batch_limit,
        );
        let projector = ProjectorService::new(pool, config.projector_overlap_secs);

        Ok(Self {
            balances,
            processor,
            scheduler,
            projector,
        })
    }
}
