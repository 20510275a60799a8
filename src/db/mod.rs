use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::Config;

pub mod audit;
pub mod balances;
pub mod events;
pub mod models;
pub mod projections;
pub mod scheduled;
pub mod transactions;

pub async fn create_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
}
