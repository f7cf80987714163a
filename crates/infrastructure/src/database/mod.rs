pub mod postgres;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

use placesync_core::config::DatabaseConfig;
use placesync_core::PipelineResult;

pub async fn connect_pool(config: &DatabaseConfig) -> PipelineResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
        .connect(&config.url)
        .await?;
    info!("Connected to Postgres (max_connections={})", config.max_connections);
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> PipelineResult<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| {
            placesync_core::PipelineError::database_error(format!("migration failed: {e}"))
        })?;
    Ok(())
}
