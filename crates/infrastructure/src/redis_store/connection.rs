use redis::aio::ConnectionManager;
use redis::Client;
use tracing::debug;

use placesync_core::config::RedisConfig;
use placesync_core::{PipelineError, PipelineResult};

/// Thin wrapper around the redis connection manager. The manager
/// multiplexes and reconnects internally; callers clone it per
/// operation.
#[derive(Clone)]
pub struct RedisConnection {
    manager: ConnectionManager,
}

impl RedisConnection {
    pub async fn connect(config: &RedisConfig) -> PipelineResult<Self> {
        let url = config.build_connection_url();
        let client = Client::open(url).map_err(|e| {
            PipelineError::store_error(format!("failed to create Redis client: {e}"))
        })?;
        let manager = client.get_connection_manager().await.map_err(|e| {
            PipelineError::store_error(format!("failed to connect to Redis: {e}"))
        })?;

        let connection = Self { manager };
        connection.ping().await?;
        debug!(
            "Connected to Redis at {}:{}/{}",
            config.host, config.port, config.database
        );
        Ok(connection)
    }

    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub async fn ping(&self) -> PipelineResult<()> {
        let mut conn = self.manager();
        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| PipelineError::store_error(format!("Redis PING failed: {e}")))?;
        if response == "PONG" {
            Ok(())
        } else {
            Err(PipelineError::store_error(format!(
                "unexpected PING response: {response}"
            )))
        }
    }
}
