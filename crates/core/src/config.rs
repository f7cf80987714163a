use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, PipelineResult};

/// Top-level application configuration.
///
/// Loaded from an optional TOML file plus `PLACESYNC_` environment
/// overrides (double underscore as section separator, e.g.
/// `PLACESYNC_REDIS__HOST`). Every section has working defaults so an
/// empty file is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub redis: RedisConfig,
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub monitor: MonitorConfig,
    pub sharding: ShardingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: i64,
    pub password: Option<String>,
    pub connection_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            password: None,
            connection_timeout_seconds: 30,
        }
    }
}

impl RedisConfig {
    pub fn build_connection_url(&self) -> String {
        if let Some(password) = &self.password {
            format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.database
            )
        } else {
            format!("redis://{}:{}/{}", self.host, self.port, self.database)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/placesync".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Stable worker id; generated from hostname + pid when absent.
    pub worker_id: Option<String>,
    /// Number of concurrent pop/process loops per worker process.
    pub threads: usize,
    pub max_attempts: u32,
    pub backoff_base_seconds: f64,
    pub backoff_multiplier: f64,
    /// Blocking pop timeout on the pending queue; bounds loop latency
    /// for shutdown and priority re-checks.
    pub pending_pop_timeout_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    /// Upper bound on how long `stop()` waits for in-flight tasks.
    pub shutdown_grace_seconds: u64,
    /// Sleep after a store/serialization error before the loop retries.
    pub error_sleep_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            threads: 4,
            max_attempts: 5,
            backoff_base_seconds: 2.0,
            backoff_multiplier: 1.0,
            pending_pop_timeout_seconds: 5,
            heartbeat_interval_seconds: 10,
            shutdown_grace_seconds: 30,
            error_sleep_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Workers silent for longer than this are evicted from the registry.
    /// Must comfortably exceed the worker heartbeat interval.
    pub stale_worker_timeout_seconds: i64,
    pub cleanup_interval_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stale_worker_timeout_seconds: 120,
            cleanup_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    pub total_workers: i64,
    pub worker_id: i64,
    pub page_size: i64,
    /// Resume from the last checkpointed id instead of the table start.
    pub resume_from_checkpoint: bool,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            total_workers: 1,
            worker_id: 0,
            page_size: 500,
            resume_from_checkpoint: false,
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> PipelineResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("PLACESYNC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| PipelineError::config_error(format!("failed to load config: {e}")))?;

        let config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| PipelineError::config_error(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.worker.threads == 0 {
            return Err(PipelineError::config_error("worker.threads must be > 0"));
        }
        if self.worker.max_attempts == 0 {
            return Err(PipelineError::config_error(
                "worker.max_attempts must be > 0",
            ));
        }
        if self.worker.backoff_base_seconds <= 0.0 {
            return Err(PipelineError::config_error(
                "worker.backoff_base_seconds must be > 0",
            ));
        }
        if self.monitor.stale_worker_timeout_seconds
            <= self.worker.heartbeat_interval_seconds as i64
        {
            return Err(PipelineError::config_error(
                "monitor.stale_worker_timeout_seconds must exceed the heartbeat interval",
            ));
        }
        if self.sharding.total_workers <= 0 {
            return Err(PipelineError::config_error(
                "sharding.total_workers must be > 0",
            ));
        }
        if self.sharding.worker_id < 0 || self.sharding.worker_id >= self.sharding.total_workers {
            return Err(PipelineError::config_error(
                "sharding.worker_id must be in [0, total_workers)",
            ));
        }
        if self.sharding.page_size <= 0 {
            return Err(PipelineError::config_error(
                "sharding.page_size must be > 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker.threads, 4);
        assert_eq!(config.monitor.stale_worker_timeout_seconds, 120);
    }

    #[test]
    fn redis_url_with_and_without_password() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.build_connection_url(), "redis://127.0.0.1:6379/0");
        redis.password = Some("secret".to_string());
        assert_eq!(
            redis.build_connection_url(),
            "redis://:secret@127.0.0.1:6379/0"
        );
    }

    #[test]
    fn stale_timeout_must_exceed_heartbeat_interval() {
        let mut config = AppConfig::default();
        config.monitor.stale_worker_timeout_seconds = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn shard_worker_id_must_be_in_range() {
        let mut config = AppConfig::default();
        config.sharding.total_workers = 3;
        config.sharding.worker_id = 3;
        assert!(config.validate().is_err());
        config.sharding.worker_id = 2;
        assert!(config.validate().is_ok());
    }
}
