mod connection;

pub use connection::RedisConnection;

use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

use placesync_core::config::RedisConfig;
use placesync_core::{PipelineError, PipelineResult};
use placesync_domain::{
    CoordinationStore, QueueDepths, StatCounter, TaskProgress, TaskSet, UpdateTask, WorkerInfo,
};

/// Coordination store key schema. These names are the wire contract
/// shared with the operators' tooling; do not rename.
mod keys {
    pub const PENDING: &str = "update:pending";
    pub const PRIORITY: &str = "update:priority";
    pub const PROCESSING: &str = "update:processing";
    pub const COMPLETED: &str = "update:completed";
    pub const FAILED: &str = "update:failed";
    pub const DELETED: &str = "update:deleted";
    pub const STATS: &str = "update:stats";
    pub const WORKERS: &str = "workers:registry";

    pub fn progress(task_id: &str) -> String {
        format!("update:progress:{task_id}")
    }
}

const PROGRESS_TTL_SECONDS: i64 = 24 * 60 * 60;

fn set_key(set: TaskSet) -> &'static str {
    match set {
        TaskSet::Completed => keys::COMPLETED,
        TaskSet::Failed => keys::FAILED,
        TaskSet::Deleted => keys::DELETED,
    }
}

fn store_err(op: &str, e: redis::RedisError) -> PipelineError {
    PipelineError::store_error(format!("{op}: {e}"))
}

/// Redis-backed coordination store over list/set/hash primitives.
pub struct RedisStore {
    connection: RedisConnection,
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig) -> PipelineResult<Self> {
        let connection = RedisConnection::connect(config).await?;
        Ok(Self { connection })
    }

    pub fn from_connection(connection: RedisConnection) -> Self {
        Self { connection }
    }

    pub async fn health_check(&self) -> bool {
        self.connection.ping().await.is_ok()
    }

    fn serialize_task(task: &UpdateTask) -> PipelineResult<String> {
        Ok(serde_json::to_string(task)?)
    }

    fn deserialize_task(payload: &str) -> PipelineResult<UpdateTask> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn push_pending(&self, task: &UpdateTask) -> PipelineResult<()> {
        let payload = Self::serialize_task(task)?;
        let mut conn = self.connection.manager();
        let _: () = conn
            .rpush(keys::PENDING, payload)
            .await
            .map_err(|e| store_err("RPUSH pending", e))?;
        Ok(())
    }

    async fn push_priority(&self, task: &UpdateTask) -> PipelineResult<()> {
        let payload = Self::serialize_task(task)?;
        let mut conn = self.connection.manager();
        let _: () = conn
            .rpush(keys::PRIORITY, payload)
            .await
            .map_err(|e| store_err("RPUSH priority", e))?;
        Ok(())
    }

    async fn pop_priority(&self) -> PipelineResult<Option<UpdateTask>> {
        let mut conn = self.connection.manager();
        let payload: Option<String> = conn
            .lpop(keys::PRIORITY, None)
            .await
            .map_err(|e| store_err("LPOP priority", e))?;
        payload.map(|p| Self::deserialize_task(&p)).transpose()
    }

    async fn pop_pending(&self, timeout: Duration) -> PipelineResult<Option<UpdateTask>> {
        let mut conn = self.connection.manager();
        let popped: Option<(String, String)> = conn
            .blpop(keys::PENDING, timeout.as_secs_f64())
            .await
            .map_err(|e| store_err("BLPOP pending", e))?;
        popped
            .map(|(_, payload)| Self::deserialize_task(&payload))
            .transpose()
    }

    async fn add_processing(&self, task_id: &str) -> PipelineResult<()> {
        let mut conn = self.connection.manager();
        let _: () = conn
            .sadd(keys::PROCESSING, task_id)
            .await
            .map_err(|e| store_err("SADD processing", e))?;
        Ok(())
    }

    async fn remove_processing(&self, task_id: &str) -> PipelineResult<()> {
        let mut conn = self.connection.manager();
        let _: () = conn
            .srem(keys::PROCESSING, task_id)
            .await
            .map_err(|e| store_err("SREM processing", e))?;
        Ok(())
    }

    async fn add_to_set(&self, set: TaskSet, place_id: i64) -> PipelineResult<()> {
        let mut conn = self.connection.manager();
        let _: () = conn
            .sadd(set_key(set), place_id)
            .await
            .map_err(|e| store_err("SADD", e))?;
        Ok(())
    }

    async fn remove_from_set(&self, set: TaskSet, place_id: i64) -> PipelineResult<()> {
        let mut conn = self.connection.manager();
        let _: () = conn
            .srem(set_key(set), place_id)
            .await
            .map_err(|e| store_err("SREM", e))?;
        Ok(())
    }

    async fn set_members(&self, set: TaskSet) -> PipelineResult<Vec<i64>> {
        let mut conn = self.connection.manager();
        let members: Vec<String> = conn
            .smembers(set_key(set))
            .await
            .map_err(|e| store_err("SMEMBERS", e))?;
        let mut ids = Vec::with_capacity(members.len());
        for member in members {
            let id = member.parse::<i64>().map_err(|_| {
                PipelineError::store_error(format!("non-numeric set member: {member}"))
            })?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn queue_depths(&self) -> PipelineResult<QueueDepths> {
        let mut conn = self.connection.manager();
        let pending: u64 = conn
            .llen(keys::PENDING)
            .await
            .map_err(|e| store_err("LLEN pending", e))?;
        let priority: u64 = conn
            .llen(keys::PRIORITY)
            .await
            .map_err(|e| store_err("LLEN priority", e))?;
        let processing: u64 = conn
            .scard(keys::PROCESSING)
            .await
            .map_err(|e| store_err("SCARD processing", e))?;
        let completed: u64 = conn
            .scard(keys::COMPLETED)
            .await
            .map_err(|e| store_err("SCARD completed", e))?;
        let failed: u64 = conn
            .scard(keys::FAILED)
            .await
            .map_err(|e| store_err("SCARD failed", e))?;
        let deleted: u64 = conn
            .scard(keys::DELETED)
            .await
            .map_err(|e| store_err("SCARD deleted", e))?;
        Ok(QueueDepths {
            pending,
            priority,
            processing,
            completed,
            failed,
            deleted,
        })
    }

    async fn incr_stat(&self, counter: StatCounter) -> PipelineResult<()> {
        let mut conn = self.connection.manager();
        let _: () = conn
            .hincr(keys::STATS, counter.field_name(), 1i64)
            .await
            .map_err(|e| store_err("HINCRBY stats", e))?;
        Ok(())
    }

    async fn stat_counters(&self) -> PipelineResult<HashMap<String, u64>> {
        let mut conn = self.connection.manager();
        let raw: HashMap<String, String> = conn
            .hgetall(keys::STATS)
            .await
            .map_err(|e| store_err("HGETALL stats", e))?;
        Ok(raw
            .into_iter()
            .filter_map(|(field, value)| value.parse::<u64>().ok().map(|v| (field, v)))
            .collect())
    }

    async fn write_progress(&self, task_id: &str, progress: &TaskProgress) -> PipelineResult<()> {
        let key = keys::progress(task_id);
        let fields = progress.to_fields();
        let mut conn = self.connection.manager();
        let _: () = conn
            .hset_multiple(&key, &fields)
            .await
            .map_err(|e| store_err("HSET progress", e))?;
        let _: () = conn
            .expire(&key, PROGRESS_TTL_SECONDS)
            .await
            .map_err(|e| store_err("EXPIRE progress", e))?;
        Ok(())
    }

    async fn get_progress(&self, task_id: &str) -> PipelineResult<Option<TaskProgress>> {
        let key = keys::progress(task_id);
        let mut conn = self.connection.manager();
        let fields: HashMap<String, String> = conn
            .hgetall(&key)
            .await
            .map_err(|e| store_err("HGETALL progress", e))?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(TaskProgress::from_fields(&fields))
    }

    async fn register_worker(&self, info: &WorkerInfo) -> PipelineResult<()> {
        let payload = serde_json::to_string(info)?;
        let mut conn = self.connection.manager();
        let _: () = conn
            .hset(keys::WORKERS, &info.worker_id, payload)
            .await
            .map_err(|e| store_err("HSET workers", e))?;
        Ok(())
    }

    async fn remove_worker(&self, worker_id: &str) -> PipelineResult<()> {
        let mut conn = self.connection.manager();
        let _: () = conn
            .hdel(keys::WORKERS, worker_id)
            .await
            .map_err(|e| store_err("HDEL workers", e))?;
        Ok(())
    }

    async fn workers(&self) -> PipelineResult<HashMap<String, WorkerInfo>> {
        let mut conn = self.connection.manager();
        let raw: HashMap<String, String> = conn
            .hgetall(keys::WORKERS)
            .await
            .map_err(|e| store_err("HGETALL workers", e))?;
        let mut workers = HashMap::with_capacity(raw.len());
        for (worker_id, payload) in raw {
            let info: WorkerInfo = serde_json::from_str(&payload)?;
            workers.insert(worker_id, info);
        }
        Ok(workers)
    }
}
