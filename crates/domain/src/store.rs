use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use placesync_core::PipelineResult;

use crate::entities::{TaskProgress, UpdateTask, WorkerInfo};

/// Terminal/result sets tracked per place id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskSet {
    Completed,
    Failed,
    Deleted,
}

/// Monotonic counters in the `update:stats` hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatCounter {
    Completed,
    Failed,
    Retried,
    NotFound,
}

impl StatCounter {
    pub fn field_name(&self) -> &'static str {
        match self {
            StatCounter::Completed => "totalCompleted",
            StatCounter::Failed => "totalFailed",
            StatCounter::Retried => "totalRetried",
            StatCounter::NotFound => "totalNotFound",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDepths {
    pub pending: u64,
    pub priority: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub deleted: u64,
}

/// The shared coordination store: queues, result sets, per-task
/// progress and the worker registry. The single source of truth for
/// in-flight work and worker liveness.
///
/// All operations are single-key/single-collection and atomic at the
/// store level; no multi-key transactions are assumed.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Appends a task to the FIFO pending queue.
    async fn push_pending(&self, task: &UpdateTask) -> PipelineResult<()>;

    /// Appends a task to the priority queue, drained before pending.
    async fn push_priority(&self, task: &UpdateTask) -> PipelineResult<()>;

    /// Non-blocking pop from the priority queue.
    async fn pop_priority(&self) -> PipelineResult<Option<UpdateTask>>;

    /// Blocking pop from the pending queue, bounded by `timeout` so
    /// worker loops stay responsive to shutdown.
    async fn pop_pending(&self, timeout: Duration) -> PipelineResult<Option<UpdateTask>>;

    async fn add_processing(&self, task_id: &str) -> PipelineResult<()>;
    async fn remove_processing(&self, task_id: &str) -> PipelineResult<()>;

    async fn add_to_set(&self, set: TaskSet, place_id: i64) -> PipelineResult<()>;
    async fn remove_from_set(&self, set: TaskSet, place_id: i64) -> PipelineResult<()>;
    async fn set_members(&self, set: TaskSet) -> PipelineResult<Vec<i64>>;

    async fn queue_depths(&self) -> PipelineResult<QueueDepths>;

    async fn incr_stat(&self, counter: StatCounter) -> PipelineResult<()>;
    async fn stat_counters(&self) -> PipelineResult<HashMap<String, u64>>;

    /// Writes the full progress hash for a task (TTL-bounded).
    async fn write_progress(&self, task_id: &str, progress: &TaskProgress) -> PipelineResult<()>;
    async fn get_progress(&self, task_id: &str) -> PipelineResult<Option<TaskProgress>>;

    /// Inserts or overwrites the registry entry for a worker.
    async fn register_worker(&self, info: &WorkerInfo) -> PipelineResult<()>;
    async fn remove_worker(&self, worker_id: &str) -> PipelineResult<()>;
    async fn workers(&self) -> PipelineResult<HashMap<String, WorkerInfo>>;
}
