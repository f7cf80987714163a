use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use placesync_core::PipelineResult;
use placesync_domain::{
    CoordinationStore, QueueDepths, StatCounter, TaskProgress, TaskSet, UpdateTask, WorkerInfo,
};

#[derive(Default)]
struct Inner {
    pending: VecDeque<String>,
    priority: VecDeque<String>,
    processing: HashSet<String>,
    sets: HashMap<TaskSet, HashSet<i64>>,
    counters: HashMap<String, u64>,
    progress: HashMap<String, TaskProgress>,
    workers: HashMap<String, WorkerInfo>,
}

/// In-memory coordination store. Queues hold the same JSON payloads the
/// Redis store would, so serialization stays on the tested path.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    pending_notify: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn push_pending(&self, task: &UpdateTask) -> PipelineResult<()> {
        let payload = serde_json::to_string(task)?;
        self.inner.lock().await.pending.push_back(payload);
        self.pending_notify.notify_one();
        Ok(())
    }

    async fn push_priority(&self, task: &UpdateTask) -> PipelineResult<()> {
        let payload = serde_json::to_string(task)?;
        self.inner.lock().await.priority.push_back(payload);
        Ok(())
    }

    async fn pop_priority(&self) -> PipelineResult<Option<UpdateTask>> {
        let payload = self.inner.lock().await.priority.pop_front();
        payload
            .map(|p| serde_json::from_str(&p).map_err(Into::into))
            .transpose()
    }

    async fn pop_pending(&self, timeout: Duration) -> PipelineResult<Option<UpdateTask>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.inner.lock().await.pending.pop_front() {
                return Ok(Some(serde_json::from_str(&payload)?));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, self.pending_notify.notified()).await;
        }
    }

    async fn add_processing(&self, task_id: &str) -> PipelineResult<()> {
        self.inner
            .lock()
            .await
            .processing
            .insert(task_id.to_string());
        Ok(())
    }

    async fn remove_processing(&self, task_id: &str) -> PipelineResult<()> {
        self.inner.lock().await.processing.remove(task_id);
        Ok(())
    }

    async fn add_to_set(&self, set: TaskSet, place_id: i64) -> PipelineResult<()> {
        self.inner
            .lock()
            .await
            .sets
            .entry(set)
            .or_default()
            .insert(place_id);
        Ok(())
    }

    async fn remove_from_set(&self, set: TaskSet, place_id: i64) -> PipelineResult<()> {
        if let Some(members) = self.inner.lock().await.sets.get_mut(&set) {
            members.remove(&place_id);
        }
        Ok(())
    }

    async fn set_members(&self, set: TaskSet) -> PipelineResult<Vec<i64>> {
        Ok(self
            .inner
            .lock()
            .await
            .sets
            .get(&set)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn queue_depths(&self) -> PipelineResult<QueueDepths> {
        let inner = self.inner.lock().await;
        let set_len = |set: TaskSet| inner.sets.get(&set).map(|s| s.len() as u64).unwrap_or(0);
        Ok(QueueDepths {
            pending: inner.pending.len() as u64,
            priority: inner.priority.len() as u64,
            processing: inner.processing.len() as u64,
            completed: set_len(TaskSet::Completed),
            failed: set_len(TaskSet::Failed),
            deleted: set_len(TaskSet::Deleted),
        })
    }

    async fn incr_stat(&self, counter: StatCounter) -> PipelineResult<()> {
        *self
            .inner
            .lock()
            .await
            .counters
            .entry(counter.field_name().to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn stat_counters(&self) -> PipelineResult<HashMap<String, u64>> {
        Ok(self.inner.lock().await.counters.clone())
    }

    async fn write_progress(&self, task_id: &str, progress: &TaskProgress) -> PipelineResult<()> {
        self.inner
            .lock()
            .await
            .progress
            .insert(task_id.to_string(), progress.clone());
        Ok(())
    }

    async fn get_progress(&self, task_id: &str) -> PipelineResult<Option<TaskProgress>> {
        Ok(self.inner.lock().await.progress.get(task_id).cloned())
    }

    async fn register_worker(&self, info: &WorkerInfo) -> PipelineResult<()> {
        self.inner
            .lock()
            .await
            .workers
            .insert(info.worker_id.clone(), info.clone());
        Ok(())
    }

    async fn remove_worker(&self, worker_id: &str) -> PipelineResult<()> {
        self.inner.lock().await.workers.remove(worker_id);
        Ok(())
    }

    async fn workers(&self) -> PipelineResult<HashMap<String, WorkerInfo>> {
        Ok(self.inner.lock().await.workers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use placesync_domain::UpdateFlags;

    #[tokio::test]
    async fn pending_queue_is_fifo() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let first = UpdateTask::with_task_id("a", 1, UpdateFlags::default());
        let second = UpdateTask::with_task_id("b", 2, UpdateFlags::default());
        store.push_pending(&first).await?;
        store.push_pending(&second).await?;

        let popped = store.pop_pending(Duration::from_millis(10)).await?;
        assert_eq!(popped.unwrap().task_id, "a");
        let popped = store.pop_pending(Duration::from_millis(10)).await?;
        assert_eq!(popped.unwrap().task_id, "b");
        Ok(())
    }

    #[tokio::test]
    async fn blocking_pop_times_out_on_empty_queue() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let start = std::time::Instant::now();
        let popped = store.pop_pending(Duration::from_millis(50)).await?;
        assert!(popped.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
        Ok(())
    }

    #[tokio::test]
    async fn blocking_pop_wakes_on_push() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let waiter = store.clone();
        let handle =
            tokio::spawn(async move { waiter.pop_pending(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .push_pending(&UpdateTask::with_task_id("t", 3, UpdateFlags::default()))
            .await?;

        let popped = handle.await??;
        assert_eq!(popped.unwrap().place_id, 3);
        Ok(())
    }

    #[tokio::test]
    async fn depths_reflect_set_membership() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.add_to_set(TaskSet::Completed, 1).await?;
        store.add_to_set(TaskSet::Completed, 1).await?;
        store.add_to_set(TaskSet::Failed, 2).await?;
        store.add_processing("t1").await?;

        let depths = store.queue_depths().await?;
        assert_eq!(depths.completed, 1);
        assert_eq!(depths.failed, 1);
        assert_eq!(depths.processing, 1);
        Ok(())
    }
}
