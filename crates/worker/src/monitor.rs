use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

use placesync_core::config::MonitorConfig;
use placesync_core::PipelineResult;
use placesync_domain::{
    CoordinationStore, QueueStats, TaskProgress, TaskSet, UpdateFlags, UpdateTask, WorkerStatus,
};

/// Read-side aggregation over the coordination store plus the
/// maintenance operations that repair stuck work.
pub struct QueueMonitor {
    store: Arc<dyn CoordinationStore>,
    config: MonitorConfig,
    hostname: String,
}

impl QueueMonitor {
    pub fn new(store: Arc<dyn CoordinationStore>, config: MonitorConfig) -> Self {
        let hostname = hostname::get()
            .unwrap_or_else(|_| "unknown".into())
            .to_string_lossy()
            .to_string();
        Self {
            store,
            config,
            hostname,
        }
    }

    /// Overrides the hostname used for `local_only` filtering.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Queue/set depths, counters and the worker registry. With
    /// `local_only`, workers are filtered to this host's fleet.
    pub async fn queue_stats(&self, local_only: bool) -> PipelineResult<QueueStats> {
        let depths = self.store.queue_depths().await?;
        let counters = self.store.stat_counters().await?;
        let mut workers = self.store.workers().await?;

        if local_only {
            workers.retain(|_, info| info.hostname == self.hostname);
        }
        let active_workers = workers
            .values()
            .filter(|info| info.status == WorkerStatus::Active)
            .count();

        Ok(QueueStats {
            pending: depths.pending,
            priority: depths.priority,
            processing: depths.processing,
            completed: depths.completed,
            failed: depths.failed,
            deleted: depths.deleted,
            counters,
            workers,
            active_workers,
        })
    }

    pub async fn task_progress(&self, task_id: &str) -> PipelineResult<Option<TaskProgress>> {
        self.store.get_progress(task_id).await
    }

    /// Drains the failed set into fresh pending tasks (attempts = 0)
    /// carrying the given flags. Returns the number of tasks requeued;
    /// safe to call repeatedly.
    pub async fn retry_failed_tasks(&self, flags: UpdateFlags) -> PipelineResult<usize> {
        let failed = self.store.set_members(TaskSet::Failed).await?;
        let mut requeued = 0;
        for place_id in failed {
            let task = UpdateTask::new(place_id, flags);
            self.store.push_pending(&task).await?;
            self.store.remove_from_set(TaskSet::Failed, place_id).await?;
            requeued += 1;
        }
        if requeued > 0 {
            info!("Requeued {} failed task(s)", requeued);
        }
        Ok(requeued)
    }

    /// Evicts registry entries whose heartbeat is older than the
    /// staleness threshold. This reclaims capacity after a worker dies
    /// without a graceful shutdown.
    pub async fn cleanup_stale_workers(&self) -> PipelineResult<Vec<String>> {
        let now = Utc::now();
        let workers = self.store.workers().await?;
        let mut evicted = Vec::new();

        for (worker_id, info) in workers {
            if info.is_stale(now, self.config.stale_worker_timeout_seconds) {
                warn!(
                    "Evicting stale worker {} (last heartbeat {}, status {:?})",
                    worker_id, info.last_heartbeat, info.status
                );
                self.store.remove_worker(&worker_id).await?;
                evicted.push(worker_id);
            }
        }
        Ok(evicted)
    }

    /// Runs the stale-worker sweep on a fixed schedule until shutdown.
    pub fn start_maintenance(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let mut sweep_interval =
            interval(Duration::from_secs(self.config.cleanup_interval_seconds));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sweep_interval.tick() => {
                        match self.cleanup_stale_workers().await {
                            Ok(evicted) if !evicted.is_empty() => {
                                info!("Maintenance sweep evicted {} worker(s)", evicted.len());
                            }
                            Ok(_) => {}
                            Err(e) => error!("Stale-worker sweep failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Maintenance task shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use placesync_infrastructure::MemoryStore;
    use placesync_domain::WorkerInfo;

    fn monitor_with(store: Arc<dyn CoordinationStore>) -> QueueMonitor {
        QueueMonitor::new(store, MonitorConfig::default()).with_hostname("host-a")
    }

    #[tokio::test]
    async fn retry_failed_drains_the_set_into_fresh_tasks() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        for place_id in [1i64, 2, 3] {
            store.add_to_set(TaskSet::Failed, place_id).await?;
        }
        let monitor = monitor_with(store.clone());

        let flags = UpdateFlags {
            update_menus: true,
            ..Default::default()
        };
        let requeued = monitor.retry_failed_tasks(flags).await?;
        assert_eq!(requeued, 3);
        assert!(store.set_members(TaskSet::Failed).await?.is_empty());

        let mut place_ids = Vec::new();
        for _ in 0..3 {
            let task = store
                .pop_pending(Duration::from_millis(10))
                .await?
                .expect("pending task");
            assert_eq!(task.attempts, 0);
            assert!(task.flags.update_menus);
            assert!(!task.flags.update_images);
            place_ids.push(task.place_id);
        }
        place_ids.sort_unstable();
        assert_eq!(place_ids, vec![1, 2, 3]);

        // Second call drains nothing.
        assert_eq!(monitor.retry_failed_tasks(flags).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn stale_workers_are_evicted_fresh_ones_kept() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();

        let mut stale = WorkerInfo::new("w-stale", "host-a", 4);
        stale.last_heartbeat = now - chrono::Duration::minutes(3);
        let mut fresh = WorkerInfo::new("w-fresh", "host-a", 4);
        fresh.last_heartbeat = now - chrono::Duration::seconds(30);
        store.register_worker(&stale).await?;
        store.register_worker(&fresh).await?;

        let monitor = monitor_with(store.clone());
        let evicted = monitor.cleanup_stale_workers().await?;
        assert_eq!(evicted, vec!["w-stale".to_string()]);

        let workers = store.workers().await?;
        assert!(!workers.contains_key("w-stale"));
        assert!(workers.contains_key("w-fresh"));
        Ok(())
    }

    #[tokio::test]
    async fn local_only_stats_filter_by_hostname() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let mut local = WorkerInfo::new("w-local", "host-a", 2);
        local.status = WorkerStatus::Active;
        let mut remote = WorkerInfo::new("w-remote", "host-b", 2);
        remote.status = WorkerStatus::Active;
        store.register_worker(&local).await?;
        store.register_worker(&remote).await?;

        let monitor = monitor_with(store.clone());

        let all = monitor.queue_stats(false).await?;
        assert_eq!(all.workers.len(), 2);
        assert_eq!(all.active_workers, 2);

        let local_only = monitor.queue_stats(true).await?;
        assert_eq!(local_only.workers.len(), 1);
        assert!(local_only.workers.contains_key("w-local"));
        assert_eq!(local_only.active_workers, 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_progress_reads_as_none() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor_with(store);
        assert!(monitor.task_progress("no-such-task").await?.is_none());
        Ok(())
    }
}
