//! End-to-end queue flow over the in-memory store: worker, monitor and
//! the failed-set repair path working together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use placesync_core::config::{MonitorConfig, WorkerConfig};
use placesync_domain::{
    CoordinationStore, ProgressStatus, TaskError, TaskHandler, TaskSet, UpdateFlags, UpdateTask,
};
use placesync_infrastructure::{MemoryPlaceRepository, MemoryStore};
use placesync_worker::{QueueMonitor, QueueWorker};

/// Rejects one place with a fatal error until "repaired"; everything
/// else succeeds.
struct BrokenPlaceHandler {
    broken_place: i64,
    repaired: AtomicBool,
}

impl BrokenPlaceHandler {
    fn new(broken_place: i64) -> Self {
        Self {
            broken_place,
            repaired: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TaskHandler for BrokenPlaceHandler {
    async fn run(&self, task: &UpdateTask) -> Result<(), TaskError> {
        if task.place_id == self.broken_place && !self.repaired.load(Ordering::SeqCst) {
            return Err(TaskError::fatal("malformed catalog entry"));
        }
        Ok(())
    }
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        worker_id: Some("it-worker".to_string()),
        threads: 2,
        pending_pop_timeout_seconds: 1,
        shutdown_grace_seconds: 5,
        error_sleep_ms: 10,
        ..Default::default()
    }
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not met within deadline");
}

#[tokio::test]
async fn failed_tasks_can_be_repaired_and_requeued() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let places = Arc::new(MemoryPlaceRepository::new());
    let handler = Arc::new(BrokenPlaceHandler::new(3));

    for place_id in 1..=5 {
        let task = if place_id == 3 {
            UpdateTask::with_task_id("broken-3", place_id, UpdateFlags::all())
        } else {
            UpdateTask::new(place_id, UpdateFlags::all())
        };
        store.push_pending(&task).await?;
    }

    let worker = QueueWorker::builder(
        store.clone(),
        places,
        handler.clone(),
        worker_config(),
    )
    .hostname("it-host".to_string())
    .build();
    worker.start().await?;

    // First pass: four succeed, the broken place fails fatally.
    let first_pass = store.clone();
    wait_until(|| {
        let store = first_pass.clone();
        async move {
            store.set_members(TaskSet::Completed).await.unwrap().len() == 4
                && store.set_members(TaskSet::Failed).await.unwrap().contains(&3)
        }
    })
    .await;

    let monitor = QueueMonitor::new(store.clone(), MonitorConfig::default())
        .with_hostname("it-host");
    let stats = monitor.queue_stats(false).await?;
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.counters.get("totalCompleted"), Some(&4));
    assert_eq!(stats.counters.get("totalFailed"), Some(&1));
    assert_eq!(stats.active_workers, 1);

    // A fatal error skips the retry budget entirely: the task enters
    // the failed set with its attempt count untouched.
    let progress = store
        .get_progress("broken-3")
        .await?
        .expect("progress present");
    assert_eq!(progress.status, ProgressStatus::Failed);
    assert_eq!(progress.attempts, 0);
    assert_eq!(stats.counters.get("totalRetried"), None);

    // Repair the source, requeue the failed set and let the worker
    // drain it.
    handler.repaired.store(true, Ordering::SeqCst);
    let requeued = monitor.retry_failed_tasks(UpdateFlags::all()).await?;
    assert_eq!(requeued, 1);

    let second_pass = store.clone();
    wait_until(|| {
        let store = second_pass.clone();
        async move { store.set_members(TaskSet::Completed).await.unwrap().len() == 5 }
    })
    .await;

    worker.stop().await?;

    assert!(store.set_members(TaskSet::Failed).await?.is_empty());
    let stats = monitor.queue_stats(false).await?;
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.failed, 0);
    // The worker deregistered on graceful shutdown.
    assert!(stats.workers.is_empty());
    Ok(())
}
