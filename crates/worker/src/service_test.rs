use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use placesync_core::config::WorkerConfig;
use placesync_domain::{
    CoordinationStore, PlaceRepository, PlaceStatus, ProgressStatus, TaskError, TaskHandler,
    TaskSet, UpdateFlags, UpdateTask, WorkerStatus,
};
use placesync_infrastructure::{MemoryPlaceRepository, MemoryStore};

use crate::service::QueueWorker;

/// Succeeds after a fixed number of retryable failures.
struct FlakyHandler {
    failures_before_success: u32,
    calls: AtomicU32,
}

impl FlakyHandler {
    fn new(failures_before_success: u32) -> Self {
        Self {
            failures_before_success,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn run(&self, _task: &UpdateTask) -> Result<(), TaskError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            Err(TaskError::retryable("upstream 503"))
        } else {
            Ok(())
        }
    }
}

struct NotFoundHandler;

#[async_trait]
impl TaskHandler for NotFoundHandler {
    async fn run(&self, task: &UpdateTask) -> Result<(), TaskError> {
        Err(TaskError::NotFound {
            place_id: task.place_id,
        })
    }
}

/// Records the order tasks reach the handler.
struct RecordingHandler {
    seen: Mutex<Vec<i64>>,
}

impl RecordingHandler {
    fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn run(&self, task: &UpdateTask) -> Result<(), TaskError> {
        self.seen.lock().await.push(task.place_id);
        Ok(())
    }
}

fn test_config(threads: usize) -> WorkerConfig {
    WorkerConfig {
        worker_id: Some("test-worker".to_string()),
        threads,
        max_attempts: 5,
        backoff_base_seconds: 2.0,
        // Zero multiplier keeps retries immediately due in tests.
        backoff_multiplier: 0.0,
        pending_pop_timeout_seconds: 1,
        heartbeat_interval_seconds: 1,
        shutdown_grace_seconds: 5,
        error_sleep_ms: 10,
    }
}

fn build_worker(
    store: Arc<MemoryStore>,
    places: Arc<MemoryPlaceRepository>,
    handler: Arc<dyn TaskHandler>,
    threads: usize,
) -> QueueWorker {
    QueueWorker::builder(store, places, handler, test_config(threads))
        .hostname("test-host".to_string())
        .build()
}

async fn wait_for<F, Fut>(mut condition: F)
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
async fn task_failing_twice_then_succeeding_lands_in_completed() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let places = Arc::new(MemoryPlaceRepository::new());
    let worker = build_worker(
        store.clone(),
        places,
        Arc::new(FlakyHandler::new(2)),
        1,
    );

    let task = UpdateTask::with_task_id(
        "t1",
        42,
        UpdateFlags {
            update_menus: true,
            ..Default::default()
        },
    );
    store.push_pending(&task).await?;

    worker.start().await?;
    let completed_store = store.clone();
    wait_for(|| {
        let store = completed_store.clone();
        async move {
            store
                .set_members(TaskSet::Completed)
                .await
                .unwrap()
                .contains(&42)
        }
    })
    .await;
    worker.stop().await?;

    assert!(store.set_members(TaskSet::Failed).await?.is_empty());

    let progress = store.get_progress("t1").await?.expect("progress present");
    assert_eq!(progress.status, ProgressStatus::Completed);
    assert_eq!(progress.attempts, 2);

    let counters = store.stat_counters().await?;
    assert_eq!(counters.get("totalRetried"), Some(&2));
    assert_eq!(counters.get("totalCompleted"), Some(&1));
    assert_eq!(counters.get("totalFailed"), None);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_land_in_failed_with_exact_attempts() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let places = Arc::new(MemoryPlaceRepository::new());
    // Never succeeds.
    let worker = build_worker(
        store.clone(),
        places,
        Arc::new(FlakyHandler::new(u32::MAX)),
        1,
    );

    let task = UpdateTask::with_task_id("t2", 7, UpdateFlags::all());
    store.push_pending(&task).await?;

    worker.start().await?;
    let failed_store = store.clone();
    wait_for(|| {
        let store = failed_store.clone();
        async move {
            store
                .set_members(TaskSet::Failed)
                .await
                .unwrap()
                .contains(&7)
        }
    })
    .await;
    worker.stop().await?;

    assert!(store.set_members(TaskSet::Completed).await?.is_empty());

    let progress = store.get_progress("t2").await?.expect("progress present");
    assert_eq!(progress.status, ProgressStatus::Failed);
    // Attempts at the moment of entering the failed set equal
    // max_attempts exactly.
    assert_eq!(progress.attempts, 5);

    let counters = store.stat_counters().await?;
    assert_eq!(counters.get("totalRetried"), Some(&4));
    assert_eq!(counters.get("totalFailed"), Some(&1));
    Ok(())
}

#[tokio::test]
async fn not_found_is_terminal_and_flips_place_status() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let places = Arc::new(MemoryPlaceRepository::new());
    places.insert_active(99).await;

    let worker = build_worker(store.clone(), places.clone(), Arc::new(NotFoundHandler), 1);

    let task = UpdateTask::with_task_id("t3", 99, UpdateFlags::all());
    store.push_pending(&task).await?;

    worker.start().await?;
    let deleted_store = store.clone();
    wait_for(|| {
        let store = deleted_store.clone();
        async move {
            store
                .set_members(TaskSet::Deleted)
                .await
                .unwrap()
                .contains(&99)
        }
    })
    .await;
    worker.stop().await?;

    assert!(store.set_members(TaskSet::Failed).await?.is_empty());

    let place = places.get_by_id(99).await?.expect("place row");
    assert_eq!(place.status, PlaceStatus::Deleted);

    let progress = store.get_progress("t3").await?.expect("progress present");
    assert_eq!(progress.status, ProgressStatus::NotFound);

    let counters = store.stat_counters().await?;
    assert_eq!(counters.get("totalNotFound"), Some(&1));
    Ok(())
}

#[tokio::test]
async fn priority_queue_is_drained_before_pending() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let places = Arc::new(MemoryPlaceRepository::new());
    let handler = Arc::new(RecordingHandler::new());

    store
        .push_pending(&UpdateTask::with_task_id("p1", 1, UpdateFlags::all()))
        .await?;
    store
        .push_priority(&UpdateTask::with_task_id("hi", 100, UpdateFlags::all()))
        .await?;

    let worker = build_worker(store.clone(), places, handler.clone(), 1);
    worker.start().await?;
    let done_store = store.clone();
    wait_for(|| {
        let store = done_store.clone();
        async move { store.set_members(TaskSet::Completed).await.unwrap().len() == 2 }
    })
    .await;
    worker.stop().await?;

    let seen = handler.seen.lock().await.clone();
    assert_eq!(seen, vec![100, 1], "priority task must run first");
    Ok(())
}

#[tokio::test]
async fn registry_lifecycle_on_start_and_stop() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let places = Arc::new(MemoryPlaceRepository::new());
    let worker = build_worker(store.clone(), places, Arc::new(RecordingHandler::new()), 2);

    worker.start().await?;
    assert!(worker.is_running().await);

    let workers = store.workers().await?;
    let info = workers.get("test-worker").expect("registered");
    assert_eq!(info.status, WorkerStatus::Active);
    assert_eq!(info.threads, 2);
    assert_eq!(info.hostname, "test-host");

    worker.stop().await?;
    assert!(!worker.is_running().await);
    // Graceful shutdown removes the registry entry.
    assert!(!store.workers().await?.contains_key("test-worker"));
    Ok(())
}

#[tokio::test]
async fn stopped_worker_does_not_process_later_pushes() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let places = Arc::new(MemoryPlaceRepository::new());
    let handler = Arc::new(RecordingHandler::new());
    let worker = build_worker(store.clone(), places, handler.clone(), 2);

    worker.start().await?;
    worker.stop().await?;

    // Loops must all have exited by now; work enqueued after stop()
    // returns stays on the queue.
    store
        .push_pending(&UpdateTask::with_task_id("late", 555, UpdateFlags::all()))
        .await?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(handler.seen.lock().await.is_empty());
    assert!(store.set_members(TaskSet::Completed).await?.is_empty());
    let depths = store.queue_depths().await?;
    assert_eq!(depths.pending, 1);
    assert_eq!(depths.processing, 0);
    Ok(())
}

#[tokio::test]
async fn double_start_is_rejected() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let places = Arc::new(MemoryPlaceRepository::new());
    let worker = build_worker(store, places, Arc::new(RecordingHandler::new()), 1);

    worker.start().await?;
    assert!(worker.start().await.is_err());
    worker.stop().await?;
    Ok(())
}
