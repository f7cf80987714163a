use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use placesync_core::config::WorkerConfig;
use placesync_core::{PipelineError, PipelineResult};
use placesync_domain::{
    CoordinationStore, PlaceRepository, ProgressStatus, StatCounter, TaskError, TaskHandler,
    TaskProgress, TaskSet, UpdateTask, WorkerInfo, WorkerStatus,
};

use crate::components::HeartbeatManager;

/// Delay before re-checking a popped task whose schedule time has not
/// arrived yet; it goes back to the pending tail in the meantime.
const NOT_DUE_REQUEUE_SLEEP: Duration = Duration::from_millis(250);

/// Shared mutable state for one worker process, snapshotted into the
/// registry by the heartbeat task.
pub struct WorkerState {
    worker_id: String,
    hostname: String,
    threads: usize,
    started_at: DateTime<Utc>,
    status: RwLock<WorkerStatus>,
    current_task_id: RwLock<Option<String>>,
    tasks_processed: AtomicU64,
    tasks_failed: AtomicU64,
    in_flight: AtomicUsize,
}

impl WorkerState {
    fn new(worker_id: String, hostname: String, threads: usize) -> Self {
        Self {
            worker_id,
            hostname,
            threads,
            started_at: Utc::now(),
            status: RwLock::new(WorkerStatus::Starting),
            current_task_id: RwLock::new(None),
            tasks_processed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn snapshot(&self) -> WorkerInfo {
        WorkerInfo {
            worker_id: self.worker_id.clone(),
            hostname: self.hostname.clone(),
            threads: self.threads,
            status: *self.status.read().await,
            started_at: self.started_at,
            last_heartbeat: Utc::now(),
            current_task_id: self.current_task_id.read().await.clone(),
            tasks_processed: self.tasks_processed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
        }
    }

    async fn set_status(&self, status: WorkerStatus) {
        *self.status.write().await = status;
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

pub struct QueueWorkerBuilder {
    store: Arc<dyn CoordinationStore>,
    places: Arc<dyn PlaceRepository>,
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
    hostname: Option<String>,
}

impl QueueWorkerBuilder {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        places: Arc<dyn PlaceRepository>,
        handler: Arc<dyn TaskHandler>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            places,
            handler,
            config,
            hostname: None,
        }
    }

    pub fn hostname(mut self, hostname: String) -> Self {
        self.hostname = Some(hostname);
        self
    }

    pub fn build(self) -> QueueWorker {
        let hostname = self.hostname.unwrap_or_else(|| {
            hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string()
        });
        let worker_id = self
            .config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", hostname, std::process::id()));

        QueueWorker {
            state: Arc::new(WorkerState::new(worker_id, hostname, self.config.threads)),
            store: self.store,
            places: self.places,
            handler: self.handler,
            config: self.config,
            shutdown_tx: Arc::new(RwLock::new(None)),
            is_running: Arc::new(RwLock::new(false)),
            loop_handles: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Per-process pool of pop/process loops over the coordination store.
///
/// Loops share no mutable task state with each other; every queue
/// mutation goes through the store, which serializes it.
pub struct QueueWorker {
    state: Arc<WorkerState>,
    store: Arc<dyn CoordinationStore>,
    places: Arc<dyn PlaceRepository>,
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
    shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    is_running: Arc<RwLock<bool>>,
    loop_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl QueueWorker {
    pub fn builder(
        store: Arc<dyn CoordinationStore>,
        places: Arc<dyn PlaceRepository>,
        handler: Arc<dyn TaskHandler>,
        config: WorkerConfig,
    ) -> QueueWorkerBuilder {
        QueueWorkerBuilder::new(store, places, handler, config)
    }

    pub fn worker_id(&self) -> &str {
        self.state.worker_id()
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn in_flight_tasks(&self) -> usize {
        self.state.in_flight()
    }

    pub async fn start(&self) -> PipelineResult<()> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            return Err(PipelineError::InvalidState(
                "worker is already running".to_string(),
            ));
        }

        info!(
            "Starting queue worker {} with {} threads",
            self.state.worker_id, self.config.threads
        );
        self.store
            .register_worker(&self.state.snapshot().await)
            .await?;

        let (shutdown_tx, _) = broadcast::channel(1);
        {
            let mut tx_guard = self.shutdown_tx.write().await;
            *tx_guard = Some(shutdown_tx.clone());
        }

        HeartbeatManager::new(
            Arc::clone(&self.store),
            Arc::clone(&self.state),
            Duration::from_secs(self.config.heartbeat_interval_seconds),
        )
        .spawn(shutdown_tx.subscribe());

        let mut handles = self.loop_handles.lock().await;
        for loop_index in 0..self.config.threads {
            let worker = self.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                worker.run_loop(loop_index, shutdown_rx).await;
            }));
        }
        drop(handles);

        self.state.set_status(WorkerStatus::Active).await;
        self.store
            .register_worker(&self.state.snapshot().await)
            .await?;

        *is_running = true;
        info!("Queue worker {} started", self.state.worker_id);
        Ok(())
    }

    /// Signals every loop to exit, waits (bounded) for in-flight tasks,
    /// then aborts whatever is left and removes the registry entry.
    pub async fn stop(&self) -> PipelineResult<()> {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return Ok(());
        }

        info!("Stopping queue worker {}", self.state.worker_id);
        self.state.set_status(WorkerStatus::Stopping).await;
        if let Err(e) = self
            .store
            .register_worker(&self.state.snapshot().await)
            .await
        {
            warn!("Failed to record stopping status: {}", e);
        }

        {
            let tx_guard = self.shutdown_tx.read().await;
            if let Some(shutdown_tx) = tx_guard.as_ref() {
                let _ = shutdown_tx.send(());
            }
        }

        // Every loop must have exited before stop() returns; a loop
        // left running could pop and process work after the worker
        // deregistered.
        let handles: Vec<JoinHandle<()>> = self.loop_handles.lock().await.drain(..).collect();
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.shutdown_grace_seconds);
        for (loop_index, mut handle) in handles.into_iter().enumerate() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(_) => debug!("Loop {} drained", loop_index),
                Err(_) => {
                    warn!(
                        "Shutdown grace of {}s exceeded with {} task(s) in flight; aborting loop {}",
                        self.config.shutdown_grace_seconds,
                        self.state.in_flight(),
                        loop_index
                    );
                    handle.abort();
                }
            }
        }

        self.state.set_status(WorkerStatus::Stopped).await;
        if let Err(e) = self.store.remove_worker(&self.state.worker_id).await {
            warn!("Failed to remove worker from registry: {}", e);
        }

        *is_running = false;
        info!("Queue worker {} stopped", self.state.worker_id);
        Ok(())
    }

    async fn run_loop(&self, loop_index: usize, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!(
            "Worker {} loop {} started",
            self.state.worker_id, loop_index
        );
        loop {
            match shutdown_rx.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                _ => break,
            }

            match self.next_task().await {
                Ok(Some(task)) => {
                    if !task.is_due(Utc::now()) {
                        // Backoff delay has not elapsed; park it at the
                        // tail and let the queue cycle.
                        if let Err(e) = self.store.push_pending(&task).await {
                            error!("Failed to requeue not-due task {}: {}", task.task_id, e);
                        }
                        tokio::time::sleep(NOT_DUE_REQUEUE_SLEEP).await;
                        continue;
                    }
                    if let Err(e) = self.process_task(task).await {
                        error!("Store error while processing task: {}", e);
                        tokio::time::sleep(Duration::from_millis(self.config.error_sleep_ms))
                            .await;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Failed to pop task: {}", e);
                    tokio::time::sleep(Duration::from_millis(self.config.error_sleep_ms)).await;
                }
            }
        }
        debug!(
            "Worker {} loop {} exited",
            self.state.worker_id, loop_index
        );
    }

    /// Priority queue first, then a bounded blocking pop on pending so
    /// the loop periodically re-checks priority and shutdown.
    async fn next_task(&self) -> PipelineResult<Option<UpdateTask>> {
        if let Some(task) = self.store.pop_priority().await? {
            return Ok(Some(task));
        }
        self.store
            .pop_pending(Duration::from_secs(self.config.pending_pop_timeout_seconds))
            .await
    }

    async fn process_task(&self, task: UpdateTask) -> PipelineResult<()> {
        self.store.add_processing(&task.task_id).await?;
        *self.state.current_task_id.write().await = Some(task.task_id.clone());
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);

        let mut progress = TaskProgress::started(&task, &self.state.worker_id);
        if let Err(e) = self.store.write_progress(&task.task_id, &progress).await {
            warn!("Failed to write initial progress for {}: {}", task.task_id, e);
        }

        let outcome = self.handler.run(&task).await;
        let result = match outcome {
            Ok(()) => self.complete_task(&task, &mut progress).await,
            Err(TaskError::NotFound { place_id }) => {
                self.resolve_not_found(&task, place_id, &mut progress).await
            }
            Err(TaskError::Retryable(message)) => {
                self.retry_or_fail(task.clone(), &mut progress, message).await
            }
            Err(TaskError::Fatal(message)) => {
                warn!(
                    "Fatal handler error for task {} (place {}): {}",
                    task.task_id, task.place_id, message
                );
                self.record_failed(&task, &mut progress, message).await
            }
        };

        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        *self.state.current_task_id.write().await = None;
        result
    }

    async fn complete_task(
        &self,
        task: &UpdateTask,
        progress: &mut TaskProgress,
    ) -> PipelineResult<()> {
        self.store.remove_processing(&task.task_id).await?;
        self.store.add_to_set(TaskSet::Completed, task.place_id).await?;
        self.store.incr_stat(StatCounter::Completed).await?;
        self.state.tasks_processed.fetch_add(1, Ordering::Relaxed);

        progress.finish(ProgressStatus::Completed, None);
        self.write_progress_best_effort(&task.task_id, progress).await;
        info!(
            "Task {} completed (place {}, attempt {})",
            task.task_id, task.place_id, task.attempts
        );
        Ok(())
    }

    /// Terminal outcome for a place gone at the source: distinct from
    /// failure, never retried, flips the entity status.
    async fn resolve_not_found(
        &self,
        task: &UpdateTask,
        place_id: i64,
        progress: &mut TaskProgress,
    ) -> PipelineResult<()> {
        self.store.remove_processing(&task.task_id).await?;
        self.store.add_to_set(TaskSet::Deleted, place_id).await?;
        self.store.incr_stat(StatCounter::NotFound).await?;

        if let Err(e) = self.places.mark_deleted(place_id).await {
            error!("Failed to mark place {} deleted: {}", place_id, e);
        }

        progress.finish(
            ProgressStatus::NotFound,
            Some(format!("place {place_id} not found")),
        );
        self.write_progress_best_effort(&task.task_id, progress).await;
        info!("Task {} resolved as not-found (place {})", task.task_id, place_id);
        Ok(())
    }

    async fn retry_or_fail(
        &self,
        mut task: UpdateTask,
        progress: &mut TaskProgress,
        message: String,
    ) -> PipelineResult<()> {
        self.store.remove_processing(&task.task_id).await?;
        task.reschedule_with_backoff(
            self.config.backoff_base_seconds,
            self.config.backoff_multiplier,
        );

        if task.attempts < self.config.max_attempts {
            self.store.push_pending(&task).await?;
            self.store.incr_stat(StatCounter::Retried).await?;
            progress.record_retry(task.attempts, &message);
            self.write_progress_best_effort(&task.task_id, progress).await;
            warn!(
                "Task {} retrying (attempt {}/{}, place {}): {}",
                task.task_id, task.attempts, self.config.max_attempts, task.place_id, message
            );
            Ok(())
        } else {
            progress.attempts = task.attempts;
            self.record_failed(&task, progress, message).await
        }
    }

    async fn record_failed(
        &self,
        task: &UpdateTask,
        progress: &mut TaskProgress,
        message: String,
    ) -> PipelineResult<()> {
        // Idempotent when the retry path already removed the id.
        self.store.remove_processing(&task.task_id).await?;
        self.store.add_to_set(TaskSet::Failed, task.place_id).await?;
        self.store.incr_stat(StatCounter::Failed).await?;
        self.state.tasks_failed.fetch_add(1, Ordering::Relaxed);

        progress.finish(ProgressStatus::Failed, Some(message.clone()));
        self.write_progress_best_effort(&task.task_id, progress).await;
        error!(
            "Task {} failed permanently after {} attempt(s) (place {}): {}",
            task.task_id, task.attempts, task.place_id, message
        );
        Ok(())
    }

    /// Progress reporting degrades gracefully rather than aborting the
    /// state transition that already happened.
    async fn write_progress_best_effort(&self, task_id: &str, progress: &TaskProgress) {
        if let Err(e) = self.store.write_progress(task_id, progress).await {
            warn!("Failed to update progress for {}: {}", task_id, e);
        }
    }
}

impl Clone for QueueWorker {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            store: Arc::clone(&self.store),
            places: Arc::clone(&self.places),
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
            shutdown_tx: Arc::clone(&self.shutdown_tx),
            is_running: Arc::clone(&self.is_running),
            loop_handles: Arc::clone(&self.loop_handles),
        }
    }
}
