use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use placesync_core::config::AppConfig;
use placesync_domain::{
    CoordinationStore, PlaceRepository, PlaceStatus, TaskError, TaskHandler, UpdateFlags,
    UpdateTask,
};
use placesync_infrastructure::{
    connect_pool, run_migrations, PostgresBatchExecutionRepository, PostgresCheckpointRepository,
    PostgresPlaceRepository, RedisStore,
};
use placesync_batch::CheckpointManager;
use placesync_worker::{QueueMonitor, QueueWorker};

/// Default handler for the standalone worker binary: validates the
/// place against the catalog and logs the requested refresh. The
/// actual content fetch runs in a separate pipeline that consumes the
/// completed set.
struct CatalogCheckHandler {
    places: Arc<dyn PlaceRepository>,
}

#[async_trait]
impl TaskHandler for CatalogCheckHandler {
    async fn run(&self, task: &UpdateTask) -> Result<(), TaskError> {
        let place = self
            .places
            .get_by_id(task.place_id)
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?;

        match place {
            None => Err(TaskError::NotFound {
                place_id: task.place_id,
            }),
            Some(place) if place.status == PlaceStatus::Deleted => Err(TaskError::NotFound {
                place_id: task.place_id,
            }),
            Some(place) => {
                info!(
                    "Validated place {} ({}) for refresh: menus={} images={} reviews={}",
                    place.id,
                    place.name,
                    task.flags.update_menus,
                    task.flags.update_images,
                    task.flags.update_reviews
                );
                Ok(())
            }
        }
    }
}

pub async fn run_worker(config: AppConfig) -> Result<()> {
    let store = Arc::new(RedisStore::connect(&config.redis).await?);
    let pool = connect_pool(&config.database).await?;
    run_migrations(&pool).await?;

    let places = Arc::new(PostgresPlaceRepository::new(pool.clone()));
    let handler = Arc::new(CatalogCheckHandler {
        places: places.clone(),
    });

    let worker = QueueWorker::builder(
        store.clone(),
        places,
        handler,
        config.worker.clone(),
    )
    .build();
    worker.start().await?;

    // The maintenance sweep runs alongside every worker process; the
    // eviction itself is idempotent across the fleet.
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let monitor = Arc::new(QueueMonitor::new(store, config.monitor.clone()));
    let maintenance = monitor.start_maintenance(shutdown_rx);

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received, stopping worker");

    worker.stop().await?;
    let _ = shutdown_tx.send(());
    if tokio::time::timeout(Duration::from_secs(5), maintenance)
        .await
        .is_err()
    {
        warn!("Maintenance task did not stop within 5s");
    }

    info!("Worker stopped");
    Ok(())
}

pub async fn show_stats(config: AppConfig, local_only: bool) -> Result<()> {
    let store = Arc::new(RedisStore::connect(&config.redis).await?);
    let monitor = QueueMonitor::new(store, config.monitor);
    let stats = monitor.queue_stats(local_only).await?;

    println!("Queues:");
    println!("  pending:    {}", stats.pending);
    println!("  priority:   {}", stats.priority);
    println!("  processing: {}", stats.processing);
    println!("Result sets:");
    println!("  completed:  {}", stats.completed);
    println!("  failed:     {}", stats.failed);
    println!("  deleted:    {}", stats.deleted);

    println!("Counters:");
    let mut counters: Vec<_> = stats.counters.iter().collect();
    counters.sort_by(|a, b| a.0.cmp(b.0));
    for (name, value) in counters {
        println!("  {name}: {value}");
    }

    println!(
        "Workers ({} total, {} active):",
        stats.workers.len(),
        stats.active_workers
    );
    let mut workers: Vec<_> = stats.workers.values().collect();
    workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    for info in workers {
        println!(
            "  {} on {} [{:?}] threads={} processed={} failed={} last heartbeat {}",
            info.worker_id,
            info.hostname,
            info.status,
            info.threads,
            info.tasks_processed,
            info.tasks_failed,
            info.last_heartbeat.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

pub async fn show_progress(config: AppConfig, task_id: &str) -> Result<()> {
    let store = Arc::new(RedisStore::connect(&config.redis).await?);
    let monitor = QueueMonitor::new(store, config.monitor);

    match monitor.task_progress(task_id).await? {
        None => println!("No progress record for task {task_id} (expired or never started)"),
        Some(progress) => {
            println!("Task {task_id}:");
            println!("  place:    {}", progress.place_id);
            println!("  status:   {}", progress.status.as_str());
            println!("  worker:   {}", progress.worker_id);
            println!("  attempts: {}", progress.attempts);
            println!("  started:  {}", progress.start_time.format("%Y-%m-%d %H:%M:%S"));
            if let Some(end) = progress.end_time {
                println!("  ended:    {}", end.format("%Y-%m-%d %H:%M:%S"));
            }
            if let Some(error) = &progress.last_error {
                println!("  last error: {error}");
            }
        }
    }
    Ok(())
}

pub async fn retry_failed(config: AppConfig, flags: UpdateFlags) -> Result<()> {
    let store = Arc::new(RedisStore::connect(&config.redis).await?);
    let monitor = QueueMonitor::new(store, config.monitor);
    let requeued = monitor.retry_failed_tasks(flags).await?;
    println!("Requeued {requeued} failed task(s)");
    Ok(())
}

pub async fn cleanup_workers(config: AppConfig) -> Result<()> {
    let store = Arc::new(RedisStore::connect(&config.redis).await?);
    let monitor = QueueMonitor::new(store, config.monitor);
    let evicted = monitor.cleanup_stale_workers().await?;
    if evicted.is_empty() {
        println!("No stale workers");
    } else {
        for worker_id in &evicted {
            println!("Evicted {worker_id}");
        }
    }
    Ok(())
}

pub async fn show_batch_status(config: AppConfig, batch_name: &str) -> Result<()> {
    let pool = connect_pool(&config.database).await?;
    let manager = CheckpointManager::new(
        Arc::new(PostgresCheckpointRepository::new(pool.clone())),
        Arc::new(PostgresBatchExecutionRepository::new(pool)),
    );

    let progress = manager.get_batch_progress(batch_name).await?;
    println!("Batch '{batch_name}':");
    println!("  regions:    {}", progress.total);
    println!("  completed:  {}", progress.completed);
    println!("  failed:     {}", progress.failed);
    println!("  processing: {}", progress.processing);
    println!("  pending:    {}", progress.pending);
    println!("  progress:   {:.1}%", progress.completion_percentage);

    match manager.latest_execution(batch_name).await? {
        None => println!("No execution recorded"),
        Some(run) => {
            println!("Latest execution {}:", run.execution_id);
            println!("  status:     {:?}", run.status);
            println!("  started:    {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
            if let Some(checkpoint) = &run.last_checkpoint {
                println!("  last region: {checkpoint}");
            }
        }
    }
    Ok(())
}

pub async fn enqueue(
    config: AppConfig,
    place_id: i64,
    flags: UpdateFlags,
    priority: bool,
) -> Result<()> {
    let store = RedisStore::connect(&config.redis)
        .await
        .context("failed to connect to the coordination store")?;

    let task = UpdateTask::new(place_id, flags);
    if priority {
        store.push_priority(&task).await?;
    } else {
        store.push_pending(&task).await?;
    }
    println!(
        "Enqueued task {} for place {} ({})",
        task.task_id,
        place_id,
        if priority { "priority" } else { "pending" }
    );
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
