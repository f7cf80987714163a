use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use placesync_core::PipelineResult;
use placesync_domain::{
    BatchExecution, BatchExecutionRepository, BatchProgress, CheckpointRepository,
    CheckpointStatus, ExecutionStatus, RegionCheckpoint, RegionSeed,
};

/// Tracks progress of a region-partitioned batch run at two
/// granularities: per-region checkpoint rows and one execution-metadata
/// row per run.
///
/// The `mark_*` reporting methods are best-effort: failures are logged
/// and swallowed so checkpoint bookkeeping never aborts the batch work
/// that depends on it. The claim/read methods return errors normally.
pub struct CheckpointManager {
    checkpoints: Arc<dyn CheckpointRepository>,
    executions: Arc<dyn BatchExecutionRepository>,
}

impl CheckpointManager {
    pub fn new(
        checkpoints: Arc<dyn CheckpointRepository>,
        executions: Arc<dyn BatchExecutionRepository>,
    ) -> Self {
        Self {
            checkpoints,
            executions,
        }
    }

    /// Starts a new run for `batch_name`. Any still-RUNNING execution
    /// row is demoted to INTERRUPTED first (crash recovery marker), so
    /// at most one run per batch name is ever logically current.
    pub async fn start_batch_execution(&self, batch_name: &str) -> PipelineResult<BatchExecution> {
        let demoted = self.executions.interrupt_running(batch_name).await?;
        if demoted > 0 {
            warn!(
                "Batch '{}': marked {} previous run(s) as interrupted",
                batch_name, demoted
            );
        }

        let execution = BatchExecution::start(batch_name);
        self.executions.insert(&execution).await?;
        info!(
            "Batch '{}' started, execution {}",
            batch_name, execution.execution_id
        );
        Ok(execution)
    }

    /// Idempotently seeds one checkpoint row per region: PENDING if
    /// absent, FAILED rows reset to PENDING (one automatic extra
    /// attempt per run), PROCESSING/COMPLETED rows left untouched.
    /// Updates the execution's total region count.
    pub async fn initialize_region_checkpoints(
        &self,
        batch_name: &str,
        execution_id: &str,
        region_type: &str,
        regions: &[RegionSeed],
    ) -> PipelineResult<i64> {
        let now = Utc::now();
        for region in regions {
            let checkpoint = RegionCheckpoint {
                batch_name: batch_name.to_string(),
                region_type: region_type.to_string(),
                region_code: region.region_code.clone(),
                region_name: region.region_name.clone(),
                parent_code: region.parent_code.clone(),
                status: CheckpointStatus::Pending,
                processed_count: 0,
                error_message: None,
                created_at: now,
                updated_at: now,
            };
            self.checkpoints.seed(&checkpoint).await?;
        }

        let total = self.checkpoints.count(batch_name).await?;
        self.executions
            .set_total_regions(batch_name, execution_id, total)
            .await?;
        info!(
            "Batch '{}': initialized {} region(s) of type '{}' ({} total rows)",
            batch_name,
            regions.len(),
            region_type,
            total
        );
        Ok(total)
    }

    /// Oldest PENDING region without claiming it. Callers pairing this
    /// with `mark_region_as_processing` must serialize claims
    /// themselves; use `claim_next_region` under concurrent claimers.
    pub async fn get_next_pending_region(
        &self,
        batch_name: &str,
    ) -> PipelineResult<Option<RegionCheckpoint>> {
        self.checkpoints.find_next_pending(batch_name).await
    }

    /// Atomically claims the oldest PENDING region and marks it
    /// PROCESSING in one store operation.
    pub async fn claim_next_region(
        &self,
        batch_name: &str,
    ) -> PipelineResult<Option<RegionCheckpoint>> {
        self.checkpoints.claim_next_pending(batch_name).await
    }

    pub async fn mark_region_as_processing(&self, checkpoint: &RegionCheckpoint) {
        if let Err(e) = self
            .checkpoints
            .update_status(
                &checkpoint.batch_name,
                &checkpoint.region_type,
                &checkpoint.region_code,
                CheckpointStatus::Processing,
                None,
                None,
            )
            .await
        {
            error!(
                "Failed to mark region {}/{} as processing: {}",
                checkpoint.region_type, checkpoint.region_code, e
            );
        }
    }

    pub async fn mark_region_as_completed(
        &self,
        execution_id: &str,
        checkpoint: &RegionCheckpoint,
        processed_count: i64,
    ) {
        if let Err(e) = self
            .checkpoints
            .update_status(
                &checkpoint.batch_name,
                &checkpoint.region_type,
                &checkpoint.region_code,
                CheckpointStatus::Completed,
                Some(processed_count),
                None,
            )
            .await
        {
            error!(
                "Failed to mark region {}/{} as completed: {}",
                checkpoint.region_type, checkpoint.region_code, e
            );
            return;
        }

        if let Err(e) = self
            .executions
            .record_region_result(
                &checkpoint.batch_name,
                execution_id,
                true,
                &checkpoint.region_code,
            )
            .await
        {
            error!(
                "Failed to record completion of region {} on execution {}: {}",
                checkpoint.region_code, execution_id, e
            );
        }
    }

    pub async fn mark_region_as_failed(
        &self,
        execution_id: &str,
        checkpoint: &RegionCheckpoint,
        message: &str,
    ) {
        if let Err(e) = self
            .checkpoints
            .update_status(
                &checkpoint.batch_name,
                &checkpoint.region_type,
                &checkpoint.region_code,
                CheckpointStatus::Failed,
                None,
                Some(message.to_string()),
            )
            .await
        {
            error!(
                "Failed to mark region {}/{} as failed: {}",
                checkpoint.region_type, checkpoint.region_code, e
            );
            return;
        }

        if let Err(e) = self
            .executions
            .record_region_result(
                &checkpoint.batch_name,
                execution_id,
                false,
                &checkpoint.region_code,
            )
            .await
        {
            error!(
                "Failed to record failure of region {} on execution {}: {}",
                checkpoint.region_code, execution_id, e
            );
        }
    }

    /// True when an INTERRUPTED execution exists for the batch; the
    /// startup hook uses this to decide whether to resume.
    pub async fn has_interrupted_batch(&self, batch_name: &str) -> PipelineResult<bool> {
        self.executions
            .has_with_status(batch_name, ExecutionStatus::Interrupted)
            .await
    }

    pub async fn get_batch_progress(&self, batch_name: &str) -> PipelineResult<BatchProgress> {
        let counts = self.checkpoints.status_counts(batch_name).await?;
        let count_of = |status: CheckpointStatus| counts.get(&status).copied().unwrap_or(0);
        let total: i64 = counts.values().sum();
        Ok(BatchProgress::from_counts(
            total,
            count_of(CheckpointStatus::Completed),
            count_of(CheckpointStatus::Failed),
            count_of(CheckpointStatus::Processing),
        ))
    }

    pub async fn latest_execution(
        &self,
        batch_name: &str,
    ) -> PipelineResult<Option<BatchExecution>> {
        self.executions.latest(batch_name).await
    }

    pub async fn complete_batch_execution(
        &self,
        batch_name: &str,
        execution_id: &str,
    ) -> PipelineResult<()> {
        self.finish(batch_name, execution_id, ExecutionStatus::Completed)
            .await
    }

    pub async fn fail_batch_execution(
        &self,
        batch_name: &str,
        execution_id: &str,
    ) -> PipelineResult<()> {
        self.finish(batch_name, execution_id, ExecutionStatus::Failed)
            .await
    }

    /// Closes the current run's metadata row. COMPLETED and FAILED are
    /// terminal.
    async fn finish(
        &self,
        batch_name: &str,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> PipelineResult<()> {
        self.executions
            .finish(batch_name, execution_id, status)
            .await?;
        info!(
            "Batch '{}' execution {} finished as {:?}",
            batch_name, execution_id, status
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use placesync_infrastructure::{MemoryBatchExecutionRepository, MemoryCheckpointRepository};

    fn manager() -> (
        CheckpointManager,
        Arc<MemoryCheckpointRepository>,
        Arc<MemoryBatchExecutionRepository>,
    ) {
        let checkpoints = Arc::new(MemoryCheckpointRepository::new());
        let executions = Arc::new(MemoryBatchExecutionRepository::new());
        let manager = CheckpointManager::new(checkpoints.clone(), executions.clone());
        (manager, checkpoints, executions)
    }

    fn city_seeds() -> Vec<RegionSeed> {
        vec![
            RegionSeed::new("110000", "Beijing"),
            RegionSeed::new("310000", "Shanghai"),
            RegionSeed::new("440100", "Guangzhou").with_parent("440000"),
        ]
    }

    #[tokio::test]
    async fn restart_demotes_previous_run_to_interrupted() -> anyhow::Result<()> {
        let (manager, _, executions) = manager();

        let first = manager.start_batch_execution("city-sync").await?;
        let second = manager.start_batch_execution("city-sync").await?;
        assert_ne!(first.execution_id, second.execution_id);

        let rows = executions.all().await;
        assert_eq!(rows.len(), 2);
        let running: Vec<_> = rows
            .iter()
            .filter(|row| row.status == ExecutionStatus::Running)
            .collect();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].execution_id, second.execution_id);
        assert!(rows
            .iter()
            .any(|row| row.execution_id == first.execution_id
                && row.status == ExecutionStatus::Interrupted));

        assert!(manager.has_interrupted_batch("city-sync").await?);
        assert!(!manager.has_interrupted_batch("other-batch").await?);
        Ok(())
    }

    #[tokio::test]
    async fn seeding_is_idempotent_and_resets_only_failed_rows() -> anyhow::Result<()> {
        let (manager, checkpoints, _) = manager();
        let execution = manager.start_batch_execution("city-sync").await?;

        let total = manager
            .initialize_region_checkpoints("city-sync", &execution.execution_id, "city", &city_seeds())
            .await?;
        assert_eq!(total, 3);

        // Drive two rows into non-pending states.
        let claimed = manager.claim_next_region("city-sync").await?.unwrap();
        manager
            .mark_region_as_completed(&execution.execution_id, &claimed, 120)
            .await;
        let claimed = manager.claim_next_region("city-sync").await?.unwrap();
        manager
            .mark_region_as_failed(&execution.execution_id, &claimed, "source timeout")
            .await;

        // Second run: re-seeding resets FAILED to PENDING, leaves
        // COMPLETED alone, adds nothing.
        let execution = manager.start_batch_execution("city-sync").await?;
        let total = manager
            .initialize_region_checkpoints("city-sync", &execution.execution_id, "city", &city_seeds())
            .await?;
        assert_eq!(total, 3);

        let rows = checkpoints.all().await;
        assert_eq!(rows.len(), 3);
        let status_of = |code: &str| {
            rows.iter()
                .find(|row| row.region_code == code)
                .map(|row| row.status)
                .unwrap()
        };
        assert_eq!(status_of("110000"), CheckpointStatus::Completed);
        assert_eq!(status_of("310000"), CheckpointStatus::Pending);
        assert_eq!(status_of("440100"), CheckpointStatus::Pending);

        let reset = rows.iter().find(|row| row.region_code == "310000").unwrap();
        assert!(reset.error_message.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn claim_and_report_protocol_updates_both_tables() -> anyhow::Result<()> {
        let (manager, checkpoints, executions) = manager();
        let execution = manager.start_batch_execution("city-sync").await?;
        manager
            .initialize_region_checkpoints("city-sync", &execution.execution_id, "city", &city_seeds())
            .await?;

        let first = manager.claim_next_region("city-sync").await?.unwrap();
        assert_eq!(first.status, CheckpointStatus::Processing);
        assert_eq!(first.region_code, "110000");

        // The claimed row no longer shows up as pending.
        let next = manager.get_next_pending_region("city-sync").await?.unwrap();
        assert_eq!(next.region_code, "310000");

        manager
            .mark_region_as_completed(&execution.execution_id, &first, 250)
            .await;

        let row = checkpoints
            .find("city-sync", "city", "110000")
            .await?
            .unwrap();
        assert_eq!(row.status, CheckpointStatus::Completed);
        assert_eq!(row.processed_count, 250);

        let run = executions.all().await.into_iter().next().unwrap();
        assert_eq!(run.completed_count, 1);
        assert_eq!(run.failed_count, 0);
        assert_eq!(run.last_checkpoint.as_deref(), Some("110000"));
        Ok(())
    }

    #[tokio::test]
    async fn failed_region_records_message_and_failed_counter() -> anyhow::Result<()> {
        let (manager, checkpoints, executions) = manager();
        let execution = manager.start_batch_execution("city-sync").await?;
        manager
            .initialize_region_checkpoints("city-sync", &execution.execution_id, "city", &city_seeds())
            .await?;

        let claimed = manager.claim_next_region("city-sync").await?.unwrap();
        manager
            .mark_region_as_failed(&execution.execution_id, &claimed, "upstream unavailable")
            .await;

        let row = checkpoints
            .find("city-sync", "city", &claimed.region_code)
            .await?
            .unwrap();
        assert_eq!(row.status, CheckpointStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some("upstream unavailable"));

        let run = executions.all().await.into_iter().next().unwrap();
        assert_eq!(run.failed_count, 1);
        assert_eq!(run.completed_count, 0);
        Ok(())
    }

    #[tokio::test]
    async fn progress_reflects_checkpoint_states() -> anyhow::Result<()> {
        let (manager, _, _) = manager();
        let execution = manager.start_batch_execution("city-sync").await?;
        manager
            .initialize_region_checkpoints("city-sync", &execution.execution_id, "city", &city_seeds())
            .await?;

        let claimed = manager.claim_next_region("city-sync").await?.unwrap();
        manager
            .mark_region_as_completed(&execution.execution_id, &claimed, 10)
            .await;
        let claimed = manager.claim_next_region("city-sync").await?.unwrap();
        manager
            .mark_region_as_failed(&execution.execution_id, &claimed, "boom")
            .await;
        manager.claim_next_region("city-sync").await?.unwrap();

        let progress = manager.get_batch_progress("city-sync").await?;
        assert_eq!(progress.total, 3);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.processing, 1);
        assert_eq!(progress.pending, 0);
        assert!((progress.completion_percentage - 66.66).abs() < 0.1);
        Ok(())
    }

    #[tokio::test]
    async fn finish_closes_the_running_execution() -> anyhow::Result<()> {
        let (manager, _, _) = manager();
        let execution = manager.start_batch_execution("city-sync").await?;

        manager
            .complete_batch_execution("city-sync", &execution.execution_id)
            .await?;

        let latest = manager.latest_execution("city-sync").await?.unwrap();
        assert_eq!(latest.status, ExecutionStatus::Completed);
        assert!(!manager.has_interrupted_batch("city-sync").await?);
        Ok(())
    }
}
