use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use placesync_core::{PipelineError, PipelineResult};
use placesync_domain::{
    BatchExecution, BatchExecutionRepository, CheckpointRepository, CheckpointStatus,
    ExecutionStatus, Place, PlaceRepository, PlaceStatus, RegionCheckpoint,
};

/// In-memory checkpoint rows, ordered by insertion like the relational
/// table ordered by created_at.
#[derive(Clone, Default)]
pub struct MemoryCheckpointRepository {
    rows: Arc<Mutex<Vec<RegionCheckpoint>>>,
}

impl MemoryCheckpointRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<RegionCheckpoint> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl CheckpointRepository for MemoryCheckpointRepository {
    async fn seed(&self, checkpoint: &RegionCheckpoint) -> PipelineResult<()> {
        let mut rows = self.rows.lock().await;
        if let Some(existing) = rows.iter_mut().find(|row| {
            row.batch_name == checkpoint.batch_name
                && row.region_type == checkpoint.region_type
                && row.region_code == checkpoint.region_code
        }) {
            if existing.status == CheckpointStatus::Failed {
                existing.status = CheckpointStatus::Pending;
                existing.error_message = None;
                existing.updated_at = Utc::now();
            }
            return Ok(());
        }
        rows.push(checkpoint.clone());
        Ok(())
    }

    async fn find(
        &self,
        batch_name: &str,
        region_type: &str,
        region_code: &str,
    ) -> PipelineResult<Option<RegionCheckpoint>> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .find(|row| {
                row.batch_name == batch_name
                    && row.region_type == region_type
                    && row.region_code == region_code
            })
            .cloned())
    }

    async fn find_next_pending(
        &self,
        batch_name: &str,
    ) -> PipelineResult<Option<RegionCheckpoint>> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .find(|row| row.batch_name == batch_name && row.status == CheckpointStatus::Pending)
            .cloned())
    }

    async fn claim_next_pending(
        &self,
        batch_name: &str,
    ) -> PipelineResult<Option<RegionCheckpoint>> {
        let mut rows = self.rows.lock().await;
        let claimed = rows
            .iter_mut()
            .find(|row| row.batch_name == batch_name && row.status == CheckpointStatus::Pending);
        Ok(claimed.map(|row| {
            row.status = CheckpointStatus::Processing;
            row.updated_at = Utc::now();
            row.clone()
        }))
    }

    async fn update_status(
        &self,
        batch_name: &str,
        region_type: &str,
        region_code: &str,
        status: CheckpointStatus,
        processed_count: Option<i64>,
        error_message: Option<String>,
    ) -> PipelineResult<()> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|row| {
                row.batch_name == batch_name
                    && row.region_type == region_type
                    && row.region_code == region_code
            })
            .ok_or_else(|| PipelineError::CheckpointNotFound {
                batch_name: batch_name.to_string(),
                region_type: region_type.to_string(),
                region_code: region_code.to_string(),
            })?;
        row.status = status;
        if let Some(count) = processed_count {
            row.processed_count = count;
        }
        row.error_message = error_message;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn count(&self, batch_name: &str) -> PipelineResult<i64> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|row| row.batch_name == batch_name)
            .count() as i64)
    }

    async fn status_counts(
        &self,
        batch_name: &str,
    ) -> PipelineResult<HashMap<CheckpointStatus, i64>> {
        let mut counts = HashMap::new();
        for row in self.rows.lock().await.iter() {
            if row.batch_name == batch_name {
                *counts.entry(row.status).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}

#[derive(Clone, Default)]
pub struct MemoryBatchExecutionRepository {
    rows: Arc<Mutex<Vec<BatchExecution>>>,
}

impl MemoryBatchExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<BatchExecution> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl BatchExecutionRepository for MemoryBatchExecutionRepository {
    async fn interrupt_running(&self, batch_name: &str) -> PipelineResult<u64> {
        let mut demoted = 0;
        for row in self.rows.lock().await.iter_mut() {
            if row.batch_name == batch_name && row.status == ExecutionStatus::Running {
                row.status = ExecutionStatus::Interrupted;
                row.updated_at = Utc::now();
                demoted += 1;
            }
        }
        Ok(demoted)
    }

    async fn insert(&self, execution: &BatchExecution) -> PipelineResult<()> {
        self.rows.lock().await.push(execution.clone());
        Ok(())
    }

    async fn latest(&self, batch_name: &str) -> PipelineResult<Option<BatchExecution>> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|row| row.batch_name == batch_name)
            .max_by_key(|row| row.created_at)
            .cloned())
    }

    async fn has_with_status(
        &self,
        batch_name: &str,
        status: ExecutionStatus,
    ) -> PipelineResult<bool> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .any(|row| row.batch_name == batch_name && row.status == status))
    }

    async fn set_total_regions(
        &self,
        batch_name: &str,
        execution_id: &str,
        total_regions: i64,
    ) -> PipelineResult<()> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|row| row.batch_name == batch_name && row.execution_id == execution_id)
            .ok_or_else(|| PipelineError::batch_not_found(batch_name))?;
        row.total_regions = total_regions;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn record_region_result(
        &self,
        batch_name: &str,
        execution_id: &str,
        completed: bool,
        last_checkpoint: &str,
    ) -> PipelineResult<()> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|row| row.batch_name == batch_name && row.execution_id == execution_id)
            .ok_or_else(|| PipelineError::batch_not_found(batch_name))?;
        if completed {
            row.completed_count += 1;
        } else {
            row.failed_count += 1;
        }
        row.last_checkpoint = Some(last_checkpoint.to_string());
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn finish(
        &self,
        batch_name: &str,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> PipelineResult<()> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|row| row.batch_name == batch_name && row.execution_id == execution_id)
            .ok_or_else(|| PipelineError::batch_not_found(batch_name))?;
        row.status = status;
        row.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryPlaceRepository {
    rows: Arc<Mutex<HashMap<i64, Place>>>,
}

impl MemoryPlaceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, place: Place) {
        self.rows.lock().await.insert(place.id, place);
    }

    /// Convenience seed for tests and embedded runs.
    pub async fn insert_active(&self, id: i64) {
        self.insert(Place {
            id,
            name: format!("place-{id}"),
            status: PlaceStatus::Active,
            region_code: None,
            updated_at: Utc::now(),
        })
        .await;
    }
}

#[async_trait]
impl PlaceRepository for MemoryPlaceRepository {
    async fn get_by_id(&self, place_id: i64) -> PipelineResult<Option<Place>> {
        Ok(self.rows.lock().await.get(&place_id).cloned())
    }

    async fn mark_deleted(&self, place_id: i64) -> PipelineResult<()> {
        if let Some(place) = self.rows.lock().await.get_mut(&place_id) {
            place.status = PlaceStatus::Deleted;
            place.updated_at = Utc::now();
        }
        Ok(())
    }
}
