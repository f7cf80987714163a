use async_trait::async_trait;
use std::collections::HashMap;

use placesync_core::PipelineResult;

use crate::entities::{
    BatchExecution, CheckpointStatus, ExecutionStatus, Place, RegionCheckpoint,
};

/// Relational persistence for per-region checkpoint rows.
#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    /// Inserts a PENDING row if absent; resets a FAILED row to PENDING;
    /// leaves PROCESSING/COMPLETED rows untouched.
    async fn seed(&self, checkpoint: &RegionCheckpoint) -> PipelineResult<()>;

    async fn find(
        &self,
        batch_name: &str,
        region_type: &str,
        region_code: &str,
    ) -> PipelineResult<Option<RegionCheckpoint>>;

    /// Oldest PENDING row for the batch, without claiming it.
    async fn find_next_pending(&self, batch_name: &str)
        -> PipelineResult<Option<RegionCheckpoint>>;

    /// Atomically claims the oldest PENDING row and marks it
    /// PROCESSING. Safe under concurrent claimers where the backend
    /// supports row locking.
    async fn claim_next_pending(
        &self,
        batch_name: &str,
    ) -> PipelineResult<Option<RegionCheckpoint>>;

    async fn update_status(
        &self,
        batch_name: &str,
        region_type: &str,
        region_code: &str,
        status: CheckpointStatus,
        processed_count: Option<i64>,
        error_message: Option<String>,
    ) -> PipelineResult<()>;

    async fn count(&self, batch_name: &str) -> PipelineResult<i64>;

    async fn status_counts(
        &self,
        batch_name: &str,
    ) -> PipelineResult<HashMap<CheckpointStatus, i64>>;
}

/// Relational persistence for per-run execution metadata.
#[async_trait]
pub trait BatchExecutionRepository: Send + Sync {
    /// Demotes every RUNNING row for the batch to INTERRUPTED; returns
    /// how many rows were demoted.
    async fn interrupt_running(&self, batch_name: &str) -> PipelineResult<u64>;

    async fn insert(&self, execution: &BatchExecution) -> PipelineResult<()>;

    /// Most recent execution row for the batch, any status.
    async fn latest(&self, batch_name: &str) -> PipelineResult<Option<BatchExecution>>;

    async fn has_with_status(
        &self,
        batch_name: &str,
        status: ExecutionStatus,
    ) -> PipelineResult<bool>;

    async fn set_total_regions(
        &self,
        batch_name: &str,
        execution_id: &str,
        total_regions: i64,
    ) -> PipelineResult<()>;

    /// Increments the completed (or failed) counter and records the
    /// last checkpoint reference.
    async fn record_region_result(
        &self,
        batch_name: &str,
        execution_id: &str,
        completed: bool,
        last_checkpoint: &str,
    ) -> PipelineResult<()>;

    async fn finish(
        &self,
        batch_name: &str,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> PipelineResult<()>;
}

/// Narrow place surface: the not-found terminal side effect plus the
/// lookups the sharded reader and tests need.
#[async_trait]
pub trait PlaceRepository: Send + Sync {
    async fn get_by_id(&self, place_id: i64) -> PipelineResult<Option<Place>>;

    /// Terminal side effect when a handler reports the place gone at
    /// the source.
    async fn mark_deleted(&self, place_id: i64) -> PipelineResult<()>;
}
