use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::debug;

use placesync_core::{PipelineError, PipelineResult};
use placesync_domain::{CheckpointRepository, CheckpointStatus, RegionCheckpoint};

const CHECKPOINT_COLUMNS: &str = "batch_name, region_type, region_code, region_name, parent_code, \
     status, processed_count, error_message, created_at, updated_at";

pub struct PostgresCheckpointRepository {
    pool: PgPool,
}

impl PostgresCheckpointRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_checkpoint(row: &sqlx::postgres::PgRow) -> PipelineResult<RegionCheckpoint> {
        Ok(RegionCheckpoint {
            batch_name: row.try_get("batch_name")?,
            region_type: row.try_get("region_type")?,
            region_code: row.try_get("region_code")?,
            region_name: row.try_get("region_name")?,
            parent_code: row.try_get("parent_code")?,
            status: row.try_get("status")?,
            processed_count: row.try_get("processed_count")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl CheckpointRepository for PostgresCheckpointRepository {
    async fn seed(&self, checkpoint: &RegionCheckpoint) -> PipelineResult<()> {
        // Insert if absent; a previous FAILED row gets one automatic
        // extra attempt per run. PROCESSING/COMPLETED rows are left
        // untouched by the conflict guard.
        sqlx::query(
            r#"
            INSERT INTO region_checkpoints
                (batch_name, region_type, region_code, region_name, parent_code,
                 status, processed_count, error_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 0, NULL, NOW(), NOW())
            ON CONFLICT (batch_name, region_type, region_code) DO UPDATE SET
                status = $6,
                error_message = NULL,
                updated_at = NOW()
            WHERE region_checkpoints.status = $7
            "#,
        )
        .bind(&checkpoint.batch_name)
        .bind(&checkpoint.region_type)
        .bind(&checkpoint.region_code)
        .bind(&checkpoint.region_name)
        .bind(&checkpoint.parent_code)
        .bind(CheckpointStatus::Pending)
        .bind(CheckpointStatus::Failed)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        Ok(())
    }

    async fn find(
        &self,
        batch_name: &str,
        region_type: &str,
        region_code: &str,
    ) -> PipelineResult<Option<RegionCheckpoint>> {
        let row = sqlx::query(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM region_checkpoints \
             WHERE batch_name = $1 AND region_type = $2 AND region_code = $3"
        ))
        .bind(batch_name)
        .bind(region_type)
        .bind(region_code)
        .fetch_optional(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        row.as_ref().map(Self::row_to_checkpoint).transpose()
    }

    async fn find_next_pending(
        &self,
        batch_name: &str,
    ) -> PipelineResult<Option<RegionCheckpoint>> {
        let row = sqlx::query(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM region_checkpoints \
             WHERE batch_name = $1 AND status = $2 \
             ORDER BY created_at, region_code LIMIT 1"
        ))
        .bind(batch_name)
        .bind(CheckpointStatus::Pending)
        .fetch_optional(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        row.as_ref().map(Self::row_to_checkpoint).transpose()
    }

    async fn claim_next_pending(
        &self,
        batch_name: &str,
    ) -> PipelineResult<Option<RegionCheckpoint>> {
        let mut tx = self.pool.begin().await.map_err(PipelineError::Database)?;

        let row = sqlx::query(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM region_checkpoints \
             WHERE batch_name = $1 AND status = $2 \
             ORDER BY created_at, region_code LIMIT 1 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(batch_name)
        .bind(CheckpointStatus::Pending)
        .fetch_optional(&mut *tx)
        .await
        .map_err(PipelineError::Database)?;

        let Some(row) = row else {
            tx.commit().await.map_err(PipelineError::Database)?;
            return Ok(None);
        };
        let mut checkpoint = Self::row_to_checkpoint(&row)?;

        sqlx::query(
            "UPDATE region_checkpoints SET status = $4, updated_at = NOW() \
             WHERE batch_name = $1 AND region_type = $2 AND region_code = $3",
        )
        .bind(&checkpoint.batch_name)
        .bind(&checkpoint.region_type)
        .bind(&checkpoint.region_code)
        .bind(CheckpointStatus::Processing)
        .execute(&mut *tx)
        .await
        .map_err(PipelineError::Database)?;

        tx.commit().await.map_err(PipelineError::Database)?;

        checkpoint.status = CheckpointStatus::Processing;
        debug!(
            "Claimed region checkpoint {}/{}/{}",
            checkpoint.batch_name, checkpoint.region_type, checkpoint.region_code
        );
        Ok(Some(checkpoint))
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
        let result = sqlx::query(
            r#"
            UPDATE region_checkpoints
            SET status = $4,
                processed_count = COALESCE($5, processed_count),
                error_message = $6,
                updated_at = NOW()
            WHERE batch_name = $1 AND region_type = $2 AND region_code = $3
            "#,
        )
        .bind(batch_name)
        .bind(region_type)
        .bind(region_code)
        .bind(status)
        .bind(processed_count)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::CheckpointNotFound {
                batch_name: batch_name.to_string(),
                region_type: region_type.to_string(),
                region_code: region_code.to_string(),
            });
        }
        Ok(())
    }

    async fn count(&self, batch_name: &str) -> PipelineResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM region_checkpoints WHERE batch_name = $1",
        )
        .bind(batch_name)
        .fetch_one(&self.pool)
        .await
        .map_err(PipelineError::Database)?;
        Ok(row.try_get::<i64, _>("count")?)
    }

    async fn status_counts(
        &self,
        batch_name: &str,
    ) -> PipelineResult<HashMap<CheckpointStatus, i64>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) as count FROM region_checkpoints \
             WHERE batch_name = $1 GROUP BY status",
        )
        .bind(batch_name)
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: CheckpointStatus = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            counts.insert(status, count);
        }
        Ok(counts)
    }
}
