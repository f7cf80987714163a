use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::debug;

use placesync_core::{PipelineError, PipelineResult};
use placesync_domain::{BatchExecution, BatchExecutionRepository, ExecutionStatus};

const EXECUTION_COLUMNS: &str = "batch_name, execution_id, status, total_regions, \
     completed_count, failed_count, last_checkpoint, created_at, updated_at";

pub struct PostgresBatchExecutionRepository {
    pool: PgPool,
}

impl PostgresBatchExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_execution(row: &sqlx::postgres::PgRow) -> PipelineResult<BatchExecution> {
        Ok(BatchExecution {
            batch_name: row.try_get("batch_name")?,
            execution_id: row.try_get("execution_id")?,
            status: row.try_get("status")?,
            total_regions: row.try_get("total_regions")?,
            completed_count: row.try_get("completed_count")?,
            failed_count: row.try_get("failed_count")?,
            last_checkpoint: row.try_get("last_checkpoint")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl BatchExecutionRepository for PostgresBatchExecutionRepository {
    async fn interrupt_running(&self, batch_name: &str) -> PipelineResult<u64> {
        let result = sqlx::query(
            "UPDATE batch_executions SET status = $2, updated_at = NOW() \
             WHERE batch_name = $1 AND status = $3",
        )
        .bind(batch_name)
        .bind(ExecutionStatus::Interrupted)
        .bind(ExecutionStatus::Running)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        let demoted = result.rows_affected();
        if demoted > 0 {
            debug!("Demoted {} running execution(s) of '{}' to INTERRUPTED", demoted, batch_name);
        }
        Ok(demoted)
    }

    async fn insert(&self, execution: &BatchExecution) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO batch_executions
                (batch_name, execution_id, status, total_regions, completed_count,
                 failed_count, last_checkpoint, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&execution.batch_name)
        .bind(&execution.execution_id)
        .bind(execution.status)
        .bind(execution.total_regions)
        .bind(execution.completed_count)
        .bind(execution.failed_count)
        .bind(&execution.last_checkpoint)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::Database)?;
        Ok(())
    }

    async fn latest(&self, batch_name: &str) -> PipelineResult<Option<BatchExecution>> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM batch_executions \
             WHERE batch_name = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(batch_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn has_with_status(
        &self,
        batch_name: &str,
        status: ExecutionStatus,
    ) -> PipelineResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM batch_executions WHERE batch_name = $1 AND status = $2) as present",
        )
        .bind(batch_name)
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(PipelineError::Database)?;
        Ok(row.try_get::<bool, _>("present")?)
    }

    async fn set_total_regions(
        &self,
        batch_name: &str,
        execution_id: &str,
        total_regions: i64,
    ) -> PipelineResult<()> {
        let result = sqlx::query(
            "UPDATE batch_executions SET total_regions = $3, updated_at = NOW() \
             WHERE batch_name = $1 AND execution_id = $2",
        )
        .bind(batch_name)
        .bind(execution_id)
        .bind(total_regions)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::batch_not_found(batch_name));
        }
        Ok(())
    }

    async fn record_region_result(
        &self,
        batch_name: &str,
        execution_id: &str,
        completed: bool,
        last_checkpoint: &str,
    ) -> PipelineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE batch_executions
            SET completed_count = completed_count + CASE WHEN $3 THEN 1 ELSE 0 END,
                failed_count = failed_count + CASE WHEN $3 THEN 0 ELSE 1 END,
                last_checkpoint = $4,
                updated_at = NOW()
            WHERE batch_name = $1 AND execution_id = $2
            "#,
        )
        .bind(batch_name)
        .bind(execution_id)
        .bind(completed)
        .bind(last_checkpoint)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::batch_not_found(batch_name));
        }
        Ok(())
    }

    async fn finish(
        &self,
        batch_name: &str,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> PipelineResult<()> {
        let result = sqlx::query(
            "UPDATE batch_executions SET status = $3, updated_at = NOW() \
             WHERE batch_name = $1 AND execution_id = $2",
        )
        .bind(batch_name)
        .bind(execution_id)
        .bind(status)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::batch_not_found(batch_name));
        }
        Ok(())
    }
}
