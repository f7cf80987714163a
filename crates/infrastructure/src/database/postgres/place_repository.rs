use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::debug;

use placesync_core::{PipelineError, PipelineResult};
use placesync_domain::{Place, PlaceRepository, PlaceStatus};

pub struct PostgresPlaceRepository {
    pool: PgPool,
}

impl PostgresPlaceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub(crate) fn row_to_place(row: &sqlx::postgres::PgRow) -> PipelineResult<Place> {
        Ok(Place {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            region_code: row.try_get("region_code")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl PlaceRepository for PostgresPlaceRepository {
    async fn get_by_id(&self, place_id: i64) -> PipelineResult<Option<Place>> {
        let row = sqlx::query(
            "SELECT id, name, status, region_code, updated_at FROM places WHERE id = $1",
        )
        .bind(place_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        row.as_ref().map(Self::row_to_place).transpose()
    }

    async fn mark_deleted(&self, place_id: i64) -> PipelineResult<()> {
        let result = sqlx::query(
            "UPDATE places SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(place_id)
        .bind(PlaceStatus::Deleted)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        // Already-gone rows are fine; the not-found outcome is terminal
        // either way.
        if result.rows_affected() == 0 {
            debug!("mark_deleted: place {} has no row", place_id);
        }
        Ok(())
    }
}
