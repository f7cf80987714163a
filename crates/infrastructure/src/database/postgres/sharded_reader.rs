use sqlx::{PgPool, Row};
use tracing::debug;

use placesync_core::{PipelineError, PipelineResult};
use placesync_domain::{Place, PlaceStatus};

use super::place_repository::PostgresPlaceRepository;

/// Where a sharded sweep starts: fresh from the table start, or after a
/// previously recorded id (checkpoint resume).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePolicy {
    FromStart,
    FromId(i64),
}

#[derive(Debug, Clone)]
pub struct ShardedPage {
    pub places: Vec<Place>,
    pub has_next: bool,
}

/// Deterministic modulo-partitioned reader over the places table.
///
/// Worker `w` of `n` sees exactly the rows with `id % n == w`, paged by
/// ordered id ranges rather than offsets, so concurrent inserts and
/// deletes cannot shift rows between pages. Each key page is fixed
/// first and only then materialized into full rows.
pub struct ShardedPlaceReader {
    pool: PgPool,
    worker_id: i64,
    total_workers: i64,
    page_size: i64,
    status_filter: Option<PlaceStatus>,
    last_id: i64,
    exhausted: bool,
}

impl ShardedPlaceReader {
    pub fn new(
        pool: PgPool,
        worker_id: i64,
        total_workers: i64,
        page_size: i64,
    ) -> PipelineResult<Self> {
        if total_workers <= 0 {
            return Err(PipelineError::config_error("total_workers must be > 0"));
        }
        if worker_id < 0 || worker_id >= total_workers {
            return Err(PipelineError::config_error(
                "worker_id must be in [0, total_workers)",
            ));
        }
        if page_size <= 0 {
            return Err(PipelineError::config_error("page_size must be > 0"));
        }
        Ok(Self {
            pool,
            worker_id,
            total_workers,
            page_size,
            status_filter: None,
            last_id: 0,
            exhausted: false,
        })
    }

    pub fn with_status_filter(mut self, status: PlaceStatus) -> Self {
        self.status_filter = Some(status);
        self
    }

    pub fn with_resume_policy(mut self, policy: ResumePolicy) -> Self {
        self.last_id = match policy {
            ResumePolicy::FromStart => 0,
            ResumePolicy::FromId(id) => id,
        };
        self
    }

    /// Id the next page starts after; persist this to resume a sweep.
    pub fn last_id(&self) -> i64 {
        self.last_id
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Fetches the next disjoint page of this worker's shard. Returns
    /// an empty page with `has_next == false` once the shard is drained.
    pub async fn next_page(&mut self) -> PipelineResult<ShardedPage> {
        if self.exhausted {
            return Ok(ShardedPage {
                places: Vec::new(),
                has_next: false,
            });
        }

        // Over-fetch one key so has_next comes from the page query
        // itself instead of a separate count.
        let rows = sqlx::query(
            r#"
            SELECT id FROM places
            WHERE id > $1
              AND id % $2 = $3
              AND ($4::varchar IS NULL OR status = $4)
            ORDER BY id
            LIMIT $5
            "#,
        )
        .bind(self.last_id)
        .bind(self.total_workers)
        .bind(self.worker_id)
        .bind(self.status_filter.map(|s| match s {
            PlaceStatus::Active => "ACTIVE",
            PlaceStatus::Deleted => "DELETED",
        }))
        .bind(self.page_size + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        let mut ids: Vec<i64> = rows
            .iter()
            .map(|row| row.try_get::<i64, _>("id"))
            .collect::<Result<_, _>>()?;
        let (page_ids, has_next) = split_key_page(&mut ids, self.page_size as usize);

        if page_ids.is_empty() {
            self.exhausted = true;
            return Ok(ShardedPage {
                places: Vec::new(),
                has_next: false,
            });
        }

        let place_rows = sqlx::query(
            "SELECT id, name, status, region_code, updated_at FROM places \
             WHERE id = ANY($1) ORDER BY id",
        )
        .bind(&page_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        let places = place_rows
            .iter()
            .map(PostgresPlaceRepository::row_to_place)
            .collect::<PipelineResult<Vec<_>>>()?;

        self.last_id = *page_ids.last().expect("page_ids checked non-empty");
        self.exhausted = !has_next;
        debug!(
            "Shard {}/{} read page of {} (last_id={}, has_next={})",
            self.worker_id,
            self.total_workers,
            places.len(),
            self.last_id,
            has_next
        );
        Ok(ShardedPage { places, has_next })
    }
}

/// Trims an over-fetched key page down to `page_size` and reports
/// whether more keys remain beyond it.
pub(crate) fn split_key_page(ids: &mut Vec<i64>, page_size: usize) -> (Vec<i64>, bool) {
    let has_next = ids.len() > page_size;
    ids.truncate(page_size);
    (std::mem::take(ids), has_next)
}

/// Shard membership predicate; mirrors the SQL `id % total = worker`.
pub fn belongs_to_shard(id: i64, total_workers: i64, worker_id: i64) -> bool {
    id.rem_euclid(total_workers) == worker_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_key_page_reports_has_next() {
        let mut ids = vec![1, 4, 7, 10];
        let (page, has_next) = split_key_page(&mut ids, 3);
        assert_eq!(page, vec![1, 4, 7]);
        assert!(has_next);

        let mut ids = vec![1, 4];
        let (page, has_next) = split_key_page(&mut ids, 3);
        assert_eq!(page, vec![1, 4]);
        assert!(!has_next);

        let mut ids = vec![];
        let (page, has_next) = split_key_page(&mut ids, 3);
        assert!(page.is_empty());
        assert!(!has_next);
    }

    #[test]
    fn shards_partition_the_key_space() {
        let total_workers = 3;
        let keys: Vec<i64> = (1..=1000).collect();

        let mut covered = Vec::new();
        for worker_id in 0..total_workers {
            let shard: Vec<i64> = keys
                .iter()
                .copied()
                .filter(|&id| belongs_to_shard(id, total_workers, worker_id))
                .collect();
            // No overlap with previously covered shards.
            assert!(shard.iter().all(|id| !covered.contains(id)));
            covered.extend(shard);
        }

        covered.sort_unstable();
        assert_eq!(covered, keys, "union of shards must equal the key set");
    }
}
