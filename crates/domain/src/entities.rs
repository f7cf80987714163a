use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Progress error strings are truncated before they hit the store.
pub const MAX_ERROR_LEN: usize = 500;

/// Which place sub-resources a task refreshes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFlags {
    #[serde(rename = "updateMenus")]
    pub update_menus: bool,
    #[serde(rename = "updateImages")]
    pub update_images: bool,
    #[serde(rename = "updateReviews")]
    pub update_reviews: bool,
}

impl UpdateFlags {
    pub fn all() -> Self {
        Self {
            update_menus: true,
            update_images: true,
            update_reviews: true,
        }
    }
}

/// One unit of retryable work on the queue.
///
/// Serialized as JSON onto `update:pending` / `update:priority`; field
/// names are part of the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTask {
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "placeId")]
    pub place_id: i64,
    #[serde(flatten)]
    pub flags: UpdateFlags,
    pub attempts: u32,
    #[serde(rename = "scheduledAt")]
    pub scheduled_at: DateTime<Utc>,
}

impl UpdateTask {
    pub fn new(place_id: i64, flags: UpdateFlags) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            place_id,
            flags,
            attempts: 0,
            scheduled_at: Utc::now(),
        }
    }

    pub fn with_task_id(task_id: impl Into<String>, place_id: i64, flags: UpdateFlags) -> Self {
        Self {
            task_id: task_id.into(),
            place_id,
            flags,
            attempts: 0,
            scheduled_at: Utc::now(),
        }
    }

    /// Reschedules the task after a retryable failure: increments
    /// `attempts` and pushes `scheduled_at` out by
    /// `base^attempts * multiplier` seconds.
    pub fn reschedule_with_backoff(&mut self, base_seconds: f64, multiplier: f64) {
        self.attempts += 1;
        let delay_seconds = base_seconds.powi(self.attempts as i32) * multiplier;
        let delay_ms = (delay_seconds * 1000.0).round().max(0.0) as i64;
        self.scheduled_at = Utc::now() + chrono::Duration::milliseconds(delay_ms);
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    #[serde(rename = "starting")]
    Starting,
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "stopping")]
    Stopping,
    #[serde(rename = "stopped")]
    Stopped,
}

/// Registry entry for one worker process.
///
/// An entry absent from the registry for longer than the staleness
/// threshold is considered dead regardless of its recorded status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    #[serde(rename = "workerId")]
    pub worker_id: String,
    pub hostname: String,
    pub threads: usize,
    pub status: WorkerStatus,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "lastHeartbeat")]
    pub last_heartbeat: DateTime<Utc>,
    #[serde(rename = "currentTaskId")]
    pub current_task_id: Option<String>,
    #[serde(rename = "tasksProcessed")]
    pub tasks_processed: u64,
    #[serde(rename = "tasksFailed")]
    pub tasks_failed: u64,
}

impl WorkerInfo {
    pub fn new(worker_id: impl Into<String>, hostname: impl Into<String>, threads: usize) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.into(),
            hostname: hostname.into(),
            threads,
            status: WorkerStatus::Starting,
            started_at: now,
            last_heartbeat: now,
            current_task_id: None,
            tasks_processed: 0,
            tasks_failed: 0,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout_seconds: i64) -> bool {
        (now - self.last_heartbeat).num_seconds() > timeout_seconds
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressStatus {
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "retrying")]
    Retrying,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "not_found")]
    NotFound,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Processing => "processing",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Retrying => "retrying",
            ProgressStatus::Failed => "failed",
            ProgressStatus::NotFound => "not_found",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(ProgressStatus::Processing),
            "completed" => Some(ProgressStatus::Completed),
            "retrying" => Some(ProgressStatus::Retrying),
            "failed" => Some(ProgressStatus::Failed),
            "not_found" => Some(ProgressStatus::NotFound),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressStatus::Completed | ProgressStatus::Failed | ProgressStatus::NotFound
        )
    }
}

/// Per-task progress projection, persisted as the TTL-bounded
/// `update:progress:<taskId>` hash.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    pub place_id: i64,
    pub status: ProgressStatus,
    pub worker_id: String,
    pub attempts: u32,
    pub flags: UpdateFlags,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl TaskProgress {
    pub fn started(task: &UpdateTask, worker_id: impl Into<String>) -> Self {
        Self {
            place_id: task.place_id,
            status: ProgressStatus::Processing,
            worker_id: worker_id.into(),
            attempts: task.attempts,
            flags: task.flags,
            start_time: Utc::now(),
            end_time: None,
            last_error: None,
        }
    }

    pub fn finish(&mut self, status: ProgressStatus, error: Option<String>) {
        self.status = status;
        self.end_time = Some(Utc::now());
        self.last_error = error.map(|e| truncate_error(&e));
    }

    /// Retrying is not terminal: records the new attempt count and the
    /// error without setting an end time.
    pub fn record_retry(&mut self, attempts: u32, error: &str) {
        self.status = ProgressStatus::Retrying;
        self.attempts = attempts;
        self.last_error = Some(truncate_error(error));
    }

    /// Flattens the projection into hash field pairs.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("placeId".to_string(), self.place_id.to_string()),
            ("status".to_string(), self.status.as_str().to_string()),
            ("workerId".to_string(), self.worker_id.clone()),
            ("attempts".to_string(), self.attempts.to_string()),
            (
                "updateMenus".to_string(),
                self.flags.update_menus.to_string(),
            ),
            (
                "updateImages".to_string(),
                self.flags.update_images.to_string(),
            ),
            (
                "updateReviews".to_string(),
                self.flags.update_reviews.to_string(),
            ),
            ("startTime".to_string(), self.start_time.to_rfc3339()),
        ];
        if let Some(end_time) = self.end_time {
            fields.push(("endTime".to_string(), end_time.to_rfc3339()));
        }
        if let Some(last_error) = &self.last_error {
            fields.push(("lastError".to_string(), last_error.clone()));
        }
        fields
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let parse_time = |key: &str| {
            fields
                .get(key)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc))
        };
        Some(Self {
            place_id: fields.get("placeId")?.parse().ok()?,
            status: ProgressStatus::parse(fields.get("status")?)?,
            worker_id: fields.get("workerId")?.clone(),
            attempts: fields.get("attempts")?.parse().ok()?,
            flags: UpdateFlags {
                update_menus: fields.get("updateMenus").map(|v| v == "true").unwrap_or(false),
                update_images: fields.get("updateImages").map(|v| v == "true").unwrap_or(false),
                update_reviews: fields
                    .get("updateReviews")
                    .map(|v| v == "true")
                    .unwrap_or(false),
            },
            start_time: parse_time("startTime")?,
            end_time: parse_time("endTime"),
            last_error: fields.get("lastError").cloned(),
        })
    }
}

pub fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        message.to_string()
    } else {
        let mut end = MAX_ERROR_LEN;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message[..end].to_string()
    }
}

/// Read-side aggregation over the coordination store.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub pending: u64,
    pub priority: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub deleted: u64,
    pub counters: HashMap<String, u64>,
    pub workers: HashMap<String, WorkerInfo>,
    pub active_workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "PENDING",
            CheckpointStatus::Processing => "PROCESSING",
            CheckpointStatus::Completed => "COMPLETED",
            CheckpointStatus::Failed => "FAILED",
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for CheckpointStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for CheckpointStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        match s {
            "PENDING" => Ok(CheckpointStatus::Pending),
            "PROCESSING" => Ok(CheckpointStatus::Processing),
            "COMPLETED" => Ok(CheckpointStatus::Completed),
            "FAILED" => Ok(CheckpointStatus::Failed),
            _ => Err(format!("Invalid checkpoint status: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for CheckpointStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// Durable record of a region's processing status within a named batch
/// run. Rows are never deleted; they form the audit trail a resumed run
/// reads back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionCheckpoint {
    pub batch_name: String,
    pub region_type: String,
    pub region_code: String,
    pub region_name: String,
    pub parent_code: Option<String>,
    pub status: CheckpointStatus,
    pub processed_count: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Seed data for one region checkpoint row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionSeed {
    pub region_code: String,
    pub region_name: String,
    pub parent_code: Option<String>,
}

impl RegionSeed {
    pub fn new(region_code: impl Into<String>, region_name: impl Into<String>) -> Self {
        Self {
            region_code: region_code.into(),
            region_name: region_name.into(),
            parent_code: None,
        }
    }

    pub fn with_parent(mut self, parent_code: impl Into<String>) -> Self {
        self.parent_code = Some(parent_code.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "INTERRUPTED")]
    Interrupted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Interrupted => "INTERRUPTED",
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for ExecutionStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for ExecutionStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        match s {
            "RUNNING" => Ok(ExecutionStatus::Running),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "INTERRUPTED" => Ok(ExecutionStatus::Interrupted),
            _ => Err(format!("Invalid execution status: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for ExecutionStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// One row per batch run. At most one row per `batch_name` may be
/// RUNNING; starting a new run demotes the previous one to INTERRUPTED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchExecution {
    pub batch_name: String,
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub total_regions: i64,
    pub completed_count: i64,
    pub failed_count: i64,
    pub last_checkpoint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchExecution {
    pub fn start(batch_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            batch_name: batch_name.into(),
            execution_id: Uuid::new_v4().to_string(),
            status: ExecutionStatus::Running,
            total_regions: 0,
            completed_count: 0,
            failed_count: 0,
            last_checkpoint: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Progress projection over a batch's checkpoint rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchProgress {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub processing: i64,
    pub pending: i64,
    pub completion_percentage: f64,
}

impl BatchProgress {
    pub fn from_counts(total: i64, completed: i64, failed: i64, processing: i64) -> Self {
        let pending = (total - completed - failed - processing).max(0);
        let completion_percentage = if total > 0 {
            (completed + failed) as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Self {
            total,
            completed,
            failed,
            processing,
            pending,
            completion_percentage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaceStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "DELETED")]
    Deleted,
}

impl sqlx::Type<sqlx::Postgres> for PlaceStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for PlaceStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        match s {
            "ACTIVE" => Ok(PlaceStatus::Active),
            "DELETED" => Ok(PlaceStatus::Deleted),
            _ => Err(format!("Invalid place status: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for PlaceStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        let s = match self {
            PlaceStatus::Active => "ACTIVE",
            PlaceStatus::Deleted => "DELETED",
        };
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(s, buf)
    }
}

/// Minimal place surface the coordination layer needs. The full place
/// schema lives with the ingestion collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Place {
    pub id: i64,
    pub name: String,
    pub status: PlaceStatus,
    pub region_code: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_json_uses_wire_field_names() {
        let task = UpdateTask::with_task_id(
            "t1",
            42,
            UpdateFlags {
                update_menus: true,
                ..Default::default()
            },
        );
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["taskId"], "t1");
        assert_eq!(json["placeId"], 42);
        assert_eq!(json["updateMenus"], true);
        assert_eq!(json["updateImages"], false);
        assert_eq!(json["attempts"], 0);
        assert!(json.get("scheduledAt").is_some());

        let roundtrip: UpdateTask = serde_json::from_value(json).unwrap();
        assert_eq!(roundtrip.task_id, "t1");
        assert!(roundtrip.flags.update_menus);
    }

    #[test]
    fn backoff_grows_exponentially() {
        let mut task = UpdateTask::new(1, UpdateFlags::all());
        let before = Utc::now();
        task.reschedule_with_backoff(2.0, 1.0);
        assert_eq!(task.attempts, 1);
        let first_delay = (task.scheduled_at - before).num_seconds();
        assert!((1..=3).contains(&first_delay));

        task.reschedule_with_backoff(2.0, 1.0);
        assert_eq!(task.attempts, 2);
        let second_delay = (task.scheduled_at - Utc::now()).num_seconds();
        assert!((3..=4).contains(&second_delay));
    }

    #[test]
    fn worker_info_staleness() {
        let mut info = WorkerInfo::new("w1", "host-a", 4);
        let now = Utc::now();
        assert!(!info.is_stale(now, 120));
        info.last_heartbeat = now - chrono::Duration::seconds(180);
        assert!(info.is_stale(now, 120));
        info.last_heartbeat = now - chrono::Duration::seconds(30);
        assert!(!info.is_stale(now, 120));
    }

    #[test]
    fn progress_fields_roundtrip() {
        let task = UpdateTask::with_task_id("t9", 7, UpdateFlags::all());
        let mut progress = TaskProgress::started(&task, "w1");
        progress.finish(ProgressStatus::Failed, Some("boom".to_string()));

        let fields: HashMap<String, String> = progress.to_fields().into_iter().collect();
        let parsed = TaskProgress::from_fields(&fields).unwrap();
        assert_eq!(parsed, progress);
        assert_eq!(parsed.status, ProgressStatus::Failed);
        assert_eq!(parsed.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn long_errors_are_truncated() {
        let long = "x".repeat(2000);
        assert_eq!(truncate_error(&long).len(), MAX_ERROR_LEN);
        assert_eq!(truncate_error("short"), "short");
    }

    #[test]
    fn batch_progress_math() {
        let progress = BatchProgress::from_counts(10, 4, 1, 2);
        assert_eq!(progress.pending, 3);
        assert!((progress.completion_percentage - 50.0).abs() < f64::EPSILON);

        let empty = BatchProgress::from_counts(0, 0, 0, 0);
        assert_eq!(empty.completion_percentage, 0.0);
    }
}
