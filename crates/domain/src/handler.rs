use async_trait::async_trait;
use thiserror::Error;

use crate::entities::UpdateTask;

/// Handler failure taxonomy. Only `Retryable` enters the backoff path;
/// `NotFound` and `Fatal` are terminal outcomes.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The target place no longer exists at the source.
    #[error("place not found: {place_id}")]
    NotFound { place_id: i64 },
    #[error("retryable task error: {0}")]
    Retryable(String),
    #[error("fatal task error: {0}")]
    Fatal(String),
}

impl TaskError {
    pub fn retryable<S: Into<String>>(msg: S) -> Self {
        Self::Retryable(msg.into())
    }
    pub fn fatal<S: Into<String>>(msg: S) -> Self {
        Self::Fatal(msg.into())
    }
}

/// The injected unit of business work a queue worker runs per task.
///
/// Implementations call the external place/mapping/text services; the
/// coordination layer only cares about the error classification.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &UpdateTask) -> Result<(), TaskError>;
}
