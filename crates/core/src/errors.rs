use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("database operation error: {0}")]
    DatabaseOperation(String),
    #[error("coordination store error: {0}")]
    Store(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("worker not found: {id}")]
    WorkerNotFound { id: String },
    #[error("batch not found: {name}")]
    BatchNotFound { name: String },
    #[error("checkpoint not found: {batch_name}/{region_type}/{region_code}")]
    CheckpointNotFound {
        batch_name: String,
        region_type: String,
        region_code: String,
    },
    #[error("invalid state transition: {0}")]
    InvalidState(String),
    #[error("operation timeout: {0}")]
    Timeout(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn store_error<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn worker_not_found<S: Into<String>>(id: S) -> Self {
        Self::WorkerNotFound { id: id.into() }
    }
    pub fn batch_not_found<S: Into<String>>(name: S) -> Self {
        Self::BatchNotFound { name: name.into() }
    }
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Database(_)
                | PipelineError::DatabaseOperation(_)
                | PipelineError::Store(_)
                | PipelineError::Timeout(_)
        )
    }
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Configuration(_) | PipelineError::Internal(_)
        )
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_timeout_errors_are_retryable() {
        assert!(PipelineError::store_error("BLPOP failed").is_retryable());
        assert!(PipelineError::Timeout("pop".to_string()).is_retryable());
        assert!(!PipelineError::config_error("bad url").is_retryable());
    }

    #[test]
    fn configuration_errors_are_fatal() {
        assert!(PipelineError::config_error("missing database url").is_fatal());
        assert!(!PipelineError::store_error("transient").is_fatal());
    }
}
