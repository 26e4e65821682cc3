use encore_queue::QueueError;
use std::time::Duration;
use thiserror::Error;

/// Errors from the operation, metadata and blob stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid record: {0}")]
    Validation(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store temporarily unavailable: {0}")]
    Retryable(String),

    #[error("Store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Retryable(_))
    }
}

/// Failures producing encoded audio for a job.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} timed out after {after:?}")]
    Timeout { program: String, after: Duration },

    #[error("{program} produced no audio")]
    Empty { program: String },
}

/// Why processing a queue message did not complete.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Undecodable job request: {0}")]
    Decode(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Acquisition failed: {0}")]
    Acquire(#[from] AcquireError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl ProcessError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessError::Decode(_) => false,
            ProcessError::Store(e) => e.is_retryable(),
            ProcessError::Acquire(_) => true,
            ProcessError::Queue(e) => e.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(StoreError::Retryable("pool timed out".into()).is_retryable());
        assert!(!StoreError::Validation("title is required".into()).is_retryable());
        assert!(!StoreError::DuplicateKey("abc".into()).is_retryable());

        let acquire = ProcessError::from(AcquireError::Empty {
            program: "fetch".into(),
        });
        assert!(acquire.is_retryable());

        let backend = ProcessError::from(StoreError::Backend("bad row".into()));
        assert!(!backend.is_retryable());

        let queue = ProcessError::from(QueueError::Connection("broker down".into()));
        assert!(queue.is_retryable());
    }
}
