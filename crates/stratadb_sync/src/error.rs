//! Error types for the sync pipeline.
//!
//! Sync errors never affect local database state; they only concern the
//! queue's operation status and pipeline configuration.

use thiserror::Error;
use uuid::Uuid;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A submitted graph contains a dependency cycle. Raised at submission
    /// time so a misconfigured graph fails fast instead of deadlocking.
    #[error("circular operation dependency in graph for pipeline {pipeline}")]
    CircularDependency {
        /// The pipeline the graph was submitted to.
        pipeline: String,
    },

    /// The operation is not (or no longer) in the queue.
    #[error("unknown operation: {uuid}")]
    UnknownOperation {
        /// The operation in question.
        uuid: Uuid,
    },

    /// The operation already reached a terminal status.
    #[error("operation already resolved: {uuid}")]
    AlreadyResolved {
        /// The operation in question.
        uuid: Uuid,
    },

    /// The durable queue contains a malformed record.
    #[error("queue corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },
}

impl SyncError {
    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }
}
