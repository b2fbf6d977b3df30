//! Error types for the queue and the coordinator.

use db::DbError;
use render_core::JobId;
use thiserror::Error;

/// Errors returned by the local priority queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Job {0} is already queued or running")]
    AlreadyTracked(JobId),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Only jobs still waiting in the backlog can be changed.
    #[error("Job {0} is no longer queued")]
    NotQueued(JobId),

    #[error("Queue is stopped")]
    Stopped,

    #[error("Actor error: {0}")]
    Actor(String),
}

/// Errors returned by the distributed coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Duplicate job: {0}")]
    DuplicateJob(JobId),

    #[error(transparent)]
    Queue(QueueError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Coordinator is shutting down")]
    ShuttingDown,
}

impl From<QueueError> for CoordinatorError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::AlreadyTracked(id) => CoordinatorError::DuplicateJob(id),
            QueueError::Stopped => CoordinatorError::ShuttingDown,
            other => CoordinatorError::Queue(other),
        }
    }
}
