//! Queue error types.

use chrono::{DateTime, Utc};
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Scheduled time {scheduled_for} must be after {now}")]
    InvalidScheduleTime {
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error("Duplicate job: {0}")]
    DuplicateJob(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Enqueue failed: {0}")]
    EnqueueFailed(String),

    #[error("Lease lost for job: {0}")]
    LeaseLost(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn enqueue_failed(msg: impl Into<String>) -> Self {
        Self::EnqueueFailed(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Check if the error was caused by a duplicate dedup key.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, QueueError::DuplicateJob(_))
    }
}
