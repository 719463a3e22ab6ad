//! Service error types.

use thiserror::Error;

use linkpost_models::{ContentError, PostId};
use linkpost_queue::QueueError;
use linkpost_store::StoreError;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid post: {0}")]
    InvalidPost(#[from] ContentError),

    #[error("Post not found: {0}")]
    PostNotFound(PostId),

    #[error("Cannot delete published post {0}")]
    AlreadyPublished(PostId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl ServiceError {
    /// Whether the caller sent something unacceptable, as opposed to an
    /// infrastructure failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServiceError::InvalidPost(_)
                | ServiceError::PostNotFound(_)
                | ServiceError::AlreadyPublished(_)
                | ServiceError::Queue(QueueError::InvalidScheduleTime { .. })
        )
    }
}
