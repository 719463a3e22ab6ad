//! Worker error types.

use thiserror::Error;

use linkpost_linkedin::LinkedInError;
use linkpost_models::{AccountId, PostId, PostStatus};
use linkpost_queue::QueueError;
use linkpost_store::StoreError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Post not found: {0}")]
    RecordNotFound(PostId),

    #[error("Linked account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("LinkedIn access token expired. Please re-authenticate.")]
    CredentialExpired,

    #[error("Failed to refresh access token: {0}")]
    CredentialRefreshFailed(String),

    #[error("{0}")]
    PublishRejected(LinkedInError),

    #[error("Publishing timed out after {0} seconds")]
    PublishTimeout(u64),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl From<LinkedInError> for WorkerError {
    fn from(err: LinkedInError) -> Self {
        match err {
            LinkedInError::RefreshFailed(msg) => WorkerError::CredentialRefreshFailed(msg),
            other => WorkerError::PublishRejected(other),
        }
    }
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Check if another attempt may succeed.
    ///
    /// Rejections by LinkedIn count as retryable: tokens get refreshed and
    /// rate limits reset between attempts.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            WorkerError::RecordNotFound(_) | WorkerError::AccountNotFound(_) | WorkerError::ConfigError(_)
        )
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::RecordNotFound(_) => "record_not_found",
            WorkerError::AccountNotFound(_) => "account_not_found",
            WorkerError::CredentialExpired => "credential_expired",
            WorkerError::CredentialRefreshFailed(_) => "credential_refresh_failed",
            WorkerError::PublishRejected(e) => e.kind(),
            WorkerError::PublishTimeout(_) => "timeout",
            WorkerError::ConfigError(_) => "config",
            WorkerError::Store(_) => "store",
            WorkerError::Queue(_) => "queue",
        }
    }
}

/// Successful end of a job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSuccess {
    /// Post went out; carries LinkedIn's id
    Published { external_post_id: String },
    /// Post was no longer pending; nothing was done
    AlreadyTerminal(PostStatus),
}

/// Failed job execution, classified for the queue backend.
#[derive(Debug)]
pub enum JobFailure {
    /// Retry with backoff while attempts remain
    Retryable(WorkerError),
    /// Dead-letter without retrying
    Fatal(WorkerError),
}

impl JobFailure {
    pub fn error(&self) -> &WorkerError {
        match self {
            JobFailure::Retryable(e) | JobFailure::Fatal(e) => e,
        }
    }
}

impl From<WorkerError> for JobFailure {
    fn from(err: WorkerError) -> Self {
        if err.is_retryable() {
            JobFailure::Retryable(err)
        } else {
            JobFailure::Fatal(err)
        }
    }
}
