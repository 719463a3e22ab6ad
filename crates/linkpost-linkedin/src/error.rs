//! LinkedIn client error types.

use thiserror::Error;

pub type LinkedInResult<T> = Result<T, LinkedInError>;

#[derive(Debug, Error)]
pub enum LinkedInError {
    #[error("LinkedIn API rate limit exceeded. Please try again later.")]
    RateLimited,

    #[error("LinkedIn access token expired. Please re-authenticate.")]
    AuthExpired,

    #[error("LinkedIn rejected the post content: {0}")]
    ContentInvalid(String),

    #[error("LinkedIn API error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Failed to refresh access token: {0}")]
    RefreshFailed(String),

    #[error("Failed to upload image to LinkedIn: {0}")]
    MediaUpload(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LinkedInError {
    pub fn content_invalid(msg: impl Into<String>) -> Self {
        Self::ContentInvalid(msg.into())
    }

    pub fn refresh_failed(msg: impl Into<String>) -> Self {
        Self::RefreshFailed(msg.into())
    }

    pub fn media_upload(msg: impl Into<String>) -> Self {
        Self::MediaUpload(msg.into())
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Map a non-success publish response to an error.
    pub fn from_status(status: u16, message: Option<String>) -> Self {
        match status {
            429 => Self::RateLimited,
            401 => Self::AuthExpired,
            400 | 422 => Self::ContentInvalid(message.unwrap_or_else(|| "rejected".to_string())),
            _ => Self::Remote {
                status,
                message: message.unwrap_or_else(|| "Failed to publish post to LinkedIn".to_string()),
            },
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            LinkedInError::RateLimited => "rate_limited",
            LinkedInError::AuthExpired => "auth_expired",
            LinkedInError::ContentInvalid(_) => "content_invalid",
            LinkedInError::Remote { .. } => "remote",
            LinkedInError::RefreshFailed(_) => "refresh_failed",
            LinkedInError::MediaUpload(_) => "media_upload",
            LinkedInError::InvalidResponse(_) | LinkedInError::Json(_) => "invalid_response",
            LinkedInError::Network(_) => "network",
        }
    }
}
