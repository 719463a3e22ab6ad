//! Scheduled post models.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::AccountId;

/// LinkedIn rejects share commentary longer than this.
pub const MAX_CONTENT_CHARS: usize = 3000;

/// Maximum number of images attached to a single post.
pub const MAX_MEDIA_ITEMS: usize = 9;

/// Primary key of a scheduled post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct PostId(pub i64);

impl PostId {
    /// Get the raw database id.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for PostId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Lifecycle status of a scheduled post.
///
/// `Pending` is the only non-terminal state. The worker moves a post to
/// `Published` or `Failed` exactly once; nothing moves it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    /// Waiting for its scheduled time (or for a retry)
    #[default]
    Pending,
    /// Delivered to LinkedIn
    Published,
    /// Delivery failed after all attempts
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Pending => "pending",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        }
    }

    /// Check if this is a terminal state (no more transitions allowed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, PostStatus::Published | PostStatus::Failed)
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PostStatus::Pending),
            "published" => Ok(PostStatus::Published),
            "failed" => Ok(PostStatus::Failed),
            other => Err(format!("unknown post status: {}", other)),
        }
    }
}

/// A post stored in the relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScheduledPost {
    /// Primary key
    pub id: PostId,
    /// Linked account the post is published from
    pub account_id: AccountId,
    /// Share commentary text
    pub content: String,
    /// Public URLs of images to attach
    #[serde(default)]
    pub media_urls: Vec<String>,
    /// Organization URN when posting as a company page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_urn: Option<String>,
    /// When the post becomes due
    pub scheduled_for: DateTime<Utc>,
    /// Lifecycle status
    pub status: PostStatus,
    /// LinkedIn share URN once published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_post_id: Option<String>,
    /// Last delivery error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// When LinkedIn accepted the post
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl ScheduledPost {
    /// Check if the post still awaits delivery.
    pub fn is_pending(&self) -> bool {
        self.status == PostStatus::Pending
    }

    /// Check if the post has images attached.
    pub fn has_media(&self) -> bool {
        !self.media_urls.is_empty()
    }
}

/// Input for creating a scheduled post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NewPost {
    pub account_id: AccountId,
    pub content: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_urn: Option<String>,
    pub scheduled_for: DateTime<Utc>,
}

impl NewPost {
    pub fn new(account_id: AccountId, content: impl Into<String>, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            account_id,
            content: content.into(),
            media_urls: Vec::new(),
            author_urn: None,
            scheduled_for,
        }
    }

    /// Attach image URLs.
    pub fn with_media(mut self, media_urls: Vec<String>) -> Self {
        self.media_urls = media_urls;
        self
    }

    /// Post as an organization page.
    pub fn with_author_urn(mut self, urn: impl Into<String>) -> Self {
        self.author_urn = Some(urn.into());
        self
    }

    /// Validate content and media references.
    ///
    /// Does not check `scheduled_for`; the scheduler owns that rule.
    pub fn validate(&self) -> Result<(), ContentError> {
        if self.content.trim().is_empty() {
            return Err(ContentError::Empty);
        }

        let chars = self.content.chars().count();
        if chars > MAX_CONTENT_CHARS {
            return Err(ContentError::TooLong {
                chars,
                max: MAX_CONTENT_CHARS,
            });
        }

        if self.media_urls.len() > MAX_MEDIA_ITEMS {
            return Err(ContentError::TooManyMedia {
                count: self.media_urls.len(),
                max: MAX_MEDIA_ITEMS,
            });
        }

        for media in &self.media_urls {
            match url::Url::parse(media) {
                Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
                _ => return Err(ContentError::InvalidMediaUrl(media.clone())),
            }
        }

        if let Some(urn) = &self.author_urn {
            if !urn.starts_with("urn:li:organization:") {
                return Err(ContentError::InvalidAuthorUrn(urn.clone()));
            }
        }

        Ok(())
    }
}

/// Post content validation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("Content is required")]
    Empty,

    #[error("Content exceeds {max} characters ({chars})")]
    TooLong { chars: usize, max: usize },

    #[error("Too many media items: {count} (max {max})")]
    TooManyMedia { count: usize, max: usize },

    #[error("Invalid media URL: {0}")]
    InvalidMediaUrl(String),

    #[error("Invalid organization URN: {0}")]
    InvalidAuthorUrn(String),
}
