//! Repository traits for posts and linked accounts.
//!
//! Status writes are split from the rest of the post repository:
//! the route layer and the scheduler hold a [`PostRepository`], only the
//! worker is handed a [`PostStatusWriter`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use linkpost_models::{AccountId, LinkedAccount, NewPost, PostId, PostStatus, ScheduledPost, TokenGrant};

use crate::error::StoreResult;

/// A status write performed by the worker.
///
/// Every variant only applies to a post that is still `pending`.
#[derive(Debug, Clone, PartialEq)]
pub enum PostTransition {
    /// LinkedIn accepted the post.
    Published {
        external_post_id: String,
        published_at: DateTime<Utc>,
    },
    /// A delivery attempt failed and another attempt will follow.
    /// Records the error but leaves the post `pending`.
    AttemptFailed { error: String },
    /// The final delivery attempt failed.
    Failed { error: String },
}

impl PostTransition {
    /// Status the post ends up in once the transition is applied.
    pub fn target_status(&self) -> PostStatus {
        match self {
            PostTransition::Published { .. } => PostStatus::Published,
            PostTransition::AttemptFailed { .. } => PostStatus::Pending,
            PostTransition::Failed { .. } => PostStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PostTransition::Published { .. } => "published",
            PostTransition::AttemptFailed { .. } => "attempt_failed",
            PostTransition::Failed { .. } => "failed",
        }
    }

    /// Apply the transition to an in-memory post.
    ///
    /// Returns `false` and leaves the post untouched when it is no longer
    /// pending.
    pub fn apply(&self, post: &mut ScheduledPost) -> bool {
        if !post.is_pending() {
            return false;
        }

        match self {
            PostTransition::Published {
                external_post_id,
                published_at,
            } => {
                post.status = PostStatus::Published;
                post.external_post_id = Some(external_post_id.clone());
                post.published_at = Some(*published_at);
                post.error_message = None;
            }
            PostTransition::AttemptFailed { error } => {
                post.error_message = Some(error.clone());
            }
            PostTransition::Failed { error } => {
                post.status = PostStatus::Failed;
                post.error_message = Some(error.clone());
            }
        }
        true
    }
}

/// Post CRUD used by the route layer and the scheduling service.
#[async_trait]
pub trait PostRepository: Send + Sync {
    /// Insert a new `pending` post and return the stored row.
    async fn create(&self, post: &NewPost) -> StoreResult<ScheduledPost>;

    /// Get a post by id.
    async fn find_by_id(&self, id: PostId) -> StoreResult<Option<ScheduledPost>>;

    /// All posts of an account, newest first.
    async fn list_by_account(&self, account_id: AccountId) -> StoreResult<Vec<ScheduledPost>>;

    /// Pending posts whose scheduled time is at or before `now`, oldest first.
    async fn find_pending_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<ScheduledPost>>;

    /// Delete a post owned by `account_id` unless it was published.
    ///
    /// Returns `false` when no row matched.
    async fn delete(&self, id: PostId, account_id: AccountId) -> StoreResult<bool>;
}

/// The narrow status-transition contract owned by the worker.
#[async_trait]
pub trait PostStatusWriter: Send + Sync {
    /// Apply a transition if the post is still pending.
    ///
    /// Returns `true` when a row was updated, `false` when the post is
    /// missing or already terminal.
    async fn update_status(&self, id: PostId, transition: PostTransition) -> StoreResult<bool>;
}

/// Linked account access needed by the worker.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Get an account by id.
    async fn find_by_id(&self, id: AccountId) -> StoreResult<Option<LinkedAccount>>;

    /// Persist a refreshed credential.
    ///
    /// Keeps the stored refresh token when the grant does not rotate it.
    async fn update_tokens(
        &self,
        id: AccountId,
        grant: &TokenGrant,
        now: DateTime<Utc>,
    ) -> StoreResult<LinkedAccount>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_post() -> ScheduledPost {
        ScheduledPost {
            id: PostId(1),
            account_id: AccountId(1),
            content: "hello".to_string(),
            media_urls: Vec::new(),
            author_urn: None,
            scheduled_for: Utc::now(),
            status: PostStatus::Pending,
            external_post_id: None,
            error_message: None,
            created_at: Utc::now(),
            published_at: None,
        }
    }

    #[test]
    fn test_attempt_failed_keeps_pending() {
        let mut post = pending_post();
        let applied = PostTransition::AttemptFailed {
            error: "timeout".to_string(),
        }
        .apply(&mut post);

        assert!(applied);
        assert_eq!(post.status, PostStatus::Pending);
        assert_eq!(post.error_message.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_published_clears_error() {
        let mut post = pending_post();
        post.error_message = Some("earlier failure".to_string());
        let now = Utc::now();

        PostTransition::Published {
            external_post_id: "urn:li:share:1".to_string(),
            published_at: now,
        }
        .apply(&mut post);

        assert_eq!(post.status, PostStatus::Published);
        assert_eq!(post.external_post_id.as_deref(), Some("urn:li:share:1"));
        assert_eq!(post.published_at, Some(now));
        assert!(post.error_message.is_none());
    }

    #[test]
    fn test_terminal_post_is_not_touched() {
        let mut post = pending_post();
        PostTransition::Failed {
            error: "boom".to_string(),
        }
        .apply(&mut post);
        let snapshot = post.clone();

        let applied = PostTransition::Published {
            external_post_id: "urn:li:share:2".to_string(),
            published_at: Utc::now(),
        }
        .apply(&mut post);

        assert!(!applied);
        assert_eq!(post, snapshot);
    }
}
