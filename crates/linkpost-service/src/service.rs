//! Post operations used by the HTTP layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{info, warn};

use linkpost_models::{AccountId, NewPost, PostId, PostStatus, ScheduledPost};
use linkpost_queue::{PostScheduler, QueueError};
use linkpost_store::PostRepository;

use crate::error::{ServiceError, ServiceResult};

/// Creates, schedules and removes posts.
///
/// Never calls LinkedIn: immediate publishing goes through the queue like
/// any scheduled post.
#[derive(Clone)]
pub struct PostService {
    posts: Arc<dyn PostRepository>,
    scheduler: PostScheduler,
}

impl PostService {
    pub fn new(posts: Arc<dyn PostRepository>, scheduler: PostScheduler) -> Self {
        Self { posts, scheduler }
    }

    pub fn scheduler(&self) -> &PostScheduler {
        &self.scheduler
    }

    /// Store a post and schedule it for `scheduled_for`.
    pub async fn submit(&self, post: NewPost) -> ServiceResult<ScheduledPost> {
        self.submit_at(post, Utc::now()).await
    }

    /// [`submit`](Self::submit) with an explicit clock reading.
    pub async fn submit_at(&self, post: NewPost, now: DateTime<Utc>) -> ServiceResult<ScheduledPost> {
        post.validate()?;
        if post.scheduled_for <= now {
            return Err(QueueError::InvalidScheduleTime {
                scheduled_for: post.scheduled_for,
                now,
            }
            .into());
        }

        let created = self.posts.create(&post).await?;

        if let Err(e) = self
            .scheduler
            .schedule_at(created.id, created.account_id, created.scheduled_for, now)
            .await
        {
            warn!(post_id = %created.id, "Scheduling failed, removing post: {}", e);
            self.posts.delete(created.id, created.account_id).await?;
            return Err(e.into());
        }

        counter!("linkpost_posts_submitted_total", "mode" => "scheduled").increment(1);
        info!(post_id = %created.id, scheduled_for = %created.scheduled_for, "Post scheduled");
        Ok(created)
    }

    /// Store a post and queue it for immediate delivery.
    ///
    /// Returns as soon as the job is enqueued; the post is still `pending`.
    pub async fn publish_now(&self, mut post: NewPost) -> ServiceResult<ScheduledPost> {
        post.validate()?;
        post.scheduled_for = Utc::now();

        let created = self.posts.create(&post).await?;

        if let Err(e) = self.scheduler.enqueue_now(created.id, created.account_id).await {
            warn!(post_id = %created.id, "Enqueue failed, removing post: {}", e);
            self.posts.delete(created.id, created.account_id).await?;
            return Err(e.into());
        }

        counter!("linkpost_posts_submitted_total", "mode" => "immediate").increment(1);
        info!(post_id = %created.id, "Post queued for immediate publish");
        Ok(created)
    }

    /// Fetch a post owned by `account_id`.
    pub async fn get(&self, post_id: PostId, account_id: AccountId) -> ServiceResult<ScheduledPost> {
        self.posts
            .find_by_id(post_id)
            .await?
            .filter(|p| p.account_id == account_id)
            .ok_or(ServiceError::PostNotFound(post_id))
    }

    /// Posts of an account, newest first.
    pub async fn list(&self, account_id: AccountId) -> ServiceResult<Vec<ScheduledPost>> {
        Ok(self.posts.list_by_account(account_id).await?)
    }

    /// Cancel the post's job and delete the row.
    ///
    /// Published posts cannot be deleted.
    pub async fn delete(&self, post_id: PostId, account_id: AccountId) -> ServiceResult<()> {
        let post = self.get(post_id, account_id).await?;
        if post.status == PostStatus::Published {
            return Err(ServiceError::AlreadyPublished(post_id));
        }

        self.scheduler.cancel(post_id).await?;

        if !self.posts.delete(post_id, account_id).await? {
            // Published between the read and the delete
            return Err(ServiceError::AlreadyPublished(post_id));
        }

        info!(post_id = %post_id, "Post deleted");
        Ok(())
    }

    /// Re-enqueue pending posts that are due but have no live job.
    ///
    /// Returns how many posts were enqueued.
    pub async fn reconcile_overdue(&self) -> ServiceResult<usize> {
        self.reconcile_overdue_at(Utc::now()).await
    }

    pub async fn reconcile_overdue_at(&self, now: DateTime<Utc>) -> ServiceResult<usize> {
        let due = self.posts.find_pending_due(now).await?;
        let mut enqueued = 0;

        for post in due {
            if self.scheduler.is_scheduled(post.id).await? {
                continue;
            }
            // The worker gave up on it; only its status write is missing
            if let Some(dead) = self.scheduler.dead_letter(post.id).await? {
                warn!(post_id = %post.id, "Overdue post was dead-lettered ({}), not re-enqueued", dead.error);
                continue;
            }

            match self.scheduler.enqueue_now(post.id, post.account_id).await {
                Ok(()) => {
                    warn!(post_id = %post.id, "Overdue post had no job, re-enqueued");
                    enqueued += 1;
                }
                // Raced with another producer
                Err(e) if e.is_duplicate() => {}
                Err(e) => return Err(e.into()),
            }
        }

        if enqueued > 0 {
            counter!("linkpost_posts_reconciled_total").increment(enqueued as u64);
        }
        Ok(enqueued)
    }
}
