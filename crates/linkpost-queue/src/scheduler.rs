//! Producer side of the publish queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use linkpost_models::{AccountId, PostId};

use crate::backend::JobBackend;
use crate::error::{QueueError, QueueResult};
use crate::job::{job_key, DeadLetter, JobRecord, PublishPostJob, RetryPolicy};

/// Enqueues and cancels publish jobs.
#[derive(Clone)]
pub struct PostScheduler {
    backend: Arc<dyn JobBackend>,
    policy: RetryPolicy,
}

impl PostScheduler {
    pub fn new(backend: Arc<dyn JobBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn backend(&self) -> &Arc<dyn JobBackend> {
        &self.backend
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Schedule the post to be published at `scheduled_for`.
    pub async fn schedule(
        &self,
        post_id: PostId,
        account_id: AccountId,
        scheduled_for: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.schedule_at(post_id, account_id, scheduled_for, Utc::now()).await
    }

    /// Like [`schedule`](Self::schedule) with an explicit clock reading.
    ///
    /// Rejects times that are not strictly in the future.
    pub async fn schedule_at(
        &self,
        post_id: PostId,
        account_id: AccountId,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let delay = (scheduled_for - now)
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or(QueueError::InvalidScheduleTime { scheduled_for, now })?;

        self.backend
            .enqueue(&PublishPostJob::new(post_id, account_id), delay, &self.policy)
            .await?;

        info!(post_id = %post_id, delay_ms = delay.as_millis() as u64, "Scheduled post");
        Ok(())
    }

    /// Enqueue the post for immediate delivery.
    pub async fn enqueue_now(&self, post_id: PostId, account_id: AccountId) -> QueueResult<()> {
        self.backend
            .enqueue(&PublishPostJob::new(post_id, account_id), Duration::ZERO, &self.policy)
            .await?;

        info!(post_id = %post_id, "Enqueued post for immediate publish");
        Ok(())
    }

    /// Remove the post's pending job.
    ///
    /// Returns `false` when there was nothing to remove or the job is
    /// already running. Calling it twice is harmless.
    pub async fn cancel(&self, post_id: PostId) -> QueueResult<bool> {
        let removed = self.backend.remove(&job_key(post_id)).await?;
        debug!(post_id = %post_id, removed, "Cancel requested");
        Ok(removed)
    }

    /// Whether a live job exists for the post.
    pub async fn is_scheduled(&self, post_id: PostId) -> QueueResult<bool> {
        Ok(self.job(post_id).await?.is_some())
    }

    /// The post's live job, if any.
    pub async fn job(&self, post_id: PostId) -> QueueResult<Option<JobRecord>> {
        self.backend.find_by_key(&job_key(post_id)).await
    }

    /// The post's dead letter, if its job gave up.
    pub async fn dead_letter(&self, post_id: PostId) -> QueueResult<Option<DeadLetter>> {
        self.backend.find_dead_letter(&job_key(post_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::memory::InMemoryJobQueue;

    fn scheduler() -> (PostScheduler, InMemoryJobQueue) {
        let queue = InMemoryJobQueue::default();
        let scheduler = PostScheduler::new(Arc::new(queue.clone()), RetryPolicy::default());
        (scheduler, queue)
    }

    #[tokio::test]
    async fn test_schedule_future_post() {
        let (scheduler, _) = scheduler();
        let now = Utc::now();

        scheduler
            .schedule_at(PostId(1), AccountId(1), now + chrono::Duration::minutes(5), now)
            .await
            .unwrap();

        let job = scheduler.job(PostId(1)).await.unwrap().unwrap();
        assert_eq!(job.key, "post-1");
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_schedule_rejects_past_and_present() {
        let (scheduler, queue) = scheduler();
        let now = Utc::now();

        let past = scheduler
            .schedule_at(PostId(1), AccountId(1), now - chrono::Duration::seconds(1), now)
            .await;
        assert!(matches!(past, Err(QueueError::InvalidScheduleTime { .. })));

        let present = scheduler.schedule_at(PostId(1), AccountId(1), now, now).await;
        assert!(matches!(present, Err(QueueError::InvalidScheduleTime { .. })));

        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_schedule_twice_keeps_one_job() {
        let (scheduler, queue) = scheduler();
        let now = Utc::now();
        let at = now + chrono::Duration::minutes(5);

        scheduler.schedule_at(PostId(1), AccountId(1), at, now).await.unwrap();
        let again = scheduler.schedule_at(PostId(1), AccountId(1), at, now).await;

        assert!(again.unwrap_err().is_duplicate());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (scheduler, _) = scheduler();
        scheduler.enqueue_now(PostId(2), AccountId(1)).await.unwrap();
        assert!(scheduler.is_scheduled(PostId(2)).await.unwrap());

        assert!(scheduler.cancel(PostId(2)).await.unwrap());
        assert!(!scheduler.cancel(PostId(2)).await.unwrap());
        assert!(!scheduler.is_scheduled(PostId(2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_dead_letter_lookup() {
        let queue = InMemoryJobQueue::default();
        let scheduler = PostScheduler::new(Arc::new(queue.clone()), RetryPolicy::new(1, Duration::from_secs(1)));
        scheduler.enqueue_now(PostId(7), AccountId(1)).await.unwrap();
        assert!(scheduler.dead_letter(PostId(7)).await.unwrap().is_none());

        let leased = queue.fetch_due(1).await.unwrap().remove(0);
        queue
            .fail(&leased, "LinkedIn API error: 500", crate::job::FailureKind::Retryable)
            .await
            .unwrap();

        let dead = scheduler.dead_letter(PostId(7)).await.unwrap().expect("dead letter kept");
        assert_eq!(dead.error, "LinkedIn API error: 500");
        assert!(!scheduler.is_scheduled(PostId(7)).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_unknown_post() {
        let (scheduler, _) = scheduler();
        assert!(!scheduler.cancel(PostId(77)).await.unwrap());
    }
}
