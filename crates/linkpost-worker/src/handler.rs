//! Per-job publish algorithm.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use linkpost_linkedin::{PostPublisher, TokenRefresher};
use linkpost_models::{LinkedAccount, PostId, ScheduledPost};
use linkpost_queue::LeasedJob;
use linkpost_store::{AccountRepository, PostRepository, PostStatusWriter, PostTransition};

use crate::error::{JobFailure, JobSuccess, WorkerError, WorkerResult};
use crate::metrics;

/// What the handler needs to know about the attempt it is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobContext {
    pub post_id: PostId,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
}

impl JobContext {
    pub fn new(post_id: PostId, attempt: u32, max_attempts: u32) -> Self {
        Self {
            post_id,
            attempt,
            max_attempts,
        }
    }

    /// Whether a failure now exhausts the retry budget.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

impl From<&LeasedJob> for JobContext {
    fn from(job: &LeasedJob) -> Self {
        Self::new(job.payload.post_id, job.attempt, job.max_attempts)
    }
}

/// Publishes one post per call and records the result on the post row.
///
/// Only this type writes post status.
pub struct PublishHandler {
    posts: Arc<dyn PostRepository>,
    status: Arc<dyn PostStatusWriter>,
    accounts: Arc<dyn AccountRepository>,
    publisher: Arc<dyn PostPublisher>,
    refresher: Arc<dyn TokenRefresher>,
    publish_timeout: Duration,
}

impl PublishHandler {
    pub fn new(
        posts: Arc<dyn PostRepository>,
        status: Arc<dyn PostStatusWriter>,
        accounts: Arc<dyn AccountRepository>,
        publisher: Arc<dyn PostPublisher>,
        refresher: Arc<dyn TokenRefresher>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            posts,
            status,
            accounts,
            publisher,
            refresher,
            publish_timeout,
        }
    }

    /// Run one attempt for the job.
    ///
    /// On failure the error message is stored on the post. The post only
    /// becomes `failed` on the final attempt, so retries still see it
    /// `pending`.
    pub async fn handle(&self, ctx: &JobContext) -> Result<JobSuccess, JobFailure> {
        let post = match self.posts.find_by_id(ctx.post_id).await {
            Ok(Some(post)) => post,
            Ok(None) => return Err(JobFailure::Fatal(WorkerError::RecordNotFound(ctx.post_id))),
            Err(e) => return Err(JobFailure::Retryable(e.into())),
        };

        if !post.is_pending() {
            debug!(post_id = %post.id, status = %post.status, "Post already terminal, skipping");
            return Ok(JobSuccess::AlreadyTerminal(post.status));
        }

        match self.publish(&post).await {
            Ok(external_post_id) => self.record_published(&post, external_post_id).await,
            Err(err) => Err(self.record_failure(ctx, err).await),
        }
    }

    async fn publish(&self, post: &ScheduledPost) -> WorkerResult<String> {
        let account = self
            .accounts
            .find_by_id(post.account_id)
            .await?
            .ok_or(WorkerError::AccountNotFound(post.account_id))?;

        let account = self.ensure_fresh_credential(account).await?;

        let started = Instant::now();
        let result = tokio::time::timeout(self.publish_timeout, self.publisher.publish(&account, post)).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(Ok(external_id)) => {
                metrics::record_publish_duration("success", elapsed);
                Ok(external_id)
            }
            Ok(Err(e)) => {
                metrics::record_publish_duration("error", elapsed);
                Err(e.into())
            }
            Err(_) => {
                metrics::record_publish_duration("timeout", elapsed);
                Err(WorkerError::PublishTimeout(self.publish_timeout.as_secs()))
            }
        }
    }

    /// Refresh the access token if it has expired. Runs at most once per call.
    async fn ensure_fresh_credential(&self, account: LinkedAccount) -> WorkerResult<LinkedAccount> {
        let now = Utc::now();
        if !account.is_token_expired_at(now) {
            return Ok(account);
        }

        let Some(refresh_token) = account.refresh_token.as_deref() else {
            metrics::record_token_refresh("unavailable");
            return Err(WorkerError::CredentialExpired);
        };

        info!(account_id = %account.id, "Access token expired, refreshing");
        let grant = match self.refresher.refresh(refresh_token).await {
            Ok(grant) => grant,
            Err(e) => {
                metrics::record_token_refresh("error");
                return Err(e.into());
            }
        };

        let updated = self.accounts.update_tokens(account.id, &grant, now).await?;
        metrics::record_token_refresh("success");
        Ok(updated)
    }

    async fn record_published(
        &self,
        post: &ScheduledPost,
        external_post_id: String,
    ) -> Result<JobSuccess, JobFailure> {
        let transition = PostTransition::Published {
            external_post_id: external_post_id.clone(),
            published_at: Utc::now(),
        };

        match self.status.update_status(post.id, transition).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(post_id = %post.id, "Post changed while publishing, status left as is");
            }
            Err(e) => return Err(JobFailure::Retryable(e.into())),
        }

        Ok(JobSuccess::Published { external_post_id })
    }

    async fn record_failure(&self, ctx: &JobContext, err: WorkerError) -> JobFailure {
        let message = err.to_string();
        let failure = JobFailure::from(err);

        let transition = if ctx.is_final_attempt() || matches!(failure, JobFailure::Fatal(_)) {
            PostTransition::Failed { error: message }
        } else {
            PostTransition::AttemptFailed { error: message }
        };

        if let Err(e) = self.status.update_status(ctx.post_id, transition).await {
            warn!(post_id = %ctx.post_id, "Failed to record publish error: {}", e);
        }

        failure
    }

    /// Mark the post failed after its job was dead-lettered.
    ///
    /// Returns `false` when the post is missing or already terminal.
    pub async fn mark_dead_lettered(&self, post_id: PostId, error: &str) -> WorkerResult<bool> {
        let transition = PostTransition::Failed {
            error: error.to_string(),
        };
        let changed = self.status.update_status(post_id, transition).await?;
        if changed {
            info!(post_id = %post_id, "Dead-lettered post marked failed");
        }
        Ok(changed)
    }
}
