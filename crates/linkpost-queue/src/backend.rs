//! Queue backend abstraction.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueResult;
use crate::job::{
    DeadLetter, ExpiredLeases, FailOutcome, FailureKind, JobRecord, LeasedJob, PublishPostJob, QueueStats,
    RetryPolicy,
};

/// Delay-capable work queue keyed by dedup key.
///
/// Producers use `enqueue`, `find_by_key` and `remove`; the worker uses
/// the lease side (`fetch_due`, `complete`, `fail`, `requeue_expired`).
/// Delivery is at-least-once: a lease that is never completed or failed
/// comes back through `requeue_expired`.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Add a job that becomes due after `delay`.
    ///
    /// Fails with `QueueError::DuplicateJob` while a live job holds the key.
    async fn enqueue(&self, job: &PublishPostJob, delay: Duration, policy: &RetryPolicy) -> QueueResult<()>;

    /// Look up a live job.
    async fn find_by_key(&self, key: &str) -> QueueResult<Option<JobRecord>>;

    /// Remove a job that has not been leased yet.
    ///
    /// Returns `false` when no such job exists or it is already running.
    async fn remove(&self, key: &str) -> QueueResult<bool>;

    /// Lease up to `limit` due jobs.
    async fn fetch_due(&self, limit: usize) -> QueueResult<Vec<LeasedJob>>;

    /// Acknowledge a successful attempt and drop the job.
    async fn complete(&self, job: &LeasedJob) -> QueueResult<()>;

    /// Record a failed attempt: reschedule with backoff or dead-letter.
    async fn fail(&self, job: &LeasedJob, error: &str, kind: FailureKind) -> QueueResult<FailOutcome>;

    /// Return jobs whose lease expired to the due set.
    ///
    /// A job whose expired lease was its last attempt is dead-lettered
    /// instead and reported back, so the caller can fail its post.
    async fn requeue_expired(&self) -> QueueResult<ExpiredLeases>;

    /// Look up the dead letter kept for a key, if any.
    async fn find_dead_letter(&self, key: &str) -> QueueResult<Option<DeadLetter>>;

    /// Queue depth by state.
    async fn stats(&self) -> QueueResult<QueueStats>;
}

/// Decide what to do with a failed attempt.
pub fn fail_outcome(job: &LeasedJob, kind: FailureKind) -> FailOutcome {
    if kind == FailureKind::Fatal {
        return FailOutcome::DeadLettered;
    }

    match job.policy().next_delay(job.attempt) {
        Some(delay) => FailOutcome::Retrying {
            next_attempt: job.attempt + 1,
            delay,
        },
        None => FailOutcome::DeadLettered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkpost_models::{AccountId, PostId};

    fn leased(attempt: u32) -> LeasedJob {
        LeasedJob {
            key: "post-1".to_string(),
            payload: PublishPostJob::new(PostId(1), AccountId(1)),
            attempt,
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            lease_token: "t".to_string(),
        }
    }

    #[test]
    fn test_retryable_within_budget() {
        assert_eq!(
            fail_outcome(&leased(1), FailureKind::Retryable),
            FailOutcome::Retrying {
                next_attempt: 2,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            fail_outcome(&leased(2), FailureKind::Retryable),
            FailOutcome::Retrying {
                next_attempt: 3,
                delay: Duration::from_secs(4)
            }
        );
    }

    #[test]
    fn test_final_attempt_dead_letters() {
        assert_eq!(
            fail_outcome(&leased(3), FailureKind::Retryable),
            FailOutcome::DeadLettered
        );
    }

    #[test]
    fn test_fatal_skips_retries() {
        assert_eq!(fail_outcome(&leased(1), FailureKind::Fatal), FailOutcome::DeadLettered);
    }
}
