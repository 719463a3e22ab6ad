//! Job types for the publish queue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use linkpost_models::{AccountId, PostId};

/// Dedup key of the job that publishes `post_id`.
pub fn job_key(post_id: PostId) -> String {
    format!("post-{}", post_id)
}

/// Payload of a publish job.
///
/// Carries references only; the worker re-reads the post content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishPostJob {
    pub post_id: PostId,
    pub account_id: AccountId,
}

impl PublishPostJob {
    pub fn new(post_id: PostId, account_id: AccountId) -> Self {
        Self { post_id, account_id }
    }

    /// Dedup key for this job.
    pub fn key(&self) -> String {
        job_key(self.post_id)
    }
}

/// Bounded attempts with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
        }
    }

    /// Backoff after the given failed attempt (1-based): base, 2×base, 4×base, ...
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exponent)
    }

    /// Delay before the next attempt, or `None` when the budget is spent.
    pub fn next_delay(&self, failed_attempt: u32) -> Option<Duration> {
        if failed_attempt < self.max_attempts {
            Some(self.backoff_for(failed_attempt))
        } else {
            None
        }
    }
}

/// Where a job currently sits in the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its due time (first attempt or backoff)
    Delayed,
    /// Leased to a worker
    Active,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Delayed => "delayed",
            JobState::Active => "active",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "delayed" => Some(JobState::Delayed),
            "active" => Some(JobState::Active),
            _ => None,
        }
    }
}

/// Snapshot of a live job, as returned by `find_by_key`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub key: String,
    pub payload: PublishPostJob,
    pub state: JobState,
    /// Attempts started so far
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub due_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// A job handed to a worker for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedJob {
    pub key: String,
    pub payload: PublishPostJob,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
    pub(crate) backoff_base: Duration,
    pub(crate) lease_token: String,
}

impl LeasedJob {
    /// Whether a failure of this attempt exhausts the retry budget.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Retry policy the job was enqueued with.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: self.backoff_base,
        }
    }
}

/// How the backend should treat a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retry with backoff while attempts remain
    Retryable,
    /// Dead-letter immediately
    Fatal,
}

/// What the backend did with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled after `delay`
    Retrying { next_attempt: u32, delay: Duration },
    /// Removed from the live queue and kept in the dead list
    DeadLettered,
}

/// Entry kept in the dead list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub key: String,
    pub payload: PublishPostJob,
    pub attempts_made: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Dead letters kept when no cap is configured.
pub const DEFAULT_DEAD_LETTER_MAX: usize = 1000;

/// Result of a lease-expiry sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpiredLeases {
    /// Jobs handed back to the due set for another attempt
    pub requeued: usize,
    /// Jobs whose final attempt expired; their posts still need a terminal status
    pub dead_lettered: Vec<DeadLetter>,
}

impl ExpiredLeases {
    pub fn total(&self) -> usize {
        self.requeued + self.dead_lettered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Queue depth by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub delayed: u64,
    pub active: u64,
    pub dead: u64,
}
