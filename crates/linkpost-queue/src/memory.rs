//! In-process queue backend.
//!
//! Due times use `tokio::time::Instant`, so tests can drive the queue with
//! a paused runtime clock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{fail_outcome, JobBackend};
use crate::error::{QueueError, QueueResult};
use crate::job::{
    DeadLetter, ExpiredLeases, FailOutcome, FailureKind, JobRecord, JobState, LeasedJob, PublishPostJob,
    QueueStats, RetryPolicy, DEFAULT_DEAD_LETTER_MAX,
};

struct Entry {
    payload: PublishPostJob,
    state: JobState,
    attempts_made: u32,
    policy: RetryPolicy,
    due: Instant,
    due_at: chrono::DateTime<Utc>,
    last_error: Option<String>,
    lease_token: Option<String>,
    lease_deadline: Option<Instant>,
}

impl Entry {
    fn record(&self, key: &str) -> JobRecord {
        JobRecord {
            key: key.to_string(),
            payload: self.payload,
            state: self.state,
            attempts_made: self.attempts_made,
            max_attempts: self.policy.max_attempts,
            due_at: self.due_at,
            last_error: self.last_error.clone(),
        }
    }

    fn reschedule(&mut self, delay: Duration, error: &str) {
        self.state = JobState::Delayed;
        self.due = Instant::now() + delay;
        self.due_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self.last_error = Some(error.to_string());
        self.lease_token = None;
        self.lease_deadline = None;
    }
}

struct Inner {
    jobs: HashMap<String, Entry>,
    /// Oldest first, capped at `dead_letter_max`
    dead: Vec<DeadLetter>,
    dead_letter_max: usize,
    leases_issued: u64,
}

impl Inner {
    fn leased_entry(&mut self, job: &LeasedJob) -> QueueResult<&mut Entry> {
        match self.jobs.get_mut(&job.key) {
            Some(entry) if entry.lease_token.as_deref() == Some(job.lease_token.as_str()) => Ok(entry),
            _ => Err(QueueError::LeaseLost(job.key.clone())),
        }
    }

    fn dead_letter(&mut self, key: &str, error: &str) -> Option<DeadLetter> {
        let entry = self.jobs.remove(key)?;
        let dead = DeadLetter {
            key: key.to_string(),
            payload: entry.payload,
            attempts_made: entry.attempts_made,
            error: error.to_string(),
            failed_at: Utc::now(),
        };

        self.dead.push(dead.clone());
        if self.dead.len() > self.dead_letter_max {
            let excess = self.dead.len() - self.dead_letter_max;
            self.dead.drain(..excess);
        }
        Some(dead)
    }
}

/// Queue backend held entirely in memory.
#[derive(Clone)]
pub struct InMemoryJobQueue {
    inner: Arc<Mutex<Inner>>,
    visibility_timeout: Duration,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl InMemoryJobQueue {
    /// Create a queue whose leases expire after `visibility_timeout`.
    pub fn new(visibility_timeout: Duration) -> Self {
        Self::with_limits(visibility_timeout, DEFAULT_DEAD_LETTER_MAX)
    }

    /// Like [`new`](Self::new), keeping at most `dead_letter_max` dead letters.
    pub fn with_limits(visibility_timeout: Duration, dead_letter_max: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                jobs: HashMap::new(),
                dead: Vec::new(),
                dead_letter_max: dead_letter_max.max(1),
                leases_issued: 0,
            })),
            visibility_timeout,
        }
    }

    /// Jobs that exhausted their retries or failed fatally, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().await.dead.clone()
    }

    /// Number of live jobs.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobBackend for InMemoryJobQueue {
    async fn enqueue(&self, job: &PublishPostJob, delay: Duration, policy: &RetryPolicy) -> QueueResult<()> {
        let key = job.key();
        let mut inner = self.inner.lock().await;

        if inner.jobs.contains_key(&key) {
            warn!("Duplicate job rejected: {}", key);
            return Err(QueueError::DuplicateJob(key));
        }

        inner.jobs.insert(
            key.clone(),
            Entry {
                payload: *job,
                state: JobState::Delayed,
                attempts_made: 0,
                policy: *policy,
                due: Instant::now() + delay,
                due_at: Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
                last_error: None,
                lease_token: None,
                lease_deadline: None,
            },
        );

        debug!("Enqueued job {} with delay {:?}", key, delay);
        Ok(())
    }

    async fn find_by_key(&self, key: &str) -> QueueResult<Option<JobRecord>> {
        Ok(self.inner.lock().await.jobs.get(key).map(|e| e.record(key)))
    }

    async fn remove(&self, key: &str) -> QueueResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get(key).map(|e| e.state) {
            Some(JobState::Delayed) => {
                inner.jobs.remove(key);
                Ok(true)
            }
            Some(JobState::Active) => {
                debug!("Job {} is running, not removed", key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn fetch_due(&self, limit: usize) -> QueueResult<Vec<LeasedJob>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let mut due: Vec<(Instant, String)> = inner
            .jobs
            .iter()
            .filter(|(_, e)| e.state == JobState::Delayed && e.due <= now)
            .map(|(k, e)| (e.due, k.clone()))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut leased = Vec::with_capacity(due.len());
        for (_, key) in due {
            inner.leases_issued += 1;
            let token = format!("lease-{}", inner.leases_issued);
            let deadline = now + self.visibility_timeout;

            if let Some(entry) = inner.jobs.get_mut(&key) {
                entry.state = JobState::Active;
                entry.attempts_made += 1;
                entry.lease_token = Some(token.clone());
                entry.lease_deadline = Some(deadline);

                leased.push(LeasedJob {
                    key: key.clone(),
                    payload: entry.payload,
                    attempt: entry.attempts_made,
                    max_attempts: entry.policy.max_attempts,
                    backoff_base: entry.policy.backoff_base,
                    lease_token: token,
                });
            }
        }

        Ok(leased)
    }

    async fn complete(&self, job: &LeasedJob) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        inner.leased_entry(job)?;
        inner.jobs.remove(&job.key);
        Ok(())
    }

    async fn fail(&self, job: &LeasedJob, error: &str, kind: FailureKind) -> QueueResult<FailOutcome> {
        let mut inner = self.inner.lock().await;
        inner.leased_entry(job)?;

        let outcome = fail_outcome(job, kind);
        match outcome {
            FailOutcome::Retrying { delay, .. } => {
                if let Some(entry) = inner.jobs.get_mut(&job.key) {
                    entry.reschedule(delay, error);
                }
            }
            FailOutcome::DeadLettered => {
                inner.dead_letter(&job.key, error);
            }
        }
        Ok(outcome)
    }

    async fn requeue_expired(&self) -> QueueResult<ExpiredLeases> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let expired: Vec<String> = inner
            .jobs
            .iter()
            .filter(|(_, e)| e.state == JobState::Active && e.lease_deadline.map(|d| d <= now).unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect();

        let mut report = ExpiredLeases::default();
        for key in &expired {
            let exhausted = inner
                .jobs
                .get(key)
                .map(|e| e.attempts_made >= e.policy.max_attempts)
                .unwrap_or(false);

            if exhausted {
                if let Some(dead) = inner.dead_letter(key, "lease expired") {
                    report.dead_lettered.push(dead);
                }
            } else if let Some(entry) = inner.jobs.get_mut(key) {
                entry.reschedule(Duration::ZERO, "lease expired");
                report.requeued += 1;
            }
        }

        Ok(report)
    }

    async fn find_dead_letter(&self, key: &str) -> QueueResult<Option<DeadLetter>> {
        let inner = self.inner.lock().await;
        Ok(inner.dead.iter().rev().find(|d| d.key == key).cloned())
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let inner = self.inner.lock().await;
        let active = inner.jobs.values().filter(|e| e.state == JobState::Active).count() as u64;
        Ok(QueueStats {
            delayed: inner.jobs.len() as u64 - active,
            active,
            dead: inner.dead.len() as u64,
        })
    }
}
