//! Delayed publish-job queue.
//!
//! This crate provides:
//! - A deduplicated, delay-capable job backend on Redis
//! - An in-memory backend for tests and local runs
//! - Retry policy with exponential backoff and a dead list
//! - The producer-side scheduler

pub mod backend;
pub mod error;
pub mod job;
pub mod memory;
pub mod queue;
pub mod scheduler;

pub use backend::{fail_outcome, JobBackend};
pub use error::{QueueError, QueueResult};
pub use job::{
    job_key, DeadLetter, ExpiredLeases, FailOutcome, FailureKind, JobRecord, JobState, LeasedJob,
    PublishPostJob, QueueStats, RetryPolicy, DEFAULT_DEAD_LETTER_MAX,
};
pub use memory::InMemoryJobQueue;
pub use queue::{QueueConfig, RedisJobQueue};
pub use scheduler::PostScheduler;
