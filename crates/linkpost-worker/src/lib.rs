//! Publish worker.
//!
//! Leases due jobs from the queue, publishes the post through LinkedIn
//! with a bounded pool and a rate limit, and records the outcome on the
//! post row.

pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod rate_limit;

pub use config::WorkerConfig;
pub use error::{JobFailure, JobSuccess, WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use handler::{JobContext, PublishHandler};
pub use logging::JobLogger;
pub use rate_limit::ExecutionLimiter;
