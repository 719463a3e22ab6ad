//! Producer-side post operations.
//!
//! Validates and stores posts, schedules or immediately enqueues their
//! publish jobs, and repairs pending posts that lost their job.

pub mod error;
pub mod service;

pub use error::{ServiceError, ServiceResult};
pub use service::PostService;
