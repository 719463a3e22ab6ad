//! LinkedIn API client.
//!
//! Publishes UGC posts (text or images) and refreshes OAuth credentials.
//! The worker depends on the [`PostPublisher`] and [`TokenRefresher`]
//! traits, not on the HTTP client.

pub mod client;
pub mod error;
pub mod types;

pub use client::{LinkedInClient, LinkedInConfig, PostPublisher, TokenRefresher};
pub use error::{LinkedInError, LinkedInResult};
