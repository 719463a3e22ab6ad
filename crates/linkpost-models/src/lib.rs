//! Shared data models for the LinkPost scheduling core.
//!
//! This crate provides Serde-serializable types for:
//! - Scheduled posts and their lifecycle status
//! - Linked LinkedIn accounts and their OAuth credentials
//! - Content validation shared by the scheduler and the worker

pub mod account;
pub mod post;

// Re-export common types
pub use account::{AccountId, LinkedAccount, TokenGrant};
pub use post::{
    ContentError, NewPost, PostId, PostStatus, ScheduledPost, MAX_CONTENT_CHARS, MAX_MEDIA_ITEMS,
};
