//! Relational store for scheduled posts and linked accounts.
//!
//! This crate provides:
//! - Repository traits for post CRUD, worker status transitions and credentials
//! - A Postgres implementation on sqlx with embedded migrations
//! - An in-memory implementation for tests and local runs

pub mod error;
pub mod memory;
pub mod postgres;
pub mod repos;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStore;
pub use postgres::{PgStore, StoreConfig};
pub use repos::{AccountRepository, PostRepository, PostStatusWriter, PostTransition};
