//! # OSINT Aggregate Core
//!
//! The news-item deduplication and aggregation engine: data models, the
//! hasher/normalizer, the ledger holding every table and engine operation,
//! the authorization collaborator, and the store abstraction with an
//! in-memory backend.
//!
//! This crate contains no tokio runtime, sqlx, or filesystem I/O.

pub mod auth;
pub mod error;
pub mod ledger;
pub mod models;
pub mod normalize;
pub mod store;
