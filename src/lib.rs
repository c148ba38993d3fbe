//! # osint-aggregate
//!
//! A local-first news-item deduplication and aggregation engine for OSINT
//! collection.
//!
//! Collectors fetch raw records from configured sources. Records are
//! normalized and fingerprinted, stored once per content hash, and fanned
//! out as one news item per source group. Analysts vote on, group, ungroup
//! and delete items through aggregates whose status rolls up from their
//! members.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ Collectors  │──▶│  Pipeline   │──▶│    Store     │
//! │ json/manual │   │ normalize   │   │ Ledger ops   │
//! └─────────────┘   └─────────────┘   └──────┬───────┘
//!        ▲                                   │
//!   ┌────┴──────┐                     ┌──────┴──────┐
//!   │ Scheduler │                     │ SQLite  /   │
//!   └───────────┘                     │ in-memory   │
//!                                     └─────────────┘
//! ```
//!
//! The engine itself (models, normalizer, ledger, `Store` trait) lives in
//! `osint-aggregate-core`. This crate adds configuration, persistence,
//! collection and the `osag` CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite `Store` backend |
//! | [`collector`] | Collector trait and registry |
//! | [`collector_json`] | JSON drop-folder collector |
//! | [`ingest`] | Collection pipeline |
//! | [`scheduler`] | Periodic collection tasks |

pub mod collector;
pub mod collector_json;
pub mod config;
pub mod db;
pub mod ingest;
pub mod migrate;
pub mod scheduler;
pub mod sqlite_store;
