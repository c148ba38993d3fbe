//! Storage abstraction for the aggregation engine.
//!
//! The [`Store`] trait is the engine's public surface: ingestion, queries,
//! status updates, bulk actions, remote sync and registry bookkeeping.
//! Both backends run the same [`Ledger`](crate::ledger::Ledger) operations,
//! so their behavior is identical; they differ only in where rows live and
//! how a call is made atomic.
//!
//! Every mutating call is all-or-nothing. Backends serialize writers so the
//! roll-up and zero-member cleanup of one call never interleave with
//! another call's mutation.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::auth::Identity;
use crate::models::{
    ActionResponse, AggregateFilter, AggregateView, GroupAction, NewsItemAttribute, NewsItemData,
    NewsItemView, OsintSource, OsintSourceGroup, RemoteNode, RemoteRecord, StatusUpdate, StoreStats,
    SyncRecord, Target,
};

/// Abstract storage backend for the aggregation engine.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`add_items`](Store::add_items) | Deduplicate and fan out a collected batch |
/// | [`get_by_group`](Store::get_by_group) | Filtered, sorted, paged group listing |
/// | [`update_item`](Store::update_item) / [`update_aggregate`](Store::update_aggregate) | Vote, mark, edit |
/// | [`group_action`](Store::group_action) | GROUP, UNGROUP, DELETE and bulk status changes |
/// | [`add_remote_items`](Store::add_remote_items) / [`get_for_sync`](Store::get_for_sync) | Node-to-node sync |
/// | [`reassign_to_new_groups`](Store::reassign_to_new_groups) | Follow a source into new groups |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a source or update its definition. Collection history is kept.
    async fn upsert_source(&self, source: &OsintSource) -> Result<()>;

    /// Insert or update a group. A new default group demotes the old one.
    async fn upsert_group(&self, group: &OsintSourceGroup) -> Result<()>;

    async fn get_source(&self, id: &str) -> Result<Option<OsintSource>>;

    async fn list_sources(&self) -> Result<Vec<OsintSource>>;

    async fn list_groups(&self) -> Result<Vec<OsintSourceGroup>>;

    /// Record a collection attempt and its error message, if any.
    async fn record_attempt(&self, source_id: &str, error: Option<&str>) -> Result<()>;

    /// Store a normalized batch. Returns the sources that got new content.
    async fn add_items(&self, batch: Vec<NewsItemData>) -> Result<BTreeSet<String>>;

    /// One page of a group's aggregates plus the total match count.
    async fn get_by_group(
        &self,
        group_id: &str,
        filter: &AggregateFilter,
        offset: usize,
        limit: usize,
        identity: &Identity,
    ) -> Result<(Vec<AggregateView>, usize)>;

    async fn get_aggregate(&self, id: i64, identity: &Identity) -> Result<Option<AggregateView>>;

    async fn get_item(&self, id: i64, identity: &Identity) -> Result<Option<NewsItemView>>;

    async fn update_item(&self, id: i64, update: &StatusUpdate, identity: &Identity) -> Result<ActionResponse>;

    async fn update_aggregate(&self, id: i64, update: &StatusUpdate, identity: &Identity) -> Result<ActionResponse>;

    async fn group_action(&self, action: GroupAction, targets: &[Target], identity: &Identity) -> Result<ActionResponse>;

    async fn delete_item(&self, id: i64, identity: &Identity) -> Result<ActionResponse>;

    async fn delete_aggregate(&self, id: i64, identity: &Identity) -> Result<ActionResponse>;

    /// Merge records pushed by a peer node. Returns the number of new records.
    async fn add_remote_items(&self, node: &RemoteNode, group_id: &str, records: Vec<RemoteRecord>) -> Result<usize>;

    /// Records changed since `last_synced`, plus the timestamp to resume from.
    async fn get_for_sync(
        &self,
        last_synced: DateTime<Utc>,
        source_ids: &BTreeSet<String>,
    ) -> Result<(Vec<SyncRecord>, DateTime<Utc>)>;

    /// Append new attributes to a data record. Returns how many were added.
    async fn update_attributes(&self, data_id: &str, attributes: Vec<NewsItemAttribute>) -> Result<usize>;

    /// Returns the number of data records moved.
    async fn reassign_to_new_groups(&self, source_id: &str, default_group_id: &str) -> Result<usize>;

    async fn assign_to_report(&self, report_item_id: i64, aggregate_id: i64) -> Result<()>;

    async fn remove_from_report(&self, report_item_id: i64, aggregate_id: i64) -> Result<()>;

    async fn stats(&self) -> Result<StoreStats>;
}
