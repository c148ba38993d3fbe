//! In-memory [`Store`] implementation for tests and embedding.
//!
//! One [`Ledger`] behind `std::sync::RwLock`. Writers hold the write lock
//! for the whole operation, which makes every call atomic and serialized.
//! The journal is discarded after each call since nothing needs replaying.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::auth::{AllowAll, Authorizer, Identity};
use crate::ledger::Ledger;
use crate::models::{
    ActionResponse, AggregateFilter, AggregateView, GroupAction, NewsItemAttribute, NewsItemData,
    NewsItemView, OsintSource, OsintSourceGroup, RemoteNode, RemoteRecord, StatusUpdate, StoreStats,
    SyncRecord, Target,
};

use super::Store;

/// In-memory store.
pub struct InMemoryStore {
    ledger: RwLock<Ledger>,
    auth: Arc<dyn Authorizer>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_authorizer(Arc::new(AllowAll))
    }

    pub fn with_authorizer(auth: Arc<dyn Authorizer>) -> Self {
        Self {
            ledger: RwLock::new(Ledger::new()),
            auth,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Ledger>> {
        self.ledger.read().map_err(|_| anyhow!("ledger lock poisoned"))
    }

    /// Run a mutating operation and drop its journal.
    fn mutate<T>(&self, op: impl FnOnce(&mut Ledger) -> T) -> Result<T> {
        let mut ledger: RwLockWriteGuard<'_, Ledger> =
            self.ledger.write().map_err(|_| anyhow!("ledger lock poisoned"))?;
        let out = op(&mut ledger);
        ledger.take_journal();
        Ok(out)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_source(&self, source: &OsintSource) -> Result<()> {
        self.mutate(|l| l.register_source(source.clone()))
    }

    async fn upsert_group(&self, group: &OsintSourceGroup) -> Result<()> {
        self.mutate(|l| l.register_group(group.clone()))
    }

    async fn get_source(&self, id: &str) -> Result<Option<OsintSource>> {
        Ok(self.read()?.source(id).cloned())
    }

    async fn list_sources(&self) -> Result<Vec<OsintSource>> {
        let mut sources: Vec<OsintSource> = self.read()?.sources().cloned().collect();
        sources.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sources)
    }

    async fn list_groups(&self) -> Result<Vec<OsintSourceGroup>> {
        Ok(self.read()?.groups().cloned().collect())
    }

    async fn record_attempt(&self, source_id: &str, error: Option<&str>) -> Result<()> {
        let error = error.map(str::to_string);
        Ok(self.mutate(|l| l.record_attempt(source_id, error, Utc::now()))??)
    }

    async fn add_items(&self, batch: Vec<NewsItemData>) -> Result<BTreeSet<String>> {
        self.mutate(|l| l.add_items(batch, Utc::now()))
    }

    async fn get_by_group(
        &self,
        group_id: &str,
        filter: &AggregateFilter,
        offset: usize,
        limit: usize,
        identity: &Identity,
    ) -> Result<(Vec<AggregateView>, usize)> {
        Ok(self
            .read()?
            .query_group(group_id, filter, offset, limit, identity, self.auth.as_ref(), Utc::now()))
    }

    async fn get_aggregate(&self, id: i64, identity: &Identity) -> Result<Option<AggregateView>> {
        Ok(self.read()?.view_aggregate(id, identity, self.auth.as_ref()))
    }

    async fn get_item(&self, id: i64, identity: &Identity) -> Result<Option<NewsItemView>> {
        Ok(self.read()?.view_item(id, identity, self.auth.as_ref()))
    }

    async fn update_item(&self, id: i64, update: &StatusUpdate, identity: &Identity) -> Result<ActionResponse> {
        let auth = self.auth.as_ref();
        Ok(self.mutate(|l| l.update_item(id, update, identity, auth, Utc::now()))??)
    }

    async fn update_aggregate(&self, id: i64, update: &StatusUpdate, identity: &Identity) -> Result<ActionResponse> {
        let auth = self.auth.as_ref();
        Ok(self.mutate(|l| l.update_aggregate(id, update, identity, auth, Utc::now()))??)
    }

    async fn group_action(&self, action: GroupAction, targets: &[Target], identity: &Identity) -> Result<ActionResponse> {
        let auth = self.auth.as_ref();
        Ok(self.mutate(|l| l.group_action(action, targets, identity, auth, Utc::now()))??)
    }

    async fn delete_item(&self, id: i64, identity: &Identity) -> Result<ActionResponse> {
        let auth = self.auth.as_ref();
        Ok(self.mutate(|l| l.delete_item(id, identity, auth))??)
    }

    async fn delete_aggregate(&self, id: i64, identity: &Identity) -> Result<ActionResponse> {
        let auth = self.auth.as_ref();
        Ok(self.mutate(|l| l.delete_aggregate(id, identity, auth))??)
    }

    async fn add_remote_items(&self, node: &RemoteNode, group_id: &str, records: Vec<RemoteRecord>) -> Result<usize> {
        Ok(self.mutate(|l| l.add_remote_items(node, group_id, records, Utc::now()))??)
    }

    async fn get_for_sync(
        &self,
        last_synced: DateTime<Utc>,
        source_ids: &BTreeSet<String>,
    ) -> Result<(Vec<SyncRecord>, DateTime<Utc>)> {
        let now = Utc::now();
        Ok((self.read()?.get_for_sync(last_synced, source_ids, now), now))
    }

    async fn update_attributes(&self, data_id: &str, attributes: Vec<NewsItemAttribute>) -> Result<usize> {
        Ok(self.mutate(|l| l.update_attributes(data_id, attributes, Utc::now()))??)
    }

    async fn reassign_to_new_groups(&self, source_id: &str, default_group_id: &str) -> Result<usize> {
        Ok(self.mutate(|l| l.reassign_to_new_groups(source_id, default_group_id, Utc::now()))??)
    }

    async fn assign_to_report(&self, report_item_id: i64, aggregate_id: i64) -> Result<()> {
        Ok(self.mutate(|l| l.assign_to_report(report_item_id, aggregate_id))??)
    }

    async fn remove_from_report(&self, report_item_id: i64, aggregate_id: i64) -> Result<()> {
        self.mutate(|l| l.remove_from_report(report_item_id, aggregate_id))
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(self.read()?.stats())
    }
}
