//! Remote node sync, sync export, group reassignment and attribute merges.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

use super::Ledger;
use crate::error::LedgerError;
use crate::models::{NewsItemAttribute, RemoteNode, RemoteRecord, SyncRecord};

/// How far back [`Ledger::reassign_to_new_groups`] reaches.
pub const REASSIGN_WINDOW_DAYS: i64 = 7;

impl Ledger {
    /// Merge records pushed by a peer node into `group_id`.
    ///
    /// New hashes get a data record and one item in the group. Known hashes
    /// get `updated = now` and this node's attributes replaced. In both cases
    /// the node's vote on every item of the data is replaced by the sign of
    /// the record's relevance. Returns the number of new data records.
    pub fn add_remote_items(
        &mut self,
        node: &RemoteNode,
        group_id: &str,
        records: Vec<RemoteRecord>,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        if self.group(group_id).is_none() {
            return Err(LedgerError::GroupNotFound(group_id.to_string()));
        }
        let mut created = 0usize;
        let mut touched = BTreeSet::new();

        for RemoteRecord { mut data, relevance } in records {
            for attribute in &mut data.attributes {
                attribute.remote_node_id = Some(node.id);
                attribute.remote_user = Some(node.name.clone());
            }

            let data_id = match self.find_data_by_hash(&data.hash).map(|d| d.id.clone()) {
                Some(existing_id) => {
                    if let Some(existing) = self.data.get_mut(&existing_id) {
                        existing.updated = now;
                        existing.attributes.retain(|a| a.remote_node_id != Some(node.id));
                        existing.attributes.extend(data.attributes);
                    }
                    self.journal.data.insert(existing_id.clone());
                    existing_id
                }
                None => {
                    data.remote_source = Some(node.name.clone());
                    data.osint_source_id = None;
                    data.updated = now;
                    let data_id = self.put_new_data(data);
                    self.create_for_group(&data_id, group_id)?;
                    created += 1;
                    data_id
                }
            };

            for item_id in self.items_with_data(&data_id) {
                self.replace_remote_vote(item_id, node.id, &node.name, relevance, now)?;
                if let Some(item) = self.item(item_id) {
                    touched.insert(item.news_item_aggregate_id);
                }
            }
        }

        self.refresh_aggregates(touched);
        tracing::debug!(node = %node.name, created, "remote records merged");
        Ok(created)
    }

    /// Data changed in `[last_synced, now]` from the given sources, each with
    /// the sign of its total relevance over all groups.
    pub fn get_for_sync(
        &self,
        last_synced: DateTime<Utc>,
        source_ids: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Vec<SyncRecord> {
        let mut records: Vec<SyncRecord> = self
            .data
            .values()
            .filter(|d| d.updated >= last_synced && d.updated <= now)
            .filter(|d| d.osint_source_id.as_ref().is_some_and(|s| source_ids.contains(s)))
            .map(|d| {
                let relevance: i64 = self
                    .items
                    .values()
                    .filter(|i| i.news_item_data_id == d.id)
                    .map(|i| i.relevance)
                    .sum();
                SyncRecord {
                    data: d.clone(),
                    relevance: relevance.signum(),
                }
            })
            .collect();
        records.sort_by(|a, b| a.data.updated.cmp(&b.data.updated).then_with(|| a.data.id.cmp(&b.data.id)));
        records
    }

    /// Move a source's recent items out of the default group into the
    /// groups the source now belongs to.
    ///
    /// Only items collected within the last [`REASSIGN_WINDOW_DAYS`] days are
    /// moved. Items whose aggregate is referenced by a report stay. Votes on
    /// moved items are dropped. Returns the number of data records moved.
    pub fn reassign_to_new_groups(
        &mut self,
        source_id: &str,
        default_group_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        if self.source(source_id).is_none() {
            return Err(LedgerError::SourceNotFound(source_id.to_string()));
        }
        if self.group(default_group_id).is_none() {
            return Err(LedgerError::GroupNotFound(default_group_id.to_string()));
        }
        let targets = self.groups_for_source(Some(source_id));
        if targets.iter().all(|g| g == default_group_id) {
            return Ok(0);
        }

        let since = now - Duration::days(REASSIGN_WINDOW_DAYS);
        let candidates: Vec<(i64, String)> = self
            .items
            .values()
            .filter_map(|item| {
                let data = self.data.get(&item.news_item_data_id)?;
                let aggregate = self.aggregates.get(&item.news_item_aggregate_id)?;
                let eligible = data.osint_source_id.as_deref() == Some(source_id)
                    && aggregate.osint_source_group_id == default_group_id
                    && data.collected >= since
                    && !self.assigned(aggregate.id);
                eligible.then(|| (item.id, data.id.clone()))
            })
            .collect();

        let mut touched = BTreeSet::new();
        let mut moved = BTreeSet::new();
        for (item_id, data_id) in candidates {
            if let Some(item) = self.item(item_id) {
                touched.insert(item.news_item_aggregate_id);
            }
            self.remove_item(item_id);
            moved.insert(data_id);
        }
        self.refresh_aggregates(touched);

        for data_id in &moved {
            for group_id in &targets {
                self.create_for_group(data_id, group_id)?;
            }
        }
        tracing::info!(source_id, moved = moved.len(), "reassigned items to new groups");
        Ok(moved.len())
    }

    /// Append attributes whose value the data does not carry yet, then
    /// re-index every aggregate holding the data.
    pub fn update_attributes(
        &mut self,
        data_id: &str,
        attributes: Vec<NewsItemAttribute>,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        let data = self
            .data
            .get_mut(data_id)
            .ok_or_else(|| LedgerError::DataNotFound(data_id.to_string()))?;
        let mut added = 0usize;
        for attribute in attributes {
            if data.attributes.iter().any(|a| a.value == attribute.value) {
                continue;
            }
            data.attributes.push(attribute);
            added += 1;
        }
        if added == 0 {
            return Ok(0);
        }
        data.updated = now;
        self.journal.data.insert(data_id.to_string());

        let aggregates: BTreeSet<i64> = self
            .items_with_data(data_id)
            .into_iter()
            .filter_map(|id| self.item(id).map(|i| i.news_item_aggregate_id))
            .collect();
        for aggregate_id in aggregates {
            self.prepare(aggregate_id);
        }
        Ok(added)
    }
}
