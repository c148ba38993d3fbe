//! The aggregation ledger: flat tables keyed by id plus every engine
//! operation that mutates them.
//!
//! A [`Ledger`] is either the whole store (the in-memory backend) or a
//! working set loaded for one transaction (the SQLite backend). Loader
//! methods (`load_*`) fill tables without recording anything; mutating
//! operations record every touched row in the [`Journal`], which the
//! SQLite backend replays inside its transaction.
//!
//! # Invariants restored by every mutating operation
//!
//! - aggregate roll-ups equal the fold over their members
//!   ([`update_status`](Ledger::update_status))
//! - the search index of every touched aggregate is rebuilt
//!   ([`prepare`](Ledger::prepare))
//! - an aggregate without members does not exist
//!
//! Operations are split across submodules:
//!
//! | Module | Operations |
//! |--------|-----------|
//! | `ingest` | `add_items`, per-group fan-out |
//! | `vote` | like/dislike state machine, remote vote replacement |
//! | `rollup` | `update_status`, `prepare`, batched refresh |
//! | `regroup` | group, ungroup, delete, status updates, bulk actions |
//! | `sync` | remote sync, sync export, reassignment, attribute merge |
//! | `query` | filtered/sorted group listing and caller views |

mod ingest;
mod query;
mod regroup;
mod rollup;
mod sync;
mod vote;

pub use query::{compare, range_start};
pub use sync::REASSIGN_WINDOW_DAYS;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::auth::{AclSubject, Authorizer, Identity, Permission};
use crate::error::LedgerError;
use crate::models::{
    NewsItem, NewsItemAggregate, NewsItemData, NewsItemVote, OsintSource, OsintSourceGroup,
    StoreStats, Voter,
};

/// Vote-ledger key: one vote row per (item, voter).
pub type VoteKey = (i64, Voter);

/// Rows touched by mutating operations since the last [`Ledger::take_journal`].
///
/// A row id is in at most one of the upsert/remove sets of its table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Journal {
    pub data: BTreeSet<String>,
    pub items: BTreeSet<i64>,
    pub removed_items: BTreeSet<i64>,
    pub votes: BTreeSet<VoteKey>,
    pub removed_votes: BTreeSet<VoteKey>,
    pub aggregates: BTreeSet<i64>,
    pub removed_aggregates: BTreeSet<i64>,
    pub search_index: BTreeSet<i64>,
    pub removed_search_index: BTreeSet<i64>,
    pub sources: BTreeSet<String>,
    pub groups: BTreeSet<String>,
    pub report_links: BTreeSet<(i64, i64)>,
    pub removed_report_links: BTreeSet<(i64, i64)>,
}

impl Journal {
    pub fn is_empty(&self) -> bool {
        *self == Journal::default()
    }
}

/// Flat tables for the aggregation engine.
#[derive(Debug, Clone)]
pub struct Ledger {
    data: HashMap<String, NewsItemData>,
    hashes: HashMap<String, String>,
    /// Data ids known to exist in the backing store without their rows loaded.
    known_data_ids: HashSet<String>,
    items: BTreeMap<i64, NewsItem>,
    members: HashMap<i64, BTreeSet<i64>>,
    votes: BTreeMap<VoteKey, NewsItemVote>,
    aggregates: BTreeMap<i64, NewsItemAggregate>,
    search_index: HashMap<i64, String>,
    /// (aggregate id, report id)
    report_links: BTreeSet<(i64, i64)>,
    sources: HashMap<String, OsintSource>,
    groups: BTreeMap<String, OsintSourceGroup>,
    next_item_id: i64,
    next_aggregate_id: i64,
    journal: Journal,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            hashes: HashMap::new(),
            known_data_ids: HashSet::new(),
            items: BTreeMap::new(),
            members: HashMap::new(),
            votes: BTreeMap::new(),
            aggregates: BTreeMap::new(),
            search_index: HashMap::new(),
            report_links: BTreeSet::new(),
            sources: HashMap::new(),
            groups: BTreeMap::new(),
            next_item_id: 1,
            next_aggregate_id: 1,
            journal: Journal::default(),
        }
    }

    // ── Loading ─────────────────────────────────────────────────────

    /// Make sure freshly allocated ids start at or above the given values.
    pub fn reserve_ids(&mut self, next_item_id: i64, next_aggregate_id: i64) {
        self.next_item_id = self.next_item_id.max(next_item_id);
        self.next_aggregate_id = self.next_aggregate_id.max(next_aggregate_id);
    }

    pub fn load_data(&mut self, data: NewsItemData) {
        self.hashes.insert(data.hash.clone(), data.id.clone());
        self.data.insert(data.id.clone(), data);
    }

    /// Record that a hash exists without loading its row.
    pub fn load_known_hash(&mut self, hash: String, data_id: String) {
        self.known_data_ids.insert(data_id.clone());
        self.hashes.insert(hash, data_id);
    }

    /// Record that a data id is taken without loading its row.
    pub fn load_known_data_id(&mut self, data_id: String) {
        self.known_data_ids.insert(data_id);
    }

    pub fn load_item(&mut self, item: NewsItem) {
        self.next_item_id = self.next_item_id.max(item.id + 1);
        self.members
            .entry(item.news_item_aggregate_id)
            .or_default()
            .insert(item.id);
        self.items.insert(item.id, item);
    }

    pub fn load_vote(&mut self, vote: NewsItemVote) {
        self.votes.insert((vote.news_item_id, vote.voter), vote);
    }

    pub fn load_aggregate(&mut self, aggregate: NewsItemAggregate) {
        self.next_aggregate_id = self.next_aggregate_id.max(aggregate.id + 1);
        self.members.entry(aggregate.id).or_default();
        self.aggregates.insert(aggregate.id, aggregate);
    }

    pub fn load_search_index(&mut self, aggregate_id: i64, text: String) {
        self.search_index.insert(aggregate_id, text);
    }

    pub fn load_report_link(&mut self, report_item_id: i64, aggregate_id: i64) {
        self.report_links.insert((aggregate_id, report_item_id));
    }

    pub fn load_source(&mut self, source: OsintSource) {
        self.sources.insert(source.id.clone(), source);
    }

    pub fn load_group(&mut self, group: OsintSourceGroup) {
        self.groups.insert(group.id.clone(), group);
    }

    /// Hand over the rows touched since the last call.
    pub fn take_journal(&mut self) -> Journal {
        std::mem::take(&mut self.journal)
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    // ── Read access ─────────────────────────────────────────────────

    /// Whether content with this fingerprint has been stored already.
    pub fn identical(&self, hash: &str) -> bool {
        self.hashes.contains_key(hash)
    }

    pub fn find_data_by_hash(&self, hash: &str) -> Option<&NewsItemData> {
        self.hashes.get(hash).and_then(|id| self.data.get(id))
    }

    pub fn data(&self, id: &str) -> Option<&NewsItemData> {
        self.data.get(id)
    }

    pub fn item(&self, id: i64) -> Option<&NewsItem> {
        self.items.get(&id)
    }

    pub fn aggregate(&self, id: i64) -> Option<&NewsItemAggregate> {
        self.aggregates.get(&id)
    }

    pub fn aggregates(&self) -> impl Iterator<Item = &NewsItemAggregate> {
        self.aggregates.values()
    }

    pub fn vote_of(&self, item_id: i64, voter: Voter) -> Option<&NewsItemVote> {
        self.votes.get(&(item_id, voter))
    }

    pub fn votes(&self) -> impl Iterator<Item = &NewsItemVote> {
        self.votes.values()
    }

    /// Member item ids of an aggregate, in id order.
    pub fn member_ids(&self, aggregate_id: i64) -> Vec<i64> {
        self.members
            .get(&aggregate_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn members(&self, aggregate_id: i64) -> impl Iterator<Item = &NewsItem> {
        self.members
            .get(&aggregate_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.items.get(id))
    }

    /// All news items wrapping one data record, across groups.
    pub fn items_with_data(&self, data_id: &str) -> Vec<i64> {
        self.items
            .values()
            .filter(|i| i.news_item_data_id == data_id)
            .map(|i| i.id)
            .collect()
    }

    pub fn search_text(&self, aggregate_id: i64) -> Option<&str> {
        self.search_index.get(&aggregate_id).map(String::as_str)
    }

    /// Whether any report references the aggregate.
    pub fn assigned(&self, aggregate_id: i64) -> bool {
        self.report_links
            .range((aggregate_id, i64::MIN)..=(aggregate_id, i64::MAX))
            .next()
            .is_some()
    }

    pub fn report_count(&self, aggregate_id: i64) -> usize {
        self.report_links
            .range((aggregate_id, i64::MIN)..=(aggregate_id, i64::MAX))
            .count()
    }

    pub fn source(&self, id: &str) -> Option<&OsintSource> {
        self.sources.get(id)
    }

    pub fn sources(&self) -> impl Iterator<Item = &OsintSource> {
        self.sources.values()
    }

    pub fn group(&self, id: &str) -> Option<&OsintSourceGroup> {
        self.groups.get(id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &OsintSourceGroup> {
        self.groups.values()
    }

    pub fn default_group(&self) -> Option<&OsintSourceGroup> {
        self.groups.values().find(|g| g.default)
    }

    /// Groups a source belongs to, falling back to the default group.
    pub fn groups_for_source(&self, source_id: Option<&str>) -> Vec<String> {
        let explicit: Vec<String> = match source_id {
            Some(source_id) => self
                .groups
                .values()
                .filter(|g| g.source_ids.contains(source_id))
                .map(|g| g.id.clone())
                .collect(),
            None => Vec::new(),
        };
        if !explicit.is_empty() {
            return explicit;
        }
        self.default_group().map(|g| vec![g.id.clone()]).unwrap_or_default()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            news_item_data: self.data.len(),
            news_items: self.items.len(),
            aggregates: self.aggregates.len(),
            votes: self.votes.len(),
            latest_collected: self.data.values().map(|d| d.collected).max(),
        }
    }

    // ── Registry and report links ───────────────────────────────────

    /// Insert a source or update its definition, keeping collection history.
    pub fn register_source(&mut self, mut source: OsintSource) {
        if let Some(existing) = self.sources.get(&source.id) {
            source.last_collected = existing.last_collected;
            source.last_attempted = existing.last_attempted;
            source.last_error_message = existing.last_error_message.clone();
        }
        self.journal.sources.insert(source.id.clone());
        self.sources.insert(source.id.clone(), source);
    }

    pub fn register_group(&mut self, group: OsintSourceGroup) {
        if group.default {
            let others: Vec<String> = self
                .groups
                .values()
                .filter(|g| g.default && g.id != group.id)
                .map(|g| g.id.clone())
                .collect();
            for id in others {
                if let Some(g) = self.groups.get_mut(&id) {
                    g.default = false;
                    self.journal.groups.insert(id);
                }
            }
        }
        self.journal.groups.insert(group.id.clone());
        self.groups.insert(group.id.clone(), group);
    }

    /// Bump a source's "last collected" timestamp.
    pub fn mark_collected(&mut self, source_id: &str, now: DateTime<Utc>) {
        match self.sources.get_mut(source_id) {
            Some(source) => {
                source.last_collected = Some(now);
                self.journal.sources.insert(source_id.to_string());
            }
            None => tracing::warn!(source_id, "collected items for unregistered source"),
        }
    }

    /// Record a collection attempt and its error, if any.
    pub fn record_attempt(
        &mut self,
        source_id: &str,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let source = self
            .sources
            .get_mut(source_id)
            .ok_or_else(|| LedgerError::SourceNotFound(source_id.to_string()))?;
        source.last_attempted = Some(now);
        source.last_error_message = error;
        self.journal.sources.insert(source_id.to_string());
        Ok(())
    }

    pub fn assign_to_report(&mut self, report_item_id: i64, aggregate_id: i64) -> Result<(), LedgerError> {
        if !self.aggregates.contains_key(&aggregate_id) {
            return Err(LedgerError::AggregateNotFound(aggregate_id));
        }
        let key = (aggregate_id, report_item_id);
        self.report_links.insert(key);
        self.journal.removed_report_links.remove(&key);
        self.journal.report_links.insert(key);
        Ok(())
    }

    pub fn remove_from_report(&mut self, report_item_id: i64, aggregate_id: i64) {
        let key = (aggregate_id, report_item_id);
        if self.report_links.remove(&key) {
            self.journal.report_links.remove(&key);
            self.journal.removed_report_links.insert(key);
        }
    }

    // ── Row-level mutation (journaled) ──────────────────────────────

    fn put_data(&mut self, data: NewsItemData) {
        self.journal.data.insert(data.id.clone());
        self.load_data(data);
    }

    /// Insert a record with a new hash. An id already held by other content
    /// is replaced with a fresh one. Returns the id the record was stored under.
    pub(super) fn put_new_data(&mut self, mut data: NewsItemData) -> String {
        if self.data.contains_key(&data.id) || self.known_data_ids.contains(&data.id) {
            let fresh = Uuid::new_v4().to_string();
            tracing::warn!(data_id = %data.id, hash = %data.hash, new_id = %fresh, "data id already in use, reassigning");
            data.id = fresh;
        }
        let data_id = data.id.clone();
        self.put_data(data);
        data_id
    }

    fn touch_data(&mut self, data_id: &str, now: DateTime<Utc>) {
        if let Some(data) = self.data.get_mut(data_id) {
            data.updated = now;
            self.journal.data.insert(data_id.to_string());
        }
    }

    fn touch_item(&mut self, item_id: i64) {
        self.journal.removed_items.remove(&item_id);
        self.journal.items.insert(item_id);
    }

    fn touch_aggregate(&mut self, aggregate_id: i64) {
        self.journal.removed_aggregates.remove(&aggregate_id);
        self.journal.aggregates.insert(aggregate_id);
    }

    fn touch_vote(&mut self, key: VoteKey) {
        self.journal.removed_votes.remove(&key);
        self.journal.votes.insert(key);
    }

    fn new_aggregate(&mut self, group_id: String, created: DateTime<Utc>) -> i64 {
        let id = self.next_aggregate_id;
        self.next_aggregate_id += 1;
        self.aggregates
            .insert(id, NewsItemAggregate::new(id, group_id, created));
        self.members.entry(id).or_default();
        self.touch_aggregate(id);
        id
    }

    fn new_item(&mut self, data_id: String, aggregate_id: i64) -> i64 {
        let id = self.next_item_id;
        self.next_item_id += 1;
        self.items.insert(id, NewsItem::new(id, data_id, aggregate_id));
        self.members.entry(aggregate_id).or_default().insert(id);
        self.touch_item(id);
        id
    }

    /// Move an item into another aggregate.
    fn attach(&mut self, item_id: i64, aggregate_id: i64) {
        let Some(item) = self.items.get_mut(&item_id) else {
            return;
        };
        let previous = item.news_item_aggregate_id;
        item.news_item_aggregate_id = aggregate_id;
        if let Some(m) = self.members.get_mut(&previous) {
            m.remove(&item_id);
        }
        self.members.entry(aggregate_id).or_default().insert(item_id);
        self.touch_item(item_id);
    }

    /// Delete an item together with its votes. The data record stays.
    fn remove_item(&mut self, item_id: i64) {
        let keys: Vec<VoteKey> = self
            .votes
            .range((item_id, Voter::User(i64::MIN))..=(item_id, Voter::Remote(i64::MAX)))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            self.remove_vote(key);
        }
        if let Some(item) = self.items.remove(&item_id) {
            if let Some(m) = self.members.get_mut(&item.news_item_aggregate_id) {
                m.remove(&item_id);
            }
        }
        self.journal.items.remove(&item_id);
        self.journal.removed_items.insert(item_id);
    }

    fn remove_vote(&mut self, key: VoteKey) -> Option<NewsItemVote> {
        let vote = self.votes.remove(&key);
        if vote.is_some() {
            self.journal.votes.remove(&key);
            self.journal.removed_votes.insert(key);
        }
        vote
    }

    /// Delete an aggregate and its search index row.
    fn remove_aggregate(&mut self, aggregate_id: i64) {
        self.aggregates.remove(&aggregate_id);
        self.members.remove(&aggregate_id);
        self.journal.aggregates.remove(&aggregate_id);
        self.journal.removed_aggregates.insert(aggregate_id);
        self.search_index.remove(&aggregate_id);
        self.journal.search_index.remove(&aggregate_id);
        self.journal.removed_search_index.insert(aggregate_id);
    }

    // ── Authorization ───────────────────────────────────────────────

    /// Per-item permission check.
    ///
    /// The system identity and remote-origin data are always permitted.
    pub fn permitted(
        &self,
        item_id: i64,
        identity: &Identity,
        auth: &dyn Authorizer,
        permission: Permission,
    ) -> bool {
        if matches!(identity, Identity::System) {
            return true;
        }
        let Some(item) = self.items.get(&item_id) else {
            return false;
        };
        let data = self.data.get(&item.news_item_data_id);
        if data.is_some_and(|d| d.remote_source.is_some()) {
            return true;
        }
        let subject = AclSubject {
            news_item_id: item_id,
            news_item_aggregate_id: item.news_item_aggregate_id,
            osint_source_id: data.and_then(|d| d.osint_source_id.as_deref()),
        };
        auth.allowed(identity, &subject, permission)
    }

    fn source_of_item(&self, item_id: i64) -> Option<String> {
        self.items
            .get(&item_id)
            .and_then(|i| self.data.get(&i.news_item_data_id))
            .and_then(|d| d.osint_source_id.clone())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::normalize::normalize;
    use crate::models::RawRecord;

    pub fn group(id: &str, sources: &[&str], default: bool) -> OsintSourceGroup {
        OsintSourceGroup {
            id: id.to_string(),
            name: id.to_uppercase(),
            default,
            source_ids: sources.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// A ledger with source `s1` in group `g1` and a default group `default`.
    pub fn ledger() -> Ledger {
        let mut ledger = Ledger::new();
        ledger.register_source(OsintSource::new("s1", "Source One", "json"));
        ledger.register_source(OsintSource::new("s2", "Source Two", "json"));
        ledger.register_group(group("default", &[], true));
        ledger.register_group(group("g1", &["s1"], false));
        ledger.take_journal();
        ledger
    }

    pub fn data(author: &str, title: &str, link: &str, source: &str) -> NewsItemData {
        normalize(
            RawRecord {
                author: Some(author.to_string()),
                title: Some(title.to_string()),
                link: Some(link.to_string()),
                review: Some(format!("review of {title}")),
                content: Some(format!("<p>content of {title}</p>")),
                ..Default::default()
            },
            Some(source),
            Utc::now(),
        )
    }

    /// Ingest one item per title from `s1` and return the aggregate ids.
    pub fn singletons(ledger: &mut Ledger, titles: &[&str]) -> Vec<i64> {
        let batch = titles
            .iter()
            .map(|t| data("A", t, &format!("https://example.org/{t}"), "s1"))
            .collect();
        ledger.add_items(batch, Utc::now());
        let mut ids: Vec<i64> = ledger.aggregates().map(|a| a.id).collect();
        ids.sort();
        ids
    }

    pub fn assert_rollup(ledger: &Ledger) {
        for aggregate in ledger.aggregates() {
            let members: Vec<&NewsItem> = ledger.members(aggregate.id).collect();
            assert!(!members.is_empty(), "aggregate {} has no members", aggregate.id);
            assert_eq!(aggregate.relevance, members.iter().map(|m| m.relevance).sum::<i64>());
            assert_eq!(aggregate.likes, members.iter().map(|m| m.likes).sum::<i64>());
            assert_eq!(aggregate.dislikes, members.iter().map(|m| m.dislikes).sum::<i64>());
            assert_eq!(aggregate.important, members.iter().any(|m| m.important));
            assert_eq!(aggregate.read, members.iter().all(|m| m.read));
            assert!(ledger.search_text(aggregate.id).is_some());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_groups_for_source_falls_back_to_default() {
        let ledger = ledger();
        assert_eq!(ledger.groups_for_source(Some("s1")), vec!["g1".to_string()]);
        assert_eq!(ledger.groups_for_source(Some("s2")), vec!["default".to_string()]);
        assert_eq!(ledger.groups_for_source(None), vec!["default".to_string()]);
    }

    #[test]
    fn test_single_default_group() {
        let mut ledger = ledger();
        ledger.register_group(group("g2", &[], true));
        let defaults: Vec<&str> = ledger
            .groups()
            .filter(|g| g.default)
            .map(|g| g.id.as_str())
            .collect();
        assert_eq!(defaults, vec!["g2"]);
    }

    #[test]
    fn test_register_source_keeps_history() {
        let mut ledger = ledger();
        let now = Utc::now();
        ledger.mark_collected("s1", now);
        ledger.register_source(OsintSource::new("s1", "Renamed", "json"));
        let source = ledger.source("s1").unwrap();
        assert_eq!(source.name, "Renamed");
        assert_eq!(source.last_collected, Some(now));
    }

    #[test]
    fn test_report_links() {
        let mut ledger = ledger();
        let ids = singletons(&mut ledger, &["one"]);
        assert!(!ledger.assigned(ids[0]));
        ledger.assign_to_report(10, ids[0]).unwrap();
        ledger.assign_to_report(11, ids[0]).unwrap();
        assert!(ledger.assigned(ids[0]));
        assert_eq!(ledger.report_count(ids[0]), 2);
        ledger.remove_from_report(10, ids[0]);
        assert_eq!(ledger.report_count(ids[0]), 1);
        assert_eq!(
            ledger.assign_to_report(1, 999),
            Err(LedgerError::AggregateNotFound(999))
        );
    }

    #[test]
    fn test_record_attempt() {
        let mut ledger = ledger();
        ledger
            .record_attempt("s1", Some("timeout".into()), Utc::now())
            .unwrap();
        assert_eq!(
            ledger.source("s1").unwrap().last_error_message.as_deref(),
            Some("timeout")
        );
        assert!(ledger.record_attempt("nope", None, Utc::now()).is_err());
    }

    #[test]
    fn test_load_reserves_ids() {
        let mut ledger = Ledger::new();
        ledger.load_aggregate(NewsItemAggregate::new(41, "g".into(), Utc::now()));
        ledger.load_item(NewsItem::new(17, "d".into(), 41));
        ledger.reserve_ids(5, 5);
        assert_eq!(ledger.next_item_id, 18);
        assert_eq!(ledger.next_aggregate_id, 42);
        assert!(ledger.journal().is_empty());
    }
}
