//! Deduplicating ingestion and the per-group fan-out.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use super::Ledger;
use crate::error::LedgerError;
use crate::models::NewsItemData;

impl Ledger {
    /// Store every record whose hash is new and fan it out to its groups.
    ///
    /// Duplicates are dropped without creating items. Returns the sources
    /// that received new content; each of them gets `last_collected`
    /// bumped exactly once.
    pub fn add_items(&mut self, batch: Vec<NewsItemData>, now: DateTime<Utc>) -> BTreeSet<String> {
        let mut sources = BTreeSet::new();
        let mut created = 0usize;
        let mut duplicates = 0usize;

        for data in batch {
            if self.identical(&data.hash) {
                tracing::debug!(hash = %data.hash, "skipping duplicate");
                duplicates += 1;
                continue;
            }
            let source_id = data.osint_source_id.clone();
            let data_id = self.put_new_data(data);
            let aggregates = self.create_for_all_groups(&data_id);
            if aggregates.is_empty() {
                tracing::warn!(data_id, "no group accepts this item and no default group exists");
            }
            created += 1;
            if let Some(source_id) = source_id {
                sources.insert(source_id);
            }
        }

        for source_id in &sources {
            self.mark_collected(source_id, now);
        }
        tracing::debug!(created, duplicates, "batch ingested");
        sources
    }

    /// One item + singleton aggregate in every group of the data's source.
    pub(super) fn create_for_all_groups(&mut self, data_id: &str) -> Vec<i64> {
        let source_id = self.data(data_id).and_then(|d| d.osint_source_id.clone());
        self.groups_for_source(source_id.as_deref())
            .into_iter()
            .filter_map(|group_id| self.create_for_group(data_id, &group_id).ok())
            .collect()
    }

    /// One item + singleton aggregate in the given group. Returns the aggregate id.
    pub(super) fn create_for_group(&mut self, data_id: &str, group_id: &str) -> Result<i64, LedgerError> {
        let data = self
            .data(data_id)
            .ok_or_else(|| LedgerError::DataNotFound(data_id.to_string()))?;
        let (title, review, collected) = (data.title.clone(), data.review.clone(), data.collected);

        let aggregate_id = self.new_aggregate(group_id.to_string(), collected);
        if let Some(aggregate) = self.aggregates.get_mut(&aggregate_id) {
            aggregate.title = title;
            aggregate.description = review;
        }
        self.new_item(data_id.to_string(), aggregate_id);
        self.update_status(aggregate_id);
        self.prepare(aggregate_id);
        Ok(aggregate_id)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::models::OsintSourceGroup;
    use crate::normalize::fingerprint;

    #[test]
    fn test_single_item_into_one_group() {
        let mut ledger = ledger();
        let sources = ledger.add_items(vec![data("A", "T", "L", "s1")], Utc::now());

        assert_eq!(sources.into_iter().collect::<Vec<_>>(), vec!["s1".to_string()]);
        let stats = ledger.stats();
        assert_eq!(stats.news_item_data, 1);
        assert_eq!(stats.news_items, 1);
        assert_eq!(stats.aggregates, 1);

        let stored = ledger.find_data_by_hash(&fingerprint("A", "T", "L")).unwrap();
        assert_eq!(stored.title, "T");
        let aggregate = ledger.aggregates().next().unwrap();
        assert_eq!(aggregate.osint_source_group_id, "g1");
        assert_eq!(aggregate.title, "T");
        assert_eq!(aggregate.description, "review of T");
        assert_eq!((aggregate.relevance, aggregate.likes, aggregate.dislikes), (0, 0, 0));
        assert_rollup(&ledger);
    }

    #[test]
    fn test_duplicates_within_and_across_batches() {
        let mut ledger = ledger();
        let now = Utc::now();
        ledger.add_items(
            vec![data("A", "T", "L", "s1"), data("A", "T", "L", "s1")],
            now,
        );
        let again = ledger.add_items(
            vec![data("A", "T", "L", "s2"), data("B", "T", "L", "s1")],
            now,
        );
        assert_eq!(again.into_iter().collect::<Vec<_>>(), vec!["s1".to_string()]);
        assert_eq!(ledger.stats().news_item_data, 2);
        assert_eq!(ledger.stats().aggregates, 2);
    }

    #[test]
    fn test_fan_out_to_every_group() {
        let mut ledger = ledger();
        ledger.register_group(OsintSourceGroup {
            id: "g2".into(),
            name: "G2".into(),
            default: false,
            source_ids: ["s1".to_string()].into_iter().collect(),
        });
        ledger.add_items(vec![data("A", "T", "L", "s1")], Utc::now());

        let mut groups: Vec<&str> = ledger
            .aggregates()
            .map(|a| a.osint_source_group_id.as_str())
            .collect();
        groups.sort();
        assert_eq!(groups, vec!["g1", "g2"]);
        assert_eq!(ledger.stats().news_item_data, 1);
        assert_eq!(ledger.stats().news_items, 2);
    }

    #[test]
    fn test_unassigned_source_uses_default_group() {
        let mut ledger = ledger();
        ledger.add_items(vec![data("A", "T", "L", "s2")], Utc::now());
        let aggregate = ledger.aggregates().next().unwrap();
        assert_eq!(aggregate.osint_source_group_id, "default");
    }

    #[test]
    fn test_last_collected_bumped_once_per_source() {
        let mut ledger = ledger();
        let now = Utc::now();
        ledger.add_items(
            vec![data("A", "1", "L", "s1"), data("A", "2", "L", "s1")],
            now,
        );
        assert_eq!(ledger.source("s1").unwrap().last_collected, Some(now));
        assert_eq!(ledger.source("s2").unwrap().last_collected, None);
        assert_eq!(ledger.journal().sources.len(), 1);
    }

    #[test]
    fn test_search_index_prepared_for_new_aggregates() {
        let mut ledger = ledger();
        let ids = singletons(&mut ledger, &["Quokka"]);
        let text = ledger.search_text(ids[0]).unwrap();
        assert!(text.contains("quokka"));
        assert!(text.contains("content of quokka"));
    }

    #[test]
    fn test_reused_data_id_does_not_overwrite_existing_content() {
        let mut ledger = ledger();
        let now = Utc::now();
        let mut first = data("A", "First", "L", "s1");
        first.id = "x".into();
        let mut second = data("A", "Second", "L", "s1");
        second.id = "x".into();

        ledger.add_items(vec![first], now);
        ledger.add_items(vec![second], now);

        let stats = ledger.stats();
        assert_eq!((stats.news_item_data, stats.news_items, stats.aggregates), (2, 2, 2));
        let original = ledger.find_data_by_hash(&fingerprint("A", "First", "L")).unwrap();
        assert_eq!(original.id, "x");
        assert_eq!(original.title, "First");
        let moved = ledger.find_data_by_hash(&fingerprint("A", "Second", "L")).unwrap();
        assert_ne!(moved.id, "x");
        assert_eq!(moved.title, "Second");
        for aggregate in ledger.aggregates() {
            let member = ledger.members(aggregate.id).next().unwrap();
            let stored = ledger.data(&member.news_item_data_id).unwrap();
            assert_eq!(aggregate.title, stored.title);
            assert!(ledger.search_text(aggregate.id).unwrap().contains(&stored.title.to_lowercase()));
        }
    }

    #[test]
    fn test_id_known_only_by_hash_is_not_reused() {
        let mut ledger = ledger();
        ledger.load_known_hash("elsewhere".into(), "x".into());
        let mut record = data("A", "T", "L", "s1");
        record.id = "x".into();
        ledger.add_items(vec![record], Utc::now());
        let stored = ledger.find_data_by_hash(&fingerprint("A", "T", "L")).unwrap();
        assert_ne!(stored.id, "x");
        assert!(!ledger.journal().data.contains("x"));
    }
}
