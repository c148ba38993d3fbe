//! Roll-up and search-index maintenance.

use super::Ledger;
use crate::normalize::strip_html;

impl Ledger {
    /// Recompute the aggregate's roll-up fields from its members.
    ///
    /// An aggregate without members is deleted together with its index row.
    /// Returns whether the aggregate still exists.
    pub fn update_status(&mut self, aggregate_id: i64) -> bool {
        if !self.aggregates.contains_key(&aggregate_id) {
            return false;
        }
        let mut likes = 0;
        let mut dislikes = 0;
        let mut relevance = 0;
        let mut important = false;
        let mut read = true;
        let mut count = 0usize;
        for item in self.members(aggregate_id) {
            likes += item.likes;
            dislikes += item.dislikes;
            relevance += item.relevance;
            important |= item.important;
            read &= item.read;
            count += 1;
        }

        if count == 0 {
            tracing::debug!(aggregate_id, "removing empty aggregate");
            self.remove_aggregate(aggregate_id);
            return false;
        }

        if let Some(aggregate) = self.aggregates.get_mut(&aggregate_id) {
            aggregate.likes = likes;
            aggregate.dislikes = dislikes;
            aggregate.relevance = relevance;
            aggregate.important = important;
            aggregate.read = read;
        }
        self.touch_aggregate(aggregate_id);
        true
    }

    /// Rebuild the aggregate's search index row.
    pub fn prepare(&mut self, aggregate_id: i64) {
        let Some(text) = self.index_text(aggregate_id) else {
            return;
        };
        self.search_index.insert(aggregate_id, text);
        self.journal.removed_search_index.remove(&aggregate_id);
        self.journal.search_index.insert(aggregate_id);
    }

    /// Lowercased blob of the aggregate's text and its members' text.
    pub fn index_text(&self, aggregate_id: i64) -> Option<String> {
        let aggregate = self.aggregates.get(&aggregate_id)?;
        let mut parts: Vec<String> = vec![
            aggregate.title.clone(),
            aggregate.description.clone(),
            aggregate.comments.clone(),
        ];
        for item in self.members(aggregate_id) {
            let Some(data) = self.data.get(&item.news_item_data_id) else {
                continue;
            };
            parts.push(data.title.clone());
            parts.push(data.review.clone());
            parts.push(strip_html(&data.content));
            parts.push(data.author.clone());
            parts.push(data.link.clone());
            parts.extend(data.attributes.iter().map(|a| a.value.clone()));
        }
        parts.extend(aggregate.attributes.iter().map(|a| a.value.clone()));
        Some(parts.join(" ").to_lowercase())
    }

    /// The shared cleanup pass: delete emptied aggregates, re-index and
    /// roll up the rest. Each aggregate is visited once.
    pub(super) fn refresh_aggregates(&mut self, aggregate_ids: impl IntoIterator<Item = i64>) {
        let ids: std::collections::BTreeSet<i64> = aggregate_ids.into_iter().collect();
        for aggregate_id in ids {
            if self.update_status(aggregate_id) {
                self.prepare(aggregate_id);
            }
        }
    }
}
