//! Group listings and caller-specific views.

use std::cmp::Ordering;

use chrono::{DateTime, Datelike, Duration, Utc};

use super::Ledger;
use crate::auth::{Authorizer, Identity, Permission};
use crate::models::{
    AggregateFilter, AggregateView, NewsItemAggregate, NewsItemView, SortOrder, TimeRange,
};

/// Earliest `created` admitted by a time range, in UTC.
///
/// `Today` starts at midnight, `Week` on Monday, `Month` on the first.
pub fn range_start(range: TimeRange, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let midnight = now.date_naive().and_hms_opt(0, 0, 0)?.and_utc();
    match range {
        TimeRange::All => None,
        TimeRange::Today => Some(midnight),
        TimeRange::Week => Some(midnight - Duration::days(i64::from(now.weekday().num_days_from_monday()))),
        TimeRange::Month => Some(midnight - Duration::days(i64::from(now.day0()))),
    }
}

/// Ordering for a sort option. Ties fall back to id in the sort's direction.
pub fn compare(sort: SortOrder, a: &NewsItemAggregate, b: &NewsItemAggregate) -> Ordering {
    let ascending = match sort {
        SortOrder::DateDesc | SortOrder::DateAsc => a.created.cmp(&b.created),
        SortOrder::RelevanceDesc | SortOrder::RelevanceAsc => a.relevance.cmp(&b.relevance),
    }
    .then_with(|| a.id.cmp(&b.id));
    match sort {
        SortOrder::DateDesc | SortOrder::RelevanceDesc => ascending.reverse(),
        SortOrder::DateAsc | SortOrder::RelevanceAsc => ascending,
    }
}

impl Ledger {
    fn matches(&self, aggregate: &NewsItemAggregate, filter: &AggregateFilter, since: Option<DateTime<Utc>>) -> bool {
        if since.is_some_and(|since| aggregate.created < since) {
            return false;
        }
        if filter.unread_only && aggregate.read {
            return false;
        }
        if filter.important_only && !aggregate.important {
            return false;
        }
        if filter.relevant_only && aggregate.likes <= 0 {
            return false;
        }
        if filter.in_report_only && !self.assigned(aggregate.id) {
            return false;
        }
        match filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(needle) => self
                .search_text(aggregate.id)
                .is_some_and(|text| text.contains(&needle.to_lowercase())),
            None => true,
        }
    }

    /// Whether the caller may see at least one member.
    fn visible(&self, aggregate_id: i64, identity: &Identity, auth: &dyn Authorizer) -> bool {
        self.member_ids(aggregate_id)
            .into_iter()
            .any(|id| self.permitted(id, identity, auth, Permission::See))
    }

    /// One page of a group's aggregates and the total number of matches.
    #[allow(clippy::too_many_arguments)]
    pub fn query_group(
        &self,
        group_id: &str,
        filter: &AggregateFilter,
        offset: usize,
        limit: usize,
        identity: &Identity,
        auth: &dyn Authorizer,
        now: DateTime<Utc>,
    ) -> (Vec<AggregateView>, usize) {
        let since = range_start(filter.range, now);
        let mut matching: Vec<&NewsItemAggregate> = self
            .aggregates
            .values()
            .filter(|a| a.osint_source_group_id == group_id)
            .filter(|a| self.matches(a, filter, since))
            .filter(|a| self.visible(a.id, identity, auth))
            .collect();
        matching.sort_by(|a, b| compare(filter.sort, a, b));

        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .filter_map(|a| self.view_aggregate(a.id, identity, auth))
            .collect();
        (page, total)
    }

    /// An aggregate with the members the caller may see.
    pub fn view_aggregate(&self, aggregate_id: i64, identity: &Identity, auth: &dyn Authorizer) -> Option<AggregateView> {
        let aggregate = self.aggregate(aggregate_id)?;
        let news_items: Vec<NewsItemView> = self
            .member_ids(aggregate_id)
            .into_iter()
            .filter_map(|id| self.view_item(id, identity, auth))
            .collect();
        Some(AggregateView {
            aggregate: aggregate.clone(),
            me_like: news_items.iter().any(|i| i.me_like),
            me_dislike: news_items.iter().any(|i| i.me_dislike),
            news_items,
            in_reports_count: self.report_count(aggregate_id),
        })
    }

    /// A member item with its data and the caller's vote, if visible.
    pub fn view_item(&self, item_id: i64, identity: &Identity, auth: &dyn Authorizer) -> Option<NewsItemView> {
        if !self.permitted(item_id, identity, auth, Permission::See) {
            return None;
        }
        let item = self.item(item_id)?;
        let data = self.data(&item.news_item_data_id)?;
        let vote = identity.voter().and_then(|v| self.vote_of(item_id, v));
        Some(NewsItemView {
            item: item.clone(),
            news_item_data: data.clone(),
            me_like: vote.is_some_and(|v| v.like),
            me_dislike: vote.is_some_and(|v| v.dislike),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::super::fixtures::*;
    use super::*;
    use crate::auth::{AclSubject, AllowAll};
    use crate::models::{StatusUpdate, Target, Vote};

    fn user() -> Identity {
        Identity::user(1)
    }

    fn list(ledger: &Ledger, filter: &AggregateFilter) -> Vec<String> {
        ledger
            .query_group("g1", filter, 0, 100, &user(), &AllowAll, Utc::now())
            .0
            .into_iter()
            .map(|v| v.aggregate.title)
            .collect()
    }

    #[test]
    fn test_range_start() {
        // Thursday
        let now = Utc.with_ymd_and_hms(2024, 5, 16, 15, 30, 0).unwrap();
        assert_eq!(range_start(TimeRange::All, now), None);
        assert_eq!(range_start(TimeRange::Today, now), Utc.with_ymd_and_hms(2024, 5, 16, 0, 0, 0).single());
        assert_eq!(range_start(TimeRange::Week, now), Utc.with_ymd_and_hms(2024, 5, 13, 0, 0, 0).single());
        assert_eq!(range_start(TimeRange::Month, now), Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).single());
    }

    #[test]
    fn test_default_sort_is_newest_first() {
        let mut ledger = ledger();
        singletons(&mut ledger, &["a", "b", "c"]);
        assert_eq!(list(&ledger, &AggregateFilter::default()), vec!["c", "b", "a"]);
        let asc = AggregateFilter {
            sort: SortOrder::DateAsc,
            ..Default::default()
        };
        assert_eq!(list(&ledger, &asc), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_relevance_sort_and_relevant_filter() {
        let mut ledger = ledger();
        let ids = singletons(&mut ledger, &["a", "b", "c"]);
        ledger
            .update_aggregate(ids[1], &StatusUpdate::vote(Vote::Like), &user(), &AllowAll, Utc::now())
            .unwrap();
        ledger
            .update_aggregate(ids[2], &StatusUpdate::vote(Vote::Dislike), &user(), &AllowAll, Utc::now())
            .unwrap();

        let desc = AggregateFilter {
            sort: SortOrder::RelevanceDesc,
            ..Default::default()
        };
        assert_eq!(list(&ledger, &desc), vec!["b", "a", "c"]);
        let relevant = AggregateFilter {
            relevant_only: true,
            ..Default::default()
        };
        assert_eq!(list(&ledger, &relevant), vec!["b"]);
    }

    #[test]
    fn test_relevance_ties_follow_id_in_sort_direction() {
        let mut ledger = ledger();
        let ids = singletons(&mut ledger, &["a", "b", "c", "d"]);
        ledger
            .update_aggregate(ids[3], &StatusUpdate::vote(Vote::Like), &user(), &AllowAll, Utc::now())
            .unwrap();

        let desc = AggregateFilter {
            sort: SortOrder::RelevanceDesc,
            ..Default::default()
        };
        assert_eq!(list(&ledger, &desc), vec!["d", "c", "b", "a"]);
        let asc = AggregateFilter {
            sort: SortOrder::RelevanceAsc,
            ..Default::default()
        };
        assert_eq!(list(&ledger, &asc), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_search_sees_fresh_text() {
        let mut ledger = ledger();
        let ids = singletons(&mut ledger, &["a", "b"]);
        let search = AggregateFilter {
            search: Some("Narwhal".into()),
            ..Default::default()
        };
        assert!(list(&ledger, &search).is_empty());

        let update = StatusUpdate {
            description: Some("a narwhal appeared".into()),
            ..Default::default()
        };
        ledger.update_aggregate(ids[0], &update, &user(), &AllowAll, Utc::now()).unwrap();
        assert_eq!(list(&ledger, &search), vec!["a"]);

        // the merged aggregate keeps only b's header text
        ledger
            .group_targets(&[Target::Aggregate(ids[1]), Target::Aggregate(ids[0])], &user(), &AllowAll)
            .unwrap();
        assert!(list(&ledger, &search).is_empty());
        let member_text = AggregateFilter {
            search: Some("content of A".into()),
            ..Default::default()
        };
        assert_eq!(list(&ledger, &member_text), vec!["b"]);
    }

    #[test]
    fn test_flag_filters() {
        let mut ledger = ledger();
        let ids = singletons(&mut ledger, &["a", "b", "c"]);
        let read = StatusUpdate {
            read: true,
            ..Default::default()
        };
        let important = StatusUpdate {
            important: true,
            ..Default::default()
        };
        ledger.update_aggregate(ids[0], &read, &user(), &AllowAll, Utc::now()).unwrap();
        ledger.update_aggregate(ids[1], &important, &user(), &AllowAll, Utc::now()).unwrap();
        ledger.assign_to_report(4, ids[2]).unwrap();

        let unread = AggregateFilter {
            unread_only: true,
            ..Default::default()
        };
        assert_eq!(list(&ledger, &unread), vec!["c", "b"]);
        let important_only = AggregateFilter {
            important_only: true,
            ..Default::default()
        };
        assert_eq!(list(&ledger, &important_only), vec!["b"]);
        let in_report = AggregateFilter {
            in_report_only: true,
            ..Default::default()
        };
        assert_eq!(list(&ledger, &in_report), vec!["c"]);
    }

    #[test]
    fn test_paging_reports_total() {
        let mut ledger = ledger();
        singletons(&mut ledger, &["a", "b", "c", "d", "e"]);
        let (page, total) = ledger.query_group("g1", &AggregateFilter::default(), 1, 2, &user(), &AllowAll, Utc::now());
        assert_eq!(total, 5);
        let titles: Vec<&str> = page.iter().map(|v| v.aggregate.title.as_str()).collect();
        assert_eq!(titles, vec!["d", "c"]);
        assert!(ledger
            .query_group("other", &AggregateFilter::default(), 0, 10, &user(), &AllowAll, Utc::now())
            .0
            .is_empty());
    }

    #[test]
    fn test_views_carry_caller_votes() {
        let mut ledger = ledger();
        let ids = singletons(&mut ledger, &["a"]);
        ledger
            .update_aggregate(ids[0], &StatusUpdate::vote(Vote::Like), &user(), &AllowAll, Utc::now())
            .unwrap();
        ledger.assign_to_report(8, ids[0]).unwrap();

        let mine = ledger.view_aggregate(ids[0], &user(), &AllowAll).unwrap();
        assert!(mine.me_like);
        assert!(mine.news_items[0].me_like);
        assert_eq!(mine.in_reports_count, 1);
        assert_eq!(mine.news_items[0].news_item_data.title, "a");

        let theirs = ledger.view_aggregate(ids[0], &Identity::user(2), &AllowAll).unwrap();
        assert!(!theirs.me_like);
    }

    #[test]
    fn test_hidden_members_are_omitted() {
        struct Blind;
        impl Authorizer for Blind {
            fn allowed(&self, _i: &Identity, _s: &AclSubject<'_>, p: Permission) -> bool {
                p != Permission::See
            }
        }
        let mut ledger = ledger();
        let ids = singletons(&mut ledger, &["a"]);
        let view = ledger.view_aggregate(ids[0], &user(), &Blind).unwrap();
        assert!(view.news_items.is_empty());
        let (page, total) = ledger.query_group("g1", &AggregateFilter::default(), 0, 10, &user(), &Blind, Utc::now());
        assert!(page.is_empty());
        assert_eq!(total, 0);
        assert_eq!(
            ledger.query_group("g1", &AggregateFilter::default(), 0, 10, &Identity::System, &Blind, Utc::now()).1,
            1
        );
    }
}
