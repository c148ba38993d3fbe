//! Status updates and the group / ungroup / delete engine.
//!
//! Group, ungroup and delete first check that no target aggregate is
//! referenced by a report; otherwise nothing is touched and the call answers
//! [`ActionResponse::in_use`]. Items the caller may not modify are skipped.
//! Every call ends with one refresh pass over the set of touched aggregates.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use super::Ledger;
use crate::auth::{Authorizer, Identity, Permission};
use crate::error::LedgerError;
use crate::models::{ActionResponse, GroupAction, StatusUpdate, Target, Vote};

impl Ledger {
    /// Aggregate a target refers to, failing on unknown ids.
    fn target_aggregate(&self, target: Target) -> Result<i64, LedgerError> {
        match target {
            Target::Aggregate(id) => self
                .aggregates
                .contains_key(&id)
                .then_some(id)
                .ok_or(LedgerError::AggregateNotFound(id)),
            Target::Item(id) => self
                .items
                .get(&id)
                .map(|i| i.news_item_aggregate_id)
                .ok_or(LedgerError::ItemNotFound(id)),
        }
    }

    /// Whether no target aggregate is referenced by a report.
    pub fn action_allowed(&self, targets: &[Target]) -> Result<bool, LedgerError> {
        for target in targets {
            if self.assigned(self.target_aggregate(*target)?) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Items the caller may modify among the targets, deduplicated, in
    /// target order.
    fn permitted_items(&self, targets: &[Target], identity: &Identity, auth: &dyn Authorizer) -> Vec<i64> {
        let mut seen = BTreeSet::new();
        let mut items = Vec::new();
        for target in targets {
            let candidates = match *target {
                Target::Aggregate(id) => self.member_ids(id),
                Target::Item(id) => vec![id],
            };
            for item_id in candidates {
                if self.items.contains_key(&item_id)
                    && self.permitted(item_id, identity, auth, Permission::Modify)
                    && seen.insert(item_id)
                {
                    items.push(item_id);
                }
            }
        }
        items
    }

    /// Vote or toggle flags on one item.
    pub fn update_item(
        &mut self,
        item_id: i64,
        update: &StatusUpdate,
        identity: &Identity,
        auth: &dyn Authorizer,
        now: DateTime<Utc>,
    ) -> Result<ActionResponse, LedgerError> {
        let item = self.item(item_id).ok_or(LedgerError::ItemNotFound(item_id))?;
        let aggregate_id = item.news_item_aggregate_id;
        let mut sources = BTreeSet::new();
        if !self.permitted(item_id, identity, auth, Permission::Modify) {
            tracing::debug!(item_id, "update skipped, not permitted");
            return Ok(ActionResponse::success(sources));
        }

        if let (Some(direction), Some(voter)) = (update.vote, identity.voter()) {
            self.vote(item_id, voter, direction, now)?;
        }
        if let Some(item) = self.items.get_mut(&item_id) {
            if update.read {
                item.read = !item.read;
            }
            if update.important {
                item.important = !item.important;
            }
        }
        self.touch_item(item_id);
        sources.extend(self.source_of_item(item_id));
        self.refresh_aggregates([aggregate_id]);
        Ok(ActionResponse::success(sources))
    }

    /// Vote, mark, or edit a whole aggregate.
    ///
    /// `read` sets every permitted member to the negation of the aggregate's
    /// current read state; `important` to the negation of "all members
    /// important". Title, description and comments are replaced when given.
    pub fn update_aggregate(
        &mut self,
        aggregate_id: i64,
        update: &StatusUpdate,
        identity: &Identity,
        auth: &dyn Authorizer,
        now: DateTime<Utc>,
    ) -> Result<ActionResponse, LedgerError> {
        let aggregate = self
            .aggregate(aggregate_id)
            .ok_or(LedgerError::AggregateNotFound(aggregate_id))?;
        let read = !aggregate.read;
        let all_important = self.members(aggregate_id).all(|i| i.important);
        let mut sources = BTreeSet::new();

        for item_id in self.member_ids(aggregate_id) {
            if !self.permitted(item_id, identity, auth, Permission::Modify) {
                continue;
            }
            if let (Some(direction), Some(voter)) = (update.vote, identity.voter()) {
                self.vote(item_id, voter, direction, now)?;
            }
            if let Some(item) = self.items.get_mut(&item_id) {
                if update.read {
                    item.read = read;
                }
                if update.important {
                    item.important = !all_important;
                }
            }
            self.touch_item(item_id);
            sources.extend(self.source_of_item(item_id));
        }

        if let Some(aggregate) = self.aggregates.get_mut(&aggregate_id) {
            if let Some(title) = &update.title {
                aggregate.title = title.clone();
            }
            if let Some(description) = &update.description {
                aggregate.description = description.clone();
            }
            if let Some(comments) = &update.comments {
                aggregate.comments = comments.clone();
            }
        }
        self.touch_aggregate(aggregate_id);
        self.refresh_aggregates([aggregate_id]);
        Ok(ActionResponse::success(sources))
    }

    /// Dispatch a bulk action over a target list.
    pub fn group_action(
        &mut self,
        action: GroupAction,
        targets: &[Target],
        identity: &Identity,
        auth: &dyn Authorizer,
        now: DateTime<Utc>,
    ) -> Result<ActionResponse, LedgerError> {
        match action {
            GroupAction::Group => self.group_targets(targets, identity, auth),
            GroupAction::Ungroup => self.ungroup(targets, identity, auth),
            GroupAction::Delete => self.delete_targets(targets, identity, auth),
            GroupAction::Like | GroupAction::Dislike | GroupAction::Important | GroupAction::Read => {
                self.bulk_status(action, targets, identity, auth, now)
            }
        }
    }

    fn bulk_status(
        &mut self,
        action: GroupAction,
        targets: &[Target],
        identity: &Identity,
        auth: &dyn Authorizer,
        now: DateTime<Utc>,
    ) -> Result<ActionResponse, LedgerError> {
        for target in targets {
            self.target_aggregate(*target)?;
        }
        let items = self.permitted_items(targets, identity, auth);
        let all_important = items.iter().filter_map(|id| self.item(*id)).all(|i| i.important);
        let all_read = items.iter().filter_map(|id| self.item(*id)).all(|i| i.read);

        let mut touched = BTreeSet::new();
        let mut sources = BTreeSet::new();
        for item_id in items {
            match action {
                GroupAction::Like | GroupAction::Dislike => {
                    let direction = if action == GroupAction::Like { Vote::Like } else { Vote::Dislike };
                    if let Some(voter) = identity.voter() {
                        self.vote(item_id, voter, direction, now)?;
                    }
                }
                GroupAction::Important => {
                    if let Some(item) = self.items.get_mut(&item_id) {
                        item.important = !all_important;
                    }
                    self.touch_item(item_id);
                }
                GroupAction::Read => {
                    if let Some(item) = self.items.get_mut(&item_id) {
                        item.read = !all_read;
                    }
                    self.touch_item(item_id);
                }
                _ => {}
            }
            if let Some(item) = self.item(item_id) {
                touched.insert(item.news_item_aggregate_id);
            }
            sources.extend(self.source_of_item(item_id));
        }
        self.refresh_aggregates(touched);
        Ok(ActionResponse::success(sources))
    }

    /// Merge the permitted items of all targets into one new aggregate.
    ///
    /// The new aggregate takes title, description, created and group from
    /// the first target processed.
    pub fn group_targets(
        &mut self,
        targets: &[Target],
        identity: &Identity,
        auth: &dyn Authorizer,
    ) -> Result<ActionResponse, LedgerError> {
        if !self.action_allowed(targets)? {
            return Ok(ActionResponse::in_use());
        }

        let mut header = None;
        for target in targets {
            match *target {
                Target::Aggregate(id) => {
                    if let Some(aggregate) = self.aggregate(id) {
                        header = Some((
                            aggregate.title.clone(),
                            aggregate.description.clone(),
                            aggregate.created,
                            aggregate.osint_source_group_id.clone(),
                        ));
                    }
                }
                Target::Item(id) => {
                    if !self.permitted(id, identity, auth, Permission::Modify) {
                        continue;
                    }
                    let item = self.item(id).ok_or(LedgerError::ItemNotFound(id))?;
                    let group = self
                        .aggregate(item.news_item_aggregate_id)
                        .map(|a| a.osint_source_group_id.clone())
                        .unwrap_or_default();
                    let data = self
                        .data(&item.news_item_data_id)
                        .ok_or_else(|| LedgerError::DataNotFound(item.news_item_data_id.clone()))?;
                    header = Some((data.title.clone(), data.review.clone(), data.collected, group));
                }
            }
            if header.is_some() {
                break;
            }
        }

        let items = self.permitted_items(targets, identity, auth);
        let Some((title, description, created, group_id)) = header else {
            return Ok(ActionResponse::success(BTreeSet::new()));
        };
        if items.is_empty() {
            return Ok(ActionResponse::success(BTreeSet::new()));
        }

        let new_id = self.new_aggregate(group_id, created);
        if let Some(aggregate) = self.aggregates.get_mut(&new_id) {
            aggregate.title = title;
            aggregate.description = description;
        }

        let mut touched = BTreeSet::from([new_id]);
        let mut sources = BTreeSet::new();
        for item_id in items {
            if let Some(item) = self.item(item_id) {
                touched.insert(item.news_item_aggregate_id);
            }
            self.attach(item_id, new_id);
            sources.extend(self.source_of_item(item_id));
        }
        tracing::debug!(aggregate_id = new_id, sources_touched = touched.len() - 1, "grouped");
        self.refresh_aggregates(touched);
        Ok(ActionResponse::success(sources))
    }

    /// Split every permitted item into its own singleton aggregate in the
    /// group it came from.
    pub fn ungroup(
        &mut self,
        targets: &[Target],
        identity: &Identity,
        auth: &dyn Authorizer,
    ) -> Result<ActionResponse, LedgerError> {
        if !self.action_allowed(targets)? {
            return Ok(ActionResponse::in_use());
        }

        let mut touched = BTreeSet::new();
        let mut sources = BTreeSet::new();
        for item_id in self.permitted_items(targets, identity, auth) {
            let item = self.item(item_id).ok_or(LedgerError::ItemNotFound(item_id))?;
            let old_id = item.news_item_aggregate_id;
            let data_id = item.news_item_data_id.clone();
            let group_id = self
                .aggregate(old_id)
                .map(|a| a.osint_source_group_id.clone())
                .ok_or(LedgerError::AggregateNotFound(old_id))?;
            let data = self
                .data(&data_id)
                .ok_or_else(|| LedgerError::DataNotFound(data_id.clone()))?;
            let (title, review, collected) = (data.title.clone(), data.review.clone(), data.collected);

            let new_id = self.new_aggregate(group_id, collected);
            if let Some(aggregate) = self.aggregates.get_mut(&new_id) {
                aggregate.title = title;
                aggregate.description = review;
            }
            self.attach(item_id, new_id);
            touched.insert(old_id);
            touched.insert(new_id);
            sources.extend(self.source_of_item(item_id));
        }
        self.refresh_aggregates(touched);
        Ok(ActionResponse::success(sources))
    }

    /// Delete the permitted items of all targets along with their votes.
    pub fn delete_targets(
        &mut self,
        targets: &[Target],
        identity: &Identity,
        auth: &dyn Authorizer,
    ) -> Result<ActionResponse, LedgerError> {
        if !self.action_allowed(targets)? {
            return Ok(ActionResponse::in_use());
        }

        let mut touched = BTreeSet::new();
        let mut sources = BTreeSet::new();
        for item_id in self.permitted_items(targets, identity, auth) {
            if let Some(item) = self.item(item_id) {
                touched.insert(item.news_item_aggregate_id);
            }
            sources.extend(self.source_of_item(item_id));
            self.remove_item(item_id);
        }
        self.refresh_aggregates(touched);
        Ok(ActionResponse::success(sources))
    }

    pub fn delete_item(
        &mut self,
        item_id: i64,
        identity: &Identity,
        auth: &dyn Authorizer,
    ) -> Result<ActionResponse, LedgerError> {
        self.delete_targets(&[Target::Item(item_id)], identity, auth)
    }

    pub fn delete_aggregate(
        &mut self,
        aggregate_id: i64,
        identity: &Identity,
        auth: &dyn Authorizer,
    ) -> Result<ActionResponse, LedgerError> {
        self.delete_targets(&[Target::Aggregate(aggregate_id)], identity, auth)
    }
}
