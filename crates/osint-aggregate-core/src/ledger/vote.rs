//! The per-(item, voter) like/dislike state machine.
//!
//! Counts move relative to the prior vote state, never set absolutely:
//!
//! | prior        | like                  | dislike                  |
//! |--------------|-----------------------|--------------------------|
//! | none         | likes+1, rel+1        | dislikes+1, rel-1        |
//! | liked        | likes-1, rel-1 (off)  | likes-1, dislikes+1, rel-2 |
//! | disliked     | dislikes-1, likes+1, rel+2 | dislikes-1, rel+1 (off) |

use chrono::{DateTime, Utc};

use super::Ledger;
use crate::error::LedgerError;
use crate::models::{NewsItemVote, Vote, Voter};

impl Ledger {
    /// Apply a local vote. Does not roll up the aggregate.
    pub(super) fn vote(
        &mut self,
        item_id: i64,
        voter: Voter,
        direction: Vote,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let item = self
            .items
            .get_mut(&item_id)
            .ok_or(LedgerError::ItemNotFound(item_id))?;
        let key = (item_id, voter);
        let mut vote = self
            .votes
            .get(&key)
            .cloned()
            .unwrap_or_else(|| NewsItemVote::new(item_id, voter));

        match direction {
            Vote::Like if vote.like => {
                item.likes -= 1;
                item.relevance -= 1;
                vote.like = false;
            }
            Vote::Like => {
                item.likes += 1;
                item.relevance += 1;
                vote.like = true;
                if vote.dislike {
                    item.dislikes -= 1;
                    item.relevance += 1;
                    vote.dislike = false;
                }
            }
            Vote::Dislike if vote.dislike => {
                item.dislikes -= 1;
                item.relevance += 1;
                vote.dislike = false;
            }
            Vote::Dislike => {
                item.dislikes += 1;
                item.relevance -= 1;
                vote.dislike = true;
                if vote.like {
                    item.likes -= 1;
                    item.relevance -= 1;
                    vote.like = false;
                }
            }
        }

        let data_id = item.news_item_data_id.clone();
        self.votes.insert(key, vote);
        self.touch_vote(key);
        self.touch_item(item_id);
        self.touch_data(&data_id, now);
        Ok(())
    }

    /// Remove a remote node's vote on an item, undoing what it contributed.
    pub(super) fn clear_remote_vote(&mut self, item_id: i64, node_id: i64) {
        let Some(previous) = self.remove_vote((item_id, Voter::Remote(node_id))) else {
            return;
        };
        if let Some(item) = self.items.get_mut(&item_id) {
            if previous.like {
                item.likes -= 1;
                item.relevance -= 1;
            }
            if previous.dislike {
                item.dislikes -= 1;
                item.relevance += 1;
            }
            self.touch_item(item_id);
        }
    }

    /// Replace a remote node's vote on an item with the sign of `relevance`.
    pub(super) fn replace_remote_vote(
        &mut self,
        item_id: i64,
        node_id: i64,
        node_name: &str,
        relevance: i64,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.clear_remote_vote(item_id, node_id);
        let Some(direction) = Vote::from_sign(relevance) else {
            return Ok(());
        };
        let voter = Voter::Remote(node_id);
        self.vote(item_id, voter, direction, now)?;
        if let Some(vote) = self.votes.get_mut(&(item_id, voter)) {
            vote.remote_user = Some(node_name.to_string());
        }
        Ok(())
    }
}
