//! Core data models for the aggregation engine.
//!
//! Records flow through the engine in three shapes:
//!
//! 1. [`RawRecord`]: what a collector hands over, every field optional.
//! 2. [`NewsItemData`]: the normalized, deduplicated content record.
//! 3. [`NewsItem`] + [`NewsItemAggregate`]: the per-group work units that
//!    analysts vote on, group, and delete.
//!
//! Relationships are plain id references; the [`Ledger`](crate::ledger::Ledger)
//! owns the tables.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A record as delivered by a collector adapter, before normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub review: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub published: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub collected: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub osint_source_id: Option<String>,
    #[serde(default)]
    pub attributes: Vec<RawAttribute>,
}

/// Attribute as delivered by a collector. Binary payloads arrive base64-encoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawAttribute {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub binary_mime_type: Option<String>,
    #[serde(default)]
    pub binary_value: Option<String>,
}

/// Key/value attribute attached to a data record or an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItemAttribute {
    pub key: String,
    pub value: String,
    pub binary_mime_type: Option<String>,
    /// Raw payload; travels as a base64 `binary_value` string.
    #[serde(
        rename = "binary_value",
        with = "base64_payload",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub binary_data: Option<Vec<u8>>,
    pub created: DateTime<Utc>,
    pub remote_node_id: Option<i64>,
    pub remote_user: Option<String>,
}

/// The deduplicated content record. `hash` is unique across the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItemData {
    pub id: String,
    pub hash: String,
    pub title: String,
    pub review: String,
    pub author: String,
    pub source: String,
    pub link: String,
    pub language: Option<String>,
    pub content: String,
    pub collected: DateTime<Utc>,
    /// Free text, format depends on the source.
    pub published: String,
    pub updated: DateTime<Utc>,
    pub osint_source_id: Option<String>,
    pub remote_source: Option<String>,
    pub attributes: Vec<NewsItemAttribute>,
}

/// One group's instance of a [`NewsItemData`].
///
/// `relevance == likes - dislikes` is maintained incrementally by the vote
/// state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    pub id: i64,
    pub read: bool,
    pub important: bool,
    pub likes: i64,
    pub dislikes: i64,
    pub relevance: i64,
    pub news_item_data_id: String,
    pub news_item_aggregate_id: i64,
}

impl NewsItem {
    pub fn new(id: i64, news_item_data_id: String, news_item_aggregate_id: i64) -> Self {
        Self {
            id,
            read: false,
            important: false,
            likes: 0,
            dislikes: 0,
            relevance: 0,
            news_item_data_id,
            news_item_aggregate_id,
        }
    }
}

/// Who cast a vote: a local user or a remote node, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Voter {
    User(i64),
    Remote(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItemVote {
    pub news_item_id: i64,
    pub voter: Voter,
    pub remote_user: Option<String>,
    pub like: bool,
    pub dislike: bool,
}

impl NewsItemVote {
    pub fn new(news_item_id: i64, voter: Voter) -> Self {
        Self {
            news_item_id,
            voter,
            remote_user: None,
            like: false,
            dislike: false,
        }
    }
}

/// The analyst-facing grouping of one or more news items.
///
/// Roll-up fields (`read`, `important`, `likes`, `dislikes`, `relevance`)
/// are derived from the members by [`Ledger::update_status`](crate::ledger::Ledger::update_status).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItemAggregate {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub created: DateTime<Utc>,
    pub read: bool,
    pub important: bool,
    pub likes: i64,
    pub dislikes: i64,
    pub relevance: i64,
    pub comments: String,
    pub osint_source_group_id: String,
    pub attributes: Vec<NewsItemAttribute>,
}

impl NewsItemAggregate {
    pub fn new(id: i64, osint_source_group_id: String, created: DateTime<Utc>) -> Self {
        Self {
            id,
            title: String::new(),
            description: String::new(),
            created,
            read: false,
            important: false,
            likes: 0,
            dislikes: 0,
            relevance: 0,
            comments: String::new(),
            osint_source_group_id,
            attributes: Vec::new(),
        }
    }
}

/// A configured external feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsintSource {
    pub id: String,
    pub name: String,
    pub collector_type: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub last_collected: Option<DateTime<Utc>>,
    pub last_attempted: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
}

impl OsintSource {
    pub fn new(id: impl Into<String>, name: impl Into<String>, collector_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            collector_type: collector_type.into(),
            parameters: serde_json::Map::new(),
            last_collected: None,
            last_attempted: None,
            last_error_message: None,
        }
    }

    /// String parameter lookup.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }
}

/// Named collection of sources. Aggregation is scoped per group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsintSourceGroup {
    pub id: String,
    pub name: String,
    pub default: bool,
    pub source_ids: BTreeSet<String>,
}

/// A peer node delivering records through remote sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteNode {
    pub id: i64,
    pub name: String,
}

/// A record received from a remote node, with the node's relevance sign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub data: NewsItemData,
    #[serde(default)]
    pub relevance: i64,
}

/// A data record exported for remote sync, with the sign of its total
/// relevance across all groups.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRecord {
    pub data: NewsItemData,
    pub relevance: i64,
}

/// Reference to an aggregate or to a single member item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Target {
    Aggregate(i64),
    Item(i64),
}

/// Bulk action over a list of [`Target`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupAction {
    Group,
    Ungroup,
    Like,
    Dislike,
    Important,
    Read,
    Delete,
}

impl std::str::FromStr for GroupAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GROUP" => Ok(Self::Group),
            "UNGROUP" => Ok(Self::Ungroup),
            "LIKE" => Ok(Self::Like),
            "DISLIKE" => Ok(Self::Dislike),
            "IMPORTANT" => Ok(Self::Important),
            "READ" => Ok(Self::Read),
            "DELETE" => Ok(Self::Delete),
            other => anyhow::bail!(
                "Unknown action: '{}'. Use GROUP, UNGROUP, LIKE, DISLIKE, IMPORTANT, READ or DELETE.",
                other
            ),
        }
    }
}

/// Direction of a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Like,
    Dislike,
}

impl Vote {
    /// `+n` is a like, `-n` a dislike, zero is no vote.
    pub fn from_sign(value: i64) -> Option<Self> {
        match value.signum() {
            1 => Some(Self::Like),
            -1 => Some(Self::Dislike),
            _ => None,
        }
    }
}

/// Field changes requested by an `update` call. Flags toggle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(default)]
    pub vote: Option<Vote>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub important: bool,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

impl StatusUpdate {
    pub fn vote(vote: Vote) -> Self {
        Self {
            vote: Some(vote),
            ..Default::default()
        }
    }
}

/// Outcome of a mutating call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    /// A target aggregate is referenced by a report; nothing was changed.
    AggregateInUse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResponse {
    pub status: ActionStatus,
    /// Sources whose content changed, for downstream notification.
    pub osint_source_ids: BTreeSet<String>,
}

impl ActionResponse {
    pub fn success(osint_source_ids: BTreeSet<String>) -> Self {
        Self {
            status: ActionStatus::Success,
            osint_source_ids,
        }
    }

    pub fn in_use() -> Self {
        Self {
            status: ActionStatus::AggregateInUse,
            osint_source_ids: BTreeSet::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// Creation-date window for aggregate queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeRange {
    #[default]
    All,
    Today,
    Week,
    Month,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortOrder {
    #[default]
    DateDesc,
    DateAsc,
    RelevanceDesc,
    RelevanceAsc,
}

/// Filters for [`Store::get_by_group`](crate::store::Store::get_by_group).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateFilter {
    /// Case-insensitive substring match against the search index.
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default)]
    pub important_only: bool,
    /// Only aggregates with at least one like.
    #[serde(default)]
    pub relevant_only: bool,
    /// Only aggregates referenced by a report.
    #[serde(default)]
    pub in_report_only: bool,
    #[serde(default)]
    pub range: TimeRange,
    #[serde(default)]
    pub sort: SortOrder,
}

/// A member item as seen by one caller.
#[derive(Debug, Clone, Serialize)]
pub struct NewsItemView {
    #[serde(flatten)]
    pub item: NewsItem,
    pub news_item_data: NewsItemData,
    pub me_like: bool,
    pub me_dislike: bool,
}

/// An aggregate with its visible members, as seen by one caller.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateView {
    #[serde(flatten)]
    pub aggregate: NewsItemAggregate,
    pub news_items: Vec<NewsItemView>,
    pub me_like: bool,
    pub me_dislike: bool,
    pub in_reports_count: usize,
}

/// Row counts for `osag stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub news_item_data: usize,
    pub news_items: usize,
    pub aggregates: usize,
    pub votes: usize,
    pub latest_collected: Option<DateTime<Utc>>,
}

mod base64_payload {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| {
                base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}
