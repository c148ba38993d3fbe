//! Contract violations raised inside the ledger.
//!
//! Referencing an id that does not exist is a caller bug (ids are validated
//! upstream), so these surface as errors rather than as [`ActionStatus`]
//! values. Rejections such as `aggregate_in_use` are not errors.
//!
//! [`ActionStatus`]: crate::models::ActionStatus

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("news item {0} not found")]
    ItemNotFound(i64),

    #[error("news item aggregate {0} not found")]
    AggregateNotFound(i64),

    #[error("news item data {0} not found")]
    DataNotFound(String),

    #[error("OSINT source {0} not found")]
    SourceNotFound(String),

    #[error("OSINT source group {0} not found")]
    GroupNotFound(String),
}
