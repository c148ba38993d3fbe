//! Collector adapters.
//!
//! A [`Collector`] turns one configured [`OsintSource`] into a batch of
//! [`RawRecord`]s. The ingest pipeline normalizes the batch and hands it to
//! the store, so adapters never deal with hashing or grouping.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │      CollectorRegistry       │
//! │  ┌────────┐ ┌────────┐ ┌───┐ │
//! │  │ json   │ │ manual │ │...│ │
//! │  └────────┘ └────────┘ └───┘ │
//! └──────────────┬───────────────┘
//!                ▼
//!      collect_source() → Store::add_items
//! ```

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use osint_aggregate_core::models::{OsintSource, RawRecord};

use crate::collector_json::JsonDropCollector;

/// Collector types accepted in `[[sources]]`.
pub const KNOWN_TYPES: &[&str] = &[JsonDropCollector::TYPE, ManualCollector::TYPE];

/// A source adapter that produces raw records.
///
/// # Example
///
/// ```rust
/// use anyhow::Result;
/// use async_trait::async_trait;
/// use osint_aggregate::collector::Collector;
/// use osint_aggregate_core::models::{OsintSource, RawRecord};
///
/// pub struct StaticCollector;
///
/// #[async_trait]
/// impl Collector for StaticCollector {
///     fn collector_type(&self) -> &str { "static" }
///
///     async fn collect(&self, _source: &OsintSource) -> Result<Vec<RawRecord>> {
///         Ok(vec![RawRecord { title: Some("hello".into()), ..Default::default() }])
///     }
/// }
/// ```
#[async_trait]
pub trait Collector: Send + Sync {
    /// The `type` value in `[[sources]]` this collector handles.
    fn collector_type(&self) -> &str;

    /// Fetch the current records of `source`.
    ///
    /// An error marks the run as failed; the message is stored on the
    /// source as `last_error_message`.
    async fn collect(&self, source: &OsintSource) -> Result<Vec<RawRecord>>;
}

/// Sources whose items are entered by hand through `osag ingest --manual`.
/// Scheduled runs produce nothing.
pub struct ManualCollector;

impl ManualCollector {
    pub const TYPE: &'static str = "manual";
}

#[async_trait]
impl Collector for ManualCollector {
    fn collector_type(&self) -> &str {
        Self::TYPE
    }

    async fn collect(&self, _source: &OsintSource) -> Result<Vec<RawRecord>> {
        Ok(Vec::new())
    }
}

/// Collectors keyed by type.
#[derive(Default)]
pub struct CollectorRegistry {
    collectors: HashMap<String, Box<dyn Collector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in collector.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(JsonDropCollector));
        registry.register(Box::new(ManualCollector));
        registry
    }

    /// Register a collector, replacing any previous one of the same type.
    pub fn register(&mut self, collector: Box<dyn Collector>) {
        self.collectors
            .insert(collector.collector_type().to_string(), collector);
    }

    pub fn get(&self, collector_type: &str) -> Option<&dyn Collector> {
        self.collectors.get(collector_type).map(|c| c.as_ref())
    }

    /// The collector for `source`, or an error naming the missing type.
    pub fn for_source(&self, source: &OsintSource) -> Result<&dyn Collector> {
        self.get(&source.collector_type).ok_or_else(|| {
            anyhow!(
                "no collector registered for type '{}' (source '{}')",
                source.collector_type,
                source.id
            )
        })
    }

    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.collectors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
