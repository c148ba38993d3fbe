//! Collection pipeline.
//!
//! Coordinates one collection run: collector → normalization → dedup and
//! per-group fan-out in the store → attempt bookkeeping on the source.
//! A failing source records its error and never stops the others.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Result};
use chrono::Utc;
use serde::Serialize;

use osint_aggregate_core::models::{NewsItemData, OsintSource};
use osint_aggregate_core::normalize::{normalize, normalize_manual};
use osint_aggregate_core::store::Store;

use crate::collector::CollectorRegistry;
use crate::collector_json::read_records;
use crate::config::Config;

/// Outcome of one source's collection run.
#[derive(Debug, Clone, Serialize)]
pub struct CollectReport {
    pub source_id: String,
    pub fetched: usize,
    /// Whether at least one record was new.
    pub stored_new: bool,
    pub error: Option<String>,
}

/// Write the configured sources and groups into the store.
///
/// Sources go first so group memberships reference existing rows.
pub async fn sync_registry(store: &dyn Store, config: &Config) -> Result<()> {
    for source in &config.sources {
        store.upsert_source(&source.to_source()).await?;
    }
    for group in &config.groups {
        store.upsert_group(&group.to_group()).await?;
    }
    tracing::debug!(
        sources = config.sources.len(),
        groups = config.groups.len(),
        "registry synced"
    );
    Ok(())
}

/// Collect one source and store what it produced.
///
/// Collector and store failures are recorded on the source and reported
/// in the returned [`CollectReport`]. Only a failure to record the attempt
/// itself is returned as an error.
pub async fn collect_source(
    store: &dyn Store,
    registry: &CollectorRegistry,
    source: &OsintSource,
) -> Result<CollectReport> {
    let mut report = CollectReport {
        source_id: source.id.clone(),
        fetched: 0,
        stored_new: false,
        error: None,
    };

    let outcome = async {
        let collector = registry.for_source(source)?;
        let records = collector.collect(source).await?;
        report.fetched = records.len();

        let now = Utc::now();
        let batch: Vec<NewsItemData> = records
            .into_iter()
            .map(|record| normalize(record, Some(&source.id), now))
            .collect();
        let touched = store.add_items(batch).await?;
        Ok::<bool, anyhow::Error>(touched.contains(&source.id))
    }
    .await;

    match outcome {
        Ok(stored_new) => {
            report.stored_new = stored_new;
            store.record_attempt(&source.id, None).await?;
            tracing::info!(
                source = %source.id,
                fetched = report.fetched,
                stored_new,
                "collection finished"
            );
        }
        Err(e) => {
            let message = format!("{:#}", e);
            tracing::warn!(source = %source.id, error = %message, "collection failed");
            store.record_attempt(&source.id, Some(&message)).await?;
            report.error = Some(message);
        }
    }
    Ok(report)
}

/// Collect every given source in order.
pub async fn collect_all(
    store: &dyn Store,
    registry: &CollectorRegistry,
    sources: &[OsintSource],
) -> Vec<CollectReport> {
    let mut reports = Vec::with_capacity(sources.len());
    for source in sources {
        match collect_source(store, registry, source).await {
            Ok(report) => reports.push(report),
            Err(e) => {
                tracing::error!(source = %source.id, error = %e, "could not record collection attempt");
                reports.push(CollectReport {
                    source_id: source.id.clone(),
                    fetched: 0,
                    stored_new: false,
                    error: Some(format!("{:#}", e)),
                });
            }
        }
    }
    reports
}

/// Ingest a record file directly, bypassing the collector.
///
/// With `manual`, titles and reviews are truncated and HTML is stripped
/// the way hand-entered items are. Returns the sources that received new
/// content.
pub async fn ingest_file(
    store: &dyn Store,
    path: &Path,
    source_id: &str,
    manual: bool,
) -> Result<BTreeSet<String>> {
    if store.get_source(source_id).await?.is_none() {
        bail!("unknown source '{}'", source_id);
    }
    let records = read_records(path)?;
    let now = Utc::now();
    let batch: Vec<NewsItemData> = records
        .into_iter()
        .map(|record| {
            if manual {
                normalize_manual(record, Some(source_id), now)
            } else {
                normalize(record, Some(source_id), now)
            }
        })
        .collect();
    let fetched = batch.len();
    let touched = store.add_items(batch).await?;
    tracing::info!(source = source_id, fetched, manual, "file ingested");
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use osint_aggregate_core::auth::Identity;
    use osint_aggregate_core::models::{AggregateFilter, OsintSourceGroup, RawRecord};
    use osint_aggregate_core::store::memory::InMemoryStore;

    use crate::collector::Collector;

    struct Fixed(Vec<&'static str>);

    #[async_trait]
    impl Collector for Fixed {
        fn collector_type(&self) -> &str {
            "fixed"
        }

        async fn collect(&self, _source: &OsintSource) -> Result<Vec<RawRecord>> {
            Ok(self
                .0
                .iter()
                .map(|t| RawRecord {
                    title: Some(t.to_string()),
                    ..Default::default()
                })
                .collect())
        }
    }

    struct Broken;

    #[async_trait]
    impl Collector for Broken {
        fn collector_type(&self) -> &str {
            "broken"
        }

        async fn collect(&self, _source: &OsintSource) -> Result<Vec<RawRecord>> {
            bail!("feed unreachable")
        }
    }

    async fn setup() -> (InMemoryStore, CollectorRegistry) {
        let store = InMemoryStore::new();
        store.upsert_source(&OsintSource::new("ok", "Ok", "fixed")).await.unwrap();
        store.upsert_source(&OsintSource::new("bad", "Bad", "broken")).await.unwrap();
        store
            .upsert_group(&OsintSourceGroup {
                id: "default".into(),
                name: "Default".into(),
                default: true,
                source_ids: BTreeSet::new(),
            })
            .await
            .unwrap();
        let mut registry = CollectorRegistry::new();
        registry.register(Box::new(Fixed(vec!["a", "b", "a"])));
        registry.register(Box::new(Broken));
        (store, registry)
    }

    #[tokio::test]
    async fn test_collect_dedups_and_records_attempt() {
        let (store, registry) = setup().await;
        let source = store.get_source("ok").await.unwrap().unwrap();

        let report = collect_source(&store, &registry, &source).await.unwrap();
        assert_eq!(report.fetched, 3);
        assert!(report.stored_new);
        assert!(report.error.is_none());

        let (page, total) = store
            .get_by_group("default", &AggregateFilter::default(), 0, 10, &Identity::System)
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 2);

        let source = store.get_source("ok").await.unwrap().unwrap();
        assert!(source.last_collected.is_some());
        assert!(source.last_attempted.is_some());

        let again = collect_source(&store, &registry, &source).await.unwrap();
        assert!(!again.stored_new);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_others_continue() {
        let (store, registry) = setup().await;
        let sources = store.list_sources().await.unwrap();

        let reports = collect_all(&store, &registry, &sources).await;
        assert_eq!(reports.len(), 2);
        let bad = reports.iter().find(|r| r.source_id == "bad").unwrap();
        assert!(bad.error.as_deref().unwrap().contains("feed unreachable"));
        let ok = reports.iter().find(|r| r.source_id == "ok").unwrap();
        assert!(ok.error.is_none());

        let stored = store.get_source("bad").await.unwrap().unwrap();
        assert!(stored.last_error_message.unwrap().contains("feed unreachable"));
        assert!(stored.last_collected.is_none());
    }

    #[tokio::test]
    async fn test_ingest_file_manual() {
        let (store, _) = setup().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manual.json");
        let long_title = "x".repeat(400);
        std::fs::write(
            &path,
            format!(r#"{{"title": "{}", "content": "<b>bold</b> text"}}"#, long_title),
        )
        .unwrap();

        let touched = ingest_file(&store, &path, "ok", true).await.unwrap();
        assert!(touched.contains("ok"));

        let (page, _) = store
            .get_by_group("default", &AggregateFilter::default(), 0, 10, &Identity::System)
            .await
            .unwrap();
        let data = &page[0].news_items[0].news_item_data;
        assert!(data.title.starts_with(&"x".repeat(200)));
        assert!(data.title.ends_with("[...]"));
        assert!(data.title.chars().count() < 400);
        assert!(!data.content.contains("<b>"));

        assert!(ingest_file(&store, &path, "ghost", false).await.is_err());
    }
}
