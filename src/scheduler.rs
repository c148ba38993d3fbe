//! Periodic collection.
//!
//! One tokio task per source. Each task collects immediately, then once per
//! interval; a missed tick is skipped rather than bunched up. Dropping the
//! scheduler aborts every task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use osint_aggregate_core::models::OsintSource;
use osint_aggregate_core::store::Store;

use crate::collector::CollectorRegistry;
use crate::ingest::collect_source;

pub struct Scheduler {
    store: Arc<dyn Store>,
    registry: Arc<CollectorRegistry>,
    tasks: HashMap<String, JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, registry: Arc<CollectorRegistry>) -> Self {
        Self {
            store,
            registry,
            tasks: HashMap::new(),
        }
    }

    /// Start collecting `source` every `every`, replacing an existing schedule.
    pub fn schedule(&mut self, source: OsintSource, every: Duration) {
        self.cancel(&source.id);
        tracing::info!(source = %source.id, interval_secs = every.as_secs(), "scheduling collection");

        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let source_id = source.id.clone();
        let handle = tokio::spawn(async move {
            let mut timer = interval(every);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                if let Err(e) = collect_source(store.as_ref(), &registry, &source).await {
                    tracing::error!(source = %source.id, error = %e, "scheduled collection failed");
                }
            }
        });
        self.tasks.insert(source_id, handle);
    }

    /// Stop a source's schedule. Returns whether one was running.
    pub fn cancel(&mut self, source_id: &str) -> bool {
        match self.tasks.remove(source_id) {
            Some(handle) => {
                handle.abort();
                tracing::debug!(source = source_id, "collection cancelled");
                true
            }
            None => false,
        }
    }

    pub fn scheduled(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Abort every task and wait for them to wind down.
    pub async fn shutdown(mut self) {
        let tasks = std::mem::take(&mut self.tasks);
        for handle in tasks.values() {
            handle.abort();
        }
        for (source_id, handle) in tasks {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(source = %source_id, error = %e, "collection task panicked");
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for handle in self.tasks.values() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;
    use osint_aggregate_core::models::RawRecord;
    use osint_aggregate_core::store::memory::InMemoryStore;

    use crate::collector::Collector;

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Collector for Counting {
        fn collector_type(&self) -> &str {
            "counting"
        }

        async fn collect(&self, _source: &OsintSource) -> Result<Vec<RawRecord>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_schedule_runs_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = CollectorRegistry::new();
        registry.register(Box::new(Counting(Arc::clone(&runs))));

        let store = Arc::new(InMemoryStore::new());
        let source = OsintSource::new("tick", "Tick", "counting");
        store.upsert_source(&source).await.unwrap();

        let mut scheduler = Scheduler::new(store.clone(), Arc::new(registry));
        scheduler.schedule(source, Duration::from_millis(20));
        assert_eq!(scheduler.scheduled(), vec!["tick"]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert!(store.get_source("tick").await.unwrap().unwrap().last_attempted.is_some());

        assert!(scheduler.cancel("tick"));
        assert!(!scheduler.cancel("tick"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_cancel = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_cancel);

        scheduler.shutdown().await;
    }
}
