//! Drop-folder collector.
//!
//! Reads every file under `parameters.path` matching `parameters.glob`
//! (default `*.json`, matched against the path relative to the folder).
//! A file holds either one record object or an array of them, in the
//! [`RawRecord`] shape. Files are read in path order.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use walkdir::WalkDir;

use osint_aggregate_core::models::{OsintSource, RawRecord};

use crate::collector::Collector;

const DEFAULT_GLOB: &str = "*.json";

pub struct JsonDropCollector;

impl JsonDropCollector {
    pub const TYPE: &'static str = "json";
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DropFile {
    Many(Vec<RawRecord>),
    One(Box<RawRecord>),
}

#[async_trait]
impl Collector for JsonDropCollector {
    fn collector_type(&self) -> &str {
        Self::TYPE
    }

    async fn collect(&self, source: &OsintSource) -> Result<Vec<RawRecord>> {
        let root = match source.parameter("path") {
            Some(path) => PathBuf::from(path),
            None => bail!("source '{}': missing parameter 'path'", source.id),
        };
        let pattern = source.parameter("glob").unwrap_or(DEFAULT_GLOB).to_string();
        tokio::task::spawn_blocking(move || read_drop_folder(&root, &pattern)).await?
    }
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Parse one record object or an array of them.
pub fn parse_records(content: &str) -> Result<Vec<RawRecord>> {
    Ok(match serde_json::from_str(content)? {
        DropFile::Many(batch) => batch,
        DropFile::One(record) => vec![*record],
    })
}

/// Read and parse a single record file.
pub fn read_records(path: &Path) -> Result<Vec<RawRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_records(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn read_drop_folder(root: &Path, pattern: &str) -> Result<Vec<RawRecord>> {
    if !root.is_dir() {
        bail!("drop folder does not exist: {}", root.display());
    }
    let include = build_globset(&[pattern])?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if include.is_match(relative) {
            files.push(entry.into_path());
        }
    }
    files.sort();

    let mut records = Vec::new();
    for path in &files {
        records.extend(read_records(path)?);
    }
    tracing::debug!(root = %root.display(), files = files.len(), records = records.len(), "read drop folder");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(path: &Path, glob: Option<&str>) -> OsintSource {
        let mut source = OsintSource::new("drop", "Drop", JsonDropCollector::TYPE);
        source
            .parameters
            .insert("path".into(), path.display().to_string().into());
        if let Some(glob) = glob {
            source.parameters.insert("glob".into(), glob.into());
        }
        source
    }

    #[tokio::test]
    async fn test_reads_arrays_and_single_objects() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            r#"[{"title": "one", "link": "https://x/1"}, {"title": "two"}]"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("b.json"), r#"{"title": "three", "author": "ann"}"#).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let records = JsonDropCollector
            .collect(&source(dir.path(), None))
            .await
            .unwrap();
        let titles: Vec<_> = records.iter().map(|r| r.title.clone().unwrap()).collect();
        assert_eq!(titles, vec!["one", "two", "three"]);
        assert_eq!(records[2].author.as_deref(), Some("ann"));
    }

    #[tokio::test]
    async fn test_custom_glob_and_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("feed")).unwrap();
        std::fs::write(dir.path().join("feed/x.items"), r#"[{"title": "nested"}]"#).unwrap();
        std::fs::write(dir.path().join("top.json"), r#"[{"title": "top"}]"#).unwrap();

        let records = JsonDropCollector
            .collect(&source(dir.path(), Some("**/*.items")))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title.as_deref(), Some("nested"));
    }

    #[tokio::test]
    async fn test_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = OsintSource::new("drop", "Drop", JsonDropCollector::TYPE);
        assert!(JsonDropCollector.collect(&missing).await.is_err());

        assert!(JsonDropCollector
            .collect(&source(&dir.path().join("nope"), None))
            .await
            .is_err());

        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let err = JsonDropCollector
            .collect(&source(dir.path(), None))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("bad.json"));
    }
}
