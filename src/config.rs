//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/osag.sqlite"
//!
//! [ingest]
//! default_interval_secs = 3600
//!
//! [[groups]]
//! id = "default"
//! name = "Default"
//! default = true
//! sources = ["drop"]
//!
//! [[sources]]
//! id = "drop"
//! name = "JSON drop folder"
//! type = "json"
//! interval_secs = 600
//! parameters = { path = "./drop", glob = "*.json" }
//!
//! [[acl]]
//! source_id = "drop"
//! users = [1]
//! see = true
//! access = true
//! modify = true
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use osint_aggregate_core::auth::{AllowAll, Authorizer, SourceAcl, SourceAclEntry};
use osint_aggregate_core::models::{OsintSource, OsintSourceGroup};

use crate::collector::KNOWN_TYPES;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub acl: Vec<SourceAclEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,
}

fn default_busy_timeout() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Collection interval for sources that do not set their own.
    #[serde(default = "default_interval")]
    pub default_interval_secs: u64,
    /// Page size for `osag list`.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: default_interval(),
            page_size: default_page_size(),
        }
    }
}

fn default_interval() -> u64 {
    3600
}
fn default_page_size() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct GroupConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl GroupConfig {
    pub fn to_group(&self) -> OsintSourceGroup {
        OsintSourceGroup {
            id: self.id.clone(),
            name: self.name.clone(),
            default: self.default,
            source_ids: self.sources.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub collector_type: String,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl SourceConfig {
    pub fn to_source(&self) -> OsintSource {
        let mut source = OsintSource::new(&self.id, &self.name, &self.collector_type);
        source.parameters = self.parameters.clone();
        source
    }

    pub fn interval(&self, ingest: &IngestConfig) -> Duration {
        Duration::from_secs(self.interval_secs.unwrap_or(ingest.default_interval_secs))
    }
}

impl Config {
    /// The authorizer implied by the `[[acl]]` entries.
    pub fn authorizer(&self) -> Arc<dyn Authorizer> {
        if self.acl.is_empty() {
            Arc::new(AllowAll)
        } else {
            Arc::new(SourceAcl::new(self.acl.clone()))
        }
    }

    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }

    pub fn default_group(&self) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.default)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.ingest.default_interval_secs == 0 {
        bail!("ingest.default_interval_secs must be > 0");
    }
    if config.ingest.page_size == 0 {
        bail!("ingest.page_size must be > 0");
    }

    let mut source_ids = HashSet::new();
    for source in &config.sources {
        if source.id.trim().is_empty() {
            bail!("sources: id must not be empty");
        }
        if !source_ids.insert(source.id.as_str()) {
            bail!("sources: duplicate id '{}'", source.id);
        }
        if !KNOWN_TYPES.contains(&source.collector_type.as_str()) {
            bail!(
                "sources.{}: unknown collector type '{}'. Must be one of: {}",
                source.id,
                source.collector_type,
                KNOWN_TYPES.join(", ")
            );
        }
        if source.interval_secs == Some(0) {
            bail!("sources.{}: interval_secs must be > 0", source.id);
        }
    }

    let mut group_ids = HashSet::new();
    for group in &config.groups {
        if !group_ids.insert(group.id.as_str()) {
            bail!("groups: duplicate id '{}'", group.id);
        }
        for source in &group.sources {
            if !source_ids.contains(source.as_str()) {
                bail!("groups.{}: unknown source '{}'", group.id, source);
            }
        }
    }
    if config.groups.iter().filter(|g| g.default).count() > 1 {
        bail!("groups: at most one group may be the default");
    }

    for entry in &config.acl {
        if !source_ids.contains(entry.source_id.as_str()) {
            bail!("acl: unknown source '{}'", entry.source_id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    const BASE: &str = r#"
        [db]
        path = "./data/osag.sqlite"

        [[groups]]
        id = "default"
        name = "Default"
        default = true
        sources = ["drop"]

        [[sources]]
        id = "drop"
        name = "Drop"
        type = "json"
        parameters = { path = "./drop" }
    "#;

    #[test]
    fn test_minimal_config() {
        let config = parse(BASE).unwrap();
        assert_eq!(config.db.busy_timeout_secs, 5);
        assert_eq!(config.ingest.default_interval_secs, 3600);
        let source = config.source("drop").unwrap().to_source();
        assert_eq!(source.parameter("path"), Some("./drop"));
        assert_eq!(
            config.sources[0].interval(&config.ingest),
            Duration::from_secs(3600)
        );
        assert_eq!(config.default_group().unwrap().id, "default");
        assert!(config.groups[0].to_group().source_ids.contains("drop"));
    }

    #[test]
    fn test_unknown_collector_type() {
        let bad = BASE.replace("type = \"json\"", "type = \"carrier-pigeon\"");
        let err = parse(&bad).unwrap_err().to_string();
        assert!(err.contains("carrier-pigeon"));
    }

    #[test]
    fn test_group_references_unknown_source() {
        let bad = BASE.replace("sources = [\"drop\"]", "sources = [\"nope\"]");
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn test_two_default_groups() {
        let bad = format!(
            "{BASE}\n[[groups]]\nid = \"other\"\nname = \"Other\"\ndefault = true\n"
        );
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn test_zero_interval() {
        let bad = BASE.replace("type = \"json\"", "type = \"json\"\ninterval_secs = 0");
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn test_acl_entries() {
        let with_acl = format!(
            "{BASE}\n[[acl]]\nsource_id = \"drop\"\nusers = [1]\nsee = true\n"
        );
        let config = parse(&with_acl).unwrap();
        assert_eq!(config.acl.len(), 1);
        assert!(config.acl[0].see && !config.acl[0].modify);

        let bad = with_acl.replace("source_id = \"drop\"", "source_id = \"ghost\"");
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("osag.toml");
        std::fs::write(&path, BASE).unwrap();
        assert!(load_config(&path).is_ok());
        assert!(load_config(&dir.path().join("missing.toml")).is_err());
    }
}
