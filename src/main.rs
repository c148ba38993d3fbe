//! # osint-aggregate CLI (`osag`)
//!
//! ## Usage
//!
//! ```bash
//! osag --config ./config/osag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `osag init` | Create the database and register configured sources and groups |
//! | `osag sources` | List sources with their collection status |
//! | `osag collect <source\|all>` | Collect once |
//! | `osag run` | Collect on schedule until Ctrl-C |
//! | `osag ingest <file> --source <id>` | Ingest a record file directly |
//! | `osag list <group>` | List a group's aggregates |
//! | `osag show <id>` | Show one aggregate (or `--item`) |
//! | `osag vote <item> like\|dislike` | Vote on an item |
//! | `osag mark <id> --read --important` | Toggle flags |
//! | `osag edit <aggregate>` | Edit title, description, comments |
//! | `osag action <ACTION> <targets...>` | Bulk action (`a:<id>` / `i:<id>`) |
//! | `osag report assign\|remove` | Link aggregates to reports |
//! | `osag remote import\|export` | Exchange records with a peer node |
//! | `osag reassign <source>` | Move recent items out of the default group |
//! | `osag stats` | Row counts |
//!
//! Results are printed as JSON on stdout; logs go to stderr and follow
//! `RUST_LOG` (default `osint_aggregate=info`).

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use osint_aggregate::collector::CollectorRegistry;
use osint_aggregate::config::{self, Config};
use osint_aggregate::ingest;
use osint_aggregate::scheduler::Scheduler;
use osint_aggregate::sqlite_store::SqliteStore;
use osint_aggregate_core::auth::Identity;
use osint_aggregate_core::models::{
    AggregateFilter, GroupAction, RemoteNode, RemoteRecord, SortOrder, StatusUpdate, Target,
    TimeRange, Vote,
};
use osint_aggregate_core::store::Store;

/// osint-aggregate: collect, deduplicate and triage news items.
#[derive(Parser)]
#[command(name = "osag", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/osag.toml")]
    config: PathBuf,

    /// Act as this local user. Without it commands run as the system
    /// identity, which bypasses the ACL and cannot vote.
    #[arg(long, global = true)]
    user: Option<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and register configured sources and groups.
    ///
    /// Idempotent.
    Init,

    /// List sources with last collected/attempted times and last error.
    Sources,

    /// Collect a source once, or every source with `all`.
    Collect { source: String },

    /// Collect every source on its interval until Ctrl-C.
    Run,

    /// Ingest a JSON record file (one object or an array) for a source.
    Ingest {
        file: PathBuf,
        #[arg(long)]
        source: String,
        /// Apply manual-entry sanitizing (truncation, fallback hash).
        #[arg(long)]
        manual: bool,
    },

    /// List a group's aggregates.
    List {
        group: String,
        /// Case-insensitive substring search.
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        unread: bool,
        #[arg(long)]
        important: bool,
        /// Only aggregates with at least one like.
        #[arg(long)]
        relevant: bool,
        /// Only aggregates referenced by a report.
        #[arg(long)]
        in_report: bool,
        #[arg(long, value_enum, default_value = "all")]
        range: RangeArg,
        #[arg(long, value_enum, default_value = "date-desc")]
        sort: SortArg,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Page size; defaults to `ingest.page_size`.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show an aggregate, or an item with `--item`.
    Show {
        id: i64,
        #[arg(long)]
        item: bool,
    },

    /// Like or dislike an item. Repeating a vote withdraws it.
    Vote {
        item: i64,
        #[arg(value_enum)]
        direction: VoteArg,
        /// Vote on every permitted member of an aggregate instead.
        #[arg(long)]
        aggregate: bool,
    },

    /// Toggle read/important on an item or, with `--aggregate`, an aggregate.
    Mark {
        id: i64,
        #[arg(long)]
        read: bool,
        #[arg(long)]
        important: bool,
        #[arg(long)]
        aggregate: bool,
    },

    /// Replace an aggregate's title, description or comments.
    Edit {
        aggregate: i64,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        comments: Option<String>,
    },

    /// Bulk action over targets written as `a:<aggregate id>` or `i:<item id>`.
    Action {
        action: GroupAction,
        #[arg(required = true, value_parser = parse_target)]
        targets: Vec<Target>,
    },

    /// Link aggregates to report items.
    Report {
        #[command(subcommand)]
        action: ReportAction,
    },

    /// Exchange records with a peer node.
    Remote {
        #[command(subcommand)]
        action: RemoteAction,
    },

    /// Move a source's recent items from the default group into its groups.
    Reassign { source: String },

    /// Row counts and latest collection time.
    Stats,
}

#[derive(Subcommand)]
enum ReportAction {
    Assign { report: i64, aggregate: i64 },
    Remove { report: i64, aggregate: i64 },
}

#[derive(Subcommand)]
enum RemoteAction {
    /// Merge records from a peer node's export file into a group.
    Import {
        file: PathBuf,
        #[arg(long)]
        node_id: i64,
        #[arg(long)]
        node_name: String,
        #[arg(long)]
        group: String,
    },
    /// Print records changed since a point in time, for the given sources.
    Export {
        /// RFC 3339 timestamp.
        #[arg(long)]
        since: DateTime<Utc>,
        /// Source ids; all configured sources when omitted.
        #[arg(long = "source")]
        sources: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RangeArg {
    All,
    Today,
    Week,
    Month,
}

impl From<RangeArg> for TimeRange {
    fn from(range: RangeArg) -> Self {
        match range {
            RangeArg::All => TimeRange::All,
            RangeArg::Today => TimeRange::Today,
            RangeArg::Week => TimeRange::Week,
            RangeArg::Month => TimeRange::Month,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    DateDesc,
    DateAsc,
    RelevanceDesc,
    RelevanceAsc,
}

impl From<SortArg> for SortOrder {
    fn from(sort: SortArg) -> Self {
        match sort {
            SortArg::DateDesc => SortOrder::DateDesc,
            SortArg::DateAsc => SortOrder::DateAsc,
            SortArg::RelevanceDesc => SortOrder::RelevanceDesc,
            SortArg::RelevanceAsc => SortOrder::RelevanceAsc,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum VoteArg {
    Like,
    Dislike,
}

impl From<VoteArg> for Vote {
    fn from(vote: VoteArg) -> Self {
        match vote {
            VoteArg::Like => Vote::Like,
            VoteArg::Dislike => Vote::Dislike,
        }
    }
}

/// Parse `a:<id>` / `i:<id>` into a [`Target`].
fn parse_target(s: &str) -> Result<Target, String> {
    let (kind, id) = s
        .split_once(':')
        .ok_or_else(|| format!("invalid target '{}': expected a:<id> or i:<id>", s))?;
    let id: i64 = id
        .parse()
        .map_err(|_| format!("invalid target id in '{}'", s))?;
    match kind {
        "a" | "aggregate" => Ok(Target::Aggregate(id)),
        "i" | "item" => Ok(Target::Item(id)),
        _ => Err(format!("invalid target kind '{}': expected a or i", kind)),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_store(cfg: &Config) -> Result<Arc<SqliteStore>> {
    Ok(Arc::new(SqliteStore::open(cfg).await?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "osint_aggregate=info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let identity = cli.user.map(Identity::user).unwrap_or(Identity::System);

    let store = open_store(&cfg).await?;
    ingest::sync_registry(&*store, &cfg).await?;

    match cli.command {
        Commands::Init => {
            print_json(&serde_json::json!({
                "database": cfg.db.path,
                "sources": cfg.sources.len(),
                "groups": cfg.groups.len(),
            }))?;
        }
        Commands::Sources => {
            print_json(&store.list_sources().await?)?;
        }
        Commands::Collect { source } => {
            let registry = CollectorRegistry::with_builtins();
            let sources = if source == "all" {
                store.list_sources().await?
            } else {
                match store.get_source(&source).await? {
                    Some(s) => vec![s],
                    None => bail!("unknown source '{}'", source),
                }
            };
            let reports = ingest::collect_all(&*store, &registry, &sources).await;
            print_json(&reports)?;
        }
        Commands::Run => {
            let mut scheduler = Scheduler::new(store.clone(), Arc::new(CollectorRegistry::with_builtins()));
            for source_cfg in &cfg.sources {
                let source = store
                    .get_source(&source_cfg.id)
                    .await?
                    .unwrap_or_else(|| source_cfg.to_source());
                scheduler.schedule(source, source_cfg.interval(&cfg.ingest));
            }
            tracing::info!(sources = scheduler.scheduled().len(), "scheduler running, Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            scheduler.shutdown().await;
            tracing::info!("scheduler stopped");
        }
        Commands::Ingest {
            file,
            source,
            manual,
        } => {
            let touched = ingest::ingest_file(&*store, &file, &source, manual).await?;
            print_json(&serde_json::json!({ "osint_source_ids": touched }))?;
        }
        Commands::List {
            group,
            search,
            unread,
            important,
            relevant,
            in_report,
            range,
            sort,
            offset,
            limit,
        } => {
            let filter = AggregateFilter {
                search,
                unread_only: unread,
                important_only: important,
                relevant_only: relevant,
                in_report_only: in_report,
                range: range.into(),
                sort: sort.into(),
            };
            let limit = limit.unwrap_or(cfg.ingest.page_size);
            let (items, total) = store
                .get_by_group(&group, &filter, offset, limit, &identity)
                .await?;
            print_json(&serde_json::json!({ "total_count": total, "items": items }))?;
        }
        Commands::Show { id, item } => {
            if item {
                match store.get_item(id, &identity).await? {
                    Some(view) => print_json(&view)?,
                    None => bail!("item {} not found", id),
                }
            } else {
                match store.get_aggregate(id, &identity).await? {
                    Some(view) => print_json(&view)?,
                    None => bail!("aggregate {} not found", id),
                }
            }
        }
        Commands::Vote {
            item,
            direction,
            aggregate,
        } => {
            if identity.voter().is_none() {
                bail!("voting needs a local user: pass --user <id>");
            }
            let update = StatusUpdate::vote(direction.into());
            let response = if aggregate {
                store.update_aggregate(item, &update, &identity).await?
            } else {
                store.update_item(item, &update, &identity).await?
            };
            print_json(&response)?;
        }
        Commands::Mark {
            id,
            read,
            important,
            aggregate,
        } => {
            let update = StatusUpdate {
                read,
                important,
                ..Default::default()
            };
            let response = if aggregate {
                store.update_aggregate(id, &update, &identity).await?
            } else {
                store.update_item(id, &update, &identity).await?
            };
            print_json(&response)?;
        }
        Commands::Edit {
            aggregate,
            title,
            description,
            comments,
        } => {
            let update = StatusUpdate {
                title,
                description,
                comments,
                ..Default::default()
            };
            print_json(&store.update_aggregate(aggregate, &update, &identity).await?)?;
        }
        Commands::Action { action, targets } => {
            print_json(&store.group_action(action, &targets, &identity).await?)?;
        }
        Commands::Report { action } => match action {
            ReportAction::Assign { report, aggregate } => {
                store.assign_to_report(report, aggregate).await?;
                print_json(&serde_json::json!({ "report_item_id": report, "aggregate_id": aggregate }))?;
            }
            ReportAction::Remove { report, aggregate } => {
                store.remove_from_report(report, aggregate).await?;
                print_json(&serde_json::json!({ "report_item_id": report, "aggregate_id": aggregate }))?;
            }
        },
        Commands::Remote { action } => match action {
            RemoteAction::Import {
                file,
                node_id,
                node_name,
                group,
            } => {
                let content = std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                let records: Vec<RemoteRecord> = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse {}", file.display()))?;
                let node = RemoteNode {
                    id: node_id,
                    name: node_name,
                };
                let created = store.add_remote_items(&node, &group, records).await?;
                print_json(&serde_json::json!({ "created": created }))?;
            }
            RemoteAction::Export { since, sources } => {
                let source_ids: BTreeSet<String> = if sources.is_empty() {
                    cfg.sources.iter().map(|s| s.id.clone()).collect()
                } else {
                    sources.into_iter().collect()
                };
                let (records, synced_at) = store.get_for_sync(since, &source_ids).await?;
                print_json(&serde_json::json!({ "synced_at": synced_at, "records": records }))?;
            }
        },
        Commands::Reassign { source } => {
            let default_group = match cfg.default_group() {
                Some(group) => group.id.clone(),
                None => bail!("no default group configured"),
            };
            let moved = store.reassign_to_new_groups(&source, &default_group).await?;
            print_json(&serde_json::json!({ "moved": moved }))?;
        }
        Commands::Stats => {
            print_json(&store.stats().await?)?;
        }
    }

    Ok(())
}
