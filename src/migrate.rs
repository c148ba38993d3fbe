//! Idempotent schema creation.
//!
//! Timestamps are stored as UTC milliseconds since the epoch. The UNIQUE
//! constraint on `news_item_data.hash` backs the dedup check, so two
//! ingestions racing on the same content cannot both insert it.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS osint_source (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        collector_type TEXT NOT NULL,
        parameters_json TEXT NOT NULL DEFAULT '{}',
        last_collected INTEGER,
        last_attempted INTEGER,
        last_error_message TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS osint_source_group (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        is_default INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS osint_source_group_osint_source (
        osint_source_group_id TEXT NOT NULL,
        osint_source_id TEXT NOT NULL,
        PRIMARY KEY (osint_source_group_id, osint_source_id),
        FOREIGN KEY (osint_source_group_id) REFERENCES osint_source_group(id) ON DELETE CASCADE,
        FOREIGN KEY (osint_source_id) REFERENCES osint_source(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS news_item_data (
        id TEXT PRIMARY KEY,
        hash TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        review TEXT NOT NULL,
        author TEXT NOT NULL,
        source TEXT NOT NULL,
        link TEXT NOT NULL,
        language TEXT,
        content TEXT NOT NULL,
        collected INTEGER NOT NULL,
        published TEXT NOT NULL,
        updated INTEGER NOT NULL,
        osint_source_id TEXT,
        remote_source TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS news_item_aggregate (
        id INTEGER PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        created INTEGER NOT NULL,
        read INTEGER NOT NULL DEFAULT 0,
        important INTEGER NOT NULL DEFAULT 0,
        likes INTEGER NOT NULL DEFAULT 0,
        dislikes INTEGER NOT NULL DEFAULT 0,
        relevance INTEGER NOT NULL DEFAULT 0,
        comments TEXT NOT NULL DEFAULT '',
        osint_source_group_id TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS news_item_attribute (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        news_item_data_id TEXT,
        news_item_aggregate_id INTEGER,
        position INTEGER NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        binary_mime_type TEXT,
        binary_data BLOB,
        created INTEGER NOT NULL,
        remote_node_id INTEGER,
        remote_user TEXT,
        FOREIGN KEY (news_item_data_id) REFERENCES news_item_data(id) ON DELETE CASCADE,
        FOREIGN KEY (news_item_aggregate_id) REFERENCES news_item_aggregate(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS news_item (
        id INTEGER PRIMARY KEY,
        read INTEGER NOT NULL DEFAULT 0,
        important INTEGER NOT NULL DEFAULT 0,
        likes INTEGER NOT NULL DEFAULT 0,
        dislikes INTEGER NOT NULL DEFAULT 0,
        relevance INTEGER NOT NULL DEFAULT 0,
        news_item_data_id TEXT NOT NULL,
        news_item_aggregate_id INTEGER NOT NULL,
        FOREIGN KEY (news_item_data_id) REFERENCES news_item_data(id),
        FOREIGN KEY (news_item_aggregate_id) REFERENCES news_item_aggregate(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS news_item_vote (
        news_item_id INTEGER NOT NULL,
        voter_kind TEXT NOT NULL,
        voter_id INTEGER NOT NULL,
        remote_user TEXT,
        liked INTEGER NOT NULL DEFAULT 0,
        disliked INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (news_item_id, voter_kind, voter_id),
        FOREIGN KEY (news_item_id) REFERENCES news_item(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS news_item_aggregate_search_index (
        news_item_aggregate_id INTEGER PRIMARY KEY,
        data TEXT NOT NULL,
        FOREIGN KEY (news_item_aggregate_id) REFERENCES news_item_aggregate(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS report_item_news_item_aggregate (
        report_item_id INTEGER NOT NULL,
        news_item_aggregate_id INTEGER NOT NULL,
        PRIMARY KEY (report_item_id, news_item_aggregate_id),
        FOREIGN KEY (news_item_aggregate_id) REFERENCES news_item_aggregate(id) ON DELETE CASCADE
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_news_item_aggregate ON news_item(news_item_aggregate_id)",
    "CREATE INDEX IF NOT EXISTS idx_news_item_data ON news_item(news_item_data_id)",
    "CREATE INDEX IF NOT EXISTS idx_aggregate_group_created ON news_item_aggregate(osint_source_group_id, created DESC)",
    "CREATE INDEX IF NOT EXISTS idx_data_source_updated ON news_item_data(osint_source_id, updated)",
    "CREATE INDEX IF NOT EXISTS idx_attribute_data ON news_item_attribute(news_item_data_id)",
    "CREATE INDEX IF NOT EXISTS idx_attribute_aggregate ON news_item_attribute(news_item_aggregate_id)",
    "CREATE INDEX IF NOT EXISTS idx_report_aggregate ON report_item_news_item_aggregate(news_item_aggregate_id)",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index that does not exist yet.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    for statement in TABLES.iter().chain(INDEXES) {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
