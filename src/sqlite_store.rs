//! SQLite-backed [`Store`] implementation.
//!
//! Every call runs one transaction. Mutating calls load the working set they
//! touch (aggregates, their members, data, votes, index rows, report links)
//! into a [`Ledger`], run the same ledger operation the in-memory backend
//! runs, and write the ledger's journal back before committing. Writers are
//! serialized by an in-process mutex, so the roll-up and zero-member cleanup
//! of one call never interleave with another call.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;

use osint_aggregate_core::auth::{AllowAll, Authorizer, Identity};
use osint_aggregate_core::error::LedgerError;
use osint_aggregate_core::ledger::{range_start, Journal, Ledger, REASSIGN_WINDOW_DAYS};
use osint_aggregate_core::models::{
    ActionResponse, AggregateFilter, AggregateView, GroupAction, NewsItem, NewsItemAggregate,
    NewsItemAttribute, NewsItemData, NewsItemView, NewsItemVote, OsintSource, OsintSourceGroup,
    RemoteNode, RemoteRecord, SortOrder, StatusUpdate, StoreStats, SyncRecord, Target, Voter,
};
use osint_aggregate_core::store::Store;

use crate::config::Config;
use crate::{db, migrate};

/// Bind parameters per `IN (...)` statement.
const IN_CHUNK: usize = 500;

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    writer: Mutex<()>,
    auth: Arc<dyn Authorizer>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_authorizer(pool, Arc::new(AllowAll))
    }

    pub fn with_authorizer(pool: SqlitePool, auth: Arc<dyn Authorizer>) -> Self {
        Self {
            pool,
            writer: Mutex::new(()),
            auth,
        }
    }

    /// Connect, create missing tables, and install the configured ACL.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self::with_authorizer(pool, config.authorizer()))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ── Row mapping ─────────────────────────────────────────────────────────

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn voter_parts(voter: Voter) -> (&'static str, i64) {
    match voter {
        Voter::User(id) => ("user", id),
        Voter::Remote(id) => ("remote", id),
    }
}

fn voter_from_parts(kind: &str, id: i64) -> Result<Voter> {
    match kind {
        "user" => Ok(Voter::User(id)),
        "remote" => Ok(Voter::Remote(id)),
        other => bail!("unknown voter kind '{}'", other),
    }
}

fn data_from_row(row: &SqliteRow) -> Result<NewsItemData> {
    Ok(NewsItemData {
        id: row.try_get("id")?,
        hash: row.try_get("hash")?,
        title: row.try_get("title")?,
        review: row.try_get("review")?,
        author: row.try_get("author")?,
        source: row.try_get("source")?,
        link: row.try_get("link")?,
        language: row.try_get("language")?,
        content: row.try_get("content")?,
        collected: from_millis(row.try_get("collected")?),
        published: row.try_get("published")?,
        updated: from_millis(row.try_get("updated")?),
        osint_source_id: row.try_get("osint_source_id")?,
        remote_source: row.try_get("remote_source")?,
        attributes: Vec::new(),
    })
}

fn aggregate_from_row(row: &SqliteRow) -> Result<NewsItemAggregate> {
    Ok(NewsItemAggregate {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        created: from_millis(row.try_get("created")?),
        read: row.try_get("read")?,
        important: row.try_get("important")?,
        likes: row.try_get("likes")?,
        dislikes: row.try_get("dislikes")?,
        relevance: row.try_get("relevance")?,
        comments: row.try_get("comments")?,
        osint_source_group_id: row.try_get("osint_source_group_id")?,
        attributes: Vec::new(),
    })
}

fn item_from_row(row: &SqliteRow) -> Result<NewsItem> {
    Ok(NewsItem {
        id: row.try_get("id")?,
        read: row.try_get("read")?,
        important: row.try_get("important")?,
        likes: row.try_get("likes")?,
        dislikes: row.try_get("dislikes")?,
        relevance: row.try_get("relevance")?,
        news_item_data_id: row.try_get("news_item_data_id")?,
        news_item_aggregate_id: row.try_get("news_item_aggregate_id")?,
    })
}

fn vote_from_row(row: &SqliteRow) -> Result<NewsItemVote> {
    let kind: String = row.try_get("voter_kind")?;
    Ok(NewsItemVote {
        news_item_id: row.try_get("news_item_id")?,
        voter: voter_from_parts(&kind, row.try_get("voter_id")?)?,
        remote_user: row.try_get("remote_user")?,
        like: row.try_get("liked")?,
        dislike: row.try_get("disliked")?,
    })
}

fn attribute_from_row(row: &SqliteRow) -> Result<(i64, NewsItemAttribute)> {
    let attribute = NewsItemAttribute {
        key: row.try_get("key")?,
        value: row.try_get("value")?,
        binary_mime_type: row.try_get("binary_mime_type")?,
        binary_data: row.try_get("binary_data")?,
        created: from_millis(row.try_get("created")?),
        remote_node_id: row.try_get("remote_node_id")?,
        remote_user: row.try_get("remote_user")?,
    };
    Ok((row.try_get("position")?, attribute))
}

fn source_from_row(row: &SqliteRow) -> Result<OsintSource> {
    let parameters_json: String = row.try_get("parameters_json")?;
    Ok(OsintSource {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        collector_type: row.try_get("collector_type")?,
        parameters: serde_json::from_str(&parameters_json)?,
        last_collected: row.try_get::<Option<i64>, _>("last_collected")?.map(from_millis),
        last_attempted: row.try_get::<Option<i64>, _>("last_attempted")?.map(from_millis),
        last_error_message: row.try_get("last_error_message")?,
    })
}

// ── Loading ─────────────────────────────────────────────────────────────

/// Run `head IN (values...)` in chunks and collect every row.
async fn rows_in<T>(conn: &mut SqliteConnection, head: &str, values: &[T]) -> Result<Vec<SqliteRow>>
where
    T: for<'q> sqlx::Encode<'q, Sqlite> + sqlx::Type<Sqlite> + Clone + Send + Sync + 'static,
{
    let mut rows = Vec::new();
    for chunk in values.chunks(IN_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(head);
        qb.push(" IN (");
        let mut separated = qb.separated(", ");
        for value in chunk {
            separated.push_bind(value.clone());
        }
        separated.push_unseparated(")");
        rows.extend(qb.build().fetch_all(&mut *conn).await?);
    }
    Ok(rows)
}

async fn load_registry(conn: &mut SqliteConnection, ledger: &mut Ledger) -> Result<()> {
    let rows = sqlx::query("SELECT * FROM osint_source").fetch_all(&mut *conn).await?;
    for row in &rows {
        ledger.load_source(source_from_row(row)?);
    }

    let members = sqlx::query("SELECT osint_source_group_id, osint_source_id FROM osint_source_group_osint_source")
        .fetch_all(&mut *conn)
        .await?;
    let mut by_group: HashMap<String, BTreeSet<String>> = HashMap::new();
    for row in &members {
        by_group
            .entry(row.try_get("osint_source_group_id")?)
            .or_default()
            .insert(row.try_get("osint_source_id")?);
    }

    let rows = sqlx::query("SELECT id, name, is_default FROM osint_source_group")
        .fetch_all(&mut *conn)
        .await?;
    for row in &rows {
        let id: String = row.try_get("id")?;
        ledger.load_group(OsintSourceGroup {
            source_ids: by_group.remove(&id).unwrap_or_default(),
            name: row.try_get("name")?,
            default: row.try_get("is_default")?,
            id,
        });
    }
    Ok(())
}

async fn load_id_floors(conn: &mut SqliteConnection, ledger: &mut Ledger) -> Result<()> {
    let next_item: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) + 1 FROM news_item")
        .fetch_one(&mut *conn)
        .await?;
    let next_aggregate: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) + 1 FROM news_item_aggregate")
        .fetch_one(&mut *conn)
        .await?;
    ledger.reserve_ids(next_item, next_aggregate);
    Ok(())
}

async fn load_known_hashes(conn: &mut SqliteConnection, ledger: &mut Ledger, hashes: &[String]) -> Result<()> {
    for row in rows_in(conn, "SELECT id, hash FROM news_item_data WHERE hash", hashes).await? {
        ledger.load_known_hash(row.try_get("hash")?, row.try_get("id")?);
    }
    Ok(())
}

/// Mark the data ids already taken in the database among `ids`.
async fn load_known_data_ids(conn: &mut SqliteConnection, ledger: &mut Ledger, ids: &[String]) -> Result<()> {
    for row in rows_in(conn, "SELECT id FROM news_item_data WHERE id", ids).await? {
        ledger.load_known_data_id(row.try_get("id")?);
    }
    Ok(())
}

async fn load_data(conn: &mut SqliteConnection, ledger: &mut Ledger, ids: &[String]) -> Result<()> {
    let mut attributes: HashMap<String, Vec<(i64, NewsItemAttribute)>> = HashMap::new();
    for row in rows_in(conn, "SELECT * FROM news_item_attribute WHERE news_item_data_id", ids).await? {
        let owner: String = row.try_get("news_item_data_id")?;
        attributes.entry(owner).or_default().push(attribute_from_row(&row)?);
    }
    for row in rows_in(conn, "SELECT * FROM news_item_data WHERE id", ids).await? {
        let mut data = data_from_row(&row)?;
        let mut attrs = attributes.remove(&data.id).unwrap_or_default();
        attrs.sort_by_key(|(position, _)| *position);
        data.attributes = attrs.into_iter().map(|(_, a)| a).collect();
        ledger.load_data(data);
    }
    Ok(())
}

/// Load aggregates with everything the engine needs to mutate them.
async fn load_aggregates(conn: &mut SqliteConnection, ledger: &mut Ledger, ids: &[i64]) -> Result<()> {
    let ids: Vec<i64> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();

    let mut attributes: HashMap<i64, Vec<(i64, NewsItemAttribute)>> = HashMap::new();
    for row in rows_in(conn, "SELECT * FROM news_item_attribute WHERE news_item_aggregate_id", &ids).await? {
        let owner: i64 = row.try_get("news_item_aggregate_id")?;
        attributes.entry(owner).or_default().push(attribute_from_row(&row)?);
    }
    for row in rows_in(conn, "SELECT * FROM news_item_aggregate WHERE id", &ids).await? {
        let mut aggregate = aggregate_from_row(&row)?;
        let mut attrs = attributes.remove(&aggregate.id).unwrap_or_default();
        attrs.sort_by_key(|(position, _)| *position);
        aggregate.attributes = attrs.into_iter().map(|(_, a)| a).collect();
        ledger.load_aggregate(aggregate);
    }

    let mut item_ids = Vec::new();
    let mut data_ids = BTreeSet::new();
    for row in rows_in(conn, "SELECT * FROM news_item WHERE news_item_aggregate_id", &ids).await? {
        let item = item_from_row(&row)?;
        item_ids.push(item.id);
        if ledger.data(&item.news_item_data_id).is_none() {
            data_ids.insert(item.news_item_data_id.clone());
        }
        ledger.load_item(item);
    }
    let data_ids: Vec<String> = data_ids.into_iter().collect();
    load_data(conn, ledger, &data_ids).await?;

    for row in rows_in(conn, "SELECT * FROM news_item_vote WHERE news_item_id", &item_ids).await? {
        ledger.load_vote(vote_from_row(&row)?);
    }
    for row in rows_in(
        conn,
        "SELECT news_item_aggregate_id, data FROM news_item_aggregate_search_index WHERE news_item_aggregate_id",
        &ids,
    )
    .await?
    {
        ledger.load_search_index(row.try_get("news_item_aggregate_id")?, row.try_get("data")?);
    }
    for row in rows_in(
        conn,
        "SELECT report_item_id, news_item_aggregate_id FROM report_item_news_item_aggregate WHERE news_item_aggregate_id",
        &ids,
    )
    .await?
    {
        ledger.load_report_link(row.try_get("report_item_id")?, row.try_get("news_item_aggregate_id")?);
    }
    Ok(())
}

async fn aggregates_of_items(conn: &mut SqliteConnection, item_ids: &[i64]) -> Result<Vec<i64>> {
    rows_in(conn, "SELECT news_item_aggregate_id FROM news_item WHERE id", item_ids)
        .await?
        .iter()
        .map(|row| -> Result<i64> { Ok(row.try_get("news_item_aggregate_id")?) })
        .collect()
}

async fn aggregates_of_data(conn: &mut SqliteConnection, data_ids: &[String]) -> Result<Vec<i64>> {
    rows_in(conn, "SELECT news_item_aggregate_id FROM news_item WHERE news_item_data_id", data_ids)
        .await?
        .iter()
        .map(|row| -> Result<i64> { Ok(row.try_get("news_item_aggregate_id")?) })
        .collect()
}

/// Load every aggregate a target list refers to, directly or through an item.
async fn load_targets(conn: &mut SqliteConnection, ledger: &mut Ledger, targets: &[Target]) -> Result<()> {
    let mut aggregate_ids = Vec::new();
    let mut item_ids = Vec::new();
    for target in targets {
        match *target {
            Target::Aggregate(id) => aggregate_ids.push(id),
            Target::Item(id) => item_ids.push(id),
        }
    }
    aggregate_ids.extend(aggregates_of_items(conn, &item_ids).await?);
    load_aggregates(conn, ledger, &aggregate_ids).await
}

// ── Writing ─────────────────────────────────────────────────────────────

enum AttributeOwner<'a> {
    Data(&'a str),
    Aggregate(i64),
}

async fn write_attributes(
    conn: &mut SqliteConnection,
    owner: AttributeOwner<'_>,
    attributes: &[NewsItemAttribute],
) -> Result<()> {
    let (data_id, aggregate_id) = match owner {
        AttributeOwner::Data(id) => {
            sqlx::query("DELETE FROM news_item_attribute WHERE news_item_data_id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?;
            (Some(id), None)
        }
        AttributeOwner::Aggregate(id) => {
            sqlx::query("DELETE FROM news_item_attribute WHERE news_item_aggregate_id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?;
            (None, Some(id))
        }
    };
    for (position, attribute) in attributes.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO news_item_attribute (news_item_data_id, news_item_aggregate_id, position, key, value,
                                             binary_mime_type, binary_data, created, remote_node_id, remote_user)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(data_id)
        .bind(aggregate_id)
        .bind(position as i64)
        .bind(&attribute.key)
        .bind(&attribute.value)
        .bind(&attribute.binary_mime_type)
        .bind(&attribute.binary_data)
        .bind(to_millis(attribute.created))
        .bind(attribute.remote_node_id)
        .bind(&attribute.remote_user)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn write_data(conn: &mut SqliteConnection, data: &NewsItemData) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO news_item_data (id, hash, title, review, author, source, link, language, content,
                                    collected, published, updated, osint_source_id, remote_source)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            review = excluded.review,
            author = excluded.author,
            source = excluded.source,
            link = excluded.link,
            language = excluded.language,
            content = excluded.content,
            published = excluded.published,
            updated = excluded.updated,
            osint_source_id = excluded.osint_source_id,
            remote_source = excluded.remote_source
        WHERE news_item_data.hash = excluded.hash
        "#,
    )
    .bind(&data.id)
    .bind(&data.hash)
    .bind(&data.title)
    .bind(&data.review)
    .bind(&data.author)
    .bind(&data.source)
    .bind(&data.link)
    .bind(&data.language)
    .bind(&data.content)
    .bind(to_millis(data.collected))
    .bind(&data.published)
    .bind(to_millis(data.updated))
    .bind(&data.osint_source_id)
    .bind(&data.remote_source)
    .execute(&mut *conn)
    .await?;
    write_attributes(conn, AttributeOwner::Data(&data.id), &data.attributes).await
}

async fn write_aggregate(conn: &mut SqliteConnection, aggregate: &NewsItemAggregate) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO news_item_aggregate (id, title, description, created, read, important, likes, dislikes,
                                         relevance, comments, osint_source_group_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            description = excluded.description,
            created = excluded.created,
            read = excluded.read,
            important = excluded.important,
            likes = excluded.likes,
            dislikes = excluded.dislikes,
            relevance = excluded.relevance,
            comments = excluded.comments,
            osint_source_group_id = excluded.osint_source_group_id
        "#,
    )
    .bind(aggregate.id)
    .bind(&aggregate.title)
    .bind(&aggregate.description)
    .bind(to_millis(aggregate.created))
    .bind(aggregate.read)
    .bind(aggregate.important)
    .bind(aggregate.likes)
    .bind(aggregate.dislikes)
    .bind(aggregate.relevance)
    .bind(&aggregate.comments)
    .bind(&aggregate.osint_source_group_id)
    .execute(&mut *conn)
    .await?;
    write_attributes(conn, AttributeOwner::Aggregate(aggregate.id), &aggregate.attributes).await
}

async fn write_item(conn: &mut SqliteConnection, item: &NewsItem) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO news_item (id, read, important, likes, dislikes, relevance, news_item_data_id, news_item_aggregate_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            read = excluded.read,
            important = excluded.important,
            likes = excluded.likes,
            dislikes = excluded.dislikes,
            relevance = excluded.relevance,
            news_item_aggregate_id = excluded.news_item_aggregate_id
        "#,
    )
    .bind(item.id)
    .bind(item.read)
    .bind(item.important)
    .bind(item.likes)
    .bind(item.dislikes)
    .bind(item.relevance)
    .bind(&item.news_item_data_id)
    .bind(item.news_item_aggregate_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_vote(conn: &mut SqliteConnection, vote: &NewsItemVote) -> Result<()> {
    let (kind, voter_id) = voter_parts(vote.voter);
    sqlx::query(
        r#"
        INSERT INTO news_item_vote (news_item_id, voter_kind, voter_id, remote_user, liked, disliked)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(news_item_id, voter_kind, voter_id) DO UPDATE SET
            remote_user = excluded.remote_user,
            liked = excluded.liked,
            disliked = excluded.disliked
        "#,
    )
    .bind(vote.news_item_id)
    .bind(kind)
    .bind(voter_id)
    .bind(&vote.remote_user)
    .bind(vote.like)
    .bind(vote.dislike)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_source(conn: &mut SqliteConnection, source: &OsintSource) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO osint_source (id, name, collector_type, parameters_json, last_collected, last_attempted,
                                  last_error_message)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            collector_type = excluded.collector_type,
            parameters_json = excluded.parameters_json,
            last_collected = excluded.last_collected,
            last_attempted = excluded.last_attempted,
            last_error_message = excluded.last_error_message
        "#,
    )
    .bind(&source.id)
    .bind(&source.name)
    .bind(&source.collector_type)
    .bind(serde_json::to_string(&source.parameters)?)
    .bind(source.last_collected.map(to_millis))
    .bind(source.last_attempted.map(to_millis))
    .bind(&source.last_error_message)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_group(conn: &mut SqliteConnection, group: &OsintSourceGroup) -> Result<()> {
    if group.default {
        sqlx::query("UPDATE osint_source_group SET is_default = 0 WHERE id != ?")
            .bind(&group.id)
            .execute(&mut *conn)
            .await?;
    }
    sqlx::query(
        r#"
        INSERT INTO osint_source_group (id, name, is_default) VALUES (?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET name = excluded.name, is_default = excluded.is_default
        "#,
    )
    .bind(&group.id)
    .bind(&group.name)
    .bind(group.default)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM osint_source_group_osint_source WHERE osint_source_group_id = ?")
        .bind(&group.id)
        .execute(&mut *conn)
        .await?;
    for source_id in &group.source_ids {
        sqlx::query(
            "INSERT INTO osint_source_group_osint_source (osint_source_group_id, osint_source_id) VALUES (?, ?)",
        )
        .bind(&group.id)
        .bind(source_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Replay a ledger journal.
///
/// Parents are written before children and children removed before
/// parents, so foreign keys hold at every statement.
async fn persist(conn: &mut SqliteConnection, ledger: &Ledger, journal: &Journal) -> Result<()> {
    for id in &journal.sources {
        if let Some(source) = ledger.source(id) {
            write_source(conn, source).await?;
        }
    }
    for id in &journal.groups {
        if let Some(group) = ledger.group(id) {
            write_group(conn, group).await?;
        }
    }
    for id in &journal.data {
        if let Some(data) = ledger.data(id) {
            write_data(conn, data).await?;
        }
    }
    for id in &journal.aggregates {
        if let Some(aggregate) = ledger.aggregate(*id) {
            write_aggregate(conn, aggregate).await?;
        }
    }
    for id in &journal.items {
        if let Some(item) = ledger.item(*id) {
            write_item(conn, item).await?;
        }
    }
    for (item_id, voter) in &journal.votes {
        if let Some(vote) = ledger.vote_of(*item_id, *voter) {
            write_vote(conn, vote).await?;
        }
    }

    for (item_id, voter) in &journal.removed_votes {
        let (kind, voter_id) = voter_parts(*voter);
        sqlx::query("DELETE FROM news_item_vote WHERE news_item_id = ? AND voter_kind = ? AND voter_id = ?")
            .bind(item_id)
            .bind(kind)
            .bind(voter_id)
            .execute(&mut *conn)
            .await?;
    }
    for id in &journal.removed_items {
        sqlx::query("DELETE FROM news_item WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }
    for id in &journal.removed_search_index {
        sqlx::query("DELETE FROM news_item_aggregate_search_index WHERE news_item_aggregate_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }
    for (aggregate_id, report_item_id) in &journal.removed_report_links {
        sqlx::query("DELETE FROM report_item_news_item_aggregate WHERE report_item_id = ? AND news_item_aggregate_id = ?")
            .bind(report_item_id)
            .bind(aggregate_id)
            .execute(&mut *conn)
            .await?;
    }
    for id in &journal.removed_aggregates {
        sqlx::query("DELETE FROM news_item_aggregate WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }

    for id in &journal.search_index {
        if let Some(text) = ledger.search_text(*id) {
            sqlx::query(
                r#"
                INSERT INTO news_item_aggregate_search_index (news_item_aggregate_id, data) VALUES (?, ?)
                ON CONFLICT(news_item_aggregate_id) DO UPDATE SET data = excluded.data
                "#,
            )
            .bind(id)
            .bind(text)
            .execute(&mut *conn)
            .await?;
        }
    }
    for (aggregate_id, report_item_id) in &journal.report_links {
        sqlx::query(
            "INSERT OR IGNORE INTO report_item_news_item_aggregate (report_item_id, news_item_aggregate_id) VALUES (?, ?)",
        )
        .bind(report_item_id)
        .bind(aggregate_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

fn escape_like(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl SqliteStore {
    /// Write the ledger's journal and commit.
    async fn commit(&self, mut tx: sqlx::Transaction<'static, Sqlite>, ledger: &mut Ledger) -> Result<()> {
        let journal = ledger.take_journal();
        persist(&mut tx, ledger, &journal).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Ids of a group's aggregates passing the row-level filters.
    /// Ids of a group's aggregates matching `filter`, unordered.
    ///
    /// Exact for every filter; visibility is left to the ledger.
    async fn candidate_aggregates(
        &self,
        conn: &mut SqliteConnection,
        group_id: &str,
        filter: &AggregateFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let mut qb = filtered_aggregates("SELECT a.id", group_id, filter, now);
        let rows = qb.build().fetch_all(&mut *conn).await?;
        rows.iter().map(|row| -> Result<i64> { Ok(row.try_get("id")?) }).collect()
    }

    /// One sorted page of matching aggregate ids and the total match count,
    /// for callers that can see every member.
    async fn page_of_aggregates(
        &self,
        conn: &mut SqliteConnection,
        group_id: &str,
        filter: &AggregateFilter,
        offset: usize,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<(Vec<i64>, usize)> {
        let mut count = filtered_aggregates("SELECT COUNT(*) AS n", group_id, filter, now);
        let total: i64 = count.build().fetch_one(&mut *conn).await?.try_get("n")?;

        let mut qb = filtered_aggregates("SELECT a.id", group_id, filter, now);
        qb.push(" ORDER BY ")
            .push(order_clause(filter.sort))
            .push(" LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .push(" OFFSET ")
            .push_bind(i64::try_from(offset).unwrap_or(i64::MAX));
        let rows = qb.build().fetch_all(&mut *conn).await?;
        let ids = rows
            .iter()
            .map(|row| -> Result<i64> { Ok(row.try_get("id")?) })
            .collect::<Result<Vec<_>>>()?;
        Ok((ids, usize::try_from(total).unwrap_or(0)))
    }
}

/// `<select> FROM` a group's aggregates with every filter applied in SQL.
fn filtered_aggregates(
    select: &str,
    group_id: &str,
    filter: &AggregateFilter,
    now: DateTime<Utc>,
) -> QueryBuilder<'static, Sqlite> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(select);
    qb.push(
        " FROM news_item_aggregate a \
         LEFT JOIN news_item_aggregate_search_index s ON s.news_item_aggregate_id = a.id \
         WHERE a.osint_source_group_id = ",
    );
    qb.push_bind(group_id.to_string());
    if let Some(since) = range_start(filter.range, now) {
        qb.push(" AND a.created >= ").push_bind(to_millis(since));
    }
    if filter.unread_only {
        qb.push(" AND a.read = 0");
    }
    if filter.important_only {
        qb.push(" AND a.important = 1");
    }
    if filter.relevant_only {
        qb.push(" AND a.likes > 0");
    }
    if filter.in_report_only {
        qb.push(" AND EXISTS (SELECT 1 FROM report_item_news_item_aggregate r WHERE r.news_item_aggregate_id = a.id)");
    }
    if let Some(needle) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        qb.push(" AND s.data LIKE ")
            .push_bind(format!("%{}%", escape_like(&needle.to_lowercase())))
            .push(" ESCAPE '\\'");
    }
    qb
}

/// SQL twin of [`compare`](osint_aggregate_core::ledger::compare).
fn order_clause(sort: SortOrder) -> &'static str {
    match sort {
        SortOrder::DateDesc => "a.created DESC, a.id DESC",
        SortOrder::DateAsc => "a.created ASC, a.id ASC",
        SortOrder::RelevanceDesc => "a.relevance DESC, a.id DESC",
        SortOrder::RelevanceAsc => "a.relevance ASC, a.id ASC",
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_source(&self, source: &OsintSource) -> Result<()> {
        let _writer = self.writer.lock().await;
        sqlx::query(
            r#"
            INSERT INTO osint_source (id, name, collector_type, parameters_json) VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                collector_type = excluded.collector_type,
                parameters_json = excluded.parameters_json
            "#,
        )
        .bind(&source.id)
        .bind(&source.name)
        .bind(&source.collector_type)
        .bind(serde_json::to_string(&source.parameters)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_group(&self, group: &OsintSourceGroup) -> Result<()> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        write_group(&mut tx, group).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_source(&self, id: &str) -> Result<Option<OsintSource>> {
        let row = sqlx::query("SELECT * FROM osint_source WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn list_sources(&self) -> Result<Vec<OsintSource>> {
        let rows = sqlx::query("SELECT * FROM osint_source ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn list_groups(&self) -> Result<Vec<OsintSourceGroup>> {
        let mut conn = self.pool.acquire().await?;
        let mut ledger = Ledger::new();
        load_registry(&mut conn, &mut ledger).await?;
        Ok(ledger.groups().cloned().collect())
    }

    async fn record_attempt(&self, source_id: &str, error: Option<&str>) -> Result<()> {
        let _writer = self.writer.lock().await;
        let result = sqlx::query("UPDATE osint_source SET last_attempted = ?, last_error_message = ? WHERE id = ?")
            .bind(to_millis(Utc::now()))
            .bind(error)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::SourceNotFound(source_id.to_string()).into());
        }
        Ok(())
    }

    async fn add_items(&self, batch: Vec<NewsItemData>) -> Result<BTreeSet<String>> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut ledger = Ledger::new();
        load_registry(&mut tx, &mut ledger).await?;
        load_id_floors(&mut tx, &mut ledger).await?;
        let hashes: Vec<String> = batch.iter().map(|d| d.hash.clone()).collect();
        load_known_hashes(&mut tx, &mut ledger, &hashes).await?;
        let ids: Vec<String> = batch.iter().map(|d| d.id.clone()).collect();
        load_known_data_ids(&mut tx, &mut ledger, &ids).await?;

        let sources = ledger.add_items(batch, Utc::now());
        self.commit(tx, &mut ledger).await?;
        Ok(sources)
    }

    async fn get_by_group(
        &self,
        group_id: &str,
        filter: &AggregateFilter,
        offset: usize,
        limit: usize,
        identity: &Identity,
    ) -> Result<(Vec<AggregateView>, usize)> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        if matches!(identity, Identity::System) || self.auth.grants_everything() {
            let (page, total) = self
                .page_of_aggregates(&mut tx, group_id, filter, offset, limit, now)
                .await?;
            let mut ledger = Ledger::new();
            load_aggregates(&mut tx, &mut ledger, &page).await?;
            tx.commit().await?;
            let views = page
                .iter()
                .filter_map(|id| ledger.view_aggregate(*id, identity, self.auth.as_ref()))
                .collect();
            return Ok((views, total));
        }
        let candidates = self.candidate_aggregates(&mut tx, group_id, filter, now).await?;
        let mut ledger = Ledger::new();
        load_aggregates(&mut tx, &mut ledger, &candidates).await?;
        tx.commit().await?;
        Ok(ledger.query_group(group_id, filter, offset, limit, identity, self.auth.as_ref(), now))
    }

    async fn get_aggregate(&self, id: i64, identity: &Identity) -> Result<Option<AggregateView>> {
        let mut tx = self.pool.begin().await?;
        let mut ledger = Ledger::new();
        load_aggregates(&mut tx, &mut ledger, &[id]).await?;
        tx.commit().await?;
        Ok(ledger.view_aggregate(id, identity, self.auth.as_ref()))
    }

    async fn get_item(&self, id: i64, identity: &Identity) -> Result<Option<NewsItemView>> {
        let mut tx = self.pool.begin().await?;
        let mut ledger = Ledger::new();
        load_targets(&mut tx, &mut ledger, &[Target::Item(id)]).await?;
        tx.commit().await?;
        Ok(ledger.view_item(id, identity, self.auth.as_ref()))
    }

    async fn update_item(&self, id: i64, update: &StatusUpdate, identity: &Identity) -> Result<ActionResponse> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut ledger = Ledger::new();
        load_targets(&mut tx, &mut ledger, &[Target::Item(id)]).await?;
        let response = ledger.update_item(id, update, identity, self.auth.as_ref(), Utc::now())?;
        self.commit(tx, &mut ledger).await?;
        Ok(response)
    }

    async fn update_aggregate(&self, id: i64, update: &StatusUpdate, identity: &Identity) -> Result<ActionResponse> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut ledger = Ledger::new();
        load_aggregates(&mut tx, &mut ledger, &[id]).await?;
        let response = ledger.update_aggregate(id, update, identity, self.auth.as_ref(), Utc::now())?;
        self.commit(tx, &mut ledger).await?;
        Ok(response)
    }

    async fn group_action(&self, action: GroupAction, targets: &[Target], identity: &Identity) -> Result<ActionResponse> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut ledger = Ledger::new();
        load_id_floors(&mut tx, &mut ledger).await?;
        load_targets(&mut tx, &mut ledger, targets).await?;
        let response = ledger.group_action(action, targets, identity, self.auth.as_ref(), Utc::now())?;
        self.commit(tx, &mut ledger).await?;
        tracing::debug!(?action, targets = targets.len(), status = ?response.status, "group action");
        Ok(response)
    }

    async fn delete_item(&self, id: i64, identity: &Identity) -> Result<ActionResponse> {
        self.group_action(GroupAction::Delete, &[Target::Item(id)], identity).await
    }

    async fn delete_aggregate(&self, id: i64, identity: &Identity) -> Result<ActionResponse> {
        self.group_action(GroupAction::Delete, &[Target::Aggregate(id)], identity).await
    }

    async fn add_remote_items(&self, node: &RemoteNode, group_id: &str, records: Vec<RemoteRecord>) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut ledger = Ledger::new();
        load_registry(&mut tx, &mut ledger).await?;
        load_id_floors(&mut tx, &mut ledger).await?;

        let hashes: Vec<String> = records.iter().map(|r| r.data.hash.clone()).collect();
        let data_ids: Vec<String> = rows_in(&mut tx, "SELECT id FROM news_item_data WHERE hash", &hashes)
            .await?
            .iter()
            .map(|row| -> Result<String> { Ok(row.try_get("id")?) })
            .collect::<Result<_>>()?;
        let aggregate_ids = aggregates_of_data(&mut tx, &data_ids).await?;
        load_aggregates(&mut tx, &mut ledger, &aggregate_ids).await?;
        load_data(&mut tx, &mut ledger, &data_ids).await?;
        let incoming_ids: Vec<String> = records.iter().map(|r| r.data.id.clone()).collect();
        load_known_data_ids(&mut tx, &mut ledger, &incoming_ids).await?;

        let created = ledger.add_remote_items(node, group_id, records, Utc::now())?;
        self.commit(tx, &mut ledger).await?;
        Ok(created)
    }

    async fn get_for_sync(
        &self,
        last_synced: DateTime<Utc>,
        source_ids: &BTreeSet<String>,
    ) -> Result<(Vec<SyncRecord>, DateTime<Utc>)> {
        let now = Utc::now();
        if source_ids.is_empty() {
            return Ok((Vec::new(), now));
        }
        let mut tx = self.pool.begin().await?;
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id FROM news_item_data WHERE updated >= ");
        qb.push_bind(to_millis(last_synced))
            .push(" AND updated <= ")
            .push_bind(to_millis(now))
            .push(" AND osint_source_id IN (");
        let mut separated = qb.separated(", ");
        for source_id in source_ids {
            separated.push_bind(source_id.clone());
        }
        separated.push_unseparated(")");
        let data_ids: Vec<String> = qb
            .build()
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| -> Result<String> { Ok(row.try_get("id")?) })
            .collect::<Result<_>>()?;

        let mut ledger = Ledger::new();
        load_data(&mut tx, &mut ledger, &data_ids).await?;
        for row in rows_in(&mut tx, "SELECT * FROM news_item WHERE news_item_data_id", &data_ids).await? {
            ledger.load_item(item_from_row(&row)?);
        }
        tx.commit().await?;
        Ok((ledger.get_for_sync(last_synced, source_ids, now), now))
    }

    async fn update_attributes(&self, data_id: &str, attributes: Vec<NewsItemAttribute>) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut ledger = Ledger::new();
        let data_ids = vec![data_id.to_string()];
        let aggregate_ids = aggregates_of_data(&mut tx, &data_ids).await?;
        load_aggregates(&mut tx, &mut ledger, &aggregate_ids).await?;
        if ledger.data(data_id).is_none() {
            load_data(&mut tx, &mut ledger, &data_ids).await?;
        }
        let added = ledger.update_attributes(data_id, attributes, Utc::now())?;
        self.commit(tx, &mut ledger).await?;
        Ok(added)
    }

    async fn reassign_to_new_groups(&self, source_id: &str, default_group_id: &str) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut ledger = Ledger::new();
        load_registry(&mut tx, &mut ledger).await?;
        load_id_floors(&mut tx, &mut ledger).await?;

        let since = now - Duration::days(REASSIGN_WINDOW_DAYS);
        let aggregate_ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT ni.news_item_aggregate_id
            FROM news_item ni
            JOIN news_item_data d ON d.id = ni.news_item_data_id
            JOIN news_item_aggregate a ON a.id = ni.news_item_aggregate_id
            WHERE d.osint_source_id = ? AND a.osint_source_group_id = ? AND d.collected >= ?
            "#,
        )
        .bind(source_id)
        .bind(default_group_id)
        .bind(to_millis(since))
        .fetch_all(&mut *tx)
        .await?;
        load_aggregates(&mut tx, &mut ledger, &aggregate_ids).await?;

        let moved = ledger.reassign_to_new_groups(source_id, default_group_id, now)?;
        self.commit(tx, &mut ledger).await?;
        Ok(moved)
    }

    async fn assign_to_report(&self, report_item_id: i64, aggregate_id: i64) -> Result<()> {
        let _writer = self.writer.lock().await;
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM news_item_aggregate WHERE id = ?")
            .bind(aggregate_id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Err(LedgerError::AggregateNotFound(aggregate_id).into());
        }
        sqlx::query(
            "INSERT OR IGNORE INTO report_item_news_item_aggregate (report_item_id, news_item_aggregate_id) VALUES (?, ?)",
        )
        .bind(report_item_id)
        .bind(aggregate_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_from_report(&self, report_item_id: i64, aggregate_id: i64) -> Result<()> {
        let _writer = self.writer.lock().await;
        sqlx::query("DELETE FROM report_item_news_item_aggregate WHERE report_item_id = ? AND news_item_aggregate_id = ?")
            .bind(report_item_id)
            .bind(aggregate_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let count = |table: &'static str| {
            let pool = self.pool.clone();
            async move {
                let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                    .fetch_one(&pool)
                    .await?;
                Ok::<usize, anyhow::Error>(n as usize)
            }
        };
        let latest: Option<i64> = sqlx::query_scalar("SELECT MAX(collected) FROM news_item_data")
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreStats {
            news_item_data: count("news_item_data").await?,
            news_items: count("news_item").await?,
            aggregates: count("news_item_aggregate").await?,
            votes: count("news_item_vote").await?,
            latest_collected: latest.map(from_millis),
        })
    }
}
