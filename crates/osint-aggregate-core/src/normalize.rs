//! Hashing and normalization of collected records.
//!
//! Every collector adapter funnels its output through [`normalize`] so that
//! fingerprints from different source types are comparable:
//!
//! - missing `title`, `review`, `author`, `source`, `link`, `content` → `""`
//! - missing `published` / `collected` → the ingestion time
//! - missing `id` → a fresh UUID v4
//! - missing `hash` → [`fingerprint`]`(author, title, link)`
//!
//! The fingerprint is computed over the defaulted fields *before* HTML is
//! stripped. Its field order is a storage compatibility constraint: changing
//! it changes every future hash.
//!
//! Adapters without a natural link (email) put a stable locator in `link`
//! (`mid:<Message-ID>`), keeping one fingerprint function for all of them.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use scraper::{Html, Node};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{NewsItemAttribute, NewsItemData, RawAttribute, RawRecord};

/// Maximum title length for manually entered items.
pub const MANUAL_TITLE_LIMIT: usize = 200;
/// Maximum review length for manually entered items.
pub const MANUAL_REVIEW_LIMIT: usize = 500;

const TRUNCATE_SUFFIX: &str = " [...]";

/// SHA-256 over `author + title + link`, UTF-8, lowercase hex.
pub fn fingerprint(author: &str, title: &str, link: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(author.as_bytes());
    hasher.update(title.as_bytes());
    hasher.update(link.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Normalize a collected record into a [`NewsItemData`].
///
/// `source_id` is the collecting source. It overrides whatever owning source
/// the record names; records without a collecting source keep their own.
pub fn normalize(record: RawRecord, source_id: Option<&str>, now: DateTime<Utc>) -> NewsItemData {
    let title = record.title.unwrap_or_default();
    let review = record.review.unwrap_or_default();
    let author = record.author.unwrap_or_default();
    let link = record.link.unwrap_or_default();
    let content = record.content.unwrap_or_default();

    let hash = record
        .hash
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| fingerprint(&author, &title, &link));

    NewsItemData {
        id: record
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        hash,
        title: strip_html(&title),
        review: strip_html(&review),
        author: strip_html(&author),
        source: record.source.unwrap_or_default(),
        link,
        language: record.language,
        content: strip_html(&content),
        collected: record.collected.unwrap_or(now),
        published: record.published.unwrap_or_else(|| now.to_rfc3339()),
        updated: now,
        osint_source_id: source_id.map(str::to_string).or(record.osint_source_id),
        remote_source: None,
        attributes: record
            .attributes
            .into_iter()
            .map(|a| convert_attribute(a, now))
            .collect(),
    }
}

/// Normalize a record typed in by an analyst.
///
/// Stricter than [`normalize`]: title and review are truncated, and a
/// missing hash falls back to the record id rather than the fingerprint,
/// so manual entries never collapse into each other.
pub fn normalize_manual(mut record: RawRecord, source_id: Option<&str>, now: DateTime<Utc>) -> NewsItemData {
    let id = record
        .id
        .take()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if record.hash.as_deref().map_or(true, str::is_empty) {
        record.hash = Some(id.clone());
    }
    record.id = Some(id);

    let mut data = normalize(record, source_id, now);
    data.title = smart_truncate(&data.title, MANUAL_TITLE_LIMIT);
    data.review = smart_truncate(&data.review, MANUAL_REVIEW_LIMIT);
    data
}

fn convert_attribute(raw: RawAttribute, now: DateTime<Utc>) -> NewsItemAttribute {
    let binary_data = raw.binary_value.as_deref().and_then(|encoded| {
        match base64::engine::general_purpose::STANDARD.decode(encoded) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(key = %raw.key, "dropping undecodable binary attribute: {}", e);
                None
            }
        }
    });
    NewsItemAttribute {
        key: raw.key,
        value: raw.value,
        binary_mime_type: raw.binary_mime_type,
        binary_data,
        created: now,
        remote_node_id: None,
        remote_user: None,
    }
}

/// Extract the text of an HTML fragment, joining text nodes with single
/// spaces. Entities are decoded; comments and script/style bodies are dropped.
pub fn strip_html(html: &str) -> String {
    if !html.contains('<') && !html.contains('&') {
        return clean_whitespace(html);
    }
    let fragment = Html::parse_fragment(html);
    let mut parts: Vec<String> = Vec::new();
    for node in fragment.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|e| matches!(e.name(), "script" | "style" | "noscript" | "template"))
        });
        if hidden {
            continue;
        }
        let cleaned = clean_whitespace(text);
        if !cleaned.is_empty() {
            parts.push(cleaned);
        }
    }
    parts.join(" ")
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn clean_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate at a word boundary to at most `limit` characters plus a suffix.
pub fn smart_truncate(content: &str, limit: usize) -> String {
    if content.chars().count() <= limit {
        return clean_whitespace(content);
    }
    let head: String = content.chars().take(limit + 1).collect();
    let mut words: Vec<&str> = head.split_whitespace().collect();
    // the last word may be cut in half
    words.pop();
    if words.is_empty() {
        let cut: String = content.chars().take(limit).collect();
        return cut + TRUNCATE_SUFFIX;
    }
    words.join(" ") + TRUNCATE_SUFFIX
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(author: &str, title: &str, link: &str) -> RawRecord {
        RawRecord {
            author: Some(author.to_string()),
            title: Some(title.to_string()),
            link: Some(link.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_fingerprint_is_sha256_of_concatenation() {
        assert_eq!(
            fingerprint("A", "T", "L"),
            "8d87f1663045641686255839674e224fb969575b898caf111e0c5e0581c2b2ca"
        );
    }

    #[test]
    fn test_fingerprint_deterministic() {
        assert_eq!(fingerprint("a", "b", "c"), fingerprint("a", "b", "c"));
    }

    #[test]
    fn test_fingerprint_changes_with_each_field() {
        let base = fingerprint("author", "title", "link");
        assert_ne!(base, fingerprint("author2", "title", "link"));
        assert_ne!(base, fingerprint("author", "title2", "link"));
        assert_ne!(base, fingerprint("author", "title", "link2"));
    }

    #[test]
    fn test_normalize_defaults_missing_fields() {
        let now = Utc::now();
        let data = normalize(RawRecord::default(), Some("src-1"), now);
        assert_eq!(data.title, "");
        assert_eq!(data.review, "");
        assert_eq!(data.author, "");
        assert_eq!(data.link, "");
        assert_eq!(data.collected, now);
        assert_eq!(data.published, now.to_rfc3339());
        assert_eq!(data.osint_source_id.as_deref(), Some("src-1"));
        assert!(Uuid::parse_str(&data.id).is_ok());
        assert_eq!(data.hash, fingerprint("", "", ""));
    }

    #[test]
    fn test_normalize_hashes_before_stripping() {
        let now = Utc::now();
        let data = normalize(raw("<b>A</b>", "T", "L"), None, now);
        assert_eq!(data.author, "A");
        assert_eq!(data.hash, fingerprint("<b>A</b>", "T", "L"));
    }

    #[test]
    fn test_normalize_keeps_supplied_hash() {
        let mut r = raw("A", "T", "L");
        r.hash = Some("given".into());
        let data = normalize(r, Some("s1"), Utc::now());
        assert_eq!(data.hash, "given");
    }

    #[test]
    fn test_collecting_source_overrides_record_source() {
        let mut r = raw("A", "T", "L");
        r.osint_source_id = Some("other".into());
        let data = normalize(r.clone(), Some("s1"), Utc::now());
        assert_eq!(data.osint_source_id.as_deref(), Some("s1"));

        let data = normalize(r, None, Utc::now());
        assert_eq!(data.osint_source_id.as_deref(), Some("other"));
    }

    #[test]
    fn test_normalize_decodes_binary_attribute() {
        let mut r = raw("A", "T", "L");
        r.attributes.push(RawAttribute {
            key: "image".into(),
            value: "logo.png".into(),
            binary_mime_type: Some("image/png".into()),
            binary_value: Some("aGVsbG8=".into()),
        });
        let data = normalize(r, None, Utc::now());
        assert_eq!(data.attributes.len(), 1);
        assert_eq!(data.attributes[0].binary_data.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_manual_hash_falls_back_to_id() {
        let mut r = raw("A", "T", "L");
        r.id = Some("manual-1".into());
        let data = normalize_manual(r, Some("manual"), Utc::now());
        assert_eq!(data.id, "manual-1");
        assert_eq!(data.hash, "manual-1");
    }

    #[test]
    fn test_manual_truncates_title() {
        let title = "word ".repeat(100);
        let data = normalize_manual(raw("A", &title, "L"), None, Utc::now());
        assert!(data.title.ends_with(" [...]"));
        assert!(data.title.chars().count() <= MANUAL_TITLE_LIMIT + TRUNCATE_SUFFIX.len());
    }

    #[test]
    fn test_strip_html() {
        assert_eq!(strip_html("<p>Hello <b>world</b></p>"), "Hello world");
        assert_eq!(strip_html("a &amp; b"), "a & b");
        assert_eq!(strip_html("  plain   text "), "plain text");
        assert_eq!(strip_html(""), "");
    }

    #[test]
    fn test_strip_html_decodes_named_and_numeric_entities() {
        assert_eq!(
            strip_html("caf&eacute; &#8217;quoted&#8217; &hellip;"),
            "caf\u{e9} \u{2019}quoted\u{2019} \u{2026}"
        );
    }

    #[test]
    fn test_strip_html_drops_comments_and_scripts() {
        assert_eq!(
            strip_html("<p>a<!-- x > y --></p><script>var z=1;</script><style>p{}</style>b"),
            "a b"
        );
    }

    #[test]
    fn test_smart_truncate() {
        assert_eq!(smart_truncate("short text", 50), "short text");
        assert_eq!(smart_truncate("one two three", 8), "one two [...]");
        assert_eq!(smart_truncate("abcdefghij", 4), "abcd [...]");
    }
}
