//! Turns raw parsed feed entries into normalized, sanitized articles-to-be.

use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use tracing::debug;
use url::Url;

use crate::fetcher::Fetcher;
use crate::types::{NormalizedEntry, OriginalFeed};

/// Query parameter stripped during canonicalization (interface-language
/// tracking, carried by aggregator links).
const TRACKING_PARAM: &str = "hl";

/// Entries whose extracted content is shorter than this fall back to fetching
/// the article page itself.
const FULL_CONTENT_THRESHOLD: usize = 500;

static ANSI_ESCAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("valid regex"));
static CONTROL_CHAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x1F\x7F-\x9F]").expect("valid regex"));

/// Normalize one parsed entry for `source`.
///
/// Falls back to fetching the original article page when the feed only ships
/// a stub, unless the source is marked as already providing full content. A
/// failed page fetch keeps the stub; it never fails the entry.
pub async fn normalize(
    entry: &feed_rs::model::Entry,
    source: &OriginalFeed,
    fetcher: &Fetcher,
) -> NormalizedEntry {
    let raw_link = entry
        .links
        .first()
        .map(|l| l.href.clone())
        .unwrap_or_else(|| entry.id.clone());

    let content_field = entry.content.as_ref().and_then(|c| c.body.clone());
    let description = entry.summary.as_ref().map(|s| s.content.clone());
    let mut content = if source.quirks.content_in_description {
        description.or(content_field)
    } else {
        content_field.or(description)
    }
    .unwrap_or_default();

    if content.chars().count() < FULL_CONTENT_THRESHOLD && !source.quirks.skip_full_content {
        debug!("fetching full content for {}", raw_link);
        match fetcher.fetch_full_content(&raw_link).await {
            Ok(body) => content = body,
            Err(e) => debug!("full content fetch failed for {}: {}", raw_link, e),
        }
    }

    let content = sanitize_text(&content);
    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| untitled_fallback(&content, &raw_link));

    NormalizedEntry {
        title,
        link: canonicalize_url(&raw_link),
        // Malformed entries without a publish time get the processing time;
        // ingestion of those entries is not deterministic across runs.
        published_at: entry.published.unwrap_or_else(Utc::now),
        content,
    }
}

/// Title fallback for entries without one: a body prefix, then the link.
fn untitled_fallback(content: &str, link: &str) -> String {
    if content.is_empty() {
        link.to_string()
    } else {
        content.chars().take(50).collect()
    }
}

/// Canonical form of an entry link, the per-source dedup key.
///
/// Lowercases, strips the fragment and any trailing path slash, drops the
/// tracking parameter and re-encodes the remaining query pairs in sorted
/// order. Idempotent. Unparseable links fall back to trimmed lowercase.
pub fn canonicalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(url) = Url::parse(trimmed) else {
        return trimmed.to_lowercase();
    };

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != TRACKING_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    let mut out = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(url.path().trim_end_matches('/'));
    if !pairs.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        out.push('?');
        out.push_str(&query);
    }
    out.to_lowercase()
}

/// Collapse whitespace and strip ANSI escape sequences and C0/C1 control
/// characters.
pub fn sanitize_text(raw: &str) -> String {
    let content = raw.replace('\t', "    ");
    let content = content.split_whitespace().collect::<Vec<_>>().join(" ");
    let content = ANSI_ESCAPE_RE.replace_all(&content, "");
    CONTROL_CHAR_RE.replace_all(&content, "").into_owned()
}
