//! Dedup and ingestion: per-source capping, global recency merge, and the
//! conditional insert that makes re-runs idempotent.

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::filters::{passes_filters, FilterUsage};
use crate::store::ArticleStore;
use crate::types::{Article, NormalizedEntry, ProcessedFeed, Result};

/// Keep only the `cap` most recently published entries of one source.
pub fn cap_most_recent(mut entries: Vec<NormalizedEntry>, cap: usize) -> Vec<NormalizedEntry> {
    entries.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    entries.truncate(cap);
    entries
}

/// Flatten all sources' capped entries into one sequence in descending
/// publish-time order, so the summarization cap lands on the newest content.
pub fn merge_by_recency(mut entries: Vec<(NormalizedEntry, Uuid)>) -> Vec<(NormalizedEntry, Uuid)> {
    entries.sort_by(|a, b| b.0.published_at.cmp(&a.0.published_at));
    entries
}

/// Ingest one entry for a source: feed filter, then conditional insert keyed
/// by (canonical link, source).
///
/// Returns the new article, or `None` when the entry was filtered out or the
/// key already exists. An existing article is skipped entirely: no content
/// refresh, no re-filter.
pub async fn ingest(
    entry: &NormalizedEntry,
    source_id: Uuid,
    feed: &ProcessedFeed,
    store: &dyn ArticleStore,
) -> Result<Option<Article>> {
    if !passes_filters(entry, feed, FilterUsage::FeedFilter) {
        debug!("filtered out: {}", entry.link);
        return Ok(None);
    }

    let article = Article {
        id: Uuid::new_v4(),
        feed_id: source_id,
        link: entry.link.clone(),
        title: entry.title.clone(),
        published_at: entry.published_at,
        content: entry.content.clone(),
        summary: None,
        summary_one_line: None,
        tag: None,
        summarized: false,
        custom_prompt: false,
        created_at: Utc::now(),
    };

    if store.insert_if_absent(article.clone()).await? {
        debug!("new article: {}", article.link);
        Ok(Some(article))
    } else {
        debug!("already stored: {}", article.link);
        Ok(None)
    }
}

/// Whether a freshly ingested entry should be summarized this cycle, given
/// how many summaries the cycle has already spent.
pub fn should_summarize(
    entry: &NormalizedEntry,
    feed: &ProcessedFeed,
    summarized_so_far: usize,
) -> bool {
    summarized_so_far < feed.articles_to_summarize_per_interval
        && passes_filters(entry, feed, FilterUsage::SummaryFilter)
}
