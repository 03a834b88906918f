//! Drives the per-processed-feed cycle: fetch each source, merge entries in
//! global recency order, ingest + filter + summarize under the per-interval
//! cap, update the freshness watermark. Also hosts the digest and cleanup
//! operations and the command surface the external trigger invokes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::digest;
use crate::fetcher::{FetchOutcome, Fetcher};
use crate::ingest;
use crate::normalizer;
use crate::store::ArticleStore;
use crate::summarizer::{self, OutputMode, Summarizer, SummaryConfig};
use crate::types::{
    BrewError, Digest, FetchConfig, NormalizedEntry, ProcessedFeed, Result,
};

/// Operation requested by the operator or the external scheduler.
#[derive(Debug, Clone)]
pub enum Command {
    Update { name: Option<String> },
    Digest { name: Option<String>, force: bool },
    Clean { name: Option<String> },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UpdateStats {
    pub sources_updated: usize,
    pub sources_unchanged: usize,
    pub sources_failed: usize,
    pub entries_considered: usize,
    pub articles_ingested: usize,
    pub articles_summarized: usize,
}

pub struct Brewer {
    fetcher: Fetcher,
    summarizer: Summarizer,
    store: Arc<dyn ArticleStore>,
    webhook_url: Option<String>,
    webhook_client: Client,
}

impl Brewer {
    pub fn new(
        fetch_config: FetchConfig,
        summary_config: &SummaryConfig,
        store: Arc<dyn ArticleStore>,
        webhook_url: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            fetcher: Fetcher::new(fetch_config)?,
            summarizer: Summarizer::new(summary_config)?,
            store,
            webhook_url,
            webhook_client: Client::new(),
        })
    }

    /// Swap in a different summarizer, e.g. one with a canned backend.
    pub fn with_summarizer(mut self, summarizer: Summarizer) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn store(&self) -> &Arc<dyn ArticleStore> {
        &self.store
    }

    /// Entry point for the trigger surface. An unknown feed name fails only
    /// this invocation; batch runs isolate per-feed errors.
    pub async fn run(&self, feeds: &mut [ProcessedFeed], command: Command) -> Result<()> {
        match command {
            Command::Update { name: Some(name) } => {
                let feed = find_feed_mut(feeds, &name)?;
                self.update_feed(feed).await?;
                Ok(())
            }
            Command::Update { name: None } => {
                for feed in feeds.iter_mut() {
                    if let Err(e) = self.update_feed(feed).await {
                        error!("failed to update feed {}: {}", feed.name, e);
                    }
                }
                Ok(())
            }
            Command::Digest { name: Some(name), force } => {
                let feed = find_feed_mut(feeds, &name)?;
                self.generate_digest(feed, force).await?;
                Ok(())
            }
            Command::Digest { name: None, force } => {
                for feed in feeds.iter_mut().filter(|f| f.digest.enabled) {
                    if let Err(e) = self.generate_digest(feed, force).await {
                        error!("failed to generate digest for {}: {}", feed.name, e);
                    }
                }
                Ok(())
            }
            Command::Clean { name: Some(name) } => {
                let feed = find_feed_mut(feeds, &name)?;
                self.clean_old_articles(feed).await?;
                Ok(())
            }
            Command::Clean { name: None } => {
                for feed in feeds.iter() {
                    if let Err(e) = self.clean_old_articles(feed).await {
                        error!("failed to clean articles for {}: {}", feed.name, e);
                    }
                }
                Ok(())
            }
        }
    }

    /// One full update cycle for a processed feed. Sources are fetched
    /// sequentially; a failing source never aborts its siblings.
    pub async fn update_feed(&self, feed: &mut ProcessedFeed) -> Result<UpdateStats> {
        info!("updating feed {}", feed.name);
        let mut outcomes = Vec::with_capacity(feed.feeds.len());
        for source in &feed.feeds {
            debug!("fetching {}", source.url);
            outcomes.push((source.id, self.fetcher.fetch(source).await));
        }
        let stats = self.process_cycle(feed, outcomes).await?;
        info!(
            "feed {}: {} updated / {} unchanged / {} failed sources, {} entries, {} ingested, {} summarized",
            feed.name,
            stats.sources_updated,
            stats.sources_unchanged,
            stats.sources_failed,
            stats.entries_considered,
            stats.articles_ingested,
            stats.articles_summarized,
        );
        Ok(stats)
    }

    /// The merge + ingest half of the cycle, fed with per-source fetch
    /// outcomes.
    pub async fn process_cycle(
        &self,
        feed: &mut ProcessedFeed,
        outcomes: Vec<(Uuid, FetchOutcome)>,
    ) -> Result<UpdateStats> {
        let mut stats = UpdateStats::default();
        let mut min_new_modified: Option<DateTime<Utc>> = None;
        let mut pending: Vec<(Uuid, Vec<feed_rs::model::Entry>)> = Vec::new();

        for (source_id, outcome) in outcomes {
            let Some(source) = feed.feeds.iter_mut().find(|s| s.id == source_id) else {
                continue;
            };
            match outcome {
                FetchOutcome::Updated { entries, last_modified } => {
                    source.valid = true;
                    if let Some(fresh) = last_modified {
                        source.last_modified = Some(fresh);
                        // Earliest new token wins so a lagging source is
                        // never skipped on the next cycle.
                        min_new_modified = Some(match min_new_modified {
                            Some(current) if current <= fresh => current,
                            _ => fresh,
                        });
                    }
                    stats.sources_updated += 1;
                    pending.push((source_id, entries));
                }
                FetchOutcome::NotModified => {
                    source.valid = true;
                    stats.sources_unchanged += 1;
                    debug!("source {} not modified", source.url);
                }
                FetchOutcome::Failed { reason } => {
                    source.valid = false;
                    stats.sources_failed += 1;
                    error!("failed to fetch source {}: {}", source.url, reason);
                }
            }
        }

        if let Some(watermark) = min_new_modified {
            feed.last_modified = Some(watermark);
        }

        let mut merged: Vec<(NormalizedEntry, Uuid)> = Vec::new();
        for (source_id, entries) in pending {
            let Some(source) = feed.feeds.iter().find(|s| s.id == source_id) else {
                continue;
            };
            let mut normalized = Vec::with_capacity(entries.len());
            for entry in &entries {
                normalized.push(normalizer::normalize(entry, source, &self.fetcher).await);
            }
            let capped = ingest::cap_most_recent(normalized, source.max_articles_to_keep);
            merged.extend(capped.into_iter().map(|e| (e, source_id)));
        }
        let merged = ingest::merge_by_recency(merged);
        stats.entries_considered = merged.len();

        for (entry, source_id) in &merged {
            if let Err(e) = self.process_entry(entry, *source_id, feed, &mut stats).await {
                error!("failed to process entry {}: {}", entry.link, e);
            }
        }

        Ok(stats)
    }

    async fn process_entry(
        &self,
        entry: &NormalizedEntry,
        source_id: Uuid,
        feed: &ProcessedFeed,
        stats: &mut UpdateStats,
    ) -> Result<()> {
        let Some(mut article) =
            ingest::ingest(entry, source_id, feed, self.store.as_ref()).await?
        else {
            return Ok(());
        };
        stats.articles_ingested += 1;

        if ingest::should_summarize(entry, feed, stats.articles_summarized) {
            match self.summarizer.summarize_article(&mut article, feed).await {
                Ok(true) => {
                    self.store.update(&article).await?;
                    stats.articles_summarized += 1;
                    info!("summarized: {}", article.title);
                }
                Ok(false) => {}
                // A summarization failure degrades to an unsummarized
                // article; ingestion already happened.
                Err(e) => warn!("summarization failed for {}: {}", article.link, e),
            }
        }
        Ok(())
    }

    pub async fn generate_digest(
        &self,
        feed: &mut ProcessedFeed,
        force: bool,
    ) -> Result<Option<Digest>> {
        self.generate_digest_at(feed, force, Utc::now()).await
    }

    /// Generate a digest at an explicit point in time, honoring the
    /// staleness gate unless forced.
    pub async fn generate_digest_at(
        &self,
        feed: &mut ProcessedFeed,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Digest>> {
        if !digest::is_due(feed, now, force) {
            debug!("digest for {} not due yet", feed.name);
            return Ok(None);
        }
        let start = digest::window_start(feed, now, force);
        let articles = self
            .store
            .articles_in_window(&feed.source_ids(), start, now)
            .await?;
        if articles.is_empty() {
            info!("no new articles for {} since last digest", feed.name);
            return Ok(None);
        }

        let mut content = digest::compose(&articles, feed, start, now);

        if feed.digest.use_ai_digest {
            let query = digest::ai_digest_query(&articles, feed.digest.send_full_article);
            let model = feed.digest.digest_model.as_deref();
            let query = match model {
                Some(m) => summarizer::truncate_to_budget(&query, m, true),
                None => query,
            };
            let prompt = feed
                .digest
                .additional_prompt
                .clone()
                .unwrap_or_else(|| summarizer::default_digest_prompt(&feed.summary_language));
            match self
                .summarizer
                .summarize(&query, model, &prompt, OutputMode::Text)
                .await
            {
                Ok(Some(ai_text)) => {
                    content = format!("## AI Digest\n{}\n\n{}", ai_text, content);
                }
                Ok(None) => {}
                // The base digest still goes out.
                Err(e) => warn!("AI digest failed for {}: {}", feed.name, e),
            }
        }

        let record = Digest {
            id: Uuid::new_v4(),
            feed_name: feed.name.clone(),
            content: content.clone(),
            start_time: start,
            created_at: now,
        };
        self.store.insert_digest(record.clone()).await?;

        if let Some(url) = &self.webhook_url {
            digest::push_webhook(&self.webhook_client, url, &content).await;
        }

        feed.last_digest = Some(now);
        info!("digest for {} created", feed.name);
        Ok(Some(record))
    }

    /// Prune each source's stored articles down to its keep limit.
    pub async fn clean_old_articles(&self, feed: &ProcessedFeed) -> Result<usize> {
        let mut removed = 0;
        for source in &feed.feeds {
            removed += self
                .store
                .prune_source(source.id, source.max_articles_to_keep)
                .await?;
        }
        if removed > 0 {
            info!("removed {} old articles from {}", removed, feed.name);
        }
        Ok(removed)
    }
}

fn find_feed_mut<'a>(
    feeds: &'a mut [ProcessedFeed],
    name: &str,
) -> Result<&'a mut ProcessedFeed> {
    feeds
        .iter_mut()
        .find(|f| f.name == name)
        .ok_or_else(|| BrewError::FeedNotFound {
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::parse_http_date;
    use crate::store::MemoryStore;
    use crate::summarizer::MockBackend;
    use crate::types::OriginalFeed;
    use chrono::{Duration, TimeZone};

    const THREE_ITEM_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>src</title>
<item><title>newest</title><link>https://src.example/3</link>
  <description>third body</description>
  <pubDate>Wed, 03 Jan 2024 00:00:00 GMT</pubDate></item>
<item><title>middle</title><link>https://src.example/2</link>
  <description>second body</description>
  <pubDate>Tue, 02 Jan 2024 00:00:00 GMT</pubDate></item>
<item><title>oldest</title><link>https://src.example/1</link>
  <description>first body</description>
  <pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate></item>
</channel></rss>"#;

    fn entries_from(xml: &str) -> Vec<feed_rs::model::Entry> {
        feed_rs::parser::parse(xml.as_bytes()).unwrap().entries
    }

    fn brewer(store: Arc<dyn ArticleStore>) -> Brewer {
        Brewer::new(
            FetchConfig::default(),
            &SummaryConfig::default(),
            store,
            None,
        )
        .unwrap()
    }

    fn feed_with_source() -> (ProcessedFeed, Uuid) {
        let mut feed = ProcessedFeed::new("cycle-test");
        let mut source = OriginalFeed::new("https://src.example/feed", "src");
        source.quirks.skip_full_content = true;
        let id = source.id;
        feed.feeds.push(source);
        (feed, id)
    }

    #[tokio::test]
    async fn not_modified_contributes_nothing_and_marks_valid() {
        let store = Arc::new(MemoryStore::new());
        let brewer = brewer(store.clone());
        let (mut feed, source_id) = feed_with_source();
        feed.feeds[0].valid = false;
        let token = parse_http_date("Mon, 01 Jan 2024 00:00:00 GMT").unwrap();
        feed.feeds[0].last_modified = Some(token);

        let stats = brewer
            .process_cycle(&mut feed, vec![(source_id, FetchOutcome::NotModified)])
            .await
            .unwrap();

        assert!(feed.feeds[0].valid);
        assert_eq!(stats.entries_considered, 0);
        assert_eq!(store.count_for_source(source_id).await.unwrap(), 0);
        assert_eq!(feed.feeds[0].last_modified, Some(token));
        assert_eq!(feed.last_modified, None);
    }

    #[tokio::test]
    async fn failed_source_is_marked_invalid_but_cycle_continues() {
        let store = Arc::new(MemoryStore::new());
        let brewer = brewer(store.clone());
        let (mut feed, bad_id) = feed_with_source();
        let mut good = OriginalFeed::new("https://good.example/feed", "good");
        good.quirks.skip_full_content = true;
        let good_id = good.id;
        feed.feeds.push(good);

        let stats = brewer
            .process_cycle(
                &mut feed,
                vec![
                    (
                        bad_id,
                        FetchOutcome::Failed {
                            reason: "HTTP 500".to_string(),
                        },
                    ),
                    (
                        good_id,
                        FetchOutcome::Updated {
                            entries: entries_from(THREE_ITEM_RSS),
                            last_modified: None,
                        },
                    ),
                ],
            )
            .await
            .unwrap();

        assert!(!feed.feeds[0].valid);
        assert!(feed.feeds[1].valid);
        assert_eq!(stats.sources_failed, 1);
        assert_eq!(stats.articles_ingested, 3);
        assert_eq!(store.count_for_source(good_id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn rerun_does_not_duplicate_articles() {
        let store = Arc::new(MemoryStore::new());
        let brewer = brewer(store.clone());
        let (mut feed, source_id) = feed_with_source();

        for _ in 0..2 {
            brewer
                .process_cycle(
                    &mut feed,
                    vec![(
                        source_id,
                        FetchOutcome::Updated {
                            entries: entries_from(THREE_ITEM_RSS),
                            last_modified: None,
                        },
                    )],
                )
                .await
                .unwrap();
        }
        assert_eq!(store.count_for_source(source_id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn per_source_cap_keeps_most_recent() {
        let store = Arc::new(MemoryStore::new());
        let brewer = brewer(store.clone());
        let (mut feed, source_id) = feed_with_source();
        feed.feeds[0].max_articles_to_keep = 2;

        let stats = brewer
            .process_cycle(
                &mut feed,
                vec![(
                    source_id,
                    FetchOutcome::Updated {
                        entries: entries_from(THREE_ITEM_RSS),
                        last_modified: None,
                    },
                )],
            )
            .await
            .unwrap();

        assert_eq!(stats.entries_considered, 2);
        assert!(store
            .get(source_id, "https://src.example/3")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get(source_id, "https://src.example/1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn watermark_takes_earliest_new_token() {
        let store = Arc::new(MemoryStore::new());
        let brewer = brewer(store.clone());
        let (mut feed, first_id) = feed_with_source();
        let mut second = OriginalFeed::new("https://second.example/feed", "second");
        second.quirks.skip_full_content = true;
        let second_id = second.id;
        feed.feeds.push(second);

        let earlier = parse_http_date("Mon, 01 Jan 2024 00:00:00 GMT").unwrap();
        let later = parse_http_date("Tue, 02 Jan 2024 00:00:00 GMT").unwrap();

        brewer
            .process_cycle(
                &mut feed,
                vec![
                    (
                        first_id,
                        FetchOutcome::Updated {
                            entries: Vec::new(),
                            last_modified: Some(later),
                        },
                    ),
                    (
                        second_id,
                        FetchOutcome::Updated {
                            entries: Vec::new(),
                            last_modified: Some(earlier),
                        },
                    ),
                ],
            )
            .await
            .unwrap();

        assert_eq!(feed.last_modified, Some(earlier));
        assert_eq!(feed.feeds[0].last_modified, Some(later));
        assert_eq!(feed.feeds[1].last_modified, Some(earlier));
    }

    #[tokio::test]
    async fn summarization_cap_is_enforced_per_cycle() {
        let store = Arc::new(MemoryStore::new());
        let brewer = brewer(store.clone()).with_summarizer(Summarizer::with_backend(Box::new(
            MockBackend::new(
                r#"{"summary_one_line": "o", "summary_long": "l", "title": "t", "tag": "g"}"#,
            ),
        )));
        let (mut feed, source_id) = feed_with_source();
        feed.model = Some("gpt-4o-mini".to_string());
        feed.articles_to_summarize_per_interval = 2;

        let stats = brewer
            .process_cycle(
                &mut feed,
                vec![(
                    source_id,
                    FetchOutcome::Updated {
                        entries: entries_from(THREE_ITEM_RSS),
                        last_modified: None,
                    },
                )],
            )
            .await
            .unwrap();

        assert_eq!(stats.articles_ingested, 3);
        assert_eq!(stats.articles_summarized, 2);

        // The two most recent entries got the summaries.
        let newest = store
            .get(source_id, "https://src.example/3")
            .await
            .unwrap()
            .unwrap();
        let oldest = store
            .get(source_id, "https://src.example/1")
            .await
            .unwrap()
            .unwrap();
        assert!(newest.summarized);
        assert!(!oldest.summarized);
    }

    #[tokio::test]
    async fn digest_gate_and_generation() {
        let store = Arc::new(MemoryStore::new());
        let brewer = brewer(store.clone());
        let (mut feed, source_id) = feed_with_source();
        feed.digest.enabled = true;

        // Seed one article inside the window.
        let t0 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        brewer
            .process_cycle(
                &mut feed,
                vec![(
                    source_id,
                    FetchOutcome::Updated {
                        entries: entries_from(THREE_ITEM_RSS),
                        last_modified: None,
                    },
                )],
            )
            .await
            .unwrap();

        feed.last_digest = Some(t0);
        let too_soon = brewer
            .generate_digest_at(&mut feed, false, t0 + Duration::hours(6))
            .await
            .unwrap();
        assert!(too_soon.is_none());
        assert_eq!(feed.last_digest, Some(t0));

        // Forced generation ignores the gate; window reaches back far enough
        // to pick up the January articles.
        let forced_at = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
        let produced = brewer
            .generate_digest_at(&mut feed, true, forced_at)
            .await
            .unwrap()
            .expect("digest");
        assert!(produced.content.contains("newest"));
        assert_eq!(feed.last_digest, Some(forced_at));
        assert_eq!(
            store.digests_for_feed("cycle-test").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn empty_window_produces_no_digest() {
        let store = Arc::new(MemoryStore::new());
        let brewer = brewer(store.clone());
        let (mut feed, _) = feed_with_source();
        feed.digest.enabled = true;

        let produced = brewer.generate_digest(&mut feed, true).await.unwrap();
        assert!(produced.is_none());
        assert!(feed.last_digest.is_none());
    }

    #[tokio::test]
    async fn unknown_feed_name_is_an_explicit_error() {
        let store = Arc::new(MemoryStore::new());
        let brewer = brewer(store);
        let mut feeds = vec![ProcessedFeed::new("known")];

        let err = brewer
            .run(
                &mut feeds,
                Command::Update {
                    name: Some("missing".to_string()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrewError::FeedNotFound { .. }));
    }

    #[tokio::test]
    async fn clean_respects_keep_limit() {
        let store = Arc::new(MemoryStore::new());
        let brewer = brewer(store.clone());
        let (mut feed, source_id) = feed_with_source();

        brewer
            .process_cycle(
                &mut feed,
                vec![(
                    source_id,
                    FetchOutcome::Updated {
                        entries: entries_from(THREE_ITEM_RSS),
                        last_modified: None,
                    },
                )],
            )
            .await
            .unwrap();

        feed.feeds[0].max_articles_to_keep = 1;
        let removed = brewer.clean_old_articles(&feed).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count_for_source(source_id).await.unwrap(), 1);
        assert!(store
            .get(source_id, "https://src.example/3")
            .await
            .unwrap()
            .is_some());
    }
}
