//! Storage seam for articles and digests.
//!
//! Persistence is a collaborator of the pipeline, not part of it. The trait
//! mirrors what a relational backend provides; `insert_if_absent` is the
//! conditional insert that enforces the (link, source) uniqueness invariant
//! even when two cycles touch the same source.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::{Article, Digest, Result};

#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Insert unless an article with the same (source, canonical link) key
    /// exists. Returns whether the insert happened; first write wins.
    async fn insert_if_absent(&self, article: Article) -> Result<bool>;

    async fn get(&self, feed_id: Uuid, link: &str) -> Result<Option<Article>>;

    /// Persist updated summary fields of an existing article.
    async fn update(&self, article: &Article) -> Result<()>;

    /// Articles from the given sources published in [start, end), grouped by
    /// source (in the order given) and newest-first within a source.
    async fn articles_in_window(
        &self,
        feed_ids: &[Uuid],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Article>>;

    async fn count_for_source(&self, feed_id: Uuid) -> Result<usize>;

    /// Drop all but the `keep` most recently published articles of a source.
    /// Returns how many were removed.
    async fn prune_source(&self, feed_id: Uuid, keep: usize) -> Result<usize>;

    async fn insert_digest(&self, digest: Digest) -> Result<()>;

    async fn digests_for_feed(&self, feed_name: &str) -> Result<Vec<Digest>>;
}

/// In-memory store backing the CLI and tests. A database-backed
/// implementation drops in behind the same trait.
#[derive(Default)]
pub struct MemoryStore {
    articles: RwLock<HashMap<(Uuid, String), Article>>,
    digests: RwLock<Vec<Digest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn insert_if_absent(&self, article: Article) -> Result<bool> {
        let mut articles = self.articles.write().await;
        let key = (article.feed_id, article.link.clone());
        if articles.contains_key(&key) {
            return Ok(false);
        }
        articles.insert(key, article);
        Ok(true)
    }

    async fn get(&self, feed_id: Uuid, link: &str) -> Result<Option<Article>> {
        let articles = self.articles.read().await;
        Ok(articles.get(&(feed_id, link.to_string())).cloned())
    }

    async fn update(&self, article: &Article) -> Result<()> {
        let mut articles = self.articles.write().await;
        articles.insert((article.feed_id, article.link.clone()), article.clone());
        Ok(())
    }

    async fn articles_in_window(
        &self,
        feed_ids: &[Uuid],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Article>> {
        let articles = self.articles.read().await;
        let mut selected: Vec<Article> = articles
            .values()
            .filter(|a| {
                feed_ids.contains(&a.feed_id) && a.published_at >= start && a.published_at < end
            })
            .cloned()
            .collect();
        selected.sort_by(|a, b| {
            let pos = |id: Uuid| feed_ids.iter().position(|f| *f == id).unwrap_or(usize::MAX);
            pos(a.feed_id)
                .cmp(&pos(b.feed_id))
                .then_with(|| b.published_at.cmp(&a.published_at))
        });
        Ok(selected)
    }

    async fn count_for_source(&self, feed_id: Uuid) -> Result<usize> {
        let articles = self.articles.read().await;
        Ok(articles.keys().filter(|(id, _)| *id == feed_id).count())
    }

    async fn prune_source(&self, feed_id: Uuid, keep: usize) -> Result<usize> {
        let mut articles = self.articles.write().await;
        let mut of_source: Vec<(String, DateTime<Utc>)> = articles
            .iter()
            .filter(|((id, _), _)| *id == feed_id)
            .map(|((_, link), a)| (link.clone(), a.published_at))
            .collect();
        if of_source.len() <= keep {
            return Ok(0);
        }
        of_source.sort_by(|a, b| b.1.cmp(&a.1));
        let stale: Vec<String> = of_source.split_off(keep).into_iter().map(|(l, _)| l).collect();
        let removed = stale.len();
        for link in stale {
            articles.remove(&(feed_id, link));
        }
        Ok(removed)
    }

    async fn insert_digest(&self, digest: Digest) -> Result<()> {
        self.digests.write().await.push(digest);
        Ok(())
    }

    async fn digests_for_feed(&self, feed_name: &str) -> Result<Vec<Digest>> {
        let digests = self.digests.read().await;
        Ok(digests
            .iter()
            .filter(|d| d.feed_name == feed_name)
            .cloned()
            .collect())
    }
}
