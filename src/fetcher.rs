//! Conditional feed fetching with per-source outcome classification.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rand::Rng;
use reqwest::header::{IF_MODIFIED_SINCE, USER_AGENT};
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::types::{BrewError, FetchConfig, OriginalFeed, Result};

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";
const MINUTE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Client identity is randomized per request to reduce blocking.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.3 Safari/605.1.15",
];

/// Classified result of one conditional fetch. Failures are data, not errors:
/// one bad source never aborts a batch.
#[derive(Debug)]
pub enum FetchOutcome {
    Updated {
        entries: Vec<feed_rs::model::Entry>,
        last_modified: Option<DateTime<Utc>>,
    },
    NotModified,
    Failed {
        reason: String,
    },
}

pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;
        Ok(Self { client })
    }

    /// Conditionally fetch one source feed and classify the outcome.
    pub async fn fetch(&self, source: &OriginalFeed) -> FetchOutcome {
        match self.try_fetch(source).await {
            Ok(outcome) => outcome,
            Err(e) => FetchOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }

    async fn try_fetch(&self, source: &OriginalFeed) -> Result<FetchOutcome> {
        let mut request = self
            .client
            .get(&source.url)
            .header(USER_AGENT, random_user_agent());
        if let Some(stored) = source.last_modified {
            request = request.header(IF_MODIFIED_SINCE, format_http_date(stored));
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return Ok(FetchOutcome::Failed {
                reason: format!("HTTP {}", status),
            });
        }

        let new_modified = response
            .headers()
            .get(source.quirks.freshness_header.header_name())
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);

        // Some sources answer 200 on every request while refreshing their
        // freshness header continuously; minute-granularity equality with the
        // stored token stands in for the 304 they never send.
        if let (Some(stored), Some(fresh)) = (source.last_modified, new_modified) {
            if same_minute(stored, fresh) {
                debug!("{} unchanged at minute granularity", source.url);
                return Ok(FetchOutcome::NotModified);
            }
        }

        let body = response.text().await?;
        let feed = feed_rs::parser::parse(body.as_bytes())
            .map_err(|e| BrewError::Parse(e.to_string()))?;
        debug!("{}: {} entries", source.url, feed.entries.len());

        Ok(FetchOutcome::Updated {
            entries: feed.entries,
            last_modified: new_modified,
        })
    }

    /// Fetch an article page for the full-content fallback. Same timeout
    /// bound as feed fetches.
    pub async fn fetch_full_content(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, random_user_agent())
            .send()
            .await?;
        Ok(response.error_for_status()?.text().await?)
    }
}

fn random_user_agent() -> &'static str {
    USER_AGENTS[rand::rng().random_range(0..USER_AGENTS.len())]
}

pub fn format_http_date(t: DateTime<Utc>) -> String {
    t.format(HTTP_DATE_FORMAT).to_string()
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), HTTP_DATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Freshness tokens compared at minute granularity.
fn same_minute(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.format(MINUTE_FORMAT).to_string() == b.format(MINUTE_FORMAT).to_string()
}
