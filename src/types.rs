use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::filters::{Combinator, FilterGroup};

/// A single RSS/Atom source subscribed to by one or more processed feeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginalFeed {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub url: String,
    #[serde(default)]
    pub title: String,
    /// Freshness token from the last successful fetch, used for conditional
    /// requests and the minute-granularity not-modified heuristic.
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub valid: bool,
    /// Only the N most recently published entries per fetch cycle are kept.
    #[serde(default = "default_max_articles")]
    pub max_articles_to_keep: usize,
    #[serde(default)]
    pub quirks: SourceQuirks,
}

impl OriginalFeed {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            title: title.into(),
            last_modified: None,
            valid: true,
            max_articles_to_keep: default_max_articles(),
            quirks: SourceQuirks::default(),
        }
    }
}

/// Per-source deviations from standard feed behavior. Carried as explicit
/// configuration on the source rather than hard-coded host checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceQuirks {
    /// Which response header carries the freshness token. Some sources never
    /// set `Last-Modified` and only `Date` reflects their update time.
    #[serde(default)]
    pub freshness_header: FreshnessHeader,
    /// The source's "content" field actually carries description semantics.
    #[serde(default)]
    pub content_in_description: bool,
    /// The source already ships full article text; never fetch the page.
    #[serde(default)]
    pub skip_full_content: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessHeader {
    #[default]
    LastModified,
    Date,
}

impl FreshnessHeader {
    pub fn header_name(&self) -> &'static str {
        match self {
            FreshnessHeader::LastModified => "Last-Modified",
            FreshnessHeader::Date => "Date",
        }
    }
}

/// A named aggregation of original feeds with shared filtering, summarization
/// and digest configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedFeed {
    pub name: String,
    #[serde(default, rename = "source")]
    pub feeds: Vec<OriginalFeed>,
    #[serde(default, rename = "filter_group")]
    pub filter_groups: Vec<FilterGroup>,
    #[serde(default = "Combinator::any")]
    pub feed_group_relational_operator: Combinator,
    #[serde(default = "Combinator::any")]
    pub summary_group_relational_operator: Combinator,
    #[serde(default = "default_summarize_cap")]
    pub articles_to_summarize_per_interval: usize,
    /// Model used for per-article summaries. Unset means never summarize.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_language")]
    pub summary_language: String,
    /// Appended to the default summary prompt when set.
    #[serde(default)]
    pub additional_prompt: Option<String>,
    #[serde(default)]
    pub digest: DigestSettings,
    /// Aggregate freshness watermark: the earliest new token across sources,
    /// so a lagging source is never skipped.
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_digest: Option<DateTime<Utc>>,
}

impl ProcessedFeed {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            feeds: Vec::new(),
            filter_groups: Vec::new(),
            feed_group_relational_operator: Combinator::Any,
            summary_group_relational_operator: Combinator::Any,
            articles_to_summarize_per_interval: default_summarize_cap(),
            model: None,
            summary_language: default_language(),
            additional_prompt: None,
            digest: DigestSettings::default(),
            last_modified: None,
            last_digest: None,
        }
    }

    pub fn source_ids(&self) -> Vec<Uuid> {
        self.feeds.iter().map(|f| f.id).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestSettings {
    /// Scheduled digest runs skip disabled feeds; an explicitly named
    /// invocation still generates.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub frequency: DigestFrequency,
    #[serde(default = "default_true")]
    pub include_toc: bool,
    #[serde(default)]
    pub include_one_line_summary: bool,
    #[serde(default = "default_true")]
    pub include_summary: bool,
    #[serde(default)]
    pub include_content: bool,
    #[serde(default)]
    pub use_ai_digest: bool,
    #[serde(default)]
    pub send_full_article: bool,
    #[serde(default)]
    pub digest_model: Option<String>,
    #[serde(default)]
    pub additional_prompt: Option<String>,
}

impl Default for DigestSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: DigestFrequency::Daily,
            include_toc: true,
            include_one_line_summary: false,
            include_summary: true,
            include_content: false,
            use_ai_digest: false,
            send_full_article: false,
            digest_model: None,
            additional_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestFrequency {
    #[default]
    Daily,
    Weekly,
}

/// An ingested entry. The (link, original feed) pair is the dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: Uuid,
    pub feed_id: Uuid,
    /// Canonicalized link, unique per source.
    pub link: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
    pub content: String,
    pub summary: Option<String>,
    pub summary_one_line: Option<String>,
    pub tag: Option<String>,
    pub summarized: bool,
    /// Set when the summarization service returned something the structured
    /// parser could not read and the raw text was stored verbatim.
    pub custom_prompt: bool,
    pub created_at: DateTime<Utc>,
}

/// A rendered digest bound to a processed feed and a time window. Immutable
/// once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    pub id: Uuid,
    pub feed_name: String,
    pub content: String,
    pub start_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A raw entry as parsed from the wire, after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEntry {
    pub title: String,
    pub link: String,
    pub published_at: DateTime<Utc>,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_seconds: u64,
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_redirects: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrewError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("feed parse error: {0}")]
    Parse(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("processed feed not found: {name}")]
    FeedNotFound { name: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("summarization error: {0}")]
    Summarization(String),
}

pub type Result<T> = std::result::Result<T, BrewError>;

fn default_true() -> bool {
    true
}

fn default_max_articles() -> usize {
    100
}

fn default_summarize_cap() -> usize {
    5
}

fn default_language() -> String {
    "English".to_string()
}
