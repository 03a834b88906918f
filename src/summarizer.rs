//! Summarization adapter over an OpenAI-compatible chat completion service.
//!
//! The service is opaque text-in/text-out. Structured output is requested as
//! JSON and validated on the way back; anything unparseable is kept verbatim
//! as a degraded-but-recorded summary. Summarization is always optional: no
//! credential or no model means no summary, never an error.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Article, BrewError, ProcessedFeed, Result};

const APPROX_BYTES_PER_TOKEN: usize = 4;

const JSON_SYSTEM_PROMPT: &str = "You are an assistant that summarizes articles. \
    Output a single plain-text JSON object starting with { and ending with }, with no \
    code fences or other markup, containing the keys summary_one_line, summary_long, \
    title and tag.";

const TEXT_SYSTEM_PROMPT: &str = "You are an assistant that summarizes article \
    content. Respond with plain text, without code fences.";

#[derive(Debug, Clone, Deserialize)]
pub struct SummaryConfig {
    /// Falls back to the OPENAI_API_KEY environment variable when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            timeout_seconds: default_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Structured summary; content is HTML-stripped before truncation.
    Json,
    /// Free text, for digest synthesis; content is passed through as-is.
    Text,
}

/// Per-article result of a structured summarization, selected by a
/// validating parse. Either branch is a recorded outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum SummaryOutcome {
    Structured(StructuredSummary),
    Raw(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StructuredSummary {
    pub summary_one_line: String,
    pub summary_long: String,
    pub title: String,
    pub tag: String,
}

/// Transport seam to the completion service.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, model: &str, system: &str, user: &str, json_mode: bool)
        -> Result<String>;
}

/// Backend speaking the OpenAI chat completions protocol.
pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiBackend {
    pub fn new(api_key: String, base_url: String, timeout_seconds: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
        json_mode: bool,
    ) -> Result<String> {
        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            response_format: json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!("completion request to {} (model {})", url, model);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrewError::Summarization(format!(
                "service returned {}: {}",
                status, body
            )));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BrewError::Summarization("empty completion response".to_string()))
    }
}

/// Canned backend for tests and dry runs.
pub struct MockBackend {
    response: String,
}

impl MockBackend {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    async fn complete(
        &self,
        _model: &str,
        _system: &str,
        _user: &str,
        _json_mode: bool,
    ) -> Result<String> {
        Ok(self.response.clone())
    }
}

pub struct Summarizer {
    backend: Option<Box<dyn CompletionBackend>>,
}

impl Summarizer {
    /// Builds the OpenAI backend when a credential is configured; otherwise
    /// every summarize call short-circuits to no summary.
    pub fn new(config: &SummaryConfig) -> Result<Self> {
        let backend = match config.api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => Some(Box::new(OpenAiBackend::new(
                key.to_string(),
                config.base_url.clone(),
                config.timeout_seconds,
            )?) as Box<dyn CompletionBackend>),
            None => None,
        };
        Ok(Self { backend })
    }

    pub fn with_backend(backend: Box<dyn CompletionBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// Request a summary of `content`. Returns `None` without error when the
    /// service or model is unconfigured.
    pub async fn summarize(
        &self,
        content: &str,
        model: Option<&str>,
        prompt: &str,
        mode: OutputMode,
    ) -> Result<Option<String>> {
        let Some(backend) = &self.backend else {
            warn!("summarization service not configured, skipping summary");
            return Ok(None);
        };
        let Some(model) = model.filter(|m| !m.is_empty()) else {
            warn!("no model selected, skipping summary");
            return Ok(None);
        };

        let truncated = truncate_to_budget(content, model, mode == OutputMode::Json);
        let system = match mode {
            OutputMode::Json => JSON_SYSTEM_PROMPT,
            OutputMode::Text => TEXT_SYSTEM_PROMPT,
        };
        let user = format!("<prompt> {prompt} </prompt>\n<article> {truncated} </article>");

        let raw = backend
            .complete(model, system, &user, mode == OutputMode::Json)
            .await?;
        Ok(Some(strip_think_tags(&raw).trim().to_string()))
    }

    /// Summarize one article in place. Returns whether a summary was
    /// recorded. Already-summarized articles are never re-summarized.
    pub async fn summarize_article(
        &self,
        article: &mut Article,
        feed: &ProcessedFeed,
    ) -> Result<bool> {
        if article.summarized {
            return Ok(false);
        }

        let mut prompt = default_summary_prompt(&feed.summary_language);
        if let Some(extra) = &feed.additional_prompt {
            prompt.push(' ');
            prompt.push_str(extra);
        }

        let Some(raw) = self
            .summarize(
                &article.content,
                feed.model.as_deref(),
                &prompt,
                OutputMode::Json,
            )
            .await?
        else {
            return Ok(false);
        };

        match parse_summary(&raw) {
            SummaryOutcome::Structured(s) => {
                article.summary = Some(s.summary_long);
                article.summary_one_line = Some(s.summary_one_line);
                article.title = s.title;
                article.tag = Some(s.tag);
                article.summarized = true;
                article.custom_prompt = false;
            }
            SummaryOutcome::Raw(text) => {
                article.summary = Some(text);
                article.summarized = true;
                article.custom_prompt = true;
            }
        }
        Ok(true)
    }
}

/// Validating parse of the service response: structured when it is the
/// expected JSON object, raw text otherwise.
pub fn parse_summary(raw: &str) -> SummaryOutcome {
    match serde_json::from_str::<StructuredSummary>(raw.trim()) {
        Ok(structured) => SummaryOutcome::Structured(structured),
        Err(_) => SummaryOutcome::Raw(raw.to_string()),
    }
}

/// Token budget per model, in tokens. Unknown models get the generous
/// default.
pub fn token_budget(model: &str) -> usize {
    match model {
        "gpt-3.5-turbo" => 16_200,
        "gpt-4o" | "gpt-4-turbo" | "gpt-4o-mini" => 127_800,
        _ => 127_800,
    }
}

/// Cut `text` down to the model's budget, approximating 4 bytes per token
/// and always cutting at a char boundary.
pub fn truncate_to_budget(text: &str, model: &str, strip_html_first: bool) -> String {
    let cleaned = if strip_html_first {
        strip_html(text)
    } else {
        text.to_string()
    };
    let budget = token_budget(model) * APPROX_BYTES_PER_TOKEN;
    if cleaned.len() <= budget {
        return cleaned;
    }
    let mut end = budget;
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    cleaned[..end].to_string()
}

/// Extract readable text from HTML, dropping non-content subtrees.
pub fn strip_html(html: &str) -> String {
    const DROPPED_TAGS: &[&str] = &[
        "script", "style", "img", "a", "video", "audio", "iframe", "input",
    ];

    fn walk(node: ego_tree::NodeRef<'_, scraper::Node>, out: &mut String) {
        match node.value() {
            scraper::Node::Text(text) => out.push_str(&text),
            scraper::Node::Element(el) => {
                if DROPPED_TAGS.contains(&el.name()) {
                    return;
                }
                for child in node.children() {
                    walk(child, out);
                }
                out.push(' ');
            }
            _ => {
                for child in node.children() {
                    walk(child, out);
                }
            }
        }
    }

    let doc = scraper::Html::parse_document(html);
    let mut out = String::new();
    walk(doc.tree.root(), &mut out);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove `<think>…</think>` segments some reasoning models prepend.
pub fn strip_think_tags(text: &str) -> String {
    const START: &str = "<think>";
    const END: &str = "</think>";
    let mut out = text.to_string();
    loop {
        let Some(start) = out.find(START) else { break };
        let Some(end) = out[start..].find(END) else { break };
        out.replace_range(start..start + end + END.len(), "");
    }
    out
}

pub fn default_summary_prompt(language: &str) -> String {
    format!(
        "Summarize this article and output only a JSON object. The first item is a \
         one-line summary of at most 15 words named 'summary_one_line', the second is a \
         summary of at most 150 words named 'summary_long', the third is the article \
         title translated into the output language named 'title', and the fourth is a \
         single topic tag named 'tag'. Write the result in {language}."
    )
}

pub fn default_digest_prompt(language: &str) -> String {
    format!(
        "These are the recent articles from the feed. Summarize the important points \
         in one paragraph with concrete details rather than a list of titles, \
         referencing the original article links where relevant. Write the result in \
         {language}."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn article(content: &str) -> Article {
        Article {
            id: Uuid::new_v4(),
            feed_id: Uuid::new_v4(),
            link: "https://x.com/a".to_string(),
            title: "original title".to_string(),
            published_at: Utc::now(),
            content: content.to_string(),
            summary: None,
            summary_one_line: None,
            tag: None,
            summarized: false,
            custom_prompt: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn parse_selects_structured_branch() {
        let raw = r#"{"summary_one_line": "short", "summary_long": "long", "title": "t", "tag": "news"}"#;
        match parse_summary(raw) {
            SummaryOutcome::Structured(s) => {
                assert_eq!(s.summary_one_line, "short");
                assert_eq!(s.tag, "news");
            }
            SummaryOutcome::Raw(_) => panic!("expected structured"),
        }
    }

    #[test]
    fn parse_falls_back_to_raw() {
        assert_eq!(
            parse_summary("Sorry, error"),
            SummaryOutcome::Raw("Sorry, error".to_string())
        );
        // A JSON object missing required keys is not structured either.
        assert_eq!(
            parse_summary(r#"{"summary_one_line": "only"}"#),
            SummaryOutcome::Raw(r#"{"summary_one_line": "only"}"#.to_string())
        );
    }

    #[test]
    fn think_tags_are_removed() {
        let raw = "<think>step one</think>answer<think>more</think>";
        assert_eq!(strip_think_tags(raw), "answer");
        assert_eq!(strip_think_tags("plain"), "plain");
    }

    #[test]
    fn budgets_per_model() {
        assert_eq!(token_budget("gpt-3.5-turbo"), 16_200);
        assert_eq!(token_budget("gpt-4o"), 127_800);
        assert_eq!(token_budget("some-new-model"), 127_800);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // Budget for gpt-3.5-turbo is 64 800 bytes; é is two bytes, so the
        // cut lands mid-char without the boundary backoff.
        let text = "é".repeat(40_000);
        let truncated = truncate_to_budget(&text, "gpt-3.5-turbo", false);
        assert!(truncated.len() <= 64_800);
        assert!(truncated.chars().all(|c| c == 'é'));
    }

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_to_budget("hello", "gpt-4o", false), "hello");
    }

    #[test]
    fn html_is_stripped_for_json_mode() {
        let html = "<p>keep this</p><script>drop()</script><a href=\"x\">drop too</a>";
        assert_eq!(strip_html(html), "keep this");
    }

    #[tokio::test]
    async fn structured_response_fills_all_fields() {
        let summarizer = Summarizer::with_backend(Box::new(MockBackend::new(
            r#"{"summary_one_line": "one", "summary_long": "long", "title": "translated", "tag": "tech"}"#,
        )));
        let mut feed = ProcessedFeed::new("t");
        feed.model = Some("gpt-4o-mini".to_string());

        let mut a = article("body");
        assert!(summarizer.summarize_article(&mut a, &feed).await.unwrap());
        assert_eq!(a.summary.as_deref(), Some("long"));
        assert_eq!(a.summary_one_line.as_deref(), Some("one"));
        assert_eq!(a.title, "translated");
        assert_eq!(a.tag.as_deref(), Some("tech"));
        assert!(a.summarized);
        assert!(!a.custom_prompt);
    }

    #[tokio::test]
    async fn malformed_response_is_stored_verbatim() {
        let summarizer = Summarizer::with_backend(Box::new(MockBackend::new("Sorry, error")));
        let mut feed = ProcessedFeed::new("t");
        feed.model = Some("gpt-4o-mini".to_string());

        let mut a = article("body");
        assert!(summarizer.summarize_article(&mut a, &feed).await.unwrap());
        assert_eq!(a.summary.as_deref(), Some("Sorry, error"));
        assert!(a.summarized);
        assert!(a.custom_prompt);
        assert_eq!(a.title, "original title");
    }

    #[tokio::test]
    async fn unconfigured_service_skips_without_error() {
        let summarizer = Summarizer::new(&SummaryConfig::default()).unwrap();
        let mut feed = ProcessedFeed::new("t");
        feed.model = Some("gpt-4o".to_string());

        let mut a = article("body");
        assert!(!summarizer.summarize_article(&mut a, &feed).await.unwrap());
        assert!(!a.summarized);
        assert!(a.summary.is_none());
    }

    #[tokio::test]
    async fn unset_model_skips_without_error() {
        let summarizer = Summarizer::with_backend(Box::new(MockBackend::new("ignored")));
        let feed = ProcessedFeed::new("t");

        let mut a = article("body");
        assert!(!summarizer.summarize_article(&mut a, &feed).await.unwrap());
        assert!(!a.summarized);
    }

    #[tokio::test]
    async fn summarized_article_is_never_redone() {
        let summarizer = Summarizer::with_backend(Box::new(MockBackend::new("ignored")));
        let mut feed = ProcessedFeed::new("t");
        feed.model = Some("gpt-4o".to_string());

        let mut a = article("body");
        a.summarized = true;
        a.summary = Some("kept".to_string());
        assert!(!summarizer.summarize_article(&mut a, &feed).await.unwrap());
        assert_eq!(a.summary.as_deref(), Some("kept"));
    }
}
