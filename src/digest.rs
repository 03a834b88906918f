//! Digest assembly: staleness gating, section rendering, AI synthesis query,
//! webhook delivery.

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{Article, DigestFrequency, ProcessedFeed};

/// Minimum elapsed time since the last digest before a new one is due. The
/// half-day grace below the nominal period absorbs scheduler jitter.
pub fn staleness_threshold(frequency: DigestFrequency) -> Duration {
    match frequency {
        DigestFrequency::Daily => Duration::hours(12),
        DigestFrequency::Weekly => Duration::hours(156),
    }
}

/// Whether a digest is due: forced, never generated, or past the threshold.
pub fn is_due(feed: &ProcessedFeed, now: DateTime<Utc>, force: bool) -> bool {
    if force {
        return true;
    }
    match feed.last_digest {
        None => true,
        Some(last) => now - last > staleness_threshold(feed.digest.frequency),
    }
}

/// Start of the article window for a digest generated at `now`. Forced and
/// first-time digests reach back one threshold plus the grace margin.
pub fn window_start(feed: &ProcessedFeed, now: DateTime<Utc>, force: bool) -> DateTime<Utc> {
    match feed.last_digest {
        Some(last) if !force => last,
        _ => now - staleness_threshold(feed.digest.frequency) - Duration::hours(12),
    }
}

/// Render the digest body from the window's articles.
///
/// Sections toggle independently: the table of contents appears when asked
/// for or when one-line summaries exist to show; the detail section when
/// content is requested or when long summaries exist to show.
pub fn compose(
    articles: &[Article],
    feed: &ProcessedFeed,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> String {
    let settings = &feed.digest;
    let mut out = String::new();

    out.push_str(&format!("# {} {}\n", feed.name, end.format("%Y%m%d")));
    out.push_str(&format!(
        "> Window: {} to {}\n",
        start.format("%Y-%m-%d %H:%M:%S"),
        end.format("%Y-%m-%d %H:%M:%S")
    ));

    let any_one_line = articles.iter().any(|a| a.summary_one_line.is_some());
    let any_summary = articles.iter().any(|a| a.summary.is_some());

    if settings.include_toc || (settings.include_one_line_summary && any_one_line) {
        out.push_str("\n## Table of Contents\n");
        let mut current_source: Option<Uuid> = None;
        let mut index_in_source = 0;
        for article in articles {
            if current_source != Some(article.feed_id) {
                current_source = Some(article.feed_id);
                index_in_source = 0;
                out.push_str(&format!("\n- {}\n", source_title(feed, article.feed_id)));
            }
            index_in_source += 1;
            out.push_str(&format!("{}. {}\n", index_in_source, article.title));
            if settings.include_one_line_summary {
                if let Some(line) = &article.summary_one_line {
                    out.push_str(&format!("   > {}\n", line));
                }
            }
        }
    }

    if settings.include_content || (settings.include_summary && any_summary) {
        out.push_str("\n## Details\n");
        for (index, article) in articles.iter().enumerate() {
            let tag = article
                .tag
                .as_deref()
                .map(|t| format!(" [{t}]"))
                .unwrap_or_default();
            out.push_str(&format!("\n### {}. {}{}\n", index + 1, article.title, tag));
            if settings.include_summary {
                if let Some(summary) = &article.summary {
                    out.push_str(summary);
                    out.push('\n');
                }
            }
            if settings.include_content && !article.content.is_empty() {
                out.push_str(&article.content);
                out.push('\n');
            }
            out.push_str(&format!("> {}\n", article.link));
        }
    }

    out
}

/// Concatenated per-article material for the AI digest synthesis request.
pub fn ai_digest_query(articles: &[Article], send_full_article: bool) -> String {
    let mut query = String::new();
    for article in articles {
        query.push_str(&format!("Title: {} {}\n", article.title, article.link));
        if let Some(line) = &article.summary_one_line {
            query.push_str(line);
            query.push('\n');
        }
        if let Some(summary) = &article.summary {
            query.push_str(&format!("Summary: {}\n", summary));
        }
        if send_full_article && !article.content.is_empty() {
            query.push_str(&format!("Full content: {}\n", article.content));
        }
    }
    query
}

/// Fire-and-forget webhook delivery. Failures are logged, never raised.
pub async fn push_webhook(client: &Client, url: &str, text: &str) {
    let message = serde_json::json!({
        "msg_type": "text",
        "content": { "text": text }
    });
    match client.post(url).json(&message).send().await {
        Ok(response) if response.status().is_success() => {
            info!("digest pushed to webhook");
        }
        Ok(response) => warn!("webhook returned {}", response.status()),
        Err(e) => warn!("webhook push failed: {}", e),
    }
}

fn source_title(feed: &ProcessedFeed, id: Uuid) -> &str {
    feed.feeds
        .iter()
        .find(|f| f.id == id)
        .map(|f| {
            if f.title.is_empty() {
                f.url.as_str()
            } else {
                f.title.as_str()
            }
        })
        .unwrap_or("unknown source")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OriginalFeed;
    use chrono::TimeZone;

    fn article(feed_id: Uuid, title: &str, hour: u32) -> Article {
        Article {
            id: Uuid::new_v4(),
            feed_id,
            link: format!("https://x.com/{title}"),
            title: title.to_string(),
            published_at: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            content: String::new(),
            summary: None,
            summary_one_line: None,
            tag: None,
            summarized: false,
            custom_prompt: false,
            created_at: Utc::now(),
        }
    }

    fn daily_feed() -> ProcessedFeed {
        let mut feed = ProcessedFeed::new("daily");
        feed.digest.frequency = DigestFrequency::Daily;
        feed
    }

    #[test]
    fn staleness_gate_half_day_for_daily() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut feed = daily_feed();
        feed.last_digest = Some(t0);

        assert!(!is_due(&feed, t0 + Duration::hours(6), false));
        assert!(is_due(&feed, t0 + Duration::hours(13), false));
        assert!(is_due(&feed, t0 + Duration::hours(6), true));
    }

    #[test]
    fn first_digest_is_always_due() {
        let feed = daily_feed();
        assert!(is_due(&feed, Utc::now(), false));
    }

    #[test]
    fn weekly_threshold_has_grace() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut feed = daily_feed();
        feed.digest.frequency = DigestFrequency::Weekly;
        feed.last_digest = Some(t0);

        assert!(!is_due(&feed, t0 + Duration::days(6), false));
        assert!(is_due(&feed, t0 + Duration::days(7), false));
    }

    #[test]
    fn window_starts_at_last_digest_unless_forced() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let now = t0 + Duration::days(1);
        let mut feed = daily_feed();
        feed.last_digest = Some(t0);

        assert_eq!(window_start(&feed, now, false), t0);
        assert_eq!(window_start(&feed, now, true), now - Duration::hours(24));
        feed.last_digest = None;
        assert_eq!(window_start(&feed, now, false), now - Duration::hours(24));
    }

    #[test]
    fn toc_groups_and_numbers_within_source() {
        let mut feed = daily_feed();
        let alpha = OriginalFeed::new("https://alpha/feed", "Alpha");
        let beta = OriginalFeed::new("https://beta/feed", "Beta");
        feed.feeds = vec![alpha.clone(), beta.clone()];

        let articles = vec![
            article(alpha.id, "a1", 3),
            article(alpha.id, "a2", 2),
            article(beta.id, "b1", 1),
        ];
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let text = compose(&articles, &feed, start, end);

        assert!(text.contains("# daily 20240102"));
        assert!(text.contains("- Alpha\n1. a1\n2. a2\n"));
        assert!(text.contains("- Beta\n1. b1\n"));
    }

    #[test]
    fn sections_follow_inclusion_flags() {
        let mut feed = daily_feed();
        let src = OriginalFeed::new("https://alpha/feed", "Alpha");
        feed.feeds = vec![src.clone()];
        let mut a = article(src.id, "a1", 1);
        a.summary = Some("a long summary".to_string());
        a.tag = Some("tech".to_string());
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        // Defaults: toc + summaries.
        let text = compose(&[a.clone()], &feed, start, end);
        assert!(text.contains("## Table of Contents"));
        assert!(text.contains("### 1. a1 [tech]"));
        assert!(text.contains("a long summary"));
        assert!(text.contains("> https://x.com/a1"));

        // No flags and no one-liners: bare header.
        feed.digest.include_toc = false;
        feed.digest.include_summary = false;
        let text = compose(&[a.clone()], &feed, start, end);
        assert!(!text.contains("## Table of Contents"));
        assert!(!text.contains("## Details"));

        // One-line summaries alone bring the toc back.
        feed.digest.include_one_line_summary = true;
        a.summary_one_line = Some("one liner".to_string());
        let text = compose(&[a.clone()], &feed, start, end);
        assert!(text.contains("## Table of Contents"));
        assert!(text.contains("> one liner"));

        // include_summary without any summaries present: no detail section.
        feed.digest.include_one_line_summary = false;
        feed.digest.include_summary = true;
        let bare = article(src.id, "a2", 1);
        let text = compose(&[bare], &feed, start, end);
        assert!(!text.contains("## Details"));
    }

    #[test]
    fn ai_query_concatenates_material() {
        let id = Uuid::new_v4();
        let mut a = article(id, "a1", 1);
        a.summary = Some("sum".to_string());
        a.summary_one_line = Some("line".to_string());
        a.content = "full text".to_string();

        let query = ai_digest_query(&[a.clone()], false);
        assert!(query.contains("Title: a1 https://x.com/a1"));
        assert!(query.contains("line"));
        assert!(query.contains("Summary: sum"));
        assert!(!query.contains("full text"));

        let query = ai_digest_query(&[a], true);
        assert!(query.contains("Full content: full text"));
    }
}
