// =============================================================================
// News Aggregator — Alpha Vantage, RSS feeds, Reddit (read-only)
// =============================================================================
//
// All three sources are fetched concurrently and joined; a failing source
// degrades to an empty list and never fails the cycle. Every outbound call
// is gated by the shared rate limiter.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use futures_util::future::join_all;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::rate_limit::RateLimiter;

use super::dedup::{KeepStrategy, NewsDeduplicator};
use super::NewsArticle;

const ALPHA_VANTAGE_URL: &str = "https://www.alphavantage.co/query";
const ALPHA_VANTAGE_TOPICS: &str = "financial_markets,economy_macro,economy_monetary";

const DEFAULT_RSS_FEEDS: &[&str] = &[
    "https://feeds.content.dowjones.io/public/rss/mw_topstories",
    "https://www.cnbc.com/id/100003114/device/rss/rss.html",
    "https://feeds.bbci.co.uk/news/business/rss.xml",
];

const DEFAULT_SUBREDDITS: &[&str] = &["wallstreetbets", "stocks", "investing"];

/// Aggregates market news from the configured sources, deduplicated.
pub struct NewsAggregator {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    deduplicator: NewsDeduplicator,
    alpha_vantage_key: String,
    rss_feeds: Vec<String>,
    subreddits: Vec<String>,
}

impl NewsAggregator {
    pub fn new(config: &Config, limiter: Arc<RateLimiter>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (sentinel-bot research)")
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("failed to build reqwest client");

        limiter.configure("alpha_vantage", 5, 1.0, None);
        limiter.configure("rss", 30, 0.0, None);
        limiter.configure("reddit", 10, 1.0, None);
        for (endpoint, entry) in &config.rate_limits {
            limiter.configure(endpoint, entry.rpm, entry.min_delay_s, None);
        }

        Self {
            client,
            limiter,
            deduplicator: NewsDeduplicator::new(config.deduplication.similarity_threshold),
            alpha_vantage_key: std::env::var("ALPHA_VANTAGE_API_KEY").unwrap_or_default(),
            rss_feeds: DEFAULT_RSS_FEEDS.iter().map(|s| s.to_string()).collect(),
            subreddits: DEFAULT_SUBREDDITS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Fetch from every source concurrently, merge, filter to the lookback
    /// window, and deduplicate. Failures yield an empty contribution.
    pub async fn fetch_latest(&self, lookback_hours: i64) -> Vec<NewsArticle> {
        let (av, rss, reddit) = tokio::join!(
            self.fetch_alpha_vantage(),
            self.fetch_rss(),
            self.fetch_reddit()
        );

        let cutoff = Utc::now() - Duration::hours(lookback_hours);
        let mut articles: Vec<NewsArticle> = Vec::new();
        articles.extend(av);
        articles.extend(rss);
        articles.extend(reddit);
        articles.retain(|a| a.published_at >= cutoff);

        let before = articles.len();
        let (unique, removed) =
            self.deduplicator.deduplicate(articles, KeepStrategy::HighestRelevance);
        info!(
            fetched = before,
            unique = unique.len(),
            removed,
            lookback_hours,
            "news batch assembled"
        );
        unique
    }

    // -------------------------------------------------------------------------
    // Alpha Vantage
    // -------------------------------------------------------------------------

    async fn fetch_alpha_vantage(&self) -> Vec<NewsArticle> {
        if self.alpha_vantage_key.is_empty() {
            debug!("Alpha Vantage skipped — no API key");
            return Vec::new();
        }

        self.limiter.wait_if_needed("alpha_vantage").await;
        let url = format!(
            "{ALPHA_VANTAGE_URL}?function=NEWS_SENTIMENT&topics={ALPHA_VANTAGE_TOPICS}&limit=50&apikey={}",
            self.alpha_vantage_key
        );

        let body = match self.get_json(&url, "alpha_vantage").await {
            Some(body) => body,
            None => return Vec::new(),
        };

        let Some(feed) = body.get("feed").and_then(Value::as_array) else {
            warn!("Alpha Vantage response missing 'feed' array");
            return Vec::new();
        };

        let articles: Vec<NewsArticle> = feed
            .iter()
            .filter_map(|item| {
                let title = item.get("title")?.as_str()?.to_string();
                let url = item.get("url")?.as_str()?.to_string();
                let published_at = item
                    .get("time_published")
                    .and_then(Value::as_str)
                    .and_then(parse_alpha_vantage_time)
                    .unwrap_or_else(Utc::now);
                let relevance = item
                    .get("relevance_score")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<f64>().ok())
                    .map(|r| r * 100.0)
                    .unwrap_or(50.0);
                Some(NewsArticle {
                    title,
                    description: item
                        .get("summary")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    source: item
                        .get("source")
                        .and_then(Value::as_str)
                        .unwrap_or("AlphaVantage")
                        .to_string(),
                    published_at,
                    url,
                    relevance_score: relevance,
                })
            })
            .collect();

        debug!(count = articles.len(), "Alpha Vantage articles fetched");
        articles
    }

    // -------------------------------------------------------------------------
    // RSS
    // -------------------------------------------------------------------------

    async fn fetch_rss(&self) -> Vec<NewsArticle> {
        let fetches = self.rss_feeds.iter().map(|feed_url| self.fetch_one_feed(feed_url));
        let articles: Vec<NewsArticle> =
            join_all(fetches).await.into_iter().flatten().collect();
        debug!(count = articles.len(), "RSS articles fetched");
        articles
    }

    async fn fetch_one_feed(&self, feed_url: &str) -> Vec<NewsArticle> {
        self.limiter.wait_if_needed("rss").await;
        match self.client.get(feed_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.limiter.record_request("rss", true);
                match resp.text().await {
                    Ok(body) => {
                        let host = feed_url
                            .split('/')
                            .nth(2)
                            .unwrap_or("rss")
                            .trim_start_matches("www.")
                            .trim_start_matches("feeds.");
                        parse_rss(&body, &format!("RSS-{host}"))
                    }
                    Err(_) => Vec::new(),
                }
            }
            Ok(resp) => {
                self.limiter.record_request("rss", false);
                if resp.status().as_u16() == 429 {
                    self.limiter.trigger_backoff("rss");
                }
                debug!(feed = %feed_url, status = %resp.status(), "RSS feed error");
                Vec::new()
            }
            Err(e) => {
                self.limiter.record_request("rss", false);
                debug!(feed = %feed_url, error = %e, "RSS fetch failed");
                Vec::new()
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reddit (read-only JSON listing, no auth)
    // -------------------------------------------------------------------------

    async fn fetch_reddit(&self) -> Vec<NewsArticle> {
        let mut articles = Vec::new();
        for subreddit in &self.subreddits {
            self.limiter.wait_if_needed("reddit").await;
            let url = format!("https://www.reddit.com/r/{subreddit}/hot.json?limit=25");
            let Some(body) = self.get_json(&url, "reddit").await else {
                continue;
            };

            let posts = body
                .pointer("/data/children")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for post in posts {
                let Some(data) = post.get("data") else { continue };
                let Some(title) = data.get("title").and_then(Value::as_str) else {
                    continue;
                };
                let created = data
                    .get("created_utc")
                    .and_then(Value::as_f64)
                    .map(|ts| Utc.timestamp_opt(ts as i64, 0).single().unwrap_or_else(Utc::now))
                    .unwrap_or_else(Utc::now);
                let score = data.get("score").and_then(Value::as_i64).unwrap_or(0);
                let permalink = data.get("permalink").and_then(Value::as_str).unwrap_or("");

                articles.push(NewsArticle {
                    title: title.to_string(),
                    description: data
                        .get("selftext")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .chars()
                        .take(400)
                        .collect(),
                    source: format!("Reddit-r/{subreddit}"),
                    published_at: created,
                    url: format!("https://www.reddit.com{permalink}"),
                    // Upvote count proxies relevance, capped.
                    relevance_score: (score as f64 / 50.0).min(100.0),
                });
            }
        }
        debug!(count = articles.len(), "Reddit posts fetched");
        articles
    }

    async fn get_json(&self, url: &str, endpoint: &str) -> Option<Value> {
        match self.client.get(url).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.as_u16() == 429 {
                    self.limiter.record_request(endpoint, false);
                    self.limiter.trigger_backoff(endpoint);
                    return None;
                }
                if !status.is_success() {
                    self.limiter.record_request(endpoint, false);
                    debug!(endpoint, %status, "HTTP error");
                    return None;
                }
                match resp.json::<Value>().await {
                    Ok(body) => {
                        self.limiter.record_request(endpoint, true);
                        Some(body)
                    }
                    Err(e) => {
                        self.limiter.record_request(endpoint, false);
                        debug!(endpoint, error = %e, "JSON decode failed");
                        None
                    }
                }
            }
            Err(e) => {
                self.limiter.record_request(endpoint, false);
                debug!(endpoint, error = %e, "request failed");
                None
            }
        }
    }
}

/// Alpha Vantage timestamps look like `20260315T143000`.
fn parse_alpha_vantage_time(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Minimal RSS 2.0 item extraction: title / description / link / pubDate.
fn parse_rss(xml: &str, source: &str) -> Vec<NewsArticle> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut articles = Vec::new();
    let mut in_item = false;
    let mut field: Option<&'static str> = None;
    let mut title = String::new();
    let mut description = String::new();
    let mut link = String::new();
    let mut pub_date = String::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"item" => {
                    in_item = true;
                    title.clear();
                    description.clear();
                    link.clear();
                    pub_date.clear();
                }
                b"title" if in_item => field = Some("title"),
                b"description" if in_item => field = Some("description"),
                b"link" if in_item => field = Some("link"),
                b"pubDate" if in_item => field = Some("pubDate"),
                _ => field = None,
            },
            Ok(Event::Text(e)) => {
                if let Ok(text) = std::str::from_utf8(e.as_ref()) {
                    append_field(field, text, &mut title, &mut description, &mut link, &mut pub_date);
                }
            }
            Ok(Event::CData(e)) => {
                if let Ok(text) = std::str::from_utf8(e.as_ref()) {
                    append_field(field, text, &mut title, &mut description, &mut link, &mut pub_date);
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"item" => {
                    in_item = false;
                    if !title.is_empty() {
                        let published_at = DateTime::parse_from_rfc2822(pub_date.trim())
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now());
                        articles.push(NewsArticle {
                            title: title.trim().to_string(),
                            description: strip_html(description.trim()),
                            source: source.to_string(),
                            published_at,
                            url: link.trim().to_string(),
                            relevance_score: 60.0,
                        });
                    }
                }
                _ => field = None,
            },
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    articles
}

fn append_field(
    field: Option<&'static str>,
    text: &str,
    title: &mut String,
    description: &mut String,
    link: &mut String,
    pub_date: &mut String,
) {
    match field {
        Some("title") => title.push_str(text),
        Some("description") => description.push_str(text),
        Some("link") => link.push_str(text),
        Some("pubDate") => pub_date.push_str(text),
        _ => {}
    }
}

/// Drop embedded tags from RSS descriptions; feeds routinely wrap summaries
/// in anchor/img markup.
fn strip_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for ch in text.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_vantage_time_parses() {
        let dt = parse_alpha_vantage_time("20260315T143000").unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M").to_string(), "2026-03-15 14:30");
        assert!(parse_alpha_vantage_time("not-a-time").is_none());
    }

    #[test]
    fn rss_items_parse_into_articles() {
        let xml = r#"<?xml version="1.0"?>
        <rss version="2.0"><channel>
          <title>Feed Title</title>
          <item>
            <title>Markets slide on rate fears</title>
            <description><![CDATA[Stocks fell as <b>yields</b> rose.]]></description>
            <link>https://example.com/story-1</link>
            <pubDate>Mon, 02 Mar 2026 14:00:00 GMT</pubDate>
          </item>
          <item>
            <title>Second story</title>
            <description>Plain text body</description>
            <link>https://example.com/story-2</link>
            <pubDate>Mon, 02 Mar 2026 15:00:00 GMT</pubDate>
          </item>
        </channel></rss>"#;

        let articles = parse_rss(xml, "RSS-example.com");
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[0].title, "Markets slide on rate fears");
        assert_eq!(articles[0].description, "Stocks fell as yields rose.");
        assert_eq!(articles[0].url, "https://example.com/story-1");
        assert_eq!(articles[0].source, "RSS-example.com");
        assert_eq!(
            articles[0].published_at.format("%H:%M").to_string(),
            "14:00"
        );
    }

    #[test]
    fn channel_title_not_mistaken_for_item() {
        let xml = r#"<rss><channel><title>Just A Feed</title></channel></rss>"#;
        assert!(parse_rss(xml, "RSS-x").is_empty());
    }

    #[test]
    fn html_stripped_from_descriptions() {
        assert_eq!(strip_html("<p>hello <a href='x'>world</a></p>"), "hello world");
    }
}
