// =============================================================================
// Notification Sink — structured event publication to outbound webhooks
// =============================================================================
//
// Stateless formatter + best-effort poster. Each event kind maps to a fixed
// textual template; long fields are truncated at documented limits (3 top
// articles, 5 politicians, 200-char reasoning). Posting failures are
// swallowed at debug level — notification must never block or fail a cycle.
// =============================================================================

use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::config::{ChannelConfig, Config};
use crate::types::defcon_label;

const POST_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REASONING_CHARS: usize = 200;
const MAX_TOP_ARTICLES: usize = 3;
const MAX_POLITICIANS: usize = 5;

/// Every event the sink knows how to format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CycleSummary,
    DefconChange,
    NewsUpdate,
    MacroUpdate,
    TradeEntry,
    TradeExit,
    CongressionalCluster,
    FlashBriefing,
    ReboundWatchlist,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CycleSummary => "cycle_summary",
            Self::DefconChange => "defcon_change",
            Self::NewsUpdate => "news_update",
            Self::MacroUpdate => "macro_update",
            Self::TradeEntry => "trade_entry",
            Self::TradeExit => "trade_exit",
            Self::CongressionalCluster => "congressional_cluster",
            Self::FlashBriefing => "flash_briefing",
            Self::ReboundWatchlist => "rebound_watchlist",
        }
    }
}

/// Best-effort webhook publisher.
pub struct AlertSystem {
    client: reqwest::Client,
    channels: Vec<ChannelConfig>,
}

impl AlertSystem {
    pub fn new(config: &Config) -> Self {
        let channels: Vec<ChannelConfig> = config
            .channels
            .values()
            .filter(|c| c.enabled && !c.webhook_url.trim().is_empty())
            .cloned()
            .collect();

        Self {
            client: reqwest::Client::builder()
                .timeout(POST_TIMEOUT)
                .build()
                .expect("failed to build reqwest client"),
            channels,
        }
    }

    /// Publish one event to every channel that accepts its kind.
    /// Never returns an error; failures are logged and dropped.
    pub async fn publish(&self, kind: EventKind, data: &Value) {
        if self.channels.is_empty() {
            return;
        }
        let text = format_event(kind, data);

        for channel in &self.channels {
            if !channel.log_events.is_empty()
                && !channel.log_events.iter().any(|e| e == kind.as_str())
            {
                continue;
            }

            let payload = json!({
                "text": text,
                "username": "Sentinel",
                "icon_emoji": ":robot_face:",
            });

            match self.client.post(&channel.webhook_url).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(kind = kind.as_str(), "notification posted");
                }
                Ok(resp) => {
                    debug!(kind = kind.as_str(), status = %resp.status(), "notification rejected");
                }
                Err(e) => {
                    debug!(kind = kind.as_str(), error = %e, "notification failed");
                }
            }
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max).collect();
        format!("{head}…")
    }
}

fn num(data: &Value, key: &str) -> f64 {
    data.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn text_of(data: &Value, key: &str) -> String {
    match data.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(v) if !v.is_null() => v.to_string(),
        _ => "?".to_string(),
    }
}

/// Render an event's fixed template.
pub fn format_event(kind: EventKind, data: &Value) -> String {
    match kind {
        EventKind::CycleSummary => {
            let defcon = num(data, "defcon_level") as u8;
            format!(
                "Cycle #{} | DEFCON {}/5 ({}) | Signal {:.1}/100 | VIX {} | Yield {}%\n\
                 Open {} | Account ${:.0} | P&L ${:+.0}",
                text_of(data, "cycle"),
                defcon,
                defcon_label(defcon),
                num(data, "signal_score"),
                text_of(data, "vix"),
                text_of(data, "bond_yield"),
                text_of(data, "open_trades"),
                num(data, "account_value"),
                num(data, "total_pnl"),
            )
        }
        EventKind::DefconChange => format!(
            "DEFCON changed: {} -> {}\nSignal score: {:.1}/100",
            text_of(data, "old_defcon"),
            text_of(data, "new_defcon"),
            num(data, "signal_score"),
        ),
        EventKind::NewsUpdate => {
            let mut text = format!(
                "News update | score {:.1}/100 | {} | {}\n{} articles ({} new, {} breaking)",
                num(data, "news_score"),
                text_of(data, "crisis_type"),
                text_of(data, "sentiment"),
                text_of(data, "article_count"),
                text_of(data, "new_article_count"),
                text_of(data, "breaking_count"),
            );
            if let Some(articles) = data.get("top_articles").and_then(Value::as_array) {
                for article in articles.iter().take(MAX_TOP_ARTICLES) {
                    text.push_str(&format!("\n• {}", truncate(&text_of(article, "title"), 100)));
                }
            }
            text
        }
        EventKind::MacroUpdate => format!(
            "Macro update | score {:.0}/100 | modifier {:+.1} | {} bearish / {} bullish signals",
            num(data, "macro_score"),
            num(data, "defcon_modifier"),
            text_of(data, "bearish_count"),
            text_of(data, "bullish_count"),
        ),
        EventKind::TradeEntry => format!(
            "Trade entry | {} x{} @ ${:.2} = ${:.0} | DEFCON {}",
            text_of(data, "ticker"),
            text_of(data, "shares"),
            num(data, "entry_price"),
            num(data, "position_size"),
            text_of(data, "defcon"),
        ),
        EventKind::TradeExit => format!(
            "Trade exit | {} @ ${:.2} | {} | P&L {:+.2}%",
            text_of(data, "ticker"),
            num(data, "exit_price"),
            text_of(data, "reason"),
            num(data, "pnl_pct"),
        ),
        EventKind::CongressionalCluster => {
            let politicians = data
                .get("politicians")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .take(MAX_POLITICIANS)
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            format!(
                "Congressional cluster | {} | {} buys | strength {:.0}/100{}\n{}",
                text_of(data, "ticker"),
                text_of(data, "buy_count"),
                num(data, "signal_strength"),
                if data.get("bipartisan").and_then(Value::as_bool).unwrap_or(false) {
                    " | bipartisan"
                } else {
                    ""
                },
                politicians,
            )
        }
        EventKind::FlashBriefing => format!(
            "Flash briefing | DEFCON {}/5 | macro {:.0}/100\n{}",
            text_of(data, "defcon"),
            num(data, "macro_score"),
            truncate(&text_of(data, "summary"), MAX_REASONING_CHARS),
        ),
        EventKind::ReboundWatchlist => format!(
            "REBOUND WATCHLIST — {} queued for recovery research\n\
             Exit @ ${:.2} ({:+.1}%) — pipeline will look for re-entry below ${:.2}",
            text_of(data, "ticker"),
            num(data, "exit_price"),
            num(data, "pnl_pct"),
            num(data, "exit_price"),
        ),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebound_template_names_exit_price_twice() {
        let text = format_event(
            EventKind::ReboundWatchlist,
            &json!({ "ticker": "XYZ", "exit_price": 96.5, "pnl_pct": -3.5 }),
        );
        assert!(text.contains("XYZ"));
        assert_eq!(text.matches("$96.50").count(), 2);
        assert!(text.contains("re-entry below"));
    }

    #[test]
    fn news_template_caps_top_articles() {
        let articles: Vec<Value> = (0..10).map(|i| json!({ "title": format!("story {i}") })).collect();
        let text = format_event(
            EventKind::NewsUpdate,
            &json!({
                "news_score": 42.0, "crisis_type": "inflation_rate", "sentiment": "bearish",
                "article_count": 10, "new_article_count": 4, "breaking_count": 1,
                "top_articles": articles,
            }),
        );
        assert_eq!(text.matches("• ").count(), MAX_TOP_ARTICLES);
    }

    #[test]
    fn flash_briefing_truncates_summary() {
        let long = "x".repeat(500);
        let text = format_event(
            EventKind::FlashBriefing,
            &json!({ "defcon": 3, "macro_score": 55.0, "summary": long }),
        );
        assert!(text.chars().count() < 300);
        assert!(text.ends_with('…'));
    }

    #[test]
    fn defcon_change_template() {
        let text = format_event(
            EventKind::DefconChange,
            &json!({ "old_defcon": 4, "new_defcon": 2, "signal_score": 65.5 }),
        );
        assert!(text.contains("4 -> 2"));
        assert!(text.contains("65.5"));
    }

    #[test]
    fn publish_without_channels_is_a_no_op() {
        let alerts = AlertSystem::new(&Config::default());
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(alerts.publish(EventKind::DefconChange, &json!({})));
    }
}
