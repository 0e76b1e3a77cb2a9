// =============================================================================
// Daily Briefing — once-per-day synthesis that seeds tomorrow's watchlist
// =============================================================================
//
// After the close window the day's aggregates — DEFCON timeline, top news
// signals, LLM analyses, macro snapshot, congressional clusters, open
// positions, the week's closed trades — go to the reasoning tier in a single
// comprehensive prompt. The parsed result persists one row per (date, tier),
// and `watchlist_tomorrow` tickers enter the acquisition queue.
// =============================================================================

use std::sync::Arc;

use chrono::{Duration, Local};
use serde_json::json;
use tracing::{info, warn};

use crate::alerts::{AlertSystem, EventKind};
use crate::llm::parse::{f64_field, parse_failed, str_field, string_list};
use crate::llm::{LlmGateway, LlmTier, QuotaStatus};
use crate::store::acquisition::WatchSource;
use crate::store::briefings::BriefingRow;
use crate::store::Store;

const BRIEFING_JSON_TEMPLATE: &str = r#"{
  "market_regime": "one of: risk-on / risk-off / neutral / transitioning",
  "regime_confidence": 0.0,
  "headline_summary": "2-3 sentence summary of today's most important market story",
  "key_themes": ["theme1", "theme2", "theme3"],
  "biggest_risk_today": "specific risk factor with evidence from data",
  "biggest_opportunity_today": "specific opportunity with evidence from data",
  "signal_quality_assessment": "were today's news signals meaningful or noise",
  "macro_alignment": "how macro data aligns with or contradicts news signals",
  "congressional_alpha": "any actionable intelligence from political trading data",
  "portfolio_assessment": "assessment of current open positions given today's data",
  "watchlist_tomorrow": ["TICKER1", "TICKER2", "TICKER3"],
  "entry_conditions_tomorrow": "specific conditions that would trigger a buy signal",
  "defcon_forecast": "expected DEFCON level tomorrow if current trends continue",
  "reasoning_chain": "step-by-step walk through how you connected the data points",
  "model_confidence": 0.0
}"#;

pub struct DailyBriefing {
    store: Arc<Store>,
    llm: Arc<LlmGateway>,
    alerts: Arc<AlertSystem>,
}

impl DailyBriefing {
    pub fn new(store: Arc<Store>, llm: Arc<LlmGateway>, alerts: Arc<AlertSystem>) -> Self {
        Self { store, llm, alerts }
    }

    /// Run the briefing for today. Returns the persisted row, or None when
    /// the model path failed entirely (the scheduler retries tomorrow).
    pub async fn run(&self) -> Option<BriefingRow> {
        let date = Local::now().format("%Y-%m-%d").to_string();
        info!(date = %date, "daily briefing: gathering context");

        let prompt = self.build_prompt(&date);

        // The briefing is the reasoning tier's flagship call, but a blocked
        // quota downgrades rather than skipping the day.
        let tier = match self.llm.check_quota(LlmTier::Reasoning) {
            QuotaStatus::Block => {
                warn!("reasoning quota blocked — briefing downgraded to balanced tier");
                LlmTier::Balanced
            }
            _ => LlmTier::Reasoning,
        };

        let response = self.llm.call(tier, &prompt, "daily_briefing").await;
        if response.text.is_none() {
            warn!("daily briefing call failed");
            return None;
        }

        let value = response.parse_json();
        if parse_failed(&value) {
            warn!("daily briefing response unparseable");
            return None;
        }

        let row = BriefingRow {
            date: date.clone(),
            tier: tier.as_str().to_string(),
            model_id: response.model.clone(),
            market_regime: str_field(&value, "market_regime"),
            regime_confidence: f64_field(&value, "regime_confidence", 0.0),
            headline_summary: str_field(&value, "headline_summary"),
            key_themes: string_list(&value, "key_themes"),
            biggest_risk: str_field(&value, "biggest_risk_today"),
            biggest_opportunity: str_field(&value, "biggest_opportunity_today"),
            signal_quality: str_field(&value, "signal_quality_assessment"),
            macro_alignment: str_field(&value, "macro_alignment"),
            congressional_alpha: str_field(&value, "congressional_alpha"),
            portfolio_assessment: str_field(&value, "portfolio_assessment"),
            watchlist_tomorrow: string_list(&value, "watchlist_tomorrow"),
            entry_conditions_tomorrow: str_field(&value, "entry_conditions_tomorrow"),
            defcon_forecast: str_field(&value, "defcon_forecast"),
            reasoning_chain: str_field(&value, "reasoning_chain"),
            model_confidence: f64_field(&value, "model_confidence", 0.0),
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
        };

        if let Err(e) = self.store.upsert_briefing(&row) {
            warn!(error = %e, "briefing save failed");
        }

        info!(
            regime = %row.market_regime,
            confidence = row.model_confidence,
            watchlist = ?row.watchlist_tomorrow,
            forecast = %row.defcon_forecast,
            tier = %row.tier,
            "daily briefing complete"
        );

        self.queue_watchlist(&date, &row);

        let macro_score = self
            .store
            .latest_macro_row()
            .ok()
            .flatten()
            .map(|m| m.macro_score)
            .unwrap_or(50.0);
        self.alerts
            .publish(
                EventKind::FlashBriefing,
                &json!({
                    "defcon": row.flash_forecast_level().unwrap_or(5),
                    "macro_score": macro_score,
                    "summary": row.headline_summary,
                }),
            )
            .await;

        Some(row)
    }

    /// Push the briefing's tomorrow-watchlist into the acquisition queue.
    fn queue_watchlist(&self, date: &str, row: &BriefingRow) {
        for ticker in &row.watchlist_tomorrow {
            let ticker = ticker.trim().to_uppercase();
            if ticker.is_empty() || ticker.len() > 6 {
                continue;
            }
            if let Err(e) = self.store.queue_watchlist(
                date,
                &ticker,
                WatchSource::DailyBriefing,
                row.model_confidence,
                &row.entry_conditions_tomorrow,
                &format!("Regime: {} | Risk: {}", row.market_regime, row.biggest_risk),
            ) {
                warn!(ticker = %ticker, error = %e, "watchlist queue failed");
            }
        }
        if !row.watchlist_tomorrow.is_empty() {
            info!(
                count = row.watchlist_tomorrow.len(),
                "acquisition watchlist seeded from briefing"
            );
        }
    }

    /// Assemble the day's aggregates into one prompt.
    fn build_prompt(&self, date: &str) -> String {
        let snapshots = self.store.snapshots_for_date(date).unwrap_or_default();
        let timeline: String = snapshots
            .iter()
            .map(|s| {
                format!(
                    "  {} — DEFCON {}, score {:.1}, VIX {}, yield {}%",
                    &s.timestamp[11..16.min(s.timestamp.len())],
                    s.defcon_level,
                    s.composite_score,
                    s.vix.map(|v| format!("{v:.1}")).unwrap_or_else(|| "?".into()),
                    s.bond_yield.map(|y| format!("{y:.2}")).unwrap_or_else(|| "?".into()),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let top_signals = self.store.top_news_signals_for_date(date, 3).unwrap_or_default();
        let signals_text: String = top_signals
            .iter()
            .map(|s| {
                format!(
                    "  score {:.1} — {} | {} ({} breaking / {} articles)",
                    s.news_score,
                    s.dominant_crisis_type,
                    s.sentiment_summary,
                    s.breaking_count,
                    s.article_count,
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let analyses = self.store.analyses_for_date(date, "reasoning").unwrap_or_default();
        let analyses_text: String = analyses
            .iter()
            .take(3)
            .map(|(action, reasoning)| {
                format!("  [{action}] {}", reasoning.chars().take(300).collect::<String>())
            })
            .collect::<Vec<_>>()
            .join("\n");

        let macro_text = self
            .store
            .latest_macro_row()
            .ok()
            .flatten()
            .map(|m| {
                format!(
                    "  score {:.0}/100 | modifier {:+.1} | curve {} | fed {} | unemployment {} | HY {}bps",
                    m.macro_score,
                    m.defcon_modifier,
                    m.yield_curve_spread.map(|v| format!("{v:+.2}%")).unwrap_or_else(|| "?".into()),
                    m.fed_funds_rate.map(|v| format!("{v:.2}%")).unwrap_or_else(|| "?".into()),
                    m.unemployment_rate.map(|v| format!("{v:.1}%")).unwrap_or_else(|| "?".into()),
                    m.hy_oas_bps.map(|v| format!("{v:.0}")).unwrap_or_else(|| "?".into()),
                )
            })
            .unwrap_or_else(|| "  no macro data".to_string());

        let clusters = self.store.top_cluster_signals(5).unwrap_or_default();
        let clusters_text: String = clusters
            .iter()
            .map(|c| {
                format!(
                    "  {} — {} buys, strength {:.0}{}",
                    c.ticker,
                    c.buy_count,
                    c.signal_strength,
                    if c.bipartisan { ", bipartisan" } else { "" },
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let positions = self.store.open_trades().unwrap_or_default();
        let positions_text: String = positions
            .iter()
            .map(|t| {
                format!(
                    "  {} x{} @ ${:.2} (DEFCON {} entry, unrealized ${:+.0})",
                    t.ticker, t.shares, t.entry_price, t.defcon_at_entry, t.unrealized_pnl,
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let week_ago = (Local::now() - Duration::days(7)).format("%Y-%m-%d").to_string();
        let closed = self.store.closed_trades_since(&week_ago).unwrap_or_default();
        let closed_text: String = closed
            .iter()
            .map(|t| {
                format!(
                    "  {} closed {} ({}) P&L {:+.1}%",
                    t.ticker,
                    t.exit_reason.as_deref().unwrap_or("?"),
                    t.exit_price.map(|p| format!("${p:.2}")).unwrap_or_else(|| "?".into()),
                    t.realized_pnl_pct.unwrap_or(0.0),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You are the end-of-day strategist for an autonomous paper-trading system.\n\
             Today is {date}. Synthesize everything the system observed today and set up\n\
             tomorrow. Ground every claim in the data below.\n\
             \n\
             DEFCON TIMELINE ({} cycles)\n{}\n\
             \n\
             TOP NEWS SIGNALS\n{}\n\
             \n\
             DEEP ANALYSES TODAY\n{}\n\
             \n\
             MACRO SNAPSHOT\n{macro_text}\n\
             \n\
             CONGRESSIONAL CLUSTERS\n{}\n\
             \n\
             OPEN POSITIONS\n{}\n\
             \n\
             CLOSED THIS WEEK\n{}\n\
             \n\
             Respond with ONLY valid JSON in this exact schema:\n{BRIEFING_JSON_TEMPLATE}",
            snapshots.len(),
            non_empty_block(&timeline),
            non_empty_block(&signals_text),
            non_empty_block(&analyses_text),
            non_empty_block(&clusters_text),
            non_empty_block(&positions_text),
            non_empty_block(&closed_text),
        )
    }
}

fn non_empty_block(text: &str) -> &str {
    if text.trim().is_empty() {
        "  none"
    } else {
        text
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn prompt_builds_from_empty_day() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let llm = Arc::new(LlmGateway::new(&Config::default(), store.clone()));
        let alerts = Arc::new(AlertSystem::new(&Config::default()));
        let briefing = DailyBriefing::new(store, llm, alerts);

        let prompt = briefing.build_prompt("2026-03-01");
        assert!(prompt.contains("2026-03-01"));
        assert!(prompt.contains("DEFCON TIMELINE (0 cycles)"));
        assert!(prompt.contains("none"));
        assert!(prompt.contains("watchlist_tomorrow"));
    }

    #[test]
    fn prompt_includes_day_aggregates() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .record_snapshot(Some(4.2), Some(24.0), Some(-1.2), 4, 22.0, 15.0, false)
            .unwrap();
        let llm = Arc::new(LlmGateway::new(&Config::default(), store.clone()));
        let alerts = Arc::new(AlertSystem::new(&Config::default()));
        let briefing = DailyBriefing::new(store, llm, alerts);

        let today = Local::now().format("%Y-%m-%d").to_string();
        let prompt = briefing.build_prompt(&today);
        assert!(prompt.contains("DEFCON TIMELINE (1 cycles)"));
        assert!(prompt.contains("DEFCON 4"));
    }

    #[test]
    fn bad_tickers_not_queued() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let llm = Arc::new(LlmGateway::new(&Config::default(), store.clone()));
        let alerts = Arc::new(AlertSystem::new(&Config::default()));
        let briefing = DailyBriefing::new(store.clone(), llm, alerts);

        let row = BriefingRow {
            date: "2026-03-01".into(),
            tier: "reasoning".into(),
            watchlist_tomorrow: vec!["MSFT".into(), "".into(), "WAYTOOLONG".into()],
            ..BriefingRow::default()
        };
        briefing.queue_watchlist("2026-03-01", &row);

        let pending = store.pending_watchlist(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].ticker, "MSFT");
    }
}
