// =============================================================================
// Acquisition Verifier — daily fast-tier reverification of active conditionals
// =============================================================================
//
// Cheap by design: the fast tier (no reasoning budget) sees a compact
// snapshot of current price, recent ticker news, the macro summary, and the
// original plan, and answers confirm / flag / invalidate.
//
//   confirm    — bump verification_count, update last_verified
//   flag       — same, plus the concern is prepended to the notes;
//                status stays active for analyst review
//   invalidate — status = invalidated, stop watching
//
// A parse failure is treated as confirm with a note — a broken response must
// never kill a thesis.
// =============================================================================

use std::sync::Arc;

use chrono::Local;
use tracing::{info, warn};

use crate::llm::parse::{parse_failed, str_field};
use crate::llm::{LlmGateway, LlmTier};
use crate::market::MarketDataClient;
use crate::store::acquisition::{ConditionalRow, WatchStatus};
use crate::store::Store;

const VERIFIER_JSON_TEMPLATE: &str = r#"{
  "verdict": "confirm",
  "flag_reason": "",
  "invalidation_reason": "",
  "price_still_valid": true,
  "reasoning": "brief explanation"
}"#;

/// Counts from one verification cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerificationSummary {
    pub confirmed: usize,
    pub flagged: usize,
    pub invalidated: usize,
    pub errors: usize,
}

/// Verifier verdicts, parsed loosely: anything unrecognized confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Confirm,
    Flag,
    Invalidate,
}

impl Verdict {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "invalidate" => Self::Invalidate,
            "flag" => Self::Flag,
            _ => Self::Confirm,
        }
    }
}

pub struct Verifier {
    store: Arc<Store>,
    market: Arc<MarketDataClient>,
    llm: Arc<LlmGateway>,
}

impl Verifier {
    pub fn new(store: Arc<Store>, market: Arc<MarketDataClient>, llm: Arc<LlmGateway>) -> Self {
        Self { store, market, llm }
    }

    /// Verify every active conditional. Expired horizons are swept first so
    /// the model never wastes a call on a dead plan.
    pub async fn run_verification_cycle(&self) -> VerificationSummary {
        let mut summary = VerificationSummary::default();

        let expired = self.store.expire_conditionals_past_horizon().unwrap_or_default();
        for ticker in &expired {
            let _ = self.store.transition_watchlist(
                ticker,
                &[WatchStatus::ConditionalSet],
                WatchStatus::Expired,
                Some("Conditional expired without trigger"),
            );
        }

        let actives = match self.store.active_conditionals() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "active conditional fetch failed");
                return summary;
            }
        };
        if actives.is_empty() {
            info!("verifier: no active conditionals");
            return summary;
        }

        info!(
            count = actives.len(),
            tickers = ?actives.iter().map(|c| c.ticker.as_str()).collect::<Vec<_>>(),
            "verifier: starting cycle"
        );

        for conditional in &actives {
            match self.verify_one(conditional).await {
                Some(Verdict::Confirm) => summary.confirmed += 1,
                Some(Verdict::Flag) => summary.flagged += 1,
                Some(Verdict::Invalidate) => summary.invalidated += 1,
                None => summary.errors += 1,
            }
        }

        info!(
            confirmed = summary.confirmed,
            flagged = summary.flagged,
            invalidated = summary.invalidated,
            errors = summary.errors,
            "verifier: cycle complete"
        );
        summary
    }

    async fn verify_one(&self, conditional: &ConditionalRow) -> Option<Verdict> {
        let ticker = &conditional.ticker;

        let current_price = self.market.latest_quote(ticker).await.ok().map(|q| q.price);
        let recent_news = self.store.news_mentions_for_ticker(ticker, 2, 3).unwrap_or_default();
        let macro_row = self.store.latest_macro_row().ok().flatten();

        let prompt = build_verifier_prompt(conditional, current_price, &recent_news, macro_row.as_ref());
        let response = self.llm.call(LlmTier::Fast, &prompt, "verifier").await;

        if response.text.is_none() {
            warn!(ticker = %ticker, "verifier call failed");
            return None;
        }

        let value = response.parse_json();
        let verdict = if parse_failed(&value) {
            // No-op decision: the thesis survives, with a note.
            let _ = self.store.flag_conditional(
                conditional.conditional_id,
                "verifier response unparseable — treated as confirm",
            );
            info!(ticker = %ticker, "verifier parse failed — confirmed by default");
            return Some(Verdict::Confirm);
        } else {
            Verdict::parse(&str_field(&value, "verdict"))
        };

        match verdict {
            Verdict::Confirm => {
                let _ = self.store.confirm_conditional(conditional.conditional_id);
                info!(ticker = %ticker, "conditional confirmed");
            }
            Verdict::Flag => {
                let reason = non_empty(
                    str_field(&value, "flag_reason"),
                    str_field(&value, "reasoning"),
                );
                let _ = self.store.flag_conditional(conditional.conditional_id, &reason);
                warn!(ticker = %ticker, reason = %reason, "conditional flagged");
            }
            Verdict::Invalidate => {
                let reason = non_empty(
                    str_field(&value, "invalidation_reason"),
                    str_field(&value, "reasoning"),
                );
                let _ = self.store.invalidate_conditional(conditional.conditional_id, &reason);
                let _ = self.store.transition_watchlist(
                    ticker,
                    &[WatchStatus::ConditionalSet],
                    WatchStatus::Invalidated,
                    Some(&reason),
                );
                warn!(ticker = %ticker, reason = %reason, "conditional INVALIDATED");
            }
        }
        Some(verdict)
    }
}

fn non_empty(primary: String, fallback: String) -> String {
    if primary.trim().is_empty() {
        fallback
    } else {
        primary
    }
}

/// Compact snapshot prompt — this runs on potentially many conditionals
/// daily, so it stays small.
fn build_verifier_prompt(
    conditional: &ConditionalRow,
    current_price: Option<f64>,
    recent_news: &[(String, f64, String)],
    macro_row: Option<&crate::store::signals::MacroRow>,
) -> String {
    let date = Local::now().format("%Y-%m-%d");

    let price_line = match current_price {
        Some(price) => {
            let distance = if conditional.entry_price_target > 0.0 {
                format!(
                    " ({:+.1}% from entry target)",
                    (price - conditional.entry_price_target) / conditional.entry_price_target
                        * 100.0
                )
            } else {
                String::new()
            };
            format!("${price:.2}{distance}")
        }
        None => "unavailable".to_string(),
    };

    let news_lines = if recent_news.is_empty() {
        "  - No recent mentions".to_string()
    } else {
        recent_news
            .iter()
            .map(|(ts, score, summary)| {
                format!("  - [{}] score={score:.0} {summary}", &ts[..16.min(ts.len())])
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let macro_line = macro_row
        .map(|m| format!("Macro score: {:.0}/100", m.macro_score))
        .unwrap_or_else(|| "Macro score: N/A".to_string());

    format!(
        "You are a trading-system verifier. Today is {date}.\n\
         An analyst set a conditional entry on {} on {}. Decide quickly if it is still VALID.\n\
         \n\
         PLAN\n\
         Thesis: {}\n\
         Entry target: ${:.2} | Stop: ${:.2} | TP1: ${:.2}\n\
         Original confidence: {:.2}\n\
         Entry conditions: {}\n\
         Invalidation triggers: {}\n\
         \n\
         CURRENT STATE\n\
         Current price: {price_line}\n\
         {macro_line}\n\
         Recent news:\n{news_lines}\n\
         \n\
         VERDICT OPTIONS\n\
         confirm    — thesis intact, nothing changed materially\n\
         flag       — something concerns me, analyst should review, don't kill it yet\n\
         invalidate — an invalidation condition triggered or the thesis clearly failed\n\
         \n\
         Respond ONLY in this exact JSON format:\n{VERIFIER_JSON_TEMPLATE}",
        conditional.ticker,
        conditional.date_created,
        conditional.thesis_summary,
        conditional.entry_price_target,
        conditional.stop_loss,
        conditional.take_profit_1,
        conditional.research_confidence,
        conditional
            .entry_conditions
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join("; "),
        conditional
            .invalidation_conditions
            .iter()
            .take(2)
            .cloned()
            .collect::<Vec<_>>()
            .join("; "),
    )
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::acquisition::WatchTag;

    #[test]
    fn verdict_parse_is_lenient() {
        assert_eq!(Verdict::parse("confirm"), Verdict::Confirm);
        assert_eq!(Verdict::parse(" FLAG "), Verdict::Flag);
        assert_eq!(Verdict::parse("Invalidate"), Verdict::Invalidate);
        assert_eq!(Verdict::parse("anything else"), Verdict::Confirm);
    }

    #[test]
    fn prompt_is_compact_and_complete() {
        let conditional = ConditionalRow {
            conditional_id: 1,
            ticker: "TLT".into(),
            date_created: "2026-02-20".into(),
            entry_price_target: 95.0,
            stop_loss: 92.0,
            take_profit_1: 99.0,
            take_profit_2: 103.0,
            position_size_pct: 0.08,
            time_horizon_days: 21,
            entry_conditions: vec!["VIX > 22".into(), "macro_score < 40".into()],
            invalidation_conditions: vec!["Fed pivots hawkish".into()],
            thesis_summary: "Defensive duration hedge into slowing growth".into(),
            key_risks: vec![],
            watch_tag: WatchTag::DefensiveHedge,
            research_confidence: 0.74,
            status: "active".into(),
            verification_count: 2,
            last_verified: None,
            verification_notes: None,
        };
        let news = vec![("2026-03-01T10:00".to_string(), 35.0, "rates chatter".to_string())];
        let prompt = build_verifier_prompt(&conditional, Some(94.2), &news, None);

        assert!(prompt.contains("TLT"));
        assert!(prompt.contains("$94.20"));
        assert!(prompt.contains("-0.8% from entry target"));
        assert!(prompt.contains("VIX > 22"));
        assert!(prompt.contains("confirm"));
        assert!(prompt.len() < 2500, "verifier prompt must stay compact");
    }

    #[test]
    fn missing_price_renders_unavailable() {
        let conditional = ConditionalRow {
            conditional_id: 1,
            ticker: "XYZ".into(),
            date_created: "2026-02-20".into(),
            entry_price_target: 0.0,
            stop_loss: 0.0,
            take_profit_1: 0.0,
            take_profit_2: 0.0,
            position_size_pct: 0.05,
            time_horizon_days: 7,
            entry_conditions: vec![],
            invalidation_conditions: vec![],
            thesis_summary: String::new(),
            key_risks: vec![],
            watch_tag: WatchTag::MeanReversion,
            research_confidence: 0.7,
            status: "active".into(),
            verification_count: 0,
            last_verified: None,
            verification_notes: None,
        };
        let prompt = build_verifier_prompt(&conditional, None, &[], None);
        assert!(prompt.contains("unavailable"));
        assert!(prompt.contains("No recent mentions"));
    }
}
