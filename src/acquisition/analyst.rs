// =============================================================================
// Acquisition Analyst — reasoning-tier conditional-entry decisions
// =============================================================================
//
// Reads complete dossiers and asks one question: should a conditional entry
// order exist on this stock, and at exactly what levels? Promotion to the
// broker requires should_enter AND research_confidence at or above the
// configured threshold (default 0.70). Everything else becomes a descriptive
// `analyst_pass` explaining what would change the decision.
//
// Quota discipline: the reasoning tier is pre-checked; a Block downgrades
// the call to the balanced tier (logged) rather than skipping the ticker.
// =============================================================================

use std::sync::Arc;

use chrono::Local;
use serde_json::Value;
use tracing::{info, warn};

use crate::llm::parse::{bool_field, f64_field, i64_field, parse_failed, str_field, string_list};
use crate::llm::{LlmGateway, LlmTier, QuotaStatus};
use crate::store::acquisition::{
    ConditionalInsert, LibraryStatus, ResearchRow, WatchStatus, WatchTag,
};
use crate::store::Store;

/// Tag definitions injected into every analyst prompt. The tag shapes the
/// entry side, stop distance, and sizing the model should choose.
const WATCH_TAG_DEFINITIONS: &str = r#"
WATCH TAGS — assign exactly ONE to this trade

  breakout        — Price testing or clearing a key resistance level.
                    Entry: above resistance. Stop: tight below breakout.
  mean-reversion  — Overextended pullback to known support; expecting bounce.
                    Entry: at support. Stop: wider, below support.
  momentum        — Strong established trend; adding on a healthy pullback.
                    Entry: near moving average or recent base.
  defensive-hedge — Risk-off asset held during macro uncertainty.
                    Entry: any weakness. Stop: wide. Size: small.
  macro-hedge     — Inverse or volatility instrument.
                    Entry: strict — only when VIX elevated AND DEFCON elevated.
  earnings-play   — Setup driven by an upcoming earnings catalyst.
                    Entry: before event date. Time horizon: short.
  rebound         — Post-stop-loss recovery attempt on a previously held ticker.
                    Entry: on bottoming signal. Stop: tight. Size: reduced.
"#;

const ANALYST_JSON_TEMPLATE: &str = r#"{
  "should_enter": true,
  "research_confidence": 0.0,
  "watch_tag": "breakout",
  "entry_price_target": 0.0,
  "stop_loss": 0.0,
  "take_profit_1": 0.0,
  "take_profit_2": 0.0,
  "position_size_pct": 0.0,
  "time_horizon_days": 0,
  "entry_conditions": ["condition 1", "condition 2"],
  "invalidation_conditions": ["invalidation trigger 1"],
  "thesis_summary": "2-3 sentence explanation of why this trade makes sense NOW",
  "key_risks": ["risk1", "risk2"],
  "data_gaps": ["specific missing data that would improve confidence"]
}"#;

/// Outcome of one analyst decision.
#[derive(Debug, Clone)]
pub struct AnalystOutcome {
    pub ticker: String,
    pub should_enter: bool,
    pub confidence: f64,
    pub promoted: bool,
    pub tier_used: LlmTier,
}

pub struct Analyst {
    store: Arc<Store>,
    llm: Arc<LlmGateway>,
    confidence_threshold: f64,
    max_position_pct: f64,
    max_per_run: usize,
}

impl Analyst {
    pub fn new(
        store: Arc<Store>,
        llm: Arc<LlmGateway>,
        confidence_threshold: f64,
        max_position_pct: f64,
        max_per_run: usize,
    ) -> Self {
        Self {
            store,
            llm,
            confidence_threshold,
            max_position_pct,
            max_per_run,
        }
    }

    /// One analyst cycle over the ready dossiers, FIFO.
    pub async fn run_analyst_cycle(&self) -> Vec<AnalystOutcome> {
        let ready = match self.store.ready_research(self.max_per_run) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "ready research fetch failed");
                return Vec::new();
            }
        };
        if ready.is_empty() {
            info!("analyst: no research ready");
            return Vec::new();
        }

        info!(
            count = ready.len(),
            tickers = ?ready.iter().map(|r| r.ticker.as_str()).collect::<Vec<_>>(),
            "analyst: starting cycle"
        );

        let mut outcomes = Vec::new();
        for (i, research) in ready.iter().enumerate() {
            if let Some(outcome) = self.analyze_ticker(research).await {
                outcomes.push(outcome);
            }
            if i + 1 < ready.len() {
                // Stay within the provider's per-minute budget.
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            }
        }

        let promoted: Vec<&str> = outcomes
            .iter()
            .filter(|o| o.promoted)
            .map(|o| o.ticker.as_str())
            .collect();
        info!(analyzed = outcomes.len(), promoted = ?promoted, "analyst: cycle complete");
        outcomes
    }

    /// Quota pre-check: Block forces a balanced-tier run. The confidence
    /// threshold is unchanged — only the model tier moves.
    fn effective_tier(&self) -> LlmTier {
        match self.llm.check_quota(LlmTier::Reasoning) {
            QuotaStatus::Block => {
                warn!("reasoning quota blocked — downgrading analyst to balanced tier");
                LlmTier::Balanced
            }
            QuotaStatus::Warn => {
                warn!("reasoning quota warning — monitoring");
                LlmTier::Reasoning
            }
            QuotaStatus::Ok => LlmTier::Reasoning,
        }
    }

    async fn analyze_ticker(&self, research: &ResearchRow) -> Option<AnalystOutcome> {
        let ticker = research.ticker.clone();
        let tier = self.effective_tier();

        let prompt = build_analyst_prompt(research, self.confidence_threshold, self.max_position_pct);
        let response = self.llm.call(tier, &prompt, "analyst").await;

        if response.text.is_none() {
            warn!(ticker = %ticker, "analyst call failed — dossier left for next run");
            return None;
        }

        let plan = response.parse_json();
        if parse_failed(&plan) {
            // Parse failure is a no-op decision: the dossier is consumed but
            // nothing is promoted.
            warn!(ticker = %ticker, "analyst response unparseable — treating as pass");
            self.record_pass(&ticker, 0.0, &plan);
            let _ = self.store.set_library_status(&ticker, LibraryStatus::Analysed);
            return Some(AnalystOutcome {
                ticker,
                should_enter: false,
                confidence: 0.0,
                promoted: false,
                tier_used: tier,
            });
        }

        let should_enter = bool_field(&plan, "should_enter");
        let confidence = f64_field(&plan, "research_confidence", 0.0);
        info!(
            ticker = %ticker,
            should_enter,
            confidence = format!("{confidence:.2}"),
            tier = %tier,
            in_tokens = response.input_tokens,
            out_tokens = response.output_tokens,
            "analyst decision"
        );

        let promoted = should_enter && confidence >= self.confidence_threshold;
        if promoted {
            self.promote(&ticker, confidence, &plan);
        } else {
            self.record_pass(&ticker, confidence, &plan);
        }

        let _ = self.store.set_library_status(&ticker, LibraryStatus::Analysed);

        Some(AnalystOutcome {
            ticker,
            should_enter,
            confidence,
            promoted,
            tier_used: tier,
        })
    }

    /// Write the conditional (superseding any prior active one) and move the
    /// watchlist row forward.
    fn promote(&self, ticker: &str, confidence: f64, plan: &Value) {
        let insert = ConditionalInsert {
            ticker: ticker.to_string(),
            entry_price_target: f64_field(plan, "entry_price_target", 0.0),
            stop_loss: f64_field(plan, "stop_loss", 0.0),
            take_profit_1: f64_field(plan, "take_profit_1", 0.0),
            take_profit_2: f64_field(plan, "take_profit_2", 0.0),
            position_size_pct: f64_field(plan, "position_size_pct", 0.05)
                .clamp(0.0, self.max_position_pct),
            time_horizon_days: i64_field(plan, "time_horizon_days", 14),
            entry_conditions: string_list(plan, "entry_conditions"),
            invalidation_conditions: string_list(plan, "invalidation_conditions"),
            thesis_summary: str_field(plan, "thesis_summary"),
            key_risks: string_list(plan, "key_risks"),
            watch_tag: WatchTag::parse(&str_field(plan, "watch_tag")),
            research_confidence: confidence,
        };

        match self.store.supersede_and_insert_conditional(&insert) {
            Ok(id) => {
                info!(
                    ticker,
                    conditional_id = id,
                    tag = insert.watch_tag.as_str(),
                    entry = insert.entry_price_target,
                    stop = insert.stop_loss,
                    size_pct = format!("{:.0}%", insert.position_size_pct * 100.0),
                    "conditional promoted to broker"
                );

                // Thesis text rides on the watchlist row for the dashboard.
                let mut thesis = insert.thesis_summary.clone();
                if insert.entry_price_target > 0.0 {
                    thesis.push_str(&format!(
                        " | Entry: ${:.2} / Stop: ${:.2}",
                        insert.entry_price_target, insert.stop_loss
                    ));
                }
                if let Some(first) = insert.entry_conditions.first() {
                    thesis.push_str(&format!(" | {first}"));
                }
                let thesis: String = thesis.chars().take(500).collect();
                let _ = self.store.transition_watchlist(
                    ticker,
                    &[WatchStatus::Researched],
                    WatchStatus::ConditionalSet,
                    Some(&thesis),
                );
            }
            Err(e) => warn!(ticker, error = %e, "conditional write failed"),
        }
    }

    /// Below threshold (or declined): record a descriptive pass with what
    /// would change the decision.
    fn record_pass(&self, ticker: &str, confidence: f64, plan: &Value) {
        let thesis = str_field(plan, "thesis_summary");
        let gaps = string_list(plan, "data_gaps");
        let risks = string_list(plan, "key_risks");

        let reentry = if gaps.is_empty() {
            "insufficient data / low confidence".to_string()
        } else {
            gaps.iter().take(2).cloned().collect::<Vec<_>>().join("; ")
        };

        let mut pass_text = format!("PASS ({:.0}% conf)", confidence * 100.0);
        if !thesis.is_empty() {
            pass_text.push_str(&format!(" — {thesis}"));
        }
        pass_text.push_str(&format!(" | Re-entry if: {reentry}"));
        if !risks.is_empty() {
            pass_text.push_str(&format!(
                " | Risks: {}",
                risks.iter().take(2).cloned().collect::<Vec<_>>().join(", ")
            ));
        }
        let pass_text: String = pass_text.chars().take(500).collect();

        info!(ticker, confidence = format!("{confidence:.2}"), "analyst pass");
        let _ = self.store.transition_watchlist(
            ticker,
            &[WatchStatus::Researched],
            WatchStatus::AnalystPass,
            Some(&pass_text),
        );
    }
}

/// The dossier prompt: every block the researcher gathered, the tag
/// definitions, and the exact JSON shape expected back.
fn build_analyst_prompt(
    research: &ResearchRow,
    confidence_threshold: f64,
    max_position_pct: f64,
) -> String {
    let date = Local::now().format("%Y-%m-%d");
    let ticker = &research.ticker;

    let fmt_opt = |v: Option<f64>| match v {
        Some(v) => format!("{v:.2}"),
        None => "N/A".to_string(),
    };
    let fmt_pct = |v: Option<f64>| match v {
        Some(v) => format!("{v:+.1}%"),
        None => "N/A".to_string(),
    };

    format!(
        "You are the senior acquisition analyst of a paper-trading system. Today is {date}.\n\
         You have comprehensive research on {ticker}. Decide whether to set a CONDITIONAL\n\
         ENTRY ORDER. Be precise — every price level must be a real number.\n\
         \n\
         PRICE & TECHNICALS — {ticker}\n\
         Current price:  ${}\n\
         1-week change:  {}\n\
         1-month change: {}\n\
         52w High/Low:   ${} / ${}\n\
         Market regime:  {}\n\
         \n\
         FUNDAMENTALS\n\
         Market cap:      {}\n\
         P/E (trailing):  {}  P/E (forward): {}\n\
         Profit margin:   {}\n\
         Revenue growth:  {} YoY\n\
         Debt/Equity:     {}\n\
         \n\
         ANALYST CONSENSUS\n\
         Price targets: mean ${} / high ${} / low ${}\n\
         Ratings: {} buy / {} hold / {} sell\n\
         \n\
         SEC FILINGS\n\
         Latest: {} on {}\n\
         {}\n\
         \n\
         INTERNAL SIGNALS\n\
         News mentions (30d): {}  avg score: {}\n\
         Congressional cluster strength: {:.0}  buy count: {}\n\
         Macro composite score: {}\n\
         {WATCH_TAG_DEFINITIONS}\n\
         YOUR TASK\n\
         1. Which watch_tag fits this setup?\n\
         2. Should we set a conditional entry order? (true/false)\n\
         3. Exact entry price, stop loss (a price, not a percentage), TP1, TP2.\n\
         4. Position size as a fraction of available cash (0.0-{max_position_pct:.2}).\n\
         5. Specific, VERIFIABLE entry conditions with numeric thresholds.\n\
         6. What would invalidate this thesis entirely?\n\
         \n\
         Set research_confidence 0.0-1.0. Only set should_enter=true if\n\
         research_confidence >= {confidence_threshold:.1}.\n\
         \n\
         Respond in this EXACT JSON format (no other text):\n\
         {ANALYST_JSON_TEMPLATE}",
        fmt_opt(research.current_price),
        fmt_pct(research.price_1w_chg_pct),
        fmt_pct(research.price_1m_chg_pct),
        fmt_opt(research.price_52w_high),
        fmt_opt(research.price_52w_low),
        if research.market_regime.is_empty() { "unknown" } else { &research.market_regime },
        research
            .market_cap
            .map(|m| format!("${:.1}B", m / 1e9))
            .unwrap_or_else(|| "N/A".to_string()),
        fmt_opt(research.pe_ratio),
        fmt_opt(research.forward_pe),
        research
            .profit_margin
            .map(|m| format!("{:.1}%", m * 100.0))
            .unwrap_or_else(|| "N/A".to_string()),
        research
            .revenue_growth_yoy
            .map(|g| format!("{:+.1}%", g * 100.0))
            .unwrap_or_else(|| "N/A".to_string()),
        fmt_opt(research.debt_to_equity),
        fmt_opt(research.analyst_target_mean),
        fmt_opt(research.analyst_target_high),
        fmt_opt(research.analyst_target_low),
        research.analyst_buy_count,
        research.analyst_hold_count,
        research.analyst_sell_count,
        research.latest_filing_type.as_deref().unwrap_or("N/A"),
        research.latest_filing_date.as_deref().unwrap_or("N/A"),
        research.filings_summary.as_deref().unwrap_or("No recent 8-K"),
        research.news_mention_count,
        fmt_opt(research.news_sentiment_avg),
        research.congressional_signal_strength,
        research.congressional_buy_count,
        fmt_opt(research.macro_score),
    )
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn dossier() -> ResearchRow {
        ResearchRow {
            ticker: "NVDA".into(),
            research_date: "2026-03-01".into(),
            current_price: Some(900.0),
            price_1w_chg_pct: Some(-4.2),
            price_52w_high: Some(980.0),
            price_52w_low: Some(400.0),
            market_cap: Some(2.2e12),
            pe_ratio: Some(65.0),
            news_mention_count: 7,
            congressional_signal_strength: 55.0,
            congressional_buy_count: 4,
            macro_score: Some(42.0),
            market_regime: "transitioning".into(),
            status: "library_ready".into(),
            ..ResearchRow::default()
        }
    }

    #[test]
    fn prompt_contains_dossier_blocks_and_schema() {
        let prompt = build_analyst_prompt(&dossier(), 0.70, 0.20);
        assert!(prompt.contains("NVDA"));
        assert!(prompt.contains("900.00"));
        assert!(prompt.contains("$2200.0B"));
        assert!(prompt.contains("transitioning"));
        assert!(prompt.contains("WATCH TAGS"));
        assert!(prompt.contains("should_enter"));
        assert!(prompt.contains("research_confidence >= 0.7"));
        assert!(prompt.contains("0.0-0.20"));
    }

    #[test]
    fn quota_block_downgrades_tier_but_not_threshold() {
        use crate::config::Config;
        use crate::store::Store;
        use std::sync::Arc;

        let mut config = Config::default();
        config.llm.quota_soft_limits.insert("reasoning".to_string(), 1000);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let llm = Arc::new(crate::llm::LlmGateway::new(&config, store.clone()));
        let analyst = Analyst::new(store.clone(), llm, 0.70, 0.20, 5);

        assert_eq!(analyst.effective_tier(), LlmTier::Reasoning);

        // Burn past 95% of the soft limit: the analyst runs balanced.
        store.log_llm_usage("reasoning", "m", "test", 900, 100).unwrap();
        assert_eq!(analyst.effective_tier(), LlmTier::Balanced);

        // The promotion bar is untouched by the downgrade.
        assert!((analyst.confidence_threshold - 0.70).abs() < f64::EPSILON);
    }

    #[test]
    fn prompt_handles_missing_fields() {
        let research = ResearchRow {
            ticker: "XYZ".into(),
            research_date: "2026-03-01".into(),
            current_price: Some(10.0),
            status: "partial".into(),
            ..ResearchRow::default()
        };
        let prompt = build_analyst_prompt(&research, 0.70, 0.20);
        assert!(prompt.contains("N/A"));
        assert!(prompt.contains("unknown"));
    }
}
