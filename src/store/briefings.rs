// =============================================================================
// Store: daily briefings and LLM usage accounting
// =============================================================================

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Store;

/// One briefing row per (date, tier).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BriefingRow {
    pub date: String,
    pub tier: String,
    pub model_id: String,
    pub market_regime: String,
    pub regime_confidence: f64,
    pub headline_summary: String,
    pub key_themes: Vec<String>,
    pub biggest_risk: String,
    pub biggest_opportunity: String,
    pub signal_quality: String,
    pub macro_alignment: String,
    pub congressional_alpha: String,
    pub portfolio_assessment: String,
    pub watchlist_tomorrow: Vec<String>,
    pub entry_conditions_tomorrow: String,
    pub defcon_forecast: String,
    pub reasoning_chain: String,
    pub model_confidence: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl BriefingRow {
    /// Parse the model's free-text forecast ("3", "DEFCON 3", "3 - steady")
    /// into a level, when it names one.
    pub fn flash_forecast_level(&self) -> Option<u8> {
        self.defcon_forecast
            .chars()
            .find(|c| ('1'..='5').contains(c))
            .and_then(|c| c.to_digit(10))
            .map(|d| d as u8)
    }
}

impl Store {
    /// Insert or replace the briefing for (date, tier).
    pub fn upsert_briefing(&self, row: &BriefingRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO daily_briefings
                 (date, tier, model_id, market_regime, regime_confidence,
                  headline_summary, key_themes_json, biggest_risk, biggest_opportunity,
                  signal_quality, macro_alignment, congressional_alpha,
                  portfolio_assessment, watchlist_json, entry_conditions,
                  defcon_forecast, reasoning_chain, model_confidence,
                  input_tokens, output_tokens)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)",
                params![
                    row.date,
                    row.tier,
                    row.model_id,
                    row.market_regime,
                    row.regime_confidence,
                    row.headline_summary,
                    serde_json::to_string(&row.key_themes).unwrap_or_default(),
                    row.biggest_risk,
                    row.biggest_opportunity,
                    row.signal_quality,
                    row.macro_alignment,
                    row.congressional_alpha,
                    row.portfolio_assessment,
                    serde_json::to_string(&row.watchlist_tomorrow).unwrap_or_default(),
                    row.entry_conditions_tomorrow,
                    row.defcon_forecast,
                    row.reasoning_chain,
                    row.model_confidence,
                    row.input_tokens,
                    row.output_tokens,
                ],
            )?;
            Ok(())
        })
    }

    /// The most recent briefing, any tier; reasoning tier preferred when both
    /// exist for the same date.
    pub fn latest_briefing(&self) -> Result<Option<BriefingRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {BRIEFING_COLUMNS} FROM daily_briefings
                     ORDER BY date DESC,
                              CASE tier WHEN 'reasoning' THEN 0
                                        WHEN 'balanced' THEN 1 ELSE 2 END,
                              created_at DESC
                     LIMIT 1"
                ),
                [],
                briefing_from_row,
            )
            .optional()
        })
    }

    pub fn briefing_for(&self, date: &str, tier: &str) -> Result<Option<BriefingRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {BRIEFING_COLUMNS} FROM daily_briefings
                     WHERE date = ?1 AND tier = ?2"
                ),
                params![date, tier],
                briefing_from_row,
            )
            .optional()
        })
    }

    // -------------------------------------------------------------------------
    // LLM usage accounting
    // -------------------------------------------------------------------------

    /// Log one gateway call for quota windowing.
    pub fn log_llm_usage(
        &self,
        tier: &str,
        model: &str,
        caller: &str,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<()> {
        let epoch = Utc::now().timestamp();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO llm_usage_log
                 (tier, model, caller, input_tokens, output_tokens, logged_at_epoch)
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![tier, model, caller, input_tokens, output_tokens, epoch],
            )?;
            Ok(())
        })
    }

    /// Total tokens (input + output) spent by a tier in the rolling 24h
    /// window. Backs `check_quota`.
    pub fn llm_tokens_last_24h(&self, tier: &str) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - 24 * 3600;
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(input_tokens + output_tokens), 0)
                 FROM llm_usage_log WHERE tier = ?1 AND logged_at_epoch >= ?2",
                params![tier, cutoff],
                |row| row.get::<_, i64>(0),
            )
            .map(|v| v.max(0) as u64)
        })
    }
}

const BRIEFING_COLUMNS: &str = "date, tier, model_id, market_regime, regime_confidence, \
    headline_summary, key_themes_json, biggest_risk, biggest_opportunity, \
    signal_quality, macro_alignment, congressional_alpha, portfolio_assessment, \
    watchlist_json, entry_conditions, defcon_forecast, reasoning_chain, \
    model_confidence, input_tokens, output_tokens";

fn briefing_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BriefingRow> {
    let themes_json: Option<String> = row.get(6)?;
    let watchlist_json: Option<String> = row.get(13)?;
    Ok(BriefingRow {
        date: row.get(0)?,
        tier: row.get(1)?,
        model_id: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        market_regime: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        regime_confidence: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
        headline_summary: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        key_themes: themes_json.and_then(|j| serde_json::from_str(&j).ok()).unwrap_or_default(),
        biggest_risk: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        biggest_opportunity: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        signal_quality: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        macro_alignment: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        congressional_alpha: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
        portfolio_assessment: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
        watchlist_tomorrow: watchlist_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        entry_conditions_tomorrow: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
        defcon_forecast: row.get::<_, Option<String>>(15)?.unwrap_or_default(),
        reasoning_chain: row.get::<_, Option<String>>(16)?.unwrap_or_default(),
        model_confidence: row.get::<_, Option<f64>>(17)?.unwrap_or(0.0),
        input_tokens: row.get::<_, Option<i64>>(18)?.unwrap_or(0),
        output_tokens: row.get::<_, Option<i64>>(19)?.unwrap_or(0),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn briefing_unique_per_date_and_tier() {
        let store = Store::open_in_memory().unwrap();
        let mut row = BriefingRow {
            date: "2026-03-01".into(),
            tier: "reasoning".into(),
            market_regime: "risk-off".into(),
            watchlist_tomorrow: vec!["MSFT".into(), "TLT".into()],
            defcon_forecast: "DEFCON 3 if selling continues".into(),
            ..BriefingRow::default()
        };
        store.upsert_briefing(&row).unwrap();
        row.market_regime = "transitioning".into();
        store.upsert_briefing(&row).unwrap();

        let count: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM daily_briefings", [], |r| r.get(0))
            })
            .unwrap();
        assert_eq!(count, 1);

        let read = store.briefing_for("2026-03-01", "reasoning").unwrap().unwrap();
        assert_eq!(read.market_regime, "transitioning");
        assert_eq!(read.watchlist_tomorrow.len(), 2);
        assert_eq!(read.flash_forecast_level(), Some(3));
    }

    #[test]
    fn latest_briefing_prefers_reasoning_tier() {
        let store = Store::open_in_memory().unwrap();
        for tier in ["fast", "reasoning", "balanced"] {
            store
                .upsert_briefing(&BriefingRow {
                    date: "2026-03-01".into(),
                    tier: tier.into(),
                    ..BriefingRow::default()
                })
                .unwrap();
        }
        let latest = store.latest_briefing().unwrap().unwrap();
        assert_eq!(latest.tier, "reasoning");
    }

    #[test]
    fn llm_usage_window_sums_tokens() {
        let store = Store::open_in_memory().unwrap();
        store.log_llm_usage("reasoning", "model-x", "analyst", 1000, 500).unwrap();
        store.log_llm_usage("reasoning", "model-x", "briefing", 2000, 700).unwrap();
        store.log_llm_usage("fast", "model-y", "verifier", 400, 100).unwrap();

        assert_eq!(store.llm_tokens_last_24h("reasoning").unwrap(), 4200);
        assert_eq!(store.llm_tokens_last_24h("fast").unwrap(), 500);
        assert_eq!(store.llm_tokens_last_24h("balanced").unwrap(), 0);
    }

    #[test]
    fn forecast_level_parses_loose_text() {
        let mut row = BriefingRow::default();
        row.defcon_forecast = "expected to hold at 4".into();
        assert_eq!(row.flash_forecast_level(), Some(4));
        row.defcon_forecast = "no number here".into();
        assert_eq!(row.flash_forecast_level(), None);
    }
}
