// =============================================================================
// Store: signal snapshots, news signals, LLM analyses, macro rows
// =============================================================================

use anyhow::Result;
use chrono::{DateTime, Duration, Local, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::news::signal::NewsSignal;
use crate::types::CrisisCategory;

use super::Store;

/// One row per monitoring cycle. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct SignalSnapshot {
    pub cycle_id: i64,
    pub timestamp: String,
    pub date: String,
    pub bond_yield: Option<f64>,
    pub vix: Option<f64>,
    pub market_change_pct: Option<f64>,
    pub defcon_level: u8,
    pub composite_score: f64,
    pub news_score: f64,
    pub degraded: bool,
}

/// A persisted news signal, as read back for override checks and briefings.
#[derive(Debug, Clone, Serialize)]
pub struct StoredNewsSignal {
    pub news_signal_id: i64,
    pub timestamp: String,
    pub news_score: f64,
    pub dominant_crisis_type: CrisisCategory,
    pub crisis_description: String,
    pub breaking_news_override: bool,
    pub recommended_defcon: Option<u8>,
    pub article_count: i64,
    pub breaking_count: i64,
    pub sentiment_summary: String,
    pub score_components_json: String,
    pub keyword_hits_json: String,
}

/// Parsed reasoning-tier analysis fields the DEFCON engine consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningAdjustment {
    pub enhanced_confidence: f64,
    pub confidence_adjustment: f64,
    pub recommended_action: String,
    pub reasoning: String,
}

/// Insert payload for an LLM analysis record.
#[derive(Debug, Clone)]
pub struct LlmAnalysisInsert {
    pub news_signal_id: i64,
    pub tier: String,
    pub model: String,
    pub trigger_kind: String,
    pub narrative_coherence: f64,
    pub hidden_risks_json: String,
    pub recommended_action: String,
    pub reasoning: String,
    pub enhanced_confidence: f64,
    pub confidence_adjustment: f64,
    pub defcon_recommendation: Option<u8>,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Macro collector output as persisted.
#[derive(Debug, Clone, Serialize)]
pub struct MacroRow {
    pub yield_curve_spread: Option<f64>,
    pub fed_funds_rate: Option<f64>,
    pub unemployment_rate: Option<f64>,
    pub m2_yoy_change: Option<f64>,
    pub hy_oas_bps: Option<f64>,
    pub consumer_sentiment: Option<f64>,
    pub rate_10y: Option<f64>,
    pub rate_2y: Option<f64>,
    pub macro_score: f64,
    pub defcon_modifier: f64,
    pub bearish_signals: i64,
    pub bullish_signals: i64,
    pub signals_json: String,
}

impl Store {
    // -------------------------------------------------------------------------
    // Signal snapshots
    // -------------------------------------------------------------------------

    pub fn record_snapshot(
        &self,
        bond_yield: Option<f64>,
        vix: Option<f64>,
        market_change_pct: Option<f64>,
        defcon_level: u8,
        composite_score: f64,
        news_score: f64,
        degraded: bool,
    ) -> Result<i64> {
        let now = Utc::now();
        let date = Local::now().format("%Y-%m-%d").to_string();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO signal_monitoring
                 (timestamp, date, bond_yield, vix, market_change_pct,
                  defcon_level, composite_score, news_score, degraded)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    now.to_rfc3339(),
                    date,
                    bond_yield,
                    vix,
                    market_change_pct,
                    defcon_level as i64,
                    composite_score,
                    news_score,
                    degraded as i64,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn latest_snapshot(&self) -> Result<Option<SignalSnapshot>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT cycle_id, timestamp, date, bond_yield, vix, market_change_pct,
                        defcon_level, composite_score, news_score, degraded
                 FROM signal_monitoring ORDER BY cycle_id DESC LIMIT 1",
                [],
                snapshot_from_row,
            )
            .optional()
        })
    }

    pub fn snapshots_for_date(&self, date: &str) -> Result<Vec<SignalSnapshot>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT cycle_id, timestamp, date, bond_yield, vix, market_change_pct,
                        defcon_level, composite_score, news_score, degraded
                 FROM signal_monitoring WHERE date = ?1 ORDER BY cycle_id ASC",
            )?;
            let rows = stmt.query_map([date], snapshot_from_row)?;
            rows.collect()
        })
    }

    // -------------------------------------------------------------------------
    // News signals
    // -------------------------------------------------------------------------

    /// Insert a new news-signal row (new batches always insert, never update).
    pub fn insert_news_signal(&self, signal: &NewsSignal) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO news_signals
                 (timestamp, news_score, dominant_crisis_type, crisis_description,
                  breaking_news_override, recommended_defcon, article_count,
                  breaking_count, avg_confidence, sentiment_summary, sentiment_net,
                  signal_concentration, crisis_distribution_json,
                  score_components_json, keyword_hits_json, articles_json)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
                params![
                    now,
                    signal.news_score,
                    signal.dominant_crisis_type.as_str(),
                    signal.crisis_description,
                    signal.breaking_news_override as i64,
                    signal.recommended_defcon.map(|d| d as i64),
                    signal.article_count as i64,
                    signal.breaking_count as i64,
                    signal.avg_confidence,
                    signal.sentiment_summary,
                    signal.score_components.sentiment_net,
                    signal.score_components.signal_concentration,
                    serde_json::to_string(&signal.crisis_distribution).unwrap_or_default(),
                    serde_json::to_string(&signal.score_components).unwrap_or_default(),
                    serde_json::to_string(&signal.keyword_hits).unwrap_or_default(),
                    serde_json::to_string(&signal.contributing_articles).unwrap_or_default(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Attach the fast-tier analysis blob to an existing news-signal row.
    pub fn attach_fast_analysis(&self, news_signal_id: i64, json: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE news_signals SET fast_analysis_json = ?1 WHERE news_signal_id = ?2",
                params![json, news_signal_id],
            )?;
            Ok(())
        })
    }

    /// Timestamp and URL set of the most recent news-signal row, for
    /// new-article detection.
    pub fn latest_news_urls(&self) -> Result<Option<(DateTime<Utc>, Vec<String>)>> {
        let row: Option<(String, Option<String>)> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT timestamp, articles_json FROM news_signals
                 ORDER BY news_signal_id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })?;

        let Some((timestamp, articles_json)) = row else {
            return Ok(None);
        };
        let parsed_at = DateTime::parse_from_rfc3339(&timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        let urls = articles_json
            .and_then(|json| serde_json::from_str::<serde_json::Value>(&json).ok())
            .and_then(|value| {
                value.as_array().map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.get("url").and_then(|u| u.as_str()))
                        .map(|u| u.to_string())
                        .collect::<Vec<_>>()
                })
            })
            .unwrap_or_default();

        Ok(Some((parsed_at, urls)))
    }

    /// Most recent breaking-override signal within the window, if any.
    pub fn active_breaking_signal(&self, within_hours: i64) -> Result<Option<StoredNewsSignal>> {
        let cutoff = (Utc::now() - Duration::hours(within_hours)).to_rfc3339();
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT news_signal_id, timestamp, news_score, dominant_crisis_type,
                        crisis_description, breaking_news_override, recommended_defcon,
                        article_count, breaking_count, sentiment_summary,
                        score_components_json, keyword_hits_json
                 FROM news_signals
                 WHERE breaking_news_override = 1 AND timestamp > ?1
                 ORDER BY timestamp DESC LIMIT 1",
                [cutoff],
                stored_news_from_row,
            )
            .optional()
        })
    }

    pub fn top_news_signals_for_date(
        &self,
        date: &str,
        limit: usize,
    ) -> Result<Vec<StoredNewsSignal>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT news_signal_id, timestamp, news_score, dominant_crisis_type,
                        crisis_description, breaking_news_override, recommended_defcon,
                        article_count, breaking_count, sentiment_summary,
                        score_components_json, keyword_hits_json
                 FROM news_signals
                 WHERE timestamp LIKE ?1 || '%'
                 ORDER BY news_score DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![date, limit as i64], stored_news_from_row)?;
            rows.collect()
        })
    }

    /// Recent news-signal lines mentioning `ticker` in the keyword histogram,
    /// newest and strongest first.
    pub fn news_mentions_for_ticker(
        &self,
        ticker: &str,
        days_back: i64,
        limit: usize,
    ) -> Result<Vec<(String, f64, String)>> {
        let since = (Utc::now() - Duration::days(days_back)).to_rfc3339();
        let pattern = format!("%{}%", ticker.to_uppercase());
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, news_score, sentiment_summary FROM news_signals
                 WHERE timestamp >= ?1 AND UPPER(articles_json) LIKE ?2
                 ORDER BY news_score DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![since, pattern, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect()
        })
    }

    // -------------------------------------------------------------------------
    // LLM analyses
    // -------------------------------------------------------------------------

    pub fn insert_llm_analysis(&self, insert: &LlmAnalysisInsert) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO llm_analysis
                 (news_signal_id, tier, model, trigger_kind, narrative_coherence,
                  hidden_risks_json, recommended_action, reasoning,
                  enhanced_confidence, confidence_adjustment, defcon_recommendation,
                  input_tokens, output_tokens)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                params![
                    insert.news_signal_id,
                    insert.tier,
                    insert.model,
                    insert.trigger_kind,
                    insert.narrative_coherence,
                    insert.hidden_risks_json,
                    insert.recommended_action,
                    insert.reasoning,
                    insert.enhanced_confidence,
                    insert.confidence_adjustment,
                    insert.defcon_recommendation.map(|d| d as i64),
                    insert.input_tokens,
                    insert.output_tokens,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Latest reasoning-tier adjustment for a news signal (the input to the
    /// DEFCON hard overrides).
    pub fn reasoning_adjustment_for(
        &self,
        news_signal_id: i64,
    ) -> Result<Option<ReasoningAdjustment>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT enhanced_confidence, confidence_adjustment,
                        recommended_action, reasoning
                 FROM llm_analysis
                 WHERE news_signal_id = ?1 AND tier = 'reasoning'
                 ORDER BY created_at DESC LIMIT 1",
                [news_signal_id],
                |row| {
                    Ok(ReasoningAdjustment {
                        enhanced_confidence: row.get(0)?,
                        confidence_adjustment: row.get(1)?,
                        recommended_action: row.get(2)?,
                        reasoning: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Action/theme summaries for a date's analyses, for the daily briefing.
    pub fn analyses_for_date(&self, date: &str, tier: &str) -> Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT recommended_action, reasoning FROM llm_analysis
                 WHERE tier = ?1 AND created_at LIKE ?2 || '%'
                 ORDER BY created_at DESC LIMIT 10",
            )?;
            let rows = stmt.query_map(params![tier, date], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect()
        })
    }

    // -------------------------------------------------------------------------
    // Macro rows
    // -------------------------------------------------------------------------

    pub fn insert_macro_row(&self, row: &MacroRow) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO macro_indicators
                 (yield_curve_spread, fed_funds_rate, unemployment_rate, m2_yoy_change,
                  hy_oas_bps, consumer_sentiment, rate_10y, rate_2y, macro_score,
                  defcon_modifier, bearish_signals, bullish_signals, signals_json)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                params![
                    row.yield_curve_spread,
                    row.fed_funds_rate,
                    row.unemployment_rate,
                    row.m2_yoy_change,
                    row.hy_oas_bps,
                    row.consumer_sentiment,
                    row.rate_10y,
                    row.rate_2y,
                    row.macro_score,
                    row.defcon_modifier,
                    row.bearish_signals,
                    row.bullish_signals,
                    row.signals_json,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn latest_macro_row(&self) -> Result<Option<MacroRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT yield_curve_spread, fed_funds_rate, unemployment_rate,
                        m2_yoy_change, hy_oas_bps, consumer_sentiment, rate_10y,
                        rate_2y, macro_score, defcon_modifier, bearish_signals,
                        bullish_signals, signals_json
                 FROM macro_indicators ORDER BY macro_id DESC LIMIT 1",
                [],
                |row| {
                    Ok(MacroRow {
                        yield_curve_spread: row.get(0)?,
                        fed_funds_rate: row.get(1)?,
                        unemployment_rate: row.get(2)?,
                        m2_yoy_change: row.get(3)?,
                        hy_oas_bps: row.get(4)?,
                        consumer_sentiment: row.get(5)?,
                        rate_10y: row.get(6)?,
                        rate_2y: row.get(7)?,
                        macro_score: row.get(8)?,
                        defcon_modifier: row.get(9)?,
                        bearish_signals: row.get(10)?,
                        bullish_signals: row.get(11)?,
                        signals_json: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
                    })
                },
            )
            .optional()
        })
    }
}

fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SignalSnapshot> {
    Ok(SignalSnapshot {
        cycle_id: row.get(0)?,
        timestamp: row.get(1)?,
        date: row.get(2)?,
        bond_yield: row.get(3)?,
        vix: row.get(4)?,
        market_change_pct: row.get(5)?,
        defcon_level: row.get::<_, i64>(6)? as u8,
        composite_score: row.get(7)?,
        news_score: row.get(8)?,
        degraded: row.get::<_, i64>(9)? != 0,
    })
}

fn stored_news_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredNewsSignal> {
    Ok(StoredNewsSignal {
        news_signal_id: row.get(0)?,
        timestamp: row.get(1)?,
        news_score: row.get(2)?,
        dominant_crisis_type: CrisisCategory::parse(
            &row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        ),
        crisis_description: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        breaking_news_override: row.get::<_, i64>(5)? != 0,
        recommended_defcon: row.get::<_, Option<i64>>(6)?.map(|d| d as u8),
        article_count: row.get(7)?,
        breaking_count: row.get(8)?,
        sentiment_summary: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        score_components_json: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        keyword_hits_json: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::news::signal::NewsSignal;

    #[test]
    fn snapshot_roundtrip_and_latest() {
        let store = Store::open_in_memory().unwrap();
        store
            .record_snapshot(Some(4.1), Some(22.0), Some(-0.5), 4, 25.0, 10.0, false)
            .unwrap();
        store
            .record_snapshot(Some(4.2), Some(28.0), Some(-2.1), 3, 45.0, 30.0, false)
            .unwrap();

        let latest = store.latest_snapshot().unwrap().unwrap();
        assert_eq!(latest.defcon_level, 3);
        assert!((latest.composite_score - 45.0).abs() < f64::EPSILON);
        assert!(latest.defcon_level >= 1 && latest.defcon_level <= 5);
    }

    #[test]
    fn news_signal_insert_and_url_detection() {
        let store = Store::open_in_memory().unwrap();
        let mut signal = NewsSignal::empty();
        signal.contributing_articles.push(crate::news::signal::ContributingArticle {
            title: "t".into(),
            description: "d".into(),
            source: "Reuters".into(),
            published_at: Utc::now().to_rfc3339(),
            url: "https://example.com/1".into(),
            sentiment: "bearish".into(),
            urgency: "breaking".into(),
            confidence: 80.0,
            crisis_type: "liquidity_credit".into(),
        });
        let id = store.insert_news_signal(&signal).unwrap();
        assert!(id > 0);

        let (_, urls) = store.latest_news_urls().unwrap().unwrap();
        assert_eq!(urls, vec!["https://example.com/1".to_string()]);
    }

    #[test]
    fn reasoning_adjustment_read_back() {
        let store = Store::open_in_memory().unwrap();
        let signal_id = store.insert_news_signal(&NewsSignal::empty()).unwrap();
        store
            .insert_llm_analysis(&LlmAnalysisInsert {
                news_signal_id: signal_id,
                tier: "reasoning".into(),
                model: "test-model".into(),
                trigger_kind: "elevated".into(),
                narrative_coherence: 0.8,
                hidden_risks_json: "[]".into(),
                recommended_action: "HOLD".into(),
                reasoning: "coherent narrative".into(),
                enhanced_confidence: 88.0,
                confidence_adjustment: 5.0,
                defcon_recommendation: Some(2),
                input_tokens: 1000,
                output_tokens: 300,
            })
            .unwrap();

        let adj = store.reasoning_adjustment_for(signal_id).unwrap().unwrap();
        assert!((adj.enhanced_confidence - 88.0).abs() < f64::EPSILON);

        // Fast-tier rows never satisfy the reasoning lookup.
        let other = store.insert_news_signal(&NewsSignal::empty()).unwrap();
        assert!(store.reasoning_adjustment_for(other).unwrap().is_none());
    }

    #[test]
    fn macro_row_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_macro_row(&MacroRow {
                yield_curve_spread: Some(-0.4),
                fed_funds_rate: Some(5.25),
                unemployment_rate: Some(4.1),
                m2_yoy_change: Some(-2.5),
                hy_oas_bps: Some(410.0),
                consumer_sentiment: Some(63.0),
                rate_10y: Some(4.4),
                rate_2y: Some(4.8),
                macro_score: 28.0,
                defcon_modifier: -1.0,
                bearish_signals: 4,
                bullish_signals: 0,
                signals_json: "[]".into(),
            })
            .unwrap();

        let row = store.latest_macro_row().unwrap().unwrap();
        assert!((row.macro_score - 28.0).abs() < f64::EPSILON);
        assert!((row.defcon_modifier + 1.0).abs() < f64::EPSILON);
    }
}
