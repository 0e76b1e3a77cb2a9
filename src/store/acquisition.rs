// =============================================================================
// Store: acquisition watchlist, research library, conditional entries
// =============================================================================
//
// Watchlist state machine:
//
//   pending -> researched -> (analyst_pass | conditional_set)
//                              conditional_set -> (invalidated | triggered | expired)
//           -> research_error
//
// Terminal states: invalidated, triggered, expired, research_error,
// analyst_pass. Re-entry for a ticker is a NEW row on a later date.
//
// Conditional invariant: at most one `active` row per ticker. Enforced by
// supersession — inserting a fresh conditional first invalidates the prior
// active one inside the same transaction.
// =============================================================================

use anyhow::Result;
use chrono::{Local, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::Store;

// -----------------------------------------------------------------------------
// Status enums
// -----------------------------------------------------------------------------

/// Where a watchlist ticker came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchSource {
    DailyBriefing,
    StopLossRebound,
    ProfitTargetReaccumulation,
    Manual,
    GrokHound,
}

impl WatchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DailyBriefing => "daily_briefing",
            Self::StopLossRebound => "stop_loss_rebound",
            Self::ProfitTargetReaccumulation => "profit_target_reaccumulation",
            Self::Manual => "manual",
            Self::GrokHound => "grok_hound",
        }
    }
}

/// Watchlist row lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchStatus {
    Pending,
    Researched,
    ConditionalSet,
    AnalystPass,
    ResearchError,
    Invalidated,
    Triggered,
    Expired,
}

impl WatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Researched => "researched",
            Self::ConditionalSet => "conditional_set",
            Self::AnalystPass => "analyst_pass",
            Self::ResearchError => "research_error",
            Self::Invalidated => "invalidated",
            Self::Triggered => "triggered",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "researched" => Some(Self::Researched),
            "conditional_set" => Some(Self::ConditionalSet),
            "analyst_pass" => Some(Self::AnalystPass),
            "research_error" => Some(Self::ResearchError),
            "invalidated" => Some(Self::Invalidated),
            "triggered" => Some(Self::Triggered),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Statuses a row in this state may legally move to.
    pub fn allowed_successors(&self) -> &'static [WatchStatus] {
        match self {
            Self::Pending => &[Self::Researched, Self::ResearchError],
            Self::Researched => &[Self::AnalystPass, Self::ConditionalSet],
            Self::ConditionalSet => &[Self::Invalidated, Self::Triggered, Self::Expired],
            // Terminal states.
            Self::AnalystPass
            | Self::ResearchError
            | Self::Invalidated
            | Self::Triggered
            | Self::Expired => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_successors().is_empty()
    }
}

/// Research library row lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryStatus {
    LibraryReady,
    Partial,
    Expired,
    AnalystPass,
    Analysed,
}

impl LibraryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LibraryReady => "library_ready",
            Self::Partial => "partial",
            Self::Expired => "expired",
            Self::AnalystPass => "analyst_pass",
            Self::Analysed => "analysed",
        }
    }
}

/// Conditional entry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionalStatus {
    Active,
    Triggered,
    Invalidated,
    Flagged,
    Expired,
}

impl ConditionalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Triggered => "triggered",
            Self::Invalidated => "invalidated",
            Self::Flagged => "flagged",
            Self::Expired => "expired",
        }
    }
}

/// The seven setup categories an analyst can assign to a conditional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchTag {
    Breakout,
    MeanReversion,
    Momentum,
    DefensiveHedge,
    MacroHedge,
    EarningsPlay,
    Rebound,
}

impl WatchTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Breakout => "breakout",
            Self::MeanReversion => "mean-reversion",
            Self::Momentum => "momentum",
            Self::DefensiveHedge => "defensive-hedge",
            Self::MacroHedge => "macro-hedge",
            Self::EarningsPlay => "earnings-play",
            Self::Rebound => "rebound",
        }
    }

    /// Analyst output defaults to mean-reversion when the tag is missing or
    /// unrecognized.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "breakout" => Self::Breakout,
            "momentum" => Self::Momentum,
            "defensive-hedge" => Self::DefensiveHedge,
            "macro-hedge" => Self::MacroHedge,
            "earnings-play" => Self::EarningsPlay,
            "rebound" => Self::Rebound,
            _ => Self::MeanReversion,
        }
    }
}

// -----------------------------------------------------------------------------
// Row types
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct WatchlistEntry {
    pub watchlist_id: i64,
    pub date_added: String,
    pub ticker: String,
    pub source: String,
    pub model_confidence: f64,
    pub entry_conditions: String,
    pub status: WatchStatus,
    pub notes: String,
}

/// The full research dossier written by the researcher and read by the
/// analyst. Provider payloads are preserved verbatim in `provider_blobs_json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchRow {
    pub ticker: String,
    pub research_date: String,
    pub current_price: Option<f64>,
    pub price_1w_chg_pct: Option<f64>,
    pub price_1m_chg_pct: Option<f64>,
    pub price_52w_high: Option<f64>,
    pub price_52w_low: Option<f64>,
    pub avg_volume_20d: Option<i64>,
    pub market_cap: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub forward_pe: Option<f64>,
    pub profit_margin: Option<f64>,
    pub revenue_growth_yoy: Option<f64>,
    pub debt_to_equity: Option<f64>,
    pub analyst_target_mean: Option<f64>,
    pub analyst_target_high: Option<f64>,
    pub analyst_target_low: Option<f64>,
    pub analyst_buy_count: i64,
    pub analyst_hold_count: i64,
    pub analyst_sell_count: i64,
    pub latest_filing_type: Option<String>,
    pub latest_filing_date: Option<String>,
    pub filings_summary: Option<String>,
    pub news_mention_count: i64,
    pub news_sentiment_avg: Option<f64>,
    pub congressional_signal_strength: f64,
    pub congressional_buy_count: i64,
    pub macro_score: Option<f64>,
    pub market_regime: String,
    pub provider_blobs_json: String,
    pub status: String,
    pub error_notes: Option<String>,
}

/// Analyst-approved trade plan.
#[derive(Debug, Clone, Serialize)]
pub struct ConditionalRow {
    pub conditional_id: i64,
    pub ticker: String,
    pub date_created: String,
    pub entry_price_target: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub position_size_pct: f64,
    pub time_horizon_days: i64,
    pub entry_conditions: Vec<String>,
    pub invalidation_conditions: Vec<String>,
    pub thesis_summary: String,
    pub key_risks: Vec<String>,
    pub watch_tag: WatchTag,
    pub research_confidence: f64,
    pub status: String,
    pub verification_count: i64,
    pub last_verified: Option<String>,
    pub verification_notes: Option<String>,
}

/// Insert payload for a fresh conditional.
#[derive(Debug, Clone)]
pub struct ConditionalInsert {
    pub ticker: String,
    pub entry_price_target: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub position_size_pct: f64,
    pub time_horizon_days: i64,
    pub entry_conditions: Vec<String>,
    pub invalidation_conditions: Vec<String>,
    pub thesis_summary: String,
    pub key_risks: Vec<String>,
    pub watch_tag: WatchTag,
    pub research_confidence: f64,
}

// -----------------------------------------------------------------------------
// Store methods
// -----------------------------------------------------------------------------

impl Store {
    // --- Watchlist -----------------------------------------------------------

    /// Queue a ticker for research. Upserts on (date_added, ticker) so a
    /// re-run of the same briefing is idempotent.
    pub fn queue_watchlist(
        &self,
        date_added: &str,
        ticker: &str,
        source: WatchSource,
        model_confidence: f64,
        entry_conditions: &str,
        notes: &str,
    ) -> Result<()> {
        let ticker = ticker.trim().to_uppercase();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO acquisition_watchlist
                 (date_added, ticker, source, model_confidence, entry_conditions,
                  status, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
                params![date_added, ticker, source.as_str(), model_confidence, entry_conditions, notes],
            )?;
            Ok(())
        })?;
        info!(ticker = %ticker, source = source.as_str(), "watchlist ticker queued");
        Ok(())
    }

    /// Pending tickers, most recent date first then confidence descending.
    pub fn pending_watchlist(&self, limit: usize) -> Result<Vec<WatchlistEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT watchlist_id, date_added, ticker, source, model_confidence,
                        entry_conditions, status, notes
                 FROM acquisition_watchlist
                 WHERE status = 'pending'
                 ORDER BY date_added DESC, model_confidence DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], watchlist_from_row)?;
            rows.collect()
        })
    }

    /// Transition every row for `ticker` currently in one of `from` to `to`.
    ///
    /// Illegal transitions (per the state machine) are refused and logged as
    /// invariant violations; nothing is mutated in that case.
    pub fn transition_watchlist(
        &self,
        ticker: &str,
        from: &[WatchStatus],
        to: WatchStatus,
        notes: Option<&str>,
    ) -> Result<usize> {
        if from.is_empty() {
            return Ok(0);
        }
        for status in from {
            if !status.allowed_successors().contains(&to) {
                error!(
                    ticker,
                    from = status.as_str(),
                    to = to.as_str(),
                    "invariant violation: illegal watchlist transition refused"
                );
                return Ok(0);
            }
        }

        let from_list = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "UPDATE acquisition_watchlist SET status = ?1, notes = COALESCE(?2, notes)
             WHERE UPPER(ticker) = UPPER(?3) AND status IN ({from_list})"
        );
        self.with_conn(|conn| {
            let changed = conn.execute(&sql, params![to.as_str(), notes, ticker])?;
            Ok(changed)
        })
    }

    pub fn watchlist_status_of(&self, ticker: &str) -> Result<Option<WatchStatus>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT status FROM acquisition_watchlist
                 WHERE UPPER(ticker) = UPPER(?1)
                 ORDER BY date_added DESC, watchlist_id DESC LIMIT 1",
                [ticker],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map(|s| s.and_then(|s| WatchStatus::parse(&s)))
        })
    }

    // --- Research library ----------------------------------------------------

    /// Mark research older than `stale_days` as expired so it is re-gathered.
    pub fn expire_stale_research(&self, stale_days: i64) -> Result<usize> {
        let cutoff = (Local::now() - chrono::Duration::days(stale_days))
            .format("%Y-%m-%d")
            .to_string();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE stock_research_library SET status = 'expired'
                 WHERE research_date < ?1 AND status = 'library_ready'",
                [cutoff],
            )?;
            Ok(changed)
        })
    }

    /// Upsert a dossier on (ticker, research_date): running the researcher
    /// twice on the same day replaces the row rather than duplicating it.
    pub fn upsert_research(&self, row: &ResearchRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO stock_research_library (
                    ticker, research_date, current_price, price_1w_chg_pct,
                    price_1m_chg_pct, price_52w_high, price_52w_low, avg_volume_20d,
                    market_cap, pe_ratio, forward_pe, profit_margin,
                    revenue_growth_yoy, debt_to_equity, analyst_target_mean,
                    analyst_target_high, analyst_target_low, analyst_buy_count,
                    analyst_hold_count, analyst_sell_count, latest_filing_type,
                    latest_filing_date, filings_summary, news_mention_count,
                    news_sentiment_avg, congressional_signal_strength,
                    congressional_buy_count, macro_score, market_regime,
                    provider_blobs_json, status, error_notes
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,
                           ?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27,?28,?29,?30,
                           ?31,?32)",
                params![
                    row.ticker,
                    row.research_date,
                    row.current_price,
                    row.price_1w_chg_pct,
                    row.price_1m_chg_pct,
                    row.price_52w_high,
                    row.price_52w_low,
                    row.avg_volume_20d,
                    row.market_cap,
                    row.pe_ratio,
                    row.forward_pe,
                    row.profit_margin,
                    row.revenue_growth_yoy,
                    row.debt_to_equity,
                    row.analyst_target_mean,
                    row.analyst_target_high,
                    row.analyst_target_low,
                    row.analyst_buy_count,
                    row.analyst_hold_count,
                    row.analyst_sell_count,
                    row.latest_filing_type,
                    row.latest_filing_date,
                    row.filings_summary,
                    row.news_mention_count,
                    row.news_sentiment_avg,
                    row.congressional_signal_strength,
                    row.congressional_buy_count,
                    row.macro_score,
                    row.market_regime,
                    row.provider_blobs_json,
                    row.status,
                    row.error_notes,
                ],
            )?;
            Ok(())
        })
    }

    /// Dossiers awaiting analysis, FIFO by creation.
    pub fn ready_research(&self, limit: usize) -> Result<Vec<ResearchRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RESEARCH_COLUMNS} FROM stock_research_library
                 WHERE status IN ('library_ready', 'partial')
                 ORDER BY created_at ASC LIMIT ?1"
            ))?;
            let rows = stmt.query_map([limit as i64], research_from_row)?;
            rows.collect()
        })
    }

    pub fn latest_research(&self, ticker: &str) -> Result<Option<ResearchRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {RESEARCH_COLUMNS} FROM stock_research_library
                     WHERE UPPER(ticker) = UPPER(?1)
                     ORDER BY research_date DESC, library_id DESC LIMIT 1"
                ),
                [ticker],
                research_from_row,
            )
            .optional()
        })
    }

    /// Move a ticker's in-flight dossier to a new status.
    pub fn set_library_status(&self, ticker: &str, to: LibraryStatus) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE stock_research_library SET status = ?1
                 WHERE UPPER(ticker) = UPPER(?2) AND status IN ('library_ready', 'partial')",
                params![to.as_str(), ticker],
            )?;
            Ok(changed)
        })
    }

    // --- Conditionals --------------------------------------------------------

    /// Insert a fresh conditional for a ticker, superseding any prior active
    /// one inside the same transaction. Returns the new row id.
    pub fn supersede_and_insert_conditional(&self, insert: &ConditionalInsert) -> Result<i64> {
        let date_created = Local::now().format("%Y-%m-%d").to_string();
        let now = Utc::now().to_rfc3339();
        let id = self.with_conn(|conn| {
            let tx_note = format!("Superseded by fresh analyst run on {date_created}");
            conn.execute("BEGIN IMMEDIATE", [])?;
            conn.execute(
                "UPDATE conditional_tracking
                 SET status = 'invalidated', verification_notes = ?1, updated_at = ?2
                 WHERE UPPER(ticker) = UPPER(?3) AND status = 'active'",
                params![tx_note, now, insert.ticker],
            )?;
            let result = conn.execute(
                "INSERT INTO conditional_tracking
                 (ticker, date_created, entry_price_target, stop_loss, take_profit_1,
                  take_profit_2, position_size_pct, time_horizon_days,
                  entry_conditions_json, invalidation_conditions_json, thesis_summary,
                  key_risks_json, watch_tag, research_confidence, status, last_verified)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,'active',?15)",
                params![
                    insert.ticker.to_uppercase(),
                    date_created,
                    insert.entry_price_target,
                    insert.stop_loss,
                    insert.take_profit_1,
                    insert.take_profit_2,
                    insert.position_size_pct,
                    insert.time_horizon_days,
                    serde_json::to_string(&insert.entry_conditions).unwrap_or_default(),
                    serde_json::to_string(&insert.invalidation_conditions).unwrap_or_default(),
                    insert.thesis_summary,
                    serde_json::to_string(&insert.key_risks).unwrap_or_default(),
                    insert.watch_tag.as_str(),
                    insert.research_confidence,
                    now,
                ],
            );
            match result {
                Ok(_) => {
                    let id = conn.last_insert_rowid();
                    conn.execute("COMMIT", [])?;
                    Ok(id)
                }
                Err(e) => {
                    let _ = conn.execute("ROLLBACK", []);
                    Err(e)
                }
            }
        })?;
        info!(ticker = %insert.ticker, conditional_id = id, "conditional set");
        Ok(id)
    }

    pub fn active_conditionals(&self) -> Result<Vec<ConditionalRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONDITIONAL_COLUMNS} FROM conditional_tracking
                 WHERE status = 'active' ORDER BY research_confidence DESC"
            ))?;
            let rows = stmt.query_map([], conditional_from_row)?;
            rows.collect()
        })
    }

    pub fn count_active_conditionals_for(&self, ticker: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM conditional_tracking
                 WHERE UPPER(ticker) = UPPER(?1) AND status = 'active'",
                [ticker],
                |row| row.get(0),
            )
        })
    }

    /// Verifier verdict: confirm. Bumps the count and the timestamp.
    pub fn confirm_conditional(&self, conditional_id: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE conditional_tracking
                 SET last_verified = ?1, verification_count = verification_count + 1,
                     updated_at = ?1
                 WHERE conditional_id = ?2",
                params![now, conditional_id],
            )?;
            Ok(())
        })
    }

    /// Verifier verdict: flag. Status stays active; the concern is prepended
    /// to the verification notes.
    pub fn flag_conditional(&self, conditional_id: i64, note: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let date = Local::now().format("%Y-%m-%d").to_string();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE conditional_tracking
                 SET verification_notes = '[FLAGGED ' || ?1 || '] ' || ?2 || char(10) ||
                                          COALESCE(verification_notes, ''),
                     last_verified = ?3,
                     verification_count = verification_count + 1,
                     updated_at = ?3
                 WHERE conditional_id = ?4",
                params![date, note, now, conditional_id],
            )?;
            Ok(())
        })
    }

    /// Verifier verdict (or broker invalidation): the thesis has failed.
    pub fn invalidate_conditional(&self, conditional_id: i64, reason: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE conditional_tracking
                 SET status = 'invalidated', verification_notes = ?1,
                     last_verified = ?2, verification_count = verification_count + 1,
                     updated_at = ?2
                 WHERE conditional_id = ?3",
                params![reason, now, conditional_id],
            )?;
            Ok(())
        })
    }

    pub fn mark_conditional_triggered(&self, conditional_id: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE conditional_tracking
                 SET status = 'triggered', updated_at = ?1 WHERE conditional_id = ?2",
                params![now, conditional_id],
            )?;
            Ok(())
        })
    }

    /// Expire active conditionals whose time horizon has passed without a
    /// trigger. Returns the tickers expired.
    pub fn expire_conditionals_past_horizon(&self) -> Result<Vec<String>> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conditional_id, ticker FROM conditional_tracking
                 WHERE status = 'active' AND time_horizon_days > 0
                   AND DATE(date_created, '+' || time_horizon_days || ' days') < DATE('now')",
            )?;
            let expired: Vec<(i64, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;

            for (id, _) in &expired {
                conn.execute(
                    "UPDATE conditional_tracking
                     SET status = 'expired', updated_at = ?1 WHERE conditional_id = ?2",
                    params![now, id],
                )?;
            }
            Ok(expired.into_iter().map(|(_, t)| t).collect())
        })
    }

    // --- Hound candidates ----------------------------------------------------

    pub fn insert_hound_candidate(
        &self,
        ticker: &str,
        meme_score: i64,
        thesis: &str,
        signals_json: &str,
        risks_json: &str,
        action: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO hound_candidates
                 (ticker, meme_score, thesis, signals_json, risks_json, action_suggestion)
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![ticker, meme_score, thesis, signals_json, risks_json, action],
            )?;
            Ok(())
        })
    }
}

const RESEARCH_COLUMNS: &str = "ticker, research_date, current_price, price_1w_chg_pct, \
    price_1m_chg_pct, price_52w_high, price_52w_low, avg_volume_20d, market_cap, \
    pe_ratio, forward_pe, profit_margin, revenue_growth_yoy, debt_to_equity, \
    analyst_target_mean, analyst_target_high, analyst_target_low, analyst_buy_count, \
    analyst_hold_count, analyst_sell_count, latest_filing_type, latest_filing_date, \
    filings_summary, news_mention_count, news_sentiment_avg, \
    congressional_signal_strength, congressional_buy_count, macro_score, \
    market_regime, provider_blobs_json, status, error_notes";

const CONDITIONAL_COLUMNS: &str = "conditional_id, ticker, date_created, \
    entry_price_target, stop_loss, take_profit_1, take_profit_2, position_size_pct, \
    time_horizon_days, entry_conditions_json, invalidation_conditions_json, \
    thesis_summary, key_risks_json, watch_tag, research_confidence, status, \
    verification_count, last_verified, verification_notes";

fn watchlist_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WatchlistEntry> {
    let status: String = row.get(6)?;
    Ok(WatchlistEntry {
        watchlist_id: row.get(0)?,
        date_added: row.get(1)?,
        ticker: row.get(2)?,
        source: row.get(3)?,
        model_confidence: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
        entry_conditions: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        status: WatchStatus::parse(&status).unwrap_or(WatchStatus::Pending),
        notes: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
    })
}

fn research_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResearchRow> {
    Ok(ResearchRow {
        ticker: row.get(0)?,
        research_date: row.get(1)?,
        current_price: row.get(2)?,
        price_1w_chg_pct: row.get(3)?,
        price_1m_chg_pct: row.get(4)?,
        price_52w_high: row.get(5)?,
        price_52w_low: row.get(6)?,
        avg_volume_20d: row.get(7)?,
        market_cap: row.get(8)?,
        pe_ratio: row.get(9)?,
        forward_pe: row.get(10)?,
        profit_margin: row.get(11)?,
        revenue_growth_yoy: row.get(12)?,
        debt_to_equity: row.get(13)?,
        analyst_target_mean: row.get(14)?,
        analyst_target_high: row.get(15)?,
        analyst_target_low: row.get(16)?,
        analyst_buy_count: row.get::<_, Option<i64>>(17)?.unwrap_or(0),
        analyst_hold_count: row.get::<_, Option<i64>>(18)?.unwrap_or(0),
        analyst_sell_count: row.get::<_, Option<i64>>(19)?.unwrap_or(0),
        latest_filing_type: row.get(20)?,
        latest_filing_date: row.get(21)?,
        filings_summary: row.get(22)?,
        news_mention_count: row.get::<_, Option<i64>>(23)?.unwrap_or(0),
        news_sentiment_avg: row.get(24)?,
        congressional_signal_strength: row.get::<_, Option<f64>>(25)?.unwrap_or(0.0),
        congressional_buy_count: row.get::<_, Option<i64>>(26)?.unwrap_or(0),
        macro_score: row.get(27)?,
        market_regime: row.get::<_, Option<String>>(28)?.unwrap_or_default(),
        provider_blobs_json: row.get::<_, Option<String>>(29)?.unwrap_or_default(),
        status: row.get(30)?,
        error_notes: row.get(31)?,
    })
}

fn conditional_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConditionalRow> {
    let entry_json: Option<String> = row.get(9)?;
    let invalidation_json: Option<String> = row.get(10)?;
    let risks_json: Option<String> = row.get(12)?;
    let tag: Option<String> = row.get(13)?;
    Ok(ConditionalRow {
        conditional_id: row.get(0)?,
        ticker: row.get(1)?,
        date_created: row.get(2)?,
        entry_price_target: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
        stop_loss: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
        take_profit_1: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
        take_profit_2: row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
        position_size_pct: row.get::<_, Option<f64>>(7)?.unwrap_or(0.05),
        time_horizon_days: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
        entry_conditions: entry_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        invalidation_conditions: invalidation_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        thesis_summary: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
        key_risks: risks_json.and_then(|j| serde_json::from_str(&j).ok()).unwrap_or_default(),
        watch_tag: WatchTag::parse(&tag.unwrap_or_default()),
        research_confidence: row.get::<_, Option<f64>>(14)?.unwrap_or(0.0),
        status: row.get(15)?,
        verification_count: row.get::<_, Option<i64>>(16)?.unwrap_or(0),
        last_verified: row.get(17)?,
        verification_notes: row.get(18)?,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn conditional(ticker: &str, entry: f64, confidence: f64) -> ConditionalInsert {
        ConditionalInsert {
            ticker: ticker.into(),
            entry_price_target: entry,
            stop_loss: entry * 0.95,
            take_profit_1: entry * 1.05,
            take_profit_2: entry * 1.12,
            position_size_pct: 0.10,
            time_horizon_days: 14,
            entry_conditions: vec!["VIX < 25".into()],
            invalidation_conditions: vec!["breaks support".into()],
            thesis_summary: "test thesis".into(),
            key_risks: vec!["earnings miss".into()],
            watch_tag: WatchTag::Breakout,
            research_confidence: confidence,
        }
    }

    #[test]
    fn at_most_one_active_conditional_per_ticker() {
        let store = Store::open_in_memory().unwrap();
        store.supersede_and_insert_conditional(&conditional("XYZ", 50.0, 0.72)).unwrap();
        store.supersede_and_insert_conditional(&conditional("XYZ", 48.0, 0.81)).unwrap();

        assert_eq!(store.count_active_conditionals_for("XYZ").unwrap(), 1);

        let active = store.active_conditionals().unwrap();
        assert_eq!(active.len(), 1);
        assert!((active[0].entry_price_target - 48.0).abs() < f64::EPSILON);
        assert!((active[0].research_confidence - 0.81).abs() < f64::EPSILON);

        // Prior row carries the supersession note.
        let note: String = store
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT verification_notes FROM conditional_tracking
                     WHERE status = 'invalidated' AND ticker = 'XYZ'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert!(note.starts_with("Superseded by fresh analyst run on"));
    }

    #[test]
    fn verifier_verdict_effects() {
        let store = Store::open_in_memory().unwrap();
        let id = store.supersede_and_insert_conditional(&conditional("AAA", 10.0, 0.75)).unwrap();

        store.confirm_conditional(id).unwrap();
        store.flag_conditional(id, "price drifted from target").unwrap();
        let active = store.active_conditionals().unwrap();
        assert_eq!(active.len(), 1, "flag keeps the conditional active");
        assert_eq!(active[0].verification_count, 2);
        assert!(active[0].verification_notes.as_ref().unwrap().contains("FLAGGED"));

        store.invalidate_conditional(id, "thesis failed").unwrap();
        assert!(store.active_conditionals().unwrap().is_empty());
    }

    #[test]
    fn watchlist_transition_rules_enforced() {
        let store = Store::open_in_memory().unwrap();
        store
            .queue_watchlist("2026-03-01", "msft", WatchSource::DailyBriefing, 0.8, "", "")
            .unwrap();

        // pending -> researched is legal.
        let changed = store
            .transition_watchlist("MSFT", &[WatchStatus::Pending], WatchStatus::Researched, None)
            .unwrap();
        assert_eq!(changed, 1);

        // researched -> pending is illegal and refused.
        let refused = store
            .transition_watchlist("MSFT", &[WatchStatus::Researched], WatchStatus::Pending, None)
            .unwrap();
        assert_eq!(refused, 0);
        assert_eq!(store.watchlist_status_of("MSFT").unwrap(), Some(WatchStatus::Researched));
    }

    #[test]
    fn watchlist_successor_sets_match_state_machine() {
        assert_eq!(
            WatchStatus::Pending.allowed_successors(),
            &[WatchStatus::Researched, WatchStatus::ResearchError]
        );
        assert!(WatchStatus::Triggered.is_terminal());
        assert!(WatchStatus::AnalystPass.is_terminal());
        assert!(!WatchStatus::ConditionalSet.is_terminal());
    }

    #[test]
    fn research_upsert_is_idempotent_per_day() {
        let store = Store::open_in_memory().unwrap();
        let mut row = ResearchRow {
            ticker: "NVDA".into(),
            research_date: "2026-03-01".into(),
            current_price: Some(900.0),
            status: "library_ready".into(),
            market_regime: "risk-on".into(),
            ..ResearchRow::default()
        };
        store.upsert_research(&row).unwrap();
        row.current_price = Some(905.0);
        store.upsert_research(&row).unwrap();

        let count: i64 = store
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM stock_research_library WHERE ticker='NVDA'",
                    [],
                    |r| r.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 1);
        let read = store.latest_research("NVDA").unwrap().unwrap();
        assert!((read.current_price.unwrap() - 905.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stale_research_expires() {
        let store = Store::open_in_memory().unwrap();
        let row = ResearchRow {
            ticker: "OLD".into(),
            research_date: "2020-01-01".into(),
            status: "library_ready".into(),
            ..ResearchRow::default()
        };
        store.upsert_research(&row).unwrap();
        let expired = store.expire_stale_research(3).unwrap();
        assert_eq!(expired, 1);
        assert!(store.ready_research(10).unwrap().is_empty());
    }

    #[test]
    fn watch_tag_parse_defaults() {
        assert_eq!(WatchTag::parse("breakout"), WatchTag::Breakout);
        assert_eq!(WatchTag::parse("earnings-play"), WatchTag::EarningsPlay);
        assert_eq!(WatchTag::parse("???"), WatchTag::MeanReversion);
    }
}
