// =============================================================================
// Persistent Store — embedded SQLite with WAL, single serialized writer
// =============================================================================
//
// Every persisted entity lives here. One connection behind a Mutex gives a
// single writer; WAL mode keeps concurrent readers (the dashboard, ad-hoc
// queries) unblocked during writes.
//
// Schema migration is ADDITIVE ONLY: base tables are created with
// `CREATE TABLE IF NOT EXISTS`, and `ensure_column` adds anything a newer
// build needs to an older database file. Rows are never deleted — lifecycle
// is expressed through status transitions (expired / invalidated / closed).
// =============================================================================

pub mod acquisition;
pub mod briefings;
pub mod congress;
pub mod signals;
pub mod trades;

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, info};

/// Handle to the embedded database. Cheap to share via `Arc`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        Self::configure(&conn)?;
        Self::migrate(&conn)?;

        info!(path = %path.display(), "store opened (WAL mode)");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests. Same schema, no file.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        Ok(())
    }

    /// Run a closure against the connection under the writer lock.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn).context("database operation failed")
    }

    // -------------------------------------------------------------------------
    // Migration
    // -------------------------------------------------------------------------

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(BASE_SCHEMA).context("base schema creation failed")?;

        // Additive migrations: columns introduced after the base schema.
        // Each call is a no-op when the column already exists.
        ensure_column(conn, "signal_monitoring", "degraded", "INTEGER DEFAULT 0")?;
        ensure_column(conn, "news_signals", "fast_analysis_json", "TEXT")?;
        ensure_column(conn, "conditional_tracking", "watch_tag", "TEXT")?;
        ensure_column(conn, "conditional_tracking", "attention_score", "REAL")?;
        ensure_column(conn, "trade_records", "notes", "TEXT")?;

        debug!("store migration complete");
        Ok(())
    }
}

/// Add `column` to `table` when it is missing. SQLite has no
/// `ADD COLUMN IF NOT EXISTS`, so the column list is inspected first.
fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<_>>()?;

    if !existing.iter().any(|c| c == column) {
        conn.execute(
            &format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"),
            [],
        )?;
        info!(table, column, "additive migration: column added");
    }
    Ok(())
}

const BASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS signal_monitoring (
    cycle_id            INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp           TEXT NOT NULL,
    date                TEXT NOT NULL,
    bond_yield          REAL,
    vix                 REAL,
    market_change_pct   REAL,
    defcon_level        INTEGER NOT NULL,
    composite_score     REAL NOT NULL,
    news_score          REAL DEFAULT 0,
    created_at          TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_monitoring_date ON signal_monitoring(date);
CREATE INDEX IF NOT EXISTS idx_monitoring_created ON signal_monitoring(created_at);

CREATE TABLE IF NOT EXISTS news_signals (
    news_signal_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp           TEXT NOT NULL,
    news_score          REAL NOT NULL,
    dominant_crisis_type TEXT,
    crisis_description  TEXT,
    breaking_news_override INTEGER DEFAULT 0,
    recommended_defcon  INTEGER,
    article_count       INTEGER DEFAULT 0,
    breaking_count      INTEGER DEFAULT 0,
    avg_confidence      REAL DEFAULT 0,
    sentiment_summary   TEXT,
    sentiment_net       REAL,
    signal_concentration REAL,
    crisis_distribution_json TEXT,
    score_components_json TEXT,
    keyword_hits_json   TEXT,
    articles_json       TEXT,
    created_at          TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_news_created ON news_signals(created_at);

CREATE TABLE IF NOT EXISTS llm_analysis (
    analysis_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    news_signal_id      INTEGER,
    tier                TEXT NOT NULL,
    model               TEXT,
    trigger_kind        TEXT,
    narrative_coherence REAL,
    hidden_risks_json   TEXT,
    recommended_action  TEXT,
    reasoning           TEXT,
    enhanced_confidence REAL,
    confidence_adjustment REAL,
    defcon_recommendation INTEGER,
    input_tokens        INTEGER DEFAULT 0,
    output_tokens       INTEGER DEFAULT 0,
    created_at          TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_analysis_signal ON llm_analysis(news_signal_id);
CREATE INDEX IF NOT EXISTS idx_analysis_created ON llm_analysis(created_at);

CREATE TABLE IF NOT EXISTS macro_indicators (
    macro_id            INTEGER PRIMARY KEY AUTOINCREMENT,
    yield_curve_spread  REAL,
    fed_funds_rate      REAL,
    unemployment_rate   REAL,
    m2_yoy_change       REAL,
    hy_oas_bps          REAL,
    consumer_sentiment  REAL,
    rate_10y            REAL,
    rate_2y             REAL,
    macro_score         REAL NOT NULL,
    defcon_modifier     REAL NOT NULL,
    bearish_signals     INTEGER DEFAULT 0,
    bullish_signals     INTEGER DEFAULT 0,
    signals_json        TEXT,
    created_at          TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_macro_created ON macro_indicators(created_at);

CREATE TABLE IF NOT EXISTS congressional_trades (
    trade_row_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    source              TEXT NOT NULL,
    politician          TEXT NOT NULL,
    party               TEXT,
    ticker              TEXT NOT NULL,
    direction           TEXT NOT NULL,
    amount              REAL DEFAULT 0,
    disclosure_date     TEXT,
    transaction_date    TEXT,
    asset_description   TEXT,
    created_at          TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(politician, ticker, transaction_date, direction, amount)
);
CREATE INDEX IF NOT EXISTS idx_congress_ticker ON congressional_trades(ticker);

CREATE TABLE IF NOT EXISTS congressional_cluster_signals (
    cluster_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker              TEXT NOT NULL,
    buy_count           INTEGER NOT NULL,
    politicians_json    TEXT,
    total_amount        REAL DEFAULT 0,
    bipartisan          INTEGER DEFAULT 0,
    committee_relevance_json TEXT,
    signal_strength     REAL NOT NULL,
    window_days         INTEGER DEFAULT 30,
    created_at          TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_cluster_ticker ON congressional_cluster_signals(ticker);
CREATE INDEX IF NOT EXISTS idx_cluster_created ON congressional_cluster_signals(created_at);

CREATE TABLE IF NOT EXISTS acquisition_watchlist (
    watchlist_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    date_added          TEXT NOT NULL,
    ticker              TEXT NOT NULL,
    source              TEXT DEFAULT 'daily_briefing',
    model_confidence    REAL DEFAULT 0,
    entry_conditions    TEXT,
    status              TEXT DEFAULT 'pending',
    notes               TEXT,
    created_at          TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(date_added, ticker)
);
CREATE INDEX IF NOT EXISTS idx_watchlist_status ON acquisition_watchlist(status);
CREATE INDEX IF NOT EXISTS idx_watchlist_ticker ON acquisition_watchlist(ticker);
CREATE INDEX IF NOT EXISTS idx_watchlist_date ON acquisition_watchlist(date_added);

CREATE TABLE IF NOT EXISTS stock_research_library (
    library_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker              TEXT NOT NULL,
    research_date       TEXT NOT NULL,
    current_price       REAL,
    price_1w_chg_pct    REAL,
    price_1m_chg_pct    REAL,
    price_52w_high      REAL,
    price_52w_low       REAL,
    avg_volume_20d      INTEGER,
    market_cap          REAL,
    pe_ratio            REAL,
    forward_pe          REAL,
    profit_margin       REAL,
    revenue_growth_yoy  REAL,
    debt_to_equity      REAL,
    analyst_target_mean REAL,
    analyst_target_high REAL,
    analyst_target_low  REAL,
    analyst_buy_count   INTEGER DEFAULT 0,
    analyst_hold_count  INTEGER DEFAULT 0,
    analyst_sell_count  INTEGER DEFAULT 0,
    latest_filing_type  TEXT,
    latest_filing_date  TEXT,
    filings_summary     TEXT,
    news_mention_count  INTEGER DEFAULT 0,
    news_sentiment_avg  REAL,
    congressional_signal_strength REAL DEFAULT 0,
    congressional_buy_count INTEGER DEFAULT 0,
    macro_score         REAL,
    market_regime       TEXT,
    provider_blobs_json TEXT,
    status              TEXT DEFAULT 'library_ready',
    error_notes         TEXT,
    created_at          TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(ticker, research_date)
);
CREATE INDEX IF NOT EXISTS idx_library_status ON stock_research_library(status);
CREATE INDEX IF NOT EXISTS idx_library_ticker ON stock_research_library(ticker);
CREATE INDEX IF NOT EXISTS idx_library_date ON stock_research_library(research_date);

CREATE TABLE IF NOT EXISTS conditional_tracking (
    conditional_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker              TEXT NOT NULL,
    date_created        TEXT NOT NULL,
    entry_price_target  REAL,
    stop_loss           REAL,
    take_profit_1       REAL,
    take_profit_2       REAL,
    position_size_pct   REAL DEFAULT 0.05,
    time_horizon_days   INTEGER,
    entry_conditions_json TEXT,
    invalidation_conditions_json TEXT,
    thesis_summary      TEXT,
    key_risks_json      TEXT,
    research_confidence REAL DEFAULT 0,
    status              TEXT DEFAULT 'active',
    verification_count  INTEGER DEFAULT 0,
    last_verified       TEXT,
    verification_notes  TEXT,
    created_at          TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at          TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_conditional_status ON conditional_tracking(status);
CREATE INDEX IF NOT EXISTS idx_conditional_ticker ON conditional_tracking(ticker);

CREATE TABLE IF NOT EXISTS crisis_events (
    crisis_id           INTEGER PRIMARY KEY AUTOINCREMENT,
    name                TEXT NOT NULL,
    description         TEXT,
    trigger_desc        TEXT,
    start_date          TEXT,
    severity            TEXT,
    category            TEXT,
    notes               TEXT,
    created_at          TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS trade_records (
    trade_id            INTEGER PRIMARY KEY AUTOINCREMENT,
    crisis_id           INTEGER,
    ticker              TEXT NOT NULL,
    entry_date          TEXT NOT NULL,
    entry_time          TEXT NOT NULL,
    entry_price         REAL NOT NULL,
    shares              INTEGER NOT NULL,
    cost_basis          REAL NOT NULL,
    entry_signal_score  REAL DEFAULT 0,
    defcon_at_entry     INTEGER DEFAULT 5,
    status              TEXT DEFAULT 'open',
    current_price       REAL,
    unrealized_pnl      REAL DEFAULT 0,
    exit_date           TEXT,
    exit_time           TEXT,
    exit_price          REAL,
    exit_reason         TEXT,
    realized_pnl        REAL,
    realized_pnl_pct    REAL,
    holding_hours       REAL,
    created_at          TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_trades_status ON trade_records(status);
CREATE INDEX IF NOT EXISTS idx_trades_ticker ON trade_records(ticker);
CREATE INDEX IF NOT EXISTS idx_trades_entry_date ON trade_records(entry_date);

CREATE TABLE IF NOT EXISTS daily_briefings (
    briefing_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    date                TEXT NOT NULL,
    tier                TEXT NOT NULL,
    model_id            TEXT,
    market_regime       TEXT,
    regime_confidence   REAL,
    headline_summary    TEXT,
    key_themes_json     TEXT,
    biggest_risk        TEXT,
    biggest_opportunity TEXT,
    signal_quality      TEXT,
    macro_alignment     TEXT,
    congressional_alpha TEXT,
    portfolio_assessment TEXT,
    watchlist_json      TEXT,
    entry_conditions    TEXT,
    defcon_forecast     TEXT,
    reasoning_chain     TEXT,
    model_confidence    REAL,
    input_tokens        INTEGER DEFAULT 0,
    output_tokens       INTEGER DEFAULT 0,
    created_at          TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(date, tier)
);
CREATE INDEX IF NOT EXISTS idx_briefing_date ON daily_briefings(date);

CREATE TABLE IF NOT EXISTS llm_usage_log (
    usage_id            INTEGER PRIMARY KEY AUTOINCREMENT,
    tier                TEXT NOT NULL,
    model               TEXT,
    caller              TEXT,
    input_tokens        INTEGER DEFAULT 0,
    output_tokens       INTEGER DEFAULT 0,
    logged_at_epoch     INTEGER NOT NULL,
    created_at          TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_usage_tier ON llm_usage_log(tier, logged_at_epoch);

CREATE TABLE IF NOT EXISTS hound_candidates (
    candidate_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker              TEXT NOT NULL,
    meme_score          INTEGER DEFAULT 0,
    thesis              TEXT,
    signals_json        TEXT,
    risks_json          TEXT,
    action_suggestion   TEXT,
    created_at          TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
"#;

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_cleanly() {
        let store = Store::open_in_memory().unwrap();
        let count: i64 = store
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert!(count >= 12, "expected all base tables, got {count}");
    }

    #[test]
    fn ensure_column_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                ensure_column(conn, "trade_records", "notes", "TEXT").unwrap();
                ensure_column(conn, "trade_records", "notes", "TEXT").unwrap();
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn migrate_twice_is_safe() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                Store::migrate(conn).unwrap();
                Ok(())
            })
            .unwrap();
    }
}
