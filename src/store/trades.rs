// =============================================================================
// Store: trade records, crisis events, portfolio performance
// =============================================================================

use anyhow::Result;
use chrono::{Local, NaiveDateTime};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::{error, info};

use super::Store;

/// Persisted exit reasons. The exit engine's broader internal rule set maps
/// onto this narrow enum; trailing-stop and time exits persist as `manual`
/// with a descriptive note so historical queries stay coherent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ProfitTarget,
    StopLoss,
    Manual,
    Invalidation,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProfitTarget => "profit_target",
            Self::StopLoss => "stop_loss",
            Self::Manual => "manual",
            Self::Invalidation => "invalidation",
        }
    }
}

/// An open or closed paper position.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub trade_id: i64,
    pub crisis_id: Option<i64>,
    pub ticker: String,
    pub entry_date: String,
    pub entry_time: String,
    pub entry_price: f64,
    pub shares: i64,
    pub cost_basis: f64,
    pub entry_signal_score: f64,
    pub defcon_at_entry: u8,
    pub status: String,
    pub current_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<String>,
    pub realized_pnl: Option<f64>,
    pub realized_pnl_pct: Option<f64>,
    pub holding_hours: Option<f64>,
    pub notes: Option<String>,
}

impl TradeRecord {
    /// Hours since entry, from the persisted wall-clock entry stamp.
    pub fn holding_hours_now(&self) -> f64 {
        let stamp = format!("{} {}", self.entry_date, self.entry_time);
        match NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S") {
            Ok(entry) => {
                let now = Local::now().naive_local();
                (now - entry).num_seconds() as f64 / 3600.0
            }
            Err(_) => 0.0,
        }
    }
}

/// Insert payload for a new position.
#[derive(Debug, Clone)]
pub struct TradeInsert {
    pub crisis_id: Option<i64>,
    pub ticker: String,
    pub entry_price: f64,
    pub shares: i64,
    pub entry_signal_score: f64,
    pub defcon_at_entry: u8,
    pub notes: String,
}

/// Aggregate portfolio metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PortfolioPerformance {
    pub total_trades: usize,
    pub open_trades: usize,
    pub closed_trades: usize,
    pub total_realized_pnl: f64,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate_pct: f64,
    pub profit_factor: f64,
}

impl Store {
    /// Open a new position. Shares and cost basis are validated here as a
    /// last line of defence; violations abort without writing.
    pub fn open_trade(&self, insert: &TradeInsert) -> Result<i64> {
        if insert.shares <= 0 || insert.entry_price <= 0.0 {
            error!(
                ticker = %insert.ticker,
                shares = insert.shares,
                entry_price = insert.entry_price,
                "invariant violation: refusing to open trade with non-positive shares or price"
            );
            anyhow::bail!("invalid trade: shares and entry price must be positive");
        }

        let now = Local::now();
        let cost_basis = insert.entry_price * insert.shares as f64;
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO trade_records
                 (crisis_id, ticker, entry_date, entry_time, entry_price, shares,
                  cost_basis, entry_signal_score, defcon_at_entry, status,
                  current_price, notes)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,'open',?5,?10)",
                params![
                    insert.crisis_id,
                    insert.ticker.to_uppercase(),
                    now.format("%Y-%m-%d").to_string(),
                    now.format("%H:%M:%S").to_string(),
                    insert.entry_price,
                    insert.shares,
                    cost_basis,
                    insert.entry_signal_score,
                    insert.defcon_at_entry as i64,
                    insert.notes,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        info!(
            trade_id = id,
            ticker = %insert.ticker,
            shares = insert.shares,
            entry_price = insert.entry_price,
            cost_basis,
            "position opened"
        );
        Ok(id)
    }

    pub fn open_trades(&self) -> Result<Vec<TradeRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TRADE_COLUMNS} FROM trade_records
                 WHERE status = 'open' ORDER BY entry_date DESC, entry_time DESC"
            ))?;
            let rows = stmt.query_map([], trade_from_row)?;
            rows.collect()
        })
    }

    pub fn trade_by_id(&self, trade_id: i64) -> Result<Option<TradeRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TRADE_COLUMNS} FROM trade_records WHERE trade_id = ?1"),
                [trade_id],
                trade_from_row,
            )
            .optional()
        })
    }

    /// Most recent open position for a ticker (manual sell without an id).
    pub fn latest_open_trade_for(&self, ticker: &str) -> Result<Option<TradeRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {TRADE_COLUMNS} FROM trade_records
                     WHERE UPPER(ticker) = UPPER(?1) AND status = 'open'
                     ORDER BY entry_date DESC, entry_time DESC LIMIT 1"
                ),
                [ticker],
                trade_from_row,
            )
            .optional()
        })
    }

    /// Refresh the mutable mark-to-market fields of an open position.
    pub fn update_trade_price(&self, trade_id: i64, current_price: f64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE trade_records
                 SET current_price = ?1,
                     unrealized_pnl = (?1 - entry_price) * shares
                 WHERE trade_id = ?2 AND status = 'open'",
                params![current_price, trade_id],
            )?;
            Ok(())
        })
    }

    /// Close a position atomically: all exit fields land in one UPDATE.
    /// Returns the realized P&L in dollars, or None if the trade was not open.
    pub fn close_trade(
        &self,
        trade_id: i64,
        exit_price: f64,
        reason: ExitReason,
        note: &str,
    ) -> Result<Option<f64>> {
        let trade = match self.trade_by_id(trade_id)? {
            Some(t) if t.status == "open" => t,
            _ => return Ok(None),
        };

        let realized = (exit_price - trade.entry_price) * trade.shares as f64;
        let realized_pct = (exit_price - trade.entry_price) / trade.entry_price * 100.0;
        let holding_hours = trade.holding_hours_now();
        let now = Local::now();

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE trade_records
                 SET status = 'closed', exit_date = ?1, exit_time = ?2, exit_price = ?3,
                     exit_reason = ?4, realized_pnl = ?5, realized_pnl_pct = ?6,
                     holding_hours = ?7, unrealized_pnl = 0, current_price = ?3,
                     notes = CASE WHEN ?8 = '' THEN notes
                                  ELSE COALESCE(notes || ' | ', '') || ?8 END
                 WHERE trade_id = ?9 AND status = 'open'",
                params![
                    now.format("%Y-%m-%d").to_string(),
                    now.format("%H:%M:%S").to_string(),
                    exit_price,
                    reason.as_str(),
                    realized,
                    realized_pct,
                    holding_hours,
                    note,
                    trade_id,
                ],
            )?;
            Ok(())
        })?;

        info!(
            trade_id,
            ticker = %trade.ticker,
            exit_price,
            reason = reason.as_str(),
            realized_pnl = format!("{realized:+.2}"),
            "position closed"
        );
        Ok(Some(realized))
    }

    /// Closed trades on or after `since_date` (briefing weekly recap).
    pub fn closed_trades_since(&self, since_date: &str) -> Result<Vec<TradeRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TRADE_COLUMNS} FROM trade_records
                 WHERE status = 'closed' AND exit_date >= ?1
                 ORDER BY exit_date DESC"
            ))?;
            let rows = stmt.query_map([since_date], trade_from_row)?;
            rows.collect()
        })
    }

    pub fn portfolio_performance(&self) -> Result<PortfolioPerformance> {
        self.with_conn(|conn| {
            let (total, open): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), SUM(CASE WHEN status = 'open' THEN 1 ELSE 0 END)
                 FROM trade_records",
                [],
                |row| Ok((row.get(0)?, row.get::<_, Option<i64>>(1)?.unwrap_or(0))),
            )?;

            let (closed, pnl, wins, losses, gross_win, gross_loss): (
                i64,
                f64,
                i64,
                i64,
                f64,
                f64,
            ) = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(realized_pnl), 0),
                        SUM(CASE WHEN realized_pnl > 0 THEN 1 ELSE 0 END),
                        SUM(CASE WHEN realized_pnl <= 0 THEN 1 ELSE 0 END),
                        COALESCE(SUM(CASE WHEN realized_pnl > 0 THEN realized_pnl END), 0),
                        COALESCE(SUM(CASE WHEN realized_pnl < 0 THEN -realized_pnl END), 0)
                 FROM trade_records WHERE status = 'closed'",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )?;

            let win_rate = if closed > 0 {
                wins as f64 / closed as f64 * 100.0
            } else {
                0.0
            };
            let profit_factor = if gross_loss > 0.0 { gross_win / gross_loss } else { 0.0 };

            Ok(PortfolioPerformance {
                total_trades: total as usize,
                open_trades: open as usize,
                closed_trades: closed as usize,
                total_realized_pnl: pnl,
                winning_trades: wins as usize,
                losing_trades: losses as usize,
                win_rate_pct: win_rate,
                profit_factor,
            })
        })
    }

    /// Capital currently tied up in open positions (at cost).
    pub fn deployed_capital(&self) -> Result<f64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(cost_basis), 0) FROM trade_records WHERE status = 'open'",
                [],
                |row| row.get(0),
            )
        })
    }

    /// Create (or reuse) a crisis event linking a trade package to the
    /// signal that produced it.
    pub fn signal_crisis_event(
        &self,
        defcon_level: u8,
        signal_score: f64,
        description: &str,
        category: &str,
    ) -> Result<i64> {
        let date = Local::now().format("%Y-%m-%d").to_string();
        let name = format!("Signal_{defcon_level}__{date}");
        self.with_conn(|conn| {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT crisis_id FROM crisis_events WHERE name LIKE ?1 || '%'",
                    [&name],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok(id);
            }
            conn.execute(
                "INSERT INTO crisis_events
                 (name, description, trigger_desc, start_date, severity, category, notes)
                 VALUES (?1, ?2, ?3, ?4, 'moderate', ?5, 'Paper trading signal package')",
                params![
                    name,
                    description,
                    format!("DEFCON {defcon_level} signal - score {signal_score:.1}"),
                    date,
                    category,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }
}

const TRADE_COLUMNS: &str = "trade_id, crisis_id, ticker, entry_date, entry_time, \
    entry_price, shares, cost_basis, entry_signal_score, defcon_at_entry, status, \
    current_price, unrealized_pnl, exit_price, exit_reason, realized_pnl, \
    realized_pnl_pct, holding_hours, notes";

fn trade_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRecord> {
    Ok(TradeRecord {
        trade_id: row.get(0)?,
        crisis_id: row.get(1)?,
        ticker: row.get(2)?,
        entry_date: row.get(3)?,
        entry_time: row.get(4)?,
        entry_price: row.get(5)?,
        shares: row.get(6)?,
        cost_basis: row.get(7)?,
        entry_signal_score: row.get::<_, Option<f64>>(8)?.unwrap_or(0.0),
        defcon_at_entry: row.get::<_, Option<i64>>(9)?.unwrap_or(5) as u8,
        status: row.get(10)?,
        current_price: row.get(11)?,
        unrealized_pnl: row.get::<_, Option<f64>>(12)?.unwrap_or(0.0),
        exit_price: row.get(13)?,
        exit_reason: row.get(14)?,
        realized_pnl: row.get(15)?,
        realized_pnl_pct: row.get(16)?,
        holding_hours: row.get(17)?,
        notes: row.get(18)?,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn insert(ticker: &str, price: f64, shares: i64) -> TradeInsert {
        TradeInsert {
            crisis_id: None,
            ticker: ticker.into(),
            entry_price: price,
            shares,
            entry_signal_score: 60.0,
            defcon_at_entry: 2,
            notes: String::new(),
        }
    }

    #[test]
    fn open_trade_computes_cost_basis() {
        let store = Store::open_in_memory().unwrap();
        let id = store.open_trade(&insert("XYZ", 100.0, 50)).unwrap();
        let trade = store.trade_by_id(id).unwrap().unwrap();
        assert_eq!(trade.shares, 50);
        assert!((trade.cost_basis - 5000.0).abs() < f64::EPSILON);
        assert!(trade.shares > 0);
        assert!((trade.cost_basis - trade.entry_price * trade.shares as f64).abs() < 1e-9);
    }

    #[test]
    fn non_positive_shares_refused() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.open_trade(&insert("XYZ", 100.0, 0)).is_err());
        assert!(store.open_trade(&insert("XYZ", -1.0, 10)).is_err());
        assert!(store.open_trades().unwrap().is_empty());
    }

    #[test]
    fn close_trade_sets_exit_fields_atomically() {
        let store = Store::open_in_memory().unwrap();
        let id = store.open_trade(&insert("XYZ", 100.0, 100)).unwrap();

        let pnl = store
            .close_trade(id, 96.5, ExitReason::StopLoss, "stopped at -3.5%")
            .unwrap()
            .unwrap();
        assert!((pnl + 350.0).abs() < 1e-6);

        let trade = store.trade_by_id(id).unwrap().unwrap();
        assert_eq!(trade.status, "closed");
        assert_eq!(trade.exit_reason.as_deref(), Some("stop_loss"));
        assert!((trade.realized_pnl.unwrap() + 350.0).abs() < 1e-6);
        assert!((trade.realized_pnl_pct.unwrap() + 3.5).abs() < 1e-6);

        // Second close is a no-op.
        assert!(store.close_trade(id, 99.0, ExitReason::Manual, "").unwrap().is_none());
    }

    #[test]
    fn performance_aggregates() {
        let store = Store::open_in_memory().unwrap();
        let winner = store.open_trade(&insert("AAA", 100.0, 10)).unwrap();
        let loser = store.open_trade(&insert("BBB", 100.0, 10)).unwrap();
        store.open_trade(&insert("CCC", 100.0, 10)).unwrap();

        store.close_trade(winner, 110.0, ExitReason::ProfitTarget, "").unwrap();
        store.close_trade(loser, 95.0, ExitReason::StopLoss, "").unwrap();

        let perf = store.portfolio_performance().unwrap();
        assert_eq!(perf.total_trades, 3);
        assert_eq!(perf.open_trades, 1);
        assert_eq!(perf.closed_trades, 2);
        assert!((perf.total_realized_pnl - 50.0).abs() < 1e-6);
        assert!((perf.win_rate_pct - 50.0).abs() < 1e-6);
        assert!((perf.profit_factor - 2.0).abs() < 1e-6);
        assert!((store.deployed_capital().unwrap() - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn signal_crisis_event_reused_same_day() {
        let store = Store::open_in_memory().unwrap();
        let a = store.signal_crisis_event(2, 75.0, "desc", "signal").unwrap();
        let b = store.signal_crisis_event(2, 80.0, "desc2", "signal").unwrap();
        assert_eq!(a, b);
    }
}
