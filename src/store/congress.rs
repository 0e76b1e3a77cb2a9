// =============================================================================
// Store: congressional trades and cluster signals
// =============================================================================

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Store;

/// One disclosed congressional transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CongressionalTrade {
    /// Chamber the disclosure came from ("house" | "senate").
    pub source: String,
    pub politician: String,
    pub party: String,
    pub ticker: String,
    /// "buy" | "sell" | "unknown".
    pub direction: String,
    /// Midpoint of the disclosed range (or the scalar when exact).
    pub amount: f64,
    pub disclosure_date: String,
    pub transaction_date: String,
    pub asset_description: String,
}

/// Derived cluster signal: 3+ politicians buying one ticker within a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSignal {
    pub ticker: String,
    pub buy_count: usize,
    pub politicians: Vec<String>,
    pub total_amount: f64,
    pub bipartisan: bool,
    pub committee_relevance: Vec<String>,
    pub signal_strength: f64,
    pub window_days: i64,
}

impl Store {
    /// Insert trades, skipping rows that violate the uniqueness key
    /// (politician, ticker, transaction_date, direction, amount).
    /// Returns the number of genuinely new rows.
    pub fn insert_congressional_trades(&self, trades: &[CongressionalTrade]) -> Result<usize> {
        self.with_conn(|conn| {
            let mut saved = 0;
            for trade in trades {
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO congressional_trades
                     (source, politician, party, ticker, direction, amount,
                      disclosure_date, transaction_date, asset_description)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    params![
                        trade.source,
                        trade.politician,
                        trade.party,
                        trade.ticker,
                        trade.direction,
                        trade.amount,
                        trade.disclosure_date,
                        trade.transaction_date,
                        trade.asset_description,
                    ],
                )?;
                saved += changed;
            }
            Ok(saved)
        })
    }

    pub fn insert_cluster_signals(&self, clusters: &[ClusterSignal]) -> Result<()> {
        self.with_conn(|conn| {
            for cluster in clusters {
                conn.execute(
                    "INSERT INTO congressional_cluster_signals
                     (ticker, buy_count, politicians_json, total_amount, bipartisan,
                      committee_relevance_json, signal_strength, window_days)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    params![
                        cluster.ticker,
                        cluster.buy_count as i64,
                        serde_json::to_string(&cluster.politicians).unwrap_or_default(),
                        cluster.total_amount,
                        cluster.bipartisan as i64,
                        serde_json::to_string(&cluster.committee_relevance).unwrap_or_default(),
                        cluster.signal_strength,
                        cluster.window_days,
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// Strongest recent cluster signals (briefing context).
    pub fn top_cluster_signals(&self, limit: usize) -> Result<Vec<ClusterSignal>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ticker, buy_count, politicians_json, total_amount, bipartisan,
                        committee_relevance_json, signal_strength, window_days
                 FROM congressional_cluster_signals
                 ORDER BY signal_strength DESC, created_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], cluster_from_row)?;
            rows.collect()
        })
    }

    /// Latest cluster signal for one ticker (researcher input).
    pub fn cluster_signal_for(&self, ticker: &str) -> Result<Option<ClusterSignal>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT ticker, buy_count, politicians_json, total_amount, bipartisan,
                        committee_relevance_json, signal_strength, window_days
                 FROM congressional_cluster_signals
                 WHERE UPPER(ticker) = UPPER(?1)
                 ORDER BY created_at DESC LIMIT 1",
                [ticker],
                cluster_from_row,
            )
            .optional()
        })
    }
}

fn cluster_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClusterSignal> {
    let politicians_json: Option<String> = row.get(2)?;
    let committee_json: Option<String> = row.get(5)?;
    Ok(ClusterSignal {
        ticker: row.get(0)?,
        buy_count: row.get::<_, i64>(1)? as usize,
        politicians: politicians_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        total_amount: row.get(3)?,
        bipartisan: row.get::<_, i64>(4)? != 0,
        committee_relevance: committee_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        signal_strength: row.get(6)?,
        window_days: row.get(7)?,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trade(politician: &str, ticker: &str, amount: f64) -> CongressionalTrade {
        CongressionalTrade {
            source: "house".into(),
            politician: politician.into(),
            party: "D".into(),
            ticker: ticker.into(),
            direction: "buy".into(),
            amount,
            disclosure_date: "2026-03-01".into(),
            transaction_date: "2026-02-20".into(),
            asset_description: ticker.into(),
        }
    }

    #[test]
    fn duplicate_trades_are_ignored() {
        let store = Store::open_in_memory().unwrap();
        let trades = vec![trade("A", "LMT", 32500.0), trade("A", "LMT", 32500.0)];
        let saved = store.insert_congressional_trades(&trades).unwrap();
        assert_eq!(saved, 1);

        // Re-inserting the same batch saves nothing new.
        let saved_again = store.insert_congressional_trades(&trades).unwrap();
        assert_eq!(saved_again, 0);
    }

    #[test]
    fn cluster_lookup_by_ticker_case_insensitive() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_cluster_signals(&[ClusterSignal {
                ticker: "LMT".into(),
                buy_count: 4,
                politicians: vec!["A".into(), "B".into(), "C".into(), "D".into()],
                total_amount: 130_000.0,
                bipartisan: true,
                committee_relevance: vec!["Armed Services".into()],
                signal_strength: 85.0,
                window_days: 30,
            }])
            .unwrap();

        let cluster = store.cluster_signal_for("lmt").unwrap().unwrap();
        assert_eq!(cluster.buy_count, 4);
        assert!(cluster.bipartisan);
        assert_eq!(cluster.politicians.len(), 4);

        assert!(store.cluster_signal_for("XOM").unwrap().is_none());
    }
}
