// =============================================================================
// Acquisition Researcher — gathers the dossier for pending watchlist tickers
// =============================================================================
//
// For each pending ticker (newest first, confidence descending, capped per
// run): price history, fundamentals, analyst coverage, recent filings, and
// internal signals (news mentions, congressional clusters, macro snapshot).
// Partial data is acceptable — the row lands as `partial` with the errors
// noted and the analyst works with what exists.
// =============================================================================

use std::sync::Arc;

use chrono::Local;
use serde_json::json;
use tracing::{info, warn};

use crate::market::MarketDataClient;
use crate::store::acquisition::{ResearchRow, WatchStatus};
use crate::store::Store;

pub struct Researcher {
    store: Arc<Store>,
    market: Arc<MarketDataClient>,
    max_tickers: usize,
    stale_days: i64,
}

impl Researcher {
    pub fn new(
        store: Arc<Store>,
        market: Arc<MarketDataClient>,
        max_tickers: usize,
        stale_days: i64,
    ) -> Self {
        Self {
            store,
            market,
            max_tickers,
            stale_days,
        }
    }

    /// One research cycle. Returns the tickers successfully researched.
    pub async fn run_research_cycle(&self) -> Vec<String> {
        let date = Local::now().format("%Y-%m-%d").to_string();
        info!(date = %date, "researcher: starting cycle");

        if let Ok(expired) = self.store.expire_stale_research(self.stale_days) {
            if expired > 0 {
                info!(expired, "stale research rows expired");
            }
        }

        let pending = match self.store.pending_watchlist(self.max_tickers) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "pending watchlist fetch failed");
                return Vec::new();
            }
        };
        if pending.is_empty() {
            info!("researcher: no pending tickers");
            return Vec::new();
        }

        info!(
            count = pending.len(),
            tickers = ?pending.iter().map(|p| p.ticker.as_str()).collect::<Vec<_>>(),
            "researcher: pending tickers"
        );

        let mut researched = Vec::new();
        for entry in &pending {
            let ticker = entry.ticker.clone();
            match self.research_ticker(&ticker, &date).await {
                Ok(()) => {
                    let _ = self.store.transition_watchlist(
                        &ticker,
                        &[WatchStatus::Pending],
                        WatchStatus::Researched,
                        Some(&format!("Researched {date}")),
                    );
                    researched.push(ticker);
                }
                Err(e) => {
                    warn!(ticker = %ticker, error = %e, "research failed");
                    let _ = self.store.transition_watchlist(
                        &ticker,
                        &[WatchStatus::Pending],
                        WatchStatus::ResearchError,
                        Some(&format!("Research failed {date}: {e}")),
                    );
                }
            }
            // Polite spacing between tickers.
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }

        info!(
            ready = researched.len(),
            total = pending.len(),
            "researcher: cycle complete"
        );
        researched
    }

    /// Full research pass for one ticker. Errors only when NOTHING useful
    /// could be gathered; partial data lands as `partial`.
    async fn research_ticker(&self, ticker: &str, date: &str) -> anyhow::Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // Price history: current level plus 1-week / 1-month changes.
        let mut current_price = None;
        let mut chg_1w = None;
        let mut chg_1m = None;
        let mut avg_volume = None;
        match self.market.daily_history(ticker, "1mo").await {
            Ok(bars) if !bars.is_empty() => {
                let latest = bars.last().map(|b| b.close);
                current_price = latest;
                if bars.len() >= 6 {
                    let week_ago = bars[bars.len() - 6].close;
                    chg_1w = latest.map(|now| (now - week_ago) / week_ago * 100.0);
                }
                let month_ago = bars[0].close;
                chg_1m = latest.map(|now| (now - month_ago) / month_ago * 100.0);
                if bars.len() >= 20 {
                    let tail = &bars[bars.len() - 20..];
                    avg_volume =
                        Some(tail.iter().map(|b| b.volume).sum::<i64>() / tail.len() as i64);
                }
            }
            Ok(_) => errors.push("history: empty".to_string()),
            Err(e) => errors.push(format!("history: {e}")),
        }

        // Fundamentals + analyst coverage.
        let fundamentals = match self.market.fundamentals(ticker).await {
            Ok(f) => Some(f),
            Err(e) => {
                errors.push(format!("fundamentals: {e}"));
                None
            }
        };

        // Recent SEC filings; the most recent 8-K gets a one-line summary.
        let mut latest_filing_type = None;
        let mut latest_filing_date = None;
        let mut filings_summary = None;
        match self.market.recent_filings(ticker, 20).await {
            Ok(filings) => {
                if let Some(first) = filings.first() {
                    latest_filing_type = Some(first.form.clone());
                    latest_filing_date = Some(first.filed.clone());
                }
                if let Some(eight_k) = filings.iter().find(|f| f.form == "8-K") {
                    filings_summary = Some(format!(
                        "8-K filed {}: {}",
                        eight_k.filed, eight_k.document
                    ));
                }
            }
            Err(e) => errors.push(format!("sec: {e}")),
        }

        // Internal signals from our own tables.
        let mentions = self.store.news_mentions_for_ticker(ticker, 30, 20).unwrap_or_default();
        let news_sentiment_avg = if mentions.is_empty() {
            None
        } else {
            Some(mentions.iter().map(|(_, score, _)| score).sum::<f64>() / mentions.len() as f64)
        };
        let cluster = self.store.cluster_signal_for(ticker).ok().flatten();
        let macro_row = self.store.latest_macro_row().ok().flatten();
        let regime = self
            .store
            .latest_briefing()
            .ok()
            .flatten()
            .map(|b| b.market_regime)
            .unwrap_or_else(|| "unknown".to_string());

        // Nothing at all? That is a research error, not a partial dossier.
        if current_price.is_none() && fundamentals.is_none() {
            anyhow::bail!("no price and no fundamentals: {}", errors.join("; "));
        }

        let blobs = json!({
            "fundamentals_raw": fundamentals.as_ref().map(|f| f.raw.clone()),
            "news_mentions": mentions
                .iter()
                .map(|(ts, score, summary)| json!({
                    "timestamp": ts, "score": score, "summary": summary,
                }))
                .collect::<Vec<_>>(),
        });

        let f = fundamentals.as_ref();
        let row = ResearchRow {
            ticker: ticker.to_uppercase(),
            research_date: date.to_string(),
            current_price,
            price_1w_chg_pct: chg_1w,
            price_1m_chg_pct: chg_1m,
            price_52w_high: f.and_then(|f| f.fifty_two_week_high),
            price_52w_low: f.and_then(|f| f.fifty_two_week_low),
            avg_volume_20d: avg_volume,
            market_cap: f.and_then(|f| f.market_cap),
            pe_ratio: f.and_then(|f| f.pe_ratio),
            forward_pe: f.and_then(|f| f.forward_pe),
            profit_margin: f.and_then(|f| f.profit_margin),
            revenue_growth_yoy: f.and_then(|f| f.revenue_growth_yoy),
            debt_to_equity: f.and_then(|f| f.debt_to_equity),
            analyst_target_mean: f.and_then(|f| f.target_mean),
            analyst_target_high: f.and_then(|f| f.target_high),
            analyst_target_low: f.and_then(|f| f.target_low),
            analyst_buy_count: f.map(|f| f.recommendation_buy).unwrap_or(0),
            analyst_hold_count: f.map(|f| f.recommendation_hold).unwrap_or(0),
            analyst_sell_count: f.map(|f| f.recommendation_sell).unwrap_or(0),
            latest_filing_type,
            latest_filing_date,
            filings_summary,
            news_mention_count: mentions.len() as i64,
            news_sentiment_avg,
            congressional_signal_strength: cluster
                .as_ref()
                .map(|c| c.signal_strength)
                .unwrap_or(0.0),
            congressional_buy_count: cluster.map(|c| c.buy_count as i64).unwrap_or(0),
            macro_score: macro_row.map(|m| m.macro_score),
            market_regime: regime,
            provider_blobs_json: blobs.to_string(),
            status: if errors.is_empty() { "library_ready" } else { "partial" }.to_string(),
            error_notes: if errors.is_empty() { None } else { Some(errors.join("; ")) },
        };

        self.store.upsert_research(&row)?;
        info!(
            ticker,
            status = %row.status,
            price = ?row.current_price,
            mentions = row.news_mention_count,
            "ticker researched"
        );
        Ok(())
    }
}
