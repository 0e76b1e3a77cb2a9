// =============================================================================
// Congressional Tracker — disclosure feeds and cluster-buy detection
// =============================================================================
//
// Sources: the House and Senate stock-watcher S3 feeds (daily JSON dumps),
// with the Capitol Trades API as fallback per chamber. Disclosed amounts are
// ranges; the midpoint is used throughout (a scalar passes through as-is).
//
// The cluster detector is the alpha signal: 3+ distinct politicians buying
// one ticker within 30 days suggests committee-level information.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::rate_limit::RateLimiter;
use crate::store::congress::{ClusterSignal, CongressionalTrade};
use crate::store::Store;

const HOUSE_WATCHER_URL: &str =
    "https://house-stock-watcher-data.s3-us-west-2.amazonaws.com/data/all_transactions.json";
const SENATE_WATCHER_URL: &str =
    "https://senate-stock-watcher-data.s3-us-west-2.amazonaws.com/aggregate/all_transactions.json";
const CAPITOL_TRADES_URL: &str = "https://www.capitoltrades.com/api/trades";

const CLUSTER_WINDOW_DAYS: i64 = 30;
const CLUSTER_MIN_COUNT: usize = 3;

/// Committees whose members plausibly have early intel on these tickers.
fn committee_intel_map() -> Vec<(&'static str, &'static [&'static str])> {
    vec![
        ("Armed Services", &["LMT", "RTX", "NOC", "GD", "BA", "HII", "LDOS", "SAIC", "CACI"]),
        ("Intelligence", &["PLTR", "CACI", "SAIC", "LDOS"]),
        ("Banking", &["JPM", "BAC", "WFC", "GS", "MS", "C", "USB", "PNC"]),
        ("Finance", &["V", "MA", "PYPL", "AXP", "COF"]),
        ("Energy", &["XOM", "CVX", "COP", "OXY", "SLB", "HAL", "MPC", "PSX", "VLO"]),
        ("Commerce", &["AMZN", "GOOGL", "META", "MSFT", "AAPL", "NFLX", "UBER"]),
        ("Health", &["UNH", "CVS", "CI", "HUM", "MCK", "LLY", "PFE", "MRK"]),
        ("Judiciary", &["GOOGL", "META", "AMZN", "AAPL", "MSFT"]),
    ]
}

/// Summary of one full scan.
#[derive(Debug, Clone)]
pub struct CongressionalScan {
    pub total_trades: usize,
    pub significant_trades: usize,
    pub new_rows_saved: usize,
    pub clusters: Vec<ClusterSignal>,
}

pub struct CongressionalTracker {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    store: Arc<Store>,
    min_trade_amount: f64,
}

impl CongressionalTracker {
    pub fn new(store: Arc<Store>, limiter: Arc<RateLimiter>, min_trade_amount: f64) -> Self {
        limiter.configure("congress", 10, 1.0, None);
        Self {
            client: reqwest::Client::builder()
                .user_agent("sentinel-bot research (research purposes)")
                .timeout(std::time::Duration::from_secs(20))
                .build()
                .expect("failed to build reqwest client"),
            limiter,
            store,
            min_trade_amount,
        }
    }

    /// Fetch both chambers, persist significant trades, detect clusters,
    /// persist cluster signals. Degrades to an empty scan on total failure.
    pub async fn run_full_scan(&self, days_back: i64) -> CongressionalScan {
        info!("congressional tracker: running full scan");

        let mut trades = Vec::new();
        trades.extend(self.fetch_chamber("house", days_back).await);
        trades.extend(self.fetch_chamber("senate", days_back).await);
        let total = trades.len();

        let significant: Vec<CongressionalTrade> = trades
            .iter()
            .filter(|t| t.amount >= self.min_trade_amount)
            .cloned()
            .collect();

        let saved = self
            .store
            .insert_congressional_trades(&significant)
            .unwrap_or_else(|e| {
                warn!(error = %e, "congressional trade save failed");
                0
            });

        let clusters = detect_cluster_buys(&trades, CLUSTER_WINDOW_DAYS, CLUSTER_MIN_COUNT);
        if !clusters.is_empty() {
            if let Err(e) = self.store.insert_cluster_signals(&clusters) {
                warn!(error = %e, "cluster signal save failed");
            }
            let top = &clusters[0];
            info!(
                ticker = %top.ticker,
                buy_count = top.buy_count,
                strength = format!("{:.0}", top.signal_strength),
                bipartisan = top.bipartisan,
                "top congressional cluster"
            );
        }

        info!(
            total,
            significant = significant.len(),
            saved,
            clusters = clusters.len(),
            "congressional scan complete"
        );

        CongressionalScan {
            total_trades: total,
            significant_trades: significant.len(),
            new_rows_saved: saved,
            clusters,
        }
    }

    async fn fetch_chamber(&self, chamber: &str, days_back: i64) -> Vec<CongressionalTrade> {
        let url = match chamber {
            "house" => HOUSE_WATCHER_URL,
            _ => SENATE_WATCHER_URL,
        };

        self.limiter.wait_if_needed("congress").await;
        let primary = self.get_json(url).await;

        let trades = match primary {
            Some(data) => parse_watcher_feed(&data, chamber, days_back),
            None => {
                debug!(chamber, "watcher feed unavailable, trying Capitol Trades fallback");
                self.fetch_capitol_trades(chamber, days_back).await
            }
        };

        info!(chamber, count = trades.len(), "chamber trades fetched");
        trades
    }

    async fn fetch_capitol_trades(&self, chamber: &str, days_back: i64) -> Vec<CongressionalTrade> {
        self.limiter.wait_if_needed("congress").await;
        let url = format!("{CAPITOL_TRADES_URL}?chamber={chamber}&pageSize=100&page=1");
        let Some(data) = self.get_json(&url).await else {
            return Vec::new();
        };

        let items = data
            .get("trades")
            .or_else(|| data.get("data"))
            .or_else(|| data.get("results"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_else(|| data.as_array().cloned().unwrap_or_default());

        let cutoff = Utc::now().date_naive() - Duration::days(days_back);
        items
            .iter()
            .filter_map(|item| {
                let date_str = item
                    .get("publishedAt")
                    .or_else(|| item.get("transactionDate"))
                    .and_then(Value::as_str)?
                    .get(..10)?
                    .to_string();
                let date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d").ok()?;
                if date < cutoff {
                    return None;
                }

                let ticker = item
                    .get("issuerTicker")
                    .or_else(|| item.get("ticker"))
                    .and_then(Value::as_str)?
                    .trim()
                    .to_uppercase();
                if ticker.is_empty() {
                    return None;
                }

                let tx_type = item.get("type").and_then(Value::as_str).unwrap_or("").to_lowercase();
                let (name, party) = match item.get("politician") {
                    Some(Value::Object(p)) => (
                        p.get("name").and_then(Value::as_str).unwrap_or("Unknown").to_string(),
                        p.get("party").and_then(Value::as_str).unwrap_or("?").to_string(),
                    ),
                    Some(Value::String(s)) => (s.clone(), "?".to_string()),
                    _ => ("Unknown".to_string(), "?".to_string()),
                };

                // The fallback sometimes reports exact scalar amounts.
                let amount = match item.get("amount").or_else(|| item.get("value")) {
                    Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
                    Some(Value::String(s)) => parse_amount_range(s),
                    _ => 0.0,
                };

                Some(CongressionalTrade {
                    source: chamber.to_string(),
                    politician: name,
                    party,
                    ticker: ticker.clone(),
                    direction: parse_direction(&tx_type),
                    amount,
                    disclosure_date: date_str.clone(),
                    transaction_date: date_str,
                    asset_description: item
                        .get("issuerName")
                        .and_then(Value::as_str)
                        .unwrap_or(&ticker)
                        .to_string(),
                })
            })
            .collect()
    }

    async fn get_json(&self, url: &str) -> Option<Value> {
        match self.client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.limiter.record_request("congress", true);
                resp.json::<Value>().await.ok()
            }
            Ok(resp) => {
                self.limiter.record_request("congress", false);
                if resp.status().as_u16() == 429 {
                    self.limiter.trigger_backoff("congress");
                }
                debug!(url, status = %resp.status(), "congress fetch error");
                None
            }
            Err(e) => {
                self.limiter.record_request("congress", false);
                debug!(url, error = %e, "congress fetch failed");
                None
            }
        }
    }
}

/// Parse a stock-watcher feed (house and senate share the shape closely).
fn parse_watcher_feed(data: &Value, chamber: &str, days_back: i64) -> Vec<CongressionalTrade> {
    let cutoff = Utc::now().date_naive() - Duration::days(days_back);
    let items = data.as_array().cloned().unwrap_or_default();

    items
        .iter()
        .filter_map(|item| {
            let date_raw = item
                .get("disclosure_date")
                .or_else(|| item.get("transaction_date"))
                .and_then(Value::as_str)?
                .trim();
            let date = parse_flexible_date(date_raw)?;
            if date < cutoff {
                return None;
            }

            let ticker = item.get("ticker").and_then(Value::as_str)?.trim().to_uppercase();
            if ticker.is_empty() || ticker == "N/A" || ticker == "--" {
                return None;
            }

            let tx_type = item.get("type").and_then(Value::as_str).unwrap_or("").to_lowercase();
            let politician = item
                .get("representative")
                .or_else(|| item.get("senator"))
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string();

            Some(CongressionalTrade {
                source: chamber.to_string(),
                politician,
                party: item.get("party").and_then(Value::as_str).unwrap_or("?").to_string(),
                ticker: ticker.clone(),
                direction: parse_direction(&tx_type),
                amount: parse_amount_range(
                    item.get("amount").and_then(Value::as_str).unwrap_or(""),
                ),
                disclosure_date: date.format("%Y-%m-%d").to_string(),
                transaction_date: item
                    .get("transaction_date")
                    .and_then(Value::as_str)
                    .and_then(parse_flexible_date_opt)
                    .unwrap_or(date)
                    .format("%Y-%m-%d")
                    .to_string(),
                asset_description: item
                    .get("asset_description")
                    .and_then(Value::as_str)
                    .unwrap_or(&ticker)
                    .to_string(),
            })
        })
        .collect()
}

fn parse_direction(tx_type: &str) -> String {
    if tx_type.contains("purchase") || tx_type.contains("buy") {
        "buy".to_string()
    } else if tx_type.contains("sale") || tx_type.contains("sell") {
        "sell".to_string()
    } else {
        "unknown".to_string()
    }
}

/// Feeds mix MM/DD/YYYY and ISO dates.
fn parse_flexible_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    for format in ["%m/%d/%Y", "%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), format) {
            return Some(date);
        }
    }
    None
}

fn parse_flexible_date_opt(s: &str) -> Option<NaiveDate> {
    parse_flexible_date(s)
}

/// Parse "$15,001 - $50,000" to its midpoint. A plain scalar passes through.
pub fn parse_amount_range(amount: &str) -> f64 {
    let clean = amount.replace(['$', ','], "");
    let clean = clean.trim();
    if clean.is_empty() {
        return 0.0;
    }

    if let Some((low, high)) = clean.split_once('-').filter(|_| !clean.starts_with('-')) {
        match (low.trim().parse::<f64>(), high.trim().parse::<f64>()) {
            (Ok(low), Ok(high)) => (low + high) / 2.0,
            _ => 0.0,
        }
    } else {
        clean.parse::<f64>().unwrap_or(0.0)
    }
}

/// Detect tickers bought by `min_count`+ distinct politicians inside the
/// disclosure window.
pub fn detect_cluster_buys(
    trades: &[CongressionalTrade],
    window_days: i64,
    min_count: usize,
) -> Vec<ClusterSignal> {
    let cutoff = Utc::now().date_naive() - Duration::days(window_days);

    let mut groups: HashMap<String, Vec<&CongressionalTrade>> = HashMap::new();
    for trade in trades.iter().filter(|t| t.direction == "buy") {
        let Some(date) = parse_flexible_date(&trade.disclosure_date) else {
            continue;
        };
        if date < cutoff {
            continue;
        }
        groups.entry(trade.ticker.clone()).or_default().push(trade);
    }

    let mut clusters: Vec<ClusterSignal> = groups
        .into_iter()
        .filter_map(|(ticker, group)| {
            let politicians: Vec<String> = {
                let mut names: Vec<String> =
                    group.iter().map(|t| t.politician.clone()).collect();
                names.sort();
                names.dedup();
                names
            };
            if politicians.len() < min_count {
                return None;
            }

            let total_amount: f64 = group.iter().map(|t| t.amount).sum();
            let parties: Vec<&str> = {
                let mut p: Vec<&str> = group.iter().map(|t| t.party.as_str()).collect();
                p.sort();
                p.dedup();
                p
            };
            let bipartisan = parties.len() > 1;
            let committee_relevance: Vec<String> = committee_intel_map()
                .iter()
                .filter(|(_, tickers)| tickers.contains(&ticker.as_str()))
                .map(|(committee, _)| committee.to_string())
                .collect();

            let signal_strength = score_cluster(
                politicians.len(),
                total_amount,
                bipartisan,
                !committee_relevance.is_empty(),
            );

            Some(ClusterSignal {
                ticker,
                buy_count: politicians.len(),
                politicians,
                total_amount,
                bipartisan,
                committee_relevance,
                signal_strength,
                window_days,
            })
        })
        .collect();

    clusters.sort_by(|a, b| {
        b.signal_strength.partial_cmp(&a.signal_strength).unwrap_or(std::cmp::Ordering::Equal)
    });
    clusters
}

/// strength = min(100, 10*count + 3*log10(amount) + 15*bipartisan + 15*committee)
fn score_cluster(count: usize, total_amount: f64, bipartisan: bool, committee: bool) -> f64 {
    let mut score = 10.0 * count as f64;
    if total_amount > 1.0 {
        score += 3.0 * total_amount.log10();
    }
    if bipartisan {
        score += 15.0;
    }
    if committee {
        score += 15.0;
    }
    score.min(100.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn buy(politician: &str, party: &str, ticker: &str, amount: f64, days_ago: i64) -> CongressionalTrade {
        let date = (Utc::now().date_naive() - Duration::days(days_ago))
            .format("%Y-%m-%d")
            .to_string();
        CongressionalTrade {
            source: "house".into(),
            politician: politician.into(),
            party: party.into(),
            ticker: ticker.into(),
            direction: "buy".into(),
            amount,
            disclosure_date: date.clone(),
            transaction_date: date,
            asset_description: ticker.into(),
        }
    }

    #[test]
    fn amount_range_midpoint() {
        assert!((parse_amount_range("$15,001 - $50,000") - 32_500.5).abs() < 0.01);
        assert!((parse_amount_range("1001 - 15000") - 8000.5).abs() < 0.01);
        assert_eq!(parse_amount_range("$25,000"), 25_000.0);
        assert_eq!(parse_amount_range(""), 0.0);
        assert_eq!(parse_amount_range("garbage"), 0.0);
    }

    #[test]
    fn cluster_requires_three_distinct_politicians() {
        let trades = vec![
            buy("Alice", "D", "LMT", 32_500.0, 5),
            buy("Alice", "D", "LMT", 32_500.0, 8),
            buy("Bob", "R", "LMT", 50_000.0, 10),
        ];
        assert!(detect_cluster_buys(&trades, 30, 3).is_empty());

        let mut trades = trades;
        trades.push(buy("Carol", "D", "LMT", 8_000.0, 12));
        let clusters = detect_cluster_buys(&trades, 30, 3);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].buy_count, 3);
        assert!(clusters[0].bipartisan);
        assert!(clusters[0].committee_relevance.contains(&"Armed Services".to_string()));
    }

    #[test]
    fn trades_outside_window_ignored() {
        let trades = vec![
            buy("Alice", "D", "XOM", 20_000.0, 45),
            buy("Bob", "R", "XOM", 20_000.0, 50),
            buy("Carol", "D", "XOM", 20_000.0, 60),
        ];
        assert!(detect_cluster_buys(&trades, 30, 3).is_empty());
    }

    #[test]
    fn sells_never_cluster() {
        let mut trades = vec![
            buy("Alice", "D", "NVDA", 20_000.0, 3),
            buy("Bob", "R", "NVDA", 20_000.0, 4),
        ];
        let mut sell = buy("Carol", "D", "NVDA", 20_000.0, 5);
        sell.direction = "sell".into();
        trades.push(sell);
        assert!(detect_cluster_buys(&trades, 30, 3).is_empty());
    }

    #[test]
    fn cluster_strength_formula() {
        // 3 politicians, $100k total, bipartisan, committee-relevant:
        // 30 + 3*5 + 15 + 15 = 75.
        let strength = score_cluster(3, 100_000.0, true, true);
        assert!((strength - 75.0).abs() < 0.01);

        // Strength is capped at 100.
        assert_eq!(score_cluster(10, 1e9, true, true), 100.0);
    }

    #[test]
    fn flexible_dates_parse() {
        assert!(parse_flexible_date("03/15/2026").is_some());
        assert!(parse_flexible_date("2026-03-15").is_some());
        assert!(parse_flexible_date("2026-03-15T10:00:00").is_some());
        assert!(parse_flexible_date("yesterday").is_none());
    }
}
