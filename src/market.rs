// =============================================================================
// Market Data Adapter — quotes, index levels, bond yield, fundamentals, filings
// =============================================================================
//
// Providers: Yahoo Finance v8/v10 (quotes, history, fundamentals), FRED
// (bond yield), SEC EDGAR (filings). All results carry a fetched-at stamp.
//
// On ANY fetch failure the adapter returns `MarketError::Unavailable`.
// It never synthesizes a price — phantom P&L is worse than a skipped cycle,
// and every caller already handles missing data.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::rate_limit::RateLimiter;

const YAHOO_CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const YAHOO_SUMMARY_URL: &str = "https://query1.finance.yahoo.com/v10/finance/quoteSummary";
const FRED_OBS_URL: &str = "https://api.stlouisfed.org/fred/series/observations";
const SEC_TICKERS_URL: &str = "https://www.sec.gov/files/company_tickers.json";
const SEC_SUBMISSIONS_URL: &str = "https://data.sec.gov/submissions";

/// Typed failure: the caller learns WHICH provider went dark, and nothing
/// else — no fabricated values ride along.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("market data unavailable from {provider}: {reason}")]
    Unavailable { provider: &'static str, reason: String },
}

impl MarketError {
    fn unavailable(provider: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            provider,
            reason: reason.into(),
        }
    }
}

pub type MarketResult<T> = Result<T, MarketError>;

#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub ticker: String,
    pub price: f64,
    pub previous_close: Option<f64>,
    pub fetched_at: DateTime<Utc>,
}

/// VIX level and S&P 500 day change, fetched together each cycle.
#[derive(Debug, Clone, Serialize)]
pub struct IndexSnapshot {
    pub vix: f64,
    pub sp500_change_pct: f64,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BondYield {
    pub yield_pct: f64,
    pub observation_date: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyBar {
    pub timestamp: i64,
    pub close: f64,
    pub volume: i64,
}

/// Fundamentals snapshot assembled from Yahoo quoteSummary modules.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Fundamentals {
    pub market_cap: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub forward_pe: Option<f64>,
    pub profit_margin: Option<f64>,
    pub revenue_growth_yoy: Option<f64>,
    pub debt_to_equity: Option<f64>,
    pub fifty_two_week_high: Option<f64>,
    pub fifty_two_week_low: Option<f64>,
    pub target_mean: Option<f64>,
    pub target_high: Option<f64>,
    pub target_low: Option<f64>,
    pub recommendation_buy: i64,
    pub recommendation_hold: i64,
    pub recommendation_sell: i64,
    /// Raw provider payload, preserved for the analyst prompt.
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Filing {
    pub form: String,
    pub filed: String,
    pub document: String,
}

/// Fetches and normalizes external market data.
pub struct MarketDataClient {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    fred_api_key: String,
    /// Ticker -> zero-padded CIK, downloaded once per process.
    cik_map: Mutex<Option<HashMap<String, String>>>,
}

impl MarketDataClient {
    pub fn new(fred_api_key: String, limiter: Arc<RateLimiter>) -> Self {
        limiter.configure("yahoo", 30, 0.5, None);
        limiter.configure("fred", 30, 0.5, None);
        limiter.configure("sec", 10, 0.5, None);

        Self {
            client: reqwest::Client::builder()
                .user_agent("Mozilla/5.0 (sentinel-bot research contact@sentinel.local)")
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .expect("failed to build reqwest client"),
            limiter,
            fred_api_key,
            cik_map: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Quotes and indices
    // -------------------------------------------------------------------------

    /// Latest trade price via the Yahoo chart API.
    pub async fn latest_quote(&self, ticker: &str) -> MarketResult<Quote> {
        let symbol = ticker.to_uppercase();
        let meta = self.chart_meta(&symbol).await?;

        let price = meta
            .get("regularMarketPrice")
            .and_then(Value::as_f64)
            .filter(|p| *p > 0.0)
            .ok_or_else(|| MarketError::unavailable("yahoo", format!("no price for {symbol}")))?;

        Ok(Quote {
            ticker: symbol,
            price,
            previous_close: meta.get("chartPreviousClose").and_then(Value::as_f64),
            fetched_at: Utc::now(),
        })
    }

    /// VIX level plus S&P 500 change on the day.
    pub async fn index_snapshot(&self) -> MarketResult<IndexSnapshot> {
        let vix_meta = self.chart_meta("%5EVIX").await?;
        let vix = vix_meta
            .get("regularMarketPrice")
            .and_then(Value::as_f64)
            .ok_or_else(|| MarketError::unavailable("yahoo", "VIX price missing"))?;

        let spx_meta = self.chart_meta("%5EGSPC").await?;
        let price = spx_meta.get("regularMarketPrice").and_then(Value::as_f64);
        let prev = spx_meta.get("chartPreviousClose").and_then(Value::as_f64);
        let change_pct = match (price, prev) {
            (Some(p), Some(c)) if c > 0.0 => (p - c) / c * 100.0,
            _ => return Err(MarketError::unavailable("yahoo", "S&P 500 close missing")),
        };

        Ok(IndexSnapshot {
            vix,
            sp500_change_pct: (change_pct * 100.0).round() / 100.0,
            fetched_at: Utc::now(),
        })
    }

    async fn chart_meta(&self, symbol: &str) -> MarketResult<Value> {
        self.limiter.wait_if_needed("yahoo").await;
        let url = format!("{YAHOO_CHART_URL}/{symbol}?interval=1d&range=1d");
        let body = self.get_json(&url, "yahoo").await?;
        body.pointer("/chart/result/0/meta")
            .cloned()
            .ok_or_else(|| MarketError::unavailable("yahoo", format!("no chart meta for {symbol}")))
    }

    /// Daily close history for `ticker` over `range` (e.g. "1mo").
    pub async fn daily_history(&self, ticker: &str, range: &str) -> MarketResult<Vec<DailyBar>> {
        self.limiter.wait_if_needed("yahoo").await;
        let symbol = ticker.to_uppercase();
        let url = format!("{YAHOO_CHART_URL}/{symbol}?interval=1d&range={range}");
        let body = self.get_json(&url, "yahoo").await?;

        let timestamps = body
            .pointer("/chart/result/0/timestamp")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let closes = body
            .pointer("/chart/result/0/indicators/quote/0/close")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let volumes = body
            .pointer("/chart/result/0/indicators/quote/0/volume")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let bars: Vec<DailyBar> = timestamps
            .iter()
            .enumerate()
            .filter_map(|(i, ts)| {
                let close = closes.get(i).and_then(Value::as_f64)?;
                Some(DailyBar {
                    timestamp: ts.as_i64()?,
                    close,
                    volume: volumes.get(i).and_then(Value::as_i64).unwrap_or(0),
                })
            })
            .collect();

        if bars.is_empty() {
            return Err(MarketError::unavailable("yahoo", format!("no history for {symbol}")));
        }
        Ok(bars)
    }

    // -------------------------------------------------------------------------
    // Bond yield (FRED)
    // -------------------------------------------------------------------------

    /// Latest 10-year Treasury yield. FRED marks missing observations with
    /// '.', so the newest non-missing row wins.
    pub async fn bond_yield(&self) -> MarketResult<BondYield> {
        let observations = self.fred_series("DGS10", 5).await?;
        observations
            .into_iter()
            .next_back()
            .map(|(date, value)| BondYield {
                yield_pct: value,
                observation_date: date,
                fetched_at: Utc::now(),
            })
            .ok_or_else(|| MarketError::unavailable("fred", "no DGS10 observations"))
    }

    /// Fetch a FRED series: chronological (date, value) pairs, missing
    /// observations skipped.
    pub async fn fred_series(
        &self,
        series_id: &str,
        limit: usize,
    ) -> MarketResult<Vec<(String, f64)>> {
        if self.fred_api_key.is_empty() {
            return Err(MarketError::unavailable("fred", "no API key configured"));
        }
        self.limiter.wait_if_needed("fred").await;
        let url = format!(
            "{FRED_OBS_URL}?series_id={series_id}&api_key={}&file_type=json&sort_order=desc&limit={limit}",
            self.fred_api_key
        );
        let body = self.get_json(&url, "fred").await?;

        let observations = body
            .get("observations")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut result: Vec<(String, f64)> = observations
            .iter()
            .filter_map(|obs| {
                let raw = obs.get("value")?.as_str()?;
                if raw == "." {
                    return None;
                }
                Some((obs.get("date")?.as_str()?.to_string(), raw.parse::<f64>().ok()?))
            })
            .collect();
        result.reverse();

        if result.is_empty() {
            return Err(MarketError::unavailable("fred", format!("{series_id} empty")));
        }
        Ok(result)
    }

    // -------------------------------------------------------------------------
    // Fundamentals + analyst coverage (Yahoo quoteSummary)
    // -------------------------------------------------------------------------

    pub async fn fundamentals(&self, ticker: &str) -> MarketResult<Fundamentals> {
        self.limiter.wait_if_needed("yahoo").await;
        let symbol = ticker.to_uppercase();
        let url = format!(
            "{YAHOO_SUMMARY_URL}/{symbol}?modules=summaryDetail,defaultKeyStatistics,financialData,recommendationTrend"
        );
        let body = self.get_json(&url, "yahoo").await?;

        let result = body
            .pointer("/quoteSummary/result/0")
            .cloned()
            .ok_or_else(|| {
                MarketError::unavailable("yahoo", format!("no quoteSummary for {symbol}"))
            })?;

        let raw_num = |pointer: &str| result.pointer(pointer).and_then(Value::as_f64);
        let trend = result
            .pointer("/recommendationTrend/trend/0")
            .cloned()
            .unwrap_or(Value::Null);
        let trend_count = |key: &str| trend.get(key).and_then(Value::as_i64).unwrap_or(0);

        Ok(Fundamentals {
            market_cap: raw_num("/summaryDetail/marketCap/raw"),
            pe_ratio: raw_num("/summaryDetail/trailingPE/raw"),
            forward_pe: raw_num("/summaryDetail/forwardPE/raw"),
            profit_margin: raw_num("/financialData/profitMargins/raw"),
            revenue_growth_yoy: raw_num("/financialData/revenueGrowth/raw"),
            debt_to_equity: raw_num("/financialData/debtToEquity/raw"),
            fifty_two_week_high: raw_num("/summaryDetail/fiftyTwoWeekHigh/raw"),
            fifty_two_week_low: raw_num("/summaryDetail/fiftyTwoWeekLow/raw"),
            target_mean: raw_num("/financialData/targetMeanPrice/raw"),
            target_high: raw_num("/financialData/targetHighPrice/raw"),
            target_low: raw_num("/financialData/targetLowPrice/raw"),
            recommendation_buy: trend_count("buy") + trend_count("strongBuy"),
            recommendation_hold: trend_count("hold"),
            recommendation_sell: trend_count("sell") + trend_count("strongSell"),
            raw: result,
        })
    }

    // -------------------------------------------------------------------------
    // SEC filings
    // -------------------------------------------------------------------------

    /// Recent filings for a ticker via the EDGAR submissions API (keyless).
    pub async fn recent_filings(&self, ticker: &str, limit: usize) -> MarketResult<Vec<Filing>> {
        let cik = self.ticker_to_cik(ticker).await?;
        self.limiter.wait_if_needed("sec").await;
        let url = format!("{SEC_SUBMISSIONS_URL}/CIK{cik}.json");
        let body = self.get_json(&url, "sec").await?;

        let recent = body.pointer("/filings/recent").cloned().unwrap_or(Value::Null);
        let forms = recent.get("form").and_then(Value::as_array).cloned().unwrap_or_default();
        let dates = recent
            .get("filingDate")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let docs = recent
            .get("primaryDocument")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let filings: Vec<Filing> = forms
            .iter()
            .enumerate()
            .take(limit)
            .filter_map(|(i, form)| {
                Some(Filing {
                    form: form.as_str()?.to_string(),
                    filed: dates.get(i).and_then(Value::as_str).unwrap_or("").to_string(),
                    document: docs.get(i).and_then(Value::as_str).unwrap_or("").to_string(),
                })
            })
            .collect();

        if filings.is_empty() {
            return Err(MarketError::unavailable("sec", format!("no filings for {ticker}")));
        }
        Ok(filings)
    }

    async fn ticker_to_cik(&self, ticker: &str) -> MarketResult<String> {
        let ticker = ticker.to_uppercase();
        if let Some(map) = self.cik_map.lock().as_ref() {
            return map
                .get(&ticker)
                .cloned()
                .ok_or_else(|| MarketError::unavailable("sec", format!("no CIK for {ticker}")));
        }

        self.limiter.wait_if_needed("sec").await;
        let body = self.get_json(SEC_TICKERS_URL, "sec").await?;
        let map: HashMap<String, String> = body
            .as_object()
            .map(|entries| {
                entries
                    .values()
                    .filter_map(|entry| {
                        let t = entry.get("ticker")?.as_str()?.to_uppercase();
                        let cik = entry.get("cik_str")?.as_i64()?;
                        Some((t, format!("{cik:010}")))
                    })
                    .collect()
            })
            .unwrap_or_default();

        debug!(companies = map.len(), "SEC ticker map cached");
        let result = map
            .get(&ticker)
            .cloned()
            .ok_or_else(|| MarketError::unavailable("sec", format!("no CIK for {ticker}")));
        *self.cik_map.lock() = Some(map);
        result
    }

    // -------------------------------------------------------------------------
    // HTTP plumbing
    // -------------------------------------------------------------------------

    async fn get_json(&self, url: &str, endpoint: &'static str) -> MarketResult<Value> {
        let response = self.client.get(url).send().await.map_err(|e| {
            self.limiter.record_request(endpoint, false);
            MarketError::unavailable(endpoint, e.to_string())
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            self.limiter.record_request(endpoint, false);
            self.limiter.trigger_backoff(endpoint);
            return Err(MarketError::unavailable(endpoint, "rate limited (429)"));
        }
        if !status.is_success() {
            self.limiter.record_request(endpoint, false);
            warn!(endpoint, %status, "provider returned error status");
            return Err(MarketError::unavailable(endpoint, format!("HTTP {status}")));
        }

        let body = response.json::<Value>().await.map_err(|e| {
            self.limiter.record_request(endpoint, false);
            MarketError::unavailable(endpoint, format!("decode: {e}"))
        })?;
        self.limiter.record_request(endpoint, true);
        Ok(body)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_error_names_provider() {
        let err = MarketError::unavailable("yahoo", "timeout");
        assert!(err.to_string().contains("yahoo"));
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn missing_fred_key_is_unavailable_not_panic() {
        let limiter = Arc::new(RateLimiter::new());
        let client = MarketDataClient::new(String::new(), limiter);
        let result = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(client.fred_series("DGS10", 5));
        assert!(matches!(result, Err(MarketError::Unavailable { provider: "fred", .. })));
    }
}
