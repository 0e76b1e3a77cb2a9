// =============================================================================
// Paper Broker — position lifecycle, conditional triggers, crisis packages
// =============================================================================
//
// Three ways into a position:
//   1. Crisis packages — a DEFCON 1-2 escalation buys a 3-asset package
//      chosen by crisis type (operator-approved in `disabled` mode).
//   2. Acquisition conditionals — analyst-approved plans trigger when live
//      price touches the entry target under the side the watch tag implies,
//      after a fail-open reasoning-tier pre-trade gate.
//   3. Manual `buy` commands.
//
// One way out: the exit engine (exits.rs), plus manual `sell`. Stop-loss and
// profit-target exits seed the rebound / re-accumulation watchlist queues.
// =============================================================================

pub mod exits;

use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::alerts::{AlertSystem, EventKind};
use crate::config::Config;
use crate::llm::{parse, LlmGateway, LlmTier};
use crate::market::MarketDataClient;
use crate::store::acquisition::{ConditionalRow, WatchSource, WatchStatus, WatchTag};
use crate::store::trades::{ExitReason, TradeInsert};
use crate::store::Store;
use crate::types::CrisisCategory;

use exits::{ExitParams, ExitSignal, ExitStrategyManager};

/// VIX-adjusted package sizing bounds (dollars).
const BASE_POSITION_SIZE: f64 = 10_000.0;
const MIN_POSITION_SIZE: f64 = 3_000.0;
const MAX_POSITION_SIZE: f64 = 20_000.0;

/// Portfolio-level exposure ceiling as a fraction of total capital.
const MAX_PORTFOLIO_EXPOSURE: f64 = 0.60;

/// Crisis-type to asset-package mapping. Allocation is always 50/30/20.
fn crisis_assets(category: CrisisCategory) -> (&'static str, &'static str, &'static str, &'static str) {
    match category {
        CrisisCategory::TechCrash => {
            ("VTI", "IVV", "GOOGL", "Rotate to broad diversification during tech correction")
        }
        CrisisCategory::GeopoliticalTrade => {
            ("QQQ", "MSFT", "NVDA", "IP-based business models resilient to tariffs")
        }
        CrisisCategory::LiquidityCredit => {
            ("MSFT", "GOOGL", "QQQ", "Large-cap quality less affected by credit stress")
        }
        CrisisCategory::InflationRate => {
            ("QQQ", "NVDA", "MSFT", "Growth benefits from Fed policy pivot expectations")
        }
        CrisisCategory::PandemicHealth => {
            ("MSFT", "GOOGL", "NVDA", "Remote-work and cloud infrastructure winners")
        }
        CrisisCategory::MarketCorrection | CrisisCategory::Signal => {
            ("GOOGL", "NVDA", "MSFT", "Flight to mega-cap quality")
        }
    }
}

/// Classify a crisis description into a category by keyword hits.
pub fn analyze_crisis_type(description: &str) -> CrisisCategory {
    let text = description.to_lowercase();
    let candidates: [(CrisisCategory, &[&str]); 6] = [
        (CrisisCategory::TechCrash, &["tech", "valuation", "margin", "overvalued"]),
        (CrisisCategory::GeopoliticalTrade, &["tariff", "trade war", "china", "sanctions"]),
        (CrisisCategory::LiquidityCredit, &["liquidity", "credit", "banking", "spread"]),
        (CrisisCategory::InflationRate, &["inflation", "yield", "rate", "fed"]),
        (CrisisCategory::PandemicHealth, &["pandemic", "covid", "health", "lockdown"]),
        (CrisisCategory::MarketCorrection, &["correction", "selloff", "drawdown", "crash"]),
    ];

    candidates
        .iter()
        .map(|(category, keywords)| {
            (*category, keywords.iter().filter(|kw| text.contains(*kw)).count())
        })
        .filter(|(_, hits)| *hits > 0)
        .max_by_key(|(_, hits)| *hits)
        .map(|(category, _)| category)
        .unwrap_or(CrisisCategory::MarketCorrection)
}

/// A proposed 3-asset trade package awaiting approval or execution.
#[derive(Debug, Clone, Serialize)]
pub struct TradeAlert {
    pub timestamp: String,
    pub defcon_level: u8,
    pub signal_score: f64,
    pub crisis_description: String,
    pub crisis_type: CrisisCategory,
    pub primary_asset: String,
    pub secondary_asset: String,
    pub tertiary_asset: String,
    pub total_position_size: f64,
    pub vix: f64,
    pub rationale: String,
    pub confidence_score: f64,
}

impl TradeAlert {
    /// (ticker, dollar allocation) triples: 50% / 30% / 20%.
    pub fn allocations(&self) -> [(String, f64); 3] {
        [
            (self.primary_asset.clone(), self.total_position_size * 0.50),
            (self.secondary_asset.clone(), self.total_position_size * 0.30),
            (self.tertiary_asset.clone(), self.total_position_size * 0.20),
        ]
    }
}

/// Outcome of one command-driven trade operation.
#[derive(Debug, Clone, Serialize)]
pub struct ManualTradeResult {
    pub ok: bool,
    pub message: String,
    pub trade_id: Option<i64>,
}

impl ManualTradeResult {
    fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            trade_id: None,
        }
    }
}

pub struct PaperBroker {
    store: Arc<Store>,
    market: Arc<MarketDataClient>,
    llm: Arc<LlmGateway>,
    alerts: Arc<AlertSystem>,
    pub exit_manager: ExitStrategyManager,
    total_capital: f64,
    max_position_pct: f64,
}

impl PaperBroker {
    pub fn new(
        config: &Config,
        store: Arc<Store>,
        market: Arc<MarketDataClient>,
        llm: Arc<LlmGateway>,
        alerts: Arc<AlertSystem>,
    ) -> Self {
        let exit_manager = ExitStrategyManager::new(ExitParams {
            stop_loss_pct: config.stop_loss_pct,
            profit_target_pct: config.profit_target_pct,
            trailing_stop_pct: config.trailing_stop_pct,
            max_hold_hours: config.max_hold_hours,
            min_hold_hours: config.min_hold_hours,
        });

        Self {
            store,
            market,
            llm,
            alerts,
            exit_manager,
            total_capital: config.total_capital,
            max_position_pct: config.max_position_pct,
        }
    }

    // -------------------------------------------------------------------------
    // Capital accounting
    // -------------------------------------------------------------------------

    /// Cash available for new entries: capital + realized P&L - deployed cost.
    pub fn available_cash(&self) -> f64 {
        let realized = self
            .store
            .portfolio_performance()
            .map(|p| p.total_realized_pnl)
            .unwrap_or(0.0);
        let deployed = self.store.deployed_capital().unwrap_or(0.0);
        self.total_capital + realized - deployed
    }

    /// Base position dollars scaled inversely with VIX, clamped.
    pub fn position_size_vix_adjusted(&self, vix: f64) -> f64 {
        let vix = if vix > 0.0 { vix } else { 20.0 };
        (BASE_POSITION_SIZE * (20.0 / vix)).clamp(MIN_POSITION_SIZE, MAX_POSITION_SIZE)
    }

    // -------------------------------------------------------------------------
    // Crisis packages
    // -------------------------------------------------------------------------

    pub fn generate_trade_alert(
        &self,
        defcon_level: u8,
        signal_score: f64,
        crisis_description: &str,
        vix: f64,
    ) -> TradeAlert {
        let crisis_type = analyze_crisis_type(crisis_description);
        let (primary, secondary, tertiary, rationale) = crisis_assets(crisis_type);

        let base_confidence = signal_score.min(100.0);
        let defcon_boost = ((5 - defcon_level.min(5)) as f64) * 15.0;
        let confidence = (base_confidence + defcon_boost).min(100.0);

        TradeAlert {
            timestamp: Local::now().to_rfc3339(),
            defcon_level,
            signal_score,
            crisis_description: crisis_description.to_string(),
            crisis_type,
            primary_asset: primary.to_string(),
            secondary_asset: secondary.to_string(),
            tertiary_asset: tertiary.to_string(),
            total_position_size: self.position_size_vix_adjusted(vix),
            vix,
            rationale: rationale.to_string(),
            confidence_score: confidence,
        }
    }

    /// Execute a 3-asset package. Assets with unavailable prices or dust
    /// allocations are skipped, not failed. Returns the trade ids created.
    pub async fn execute_trade_package(&self, alert: &TradeAlert) -> Vec<i64> {
        let crisis_id = self
            .store
            .signal_crisis_event(
                alert.defcon_level,
                alert.signal_score,
                &alert.crisis_description,
                CrisisCategory::Signal.as_str(),
            )
            .ok();

        let mut trade_ids = Vec::new();
        for (ticker, dollars) in alert.allocations() {
            let quote = match self.market.latest_quote(&ticker).await {
                Ok(q) => q,
                Err(e) => {
                    warn!(ticker = %ticker, error = %e, "no price — skipping package leg");
                    continue;
                }
            };

            let shares = (dollars / quote.price).floor() as i64;
            if shares <= 0 {
                warn!(ticker = %ticker, dollars, price = quote.price, "allocation too small");
                continue;
            }

            match self.store.open_trade(&TradeInsert {
                crisis_id,
                ticker: ticker.clone(),
                entry_price: quote.price,
                shares,
                entry_signal_score: alert.signal_score,
                defcon_at_entry: alert.defcon_level,
                notes: format!("{} package: {}", alert.crisis_type, alert.rationale),
            }) {
                Ok(id) => {
                    trade_ids.push(id);
                    self.alerts
                        .publish(
                            EventKind::TradeEntry,
                            &json!({
                                "ticker": ticker,
                                "shares": shares,
                                "entry_price": quote.price,
                                "position_size": quote.price * shares as f64,
                                "defcon": alert.defcon_level,
                            }),
                        )
                        .await;
                }
                Err(e) => warn!(ticker = %ticker, error = %e, "package entry failed"),
            }
        }
        trade_ids
    }

    /// Autonomous path: decide and execute in one step. Returns executed ids.
    pub async fn process_market_conditions(
        &self,
        defcon_level: u8,
        signal_score: f64,
        crisis_description: &str,
        vix: f64,
    ) -> Vec<i64> {
        let alert = self.generate_trade_alert(defcon_level, signal_score, crisis_description, vix);

        let deployed = self.store.deployed_capital().unwrap_or(0.0);
        if deployed + alert.total_position_size > self.total_capital * MAX_PORTFOLIO_EXPOSURE {
            warn!(
                deployed,
                package = alert.total_position_size,
                ceiling = self.total_capital * MAX_PORTFOLIO_EXPOSURE,
                "portfolio exposure ceiling reached — skipping package"
            );
            return Vec::new();
        }

        info!(
            crisis = %alert.crisis_type,
            size = alert.total_position_size,
            confidence = alert.confidence_score,
            "broker executing crisis package"
        );
        self.execute_trade_package(&alert).await
    }

    // -------------------------------------------------------------------------
    // Exit evaluation and execution
    // -------------------------------------------------------------------------

    /// Evaluate every open position against live prices. Updates
    /// mark-to-market fields and trailing peaks; does NOT close anything.
    pub async fn evaluate_exits(&self, current_defcon: u8) -> Vec<ExitSignal> {
        let open = match self.store.open_trades() {
            Ok(trades) => trades,
            Err(e) => {
                warn!(error = %e, "open trade fetch failed");
                return Vec::new();
            }
        };

        let mut signals = Vec::new();
        for trade in &open {
            let quote = match self.market.latest_quote(&trade.ticker).await {
                Ok(q) => q,
                Err(e) => {
                    warn!(ticker = %trade.ticker, error = %e, "price unavailable — skipping exit eval");
                    continue;
                }
            };
            if let Err(e) = self.store.update_trade_price(trade.trade_id, quote.price) {
                warn!(error = %e, "mark-to-market update failed");
            }

            if let Some(signal) =
                self.exit_manager.evaluate_position(trade, quote.price, current_defcon)
            {
                info!(
                    trade_id = signal.trade_id,
                    ticker = %signal.ticker,
                    rule = ?signal.rule,
                    message = %signal.message,
                    "exit signal"
                );
                signals.push(signal);
            }
        }

        signals.sort_by(|a, b| b.priority.cmp(&a.priority));
        signals
    }

    /// Close a position from an exit signal: persist, clear the peak, queue
    /// the rebound watchlist when appropriate, notify.
    pub async fn execute_exit(&self, signal: &ExitSignal) -> Result<Option<f64>> {
        let reason = signal.rule.persisted_reason();
        let note = match reason {
            // Manual-mapped exits keep the real trigger in the note.
            ExitReason::Manual => signal.message.clone(),
            _ => String::new(),
        };

        let realized = self.store.close_trade(signal.trade_id, signal.exit_price, reason, &note)?;
        if realized.is_none() {
            return Ok(None);
        }
        self.exit_manager.clear_peak(signal.trade_id);

        self.alerts
            .publish(
                EventKind::TradeExit,
                &json!({
                    "ticker": signal.ticker,
                    "exit_price": signal.exit_price,
                    "reason": signal.rule,
                    "pnl_pct": signal.pnl_pct * 100.0,
                }),
            )
            .await;

        // Loss-triggered re-entry: a stopped ticker goes back on the
        // watchlist to be researched for a rebound; a profit-target exit
        // queues re-accumulation.
        match reason {
            ExitReason::StopLoss => {
                self.queue_reentry(signal, WatchSource::StopLossRebound, "Re-enter below").await
            }
            ExitReason::ProfitTarget => {
                self.queue_reentry(signal, WatchSource::ProfitTargetReaccumulation, "Re-accumulate below")
                    .await
            }
            _ => {}
        }

        Ok(realized)
    }

    async fn queue_reentry(&self, signal: &ExitSignal, source: WatchSource, verb: &str) {
        let date = Local::now().format("%Y-%m-%d").to_string();
        let conditions = format!("{verb} ${:.2} (exit price)", signal.exit_price);
        if let Err(e) = self.store.queue_watchlist(
            &date,
            &signal.ticker,
            source,
            0.5,
            &conditions,
            &format!("Queued by {} exit", signal.rule.persisted_reason().as_str()),
        ) {
            warn!(ticker = %signal.ticker, error = %e, "re-entry queue failed");
            return;
        }

        self.alerts
            .publish(
                EventKind::ReboundWatchlist,
                &json!({
                    "ticker": signal.ticker,
                    "exit_price": signal.exit_price,
                    "pnl_pct": signal.pnl_pct * 100.0,
                }),
            )
            .await;
    }

    /// Evaluate and immediately execute (autonomous modes). Returns the
    /// number of positions closed.
    pub async fn process_exits(&self, current_defcon: u8) -> usize {
        let signals = self.evaluate_exits(current_defcon).await;
        let mut closed = 0;
        for signal in &signals {
            match self.execute_exit(signal).await {
                Ok(Some(_)) => closed += 1,
                Ok(None) => {}
                Err(e) => warn!(trade_id = signal.trade_id, error = %e, "exit execution failed"),
            }
        }
        closed
    }

    // -------------------------------------------------------------------------
    // Conditional entries
    // -------------------------------------------------------------------------

    /// Whether a live price touch triggers the entry, by setup side:
    /// breakout and momentum setups buy strength (price at/above target);
    /// every other tag buys weakness (price at/below target).
    pub fn entry_triggered(tag: WatchTag, price: f64, target: f64) -> bool {
        if target <= 0.0 {
            return false;
        }
        match tag {
            WatchTag::Breakout | WatchTag::Momentum => price >= target,
            _ => price <= target,
        }
    }

    /// Check every active conditional against live prices; enter triggered
    /// ones. Returns the number of entries.
    pub async fn check_conditionals(&self, current_defcon: u8) -> usize {
        let expired = self.store.expire_conditionals_past_horizon().unwrap_or_default();
        for ticker in &expired {
            info!(ticker = %ticker, "conditional expired past time horizon");
            let _ = self.store.transition_watchlist(
                ticker,
                &[WatchStatus::ConditionalSet],
                WatchStatus::Expired,
                Some("Conditional expired without trigger"),
            );
        }

        let actives = match self.store.active_conditionals() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "active conditional fetch failed");
                return 0;
            }
        };

        let mut entered = 0;
        for conditional in &actives {
            let quote = match self.market.latest_quote(&conditional.ticker).await {
                Ok(q) => q,
                Err(_) => continue,
            };
            if !Self::entry_triggered(conditional.watch_tag, quote.price, conditional.entry_price_target) {
                continue;
            }

            info!(
                ticker = %conditional.ticker,
                price = quote.price,
                target = conditional.entry_price_target,
                tag = conditional.watch_tag.as_str(),
                "conditional touched — running pre-trade gate"
            );

            if !self.pre_trade_gate(conditional, quote.price, current_defcon).await {
                info!(ticker = %conditional.ticker, "pre-trade gate declined entry");
                continue;
            }

            if self.enter_conditional(conditional, quote.price, current_defcon).await {
                entered += 1;
            }
        }
        entered
    }

    /// Reasoning-tier sanity check on current conditions. FAIL-OPEN: an LLM
    /// error or unparseable answer never blocks an analyst-approved entry.
    async fn pre_trade_gate(
        &self,
        conditional: &ConditionalRow,
        current_price: f64,
        current_defcon: u8,
    ) -> bool {
        let prompt = format!(
            "You are a trading-system pre-trade gate. An analyst-approved conditional \
             entry on {} just triggered.\n\n\
             Plan: entry ${:.2}, stop ${:.2}, TP1 ${:.2}, confidence {:.2}, tag {}.\n\
             Thesis: {}\n\
             Entry conditions: {}\n\
             Current price: ${:.2}. Current DEFCON: {}/5.\n\n\
             Should the entry proceed RIGHT NOW? Respond ONLY with JSON:\n\
             {{\"proceed\": true, \"reason\": \"...\"}}",
            conditional.ticker,
            conditional.entry_price_target,
            conditional.stop_loss,
            conditional.take_profit_1,
            conditional.research_confidence,
            conditional.watch_tag.as_str(),
            conditional.thesis_summary,
            conditional.entry_conditions.join("; "),
            current_price,
            current_defcon,
        );

        let response = self.llm.call(LlmTier::Reasoning, &prompt, "pre_trade_gate").await;
        let value = response.parse_json();
        if parse::parse_failed(&value) {
            warn!(ticker = %conditional.ticker, "pre-trade gate unparseable — failing open");
            return true;
        }
        let proceed = value.get("proceed").and_then(serde_json::Value::as_bool).unwrap_or(true);
        if !proceed {
            info!(
                ticker = %conditional.ticker,
                reason = %parse::str_field(&value, "reason"),
                "gate declined"
            );
        }
        proceed
    }

    async fn enter_conditional(
        &self,
        conditional: &ConditionalRow,
        entry_price: f64,
        current_defcon: u8,
    ) -> bool {
        // Position sizing: confidence-scaled, hard-capped, applied to cash.
        let size_pct = (conditional.research_confidence * conditional.position_size_pct)
            .clamp(0.0, self.max_position_pct);
        let dollars = size_pct * self.available_cash();
        let shares = (dollars / entry_price).floor() as i64;
        if shares <= 0 {
            warn!(ticker = %conditional.ticker, dollars, "conditional sized to zero shares — skipping");
            return false;
        }

        let trade = self.store.open_trade(&TradeInsert {
            crisis_id: None,
            ticker: conditional.ticker.clone(),
            entry_price,
            shares,
            entry_signal_score: conditional.research_confidence * 100.0,
            defcon_at_entry: current_defcon,
            notes: format!(
                "Conditional entry [{}]: {}",
                conditional.watch_tag.as_str(),
                conditional.thesis_summary
            ),
        });

        match trade {
            Ok(trade_id) => {
                let _ = self.store.mark_conditional_triggered(conditional.conditional_id);
                let _ = self.store.transition_watchlist(
                    &conditional.ticker,
                    &[WatchStatus::ConditionalSet],
                    WatchStatus::Triggered,
                    Some("Conditional triggered and entered"),
                );
                self.alerts
                    .publish(
                        EventKind::TradeEntry,
                        &json!({
                            "ticker": conditional.ticker,
                            "shares": shares,
                            "entry_price": entry_price,
                            "position_size": entry_price * shares as f64,
                            "defcon": current_defcon,
                        }),
                    )
                    .await;
                info!(
                    trade_id,
                    ticker = %conditional.ticker,
                    shares,
                    "conditional entered"
                );
                true
            }
            Err(e) => {
                warn!(ticker = %conditional.ticker, error = %e, "conditional entry failed");
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Manual trading
    // -------------------------------------------------------------------------

    pub async fn manual_buy(
        &self,
        ticker: &str,
        shares: i64,
        price_override: Option<f64>,
    ) -> ManualTradeResult {
        let ticker = ticker.trim().to_uppercase();
        if shares <= 0 {
            return ManualTradeResult::err("Shares must be a positive integer.");
        }

        let entry_price = match price_override.filter(|p| *p > 0.0) {
            Some(price) => price,
            None => match self.market.latest_quote(&ticker).await {
                Ok(quote) => quote.price,
                Err(_) => {
                    return ManualTradeResult::err(format!("Could not fetch price for {ticker}."))
                }
            },
        };

        match self.store.open_trade(&TradeInsert {
            crisis_id: None,
            ticker: ticker.clone(),
            entry_price,
            shares,
            entry_signal_score: 0.0,
            defcon_at_entry: 5,
            notes: "Manual buy via command".to_string(),
        }) {
            Ok(trade_id) => ManualTradeResult {
                ok: true,
                message: format!(
                    "Bought {shares} shares of {ticker} @ ${entry_price:.2} = ${:.2} paper position (trade #{trade_id})",
                    entry_price * shares as f64
                ),
                trade_id: Some(trade_id),
            },
            Err(e) => ManualTradeResult::err(format!("Trade execution failed: {e}")),
        }
    }

    pub async fn manual_sell(
        &self,
        ticker: &str,
        trade_id: Option<i64>,
        price_override: Option<f64>,
    ) -> ManualTradeResult {
        let ticker = ticker.trim().to_uppercase();

        let trade = match trade_id {
            Some(id) => self.store.trade_by_id(id).ok().flatten().filter(|t| t.status == "open"),
            None => self.store.latest_open_trade_for(&ticker).ok().flatten(),
        };
        let Some(trade) = trade else {
            return ManualTradeResult::err(format!("No open position found for {ticker}."));
        };

        let exit_price = match price_override.filter(|p| *p > 0.0) {
            Some(price) => price,
            None => match self.market.latest_quote(&ticker).await {
                Ok(quote) => quote.price,
                Err(_) => {
                    return ManualTradeResult::err(format!(
                        "Could not fetch exit price for {ticker}."
                    ))
                }
            },
        };

        match self.store.close_trade(trade.trade_id, exit_price, ExitReason::Manual, "") {
            Ok(Some(pnl)) => {
                self.exit_manager.clear_peak(trade.trade_id);
                let pnl_pct = (exit_price - trade.entry_price) / trade.entry_price * 100.0;
                ManualTradeResult {
                    ok: true,
                    message: format!(
                        "Sold {} shares of {ticker} @ ${exit_price:.2} | P&L: ${pnl:+.2} ({pnl_pct:+.2}%)",
                        trade.shares
                    ),
                    trade_id: Some(trade.trade_id),
                }
            }
            Ok(None) => ManualTradeResult::err(format!("Trade #{} already closed.", trade.trade_id)),
            Err(e) => ManualTradeResult::err(format!("Sell execution failed: {e}")),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimiter;
    use exits::ExitRule;

    fn offline_broker() -> (PaperBroker, Arc<Store>) {
        let config = Config::default();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let limiter = Arc::new(RateLimiter::new());
        let market = Arc::new(MarketDataClient::new(String::new(), limiter));
        let llm = Arc::new(LlmGateway::new(&config, store.clone()));
        let alerts = Arc::new(AlertSystem::new(&config));
        (
            PaperBroker::new(&config, store.clone(), market, llm, alerts),
            store,
        )
    }

    #[tokio::test]
    async fn stop_loss_exit_queues_rebound_watchlist() {
        let (broker, store) = offline_broker();

        let trade_id = store
            .open_trade(&TradeInsert {
                crisis_id: None,
                ticker: "XYZ".into(),
                entry_price: 100.0,
                shares: 100,
                entry_signal_score: 60.0,
                defcon_at_entry: 2,
                notes: String::new(),
            })
            .unwrap();

        let signal = ExitSignal {
            trade_id,
            ticker: "XYZ".into(),
            rule: ExitRule::StopLoss,
            entry_price: 100.0,
            exit_price: 96.5,
            pnl_pct: -0.035,
            message: "STOP LOSS: XYZ -3.50%".into(),
            priority: 5,
        };
        let realized = broker.execute_exit(&signal).await.unwrap().unwrap();
        assert!((realized + 350.0).abs() < 1e-6);

        // The trade closed with the stop_loss reason.
        let trade = store.trade_by_id(trade_id).unwrap().unwrap();
        assert_eq!(trade.status, "closed");
        assert_eq!(trade.exit_reason.as_deref(), Some("stop_loss"));

        // A rebound watchlist row was queued, bound below the exit price.
        let pending = store.pending_watchlist(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].ticker, "XYZ");
        assert_eq!(pending[0].source, "stop_loss_rebound");
        assert!(pending[0].entry_conditions.contains("$96.50"));
    }

    #[tokio::test]
    async fn profit_target_exit_queues_reaccumulation() {
        let (broker, store) = offline_broker();
        let trade_id = store
            .open_trade(&TradeInsert {
                crisis_id: None,
                ticker: "ABC".into(),
                entry_price: 50.0,
                shares: 40,
                entry_signal_score: 55.0,
                defcon_at_entry: 3,
                notes: String::new(),
            })
            .unwrap();

        let signal = ExitSignal {
            trade_id,
            ticker: "ABC".into(),
            rule: ExitRule::ProfitTarget,
            entry_price: 50.0,
            exit_price: 53.0,
            pnl_pct: 0.06,
            message: "PROFIT TARGET: ABC +6.00%".into(),
            priority: 4,
        };
        broker.execute_exit(&signal).await.unwrap().unwrap();

        let pending = store.pending_watchlist(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].source, "profit_target_reaccumulation");
    }

    #[tokio::test]
    async fn trailing_stop_persists_as_manual_with_note() {
        let (broker, store) = offline_broker();
        let trade_id = store
            .open_trade(&TradeInsert {
                crisis_id: None,
                ticker: "TRL".into(),
                entry_price: 100.0,
                shares: 10,
                entry_signal_score: 50.0,
                defcon_at_entry: 4,
                notes: String::new(),
            })
            .unwrap();

        let signal = ExitSignal {
            trade_id,
            ticker: "TRL".into(),
            rule: ExitRule::TrailingStop,
            entry_price: 100.0,
            exit_price: 106.8,
            pnl_pct: 0.068,
            message: "TRAILING STOP: down 2.9% from peak $110.00".into(),
            priority: 3,
        };
        broker.execute_exit(&signal).await.unwrap().unwrap();

        let trade = store.trade_by_id(trade_id).unwrap().unwrap();
        assert_eq!(trade.exit_reason.as_deref(), Some("manual"));
        assert!(trade.notes.unwrap().contains("TRAILING STOP"));
        // No rebound queue for manual-mapped exits.
        assert!(store.pending_watchlist(10).unwrap().is_empty());
    }

    #[test]
    fn crisis_type_from_description() {
        assert_eq!(
            analyze_crisis_type("Tariff announcement causing supply chain concerns with china"),
            CrisisCategory::GeopoliticalTrade
        );
        assert_eq!(
            analyze_crisis_type("banking liquidity stress as credit spreads widen"),
            CrisisCategory::LiquidityCredit
        );
        assert_eq!(analyze_crisis_type("nothing in particular"), CrisisCategory::MarketCorrection);
    }

    #[test]
    fn entry_trigger_side_by_tag() {
        // Breakout buys strength.
        assert!(PaperBroker::entry_triggered(WatchTag::Breakout, 51.0, 50.0));
        assert!(!PaperBroker::entry_triggered(WatchTag::Breakout, 49.0, 50.0));

        // Mean reversion buys weakness.
        assert!(PaperBroker::entry_triggered(WatchTag::MeanReversion, 49.0, 50.0));
        assert!(!PaperBroker::entry_triggered(WatchTag::MeanReversion, 51.0, 50.0));

        // Exact touch triggers both sides.
        assert!(PaperBroker::entry_triggered(WatchTag::Breakout, 50.0, 50.0));
        assert!(PaperBroker::entry_triggered(WatchTag::Rebound, 50.0, 50.0));

        // A zero target never triggers.
        assert!(!PaperBroker::entry_triggered(WatchTag::Breakout, 50.0, 0.0));
    }

    #[test]
    fn trade_alert_allocations_split_50_30_20() {
        let alert = TradeAlert {
            timestamp: String::new(),
            defcon_level: 2,
            signal_score: 75.0,
            crisis_description: String::new(),
            crisis_type: CrisisCategory::InflationRate,
            primary_asset: "QQQ".into(),
            secondary_asset: "NVDA".into(),
            tertiary_asset: "MSFT".into(),
            total_position_size: 10_000.0,
            vix: 25.0,
            rationale: String::new(),
            confidence_score: 80.0,
        };
        let allocations = alert.allocations();
        assert_eq!(allocations[0], ("QQQ".to_string(), 5_000.0));
        assert_eq!(allocations[1], ("NVDA".to_string(), 3_000.0));
        assert_eq!(allocations[2], ("MSFT".to_string(), 2_000.0));
    }
}
