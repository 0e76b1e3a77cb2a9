// =============================================================================
// Orchestrator — the single control loop driving every stage
// =============================================================================
//
// Per iteration:
//   1. drain operator commands (honoring estop/stop)
//   2. monitoring cycle: market data -> news -> macro/political cadence gate
//      -> DEFCON -> persist snapshot
//   3. on escalation: trade alert (disabled mode) or broker decision
//   4. every cycle: broker exit evaluation + conditional entry checks
//   5. briefing window check -> daily briefing -> acquisition pipeline
//   6. cycle summary notification
//   7. sleep, subdivided into short ticks with command polling
//
// The cycle ALWAYS completes and ALWAYS writes a snapshot (marked degraded
// when market inputs were unavailable) so the timeline stays continuous.
// Stages never propagate errors into the loop — they degrade to typed empty
// results and log.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, Timelike};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tracing::{error, info, warn};

use crate::acquisition::{Analyst, Hound, Researcher, Verifier};
use crate::alerts::{AlertSystem, EventKind};
use crate::broker::exits::ExitSignal;
use crate::broker::{PaperBroker, TradeAlert};
use crate::commands::{Command, CommandBus, CommandRequest, CommandResponse};
use crate::config::Config;
use crate::congress::CongressionalTracker;
use crate::defcon::{calculate_signal_scores, compute_defcon, DefconInputs, NewsOverrideInput};
use crate::llm::LlmGateway;
use crate::macro_data::MacroCollector;
use crate::market::MarketDataClient;
use crate::news::analysis::{should_run_fast, NewsAnalyzer};
use crate::news::{NewsAggregator, NewsSentimentAnalyzer, NewsSignal, NewsSignalGenerator};
use crate::rate_limit::RateLimiter;
use crate::store::Store;
use crate::types::{defcon_label, BrokerMode};

/// Command polling tick inside the inter-cycle sleep.
const SLEEP_TICK: Duration = Duration::from_secs(2);

/// Spacing between researcher and analyst so reasoning calls don't stack.
const PIPELINE_SPACING: Duration = Duration::from_secs(10);

/// A breaking signal in the store stays authoritative this long.
const BREAKING_SIGNAL_WINDOW_HOURS: i64 = 4;

/// Scheduler-owned mutable state. Only the scheduler task touches it;
/// commands mutate it through the dispatch step which runs on the same task.
#[derive(Default)]
struct SchedulerState {
    previous_defcon: u8,
    cycle_count: u64,
    alerts_sent: u64,
    trading_hold: bool,
    stop_requested: bool,
    estop_triggered: bool,
    force_cycle: bool,
    pending_trade_alerts: Vec<TradeAlert>,
    pending_exits: Vec<ExitSignal>,
    new_interval_minutes: Option<u64>,
    briefing_date: Option<String>,
    collector_countdown: u64,
    defcon_changed_last_cycle: bool,
}

pub struct Orchestrator {
    pub config: RwLock<Config>,
    store: Arc<Store>,
    market: Arc<MarketDataClient>,
    alerts: Arc<AlertSystem>,
    broker: PaperBroker,
    news_aggregator: NewsAggregator,
    sentiment: NewsSentimentAnalyzer,
    signal_generator: NewsSignalGenerator,
    news_analyzer: NewsAnalyzer,
    macro_collector: MacroCollector,
    congress: CongressionalTracker,
    researcher: Researcher,
    analyst: Analyst,
    verifier: Verifier,
    hound: Hound,
    briefing: crate::briefing::DailyBriefing,
    bus: CommandBus,
    state: Mutex<SchedulerState>,
}

impl Orchestrator {
    /// Wire every subsystem. The only fatal paths are the store and the
    /// command directory; everything else degrades at runtime.
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(Store::open(&config.db_path).context("persistent store open failed")?);
        let limiter = Arc::new(RateLimiter::new());
        let market = Arc::new(MarketDataClient::new(config.fred_api_key.clone(), limiter.clone()));
        let llm = Arc::new(LlmGateway::new(&config, store.clone()));
        let alerts = Arc::new(AlertSystem::new(&config));

        let broker = PaperBroker::new(&config, store.clone(), market.clone(), llm.clone(), alerts.clone());
        let news_aggregator = NewsAggregator::new(&config, limiter.clone());
        let news_analyzer = NewsAnalyzer::new(llm.clone(), store.clone(), config.pro_trigger_score);
        let macro_collector = MacroCollector::new(market.clone(), store.clone());
        let congress = CongressionalTracker::new(
            store.clone(),
            limiter.clone(),
            config.min_congressional_amount,
        );
        let researcher = Researcher::new(
            store.clone(),
            market.clone(),
            config.max_watchlist_per_run,
            config.stale_days,
        );
        let analyst = Analyst::new(
            store.clone(),
            llm.clone(),
            config.confidence_threshold,
            config.max_position_pct,
            config.max_analyst_per_run,
        );
        let verifier = Verifier::new(store.clone(), market.clone(), llm.clone());
        let hound = Hound::new(store.clone());
        let briefing =
            crate::briefing::DailyBriefing::new(store.clone(), llm.clone(), alerts.clone());
        let bus = CommandBus::new(&config.command_dir).context("command bus setup failed")?;

        let previous_defcon = store
            .latest_snapshot()
            .ok()
            .flatten()
            .map(|s| s.defcon_level)
            .unwrap_or(5);

        Ok(Self {
            config: RwLock::new(config),
            store,
            market,
            alerts,
            broker,
            news_aggregator,
            sentiment: NewsSentimentAnalyzer::default(),
            signal_generator: NewsSignalGenerator::default(),
            news_analyzer,
            macro_collector,
            congress,
            researcher,
            analyst,
            verifier,
            hound,
            briefing,
            bus,
            state: Mutex::new(SchedulerState {
                previous_defcon,
                ..SchedulerState::default()
            }),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // =========================================================================
    // Continuous loop
    // =========================================================================

    pub async fn run_continuous(&self) -> Result<()> {
        let interval = self.config.read().monitoring_interval_minutes;
        info!(interval_minutes = interval, "starting continuous monitoring");

        let mut interval_minutes = interval;
        loop {
            self.drain_commands().await;
            if self.should_stop() {
                break;
            }

            self.run_monitoring_cycle().await;

            // Pick up a pending interval change at the sleep boundary.
            if let Some(new_interval) = self.state.lock().new_interval_minutes.take() {
                interval_minutes = new_interval;
                info!(interval_minutes, "monitoring interval changed");
            }

            info!(minutes = interval_minutes, "sleeping until next cycle");
            let slept = self.sleep_with_polling(Duration::from_secs(interval_minutes * 60)).await;
            if !slept {
                // A stop arrived mid-sleep.
                break;
            }
        }

        info!("orchestrator stopped");
        self.alerts
            .publish(
                EventKind::CycleSummary,
                &json!({ "cycle": "shutdown", "defcon_level": self.state.lock().previous_defcon }),
            )
            .await;
        Ok(())
    }

    /// Sleep in short ticks, polling commands at each boundary. Returns
    /// false when a stop was requested, true when the sleep ran its course
    /// (or `update` broke it to force an immediate cycle).
    async fn sleep_with_polling(&self, total: Duration) -> bool {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            tokio::time::sleep(SLEEP_TICK).await;
            elapsed += SLEEP_TICK;

            self.drain_commands().await;
            if self.should_stop() {
                return false;
            }
            if self.state.lock().force_cycle {
                self.state.lock().force_cycle = false;
                info!("update command — breaking sleep for immediate cycle");
                return true;
            }
        }
        true
    }

    fn should_stop(&self) -> bool {
        let state = self.state.lock();
        state.stop_requested || state.estop_triggered
    }

    // =========================================================================
    // Monitoring cycle
    // =========================================================================

    pub async fn run_monitoring_cycle(&self) {
        let cycle = {
            let mut state = self.state.lock();
            state.cycle_count += 1;
            state.cycle_count
        };
        info!(cycle, "monitoring cycle starting");

        // --- 1. Market data (each input degrades independently) -------------
        let bond_yield = match self.market.bond_yield().await {
            Ok(result) => Some(result.yield_pct),
            Err(e) => {
                warn!(error = %e, "bond yield unavailable");
                None
            }
        };
        let index = match self.market.index_snapshot().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "index snapshot unavailable");
                None
            }
        };
        let vix = index.as_ref().map(|i| i.vix);
        let market_change = index.as_ref().map(|i| i.sp500_change_pct);
        let degraded = bond_yield.is_none() || index.is_none();

        // --- 2. News pipeline ------------------------------------------------
        let previous_defcon = self.state.lock().previous_defcon;
        let (news_signal, _news_signal_id, reasoning) =
            self.run_news_stage(previous_defcon).await;

        // --- 3. Macro / political collectors on their own cadence ------------
        let run_collectors = {
            let mut state = self.state.lock();
            if state.collector_countdown == 0 {
                state.collector_countdown = self.config.read().collector_cadence_cycles.max(1) - 1;
                true
            } else {
                state.collector_countdown -= 1;
                false
            }
        };
        if run_collectors {
            self.run_collectors().await;
        }
        let macro_row = self.store.latest_macro_row().ok().flatten();

        // --- 4. DEFCON fusion ------------------------------------------------
        let scores = calculate_signal_scores(bond_yield, vix, market_change);
        let composite = scores.composite();
        let flash_forecast = self
            .store
            .latest_briefing()
            .ok()
            .flatten()
            .and_then(|b| b.flash_forecast_level());

        let inputs = DefconInputs {
            composite_score: composite,
            market_drop_pct: market_change.unwrap_or(0.0),
            news: NewsOverrideInput {
                breaking_news_override: news_signal.breaking_news_override,
                recommended_defcon: news_signal.recommended_defcon,
            },
            reasoning,
            macro_modifier: macro_row.as_ref().map(|m| m.defcon_modifier),
            flash_forecast,
        };
        let current_defcon = compute_defcon(&inputs);

        info!(
            defcon = current_defcon,
            label = defcon_label(current_defcon),
            composite = format!("{composite:.1}"),
            news_score = format!("{:.1}", news_signal.news_score),
            degraded,
            "cycle evaluated"
        );

        // --- 5. Persist the snapshot (always — the timeline stays continuous)
        if let Err(e) = self.store.record_snapshot(
            bond_yield,
            vix,
            market_change,
            current_defcon,
            composite,
            news_signal.news_score,
            degraded,
        ) {
            error!(error = %e, "snapshot write failed");
        }

        // --- 6. DEFCON change handling --------------------------------------
        let old_defcon = {
            let mut state = self.state.lock();
            let old = state.previous_defcon;
            state.previous_defcon = current_defcon;
            state.defcon_changed_last_cycle = current_defcon != old;
            old
        };
        if current_defcon != old_defcon {
            self.handle_defcon_change(old_defcon, current_defcon, composite, vix).await;
        }

        // --- 7. Exits + conditional entries, every cycle ---------------------
        self.run_broker_stage(current_defcon).await;

        // --- 8. Cycle summary ------------------------------------------------
        self.publish_cycle_summary(cycle, current_defcon, composite, bond_yield, vix).await;

        // --- 9. Briefing window ----------------------------------------------
        self.check_daily_briefing(false).await;
    }

    /// News stage: aggregate, score, persist, and run the gated LLM layers.
    /// Returns the signal used for override decisions, the persisted row id,
    /// and any reasoning adjustment for that signal.
    async fn run_news_stage(
        &self,
        previous_defcon: u8,
    ) -> (
        NewsSignal,
        Option<i64>,
        Option<crate::store::signals::ReasoningAdjustment>,
    ) {
        // A recent breaking signal in the store stays in force even when the
        // fresh batch is quiet.
        let db_breaking = self
            .store
            .active_breaking_signal(BREAKING_SIGNAL_WINDOW_HOURS)
            .ok()
            .flatten();

        let articles = self.news_aggregator.fetch_latest(1).await;
        let fresh = self.signal_generator.generate(&articles, &self.sentiment);

        // New-article detection against the previous row's URL set.
        let new_count = match self.store.latest_news_urls().ok().flatten() {
            Some((prior_at, prior_urls)) => {
                let age_minutes = (chrono::Utc::now() - prior_at).num_minutes();
                if age_minutes > 60 {
                    fresh.article_count
                } else {
                    fresh
                        .contributing_articles
                        .iter()
                        .filter(|a| !prior_urls.contains(&a.url))
                        .count()
                }
            }
            None => fresh.article_count,
        };

        // The row is always written, empty batches included.
        let signal_id = match self.store.insert_news_signal(&fresh) {
            Ok(id) => Some(id),
            Err(e) => {
                error!(error = %e, "news signal write failed");
                None
            }
        };

        // LLM gating: zero new content means zero model calls.
        let defcon_changed = self.state.lock().defcon_changed_last_cycle;
        let mut reasoning = None;
        if should_run_fast(new_count, fresh.breaking_news_override, defcon_changed) {
            if let Some(id) = signal_id {
                let fast = self.news_analyzer.run_fast_analysis(&fresh, id).await;
                if self.news_analyzer.should_run_reasoning(
                    fresh.news_score,
                    fresh.breaking_count,
                    defcon_changed,
                ) {
                    let open_positions =
                        self.store.open_trades().map(|t| t.len()).unwrap_or(0);
                    reasoning = self
                        .news_analyzer
                        .run_reasoning_analysis(
                            &fresh,
                            id,
                            previous_defcon,
                            open_positions,
                            fast.as_ref(),
                        )
                        .await;
                }
            }
        } else {
            info!(new_count, "no new articles — skipping LLM analysis");
        }

        // Notify on batches with content.
        if fresh.article_count > 0 {
            self.alerts
                .publish(
                    EventKind::NewsUpdate,
                    &json!({
                        "news_score": fresh.news_score,
                        "crisis_type": fresh.dominant_crisis_type,
                        "sentiment": fresh.sentiment_summary,
                        "article_count": fresh.article_count,
                        "new_article_count": new_count,
                        "breaking_count": fresh.breaking_count,
                        "top_articles": fresh.contributing_articles.iter().take(3)
                            .map(|a| json!({ "title": a.title }))
                            .collect::<Vec<_>>(),
                    }),
                )
                .await;
        }

        // Choose the signal the DEFCON engine sees: a fresh override wins;
        // otherwise a still-active breaking signal from the store.
        if fresh.breaking_news_override {
            (fresh, signal_id, reasoning)
        } else if let Some(stored) = db_breaking {
            info!(
                id = stored.news_signal_id,
                description = %stored.crisis_description,
                "using active breaking signal from store"
            );
            let stored_reasoning = self
                .store
                .reasoning_adjustment_for(stored.news_signal_id)
                .ok()
                .flatten();
            let mut carried = fresh;
            carried.breaking_news_override = true;
            carried.recommended_defcon = stored.recommended_defcon;
            (carried, signal_id, stored_reasoning.or(reasoning))
        } else {
            (fresh, signal_id, reasoning)
        }
    }

    /// Macro and congressional collectors run concurrently.
    async fn run_collectors(&self) {
        let (macro_result, congress_result) = tokio::join!(
            self.macro_collector.run_full_analysis(),
            self.congress.run_full_scan(30)
        );

        if let Ok(analysis) = macro_result {
            if analysis.bearish_count() >= 2 || analysis.macro_score < 35.0 {
                self.alerts
                    .publish(
                        EventKind::MacroUpdate,
                        &json!({
                            "macro_score": analysis.macro_score,
                            "defcon_modifier": analysis.defcon_modifier,
                            "bearish_count": analysis.bearish_count(),
                            "bullish_count": analysis.bullish_count(),
                        }),
                    )
                    .await;
            }
        }

        if let Some(top) = congress_result.clusters.first() {
            if top.signal_strength >= 50.0 {
                self.alerts
                    .publish(
                        EventKind::CongressionalCluster,
                        &json!({
                            "ticker": top.ticker,
                            "buy_count": top.buy_count,
                            "politicians": top.politicians,
                            "bipartisan": top.bipartisan,
                            "signal_strength": top.signal_strength,
                        }),
                    )
                    .await;
            }
        }
    }

    async fn handle_defcon_change(&self, old: u8, new: u8, signal_score: f64, vix: Option<f64>) {
        if new < old {
            warn!(old, new, "DEFCON ESCALATION");
        } else {
            info!(old, new, "DEFCON de-escalation");
        }

        self.alerts
            .publish(
                EventKind::DefconChange,
                &json!({ "old_defcon": old, "new_defcon": new, "signal_score": signal_score }),
            )
            .await;
        self.state.lock().alerts_sent += 1;

        // Trades only on escalation into the execution band.
        let escalated = new < old && new <= 2;
        if !escalated {
            return;
        }
        let (hold, mode) = {
            let state = self.state.lock();
            (
                state.trading_hold || state.estop_triggered,
                self.config.read().broker_mode,
            )
        };
        if hold {
            warn!("trading on HOLD — escalation noted, no trade action");
            return;
        }

        let description = format!("DEFCON {new} escalation - signal score {signal_score:.1}");
        match mode {
            BrokerMode::Disabled => {
                let alert = self.broker.generate_trade_alert(
                    new,
                    signal_score,
                    &description,
                    vix.unwrap_or(20.0),
                );
                info!(
                    primary = %alert.primary_asset,
                    secondary = %alert.secondary_asset,
                    tertiary = %alert.tertiary_asset,
                    size = alert.total_position_size,
                    "trade alert queued — approve with `yes`, reject with `no`"
                );
                self.state.lock().pending_trade_alerts.push(alert);
            }
            BrokerMode::SemiAuto | BrokerMode::FullAuto => {
                let executed = self
                    .broker
                    .process_market_conditions(new, signal_score, &description, vix.unwrap_or(20.0))
                    .await;
                info!(trades = executed.len(), "broker decision complete");
            }
        }
    }

    /// Exit evaluation plus conditional entry checks, respecting hold/mode.
    async fn run_broker_stage(&self, current_defcon: u8) {
        let (hold, mode) = {
            let state = self.state.lock();
            (
                state.trading_hold || state.estop_triggered,
                self.config.read().broker_mode,
            )
        };
        if hold {
            return;
        }

        match mode {
            BrokerMode::Disabled => {
                // Queue exit signals for operator approval.
                let signals = self.broker.evaluate_exits(current_defcon).await;
                if !signals.is_empty() {
                    info!(count = signals.len(), "exit signals pending approval (`yes` / `no`)");
                    let mut state = self.state.lock();
                    for signal in signals {
                        if !state.pending_exits.iter().any(|p| p.trade_id == signal.trade_id) {
                            state.pending_exits.push(signal);
                        }
                    }
                }
            }
            BrokerMode::SemiAuto | BrokerMode::FullAuto => {
                let closed = self.broker.process_exits(current_defcon).await;
                if closed > 0 {
                    info!(closed, "positions exited");
                }
                let entered = self.broker.check_conditionals(current_defcon).await;
                if entered > 0 {
                    info!(entered, "acquisition conditionals entered");
                }
            }
        }
    }

    async fn publish_cycle_summary(
        &self,
        cycle: u64,
        defcon: u8,
        composite: f64,
        bond_yield: Option<f64>,
        vix: Option<f64>,
    ) {
        let performance = self.store.portfolio_performance().unwrap_or_default();
        let total_capital = self.config.read().total_capital;
        self.alerts
            .publish(
                EventKind::CycleSummary,
                &json!({
                    "cycle": cycle,
                    "defcon_level": defcon,
                    "signal_score": composite,
                    "bond_yield": bond_yield,
                    "vix": vix,
                    "open_trades": performance.open_trades,
                    "account_value": total_capital + performance.total_realized_pnl,
                    "total_pnl": performance.total_realized_pnl,
                }),
            )
            .await;
    }

    // =========================================================================
    // Daily briefing + acquisition pipeline
    // =========================================================================

    /// Fire the briefing once per calendar date after the close window, then
    /// run researcher -> analyst -> verifier.
    pub async fn check_daily_briefing(&self, force: bool) {
        let now = Local::now();
        let today = now.format("%Y-%m-%d").to_string();
        let (hour, minute) = {
            let config = self.config.read();
            (config.briefing_hour, config.briefing_minute)
        };
        let after_close =
            now.hour() > hour || (now.hour() == hour && now.minute() >= minute);
        let already_ran = self.state.lock().briefing_date.as_deref() == Some(today.as_str());

        if !force && (!after_close || already_ran) {
            return;
        }
        self.state.lock().briefing_date = Some(today.clone());

        info!("briefing window crossed — running daily briefing");
        if self.briefing.run().await.is_none() {
            warn!("daily briefing produced no result");
        }

        self.run_acquisition_pipeline().await;
    }

    /// Researcher, a pause, analyst, then the verifier over what remains.
    pub async fn run_acquisition_pipeline(&self) {
        info!("acquisition pipeline: researcher -> analyst -> verifier");

        let researched = self.researcher.run_research_cycle().await;
        if !researched.is_empty() {
            tokio::time::sleep(PIPELINE_SPACING).await;
            let outcomes = self.analyst.run_analyst_cycle().await;
            let promoted = outcomes.iter().filter(|o| o.promoted).count();
            info!(analyzed = outcomes.len(), promoted, "analyst stage complete");
        }

        let summary = self.verifier.run_verification_cycle().await;
        info!(
            confirmed = summary.confirmed,
            flagged = summary.flagged,
            invalidated = summary.invalidated,
            "verifier stage complete"
        );
    }

    // =========================================================================
    // Command dispatch
    // =========================================================================

    async fn drain_commands(&self) {
        while let Some(request) = self.bus.poll() {
            let response = self.handle_command(&request).await;
            self.bus.respond(&response);
        }
    }

    pub async fn handle_command(&self, request: &CommandRequest) -> CommandResponse {
        let Some(command) = request.parsed() else {
            return CommandResponse::error(format!("Unknown command: {}", request.command));
        };
        let args = request.args.trim().to_string();

        match command {
            Command::Yes => self.handle_yes().await,
            Command::No => self.handle_no(),
            Command::Hold => {
                self.state.lock().trading_hold = true;
                warn!("TRADING HOLD — monitoring continues, no trades will execute");
                CommandResponse::ok("Trading HOLD activated. Monitoring continues, trades paused.")
            }
            Command::Start => {
                self.state.lock().trading_hold = false;
                info!("trading resumed");
                CommandResponse::ok("Trading RESUMED. Fully operational.")
            }
            Command::Stop => {
                self.state.lock().stop_requested = true;
                warn!("graceful stop requested");
                CommandResponse::ok("Graceful stop requested. Shutting down after current cycle.")
            }
            Command::Estop => {
                {
                    let mut state = self.state.lock();
                    state.estop_triggered = true;
                    state.trading_hold = true;
                    state.stop_requested = true;
                    state.pending_trade_alerts.clear();
                    state.pending_exits.clear();
                }
                error!("EMERGENCY STOP — all activity halted, pending actions cleared");
                CommandResponse::ok(
                    "EMERGENCY STOP — all activity halted. Pending actions cleared. Shutting down.",
                )
            }
            Command::Update => {
                self.state.lock().force_cycle = true;
                CommandResponse::ok("Immediate cycle requested.")
            }
            Command::Status => self.handle_status(),
            Command::Portfolio => self.handle_portfolio(),
            Command::Defcon => self.handle_defcon_info(),
            Command::Trades => self.handle_trades(),
            Command::Broker => self.handle_broker_info(),
            Command::Help => CommandResponse::ok_with("Available commands", json!(Command::help_text())),
            Command::Mode => self.handle_mode(&args),
            Command::Interval => self.handle_interval(&args),
            Command::Buy => self.handle_buy(&args).await,
            Command::Sell => self.handle_sell(&args).await,
            Command::Briefing => {
                self.check_daily_briefing(true).await;
                CommandResponse::ok("Daily briefing completed.")
            }
            Command::Research => {
                let researched = self.researcher.run_research_cycle().await;
                CommandResponse::ok(if researched.is_empty() {
                    "Research cycle complete: nothing pending.".to_string()
                } else {
                    format!("Research cycle complete for: {}", researched.join(", "))
                })
            }
            Command::Hunt => {
                let (defcon, macro_score) = {
                    let defcon = self.state.lock().previous_defcon;
                    let score = self
                        .store
                        .latest_macro_row()
                        .ok()
                        .flatten()
                        .map(|m| m.macro_score)
                        .unwrap_or(50.0);
                    (defcon, score)
                };
                let result = self.hound.hunt(defcon, macro_score).await;
                CommandResponse::ok(format!(
                    "Hound ({}): found {} candidates{}{}",
                    result.mood,
                    result.candidates.len(),
                    if result.candidates.is_empty() {
                        String::new()
                    } else {
                        format!(" -> {}", result.candidates.join(", "))
                    },
                    if result.queued.is_empty() {
                        String::new()
                    } else {
                        format!(" | queued: {}", result.queued.join(", "))
                    },
                ))
            }
        }
    }

    async fn handle_yes(&self) -> CommandResponse {
        let (alerts, exits) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.pending_trade_alerts),
                std::mem::take(&mut state.pending_exits),
            )
        };
        if alerts.is_empty() && exits.is_empty() {
            return CommandResponse::ok("No pending actions to approve.");
        }

        let mut entered = 0;
        for alert in &alerts {
            entered += self.broker.execute_trade_package(alert).await.len();
        }
        let mut exited = 0;
        for signal in &exits {
            if matches!(self.broker.execute_exit(signal).await, Ok(Some(_))) {
                exited += 1;
            }
        }

        info!(entered, exited, "pending actions approved");
        CommandResponse::ok(format!(
            "Approved: {entered} trade(s) executed, {exited} position(s) exited."
        ))
    }

    fn handle_no(&self) -> CommandResponse {
        let mut state = self.state.lock();
        let alerts = state.pending_trade_alerts.len();
        let exits = state.pending_exits.len();
        state.pending_trade_alerts.clear();
        state.pending_exits.clear();
        info!(alerts, exits, "pending actions rejected");
        CommandResponse::ok(format!(
            "Rejected {alerts} pending trade(s) and {exits} pending exit(s)."
        ))
    }

    fn handle_status(&self) -> CommandResponse {
        let snapshot = self.store.latest_snapshot().ok().flatten();
        let state = self.state.lock();
        let config = self.config.read();

        let data = json!({
            "defcon": snapshot.as_ref().map(|s| s.defcon_level).unwrap_or(5),
            "signal_score": snapshot.as_ref().map(|s| s.composite_score).unwrap_or(0.0),
            "bond_yield": snapshot.as_ref().and_then(|s| s.bond_yield),
            "vix": snapshot.as_ref().and_then(|s| s.vix),
            "broker_mode": config.broker_mode.as_str(),
            "trading_hold": state.trading_hold,
            "cycles_run": state.cycle_count,
            "alerts_sent": state.alerts_sent,
            "pending_trades": state.pending_trade_alerts.len(),
            "pending_exits": state.pending_exits.len(),
        });
        CommandResponse::ok_with("System status", data)
    }

    fn handle_portfolio(&self) -> CommandResponse {
        let performance = self.store.portfolio_performance().unwrap_or_default();
        let open = self.store.open_trades().unwrap_or_default();
        let positions: Vec<String> = open
            .iter()
            .map(|t| {
                format!(
                    "{}: {} shares @ ${:.2} (${:.0})",
                    t.ticker, t.shares, t.entry_price, t.cost_basis
                )
            })
            .collect();

        let data = json!({
            "total_trades": performance.total_trades,
            "open": performance.open_trades,
            "closed": performance.closed_trades,
            "win_rate_pct": performance.win_rate_pct,
            "realized_pnl": performance.total_realized_pnl,
            "profit_factor": performance.profit_factor,
            "positions": positions,
        });
        CommandResponse::ok_with("Portfolio summary", data)
    }

    fn handle_defcon_info(&self) -> CommandResponse {
        let Some(snapshot) = self.store.latest_snapshot().ok().flatten() else {
            return CommandResponse::ok("No monitoring data yet.");
        };
        let data = json!({
            "defcon": format!("{}/5 — {}", snapshot.defcon_level, defcon_label(snapshot.defcon_level)),
            "signal_score": snapshot.composite_score,
            "news_score": snapshot.news_score,
            "bond_yield": snapshot.bond_yield,
            "vix": snapshot.vix,
            "timestamp": snapshot.timestamp,
            "degraded": snapshot.degraded,
        });
        CommandResponse::ok_with("DEFCON status", data)
    }

    fn handle_trades(&self) -> CommandResponse {
        let state = self.state.lock();
        let mut lines: Vec<String> = Vec::new();
        for (i, alert) in state.pending_trade_alerts.iter().enumerate() {
            lines.push(format!(
                "Pending #{}: {} / {} / {} — ${:.0}",
                i + 1,
                alert.primary_asset,
                alert.secondary_asset,
                alert.tertiary_asset,
                alert.total_position_size,
            ));
        }
        for exit in &state.pending_exits {
            lines.push(format!(
                "Exit: {} — {} ({:+.2}%)",
                exit.ticker,
                exit.message,
                exit.pnl_pct * 100.0
            ));
        }
        if lines.is_empty() {
            lines.push("No pending trade alerts".to_string());
        }
        CommandResponse::ok_with("Trade queue", json!(lines))
    }

    fn handle_broker_info(&self) -> CommandResponse {
        let config = self.config.read();
        let data = json!({
            "mode": config.broker_mode.as_str(),
            "auto_execute": config.broker_mode.auto_execute(),
            "available_cash": self.broker.available_cash(),
            "tracked_peaks": self.broker.exit_manager.tracked_positions(),
            "max_position_pct": config.max_position_pct,
        });
        CommandResponse::ok_with("Broker status", data)
    }

    fn handle_mode(&self, args: &str) -> CommandResponse {
        let Some(mode) = BrokerMode::parse(args) else {
            return CommandResponse::error(
                "Invalid mode. Choose from: disabled, semi_auto, full_auto",
            );
        };
        let old = {
            let mut config = self.config.write();
            let old = config.broker_mode;
            config.broker_mode = mode;
            old
        };
        info!(old = %old, new = %mode, "broker mode changed");
        CommandResponse::ok(format!("Broker mode: {old} -> {mode}"))
    }

    fn handle_interval(&self, args: &str) -> CommandResponse {
        match args.parse::<u64>() {
            Ok(minutes) if (1..=120).contains(&minutes) => {
                self.state.lock().new_interval_minutes = Some(minutes);
                CommandResponse::ok(format!(
                    "Interval will change to {minutes} minutes at the next sleep boundary."
                ))
            }
            Ok(_) => CommandResponse::error("Interval must be 1-120 minutes."),
            Err(_) => CommandResponse::error("Usage: interval <minutes>  (e.g. interval 5)"),
        }
    }

    async fn handle_buy(&self, args: &str) -> CommandResponse {
        // buy TICKER SHARES [@PRICE]
        let cleaned = args.to_uppercase().replace('@', " ");
        let parts: Vec<&str> = cleaned.split_whitespace().collect();
        if parts.len() < 2 {
            return CommandResponse::error("Usage: buy TICKER SHARES [@PRICE]");
        }
        let ticker = parts[0];
        let Ok(shares) = parts[1].parse::<i64>() else {
            return CommandResponse::error(format!("Invalid share count: {}", parts[1]));
        };
        let price = parts.get(2).and_then(|p| p.parse::<f64>().ok());

        let result = self.broker.manual_buy(ticker, shares, price).await;
        if result.ok {
            CommandResponse::ok(result.message)
        } else {
            CommandResponse::error(result.message)
        }
    }

    async fn handle_sell(&self, args: &str) -> CommandResponse {
        // sell TICKER [TRADE_ID] [@PRICE]
        let cleaned = args.to_uppercase().replace('@', " ");
        let parts: Vec<&str> = cleaned.split_whitespace().collect();
        if parts.is_empty() {
            return CommandResponse::error("Usage: sell TICKER [TRADE_ID] [@PRICE]");
        }
        let ticker = parts[0];
        let trade_id = parts.get(1).and_then(|p| p.parse::<i64>().ok());
        let price = parts
            .get(if trade_id.is_some() { 2 } else { 1 })
            .and_then(|p| p.parse::<f64>().ok());

        let result = self.broker.manual_sell(ticker, trade_id, price).await;
        if result.ok {
            CommandResponse::ok(result.message)
        } else {
            CommandResponse::error(result.message)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_orchestrator() -> Orchestrator {
        let dir = std::env::temp_dir().join(format!("sentinel-orch-{}", uuid::Uuid::new_v4()));
        let mut config = Config::default();
        config.db_path = dir.join("test.db").to_string_lossy().into_owned();
        config.command_dir = dir.join("commands").to_string_lossy().into_owned();
        Orchestrator::new(config).unwrap()
    }

    #[tokio::test]
    async fn hold_is_idempotent() {
        let orchestrator = test_orchestrator();

        let request = CommandRequest::new(Command::Hold, "");
        let first = orchestrator.handle_command(&request).await;
        assert!(first.ok);
        assert!(orchestrator.state.lock().trading_hold);

        // Replaying hold leaves the system held exactly once, still ok.
        let second = orchestrator.handle_command(&request).await;
        assert!(second.ok);
        assert!(orchestrator.state.lock().trading_hold);

        let start = orchestrator.handle_command(&CommandRequest::new(Command::Start, "")).await;
        assert!(start.ok);
        assert!(!orchestrator.state.lock().trading_hold);
    }

    #[tokio::test]
    async fn estop_clears_pending_and_sets_flags() {
        let orchestrator = test_orchestrator();
        orchestrator.state.lock().pending_trade_alerts.push(
            orchestrator.broker.generate_trade_alert(2, 70.0, "test crisis", 25.0),
        );

        let response = orchestrator
            .handle_command(&CommandRequest::new(Command::Estop, ""))
            .await;
        assert!(response.ok);

        let state = orchestrator.state.lock();
        assert!(state.estop_triggered);
        assert!(state.stop_requested);
        assert!(state.trading_hold);
        assert!(state.pending_trade_alerts.is_empty());
    }

    #[tokio::test]
    async fn mode_command_validates_and_applies() {
        let orchestrator = test_orchestrator();

        let bad = orchestrator
            .handle_command(&CommandRequest::new(Command::Mode, "turbo"))
            .await;
        assert!(!bad.ok);

        let good = orchestrator
            .handle_command(&CommandRequest::new(Command::Mode, "disabled"))
            .await;
        assert!(good.ok);
        assert_eq!(orchestrator.config.read().broker_mode, BrokerMode::Disabled);
    }

    #[tokio::test]
    async fn interval_command_defers_to_sleep_boundary() {
        let orchestrator = test_orchestrator();

        let response = orchestrator
            .handle_command(&CommandRequest::new(Command::Interval, "5"))
            .await;
        assert!(response.ok);
        assert_eq!(orchestrator.state.lock().new_interval_minutes, Some(5));

        let invalid = orchestrator
            .handle_command(&CommandRequest::new(Command::Interval, "500"))
            .await;
        assert!(!invalid.ok);
    }

    #[tokio::test]
    async fn yes_with_nothing_pending_is_a_no_op() {
        let orchestrator = test_orchestrator();
        let response = orchestrator.handle_command(&CommandRequest::new(Command::Yes, "")).await;
        assert!(response.ok);
        assert!(response.message.contains("No pending actions"));
    }

    #[tokio::test]
    async fn buy_command_validates_arguments() {
        let orchestrator = test_orchestrator();

        let missing = orchestrator.handle_command(&CommandRequest::new(Command::Buy, "")).await;
        assert!(!missing.ok);

        let bad_shares = orchestrator
            .handle_command(&CommandRequest::new(Command::Buy, "AAPL abc"))
            .await;
        assert!(!bad_shares.ok);

        // Valid args with a price override skip the live fetch entirely.
        let good = orchestrator
            .handle_command(&CommandRequest::new(Command::Buy, "AAPL 10 @ 190.50"))
            .await;
        assert!(good.ok, "{}", good.message);
        assert!(good.message.contains("AAPL"));

        let sold = orchestrator
            .handle_command(&CommandRequest::new(Command::Sell, "AAPL @ 195.00"))
            .await;
        assert!(sold.ok, "{}", sold.message);
        assert!(sold.message.contains("+"));
    }

    #[tokio::test]
    async fn status_reports_scheduler_state() {
        let orchestrator = test_orchestrator();
        let response = orchestrator
            .handle_command(&CommandRequest::new(Command::Status, ""))
            .await;
        assert!(response.ok);
        let data = response.data.unwrap();
        assert_eq!(data["broker_mode"], "semi_auto");
        assert_eq!(data["trading_hold"], false);
    }
}
