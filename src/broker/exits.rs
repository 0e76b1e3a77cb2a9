// =============================================================================
// Exit Engine — priority-ordered exit evaluation for open paper positions
// =============================================================================
//
// Six rules, highest priority fires first; at most one exit signal per
// position per cycle:
//
//   5  stop loss          — ALWAYS live, even inside the minimum hold window
//   4  profit target      — gated by minimum hold
//   3  trailing stop      — gated by minimum hold; only armed once peak > entry
//   3  time-and-loss      — >= 80% of max hold and still red
//   2  regime reversion   — crisis-entry trades close when the crisis lifts
//   2  time limit         — max hold reached, P&L irrelevant
//
// Evaluation is pure given (trade, current_price, current_defcon, peak):
// identical inputs always produce the identical signal. Peaks live in
// memory per trade id and are cleared on close.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::store::trades::{ExitReason, TradeRecord};

/// Internal rule set — broader than the persisted exit-reason enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitRule {
    StopLoss,
    ProfitTarget,
    TrailingStop,
    TimeAndLoss,
    RegimeReversion,
    TimeLimit,
}

impl ExitRule {
    pub fn priority(&self) -> u8 {
        match self {
            Self::StopLoss => 5,
            Self::ProfitTarget => 4,
            Self::TrailingStop | Self::TimeAndLoss => 3,
            Self::RegimeReversion | Self::TimeLimit => 2,
        }
    }

    /// Persistence normalizes to the narrow reason set; everything that is
    /// not a plain target/stop lands as `manual` with a descriptive note.
    pub fn persisted_reason(&self) -> ExitReason {
        match self {
            Self::StopLoss => ExitReason::StopLoss,
            Self::ProfitTarget => ExitReason::ProfitTarget,
            Self::TrailingStop | Self::TimeAndLoss | Self::RegimeReversion | Self::TimeLimit => {
                ExitReason::Manual
            }
        }
    }
}

/// An exit recommendation for one open position.
#[derive(Debug, Clone, Serialize)]
pub struct ExitSignal {
    pub trade_id: i64,
    pub ticker: String,
    pub rule: ExitRule,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl_pct: f64,
    pub message: String,
    pub priority: u8,
}

/// Tunable thresholds, sourced from config at construction.
#[derive(Debug, Clone, Copy)]
pub struct ExitParams {
    /// Negative fraction, e.g. -0.03 for -3%.
    pub stop_loss_pct: f64,
    /// Positive fraction, e.g. 0.05 for +5%.
    pub profit_target_pct: f64,
    /// Drawdown from peak that trips the trailing stop, e.g. 0.02.
    pub trailing_stop_pct: f64,
    pub max_hold_hours: f64,
    pub min_hold_hours: f64,
}

/// Evaluates exit conditions and tracks per-trade price peaks.
pub struct ExitStrategyManager {
    params: ExitParams,
    /// Highest price seen per open trade id.
    peaks: Mutex<HashMap<i64, f64>>,
}

impl ExitStrategyManager {
    pub fn new(params: ExitParams) -> Self {
        Self {
            params,
            peaks: Mutex::new(HashMap::new()),
        }
    }

    /// Record the latest price and return the peak for the trade.
    pub fn update_peak(&self, trade_id: i64, current_price: f64) -> f64 {
        let mut peaks = self.peaks.lock();
        let peak = peaks.entry(trade_id).or_insert(current_price);
        if current_price > *peak {
            *peak = current_price;
        }
        *peak
    }

    /// Forget a trade's peak (call on close).
    pub fn clear_peak(&self, trade_id: i64) {
        self.peaks.lock().remove(&trade_id);
    }

    pub fn tracked_positions(&self) -> usize {
        self.peaks.lock().len()
    }

    /// Evaluate a position: updates the peak, then runs the pure rule chain.
    pub fn evaluate_position(
        &self,
        trade: &TradeRecord,
        current_price: f64,
        current_defcon: u8,
    ) -> Option<ExitSignal> {
        let peak = self.update_peak(trade.trade_id, current_price);
        let holding_hours = trade.holding_hours_now();
        evaluate(&self.params, trade, current_price, current_defcon, peak, holding_hours)
    }
}

/// The pure rule chain. Exposed separately so identical inputs can be
/// replayed in tests without touching peak state.
pub fn evaluate(
    params: &ExitParams,
    trade: &TradeRecord,
    current_price: f64,
    current_defcon: u8,
    peak: f64,
    holding_hours: f64,
) -> Option<ExitSignal> {
    if current_price <= 0.0 || trade.entry_price <= 0.0 {
        debug!(trade_id = trade.trade_id, current_price, "invalid price — skipping exit eval");
        return None;
    }

    let pnl_pct = (current_price - trade.entry_price) / trade.entry_price;
    let min_hold_met = holding_hours >= params.min_hold_hours;
    let signal = |rule: ExitRule, message: String| {
        Some(ExitSignal {
            trade_id: trade.trade_id,
            ticker: trade.ticker.clone(),
            rule,
            entry_price: trade.entry_price,
            exit_price: current_price,
            pnl_pct,
            message,
            priority: rule.priority(),
        })
    };

    // 1. Stop loss — the safety mechanism; never gated by hold time.
    if pnl_pct <= params.stop_loss_pct {
        return signal(
            ExitRule::StopLoss,
            format!("STOP LOSS: {} {:.2}%", trade.ticker, pnl_pct * 100.0),
        );
    }

    // 2. Profit target.
    if min_hold_met && pnl_pct >= params.profit_target_pct {
        return signal(
            ExitRule::ProfitTarget,
            format!("PROFIT TARGET: {} +{:.2}%", trade.ticker, pnl_pct * 100.0),
        );
    }

    // 3. Trailing stop — armed only once the position has been profitable.
    if min_hold_met && peak > trade.entry_price {
        let drawdown = (current_price - peak) / peak;
        if drawdown <= -params.trailing_stop_pct {
            return signal(
                ExitRule::TrailingStop,
                format!(
                    "TRAILING STOP: down {:.1}% from peak ${peak:.2}",
                    drawdown.abs() * 100.0
                ),
            );
        }
    }

    // 4. Time-and-loss: approaching max hold and still red.
    if holding_hours >= params.max_hold_hours * 0.8 && pnl_pct < 0.0 {
        return signal(
            ExitRule::TimeAndLoss,
            format!(
                "TIME & LOSS: held {holding_hours:.1}h and {:.2}% red",
                pnl_pct * 100.0
            ),
        );
    }

    // 5. Regime reversion: a crisis-opportunity entry whose crisis has lifted.
    if trade.defcon_at_entry <= 2 && current_defcon >= 3 {
        return signal(
            ExitRule::RegimeReversion,
            format!(
                "REGIME REVERT: DEFCON {} -> {current_defcon} (crisis over)",
                trade.defcon_at_entry
            ),
        );
    }

    // 6. Time limit, unconditional on P&L.
    if holding_hours >= params.max_hold_hours {
        return signal(
            ExitRule::TimeLimit,
            format!(
                "TIME LIMIT: held {holding_hours:.1}h (max {:.0}h)",
                params.max_hold_hours
            ),
        );
    }

    None
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ExitParams {
        ExitParams {
            stop_loss_pct: -0.03,
            profit_target_pct: 0.05,
            trailing_stop_pct: 0.02,
            max_hold_hours: 72.0,
            min_hold_hours: 1.0,
        }
    }

    fn trade(entry_price: f64, defcon_at_entry: u8) -> TradeRecord {
        TradeRecord {
            trade_id: 1,
            crisis_id: None,
            ticker: "XYZ".into(),
            entry_date: "2026-03-01".into(),
            entry_time: "09:30:00".into(),
            entry_price,
            shares: 100,
            cost_basis: entry_price * 100.0,
            entry_signal_score: 60.0,
            defcon_at_entry,
            status: "open".into(),
            current_price: Some(entry_price),
            unrealized_pnl: 0.0,
            exit_price: None,
            exit_reason: None,
            realized_pnl: None,
            realized_pnl_pct: None,
            holding_hours: None,
            notes: None,
        }
    }

    #[test]
    fn stop_loss_fires_at_zero_holding() {
        let p = params();
        let t = trade(100.0, 5);
        let signal = evaluate(&p, &t, 96.5, 5, 100.0, 0.0).unwrap();
        assert_eq!(signal.rule, ExitRule::StopLoss);
        assert_eq!(signal.priority, 5);
        assert_eq!(signal.rule.persisted_reason(), ExitReason::StopLoss);
        assert!((signal.pnl_pct + 0.035).abs() < 1e-9);
    }

    #[test]
    fn profit_target_gated_by_min_hold() {
        let p = params();
        let t = trade(100.0, 5);

        // Inside the hold window: no exit.
        assert!(evaluate(&p, &t, 106.0, 5, 106.0, 0.5).is_none());

        // Past it: profit target fires.
        let signal = evaluate(&p, &t, 106.0, 5, 106.0, 2.0).unwrap();
        assert_eq!(signal.rule, ExitRule::ProfitTarget);
        assert_eq!(signal.rule.persisted_reason(), ExitReason::ProfitTarget);
    }

    #[test]
    fn trailing_stop_needs_profitable_peak() {
        let p = params();
        let t = trade(100.0, 5);

        // Peak at entry: trailing never arms, even on a 2.5% dip from peak...
        // (a dip that deep from entry is the stop loss's business anyway)
        assert!(evaluate(&p, &t, 99.0, 5, 100.0, 5.0).is_none());

        // Peak above entry and price 3% off it: trailing fires.
        let signal = evaluate(&p, &t, 106.8, 5, 110.0, 5.0).unwrap();
        assert_eq!(signal.rule, ExitRule::TrailingStop);
        // Trailing persists as manual with the detail in the note.
        assert_eq!(signal.rule.persisted_reason(), ExitReason::Manual);
        assert!(signal.message.contains("peak"));
    }

    #[test]
    fn time_and_loss_near_max_hold() {
        let p = params();
        let t = trade(100.0, 5);
        let signal = evaluate(&p, &t, 99.0, 5, 100.0, 58.0).unwrap();
        assert_eq!(signal.rule, ExitRule::TimeAndLoss);
    }

    #[test]
    fn regime_reversion_for_crisis_entries_only() {
        let p = params();

        let crisis_entry = trade(100.0, 2);
        let signal = evaluate(&p, &crisis_entry, 101.0, 3, 101.0, 5.0).unwrap();
        assert_eq!(signal.rule, ExitRule::RegimeReversion);
        assert_eq!(signal.rule.persisted_reason(), ExitReason::Manual);

        // Entered in peacetime: reversion never applies.
        let calm_entry = trade(100.0, 4);
        assert!(evaluate(&p, &calm_entry, 101.0, 3, 101.0, 5.0).is_none());
    }

    #[test]
    fn time_limit_fires_even_in_profit() {
        let p = params();
        let t = trade(100.0, 5);
        // +2% but 75h held: time limit (profit target would have fired at
        // +5%; +2% is below it).
        let signal = evaluate(&p, &t, 102.0, 5, 102.0, 75.0).unwrap();
        assert_eq!(signal.rule, ExitRule::TimeLimit);
    }

    #[test]
    fn stop_loss_outranks_everything() {
        let p = params();
        let t = trade(100.0, 2);
        // Deep red, past max hold, regime reverted: stop loss still wins.
        let signal = evaluate(&p, &t, 95.0, 4, 100.0, 80.0).unwrap();
        assert_eq!(signal.rule, ExitRule::StopLoss);
    }

    #[test]
    fn evaluation_is_pure() {
        let p = params();
        let t = trade(100.0, 2);
        let a = evaluate(&p, &t, 97.0, 3, 104.0, 10.0);
        let b = evaluate(&p, &t, 97.0, 3, 104.0, 10.0);
        match (a, b) {
            (Some(x), Some(y)) => {
                assert_eq!(x.rule, y.rule);
                assert_eq!(x.exit_price, y.exit_price);
                assert_eq!(x.message, y.message);
            }
            (None, None) => {}
            _ => panic!("evaluation not deterministic"),
        }
    }

    #[test]
    fn peak_tracking_updates_and_clears() {
        let manager = ExitStrategyManager::new(params());
        assert_eq!(manager.update_peak(7, 100.0), 100.0);
        assert_eq!(manager.update_peak(7, 105.0), 105.0);
        assert_eq!(manager.update_peak(7, 103.0), 105.0);
        assert_eq!(manager.tracked_positions(), 1);
        manager.clear_peak(7);
        assert_eq!(manager.tracked_positions(), 0);
    }

    #[test]
    fn no_exit_on_quiet_position() {
        let p = params();
        let t = trade(100.0, 5);
        assert!(evaluate(&p, &t, 101.0, 5, 101.0, 10.0).is_none());
    }
}
