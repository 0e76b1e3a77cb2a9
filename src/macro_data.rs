// =============================================================================
// Macro Collector — FRED series, composite score, DEFCON modifier
// =============================================================================
//
// Pulls nine FRED series on the collector cadence, scores the macro
// environment from a neutral base of 50, and maps the score to a DEFCON
// modifier in {-1.0, -0.5, 0, +0.5}. Scoring rules mirror the persisted
// descriptor list so the briefing can explain WHY the score moved.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::market::{MarketDataClient, MarketResult};
use crate::store::signals::MacroRow;
use crate::store::Store;

/// One scored observation about the macro environment.
#[derive(Debug, Clone, Serialize)]
pub struct MacroSignal {
    pub kind: String,
    pub value: f64,
    /// "bearish" | "caution" | "bullish" | "neutral"
    pub severity: String,
    pub description: String,
}

/// Output of one macro analysis pass.
#[derive(Debug, Clone, Serialize)]
pub struct MacroAnalysis {
    pub macro_score: f64,
    pub defcon_modifier: f64,
    pub signals: Vec<MacroSignal>,
    pub yield_curve_spread: Option<f64>,
    pub fed_funds_rate: Option<f64>,
    pub unemployment_rate: Option<f64>,
    pub m2_yoy_change: Option<f64>,
    pub hy_oas_bps: Option<f64>,
    pub consumer_sentiment: Option<f64>,
    pub rate_10y: Option<f64>,
    pub rate_2y: Option<f64>,
}

impl MacroAnalysis {
    pub fn bearish_count(&self) -> usize {
        self.signals.iter().filter(|s| s.severity == "bearish").count()
    }

    pub fn bullish_count(&self) -> usize {
        self.signals.iter().filter(|s| s.severity == "bullish").count()
    }

    pub fn to_row(&self) -> MacroRow {
        MacroRow {
            yield_curve_spread: self.yield_curve_spread,
            fed_funds_rate: self.fed_funds_rate,
            unemployment_rate: self.unemployment_rate,
            m2_yoy_change: self.m2_yoy_change,
            hy_oas_bps: self.hy_oas_bps,
            consumer_sentiment: self.consumer_sentiment,
            rate_10y: self.rate_10y,
            rate_2y: self.rate_2y,
            macro_score: self.macro_score,
            defcon_modifier: self.defcon_modifier,
            bearish_signals: self.bearish_count() as i64,
            bullish_signals: self.bullish_count() as i64,
            signals_json: serde_json::to_string(&self.signals).unwrap_or_default(),
        }
    }
}

/// Fetches and scores macroeconomic indicators.
pub struct MacroCollector {
    market: Arc<MarketDataClient>,
    store: Arc<Store>,
}

impl MacroCollector {
    pub fn new(market: Arc<MarketDataClient>, store: Arc<Store>) -> Self {
        Self { market, store }
    }

    /// Latest value of a series, if fetchable.
    async fn latest(&self, series: &str) -> Option<(String, f64)> {
        match self.market.fred_series(series, 5).await {
            Ok(observations) => observations.into_iter().next_back(),
            Err(e) => {
                warn!(series, error = %e, "FRED series unavailable");
                None
            }
        }
    }

    /// Absolute change over roughly three months of observations.
    async fn change_3m(&self, series: &str) -> Option<f64> {
        let observations = self.market.fred_series(series, 6).await.ok()?;
        if observations.len() < 4 {
            return None;
        }
        let latest = observations.last()?.1;
        let older = observations[observations.len() - 4].1;
        Some(latest - older)
    }

    /// Year-over-year percentage change.
    async fn yoy_change(&self, series: &str) -> Option<f64> {
        let observations = self.market.fred_series(series, 14).await.ok()?;
        if observations.len() < 13 {
            return None;
        }
        let latest = observations.last()?.1;
        let year_ago = observations.first()?.1;
        if year_ago == 0.0 {
            return None;
        }
        Some((latest - year_ago) / year_ago.abs() * 100.0)
    }

    /// Full analysis pass: fetch, score, persist. Returns the analysis, or
    /// None when nothing at all could be fetched (stage skips silently).
    pub async fn run_full_analysis(&self) -> MarketResult<MacroAnalysis> {
        info!("macro collector: fetching FRED indicators");

        let yield_curve = self.latest("T10Y2Y").await;
        let dgs10 = self.latest("DGS10").await;
        let dgs2 = self.latest("DGS2").await;
        let fed_funds = self.latest("FEDFUNDS").await;
        let fed_funds_3m = self.change_3m("FEDFUNDS").await;
        let unemployment = self.latest("UNRATE").await;
        let unemployment_3m = self.change_3m("UNRATE").await;
        let m2_yoy = self.yoy_change("M2SL").await;
        let hy_oas = self.latest("BAMLH0A0HYM2").await;
        let sentiment = self.latest("UMCSENT").await;

        let mut signals: Vec<MacroSignal> = Vec::new();
        let mut adjustments: Vec<f64> = Vec::new();

        // Yield curve: inversion is the classic recession signal.
        if let Some((_, spread)) = &yield_curve {
            let spread = *spread;
            if spread < 0.0 {
                signals.push(MacroSignal {
                    kind: "yield_curve_inverted".into(),
                    value: spread,
                    severity: "bearish".into(),
                    description: format!("Yield curve inverted ({spread:+.2}%) — recession risk elevated"),
                });
                adjustments.push(-20.0);
            } else if spread < 0.5 {
                signals.push(MacroSignal {
                    kind: "yield_curve_flat".into(),
                    value: spread,
                    severity: "caution".into(),
                    description: format!("Yield curve flat ({spread:+.2}%) — slowing growth signal"),
                });
                adjustments.push(-10.0);
            } else {
                signals.push(MacroSignal {
                    kind: "yield_curve_normal".into(),
                    value: spread,
                    severity: "neutral".into(),
                    description: format!("Yield curve normal ({spread:+.2}%)"),
                });
                adjustments.push(5.0);
            }
        }

        // Fed funds: fast tightening squeezes liquidity; easing supports risk.
        if let Some(change) = fed_funds_3m {
            if change > 0.5 {
                signals.push(MacroSignal {
                    kind: "fed_tightening".into(),
                    value: change,
                    severity: "bearish".into(),
                    description: format!("Fed tightening fast (+{change:.2}% in 3mo) — liquidity squeeze risk"),
                });
                adjustments.push(-15.0);
            } else if change < -0.25 {
                signals.push(MacroSignal {
                    kind: "fed_easing".into(),
                    value: change,
                    severity: "bullish".into(),
                    description: format!("Fed easing ({change:.2}% in 3mo) — supportive for risk assets"),
                });
                adjustments.push(10.0);
            }
        }

        // Unemployment: a rising 3-month delta matters more than the level.
        if let Some((_, rate)) = &unemployment {
            let rate = *rate;
            if let Some(delta) = unemployment_3m.filter(|d| *d > 0.3) {
                signals.push(MacroSignal {
                    kind: "unemployment_rising".into(),
                    value: rate,
                    severity: "bearish".into(),
                    description: format!("Unemployment rising (+{delta:.1}pp in 3mo to {rate:.1}%)"),
                });
                adjustments.push(-15.0);
            } else if rate > 5.5 {
                signals.push(MacroSignal {
                    kind: "unemployment_elevated".into(),
                    value: rate,
                    severity: "caution".into(),
                    description: format!("Unemployment elevated ({rate:.1}%)"),
                });
                adjustments.push(-8.0);
            } else if rate < 4.0 {
                signals.push(MacroSignal {
                    kind: "unemployment_low".into(),
                    value: rate,
                    severity: "bullish".into(),
                    description: format!("Unemployment low ({rate:.1}%) — strong labor market"),
                });
                adjustments.push(5.0);
            }
        }

        // M2: YoY contraction drains liquidity from the system.
        if let Some(yoy) = m2_yoy {
            if yoy < -2.0 {
                signals.push(MacroSignal {
                    kind: "m2_contracting".into(),
                    value: yoy,
                    severity: "bearish".into(),
                    description: format!("M2 contracting ({yoy:.1}% YoY) — liquidity draining"),
                });
                adjustments.push(-12.0);
            } else if yoy > 8.0 {
                signals.push(MacroSignal {
                    kind: "m2_expanding_fast".into(),
                    value: yoy,
                    severity: "caution".into(),
                    description: format!("M2 expanding rapidly (+{yoy:.1}% YoY) — inflationary pressure"),
                });
                adjustments.push(-5.0);
            }
        }

        // Credit spreads: FRED reports HY OAS in percent; convert to bps.
        let hy_bps = hy_oas.as_ref().map(|(_, v)| v * 100.0);
        if let Some(bps) = hy_bps {
            if bps > 500.0 {
                signals.push(MacroSignal {
                    kind: "credit_stress_extreme".into(),
                    value: bps,
                    severity: "bearish".into(),
                    description: format!("HY credit spreads extreme ({bps:.0}bps) — credit crisis risk"),
                });
                adjustments.push(-25.0);
            } else if bps > 350.0 {
                signals.push(MacroSignal {
                    kind: "credit_stress_elevated".into(),
                    value: bps,
                    severity: "caution".into(),
                    description: format!("HY credit spreads elevated ({bps:.0}bps) — financial stress"),
                });
                adjustments.push(-12.0);
            } else if bps < 250.0 {
                signals.push(MacroSignal {
                    kind: "credit_spreads_tight".into(),
                    value: bps,
                    severity: "bullish".into(),
                    description: format!("HY credit spreads tight ({bps:.0}bps) — risk appetite healthy"),
                });
                adjustments.push(8.0);
            }
        }

        // Consumer sentiment.
        if let Some((_, level)) = &sentiment {
            let level = *level;
            if level < 65.0 {
                signals.push(MacroSignal {
                    kind: "consumer_pessimistic".into(),
                    value: level,
                    severity: "bearish".into(),
                    description: format!("Consumer sentiment low ({level:.1}) — demand slowdown risk"),
                });
                adjustments.push(-8.0);
            } else if level > 80.0 {
                signals.push(MacroSignal {
                    kind: "consumer_optimistic".into(),
                    value: level,
                    severity: "bullish".into(),
                    description: format!("Consumer sentiment strong ({level:.1})"),
                });
                adjustments.push(5.0);
            }
        }

        // Every series dark means FRED itself is unreachable (or unkeyed):
        // the stage skips rather than persisting a fabricated neutral row.
        if yield_curve.is_none()
            && fed_funds.is_none()
            && unemployment.is_none()
            && hy_oas.is_none()
            && sentiment.is_none()
        {
            return Err(crate::market::MarketError::Unavailable {
                provider: "fred",
                reason: "no macro series available".to_string(),
            });
        }

        let macro_score = compute_score(&adjustments);
        let defcon_modifier = score_to_modifier(macro_score);

        let analysis = MacroAnalysis {
            macro_score,
            defcon_modifier,
            signals,
            yield_curve_spread: yield_curve.map(|(_, v)| v),
            fed_funds_rate: fed_funds.map(|(_, v)| v),
            unemployment_rate: unemployment.map(|(_, v)| v),
            m2_yoy_change: m2_yoy,
            hy_oas_bps: hy_bps,
            consumer_sentiment: sentiment.map(|(_, v)| v),
            rate_10y: dgs10.map(|(_, v)| v),
            rate_2y: dgs2.map(|(_, v)| v),
        };

        if let Err(e) = self.store.insert_macro_row(&analysis.to_row()) {
            warn!(error = %e, "macro row save failed");
        }

        info!(
            macro_score = format!("{:.0}", analysis.macro_score),
            defcon_modifier = format!("{:+.1}", analysis.defcon_modifier),
            bearish = analysis.bearish_count(),
            bullish = analysis.bullish_count(),
            "macro analysis complete"
        );
        Ok(analysis)
    }
}

/// Base 50, per-indicator adjustments, clamped 0..100.
fn compute_score(adjustments: &[f64]) -> f64 {
    (50.0 + adjustments.iter().sum::<f64>()).clamp(0.0, 100.0)
}

/// Map the composite score to a DEFCON modifier.
///
/// Below 30 the macro regime itself argues for escalation (-1); above 70 it
/// argues for slight de-escalation bias (+0.5).
fn score_to_modifier(score: f64) -> f64 {
    if score < 30.0 {
        -1.0
    } else if score < 40.0 {
        -0.5
    } else if score > 70.0 {
        0.5
    } else {
        0.0
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_base_is_neutral() {
        assert!((compute_score(&[]) - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn score_clamped_to_range() {
        assert_eq!(compute_score(&[-25.0, -20.0, -15.0, -12.0]), 0.0);
        assert_eq!(compute_score(&[30.0, 30.0]), 100.0);
    }

    #[test]
    fn modifier_bands() {
        assert_eq!(score_to_modifier(20.0), -1.0);
        assert_eq!(score_to_modifier(35.0), -0.5);
        assert_eq!(score_to_modifier(50.0), 0.0);
        assert_eq!(score_to_modifier(70.0), 0.0);
        assert_eq!(score_to_modifier(75.0), 0.5);
    }

    #[test]
    fn stressed_inputs_produce_bearish_modifier() {
        // Inverted curve (-20), fast tightening (-15), extreme credit (-25)
        // from base 50 lands at 0 -> modifier -1.0.
        let score = compute_score(&[-20.0, -15.0, -25.0]);
        assert_eq!(score, 0.0);
        assert_eq!(score_to_modifier(score), -1.0);
    }
}
