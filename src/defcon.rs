// =============================================================================
// Composite DEFCON Engine — fuses quantitative, news, macro, and LLM inputs
// =============================================================================
//
// Pure given its inputs; every value it consumes is persisted as-of-cycle so
// a snapshot can be replayed. Evaluation order is fixed:
//
//   1. base level from the composite score + market drop table
//   2. soft nudges (macro modifier, flash forecast), combined sum clamped
//      to +/-1 — threshold comparison, never rounding
//   3. hard overrides, in priority order (reasoning analysis first)
//
// DEFCON scale: 1 = execute (most bullish) ... 5 = peacetime.
// =============================================================================

use serde::Serialize;
use tracing::{info, warn};

use crate::store::signals::ReasoningAdjustment;
use crate::types::clamp_defcon;

/// Raw per-cycle signal scores, each 0-100.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SignalScores {
    pub bond_yield_spike: f64,
    pub vix_spike: f64,
    pub market_drawdown: f64,
}

impl SignalScores {
    pub fn composite(&self) -> f64 {
        (self.bond_yield_spike + self.vix_spike + self.market_drawdown) / 3.0
    }
}

/// Score the raw market inputs. Missing inputs score zero — a degraded feed
/// must never look like a crisis by itself.
pub fn calculate_signal_scores(
    bond_yield: Option<f64>,
    vix: Option<f64>,
    market_change_pct: Option<f64>,
) -> SignalScores {
    let bond_yield_spike = match bond_yield {
        Some(y) if y > 4.0 => ((y - 3.5) * 10.0).min(100.0),
        _ => 0.0,
    };
    let vix_spike = match vix {
        Some(v) if v > 25.0 => ((v - 15.0) * 2.0).min(100.0),
        _ => 0.0,
    };
    let market_drawdown = match market_change_pct {
        Some(chg) if chg < -4.0 => (chg.abs() * 5.0).min(100.0),
        _ => 0.0,
    };

    SignalScores {
        bond_yield_spike,
        vix_spike,
        market_drawdown,
    }
}

/// The news-side inputs the engine needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewsOverrideInput {
    pub breaking_news_override: bool,
    pub recommended_defcon: Option<u8>,
}

/// Everything one evaluation consumes.
#[derive(Debug, Clone, Default)]
pub struct DefconInputs {
    pub composite_score: f64,
    pub market_drop_pct: f64,
    pub news: NewsOverrideInput,
    /// Latest reasoning-tier analysis for this cycle's news signal, if any.
    pub reasoning: Option<ReasoningAdjustment>,
    /// Macro modifier in {-1.0, -0.5, 0, +0.5}.
    pub macro_modifier: Option<f64>,
    /// DEFCON forecast from the latest flash/daily briefing.
    pub flash_forecast: Option<u8>,
}

/// Base table from the composite score and market drop.
fn base_level(composite: f64, drop: f64) -> u8 {
    if composite >= 80.0 && drop < -4.0 {
        1
    } else if composite >= 60.0 || drop < -4.0 {
        2
    } else if composite >= 40.0 || drop < -2.0 {
        3
    } else if composite >= 20.0 || drop < -1.0 {
        4
    } else {
        5
    }
}

/// Evaluate one cycle. Returns the final DEFCON level.
pub fn compute_defcon(inputs: &DefconInputs) -> u8 {
    let base = base_level(inputs.composite_score, inputs.market_drop_pct);

    // --- Soft nudges: each source contributes at most +/-1; the combined
    // sum is clamped to +/-1 before applying. Threshold comparison is
    // mandatory — round() would banker's-round -0.5 away.
    let mut nudge: i64 = 0;
    if let Some(modifier) = inputs.macro_modifier {
        if modifier <= -0.5 {
            nudge -= 1;
        } else if modifier >= 0.5 {
            nudge += 1;
        }
    }
    if let Some(forecast) = inputs.flash_forecast {
        if (1..=5).contains(&forecast) {
            if forecast < base {
                nudge -= 1;
            } else if forecast > base {
                nudge += 1;
            }
        }
    }
    nudge = nudge.clamp(-1, 1);
    let nudged = clamp_defcon(base as i64 + nudge);
    if nudge != 0 {
        info!(
            base,
            nudge,
            macro_modifier = ?inputs.macro_modifier,
            flash_forecast = ?inputs.flash_forecast,
            nudged,
            "soft nudge applied"
        );
    }

    // --- Hard overrides, priority order.
    if let Some(reasoning) = &inputs.reasoning {
        if reasoning.enhanced_confidence >= 85.0 {
            warn!(
                from = nudged,
                confidence = reasoning.enhanced_confidence,
                action = %reasoning.recommended_action,
                "reasoning override: forcing DEFCON 2"
            );
            return 2;
        }
        if reasoning.confidence_adjustment < -20.0 {
            info!(
                adjustment = reasoning.confidence_adjustment,
                "reasoning caution: news override canceled"
            );
            return nudged;
        }
    }

    if inputs.news.breaking_news_override {
        if let Some(recommended) = inputs.news.recommended_defcon {
            if recommended < nudged {
                warn!(from = nudged, to = recommended, "breaking news override applied");
                return clamp_defcon(recommended as i64);
            }
        }
    }

    nudged
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn reasoning(confidence: f64, adjustment: f64) -> ReasoningAdjustment {
        ReasoningAdjustment {
            enhanced_confidence: confidence,
            confidence_adjustment: adjustment,
            recommended_action: "HOLD".into(),
            reasoning: String::new(),
        }
    }

    #[test]
    fn base_table_boundaries() {
        assert_eq!(base_level(80.0, -4.1), 1);
        assert_eq!(base_level(80.0, -3.9), 2); // drop not deep enough for 1
        assert_eq!(base_level(60.0, 0.0), 2);
        assert_eq!(base_level(40.0, 0.0), 3);
        assert_eq!(base_level(0.0, -2.1), 3);
        assert_eq!(base_level(20.0, 0.0), 4);
        assert_eq!(base_level(0.0, -1.1), 4);
        assert_eq!(base_level(10.0, 0.5), 5);
    }

    #[test]
    fn signal_scores_ignore_calm_inputs() {
        let scores = calculate_signal_scores(Some(3.8), Some(18.0), Some(0.3));
        assert_eq!(scores.composite(), 0.0);
    }

    #[test]
    fn signal_scores_scale_with_stress() {
        let scores = calculate_signal_scores(Some(4.5), Some(35.0), Some(-5.0));
        assert!((scores.bond_yield_spike - 10.0).abs() < 1e-9);
        assert!((scores.vix_spike - 40.0).abs() < 1e-9);
        assert!((scores.market_drawdown - 25.0).abs() < 1e-9);
    }

    #[test]
    fn breaking_news_override_forces_lower_level() {
        // Scenario: base 4 from composite 25 / drop -1.5; news recommends 2.
        let inputs = DefconInputs {
            composite_score: 25.0,
            market_drop_pct: -1.5,
            news: NewsOverrideInput {
                breaking_news_override: true,
                recommended_defcon: Some(2),
            },
            ..DefconInputs::default()
        };
        assert_eq!(compute_defcon(&inputs), 2);
    }

    #[test]
    fn override_equal_to_base_is_a_no_op() {
        let inputs = DefconInputs {
            composite_score: 45.0, // base 3
            market_drop_pct: 0.0,
            news: NewsOverrideInput {
                breaking_news_override: true,
                recommended_defcon: Some(3),
            },
            ..DefconInputs::default()
        };
        assert_eq!(compute_defcon(&inputs), 3);
    }

    #[test]
    fn combined_nudges_clamp_to_one() {
        // Scenario: base 3, macro -0.6 and flash 1 each nudge down; the sum
        // (-2) clamps to -1 so the result is 2, not 1.
        let inputs = DefconInputs {
            composite_score: 45.0,
            market_drop_pct: 0.0,
            macro_modifier: Some(-0.6),
            flash_forecast: Some(1),
            ..DefconInputs::default()
        };
        assert_eq!(compute_defcon(&inputs), 2);
    }

    #[test]
    fn macro_threshold_not_rounded() {
        // Exactly -0.5 must nudge (threshold comparison, not rounding).
        let inputs = DefconInputs {
            composite_score: 45.0,
            market_drop_pct: 0.0,
            macro_modifier: Some(-0.5),
            ..DefconInputs::default()
        };
        assert_eq!(compute_defcon(&inputs), 2);

        // -0.4 must not.
        let inputs = DefconInputs {
            macro_modifier: Some(-0.4),
            composite_score: 45.0,
            ..DefconInputs::default()
        };
        assert_eq!(compute_defcon(&inputs), 3);
    }

    #[test]
    fn reasoning_high_confidence_forces_two() {
        let inputs = DefconInputs {
            composite_score: 10.0, // base 5
            reasoning: Some(reasoning(90.0, 0.0)),
            ..DefconInputs::default()
        };
        assert_eq!(compute_defcon(&inputs), 2);
    }

    #[test]
    fn reasoning_caution_cancels_news_override() {
        let inputs = DefconInputs {
            composite_score: 25.0, // base 4
            market_drop_pct: -1.5,
            news: NewsOverrideInput {
                breaking_news_override: true,
                recommended_defcon: Some(1),
            },
            reasoning: Some(reasoning(50.0, -30.0)),
            ..DefconInputs::default()
        };
        // Override canceled; the (un-nudged) base survives.
        assert_eq!(compute_defcon(&inputs), 4);
    }

    #[test]
    fn reasoning_override_beats_news_override() {
        let inputs = DefconInputs {
            composite_score: 95.0,
            market_drop_pct: -6.0, // base 1
            news: NewsOverrideInput {
                breaking_news_override: true,
                recommended_defcon: Some(1),
            },
            reasoning: Some(reasoning(92.0, 0.0)),
            ..DefconInputs::default()
        };
        // Reasoning fires first and forces 2 even though news says 1.
        assert_eq!(compute_defcon(&inputs), 2);
    }

    #[test]
    fn result_always_in_valid_range() {
        for composite in [0.0, 25.0, 45.0, 65.0, 90.0] {
            for drop in [0.0, -1.5, -2.5, -5.0] {
                for modifier in [Some(-1.0), Some(0.0), Some(0.5), None] {
                    let inputs = DefconInputs {
                        composite_score: composite,
                        market_drop_pct: drop,
                        macro_modifier: modifier,
                        ..DefconInputs::default()
                    };
                    let level = compute_defcon(&inputs);
                    assert!((1..=5).contains(&level));
                }
            }
        }
    }
}
