// =============================================================================
// Shared types used across the Sentinel trading orchestrator
// =============================================================================

use serde::{Deserialize, Serialize};

/// How the broker reacts to DEFCON escalations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerMode {
    /// Alert only — trades require operator approval via `yes`/`no`.
    Disabled,
    /// Execute automatically but notify on every action.
    SemiAuto,
    /// Execute silently.
    FullAuto,
}

impl Default for BrokerMode {
    fn default() -> Self {
        Self::SemiAuto
    }
}

impl BrokerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::SemiAuto => "semi_auto",
            Self::FullAuto => "full_auto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "disabled" => Some(Self::Disabled),
            "semi_auto" => Some(Self::SemiAuto),
            "full_auto" => Some(Self::FullAuto),
            _ => None,
        }
    }

    /// Whether the broker may execute without operator approval.
    pub fn auto_execute(&self) -> bool {
        matches!(self, Self::SemiAuto | Self::FullAuto)
    }
}

impl std::fmt::Display for BrokerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of crisis categories a news batch can be classified into.
///
/// `Signal` is synthetic — it tags crisis rows created to link a trade
/// package to the DEFCON signal that produced it, never a news batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrisisCategory {
    TechCrash,
    GeopoliticalTrade,
    LiquidityCredit,
    InflationRate,
    PandemicHealth,
    MarketCorrection,
    Signal,
}

impl Default for CrisisCategory {
    fn default() -> Self {
        Self::MarketCorrection
    }
}

impl CrisisCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TechCrash => "tech_crash",
            Self::GeopoliticalTrade => "geopolitical_trade",
            Self::LiquidityCredit => "liquidity_credit",
            Self::InflationRate => "inflation_rate",
            Self::PandemicHealth => "pandemic_health",
            Self::MarketCorrection => "market_correction",
            Self::Signal => "signal",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "tech_crash" => Self::TechCrash,
            "geopolitical_trade" => Self::GeopoliticalTrade,
            "liquidity_credit" => Self::LiquidityCredit,
            "inflation_rate" => Self::InflationRate,
            "pandemic_health" => Self::PandemicHealth,
            "signal" => Self::Signal,
            _ => Self::MarketCorrection,
        }
    }

    /// Human-readable label used in crisis descriptions and notifications.
    pub fn label(&self) -> &'static str {
        match self {
            Self::TechCrash => "Technology Sector Crisis",
            Self::GeopoliticalTrade => "Geopolitical/Trade Tensions",
            Self::LiquidityCredit => "Liquidity/Credit Crisis",
            Self::InflationRate => "Inflation/Fed Policy Crisis",
            Self::PandemicHealth => "Pandemic/Health Crisis",
            Self::MarketCorrection => "Broad Market Correction",
            Self::Signal => "Signal Event",
        }
    }
}

impl std::fmt::Display for CrisisCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directional sentiment of a single article or an article batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Bullish,
    Bearish,
    Neutral,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bullish => "bullish",
            Self::Bearish => "bearish",
            Self::Neutral => "neutral",
        }
    }
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Urgency classification of a single article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Breaking,
    High,
    Routine,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Breaking => "breaking",
            Self::High => "high",
            Self::Routine => "routine",
        }
    }
}

/// Clamp an arbitrary integer to the valid DEFCON range 1..=5.
///
/// Lower is more defensive: 1 = execute, 5 = peacetime.
pub fn clamp_defcon(level: i64) -> u8 {
    level.clamp(1, 5) as u8
}

/// Short operator-facing label for a DEFCON level.
pub fn defcon_label(level: u8) -> &'static str {
    match level {
        1 => "EXECUTE",
        2 => "PRE-BOTTOM",
        3 => "CRISIS",
        4 => "ELEVATED",
        _ => "PEACETIME",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_mode_roundtrip() {
        for mode in [BrokerMode::Disabled, BrokerMode::SemiAuto, BrokerMode::FullAuto] {
            assert_eq!(BrokerMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(BrokerMode::parse("turbo"), None);
        assert!(!BrokerMode::Disabled.auto_execute());
        assert!(BrokerMode::FullAuto.auto_execute());
    }

    #[test]
    fn crisis_category_parse_defaults_to_correction() {
        assert_eq!(CrisisCategory::parse("tech_crash"), CrisisCategory::TechCrash);
        assert_eq!(CrisisCategory::parse("garbage"), CrisisCategory::MarketCorrection);
    }

    #[test]
    fn defcon_clamped_to_valid_range() {
        assert_eq!(clamp_defcon(0), 1);
        assert_eq!(clamp_defcon(3), 3);
        assert_eq!(clamp_defcon(9), 5);
        assert_eq!(clamp_defcon(-2), 1);
    }
}
