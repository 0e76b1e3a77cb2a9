// =============================================================================
// Orchestrator Configuration — JSON-backed settings with atomic save
// =============================================================================
//
// Central configuration hub for the Sentinel orchestrator. Every tunable
// threshold lives here so the engine can be reconfigured without a rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::BrokerMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_interval_minutes() -> u64 {
    15
}

fn default_confidence_threshold() -> f64 {
    0.70
}

fn default_max_position_pct() -> f64 {
    0.20
}

fn default_stale_days() -> i64 {
    3
}

fn default_max_watchlist_per_run() -> usize {
    10
}

fn default_max_analyst_per_run() -> usize {
    5
}

fn default_pro_trigger_score() -> f64 {
    40.0
}

fn default_similarity_threshold() -> f64 {
    0.6
}

fn default_total_capital() -> f64 {
    100_000.0
}

fn default_profit_target_pct() -> f64 {
    0.05
}

fn default_stop_loss_pct() -> f64 {
    -0.03
}

fn default_trailing_stop_pct() -> f64 {
    0.02
}

fn default_max_hold_hours() -> f64 {
    72.0
}

fn default_min_hold_hours() -> f64 {
    1.0
}

fn default_briefing_hour() -> u32 {
    16
}

fn default_briefing_minute() -> u32 {
    30
}

fn default_db_path() -> String {
    "trading_data/sentinel.db".to_string()
}

fn default_command_dir() -> String {
    "trading_data/commands".to_string()
}

fn default_min_congressional_amount() -> f64 {
    15_000.0
}

fn default_collector_cadence() -> u64 {
    4
}

// =============================================================================
// Sub-sections
// =============================================================================

/// Per-endpoint rate limit settings (`rate_limits.<endpoint>` in the file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub rpm: u32,
    #[serde(default)]
    pub min_delay_s: f64,
}

/// News deduplication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeduplicationConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

/// One notification channel: a webhook URL plus per-event enable flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: String,
    /// Event kinds this channel accepts (empty = all).
    #[serde(default)]
    pub log_events: Vec<String>,
}

/// Per-tier model selection for the LLM gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmTierConfig {
    pub model_id: String,
    /// -1 = dynamic, 0 = no reasoning, positive = fixed token budget.
    #[serde(default)]
    pub thinking_budget: i64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_max_output_tokens() -> u32 {
    8192
}

fn default_temperature() -> f64 {
    0.4
}

/// LLM gateway configuration: tier table plus rolling 24h soft quotas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_tiers")]
    pub tiers: HashMap<String, LlmTierConfig>,
    /// Soft token limits per tier over a rolling 24h window.
    #[serde(default = "default_quota_soft_limits")]
    pub quota_soft_limits: HashMap<String, u64>,
}

fn default_tiers() -> HashMap<String, LlmTierConfig> {
    let mut tiers = HashMap::new();
    tiers.insert(
        "fast".to_string(),
        LlmTierConfig {
            model_id: "gemini-2.5-flash".to_string(),
            thinking_budget: 0,
            max_output_tokens: 8192,
            temperature: 0.4,
        },
    );
    tiers.insert(
        "balanced".to_string(),
        LlmTierConfig {
            model_id: "gemini-2.5-flash".to_string(),
            thinking_budget: 8000,
            max_output_tokens: 8192,
            temperature: 1.0,
        },
    );
    tiers.insert(
        "reasoning".to_string(),
        LlmTierConfig {
            model_id: "gemini-3-pro-preview".to_string(),
            thinking_budget: -1,
            max_output_tokens: 16384,
            temperature: 1.0,
        },
    );
    tiers
}

fn default_quota_soft_limits() -> HashMap<String, u64> {
    let mut limits = HashMap::new();
    limits.insert("fast".to_string(), 2_000_000);
    limits.insert("balanced".to_string(), 1_000_000);
    limits.insert("reasoning".to_string(), 500_000);
    limits
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            quota_soft_limits: default_quota_soft_limits(),
        }
    }
}

// =============================================================================
// Config
// =============================================================================

/// Top-level configuration for the Sentinel orchestrator.
///
/// Every field has a serde default so older JSON files missing new fields
/// still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // --- Scheduling ----------------------------------------------------------

    /// Minutes between monitoring cycles.
    #[serde(default = "default_interval_minutes")]
    pub monitoring_interval_minutes: u64,

    /// How the broker handles escalations: disabled / semi_auto / full_auto.
    #[serde(default)]
    pub broker_mode: BrokerMode,

    /// Macro and congressional collectors run every Nth monitoring cycle.
    #[serde(default = "default_collector_cadence")]
    pub collector_cadence_cycles: u64,

    /// Local wall-clock time after which the daily briefing fires.
    #[serde(default = "default_briefing_hour")]
    pub briefing_hour: u32,
    #[serde(default = "default_briefing_minute")]
    pub briefing_minute: u32,

    // --- Acquisition pipeline ------------------------------------------------

    /// Minimum analyst confidence to promote a conditional to the broker.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Hard cap on any single position as a fraction of available cash.
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,

    /// Research library rows older than this are expired and re-gathered.
    #[serde(default = "default_stale_days")]
    pub stale_days: i64,

    /// Researcher cap per run, to avoid hammering providers.
    #[serde(default = "default_max_watchlist_per_run")]
    pub max_watchlist_per_run: usize,

    /// Analyst cap per run.
    #[serde(default = "default_max_analyst_per_run")]
    pub max_analyst_per_run: usize,

    /// News score above which the reasoning tier is triggered.
    #[serde(default = "default_pro_trigger_score")]
    pub pro_trigger_score: f64,

    // --- Paper broker --------------------------------------------------------

    #[serde(default = "default_total_capital")]
    pub total_capital: f64,

    /// Fractional return that takes profit (0.05 = +5%).
    #[serde(default = "default_profit_target_pct")]
    pub profit_target_pct: f64,

    /// Fractional return that stops out (-0.03 = -3%).
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Trailing stop distance from the peak (0.02 = 2%).
    #[serde(default = "default_trailing_stop_pct")]
    pub trailing_stop_pct: f64,

    #[serde(default = "default_max_hold_hours")]
    pub max_hold_hours: f64,

    /// Exits other than the stop loss are gated by this hold time.
    #[serde(default = "default_min_hold_hours")]
    pub min_hold_hours: f64,

    // --- Collectors ----------------------------------------------------------

    /// Congressional trades below this estimated amount are ignored.
    #[serde(default = "default_min_congressional_amount")]
    pub min_congressional_amount: f64,

    #[serde(default)]
    pub fred_api_key: String,

    // --- Subsystems ----------------------------------------------------------

    #[serde(default)]
    pub deduplication: DeduplicationConfig,

    /// Notification channels keyed by name (e.g. "webhook", "webhook_silent").
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,

    /// Per-endpoint rate limits.
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitEntry>,

    #[serde(default)]
    pub llm: LlmConfig,

    // --- Paths ---------------------------------------------------------------

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_command_dir")]
    pub command_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserialises via defaults")
    }
}

impl Config {
    /// Load configuration from a JSON file at `path`.
    ///
    /// Missing file is an error so the caller can decide whether defaults are
    /// acceptable; a malformed file is always an error (fatal per the error
    /// policy — the orchestrator refuses to start on an unreadable config).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.apply_env_overrides();

        info!(
            path = %path.display(),
            interval_minutes = config.monitoring_interval_minutes,
            broker_mode = %config.broker_mode,
            "config loaded"
        );

        Ok(config)
    }

    /// Environment variables take priority over file values for API keys.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("FRED_API_KEY") {
            if !key.is_empty() {
                self.fred_api_key = key;
            }
        }
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Validate ranges and cross-field consistency.
    ///
    /// Backs the `sentinel health` subcommand: returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.monitoring_interval_minutes == 0 || self.monitoring_interval_minutes > 120 {
            bail!(
                "monitoring_interval_minutes must be 1-120 (got {})",
                self.monitoring_interval_minutes
            );
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            bail!(
                "confidence_threshold must be 0.0-1.0 (got {})",
                self.confidence_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.max_position_pct) {
            bail!("max_position_pct must be 0.0-1.0 (got {})", self.max_position_pct);
        }
        if self.stop_loss_pct >= 0.0 {
            bail!("stop_loss_pct must be negative (got {})", self.stop_loss_pct);
        }
        if self.profit_target_pct <= 0.0 {
            bail!("profit_target_pct must be positive (got {})", self.profit_target_pct);
        }
        if !(0.0..=1.0).contains(&self.deduplication.similarity_threshold) {
            bail!(
                "deduplication.similarity_threshold must be 0.0-1.0 (got {})",
                self.deduplication.similarity_threshold
            );
        }
        if self.briefing_hour > 23 || self.briefing_minute > 59 {
            bail!(
                "briefing time {}:{:02} is not a valid wall-clock time",
                self.briefing_hour,
                self.briefing_minute
            );
        }
        for (name, channel) in &self.channels {
            if channel.enabled && channel.webhook_url.trim().is_empty() {
                bail!("channel '{name}' is enabled but has no webhook_url");
            }
        }
        for (endpoint, entry) in &self.rate_limits {
            if entry.rpm == 0 {
                bail!("rate_limits.{endpoint}.rpm must be >= 1");
            }
        }
        for tier in ["fast", "balanced", "reasoning"] {
            if !self.llm.tiers.contains_key(tier) {
                bail!("llm.tiers is missing the '{tier}' tier");
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.monitoring_interval_minutes, 15);
        assert_eq!(cfg.broker_mode, BrokerMode::SemiAuto);
        assert!((cfg.confidence_threshold - 0.70).abs() < f64::EPSILON);
        assert!((cfg.max_position_pct - 0.20).abs() < f64::EPSILON);
        assert_eq!(cfg.stale_days, 3);
        assert_eq!(cfg.max_watchlist_per_run, 10);
        assert!((cfg.stop_loss_pct + 0.03).abs() < f64::EPSILON);
        assert!((cfg.deduplication.similarity_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(cfg.briefing_hour, 16);
        assert_eq!(cfg.briefing_minute, 30);
        assert!(cfg.llm.tiers.contains_key("reasoning"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "broker_mode": "disabled", "monitoring_interval_minutes": 5 }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.broker_mode, BrokerMode::Disabled);
        assert_eq!(cfg.monitoring_interval_minutes, 5);
        assert_eq!(cfg.max_watchlist_per_run, 10);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_ranges() {
        let mut cfg = Config::default();
        cfg.confidence_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.stop_loss_pct = 0.03;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.monitoring_interval_minutes = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_enabled_channel_without_url() {
        let mut cfg = Config::default();
        cfg.channels.insert(
            "webhook".to_string(),
            ChannelConfig {
                enabled: true,
                webhook_url: String::new(),
                log_events: vec![],
            },
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.monitoring_interval_minutes, cfg2.monitoring_interval_minutes);
        assert_eq!(cfg.broker_mode, cfg2.broker_mode);
        assert_eq!(cfg.stale_days, cfg2.stale_days);
    }
}
