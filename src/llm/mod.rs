// =============================================================================
// LLM Gateway — three reasoning tiers, OAuth-CLI-first auth, quota accounting
// =============================================================================
//
// Tiers:
//   fast      — no reasoning budget; verifier and per-cycle news triage
//   balanced  — moderate reasoning; downgrade target when reasoning blocks
//   reasoning — dynamic budget; analyst, daily briefing, deep news analysis
//
// Auth priority: a locally authenticated `gemini` CLI (subscription path,
// no per-token cost) is used when present; failures silently fall through
// to the key-based REST API. Callers cannot tell which path served them.
//
// Quota: every call is logged to the store. `check_quota` evaluates the
// rolling 24h token total against the configured soft limit. The gateway
// NEVER downgrades a call itself — callers hold the intent and decide.
// =============================================================================

pub mod grok;
pub mod parse;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::{Config, LlmConfig, LlmTierConfig};
use crate::store::Store;

/// Hard timeout on any single model call, CLI or REST.
const CALL_TIMEOUT: Duration = Duration::from_secs(180);

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Fraction of the soft limit at which callers should start worrying.
const QUOTA_WARN_FRACTION: f64 = 0.80;
/// Fraction at which callers MUST downgrade.
const QUOTA_BLOCK_FRACTION: f64 = 0.95;

/// The three reasoning tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmTier {
    Fast,
    Balanced,
    Reasoning,
}

impl LlmTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Reasoning => "reasoning",
        }
    }

    /// The tier a blocked caller downgrades to.
    pub fn next_cheaper(&self) -> Option<Self> {
        match self {
            Self::Reasoning => Some(Self::Balanced),
            Self::Balanced => Some(Self::Fast),
            Self::Fast => None,
        }
    }
}

impl std::fmt::Display for LlmTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rolling-window quota verdict for a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaStatus {
    Ok,
    Warn,
    Block,
}

/// Result of one gateway call. `text == None` signals failure.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: Option<String>,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl LlmResponse {
    fn failed(model: &str) -> Self {
        Self {
            text: None,
            model: model.to_string(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Parse the response body as JSON (sentinel on failure or empty text).
    pub fn parse_json(&self) -> Value {
        match &self.text {
            Some(text) => parse::parse_json_response(text),
            None => json!({ "parse_failed": true }),
        }
    }
}

/// Uniform call interface across providers and tiers.
pub struct LlmGateway {
    client: reqwest::Client,
    store: Arc<Store>,
    config: LlmConfig,
    api_key: String,
    /// Cached CLI probe: None = not probed yet; Some(None) = unusable.
    cli_path: Mutex<Option<Option<PathBuf>>>,
}

impl LlmGateway {
    pub fn new(config: &Config, store: Arc<Store>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            store,
            config: config.llm.clone(),
            api_key: std::env::var("GEMINI_API_KEY").unwrap_or_default(),
            cli_path: Mutex::new(None),
        }
    }

    fn tier_config(&self, tier: LlmTier) -> LlmTierConfig {
        self.config
            .tiers
            .get(tier.as_str())
            .cloned()
            .unwrap_or_else(|| LlmTierConfig {
                model_id: "gemini-2.5-flash".to_string(),
                thinking_budget: 0,
                max_output_tokens: 8192,
                temperature: 0.4,
            })
    }

    // -------------------------------------------------------------------------
    // Main call interface
    // -------------------------------------------------------------------------

    /// Call the model behind `tier`. Auth selection is automatic and
    /// transparent; usage is logged whatever the outcome path.
    pub async fn call(&self, tier: LlmTier, prompt: &str, caller: &str) -> LlmResponse {
        let cfg = self.tier_config(tier);

        let mut response = match self.cli_binary() {
            Some(cli) => match self.call_via_cli(&cli, prompt, &cfg).await {
                Some(ok) => ok,
                None => {
                    warn!(tier = %tier, "CLI call failed, falling back to REST API");
                    self.call_via_api(prompt, &cfg).await
                }
            },
            None => self.call_via_api(prompt, &cfg).await,
        };
        response.model = cfg.model_id.clone();

        if let Err(e) = self.store.log_llm_usage(
            tier.as_str(),
            &cfg.model_id,
            caller,
            response.input_tokens,
            response.output_tokens,
        ) {
            warn!(error = %e, "failed to log LLM usage");
        }

        debug!(
            tier = %tier,
            caller,
            ok = response.text.is_some(),
            in_tokens = response.input_tokens,
            out_tokens = response.output_tokens,
            "gateway call complete"
        );
        response
    }

    // -------------------------------------------------------------------------
    // Quota accounting
    // -------------------------------------------------------------------------

    /// Evaluate the rolling 24h token spend for `tier` against its soft
    /// limit. Callers seeing `Block` must downgrade or skip.
    pub fn check_quota(&self, tier: LlmTier) -> QuotaStatus {
        let Some(&limit) = self.config.quota_soft_limits.get(tier.as_str()) else {
            return QuotaStatus::Ok;
        };
        if limit == 0 {
            return QuotaStatus::Ok;
        }
        let used = self.store.llm_tokens_last_24h(tier.as_str()).unwrap_or(0);
        let fraction = used as f64 / limit as f64;

        if fraction >= QUOTA_BLOCK_FRACTION {
            warn!(tier = %tier, used, limit, "quota BLOCK — callers must downgrade");
            QuotaStatus::Block
        } else if fraction >= QUOTA_WARN_FRACTION {
            warn!(tier = %tier, used, limit, "quota warning");
            QuotaStatus::Warn
        } else {
            QuotaStatus::Ok
        }
    }

    // -------------------------------------------------------------------------
    // CLI path (OAuth subscription — free tier)
    // -------------------------------------------------------------------------

    /// The CLI is usable when the `gemini` binary is on PATH and OAuth creds
    /// with a refresh token exist. Probed once and cached.
    fn cli_binary(&self) -> Option<PathBuf> {
        let mut cached = self.cli_path.lock();
        if let Some(probe) = cached.as_ref() {
            return probe.clone();
        }

        let probe = (|| {
            let binary = find_in_path("gemini")?;
            let creds = dirs_home()?.join(".gemini").join("oauth_creds.json");
            let content = std::fs::read_to_string(creds).ok()?;
            let json: Value = serde_json::from_str(&content).ok()?;
            json.get("refresh_token")?.as_str().filter(|t| !t.is_empty())?;
            debug!(binary = %binary.display(), "gemini CLI authenticated");
            Some(binary)
        })();

        if probe.is_none() {
            debug!("gemini CLI unavailable — REST API only");
        }
        *cached = Some(probe.clone());
        probe
    }

    async fn call_via_cli(
        &self,
        binary: &PathBuf,
        prompt: &str,
        cfg: &LlmTierConfig,
    ) -> Option<LlmResponse> {
        let output = tokio::time::timeout(
            CALL_TIMEOUT,
            tokio::process::Command::new(binary)
                .arg("-p")
                .arg(prompt)
                .arg("--model")
                .arg(&cfg.model_id)
                .arg("--output-format")
                .arg("json")
                // Blank API key forces the OAuth path.
                .env("GEMINI_API_KEY", "")
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let output = match output {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                error!(error = %e, "CLI spawn failed");
                return None;
            }
            Err(_) => {
                error!("CLI call timed out after 180s");
                return None;
            }
        };

        if !output.status.success() {
            warn!(
                code = output.status.code().unwrap_or(-1),
                stderr = %String::from_utf8_lossy(&output.stderr).chars().take(200).collect::<String>(),
                "CLI exited non-zero"
            );
            return None;
        }

        let body: Value = serde_json::from_slice(&output.stdout).ok()?;
        let text = body.get("response")?.as_str()?.trim().to_string();
        if text.is_empty() {
            warn!("CLI returned empty response");
            return None;
        }

        let tokens = body
            .pointer(&format!("/stats/models/{}/tokens", cfg.model_id))
            .cloned()
            .unwrap_or(Value::Null);
        let input_tokens = tokens
            .get("input")
            .or_else(|| tokens.get("prompt"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let output_tokens = tokens.get("candidates").and_then(Value::as_i64).unwrap_or(0);

        Some(LlmResponse {
            text: Some(text),
            model: cfg.model_id.clone(),
            input_tokens,
            output_tokens,
        })
    }

    // -------------------------------------------------------------------------
    // REST path (key-based fallback)
    // -------------------------------------------------------------------------

    async fn call_via_api(&self, prompt: &str, cfg: &LlmTierConfig) -> LlmResponse {
        if self.api_key.is_empty() {
            debug!("REST API skipped — no GEMINI_API_KEY set");
            return LlmResponse::failed(&cfg.model_id);
        }

        let url = format!(
            "{GEMINI_API_BASE}/{}:generateContent?key={}",
            cfg.model_id, self.api_key
        );

        let mut generation_config = json!({
            "temperature": cfg.temperature,
            "maxOutputTokens": cfg.max_output_tokens,
        });
        if cfg.thinking_budget != 0 {
            generation_config["thinkingConfig"] = json!({ "thinkingBudget": cfg.thinking_budget });
        }

        let payload = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": generation_config,
        });

        let response = match self.client.post(&url).json(&payload).send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!(model = %cfg.model_id, error = %e, "REST call failed");
                return LlmResponse::failed(&cfg.model_id);
            }
        };
        if !response.status().is_success() {
            error!(model = %cfg.model_id, status = %response.status(), "REST call rejected");
            return LlmResponse::failed(&cfg.model_id);
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "REST response decode failed");
                return LlmResponse::failed(&cfg.model_id);
            }
        };

        let parts = body
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        // Internal thought parts are filtered out of the returned text.
        let text: String = parts
            .iter()
            .filter(|p| !p.get("thought").and_then(Value::as_bool).unwrap_or(false))
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect();
        let text = text.trim().to_string();

        let usage = body.get("usageMetadata").cloned().unwrap_or(Value::Null);
        let input_tokens = usage.get("promptTokenCount").and_then(Value::as_i64).unwrap_or(0);
        let output_tokens =
            usage.get("candidatesTokenCount").and_then(Value::as_i64).unwrap_or(0);

        if text.is_empty() {
            warn!(
                model = %cfg.model_id,
                finish = %parse::str_field(&body, "finishReason"),
                "REST returned empty output"
            );
            return LlmResponse {
                text: None,
                model: cfg.model_id.clone(),
                input_tokens,
                output_tokens,
            };
        }

        info!(
            model = %cfg.model_id,
            in_tokens = input_tokens,
            out_tokens = output_tokens,
            "REST call succeeded"
        );
        LlmResponse {
            text: Some(text),
            model: cfg.model_id.clone(),
            input_tokens,
            output_tokens,
        }
    }
}

/// Locate an executable on PATH.
fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn gateway_with_limits(reasoning_limit: u64) -> LlmGateway {
        let mut config = Config::default();
        config
            .llm
            .quota_soft_limits
            .insert("reasoning".to_string(), reasoning_limit);
        let store = Arc::new(Store::open_in_memory().unwrap());
        LlmGateway::new(&config, store)
    }

    #[test]
    fn tier_downgrade_chain() {
        assert_eq!(LlmTier::Reasoning.next_cheaper(), Some(LlmTier::Balanced));
        assert_eq!(LlmTier::Balanced.next_cheaper(), Some(LlmTier::Fast));
        assert_eq!(LlmTier::Fast.next_cheaper(), None);
    }

    #[test]
    fn quota_thresholds() {
        let gateway = gateway_with_limits(1000);

        assert_eq!(gateway.check_quota(LlmTier::Reasoning), QuotaStatus::Ok);

        gateway.store.log_llm_usage("reasoning", "m", "test", 700, 100).unwrap();
        assert_eq!(gateway.check_quota(LlmTier::Reasoning), QuotaStatus::Warn);

        gateway.store.log_llm_usage("reasoning", "m", "test", 150, 10).unwrap();
        assert_eq!(gateway.check_quota(LlmTier::Reasoning), QuotaStatus::Block);
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let gateway = gateway_with_limits(0);
        gateway.store.log_llm_usage("reasoning", "m", "test", 10_000, 500).unwrap();
        assert_eq!(gateway.check_quota(LlmTier::Reasoning), QuotaStatus::Ok);
    }

    #[test]
    fn failed_response_parses_to_sentinel() {
        let response = LlmResponse::failed("model-x");
        assert!(parse::parse_failed(&response.parse_json()));
    }
}
