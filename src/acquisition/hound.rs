// =============================================================================
// Hound — Grok-powered momentum/squeeze candidate scanner
// =============================================================================
//
// Triggered by the `hunt` command only; never on the scheduler cadence.
// Grok's real-time X visibility is asked for squeeze-shaped setups, the
// candidates are persisted, and each ticker is queued on the watchlist with
// source `grok_hound` so the normal pipeline vets it like any other idea.
// =============================================================================

use std::sync::Arc;

use chrono::Local;
use serde_json::json;
use tracing::{info, warn};

use crate::llm::grok::GrokClient;
use crate::llm::parse::{i64_field, parse_json_response, str_field, string_list};
use crate::store::acquisition::WatchSource;
use crate::store::Store;

const HOUND_SYSTEM_PROMPT: &str = r#"
You are an elite high-alpha and short-squeeze opportunity hunter for a
paper-trading system. Output STRICT JSON only.

TASK: scan real-time X chatter for squeeze-shaped setups: chatter velocity +
high short interest + low float + retail frenzy + a concrete catalyst.
Score 0-100 on squeeze potential. US equities only; ignore pure crypto.

Respond with ONLY valid JSON in this structure:
{
  "candidates": [
    {
      "ticker": "SYMBOL",
      "meme_score": 0,
      "thesis": "brief thesis",
      "signals": ["chatter spike", "high short interest"],
      "risks": ["dilution", "pump and dump"],
      "action_suggestion": "add_to_watch|monitor|buy_small"
    }
  ],
  "hound_mood": "aggressive|cautious|neutral",
  "market_chatter_summary": "1-sentence summary of retail sentiment"
}
"#;

/// Result of one hunt.
#[derive(Debug, Clone)]
pub struct HuntResult {
    pub candidates: Vec<String>,
    pub queued: Vec<String>,
    pub mood: String,
    pub chatter_summary: String,
}

impl HuntResult {
    fn empty() -> Self {
        Self {
            candidates: Vec::new(),
            queued: Vec::new(),
            mood: "neutral".to_string(),
            chatter_summary: String::new(),
        }
    }
}

pub struct Hound {
    store: Arc<Store>,
    client: GrokClient,
}

impl Hound {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            client: GrokClient::new(),
        }
    }

    /// Run one scan with the current system state as context.
    pub async fn hunt(&self, defcon_level: u8, macro_score: f64) -> HuntResult {
        if !self.client.is_configured() {
            warn!("hound skipped — XAI_API_KEY not set");
            return HuntResult::empty();
        }
        info!("hound: scanning for high-alpha setups");

        let payload = json!({
            "current_defcon": defcon_level,
            "macro_score": macro_score,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        let (text, in_tokens, out_tokens) = self
            .client
            .call(&payload.to_string(), HOUND_SYSTEM_PROMPT, 0.3)
            .await;

        let Some(text) = text else {
            warn!("hound returned empty-handed");
            return HuntResult::empty();
        };

        let value = parse_json_response(&text);
        let candidates = value
            .get("candidates")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut result = HuntResult {
            candidates: Vec::new(),
            queued: Vec::new(),
            mood: str_field(&value, "hound_mood"),
            chatter_summary: str_field(&value, "market_chatter_summary"),
        };

        let date = Local::now().format("%Y-%m-%d").to_string();
        for candidate in &candidates {
            let ticker = str_field(candidate, "ticker").trim().to_uppercase();
            if ticker.is_empty() {
                continue;
            }
            let meme_score = i64_field(candidate, "meme_score", 0);
            let thesis = str_field(candidate, "thesis");
            let action = str_field(candidate, "action_suggestion");

            if let Err(e) = self.store.insert_hound_candidate(
                &ticker,
                meme_score,
                &thesis,
                &serde_json::to_string(&string_list(candidate, "signals")).unwrap_or_default(),
                &serde_json::to_string(&string_list(candidate, "risks")).unwrap_or_default(),
                &action,
            ) {
                warn!(ticker = %ticker, error = %e, "hound candidate save failed");
            }
            result.candidates.push(ticker.clone());

            // Only conviction candidates go onto the watchlist; the rest are
            // logged for the operator.
            if action == "add_to_watch" || meme_score >= 70 {
                let confidence = (meme_score as f64 / 100.0).clamp(0.0, 1.0);
                if self
                    .store
                    .queue_watchlist(
                        &date,
                        &ticker,
                        WatchSource::GrokHound,
                        confidence,
                        &thesis,
                        "Queued by hound scan",
                    )
                    .is_ok()
                {
                    result.queued.push(ticker);
                }
            }
        }

        info!(
            found = result.candidates.len(),
            queued = result.queued.len(),
            mood = %result.mood,
            in_tokens,
            out_tokens,
            "hound: scan complete"
        );
        result
    }
}
