// =============================================================================
// Grok Client — xAI REST API for the hound scanner
// =============================================================================
//
// Separate provider from the main gateway: the hound wants real-time X
// chatter, which only Grok sees. Same (text, tokens) contract as the
// gateway so callers parse responses identically.
// =============================================================================

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, error};

const XAI_API_URL: &str = "https://api.x.ai/v1/chat/completions";
const XAI_MODEL: &str = "grok-3";

pub struct GrokClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GrokClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("failed to build reqwest client"),
            api_key: std::env::var("XAI_API_KEY").unwrap_or_default(),
            model: XAI_MODEL.to_string(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// One chat completion. Returns (text, input_tokens, output_tokens);
    /// text is None on any failure.
    pub async fn call(
        &self,
        prompt: &str,
        system_prompt: &str,
        temperature: f64,
    ) -> (Option<String>, i64, i64) {
        if self.api_key.is_empty() {
            debug!("Grok skipped — no XAI_API_KEY set");
            return (None, 0, 0);
        }

        let payload = json!({
            "model": self.model,
            "temperature": temperature,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": prompt },
            ],
        });

        let response = match self
            .client
            .post(XAI_API_URL)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                error!(error = %e, "Grok request failed");
                return (None, 0, 0);
            }
        };
        if !response.status().is_success() {
            error!(status = %response.status(), "Grok request rejected");
            return (None, 0, 0);
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Grok response decode failed");
                return (None, 0, 0);
            }
        };

        let text = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let input_tokens = body
            .pointer("/usage/prompt_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let output_tokens = body
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);

        (text, input_tokens, output_tokens)
    }
}

impl Default for GrokClient {
    fn default() -> Self {
        Self::new()
    }
}
