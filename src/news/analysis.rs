// =============================================================================
// News LLM Triage — gated fast-tier and reasoning-tier analysis
// =============================================================================
//
// The gate exists to bound cost: a cycle with no new content produces ZERO
// model calls.
//
//   fast tier runs when:      new articles > 0  OR  breaking  OR  DEFCON changed
//   reasoning tier also needs: score >= trigger OR breaking >= 2 OR DEFCON changed
//
// Both layers persist an LLM Analysis Record against the news-signal row;
// the reasoning record's enhanced_confidence / confidence_adjustment feed
// the DEFCON hard overrides next cycle.
// =============================================================================

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::llm::parse::{f64_field, parse_failed, str_field, string_list};
use crate::llm::{LlmGateway, LlmTier};
use crate::store::signals::{LlmAnalysisInsert, ReasoningAdjustment};
use crate::store::Store;
use crate::types::clamp_defcon;

use super::signal::NewsSignal;

/// Why an analysis ran; persisted with the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Elevated,
    Breaking,
    Scheduled,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Elevated => "elevated",
            Self::Breaking => "breaking",
            Self::Scheduled => "scheduled",
        }
    }
}

/// Fast-tier gate.
pub fn should_run_fast(new_article_count: usize, breaking: bool, defcon_changed: bool) -> bool {
    new_article_count > 0 || breaking || defcon_changed
}

pub struct NewsAnalyzer {
    llm: Arc<LlmGateway>,
    store: Arc<Store>,
    pro_trigger_score: f64,
}

impl NewsAnalyzer {
    pub fn new(llm: Arc<LlmGateway>, store: Arc<Store>, pro_trigger_score: f64) -> Self {
        Self {
            llm,
            store,
            pro_trigger_score,
        }
    }

    /// Reasoning-tier gate (in addition to the fast gate having passed).
    pub fn should_run_reasoning(
        &self,
        news_score: f64,
        breaking_count: usize,
        defcon_changed: bool,
    ) -> bool {
        news_score >= self.pro_trigger_score || breaking_count >= 2 || defcon_changed
    }

    fn trigger_kind(&self, signal: &NewsSignal) -> TriggerKind {
        if signal.breaking_news_override {
            TriggerKind::Breaking
        } else if signal.news_score >= self.pro_trigger_score {
            TriggerKind::Elevated
        } else {
            TriggerKind::Scheduled
        }
    }

    /// Fast-tier triage: narrative coherence and an action lean. Cheap,
    /// attached to the news-signal row for briefing context.
    pub async fn run_fast_analysis(
        &self,
        signal: &NewsSignal,
        news_signal_id: i64,
    ) -> Option<Value> {
        let prompt = build_fast_prompt(signal);
        let response = self.llm.call(LlmTier::Fast, &prompt, "news_fast").await;
        let value = response.parse_json();
        if parse_failed(&value) {
            warn!("fast news analysis unparseable — skipped");
            return None;
        }

        if let Err(e) = self.store.attach_fast_analysis(news_signal_id, &value.to_string()) {
            warn!(error = %e, "fast analysis attach failed");
        }
        let _ = self.store.insert_llm_analysis(&LlmAnalysisInsert {
            news_signal_id,
            tier: LlmTier::Fast.as_str().to_string(),
            model: response.model.clone(),
            trigger_kind: self.trigger_kind(signal).as_str().to_string(),
            narrative_coherence: f64_field(&value, "narrative_coherence", 0.0),
            hidden_risks_json: serde_json::to_string(&string_list(&value, "hidden_risks"))
                .unwrap_or_default(),
            recommended_action: str_field(&value, "recommended_action"),
            reasoning: str_field(&value, "reasoning"),
            enhanced_confidence: 0.0,
            confidence_adjustment: 0.0,
            defcon_recommendation: None,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
        });

        info!(
            action = %str_field(&value, "recommended_action"),
            coherence = f64_field(&value, "narrative_coherence", 0.0),
            "fast news analysis complete"
        );
        Some(value)
    }

    /// Reasoning-tier deep analysis on elevated signals. The parsed
    /// adjustment is what the DEFCON engine consumes.
    pub async fn run_reasoning_analysis(
        &self,
        signal: &NewsSignal,
        news_signal_id: i64,
        current_defcon: u8,
        open_position_count: usize,
        fast_analysis: Option<&Value>,
    ) -> Option<ReasoningAdjustment> {
        let prompt = build_reasoning_prompt(signal, current_defcon, open_position_count, fast_analysis);
        let response = self.llm.call(LlmTier::Reasoning, &prompt, "news_reasoning").await;
        let value = response.parse_json();
        if parse_failed(&value) {
            warn!("reasoning news analysis unparseable — skipped");
            return None;
        }

        let enhanced_confidence = f64_field(&value, "enhanced_confidence", 0.0);
        let confidence_adjustment = f64_field(&value, "confidence_adjustment", 0.0);
        let defcon_recommendation = value
            .get("defcon_recommendation")
            .and_then(Value::as_i64)
            .map(clamp_defcon);

        let _ = self.store.insert_llm_analysis(&LlmAnalysisInsert {
            news_signal_id,
            tier: LlmTier::Reasoning.as_str().to_string(),
            model: response.model.clone(),
            trigger_kind: self.trigger_kind(signal).as_str().to_string(),
            narrative_coherence: f64_field(&value, "narrative_coherence", 0.0),
            hidden_risks_json: serde_json::to_string(&string_list(&value, "hidden_risks"))
                .unwrap_or_default(),
            recommended_action: str_field(&value, "recommended_action"),
            reasoning: str_field(&value, "reasoning"),
            enhanced_confidence,
            confidence_adjustment,
            defcon_recommendation,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
        });

        info!(
            enhanced_confidence,
            confidence_adjustment,
            defcon_recommendation = ?defcon_recommendation,
            action = %str_field(&value, "recommended_action"),
            "reasoning news analysis complete"
        );

        Some(ReasoningAdjustment {
            enhanced_confidence,
            confidence_adjustment,
            recommended_action: str_field(&value, "recommended_action"),
            reasoning: str_field(&value, "reasoning"),
        })
    }
}

fn article_lines(signal: &NewsSignal, limit: usize) -> String {
    signal
        .contributing_articles
        .iter()
        .take(limit)
        .map(|a| {
            format!(
                "- [{} | {} | conf {:.0}] {}: {}",
                a.source,
                a.urgency,
                a.confidence,
                a.title,
                a.description.chars().take(200).collect::<String>()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_fast_prompt(signal: &NewsSignal) -> String {
    format!(
        "You are a market-news triage analyst. Assess this scored news batch quickly.\n\
         \n\
         News score: {:.1}/100 | Crisis type: {} | Sentiment: {}\n\
         Score components: {}\n\
         \n\
         ARTICLES\n{}\n\
         \n\
         Respond with ONLY valid JSON:\n\
         {{\n\
           \"narrative_coherence\": 0.0,\n\
           \"hidden_risks\": [\"...\"],\n\
           \"dominant_theme\": \"...\",\n\
           \"confidence_in_signal\": 0.0,\n\
           \"recommended_action\": \"BUY|HOLD|SELL|WAIT\",\n\
           \"reasoning\": \"2-3 sentences\"\n\
         }}",
        signal.news_score,
        signal.dominant_crisis_type,
        signal.sentiment_summary,
        serde_json::to_string(&signal.score_components).unwrap_or_default(),
        article_lines(signal, 10),
    )
}

fn build_reasoning_prompt(
    signal: &NewsSignal,
    current_defcon: u8,
    open_position_count: usize,
    fast_analysis: Option<&Value>,
) -> String {
    let fast_text = fast_analysis
        .map(|v| v.to_string())
        .unwrap_or_else(|| "none".to_string());

    format!(
        "You are the deep-analysis layer of an autonomous trading monitor. This analysis\n\
         was triggered because the news signal exceeded the alert threshold.\n\
         \n\
         SYSTEM STATE\n\
         Current DEFCON: {current_defcon}/5 (1 = highest alert)\n\
         Open paper positions: {open_position_count}\n\
         News score: {:.1}/100 | Crisis type: {} | Sentiment: {}\n\
         Breaking articles: {}\n\
         \n\
         FAST PRE-ANALYSIS\n{fast_text}\n\
         \n\
         ALL ARTICLES\n{}\n\
         \n\
         Provide a comprehensive risk analysis. `enhanced_confidence` is your 0-100\n\
         confidence that this news signal is REAL and actionable; `confidence_adjustment`\n\
         is how many points the automated score should move (negative = the automated\n\
         signal is overblown).\n\
         \n\
         Respond with ONLY valid JSON:\n\
         {{\n\
           \"narrative_coherence\": 0.0,\n\
           \"hidden_risks\": [\"...\", \"...\"],\n\
           \"market_context\": \"3-5 sentences\",\n\
           \"enhanced_confidence\": 0.0,\n\
           \"confidence_adjustment\": 0.0,\n\
           \"recommended_action\": \"BUY|HOLD|SELL|WAIT\",\n\
           \"defcon_recommendation\": {current_defcon},\n\
           \"reasoning\": \"4-6 sentence chain of thought\"\n\
         }}",
        signal.news_score,
        signal.dominant_crisis_type,
        signal.sentiment_summary,
        signal.breaking_count,
        article_lines(signal, 20),
    )
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn analyzer() -> NewsAnalyzer {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let llm = Arc::new(LlmGateway::new(&Config::default(), store.clone()));
        NewsAnalyzer::new(llm, store, 40.0)
    }

    #[test]
    fn fast_gate_requires_new_content() {
        // The zero-new-content case MUST produce zero LLM calls.
        assert!(!should_run_fast(0, false, false));
        assert!(should_run_fast(1, false, false));
        assert!(should_run_fast(0, true, false));
        assert!(should_run_fast(0, false, true));
    }

    #[test]
    fn reasoning_gate_thresholds() {
        let analyzer = analyzer();
        assert!(!analyzer.should_run_reasoning(39.9, 1, false));
        assert!(analyzer.should_run_reasoning(40.0, 0, false));
        assert!(analyzer.should_run_reasoning(0.0, 2, false));
        assert!(analyzer.should_run_reasoning(0.0, 0, true));
    }

    #[test]
    fn trigger_kind_classification() {
        let analyzer = analyzer();

        let mut signal = NewsSignal::empty();
        signal.news_score = 55.0;
        assert_eq!(analyzer.trigger_kind(&signal), TriggerKind::Elevated);

        signal.breaking_news_override = true;
        assert_eq!(analyzer.trigger_kind(&signal), TriggerKind::Breaking);

        let quiet = NewsSignal::empty();
        assert_eq!(analyzer.trigger_kind(&quiet), TriggerKind::Scheduled);
    }

    #[test]
    fn prompts_embed_signal_state() {
        let mut signal = NewsSignal::empty();
        signal.news_score = 62.5;
        let fast = build_fast_prompt(&signal);
        assert!(fast.contains("62.5"));
        assert!(fast.contains("recommended_action"));

        let deep = build_reasoning_prompt(&signal, 3, 2, None);
        assert!(deep.contains("Current DEFCON: 3/5"));
        assert!(deep.contains("enhanced_confidence"));
        assert!(deep.contains("confidence_adjustment"));
    }
}
