// =============================================================================
// News Sentiment Analyzer — lexicon scoring, crisis matching, urgency
// =============================================================================
//
// Pure, deterministic per-article analysis. The title is weighted 3x against
// the description so headline language dominates classification.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;

use crate::types::{CrisisCategory, Sentiment, Urgency};

use super::NewsArticle;

const BEARISH_KEYWORDS: &[&str] = &[
    "crash", "collapse", "crisis", "plunge", "plummet", "fear", "panic", "sell-off",
    "selloff", "tumble", "slump", "recession", "depression", "downturn", "bearish",
    "negative", "warning", "alert", "emergency", "concern", "worry", "risk", "threat",
    "decline", "fall", "drop",
];

const BULLISH_KEYWORDS: &[&str] = &[
    "rally", "surge", "soar", "recovery", "rebound", "deal", "agreement", "resolution",
    "bullish", "positive", "optimism", "growth", "gain", "rise", "climb", "advance",
    "breakthrough", "success", "profit", "strong", "robust", "improving", "upturn",
];

/// Keyword sets per crisis category. Matching is substring-based over the
/// weighted lowercase text.
fn crisis_keywords(category: CrisisCategory) -> &'static [&'static str] {
    match category {
        CrisisCategory::TechCrash => {
            &["tech", "valuation", "margin", "leverage", "overvalued", "correction"]
        }
        CrisisCategory::GeopoliticalTrade => {
            &["tariff", "trade war", "china", "supply chain", "sanctions"]
        }
        CrisisCategory::LiquidityCredit => {
            &["liquidity", "credit", "spread", "financial stress", "banking", "crisis"]
        }
        CrisisCategory::InflationRate => {
            &["inflation", "yield", "rate", "fed", "tightening", "bonds"]
        }
        CrisisCategory::PandemicHealth => {
            &["pandemic", "covid", "disease", "health", "lockdown", "epidemic"]
        }
        CrisisCategory::MarketCorrection => {
            &["correction", "selloff", "drawdown", "decline", "drop", "crash"]
        }
        CrisisCategory::Signal => &[],
    }
}

const MATCHABLE_CATEGORIES: &[CrisisCategory] = &[
    CrisisCategory::TechCrash,
    CrisisCategory::GeopoliticalTrade,
    CrisisCategory::LiquidityCredit,
    CrisisCategory::InflationRate,
    CrisisCategory::PandemicHealth,
    CrisisCategory::MarketCorrection,
];

/// Result of sentiment analysis on a single article.
#[derive(Debug, Clone, Serialize)]
pub struct SentimentResult {
    pub crisis_type: CrisisCategory,
    pub sentiment: Sentiment,
    pub urgency: Urgency,
    /// Crisis-pattern confidence, 0-100.
    pub confidence: f64,
    pub matched_keywords: Vec<String>,
    /// -100 (very bearish) to +100 (very bullish).
    pub sentiment_score: f64,
}

/// Aggregate analysis across a batch of articles.
#[derive(Debug, Clone, Serialize)]
pub struct BatchAnalysis {
    pub total_articles: usize,
    pub dominant_sentiment: Sentiment,
    pub dominant_crisis_type: CrisisCategory,
    pub breaking_count: usize,
    pub avg_confidence: f64,
    pub sentiment_distribution: HashMap<Sentiment, usize>,
    pub crisis_distribution: HashMap<CrisisCategory, usize>,
    pub results: Vec<SentimentResult>,
}

impl BatchAnalysis {
    fn empty() -> Self {
        Self {
            total_articles: 0,
            dominant_sentiment: Sentiment::Neutral,
            dominant_crisis_type: CrisisCategory::MarketCorrection,
            breaking_count: 0,
            avg_confidence: 0.0,
            sentiment_distribution: HashMap::new(),
            crisis_distribution: HashMap::new(),
            results: Vec::new(),
        }
    }
}

/// Analyzes news sentiment and matches articles to crisis patterns.
pub struct NewsSentimentAnalyzer {
    breaking_window_minutes: i64,
}

impl NewsSentimentAnalyzer {
    pub fn new(breaking_window_minutes: i64) -> Self {
        Self {
            breaking_window_minutes,
        }
    }

    pub fn analyze_article(&self, article: &NewsArticle) -> SentimentResult {
        let title = article.title.to_lowercase();
        let description = article.description.to_lowercase();
        // Title weighted 3x.
        let text = format!("{title} {title} {title} {description}");

        let (crisis_type, confidence, matched_keywords) = self.match_crisis_pattern(&text);
        let (sentiment, sentiment_score) = self.analyze_sentiment(&text);
        let urgency = self.classify_urgency(article, confidence);

        SentimentResult {
            crisis_type,
            sentiment,
            urgency,
            confidence,
            matched_keywords,
            sentiment_score,
        }
    }

    pub fn analyze_batch(&self, articles: &[NewsArticle]) -> BatchAnalysis {
        if articles.is_empty() {
            return BatchAnalysis::empty();
        }

        let results: Vec<SentimentResult> =
            articles.iter().map(|a| self.analyze_article(a)).collect();

        let mut sentiment_distribution: HashMap<Sentiment, usize> = HashMap::new();
        let mut crisis_distribution: HashMap<CrisisCategory, usize> = HashMap::new();
        for result in &results {
            *sentiment_distribution.entry(result.sentiment).or_insert(0) += 1;
            *crisis_distribution.entry(result.crisis_type).or_insert(0) += 1;
        }

        let dominant_sentiment = sentiment_distribution
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(s, _)| *s)
            .unwrap_or(Sentiment::Neutral);
        let dominant_crisis_type = crisis_distribution
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(c, _)| *c)
            .unwrap_or(CrisisCategory::MarketCorrection);

        let breaking_count = results.iter().filter(|r| r.urgency == Urgency::Breaking).count();
        let avg_confidence =
            results.iter().map(|r| r.confidence).sum::<f64>() / results.len() as f64;

        BatchAnalysis {
            total_articles: articles.len(),
            dominant_sentiment,
            dominant_crisis_type,
            breaking_count,
            avg_confidence,
            sentiment_distribution,
            crisis_distribution,
            results,
        }
    }

    fn match_crisis_pattern(&self, text: &str) -> (CrisisCategory, f64, Vec<String>) {
        let mut best: Option<(CrisisCategory, f64, Vec<String>)> = None;

        for &category in MATCHABLE_CATEGORIES {
            let matched: Vec<String> = crisis_keywords(category)
                .iter()
                .filter(|kw| text.contains(*kw))
                .map(|kw| kw.to_string())
                .collect();
            if matched.is_empty() {
                continue;
            }
            // More matches = higher score; distinct matches add a bonus.
            let score = ((matched.len() * 15 + matched.len() * 10) as f64).min(100.0);
            if best.as_ref().map(|(_, s, _)| score > *s).unwrap_or(true) {
                best = Some((category, score, matched));
            }
        }

        best.unwrap_or((CrisisCategory::MarketCorrection, 30.0, Vec::new()))
    }

    fn analyze_sentiment(&self, text: &str) -> (Sentiment, f64) {
        let bearish = BEARISH_KEYWORDS.iter().filter(|kw| text.contains(*kw)).count() as f64;
        let bullish = BULLISH_KEYWORDS.iter().filter(|kw| text.contains(*kw)).count() as f64;

        let word_count = text.split_whitespace().count();
        if word_count == 0 {
            return (Sentiment::Neutral, 0.0);
        }

        let score = ((bullish - bearish) / (word_count as f64 * 0.01).max(1.0)) * 100.0;
        let score = score.clamp(-100.0, 100.0);

        let label = if score < -20.0 {
            Sentiment::Bearish
        } else if score > 20.0 {
            Sentiment::Bullish
        } else {
            Sentiment::Neutral
        };
        (label, score)
    }

    fn classify_urgency(&self, article: &NewsArticle, crisis_confidence: f64) -> Urgency {
        let age_minutes = (Utc::now() - article.published_at).num_minutes();

        if age_minutes <= self.breaking_window_minutes && crisis_confidence >= 70.0 {
            Urgency::Breaking
        } else if age_minutes <= 120 && crisis_confidence >= 50.0 {
            Urgency::High
        } else {
            Urgency::Routine
        }
    }
}

impl Default for NewsSentimentAnalyzer {
    fn default() -> Self {
        Self::new(30)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fresh_article(title: &str, description: &str) -> NewsArticle {
        NewsArticle {
            title: title.to_string(),
            description: description.to_string(),
            source: "Reuters".to_string(),
            published_at: Utc::now() - Duration::minutes(5),
            url: "https://example.com/x".to_string(),
            relevance_score: 90.0,
        }
    }

    #[test]
    fn bearish_crisis_article_classified_breaking() {
        let analyzer = NewsSentimentAnalyzer::default();
        let article = fresh_article(
            "Markets plunge as banking crisis fears spread",
            "Credit spreads widen amid liquidity crisis and financial stress across banking sector",
        );
        let result = analyzer.analyze_article(&article);
        assert_eq!(result.sentiment, Sentiment::Bearish);
        assert_eq!(result.crisis_type, CrisisCategory::LiquidityCredit);
        assert_eq!(result.urgency, Urgency::Breaking);
        assert!(result.confidence >= 70.0);
        assert!(result.sentiment_score < -20.0);
    }

    #[test]
    fn bullish_article_scores_positive() {
        let analyzer = NewsSentimentAnalyzer::default();
        let article = fresh_article(
            "Stocks rally on strong earnings growth",
            "Broad market surge as recovery optimism builds",
        );
        let result = analyzer.analyze_article(&article);
        assert_eq!(result.sentiment, Sentiment::Bullish);
        assert!(result.sentiment_score > 20.0);
    }

    #[test]
    fn stale_article_is_routine_urgency() {
        let analyzer = NewsSentimentAnalyzer::default();
        let mut article = fresh_article(
            "Emergency Fed intervention amid market crisis",
            "Liquidity crisis deepens as banking stress spreads",
        );
        article.published_at = Utc::now() - Duration::hours(6);
        let result = analyzer.analyze_article(&article);
        assert_eq!(result.urgency, Urgency::Routine);
    }

    #[test]
    fn batch_aggregates_dominant_labels() {
        let analyzer = NewsSentimentAnalyzer::default();
        let articles = vec![
            fresh_article(
                "Fed rate hike fuels inflation fears",
                "Bond yields surge as the fed signals further tightening",
            ),
            fresh_article(
                "Inflation warning: rates to stay higher",
                "Fed policy path points to more rate pressure on bonds",
            ),
            fresh_article("Tech selloff deepens", "Valuation concerns hit overvalued tech names"),
        ];
        let batch = analyzer.analyze_batch(&articles);
        assert_eq!(batch.total_articles, 3);
        assert_eq!(batch.dominant_crisis_type, CrisisCategory::InflationRate);
        assert!(batch.avg_confidence > 0.0);
        assert_eq!(batch.results.len(), 3);
    }

    #[test]
    fn empty_batch_is_neutral() {
        let analyzer = NewsSentimentAnalyzer::default();
        let batch = analyzer.analyze_batch(&[]);
        assert_eq!(batch.total_articles, 0);
        assert_eq!(batch.dominant_sentiment, Sentiment::Neutral);
        assert_eq!(batch.breaking_count, 0);
    }
}
