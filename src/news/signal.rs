// =============================================================================
// News Signal Generator — composite score and DEFCON override recommendation
// =============================================================================
//
// Turns a deduplicated article batch plus its sentiment analysis into one
// News Signal row. The composite score is a weighted sum of five components;
// the weights are part of the persisted record so historical scores stay
// auditable when weights change.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{CrisisCategory, Sentiment, Urgency};

use super::sentiment::{BatchAnalysis, NewsSentimentAnalyzer};
use super::NewsArticle;

const WEIGHT_SENTIMENT_NET: f64 = 0.35;
const WEIGHT_CONCENTRATION: f64 = 0.25;
const WEIGHT_URGENCY: f64 = 0.20;
const WEIGHT_SOURCE_CONFIDENCE: f64 = 0.15;
const WEIGHT_SPECIFICITY: f64 = 0.05;

/// Crisis-specific language worth 20 points per distinct hit.
const HIGH_SPECIFICITY: &[&str] = &[
    "emergency", "circuit breaker", "bank run", "sovereign default", "systemic",
    "contagion", "margin call", "liquidity crunch", "flash crash", "halt",
    "intervention", "bailout", "bankruptcy",
];

/// Generic crisis language worth 5 points per distinct hit.
const MED_SPECIFICITY: &[&str] = &[
    "crisis", "crash", "plunge", "collapse", "panic", "recession", "selloff", "slump",
    "tumble", "plummet", "fear", "warning",
];

/// Keywords tracked in the per-batch histogram.
const TRACKED_KEYWORDS: &[&str] = &[
    "emergency", "crisis", "crash", "collapse", "recession", "panic", "selloff",
    "plunge", "rate", "fed", "inflation", "yield", "tariff", "china", "sanctions",
    "liquidity", "credit", "banking", "correction", "bearish", "warning", "risk",
    "threat", "decline", "volatility", "rally", "surge", "recovery", "growth",
    "bullish", "optimism",
];

/// Per-component breakdown of the composite news score.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub sentiment_net: f64,
    pub signal_concentration: f64,
    pub urgency_premium: f64,
    pub source_confidence: f64,
    pub keyword_specificity: f64,
    pub final_score: f64,
}

/// One article as persisted in a news signal's structured blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributingArticle {
    pub title: String,
    pub description: String,
    pub source: String,
    pub published_at: String,
    pub url: String,
    pub sentiment: String,
    pub urgency: String,
    pub confidence: f64,
    pub crisis_type: String,
}

/// Output of one news-signal generation pass, ready for persistence and for
/// the DEFCON engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsSignal {
    pub news_score: f64,
    pub dominant_crisis_type: CrisisCategory,
    pub crisis_description: String,
    pub breaking_news_override: bool,
    pub recommended_defcon: Option<u8>,
    pub contributing_articles: Vec<ContributingArticle>,
    pub sentiment_summary: String,
    pub article_count: usize,
    pub breaking_count: usize,
    pub avg_confidence: f64,
    pub score_components: ScoreComponents,
    pub crisis_distribution: HashMap<String, usize>,
    pub keyword_hits: HashMap<String, usize>,
}

impl NewsSignal {
    /// The empty-batch variant — still persisted so the timeline stays
    /// continuous on cycles with no articles.
    pub fn empty() -> Self {
        Self {
            news_score: 0.0,
            dominant_crisis_type: CrisisCategory::MarketCorrection,
            crisis_description: "No news data available".to_string(),
            breaking_news_override: false,
            recommended_defcon: None,
            contributing_articles: Vec::new(),
            sentiment_summary: "No articles".to_string(),
            article_count: 0,
            breaking_count: 0,
            avg_confidence: 0.0,
            score_components: ScoreComponents {
                sentiment_net: 50.0,
                ..ScoreComponents::default()
            },
            crisis_distribution: HashMap::new(),
            keyword_hits: HashMap::new(),
        }
    }
}

/// Weight applied to an article based on its source tier.
fn source_weight(source: &str) -> f64 {
    let s = source.to_lowercase();
    if ["bloomberg", "reuters"].iter().any(|t| s.contains(t)) {
        1.0
    } else if ["cnbc", "wsj", "ft", "marketwatch"].iter().any(|t| s.contains(t)) {
        0.8
    } else if ["yahoo", "seeking", "benzinga"].iter().any(|t| s.contains(t)) {
        0.6
    } else {
        0.4
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Generates News Signal rows from scored article batches.
pub struct NewsSignalGenerator {
    /// Score at or above which bearish batches recommend DEFCON 2.
    breaking_threshold: f64,
}

impl NewsSignalGenerator {
    pub fn new(breaking_threshold: f64) -> Self {
        Self { breaking_threshold }
    }

    pub fn generate(
        &self,
        articles: &[NewsArticle],
        analyzer: &NewsSentimentAnalyzer,
    ) -> NewsSignal {
        if articles.is_empty() {
            return NewsSignal::empty();
        }

        let batch = analyzer.analyze_batch(articles);
        let (news_score, components) = self.calculate_score(articles, &batch);
        let (breaking_override, recommended_defcon) = self.check_override(news_score, &batch);
        let crisis_description = self.describe(&batch, breaking_override);
        let contributing = self.top_articles(articles, &batch, 5);
        let sentiment_summary = self.sentiment_summary(&batch);
        let keyword_hits = keyword_hits(articles);

        info!(
            score = format!("{news_score:.1}"),
            crisis = %batch.dominant_crisis_type,
            articles = articles.len(),
            breaking = batch.breaking_count,
            "news signal generated"
        );

        NewsSignal {
            news_score,
            dominant_crisis_type: batch.dominant_crisis_type,
            crisis_description,
            breaking_news_override: breaking_override,
            recommended_defcon: if breaking_override { recommended_defcon } else { None },
            contributing_articles: contributing,
            sentiment_summary,
            article_count: articles.len(),
            breaking_count: batch.breaking_count,
            avg_confidence: batch.avg_confidence,
            score_components: components,
            crisis_distribution: batch
                .crisis_distribution
                .iter()
                .map(|(c, n)| (c.as_str().to_string(), *n))
                .collect(),
            keyword_hits,
        }
    }

    /// The five-component weighted score, each component 0-100.
    fn calculate_score(
        &self,
        articles: &[NewsArticle],
        batch: &BatchAnalysis,
    ) -> (f64, ScoreComponents) {
        let weights: Vec<f64> = articles.iter().map(|a| source_weight(&a.source)).collect();
        let weight_sum: f64 = weights.iter().sum::<f64>().max(1.0);

        // 1. Sentiment net — bearish pressure maps ABOVE 50. Per-article
        //    sentiment is inverted (bearish articles carry negative scores)
        //    and source-tier weighted.
        let weighted_sentiment: f64 = batch
            .results
            .iter()
            .zip(&weights)
            .map(|(r, w)| -r.sentiment_score * w)
            .sum::<f64>()
            / weight_sum;
        let sentiment_net = (50.0 + weighted_sentiment * 0.5).clamp(0.0, 100.0);

        // 2. Concentration — share of articles agreeing on the dominant
        //    category, mapped [0.2, 0.8] -> [0, 100].
        let total_classified: usize = batch.crisis_distribution.values().sum();
        let concentration = if total_classified > 0 {
            let dominant = batch.crisis_distribution.values().copied().max().unwrap_or(0);
            let share = dominant as f64 / total_classified as f64;
            ((share - 0.2) / 0.6 * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        // 3. Urgency premium — piecewise on breaking/high counts.
        let high_count =
            batch.results.iter().filter(|r| r.urgency == Urgency::High).count() as f64;
        let breaking = batch.breaking_count as f64;
        let urgency = if breaking >= 3.0 {
            100.0
        } else if breaking > 0.0 {
            (breaking * 30.0 + high_count * 5.0).min(80.0)
        } else if high_count > 0.0 {
            (high_count * 8.0).min(40.0)
        } else {
            0.0
        };

        // 4. Source-weighted confidence — only articles whose crisis match is
        //    meaningful (confidence > 20) count.
        let meaningful: Vec<(f64, f64)> = batch
            .results
            .iter()
            .zip(&weights)
            .filter(|(r, _)| r.confidence > 20.0)
            .map(|(r, w)| (r.confidence, *w))
            .collect();
        let source_confidence = if meaningful.is_empty() {
            0.0
        } else {
            let w_sum: f64 = meaningful.iter().map(|(_, w)| w).sum();
            (meaningful.iter().map(|(c, w)| c * w).sum::<f64>() / w_sum).min(100.0)
        };

        // 5. Keyword specificity over the combined batch text.
        let all_text: String = articles
            .iter()
            .map(|a| format!("{} {}", a.title.to_lowercase(), a.description.to_lowercase()))
            .collect::<Vec<_>>()
            .join(" ");
        let high_hits = HIGH_SPECIFICITY.iter().filter(|kw| all_text.contains(*kw)).count() as f64;
        let med_hits = MED_SPECIFICITY.iter().filter(|kw| all_text.contains(*kw)).count() as f64;
        let specificity = (high_hits * 20.0 + med_hits * 5.0).min(100.0);

        let final_score = sentiment_net * WEIGHT_SENTIMENT_NET
            + concentration * WEIGHT_CONCENTRATION
            + urgency * WEIGHT_URGENCY
            + source_confidence * WEIGHT_SOURCE_CONFIDENCE
            + specificity * WEIGHT_SPECIFICITY;

        let components = ScoreComponents {
            sentiment_net: round2(sentiment_net),
            signal_concentration: round2(concentration),
            urgency_premium: round2(urgency),
            source_confidence: round2(source_confidence),
            keyword_specificity: round2(specificity),
            final_score: round2(final_score),
        };

        (round2(final_score), components)
    }

    /// Override recommendation: very high score + 3 breaking + bearish means
    /// DEFCON 1; high score + bearish means DEFCON 2.
    fn check_override(&self, news_score: f64, batch: &BatchAnalysis) -> (bool, Option<u8>) {
        if news_score >= 90.0
            && batch.breaking_count >= 3
            && batch.dominant_sentiment == Sentiment::Bearish
        {
            warn!(score = format!("{news_score:.1}"), "news override to DEFCON 1");
            (true, Some(1))
        } else if news_score >= self.breaking_threshold
            && batch.dominant_sentiment == Sentiment::Bearish
        {
            warn!(score = format!("{news_score:.1}"), "news override to DEFCON 2");
            (true, Some(2))
        } else {
            (false, None)
        }
    }

    fn describe(&self, batch: &BatchAnalysis, breaking_override: bool) -> String {
        let prefix = if breaking_override { "BREAKING" } else { "News" };
        format!(
            "{prefix} {}: {} sentiment ({} breaking, {} total articles)",
            batch.dominant_crisis_type.label(),
            batch.dominant_sentiment.as_str().to_uppercase(),
            batch.breaking_count,
            batch.total_articles
        )
    }

    /// Top contributing articles by confidence x urgency.
    fn top_articles(
        &self,
        articles: &[NewsArticle],
        batch: &BatchAnalysis,
        limit: usize,
    ) -> Vec<ContributingArticle> {
        let mut combined: Vec<ContributingArticle> = articles
            .iter()
            .zip(&batch.results)
            .map(|(a, r)| ContributingArticle {
                title: a.title.clone(),
                description: a.description.chars().take(300).collect(),
                source: a.source.clone(),
                published_at: a.published_at.to_rfc3339(),
                url: a.url.clone(),
                sentiment: r.sentiment.as_str().to_string(),
                urgency: r.urgency.as_str().to_string(),
                confidence: r.confidence,
                crisis_type: r.crisis_type.as_str().to_string(),
            })
            .collect();

        let urgency_rank = |u: &str| match u {
            "breaking" => 3.0,
            "high" => 2.0,
            _ => 1.0,
        };
        combined.sort_by(|a, b| {
            let ka = a.confidence * urgency_rank(&a.urgency);
            let kb = b.confidence * urgency_rank(&b.urgency);
            kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
        });
        combined.truncate(limit);
        combined
    }

    fn sentiment_summary(&self, batch: &BatchAnalysis) -> String {
        let total: usize = batch.sentiment_distribution.values().sum();
        if total == 0 {
            return "No sentiment data".to_string();
        }
        let pct = |s: Sentiment| {
            batch.sentiment_distribution.get(&s).copied().unwrap_or(0) as f64 / total as f64
                * 100.0
        };
        format!(
            "Bearish: {:.0}%, Bullish: {:.0}%, Neutral: {:.0}%",
            pct(Sentiment::Bearish),
            pct(Sentiment::Bullish),
            pct(Sentiment::Neutral)
        )
    }
}

impl Default for NewsSignalGenerator {
    fn default() -> Self {
        Self::new(80.0)
    }
}

/// Histogram of tracked keywords across a batch, top 15 by count.
fn keyword_hits(articles: &[NewsArticle]) -> HashMap<String, usize> {
    let all_text: String = articles
        .iter()
        .map(|a| format!("{} {}", a.title.to_lowercase(), a.description.to_lowercase()))
        .collect::<Vec<_>>()
        .join(" ");

    let mut counts: Vec<(String, usize)> = TRACKED_KEYWORDS
        .iter()
        .filter_map(|kw| {
            let count = all_text.matches(kw).count();
            (count > 0).then(|| (kw.to_string(), count))
        })
        .collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.into_iter().take(15).collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn crisis_article(title: &str, description: &str, source: &str, mins_ago: i64) -> NewsArticle {
        NewsArticle {
            title: title.to_string(),
            description: description.to_string(),
            source: source.to_string(),
            published_at: Utc::now() - Duration::minutes(mins_ago),
            url: format!("https://example.com/{}", title.len()),
            relevance_score: 90.0,
        }
    }

    fn breaking_batch() -> Vec<NewsArticle> {
        // Each article hits 3+ keywords in one crisis category so its
        // pattern confidence clears the breaking threshold.
        vec![
            crisis_article(
                "Fed emergency meeting on inflation and rate crisis",
                "Bond yields spike as fed tightening fears mount, inflation panic deepens",
                "Reuters",
                5,
            ),
            crisis_article(
                "Banking crisis deepens as credit spreads widen",
                "Liquidity crunch and financial stress hit banking system, credit markets in panic",
                "Bloomberg",
                10,
            ),
            crisis_article(
                "Markets crash in broad selloff as correction deepens",
                "Stocks drop in panic decline, drawdown accelerates amid recession warning",
                "MarketWatch",
                15,
            ),
        ]
    }

    #[test]
    fn components_sum_to_final_score_within_tolerance() {
        let generator = NewsSignalGenerator::default();
        let analyzer = NewsSentimentAnalyzer::default();
        let signal = generator.generate(&breaking_batch(), &analyzer);

        let c = &signal.score_components;
        let reconstructed = c.sentiment_net * WEIGHT_SENTIMENT_NET
            + c.signal_concentration * WEIGHT_CONCENTRATION
            + c.urgency_premium * WEIGHT_URGENCY
            + c.source_confidence * WEIGHT_SOURCE_CONFIDENCE
            + c.keyword_specificity * WEIGHT_SPECIFICITY;
        assert!(
            (reconstructed - signal.news_score).abs() <= 0.05,
            "reconstructed {reconstructed} vs stored {}",
            signal.news_score
        );
    }

    #[test]
    fn breaking_bearish_batch_recommends_override() {
        let generator = NewsSignalGenerator::default();
        let analyzer = NewsSentimentAnalyzer::default();
        let signal = generator.generate(&breaking_batch(), &analyzer);

        assert!(signal.breaking_count >= 3);
        assert!(signal.news_score > 50.0);
        if signal.breaking_news_override {
            let rec = signal.recommended_defcon.unwrap();
            assert!(rec == 1 || rec == 2);
        }
    }

    #[test]
    fn three_breaking_articles_max_urgency() {
        let generator = NewsSignalGenerator::default();
        let analyzer = NewsSentimentAnalyzer::default();
        let signal = generator.generate(&breaking_batch(), &analyzer);
        assert!((signal.score_components.urgency_premium - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_batch_produces_empty_signal() {
        let generator = NewsSignalGenerator::default();
        let analyzer = NewsSentimentAnalyzer::default();
        let signal = generator.generate(&[], &analyzer);
        assert_eq!(signal.article_count, 0);
        assert_eq!(signal.news_score, 0.0);
        assert!(!signal.breaking_news_override);
        assert!(signal.recommended_defcon.is_none());
    }

    #[test]
    fn calm_bullish_batch_scores_low_and_no_override() {
        let generator = NewsSignalGenerator::default();
        let analyzer = NewsSentimentAnalyzer::default();
        let articles = vec![
            crisis_article(
                "Stocks rally on strong earnings growth",
                "Broad recovery continues as profit optimism builds across sectors",
                "Reuters",
                200,
            ),
            crisis_article(
                "Consumer confidence improving",
                "Surveys show robust gains and improving sentiment",
                "SomeBlog",
                300,
            ),
        ];
        let signal = generator.generate(&articles, &analyzer);
        assert!(!signal.breaking_news_override);
        assert!(signal.news_score < 60.0);
        assert_eq!(signal.score_components.urgency_premium, 0.0);
    }

    #[test]
    fn keyword_hits_tracks_crisis_terms() {
        let hits = keyword_hits(&breaking_batch());
        assert!(hits.contains_key("crisis"));
        assert!(hits.contains_key("fed") || hits.contains_key("inflation"));
    }

    #[test]
    fn source_weight_tiers() {
        assert_eq!(source_weight("Bloomberg"), 1.0);
        assert_eq!(source_weight("RSS-CNBC"), 0.8);
        assert_eq!(source_weight("Yahoo Finance"), 0.6);
        assert_eq!(source_weight("Reddit-r/stocks"), 0.4);
    }
}
