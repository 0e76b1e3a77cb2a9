// =============================================================================
// News Deduplicator — content-similarity filter over incoming articles
// =============================================================================
//
// Duplicate coverage of one event across wire services inflates the news
// score, so every batch passes through two phases before scoring:
//
//   1. Exact: drop repeated URLs, then repeated SHA-256 title hashes.
//   2. Content: greedy grouping of articles whose term-frequency cosine
//      similarity meets the threshold; one representative survives per group.
//
// Deterministic: identical input + threshold always yields identical output,
// and dedup(dedup(x)) == dedup(x).
// =============================================================================

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::NewsArticle;

/// Articles sharing fewer than this many tokens skip the cosine computation.
const MIN_COMMON_TOKENS: usize = 3;

/// Which article survives from a duplicate group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepStrategy {
    HighestRelevance,
    MostRecent,
    First,
}

impl KeepStrategy {
    pub fn parse(s: &str) -> Self {
        match s {
            "most_recent" => Self::MostRecent,
            "first" => Self::First,
            _ => Self::HighestRelevance,
        }
    }
}

/// Detects and removes duplicate news articles using content similarity.
pub struct NewsDeduplicator {
    similarity_threshold: f64,
    stopwords: HashSet<&'static str>,
}

impl NewsDeduplicator {
    pub fn new(similarity_threshold: f64) -> Self {
        Self {
            similarity_threshold,
            stopwords: stopwords(),
        }
    }

    /// Lowercase alphabetic tokens, length > 2, stopword-filtered.
    fn tokenize(&self, text: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        for ch in text.chars() {
            if ch.is_ascii_alphabetic() {
                current.push(ch.to_ascii_lowercase());
            } else if !current.is_empty() {
                if current.len() > 2 && !self.stopwords.contains(current.as_str()) {
                    tokens.push(std::mem::take(&mut current));
                } else {
                    current.clear();
                }
            }
        }
        if current.len() > 2 && !self.stopwords.contains(current.as_str()) {
            tokens.push(current);
        }
        tokens
    }

    /// Term frequency normalised by token count.
    fn term_frequency(tokens: &[String]) -> HashMap<&str, f64> {
        let total = tokens.len();
        if total == 0 {
            return HashMap::new();
        }
        let mut counts: HashMap<&str, f64> = HashMap::new();
        for token in tokens {
            *counts.entry(token.as_str()).or_insert(0.0) += 1.0;
        }
        for value in counts.values_mut() {
            *value /= total as f64;
        }
        counts
    }

    fn cosine(tf1: &HashMap<&str, f64>, tf2: &HashMap<&str, f64>) -> f64 {
        if tf1.is_empty() || tf2.is_empty() {
            return 0.0;
        }
        let dot: f64 = tf1
            .iter()
            .filter_map(|(token, v1)| tf2.get(token).map(|v2| v1 * v2))
            .sum();
        let mag1 = tf1.values().map(|v| v * v).sum::<f64>().sqrt();
        let mag2 = tf2.values().map(|v| v * v).sum::<f64>().sqrt();
        if mag1 == 0.0 || mag2 == 0.0 {
            return 0.0;
        }
        dot / (mag1 * mag2)
    }

    /// Similarity between two articles over combined title + description.
    pub fn similarity(&self, a: &NewsArticle, b: &NewsArticle) -> f64 {
        let tokens_a = self.tokenize(&format!("{} {}", a.title, a.description));
        let tokens_b = self.tokenize(&format!("{} {}", b.title, b.description));

        let set_a: HashSet<&str> = tokens_a.iter().map(|t| t.as_str()).collect();
        let common = tokens_b.iter().filter(|t| set_a.contains(t.as_str())).count();
        if common < MIN_COMMON_TOKENS {
            return 0.0;
        }

        Self::cosine(&Self::term_frequency(&tokens_a), &Self::term_frequency(&tokens_b))
    }

    /// Phase 1: exact duplicate removal by URL, then by title hash.
    fn dedup_exact(&self, articles: Vec<NewsArticle>) -> (Vec<NewsArticle>, usize) {
        let mut seen_urls: HashSet<String> = HashSet::new();
        let mut seen_titles: HashSet<String> = HashSet::new();
        let before = articles.len();

        let unique = articles
            .into_iter()
            .filter(|article| {
                if !article.url.is_empty() && !seen_urls.insert(article.url.clone()) {
                    return false;
                }
                let digest = hex::encode(Sha256::digest(article.title.to_lowercase().as_bytes()));
                seen_titles.insert(digest)
            })
            .collect::<Vec<_>>();

        let removed = before - unique.len();
        (unique, removed)
    }

    /// Remove duplicates. Returns the surviving articles and the number
    /// removed across both phases.
    pub fn deduplicate(
        &self,
        articles: Vec<NewsArticle>,
        keep: KeepStrategy,
    ) -> (Vec<NewsArticle>, usize) {
        if articles.is_empty() {
            return (Vec::new(), 0);
        }

        let total_in = articles.len();
        let (articles, exact_removed) = self.dedup_exact(articles);
        if exact_removed > 0 {
            debug!(removed = exact_removed, "exact-duplicate articles dropped");
        }

        // Phase 2: greedy content grouping. Each unprocessed article seeds a
        // group and absorbs every later article above the threshold.
        let mut unique: Vec<NewsArticle> = Vec::new();
        let mut processed: HashSet<usize> = HashSet::new();

        for i in 0..articles.len() {
            if processed.contains(&i) {
                continue;
            }
            let mut group_indices = vec![i];
            for j in (i + 1)..articles.len() {
                if processed.contains(&j) {
                    continue;
                }
                if self.similarity(&articles[i], &articles[j]) >= self.similarity_threshold {
                    group_indices.push(j);
                }
            }
            processed.extend(group_indices.iter().copied());

            let keeper_idx = match keep {
                KeepStrategy::First => group_indices[0],
                KeepStrategy::HighestRelevance => group_indices
                    .iter()
                    .copied()
                    .max_by(|&a, &b| {
                        articles[a]
                            .relevance_score
                            .partial_cmp(&articles[b].relevance_score)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .unwrap_or(group_indices[0]),
                KeepStrategy::MostRecent => group_indices
                    .iter()
                    .copied()
                    .max_by_key(|&idx| articles[idx].published_at)
                    .unwrap_or(group_indices[0]),
            };

            if group_indices.len() > 1 {
                debug!(
                    group_size = group_indices.len(),
                    kept = %articles[keeper_idx].title,
                    "duplicate group collapsed"
                );
            }
            unique.push(articles[keeper_idx].clone());
        }

        let removed = total_in - unique.len();
        if removed > 0 {
            info!(
                input = total_in,
                unique = unique.len(),
                removed,
                "deduplication complete"
            );
        }
        (unique, removed)
    }
}

fn stopwords() -> HashSet<&'static str> {
    [
        "the", "and", "for", "are", "but", "not", "you", "all", "can", "her", "was", "one",
        "our", "out", "his", "has", "had", "have", "been", "being", "were", "this", "that",
        "these", "those", "with", "from", "into", "through", "during", "about", "which",
        "who", "when", "where", "why", "how", "each", "every", "both", "few", "more",
        "most", "some", "such", "nor", "only", "same", "than", "too", "very", "just",
        "will", "would", "should", "could", "may", "might", "does", "did", "they", "them",
        "their", "what", "now",
    ]
    .into_iter()
    .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn article(title: &str, description: &str, url: &str, relevance: f64) -> NewsArticle {
        NewsArticle {
            title: title.to_string(),
            description: description.to_string(),
            source: "Reuters".to_string(),
            published_at: Utc::now(),
            url: url.to_string(),
            relevance_score: relevance,
        }
    }

    fn fed_articles() -> Vec<NewsArticle> {
        vec![
            article(
                "Federal Reserve raises interest rates to combat inflation",
                "The Federal Reserve announced a rate hike today amid concerns about rising inflation",
                "https://example.com/1",
                95.0,
            ),
            article(
                "Federal Reserve increases interest rates in fight against rising inflation",
                "In a move to combat inflation concerns, the Federal Reserve raised interest rates this morning",
                "https://example.com/2",
                90.0,
            ),
            article(
                "Tesla stock surges on earnings beat",
                "Tesla shares jumped after reporting better than expected quarterly earnings",
                "https://example.com/3",
                85.0,
            ),
        ]
    }

    #[test]
    fn similar_articles_collapse_to_highest_relevance() {
        let dedup = NewsDeduplicator::new(0.6);
        let (unique, removed) = dedup.deduplicate(fed_articles(), KeepStrategy::HighestRelevance);
        assert_eq!(removed, 1);
        assert_eq!(unique.len(), 2);
        assert!(unique.iter().any(|a| a.relevance_score == 95.0));
        assert!(unique.iter().any(|a| a.title.starts_with("Tesla")));
    }

    #[test]
    fn exact_url_duplicates_dropped_first() {
        let dedup = NewsDeduplicator::new(0.6);
        let mut articles = fed_articles();
        articles.push(article("Completely different story", "nothing alike here at all", "https://example.com/1", 50.0));
        let (unique, removed) = dedup.deduplicate(articles, KeepStrategy::First);
        assert_eq!(removed, 2); // one URL dup + one content dup
        assert_eq!(unique.len(), 2);
    }

    #[test]
    fn title_hash_catches_same_story_from_different_urls() {
        let dedup = NewsDeduplicator::new(0.99);
        let articles = vec![
            article("Markets tumble on tariff news", "", "https://a.example/1", 80.0),
            article("Markets Tumble On Tariff News", "", "https://b.example/2", 70.0),
        ];
        let (unique, removed) = dedup.deduplicate(articles, KeepStrategy::First);
        assert_eq!(removed, 1);
        assert_eq!(unique.len(), 1);
    }

    #[test]
    fn dissimilar_articles_survive() {
        let dedup = NewsDeduplicator::new(0.6);
        let articles = vec![
            article("Oil prices climb on supply cut", "OPEC announced production cuts", "https://example.com/a", 80.0),
            article("Biotech firm wins approval", "Regulator approves new treatment for patients", "https://example.com/b", 75.0),
        ];
        let (unique, removed) = dedup.deduplicate(articles, KeepStrategy::HighestRelevance);
        assert_eq!(removed, 0);
        assert_eq!(unique.len(), 2);
    }

    #[test]
    fn most_recent_strategy_keeps_newest() {
        let dedup = NewsDeduplicator::new(0.6);
        let mut articles = fed_articles();
        articles[1].published_at = Utc::now() + Duration::minutes(10);
        let (unique, _) = dedup.deduplicate(articles, KeepStrategy::MostRecent);
        assert!(unique.iter().any(|a| a.url == "https://example.com/2"));
    }

    #[test]
    fn dedup_is_idempotent() {
        let dedup = NewsDeduplicator::new(0.6);
        let (once, _) = dedup.deduplicate(fed_articles(), KeepStrategy::HighestRelevance);
        let (twice, removed_second) = dedup.deduplicate(once.clone(), KeepStrategy::HighestRelevance);
        assert_eq!(removed_second, 0);
        assert_eq!(once.len(), twice.len());
        let urls_once: Vec<_> = once.iter().map(|a| &a.url).collect();
        let urls_twice: Vec<_> = twice.iter().map(|a| &a.url).collect();
        assert_eq!(urls_once, urls_twice);
    }

    #[test]
    fn empty_input_is_empty_output() {
        let dedup = NewsDeduplicator::new(0.6);
        let (unique, removed) = dedup.deduplicate(Vec::new(), KeepStrategy::First);
        assert!(unique.is_empty());
        assert_eq!(removed, 0);
    }
}
