// =============================================================================
// News Pipeline — aggregation, dedup, sentiment, composite signal
// =============================================================================

pub mod analysis;
pub mod dedup;
pub mod sentiment;
pub mod signal;
pub mod sources;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use dedup::{KeepStrategy, NewsDeduplicator};
pub use sentiment::NewsSentimentAnalyzer;
pub use signal::{NewsSignal, NewsSignalGenerator};
pub use sources::NewsAggregator;

/// One normalized article, whatever the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsArticle {
    pub title: String,
    pub description: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    pub url: String,
    /// Provider-supplied or source-derived relevance, 0-100.
    pub relevance_score: f64,
}
