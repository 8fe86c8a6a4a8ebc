// =============================================================================
// News sentiment — LLM port with a deterministic keyword fallback
// =============================================================================
//
// When an LLM port is configured, the top-ranked items (at most five) are
// scored in one structured request. Otherwise — or when the LLM call fails —
// a keyword scorer produces a deterministic sentiment so that downstream
// fusion always receives a valid, clamped assessment.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::news::NewsItem;

/// Maximum items forwarded to the LLM per assessment.
pub const MAX_LLM_ITEMS: usize = 5;

/// Market impact bucket; scales sentiment in fusion (1.5 / 1.0 / 0.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Low,
    Medium,
    High,
}

impl Impact {
    pub fn multiplier(self) -> f64 {
        match self {
            Self::High => 1.5,
            Self::Medium => 1.0,
            Self::Low => 0.5,
        }
    }
}

/// Structured sentiment for a batch of news.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentScore {
    /// [-1, 1]
    pub sentiment: f64,
    pub impact: Impact,
    /// [0, 1]
    pub confidence: f64,
    pub keywords: Vec<String>,
    pub summary: String,
}

impl SentimentScore {
    pub fn neutral() -> Self {
        Self {
            sentiment: 0.0,
            impact: Impact::Low,
            confidence: 0.0,
            keywords: Vec::new(),
            summary: String::new(),
        }
    }

    /// Clamp every field into its domain.
    pub fn clamped(mut self) -> Self {
        self.sentiment = self.sentiment.clamp(-1.0, 1.0);
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self
    }
}

/// Port to an external language model. Out-of-process details live behind
/// this trait; the engine only sees the structured result.
#[async_trait]
pub trait LlmPort: Send + Sync {
    async fn score_news(&self, items: &[NewsItem]) -> anyhow::Result<SentimentScore>;
}

// ---------------------------------------------------------------------------
// Keyword fallback scorer
// ---------------------------------------------------------------------------

const BULLISH_KEYWORDS: &[(&str, f64)] = &[
    ("surge", 0.6),
    ("rally", 0.6),
    ("breakout", 0.5),
    ("all-time high", 0.8),
    ("adoption", 0.4),
    ("approval", 0.6),
    ("approved", 0.6),
    ("etf inflow", 0.7),
    ("inflows", 0.4),
    ("partnership", 0.3),
    ("upgrade", 0.3),
    ("bullish", 0.5),
    ("accumulation", 0.4),
    ("institutional", 0.3),
];

const BEARISH_KEYWORDS: &[(&str, f64)] = &[
    ("crash", -0.7),
    ("plunge", -0.6),
    ("selloff", -0.5),
    ("sell-off", -0.5),
    ("hack", -0.8),
    ("exploit", -0.7),
    ("lawsuit", -0.5),
    ("ban", -0.5),
    ("bankruptcy", -0.8),
    ("liquidation", -0.5),
    ("outflows", -0.4),
    ("bearish", -0.5),
    ("fud", -0.3),
    ("delisting", -0.6),
    ("depeg", -0.7),
];

/// Deterministic keyword-based scorer. Sentiment is the reliability-weighted
/// mean of per-item keyword sums; impact follows the strongest single item.
pub fn keyword_score(items: &[NewsItem]) -> SentimentScore {
    if items.is_empty() {
        return SentimentScore::neutral();
    }

    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    let mut strongest: f64 = 0.0;
    let mut matched_keywords = Vec::new();

    for item in items {
        let haystack = format!(
            "{} {}",
            item.title.to_lowercase(),
            item.description.to_lowercase()
        );
        let mut item_score = 0.0;
        for (kw, w) in BULLISH_KEYWORDS.iter().chain(BEARISH_KEYWORDS) {
            if haystack.contains(kw) {
                item_score += w;
                matched_keywords.push((*kw).to_string());
            }
        }
        let item_score = item_score.clamp(-1.0, 1.0);
        weighted_sum += item_score * item.source_reliability;
        weight_total += item.source_reliability;
        strongest = strongest.max(item_score.abs());
    }

    let sentiment = if weight_total > 0.0 {
        weighted_sum / weight_total
    } else {
        0.0
    };
    let impact = if strongest >= 0.7 {
        Impact::High
    } else if strongest >= 0.4 {
        Impact::Medium
    } else {
        Impact::Low
    };
    // Confidence grows with evidence but stays modest for a keyword model.
    let confidence = (0.3 + 0.05 * matched_keywords.len() as f64).min(0.6);

    matched_keywords.sort();
    matched_keywords.dedup();

    SentimentScore {
        sentiment,
        impact,
        confidence,
        keywords: matched_keywords,
        summary: format!("keyword scorer over {} items", items.len()),
    }
    .clamped()
}

/// Score `items` with the LLM when available, falling back to keywords on
/// absence or failure. Items must arrive ranked best-first; only the top
/// [`MAX_LLM_ITEMS`] reach the LLM.
pub async fn score(items: &[NewsItem], llm: Option<&dyn LlmPort>) -> SentimentScore {
    let Some(llm) = llm else {
        return keyword_score(items);
    };
    let top = &items[..items.len().min(MAX_LLM_ITEMS)];
    match llm.score_news(top).await {
        Ok(score) => {
            debug!(sentiment = score.sentiment, "llm sentiment received");
            score.clamped()
        }
        Err(e) => {
            warn!(error = %e, "llm sentiment failed — using keyword fallback");
            keyword_score(items)
        }
    }
}
