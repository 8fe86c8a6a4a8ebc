// =============================================================================
// News Pipeline — fetch, dedupe, filter, cooldown, emergency, score
// =============================================================================
//
// Stages per assessment:
//   1. fetch        — all configured feeds concurrently, capped per source
//   2. dedupe       — normalized 50-char title prefix
//   3. filter       — age, length, clickbait, special chars, reliability
//   4. cooldown     — a semantic key suppresses repeats for 30 minutes
//   5. emergency    — keyword severity scan (§ filter)
//   6. score        — LLM when configured, keyword fallback otherwise
//
// Survivors are persisted through the Store; a periodic verification pass
// logs pipeline statistics and prunes stale cooldown entries.
// =============================================================================

pub mod fetch;
pub mod filter;
pub mod sentiment;

pub use fetch::{default_feeds, FeedSpec};
pub use sentiment::{Impact, LlmPort, SentimentScore};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::store::{NewsRecord, Store};

/// Cooldown window for repeats of the same semantic event.
const SEMANTIC_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// Symbols recognised in headlines -> engine symbol.
const SYMBOL_KEYWORDS: &[(&str, &str)] = &[
    ("bitcoin", "BTCUSDT"),
    ("btc", "BTCUSDT"),
    ("ethereum", "ETHUSDT"),
    ("eth", "ETHUSDT"),
    ("solana", "SOLUSDT"),
    ("sol", "SOLUSDT"),
    ("xrp", "XRPUSDT"),
    ("ripple", "XRPUSDT"),
];

// ---------------------------------------------------------------------------
// NewsItem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct NewsItem {
    /// Stable id: hash of title + source.
    pub id: String,
    pub source: String,
    pub source_reliability: f64,
    pub source_weight: f64,
    pub title: String,
    pub description: String,
    pub published_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub symbols_mentioned: Vec<String>,
    /// Filled by the scoring stage.
    pub sentiment: f64,
    pub confidence: f64,
    pub emergency_severity: f64,
}

impl NewsItem {
    pub fn new(
        source: &str,
        reliability: f64,
        weight: f64,
        title: &str,
        description: &str,
        published_at: DateTime<Utc>,
    ) -> Self {
        let id = hex::encode(Sha256::digest(format!("{title}|{source}").as_bytes()));
        let symbols_mentioned = mentioned_symbols(title);
        Self {
            id,
            source: source.to_string(),
            source_reliability: reliability,
            source_weight: weight,
            title: title.to_string(),
            description: description.to_string(),
            published_at,
            received_at: Utc::now(),
            symbols_mentioned,
            sentiment: 0.0,
            confidence: 0.0,
            emergency_severity: 0.0,
        }
    }
}

/// Symbols a headline refers to.
pub fn mentioned_symbols(title: &str) -> Vec<String> {
    let lower = title.to_lowercase();
    let mut out: Vec<String> = SYMBOL_KEYWORDS
        .iter()
        .filter(|(kw, _)| {
            // Word-boundary match so "both" does not hit "btc" etc.
            lower
                .split(|c: char| !c.is_alphanumeric())
                .any(|word| word == *kw)
        })
        .map(|(_, sym)| sym.to_string())
        .collect();
    out.sort();
    out.dedup();
    out
}

// ---------------------------------------------------------------------------
// Assessment
// ---------------------------------------------------------------------------

/// What the signal engine consumes per cycle.
#[derive(Debug, Clone, Serialize)]
pub struct NewsAssessment {
    pub sentiment: f64,
    pub impact: Impact,
    pub confidence: f64,
    /// Max severity across surviving items.
    pub emergency_severity: f64,
    /// `true` only when a source with weight >= 0.7 crossed the severity
    /// threshold — raw severity from an untrusted source never routes.
    pub emergency_declared: bool,
    /// Symbols named by the declaring item (empty = market-wide).
    pub emergency_symbols: Vec<String>,
    pub items_considered: usize,
}

impl NewsAssessment {
    pub fn neutral() -> Self {
        Self {
            sentiment: 0.0,
            impact: Impact::Low,
            confidence: 0.0,
            emergency_severity: 0.0,
            emergency_declared: false,
            emergency_symbols: Vec::new(),
            items_considered: 0,
        }
    }

    /// `true` when the emergency path must run for `symbol`. Gated on the
    /// scan's declaration (threshold AND source-weight floor), never on
    /// severity alone.
    pub fn is_emergency_for(&self, symbol: &str) -> bool {
        self.emergency_declared
            && (self.emergency_symbols.is_empty()
                || self.emergency_symbols.iter().any(|s| s == symbol))
    }
}

/// Pipeline statistics for the verification loop and `/status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NewsStats {
    pub fetched: usize,
    pub after_dedupe: usize,
    pub after_filter: usize,
    pub after_cooldown: usize,
    pub emergencies_declared: u32,
    pub assessments: u32,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct NewsPipeline {
    feeds: Vec<FeedSpec>,
    client: reqwest::Client,
    store: Arc<dyn Store>,
    llm: Option<Arc<dyn LlmPort>>,
    min_confidence: f64,
    cooldowns: Mutex<HashMap<String, Instant>>,
    stats: Mutex<NewsStats>,
}

impl NewsPipeline {
    pub fn new(
        feeds: Vec<FeedSpec>,
        store: Arc<dyn Store>,
        llm: Option<Arc<dyn LlmPort>>,
        min_confidence: f64,
        http_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .expect("failed to build reqwest client");
        Self {
            feeds,
            client,
            store,
            llm,
            min_confidence,
            cooldowns: Mutex::new(HashMap::new()),
            stats: Mutex::new(NewsStats::default()),
        }
    }

    /// Run the full pipeline once and produce an assessment.
    pub async fn assess(&self) -> NewsAssessment {
        let fetched = fetch::fetch_all(&self.client, &self.feeds).await;
        let fetched_count = fetched.len();
        if fetched.is_empty() {
            return NewsAssessment::neutral();
        }

        let deduped = filter::dedupe(fetched);
        let deduped_count = deduped.len();
        let filtered = filter::filter(deduped, self.min_confidence);
        let filtered_count = filtered.len();
        let survivors = self.apply_cooldown(filtered);

        {
            let mut stats = self.stats.lock();
            stats.fetched += fetched_count;
            stats.after_dedupe += deduped_count;
            stats.after_filter += filtered_count;
            stats.after_cooldown += survivors.len();
            stats.assessments += 1;
        }

        if survivors.is_empty() {
            return NewsAssessment::neutral();
        }

        // Emergency scan runs before scoring so a declared emergency is never
        // delayed by an LLM round trip.
        let scan = filter::scan_emergencies(&survivors);
        let emergency_symbols = scan
            .trigger_title
            .as_deref()
            .map(mentioned_symbols)
            .unwrap_or_default();
        if scan.declared {
            self.stats.lock().emergencies_declared += 1;
        }

        // Rank reliability-first for the LLM budget.
        let mut ranked = survivors;
        ranked.sort_by(|a, b| {
            b.source_reliability
                .partial_cmp(&a.source_reliability)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let score = sentiment::score(&ranked, self.llm.as_deref()).await;

        // Persist survivors with their batch sentiment.
        for item in &ranked {
            let record = NewsRecord {
                id: item.id.clone(),
                source: item.source.clone(),
                title: item.title.clone(),
                sentiment: score.sentiment,
                confidence: score.confidence,
                published_at: item.published_at,
            };
            if let Err(e) = self.store.add_news(&record) {
                warn!(error = %e, "failed to persist news item");
            }
        }

        debug!(
            items = ranked.len(),
            sentiment = score.sentiment,
            severity = scan.severity,
            "news assessment complete"
        );

        NewsAssessment {
            sentiment: score.sentiment,
            impact: score.impact,
            confidence: score.confidence,
            emergency_severity: scan.severity,
            emergency_declared: scan.declared,
            emergency_symbols,
            items_considered: ranked.len(),
        }
    }

    /// Suppress items whose semantic key fired within the cooldown window.
    fn apply_cooldown(&self, items: Vec<NewsItem>) -> Vec<NewsItem> {
        let mut cooldowns = self.cooldowns.lock();
        items
            .into_iter()
            .filter(|item| {
                let key = semantic_key(item);
                match cooldowns.get(&key) {
                    Some(seen) if seen.elapsed() < SEMANTIC_COOLDOWN => false,
                    _ => {
                        cooldowns.insert(key, Instant::now());
                        true
                    }
                }
            })
            .collect()
    }

    /// Verification pass: log statistics and prune expired cooldown entries.
    pub fn run_verification(&self) {
        let pruned = {
            let mut cooldowns = self.cooldowns.lock();
            let before = cooldowns.len();
            cooldowns.retain(|_, seen| seen.elapsed() < SEMANTIC_COOLDOWN);
            before - cooldowns.len()
        };
        let stats = self.stats.lock().clone();
        info!(
            fetched = stats.fetched,
            after_filter = stats.after_filter,
            emergencies = stats.emergencies_declared,
            assessments = stats.assessments,
            cooldowns_pruned = pruned,
            "news pipeline stats"
        );
    }

    pub fn stats(&self) -> NewsStats {
        self.stats.lock().clone()
    }
}

/// Semantic event key: mentioned symbols plus the salient title tokens.
fn semantic_key(item: &NewsItem) -> String {
    let mut tokens: Vec<&str> = item
        .title
        .split_whitespace()
        .filter(|w| w.chars().count() > 4)
        .take(4)
        .collect();
    tokens.sort_unstable();
    format!("{}|{}", item.symbols_mentioned.join(","), tokens.join(" ")).to_lowercase()
}
