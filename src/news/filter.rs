// =============================================================================
// News filtering — dedupe, quality gates, emergency keyword scan
// =============================================================================
//
// Filter chain (drop order):
//   1. duplicate normalized title prefix (first 50 chars)
//   2. older than 24 h
//   3. title shorter than 10 chars
//   4. two or more suspicious keywords ("clickbait" gate)
//   5. special-character ratio in the title above 0.1
//   6. source reliability below the configured floor
//
// Emergency scan: per-item severity = keyword severity x source reliability
// x source weight; more than 3 keyword matches in one item halves the
// severity (spam heuristic). An emergency is declared at severity >= 1.2
// from a source with weight >= 0.7.
// =============================================================================

use std::collections::HashSet;

use chrono::{Duration, Utc};
use tracing::warn;

use crate::news::NewsItem;

/// Title prefix length used for deduplication.
const DEDUPE_PREFIX_CHARS: usize = 50;
/// Maximum age before an item is dropped.
const MAX_AGE_HOURS: i64 = 24;
/// Minimum title length.
const MIN_TITLE_CHARS: usize = 10;
/// Maximum allowed special-character ratio in a title.
const MAX_SPECIAL_CHAR_RATIO: f64 = 0.1;
/// Suspicious-keyword count at which an item is dropped.
const MAX_SUSPICIOUS_KEYWORDS: usize = 2;

/// Severity threshold at which an emergency is declared.
pub const EMERGENCY_SEVERITY_THRESHOLD: f64 = 1.2;
/// Minimum source weight for an emergency declaration.
pub const EMERGENCY_SOURCE_WEIGHT_FLOOR: f64 = 0.7;
/// Keyword-match count beyond which severity is halved.
const EMERGENCY_SPAM_KEYWORDS: usize = 3;

/// Clickbait / scam markers. Two or more in one title drops the item.
const SUSPICIOUS_KEYWORDS: &[&str] = &[
    "giveaway",
    "airdrop",
    "100x",
    "guaranteed",
    "free money",
    "click here",
    "limited time",
    "presale",
    "moonshot",
    "shill",
];

/// Emergency keyword table with severity weights.
const EMERGENCY_KEYWORDS: &[(&str, f64)] = &[
    ("hack", 1.5),
    ("hacked", 1.5),
    ("exploit", 1.4),
    ("stolen", 1.4),
    ("bankruptcy", 1.5),
    ("insolvency", 1.4),
    ("sec lawsuit", 1.3),
    ("sec sues", 1.3),
    ("criminal charges", 1.3),
    ("delisting", 1.2),
    ("delisted", 1.2),
    ("halted", 1.2),
    ("halts withdrawals", 1.5),
    ("suspends withdrawals", 1.5),
    ("rug pull", 1.4),
    ("flash crash", 1.3),
    ("liquidation cascade", 1.2),
    ("ban", 1.1),
    ("banned", 1.1),
    ("depeg", 1.4),
    ("collapse", 1.3),
];

// ---------------------------------------------------------------------------
// Dedupe
// ---------------------------------------------------------------------------

/// Lowercased, whitespace-collapsed prefix of a title, used as the dedupe key.
pub fn normalized_title_prefix(title: &str) -> String {
    let collapsed: String = title
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    collapsed.chars().take(DEDUPE_PREFIX_CHARS).collect()
}

/// Drop items whose normalized title prefix was already seen (first wins).
pub fn dedupe(items: Vec<NewsItem>) -> Vec<NewsItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(normalized_title_prefix(&item.title)))
        .collect()
}

// ---------------------------------------------------------------------------
// Quality gates
// ---------------------------------------------------------------------------

fn suspicious_keyword_count(title: &str) -> usize {
    let lower = title.to_lowercase();
    SUSPICIOUS_KEYWORDS
        .iter()
        .filter(|kw| lower.contains(*kw))
        .count()
}

fn special_char_ratio(title: &str) -> f64 {
    let total = title.chars().count();
    if total == 0 {
        return 1.0;
    }
    let special = title
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace() && !",.?!'\"-:()".contains(*c))
        .count();
    special as f64 / total as f64
}

/// Apply the quality gates; returns survivors.
pub fn filter(items: Vec<NewsItem>, min_reliability: f64) -> Vec<NewsItem> {
    let cutoff = Utc::now() - Duration::hours(MAX_AGE_HOURS);
    items
        .into_iter()
        .filter(|item| item.published_at >= cutoff)
        .filter(|item| item.title.chars().count() >= MIN_TITLE_CHARS)
        .filter(|item| suspicious_keyword_count(&item.title) < MAX_SUSPICIOUS_KEYWORDS)
        .filter(|item| special_char_ratio(&item.title) <= MAX_SPECIAL_CHAR_RATIO)
        .filter(|item| item.source_reliability >= min_reliability)
        .collect()
}

// ---------------------------------------------------------------------------
// Emergency scan
// ---------------------------------------------------------------------------

/// Result of scanning one batch for emergencies.
#[derive(Debug, Clone, Default)]
pub struct EmergencyScan {
    /// Max severity across items.
    pub severity: f64,
    /// `true` when ANY item meets the threshold from a sufficiently
    /// weighted source. Evaluated per item, independent of the max.
    pub declared: bool,
    /// Title of the strongest declaring item when declared, otherwise of
    /// the strongest item overall.
    pub trigger_title: Option<String>,
}

/// Severity for one item: strongest keyword weight scaled by source
/// reliability and weight, spam-halved when too many keywords match.
pub fn item_severity(item: &NewsItem) -> f64 {
    let haystack = format!(
        "{} {}",
        item.title.to_lowercase(),
        item.description.to_lowercase()
    );

    let mut matches = 0usize;
    let mut strongest: f64 = 0.0;
    for (keyword, weight) in EMERGENCY_KEYWORDS {
        if haystack.contains(keyword) {
            matches += 1;
            strongest = strongest.max(*weight);
        }
    }
    if matches == 0 {
        return 0.0;
    }

    let mut severity = strongest * item.source_reliability * item.source_weight;
    if matches > EMERGENCY_SPAM_KEYWORDS {
        severity *= 0.5;
    }
    severity
}

pub fn scan_emergencies(items: &[NewsItem]) -> EmergencyScan {
    let mut scan = EmergencyScan::default();
    let mut best_declaring: f64 = 0.0;

    for item in items {
        let severity = item_severity(item);

        // Max-severity tracking; the title only follows the max while no
        // declaring item has been seen.
        if severity > scan.severity {
            scan.severity = severity;
            if !scan.declared {
                scan.trigger_title = Some(item.title.clone());
            }
        }

        // Declaration is checked for EVERY item — a qualifying source must
        // declare even when a noisier, untrusted item holds the max.
        if severity >= EMERGENCY_SEVERITY_THRESHOLD
            && item.source_weight >= EMERGENCY_SOURCE_WEIGHT_FLOOR
            && severity > best_declaring
        {
            scan.declared = true;
            best_declaring = severity;
            scan.trigger_title = Some(item.title.clone());
        }
    }

    if scan.declared {
        warn!(
            severity = scan.severity,
            title = scan.trigger_title.as_deref().unwrap_or(""),
            "emergency news detected"
        );
    }
    scan
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(title: &str) -> NewsItem {
        NewsItem::new(
            "wire",
            0.9,
            0.9,
            title,
            "",
            Utc::now() - Duration::minutes(5),
        )
    }

    #[test]
    fn dedupe_by_title_prefix() {
        let a = item("Bitcoin surges past 100k as ETF inflows accelerate strongly today");
        let b = item("Bitcoin surges past 100k as ETF inflows accelerate STRONGLY today (updated)");
        let c = item("Ethereum upgrade ships on mainnet");
        let out = dedupe(vec![a, b, c]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn old_items_are_dropped() {
        let mut old = item("Bitcoin holds steady in quiet session");
        old.published_at = Utc::now() - Duration::hours(30);
        let fresh = item("Ethereum holds steady in quiet session");
        let out = filter(vec![old, fresh], 0.6);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn short_titles_are_dropped() {
        let out = filter(vec![item("too short")], 0.6);
        assert!(out.is_empty());
    }

    #[test]
    fn clickbait_needs_two_keywords() {
        let one = item("Exchange announces airdrop for verified users");
        let two = item("Guaranteed 100x airdrop giveaway happening now");
        let out = filter(vec![one, two], 0.6);
        assert_eq!(out.len(), 1);
        assert!(out[0].title.contains("Exchange"));
    }

    #[test]
    fn special_char_soup_is_dropped() {
        let noisy = item("$$$ ###BTC@@@ ^^^ moon %%% &&& now!!!! ***");
        let out = filter(vec![noisy], 0.6);
        assert!(out.is_empty());
    }

    #[test]
    fn unreliable_sources_are_dropped() {
        let mut shady = item("Bitcoin steady while majors consolidate");
        shady.source_reliability = 0.3;
        let out = filter(vec![shady], 0.6);
        assert!(out.is_empty());
    }

    #[test]
    fn severity_scales_with_source_quality() {
        let strong = item("Major exchange hacked, withdrawals suspended");
        let severity = item_severity(&strong);
        // 1.5 keyword * 0.9 reliability * 0.9 weight
        assert!(severity > 1.2, "expected severity > 1.2, got {severity}");

        let mut weak = item("Major exchange hacked, withdrawals suspended");
        weak.source_reliability = 0.4;
        assert!(item_severity(&weak) < EMERGENCY_SEVERITY_THRESHOLD);
    }

    #[test]
    fn keyword_spam_halves_severity() {
        let spam = item("hack exploit stolen bankruptcy collapse depeg everywhere");
        let focused = item("Exchange hack confirmed by auditors this morning");
        assert!(item_severity(&spam) < item_severity(&focused));
    }

    #[test]
    fn emergency_needs_weighty_source() {
        // "hacked" (1.5) x 0.9 reliability x 0.5 weight = 0.675: no
        // declaration from an untrusted source.
        let mut low_weight = item("Major venue hacked overnight, token collapse feared");
        low_weight.source_weight = 0.5;
        let scan = scan_emergencies(&[low_weight]);
        assert!(!scan.declared);

        // Same headline at weight 0.9: 1.5 x 0.81 = 1.215 >= 1.2.
        let heavy = item("Major venue hacked overnight, token collapse feared");
        let scan = scan_emergencies(&[heavy]);
        assert!(scan.declared);
        assert!(scan.severity >= EMERGENCY_SEVERITY_THRESHOLD);
    }

    #[test]
    fn declaration_is_evaluated_per_item_not_only_for_the_max() {
        // An untrusted item precedes the qualifying one. The qualifying
        // item must declare regardless of iteration order or of which item
        // holds the running max, and the routing title must come from the
        // DECLARING item, not the untrusted one.
        let mut untrusted = item("Unverified exchange hacked rumor spreading fast");
        untrusted.source_weight = 0.5;

        let declaring = item("Bitcoin exchange hacked, withdrawals halted by operator");

        let scan = scan_emergencies(&[untrusted.clone(), declaring.clone()]);
        assert!(scan.declared);
        assert!(scan.severity >= EMERGENCY_SEVERITY_THRESHOLD);
        assert_eq!(scan.trigger_title.as_deref(), Some(declaring.title.as_str()));

        // Reversed order gives the same outcome.
        let scan = scan_emergencies(&[declaring.clone(), untrusted]);
        assert!(scan.declared);
        assert_eq!(scan.trigger_title.as_deref(), Some(declaring.title.as_str()));
    }

    #[test]
    fn undeclared_scan_still_reports_max_severity() {
        // High-severity item from a low-weight source: severity is
        // reported (it feeds the assessment) but nothing is declared.
        let mut shady = item("Exchange hacked and halted, chaos reported");
        shady.source_weight = 0.5;
        let scan = scan_emergencies(&[shady]);
        assert!(!scan.declared);
        assert!(scan.severity > 0.0);
        assert!(scan.trigger_title.is_some());
    }

    #[test]
    fn no_keywords_no_severity() {
        let calm = item("Markets drift sideways in thin holiday trading");
        assert_eq!(item_severity(&calm), 0.0);
        let scan = scan_emergencies(&[calm]);
        assert!(!scan.declared);
        assert_eq!(scan.severity, 0.0);
    }
}
