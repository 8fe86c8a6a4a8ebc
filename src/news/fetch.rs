// =============================================================================
// Feed fetching — concurrent RSS pulls with per-source caps
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::news::NewsItem;

/// Items kept per source per fetch.
pub const MAX_ITEMS_PER_SOURCE: usize = 10;

/// One configured news feed.
#[derive(Debug, Clone)]
pub struct FeedSpec {
    pub name: String,
    pub url: String,
    /// How much this source is trusted [0, 1].
    pub reliability: f64,
    /// Weight of this source in emergency scoring [0, 1].
    pub weight: f64,
}

/// Default feed set, mirroring the majors the engine follows.
pub fn default_feeds() -> Vec<FeedSpec> {
    vec![
        FeedSpec {
            name: "coindesk".into(),
            url: "https://www.coindesk.com/arc/outboundfeeds/rss/".into(),
            reliability: 0.9,
            weight: 0.9,
        },
        FeedSpec {
            name: "cointelegraph".into(),
            url: "https://cointelegraph.com/rss".into(),
            reliability: 0.8,
            weight: 0.8,
        },
        FeedSpec {
            name: "decrypt".into(),
            url: "https://decrypt.co/feed".into(),
            reliability: 0.75,
            weight: 0.7,
        },
    ]
}

/// Fetch all feeds concurrently; failures degrade to an empty contribution.
pub async fn fetch_all(client: &reqwest::Client, feeds: &[FeedSpec]) -> Vec<NewsItem> {
    let futures = feeds.iter().map(|feed| fetch_one(client, feed));
    let results = join_all(futures).await;

    let mut items = Vec::new();
    for (feed, result) in feeds.iter().zip(results) {
        match result {
            Ok(mut batch) => {
                debug!(source = %feed.name, count = batch.len(), "feed fetched");
                items.append(&mut batch);
            }
            Err(e) => warn!(source = %feed.name, error = %e, "feed fetch failed"),
        }
    }
    items
}

async fn fetch_one(client: &reqwest::Client, feed: &FeedSpec) -> anyhow::Result<Vec<NewsItem>> {
    let bytes = client
        .get(&feed.url)
        .timeout(Duration::from_secs(15))
        .send()
        .await?
        .bytes()
        .await?;
    parse_feed(&bytes, feed)
}

/// Parse an RSS payload into news items, capped per source. Items missing a
/// publication date are stamped with the receive time.
pub fn parse_feed(bytes: &[u8], feed: &FeedSpec) -> anyhow::Result<Vec<NewsItem>> {
    let channel = rss::Channel::read_from(bytes)?;
    let mut items = Vec::new();

    for entry in channel.items().iter().take(MAX_ITEMS_PER_SOURCE) {
        let Some(title) = entry.title() else {
            continue;
        };
        let published_at = entry
            .pub_date()
            .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        items.push(NewsItem::new(
            &feed.name,
            feed.reliability,
            feed.weight,
            title,
            entry.description().unwrap_or(""),
            published_at,
        ));
    }
    Ok(items)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn feed() -> FeedSpec {
        FeedSpec {
            name: "test".into(),
            url: "http://example.invalid/rss".into(),
            reliability: 0.8,
            weight: 0.9,
        }
    }

    fn rss_doc(item_count: usize) -> String {
        let items: String = (0..item_count)
            .map(|i| {
                format!(
                    "<item><title>Headline number {i} about bitcoin markets</title>\
                     <description>body {i}</description>\
                     <pubDate>Mon, 02 Jun 2025 10:0{}:00 GMT</pubDate></item>",
                    i % 10
                )
            })
            .collect();
        format!(
            "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel>\
             <title>feed</title><link>http://x</link><description>d</description>\
             {items}</channel></rss>"
        )
    }

    #[test]
    fn parses_items_with_source_metadata() {
        let doc = rss_doc(3);
        let items = parse_feed(doc.as_bytes(), &feed()).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].source, "test");
        assert_eq!(items[0].source_reliability, 0.8);
        assert!(items[0].title.contains("bitcoin"));
    }

    #[test]
    fn caps_items_per_source() {
        let doc = rss_doc(25);
        let items = parse_feed(doc.as_bytes(), &feed()).unwrap();
        assert_eq!(items.len(), MAX_ITEMS_PER_SOURCE);
    }

    #[test]
    fn missing_pub_date_falls_back_to_now() {
        let doc = "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel>\
                   <title>f</title><link>http://x</link><description>d</description>\
                   <item><title>Dateless headline about markets</title></item>\
                   </channel></rss>";
        let items = parse_feed(doc.as_bytes(), &feed()).unwrap();
        assert_eq!(items.len(), 1);
        assert!((Utc::now() - items[0].published_at).num_seconds() < 5);
    }

    #[test]
    fn invalid_xml_is_an_error() {
        assert!(parse_feed(b"not xml at all", &feed()).is_err());
    }

    #[test]
    fn default_feed_weights_are_sane() {
        for feed in default_feeds() {
            assert!((0.0..=1.0).contains(&feed.reliability));
            assert!((0.0..=1.0).contains(&feed.weight));
        }
    }
}
