// =============================================================================
// OHLCV Cache — TTL-bounded candle history in front of the REST port
// =============================================================================
//
// Keyed by (symbol, timeframe, limit) with a short TTL so one analysis cycle
// touching several timeframes hits the network at most once per key. The
// cache is owned by `MarketData` (the only reader); it is not global.
//
// A non-contiguous series (a gap in open times) is never served: the entry is
// invalidated and refetched.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::exchange::ExchangePort;
use crate::market_data::{candles_contiguous, Candle, LiveCache};

/// Default entry lifetime.
const DEFAULT_TTL: Duration = Duration::from_secs(60);
/// Hard cap on distinct cache keys.
const MAX_ENTRIES: usize = 256;
/// Minimum rows the signal engine needs for a meaningful indicator window.
pub const MIN_INDICATOR_ROWS: usize = 200;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    symbol: String,
    timeframe: String,
    limit: u32,
}

struct CacheEntry {
    candles: Arc<Vec<Candle>>,
    fetched_at: Instant,
}

/// TTL cache with explicit `{max_size, ttl}`.
pub struct OhlcvCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl OhlcvCache {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_TTL, MAX_ENTRIES)
    }

    pub fn with_params(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    fn get(&self, key: &CacheKey) -> Option<Arc<Vec<Candle>>> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.fetched_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.candles.clone())
    }

    fn insert(&self, key: CacheKey, candles: Arc<Vec<Candle>>) {
        let mut entries = self.entries.write();
        // Evict expired entries first; then the oldest, if still over budget.
        entries.retain(|_, e| e.fetched_at.elapsed() <= self.ttl);
        if entries.len() >= self.max_entries {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.fetched_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                candles,
                fetched_at: Instant::now(),
            },
        );
    }

    fn invalidate(&self, key: &CacheKey) {
        self.entries.write().remove(key);
    }
}

impl Default for OhlcvCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// MarketData service
// =============================================================================

/// Read-side facade over candle history and the live caches.
pub struct MarketData {
    port: Arc<dyn ExchangePort>,
    cache: OhlcvCache,
    pub live: Arc<LiveCache>,
}

impl MarketData {
    pub fn new(port: Arc<dyn ExchangePort>, live: Arc<LiveCache>) -> Self {
        Self {
            port,
            cache: OhlcvCache::new(),
            live,
        }
    }

    /// Candle history, cached. Series with gaps are refetched once; a still-
    /// gapped series is surfaced as `DataMissing` so the caller skips the
    /// symbol rather than computing indicators over a hole.
    pub async fn ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> EngineResult<Arc<Vec<Candle>>> {
        let key = CacheKey {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            limit,
        };

        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let candles = self.fetch_checked(symbol, timeframe, limit).await?;
        let candles = Arc::new(candles);
        self.cache.insert(key, candles.clone());
        Ok(candles)
    }

    async fn fetch_checked(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> EngineResult<Vec<Candle>> {
        let candles = self.port.fetch_ohlcv(symbol, timeframe, limit).await?;
        if candles_contiguous(&candles, timeframe) {
            return Ok(candles);
        }

        warn!(symbol, timeframe, "gap detected in candle series — refetching");
        let refetched = self.port.fetch_ohlcv(symbol, timeframe, limit).await?;
        if candles_contiguous(&refetched, timeframe) {
            return Ok(refetched);
        }
        Err(EngineError::DataMissing(format!(
            "{symbol} {timeframe} candle series has gaps after refetch"
        )))
    }

    /// History suitable for indicator computation, or `DataMissing` when the
    /// window is shorter than [`MIN_INDICATOR_ROWS`].
    pub async fn indicator_window(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> EngineResult<Arc<Vec<Candle>>> {
        let candles = self.ohlcv(symbol, timeframe, limit).await?;
        if candles.len() < MIN_INDICATOR_ROWS {
            debug!(
                symbol,
                timeframe,
                rows = candles.len(),
                "insufficient_data — skipping symbol"
            );
            return Err(EngineError::DataMissing(format!(
                "insufficient_data: {symbol} {timeframe} has {} rows (need {MIN_INDICATOR_ROWS})",
                candles.len()
            )));
        }
        Ok(candles)
    }

    /// Fresh live price, falling back to REST via the port's cache contract.
    pub fn current_price(&self, symbol: &str) -> Option<f64> {
        self.live.price(symbol)
    }

    /// Drop a cached series (used by tests and the manage-loop's forced
    /// re-evaluation).
    pub fn invalidate(&self, symbol: &str, timeframe: &str, limit: u32) {
        self.cache.invalidate(&CacheKey {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            limit,
        });
    }
}
