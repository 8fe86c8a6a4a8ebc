// =============================================================================
// Market Data — live caches for price, orderbook, and trades
// =============================================================================
//
// The streaming task is the single writer of all live caches; every other
// component reads snapshots. Freshness is part of the contract: a price older
// than the staleness bound is treated as missing, not returned.
// =============================================================================

pub mod ohlcv;

pub use ohlcv::{MarketData, OhlcvCache};

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// One OHLCV bar. Ordered by `open_time` ascending within a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time, UTC milliseconds.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Millisecond duration of one bar for the given timeframe string
/// ("1m", "5m", "15m", "1h", "4h", "1d"). Unknown timeframes return `None`.
pub fn timeframe_ms(timeframe: &str) -> Option<i64> {
    let (num, unit) = timeframe.split_at(timeframe.len().saturating_sub(1));
    let n: i64 = num.parse().ok()?;
    let unit_ms = match unit {
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return None,
    };
    Some(n * unit_ms)
}

/// `true` when every consecutive pair of candles is exactly one bar apart.
/// A gap means the series must be refetched over REST before indicator use.
pub fn candles_contiguous(candles: &[Candle], timeframe: &str) -> bool {
    let Some(step) = timeframe_ms(timeframe) else {
        return false;
    };
    candles
        .windows(2)
        .all(|w| w[1].open_time - w[0].open_time == step)
}

// ---------------------------------------------------------------------------
// Live updates
// ---------------------------------------------------------------------------

/// Latest traded price for a symbol, stamped at receive time.
#[derive(Debug, Clone)]
pub struct PriceTick {
    pub price: f64,
    pub received_at: Instant,
}

/// Top-of-book snapshot.
#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_qty: f64,
    pub ask_qty: f64,
    pub received_at: Instant,
}

/// A single public trade print.
#[derive(Debug, Clone)]
pub struct TradePrint {
    pub price: f64,
    pub qty: f64,
    pub is_buyer_maker: bool,
    pub received_at: Instant,
}

/// Staleness bound for the live price cache.
pub const PRICE_STALENESS: Duration = Duration::from_secs(10);
/// Staleness bound for the live book cache.
pub const BOOK_STALENESS: Duration = Duration::from_secs(5);
/// Rolling trade window cap per symbol.
const MAX_TRADES_PER_SYMBOL: usize = 1000;

/// Thread-safe live-market cache. Written by the stream reader, read by
/// everything else. Last-writer-wins by receive time.
pub struct LiveCache {
    prices: RwLock<HashMap<String, PriceTick>>,
    books: RwLock<HashMap<String, BookSnapshot>>,
    trades: RwLock<HashMap<String, VecDeque<TradePrint>>>,
}

impl LiveCache {
    pub fn new() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            books: RwLock::new(HashMap::new()),
            trades: RwLock::new(HashMap::new()),
        }
    }

    // ── Writers (stream reader only) ────────────────────────────────────

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.write().insert(
            symbol.to_string(),
            PriceTick {
                price,
                received_at: Instant::now(),
            },
        );
    }

    pub fn set_book(&self, symbol: &str, best_bid: f64, best_ask: f64, bid_qty: f64, ask_qty: f64) {
        self.books.write().insert(
            symbol.to_string(),
            BookSnapshot {
                best_bid,
                best_ask,
                bid_qty,
                ask_qty,
                received_at: Instant::now(),
            },
        );
    }

    pub fn push_trade(&self, symbol: &str, price: f64, qty: f64, is_buyer_maker: bool) {
        let mut map = self.trades.write();
        let ring = map.entry(symbol.to_string()).or_default();
        ring.push_back(TradePrint {
            price,
            qty,
            is_buyer_maker,
            received_at: Instant::now(),
        });
        while ring.len() > MAX_TRADES_PER_SYMBOL {
            ring.pop_front();
        }
    }

    // ── Readers ─────────────────────────────────────────────────────────

    /// Fresh last price, or `None` when missing or older than the bound.
    pub fn price(&self, symbol: &str) -> Option<f64> {
        let map = self.prices.read();
        let tick = map.get(symbol)?;
        if tick.received_at.elapsed() > PRICE_STALENESS {
            return None;
        }
        Some(tick.price)
    }

    /// Last price regardless of freshness (for display / paper fills).
    pub fn price_unchecked(&self, symbol: &str) -> Option<f64> {
        self.prices.read().get(symbol).map(|t| t.price)
    }

    pub fn book(&self, symbol: &str) -> Option<BookSnapshot> {
        let map = self.books.read();
        let book = map.get(symbol)?;
        if book.received_at.elapsed() > BOOK_STALENESS {
            return None;
        }
        Some(book.clone())
    }

    /// Orderbook imbalance in [-1, 1]; positive = bid-heavy.
    pub fn book_imbalance(&self, symbol: &str) -> Option<f64> {
        let book = self.book(symbol)?;
        let total = book.bid_qty + book.ask_qty;
        if total <= 0.0 {
            return None;
        }
        Some((book.bid_qty - book.ask_qty) / total)
    }

    pub fn recent_trades(&self, symbol: &str, count: usize) -> Vec<TradePrint> {
        let map = self.trades.read();
        match map.get(symbol) {
            Some(ring) => ring.iter().rev().take(count).rev().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Fraction of recent trade volume on the taker-buy side [0, 1].
    /// Only prints received within the last minute count.
    pub fn buy_volume_ratio(&self, symbol: &str) -> Option<f64> {
        const FLOW_WINDOW: Duration = Duration::from_secs(60);
        let map = self.trades.read();
        let ring = map.get(symbol)?;
        let mut buy = 0.0;
        let mut total = 0.0;
        for t in ring.iter().filter(|t| t.received_at.elapsed() <= FLOW_WINDOW) {
            total += t.qty;
            if !t.is_buyer_maker {
                buy += t.qty;
            }
        }
        if total <= 0.0 {
            return None;
        }
        Some(buy / total)
    }
}

impl Default for LiveCache {
    fn default() -> Self {
        Self::new()
    }
}
