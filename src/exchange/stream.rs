// =============================================================================
// Market Stream — single duplex WS session feeding the live caches
// =============================================================================
//
// One connection subscribes to `ticker`, `books`, and `trade` for every
// configured symbol. Session health:
//
//   - Every inbound frame refreshes `last_message`.
//   - A ping is sent every 30 s; silence beyond `ws_response_timeout_secs`
//     forces a reconnect.
//   - Reconnect backoff is exponential with jitter (base 2 s, capped at
//     `ws_max_reconnect_delay_secs`); the attempt counter resets to zero on a
//     successful (re)subscribe.
//   - After `ws_max_attempts` consecutive failures the feed switches to REST
//     polling at a coarse interval and is flagged `degraded` until the next
//     successful WS session.
//
// The stream task is the single writer of `LiveCache`.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::exchange::ExchangePort;
use crate::market_data::LiveCache;

const STREAM_URL: &str = "wss://ws.bitget.com/mix/v1/stream";
/// Base delay for the exponential reconnect backoff.
const RECONNECT_BASE: Duration = Duration::from_secs(2);
/// Ping cadence while connected.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// REST polling cadence while degraded.
const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Shared stream-health state, readable by `/status`.
pub struct StreamHealth {
    pub connected: AtomicBool,
    pub degraded: AtomicBool,
    pub reconnect_attempts: AtomicU32,
    last_message: RwLock<Instant>,
}

impl StreamHealth {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            last_message: RwLock::new(Instant::now()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        *self.last_message.write() = Instant::now();
    }

    fn silence(&self) -> Duration {
        self.last_message.read().elapsed()
    }
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Stream task
// ---------------------------------------------------------------------------

pub struct MarketStream {
    symbols: Vec<String>,
    live: Arc<LiveCache>,
    health: Arc<StreamHealth>,
    network: NetworkConfig,
}

impl MarketStream {
    pub fn new(
        symbols: Vec<String>,
        live: Arc<LiveCache>,
        health: Arc<StreamHealth>,
        network: NetworkConfig,
    ) -> Self {
        Self {
            symbols,
            live,
            health,
            network,
        }
    }

    /// Run the stream until shutdown. Owns reconnection and the REST
    /// fallback; never returns early on connection errors.
    pub async fn run(
        self,
        rest: Arc<dyn ExchangePort>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                info!("market stream shutting down");
                return;
            }

            match self.run_session(&mut shutdown).await {
                Ok(()) => return, // clean shutdown
                Err(e) => {
                    self.health.connected.store(false, Ordering::Relaxed);
                    let attempts = self.health.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
                    error!(error = %e, attempts, "stream session ended");

                    if attempts >= self.network.ws_max_attempts {
                        warn!(
                            attempts,
                            "stream persistently unavailable — entering REST fallback"
                        );
                        self.health.degraded.store(true, Ordering::Relaxed);
                        if self.run_rest_fallback(&rest, &mut shutdown).await {
                            return;
                        }
                        // One cycle of fallback done; retry WS from scratch.
                        self.health.reconnect_attempts.store(0, Ordering::Relaxed);
                        continue;
                    }

                    let delay = self.backoff_delay(attempts);
                    debug!(delay_ms = delay.as_millis() as u64, "reconnect backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
    }

    /// Exponential backoff with up to 50 % additive jitter, bounded by the
    /// configured cap.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let cap = Duration::from_secs(self.network.ws_max_reconnect_delay_secs);
        let base = RECONNECT_BASE
            .checked_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .unwrap_or(cap)
            .min(cap);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        (base + Duration::from_millis(jitter_ms)).min(cap + base)
    }

    /// One full WS session: connect, subscribe, pump frames until the
    /// connection drops, silence exceeds the response timeout, or shutdown.
    async fn run_session(&self, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(url = STREAM_URL, symbols = ?self.symbols, "connecting market stream");
        let (ws, _) = connect_async(STREAM_URL).await?;
        let (mut write, mut read) = ws.split();

        // Resubscribe the full channel set before resuming delivery.
        for symbol in &self.symbols {
            for channel in ["ticker", "books5", "trade"] {
                let sub = serde_json::json!({
                    "op": "subscribe",
                    "args": [{ "instType": "mc", "channel": channel, "instId": symbol }],
                });
                write.send(Message::Text(sub.to_string())).await?;
            }
        }

        info!("market stream connected and subscribed");
        self.health.connected.store(true, Ordering::Relaxed);
        self.health.degraded.store(false, Ordering::Relaxed);
        self.health.reconnect_attempts.store(0, Ordering::Relaxed);
        self.health.touch();

        let response_timeout = Duration::from_secs(self.network.ws_response_timeout_secs);
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    self.health.connected.store(false, Ordering::Relaxed);
                    return Ok(());
                }
                _ = ping_timer.tick() => {
                    if self.health.silence() > response_timeout {
                        anyhow::bail!(
                            "no stream message for {}s — forcing reconnect",
                            self.health.silence().as_secs()
                        );
                    }
                    write.send(Message::Text("ping".into())).await?;
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.health.touch();
                            if text == "pong" {
                                continue;
                            }
                            if let Err(e) = self.handle_message(&text) {
                                warn!(error = %e, "failed to parse stream message");
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            self.health.touch();
                            write.send(Message::Pong(payload)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            anyhow::bail!("stream closed by remote");
                        }
                        Some(Ok(_)) => {
                            self.health.touch();
                        }
                        Some(Err(e)) => {
                            anyhow::bail!("stream read error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Route one data frame into the live caches.
    ///
    /// Frame shape: `{"arg":{"channel":"ticker","instId":"BTCUSDT"},"data":[...]}`
    fn handle_message(&self, text: &str) -> anyhow::Result<()> {
        let root: serde_json::Value = serde_json::from_str(text)?;

        // Subscription acks and events carry no data.
        let Some(data) = root.get("data").and_then(|d| d.as_array()) else {
            return Ok(());
        };
        let arg = &root["arg"];
        let channel = arg["channel"].as_str().unwrap_or("");
        let symbol = arg["instId"].as_str().unwrap_or("").to_uppercase();
        if symbol.is_empty() {
            return Ok(());
        }

        match channel {
            "ticker" => {
                for item in data {
                    let last = parse_num(&item["last"]);
                    if last > 0.0 {
                        self.live.set_price(&symbol, last);
                    }
                }
            }
            "books5" => {
                for item in data {
                    let best = |side: &str| -> Option<(f64, f64)> {
                        let level = item[side].as_array()?.first()?.as_array()?;
                        Some((parse_num(level.first()?), parse_num(level.get(1)?)))
                    };
                    if let (Some((bid, bid_qty)), Some((ask, ask_qty))) =
                        (best("bids"), best("asks"))
                    {
                        self.live.set_book(&symbol, bid, ask, bid_qty, ask_qty);
                    }
                }
            }
            "trade" => {
                for item in data {
                    // Trade rows: [ts, price, size, side]
                    if let Some(row) = item.as_array() {
                        if row.len() >= 4 {
                            let price = parse_num(&row[1]);
                            let qty = parse_num(&row[2]);
                            let is_buyer_maker = row[3].as_str() == Some("sell");
                            if price > 0.0 {
                                self.live.push_trade(&symbol, price, qty, is_buyer_maker);
                                self.live.set_price(&symbol, price);
                            }
                        }
                    }
                }
            }
            other => {
                debug!(channel = other, "ignoring unknown stream channel");
            }
        }
        Ok(())
    }

    /// REST ticker polling while the stream is down. Returns `true` on
    /// shutdown, `false` when the caller should retry the WS connection.
    async fn run_rest_fallback(
        &self,
        rest: &Arc<dyn ExchangePort>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        // Poll for a bounded stretch, then hand control back for a WS retry.
        for _ in 0..8 {
            if *shutdown.borrow() {
                return true;
            }
            for symbol in &self.symbols {
                match rest.fetch_ohlcv(symbol, "1m", 1).await {
                    Ok(candles) => {
                        if let Some(last) = candles.last() {
                            self.live.set_price(symbol, last.close);
                        }
                    }
                    Err(e) => warn!(symbol = %symbol, error = %e, "REST fallback poll failed"),
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(FALLBACK_POLL_INTERVAL) => {}
                _ = shutdown.changed() => return true,
            }
        }
        false
    }
}

fn parse_num(value: &serde_json::Value) -> f64 {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| value.as_f64())
        .unwrap_or(0.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn stream_for_test() -> MarketStream {
        MarketStream::new(
            vec!["BTCUSDT".to_string()],
            Arc::new(LiveCache::new()),
            Arc::new(StreamHealth::new()),
            NetworkConfig::default(),
        )
    }

    #[test]
    fn ticker_message_updates_price() {
        let stream = stream_for_test();
        let msg = r#"{
            "arg": {"channel": "ticker", "instId": "BTCUSDT"},
            "data": [{"last": "42123.5"}]
        }"#;
        stream.handle_message(msg).unwrap();
        assert_eq!(stream.live.price("BTCUSDT"), Some(42_123.5));
    }

    #[test]
    fn book_message_updates_top_of_book() {
        let stream = stream_for_test();
        let msg = r#"{
            "arg": {"channel": "books5", "instId": "BTCUSDT"},
            "data": [{
                "bids": [["42000.0", "3.5"], ["41999.0", "1.0"]],
                "asks": [["42001.0", "2.0"]]
            }]
        }"#;
        stream.handle_message(msg).unwrap();
        let book = stream.live.book("BTCUSDT").unwrap();
        assert_eq!(book.best_bid, 42_000.0);
        assert_eq!(book.best_ask, 42_001.0);
        assert_eq!(book.bid_qty, 3.5);
    }

    #[test]
    fn trade_message_fills_ring_and_price() {
        let stream = stream_for_test();
        let msg = r#"{
            "arg": {"channel": "trade", "instId": "BTCUSDT"},
            "data": [["1700000000000", "42100.0", "0.25", "buy"]]
        }"#;
        stream.handle_message(msg).unwrap();
        let trades = stream.live.recent_trades("BTCUSDT", 10);
        assert_eq!(trades.len(), 1);
        assert!(!trades[0].is_buyer_maker);
        assert_eq!(stream.live.price("BTCUSDT"), Some(42_100.0));
    }

    #[test]
    fn ack_frames_are_ignored() {
        let stream = stream_for_test();
        let ack = r#"{"event":"subscribe","arg":{"channel":"ticker","instId":"BTCUSDT"}}"#;
        stream.handle_message(ack).unwrap();
        assert_eq!(stream.live.price("BTCUSDT"), None);
    }

    #[test]
    fn backoff_grows_and_respects_cap() {
        let stream = stream_for_test();
        let d1 = stream.backoff_delay(1);
        let d3 = stream.backoff_delay(3);
        assert!(d1 >= Duration::from_secs(2));
        // attempt 3 -> base 8s plus jitter
        assert!(d3 >= Duration::from_secs(8));
        let capped = stream.backoff_delay(30);
        assert!(capped <= Duration::from_secs(120));
    }
}
