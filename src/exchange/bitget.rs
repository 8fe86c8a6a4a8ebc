// =============================================================================
// Bitget REST adapter — HMAC-SHA256 signed requests (USDT-margined futures)
// =============================================================================
//
// SECURITY: the secret and passphrase are never logged or serialized. Every
// signed request carries ACCESS-KEY / ACCESS-SIGN / ACCESS-TIMESTAMP /
// ACCESS-PASSPHRASE headers; the signature covers
// `timestamp + METHOD + path?query + body` and is transported as base64.
//
// All calls pass the shared rate limiter and circuit breaker first, and
// Network / RateLimited failures are retried with bounded exponential
// backoff before surfacing to the caller.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::config::{Credentials, NetworkConfig};
use crate::exchange::breaker::CircuitBreaker;
use crate::exchange::rate_limit::RateLimiter;
use crate::exchange::{
    ExchangeError, ExchangePort, ExchangePosition, ExchangeResult, Order, OrderRequest,
};
use crate::market_data::{Candle, LiveCache};
use crate::types::{BalanceInfo, OrderType, Side};

type HmacSha256 = Hmac<Sha256>;

/// Margin-coin suffix for USDT-margined contracts on the wire.
const CONTRACT_SUFFIX: &str = "_UMCBL";
/// Margin coin for balance and order endpoints.
const MARGIN_COIN: &str = "USDT";
/// Retry budget for retryable failures inside the port.
const MAX_RETRIES: u32 = 3;

/// Signed REST client for the venue. `Clone` is cheap; all heavy state is
/// behind `Arc`.
#[derive(Clone)]
pub struct BitgetClient {
    credentials: Credentials,
    base_url: String,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    live: Arc<LiveCache>,
    retry_wait: Duration,
}

impl BitgetClient {
    pub fn new(
        credentials: Credentials,
        network: &NetworkConfig,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        live: Arc<LiveCache>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(network.http_timeout_secs))
            .build()
            .expect("failed to build reqwest client");

        debug!("BitgetClient initialised (base_url=https://api.bitget.com)");

        Self {
            credentials,
            base_url: "https://api.bitget.com".to_string(),
            client,
            limiter,
            breaker,
            live,
            retry_wait: Duration::from_secs(network.network_retry_wait_secs),
        }
    }

    // -------------------------------------------------------------------------
    // Symbol translation
    // -------------------------------------------------------------------------

    /// Neutral `BTCUSDT` -> wire `BTCUSDT_UMCBL`.
    pub fn to_wire_symbol(symbol: &str) -> String {
        format!("{symbol}{CONTRACT_SUFFIX}")
    }

    /// Wire `BTCUSDT_UMCBL` -> neutral `BTCUSDT`.
    pub fn from_wire_symbol(wire: &str) -> String {
        wire.trim_end_matches(CONTRACT_SUFFIX).to_string()
    }

    /// Timeframe string -> wire granularity in seconds.
    fn granularity(timeframe: &str) -> ExchangeResult<u64> {
        crate::market_data::timeframe_ms(timeframe)
            .map(|ms| (ms / 1000) as u64)
            .ok_or_else(|| ExchangeError::Rejected {
                code: "timeframe".into(),
                message: format!("unsupported timeframe {timeframe}"),
            })
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// base64(HMAC-SHA256(secret, timestamp + method + path_with_query + body))
    fn sign(&self, timestamp: u64, method: &str, path_with_query: &str, body: &str) -> String {
        let prehash = format!("{timestamp}{method}{path_with_query}{body}");
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(prehash.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    // -------------------------------------------------------------------------
    // Transport with retry / breaker / limiter
    // -------------------------------------------------------------------------

    /// Perform one request with signing, mapping, and the retry policy for
    /// retryable failures. `signed == false` skips auth headers (public
    /// market-data endpoints).
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        body: Option<serde_json::Value>,
        signed: bool,
    ) -> ExchangeResult<serde_json::Value> {
        let mut attempt = 0;
        loop {
            match self
                .request_once(method.clone(), path, query, body.as_ref(), signed)
                .await
            {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    let wait = match &e {
                        ExchangeError::RateLimited { retry_after_secs } => {
                            Duration::from_secs(*retry_after_secs)
                        }
                        _ => self.retry_wait * 2u32.pow(attempt - 1),
                    };
                    warn!(
                        path,
                        attempt,
                        wait_secs = wait.as_secs(),
                        error = %e,
                        "retrying exchange call"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    self.breaker.record_failure();
                    return Err(e);
                }
            }
        }
    }

    async fn request_once(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        body: Option<&serde_json::Value>,
        signed: bool,
    ) -> ExchangeResult<serde_json::Value> {
        if !self.breaker.admit() {
            return Err(ExchangeError::CircuitOpen);
        }
        self.limiter.acquire().await;

        let path_with_query = if query.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{query}")
        };
        let url = format!("{}{}", self.base_url, path_with_query);

        let body_str = body
            .map(|b| serde_json::to_string(b).unwrap_or_default())
            .unwrap_or_default();

        let mut builder = self.client.request(method.clone(), &url);
        if signed {
            let ts = Self::timestamp_ms();
            let sig = self.sign(ts, method.as_str(), &path_with_query, &body_str);
            builder = builder
                .header("ACCESS-KEY", &self.credentials.api_key)
                .header("ACCESS-SIGN", sig)
                .header("ACCESS-TIMESTAMP", ts.to_string())
                .header("ACCESS-PASSPHRASE", &self.credentials.passphrase);
        }
        if body.is_some() {
            builder = builder
                .header("Content-Type", "application/json")
                .body(body_str);
        }

        let started = Instant::now();
        let resp = builder
            .send()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        let elapsed = started.elapsed();
        if elapsed > Duration::from_secs(1) {
            warn!(path, elapsed_ms = elapsed.as_millis() as u64, "slow exchange call");
        }

        let status = resp.status();

        if status.as_u16() == 429 {
            let retry_after_secs = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(self.retry_wait.as_secs());
            return Err(ExchangeError::RateLimited { retry_after_secs });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ExchangeError::Auth(format!("HTTP {status}")));
        }

        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Network(format!("invalid response body: {e}")))?;

        if status.is_server_error() {
            return Err(ExchangeError::Network(format!("HTTP {status}: {payload}")));
        }
        if !status.is_success() {
            return Err(ExchangeError::Rejected {
                code: status.as_u16().to_string(),
                message: payload.to_string(),
            });
        }

        // Venue envelope: {"code":"00000","msg":"success","data":...}
        let code = payload
            .get("code")
            .and_then(|c| c.as_str())
            .unwrap_or("00000");
        if code != "00000" {
            let message = payload
                .get("msg")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
                .to_string();
            return Err(ExchangeError::Rejected {
                code: code.to_string(),
                message,
            });
        }

        Ok(payload.get("data").cloned().unwrap_or(serde_json::Value::Null))
    }

    // -------------------------------------------------------------------------
    // Parse helpers (the venue sends numbers as strings)
    // -------------------------------------------------------------------------

    fn as_f64(value: &serde_json::Value) -> f64 {
        value
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| value.as_f64())
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl ExchangePort for BitgetClient {
    #[instrument(skip(self), name = "bitget::fetch_ohlcv")]
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> ExchangeResult<Vec<Candle>> {
        let granularity = Self::granularity(timeframe)?;
        let query = format!(
            "symbol={}&granularity={}&limit={}",
            Self::to_wire_symbol(symbol),
            granularity,
            limit
        );
        let data = self
            .request(reqwest::Method::GET, "/api/mix/v1/market/candles", &query, None, false)
            .await?;

        // Rows arrive as [ts, open, high, low, close, baseVolume, quoteVolume].
        let rows = data.as_array().cloned().unwrap_or_default();
        let mut candles = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(arr) = row.as_array() else {
                continue;
            };
            if arr.len() < 6 {
                warn!(len = arr.len(), "skipping malformed candle row");
                continue;
            }
            let open_time = arr[0]
                .as_str()
                .and_then(|s| s.parse().ok())
                .or_else(|| arr[0].as_i64())
                .unwrap_or(0);
            candles.push(Candle::new(
                open_time,
                Self::as_f64(&arr[1]),
                Self::as_f64(&arr[2]),
                Self::as_f64(&arr[3]),
                Self::as_f64(&arr[4]),
                Self::as_f64(&arr[5]),
            ));
        }
        candles.sort_by_key(|c| c.open_time);

        debug!(symbol, timeframe, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "bitget::fetch_balance")]
    async fn fetch_balance(&self) -> ExchangeResult<HashMap<String, BalanceInfo>> {
        let data = self
            .request(
                reqwest::Method::GET,
                "/api/mix/v1/account/accounts",
                "productType=umcbl",
                None,
                true,
            )
            .await?;

        let mut out = HashMap::new();
        for acct in data.as_array().cloned().unwrap_or_default() {
            let currency = acct
                .get("marginCoin")
                .and_then(|v| v.as_str())
                .unwrap_or(MARGIN_COIN)
                .to_string();
            let free = Self::as_f64(acct.get("available").unwrap_or(&serde_json::Value::Null));
            let total = Self::as_f64(acct.get("equity").unwrap_or(&serde_json::Value::Null));
            out.insert(
                currency.clone(),
                BalanceInfo {
                    currency,
                    free,
                    used: (total - free).max(0.0),
                    total,
                },
            );
        }
        Ok(out)
    }

    #[instrument(skip(self), name = "bitget::fetch_positions")]
    async fn fetch_positions(
        &self,
        symbol: Option<&str>,
    ) -> ExchangeResult<Vec<ExchangePosition>> {
        let query = match symbol {
            Some(s) => format!(
                "symbol={}&marginCoin={MARGIN_COIN}",
                Self::to_wire_symbol(s)
            ),
            None => format!("productType=umcbl&marginCoin={MARGIN_COIN}"),
        };
        let path = match symbol {
            Some(_) => "/api/mix/v1/position/singlePosition",
            None => "/api/mix/v1/position/allPosition",
        };
        let data = self
            .request(reqwest::Method::GET, path, &query, None, true)
            .await?;

        let mut out = Vec::new();
        for pos in data.as_array().cloned().unwrap_or_default() {
            let quantity = Self::as_f64(pos.get("total").unwrap_or(&serde_json::Value::Null));
            if quantity <= 0.0 {
                continue;
            }
            let side = match pos.get("holdSide").and_then(|v| v.as_str()) {
                Some("short") => Side::Sell,
                _ => Side::Buy,
            };
            out.push(ExchangePosition {
                symbol: Self::from_wire_symbol(
                    pos.get("symbol").and_then(|v| v.as_str()).unwrap_or(""),
                ),
                side,
                quantity,
                entry_price: Self::as_f64(
                    pos.get("averageOpenPrice").unwrap_or(&serde_json::Value::Null),
                ),
                leverage: Self::as_f64(pos.get("leverage").unwrap_or(&serde_json::Value::Null))
                    as u32,
                unrealized_pnl: Self::as_f64(
                    pos.get("unrealizedPL").unwrap_or(&serde_json::Value::Null),
                ),
            });
        }
        Ok(out)
    }

    #[instrument(skip(self, request), name = "bitget::place_order", fields(symbol = %request.symbol, side = %request.side))]
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<Order> {
        // Wire side encodes open/close intent; reduce-only maps to close_*.
        let wire_side = match (request.side, request.reduce_only) {
            (Side::Buy, false) => "open_long",
            (Side::Sell, false) => "open_short",
            (Side::Buy, true) => "close_short",
            (Side::Sell, true) => "close_long",
        };
        let (path, order_type) = match request.order_type {
            OrderType::StopMarket => ("/api/mix/v1/plan/placePlan", "market"),
            OrderType::Limit => ("/api/mix/v1/order/placeOrder", "limit"),
            OrderType::Market => ("/api/mix/v1/order/placeOrder", "market"),
        };

        let mut body = serde_json::json!({
            "symbol": Self::to_wire_symbol(&request.symbol),
            "marginCoin": MARGIN_COIN,
            "size": format!("{}", request.quantity),
            "side": wire_side,
            "orderType": order_type,
            "timeInForceValue": if request.order_type == OrderType::Market { "ioc" } else { "normal" },
        });
        if let Some(price) = request.price {
            let key = if request.order_type == OrderType::StopMarket {
                "triggerPrice"
            } else {
                "price"
            };
            body[key] = serde_json::json!(format!("{price}"));
        }

        let data = self
            .request(reqwest::Method::POST, path, "", Some(body), true)
            .await?;

        let order_id = data
            .get("orderId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| data.to_string());

        debug!(order_id = %order_id, "order placed");

        // Market orders fill immediately at (approximately) the live price.
        let fill_price = match request.order_type {
            OrderType::Market => self.live.price_unchecked(&request.symbol),
            _ => request.price,
        };

        Ok(Order {
            order_id,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            fill_price,
            status: "submitted".to_string(),
        })
    }

    #[instrument(skip(self), name = "bitget::cancel_order")]
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<()> {
        let body = serde_json::json!({
            "symbol": Self::to_wire_symbol(symbol),
            "marginCoin": MARGIN_COIN,
            "orderId": order_id,
        });
        self.request(
            reqwest::Method::POST,
            "/api/mix/v1/order/cancel-order",
            "",
            Some(body),
            true,
        )
        .await?;
        debug!(order_id, symbol, "order cancelled");
        Ok(())
    }

    #[instrument(skip(self), name = "bitget::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let body = serde_json::json!({
            "symbol": Self::to_wire_symbol(symbol),
            "marginCoin": MARGIN_COIN,
            "leverage": leverage.to_string(),
        });
        self.request(
            reqwest::Method::POST,
            "/api/mix/v1/account/setLeverage",
            "",
            Some(body),
            true,
        )
        .await?;
        debug!(symbol, leverage, "leverage set (isolated)");
        Ok(())
    }

    fn current_price(&self, symbol: &str) -> Option<f64> {
        self.live.price(symbol)
    }
}

impl std::fmt::Debug for BitgetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitgetClient")
            .field("base_url", &self.base_url)
            .field("credentials", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_translation_roundtrip() {
        assert_eq!(BitgetClient::to_wire_symbol("BTCUSDT"), "BTCUSDT_UMCBL");
        assert_eq!(BitgetClient::from_wire_symbol("BTCUSDT_UMCBL"), "BTCUSDT");
        assert_eq!(BitgetClient::from_wire_symbol("ETHUSDT"), "ETHUSDT");
    }

    #[test]
    fn granularity_mapping() {
        assert_eq!(BitgetClient::granularity("1m").unwrap(), 60);
        assert_eq!(BitgetClient::granularity("15m").unwrap(), 900);
        assert_eq!(BitgetClient::granularity("4h").unwrap(), 14_400);
        assert!(BitgetClient::granularity("bogus").is_err());
    }

    #[test]
    fn string_number_parsing() {
        assert_eq!(BitgetClient::as_f64(&serde_json::json!("42.5")), 42.5);
        assert_eq!(BitgetClient::as_f64(&serde_json::json!(7)), 7.0);
        assert_eq!(BitgetClient::as_f64(&serde_json::Value::Null), 0.0);
    }
}
