// =============================================================================
// Exchange Port — the engine's only doorway to the venue
// =============================================================================
//
// Everything downstream (market data, position manager, capital tracker)
// talks to this trait. Two implementations exist:
//
//   - `BitgetClient`  — signed REST against the real venue, wrapped in the
//                       shared rate limiter and circuit breaker.
//   - `PaperExchange` — deterministic simulator filling at the cached last
//                       price (selected by PAPER_TRADING).
//
// Symbols at this boundary are exchange-neutral (`BTCUSDT`); wire-format
// translation lives inside the adapters.
// =============================================================================

pub mod bitget;
pub mod breaker;
pub mod paper;
pub mod rate_limit;
pub mod stream;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::EngineError;
use crate::market_data::Candle;
use crate::types::{OrderType, Side};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure modes of every port operation.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("exchange rejected (code {code}): {message}")]
    Rejected { code: String, message: String },

    #[error("circuit breaker open")]
    CircuitOpen,
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited { .. })
    }
}

impl From<ExchangeError> for EngineError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::RateLimited { retry_after_secs } => {
                EngineError::RateLimited { retry_after_secs }
            }
            ExchangeError::Network(msg) => EngineError::Network(msg),
            ExchangeError::Auth(msg) => EngineError::Auth(msg),
            ExchangeError::Rejected { code, message } => {
                EngineError::ExchangeRejected { code, message }
            }
            ExchangeError::CircuitOpen => EngineError::Network("circuit breaker open".into()),
        }
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Parameters for a new order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Limit price (limit orders) or trigger price (stop-market orders).
    pub price: Option<f64>,
    /// Reduce-only orders can only shrink an existing position.
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            reduce_only: false,
        }
    }

    pub fn stop_market(symbol: &str, side: Side, quantity: f64, trigger: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::StopMarket,
            quantity,
            price: Some(trigger),
            reduce_only: true,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// A placed (possibly filled) order as reported by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Average fill price when filled, else the submitted price.
    pub fill_price: Option<f64>,
    pub status: String,
}

/// Position as reported by the venue (used for reconciliation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
}

// ---------------------------------------------------------------------------
// Port trait
// ---------------------------------------------------------------------------

/// Authenticated operations against the venue. Every call obeys the shared
/// rate limiter and circuit breaker before touching the network.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    /// Most recent `limit` closed candles, oldest first.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> ExchangeResult<Vec<Candle>>;

    /// Balances per currency.
    async fn fetch_balance(&self) -> ExchangeResult<HashMap<String, crate::types::BalanceInfo>>;

    /// Open positions, optionally filtered by symbol.
    async fn fetch_positions(&self, symbol: Option<&str>)
        -> ExchangeResult<Vec<ExchangePosition>>;

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<Order>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<()>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    /// Fresh last price from the live cache; `None` when stale or unknown.
    fn current_price(&self, symbol: &str) -> Option<f64>;
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_request_builders() {
        let entry = OrderRequest::market("BTCUSDT", Side::Buy, 0.5);
        assert_eq!(entry.order_type, OrderType::Market);
        assert!(!entry.reduce_only);
        assert!(entry.price.is_none());

        let stop = OrderRequest::stop_market("BTCUSDT", Side::Sell, 0.5, 41_000.0);
        assert_eq!(stop.order_type, OrderType::StopMarket);
        assert!(stop.reduce_only);
        assert_eq!(stop.price, Some(41_000.0));
    }

    #[test]
    fn error_mapping_preserves_kind() {
        let e: EngineError = ExchangeError::RateLimited {
            retry_after_secs: 2,
        }
        .into();
        assert_eq!(e.kind(), "rate_limit");

        let e: EngineError = ExchangeError::Auth("bad key".into()).into();
        assert!(e.is_fatal());
    }
}
