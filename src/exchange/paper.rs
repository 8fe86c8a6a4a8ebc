// =============================================================================
// Paper Exchange — deterministic order simulator
// =============================================================================
//
// Selected by PAPER_TRADING. Order operations never touch the network: every
// order is accepted, filled at the cached last price, and given a synthetic
// uuid id. Market-data reads are delegated to a real client so that paper
// sessions still run against live candles.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::exchange::{
    ExchangeError, ExchangePort, ExchangePosition, ExchangeResult, Order, OrderRequest,
};
use crate::market_data::{Candle, LiveCache};
use crate::types::{BalanceInfo, OrderType, Side};

/// Starting simulated balance in USDT.
const PAPER_STARTING_BALANCE: f64 = 10_000.0;

pub struct PaperExchange {
    /// Delegate for public market data (candles).
    data_source: Arc<dyn ExchangePort>,
    live: Arc<LiveCache>,
    balance: RwLock<f64>,
    /// Per-symbol simulated net position: (side, quantity, entry price).
    simulated_positions: RwLock<HashMap<String, (Side, f64, f64)>>,
    leverage: RwLock<HashMap<String, u32>>,
}

impl PaperExchange {
    pub fn new(data_source: Arc<dyn ExchangePort>, live: Arc<LiveCache>) -> Self {
        info!(starting_balance = PAPER_STARTING_BALANCE, "paper trading enabled");
        Self {
            data_source,
            live,
            balance: RwLock::new(PAPER_STARTING_BALANCE),
            simulated_positions: RwLock::new(HashMap::new()),
            leverage: RwLock::new(HashMap::new()),
        }
    }

    fn fill_price_for(&self, request: &OrderRequest) -> ExchangeResult<f64> {
        match request.order_type {
            OrderType::Market => self
                .live
                .price_unchecked(&request.symbol)
                .ok_or_else(|| ExchangeError::Rejected {
                    code: "paper_no_price".into(),
                    message: format!("no cached price for {}", request.symbol),
                }),
            _ => request.price.ok_or_else(|| ExchangeError::Rejected {
                code: "paper_no_price".into(),
                message: "limit/stop order without a price".into(),
            }),
        }
    }

    /// Apply a fill to the simulated position book. Reduce-only fills shrink
    /// the tracked position and realize PnL into the simulated balance.
    fn apply_fill(&self, request: &OrderRequest, fill_price: f64) {
        let mut positions = self.simulated_positions.write();
        if request.reduce_only {
            if let Some((side, qty, entry)) = positions.get_mut(&request.symbol) {
                let closed = request.quantity.min(*qty);
                let direction = if *side == Side::Buy { 1.0 } else { -1.0 };
                let pnl = direction * (fill_price - *entry) * closed;
                *qty -= closed;
                *self.balance.write() += pnl;
                if *qty <= f64::EPSILON {
                    positions.remove(&request.symbol);
                }
            }
        } else {
            positions.insert(
                request.symbol.clone(),
                (request.side, request.quantity, fill_price),
            );
        }
    }
}

#[async_trait]
impl ExchangePort for PaperExchange {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> ExchangeResult<Vec<Candle>> {
        self.data_source.fetch_ohlcv(symbol, timeframe, limit).await
    }

    async fn fetch_balance(&self) -> ExchangeResult<HashMap<String, BalanceInfo>> {
        let total = *self.balance.read();
        let mut out = HashMap::new();
        out.insert(
            "USDT".to_string(),
            BalanceInfo {
                currency: "USDT".to_string(),
                free: total,
                used: 0.0,
                total,
            },
        );
        Ok(out)
    }

    async fn fetch_positions(
        &self,
        symbol: Option<&str>,
    ) -> ExchangeResult<Vec<ExchangePosition>> {
        let positions = self.simulated_positions.read();
        let leverage = self.leverage.read();
        Ok(positions
            .iter()
            .filter(|(sym, _)| symbol.map_or(true, |s| s == sym.as_str()))
            .map(|(sym, (side, qty, entry))| ExchangePosition {
                symbol: sym.clone(),
                side: *side,
                quantity: *qty,
                entry_price: *entry,
                leverage: leverage.get(sym).copied().unwrap_or(1),
                unrealized_pnl: 0.0,
            })
            .collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<Order> {
        let fill_price = self.fill_price_for(request)?;
        let order_id = format!("paper-{}", Uuid::new_v4());

        // Stop orders rest on the venue; only immediate orders move the book.
        if request.order_type != OrderType::StopMarket {
            self.apply_fill(request, fill_price);
        }

        debug!(
            order_id = %order_id,
            symbol = %request.symbol,
            side = %request.side,
            qty = request.quantity,
            fill_price,
            "paper order filled"
        );

        Ok(Order {
            order_id,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            fill_price: Some(fill_price),
            status: "filled".to_string(),
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<()> {
        debug!(order_id, symbol, "paper order cancelled");
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.leverage.write().insert(symbol.to_string(), leverage);
        Ok(())
    }

    fn current_price(&self, symbol: &str) -> Option<f64> {
        self.live.price(symbol)
    }
}

impl std::fmt::Debug for PaperExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperExchange")
            .field("balance", &*self.balance.read())
            .field("positions", &self.simulated_positions.read().len())
            .finish()
    }
}
