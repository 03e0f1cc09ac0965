// =============================================================================
// Broker Gateway — typed contract over the trading API
// =============================================================================
//
// The `Broker` trait is the seam between the engine and the brokerage. The
// trading cycle, position monitor, and performance tracker all hold
// `Arc<dyn Broker>`, so tests inject fakes without touching HTTP.
// `AlpacaClient` is the production implementation.
// =============================================================================

pub mod client;
pub mod models;

use async_trait::async_trait;

pub use client::AlpacaClient;
pub use models::{
    evaluate_pdt, normalize_qty, Account, AssetInfo, LastTrade, MarketClock, NormalizedQty,
    Order, OrderResult, PdtStatus, PortfolioSnapshot, Position, PositionSnapshot, Quote,
    PDT_THRESHOLD,
};

use crate::error::Result;
use crate::types::{OrderSide, OrderType, TimeInForce, TradeAction};

/// Parameters for a new order submission.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: f64,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// Market-day order, the default shape for engine-driven trades.
    pub fn market(symbol: impl Into<String>, qty: f64, side: OrderSide) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
            limit_price: None,
            stop_price: None,
            client_order_id: None,
        }
    }
}

/// The broker contract consumed by the rest of the engine.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_account(&self) -> Result<Account>;

    async fn get_positions(&self) -> Result<Vec<Position>>;

    /// `None` when no position exists for the symbol.
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>>;

    async fn get_orders(
        &self,
        status: &str,
        limit: usize,
        symbols: Option<&[String]>,
    ) -> Result<Vec<Order>>;

    async fn get_order(&self, order_id: &str) -> Result<Order>;

    /// Submit an order under the fractional policy. Business rejections are
    /// reported through `OrderResult::success = false`, never panics.
    async fn submit_order(&self, request: OrderRequest) -> OrderResult;

    async fn cancel_order(&self, order_id: &str) -> OrderResult;

    async fn cancel_all_orders(&self) -> OrderResult;

    /// Close a position (fully when `qty` is `None`).
    async fn close_position(&self, symbol: &str, qty: Option<f64>) -> OrderResult;

    async fn close_all_positions(&self) -> Vec<OrderResult>;

    /// Asset metadata, served from the in-process cache when possible.
    async fn get_asset(&self, symbol: &str) -> Result<Option<AssetInfo>>;

    /// Unknown assets are treated as not fractionable.
    async fn is_fractionable(&self, symbol: &str) -> bool {
        match self.get_asset(symbol).await {
            Ok(Some(asset)) => asset.fractionable,
            _ => false,
        }
    }

    fn clear_asset_cache(&self) {}

    async fn get_quote(&self, symbol: &str) -> Result<Quote>;

    async fn get_last_trade(&self, symbol: &str) -> Result<LastTrade>;

    /// Price discovery fallback chain: last trade → quote midpoint → the
    /// position's `current_price`.
    async fn get_current_price(&self, symbol: &str) -> Option<f64> {
        if let Ok(trade) = self.get_last_trade(symbol).await {
            if trade.price > 0.0 {
                return Some(trade.price);
            }
        }
        if let Ok(quote) = self.get_quote(symbol).await {
            if let Some(mid) = quote.midpoint() {
                return Some(mid);
            }
        }
        if let Ok(Some(position)) = self.get_position(symbol).await {
            if position.current_price > 0.0 {
                return Some(position.current_price);
            }
        }
        None
    }

    async fn get_clock(&self) -> Result<MarketClock>;

    /// PDT gate evaluated over a fresh account snapshot.
    async fn check_pdt_status(&self) -> Result<PdtStatus> {
        Ok(evaluate_pdt(&self.get_account().await?))
    }

    /// Map a portfolio-manager action to broker verbs. `hold` or a
    /// non-positive quantity is a successful no-op.
    async fn execute_decision(&self, symbol: &str, action: TradeAction, qty: f64) -> OrderResult {
        let qty = crate::types::round_qty(qty);
        if action == TradeAction::Hold || qty <= 0.0 {
            return OrderResult::ok(None, format!("No action taken for {symbol} (hold)"));
        }

        match action {
            TradeAction::Buy | TradeAction::Sell | TradeAction::Short => {
                let side = action
                    .order_side()
                    .expect("buy/sell/short always map to a side");
                self.submit_order(OrderRequest::market(symbol, qty, side)).await
            }
            TradeAction::Cover => {
                // Cover buys back the open short; cap at the short size.
                match self.get_position(symbol).await {
                    Ok(Some(position)) if position.is_short() => {
                        let cover_qty = qty.min(position.qty.abs());
                        self.submit_order(OrderRequest::market(symbol, cover_qty, OrderSide::Buy))
                            .await
                    }
                    Ok(_) => OrderResult::failed(
                        "no short position found",
                        format!("No short position to cover for {symbol}"),
                    ),
                    Err(e) => OrderResult::failed(
                        e.to_string(),
                        format!("Failed to look up short position for {symbol}"),
                    ),
                }
            }
            TradeAction::Hold => unreachable!("handled above"),
        }
    }

    /// Portfolio snapshot for downstream consumers (decision collaborator,
    /// performance tracker).
    async fn sync_portfolio(&self) -> Result<PortfolioSnapshot> {
        let account = self.get_account().await?;
        let positions = self.get_positions().await?;
        Ok(PortfolioSnapshot::build(&account, &positions))
    }
}
