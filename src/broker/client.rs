// =============================================================================
// Alpaca REST API Client — header-authenticated trading + market data
// =============================================================================
//
// SECURITY: the secret key is sent only as the APCA-API-SECRET-KEY header
// and is never logged or serialized.
//
// Every request records a CallEvent through the rate-limit monitor,
// regardless of outcome. HTTP 429 surfaces as RateLimited (with the
// Retry-After header when present); other 4xx/5xx become Broker errors with
// the response's message; connection/timeout failures become Transport.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::Settings;
use crate::error::{Result, TradingError};
use crate::telemetry::rate_limit::RateLimitMonitor;
use crate::types::{OrderType, TimeInForce};

use super::models::{
    coerce_fractional_shape, normalize_qty, Account, AssetInfo, LastTrade, MarketClock, Order,
    OrderResult, Position, Quote,
};
use super::{Broker, OrderRequest};

/// Provider key used for call telemetry.
const API_NAME: &str = "alpaca";

/// Alpaca trading + market data client.
pub struct AlpacaClient {
    base_url: String,
    data_url: String,
    allow_fractional: bool,
    client: reqwest::Client,
    monitor: Arc<RateLimitMonitor>,
    asset_cache: RwLock<HashMap<String, AssetInfo>>,
}

impl AlpacaClient {
    /// Build a client from settings.
    ///
    /// # Errors
    /// `Config` when the credentials cannot be encoded as HTTP headers.
    pub fn new(settings: &Settings, monitor: Arc<RateLimitMonitor>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&settings.alpaca_api_key)
            .map_err(|_| TradingError::Config("ALPACA_API_KEY contains invalid characters".into()))?;
        let secret = HeaderValue::from_str(&settings.alpaca_secret_key).map_err(|_| {
            TradingError::Config("ALPACA_SECRET_KEY contains invalid characters".into())
        })?;
        headers.insert("APCA-API-KEY-ID", key);
        headers.insert("APCA-API-SECRET-KEY", secret);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.timeouts.broker_secs))
            .build()
            .map_err(|e| TradingError::Config(format!("failed to build HTTP client: {e}")))?;

        debug!(base_url = %settings.alpaca_base_url, "AlpacaClient initialised");

        Ok(Self {
            base_url: settings.alpaca_base_url.trim_end_matches('/').to_string(),
            data_url: settings.alpaca_data_url.trim_end_matches('/').to_string(),
            allow_fractional: settings.allow_fractional,
            client,
            monitor,
            asset_cache: RwLock::new(HashMap::new()),
        })
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Map an endpoint path to a call type for telemetry.
    fn call_type(path: &str) -> &'static str {
        let lower = path.to_lowercase();
        if lower.contains("orders") {
            "orders"
        } else if lower.contains("positions") {
            "positions"
        } else if lower.contains("account") {
            "account"
        } else if lower.contains("assets") {
            "assets"
        } else if lower.contains("clock") {
            "clock"
        } else if lower.contains("quotes") {
            "quotes"
        } else if lower.contains("trades") {
            "trades"
        } else {
            "general"
        }
    }

    /// Issue one request and decode the JSON body. Records a CallEvent for
    /// every outcome.
    async fn request(
        &self,
        method: reqwest::Method,
        url: String,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value> {
        let call_type = Self::call_type(&url);
        let started = Instant::now();

        let mut builder = self.client.request(method, &url);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(json) = &body {
            builder = builder.json(json);
        }

        let response = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let latency = started.elapsed().as_millis() as u64;
                self.monitor
                    .record_call(API_NAME, call_type, false, latency, None);
                return Err(TradingError::from_transport(e));
            }
        };

        let latency = started.elapsed().as_millis() as u64;
        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            self.monitor.record_rate_limit_hit(API_NAME, retry_after);
            self.monitor
                .record_call(API_NAME, call_type, false, latency, None);
            return Err(TradingError::RateLimited { retry_after });
        }

        let remaining = response
            .headers()
            .get("X-RateLimit-Remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());

        let body_text = match response.text().await {
            Ok(t) => t,
            Err(e) => {
                self.monitor
                    .record_call(API_NAME, call_type, false, latency, None);
                return Err(TradingError::from_transport(e));
            }
        };

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body_text)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| body_text.clone());
            self.monitor
                .record_call(API_NAME, call_type, false, latency, None);
            return Err(TradingError::Broker {
                status: status.as_u16(),
                message,
            });
        }

        self.monitor
            .record_call(API_NAME, call_type, true, latency, remaining);

        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| TradingError::Transport(format!("invalid JSON from broker: {e}")))
    }

    async fn trading_get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.request(
            reqwest::Method::GET,
            format!("{}/{}", self.base_url, path),
            query,
            None,
        )
        .await
    }

    async fn trading_delete(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.request(
            reqwest::Method::DELETE,
            format!("{}/{}", self.base_url, path),
            query,
            None,
        )
        .await
    }

    async fn post_order_body(&self, body: Value) -> Result<Value> {
        self.request(
            reqwest::Method::POST,
            format!("{}/orders", self.base_url),
            &[],
            Some(body),
        )
        .await
    }

    async fn data_get(&self, path: &str) -> Result<Value> {
        self.request(
            reqwest::Method::GET,
            format!("{}/{}", self.data_url, path),
            &[],
            None,
        )
        .await
    }
}

#[async_trait]
impl Broker for AlpacaClient {
    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "alpaca::get_account")]
    async fn get_account(&self) -> Result<Account> {
        let body = self.trading_get("account", &[]).await?;
        Ok(Account::from_json(&body))
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "alpaca::get_positions")]
    async fn get_positions(&self) -> Result<Vec<Position>> {
        let body = self.trading_get("positions", &[]).await?;
        let positions = body
            .as_array()
            .map(|arr| arr.iter().map(Position::from_json).collect())
            .unwrap_or_default();
        Ok(positions)
    }

    #[instrument(skip(self), name = "alpaca::get_position")]
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        let path = format!("positions/{}", symbol.to_uppercase());
        match self.trading_get(&path, &[]).await {
            Ok(body) => Ok(Some(Position::from_json(&body))),
            Err(TradingError::Broker { status: 404, .. }) => Ok(None),
            Err(TradingError::Broker { message, status })
                if message.to_lowercase().contains("position does not exist") =>
            {
                debug!(symbol, status, "no position");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn close_position(&self, symbol: &str, qty: Option<f64>) -> OrderResult {
        let path = format!("positions/{}", symbol.to_uppercase());
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(q) = qty {
            query.push(("qty", q.to_string()));
        }

        match self.trading_delete(&path, &query).await {
            Ok(body) => OrderResult::ok(
                Some(Order::from_json(&body)),
                format!("Closed position: {symbol}"),
            ),
            Err(e) => OrderResult::failed(e.to_string(), format!("Failed to close position: {symbol}")),
        }
    }

    async fn close_all_positions(&self) -> Vec<OrderResult> {
        match self.trading_delete("positions", &[]).await {
            Ok(body) => body
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .map(|entry| {
                            // The bulk endpoint nests each order under "body".
                            let order_json = entry.get("body").unwrap_or(entry);
                            let order = Order::from_json(order_json);
                            let symbol = order.symbol.clone();
                            OrderResult::ok(Some(order), format!("Closed: {symbol}"))
                        })
                        .collect()
                })
                .unwrap_or_default(),
            Err(e) => vec![OrderResult::failed(
                e.to_string(),
                "Failed to close all positions",
            )],
        }
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    #[instrument(skip(self, symbols), name = "alpaca::get_orders")]
    async fn get_orders(
        &self,
        status: &str,
        limit: usize,
        symbols: Option<&[String]>,
    ) -> Result<Vec<Order>> {
        let mut query = vec![
            ("status", status.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(syms) = symbols {
            query.push(("symbols", syms.join(",")));
        }

        let body = self.trading_get("orders", &query).await?;
        let orders = body
            .as_array()
            .map(|arr| arr.iter().map(Order::from_json).collect::<Vec<_>>())
            .unwrap_or_default();
        debug!(count = orders.len(), status, "orders retrieved");
        Ok(orders)
    }

    #[instrument(skip(self), name = "alpaca::get_order")]
    async fn get_order(&self, order_id: &str) -> Result<Order> {
        let body = self.trading_get(&format!("orders/{order_id}"), &[]).await?;
        Ok(Order::from_json(&body))
    }

    #[instrument(
        skip(self, request),
        fields(symbol = %request.symbol, side = %request.side, qty = request.qty),
        name = "alpaca::submit_order"
    )]
    async fn submit_order(&self, request: OrderRequest) -> OrderResult {
        let symbol = request.symbol.to_uppercase();

        // Only hit the asset endpoint when the quantity is actually
        // fractional and fractional trading is globally on.
        let rounded = crate::types::round_qty(request.qty);
        let needs_asset_check = self.allow_fractional && rounded.fract() != 0.0;
        let fractionable = if needs_asset_check {
            self.is_fractionable(&symbol).await
        } else {
            true
        };

        let normalized = normalize_qty(request.qty, self.allow_fractional, fractionable);
        if let Some(note) = &normalized.adjustment {
            warn!(symbol = %symbol, note = %note, "order quantity adjusted");
        }

        // An order that was rounded under the fractional policy also goes
        // out as MARKET + DAY, matching the shape a fractional fill takes.
        let force_market_day = normalized.is_fractional || normalized.adjustment.is_some();
        let (order_type, tif, shape_note) =
            coerce_fractional_shape(force_market_day, request.order_type, request.time_in_force);
        if let Some(note) = &shape_note {
            warn!(symbol = %symbol, note = %note, "order shape converted");
        }

        let mut body = serde_json::json!({
            "symbol": symbol,
            "qty": normalized.qty.to_string(),
            "side": request.side.as_str(),
            "type": order_type.as_str(),
            "time_in_force": tif.as_str(),
        });
        // Price fields only survive on non-fractional orders (fractional was
        // already coerced to market/day above).
        if order_type != OrderType::Market {
            if let Some(limit) = request.limit_price {
                body["limit_price"] = Value::String(limit.to_string());
            }
            if let Some(stop) = request.stop_price {
                body["stop_price"] = Value::String(stop.to_string());
            }
        }
        if let Some(client_id) = &request.client_order_id {
            body["client_order_id"] = Value::String(client_id.clone());
        }

        let adjusted = normalized.adjustment.is_some();
        match self.post_order_body(body.clone()).await {
            Ok(response) => {
                let order = Order::from_json(&response);
                let qty_display = if normalized.is_fractional {
                    format!("{:.4}", normalized.qty)
                } else {
                    format!("{:.0}", normalized.qty)
                };
                let message = if adjusted {
                    format!("Order submitted (rounded): {} {} {}", request.side, qty_display, symbol)
                } else {
                    format!("Order submitted: {} {} {}", request.side, qty_display, symbol)
                };
                info!(symbol = %symbol, side = %request.side, qty = %qty_display, "order placed");
                OrderResult::ok(Some(order), message)
            }
            Err(TradingError::Broker { status, message })
                if message.to_lowercase().contains("fractional") =>
            {
                // One-shot fallback: retry with whole shares, preserving the
                // client order id.
                let whole_qty = normalized.qty.floor().max(1.0);
                warn!(
                    symbol = %symbol,
                    status,
                    whole_qty,
                    "asset rejected fractional order; retrying with whole shares"
                );
                body["qty"] = Value::String(format!("{whole_qty}"));
                body["type"] = Value::String(OrderType::Market.as_str().to_string());
                body["time_in_force"] = Value::String(TimeInForce::Day.as_str().to_string());

                match self.post_order_body(body).await {
                    Ok(response) => OrderResult::ok(
                        Some(Order::from_json(&response)),
                        format!(
                            "Order submitted (rounded): {} {:.0} {}",
                            request.side, whole_qty, symbol
                        ),
                    ),
                    Err(retry_err) => OrderResult::failed(
                        retry_err.to_string(),
                        format!("Failed to submit order for {symbol}"),
                    ),
                }
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "order submission failed");
                OrderResult::failed(e.to_string(), format!("Failed to submit order for {symbol}"))
            }
        }
    }

    async fn cancel_order(&self, order_id: &str) -> OrderResult {
        match self.trading_delete(&format!("orders/{order_id}"), &[]).await {
            Ok(_) => OrderResult::ok(None, format!("Order cancelled: {order_id}")),
            Err(e) => OrderResult::failed(e.to_string(), format!("Failed to cancel order: {order_id}")),
        }
    }

    async fn cancel_all_orders(&self) -> OrderResult {
        match self.trading_delete("orders", &[]).await {
            Ok(_) => OrderResult::ok(None, "All orders cancelled"),
            Err(e) => OrderResult::failed(e.to_string(), "Failed to cancel all orders"),
        }
    }

    // -------------------------------------------------------------------------
    // Assets
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "alpaca::get_asset")]
    async fn get_asset(&self, symbol: &str) -> Result<Option<AssetInfo>> {
        let symbol = symbol.to_uppercase();

        if let Some(cached) = self.asset_cache.read().get(&symbol) {
            return Ok(Some(cached.clone()));
        }

        match self.trading_get(&format!("assets/{symbol}"), &[]).await {
            Ok(body) => {
                let asset = AssetInfo::from_json(&body);
                // Insert-only; a concurrent racer's last write wins.
                self.asset_cache.write().insert(symbol, asset.clone());
                Ok(Some(asset))
            }
            Err(TradingError::Broker { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn clear_asset_cache(&self) {
        self.asset_cache.write().clear();
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "alpaca::get_quote")]
    async fn get_quote(&self, symbol: &str) -> Result<Quote> {
        let symbol = symbol.to_uppercase();
        let body = self
            .data_get(&format!("stocks/{symbol}/quotes/latest"))
            .await?;
        let quote = body.get("quote").cloned().unwrap_or(Value::Null);

        Ok(Quote {
            symbol,
            bid: super::models::num(&quote, "bp"),
            ask: super::models::num(&quote, "ap"),
            bid_size: super::models::num(&quote, "bs") as u64,
            ask_size: super::models::num(&quote, "as") as u64,
            timestamp: quote.get("t").and_then(Value::as_str).map(str::to_string),
        })
    }

    #[instrument(skip(self), name = "alpaca::get_last_trade")]
    async fn get_last_trade(&self, symbol: &str) -> Result<LastTrade> {
        let symbol = symbol.to_uppercase();
        let body = self
            .data_get(&format!("stocks/{symbol}/trades/latest"))
            .await?;
        let trade = body.get("trade").cloned().unwrap_or(Value::Null);

        Ok(LastTrade {
            symbol,
            price: super::models::num(&trade, "p"),
            size: super::models::num(&trade, "s") as u64,
            timestamp: trade.get("t").and_then(Value::as_str).map(str::to_string),
        })
    }

    #[instrument(skip(self), name = "alpaca::get_clock")]
    async fn get_clock(&self) -> Result<MarketClock> {
        let body = self.trading_get("clock", &[]).await?;
        Ok(MarketClock::from_json(&body))
    }
}

impl std::fmt::Debug for AlpacaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlpacaClient")
            .field("api_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("data_url", &self.data_url)
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
    fn call_type_mapping() {
        assert_eq!(AlpacaClient::call_type("https://x/v2/orders"), "orders");
        assert_eq!(AlpacaClient::call_type("https://x/v2/positions/AAPL"), "positions");
        assert_eq!(AlpacaClient::call_type("https://x/v2/account"), "account");
        assert_eq!(AlpacaClient::call_type("https://x/v2/assets/AAPL"), "assets");
        assert_eq!(AlpacaClient::call_type("https://x/v2/clock"), "clock");
        assert_eq!(
            AlpacaClient::call_type("https://x/v2/stocks/AAPL/quotes/latest"),
            "quotes"
        );
        assert_eq!(AlpacaClient::call_type("https://x/v2/something"), "general");
    }

    #[test]
    fn debug_redacts_credentials() {
        let settings = crate::config::Settings::for_tests();
        let monitor = Arc::new(RateLimitMonitor::new());
        let client = AlpacaClient::new(&settings, monitor).unwrap();
        let debug = format!("{client:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("test-key"));
        assert!(!debug.contains("test-secret"));
    }
}
