// =============================================================================
// Test fixtures — fakes for the broker, price provider, and collaborators
// =============================================================================
//
// Compiled only for tests. Components take their collaborators through
// traits, so these fakes plug in anywhere the production clients would.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use parking_lot::Mutex;

use crate::broker::{
    Account, AssetInfo, Broker, LastTrade, MarketClock, Order, OrderRequest, OrderResult,
    Position, Quote,
};
use crate::cycle::collaborators::{ResearchCollaborator, ResearchDepth, ResearchOutcome};
use crate::data::PriceProvider;
use crate::error::{Result, TradingError};
use crate::types::{Direction, OrderStatus, PriceBar, Strength, TradingSignal};

// -----------------------------------------------------------------------------
// Builders
// -----------------------------------------------------------------------------

pub fn make_account(equity: f64) -> Account {
    Account {
        id: "test-account".to_string(),
        account_number: "PA0TEST".to_string(),
        status: "ACTIVE".to_string(),
        cash: equity,
        buying_power: equity,
        equity,
        portfolio_value: equity,
        pattern_day_trader: false,
        daytrade_count: 0,
        shorting_enabled: true,
        trading_blocked: false,
        multiplier: "1".to_string(),
        initial_margin: 0.0,
        maintenance_margin: 0.0,
    }
}

pub fn make_position(symbol: &str, qty: f64, side: &str, entry: f64, current: f64) -> Position {
    Position {
        symbol: symbol.to_string(),
        qty,
        qty_available: qty,
        side: side.to_string(),
        avg_entry_price: entry,
        current_price: current,
        market_value: qty * current,
        cost_basis: qty * entry,
        unrealized_pl: (current - entry) * qty,
        unrealized_pl_pct: if entry > 0.0 {
            (current - entry) / entry * 100.0
        } else {
            0.0
        },
        change_today: 0.0,
    }
}

pub fn make_signal(ticker: &str, direction: Direction, confidence: f64, entry: f64) -> TradingSignal {
    let (stop, target) = match direction {
        Direction::Short => (entry * 1.05, entry * 0.90),
        _ => (entry * 0.95, entry * 1.10),
    };
    TradingSignal {
        ticker: ticker.to_string(),
        strategy: "momentum".to_string(),
        direction,
        strength: Strength::Moderate,
        confidence,
        entry_price: entry,
        stop_loss: stop,
        take_profit: target,
        position_size_pct: 0.05,
        reasoning: "test signal".to_string(),
        timestamp: Utc::now(),
        fractionable: true,
    }
}

/// Daily bars ending today built from closes; OHLC derived around the close.
pub fn bars_from_closes(closes: &[f64]) -> Vec<PriceBar> {
    let volumes = vec![1_000_000.0; closes.len()];
    bars_with_volumes(closes, &volumes)
}

pub fn bars_with_volumes(closes: &[f64], volumes: &[f64]) -> Vec<PriceBar> {
    assert_eq!(closes.len(), volumes.len());
    let today = Utc::now().date_naive();
    let n = closes.len() as i64;
    closes
        .iter()
        .zip(volumes)
        .enumerate()
        .map(|(i, (&close, &volume))| PriceBar {
            date: today - Duration::days(n - 1 - i as i64),
            open: close,
            high: close * 1.01,
            low: close * 0.99,
            close,
            volume,
        })
        .collect()
}

/// Ten bars of accelerating closes with a volume push at the end; produces a
/// long momentum signal with confidence in the 70–85 band.
pub fn momentum_bars() -> Vec<PriceBar> {
    bars_with_volumes(
        &[100.0, 100.0, 101.0, 102.0, 103.0, 104.0, 106.0, 108.0, 110.0, 112.0],
        &[1e6, 1e6, 1e6, 1e6, 1e6, 1e6, 1.4e6, 1.5e6, 1.7e6, 2.0e6],
    )
}

// -----------------------------------------------------------------------------
// Fake price provider
// -----------------------------------------------------------------------------

#[derive(Default)]
pub struct FakePriceProvider {
    bars: Mutex<HashMap<String, Vec<PriceBar>>>,
    delay_ms: AtomicU64,
}

impl FakePriceProvider {
    pub fn set_bars(&self, ticker: &str, bars: Vec<PriceBar>) {
        self.bars.lock().insert(ticker.to_uppercase(), bars);
    }

    pub fn set_delay_ms(&self, millis: u64) {
        self.delay_ms.store(millis, Ordering::SeqCst);
    }
}

#[async_trait]
impl PriceProvider for FakePriceProvider {
    async fn get_prices(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }

        let bars = self.bars.lock().get(&ticker.to_uppercase()).cloned();
        match bars {
            Some(bars) => Ok(bars
                .into_iter()
                .filter(|b| b.date >= start && b.date <= end)
                .collect()),
            None => Err(TradingError::Transport(format!(
                "no bars configured for {ticker}"
            ))),
        }
    }
}

// -----------------------------------------------------------------------------
// Fake broker
// -----------------------------------------------------------------------------

pub struct FakeBroker {
    account: Mutex<Account>,
    positions: Mutex<Vec<Position>>,
    open_orders: Mutex<Vec<Order>>,
    submitted: Mutex<Vec<OrderRequest>>,
    closed: Mutex<Vec<(String, Option<f64>)>>,
    fractionable: Mutex<HashMap<String, bool>>,
    trade_prices: Mutex<HashMap<String, f64>>,
    order_seq: AtomicU64,
}

impl FakeBroker {
    pub fn with_equity(equity: f64) -> Self {
        Self {
            account: Mutex::new(make_account(equity)),
            positions: Mutex::new(Vec::new()),
            open_orders: Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            fractionable: Mutex::new(HashMap::new()),
            trade_prices: Mutex::new(HashMap::new()),
            order_seq: AtomicU64::new(1),
        }
    }

    pub fn set_account(&self, account: Account) {
        *self.account.lock() = account;
    }

    pub fn add_position(&self, position: Position) {
        self.positions.lock().push(position);
    }

    pub fn set_trade_price(&self, symbol: &str, price: f64) {
        self.trade_prices
            .lock()
            .insert(symbol.to_uppercase(), price);
    }

    pub fn set_fractionable(&self, symbol: &str, fractionable: bool) {
        self.fractionable
            .lock()
            .insert(symbol.to_uppercase(), fractionable);
    }

    pub fn submissions(&self) -> Vec<OrderRequest> {
        self.submitted.lock().clone()
    }

    pub fn closed_positions(&self) -> Vec<(String, Option<f64>)> {
        self.closed.lock().clone()
    }

    fn synth_order(&self, symbol: &str, side: &str, qty: f64, status: OrderStatus) -> Order {
        let id = self.order_seq.fetch_add(1, Ordering::SeqCst);
        Order {
            id: format!("fake-order-{id}"),
            client_order_id: format!("fake-client-{id}"),
            symbol: symbol.to_uppercase(),
            side: side.to_string(),
            order_type: "market".to_string(),
            qty,
            filled_qty: if status == OrderStatus::Filled { qty } else { 0.0 },
            filled_avg_price: self.trade_prices.lock().get(&symbol.to_uppercase()).copied(),
            status,
            time_in_force: "day".to_string(),
            limit_price: None,
            stop_price: None,
            submitted_at: Some(Utc::now()),
            filled_at: (status == OrderStatus::Filled).then(Utc::now),
        }
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn get_account(&self) -> Result<Account> {
        Ok(self.account.lock().clone())
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        Ok(self.positions.lock().clone())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        Ok(self
            .positions
            .lock()
            .iter()
            .find(|p| p.symbol.eq_ignore_ascii_case(symbol))
            .cloned())
    }

    async fn get_orders(
        &self,
        status: &str,
        limit: usize,
        symbols: Option<&[String]>,
    ) -> Result<Vec<Order>> {
        let orders: Vec<Order> = self
            .open_orders
            .lock()
            .iter()
            .filter(|o| status != "open" || o.status.is_open())
            .filter(|o| {
                symbols
                    .map(|list| list.iter().any(|s| s.eq_ignore_ascii_case(&o.symbol)))
                    .unwrap_or(true)
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(orders)
    }

    async fn get_order(&self, order_id: &str) -> Result<Order> {
        self.open_orders
            .lock()
            .iter()
            .find(|o| o.id == order_id)
            .cloned()
            .ok_or(TradingError::Broker {
                status: 404,
                message: "order not found".to_string(),
            })
    }

    async fn submit_order(&self, request: OrderRequest) -> OrderResult {
        let order = self.synth_order(
            &request.symbol,
            request.side.as_str(),
            request.qty,
            OrderStatus::Filled,
        );
        let message = format!(
            "Order submitted: {} {} {}",
            request.side, request.qty, request.symbol
        );
        self.submitted.lock().push(request);
        OrderResult::ok(Some(order), message)
    }

    async fn cancel_order(&self, order_id: &str) -> OrderResult {
        OrderResult::ok(None, format!("Order cancelled: {order_id}"))
    }

    async fn cancel_all_orders(&self) -> OrderResult {
        OrderResult::ok(None, "All orders cancelled")
    }

    async fn close_position(&self, symbol: &str, qty: Option<f64>) -> OrderResult {
        self.closed.lock().push((symbol.to_uppercase(), qty));

        let closing_side = match self
            .positions
            .lock()
            .iter()
            .find(|p| p.symbol.eq_ignore_ascii_case(symbol))
        {
            Some(p) if p.is_short() => "buy",
            _ => "sell",
        };

        // Leave the position in place but register the open closing order so
        // idempotence checks see it.
        let order = self.synth_order(symbol, closing_side, qty.unwrap_or(0.0), OrderStatus::New);
        self.open_orders.lock().push(order.clone());
        OrderResult::ok(Some(order), format!("Closed position: {symbol}"))
    }

    async fn close_all_positions(&self) -> Vec<OrderResult> {
        let symbols: Vec<String> = self
            .positions
            .lock()
            .iter()
            .map(|p| p.symbol.clone())
            .collect();
        let mut results = Vec::new();
        for symbol in symbols {
            results.push(self.close_position(&symbol, None).await);
        }
        results
    }

    async fn get_asset(&self, symbol: &str) -> Result<Option<AssetInfo>> {
        let fractionable = self
            .fractionable
            .lock()
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(true);
        Ok(Some(AssetInfo {
            symbol: symbol.to_uppercase(),
            name: format!("{symbol} Test Inc"),
            exchange: "NASDAQ".to_string(),
            asset_class: "us_equity".to_string(),
            tradable: true,
            fractionable,
            shortable: true,
            marginable: true,
            min_order_size: 1.0,
            min_trade_increment: if fractionable { 0.0001 } else { 1.0 },
            price_increment: 0.01,
        }))
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote> {
        let price = self
            .trade_prices
            .lock()
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(0.0);
        Ok(Quote {
            symbol: symbol.to_uppercase(),
            bid: price,
            ask: price,
            bid_size: 100,
            ask_size: 100,
            timestamp: None,
        })
    }

    async fn get_last_trade(&self, symbol: &str) -> Result<LastTrade> {
        let price = self
            .trade_prices
            .lock()
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(0.0);
        Ok(LastTrade {
            symbol: symbol.to_uppercase(),
            price,
            size: 100,
            timestamp: None,
        })
    }

    async fn get_clock(&self) -> Result<MarketClock> {
        Ok(MarketClock {
            is_open: true,
            next_open: None,
            next_close: Some("16:00".to_string()),
        })
    }
}

// -----------------------------------------------------------------------------
// Fake research collaborator
// -----------------------------------------------------------------------------

pub struct FakeResearch {
    outcome: ResearchOutcome,
    delay_ms: u64,
}

impl FakeResearch {
    pub fn success_bullish() -> Self {
        Self {
            outcome: ResearchOutcome {
                success: true,
                answer: Some(
                    "Analysts are bullish: strong growth and more upside expected.".to_string(),
                ),
                confidence: 75.0,
                sources: vec!["test://source".to_string()],
                error: None,
            },
            delay_ms: 0,
        }
    }

    pub fn failing() -> Self {
        Self {
            outcome: ResearchOutcome::failed("research backend down"),
            delay_ms: 0,
        }
    }

    pub fn with_delay(mut self, millis: u64) -> Self {
        self.delay_ms = millis;
        self
    }
}

#[async_trait]
impl ResearchCollaborator for FakeResearch {
    async fn research(&self, _query: &str, _depth: ResearchDepth) -> Result<ResearchOutcome> {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        Ok(self.outcome.clone())
    }
}
