// =============================================================================
// Broker data models — parsed from the trading API's JSON
// =============================================================================
//
// The broker serialises every numeric field as a string ("qty": "1.5"), so
// all parsing goes through the tolerant helpers below, which accept either
// a string or a number. Pure policy functions (PDT evaluation, fractional
// quantity normalization) live here so they are testable without HTTP.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{round_qty, OrderStatus, OrderType, TimeInForce};

/// Equity threshold above which PDT restrictions do not apply.
pub const PDT_THRESHOLD: f64 = 25_000.0;

// -----------------------------------------------------------------------------
// JSON helpers
// -----------------------------------------------------------------------------

/// Parse a JSON value that may be either a string or a number into `f64`.
pub(crate) fn num(v: &Value, key: &str) -> f64 {
    match v.get(key) {
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

pub(crate) fn opt_num(v: &Value, key: &str) -> Option<f64> {
    match v.get(key) {
        Some(Value::String(s)) => s.parse().ok(),
        Some(Value::Number(n)) => n.as_f64(),
        _ => None,
    }
}

pub(crate) fn text(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn opt_text(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub(crate) fn boolean(v: &Value, key: &str, default: bool) -> bool {
    v.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn opt_time(v: &Value, key: &str) -> Option<DateTime<Utc>> {
    v.get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

// -----------------------------------------------------------------------------
// Account
// -----------------------------------------------------------------------------

/// Broker account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub account_number: String,
    pub status: String,
    pub cash: f64,
    pub buying_power: f64,
    pub equity: f64,
    pub portfolio_value: f64,
    pub pattern_day_trader: bool,
    pub daytrade_count: u32,
    pub shorting_enabled: bool,
    pub trading_blocked: bool,
    pub multiplier: String,
    pub initial_margin: f64,
    pub maintenance_margin: f64,
}

impl Account {
    pub fn from_json(v: &Value) -> Self {
        Self {
            id: text(v, "id"),
            account_number: text(v, "account_number"),
            status: text(v, "status"),
            cash: num(v, "cash"),
            buying_power: num(v, "buying_power"),
            equity: num(v, "equity"),
            portfolio_value: num(v, "portfolio_value"),
            pattern_day_trader: boolean(v, "pattern_day_trader", false),
            daytrade_count: num(v, "daytrade_count") as u32,
            shorting_enabled: boolean(v, "shorting_enabled", true),
            trading_blocked: boolean(v, "trading_blocked", false),
            multiplier: text(v, "multiplier"),
            initial_margin: num(v, "initial_margin"),
            maintenance_margin: num(v, "maintenance_margin"),
        }
    }
}

// -----------------------------------------------------------------------------
// Positions
// -----------------------------------------------------------------------------

/// A broker-held position. Read-only snapshot; the authoritative copy lives
/// at the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: f64,
    pub qty_available: f64,
    /// "long" or "short".
    pub side: String,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub market_value: f64,
    pub cost_basis: f64,
    pub unrealized_pl: f64,
    pub unrealized_pl_pct: f64,
    pub change_today: f64,
}

impl Position {
    pub fn from_json(v: &Value) -> Self {
        Self {
            symbol: text(v, "symbol"),
            qty: num(v, "qty"),
            qty_available: num(v, "qty_available"),
            side: {
                let side = text(v, "side");
                if side.is_empty() {
                    "long".to_string()
                } else {
                    side
                }
            },
            avg_entry_price: num(v, "avg_entry_price"),
            current_price: num(v, "current_price"),
            market_value: num(v, "market_value"),
            cost_basis: num(v, "cost_basis"),
            unrealized_pl: num(v, "unrealized_pl"),
            unrealized_pl_pct: num(v, "unrealized_plpc") * 100.0,
            change_today: num(v, "change_today"),
        }
    }

    pub fn is_short(&self) -> bool {
        self.side == "short"
    }
}

// -----------------------------------------------------------------------------
// Orders
// -----------------------------------------------------------------------------

/// A broker order. Created by submission; updated only by refresh from the
/// broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub qty: f64,
    pub filled_qty: f64,
    pub filled_avg_price: Option<f64>,
    pub status: OrderStatus,
    pub time_in_force: String,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn from_json(v: &Value) -> Self {
        Self {
            id: text(v, "id"),
            client_order_id: text(v, "client_order_id"),
            symbol: text(v, "symbol"),
            side: text(v, "side"),
            order_type: text(v, "type"),
            qty: num(v, "qty"),
            filled_qty: num(v, "filled_qty"),
            filled_avg_price: opt_num(v, "filled_avg_price"),
            status: OrderStatus::parse(&text(v, "status")),
            time_in_force: text(v, "time_in_force"),
            limit_price: opt_num(v, "limit_price"),
            stop_price: opt_num(v, "stop_price"),
            submitted_at: opt_time(v, "submitted_at"),
            filled_at: opt_time(v, "filled_at"),
        }
    }
}

/// Outcome of an order submission or position close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order: Option<Order>,
    pub error: Option<String>,
    pub message: String,
}

impl OrderResult {
    pub fn ok(order: Option<Order>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            order,
            error: None,
            message: message.into(),
        }
    }

    pub fn failed(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            order: None,
            error: Some(error.into()),
            message: message.into(),
        }
    }
}

// -----------------------------------------------------------------------------
// Assets
// -----------------------------------------------------------------------------

/// Asset metadata, cached in-process keyed by symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetInfo {
    pub symbol: String,
    pub name: String,
    pub exchange: String,
    pub asset_class: String,
    pub tradable: bool,
    pub fractionable: bool,
    pub shortable: bool,
    pub marginable: bool,
    pub min_order_size: f64,
    pub min_trade_increment: f64,
    pub price_increment: f64,
}

impl AssetInfo {
    pub fn from_json(v: &Value) -> Self {
        Self {
            symbol: text(v, "symbol"),
            name: text(v, "name"),
            exchange: text(v, "exchange"),
            asset_class: {
                let class = text(v, "class");
                if class.is_empty() {
                    "us_equity".to_string()
                } else {
                    class
                }
            },
            tradable: boolean(v, "tradable", false),
            fractionable: boolean(v, "fractionable", false),
            shortable: boolean(v, "shortable", false),
            marginable: boolean(v, "marginable", false),
            min_order_size: opt_num(v, "min_order_size").unwrap_or(1.0),
            min_trade_increment: opt_num(v, "min_trade_increment").unwrap_or(1.0),
            price_increment: opt_num(v, "price_increment").unwrap_or(0.01),
        }
    }
}

// -----------------------------------------------------------------------------
// Market data
// -----------------------------------------------------------------------------

/// Latest NBBO quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: u64,
    pub ask_size: u64,
    pub timestamp: Option<String>,
}

impl Quote {
    /// Midpoint of bid/ask, when both sides exist.
    pub fn midpoint(&self) -> Option<f64> {
        (self.bid > 0.0 && self.ask > 0.0).then(|| (self.bid + self.ask) / 2.0)
    }
}

/// Latest trade print.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastTrade {
    pub symbol: String,
    pub price: f64,
    pub size: u64,
    pub timestamp: Option<String>,
}

/// Market clock from the broker calendar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketClock {
    pub is_open: bool,
    pub next_open: Option<String>,
    pub next_close: Option<String>,
}

impl MarketClock {
    pub fn from_json(v: &Value) -> Self {
        Self {
            is_open: boolean(v, "is_open", false),
            next_open: opt_text(v, "next_open"),
            next_close: opt_text(v, "next_close"),
        }
    }
}

// -----------------------------------------------------------------------------
// Portfolio snapshot for downstream consumers
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub long_qty: f64,
    pub short_qty: f64,
    pub cost_basis: f64,
    pub current_price: f64,
    pub market_value: f64,
    pub unrealized_pl: f64,
    pub unrealized_pl_pct: f64,
}

/// Full portfolio view handed to the decision collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub cash: f64,
    pub buying_power: f64,
    pub equity: f64,
    pub portfolio_value: f64,
    pub positions: std::collections::HashMap<String, PositionSnapshot>,
}

impl PortfolioSnapshot {
    pub fn build(account: &Account, positions: &[Position]) -> Self {
        let mut map = std::collections::HashMap::new();
        for pos in positions {
            map.insert(
                pos.symbol.clone(),
                PositionSnapshot {
                    long_qty: if pos.is_short() { 0.0 } else { pos.qty },
                    short_qty: if pos.is_short() { pos.qty.abs() } else { 0.0 },
                    cost_basis: pos.cost_basis,
                    current_price: pos.current_price,
                    market_value: pos.market_value,
                    unrealized_pl: pos.unrealized_pl,
                    unrealized_pl_pct: pos.unrealized_pl_pct,
                },
            );
        }
        Self {
            cash: account.cash,
            buying_power: account.buying_power,
            equity: account.equity,
            portfolio_value: account.portfolio_value,
            positions: map,
        }
    }
}

// -----------------------------------------------------------------------------
// PDT evaluation (pure)
// -----------------------------------------------------------------------------

/// Pattern-day-trader status derived from the account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdtStatus {
    pub is_pdt: bool,
    pub daytrade_count: u32,
    pub equity: f64,
    pub can_day_trade: bool,
    pub warning: Option<String>,
    pub pdt_threshold: f64,
}

/// Evaluate the PDT gate:
/// - equity >= $25k: unrestricted.
/// - PDT-flagged under the threshold: restricted.
/// - 3+ day trades under the threshold: restricted (one more would flag).
/// - exactly 2 day trades: allowed with a warning.
pub fn evaluate_pdt(account: &Account) -> PdtStatus {
    let equity = account.equity;
    let is_pdt = account.pattern_day_trader;
    let daytrade_count = account.daytrade_count;

    let mut can_day_trade = true;
    let mut warning = None;

    if equity >= PDT_THRESHOLD {
        // No restrictions with $25k+ equity.
    } else if is_pdt {
        can_day_trade = false;
        warning = Some(format!(
            "PDT flagged with ${equity:.2} equity (< $25k). Day trading restricted."
        ));
    } else if daytrade_count >= 3 {
        can_day_trade = false;
        warning = Some(format!(
            "At {daytrade_count}/3 day trades in 5 days. One more would trigger the PDT flag."
        ));
    } else if daytrade_count >= 2 {
        warning = Some(format!(
            "At {daytrade_count}/3 day trades. Approaching the PDT limit."
        ));
    }

    PdtStatus {
        is_pdt,
        daytrade_count,
        equity,
        can_day_trade,
        warning,
        pdt_threshold: PDT_THRESHOLD,
    }
}

// -----------------------------------------------------------------------------
// Fractional order policy (pure)
// -----------------------------------------------------------------------------

/// Result of normalizing an order quantity against the fractional policy.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedQty {
    pub qty: f64,
    pub is_fractional: bool,
    /// Set when the quantity or order shape was adjusted.
    pub adjustment: Option<String>,
}

/// Apply the fractional-share policy to a requested quantity:
/// 1. Round to 4 decimals.
/// 2. If fractional but fractional trading is globally off, round up to
///    whole shares (minimum 1).
/// 3. If fractional but the asset is not fractionable, round to whole
///    shares (minimum 1).
pub fn normalize_qty(qty: f64, allow_fractional: bool, fractionable: bool) -> NormalizedQty {
    let rounded = round_qty(qty);
    let is_fractional = rounded.fract() != 0.0;

    if !is_fractional {
        return NormalizedQty {
            qty: rounded,
            is_fractional: false,
            adjustment: None,
        };
    }

    if !allow_fractional {
        let whole = rounded.floor().max(1.0);
        return NormalizedQty {
            qty: whole,
            is_fractional: false,
            adjustment: Some(format!(
                "fractional trading disabled; rounded {rounded:.4} to {whole:.0} shares"
            )),
        };
    }

    if !fractionable {
        let whole = rounded.floor().max(1.0);
        return NormalizedQty {
            qty: whole,
            is_fractional: false,
            adjustment: Some(format!(
                "asset not fractionable; rounded {rounded:.4} to {whole:.0} shares"
            )),
        };
    }

    NormalizedQty {
        qty: rounded,
        is_fractional: true,
        adjustment: None,
    }
}

/// Fractional orders must be MARKET + DAY. Returns the (possibly coerced)
/// order type / time-in-force pair and a note when a conversion happened.
pub fn coerce_fractional_shape(
    is_fractional: bool,
    order_type: OrderType,
    tif: TimeInForce,
) -> (OrderType, TimeInForce, Option<String>) {
    if !is_fractional {
        return (order_type, tif, None);
    }

    let mut notes = Vec::new();
    let coerced_type = if order_type != OrderType::Market {
        notes.push(format!("converted {order_type} to market"));
        OrderType::Market
    } else {
        order_type
    };
    let coerced_tif = if tif != TimeInForce::Day {
        notes.push(format!("converted {tif} to day"));
        TimeInForce::Day
    } else {
        tif
    };

    let note = (!notes.is_empty()).then(|| format!("fractional order: {}", notes.join(", ")));
    (coerced_type, coerced_tif, note)
}
