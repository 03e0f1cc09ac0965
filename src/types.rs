// =============================================================================
// Shared types used across the Helios trading engine
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Round a price to 2 decimal places for record surfaces.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Round a share quantity to the broker's 4-decimal precision.
pub fn round_qty(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

// =============================================================================
// Market data
// =============================================================================

/// One daily OHLCV bar from the price provider. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// =============================================================================
// Signals
// =============================================================================

/// Trading signal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// Signal strength tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Strong,
    Moderate,
    Weak,
}

impl std::fmt::Display for Strength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strong => write!(f, "strong"),
            Self::Moderate => write!(f, "moderate"),
            Self::Weak => write!(f, "weak"),
        }
    }
}

/// A trading signal produced by one strategy over one ticker.
///
/// Strategies are pure: a signal is a value derived from a window of price
/// bars and never references shared mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSignal {
    pub ticker: String,
    pub strategy: String,
    pub direction: Direction,
    pub strength: Strength,
    /// Confidence in [0, 100].
    pub confidence: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Suggested fraction of portfolio, e.g. 0.05 for 5 %.
    pub position_size_pct: f64,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
    /// Whether the asset supports fractional trading.
    pub fractionable: bool,
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
            Self::Stop => "stop",
            Self::StopLimit => "stop_limit",
            Self::TrailingStop => "trailing_stop",
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc,
    Ioc,
    Fok,
    Opg,
    Cls,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Gtc => "gtc",
            Self::Ioc => "ioc",
            Self::Fok => "fok",
            Self::Opg => "opg",
            Self::Cls => "cls",
        }
    }
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order lifecycle status as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    DoneForDay,
    Canceled,
    Expired,
    Replaced,
    PendingCancel,
    PendingReplace,
    PendingNew,
    Accepted,
    Stopped,
    Rejected,
    Suspended,
    Unknown,
}

impl OrderStatus {
    /// Parse the broker's status string, mapping anything unrecognised to
    /// `Unknown` rather than failing the whole order decode.
    pub fn parse(s: &str) -> Self {
        match s {
            "new" => Self::New,
            "partially_filled" => Self::PartiallyFilled,
            "filled" => Self::Filled,
            "done_for_day" => Self::DoneForDay,
            "canceled" => Self::Canceled,
            "expired" => Self::Expired,
            "replaced" => Self::Replaced,
            "pending_cancel" => Self::PendingCancel,
            "pending_replace" => Self::PendingReplace,
            "pending_new" => Self::PendingNew,
            "accepted" => Self::Accepted,
            "stopped" => Self::Stopped,
            "rejected" => Self::Rejected,
            "suspended" => Self::Suspended,
            _ => Self::Unknown,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Self::New | Self::PartiallyFilled | Self::PendingNew | Self::Accepted
        )
    }
}

// =============================================================================
// Portfolio-manager actions
// =============================================================================

/// Action decided by the portfolio manager for a single ticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
    Short,
    Cover,
    Hold,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Short => "short",
            Self::Cover => "cover",
            Self::Hold => "hold",
        }
    }

    /// Parse a lowercase action string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            "short" => Some(Self::Short),
            "cover" => Some(Self::Cover),
            "hold" => Some(Self::Hold),
            _ => None,
        }
    }

    /// The broker order side this action maps to.
    pub fn order_side(&self) -> Option<OrderSide> {
        match self {
            Self::Buy | Self::Cover => Some(OrderSide::Buy),
            Self::Sell | Self::Short => Some(OrderSide::Sell),
            Self::Hold => None,
        }
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_helpers() {
        assert_eq!(round2(10.006), 10.01);
        assert_eq!(round2(99.994), 99.99);
        assert_eq!(round_qty(1.23456), 1.2346);
        assert_eq!(round_qty(2.0), 2.0);
    }

    #[test]
    fn order_status_parse_and_open() {
        assert_eq!(OrderStatus::parse("filled"), OrderStatus::Filled);
        assert_eq!(OrderStatus::parse("weird_state"), OrderStatus::Unknown);
        assert!(OrderStatus::New.is_open());
        assert!(OrderStatus::PartiallyFilled.is_open());
        assert!(!OrderStatus::Filled.is_open());
        assert!(!OrderStatus::Canceled.is_open());
    }

    #[test]
    fn trade_action_order_side() {
        assert_eq!(TradeAction::Buy.order_side(), Some(OrderSide::Buy));
        assert_eq!(TradeAction::Cover.order_side(), Some(OrderSide::Buy));
        assert_eq!(TradeAction::Sell.order_side(), Some(OrderSide::Sell));
        assert_eq!(TradeAction::Short.order_side(), Some(OrderSide::Sell));
        assert_eq!(TradeAction::Hold.order_side(), None);
    }

    #[test]
    fn action_roundtrip() {
        for action in ["buy", "sell", "short", "cover", "hold"] {
            assert_eq!(TradeAction::parse(action).unwrap().as_str(), action);
        }
        assert!(TradeAction::parse("liquidate").is_none());
    }

    #[test]
    fn enums_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Direction::Long).unwrap(), "\"long\"");
        assert_eq!(serde_json::to_string(&OrderType::StopLimit).unwrap(), "\"stop_limit\"");
        assert_eq!(serde_json::to_string(&TimeInForce::Gtc).unwrap(), "\"gtc\"");
    }
}
