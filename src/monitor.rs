// =============================================================================
// Position Monitor — periodic stop-loss / take-profit enforcement
// =============================================================================
//
// Scans open positions on the scheduler's cadence (default every 5 minutes
// during market hours), evaluates each against its exit rule (custom
// per-position rules override the default percent rules), and submits a
// closing order on breach. Idempotent: an already-open closing order for the
// symbol suppresses a second submission.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Position};
use crate::error::Result;
use crate::history::{NewTrade, TradeHistoryService};
use crate::telemetry::alerts::{AlertCategory, AlertManager, AlertPriority};
use crate::telemetry::events::EventLogger;
use crate::types::{OrderSide, TradeAction};

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
        }
    }
}

/// Absolute exit prices registered for a specific position. Overrides the
/// default percent rules.
#[derive(Debug, Clone, Copy)]
pub struct ExitRule {
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
}

/// One auto-exit performed by a scan.
#[derive(Debug, Clone, Serialize)]
pub struct ExitAction {
    pub symbol: String,
    pub reason: ExitReason,
    pub qty: f64,
    pub price: f64,
    pub success: bool,
}

/// Evaluate a position's price against its stop/target levels.
pub fn evaluate_exit(
    is_long: bool,
    price: f64,
    stop: Option<f64>,
    target: Option<f64>,
) -> Option<ExitReason> {
    if is_long {
        if let Some(stop) = stop {
            if price <= stop {
                return Some(ExitReason::StopLoss);
            }
        }
        if let Some(target) = target {
            if price >= target {
                return Some(ExitReason::TakeProfit);
            }
        }
    } else {
        if let Some(stop) = stop {
            if price >= stop {
                return Some(ExitReason::StopLoss);
            }
        }
        if let Some(target) = target {
            if price <= target {
                return Some(ExitReason::TakeProfit);
            }
        }
    }
    None
}

pub struct PositionMonitor {
    broker: Arc<dyn Broker>,
    history: Arc<TradeHistoryService>,
    events: Arc<EventLogger>,
    alerts: Arc<AlertManager>,
    default_stop_loss_pct: f64,
    default_take_profit_pct: f64,
    custom_rules: RwLock<HashMap<String, ExitRule>>,
}

impl PositionMonitor {
    pub fn new(
        broker: Arc<dyn Broker>,
        history: Arc<TradeHistoryService>,
        events: Arc<EventLogger>,
        alerts: Arc<AlertManager>,
        default_stop_loss_pct: f64,
        default_take_profit_pct: f64,
    ) -> Self {
        Self {
            broker,
            history,
            events,
            alerts,
            default_stop_loss_pct,
            default_take_profit_pct,
            custom_rules: RwLock::new(HashMap::new()),
        }
    }

    /// Register absolute exit prices for a symbol (set by the execution
    /// stage when the portfolio manager supplied SL/TP levels).
    pub fn register_exit_rule(&self, symbol: &str, rule: ExitRule) {
        self.custom_rules
            .write()
            .insert(symbol.to_uppercase(), rule);
    }

    pub fn clear_exit_rule(&self, symbol: &str) {
        self.custom_rules.write().remove(&symbol.to_uppercase());
    }

    /// One scan over every open position. Returns the exits performed.
    pub async fn check_positions(&self) -> Result<Vec<ExitAction>> {
        let positions = self.broker.get_positions().await?;
        if positions.is_empty() {
            debug!("position monitor: no open positions");
            return Ok(Vec::new());
        }

        let mut exits = Vec::new();
        for position in &positions {
            let price = match self.broker.get_current_price(&position.symbol).await {
                Some(p) if p > 0.0 => p,
                _ if position.current_price > 0.0 => position.current_price,
                _ => {
                    warn!(symbol = %position.symbol, "no usable price — skipping exit check");
                    continue;
                }
            };

            let (stop, target) = self.exit_levels(position);
            let Some(reason) = evaluate_exit(!position.is_short(), price, stop, target) else {
                continue;
            };

            if self.closing_order_open(position).await {
                debug!(
                    symbol = %position.symbol,
                    "closing order already open — skipping duplicate exit"
                );
                continue;
            }

            exits.push(self.close_position(position, price, reason).await);
        }

        Ok(exits)
    }

    /// Stop/target for a position: the registered rule wins, otherwise the
    /// default percent bands around the average entry.
    fn exit_levels(&self, position: &Position) -> (Option<f64>, Option<f64>) {
        if let Some(rule) = self.custom_rules.read().get(&position.symbol) {
            return (rule.stop_price, rule.target_price);
        }

        let entry = position.avg_entry_price;
        if entry <= 0.0 {
            return (None, None);
        }
        if position.is_short() {
            (
                Some(entry * (1.0 + self.default_stop_loss_pct)),
                Some(entry * (1.0 - self.default_take_profit_pct)),
            )
        } else {
            (
                Some(entry * (1.0 - self.default_stop_loss_pct)),
                Some(entry * (1.0 + self.default_take_profit_pct)),
            )
        }
    }

    /// True when an open order on the closing side already exists for the
    /// position's symbol.
    async fn closing_order_open(&self, position: &Position) -> bool {
        let closing_side = if position.is_short() {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };
        let symbols = [position.symbol.clone()];
        match self.broker.get_orders("open", 50, Some(&symbols[..])).await {
            Ok(orders) => orders
                .iter()
                .any(|o| o.status.is_open() && o.side == closing_side.as_str()),
            Err(e) => {
                // On lookup failure err toward not duplicating exits.
                warn!(symbol = %position.symbol, error = %e, "open-order lookup failed");
                true
            }
        }
    }

    async fn close_position(
        &self,
        position: &Position,
        price: f64,
        reason: ExitReason,
    ) -> ExitAction {
        let qty = if position.qty_available > 0.0 {
            position.qty_available
        } else {
            position.qty.abs()
        };

        info!(
            symbol = %position.symbol,
            side = %position.side,
            price,
            reason = reason.as_str(),
            "exit rule breached — closing position"
        );

        let result = self.broker.close_position(&position.symbol, Some(qty)).await;

        if result.success {
            let action = if position.is_short() {
                TradeAction::Cover
            } else {
                TradeAction::Sell
            };
            let record = NewTrade {
                ticker: position.symbol.clone(),
                action: Some(action),
                quantity: qty,
                entry_price: Some(price),
                order_id: result.order.as_ref().map(|o| o.id.clone()),
                notes: Some(format!("auto_exit: {}", reason.as_str())),
                fractionable: true,
                ..Default::default()
            };
            if let Err(e) = self.history.record_trade(&record, None) {
                warn!(symbol = %position.symbol, error = %e, "failed to record auto exit");
            }

            self.events.log_trade_execution(
                None,
                result
                    .order
                    .as_ref()
                    .map(|o| o.id.as_str())
                    .unwrap_or_default(),
                &position.symbol,
                action.as_str(),
                qty,
                "market",
                "submitted",
                None,
            );
            self.clear_exit_rule(&position.symbol);
        }

        let priority = match reason {
            ExitReason::StopLoss => AlertPriority::P1,
            ExitReason::TakeProfit => AlertPriority::P2,
        };
        self.alerts.raise(
            priority,
            AlertCategory::Execution,
            &format!("auto exit {} on {}", reason.as_str(), position.symbol),
            json!({
                "symbol": position.symbol,
                "qty": qty,
                "price": price,
                "success": result.success,
            }),
        );

        ExitAction {
            symbol: position.symbol.clone(),
            reason,
            qty,
            price,
            success: result.success,
        }
    }
}

impl std::fmt::Debug for PositionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionMonitor")
            .field("default_stop_loss_pct", &self.default_stop_loss_pct)
            .field("default_take_profit_pct", &self.default_take_profit_pct)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::testutil::{make_position, FakeBroker};

    // ---- pure breach evaluation ------------------------------------------

    #[test]
    fn long_breaches() {
        assert_eq!(
            evaluate_exit(true, 94.0, Some(95.0), Some(110.0)),
            Some(ExitReason::StopLoss)
        );
        assert_eq!(
            evaluate_exit(true, 111.0, Some(95.0), Some(110.0)),
            Some(ExitReason::TakeProfit)
        );
        assert_eq!(evaluate_exit(true, 100.0, Some(95.0), Some(110.0)), None);
    }

    #[test]
    fn short_breaches() {
        assert_eq!(
            evaluate_exit(false, 106.0, Some(105.0), Some(90.0)),
            Some(ExitReason::StopLoss)
        );
        assert_eq!(
            evaluate_exit(false, 89.0, Some(105.0), Some(90.0)),
            Some(ExitReason::TakeProfit)
        );
        assert_eq!(evaluate_exit(false, 100.0, Some(105.0), Some(90.0)), None);
    }

    #[test]
    fn missing_levels_never_breach() {
        assert_eq!(evaluate_exit(true, 1.0, None, None), None);
    }

    // ---- scan behaviour ---------------------------------------------------

    fn monitor_with(broker: Arc<FakeBroker>) -> PositionMonitor {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let history = Arc::new(TradeHistoryService::new(store));
        let events = Arc::new(EventLogger::new(None));
        let alerts = Arc::new(AlertManager::new(Arc::clone(&events)));
        PositionMonitor::new(broker, history, events, alerts, 0.05, 0.10)
    }

    #[tokio::test]
    async fn stop_loss_breach_closes_position() {
        let broker = Arc::new(FakeBroker::with_equity(10_000.0));
        broker.add_position(make_position("AAPL", 10.0, "long", 100.0, 94.0));
        broker.set_trade_price("AAPL", 94.0);

        let monitor = monitor_with(Arc::clone(&broker));
        let exits = monitor.check_positions().await.unwrap();

        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].reason, ExitReason::StopLoss);
        assert!(exits[0].success);
        assert_eq!(broker.closed_positions().len(), 1);

        // The trade record is tagged as an auto exit.
        let trades = monitor
            .history
            .get_trade_history(Some("AAPL"), None, 10)
            .unwrap();
        assert_eq!(trades[0].notes.as_deref(), Some("auto_exit: stop_loss"));
        assert_eq!(trades[0].action, TradeAction::Sell);
    }

    #[tokio::test]
    async fn scan_is_idempotent_without_price_change() {
        let broker = Arc::new(FakeBroker::with_equity(10_000.0));
        broker.add_position(make_position("AAPL", 10.0, "long", 100.0, 94.0));
        broker.set_trade_price("AAPL", 94.0);

        let monitor = monitor_with(Arc::clone(&broker));
        let first = monitor.check_positions().await.unwrap();
        assert_eq!(first.len(), 1);

        // The fake broker leaves the position open but registers an open
        // closing order; a second scan must not exit again.
        let second = monitor.check_positions().await.unwrap();
        assert!(second.is_empty());
        assert_eq!(broker.closed_positions().len(), 1);
    }

    #[tokio::test]
    async fn take_profit_breach_on_short() {
        let broker = Arc::new(FakeBroker::with_equity(10_000.0));
        broker.add_position(make_position("NIO", 10.0, "short", 100.0, 89.0));
        broker.set_trade_price("NIO", 89.0);

        let monitor = monitor_with(Arc::clone(&broker));
        let exits = monitor.check_positions().await.unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].reason, ExitReason::TakeProfit);

        let trades = monitor
            .history
            .get_trade_history(Some("NIO"), None, 10)
            .unwrap();
        assert_eq!(trades[0].action, TradeAction::Cover);
    }

    #[tokio::test]
    async fn custom_rule_overrides_defaults() {
        let broker = Arc::new(FakeBroker::with_equity(10_000.0));
        // Price 97 is inside the default 5% band but breaches the tighter
        // custom stop at 98.
        broker.add_position(make_position("AMD", 5.0, "long", 100.0, 97.0));
        broker.set_trade_price("AMD", 97.0);

        let monitor = monitor_with(Arc::clone(&broker));
        assert!(monitor.check_positions().await.unwrap().is_empty());

        monitor.register_exit_rule(
            "AMD",
            ExitRule {
                stop_price: Some(98.0),
                target_price: Some(120.0),
            },
        );
        let exits = monitor.check_positions().await.unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].reason, ExitReason::StopLoss);
    }

    #[tokio::test]
    async fn healthy_position_left_alone() {
        let broker = Arc::new(FakeBroker::with_equity(10_000.0));
        broker.add_position(make_position("MSFT", 2.0, "long", 100.0, 102.0));
        broker.set_trade_price("MSFT", 102.0);

        let monitor = monitor_with(Arc::clone(&broker));
        assert!(monitor.check_positions().await.unwrap().is_empty());
        assert!(broker.closed_positions().is_empty());
    }
}
