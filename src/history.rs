// =============================================================================
// Trade History — lifecycle records, decision context, FIFO reconciliation
// =============================================================================
//
// Every broker submission appends a trade row with status `pending`; broker
// confirmation moves it to `filled`; FIFO reconciliation marks closing legs
// `closed` with realized P&L. The decision context captured at submit time
// is immutable except for the outcome fields written when the trade closes.
//
// FIFO matching: per ticker, sells consume the oldest open buy lots and
// covers consume the oldest open short lots. The closing leg aggregates the
// matched cost basis into one realized P&L figure.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::Order;
use crate::error::{Result, TradingError};
use crate::store::Store;
use crate::types::{round2, OrderStatus, TradeAction};

/// Local trade lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Filled,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Filled => "filled",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "filled" => Self::Filled,
            "closed" => Self::Closed,
            _ => Self::Pending,
        }
    }
}

/// A persisted trade row.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub id: i64,
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub ticker: String,
    pub action: TradeAction,
    pub quantity: f64,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub entry_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub strategy: Option<String>,
    pub status: TradeStatus,
    pub realized_pnl: Option<f64>,
    pub return_pct: Option<f64>,
    pub holding_period_hours: Option<f64>,
    pub fractionable: bool,
    pub notes: Option<String>,
}

/// Input for a new trade row.
#[derive(Debug, Clone, Default)]
pub struct NewTrade {
    pub ticker: String,
    pub action: Option<TradeAction>,
    pub quantity: f64,
    pub entry_price: Option<f64>,
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub strategy: Option<String>,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub fractionable: bool,
    pub notes: Option<String>,
}

/// Everything known at decision time, persisted next to the trade.
#[derive(Debug, Clone, Default)]
pub struct DecisionContextRecord {
    pub trigger_source: String,
    pub strategy_name: Option<String>,
    pub strategy_signal: Option<String>,
    pub strategy_confidence: Option<f64>,
    pub strategy_reasoning: Option<String>,
    pub research_sentiment: Option<String>,
    pub research_confidence: Option<f64>,
    pub research_summary: Option<String>,
    pub agent_signals: Option<Value>,
    pub bullish_count: i64,
    pub bearish_count: i64,
    pub neutral_count: i64,
    pub consensus_direction: Option<String>,
    pub consensus_confidence: Option<f64>,
    pub portfolio_equity: Option<f64>,
    pub portfolio_cash: Option<f64>,
    pub pm_action: Option<String>,
    pub pm_quantity: Option<f64>,
    pub pm_confidence: Option<f64>,
    pub pm_reasoning: Option<String>,
    pub pm_stop_loss_pct: Option<f64>,
    pub pm_take_profit_pct: Option<f64>,
}

/// Aggregate trading metrics over closed trades.
#[derive(Debug, Clone, Serialize)]
pub struct TradeMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: Option<f64>,
    pub total_pnl: f64,
    pub average_pnl: Option<f64>,
    pub average_return_pct: Option<f64>,
    pub average_holding_hours: Option<f64>,
    pub best_trade: Option<(String, f64)>,
    pub worst_trade: Option<(String, f64)>,
    pub profit_factor: Option<f64>,
}

/// An open FIFO lot (trade id, remaining qty, price).
#[derive(Debug, Clone, PartialEq)]
pub struct OpenLot {
    pub trade_id: i64,
    pub remaining_qty: f64,
    pub price: f64,
}

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Records and reconciles every trade the engine submits.
pub struct TradeHistoryService {
    store: Arc<Store>,
}

impl TradeHistoryService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Record a new trade (status `pending`) with its decision context.
    /// Returns the trade id.
    pub fn record_trade(
        &self,
        trade: &NewTrade,
        context: Option<&DecisionContextRecord>,
    ) -> Result<i64> {
        let action = trade
            .action
            .ok_or_else(|| TradingError::InvariantViolation("trade without action".into()))?;
        let now = Utc::now().to_rfc3339();

        let trade_id = self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO trade_history \
                 (order_id, client_order_id, ticker, action, quantity, entry_price, entry_time, \
                  stop_loss_price, take_profit_price, strategy, status, fractionable, notes, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'pending', ?11, ?12, ?13)",
                params![
                    trade.order_id,
                    trade.client_order_id,
                    trade.ticker.to_uppercase(),
                    action.as_str(),
                    trade.quantity,
                    trade.entry_price,
                    now,
                    trade.stop_loss_price,
                    trade.take_profit_price,
                    trade.strategy,
                    trade.fractionable as i64,
                    trade.notes,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        if let Some(ctx) = context {
            self.store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO decision_context \
                     (trade_id, ticker, trigger_source, strategy_name, strategy_signal, \
                      strategy_confidence, strategy_reasoning, research_sentiment, \
                      research_confidence, research_summary, agent_signals, bullish_count, \
                      bearish_count, neutral_count, consensus_direction, consensus_confidence, \
                      portfolio_equity, portfolio_cash, pm_action, pm_quantity, pm_confidence, \
                      pm_reasoning, pm_stop_loss_pct, pm_take_profit_pct, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                             ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
                    params![
                        trade_id,
                        trade.ticker.to_uppercase(),
                        ctx.trigger_source,
                        ctx.strategy_name,
                        ctx.strategy_signal,
                        ctx.strategy_confidence,
                        ctx.strategy_reasoning,
                        ctx.research_sentiment,
                        ctx.research_confidence,
                        ctx.research_summary,
                        ctx.agent_signals.as_ref().map(|v| v.to_string()),
                        ctx.bullish_count,
                        ctx.bearish_count,
                        ctx.neutral_count,
                        ctx.consensus_direction,
                        ctx.consensus_confidence,
                        ctx.portfolio_equity,
                        ctx.portfolio_cash,
                        ctx.pm_action,
                        ctx.pm_quantity,
                        ctx.pm_confidence,
                        ctx.pm_reasoning,
                        ctx.pm_stop_loss_pct,
                        ctx.pm_take_profit_pct,
                        now,
                    ],
                )?;
                Ok(())
            })?;

            if let Some(signals) = &ctx.agent_signals {
                self.update_agent_signal_counts(signals)?;
            }
        }

        info!(
            trade_id,
            ticker = %trade.ticker,
            action = %action,
            quantity = trade.quantity,
            "trade recorded"
        );
        Ok(trade_id)
    }

    /// Mark a pending trade as filled by broker order id.
    pub fn mark_filled(
        &self,
        order_id: &str,
        filled_price: Option<f64>,
        filled_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let updated = self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE trade_history SET status = 'filled', \
                 entry_price = COALESCE(?2, entry_price), \
                 entry_time = COALESCE(?3, entry_time) \
                 WHERE order_id = ?1 AND status = 'pending'",
                params![
                    order_id,
                    filled_price,
                    filled_at.map(|t| t.to_rfc3339())
                ],
            )
        })?;
        Ok(updated > 0)
    }

    /// Close a trade at `exit_price`, deriving realized P&L, return %, and
    /// holding period; also stamps the decision context outcome.
    pub fn close_trade(
        &self,
        trade_id: i64,
        exit_price: f64,
        realized_pnl: Option<f64>,
        notes: Option<&str>,
    ) -> Result<bool> {
        let row = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT action, quantity, entry_price, entry_time FROM trade_history WHERE id = ?1",
            )?;
            let mut rows = stmt.query(params![trade_id])?;
            match rows.next()? {
                Some(row) => Ok(Some((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))),
                None => Ok(None),
            }
        })?;

        let Some((action_str, quantity, entry_price, entry_time)) = row else {
            warn!(trade_id, "close requested for unknown trade");
            return Ok(false);
        };
        let action = TradeAction::parse(&action_str).unwrap_or(TradeAction::Buy);

        let pnl = realized_pnl.or_else(|| {
            entry_price.map(|entry| match action {
                TradeAction::Buy | TradeAction::Cover => (exit_price - entry) * quantity,
                _ => (entry - exit_price) * quantity,
            })
        });

        let return_pct = entry_price.and_then(|entry| {
            if entry <= 0.0 {
                return None;
            }
            let mut pct = (exit_price - entry) / entry * 100.0;
            if matches!(action, TradeAction::Sell | TradeAction::Short) {
                pct = -pct;
            }
            Some(pct)
        });

        let now = Utc::now();
        let holding_hours = parse_time(entry_time)
            .map(|start| (now - start).num_seconds() as f64 / 3600.0);

        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE trade_history SET status = 'closed', exit_price = ?2, exit_time = ?3, \
                 realized_pnl = ?4, return_pct = ?5, holding_period_hours = ?6, \
                 notes = COALESCE(?7, notes) WHERE id = ?1",
                params![
                    trade_id,
                    exit_price,
                    now.to_rfc3339(),
                    pnl,
                    return_pct,
                    holding_hours,
                    notes,
                ],
            )?;
            conn.execute(
                "UPDATE decision_context SET actual_return = ?2, was_profitable = ?3, \
                 outcome_notes = ?4 WHERE trade_id = ?1",
                params![
                    trade_id,
                    return_pct,
                    pnl.map(|p| (p > 0.0) as i64),
                    notes,
                ],
            )?;
            Ok(())
        })?;

        self.update_agent_accuracy(trade_id, pnl.unwrap_or(0.0) > 0.0, return_pct)?;

        info!(
            trade_id,
            pnl = pnl.unwrap_or(0.0),
            return_pct = return_pct.unwrap_or(0.0),
            "trade closed"
        );
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Trade history, newest first.
    pub fn get_trade_history(
        &self,
        ticker: Option<&str>,
        status: Option<TradeStatus>,
        limit: usize,
    ) -> Result<Vec<TradeRecord>> {
        self.store.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT id, order_id, client_order_id, ticker, action, quantity, entry_price, \
                 exit_price, entry_time, exit_time, stop_loss_price, take_profit_price, strategy, \
                 status, realized_pnl, return_pct, holding_period_hours, fractionable, notes \
                 FROM trade_history WHERE 1=1",
            );
            let mut bindings: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
            if let Some(t) = ticker {
                sql.push_str(" AND ticker = ?");
                bindings.push(Box::new(t.to_uppercase()));
            }
            if let Some(s) = status {
                sql.push_str(" AND status = ?");
                bindings.push(Box::new(s.as_str()));
            }
            sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
            bindings.push(Box::new(limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(bindings.iter().map(|b| b.as_ref())),
                Self::row_to_record,
            )?;
            rows.collect()
        })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRecord> {
        Ok(TradeRecord {
            id: row.get(0)?,
            order_id: row.get(1)?,
            client_order_id: row.get(2)?,
            ticker: row.get(3)?,
            action: TradeAction::parse(&row.get::<_, String>(4)?).unwrap_or(TradeAction::Buy),
            quantity: row.get(5)?,
            entry_price: row.get(6)?,
            exit_price: row.get(7)?,
            entry_time: parse_time(row.get(8)?),
            exit_time: parse_time(row.get(9)?),
            stop_loss_price: row.get(10)?,
            take_profit_price: row.get(11)?,
            strategy: row.get(12)?,
            status: TradeStatus::parse(&row.get::<_, String>(13)?),
            realized_pnl: row.get(14)?,
            return_pct: row.get(15)?,
            holding_period_hours: row.get(16)?,
            fractionable: row.get::<_, i64>(17)? != 0,
            notes: row.get(18)?,
        })
    }

    /// Most recent submission time for a ticker, used by the trade cooldown.
    pub fn last_trade_time(&self, ticker: &str) -> Result<Option<DateTime<Utc>>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT created_at FROM trade_history WHERE ticker = ?1 \
                 ORDER BY created_at DESC LIMIT 1",
            )?;
            let mut rows = stmt.query(params![ticker.to_uppercase()])?;
            match rows.next()? {
                Some(row) => Ok(parse_time(row.get(0)?)),
                None => Ok(None),
            }
        })
    }

    // -------------------------------------------------------------------------
    // Broker order import
    // -------------------------------------------------------------------------

    /// Import filled broker orders that are missing locally, keyed by order
    /// id. Returns (imported, skipped).
    pub fn import_orders(&self, orders: &[Order]) -> Result<(usize, usize)> {
        let mut imported = 0;
        let mut skipped = 0;

        for order in orders {
            if order.status != OrderStatus::Filled || order.filled_qty <= 0.0 {
                continue;
            }

            let exists = self.store.with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM trade_history WHERE order_id = ?1",
                    params![order.id],
                    |row| row.get::<_, i64>(0),
                )
            })? > 0;

            if exists {
                skipped += 1;
                continue;
            }

            let entry_time = order
                .filled_at
                .or(order.submitted_at)
                .unwrap_or_else(Utc::now)
                .to_rfc3339();
            self.store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO trade_history \
                     (order_id, client_order_id, ticker, action, quantity, entry_price, \
                      entry_time, status, fractionable, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'filled', 1, ?7)",
                    params![
                        order.id,
                        order.client_order_id,
                        order.symbol.to_uppercase(),
                        order.side,
                        order.filled_qty,
                        order.filled_avg_price,
                        entry_time,
                    ],
                )?;
                Ok(())
            })?;
            imported += 1;
        }

        info!(imported, skipped, "broker orders imported");
        Ok((imported, skipped))
    }

    // -------------------------------------------------------------------------
    // FIFO reconciliation
    // -------------------------------------------------------------------------

    /// Match closing legs against open lots per ticker and write realized
    /// P&L. Returns the number of legs closed.
    pub fn reconcile_fifo(&self) -> Result<usize> {
        let tickers: Vec<String> = self.store.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT ticker FROM trade_history ORDER BY ticker")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect()
        })?;

        let mut updated = 0;
        for ticker in tickers {
            updated += self.reconcile_ticker(&ticker)?;
        }
        Ok(updated)
    }

    fn reconcile_ticker(&self, ticker: &str) -> Result<usize> {
        #[derive(Debug)]
        struct Leg {
            id: i64,
            action: TradeAction,
            qty: f64,
            price: Option<f64>,
            closed: bool,
        }

        let legs: Vec<Leg> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, action, quantity, entry_price, status FROM trade_history \
                 WHERE ticker = ?1 ORDER BY entry_time ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![ticker], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            rows.map(|r| {
                r.map(|(id, action, qty, price, status)| Leg {
                    id,
                    action: TradeAction::parse(&action).unwrap_or(TradeAction::Buy),
                    qty,
                    price,
                    closed: status == "closed",
                })
            })
            .collect()
        })?;

        let mut buys: Vec<OpenLot> = Vec::new();
        let mut shorts: Vec<OpenLot> = Vec::new();
        let mut updated = 0;

        for leg in &legs {
            match leg.action {
                TradeAction::Buy => buys.push(OpenLot {
                    trade_id: leg.id,
                    remaining_qty: leg.qty,
                    price: leg.price.unwrap_or(0.0),
                }),
                TradeAction::Short => shorts.push(OpenLot {
                    trade_id: leg.id,
                    remaining_qty: leg.qty,
                    price: leg.price.unwrap_or(0.0),
                }),
                TradeAction::Sell if !leg.closed && !buys.is_empty() => {
                    let close_price = leg.price.unwrap_or(0.0);
                    let (matched_qty, cost_basis) = Self::consume(&mut buys, leg.qty)?;
                    if matched_qty > 0.0 {
                        let avg_cost = cost_basis / matched_qty;
                        let pnl = (close_price - avg_cost) * matched_qty;
                        let ret = if avg_cost > 0.0 {
                            (close_price - avg_cost) / avg_cost * 100.0
                        } else {
                            0.0
                        };
                        self.write_reconciled(leg.id, pnl, ret)?;
                        updated += 1;
                    }
                }
                TradeAction::Cover if !leg.closed && !shorts.is_empty() => {
                    let close_price = leg.price.unwrap_or(0.0);
                    let (matched_qty, basis) = Self::consume(&mut shorts, leg.qty)?;
                    if matched_qty > 0.0 {
                        let avg_short = basis / matched_qty;
                        let pnl = (avg_short - close_price) * matched_qty;
                        let ret = if avg_short > 0.0 {
                            (avg_short - close_price) / avg_short * 100.0
                        } else {
                            0.0
                        };
                        self.write_reconciled(leg.id, pnl, ret)?;
                        updated += 1;
                    }
                }
                _ => {}
            }
        }

        Ok(updated)
    }

    /// Consume lots oldest-first until `qty` is exhausted. Returns the
    /// matched quantity and its aggregate basis.
    fn consume(lots: &mut Vec<OpenLot>, qty: f64) -> Result<(f64, f64)> {
        let mut remaining = qty;
        let mut matched = 0.0;
        let mut basis = 0.0;

        while remaining > 1e-9 && !lots.is_empty() {
            let lot = &mut lots[0];
            if lot.remaining_qty < -1e-9 {
                return Err(TradingError::InvariantViolation(format!(
                    "negative lot quantity for trade {}",
                    lot.trade_id
                )));
            }
            let take = remaining.min(lot.remaining_qty);
            basis += take * lot.price;
            matched += take;
            remaining -= take;
            lot.remaining_qty -= take;
            if lot.remaining_qty <= 1e-9 {
                lots.remove(0);
            }
        }

        Ok((matched, basis))
    }

    fn write_reconciled(&self, trade_id: i64, pnl: f64, return_pct: f64) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE trade_history SET status = 'closed', realized_pnl = ?2, \
                 return_pct = ?3, exit_time = COALESCE(exit_time, ?4) WHERE id = ?1",
                params![
                    trade_id,
                    round2(pnl),
                    (return_pct * 10_000.0).round() / 10_000.0,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Remaining open buy lots for a ticker after FIFO matching.
    pub fn open_lots(&self, ticker: &str) -> Result<Vec<OpenLot>> {
        let trades = self.get_trade_history(Some(ticker), None, 10_000)?;
        let mut ordered = trades;
        ordered.sort_by_key(|t| (t.entry_time, t.id));

        let mut buys: Vec<OpenLot> = Vec::new();
        for trade in &ordered {
            match trade.action {
                TradeAction::Buy => buys.push(OpenLot {
                    trade_id: trade.id,
                    remaining_qty: trade.quantity,
                    price: trade.entry_price.unwrap_or(0.0),
                }),
                TradeAction::Sell => {
                    let _ = Self::consume(&mut buys, trade.quantity)?;
                }
                _ => {}
            }
        }
        Ok(buys)
    }

    /// Reset every closed leg back to `filled` and re-run FIFO from scratch.
    pub fn recompute_pnl(&self) -> Result<usize> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE trade_history SET status = 'filled', realized_pnl = NULL, \
                 return_pct = NULL WHERE status = 'closed'",
                [],
            )?;
            Ok(())
        })?;
        self.reconcile_fifo()
    }

    // -------------------------------------------------------------------------
    // Metrics
    // -------------------------------------------------------------------------

    /// Overall metrics over closed trades.
    pub fn metrics(&self) -> Result<TradeMetrics> {
        let closed = self.get_trade_history(None, Some(TradeStatus::Closed), 10_000)?;

        if closed.is_empty() {
            return Ok(TradeMetrics {
                total_trades: 0,
                winning_trades: 0,
                losing_trades: 0,
                win_rate: None,
                total_pnl: 0.0,
                average_pnl: None,
                average_return_pct: None,
                average_holding_hours: None,
                best_trade: None,
                worst_trade: None,
                profit_factor: None,
            });
        }

        let pnl = |t: &TradeRecord| t.realized_pnl.unwrap_or(0.0);
        let winners: Vec<&TradeRecord> = closed.iter().filter(|t| pnl(t) > 0.0).collect();
        let losers: Vec<&TradeRecord> = closed.iter().filter(|t| pnl(t) < 0.0).collect();

        let total_pnl: f64 = closed.iter().map(pnl).sum();
        let gross_wins: f64 = winners.iter().map(|t| pnl(t)).sum();
        let gross_losses: f64 = losers.iter().map(|t| pnl(t)).sum::<f64>().abs();

        let returns: Vec<f64> = closed.iter().filter_map(|t| t.return_pct).collect();
        let holdings: Vec<f64> = closed.iter().filter_map(|t| t.holding_period_hours).collect();

        let best = closed
            .iter()
            .max_by(|a, b| pnl(a).partial_cmp(&pnl(b)).unwrap_or(std::cmp::Ordering::Equal));
        let worst = closed
            .iter()
            .min_by(|a, b| pnl(a).partial_cmp(&pnl(b)).unwrap_or(std::cmp::Ordering::Equal));

        Ok(TradeMetrics {
            total_trades: closed.len(),
            winning_trades: winners.len(),
            losing_trades: losers.len(),
            win_rate: Some(winners.len() as f64 / closed.len() as f64 * 100.0),
            total_pnl: round2(total_pnl),
            average_pnl: Some(round2(total_pnl / closed.len() as f64)),
            average_return_pct: (!returns.is_empty())
                .then(|| round2(returns.iter().sum::<f64>() / returns.len() as f64)),
            average_holding_hours: (!holdings.is_empty())
                .then(|| round2(holdings.iter().sum::<f64>() / holdings.len() as f64)),
            best_trade: best.map(|t| (t.ticker.clone(), round2(pnl(t)))),
            worst_trade: worst.map(|t| (t.ticker.clone(), round2(pnl(t)))),
            profit_factor: (gross_losses > 0.0).then(|| round2(gross_wins / gross_losses)),
        })
    }

    /// Metrics keyed by strategy name (trades with no strategy fall under
    /// "unknown").
    pub fn metrics_by_strategy(&self) -> Result<HashMap<String, TradeMetrics>> {
        let closed = self.get_trade_history(None, Some(TradeStatus::Closed), 10_000)?;
        let mut groups: HashMap<String, Vec<TradeRecord>> = HashMap::new();
        for trade in closed {
            let key = trade.strategy.clone().unwrap_or_else(|| "unknown".to_string());
            groups.entry(key).or_default().push(trade);
        }

        let mut result = HashMap::new();
        for (strategy, trades) in groups {
            let pnl = |t: &TradeRecord| t.realized_pnl.unwrap_or(0.0);
            let winners = trades.iter().filter(|t| pnl(t) > 0.0).count();
            let losers = trades.iter().filter(|t| pnl(t) < 0.0).count();
            let total: f64 = trades.iter().map(pnl).sum();
            result.insert(
                strategy,
                TradeMetrics {
                    total_trades: trades.len(),
                    winning_trades: winners,
                    losing_trades: losers,
                    win_rate: Some(winners as f64 / trades.len() as f64 * 100.0),
                    total_pnl: round2(total),
                    average_pnl: Some(round2(total / trades.len() as f64)),
                    average_return_pct: None,
                    average_holding_hours: None,
                    best_trade: None,
                    worst_trade: None,
                    profit_factor: None,
                },
            );
        }
        Ok(result)
    }

    // -------------------------------------------------------------------------
    // Agent performance
    // -------------------------------------------------------------------------

    fn update_agent_signal_counts(&self, signals: &Value) -> Result<()> {
        let Some(map) = signals.as_object() else {
            return Ok(());
        };
        let now = Utc::now().to_rfc3339();

        for (agent, payload) in map {
            let signal = payload
                .get("signal")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_lowercase();
            let (bullish, bearish, neutral) =
                if signal.contains("bullish") || signal.contains("buy") {
                    (1, 0, 0)
                } else if signal.contains("bearish")
                    || signal.contains("sell")
                    || signal.contains("short")
                {
                    (0, 1, 0)
                } else {
                    (0, 0, 1)
                };

            self.store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO agent_performance \
                     (agent_name, total_signals, bullish_signals, bearish_signals, \
                      neutral_signals, last_signal_at) \
                     VALUES (?1, 1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(agent_name) DO UPDATE SET \
                       total_signals = total_signals + 1, \
                       bullish_signals = bullish_signals + ?2, \
                       bearish_signals = bearish_signals + ?3, \
                       neutral_signals = neutral_signals + ?4, \
                       last_signal_at = ?5",
                    params![agent, bullish, bearish, neutral, now],
                )?;
                Ok(())
            })?;
        }
        Ok(())
    }

    fn update_agent_accuracy(
        &self,
        trade_id: i64,
        was_profitable: bool,
        actual_return: Option<f64>,
    ) -> Result<()> {
        let context = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT agent_signals, pm_action, ticker FROM decision_context WHERE trade_id = ?1",
            )?;
            let mut rows = stmt.query(params![trade_id])?;
            match rows.next()? {
                Some(row) => Ok(Some((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                ))),
                None => Ok(None),
            }
        })?;

        let Some((Some(signals_json), pm_action, ticker)) = context else {
            return Ok(());
        };
        let Ok(signals) = serde_json::from_str::<Value>(&signals_json) else {
            return Ok(());
        };
        let Some(map) = signals.as_object() else {
            return Ok(());
        };

        let action = pm_action.unwrap_or_default();
        let action_bullish = matches!(action.as_str(), "buy" | "cover");
        let now = Utc::now().to_rfc3339();
        let ret = actual_return.unwrap_or(0.0);

        for (agent, payload) in map {
            let signal = payload
                .get("signal")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_lowercase();
            let agent_bullish = signal.contains("bullish") || signal.contains("buy");

            // Only agents that agreed with the executed action are scored.
            if agent_bullish != action_bullish {
                continue;
            }

            let (correct, incorrect) = if was_profitable { (1, 0) } else { (0, 1) };
            self.store.with_conn(|conn| {
                conn.execute(
                    "UPDATE agent_performance SET \
                       trades_following_signal = trades_following_signal + 1, \
                       correct_predictions = correct_predictions + ?2, \
                       incorrect_predictions = incorrect_predictions + ?3, \
                       total_return_when_followed = total_return_when_followed + ?4, \
                       accuracy_rate = CAST(correct_predictions + ?2 AS REAL) * 100.0 / \
                                       (correct_predictions + incorrect_predictions + 1), \
                       best_call_return = CASE WHEN ?5 > 0 AND \
                           (best_call_return IS NULL OR ?4 > best_call_return) \
                           THEN ?4 ELSE best_call_return END, \
                       best_call_ticker = CASE WHEN ?5 > 0 AND \
                           (best_call_return IS NULL OR ?4 > best_call_return) \
                           THEN ?6 ELSE best_call_ticker END, \
                       worst_call_return = CASE WHEN ?5 = 0 AND \
                           (worst_call_return IS NULL OR ?4 < worst_call_return) \
                           THEN ?4 ELSE worst_call_return END, \
                       worst_call_ticker = CASE WHEN ?5 = 0 AND \
                           (worst_call_return IS NULL OR ?4 < worst_call_return) \
                           THEN ?6 ELSE worst_call_ticker END, \
                       last_accuracy_update = ?7 \
                     WHERE agent_name = ?1",
                    params![
                        agent,
                        correct,
                        incorrect,
                        ret,
                        was_profitable as i64,
                        ticker,
                        now,
                    ],
                )?;
                Ok(())
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TradeHistoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeHistoryService").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TradeHistoryService {
        TradeHistoryService::new(Arc::new(Store::open(":memory:").unwrap()))
    }

    fn filled(
        service: &TradeHistoryService,
        ticker: &str,
        action: TradeAction,
        qty: f64,
        price: f64,
    ) -> i64 {
        let id = service
            .record_trade(
                &NewTrade {
                    ticker: ticker.to_string(),
                    action: Some(action),
                    quantity: qty,
                    entry_price: Some(price),
                    order_id: Some(format!("ord-{ticker}-{action}-{qty}-{price}")),
                    fractionable: true,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        service
            .mark_filled(
                &format!("ord-{ticker}-{action}-{qty}-{price}"),
                Some(price),
                Some(Utc::now()),
            )
            .unwrap();
        id
    }

    // ---- FIFO -------------------------------------------------------------

    #[test]
    fn fifo_partial_lot_consumption() {
        let svc = service();
        filled(&svc, "AAPL", TradeAction::Buy, 10.0, 100.0);
        filled(&svc, "AAPL", TradeAction::Buy, 10.0, 110.0);
        let sell_id = filled(&svc, "AAPL", TradeAction::Sell, 15.0, 120.0);

        let updated = svc.reconcile_fifo().unwrap();
        assert_eq!(updated, 1);

        let trades = svc.get_trade_history(Some("AAPL"), None, 10).unwrap();
        let sell = trades.iter().find(|t| t.id == sell_id).unwrap();
        assert_eq!(sell.status, TradeStatus::Closed);
        // (120-100)*10 + (120-110)*5 = 250
        assert!((sell.realized_pnl.unwrap() - 250.0).abs() < 1e-6);

        let lots = svc.open_lots("AAPL").unwrap();
        assert_eq!(lots.len(), 1);
        assert!((lots[0].remaining_qty - 5.0).abs() < 1e-9);
        assert!((lots[0].price - 110.0).abs() < 1e-9);
    }

    #[test]
    fn fifo_realized_pnl_matches_cash_flow() {
        let svc = service();
        // Buys: 10@100, 5@105, 20@95; Sells: 12@110, 18@102.
        filled(&svc, "MSFT", TradeAction::Buy, 10.0, 100.0);
        filled(&svc, "MSFT", TradeAction::Buy, 5.0, 105.0);
        filled(&svc, "MSFT", TradeAction::Buy, 20.0, 95.0);
        filled(&svc, "MSFT", TradeAction::Sell, 12.0, 110.0);
        filled(&svc, "MSFT", TradeAction::Sell, 18.0, 102.0);

        svc.reconcile_fifo().unwrap();

        let closed = svc
            .get_trade_history(Some("MSFT"), Some(TradeStatus::Closed), 10)
            .unwrap();
        let total_pnl: f64 = closed.iter().filter_map(|t| t.realized_pnl).sum();

        // Sum of sells − matched buy basis:
        // sell proceeds = 12*110 + 18*102 = 3156
        // matched basis = 10*100 + 2*105 + 3*105 + 15*95 = 2950
        assert!((total_pnl - 206.0).abs() < 1e-6, "got {total_pnl}");
    }

    #[test]
    fn fifo_short_cover_matching() {
        let svc = service();
        filled(&svc, "NIO", TradeAction::Short, 10.0, 100.0);
        let cover_id = filled(&svc, "NIO", TradeAction::Cover, 10.0, 90.0);

        svc.reconcile_fifo().unwrap();

        let trades = svc.get_trade_history(Some("NIO"), None, 10).unwrap();
        let cover = trades.iter().find(|t| t.id == cover_id).unwrap();
        assert_eq!(cover.status, TradeStatus::Closed);
        assert!((cover.realized_pnl.unwrap() - 100.0).abs() < 1e-6);
        assert!((cover.return_pct.unwrap() - 10.0).abs() < 1e-3);
    }

    #[test]
    fn fifo_is_idempotent() {
        let svc = service();
        filled(&svc, "F", TradeAction::Buy, 10.0, 10.0);
        filled(&svc, "F", TradeAction::Sell, 10.0, 11.0);

        assert_eq!(svc.reconcile_fifo().unwrap(), 1);
        // Second pass finds nothing to do.
        assert_eq!(svc.reconcile_fifo().unwrap(), 0);
    }

    #[test]
    fn sell_without_buys_left_open() {
        let svc = service();
        filled(&svc, "GM", TradeAction::Sell, 10.0, 50.0);
        assert_eq!(svc.reconcile_fifo().unwrap(), 0);
        let trades = svc.get_trade_history(Some("GM"), None, 10).unwrap();
        assert_eq!(trades[0].status, TradeStatus::Filled);
    }

    #[test]
    fn recompute_resets_then_rebuilds() {
        let svc = service();
        filled(&svc, "AAPL", TradeAction::Buy, 10.0, 100.0);
        filled(&svc, "AAPL", TradeAction::Sell, 10.0, 105.0);
        svc.reconcile_fifo().unwrap();

        let updated = svc.recompute_pnl().unwrap();
        assert_eq!(updated, 1);
        let closed = svc
            .get_trade_history(Some("AAPL"), Some(TradeStatus::Closed), 10)
            .unwrap();
        assert!((closed[0].realized_pnl.unwrap() - 50.0).abs() < 1e-6);
    }

    // ---- lifecycle --------------------------------------------------------

    #[test]
    fn record_then_fill_then_close() {
        let svc = service();
        let id = svc
            .record_trade(
                &NewTrade {
                    ticker: "sofi".to_string(),
                    action: Some(TradeAction::Buy),
                    quantity: 4.0,
                    entry_price: Some(10.0),
                    order_id: Some("ord-1".to_string()),
                    strategy: Some("momentum".to_string()),
                    fractionable: true,
                    ..Default::default()
                },
                None,
            )
            .unwrap();

        let trades = svc.get_trade_history(Some("SOFI"), None, 10).unwrap();
        assert_eq!(trades[0].status, TradeStatus::Pending);
        assert_eq!(trades[0].ticker, "SOFI");

        assert!(svc.mark_filled("ord-1", Some(10.05), Some(Utc::now())).unwrap());
        let trades = svc.get_trade_history(Some("SOFI"), None, 10).unwrap();
        assert_eq!(trades[0].status, TradeStatus::Filled);
        assert_eq!(trades[0].entry_price, Some(10.05));

        assert!(svc.close_trade(id, 11.0, None, Some("auto_exit: take_profit")).unwrap());
        let trades = svc.get_trade_history(Some("SOFI"), None, 10).unwrap();
        let closed = &trades[0];
        assert_eq!(closed.status, TradeStatus::Closed);
        assert!((closed.realized_pnl.unwrap() - (11.0 - 10.05) * 4.0).abs() < 1e-9);
        assert!(closed.return_pct.unwrap() > 0.0);
        assert!(closed.holding_period_hours.is_some());
        assert_eq!(closed.notes.as_deref(), Some("auto_exit: take_profit"));
    }

    #[test]
    fn decision_context_outcome_written_on_close() {
        let svc = service();
        let ctx = DecisionContextRecord {
            trigger_source: "scheduler".to_string(),
            strategy_name: Some("momentum".to_string()),
            agent_signals: Some(serde_json::json!({
                "quant_agent": { "signal": "bullish", "confidence": 70 }
            })),
            bullish_count: 1,
            pm_action: Some("buy".to_string()),
            ..Default::default()
        };
        let id = svc
            .record_trade(
                &NewTrade {
                    ticker: "AAPL".to_string(),
                    action: Some(TradeAction::Buy),
                    quantity: 1.0,
                    entry_price: Some(100.0),
                    fractionable: true,
                    ..Default::default()
                },
                Some(&ctx),
            )
            .unwrap();

        svc.close_trade(id, 110.0, None, None).unwrap();

        let store = &svc.store;
        let (actual_return, was_profitable): (Option<f64>, Option<i64>) = store
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT actual_return, was_profitable FROM decision_context WHERE trade_id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
            })
            .unwrap();
        assert!((actual_return.unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(was_profitable, Some(1));

        // Agent stats were created and scored.
        let (total, correct): (i64, i64) = store
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT total_signals, correct_predictions FROM agent_performance \
                     WHERE agent_name = 'quant_agent'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
            })
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(correct, 1);
    }

    #[test]
    fn import_orders_skips_existing() {
        let svc = service();
        let order = Order {
            id: "broker-1".to_string(),
            client_order_id: "c-1".to_string(),
            symbol: "AAPL".to_string(),
            side: "buy".to_string(),
            order_type: "market".to_string(),
            qty: 5.0,
            filled_qty: 5.0,
            filled_avg_price: Some(100.0),
            status: OrderStatus::Filled,
            time_in_force: "day".to_string(),
            limit_price: None,
            stop_price: None,
            submitted_at: Some(Utc::now()),
            filled_at: Some(Utc::now()),
        };

        let (imported, skipped) = svc.import_orders(std::slice::from_ref(&order)).unwrap();
        assert_eq!((imported, skipped), (1, 0));

        let (imported, skipped) = svc.import_orders(std::slice::from_ref(&order)).unwrap();
        assert_eq!((imported, skipped), (0, 1));

        // Unfilled orders are ignored entirely.
        let open = Order {
            id: "broker-2".to_string(),
            status: OrderStatus::New,
            filled_qty: 0.0,
            ..order
        };
        let (imported, skipped) = svc.import_orders(&[open]).unwrap();
        assert_eq!((imported, skipped), (0, 0));
    }

    #[test]
    fn last_trade_time_tracks_latest() {
        let svc = service();
        assert!(svc.last_trade_time("AAPL").unwrap().is_none());
        filled(&svc, "AAPL", TradeAction::Buy, 1.0, 100.0);
        let last = svc.last_trade_time("AAPL").unwrap().unwrap();
        assert!((Utc::now() - last).num_seconds() < 5);
    }

    // ---- metrics ----------------------------------------------------------

    #[test]
    fn metrics_over_closed_trades() {
        let svc = service();
        let win = filled(&svc, "AAPL", TradeAction::Buy, 10.0, 100.0);
        let lose = filled(&svc, "MSFT", TradeAction::Buy, 10.0, 200.0);
        svc.close_trade(win, 110.0, None, None).unwrap(); // +100
        svc.close_trade(lose, 195.0, None, None).unwrap(); // -50

        let metrics = svc.metrics().unwrap();
        assert_eq!(metrics.total_trades, 2);
        assert_eq!(metrics.winning_trades, 1);
        assert_eq!(metrics.losing_trades, 1);
        assert_eq!(metrics.win_rate, Some(50.0));
        assert!((metrics.total_pnl - 50.0).abs() < 1e-6);
        assert_eq!(metrics.profit_factor, Some(2.0));
        assert_eq!(metrics.best_trade.as_ref().unwrap().0, "AAPL");
        assert_eq!(metrics.worst_trade.as_ref().unwrap().0, "MSFT");
    }

    #[test]
    fn empty_metrics() {
        let svc = service();
        let metrics = svc.metrics().unwrap();
        assert_eq!(metrics.total_trades, 0);
        assert!(metrics.win_rate.is_none());
        assert!(metrics.profit_factor.is_none());
    }
}
