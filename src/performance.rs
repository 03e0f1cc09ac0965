// =============================================================================
// Performance Tracker — live portfolio metrics and daily snapshots
// =============================================================================
//
// Live numbers come straight from the broker; realized figures come from the
// trade history. Daily snapshots are keyed by the exchange-timezone calendar
// date and are idempotent: re-running the snapshot job replaces the same
// day's row.
// =============================================================================

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use rusqlite::params;
use serde::Serialize;
use tracing::info;

use crate::broker::Broker;
use crate::error::Result;
use crate::history::{TradeHistoryService, TradeStatus};
use crate::store::Store;
use crate::types::round2;

/// Per-position unrealized P&L line.
#[derive(Debug, Clone, Serialize)]
pub struct PositionPnl {
    pub ticker: String,
    pub qty: f64,
    pub side: String,
    pub entry_price: f64,
    pub current_price: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
}

/// Live portfolio performance view.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentPerformance {
    pub equity: f64,
    pub cash: f64,
    pub buying_power: f64,
    pub total_unrealized_pnl: f64,
    pub positions_count: usize,
    pub positions: Vec<PositionPnl>,
    pub best_position: Option<PositionPnl>,
    pub worst_position: Option<PositionPnl>,
}

/// End-of-day snapshot row.
#[derive(Debug, Clone, Serialize)]
pub struct DailySnapshot {
    pub date: NaiveDate,
    pub starting_equity: f64,
    pub ending_equity: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_pnl: f64,
    pub return_pct: f64,
    pub trades_count: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub biggest_winner: Option<f64>,
    pub biggest_winner_ticker: Option<String>,
    pub biggest_loser: Option<f64>,
    pub biggest_loser_ticker: Option<String>,
}

pub struct PerformanceTracker {
    broker: Arc<dyn Broker>,
    history: Arc<TradeHistoryService>,
    store: Arc<Store>,
    tz: Tz,
}

impl PerformanceTracker {
    pub fn new(
        broker: Arc<dyn Broker>,
        history: Arc<TradeHistoryService>,
        store: Arc<Store>,
        tz: Tz,
    ) -> Self {
        Self {
            broker,
            history,
            store,
            tz,
        }
    }

    /// Real-time portfolio performance from the broker.
    pub async fn current_performance(&self) -> Result<CurrentPerformance> {
        let account = self.broker.get_account().await?;
        let positions = self.broker.get_positions().await?;

        let mut lines: Vec<PositionPnl> = positions
            .iter()
            .map(|p| PositionPnl {
                ticker: p.symbol.clone(),
                qty: p.qty,
                side: p.side.clone(),
                entry_price: p.avg_entry_price,
                current_price: p.current_price,
                market_value: p.market_value,
                unrealized_pnl: round2(p.unrealized_pl),
                unrealized_pnl_pct: round2(p.unrealized_pl_pct),
            })
            .collect();
        lines.sort_by(|a, b| {
            b.unrealized_pnl
                .partial_cmp(&a.unrealized_pnl)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let total_unrealized: f64 = lines.iter().map(|l| l.unrealized_pnl).sum();

        Ok(CurrentPerformance {
            equity: account.equity,
            cash: account.cash,
            buying_power: account.buying_power,
            total_unrealized_pnl: round2(total_unrealized),
            positions_count: lines.len(),
            best_position: lines.first().cloned(),
            worst_position: lines.last().cloned(),
            positions: lines,
        })
    }

    /// Today's calendar date in the exchange timezone.
    pub fn trading_date(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.tz).date_naive()
    }

    /// Build and persist the end-of-day snapshot. Idempotent per date: a
    /// re-run replaces the existing row for the same day.
    pub async fn create_daily_snapshot(&self) -> Result<DailySnapshot> {
        let date = self.trading_date();
        let perf = self.current_performance().await?;

        // Trades closed today drive the realized figures.
        let closed_today = self.closed_trades_on(date)?;
        let winners: Vec<&(String, f64)> =
            closed_today.iter().filter(|(_, pnl)| *pnl > 0.0).collect();
        let losers: Vec<&(String, f64)> =
            closed_today.iter().filter(|(_, pnl)| *pnl < 0.0).collect();
        let realized: f64 = closed_today.iter().map(|(_, pnl)| pnl).sum();

        let biggest_winner = winners
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let biggest_loser = losers
            .iter()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        // Yesterday's snapshot anchors the starting equity.
        let starting_equity = self
            .previous_ending_equity(date)?
            .unwrap_or(perf.equity - realized - perf.total_unrealized_pnl)
            .max(0.0);

        let total_pnl = realized + perf.total_unrealized_pnl;
        let return_pct = if starting_equity > 0.0 {
            (perf.equity - starting_equity) / starting_equity * 100.0
        } else {
            0.0
        };

        let trades_today = self.trades_created_on(date)?;

        let snapshot = DailySnapshot {
            date,
            starting_equity: round2(starting_equity),
            ending_equity: round2(perf.equity),
            realized_pnl: round2(realized),
            unrealized_pnl: perf.total_unrealized_pnl,
            total_pnl: round2(total_pnl),
            return_pct: round2(return_pct),
            trades_count: trades_today,
            winning_trades: winners.len(),
            losing_trades: losers.len(),
            biggest_winner: biggest_winner.map(|(_, pnl)| round2(*pnl)),
            biggest_winner_ticker: biggest_winner.map(|(t, _)| t.clone()),
            biggest_loser: biggest_loser.map(|(_, pnl)| round2(*pnl)),
            biggest_loser_ticker: biggest_loser.map(|(t, _)| t.clone()),
        };

        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO daily_snapshots \
                 (date, starting_equity, ending_equity, realized_pnl, unrealized_pnl, total_pnl, \
                  return_pct, trades_count, winning_trades, losing_trades, biggest_winner, \
                  biggest_winner_ticker, biggest_loser, biggest_loser_ticker, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    snapshot.date.to_string(),
                    snapshot.starting_equity,
                    snapshot.ending_equity,
                    snapshot.realized_pnl,
                    snapshot.unrealized_pnl,
                    snapshot.total_pnl,
                    snapshot.return_pct,
                    snapshot.trades_count as i64,
                    snapshot.winning_trades as i64,
                    snapshot.losing_trades as i64,
                    snapshot.biggest_winner,
                    snapshot.biggest_winner_ticker,
                    snapshot.biggest_loser,
                    snapshot.biggest_loser_ticker,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        info!(date = %snapshot.date, total_pnl = snapshot.total_pnl, "daily snapshot created");
        Ok(snapshot)
    }

    /// Snapshots for the last `days` days, oldest first.
    pub fn get_daily_snapshots(&self, days: i64) -> Result<Vec<DailySnapshot>> {
        let cutoff = (self.trading_date() - Duration::days(days)).to_string();
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT date, starting_equity, ending_equity, realized_pnl, unrealized_pnl, \
                 total_pnl, return_pct, trades_count, winning_trades, losing_trades, \
                 biggest_winner, biggest_winner_ticker, biggest_loser, biggest_loser_ticker \
                 FROM daily_snapshots WHERE date >= ?1 ORDER BY date ASC",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| {
                Ok(DailySnapshot {
                    date: row
                        .get::<_, String>(0)?
                        .parse()
                        .unwrap_or_else(|_| NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()),
                    starting_equity: row.get(1)?,
                    ending_equity: row.get(2)?,
                    realized_pnl: row.get(3)?,
                    unrealized_pnl: row.get(4)?,
                    total_pnl: row.get(5)?,
                    return_pct: row.get(6)?,
                    trades_count: row.get::<_, i64>(7)? as usize,
                    winning_trades: row.get::<_, i64>(8)? as usize,
                    losing_trades: row.get::<_, i64>(9)? as usize,
                    biggest_winner: row.get(10)?,
                    biggest_winner_ticker: row.get(11)?,
                    biggest_loser: row.get(12)?,
                    biggest_loser_ticker: row.get(13)?,
                })
            })?;
            rows.collect()
        })
    }

    // -------------------------------------------------------------------------
    // Internal queries
    // -------------------------------------------------------------------------

    fn closed_trades_on(&self, date: NaiveDate) -> Result<Vec<(String, f64)>> {
        let closed = self
            .history
            .get_trade_history(None, Some(TradeStatus::Closed), 10_000)?;
        Ok(closed
            .into_iter()
            .filter(|t| {
                t.exit_time
                    .map(|ts| ts.with_timezone(&self.tz).date_naive() == date)
                    .unwrap_or(false)
            })
            .map(|t| (t.ticker, t.realized_pnl.unwrap_or(0.0)))
            .collect())
    }

    fn trades_created_on(&self, date: NaiveDate) -> Result<usize> {
        let all = self.history.get_trade_history(None, None, 10_000)?;
        Ok(all
            .iter()
            .filter(|t| {
                t.entry_time
                    .map(|ts| ts.with_timezone(&self.tz).date_naive() == date)
                    .unwrap_or(false)
            })
            .count())
    }

    fn previous_ending_equity(&self, before: NaiveDate) -> Result<Option<f64>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ending_equity FROM daily_snapshots WHERE date < ?1 \
                 ORDER BY date DESC LIMIT 1",
            )?;
            let mut rows = stmt.query(params![before.to_string()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get(0)?)),
                None => Ok(None),
            }
        })
    }
}

impl std::fmt::Debug for PerformanceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceTracker").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::NewTrade;
    use crate::testutil::FakeBroker;
    use crate::types::TradeAction;

    fn tracker_with(equity: f64) -> (PerformanceTracker, Arc<TradeHistoryService>, Arc<Store>) {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let history = Arc::new(TradeHistoryService::new(Arc::clone(&store)));
        let broker = Arc::new(FakeBroker::with_equity(equity));
        let tracker = PerformanceTracker::new(
            broker,
            Arc::clone(&history),
            Arc::clone(&store),
            chrono_tz::America::New_York,
        );
        (tracker, history, store)
    }

    #[tokio::test]
    async fn current_performance_reflects_account() {
        let (tracker, _, _) = tracker_with(25_000.0);
        let perf = tracker.current_performance().await.unwrap();
        assert_eq!(perf.equity, 25_000.0);
        assert_eq!(perf.positions_count, 0);
        assert!(perf.best_position.is_none());
    }

    #[tokio::test]
    async fn daily_snapshot_is_idempotent_per_date() {
        let (tracker, history, store) = tracker_with(10_000.0);

        let id = history
            .record_trade(
                &NewTrade {
                    ticker: "AAPL".to_string(),
                    action: Some(TradeAction::Buy),
                    quantity: 10.0,
                    entry_price: Some(100.0),
                    fractionable: true,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        history.close_trade(id, 110.0, None, None).unwrap();

        let first = tracker.create_daily_snapshot().await.unwrap();
        assert_eq!(first.winning_trades, 1);
        assert!((first.realized_pnl - 100.0).abs() < 1e-6);
        assert_eq!(first.biggest_winner_ticker.as_deref(), Some("AAPL"));

        // Second run for the same date replaces, not duplicates.
        let _second = tracker.create_daily_snapshot().await.unwrap();
        let count: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM daily_snapshots", [], |row| row.get(0))
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn snapshot_window_query() {
        let (tracker, _, _) = tracker_with(10_000.0);
        tracker.create_daily_snapshot().await.unwrap();
        let snaps = tracker.get_daily_snapshots(7).unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].date, tracker.trading_date());
    }
}
