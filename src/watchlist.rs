// =============================================================================
// Watchlist Service — durable candidate trades with trigger monitoring
// =============================================================================
//
// Items progress monotonically: watching → triggered | expired | cancelled.
// Triggering is advisory only — no orders are placed here; triggered tickers
// feed the next trading cycle's universe.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::Serialize;
use tracing::{info, warn};

use crate::data::PriceProvider;
use crate::error::{Result, TradingError};
use crate::store::Store;
use crate::strategy::StrategyEngine;
use crate::types::{round2, Direction, Strength, TradingSignal};

/// Days of history fetched when only the latest close is needed.
const RECENT_WINDOW_DAYS: i64 = 7;

/// Trading days in the breakout reference window.
const BREAKOUT_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchlistStatus {
    Watching,
    Triggered,
    Expired,
    Cancelled,
}

impl WatchlistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Watching => "watching",
            Self::Triggered => "triggered",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "triggered" => Self::Triggered,
            "expired" => Self::Expired,
            "cancelled" => Self::Cancelled,
            _ => Self::Watching,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryCondition {
    Above,
    Below,
    Breakout,
}

impl EntryCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Above => "above",
            Self::Below => "below",
            Self::Breakout => "breakout",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "above" => Self::Above,
            "breakout" => Self::Breakout,
            _ => Self::Below,
        }
    }
}

/// Sort order for watchlist queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Priority,
    CreatedAt,
    Ticker,
}

/// One durable watchlist row.
#[derive(Debug, Clone, Serialize)]
pub struct WatchlistItem {
    pub id: i64,
    pub ticker: String,
    pub strategy: Option<String>,
    pub entry_target: Option<f64>,
    pub entry_condition: EntryCondition,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub position_size_pct: f64,
    pub status: WatchlistStatus,
    pub priority: i64,
    pub notes: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub triggered_price: Option<f64>,
}

/// Input for a new watchlist entry.
#[derive(Debug, Clone)]
pub struct NewWatchlistItem {
    pub ticker: String,
    pub entry_target: Option<f64>,
    pub entry_condition: EntryCondition,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub position_size_pct: f64,
    pub strategy: Option<String>,
    pub priority: i64,
    pub notes: Option<String>,
    pub expires_in_days: i64,
}

impl Default for NewWatchlistItem {
    fn default() -> Self {
        Self {
            ticker: String::new(),
            entry_target: None,
            entry_condition: EntryCondition::Below,
            stop_loss: None,
            take_profit: None,
            position_size_pct: 0.05,
            strategy: None,
            priority: 5,
            notes: None,
            expires_in_days: 30,
        }
    }
}

/// Field updates for an existing item. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct WatchlistUpdate {
    pub entry_target: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub priority: Option<i64>,
    pub notes: Option<String>,
    pub status: Option<WatchlistStatus>,
}

/// Analysis line for one watched ticker.
#[derive(Debug, Clone, Serialize)]
pub struct WatchlistAnalysis {
    pub ticker: String,
    pub current_price: Option<f64>,
    pub entry_target: Option<f64>,
    pub distance_to_target_pct: Option<f64>,
    pub signals: Vec<TradingSignal>,
    pub priority: i64,
}

/// Summary counters.
#[derive(Debug, Clone, Serialize)]
pub struct WatchlistSummary {
    pub total_items: usize,
    pub watching: usize,
    pub triggered: usize,
    pub expired: usize,
    pub high_priority: usize,
    pub expiring_soon: usize,
}

/// External AI stock-ranking contract for watchlist auto-enrichment.
#[async_trait]
pub trait StockRanker: Send + Sync {
    /// Stocks scoring at or above `min_score`, best first.
    async fn top_ranked(&self, min_score: f64, limit: usize) -> Result<Vec<RankedStock>>;
}

#[derive(Debug, Clone)]
pub struct RankedStock {
    pub symbol: String,
    pub score: f64,
    pub sector: Option<String>,
}

/// Outcome of one enrichment run.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentResult {
    pub added: Vec<String>,
    pub skipped: usize,
}

pub struct WatchlistService {
    store: Arc<Store>,
    provider: Arc<dyn PriceProvider>,
    engine: Arc<StrategyEngine>,
}

impl WatchlistService {
    pub fn new(
        store: Arc<Store>,
        provider: Arc<dyn PriceProvider>,
        engine: Arc<StrategyEngine>,
    ) -> Self {
        Self {
            store,
            provider,
            engine,
        }
    }

    // -------------------------------------------------------------------------
    // CRUD
    // -------------------------------------------------------------------------

    /// Add a ticker to the watchlist. A missing entry target defaults to 2%
    /// below the latest close; missing stops default to 5% below / 10% above
    /// the target.
    pub async fn add_item(&self, mut new: NewWatchlistItem) -> Result<WatchlistItem> {
        new.ticker = new.ticker.to_uppercase();

        if new.entry_target.is_none() {
            if let Some(close) = self.latest_close(&new.ticker).await {
                new.entry_target = Some(round2(close * 0.98));
            }
        }
        if let Some(target) = new.entry_target {
            if new.stop_loss.is_none() {
                new.stop_loss = Some(round2(target * 0.95));
            }
            if new.take_profit.is_none() {
                new.take_profit = Some(round2(target * 1.10));
            }
        }

        let now = Utc::now();
        let expires = now + Duration::days(new.expires_in_days);

        let id = self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO watchlist \
                 (ticker, strategy, entry_target, entry_condition, stop_loss, take_profit, \
                  position_size_pct, status, priority, notes, created_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'watching', ?8, ?9, ?10, ?11)",
                params![
                    new.ticker,
                    new.strategy,
                    new.entry_target,
                    new.entry_condition.as_str(),
                    new.stop_loss,
                    new.take_profit,
                    new.position_size_pct,
                    new.priority,
                    new.notes,
                    now.to_rfc3339(),
                    expires.to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        info!(
            ticker = %new.ticker,
            target = ?new.entry_target,
            condition = new.entry_condition.as_str(),
            "watchlist item added"
        );

        self.get_item(id)?.ok_or_else(|| {
            TradingError::Storage("watchlist row vanished after insert".to_string())
        })
    }

    /// Create a watchlist item from a trading signal: entry below for longs,
    /// above for shorts, high priority for strong signals.
    pub async fn add_from_signal(&self, signal: &TradingSignal) -> Result<WatchlistItem> {
        let condition = if signal.direction == Direction::Long {
            EntryCondition::Below
        } else {
            EntryCondition::Above
        };
        self.add_item(NewWatchlistItem {
            ticker: signal.ticker.clone(),
            entry_target: Some(signal.entry_price),
            entry_condition: condition,
            stop_loss: Some(signal.stop_loss),
            take_profit: Some(signal.take_profit),
            position_size_pct: signal.position_size_pct,
            strategy: Some(signal.strategy.clone()),
            priority: if signal.strength == Strength::Strong { 8 } else { 5 },
            notes: Some(signal.reasoning.clone()),
            expires_in_days: 30,
        })
        .await
    }

    /// Update fields on an item. Status changes must be monotone: an item
    /// that left `watching` can never return to it.
    pub fn update_item(&self, id: i64, update: WatchlistUpdate) -> Result<Option<WatchlistItem>> {
        let Some(current) = self.get_item(id)? else {
            return Ok(None);
        };

        if let Some(new_status) = update.status {
            let leaving_terminal = current.status != WatchlistStatus::Watching
                && new_status == WatchlistStatus::Watching;
            if leaving_terminal {
                return Err(TradingError::PreconditionFailed(format!(
                    "watchlist item {id} is {} and cannot return to watching",
                    current.status.as_str()
                )));
            }
        }

        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE watchlist SET \
                 entry_target = COALESCE(?2, entry_target), \
                 stop_loss = COALESCE(?3, stop_loss), \
                 take_profit = COALESCE(?4, take_profit), \
                 priority = COALESCE(?5, priority), \
                 notes = COALESCE(?6, notes), \
                 status = COALESCE(?7, status) \
                 WHERE id = ?1",
                params![
                    id,
                    update.entry_target,
                    update.stop_loss,
                    update.take_profit,
                    update.priority,
                    update.notes,
                    update.status.map(|s| s.as_str()),
                ],
            )?;
            Ok(())
        })?;
        self.get_item(id)
    }

    pub fn remove_item(&self, id: i64) -> Result<bool> {
        let deleted = self
            .store
            .with_conn(|conn| conn.execute("DELETE FROM watchlist WHERE id = ?1", params![id]))?;
        Ok(deleted > 0)
    }

    pub fn get_item(&self, id: i64) -> Result<Option<WatchlistItem>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_ITEM} WHERE id = ?1"))?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => Ok(Some(Self::row_to_item(row)?)),
                None => Ok(None),
            }
        })
    }

    /// The watchlist, optionally filtered by status.
    pub fn get_watchlist(
        &self,
        status: Option<WatchlistStatus>,
        sort_by: SortBy,
    ) -> Result<Vec<WatchlistItem>> {
        let order = match sort_by {
            SortBy::Priority => "priority DESC, id ASC",
            SortBy::CreatedAt => "created_at DESC",
            SortBy::Ticker => "ticker ASC",
        };
        self.store.with_conn(|conn| {
            let (sql, filter) = match status {
                Some(s) => (
                    format!("{SELECT_ITEM} WHERE status = ?1 ORDER BY {order}"),
                    Some(s.as_str()),
                ),
                None => (format!("{SELECT_ITEM} ORDER BY {order}"), None),
            };
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = match filter {
                Some(s) => stmt.query(params![s])?,
                None => stmt.query([])?,
            };
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(Self::row_to_item(row)?);
            }
            Ok(items)
        })
    }

    // -------------------------------------------------------------------------
    // Trigger evaluation
    // -------------------------------------------------------------------------

    /// Evaluate every watching item: expire overdue entries, then check the
    /// entry condition against the latest close. Returns the newly triggered
    /// items.
    pub async fn check_triggers(&self) -> Result<Vec<WatchlistItem>> {
        let watching = self.get_watchlist(Some(WatchlistStatus::Watching), SortBy::Priority)?;
        let now = Utc::now();
        let mut triggered = Vec::new();

        for item in watching {
            if let Some(expires) = item.expires_at {
                if expires < now {
                    self.mark_expired(item.id)?;
                    continue;
                }
            }

            let fired = match self.evaluate_condition(&item).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(ticker = %item.ticker, error = %e, "trigger check failed");
                    continue;
                }
            };

            if let Some(price) = fired {
                self.store.with_conn(|conn| {
                    conn.execute(
                        "UPDATE watchlist SET status = 'triggered', triggered_at = ?2, \
                         triggered_price = ?3 WHERE id = ?1 AND status = 'watching'",
                        params![item.id, now.to_rfc3339(), price],
                    )?;
                    Ok(())
                })?;
                info!(ticker = %item.ticker, price, "watchlist trigger");
                if let Some(updated) = self.get_item(item.id)? {
                    triggered.push(updated);
                }
            }
        }

        Ok(triggered)
    }

    /// Returns the triggering price when the item's condition is met.
    async fn evaluate_condition(&self, item: &WatchlistItem) -> Result<Option<f64>> {
        match item.entry_condition {
            EntryCondition::Below => {
                let Some(target) = item.entry_target else {
                    return Ok(None);
                };
                let Some(close) = self.latest_close(&item.ticker).await else {
                    return Ok(None);
                };
                Ok((close <= target).then_some(close))
            }
            EntryCondition::Above => {
                let Some(target) = item.entry_target else {
                    return Ok(None);
                };
                let Some(close) = self.latest_close(&item.ticker).await else {
                    return Ok(None);
                };
                Ok((close >= target).then_some(close))
            }
            EntryCondition::Breakout => {
                let end = Utc::now().date_naive();
                let start = end - Duration::days(40);
                let bars = self.provider.get_prices(&item.ticker, start, end).await?;
                if bars.len() < 2 {
                    return Ok(None);
                }
                let close = bars.last().map(|b| b.close).unwrap_or(0.0);
                // High over the last 20 trading days excluding today.
                let history = &bars[..bars.len() - 1];
                let window = &history[history.len().saturating_sub(BREAKOUT_WINDOW)..];
                let high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
                Ok((close > high).then_some(close))
            }
        }
    }

    fn mark_expired(&self, id: i64) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE watchlist SET status = 'expired' WHERE id = ?1 AND status = 'watching'",
                params![id],
            )?;
            Ok(())
        })
    }

    // -------------------------------------------------------------------------
    // Analysis and enrichment
    // -------------------------------------------------------------------------

    /// Run the strategy engine over every watching item.
    pub async fn analyze_watchlist(&self) -> Result<Vec<WatchlistAnalysis>> {
        let watching = self.get_watchlist(Some(WatchlistStatus::Watching), SortBy::Priority)?;
        let mut results = Vec::new();

        for item in watching {
            let signals = self
                .engine
                .analyze_ticker(&item.ticker, None)
                .await
                .unwrap_or_default();
            let current = self.latest_close(&item.ticker).await;
            let distance = match (current, item.entry_target) {
                (Some(price), Some(target)) if target > 0.0 => {
                    Some(round2((price - target) / target * 100.0))
                }
                _ => None,
            };
            results.push(WatchlistAnalysis {
                ticker: item.ticker,
                current_price: current,
                entry_target: item.entry_target,
                distance_to_target_pct: distance,
                signals,
                priority: item.priority,
            });
        }
        Ok(results)
    }

    /// Populate the watchlist from an external ranking: score descending,
    /// ties broken by symbol, capped per sector and in total. Already-watched
    /// tickers are skipped. Auto items expire quickly (14 days).
    pub async fn auto_enrich_from_ranking(
        &self,
        ranker: &dyn StockRanker,
        min_score: f64,
        stocks_per_sector: usize,
        max_total: usize,
    ) -> Result<EnrichmentResult> {
        let mut ranked = ranker.top_ranked(min_score, max_total * 2).await?;
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        let existing: Vec<String> = self
            .get_watchlist(Some(WatchlistStatus::Watching), SortBy::Ticker)?
            .into_iter()
            .map(|i| i.ticker)
            .collect();

        let mut added = Vec::new();
        let mut skipped = 0;
        let mut sector_counts: HashMap<String, usize> = HashMap::new();

        for stock in ranked {
            if added.len() >= max_total {
                break;
            }
            let symbol = stock.symbol.to_uppercase();
            if existing.contains(&symbol) {
                skipped += 1;
                continue;
            }

            let sector = stock.sector.clone().unwrap_or_else(|| "General".to_string());
            let count = sector_counts.entry(sector.clone()).or_insert(0);
            if *count >= stocks_per_sector {
                skipped += 1;
                continue;
            }

            let priority = (5 + (stock.score as i64) / 2).min(10);
            match self
                .add_item(NewWatchlistItem {
                    ticker: symbol.clone(),
                    priority,
                    notes: Some(format!(
                        "[Auto-Ranked] score {:.1}, sector {sector}",
                        stock.score
                    )),
                    expires_in_days: 14,
                    ..Default::default()
                })
                .await
            {
                Ok(_) => {
                    *count += 1;
                    added.push(symbol);
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "auto-enrich insert failed");
                    skipped += 1;
                }
            }
        }

        info!(added = added.len(), skipped, "watchlist enriched from ranking");
        Ok(EnrichmentResult { added, skipped })
    }

    /// Summary counters for the control surface.
    pub fn get_summary(&self) -> Result<WatchlistSummary> {
        let all = self.get_watchlist(None, SortBy::Priority)?;
        let soon = Utc::now() + Duration::days(3);

        Ok(WatchlistSummary {
            total_items: all.len(),
            watching: all
                .iter()
                .filter(|i| i.status == WatchlistStatus::Watching)
                .count(),
            triggered: all
                .iter()
                .filter(|i| i.status == WatchlistStatus::Triggered)
                .count(),
            expired: all
                .iter()
                .filter(|i| i.status == WatchlistStatus::Expired)
                .count(),
            high_priority: all
                .iter()
                .filter(|i| i.status == WatchlistStatus::Watching && i.priority >= 8)
                .count(),
            expiring_soon: all
                .iter()
                .filter(|i| {
                    i.status == WatchlistStatus::Watching
                        && i.expires_at.map(|e| e <= soon).unwrap_or(false)
                })
                .count(),
        })
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    async fn latest_close(&self, ticker: &str) -> Option<f64> {
        let end = Utc::now().date_naive();
        let start = end - Duration::days(RECENT_WINDOW_DAYS);
        match self.provider.get_prices(ticker, start, end).await {
            Ok(bars) => bars.last().map(|b| b.close),
            Err(e) => {
                warn!(ticker, error = %e, "latest close unavailable");
                None
            }
        }
    }

    fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<WatchlistItem> {
        let parse = |v: Option<String>| {
            v.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc))
        };
        Ok(WatchlistItem {
            id: row.get(0)?,
            ticker: row.get(1)?,
            strategy: row.get(2)?,
            entry_target: row.get(3)?,
            entry_condition: EntryCondition::parse(&row.get::<_, String>(4)?),
            stop_loss: row.get(5)?,
            take_profit: row.get(6)?,
            position_size_pct: row.get(7)?,
            status: WatchlistStatus::parse(&row.get::<_, String>(8)?),
            priority: row.get(9)?,
            notes: row.get(10)?,
            created_at: parse(row.get(11)?),
            expires_at: parse(row.get(12)?),
            triggered_at: parse(row.get(13)?),
            triggered_price: row.get(14)?,
        })
    }
}

const SELECT_ITEM: &str = "SELECT id, ticker, strategy, entry_target, entry_condition, \
    stop_loss, take_profit, position_size_pct, status, priority, notes, created_at, \
    expires_at, triggered_at, triggered_price FROM watchlist";

impl std::fmt::Debug for WatchlistService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchlistService").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{bars_from_closes, FakePriceProvider};

    struct FixedRanker(Vec<RankedStock>);

    #[async_trait]
    impl StockRanker for FixedRanker {
        async fn top_ranked(&self, min_score: f64, _limit: usize) -> Result<Vec<RankedStock>> {
            Ok(self
                .0
                .iter()
                .filter(|s| s.score >= min_score)
                .cloned()
                .collect())
        }
    }

    fn service() -> (WatchlistService, Arc<FakePriceProvider>) {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let provider = Arc::new(FakePriceProvider::default());
        let engine = Arc::new(StrategyEngine::new(provider.clone(), None));
        (
            WatchlistService::new(store, provider.clone(), engine),
            provider,
        )
    }

    #[tokio::test]
    async fn add_item_defaults_from_latest_close() {
        let (svc, provider) = service();
        provider.set_bars("AAPL", bars_from_closes(&[100.0, 101.0, 102.0]));

        let item = svc
            .add_item(NewWatchlistItem {
                ticker: "aapl".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(item.ticker, "AAPL");
        assert_eq!(item.status, WatchlistStatus::Watching);
        // 2% below the latest close of 102.
        assert_eq!(item.entry_target, Some(99.96));
        assert_eq!(item.stop_loss, Some(round2(99.96 * 0.95)));
        assert_eq!(item.take_profit, Some(round2(99.96 * 1.10)));
        assert!(item.expires_at.is_some());
    }

    #[tokio::test]
    async fn below_trigger_fires_at_or_under_target() {
        let (svc, provider) = service();
        provider.set_bars("F", bars_from_closes(&[12.0, 11.0, 9.9]));

        svc.add_item(NewWatchlistItem {
            ticker: "F".to_string(),
            entry_target: Some(10.0),
            ..Default::default()
        })
        .await
        .unwrap();

        let fired = svc.check_triggers().await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].status, WatchlistStatus::Triggered);
        assert_eq!(fired[0].triggered_price, Some(9.9));
        assert!(fired[0].triggered_at.is_some());
    }

    #[tokio::test]
    async fn above_trigger_fires_at_or_over_target() {
        let (svc, provider) = service();
        provider.set_bars("AMD", bars_from_closes(&[98.0, 99.5, 100.4]));

        svc.add_item(NewWatchlistItem {
            ticker: "AMD".to_string(),
            entry_target: Some(100.0),
            entry_condition: EntryCondition::Above,
            ..Default::default()
        })
        .await
        .unwrap();

        let fired = svc.check_triggers().await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].triggered_price, Some(100.4));
    }

    #[tokio::test]
    async fn breakout_requires_close_above_prior_high() {
        let (svc, provider) = service();
        // 21 bars: 20-day high (excluding today) sits at ~105, today closes
        // above it.
        let mut closes: Vec<f64> = (0..20).map(|i| 100.0 + (i % 5) as f64).collect();
        closes.push(107.0);
        provider.set_bars("PLTR", bars_from_closes(&closes));

        svc.add_item(NewWatchlistItem {
            ticker: "PLTR".to_string(),
            entry_condition: EntryCondition::Breakout,
            ..Default::default()
        })
        .await
        .unwrap();

        let fired = svc.check_triggers().await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].triggered_price, Some(107.0));
    }

    #[tokio::test]
    async fn no_trigger_when_condition_unmet() {
        let (svc, provider) = service();
        provider.set_bars("F", bars_from_closes(&[12.0, 11.5, 11.0]));

        svc.add_item(NewWatchlistItem {
            ticker: "F".to_string(),
            entry_target: Some(10.0),
            ..Default::default()
        })
        .await
        .unwrap();

        assert!(svc.check_triggers().await.unwrap().is_empty());
        let items = svc.get_watchlist(Some(WatchlistStatus::Watching), SortBy::Priority).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn overdue_items_expire_on_next_pass() {
        let (svc, provider) = service();
        provider.set_bars("F", bars_from_closes(&[12.0, 11.5, 11.0]));

        let item = svc
            .add_item(NewWatchlistItem {
                ticker: "F".to_string(),
                entry_target: Some(10.0),
                expires_in_days: -1, // already overdue
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(svc.check_triggers().await.unwrap().is_empty());
        let refreshed = svc.get_item(item.id).unwrap().unwrap();
        assert_eq!(refreshed.status, WatchlistStatus::Expired);
    }

    #[tokio::test]
    async fn status_transitions_are_monotone() {
        let (svc, provider) = service();
        provider.set_bars("F", bars_from_closes(&[12.0, 11.0, 9.9]));

        let item = svc
            .add_item(NewWatchlistItem {
                ticker: "F".to_string(),
                entry_target: Some(10.0),
                ..Default::default()
            })
            .await
            .unwrap();

        svc.check_triggers().await.unwrap();

        // triggered → watching is rejected.
        let err = svc
            .update_item(
                item.id,
                WatchlistUpdate {
                    status: Some(WatchlistStatus::Watching),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, TradingError::PreconditionFailed(_)));

        // A second trigger pass does not re-fire a triggered item.
        assert!(svc.check_triggers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ranking_enrichment_caps_and_dedupes() {
        let (svc, provider) = service();
        for symbol in ["AAA", "BBB", "CCC", "DDD"] {
            provider.set_bars(symbol, bars_from_closes(&[50.0, 50.5, 51.0]));
        }
        // AAA already watched.
        svc.add_item(NewWatchlistItem {
            ticker: "AAA".to_string(),
            entry_target: Some(50.0),
            ..Default::default()
        })
        .await
        .unwrap();

        let ranker = FixedRanker(vec![
            RankedStock { symbol: "AAA".into(), score: 10.0, sector: Some("Tech".into()) },
            RankedStock { symbol: "BBB".into(), score: 9.0, sector: Some("Tech".into()) },
            RankedStock { symbol: "CCC".into(), score: 9.0, sector: Some("Tech".into()) },
            RankedStock { symbol: "DDD".into(), score: 8.0, sector: Some("Energy".into()) },
        ]);

        let result = svc
            .auto_enrich_from_ranking(&ranker, 8.0, 1, 10)
            .await
            .unwrap();

        // AAA deduped; Tech capped at 1 (BBB wins the tie by symbol); DDD fits.
        assert_eq!(result.added, vec!["BBB", "DDD"]);
        assert_eq!(result.skipped, 2);

        let summary = svc.get_summary().unwrap();
        assert_eq!(summary.watching, 3);
    }

    #[tokio::test]
    async fn summary_counts_by_status() {
        let (svc, provider) = service();
        provider.set_bars("F", bars_from_closes(&[12.0, 11.0, 9.9]));
        provider.set_bars("GM", bars_from_closes(&[40.0, 41.0, 42.0]));

        svc.add_item(NewWatchlistItem {
            ticker: "F".to_string(),
            entry_target: Some(10.0),
            priority: 9,
            ..Default::default()
        })
        .await
        .unwrap();
        svc.add_item(NewWatchlistItem {
            ticker: "GM".to_string(),
            entry_target: Some(30.0),
            ..Default::default()
        })
        .await
        .unwrap();

        svc.check_triggers().await.unwrap(); // F triggers, GM keeps watching

        let summary = svc.get_summary().unwrap();
        assert_eq!(summary.total_items, 2);
        assert_eq!(summary.triggered, 1);
        assert_eq!(summary.watching, 1);
    }
}
