// =============================================================================
// Durable Store — SQLite persistence for watchlist, tasks, trades, snapshots,
// heartbeats, and telemetry events
// =============================================================================
//
// One connection guarded by a mutex. Callers run closures against the
// connection synchronously; the lock is never held across an await point.
// Timestamps are persisted as RFC 3339 TEXT.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, TradingError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS watchlist (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker           TEXT NOT NULL,
    name             TEXT,
    sector           TEXT,
    strategy         TEXT,
    entry_target     REAL,
    entry_condition  TEXT NOT NULL DEFAULT 'below',
    stop_loss        REAL,
    take_profit      REAL,
    position_size_pct REAL NOT NULL DEFAULT 0.05,
    status           TEXT NOT NULL DEFAULT 'watching',
    priority         INTEGER NOT NULL DEFAULT 5,
    notes            TEXT,
    signals          TEXT,
    created_at       TEXT NOT NULL,
    expires_at       TEXT,
    triggered_at     TEXT,
    triggered_price  REAL
);

CREATE TABLE IF NOT EXISTS trade_history (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id             TEXT,
    client_order_id      TEXT,
    ticker               TEXT NOT NULL,
    action               TEXT NOT NULL,
    quantity             REAL NOT NULL,
    entry_price          REAL,
    exit_price           REAL,
    entry_time           TEXT,
    exit_time            TEXT,
    stop_loss_price      REAL,
    take_profit_price    REAL,
    strategy             TEXT,
    status               TEXT NOT NULL DEFAULT 'pending',
    realized_pnl         REAL,
    return_pct           REAL,
    holding_period_hours REAL,
    fractionable         INTEGER NOT NULL DEFAULT 1,
    notes                TEXT,
    created_at           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trade_history_ticker ON trade_history (ticker);
CREATE INDEX IF NOT EXISTS idx_trade_history_order ON trade_history (order_id);

CREATE TABLE IF NOT EXISTS decision_context (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_id             INTEGER NOT NULL,
    ticker               TEXT NOT NULL,
    trigger_source       TEXT,
    strategy_name        TEXT,
    strategy_signal      TEXT,
    strategy_confidence  REAL,
    strategy_reasoning   TEXT,
    research_sentiment   TEXT,
    research_confidence  REAL,
    research_summary     TEXT,
    agent_signals        TEXT,
    bullish_count        INTEGER NOT NULL DEFAULT 0,
    bearish_count        INTEGER NOT NULL DEFAULT 0,
    neutral_count        INTEGER NOT NULL DEFAULT 0,
    consensus_direction  TEXT,
    consensus_confidence REAL,
    portfolio_equity     REAL,
    portfolio_cash       REAL,
    pm_action            TEXT,
    pm_quantity          REAL,
    pm_confidence        REAL,
    pm_reasoning         TEXT,
    pm_stop_loss_pct     REAL,
    pm_take_profit_pct   REAL,
    actual_return        REAL,
    was_profitable       INTEGER,
    outcome_notes        TEXT,
    created_at           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_decision_context_trade ON decision_context (trade_id);

CREATE TABLE IF NOT EXISTS scheduled_tasks (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    name             TEXT NOT NULL,
    task_type        TEXT NOT NULL,
    schedule_kind    TEXT NOT NULL,
    hour             INTEGER,
    minute           INTEGER,
    interval_minutes INTEGER,
    next_run         TEXT,
    last_run         TEXT,
    run_count        INTEGER NOT NULL DEFAULT 0,
    success_count    INTEGER NOT NULL DEFAULT 0,
    failure_count    INTEGER NOT NULL DEFAULT 0,
    is_enabled       INTEGER NOT NULL DEFAULT 1,
    max_retries      INTEGER NOT NULL DEFAULT 3,
    parameters       TEXT
);

CREATE TABLE IF NOT EXISTS daily_snapshots (
    date              TEXT PRIMARY KEY,
    starting_equity   REAL NOT NULL,
    ending_equity     REAL NOT NULL,
    realized_pnl      REAL NOT NULL,
    unrealized_pnl    REAL NOT NULL,
    total_pnl         REAL NOT NULL,
    return_pct        REAL NOT NULL,
    trades_count      INTEGER NOT NULL,
    winning_trades    INTEGER NOT NULL,
    losing_trades     INTEGER NOT NULL,
    biggest_winner    REAL,
    biggest_winner_ticker TEXT,
    biggest_loser     REAL,
    biggest_loser_ticker TEXT,
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scheduler_heartbeats (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    scheduler_id TEXT NOT NULL,
    hostname     TEXT,
    jobs_pending INTEGER NOT NULL DEFAULT 0,
    jobs_running INTEGER NOT NULL DEFAULT 0,
    timestamp    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_heartbeats_ts ON scheduler_heartbeats (timestamp);

CREATE TABLE IF NOT EXISTS agent_performance (
    agent_name               TEXT PRIMARY KEY,
    total_signals            INTEGER NOT NULL DEFAULT 0,
    bullish_signals          INTEGER NOT NULL DEFAULT 0,
    bearish_signals          INTEGER NOT NULL DEFAULT 0,
    neutral_signals          INTEGER NOT NULL DEFAULT 0,
    correct_predictions      INTEGER NOT NULL DEFAULT 0,
    incorrect_predictions    INTEGER NOT NULL DEFAULT 0,
    accuracy_rate            REAL,
    trades_following_signal  INTEGER NOT NULL DEFAULT 0,
    total_return_when_followed REAL NOT NULL DEFAULT 0,
    best_call_return         REAL,
    best_call_ticker         TEXT,
    worst_call_return        REAL,
    worst_call_ticker        TEXT,
    last_signal_at           TEXT,
    last_accuracy_update     TEXT
);

CREATE TABLE IF NOT EXISTS telemetry_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    kind        TEXT NOT NULL,
    workflow_id TEXT,
    timestamp   TEXT NOT NULL,
    payload     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_kind_ts ON telemetry_events (kind, timestamp);

CREATE TABLE IF NOT EXISTS control (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// SQLite-backed durable store shared by every persistent component.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at `path`. `":memory:"` opens an in-memory
    /// database, used by tests.
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch(SCHEMA)?;
        info!(path, "durable store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` against the connection. The lock is held only for the
    /// duration of the closure; callers must not await inside it.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(TradingError::from)
    }

    /// Cheap liveness probe for health checks.
    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |_| Ok(())))
    }

    // -------------------------------------------------------------------------
    // Scheduler heartbeats
    // -------------------------------------------------------------------------

    /// Persist one scheduler heartbeat.
    pub fn record_heartbeat(
        &self,
        scheduler_id: &str,
        hostname: &str,
        jobs_pending: usize,
        jobs_running: usize,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scheduler_heartbeats \
                 (scheduler_id, hostname, jobs_pending, jobs_running, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    scheduler_id,
                    hostname,
                    jobs_pending as i64,
                    jobs_running as i64,
                    at.to_rfc3339(),
                ],
            )?;
            // Keep the table from growing without bound.
            conn.execute(
                "DELETE FROM scheduler_heartbeats WHERE id NOT IN \
                 (SELECT id FROM scheduler_heartbeats ORDER BY id DESC LIMIT 10000)",
                [],
            )?;
            Ok(())
        })
    }

    /// Most recent heartbeat timestamp, if any was ever recorded.
    pub fn last_heartbeat(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp FROM scheduler_heartbeats ORDER BY id DESC LIMIT 1",
            )?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => {
                    let ts: String = row.get(0)?;
                    Ok(DateTime::parse_from_rfc3339(&ts)
                        .ok()
                        .map(|t| t.with_timezone(&Utc)))
                }
                None => Ok(None),
            }
        })
    }

    // -------------------------------------------------------------------------
    // Control flags (CLI <-> running service)
    // -------------------------------------------------------------------------

    pub fn set_control_flag(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO control (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                rusqlite::params![key, value],
            )?;
            Ok(())
        })
    }

    pub fn control_flag(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT value FROM control WHERE key = ?1")?;
            let mut rows = stmt.query(rusqlite::params![key])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get(0)?)),
                None => Ok(None),
            }
        })
    }

    /// True when a `stop` command has requested shutdown.
    pub fn shutdown_requested(&self) -> bool {
        matches!(
            self.control_flag("shutdown_requested"),
            Ok(Some(v)) if v == "1"
        )
    }

    pub fn request_shutdown(&self) -> Result<()> {
        self.set_control_flag("shutdown_requested", "1")
    }

    pub fn clear_shutdown_request(&self) -> Result<()> {
        self.set_control_flag("shutdown_requested", "0")
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_and_ping() {
        let store = Store::open(":memory:").unwrap();
        store.ping().unwrap();
    }

    #[test]
    fn heartbeat_roundtrip() {
        let store = Store::open(":memory:").unwrap();
        assert!(store.last_heartbeat().unwrap().is_none());

        let now = Utc::now();
        store
            .record_heartbeat("sched-1", "host-a", 2, 1, now)
            .unwrap();

        let last = store.last_heartbeat().unwrap().unwrap();
        assert!((last - now).num_seconds().abs() <= 1);
    }

    #[test]
    fn latest_heartbeat_wins() {
        let store = Store::open(":memory:").unwrap();
        let earlier = Utc::now() - chrono::Duration::minutes(30);
        let later = Utc::now();
        store.record_heartbeat("s", "h", 0, 0, earlier).unwrap();
        store.record_heartbeat("s", "h", 0, 0, later).unwrap();

        let last = store.last_heartbeat().unwrap().unwrap();
        assert!((last - later).num_seconds().abs() <= 1);
    }

    #[test]
    fn control_flags() {
        let store = Store::open(":memory:").unwrap();
        assert!(!store.shutdown_requested());
        store.request_shutdown().unwrap();
        assert!(store.shutdown_requested());
        store.clear_shutdown_request().unwrap();
        assert!(!store.shutdown_requested());
    }
}
