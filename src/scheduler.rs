// =============================================================================
// Scheduler — cron and interval jobs in the exchange timezone
// =============================================================================
//
// A single loop wakes every tick, emits a heartbeat, and dispatches due jobs
// onto the runtime. Jobs are isolated at the JoinHandle boundary: a panic
// records a failed workflow event and the loop continues. Failed jobs retry
// with exponential backoff (1m, 2m, 4m) up to max_retries.
//
// Missed fires while the process was down are dropped: on start, next_run is
// recomputed from the current wall clock.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use rusqlite::params;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::cycle::{CycleOptions, TradingCycle};
use crate::error::{Result, TradingError};
use crate::monitor::PositionMonitor;
use crate::performance::PerformanceTracker;
use crate::store::Store;
use crate::telemetry::events::EventLogger;
use crate::telemetry::health::HealthChecker;
use crate::watchlist::{StockRanker, WatchlistService};

/// Loop wake interval.
const TICK_SECONDS: u64 = 30;

/// Base backoff for job retries.
const RETRY_BASE_SECONDS: u64 = 60;

// -----------------------------------------------------------------------------
// Task model
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    TradingCycle,
    PositionMonitor,
    WatchlistCheck,
    HealthCheck,
    MomentumScan,
    DiversificationScan,
    StopLossReview,
    PerformanceSnapshot,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TradingCycle => "trading_cycle",
            Self::PositionMonitor => "position_monitor",
            Self::WatchlistCheck => "watchlist_check",
            Self::HealthCheck => "health_check",
            Self::MomentumScan => "momentum_scan",
            Self::DiversificationScan => "diversification_scan",
            Self::StopLossReview => "stop_loss_review",
            Self::PerformanceSnapshot => "performance_snapshot",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trading_cycle" => Some(Self::TradingCycle),
            "position_monitor" => Some(Self::PositionMonitor),
            "watchlist_check" => Some(Self::WatchlistCheck),
            "health_check" => Some(Self::HealthCheck),
            "momentum_scan" => Some(Self::MomentumScan),
            "diversification_scan" => Some(Self::DiversificationScan),
            "stop_loss_review" => Some(Self::StopLossReview),
            "performance_snapshot" => Some(Self::PerformanceSnapshot),
            _ => None,
        }
    }
}

/// When a task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Schedule {
    /// Daily at hour:minute in the exchange timezone.
    Cron { hour: u32, minute: u32 },
    /// Every N minutes.
    Interval { minutes: i64 },
}

/// One registered job.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTask {
    pub id: i64,
    pub name: String,
    pub task_type: TaskType,
    pub schedule: Schedule,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub is_enabled: bool,
    pub max_retries: u32,
    pub parameters: Value,
}

/// Next wall-clock fire strictly after `now` for an hour:minute schedule in
/// `tz`. Skips nonexistent local times (DST spring-forward) to the next day.
pub fn next_cron_fire(now: DateTime<Utc>, tz: Tz, hour: u32, minute: u32) -> DateTime<Utc> {
    let local_now = now.with_timezone(&tz);
    let mut date = local_now.date_naive();

    for _ in 0..4 {
        if let Some(candidate) = tz
            .with_ymd_and_hms(date.year(), date.month(), date.day(), hour, minute, 0)
            .earliest()
        {
            let utc = candidate.with_timezone(&Utc);
            if utc > now {
                return utc;
            }
        }
        date += ChronoDuration::days(1);
    }
    // Unreachable for valid hour/minute; fall back to a day out.
    now + ChronoDuration::days(1)
}

fn next_fire(schedule: Schedule, now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    match schedule {
        Schedule::Cron { hour, minute } => next_cron_fire(now, tz, hour, minute),
        Schedule::Interval { minutes } => now + ChronoDuration::minutes(minutes),
    }
}

// -----------------------------------------------------------------------------
// Job context
// -----------------------------------------------------------------------------

/// Everything a job can touch, passed down from the composition root so the
/// scheduler carries no back-pointers.
pub struct JobContext {
    pub cycle: Arc<TradingCycle>,
    pub monitor: Arc<PositionMonitor>,
    pub watchlist: Arc<WatchlistService>,
    pub health: Arc<HealthChecker>,
    pub performance: Arc<PerformanceTracker>,
    pub ranker: Option<Arc<dyn StockRanker>>,
}

impl JobContext {
    /// Execute one task. Job-level errors come back as `Err`; a cycle that
    /// is already running is a deferral, not a failure.
    pub async fn run(&self, task_type: TaskType, parameters: &Value) -> Result<()> {
        match task_type {
            TaskType::TradingCycle | TaskType::MomentumScan => {
                match self.cycle.run_trading_cycle(CycleOptions::default()).await {
                    Ok(_) => Ok(()),
                    Err(TradingError::Conflict) => {
                        info!(task = task_type.as_str(), "cycle already running — deferred");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            TaskType::PositionMonitor | TaskType::StopLossReview => {
                self.monitor.check_positions().await.map(|_| ())
            }
            TaskType::WatchlistCheck => self.watchlist.check_triggers().await.map(|_| ()),
            TaskType::HealthCheck => {
                let pre_market = parameters
                    .get("pre_market")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if pre_market {
                    self.health.run_pre_market_check().await;
                } else {
                    self.health.run_continuous_check().await;
                }
                Ok(())
            }
            TaskType::DiversificationScan => match &self.ranker {
                Some(ranker) => self
                    .watchlist
                    .auto_enrich_from_ranking(ranker.as_ref(), 8.0, 2, 10)
                    .await
                    .map(|_| ()),
                None => {
                    info!("no stock ranker configured — diversification scan skipped");
                    Ok(())
                }
            },
            TaskType::PerformanceSnapshot => {
                self.performance.create_daily_snapshot().await.map(|_| ())
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Scheduler
// -----------------------------------------------------------------------------

pub struct TradingScheduler {
    store: Arc<Store>,
    events: Arc<EventLogger>,
    jobs: Arc<JobContext>,
    tz: Tz,
    scheduler_id: String,
    hostname: String,
    default_max_retries: u32,
    registry: Mutex<HashMap<i64, ScheduledTask>>,
    running: AtomicBool,
    jobs_running: Arc<AtomicUsize>,
}

impl TradingScheduler {
    pub fn new(
        store: Arc<Store>,
        events: Arc<EventLogger>,
        jobs: Arc<JobContext>,
        tz: Tz,
        default_max_retries: u32,
    ) -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        Self {
            store,
            events,
            jobs,
            tz,
            scheduler_id: format!("helios-{}", uuid::Uuid::new_v4()),
            hostname,
            default_max_retries,
            registry: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            jobs_running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        info!("scheduler stopping");
        self.running.store(false, Ordering::SeqCst);
    }

    // -------------------------------------------------------------------------
    // Task management
    // -------------------------------------------------------------------------

    pub fn add_cron_task(
        &self,
        task_type: TaskType,
        name: &str,
        hour: u32,
        minute: u32,
        parameters: Option<Value>,
    ) -> Result<i64> {
        self.add_task(task_type, name, Schedule::Cron { hour, minute }, parameters)
    }

    pub fn add_interval_task(
        &self,
        task_type: TaskType,
        name: &str,
        minutes: i64,
        parameters: Option<Value>,
    ) -> Result<i64> {
        self.add_task(task_type, name, Schedule::Interval { minutes }, parameters)
    }

    fn add_task(
        &self,
        task_type: TaskType,
        name: &str,
        schedule: Schedule,
        parameters: Option<Value>,
    ) -> Result<i64> {
        let now = Utc::now();
        let next_run = next_fire(schedule, now, self.tz);
        let parameters = parameters.unwrap_or_else(|| json!({}));

        let (kind, hour, minute, interval) = match schedule {
            Schedule::Cron { hour, minute } => ("cron", Some(hour), Some(minute), None),
            Schedule::Interval { minutes } => ("interval", None, None, Some(minutes)),
        };

        let id = self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scheduled_tasks \
                 (name, task_type, schedule_kind, hour, minute, interval_minutes, next_run, \
                  is_enabled, max_retries, parameters) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9)",
                params![
                    name,
                    task_type.as_str(),
                    kind,
                    hour,
                    minute,
                    interval,
                    next_run.to_rfc3339(),
                    self.default_max_retries,
                    parameters.to_string(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        let task = ScheduledTask {
            id,
            name: name.to_string(),
            task_type,
            schedule,
            next_run,
            last_run: None,
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            is_enabled: true,
            max_retries: self.default_max_retries,
            parameters,
        };
        info!(task = %task.name, next_run = %task.next_run, "task scheduled");
        self.registry.lock().insert(id, task);
        Ok(id)
    }

    pub fn remove_task(&self, id: i64) -> Result<bool> {
        let deleted = self.store.with_conn(|conn| {
            conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])
        })?;
        self.registry.lock().remove(&id);
        Ok(deleted > 0)
    }

    /// All registered tasks, soonest first.
    pub fn get_scheduled_tasks(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self.registry.lock().values().cloned().collect();
        tasks.sort_by_key(|t| t.next_run);
        tasks
    }

    /// Recent run history derived from task counters.
    pub fn get_task_history(&self, limit: usize) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self
            .registry
            .lock()
            .values()
            .filter(|t| t.last_run.is_some())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| std::cmp::Reverse(t.last_run));
        tasks.truncate(limit);
        tasks
    }

    /// Install the standard daily schedule (exchange time). Idempotent by
    /// task name.
    pub fn add_default_schedule(
        &self,
        position_monitor_minutes: i64,
        trading_cycle_minutes: i64,
    ) -> Result<()> {
        let existing: Vec<String> = self
            .registry
            .lock()
            .values()
            .map(|t| t.name.clone())
            .collect();
        let mut add_cron = |task_type, name: &str, hour, minute, params| -> Result<()> {
            if !existing.iter().any(|n| n == name) {
                self.add_cron_task(task_type, name, hour, minute, params)?;
            }
            Ok(())
        };

        add_cron(TaskType::HealthCheck, "pre_market_health_check", 6, 30, Some(json!({"pre_market": true})))?;
        add_cron(TaskType::MomentumScan, "market_open_momentum_scan", 9, 35, None)?;
        add_cron(TaskType::DiversificationScan, "diversification_scan", 10, 0, None)?;
        add_cron(TaskType::StopLossReview, "midday_stop_loss_review", 12, 0, None)?;
        add_cron(TaskType::HealthCheck, "afternoon_health_check", 14, 0, Some(json!({"pre_market": false})))?;
        add_cron(TaskType::WatchlistCheck, "pre_close_watchlist_monitor", 15, 30, None)?;
        add_cron(TaskType::PerformanceSnapshot, "daily_performance_snapshot", 16, 5, None)?;

        if !existing.iter().any(|n| n == "position_monitor") {
            self.add_interval_task(
                TaskType::PositionMonitor,
                "position_monitor",
                position_monitor_minutes,
                None,
            )?;
        }
        if !existing.iter().any(|n| n == "trading_cycle") {
            self.add_interval_task(
                TaskType::TradingCycle,
                "trading_cycle",
                trading_cycle_minutes,
                None,
            )?;
        }
        Ok(())
    }

    /// Load persisted tasks, recomputing next_run from now (missed fires are
    /// dropped, never replayed).
    pub fn load_tasks(&self) -> Result<usize> {
        let now = Utc::now();
        let tz = self.tz;
        let rows: Vec<ScheduledTask> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, task_type, schedule_kind, hour, minute, interval_minutes, \
                 run_count, success_count, failure_count, is_enabled, max_retries, parameters \
                 FROM scheduled_tasks",
            )?;
            let rows = stmt.query_map([], |row| {
                let task_type_str: String = row.get(2)?;
                let kind: String = row.get(3)?;
                let schedule = if kind == "cron" {
                    Schedule::Cron {
                        hour: row.get::<_, Option<i64>>(4)?.unwrap_or(0) as u32,
                        minute: row.get::<_, Option<i64>>(5)?.unwrap_or(0) as u32,
                    }
                } else {
                    Schedule::Interval {
                        minutes: row.get::<_, Option<i64>>(6)?.unwrap_or(30),
                    }
                };
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    task_type_str,
                    schedule,
                    row.get::<_, i64>(7)? as u64,
                    row.get::<_, i64>(8)? as u64,
                    row.get::<_, i64>(9)? as u64,
                    row.get::<_, i64>(10)? != 0,
                    row.get::<_, i64>(11)? as u32,
                    row.get::<_, Option<String>>(12)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map(|list| {
                list.into_iter()
                    .filter_map(
                        |(id, name, type_str, schedule, runs, ok, failed, enabled, retries, params)| {
                            let task_type = TaskType::parse(&type_str)?;
                            Some(ScheduledTask {
                                id,
                                name,
                                task_type,
                                schedule,
                                next_run: next_fire(schedule, now, tz),
                                last_run: None,
                                run_count: runs,
                                success_count: ok,
                                failure_count: failed,
                                is_enabled: enabled,
                                max_retries: retries,
                                parameters: params
                                    .and_then(|p| serde_json::from_str(&p).ok())
                                    .unwrap_or_else(|| json!({})),
                            })
                        },
                    )
                    .collect::<Vec<_>>()
            })
        })?;

        let count = rows.len();
        let mut registry = self.registry.lock();
        for task in rows {
            registry.insert(task.id, task);
        }
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Loop
    // -------------------------------------------------------------------------

    /// Start the scheduler loop. Returns immediately; the loop runs until
    /// `stop()` or a store-level shutdown request.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler already running");
            return;
        }
        info!(scheduler_id = %self.scheduler_id, tz = %self.tz, "scheduler started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(TICK_SECONDS));
            loop {
                ticker.tick().await;
                if !self.is_running() {
                    break;
                }
                if self.store.shutdown_requested() {
                    info!("shutdown requested through the control store");
                    self.stop();
                    break;
                }
                Self::tick(&self, Utc::now());
            }
            info!("scheduler loop exited");
        });
    }

    /// One scheduler tick: heartbeat, then dispatch due tasks.
    fn tick(this: &Arc<Self>, now: DateTime<Utc>) {
        let due = this.collect_due(now);
        let pending = due.len();
        let running_jobs = this.jobs_running.load(Ordering::SeqCst);

        this.heartbeat(pending, running_jobs);

        for task in due {
            Self::dispatch(this, task);
        }
    }

    /// Emit one heartbeat to the store and the event log.
    pub fn heartbeat(&self, jobs_pending: usize, jobs_running: usize) {
        if let Err(e) = self.store.record_heartbeat(
            &self.scheduler_id,
            &self.hostname,
            jobs_pending,
            jobs_running,
            Utc::now(),
        ) {
            warn!(error = %e, "heartbeat persist failed");
        }
        self.events
            .log_heartbeat(&self.scheduler_id, &self.hostname, jobs_pending, jobs_running);
    }

    /// Pop due tasks and advance their next_run. The registry lock is never
    /// held across an await.
    fn collect_due(&self, now: DateTime<Utc>) -> Vec<ScheduledTask> {
        let mut due = Vec::new();
        let mut registry = self.registry.lock();
        for task in registry.values_mut() {
            if task.is_enabled && task.next_run <= now {
                due.push(task.clone());
                task.next_run = next_fire(task.schedule, now, self.tz);
                task.last_run = Some(now);
                task.run_count += 1;
            }
        }
        due
    }

    /// Run one task on the runtime with retry/backoff and panic isolation.
    fn dispatch(this: &Arc<Self>, task: ScheduledTask) {
        let scheduler = Arc::clone(this);
        let jobs = Arc::clone(&this.jobs);
        let counter = Arc::clone(&this.jobs_running);

        counter.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            let outcome = loop {
                // Panic isolation: the job runs in its own task; a panic
                // surfaces as a JoinError rather than killing the loop.
                let jobs_inner = Arc::clone(&jobs);
                let task_type = task.task_type;
                let parameters = task.parameters.clone();
                let handle = tokio::spawn(async move {
                    jobs_inner.run(task_type, &parameters).await
                });

                let result = match handle.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(join_err) => Err(format!("job panicked: {join_err}")),
                };

                match result {
                    Ok(()) => break Ok(()),
                    Err(message) if attempt < task.max_retries => {
                        let backoff = RETRY_BASE_SECONDS * 2u64.pow(attempt);
                        warn!(
                            task = %task.name,
                            attempt = attempt + 1,
                            backoff_secs = backoff,
                            error = %message,
                            "job failed — retrying"
                        );
                        attempt += 1;
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                    }
                    Err(message) => break Err(message),
                }
            };

            counter.fetch_sub(1, Ordering::SeqCst);
            scheduler.record_outcome(&task, outcome);
        });
    }

    fn record_outcome(&self, task: &ScheduledTask, outcome: std::result::Result<(), String>) {
        let success = outcome.is_ok();
        {
            let mut registry = self.registry.lock();
            if let Some(entry) = registry.get_mut(&task.id) {
                if success {
                    entry.success_count += 1;
                } else {
                    entry.failure_count += 1;
                }
            }
        }

        let column = if success { "success_count" } else { "failure_count" };
        let update = format!(
            "UPDATE scheduled_tasks SET run_count = run_count + 1, {column} = {column} + 1, \
             last_run = ?2 WHERE id = ?1"
        );
        if let Err(e) = self.store.with_conn(|conn| {
            conn.execute(&update, params![task.id, Utc::now().to_rfc3339()])?;
            Ok(())
        }) {
            warn!(error = %e, "task counters persist failed");
        }

        match outcome {
            Ok(()) => info!(task = %task.name, "job completed"),
            Err(message) => {
                error!(task = %task.name, error = %message, "job failed after retries");
                let wf = self
                    .events
                    .start_workflow("scheduled_task", std::slice::from_ref(&task.name));
                self.events.fail_workflow(&wf, &message);
            }
        }
    }
}

impl std::fmt::Debug for TradingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingScheduler")
            .field("scheduler_id", &self.scheduler_id)
            .field("running", &self.is_running())
            .field("tasks", &self.registry.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::config::Settings;
    use crate::cycle::{CycleDeps, TradingCycle};
    use crate::cycle::collaborators::SignalFollowDecision;
    use crate::history::TradeHistoryService;
    use crate::risk::RiskEngine;
    use crate::strategy::StrategyEngine;
    use crate::telemetry::alerts::AlertManager;
    use crate::testutil::{FakeBroker, FakePriceProvider, FakeResearch};
    use chrono_tz::America::New_York;

    fn build_scheduler() -> (Arc<TradingScheduler>, Arc<Store>) {
        let settings = Settings::for_tests();
        let store = Arc::new(Store::open(":memory:").unwrap());
        let events = Arc::new(EventLogger::new(None));
        let alerts = Arc::new(AlertManager::new(Arc::clone(&events)));
        let broker: Arc<FakeBroker> = Arc::new(FakeBroker::with_equity(50_000.0));
        let provider = Arc::new(FakePriceProvider::default());
        let history = Arc::new(TradeHistoryService::new(Arc::clone(&store)));
        let engine = Arc::new(StrategyEngine::new(provider.clone(), None));
        let watchlist = Arc::new(WatchlistService::new(
            Arc::clone(&store),
            provider,
            Arc::clone(&engine),
        ));
        let monitor = Arc::new(PositionMonitor::new(
            broker.clone(),
            Arc::clone(&history),
            Arc::clone(&events),
            Arc::clone(&alerts),
            0.05,
            0.10,
        ));
        let health = Arc::new(HealthChecker::new(
            broker.clone() as Arc<dyn Broker>,
            Arc::clone(&store),
            Arc::clone(&alerts),
            settings.clone(),
        ));
        let performance = Arc::new(PerformanceTracker::new(
            broker.clone(),
            Arc::clone(&history),
            Arc::clone(&store),
            New_York,
        ));
        let cycle = Arc::new(TradingCycle::new(CycleDeps {
            broker,
            engine,
            research: Arc::new(FakeResearch::success_bullish()),
            decision: Arc::new(SignalFollowDecision),
            history,
            watchlist: Arc::clone(&watchlist),
            monitor: Arc::clone(&monitor),
            risk: Arc::new(RiskEngine::new(&settings)),
            events: Arc::clone(&events),
            settings,
        }));

        let jobs = Arc::new(JobContext {
            cycle,
            monitor,
            watchlist,
            health,
            performance,
            ranker: None,
        });

        let scheduler = Arc::new(TradingScheduler::new(
            Arc::clone(&store),
            events,
            jobs,
            New_York,
            3,
        ));
        (scheduler, store)
    }

    // ---- cron math --------------------------------------------------------

    #[test]
    fn cron_fires_later_today_when_time_remains() {
        // 2025-03-03 13:00 ET == 18:00 UTC (EST, UTC-5).
        let now = Utc.with_ymd_and_hms(2025, 3, 3, 18, 0, 0).unwrap();
        let fire = next_cron_fire(now, New_York, 16, 5);
        assert_eq!(fire, Utc.with_ymd_and_hms(2025, 3, 3, 21, 5, 0).unwrap());
    }

    #[test]
    fn cron_rolls_to_tomorrow_when_time_passed() {
        let now = Utc.with_ymd_and_hms(2025, 3, 3, 18, 0, 0).unwrap();
        let fire = next_cron_fire(now, New_York, 9, 35);
        assert_eq!(fire, Utc.with_ymd_and_hms(2025, 3, 4, 14, 35, 0).unwrap());
    }

    #[test]
    fn cron_is_strictly_after_now() {
        let now = Utc.with_ymd_and_hms(2025, 3, 3, 21, 5, 0).unwrap(); // exactly 16:05 ET
        let fire = next_cron_fire(now, New_York, 16, 5);
        assert_eq!(fire, Utc.with_ymd_and_hms(2025, 3, 4, 21, 5, 0).unwrap());
    }

    // ---- registry ---------------------------------------------------------

    #[tokio::test]
    async fn default_schedule_registers_nine_tasks() {
        let (scheduler, _) = build_scheduler();
        scheduler.add_default_schedule(5, 30).unwrap();
        let tasks = scheduler.get_scheduled_tasks();
        assert_eq!(tasks.len(), 9);

        // Re-applying is idempotent by name.
        scheduler.add_default_schedule(5, 30).unwrap();
        assert_eq!(scheduler.get_scheduled_tasks().len(), 9);

        let intervals = tasks
            .iter()
            .filter(|t| matches!(t.schedule, Schedule::Interval { .. }))
            .count();
        assert_eq!(intervals, 2);
    }

    #[tokio::test]
    async fn tasks_persist_and_reload_with_fresh_next_run() {
        let (scheduler, store) = build_scheduler();
        scheduler
            .add_cron_task(TaskType::HealthCheck, "hc", 6, 30, None)
            .unwrap();
        scheduler
            .add_interval_task(TaskType::PositionMonitor, "pm", 5, None)
            .unwrap();

        // A second scheduler over the same store sees both tasks with
        // next_run strictly in the future (missed fires dropped).
        let events = Arc::new(EventLogger::new(None));
        let reloaded = Arc::new(TradingScheduler::new(
            store,
            events,
            Arc::clone(&scheduler.jobs),
            New_York,
            3,
        ));
        assert_eq!(reloaded.load_tasks().unwrap(), 2);

        let now = Utc::now();
        for task in reloaded.get_scheduled_tasks() {
            assert!(task.next_run > now, "{} not in the future", task.name);
        }
    }

    #[tokio::test]
    async fn remove_task_clears_registry_and_store() {
        let (scheduler, _) = build_scheduler();
        let id = scheduler
            .add_interval_task(TaskType::WatchlistCheck, "wl", 5, None)
            .unwrap();
        assert_eq!(scheduler.get_scheduled_tasks().len(), 1);
        assert!(scheduler.remove_task(id).unwrap());
        assert!(scheduler.get_scheduled_tasks().is_empty());
        assert!(!scheduler.remove_task(id).unwrap());
    }

    #[tokio::test]
    async fn collect_due_advances_next_run() {
        let (scheduler, _) = build_scheduler();
        scheduler
            .add_interval_task(TaskType::WatchlistCheck, "wl", 5, None)
            .unwrap();

        // Nothing due yet.
        assert!(scheduler.collect_due(Utc::now()).is_empty());

        // Jump past the fire time: exactly one fire, then next_run advances.
        let later = Utc::now() + ChronoDuration::minutes(6);
        let due = scheduler.collect_due(later);
        assert_eq!(due.len(), 1);
        assert!(scheduler.collect_due(later).is_empty());

        let task = &scheduler.get_scheduled_tasks()[0];
        assert!(task.next_run > later);
        assert_eq!(task.run_count, 1);
    }

    #[tokio::test]
    async fn heartbeat_recorded_in_store_and_events() {
        let (scheduler, store) = build_scheduler();
        scheduler.heartbeat(2, 1);

        let last = store.last_heartbeat().unwrap();
        assert!(last.is_some());

        let events = scheduler
            .events
            .fallback_events(Some("scheduler_heartbeats"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["jobs_pending"], 2);
        assert_eq!(events[0].payload["jobs_running"], 1);
    }
}
