// =============================================================================
// Event Logger — append-only workflow/step/decision/trade/heartbeat records
// =============================================================================
//
// Events are written to the durable store's telemetry table when one is
// attached; any persistence failure (or the absence of a store) falls back
// to a bounded in-memory buffer capped at MAX_FALLBACK_EVENTS, oldest
// dropped. Telemetry never propagates errors into trading paths.
//
// Every workflow gets a generated UUID; steps carry a monotonically
// increasing step_index and auto-emit started/completed/failed with
// duration_ms.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::Store;

/// Cap on the in-memory fallback buffer.
pub const MAX_FALLBACK_EVENTS: usize = 10_000;

/// One recorded telemetry event.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub kind: String,
    pub workflow_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// Context for one workflow execution.
pub struct WorkflowContext {
    pub workflow_id: Uuid,
    pub workflow_type: String,
    pub started_at: DateTime<Utc>,
    started: Instant,
    step_index: AtomicU32,
}

impl WorkflowContext {
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn next_step_index(&self) -> u32 {
        self.step_index.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Guard for one workflow step. Logs `started` on creation; call
/// [`StepGuard::complete`] or [`StepGuard::fail`] to close it out.
pub struct StepGuard<'a> {
    logger: &'a EventLogger,
    workflow_id: Uuid,
    workflow_type: String,
    step_name: String,
    step_index: u32,
    ticker: Option<String>,
    started: Instant,
}

impl StepGuard<'_> {
    pub fn complete(self, payload: Value) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        self.logger.log_workflow_event(
            self.workflow_id,
            &self.workflow_type,
            &self.step_name,
            "completed",
            Some(self.step_index),
            Some(duration_ms),
            self.ticker.as_deref(),
            None,
            payload,
        );
    }

    pub fn fail(self, error: &str) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        self.logger.log_workflow_event(
            self.workflow_id,
            &self.workflow_type,
            &self.step_name,
            "failed",
            Some(self.step_index),
            Some(duration_ms),
            self.ticker.as_deref(),
            Some(error),
            Value::Null,
        );
    }
}

/// Central logger for all trading events.
pub struct EventLogger {
    store: Option<Arc<Store>>,
    fallback: Mutex<VecDeque<StoredEvent>>,
}

impl EventLogger {
    pub fn new(store: Option<Arc<Store>>) -> Self {
        if store.is_none() {
            debug!("event logger running with in-memory buffer only");
        }
        Self {
            store,
            fallback: Mutex::new(VecDeque::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Core write path
    // -------------------------------------------------------------------------

    fn store_event(&self, kind: &str, workflow_id: Option<Uuid>, payload: Value) {
        let event = StoredEvent {
            kind: kind.to_string(),
            workflow_id,
            timestamp: Utc::now(),
            payload,
        };

        if let Some(store) = &self.store {
            let result = store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO telemetry_events (kind, workflow_id, timestamp, payload) \
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        event.kind,
                        event.workflow_id.map(|id| id.to_string()),
                        event.timestamp.to_rfc3339(),
                        event.payload.to_string(),
                    ],
                )?;
                Ok(())
            });
            match result {
                Ok(()) => return,
                Err(e) => warn!(kind, error = %e, "event persist failed — buffering in memory"),
            }
        }

        let mut fallback = self.fallback.lock();
        fallback.push_back(event);
        while fallback.len() > MAX_FALLBACK_EVENTS {
            fallback.pop_front();
        }
    }

    // -------------------------------------------------------------------------
    // Workflows and steps
    // -------------------------------------------------------------------------

    /// Begin a workflow. Emits `workflow_start`.
    pub fn start_workflow(&self, workflow_type: &str, tickers: &[String]) -> WorkflowContext {
        let ctx = WorkflowContext {
            workflow_id: Uuid::new_v4(),
            workflow_type: workflow_type.to_string(),
            started_at: Utc::now(),
            started: Instant::now(),
            step_index: AtomicU32::new(0),
        };
        self.log_workflow_event(
            ctx.workflow_id,
            workflow_type,
            "workflow_start",
            "started",
            None,
            None,
            None,
            None,
            json!({ "tickers": tickers }),
        );
        ctx
    }

    pub fn complete_workflow(&self, ctx: &WorkflowContext, payload: Value) {
        self.log_workflow_event(
            ctx.workflow_id,
            &ctx.workflow_type,
            "workflow_complete",
            "completed",
            None,
            Some(ctx.elapsed_ms()),
            None,
            None,
            payload,
        );
    }

    pub fn fail_workflow(&self, ctx: &WorkflowContext, error: &str) {
        self.log_workflow_event(
            ctx.workflow_id,
            &ctx.workflow_type,
            "workflow_error",
            "failed",
            None,
            Some(ctx.elapsed_ms()),
            None,
            Some(error),
            Value::Null,
        );
    }

    /// Begin a step within a workflow. Emits `started` immediately.
    pub fn step(
        &self,
        ctx: &WorkflowContext,
        step_name: &str,
        ticker: Option<&str>,
    ) -> StepGuard<'_> {
        let step_index = ctx.next_step_index();
        self.log_workflow_event(
            ctx.workflow_id,
            &ctx.workflow_type,
            step_name,
            "started",
            Some(step_index),
            None,
            ticker,
            None,
            Value::Null,
        );
        StepGuard {
            logger: self,
            workflow_id: ctx.workflow_id,
            workflow_type: ctx.workflow_type.clone(),
            step_name: step_name.to_string(),
            step_index,
            ticker: ticker.map(str::to_string),
            started: Instant::now(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_workflow_event(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        step_name: &str,
        status: &str,
        step_index: Option<u32>,
        duration_ms: Option<u64>,
        ticker: Option<&str>,
        error_message: Option<&str>,
        payload: Value,
    ) {
        self.store_event(
            "workflow_events",
            Some(workflow_id),
            json!({
                "workflow_type": workflow_type,
                "step_name": step_name,
                "step_index": step_index,
                "status": status,
                "duration_ms": duration_ms,
                "ticker": ticker,
                "error_message": error_message,
                "payload": payload,
            }),
        );
    }

    // -------------------------------------------------------------------------
    // Domain events
    // -------------------------------------------------------------------------

    pub fn log_agent_signal(
        &self,
        workflow_id: Uuid,
        agent_id: &str,
        ticker: &str,
        signal: &str,
        confidence: Option<f64>,
        reasoning: Option<&str>,
    ) {
        self.store_event(
            "agent_signals",
            Some(workflow_id),
            json!({
                "agent_id": agent_id,
                "ticker": ticker,
                "signal": signal,
                "confidence": confidence,
                "reasoning": reasoning,
            }),
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_pm_decision(
        &self,
        workflow_id: Uuid,
        ticker: &str,
        action: &str,
        quantity: f64,
        confidence: Option<f64>,
        stop_loss_pct: Option<f64>,
        take_profit_pct: Option<f64>,
        reasoning: Option<&str>,
        portfolio_equity: Option<f64>,
    ) {
        self.store_event(
            "pm_decisions",
            Some(workflow_id),
            json!({
                "ticker": ticker,
                "action": action,
                "quantity": quantity,
                "confidence": confidence,
                "stop_loss_pct": stop_loss_pct,
                "take_profit_pct": take_profit_pct,
                "reasoning": reasoning,
                "portfolio_equity": portfolio_equity,
            }),
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_trade_execution(
        &self,
        workflow_id: Option<Uuid>,
        order_id: &str,
        ticker: &str,
        side: &str,
        quantity: f64,
        order_type: &str,
        status: &str,
        reject_reason: Option<&str>,
    ) {
        self.store_event(
            "trade_executions",
            workflow_id,
            json!({
                "order_id": order_id,
                "ticker": ticker,
                "side": side,
                "quantity": quantity,
                "order_type": order_type,
                "status": status,
                "reject_reason": reject_reason,
            }),
        );
    }

    pub fn log_heartbeat(
        &self,
        scheduler_id: &str,
        hostname: &str,
        jobs_pending: usize,
        jobs_running: usize,
    ) {
        self.store_event(
            "scheduler_heartbeats",
            None,
            json!({
                "scheduler_id": scheduler_id,
                "hostname": hostname,
                "jobs_pending": jobs_pending,
                "jobs_running": jobs_running,
            }),
        );
    }

    pub fn log_alert(&self, priority: &str, category: &str, title: &str, details: Value) {
        self.store_event(
            "alerts",
            None,
            json!({
                "priority": priority,
                "category": category,
                "title": title,
                "details": details,
            }),
        );
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// In-memory fallback events, optionally filtered by kind.
    pub fn fallback_events(&self, kind: Option<&str>) -> Vec<StoredEvent> {
        let fallback = self.fallback.lock();
        fallback
            .iter()
            .filter(|e| kind.map(|k| e.kind == k).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Count of events persisted to the store for a kind (0 without a store).
    pub fn persisted_count(&self, kind: &str) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        store
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM telemetry_events WHERE kind = ?1",
                    rusqlite::params![kind],
                    |row| row.get::<_, i64>(0),
                )
            })
            .map(|n| n as usize)
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for EventLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogger")
            .field("persistent", &self.store.is_some())
            .field("fallback_len", &self.fallback.lock().len())
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
    fn fallback_buffer_is_bounded() {
        let logger = EventLogger::new(None);
        for i in 0..(MAX_FALLBACK_EVENTS + 500) {
            logger.store_event("workflow_events", None, json!({ "i": i }));
        }
        assert_eq!(logger.fallback_events(None).len(), MAX_FALLBACK_EVENTS);
    }

    #[test]
    fn events_persist_when_store_attached() {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let logger = EventLogger::new(Some(store));
        logger.log_heartbeat("sched-1", "host", 1, 0);
        logger.log_heartbeat("sched-1", "host", 2, 0);

        assert_eq!(logger.persisted_count("scheduler_heartbeats"), 2);
        assert!(logger.fallback_events(None).is_empty());
    }

    #[test]
    fn workflow_steps_emit_started_and_completed() {
        let logger = Arc::new(EventLogger::new(None));
        let wf = logger.start_workflow("trading_cycle", &["AAPL".to_string()]);

        let step = logger.step(&wf, "strategy_screening", None);
        step.complete(json!({ "signals_found": 2 }));

        let step = logger.step(&wf, "research", Some("AAPL"));
        step.fail("timeout");

        logger.complete_workflow(&wf, json!({ "ok": true }));

        let events = logger.fallback_events(Some("workflow_events"));
        // workflow_start + 2 step starts + 1 complete + 1 fail + workflow_complete
        assert_eq!(events.len(), 6);

        let statuses: Vec<String> = events
            .iter()
            .map(|e| e.payload["status"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            statuses,
            vec!["started", "started", "completed", "started", "failed", "completed"]
        );

        // Step indices are monotonically increasing.
        let step_indices: Vec<u64> = events
            .iter()
            .filter_map(|e| e.payload["step_index"].as_u64())
            .collect();
        assert_eq!(step_indices, vec![1, 1, 2, 2]);

        // All events share the workflow id.
        assert!(events.iter().all(|e| e.workflow_id == Some(wf.workflow_id)));
    }

    #[test]
    fn failed_step_records_duration_and_error() {
        let logger = Arc::new(EventLogger::new(None));
        let wf = logger.start_workflow("trading_cycle", &[]);
        let step = logger.step(&wf, "decide", Some("MSFT"));
        step.fail("decision timeout");

        let events = logger.fallback_events(Some("workflow_events"));
        let failed = events
            .iter()
            .find(|e| e.payload["status"] == "failed")
            .unwrap();
        assert_eq!(failed.payload["error_message"], "decision timeout");
        assert!(failed.payload["duration_ms"].is_u64());
        assert_eq!(failed.payload["ticker"], "MSFT");
    }
}
