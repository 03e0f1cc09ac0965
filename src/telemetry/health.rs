// =============================================================================
// Health Checker — pre-market and continuous readiness validation
// =============================================================================
//
// Aggregate status:
//   READY    — no failing or warning checks
//   DEGRADED — warnings only
//   BLOCKED  — at least one failing check
//
// A stale scheduler heartbeat (older than the configured threshold) is a
// WARN check and raises a P1 alert; an account that cannot authenticate or
// a dead database is a FAIL.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::broker::Broker;
use crate::config::Settings;
use crate::store::Store;

use super::alerts::{AlertCategory, AlertManager, AlertPriority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallHealth {
    Ready,
    Degraded,
    Blocked,
}

impl std::fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "READY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Blocked => write!(f, "BLOCKED"),
        }
    }
}

/// Result of a single health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub latency_ms: u64,
}

impl HealthCheckResult {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            latency_ms: 0,
        }
    }

    fn with_latency(mut self, started: Instant) -> Self {
        self.latency_ms = started.elapsed().as_millis() as u64;
        self
    }
}

/// Complete health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub check_type: String,
    pub overall_status: OverallHealth,
    pub checks: Vec<HealthCheckResult>,
    pub failures: Vec<String>,
    pub warnings: Vec<String>,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.overall_status == OverallHealth::Ready
    }
}

/// Aggregate a set of checks into the overall status plus failure/warning
/// name lists.
pub fn aggregate(checks: &[HealthCheckResult]) -> (OverallHealth, Vec<String>, Vec<String>) {
    let failures: Vec<String> = checks
        .iter()
        .filter(|c| c.status == CheckStatus::Fail)
        .map(|c| c.name.clone())
        .collect();
    let warnings: Vec<String> = checks
        .iter()
        .filter(|c| c.status == CheckStatus::Warn)
        .map(|c| c.name.clone())
        .collect();

    let overall = if !failures.is_empty() {
        OverallHealth::Blocked
    } else if !warnings.is_empty() {
        OverallHealth::Degraded
    } else {
        OverallHealth::Ready
    };
    (overall, failures, warnings)
}

/// Evaluate scheduler-heartbeat freshness. Pure so the staleness rules are
/// unit-testable.
pub fn evaluate_heartbeat(
    last: Option<DateTime<Utc>>,
    threshold_minutes: i64,
    now: DateTime<Utc>,
) -> HealthCheckResult {
    match last {
        None => HealthCheckResult::new(
            "scheduler_heartbeat",
            CheckStatus::Unknown,
            "no_heartbeats",
        ),
        Some(ts) => {
            let age_minutes = (now - ts).num_minutes();
            if age_minutes > threshold_minutes {
                HealthCheckResult::new(
                    "scheduler_heartbeat",
                    CheckStatus::Warn,
                    format!(
                        "scheduler heartbeat stale: {age_minutes}m old (threshold {threshold_minutes}m)"
                    ),
                )
            } else {
                HealthCheckResult::new(
                    "scheduler_heartbeat",
                    CheckStatus::Pass,
                    format!("Scheduler alive ({age_minutes}m ago)"),
                )
            }
        }
    }
}

/// Health check service over the broker, store, and configuration.
pub struct HealthChecker {
    broker: Arc<dyn Broker>,
    store: Arc<Store>,
    alerts: Arc<AlertManager>,
    settings: Settings,
}

impl HealthChecker {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<Store>,
        alerts: Arc<AlertManager>,
        settings: Settings,
    ) -> Self {
        Self {
            broker,
            store,
            alerts,
            settings,
        }
    }

    /// Comprehensive pre-market check; run ~15 minutes before the open.
    pub async fn run_pre_market_check(&self) -> HealthReport {
        let checks = vec![
            self.check_broker_auth().await,
            self.check_buying_power().await,
            self.check_cache(),
            self.check_database(),
            self.check_data_api_key(),
            self.check_llm_api_keys(),
            self.check_scheduler_heartbeat(),
            self.check_market_calendar().await,
        ];
        self.build_report("pre_market", checks)
    }

    /// Lightweight continuous check for the in-day schedule.
    pub async fn run_continuous_check(&self) -> HealthReport {
        let checks = vec![self.check_scheduler_heartbeat(), self.check_database()];
        self.build_report("continuous", checks)
    }

    fn build_report(&self, check_type: &str, checks: Vec<HealthCheckResult>) -> HealthReport {
        let (overall, failures, warnings) = aggregate(&checks);

        if !failures.is_empty() {
            self.alerts.raise(
                AlertPriority::P0,
                AlertCategory::Health,
                &format!("health check BLOCKED: {}", failures.join(", ")),
                json!({ "failures": failures, "warnings": warnings }),
            );
        }

        info!(check_type, status = %overall, "health check complete");
        HealthReport {
            timestamp: Utc::now(),
            check_type: check_type.to_string(),
            overall_status: overall,
            checks,
            failures,
            warnings,
        }
    }

    // -------------------------------------------------------------------------
    // Individual checks
    // -------------------------------------------------------------------------

    async fn check_broker_auth(&self) -> HealthCheckResult {
        let started = Instant::now();
        match self.broker.get_account().await {
            Ok(account) => HealthCheckResult::new(
                "broker_auth",
                CheckStatus::Pass,
                format!("Connected as {}", account.account_number),
            )
            .with_latency(started),
            Err(e) => {
                let message: String = e.to_string().chars().take(200).collect();
                HealthCheckResult::new("broker_auth", CheckStatus::Fail, message)
                    .with_latency(started)
            }
        }
    }

    async fn check_buying_power(&self) -> HealthCheckResult {
        match self.broker.get_account().await {
            Ok(account) => {
                let bp = account.buying_power;
                if bp < 100.0 {
                    HealthCheckResult::new(
                        "buying_power",
                        CheckStatus::Fail,
                        format!("Insufficient buying power: ${bp:.2}"),
                    )
                } else if bp < 1_000.0 {
                    HealthCheckResult::new(
                        "buying_power",
                        CheckStatus::Warn,
                        format!("Low buying power: ${bp:.2}"),
                    )
                } else {
                    HealthCheckResult::new(
                        "buying_power",
                        CheckStatus::Pass,
                        format!("Buying power: ${bp:.2}"),
                    )
                }
            }
            Err(e) => {
                let message: String = e.to_string().chars().take(200).collect();
                HealthCheckResult::new("buying_power", CheckStatus::Unknown, message)
            }
        }
    }

    fn check_cache(&self) -> HealthCheckResult {
        match &self.settings.cache_url {
            Some(url) => HealthCheckResult::new(
                "cache",
                CheckStatus::Pass,
                format!("cache configured at {url}"),
            ),
            None => HealthCheckResult::new(
                "cache",
                CheckStatus::Warn,
                "Using in-memory fallback (CACHE_URL not set)",
            ),
        }
    }

    fn check_database(&self) -> HealthCheckResult {
        let started = Instant::now();
        match self.store.ping() {
            Ok(()) => HealthCheckResult::new("database", CheckStatus::Pass, "Database connected")
                .with_latency(started),
            Err(e) => {
                let message: String = e.to_string().chars().take(200).collect();
                HealthCheckResult::new("database", CheckStatus::Fail, message)
                    .with_latency(started)
            }
        }
    }

    fn check_data_api_key(&self) -> HealthCheckResult {
        if self.settings.financial_datasets_api_key.is_some() {
            HealthCheckResult::new("data_api_quota", CheckStatus::Pass, "API key configured")
        } else {
            HealthCheckResult::new(
                "data_api_quota",
                CheckStatus::Warn,
                "FINANCIAL_DATASETS_API_KEY not set",
            )
        }
    }

    fn check_llm_api_keys(&self) -> HealthCheckResult {
        let mut providers = Vec::new();
        if self.settings.openai_api_key.is_some() {
            providers.push("OpenAI");
        }
        if self.settings.anthropic_api_key.is_some() {
            providers.push("Anthropic");
        }
        if providers.is_empty() {
            HealthCheckResult::new(
                "llm_api_quota",
                CheckStatus::Warn,
                "No LLM API keys configured",
            )
        } else {
            HealthCheckResult::new(
                "llm_api_quota",
                CheckStatus::Pass,
                format!("Configured: {}", providers.join(", ")),
            )
        }
    }

    fn check_scheduler_heartbeat(&self) -> HealthCheckResult {
        let last = self.store.last_heartbeat().unwrap_or(None);
        let result = evaluate_heartbeat(
            last,
            self.settings.scheduler_stale_threshold_minutes,
            Utc::now(),
        );

        if result.status == CheckStatus::Warn {
            self.alerts.raise(
                AlertPriority::P1,
                AlertCategory::Health,
                &result.message,
                json!({ "last_heartbeat": last.map(|t| t.to_rfc3339()) }),
            );
        }
        result
    }

    async fn check_market_calendar(&self) -> HealthCheckResult {
        match self.broker.get_clock().await {
            Ok(clock) if clock.is_open => HealthCheckResult::new(
                "market_calendar",
                CheckStatus::Pass,
                format!(
                    "Market OPEN, closes at {}",
                    clock.next_close.as_deref().unwrap_or("?")
                ),
            ),
            Ok(clock) => HealthCheckResult::new(
                "market_calendar",
                CheckStatus::Pass,
                format!(
                    "Market CLOSED, opens at {}",
                    clock.next_open.as_deref().unwrap_or("?")
                ),
            ),
            Err(e) => {
                let message: String = e.to_string().chars().take(200).collect();
                HealthCheckResult::new("market_calendar", CheckStatus::Unknown, message)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::events::EventLogger;
    use crate::testutil::FakeBroker;
    use chrono::Duration;

    // ---- heartbeat staleness (pure) --------------------------------------

    #[test]
    fn heartbeat_never_recorded_is_unknown() {
        let result = evaluate_heartbeat(None, 10, Utc::now());
        assert_eq!(result.status, CheckStatus::Unknown);
        assert_eq!(result.message, "no_heartbeats");
    }

    #[test]
    fn heartbeat_fresh_passes() {
        let now = Utc::now();
        let result = evaluate_heartbeat(Some(now - Duration::minutes(3)), 10, now);
        assert_eq!(result.status, CheckStatus::Pass);
    }

    #[test]
    fn heartbeat_fifteen_minutes_old_with_ten_minute_threshold_warns() {
        let now = Utc::now();
        let result = evaluate_heartbeat(Some(now - Duration::minutes(15)), 10, now);
        assert_eq!(result.status, CheckStatus::Warn);
        assert!(result.message.contains("stale"));
    }

    // ---- aggregation ------------------------------------------------------

    #[test]
    fn aggregation_rules() {
        let pass = HealthCheckResult::new("a", CheckStatus::Pass, "");
        let warn = HealthCheckResult::new("b", CheckStatus::Warn, "");
        let fail = HealthCheckResult::new("c", CheckStatus::Fail, "");
        let unknown = HealthCheckResult::new("d", CheckStatus::Unknown, "");

        let (overall, _, _) = aggregate(&[pass.clone(), unknown.clone()]);
        assert_eq!(overall, OverallHealth::Ready);

        let (overall, _, warnings) = aggregate(&[pass.clone(), warn.clone()]);
        assert_eq!(overall, OverallHealth::Degraded);
        assert_eq!(warnings, vec!["b"]);

        let (overall, failures, _) = aggregate(&[pass, warn, fail]);
        assert_eq!(overall, OverallHealth::Blocked);
        assert_eq!(failures, vec!["c"]);
    }

    // ---- end to end with fakes -------------------------------------------

    #[tokio::test]
    async fn stale_scheduler_degrades_report_and_raises_p1() {
        let store = Arc::new(Store::open(":memory:").unwrap());
        store
            .record_heartbeat("sched", "host", 0, 0, Utc::now() - Duration::minutes(15))
            .unwrap();

        let events = Arc::new(EventLogger::new(None));
        let alerts = Arc::new(AlertManager::new(events));
        let broker = Arc::new(FakeBroker::with_equity(50_000.0));

        let checker = HealthChecker::new(
            broker,
            Arc::clone(&store),
            Arc::clone(&alerts),
            Settings::for_tests(),
        );

        let report = checker.run_continuous_check().await;
        assert_eq!(report.overall_status, OverallHealth::Degraded);

        let scheduler_check = report
            .checks
            .iter()
            .find(|c| c.name == "scheduler_heartbeat")
            .unwrap();
        assert_eq!(scheduler_check.status, CheckStatus::Warn);
        assert!(scheduler_check.message.contains("stale"));

        let p1 = alerts.recent(Some(AlertPriority::P1));
        assert_eq!(p1.len(), 1);
    }

    #[tokio::test]
    async fn low_buying_power_fails_pre_market() {
        let store = Arc::new(Store::open(":memory:").unwrap());
        store
            .record_heartbeat("sched", "host", 0, 0, Utc::now())
            .unwrap();

        let events = Arc::new(EventLogger::new(None));
        let alerts = Arc::new(AlertManager::new(events));
        let broker = Arc::new(FakeBroker::with_equity(50.0));

        let checker = HealthChecker::new(broker, store, alerts, Settings::for_tests());
        let report = checker.run_pre_market_check().await;

        assert_eq!(report.overall_status, OverallHealth::Blocked);
        assert!(report.failures.contains(&"buying_power".to_string()));
    }
}
