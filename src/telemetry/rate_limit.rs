// =============================================================================
// Rate-Limit Monitor — bounded ring buffer of outbound API calls
// =============================================================================
//
// Every outbound adapter records a CallEvent here regardless of outcome.
// History is a ring buffer capped at MAX_CALL_HISTORY: newest appended,
// oldest evicted. Aggregation takes a read of the buffer; appends take the
// write side. Neither is ever held across an await point.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

/// Maximum retained call events. Oldest evicted on overflow.
pub const MAX_CALL_HISTORY: usize = 5_000;

/// A provider whose newest call is older than this is considered stale.
pub const STALE_AFTER_MINUTES: i64 = 60;

/// One outbound API call, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct CallEvent {
    pub api_name: String,
    pub call_type: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: u64,
    pub rate_limit_remaining: Option<i64>,
}

/// The most recent 429 observed for a provider.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitHit {
    pub api_name: String,
    pub timestamp: DateTime<Utc>,
    pub retry_after: Option<u64>,
}

/// Aggregated activity for one provider over a query window.
#[derive(Debug, Clone, Serialize)]
pub struct ApiActivity {
    pub api_name: String,
    pub display_name: String,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub by_call_type: HashMap<String, u64>,
    pub avg_latency_ms: f64,
    pub last_call: Option<DateTime<Utc>>,
    /// True when the provider's newest call (in the whole buffer, not just
    /// the window) is older than [`STALE_AFTER_MINUTES`].
    pub is_stale: bool,
}

/// Thread-safe call-history tracker shared by every outbound adapter.
pub struct RateLimitMonitor {
    history: Mutex<VecDeque<CallEvent>>,
    rate_limit_hits: Mutex<HashMap<String, RateLimitHit>>,
}

impl RateLimitMonitor {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(MAX_CALL_HISTORY)),
            rate_limit_hits: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    /// Record one outbound call.
    pub fn record_call(
        &self,
        api_name: &str,
        call_type: &str,
        success: bool,
        latency_ms: u64,
        rate_limit_remaining: Option<i64>,
    ) {
        self.record_event(CallEvent {
            api_name: api_name.to_string(),
            call_type: call_type.to_string(),
            timestamp: Utc::now(),
            success,
            latency_ms,
            rate_limit_remaining,
        });
    }

    /// Push a pre-built event. Exposed so tests can inject back-dated calls.
    pub fn record_event(&self, event: CallEvent) {
        debug!(
            api = %event.api_name,
            call_type = %event.call_type,
            success = event.success,
            latency_ms = event.latency_ms,
            "call recorded"
        );
        let mut history = self.history.lock();
        history.push_back(event);
        while history.len() > MAX_CALL_HISTORY {
            history.pop_front();
        }
    }

    /// Record a 429 for the provider.
    pub fn record_rate_limit_hit(&self, api_name: &str, retry_after: Option<u64>) {
        warn!(api = api_name, retry_after, "rate limit hit");
        self.rate_limit_hits.lock().insert(
            api_name.to_string(),
            RateLimitHit {
                api_name: api_name.to_string(),
                timestamp: Utc::now(),
                retry_after,
            },
        );
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    /// Last recorded 429 per provider.
    pub fn rate_limit_hits(&self) -> Vec<RateLimitHit> {
        self.rate_limit_hits.lock().values().cloned().collect()
    }

    /// Aggregate events whose `timestamp >= now - window` into per-provider
    /// activity with per-call-type breakdowns.
    pub fn get_call_activity(&self, window_minutes: i64) -> HashMap<String, ApiActivity> {
        let cutoff = Utc::now() - Duration::minutes(window_minutes);
        let stale_cutoff = Utc::now() - Duration::minutes(STALE_AFTER_MINUTES);
        let history = self.history.lock();

        // Newest call per provider across the whole buffer drives staleness.
        let mut newest: HashMap<String, DateTime<Utc>> = HashMap::new();
        for event in history.iter() {
            let entry = newest
                .entry(event.api_name.clone())
                .or_insert(event.timestamp);
            if event.timestamp > *entry {
                *entry = event.timestamp;
            }
        }

        let mut result: HashMap<String, ApiActivity> = HashMap::new();
        let mut latency_sums: HashMap<String, u64> = HashMap::new();

        for event in history.iter().filter(|e| e.timestamp >= cutoff) {
            let activity = result
                .entry(event.api_name.clone())
                .or_insert_with(|| ApiActivity {
                    api_name: event.api_name.clone(),
                    display_name: display_name(&event.api_name),
                    total_calls: 0,
                    successful_calls: 0,
                    failed_calls: 0,
                    by_call_type: HashMap::new(),
                    avg_latency_ms: 0.0,
                    last_call: None,
                    is_stale: false,
                });

            activity.total_calls += 1;
            if event.success {
                activity.successful_calls += 1;
            } else {
                activity.failed_calls += 1;
            }
            *activity
                .by_call_type
                .entry(event.call_type.clone())
                .or_insert(0) += 1;
            *latency_sums.entry(event.api_name.clone()).or_insert(0) += event.latency_ms;

            if activity.last_call.map(|t| event.timestamp > t).unwrap_or(true) {
                activity.last_call = Some(event.timestamp);
            }
        }

        for (api, activity) in result.iter_mut() {
            if activity.total_calls > 0 {
                activity.avg_latency_ms =
                    latency_sums[api] as f64 / activity.total_calls as f64;
            }
            activity.is_stale = newest
                .get(api)
                .map(|t| *t < stale_cutoff)
                .unwrap_or(true);
        }

        result
    }
}

impl Default for RateLimitMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitMonitor")
            .field("history_len", &self.history_len())
            .finish()
    }
}

/// Friendly display name derived from the api key: split on underscores and
/// title-case each word ("financial_datasets" → "Financial Datasets").
pub fn display_name(api_name: &str) -> String {
    api_name
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn event_at(api: &str, call_type: &str, minutes_ago: i64, success: bool) -> CallEvent {
        CallEvent {
            api_name: api.to_string(),
            call_type: call_type.to_string(),
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
            success,
            latency_ms: 50,
            rate_limit_remaining: None,
        }
    }

    #[test]
    fn history_never_exceeds_cap() {
        let monitor = RateLimitMonitor::new();
        for i in 0..(MAX_CALL_HISTORY + 250) {
            monitor.record_call("alpaca", "orders", i % 2 == 0, 10, None);
        }
        assert!(monitor.history_len() <= MAX_CALL_HISTORY);
        assert_eq!(monitor.history_len(), MAX_CALL_HISTORY);
    }

    #[test]
    fn oldest_events_evicted_first() {
        let monitor = RateLimitMonitor::new();
        monitor.record_event(event_at("old_api", "x", 0, true));
        for _ in 0..MAX_CALL_HISTORY {
            monitor.record_call("alpaca", "orders", true, 10, None);
        }
        let activity = monitor.get_call_activity(120);
        assert!(!activity.contains_key("old_api"));
        assert!(activity.contains_key("alpaca"));
    }

    #[test]
    fn activity_window_filters_old_events() {
        let monitor = RateLimitMonitor::new();
        monitor.record_event(event_at("alpaca", "orders", 90, true));
        monitor.record_event(event_at("alpaca", "orders", 5, true));
        monitor.record_event(event_at("alpaca", "positions", 3, false));

        let activity = monitor.get_call_activity(30);
        let alpaca = &activity["alpaca"];
        assert_eq!(alpaca.total_calls, 2);
        assert_eq!(alpaca.successful_calls, 1);
        assert_eq!(alpaca.failed_calls, 1);
        assert_eq!(alpaca.by_call_type["orders"], 1);
        assert_eq!(alpaca.by_call_type["positions"], 1);
    }

    #[test]
    fn stale_provider_flagged() {
        let monitor = RateLimitMonitor::new();
        monitor.record_event(event_at("quiet_api", "general", STALE_AFTER_MINUTES + 15, true));
        monitor.record_event(event_at("busy_api", "general", 1, true));

        // Window wide enough to include both.
        let activity = monitor.get_call_activity(240);
        assert!(activity["quiet_api"].is_stale);
        assert!(!activity["busy_api"].is_stale);
    }

    #[test]
    fn rate_limit_hits_tracked_per_provider() {
        let monitor = RateLimitMonitor::new();
        monitor.record_rate_limit_hit("alpaca", Some(12));
        monitor.record_rate_limit_hit("alpaca", Some(30));
        monitor.record_rate_limit_hit("financial_datasets", None);

        let hits = monitor.rate_limit_hits();
        assert_eq!(hits.len(), 2);
        let alpaca = hits.iter().find(|h| h.api_name == "alpaca").unwrap();
        assert_eq!(alpaca.retry_after, Some(30));
    }

    #[test]
    fn display_names() {
        assert_eq!(display_name("alpaca"), "Alpaca");
        assert_eq!(display_name("financial_datasets"), "Financial Datasets");
        assert_eq!(display_name(""), "");
    }
}
