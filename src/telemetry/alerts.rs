// =============================================================================
// Alerting — priority-tagged operational alerts
// =============================================================================
//
// Priorities:
//   P0 critical — trading blocked, immediate action required
//   P1 warning  — trading degraded, action within 30 minutes
//   P2 info     — potential issues, review at end of day
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::events::EventLogger;

/// Maximum retained alerts in memory.
const MAX_RECENT_ALERTS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertPriority {
    P0,
    P1,
    P2,
}

impl AlertPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    RateLimit,
    Pipeline,
    Execution,
    System,
    Data,
    Health,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Pipeline => "pipeline",
            Self::Execution => "execution",
            Self::System => "system",
            Self::Data => "data",
            Self::Health => "health",
        }
    }
}

/// An alert instance.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub priority: AlertPriority,
    pub category: AlertCategory,
    pub title: String,
    pub details: Value,
    pub ticker: Option<String>,
    pub service: Option<String>,
}

/// Raises and retains alerts, mirroring each one into the event log.
pub struct AlertManager {
    events: Arc<EventLogger>,
    recent: Mutex<VecDeque<Alert>>,
}

impl AlertManager {
    pub fn new(events: Arc<EventLogger>) -> Self {
        Self {
            events,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Raise an alert. Logged at a level matching its priority.
    pub fn raise(
        &self,
        priority: AlertPriority,
        category: AlertCategory,
        title: &str,
        details: Value,
    ) -> Alert {
        let alert = Alert {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            priority,
            category,
            title: title.to_string(),
            details: details.clone(),
            ticker: None,
            service: None,
        };

        match priority {
            AlertPriority::P0 => {
                error!(category = category.as_str(), title, "P0 ALERT")
            }
            AlertPriority::P1 => {
                warn!(category = category.as_str(), title, "P1 alert")
            }
            AlertPriority::P2 => {
                info!(category = category.as_str(), title, "P2 alert")
            }
        }

        self.events
            .log_alert(priority.as_str(), category.as_str(), title, details);

        let mut recent = self.recent.lock();
        recent.push_back(alert.clone());
        while recent.len() > MAX_RECENT_ALERTS {
            recent.pop_front();
        }

        alert
    }

    /// Most recent alerts, newest last, optionally filtered by priority.
    pub fn recent(&self, priority: Option<AlertPriority>) -> Vec<Alert> {
        self.recent
            .lock()
            .iter()
            .filter(|a| priority.map(|p| a.priority == p).unwrap_or(true))
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("recent_len", &self.recent.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> AlertManager {
        AlertManager::new(Arc::new(EventLogger::new(None)))
    }

    #[test]
    fn raise_and_filter_by_priority() {
        let alerts = manager();
        alerts.raise(AlertPriority::P1, AlertCategory::Health, "scheduler stale", json!({}));
        alerts.raise(AlertPriority::P2, AlertCategory::System, "note", json!({}));

        assert_eq!(alerts.recent(None).len(), 2);
        let p1 = alerts.recent(Some(AlertPriority::P1));
        assert_eq!(p1.len(), 1);
        assert_eq!(p1[0].title, "scheduler stale");
    }

    #[test]
    fn recent_alerts_bounded() {
        let alerts = manager();
        for i in 0..(MAX_RECENT_ALERTS + 50) {
            alerts.raise(
                AlertPriority::P2,
                AlertCategory::System,
                &format!("alert {i}"),
                json!({}),
            );
        }
        assert_eq!(alerts.recent(None).len(), MAX_RECENT_ALERTS);
    }

    #[test]
    fn alerts_mirrored_to_event_log() {
        let events = Arc::new(EventLogger::new(None));
        let alerts = AlertManager::new(Arc::clone(&events));
        alerts.raise(AlertPriority::P0, AlertCategory::Execution, "order failed", json!({}));

        let logged = events.fallback_events(Some("alerts"));
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].payload["priority"], "P0");
    }
}
