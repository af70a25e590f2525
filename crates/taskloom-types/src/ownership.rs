//! Coordinator ownership: dispatchers own workers, tickers own timers.
//!
//! Liveness is heartbeat based. A coordinator whose heartbeat is older than
//! the configured window is stale and its holdings are handed to a live peer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which coordinator table an owner lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    Dispatcher,
    Ticker,
}

/// A dispatcher or ticker row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coordinator {
    pub id: Uuid,
    pub kind: OwnerKind,
    pub is_active: bool,
    pub last_heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Coordinator {
    pub fn new(kind: OwnerKind, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            is_active: true,
            last_heartbeat_at: now,
            created_at: now,
        }
    }

    pub fn is_stale(&self, heartbeat_after: DateTime<Utc>) -> bool {
        self.last_heartbeat_at < heartbeat_after
    }
}

/// When a timer fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimerSchedule {
    /// Recurring, driven by a cron expression.
    Cron { expression: String },
    /// One-shot at a fixed instant.
    Once { trigger_at: DateTime<Utc> },
}

/// A time-based trigger owned by at most one ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTimer {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    pub schedule: TimerSchedule,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_staleness() {
        let now = Utc::now();
        let dispatcher = Coordinator::new(OwnerKind::Dispatcher, now - chrono::Duration::seconds(90));
        assert!(dispatcher.is_stale(now - chrono::Duration::seconds(60)));
        assert!(!dispatcher.is_stale(now - chrono::Duration::seconds(120)));
    }

    #[test]
    fn test_timer_schedule_serde() {
        let schedule = TimerSchedule::Cron {
            expression: "*/5 * * * *".to_string(),
        };
        let value = serde_json::to_value(&schedule).unwrap();
        assert_eq!(value["kind"], "cron");
        let parsed: TimerSchedule = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, schedule);
    }
}
