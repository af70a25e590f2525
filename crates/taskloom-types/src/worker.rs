//! Worker, label and rate-limit types.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::bounded_seconds;

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// A worker label value. Integers compare numerically, strings lexically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum LabelValue {
    Int(i64),
    Str(String),
}

impl LabelValue {
    /// Compare two label values of the same type. Mixed types are unordered.
    pub fn partial_compare(&self, other: &LabelValue) -> Option<Ordering> {
        match (self, other) {
            (LabelValue::Int(a), LabelValue::Int(b)) => Some(a.cmp(b)),
            (LabelValue::Str(a), LabelValue::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// How a worker's label is compared against a desired value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LabelComparator {
    #[default]
    Equal,
    NotEqual,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
}

impl LabelComparator {
    /// Whether `actual <op> desired` holds.
    pub fn matches(self, actual: &LabelValue, desired: &LabelValue) -> bool {
        let Some(ordering) = actual.partial_compare(desired) else {
            return self == LabelComparator::NotEqual;
        };
        match self {
            LabelComparator::Equal => ordering == Ordering::Equal,
            LabelComparator::NotEqual => ordering != Ordering::Equal,
            LabelComparator::GreaterThan => ordering == Ordering::Greater,
            LabelComparator::LessThan => ordering == Ordering::Less,
            LabelComparator::GreaterThanOrEqual => ordering != Ordering::Less,
            LabelComparator::LessThanOrEqual => ordering != Ordering::Greater,
        }
    }
}

fn default_label_weight() -> i32 {
    100
}

/// A step's affinity toward workers carrying a given label.
///
/// Required labels filter candidates out; optional ones only add `weight` to
/// the ranking of workers that satisfy them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DesiredLabel {
    pub value: LabelValue,
    #[serde(default)]
    pub comparator: LabelComparator,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_label_weight")]
    pub weight: i32,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// A worker process registered with the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub name: String,
    /// Dispatcher currently owning this worker's connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatcher_id: Option<Uuid>,
    /// Total slot capacity.
    pub max_runs: u32,
    pub is_active: bool,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, LabelValue>,
    pub created_at: DateTime<Utc>,
}

impl Worker {
    pub fn is_alive(&self, heartbeat_after: DateTime<Utc>) -> bool {
        self.is_active && self.last_heartbeat_at >= heartbeat_after
    }

    pub fn declares_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }
}

/// A worker together with the slot units currently held on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCapacity {
    pub worker: Worker,
    pub used_slots: u32,
}

impl WorkerCapacity {
    pub fn free_slots(&self) -> u32 {
        self.worker.max_runs.saturating_sub(self.used_slots)
    }
}

// ---------------------------------------------------------------------------
// Rate limits
// ---------------------------------------------------------------------------

/// A shared unit budget that refills to `limit` every `window_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    pub key: String,
    pub limit: i32,
    pub window_secs: u64,
    pub remaining: i32,
    pub last_refill_at: DateTime<Utc>,
}

impl RateLimit {
    pub fn new(key: impl Into<String>, limit: i32, window_secs: u64, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            limit,
            window_secs,
            remaining: limit,
            last_refill_at: now,
        }
    }

    /// Units available at `now`, accounting for a pending refill.
    pub fn available_at(&self, now: DateTime<Utc>) -> i32 {
        if self.window_elapsed(now) {
            self.limit
        } else {
            self.remaining
        }
    }

    pub fn window_elapsed(&self, now: DateTime<Utc>) -> bool {
        let window = bounded_seconds(self.window_secs);
        now - self.last_refill_at >= window
    }
}
