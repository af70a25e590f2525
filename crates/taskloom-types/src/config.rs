//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml`. Every field has a
//! default, so an empty file is a valid configuration. `validate()` is a pure
//! function returning every problem found rather than stopping at the first.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationIssue;

/// Upper bound for every duration held in seconds: ten years.
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;
/// Upper bound for `recovery.retention_days`.
pub const MAX_RETENTION_DAYS: u32 = 100 * 365;

/// `secs` as a chrono duration, clamped to [`MAX_DURATION_SECS`] so the
/// conversion cannot overflow.
pub fn bounded_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

impl EngineConfig {
    /// Check cross-field constraints. Returns all issues at once.
    pub fn validate(&self) -> Result<(), Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        let s = &self.scheduling;
        let r = &self.recovery;

        if s.assign_interval_ms == 0 {
            issues.push(ValidationIssue::new("scheduling.assign_interval_ms", "must be greater than zero"));
        }
        if s.assign_batch_size == 0 {
            issues.push(ValidationIssue::new("scheduling.assign_batch_size", "must be greater than zero"));
        }
        if s.schedule_timeout_secs == 0 {
            issues.push(ValidationIssue::new("scheduling.schedule_timeout_secs", "must be greater than zero"));
        }
        if s.ack_timeout_secs == 0 {
            issues.push(ValidationIssue::new("scheduling.ack_timeout_secs", "must be greater than zero"));
        }
        if s.worker_heartbeat_window_secs == 0 {
            issues.push(ValidationIssue::new(
                "scheduling.worker_heartbeat_window_secs",
                "must be greater than zero",
            ));
        }
        if r.scan_interval_secs == 0 {
            issues.push(ValidationIssue::new("recovery.scan_interval_secs", "must be greater than zero"));
        }
        if r.scan_batch_size == 0 {
            issues.push(ValidationIssue::new("recovery.scan_batch_size", "must be greater than zero"));
        }
        if r.coordinator_stale_after_secs <= r.scan_interval_secs {
            issues.push(ValidationIssue::new(
                "recovery.coordinator_stale_after_secs",
                "must exceed recovery.scan_interval_secs or live coordinators look stale between heartbeats",
            ));
        }
        if self.store.query_timeout_secs == 0 {
            issues.push(ValidationIssue::new("store.query_timeout_secs", "must be greater than zero"));
        }
        if self.store.max_attempts == 0 {
            issues.push(ValidationIssue::new("store.max_attempts", "must be at least 1"));
        }
        let a = &self.analytics;
        if a.buffer_size == 0 {
            issues.push(ValidationIssue::new("analytics.buffer_size", "must be greater than zero"));
        }
        if a.batch_size == 0 || a.batch_size > a.buffer_size {
            issues.push(ValidationIssue::new(
                "analytics.batch_size",
                "must be between 1 and analytics.buffer_size",
            ));
        }
        if !matches!(
            self.logging.level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            issues.push(ValidationIssue::new(
                "logging.level",
                format!("unknown level '{}'", self.logging.level),
            ));
        }

        for (path, secs) in [
            ("scheduling.schedule_timeout_secs", s.schedule_timeout_secs),
            ("scheduling.ack_timeout_secs", s.ack_timeout_secs),
            ("scheduling.requeue_backoff_secs", s.requeue_backoff_secs),
            ("scheduling.worker_heartbeat_window_secs", s.worker_heartbeat_window_secs),
            ("recovery.scan_interval_secs", r.scan_interval_secs),
            ("recovery.coordinator_stale_after_secs", r.coordinator_stale_after_secs),
            ("store.query_timeout_secs", self.store.query_timeout_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                issues.push(ValidationIssue::new(
                    path,
                    format!("must be at most {MAX_DURATION_SECS} seconds"),
                ));
            }
        }
        if r.retention_days > MAX_RETENTION_DAYS {
            issues.push(ValidationIssue::new(
                "recovery.retention_days",
                format!("must be at most {MAX_RETENTION_DAYS}"),
            ));
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Assignment and step deadline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Poll interval of the assignment loop.
    #[serde(default = "default_assign_interval_ms")]
    pub assign_interval_ms: u64,
    /// Maximum runs considered per assignment pass.
    #[serde(default = "default_assign_batch_size")]
    pub assign_batch_size: u32,
    /// How long a run may sit in PENDING_ASSIGNMENT before it is requeued.
    #[serde(default = "default_schedule_timeout_secs")]
    pub schedule_timeout_secs: u64,
    /// How long a worker has to acknowledge an assignment.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    /// Requeues allowed before a run is failed.
    #[serde(default = "default_max_requeues")]
    pub max_requeues: u32,
    /// Delay before a requeued or rate-limited run is retried.
    #[serde(default = "default_requeue_backoff_secs")]
    pub requeue_backoff_secs: u64,
    /// Workers whose last heartbeat is older than this are not alive.
    #[serde(default = "default_worker_heartbeat_window_secs")]
    pub worker_heartbeat_window_secs: u64,
}

fn default_assign_interval_ms() -> u64 {
    250
}
fn default_assign_batch_size() -> u32 {
    100
}
fn default_schedule_timeout_secs() -> u64 {
    300
}
fn default_ack_timeout_secs() -> u64 {
    30
}
fn default_max_requeues() -> u32 {
    10
}
fn default_requeue_backoff_secs() -> u64 {
    5
}
fn default_worker_heartbeat_window_secs() -> u64 {
    30
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            assign_interval_ms: default_assign_interval_ms(),
            assign_batch_size: default_assign_batch_size(),
            schedule_timeout_secs: default_schedule_timeout_secs(),
            ack_timeout_secs: default_ack_timeout_secs(),
            max_requeues: default_max_requeues(),
            requeue_backoff_secs: default_requeue_backoff_secs(),
            worker_heartbeat_window_secs: default_worker_heartbeat_window_secs(),
        }
    }
}

impl SchedulingConfig {
    pub fn assign_interval(&self) -> Duration {
        Duration::from_millis(self.assign_interval_ms)
    }

    pub fn schedule_timeout(&self) -> chrono::Duration {
        bounded_seconds(self.schedule_timeout_secs)
    }

    pub fn ack_timeout(&self) -> chrono::Duration {
        bounded_seconds(self.ack_timeout_secs)
    }

    pub fn requeue_backoff(&self) -> chrono::Duration {
        bounded_seconds(self.requeue_backoff_secs)
    }

    pub fn worker_heartbeat_window(&self) -> chrono::Duration {
        bounded_seconds(self.worker_heartbeat_window_secs)
    }
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Recovery scanner cadence and coordinator liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Rows handled per scan responsibility per pass.
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: u32,
    /// Dispatchers and tickers silent for longer than this are stale.
    #[serde(default = "default_coordinator_stale_after_secs")]
    pub coordinator_stale_after_secs: u64,
    /// Terminal workflow runs older than this are soft-expired.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_scan_interval_secs() -> u64 {
    5
}
fn default_scan_batch_size() -> u32 {
    200
}
fn default_coordinator_stale_after_secs() -> u64 {
    60
}
fn default_retention_days() -> u32 {
    30
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            scan_batch_size: default_scan_batch_size(),
            coordinator_stale_after_secs: default_coordinator_stale_after_secs(),
            retention_days: default_retention_days(),
        }
    }
}

impl RecoveryConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn coordinator_stale_after(&self) -> chrono::Duration {
        bounded_seconds(self.coordinator_stale_after_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days.min(MAX_RETENTION_DAYS)))
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Bounds on store calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Per-call timeout. Timeouts are retryable.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// Attempts for transient failures, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_query_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    50
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            query_timeout_secs: default_query_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Analytics
// ---------------------------------------------------------------------------

/// Buffered analytics sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Records held in memory before new ones are dropped.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_buffer_size() -> usize {
    1024
}
fn default_batch_size() -> usize {
    100
}
fn default_flush_interval_ms() -> u64 {
    1000
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Fallback filter when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Bridge spans to OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            otel: false,
        }
    }
}
