//! The engine handle shared by every lifecycle, scheduling and recovery
//! operation.
//!
//! `Engine` owns no mutable state of its own: every decision is read from and
//! written back to the store through conditional writes, so any number of
//! engine instances (in one process or many) can run against the same store.
//! Operations are grouped by concern in `impl` blocks spread across the
//! `lifecycle`, `scheduling`, `workflow` and `recovery` modules.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use taskloom_types::config::EngineConfig;
use taskloom_types::error::RepositoryError;
use taskloom_types::event::{AnalyticsKind, AnalyticsRecord, EngineEvent};
use uuid::Uuid;

use crate::analytics::AnalyticsHandle;
use crate::error::EngineError;
use crate::event::{CallbackRegistry, EventBus};
use crate::repository::Store;
use crate::service::hash::ContentHasher;
use crate::store_retry::{RetryPolicy, with_retry};

/// Default capacity of the engine event bus.
const EVENT_BUS_CAPACITY: usize = 1024;

/// A handle to the workflow engine, generic over the persistent store.
pub struct Engine<S: Store> {
    store: S,
    config: Arc<EngineConfig>,
    hasher: Arc<dyn ContentHasher>,
    events: EventBus,
    callbacks: CallbackRegistry,
    analytics: AnalyticsHandle,
    retry: RetryPolicy,
}

impl<S: Store> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            hasher: self.hasher.clone(),
            events: self.events.clone(),
            callbacks: self.callbacks.clone(),
            analytics: self.analytics.clone(),
            retry: self.retry,
        }
    }
}

impl<S: Store> Engine<S> {
    pub fn new(store: S, config: EngineConfig, hasher: Arc<dyn ContentHasher>) -> Self {
        let retry = RetryPolicy::from_config(&config.store);
        Self {
            store,
            config: Arc::new(config),
            hasher,
            events: EventBus::new(EVENT_BUS_CAPACITY),
            callbacks: CallbackRegistry::new(),
            analytics: AnalyticsHandle::disabled(),
            retry,
        }
    }

    /// Route terminal-state records to a running analytics flusher.
    pub fn with_analytics(mut self, analytics: AnalyticsHandle) -> Self {
        self.analytics = analytics;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub fn analytics(&self) -> &AnalyticsHandle {
        &self.analytics
    }

    pub(crate) fn hasher(&self) -> &dyn ContentHasher {
        self.hasher.as_ref()
    }

    /// Run one store call under the engine's timeout and transient-retry policy.
    pub(crate) async fn persist<T, F, Fut>(&self, op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RepositoryError>>,
    {
        Ok(with_retry(&self.retry, op).await?)
    }

    /// Publish on the bus and hand creation events to the callbacks.
    pub(crate) fn emit(&self, event: EngineEvent) {
        self.callbacks.notify(&event);
        self.events.publish(event);
    }

    pub(crate) fn record(
        &self,
        kind: AnalyticsKind,
        resource_id: Uuid,
        workflow_run_id: Uuid,
        status: impl serde::Serialize,
        error: Option<String>,
        at: DateTime<Utc>,
    ) {
        let status = match serde_json::to_value(status) {
            Ok(serde_json::Value::String(s)) => s,
            Ok(other) => other.to_string(),
            Err(_) => String::new(),
        };
        self.analytics.record(AnalyticsRecord {
            kind,
            resource_id,
            workflow_run_id,
            status,
            error,
            occurred_at: at,
        });
    }
}

impl<S: Store> std::fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("events", &self.events)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}
