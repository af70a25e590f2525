//! Create-callback registry.
//!
//! Collaborators (alerting, telemetry) register callbacks that fire whenever
//! a workflow run or client event is created. Inline callbacks run on the
//! caller's task before it returns; detached ones run on a spawned task.
//! A failing callback is logged and never rolls back the creation.

use std::sync::{Arc, RwLock};

use taskloom_types::event::EngineEvent;

/// Error returned by a callback. Only ever logged.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CallbackError(pub String);

/// A create callback.
pub type CreateCallback = Arc<dyn Fn(&EngineEvent) -> Result<(), CallbackError> + Send + Sync>;

/// How a callback is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackMode {
    Inline,
    Detached,
}

#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: Arc<RwLock<Vec<(String, CallbackMode, CreateCallback)>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked for every creation event.
    pub fn register_create_callback<F>(&self, name: impl Into<String>, mode: CallbackMode, callback: F)
    where
        F: Fn(&EngineEvent) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        let mut callbacks = match self.callbacks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        callbacks.push((name.into(), mode, Arc::new(callback)));
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every callback for `event`. Non-creation events are ignored.
    pub fn notify(&self, event: &EngineEvent) {
        if !event.is_creation() {
            return;
        }
        for (name, mode, callback) in self.snapshot() {
            match mode {
                CallbackMode::Inline => run_callback(&name, &callback, event),
                CallbackMode::Detached => match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let event = event.clone();
                        handle.spawn(async move { run_callback(&name, &callback, &event) });
                    }
                    Err(_) => run_callback(&name, &callback, event),
                },
            }
        }
    }

    fn snapshot(&self) -> Vec<(String, CallbackMode, CreateCallback)> {
        match self.callbacks.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn run_callback(name: &str, callback: &CreateCallback, event: &EngineEvent) {
    if let Err(e) = callback(event) {
        tracing::warn!(callback = name, error = %e, "create callback failed");
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("callbacks", &self.len())
            .finish()
    }
}
