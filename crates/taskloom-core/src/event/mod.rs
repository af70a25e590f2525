//! Engine notifications.
//!
//! `EventBus` fans `EngineEvent`s out to asynchronous subscribers over a
//! `tokio::sync::broadcast` channel. `CallbackRegistry` holds synchronous
//! create callbacks. Neither can fail the transition that emitted the event.

pub mod bus;
pub mod callback;

pub use bus::{EventBus, RunSubscription};
pub use callback::{CallbackError, CallbackMode, CallbackRegistry, CreateCallback};
