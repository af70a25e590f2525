//! Buffered, best-effort analytics for terminal-state transitions.
//!
//! The engine hands records to an [`AnalyticsHandle`], which never blocks:
//! when the bounded buffer is full the record is dropped and counted. A
//! background task drains the buffer into an [`AnalyticsSink`] in batches,
//! flushing on size or on a timer. Sink failures lose the batch and are
//! logged; nothing in the engine reads analytics back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use taskloom_types::config::AnalyticsConfig;
use taskloom_types::event::AnalyticsRecord;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error("analytics sink write failed: {0}")]
    Write(String),
}

/// Append-only destination for analytics records.
pub trait AnalyticsSink: Send + Sync + 'static {
    fn write_batch(
        &self,
        records: &[AnalyticsRecord],
    ) -> impl std::future::Future<Output = Result<(), AnalyticsError>> + Send;
}

/// Cheap, cloneable front of the analytics buffer.
#[derive(Debug, Clone)]
pub struct AnalyticsHandle {
    sender: Option<mpsc::Sender<AnalyticsRecord>>,
    dropped: Arc<AtomicU64>,
}

impl AnalyticsHandle {
    /// A handle that discards everything.
    pub fn disabled() -> Self {
        Self {
            sender: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Fire-and-forget append.
    pub fn record(&self, record: AnalyticsRecord) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(e) = sender.try_send(record) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(dropped_total = total, reason = %e, "analytics record dropped");
        }
    }

    /// Records lost to a full or closed buffer.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Start the flush task. Cancelling `cancel` drains what is buffered,
/// flushes once more and ends the task.
pub fn spawn_buffered<S: AnalyticsSink>(
    sink: S,
    config: &AnalyticsConfig,
    cancel: CancellationToken,
) -> (AnalyticsHandle, JoinHandle<()>) {
    if !config.enabled {
        return (AnalyticsHandle::disabled(), tokio::spawn(async {}));
    }

    let (sender, mut receiver) = mpsc::channel(config.buffer_size.max(1));
    let handle = AnalyticsHandle {
        sender: Some(sender),
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let batch_size = config.batch_size.max(1);
    let flush_every = Duration::from_millis(config.flush_interval_ms.max(1));

    let task = tokio::spawn(async move {
        let mut batch: Vec<AnalyticsRecord> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(flush_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    while let Ok(record) = receiver.try_recv() {
                        batch.push(record);
                    }
                    flush(&sink, &mut batch).await;
                    break;
                }
                maybe = receiver.recv() => match maybe {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= batch_size {
                            flush(&sink, &mut batch).await;
                        }
                    }
                    None => {
                        flush(&sink, &mut batch).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    flush(&sink, &mut batch).await;
                }
            }
        }
        tracing::debug!("analytics flusher stopped");
    });

    (handle, task)
}

async fn flush<S: AnalyticsSink>(sink: &S, batch: &mut Vec<AnalyticsRecord>) {
    if batch.is_empty() {
        return;
    }
    if let Err(e) = sink.write_batch(batch).await {
        tracing::warn!(error = %e, lost = batch.len(), "analytics batch lost");
    }
    batch.clear();
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use taskloom_types::event::AnalyticsKind;
    use uuid::Uuid;

    use super::*;

    #[derive(Clone, Default)]
    struct MemorySink {
        batches: Arc<Mutex<Vec<usize>>>,
    }

    impl AnalyticsSink for MemorySink {
        async fn write_batch(&self, records: &[AnalyticsRecord]) -> Result<(), AnalyticsError> {
            self.batches.lock().unwrap().push(records.len());
            Ok(())
        }
    }

    fn record() -> AnalyticsRecord {
        AnalyticsRecord {
            kind: AnalyticsKind::StepRunFinished,
            resource_id: Uuid::now_v7(),
            workflow_run_id: Uuid::now_v7(),
            status: "succeeded".to_string(),
            error: None,
            occurred_at: Utc::now(),
        }
    }

    fn config(buffer_size: usize, batch_size: usize) -> AnalyticsConfig {
        AnalyticsConfig {
            enabled: true,
            buffer_size,
            batch_size,
            flush_interval_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn test_flushes_full_batches_and_drains_on_cancel() {
        let sink = MemorySink::default();
        let cancel = CancellationToken::new();
        let (handle, task) = spawn_buffered(sink.clone(), &config(64, 2), cancel.clone());

        for _ in 0..5 {
            handle.record(record());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        let batches = sink.batches.lock().unwrap().clone();
        assert_eq!(batches.iter().sum::<usize>(), 5);
        assert!(batches.iter().all(|n| *n <= 2));
        assert_eq!(handle.dropped(), 0);
    }

    #[tokio::test]
    async fn test_overload_drops_instead_of_blocking() {
        // Built by hand so no flusher drains the single-slot buffer.
        let (sender, _receiver) = mpsc::channel(1);
        let handle = AnalyticsHandle {
            sender: Some(sender),
            dropped: Arc::new(AtomicU64::new(0)),
        };

        handle.record(record());
        handle.record(record());
        handle.record(record());
        assert_eq!(handle.dropped(), 2);
    }

    #[test]
    fn test_disabled_handle_discards() {
        let handle = AnalyticsHandle::disabled();
        handle.record(record());
        assert_eq!(handle.dropped(), 0);
    }
}
