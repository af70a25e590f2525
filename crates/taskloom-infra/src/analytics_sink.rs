//! JSON-lines analytics sink.
//!
//! Appends one line per [`AnalyticsRecord`] to `analytics.jsonl` in the data
//! directory. Each batch is serialized up front and written with a single
//! append so a failed batch never leaves half its records behind.

use std::path::{Path, PathBuf};

use taskloom_core::analytics::{AnalyticsError, AnalyticsSink};
use taskloom_types::event::AnalyticsRecord;
use tokio::io::AsyncWriteExt;

const ANALYTICS_FILE: &str = "analytics.jsonl";

#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Sink writing `analytics.jsonl` inside `data_dir`.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(ANALYTICS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AnalyticsSink for JsonLinesSink {
    async fn write_batch(&self, records: &[AnalyticsRecord]) -> Result<(), AnalyticsError> {
        let mut buf = Vec::with_capacity(records.len() * 160);
        for record in records {
            serde_json::to_writer(&mut buf, record).map_err(|e| AnalyticsError::Write(e.to_string()))?;
            buf.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AnalyticsError::Write(format!("{}: {e}", self.path.display())))?;
        file.write_all(&buf)
            .await
            .map_err(|e| AnalyticsError::Write(e.to_string()))?;
        file.flush().await.map_err(|e| AnalyticsError::Write(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use taskloom_core::analytics::spawn_buffered;
    use taskloom_types::config::AnalyticsConfig;
    use taskloom_types::event::AnalyticsKind;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;

    fn record(status: &str) -> AnalyticsRecord {
        AnalyticsRecord {
            kind: AnalyticsKind::WorkflowRunFinished,
            resource_id: Uuid::now_v7(),
            workflow_run_id: Uuid::now_v7(),
            status: status.to_string(),
            error: None,
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_batches_append_one_line_per_record() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::in_data_dir(tmp.path());
        sink.write_batch(&[record("succeeded"), record("failed")]).await.unwrap();
        sink.write_batch(&[record("cancelled")]).await.unwrap();

        let content = tokio::fs::read_to_string(sink.path()).await.unwrap();
        let statuses: Vec<String> = content
            .lines()
            .map(|line| serde_json::from_str::<AnalyticsRecord>(line).unwrap().status)
            .collect();
        assert_eq!(statuses, vec!["succeeded", "failed", "cancelled"]);
    }

    #[tokio::test]
    async fn test_unwritable_path_reports_error() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::new(tmp.path().join("missing").join("analytics.jsonl"));
        let err = sink.write_batch(&[record("failed")]).await.unwrap_err();
        assert!(matches!(err, AnalyticsError::Write(_)));
    }

    #[tokio::test]
    async fn test_buffered_handle_flushes_to_file_on_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::in_data_dir(tmp.path());
        let cancel = CancellationToken::new();
        let (handle, task) = spawn_buffered(sink.clone(), &AnalyticsConfig::default(), cancel.clone());

        for _ in 0..3 {
            handle.record(record("succeeded"));
        }
        cancel.cancel();
        task.await.unwrap();

        let content = tokio::fs::read_to_string(sink.path()).await.unwrap();
        assert_eq!(content.lines().count(), 3);
    }
}
