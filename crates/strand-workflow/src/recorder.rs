use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use strand_core::error::Result;
use strand_core::traits::RunRecorder;
use strand_core::types::{NodeRecord, RunId, RunRecord};

/// JSONL run recorder.
///
/// Appends one JSON object per line to `{log_dir}/{run_id}.jsonl`. The file
/// is append-only and flushed after every entry, so a crash mid-run leaves
/// every earlier line intact.
pub struct JsonlRecorder {
    log_dir: PathBuf,
    // Serialises appends from parallel branches of the same run.
    write_lock: Mutex<()>,
}

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Entry<'a> {
    Run(&'a RunRecord),
    Node(&'a NodeRecord),
}

impl JsonlRecorder {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Path of the log file for `run_id`.
    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    async fn append(&self, run_id: &RunId, entry: Entry<'_>) -> Result<()> {
        let line = format!("{}\n", serde_json::to_string(&entry)?);
        let path = self.path_for(run_id);

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut writer = tokio::io::BufWriter::new(file);
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        debug!(path = %path.display(), "Recorded entry");
        Ok(())
    }
}

impl RunRecorder for JsonlRecorder {
    fn record_run(&self, record: RunRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.append(&record.run_id, Entry::Run(&record)).await })
    }

    fn record_node(&self, record: NodeRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.append(&record.run_id, Entry::Node(&record)).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;
    use std::collections::HashMap;
    use strand_core::types::RunStatus;

    fn run_record(run_id: &RunId, status: RunStatus) -> RunRecord {
        RunRecord {
            run_id: run_id.clone(),
            workflow_type: "workflow".into(),
            status,
            inputs: HashMap::new(),
            outputs: None,
            error: None,
            elapsed_ms: None,
            timestamp: Utc::now(),
        }
    }

    fn lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = JsonlRecorder::new(dir.path().join("runs"));
        let run_id = RunId::from_str("r-1");

        recorder.record_run(run_record(&run_id, RunStatus::Running)).await.unwrap();
        recorder
            .record_node(NodeRecord {
                run_id: run_id.clone(),
                node_id: "llm".into(),
                node_type: "llm".into(),
                status: RunStatus::Succeeded,
                output: Some(serde_json::json!({"text": "hi"})),
                error: None,
                elapsed_ms: 12,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        recorder.record_run(run_record(&run_id, RunStatus::Succeeded)).await.unwrap();

        let entries = lines(&recorder.path_for(&run_id));
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["record"], "run");
        assert_eq!(entries[0]["status"], "running");
        assert_eq!(entries[1]["record"], "node");
        assert_eq!(entries[1]["output"]["text"], "hi");
        assert_eq!(entries[2]["status"], "succeeded");
    }

    #[tokio::test]
    async fn test_runs_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = JsonlRecorder::new(dir.path());
        let a = RunId::from_str("a");
        let b = RunId::from_str("b");
        recorder.record_run(run_record(&a, RunStatus::Running)).await.unwrap();
        recorder.record_run(run_record(&b, RunStatus::Running)).await.unwrap();
        assert_eq!(lines(&recorder.path_for(&a)).len(), 1);
        assert_eq!(lines(&recorder.path_for(&b)).len(), 1);
    }

    #[tokio::test]
    async fn test_unwritable_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let recorder = JsonlRecorder::new(blocker.join("nested"));
        let result = recorder
            .record_run(run_record(&RunId::from_str("r"), RunStatus::Running))
            .await;
        assert!(result.is_err());
    }
}
