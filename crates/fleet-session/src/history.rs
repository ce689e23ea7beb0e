use crate::storage::{file_stem, write_atomic};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{FleetError, FleetResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

/// What one workflow run was asked and what it answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Workflow the record belongs to.
    pub workflow_id: String,
    /// Conversation the run was part of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Caller correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Task text.
    pub task: String,
    /// Execution pattern the router chose.
    pub pattern: String,
    /// Final answer.
    pub answer: String,
    /// Graph nodes visited, in order.
    #[serde(default)]
    pub trace: Vec<String>,
    /// 0–10, filled in later by the background evaluator.
    #[serde(default)]
    pub quality_score: Option<f64>,
    /// When the run finished.
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// A record without trace or score, stamped now.
    pub fn new(
        workflow_id: impl Into<String>,
        task: impl Into<String>,
        pattern: impl Into<String>,
        answer: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            conversation_id: None,
            correlation_id: None,
            task: task.into(),
            pattern: pattern.into(),
            answer: answer.into(),
            trace: Vec::new(),
            quality_score: None,
            created_at: Utc::now(),
        }
    }
}

/// Persistence for [`ExecutionRecord`]s, keyed by workflow id.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Insert or replace the record for its workflow id.
    async fn put(&self, record: ExecutionRecord) -> FleetResult<()>;
    /// `None` when the workflow has no record.
    async fn get(&self, workflow_id: &str) -> FleetResult<Option<ExecutionRecord>>;
    /// Set the quality score of an existing record.
    async fn update_quality(&self, workflow_id: &str, score: f64) -> FleetResult<()>;
    /// All records, newest first.
    async fn list(&self) -> FleetResult<Vec<ExecutionRecord>>;
}

/// Process-local history. Lost on restart.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    records: RwLock<HashMap<String, ExecutionRecord>>,
}

impl InMemoryHistoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn put(&self, record: ExecutionRecord) -> FleetResult<()> {
        self.records
            .write()
            .insert(record.workflow_id.clone(), record);
        Ok(())
    }

    async fn get(&self, workflow_id: &str) -> FleetResult<Option<ExecutionRecord>> {
        Ok(self.records.read().get(workflow_id).cloned())
    }

    async fn update_quality(&self, workflow_id: &str, score: f64) -> FleetResult<()> {
        let mut records = self.records.write();
        let record = records
            .get_mut(workflow_id)
            .ok_or_else(|| FleetError::ResourceNotFound(format!("execution {workflow_id}")))?;
        record.quality_score = Some(score);
        Ok(())
    }

    async fn list(&self) -> FleetResult<Vec<ExecutionRecord>> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

/// One JSON file per execution record.
pub struct FileHistoryStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileHistoryStore {
    /// Open `dir`, creating it when missing.
    pub async fn new(dir: PathBuf) -> FleetResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn record_path(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(workflow_id)))
    }

    async fn read_path(&self, path: PathBuf) -> FleetResult<ExecutionRecord> {
        let data = tokio::fs::read_to_string(&path).await?;
        serde_json::from_str(&data).map_err(|e| {
            FleetError::Session(format!(
                "Failed to parse execution record {}: {e}",
                path.display()
            ))
        })
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn put(&self, record: ExecutionRecord) -> FleetResult<()> {
        let _guard = self.write_lock.lock().await;
        let json = serde_json::to_vec_pretty(&record)?;
        write_atomic(&self.record_path(&record.workflow_id), &json).await
    }

    async fn get(&self, workflow_id: &str) -> FleetResult<Option<ExecutionRecord>> {
        let path = self.record_path(workflow_id);
        if !path.exists() {
            return Ok(None);
        }
        self.read_path(path).await.map(Some)
    }

    async fn update_quality(&self, workflow_id: &str, score: f64) -> FleetResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(workflow_id);
        if !path.exists() {
            return Err(FleetError::ResourceNotFound(format!(
                "execution {workflow_id}"
            )));
        }
        let mut record = self.read_path(path.clone()).await?;
        record.quality_score = Some(score);
        let json = serde_json::to_vec_pretty(&record)?;
        write_atomic(&path, &json).await
    }

    async fn list(&self) -> FleetResult<Vec<ExecutionRecord>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }
            match self.read_path(path).await {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "Skipping unreadable execution record"),
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_in_memory_update_quality() {
        let store = InMemoryHistoryStore::new();
        store
            .put(ExecutionRecord::new("wf-1", "task", "simple", "answer"))
            .await
            .unwrap();
        store.update_quality("wf-1", 8.0).await.unwrap();
        assert_eq!(
            store.get("wf-1").await.unwrap().unwrap().quality_score,
            Some(8.0)
        );
        assert!(matches!(
            store.update_quality("wf-2", 1.0).await.unwrap_err(),
            FleetError::ResourceNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_file_store_lists_newest_first_and_skips_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = FileHistoryStore::new(tmp.path().to_path_buf()).await.unwrap();

        let mut older = ExecutionRecord::new("wf-old", "a", "simple", "x");
        older.created_at = Utc::now() - chrono::Duration::seconds(60);
        store.put(older).await.unwrap();
        store
            .put(ExecutionRecord::new("wf-new", "b", "complex", "y"))
            .await
            .unwrap();
        tokio::fs::write(tmp.path().join("garbage.json"), "{not json")
            .await
            .unwrap();

        let records = store.list().await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.workflow_id.as_str()).collect();
        assert_eq!(ids, vec!["wf-new", "wf-old"]);

        store.update_quality("wf-old", 3.5).await.unwrap();
        let old = store.get("wf-old").await.unwrap().unwrap();
        assert_eq!(old.quality_score, Some(3.5));
        assert_eq!(old.task, "a");
    }
}
