use crate::types::OrchestratorState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{FleetError, FleetResult};
use fleet_session::storage::{file_stem, write_atomic};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info, warn};

/// Persisted form of one checkpoint. One file or record each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// `workflow_id[:conversation_id]:<micros>`.
    pub checkpoint_id: String,
    /// Run the snapshot belongs to.
    pub workflow_id: String,
    /// Conversation of the run, if any.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Round the run had reached.
    pub current_round: u32,
    /// Stall counter at snapshot time.
    pub stall_count: u32,
    /// Latest worker output at the time of the snapshot.
    #[serde(default)]
    pub last_response: String,
    /// Free-form run context (task, plan, observations).
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl Checkpoint {
    /// Snapshot `state` under `checkpoint_id`.
    pub fn from_state(
        checkpoint_id: String,
        timestamp: DateTime<Utc>,
        state: &OrchestratorState,
    ) -> Self {
        Self {
            checkpoint_id,
            workflow_id: state.workflow_id.clone(),
            conversation_id: state.conversation_id.clone(),
            timestamp,
            current_round: state.current_round,
            stall_count: state.stall_count,
            last_response: state.last_response.clone(),
            context: state.context.clone(),
        }
    }

    /// The orchestrator state to resume from.
    pub fn state(&self) -> OrchestratorState {
        OrchestratorState {
            workflow_id: self.workflow_id.clone(),
            conversation_id: self.conversation_id.clone(),
            current_round: self.current_round,
            stall_count: self.stall_count,
            last_response: self.last_response.clone(),
            context: self.context.clone(),
        }
    }

    /// Listing entry without the context payload. `path` is left unset.
    pub fn metadata(&self) -> CheckpointMetadata {
        CheckpointMetadata {
            checkpoint_id: self.checkpoint_id.clone(),
            workflow_id: self.workflow_id.clone(),
            conversation_id: self.conversation_id.clone(),
            timestamp: self.timestamp,
            current_round: self.current_round,
            stall_count: self.stall_count,
            path: None,
        }
    }
}

/// What `list` returns: enough to pick a checkpoint, without its context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Id to pass to `load` or `delete`.
    pub checkpoint_id: String,
    /// Run the snapshot belongs to.
    pub workflow_id: String,
    /// Conversation of the run, if any.
    pub conversation_id: Option<String>,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Round the run had reached.
    pub current_round: u32,
    /// Stall counter at snapshot time.
    pub stall_count: u32,
    /// File holding the checkpoint, for file-backed services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Durable storage for [`OrchestratorState`] snapshots.
#[async_trait]
pub trait CheckpointService: Send + Sync {
    /// Persist a new checkpoint. Never overwrites an earlier one.
    async fn save(&self, state: &OrchestratorState) -> FleetResult<String>;

    /// Newest first, optionally restricted to one workflow. Unreadable
    /// entries are skipped.
    async fn list(&self, workflow_id: Option<&str>) -> FleetResult<Vec<CheckpointMetadata>>;

    /// Restore the state saved under `checkpoint_id`.
    async fn load(&self, checkpoint_id: &str) -> FleetResult<OrchestratorState>;

    /// Idempotent.
    async fn delete(&self, checkpoint_id: &str) -> FleetResult<()>;

    /// Remove every checkpoint.
    async fn clear(&self) -> FleetResult<()>;

    /// Most recent checkpoint for a workflow and conversation.
    async fn latest(
        &self,
        workflow_id: &str,
        conversation_id: Option<&str>,
    ) -> FleetResult<Option<CheckpointMetadata>> {
        Ok(self
            .list(Some(workflow_id))
            .await?
            .into_iter()
            .find(|m| m.conversation_id.as_deref() == conversation_id))
    }
}

/// Hands out strictly increasing microsecond stamps, so two saves in the
/// same microsecond still get distinct ids and a stable order.
#[derive(Debug, Default)]
struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    fn tick(&self) -> (i64, DateTime<Utc>) {
        let now = Utc::now().timestamp_micros();
        let prev = match self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            }) {
            Ok(prev) | Err(prev) => prev,
        };
        let micros = now.max(prev + 1);
        let timestamp = DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now);
        (micros, timestamp)
    }
}

/// `workflow_id[:conversation_id]:<micros>`.
fn checkpoint_id(state: &OrchestratorState, micros: i64) -> String {
    match &state.conversation_id {
        Some(conversation_id) => format!("{}:{conversation_id}:{micros}", state.workflow_id),
        None => format!("{}:{micros}", state.workflow_id),
    }
}

fn sort_newest_first(items: &mut [CheckpointMetadata]) {
    items.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.checkpoint_id.cmp(&a.checkpoint_id))
    });
}

/// Process-local checkpoints. Lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointService {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
    clock: MonotonicClock,
}

impl InMemoryCheckpointService {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointService for InMemoryCheckpointService {
    async fn save(&self, state: &OrchestratorState) -> FleetResult<String> {
        let (micros, timestamp) = self.clock.tick();
        let id = checkpoint_id(state, micros);
        let checkpoint = Checkpoint::from_state(id.clone(), timestamp, state);
        self.checkpoints.write().insert(id.clone(), checkpoint);
        debug!(checkpoint_id = %id, round = state.current_round, "Checkpoint saved");
        Ok(id)
    }

    async fn list(&self, workflow_id: Option<&str>) -> FleetResult<Vec<CheckpointMetadata>> {
        let mut items: Vec<_> = self
            .checkpoints
            .read()
            .values()
            .filter(|c| workflow_id.is_none_or(|wf| c.workflow_id == wf))
            .map(Checkpoint::metadata)
            .collect();
        sort_newest_first(&mut items);
        Ok(items)
    }

    async fn load(&self, checkpoint_id: &str) -> FleetResult<OrchestratorState> {
        self.checkpoints
            .read()
            .get(checkpoint_id)
            .map(Checkpoint::state)
            .ok_or_else(|| {
                FleetError::ResourceNotFound(format!("Checkpoint not found: {checkpoint_id}"))
            })
    }

    async fn delete(&self, checkpoint_id: &str) -> FleetResult<()> {
        self.checkpoints.write().remove(checkpoint_id);
        Ok(())
    }

    async fn clear(&self) -> FleetResult<()> {
        self.checkpoints.write().clear();
        Ok(())
    }
}

/// One JSON file per checkpoint under a shared directory.
///
/// Writers for different workflows never contend: each save lands in its
/// own file via temp-file + rename.
#[derive(Debug)]
pub struct FileCheckpointService {
    dir: PathBuf,
    clock: MonotonicClock,
}

impl FileCheckpointService {
    /// Open `dir`, creating it when missing.
    pub async fn new(dir: PathBuf) -> FleetResult<Self> {
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            FleetError::Checkpoint(format!(
                "Cannot create checkpoint directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self {
            dir,
            clock: MonotonicClock::default(),
        })
    }

    /// Directory the checkpoint files live in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, checkpoint_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(checkpoint_id)))
    }

    async fn checkpoint_files(&self) -> FleetResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let visible = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.'));
            if visible && path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

async fn read_checkpoint(path: &Path) -> FleetResult<Checkpoint> {
    let raw = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}

#[async_trait]
impl CheckpointService for FileCheckpointService {
    async fn save(&self, state: &OrchestratorState) -> FleetResult<String> {
        let (micros, timestamp) = self.clock.tick();
        let id = checkpoint_id(state, micros);
        let checkpoint = Checkpoint::from_state(id.clone(), timestamp, state);
        let body = serde_json::to_vec_pretty(&checkpoint)?;
        write_atomic(&self.path(&id), &body)
            .await
            .map_err(|e| FleetError::Checkpoint(format!("Failed to save checkpoint {id}: {e}")))?;
        info!(
            checkpoint_id = %id,
            workflow_id = %state.workflow_id,
            round = state.current_round,
            "Checkpoint saved"
        );
        Ok(id)
    }

    async fn list(&self, workflow_id: Option<&str>) -> FleetResult<Vec<CheckpointMetadata>> {
        let mut items = Vec::new();
        for path in self.checkpoint_files().await? {
            match read_checkpoint(&path).await {
                Ok(checkpoint) => {
                    if workflow_id.is_none_or(|wf| checkpoint.workflow_id == wf) {
                        items.push(CheckpointMetadata {
                            path: Some(path),
                            ..checkpoint.metadata()
                        });
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint");
                }
            }
        }
        sort_newest_first(&mut items);
        Ok(items)
    }

    async fn load(&self, checkpoint_id: &str) -> FleetResult<OrchestratorState> {
        let path = self.path(checkpoint_id);
        match tokio::fs::read(&path).await {
            Ok(raw) => {
                let checkpoint: Checkpoint = serde_json::from_slice(&raw).map_err(|e| {
                    FleetError::Checkpoint(format!("Corrupt checkpoint {checkpoint_id}: {e}"))
                })?;
                Ok(checkpoint.state())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                FleetError::ResourceNotFound(format!("Checkpoint not found: {checkpoint_id}")),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, checkpoint_id: &str) -> FleetResult<()> {
        match tokio::fs::remove_file(self.path(checkpoint_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> FleetResult<()> {
        for path in self.checkpoint_files().await? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_state() -> OrchestratorState {
        let mut state = OrchestratorState::new("wf-1", Some("conv-9".into()));
        state.current_round = 4;
        state.stall_count = 2;
        state.last_response = "partial answer".into();
        state.set_context("plan", "1. look\n2. answer");
        state.set_context("observations", json!(["a", "b"]));
        state
    }

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let service = InMemoryCheckpointService::new();
        let state = sample_state();
        let id = service.save(&state).await.unwrap();
        assert!(id.starts_with("wf-1:conv-9:"));
        assert_eq!(service.load(&id).await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_same_workflow_gets_new_checkpoints() {
        let service = InMemoryCheckpointService::new();
        let mut state = sample_state();
        let first = service.save(&state).await.unwrap();
        state.current_round = 5;
        let second = service.save(&state).await.unwrap();
        assert_ne!(first, second);

        let listed = service.list(Some("wf-1")).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].checkpoint_id, second);
        assert_eq!(listed[0].current_round, 5);
        assert_eq!(service.load(&first).await.unwrap().current_round, 4);
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let service = InMemoryCheckpointService::new();
        assert!(matches!(
            service.load("nope").await,
            Err(FleetError::ResourceNotFound(_))
        ));
        service.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn test_latest_matches_conversation() {
        let service = InMemoryCheckpointService::new();
        let with_conv = sample_state();
        let without_conv = OrchestratorState::new("wf-1", None);
        let a = service.save(&with_conv).await.unwrap();
        let b = service.save(&without_conv).await.unwrap();

        let latest = service.latest("wf-1", Some("conv-9")).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, a);
        let latest = service.latest("wf-1", None).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, b);
        assert!(service.latest("wf-2", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_service_skips_corrupt_entries() {
        let dir = tempfile::tempdir().unwrap();
        let service = FileCheckpointService::new(dir.path().to_path_buf())
            .await
            .unwrap();
        let id = service.save(&sample_state()).await.unwrap();
        tokio::fs::write(dir.path().join("garbage.json"), b"{not json")
            .await
            .unwrap();

        let listed = service.list(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].checkpoint_id, id);
        assert_eq!(listed[0].path.as_deref(), Some(service.path(&id).as_path()));

        service.clear().await.unwrap();
        assert!(service.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listing_reports_file_location() {
        let dir = tempfile::tempdir().unwrap();
        let service = FileCheckpointService::new(dir.path().to_path_buf())
            .await
            .unwrap();
        let id = service.save(&sample_state()).await.unwrap();

        let listed = service.list(Some("wf-1")).await.unwrap();
        let path = listed[0].path.clone().unwrap();
        assert_eq!(path.parent().unwrap(), dir.path());
        let micros = id.rsplit(':').next().unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            format!("wf-1%3Aconv-9%3A{micros}.json")
        );
        let raw = tokio::fs::read(&path).await.unwrap();
        let saved: Checkpoint = serde_json::from_slice(&raw).unwrap();
        assert_eq!(saved.checkpoint_id, id);

        let json = serde_json::to_value(&listed[0]).unwrap();
        assert!(json["path"].is_string());

        let memory = InMemoryCheckpointService::new();
        memory.save(&sample_state()).await.unwrap();
        let listed = memory.list(None).await.unwrap();
        assert!(listed[0].path.is_none());
        assert!(serde_json::to_value(&listed[0]).unwrap().get("path").is_none());
    }

    #[test]
    fn test_clock_is_strictly_increasing() {
        let clock = MonotonicClock::default();
        let mut last = 0;
        for _ in 0..1000 {
            let (micros, _) = clock.tick();
            assert!(micros > last);
            last = micros;
        }
    }
}
