use crate::storage::{decode_file_stem, file_stem, write_atomic};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{FleetError, FleetResult, Message};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// An append-only, ordered list of messages owned by one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Caller-chosen id.
    pub id: String,
    /// Oldest first.
    pub messages: Vec<Message>,
    /// When the conversation was created.
    pub created_at: DateTime<Utc>,
    /// Last append or annotation.
    pub updated_at: DateTime<Utc>,
    /// Free-form extras.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Conversation {
    /// An empty conversation.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    /// Append a message and bump `updated_at`.
    pub fn add_message(&mut self, message: Message) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    /// Number of messages.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Attach a metadata value to one message. Content is never rewritten.
    pub fn annotate(
        &mut self,
        message_id: Uuid,
        key: &str,
        value: serde_json::Value,
    ) -> FleetResult<()> {
        let message = self
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| {
                FleetError::ResourceNotFound(format!(
                    "message {message_id} in conversation {}",
                    self.id
                ))
            })?;
        message.metadata.insert(key.to_string(), value);
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Persistence for conversation transcripts.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Store a new conversation. Fails if the id is taken.
    async fn create(&self, conversation: &Conversation) -> FleetResult<()>;
    /// `None` when no conversation has that id.
    async fn get(&self, id: &str) -> FleetResult<Option<Conversation>>;
    /// Append a message, creating the conversation if it does not exist yet.
    async fn append_message(&self, id: &str, message: Message) -> FleetResult<()>;
    /// Attach metadata to one stored message.
    async fn annotate_message(
        &self,
        id: &str,
        message_id: Uuid,
        key: &str,
        value: serde_json::Value,
    ) -> FleetResult<()>;
    /// Idempotent.
    async fn delete(&self, id: &str) -> FleetResult<()>;
    /// Every conversation id, sorted.
    async fn list(&self) -> FleetResult<Vec<String>>;
}

/// Map-backed store. Readers get clones, so a concurrent writer can never
/// expose a half-applied mutation.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl InMemoryConversationStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create(&self, conversation: &Conversation) -> FleetResult<()> {
        self.conversations
            .write()
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> FleetResult<Option<Conversation>> {
        Ok(self.conversations.read().get(id).cloned())
    }

    async fn append_message(&self, id: &str, message: Message) -> FleetResult<()> {
        self.conversations
            .write()
            .entry(id.to_string())
            .or_insert_with(|| Conversation::new(id))
            .add_message(message);
        Ok(())
    }

    async fn annotate_message(
        &self,
        id: &str,
        message_id: Uuid,
        key: &str,
        value: serde_json::Value,
    ) -> FleetResult<()> {
        let mut conversations = self.conversations.write();
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| FleetError::ResourceNotFound(format!("conversation {id}")))?;
        conversation.annotate(message_id, key, value)
    }

    async fn delete(&self, id: &str) -> FleetResult<()> {
        self.conversations.write().remove(id);
        Ok(())
    }

    async fn list(&self) -> FleetResult<Vec<String>> {
        let mut ids: Vec<String> = self.conversations.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One JSON file per conversation.
///
/// Read-modify-write operations are serialized through a store-wide lock;
/// files are replaced atomically.
pub struct FileConversationStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileConversationStore {
    /// Open `dir`, creating it when missing.
    pub async fn new(dir: PathBuf) -> FleetResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn conversation_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(id)))
    }

    async fn read(&self, id: &str) -> FleetResult<Option<Conversation>> {
        let path = self.conversation_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let conversation: Conversation = serde_json::from_str(&data).map_err(|e| {
            FleetError::Session(format!("Failed to parse conversation {id}: {e}"))
        })?;
        Ok(Some(conversation))
    }

    async fn write(&self, conversation: &Conversation) -> FleetResult<()> {
        let json = serde_json::to_vec_pretty(conversation)?;
        write_atomic(&self.conversation_path(&conversation.id), &json).await
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn create(&self, conversation: &Conversation) -> FleetResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write(conversation).await
    }

    async fn get(&self, id: &str) -> FleetResult<Option<Conversation>> {
        self.read(id).await
    }

    async fn append_message(&self, id: &str, message: Message) -> FleetResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut conversation = self
            .read(id)
            .await?
            .unwrap_or_else(|| Conversation::new(id));
        conversation.add_message(message);
        self.write(&conversation).await
    }

    async fn annotate_message(
        &self,
        id: &str,
        message_id: Uuid,
        key: &str,
        value: serde_json::Value,
    ) -> FleetResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut conversation = self
            .read(id)
            .await?
            .ok_or_else(|| FleetError::ResourceNotFound(format!("conversation {id}")))?;
        conversation.annotate(message_id, key, value)?;
        self.write(&conversation).await
    }

    async fn delete(&self, id: &str) -> FleetResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.conversation_path(id);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn list(&self) -> FleetResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = name.strip_suffix(".json").and_then(decode_file_stem) {
                    if !name.starts_with('.') {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_in_memory_append_creates_conversation() {
        let store = InMemoryConversationStore::new();
        store
            .append_message("c1", Message::user("hello"))
            .await
            .unwrap();
        store
            .append_message("c1", Message::assistant("hi"))
            .await
            .unwrap();

        let conv = store.get("c1").await.unwrap().unwrap();
        assert_eq!(conv.message_count(), 2);
        assert_eq!(conv.messages[1].content, "hi");
        assert_eq!(store.list().await.unwrap(), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_annotate_missing_message_is_not_found() {
        let store = InMemoryConversationStore::new();
        store.append_message("c1", Message::user("x")).await.unwrap();
        let err = store
            .annotate_message("c1", Uuid::new_v4(), "quality", 5.into())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::ResourceNotFound(_)));

        let err = store
            .annotate_message("nope", Uuid::new_v4(), "quality", 5.into())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_file_store_round_trip_with_colon_ids() {
        let tmp = TempDir::new().unwrap();
        let store = FileConversationStore::new(tmp.path().to_path_buf())
            .await
            .unwrap();

        let msg = Message::assistant("answer");
        let msg_id = msg.id;
        store.append_message("team:42", Message::user("q")).await.unwrap();
        store.append_message("team:42", msg).await.unwrap();
        store
            .annotate_message("team:42", msg_id, "quality_score", 7.5.into())
            .await
            .unwrap();

        let conv = store.get("team:42").await.unwrap().unwrap();
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.messages[1].metadata["quality_score"], 7.5);
        assert_eq!(store.list().await.unwrap(), vec!["team:42"]);

        store.delete("team:42").await.unwrap();
        store.delete("team:42").await.unwrap();
        assert!(store.get("team:42").await.unwrap().is_none());
    }
}
