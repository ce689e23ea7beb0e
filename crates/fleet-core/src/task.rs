use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A unit of user work submitted to the engine. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// What the user asked for.
    pub text: String,
    /// Conversation to load history from and append to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Echoed on every event of the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Caller-supplied extras, e.g. a `history` hint.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Allow cached agent responses. On by default.
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
}

fn default_use_cache() -> bool {
    true
}

impl Task {
    /// A task with no conversation or metadata.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            conversation_id: None,
            correlation_id: None,
            metadata: HashMap::new(),
            use_cache: default_use_cache(),
        }
    }

    /// Attach the task to a conversation.
    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Set the correlation id.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Conversation history hint supplied by the caller under `metadata.history`.
    pub fn history_hint(&self) -> Option<&str> {
        self.metadata.get("history").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_defaults_from_json() {
        let task: Task = serde_json::from_str(r#"{"text":"summarize this"}"#).unwrap();
        assert_eq!(task.text, "summarize this");
        assert!(task.use_cache);
        assert!(task.conversation_id.is_none());
        assert!(task.metadata.is_empty());
    }

    #[test]
    fn test_history_hint() {
        let task = Task::new("next step").with_metadata("history", "user asked about rust".into());
        assert_eq!(task.history_hint(), Some("user asked about rust"));
    }
}
