//! Conversation and execution-history stores plus the session manager.
//!
//! Stores come in an in-memory flavour and a one-JSON-file-per-entry flavour.
//! The [`SessionManager`] bounds concurrent runs and fans their events out.

/// Conversation transcripts.
pub mod conversation;
/// Per-run execution records.
pub mod history;
/// Concurrent run tracking and event fan-out.
pub mod manager;
/// Filesystem helpers for the file-backed stores.
pub mod storage;

pub use conversation::{
    Conversation, ConversationStore, FileConversationStore, InMemoryConversationStore,
};
pub use history::{ExecutionRecord, FileHistoryStore, HistoryStore, InMemoryHistoryStore};
pub use manager::{RunHandle, SessionConfig, SessionManager};
