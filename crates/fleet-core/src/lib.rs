//! Core types and error definitions for the Fleet orchestration engine.
//!
//! This crate provides the foundational types shared across all Fleet crates:
//! the error taxonomy, the submitted [`Task`], the request-scoped [`RunContext`],
//! the wire-level [`WorkflowEvent`], conversation messages, and the
//! human-in-the-loop approval contract.
//!
//! # Main types
//!
//! - [`FleetError`]: Unified error enum for all Fleet subsystems.
//! - [`FleetResult`]: Convenience alias for `Result<T, FleetError>`.
//! - [`Task`]: An immutable unit of user work submitted to the engine.
//! - [`RunContext`]: Per-request execution scope threaded through every call.
//! - [`WorkflowEvent`]: The only type crossing the engine boundary.
//! - [`RunsWorkflow`]: Collaborator boundary implemented by the engine.
//! - [`Message`] / [`Role`]: Conversation transcript entries.

/// Approval types for human-in-the-loop workflows.
pub mod approval;
/// Request-scoped execution context and cancellation.
pub mod context;
/// Error taxonomy.
pub mod error;
/// Wire events emitted by a workflow run.
pub mod event;
/// Conversation messages.
pub mod message;
/// Submitted tasks.
pub mod task;
/// The `RunsWorkflow` collaborator boundary.
pub mod workflow;

pub use approval::{
    ApprovalDecision, ApprovalHandler, ApprovalRecord, ApprovalRequest, ApprovalStatus,
};
pub use context::RunContext;
pub use tokio_util::sync::CancellationToken;
pub use error::{FleetError, FleetResult};
pub use event::{EventKind, WorkflowEvent, DONE_SENTINEL};
pub use message::{Message, Role};
pub use task::Task;
pub use workflow::{EventStream, RunsWorkflow};
