//! Approval types for human-in-the-loop (HITL) workflows.
//!
//! These types live in `fleet-core` so that both `fleet-orchestrator` (which
//! implements the approval gate) and `fleet-gateway` (which implements the
//! HTTP approval handler) can share them without circular deps.

use crate::{FleetError, FleetResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request sent to a human reviewer before a side-effecting operation runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique id used to deliver the decision back.
    pub request_id: String,
    /// Category of the guarded operation, e.g. `agent_invocation` or `code_execution`.
    pub operation_type: String,
    /// Agent whose action is being guarded.
    pub agent_name: String,
    /// Human-readable summary of what is about to happen.
    pub operation: String,
    /// Structured context for the reviewer.
    #[serde(default)]
    pub details: serde_json::Value,
    /// Code about to be executed, when there is any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ApprovalRequest {
    /// A request with a fresh id and no details.
    pub fn new(
        operation_type: impl Into<String>,
        agent_name: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            operation_type: operation_type.into(),
            agent_name: agent_name.into(),
            operation: operation.into(),
            details: serde_json::Value::Null,
            code: None,
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Attach the code under review.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Lifecycle status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for a reviewer.
    Pending,
    /// Cleared to proceed.
    Approved,
    /// Must not proceed.
    Rejected,
    /// Proceed, but with caller-supplied replacement parameters.
    #[serde(alias = "modified")]
    RevisionRequested,
}

impl ApprovalStatus {
    /// Anything but `Pending`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// The decision made by a reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    /// Outcome chosen by the reviewer.
    pub status: ApprovalStatus,
    /// Reason given by the reviewer. May be empty.
    #[serde(default)]
    pub feedback: String,
    /// Replacement parameters for a `RevisionRequested` decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<serde_json::Map<String, serde_json::Value>>,
    /// Who decided.
    pub reviewed_by: String,
    /// When the decision was made.
    pub reviewed_at: DateTime<Utc>,
}

impl ApprovalDecision {
    /// Approve without feedback.
    pub fn approved(reviewed_by: impl Into<String>) -> Self {
        Self::with_status(ApprovalStatus::Approved, "", reviewed_by)
    }

    /// Reject with a reason.
    pub fn rejected(feedback: impl Into<String>, reviewed_by: impl Into<String>) -> Self {
        Self::with_status(ApprovalStatus::Rejected, feedback, reviewed_by)
    }

    /// Proceed with replacement parameters.
    pub fn revise(
        revisions: serde_json::Map<String, serde_json::Value>,
        reviewed_by: impl Into<String>,
    ) -> Self {
        let mut decision =
            Self::with_status(ApprovalStatus::RevisionRequested, "", reviewed_by);
        decision.revisions = Some(revisions);
        decision
    }

    fn with_status(
        status: ApprovalStatus,
        feedback: impl Into<String>,
        reviewed_by: impl Into<String>,
    ) -> Self {
        Self {
            status,
            feedback: feedback.into(),
            revisions: None,
            reviewed_by: reviewed_by.into(),
            reviewed_at: Utc::now(),
        }
    }
}

/// A request together with its current status.
///
/// Starts `Pending` and transitions exactly once to a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// The guarded operation.
    pub request: ApprovalRequest,
    /// Mirrors `decision.status` once resolved.
    pub status: ApprovalStatus,
    /// Set once the record is resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ApprovalDecision>,
}

impl ApprovalRecord {
    /// A fresh, unresolved record.
    pub fn pending(request: ApprovalRequest) -> Self {
        Self {
            request,
            status: ApprovalStatus::Pending,
            decision: None,
        }
    }

    /// Apply a decision. Fails if the record is already resolved or the
    /// decision itself is `Pending`.
    pub fn resolve(&mut self, decision: ApprovalDecision) -> FleetResult<()> {
        if self.status.is_terminal() {
            return Err(FleetError::Approval(format!(
                "Approval {} already resolved as {:?}",
                self.request.request_id, self.status
            )));
        }
        if !decision.status.is_terminal() {
            return Err(FleetError::Approval(format!(
                "Approval {} cannot transition to pending",
                self.request.request_id
            )));
        }
        self.status = decision.status;
        self.decision = Some(decision);
        Ok(())
    }
}

/// Channel through which approval requests are sent and decisions are received.
/// Implementations can be HTTP endpoints, CLI prompts, callbacks, etc.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Wait for a reviewer's decision on `request`.
    async fn request_approval(&self, request: ApprovalRequest) -> FleetResult<ApprovalDecision>;
}
