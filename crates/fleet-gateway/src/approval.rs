use async_trait::async_trait;
use fleet_core::{ApprovalDecision, ApprovalHandler, ApprovalRequest, FleetError, FleetResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};

struct Pending {
    request: ApprovalRequest,
    reply: oneshot::Sender<ApprovalDecision>,
}

/// Approval handler for HTTP reviewers.
///
/// Each request is parked until a decision arrives through
/// [`HttpApprovalHandler::respond`] (wired to `POST /v1/approvals/{id}`) or
/// the timeout passes, which counts as a rejection.
pub struct HttpApprovalHandler {
    pending: Arc<RwLock<HashMap<String, Pending>>>,
    timeout: Duration,
}

/// Drop requests whose run stopped waiting, e.g. because it was cancelled.
fn prune_abandoned(pending: &mut HashMap<String, Pending>) {
    pending.retain(|request_id, p| {
        let waiting = !p.reply.is_closed();
        if !waiting {
            info!(request_id = %request_id, "Dropping approval request abandoned by its run");
        }
        waiting
    });
}

impl HttpApprovalHandler {
    /// Park requests for at most `timeout` before rejecting them.
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
            timeout,
        }
    }

    /// Deliver a reviewer's decision to the waiting run.
    pub async fn respond(&self, request_id: &str, decision: ApprovalDecision) -> FleetResult<()> {
        let removed = {
            let mut pending = self.pending.write().await;
            prune_abandoned(&mut pending);
            pending.remove(request_id)
        };
        let Some(pending) = removed else {
            warn!(request_id = %request_id, "No pending approval for this request id");
            return Err(FleetError::ResourceNotFound(format!(
                "approval request {request_id}"
            )));
        };
        if pending.reply.send(decision).is_err() {
            warn!(request_id = %request_id, "Approval decision sent but the run stopped waiting");
            return Err(FleetError::Approval(format!(
                "Approval request {request_id} is no longer waiting"
            )));
        }
        info!(request_id = %request_id, "Approval decision delivered");
        Ok(())
    }

    /// Requests still waiting for a reviewer.
    pub async fn pending(&self) -> Vec<ApprovalRequest> {
        let mut pending = self.pending.write().await;
        prune_abandoned(&mut pending);
        pending.values().map(|p| p.request.clone()).collect()
    }

    /// Number of requests still waiting for a reviewer.
    pub async fn pending_count(&self) -> usize {
        let mut pending = self.pending.write().await;
        prune_abandoned(&mut pending);
        pending.len()
    }
}

#[async_trait]
impl ApprovalHandler for HttpApprovalHandler {
    async fn request_approval(&self, request: ApprovalRequest) -> FleetResult<ApprovalDecision> {
        let request_id = request.request_id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(
            request_id.clone(),
            Pending {
                request,
                reply: tx,
            },
        );
        info!(request_id = %request_id, "Waiting for HTTP approval");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(decision)) => Ok(decision),
            Ok(Err(_)) => {
                self.pending.write().await.remove(&request_id);
                Ok(ApprovalDecision::rejected(
                    "Approval channel closed unexpectedly",
                    "system",
                ))
            }
            Err(_) => {
                self.pending.write().await.remove(&request_id);
                warn!(request_id = %request_id, timeout_secs = self.timeout.as_secs(), "Approval timed out");
                Ok(ApprovalDecision::rejected(
                    format!("Timed out after {}s", self.timeout.as_secs()),
                    "system",
                ))
            }
        }
    }
}
