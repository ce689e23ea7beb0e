use async_trait::async_trait;
use fleet_core::{
    ApprovalDecision, ApprovalHandler, ApprovalRecord, ApprovalRequest, ApprovalStatus,
    CancellationToken, FleetResult,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of passing an operation through the gate.
///
/// Rejection is an ordinary outcome: the caller records it as a degraded
/// observation and carries on.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// Run the operation as requested.
    Proceed,
    /// Skip the operation.
    Rejected {
        /// Reviewer's reason, possibly empty.
        feedback: String,
    },
    /// Proceed with reviewer-supplied replacement parameters.
    Revised {
        /// Replacement parameters, e.g. `instruction` or `prompt`.
        revisions: Map<String, Value>,
        /// Reviewer's note.
        feedback: String,
    },
}

impl GateOutcome {
    /// False only for a rejection.
    pub fn may_proceed(&self) -> bool {
        !matches!(self, GateOutcome::Rejected { .. })
    }
}

/// Settled records kept per gate when no limit is given.
pub const DEFAULT_RECORD_LIMIT: usize = 256;

/// Records of one gate: every pending request plus the most recent settled ones.
#[derive(Default)]
struct Records {
    by_id: HashMap<String, ApprovalRecord>,
    settled: VecDeque<String>,
}

/// Guards side-effecting agent invocations behind an [`ApprovalHandler`].
///
/// Without a handler the gate lets everything through. That is only ever
/// chosen explicitly, through [`ApprovalGate::disabled`]. Pending requests
/// are always kept; settled ones are evicted oldest first past the record
/// limit.
pub struct ApprovalGate {
    handler: Option<Arc<dyn ApprovalHandler>>,
    records: Mutex<Records>,
    record_limit: usize,
}

impl ApprovalGate {
    /// Gate every request through `handler`.
    pub fn new(handler: Arc<dyn ApprovalHandler>) -> Self {
        Self {
            handler: Some(handler),
            records: Mutex::new(Records::default()),
            record_limit: DEFAULT_RECORD_LIMIT,
        }
    }

    /// A gate that lets everything through unrecorded.
    pub fn disabled() -> Self {
        Self {
            handler: None,
            records: Mutex::new(Records::default()),
            record_limit: DEFAULT_RECORD_LIMIT,
        }
    }

    /// Keep at most `limit` settled records.
    pub fn with_record_limit(mut self, limit: usize) -> Self {
        self.record_limit = limit;
        self
    }

    /// Whether a handler is consulted.
    pub fn is_enabled(&self) -> bool {
        self.handler.is_some()
    }

    /// Record the request as pending and wait for the handler's decision.
    ///
    /// A cancelled run stops waiting at once and the request counts as
    /// rejected.
    pub async fn request(
        &self,
        request: ApprovalRequest,
        cancellation: &CancellationToken,
    ) -> GateOutcome {
        let Some(handler) = &self.handler else {
            return GateOutcome::Proceed;
        };
        let request_id = request.request_id.clone();
        info!(
            request_id = %request_id,
            agent = %request.agent_name,
            operation_type = %request.operation_type,
            "Approval requested"
        );
        self.records
            .lock()
            .by_id
            .insert(request_id.clone(), ApprovalRecord::pending(request.clone()));

        let decision = tokio::select! {
            result = handler.request_approval(request) => match result {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "Approval handler failed, rejecting");
                    ApprovalDecision::rejected(format!("Approval handler failed: {e}"), "system")
                }
            },
            _ = cancellation.cancelled() => {
                info!(request_id = %request_id, "Run cancelled while awaiting approval");
                ApprovalDecision::rejected("Run cancelled while awaiting approval", "system")
            }
        };
        self.settle(&request_id, decision)
    }

    /// Variant for call paths that cannot await.
    ///
    /// Inside a running tokio runtime blocking would risk a deadlock, so the
    /// operation proceeds unguarded with a warning. Outside a runtime the
    /// handler runs on a private current-thread runtime.
    pub fn request_blocking(&self, request: ApprovalRequest) -> GateOutcome {
        if self.handler.is_none() {
            return GateOutcome::Proceed;
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            warn!(
                request_id = %request.request_id,
                agent = %request.agent_name,
                "Approval requested from a non-awaitable path inside a runtime; proceeding unguarded"
            );
            return GateOutcome::Proceed;
        }
        match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime.block_on(self.request(request, &CancellationToken::new())),
            Err(e) => {
                warn!(error = %e, "Cannot start approval runtime; proceeding unguarded");
                GateOutcome::Proceed
            }
        }
    }

    fn settle(&self, request_id: &str, decision: ApprovalDecision) -> GateOutcome {
        let decision = if decision.status == ApprovalStatus::Pending {
            warn!(request_id = %request_id, "Handler returned a pending decision, rejecting");
            ApprovalDecision::rejected("No decision was made", decision.reviewed_by)
        } else {
            decision
        };

        {
            let mut records = self.records.lock();
            if let Some(record) = records.by_id.get_mut(request_id) {
                match record.resolve(decision.clone()) {
                    Ok(()) => records.settled.push_back(request_id.to_string()),
                    Err(e) => {
                        warn!(request_id = %request_id, error = %e, "Approval record not updated");
                    }
                }
            }
            while records.settled.len() > self.record_limit {
                if let Some(evicted) = records.settled.pop_front() {
                    records.by_id.remove(&evicted);
                }
            }
        }
        info!(
            request_id = %request_id,
            status = ?decision.status,
            reviewed_by = %decision.reviewed_by,
            "Approval decided"
        );

        match decision.status {
            ApprovalStatus::Approved | ApprovalStatus::Pending => GateOutcome::Proceed,
            ApprovalStatus::Rejected => GateOutcome::Rejected {
                feedback: decision.feedback,
            },
            ApprovalStatus::RevisionRequested => GateOutcome::Revised {
                revisions: decision.revisions.unwrap_or_default(),
                feedback: decision.feedback,
            },
        }
    }

    /// Pending requests and the most recent settled ones, in no particular order.
    pub fn records(&self) -> Vec<ApprovalRecord> {
        self.records.lock().by_id.values().cloned().collect()
    }

    /// Look up one request, if it is still retained.
    pub fn record(&self, request_id: &str) -> Option<ApprovalRecord> {
        self.records.lock().by_id.get(request_id).cloned()
    }
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("enabled", &self.is_enabled())
            .field("records", &self.records.lock().by_id.len())
            .finish()
    }
}

/// Approves everything. For unattended deployments that still want a record
/// of every guarded operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApproveHandler;

#[async_trait]
impl ApprovalHandler for AutoApproveHandler {
    async fn request_approval(&self, _request: ApprovalRequest) -> FleetResult<ApprovalDecision> {
        Ok(ApprovalDecision::approved("auto"))
    }
}

/// Decides through a plain function.
pub struct CallbackApprovalHandler {
    callback: Box<dyn Fn(&ApprovalRequest) -> ApprovalDecision + Send + Sync>,
}

impl CallbackApprovalHandler {
    /// Decide every request with `callback`.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&ApprovalRequest) -> ApprovalDecision + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl ApprovalHandler for CallbackApprovalHandler {
    async fn request_approval(&self, request: ApprovalRequest) -> FleetResult<ApprovalDecision> {
        Ok((self.callback)(&request))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fleet_core::FleetError;

    fn request() -> ApprovalRequest {
        ApprovalRequest::new("agent_invocation", "deployer", "Deploy to production")
    }

    struct FailingHandler;

    #[async_trait]
    impl ApprovalHandler for FailingHandler {
        async fn request_approval(&self, _: ApprovalRequest) -> FleetResult<ApprovalDecision> {
            Err(FleetError::Approval("reviewer unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_disabled_gate_proceeds() {
        let gate = ApprovalGate::disabled();
        assert_eq!(gate.request(request(), &CancellationToken::new()).await, GateOutcome::Proceed);
        assert!(gate.records().is_empty());
    }

    #[tokio::test]
    async fn test_auto_approve_records_decision() {
        let gate = ApprovalGate::new(Arc::new(AutoApproveHandler));
        let req = request();
        let id = req.request_id.clone();
        assert_eq!(gate.request(req, &CancellationToken::new()).await, GateOutcome::Proceed);
        let record = gate.record(&id).unwrap();
        assert_eq!(record.status, ApprovalStatus::Approved);
        assert_eq!(record.decision.unwrap().reviewed_by, "auto");
    }

    #[tokio::test]
    async fn test_rejection_is_an_outcome() {
        let gate = ApprovalGate::new(Arc::new(CallbackApprovalHandler::new(|_| {
            ApprovalDecision::rejected("not today", "alice")
        })));
        let outcome = gate.request(request(), &CancellationToken::new()).await;
        assert_eq!(
            outcome,
            GateOutcome::Rejected {
                feedback: "not today".into()
            }
        );
        assert!(!outcome.may_proceed());
    }

    #[tokio::test]
    async fn test_revision_carries_parameters() {
        let gate = ApprovalGate::new(Arc::new(CallbackApprovalHandler::new(|_| {
            let mut revisions = Map::new();
            revisions.insert("prompt".into(), "Deploy to staging".into());
            ApprovalDecision::revise(revisions, "bob")
        })));
        match gate.request(request(), &CancellationToken::new()).await {
            GateOutcome::Revised { revisions, .. } => {
                assert_eq!(revisions["prompt"], "Deploy to staging");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_error_rejects() {
        let gate = ApprovalGate::new(Arc::new(FailingHandler));
        let req = request();
        let id = req.request_id.clone();
        assert!(matches!(
            gate.request(req, &CancellationToken::new()).await,
            GateOutcome::Rejected { .. }
        ));
        assert_eq!(gate.record(&id).unwrap().status, ApprovalStatus::Rejected);
    }

    #[tokio::test]
    async fn test_blocking_inside_runtime_does_not_deadlock() {
        let gate = ApprovalGate::new(Arc::new(CallbackApprovalHandler::new(|_| {
            ApprovalDecision::rejected("no", "alice")
        })));
        assert_eq!(gate.request_blocking(request()), GateOutcome::Proceed);
    }

    #[test]
    fn test_blocking_outside_runtime_consults_handler() {
        let gate = ApprovalGate::new(Arc::new(CallbackApprovalHandler::new(|_| {
            ApprovalDecision::rejected("no", "alice")
        })));
        assert!(matches!(
            gate.request_blocking(request()),
            GateOutcome::Rejected { .. }
        ));
    }

    struct SilentReviewer;

    #[async_trait]
    impl ApprovalHandler for SilentReviewer {
        async fn request_approval(&self, _: ApprovalRequest) -> FleetResult<ApprovalDecision> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancellation_releases_a_waiting_request() {
        let gate = Arc::new(ApprovalGate::new(Arc::new(SilentReviewer)));
        let token = CancellationToken::new();
        let req = request();
        let id = req.request_id.clone();

        let waiting = {
            let gate = gate.clone();
            let token = token.clone();
            tokio::spawn(async move { gate.request(req, &token).await })
        };
        while gate.record(&id).is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(gate.record(&id).unwrap().status, ApprovalStatus::Pending);

        token.cancel();
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(1), waiting)
            .await
            .expect("gate kept waiting after cancellation")
            .unwrap();
        assert!(matches!(outcome, GateOutcome::Rejected { feedback } if feedback.contains("cancelled")));
        let record = gate.record(&id).unwrap();
        assert_eq!(record.status, ApprovalStatus::Rejected);
        assert_eq!(record.decision.unwrap().reviewed_by, "system");
    }

    #[tokio::test]
    async fn test_settled_records_stay_bounded() {
        let gate = ApprovalGate::new(Arc::new(AutoApproveHandler)).with_record_limit(3);
        let mut ids = Vec::new();
        for _ in 0..10 {
            let req = request();
            ids.push(req.request_id.clone());
            gate.request(req, &CancellationToken::new()).await;
        }
        assert_eq!(gate.records().len(), 3);
        assert!(gate.record(&ids[0]).is_none());
        assert!(gate.record(&ids[6]).is_none());
        for id in &ids[7..] {
            assert_eq!(gate.record(id).unwrap().status, ApprovalStatus::Approved);
        }
    }

    #[tokio::test]
    async fn test_pending_requests_are_never_evicted() {
        let gate = Arc::new(ApprovalGate::new(Arc::new(CallbackApprovalHandler::new(|_| {
            ApprovalDecision::approved("alice")
        })))
        .with_record_limit(1));
        let token = CancellationToken::new();
        // A settled record and a pending one: only settled records count
        // against the limit.
        gate.records
            .lock()
            .by_id
            .insert("held".into(), ApprovalRecord::pending(request()));
        gate.request(request(), &token).await;
        gate.request(request(), &token).await;
        assert_eq!(gate.records().len(), 2);
        assert_eq!(gate.record("held").unwrap().status, ApprovalStatus::Pending);
    }
}
