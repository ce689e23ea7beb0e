use chrono::{DateTime, Utc};
use fleet_core::{
    CancellationToken, EventStream, FleetError, FleetResult, RunContext, RunsWorkflow, Task,
    WorkflowEvent,
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Limits for concurrently running workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Runs beyond this limit are rejected immediately with `OverCapacity`.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_workflows: usize,
    /// Per-workflow broadcast buffer. Slow consumers that fall further behind
    /// than this skip events.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_max_concurrent() -> usize {
    16
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// The caller's end of a started run.
#[derive(Debug)]
pub struct RunHandle {
    /// Workflow the handle follows.
    pub workflow_id: String,
    /// Live events of the run.
    pub events: broadcast::Receiver<WorkflowEvent>,
    /// Cancels the run.
    pub cancellation: CancellationToken,
}

impl RunHandle {
    /// Next event, or `None` once the run has finished. Lagged events are skipped.
    pub async fn next_event(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(workflow_id = %self.workflow_id, skipped, "Consumer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct ActiveRun {
    sender: broadcast::Sender<WorkflowEvent>,
    cancellation: CancellationToken,
    started_at: DateTime<Utc>,
    task: Option<JoinHandle<()>>,
}

/// Bounds concurrently running workflows and fans their events out to
/// any number of consumers.
///
/// When every consumer of a run has gone away the run is cancelled; the
/// engine observes this at its next round boundary.
pub struct SessionManager {
    workflow: Arc<dyn RunsWorkflow>,
    config: SessionConfig,
    active: Arc<Mutex<HashMap<String, ActiveRun>>>,
}

impl SessionManager {
    /// A manager in front of `workflow`.
    pub fn new(workflow: Arc<dyn RunsWorkflow>, config: SessionConfig) -> Self {
        Self {
            workflow,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a run with a context derived from the task.
    pub async fn start(&self, task: Task) -> FleetResult<RunHandle> {
        let ctx = RunContext::for_task(&task);
        self.start_with(task, ctx).await
    }

    /// Start a run with a caller-built context.
    pub async fn start_with(&self, task: Task, ctx: RunContext) -> FleetResult<RunHandle> {
        let workflow_id = ctx.workflow_id.clone();
        let (sender, events) = broadcast::channel(self.config.channel_capacity.max(1));

        {
            let mut active = self.active.lock();
            let limit = self.config.max_concurrent_workflows;
            if active.len() >= limit {
                warn!(active = active.len(), limit, "Rejecting workflow: over capacity");
                return Err(FleetError::OverCapacity {
                    active: active.len(),
                    limit,
                });
            }
            if active.contains_key(&workflow_id) {
                return Err(FleetError::Session(format!(
                    "Workflow {workflow_id} is already running"
                )));
            }
            active.insert(
                workflow_id.clone(),
                ActiveRun {
                    sender: sender.clone(),
                    cancellation: ctx.cancellation.clone(),
                    started_at: Utc::now(),
                    task: None,
                },
            );
        }

        let cancellation = ctx.cancellation.clone();
        let stream = match self.workflow.run(task, ctx).await {
            Ok(stream) => stream,
            Err(e) => {
                self.active.lock().remove(&workflow_id);
                return Err(e);
            }
        };

        let handle = tokio::spawn(forward(
            stream,
            sender,
            cancellation.clone(),
            self.active.clone(),
            workflow_id.clone(),
        ));
        if let Some(run) = self.active.lock().get_mut(&workflow_id) {
            run.task = Some(handle);
        }

        info!(workflow_id = %workflow_id, "Workflow started");
        Ok(RunHandle {
            workflow_id,
            events,
            cancellation,
        })
    }

    /// Attach another consumer to a running workflow. Events already sent are not replayed.
    pub fn subscribe(&self, workflow_id: &str) -> FleetResult<broadcast::Receiver<WorkflowEvent>> {
        self.active
            .lock()
            .get(workflow_id)
            .map(|run| run.sender.subscribe())
            .ok_or_else(|| FleetError::ResourceNotFound(format!("workflow {workflow_id}")))
    }

    /// Cancel a run. `ResourceNotFound` when it is not active.
    pub fn cancel(&self, workflow_id: &str) -> FleetResult<()> {
        let active = self.active.lock();
        let run = active
            .get(workflow_id)
            .ok_or_else(|| FleetError::ResourceNotFound(format!("workflow {workflow_id}")))?;
        run.cancellation.cancel();
        info!(workflow_id = %workflow_id, "Workflow cancelled by request");
        Ok(())
    }

    /// Ids of running workflows, oldest first.
    pub fn active_workflows(&self) -> Vec<String> {
        let active = self.active.lock();
        let mut runs: Vec<_> = active
            .iter()
            .map(|(id, run)| (run.started_at, id.clone()))
            .collect();
        runs.sort();
        runs.into_iter().map(|(_, id)| id).collect()
    }

    /// Number of runs in flight.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Configured concurrency limit.
    pub fn limit(&self) -> usize {
        self.config.max_concurrent_workflows
    }

    /// Cancel every active run and wait up to `grace` for each to wind down.
    pub async fn shutdown(&self, grace: Duration) {
        let handles: Vec<_> = {
            let mut active = self.active.lock();
            active
                .values_mut()
                .filter_map(|run| {
                    run.cancellation.cancel();
                    run.task.take()
                })
                .collect()
        };
        info!(runs = handles.len(), "Shutting down session manager");
        for handle in handles {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("Workflow did not finish within the shutdown grace period");
            }
        }
    }
}

async fn forward(
    mut stream: EventStream,
    sender: broadcast::Sender<WorkflowEvent>,
    cancellation: CancellationToken,
    active: Arc<Mutex<HashMap<String, ActiveRun>>>,
    workflow_id: String,
) {
    let mut terminated = false;
    while let Some(event) = stream.next().await {
        terminated |= event.is_terminal();
        if sender.send(event).is_err() && !cancellation.is_cancelled() {
            info!(workflow_id = %workflow_id, "All consumers disconnected, cancelling run");
            cancellation.cancel();
        }
    }
    if !terminated {
        warn!(workflow_id = %workflow_id, "Run ended without a terminal event");
        let _ = sender.send(WorkflowEvent::error("Workflow ended without a result", None));
    }
    active.lock().remove(&workflow_id);
    info!(workflow_id = %workflow_id, "Workflow finished");
}
