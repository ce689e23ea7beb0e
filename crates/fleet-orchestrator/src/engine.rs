use crate::approval::{ApprovalGate, AutoApproveHandler};
use crate::bridge::{run_bridge, Aggregator};
use crate::checkpoint::{CheckpointService, FileCheckpointService, InMemoryCheckpointService};
use crate::classifier::Classifier;
use crate::config::{ApprovalMode, EngineConfig};
use crate::evaluator::{AgentScorer, BackgroundEvaluator, EvaluationTarget, HeuristicScorer, QualityScorer};
use crate::events::{stream_agent, EventSink, InternalEvent, Visibility};
use crate::graph::{resolve_role, GraphExecutor, GraphOutcome};
use crate::router::Pattern;
use async_trait::async_trait;
use fleet_agent::{Agent, AgentInput, AgentRegistry, AgentRole};
use fleet_core::{
    ApprovalHandler, EventStream, FleetError, FleetResult, Message, RunContext, RunsWorkflow,
    Task,
};
use fleet_session::{
    ConversationStore, ExecutionRecord, HistoryStore, InMemoryConversationStore,
    InMemoryHistoryStore,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Assembles a [`WorkflowEngine`] from configuration and collaborators.
///
/// Stores that are not supplied default to in-memory implementations.
pub struct EngineBuilder {
    config: EngineConfig,
    registry: AgentRegistry,
    conversations: Option<Arc<dyn ConversationStore>>,
    history: Option<Arc<dyn HistoryStore>>,
    checkpoints: Option<Arc<dyn CheckpointService>>,
    approval_handler: Option<Arc<dyn ApprovalHandler>>,
    scorer: Option<Arc<dyn QualityScorer>>,
}

impl EngineBuilder {
    /// Start from a config and the agents that serve it. Stores default to in-memory.
    pub fn new(config: EngineConfig, registry: AgentRegistry) -> Self {
        Self {
            config,
            registry,
            conversations: None,
            history: None,
            checkpoints: None,
            approval_handler: None,
            scorer: None,
        }
    }

    /// Use `store` for conversation transcripts.
    pub fn conversations(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversations = Some(store);
        self
    }

    /// Use `store` for execution records.
    pub fn history(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    /// Use `service` instead of the one `checkpoint` config would build.
    pub fn checkpoints(mut self, service: Arc<dyn CheckpointService>) -> Self {
        self.checkpoints = Some(service);
        self
    }

    /// Who answers approval requests.
    pub fn approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval_handler = Some(handler);
        self
    }

    /// Override the quality scorer picked from `evaluator` config.
    pub fn scorer(mut self, scorer: Arc<dyn QualityScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Validate the config and assemble the engine.
    pub async fn build(self) -> FleetResult<WorkflowEngine> {
        let config = self.config;
        config.validate(&self.registry)?;

        let gate = match (config.approval.mode, self.approval_handler) {
            (ApprovalMode::Disabled, handler) => {
                if handler.is_some() {
                    warn!("Approval handler supplied but approval mode is disabled; ignoring it");
                }
                ApprovalGate::disabled()
            }
            (ApprovalMode::Auto, Some(handler)) => ApprovalGate::new(handler),
            (ApprovalMode::Auto, None) => ApprovalGate::new(Arc::new(AutoApproveHandler)),
            (ApprovalMode::Required, Some(handler)) => ApprovalGate::new(handler),
            (ApprovalMode::Required, None) => {
                return Err(FleetError::Configuration(
                    "approval.mode = \"required\" needs an approval handler".into(),
                ));
            }
        };
        let gate = Arc::new(gate);

        let checkpoints: Option<Arc<dyn CheckpointService>> = match self.checkpoints {
            Some(service) => Some(service),
            None if !config.checkpoint.enabled => None,
            None => match &config.checkpoint.dir {
                Some(dir) => Some(Arc::new(FileCheckpointService::new(dir.clone()).await?)),
                None => Some(Arc::new(InMemoryCheckpointService::new())),
            },
        };
        let conversations = self
            .conversations
            .unwrap_or_else(|| Arc::new(InMemoryConversationStore::new()));
        let history = self
            .history
            .unwrap_or_else(|| Arc::new(InMemoryHistoryStore::new()));

        let classifier = Classifier::new(&config.classifier)?;
        let fast_path = match &config.roles.fast_path {
            Some(name) => self.registry.require(name)?,
            None => self
                .registry
                .participants()
                .first()
                .and_then(|d| self.registry.get(&d.name))
                .ok_or_else(|| FleetError::Configuration("No worker agent for the fast path".into()))?,
        };

        let evaluator = if config.evaluator.enabled {
            let judge = resolve_role(&self.registry, config.roles.judge.as_deref(), AgentRole::Judge);
            let scorer: Arc<dyn QualityScorer> = match (self.scorer, judge) {
                (Some(scorer), _) => scorer,
                (None, Some(judge)) if config.evaluator.use_judge => Arc::new(AgentScorer::new(judge)),
                _ => Arc::new(HeuristicScorer),
            };
            Some(BackgroundEvaluator::new(
                scorer,
                history.clone(),
                conversations.clone(),
            ))
        } else {
            None
        };

        let config = Arc::new(config);
        let registry = Arc::new(self.registry);
        let graph = GraphExecutor::new(config.clone(), registry.clone(), gate.clone(), checkpoints.clone())?;

        info!(
            agents = registry.len(),
            teams = config.teams.len(),
            approval = ?config.approval.mode,
            checkpoints = checkpoints.is_some(),
            "Workflow engine ready"
        );
        Ok(WorkflowEngine {
            inner: Arc::new(EngineInner {
                config,
                classifier,
                graph,
                fast_path,
                conversations,
                history,
                checkpoints,
                gate,
                evaluator,
            }),
        })
    }
}

/// The orchestration engine. Cheap to clone; every clone shares one set of
/// agents, stores, and background evaluations.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Arc<EngineConfig>,
    classifier: Classifier,
    graph: GraphExecutor,
    fast_path: Arc<dyn Agent>,
    conversations: Arc<dyn ConversationStore>,
    history: Arc<dyn HistoryStore>,
    checkpoints: Option<Arc<dyn CheckpointService>>,
    gate: Arc<ApprovalGate>,
    evaluator: Option<BackgroundEvaluator>,
}

/// What a finished run reports, however it got there.
struct RunSummary {
    answer: String,
    pattern: String,
    target_team: Option<String>,
    trace: Vec<String>,
    fast_path: bool,
    rounds: Option<u32>,
    stall_count: Option<u32>,
    termination: Option<String>,
    judge_score: Option<f64>,
}

impl RunSummary {
    fn from_graph(outcome: GraphOutcome) -> Self {
        let sup = outcome.supervisor.as_ref();
        Self {
            trace: outcome.trace_names(),
            answer: outcome.answer,
            pattern: outcome.decision.pattern.as_str().to_string(),
            target_team: Some(outcome.decision.target_team),
            fast_path: false,
            rounds: sup.map(|s| s.state.current_round),
            stall_count: sup.map(|s| s.state.stall_count),
            termination: sup.map(|s| s.reason.to_string()),
            judge_score: outcome.judge_score,
        }
    }

    fn metadata(&self, workflow_id: &str) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("workflow_id".into(), workflow_id.into());
        metadata.insert("pattern".into(), self.pattern.clone().into());
        metadata.insert("fast_path".into(), self.fast_path.into());
        metadata.insert(
            "trace".into(),
            Value::Array(self.trace.iter().cloned().map(Value::String).collect()),
        );
        if let Some(team) = &self.target_team {
            metadata.insert("target_team".into(), team.clone().into());
        }
        if let Some(rounds) = self.rounds {
            metadata.insert("rounds".into(), rounds.into());
        }
        if let Some(stalls) = self.stall_count {
            metadata.insert("stall_count".into(), stalls.into());
        }
        if let Some(termination) = &self.termination {
            metadata.insert("termination".into(), termination.clone().into());
        }
        if let Some(score) = self.judge_score {
            metadata.insert("judge_score".into(), score.into());
        }
        metadata
    }
}

impl WorkflowEngine {
    /// Shorthand for [`EngineBuilder::new`].
    pub fn builder(config: EngineConfig, registry: AgentRegistry) -> EngineBuilder {
        EngineBuilder::new(config, registry)
    }

    /// Config the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Checkpoint service, unless checkpoints are disabled.
    pub fn checkpoints(&self) -> Option<Arc<dyn CheckpointService>> {
        self.inner.checkpoints.clone()
    }

    /// Conversation store.
    pub fn conversations(&self) -> Arc<dyn ConversationStore> {
        self.inner.conversations.clone()
    }

    /// Execution-record store.
    pub fn history(&self) -> Arc<dyn HistoryStore> {
        self.inner.history.clone()
    }

    /// The gate guarding side-effecting agents.
    pub fn approval_gate(&self) -> Arc<ApprovalGate> {
        self.inner.gate.clone()
    }

    /// Whether `text` would take the fast path.
    pub fn is_fast_path(&self, text: &str) -> bool {
        self.inner.classifier.classify(text)
    }

    /// Continue a run from a saved checkpoint. The restored state decides the
    /// workflow and conversation ids; `ctx` contributes correlation and
    /// cancellation.
    pub async fn resume(&self, checkpoint_id: &str, ctx: RunContext) -> FleetResult<EventStream> {
        let checkpoints = self.inner.checkpoints.clone().ok_or_else(|| {
            FleetError::Configuration("Checkpoints are disabled for this engine".into())
        })?;
        let state = checkpoints.load(checkpoint_id).await?;
        let mut ctx = ctx;
        ctx.workflow_id = state.workflow_id.clone();
        ctx.conversation_id = state.conversation_id.clone();
        info!(
            workflow_id = %ctx.workflow_id,
            checkpoint_id = %checkpoint_id,
            round = state.current_round,
            "Resuming workflow from checkpoint"
        );

        let (sink, stream) = self.open_stream(&ctx);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let task = Task::new(state.context_str("task").unwrap_or_default());
            let result = inner
                .graph
                .resume(state, &ctx, &sink)
                .await
                .map(RunSummary::from_graph);
            inner.finish(&task, &ctx, result, &sink).await;
        });
        Ok(stream)
    }

    /// Wait for in-flight background evaluations.
    pub async fn drain_evaluations(&self) {
        if let Some(evaluator) = &self.inner.evaluator {
            evaluator.drain().await;
        }
    }

    /// Internal channel into a bridge task whose output is the returned stream.
    fn open_stream(&self, ctx: &RunContext) -> (EventSink, EventStream) {
        let capacity = self.inner.config.session.channel_capacity.max(1);
        let (sink, internal_rx) = EventSink::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        tokio::spawn(run_bridge(
            internal_rx,
            out_tx,
            Aggregator::new(ctx.correlation_id.clone()),
            ctx.cancellation.clone(),
        ));
        (sink, Box::pin(ReceiverStream::new(out_rx)))
    }
}

#[async_trait]
impl RunsWorkflow for WorkflowEngine {
    async fn run(&self, task: Task, ctx: RunContext) -> FleetResult<EventStream> {
        let mut ctx = ctx;
        if ctx.conversation_id.is_none() {
            ctx.conversation_id = task.conversation_id.clone();
        }
        if ctx.correlation_id.is_none() {
            ctx.correlation_id = task.correlation_id.clone();
        }
        let (sink, stream) = self.open_stream(&ctx);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.execute(task, ctx, sink).await;
        });
        Ok(stream)
    }
}

impl EngineInner {
    async fn execute(&self, task: Task, ctx: RunContext, sink: EventSink) {
        info!(
            workflow_id = %ctx.workflow_id,
            conversation_id = ?ctx.conversation_id,
            use_cache = task.use_cache,
            "Workflow started"
        );
        let history = self.load_history(&ctx).await;
        if let Some(conversation_id) = &ctx.conversation_id {
            if let Err(e) = self
                .conversations
                .append_message(conversation_id, Message::user(task.text.clone()))
                .await
            {
                warn!(workflow_id = %ctx.workflow_id, error = %e, "Failed to store user message");
            }
        }

        let result = if self.classifier.classify(&task.text) {
            info!(workflow_id = %ctx.workflow_id, "Fast path");
            self.fast_path(&task, history, &sink).await
        } else {
            self.graph
                .execute(&task, &ctx, &history, &sink)
                .await
                .map(RunSummary::from_graph)
        };
        self.finish(&task, &ctx, result, &sink).await;
    }

    async fn fast_path(
        &self,
        task: &Task,
        history: Vec<Message>,
        sink: &EventSink,
    ) -> FleetResult<RunSummary> {
        let input = AgentInput::new(task.text.clone()).with_history(history);
        let output = stream_agent(self.fast_path.as_ref(), input, sink, Visibility::Full).await?;
        Ok(RunSummary {
            answer: output.text,
            pattern: Pattern::Direct.as_str().to_string(),
            target_team: None,
            trace: Vec::new(),
            fast_path: true,
            rounds: None,
            stall_count: None,
            termination: None,
            judge_score: None,
        })
    }

    async fn load_history(&self, ctx: &RunContext) -> Vec<Message> {
        let Some(conversation_id) = &ctx.conversation_id else {
            return Vec::new();
        };
        match self.conversations.get(conversation_id).await {
            Ok(Some(conversation)) => conversation.messages,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(workflow_id = %ctx.workflow_id, error = %e, "Failed to load conversation history");
                Vec::new()
            }
        }
    }

    /// Persist the outcome, emit the terminal event, and schedule scoring.
    async fn finish(
        &self,
        task: &Task,
        ctx: &RunContext,
        result: FleetResult<RunSummary>,
        sink: &EventSink,
    ) {
        let summary = match result {
            Ok(summary) => summary,
            Err(e) => {
                error!(workflow_id = %ctx.workflow_id, error = %e, "Workflow failed");
                sink.emit(InternalEvent::Failed {
                    message: e.to_string(),
                    agent: None,
                })
                .await;
                return;
            }
        };

        let mut record = ExecutionRecord::new(
            ctx.workflow_id.clone(),
            task.text.clone(),
            summary.pattern.clone(),
            summary.answer.clone(),
        );
        record.conversation_id = ctx.conversation_id.clone();
        record.correlation_id = ctx.correlation_id.clone();
        record.trace = summary.trace.clone();
        if let Err(e) = self.history.put(record).await {
            warn!(workflow_id = %ctx.workflow_id, error = %e, "Failed to store execution record");
        }

        let mut message_id = None;
        if let Some(conversation_id) = &ctx.conversation_id {
            let message = Message::assistant(summary.answer.clone());
            let id = message.id;
            match self.conversations.append_message(conversation_id, message).await {
                Ok(()) => message_id = Some(id),
                Err(e) => {
                    warn!(workflow_id = %ctx.workflow_id, error = %e, "Failed to store assistant message");
                }
            }
        }

        info!(
            workflow_id = %ctx.workflow_id,
            pattern = %summary.pattern,
            fast_path = summary.fast_path,
            "Workflow completed"
        );
        sink.emit(InternalEvent::Completed {
            content: summary.answer.clone(),
            metadata: summary.metadata(&ctx.workflow_id),
            conversation_id: ctx.conversation_id.clone(),
        })
        .await;

        if let Some(evaluator) = &self.evaluator {
            let scheduled = evaluator.schedule(EvaluationTarget {
                workflow_id: ctx.workflow_id.clone(),
                conversation_id: ctx.conversation_id.clone(),
                message_id,
                task: task.text.clone(),
                answer: summary.answer,
            });
            debug!(workflow_id = %ctx.workflow_id, scheduled, "Evaluation scheduling");
        }
    }
}
