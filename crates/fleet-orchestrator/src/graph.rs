use crate::approval::{ApprovalGate, GateOutcome};
use crate::checkpoint::CheckpointService;
use crate::config::EngineConfig;
use crate::events::{stream_agent, EventSink, NoticeKind, Visibility};
use crate::router::{extract_json, ExecutionMode, Pattern, Router, RoutingDecision};
use crate::supervisor::{Supervisor, SupervisorOutcome};
use crate::types::{OrchestratorState, TerminationReason};
use fleet_agent::{Agent, AgentDescriptor, AgentInput, AgentRegistry, AgentRole};
use fleet_core::{ApprovalRequest, FleetError, FleetResult, Message, RunContext, Task};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Nodes of the workflow graph. `Router` is the only start node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeId {
    /// Picks the pattern and team.
    Router,
    /// Writes the plan for complex tasks.
    Planner,
    /// Runs the team, or the supervisor loop for complex tasks.
    Worker,
    /// Reviews complex answers.
    Judge,
    /// End of the graph.
    Terminal,
}

impl NodeId {
    /// Entry node.
    pub const START: NodeId = NodeId::Router;

    /// Name used in traces.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeId::Router => "router",
            NodeId::Planner => "planner",
            NodeId::Worker => "worker",
            NodeId::Judge => "judge",
            NodeId::Terminal => "terminal",
        }
    }

    /// Follow the outgoing edge for the current pattern.
    pub fn next(self, pattern: &Pattern) -> NodeId {
        let complex = pattern.is_complex();
        EDGES
            .iter()
            .filter(|(from, _, _)| *from == self)
            .find(|(_, when, _)| match when {
                Edge::Always | Edge::Otherwise => true,
                Edge::Complex => complex,
            })
            .map(|(_, _, to)| *to)
            .unwrap_or(NodeId::Terminal)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
enum Edge {
    Always,
    Complex,
    Otherwise,
}

/// Fixed topology. Conditional edges are listed before their fallback.
const EDGES: &[(NodeId, Edge, NodeId)] = &[
    (NodeId::Router, Edge::Complex, NodeId::Planner),
    (NodeId::Router, Edge::Otherwise, NodeId::Worker),
    (NodeId::Planner, Edge::Always, NodeId::Worker),
    (NodeId::Worker, Edge::Complex, NodeId::Judge),
    (NodeId::Worker, Edge::Otherwise, NodeId::Terminal),
    (NodeId::Judge, Edge::Always, NodeId::Terminal),
];

/// Re-derive the routing pattern from node output.
///
/// Structured metadata on the newest message that has it wins (`pattern`,
/// or `routing.pattern`). Failing that, message text is scanned newest-first
/// for a routing decision. No signal at all means not complex.
pub fn derive_pattern(messages: &[Message]) -> Pattern {
    let from_metadata = messages.iter().rev().find_map(|m| {
        m.metadata
            .get("pattern")
            .and_then(Value::as_str)
            .or_else(|| {
                m.metadata
                    .get("routing")
                    .and_then(|r| r.get("pattern"))
                    .and_then(Value::as_str)
            })
            .map(Pattern::normalize)
    });
    from_metadata
        .or_else(|| {
            messages
                .iter()
                .rev()
                .find_map(|m| RoutingDecision::parse(&m.content))
                .map(|d| d.pattern)
        })
        .unwrap_or_default()
}

/// What a graph run produced.
#[derive(Debug, Clone)]
pub struct GraphOutcome {
    /// Work nodes visited, in order.
    pub trace: Vec<NodeId>,
    /// What the router decided.
    pub decision: RoutingDecision,
    /// Final answer.
    pub answer: String,
    /// Present when the worker stage ran the supervisor loop.
    pub supervisor: Option<SupervisorOutcome>,
    /// Judge score on a 0–1 scale, when the judge produced one.
    pub judge_score: Option<f64>,
    /// One message per visited node, carrying the pattern in its metadata.
    pub messages: Vec<Message>,
}

impl GraphOutcome {
    /// Trace as node names.
    pub fn trace_names(&self) -> Vec<String> {
        self.trace.iter().map(|n| n.as_str().to_string()).collect()
    }
}

/// Mutable state of one graph run.
struct Walk {
    ctx: RunContext,
    decision: RoutingDecision,
    plan: Option<String>,
    answer: String,
    supervisor: Option<SupervisorOutcome>,
    judge_score: Option<f64>,
    messages: Vec<Message>,
    trace: Vec<NodeId>,
}

impl Walk {
    fn record(&mut self, node: NodeId, content: impl Into<String>) {
        let mut message = Message::system(content);
        message
            .metadata
            .insert("node".into(), node.as_str().into());
        message
            .metadata
            .insert("pattern".into(), self.decision.pattern.as_str().into());
        self.messages.push(message);
    }
}

/// Runs a task through Router → (Planner) → Worker → (Judge).
pub struct GraphExecutor {
    config: Arc<EngineConfig>,
    registry: Arc<AgentRegistry>,
    router: Router,
    planner: Arc<dyn Agent>,
    judge: Option<Arc<dyn Agent>>,
    gate: Arc<ApprovalGate>,
    checkpoints: Option<Arc<dyn CheckpointService>>,
}

/// Agent bound to a role: the explicit binding, else the first agent with the role.
pub(crate) fn resolve_role(
    registry: &AgentRegistry,
    binding: Option<&str>,
    role: AgentRole,
) -> Option<Arc<dyn Agent>> {
    match binding {
        Some(name) => registry.get(name),
        None => registry.by_role(role),
    }
}

impl GraphExecutor {
    /// Resolve the control roles. Router and planner are required.
    pub fn new(
        config: Arc<EngineConfig>,
        registry: Arc<AgentRegistry>,
        gate: Arc<ApprovalGate>,
        checkpoints: Option<Arc<dyn CheckpointService>>,
    ) -> FleetResult<Self> {
        let roles = &config.roles;
        let router_agent = resolve_role(&registry, roles.router.as_deref(), AgentRole::Router)
            .ok_or_else(|| FleetError::Configuration("No router agent configured".into()))?;
        let planner = resolve_role(&registry, roles.planner.as_deref(), AgentRole::Planner)
            .ok_or_else(|| FleetError::Configuration("No planner agent configured".into()))?;
        let judge = resolve_role(&registry, roles.judge.as_deref(), AgentRole::Judge);
        let router = Router::new(
            router_agent,
            config.teams.clone(),
            registry.descriptors().into_iter().cloned().collect(),
        );
        Ok(Self {
            config,
            registry,
            router,
            planner,
            judge,
            gate,
            checkpoints,
        })
    }

    /// Walk the graph from the start node to `Terminal`.
    pub async fn execute(
        &self,
        task: &Task,
        ctx: &RunContext,
        history: &[Message],
        sink: &EventSink,
    ) -> FleetResult<GraphOutcome> {
        let mut walk = Walk {
            ctx: ctx.clone(),
            decision: RoutingDecision::fallback("not routed yet"),
            plan: None,
            answer: String::new(),
            supervisor: None,
            judge_score: None,
            messages: Vec::new(),
            trace: Vec::new(),
        };

        let mut node = NodeId::START;
        while node != NodeId::Terminal {
            if walk.ctx.is_cancelled() {
                return Err(FleetError::WorkflowExecution("Workflow cancelled".into()));
            }
            info!(workflow_id = %ctx.workflow_id, node = %node, "Entering graph node");
            walk.trace.push(node);
            match node {
                NodeId::Router => self.router_node(task, history, sink, &mut walk).await,
                NodeId::Planner => self.planner_node(task, sink, &mut walk).await,
                NodeId::Worker => self.worker_node(task, sink, &mut walk).await?,
                NodeId::Judge => self.judge_node(task, sink, &mut walk).await,
                NodeId::Terminal => {}
            }
            node = node.next(&derive_pattern(&walk.messages));
        }

        Ok(GraphOutcome {
            trace: walk.trace,
            decision: walk.decision,
            answer: walk.answer,
            supervisor: walk.supervisor,
            judge_score: walk.judge_score,
            messages: walk.messages,
        })
    }

    /// Continue a complex run from a restored supervisor state: the
    /// supervisor loop picks up where it stopped, then the judge runs.
    pub async fn resume(
        &self,
        state: OrchestratorState,
        ctx: &RunContext,
        sink: &EventSink,
    ) -> FleetResult<GraphOutcome> {
        let mut decision = RoutingDecision::fallback("restored from checkpoint");
        decision.pattern = Pattern::normalize(state.context_str("pattern").unwrap_or("complex"));
        if let Some(team) = state.context_str("target_team") {
            decision.target_team = team.to_string();
        }
        let task = Task::new(state.context_str("task").unwrap_or_default());
        let mut walk = Walk {
            ctx: self.scope(ctx, &decision),
            decision,
            plan: state.context_str("plan").map(String::from),
            answer: String::new(),
            supervisor: None,
            judge_score: None,
            messages: Vec::new(),
            trace: vec![NodeId::Worker],
        };

        self.run_supervisor(&task, state, sink, &mut walk).await?;
        if walk.ctx.is_cancelled() {
            return Err(FleetError::WorkflowExecution("Workflow cancelled".into()));
        }
        walk.trace.push(NodeId::Judge);
        self.judge_node(&task, sink, &mut walk).await;

        Ok(GraphOutcome {
            trace: walk.trace,
            decision: walk.decision,
            answer: walk.answer,
            supervisor: walk.supervisor,
            judge_score: walk.judge_score,
            messages: walk.messages,
        })
    }

    fn scope(&self, ctx: &RunContext, decision: &RoutingDecision) -> RunContext {
        let tools = self
            .config
            .team(&decision.target_team)
            .map(|t| t.tools.clone())
            .unwrap_or_default();
        ctx.scoped_to(decision.target_team.clone(), tools)
    }

    async fn router_node(&self, task: &Task, history: &[Message], sink: &EventSink, walk: &mut Walk) {
        let decision = self.router.route(task, &walk.ctx, history, sink).await;
        walk.ctx = self.scope(&walk.ctx, &decision);
        let content = serde_json::to_string(&decision).unwrap_or_default();
        walk.decision = decision;
        walk.record(NodeId::Router, content);
        if let Some(message) = walk.messages.last_mut() {
            message.metadata.insert(
                "routing".into(),
                serde_json::to_value(&walk.decision).unwrap_or(Value::Null),
            );
        }
    }

    async fn planner_node(&self, task: &Task, sink: &EventSink, walk: &mut Walk) {
        let mut prompt = format!("Task:\n{}", task.text);
        if !walk.decision.subtasks.is_empty() {
            prompt.push_str(&format!(
                "\n\nSuggested subtasks:\n- {}",
                walk.decision.subtasks.join("\n- ")
            ));
        }
        prompt.push_str(&format!("\n\nTeam:\n{}", self.team_listing(&walk.decision)));
        let input = AgentInput::new(prompt).with_instructions(
            "Write a short numbered plan for the team to solve the task. Plain text only.",
        );
        let plan = match stream_agent(self.planner.as_ref(), input, sink, Visibility::ReasoningOnly).await
        {
            Ok(output) if !output.text.trim().is_empty() => output.text.trim().to_string(),
            Ok(_) => format!("1. {}", task.text),
            Err(e) => {
                warn!(workflow_id = %walk.ctx.workflow_id, error = %e, "Planner node failed, using a single-step plan");
                format!("1. {}", task.text)
            }
        };
        sink.notice(plan.clone(), NoticeKind::Plan).await;
        walk.record(NodeId::Planner, plan.clone());
        walk.plan = Some(plan);
    }

    async fn worker_node(&self, task: &Task, sink: &EventSink, walk: &mut Walk) -> FleetResult<()> {
        if walk.decision.pattern.is_complex() {
            let mut state =
                OrchestratorState::new(walk.ctx.workflow_id.clone(), walk.ctx.conversation_id.clone());
            state.set_context("task", task.text.clone());
            state.set_context("pattern", walk.decision.pattern.as_str());
            state.set_context("target_team", walk.decision.target_team.clone());
            if let Some(plan) = &walk.plan {
                state.set_context("plan", plan.clone());
            }
            return self.run_supervisor(task, state, sink, walk).await;
        }

        let team = self.team_members(&walk.decision);
        let assigned: Vec<&AgentDescriptor> = {
            let chosen: Vec<_> = walk
                .decision
                .assigned_to
                .iter()
                .filter_map(|name| team.iter().find(|d| d.name == *name).copied())
                .collect();
            if chosen.is_empty() {
                team.iter().take(1).copied().collect()
            } else {
                chosen
            }
        };
        if assigned.is_empty() {
            return Err(FleetError::WorkflowExecution(format!(
                "No worker available for team '{}'",
                walk.decision.target_team
            )));
        }

        let mode = match walk.decision.execution_mode {
            ExecutionMode::Parallel if !self.config.graph.allow_parallel => ExecutionMode::Sequential,
            ExecutionMode::Delegated if assigned.len() > 1 => ExecutionMode::Sequential,
            mode => mode,
        };
        info!(
            workflow_id = %walk.ctx.workflow_id,
            mode = ?mode,
            agents = assigned.len(),
            "Running worker stage"
        );

        let answer = match mode {
            ExecutionMode::Delegated => {
                let descriptor = assigned[0];
                match self.call_worker(descriptor, task.text.clone(), None, sink, walk).await? {
                    Some(text) => text,
                    None => format!("{} was not approved to run.", descriptor.name),
                }
            }
            ExecutionMode::Sequential => self.run_sequential(task, &assigned, sink, walk).await?,
            ExecutionMode::Parallel => self.run_parallel(task, &assigned, sink, walk).await?,
        };
        walk.answer = answer.clone();
        walk.record(NodeId::Worker, answer);
        Ok(())
    }

    async fn run_supervisor(
        &self,
        task: &Task,
        state: OrchestratorState,
        sink: &EventSink,
        walk: &mut Walk,
    ) -> FleetResult<()> {
        let participants: Vec<(AgentDescriptor, Arc<dyn Agent>)> = self
            .team_members(&walk.decision)
            .into_iter()
            .filter_map(|d| self.registry.get(&d.name).map(|a| (d.clone(), a)))
            .collect();
        let mut supervisor = Supervisor::new(
            self.config.supervisor.clone(),
            self.planner.clone(),
            participants,
            self.gate.clone(),
            sink.clone(),
            state,
        );
        if self.config.checkpoint.enabled {
            if let Some(checkpoints) = &self.checkpoints {
                supervisor = supervisor.with_checkpoints(checkpoints.clone());
            }
        }
        let outcome = supervisor.run(&task.text, &walk.ctx).await?;
        if outcome.reason == TerminationReason::Cancelled {
            return Err(FleetError::WorkflowExecution("Workflow cancelled".into()));
        }
        walk.answer = outcome.answer.clone();
        walk.record(NodeId::Worker, outcome.answer.clone());
        walk.supervisor = Some(outcome);
        Ok(())
    }

    async fn run_sequential(
        &self,
        task: &Task,
        agents: &[&AgentDescriptor],
        sink: &EventSink,
        walk: &Walk,
    ) -> FleetResult<String> {
        let units = work_units(task, &walk.decision, agents);
        let mut previous: Option<String> = None;
        let mut failures = Vec::new();
        for (descriptor, prompt) in units {
            if walk.ctx.is_cancelled() {
                return Err(FleetError::WorkflowExecution("Workflow cancelled".into()));
            }
            match self
                .call_worker(descriptor, prompt, previous.as_deref(), sink, walk)
                .await
            {
                Ok(Some(text)) => previous = Some(text),
                Ok(None) => failures.push(format!("{} was not approved to run", descriptor.name)),
                Err(e) => {
                    warn!(workflow_id = %walk.ctx.workflow_id, agent = %descriptor.name, error = %e, "Worker failed");
                    failures.push(format!("Agent {} failed: {e}", descriptor.name));
                }
            }
        }
        previous.ok_or_else(|| {
            FleetError::WorkflowExecution(format!("Every worker failed: {}", failures.join("; ")))
        })
    }

    async fn run_parallel(
        &self,
        task: &Task,
        agents: &[&AgentDescriptor],
        sink: &EventSink,
        walk: &Walk,
    ) -> FleetResult<String> {
        let units = work_units(task, &walk.decision, agents);
        let mut sections = Vec::new();
        let mut failures = Vec::new();
        for chunk in units.chunks(self.config.graph.max_parallel.max(1)) {
            let results = join_all(chunk.iter().map(|unit| {
                let descriptor: &AgentDescriptor = unit.0;
                let prompt = unit.1.clone();
                async move {
                    let result = self.call_worker(descriptor, prompt, None, sink, walk).await;
                    (descriptor.name.as_str(), result)
                }
            }))
            .await;
            for (name, result) in results {
                match result {
                    Ok(Some(text)) => sections.push(format!("**{name}**: {text}")),
                    Ok(None) => failures.push(format!("{name} was not approved to run")),
                    Err(e) => failures.push(format!("Agent {name} failed: {e}")),
                }
            }
        }
        if sections.is_empty() {
            return Err(FleetError::WorkflowExecution(format!(
                "Every worker failed: {}",
                failures.join("; ")
            )));
        }
        Ok(sections.join("\n\n"))
    }

    /// Invoke one worker behind the approval gate. `Ok(None)` means the
    /// reviewer rejected the invocation.
    async fn call_worker(
        &self,
        descriptor: &AgentDescriptor,
        prompt: String,
        previous: Option<&str>,
        sink: &EventSink,
        walk: &Walk,
    ) -> FleetResult<Option<String>> {
        let agent = self.registry.require(&descriptor.name)?;
        let mut prompt = prompt;
        if descriptor.side_effecting {
            let request = ApprovalRequest::new("agent_invocation", &descriptor.name, prompt.clone())
                .with_details(json!({ "workflow_id": walk.ctx.workflow_id }));
            match self.gate.request(request, &walk.ctx.cancellation).await {
                GateOutcome::Proceed => {}
                GateOutcome::Rejected { .. } => return Ok(None),
                GateOutcome::Revised { revisions, .. } => {
                    if let Some(revised) = revisions
                        .get("instruction")
                        .or_else(|| revisions.get("prompt"))
                        .and_then(Value::as_str)
                    {
                        prompt = revised.to_string();
                    }
                }
            }
        }
        if let Some(previous) = previous {
            prompt = format!("{prompt}\n\nPrevious result:\n{previous}");
        }

        let mut instructions = format!("You are {}.", descriptor.name);
        if !descriptor.description.is_empty() {
            instructions.push_str(&format!(" {}", descriptor.description));
        }
        if !walk.ctx.tools.is_empty() {
            instructions.push_str(&format!("\nAvailable tools: {}", walk.ctx.tools.join(", ")));
        }
        let output = stream_agent(
            agent.as_ref(),
            AgentInput::new(prompt).with_instructions(instructions),
            sink,
            Visibility::Full,
        )
        .await?;
        Ok(Some(output.text))
    }

    async fn judge_node(&self, task: &Task, sink: &EventSink, walk: &mut Walk) {
        let Some(judge) = &self.judge else {
            info!(workflow_id = %walk.ctx.workflow_id, "No judge configured, skipping review");
            walk.record(NodeId::Judge, "skipped");
            return;
        };
        let input = AgentInput::new(format!("Task:\n{}\n\nAnswer:\n{}", task.text, walk.answer))
            .with_instructions(
                "Review the answer. Reply with JSON only: \
                 {\"score\": <0..1>, \"feedback\": \"...\", \"refined_answer\": \"<improved answer or empty>\"}",
            );
        match stream_agent(judge.as_ref(), input, sink, Visibility::ReasoningOnly).await {
            Ok(output) => {
                let verdict = extract_json(&output.text);
                walk.judge_score = verdict
                    .as_ref()
                    .and_then(|v| v.get("score"))
                    .and_then(Value::as_f64)
                    .filter(|s| s.is_finite())
                    .map(|s| s.clamp(0.0, 1.0));
                let refined = verdict
                    .as_ref()
                    .and_then(|v| v.get("refined_answer"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|r| !r.is_empty());
                if let Some(refined) = refined {
                    walk.answer = refined.to_string();
                }
                info!(workflow_id = %walk.ctx.workflow_id, score = ?walk.judge_score, refined = refined.is_some(), "Judge verdict");
                walk.record(NodeId::Judge, output.text);
            }
            Err(e) => {
                warn!(workflow_id = %walk.ctx.workflow_id, error = %e, "Judge failed, keeping worker answer");
                walk.record(NodeId::Judge, format!("Judge failed: {e}"));
            }
        }
    }

    /// Participants of the routed team, or every participant when the team
    /// is unknown or empty.
    fn team_members(&self, decision: &RoutingDecision) -> Vec<&AgentDescriptor> {
        let participants = self.registry.participants();
        let members: Vec<&AgentDescriptor> = match self.config.team(&decision.target_team) {
            Some(team) => participants
                .iter()
                .filter(|d| team.members.contains(&d.name))
                .copied()
                .collect(),
            None => Vec::new(),
        };
        if members.is_empty() {
            participants
        } else {
            members
        }
    }

    fn team_listing(&self, decision: &RoutingDecision) -> String {
        self.team_members(decision)
            .iter()
            .map(|d| format!("- {} ({})", d.name, d.role))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Pair agents with prompts: one subtask per agent in round-robin when the
/// router produced subtasks, otherwise the whole task for every agent.
fn work_units<'a>(
    task: &Task,
    decision: &RoutingDecision,
    agents: &[&'a AgentDescriptor],
) -> Vec<(&'a AgentDescriptor, String)> {
    if decision.subtasks.is_empty() {
        agents.iter().map(|d| (*d, task.text.clone())).collect()
    } else {
        decision
            .subtasks
            .iter()
            .enumerate()
            .map(|(i, subtask)| (agents[i % agents.len()], subtask.clone()))
            .collect()
    }
}
