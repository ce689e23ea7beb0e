use crate::approval::{ApprovalGate, GateOutcome};
use crate::checkpoint::CheckpointService;
use crate::config::SupervisorConfig;
use crate::events::{stream_agent, EventSink, NoticeKind, Visibility};
use crate::router::extract_json;
use crate::types::{OrchestratorState, Phase, TerminationReason};
use fleet_agent::{Agent, AgentDescriptor, AgentInput};
use fleet_core::{ApprovalRequest, FleetError, FleetResult, RunContext};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The planner's per-round judgement of where the task stands.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressLedger {
    /// The task is done.
    pub is_request_satisfied: bool,
    /// The team keeps repeating itself.
    pub is_in_loop: bool,
    /// The last round moved the task forward.
    pub is_progress_being_made: bool,
    /// Participant to act next.
    pub next_speaker: String,
    /// What the next speaker should do.
    pub instruction: String,
    /// Final answer, when the request is satisfied.
    pub answer: Option<String>,
    /// Planner's justification.
    pub reason: String,
}

impl ProgressLedger {
    /// Parse a ledger from planner output.
    ///
    /// Each field may be a bare value or an `{"answer": ..., "reason": ...}`
    /// object. `is_request_satisfied` is required; the rest default to an
    /// ordinary progressing round.
    pub fn parse(text: &str) -> Option<Self> {
        let value = extract_json(text)?;
        let obj = value.as_object()?;
        let is_request_satisfied = flag(obj, "is_request_satisfied")?;
        Some(Self {
            is_request_satisfied,
            is_in_loop: flag(obj, "is_in_loop").unwrap_or(false),
            is_progress_being_made: flag(obj, "is_progress_being_made").unwrap_or(true),
            next_speaker: field_text(obj, "next_speaker").unwrap_or_default(),
            instruction: field_text(obj, "instruction_or_question")
                .or_else(|| field_text(obj, "instruction"))
                .unwrap_or_default(),
            answer: field_text(obj, "final_answer")
                .or_else(|| field_text(obj, "answer"))
                .filter(|a| !a.trim().is_empty()),
            reason: reason(obj, "is_request_satisfied").unwrap_or_default(),
        })
    }

    fn stalled(&self) -> bool {
        self.is_in_loop || !self.is_progress_being_made
    }
}

fn answer_of<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let value = obj.get(key)?;
    match value {
        Value::Object(inner) => inner.get("answer"),
        other => Some(other),
    }
}

fn flag(obj: &Map<String, Value>, key: &str) -> Option<bool> {
    match answer_of(obj, key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn field_text(obj: &Map<String, Value>, key: &str) -> Option<String> {
    answer_of(obj, key)?.as_str().map(|s| s.trim().to_string())
}

fn reason(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)?
        .get("reason")?
        .as_str()
        .map(String::from)
}

/// How a supervisor run ended.
#[derive(Debug, Clone)]
pub struct SupervisorOutcome {
    /// State at termination.
    pub state: OrchestratorState,
    /// Why the loop stopped.
    pub reason: TerminationReason,
    /// Final answer, or the best partial answer.
    pub answer: String,
}

/// Result of one acting phase, consumed by the observing phase.
enum Act {
    Responded { agent: String, text: String },
    Failed { agent: String, message: String },
    Denied { agent: String, feedback: String },
}

/// Drives a team of participants through Plan→Evaluate→Act→Observe until the
/// request is satisfied or a budget runs out.
///
/// The planner both writes the plan and fills in the progress ledger each
/// round. Agent failures and approval rejections become observations; only
/// `max_consecutive_failures` failures in a row abort the run.
pub struct Supervisor {
    config: SupervisorConfig,
    planner: Arc<dyn Agent>,
    participants: Vec<(AgentDescriptor, Arc<dyn Agent>)>,
    gate: Arc<ApprovalGate>,
    sink: EventSink,
    checkpoints: Option<Arc<dyn CheckpointService>>,
    state: OrchestratorState,
}

impl Supervisor {
    /// A supervisor starting from `state`.
    pub fn new(
        config: SupervisorConfig,
        planner: Arc<dyn Agent>,
        participants: Vec<(AgentDescriptor, Arc<dyn Agent>)>,
        gate: Arc<ApprovalGate>,
        sink: EventSink,
        state: OrchestratorState,
    ) -> Self {
        Self {
            config,
            planner,
            participants,
            gate,
            sink,
            checkpoints: None,
            state,
        }
    }

    /// Save a checkpoint every `checkpoint_every` rounds.
    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointService>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Current state.
    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    /// Run to termination. A state that already carries a plan (a restored
    /// checkpoint) resumes at `Evaluating`.
    pub async fn run(mut self, task: &str, ctx: &RunContext) -> FleetResult<SupervisorOutcome> {
        if self.participants.is_empty() {
            return Err(FleetError::Configuration(
                "Supervisor needs at least one participant".into(),
            ));
        }
        if self.state.context_str("task").is_none() {
            self.state.set_context("task", task);
        }
        let mut phase = if self.state.context_str("plan").is_some() {
            info!(
                workflow_id = %self.state.workflow_id,
                round = self.state.current_round,
                stalls = self.state.stall_count,
                "Resuming supervisor loop"
            );
            Phase::Evaluating
        } else {
            Phase::Planning
        };
        let mut replan = false;
        let mut next: Option<(usize, String)> = None;
        let mut acted: Option<Act> = None;
        let mut finish: Option<(TerminationReason, Option<String>)> = None;

        loop {
            debug!(workflow_id = %self.state.workflow_id, phase = ?phase, round = self.state.current_round, "Supervisor phase");
            match phase {
                Phase::Planning => {
                    self.plan(replan).await;
                    replan = false;
                    phase = Phase::Evaluating;
                }
                Phase::Evaluating => {
                    if ctx.is_cancelled() {
                        finish = Some((TerminationReason::Cancelled, None));
                        phase = Phase::Terminated;
                        continue;
                    }
                    if self.state.current_round >= self.config.max_rounds {
                        finish = Some((TerminationReason::MaxRounds, None));
                        phase = Phase::Terminated;
                        continue;
                    }
                    if self.state.stall_count >= self.config.max_stalls {
                        let resets = self.state.context_u32("reset_count");
                        if resets < self.config.max_resets {
                            warn!(
                                workflow_id = %self.state.workflow_id,
                                round = self.state.current_round,
                                reset = resets + 1,
                                "Stall limit reached, replanning"
                            );
                            self.state.set_context("reset_count", resets + 1);
                            self.state.stall_count = 0;
                            replan = true;
                            phase = Phase::Planning;
                            continue;
                        }
                        finish = Some((TerminationReason::MaxStalls, None));
                        phase = Phase::Terminated;
                        continue;
                    }

                    match self.evaluate(ctx).await {
                        Some(ledger) if ledger.is_request_satisfied => {
                            finish = Some((TerminationReason::Satisfied, ledger.answer));
                            phase = Phase::Terminated;
                            continue;
                        }
                        Some(ledger) => {
                            if ledger.stalled() {
                                self.add_stall("ledger reports no progress");
                            } else {
                                self.relieve_stall();
                            }
                            let idx = self.speaker_index(&ledger.next_speaker);
                            let instruction = if ledger.instruction.is_empty() {
                                task_text(&self.state, task)
                            } else {
                                ledger.instruction
                            };
                            next = Some((idx, instruction));
                        }
                        None => {
                            self.add_stall("progress ledger could not be parsed");
                            let idx = self.speaker_index("");
                            next = Some((idx, task_text(&self.state, task)));
                        }
                    }
                    if self.state.stall_count >= self.config.max_stalls {
                        continue;
                    }
                    phase = Phase::Acting;
                }
                Phase::Acting => {
                    let (idx, instruction) = next
                        .take()
                        .unwrap_or_else(|| (self.speaker_index(""), task_text(&self.state, task)));
                    acted = Some(self.act(idx, instruction, ctx).await);
                    phase = Phase::Observing;
                }
                Phase::Observing => {
                    if let Some(act) = acted.take() {
                        self.observe(act)?;
                    }
                    self.state.current_round += 1;
                    self.maybe_checkpoint().await;
                    phase = Phase::Evaluating;
                }
                Phase::Terminated => {
                    let (reason, answer) =
                        finish.take().unwrap_or((TerminationReason::Satisfied, None));
                    return Ok(self.terminate(reason, answer));
                }
            }
        }
    }

    async fn plan(&mut self, replan: bool) {
        let task = self.state.context_str("task").unwrap_or_default().to_string();
        let mut prompt = format!("Task:\n{task}\n\nTeam:\n{}", self.team_listing());
        let observations = self.recent_observations();
        if replan && !observations.is_empty() {
            prompt.push_str(&format!(
                "\n\nThe previous plan stalled. What happened so far:\n{}",
                observations.join("\n")
            ));
        }
        let input = AgentInput::new(prompt).with_instructions(
            "Write a short numbered plan for the team to solve the task. Plain text only.",
        );

        let plan = match stream_agent(self.planner.as_ref(), input, &self.sink, Visibility::ReasoningOnly)
            .await
        {
            Ok(output) if !output.text.trim().is_empty() => output.text.trim().to_string(),
            Ok(_) => {
                warn!(workflow_id = %self.state.workflow_id, "Planner returned an empty plan");
                format!("1. {task}")
            }
            Err(e) => {
                warn!(workflow_id = %self.state.workflow_id, error = %e, "Planner failed, using a single-step plan");
                format!("1. {task}")
            }
        };

        let kind = if replan { NoticeKind::Replan } else { NoticeKind::Plan };
        info!(workflow_id = %self.state.workflow_id, kind = kind.as_str(), "Plan ready");
        self.sink.notice(plan.clone(), kind).await;
        self.state.set_context("plan", plan);
    }

    async fn evaluate(&self, ctx: &RunContext) -> Option<ProgressLedger> {
        let speakers: Vec<&str> = self
            .participants
            .iter()
            .map(|(d, _)| d.name.as_str())
            .collect();
        let prompt = format!(
            "Task:\n{}\n\nPlan:\n{}\n\nTeam:\n{}\n\nObservations:\n{}",
            self.state.context_str("task").unwrap_or_default(),
            self.state.context_str("plan").unwrap_or_default(),
            self.team_listing(),
            self.recent_observations().join("\n"),
        );
        let instructions = format!(
            "Assess progress and pick who acts next. Reply with JSON only:\n\
             {{\"is_request_satisfied\": {{\"answer\": bool, \"reason\": \"...\"}}, \
             \"is_in_loop\": {{\"answer\": bool}}, \"is_progress_being_made\": {{\"answer\": bool}}, \
             \"next_speaker\": {{\"answer\": \"one of: {}\"}}, \
             \"instruction_or_question\": {{\"answer\": \"...\"}}, \"final_answer\": \"...\"}}",
            speakers.join(", ")
        );
        let input = AgentInput::new(prompt).with_instructions(instructions);

        match stream_agent(self.planner.as_ref(), input, &self.sink, Visibility::ReasoningOnly).await {
            Ok(output) => {
                let ledger = ProgressLedger::parse(&output.text);
                if ledger.is_none() {
                    warn!(workflow_id = %ctx.workflow_id, "Progress ledger unreadable");
                }
                ledger
            }
            Err(e) => {
                warn!(workflow_id = %ctx.workflow_id, error = %e, "Progress ledger failed");
                None
            }
        }
    }

    async fn act(&self, idx: usize, instruction: String, ctx: &RunContext) -> Act {
        let Some((descriptor, agent)) = self.participants.get(idx) else {
            return Act::Failed {
                agent: "unknown".into(),
                message: "no participant at index".into(),
            };
        };
        let name = descriptor.name.clone();
        let mut prompt = instruction;

        if descriptor.side_effecting {
            let request = ApprovalRequest::new("agent_invocation", &name, prompt.clone())
                .with_details(json!({
                    "workflow_id": self.state.workflow_id,
                    "round": self.state.current_round,
                }));
            match self.gate.request(request, &ctx.cancellation).await {
                GateOutcome::Proceed => {}
                GateOutcome::Rejected { feedback } => {
                    return Act::Denied {
                        agent: name,
                        feedback,
                    };
                }
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

        self.sink
            .notice(
                format!(
                    "Round {}: {name} is working on: {prompt}",
                    self.state.current_round + 1
                ),
                NoticeKind::Progress,
            )
            .await;

        let input = AgentInput::new(prompt).with_instructions(format!(
            "You are {name}, part of a team solving: {}\n\nPlan:\n{}",
            self.state.context_str("task").unwrap_or_default(),
            self.state.context_str("plan").unwrap_or_default(),
        ));
        match stream_agent(agent.as_ref(), input, &self.sink, Visibility::Full).await {
            Ok(output) => Act::Responded {
                agent: name,
                text: output.text,
            },
            Err(e) => Act::Failed {
                agent: name,
                message: e.to_string(),
            },
        }
    }

    fn observe(&mut self, act: Act) -> FleetResult<()> {
        match act {
            Act::Responded { agent, text } => {
                self.state.set_context("consecutive_failures", 0);
                if !text.is_empty() && text == self.state.last_response {
                    self.add_stall("agent repeated its previous response");
                }
                self.push_observation(format!("{agent}: {text}"));
                self.state.last_response = text;
            }
            Act::Failed { agent, message } => {
                let failures = self.state.context_u32("consecutive_failures") + 1;
                self.state.set_context("consecutive_failures", failures);
                warn!(
                    workflow_id = %self.state.workflow_id,
                    agent = %agent,
                    failures,
                    error = %message,
                    "Participant failed"
                );
                self.push_observation(format!("Agent {agent} failed: {message}"));
                self.add_stall("agent failed");
                if failures >= self.config.max_consecutive_failures {
                    return Err(FleetError::WorkflowExecution(format!(
                        "{failures} consecutive agent failures, last from {agent}: {message}"
                    )));
                }
            }
            Act::Denied { agent, feedback } => {
                info!(workflow_id = %self.state.workflow_id, agent = %agent, "Invocation rejected by reviewer");
                self.push_observation(format!("Agent {agent} was not approved: {feedback}"));
                self.add_stall("invocation rejected");
            }
        }
        Ok(())
    }

    async fn maybe_checkpoint(&self) {
        let Some(checkpoints) = &self.checkpoints else {
            return;
        };
        let every = self.config.checkpoint_every;
        if every == 0 || self.state.current_round % every != 0 {
            return;
        }
        if let Err(e) = checkpoints.save(&self.state).await {
            warn!(workflow_id = %self.state.workflow_id, round = self.state.current_round, error = %e, "Checkpoint save failed");
        }
    }

    fn terminate(self, reason: TerminationReason, answer: Option<String>) -> SupervisorOutcome {
        let answer = answer.unwrap_or_else(|| self.state.last_response.clone());
        info!(
            workflow_id = %self.state.workflow_id,
            reason = %reason,
            rounds = self.state.current_round,
            stalls = self.state.stall_count,
            "Supervisor terminated"
        );
        SupervisorOutcome {
            state: self.state,
            reason,
            answer,
        }
    }

    fn add_stall(&mut self, why: &str) {
        self.state.stall_count = (self.state.stall_count + 1).min(self.config.max_stalls);
        debug!(workflow_id = %self.state.workflow_id, stalls = self.state.stall_count, why, "Stall");
    }

    fn relieve_stall(&mut self) {
        self.state.stall_count = self.state.stall_count.saturating_sub(1);
    }

    /// Named speaker if known, otherwise round-robin by round number.
    fn speaker_index(&self, name: &str) -> usize {
        let wanted = name.trim();
        self.participants
            .iter()
            .position(|(d, _)| d.name.eq_ignore_ascii_case(wanted))
            .unwrap_or(self.state.current_round as usize % self.participants.len().max(1))
    }

    fn team_listing(&self) -> String {
        self.participants
            .iter()
            .map(|(d, _)| {
                if d.description.is_empty() {
                    format!("- {} ({})", d.name, d.role)
                } else {
                    format!("- {} ({}): {}", d.name, d.role, d.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn push_observation(&mut self, observation: String) {
        let entry = self
            .state
            .context
            .entry("observations")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        if let Value::Array(items) = entry {
            items.push(Value::String(observation));
        }
    }

    fn recent_observations(&self) -> Vec<String> {
        let all: Vec<String> = self
            .state
            .context
            .get("observations")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let skip = all.len().saturating_sub(self.config.observation_window);
        all.into_iter().skip(skip).collect()
    }
}

fn task_text(state: &OrchestratorState, fallback: &str) -> String {
    state.context_str("task").unwrap_or(fallback).to_string()
}
