//! Orchestration and streaming engine for multi-agent workflows.
//!
//! A task first meets the [`Classifier`]. Trivial turns go straight to a
//! single agent; everything else enters the workflow graph
//! (Router → Planner → Worker → Judge), where complex tasks are driven by
//! the [`Supervisor`]'s Plan→Evaluate→Act→Observe loop. Internal agent
//! events are reshaped by the [`Aggregator`] into the wire protocol.
//!
//! # Main types
//!
//! - [`WorkflowEngine`]: Implements [`fleet_core::RunsWorkflow`]; the entry point.
//! - [`Router`]: Turns router-agent output into a [`RoutingDecision`].
//! - [`Supervisor`]: Round/stall state machine for complex tasks.
//! - [`GraphExecutor`]: Fixed node graph with pattern-keyed edges.
//! - [`CheckpointService`]: Save/list/load/delete of [`OrchestratorState`].
//! - [`ApprovalGate`]: Human-in-the-loop guard before side-effecting agents.
//! - [`BackgroundEvaluator`]: Fire-and-forget quality scoring.

/// Pattern-keyed workflow graph.
pub mod graph;
/// Event dispatch table and aggregation into wire events.
pub mod bridge;
/// Approval gate and built-in approval handlers.
pub mod approval;
/// Durable orchestrator snapshots.
pub mod checkpoint;
/// Fast-path classification.
pub mod classifier;
/// Engine configuration.
pub mod config;
/// The top-level workflow engine.
pub mod engine;
/// Background quality scoring.
pub mod evaluator;
/// Internal event types and the sink agents stream into.
pub mod events;
/// Routing decisions.
pub mod router;
/// Server-sent-event framing.
pub mod sse;
/// Plan→Evaluate→Act→Observe loop.
pub mod supervisor;
/// Shared orchestration state types.
pub mod types;

pub use approval::{ApprovalGate, AutoApproveHandler, CallbackApprovalHandler, GateOutcome};
pub use bridge::{run_bridge, Aggregator};
pub use checkpoint::{
    Checkpoint, CheckpointMetadata, CheckpointService, FileCheckpointService,
    InMemoryCheckpointService,
};
pub use classifier::Classifier;
pub use config::{
    ApprovalConfig, ApprovalMode, CheckpointConfig, ClassifierConfig, EngineConfig,
    EvaluatorConfig, GraphConfig, RoleBindings, SupervisorConfig, TeamConfig,
};
pub use engine::{EngineBuilder, WorkflowEngine};
pub use evaluator::{
    AgentScorer, BackgroundEvaluator, EvaluationTarget, HeuristicScorer, QualityScorer,
};
pub use events::{EventSink, InternalEvent, InternalEventKind, NoticeKind, Visibility};
pub use graph::{GraphExecutor, GraphOutcome, NodeId};
pub use router::{ExecutionMode, Pattern, Router, RoutingDecision};
pub use sse::{frame_event, frame_stream, DONE_FRAME};
pub use supervisor::{ProgressLedger, Supervisor, SupervisorOutcome};
pub use types::{OrchestratorState, Phase, TerminationReason};
