//! The agent contract and its backends.
//!
//! Every role in a Fleet workflow (router, planner, worker, judge, …) is an
//! [`Agent`]: a black box that turns an [`AgentInput`] into text plus an
//! optional reasoning trace, either in one call or as a stream of deltas.

/// The `Agent` trait and its input and output types.
pub mod agent;
/// Provider implementations.
pub mod backends;
/// Agent configuration.
pub mod config;
/// Named agents and their descriptors.
pub mod registry;

pub use agent::{Agent, AgentDelta, AgentInput, AgentOutput, AgentStream};
pub use backends::openai::OpenAiAgent;
pub use backends::scripted::{ScriptedAgent, ScriptedReply};
pub use config::{AgentConfig, AgentProvider, AgentRole};
pub use registry::{build_agent, AgentDescriptor, AgentRegistry};
