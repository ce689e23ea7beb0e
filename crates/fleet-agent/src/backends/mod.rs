//! Concrete [`Agent`](crate::Agent) implementations.
//!
//! To add a new provider:
//! 1. Create a new module in `backends/`
//! 2. Implement `Agent` for your struct
//! 3. Add the variant to `AgentProvider` in `config.rs`
//! 4. Wire it up in `build_agent()` in `registry.rs`

/// OpenAI-compatible chat completions.
pub mod openai;
/// Canned replies for offline runs and tests.
pub mod scripted;
