//! HTTP gateway for the Fleet engine.
//!
//! Workflow runs stream back as server-sent events, one JSON object per
//! `data:` frame, closed by `data: [DONE]`. Checkpoints and pending approvals
//! are exposed as plain JSON resources.

/// HTTP-driven approval handler.
pub mod approval;
/// Error bodies.
pub mod error;
/// API key middleware.
pub mod middleware;
/// Routes and application state.
pub mod server;

pub use approval::HttpApprovalHandler;
pub use error::{ApiError, ErrorBody};
pub use middleware::AuthConfig;
pub use server::{AppState, GatewayServer};
