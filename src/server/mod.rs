//! HTTP surface for chat clients.
//!
//! - [`api`]: Request/response types and route handlers
//! - [`metrics`]: Prometheus counters
//! - [`streaming`]: SSE streaming for token-by-token responses

pub mod api;
pub mod metrics;
pub mod streaming;
