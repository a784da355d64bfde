//! Conversations around the inference session.
//!
//! - [`store`]: Chat and turn persistence
//! - [`controller`]: Chat orchestration (load, query, stop, switch)

pub mod controller;
pub mod store;
