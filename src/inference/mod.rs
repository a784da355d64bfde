//! On-device LLM inference.
//!
//! - [`backend`]: Native call surface (loader and backend traits)
//! - [`llama_ffi`]: Bindings to llama.cpp
//! - [`scripted`]: Scripted backend for tests and benchmarks
//! - [`session`]: Session lifecycle state machine
//! - [`stream`]: Cancellable token streaming
//! - [`replay`]: Conversation history replay
//! - [`model_catalog`]: Model files available for loading

pub mod backend;
pub mod llama_ffi;
pub mod model_catalog;
pub mod replay;
pub mod scripted;
pub mod session;
pub mod stream;
