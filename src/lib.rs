//! inference-session: on-device LLM inference session lifecycle.
//!
//! Loads a model into a single session, replays stored conversation history
//! into it and streams generated text piece by piece with cooperative
//! cancellation:
//!   Unloaded → Loading → Ready ⇄ Generating
//!
//! Exposes a small HTTP API over stored chats and the running session.

pub mod chat;
pub mod config;
pub mod inference;
pub mod server;
