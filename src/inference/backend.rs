//! Native backend call surface.
//!
//! The model-execution library is reached through two traits:
//! - [`ModelLoader`] turns a model file plus sampling parameters into a live backend
//! - [`ModelBackend`] is the loaded instance and its per-turn primitives
//!
//! Backends are not safe for concurrent use. The session funnels every call
//! through one lock and runs it on the blocking pool.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Marker the native step primitive returns once no more pieces follow.
pub const END_OF_GENERATION: &str = "[EOG]";

/// Errors raised by backend primitives.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Invalid model path: {0}")]
    InvalidPath(PathBuf),

    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Context size exceeded: {used} tokens, max {max}")]
    ContextExceeded { used: usize, max: usize },

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Chat template failed: {0}")]
    TemplateFailed(String),

    #[error("Backend is not loaded")]
    NotLoaded,
}

/// Message role inside the backend context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sampling parameters bound when a model is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Probability floor for min-p filtering, in [0, 1].
    pub min_p: f32,

    /// Sampling temperature.
    pub temperature: f32,

    /// Whether the backend keeps the conversation across completions.
    pub store_chats: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            min_p: 0.05,
            temperature: 1.0,
            store_chats: true,
        }
    }
}

/// Result of one step primitive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// A generated fragment of text (possibly empty when the backend filtered a format token).
    Piece(String),
    /// The end-of-generation marker.
    EndOfGeneration,
}

impl Step {
    /// Map the raw string the native step returns onto a [`Step`].
    pub fn from_raw(raw: String) -> Self {
        if raw == END_OF_GENERATION {
            Step::EndOfGeneration
        } else {
            Step::Piece(raw)
        }
    }
}

/// A loaded model instance. Dropping it releases every native resource.
pub trait ModelBackend: Send + 'static {
    /// Append one labelled message to the backend context.
    fn add_message(&mut self, role: Role, text: &str) -> Result<(), BackendError>;

    /// Begin a completion for `prompt`.
    fn start_completion(&mut self, prompt: &str) -> Result<(), BackendError>;

    /// Produce the next piece, or the end-of-generation marker.
    fn step(&mut self) -> Result<Step, BackendError>;

    /// Finish a completion that ran to its end marker.
    fn stop_completion(&mut self) -> Result<(), BackendError>;

    /// Abandon the current completion, discarding its generation state.
    fn cancel_completion(&mut self) -> Result<(), BackendError>;
}

/// Loads model files into backend instances.
pub trait ModelLoader: Send + Sync + 'static {
    fn load(
        &self,
        path: &Path,
        params: &GenerationParams,
    ) -> Result<Box<dyn ModelBackend>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_from_raw() {
        assert_eq!(Step::from_raw("[EOG]".to_string()), Step::EndOfGeneration);
        assert_eq!(Step::from_raw("Hi".to_string()), Step::Piece("Hi".to_string()));
        assert_eq!(Step::from_raw(String::new()), Step::Piece(String::new()));
    }

    #[test]
    fn test_role_serde() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        let role: Role = serde_json::from_str("\"system\"").unwrap();
        assert_eq!(role, Role::System);
    }
}
