//! Conversation history replay.
//!
//! A freshly created session has an empty context. Replaying feeds the
//! system prompt and every persisted turn back into the backend, in the order
//! they originally happened, before the session takes new queries.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::inference::backend::Role;
use crate::inference::session::{InferenceSession, SessionError};

/// One role-tagged message of conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

impl ChatTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }
}

/// Replay `system_prompt` (when non-empty) and then `turns` into `session`.
///
/// Turns are applied exactly in iteration order, without reordering,
/// deduplication or truncation. Stops at the first failure. Returns the
/// number of messages added.
pub async fn replay_history<'a, I>(
    session: &InferenceSession,
    system_prompt: Option<&str>,
    turns: I,
) -> Result<usize, SessionError>
where
    I: IntoIterator<Item = &'a ChatTurn>,
{
    let mut added = 0;

    if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
        session.add_system_prompt(prompt).await?;
        debug!(len = prompt.len(), "System prompt added");
        added += 1;
    }

    for turn in turns {
        session.add_message(turn.role, &turn.text).await?;
        debug!(role = %turn.role, len = turn.text.len(), "Turn replayed");
        added += 1;
    }

    info!(messages = added, "History replayed");
    Ok(added)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::inference::backend::GenerationParams;
    use crate::inference::scripted::{BackendCall, ScriptedLoader, ScriptedStep};

    #[tokio::test]
    async fn test_empty_system_prompt_is_skipped() {
        let loader = ScriptedLoader::new(ScriptedStep::pieces(&[]));
        let log = loader.log();
        let mut session = InferenceSession::new(Arc::new(loader));
        session.create("m.gguf", GenerationParams::default()).await.unwrap();

        let turns = vec![ChatTurn::user("hi")];
        let added = replay_history(&session, Some(""), &turns).await.unwrap();

        assert_eq!(added, 1);
        assert_eq!(log.messages(), vec![(Role::User, "hi".to_string())]);
    }

    #[tokio::test]
    async fn test_replay_on_unloaded_session_makes_no_calls() {
        let loader = ScriptedLoader::new(ScriptedStep::pieces(&[]));
        let log = loader.log();
        let session = InferenceSession::new(Arc::new(loader));

        let turns = vec![ChatTurn::user("hi")];
        let err = replay_history(&session, Some("sys"), &turns).await.unwrap_err();

        assert!(matches!(err, SessionError::NotReady));
        assert_eq!(log.count(&BackendCall::AddMessage(Role::System, "sys".into())), 0);
        assert!(log.is_empty());
    }
}
