//! Chat controller: ties one inference session to stored conversations.
//!
//! Handles the orchestration a chat screen needs: load the model configured
//! for a chat and replay its history, send queries while persisting both
//! sides of the exchange, and stop or switch conversations without losing a
//! partially generated answer.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chat::store::{Chat, ConversationStore, StoreError};
use crate::inference::backend::{GenerationParams, Role};
use crate::inference::model_catalog::{CatalogError, ModelCatalog, ModelEntry};
use crate::inference::replay::{replay_history, ChatTurn};
use crate::inference::session::{InferenceSession, SessionError, SessionState};
use crate::inference::stream::{GenerationEvent, GenerationOutcome, GenerationStream};

#[derive(Error, Debug)]
pub enum ChatError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Chat {chat_id} needs a model selected: {reason}")]
    ModelSelectionRequired { chat_id: Uuid, reason: String },

    #[error("No chat is active")]
    NoActiveChat,
}

/// Shared model catalog.
pub type SharedCatalog = Arc<RwLock<ModelCatalog>>;

pub struct ChatController {
    session: InferenceSession,
    store: Arc<dyn ConversationStore>,
    catalog: SharedCatalog,
    defaults: GenerationParams,
    current_chat: Option<Uuid>,

    /// Forwards the running generation and saves its answer.
    persister: Option<JoinHandle<GenerationOutcome>>,
}

impl ChatController {
    pub fn new(
        session: InferenceSession,
        store: Arc<dyn ConversationStore>,
        catalog: SharedCatalog,
        defaults: GenerationParams,
    ) -> Self {
        Self {
            session,
            store,
            catalog,
            defaults,
            current_chat: None,
            persister: None,
        }
    }

    pub fn current_chat(&self) -> Option<Uuid> {
        self.current_chat
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    pub fn store(&self) -> Arc<dyn ConversationStore> {
        self.store.clone()
    }

    pub fn catalog(&self) -> SharedCatalog {
        self.catalog.clone()
    }

    /// Create a chat using the configured default sampling parameters.
    pub async fn create_chat(
        &self,
        name: &str,
        system_prompt: &str,
        model_id: Option<u64>,
    ) -> Result<Chat, ChatError> {
        let mut chat = Chat::new(name, &self.defaults);
        chat.system_prompt = system_prompt.to_string();
        chat.model_id = model_id;
        Ok(self.store.create_chat(chat).await?)
    }

    /// Make `chat_id` current and load its model, replaying its history.
    ///
    /// Returns the number of messages replayed into the new session.
    pub async fn load_model(&mut self, chat_id: Uuid) -> Result<usize, ChatError> {
        self.switch_chat(chat_id).await?;
        let chat = self.store.get_chat(chat_id).await?;

        let Some(model_id) = chat.model_id else {
            return Err(ChatError::ModelSelectionRequired {
                chat_id,
                reason: "no model configured".to_string(),
            });
        };

        let path = match self.catalog.read().await.resolve(model_id) {
            Ok(path) => path,
            Err(e) => {
                return Err(ChatError::ModelSelectionRequired {
                    chat_id,
                    reason: e.to_string(),
                })
            }
        };

        self.session.create(path, chat.params()).await?;

        let turns: Vec<ChatTurn> = self
            .store
            .turns(chat_id)
            .await?
            .iter()
            .map(ChatTurn::from)
            .collect();
        let replayed = replay_history(&self.session, Some(chat.system_prompt.as_str()), &turns).await?;

        info!(chat_id = %chat_id, model_id, replayed, "Model loaded for chat");
        Ok(replayed)
    }

    /// Send `query` in the current chat.
    ///
    /// The user turn is stored before generation starts. Whatever text the
    /// generation produced is stored as an assistant turn before the returned
    /// stream delivers its terminal event, including after cancellation or
    /// failure.
    pub async fn send_query(&mut self, query: &str) -> Result<GenerationStream, ChatError> {
        let chat_id = self.current_chat.ok_or(ChatError::NoActiveChat)?;

        match self.session.state() {
            SessionState::Ready => {}
            SessionState::Generating => return Err(SessionError::Busy.into()),
            SessionState::Unloaded | SessionState::Loading => {
                return Err(SessionError::NotReady.into())
            }
        }
        if query.is_empty() {
            return Err(SessionError::InvalidQuery("empty query".to_string()).into());
        }

        // The previous answer must land before this question.
        self.settle_persister().await;

        let mut chat = self.store.get_chat(chat_id).await?;
        chat.used_at = chrono::Utc::now();
        self.store.update_chat(&chat).await?;
        self.store.append_turn(chat_id, Role::User, query).await?;

        let inner = self.session.start_query(query).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = GenerationStream::new(inner.request_id().to_string(), rx, inner.cancel_token());

        self.persister = Some(tokio::spawn(persist_response(
            inner,
            tx,
            self.store.clone(),
            chat_id,
        )));

        Ok(stream)
    }

    /// Stop the in-flight generation. Its partial answer is saved before this returns.
    ///
    /// Returns `None` when nothing was generating.
    pub async fn stop_generation(&mut self) -> Option<GenerationOutcome> {
        let cancelled = self.session.cancel().await;
        // A finished run still has to be saved before the caller moves on.
        let persisted = self.settle_persister().await;
        cancelled.map(|outcome| persisted.unwrap_or(outcome))
    }

    /// Make `chat_id` the current chat, stopping any generation first.
    pub async fn switch_chat(&mut self, chat_id: Uuid) -> Result<Chat, ChatError> {
        let chat = self.store.get_chat(chat_id).await?;
        self.stop_generation().await;
        self.current_chat = Some(chat_id);
        Ok(chat)
    }

    /// Persist new settings for a chat and reload its model with them.
    pub async fn update_chat(&mut self, chat: Chat) -> Result<usize, ChatError> {
        self.store.update_chat(&chat).await?;
        self.load_model(chat.id).await
    }

    pub async fn delete_chat(&mut self, chat_id: Uuid) -> Result<(), ChatError> {
        if self.current_chat == Some(chat_id) {
            self.stop_generation().await;
            self.current_chat = None;
        }
        self.store.delete_chat(chat_id).await?;
        info!(chat_id = %chat_id, "Chat deleted");
        Ok(())
    }

    /// Remove a model from the catalog (and disk). If the current chat uses
    /// it, the chat forgets the model and the session is closed.
    pub async fn delete_model(&mut self, model_id: u64) -> Result<ModelEntry, ChatError> {
        let entry = self.catalog.write().await.remove(model_id, true)?;

        if let Some(chat_id) = self.current_chat {
            let mut chat = self.store.get_chat(chat_id).await?;
            if chat.model_id == Some(model_id) {
                chat.model_id = None;
                self.store.update_chat(&chat).await?;
                self.stop_generation().await;
                self.session.close().await;
            }
        }

        info!(model_id, name = entry.name, "Model deleted");
        Ok(entry)
    }

    /// Stop generating and release the model.
    pub async fn shutdown(&mut self) {
        self.stop_generation().await;
        self.session.close().await;
    }

    async fn settle_persister(&mut self) -> Option<GenerationOutcome> {
        let handle = self.persister.take()?;
        match handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(error = %e, "Response persister task failed");
                None
            }
        }
    }
}

/// Forward `inner` to `tx`, saving the accumulated text before the terminal event.
async fn persist_response(
    mut inner: GenerationStream,
    tx: mpsc::UnboundedSender<GenerationEvent>,
    store: Arc<dyn ConversationStore>,
    chat_id: Uuid,
) -> GenerationOutcome {
    let outcome = loop {
        match inner.next_event().await {
            Some(GenerationEvent::Piece(piece)) => {
                if tx.send(GenerationEvent::Piece(piece)).is_err() {
                    // Nobody is listening any more.
                    inner.cancel();
                }
            }
            Some(GenerationEvent::Finished(outcome)) => break outcome,
            None => break inner.finish().await,
        }
    };

    if !outcome.text.is_empty() {
        match store.append_turn(chat_id, Role::Assistant, &outcome.text).await {
            Ok(_) => info!(
                chat_id = %chat_id,
                request_id = outcome.request_id,
                end = outcome.end.as_str(),
                len = outcome.text.len(),
                "Assistant response saved"
            ),
            Err(e) => error!(
                chat_id = %chat_id,
                request_id = outcome.request_id,
                error = %e,
                "Failed to save assistant response"
            ),
        }
    } else if let Some(e) = outcome.error() {
        warn!(chat_id = %chat_id, error = %e, "Generation failed before producing text");
    }

    let _ = tx.send(GenerationEvent::Finished(outcome.clone()));
    outcome
}
