//! Conversation persistence.
//!
//! Stores chats and their turns in chronological (insertion) order. The
//! [`JsonStore`] keeps everything in memory and, when opened with a path,
//! rewrites one JSON document after every mutation (temp file + rename).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::inference::backend::{GenerationParams, Role};
use crate::inference::replay::ChatTurn;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Unknown chat: {0}")]
    UnknownChat(Uuid),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt store: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A conversation and the settings its session is created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: Uuid,
    pub name: String,

    /// Replayed first whenever a session is created for this chat.
    #[serde(default)]
    pub system_prompt: String,

    /// Catalog id of the model; `None` until one is selected.
    pub model_id: Option<u64>,

    pub min_p: f32,
    pub temperature: f32,

    /// Keep the conversation in the backend context between queries.
    #[serde(default = "default_store_chats")]
    pub store_chats: bool,

    pub created_at: DateTime<Utc>,
    pub used_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(name: impl Into<String>, params: &GenerationParams) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            system_prompt: String::new(),
            model_id: None,
            min_p: params.min_p,
            temperature: params.temperature,
            store_chats: params.store_chats,
            created_at: now,
            used_at: now,
        }
    }

    /// Parameters for the chat's session.
    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            min_p: self.min_p,
            temperature: self.temperature,
            store_chats: self.store_chats,
        }
    }
}

fn default_store_chats() -> bool {
    true
}

/// A persisted turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTurn {
    pub chat_id: Uuid,
    pub role: Role,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl From<&StoredTurn> for ChatTurn {
    fn from(turn: &StoredTurn) -> Self {
        ChatTurn::new(turn.role, turn.text.clone())
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_chat(&self, chat: Chat) -> Result<Chat, StoreError>;

    async fn get_chat(&self, id: Uuid) -> Result<Chat, StoreError>;

    /// All chats, most recently used first.
    async fn list_chats(&self) -> Result<Vec<Chat>, StoreError>;

    async fn update_chat(&self, chat: &Chat) -> Result<(), StoreError>;

    /// Delete a chat together with its turns.
    async fn delete_chat(&self, id: Uuid) -> Result<(), StoreError>;

    /// Turns of a chat in the order they were appended.
    async fn turns(&self, chat_id: Uuid) -> Result<Vec<StoredTurn>, StoreError>;

    async fn append_turn(
        &self,
        chat_id: Uuid,
        role: Role,
        text: &str,
    ) -> Result<StoredTurn, StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    chats: Vec<Chat>,
    turns: Vec<StoredTurn>,
}

impl StoreData {
    fn chat_mut(&mut self, id: Uuid) -> Result<&mut Chat, StoreError> {
        self.chats
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::UnknownChat(id))
    }
}

/// Chat store kept in memory, optionally mirrored to a JSON file.
pub struct JsonStore {
    path: Option<PathBuf>,
    data: RwLock<StoreData>,
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(StoreData::default()),
        }
    }

    /// Open the store at `path`, starting empty if the file does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = if path.exists() {
            let raw = fs::read(&path).await?;
            serde_json::from_slice(&raw)?
        } else {
            StoreData::default()
        };

        info!(
            path = %path.display(),
            chats = data.chats.len(),
            turns = data.turns.len(),
            "Opened chat store"
        );

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, data: &StoreData) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(data)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, path).await?;

        debug!(path = %path.display(), size = bytes.len(), "Persisted chat store");
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for JsonStore {
    async fn create_chat(&self, chat: Chat) -> Result<Chat, StoreError> {
        let mut data = self.data.write().await;
        data.chats.push(chat.clone());
        self.persist(&data).await?;
        Ok(chat)
    }

    async fn get_chat(&self, id: Uuid) -> Result<Chat, StoreError> {
        let data = self.data.read().await;
        data.chats
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or(StoreError::UnknownChat(id))
    }

    async fn list_chats(&self) -> Result<Vec<Chat>, StoreError> {
        let data = self.data.read().await;
        let mut chats = data.chats.clone();
        chats.sort_by(|a, b| b.used_at.cmp(&a.used_at));
        Ok(chats)
    }

    async fn update_chat(&self, chat: &Chat) -> Result<(), StoreError> {
        let mut data = self.data.write().await;
        *data.chat_mut(chat.id)? = chat.clone();
        self.persist(&data).await
    }

    async fn delete_chat(&self, id: Uuid) -> Result<(), StoreError> {
        let mut data = self.data.write().await;
        let before = data.chats.len();
        data.chats.retain(|c| c.id != id);
        if data.chats.len() == before {
            return Err(StoreError::UnknownChat(id));
        }
        data.turns.retain(|t| t.chat_id != id);
        self.persist(&data).await
    }

    async fn turns(&self, chat_id: Uuid) -> Result<Vec<StoredTurn>, StoreError> {
        let data = self.data.read().await;
        if !data.chats.iter().any(|c| c.id == chat_id) {
            return Err(StoreError::UnknownChat(chat_id));
        }
        Ok(data
            .turns
            .iter()
            .filter(|t| t.chat_id == chat_id)
            .cloned()
            .collect())
    }

    async fn append_turn(
        &self,
        chat_id: Uuid,
        role: Role,
        text: &str,
    ) -> Result<StoredTurn, StoreError> {
        let mut data = self.data.write().await;
        data.chat_mut(chat_id)?;

        let turn = StoredTurn {
            chat_id,
            role,
            text: text.to_string(),
            created_at: Utc::now(),
        };
        data.turns.push(turn.clone());
        self.persist(&data).await?;
        Ok(turn)
    }
}
