//! Inference session: owns the single loaded backend behind one conversation.
//!
//! ```text
//! Unloaded ──create──▶ Loading ──ok──▶ Ready ──start_query──▶ Generating
//!     ▲                   │             ▲  │                      │
//!     │                   └──err────────┼──┼──────────────────────┘ terminal event
//!     └────────────── close ────────────┴──┘
//! ```
//!
//! Every backend primitive is serialized through one lock and executed on the
//! blocking pool, so the caller's task never blocks on model I/O.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::inference::backend::{BackendError, GenerationParams, ModelBackend, ModelLoader, Role};
use crate::inference::stream::{GenerationOutcome, GenerationStream, GenerationTask};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to load model {path}: {source}")]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: BackendError,
    },

    #[error("Session not ready: no model is loaded")]
    NotReady,

    #[error("Session is busy generating a response")]
    Busy,

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Backend task failed: {0}")]
    Task(String),
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
    Generating,
}

impl SessionState {
    pub fn is_initializing(&self) -> bool {
        *self == SessionState::Loading
    }

    pub fn is_generating(&self) -> bool {
        *self == SessionState::Generating
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Unloaded => write!(f, "unloaded"),
            SessionState::Loading => write!(f, "loading"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Generating => write!(f, "generating"),
        }
    }
}

/// The one backend a session may hold.
pub(crate) type BackendSlot = Arc<Mutex<Option<Box<dyn ModelBackend>>>>;

/// Run `f` against the loaded backend on the blocking pool.
pub(crate) async fn call_backend<R, F>(slot: &BackendSlot, f: F) -> Result<R, SessionError>
where
    F: FnOnce(&mut dyn ModelBackend) -> Result<R, BackendError> + Send + 'static,
    R: Send + 'static,
{
    let mut guard = slot.clone().lock_owned().await;
    tokio::task::spawn_blocking(move || match &mut *guard {
        Some(backend) => f(backend.as_mut()).map_err(SessionError::Backend),
        None => Err(SessionError::NotReady),
    })
    .await
    .map_err(|e| SessionError::Task(e.to_string()))?
}

/// Puts a session left in `Loading` back to `Unloaded` when a load is abandoned.
struct LoadingGuard {
    state: Arc<watch::Sender<SessionState>>,
    armed: bool,
}

impl LoadingGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let reset = self.state.send_if_modified(|state| {
            if *state == SessionState::Loading {
                *state = SessionState::Unloaded;
                true
            } else {
                false
            }
        });
        if reset {
            warn!("Model load abandoned, session left unloaded");
        }
    }
}

struct ActiveGeneration {
    request_id: String,
    cancel: CancellationToken,
    task: JoinHandle<GenerationOutcome>,
}

/// Owns one loaded model and the conversation context inside it.
pub struct InferenceSession {
    loader: Arc<dyn ModelLoader>,
    slot: BackendSlot,
    state: Arc<watch::Sender<SessionState>>,
    model_path: Option<PathBuf>,
    params: Option<GenerationParams>,
    active: Option<ActiveGeneration>,
}

impl InferenceSession {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        let (state, _) = watch::channel(SessionState::Unloaded);
        Self {
            loader,
            slot: Arc::new(Mutex::new(None)),
            state: Arc::new(state),
            model_path: None,
            params: None,
            active: None,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions (initializing / generating flags for a UI).
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    pub fn params(&self) -> Option<GenerationParams> {
        self.params
    }

    pub fn is_generating(&self) -> bool {
        self.state().is_generating()
    }

    /// Request id of the in-flight generation, if any.
    pub fn active_request(&self) -> Option<&str> {
        self.active
            .as_ref()
            .filter(|_| self.is_generating())
            .map(|a| a.request_id.as_str())
    }

    fn set_state(&self, state: SessionState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            debug!(from = %prev, to = %state, "Session state change");
        }
    }

    /// Load `model_path`, replacing any backend this session already holds.
    ///
    /// An in-flight generation is cancelled first and its terminal event
    /// delivered before loading starts. On failure, or if this future is
    /// dropped before the load settles, the session is left unloaded.
    pub async fn create(
        &mut self,
        model_path: impl Into<PathBuf>,
        params: GenerationParams,
    ) -> Result<(), SessionError> {
        let path = model_path.into();

        if let Some(outcome) = self.cancel().await {
            debug!(
                request_id = outcome.request_id,
                end = outcome.end.as_str(),
                "Previous generation settled before reload"
            );
        }
        self.release().await;

        self.set_state(SessionState::Loading);
        let guard = LoadingGuard {
            state: self.state.clone(),
            armed: true,
        };
        info!(
            path = %path.display(),
            min_p = params.min_p,
            temperature = params.temperature,
            store_chats = params.store_chats,
            "Creating session"
        );

        let start = Instant::now();
        let loader = self.loader.clone();
        let load_path = path.clone();
        let loaded = tokio::task::spawn_blocking(move || loader.load(&load_path, &params))
            .await
            .unwrap_or_else(|e| Err(BackendError::ModelLoadFailed(e.to_string())));

        match loaded {
            Ok(backend) => {
                *self.slot.lock().await = Some(backend);
                self.model_path = Some(path);
                self.params = Some(params);
                self.set_state(SessionState::Ready);
                guard.disarm();
                info!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Session ready"
                );
                Ok(())
            }
            Err(source) => {
                self.set_state(SessionState::Unloaded);
                guard.disarm();
                warn!(path = %path.display(), error = %source, "Model load failed");
                Err(SessionError::ModelLoad { path, source })
            }
        }
    }

    pub async fn add_system_prompt(&self, text: &str) -> Result<(), SessionError> {
        self.add_message(Role::System, text).await
    }

    pub async fn add_user_turn(&self, text: &str) -> Result<(), SessionError> {
        self.add_message(Role::User, text).await
    }

    pub async fn add_assistant_turn(&self, text: &str) -> Result<(), SessionError> {
        self.add_message(Role::Assistant, text).await
    }

    /// Append one labelled message to the backend context.
    pub async fn add_message(&self, role: Role, text: &str) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let text = text.to_string();
        call_backend(&self.slot, move |b| b.add_message(role, &text)).await
    }

    /// Start generating a response to `query`.
    pub async fn start_query(&mut self, query: &str) -> Result<GenerationStream, SessionError> {
        self.ensure_ready()?;
        if query.is_empty() {
            return Err(SessionError::InvalidQuery("empty query".to_string()));
        }

        // The previous run already reported Ready; its task is finishing or done.
        if let Some(prev) = self.active.take() {
            settle_finished(prev).await;
        }

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        self.set_state(SessionState::Generating);

        let task = GenerationTask {
            request_id: request_id.clone(),
            query: query.to_string(),
            slot: self.slot.clone(),
            state: self.state.clone(),
            tx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run());

        self.active = Some(ActiveGeneration {
            request_id: request_id.clone(),
            cancel: cancel.clone(),
            task: handle,
        });

        Ok(GenerationStream::new(request_id, rx, cancel))
    }

    /// Cancel the in-flight generation and wait for it to settle.
    ///
    /// Returns its outcome, or `None` when nothing is generating.
    pub async fn cancel(&mut self) -> Option<GenerationOutcome> {
        let active = self.active.take()?;
        if !self.is_generating() {
            // Already reported through its stream.
            settle_finished(active).await;
            return None;
        }
        active.cancel.cancel();

        match active.task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(request_id = active.request_id, error = %e, "Generation task aborted");
                let loaded = self.slot.lock().await.is_some();
                self.set_state(if loaded {
                    SessionState::Ready
                } else {
                    SessionState::Unloaded
                });
                None
            }
        }
    }

    /// Release the backend. Safe to call at any time, including twice.
    pub async fn close(&mut self) {
        self.cancel().await;
        self.release().await;
        self.set_state(SessionState::Unloaded);
    }

    async fn release(&mut self) {
        let backend = self.slot.lock().await.take();
        self.model_path = None;
        self.params = None;

        if let Some(backend) = backend {
            // Freeing model weights can be slow.
            if let Err(e) = tokio::task::spawn_blocking(move || drop(backend)).await {
                warn!(error = %e, "Backend release panicked");
            }
            info!("Backend released");
        }
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Generating => Err(SessionError::Busy),
            SessionState::Unloaded | SessionState::Loading => Err(SessionError::NotReady),
        }
    }
}

/// Await a generation whose terminal event was already delivered.
async fn settle_finished(prev: ActiveGeneration) {
    match prev.task.await {
        Ok(outcome) => debug!(
            request_id = prev.request_id,
            end = outcome.end.as_str(),
            "Previous generation settled"
        ),
        Err(e) => warn!(
            request_id = prev.request_id,
            error = %e,
            "Previous generation task failed"
        ),
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }
}
