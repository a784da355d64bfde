//! HTTP API for chats, models and the inference session.
//!
//! - GET /health, GET /metrics
//! - GET /v1/models, DELETE /v1/models/{id}
//! - GET|POST /v1/chats, GET|PUT|DELETE /v1/chats/{id}
//! - GET|POST /v1/chats/{id}/messages
//! - POST /v1/chats/{id}/load
//! - POST /v1/generation/cancel
//! - GET /v1/session/events, POST /v1/session/close

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chat::controller::{ChatController, ChatError, SharedCatalog};
use crate::chat::store::{Chat, ConversationStore, StoreError, StoredTurn};
use crate::config::Config;
use crate::inference::model_catalog::{CatalogError, ModelEntry};
use crate::inference::session::{SessionError, SessionState};
use crate::inference::stream::{OutcomeSummary, StreamEnd};
use crate::server::metrics::ServerMetrics;
use crate::server::streaming::generation_to_sse_stream;

/// Application state shared across handlers.
pub struct AppState {
    /// Serializes every operation that touches the session.
    pub controller: Mutex<ChatController>,
    pub store: Arc<dyn ConversationStore>,
    pub catalog: SharedCatalog,
    pub session_state: watch::Receiver<SessionState>,
    pub metrics: Arc<ServerMetrics>,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(controller: ChatController, config: Arc<Config>) -> prometheus::Result<Self> {
        Ok(Self {
            store: controller.store(),
            catalog: controller.catalog(),
            session_state: controller.subscribe(),
            controller: Mutex::new(controller),
            metrics: Arc::new(ServerMetrics::new()?),
            config,
            start_time: Instant::now(),
        })
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/models", get(list_models))
        .route("/v1/models/{id}", axum::routing::delete(delete_model))
        .route("/v1/chats", get(list_chats).post(create_chat))
        .route(
            "/v1/chats/{id}",
            get(get_chat).put(update_chat).delete(delete_chat),
        )
        .route("/v1/chats/{id}/messages", get(list_messages).post(send_message))
        .route("/v1/chats/{id}/load", post(load_chat))
        .route("/v1/generation/cancel", post(cancel_generation))
        .route("/v1/session/events", get(session_events))
        .route("/v1/session/close", post(close_session))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ─── Errors ────────────────────────────────────────────────────────────────

/// Error returned by handlers, rendered as `{"error": ...}`.
#[derive(Debug)]
pub enum ApiError {
    Chat(ChatError),
    Timeout(Duration),
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        ApiError::Chat(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Chat(err.into())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Chat(err) => match err {
                ChatError::Session(SessionError::NotReady | SessionError::Busy) => {
                    StatusCode::CONFLICT
                }
                ChatError::Session(SessionError::InvalidQuery(_)) => StatusCode::BAD_REQUEST,
                ChatError::Session(SessionError::ModelLoad { .. }) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                ChatError::Store(StoreError::UnknownChat(_)) => StatusCode::NOT_FOUND,
                ChatError::Catalog(
                    CatalogError::UnknownModel(_) | CatalogError::FileNotFound(_),
                ) => StatusCode::NOT_FOUND,
                ChatError::ModelSelectionRequired { .. } | ChatError::NoActiveChat => {
                    StatusCode::CONFLICT
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match &self {
            ApiError::Chat(e) => e.to_string(),
            ApiError::Timeout(d) => format!("Generation timed out after {}s", d.as_secs()),
        };
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %error, "Request failed");
        }
        (status, Json(ErrorBody { error })).into_response()
    }
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub session: SessionState,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Serialize)]
pub struct ChatList {
    pub data: Vec<Chat>,
}

#[derive(Debug, Serialize)]
pub struct MessageList {
    pub chat_id: Uuid,
    pub data: Vec<StoredTurn>,
}

#[derive(Debug, Deserialize)]
pub struct CreateChatRequest {
    pub name: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub model_id: Option<u64>,
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateChatRequest {
    pub name: Option<String>,
    pub system_prompt: Option<String>,
    pub model_id: Option<u64>,
    pub min_p: Option<f32>,
    pub temperature: Option<f32>,
    pub store_chats: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct UpdateChatResponse {
    pub chat: Chat,
    /// Messages replayed into the reloaded session; `None` when no model is selected.
    pub replayed: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LoadResponse {
    pub chat_id: Uuid,
    pub replayed: usize,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub stream: bool,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        session: *state.session_state.borrow(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    let mut catalog = state.catalog.write().await;
    catalog.prune_missing();
    Json(ModelList {
        data: catalog.list(),
    })
}

async fn delete_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<ModelEntry>, ApiError> {
    let entry = state.controller.lock().await.delete_model(id).await?;
    Ok(Json(entry))
}

async fn list_chats(State(state): State<Arc<AppState>>) -> Result<Json<ChatList>, ApiError> {
    Ok(Json(ChatList {
        data: state.store.list_chats().await?,
    }))
}

async fn create_chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateChatRequest>,
) -> Result<(StatusCode, Json<Chat>), ApiError> {
    let chat = state
        .controller
        .lock()
        .await
        .create_chat(&req.name, &req.system_prompt, req.model_id)
        .await?;
    info!(chat_id = %chat.id, name = chat.name, "Chat created");
    Ok((StatusCode::CREATED, Json(chat)))
}

async fn get_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Chat>, ApiError> {
    Ok(Json(state.store.get_chat(id).await?))
}

async fn update_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateChatRequest>,
) -> Result<Json<UpdateChatResponse>, ApiError> {
    let mut chat = state.store.get_chat(id).await?;
    if let Some(name) = req.name {
        chat.name = name;
    }
    if let Some(system_prompt) = req.system_prompt {
        chat.system_prompt = system_prompt;
    }
    if req.model_id.is_some() {
        chat.model_id = req.model_id;
    }
    if let Some(min_p) = req.min_p {
        chat.min_p = min_p;
    }
    if let Some(temperature) = req.temperature {
        chat.temperature = temperature;
    }
    if let Some(store_chats) = req.store_chats {
        chat.store_chats = store_chats;
    }

    let replayed = match state.controller.lock().await.update_chat(chat.clone()).await {
        Ok(n) => {
            state.metrics.record_load(true);
            Some(n)
        }
        Err(ChatError::ModelSelectionRequired { .. }) => None,
        Err(e) => {
            state.metrics.record_load(false);
            return Err(e.into());
        }
    };
    Ok(Json(UpdateChatResponse { chat, replayed }))
}

async fn delete_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.controller.lock().await.delete_chat(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageList>, ApiError> {
    Ok(Json(MessageList {
        chat_id: id,
        data: state.store.turns(id).await?,
    }))
}

async fn load_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<LoadResponse>, ApiError> {
    let result = state.controller.lock().await.load_model(id).await;
    state.metrics.record_load(result.is_ok());
    let replayed = result?;
    Ok(Json(LoadResponse {
        chat_id: id,
        replayed,
    }))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Response, ApiError> {
    let stream = {
        let mut controller = state.controller.lock().await;
        if controller.current_chat() != Some(id)
            || controller.session_state() == SessionState::Unloaded
        {
            let loaded = controller.load_model(id).await;
            state.metrics.record_load(loaded.is_ok());
            loaded?;
        }
        controller.send_query(&req.content).await?
    };

    info!(
        chat_id = %id,
        request_id = stream.request_id(),
        stream = req.stream,
        "Message accepted"
    );

    if req.stream {
        let events = generation_to_sse_stream(stream, state.metrics.clone());
        return Ok(Sse::new(events).keep_alive(KeepAlive::default()).into_response());
    }

    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    let cancel = stream.cancel_token();
    let outcome = match tokio::time::timeout(timeout, stream.finish()).await {
        Ok(outcome) => outcome,
        Err(_) => {
            cancel.cancel();
            return Err(ApiError::Timeout(timeout));
        }
    };

    state.metrics.record_outcome(&outcome);
    let status = match outcome.end {
        StreamEnd::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    Ok((status, Json(OutcomeSummary::from(&outcome))).into_response())
}

async fn cancel_generation(State(state): State<Arc<AppState>>) -> Response {
    match state.controller.lock().await.stop_generation().await {
        Some(outcome) => Json(OutcomeSummary::from(&outcome)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn session_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = WatchStream::new(state.session_state.clone()).map(|session| {
        Ok(Event::default()
            .event("state")
            .data(session.to_string()))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn close_session(State(state): State<Arc<AppState>>) -> StatusCode {
    state.controller.lock().await.shutdown().await;
    StatusCode::NO_CONTENT
}
