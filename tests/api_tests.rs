//! HTTP API tests driven through the router without binding a socket.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::RwLock;
use tower::ServiceExt;

use inference_session::chat::controller::ChatController;
use inference_session::chat::store::JsonStore;
use inference_session::config::Config;
use inference_session::inference::backend::GenerationParams;
use inference_session::inference::model_catalog::ModelCatalog;
use inference_session::inference::scripted::{ScriptedLoader, ScriptedStep};
use inference_session::inference::session::InferenceSession;
use inference_session::server::api::{build_router, AppState};

fn test_app(script: Vec<ScriptedStep>) -> (Router, TempDir) {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("tiny.gguf"), b"GGUF").unwrap();
    let catalog = ModelCatalog::scan(dir.path()).unwrap();

    let controller = ChatController::new(
        InferenceSession::new(Arc::new(ScriptedLoader::new(script))),
        Arc::new(JsonStore::in_memory()),
        Arc::new(RwLock::new(catalog)),
        GenerationParams::default(),
    );
    let state = Arc::new(AppState::new(controller, Arc::new(Config::default())).unwrap());
    (build_router(state), dir)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = match body {
        Some(v) => Body::from(v.to_string()),
        None => Body::empty(),
    };
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, value)
}

async fn create_chat(app: &Router, model_id: Option<u64>) -> String {
    let (status, chat) = call(
        app,
        Method::POST,
        "/v1/chats",
        Some(json!({ "name": "test", "system_prompt": "be brief", "model_id": model_id })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    chat["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_reports_unloaded_session() {
    let (app, _dir) = test_app(vec![]);
    let (status, body) = call(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["session"], "unloaded");
}

#[tokio::test]
async fn test_list_models() {
    let (app, _dir) = test_app(vec![]);
    let (status, body) = call(&app, Method::GET, "/v1/models", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["name"], "tiny");
}

#[tokio::test]
async fn test_list_models_drops_deleted_files() {
    let (app, dir) = test_app(vec![]);
    std::fs::remove_file(dir.path().join("tiny.gguf")).unwrap();

    let (status, body) = call(&app, Method::GET, "/v1/models", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_update_chat_can_disable_stored_history() {
    let (app, _dir) = test_app(vec![]);
    let chat_id = create_chat(&app, Some(1)).await;

    let (status, body) = call(
        &app,
        Method::PUT,
        &format!("/v1/chats/{chat_id}"),
        Some(json!({ "store_chats": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["chat"]["store_chats"], false);
}

#[tokio::test]
async fn test_send_message_round_trip() {
    let (app, _dir) = test_app(ScriptedStep::pieces(&["Sure", "!"]));
    let chat_id = create_chat(&app, Some(1)).await;

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/v1/chats/{chat_id}/messages"),
        Some(json!({ "content": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["text"], "Sure!");
    assert_eq!(body["finish_reason"], "completed");

    let (status, body) = call(
        &app,
        Method::GET,
        &format!("/v1/chats/{chat_id}/messages"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let turns = body["data"].as_array().unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0]["role"], "user");
    assert_eq!(turns[1]["role"], "assistant");
    assert_eq!(turns[1]["text"], "Sure!");

    let (_, health) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(health["session"], "ready");
}

#[tokio::test]
async fn test_streaming_message_ends_with_done() {
    let (app, _dir) = test_app(ScriptedStep::pieces(&["a", "b"]));
    let chat_id = create_chat(&app, Some(1)).await;

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/v1/chats/{chat_id}/messages"),
        Some(json!({ "content": "go", "stream": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let text = body.as_str().unwrap();
    assert_eq!(text.matches("event: piece").count(), 2);
    assert!(text.contains("event: completed"));
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn test_message_without_model_is_conflict() {
    let (app, _dir) = test_app(vec![]);
    let chat_id = create_chat(&app, None).await;

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/v1/chats/{chat_id}/messages"),
        Some(json!({ "content": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("needs a model"));
}

#[tokio::test]
async fn test_empty_message_is_bad_request() {
    let (app, _dir) = test_app(vec![]);
    let chat_id = create_chat(&app, Some(1)).await;

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/v1/chats/{chat_id}/messages"),
        Some(json!({ "content": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_chat_is_not_found() {
    let (app, _dir) = test_app(vec![]);
    let uri = format!("/v1/chats/{}", uuid::Uuid::new_v4());

    let (status, _) = call(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_load_update_and_delete_chat() {
    let (app, _dir) = test_app(vec![]);
    let chat_id = create_chat(&app, Some(1)).await;

    let (status, body) = call(&app, Method::POST, &format!("/v1/chats/{chat_id}/load"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["replayed"], 1);

    let (status, body) = call(
        &app,
        Method::PUT,
        &format!("/v1/chats/{chat_id}"),
        Some(json!({ "name": "renamed", "temperature": 0.5 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["chat"]["name"], "renamed");
    assert_eq!(body["replayed"], 1);

    let (status, _) = call(&app, Method::DELETE, &format!("/v1/chats/{chat_id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = call(&app, Method::GET, "/v1/chats", None).await;
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_without_generation_is_no_content() {
    let (app, _dir) = test_app(ScriptedStep::pieces(&["done"]));
    let (status, _) = call(&app, Method::POST, "/v1/generation/cancel", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let chat_id = create_chat(&app, Some(1)).await;
    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/v1/chats/{chat_id}/messages"),
        Some(json!({ "content": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["finish_reason"], "completed");

    // The finished run is not reported again.
    let (status, _) = call(&app, Method::POST, "/v1/generation/cancel", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(&app, Method::POST, "/v1/session/close", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_metrics_count_generations() {
    let (app, _dir) = test_app(ScriptedStep::pieces(&["x"]));
    let chat_id = create_chat(&app, Some(1)).await;
    call(
        &app,
        Method::POST,
        &format!("/v1/chats/{chat_id}/messages"),
        Some(json!({ "content": "hi" })),
    )
    .await;

    let (status, body) = call(&app, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains(r#"generations_total{finish_reason="completed"} 1"#));
    assert!(text.contains(r#"model_loads_total{result="ok"} 1"#));
}
