use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{info, warn};

use inference_session::chat::controller::ChatController;
use inference_session::chat::store::{ConversationStore, JsonStore};
use inference_session::config::{Cli, Config};
use inference_session::inference::llama_ffi::LlamaLoader;
use inference_session::inference::model_catalog::ModelCatalog;
use inference_session::inference::session::InferenceSession;
use inference_session::server::api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "inference_session=debug,tower_http=debug"
    } else {
        "inference_session=info,tower_http=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("inference-session v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    let config = Arc::new(config);

    info!(
        models_dir = %config.models.dir.display(),
        context_size = config.models.context_size,
        min_p = config.generation.min_p,
        temperature = config.generation.temperature,
        store_chats = config.generation.store_chats,
        "Configuration loaded"
    );

    // Discover models.
    let mut catalog = match ModelCatalog::scan(&config.models.dir) {
        Ok(catalog) => catalog,
        Err(e) => {
            warn!(dir = %config.models.dir.display(), error = %e, "Model scan failed, starting with an empty catalog");
            ModelCatalog::new()
        }
    };
    let pruned = catalog.prune_missing();
    info!(models = catalog.len(), pruned = pruned.len(), "Model catalog ready");

    // Open chat storage.
    let store: Arc<dyn ConversationStore> = match &config.store.path {
        Some(path) => Arc::new(JsonStore::open(path).await?),
        None => Arc::new(JsonStore::in_memory()),
    };

    // Build the session and the controller that drives it.
    let loader = Arc::new(LlamaLoader::new(config.models.context_params()));
    let session = InferenceSession::new(loader);
    let controller = ChatController::new(
        session,
        store,
        Arc::new(RwLock::new(catalog)),
        config.generation.params(),
    );

    let state = Arc::new(AppState::new(controller, config.clone())?);
    let app = build_router(state.clone());

    // Start the server.
    let listen_addr = config.server.listen.clone();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    state.controller.lock().await.shutdown().await;
    info!("Session closed");

    Ok(())
}
