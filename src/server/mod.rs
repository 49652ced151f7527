//! Web server: shared state, routing, and startup

pub mod auth;
pub mod registry;
pub mod ws;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::providers::doubao::DoubaoLlm;
use crate::providers::volc_asr::VolcAsr;
use crate::providers::volc_tts::VolcTts;
use crate::providers::Providers;
use crate::server::registry::ConnectionRegistry;
use crate::store::memory::MemoryKeyedStore;
use crate::store::SessionStore;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub store: Arc<SessionStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub providers: Arc<Providers>,
    pub jwt_secret: String,
}

/// Build the full server state from configuration.
pub fn build_state(config: Config) -> ServerState {
    let jwt_secret = config.auth.jwt_secret.clone().unwrap_or_else(|| {
        warn!("no jwt_secret configured, generating an ephemeral one");
        generate_jwt_secret()
    });

    let providers = Arc::new(Providers {
        asr: Arc::new(VolcAsr::from_config(&config)),
        llm: Arc::new(DoubaoLlm::from_config(&config)),
        tts: Arc::new(VolcTts::from_config(&config)),
    });

    let store = Arc::new(SessionStore::new(Arc::new(MemoryKeyedStore::new()), &config));

    ServerState {
        config: Arc::new(config),
        store,
        registry: ConnectionRegistry::new(),
        providers,
        jwt_secret,
    }
}

/// Start the web server and serve until shutdown.
pub async fn start(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid listen address")?;

    let state = build_state(config);
    let app = router(state);

    info!("tutorlamp listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.context("Failed to bind listener")?;
    axum::serve(listener, app).await.context("Server error")
}

fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/healthz", get(health))
        .route("/ws/conversation/{conversation_id}", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<ServerState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "active_connections": state.registry.active_count(),
    }))
}

/// Generate a secure secret for connection tokens
pub fn generate_jwt_secret() -> String {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    BASE64.encode(bytes)
}
