//! HTTP server for health checks and WebRTC signaling
//!
//! Routes:
//! - `/ws`, `/webrtc`: signaling websocket
//! - `/health`: JSON status with the live connection count
//! - everything else: static files from the configured web root, falling
//!   back to `index.html`

use super::AppState;
use axum::{
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::{info, warn};
use serde_json::json;
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::services::{ServeDir, ServeFile};

/// Build the application router
pub fn router(state: AppState) -> Router {
    let app = Router::new()
        .route("/ws", get(signaling_handler))
        .route("/webrtc", get(signaling_handler))
        .route("/health", get(health_handler));

    let app = match &state.config.server.web_root {
        Some(root) => {
            let index_path = root.join("index.html");
            if !index_path.exists() {
                warn!("Web UI index not found at {:?}", index_path);
            }
            info!("Serving web UI from {:?}", root);
            app.fallback_service(ServeDir::new(root).fallback(ServeFile::new(index_path)))
        }
        None => app.fallback(not_found_handler),
    };

    app.with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn run_http_server(
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let app = router(state);

    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);
    info!("Signaling endpoint: ws://{}/ws", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    Ok(())
}

async fn signaling_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| crate::transport::handle_signaling_connection(socket, state))
}

/// Health check handler
async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.uptime().as_secs_f64(),
        "connections": state.registry.len(),
        "max_connections": state.registry.max_connections(),
        "codec": state.engine.codec().as_str(),
        "relay": if state.config.relay.enabled { state.config.relay.endpoint.as_str() } else { "disabled" },
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}
