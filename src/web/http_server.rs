//! HTTP server for health checks and WebRTC signaling
//!
//! `/health`, `/turn` (ICE servers and connect timeout for the web client),
//! the signaling WebSocket, and the built web client as a single-page-app
//! fallback.

use crate::transport::handle_signaling_connection;
use crate::web::shared::SharedState;
use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use log::{info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::services::{ServeDir, ServeFile};

/// Frames above this size abort the socket; smaller oversized frames get an
/// error reply from the parser instead
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Build the application router
pub fn build_router(state: Arc<SharedState>) -> Router {
    let signaling_path = state.config.signaling.path.clone();
    let web_root = state.config.http.web_root.clone();
    let index_path = web_root.join("index.html");
    if !index_path.exists() {
        info!("Web client index not found at {:?}", index_path);
    }

    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/turn", get(turn_config_handler))
        .route(&signaling_path, get(signaling_handler));
    if signaling_path != "/socket" {
        app = app.route("/socket", get(signaling_handler));
    }

    let static_service = ServeDir::new(&web_root).fallback(ServeFile::new(index_path));
    app.fallback_service(static_service).with_state(state)
}

/// Bind the configured address and serve until the listener fails
pub async fn run_http_server(state: Arc<SharedState>) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);
    info!(
        "Signaling endpoint at ws://{}{} (relay policy: {})",
        addr,
        state.config.signaling.path,
        state.registry.policy().as_str()
    );
    serve(listener, state).await
}

/// Serve on an already bound listener
pub async fn serve(listener: TcpListener, state: Arc<SharedState>) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_router(state);
    axum::serve(listener, app)
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;
    Ok(())
}

/// Health check handler
async fn health_handler(State(state): State<Arc<SharedState>>) -> Json<Value> {
    Json(json!({
        "status": "OK",
        "message": "Server is running",
        "uptime_seconds": state.uptime().as_secs_f64(),
        "participants": state.connection_count(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// STUN/TURN servers and negotiation limits for the browser client
async fn turn_config_handler(State(state): State<Arc<SharedState>>) -> Json<Value> {
    let negotiation = &state.config.negotiation;
    Json(json!({
        "iceServers": negotiation.ice_servers,
        "connectTimeoutSecs": negotiation.connect_timeout_secs,
    }))
}

async fn signaling_handler(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers.get(header::ORIGIN);
    if !origin_allowed(&state.config.http.allowed_origins, origin) {
        warn!("Rejected signaling upgrade from origin {:?}", origin);
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_signaling_connection(socket, state))
}

/// Empty allow-list accepts any origin; otherwise the header must match
fn origin_allowed(allowed: &[String], origin: Option<&HeaderValue>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some(origin) = origin.and_then(|o| o.to_str().ok()) else {
        return false;
    };
    allowed
        .iter()
        .any(|a| a == "*" || a.trim_end_matches('/').eq_ignore_ascii_case(origin.trim_end_matches('/')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, IceServerConfig};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::path::PathBuf;
    use tower::ServiceExt;

    fn web_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("callbridge-{}-{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.html"), "<html>call</html>").unwrap();
        std::fs::write(dir.join("app.js"), "console.log('call')").unwrap();
        dir
    }

    fn app(name: &str) -> Router {
        let mut config = Config::default();
        config.http.web_root = web_root(name);
        build_router(Arc::new(SharedState::new(config)))
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = app("health")
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "OK");
        assert_eq!(value["participants"], 0);
    }

    #[tokio::test]
    async fn turn_reports_configured_ice_servers() {
        let mut config = Config::default();
        config.http.web_root = web_root("turn");
        config.negotiation.connect_timeout_secs = 20;
        config.negotiation.ice_servers = vec![IceServerConfig::stun("stun:stun.example.com:3478")];
        let response = build_router(Arc::new(SharedState::new(config)))
            .oneshot(Request::builder().uri("/turn").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["connectTimeoutSecs"], 20);
        assert_eq!(value["iceServers"][0]["urls"][0], "stun:stun.example.com:3478");
        assert!(value["iceServers"][0].get("username").is_none());
    }

    #[tokio::test]
    async fn unknown_paths_fall_back_to_index() {
        let response = app("fallback")
            .oneshot(Request::builder().uri("/room/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"<html>call</html>");
    }

    #[tokio::test]
    async fn static_assets_are_served() {
        let response = app("assets")
            .oneshot(Request::builder().uri("/app.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"console.log('call')");
    }

    #[tokio::test]
    async fn plain_get_on_signaling_path_is_not_upgraded() {
        let response = app("plain")
            .oneshot(Request::builder().uri("/signaling").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[test]
    fn origin_allow_list() {
        let allowed = vec!["https://call.example.com".to_string()];
        let ok = HeaderValue::from_static("https://call.example.com");
        let other = HeaderValue::from_static("https://evil.example.com");
        assert!(origin_allowed(&allowed, Some(&ok)));
        assert!(!origin_allowed(&allowed, Some(&other)));
        assert!(!origin_allowed(&allowed, None));
        assert!(origin_allowed(&[], None));
    }
}
