/**
 * API HTTP - Routeur axum du bridge
 *
 * ROUTES :
 * - GET  /health               liveness, toujours "ok"
 * - GET  /system/health        santé du bridge (lien, clients, révision)
 * - GET  /data                 dernier snapshot ou {"status":"no data"}
 * - POST /data                 télémétrie poussée directement par un appareil
 * - POST /upstream/reconnect   relance un lien broker en attente
 * - GET  /ws                   WebSocket des dashboards
 *
 * Pas d'authentification : les dashboards sont de confiance sur le LAN.
 */

use crate::bridge::Bridge;
use crate::health::BridgeHealth;
use crate::ws::ws_handler;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/data", get(get_data).post(post_data))
        .route("/upstream/reconnect", post(reconnect_upstream))
        .route("/ws", get(ws_handler))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<BridgeHealth> {
    Json(BridgeHealth::collect(&app.bridge))
}

// GET /data
async fn get_data(State(app): State<AppState>) -> Response {
    match app.bridge.latest_snapshot() {
        Some(snapshot) => Json(snapshot).into_response(),
        None => Json(json!({ "status": "no data" })).into_response(),
    }
}

// POST /data
async fn post_data(State(app): State<AppState>, body: Bytes) -> (StatusCode, Json<serde_json::Value>) {
    match app.bridge.ingest_telemetry(&body) {
        Some(snapshot) => (
            StatusCode::OK,
            Json(json!({ "status": "success", "revision": snapshot.revision })),
        ),
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": "Invalid data" })),
        ),
    }
}

// POST /upstream/reconnect
async fn reconnect_upstream(State(app): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let status = app.bridge.link_status();
    info!(state = ?status.state, "reconnect requested over HTTP");
    app.bridge.trigger_reconnect();
    (StatusCode::ACCEPTED, Json(json!({ "ok": true, "state": status.state })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::mqtt::{ControlPublisher, LinkStatus, PublishError};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct Idle;

    #[async_trait]
    impl ControlPublisher for Idle {
        async fn publish(&self, _: &str, _: &str) -> Result<(), PublishError> {
            Ok(())
        }

        fn link_status(&self) -> LinkStatus {
            LinkStatus::new()
        }
    }

    async fn serve() -> (std::net::SocketAddr, Arc<Bridge>) {
        let bridge = Bridge::with_upstream(BridgeConfig::default(), Arc::new(Idle));
        let app = build_router(AppState { bridge: bridge.clone() });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, bridge)
    }

    /// Échange HTTP/1.1 minimal ; renvoie (code, corps).
    async fn request(addr: std::net::SocketAddr, method: &str, path: &str, body: &str) -> (u16, String) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        let code = raw.split_whitespace().nth(1).unwrap().parse().unwrap();
        let body = raw.split("\r\n\r\n").nth(1).unwrap_or_default().to_string();
        (code, body)
    }

    #[tokio::test]
    async fn data_roundtrip_over_http() {
        let (addr, bridge) = serve().await;

        let (code, body) = request(addr, "GET", "/data", "").await;
        assert_eq!(code, 200);
        assert!(body.contains("no data"), "{body}");

        let (code, _) = request(addr, "POST", "/data", r#"{"temperature": 31.5, "current_day": 4}"#).await;
        assert_eq!(code, 200);
        assert_eq!(bridge.latest_snapshot().unwrap().telemetry.current_day, Some(4));

        let (code, body) = request(addr, "GET", "/data", "").await;
        assert_eq!(code, 200);
        assert!(body.contains("31.5"), "{body}");
    }

    #[tokio::test]
    async fn invalid_post_is_rejected() {
        let (addr, bridge) = serve().await;
        assert_eq!(request(addr, "POST", "/data", "not json").await.0, 400);
        assert_eq!(request(addr, "POST", "/data", "{}").await.0, 400);
        assert!(bridge.latest_snapshot().is_none());
    }

    #[tokio::test]
    async fn health_endpoints() {
        let (addr, _bridge) = serve().await;
        let (code, body) = request(addr, "GET", "/health", "").await;
        assert_eq!((code, body.as_str()), (200, "ok"));

        let (code, body) = request(addr, "GET", "/system/health", "").await;
        assert_eq!(code, 200);
        assert!(body.contains("\"clients_connected\":0"), "{body}");

        assert_eq!(request(addr, "POST", "/upstream/reconnect", "").await.0, 202);
    }
}
