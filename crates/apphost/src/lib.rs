pub mod auth;
pub mod builder;
pub mod cluster;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod models;
pub mod ports;
pub mod reconciler;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod test_support;
pub mod validate;

use axum::{Router, routing::get};
use std::sync::Arc;
use handlers::{health::health, ws::{app_socket, logs_socket, terminal_socket}};
use crate::{gateway::ClusterFeeds, store::AppStore, telemetry::metrics_handler};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn AppStore>,
    pub feeds: Arc<dyn ClusterFeeds>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/ws/apps/:nsid/:appid", get(app_socket))
        .route("/ws/apps/:nsid/:appid/logs/:iref/:cref", get(logs_socket))
        .route("/ws/apps/:nsid/:appid/terminal/:iref/:cref", get(terminal_socket))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::{Request, StatusCode}, body::Body};
    use tower::util::ServiceExt;
    use serde_json::json;
    use crate::{store::MemoryStore, test_support::ScriptedFeeds};

    fn router() -> Router {
        build_router(AppState { store: Arc::new(MemoryStore::new()), feeds: Arc::new(ScriptedFeeds::default()) })
    }

    #[tokio::test]
    async fn health_ok() {
        let res = router().oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v, json!({"status":"ok"}));
    }

    #[tokio::test]
    async fn metrics_exposed() {
        crate::telemetry::GATEWAY_CONNECTIONS.set(0);
        let res = router().oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), 1 << 20).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("gateway_connections"));
    }

    #[tokio::test]
    async fn socket_routes_require_upgrade() {
        let res = router().oneshot(Request::builder().uri("/ws/apps/ns1/a1").body(Body::empty()).unwrap()).await.unwrap();
        assert!(res.status().is_client_error());
    }
}
