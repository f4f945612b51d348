//! HTTP server: health endpoint, WebSocket upgrade, middleware stack.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use chatterbox_core::{MessageStore, SignalCoordinator};

use crate::config::Config;

mod routes;

/// Shared state for every request and connection task.
pub struct AppState {
    pub coordinator: SignalCoordinator,
    pub store: Arc<dyn MessageStore>,
}

impl AppState {
    pub fn new(coordinator: SignalCoordinator, store: Arc<dyn MessageStore>) -> Self {
        Self { coordinator, store }
    }
}

/// Bind and serve until the process is terminated.
pub async fn start(config: &Config, state: Arc<AppState>) -> Result<()> {
    let app = router(state, &config.cors_origin)?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "Listening");

    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: Arc<AppState>, cors_origin: &str) -> Result<Router> {
    Ok(Router::new()
        .route("/healthz", get(healthz))
        .merge(routes::websocket::router())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(cors_layer(cors_origin)?)
        .with_state(state))
}

fn cors_layer(origin: &str) -> Result<CorsLayer> {
    let layer = if origin == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origin: HeaderValue = origin
            .parse()
            .with_context(|| format!("invalid CORS origin: {}", origin))?;
        CorsLayer::new().allow_origin(origin)
    };
    Ok(layer)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    storage_connected: bool,
}

/// GET /healthz
///
/// Liveness plus a storage reachability probe. The process can serve
/// presence and signaling without storage, so a storage outage reports
/// degraded rather than dead.
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let storage_connected = state.store.ping().await.is_ok();
    let (code, status) = if storage_connected {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        code,
        Json(HealthResponse {
            status,
            storage_connected,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use axum::response::IntoResponse;
    use chatterbox_core::{
        ConnectionRegistry, LibSqlMessageStore, MessageRecord, NewMessage, SignalCoordinator,
        StorageError,
    };

    /// A store whose backend is gone.
    struct UnreachableStore;

    #[async_trait]
    impl chatterbox_core::MessageStore for UnreachableStore {
        async fn store_message(&self, _: NewMessage) -> Result<MessageRecord, StorageError> {
            Err(StorageError::Database("connection refused".into()))
        }
        async fn fetch_history(
            &self,
            _: &str,
            _: &str,
            _: u32,
        ) -> Result<Vec<MessageRecord>, StorageError> {
            Err(StorageError::Database("connection refused".into()))
        }
        async fn ping(&self) -> Result<(), StorageError> {
            Err(StorageError::Database("connection refused".into()))
        }
    }

    fn state_with(store: Arc<dyn MessageStore>) -> Arc<AppState> {
        let registry = Arc::new(ConnectionRegistry::new());
        let coordinator = SignalCoordinator::new(registry, Arc::clone(&store), 100);
        Arc::new(AppState::new(coordinator, store))
    }

    async fn health_json(state: Arc<AppState>) -> (StatusCode, serde_json::Value) {
        let response = healthz(State(state)).await.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_healthz_ok_with_reachable_store() {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        let store: Arc<dyn MessageStore> =
            Arc::new(LibSqlMessageStore::new(db.connect().unwrap()));

        let (status, json) = health_json(state_with(store)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["storageConnected"], true);
    }

    #[tokio::test]
    async fn test_healthz_degraded_when_store_unreachable() {
        let (status, json) = health_json(state_with(Arc::new(UnreachableStore))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["storageConnected"], false);
    }

    #[test]
    fn test_cors_layer_accepts_wildcard_and_explicit_origin() {
        assert!(cors_layer("*").is_ok());
        assert!(cors_layer("http://localhost:3000").is_ok());
        assert!(cors_layer("not a header value\u{7f}").is_err());
    }
}
