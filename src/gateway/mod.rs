//! Control-plane HTTP API and data-plane proxy.
//!
//! The gateway is a thin translation layer: every control operation maps
//! one-to-one onto a [`PoolHandle`] call, and the proxy route resolves the
//! owner to a container before handing the request to the backend. No pool
//! state lives here.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::sse::{Event as SseFrame, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::backend::{ContainerBackend, ProxyRequest};
use crate::error::PoolError;
use crate::pool::{Container, PoolEvent, PoolHandle, SettingsPatch, StatusSnapshot};

/// Shared state for the gateway.
#[derive(Clone)]
pub struct GatewayState {
    pub pool: PoolHandle,
    pub backend: Arc<dyn ContainerBackend>,
}

/// The pool's public HTTP server.
pub struct Gateway;

impl Gateway {
    /// Build the axum router for the gateway.
    pub fn router(state: GatewayState) -> Router {
        Router::new()
            .route("/allocate", post(allocate))
            .route("/deallocate/{id}", post(deallocate))
            .route("/status", get(status))
            .route("/reset", post(reset))
            .route("/config", post(configure))
            .route("/lookup/{owner_key}", get(lookup_owner))
            .route("/events", get(events))
            .route("/events/stream", get(events_stream))
            .route("/proxy/{owner_key}/{*path}", any(proxy))
            .route("/health", get(health_check))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the gateway server on the given port.
    pub async fn start(
        state: GatewayState,
        port: u16,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let router = Self::router(state);
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

        tracing::info!("Pool gateway listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        Ok(())
    }
}

// -- Error mapping --

/// JSON error response carrying a stable machine-readable kind.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    kind: &'static str,
    error: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request",
            error: message.into(),
        }
    }

    fn owner_not_found(owner_key: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            error: format!("no container allocated for owner '{owner_key}'"),
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        let status = match &err {
            // Capacity pressure is retryable for the caller.
            PoolError::PoolFull { .. } | PoolError::PoolExhausted { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PoolError::NotFound { .. } => StatusCode::NOT_FOUND,
            PoolError::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
            PoolError::Backend(_) => StatusCode::BAD_GATEWAY,
            PoolError::Store(_) | PoolError::Shutdown => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: err.kind(),
            error: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(kind = self.kind, error = %self.error, "Request failed");
        }
        (self.status, Json(self)).into_response()
    }
}

// -- Handlers --

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct AllocateRequest {
    owner_key: String,
}

async fn allocate(
    State(state): State<GatewayState>,
    Json(req): Json<AllocateRequest>,
) -> Result<Json<Container>, ApiError> {
    if req.owner_key.trim().is_empty() {
        return Err(ApiError::bad_request("owner_key must not be empty"));
    }
    let container = state.pool.allocate(req.owner_key).await?;
    Ok(Json(container))
}

async fn deallocate(
    State(state): State<GatewayState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.pool.deallocate(id).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn status(State(state): State<GatewayState>) -> Result<Json<StatusSnapshot>, ApiError> {
    Ok(Json(state.pool.status().await?))
}

async fn reset(State(state): State<GatewayState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.pool.reset().await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn configure(
    State(state): State<GatewayState>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<StatusSnapshot>, ApiError> {
    Ok(Json(state.pool.configure(patch).await?))
}

async fn lookup_owner(
    State(state): State<GatewayState>,
    Path(owner_key): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.pool.lookup_owner(&owner_key).await? {
        Some(id) => Ok(Json(serde_json::json!({
            "owner_key": owner_key,
            "container_id": id,
        }))),
        None => Err(ApiError::owner_not_found(&owner_key)),
    }
}

async fn events(State(state): State<GatewayState>) -> Result<Json<Vec<PoolEvent>>, ApiError> {
    Ok(Json(state.pool.events().await?))
}

/// Live pool notifications as Server-Sent Events. The first frame is the
/// status snapshot as of subscription; each following frame carries one
/// event plus the post-mutation status.
async fn events_stream(
    State(state): State<GatewayState>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<SseFrame, std::convert::Infallible>>>, ApiError>
{
    let (snapshot, rx) = state.pool.subscribe().await?;

    let initial = SseFrame::default()
        .event("status")
        .json_data(&snapshot)
        .unwrap_or_else(|_| SseFrame::default().event("status").data("{}"));

    let updates = BroadcastStream::new(rx).filter_map(|item| {
        // A lagged subscriber just misses frames; the stream continues.
        let notification = item.ok()?;
        SseFrame::default()
            .event("pool")
            .json_data(&notification)
            .ok()
    });

    let stream = tokio_stream::once(initial).chain(updates).map(Ok);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Forward an application request to the owner's container.
async fn proxy(
    State(state): State<GatewayState>,
    Path((owner_key, path)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let id = state
        .pool
        .lookup_owner(&owner_key)
        .await?
        .ok_or_else(|| ApiError::owner_not_found(&owner_key))?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let request = ProxyRequest {
        method: method.to_string(),
        path: format!("/{path}"),
        body: body.to_vec(),
        content_type,
    };

    let response = state
        .backend
        .forward(id, request)
        .await
        .map_err(|e| ApiError::from(PoolError::from(e)))?;

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = response.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(axum::body::Body::from(response.body))
        .map_err(|e| ApiError::from(PoolError::Backend(crate::error::BackendError::ForwardFailed {
            id,
            reason: e.to_string(),
        })))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::pool::{Orchestrator, PoolSettings};
    use crate::store::MemoryStore;
    use crate::testing::StubBackend;

    use super::*;

    async fn test_router(buffer_size: u32, max_size: u32) -> (Router, Arc<StubBackend>) {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(StubBackend::new());
        let pool = Orchestrator::spawn(
            store,
            backend.clone(),
            PoolSettings {
                min_size: 0,
                max_size,
                buffer_size,
                current_size: 0,
            },
        )
        .await
        .unwrap();
        (
            Gateway::router(GatewayState {
                pool,
                backend: backend.clone(),
            }),
            backend,
        )
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let (router, _) = test_router(0, 10).await;
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn allocate_returns_bound_container() {
        let (router, _) = test_router(1, 10).await;
        let resp = router
            .oneshot(post_json("/allocate", serde_json::json!({"owner_key": "p1"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["owner_key"], "p1");
        assert!(json["id"].as_str().is_some());
        assert!(json["address"].as_str().is_some());
    }

    #[tokio::test]
    async fn allocate_rejects_empty_owner_key() {
        let (router, _) = test_router(1, 10).await;
        let resp = router
            .oneshot(post_json("/allocate", serde_json::json!({"owner_key": "  "})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn allocate_maps_exhaustion_to_503() {
        let (router, _) = test_router(1, 1).await;
        let resp = router
            .clone()
            .oneshot(post_json("/allocate", serde_json::json!({"owner_key": "p1"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router
            .oneshot(post_json("/allocate", serde_json::json!({"owner_key": "p2"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["kind"], "pool_exhausted");
    }

    #[tokio::test]
    async fn deallocate_unknown_container_is_404() {
        let (router, _) = test_router(0, 10).await;
        let req = Request::builder()
            .method("POST")
            .uri(format!("/deallocate/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["kind"], "not_found");
    }

    #[tokio::test]
    async fn status_reports_containers_and_settings() {
        let (router, _) = test_router(2, 10).await;
        let req = Request::builder()
            .uri("/status")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["containers"].as_array().unwrap().len(), 2);
        assert_eq!(json["settings"]["buffer_size"], 2);
        assert_eq!(json["settings"]["current_size"], 2);
    }

    #[tokio::test]
    async fn configure_validation_failure_is_400() {
        let (router, _) = test_router(0, 10).await;
        let resp = router
            .oneshot(post_json(
                "/config",
                serde_json::json!({"min_size": 9, "max_size": 3}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["kind"], "invalid_config");
    }

    #[tokio::test]
    async fn lookup_owner_round_trip() {
        let (router, _) = test_router(1, 10).await;
        let resp = router
            .clone()
            .oneshot(post_json("/allocate", serde_json::json!({"owner_key": "p1"})))
            .await
            .unwrap();
        let allocated = body_json(resp).await;

        let req = Request::builder()
            .uri("/lookup/p1")
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["container_id"], allocated["id"]);

        let req = Request::builder()
            .uri("/lookup/nobody")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn events_returns_ordered_log() {
        let (router, _) = test_router(1, 10).await;
        router
            .clone()
            .oneshot(post_json("/allocate", serde_json::json!({"owner_key": "p1"})))
            .await
            .unwrap();

        let req = Request::builder()
            .uri("/events")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let events = body_json(resp).await;
        let events = events.as_array().unwrap();
        assert!(!events.is_empty());
        let seqs: Vec<u64> = events.iter().map(|e| e["seq"].as_u64().unwrap()).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn events_stream_negotiates_sse() {
        let (router, _) = test_router(0, 10).await;
        let req = Request::builder()
            .uri("/events/stream")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("text/event-stream")
        );
    }

    #[tokio::test]
    async fn proxy_forwards_to_owner_container() {
        let (router, backend) = test_router(1, 10).await;
        let resp = router
            .clone()
            .oneshot(post_json("/allocate", serde_json::json!({"owner_key": "p1"})))
            .await
            .unwrap();
        let allocated = body_json(resp).await;
        let id: Uuid = allocated["id"].as_str().unwrap().parse().unwrap();

        let req = Request::builder()
            .method("POST")
            .uri("/proxy/p1/run/code")
            .header("Content-Type", "application/json")
            .body(Body::from(r#"{"code": "print(1)"}"#))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let forwarded = backend.forwarded();
        assert_eq!(forwarded, vec![(id, "/run/code".to_string())]);
    }

    #[tokio::test]
    async fn proxy_for_unknown_owner_is_404() {
        let (router, backend) = test_router(1, 10).await;
        let req = Request::builder()
            .method("POST")
            .uri("/proxy/ghost/run")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(backend.forwarded().is_empty());
    }

    #[tokio::test]
    async fn reset_empties_the_pool() {
        let (router, _) = test_router(0, 10).await;
        router
            .clone()
            .oneshot(post_json("/allocate", serde_json::json!({"owner_key": "p1"})))
            .await
            .unwrap();

        let req = Request::builder()
            .method("POST")
            .uri("/reset")
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let req = Request::builder()
            .uri("/status")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        let json = body_json(resp).await;
        assert!(json["containers"].as_array().unwrap().is_empty());
        assert_eq!(json["settings"]["current_size"], 0);
    }
}
