//! The HTTP surface: the WebSocket upgrade route, the batch endpoint
//! for non-WebSocket clients, and a plain health probe.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use pv_protocol::{BatchItemResult, BatchRequest, RequestMessage};

use crate::server::{GatewayServer, RequestContext};
use crate::ws;

/// Build the router with CORS, tracing, and per-IP rate limiting.
pub fn router(server: Arc<GatewayServer>) -> Router {
    let governor_config = Arc::new(
        tower_governor::governor::GovernorConfigBuilder::default()
            .per_second(20)
            .burst_size(50)
            .finish()
            .expect("static rate-limit parameters"),
    );

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/batch", post(batch))
        .route("/api/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(tower_governor::GovernorLayer {
            config: governor_config,
        })
        .with_state(server)
}

async fn health(State(server): State<Arc<GatewayServer>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "uptime": server.uptime_seconds(),
        "active_connections": server.gateway.connections.active_count(),
    }))
}

/// POST /api/batch — ordered dispatch through the same method table.
/// Items are sorted by descending priority and run serially; each
/// gets its own ok/payload/error entry.
async fn batch(
    State(server): State<Arc<GatewayServer>>,
    Json(body): Json<BatchRequest>,
) -> impl IntoResponse {
    if body.requests.is_empty() {
        return (
            axum::http::StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "requests is required"})),
        )
            .into_response();
    }

    let mut items = body.requests;
    items.sort_by_key(|item| std::cmp::Reverse(item.priority));

    let ctx = RequestContext::default();
    let mut results = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        if item.parse_method().is_none() {
            results.push(BatchItemResult {
                method: item.method.clone(),
                ok: false,
                payload: None,
                error: Some(format!("Unknown request method: {}", item.method)),
            });
            continue;
        }

        let retries = item.retries.unwrap_or(0);
        let timeout = std::time::Duration::from_millis(item.timeout_ms.unwrap_or(30_000));
        let mut last: Option<BatchItemResult> = None;

        for _attempt in 0..=retries {
            let request = RequestMessage {
                id: format!("batch_{index}"),
                method: item.method.clone(),
                params: item.params.clone(),
                idempotency_key: None,
            };
            let outcome = tokio::time::timeout(timeout, server.handle_request(&ctx, request)).await;
            let result = match outcome {
                Ok(response) => BatchItemResult {
                    method: item.method.clone(),
                    ok: response.ok,
                    payload: response.payload,
                    error: response.error,
                },
                Err(_) => BatchItemResult {
                    method: item.method.clone(),
                    ok: false,
                    payload: None,
                    error: Some("timeout".into()),
                },
            };
            let done = result.ok;
            last = Some(result);
            if done {
                break;
            }
        }

        if let Some(result) = last {
            results.push(result);
        }
    }

    Json(serde_json::json!({"status": "success", "results": results})).into_response()
}
