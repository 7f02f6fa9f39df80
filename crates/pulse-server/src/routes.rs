//! HTTP surface: webhook intake, health and the subscription socket

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::service::{IngestError, PulseService};

pub fn router(service: Arc<PulseService>) -> Router {
    let body_limit = service.config().server.max_body_bytes;
    Router::new()
        .route("/webhooks/:source", post(receive_webhook))
        .route("/health", get(health))
        .route("/ws", get(subscriptions))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn receive_webhook(
    State(service): State<Arc<PulseService>>,
    Path(source): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    match service.ingest_webhook(&source, body).await {
        Ok(metadata) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "accepted",
                "topic": metadata.topic,
                "partition": metadata.partition,
                "offset": metadata.offset,
            })),
        )
            .into_response(),
        Err(IngestError::MissingEventType) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing event type" })),
        )
            .into_response(),
        Err(IngestError::Broker(e)) => {
            warn!(source = %source, "Webhook publish failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn health(State(service): State<Arc<PulseService>>) -> Response {
    let health = service.health().await;
    let status = if health.pipeline.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

async fn subscriptions(State(service): State<Arc<PulseService>>, ws: WebSocketUpgrade) -> Response {
    service.hub().clone().upgrade(ws)
}
