//! Axum webhook ingress.
//!
//! One route per concern: `POST /webhook/{channel}/{instance}` receives
//! bridge events, `GET /health` answers liveness probes. Messages bundled in
//! one webhook are processed sequentially in array order; distinct requests
//! run concurrently with no cross-request ordering.

pub mod inbound;

use crate::config::{ChannelKind, Config};
use crate::router::MessageRouter;
use crate::trace::TraceService;
use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub traces: Arc<TraceService>,
    pub router: Arc<MessageRouter>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/webhook/{channel}/{instance_name}", post(handle_webhook))
        .with_state(state)
}

/// Serve the gateway until the process shuts down.
pub async fn run_gateway(host: &str, port: u16, state: AppState) -> Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("gateway listening on {addr}");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "tracing_enabled": state.traces.is_enabled(),
        "instances": state.config.instances.len(),
    }))
}

/// `POST /webhook/{channel}/{instance}` — bridge event ingress.
///
/// A body that fails to parse returns 500: providers treat that as "retry
/// the webhook", which is acceptable because processing is idempotent per
/// provider message id.
async fn handle_webhook(
    Path((channel, instance_name)): Path<(String, String)>,
    State(state): State<AppState>,
    body: Bytes,
) -> impl IntoResponse {
    let Some(instance) = state.config.instance(&instance_name).cloned() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "error", "detail": format!("unknown instance '{instance_name}'")})),
        );
    };

    if !matches!(channel.as_str(), "evolution" | "whatsapp") {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "error", "detail": format!("unknown channel '{channel}'")})),
        );
    }
    if instance.channel_type != ChannelKind::Whatsapp {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "status": "error",
                "detail": format!("instance '{instance_name}' is not a whatsapp instance"),
            })),
        );
    }

    let Ok(raw) = serde_json::from_slice::<Value>(&body) else {
        tracing::error!("webhook for '{instance_name}' carried an unparseable body");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "detail": "invalid JSON body"})),
        );
    };

    tracing::info!(instance = %instance_name, "webhook received");

    let decoded = inbound::decode_webhook_body(&raw);
    let messages = inbound::extract_messages(&decoded);
    tracing::debug!("processing {} message(s) from webhook", messages.len());

    // Sequential on purpose: messages bundled in one webhook must not
    // overtake each other.
    let mut trace_id = None;
    for message in messages {
        if let Some(id) =
            inbound::process_whatsapp_message(message, &instance, &state.router, &state.traces)
                .await
        {
            trace_id = Some(id);
        }
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "instance": instance_name,
            "trace_id": trace_id,
        })),
    )
}
