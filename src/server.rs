use crate::error::GatewayError;
use crate::proxy::Gateway;
use crate::tokens::estimate_input_tokens;
use crate::translate::anthropic_types::{ErrorResponse, MessagesRequest};
use crate::translate::errors::{classify, ClassifiedError, ErrorKind};

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    /// Key callers must present. `None` disables the check.
    pub client_api_key: Option<String>,
    /// Reported by `/health`.
    pub backend_key_configured: bool,
    /// Cancelled on shutdown; every stream runs under a child of it.
    pub shutdown: CancellationToken,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/health", get(handle_health))
        .route("/v1/models", get(handle_models))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(denied) = check_api_key(&state, &headers) {
        return denied;
    }

    let req = match parse_request(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let request_id = uuid::Uuid::new_v4().simple().to_string();
    let span = tracing::info_span!("messages", %request_id, model = %req.model, stream = req.stream);

    async {
        tracing::info!(messages = req.messages.len(), "Request received");
        if req.stream {
            handle_streaming(&state, &req).await
        } else {
            handle_non_streaming(&state, &req).await
        }
    }
    .instrument(span)
    .await
}

async fn handle_non_streaming(state: &AppState, req: &MessagesRequest) -> Response {
    match state.gateway.complete(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_streaming(state: &AppState, req: &MessagesRequest) -> Response {
    let cancel = state.shutdown.child_token();
    let events = match state.gateway.stream(req, cancel).await {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };

    let events = events.map(|sse| -> Result<Event, Infallible> {
        Ok(Event::default().event(sse.event).data(sse.data))
    });

    // Heartbeats come from the stream itself as `ping` events.
    Sse::new(events).into_response()
}

async fn handle_count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(denied) = check_api_key(&state, &headers) {
        return denied;
    }

    match parse_request(&body) {
        Ok(req) => Json(serde_json::json!({
            "input_tokens": estimate_input_tokens(&req),
        }))
        .into_response(),
        Err(resp) => resp,
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "backend_api_key_configured": state.backend_key_configured,
        "client_api_key_validation": state.client_api_key.is_some(),
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let models: Vec<serde_json::Value> = state
        .gateway
        .router()
        .targets()
        .iter()
        .map(|(tier, target)| {
            serde_json::json!({
                "id": target.model,
                "object": "model",
                "tier": tier.as_str(),
                "owned_by": "claude-bridge",
            })
        })
        .collect();

    Json(serde_json::json!({ "data": models, "object": "list" }))
}

fn parse_request(body: &[u8]) -> Result<MessagesRequest, Response> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(error = %e, "Rejected request body");
        let classified = ClassifiedError::new(
            ErrorKind::InvalidRequest,
            Some(format!("Invalid request body: {e}").as_str()),
        );
        envelope(&classified)
    })
}

/// Compare the presented key against the configured one. Returns the rejection, if any.
fn check_api_key(state: &AppState, headers: &HeaderMap) -> Option<Response> {
    let expected = state.client_api_key.as_deref()?;

    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });

    if presented == Some(expected) {
        return None;
    }

    tracing::warn!("Rejected request with a missing or invalid client API key");
    let err = ErrorResponse::new(
        ErrorKind::Authentication.wire_name(),
        "Invalid API key. Provide a valid key in the x-api-key header.",
    );
    Some((StatusCode::UNAUTHORIZED, Json(err)).into_response())
}

fn error_response(err: &GatewayError) -> Response {
    let classified = classify(err);
    match err {
        GatewayError::ClientDisconnected => {
            tracing::info!("Client disconnected before the backend call");
        }
        _ => tracing::warn!(
            error = %err,
            kind = %classified.kind,
            status = classified.status,
            "Request failed"
        ),
    }
    envelope(&classified)
}

fn envelope(classified: &ClassifiedError) -> Response {
    let status =
        StatusCode::from_u16(classified.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(classified.to_response())).into_response()
}
