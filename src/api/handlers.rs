//! HTTP request handlers for the event bus service.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, info};

use crate::messaging::codec;
use crate::messaging::{MessageBus, SessionSnapshot, SubscriberMeta};
use crate::types::{new_request_id, BusConfig, Context, ANONYMOUS_USER_ID};

/// Request header carrying the caller's request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request header carrying the caller's user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Application state shared across handlers.
pub struct AppState {
    /// `None` when the bus failed to come up or is disabled for this mode
    pub bus: Option<Arc<MessageBus>>,
    pub config: BusConfig,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    service: String,
    event_bus: bool,
    sessions: Vec<SessionSnapshot>,
}

/// Manual invocation response.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    message: String,
}

fn reply(status: StatusCode, message: String) -> Response {
    (status, Json(MessageResponse { message })).into_response()
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        service: state.config.group_id.clone(),
        event_bus: state.bus.is_some(),
        sessions: state
            .bus
            .as_ref()
            .map(|bus| bus.sessions())
            .unwrap_or_default(),
    })
}

/// List every subscriber added to the bus.
pub async fn list_subscribers(State(state): State<Arc<AppState>>) -> Json<Vec<SubscriberMeta>> {
    Json(
        state
            .bus
            .as_ref()
            .map(|bus| bus.subscribers_meta())
            .unwrap_or_default(),
    )
}

/// Invoke an exposed subscriber's handler with the request body.
pub async fn invoke_subscriber(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(bus) = state.bus.as_ref() else {
        return reply(
            StatusCode::SERVICE_UNAVAILABLE,
            "event bus is not initialized".to_string(),
        );
    };

    let path = format!("/subscribers/{}", name);
    let Some(subscriber) = bus.exposed_subscriber(&path) else {
        return reply(StatusCode::NOT_FOUND, format!("subscriber {} not found", name));
    };

    let context = context_from_request(&headers);
    let payload = codec::decode_payload(Some(&body));

    info!(
        subscriber = subscriber.name(),
        request_id = %context.request_id,
        "Manual subscriber invocation"
    );

    match subscriber.handle(payload, &context, None).await {
        Ok(()) => reply(
            StatusCode::OK,
            format!("{} successfully executed", subscriber.name()),
        ),
        Err(e) => {
            error!(
                subscriber = subscriber.name(),
                request_id = %context.request_id,
                user_id = %context.user_id,
                error = ?e,
                "Manual invocation failed"
            );
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("fail executing {}, {}", subscriber.name(), e),
            )
        }
    }
}

/// Build a context from `x-request-id` / `x-user-id`.
pub fn context_from_request(headers: &HeaderMap) -> Context {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    Context::new(
        read(REQUEST_ID_HEADER).unwrap_or_else(new_request_id),
        read(USER_ID_HEADER).unwrap_or_else(|| ANONYMOUS_USER_ID.to_string()),
    )
}
