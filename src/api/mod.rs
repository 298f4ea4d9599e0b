//! HTTP surface: health, subscriber listing and manual invocation.

pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use handlers::AppState;

/// Build the HTTP routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/healthcheck", get(handlers::health_check))
        // Subscribers
        .route("/subscribers", get(handlers::list_subscribers))
        .route("/subscribers/:name", post(handlers::invoke_subscriber))
        // State
        .with_state(state)
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
