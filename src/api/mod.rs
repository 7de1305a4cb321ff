//! API layer for the bridge server.
//!
//! This module contains the HTTP handlers, the Claude and OpenAI wire models,
//! and the router that ties them to the core middleware.

pub mod claude_models;
pub mod disconnect;
pub mod handlers;
pub mod openai_models;

use crate::core::{request_id_middleware, MetricsMiddleware};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

// Re-export commonly used types
pub use claude_models::{ClaudeMessagesRequest, ClaudeResponse, ClaudeStreamEvent};
pub use disconnect::DisconnectStream;
pub use handlers::{create_message, health, metrics_handler, AppState};
pub use openai_models::{ChatCompletionResponse, StreamChunk};

/// Build the router with all endpoints and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/v1/messages", post(create_message))
        .layer(axum::middleware::from_fn(MetricsMiddleware::track_metrics))
        .with_state(state);

    Router::new()
        .merge(api_routes)
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
