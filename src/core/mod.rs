//! Core functionality for the bridge server.
//!
//! This module contains fundamental components used throughout the application:
//! configuration, error handling, logging, metrics, cancellation and HTTP middleware.

pub mod cancel;
pub mod config;
pub mod error;
pub mod error_types;
pub mod logging;
pub mod metrics;
pub mod middleware;

// Re-export commonly used types
pub use cancel::StreamCancelHandle;
pub use config::{AppConfig, BridgeConfig, ServerConfig, UpstreamConfig};
pub use error::{AppError, Result};
pub use logging::{get_request_id, init_tracing, REQUEST_ID};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use middleware::{request_id_middleware, MetricsMiddleware};
