//! LLM Bridge Server - Claude Messages API in front of OpenAI-compatible upstreams
//!
//! This library accepts Claude Messages requests, forwards them to a single
//! OpenAI-compatible chat completions endpoint and translates the answers
//! back, streamed or not. Its core is the response translation engine:
//!
//! - **Thinking blocks**: `<thinking>` spans and `reasoning_content` become
//!   Claude `thinking` blocks
//! - **Tool-call bridge**: tool invocations that models write as free text
//!   (XML, key/value markup, embedded JSON) are repaired and turned into
//!   structured `tool_use` blocks
//! - **Streaming**: incremental assembly that never leaks trigger signals
//!   or raw invocation markup to the client
//! - **Metrics**: Prometheus counters for requests, bridged tool calls and
//!   upstream failures
//!
//! # Architecture
//!
//! - [`core`]: Core functionality (config, errors, logging, metrics, middleware)
//! - [`api`]: HTTP handlers, router, and request/response models
//! - [`services`]: Request conversion, bridge prompt setup and stream driving
//! - [`transformer`]: The translation engine; no I/O, no configuration
//!
//! # Configuration
//!
//! Read from `CONFIG_PATH` (default `config.yaml`) when present, otherwise
//! from the environment:
//! - `HOST` / `PORT`: Server bind address (default: 0.0.0.0:18000)
//! - `UPSTREAM_API_BASE` / `UPSTREAM_API_KEY`: The OpenAI-compatible upstream
//! - `FUNCTION_CALL_BRIDGE`: Enable the tool-call bridge (default: true)
//! - `THINKING_MODEL`: Upstream model used when extended thinking is requested
//! - `VERIFY_SSL`: Verify SSL certificates for upstream (default: true)
//! - `REQUEST_TIMEOUT_SECS`: Request timeout in seconds (default: 300)

pub mod api;
pub mod core;
pub mod services;
pub mod transformer;

// Re-export commonly used types for convenience
pub use api::{router, AppState, ClaudeMessagesRequest, ClaudeResponse};
pub use core::{AppConfig, AppError, Result};
