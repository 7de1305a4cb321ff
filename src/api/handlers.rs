//! HTTP request handlers for the bridge API.
//!
//! `POST /v1/messages` accepts a Claude Messages request, forwards it to the
//! configured OpenAI-compatible upstream and translates the answer back.

use crate::api::claude_models::ClaudeMessagesRequest;
use crate::api::disconnect::DisconnectStream;
use crate::core::config::AppConfig;
use crate::core::logging::get_request_id;
use crate::core::metrics::get_metrics;
use crate::core::{AppError, Result, StreamCancelHandle};
use crate::services::claude_converter::{
    claude_to_openai_request, convert_openai_streaming_to_claude, openai_to_claude_response,
    RequestSetup,
};
use crate::transformer::TransformContext;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::StreamExt;
use prometheus::{Encoder, TextEncoder};
use serde_json::Value;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub http_client: reqwest::Client,
}

impl AppState {
    /// Build state with a pooled HTTP client configured from `config`.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let http_client = create_http_client(&config)?;
        Ok(Self {
            config,
            http_client,
        })
    }
}

/// Create HTTP client with connection pooling
pub fn create_http_client(config: &AppConfig) -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(!config.verify_ssl)
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()?;
    Ok(client)
}

fn validate_request(request: &ClaudeMessagesRequest) -> Result<()> {
    if request.model.trim().is_empty() {
        return Err(AppError::BadRequest("model: field required".to_string()));
    }
    if request.messages.is_empty() {
        return Err(AppError::BadRequest(
            "messages: at least one message is required".to_string(),
        ));
    }
    if request.max_tokens <= 0 {
        return Err(AppError::BadRequest(
            "max_tokens: must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

/// Pull a readable message out of an upstream error body.
fn upstream_error_message(body: &str, status: StatusCode) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    parsed
        .as_ref()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .or_else(|| v.get("error"))
        })
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                format!("Upstream returned {}", status)
            } else {
                trimmed.chars().take(500).collect()
            }
        })
}

/// Handle Claude Messages requests.
///
/// Supports both streaming and non-streaming responses.
#[tracing::instrument(skip(state, payload))]
pub async fn create_message(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<ClaudeMessagesRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(claude_request) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    validate_request(&claude_request)?;

    let setup = RequestSetup::from_config(&state.config);
    let (openai_request, trigger) = claude_to_openai_request(&claude_request, &setup);

    let mut ctx = TransformContext::new(get_request_id());
    ctx.original_model = claude_request.model.clone();
    ctx.mapped_model = openai_request
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    ctx.stream = claude_request.stream;
    ctx.trigger = trigger;
    ctx.registry = setup.tool_registry(&claude_request);

    tracing::debug!(
        request_id = %ctx.request_id,
        model = %ctx.original_model,
        mapped_model = %ctx.mapped_model,
        stream = ctx.stream,
        bridged = ctx.is_bridged(),
        tools = ctx.registry.len(),
        "Processing Claude request"
    );

    let url = state.config.upstream.chat_completions_url();
    let mut upstream_request = state.http_client.post(&url).json(&openai_request);
    if !state.config.upstream.api_key.is_empty() {
        upstream_request = upstream_request.bearer_auth(&state.config.upstream.api_key);
    }

    let response = upstream_request.send().await.map_err(|e| {
        tracing::error!(
            request_id = %ctx.request_id,
            url = %url,
            model = %ctx.mapped_model,
            error = %e,
            error_source = ?e.source(),
            is_timeout = e.is_timeout(),
            is_connect = e.is_connect(),
            "HTTP request failed to upstream"
        );
        let kind = if e.is_timeout() { "timeout" } else { "transport" };
        get_metrics().record_upstream_error(kind);
        AppError::from(e)
    })?;

    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    tracing::debug!(
        request_id = %ctx.request_id,
        url = %url,
        status = %status,
        "Upstream request completed"
    );

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = upstream_error_message(&body, status);
        tracing::warn!(
            request_id = %ctx.request_id,
            status = status.as_u16(),
            message = %message,
            "Upstream returned an error"
        );
        get_metrics().record_upstream_error(status.as_str());
        return Err(AppError::Upstream {
            status: status.as_u16(),
            message,
        });
    }

    if ctx.stream {
        stream_response(response, ctx)
    } else {
        let response_data: Value = response.json().await?;
        let (claude_response, summary) = openai_to_claude_response(
            &response_data,
            &ctx.original_model,
            &ctx.trigger,
            &ctx.registry,
        )?;
        get_metrics().record_turn("json", &summary);
        tracing::debug!(
            request_id = %ctx.request_id,
            tool = ?summary.tool_name,
            encoding = ?summary.encoding,
            stop_reason = %summary.stop_reason,
            downgraded = summary.downgraded,
            "Claude response assembled"
        );
        Ok(Json(claude_response).into_response())
    }
}

/// Wrap the upstream body in the translating SSE stream.
fn stream_response(response: reqwest::Response, ctx: TransformContext) -> Result<Response> {
    let cancel_handle = StreamCancelHandle::new();
    let frames = convert_openai_streaming_to_claude(
        Box::pin(response.bytes_stream()),
        ctx.original_model.clone(),
        ctx.stream_assembler(),
        Some(cancel_handle.clone()),
    );
    let bytes = frames.map(|frame| Ok::<_, std::io::Error>(Bytes::from(frame)));
    let body = Body::from_stream(DisconnectStream {
        stream: bytes,
        cancel_handle,
    });

    tracing::debug!(
        request_id = %ctx.request_id,
        model = %ctx.original_model,
        "Claude streaming response started"
    );

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(body)
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// Health check endpoint.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok"
    }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler() -> Result<Response> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", encoder.format_type())
        .body(buffer.into())
        .map_err(|e| AppError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::claude_models::{ClaudeMessage, ClaudeMessageContent};
    use assert_matches::assert_matches;

    fn request(model: &str, messages: usize, max_tokens: i32) -> ClaudeMessagesRequest {
        serde_json::from_value(serde_json::json!({
            "model": model,
            "max_tokens": max_tokens,
            "messages": (0..messages)
                .map(|_| serde_json::json!({"role": "user", "content": "hi"}))
                .collect::<Vec<_>>()
        }))
        .unwrap()
    }

    #[test]
    fn test_validate_request() {
        assert!(validate_request(&request("m", 1, 10)).is_ok());
        assert_matches!(
            validate_request(&request("", 1, 10)),
            Err(AppError::BadRequest(msg)) if msg.starts_with("model")
        );
        assert_matches!(
            validate_request(&request("m", 0, 10)),
            Err(AppError::BadRequest(msg)) if msg.starts_with("messages")
        );
        assert_matches!(
            validate_request(&request("m", 1, 0)),
            Err(AppError::BadRequest(msg)) if msg.starts_with("max_tokens")
        );

        let mut ok = request("m", 1, 10);
        ok.messages.push(ClaudeMessage {
            role: "assistant".to_string(),
            content: ClaudeMessageContent::Text("hello".to_string()),
        });
        assert!(validate_request(&ok).is_ok());
    }

    #[test]
    fn test_upstream_error_message() {
        assert_eq!(
            upstream_error_message(
                r#"{"error":{"message":"model not found","type":"invalid_request_error"}}"#,
                StatusCode::NOT_FOUND
            ),
            "model not found"
        );
        assert_eq!(
            upstream_error_message(r#"{"error":"quota exceeded"}"#, StatusCode::TOO_MANY_REQUESTS),
            "quota exceeded"
        );
        assert_eq!(
            upstream_error_message("Bad Gateway", StatusCode::BAD_GATEWAY),
            "Bad Gateway"
        );
        assert_eq!(
            upstream_error_message("", StatusCode::SERVICE_UNAVAILABLE),
            "Upstream returned 503 Service Unavailable"
        );
    }

    #[tokio::test]
    async fn test_health() {
        let response = health().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_handler() {
        crate::core::metrics::init_metrics();
        let response = metrics_handler().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
