//! Claude API request and response models.
//!
//! This module defines the data structures of the Claude Messages API that
//! the bridge accepts and produces, including requests, responses, content
//! blocks, and streaming events.

use crate::transformer::stream::format_sse_event;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Constants
// ============================================================================

/// Constants for Claude API integration.
pub mod constants {
    // Role constants
    pub const ROLE_USER: &str = "user";
    pub const ROLE_ASSISTANT: &str = "assistant";
    pub const ROLE_SYSTEM: &str = "system";
    pub const ROLE_TOOL: &str = "tool";

    // Content type constants
    pub const CONTENT_TEXT: &str = "text";
    pub const CONTENT_THINKING: &str = "thinking";
    pub const CONTENT_IMAGE: &str = "image";
    pub const CONTENT_TOOL_USE: &str = "tool_use";
    pub const CONTENT_TOOL_RESULT: &str = "tool_result";

    // Tool type constants
    pub const TOOL_FUNCTION: &str = "function";

    // Thinking config
    pub const THINKING_ENABLED: &str = "enabled";
}

// ============================================================================
// Content Block Types
// ============================================================================

/// Text content block in Claude messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaudeContentBlockText {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

impl Default for ClaudeContentBlockText {
    fn default() -> Self {
        Self {
            content_type: constants::CONTENT_TEXT.to_string(),
            text: String::new(),
        }
    }
}

/// Thinking content block in Claude messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaudeContentBlockThinking {
    #[serde(rename = "type")]
    pub content_type: String,
    pub thinking: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Image source for Claude image content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaudeImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Image content block in Claude messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaudeContentBlockImage {
    #[serde(rename = "type")]
    pub content_type: String,
    pub source: ClaudeImageSource,
}

/// Tool use content block in Claude messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaudeContentBlockToolUse {
    #[serde(rename = "type")]
    pub content_type: String,
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Tool result content block in Claude messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaudeContentBlockToolResult {
    #[serde(rename = "type")]
    pub content_type: String,
    pub tool_use_id: String,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

/// Union type for all content block types.
///
/// Blocks of a type the bridge does not know are kept as raw JSON so the
/// request still deserializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaudeContentBlock {
    Text(ClaudeContentBlockText),
    Thinking(ClaudeContentBlockThinking),
    Image(ClaudeContentBlockImage),
    ToolUse(ClaudeContentBlockToolUse),
    ToolResult(ClaudeContentBlockToolResult),
    Other(serde_json::Value),
}

impl ClaudeContentBlock {
    /// Get the type of this content block.
    pub fn get_type(&self) -> &str {
        match self {
            ClaudeContentBlock::Text(b) => &b.content_type,
            ClaudeContentBlock::Thinking(b) => &b.content_type,
            ClaudeContentBlock::Image(b) => &b.content_type,
            ClaudeContentBlock::ToolUse(b) => &b.content_type,
            ClaudeContentBlock::ToolResult(b) => &b.content_type,
            ClaudeContentBlock::Other(raw) => raw
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("unknown"),
        }
    }

    /// Create a text content block.
    pub fn text(text: impl Into<String>) -> Self {
        ClaudeContentBlock::Text(ClaudeContentBlockText {
            content_type: constants::CONTENT_TEXT.to_string(),
            text: text.into(),
        })
    }

    /// Create a thinking content block.
    pub fn thinking(thinking: impl Into<String>) -> Self {
        ClaudeContentBlock::Thinking(ClaudeContentBlockThinking {
            content_type: constants::CONTENT_THINKING.to_string(),
            thinking: thinking.into(),
            signature: None,
        })
    }

    /// Create a tool use content block.
    pub fn tool_use(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        ClaudeContentBlock::ToolUse(ClaudeContentBlockToolUse {
            content_type: constants::CONTENT_TOOL_USE.to_string(),
            id: id.into(),
            name: name.into(),
            input,
        })
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// System content block for Claude messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeSystemContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

/// Content that can be either a string or a list of content blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaudeMessageContent {
    Text(String),
    Blocks(Vec<ClaudeContentBlock>),
}

/// A message in Claude conversation format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeMessage {
    pub role: String,
    pub content: ClaudeMessageContent,
}

// ============================================================================
// Tool Types
// ============================================================================

/// Tool definition for Claude API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

/// Configuration for Claude's extended thinking feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeThinkingConfig {
    #[serde(rename = "type")]
    pub thinking_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<i32>,
}

impl ClaudeThinkingConfig {
    pub fn is_enabled(&self) -> bool {
        self.thinking_type == constants::THINKING_ENABLED
    }
}

// ============================================================================
// Request Types
// ============================================================================

/// System prompt that can be either a string or a list of system content blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaudeSystemPrompt {
    Text(String),
    Blocks(Vec<ClaudeSystemContent>),
}

/// Request model for Claude Messages API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeMessagesRequest {
    /// The model to use for completion
    pub model: String,

    /// Maximum number of tokens to generate
    pub max_tokens: i32,

    /// List of messages in the conversation
    pub messages: Vec<ClaudeMessage>,

    /// System prompt or instructions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<ClaudeSystemPrompt>,

    /// Sequences that will stop generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,

    /// Sampling temperature (0.0 to 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Nucleus sampling probability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    /// Top-k sampling parameter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,

    /// Optional metadata for the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,

    /// List of tools available to the model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ClaudeTool>>,

    /// How the model should use tools
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,

    /// Extended thinking configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ClaudeThinkingConfig>,
}

impl ClaudeMessagesRequest {
    /// Whether the client asked for extended thinking.
    pub fn thinking_enabled(&self) -> bool {
        self.thinking
            .as_ref()
            .map(ClaudeThinkingConfig::is_enabled)
            .unwrap_or(false)
    }

    /// Names of the declared tools, in declaration order.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .iter()
            .flatten()
            .map(|tool| tool.name.clone())
            .collect()
    }
}

// ============================================================================
// Response Types
// ============================================================================

/// Token usage information in Claude API format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClaudeUsage {
    pub input_tokens: i32,
    pub output_tokens: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<i32>,
}

/// Response model of the Claude Messages API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: String,
    pub content: Vec<ClaudeContentBlock>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    pub usage: ClaudeUsage,
}

impl ClaudeResponse {
    /// Create a new Claude response.
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        content: Vec<ClaudeContentBlock>,
        stop_reason: Option<String>,
        usage: ClaudeUsage,
    ) -> Self {
        Self {
            id: id.into(),
            response_type: "message".to_string(),
            role: constants::ROLE_ASSISTANT.to_string(),
            content,
            model: model.into(),
            stop_reason,
            stop_sequence: None,
            usage,
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Claude API error detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaudeErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// Claude API error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeErrorResponse {
    #[serde(rename = "type")]
    pub response_type: String,
    pub error: ClaudeErrorDetail,
}

impl ClaudeErrorResponse {
    /// Create a new Claude error response.
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            response_type: "error".to_string(),
            error: ClaudeErrorDetail {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }

    /// Create an API error response.
    pub fn api_error(message: impl Into<String>) -> Self {
        Self::new("api_error", message)
    }

    /// Create a timeout error response.
    pub fn timeout_error(message: impl Into<String>) -> Self {
        Self::new("timeout_error", message)
    }

    /// Create an invalid request error response.
    pub fn invalid_request_error(message: impl Into<String>) -> Self {
        Self::new("invalid_request_error", message)
    }
}

// ============================================================================
// Streaming Types
// ============================================================================

/// Partial message carried by `message_start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeStreamMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub role: String,
    pub model: String,
    pub content: Vec<ClaudeContentBlock>,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: ClaudeUsage,
}

impl ClaudeStreamMessage {
    pub fn new(id: impl Into<String>, model: impl Into<String>, usage: ClaudeUsage) -> Self {
        Self {
            id: id.into(),
            message_type: "message".to_string(),
            role: constants::ROLE_ASSISTANT.to_string(),
            model: model.into(),
            content: Vec::new(),
            stop_reason: None,
            stop_sequence: None,
            usage,
        }
    }
}

/// Delta content in streaming responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeStreamDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
}

impl ClaudeStreamDelta {
    /// Create a text delta.
    pub fn text(text: impl Into<String>) -> Self {
        ClaudeStreamDelta::TextDelta { text: text.into() }
    }

    /// Create a thinking delta.
    pub fn thinking(thinking: impl Into<String>) -> Self {
        ClaudeStreamDelta::ThinkingDelta {
            thinking: thinking.into(),
        }
    }

    /// Create an input JSON delta.
    pub fn input_json(partial_json: impl Into<String>) -> Self {
        ClaudeStreamDelta::InputJsonDelta {
            partial_json: partial_json.into(),
        }
    }
}

/// Message delta content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaudeMessageDelta {
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
}

/// One event of a Messages API stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeStreamEvent {
    MessageStart {
        message: ClaudeStreamMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: ClaudeContentBlock,
    },
    Ping,
    ContentBlockDelta {
        index: usize,
        delta: ClaudeStreamDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: ClaudeMessageDelta,
        usage: ClaudeUsage,
    },
    MessageStop,
    Error {
        error: ClaudeErrorDetail,
    },
}

impl ClaudeStreamEvent {
    /// SSE event name, identical to the `type` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            ClaudeStreamEvent::MessageStart { .. } => "message_start",
            ClaudeStreamEvent::ContentBlockStart { .. } => "content_block_start",
            ClaudeStreamEvent::Ping => "ping",
            ClaudeStreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            ClaudeStreamEvent::ContentBlockStop { .. } => "content_block_stop",
            ClaudeStreamEvent::MessageDelta { .. } => "message_delta",
            ClaudeStreamEvent::MessageStop => "message_stop",
            ClaudeStreamEvent::Error { .. } => "error",
        }
    }

    /// Serialize as one SSE frame.
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to serialize stream event");
            "{}".to_string()
        });
        format_sse_event(Some(self.event_type()), &data)
    }

    pub fn error(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        ClaudeStreamEvent::Error {
            error: ClaudeErrorDetail {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
