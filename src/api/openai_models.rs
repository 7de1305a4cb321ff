//! OpenAI chat completion models, as returned by the upstream.
//!
//! Upstreams are OpenAI-compatible rather than OpenAI itself, so every field
//! is optional or defaulted and unknown fields are ignored.

use crate::api::claude_models::ClaudeUsage;
use crate::transformer::{NativeCallDelta, UpstreamMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Chat completion response (non-streaming).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ChatCompletionResponse {
    /// The first choice; the bridge never asks for more than one.
    pub fn first_choice(&self) -> Option<&Choice> {
        self.choices.first()
    }
}

/// A single choice in the response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub message: ChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Assistant message of a completed choice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// Message content: a plain string or a list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<Value>),
}

impl MessageContent {
    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    Value::String(text) => Some(text.as_str()),
                    _ => part.get("text").and_then(Value::as_str),
                })
                .collect(),
        }
    }
}

/// A tool call, complete or as a streaming fragment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub call_type: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionCall>,
}

/// Function name and arguments of a tool call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: Option<String>,
    /// Usually a JSON-encoded string; some upstreams send an object.
    #[serde(default)]
    pub arguments: Option<Value>,
}

impl ToolCall {
    fn to_delta(&self, position: usize) -> NativeCallDelta {
        let function = self.function.as_ref();
        let arguments = match function.and_then(|f| f.arguments.as_ref()) {
            Some(Value::String(raw)) => raw.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        NativeCallDelta {
            index: self.index.unwrap_or(position),
            id: self.id.clone(),
            name: function.and_then(|f| f.name.clone()),
            arguments,
        }
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

/// Breakdown of prompt tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: Option<u32>,
}

impl From<&Usage> for ClaudeUsage {
    fn from(usage: &Usage) -> Self {
        ClaudeUsage {
            input_tokens: usage.prompt_tokens as i32,
            output_tokens: usage.completion_tokens as i32,
            cache_creation_input_tokens: None,
            cache_read_input_tokens: usage
                .prompt_tokens_details
                .as_ref()
                .and_then(|d| d.cached_tokens)
                .map(|t| t as i32),
        }
    }
}

/// Streaming response chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// A single choice in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Option<Delta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Delta content in streaming responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

fn pick_reasoning(primary: &Option<String>, fallback: &Option<String>) -> Option<String> {
    primary
        .iter()
        .chain(fallback.iter())
        .find(|r| !r.is_empty())
        .cloned()
}

fn native_deltas(tool_calls: &Option<Vec<ToolCall>>) -> Vec<NativeCallDelta> {
    tool_calls
        .iter()
        .flatten()
        .enumerate()
        .map(|(position, call)| call.to_delta(position))
        .collect()
}

impl From<&Choice> for UpstreamMessage {
    fn from(choice: &Choice) -> Self {
        let message = &choice.message;
        UpstreamMessage {
            content: message.content.as_ref().map(MessageContent::text),
            reasoning: pick_reasoning(&message.reasoning_content, &message.reasoning),
            tool_calls: native_deltas(&message.tool_calls),
            finish_reason: choice.finish_reason.clone(),
        }
    }
}

impl From<&StreamChoice> for UpstreamMessage {
    fn from(choice: &StreamChoice) -> Self {
        let delta = choice.delta.clone().unwrap_or_default();
        UpstreamMessage {
            content: delta.content.filter(|c| !c.is_empty()),
            reasoning: pick_reasoning(&delta.reasoning_content, &delta.reasoning),
            tool_calls: native_deltas(&delta.tool_calls),
            finish_reason: choice.finish_reason.clone(),
        }
    }
}
