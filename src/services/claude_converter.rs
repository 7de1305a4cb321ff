//! Claude to OpenAI format conversion.
//!
//! Requests are rewritten into OpenAI chat completions (with the function-call
//! bridge set up when enabled). Responses, streamed or not, run through the
//! translation engine and come back as Claude Messages output.

use crate::api::claude_models::{
    constants, ClaudeContentBlock, ClaudeMessage, ClaudeMessageContent, ClaudeMessageDelta,
    ClaudeMessagesRequest, ClaudeResponse, ClaudeStreamDelta, ClaudeStreamEvent,
    ClaudeStreamMessage, ClaudeSystemPrompt, ClaudeTool, ClaudeUsage,
};
use crate::api::openai_models::{ChatCompletionResponse, StreamChunk};
use crate::core::config::{AppConfig, BridgeConfig, UpstreamConfig};
use crate::core::error::{AppError, Result};
use crate::core::error_types::ERROR_TYPE_API;
use crate::core::metrics::get_metrics;
use crate::core::StreamCancelHandle;
use crate::services::bridge_prompt::{
    build_bridge_prompt, encode_tool_result, encode_tool_use, generate_trigger_signal,
};
use crate::transformer::{
    BlockDelta, BlockKind, ClaudeStreamAssembler, ContentBlock, ResponseAssembler, SseParser,
    StreamEvent, ToolCallExtractor, ToolRegistry, TriggerContext, TurnSummary, UpstreamMessage,
};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;

// ============================================================================
// Request Setup
// ============================================================================

/// The configuration slice that shapes an upstream request.
#[derive(Debug, Clone, Copy)]
pub struct RequestSetup<'a> {
    pub upstream: &'a UpstreamConfig,
    pub bridge: &'a BridgeConfig,
    pub thinking_model: Option<&'a str>,
    pub min_tokens_limit: u32,
    pub max_tokens_limit: u32,
}

impl<'a> RequestSetup<'a> {
    pub fn from_config(config: &'a AppConfig) -> Self {
        Self {
            upstream: &config.upstream,
            bridge: &config.bridge,
            thinking_model: config.thinking_model.as_deref(),
            min_tokens_limit: config.min_tokens_limit,
            max_tokens_limit: config.max_tokens_limit,
        }
    }

    /// Tool names the response side should recognize for this request.
    pub fn tool_registry(&self, request: &ClaudeMessagesRequest) -> ToolRegistry {
        let mut registry = ToolRegistry::new(request.tool_names());
        registry.extend(self.bridge.known_tools.iter().cloned());
        registry.with_shell_tools(self.bridge.shell_tools.iter().cloned())
    }

    /// Upstream model: the thinking override when extended thinking is on,
    /// otherwise the mapped client model.
    pub fn upstream_model(&self, request: &ClaudeMessagesRequest) -> String {
        match self.thinking_model {
            Some(model) if request.thinking_enabled() && !model.is_empty() => model.to_string(),
            _ => self.upstream.map_model(&request.model),
        }
    }

    /// Limits above `i32::MAX` saturate instead of wrapping negative.
    fn clamp_max_tokens(&self, max_tokens: i32) -> i32 {
        let min = i32::try_from(self.min_tokens_limit).unwrap_or(i32::MAX);
        let max = i32::try_from(self.max_tokens_limit).unwrap_or(i32::MAX);
        max_tokens.max(min).min(max)
    }
}

// ============================================================================
// Request Conversion: Claude -> OpenAI
// ============================================================================

/// Convert a Claude Messages request to an OpenAI chat completion request.
///
/// Returns the request body and the trigger context the response side must
/// use. The context is disabled unless the bridge is on and tools are declared.
pub fn claude_to_openai_request(
    claude_request: &ClaudeMessagesRequest,
    setup: &RequestSetup<'_>,
) -> (Value, TriggerContext) {
    let openai_model = setup.upstream_model(claude_request);
    let tools: &[ClaudeTool] = claude_request.tools.as_deref().unwrap_or(&[]);
    let bridged = setup.bridge.enabled && tools.iter().any(|t| !t.name.trim().is_empty());

    let trigger = if bridged {
        TriggerContext::new(generate_trigger_signal(&setup.bridge.trigger_prefix), true)
    } else {
        TriggerContext::disabled()
    };

    let mut openai_messages: Vec<Value> = Vec::new();

    let mut system_text = claude_request
        .system
        .as_ref()
        .map(extract_system_text)
        .unwrap_or_default()
        .trim()
        .to_string();
    if bridged {
        if !system_text.is_empty() {
            system_text.push_str("\n\n");
        }
        system_text.push_str(&build_bridge_prompt(tools, &trigger.signal));
        if let Some(instruction) = claude_request
            .tool_choice
            .as_ref()
            .and_then(bridged_tool_choice)
        {
            system_text.push_str("\n\n");
            system_text.push_str(&instruction);
        }
    }
    if !system_text.is_empty() {
        openai_messages.push(json!({
            "role": constants::ROLE_SYSTEM,
            "content": system_text
        }));
    }

    // tool_use id -> tool name, for labelling results in the bridged transcript
    let mut tool_names: HashMap<String, String> = HashMap::new();
    for msg in &claude_request.messages {
        if msg.role == constants::ROLE_USER {
            if bridged {
                openai_messages.push(convert_user_message_bridged(msg, &tool_names));
            } else {
                openai_messages.extend(convert_claude_tool_results(msg));
                if let Some(user) = convert_claude_user_message(msg) {
                    openai_messages.push(user);
                }
            }
        } else if msg.role == constants::ROLE_ASSISTANT {
            if bridged {
                openai_messages.push(convert_assistant_message_bridged(
                    msg,
                    &trigger.signal,
                    &mut tool_names,
                ));
            } else {
                openai_messages.push(convert_claude_assistant_message(msg));
            }
        }
    }

    let mut openai_request = json!({
        "model": openai_model,
        "messages": openai_messages,
        "max_tokens": setup.clamp_max_tokens(claude_request.max_tokens),
        "stream": claude_request.stream,
    });

    if claude_request.stream {
        openai_request["stream_options"] = json!({"include_usage": true});
    }
    if let Some(temp) = claude_request.temperature {
        openai_request["temperature"] = json!(temp);
    }
    if let Some(ref stop_sequences) = claude_request.stop_sequences {
        openai_request["stop"] = json!(stop_sequences);
    }
    if let Some(top_p) = claude_request.top_p {
        openai_request["top_p"] = json!(top_p);
    }

    if !bridged {
        let openai_tools = convert_claude_tools(tools);
        if !openai_tools.is_empty() {
            openai_request["tools"] = json!(openai_tools);
            if let Some(ref tool_choice) = claude_request.tool_choice {
                openai_request["tool_choice"] = convert_tool_choice(tool_choice);
            }
        }
    }

    tracing::debug!(
        model = %openai_model,
        messages = openai_request["messages"].as_array().map(Vec::len).unwrap_or(0),
        bridged = bridged,
        "Converted Claude request to OpenAI format"
    );

    (openai_request, trigger)
}

// ============================================================================
// Response Conversion: OpenAI -> Claude
// ============================================================================

/// Convert a complete OpenAI response to a Claude response.
pub fn openai_to_claude_response(
    openai_response: &Value,
    original_model: &str,
    ctx: &TriggerContext,
    registry: &ToolRegistry,
) -> Result<(ClaudeResponse, TurnSummary)> {
    let response: ChatCompletionResponse = serde_json::from_value(openai_response.clone())?;
    let choice = response.first_choice().ok_or_else(|| AppError::Upstream {
        status: 502,
        message: "No choices in upstream response".to_string(),
    })?;

    let assembler = ResponseAssembler::new(ToolCallExtractor::new(ctx.clone(), registry.clone()));
    let turn = assembler.assemble(&UpstreamMessage::from(choice));

    let mut content: Vec<ClaudeContentBlock> =
        turn.blocks.into_iter().map(content_block_to_claude).collect();
    if content.is_empty() {
        content.push(ClaudeContentBlock::text(""));
    }

    let usage = response
        .usage
        .as_ref()
        .map(ClaudeUsage::from)
        .unwrap_or_default();

    let claude_response = ClaudeResponse::new(
        crate::transformer::generate_message_id(),
        original_model,
        content,
        Some(turn.summary.stop_reason.as_str().to_string()),
        usage,
    );
    Ok((claude_response, turn.summary))
}

/// Map an engine block to its wire form.
pub fn content_block_to_claude(block: ContentBlock) -> ClaudeContentBlock {
    match block {
        ContentBlock::Text(text) => ClaudeContentBlock::text(text),
        ContentBlock::Thinking(thinking) => ClaudeContentBlock::thinking(thinking),
        ContentBlock::ToolUse(tool) => ClaudeContentBlock::tool_use(tool.id, tool.name, tool.input),
    }
}

/// Map an engine stream event to its wire form.
pub fn stream_event_to_claude(
    event: StreamEvent,
    model: &str,
    usage: &ClaudeUsage,
) -> ClaudeStreamEvent {
    match event {
        StreamEvent::MessageStart { id } => ClaudeStreamEvent::MessageStart {
            message: ClaudeStreamMessage::new(id, model, usage.clone()),
        },
        StreamEvent::Ping => ClaudeStreamEvent::Ping,
        StreamEvent::BlockStart { index, kind } => ClaudeStreamEvent::ContentBlockStart {
            index,
            content_block: match kind {
                BlockKind::Text => ClaudeContentBlock::text(""),
                BlockKind::Thinking => ClaudeContentBlock::thinking(""),
                BlockKind::ToolUse { id, name } => ClaudeContentBlock::tool_use(id, name, json!({})),
            },
        },
        StreamEvent::BlockDelta { index, delta } => ClaudeStreamEvent::ContentBlockDelta {
            index,
            delta: match delta {
                BlockDelta::Text(text) => ClaudeStreamDelta::text(text),
                BlockDelta::Thinking(thinking) => ClaudeStreamDelta::thinking(thinking),
                BlockDelta::InputJson(partial) => ClaudeStreamDelta::input_json(partial),
            },
        },
        StreamEvent::BlockStop { index } => ClaudeStreamEvent::ContentBlockStop { index },
        StreamEvent::MessageDelta { stop_reason } => ClaudeStreamEvent::MessageDelta {
            delta: ClaudeMessageDelta {
                stop_reason: Some(stop_reason.as_str().to_string()),
                stop_sequence: None,
            },
            usage: usage.clone(),
        },
        StreamEvent::MessageStop => ClaudeStreamEvent::MessageStop,
    }
}

// ============================================================================
// Streaming Conversion: OpenAI -> Claude
// ============================================================================

type UpstreamBody = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send>>;

/// State threaded through the unfold loop.
struct StreamDriver {
    upstream: UpstreamBody,
    parser: SseParser,
    assembler: ClaudeStreamAssembler,
    model: String,
    usage: ClaudeUsage,
    pending: VecDeque<String>,
    done: bool,
    cancel: Option<StreamCancelHandle>,
}

impl StreamDriver {
    fn push(&mut self, events: Vec<StreamEvent>) {
        for event in events {
            let frame = stream_event_to_claude(event, &self.model, &self.usage).to_sse();
            self.pending.push_back(frame);
        }
    }

    fn finish(&mut self) {
        self.done = true;
        if self.assembler.is_finished() {
            return;
        }
        let events = self.assembler.finish();
        self.push(events);
        get_metrics().record_turn("stream", self.assembler.summary());
        if let Some(cancel) = &self.cancel {
            cancel.mark_completed();
        }
    }

    fn fail(&mut self, message: String) {
        tracing::error!(error = %message, "Upstream stream failed");
        get_metrics().record_upstream_error("stream");
        self.pending
            .push_back(ClaudeStreamEvent::error(ERROR_TYPE_API, message).to_sse());
        self.done = true;
        if let Some(cancel) = &self.cancel {
            cancel.mark_completed();
        }
    }

    fn handle_data(&mut self, data: &str) {
        let data = data.trim();
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            self.finish();
            return;
        }

        let value: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, chunk = %data, "Failed to parse upstream chunk");
                return;
            }
        };
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            self.fail(message);
            return;
        }

        let chunk: StreamChunk = match serde_json::from_value(value) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "Upstream chunk has unexpected shape");
                return;
            }
        };
        if let Some(usage) = &chunk.usage {
            self.usage = ClaudeUsage::from(usage);
        }
        if let Some(choice) = chunk.choices.first() {
            let events = self.assembler.process_chunk(&UpstreamMessage::from(choice));
            self.push(events);
        }
    }

    fn handle_bytes(&mut self, bytes: &[u8]) {
        for event in self.parser.parse(bytes) {
            if self.done {
                break;
            }
            if let Some(data) = event.data {
                self.handle_data(&data);
            }
        }
    }
}

/// Convert an OpenAI SSE body into Claude SSE frames.
///
/// Reads upstream only as fast as frames are consumed. Stops on `[DONE]`,
/// end of body, an upstream error, or when `cancel_handle` fires.
pub fn convert_openai_streaming_to_claude(
    openai_stream: UpstreamBody,
    original_model: String,
    mut assembler: ClaudeStreamAssembler,
    cancel_handle: Option<StreamCancelHandle>,
) -> Pin<Box<dyn Stream<Item = String> + Send>> {
    let opening = assembler.start();
    let mut driver = StreamDriver {
        upstream: openai_stream,
        parser: SseParser::new(),
        assembler,
        model: original_model,
        usage: ClaudeUsage::default(),
        pending: VecDeque::new(),
        done: false,
        cancel: cancel_handle,
    };
    driver.push(opening);

    let stream = futures::stream::unfold(driver, |mut driver| async move {
        loop {
            if let Some(frame) = driver.pending.pop_front() {
                return Some((frame, driver));
            }
            if driver.done {
                return None;
            }

            let next = match driver.cancel.clone() {
                Some(cancel) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    item = driver.upstream.next() => Some(item),
                },
                None => Some(driver.upstream.next().await),
            };
            let Some(next) = next else {
                tracing::info!(
                    message_id = %driver.assembler.message_id(),
                    "Client disconnected, stopping upstream read"
                );
                return None;
            };

            match next {
                Some(Ok(bytes)) => driver.handle_bytes(&bytes),
                Some(Err(e)) => driver.fail(format!("Streaming error: {}", e)),
                None => {
                    // Flush a final frame that lacks its blank line
                    driver.handle_bytes(b"\n\n");
                    driver.finish();
                }
            }
        }
    });

    Box::pin(stream)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Extract system text from Claude system field.
fn extract_system_text(system: &ClaudeSystemPrompt) -> String {
    match system {
        ClaudeSystemPrompt::Text(text) => text.clone(),
        ClaudeSystemPrompt::Blocks(blocks) => blocks
            .iter()
            .filter(|b| b.content_type == constants::CONTENT_TEXT)
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

/// Extra instruction for a forced tool choice when tools are bridged.
fn bridged_tool_choice(tool_choice: &Value) -> Option<String> {
    match tool_choice.get("type").and_then(Value::as_str) {
        Some("any") => Some("You must call one of the available tools in this reply.".to_string()),
        Some("tool") => tool_choice
            .get("name")
            .and_then(Value::as_str)
            .map(|name| format!("You must call the tool {} in this reply.", name)),
        _ => None,
    }
}

fn image_part(block: &ClaudeContentBlock) -> Option<Value> {
    let ClaudeContentBlock::Image(image) = block else {
        return None;
    };
    let source = &image.source;
    let url = match (&source.url, &source.data) {
        (Some(url), _) => url.clone(),
        (None, Some(data)) => format!(
            "data:{};base64,{}",
            source.media_type.as_deref().unwrap_or("image/png"),
            data
        ),
        (None, None) => return None,
    };
    Some(json!({"type": "image_url", "image_url": {"url": url}}))
}

/// Collapse a part list into a plain string when it is a single text part.
fn user_content(parts: Vec<Value>) -> Value {
    if parts.len() == 1 {
        if let Some(text) = parts[0].get("text").and_then(Value::as_str) {
            return json!(text);
        }
    }
    json!(parts)
}

/// Convert a Claude user message to OpenAI format, ignoring tool results.
///
/// Returns `None` when nothing but tool results remain.
fn convert_claude_user_message(msg: &ClaudeMessage) -> Option<Value> {
    match &msg.content {
        ClaudeMessageContent::Text(text) => {
            Some(json!({"role": constants::ROLE_USER, "content": text}))
        }
        ClaudeMessageContent::Blocks(blocks) => {
            let parts: Vec<Value> = blocks
                .iter()
                .filter_map(|block| match block {
                    ClaudeContentBlock::Text(text_block) => {
                        Some(json!({"type": "text", "text": text_block.text}))
                    }
                    ClaudeContentBlock::Image(_) => image_part(block),
                    _ => None,
                })
                .collect();
            if parts.is_empty() {
                return None;
            }
            Some(json!({"role": constants::ROLE_USER, "content": user_content(parts)}))
        }
    }
}

/// Convert a Claude user message for a bridged request: tool results become
/// labelled text.
fn convert_user_message_bridged(msg: &ClaudeMessage, tool_names: &HashMap<String, String>) -> Value {
    let blocks = match &msg.content {
        ClaudeMessageContent::Text(text) => {
            return json!({"role": constants::ROLE_USER, "content": text});
        }
        ClaudeMessageContent::Blocks(blocks) => blocks,
    };

    let parts: Vec<Value> = blocks
        .iter()
        .filter_map(|block| match block {
            ClaudeContentBlock::Text(text_block) => {
                Some(json!({"type": "text", "text": text_block.text}))
            }
            ClaudeContentBlock::Image(_) => image_part(block),
            ClaudeContentBlock::ToolResult(result) => {
                let text = encode_tool_result(
                    tool_names.get(&result.tool_use_id).map(String::as_str),
                    &result.tool_use_id,
                    &parse_tool_result_content(&result.content),
                    result.is_error.unwrap_or(false),
                );
                Some(json!({"type": "text", "text": text}))
            }
            _ => None,
        })
        .collect();

    // Consecutive text parts read better as one message
    let all_text = parts.iter().all(|p| p.get("type") == Some(&json!("text")));
    if all_text {
        let joined = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n\n");
        return json!({"role": constants::ROLE_USER, "content": joined});
    }
    json!({"role": constants::ROLE_USER, "content": user_content(parts)})
}

/// Convert Claude assistant message to OpenAI format.
fn convert_claude_assistant_message(msg: &ClaudeMessage) -> Value {
    match &msg.content {
        ClaudeMessageContent::Text(text) => {
            json!({"role": constants::ROLE_ASSISTANT, "content": text})
        }
        ClaudeMessageContent::Blocks(blocks) => {
            let mut text_parts: Vec<String> = Vec::new();
            let mut tool_calls: Vec<Value> = Vec::new();

            for block in blocks {
                match block {
                    ClaudeContentBlock::Text(text_block) => {
                        text_parts.push(text_block.text.clone());
                    }
                    ClaudeContentBlock::ToolUse(tool_block) => {
                        tool_calls.push(json!({
                            "id": tool_block.id,
                            "type": constants::TOOL_FUNCTION,
                            constants::TOOL_FUNCTION: {
                                "name": tool_block.name,
                                "arguments": tool_block.input.to_string()
                            }
                        }));
                    }
                    _ => {}
                }
            }

            let mut openai_message = json!({"role": constants::ROLE_ASSISTANT});
            openai_message["content"] = if text_parts.is_empty() {
                Value::Null
            } else {
                json!(text_parts.join(""))
            };
            if !tool_calls.is_empty() {
                openai_message["tool_calls"] = json!(tool_calls);
            }
            openai_message
        }
    }
}

/// Convert a Claude assistant message for a bridged request: tool calls are
/// written back as trigger plus invoke markup.
fn convert_assistant_message_bridged(
    msg: &ClaudeMessage,
    trigger: &str,
    tool_names: &mut HashMap<String, String>,
) -> Value {
    let blocks = match &msg.content {
        ClaudeMessageContent::Text(text) => {
            return json!({"role": constants::ROLE_ASSISTANT, "content": text});
        }
        ClaudeMessageContent::Blocks(blocks) => blocks,
    };

    let mut parts: Vec<String> = Vec::new();
    for block in blocks {
        match block {
            ClaudeContentBlock::Text(text_block) if !text_block.text.trim().is_empty() => {
                parts.push(text_block.text.clone());
            }
            ClaudeContentBlock::ToolUse(tool_block) => {
                tool_names.insert(tool_block.id.clone(), tool_block.name.clone());
                parts.push(encode_tool_use(trigger, tool_block));
            }
            _ => {}
        }
    }

    json!({"role": constants::ROLE_ASSISTANT, "content": parts.join("\n")})
}

/// Convert Claude tool results to OpenAI `tool` messages.
fn convert_claude_tool_results(msg: &ClaudeMessage) -> Vec<Value> {
    let ClaudeMessageContent::Blocks(blocks) = &msg.content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|block| match block {
            ClaudeContentBlock::ToolResult(result_block) => Some(json!({
                "role": constants::ROLE_TOOL,
                "tool_call_id": result_block.tool_use_id,
                "content": parse_tool_result_content(&result_block.content)
            })),
            _ => None,
        })
        .collect()
}

/// Parse and normalize tool result content into a string format.
fn parse_tool_result_content(content: &Value) -> String {
    match content {
        Value::Null => "No content provided".to_string(),
        Value::String(s) => s.clone(),
        Value::Array(arr) => {
            let parts: Vec<String> = arr
                .iter()
                .filter_map(|item| {
                    if let Some(obj) = item.as_object() {
                        if obj.get("type").and_then(|t| t.as_str()) == Some(constants::CONTENT_TEXT)
                        {
                            return obj.get("text").and_then(|t| t.as_str()).map(str::to_string);
                        }
                    }
                    if let Some(s) = item.as_str() {
                        return Some(s.to_string());
                    }
                    serde_json::to_string(item).ok()
                })
                .collect();
            parts.join("\n").trim().to_string()
        }
        Value::Object(obj) => {
            if obj.get("type").and_then(|t| t.as_str()) == Some(constants::CONTENT_TEXT) {
                return obj
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or("")
                    .to_string();
            }
            content.to_string()
        }
        _ => content.to_string(),
    }
}

/// Convert Claude tools to OpenAI format.
fn convert_claude_tools(tools: &[ClaudeTool]) -> Vec<Value> {
    tools
        .iter()
        .filter(|tool| !tool.name.trim().is_empty())
        .map(|tool| {
            json!({
                "type": constants::TOOL_FUNCTION,
                constants::TOOL_FUNCTION: {
                    "name": tool.name,
                    "description": tool.description.as_deref().unwrap_or(""),
                    "parameters": tool.input_schema
                }
            })
        })
        .collect()
}

/// Convert Claude tool_choice to OpenAI format.
fn convert_tool_choice(tool_choice: &Value) -> Value {
    match tool_choice.get("type").and_then(|t| t.as_str()) {
        Some("any") => json!("required"),
        Some("none") => json!("none"),
        Some("tool") => match tool_choice.get("name").and_then(|n| n.as_str()) {
            Some(name) => json!({
                "type": constants::TOOL_FUNCTION,
                constants::TOOL_FUNCTION: {"name": name}
            }),
            None => json!("auto"),
        },
        _ => json!("auto"),
    }
}

// ============================================================================
// Tests
// ============================================================================
