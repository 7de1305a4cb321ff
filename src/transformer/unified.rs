//! Shared value types for the translation engine.
//!
//! Everything here is transient and scoped to a single response turn.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

// ============================================================================
// Thinking Events
// ============================================================================

/// Kind of event produced by the [`ThinkingParser`](super::ThinkingParser).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingKind {
    Thinking,
    Text,
    End,
}

/// One ordered event drained from the thinking parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkingEvent {
    pub kind: ThinkingKind,
    pub content: String,
}

impl ThinkingEvent {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: ThinkingKind::Text,
            content: content.into(),
        }
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self {
            kind: ThinkingKind::Thinking,
            content: content.into(),
        }
    }

    pub fn end() -> Self {
        Self {
            kind: ThinkingKind::End,
            content: String::new(),
        }
    }
}

// ============================================================================
// Tool Calls
// ============================================================================

/// Textual encoding a tool invocation was recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// `<invoke name="T"><parameter name="K">V</parameter></invoke>`
    CanonicalXml,
    /// `<><invokename="T"><parametername="K">V` with no closers
    MalformedXml,
    /// `name="T<arg_key>K</arg_key><arg_value>V</arg_value>`
    KeyValueXml,
    /// `{"name": "T", "arguments": {...}}` anywhere in the text
    EmbeddedJson,
    /// Structured `tool_calls` field on the upstream message
    Native,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::CanonicalXml => "canonical_xml",
            Encoding::MalformedXml => "malformed_xml",
            Encoding::KeyValueXml => "key_value_xml",
            Encoding::EmbeddedJson => "embedded_json",
            Encoding::Native => "native",
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool invocation recovered from model output.
///
/// `args` keeps the order the model wrote the arguments in.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub name: String,
    pub args: Map<String, Value>,
    pub encoding: Encoding,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, args: Map<String, Value>, encoding: Encoding) -> Self {
        Self {
            name: name.into(),
            args,
            encoding,
        }
    }
}

/// Target-protocol form of a [`ToolCallRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ToolUseBlock {
    /// Build a block with a fresh `toolu_` id.
    pub fn from_request(request: ToolCallRequest) -> Self {
        Self {
            id: generate_tool_use_id(),
            name: request.name,
            input: Value::Object(request.args),
        }
    }
}

/// Generate a Claude-style tool use id.
pub fn generate_tool_use_id() -> String {
    format!("toolu_{}", &uuid::Uuid::new_v4().simple().to_string()[..24])
}

/// Generate a Claude-style message id.
pub fn generate_message_id() -> String {
    format!("msg_{}", &uuid::Uuid::new_v4().simple().to_string()[..24])
}

// ============================================================================
// Content Blocks
// ============================================================================

/// The atoms of an assembled response.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    Thinking(String),
    ToolUse(ToolUseBlock),
}

// ============================================================================
// Per-request Context
// ============================================================================

/// Per-request marker the model was told to emit before any invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerContext {
    pub signal: String,
    pub function_call_enabled: bool,
}

impl TriggerContext {
    pub fn new(signal: impl Into<String>, function_call_enabled: bool) -> Self {
        Self {
            signal: signal.into(),
            function_call_enabled,
        }
    }

    /// A context with bridging switched off.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Bridging runs only when enabled and a trigger is configured.
    pub fn is_active(&self) -> bool {
        self.function_call_enabled && !self.signal.is_empty()
    }
}

/// Known tool names for one deployment and request.
///
/// Passed into the extractor explicitly; there is no global registry.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    names: HashSet<String>,
    shell_tools: HashSet<String>,
}

impl ToolRegistry {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            shell_tools: HashSet::new(),
        }
    }

    /// Mark tools whose `command` argument is handed to a shell.
    pub fn with_shell_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shell_tools = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn extend<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names.extend(names.into_iter().map(Into::into));
    }

    /// Resolve a possibly differently-cased name to the registered spelling.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        if let Some(found) = self.names.get(name) {
            return Some(found.as_str());
        }
        self.names
            .iter()
            .find(|known| known.eq_ignore_ascii_case(name))
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    pub fn is_shell_tool(&self, name: &str) -> bool {
        self.shell_tools
            .iter()
            .any(|shell| shell.eq_ignore_ascii_case(name))
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}

// ============================================================================
// Stop Reason
// ============================================================================

/// Claude stop reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
}

impl StopReason {
    /// Map an OpenAI finish reason.
    pub fn from_finish_reason(finish_reason: &str) -> Self {
        match finish_reason {
            "stop" => StopReason::EndTurn,
            "length" => StopReason::MaxTokens,
            "tool_calls" | "function_call" => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
            StopReason::ToolUse => "tool_use",
        }
    }

    /// Final stop reason given whether a tool_use block actually went out.
    ///
    /// Returns the reason and whether it was downgraded from `tool_use`.
    pub fn settle(self, tool_emitted: bool) -> (Self, bool) {
        match (self, tool_emitted) {
            (_, true) => (StopReason::ToolUse, false),
            (StopReason::ToolUse, false) => (StopReason::EndTurn, true),
            (other, false) => (other, false),
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Upstream Input
// ============================================================================

/// One native tool call, or a fragment of one when streaming.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

/// The parts of an upstream choice the engine consumes.
///
/// Holds either a complete message or a single streamed delta.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamMessage {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<NativeCallDelta>,
    pub finish_reason: Option<String>,
}

// ============================================================================
// Stream Events
// ============================================================================

/// Kind of a content block being opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
}

/// Incremental content of an open block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDelta {
    Text(String),
    Thinking(String),
    InputJson(String),
}

/// Protocol-neutral streaming event produced by the stream assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    MessageStart { id: String },
    Ping,
    BlockStart { index: usize, kind: BlockKind },
    BlockDelta { index: usize, delta: BlockDelta },
    BlockStop { index: usize },
    MessageDelta { stop_reason: StopReason },
    MessageStop,
}

// ============================================================================
// Turn Summary
// ============================================================================

/// What happened during one assembled turn, for logs and metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnSummary {
    pub tool_name: Option<String>,
    pub encoding: Option<Encoding>,
    pub downgraded: bool,
    pub stop_reason: StopReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_reason_from_finish_reason() {
        assert_eq!(StopReason::from_finish_reason("stop"), StopReason::EndTurn);
        assert_eq!(StopReason::from_finish_reason("length"), StopReason::MaxTokens);
        assert_eq!(StopReason::from_finish_reason("tool_calls"), StopReason::ToolUse);
        assert_eq!(StopReason::from_finish_reason("function_call"), StopReason::ToolUse);
        assert_eq!(StopReason::from_finish_reason("content_filter"), StopReason::EndTurn);
        assert_eq!(StopReason::from_finish_reason("whatever"), StopReason::EndTurn);
    }

    #[test]
    fn test_stop_reason_settle() {
        assert_eq!(StopReason::ToolUse.settle(false), (StopReason::EndTurn, true));
        assert_eq!(StopReason::ToolUse.settle(true), (StopReason::ToolUse, false));
        assert_eq!(StopReason::EndTurn.settle(true), (StopReason::ToolUse, false));
        assert_eq!(StopReason::MaxTokens.settle(false), (StopReason::MaxTokens, false));
    }

    #[test]
    fn test_stop_reason_serialization() {
        let json = serde_json::to_string(&StopReason::ToolUse).unwrap();
        assert_eq!(json, "\"tool_use\"");
        assert_eq!(StopReason::EndTurn.to_string(), "end_turn");
    }

    #[test]
    fn test_trigger_context_activity() {
        assert!(TriggerContext::new("<<CALL_ab>>", true).is_active());
        assert!(!TriggerContext::new("<<CALL_ab>>", false).is_active());
        assert!(!TriggerContext::new("", true).is_active());
        assert!(!TriggerContext::disabled().is_active());
    }

    #[test]
    fn test_tool_registry_lookup() {
        let registry = ToolRegistry::new(["Read", "TodoWrite"]).with_shell_tools(["Bash"]);
        assert!(registry.contains("Read"));
        assert_eq!(registry.resolve("todowrite"), Some("TodoWrite"));
        assert!(!registry.contains("Write"));
        assert!(registry.is_shell_tool("bash"));
        assert!(!registry.is_shell_tool("Read"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_tool_use_block_from_request() {
        let mut args = Map::new();
        args.insert("file_path".to_string(), Value::String("/tmp/a".to_string()));
        let block = ToolUseBlock::from_request(ToolCallRequest::new(
            "Read",
            args,
            Encoding::CanonicalXml,
        ));
        assert!(block.id.starts_with("toolu_"));
        assert_eq!(block.id.len(), "toolu_".len() + 24);
        assert_eq!(block.name, "Read");
        assert_eq!(block.input["file_path"], "/tmp/a");
    }

    #[test]
    fn test_generate_message_id() {
        let id = generate_message_id();
        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), 28);
    }
}
