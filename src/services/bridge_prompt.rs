//! Prompt side of the function-call bridge.
//!
//! When bridging is on, tools are not forwarded natively. Instead the system
//! prompt describes them and tells the model to write a per-request trigger
//! signal followed by `<invoke>` markup; the response side looks for exactly
//! that shape. Earlier tool calls and results in the history are re-encoded the
//! same way so the model sees a consistent transcript.

use crate::api::claude_models::{ClaudeContentBlockToolUse, ClaudeTool};
use rand::{distributions::Alphanumeric, Rng};
use serde_json::Value;

/// Length of the random part of a trigger signal.
const TRIGGER_SUFFIX_LEN: usize = 6;

/// Fresh trigger signal such as `<<CALL_a8Kq2z>>`.
pub fn generate_trigger_signal(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TRIGGER_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("<<{}_{}>>", prefix, suffix)
}

/// Render a parameter value the way the extractor parses it back: strings
/// verbatim, everything else as compact JSON.
fn render_parameter(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Encode one invocation as trigger plus canonical markup.
pub fn encode_invocation(trigger: &str, name: &str, input: &Value) -> String {
    let mut out = format!("{}\n<invoke name=\"{}\">\n", trigger, name);
    if let Value::Object(args) = input {
        for (key, value) in args {
            out.push_str(&format!(
                "<parameter name=\"{}\">{}</parameter>\n",
                key,
                render_parameter(value)
            ));
        }
    }
    out.push_str("</invoke>");
    out
}

/// Encode a prior `tool_use` block for the transcript.
pub fn encode_tool_use(trigger: &str, block: &ClaudeContentBlockToolUse) -> String {
    encode_invocation(trigger, &block.name, &block.input)
}

/// Encode a prior `tool_result` for the transcript.
pub fn encode_tool_result(tool_name: Option<&str>, tool_use_id: &str, content: &str, is_error: bool) -> String {
    let label = tool_name.unwrap_or("tool");
    if is_error {
        format!(
            "[Tool Result: {} (id: {})]\nError: {}",
            label, tool_use_id, content
        )
    } else {
        format!("[Tool Result: {} (id: {})]\n{}", label, tool_use_id, content)
    }
}

fn describe_parameters(schema: &Value) -> String {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return String::new();
    };
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut out = String::from("Parameters:\n");
    for (name, prop) in properties {
        let type_str = prop.get("type").and_then(Value::as_str).unwrap_or("any");
        let marker = if required.contains(&name.as_str()) {
            "required"
        } else {
            "optional"
        };
        let desc = prop
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("");
        out.push_str(&format!("  - `{}` ({}, {}): {}\n", name, type_str, marker, desc));
    }
    out
}

/// Build the system prompt section that teaches the model the invocation format.
pub fn build_bridge_prompt(tools: &[ClaudeTool], trigger: &str) -> String {
    let mut descriptions = String::new();
    for tool in tools.iter().filter(|t| !t.name.trim().is_empty()) {
        descriptions.push_str(&format!("### {}\n", tool.name));
        if let Some(desc) = tool.description.as_deref().filter(|d| !d.trim().is_empty()) {
            descriptions.push_str(desc.trim());
            descriptions.push('\n');
        }
        descriptions.push_str(&describe_parameters(&tool.input_schema));
        descriptions.push('\n');
    }

    format!(
        r#"## Tool Calling

You have access to the tools listed below. To call a tool, write the line {trigger} and, directly after it, an invoke block in this exact format:

{trigger}
<invoke name="ToolName">
<parameter name="param1">value1</parameter>
<parameter name="param2">value2</parameter>
</invoke>

Rules:
- Write {trigger} only when you are calling a tool, never when talking about one.
- Call at most one tool per reply, then stop and wait for its result.
- Parameter values that are arrays or objects must be valid JSON.
- Never invent tool results; they arrive in the next user message.

## Available Tools

{descriptions}"#,
        trigger = trigger,
        descriptions = descriptions,
    )
}
