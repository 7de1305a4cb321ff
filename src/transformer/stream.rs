//! Streaming utilities and the streaming response assembler.
//!
//! [`SseParser`] splits upstream bytes into SSE events. The
//! [`ClaudeStreamAssembler`] consumes upstream deltas one at a time and
//! produces the Messages-style event sequence:
//!
//! ```text
//! message_start, ping
//!   (content_block_start, content_block_delta*, content_block_stop)*
//! message_delta, message_stop
//! ```
//!
//! Text that may still turn into an invocation is held back until it is
//! resolved, so the client never sees the trigger signal or raw markup.

use super::assembler::native_call_request;
use super::cleaner::{is_preamble_line, PreambleCleaner};
use super::extractor::ToolCallExtractor;
use super::thinking::ThinkingParser;
use super::unified::{
    generate_message_id, BlockDelta, BlockKind, Encoding, NativeCallDelta, StopReason,
    StreamEvent, ThinkingKind, ToolCallRequest, ToolUseBlock, TurnSummary, UpstreamMessage,
};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;

// ============================================================================
// SSE Parser
// ============================================================================

/// SSE event parsed from stream.
#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: Option<String>,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

/// SSE parser state.
///
/// A multi-byte character split across network reads is kept back until
/// its remaining bytes arrive.
pub struct SseParser {
    buffer: String,
    partial: Vec<u8>,
}

impl SseParser {
    /// Create a new SSE parser.
    pub fn new() -> Self {
        SseParser {
            buffer: String::new(),
            partial: Vec::new(),
        }
    }

    /// Parse incoming bytes and return complete events.
    pub fn parse(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.partial.extend_from_slice(chunk);
        self.decode_partial();
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut events = vec![];

        // Split by double newlines (event boundaries)
        while let Some(pos) = self.buffer.find("\n\n") {
            let event_block = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);

            let mut current_event = SseEvent::default();
            for line in event_block.lines() {
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }

                let (field, value) = match line.split_once(':') {
                    Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                    None => (line, ""),
                };
                match field {
                    "event" => current_event.event = Some(value.to_string()),
                    "data" => match current_event.data {
                        Some(ref mut data) => {
                            data.push('\n');
                            data.push_str(value);
                        }
                        None => current_event.data = Some(value.to_string()),
                    },
                    "id" => current_event.id = Some(value.to_string()),
                    "retry" => current_event.retry = value.parse().ok(),
                    _ => {}
                }
            }

            if current_event.data.is_some() || current_event.event.is_some() {
                events.push(current_event);
            }
        }

        events
    }

    fn decode_partial(&mut self) {
        match std::str::from_utf8(&self.partial) {
            Ok(text) => {
                self.buffer.push_str(text);
                self.partial.clear();
            }
            Err(err) if err.error_len().is_none() => {
                let valid = err.valid_up_to();
                if let Ok(text) = std::str::from_utf8(&self.partial[..valid]) {
                    self.buffer.push_str(text);
                }
                self.partial.drain(..valid);
            }
            Err(_) => {
                self.buffer.push_str(&String::from_utf8_lossy(&self.partial));
                self.partial.clear();
            }
        }
    }

    /// Get remaining buffer content.
    pub fn remaining(&self) -> &str {
        &self.buffer
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.partial.clear();
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// SSE Serializer
// ============================================================================

/// Format an SSE event for transmission.
pub fn format_sse_event(event: Option<&str>, data: &str) -> String {
    let mut output = String::new();

    if let Some(event_name) = event {
        output.push_str("event: ");
        output.push_str(event_name);
        output.push('\n');
    }

    for line in data.lines() {
        output.push_str("data: ");
        output.push_str(line);
        output.push('\n');
    }

    output.push('\n');
    output
}

/// Format a simple data-only SSE event.
pub fn format_sse_data(data: &str) -> String {
    format!("data: {}\n\n", data)
}

/// Format the SSE done marker.
pub fn format_sse_done() -> String {
    "data: [DONE]\n\n".to_string()
}

// ============================================================================
// Hold-back Rules
// ============================================================================

/// Markers that start an invocation even without the trigger signal.
const INVOCATION_MARKERS: &[&str] = &["<function_calls", "<invoke", "invokename=", "<tool_call"];

/// Closers after which a held invocation can be resolved early.
const INVOCATION_CLOSERS: &[&str] = &["</invoke>", "</tool_call>", "</function_calls>"];

/// Longest trailing fragment treated as a tag still being written.
const MAX_PARTIAL_TAG: usize = 64;

/// Open objects shorter than this are held even without a `name` key.
const SHORT_JSON_FRAGMENT: usize = 64;

/// What may follow a closed `<arg_value>` while the same invocation goes on.
const KV_CONTINUATIONS: &[&str] = &["<arg_key>", "\">", "</tool_call>", "</invoke>"];

lazy_static! {
    static ref PARTIAL_TAG: Regex = Regex::new(r"^<(?:/?[A-Za-z_][^<>\n]*|/)?$").unwrap();
    static ref KV_START: Regex =
        Regex::new(r#"name\s*=\s*"?[A-Za-z_][\w\-\.]*\s*<arg_key>|<arg_key>"#).unwrap();
    static ref KV_PARTIAL_HEAD: Regex = Regex::new(
        r#"\bn(?:a(?:m(?:e(?:\s*=\s*"?(?:[A-Za-z_][\w\-\.]*)?\s*(?:<[A-Za-z_]*)?)?)?)?)?$"#
    )
    .unwrap();
    static ref KV_TAIL: Regex =
        Regex::new(r#"^\s*(?:"\s*>)?\s*(?:</tool_call>|</invoke>)?\s*"#).unwrap();
}

fn partial_signal_suffix(buf: &str, signal: &str) -> Option<usize> {
    (1..signal.len())
        .rev()
        .filter(|k| signal.is_char_boundary(*k))
        .find(|k| buf.ends_with(&signal[..*k]))
        .map(|k| buf.len() - k)
}

/// Start of the last line when it announces what comes next.
fn trailing_preamble(buf: &str) -> Option<usize> {
    let trimmed = buf.trim_end();
    let start = trimmed.rfind('\n').map(|i| i + 1).unwrap_or(0);
    is_preamble_line(trimmed[start..].trim()).then_some(start)
}

/// Start of a key/value invocation that may still be growing.
///
/// The invocation is settled once a closed `<arg_value>` is followed by
/// text that cannot continue it.
fn open_key_value(buf: &str) -> Option<usize> {
    let Some(head) = KV_START.find(buf) else {
        return KV_PARTIAL_HEAD.find(buf).map(|m| m.start());
    };
    let tail = &buf[head.start()..];
    let Some(close) = tail.rfind("</arg_value>") else {
        return Some(head.start());
    };
    let after = &tail[close + "</arg_value>".len()..];
    let rest = KV_TAIL
        .find(after)
        .map(|m| &after[m.end()..])
        .unwrap_or(after);
    let pending = rest.is_empty()
        || KV_CONTINUATIONS
            .iter()
            .any(|next| rest.starts_with(next) || next.starts_with(rest));
    pending.then_some(head.start())
}

fn unclosed_glm_block(buf: &str) -> Option<usize> {
    let open = buf.rfind("<glm_block>")?;
    if buf[open..].contains("</glm_block>") {
        None
    } else {
        Some(open)
    }
}

fn partial_tag(buf: &str) -> Option<usize> {
    let open = buf.rfind('<')?;
    let tail = &buf[open..];
    (tail.len() <= MAX_PARTIAL_TAG && PARTIAL_TAG.is_match(tail)).then_some(open)
}

/// Start of the outermost unbalanced object, when it may still become an
/// embedded invocation or a result leak.
fn open_json(buf: &str) -> Option<usize> {
    let mut stack: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, byte) in buf.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => stack.push(i),
            b'}' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let start = *stack.first()?;
    let fragment = &buf[start..];
    let plausible = fragment.contains("\"name\"")
        || fragment.contains("\\\"name\\\"")
        || fragment.len() < SHORT_JSON_FRAGMENT;
    plausible.then_some(start)
}

// ============================================================================
// Stream Assembler
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenKind {
    Text,
    Thinking,
}

/// Incremental assembler for one streamed turn.
///
/// Feed upstream deltas through [`process_chunk`](Self::process_chunk) and
/// close the turn with [`finish`](Self::finish). At most one tool_use block
/// is emitted; once it is out, further text is collected and only its
/// cleaned remainder is emitted at the end.
pub struct ClaudeStreamAssembler {
    extractor: ToolCallExtractor,
    cleaner: PreambleCleaner,
    parser: ThinkingParser,
    message_id: String,
    started: bool,
    finished: bool,
    next_index: usize,
    open: Option<(usize, OpenKind)>,
    held: String,
    residual: String,
    tool: Option<(String, Encoding)>,
    thinking_call: Option<ToolCallRequest>,
    native: BTreeMap<usize, NativeCallDelta>,
    upstream_reason: Option<StopReason>,
    summary: TurnSummary,
}

impl ClaudeStreamAssembler {
    pub fn new(extractor: ToolCallExtractor) -> Self {
        Self {
            extractor,
            cleaner: PreambleCleaner::new(),
            parser: ThinkingParser::new(),
            message_id: generate_message_id(),
            started: false,
            finished: false,
            next_index: 0,
            open: None,
            held: String::new(),
            residual: String::new(),
            tool: None,
            thinking_call: None,
            native: BTreeMap::new(),
            upstream_reason: None,
            summary: TurnSummary::default(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Summary of the turn; complete once [`finish`](Self::finish) ran.
    pub fn summary(&self) -> &TurnSummary {
        &self.summary
    }

    /// Opening events. Emitted once; later calls return nothing.
    pub fn start(&mut self) -> Vec<StreamEvent> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        vec![
            StreamEvent::MessageStart {
                id: self.message_id.clone(),
            },
            StreamEvent::Ping,
        ]
    }

    /// Process one upstream delta.
    pub fn process_chunk(&mut self, chunk: &UpstreamMessage) -> Vec<StreamEvent> {
        let mut events = self.start();
        if self.finished {
            return events;
        }

        if let Some(reasoning) = chunk.reasoning.as_deref() {
            self.on_reasoning(reasoning, &mut events);
        }

        if let Some(content) = chunk.content.as_deref() {
            self.parser.feed_str(content);
            // Chunk boundary: surface plain text without breaking a partial tag.
            self.parser.flush_text();
            self.drain_parser(&mut events);
            self.release_text(false, &mut events);
        }

        for delta in &chunk.tool_calls {
            self.accumulate_native(delta);
        }

        if let Some(reason) = chunk.finish_reason.as_deref() {
            self.upstream_reason = Some(StopReason::from_finish_reason(reason));
        }

        events
    }

    /// Close the turn. Idempotent.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = self.start();
        if self.finished {
            return events;
        }
        self.finished = true;

        self.parser.finish();
        self.drain_parser(&mut events);
        self.release_text(true, &mut events);

        if self.tool.is_none() {
            let registry = self.extractor.registry();
            let fallback = self
                .native
                .values()
                .find_map(|native| native_call_request(native, registry))
                .or_else(|| self.thinking_call.take());
            if let Some(call) = fallback {
                self.emit_tool(call, &mut events);
            }
        }

        let residual = self.cleaner.clean(&std::mem::take(&mut self.residual));
        if !residual.is_empty() {
            self.close_open(&mut events);
            self.open_block(OpenKind::Text, &mut events);
            self.push_delta(BlockDelta::Text(residual), &mut events);
        }
        self.close_open(&mut events);

        let (stop_reason, downgraded) = self
            .upstream_reason
            .unwrap_or_default()
            .settle(self.tool.is_some());
        self.summary = TurnSummary {
            tool_name: self.tool.as_ref().map(|(name, _)| name.clone()),
            encoding: self.tool.as_ref().map(|(_, encoding)| *encoding),
            downgraded,
            stop_reason,
        };

        tracing::debug!(
            message_id = %self.message_id,
            tool = ?self.summary.tool_name,
            stop_reason = %stop_reason,
            downgraded = downgraded,
            "Stream assembly finished"
        );

        events.push(StreamEvent::MessageDelta { stop_reason });
        events.push(StreamEvent::MessageStop);
        events
    }

    fn drain_parser(&mut self, events: &mut Vec<StreamEvent>) {
        for event in self.parser.consume_events() {
            match event.kind {
                ThinkingKind::Text => self.held.push_str(&event.content),
                ThinkingKind::Thinking => {
                    // Text ahead of a completed span can no longer grow.
                    self.release_text(true, events);
                    self.on_thinking_span(&event.content, events);
                }
                ThinkingKind::End => {}
            }
        }
    }

    fn on_reasoning(&mut self, reasoning: &str, events: &mut Vec<StreamEvent>) {
        if self.tool.is_some() || reasoning.is_empty() {
            return;
        }
        if self.open_kind() != Some(OpenKind::Thinking) {
            if reasoning.trim().is_empty() {
                return;
            }
            self.close_open(events);
            self.open_block(OpenKind::Thinking, events);
        }
        self.push_delta(BlockDelta::Thinking(reasoning.to_string()), events);
    }

    fn on_thinking_span(&mut self, content: &str, events: &mut Vec<StreamEvent>) {
        if self.tool.is_some() {
            return;
        }
        let extraction = self.extractor.extract_from_thinking(content);
        if self.thinking_call.is_none() {
            self.thinking_call = extraction.call;
        }
        let cleaned = self.cleaner.clean_fragment(&extraction.text);
        let body = cleaned.trim();
        if body.is_empty() {
            return;
        }

        let delta = if self.open_kind() == Some(OpenKind::Thinking) {
            format!("\n\n{}", body)
        } else {
            self.close_open(events);
            self.open_block(OpenKind::Thinking, events);
            body.to_string()
        };
        self.push_delta(BlockDelta::Thinking(delta), events);
    }

    /// Emit whatever held text is resolved; everything when `force` is set.
    fn release_text(&mut self, force: bool, events: &mut Vec<StreamEvent>) {
        if self.held.is_empty() {
            return;
        }
        let upto = if force {
            self.held.len()
        } else {
            self.releasable(&self.held)
        };
        if upto == 0 {
            return;
        }
        let segment: String = self.held.drain(..upto).collect();
        self.emit_segment(&segment, events);
    }

    /// Length of the prefix of `buf` that can be released now.
    fn releasable(&self, buf: &str) -> usize {
        let ctx = self.extractor.context();
        let active = ctx.is_active();

        let (signal_hold, preamble_hold, kv_hold) = if active {
            let preamble = trailing_preamble(buf);
            let invocation = INVOCATION_MARKERS
                .iter()
                .filter_map(|marker| buf.find(marker))
                .chain(buf.find(ctx.signal.as_str()))
                .min();
            if let Some(start) = invocation {
                let tail = &buf[start..];
                return if INVOCATION_CLOSERS.iter().any(|closer| tail.contains(closer)) {
                    buf.len()
                } else {
                    preamble.map_or(start, |line| line.min(start))
                };
            }
            (
                partial_signal_suffix(buf, &ctx.signal),
                preamble,
                open_key_value(buf),
            )
        } else {
            (None, None, None)
        };
        [
            signal_hold,
            preamble_hold,
            kv_hold,
            unclosed_glm_block(buf),
            partial_tag(buf),
            open_json(buf),
        ]
        .into_iter()
        .flatten()
        .fold(buf.len(), usize::min)
    }

    fn emit_segment(&mut self, segment: &str, events: &mut Vec<StreamEvent>) {
        if self.tool.is_some() {
            self.residual.push_str(segment);
            return;
        }

        let extraction = self.extractor.extract(segment);
        let (before, after) = extraction.split_text();
        let (before, after) = match extraction.call {
            Some(_) => (self.cleaner.before_call(before), after.to_string()),
            None => (before.to_string(), String::new()),
        };

        let text = self.cleaner.clean_fragment(&before).into_owned();
        self.emit_text(&text, events);
        if let Some(call) = extraction.call {
            self.emit_tool(call, events);
            // Text past the invocation joins what arrives after the tool.
            self.residual.push_str(&after);
        }
    }

    fn emit_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        if self.open_kind() == Some(OpenKind::Text) {
            self.push_delta(BlockDelta::Text(text.to_string()), events);
            return;
        }
        // Whitespace alone never opens a block.
        let text = text.trim_start();
        if text.is_empty() {
            return;
        }
        self.close_open(events);
        self.open_block(OpenKind::Text, events);
        self.push_delta(BlockDelta::Text(text.to_string()), events);
    }

    fn emit_tool(&mut self, call: ToolCallRequest, events: &mut Vec<StreamEvent>) {
        self.close_open(events);

        let encoding = call.encoding;
        let block = ToolUseBlock::from_request(call);
        let index = self.next_index;
        self.next_index += 1;

        tracing::debug!(
            tool = %block.name,
            tool_use_id = %block.id,
            encoding = %encoding,
            "Emitting tool_use block"
        );

        events.push(StreamEvent::BlockStart {
            index,
            kind: BlockKind::ToolUse {
                id: block.id.clone(),
                name: block.name.clone(),
            },
        });
        events.push(StreamEvent::BlockDelta {
            index,
            delta: BlockDelta::InputJson(block.input.to_string()),
        });
        events.push(StreamEvent::BlockStop { index });

        self.tool = Some((block.name, encoding));
    }

    fn accumulate_native(&mut self, delta: &NativeCallDelta) {
        let entry = self
            .native
            .entry(delta.index)
            .or_insert_with(|| NativeCallDelta {
                index: delta.index,
                ..Default::default()
            });
        if delta.id.is_some() {
            entry.id = delta.id.clone();
        }
        if let Some(name) = delta.name.as_deref().filter(|n| !n.is_empty()) {
            entry.name = Some(name.to_string());
        }
        entry.arguments.push_str(&delta.arguments);
    }

    fn open_kind(&self) -> Option<OpenKind> {
        self.open.map(|(_, kind)| kind)
    }

    fn open_block(&mut self, kind: OpenKind, events: &mut Vec<StreamEvent>) {
        let index = self.next_index;
        self.next_index += 1;
        self.open = Some((index, kind));
        events.push(StreamEvent::BlockStart {
            index,
            kind: match kind {
                OpenKind::Text => BlockKind::Text,
                OpenKind::Thinking => BlockKind::Thinking,
            },
        });
    }

    fn push_delta(&mut self, delta: BlockDelta, events: &mut Vec<StreamEvent>) {
        if let Some((index, _)) = self.open {
            events.push(StreamEvent::BlockDelta { index, delta });
        }
    }

    fn close_open(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some((index, _)) = self.open.take() {
            events.push(StreamEvent::BlockStop { index });
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::unified::{ToolRegistry, TriggerContext};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    const TRIGGER: &str = "<<CALL_T>>";

    #[test]
    fn test_sse_parser_simple() {
        let mut parser = SseParser::new();
        let events = parser.parse(b"data: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, Some("hello".to_string()));
    }

    #[test]
    fn test_sse_parser_with_event() {
        let mut parser = SseParser::new();
        let events = parser.parse(b"event: message\ndata: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, Some("message".to_string()));
        assert_eq!(events[0].data, Some("hello".to_string()));
    }

    #[test]
    fn test_sse_parser_multiline_data() {
        let mut parser = SseParser::new();
        let events = parser.parse(b"data: line1\ndata: line2\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, Some("line1\nline2".to_string()));
    }

    #[test]
    fn test_sse_parser_partial() {
        let mut parser = SseParser::new();
        assert!(parser.parse(b"data: hel").is_empty());
        let events = parser.parse(b"lo\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, Some("hello".to_string()));
    }

    #[test]
    fn test_sse_parser_split_utf8() {
        let mut parser = SseParser::new();
        let bytes = "data: héllo\n\n".as_bytes();
        // Split inside the two-byte 'é'.
        assert!(parser.parse(&bytes[..8]).is_empty());
        let events = parser.parse(&bytes[8..]);
        assert_eq!(events[0].data, Some("héllo".to_string()));
    }

    #[test]
    fn test_sse_parser_crlf() {
        let mut parser = SseParser::new();
        let events = parser.parse(b"data: a\r\n\r\ndata: b\r\n\r\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data, Some("b".to_string()));
    }

    #[test]
    fn test_sse_parser_comment() {
        let mut parser = SseParser::new();
        let events = parser.parse(b": keep-alive\ndata: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, Some("hello".to_string()));
    }

    #[test]
    fn test_format_sse_event() {
        let output = format_sse_event(Some("message"), "hello");
        assert_eq!(output, "event: message\ndata: hello\n\n");
        assert_eq!(format_sse_data("hello"), "data: hello\n\n");
        assert_eq!(format_sse_done(), "data: [DONE]\n\n");
    }

    // ------------------------------------------------------------------------
    // Assembler
    // ------------------------------------------------------------------------

    fn assembler(enabled: bool) -> ClaudeStreamAssembler {
        ClaudeStreamAssembler::new(ToolCallExtractor::new(
            TriggerContext::new(TRIGGER, enabled),
            ToolRegistry::new(["Read", "TodoWrite", "Bash"]),
        ))
    }

    fn text_chunk(content: &str) -> UpstreamMessage {
        UpstreamMessage {
            content: Some(content.to_string()),
            ..Default::default()
        }
    }

    fn run(assembler: &mut ClaudeStreamAssembler, chunks: &[UpstreamMessage]) -> Vec<StreamEvent> {
        let mut events = assembler.start();
        for chunk in chunks {
            events.extend(assembler.process_chunk(chunk));
        }
        events.extend(assembler.finish());
        events
    }

    fn streamed_text(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::BlockDelta {
                    delta: BlockDelta::Text(text),
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn tool_inputs(events: &[StreamEvent]) -> Vec<Value> {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::BlockDelta {
                    delta: BlockDelta::InputJson(json),
                    ..
                } => serde_json::from_str(json).ok(),
                _ => None,
            })
            .collect()
    }

    fn final_stop_reason(events: &[StreamEvent]) -> Option<StopReason> {
        events.iter().find_map(|event| match event {
            StreamEvent::MessageDelta { stop_reason } => Some(*stop_reason),
            _ => None,
        })
    }

    /// Every opened block is closed, indices are sequential and nothing
    /// follows message_stop.
    fn assert_well_formed(events: &[StreamEvent]) {
        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert_eq!(events[1], StreamEvent::Ping);
        assert_eq!(events.last(), Some(&StreamEvent::MessageStop));

        let mut open: Option<usize> = None;
        let mut next = 0;
        for event in events {
            match event {
                StreamEvent::BlockStart { index, .. } => {
                    assert_eq!(open, None, "block opened while another is open");
                    assert_eq!(*index, next);
                    open = Some(*index);
                    next += 1;
                }
                StreamEvent::BlockDelta { index, .. } => assert_eq!(open, Some(*index)),
                StreamEvent::BlockStop { index } => {
                    assert_eq!(open, Some(*index));
                    open = None;
                }
                _ => {}
            }
        }
        assert_eq!(open, None);
    }

    #[test]
    fn test_plain_text_stream() {
        let mut asm = assembler(true);
        let events = run(&mut asm, &[text_chunk("Hello"), text_chunk(", world")]);
        assert_well_formed(&events);
        assert_eq!(streamed_text(&events), "Hello, world");
        assert_eq!(final_stop_reason(&events), Some(StopReason::EndTurn));
    }

    #[test]
    fn test_thinking_tag_split_across_chunks() {
        let mut asm = assembler(true);
        let events = run(
            &mut asm,
            &[text_chunk("<thi"), text_chunk("nk>plan</th"), text_chunk("ink>Answer")],
        );
        assert_well_formed(&events);
        assert_eq!(
            events[2..8],
            [
                StreamEvent::BlockStart {
                    index: 0,
                    kind: BlockKind::Thinking
                },
                StreamEvent::BlockDelta {
                    index: 0,
                    delta: BlockDelta::Thinking("plan".to_string())
                },
                StreamEvent::BlockStop { index: 0 },
                StreamEvent::BlockStart {
                    index: 1,
                    kind: BlockKind::Text
                },
                StreamEvent::BlockDelta {
                    index: 1,
                    delta: BlockDelta::Text("Answer".to_string())
                },
                StreamEvent::BlockStop { index: 1 },
            ]
        );
    }

    #[test]
    fn test_todo_write_char_by_char() {
        let content = r#"<<CALL_T>><invoke name="TodoWrite"><parameter name="todos">[{"content":"a","state":"pending"}]</parameter></invoke>"#;
        let chunks: Vec<_> = content.chars().map(|c| text_chunk(&c.to_string())).collect();
        let mut asm = assembler(true);
        let events = run(&mut asm, &chunks);

        assert_well_formed(&events);
        assert_eq!(streamed_text(&events), "");
        let inputs = tool_inputs(&events);
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0]["todos"][0]["status"], "pending");
        assert_eq!(inputs[0]["todos"][0]["activeForm"], "a");
        assert_eq!(final_stop_reason(&events), Some(StopReason::ToolUse));
        assert_eq!(asm.summary().tool_name.as_deref(), Some("TodoWrite"));
    }

    #[test]
    fn test_preamble_released_before_trigger() {
        let mut asm = assembler(true);
        let events = run(
            &mut asm,
            &[
                text_chunk("Checking <<CA"),
                text_chunk("LL_T>><invoke name=\"Read\"><parameter name=\"file_path\">/a"),
                text_chunk("</parameter></invoke>"),
            ],
        );
        assert_well_formed(&events);
        assert_eq!(streamed_text(&events), "Checking ");
        assert_eq!(tool_inputs(&events), vec![json!({"file_path": "/a"})]);
    }

    #[test]
    fn test_key_value_call_split_inside_value() {
        let mut asm = assembler(true);
        let events = run(
            &mut asm,
            &[
                text_chunk(r#"name="Read<arg_key>file_path</arg_key><arg_value>/ab"#),
                text_chunk("c/def.txt</arg_value>"),
            ],
        );
        assert_well_formed(&events);
        assert_eq!(streamed_text(&events), "");
        assert_eq!(tool_inputs(&events), vec![json!({"file_path": "/abc/def.txt"})]);
        assert_eq!(asm.summary().encoding, Some(Encoding::KeyValueXml));
    }

    #[test]
    fn test_key_value_call_waits_for_next_key() {
        let mut asm = assembler(true);
        let mut events = asm.start();
        for chunk in [
            "Editing. name=\"Re",
            "ad<arg_key>file_path</arg_key><arg_value>/a</arg_value>",
            "<arg_key>limit</arg_key><arg_value>5</arg_value>",
        ] {
            events.extend(asm.process_chunk(&text_chunk(chunk)));
        }
        assert_eq!(streamed_text(&events), "Editing. ");
        assert!(tool_inputs(&events).is_empty());

        events.extend(asm.process_chunk(&text_chunk("\nDone.")));
        assert_eq!(
            tool_inputs(&events),
            vec![json!({"file_path": "/a", "limit": 5})]
        );
        events.extend(asm.finish());
        assert_well_formed(&events);
        assert_eq!(streamed_text(&events), "Editing. Done.");
    }

    #[test]
    fn test_colon_preamble_dropped_before_call() {
        let content = "I'll read the file:\n<<CALL_T>>\n<invoke name=\"Read\"><parameter name=\"file_path\">/a</parameter></invoke>";
        let mut asm = assembler(true);
        let events = run(
            &mut asm,
            &[
                text_chunk("I'll read the file:\n"),
                text_chunk("<<CALL_T>>\n<invoke name=\"Read\">"),
                text_chunk("<parameter name=\"file_path\">/a</parameter></invoke>"),
            ],
        );
        assert_well_formed(&events);
        assert_eq!(streamed_text(&events), "");
        assert_eq!(tool_inputs(&events), vec![json!({"file_path": "/a"})]);

        let turn = crate::transformer::assembler::ResponseAssembler::new(ToolCallExtractor::new(
            TriggerContext::new(TRIGGER, true),
            ToolRegistry::new(["Read", "TodoWrite", "Bash"]),
        ))
        .assemble(&UpstreamMessage {
            content: Some(content.to_string()),
            finish_reason: Some("stop".to_string()),
            ..Default::default()
        });
        assert!(turn
            .blocks
            .iter()
            .all(|block| !matches!(block, crate::transformer::unified::ContentBlock::Text(_))));
    }

    #[test]
    fn test_colon_line_released_when_prose_follows() {
        let mut asm = assembler(true);
        let mut events = asm.start();
        events.extend(asm.process_chunk(&text_chunk("Steps:\n")));
        assert_eq!(streamed_text(&events), "");

        events.extend(asm.process_chunk(&text_chunk("1. build")));
        assert_eq!(streamed_text(&events), "Steps:\n1. build");
        events.extend(asm.finish());
        assert_well_formed(&events);
    }

    #[test]
    fn test_embedded_json_split_across_chunks() {
        let mut asm = assembler(true);
        let events = run(
            &mut asm,
            &[
                text_chunk(r#"Sure. {"name": "Re"#),
                text_chunk(r#"ad", "arguments": {"file_path": "/a"}}"#),
            ],
        );
        assert_well_formed(&events);
        assert_eq!(streamed_text(&events), "Sure. ");
        assert_eq!(asm.summary().encoding, Some(Encoding::EmbeddedJson));
    }

    #[test]
    fn test_glm_result_block_split_across_chunks() {
        let mut asm = assembler(true);
        let events = run(
            &mut asm,
            &[
                text_chunk("Hi <glm_bl"),
                text_chunk(r#"ock>{"name":"Read","is_error":true,"result":"failed","status":"error"}</glm_block> bye"#),
            ],
        );
        assert_well_formed(&events);
        assert_eq!(streamed_text(&events), "Hi  bye");
        assert!(tool_inputs(&events).is_empty());
    }

    #[test]
    fn test_reasoning_deltas_share_one_block() {
        let mut asm = assembler(true);
        let events = run(
            &mut asm,
            &[
                UpstreamMessage {
                    reasoning: Some("Let me ".to_string()),
                    ..Default::default()
                },
                UpstreamMessage {
                    reasoning: Some("think.".to_string()),
                    ..Default::default()
                },
                text_chunk("Answer"),
            ],
        );
        assert_well_formed(&events);
        let thinking_blocks = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    StreamEvent::BlockStart {
                        kind: BlockKind::Thinking,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(thinking_blocks, 1);
        assert_eq!(streamed_text(&events), "Answer");
    }

    #[test]
    fn test_native_tool_call_deltas() {
        let mut asm = assembler(false);
        let delta = |id: Option<&str>, name: Option<&str>, arguments: &str| UpstreamMessage {
            tool_calls: vec![NativeCallDelta {
                index: 0,
                id: id.map(str::to_string),
                name: name.map(str::to_string),
                arguments: arguments.to_string(),
            }],
            ..Default::default()
        };
        let mut last = delta(None, None, r#": "/a"}"#);
        last.finish_reason = Some("tool_calls".to_string());

        let events = run(
            &mut asm,
            &[
                delta(Some("call_1"), Some("Read"), ""),
                delta(None, None, r#"{"file_path""#),
                last,
            ],
        );
        assert_well_formed(&events);
        assert_eq!(tool_inputs(&events), vec![json!({"file_path": "/a"})]);
        assert_eq!(final_stop_reason(&events), Some(StopReason::ToolUse));
        assert_eq!(asm.summary().encoding, Some(Encoding::Native));
    }

    #[test]
    fn test_tool_signal_without_call_downgrades() {
        let mut asm = assembler(false);
        let mut chunk = text_chunk("Nothing to run.");
        chunk.finish_reason = Some("tool_calls".to_string());
        let events = run(&mut asm, &[chunk]);
        assert_well_formed(&events);
        assert_eq!(final_stop_reason(&events), Some(StopReason::EndTurn));
        assert!(asm.summary().downgraded);
    }

    #[test]
    fn test_text_after_tool_is_cleaned_residual() {
        let mut asm = assembler(true);
        let events = run(
            &mut asm,
            &[
                text_chunk(r#"<<CALL_T>><invoke name="Read"><parameter name="file_path">/a</parameter></invoke>"#),
                text_chunk("\n</function_calls>\nAll set."),
            ],
        );
        assert_well_formed(&events);
        assert_eq!(streamed_text(&events), "All set.");
        assert_eq!(tool_inputs(&events).len(), 1);
        assert!(matches!(
            events[2],
            StreamEvent::BlockStart {
                index: 0,
                kind: BlockKind::ToolUse { .. }
            }
        ));
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut asm = assembler(true);
        let _ = run(&mut asm, &[text_chunk("hi")]);
        assert!(asm.is_finished());
        assert!(asm.finish().is_empty());
        assert!(asm.process_chunk(&text_chunk("late")).is_empty());
    }
}
