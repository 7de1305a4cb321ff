//! Candidate matchers, one per textual invocation encoding.
//!
//! Each matcher looks at a single candidate span and reports the first
//! invocation it recognizes together with the byte range it occupied, so
//! the caller can cut the markup out of the residual text.

use super::super::json_repair::repair_json;
use super::super::result_filter::{classify, Classification, GLM_BLOCK_CLOSE, GLM_BLOCK_OPEN};
use super::super::unified::{Encoding, ToolRegistry};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::ops::Range;

// ============================================================================
// Matcher Trait
// ============================================================================

/// An invocation recognized inside a candidate span.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedCall {
    pub name: String,
    pub args: Map<String, Value>,
    /// Bytes of the span the invocation markup occupied.
    pub range: Range<usize>,
}

/// One recognizer in the ordered matcher list.
///
/// New malformation patterns get a new matcher; existing ones stay put.
pub trait CandidateMatcher: Send + Sync {
    /// Encoding this matcher recognizes.
    fn encoding(&self) -> Encoding;

    /// First invocation in `span`, if any.
    fn find(&self, span: &str, registry: &ToolRegistry) -> Option<MatchedCall>;

    /// Matcher name for logging.
    fn name(&self) -> &'static str {
        self.encoding().as_str()
    }
}

/// The four textual encodings in the order they are tried.
pub fn default_matchers() -> Vec<Box<dyn CandidateMatcher>> {
    vec![
        Box::new(CanonicalXmlMatcher),
        Box::new(MalformedXmlMatcher),
        Box::new(KeyValueXmlMatcher),
        Box::new(EmbeddedJsonMatcher),
    ]
}

lazy_static! {
    static ref INVOKE_OPEN: Regex =
        Regex::new(r#"<invoke\s+name\s*=\s*"([^"<>]+)"\s*>"#).unwrap();
    static ref PARAMETER: Regex =
        Regex::new(r#"(?s)<parameter\s+name\s*=\s*"([^"<>]+)"\s*>(.*?)</parameter>"#).unwrap();
    static ref PARAMETER_OPEN: Regex =
        Regex::new(r#"<parameter\s+name\s*=\s*"([^"<>]+)"\s*>"#).unwrap();
    static ref FUNCTION_CALLS_LEAD: Regex = Regex::new(r"<function_calls>\s*$").unwrap();
    static ref TRAILING_CLOSERS: Regex =
        Regex::new(r"^(?:\s*</(?:parameter|invoke|function_calls)>)*").unwrap();

    static ref MALFORMED_INVOKE: Regex =
        Regex::new(r#"(?:<>\s*)?<?invokename\s*=\s*"?([^"<>\s]+)"?\s*>?"#).unwrap();
    static ref MALFORMED_PARAMETER: Regex =
        Regex::new(r#"<?parametername\s*=\s*"?([^"<>\s]+)"?\s*>?"#).unwrap();
    static ref MALFORMED_CLOSER: Regex =
        Regex::new(r"</(?:parameter|invoke|function_calls)>").unwrap();

    static ref KV_HEAD: Regex = Regex::new(
        r#"(?:<tool_call>\s*|(?:<invoke\s+)?name\s*=\s*"?)([A-Za-z_][\w\-\.]*)\s*<arg_key>"#
    )
    .unwrap();
    static ref KV_KEY: Regex =
        Regex::new(r"(?s)^\s*<arg_key>(.*?)</arg_key>\s*<arg_value>").unwrap();
    static ref KV_TAIL: Regex =
        Regex::new(r#"^\s*(?:"\s*>)?\s*(?:</tool_call>|</invoke>)?"#).unwrap();

    static ref NAME_KEY: Regex =
        Regex::new(r#"(\\*)"name\\*"\s*:\s*\\*"([^"\\]+)\\*""#).unwrap();
}

/// Registered spelling for `name`, or the name as written.
fn resolve_name(name: &str, registry: &ToolRegistry) -> Option<String> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(registry.resolve(name).unwrap_or(name).to_string())
}

/// Interpret a textual parameter value.
///
/// Valid JSON is taken as-is; bracketed text that fails to parse goes
/// through the repair engine; anything else stays a string.
pub fn parse_parameter_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value;
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Some(value) = repair_json(trimmed) {
            return value;
        }
    }
    Value::String(trimmed.to_string())
}

// ============================================================================
// Canonical XML
// ============================================================================

/// `<invoke name="T"><parameter name="K">V</parameter></invoke>`
///
/// A missing `</invoke>` (truncated turn) is tolerated; the invocation then
/// runs to the end of the span and a trailing unterminated parameter keeps
/// whatever value it has.
#[derive(Debug, Default, Clone, Copy)]
pub struct CanonicalXmlMatcher;

impl CandidateMatcher for CanonicalXmlMatcher {
    fn encoding(&self) -> Encoding {
        Encoding::CanonicalXml
    }

    fn find(&self, span: &str, registry: &ToolRegistry) -> Option<MatchedCall> {
        let caps = INVOKE_OPEN.captures(span)?;
        let open = caps.get(0)?;
        let name = resolve_name(&caps[1], registry)?;

        let body_start = open.end();
        let (body_end, mut end) = match span[body_start..].find("</invoke>") {
            Some(close) => (body_start + close, body_start + close + "</invoke>".len()),
            None => (span.len(), span.len()),
        };
        let body = &span[body_start..body_end];

        let mut args = Map::new();
        let mut consumed = 0;
        for param in PARAMETER.captures_iter(body) {
            args.insert(param[1].trim().to_string(), parse_parameter_value(&param[2]));
            if let Some(whole) = param.get(0) {
                consumed = whole.end();
            }
        }
        if let Some(tail) = PARAMETER_OPEN.captures(&body[consumed..]) {
            if let Some(whole) = tail.get(0) {
                let value = &body[consumed + whole.end()..];
                args.entry(tail[1].trim().to_string())
                    .or_insert_with(|| parse_parameter_value(value));
            }
        }

        if let Some(closers) = TRAILING_CLOSERS.find(&span[end..]) {
            end += closers.end();
        }
        let start = FUNCTION_CALLS_LEAD
            .find(&span[..open.start()])
            .map(|lead| lead.start())
            .unwrap_or(open.start());

        Some(MatchedCall {
            name,
            args,
            range: start..end,
        })
    }
}

// ============================================================================
// Malformed XML
// ============================================================================

/// `<><invokename="T"><parametername="K">V` with no closers.
///
/// Matched on the literal `invokename=` / `parametername=` markers; each
/// value runs until the next marker, a closer, or the end of the span.
#[derive(Debug, Default, Clone, Copy)]
pub struct MalformedXmlMatcher;

impl CandidateMatcher for MalformedXmlMatcher {
    fn encoding(&self) -> Encoding {
        Encoding::MalformedXml
    }

    fn find(&self, span: &str, registry: &ToolRegistry) -> Option<MatchedCall> {
        let caps = MALFORMED_INVOKE.captures(span)?;
        let head = caps.get(0)?;
        let name = resolve_name(&caps[1], registry)?;

        let markers: Vec<_> = MALFORMED_PARAMETER
            .captures_iter(&span[head.end()..])
            .filter_map(|param| {
                let whole = param.get(0)?;
                Some((
                    head.end() + whole.start(),
                    head.end() + whole.end(),
                    param[1].to_string(),
                ))
            })
            .collect();

        let mut args = Map::new();
        let mut end = head.end();
        for (i, (_, value_start, key)) in markers.iter().enumerate() {
            let region_end = markers
                .get(i + 1)
                .map(|(next_start, _, _)| *next_start)
                .unwrap_or(span.len());
            let region = &span[*value_start..region_end];
            let value_end = MALFORMED_CLOSER
                .find(region)
                .map(|closer| value_start + closer.start())
                .unwrap_or(region_end);

            args.insert(
                key.clone(),
                parse_parameter_value(&span[*value_start..value_end]),
            );
            end = value_end;
        }

        if let Some(closers) = TRAILING_CLOSERS.find(&span[end..]) {
            end += closers.end();
        }

        Some(MatchedCall {
            name,
            args,
            range: head.start()..end,
        })
    }
}

// ============================================================================
// Key/Value XML
// ============================================================================

/// `name="T<arg_key>K</arg_key><arg_value>V</arg_value>...`
///
/// Also accepts the `<tool_call>T<arg_key>...</tool_call>` form the same
/// backends produce.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyValueXmlMatcher;

impl CandidateMatcher for KeyValueXmlMatcher {
    fn encoding(&self) -> Encoding {
        Encoding::KeyValueXml
    }

    fn find(&self, span: &str, registry: &ToolRegistry) -> Option<MatchedCall> {
        let caps = KV_HEAD.captures(span)?;
        let head = caps.get(0)?;
        let name = resolve_name(&caps[1], registry)?;

        let mut args = Map::new();
        let mut cursor = head.end() - "<arg_key>".len();
        while let Some(key_caps) = KV_KEY.captures(&span[cursor..]) {
            let Some(whole) = key_caps.get(0) else { break };
            let key = key_caps[1].trim().to_string();
            let value_start = cursor + whole.end();
            let rest = &span[value_start..];

            let (value_end, next) = match rest.find("</arg_value>") {
                Some(close) => (value_start + close, value_start + close + "</arg_value>".len()),
                None => {
                    let stop = ["<arg_key>", "</tool_call>"]
                        .iter()
                        .filter_map(|marker| rest.find(marker))
                        .min()
                        .map(|offset| value_start + offset)
                        .unwrap_or(span.len());
                    (stop, stop)
                }
            };

            args.insert(key, parse_parameter_value(&span[value_start..value_end]));
            cursor = next;
        }

        let end = KV_TAIL
            .find(&span[cursor..])
            .map(|tail| cursor + tail.end())
            .unwrap_or(cursor);

        Some(MatchedCall {
            name,
            args,
            range: head.start()..end,
        })
    }
}

// ============================================================================
// Embedded JSON
// ============================================================================

/// `{"name": "T", "arguments": {...}}` anywhere in the text.
///
/// The object may be escaped once or twice. Only known tool names are
/// considered, spans inside GLM result blocks are skipped, and every
/// candidate is gated by the result filter.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedJsonMatcher;

impl CandidateMatcher for EmbeddedJsonMatcher {
    fn encoding(&self) -> Encoding {
        Encoding::EmbeddedJson
    }

    fn find(&self, span: &str, registry: &ToolRegistry) -> Option<MatchedCall> {
        let excluded = glm_spans(span);

        for caps in NAME_KEY.captures_iter(span) {
            let Some(key) = caps.get(0) else { continue };
            if excluded.iter().any(|glm| glm.contains(&key.start())) {
                continue;
            }
            let Some(name) = registry.resolve(&caps[2]) else {
                continue;
            };

            let level = (caps[1].len() + 1) / 2;
            let Some(start) = enclosing_brace(&span[..key.start()], level == 0) else {
                continue;
            };
            let end = closing_brace(span, start, level == 0);

            let Some(Value::Object(payload)) = repair_json(&unescape(&span[start..end], level))
            else {
                continue;
            };

            match classify(&payload) {
                Classification::Request => {}
                verdict => {
                    tracing::debug!(
                        tool = %name,
                        verdict = ?verdict,
                        "Embedded JSON candidate rejected by result filter"
                    );
                    continue;
                }
            }

            let Some(args) = json_arguments(&payload) else {
                continue;
            };

            return Some(MatchedCall {
                name: name.to_string(),
                args,
                range: start..end,
            });
        }
        None
    }
}

/// Byte ranges covered by GLM result blocks, open-ended when unterminated.
fn glm_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut from = 0;
    while let Some(open) = text[from..].find(GLM_BLOCK_OPEN) {
        let start = from + open;
        let body = start + GLM_BLOCK_OPEN.len();
        let end = text[body..]
            .find(GLM_BLOCK_CLOSE)
            .map(|close| body + close + GLM_BLOCK_CLOSE.len())
            .unwrap_or(text.len());
        spans.push(start..end);
        from = end;
    }
    spans
}

/// Offset of the unmatched `{` that encloses the end of `prefix`.
///
/// Braces inside string values are skipped when `string_aware`. A prefix
/// that ends inside a string (stray quotes in prose) is rescanned without.
fn enclosing_brace(prefix: &str, string_aware: bool) -> Option<usize> {
    let mut open: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, byte) in prefix.bytes().enumerate() {
        if string_aware && in_string {
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
            b'"' if string_aware => in_string = true,
            b'{' => open.push(i),
            b'}' => {
                open.pop();
            }
            _ => {}
        }
    }
    if in_string {
        return enclosing_brace(prefix, false);
    }
    open.pop()
}

/// End offset (exclusive) of the object opened at `start`, or the end of
/// `text` when it never closes.
fn closing_brace(text: &str, start: usize, string_aware: bool) -> usize {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, byte) in text.bytes().enumerate().skip(start) {
        if string_aware && in_string {
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
            b'"' if string_aware => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i + 1;
                }
            }
            _ => {}
        }
    }
    text.len()
}

/// Peel `level` layers of JSON string escaping.
fn unescape(raw: &str, level: usize) -> String {
    let mut current = raw.to_string();
    for _ in 0..level {
        current = match serde_json::from_str::<String>(&format!("\"{}\"", current)) {
            Ok(unescaped) => unescaped,
            Err(_) => current.replace("\\\"", "\"").replace("\\\\", "\\"),
        };
    }
    current
}

/// Arguments of an embedded invocation object.
///
/// Looks for the usual argument containers first; a string container is
/// parsed as JSON. Without one, the remaining keys are the arguments.
fn json_arguments(payload: &Map<String, Value>) -> Option<Map<String, Value>> {
    for key in ["arguments", "input", "parameters", "args"] {
        let Some(value) = payload.get(key) else {
            continue;
        };
        return match value {
            Value::Object(args) => Some(args.clone()),
            Value::Null => Some(Map::new()),
            Value::String(raw) if raw.trim().is_empty() => Some(Map::new()),
            Value::String(raw) => match repair_json(raw) {
                Some(Value::Object(args)) => Some(args),
                _ => None,
            },
            _ => None,
        };
    }

    Some(
        payload
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "name" | "type" | "id"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    )
}
