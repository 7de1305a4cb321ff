//! Display-text cleanup.
//!
//! Removes what must never reach the client: invocation markup, trigger
//! residue, GLM result blocks, leaked result JSON, empty code fences and the
//! dangling "I'll do X:" preamble left behind once an invocation is cut out.

use super::result_filter::{classify, Classification};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;

/// Passes to run before giving up on reaching a fixed point.
const MAX_PASSES: usize = 8;

/// Longest line still treated as a preamble.
const MAX_PREAMBLE_LEN: usize = 160;

lazy_static! {
    static ref MARKUP_BLOCKS: Vec<Regex> = [
        r"(?s)<function_calls>.*?</function_calls>",
        r"(?s)<invoke\b[^>]*>.*?</invoke>",
        r"(?s)<parameter\b[^>]*>.*?</parameter>",
        r"(?s)<arg_key>.*?</arg_key>",
        r"(?s)<arg_value>.*?</arg_value>",
        r"(?s)<glm_block>.*?</glm_block>",
        r"(?s)<tool_call>.*?</tool_call>",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect();
    static ref STRAY_TAGS: Regex = Regex::new(
        r"</?(?:function_calls|invoke|parameter|arg_key|arg_value|glm_block|tool_call)\b[^>]*>"
    )
    .unwrap();
    static ref MALFORMED_MARKERS: Regex =
        Regex::new(r#"<>|<?(?:invoke|parameter)name\s*=\s*"?[^"<>\s]*"?\s*>?"#).unwrap();
    static ref TRIGGER_RESIDUE: Regex = Regex::new(r"<<[A-Za-z]+_[A-Za-z0-9]+>>").unwrap();
    static ref EMPTY_FENCE: Regex =
        Regex::new(r"(?m)^[ \t]*```[A-Za-z0-9_-]*[ \t]*\n\s*```[ \t]*$\n?").unwrap();
    static ref EXCESS_NEWLINES: Regex = Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").unwrap();
}

/// Stateless cleaner for display text.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreambleCleaner;

impl PreambleCleaner {
    pub fn new() -> Self {
        Self
    }

    /// Full cleanup of a complete text segment. Idempotent.
    pub fn clean(&self, text: &str) -> String {
        let mut current = text.to_string();
        for _ in 0..MAX_PASSES {
            let next = self.clean_once(&current);
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    /// Markup and leak removal only; whitespace and preambles are kept so
    /// streamed fragments can be concatenated.
    pub fn clean_fragment<'a>(&self, text: &'a str) -> Cow<'a, str> {
        if !might_need_cleaning(text) {
            return Cow::Borrowed(text);
        }
        let stripped = strip_leaked_json(&strip_markup(text));
        if stripped == text {
            Cow::Borrowed(text)
        } else {
            Cow::Owned(stripped)
        }
    }

    /// Text ahead of a cut-out invocation, minus the lines announcing it.
    pub fn before_call(&self, text: &str) -> String {
        let kept = strip_trailing_preamble(text);
        if kept.len() == text.trim_end().len() {
            text.to_string()
        } else if kept.is_empty() {
            String::new()
        } else {
            format!("{}\n", kept)
        }
    }

    fn clean_once(&self, text: &str) -> String {
        let stripped = strip_leaked_json(&strip_markup(text));
        let unfenced = EMPTY_FENCE.replace_all(&stripped, "");
        let without_preamble = strip_trailing_preamble(&unfenced);
        EXCESS_NEWLINES
            .replace_all(without_preamble, "\n\n")
            .trim()
            .to_string()
    }
}

fn might_need_cleaning(text: &str) -> bool {
    text.contains('<') || text.contains('{')
}

fn strip_markup(text: &str) -> String {
    let mut out = text.to_string();
    let patterns = MARKUP_BLOCKS
        .iter()
        .chain([&*STRAY_TAGS, &*MALFORMED_MARKERS, &*TRIGGER_RESIDUE]);
    for pattern in patterns {
        if pattern.is_match(&out) {
            out = pattern.replace_all(&out, "").into_owned();
        }
    }
    out
}

/// Remove complete JSON objects that look like echoed tool results.
///
/// An object qualifies when it carries a string `name` and at least one
/// result indicator, strong or weak.
fn strip_leaked_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find('{') {
        let start = cursor + offset;
        out.push_str(&text[cursor..start]);

        match object_end(text, start) {
            Some(end) if is_result_leak(&text[start..end]) => {
                tracing::debug!(len = end - start, "Cleaner removed leaked result JSON");
                cursor = end;
            }
            _ => {
                out.push('{');
                cursor = start + 1;
            }
        }
    }

    out.push_str(&text[cursor..]);
    out
}

fn is_result_leak(candidate: &str) -> bool {
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(payload)) => {
            payload.get("name").map(Value::is_string).unwrap_or(false)
                && classify(&payload) != Classification::Request
        }
        _ => false,
    }
}

/// End offset (exclusive) of the balanced object opened at `start`.
fn object_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, byte) in text.bytes().enumerate().skip(start) {
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
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Drop trailing lines that only announce what comes next.
fn strip_trailing_preamble(text: &str) -> &str {
    let mut current = text.trim_end();
    loop {
        let line_start = current.rfind('\n').map(|i| i + 1).unwrap_or(0);
        let line = current[line_start..].trim();
        if line.is_empty() || !is_preamble_line(line) {
            return current;
        }
        current = current[..line_start].trim_end();
    }
}

pub(crate) fn is_preamble_line(line: &str) -> bool {
    (line.ends_with(':') || line.ends_with('：'))
        && line.chars().count() <= MAX_PREAMBLE_LEN
        && !line.starts_with('#')
        && !line.starts_with("```")
}
