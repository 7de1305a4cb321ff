//! Tool-result vs. tool-request disambiguation.
//!
//! Classification is a tiered rule table:
//!
//! | key              | tier   | fires when                                   |
//! |------------------|--------|----------------------------------------------|
//! | `is_error`       | strong | present                                      |
//! | `status`         | strong | `completed` / `error`, or a truncated prefix |
//! | `result`         | strong | non-empty                                    |
//! | `display_result` | weak   | present                                      |
//! | `duration`       | weak   | present                                      |
//! | `mcp_server`     | weak   | present                                      |
//!
//! Any strong hit makes the payload a result. Weak hits alone leave it
//! ambiguous: it is neither extracted nor removed here.

use super::json_repair::repair_json;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::borrow::Cow;

pub const GLM_BLOCK_OPEN: &str = "<glm_block>";
pub const GLM_BLOCK_CLOSE: &str = "</glm_block>";

/// Strength of a single result indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Strong,
    Weak,
}

/// Outcome of classifying a candidate payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Safe to extract as a tool invocation.
    Request,
    /// An echoed execution result; never extracted.
    Result,
    /// Only weak indicators; left for the cleaner.
    Ambiguous,
}

struct IndicatorRule {
    key: &'static str,
    tier: Tier,
    fires: fn(&Value) -> bool,
}

const RULES: &[IndicatorRule] = &[
    IndicatorRule {
        key: "is_error",
        tier: Tier::Strong,
        fires: is_present,
    },
    IndicatorRule {
        key: "status",
        tier: Tier::Strong,
        fires: is_terminal_status,
    },
    IndicatorRule {
        key: "result",
        tier: Tier::Strong,
        fires: is_non_empty,
    },
    IndicatorRule {
        key: "display_result",
        tier: Tier::Weak,
        fires: is_present,
    },
    IndicatorRule {
        key: "duration",
        tier: Tier::Weak,
        fires: is_present,
    },
    IndicatorRule {
        key: "mcp_server",
        tier: Tier::Weak,
        fires: is_present,
    },
];

lazy_static! {
    static ref RAW_IS_ERROR: Regex = Regex::new(r#""is_error"\s*:"#).unwrap();
    static ref RAW_STATUS: Regex = Regex::new(r#""status"\s*:\s*"([A-Za-z_]*)"#).unwrap();
    static ref RAW_RESULT: Regex =
        Regex::new(r#""result"\s*:\s*(?:"[^"]|[\[\{]\s*[^\]\}\s]|[0-9tf])"#).unwrap();
    static ref RAW_WEAK: Regex =
        Regex::new(r#""(?:display_result|duration|mcp_server)"\s*:"#).unwrap();
    static ref GLM_BLOCK: Regex = Regex::new(r"(?s)<glm_block>(.*?)</glm_block>").unwrap();
    static ref QUOTED_KEY: Regex = Regex::new(r#""[A-Za-z_][\w\-]*"\s*:"#).unwrap();
}

fn is_present(_: &Value) -> bool {
    true
}

fn is_terminal_status(value: &Value) -> bool {
    value.as_str().map(status_is_terminal).unwrap_or(false)
}

/// `completed` or `error`, or a truncated prefix of either (two chars minimum).
pub fn status_is_terminal(status: &str) -> bool {
    let status = status.trim().to_ascii_lowercase();
    if status == "completed" || status == "error" {
        return true;
    }
    status.len() >= 2 && ("completed".starts_with(&status) || "error".starts_with(&status))
}

fn is_non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

/// Indicators that fire on `payload`, in rule-table order.
pub fn indicators(payload: &Map<String, Value>) -> Vec<(&'static str, Tier)> {
    RULES
        .iter()
        .filter(|rule| payload.get(rule.key).map(rule.fires).unwrap_or(false))
        .map(|rule| (rule.key, rule.tier))
        .collect()
}

/// Classify a parsed candidate object.
pub fn classify(payload: &Map<String, Value>) -> Classification {
    let hits = indicators(payload);
    if hits.iter().any(|(_, tier)| *tier == Tier::Strong) {
        Classification::Result
    } else if !hits.is_empty() {
        Classification::Ambiguous
    } else {
        Classification::Request
    }
}

/// Classify raw, possibly truncated, text.
///
/// Falls back to scanning for indicator keys when the fragment cannot be
/// repaired into an object.
pub fn classify_fragment(fragment: &str) -> Classification {
    if let Some(Value::Object(payload)) = repair_json(fragment) {
        return classify(&payload);
    }

    let strong = RAW_IS_ERROR.is_match(fragment)
        || RAW_RESULT.is_match(fragment)
        || RAW_STATUS
            .captures_iter(fragment)
            .any(|caps| status_is_terminal(&caps[1]));
    if strong {
        Classification::Result
    } else if RAW_WEAK.is_match(fragment) {
        Classification::Ambiguous
    } else {
        Classification::Request
    }
}

/// Remove GLM result blocks and orphaned result fragments from `text`.
///
/// Complete `<glm_block>` spans are removed when their payload is a result.
/// A `</glm_block>` with no opener (a truncated stream) triggers a backward
/// scan for the nearest plausible object start; the fragment is excised when
/// it classifies as a result, otherwise only the stray closer goes.
pub fn strip_result_blocks(text: &str) -> Cow<'_, str> {
    if !text.contains(GLM_BLOCK_CLOSE) {
        return Cow::Borrowed(text);
    }

    let without_blocks = GLM_BLOCK.replace_all(text, |caps: &regex::Captures| {
        if classify_fragment(&caps[1]) == Classification::Result {
            tracing::debug!("Result filter: removed glm_block result payload");
            String::new()
        } else {
            caps[0].to_string()
        }
    });

    Cow::Owned(strip_orphan_closers(&without_blocks))
}

fn strip_orphan_closers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(close_at) = rest.find(GLM_BLOCK_CLOSE) {
        let before = &rest[..close_at];
        let after = &rest[close_at + GLM_BLOCK_CLOSE.len()..];

        if before.contains(GLM_BLOCK_OPEN) {
            // Matched block that was kept: copy it through untouched.
            out.push_str(before);
            out.push_str(GLM_BLOCK_CLOSE);
            rest = after;
            continue;
        }

        let excised = match fragment_start(before) {
            Some(start) => {
                (classify_fragment(&before[start..]) == Classification::Result).then_some(start)
            }
            None => headless_fragment_start(before).filter(|start| {
                classify_fragment(&format!("{{{}", &before[*start..])) == Classification::Result
            }),
        };
        match excised {
            Some(start) => {
                tracing::debug!(
                    fragment_len = before.len() - start,
                    "Result filter: excised orphaned result fragment"
                );
                out.push_str(&before[..start]);
            }
            None => out.push_str(before),
        }
        rest = after;
    }

    out.push_str(rest);
    out
}

/// Nearest plausible object start scanning backward from the end of `prefix`.
fn fragment_start(prefix: &str) -> Option<usize> {
    let bytes = prefix.as_bytes();
    let mut depth = 0usize;
    for i in (0..bytes.len()).rev() {
        match bytes[i] {
            b'}' => depth += 1,
            b'{' if depth == 0 => return Some(i),
            b'{' => {
                depth -= 1;
                if depth == 0 && !continues_structure(&bytes[..i]) {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Start of a key run whose opening brace was lost, as in `"name":"x",...}`.
fn headless_fragment_start(prefix: &str) -> Option<usize> {
    QUOTED_KEY
        .find_iter(prefix)
        .map(|key| key.start())
        .filter(|start| !continues_structure(prefix[..*start].as_bytes()))
        .last()
}

/// Whether the byte run ends inside a larger JSON structure.
fn continues_structure(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .rev()
        .find(|b| !b.is_ascii_whitespace())
        .map(|b| matches!(b, b',' | b':' | b'[' | b'{'))
        .unwrap_or(false)
}
