//! Best-effort repair of malformed JSON fragments lifted from model output.
//!
//! The dominant input is a list of todo records that lost an opening bracket,
//! a key before `": "value"`, or its tail. Repair only ever adds structural
//! punctuation and the inferred `content` key; values are never invented.
//! A `None` result means "no match", never an error.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;

/// Key assumed when a `": "value"` pair has no key token in front of it.
pub const INFERRED_KEY: &str = "content";

/// How many trailing members may be dropped while looking for a parseable prefix.
const MAX_TRUNCATIONS: usize = 8;

lazy_static! {
    static ref MISSING_KEY: Regex = Regex::new(r#"(?P<lead>[\[\{,]\s*)"{1,2}\s*:\s*""#).unwrap();
    static ref CODE_FENCE: Regex =
        Regex::new(r"(?s)^```[A-Za-z0-9_-]*\s*\n?(?P<body>.*?)\n?\s*```$").unwrap();
}

/// Repair `raw` into a JSON value, or give up.
pub fn repair_json(raw: &str) -> Option<Value> {
    let trimmed = strip_code_fence(raw.trim());
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let keyed = infer_missing_keys(trimmed);
    if let Ok(value) = serde_json::from_str::<Value>(&keyed) {
        tracing::debug!("JSON repair: recovered by key inference");
        return Some(value);
    }

    let mut candidate = keyed.into_owned();
    for attempt in 0..=MAX_TRUNCATIONS {
        let balanced = balance_brackets(&candidate);
        if let Ok(value) = serde_json::from_str::<Value>(&balanced) {
            tracing::debug!(truncations = attempt, "JSON repair: recovered by balancing");
            return Some(value);
        }
        match last_separator(&candidate) {
            Some(pos) => candidate.truncate(pos),
            None => break,
        }
    }

    tracing::debug!(len = raw.len(), "JSON repair: giving up");
    None
}

/// Insert the `content` key in front of bare `": "` pairs.
pub fn infer_missing_keys(input: &str) -> Cow<'_, str> {
    MISSING_KEY.replace_all(input, |caps: &regex::Captures| {
        format!("{}\"{}\": \"", &caps["lead"], INFERRED_KEY)
    })
}

fn strip_code_fence(input: &str) -> &str {
    match CODE_FENCE.captures(input).and_then(|caps| caps.name("body")) {
        Some(body) => body.as_str().trim(),
        None => input,
    }
}

const ROOT: char = '\0';

struct Frame {
    opener: char,
    /// Where the current element of this container starts.
    elem_start: usize,
    /// Where the current run of bare `key: value` pairs starts.
    run_start: usize,
    saw_colon: bool,
    after_container: bool,
}

impl Frame {
    fn new(opener: char, at: usize) -> Self {
        Self {
            opener,
            elem_start: at,
            run_start: at,
            saw_colon: false,
            after_container: false,
        }
    }
}

/// Add the minimum openers and closers needed to balance `input`.
///
/// Missing openers are inserted at the start of the element they belong to;
/// when the top level holds several elements the result is wrapped as an
/// array, and a top-level `key: value` run is wrapped as an object.
pub fn balance_brackets(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut frames: Vec<Frame> = vec![Frame::new(ROOT, 0)];
    let mut root_comma = false;
    let mut in_string = false;
    let mut escaped = false;

    for ch in input.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '{' | '[' => {
                mark_value(&mut frames);
                out.push(ch);
                frames.push(Frame::new(ch, out.len()));
            }
            '}' => {
                let closes_object = frames.len() > 1
                    && frames.last().map(|f| f.opener == '{').unwrap_or(false);
                if closes_object {
                    frames.pop();
                } else if let Some(frame) = frames.last_mut() {
                    // The element lost its object opener.
                    let at = if frame.saw_colon {
                        frame.run_start
                    } else {
                        frame.elem_start
                    };
                    frame.saw_colon = false;
                    out.insert(at, '{');
                    if frame.opener == ROOT && at == 0 {
                        root_comma = false;
                    }
                }
                out.push('}');
                mark_container(&mut frames);
            }
            ']' => {
                if frames[1..].iter().any(|f| f.opener == '[') {
                    while frames.len() > 1 {
                        match frames.pop() {
                            Some(frame) if frame.opener == '[' => break,
                            _ => out.push('}'),
                        }
                    }
                } else {
                    while frames.len() > 1 {
                        frames.pop();
                        out.push('}');
                    }
                    out.insert(0, '[');
                    root_comma = false;
                    frames[0].saw_colon = false;
                }
                out.push(']');
                mark_container(&mut frames);
            }
            ',' => {
                out.push(ch);
                let len = out.len();
                if let Some(frame) = frames.last_mut() {
                    if frame.after_container {
                        frame.run_start = len;
                    }
                    frame.elem_start = len;
                    frame.after_container = false;
                    if frame.opener == ROOT {
                        root_comma = true;
                    }
                }
            }
            ':' => {
                out.push(ch);
                if let Some(frame) = frames.last_mut() {
                    frame.saw_colon = true;
                    frame.after_container = false;
                }
            }
            c if c.is_whitespace() => out.push(c),
            c => {
                if c == '"' {
                    in_string = true;
                }
                mark_value(&mut frames);
                out.push(c);
            }
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }

    strip_dangling_tail(&mut out);

    while frames.len() > 1 {
        if let Some(frame) = frames.pop() {
            out.push(if frame.opener == '{' { '}' } else { ']' });
        }
    }

    if frames[0].saw_colon {
        out.insert(0, '{');
        out.push('}');
    } else if root_comma {
        out.insert(0, '[');
        out.push(']');
    }

    out
}

fn mark_value(frames: &mut [Frame]) {
    if let Some(frame) = frames.last_mut() {
        frame.after_container = false;
    }
}

fn mark_container(frames: &mut [Frame]) {
    if let Some(frame) = frames.last_mut() {
        frame.after_container = true;
    }
}

/// Drop a trailing `,` or a dangling `"key":` left by truncation.
fn strip_dangling_tail(out: &mut String) {
    loop {
        let trimmed_len = out.trim_end().len();
        out.truncate(trimmed_len);
        if out.ends_with(',') {
            out.pop();
        } else if out.ends_with(':') {
            out.pop();
            let trimmed_len = out.trim_end().len();
            out.truncate(trimmed_len);
            if out.ends_with('"') {
                if let Some(start) = opening_quote(out) {
                    out.truncate(start);
                }
            }
        } else {
            break;
        }
    }
}

/// Byte offset of the quote opening the string that ends `out`.
fn opening_quote(out: &str) -> Option<usize> {
    let bytes = out.as_bytes();
    let mut i = bytes.len().checked_sub(1)?;
    while i > 0 {
        i -= 1;
        if bytes[i] == b'"' {
            let mut backslashes = 0;
            let mut j = i;
            while j > 0 && bytes[j - 1] == b'\\' {
                backslashes += 1;
                j -= 1;
            }
            if backslashes % 2 == 0 {
                return Some(i);
            }
        }
    }
    None
}

/// Offset of the last `,` outside a string, for dropping a truncated member.
fn last_separator(input: &str) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    let mut last = None;
    for (i, ch) in input.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            ',' => last = Some(i),
            _ => {}
        }
    }
    last
}
