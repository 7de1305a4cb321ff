//! Incremental parser for reasoning spans embedded in model text.
//!
//! ```text
//!            '<'                 opener complete
//! Scanning ───────▶ TagCandidate ────────────────▶ InsideThinking / InsideAntmlThinking
//!    ▲                   │ mismatch                        │ closer complete
//!    └───────────────────┘ (buffer becomes text)           │
//!    ▲                                                     │
//!    └─────────────────────────────────────────────────────┘
//! ```
//!
//! Recognized families:
//!
//! - `<thinking>...</thinking>`
//! - `<think>...</think>`
//! - `<antml\b:thinking>...</antml\b:thinking>`, also closed by a bare `</antml>`
//!
//! Candidate tags are matched one code point at a time against every literal
//! of the active family set, so a tag split across arbitrarily small reads is
//! still recognized. The pending buffer never grows past the longest literal.

use super::unified::ThinkingEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Thinking,
    Think,
    Antml,
}

struct TagLiteral {
    text: &'static str,
    family: Family,
}

const OPENERS: &[TagLiteral] = &[
    TagLiteral {
        text: "<thinking>",
        family: Family::Thinking,
    },
    TagLiteral {
        text: "<think>",
        family: Family::Think,
    },
    TagLiteral {
        text: "<antml\\b:thinking>",
        family: Family::Antml,
    },
];

const THINKING_CLOSERS: &[&str] = &["</thinking>"];
const THINK_CLOSERS: &[&str] = &["</think>"];
const ANTML_CLOSERS: &[&str] = &["</antml\\b:thinking>", "</antml>"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Scanning,
    TagCandidate,
    InsideThinking(Family),
    InsideAntmlThinking,
}

enum TagMatch {
    Partial,
    Complete(usize),
    Mismatch,
}

fn match_literals<'a>(candidate: &str, literals: impl Iterator<Item = &'a str>) -> TagMatch {
    let mut partial = false;
    for (i, literal) in literals.enumerate() {
        if literal == candidate {
            return TagMatch::Complete(i);
        }
        if literal.starts_with(candidate) {
            partial = true;
        }
    }
    if partial {
        TagMatch::Partial
    } else {
        TagMatch::Mismatch
    }
}

/// Character-at-a-time thinking span parser. Construct one per turn.
#[derive(Debug)]
pub struct ThinkingParser {
    state: State,
    text: String,
    thinking: String,
    pending: String,
    events: Vec<ThinkingEvent>,
    finished: bool,
}

impl Default for ThinkingParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkingParser {
    pub fn new() -> Self {
        Self {
            state: State::Scanning,
            text: String::new(),
            thinking: String::new(),
            pending: String::new(),
            events: Vec::new(),
            finished: false,
        }
    }

    /// Feed one code point.
    pub fn feed_rune(&mut self, ch: char) {
        if self.finished {
            tracing::trace!("ThinkingParser: input after finish ignored");
            return;
        }
        match self.state {
            State::Scanning => self.scan(ch),
            State::TagCandidate => self.match_opener(ch),
            State::InsideThinking(_) | State::InsideAntmlThinking => self.match_closer(ch),
        }
    }

    /// Feed every code point of `input` in order.
    pub fn feed_str(&mut self, input: &str) {
        for ch in input.chars() {
            self.feed_rune(ch);
        }
    }

    /// Emit the buffered plain text now.
    ///
    /// A partially matched tag stays buffered, so a tag straddling two reads
    /// is not broken up.
    pub fn flush_text(&mut self) {
        if matches!(self.state, State::Scanning | State::TagCandidate) {
            self.emit_text();
        }
    }

    /// Signal end of input. Terminates the event sequence with exactly one End.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        match self.state {
            State::Scanning => {}
            State::TagCandidate => {
                self.text.push_str(&self.pending);
                self.pending.clear();
            }
            State::InsideThinking(_) | State::InsideAntmlThinking => {
                tracing::debug!(
                    buffered = self.thinking.len(),
                    "ThinkingParser: input ended inside an unterminated thinking span"
                );
                self.thinking.push_str(&self.pending);
                self.pending.clear();
                self.emit_thinking();
            }
        }
        self.state = State::Scanning;
        self.emit_text();
        self.events.push(ThinkingEvent::end());
        self.finished = true;
    }

    /// Drain the events produced so far.
    pub fn consume_events(&mut self) -> Vec<ThinkingEvent> {
        std::mem::take(&mut self.events)
    }

    /// Whether the parser is currently inside a thinking span.
    pub fn in_thinking(&self) -> bool {
        matches!(
            self.state,
            State::InsideThinking(_) | State::InsideAntmlThinking
        )
    }

    fn scan(&mut self, ch: char) {
        if ch == '<' {
            self.pending.push(ch);
            self.state = State::TagCandidate;
        } else {
            self.text.push(ch);
        }
    }

    fn match_opener(&mut self, ch: char) {
        self.pending.push(ch);
        match match_literals(&self.pending, OPENERS.iter().map(|tag| tag.text)) {
            TagMatch::Partial => {}
            TagMatch::Complete(i) => {
                self.pending.clear();
                self.emit_text();
                self.state = match OPENERS[i].family {
                    Family::Antml => State::InsideAntmlThinking,
                    family => State::InsideThinking(family),
                };
            }
            TagMatch::Mismatch => {
                // Resume from the first non-matching character only.
                self.pending.pop();
                self.text.push_str(&self.pending);
                self.pending.clear();
                self.state = State::Scanning;
                self.scan(ch);
            }
        }
    }

    fn match_closer(&mut self, ch: char) {
        if self.pending.is_empty() {
            if ch == '<' {
                self.pending.push(ch);
            } else {
                self.thinking.push(ch);
            }
            return;
        }

        self.pending.push(ch);
        match match_literals(&self.pending, self.closers().iter().copied()) {
            TagMatch::Partial => {}
            TagMatch::Complete(_) => {
                self.pending.clear();
                self.emit_thinking();
                self.state = State::Scanning;
            }
            TagMatch::Mismatch => {
                self.pending.pop();
                self.thinking.push_str(&self.pending);
                self.pending.clear();
                self.match_closer(ch);
            }
        }
    }

    fn closers(&self) -> &'static [&'static str] {
        match self.state {
            State::InsideThinking(Family::Think) => THINK_CLOSERS,
            State::InsideThinking(_) => THINKING_CLOSERS,
            State::InsideAntmlThinking => ANTML_CLOSERS,
            State::Scanning | State::TagCandidate => &[],
        }
    }

    fn emit_text(&mut self) {
        if !self.text.is_empty() {
            let content = std::mem::take(&mut self.text);
            self.events.push(ThinkingEvent::text(content));
        }
    }

    fn emit_thinking(&mut self) {
        if !self.thinking.is_empty() {
            let content = std::mem::take(&mut self.thinking);
            self.events.push(ThinkingEvent::thinking(content));
        }
    }
}
