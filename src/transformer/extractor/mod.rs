//! Tool-call extraction from free text.
//!
//! Upstream models that were told about tools through a prompt rather than
//! a native `tools` field write their invocations as text. The extractor
//! locates candidate spans (text following the per-request trigger signal,
//! or the whole segment when no trigger was written), runs the ordered
//! matcher list over each span, and keeps only the first accepted
//! invocation.
//!
//! ```text
//! segment ─▶ strip_result_blocks ─▶ candidate spans ─▶ matchers (1..4)
//!                                                          │
//!                     residual text ◀── cut span ◀─────────┤
//!                                                          ▼
//!                                             normalize_arguments ─▶ call
//! ```

pub mod matchers;
pub mod normalize;

pub use matchers::{
    default_matchers, parse_parameter_value, CandidateMatcher, CanonicalXmlMatcher,
    EmbeddedJsonMatcher, KeyValueXmlMatcher, MalformedXmlMatcher, MatchedCall,
};
pub use normalize::{
    double_shell_backslashes, normalize_arguments, normalize_todos, repair_command_paths,
    repair_path_escapes,
};

use super::result_filter::strip_result_blocks;
use super::unified::{Encoding, ToolCallRequest, ToolRegistry, TriggerContext};
use std::ops::Range;

/// Result of one extraction pass.
///
/// `text` still carries display artifacts; run it through the cleaner
/// before showing it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub text: String,
    pub call: Option<ToolCallRequest>,
    /// Offset in `text` where the invocation markup was cut out.
    pub cut: Option<usize>,
}

impl Extraction {
    /// Text ahead of the cut and text after it.
    pub fn split_text(&self) -> (&str, &str) {
        let cut = self.cut.unwrap_or(self.text.len()).min(self.text.len());
        self.text.split_at(cut)
    }
}

/// Recognizes tool invocations across the supported textual encodings.
pub struct ToolCallExtractor {
    ctx: TriggerContext,
    registry: ToolRegistry,
    matchers: Vec<Box<dyn CandidateMatcher>>,
}

impl ToolCallExtractor {
    pub fn new(ctx: TriggerContext, registry: ToolRegistry) -> Self {
        Self {
            ctx,
            registry,
            matchers: default_matchers(),
        }
    }

    /// Append a matcher after the built-in ones.
    pub fn add_matcher<M: CandidateMatcher + 'static>(mut self, matcher: M) -> Self {
        self.matchers.push(Box::new(matcher));
        self
    }

    pub fn context(&self) -> &TriggerContext {
        &self.ctx
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Names of the matchers in the order they are tried.
    pub fn matcher_names(&self) -> Vec<&'static str> {
        self.matchers.iter().map(|m| m.name()).collect()
    }

    /// Extract at most one invocation from a text segment.
    ///
    /// With bridging off, only result blocks are stripped and the text is
    /// otherwise passed through.
    pub fn extract(&self, segment: &str) -> Extraction {
        let filtered = strip_result_blocks(segment);
        if !self.ctx.is_active() {
            return Extraction {
                text: filtered.into_owned(),
                call: None,
                cut: None,
            };
        }

        let text = filtered.as_ref();
        match self.locate(text) {
            Some((matched, encoding)) => {
                let mut residual = self.strip_trigger(&text[..matched.range.start]);
                let cut = residual.len();
                residual.push_str(&self.strip_trigger(&text[matched.range.end..]));
                let call = self.accept(matched, encoding);
                Extraction {
                    text: residual,
                    cut: call.is_some().then_some(cut),
                    call,
                }
            }
            None => Extraction {
                text: self.strip_trigger(text),
                call: None,
                cut: None,
            },
        }
    }

    /// Same as [`extract`](Self::extract), over the content of a thinking span.
    pub fn extract_from_thinking(&self, thinking: &str) -> Extraction {
        let extraction = self.extract(thinking);
        if let Some(call) = &extraction.call {
            tracing::debug!(
                tool = %call.name,
                encoding = %call.encoding,
                "Recovered tool call from thinking content"
            );
        }
        extraction
    }

    /// Remove every occurrence of the trigger signal.
    pub fn strip_trigger(&self, text: &str) -> String {
        if self.ctx.signal.is_empty() {
            return text.to_string();
        }
        text.replace(&self.ctx.signal, "")
    }

    fn accept(&self, matched: MatchedCall, encoding: Encoding) -> Option<ToolCallRequest> {
        match normalize_arguments(&matched.name, matched.args, &self.registry) {
            Some(args) => {
                tracing::debug!(
                    tool = %matched.name,
                    encoding = %encoding,
                    arg_count = args.len(),
                    "Extracted tool call"
                );
                Some(ToolCallRequest::new(matched.name, args, encoding))
            }
            None => {
                tracing::debug!(
                    tool = %matched.name,
                    encoding = %encoding,
                    "Dropped tool call with unrepairable arguments"
                );
                None
            }
        }
    }

    /// First accepted candidate across all spans, in matcher order per span.
    fn locate(&self, text: &str) -> Option<(MatchedCall, Encoding)> {
        let spans = self.candidate_spans(text);
        for span in &spans {
            if let Some(found) = self.first_match(text, span.clone(), |_| true) {
                return Some(found);
            }
        }

        // Embedded JSON may sit anywhere, not only after a trigger.
        if spans.len() == 1 && spans[0] == (0..text.len()) {
            return None;
        }
        self.first_match(text, 0..text.len(), |encoding| {
            encoding == Encoding::EmbeddedJson
        })
    }

    fn first_match(
        &self,
        text: &str,
        span: Range<usize>,
        allowed: impl Fn(Encoding) -> bool,
    ) -> Option<(MatchedCall, Encoding)> {
        let offset = span.start;
        let window = &text[span];
        self.matchers
            .iter()
            .filter(|matcher| allowed(matcher.encoding()))
            .find_map(|matcher| {
                matcher.find(window, &self.registry).map(|mut matched| {
                    matched.range = matched.range.start + offset..matched.range.end + offset;
                    (matched, matcher.encoding())
                })
            })
    }

    /// Text following each trigger occurrence, or the whole segment.
    fn candidate_spans(&self, text: &str) -> Vec<Range<usize>> {
        let starts: Vec<usize> = text
            .match_indices(self.ctx.signal.as_str())
            .map(|(at, _)| at)
            .collect();
        if starts.is_empty() {
            return vec![0..text.len()];
        }

        let signal_len = self.ctx.signal.len();
        starts
            .iter()
            .enumerate()
            .map(|(i, start)| {
                let end = starts.get(i + 1).copied().unwrap_or(text.len());
                start + signal_len..end
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::unified::Encoding;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TRIGGER: &str = "<<CALL_T>>";

    fn extractor() -> ToolCallExtractor {
        ToolCallExtractor::new(
            TriggerContext::new(TRIGGER, true),
            ToolRegistry::new(["Read", "TodoWrite", "Bash"]).with_shell_tools(["Bash"]),
        )
    }

    #[test]
    fn test_todo_write_scenario() {
        let segment = r#"<<CALL_T>><invoke name="TodoWrite"><parameter name="todos">[{"content":"a","state":"pending"}]</parameter></invoke>"#;
        let extraction = extractor().extract(segment);
        let call = extraction.call.unwrap();
        assert_eq!(call.name, "TodoWrite");
        assert_eq!(call.encoding, Encoding::CanonicalXml);
        let todos = call.args["todos"].as_array().unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0]["status"], "pending");
        assert_eq!(todos[0]["activeForm"], "a");
        assert!(todos[0]["id"].as_str().unwrap().len() >= 3);
        assert_eq!(extraction.text, "");
    }

    #[test]
    fn test_residual_text_keeps_preamble() {
        let segment = r#"Let me check. <<CALL_T>><invoke name="Read"><parameter name="file_path">/a</parameter></invoke>"#;
        let extraction = extractor().extract(segment);
        assert_eq!(extraction.text, "Let me check. ");
        assert_eq!(extraction.call.unwrap().args["file_path"], "/a");
    }

    #[test]
    fn test_first_match_wins() {
        let segment = concat!(
            r#"<<CALL_T>><invoke name="Read"><parameter name="file_path">/first</parameter></invoke>"#,
            r#"<<CALL_T>><invoke name="Read"><parameter name="file_path">/second</parameter></invoke>"#,
        );
        let extraction = extractor().extract(segment);
        assert_eq!(extraction.call.unwrap().args["file_path"], "/first");
        assert!(!extraction.text.contains(TRIGGER));
    }

    #[test]
    fn test_no_trigger_still_tries_whole_segment() {
        let segment = r#"<invoke name="Read"><parameter name="file_path">/a</parameter></invoke>"#;
        let extraction = extractor().extract(segment);
        assert_eq!(extraction.call.unwrap().name, "Read");
    }

    #[test]
    fn test_embedded_json_before_trigger() {
        let segment = r#"{"name": "Read", "arguments": {"file_path": "/a"}} <<CALL_T>> nothing here"#;
        let extraction = extractor().extract(segment);
        let call = extraction.call.unwrap();
        assert_eq!(call.encoding, Encoding::EmbeddedJson);
        assert_eq!(extraction.text, "  nothing here");
    }

    #[test]
    fn test_bridging_disabled_passes_text_through() {
        let extractor = ToolCallExtractor::new(
            TriggerContext::new(TRIGGER, false),
            ToolRegistry::new(["Read"]),
        );
        let segment = r#"<invoke name="Read"></invoke>"#;
        let extraction = extractor.extract(segment);
        assert!(extraction.call.is_none());
        assert_eq!(extraction.text, segment);
    }

    #[test]
    fn test_result_payload_not_extracted() {
        let segment = r#"<<CALL_T>>{"name":"Read","is_error":true,"result":"failed","status":"error"}"#;
        let extraction = extractor().extract(segment);
        assert!(extraction.call.is_none());
    }

    #[test]
    fn test_glm_result_block_removed() {
        let segment = r#"ok <glm_block>{"name":"Read","is_error":true,"result":"failed","status":"error"}</glm_block>"#;
        let extraction = extractor().extract(segment);
        assert!(extraction.call.is_none());
        assert_eq!(extraction.text, "ok ");
    }

    #[test]
    fn test_unrepairable_todos_yield_no_call() {
        let segment = r#"<<CALL_T>><invoke name="TodoWrite"><parameter name="todos">nothing</parameter></invoke>"#;
        let extraction = extractor().extract(segment);
        assert!(extraction.call.is_none());
        assert!(!extraction.text.contains("<invoke"));
    }

    #[test]
    fn test_shell_command_doubled() {
        let segment = r#"<<CALL_T>><invoke name="Bash"><parameter name="command">dir C:\work</parameter></invoke>"#;
        let call = extractor().extract(segment).call.unwrap();
        assert_eq!(call.args["command"], json!("dir C:\\\\work"));
    }

    #[test]
    fn test_extract_from_thinking() {
        let thinking = r#"I should call {"name":"Read","arguments":{"file_path":"/x"}} now"#;
        let extraction = extractor().extract_from_thinking(thinking);
        assert_eq!(extraction.call.unwrap().args["file_path"], "/x");
        assert_eq!(extraction.text, "I should call  now");
    }

    #[test]
    fn test_matcher_names() {
        assert_eq!(
            extractor().matcher_names(),
            vec!["canonical_xml", "malformed_xml", "key_value_xml", "embedded_json"]
        );
    }
}
