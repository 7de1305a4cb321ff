//! Non-streaming response assembly.
//!
//! Turns one complete upstream message into ordered content blocks:
//! thinking runs and text in the order they were written, then at most one
//! tool_use block.

use super::cleaner::PreambleCleaner;
use super::extractor::{normalize_arguments, ToolCallExtractor};
use super::json_repair::repair_json;
use super::thinking::ThinkingParser;
use super::unified::{
    ContentBlock, Encoding, NativeCallDelta, StopReason, ThinkingKind, ToolCallRequest,
    ToolRegistry, ToolUseBlock, TurnSummary, UpstreamMessage,
};
use serde_json::{Map, Value};

/// Output of [`ResponseAssembler::assemble`].
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledTurn {
    pub blocks: Vec<ContentBlock>,
    pub summary: TurnSummary,
}

/// Single-pass transform over a complete upstream message.
pub struct ResponseAssembler {
    extractor: ToolCallExtractor,
    cleaner: PreambleCleaner,
}

impl ResponseAssembler {
    pub fn new(extractor: ToolCallExtractor) -> Self {
        Self {
            extractor,
            cleaner: PreambleCleaner::new(),
        }
    }

    pub fn assemble(&self, message: &UpstreamMessage) -> AssembledTurn {
        let mut runs = RunBuilder::default();

        if let Some(reasoning) = message.reasoning.as_deref() {
            runs.push_thinking(reasoning);
        }

        if let Some(content) = message.content.as_deref() {
            let mut parser = ThinkingParser::new();
            parser.feed_str(content);
            parser.finish();
            for event in parser.consume_events() {
                match event.kind {
                    ThinkingKind::Thinking => runs.push_thinking(&event.content),
                    ThinkingKind::Text => runs.push_text(&event.content),
                    ThinkingKind::End => {}
                }
            }
        }

        let mut call = message
            .tool_calls
            .iter()
            .find_map(|native| native_call_request(native, self.extractor.registry()));

        // Text is searched before thinking.
        let text_residuals: Vec<String> = runs
            .blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(text) => Some(text),
                _ => None,
            })
            .map(|text| {
                let extraction = self.extractor.extract(text);
                let (before, after) = extraction.split_text();
                let residual = format!("{}{}", self.cleaner.before_call(before), after);
                if call.is_none() {
                    call = extraction.call;
                }
                residual
            })
            .collect();

        let mut rendered = Vec::with_capacity(runs.blocks.len() + 1);
        let mut residuals = text_residuals.into_iter();
        for block in &runs.blocks {
            match block {
                ContentBlock::Thinking(thinking) => {
                    let extraction = self.extractor.extract_from_thinking(thinking);
                    if call.is_none() {
                        call = extraction.call;
                    }
                    let cleaned = self.cleaner.clean_fragment(&extraction.text);
                    if !cleaned.trim().is_empty() {
                        rendered.push(ContentBlock::Thinking(cleaned.trim().to_string()));
                    }
                }
                ContentBlock::Text(_) => {
                    if let Some(residual) = residuals.next() {
                        let cleaned = self.cleaner.clean(&residual);
                        if !cleaned.is_empty() {
                            rendered.push(ContentBlock::Text(cleaned));
                        }
                    }
                }
                ContentBlock::ToolUse(_) => {}
            }
        }

        let upstream_reason = message
            .finish_reason
            .as_deref()
            .map(StopReason::from_finish_reason)
            .unwrap_or_default();
        let (stop_reason, downgraded) = upstream_reason.settle(call.is_some());

        let summary = TurnSummary {
            tool_name: call.as_ref().map(|c| c.name.clone()),
            encoding: call.as_ref().map(|c| c.encoding),
            downgraded,
            stop_reason,
        };

        if let Some(call) = call {
            rendered.push(ContentBlock::ToolUse(ToolUseBlock::from_request(call)));
        }

        if downgraded {
            tracing::debug!(
                "Upstream signalled a tool call but none was emitted; stop reason downgraded"
            );
        }

        AssembledTurn {
            blocks: rendered,
            summary,
        }
    }
}

/// Convert a complete native tool call, repairing and normalizing its
/// arguments. Unrepairable arguments yield `None`.
pub fn native_call_request(
    native: &NativeCallDelta,
    registry: &ToolRegistry,
) -> Option<ToolCallRequest> {
    let name = native.name.as_deref().map(str::trim).filter(|n| !n.is_empty())?;
    let name = registry.resolve(name).unwrap_or(name).to_string();

    let raw = native.arguments.trim();
    let args = if raw.is_empty() {
        Map::new()
    } else {
        match repair_json(raw) {
            Some(Value::Object(args)) => args,
            _ => {
                tracing::debug!(tool = %name, "Native tool call arguments unrepairable");
                return None;
            }
        }
    };

    let args = normalize_arguments(&name, args, registry)?;
    Some(ToolCallRequest::new(name, args, Encoding::Native))
}

/// Groups parser output into ordered runs.
///
/// Thinking spans separated only by whitespace merge into one run; a
/// whitespace-only text span never starts a text run.
#[derive(Default)]
struct RunBuilder {
    blocks: Vec<ContentBlock>,
}

impl RunBuilder {
    fn push_thinking(&mut self, content: &str) {
        if content.trim().is_empty() {
            return;
        }
        match self.blocks.last_mut() {
            Some(ContentBlock::Thinking(run)) => {
                run.push_str("\n\n");
                run.push_str(content.trim());
            }
            _ => self
                .blocks
                .push(ContentBlock::Thinking(content.trim().to_string())),
        }
    }

    fn push_text(&mut self, content: &str) {
        match self.blocks.last_mut() {
            Some(ContentBlock::Text(run)) => run.push_str(content),
            _ if content.trim().is_empty() => {}
            _ => self.blocks.push(ContentBlock::Text(content.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::unified::TriggerContext;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TRIGGER: &str = "<<CALL_T>>";

    fn assembler(enabled: bool) -> ResponseAssembler {
        ResponseAssembler::new(ToolCallExtractor::new(
            TriggerContext::new(TRIGGER, enabled),
            ToolRegistry::new(["Read", "TodoWrite", "Bash"]),
        ))
    }

    fn message(content: &str, finish_reason: &str) -> UpstreamMessage {
        UpstreamMessage {
            content: Some(content.to_string()),
            finish_reason: Some(finish_reason.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_plain_text() {
        let turn = assembler(true).assemble(&message("Hello there.", "stop"));
        assert_eq!(turn.blocks, vec![ContentBlock::Text("Hello there.".to_string())]);
        assert_eq!(turn.summary.stop_reason, StopReason::EndTurn);
        assert!(!turn.summary.downgraded);
    }

    #[test]
    fn test_thinking_then_text() {
        let turn = assembler(true).assemble(&message(
            "<think>plan</think>\n<thinking>more</thinking>Answer",
            "stop",
        ));
        assert_eq!(
            turn.blocks,
            vec![
                ContentBlock::Thinking("plan\n\nmore".to_string()),
                ContentBlock::Text("Answer".to_string()),
            ]
        );
    }

    #[test]
    fn test_reasoning_content_leads() {
        let turn = assembler(true).assemble(&UpstreamMessage {
            content: Some("Done".to_string()),
            reasoning: Some("thought".to_string()),
            finish_reason: Some("stop".to_string()),
            ..Default::default()
        });
        assert_eq!(
            turn.blocks,
            vec![
                ContentBlock::Thinking("thought".to_string()),
                ContentBlock::Text("Done".to_string()),
            ]
        );
    }

    #[test]
    fn test_bridged_tool_call() {
        let content = r#"I'll read it:
<<CALL_T>>
<invoke name="Read"><parameter name="file_path">/tmp/a</parameter></invoke>"#;
        let turn = assembler(true).assemble(&message(content, "stop"));
        assert_eq!(turn.blocks.len(), 1);
        match &turn.blocks[0] {
            ContentBlock::ToolUse(block) => {
                assert_eq!(block.name, "Read");
                assert_eq!(block.input, json!({"file_path": "/tmp/a"}));
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
        assert_eq!(turn.summary.stop_reason, StopReason::ToolUse);
        assert_eq!(turn.summary.encoding, Some(Encoding::CanonicalXml));
    }

    #[test]
    fn test_downgrade_when_nothing_extractable() {
        let turn = assembler(false).assemble(&message("No tool here.", "tool_calls"));
        assert_eq!(turn.summary.stop_reason, StopReason::EndTurn);
        assert!(turn.summary.downgraded);
        assert!(turn
            .blocks
            .iter()
            .all(|b| !matches!(b, ContentBlock::ToolUse(_))));
    }

    #[test]
    fn test_native_tool_call_first_wins() {
        let turn = assembler(false).assemble(&UpstreamMessage {
            content: None,
            tool_calls: vec![
                NativeCallDelta {
                    index: 0,
                    id: Some("call_1".to_string()),
                    name: Some("Read".to_string()),
                    arguments: r#"{"file_path": "/a""#.to_string(),
                },
                NativeCallDelta {
                    index: 1,
                    id: Some("call_2".to_string()),
                    name: Some("Bash".to_string()),
                    arguments: r#"{"command": "ls"}"#.to_string(),
                },
            ],
            finish_reason: Some("tool_calls".to_string()),
            ..Default::default()
        });
        assert_eq!(turn.blocks.len(), 1);
        assert_eq!(turn.summary.tool_name.as_deref(), Some("Read"));
        assert_eq!(turn.summary.encoding, Some(Encoding::Native));
        assert_eq!(turn.summary.stop_reason, StopReason::ToolUse);
    }

    #[test]
    fn test_glm_result_scenario() {
        let turn = assembler(true).assemble(&message(
            r#"<glm_block>{"name":"Read","is_error":true,"result":"failed","status":"error"}</glm_block>"#,
            "stop",
        ));
        assert!(turn.blocks.is_empty());
        assert_eq!(turn.summary.tool_name, None);
    }

    #[test]
    fn test_orphaned_result_fragment_without_opener() {
        let turn = assembler(true).assemble(&message(
            r#"Done. "name":"Bash","result":{"stdout":"ok"},"status":"completed"}</glm_block> next"#,
            "stop",
        ));
        assert_eq!(turn.blocks, vec![ContentBlock::Text("Done.  next".to_string())]);
        assert_eq!(turn.summary.tool_name, None);
    }

    #[test]
    fn test_preamble_dropped_when_text_follows_call() {
        let content = "Plan:\n<<CALL_T>>\n<invoke name=\"Read\"><parameter name=\"file_path\">/a</parameter></invoke>\nThen I will summarize.";
        let turn = assembler(true).assemble(&message(content, "stop"));
        assert_eq!(
            turn.blocks[0],
            ContentBlock::Text("Then I will summarize.".to_string())
        );
        assert_eq!(turn.summary.tool_name.as_deref(), Some("Read"));
    }

    #[test]
    fn test_tool_call_in_thinking_used_when_text_has_none() {
        let turn = assembler(true).assemble(&message(
            r#"<think>call {"name":"Read","arguments":{"file_path":"/x"}}</think>Working on it."#,
            "stop",
        ));
        assert_eq!(turn.summary.encoding, Some(Encoding::EmbeddedJson));
        assert_eq!(turn.blocks[0], ContentBlock::Thinking("call".to_string()));
        assert_eq!(turn.blocks[1], ContentBlock::Text("Working on it.".to_string()));
        assert!(matches!(turn.blocks[2], ContentBlock::ToolUse(_)));
    }

    #[test]
    fn test_empty_message_has_no_blocks() {
        let turn = assembler(true).assemble(&message("   ", "stop"));
        assert!(turn.blocks.is_empty());
    }
}
