//! Response translation engine.
//!
//! Converts OpenAI-style upstream output into Claude Messages-style content.
//! Nothing in this module performs I/O or reads configuration; the request
//! setup hands it a [`TriggerContext`] and a [`ToolRegistry`] per turn.
//!
//! # Architecture
//!
//! ```text
//! upstream text ─▶ ThinkingParser ─┬─▶ Thinking events ──────────────┐
//!                                  │                                 │
//!                                  └─▶ Text events                   │
//!                                        │                           │
//!                                        ▼                           ▼
//!                               ToolCallExtractor ◀── strip_result_blocks
//!                                 │           │
//!                          residual text   ToolCallRequest
//!                                 │           │
//!                                 ▼           ▼
//!                         PreambleCleaner   normalize_arguments
//!                                 │           │
//!                                 └─────┬─────┘
//!                                       ▼
//!                 ResponseAssembler / ClaudeStreamAssembler
//!                                       │
//!                                       ▼
//!                 ContentBlock list / StreamEvent sequence + TurnSummary
//! ```
//!
//! The assemblers produce protocol-neutral blocks and events; the services
//! layer maps them onto the Claude wire types.

pub mod assembler;
pub mod cleaner;
pub mod extractor;
pub mod json_repair;
pub mod result_filter;
pub mod stream;
pub mod thinking;
pub mod unified;

pub use assembler::{native_call_request, AssembledTurn, ResponseAssembler};
pub use cleaner::PreambleCleaner;
pub use extractor::{CandidateMatcher, Extraction, ToolCallExtractor};
pub use json_repair::repair_json;
pub use result_filter::{classify, strip_result_blocks, Classification, Tier};
pub use stream::{ClaudeStreamAssembler, SseEvent, SseParser};
pub use thinking::ThinkingParser;
pub use unified::*;

// ============================================================================
// Transformation Context
// ============================================================================

/// Per-request state shared by the request and response sides of a turn.
#[derive(Debug, Clone, Default)]
pub struct TransformContext {
    /// Request ID for tracing
    pub request_id: String,
    /// Model name sent by the client
    pub original_model: String,
    /// Model name sent upstream
    pub mapped_model: String,
    /// Whether the client asked for a stream
    pub stream: bool,
    /// Trigger signal and bridge flag for this turn
    pub trigger: TriggerContext,
    /// Tools the client declared
    pub registry: ToolRegistry,
}

impl TransformContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        TransformContext {
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    /// Whether the response side must look for textual tool calls.
    pub fn is_bridged(&self) -> bool {
        self.trigger.is_active()
    }

    /// Fresh extractor for one turn.
    pub fn extractor(&self) -> ToolCallExtractor {
        ToolCallExtractor::new(self.trigger.clone(), self.registry.clone())
    }

    pub fn response_assembler(&self) -> ResponseAssembler {
        ResponseAssembler::new(self.extractor())
    }

    pub fn stream_assembler(&self) -> ClaudeStreamAssembler {
        ClaudeStreamAssembler::new(self.extractor())
    }
}
