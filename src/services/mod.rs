//! Service layer between the HTTP handlers and the translation engine.
//!
//! Request conversion and bridge prompt setup run before the upstream call;
//! response conversion and stream driving run after it.

pub mod bridge_prompt;
pub mod claude_converter;

// Re-export commonly used types
pub use claude_converter::{
    claude_to_openai_request, convert_openai_streaming_to_claude, openai_to_claude_response,
    RequestSetup,
};
