//! Events that can occur in a conversation

use crate::domain::{ErrorKind, ImageData, ToolResult};
use crate::llm::{ContentBlock, Usage};
use crate::state_machine::state::ToolCall;

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    // User events
    UserMessage {
        text: String,
        images: Vec<ImageData>,
        message_id: String,
    },
    UserCancel,

    // Compaction events
    CompactRequested {
        custom_instructions: Option<String>,
    },
    CompactComplete {
        summary: String,
    },
    CompactFailed {
        message: String,
    },

    // LLM events
    LlmResponse {
        content: Vec<ContentBlock>,
        /// Tool calls extracted from the content
        tool_calls: Vec<ToolCall>,
        end_turn: bool,
        usage: Usage,
    },
    LlmError {
        message: String,
        error_kind: ErrorKind,
        attempt: u32,
    },
    /// LLM request was aborted due to cancellation
    LlmAborted,
    RetryTimeout {
        attempt: u32,
    },

    // Tool events
    ToolComplete {
        tool_use_id: String,
        result: ToolResult,
    },
    /// Tool was aborted due to cancellation
    ToolAborted {
        tool_use_id: String,
    },
}
