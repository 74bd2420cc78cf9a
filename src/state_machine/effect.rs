//! Effects produced by state transitions

use crate::domain::{ImageData, MessageContent, ToolResult, UsageData};
use crate::llm::ContentBlock;
use crate::state_machine::state::ToolCall;
use serde_json::Value;
use std::time::Duration;

/// Effects to be executed after state transition
#[derive(Debug, Clone)]
pub enum Effect {
    /// Persist a message to the store
    PersistMessage {
        content: MessageContent,
        display_data: Option<Value>,
        usage_data: Option<UsageData>,
        /// The canonical message identifier (client-generated for user messages,
        /// server-generated for agent/tool messages)
        message_id: String,
    },

    /// Persist the new state
    PersistState,

    /// Make an LLM request
    RequestLlm,

    /// Execute a tool (spawns as background task)
    ExecuteTool { tool: ToolCall },

    /// Abort the currently running tool
    AbortTool { tool_use_id: String },

    /// Abort the currently running LLM request
    AbortLlm,

    /// Run the context-compaction pass
    RunCompaction { custom_instructions: Option<String> },

    /// Notify connected subscribers
    NotifyClient { event_type: String, data: Value },

    /// Schedule a retry
    ScheduleRetry { delay: Duration, attempt: u32 },

    /// Persist multiple tool results at once
    PersistToolResults { results: Vec<ToolResult> },
}

impl Effect {
    pub fn persist_user_message(
        text: impl Into<String>,
        images: Vec<ImageData>,
        message_id: String,
        user_agent: Option<String>,
    ) -> Self {
        let content = if images.is_empty() {
            MessageContent::user(text)
        } else {
            MessageContent::user_with_images(text, images)
        };
        // Store user_agent in display_data for UI to show device icon
        let display_data = user_agent.map(|ua| serde_json::json!({ "user_agent": ua }));
        Effect::PersistMessage {
            content,
            display_data,
            usage_data: None,
            message_id,
        }
    }

    pub fn persist_agent_message(blocks: Vec<ContentBlock>, usage: Option<UsageData>) -> Self {
        Effect::PersistMessage {
            content: MessageContent::agent(blocks),
            display_data: None,
            usage_data: usage,
            message_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn persist_tool_message(
        tool_use_id: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
        display_data: Option<Value>,
    ) -> Self {
        let tool_use_id = tool_use_id.into();
        // Predictable message_id so display_data can be patched later
        let message_id = format!("{tool_use_id}-result");
        Effect::PersistMessage {
            content: MessageContent::tool(tool_use_id, output, is_error),
            display_data,
            usage_data: None,
            message_id,
        }
    }

    /// Notify subscribers of a session-level state change. `event_type`
    /// carries the wire vocabulary name directly (`turn_start`,
    /// `auto_compaction_end`, ...) so `transport::notify_to_session_event`
    /// can match on it without unwrapping an extra envelope.
    pub fn notify_state_change(event_type: &str, data: Value) -> Self {
        Effect::NotifyClient {
            event_type: event_type.to_string(),
            data,
        }
    }

    pub fn notify_turn_end() -> Self {
        Effect::NotifyClient {
            event_type: "turn_end".to_string(),
            data: Value::Null,
        }
    }

    pub fn execute_tool(tool: ToolCall) -> Self {
        Effect::ExecuteTool { tool }
    }
}
