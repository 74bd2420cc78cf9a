//! Conversation state types backing the Session Transport's internal loop.

use crate::domain::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;

// ============================================================================
// Tool Input Types - Strongly typed inputs for each tool
// ============================================================================

/// Execution mode for bash commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BashMode {
    #[default]
    Default,
    Slow,
    Background,
}

/// Input for the bash tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BashInput {
    pub command: String,
    #[serde(default)]
    pub mode: BashMode,
}

/// Input for the think tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkInput {
    pub thoughts: String,
}

/// Input for the `keyword_search` tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordSearchInput {
    pub query: String,
    pub search_terms: Vec<String>,
}

/// Input for the `read_image` tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadImageInput {
    pub path: String,
}

/// Logged shape of a `patch` tool call. Intentionally loose (`patches` is kept
/// as raw JSON) since the tool's own request grammar is richer than anything
/// the conversation log needs to round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchInput {
    pub path: String,
    pub patches: Vec<Value>,
}

/// Strongly typed tool input enum. Agent spawn/kill goes through the Swarm
/// Manager's API, not a tool call, so there is no `SpawnAgents` variant here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tool", rename_all = "snake_case")]
pub enum ToolInput {
    Bash(BashInput),
    Think(ThinkInput),
    Patch(PatchInput),
    KeywordSearch(KeywordSearchInput),
    ReadImage(ReadImageInput),
    /// Fallback for unknown tools or parsing failures
    Unknown { name: String, input: Value },
}

impl ToolInput {
    pub fn tool_name(&self) -> &str {
        match self {
            ToolInput::Bash(_) => "bash",
            ToolInput::Think(_) => "think",
            ToolInput::Patch(_) => "patch",
            ToolInput::KeywordSearch(_) => "keyword_search",
            ToolInput::ReadImage(_) => "read_image",
            ToolInput::Unknown { name, .. } => name,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ToolInput::Bash(input) => serde_json::to_value(input).unwrap_or(Value::Null),
            ToolInput::Think(input) => serde_json::to_value(input).unwrap_or(Value::Null),
            ToolInput::Patch(input) => serde_json::to_value(input).unwrap_or(Value::Null),
            ToolInput::KeywordSearch(input) => serde_json::to_value(input).unwrap_or(Value::Null),
            ToolInput::ReadImage(input) => serde_json::to_value(input).unwrap_or(Value::Null),
            ToolInput::Unknown { input, .. } => input.clone(),
        }
    }

    pub fn from_name_and_value(name: &str, value: Value) -> Self {
        macro_rules! parse_or_unknown {
            ($variant:ident) => {
                serde_json::from_value(value.clone()).map_or_else(
                    |_| ToolInput::Unknown {
                        name: name.to_string(),
                        input: value.clone(),
                    },
                    ToolInput::$variant,
                )
            };
        }
        match name {
            "bash" => parse_or_unknown!(Bash),
            "think" => parse_or_unknown!(Think),
            "patch" => parse_or_unknown!(Patch),
            "keyword_search" => parse_or_unknown!(KeywordSearch),
            "read_image" => parse_or_unknown!(ReadImage),
            _ => ToolInput::Unknown {
                name: name.to_string(),
                input: value,
            },
        }
    }
}

/// A tool call from the LLM with typed input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub input: ToolInput,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, input: ToolInput) -> Self {
        Self {
            id: id.into(),
            input,
        }
    }

    pub fn name(&self) -> &str {
        self.input.tool_name()
    }
}

// ============================================================================
// Conversation State
// ============================================================================

/// Internal state of the turn loop backing `LlmSessionTransport`. This is
/// strictly narrower than `ConvState` in the teacher: sub-agent spawn/kill
/// lives in the Swarm Manager, not as tool-driven states here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConvState {
    /// Ready for user input, no pending operations
    #[default]
    Idle,

    /// LLM request in flight, with retry tracking
    LlmRequesting { attempt: u32 },

    /// Executing tools serially
    ToolExecuting {
        current_tool: ToolCall,
        remaining_tools: Vec<ToolCall>,
        #[serde(default)]
        persisted_tool_ids: HashSet<String>,
    },

    /// User requested cancellation of the LLM request
    CancellingLlm,

    /// User requested cancellation of tool execution
    CancellingTool {
        tool_use_id: String,
        skipped_tools: Vec<ToolCall>,
        persisted_tool_ids: HashSet<String>,
    },

    /// `compact()` in flight; corresponds to `auto_compaction_start/_end`
    Compacting {
        custom_instructions: Option<String>,
    },

    /// Error occurred; next `UserMessage` recovers to `LlmRequesting`
    Error {
        message: String,
        error_kind: ErrorKind,
    },
}

impl ConvState {
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            ConvState::LlmRequesting { .. }
                | ConvState::ToolExecuting { .. }
                | ConvState::CancellingLlm
                | ConvState::CancellingTool { .. }
        )
    }

    pub fn is_compacting(&self) -> bool {
        matches!(self, ConvState::Compacting { .. })
    }
}

/// Immutable configuration for one conversation's turn loop.
#[derive(Debug, Clone)]
pub struct ConvContext {
    pub conversation_id: String,
    pub working_dir: PathBuf,
    pub model_id: String,
    pub context_window: usize,
}

/// Default context window for unknown models (conservative)
pub const DEFAULT_CONTEXT_WINDOW: usize = 128_000;

impl ConvContext {
    pub fn new(
        conversation_id: impl Into<String>,
        working_dir: PathBuf,
        model_id: impl Into<String>,
        context_window: usize,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            working_dir,
            model_id: model_id.into(),
            context_window,
        }
    }
}
