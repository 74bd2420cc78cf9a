//! Shared wire/value types used across the transport, runtime and store
//! layers. These are the small, serializable building blocks referenced by
//! `ConversationEntry`, `SessionEvent` and the tool-execution pipeline; they
//! carry no behavior of their own.

use crate::llm::ContentBlock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// An inline image attached to a user message, already normalized
/// (non-empty base64, `image/*` mime type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageData {
    pub media_type: String,
    pub data: String,
}

/// Coarse classification of a failure, used for retry policy and for
/// rendering the Swarm Manager's user-facing error template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimit,
    Auth,
    InvalidRequest,
    Cancelled,
    SubAgentError,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::RateLimit)
    }
}

/// Token accounting for one LLM turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageData {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl UsageData {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Outcome of a single tool invocation, ready to be turned into an
/// `agent_tool_call` entry or fed back into the LLM as a tool result block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub output: String,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_data: Option<Value>,
}

impl ToolResult {
    pub fn cancelled(tool_use_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            output: reason.into(),
            is_error: true,
            display_data: None,
        }
    }
}

/// Body of one `ConversationEntry`, shaped per role. This is the on-disk/
/// projector-facing payload; `ConversationEntry` itself (timestamp, id,
/// ordering) lives in `projector.rs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum MessageContent {
    User {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<ImageData>,
    },
    Agent {
        blocks: Vec<ContentBlock>,
    },
    Tool {
        tool_use_id: String,
        output: String,
        is_error: bool,
    },
}

impl MessageContent {
    pub fn user(text: impl Into<String>) -> Self {
        MessageContent::User {
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn user_with_images(text: impl Into<String>, images: Vec<ImageData>) -> Self {
        MessageContent::User {
            text: text.into(),
            images,
        }
    }

    pub fn agent(blocks: Vec<ContentBlock>) -> Self {
        MessageContent::Agent { blocks }
    }

    pub fn tool(tool_use_id: impl Into<String>, output: impl Into<String>, is_error: bool) -> Self {
        MessageContent::Tool {
            tool_use_id: tool_use_id.into(),
            output: output.into(),
            is_error,
        }
    }

    /// Flattened text used for compaction summaries and transcript rendering.
    pub fn text_summary(&self) -> String {
        match self {
            MessageContent::User { text, .. } => text.clone(),
            MessageContent::Agent { blocks } => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
            MessageContent::Tool { output, .. } => output.clone(),
        }
    }
}

/// An agent's role in the ownership graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Manager,
    Worker,
}

/// Lifecycle status of a persisted agent. `Idle`/`Streaming` are the only
/// statuses with a live runtime behind them; the rest are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Streaming,
    Terminated,
    Stopped,
    Error,
    StoppedOnRestart,
}

impl AgentStatus {
    pub fn is_running(self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Streaming)
    }

    /// `{terminated, stopped, error, stopped_on_restart}` from spec §4.5.6.
    pub fn is_non_running(self) -> bool {
        !self.is_running()
    }
}

/// Which model preset an agent is bound to. `model_id` is validated by the
/// Swarm Manager against a closed preset set at spawn time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub provider: String,
    pub model_id: String,
    pub thinking_level: Option<String>,
}

/// Token accounting surfaced to subscribers; cleared whenever status becomes
/// non-running.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextUsage {
    pub tokens: u64,
    pub context_window: u64,
    pub percent: f64,
}

impl ContextUsage {
    pub fn from_usage(total_tokens: u64, context_window: u64) -> Self {
        let percent = if context_window == 0 {
            0.0
        } else {
            total_tokens as f64 / context_window as f64
        };
        Self {
            tokens: total_tokens,
            context_window,
            percent,
        }
    }
}

/// Persistent identity record for one agent (manager or worker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub display_name: String,
    pub role: AgentRole,
    pub manager_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archetype_id: Option<String>,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cwd: PathBuf,
    pub model: ModelSelection,
    pub session_file: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_usage: Option<ContextUsage>,
}

impl AgentDescriptor {
    /// `role=manager ⇒ managerId=agentId` invariant from spec §3.
    pub fn is_self_owned_manager(&self) -> bool {
        self.role == AgentRole::Manager && self.manager_id == self.agent_id
    }

    /// Clears `contextUsage` whenever status becomes non-running, per the
    /// invariant in spec §3.
    pub fn set_status(&mut self, status: AgentStatus, now: DateTime<Utc>) {
        self.status = status;
        if status.is_non_running() {
            self.context_usage = None;
        }
        self.updated_at = now;
    }
}

/// One file, image or binary blob attached to a user or routed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Attachment {
    Image {
        data: String,
        mime_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
    },
    Text {
        body: String,
        mime_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
    },
    Binary {
        data: String,
        mime_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_path: Option<PathBuf>,
    },
}

/// Which external channel a user message/reply belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Web,
    Slack,
    Telegram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Dm,
    Channel,
    Group,
    Mpim,
}

/// Routing metadata identifying which external channel a user message came
/// from and must be replied to. Required when replying to a non-web
/// channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceContext {
    pub channel: Channel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integration_profile_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_type: Option<ChannelType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
}

impl SourceContext {
    pub fn web() -> Self {
        Self {
            channel: Channel::Web,
            channel_id: None,
            user_id: None,
            thread_ts: None,
            integration_profile_id: None,
            channel_type: None,
            team_id: None,
        }
    }
}

/// How a queued user turn should be delivered to an already-streaming
/// session. Runtime-only; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Steer,
}

/// A steering message accepted by the transport but not yet observed as a
/// `message_start(role=user)` session event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub delivery_id: String,
    pub message_key: String,
    pub mode: DeliveryMode,
}

/// Fingerprint of normalized user-message content, used to correlate a
/// `PendingDelivery` with the `message_start(user)` event it produced.
/// Per spec §3: normalized text joined with sorted
/// `(mimeType|length|first-24-chars-of-data)` image triples.
pub fn message_key(text: &str, images: &[ImageData]) -> String {
    let normalized_text = text.trim();
    let mut image_keys: Vec<String> = images
        .iter()
        .map(|img| {
            let prefix: String = img.data.chars().take(24).collect();
            format!("{}|{}|{}", img.media_type, img.data.len(), prefix)
        })
        .collect();
    image_keys.sort();
    if image_keys.is_empty() {
        normalized_text.to_string()
    } else {
        format!("{}#{}", normalized_text, image_keys.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_key_idempotent_under_renormalization() {
        let images = vec![ImageData {
            media_type: "image/png".to_string(),
            data: "YWJjZGVmZ2hpamtsbW5vcHFyc3R1dnd4eXoxMjM0NTY=".to_string(),
        }];
        let once = message_key("  hello  ", &images);
        let twice = message_key(once.trim(), &images);
        assert_eq!(message_key(&once, &images), message_key(&twice, &images));
    }

    #[test]
    fn message_key_ignores_surrounding_whitespace() {
        assert_eq!(message_key("hi", &[]), message_key("  hi  ", &[]));
    }

    #[test]
    fn agent_status_clears_context_usage_on_non_running() {
        let mut descriptor = AgentDescriptor {
            agent_id: "w1".to_string(),
            display_name: "Worker".to_string(),
            role: AgentRole::Worker,
            manager_id: "m1".to_string(),
            archetype_id: None,
            status: AgentStatus::Streaming,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            cwd: PathBuf::from("/tmp"),
            model: ModelSelection {
                provider: "anthropic".to_string(),
                model_id: "claude-4.5-sonnet".to_string(),
                thinking_level: None,
            },
            session_file: PathBuf::from("sessions/w1.jsonl"),
            context_usage: Some(ContextUsage::from_usage(1000, 200_000)),
        };

        descriptor.set_status(AgentStatus::Terminated, Utc::now());
        assert!(descriptor.context_usage.is_none());
    }
}
