//! Conversation Projector (C4): projects raw session events and routed
//! messages into per-agent ordered `ConversationEntry` streams, and replays
//! history on subscribe.

use crate::domain::{Attachment, MessageContent, SourceContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Why a `conversation_reset` was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    UserNewCommand,
    ApiReset,
}

/// Role tag for a `conversation_message` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// One projected, subscriber-facing entry. Tagged variant per spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEntry {
    ConversationMessage {
        agent_id: String,
        timestamp: DateTime<Utc>,
        role: MessageRole,
        content: MessageContent,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        attachments: Vec<Attachment>,
        #[serde(skip_serializing_if = "Option::is_none")]
        source_context: Option<SourceContext>,
    },
    ConversationLog {
        agent_id: String,
        timestamp: DateTime<Utc>,
        message: String,
    },
    AgentMessage {
        agent_id: String,
        timestamp: DateTime<Utc>,
        from: String,
        to: String,
        text: String,
    },
    AgentToolCall {
        agent_id: String,
        timestamp: DateTime<Utc>,
        tool_use_id: String,
        tool_name: String,
        input: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

impl ConversationEntry {
    /// The subscription routing key (spec §4.4: "manager-facing web events
    /// are stored under the manager's agentId; worker events under the
    /// worker's agentId").
    pub fn agent_id(&self) -> &str {
        match self {
            ConversationEntry::ConversationMessage { agent_id, .. }
            | ConversationEntry::ConversationLog { agent_id, .. }
            | ConversationEntry::AgentMessage { agent_id, .. }
            | ConversationEntry::AgentToolCall { agent_id, .. } => agent_id,
        }
    }
}

/// Projects events into ordered per-agent sequences. Owned by the Swarm
/// Manager; receives events via method calls rather than holding a
/// back-pointer to it (spec §9's cyclic-reference design note).
#[derive(Default)]
pub struct ConversationProjector {
    entries_by_agent: HashMap<String, Vec<ConversationEntry>>,
}

impl ConversationProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry under its own routing key. Entries for a given
    /// agent are returned in arrival order (spec §4.4 "Order" guarantee).
    pub fn append(&mut self, entry: ConversationEntry) {
        self.entries_by_agent
            .entry(entry.agent_id().to_string())
            .or_default()
            .push(entry);
    }

    /// Duplicate an `agent_message` entry into every manager-context id
    /// reachable from sender and target, per spec §4.4's routing rule for
    /// agent-to-agent traffic. `manager_context_ids` is the caller-resolved
    /// set (sender's own manager id plus target's, deduplicated).
    pub fn append_routed(
        &mut self,
        manager_context_ids: &[String],
        build: impl Fn(&str) -> ConversationEntry,
    ) {
        for manager_id in manager_context_ids {
            self.append(build(manager_id));
        }
    }

    /// Full current sequence for `agent_id`, used both for subscribe replay
    /// (spec §4.6) and for the seed test scenario "subscribe replay".
    pub fn history(&self, agent_id: &str) -> &[ConversationEntry] {
        self.entries_by_agent
            .get(agent_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Clear `agent_id`'s sequence, returning a `conversation_reset` entry
    /// for the caller to broadcast (spec §4.4 "Reset").
    pub fn reset(&mut self, agent_id: &str, reason: ResetReason) -> ResetEvent {
        self.entries_by_agent.remove(agent_id);
        ResetEvent {
            agent_id: agent_id.to_string(),
            reason,
        }
    }

    /// Drop every entry belonging to `agent_id`, used when a worker is
    /// deleted as part of `deleteManager`'s history cascade.
    pub fn clear(&mut self, agent_id: &str) {
        self.entries_by_agent.remove(agent_id);
    }

    /// Fill in the result half of an `agent_tool_call` entry opened earlier
    /// by `tool_use_id`. A no-op if the entry was never appended (e.g. it
    /// predates a restart) or the id is unknown.
    pub fn update_tool_call(&mut self, agent_id: &str, tool_use_id: &str, is_error: bool) {
        let Some(entries) = self.entries_by_agent.get_mut(agent_id) else {
            return;
        };
        let found = entries.iter_mut().rev().find(|e| {
            matches!(e, ConversationEntry::AgentToolCall { tool_use_id: id, .. } if id == tool_use_id)
        });
        if let Some(ConversationEntry::AgentToolCall { is_error: slot, .. }) = found {
            *slot = Some(is_error);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetEvent {
    pub agent_id: String,
    pub reason: ResetReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_entry(agent_id: &str, message: &str) -> ConversationEntry {
        ConversationEntry::ConversationLog {
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
            message: message.to_string(),
        }
    }

    #[test]
    fn appends_preserve_per_agent_order() {
        let mut projector = ConversationProjector::new();
        projector.append(log_entry("a1", "first"));
        projector.append(log_entry("a1", "second"));

        let history = projector.history("a1");
        assert_eq!(history.len(), 2);
        match (&history[0], &history[1]) {
            (
                ConversationEntry::ConversationLog { message: m1, .. },
                ConversationEntry::ConversationLog { message: m2, .. },
            ) => {
                assert_eq!(m1, "first");
                assert_eq!(m2, "second");
            }
            _ => panic!("unexpected variant"),
        }
    }

    #[test]
    fn entries_for_different_agents_are_isolated() {
        let mut projector = ConversationProjector::new();
        projector.append(log_entry("a1", "for a1"));
        projector.append(log_entry("a2", "for a2"));

        assert_eq!(projector.history("a1").len(), 1);
        assert_eq!(projector.history("a2").len(), 1);
    }

    #[test]
    fn reset_clears_sequence_and_is_idempotent() {
        let mut projector = ConversationProjector::new();
        projector.append(log_entry("a1", "keep this"));

        let first = projector.reset("a1", ResetReason::UserNewCommand);
        assert!(projector.history("a1").is_empty());

        let second = projector.reset("a1", ResetReason::UserNewCommand);
        assert_eq!(first.agent_id, second.agent_id);
        assert!(projector.history("a1").is_empty());
    }

    #[test]
    fn update_tool_call_fills_in_result_on_matching_entry() {
        let mut projector = ConversationProjector::new();
        projector.append(ConversationEntry::AgentToolCall {
            agent_id: "a1".to_string(),
            timestamp: Utc::now(),
            tool_use_id: "tool-1".to_string(),
            tool_name: "bash".to_string(),
            input: serde_json::Value::Null,
            output: None,
            is_error: None,
        });

        projector.update_tool_call("a1", "tool-1", true);

        match &projector.history("a1")[0] {
            ConversationEntry::AgentToolCall { is_error, .. } => {
                assert_eq!(*is_error, Some(true));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn update_tool_call_is_a_noop_for_unknown_id() {
        let mut projector = ConversationProjector::new();
        projector.append(log_entry("a1", "hi"));
        projector.update_tool_call("a1", "missing", true);
        assert_eq!(projector.history("a1").len(), 1);
    }

    #[test]
    fn subscribe_replay_finds_prior_message() {
        let mut projector = ConversationProjector::new();
        projector.append(ConversationEntry::ConversationMessage {
            agent_id: "a1".to_string(),
            timestamp: Utc::now(),
            role: MessageRole::User,
            content: MessageContent::user("keep this"),
            attachments: Vec::new(),
            source_context: None,
        });

        let history = projector.history("a1");
        let found = history.iter().any(|e| {
            matches!(e, ConversationEntry::ConversationMessage { content, .. }
                if content.text_summary() == "keep this")
        });
        assert!(found);
    }
}
