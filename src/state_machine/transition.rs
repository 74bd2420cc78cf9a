//! Pure state transition function

use super::{ConvContext, ConvState, Effect, Event};
use crate::domain::{ErrorKind, ToolResult, UsageData};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ConvState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ConvState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Agent is busy, cannot accept message (cancel current operation first)")]
    AgentBusy,
    #[error("Cancellation in progress")]
    CancellationInProgress,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function: given the same inputs, always produces the same
/// outputs, with no I/O side effects.
#[allow(clippy::too_many_lines)]
pub fn transition(
    state: &ConvState,
    _context: &ConvContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // ============================================================
        // User Message Handling
        // ============================================================

        // Idle or Error + UserMessage -> LlmRequesting (recovery from Error)
        (
            ConvState::Idle | ConvState::Error { .. },
            Event::UserMessage {
                text,
                images,
                message_id,
            },
        ) => Ok(
            TransitionResult::new(ConvState::LlmRequesting { attempt: 1 })
                .with_effect(Effect::persist_user_message(text, images, message_id, None))
                .with_effect(Effect::PersistState)
                .with_effect(notify_llm_requesting(1))
                .with_effect(Effect::RequestLlm),
        ),

        // Busy states + UserMessage -> Reject
        (ConvState::LlmRequesting { .. }, Event::UserMessage { .. })
        | (ConvState::ToolExecuting { .. }, Event::UserMessage { .. })
        | (ConvState::Compacting { .. }, Event::UserMessage { .. }) => {
            Err(TransitionError::AgentBusy)
        }

        (ConvState::CancellingLlm, Event::UserMessage { .. })
        | (ConvState::CancellingTool { .. }, Event::UserMessage { .. }) => {
            Err(TransitionError::CancellationInProgress)
        }

        // ============================================================
        // Compaction
        // ============================================================

        // Idle + CompactRequested -> Compacting
        (ConvState::Idle, Event::CompactRequested { custom_instructions }) => Ok(
            TransitionResult::new(ConvState::Compacting {
                custom_instructions: custom_instructions.clone(),
            })
            .with_effect(Effect::PersistState)
            .with_effect(Effect::notify_state_change(
                "auto_compaction_start",
                json!({}),
            ))
            .with_effect(Effect::RunCompaction { custom_instructions }),
        ),

        // Busy states + CompactRequested -> reject; caller retries once idle
        (state, Event::CompactRequested { .. }) if state.is_streaming() => {
            Err(TransitionError::AgentBusy)
        }

        // Compacting + CompactComplete -> Idle, summary replaces history
        (ConvState::Compacting { .. }, Event::CompactComplete { summary }) => Ok(
            TransitionResult::new(ConvState::Idle)
                .with_effect(Effect::persist_agent_message(
                    vec![crate::llm::ContentBlock::text(summary)],
                    None,
                ))
                .with_effect(Effect::PersistState)
                .with_effect(Effect::notify_state_change("auto_compaction_end", json!({}))),
        ),

        // Compacting + CompactFailed -> Error
        (ConvState::Compacting { .. }, Event::CompactFailed { message }) => Ok(
            TransitionResult::new(ConvState::Error {
                message: message.clone(),
                error_kind: ErrorKind::Unknown,
            })
            .with_effect(Effect::PersistState)
            .with_effect(Effect::notify_state_change(
                "auto_compaction_end",
                json!({ "error_message": message }),
            )),
        ),

        // ============================================================
        // LLM Response Processing
        // ============================================================

        (
            ConvState::LlmRequesting { .. },
            Event::LlmResponse {
                content,
                tool_calls,
                end_turn: _,
                usage,
            },
        ) => {
            let usage_data = usage_to_data(&usage);

            if tool_calls.is_empty() {
                Ok(TransitionResult::new(ConvState::Idle)
                    .with_effect(Effect::persist_agent_message(content, Some(usage_data)))
                    .with_effect(Effect::PersistState)
                    .with_effect(Effect::notify_turn_end()))
            } else {
                let first = tool_calls[0].clone();
                let rest = tool_calls[1..].to_vec();
                let remaining_count = rest.len();

                Ok(TransitionResult::new(ConvState::ToolExecuting {
                    current_tool: first.clone(),
                    remaining_tools: rest,
                    persisted_tool_ids: HashSet::new(),
                })
                .with_effect(Effect::persist_agent_message(content, Some(usage_data)))
                .with_effect(Effect::PersistState)
                .with_effect(notify_tool_executing(
                    first.name(),
                    &first.id,
                    remaining_count,
                    0,
                ))
                .with_effect(Effect::execute_tool(first)))
            }
        }

        // ============================================================
        // Error Handling and Retry
        // ============================================================

        // LlmRequesting + LlmError (retryable) -> LlmRequesting with incremented attempt
        (
            ConvState::LlmRequesting { attempt },
            Event::LlmError {
                message: _,
                error_kind,
                ..
            },
        ) if error_kind.is_retryable() && *attempt < MAX_RETRY_ATTEMPTS => {
            let new_attempt = attempt + 1;
            let delay = retry_delay(new_attempt);

            Ok(TransitionResult::new(ConvState::LlmRequesting {
                attempt: new_attempt,
            })
            .with_effect(Effect::PersistState)
            .with_effect(Effect::ScheduleRetry {
                delay,
                attempt: new_attempt,
            })
            .with_effect(Effect::notify_state_change(
                "auto_retry_start",
                json!({
                    "attempt": new_attempt,
                    "max_attempts": MAX_RETRY_ATTEMPTS,
                }),
            )))
        }

        // LlmRequesting + LlmError (non-retryable or exhausted) -> Error
        (
            ConvState::LlmRequesting { attempt },
            Event::LlmError {
                message,
                error_kind,
                ..
            },
        ) => {
            let error_message = if error_kind.is_retryable() {
                format!("Failed after {attempt} attempts: {message}")
            } else {
                message
            };

            Ok(TransitionResult::new(ConvState::Error {
                message: error_message.clone(),
                error_kind,
            })
            .with_effect(Effect::PersistState)
            .with_effect(Effect::notify_state_change(
                "error",
                json!({ "message": error_message }),
            )))
        }

        // RetryTimeout -> re-issue the LLM request
        (
            ConvState::LlmRequesting { attempt },
            Event::RetryTimeout {
                attempt: retry_attempt,
            },
        ) if *attempt == retry_attempt => Ok(TransitionResult::new(ConvState::LlmRequesting {
            attempt: *attempt,
        })
        .with_effect(Effect::notify_state_change("auto_retry_end", json!({})))
        .with_effect(Effect::RequestLlm)),

        // ============================================================
        // Tool Execution
        // ============================================================

        // ToolExecuting + ToolComplete (more tools remaining) -> next tool
        (
            ConvState::ToolExecuting {
                current_tool,
                remaining_tools,
                persisted_tool_ids,
            },
            Event::ToolComplete { tool_use_id, result },
        ) if tool_use_id == current_tool.id && !remaining_tools.is_empty() => {
            let mut new_persisted = persisted_tool_ids.clone();
            new_persisted.insert(result.tool_use_id.clone());
            let completed_count = new_persisted.len();

            let next_tool = remaining_tools[0].clone();
            let new_remaining = remaining_tools[1..].to_vec();
            let remaining_count = new_remaining.len();

            Ok(TransitionResult::new(ConvState::ToolExecuting {
                current_tool: next_tool.clone(),
                remaining_tools: new_remaining,
                persisted_tool_ids: new_persisted,
            })
            .with_effect(Effect::persist_tool_message(
                &result.tool_use_id,
                &result.output,
                result.is_error,
                result.display_data.clone(),
            ))
            .with_effect(Effect::PersistState)
            .with_effect(notify_tool_executing(
                next_tool.name(),
                &next_tool.id,
                remaining_count,
                completed_count,
            ))
            .with_effect(Effect::execute_tool(next_tool)))
        }

        // ToolExecuting + ToolComplete (last tool) -> LlmRequesting
        (
            ConvState::ToolExecuting {
                current_tool,
                remaining_tools,
                ..
            },
            Event::ToolComplete { tool_use_id, result },
        ) if tool_use_id == current_tool.id && remaining_tools.is_empty() => Ok(
            TransitionResult::new(ConvState::LlmRequesting { attempt: 1 })
                .with_effect(Effect::persist_tool_message(
                    &result.tool_use_id,
                    &result.output,
                    result.is_error,
                    result.display_data.clone(),
                ))
                .with_effect(Effect::PersistState)
                .with_effect(notify_llm_requesting(1))
                .with_effect(Effect::RequestLlm),
        ),

        // ============================================================
        // Cancellation
        // ============================================================

        (ConvState::LlmRequesting { .. }, Event::UserCancel) => {
            Ok(TransitionResult::new(ConvState::CancellingLlm)
                .with_effect(Effect::PersistState)
                .with_effect(Effect::AbortLlm))
        }

        // CancellingLlm + LlmResponse/LlmAborted -> Idle (discard response)
        (ConvState::CancellingLlm, Event::LlmResponse { .. } | Event::LlmAborted) => {
            Ok(TransitionResult::new(ConvState::Idle)
                .with_effect(Effect::PersistState)
                .with_effect(Effect::notify_turn_end()))
        }

        (
            ConvState::ToolExecuting {
                current_tool,
                remaining_tools,
                persisted_tool_ids,
            },
            Event::UserCancel,
        ) => Ok(TransitionResult::new(ConvState::CancellingTool {
            tool_use_id: current_tool.id.clone(),
            skipped_tools: remaining_tools.clone(),
            persisted_tool_ids: persisted_tool_ids.clone(),
        })
        .with_effect(Effect::AbortTool {
            tool_use_id: current_tool.id.clone(),
        })
        .with_effect(Effect::PersistState)),

        // CancellingTool + ToolAborted -> Idle with synthetic results
        (
            ConvState::CancellingTool {
                tool_use_id,
                skipped_tools,
                persisted_tool_ids,
            },
            Event::ToolAborted {
                tool_use_id: aborted_id,
            },
        ) if *tool_use_id == aborted_id => {
            let aborted_result = ToolResult::cancelled(tool_use_id.clone(), "Cancelled by user");
            let skipped_results: Vec<ToolResult> = skipped_tools
                .iter()
                .map(|tool| ToolResult::cancelled(tool.id.clone(), "Skipped due to cancellation"))
                .collect();

            let mut new_results = vec![aborted_result];
            new_results.extend(skipped_results);
            validate_no_duplicate_persists(&new_results, persisted_tool_ids)?;

            Ok(TransitionResult::new(ConvState::Idle)
                .with_effect(Effect::PersistToolResults { results: new_results })
                .with_effect(Effect::PersistState)
                .with_effect(Effect::notify_turn_end()))
        }

        // CancellingTool + ToolComplete -> Idle (tool finished before abort)
        (
            ConvState::CancellingTool {
                tool_use_id,
                skipped_tools,
                persisted_tool_ids,
            },
            Event::ToolComplete {
                tool_use_id: completed_id,
                result: _,
            },
        ) if *tool_use_id == completed_id => {
            let cancelled_result = ToolResult::cancelled(tool_use_id.clone(), "Cancelled by user");
            let skipped_results: Vec<ToolResult> = skipped_tools
                .iter()
                .map(|tool| ToolResult::cancelled(tool.id.clone(), "Skipped due to cancellation"))
                .collect();

            let mut new_results = vec![cancelled_result];
            new_results.extend(skipped_results);
            validate_no_duplicate_persists(&new_results, persisted_tool_ids)?;

            Ok(TransitionResult::new(ConvState::Idle)
                .with_effect(Effect::PersistToolResults { results: new_results })
                .with_effect(Effect::PersistState)
                .with_effect(Effect::notify_turn_end()))
        }

        // ============================================================
        // Invalid Transitions
        // ============================================================
        (state, event) => Err(TransitionError::InvalidTransition(format!(
            "No transition from {state:?} with event {event:?}"
        ))),
    }
}

fn validate_no_duplicate_persists(
    results: &[ToolResult],
    already_persisted: &HashSet<String>,
) -> Result<(), TransitionError> {
    for result in results {
        if already_persisted.contains(&result.tool_use_id) {
            return Err(TransitionError::InvalidTransition(format!(
                "Attempted to persist duplicate tool result for tool_use_id: {}",
                result.tool_use_id
            )));
        }
    }
    Ok(())
}

fn usage_to_data(usage: &crate::llm::Usage) -> UsageData {
    UsageData {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_creation_tokens: usage.cache_creation_tokens,
        cache_read_tokens: usage.cache_read_tokens,
    }
}

fn retry_delay(attempt: u32) -> Duration {
    // Exponential backoff: 1s, 2s, 4s
    Duration::from_secs(1 << (attempt - 1))
}

fn notify_llm_requesting(attempt: u32) -> Effect {
    Effect::notify_state_change("turn_start", json!({ "attempt": attempt }))
}

fn notify_tool_executing(
    tool_name: &str,
    tool_id: &str,
    remaining_count: usize,
    completed_count: usize,
) -> Effect {
    Effect::notify_state_change(
        "tool_execution_start",
        json!({
            "current_tool": { "name": tool_name, "id": tool_id },
            "remaining_count": remaining_count,
            "completed_count": completed_count
        }),
    )
}

#[allow(dead_code)]
pub fn llm_error_to_db_error(kind: crate::llm::LlmErrorKind) -> ErrorKind {
    match kind {
        crate::llm::LlmErrorKind::Auth => ErrorKind::Auth,
        crate::llm::LlmErrorKind::RateLimit => ErrorKind::RateLimit,
        crate::llm::LlmErrorKind::Network => ErrorKind::Network,
        crate::llm::LlmErrorKind::InvalidRequest => ErrorKind::InvalidRequest,
        _ => ErrorKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_context() -> ConvContext {
        ConvContext::new("test-conv", PathBuf::from("/tmp"), "test-model", 128_000)
    }

    #[test]
    fn test_idle_to_llm_requesting() {
        let result = transition(
            &ConvState::Idle,
            &test_context(),
            Event::UserMessage {
                text: "Hello".to_string(),
                images: vec![],
                message_id: "test-message-id".to_string(),
            },
        )
        .unwrap();

        assert!(matches!(
            result.new_state,
            ConvState::LlmRequesting { attempt: 1 }
        ));
        assert!(!result.effects.is_empty());
    }

    #[test]
    fn test_reject_message_while_busy() {
        let result = transition(
            &ConvState::LlmRequesting { attempt: 1 },
            &test_context(),
            Event::UserMessage {
                text: "Hello".to_string(),
                images: vec![],
                message_id: "test-message-id".to_string(),
            },
        );

        assert!(matches!(result, Err(TransitionError::AgentBusy)));
    }

    #[test]
    fn test_error_recovery() {
        let result = transition(
            &ConvState::Error {
                message: "Previous error".to_string(),
                error_kind: ErrorKind::Network,
            },
            &test_context(),
            Event::UserMessage {
                text: "Try again".to_string(),
                images: vec![],
                message_id: "test-message-id".to_string(),
            },
        )
        .unwrap();

        assert!(matches!(
            result.new_state,
            ConvState::LlmRequesting { attempt: 1 }
        ));
    }

    #[test]
    fn test_cancellation_produces_synthetic_results() {
        use crate::state_machine::state::{BashInput, BashMode, ToolCall, ToolInput};

        let result = transition(
            &ConvState::ToolExecuting {
                current_tool: ToolCall::new(
                    "tool-1",
                    ToolInput::Bash(BashInput {
                        command: "echo 1".to_string(),
                        mode: BashMode::Default,
                    }),
                ),
                remaining_tools: vec![
                    ToolCall::new(
                        "tool-2",
                        ToolInput::Bash(BashInput {
                            command: "echo 2".to_string(),
                            mode: BashMode::Default,
                        }),
                    ),
                    ToolCall::new(
                        "tool-3",
                        ToolInput::Bash(BashInput {
                            command: "echo 3".to_string(),
                            mode: BashMode::Default,
                        }),
                    ),
                ],
                persisted_tool_ids: HashSet::new(),
            },
            &test_context(),
            Event::UserCancel,
        )
        .unwrap();

        assert!(
            matches!(result.new_state, ConvState::CancellingTool { .. }),
            "Should transition to CancellingTool"
        );
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::AbortTool { .. })));

        let result2 = transition(
            &result.new_state,
            &test_context(),
            Event::ToolAborted {
                tool_use_id: "tool-1".to_string(),
            },
        )
        .unwrap();

        assert!(matches!(result2.new_state, ConvState::Idle));
        assert!(result2
            .effects
            .iter()
            .any(|e| matches!(e, Effect::PersistToolResults { .. })));
    }

    #[test]
    fn test_duplicate_persist_validation_fails() {
        let mut already_persisted = HashSet::new();
        already_persisted.insert("tool-1".to_string());

        let state = ConvState::CancellingTool {
            tool_use_id: "tool-1".to_string(),
            skipped_tools: vec![],
            persisted_tool_ids: already_persisted,
        };

        let result = transition(
            &state,
            &test_context(),
            Event::ToolAborted {
                tool_use_id: "tool-1".to_string(),
            },
        );

        assert!(
            matches!(result, Err(TransitionError::InvalidTransition(_))),
            "Should fail with InvalidTransition due to duplicate persist"
        );
    }

    #[test]
    fn test_compaction_round_trip() {
        let result = transition(
            &ConvState::Idle,
            &test_context(),
            Event::CompactRequested {
                custom_instructions: None,
            },
        )
        .unwrap();
        assert!(matches!(result.new_state, ConvState::Compacting { .. }));

        let result2 = transition(
            &result.new_state,
            &test_context(),
            Event::CompactComplete {
                summary: "conversation summary".to_string(),
            },
        )
        .unwrap();
        assert!(matches!(result2.new_state, ConvState::Idle));
    }
}
