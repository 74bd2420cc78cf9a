//! Property-based tests for the state machine.
//!
//! These verify invariants hold across randomly generated event sequences.

#![allow(clippy::collapsible_if)]
#![allow(clippy::single_match_else)]

use super::state::*;
use super::transition::*;
use super::*;
use crate::domain::{ErrorKind, ToolResult};
use crate::llm::{ContentBlock, Usage};
use proptest::prelude::*;
use std::collections::HashSet;
use std::path::PathBuf;

fn test_context() -> ConvContext {
    ConvContext::new("test-conv", PathBuf::from("/tmp"), "test-model", 128_000)
}

fn arb_bash_mode() -> impl Strategy<Value = BashMode> {
    prop_oneof![
        Just(BashMode::Default),
        Just(BashMode::Slow),
        Just(BashMode::Background),
    ]
}

fn arb_bash_input() -> impl Strategy<Value = BashInput> {
    ("[a-z ]{1,20}", arb_bash_mode()).prop_map(|(command, mode)| BashInput { command, mode })
}

fn arb_think_input() -> impl Strategy<Value = ThinkInput> {
    "[a-zA-Z ]{1,50}".prop_map(|thoughts| ThinkInput { thoughts })
}

fn arb_tool_input() -> impl Strategy<Value = ToolInput> {
    prop_oneof![
        arb_bash_input().prop_map(ToolInput::Bash),
        arb_think_input().prop_map(ToolInput::Think),
    ]
}

fn arb_tool_call() -> impl Strategy<Value = ToolCall> {
    ("[a-z]{8}", arb_tool_input()).prop_map(|(id, input)| ToolCall::new(id, input))
}

fn arb_tool_result() -> impl Strategy<Value = ToolResult> {
    ("[a-z]{8}", any::<bool>(), "[a-zA-Z0-9 ]{0,50}").prop_map(|(id, is_error, output)| {
        ToolResult {
            tool_use_id: id,
            output,
            is_error,
            display_data: None,
        }
    })
}

fn arb_error_kind() -> impl Strategy<Value = ErrorKind> {
    prop_oneof![
        Just(ErrorKind::Network),
        Just(ErrorKind::RateLimit),
        Just(ErrorKind::Auth),
        Just(ErrorKind::InvalidRequest),
        Just(ErrorKind::Unknown),
    ]
}

fn arb_idle_state() -> impl Strategy<Value = ConvState> {
    Just(ConvState::Idle)
}

fn arb_llm_requesting_state() -> impl Strategy<Value = ConvState> {
    (1u32..5).prop_map(|attempt| ConvState::LlmRequesting { attempt })
}

fn arb_tool_executing_state() -> impl Strategy<Value = ConvState> {
    (
        arb_tool_call(),
        proptest::collection::vec(arb_tool_call(), 0..3),
        proptest::collection::vec("[a-z]{8}".prop_map(String::from), 0..3),
    )
        .prop_map(|(current_tool, remaining_tools, persisted_ids)| {
            ConvState::ToolExecuting {
                current_tool,
                remaining_tools,
                persisted_tool_ids: persisted_ids.into_iter().collect(),
            }
        })
}

fn arb_error_state() -> impl Strategy<Value = ConvState> {
    ("[a-zA-Z ]{1,30}", arb_error_kind()).prop_map(|(message, error_kind)| ConvState::Error {
        message,
        error_kind,
    })
}

fn arb_cancelling_tool_state() -> impl Strategy<Value = ConvState> {
    (
        "[a-z]{8}",
        proptest::collection::vec(arb_tool_call(), 0..3),
        proptest::collection::vec("[a-z]{8}".prop_map(String::from), 0..3),
    )
        .prop_map(|(tool_use_id, skipped_tools, persisted_ids)| {
            ConvState::CancellingTool {
                tool_use_id,
                skipped_tools,
                persisted_tool_ids: persisted_ids.into_iter().collect(),
            }
        })
}

fn arb_state() -> impl Strategy<Value = ConvState> {
    prop_oneof![
        arb_idle_state(),
        arb_llm_requesting_state(),
        arb_tool_executing_state(),
        arb_error_state(),
        Just(ConvState::CancellingLlm),
        arb_cancelling_tool_state(),
    ]
}

fn arb_working_state() -> impl Strategy<Value = ConvState> {
    prop_oneof![arb_llm_requesting_state(), arb_tool_executing_state()]
}

fn arb_busy_state() -> impl Strategy<Value = ConvState> {
    prop_oneof![
        arb_working_state(),
        Just(ConvState::CancellingLlm),
        arb_cancelling_tool_state(),
    ]
}

fn arb_user_message_event() -> impl Strategy<Value = Event> {
    "[a-zA-Z ]{1,30}".prop_map(|text| Event::UserMessage {
        text,
        images: vec![],
        message_id: uuid::Uuid::new_v4().to_string(),
    })
}

fn arb_llm_response_event() -> impl Strategy<Value = Event> {
    proptest::collection::vec(arb_tool_call(), 0..3).prop_map(|tool_calls| Event::LlmResponse {
        content: vec![ContentBlock::text("response")],
        tool_calls,
        end_turn: true,
        usage: Usage::default(),
    })
}

fn arb_tool_complete_event() -> impl Strategy<Value = Event> {
    arb_tool_result().prop_map(|result| Event::ToolComplete {
        tool_use_id: result.tool_use_id.clone(),
        result,
    })
}

fn arb_llm_error_event() -> impl Strategy<Value = Event> {
    ("[a-zA-Z ]{1,30}", arb_error_kind(), 1u32..5).prop_map(|(message, error_kind, attempt)| {
        Event::LlmError {
            message,
            error_kind,
            attempt,
        }
    })
}

fn arb_retry_timeout_event() -> impl Strategy<Value = Event> {
    (1u32..5).prop_map(|attempt| Event::RetryTimeout { attempt })
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        arb_user_message_event(),
        arb_llm_response_event(),
        arb_tool_complete_event(),
        arb_llm_error_event(),
        arb_retry_timeout_event(),
        Just(Event::UserCancel),
    ]
}

fn is_valid_state(state: &ConvState) -> bool {
    match state {
        ConvState::ToolExecuting {
            current_tool,
            remaining_tools,
            ..
        } => {
            let mut ids: Vec<_> = std::iter::once(&current_tool.id)
                .chain(remaining_tools.iter().map(|t| &t.id))
                .collect();
            let len = ids.len();
            ids.sort();
            ids.dedup();
            ids.len() == len
        }
        ConvState::LlmRequesting { attempt } => *attempt >= 1 && *attempt <= 10,
        _ => true,
    }
}

fn effects_are_valid(effects: &[Effect], new_state: &ConvState) -> bool {
    let has_execute = effects
        .iter()
        .any(|e| matches!(e, Effect::ExecuteTool { .. }));
    let has_request_llm = effects.iter().any(|e| matches!(e, Effect::RequestLlm));

    if has_execute && !matches!(new_state, ConvState::ToolExecuting { .. }) {
        return false;
    }
    if has_request_llm && !matches!(new_state, ConvState::LlmRequesting { .. }) {
        return false;
    }
    true
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    #[test]
    fn prop_transitions_preserve_validity(events in proptest::collection::vec(arb_event(), 0..20)) {
        let mut state = ConvState::Idle;
        let ctx = test_context();

        for event in events {
            if let Ok(result) = transition(&state, &ctx, event) {
                state = result.new_state;
                prop_assert!(is_valid_state(&state), "Invalid state: {:?}", state);
                prop_assert!(
                    effects_are_valid(&result.effects, &state),
                    "Invalid effects for state {:?}: {:?}",
                    state,
                    result.effects
                );
            }
        }
    }

    #[test]
    fn prop_error_always_recoverable(message in "[a-zA-Z ]{1,30}", kind in arb_error_kind()) {
        let state = ConvState::Error { message, error_kind: kind };
        let event = Event::UserMessage {
            text: "retry".to_string(),
            images: vec![],
            message_id: uuid::Uuid::new_v4().to_string(),
        };

        let result = transition(&state, &test_context(), event);
        prop_assert!(result.is_ok(), "Error recovery failed: {:?}", result);
        prop_assert!(matches!(result.unwrap().new_state, ConvState::LlmRequesting { .. }));
    }

    #[test]
    fn prop_cancel_stops_work(state in arb_working_state()) {
        let result = transition(&state, &test_context(), Event::UserCancel);
        prop_assert!(result.is_ok(), "Cancel failed: {:?}", result);
        let new_state = result.unwrap().new_state;
        prop_assert!(
            matches!(new_state, ConvState::CancellingLlm | ConvState::CancellingTool { .. }),
            "Should reach a cancelling state, got {:?}", new_state
        );
    }

    #[test]
    fn prop_tool_complete_with_matching_id_succeeds(
        current in arb_tool_call(),
        remaining in proptest::collection::vec(arb_tool_call(), 0..3),
        persisted_ids in proptest::collection::vec("[a-z]{8}".prop_map(String::from), 0..3),
        result_output in "[a-zA-Z0-9 ]{0,50}",
        result_is_error in any::<bool>()
    ) {
        let state = ConvState::ToolExecuting {
            current_tool: current.clone(),
            remaining_tools: remaining,
            persisted_tool_ids: persisted_ids.into_iter().collect(),
        };
        let event = Event::ToolComplete {
            tool_use_id: current.id.clone(),
            result: ToolResult {
                tool_use_id: current.id,
                output: result_output,
                is_error: result_is_error,
                display_data: None,
            },
        };

        let trans_result = transition(&state, &test_context(), event);
        prop_assert!(trans_result.is_ok(), "Tool completion failed: {:?}", trans_result);
    }

    #[test]
    fn prop_busy_rejects_messages(state in arb_busy_state()) {
        let event = Event::UserMessage {
            text: "hi".to_string(),
            images: vec![],
            message_id: uuid::Uuid::new_v4().to_string(),
        };
        let result = transition(&state, &test_context(), event);
        prop_assert!(result.is_err(), "Busy state should reject messages, got {:?}", result);
    }

    #[test]
    fn prop_state_changes_persist(state in arb_state(), event in arb_event()) {
        if let Ok(result) = transition(&state, &test_context(), event) {
            if result.new_state != state {
                prop_assert!(
                    result.effects.iter().any(|e| matches!(e, Effect::PersistState)),
                    "State changed but no PersistState effect: {:?} -> {:?}", state, result.new_state
                );
            }
        }
    }

    #[test]
    fn prop_idle_accepts_messages(text in "[a-zA-Z ]{1,30}") {
        let state = ConvState::Idle;
        let event = Event::UserMessage {
            text,
            images: vec![],
            message_id: uuid::Uuid::new_v4().to_string(),
        };

        let result = transition(&state, &test_context(), event);
        prop_assert!(result.is_ok(), "Idle should accept messages: {:?}", result);
        prop_assert!(matches!(result.unwrap().new_state, ConvState::LlmRequesting { attempt: 1 }));
    }

    #[test]
    fn prop_llm_response_without_tools_goes_idle(attempt in 1u32..5) {
        let state = ConvState::LlmRequesting { attempt };
        let event = Event::LlmResponse {
            content: vec![ContentBlock::text("Hello")],
            tool_calls: vec![],
            end_turn: true,
            usage: Usage::default(),
        };

        let result = transition(&state, &test_context(), event);
        prop_assert!(result.is_ok());
        prop_assert!(matches!(result.unwrap().new_state, ConvState::Idle));
    }

    #[test]
    fn prop_llm_response_with_tools_executes(
        attempt in 1u32..5,
        tool_calls in proptest::collection::vec(arb_tool_call(), 1..4)
    ) {
        let state = ConvState::LlmRequesting { attempt };
        let event = Event::LlmResponse {
            content: vec![],
            tool_calls: tool_calls.clone(),
            end_turn: false,
            usage: Usage::default(),
        };

        let result = transition(&state, &test_context(), event);
        prop_assert!(result.is_ok());

        match result.unwrap().new_state {
            ConvState::ToolExecuting { current_tool, remaining_tools, .. } => {
                prop_assert_eq!(&current_tool.id, &tool_calls[0].id);
                prop_assert_eq!(remaining_tools.len(), tool_calls.len() - 1);
            }
            other => prop_assert!(false, "Should be ToolExecuting, got {:?}", other),
        }
    }

    #[test]
    fn prop_retryable_error_increments_attempt(attempt in 1u32..3, message in "[a-zA-Z ]{1,30}") {
        let state = ConvState::LlmRequesting { attempt };
        let event = Event::LlmError { message, error_kind: ErrorKind::Network, attempt };

        let result = transition(&state, &test_context(), event);
        prop_assert!(result.is_ok());

        match result.unwrap().new_state {
            ConvState::LlmRequesting { attempt: new_attempt } => {
                prop_assert_eq!(new_attempt, attempt + 1);
            }
            other => prop_assert!(false, "Should stay in LlmRequesting, got {:?}", other),
        }
    }

    #[test]
    fn prop_non_retryable_error_goes_to_error(attempt in 1u32..5, message in "[a-zA-Z ]{1,30}") {
        let state = ConvState::LlmRequesting { attempt };
        let error_kind = ErrorKind::Auth;
        let event = Event::LlmError { message, error_kind, attempt };

        let result = transition(&state, &test_context(), event);
        prop_assert!(result.is_ok());

        match result.unwrap().new_state {
            ConvState::Error { error_kind: ek, .. } => prop_assert_eq!(ek, error_kind),
            s => prop_assert!(false, "Should be Error state, got {:?}", s),
        }
    }

    #[test]
    fn prop_exhausted_retries_go_to_error(message in "[a-zA-Z ]{1,30}") {
        let state = ConvState::LlmRequesting { attempt: 3 };
        let event = Event::LlmError { message, error_kind: ErrorKind::Network, attempt: 3 };

        let result = transition(&state, &test_context(), event);
        prop_assert!(result.is_ok());
        prop_assert!(matches!(result.unwrap().new_state, ConvState::Error { .. }));
    }

    #[test]
    fn prop_retry_timeout_triggers_llm_request(attempt in 1u32..5) {
        let state = ConvState::LlmRequesting { attempt };
        let event = Event::RetryTimeout { attempt };

        let result = transition(&state, &test_context(), event);
        prop_assert!(result.is_ok());

        let tr = result.unwrap();
        prop_assert!(matches!(tr.new_state, ConvState::LlmRequesting { .. }));
        prop_assert!(tr.effects.iter().any(|e| matches!(e, Effect::RequestLlm)));
    }

    #[test]
    fn prop_cancelling_llm_plus_response_goes_idle(_dummy in Just(())) {
        let state = ConvState::CancellingLlm;
        let event = Event::LlmResponse {
            content: vec![ContentBlock::text("response")],
            tool_calls: vec![],
            end_turn: true,
            usage: Usage::default(),
        };

        let result = transition(&state, &test_context(), event);
        prop_assert!(result.is_ok());
        prop_assert!(matches!(result.unwrap().new_state, ConvState::Idle));
    }

    #[test]
    fn prop_cancelling_llm_plus_aborted_goes_idle(_dummy in Just(())) {
        let state = ConvState::CancellingLlm;
        let result = transition(&state, &test_context(), Event::LlmAborted);
        prop_assert!(result.is_ok());
        prop_assert!(matches!(result.unwrap().new_state, ConvState::Idle));
    }

    #[test]
    fn prop_llm_cancel_goes_to_cancelling(_dummy in Just(())) {
        let state = ConvState::LlmRequesting { attempt: 1 };
        let result = transition(&state, &test_context(), Event::UserCancel);
        prop_assert!(result.is_ok());

        let tr = result.unwrap();
        prop_assert!(matches!(tr.new_state, ConvState::CancellingLlm));
        prop_assert!(tr.effects.iter().any(|e| matches!(e, Effect::AbortLlm)));
    }

    #[test]
    fn prop_tool_cancel_goes_to_cancelling(
        current in arb_tool_call(),
        remaining in proptest::collection::vec(arb_tool_call(), 0..3),
        persisted_ids in proptest::collection::vec("[a-z]{8}".prop_map(String::from), 0..3)
    ) {
        let state = ConvState::ToolExecuting {
            current_tool: current.clone(),
            remaining_tools: remaining.clone(),
            persisted_tool_ids: persisted_ids.into_iter().collect(),
        };

        let result = transition(&state, &test_context(), Event::UserCancel);
        prop_assert!(result.is_ok());

        let tr = result.unwrap();
        match &tr.new_state {
            ConvState::CancellingTool { tool_use_id, skipped_tools, .. } => {
                prop_assert_eq!(tool_use_id, &current.id);
                prop_assert_eq!(skipped_tools.len(), remaining.len());
            }
            s => prop_assert!(false, "Expected CancellingTool, got {:?}", s),
        }

        prop_assert!(tr.effects.iter().any(
            |e| matches!(e, Effect::AbortTool { tool_use_id } if tool_use_id == &current.id)
        ));
    }

    #[test]
    fn prop_cancelling_tool_aborted_goes_idle(
        tool_use_id in "[a-z]{8}",
        skipped in proptest::collection::vec(arb_tool_call(), 0..3),
        other_persisted in proptest::collection::vec("[A-Z]{8}".prop_map(String::from), 0..3)
    ) {
        let state = ConvState::CancellingTool {
            tool_use_id: tool_use_id.clone(),
            skipped_tools: skipped.clone(),
            persisted_tool_ids: other_persisted.into_iter().collect(),
        };

        let result = transition(
            &state,
            &test_context(),
            Event::ToolAborted { tool_use_id: tool_use_id.clone() },
        );
        prop_assert!(result.is_ok());

        let tr = result.unwrap();
        prop_assert!(matches!(tr.new_state, ConvState::Idle));

        let persist = tr.effects.iter().find(|e| matches!(e, Effect::PersistToolResults { .. }));
        prop_assert!(persist.is_some());

        if let Some(Effect::PersistToolResults { results }) = persist {
            prop_assert_eq!(results.len(), 1 + skipped.len());
        }
    }

    #[test]
    fn prop_cancelling_tool_complete_uses_synthetic(
        tool_use_id in "[a-z]{8}",
        skipped in proptest::collection::vec(arb_tool_call(), 0..3),
        other_persisted in proptest::collection::vec("[A-Z]{8}".prop_map(String::from), 0..3)
    ) {
        let state = ConvState::CancellingTool {
            tool_use_id: tool_use_id.clone(),
            skipped_tools: skipped,
            persisted_tool_ids: other_persisted.into_iter().collect(),
        };

        let actual_result = ToolResult {
            tool_use_id: tool_use_id.clone(),
            output: "actual output that should be discarded".to_string(),
            is_error: false,
            display_data: None,
        };

        let result = transition(
            &state,
            &test_context(),
            Event::ToolComplete { tool_use_id: tool_use_id.clone(), result: actual_result },
        );
        prop_assert!(result.is_ok());

        let tr = result.unwrap();
        prop_assert!(matches!(tr.new_state, ConvState::Idle));

        if let Some(Effect::PersistToolResults { results }) =
            tr.effects.iter().find(|e| matches!(e, Effect::PersistToolResults { .. }))
        {
            let our_result = results.iter().find(|r| r.tool_use_id == tool_use_id);
            prop_assert!(our_result.is_some());
            prop_assert!(our_result.unwrap().is_error, "Cancelled tool should be marked as error");
        }
    }

    #[test]
    fn prop_tool_complete_wrong_id_fails(
        current in arb_tool_call(),
        remaining in proptest::collection::vec(arb_tool_call(), 0..3),
        persisted_ids in proptest::collection::vec("[a-z]{8}".prop_map(String::from), 0..3)
    ) {
        let state = ConvState::ToolExecuting {
            current_tool: current.clone(),
            remaining_tools: remaining,
            persisted_tool_ids: persisted_ids.into_iter().collect(),
        };
        let event = Event::ToolComplete {
            tool_use_id: "wrong-id".to_string(),
            result: ToolResult {
                tool_use_id: "wrong-id".to_string(),
                output: "output".to_string(),
                is_error: false,
                display_data: None,
            },
        };

        let result = transition(&state, &test_context(), event);
        prop_assert!(result.is_err(), "Should reject tool completion with wrong ID");
    }

    #[test]
    fn prop_duplicate_persist_detected(
        tool_use_id in "[a-z]{8}",
        skipped in proptest::collection::vec(arb_tool_call(), 0..3)
    ) {
        let mut persisted = HashSet::new();
        persisted.insert(tool_use_id.clone());

        let state = ConvState::CancellingTool {
            tool_use_id: tool_use_id.clone(),
            skipped_tools: skipped,
            persisted_tool_ids: persisted,
        };

        let result = transition(
            &state,
            &test_context(),
            Event::ToolAborted { tool_use_id: tool_use_id.clone() },
        );

        prop_assert!(result.is_err(), "Should fail when tool_use_id is already persisted");
    }

    #[test]
    fn prop_no_duplicate_persist_succeeds(
        tool_use_id in "[a-z]{8}",
        skipped in proptest::collection::vec(arb_tool_call(), 0..3),
        other_persisted in proptest::collection::vec("[A-Z]{8}".prop_map(String::from), 0..3)
    ) {
        let persisted: HashSet<String> = other_persisted.into_iter().collect();
        let skipped_filtered: Vec<_> = skipped.into_iter()
            .filter(|t| !persisted.contains(&t.id))
            .collect();

        let state = ConvState::CancellingTool {
            tool_use_id: tool_use_id.clone(),
            skipped_tools: skipped_filtered,
            persisted_tool_ids: persisted,
        };

        let result = transition(
            &state,
            &test_context(),
            Event::ToolAborted { tool_use_id: tool_use_id.clone() },
        );

        prop_assert!(result.is_ok(), "Should succeed when no duplicates would occur: {:?}", result);
    }
}

#[test]
fn test_complete_tool_cycle() {
    let ctx = test_context();
    let mut state = ConvState::Idle;

    let result = transition(
        &state,
        &ctx,
        Event::UserMessage {
            text: "run ls".to_string(),
            images: vec![],
            message_id: uuid::Uuid::new_v4().to_string(),
        },
    )
    .unwrap();
    state = result.new_state;
    assert!(matches!(state, ConvState::LlmRequesting { attempt: 1 }));
    assert!(result.effects.iter().any(|e| matches!(e, Effect::RequestLlm)));

    let tool = ToolCall::new(
        "tool-123",
        ToolInput::Bash(BashInput { command: "ls".to_string(), mode: BashMode::Default }),
    );
    let result = transition(
        &state,
        &ctx,
        Event::LlmResponse {
            content: vec![ContentBlock::text("I'll run ls")],
            tool_calls: vec![tool.clone()],
            end_turn: false,
            usage: Usage::default(),
        },
    )
    .unwrap();
    state = result.new_state;
    assert!(matches!(state, ConvState::ToolExecuting { .. }));
    assert!(result.effects.iter().any(|e| matches!(e, Effect::ExecuteTool { .. })));

    let result = transition(
        &state,
        &ctx,
        Event::ToolComplete {
            tool_use_id: "tool-123".to_string(),
            result: ToolResult {
                tool_use_id: "tool-123".to_string(),
                output: "file1 file2".to_string(),
                is_error: false,
                display_data: None,
            },
        },
    )
    .unwrap();
    state = result.new_state;
    assert!(matches!(state, ConvState::LlmRequesting { attempt: 1 }));

    let result = transition(
        &state,
        &ctx,
        Event::LlmResponse {
            content: vec![ContentBlock::text("Found file1 and file2")],
            tool_calls: vec![],
            end_turn: true,
            usage: Usage::default(),
        },
    )
    .unwrap();
    assert!(matches!(result.new_state, ConvState::Idle));
}

#[test]
fn test_retry_cycle() {
    let ctx = test_context();
    let state = ConvState::LlmRequesting { attempt: 1 };

    let result = transition(
        &state,
        &ctx,
        Event::LlmError {
            message: "connection reset".to_string(),
            error_kind: ErrorKind::Network,
            attempt: 1,
        },
    )
    .unwrap();
    let state = result.new_state;
    assert!(matches!(state, ConvState::LlmRequesting { attempt: 2 }));
    assert!(result.effects.iter().any(|e| matches!(e, Effect::ScheduleRetry { .. })));

    let result = transition(&state, &ctx, Event::RetryTimeout { attempt: 2 }).unwrap();
    let state = result.new_state;
    assert!(matches!(state, ConvState::LlmRequesting { attempt: 2 }));
    assert!(result.effects.iter().any(|e| matches!(e, Effect::RequestLlm)));

    let result = transition(
        &state,
        &ctx,
        Event::LlmResponse {
            content: vec![ContentBlock::text("Success!")],
            tool_calls: vec![],
            end_turn: true,
            usage: Usage::default(),
        },
    )
    .unwrap();
    assert!(matches!(result.new_state, ConvState::Idle));
}

#[test]
fn test_cancel_mid_tool_chain() {
    let ctx = test_context();

    let mut persisted = HashSet::new();
    persisted.insert("t1".to_string());

    let state = ConvState::ToolExecuting {
        current_tool: ToolCall::new(
            "t2",
            ToolInput::Bash(BashInput { command: "sleep 10".to_string(), mode: BashMode::Default }),
        ),
        remaining_tools: vec![
            ToolCall::new("t3", ToolInput::Bash(BashInput { command: "echo 3".to_string(), mode: BashMode::Default })),
            ToolCall::new("t4", ToolInput::Bash(BashInput { command: "echo 4".to_string(), mode: BashMode::Default })),
        ],
        persisted_tool_ids: persisted,
    };

    let result = transition(&state, &ctx, Event::UserCancel).unwrap();
    assert!(matches!(result.new_state, ConvState::CancellingTool { .. }));
    assert!(result.effects.iter().any(|e| matches!(e, Effect::AbortTool { .. })));

    let result2 = transition(
        &result.new_state,
        &ctx,
        Event::ToolAborted { tool_use_id: "t2".to_string() },
    )
    .unwrap();
    assert!(matches!(result2.new_state, ConvState::Idle));

    if let Some(Effect::PersistToolResults { results }) =
        result2.effects.iter().find(|e| matches!(e, Effect::PersistToolResults { .. }))
    {
        assert_eq!(results.len(), 3, "aborted (t2) + skipped (t3, t4)");
        assert!(results.iter().all(|r| r.is_error));
    }
}

#[test]
fn test_compaction_busy_is_rejected() {
    let ctx = test_context();
    let state = ConvState::ToolExecuting {
        current_tool: ToolCall::new("t1", ToolInput::Think(ThinkInput { thoughts: "x".into() })),
        remaining_tools: vec![],
        persisted_tool_ids: HashSet::new(),
    };
    let result = transition(&state, &ctx, Event::CompactRequested { custom_instructions: None });
    assert!(matches!(result, Err(TransitionError::AgentBusy)));
}
