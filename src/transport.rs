//! Session Transport (C1): a thin abstraction over one streaming LLM
//! session. `LlmSessionTransport` wraps the pruned `state_machine` plus
//! `llm`/`tools`, adapted from the teacher's conversation-runtime actor: a
//! background task owns the `ConvState`/`ConvContext` pair and drives it
//! through `state_machine::transition`, translating `Effect`s into LLM/tool
//! side effects and a broadcast of `SessionEvent`s.

use crate::domain::{ErrorKind, ImageData, ToolResult};
use crate::llm::{
    ContentBlock, LlmMessage, LlmRequest, LlmService, MessageRole as LlmMessageRole,
    SystemContent,
};
use crate::state_machine::{self, ConvContext, ConvState, Event, ToolCall, ToolInput};
use crate::tools::{ToolContext, ToolRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is already streaming")]
    AlreadyStreaming,
    #[error("transport has been disposed")]
    Disposed,
    #[error("internal channel closed")]
    ChannelClosed,
}

/// Event vocabulary delivered to `subscribe`, exactly the set in spec §4.1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    AgentStart,
    AgentEnd,
    TurnStart,
    TurnEnd,
    MessageStart {
        role: SessionMessageRole,
        message_id: String,
    },
    MessageUpdate {
        message_id: String,
        text: String,
    },
    MessageEnd {
        role: SessionMessageRole,
        message_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    ToolExecutionStart {
        tool_use_id: String,
        tool_name: String,
    },
    ToolExecutionUpdate {
        tool_use_id: String,
    },
    ToolExecutionEnd {
        tool_use_id: String,
        is_error: bool,
    },
    AutoCompactionStart,
    AutoCompactionEnd {
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    AutoRetryStart {
        attempt: u32,
    },
    AutoRetryEnd {
        attempt: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ContextUsageReport {
    pub tokens: u64,
    pub context_window: u64,
    pub percent: f64,
}

/// Contract the rest of the system depends on (spec §4.1).
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn prompt(&self, text: String, images: Vec<ImageData>) -> Result<(), TransportError>;
    async fn send_user_message(
        &self,
        text: String,
        images: Vec<ImageData>,
    ) -> Result<(), TransportError>;
    async fn steer(&self, text: String, images: Vec<ImageData>) -> Result<(), TransportError>;
    async fn compact(&self, custom_instructions: Option<String>) -> Result<(), TransportError>;
    async fn abort(&self) -> Result<(), TransportError>;
    fn get_context_usage(&self) -> Option<ContextUsageReport>;
    fn is_streaming(&self) -> bool;
    fn is_compacting(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
    async fn dispose(&self);
}

struct SharedFlags {
    streaming: AtomicBool,
    compacting: AtomicBool,
    context_usage: Mutex<Option<ContextUsageReport>>,
}

/// Production `SessionTransport`, grounded on the teacher's conversation
/// runtime actor.
pub struct LlmSessionTransport {
    event_tx: mpsc::UnboundedSender<Event>,
    broadcast_tx: broadcast::Sender<SessionEvent>,
    flags: Arc<SharedFlags>,
    cancel: CancellationToken,
}

impl LlmSessionTransport {
    pub fn new(
        ctx: ConvContext,
        llm: Arc<dyn LlmService>,
        tool_registry: Arc<ToolRegistry>,
        llm_registry: Arc<crate::llm::ModelRegistry>,
        system_prompt: String,
        session_log_path: PathBuf,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();
        let (broadcast_tx, _) = broadcast::channel::<SessionEvent>(256);
        let flags = Arc::new(SharedFlags {
            streaming: AtomicBool::new(false),
            compacting: AtomicBool::new(false),
            context_usage: Mutex::new(None),
        });
        let cancel = CancellationToken::new();

        tokio::spawn(run_loop(
            event_rx,
            event_tx.clone(),
            broadcast_tx.clone(),
            ctx,
            llm,
            tool_registry,
            llm_registry,
            system_prompt,
            session_log_path,
            Arc::clone(&flags),
            cancel.clone(),
        ));

        Self {
            event_tx,
            broadcast_tx,
            flags,
            cancel,
        }
    }

    fn send(&self, event: Event) -> Result<(), TransportError> {
        self.event_tx
            .send(event)
            .map_err(|_| TransportError::ChannelClosed)
    }
}

#[async_trait]
impl SessionTransport for LlmSessionTransport {
    async fn prompt(&self, text: String, images: Vec<ImageData>) -> Result<(), TransportError> {
        if self.is_streaming() {
            return Err(TransportError::AlreadyStreaming);
        }
        self.send(Event::UserMessage {
            text,
            images,
            message_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    async fn send_user_message(
        &self,
        text: String,
        images: Vec<ImageData>,
    ) -> Result<(), TransportError> {
        self.prompt(text, images).await
    }

    async fn steer(&self, text: String, images: Vec<ImageData>) -> Result<(), TransportError> {
        // Steering never fails due to "already streaming" (spec §4.1): the
        // message is accepted unconditionally and woven in as the next
        // turn once the live stream completes.
        self.send(Event::UserMessage {
            text,
            images,
            message_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    async fn compact(&self, custom_instructions: Option<String>) -> Result<(), TransportError> {
        self.send(Event::CompactRequested { custom_instructions })
    }

    async fn abort(&self) -> Result<(), TransportError> {
        self.send(Event::UserCancel)
    }

    fn get_context_usage(&self) -> Option<ContextUsageReport> {
        *self.flags.context_usage.lock().unwrap()
    }

    fn is_streaming(&self) -> bool {
        self.flags.streaming.load(Ordering::SeqCst)
    }

    fn is_compacting(&self) -> bool {
        self.flags.compacting.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.broadcast_tx.subscribe()
    }

    async fn dispose(&self) {
        self.cancel.cancel();
    }
}

struct SessionLog {
    file: std::fs::File,
}

impl SessionLog {
    fn open(path: &PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Append one `SessionEvent` as a JSON line, flushed synchronously so a
    /// crash mid-stream loses at most the in-flight line (spec §4.1
    /// ambient session log).
    fn append(&mut self, event: &SessionEvent, timestamp: DateTime<Utc>) {
        #[derive(Serialize)]
        struct LogLine<'a> {
            timestamp: DateTime<Utc>,
            #[serde(flatten)]
            event: &'a SessionEvent,
        }
        if let Ok(mut line) = serde_json::to_string(&LogLine { timestamp, event }) {
            line.push('\n');
            let _ = self.file.write_all(line.as_bytes());
            let _ = self.file.sync_data();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    mut event_rx: mpsc::UnboundedReceiver<Event>,
    event_tx: mpsc::UnboundedSender<Event>,
    broadcast_tx: broadcast::Sender<SessionEvent>,
    ctx: ConvContext,
    llm: Arc<dyn LlmService>,
    tool_registry: Arc<ToolRegistry>,
    llm_registry: Arc<crate::llm::ModelRegistry>,
    system_prompt: String,
    session_log_path: PathBuf,
    flags: Arc<SharedFlags>,
    cancel: CancellationToken,
) {
    let mut state = ConvState::default();
    let mut history: Vec<LlmMessage> = Vec::new();
    let mut log = SessionLog::open(&session_log_path).ok();
    let tool_cancel = CancellationToken::new();

    let emit = |event: SessionEvent, log: &mut Option<SessionLog>| {
        if let Some(log) = log.as_mut() {
            log.append(&event, Utc::now());
        }
        let _ = broadcast_tx.send(event);
    };

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            maybe_event = event_rx.recv() => {
                let Some(event) = maybe_event else { break };
                let was_streaming = state.is_streaming();
                let lifecycle_source = event.clone();
                match state_machine::transition(&state, &ctx, event) {
                    Ok(result) => {
                        state = result.new_state;
                        flags.streaming.store(state.is_streaming(), Ordering::SeqCst);
                        flags.compacting.store(state.is_compacting(), Ordering::SeqCst);

                        for lifecycle_event in
                            synthesize_lifecycle_events(was_streaming, &lifecycle_source, &state)
                        {
                            emit(lifecycle_event, &mut log);
                        }

                        for effect in result.effects {
                            handle_effect(
                                effect,
                                &event_tx,
                                &mut history,
                                &llm,
                                &tool_registry,
                                &llm_registry,
                                &ctx,
                                &system_prompt,
                                &tool_cancel,
                                &flags,
                                emit,
                                &mut log,
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(conversation_id = %ctx.conversation_id, error = %e, "rejected event");
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_effect(
    effect: state_machine::Effect,
    event_tx: &mpsc::UnboundedSender<Event>,
    history: &mut Vec<LlmMessage>,
    llm: &Arc<dyn LlmService>,
    tool_registry: &Arc<ToolRegistry>,
    llm_registry: &Arc<crate::llm::ModelRegistry>,
    ctx: &ConvContext,
    system_prompt: &str,
    tool_cancel: &CancellationToken,
    flags: &Arc<SharedFlags>,
    emit: impl Fn(SessionEvent, &mut Option<SessionLog>) + Copy,
    log: &mut Option<SessionLog>,
) {
    use state_machine::Effect;

    match effect {
        Effect::PersistMessage { content, .. } => {
            history.push(content_to_llm_message(&content));
        }
        Effect::PersistState | Effect::PersistToolResults { .. } => {}
        Effect::RequestLlm => {
            let llm = Arc::clone(llm);
            let request = LlmRequest {
                system: vec![SystemContent::new(system_prompt.to_string())],
                messages: history.clone(),
                tools: tool_registry.definitions(),
                max_tokens: None,
            };
            let tx = event_tx.clone();
            let flags = Arc::clone(flags);
            let context_window = ctx.context_window as u64;
            emit(SessionEvent::TurnStart, log);
            tokio::spawn(async move {
                match llm.complete(&request).await {
                    Ok(response) => {
                        let tool_calls = response
                            .content
                            .iter()
                            .filter_map(|b| match b {
                                ContentBlock::ToolUse { id, name, input } => {
                                    Some(ToolCall::new(
                                        id.clone(),
                                        ToolInput::from_name_and_value(name, input.clone()),
                                    ))
                                }
                                _ => None,
                            })
                            .collect();
                        let usage = response.usage;
                        let tokens = usage.input_tokens + usage.output_tokens;
                        *flags.context_usage.lock().unwrap() = Some(ContextUsageReport {
                            tokens,
                            context_window,
                            percent: if context_window == 0 {
                                0.0
                            } else {
                                tokens as f64 / context_window as f64
                            },
                        });
                        let _ = tx.send(Event::LlmResponse {
                            content: response.content,
                            tool_calls,
                            end_turn: response.end_turn,
                            usage: crate::domain::UsageData {
                                input_tokens: usage.input_tokens,
                                output_tokens: usage.output_tokens,
                                cache_creation_tokens: usage.cache_creation_tokens,
                                cache_read_tokens: usage.cache_read_tokens,
                            },
                        });
                    }
                    Err(e) => {
                        let _ = tx.send(Event::LlmError {
                            message: e.message,
                            error_kind: llm_error_kind_to_error_kind(e.kind),
                            attempt: 1,
                        });
                    }
                }
            });
        }
        Effect::ExecuteTool { tool } => {
            emit(
                SessionEvent::ToolExecutionStart {
                    tool_use_id: tool.id.clone(),
                    tool_name: tool.name().to_string(),
                },
                log,
            );
            let tools = Arc::clone(tool_registry);
            let tool_ctx = ToolContext::new(
                tool_cancel.clone(),
                ctx.conversation_id.clone(),
                ctx.working_dir.clone(),
                Arc::clone(llm_registry),
            );
            let tx = event_tx.clone();
            let tool_use_id = tool.id.clone();
            let name = tool.name().to_string();
            let input = tool.input.to_value();
            tokio::spawn(async move {
                let output = tools.execute(&name, input, tool_ctx).await;
                let result = match output {
                    Some(out) => ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        output: out.output,
                        is_error: !out.success,
                        display_data: out.display_data,
                    },
                    None => ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        output: format!("unknown tool: {name}"),
                        is_error: true,
                        display_data: None,
                    },
                };
                let _ = tx.send(Event::ToolComplete {
                    tool_use_id,
                    result,
                });
            });
        }
        Effect::AbortTool { tool_use_id } => {
            tool_cancel.cancel();
            let _ = event_tx.send(Event::ToolAborted { tool_use_id });
        }
        Effect::AbortLlm => {
            let _ = event_tx.send(Event::LlmAborted);
        }
        Effect::RunCompaction { custom_instructions } => {
            emit(SessionEvent::AutoCompactionStart, log);
            let summary = summarize_history(history, custom_instructions.as_deref());
            history.clear();
            history.push(LlmMessage {
                role: LlmMessageRole::Assistant,
                content: vec![ContentBlock::text(summary.clone())],
            });
            let _ = event_tx.send(Event::CompactComplete { summary });
        }
        Effect::NotifyClient { event_type, data } => {
            if let Some(session_event) = notify_to_session_event(&event_type, &data) {
                emit(session_event, log);
            }
        }
        Effect::ScheduleRetry { delay, attempt } => {
            let tx = event_tx.clone();
            emit(SessionEvent::AutoRetryStart { attempt }, log);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Event::RetryTimeout { attempt });
            });
        }
    }
}

fn content_to_llm_message(content: &crate::domain::MessageContent) -> LlmMessage {
    use crate::domain::MessageContent;
    match content {
        MessageContent::User { text, images } => LlmMessage {
            role: LlmMessageRole::User,
            content: {
                let mut blocks = vec![ContentBlock::text(text.clone())];
                for image in images {
                    blocks.push(ContentBlock::Image {
                        source: crate::llm::ImageSource::Base64 {
                            media_type: image.media_type.clone(),
                            data: image.data.clone(),
                        },
                    });
                }
                blocks
            },
        },
        MessageContent::Agent { blocks } => LlmMessage {
            role: LlmMessageRole::Assistant,
            content: blocks.clone(),
        },
        MessageContent::Tool {
            tool_use_id,
            output,
            is_error,
        } => LlmMessage {
            role: LlmMessageRole::User,
            content: vec![ContentBlock::tool_result(
                tool_use_id.clone(),
                output.clone(),
                *is_error,
            )],
        },
    }
}

fn summarize_history(history: &[LlmMessage], custom_instructions: Option<&str>) -> String {
    let mut summary = String::from("Conversation summary (auto-compacted):\n");
    for message in history {
        for block in &message.content {
            if let ContentBlock::Text { text } = block {
                summary.push_str("- ");
                summary.push_str(&text.chars().take(200).collect::<String>());
                summary.push('\n');
            }
        }
    }
    if let Some(instructions) = custom_instructions {
        summary.push_str("\nFocus: ");
        summary.push_str(instructions);
    }
    summary
}

fn llm_error_kind_to_error_kind(kind: crate::llm::LlmErrorKind) -> ErrorKind {
    use crate::llm::LlmErrorKind as L;
    match kind {
        L::Network => ErrorKind::Network,
        L::RateLimit => ErrorKind::RateLimit,
        L::Auth => ErrorKind::Auth,
        L::InvalidRequest | L::ServerError => ErrorKind::InvalidRequest,
        L::Unknown => ErrorKind::Unknown,
    }
}

/// Derives the spec §4.1 lifecycle vocabulary (`agent_start`/`agent_end`,
/// `message_start`/`message_end`, `tool_execution_end`) from the bare
/// before/after `ConvState` transition, since the teacher's state machine
/// only tracks its own internal states and knows nothing of that
/// vocabulary. Run once per processed event, in addition to whatever
/// `NotifyClient` effects the transition itself produced.
fn synthesize_lifecycle_events(
    was_streaming: bool,
    event: &state_machine::Event,
    new_state: &ConvState,
) -> Vec<SessionEvent> {
    use state_machine::Event;

    let mut events = Vec::new();

    if let Event::UserMessage { message_id, .. } = event {
        events.push(SessionEvent::MessageStart {
            role: SessionMessageRole::User,
            message_id: message_id.clone(),
        });
    }

    if let Event::ToolComplete { tool_use_id, result } = event {
        events.push(SessionEvent::ToolExecutionEnd {
            tool_use_id: tool_use_id.clone(),
            is_error: result.is_error,
        });
    }

    let now_streaming = new_state.is_streaming();
    if !was_streaming && now_streaming {
        events.push(SessionEvent::AgentStart);
    } else if was_streaming && !now_streaming && !new_state.is_compacting() {
        let (stop_reason, error_message) = match new_state {
            ConvState::Error { message, .. } => (Some("error".to_string()), Some(message.clone())),
            ConvState::Idle if matches!(event, Event::LlmAborted | Event::ToolAborted { .. }) => {
                (Some("cancelled".to_string()), None)
            }
            _ => (None, None),
        };
        events.push(SessionEvent::MessageEnd {
            role: SessionMessageRole::Assistant,
            message_id: uuid::Uuid::new_v4().to_string(),
            stop_reason,
            error_message,
        });
        events.push(SessionEvent::AgentEnd);
    }

    events
}

fn notify_to_session_event(event_type: &str, data: &serde_json::Value) -> Option<SessionEvent> {
    match event_type {
        "turn_start" => Some(SessionEvent::TurnStart),
        "turn_end" => Some(SessionEvent::TurnEnd),
        "tool_execution_start" => Some(SessionEvent::ToolExecutionStart {
            tool_use_id: data.get("tool_use_id")?.as_str()?.to_string(),
            tool_name: data.get("tool_name")?.as_str().unwrap_or_default().to_string(),
        }),
        "auto_retry_start" => Some(SessionEvent::AutoRetryStart {
            attempt: data.get("attempt")?.as_u64().unwrap_or(1) as u32,
        }),
        "auto_retry_end" => Some(SessionEvent::AutoRetryEnd {
            attempt: data.get("attempt")?.as_u64().unwrap_or(1) as u32,
        }),
        "auto_compaction_start" => Some(SessionEvent::AutoCompactionStart),
        "auto_compaction_end" => Some(SessionEvent::AutoCompactionEnd {
            error_message: data
                .get("error_message")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_event_serializes_with_tag() {
        let event = SessionEvent::ToolExecutionStart {
            tool_use_id: "t1".to_string(),
            tool_name: "bash".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_execution_start");
        assert_eq!(json["tool_name"], "bash");
    }

    #[test]
    fn notify_to_session_event_maps_known_types() {
        let event = notify_to_session_event("turn_start", &serde_json::json!({}));
        assert!(matches!(event, Some(SessionEvent::TurnStart)));
    }

    #[test]
    fn notify_to_session_event_ignores_unknown_types() {
        assert!(notify_to_session_event("not_a_real_event", &serde_json::json!({})).is_none());
    }

    #[test]
    fn user_message_synthesizes_start_and_agent_start() {
        let event = state_machine::Event::UserMessage {
            text: "hi".to_string(),
            images: vec![],
            message_id: "m1".to_string(),
        };
        let events = synthesize_lifecycle_events(
            false,
            &event,
            &ConvState::LlmRequesting { attempt: 1 },
        );
        assert!(matches!(
            events[0],
            SessionEvent::MessageStart { role: SessionMessageRole::User, .. }
        ));
        assert!(matches!(events[1], SessionEvent::AgentStart));
    }

    #[test]
    fn turn_completion_synthesizes_message_end_and_agent_end() {
        let event = state_machine::Event::LlmResponse {
            content: vec![],
            tool_calls: vec![],
            end_turn: true,
            usage: crate::llm::Usage::default(),
        };
        let events = synthesize_lifecycle_events(true, &event, &ConvState::Idle);
        assert!(matches!(
            events[0],
            SessionEvent::MessageEnd { role: SessionMessageRole::Assistant, stop_reason: None, .. }
        ));
        assert!(matches!(events[1], SessionEvent::AgentEnd));
    }

    #[test]
    fn error_exhaustion_synthesizes_error_message_end() {
        let event = state_machine::Event::LlmError {
            message: "boom".to_string(),
            error_kind: ErrorKind::Unknown,
            attempt: 3,
        };
        let new_state = ConvState::Error {
            message: "boom".to_string(),
            error_kind: ErrorKind::Unknown,
        };
        let events = synthesize_lifecycle_events(true, &event, &new_state);
        match &events[0] {
            SessionEvent::MessageEnd { stop_reason, error_message, .. } => {
                assert_eq!(stop_reason.as_deref(), Some("error"));
                assert_eq!(error_message.as_deref(), Some("boom"));
            }
            other => panic!("expected MessageEnd, got {other:?}"),
        }
    }

    #[test]
    fn tool_complete_synthesizes_tool_execution_end() {
        let event = state_machine::Event::ToolComplete {
            tool_use_id: "t1".to_string(),
            result: ToolResult {
                tool_use_id: "t1".to_string(),
                output: "ok".to_string(),
                is_error: false,
                display_data: None,
            },
        };
        let events = synthesize_lifecycle_events(true, &event, &ConvState::LlmRequesting { attempt: 1 });
        assert!(matches!(
            events[0],
            SessionEvent::ToolExecutionEnd { is_error: false, .. }
        ));
    }
}
