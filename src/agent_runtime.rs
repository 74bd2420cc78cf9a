//! Agent Runtime (C2) — per-agent supervisor over a Session Transport.
//!
//! Owns the dispatch/steer/compact/watchdog state machine for one agent and
//! reports every lifecycle transition to the Swarm Manager through a
//! `Callbacks` capability struct rather than a back-pointer, per the cyclic-
//! reference design note this project carries from the teacher's
//! `runtime::executor`/`runtime::recovery` split.

use crate::config::RuntimeOptions;
use crate::domain::{message_key, AgentStatus, DeliveryMode, ImageData, PendingDelivery};
use crate::transport::{SessionEvent, SessionMessageRole, SessionTransport};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn overflow_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(
            r"(?i)prompt is too long|context window|context length|token limit|input token count.*exceeds|maximum prompt length",
        )
        .expect("overflow regex is valid")
    })
}

fn compaction_phase_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"(?i)compact(ion)?").expect("compaction regex is valid"))
}

fn timeout_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"(?i)timed out|timeout").expect("timeout regex is valid"))
}

/// §7 error taxonomy. `Display` produces the exact phase names the Swarm
/// Manager's user-facing template distinguishes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeErrorPhase {
    PromptDispatch,
    PromptExecution,
    Compaction,
    WatchdogTimeout,
    Interrupt,
    SessionEventHandler,
}

impl std::fmt::Display for RuntimeErrorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuntimeErrorPhase::PromptDispatch => "prompt_dispatch",
            RuntimeErrorPhase::PromptExecution => "prompt_execution",
            RuntimeErrorPhase::Compaction => "compaction",
            RuntimeErrorPhase::WatchdogTimeout => "watchdog_timeout",
            RuntimeErrorPhase::Interrupt => "interrupt",
            RuntimeErrorPhase::SessionEventHandler => "session_event_handler",
        };
        f.write_str(s)
    }
}

/// One reported runtime failure, turned by the Swarm Manager into a
/// `conversation_message{role=system}` (spec §7).
#[derive(Debug, Clone, serde::Serialize)]
pub struct RuntimeErrorEvent {
    pub phase: RuntimeErrorPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, Value>,
}

impl RuntimeErrorEvent {
    fn new(phase: RuntimeErrorPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            stack: None,
            details: serde_json::Map::new(),
        }
    }

    fn with_details(mut self, details: serde_json::Map<String, Value>) -> Self {
        self.details = details;
        self
    }
}

/// Fatal-to-the-caller errors from this layer (spec §7).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("agent is terminated")]
    AgentTerminated,
}

/// Lifecycle capability given to the runtime at construction; the runtime
/// never holds a pointer back to the `SwarmManager` that owns it (spec §9).
pub trait Callbacks: Send + Sync {
    fn on_status_change(&self, agent_id: &str, status: AgentStatus);
    fn on_agent_end(&self, agent_id: &str);
    fn on_error(&self, agent_id: &str, event: RuntimeErrorEvent);
    /// Fired whenever `pendingDeliveries` changes size, so the Swarm Manager
    /// can re-emit `agent_status` with an up to date pending count.
    fn on_pending_deliveries_changed(&self, agent_id: &str, count: usize);
}

/// `sendMessage`'s requested delivery mode. The actual accepted mode is
/// decided solely by current streaming/dispatch-pending state (spec
/// §4.2.2's Decision); `requestedMode` is carried through for caller intent
/// but never overrides that decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedMode {
    Auto,
    FollowUp,
    Steer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptedMode {
    Prompt,
    Steer,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SendMessageReceipt {
    pub delivery_id: String,
    pub accepted_mode: AcceptedMode,
}

/// Normalized `(text, images)` pair accepted by `sendMessage`.
#[derive(Debug, Clone, Default)]
pub struct UserMessage {
    pub text: String,
    pub images: Vec<ImageData>,
}

impl UserMessage {
    pub fn normalized(text: impl Into<String>, images: Vec<ImageData>) -> Self {
        let text = text.into().trim().to_string();
        let images = images
            .into_iter()
            .map(|mut image| {
                image.media_type = image.media_type.trim().to_string();
                image.data = image.data.trim().to_string();
                image
            })
            .filter(|image| image.media_type.starts_with("image/") && !image.data.is_empty())
            .collect();
        Self { text, images }
    }
}

struct RuntimeState {
    status: AgentStatus,
    prompt_dispatch_pending: bool,
    prompt_dispatch_started_at: Option<Instant>,
    ignore_next_agent_start: bool,
    auto_compaction_in_progress: bool,
    recovery_in_progress: bool,
    last_prompt_message: Option<UserMessage>,
    last_event_at: Instant,
    last_proactive_compaction_at: Option<Instant>,
    last_overflow_recovery_at: Option<Instant>,
    pending_deliveries: VecDeque<PendingDelivery>,
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            status: AgentStatus::Idle,
            prompt_dispatch_pending: false,
            prompt_dispatch_started_at: None,
            ignore_next_agent_start: false,
            auto_compaction_in_progress: false,
            recovery_in_progress: false,
            last_prompt_message: None,
            last_event_at: Instant::now(),
            last_proactive_compaction_at: None,
            last_overflow_recovery_at: None,
            pending_deliveries: VecDeque::new(),
        }
    }
}

struct Inner {
    agent_id: String,
    transport: Arc<dyn SessionTransport>,
    options: RuntimeOptions,
    callbacks: Arc<dyn Callbacks>,
    state: Mutex<RuntimeState>,
    health_check_in_progress: AtomicBool,
    background: CancellationToken,
}

impl Inner {
    fn set_status(&self, status: AgentStatus) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            let changed = state.status != status;
            state.status = status;
            changed
        };
        if changed {
            self.callbacks.on_status_change(&self.agent_id, status);
        }
    }

    fn report_error(&self, event: RuntimeErrorEvent) {
        self.callbacks.on_error(&self.agent_id, event);
    }

    fn note_pending_count(&self, count: usize) {
        self.callbacks
            .on_pending_deliveries_changed(&self.agent_id, count);
    }

    fn touch_last_event(&self) {
        self.state.lock().unwrap().last_event_at = Instant::now();
    }

    /// §4.2.5: compact before every prompt if the usage threshold and
    /// cooldown allow it. Failure never blocks dispatch.
    async fn maybe_compact_before_prompt(self: &Arc<Self>) {
        let threshold = self.options.proactive_compaction_threshold;
        if threshold <= 0.0 || self.transport.is_compacting() {
            return;
        }
        let should_compact = {
            let state = self.state.lock().unwrap();
            if state.status == AgentStatus::Terminated {
                return;
            }
            let cooldown_ok = state
                .last_proactive_compaction_at
                .map(|at| at.elapsed() >= self.options.proactive_compaction_cooldown)
                .unwrap_or(true);
            let usage_ok = self
                .transport
                .get_context_usage()
                .map(|usage| usage.percent >= threshold)
                .unwrap_or(false);
            usage_ok && cooldown_ok
        };
        if !should_compact {
            return;
        }

        let result = tokio::time::timeout(
            self.options.compaction_timeout,
            self.transport.compact(None),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                self.state.lock().unwrap().last_proactive_compaction_at = Some(Instant::now());
            }
            Ok(Err(e)) => self.report_error(RuntimeErrorEvent::new(
                RuntimeErrorPhase::Compaction,
                e.to_string(),
            )),
            Err(_) => self.report_error(RuntimeErrorEvent::new(
                RuntimeErrorPhase::Compaction,
                "proactive compaction timed out",
            )),
        }
    }

    /// §4.2.3: up to `MAX_PROMPT_DISPATCH_ATTEMPTS` attempts, each bounded
    /// by `PROMPT_DISPATCH_TIMEOUT_MS`.
    async fn dispatch_prompt_with_retry(self: Arc<Self>) {
        self.maybe_compact_before_prompt().await;

        let message = {
            let state = self.state.lock().unwrap();
            match state.last_prompt_message.clone() {
                Some(m) => m,
                None => return,
            }
        };

        let max_attempts = self.options.max_prompt_dispatch_attempts;
        for attempt in 1..=max_attempts {
            let dispatch = if message.text.is_empty() && !message.images.is_empty() {
                self.transport
                    .send_user_message(message.text.clone(), message.images.clone())
            } else {
                self.transport
                    .prompt(message.text.clone(), message.images.clone())
            };
            let outcome = tokio::time::timeout(self.options.prompt_dispatch_timeout, dispatch).await;

            let failure_message = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "prompt dispatch timed out".to_string(),
            };

            let status = self.state.lock().unwrap().status;
            let can_retry = attempt < max_attempts
                && status != AgentStatus::Terminated
                && status != AgentStatus::Streaming
                && !self.transport.is_streaming();

            if !can_retry {
                self.handle_prompt_dispatch_error(failure_message, attempt, max_attempts);
                return;
            }
        }
    }

    /// §4.2.4.
    fn handle_prompt_dispatch_error(&self, message: String, attempt: u32, max_attempts: u32) {
        let phase = if compaction_phase_regex().is_match(&message)
            || overflow_regex().is_match(&message)
        {
            RuntimeErrorPhase::Compaction
        } else {
            RuntimeErrorPhase::PromptDispatch
        };

        if timeout_regex().is_match(&message) {
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                let _ = transport.abort().await;
            });
        }

        let dropped = {
            let mut state = self.state.lock().unwrap();
            let dropped = state.pending_deliveries.len();
            state.pending_deliveries.clear();
            state.ignore_next_agent_start = true;
            state.last_prompt_message = None;
            state.prompt_dispatch_pending = false;
            state.prompt_dispatch_started_at = None;
            dropped
        };
        self.note_pending_count(0);

        let mut details = serde_json::Map::new();
        details.insert("attempt".into(), Value::from(attempt));
        details.insert("maxAttempts".into(), Value::from(max_attempts));
        details.insert("droppedPendingCount".into(), Value::from(dropped));
        self.report_error(RuntimeErrorEvent::new(phase, message).with_details(details));

        if self.state.lock().unwrap().status != AgentStatus::Terminated {
            self.set_status(AgentStatus::Idle);
        }
        self.callbacks.on_agent_end(&self.agent_id);
    }

    /// §4.2.6, run as a detached task once triggered by `message_end`.
    async fn run_reactive_overflow_recovery(self: Arc<Self>, error_message: String) {
        let can_recover = {
            let state = self.state.lock().unwrap();
            let cooldown_ok = state
                .last_overflow_recovery_at
                .map(|at| at.elapsed() >= self.options.overflow_recovery_cooldown)
                .unwrap_or(true);
            !state.recovery_in_progress
                && state.last_prompt_message.is_some()
                && state.status != AgentStatus::Terminated
                && cooldown_ok
        };

        if !can_recover {
            self.report_error(RuntimeErrorEvent::new(
                RuntimeErrorPhase::PromptExecution,
                error_message,
            ));
            return;
        }

        self.state.lock().unwrap().recovery_in_progress = true;

        let compact_result = tokio::time::timeout(
            self.options.compaction_timeout,
            self.transport.compact(None),
        )
        .await;

        let compact_ok = matches!(compact_result, Ok(Ok(())));
        if !compact_ok {
            self.state.lock().unwrap().recovery_in_progress = false;
            let mut details = serde_json::Map::new();
            details.insert("source".into(), Value::from("overflow_recovery"));
            self.report_error(
                RuntimeErrorEvent::new(RuntimeErrorPhase::Compaction, error_message)
                    .with_details(details),
            );
            return;
        }

        let message = self
            .state
            .lock()
            .unwrap()
            .last_prompt_message
            .clone()
            .expect("checked above");

        let redispatch = tokio::time::timeout(
            self.options.prompt_dispatch_timeout,
            self.transport.prompt(message.text, message.images),
        )
        .await;

        self.state.lock().unwrap().recovery_in_progress = false;

        if !matches!(redispatch, Ok(Ok(()))) {
            let mut details = serde_json::Map::new();
            details.insert("source".into(), Value::from("overflow_recovery"));
            self.report_error(
                RuntimeErrorEvent::new(RuntimeErrorPhase::Compaction, "overflow recovery re-dispatch failed")
                    .with_details(details),
            );
        } else {
            self.state.lock().unwrap().last_overflow_recovery_at = Some(Instant::now());
        }
    }

    /// §4.2.7.
    fn handle_session_event(self: &Arc<Self>, event: SessionEvent) {
        self.touch_last_event();

        match event {
            SessionEvent::AutoCompactionStart => {
                self.state.lock().unwrap().auto_compaction_in_progress = true;
            }
            SessionEvent::AutoCompactionEnd { error_message } => {
                self.state.lock().unwrap().auto_compaction_in_progress = false;
                if let Some(message) = error_message {
                    let mut details = serde_json::Map::new();
                    details.insert("source".into(), Value::from("auto_compaction_end"));
                    self.report_error(
                        RuntimeErrorEvent::new(RuntimeErrorPhase::Compaction, message)
                            .with_details(details),
                    );
                }
            }
            SessionEvent::AgentStart => {
                let ignore = {
                    let mut state = self.state.lock().unwrap();
                    state.prompt_dispatch_pending = false;
                    state.prompt_dispatch_started_at = None;
                    let ignore = state.ignore_next_agent_start;
                    state.ignore_next_agent_start = false;
                    ignore
                };
                if !ignore {
                    self.set_status(AgentStatus::Streaming);
                }
            }
            SessionEvent::AgentEnd => {
                self.state.lock().unwrap().last_prompt_message = None;
                self.set_status(AgentStatus::Idle);
                self.callbacks.on_agent_end(&self.agent_id);
            }
            SessionEvent::MessageEnd {
                role,
                error_message,
                ..
            } if role == SessionMessageRole::Assistant => {
                if let Some(message) = error_message {
                    if overflow_regex().is_match(&message) {
                        let inner = Arc::clone(self);
                        tokio::spawn(inner.run_reactive_overflow_recovery(message));
                    } else {
                        self.report_error(RuntimeErrorEvent::new(
                            RuntimeErrorPhase::PromptExecution,
                            message,
                        ));
                    }
                }
            }
            SessionEvent::MessageStart {
                role: SessionMessageRole::User,
                ..
            } => {
                // The transport's `message_start` carries only a message id,
                // not the originating text, so content-based `messageKey`
                // matching degenerates to FIFO consumption here: queued
                // steers surface to the transport in send order, so the
                // head of `pendingDeliveries` is always the right match.
                let count = {
                    let mut state = self.state.lock().unwrap();
                    state.pending_deliveries.pop_front();
                    state.pending_deliveries.len()
                };
                self.note_pending_count(count);
            }
            _ => {}
        }
    }

    fn handle_watchdog_timeout(&self, reason: &'static str, timed_out_ms: u64) {
        let dropped = {
            let mut state = self.state.lock().unwrap();
            state.prompt_dispatch_pending = false;
            state.prompt_dispatch_started_at = None;
            let dropped = state.pending_deliveries.len();
            state.pending_deliveries.clear();
            dropped
        };
        self.note_pending_count(0);

        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let _ = transport.abort().await;
        });

        let mut details = serde_json::Map::new();
        details.insert("reason".into(), Value::from(reason));
        details.insert("timedOutMs".into(), Value::from(timed_out_ms));
        details.insert("droppedPendingCount".into(), Value::from(dropped));
        self.report_error(
            RuntimeErrorEvent::new(
                RuntimeErrorPhase::WatchdogTimeout,
                format!("watchdog timeout: {reason}"),
            )
            .with_details(details),
        );

        self.set_status(AgentStatus::Idle);
        self.callbacks.on_agent_end(&self.agent_id);
    }

    /// §4.2.8, one tick. Re-entrancy-guarded by `health_check_in_progress`.
    fn run_watchdog_tick(&self) {
        if self
            .health_check_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let (status, auto_compacting, last_event_at, dispatch_pending, dispatch_started_at) = {
            let state = self.state.lock().unwrap();
            (
                state.status,
                state.auto_compaction_in_progress,
                state.last_event_at,
                state.prompt_dispatch_pending,
                state.prompt_dispatch_started_at,
            )
        };

        if status == AgentStatus::Streaming
            && !auto_compacting
            && last_event_at.elapsed() >= self.options.streaming_inactivity_timeout
        {
            self.handle_watchdog_timeout("streaming", last_event_at.elapsed().as_millis() as u64);
        } else if dispatch_pending
            && status != AgentStatus::Streaming
            && dispatch_started_at
                .map(|at| at.elapsed() >= self.options.prompt_dispatch_timeout)
                .unwrap_or(false)
        {
            let elapsed = dispatch_started_at.map(|at| at.elapsed()).unwrap_or_default();
            self.handle_watchdog_timeout("prompt_dispatch", elapsed.as_millis() as u64);
        }

        self.health_check_in_progress.store(false, Ordering::SeqCst);
    }
}

/// Production supervisor: one per live agent. Wraps a `SessionTransport`
/// and exposes the narrow `sendMessage`/`terminate`/`compact` surface
/// (spec §4.2).
pub struct AgentRuntime {
    inner: Arc<Inner>,
}

impl AgentRuntime {
    pub fn new(
        agent_id: impl Into<String>,
        transport: Arc<dyn SessionTransport>,
        options: RuntimeOptions,
        callbacks: Arc<dyn Callbacks>,
    ) -> Self {
        let inner = Arc::new(Inner {
            agent_id: agent_id.into(),
            transport,
            options,
            callbacks,
            state: Mutex::new(RuntimeState::new()),
            health_check_in_progress: AtomicBool::new(false),
            background: CancellationToken::new(),
        });

        let events = inner.transport.subscribe();
        tokio::spawn(run_event_loop(Arc::clone(&inner), events));
        tokio::spawn(run_watchdog(Arc::clone(&inner)));

        Self { inner }
    }

    /// §4.2.2.
    pub async fn send_message(
        &self,
        message: UserMessage,
        _requested_mode: RequestedMode,
    ) -> Result<SendMessageReceipt, RuntimeError> {
        let delivery_id = uuid::Uuid::new_v4().to_string();

        if self.inner.state.lock().unwrap().status == AgentStatus::Terminated {
            return Err(RuntimeError::AgentTerminated);
        }

        let should_queue = {
            let state = self.inner.state.lock().unwrap();
            self.inner.transport.is_streaming() || state.prompt_dispatch_pending
        };

        if should_queue {
            let key = message_key(&message.text, &message.images);
            let _ = self
                .inner
                .transport
                .steer(message.text, message.images)
                .await;

            let count = {
                let mut state = self.inner.state.lock().unwrap();
                state.pending_deliveries.push_back(PendingDelivery {
                    delivery_id: delivery_id.clone(),
                    message_key: key,
                    mode: DeliveryMode::Steer,
                });
                state.pending_deliveries.len()
            };
            self.inner.note_pending_count(count);

            return Ok(SendMessageReceipt {
                delivery_id,
                accepted_mode: AcceptedMode::Steer,
            });
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            state.prompt_dispatch_pending = true;
            state.prompt_dispatch_started_at = Some(Instant::now());
            state.last_prompt_message = Some(message);
        }

        tokio::spawn(Inner::dispatch_prompt_with_retry(Arc::clone(&self.inner)));

        Ok(SendMessageReceipt {
            delivery_id,
            accepted_mode: AcceptedMode::Prompt,
        })
    }

    /// Unconditional steer: queues onto the transport's live stream
    /// regardless of current dispatch state, per spec §4.5.3
    /// `handleUserMessage`'s "always steer (never prompt)" rule for
    /// messages addressed to a manager. Never returns `accepted_mode=prompt`.
    pub async fn send_message_steer(
        &self,
        message: UserMessage,
    ) -> Result<SendMessageReceipt, RuntimeError> {
        let delivery_id = uuid::Uuid::new_v4().to_string();

        if self.inner.state.lock().unwrap().status == AgentStatus::Terminated {
            return Err(RuntimeError::AgentTerminated);
        }

        let key = message_key(&message.text, &message.images);
        let _ = self
            .inner
            .transport
            .steer(message.text, message.images)
            .await;

        let count = {
            let mut state = self.inner.state.lock().unwrap();
            state.pending_deliveries.push_back(PendingDelivery {
                delivery_id: delivery_id.clone(),
                message_key: key,
                mode: DeliveryMode::Steer,
            });
            state.pending_deliveries.len()
        };
        self.inner.note_pending_count(count);

        Ok(SendMessageReceipt {
            delivery_id,
            accepted_mode: AcceptedMode::Steer,
        })
    }

    /// Narrow pass-through; bracketing `conversation_message` entries are
    /// the Swarm Manager's responsibility (spec §4.5.3 `compactAgentContext`).
    pub async fn compact(&self, custom_instructions: Option<String>) -> Result<(), RuntimeError> {
        if self.inner.state.lock().unwrap().status == AgentStatus::Terminated {
            return Err(RuntimeError::AgentTerminated);
        }
        let _ = self.inner.transport.compact(custom_instructions).await;
        Ok(())
    }

    /// §4.2.9. `abort=true` aborts any in-flight stream before disposing.
    pub async fn terminate(&self, abort: bool) {
        if abort {
            let _ = self.inner.transport.abort().await;
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            state.pending_deliveries.clear();
        }
        self.inner.note_pending_count(0);
        self.inner.background.cancel();
        self.inner.transport.dispose().await;
        self.inner.set_status(AgentStatus::Terminated);
    }

    pub fn status(&self) -> AgentStatus {
        self.inner.state.lock().unwrap().status
    }

    pub fn pending_delivery_count(&self) -> usize {
        self.inner.state.lock().unwrap().pending_deliveries.len()
    }
}

async fn run_event_loop(inner: Arc<Inner>, mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        tokio::select! {
            () = inner.background.cancelled() => break,
            received = events.recv() => {
                match received {
                    Ok(event) => inner.handle_session_event(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

async fn run_watchdog(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(interval_or_min(inner.options.health_check_interval));
    loop {
        tokio::select! {
            () = inner.background.cancelled() => break,
            _ = ticker.tick() => inner.run_watchdog_tick(),
        }
    }
}

fn interval_or_min(d: Duration) -> Duration {
    d.max(Duration::from_millis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ContextUsageReport, TransportError};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::broadcast as tokio_broadcast;

    struct FakeTransport {
        streaming: AtomicBool,
        compacting: AtomicBool,
        context_usage: Mutex<Option<ContextUsageReport>>,
        tx: tokio_broadcast::Sender<SessionEvent>,
        prompt_calls: AtomicUsize,
        compact_calls: AtomicUsize,
        abort_calls: AtomicUsize,
        fail_next_prompt: AtomicBool,
    }

    impl FakeTransport {
        fn new() -> Self {
            let (tx, _) = tokio_broadcast::channel(64);
            Self {
                streaming: AtomicBool::new(false),
                compacting: AtomicBool::new(false),
                context_usage: Mutex::new(None),
                tx,
                prompt_calls: AtomicUsize::new(0),
                compact_calls: AtomicUsize::new(0),
                abort_calls: AtomicUsize::new(0),
                fail_next_prompt: AtomicBool::new(false),
            }
        }

        fn emit(&self, event: SessionEvent) {
            let _ = self.tx.send(event);
        }
    }

    #[async_trait]
    impl SessionTransport for FakeTransport {
        async fn prompt(&self, _text: String, _images: Vec<ImageData>) -> Result<(), TransportError> {
            self.prompt_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_next_prompt.swap(false, Ordering::SeqCst) {
                return Err(TransportError::ChannelClosed);
            }
            self.streaming.store(true, Ordering::SeqCst);
            self.emit(SessionEvent::AgentStart);
            Ok(())
        }

        async fn send_user_message(
            &self,
            text: String,
            images: Vec<ImageData>,
        ) -> Result<(), TransportError> {
            self.prompt(text, images).await
        }

        async fn steer(&self, _text: String, _images: Vec<ImageData>) -> Result<(), TransportError> {
            Ok(())
        }

        async fn compact(&self, _custom_instructions: Option<String>) -> Result<(), TransportError> {
            self.compact_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn abort(&self) -> Result<(), TransportError> {
            self.abort_calls.fetch_add(1, Ordering::SeqCst);
            self.streaming.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn get_context_usage(&self) -> Option<ContextUsageReport> {
            *self.context_usage.lock().unwrap()
        }

        fn is_streaming(&self) -> bool {
            self.streaming.load(Ordering::SeqCst)
        }

        fn is_compacting(&self) -> bool {
            self.compacting.load(Ordering::SeqCst)
        }

        fn subscribe(&self) -> tokio_broadcast::Receiver<SessionEvent> {
            self.tx.subscribe()
        }

        async fn dispose(&self) {}
    }

    #[derive(Default)]
    struct RecordingCallbacks {
        errors: Mutex<Vec<RuntimeErrorEvent>>,
        statuses: Mutex<Vec<AgentStatus>>,
        agent_ends: AtomicUsize,
    }

    impl Callbacks for RecordingCallbacks {
        fn on_status_change(&self, _agent_id: &str, status: AgentStatus) {
            self.statuses.lock().unwrap().push(status);
        }
        fn on_agent_end(&self, _agent_id: &str) {
            self.agent_ends.fetch_add(1, Ordering::SeqCst);
        }
        fn on_error(&self, _agent_id: &str, event: RuntimeErrorEvent) {
            self.errors.lock().unwrap().push(event);
        }
        fn on_pending_deliveries_changed(&self, _agent_id: &str, _count: usize) {}
    }

    fn fast_options() -> RuntimeOptions {
        RuntimeOptions {
            max_prompt_dispatch_attempts: 2,
            prompt_dispatch_timeout: Duration::from_millis(200),
            proactive_compaction_threshold: 0.85,
            proactive_compaction_cooldown: Duration::from_millis(50),
            compaction_timeout: Duration::from_millis(200),
            overflow_recovery_cooldown: Duration::from_millis(50),
            health_check_interval: Duration::from_millis(20),
            streaming_inactivity_timeout: Duration::from_millis(80),
            ..RuntimeOptions::default()
        }
    }

    #[tokio::test]
    async fn send_message_while_streaming_is_queued_as_steer() {
        let transport = Arc::new(FakeTransport::new());
        transport.streaming.store(true, Ordering::SeqCst);
        let callbacks = Arc::new(RecordingCallbacks::default());
        let runtime = AgentRuntime::new(
            "a1",
            Arc::clone(&transport) as Arc<dyn SessionTransport>,
            fast_options(),
            Arc::clone(&callbacks) as Arc<dyn Callbacks>,
        );

        let receipt = runtime
            .send_message(UserMessage::normalized("wait", vec![]), RequestedMode::Auto)
            .await
            .unwrap();

        assert_eq!(receipt.accepted_mode, AcceptedMode::Steer);
        assert_eq!(runtime.pending_delivery_count(), 1);
    }

    #[tokio::test]
    async fn idle_send_message_dispatches_prompt() {
        let transport = Arc::new(FakeTransport::new());
        let callbacks = Arc::new(RecordingCallbacks::default());
        let runtime = AgentRuntime::new(
            "a1",
            Arc::clone(&transport) as Arc<dyn SessionTransport>,
            fast_options(),
            Arc::clone(&callbacks) as Arc<dyn Callbacks>,
        );

        let receipt = runtime
            .send_message(UserMessage::normalized("hello", vec![]), RequestedMode::Auto)
            .await
            .unwrap();
        assert_eq!(receipt.accepted_mode, AcceptedMode::Prompt);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.prompt_calls.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.status(), AgentStatus::Streaming);
    }

    #[tokio::test]
    async fn terminate_rejects_further_sends() {
        let transport = Arc::new(FakeTransport::new());
        let callbacks = Arc::new(RecordingCallbacks::default());
        let runtime = AgentRuntime::new(
            "a1",
            Arc::clone(&transport) as Arc<dyn SessionTransport>,
            fast_options(),
            Arc::clone(&callbacks) as Arc<dyn Callbacks>,
        );

        runtime.terminate(true).await;
        assert_eq!(runtime.status(), AgentStatus::Terminated);

        let err = runtime
            .send_message(UserMessage::normalized("hi", vec![]), RequestedMode::Auto)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AgentTerminated));
    }

    #[tokio::test]
    async fn watchdog_aborts_stuck_stream() {
        let transport = Arc::new(FakeTransport::new());
        let callbacks = Arc::new(RecordingCallbacks::default());
        let runtime = AgentRuntime::new(
            "a1",
            Arc::clone(&transport) as Arc<dyn SessionTransport>,
            fast_options(),
            Arc::clone(&callbacks) as Arc<dyn Callbacks>,
        );

        runtime
            .send_message(UserMessage::normalized("hello", vec![]), RequestedMode::Auto)
            .await
            .unwrap();

        // No further events arrive; the watchdog should notice the hang.
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(transport.abort_calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(runtime.status(), AgentStatus::Idle);
        let errors = callbacks.errors.lock().unwrap();
        assert!(errors
            .iter()
            .any(|e| e.phase == RuntimeErrorPhase::WatchdogTimeout));
    }

    #[tokio::test]
    async fn overflow_message_end_triggers_compact_and_redispatch() {
        let transport = Arc::new(FakeTransport::new());
        let callbacks = Arc::new(RecordingCallbacks::default());
        let runtime = AgentRuntime::new(
            "a1",
            Arc::clone(&transport) as Arc<dyn SessionTransport>,
            fast_options(),
            Arc::clone(&callbacks) as Arc<dyn Callbacks>,
        );

        runtime
            .send_message(UserMessage::normalized("big", vec![]), RequestedMode::Auto)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.emit(SessionEvent::MessageEnd {
            role: SessionMessageRole::Assistant,
            message_id: "m1".to_string(),
            stop_reason: Some("error".to_string()),
            error_message: Some("prompt is too long".to_string()),
        });

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(transport.compact_calls.load(Ordering::SeqCst) >= 1);
        assert!(transport.prompt_calls.load(Ordering::SeqCst) >= 2);
    }
}
