//! Swarm Manager (C5): the ownership graph over agents, and the only piece
//! of the system that mutates `AgentDescriptor`s, the session projector and
//! the set of live `AgentRuntime`s together.
//!
//! Grounded on the teacher's top-level conversation registry: one process
//! owns every live conversation behind a lock, persists the descriptor
//! table on every structural change, and fans out lifecycle/content events
//! to subscribers over a broadcast channel. The cyclic-reference problem
//! (`AgentRuntime` needs to call back into the manager that owns it) is
//! resolved the way `agent_runtime.rs` documents: `SwarmCallbacks` holds
//! only the shared state it needs, not a pointer to `SwarmManager` itself.

use crate::agent_runtime::{
    AgentRuntime, Callbacks, RequestedMode, RuntimeErrorEvent, SendMessageReceipt, UserMessage,
};
use crate::archetype::build_system_prompt;
use crate::config::RuntimeOptions;
use crate::domain::{
    AgentDescriptor, AgentRole, AgentStatus, Attachment, ContextUsage, ImageData, ModelSelection,
    SourceContext,
};
use crate::integrations::OutboundIntegrationAdapter;
use crate::llm::ModelRegistry;
use crate::projector::{
    ConversationEntry, ConversationProjector, MessageRole, ResetEvent, ResetReason,
};
use crate::state_machine::ConvContext;
use crate::store::{AgentStore, DescriptorIndex, StoreError};
use crate::tools::ToolRegistry;
use crate::transport::{LlmSessionTransport, SessionEvent, SessionTransport};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("agent {0} is not running")]
    TargetNotRunning(String),
    #[error("caller {0} is not a running manager")]
    CallerNotAManager(String),
    #[error("an agent cannot kill itself")]
    CannotKillSelf,
    #[error("killAgent does not apply to managers")]
    CannotKillManager,
    #[error("{0} does not own worker {1}")]
    NotOwner(String, String),
    #[error("the primary manager already exists")]
    PrimaryManagerExists,
    #[error("the primary manager cannot be deleted")]
    CannotDeletePrimaryManager,
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lifecycle-only events, the complement to the content events re-exported
/// from `projector`. Tagged so it composes cleanly with those under the
/// outer untagged `SwarmEvent`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    AgentStatus {
        agent_id: String,
        status: AgentStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        context_usage: Option<ContextUsage>,
        pending_deliveries: usize,
    },
    AgentsSnapshot {
        agents: Vec<AgentDescriptor>,
    },
    ManagerCreated {
        agent_id: String,
    },
    ManagerDeleted {
        agent_id: String,
    },
}

/// Everything broadcast to `ws` subscribers: lifecycle events plus the
/// content events the projector already produces. `#[serde(untagged)]`
/// lets each inner type keep its own `"type"` discriminant on the wire.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum SwarmEvent {
    Lifecycle(LifecycleEvent),
    Conversation(ConversationEntry),
    Reset(ResetEvent),
}

/// Lowercase, `[a-z0-9-]`-only, <=48 chars, collision-suffixed id allocation
/// (spec §4.5.1). `taken` answers whether a candidate id is already in use.
pub fn allocate_agent_id(seed: &str, taken: impl Fn(&str) -> bool) -> String {
    let mut base: String = seed
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while base.contains("--") {
        base = base.replace("--", "-");
    }
    let base = base.trim_matches('-');
    let base = if base.is_empty() { "agent" } else { base };
    let base: String = base.chars().take(48).collect();
    let base = base.trim_end_matches('-').to_string();
    let base = if base.is_empty() { "agent".to_string() } else { base };

    if !taken(&base) {
        return base;
    }
    for n in 2u32.. {
        let suffix = format!("-{n}");
        let keep = 48usize.saturating_sub(suffix.len());
        let candidate = format!("{}{}", base.chars().take(keep).collect::<String>(), suffix);
        if !taken(&candidate) {
            return candidate;
        }
    }
    unreachable!("u32 id suffix space exhausted")
}

/// State shared between `SwarmManager` and `SwarmCallbacks` without either
/// holding a pointer to the other.
struct SharedState {
    descriptors: Mutex<DescriptorIndex>,
    projector: Mutex<ConversationProjector>,
    transports: Mutex<HashMap<String, Arc<dyn SessionTransport>>>,
}

/// The `Callbacks` implementation an `AgentRuntime` reports its lifecycle
/// transitions to. One instance is shared by every agent in the process.
struct SwarmCallbacks {
    shared: Arc<SharedState>,
    store: Arc<AgentStore>,
    events_tx: broadcast::Sender<SwarmEvent>,
}

impl SwarmCallbacks {
    fn persist(&self, writer_agent_id: &str) {
        let agents = self.shared.descriptors.lock().unwrap().to_vec();
        if let Err(e) = self.store.save(writer_agent_id, &agents) {
            tracing::error!(error = %e, "failed to persist agent descriptors");
        }
    }

    fn emit_status(&self, agent_id: &str, pending_deliveries: usize) {
        let descriptor = {
            let descriptors = self.shared.descriptors.lock().unwrap();
            descriptors.get(agent_id).cloned()
        };
        let Some(descriptor) = descriptor else {
            return;
        };
        let _ = self.events_tx.send(SwarmEvent::Lifecycle(LifecycleEvent::AgentStatus {
            agent_id: agent_id.to_string(),
            status: descriptor.status,
            context_usage: descriptor.context_usage,
            pending_deliveries,
        }));
    }

    fn append_log(&self, agent_id: &str, message: impl Into<String>) {
        let entry = ConversationEntry::ConversationLog {
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
            message: message.into(),
        };
        self.shared.projector.lock().unwrap().append(entry.clone());
        let _ = self.events_tx.send(SwarmEvent::Conversation(entry));
    }
}

impl Callbacks for SwarmCallbacks {
    fn on_status_change(&self, agent_id: &str, status: AgentStatus) {
        let context_usage = self
            .shared
            .transports
            .lock()
            .unwrap()
            .get(agent_id)
            .and_then(|t| t.get_context_usage())
            .map(|u| ContextUsage::from_usage(u.tokens, u.context_window));

        {
            let mut descriptors = self.shared.descriptors.lock().unwrap();
            if let Some(descriptor) = descriptors.get_mut(agent_id) {
                descriptor.set_status(status, Utc::now());
                if status == AgentStatus::Idle {
                    descriptor.context_usage = context_usage;
                }
            }
        }

        self.persist(agent_id);
        self.emit_status(agent_id, 0);
    }

    fn on_agent_end(&self, agent_id: &str) {
        tracing::info!(agent_id, "agent run ended");
    }

    fn on_error(&self, agent_id: &str, event: RuntimeErrorEvent) {
        // §7 user-facing template: plain phase + message, no stack trace.
        self.append_log(agent_id, format!("[{}] {}", event.phase, event.message));
    }

    fn on_pending_deliveries_changed(&self, agent_id: &str, count: usize) {
        self.emit_status(agent_id, count);
    }
}

/// Owns the ownership graph, the live runtimes, and the projector. One
/// instance per process (spec §4.5.2: exactly one primary manager).
pub struct SwarmManager {
    shared: Arc<SharedState>,
    store: Arc<AgentStore>,
    runtimes: Mutex<HashMap<String, Arc<AgentRuntime>>>,
    model_registry: Arc<ModelRegistry>,
    tool_registry_manager: Arc<ToolRegistry>,
    tool_registry_worker: Arc<ToolRegistry>,
    options: RuntimeOptions,
    callbacks: Arc<SwarmCallbacks>,
    events_tx: broadcast::Sender<SwarmEvent>,
    /// Serializes every descriptor/store-mutating operation (spec §4.5.5).
    /// A single process-wide lock rather than one per manager: simpler, and
    /// the ownership graph is small enough that cross-manager contention is
    /// not a concern at this scale.
    op_lock: tokio::sync::Mutex<()>,
    outbound_adapters: Mutex<HashMap<String, Arc<dyn OutboundIntegrationAdapter>>>,
}

impl SwarmManager {
    /// Load `swarm/agents.json` (reconciling `streaming` -> `idle`) and
    /// rehydrate a fresh `AgentRuntime`/`SessionTransport` pair for every
    /// running descriptor. Conversation turn state does not survive a
    /// restart: each rehydrated transport starts with an empty `ConvState`,
    /// the same as a freshly spawned agent. The session `.jsonl` log and
    /// the in-memory projector are therefore not equivalent after a
    /// restart; replaying the log back into the projector is a known gap,
    /// not attempted here.
    pub fn bootstrap(
        options: RuntimeOptions,
        model_registry: Arc<ModelRegistry>,
    ) -> Result<Arc<Self>, SwarmError> {
        let store = Arc::new(AgentStore::new(options.data_dir.clone()));
        let agents = store.load_and_reconcile()?;

        let shared = Arc::new(SharedState {
            descriptors: Mutex::new(DescriptorIndex::from_vec(agents.clone())),
            projector: Mutex::new(ConversationProjector::new()),
            transports: Mutex::new(HashMap::new()),
        });
        let (events_tx, _) = broadcast::channel(1024);
        let callbacks = Arc::new(SwarmCallbacks {
            shared: Arc::clone(&shared),
            store: Arc::clone(&store),
            events_tx: events_tx.clone(),
        });

        let manager = Arc::new(Self {
            shared,
            store,
            runtimes: Mutex::new(HashMap::new()),
            model_registry,
            tool_registry_manager: Arc::new(ToolRegistry::standard()),
            tool_registry_worker: Arc::new(ToolRegistry::for_subagent()),
            options,
            callbacks,
            events_tx,
            op_lock: tokio::sync::Mutex::new(()),
            outbound_adapters: Mutex::new(HashMap::new()),
        });

        for descriptor in agents.iter().filter(|d| d.status.is_running()) {
            manager.rehydrate(descriptor)?;
        }

        Ok(manager)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.events_tx.subscribe()
    }

    pub fn register_outbound_adapter(
        &self,
        channel_key: impl Into<String>,
        adapter: Arc<dyn OutboundIntegrationAdapter>,
    ) {
        self.outbound_adapters
            .lock()
            .unwrap()
            .insert(channel_key.into(), adapter);
    }

    pub fn primary_manager_id(&self) -> &str {
        &self.options.primary_manager_id
    }

    pub fn snapshot(&self) -> Vec<AgentDescriptor> {
        self.shared.descriptors.lock().unwrap().to_vec()
    }

    pub fn history(&self, agent_id: &str) -> Vec<ConversationEntry> {
        self.shared.projector.lock().unwrap().history(agent_id).to_vec()
    }

    fn tool_registry_for(&self, role: AgentRole) -> Arc<ToolRegistry> {
        match role {
            AgentRole::Manager => Arc::clone(&self.tool_registry_manager),
            AgentRole::Worker => Arc::clone(&self.tool_registry_worker),
        }
    }

    fn build_transport(
        &self,
        descriptor: &AgentDescriptor,
    ) -> Result<Arc<dyn SessionTransport>, SwarmError> {
        let llm = self
            .model_registry
            .get(&descriptor.model.model_id)
            .ok_or_else(|| SwarmError::UnknownModel(descriptor.model.model_id.clone()))?;
        let context_window = self.model_registry.context_window_for(&descriptor.model.model_id);

        let system_prompt = build_system_prompt(
            &descriptor.cwd,
            descriptor.archetype_id.as_deref(),
            &descriptor.agent_id,
        );
        let ctx = ConvContext::new(
            descriptor.agent_id.clone(),
            descriptor.cwd.clone(),
            descriptor.model.model_id.clone(),
            context_window,
        );
        let session_log_path = self.store.data_dir().join(&descriptor.session_file);

        let transport: Arc<dyn SessionTransport> = Arc::new(LlmSessionTransport::new(
            ctx,
            llm,
            self.tool_registry_for(descriptor.role),
            Arc::clone(&self.model_registry),
            system_prompt,
            session_log_path,
        ));
        Ok(transport)
    }

    /// Construct a live transport + runtime for `descriptor` and register
    /// both. Used by `spawn_agent`, `create_manager` and
    /// `reset_manager_session`.
    fn rehydrate(&self, descriptor: &AgentDescriptor) -> Result<(), SwarmError> {
        let transport = self.build_transport(descriptor)?;
        let runtime = AgentRuntime::new(
            descriptor.agent_id.clone(),
            Arc::clone(&transport),
            self.options.clone(),
            Arc::clone(&self.callbacks) as Arc<dyn Callbacks>,
        );

        spawn_session_event_forwarder(
            descriptor.agent_id.clone(),
            transport.subscribe(),
            Arc::clone(&self.shared),
            self.events_tx.clone(),
        );

        self.shared
            .transports
            .lock()
            .unwrap()
            .insert(descriptor.agent_id.clone(), transport);
        self.runtimes
            .lock()
            .unwrap()
            .insert(descriptor.agent_id.clone(), Arc::new(runtime));
        Ok(())
    }

    fn runtime_for(&self, agent_id: &str) -> Option<Arc<AgentRuntime>> {
        self.runtimes.lock().unwrap().get(agent_id).cloned()
    }

    fn descriptor_of(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.shared.descriptors.lock().unwrap().get(agent_id).cloned()
    }

    fn require_running_manager(&self, agent_id: &str) -> Result<AgentDescriptor, SwarmError> {
        let descriptor = self
            .descriptor_of(agent_id)
            .ok_or_else(|| SwarmError::UnknownAgent(agent_id.to_string()))?;
        if descriptor.role != AgentRole::Manager || !descriptor.status.is_running() {
            return Err(SwarmError::CallerNotAManager(agent_id.to_string()));
        }
        Ok(descriptor)
    }

    fn persist_all(&self, writer_agent_id: &str) -> Result<(), SwarmError> {
        let agents = self.shared.descriptors.lock().unwrap().to_vec();
        self.store.save(writer_agent_id, &agents)?;
        Ok(())
    }

    fn broadcast_snapshot(&self) {
        let _ = self.events_tx.send(SwarmEvent::Lifecycle(LifecycleEvent::AgentsSnapshot {
            agents: self.snapshot(),
        }));
    }

    // -- operations (spec §4.5.3) -----------------------------------------

    /// `spawnAgent`: `callerAgentId` must be a running manager; the new
    /// worker is owned by that manager. If `initial_message` is provided, it
    /// is delivered as an internal-origin `sendMessage` from the caller once
    /// the worker is live (spec §4.5.3).
    pub async fn spawn_agent(
        &self,
        caller_agent_id: &str,
        display_name: &str,
        cwd: PathBuf,
        model: ModelSelection,
        archetype_id: Option<String>,
        initial_message: Option<String>,
    ) -> Result<AgentDescriptor, SwarmError> {
        let _guard = self.op_lock.lock().await;
        let manager = self.require_running_manager(caller_agent_id)?;

        if self.model_registry.get(&model.model_id).is_none() {
            return Err(SwarmError::UnknownModel(model.model_id));
        }

        let agent_id = {
            let descriptors = self.shared.descriptors.lock().unwrap();
            allocate_agent_id(display_name, |candidate| {
                descriptors.contains(candidate) || candidate == self.options.primary_manager_id
            })
        };

        let now = Utc::now();
        let descriptor = AgentDescriptor {
            agent_id: agent_id.clone(),
            display_name: display_name.to_string(),
            role: AgentRole::Worker,
            manager_id: manager.agent_id.clone(),
            archetype_id,
            status: AgentStatus::Idle,
            created_at: now,
            updated_at: now,
            cwd,
            model,
            session_file: PathBuf::from(format!("sessions/{agent_id}.jsonl")),
            context_usage: None,
        };

        self.rehydrate(&descriptor)?;
        self.shared.descriptors.lock().unwrap().insert(descriptor.clone());
        self.persist_all(caller_agent_id)?;
        self.broadcast_snapshot();

        if let Some(text) = initial_message {
            let _ = self
                .send_message(caller_agent_id, &descriptor.agent_id, &text)
                .await;
        }

        Ok(descriptor)
    }

    /// `killAgent`: a manager kills a worker it owns. Cannot target self or
    /// another manager (spec §4.5.2).
    pub async fn kill_agent(
        &self,
        caller_agent_id: &str,
        target_agent_id: &str,
    ) -> Result<(), SwarmError> {
        let _guard = self.op_lock.lock().await;
        let manager = self.require_running_manager(caller_agent_id)?;

        if target_agent_id == caller_agent_id {
            return Err(SwarmError::CannotKillSelf);
        }
        let target = self
            .descriptor_of(target_agent_id)
            .ok_or_else(|| SwarmError::UnknownAgent(target_agent_id.to_string()))?;
        if target.role == AgentRole::Manager {
            return Err(SwarmError::CannotKillManager);
        }
        if target.manager_id != manager.agent_id {
            return Err(SwarmError::NotOwner(
                caller_agent_id.to_string(),
                target_agent_id.to_string(),
            ));
        }

        self.terminate_one(target_agent_id, true).await;
        {
            let mut descriptors = self.shared.descriptors.lock().unwrap();
            if let Some(d) = descriptors.get_mut(target_agent_id) {
                d.set_status(AgentStatus::Terminated, Utc::now());
            }
        }
        self.persist_all(caller_agent_id)?;
        self.broadcast_snapshot();
        Ok(())
    }

    /// `createManager`: `primary` requests the reserved, config-configured
    /// primary manager id; at most one may ever exist (spec §4.5.2). The
    /// caller must be a running manager, unless no manager is running yet
    /// (bootstrap), per spec §4.5.3.
    pub async fn create_manager(
        &self,
        caller_agent_id: &str,
        display_name: &str,
        cwd: PathBuf,
        model: ModelSelection,
        primary: bool,
    ) -> Result<AgentDescriptor, SwarmError> {
        let _guard = self.op_lock.lock().await;

        let no_manager_running = !self
            .shared
            .descriptors
            .lock()
            .unwrap()
            .to_vec()
            .iter()
            .any(|d| d.role == AgentRole::Manager && d.status.is_running());
        if !no_manager_running {
            self.require_running_manager(caller_agent_id)?;
        }

        if self.model_registry.get(&model.model_id).is_none() {
            return Err(SwarmError::UnknownModel(model.model_id));
        }

        let agent_id = if primary {
            let exists = self
                .shared
                .descriptors
                .lock()
                .unwrap()
                .contains(&self.options.primary_manager_id);
            if exists {
                return Err(SwarmError::PrimaryManagerExists);
            }
            self.options.primary_manager_id.clone()
        } else {
            let descriptors = self.shared.descriptors.lock().unwrap();
            allocate_agent_id(display_name, |candidate| {
                descriptors.contains(candidate) || candidate == self.options.primary_manager_id
            })
        };

        self.store.ensure_memory_file(&agent_id)?;

        let now = Utc::now();
        let descriptor = AgentDescriptor {
            agent_id: agent_id.clone(),
            display_name: display_name.to_string(),
            role: AgentRole::Manager,
            manager_id: agent_id.clone(),
            archetype_id: Some("manager".to_string()),
            status: AgentStatus::Idle,
            created_at: now,
            updated_at: now,
            cwd,
            model,
            session_file: PathBuf::from(format!("sessions/{agent_id}.jsonl")),
            context_usage: None,
        };

        self.rehydrate(&descriptor)?;
        self.shared.descriptors.lock().unwrap().insert(descriptor.clone());
        self.persist_all(&agent_id)?;
        let _ = self
            .events_tx
            .send(SwarmEvent::Lifecycle(LifecycleEvent::ManagerCreated {
                agent_id: agent_id.clone(),
            }));
        self.broadcast_snapshot();

        Ok(descriptor)
    }

    /// `deleteManager`: cascades to every worker it owns. The reserved
    /// primary manager cannot be deleted (Open Question resolution, see
    /// `DESIGN.md`). The caller must be a manager (spec §4.5.3).
    pub async fn delete_manager(
        &self,
        caller_agent_id: &str,
        manager_id: &str,
    ) -> Result<(), SwarmError> {
        let _guard = self.op_lock.lock().await;

        let caller = self
            .descriptor_of(caller_agent_id)
            .ok_or_else(|| SwarmError::UnknownAgent(caller_agent_id.to_string()))?;
        if caller.role != AgentRole::Manager {
            return Err(SwarmError::CallerNotAManager(caller_agent_id.to_string()));
        }

        if manager_id == self.options.primary_manager_id {
            return Err(SwarmError::CannotDeletePrimaryManager);
        }
        if self.descriptor_of(manager_id).is_none() {
            return Err(SwarmError::UnknownAgent(manager_id.to_string()));
        }

        let worker_ids: Vec<String> = self
            .shared
            .descriptors
            .lock()
            .unwrap()
            .workers_of(manager_id)
            .into_iter()
            .map(|d| d.agent_id.clone())
            .collect();

        for worker_id in &worker_ids {
            self.terminate_one(worker_id, true).await;
            self.shared.descriptors.lock().unwrap().remove(worker_id);
            self.shared.projector.lock().unwrap().clear(worker_id);
            self.store.delete_session_file(worker_id)?;
        }

        self.terminate_one(manager_id, true).await;
        self.shared.descriptors.lock().unwrap().remove(manager_id);
        self.shared.projector.lock().unwrap().clear(manager_id);
        self.store.delete_session_file(manager_id)?;

        self.persist_all(manager_id)?;
        let _ = self
            .events_tx
            .send(SwarmEvent::Lifecycle(LifecycleEvent::ManagerDeleted {
                agent_id: manager_id.to_string(),
            }));
        self.broadcast_snapshot();
        Ok(())
    }

    /// `stopAllAgents(caller, targetManagerId)`: the caller must be the
    /// target manager; every running agent owned by it, plus itself, is
    /// demoted to `stopped` (not `terminated`, so a later boot can
    /// distinguish an operator-requested stop from a crash). Scoped to one
    /// manager's ownership subtree, not the whole process (spec §4.5.3).
    pub async fn stop_all_agents(
        &self,
        caller_agent_id: &str,
        target_manager_id: &str,
    ) -> Result<(), SwarmError> {
        let _guard = self.op_lock.lock().await;
        self.require_running_manager(caller_agent_id)?;
        if caller_agent_id != target_manager_id {
            return Err(SwarmError::NotOwner(
                caller_agent_id.to_string(),
                target_manager_id.to_string(),
            ));
        }

        let running: Vec<String> = {
            let descriptors = self.shared.descriptors.lock().unwrap();
            descriptors
                .workers_of(target_manager_id)
                .into_iter()
                .map(|d| d.agent_id.clone())
                .chain(
                    descriptors
                        .get(target_manager_id)
                        .into_iter()
                        .map(|d| d.agent_id.clone()),
                )
                .filter(|id| {
                    descriptors
                        .get(id)
                        .is_some_and(|d| d.status.is_running())
                })
                .collect()
        };

        for agent_id in &running {
            self.terminate_one(agent_id, true).await;
            let mut descriptors = self.shared.descriptors.lock().unwrap();
            if let Some(d) = descriptors.get_mut(agent_id) {
                d.set_status(AgentStatus::Stopped, Utc::now());
            }
        }

        self.persist_all(target_manager_id)?;
        self.broadcast_snapshot();
        Ok(())
    }

    async fn terminate_one(&self, agent_id: &str, abort: bool) {
        if let Some(runtime) = self.runtimes.lock().unwrap().remove(agent_id) {
            runtime.terminate(abort).await;
        }
        self.shared.transports.lock().unwrap().remove(agent_id);
    }

    /// `sendMessage`: agent-to-agent. Routed into both the sender's and the
    /// target's manager context (spec §4.4), and shaped with a `SYSTEM:`
    /// prefix so the receiving model can tell it apart from a user turn.
    pub async fn send_message(
        &self,
        from_agent_id: &str,
        to_agent_id: &str,
        text: &str,
    ) -> Result<SendMessageReceipt, SwarmError> {
        let target = self
            .descriptor_of(to_agent_id)
            .ok_or_else(|| SwarmError::UnknownAgent(to_agent_id.to_string()))?;
        if !target.status.is_running() {
            return Err(SwarmError::TargetNotRunning(to_agent_id.to_string()));
        }
        let runtime = self
            .runtime_for(to_agent_id)
            .ok_or_else(|| SwarmError::TargetNotRunning(to_agent_id.to_string()))?;

        let routed_text = shape_internal_origin_text(text);
        self.route_agent_message(from_agent_id, to_agent_id, text);

        let receipt = runtime
            .send_message(UserMessage::normalized(routed_text, Vec::new()), RequestedMode::Auto)
            .await
            .map_err(|_| SwarmError::TargetNotRunning(to_agent_id.to_string()))?;
        Ok(receipt)
    }

    /// `handleUserMessage`: the entry point for both the web UI and any
    /// `InboundIntegrationAdapter`. Persists binary attachments, inlines
    /// text attachments, passes images through untouched (spec §4.5.4). A
    /// no-op if both `text` and `attachments` are empty. `/compact[ body]`
    /// sent to a manager is intercepted before dispatch and routed to
    /// `compact_agent_context` instead of becoming a conversation turn.
    /// Manager targets are always delivered via `steer`, never `prompt`, so
    /// a user message always takes precedence over whatever the manager is
    /// already doing (spec §4.5.3).
    pub async fn handle_user_message(
        &self,
        target_agent_id: &str,
        text: &str,
        attachments: Vec<Attachment>,
        source_context: Option<SourceContext>,
    ) -> Result<Option<SendMessageReceipt>, SwarmError> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Ok(None);
        }

        let target = self
            .descriptor_of(target_agent_id)
            .ok_or_else(|| SwarmError::UnknownAgent(target_agent_id.to_string()))?;
        if !target.status.is_running() {
            return Err(SwarmError::TargetNotRunning(target_agent_id.to_string()));
        }

        if target.role == AgentRole::Manager {
            if let Some(custom_instructions) = parse_compact_command(text) {
                self.compact_agent_context(target_agent_id, custom_instructions)
                    .await?;
                return Ok(None);
            }
        }

        let runtime = self
            .runtime_for(target_agent_id)
            .ok_or_else(|| SwarmError::TargetNotRunning(target_agent_id.to_string()))?;

        let batch = uuid::Uuid::new_v4().to_string();
        let (mut dispatch_text, images) =
            self.shape_attachments(target_agent_id, &batch, text, attachments.clone())?;

        let entry = ConversationEntry::ConversationMessage {
            agent_id: target_agent_id.to_string(),
            timestamp: Utc::now(),
            role: MessageRole::User,
            content: crate::domain::MessageContent::user_with_images(text, images.clone()),
            attachments,
            source_context: source_context.clone(),
        };
        self.shared.projector.lock().unwrap().append(entry.clone());
        let _ = self.events_tx.send(SwarmEvent::Conversation(entry));

        let receipt = if target.role == AgentRole::Manager {
            if let Some(source) = &source_context {
                if let Ok(json) = serde_json::to_string(source) {
                    dispatch_text = format!("[sourceContext] {json}\n{dispatch_text}");
                }
            }
            runtime
                .send_message_steer(UserMessage::normalized(dispatch_text, images))
                .await
                .map_err(|_| SwarmError::TargetNotRunning(target_agent_id.to_string()))?
        } else {
            runtime
                .send_message(UserMessage::normalized(dispatch_text, images), RequestedMode::Auto)
                .await
                .map_err(|_| SwarmError::TargetNotRunning(target_agent_id.to_string()))?
        };
        Ok(Some(receipt))
    }

    /// `publishToUser`: a manager speaks directly to the user without going
    /// through the model (e.g. relaying a worker's result). Delivered via
    /// the registered `OutboundIntegrationAdapter` when the source channel
    /// is not `web`.
    pub async fn publish_to_user(
        &self,
        manager_id: &str,
        text: &str,
        source_context: Option<SourceContext>,
    ) -> Result<(), SwarmError> {
        self.descriptor_of(manager_id)
            .ok_or_else(|| SwarmError::UnknownAgent(manager_id.to_string()))?;

        let entry = ConversationEntry::ConversationMessage {
            agent_id: manager_id.to_string(),
            timestamp: Utc::now(),
            role: MessageRole::Assistant,
            content: crate::domain::MessageContent::user(text),
            attachments: Vec::new(),
            source_context: source_context.clone(),
        };
        self.shared.projector.lock().unwrap().append(entry.clone());
        let _ = self.events_tx.send(SwarmEvent::Conversation(entry));

        if let Some(source) = source_context {
            if source.channel != crate::domain::Channel::Web {
                let key = format!("{:?}", source.channel).to_lowercase();
                let adapter = self.outbound_adapters.lock().unwrap().get(&key).cloned();
                if let Some(adapter) = adapter {
                    if let Err(e) = adapter.deliver(manager_id, text, &source).await {
                        tracing::warn!(manager_id, error = %e, "outbound delivery failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// `compactAgentContext`: manual compaction, bracketed with a log entry
    /// since the runtime's own `AutoCompactionStart`/`End` events are
    /// consumed internally and never surfaced to subscribers directly.
    pub async fn compact_agent_context(
        &self,
        target_agent_id: &str,
        custom_instructions: Option<String>,
    ) -> Result<(), SwarmError> {
        let target = self
            .descriptor_of(target_agent_id)
            .ok_or_else(|| SwarmError::UnknownAgent(target_agent_id.to_string()))?;
        if !target.status.is_running() {
            return Err(SwarmError::TargetNotRunning(target_agent_id.to_string()));
        }
        let runtime = self
            .runtime_for(target_agent_id)
            .ok_or_else(|| SwarmError::TargetNotRunning(target_agent_id.to_string()))?;

        self.callbacks.append_log(target_agent_id, "compaction requested");
        runtime
            .compact(custom_instructions)
            .await
            .map_err(|_| SwarmError::TargetNotRunning(target_agent_id.to_string()))?;
        Ok(())
    }

    /// `resetManagerSession`: drop the manager's session log and
    /// conversation history, then rebuild its runtime from scratch. The
    /// descriptor (id, cwd, model) survives; only the conversation does not.
    pub async fn reset_manager_session(&self, manager_id: &str) -> Result<(), SwarmError> {
        let _guard = self.op_lock.lock().await;
        let descriptor = self
            .descriptor_of(manager_id)
            .ok_or_else(|| SwarmError::UnknownAgent(manager_id.to_string()))?;
        if descriptor.role != AgentRole::Manager {
            return Err(SwarmError::CallerNotAManager(manager_id.to_string()));
        }

        self.terminate_one(manager_id, true).await;
        self.store.delete_session_file(manager_id)?;
        let reset_entry = self
            .shared
            .projector
            .lock()
            .unwrap()
            .reset(manager_id, ResetReason::UserNewCommand);
        let _ = self.events_tx.send(SwarmEvent::Reset(reset_entry));

        let mut fresh = descriptor.clone();
        fresh.set_status(AgentStatus::Idle, Utc::now());
        self.rehydrate(&fresh)?;
        self.shared.descriptors.lock().unwrap().insert(fresh);
        self.persist_all(manager_id)?;
        self.broadcast_snapshot();
        Ok(())
    }

    /// Duplicate one `agent_message` into every manager context reachable
    /// from `from_agent_id`/`to_agent_id` (spec §4.4 agent-to-agent routing).
    fn route_agent_message(&self, from_agent_id: &str, to_agent_id: &str, text: &str) {
        let manager_context_ids: Vec<String> = {
            let descriptors = self.shared.descriptors.lock().unwrap();
            let mut ids = Vec::new();
            if let Some(d) = descriptors.get(from_agent_id) {
                ids.push(d.manager_id.clone());
            }
            if let Some(d) = descriptors.get(to_agent_id) {
                if !ids.contains(&d.manager_id) {
                    ids.push(d.manager_id.clone());
                }
            }
            ids
        };
        let timestamp = Utc::now();

        let mut projector = self.shared.projector.lock().unwrap();
        let mut emitted = Vec::new();
        projector.append_routed(&manager_context_ids, |manager_id| {
            let entry = ConversationEntry::AgentMessage {
                agent_id: manager_id.to_string(),
                timestamp,
                from: from_agent_id.to_string(),
                to: to_agent_id.to_string(),
                text: text.to_string(),
            };
            emitted.push(entry.clone());
            entry
        });
        drop(projector);
        for entry in emitted {
            let _ = self.events_tx.send(SwarmEvent::Conversation(entry));
        }
    }

    /// Binary attachments are saved to disk and replaced with a
    /// `[Attached file saved to: <path>]` line; text attachments are
    /// inlined as a fenced `[Attachment N]` block; images pass through
    /// untouched as `ImageData` (spec §4.5.4).
    fn shape_attachments(
        &self,
        agent_id: &str,
        batch: &str,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<(String, Vec<ImageData>), SwarmError> {
        let mut dispatch_text = text.to_string();
        let mut images = Vec::new();

        for (i, attachment) in attachments.into_iter().enumerate() {
            match attachment {
                Attachment::Image { data, mime_type, .. } => {
                    images.push(ImageData { media_type: mime_type, data });
                }
                Attachment::Text { body, file_name, .. } => {
                    let label = file_name.unwrap_or_else(|| format!("attachment-{i}"));
                    dispatch_text.push_str(&format!(
                        "\n\n[Attachment {i}: {label}]\n```\n{body}\n```\n[/Attachment {i}]"
                    ));
                }
                Attachment::Binary { data, file_name, mime_type, .. } => {
                    let bytes = base64_decode(&data).unwrap_or_default();
                    let name = file_name.unwrap_or_else(|| format!("attachment-{i}.{}", ext_for(&mime_type)));
                    let path = self.store.save_attachment(agent_id, batch, i, &name, &bytes)?;
                    dispatch_text.push_str(&format!(
                        "\n\n[Attached file saved to: {}]",
                        path.display()
                    ));
                }
            }
        }

        Ok((dispatch_text, images))
    }
}

/// Drains one runtime's `SessionEvent`s into `conversation_log` and
/// `agent_tool_call` projector entries (spec §4.4). Holds only the
/// `broadcast::Receiver`, not the transport itself, so the task exits on its
/// own once `terminate_one` drops the transport's last `Arc` and the
/// underlying sender closes.
fn spawn_session_event_forwarder(
    agent_id: String,
    mut events: broadcast::Receiver<SessionEvent>,
    shared: Arc<SharedState>,
    events_tx: broadcast::Sender<SwarmEvent>,
) {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            };

            if let SessionEvent::ToolExecutionEnd { tool_use_id, is_error } = &event {
                shared
                    .projector
                    .lock()
                    .unwrap()
                    .update_tool_call(&agent_id, tool_use_id, *is_error);
            }

            let Some(entry) = session_event_to_conversation_entry(&agent_id, &event) else {
                continue;
            };
            shared.projector.lock().unwrap().append(entry.clone());
            let _ = events_tx.send(SwarmEvent::Conversation(entry));
        }
    });
}

/// Lifecycle/tool events become `conversation_log`/`agent_tool_call`
/// entries; message streaming events (`message_start|update|end`) are
/// consumed by the Agent Runtime directly and have no projector
/// representation of their own.
fn session_event_to_conversation_entry(
    agent_id: &str,
    event: &SessionEvent,
) -> Option<ConversationEntry> {
    let timestamp = Utc::now();
    let log = |message: String| {
        Some(ConversationEntry::ConversationLog {
            agent_id: agent_id.to_string(),
            timestamp,
            message,
        })
    };

    match event {
        SessionEvent::TurnStart => log("turn started".to_string()),
        SessionEvent::TurnEnd => log("turn ended".to_string()),
        SessionEvent::AutoCompactionStart => log("context compaction started".to_string()),
        SessionEvent::AutoCompactionEnd { error_message: None } => {
            log("context compaction finished".to_string())
        }
        SessionEvent::AutoCompactionEnd { error_message: Some(err) } => {
            log(format!("context compaction failed: {err}"))
        }
        SessionEvent::AutoRetryStart { attempt } => log(format!("retrying (attempt {attempt})")),
        SessionEvent::AutoRetryEnd { attempt } => log(format!("retry {attempt} settled")),
        SessionEvent::ToolExecutionStart { tool_use_id, tool_name } => {
            Some(ConversationEntry::AgentToolCall {
                agent_id: agent_id.to_string(),
                timestamp,
                tool_use_id: tool_use_id.clone(),
                tool_name: tool_name.clone(),
                input: serde_json::Value::Null,
                output: None,
                is_error: None,
            })
        }
        SessionEvent::AgentStart
        | SessionEvent::AgentEnd
        | SessionEvent::MessageStart { .. }
        | SessionEvent::MessageUpdate { .. }
        | SessionEvent::MessageEnd { .. }
        | SessionEvent::ToolExecutionUpdate { .. }
        | SessionEvent::ToolExecutionEnd { .. } => None,
    }
}

/// `text == "/compact"` or `"/compact body"` -> `Some(None)`/`Some(Some(body))`.
/// Anything else (including `/compacted`, which is not the command) -> `None`.
fn parse_compact_command(text: &str) -> Option<Option<String>> {
    let rest = text.strip_prefix("/compact")?;
    if rest.is_empty() {
        return Some(None);
    }
    let body = rest.strip_prefix(' ')?.trim();
    if body.is_empty() {
        Some(None)
    } else {
        Some(Some(body.to_string()))
    }
}

fn shape_internal_origin_text(text: &str) -> String {
    if text.trim().is_empty() {
        text.to_string()
    } else {
        format!("SYSTEM: {text}")
    }
}

fn base64_decode(data: &str) -> Option<Vec<u8>> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.decode(data).ok()
}

fn ext_for(mime_type: &str) -> &'static str {
    match mime_type {
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_agent_id_sanitizes_and_lowercases() {
        let id = allocate_agent_id("My Worker!", |_| false);
        assert_eq!(id, "my-worker");
    }

    #[test]
    fn allocate_agent_id_resolves_collisions() {
        let taken = ["worker", "worker-2"];
        let id = allocate_agent_id("worker", |c| taken.contains(&c));
        assert_eq!(id, "worker-3");
    }

    #[test]
    fn allocate_agent_id_caps_length() {
        let long = "a".repeat(100);
        let id = allocate_agent_id(&long, |_| false);
        assert!(id.len() <= 48);
    }

    #[test]
    fn parse_compact_command_bare() {
        assert_eq!(parse_compact_command("/compact"), Some(None));
    }

    #[test]
    fn parse_compact_command_with_body() {
        assert_eq!(
            parse_compact_command("/compact focus on the auth module"),
            Some(Some("focus on the auth module".to_string()))
        );
    }

    #[test]
    fn parse_compact_command_rejects_lookalikes() {
        assert_eq!(parse_compact_command("/compacted"), None);
        assert_eq!(parse_compact_command("hello /compact"), None);
        assert_eq!(parse_compact_command(""), None);
    }

    #[test]
    fn shape_internal_origin_text_prefixes_non_empty() {
        assert_eq!(shape_internal_origin_text("hi"), "SYSTEM: hi");
        assert_eq!(shape_internal_origin_text(""), "");
    }

    #[test]
    fn session_event_turn_start_becomes_conversation_log() {
        let entry = session_event_to_conversation_entry("a1", &SessionEvent::TurnStart).unwrap();
        match entry {
            ConversationEntry::ConversationLog { agent_id, message, .. } => {
                assert_eq!(agent_id, "a1");
                assert_eq!(message, "turn started");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn session_event_tool_execution_start_becomes_agent_tool_call() {
        let event = SessionEvent::ToolExecutionStart {
            tool_use_id: "tool-1".to_string(),
            tool_name: "bash".to_string(),
        };
        let entry = session_event_to_conversation_entry("a1", &event).unwrap();
        match entry {
            ConversationEntry::AgentToolCall { tool_use_id, tool_name, output, is_error, .. } => {
                assert_eq!(tool_use_id, "tool-1");
                assert_eq!(tool_name, "bash");
                assert!(output.is_none());
                assert!(is_error.is_none());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn session_event_message_and_agent_markers_have_no_projector_entry() {
        assert!(session_event_to_conversation_entry("a1", &SessionEvent::AgentStart).is_none());
        assert!(session_event_to_conversation_entry("a1", &SessionEvent::AgentEnd).is_none());
        assert!(session_event_to_conversation_entry(
            "a1",
            &SessionEvent::ToolExecutionEnd { tool_use_id: "tool-1".to_string(), is_error: false }
        )
        .is_none());
    }

    #[test]
    fn session_event_compaction_failure_includes_error_message() {
        let event = SessionEvent::AutoCompactionEnd { error_message: Some("boom".to_string()) };
        let entry = session_event_to_conversation_entry("a1", &event).unwrap();
        match entry {
            ConversationEntry::ConversationLog { message, .. } => {
                assert_eq!(message, "context compaction failed: boom");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
