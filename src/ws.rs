//! Subscription Server (C6): one `GET /ws` upgrade per subscriber, fanning
//! out `SwarmEvent`s filtered to the set of agents a client has subscribed
//! to, and accepting client commands that drive the Swarm Manager.
//!
//! Grounded on the teacher's `api::sse` endpoint (one broadcast receiver
//! turned into a client-facing event stream) and `api::handlers`' router/
//! layer conventions, adapted from a one-way SSE stream to a bidirectional
//! WebSocket so clients can also issue commands.

use crate::domain::{Attachment, ModelSelection, SourceContext};
use crate::swarm::{LifecycleEvent, SwarmError, SwarmEvent, SwarmManager};
use chrono::Utc;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[derive(Clone)]
pub struct AppState {
    pub swarm: Arc<SwarmManager>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            CompressionLayer::new()
                .gzip(true)
                .br(true)
                .deflate(true)
                .zstd(true),
        )
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Client -> server wire vocabulary (spec §4.6/§6).
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientCommand {
    Subscribe {
        agent_id: String,
    },
    Unsubscribe {
        agent_id: String,
    },
    SendMessage {
        agent_id: String,
        text: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
        #[serde(default)]
        source_context: Option<SourceContext>,
    },
    SpawnAgent {
        caller_agent_id: String,
        display_name: String,
        cwd: PathBuf,
        model: ModelSelection,
        #[serde(default)]
        archetype_id: Option<String>,
        #[serde(default)]
        initial_message: Option<String>,
    },
    KillAgent {
        caller_agent_id: String,
        target_agent_id: String,
    },
    CreateManager {
        caller_agent_id: String,
        display_name: String,
        cwd: PathBuf,
        model: ModelSelection,
        #[serde(default)]
        primary: bool,
        #[serde(default)]
        request_id: Option<String>,
    },
    DeleteManager {
        caller_agent_id: String,
        manager_id: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    StopAllAgents {
        caller_agent_id: String,
        manager_id: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    CompactAgentContext {
        agent_id: String,
        #[serde(default)]
        custom_instructions: Option<String>,
    },
    ResetManagerSession {
        manager_id: String,
    },
    ListDirectories {
        path: PathBuf,
        #[serde(default)]
        request_id: Option<String>,
    },
    ValidateDirectory {
        path: PathBuf,
        #[serde(default)]
        request_id: Option<String>,
    },
    PickDirectory {
        #[serde(default)]
        request_id: Option<String>,
    },
}

/// Error codes from spec §6.
const INVALID_COMMAND: &str = "INVALID_COMMAND";
const NOT_SUBSCRIBED: &str = "NOT_SUBSCRIBED";
const UNKNOWN_AGENT: &str = "UNKNOWN_AGENT";
const SUBSCRIPTION_NOT_SUPPORTED: &str = "SUBSCRIPTION_NOT_SUPPORTED";
const KILL_AGENT_FAILED: &str = "KILL_AGENT_FAILED";
const CREATE_MANAGER_FAILED: &str = "CREATE_MANAGER_FAILED";
const DELETE_MANAGER_FAILED: &str = "DELETE_MANAGER_FAILED";
const LIST_DIRECTORIES_FAILED: &str = "LIST_DIRECTORIES_FAILED";
const VALIDATE_DIRECTORY_FAILED: &str = "VALIDATE_DIRECTORY_FAILED";
const PICK_DIRECTORY_FAILED: &str = "PICK_DIRECTORY_FAILED";
const USER_MESSAGE_FAILED: &str = "USER_MESSAGE_FAILED";

/// `error{code, message, requestId?}` (spec §6). `request_id` is omitted
/// from commands that don't carry one.
fn error_event(code: &str, message: impl Into<String>) -> Value {
    error_event_for(code, message, None)
}

fn error_event_for(code: &str, message: impl Into<String>, request_id: Option<&str>) -> Value {
    let mut event = json!({"type": "error", "code": code, "message": message.into()});
    if let (Some(obj), Some(request_id)) = (event.as_object_mut(), request_id) {
        obj.insert("request_id".to_string(), json!(request_id));
    }
    event
}

/// `ResetEvent` carries no wire tag of its own; stamp one on the way out so
/// the client vocabulary stays uniform.
fn swarm_event_to_json(event: &SwarmEvent) -> Value {
    match event {
        SwarmEvent::Lifecycle(inner) => serde_json::to_value(inner).unwrap_or(Value::Null),
        SwarmEvent::Conversation(inner) => serde_json::to_value(inner).unwrap_or(Value::Null),
        SwarmEvent::Reset(inner) => json!({
            "type": "conversation_reset",
            "agent_id": inner.agent_id,
            "reason": inner.reason,
        }),
    }
}

/// The single agent id an event is scoped to, if any. `agents_snapshot`,
/// `manager_created` and `manager_deleted` are process-wide and always
/// forwarded regardless of subscription.
fn scoped_agent_id(event: &SwarmEvent) -> Option<&str> {
    match event {
        SwarmEvent::Lifecycle(LifecycleEvent::AgentStatus { agent_id, .. }) => Some(agent_id),
        SwarmEvent::Lifecycle(_) => None,
        SwarmEvent::Conversation(entry) => Some(entry.agent_id()),
        SwarmEvent::Reset(event) => Some(&event.agent_id),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let mut events = state.swarm.subscribe();
    let mut subscribed: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_command(&state, &mut subscribed, &text).await;
                        for message in reply {
                            if sink.send(Message::Text(message.to_string())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                }
            }
            broadcast = events.recv() => {
                match broadcast {
                    Ok(event) => {
                        // spec §4.6: a subscribed agent's deletion rebinds the
                        // socket to the primary manager and re-sends the
                        // 4-step bootstrap, rather than leaving the client
                        // subscribed to a dangling id.
                        if let SwarmEvent::Lifecycle(LifecycleEvent::ManagerDeleted { agent_id }) = &event {
                            if subscribed.remove(agent_id) {
                                let fallback = state.swarm.primary_manager_id().to_string();
                                if state.swarm.snapshot().iter().any(|d| d.agent_id == fallback) {
                                    subscribed.insert(fallback.clone());
                                    for message in bootstrap_sequence(&state, &fallback) {
                                        if sink.send(Message::Text(message.to_string())).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                        }

                        let forward = match scoped_agent_id(&event) {
                            Some(agent_id) => subscribed.contains(agent_id),
                            None => true,
                        };
                        if forward {
                            let payload = swarm_event_to_json(&event);
                            if sink.send(Message::Text(payload.to_string())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

/// spec §4.6's 4-step subscribe bootstrap: `ready`, `agents_snapshot`,
/// `conversation_history`, then last-known integration status.
fn bootstrap_sequence(state: &AppState, agent_id: &str) -> Vec<Value> {
    let history = state.swarm.history(agent_id);
    vec![
        json!({
            "type": "ready",
            "server_time": Utc::now().to_rfc3339(),
            "subscribed_agent_id": agent_id,
        }),
        json!({"type": "agents_snapshot", "agents": state.swarm.snapshot()}),
        json!({"type": "conversation_history", "agent_id": agent_id, "entries": history}),
        json!({"type": "integration_status", "agent_id": agent_id, "connected": false}),
    ]
}

/// Decode and run one client command, returning the ordered list of
/// messages to send back (bootstrap sequences send more than one).
async fn handle_command(state: &AppState, subscribed: &mut HashSet<String>, raw: &str) -> Vec<Value> {
    let command: ClientCommand = match serde_json::from_str(raw) {
        Ok(c) => c,
        Err(e) => return vec![error_event(INVALID_COMMAND, e.to_string())],
    };

    match command {
        ClientCommand::Subscribe { agent_id } => {
            let snapshot = state.swarm.snapshot();
            let exists = snapshot.iter().any(|d| d.agent_id == agent_id);
            // Bootstrap exception (spec §4.6): a client may subscribe to the
            // configured primary manager id before it has been created, as
            // long as no manager is running yet.
            let is_bootstrap_primary = !exists
                && agent_id == state.swarm.primary_manager_id()
                && !snapshot.iter().any(|d| d.role == crate::domain::AgentRole::Manager);
            if !exists && !is_bootstrap_primary {
                return vec![error_event(UNKNOWN_AGENT, agent_id)];
            }
            subscribed.insert(agent_id.clone());
            bootstrap_sequence(state, &agent_id)
        }
        ClientCommand::Unsubscribe { agent_id } => {
            if subscribed.remove(&agent_id) {
                Vec::new()
            } else {
                vec![error_event(NOT_SUBSCRIBED, agent_id)]
            }
        }
        ClientCommand::SendMessage { agent_id, text, attachments, source_context } => {
            if !subscribed.contains(&agent_id) {
                return vec![error_event(SUBSCRIPTION_NOT_SUPPORTED, agent_id)];
            }
            match state
                .swarm
                .handle_user_message(&agent_id, &text, attachments, source_context)
                .await
            {
                Ok(Some(receipt)) => vec![json!({"type": "send_message_ack", "receipt": receipt})],
                Ok(None) => Vec::new(),
                Err(e) => vec![error_event(USER_MESSAGE_FAILED, e.to_string())],
            }
        }
        ClientCommand::SpawnAgent { caller_agent_id, display_name, cwd, model, archetype_id, initial_message } => {
            match state
                .swarm
                .spawn_agent(&caller_agent_id, &display_name, cwd, model, archetype_id, initial_message)
                .await
            {
                Ok(descriptor) => vec![json!({"type": "agent_spawned", "agent": descriptor})],
                Err(e) => vec![error_event(code_for(&e, KILL_AGENT_FAILED), e.to_string())],
            }
        }
        ClientCommand::KillAgent { caller_agent_id, target_agent_id } => {
            match state.swarm.kill_agent(&caller_agent_id, &target_agent_id).await {
                Ok(()) => Vec::new(),
                Err(e) => vec![error_event(KILL_AGENT_FAILED, e.to_string())],
            }
        }
        ClientCommand::CreateManager { caller_agent_id, display_name, cwd, model, primary, request_id } => {
            match state
                .swarm
                .create_manager(&caller_agent_id, &display_name, cwd, model, primary)
                .await
            {
                Ok(descriptor) => {
                    let mut ack = json!({"type": "manager_created_ack", "agent": descriptor});
                    if let (Some(obj), Some(request_id)) = (ack.as_object_mut(), &request_id) {
                        obj.insert("request_id".to_string(), json!(request_id));
                    }
                    vec![ack]
                }
                Err(e) => vec![error_event_for(CREATE_MANAGER_FAILED, e.to_string(), request_id.as_deref())],
            }
        }
        ClientCommand::DeleteManager { caller_agent_id, manager_id, request_id } => {
            match state.swarm.delete_manager(&caller_agent_id, &manager_id).await {
                Ok(()) => Vec::new(),
                Err(e) => vec![error_event_for(DELETE_MANAGER_FAILED, e.to_string(), request_id.as_deref())],
            }
        }
        ClientCommand::StopAllAgents { caller_agent_id, manager_id, request_id } => {
            match state.swarm.stop_all_agents(&caller_agent_id, &manager_id).await {
                Ok(()) => Vec::new(),
                Err(e) => vec![error_event_for(DELETE_MANAGER_FAILED, e.to_string(), request_id.as_deref())],
            }
        }
        ClientCommand::CompactAgentContext { agent_id, custom_instructions } => {
            match state.swarm.compact_agent_context(&agent_id, custom_instructions).await {
                Ok(()) => Vec::new(),
                Err(e) => vec![error_event(USER_MESSAGE_FAILED, e.to_string())],
            }
        }
        ClientCommand::ResetManagerSession { manager_id } => {
            match state.swarm.reset_manager_session(&manager_id).await {
                Ok(()) => Vec::new(),
                Err(e) => vec![error_event(DELETE_MANAGER_FAILED, e.to_string())],
            }
        }
        ClientCommand::ListDirectories { path, request_id } => match list_directories(&path) {
            Ok(entries) => {
                let mut ack = json!({"type": "directories", "path": path, "entries": entries});
                if let (Some(obj), Some(request_id)) = (ack.as_object_mut(), &request_id) {
                    obj.insert("request_id".to_string(), json!(request_id));
                }
                vec![ack]
            }
            Err(e) => vec![error_event_for(LIST_DIRECTORIES_FAILED, e, request_id.as_deref())],
        },
        ClientCommand::ValidateDirectory { path, request_id } => {
            let valid = path.is_dir();
            if valid {
                let mut ack = json!({"type": "directory_valid", "path": path});
                if let (Some(obj), Some(request_id)) = (ack.as_object_mut(), &request_id) {
                    obj.insert("request_id".to_string(), json!(request_id));
                }
                vec![ack]
            } else {
                vec![error_event_for(
                    VALIDATE_DIRECTORY_FAILED,
                    format!("{} is not a directory", path.display()),
                    request_id.as_deref(),
                )]
            }
        }
        ClientCommand::PickDirectory { request_id } => {
            vec![error_event_for(
                PICK_DIRECTORY_FAILED,
                "interactive directory picker is not available headlessly",
                request_id.as_deref(),
            )]
        }
    }
}

/// `spawnAgent` failures share `killAgent`'s error code in the absence of a
/// dedicated one in spec §6; kept as a named mapping point rather than
/// inlined so a future dedicated code is a one-line change.
fn code_for(_error: &SwarmError, fallback: &'static str) -> &'static str {
    fallback
}

fn list_directories(path: &std::path::Path) -> Result<Vec<String>, String> {
    let read_dir = std::fs::read_dir(path).map_err(|e| e.to_string())?;
    let mut names = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|e| e.to_string())?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

use futures::{SinkExt, StreamExt};
