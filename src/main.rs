//! Swarm IDE orchestrator - entry point.
//!
//! Boots the Swarm Manager from persisted state, ensures a primary manager
//! exists, and serves the WebSocket subscription endpoint.

mod agent_runtime;
mod archetype;
mod config;
mod domain;
mod integrations;
mod llm;
mod projector;
mod state_machine;
mod store;
mod swarm;
mod tools;
mod transport;
mod ws;

use config::RuntimeOptions;
use llm::{LlmConfig, ModelRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use swarm::SwarmManager;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ws::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "swarm_ide=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let options = RuntimeOptions::from_env();
    std::fs::create_dir_all(&options.data_dir)?;

    let llm_config = LlmConfig::from_env();
    let model_registry = Arc::new(ModelRegistry::new(&llm_config));

    if model_registry.has_models() {
        tracing::info!(
            models = ?model_registry.available_models(),
            default = %model_registry.default_model_id(),
            "LLM registry initialized"
        );
    } else {
        tracing::warn!("No LLM API keys configured. Set ANTHROPIC_API_KEY, OPENAI_API_KEY, etc.");
    }

    tracing::info!(data_dir = %options.data_dir.display(), "Bootstrapping swarm manager");
    let swarm = SwarmManager::bootstrap(options, model_registry)?;

    let state = AppState { swarm };
    let app = ws::create_router(state);

    let port: u16 = std::env::var("SWARM_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8787);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Swarm IDE server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
