//! agent-server
//!
//! Hosts the agent loop behind two channels: an Axum gateway (REST and
//! WebSocket) and an interactive CLI. Select with `AGENT_MODE=gateway|cli`.

mod channel;
mod cli;
mod handlers;
mod state;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::tool::DateTimeTool;
use agent_core::{AgentLoop, AgentSettings, LlmProvider, MessageBus, ToolRegistry};
use agent_runtime::OllamaProvider;

use crate::channel::OutboundRouter;
use crate::handlers::{
    chat_handler, chat_stream_handler, health_check, list_models, list_subagents, metrics,
};
use crate::state::AppState;

const OUTBOUND_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = AgentSettings::from_env()?;
    tracing::info!(model = %settings.model, max_iterations = settings.max_iterations, "Agent settings loaded");

    let provider: Arc<dyn LlmProvider> = Arc::new(OllamaProvider::from_env());
    match provider.health_check().await {
        Ok(true) => {
            tracing::info!("✓ Connected to Ollama");
            if let Ok(models) = provider.list_models().await {
                for model in models {
                    tracing::info!("  Model: {}", model.id);
                }
            }
        }
        Ok(false) | Err(_) => {
            tracing::warn!("⚠ Ollama not available - turns will fail until it is");
            tracing::warn!("  Make sure Ollama is running: ollama serve");
        }
    }

    let mut tools = ToolRegistry::new();
    tools.register(DateTimeTool);
    tracing::info!("Registered {} tools: {}", tools.len(), tools.names().join(", "));

    let bus = Arc::new(MessageBus::new());
    let agent = Arc::new(AgentLoop::new(bus.clone(), provider.clone(), tools, settings));
    let outbound = OutboundRouter::new(OUTBOUND_CAPACITY);
    let shutdown = CancellationToken::new();

    let agent_task = tokio::spawn(agent.clone().run(shutdown.clone()));
    let router_task = tokio::spawn(outbound.clone().run(bus.clone(), shutdown.clone()));

    let mode = std::env::var("AGENT_MODE").unwrap_or_else(|_| "gateway".into());
    let result = match mode.as_str() {
        "cli" => cli::run(bus, outbound, shutdown.clone()).await,
        "gateway" => {
            let state = AppState {
                provider,
                agent,
                bus,
                outbound,
            };
            serve(state, shutdown.clone()).await
        }
        other => Err(anyhow::anyhow!("Unknown AGENT_MODE '{}', expected 'gateway' or 'cli'", other)),
    };

    shutdown.cancel();
    let _ = tokio::join!(agent_task, router_task);
    result
}

async fn serve(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        // Health & info
        .route("/health", get(health_check))
        .route("/api/models", get(list_models))
        .route("/api/metrics", get(metrics))
        // Agent API
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", get(chat_stream_handler))
        .route("/api/subagents", get(list_subagents))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 agent gateway running on http://{}", addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health          - Health check");
    tracing::info!("  GET  /api/models      - List available models");
    tracing::info!("  POST /api/chat        - Send message");
    tracing::info!("  GET  /api/chat/stream - WebSocket chat");
    tracing::info!("  GET  /api/subagents   - Background tasks");
    tracing::info!("  GET  /api/metrics     - Counters");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    Ok(())
}
