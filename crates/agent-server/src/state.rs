//! Application State

use std::sync::Arc;

use agent_core::{AgentLoop, LlmProvider, MessageBus};

use crate::channel::OutboundRouter;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// LLM provider (Ollama, etc.)
    pub provider: Arc<dyn LlmProvider>,

    /// The running agent loop
    pub agent: Arc<AgentLoop>,

    /// Bus the agent loop consumes
    pub bus: Arc<MessageBus>,

    /// Replies fanned out per chat
    pub outbound: OutboundRouter,
}
