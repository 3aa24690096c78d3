//! # agent-runtime
//!
//! Runtime providers for the agent loop.
//!
//! ## Providers
//!
//! - **Ollama** (default): Local LLM inference via Ollama, with native tool calling
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::OllamaProvider;
//!
//! let provider = Arc::new(OllamaProvider::from_env());
//! let agent = Arc::new(AgentLoop::new(bus, provider, tools, AgentSettings::from_env()?));
//! tokio::spawn(agent.run(shutdown));
//! ```

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(feature = "ollama")]
pub use ollama::{OllamaConfig, OllamaProvider};

// Re-export core types for convenience
pub use agent_core::{
    AgentError, AgentLoop, AgentSettings, LlmProvider, Message, MessageBus, Result, Role, Tool,
    ToolRegistry,
};
