//! # agent-core
//!
//! Provider-agnostic conversational agent runtime: the ReAct turn loop,
//! per-session dispatch with interruptible turns, and background subagents.
//!
//! ## Architecture
//!
//! ```text
//!  inbound ──► AgentLoop ──► command parser ──► /stop (immediate)
//!                 │
//!                 ▼ one turn at a time per session
//!            TurnExecutor ◄──► LlmProvider (Strategy)
//!                 │
//!                 ▼
//!            ToolInvoker ──► ToolRegistry
//!                 │
//!                 └── spawn ──► SubagentManager ──► TurnExecutor (background)
//!                                    │    ▲
//!                      result event ─┘    └─ adjustments via SubagentMessenger
//! ```
//!
//! The `LlmProvider` trait enables swapping between Ollama, OpenAI, Anthropic,
//! or any other provider without changing agent logic.

pub mod agent_loop;
pub mod bus;
pub mod command;
pub mod config;
pub mod error;
pub mod invocation;
pub mod message;
pub mod metrics;
pub mod provider;
pub mod reasoning;
pub mod session;
pub mod subagent;
pub mod tool;

#[cfg(test)]
mod test_support;

pub use agent_loop::AgentLoop;
pub use bus::{InboundMessage, MessageBus, OutboundMessage};
pub use config::{AgentSettings, SubagentSettings};
pub use error::{AgentError, Result};
pub use invocation::{RegistryInvoker, SessionToolInvoker, ToolInvoker};
pub use message::{Conversation, Message, Role, ToolCallRequest};
pub use metrics::{AgentMetrics, MetricsSummary};
pub use provider::{ChatResponse, GenerationOptions, LlmProvider, ModelInfo, TokenUsage};
pub use reasoning::{TurnExecutor, TurnFailure, TurnHook, TurnState, TurnStatus};
pub use session::{MemorySessionStore, Session, SessionKey, SessionStore};
pub use subagent::{SpawnRequest, SubagentManager, SubagentMessenger, SubagentStatus, SubagentTask};
pub use tool::{Tool, ToolRegistry, ToolSchema};
