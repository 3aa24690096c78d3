//! Tool Invocation
//!
//! Bridges the model's tool calls to whatever executes them. The turn
//! executor only sees [`ToolInvoker`]; the main session plugs in
//! [`SessionToolInvoker`], which intercepts `spawn` and `message`, while
//! subagents use a plain [`RegistryInvoker`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{MessageBus, OutboundMessage};
use crate::error::{AgentError, Result};
use crate::message::{Message, ToolCallRequest};
use crate::session::SessionKey;
use crate::subagent::{SpawnRequest, SubagentManager};
use crate::tool::{ParameterSchema, ToolRegistry, ToolSchema};

pub const SPAWN_TOOL: &str = "spawn";
pub const MESSAGE_TOOL: &str = "message";

/// Executes tool calls on behalf of a turn
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Schemas advertised to the model
    fn definitions(&self) -> Vec<ToolSchema>;

    /// Run one call. `context` is the turn's log up to and including the
    /// assistant message that requested it.
    async fn invoke(&self, call: &ToolCallRequest, context: &[Message]) -> Result<String>;
}

/// Content of the tool message recorded for a failed call
pub fn tool_error_content(call: &ToolCallRequest, err: &AgentError) -> String {
    format!("Error executing {}: {}", call.name, err)
}

/// Straight pass-through to a [`ToolRegistry`]
#[derive(Clone)]
pub struct RegistryInvoker {
    registry: ToolRegistry,
}

impl RegistryInvoker {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolInvoker for RegistryInvoker {
    fn definitions(&self) -> Vec<ToolSchema> {
        self.registry.schemas()
    }

    async fn invoke(&self, call: &ToolCallRequest, _context: &[Message]) -> Result<String> {
        self.registry.execute(&call.name, &call.arguments).await
    }
}

pub fn spawn_schema() -> ToolSchema {
    ToolSchema {
        name: SPAWN_TOOL.into(),
        description: "Spawn a subagent to handle a task in the background. Use this for complex \
                      or time-consuming tasks that can run independently. The subagent will \
                      complete the task and report back when done."
            .into(),
        parameters: vec![
            ParameterSchema::string("task", "The task for the subagent to complete", true),
            ParameterSchema::string("label", "Optional short label for display", false),
        ],
    }
}

pub fn message_schema() -> ToolSchema {
    ToolSchema {
        name: MESSAGE_TOOL.into(),
        description: "Send a message to the user. Use this when you want to communicate \
                      something before the turn is over."
            .into(),
        parameters: vec![
            ParameterSchema::string("content", "The message content to send", true),
            ParameterSchema::string("channel", "Optional: target channel", false),
            ParameterSchema::string("chat_id", "Optional: target chat/user ID", false),
        ],
    }
}

/// Main-session tools: the registry plus `spawn` and `message`
pub struct SessionToolInvoker {
    registry: ToolRegistry,
    subagents: Arc<SubagentManager>,
    bus: Arc<MessageBus>,
    origin: SessionKey,
}

impl SessionToolInvoker {
    pub fn new(
        registry: ToolRegistry,
        subagents: Arc<SubagentManager>,
        bus: Arc<MessageBus>,
        origin: SessionKey,
    ) -> Self {
        Self {
            registry,
            subagents,
            bus,
            origin,
        }
    }

    fn spawn(&self, call: &ToolCallRequest, context: &[Message]) -> Result<String> {
        let task = call
            .str_arg("task")
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AgentError::ToolValidation("Missing required parameter: task".into()))?;

        let request = SpawnRequest {
            task: task.to_string(),
            label: call.str_arg("label").map(str::to_string),
            origin: self.origin.clone(),
            initial_context: context.to_vec(),
        };
        let task = self.subagents.spawn(request);

        Ok(format!(
            "Subagent [{}] started (id: {}). Running in background with {} active tasks.",
            task.label,
            task.task_id,
            self.subagents.running_count()
        ))
    }

    async fn send_message(&self, call: &ToolCallRequest) -> Result<String> {
        let content = call
            .str_arg("content")
            .ok_or_else(|| AgentError::ToolValidation("Missing required parameter: content".into()))?;
        let channel = call.str_arg("channel").unwrap_or(self.origin.channel());
        let chat_id = call.str_arg("chat_id").unwrap_or(self.origin.chat_id());

        if channel.is_empty() || chat_id.is_empty() {
            return Err(AgentError::ToolValidation("No target channel/chat specified".into()));
        }

        self.bus
            .publish_outbound(OutboundMessage::new(channel, chat_id, content))
            .await?;
        Ok(format!("Message sent to {}:{}", channel, chat_id))
    }
}

#[async_trait]
impl ToolInvoker for SessionToolInvoker {
    fn definitions(&self) -> Vec<ToolSchema> {
        let mut schemas = self.registry.without(&[SPAWN_TOOL, MESSAGE_TOOL]).schemas();
        schemas.push(message_schema());
        schemas.push(spawn_schema());
        schemas
    }

    async fn invoke(&self, call: &ToolCallRequest, context: &[Message]) -> Result<String> {
        match call.name.as_str() {
            SPAWN_TOOL => self.spawn(call, context),
            MESSAGE_TOOL => self.send_message(call).await,
            _ => self.registry.execute(&call.name, &call.arguments).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FailingTool, subagent_manager};
    use crate::provider::ChatResponse;
    use crate::test_support::ScriptedProvider;
    use std::collections::HashMap;

    fn call(name: &str, args: serde_json::Value) -> ToolCallRequest {
        let arguments: HashMap<String, serde_json::Value> = serde_json::from_value(args).unwrap();
        ToolCallRequest::new("call_1", name, arguments)
    }

    #[tokio::test]
    async fn test_registry_invoker_reports_missing_tool() {
        let invoker = RegistryInvoker::new(ToolRegistry::new());
        let err = invoker.invoke(&call("nope", serde_json::json!({})), &[]).await.unwrap_err();
        let content = tool_error_content(&call("nope", serde_json::json!({})), &err);
        assert_eq!(content, "Error executing nope: Tool not found: nope");
    }

    #[tokio::test]
    async fn test_session_invoker_spawns_subagent() {
        let bus = Arc::new(MessageBus::new());
        let provider = ScriptedProvider::new(vec![Ok(ChatResponse::text("sub done"))]);
        let manager = Arc::new(subagent_manager(provider, bus.clone(), ToolRegistry::new()));
        let mut registry = ToolRegistry::new();
        registry.register(FailingTool);
        let invoker = SessionToolInvoker::new(registry, manager.clone(), bus, SessionKey::new("cli", "direct"));

        let names: Vec<String> = invoker.definitions().into_iter().map(|s| s.name).collect();
        assert!(names.contains(&"spawn".to_string()));
        assert!(names.contains(&"message".to_string()));
        assert!(names.contains(&"fail".to_string()));

        let spawn = call("spawn", serde_json::json!({"task": "Summarize the release notes for version 2.0 please"}));
        let reply = invoker.invoke(&spawn, &[Message::user("context")]).await.unwrap();
        assert!(reply.starts_with("Subagent [Summarize the release notes fo...] started (id: "));

        let tasks = manager.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].initial_context, vec![Message::user("context")]);
        manager.wait(&tasks[0].task_id).await;
    }

    #[tokio::test]
    async fn test_spawn_requires_task() {
        let bus = Arc::new(MessageBus::new());
        let manager = Arc::new(subagent_manager(ScriptedProvider::new(vec![]), bus.clone(), ToolRegistry::new()));
        let invoker = SessionToolInvoker::new(ToolRegistry::new(), manager.clone(), bus, SessionKey::new("cli", "direct"));

        let result = invoker.invoke(&call("spawn", serde_json::json!({"label": "x"})), &[]).await;
        assert!(matches!(result, Err(AgentError::ToolValidation(_))));
        assert!(manager.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_message_tool_publishes_to_origin() {
        let bus = Arc::new(MessageBus::new());
        let manager = Arc::new(subagent_manager(ScriptedProvider::new(vec![]), bus.clone(), ToolRegistry::new()));
        let invoker = SessionToolInvoker::new(ToolRegistry::new(), manager, bus.clone(), SessionKey::new("telegram", "99"));

        let reply = invoker.invoke(&call("message", serde_json::json!({"content": "working on it"})), &[]).await.unwrap();
        assert_eq!(reply, "Message sent to telegram:99");

        let out = bus.consume_outbound().await.unwrap();
        assert_eq!(out, OutboundMessage::new("telegram", "99", "working on it"));
    }
}
