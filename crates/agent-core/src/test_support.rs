//! Fakes shared by the unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::bus::MessageBus;
use crate::config::SubagentSettings;
use crate::error::{AgentError, Result};
use crate::message::{Message, Role, ToolCallRequest};
use crate::metrics::AgentMetrics;
use crate::provider::{ChatResponse, GenerationOptions, LlmProvider};
use crate::subagent::SubagentManager;
use crate::tool::{ParameterSchema, Tool, ToolArgs, ToolRegistry, ToolSchema};

/// Replays canned responses and records every request
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ChatResponse>>>,
    fallback: Option<ChatResponse>,
    requests: Mutex<Vec<Vec<Message>>>,
    tool_names: Mutex<Vec<Vec<String>>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<ChatResponse>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            tool_names: Mutex::new(Vec::new()),
        })
    }

    /// Answers every call with `response`
    pub fn repeating(response: ChatResponse) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(response),
            requests: Mutex::new(Vec::new()),
            tool_names: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn tool_names(&self) -> Vec<Vec<String>> {
        self.tool_names.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        _options: &GenerationOptions,
    ) -> Result<ChatResponse> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.tool_names
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());

        let next = self.script.lock().unwrap().pop_front();
        match (next, &self.fallback) {
            (Some(response), _) => response,
            (None, Some(fallback)) => Ok(fallback.clone()),
            (None, None) => Err(AgentError::Provider("script exhausted".into())),
        }
    }
}

/// Sleeps before echoing the last user message. Logs `start-x`/`end-x`
/// and notices when a call is dropped half way.
pub struct SleepingProvider {
    delay: Duration,
    log: Mutex<Vec<String>>,
    started: Notify,
    interrupted: AtomicBool,
}

struct InterruptGuard<'a> {
    provider: &'a SleepingProvider,
    armed: bool,
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.provider.interrupted.store(true, Ordering::SeqCst);
        }
    }
}

impl SleepingProvider {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            log: Mutex::new(Vec::new()),
            started: Notify::new(),
            interrupted: AtomicBool::new(false),
        })
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Resolves once a chat call is in flight
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for SleepingProvider {
    fn name(&self) -> &str {
        "sleeping"
    }

    async fn chat(
        &self,
        messages: &[Message],
        _tools: &[ToolSchema],
        _options: &GenerationOptions,
    ) -> Result<ChatResponse> {
        let text = messages
            .iter()
            .rev()
            .find(|m| m.role() == Role::User)
            .map(|m| m.content().to_string())
            .unwrap_or_default();

        self.log.lock().unwrap().push(format!("start-{}", text));
        self.started.notify_one();
        let mut guard = InterruptGuard {
            provider: self,
            armed: true,
        };
        tokio::time::sleep(self.delay).await;
        guard.armed = false;
        self.log.lock().unwrap().push(format!("end-{}", text));

        Ok(ChatResponse::text(format!("reply to {}", text)))
    }
}

/// Returns its `text` argument
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "echo".into(),
            description: "Echo the input".into(),
            parameters: vec![ParameterSchema::string("text", "Text to echo", true)],
        }
    }

    async fn execute(&self, args: &ToolArgs) -> Result<String> {
        Ok(args.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string())
    }
}

/// Always fails
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "fail".into(),
            description: "Always fails".into(),
            parameters: Vec::new(),
        }
    }

    async fn execute(&self, _args: &ToolArgs) -> Result<String> {
        Err(AgentError::ToolExecution("boom".into()))
    }
}

/// No-op tool registered under an arbitrary name
pub struct NamedTool(pub &'static str);

#[async_trait]
impl Tool for NamedTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.0.into(),
            description: format!("{} stand-in", self.0),
            parameters: Vec::new(),
        }
    }

    async fn execute(&self, _args: &ToolArgs) -> Result<String> {
        Ok(self.0.to_string())
    }
}

pub fn tool_call(id: &str, name: &str, text: &str) -> ToolCallRequest {
    let arguments = HashMap::from([("text".to_string(), serde_json::json!(text))]);
    ToolCallRequest::new(id, name, arguments)
}

pub fn test_subagent_settings() -> SubagentSettings {
    SubagentSettings {
        max_iterations: 15,
        adjustment_interval: 3,
        adjustment_timeout: Duration::from_millis(50),
        context_messages: 10,
        context_tail: 5,
    }
}

pub fn subagent_manager(
    provider: Arc<dyn LlmProvider>,
    bus: Arc<MessageBus>,
    tools: ToolRegistry,
) -> SubagentManager {
    subagent_manager_with(provider, bus, tools, test_subagent_settings())
}

pub fn subagent_manager_with(
    provider: Arc<dyn LlmProvider>,
    bus: Arc<MessageBus>,
    tools: ToolRegistry,
    settings: SubagentSettings,
) -> SubagentManager {
    SubagentManager::new(
        provider,
        GenerationOptions::default(),
        &tools,
        bus,
        settings,
        Arc::new(AgentMetrics::new()),
    )
}
