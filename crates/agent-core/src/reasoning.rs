//! Reasoning Loop
//!
//! Implements the ReAct (Reason + Act) pattern: call the model, run the
//! tools it asks for, feed the results back, repeat until it answers in
//! plain text or the iteration ceiling is hit.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::invocation::{ToolInvoker, tool_error_content};
use crate::message::{Conversation, Message};
use crate::metrics::AgentMetrics;
use crate::provider::{GenerationOptions, LlmProvider};

/// Where a turn is in its life
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Running,
    Completed,
    Failed,
    /// Paused between iterations waiting on the hook
    AwaitingAdjustment,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnStatus::Completed | TurnStatus::Failed)
    }
}

/// Why a turn ended in [`TurnStatus::Failed`]
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TurnFailure {
    #[error("{0}")]
    Provider(String),

    #[error("Reached the maximum of {0} iterations without a final answer")]
    IterationLimit(usize),
}

/// Progress of one turn. Only the executor mutates it; once the status is
/// terminal the state is final.
#[derive(Clone, Debug)]
pub struct TurnState {
    conversation: Conversation,
    seed_len: usize,
    iteration: usize,
    max_iterations: usize,
    status: TurnStatus,
    result: Option<String>,
    failure: Option<TurnFailure>,
}

impl TurnState {
    fn new(seed: Vec<Message>, max_iterations: usize) -> Self {
        let seed_len = seed.len();
        Self {
            conversation: Conversation::from_messages(seed),
            seed_len,
            iteration: 0,
            max_iterations,
            status: TurnStatus::Running,
            result: None,
            failure: None,
        }
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation.messages()
    }

    /// Messages appended during this turn
    pub fn new_messages(&self) -> &[Message] {
        &self.conversation.messages()[self.seed_len..]
    }

    pub fn tail(&self, n: usize) -> &[Message] {
        self.conversation.tail(n)
    }

    /// Iterations started so far (one provider call each)
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn status(&self) -> TurnStatus {
        self.status
    }

    /// Final answer, or the failure description once failed
    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn failure(&self) -> Option<&TurnFailure> {
        self.failure.as_ref()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.conversation.into_messages()
    }

    fn complete(&mut self, content: String) {
        self.conversation.push(Message::assistant(content.clone()));
        self.result = Some(content);
        self.status = TurnStatus::Completed;
    }

    fn fail(&mut self, failure: TurnFailure) {
        self.result = Some(failure.to_string());
        self.failure = Some(failure);
        self.status = TurnStatus::Failed;
    }
}

/// Extension point between iterations
#[async_trait]
pub trait TurnHook: Send + Sync {
    /// Whether the turn should pause after the tool iteration just finished
    fn should_pause(&self, _state: &TurnState) -> bool {
        false
    }

    /// Called while paused; a returned message is appended to the log
    async fn on_pause(&self, _state: &TurnState) -> Option<Message> {
        None
    }
}

/// Hook that never pauses
pub struct NoHook;

impl TurnHook for NoHook {}

/// Runs turns against one provider
pub struct TurnExecutor {
    provider: Arc<dyn LlmProvider>,
    options: GenerationOptions,
    max_iterations: usize,
    metrics: Option<Arc<AgentMetrics>>,
}

impl TurnExecutor {
    pub fn new(provider: Arc<dyn LlmProvider>, options: GenerationOptions, max_iterations: usize) -> Self {
        Self {
            provider,
            options,
            max_iterations,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AgentMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn options(&self) -> &GenerationOptions {
        &self.options
    }

    pub async fn run(&self, seed: Vec<Message>, tools: &dyn ToolInvoker) -> TurnState {
        self.run_with_hook(seed, tools, &NoHook).await
    }

    /// Run a turn to a terminal status. Provider errors end the turn;
    /// tool errors become tool messages and the loop continues.
    pub async fn run_with_hook(
        &self,
        seed: Vec<Message>,
        tools: &dyn ToolInvoker,
        hook: &dyn TurnHook,
    ) -> TurnState {
        let mut state = TurnState::new(seed, self.max_iterations);
        let schemas = tools.definitions();

        loop {
            state.iteration += 1;
            if state.iteration > state.max_iterations {
                tracing::warn!(max = state.max_iterations, "Turn hit iteration limit");
                state.fail(TurnFailure::IterationLimit(state.max_iterations));
                break;
            }

            tracing::debug!(
                provider = self.provider.name(),
                iteration = state.iteration,
                messages = state.conversation.len(),
                "Calling provider"
            );
            let started = Instant::now();
            let response = match self
                .provider
                .chat(state.conversation.messages(), &schemas, &self.options)
                .await
            {
                Ok(response) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_llm_call(response.usage.as_ref(), started.elapsed());
                    }
                    response
                }
                Err(e) => {
                    tracing::error!(error = %e, "Provider call failed");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_llm_error();
                    }
                    state.fail(TurnFailure::Provider(e.to_string()));
                    break;
                }
            };

            if !response.has_tool_calls() {
                state.complete(response.content);
                break;
            }

            let calls = response.tool_calls;
            state
                .conversation
                .push(Message::assistant_with_calls(response.content, calls.clone()));

            for call in &calls {
                tracing::debug!(tool = %call.name, id = %call.id, "Executing tool");
                let content = match tools.invoke(call, state.conversation.messages()).await {
                    Ok(output) => output,
                    Err(e) => {
                        tracing::warn!(tool = %call.name, error = %e, "Tool failed");
                        tool_error_content(call, &e)
                    }
                };
                state.conversation.push(Message::tool(call, content));
            }

            if hook.should_pause(&state) {
                state.status = TurnStatus::AwaitingAdjustment;
                if let Some(message) = hook.on_pause(&state).await {
                    state.conversation.push(message);
                }
                state.status = TurnStatus::Running;
            }
        }

        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::invocation::RegistryInvoker;
    use crate::message::{Role, ToolCallRequest};
    use crate::provider::ChatResponse;
    use crate::test_support::{EchoTool, FailingTool, ScriptedProvider, tool_call};
    use crate::tool::ToolRegistry;
    use std::sync::Mutex;

    fn executor(provider: Arc<ScriptedProvider>, max: usize) -> TurnExecutor {
        TurnExecutor::new(provider, GenerationOptions::default(), max)
    }

    fn tools() -> RegistryInvoker {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(FailingTool);
        RegistryInvoker::new(registry)
    }

    #[tokio::test]
    async fn test_plain_answer_completes() {
        let provider = ScriptedProvider::new(vec![Ok(ChatResponse::text("Hello!"))]);
        let state = executor(provider, 5).run(vec![Message::user("hi")], &tools()).await;

        assert_eq!(state.status(), TurnStatus::Completed);
        assert_eq!(state.result(), Some("Hello!"));
        assert_eq!(state.new_messages(), &[Message::assistant("Hello!")]);
    }

    #[tokio::test]
    async fn test_tool_calls_run_in_order() {
        let calls = vec![
            tool_call("c1", "echo", "one"),
            tool_call("c2", "echo", "two"),
            tool_call("c3", "echo", "three"),
        ];
        let provider = ScriptedProvider::new(vec![
            Ok(ChatResponse::with_tool_calls("", calls)),
            Ok(ChatResponse::text("done")),
        ]);
        let state = executor(provider.clone(), 5).run(vec![Message::user("go")], &tools()).await;

        assert_eq!(state.status(), TurnStatus::Completed);
        let tool_messages: Vec<&Message> = state.messages().iter().filter(|m| m.role() == Role::Tool).collect();
        assert_eq!(tool_messages.len(), 3);
        let contents: Vec<&str> = tool_messages.iter().map(|m| m.content()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);

        // The second provider call sees all three results
        let seen = provider.requests();
        assert_eq!(seen[1].iter().filter(|m| m.role() == Role::Tool).count(), 3);
    }

    #[tokio::test]
    async fn test_tool_failure_becomes_message() {
        let provider = ScriptedProvider::new(vec![
            Ok(ChatResponse::with_tool_calls("", vec![tool_call("c1", "fail", "x")])),
            Ok(ChatResponse::text("recovered")),
        ]);
        let state = executor(provider, 5).run(vec![Message::user("go")], &tools()).await;

        assert_eq!(state.status(), TurnStatus::Completed);
        let tool_msg = state.messages().iter().find(|m| m.role() == Role::Tool).unwrap();
        assert_eq!(tool_msg.content(), "Error executing fail: Tool execution error: boom");
    }

    #[tokio::test]
    async fn test_iteration_limit_fails() {
        let provider = ScriptedProvider::repeating(ChatResponse::with_tool_calls(
            "",
            vec![tool_call("c", "echo", "again")],
        ));
        let state = executor(provider.clone(), 2).run(vec![Message::user("loop")], &tools()).await;

        assert_eq!(state.status(), TurnStatus::Failed);
        assert_eq!(state.failure(), Some(&TurnFailure::IterationLimit(2)));
        assert_eq!(state.result(), Some("Reached the maximum of 2 iterations without a final answer"));
        assert_eq!(provider.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_provider_error_fails() {
        let provider = ScriptedProvider::new(vec![Err(AgentError::Provider("down".into()))]);
        let metrics = Arc::new(AgentMetrics::new());
        let state = executor(provider, 5)
            .with_metrics(metrics.clone())
            .run(vec![Message::user("hi")], &tools())
            .await;

        assert_eq!(state.status(), TurnStatus::Failed);
        assert!(matches!(state.failure(), Some(TurnFailure::Provider(msg)) if msg.contains("down")));
        assert_eq!(metrics.summary().llm_errors, 1);
    }

    struct EveryOther {
        seen: Mutex<Vec<TurnStatus>>,
    }

    #[async_trait]
    impl TurnHook for EveryOther {
        fn should_pause(&self, state: &TurnState) -> bool {
            state.iteration() % 2 == 0
        }

        async fn on_pause(&self, state: &TurnState) -> Option<Message> {
            self.seen.lock().unwrap().push(state.status());
            Some(Message::user("focus"))
        }
    }

    #[tokio::test]
    async fn test_hook_pauses_and_injects() {
        let call = |id: &str| ChatResponse::with_tool_calls("", vec![tool_call(id, "echo", "x")]);
        let provider = ScriptedProvider::new(vec![
            Ok(call("a")),
            Ok(call("b")),
            Ok(ChatResponse::text("ok")),
        ]);
        let hook = EveryOther { seen: Mutex::new(Vec::new()) };
        let state = executor(provider, 5)
            .run_with_hook(vec![Message::user("go")], &tools(), &hook)
            .await;

        assert_eq!(state.status(), TurnStatus::Completed);
        assert_eq!(*hook.seen.lock().unwrap(), vec![TurnStatus::AwaitingAdjustment]);
        let injected: Vec<&Message> = state.messages().iter().filter(|m| m.content() == "focus").collect();
        assert_eq!(injected.len(), 1);
    }

    #[test]
    fn test_tool_call_helper() {
        let call: ToolCallRequest = tool_call("id", "echo", "v");
        assert_eq!(call.str_arg("text"), Some("v"));
    }
}
