//! Subagent Manager
//!
//! Runs delegated tasks as independent turns in the background. Each
//! subagent gets a restricted tool set, a bounded snapshot of the parent's
//! context and its own cancellation token. Results travel back to the origin
//! session as `system` inbound events; subagents never touch the parent's
//! state directly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::messenger::SubagentMessenger;
use super::task::{SubagentStatus, SubagentTask};
use crate::bus::{InboundMessage, KIND_SUBAGENT_RESULT, MessageBus};
use crate::config::SubagentSettings;
use crate::invocation::{MESSAGE_TOOL, RegistryInvoker, SPAWN_TOOL};
use crate::message::{Message, Role};
use crate::metrics::AgentMetrics;
use crate::provider::{GenerationOptions, LlmProvider};
use crate::reasoning::{TurnExecutor, TurnHook, TurnState, TurnStatus};
use crate::session::SessionKey;
use crate::tool::ToolRegistry;

const NO_RESULT: &str = "Task completed but no final response was generated.";
const CONTEXT_LINE_CHARS: usize = 500;
const PROGRESS_LINE_CHARS: usize = 300;

/// Arguments of an accepted `spawn` call
#[derive(Clone, Debug)]
pub struct SpawnRequest {
    pub task: String,
    pub label: Option<String>,
    pub origin: SessionKey,
    /// Parent turn log at the time of the call; trimmed on spawn
    pub initial_context: Vec<Message>,
}

struct TaskEntry {
    task: SubagentTask,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    provider: Arc<dyn LlmProvider>,
    options: GenerationOptions,
    tools: ToolRegistry,
    bus: Arc<MessageBus>,
    messenger: Arc<SubagentMessenger>,
    settings: SubagentSettings,
    metrics: Arc<AgentMetrics>,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    issued: Mutex<HashSet<String>>,
}

pub struct SubagentManager {
    shared: Arc<Shared>,
}

impl SubagentManager {
    /// `tools` is the main registry; `spawn` and `message` are stripped from it.
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        options: GenerationOptions,
        tools: &ToolRegistry,
        bus: Arc<MessageBus>,
        settings: SubagentSettings,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        let messenger = Arc::new(SubagentMessenger::new(bus.clone()));
        Self {
            shared: Arc::new(Shared {
                provider,
                options,
                tools: tools.without(&[SPAWN_TOOL, MESSAGE_TOOL]),
                bus,
                messenger,
                settings,
                metrics,
                tasks: Mutex::new(HashMap::new()),
                issued: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn messenger(&self) -> &Arc<SubagentMessenger> {
        &self.shared.messenger
    }

    /// Record the task as running and start it; returns immediately
    pub fn spawn(&self, request: SpawnRequest) -> SubagentTask {
        let task_id = self.shared.allocate_id();
        let context = bounded_context(&request.initial_context, self.shared.settings.context_messages);
        let task = SubagentTask::new(task_id.clone(), request.task, request.label, request.origin, context);
        let cancel = CancellationToken::new();

        self.shared.lock_tasks().insert(
            task_id.clone(),
            TaskEntry {
                task: task.clone(),
                cancel: cancel.clone(),
                handle: None,
            },
        );
        self.shared.metrics.subagent_spawned();
        tracing::info!(task_id = %task_id, label = %task.label, origin = %task.origin, "Spawned subagent");

        let handle = tokio::spawn(run_subagent(self.shared.clone(), task.clone(), cancel));
        if let Some(entry) = self.shared.lock_tasks().get_mut(&task_id) {
            entry.handle = Some(handle);
        }
        task
    }

    /// Cancel a live subagent. False when unknown or already finished.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut tasks = self.shared.lock_tasks();
        let Some(entry) = tasks.get_mut(task_id) else {
            return false;
        };
        if !entry.task.finish(SubagentStatus::Cancelled, None) {
            return false;
        }
        entry.cancel.cancel();
        self.shared.metrics.subagent_cancelled();
        tracing::info!(task_id, "Cancelled subagent");
        true
    }

    /// Wait for the subagent's background task to end and return its record
    pub async fn wait(&self, task_id: &str) -> Option<SubagentTask> {
        let handle = self.shared.lock_tasks().get_mut(task_id)?.handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(task_id, error = %e, "Subagent task panicked");
            }
        }
        self.get(task_id)
    }

    pub fn get(&self, task_id: &str) -> Option<SubagentTask> {
        self.shared.lock_tasks().get(task_id).map(|e| e.task.clone())
    }

    /// Snapshot of every tracked task, oldest first
    pub fn tasks(&self) -> Vec<SubagentTask> {
        let mut tasks: Vec<SubagentTask> = self.shared.lock_tasks().values().map(|e| e.task.clone()).collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.task_id.cmp(&b.task_id)));
        tasks
    }

    pub fn running_count(&self) -> usize {
        self.shared
            .lock_tasks()
            .values()
            .filter(|e| !e.task.status.is_terminal())
            .count()
    }

    /// Drop finished tasks from the table; returns how many were removed
    pub fn prune_finished(&self) -> usize {
        let mut tasks = self.shared.lock_tasks();
        let before = tasks.len();
        tasks.retain(|_, e| !e.task.status.is_terminal());
        let removed = before - tasks.len();
        if removed > 0 {
            tracing::debug!(removed, "Pruned finished subagents");
        }
        removed
    }
}

impl Shared {
    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<String, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Short id that has never been handed out before
    fn allocate_id(&self) -> String {
        let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let id: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
            if issued.insert(id.clone()) {
                return id;
            }
        }
    }

    fn set_status(&self, task_id: &str, status: SubagentStatus) {
        if let Some(entry) = self.lock_tasks().get_mut(task_id) {
            entry.task.transition(status);
        }
    }

    /// Terminal update under the table lock; `None` if the task was already final
    fn finish(&self, task_id: &str, status: SubagentStatus, result: String) -> Option<SubagentTask> {
        let mut tasks = self.lock_tasks();
        let entry = tasks.get_mut(task_id)?;
        if !entry.task.finish(status, Some(result)) {
            return None;
        }
        match status {
            SubagentStatus::Completed => self.metrics.subagent_completed(),
            SubagentStatus::Failed => self.metrics.subagent_failed(),
            SubagentStatus::Cancelled => self.metrics.subagent_cancelled(),
            _ => {}
        }
        Some(entry.task.clone())
    }

    async fn announce(&self, task: &SubagentTask) {
        let result = task.result.as_deref().unwrap_or(NO_RESULT);
        let content = format!(
            "[Subagent '{}' {}]\n\nTask: {}\n\nResult:\n{}\n\nSummarize this naturally for the user. Keep it brief (1-2 sentences).",
            task.label, task.status, task.task, result
        );
        let event = InboundMessage::system_event(
            format!("subagent:{}", task.task_id),
            &task.origin,
            KIND_SUBAGENT_RESULT,
            &task.task_id,
            content,
        );
        if let Err(e) = self.bus.publish_inbound(event).await {
            tracing::error!(task_id = %task.task_id, error = %e, "Could not announce subagent result");
        }
    }
}

async fn run_subagent(shared: Arc<Shared>, task: SubagentTask, cancel: CancellationToken) {
    let executor = TurnExecutor::new(shared.provider.clone(), shared.options.clone(), shared.settings.max_iterations)
        .with_metrics(shared.metrics.clone());
    let tools = RegistryInvoker::new(shared.tools.clone());
    let hook = AdjustmentHook {
        shared: &shared,
        task: &task,
    };
    let seed = vec![
        Message::system(subagent_prompt(&task, &shared.tools)),
        Message::user(task.task.clone()),
    ];

    let state = tokio::select! {
        _ = cancel.cancelled() => None,
        state = executor.run_with_hook(seed, &tools, &hook) => Some(state),
    };

    let Some(state) = state else {
        tracing::info!(task_id = %task.task_id, "Subagent stopped");
        return;
    };

    let (status, result) = match state.status() {
        TurnStatus::Completed => {
            let text = state.result().map(str::trim).filter(|r| !r.is_empty()).unwrap_or(NO_RESULT);
            (SubagentStatus::Completed, text.to_string())
        }
        _ => (
            SubagentStatus::Failed,
            state.result().unwrap_or("Subagent failed").to_string(),
        ),
    };

    match shared.finish(&task.task_id, status, result) {
        Some(finished) => {
            tracing::info!(
                task_id = %finished.task_id,
                status = %finished.status,
                iterations = state.iteration().min(state.max_iterations()),
                "Subagent finished"
            );
            shared.announce(&finished).await;
        }
        None => tracing::debug!(task_id = %task.task_id, "Subagent finished after cancellation"),
    }
}

/// Asks the parent for steering every `adjustment_interval` tool iterations
struct AdjustmentHook<'a> {
    shared: &'a Shared,
    task: &'a SubagentTask,
}

#[async_trait]
impl<'a> TurnHook for AdjustmentHook<'a> {
    fn should_pause(&self, state: &TurnState) -> bool {
        let interval = self.shared.settings.adjustment_interval;
        interval > 0 && state.iteration() % interval == 0
    }

    async fn on_pause(&self, state: &TurnState) -> Option<Message> {
        let task_id = self.task.task_id.as_str();
        self.shared.set_status(task_id, SubagentStatus::AwaitingAdjustment);

        let request = adjustment_request(self.task, state, self.shared.settings.context_tail);
        let answer = self
            .shared
            .messenger
            .request_adjustment(task_id, &self.task.origin, request, self.shared.settings.adjustment_timeout)
            .await;

        self.shared.set_status(task_id, SubagentStatus::Running);

        let text = answer?;
        let text = text.trim();
        if text.is_empty() || text.eq_ignore_ascii_case("continue") {
            return None;
        }
        Some(Message::user(format!("[Adjustment from main agent]\n{}", text)))
    }
}

/// Last `limit` non-system messages of the parent's log
fn bounded_context(messages: &[Message], limit: usize) -> Vec<Message> {
    let relevant: Vec<&Message> = messages.iter().filter(|m| m.role() != Role::System).collect();
    let start = relevant.len().saturating_sub(limit);
    relevant[start..].iter().map(|m| (*m).clone()).collect()
}

fn subagent_prompt(task: &SubagentTask, tools: &ToolRegistry) -> String {
    let tool_list = if tools.is_empty() {
        "(no tools)".to_string()
    } else {
        tools.names().join(", ")
    };
    let context = if task.initial_context.is_empty() {
        "(none)".to_string()
    } else {
        task.initial_context
            .iter()
            .map(|m| m.summary_line(CONTEXT_LINE_CHARS))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"# Subagent

You are a subagent spawned by the main agent to complete a specific task.

## Your Task
{task}

## Rules
1. Stay focused on the assigned task and nothing else.
2. Your final response is reported back to the main agent.
3. Do not start side tasks and do not spawn other subagents.
4. You cannot message the user directly.
5. You only know the context below, not the full conversation.
6. The main agent may send you adjustments while you work. Follow them.

## Available Tools
{tool_list}

## Context from the main conversation
{context}

When you have completed the task, give a clear summary of your findings or actions."#,
        task = task.task,
    )
}

fn adjustment_request(task: &SubagentTask, state: &TurnState, tail: usize) -> String {
    let progress = state
        .tail(tail)
        .iter()
        .map(|m| format!("- {}", m.summary_line(PROGRESS_LINE_CHARS)))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "[Subagent '{}' requests adjustment]\n\nTask: {}\nIteration: {}/{}\n\nRecent progress:\n{}\n\nReply with brief guidance for the subagent, or CONTINUE if it is on track.",
        task.label,
        task.task,
        state.iteration(),
        state.max_iterations(),
        progress
    )
}
