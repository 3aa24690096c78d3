//! Agent Loop
//!
//! Consumes the inbound queue and turns messages into replies. Turns for one
//! session run strictly one after another in arrival order; different
//! sessions run concurrently. Each running turn is registered in the active
//! task table so `/stop` can cancel it, and the entry is removed on every
//! exit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;

use crate::bus::{InboundMessage, KIND_ADJUSTMENT_REQUEST, MessageBus, OutboundMessage};
use crate::command::{self, HELP, NEW, STOP};
use crate::config::AgentSettings;
use crate::error::{AgentError, Result};
use crate::invocation::SessionToolInvoker;
use crate::message::Message;
use crate::metrics::AgentMetrics;
use crate::provider::LlmProvider;
use crate::reasoning::{TurnExecutor, TurnFailure, TurnStatus};
use crate::session::{MemorySessionStore, SessionKey, SessionStore};
use crate::subagent::SubagentManager;
use crate::tool::ToolRegistry;

const EMPTY_REPLY: &str = "I've completed processing but have no response to give.";
const NO_ACTIVE_TASK: &str = "No active task to stop.";
const TASK_STOPPED: &str = "⏹ Task stopped.";
const NEW_SESSION: &str = "New session started.";

const ADJUSTMENT_PROMPT: &str = "You are supervising a background subagent working on a task you \
delegated. Read its progress report and reply with one or two sentences of guidance, or reply \
CONTINUE if it is on track. Do not address the user.";

/// A registered in-flight turn
struct ActiveTask {
    turn_id: u64,
    cancel: CancellationToken,
    exit: Arc<TurnExit>,
}

/// Signalled by the dispatch boundary when the turn lets go
#[derive(Default)]
struct TurnExit {
    notify: Notify,
    cancelled: AtomicBool,
}

impl TurnExit {
    fn finish(&self, cancelled: bool) {
        self.cancelled.store(cancelled, Ordering::Release);
        self.notify.notify_one();
    }

    fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

type ActiveTable = Mutex<HashMap<SessionKey, ActiveTask>>;

/// Removes the turn's own entry from the active table when dropped
struct ActiveGuard<'a> {
    table: &'a ActiveTable,
    key: &'a SessionKey,
    turn_id: u64,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if table.get(self.key).is_some_and(|t| t.turn_id == self.turn_id) {
            table.remove(self.key);
        }
    }
}

/// Tail of each session's queue: the newest ticket's id and release signal
type QueueTable = Mutex<HashMap<SessionKey, (u64, oneshot::Receiver<()>)>>;

/// Place in a session's queue. Issued in arrival order; each ticket waits
/// until the previous one for the same session is dropped.
struct SessionTicket {
    queues: Arc<QueueTable>,
    key: SessionKey,
    id: u64,
    previous: Option<oneshot::Receiver<()>>,
    _release: oneshot::Sender<()>,
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if queues.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
            queues.remove(&self.key);
        }
    }
}

impl SessionTicket {
    async fn wait_turn(&mut self) {
        if let Some(previous) = self.previous.take() {
            // Err just means the previous holder is gone
            let _ = previous.await;
        }
    }
}

pub struct AgentLoop {
    bus: Arc<MessageBus>,
    provider: Arc<dyn LlmProvider>,
    tools: ToolRegistry,
    sessions: Arc<dyn SessionStore>,
    subagents: Arc<SubagentManager>,
    settings: AgentSettings,
    metrics: Arc<AgentMetrics>,
    queues: Arc<QueueTable>,
    active: ActiveTable,
    next_turn: AtomicU64,
    next_ticket: AtomicU64,
}

impl AgentLoop {
    pub fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        settings: AgentSettings,
    ) -> Self {
        let metrics = Arc::new(AgentMetrics::new());
        let subagents = Arc::new(SubagentManager::new(
            provider.clone(),
            settings.generation(),
            &tools,
            bus.clone(),
            settings.subagent.clone(),
            metrics.clone(),
        ));
        Self {
            bus,
            provider,
            tools,
            sessions: Arc::new(MemorySessionStore::new()),
            subagents,
            settings,
            metrics,
            queues: Arc::new(Mutex::new(HashMap::new())),
            active: Mutex::new(HashMap::new()),
            next_turn: AtomicU64::new(1),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn with_session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn subagents(&self) -> &Arc<SubagentManager> {
        &self.subagents
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn metrics(&self) -> &Arc<AgentMetrics> {
        &self.metrics
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn has_active_task(&self, key: &SessionKey) -> bool {
        self.lock_active().contains_key(key)
    }

    /// Consume inbound messages until `shutdown` fires or the bus closes
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(provider = self.provider.name(), model = %self.settings.model, "Agent loop started");
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = self.bus.consume_inbound() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.handle_inbound(msg);
        }
        tracing::info!("Agent loop stopped");
    }

    /// Route one inbound message. Never blocks on a turn.
    pub fn handle_inbound(self: &Arc<Self>, msg: InboundMessage) {
        if msg.is_system() && msg.metadata_str("kind") == Some(KIND_ADJUSTMENT_REQUEST) {
            tokio::spawn(self.clone().answer_adjustment(msg));
            return;
        }

        if !msg.is_system() {
            if let Some(cmd) = command::parse_command(&msg.content) {
                if command::is_immediate_command(&cmd) {
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_immediate_command(&cmd, &msg).await });
                    return;
                }
            }
        }

        let ticket = self.ticket(&route_key(&msg));
        tokio::spawn(self.clone().dispatch(msg, ticket));
    }

    /// Commands that act on arrival, outside the session queue
    pub async fn handle_immediate_command(&self, cmd: &str, msg: &InboundMessage) {
        let reply = match cmd {
            STOP => self.stop(&msg.session_key()).await,
            other => {
                tracing::warn!(command = other, "No handler for immediate command");
                return;
            }
        };
        if let Err(e) = self.bus.publish_outbound(OutboundMessage::reply_to(msg, reply)).await {
            tracing::error!(error = %e, "Could not publish command reply");
        }
    }

    /// Cancel the session's running turn and wait briefly for it to let go
    async fn stop(&self, key: &SessionKey) -> &'static str {
        let active = self
            .lock_active()
            .get(key)
            .map(|t| (t.cancel.clone(), t.exit.clone()));

        let Some((cancel, exit)) = active else {
            return NO_ACTIVE_TASK;
        };

        cancel.cancel();
        if tokio::time::timeout(self.settings.stop_ack_timeout, exit.notify.notified())
            .await
            .is_err()
        {
            tracing::warn!(session = %key, "Cancelled turn did not acknowledge in time");
        } else if !exit.was_cancelled() {
            // Finished on its own before the cancellation landed
            tracing::debug!(session = %key, "Turn completed before stop");
            return NO_ACTIVE_TASK;
        }
        tracing::info!(session = %key, "Task stopped");
        TASK_STOPPED
    }

    /// Process one message through the session queue and return the reply
    /// text, for callers without a channel
    pub async fn process_direct(&self, content: &str, channel: &str, chat_id: &str) -> Result<String> {
        let msg = InboundMessage::new(channel, "user", chat_id, content);
        if let Some(cmd) = command::parse_command(content) {
            if cmd == STOP {
                return Ok(self.stop(&msg.session_key()).await.to_string());
            }
        }

        let ticket = self.ticket(&msg.session_key());
        let reply = self.run_serialized(&msg, ticket).await?;
        Ok(reply.map(|out| out.content).unwrap_or_default())
    }

    async fn dispatch(self: Arc<Self>, msg: InboundMessage, ticket: SessionTicket) {
        match self.run_serialized(&msg, ticket).await {
            Ok(Some(out)) => {
                if let Err(e) = self.bus.publish_outbound(out).await {
                    tracing::error!(error = %e, "Could not publish reply");
                }
            }
            Ok(None) => {}
            Err(e) if e.is_cancelled() => {
                tracing::debug!(session = %route_key(&msg), "Turn ended by cancellation");
            }
            Err(e) => {
                tracing::error!(session = %route_key(&msg), error = %e, "Error processing message");
                let key = route_key(&msg);
                let apology = OutboundMessage::new(
                    key.channel(),
                    key.chat_id(),
                    format!("Sorry, I encountered an error: {}", e.user_message()),
                );
                if let Err(e) = self.bus.publish_outbound(apology).await {
                    tracing::error!(error = %e, "Could not publish error reply");
                }
            }
        }
    }

    /// Wait for the session's turn, register it as active and run it under
    /// its cancellation token
    async fn run_serialized(&self, msg: &InboundMessage, mut ticket: SessionTicket) -> Result<Option<OutboundMessage>> {
        ticket.wait_turn().await;

        let key = route_key(msg);
        let (guard, cancel, exit) = self.register_turn(&key);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            result = self.process_message(msg, &key) => result,
        };

        drop(guard);
        exit.finish(matches!(outcome, Err(AgentError::Cancelled)));
        self.subagents.prune_finished();
        outcome
    }

    /// Run the turn for one message. Deferred commands are handled here.
    async fn process_message(&self, msg: &InboundMessage, key: &SessionKey) -> Result<Option<OutboundMessage>> {
        let input = if msg.is_system() {
            tracing::info!(session = %key, sender = %msg.sender_id, "Processing system message");
            Message::system(msg.content.clone())
        } else {
            tracing::info!(session = %key, preview = %preview(&msg.content), "Processing message");
            match command::parse_command(&msg.content).as_deref() {
                Some(NEW) => {
                    self.sessions.clear(key)?;
                    return Ok(Some(reply(key, NEW_SESSION)));
                }
                Some(HELP) => return Ok(Some(reply(key, command::help_text()))),
                _ => Message::user(msg.content.clone()),
            }
        };

        let mut seed = vec![Message::system(self.settings.system_prompt.clone())];
        seed.extend(self.sessions.history(key, self.settings.history_limit)?);
        seed.push(input.clone());

        let invoker = SessionToolInvoker::new(self.tools.clone(), self.subagents.clone(), self.bus.clone(), key.clone());
        let executor = TurnExecutor::new(self.provider.clone(), self.settings.generation(), self.settings.max_iterations)
            .with_metrics(self.metrics.clone());
        let state = executor.run(seed, &invoker).await;

        let mut session = self.sessions.get_or_create(key)?;
        session.append_turn(
            std::iter::once(input).chain(state.new_messages().iter().cloned()),
            self.settings.history_limit,
        );
        self.sessions.save(&session)?;

        let content = match (state.status(), state.failure()) {
            (TurnStatus::Completed, _) => match state.result() {
                Some(text) if !text.trim().is_empty() => text.to_string(),
                _ => EMPTY_REPLY.to_string(),
            },
            (_, Some(TurnFailure::Provider(detail))) => format!("Sorry, I encountered an error: {}", detail),
            _ => state.result().unwrap_or(EMPTY_REPLY).to_string(),
        };
        tracing::info!(session = %key, status = ?state.status(), iterations = state.iteration(), "Turn finished");

        Ok(Some(reply(key, content)))
    }

    /// One tool-less call over the origin session's history; the answer
    /// goes straight back to the waiting subagent
    async fn answer_adjustment(self: Arc<Self>, msg: InboundMessage) {
        let Some(task_id) = msg.metadata_str("task_id").map(str::to_string) else {
            tracing::warn!("Adjustment request without task_id");
            return;
        };
        let origin = SessionKey::from_string(msg.chat_id.clone());

        let history = self
            .sessions
            .history(&origin, self.settings.history_limit)
            .unwrap_or_else(|e| {
                tracing::warn!(session = %origin, error = %e, "No history for adjustment");
                Vec::new()
            });
        let mut messages = vec![Message::system(ADJUSTMENT_PROMPT)];
        messages.extend(history);
        messages.push(Message::user(msg.content.clone()));

        let options = self.settings.generation();
        let call = self.provider.chat(&messages, &[], &options);
        match tokio::time::timeout(self.settings.subagent.adjustment_timeout, call).await {
            Ok(Ok(response)) => {
                if self.subagents.messenger().deliver_adjustment(&task_id, response.content) {
                    tracing::debug!(task_id = %task_id, "Adjustment delivered");
                }
            }
            Ok(Err(e)) => tracing::warn!(task_id = %task_id, error = %e, "Adjustment call failed"),
            Err(_) => tracing::warn!(task_id = %task_id, "Adjustment call timed out"),
        }
    }

    fn ticket(&self, key: &SessionKey) -> SessionTicket {
        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (release, next) = oneshot::channel();
        let previous = self
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), (id, next))
            .map(|(_, rx)| rx);
        SessionTicket {
            queues: self.queues.clone(),
            key: key.clone(),
            id,
            previous,
            _release: release,
        }
    }

    /// Enter the turn in the active table; the guard takes it out again
    fn register_turn<'a>(&'a self, key: &'a SessionKey) -> (ActiveGuard<'a>, CancellationToken, Arc<TurnExit>) {
        let turn_id = self.next_turn.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let exit = Arc::new(TurnExit::default());
        self.lock_active().insert(
            key.clone(),
            ActiveTask {
                turn_id,
                cancel: cancel.clone(),
                exit: exit.clone(),
            },
        );
        let guard = ActiveGuard {
            table: &self.active,
            key,
            turn_id,
        };
        (guard, cancel, exit)
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<SessionKey, ActiveTask>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Session a message belongs to; system events carry it in `chat_id`
fn route_key(msg: &InboundMessage) -> SessionKey {
    if msg.is_system() {
        SessionKey::from_string(msg.chat_id.clone())
    } else {
        msg.session_key()
    }
}

fn reply(key: &SessionKey, content: impl Into<String>) -> OutboundMessage {
    OutboundMessage::new(key.channel(), key.chat_id(), content)
}

fn preview(content: &str) -> String {
    let head: String = content.chars().take(80).collect();
    if head.len() < content.len() {
        format!("{}...", head)
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::KIND_SUBAGENT_RESULT;
    use crate::message::Role;
    use crate::provider::ChatResponse;
    use crate::test_support::{ScriptedProvider, SleepingProvider, test_subagent_settings};
    use std::time::Duration;

    fn settings() -> AgentSettings {
        AgentSettings {
            stop_ack_timeout: Duration::from_secs(2),
            subagent: test_subagent_settings(),
            ..AgentSettings::default()
        }
    }

    fn start(provider: Arc<dyn LlmProvider>) -> (Arc<MessageBus>, Arc<AgentLoop>, CancellationToken) {
        let bus = Arc::new(MessageBus::new());
        let agent = Arc::new(AgentLoop::new(bus.clone(), provider, ToolRegistry::new(), settings()));
        let shutdown = CancellationToken::new();
        tokio::spawn(agent.clone().run(shutdown.clone()));
        (bus, agent, shutdown)
    }

    async fn next_outbound(bus: &MessageBus) -> OutboundMessage {
        tokio::time::timeout(Duration::from_secs(5), bus.consume_outbound())
            .await
            .expect("no outbound message")
            .unwrap()
    }

    async fn assert_quiet(bus: &MessageBus) {
        let extra = tokio::time::timeout(Duration::from_millis(100), bus.consume_outbound()).await;
        assert!(extra.is_err(), "unexpected outbound: {:?}", extra);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_session_turns_are_serialized() {
        let provider = SleepingProvider::new(Duration::from_millis(50));
        let (bus, _agent, shutdown) = start(provider.clone());

        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "a")).await.unwrap();
        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "b")).await.unwrap();

        assert_eq!(next_outbound(&bus).await.content, "reply to a");
        assert_eq!(next_outbound(&bus).await.content, "reply to b");
        assert_eq!(provider.log(), vec!["start-a", "end-a", "start-b", "end-b"]);
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_different_sessions_run_concurrently() {
        let provider = SleepingProvider::new(Duration::from_millis(100));
        let (bus, _agent, shutdown) = start(provider.clone());

        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "a")).await.unwrap();
        bus.publish_inbound(InboundMessage::new("test", "u2", "c2", "b")).await.unwrap();
        next_outbound(&bus).await;
        next_outbound(&bus).await;

        let log = provider.log();
        assert!(log[..2].iter().all(|entry| entry.starts_with("start-")), "{:?}", log);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stop_without_active_task() {
        let (bus, agent, shutdown) = start(ScriptedProvider::new(vec![]));

        let msg = InboundMessage::new("test", "u1", "c1", "/stop");
        agent.handle_immediate_command(STOP, &msg).await;

        let out = next_outbound(&bus).await;
        assert!(out.content.contains("No active task"));
        assert_quiet(&bus).await;
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_cancels_running_turn() {
        let provider = SleepingProvider::new(Duration::from_secs(60));
        let (bus, agent, shutdown) = start(provider.clone());
        let key = SessionKey::new("test", "c1");

        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "long job")).await.unwrap();
        provider.wait_started().await;
        assert!(agent.has_active_task(&key));

        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "  /STOP")).await.unwrap();

        let out = next_outbound(&bus).await;
        assert_eq!(out.content, TASK_STOPPED);
        assert!(provider.was_interrupted());
        assert!(!agent.has_active_task(&key));
        assert_quiet(&bus).await;
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_session_continues_after_stop() {
        let provider = SleepingProvider::new(Duration::from_millis(300));
        let (bus, agent, shutdown) = start(provider.clone());

        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "first")).await.unwrap();
        provider.wait_started().await;
        let msg = InboundMessage::new("test", "u1", "c1", "/stop");
        agent.handle_immediate_command(STOP, &msg).await;
        assert_eq!(next_outbound(&bus).await.content, TASK_STOPPED);

        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "second")).await.unwrap();
        assert_eq!(next_outbound(&bus).await.content, "reply to second");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cleanup_after_completion_and_error() {
        let provider = ScriptedProvider::new(vec![
            Ok(ChatResponse::text("hi there")),
            Err(AgentError::Provider("connection refused".into())),
        ]);
        let (bus, agent, shutdown) = start(provider);
        let key = SessionKey::new("test", "c1");

        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "hello")).await.unwrap();
        assert_eq!(next_outbound(&bus).await.content, "hi there");
        assert!(!agent.has_active_task(&key));

        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "again")).await.unwrap();
        let out = next_outbound(&bus).await;
        assert!(out.content.starts_with("Sorry, I encountered an error:"));
        assert!(out.content.contains("connection refused"));
        assert!(!agent.has_active_task(&key));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_empty_answer_gets_placeholder() {
        let (bus, _agent, shutdown) = start(ScriptedProvider::new(vec![Ok(ChatResponse::text("  "))]));
        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "hello")).await.unwrap();
        assert_eq!(next_outbound(&bus).await.content, EMPTY_REPLY);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_history_and_new_command() {
        let provider = ScriptedProvider::new(vec![Ok(ChatResponse::text("one")), Ok(ChatResponse::text("two"))]);
        let (bus, agent, shutdown) = start(provider.clone());
        let key = SessionKey::new("test", "c1");

        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "first")).await.unwrap();
        next_outbound(&bus).await;
        assert_eq!(agent.sessions().history(&key, 50).unwrap().len(), 2);

        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "/new")).await.unwrap();
        assert_eq!(next_outbound(&bus).await.content, NEW_SESSION);
        assert!(agent.sessions().history(&key, 50).unwrap().is_empty());

        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "second")).await.unwrap();
        next_outbound(&bus).await;
        let second = &provider.requests()[1];
        assert_eq!(second.len(), 2);
        assert_eq!(second[1], Message::user("second"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_help_and_unknown_commands() {
        let provider = ScriptedProvider::new(vec![Ok(ChatResponse::text("no idea"))]);
        let (bus, _agent, shutdown) = start(provider.clone());

        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "/help")).await.unwrap();
        let help = next_outbound(&bus).await;
        assert!(help.content.contains("/stop"));

        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "/frobnicate now")).await.unwrap();
        assert_eq!(next_outbound(&bus).await.content, "no idea");
        assert_eq!(provider.requests()[0].last(), Some(&Message::user("/frobnicate now")));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_subagent_result_runs_on_origin_session() {
        let provider = ScriptedProvider::new(vec![Ok(ChatResponse::text("Your files are ready."))]);
        let (bus, _agent, shutdown) = start(provider.clone());
        let origin = SessionKey::new("telegram", "42");

        let event = InboundMessage::system_event(
            "subagent:ab12cd34",
            &origin,
            KIND_SUBAGENT_RESULT,
            "ab12cd34",
            "[Subagent 'files' completed]\n\nTask: files\n\nResult:\nok",
        );
        bus.publish_inbound(event).await.unwrap();

        let out = next_outbound(&bus).await;
        assert_eq!(out.channel, "telegram");
        assert_eq!(out.chat_id, "42");
        assert_eq!(out.content, "Your files are ready.");

        let seen = &provider.requests()[0];
        let last = seen.last().unwrap();
        assert_eq!(last.role(), Role::System);
        assert!(last.content().starts_with("[Subagent 'files' completed]"));
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_adjustment_request_is_answered() {
        let provider = ScriptedProvider::new(vec![Ok(ChatResponse::text("Skip the archive folder"))]);
        let (_bus, agent, shutdown) = start(provider.clone());
        let origin = SessionKey::new("cli", "direct");

        let answer = agent
            .subagents()
            .messenger()
            .request_adjustment("t1", &origin, "[Subagent 'x' requests adjustment]".into(), Duration::from_secs(5))
            .await;
        assert_eq!(answer.as_deref(), Some("Skip the archive folder"));

        let seen = &provider.requests()[0];
        assert_eq!(seen[0].content(), ADJUSTMENT_PROMPT);
        assert_eq!(seen.last(), Some(&Message::user("[Subagent 'x' requests adjustment]")));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_process_direct_returns_reply() {
        let bus = Arc::new(MessageBus::new());
        let provider = ScriptedProvider::new(vec![Ok(ChatResponse::text("pong"))]);
        let agent = AgentLoop::new(bus, provider, ToolRegistry::new(), settings());

        assert_eq!(agent.process_direct("ping", "cli", "direct").await.unwrap(), "pong");
        assert_eq!(agent.process_direct("/stop", "cli", "direct").await.unwrap(), NO_ACTIVE_TASK);
        assert!(!agent.has_active_task(&SessionKey::new("cli", "direct")));
    }

    fn queued_sessions(agent: &AgentLoop) -> usize {
        agent.queues.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_idle_sessions_leave_no_queue_entries() {
        let bus = Arc::new(MessageBus::new());
        let provider = ScriptedProvider::repeating(ChatResponse::text("ok"));
        let agent = AgentLoop::new(bus, provider, ToolRegistry::new(), settings());

        for i in 0..100 {
            let chat_id = format!("chat-{}", i);
            assert_eq!(agent.process_direct("hi", "http", &chat_id).await.unwrap(), "ok");
        }
        assert_eq!(queued_sessions(&agent), 0);
        assert!(agent.lock_active().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queue_entry_survives_until_last_turn_ends() {
        let provider = SleepingProvider::new(Duration::from_millis(50));
        let (bus, agent, shutdown) = start(provider.clone());

        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "a")).await.unwrap();
        bus.publish_inbound(InboundMessage::new("test", "u1", "c1", "b")).await.unwrap();
        provider.wait_started().await;
        assert_eq!(queued_sessions(&agent), 1);

        assert_eq!(next_outbound(&bus).await.content, "reply to a");
        assert_eq!(next_outbound(&bus).await.content, "reply to b");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queued_sessions(&agent), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stop_after_turn_finished_reports_no_task() {
        let bus = Arc::new(MessageBus::new());
        let agent = Arc::new(AgentLoop::new(
            bus,
            ScriptedProvider::new(vec![]),
            ToolRegistry::new(),
            AgentSettings {
                stop_ack_timeout: Duration::from_secs(30),
                ..settings()
            },
        ));
        let key = SessionKey::new("test", "c1");

        // The turn ends normally while /stop is already holding its handle
        let (guard, _cancel, exit) = agent.register_turn(&key);
        let stopping = {
            let agent = agent.clone();
            let key = key.clone();
            tokio::spawn(async move { agent.stop(&key).await })
        };
        tokio::task::yield_now().await;
        drop(guard);
        exit.finish(false);

        let reply = tokio::time::timeout(Duration::from_secs(5), stopping)
            .await
            .expect("stop waited for the full timeout")
            .unwrap();
        assert_eq!(reply, NO_ACTIVE_TASK);
        assert!(!agent.has_active_task(&key));
    }
}
