//! Session Management
//!
//! Conversation history keyed by `channel:chat_id`.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::message::{Message, Role};

/// Stable identifier of a conversation: `channel:chat_id`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(channel: &str, chat_id: &str) -> Self {
        Self(format!("{}:{}", channel, chat_id))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Channel part; the chat id may itself contain `:`
    pub fn channel(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(channel, _)| channel)
    }

    pub fn chat_id(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, chat)| chat)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A conversation's persisted history
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,

    /// Messages from previous turns, oldest first, without the system prompt
    pub history: Vec<Message>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a finished turn's messages and keep the newest `limit`
    pub fn append_turn(&mut self, messages: impl IntoIterator<Item = Message>, limit: usize) {
        self.history.extend(messages);
        let start = window_start(&self.history, limit);
        self.history.drain(..start);
        self.touch();
    }

    /// Update the activity timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Message count
    pub fn message_count(&self) -> usize {
        self.history.len()
    }
}

/// Session store trait for persistence
pub trait SessionStore: Send + Sync {
    /// Load the session or start an empty one
    fn get_or_create(&self, key: &SessionKey) -> Result<Session>;

    /// Save a session
    fn save(&self, session: &Session) -> Result<()>;

    /// Drop a session's history; true if it existed
    fn clear(&self, key: &SessionKey) -> Result<bool>;

    /// Snapshot of the most recent `limit` messages
    fn history(&self, key: &SessionKey, limit: usize) -> Result<Vec<Message>> {
        let session = self.get_or_create(key)?;
        let start = window_start(&session.history, limit);
        Ok(session.history[start..].to_vec())
    }
}

/// First index of the newest `limit` messages, moved past tool results
/// whose assistant call fell outside the window
fn window_start(history: &[Message], limit: usize) -> usize {
    let mut start = history.len().saturating_sub(limit);
    while history.get(start).is_some_and(|m| m.role() == Role::Tool) {
        start += 1;
    }
    start
}

/// In-memory session store
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionKey, Session>>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> AgentError {
    AgentError::Session("session store lock poisoned".into())
}

impl SessionStore for MemorySessionStore {
    fn get_or_create(&self, key: &SessionKey) -> Result<Session> {
        if let Some(session) = self.sessions.read().map_err(poisoned)?.get(key) {
            return Ok(session.clone());
        }
        Ok(Session::new(key.clone()))
    }

    fn save(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        sessions.insert(session.key.clone(), session.clone());
        Ok(())
    }

    fn clear(&self, key: &SessionKey) -> Result<bool> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        Ok(sessions.remove(key).is_some())
    }
}
