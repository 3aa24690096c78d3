//! Message Bus
//!
//! In-process queues connecting channel adapters to the agent loop. Inbound
//! messages flow from channels to the loop, outbound replies flow back.
//! Delivery is at-least-once for the lifetime of the process; nothing is
//! persisted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};

use crate::error::{AgentError, Result};
use crate::session::SessionKey;

/// Channel name reserved for events the runtime sends to itself
pub const SYSTEM_CHANNEL: &str = "system";

/// `metadata.kind` of a subagent completion event
pub const KIND_SUBAGENT_RESULT: &str = "subagent_result";

/// `metadata.kind` of a subagent adjustment request
pub const KIND_ADJUSTMENT_REQUEST: &str = "adjustment_request";

/// A message arriving from a channel
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Internal event addressed to the session `origin`
    pub fn system_event(
        sender_id: impl Into<String>,
        origin: &SessionKey,
        kind: &str,
        task_id: &str,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(SYSTEM_CHANNEL, sender_id, origin.as_str(), content);
        msg.metadata.insert("kind".into(), serde_json::json!(kind));
        msg.metadata.insert("task_id".into(), serde_json::json!(task_id));
        msg
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(&self.channel, &self.chat_id)
    }

    pub fn is_system(&self) -> bool {
        self.channel == SYSTEM_CHANNEL
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// A reply to deliver on a channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OutboundMessage {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    /// Reply on the same channel and chat as `msg`
    pub fn reply_to(msg: &InboundMessage, content: impl Into<String>) -> Self {
        let mut out = Self::new(&msg.channel, &msg.chat_id, content);
        out.metadata = msg.metadata.clone();
        out
    }
}

/// Inbound and outbound queues
pub struct MessageBus {
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::UnboundedReceiver<OutboundMessage>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
        }
    }

    pub async fn publish_inbound(&self, msg: InboundMessage) -> Result<()> {
        self.inbound_tx
            .send(msg)
            .map_err(|_| AgentError::Bus("inbound queue closed".into()))
    }

    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<()> {
        self.outbound_tx
            .send(msg)
            .map_err(|_| AgentError::Bus("outbound queue closed".into()))
    }

    /// Wait for the next inbound message
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Wait for the next outbound message
    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        self.outbound_rx.lock().await.recv().await
    }
}
