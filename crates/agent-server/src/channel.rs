//! Outbound fan-out
//!
//! The bus has a single outbound queue. The router drains it and rebroadcasts
//! every message so each HTTP request, WebSocket and the CLI can pick out
//! replies for its own chat.

use std::sync::Arc;

use agent_core::{MessageBus, OutboundMessage};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct OutboundRouter {
    tx: broadcast::Sender<OutboundMessage>,
}

impl OutboundRouter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.tx.subscribe()
    }

    /// Drain the bus until shutdown
    pub async fn run(self, bus: Arc<MessageBus>, shutdown: CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = bus.consume_outbound() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let route = format!("{}:{}", msg.channel, msg.chat_id);
            if self.tx.send(msg).is_err() {
                tracing::debug!(route = %route, "No listener for outbound message");
            }
        }
        tracing::debug!("Outbound router stopped");
    }
}

/// Next message addressed to `channel`/`chat_id`; `None` once the router is gone
pub async fn next_for(
    rx: &mut broadcast::Receiver<OutboundMessage>,
    channel: &str,
    chat_id: &str,
) -> Option<OutboundMessage> {
    loop {
        match rx.recv().await {
            Ok(msg) if msg.channel == channel && msg.chat_id == chat_id => return Some(msg),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, channel, chat_id, "Outbound listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
