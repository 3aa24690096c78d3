//! Adjustment request/response correlation
//!
//! A subagent parks on a one-shot channel keyed by its task id while the
//! main loop decides whether to steer it. At most one request per task id is
//! pending; the entry is removed on every exit path of the waiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::bus::{InboundMessage, KIND_ADJUSTMENT_REQUEST, MessageBus};
use crate::session::SessionKey;

struct Pending {
    seq: u64,
    tx: oneshot::Sender<String>,
}

type PendingTable = Mutex<HashMap<String, Pending>>;

fn lock(table: &PendingTable) -> MutexGuard<'_, HashMap<String, Pending>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SubagentMessenger {
    bus: Arc<MessageBus>,
    pending: PendingTable,
    next_seq: AtomicU64,
}

/// Removes the waiter's own entry when dropped
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    task_id: &'a str,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = lock(self.pending);
        if pending.get(self.task_id).is_some_and(|p| p.seq == self.seq) {
            pending.remove(self.task_id);
        }
    }
}

impl SubagentMessenger {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Publish an adjustment request for `task_id` and wait up to `timeout`
    /// for the answer. `None` means nobody answered in time.
    pub async fn request_adjustment(
        &self,
        task_id: &str,
        origin: &SessionKey,
        request: String,
        timeout: Duration,
    ) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        {
            let mut pending = lock(&self.pending);
            // A newer request supersedes an older one; its waiter sees a closed channel
            pending.insert(task_id.to_string(), Pending { seq, tx });
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            task_id,
            seq,
        };

        let event = InboundMessage::system_event(
            format!("subagent:{}", task_id),
            origin,
            KIND_ADJUSTMENT_REQUEST,
            task_id,
            request,
        );
        if let Err(e) = self.bus.publish_inbound(event).await {
            tracing::warn!(task_id, error = %e, "Could not publish adjustment request");
            return None;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(adjustment)) => {
                tracing::debug!(task_id, "Adjustment received");
                Some(adjustment)
            }
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::warn!(task_id, timeout_secs = timeout.as_secs_f64(), "Adjustment request timed out");
                None
            }
        }
    }

    /// Hand an answer to the waiting subagent. Returns false, without
    /// error, when nothing is waiting for `task_id`.
    pub fn deliver_adjustment(&self, task_id: &str, adjustment: String) -> bool {
        let entry = lock(&self.pending).remove(task_id);
        match entry {
            Some(pending) => pending.tx.send(adjustment).is_ok(),
            None => {
                tracing::warn!(task_id, "No pending adjustment request, dropping delivery");
                false
            }
        }
    }

    pub fn is_pending(&self, task_id: &str) -> bool {
        lock(&self.pending).contains_key(task_id)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}
