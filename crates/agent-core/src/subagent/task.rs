//! Subagent task records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::session::SessionKey;

/// Lifecycle of a subagent. Terminal states are never left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Running,
    /// Running, but parked on an adjustment request
    AwaitingAdjustment,
    Completed,
    Failed,
    Cancelled,
}

impl SubagentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubagentStatus::Completed | SubagentStatus::Failed | SubagentStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubagentStatus::Running => "running",
            SubagentStatus::AwaitingAdjustment => "awaiting_adjustment",
            SubagentStatus::Completed => "completed",
            SubagentStatus::Failed => "failed",
            SubagentStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SubagentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A delegated task as seen by the parent
#[derive(Clone, Debug, Serialize)]
pub struct SubagentTask {
    pub task_id: String,

    /// Display label, derived from the task when none was given
    pub label: String,

    pub task: String,

    /// Session that spawned the subagent and receives its result
    pub origin: SessionKey,

    pub status: SubagentStatus,

    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    pub result: Option<String>,

    /// Snapshot of the parent's log at spawn time
    #[serde(skip)]
    pub initial_context: Vec<Message>,
}

impl SubagentTask {
    pub fn new(
        task_id: String,
        task: String,
        label: Option<String>,
        origin: SessionKey,
        initial_context: Vec<Message>,
    ) -> Self {
        let label = label
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| default_label(&task));
        Self {
            task_id,
            label,
            task,
            origin,
            status: SubagentStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            initial_context,
        }
    }

    /// Move to `next` unless already terminal; returns whether it moved
    pub fn transition(&mut self, next: SubagentStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    /// Terminal transition carrying the result text
    pub fn finish(&mut self, status: SubagentStatus, result: Option<String>) -> bool {
        if !status.is_terminal() || !self.transition(status) {
            return false;
        }
        self.result = result;
        true
    }
}

const LABEL_CHARS: usize = 30;

/// First 30 characters of the task, with `...` when truncated
pub fn default_label(task: &str) -> String {
    let mut chars = task.chars();
    let head: String = chars.by_ref().take(LABEL_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
