//! Agent Metrics
//!
//! Process-wide counters for subagent lifecycle and LLM calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::provider::TokenUsage;

#[derive(Debug, Default)]
pub struct AgentMetrics {
    subagents_spawned: AtomicU64,
    subagents_completed: AtomicU64,
    subagents_failed: AtomicU64,
    subagents_cancelled: AtomicU64,
    llm_calls: AtomicU64,
    llm_errors: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    latency_ms: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSummary {
    pub subagents_spawned: u64,
    pub subagents_running: u64,
    pub subagents_completed: u64,
    pub subagents_failed: u64,
    pub subagents_cancelled: u64,
    pub llm_calls: u64,
    pub llm_errors: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub avg_latency_ms: u64,
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subagent_spawned(&self) {
        self.subagents_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subagent_completed(&self) {
        self.subagents_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subagent_failed(&self) {
        self.subagents_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subagent_cancelled(&self) {
        self.subagents_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_llm_call(&self, usage: Option<&TokenUsage>, latency: Duration) {
        self.llm_calls.fetch_add(1, Ordering::Relaxed);
        self.latency_ms
            .fetch_add(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX), Ordering::Relaxed);
        if let Some(usage) = usage {
            self.prompt_tokens.fetch_add(u64::from(usage.prompt_tokens), Ordering::Relaxed);
            self.completion_tokens
                .fetch_add(u64::from(usage.completion_tokens), Ordering::Relaxed);
        }
    }

    pub fn record_llm_error(&self) {
        self.llm_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        let spawned = self.subagents_spawned.load(Ordering::Relaxed);
        let completed = self.subagents_completed.load(Ordering::Relaxed);
        let failed = self.subagents_failed.load(Ordering::Relaxed);
        let cancelled = self.subagents_cancelled.load(Ordering::Relaxed);
        let calls = self.llm_calls.load(Ordering::Relaxed);

        MetricsSummary {
            subagents_spawned: spawned,
            subagents_running: spawned.saturating_sub(completed + failed + cancelled),
            subagents_completed: completed,
            subagents_failed: failed,
            subagents_cancelled: cancelled,
            llm_calls: calls,
            llm_errors: self.llm_errors.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            avg_latency_ms: self.latency_ms.load(Ordering::Relaxed) / calls.max(1),
        }
    }
}
