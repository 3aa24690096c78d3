//! Runtime Settings
//!
//! Defaults mirror what the agent loop and subagent manager expect; every
//! field can be overridden from the environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::provider::GenerationOptions;

/// Main agent settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Model identifier passed to the provider
    pub model: String,

    pub temperature: f32,

    pub max_tokens: u32,

    /// Iteration ceiling for a main-session turn
    pub max_iterations: usize,

    /// Messages kept per session between turns
    pub history_limit: usize,

    /// How long `/stop` waits for the cancelled turn to acknowledge
    #[serde(with = "duration_secs")]
    pub stop_ack_timeout: Duration,

    /// System prompt for the main session
    pub system_prompt: String,

    pub subagent: SubagentSettings,
}

/// Subagent policy knobs
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SubagentSettings {
    /// Iteration ceiling for a subagent
    pub max_iterations: usize,

    /// Ask the parent for an adjustment every N tool iterations
    pub adjustment_interval: usize,

    /// How long a subagent waits for an adjustment
    #[serde(with = "duration_secs")]
    pub adjustment_timeout: Duration,

    /// Parent messages copied into the subagent's initial context
    pub context_messages: usize,

    /// Subagent messages sent along with an adjustment request
    pub context_tail: usize,
}

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a helpful AI assistant reachable over chat.

Use the available tools when they help. For long-running or independent work,
call the `spawn` tool to delegate it to a background subagent; its result will
be reported back to you when it finishes.
Be concise and accurate."#;

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: "llama3.2".into(),
            temperature: 0.7,
            max_tokens: 4096,
            max_iterations: 20,
            history_limit: 50,
            stop_ack_timeout: Duration::from_secs(5),
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            subagent: SubagentSettings::default(),
        }
    }
}

impl Default for SubagentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            adjustment_interval: 3,
            adjustment_timeout: Duration::from_secs(30),
            context_messages: 10,
            context_tail: 5,
        }
    }
}

impl AgentSettings {
    /// Defaults overridden by `AGENT_*` / `SUBAGENT_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AgentSettings::from_env`] with an injectable variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(model) = lookup("AGENT_MODEL") {
            settings.model = model;
        }
        if let Some(prompt) = lookup("AGENT_SYSTEM_PROMPT") {
            settings.system_prompt = prompt;
        }
        override_parsed(&lookup, "AGENT_TEMPERATURE", &mut settings.temperature)?;
        override_parsed(&lookup, "AGENT_MAX_TOKENS", &mut settings.max_tokens)?;
        override_parsed(&lookup, "AGENT_MAX_ITERATIONS", &mut settings.max_iterations)?;
        override_parsed(&lookup, "AGENT_HISTORY_LIMIT", &mut settings.history_limit)?;
        override_secs(&lookup, "AGENT_STOP_ACK_TIMEOUT_SECS", &mut settings.stop_ack_timeout)?;

        let sub = &mut settings.subagent;
        override_parsed(&lookup, "SUBAGENT_MAX_ITERATIONS", &mut sub.max_iterations)?;
        override_parsed(&lookup, "SUBAGENT_ADJUSTMENT_INTERVAL", &mut sub.adjustment_interval)?;
        override_secs(&lookup, "SUBAGENT_ADJUSTMENT_TIMEOUT_SECS", &mut sub.adjustment_timeout)?;
        override_parsed(&lookup, "SUBAGENT_CONTEXT_MESSAGES", &mut sub.context_messages)?;
        override_parsed(&lookup, "SUBAGENT_CONTEXT_TAIL", &mut sub.context_tail)?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 || self.subagent.max_iterations == 0 {
            return Err(AgentError::Config("iteration ceilings must be at least 1".into()));
        }
        if self.subagent.adjustment_interval == 0 {
            return Err(AgentError::Config("adjustment interval must be at least 1".into()));
        }
        Ok(())
    }

    pub fn generation(&self) -> GenerationOptions {
        GenerationOptions {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<()> {
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| AgentError::Config(format!("{} has invalid value '{}'", key, raw)))?;
    }
    Ok(())
}

fn override_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut Duration,
) -> Result<()> {
    let mut secs = slot.as_secs();
    override_parsed(lookup, key, &mut secs)?;
    *slot = Duration::from_secs(secs);
    Ok(())
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
