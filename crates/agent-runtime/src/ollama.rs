//! Ollama LLM Provider
//!
//! Implementation of `LlmProvider` for local Ollama inference. Chat goes
//! straight to `/api/chat` so the model can use native tool calling; model
//! listing and health checks use `ollama-rs`.

use std::collections::HashMap;
use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    message::{Message, ToolCallRequest},
    provider::{ChatResponse, GenerationOptions, LlmProvider, ModelInfo, TokenUsage},
    tool::ToolSchema,
};
use async_trait::async_trait;
use ollama_rs::Ollama;
use serde::{Deserialize, Serialize};

/// Ollama provider configuration
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Ollama host URL
    pub host: String,

    /// Ollama port
    pub port: u16,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".into(),
            port: 11434,
            timeout_secs: 120,
        }
    }
}

impl OllamaConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let host = std::env::var("OLLAMA_HOST").unwrap_or(defaults.host);
        let port = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);
        let timeout_secs = std::env::var("OLLAMA_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse().ok())
            .unwrap_or(defaults.timeout_secs);

        Self {
            host,
            port,
            timeout_secs,
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}:{}", self.host.trim_end_matches('/'), self.port)
    }
}

// ============================================================================
// Wire types for /api/chat
// ============================================================================

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    stream: bool,
    options: WireOptions,
}

#[derive(Debug, Serialize)]
struct WireOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct WireToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    message: WireMessage,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

/// Ollama LLM provider
pub struct OllamaProvider {
    client: Ollama,
    http: reqwest::Client,
    config: OllamaConfig,
}

impl OllamaProvider {
    /// Create a new Ollama provider with custom host/port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::from_config(OllamaConfig {
            host: host.into(),
            port,
            ..Default::default()
        })
    }

    /// Create from configuration
    pub fn from_config(config: OllamaConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });

        Self {
            client: Ollama::new(&config.host, config.port),
            http,
            config,
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::from_config(OllamaConfig::from_env())
    }

    /// Create with default localhost settings
    pub fn localhost() -> Self {
        Self::from_config(OllamaConfig::default())
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    /// Convert agent messages to Ollama format
    fn convert_messages(messages: &[Message]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|m| match m {
                Message::System { content } => WireMessage::plain("system", content),
                Message::User { content } => WireMessage::plain("user", content),
                Message::Assistant {
                    content,
                    tool_calls,
                } => WireMessage {
                    tool_calls: tool_calls
                        .iter()
                        .map(|call| WireToolCall {
                            id: Some(call.id.clone()),
                            function: WireFunctionCall {
                                name: call.name.clone(),
                                arguments: serde_json::Value::Object(call.arguments.clone().into_iter().collect()),
                            },
                        })
                        .collect(),
                    ..WireMessage::plain("assistant", content)
                },
                Message::Tool { name, content, .. } => WireMessage {
                    tool_name: Some(name.clone()),
                    ..WireMessage::plain("tool", content)
                },
            })
            .collect()
    }

    fn convert_tools(tools: &[ToolSchema]) -> Vec<WireTool> {
        tools
            .iter()
            .map(|schema| WireTool {
                kind: "function",
                function: WireFunction {
                    name: schema.name.clone(),
                    description: schema.description.clone(),
                    parameters: schema.parameters_json(),
                },
            })
            .collect()
    }

    /// Convert the Ollama reply; calls without an id get `call_{uuid}`
    fn convert_response(response: WireResponse) -> ChatResponse {
        let tool_calls = response
            .message
            .tool_calls
            .into_iter()
            .map(|call| {
                let id = call
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                ToolCallRequest::new(id, call.function.name, decode_arguments(call.function.arguments))
            })
            .collect();

        let usage = match (response.prompt_eval_count, response.eval_count) {
            (None, None) => None,
            (prompt, completion) => {
                let prompt_tokens = prompt.unwrap_or(0);
                let completion_tokens = completion.unwrap_or(0);
                Some(TokenUsage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: prompt_tokens + completion_tokens,
                })
            }
        };

        ChatResponse {
            content: response.message.content,
            tool_calls,
            usage,
        }
    }
}

impl WireMessage {
    fn plain(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            tool_calls: Vec::new(),
            tool_name: None,
        }
    }
}

/// Arguments arrive as an object, or occasionally as a JSON-encoded string
fn decode_arguments(raw: serde_json::Value) -> HashMap<String, serde_json::Value> {
    match raw {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        serde_json::Value::String(s) => serde_json::from_str(&s).unwrap_or_default(),
        _ => HashMap::new(),
    }
}

fn map_transport_error(err: reqwest::Error) -> AgentError {
    if err.is_connect() || err.is_timeout() {
        AgentError::ProviderUnavailable(err.to_string())
    } else {
        AgentError::Provider(err.to_string())
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<ChatResponse> {
        let request = WireRequest {
            model: &options.model,
            messages: Self::convert_messages(messages),
            tools: Self::convert_tools(tools),
            stream: false,
            options: WireOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
            },
        };

        let url = format!("{}/api/chat", self.config.base_url());
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => AgentError::RateLimited(body),
                401 | 403 => AgentError::Auth(body),
                _ => AgentError::Provider(format!("Ollama returned {}: {}", status, body)),
            });
        }

        let wire: WireResponse = response.json().await.map_err(map_transport_error)?;
        let chat = Self::convert_response(wire);
        tracing::debug!(
            model = %options.model,
            tool_calls = chat.tool_calls.len(),
            "Ollama chat completed"
        );
        Ok(chat)
    }

    async fn health_check(&self) -> Result<bool> {
        match self.client.list_local_models().await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("Ollama health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let models = self
            .client
            .list_local_models()
            .await
            .map_err(|e| AgentError::ProviderUnavailable(e.to_string()))?;

        Ok(models
            .into_iter()
            .map(|m| ModelInfo {
                id: m.name.clone(),
                name: m.name,
                context_length: None, // Not exposed by Ollama API
            })
            .collect())
    }
}
