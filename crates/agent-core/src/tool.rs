//! Tool System
//!
//! Extensible tool framework for agent capabilities.
//! Tools are registered at startup and invoked by name from the turn executor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AgentError, Result};

/// Tool arguments as decoded from the model's call
pub type ToolArgs = HashMap<String, serde_json::Value>;

/// Parameter definition for tool schema
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameter name
    pub name: String,

    /// JSON Schema type (string, number, boolean, object, array)
    #[serde(rename = "type")]
    pub param_type: String,

    /// Human-readable description
    pub description: String,

    /// Whether this parameter is required
    #[serde(default)]
    pub required: bool,

    /// Enum of allowed values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<serde_json::Value>>,
}

impl ParameterSchema {
    pub fn string(name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            param_type: "string".into(),
            description: description.into(),
            required,
            enum_values: None,
        }
    }
}

/// Tool definition schema (for LLM function calling)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to LLM)
    pub description: String,

    /// Parameter definitions
    pub parameters: Vec<ParameterSchema>,
}

impl ToolSchema {
    /// JSON Schema object for the parameters, as function-calling APIs expect
    pub fn parameters_json(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for param in &self.parameters {
            let mut prop = serde_json::json!({
                "type": param.param_type,
                "description": param.description,
            });
            if let Some(values) = &param.enum_values {
                prop["enum"] = serde_json::Value::Array(values.clone());
            }
            properties.insert(param.name.clone(), prop);
            if param.required {
                required.push(serde_json::Value::String(param.name.clone()));
            }
        }

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Tool trait - implement to add new capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool's schema for LLM function calling
    fn schema(&self) -> ToolSchema;

    /// Execute the tool, returning the text handed back to the model
    async fn execute(&self, args: &ToolArgs) -> Result<String>;

    /// Validate arguments before execution (optional)
    fn validate(&self, args: &ToolArgs) -> Result<()> {
        let schema = self.schema();

        for param in &schema.parameters {
            if param.required && !args.contains_key(&param.name) {
                return Err(AgentError::ToolValidation(format!(
                    "Missing required parameter: {}",
                    param.name
                )));
            }
        }

        Ok(())
    }
}

/// Registry for available tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a new tool
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        let schema = tool.schema();
        self.tools.insert(schema.name.clone(), Arc::new(tool));
    }

    /// Register a shared tool
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let schema = tool.schema();
        self.tools.insert(schema.name.clone(), tool);
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Copy of this registry without the named tools
    pub fn without(&self, excluded: &[&str]) -> ToolRegistry {
        ToolRegistry {
            tools: self
                .tools
                .iter()
                .filter(|(name, _)| !excluded.contains(&name.as_str()))
                .map(|(name, tool)| (name.clone(), tool.clone()))
                .collect(),
        }
    }

    /// Execute a tool by name
    pub async fn execute(&self, name: &str, args: &ToolArgs) -> Result<String> {
        let tool = self.get(name).ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;

        tool.validate(args)?;
        tool.execute(args).await
    }

    /// All tool schemas, sorted by name so provider payloads are stable
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|t| t.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Get tool names
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ============================================================================
// Built-in Tools
// ============================================================================

/// DateTime tool - returns current time
pub struct DateTimeTool;

#[async_trait]
impl Tool for DateTimeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "datetime".into(),
            description: "Get the current date and time (UTC)".into(),
            parameters: vec![ParameterSchema {
                name: "format".into(),
                param_type: "string".into(),
                description: "Output format: 'iso', 'human', or 'unix'".into(),
                required: false,
                enum_values: Some(vec![
                    serde_json::json!("iso"),
                    serde_json::json!("human"),
                    serde_json::json!("unix"),
                ]),
            }],
        }
    }

    async fn execute(&self, args: &ToolArgs) -> Result<String> {
        let format = args.get("format").and_then(|v| v.as_str()).unwrap_or("human");
        let now = chrono::Utc::now();

        match format {
            "iso" => Ok(now.to_rfc3339()),
            "unix" => Ok(now.timestamp().to_string()),
            "human" => Ok(now.format("%A, %B %d, %Y at %H:%M:%S UTC").to_string()),
            other => Err(AgentError::ToolValidation(format!("Unknown format '{}'", other))),
        }
    }
}
