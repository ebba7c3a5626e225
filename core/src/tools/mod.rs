pub mod types;
pub mod executor;
pub mod registry;
pub mod executors;

#[cfg(test)]
pub mod tests;

pub use types::*;
pub use executor::ToolExecutor;
pub use registry::ToolRegistry;

use crate::events::{Broker, ToolEvent};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

/// Static description of a tool, cheap enough to build on every turn
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: BTreeMap<String, ParameterSpec>,
    pub required: Vec<String>,
    /// Mutates the filesystem or spawns processes; such calls go through
    /// the permission gate
    pub side_effects: bool,
}

impl ToolInfo {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: BTreeMap::new(),
            required: Vec::new(),
            side_effects: false,
        }
    }

    pub fn param(mut self, name: &str, kind: &str, description: &str, required: bool) -> Self {
        self.parameters.insert(
            name.to_string(),
            ParameterSpec { kind: kind.to_string(), description: description.to_string() },
        );
        if required {
            self.required.push(name.to_string());
        }
        self
    }

    pub fn with_side_effects(mut self) -> Self {
        self.side_effects = true;
        self
    }

    /// JSON schema of the input object
    pub fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": self.parameters,
            "required": self.required,
        })
    }

    /// Function-calling description handed to the model
    pub fn function_spec(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema(),
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Error(String),
}

/// Result of one tool call: text or error, plus metadata for the UI
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub output: ToolOutput,
    pub metadata: Option<Value>,
}

impl ToolResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self { output: ToolOutput::Text(content.into()), metadata: None }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self { output: ToolOutput::Error(content.into()), metadata: None }
    }

    pub fn with_metadata<T: Serialize>(mut self, metadata: T) -> Self {
        self.metadata = serde_json::to_value(metadata).ok();
        self
    }

    pub fn is_error(&self) -> bool {
        matches!(self.output, ToolOutput::Error(_))
    }

    pub fn content(&self) -> &str {
        match &self.output {
            ToolOutput::Text(text) | ToolOutput::Error(text) => text,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    Parameter(String),

    #[error("{0}")]
    Execution(String),

    #[error("Tool call was cancelled")]
    Cancelled,
}

/// Per-call environment handed to [`Tool::run`]
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub working_dir: PathBuf,
    pub cancel: CancellationToken,
    pub events: Broker<ToolEvent>,
}

impl ToolContext {
    pub fn progress(&self, call_id: &str, message: impl Into<String>) {
        self.events.publish(ToolEvent::Progress {
            call_id: call_id.to_string(),
            message: message.into(),
        });
    }

    /// Absolute form of a user-supplied path
    pub fn resolve(&self, path: &str) -> PathBuf {
        resolve_path(&self.working_dir, path)
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn info(&self) -> ToolInfo;

    async fn run(&self, ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError>;

    /// Path the permission gate reasons about
    fn resource_path(&self, input: &Value, working_dir: &Path) -> PathBuf {
        ["file_path", "path"]
            .iter()
            .find_map(|key| input.get(*key).and_then(Value::as_str))
            .filter(|p| !p.is_empty())
            .map(|p| resolve_path(working_dir, p))
            .unwrap_or_else(|| working_dir.to_path_buf())
    }

    /// One-line description for tool lifecycle events and permission prompts
    fn summary(&self, input: &Value) -> String {
        let name = self.info().name;
        match ["file_path", "path", "pattern", "command"]
            .iter()
            .find_map(|key| input.get(*key).and_then(Value::as_str))
        {
            Some(target) => format!("{} {}", name, target),
            None => name,
        }
    }
}

/// Absolute, with `.` and `..` collapsed so the result can be compared by
/// prefix against permission grants
pub fn resolve_path(working_dir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&working_dir.join(path))
    }
}

/// Lexical normalization. `..` never climbs above the root.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => normalized.push(Component::ParentDir),
            },
            other => normalized.push(other),
        }
    }
    normalized
}

/// Decode a call's input into the tool's argument struct
pub fn parse_input<T: DeserializeOwned>(call: &ToolCall) -> Result<T, ToolError> {
    serde_json::from_value(call.input.clone())
        .map_err(|e| ToolError::Parameter(format!("Invalid {} arguments: {}", call.name, e)))
}
