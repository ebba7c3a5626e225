use crate::config::Config;
use crate::lsp::LspManager;
use crate::tools::executors::*;
use crate::tools::{Tool, ToolError, ToolInfo};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Named tools in registration order
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// The built-in tool set. `diagnostics` is only offered when a language
    /// server manager exists.
    pub fn builtin(config: &Config, lsp: Option<Arc<LspManager>>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GlobTool::new(config.glob_limit)));
        registry.register(Arc::new(GrepTool::default()));
        registry.register(Arc::new(ViewTool::new(lsp.clone())));
        registry.register(Arc::new(WriteTool::new(lsp.clone())));
        registry.register(Arc::new(EditTool::new(lsp.clone())));
        registry.register(Arc::new(BashTool::new()));
        if let Some(lsp) = lsp {
            registry.register(Arc::new(DiagnosticsTool::new(lsp)));
        }
        registry
    }

    /// Add a tool, replacing any tool of the same name
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.info().name;
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn infos(&self) -> Vec<ToolInfo> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.info())
            .collect()
    }

    /// Function-calling schemas for the model, in registration order
    pub fn specs(&self) -> Vec<Value> {
        self.infos().iter().map(ToolInfo::function_spec).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Check an input against the tool's declared parameters: it must be an
    /// object, carry every required field, and use the declared JSON types.
    pub fn validate_args(&self, name: &str, input: &Value) -> Result<(), ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::Parameter(format!("Unknown tool: {}", name)))?;
        let info = tool.info();

        let object = input
            .as_object()
            .ok_or_else(|| ToolError::Parameter("Arguments must be an object".to_string()))?;

        for field in &info.required {
            match object.get(field) {
                None | Some(Value::Null) => {
                    return Err(ToolError::Parameter(format!("Missing required field: {}", field)))
                }
                Some(_) => {}
            }
        }

        for (field, value) in object {
            let Some(spec) = info.parameters.get(field) else { continue };
            if value.is_null() {
                continue;
            }
            let matches = match spec.kind.as_str() {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(ToolError::Parameter(format!(
                    "Field {} must be of type {}",
                    field, spec.kind
                )));
            }
        }

        Ok(())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
