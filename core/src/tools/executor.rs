use crate::events::{Broker, ToolEvent};
use crate::tools::{ToolCall, ToolContext, ToolError, ToolOutput, ToolRegistry, ToolResponse};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_MAX_OUTPUT: usize = 1024 * 1024;

/// Runs tool calls against the registry and reports their lifecycle.
///
/// Every call yields exactly one [`ToolResponse`]: unknown tools, bad input,
/// execution failures and cancellation all come back error-shaped.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    working_dir: PathBuf,
    events: Broker<ToolEvent>,
    max_output: usize,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, working_dir: impl Into<PathBuf>, events: Broker<ToolEvent>) -> Self {
        Self {
            registry,
            working_dir: working_dir.into(),
            events,
            max_output: DEFAULT_MAX_OUTPUT,
        }
    }

    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn working_dir(&self) -> &PathBuf {
        &self.working_dir
    }

    /// Execute a tool call and return its response
    pub async fn execute(&self, session_id: &str, call: &ToolCall, cancel: &CancellationToken) -> ToolResponse {
        let tool = self.registry.get(&call.name);
        let summary = match &tool {
            Some(tool) => tool.summary(&call.input),
            None => call.name.clone(),
        };

        self.events.publish(ToolEvent::Begin {
            session_id: session_id.to_string(),
            call_id: call.id.clone(),
            tool: call.name.clone(),
            summary,
        });
        let start = Instant::now();

        let result = match tool {
            None => Err(ToolError::Parameter(format!("Tool not found: {}", call.name))),
            Some(tool) => match self.registry.validate_args(&call.name, &call.input) {
                Err(e) => Err(e),
                Ok(()) if cancel.is_cancelled() => Err(ToolError::Cancelled),
                Ok(()) => {
                    let ctx = ToolContext {
                        session_id: session_id.to_string(),
                        working_dir: self.working_dir.clone(),
                        cancel: cancel.clone(),
                        events: self.events.clone(),
                    };
                    tool.run(&ctx, call).await
                }
            },
        };

        let response = match result {
            Ok(response) => self.cap(response),
            Err(ToolError::Execution(message)) => {
                debug!(tool = %call.name, call_id = %call.id, "tool failed: {}", message);
                ToolResponse::error(message)
            }
            Err(e) => {
                debug!(tool = %call.name, call_id = %call.id, "tool call rejected: {}", e);
                ToolResponse::error(e.to_string())
            }
        };

        self.events.publish(ToolEvent::End {
            session_id: session_id.to_string(),
            call_id: call.id.clone(),
            ok: !response.is_error(),
            duration_ms: start.elapsed().as_millis() as u64,
        });
        response
    }

    fn cap(&self, mut response: ToolResponse) -> ToolResponse {
        let limit = self.max_output;
        let content = match &mut response.output {
            ToolOutput::Text(content) | ToolOutput::Error(content) => content,
        };
        if content.len() > limit {
            let mut cut = limit;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            let total = content.len();
            content.truncate(cut);
            content.push_str(&format!("\n\n[Output truncated: {} of {} bytes shown]", cut, total));
        }
        response
    }
}
