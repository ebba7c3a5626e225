//! The turn loop of a single run.

use super::{AgentError, AgentInner, RunOutcome};
use crate::events::{RunEvent, TokenUsage};
use crate::permission::{Decision, PermissionAsk};
use crate::provider::{ChatRequest, ProviderError, ProviderEvent};
use crate::session::{ContentPart, FinishReason, Message, NewMessage, ToolResult};
use crate::tools::{ToolCall, ToolError, ToolResponse};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// What one provider stream produced
#[derive(Default)]
struct StreamedTurn {
    text: String,
    calls: Vec<ToolCall>,
    finish: Option<FinishReason>,
    error: Option<String>,
}

struct Turn<'a> {
    inner: &'a AgentInner,
    session_id: &'a str,
    cancel: &'a CancellationToken,
    usage: TokenUsage,
}

/// Run the session's conversation until the model stops calling tools, the
/// provider fails, or `cancel` fires. Usage is recorded on every path.
pub(crate) async fn drive(inner: &AgentInner, session_id: &str, cancel: &CancellationToken) -> RunOutcome {
    let mut turn = Turn { inner, session_id, cancel, usage: TokenUsage::default() };
    let outcome = match turn.run().await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(session = session_id, "run aborted: {}", e);
            RunOutcome::Failed { error: e.to_string() }
        }
    };
    inner.record_usage(session_id, turn.usage).await;
    outcome
}

impl Turn<'_> {
    async fn run(&mut self) -> Result<RunOutcome, AgentError> {
        loop {
            if self.cancel.is_cancelled() {
                return self.cancelled(&[]).await;
            }

            let session = self.inner.store.get_session(self.session_id).await?;
            let history = self.inner.history(&session).await?;
            let streamed = match self.stream(history).await {
                Ok(streamed) => streamed,
                Err(ProviderError::Cancelled) => return self.cancelled(&[]).await,
                Err(e) => return self.failed(String::new(), e.to_string()).await,
            };

            if self.cancel.is_cancelled() {
                self.append_assistant(&streamed.text, &streamed.calls, None).await?;
                return self.cancelled(&streamed.calls).await;
            }
            if let Some(error) = streamed.error {
                return self.failed(streamed.text, error).await;
            }
            let Some(finish) = streamed.finish else {
                return self
                    .failed(streamed.text, "provider stream ended before the turn finished".to_string())
                    .await;
            };

            if streamed.calls.is_empty() {
                self.append_assistant(&streamed.text, &[], Some(finish)).await?;
                return Ok(RunOutcome::Completed { usage: self.usage });
            }

            self.append_assistant(&streamed.text, &streamed.calls, Some(FinishReason::ToolUse))
                .await?;
            for (index, call) in streamed.calls.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    return self.cancelled(&streamed.calls[index..]).await;
                }
                let response = self.call_tool(call).await;
                if let Err(e) = self.append_result(call, &response).await {
                    return Ok(self.abandon(&streamed.calls[index..], e).await);
                }
            }
            if self.cancel.is_cancelled() {
                return self.cancelled(&[]).await;
            }
        }
    }

    async fn stream(&mut self, history: Vec<Message>) -> Result<StreamedTurn, ProviderError> {
        let request = ChatRequest {
            system: self.inner.system_prompt.clone(),
            messages: history,
            tools: self.inner.executor.registry().specs(),
            max_tokens: self.inner.max_tokens,
        };
        let mut events = self.inner.provider.stream(request, self.cancel.clone()).await?;

        let mut turn = StreamedTurn::default();
        let mut seen = HashSet::new();
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(ProviderEvent::ContentDelta(text)) => {
                    self.inner.bus.runs.publish(RunEvent::ContentDelta {
                        session_id: self.session_id.to_string(),
                        text: text.clone(),
                    });
                    turn.text.push_str(&text);
                }
                Some(ProviderEvent::ToolCall(call)) => {
                    if seen.insert(call.id.clone()) {
                        turn.calls.push(call);
                    } else {
                        warn!(session = self.session_id, call_id = %call.id, "ignoring duplicate tool call id");
                    }
                }
                Some(ProviderEvent::Usage(usage)) => self.usage.add(usage),
                Some(ProviderEvent::Done { finish_reason }) => {
                    turn.finish = Some(finish_reason);
                    break;
                }
                Some(ProviderEvent::Error(error)) => {
                    turn.error = Some(error);
                    break;
                }
                None => break,
            }
        }
        Ok(turn)
    }

    /// Gate side-effecting tools, then execute. Always yields a response.
    async fn call_tool(&self, call: &ToolCall) -> ToolResponse {
        let executor = &self.inner.executor;
        let tool = executor.registry().get(&call.name);

        if let Some(tool) = tool.filter(|tool| tool.info().side_effects) {
            let ask = PermissionAsk {
                session_id: self.session_id.to_string(),
                tool_name: call.name.clone(),
                path: tool.resource_path(&call.input, executor.working_dir()),
                action: permission_action(&call.name).to_string(),
                description: tool.summary(&call.input),
            };
            match self.inner.permissions.request(ask, self.cancel).await {
                Decision::Allow => {}
                Decision::Deny if self.cancel.is_cancelled() => {
                    return ToolResponse::error(ToolError::Cancelled.to_string())
                }
                Decision::Deny => {
                    debug!(session = self.session_id, tool = %call.name, "permission denied");
                    return ToolResponse::error("permission denied");
                }
            }
        }

        executor.execute(self.session_id, call, self.cancel).await
    }

    async fn append_assistant(
        &self,
        text: &str,
        calls: &[ToolCall],
        finish: Option<FinishReason>,
    ) -> Result<(), AgentError> {
        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(ContentPart::Text { text: text.to_string() });
        }
        parts.extend(calls.iter().cloned().map(ContentPart::ToolCall));
        if let Some(reason) = finish {
            parts.push(ContentPart::Finish { reason });
        }
        if parts.is_empty() {
            return Ok(());
        }
        self.inner
            .store
            .append_message(self.session_id, NewMessage::assistant(parts))
            .await?;
        Ok(())
    }

    async fn append_result(&self, call: &ToolCall, response: &ToolResponse) -> Result<(), AgentError> {
        let result = ToolResult {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: response.content().to_string(),
            is_error: response.is_error(),
            metadata: response.metadata.clone(),
        };
        self.inner
            .store
            .append_message(self.session_id, NewMessage::tool_result(result))
            .await?;
        Ok(())
    }

    /// Answer every unanswered call with a cancellation error, then mark the
    /// conversation as cancelled
    async fn cancelled(&self, unanswered: &[ToolCall]) -> Result<RunOutcome, AgentError> {
        let response = ToolResponse::error(ToolError::Cancelled.to_string());
        self.answer_all(unanswered, &response).await;
        self.append_assistant("", &[], Some(FinishReason::Cancelled)).await?;
        Ok(RunOutcome::Cancelled)
    }

    /// A result could not be stored. Every call from `unanswered` on still
    /// gets an error result before the run fails.
    async fn abandon(&self, unanswered: &[ToolCall], cause: AgentError) -> RunOutcome {
        error!(session = self.session_id, "failed to record tool result: {}", cause);
        let response = ToolResponse::error(format!("Tool result could not be recorded: {}", cause));
        self.answer_all(unanswered, &response).await;
        if let Err(e) = self.append_assistant("", &[], Some(FinishReason::Error)).await {
            warn!(session = self.session_id, "failed to record run failure: {}", e);
        }
        RunOutcome::Failed { error: cause.to_string() }
    }

    /// One failed append does not stop the remaining calls from being answered
    async fn answer_all(&self, calls: &[ToolCall], response: &ToolResponse) {
        for call in calls {
            if let Err(e) = self.append_result(call, response).await {
                warn!(session = self.session_id, call_id = %call.id, "failed to answer tool call: {}", e);
            }
        }
    }

    async fn failed(&self, text: String, error: String) -> Result<RunOutcome, AgentError> {
        debug!(session = self.session_id, "provider failed: {}", error);
        self.append_assistant(&text, &[], Some(FinishReason::Error)).await?;
        Ok(RunOutcome::Failed { error })
    }
}

fn permission_action(tool: &str) -> &'static str {
    match tool {
        "bash" => "execute",
        _ => "write",
    }
}
