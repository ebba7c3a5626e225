use super::{ChatRequest, ModelInfo, Provider, ProviderError, ProviderEvent};
use crate::events::TokenUsage;
use crate::session::{FinishReason, MessageRole};
use crate::tools::ToolCall;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
enum Step {
    Emit(ProviderEvent),
    Delay(Duration),
    /// Stall until the turn is cancelled
    Hang,
}

/// One provider turn, built step by step
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    steps: Vec<Step>,
    failure: Option<ProviderError>,
}

impl ScriptedTurn {
    pub fn new() -> Self {
        Self::default()
    }

    /// The turn fails before streaming anything
    pub fn failing(message: &str) -> Self {
        Self {
            steps: Vec::new(),
            failure: Some(ProviderError::Network(message.to_string())),
        }
    }

    pub fn text(mut self, text: &str) -> Self {
        self.steps.push(Step::Emit(ProviderEvent::ContentDelta(text.to_string())));
        self
    }

    pub fn tool_call(mut self, id: &str, name: &str, input: Value) -> Self {
        self.steps.push(Step::Emit(ProviderEvent::ToolCall(ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input,
        })));
        self
    }

    pub fn usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.steps.push(Step::Emit(ProviderEvent::Usage(TokenUsage { input_tokens, output_tokens })));
        self
    }

    pub fn error(mut self, message: &str) -> Self {
        self.steps.push(Step::Emit(ProviderEvent::Error(message.to_string())));
        self
    }

    pub fn done(mut self, finish_reason: FinishReason) -> Self {
        self.steps.push(Step::Emit(ProviderEvent::Done { finish_reason }));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.steps.push(Step::Delay(delay));
        self
    }

    pub fn hang(mut self) -> Self {
        self.steps.push(Step::Hang);
        self
    }
}

/// Plays back queued turns; once the queue is empty it echoes the last user
/// message. Used by tests and when no API key is configured.
pub struct ScriptedProvider {
    model: ModelInfo,
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(model: ModelInfo) -> Self {
        Self {
            model,
            turns: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_turns(self, turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(turns);
        self
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        self.turns.lock().unwrap_or_else(PoisonError::into_inner).push_back(turn);
    }

    /// Requests received so far, oldest first
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn echo(request: &ChatRequest) -> ScriptedTurn {
        let last = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.text())
            .unwrap_or_default();
        ScriptedTurn::new()
            .text(&format!("I'm going to help you with: {}", last))
            .usage(last.len() as u64, 10)
            .done(FinishReason::EndTurn)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn model(&self) -> ModelInfo {
        self.model.clone()
    }

    async fn stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError> {
        let turn = self.turns.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        let turn = turn.unwrap_or_else(|| Self::echo(&request));
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).push(request);

        if let Some(failure) = turn.failure {
            return Err(failure);
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for step in turn.steps {
                match step {
                    Step::Emit(event) => {
                        if cancel.is_cancelled() || tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Step::Delay(delay) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => return,
                        }
                    }
                    Step::Hang => {
                        cancel.cancelled().await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}
