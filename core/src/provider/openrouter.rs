use super::{ChatRequest, ModelInfo, Provider, ProviderError, ProviderEvent};
use crate::config::ProviderConfig;
use crate::events::TokenUsage;
use crate::session::{ContentPart, FinishReason, Message, MessageRole};
use crate::tools::ToolCall;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Streaming chat completions against an OpenAI-compatible endpoint
pub struct OpenRouterProvider {
    client: reqwest::Client,
    config: ProviderConfig,
    model: ModelInfo,
}

impl OpenRouterProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        if config.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(ProviderError::Configuration("Missing OPENROUTER_API_KEY".to_string()));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::Configuration(e.to_string()))?;
        Ok(Self {
            client,
            model: ModelInfo::for_model(&config.model),
            config,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn body(&self, request: &ChatRequest) -> Value {
        let mut messages = vec![json!({"role": "system", "content": request.system})];
        messages.extend(convert_history(&request.messages));

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.clone());
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

/// Conversation in chat-completions form. Tool results become one `tool`
/// message each; finish markers are dropped.
pub(crate) fn convert_history(history: &[Message]) -> Vec<Value> {
    let mut out = Vec::new();
    for message in history {
        match message.role {
            MessageRole::User => {
                let mut content = message.text();
                for attachment in message.attachments() {
                    match &attachment.content {
                        Some(text) => content.push_str(&format!(
                            "\n\n<file path=\"{}\">\n{}\n</file>",
                            attachment.path.display(),
                            text
                        )),
                        None => content.push_str(&format!("\n\n[attached: {}]", attachment.path.display())),
                    }
                }
                out.push(json!({"role": "user", "content": content}));
            }
            MessageRole::Assistant => {
                let text = message.text();
                let calls: Vec<Value> = message
                    .tool_calls()
                    .map(|call| json!({
                        "id": call.id,
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.input.to_string()}
                    }))
                    .collect();
                if text.is_empty() && calls.is_empty() {
                    continue;
                }
                let mut entry = json!({"role": "assistant", "content": text});
                if !calls.is_empty() {
                    entry["tool_calls"] = Value::Array(calls);
                }
                out.push(entry);
            }
            MessageRole::Tool => {
                for part in &message.parts {
                    if let ContentPart::ToolResult(result) = part {
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": result.call_id,
                            "content": result.content,
                        }));
                    }
                }
            }
        }
    }
    out
}

/// Splits a byte stream into server-sent-event `data:` payloads
#[derive(Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds streamed chunks into provider events. Tool-call fragments are held
/// until the stream ends.
#[derive(Default)]
pub(crate) struct StreamAccumulator {
    calls: BTreeMap<u64, PartialCall>,
    finish_reason: Option<String>,
}

impl StreamAccumulator {
    pub fn apply(&mut self, chunk: &Value) -> Vec<ProviderEvent> {
        let mut events = Vec::new();

        if let Some(error) = chunk.get("error") {
            let message = error["message"].as_str().unwrap_or("provider error").to_string();
            events.push(ProviderEvent::Error(message));
            return events;
        }

        if let Some(choice) = chunk["choices"].get(0) {
            let delta = &choice["delta"];
            if let Some(text) = delta["content"].as_str() {
                if !text.is_empty() {
                    events.push(ProviderEvent::ContentDelta(text.to_string()));
                }
            }
            if let Some(calls) = delta["tool_calls"].as_array() {
                for (position, fragment) in calls.iter().enumerate() {
                    let index = fragment["index"].as_u64().unwrap_or(position as u64);
                    let call = self.calls.entry(index).or_default();
                    if let Some(id) = fragment["id"].as_str() {
                        call.id = id.to_string();
                    }
                    if let Some(name) = fragment["function"]["name"].as_str() {
                        call.name.push_str(name);
                    }
                    if let Some(arguments) = fragment["function"]["arguments"].as_str() {
                        call.arguments.push_str(arguments);
                    }
                }
            }
            if let Some(reason) = choice["finish_reason"].as_str() {
                self.finish_reason = Some(reason.to_string());
            }
        }

        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            events.push(ProviderEvent::Usage(TokenUsage {
                input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
                output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            }));
        }
        events
    }

    pub fn finish(self) -> Vec<ProviderEvent> {
        let mut events = Vec::new();
        let mut called = false;
        for call in self.calls.into_values() {
            if call.name.is_empty() {
                continue;
            }
            let input = if call.arguments.trim().is_empty() {
                json!({})
            } else {
                // Unparseable arguments are passed through as a string so the
                // tool rejects them and the model sees why
                serde_json::from_str(&call.arguments).unwrap_or(Value::String(call.arguments))
            };
            // Ids must stay unique across turns, so a missing one is never
            // derived from the stream index
            let id = if call.id.is_empty() { Uuid::new_v4().to_string() } else { call.id };
            events.push(ProviderEvent::ToolCall(ToolCall { id, name: call.name, input }));
            called = true;
        }

        let finish_reason = match self.finish_reason.as_deref() {
            _ if called => FinishReason::ToolUse,
            Some("tool_calls") => FinishReason::ToolUse,
            _ => FinishReason::EndTurn,
        };
        events.push(ProviderEvent::Done { finish_reason });
        events
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn model(&self) -> ModelInfo {
        self.model.clone()
    }

    async fn stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError> {
        let body = self.body(&request);
        let mut req = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.config.api_key.as_deref().unwrap_or_default())
            .header("Content-Type", "application/json");
        if let Some(ref referer) = self.config.referer {
            req = req.header("HTTP-Referer", referer);
        }
        if let Some(ref title) = self.config.title {
            req = req.header("X-Title", title);
        }

        debug!(model = %self.config.model, messages = request.messages.len(), "starting completion stream");
        let resp = tokio::select! {
            resp = req.json(&body).send() => resp.map_err(|e| ProviderError::Network(format!("request error: {}", e)))?,
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, message });
        }

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut resp = resp;
            let mut decoder = SseDecoder::default();
            let mut accumulator = StreamAccumulator::default();

            loop {
                let chunk = tokio::select! {
                    chunk = resp.chunk() => chunk,
                    _ = cancel.cancelled() => return,
                };
                match chunk {
                    Ok(Some(bytes)) => {
                        for data in decoder.push(&bytes) {
                            if data == "[DONE]" {
                                for event in accumulator.finish() {
                                    let _ = tx.send(event).await;
                                }
                                return;
                            }
                            let value: Value = match serde_json::from_str(&data) {
                                Ok(value) => value,
                                Err(e) => {
                                    debug!("skipping undecodable stream chunk: {}", e);
                                    continue;
                                }
                            };
                            for event in accumulator.apply(&value) {
                                let failed = matches!(event, ProviderEvent::Error(_));
                                if tx.send(event).await.is_err() || failed {
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        for event in accumulator.finish() {
                            let _ = tx.send(event).await;
                        }
                        return;
                    }
                    Err(e) => {
                        warn!("completion stream broke: {}", e);
                        let _ = tx.send(ProviderEvent::Error(format!("stream error: {}", e))).await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}
