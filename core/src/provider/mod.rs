//! LLM providers.
//!
//! A provider turns a conversation into a stream of [`ProviderEvent`]s. The
//! agent owns the conversation loop; providers only speak one turn at a time.

pub mod openrouter;
pub mod scripted;

pub use openrouter::OpenRouterProvider;
pub use scripted::{ScriptedProvider, ScriptedTurn};

use crate::config::ProviderConfig;
use crate::events::TokenUsage;
use crate::session::{FinishReason, Message};
use crate::tools::ToolCall;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Pricing and limits of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    /// USD per million input tokens
    pub cost_per_1m_in: f64,
    /// USD per million output tokens
    pub cost_per_1m_out: f64,
    pub context_window: u64,
}

impl ModelInfo {
    /// Known models; anything else is assumed free with a 128k window
    pub fn for_model(id: &str) -> Self {
        let (name, cost_in, cost_out, window) = match id {
            "x-ai/grok-4-fast:free" => ("Grok 4 Fast (free)", 0.0, 0.0, 2_000_000),
            "x-ai/grok-4-fast" => ("Grok 4 Fast", 0.2, 0.5, 2_000_000),
            "x-ai/grok-code-fast-1" => ("Grok Code Fast 1", 0.2, 1.5, 256_000),
            "x-ai/grok-4" => ("Grok 4", 3.0, 15.0, 256_000),
            "anthropic/claude-sonnet-4" => ("Claude Sonnet 4", 3.0, 15.0, 200_000),
            "openai/gpt-4o" => ("GPT-4o", 2.5, 10.0, 128_000),
            "openai/gpt-4o-mini" => ("GPT-4o mini", 0.15, 0.6, 128_000),
            _ => (id, 0.0, 0.0, 128_000),
        };
        Self {
            id: id.to_string(),
            name: name.to_string(),
            cost_per_1m_in: cost_in,
            cost_per_1m_out: cost_out,
            context_window: window,
        }
    }

    pub fn cost(&self, usage: TokenUsage) -> f64 {
        usage.input_tokens as f64 * self.cost_per_1m_in / 1_000_000.0
            + usage.output_tokens as f64 * self.cost_per_1m_out / 1_000_000.0
    }
}

/// One element of a provider's response stream
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    ContentDelta(String),
    ToolCall(ToolCall),
    Usage(TokenUsage),
    Done { finish_reason: FinishReason },
    Error(String),
}

/// Everything a provider needs for one turn
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<Message>,
    /// Function-calling schemas; empty means the model may not call tools
    pub tools: Vec<Value>,
    pub max_tokens: Option<u32>,
}

#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Provider configuration error: {0}")]
    Configuration(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Provider stream failed: {0}")]
    Stream(String),

    #[error("Provider request was cancelled")]
    Cancelled,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn model(&self) -> ModelInfo;

    /// Start a turn. Events arrive on the returned channel until `Done`,
    /// `Error`, or `cancel` fires; the channel closes afterwards.
    async fn stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError>;
}

/// The HTTP provider when an API key is configured, otherwise the echoing
/// scripted provider
pub fn from_config(config: &ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    match &config.api_key {
        Some(_) => Ok(Arc::new(OpenRouterProvider::new(config.clone())?)),
        None => Ok(Arc::new(ScriptedProvider::new(ModelInfo::for_model("scripted")))),
    }
}
