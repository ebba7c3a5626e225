use crate::tools::ToolCall;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A persisted conversation thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    pub message_count: usize,
    /// History sent to the model starts at this message once set
    pub summary_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: String, title: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            title,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: 0.0,
            message_count: 0,
            summary_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Who sent the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    ToolUse,
    Cancelled,
    Error,
}

/// File attached to a user message at submission time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub path: PathBuf,
    pub content: Option<String>,
}

impl Attachment {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), content: None }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Attachment(Attachment),
    Finish { reason: FinishReason },
}

/// A single message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub parts: Vec<ContentPart>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Concatenated text parts
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.parts.iter().filter_map(|part| match part {
            ContentPart::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResult> {
        self.parts.iter().filter_map(|part| match part {
            ContentPart::ToolResult(result) => Some(result),
            _ => None,
        })
    }

    pub fn attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.parts.iter().filter_map(|part| match part {
            ContentPart::Attachment(attachment) => Some(attachment),
            _ => None,
        })
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.parts.iter().find_map(|part| match part {
            ContentPart::Finish { reason } => Some(*reason),
            _ => None,
        })
    }
}

/// Message content before the store assigns identity and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub parts: Vec<ContentPart>,
}

impl NewMessage {
    pub fn user(text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        let mut parts = vec![ContentPart::Text { text: text.into() }];
        parts.extend(attachments.into_iter().map(ContentPart::Attachment));
        Self { role: MessageRole::User, parts }
    }

    pub fn assistant(parts: Vec<ContentPart>) -> Self {
        Self { role: MessageRole::Assistant, parts }
    }

    pub fn tool_result(result: ToolResult) -> Self {
        Self { role: MessageRole::Tool, parts: vec![ContentPart::ToolResult(result)] }
    }
}

/// Session title from the first non-empty line of input, at most 50 chars
pub fn title_from_input(input: &str) -> String {
    let line = input.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if line.is_empty() {
        return "New session".to_string();
    }
    let mut title: String = line.chars().take(50).collect();
    if line.chars().count() > 50 {
        title = title.trim_end().to_string();
        title.push_str("...");
    }
    title
}
