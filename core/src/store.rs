//! Session and message persistence.
//!
//! The agent only talks to [`Store`]. Each call is atomic on its own and
//! durable once it returns; callers never rely on cross-call transactions.

use crate::session::{ContentPart, Message, NewMessage, Session};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_session(&self, title: &str) -> Result<Session, StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Session, StoreError>;

    /// Most recently updated first
    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;

    async fn append_message(&self, session_id: &str, message: NewMessage) -> Result<Message, StoreError>;

    /// Messages in creation order
    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, StoreError>;

    /// Adds to the session's running totals
    async fn update_session_usage(
        &self,
        session_id: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost: f64,
    ) -> Result<Session, StoreError>;

    async fn set_summary_message(&self, session_id: &str, message_id: &str) -> Result<Session, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    session: Session,
    messages: Vec<Message>,
}

impl SessionRecord {
    fn append(&mut self, message: NewMessage) -> Result<Message, StoreError> {
        self.check_tool_results(&message)?;

        let message = Message {
            id: Uuid::new_v4().to_string(),
            session_id: self.session.id.clone(),
            role: message.role,
            parts: message.parts,
            created_at: Utc::now(),
        };
        self.messages.push(message.clone());
        self.session.message_count = self.messages.len();
        self.session.updated_at = message.created_at;
        Ok(message)
    }

    /// A tool result must answer a tool call of the latest assistant
    /// message that carries that id, and only once. Call ids are only unique
    /// within one turn, so earlier turns may reuse them.
    fn check_tool_results(&self, message: &NewMessage) -> Result<(), StoreError> {
        let mut seen = HashSet::new();
        for part in &message.parts {
            let ContentPart::ToolResult(result) = part else {
                continue;
            };
            let call_id = result.call_id.as_str();

            let Some(origin) = self
                .messages
                .iter()
                .rposition(|existing| existing.tool_calls().any(|call| call.id == call_id))
            else {
                return Err(StoreError::InvalidMessage(format!(
                    "tool result for unknown call {}",
                    call_id
                )));
            };

            let answered = self.messages[origin + 1..]
                .iter()
                .any(|existing| existing.tool_results().any(|result| result.call_id == call_id));
            if answered || !seen.insert(call_id) {
                return Err(StoreError::InvalidMessage(format!(
                    "duplicate tool result for call {}",
                    call_id
                )));
            }
        }
        Ok(())
    }
}

/// In-process bookkeeping shared by the store implementations
#[derive(Default)]
struct Book {
    records: HashMap<String, SessionRecord>,
}

impl Book {
    fn create(&mut self, title: &str) -> SessionRecord {
        let session = Session::new(Uuid::new_v4().to_string(), title.to_string());
        let record = SessionRecord { session, messages: Vec::new() };
        self.records.insert(record.session.id.clone(), record.clone());
        record
    }

    fn record(&self, session_id: &str) -> Result<&SessionRecord, StoreError> {
        self.records
            .get(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    fn record_mut(&mut self, session_id: &str) -> Result<&mut SessionRecord, StoreError> {
        self.records
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.records.values().map(|r| r.session.clone()).collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    fn add_usage(&mut self, session_id: &str, prompt: u64, completion: u64, cost: f64) -> Result<&SessionRecord, StoreError> {
        let record = self.record_mut(session_id)?;
        record.session.prompt_tokens += prompt;
        record.session.completion_tokens += completion;
        record.session.cost += cost;
        record.session.updated_at = Utc::now();
        Ok(record)
    }

    fn set_summary(&mut self, session_id: &str, message_id: &str) -> Result<&SessionRecord, StoreError> {
        let record = self.record_mut(session_id)?;
        if !record.messages.iter().any(|m| m.id == message_id) {
            return Err(StoreError::InvalidMessage(format!(
                "message {} is not part of session {}",
                message_id, session_id
            )));
        }
        record.session.summary_message_id = Some(message_id.to_string());
        record.session.updated_at = Utc::now();
        Ok(record)
    }
}

/// Volatile store, used by tests and when persistence is not wanted
#[derive(Default)]
pub struct MemoryStore {
    book: Mutex<Book>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_book<R>(&self, f: impl FnOnce(&mut Book) -> R) -> R {
        let mut book = self.book.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut book)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_session(&self, title: &str) -> Result<Session, StoreError> {
        Ok(self.with_book(|book| book.create(title).session))
    }

    async fn get_session(&self, session_id: &str) -> Result<Session, StoreError> {
        self.with_book(|book| book.record(session_id).map(|r| r.session.clone()))
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self.with_book(|book| book.sessions()))
    }

    async fn append_message(&self, session_id: &str, message: NewMessage) -> Result<Message, StoreError> {
        self.with_book(|book| book.record_mut(session_id)?.append(message))
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        self.with_book(|book| book.record(session_id).map(|r| r.messages.clone()))
    }

    async fn update_session_usage(
        &self,
        session_id: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost: f64,
    ) -> Result<Session, StoreError> {
        self.with_book(|book| {
            book.add_usage(session_id, prompt_tokens, completion_tokens, cost)
                .map(|r| r.session.clone())
        })
    }

    async fn set_summary_message(&self, session_id: &str, message_id: &str) -> Result<Session, StoreError> {
        self.with_book(|book| book.set_summary(session_id, message_id).map(|r| r.session.clone()))
    }
}

/// One JSON document per session under `<dir>/sessions/`, rewritten on
/// every mutation.
pub struct JsonFileStore {
    dir: PathBuf,
    book: tokio::sync::Mutex<Book>,
}

impl JsonFileStore {
    /// Open the store, loading every readable session document in `dir`
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().join("sessions");
        tokio::fs::create_dir_all(&dir).await?;

        let mut book = Book::default();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<SessionRecord>(&raw) {
                Ok(record) => {
                    book.records.insert(record.session.id.clone(), record);
                }
                Err(e) => warn!("Skipping unreadable session file {}: {}", path.display(), e),
            }
        }
        debug!(sessions = book.records.len(), dir = %dir.display(), "session store opened");

        Ok(Self { dir, book: tokio::sync::Mutex::new(book) })
    }

    async fn persist(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let path = self.dir.join(format!("{}.json", record.session.id));
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn create_session(&self, title: &str) -> Result<Session, StoreError> {
        let mut book = self.book.lock().await;
        let record = book.create(title);
        if let Err(e) = self.persist(&record).await {
            book.records.remove(&record.session.id);
            return Err(e);
        }
        Ok(record.session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Session, StoreError> {
        let book = self.book.lock().await;
        book.record(session_id).map(|r| r.session.clone())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self.book.lock().await.sessions())
    }

    async fn append_message(&self, session_id: &str, message: NewMessage) -> Result<Message, StoreError> {
        let mut book = self.book.lock().await;
        let record = book.record_mut(session_id)?;
        let before = record.clone();
        let appended = record.append(message)?;
        let snapshot = record.clone();
        if let Err(e) = self.persist(&snapshot).await {
            book.records.insert(session_id.to_string(), before);
            return Err(e);
        }
        Ok(appended)
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let book = self.book.lock().await;
        book.record(session_id).map(|r| r.messages.clone())
    }

    async fn update_session_usage(
        &self,
        session_id: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost: f64,
    ) -> Result<Session, StoreError> {
        let mut book = self.book.lock().await;
        let before = book.record(session_id)?.clone();
        let snapshot = book.add_usage(session_id, prompt_tokens, completion_tokens, cost)?.clone();
        if let Err(e) = self.persist(&snapshot).await {
            book.records.insert(session_id.to_string(), before);
            return Err(e);
        }
        Ok(snapshot.session)
    }

    async fn set_summary_message(&self, session_id: &str, message_id: &str) -> Result<Session, StoreError> {
        let mut book = self.book.lock().await;
        let before = book.record(session_id)?.clone();
        let snapshot = book.set_summary(session_id, message_id)?.clone();
        if let Err(e) = self.persist(&snapshot).await {
            book.records.insert(session_id.to_string(), before);
            return Err(e);
        }
        Ok(snapshot.session)
    }
}
