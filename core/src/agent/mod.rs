//! Agent orchestration.
//!
//! One run per session at a time. A run streams the model's answer, gates
//! and executes the tool calls it asks for, appends everything to the store
//! and loops until the model stops calling tools or the run is cancelled.

pub mod agent_logic;
pub mod prompt;

use crate::events::{EventBus, RunEvent, SessionEvent, TokenUsage};
use crate::permission::PermissionGate;
use crate::provider::{ChatRequest, Provider, ProviderError, ProviderEvent};
use crate::session::{
    title_from_input, Attachment, ContentPart, FinishReason, Message, MessageRole, NewMessage, Session,
};
use crate::store::{Store, StoreError};
use crate::supervisor::TaskSupervisor;
use crate::tools::ToolExecutor;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Session {0} is busy")]
    Busy(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl From<StoreError> for AgentError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::SessionNotFound(id) => AgentError::SessionNotFound(id),
            other => AgentError::Store(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Cancelling,
    Compacting,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { usage: TokenUsage },
    Cancelled,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactOutcome {
    Compacted { summary_message_id: String },
    /// Nothing changed; the reason is meant for the user
    Skipped(String),
}

/// Handle to a spawned run
#[derive(Debug)]
pub struct RunHandle {
    pub session_id: String,
    pub run_id: String,
    outcome: oneshot::Receiver<RunOutcome>,
}

impl RunHandle {
    /// Wait for the run to end. A run torn down by shutdown counts as cancelled.
    pub async fn wait(self) -> RunOutcome {
        self.outcome.await.unwrap_or(RunOutcome::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Run,
    Compact,
}

struct ActiveSlot {
    run_id: String,
    kind: SlotKind,
    cancel: CancellationToken,
}

pub(crate) struct AgentInner {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) permissions: Arc<dyn PermissionGate>,
    pub(crate) executor: Arc<ToolExecutor>,
    pub(crate) bus: EventBus,
    supervisor: Arc<TaskSupervisor>,
    active: Mutex<HashMap<String, ActiveSlot>>,
    pub(crate) system_prompt: String,
    pub(crate) max_tokens: Option<u32>,
}

impl AgentInner {
    fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveSlot>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the session's slot or fail with Busy
    fn claim(&self, session_id: &str, kind: SlotKind) -> Result<(String, CancellationToken), AgentError> {
        let mut active = self.active();
        if active.contains_key(session_id) {
            return Err(AgentError::Busy(session_id.to_string()));
        }
        let run_id = Uuid::new_v4().to_string();
        let cancel = self.supervisor.child_token();
        active.insert(
            session_id.to_string(),
            ActiveSlot { run_id: run_id.clone(), kind, cancel: cancel.clone() },
        );
        Ok((run_id, cancel))
    }

    fn release(&self, session_id: &str, run_id: &str) {
        let mut active = self.active();
        if active.get(session_id).is_some_and(|slot| slot.run_id == run_id) {
            active.remove(session_id);
        }
    }

    /// Add usage to the session totals and announce the new totals
    pub(crate) async fn record_usage(&self, session_id: &str, usage: TokenUsage) {
        if usage.total() == 0 {
            return;
        }
        let cost = self.provider.model().cost(usage);
        match self
            .store
            .update_session_usage(session_id, usage.input_tokens, usage.output_tokens, cost)
            .await
        {
            Ok(session) => {
                self.bus.sessions.publish(SessionEvent::Updated(session));
            }
            Err(e) => warn!(session = session_id, "failed to record usage: {}", e),
        }
    }

    /// Stored history the model should see: from the latest summary on
    pub(crate) async fn history(&self, session: &Session) -> Result<Vec<Message>, StoreError> {
        let messages = self.store.list_messages(&session.id).await?;
        let start = session
            .summary_message_id
            .as_ref()
            .and_then(|id| messages.iter().position(|m| &m.id == id))
            .unwrap_or(0);
        Ok(messages.into_iter().skip(start).collect())
    }
}

/// Releases the session slot and publishes exactly one terminal event, even
/// when the run task is torn down early.
struct RunGuard {
    inner: Arc<AgentInner>,
    session_id: String,
    run_id: String,
    finished: bool,
}

impl RunGuard {
    fn finish(mut self, outcome: &RunOutcome) {
        self.finished = true;
        self.inner.release(&self.session_id, &self.run_id);
        let session_id = self.session_id.clone();
        let event = match outcome {
            RunOutcome::Completed { usage } => RunEvent::Completed { session_id, usage: *usage },
            RunOutcome::Cancelled => RunEvent::Cancelled { session_id },
            RunOutcome::Failed { error } => RunEvent::Failed { session_id, error: error.clone() },
        };
        self.inner.bus.runs.publish(event);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.release(&self.session_id, &self.run_id);
            self.inner.bus.runs.publish(RunEvent::Cancelled { session_id: self.session_id.clone() });
        }
    }
}

/// The conversation driver
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        permissions: Arc<dyn PermissionGate>,
        executor: Arc<ToolExecutor>,
        bus: EventBus,
        supervisor: Arc<TaskSupervisor>,
    ) -> Self {
        let system_prompt = prompt::system_prompt(executor.working_dir());
        Self {
            inner: Arc::new(AgentInner {
                store,
                provider,
                permissions,
                executor,
                bus,
                supervisor,
                active: Mutex::new(HashMap::new()),
                system_prompt,
                max_tokens: None,
            }),
        }
    }

    /// Call before the agent is shared
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.max_tokens = Some(max_tokens);
        }
        self
    }

    /// Start a run for `text` in `session_id`; an empty id starts a new session.
    pub async fn run(
        &self,
        session_id: &str,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<RunHandle, AgentError> {
        let session = if session_id.is_empty() {
            let session = self.inner.store.create_session(&title_from_input(text)).await?;
            info!(session = %session.id, "created session");
            self.inner.bus.sessions.publish(SessionEvent::Selected(session.clone()));
            session
        } else {
            self.inner.store.get_session(session_id).await?
        };
        let session_id = session.id.clone();
        let attachments = load_attachments(attachments).await;

        let (run_id, cancel) = self.inner.claim(&session_id, SlotKind::Run)?;
        if let Err(e) = self
            .inner
            .store
            .append_message(&session_id, NewMessage::user(text, attachments))
            .await
        {
            self.inner.release(&session_id, &run_id);
            return Err(e.into());
        }

        self.inner.bus.runs.publish(RunEvent::Started {
            session_id: session_id.clone(),
            run_id: run_id.clone(),
        });

        let (tx, rx) = oneshot::channel();
        let guard = RunGuard {
            inner: self.inner.clone(),
            session_id: session_id.clone(),
            run_id: run_id.clone(),
            finished: false,
        };
        let inner = self.inner.clone();
        let task_session = session_id.clone();
        self.inner.supervisor.spawn("agent-run", async move {
            let outcome = agent_logic::drive(&inner, &task_session, &cancel).await;
            debug!(session = %task_session, ?outcome, "run finished");
            guard.finish(&outcome);
            let _ = tx.send(outcome);
        });

        Ok(RunHandle { session_id, run_id, outcome: rx })
    }

    /// Fire the session's cancellation token. No-op when nothing is running.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.inner.active().get(session_id) {
            Some(slot) => {
                info!(session = session_id, "cancelling run");
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for slot in self.inner.active().values() {
            slot.cancel.cancel();
        }
    }

    /// Any session running or compacting
    pub fn is_busy(&self) -> bool {
        !self.inner.active().is_empty()
    }

    pub fn state(&self, session_id: &str) -> SessionState {
        match self.inner.active().get(session_id) {
            None => SessionState::Idle,
            Some(slot) if slot.cancel.is_cancelled() => SessionState::Cancelling,
            Some(slot) if slot.kind == SlotKind::Compact => SessionState::Compacting,
            Some(_) => SessionState::Running,
        }
    }

    /// Summarize the session and make the summary the new start of its
    /// history. Skipped when the session is not idle.
    pub async fn compact_session(&self, session_id: &str) -> Result<CompactOutcome, AgentError> {
        let session = self.inner.store.get_session(session_id).await?;
        let (run_id, cancel) = match self.inner.claim(session_id, SlotKind::Compact) {
            Ok(claimed) => claimed,
            Err(AgentError::Busy(_)) => {
                return Ok(CompactOutcome::Skipped(
                    "Cannot compact while the agent is working on this session".to_string(),
                ))
            }
            Err(e) => return Err(e),
        };

        let result = self.summarize(&session, &cancel).await;
        self.inner.release(session_id, &run_id);
        result
    }

    async fn summarize(&self, session: &Session, cancel: &CancellationToken) -> Result<CompactOutcome, AgentError> {
        let mut history = self.inner.history(session).await?;
        if history.is_empty() {
            return Ok(CompactOutcome::Skipped("Nothing to compact yet".to_string()));
        }
        history.push(Message {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            role: MessageRole::User,
            parts: vec![ContentPart::Text { text: prompt::SUMMARY_REQUEST.to_string() }],
            created_at: Utc::now(),
        });

        let request = ChatRequest {
            system: prompt::SUMMARIZE_PROMPT.to_string(),
            messages: history,
            tools: Vec::new(),
            max_tokens: self.inner.max_tokens,
        };
        let mut events = self.inner.provider.stream(request, cancel.clone()).await?;

        let mut summary = String::new();
        let mut usage = TokenUsage::default();
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = cancel.cancelled() => None,
            };
            match event {
                Some(ProviderEvent::ContentDelta(text)) => summary.push_str(&text),
                Some(ProviderEvent::Usage(u)) => usage.add(u),
                Some(ProviderEvent::Error(e)) => {
                    self.inner.record_usage(&session.id, usage).await;
                    return Err(ProviderError::Stream(e).into());
                }
                Some(ProviderEvent::ToolCall(call)) => {
                    debug!(tool = %call.name, "ignoring tool call during compaction")
                }
                Some(ProviderEvent::Done { .. }) | None => break,
            }
        }

        if cancel.is_cancelled() {
            self.inner.record_usage(&session.id, usage).await;
            return Ok(CompactOutcome::Skipped("Compaction was cancelled".to_string()));
        }
        if summary.trim().is_empty() {
            self.inner.record_usage(&session.id, usage).await;
            return Ok(CompactOutcome::Skipped("The model returned an empty summary".to_string()));
        }

        let message = self
            .inner
            .store
            .append_message(
                &session.id,
                NewMessage::assistant(vec![
                    ContentPart::Text { text: summary },
                    ContentPart::Finish { reason: FinishReason::EndTurn },
                ]),
            )
            .await?;
        let updated = self.inner.store.set_summary_message(&session.id, &message.id).await?;
        self.inner.bus.sessions.publish(SessionEvent::Updated(updated));
        self.inner.record_usage(&session.id, usage).await;
        info!(session = %session.id, "session compacted");

        Ok(CompactOutcome::Compacted { summary_message_id: message.id })
    }
}

/// Fill in the content of attachments given only by path. Unreadable files
/// stay path-only.
async fn load_attachments(attachments: Vec<Attachment>) -> Vec<Attachment> {
    let mut loaded = Vec::with_capacity(attachments.len());
    for attachment in attachments {
        if attachment.content.is_some() {
            loaded.push(attachment);
            continue;
        }
        match tokio::fs::read_to_string(&attachment.path).await {
            Ok(content) => loaded.push(attachment.with_content(content)),
            Err(e) => {
                debug!(path = %attachment.path.display(), "attachment not readable: {}", e);
                loaded.push(attachment);
            }
        }
    }
    loaded
}

#[cfg(test)]
mod tests;
