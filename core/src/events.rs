use crate::lsp::ClientState;
use crate::permission::PermissionRequest;
use crate::session::Session;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, warn};

pub const DEFAULT_BUFFER: usize = 256;

/// Session lifecycle as seen by the UI
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Selected(Session),
    Cleared,
    Updated(Session),
}

/// Agent run lifecycle. Each started run ends with exactly one of
/// Completed, Cancelled or Failed.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Started { session_id: String, run_id: String },
    ContentDelta { session_id: String, text: String },
    Completed { session_id: String, usage: TokenUsage },
    Cancelled { session_id: String },
    Failed { session_id: String, error: String },
}

impl RunEvent {
    pub fn session_id(&self) -> &str {
        match self {
            RunEvent::Started { session_id, .. }
            | RunEvent::ContentDelta { session_id, .. }
            | RunEvent::Completed { session_id, .. }
            | RunEvent::Cancelled { session_id }
            | RunEvent::Failed { session_id, .. } => session_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::Completed { .. } | RunEvent::Cancelled { .. } | RunEvent::Failed { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub enum PermissionEvent {
    Requested(PermissionRequest),
    Resolved { request_id: String, session_id: String, granted: bool },
}

#[derive(Debug, Clone)]
pub enum LspEvent {
    StateChanged { language: String, state: ClientState, error: Option<String> },
    DiagnosticsUpdated { language: String, path: PathBuf, count: usize },
}

// Tool lifecycle events
#[derive(Debug, Clone)]
pub enum ToolEvent {
    Begin { session_id: String, call_id: String, tool: String, summary: String },
    Progress { call_id: String, message: String },
    Stdout { call_id: String, chunk: String },
    Stderr { call_id: String, chunk: String },
    End { session_id: String, call_id: String, ok: bool, duration_ms: u64 },
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

pub type SubscriptionId = u64;

struct BrokerInner<T> {
    topic: &'static str,
    buffer: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
    subscribers: Mutex<HashMap<SubscriptionId, mpsc::Sender<T>>>,
}

impl<T> BrokerInner<T> {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<SubscriptionId, mpsc::Sender<T>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single-topic publish/subscribe fan-out.
///
/// Every subscriber owns a bounded buffer. `publish` never waits: a subscriber
/// whose buffer is full is dropped with a warning, and one whose receiver is
/// gone is removed quietly.
pub struct Broker<T> {
    inner: Arc<BrokerInner<T>>,
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Clone + Send + 'static> Broker<T> {
    pub fn new(topic: &'static str, buffer: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topic,
                buffer: buffer.max(1),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        {
            // `closed` only changes under this lock, so a shut-down broker
            // never gains a subscriber
            let mut subscribers = self.inner.subscribers();
            if !self.inner.closed.load(Ordering::SeqCst) {
                subscribers.insert(id, tx);
            }
        }
        Subscription {
            id,
            receiver: rx,
            broker: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every live subscriber; returns how many received it.
    pub fn publish(&self, event: T) -> usize {
        let mut subscribers = self.inner.subscribers();
        let mut delivered = 0;
        let mut dropped = Vec::new();

        for (id, tx) in subscribers.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        topic = self.inner.topic,
                        subscriber = id,
                        "subscriber buffer full, dropping subscriber"
                    );
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => dropped.push(*id),
            }
        }
        for id in dropped {
            subscribers.remove(&id);
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// Release every subscription. Receivers drain what is buffered, then end.
    pub fn shutdown(&self) {
        let released = {
            let mut subscribers = self.inner.subscribers();
            self.inner.closed.store(true, Ordering::SeqCst);
            let count = subscribers.len();
            subscribers.clear();
            count
        };
        debug!(topic = self.inner.topic, released, "broker shut down");
    }
}

/// Receiving side of a broker subscription. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: SubscriptionId,
    receiver: mpsc::Receiver<T>,
    broker: Weak<BrokerInner<T>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next event, or `None` once the subscription was released or dropped
    /// by the broker and the buffer is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.subscribers().remove(&self.id);
        }
    }
}

/// The typed topics the runtime publishes on
#[derive(Clone)]
pub struct EventBus {
    pub sessions: Broker<SessionEvent>,
    pub runs: Broker<RunEvent>,
    pub permissions: Broker<PermissionEvent>,
    pub lsp: Broker<LspEvent>,
    pub tools: Broker<ToolEvent>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            sessions: Broker::new("sessions", buffer),
            runs: Broker::new("runs", buffer),
            permissions: Broker::new("permissions", buffer),
            lsp: Broker::new("lsp", buffer),
            tools: Broker::new("tools", buffer),
        }
    }

    pub fn shutdown(&self) {
        self.sessions.shutdown();
        self.runs.shutdown();
        self.permissions.shutdown();
        self.lsp.shutdown();
        self.tools.shutdown();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}
