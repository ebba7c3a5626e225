use crate::events::{Broker, PermissionEvent};
use crate::tools::normalize_path;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// What a tool is about to do, as shown to the user
#[derive(Debug, Clone)]
pub struct PermissionAsk {
    pub session_id: String,
    pub tool_name: String,
    pub path: PathBuf,
    pub action: String,
    pub description: String,
}

/// A pending question to the user
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub path: PathBuf,
    pub action: String,
    pub description: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PermissionError {
    #[error("No pending permission request with id {0}")]
    UnknownRequest(String),
}

#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Resolve to Allow or Deny, suspending the caller until a human answers
    /// or `cancel` fires.
    async fn request(&self, ask: PermissionAsk, cancel: &CancellationToken) -> Decision;
}

#[derive(Debug, Clone, Copy)]
enum Resolution {
    Once,
    Persistent,
    Deny,
}

struct Pending {
    request: PermissionRequest,
    reply: oneshot::Sender<Resolution>,
}

#[derive(Default)]
struct GateState {
    /// session -> approved (tool, path prefix) pairs; only ever grows
    allowed: HashMap<String, Vec<(String, PathBuf)>>,
    auto_approve: HashSet<String>,
    pending: HashMap<String, Pending>,
}

impl GateState {
    fn is_allowed(&self, ask: &PermissionAsk) -> bool {
        self.auto_approve.contains(&ask.session_id)
            || self.allowed.get(&ask.session_id).is_some_and(|pairs| {
                pairs
                    .iter()
                    .any(|(tool, prefix)| tool == &ask.tool_name && ask.path.starts_with(prefix))
            })
    }
}

/// Interactive permission service backed by the event bus
pub struct PermissionService {
    events: Broker<PermissionEvent>,
    auto_approve_all: bool,
    state: Mutex<GateState>,
}

impl PermissionService {
    pub fn new(events: Broker<PermissionEvent>) -> Self {
        Self {
            events,
            auto_approve_all: false,
            state: Mutex::new(GateState::default()),
        }
    }

    /// Allow everything without asking (non-interactive mode)
    pub fn with_auto_approve(mut self, enabled: bool) -> Self {
        self.auto_approve_all = enabled;
        self
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn auto_approve_session(&self, session_id: &str) {
        self.state().auto_approve.insert(session_id.to_string());
    }

    pub fn grant(&self, request_id: &str) -> Result<(), PermissionError> {
        self.resolve(request_id, Resolution::Once)
    }

    /// Grant and remember the (tool, directory) pair for the rest of the session
    pub fn grant_persistent(&self, request_id: &str) -> Result<(), PermissionError> {
        self.resolve(request_id, Resolution::Persistent)
    }

    pub fn deny(&self, request_id: &str) -> Result<(), PermissionError> {
        self.resolve(request_id, Resolution::Deny)
    }

    pub fn pending_requests(&self) -> Vec<PermissionRequest> {
        self.state().pending.values().map(|p| p.request.clone()).collect()
    }

    fn resolve(&self, request_id: &str, resolution: Resolution) -> Result<(), PermissionError> {
        let pending = {
            let mut state = self.state();
            let pending = state
                .pending
                .remove(request_id)
                .ok_or_else(|| PermissionError::UnknownRequest(request_id.to_string()))?;
            if let Resolution::Persistent = resolution {
                let prefix = allow_prefix(&pending.request.path);
                state
                    .allowed
                    .entry(pending.request.session_id.clone())
                    .or_default()
                    .push((pending.request.tool_name.clone(), prefix));
            }
            pending
        };

        let granted = !matches!(resolution, Resolution::Deny);
        debug!(request = request_id, granted, "permission resolved");
        let _ = pending.reply.send(resolution);
        self.events.publish(PermissionEvent::Resolved {
            request_id: request_id.to_string(),
            session_id: pending.request.session_id,
            granted,
        });
        Ok(())
    }
}

#[async_trait]
impl PermissionGate for PermissionService {
    async fn request(&self, ask: PermissionAsk, cancel: &CancellationToken) -> Decision {
        if self.auto_approve_all {
            return Decision::Allow;
        }

        let ask = PermissionAsk { path: normalize_path(&ask.path), ..ask };
        let (tx, rx) = oneshot::channel();
        let request = {
            let mut state = self.state();
            if state.is_allowed(&ask) {
                return Decision::Allow;
            }
            let request = PermissionRequest {
                id: Uuid::new_v4().to_string(),
                session_id: ask.session_id,
                tool_name: ask.tool_name,
                path: ask.path,
                action: ask.action,
                description: ask.description,
            };
            state.pending.insert(
                request.id.clone(),
                Pending { request: request.clone(), reply: tx },
            );
            request
        };

        let _withdraw = Withdraw {
            service: self,
            request_id: request.id.clone(),
            session_id: request.session_id.clone(),
        };
        self.events.publish(PermissionEvent::Requested(request));

        tokio::select! {
            resolution = rx => match resolution {
                Ok(Resolution::Once) | Ok(Resolution::Persistent) => Decision::Allow,
                Ok(Resolution::Deny) | Err(_) => Decision::Deny,
            },
            _ = cancel.cancelled() => Decision::Deny,
        }
    }
}

/// Removes a request that is still pending when its waiter goes away, whether
/// through cancellation or because the waiting future was dropped
struct Withdraw<'a> {
    service: &'a PermissionService,
    request_id: String,
    session_id: String,
}

impl Drop for Withdraw<'_> {
    fn drop(&mut self) {
        if self.service.state().pending.remove(&self.request_id).is_none() {
            return;
        }
        debug!(request = %self.request_id, "permission request withdrawn");
        self.service.events.publish(PermissionEvent::Resolved {
            request_id: std::mem::take(&mut self.request_id),
            session_id: std::mem::take(&mut self.session_id),
            granted: false,
        });
    }
}

/// Grants cover the directory itself, or the parent of a file
fn allow_prefix(path: &Path) -> PathBuf {
    let path = normalize_path(path);
    if path.is_dir() {
        return path;
    }
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => path,
    }
}

/// Gate that allows everything; used for headless runs and tests
pub struct AllowAll;

#[async_trait]
impl PermissionGate for AllowAll {
    async fn request(&self, _ask: PermissionAsk, _cancel: &CancellationToken) -> Decision {
        Decision::Allow
    }
}
