use super::client::{ClientState, LspClient};
use super::protocol::{Diagnostic, Severity};
use super::servers::{detect_languages, ServerConfig};
use super::LspError;
use crate::events::{Broker, LspEvent};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DETECTION_FILE_LIMIT: usize = 5000;

type ClientMap = HashMap<String, Arc<LspClient>>;

/// Counts for the status line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticSummary {
    pub errors: usize,
    pub warnings: usize,
    pub info: usize,
    pub hints: usize,
}

impl DiagnosticSummary {
    pub fn total(&self) -> usize {
        self.errors + self.warnings + self.info + self.hints
    }
}

/// Owns one client per language.
///
/// The client map is published as an immutable snapshot: readers clone the
/// `Arc` and never hold the lock across an await, writers swap in a new map.
pub struct LspManager {
    root: PathBuf,
    servers: HashMap<String, ServerConfig>,
    clients: RwLock<Arc<ClientMap>>,
    failures: Mutex<HashMap<String, String>>,
    events: Broker<LspEvent>,
    handshake_timeout: Duration,
    initializing: AtomicUsize,
    /// Serializes starts of the same language
    start_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LspManager {
    pub fn new(
        root: impl Into<PathBuf>,
        servers: HashMap<String, ServerConfig>,
        events: Broker<LspEvent>,
    ) -> Self {
        Self {
            root: root.into(),
            servers,
            clients: RwLock::new(Arc::new(HashMap::new())),
            failures: Mutex::new(HashMap::new()),
            events,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            initializing: AtomicUsize::new(0),
            start_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot(&self) -> Arc<ClientMap> {
        self.clients.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update(&self, change: impl FnOnce(&mut ClientMap)) {
        let mut guard = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = (**guard).clone();
        change(&mut next);
        *guard = Arc::new(next);
    }

    fn start_lock(&self, language: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.start_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(language.to_string())
            .or_default()
            .clone()
    }

    /// Start the server configured for `language`. A failure is recorded in
    /// `status` and on the bus; the server is not retried, and later calls
    /// fail with `NotRunning`. Concurrent callers share one start.
    pub async fn start_server(&self, language: &str) -> Result<(), LspError> {
        let config = self
            .servers
            .get(language)
            .ok_or_else(|| LspError::Spawn(format!("no server configured for {}", language)))?;

        let lock = self.start_lock(language);
        let _starting = lock.lock().await;
        if self.snapshot().contains_key(language) {
            return Ok(());
        }
        let failed = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(language);
        if failed {
            return Err(LspError::NotRunning(language.to_string()));
        }

        self.initializing.fetch_add(1, Ordering::SeqCst);
        let started = LspClient::start(
            language,
            config,
            &self.root,
            self.events.clone(),
            self.handshake_timeout,
        )
        .await;
        self.initializing.fetch_sub(1, Ordering::SeqCst);

        match started {
            Ok(client) => {
                info!(language, command = %config.command, "language server started");
                self.add_client(language, Arc::new(client));
                Ok(())
            }
            Err(e) => {
                warn!(language, command = %config.command, "language server failed to start: {}", e);
                self.failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(language.to_string(), e.to_string());
                Err(e)
            }
        }
    }

    /// Start a server for every configured language found under the root.
    /// Startup is concurrent and abandoned when `cancel` fires.
    pub async fn start_detected(&self, cancel: &CancellationToken) -> Vec<String> {
        let root = self.root.clone();
        let servers = self.servers.clone();
        let languages = match tokio::task::spawn_blocking(move || {
            detect_languages(&root, &servers, DETECTION_FILE_LIMIT)
        })
        .await
        {
            Ok(languages) => languages,
            Err(e) => {
                warn!("language detection failed: {}", e);
                return Vec::new();
            }
        };

        let starts = join_all(languages.iter().map(|language| self.start_server(language)));
        tokio::select! {
            results = starts => languages
                .iter()
                .zip(results)
                .filter_map(|(language, result)| result.ok().map(|_| language.clone()))
                .collect(),
            _ = cancel.cancelled() => {
                info!("language server startup cancelled");
                Vec::new()
            }
        }
    }

    pub async fn stop_server(&self, language: &str, timeout: Duration) {
        let mut removed = None;
        self.update(|clients| removed = clients.remove(language));
        if let Some(client) = removed {
            client.shutdown(timeout).await;
        }
    }

    /// Shut every client down concurrently, each bounded by `timeout`
    pub async fn shutdown_all(&self, timeout: Duration) {
        let clients = {
            let mut guard = self.clients.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, Arc::new(HashMap::new()))
        };
        if clients.is_empty() {
            return;
        }
        info!(count = clients.len(), "shutting down language servers");
        join_all(clients.values().map(|client| client.shutdown(timeout))).await;
    }

    /// State of every known server, including ones that failed to start
    pub fn status(&self) -> BTreeMap<String, ClientState> {
        let mut status: BTreeMap<String, ClientState> = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(|language| (language.clone(), ClientState::Crashed))
            .collect();
        for (language, client) in self.snapshot().iter() {
            status.insert(language.clone(), client.state());
        }
        status
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing.load(Ordering::SeqCst) > 0
    }

    pub fn client_for_path(&self, path: &Path) -> Option<Arc<LspClient>> {
        let clients = self.snapshot();
        self.servers
            .iter()
            .filter(|(_, config)| config.handles(path))
            .find_map(|(language, _)| clients.get(language).cloned())
            .filter(|client| !client.state().is_terminal())
    }

    /// Tell the server responsible for `path` about its current contents
    pub async fn open_file(&self, path: &Path) -> Result<(), LspError> {
        let client = self
            .client_for_path(path)
            .ok_or_else(|| LspError::NoServer(path.to_path_buf()))?;
        client.open_file(path).await
    }

    /// Open `path`, then wait for diagnostics newer than those cached before
    /// the open. Returns whether a new push arrived.
    pub async fn open_and_wait(&self, path: &Path, timeout: Duration) -> Result<bool, LspError> {
        let client = self
            .client_for_path(path)
            .ok_or_else(|| LspError::NoServer(path.to_path_buf()))?;
        let before = client.diagnostics_for(path);
        client.open_file(path).await?;
        Ok(client.wait_for_diagnostics_since(path, before, timeout).await)
    }

    pub async fn wait_for_diagnostics(&self, path: &Path, timeout: Duration) -> bool {
        match self.client_for_path(path) {
            Some(client) => client.wait_for_diagnostics(path, timeout).await,
            None => false,
        }
    }

    /// Non-empty diagnostics across all clients, ordered by path
    pub fn diagnostics(&self) -> BTreeMap<PathBuf, Vec<Diagnostic>> {
        let mut merged: BTreeMap<PathBuf, Vec<Diagnostic>> = BTreeMap::new();
        for client in self.snapshot().values() {
            for (path, diagnostics) in client.diagnostics() {
                if !diagnostics.is_empty() {
                    merged.entry(path).or_default().extend(diagnostics.iter().cloned());
                }
            }
        }
        merged
    }

    pub fn diagnostics_for(&self, path: &Path) -> Vec<Diagnostic> {
        self.snapshot()
            .values()
            .filter_map(|client| client.diagnostics_for(path))
            .flat_map(|diagnostics| diagnostics.iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn summary(&self) -> DiagnosticSummary {
        let mut summary = DiagnosticSummary::default();
        for diagnostic in self.diagnostics().values().flatten() {
            match diagnostic.severity() {
                Severity::Error => summary.errors += 1,
                Severity::Warning => summary.warnings += 1,
                Severity::Information => summary.info += 1,
                Severity::Hint => summary.hints += 1,
            }
        }
        summary
    }

    pub(crate) fn add_client(&self, language: &str, client: Arc<LspClient>) {
        let language = language.to_string();
        self.update(move |clients| {
            clients.insert(language, client);
        });
    }
}
