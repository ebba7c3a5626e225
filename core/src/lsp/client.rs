use super::protocol::*;
use super::servers::{language_id, ServerConfig};
use super::{transport, LspError};
use crate::events::{Broker, LspEvent};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClientState {
    Starting,
    Running,
    Stopped,
    Crashed,
}

impl ClientState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ClientState::Stopped | ClientState::Crashed)
    }
}

/// path -> diagnostics of the latest push for that path
pub type DiagnosticCache = HashMap<PathBuf, Arc<Vec<Diagnostic>>>;

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, JsonRpcError>>>;

/// State shared between the client handle and its receive loop
struct Shared {
    language: String,
    state: Mutex<ClientState>,
    shutting_down: AtomicBool,
    pending: Mutex<PendingMap>,
    diagnostics: RwLock<DiagnosticCache>,
    diagnostics_changed: Notify,
    events: Broker<LspEvent>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ClientState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` unless already in a terminal state
    fn transition(&self, next: ClientState, error: Option<String>) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next;
        }
        self.events.publish(LspEvent::StateChanged {
            language: self.language.clone(),
            state: next,
            error,
        });
        true
    }

    async fn dispatch(&self, message: Incoming, outgoing: &mpsc::Sender<Vec<u8>>) {
        match message {
            Incoming::Response { id, result } => {
                if let Some(reply) = self.pending().remove(&id) {
                    let _ = reply.send(result);
                } else {
                    debug!(language = %self.language, id, "response for unknown request");
                }
            }
            Incoming::Notification { method, params } => match method.as_str() {
                "textDocument/publishDiagnostics" => self.store_diagnostics(params),
                "window/logMessage" | "window/showMessage" => {
                    debug!(language = %self.language, "{}", params["message"].as_str().unwrap_or_default());
                }
                _ => {}
            },
            Incoming::Request { id, method, params } => {
                let result = match method.as_str() {
                    "workspace/configuration" => {
                        let items = params["items"].as_array().map(Vec::len).unwrap_or(1);
                        Ok(Value::Array(vec![json!({}); items]))
                    }
                    "window/workDoneProgress/create"
                    | "client/registerCapability"
                    | "client/unregisterCapability" => Ok(Value::Null),
                    _ => Err(JsonRpcError {
                        code: METHOD_NOT_FOUND,
                        message: format!("{} is not supported", method),
                        data: None,
                    }),
                };
                match transport::encode(&response(id, result)) {
                    Ok(frame) => {
                        let _ = outgoing.send(frame).await;
                    }
                    Err(e) => warn!(language = %self.language, "cannot encode reply: {}", e),
                }
            }
        }
    }

    fn store_diagnostics(&self, params: Value) {
        let params: PublishDiagnosticsParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                debug!(language = %self.language, "malformed publishDiagnostics: {}", e);
                return;
            }
        };
        let Some(path) = uri_to_path(&params.uri) else { return };
        let count = params.diagnostics.len();

        // Whole-entry replacement: readers holding the old Arc keep a consistent list
        self.diagnostics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.clone(), Arc::new(params.diagnostics));
        self.diagnostics_changed.notify_waiters();
        self.events.publish(LspEvent::DiagnosticsUpdated {
            language: self.language.clone(),
            path,
            count,
        });
    }
}

/// A JSON-RPC session with one language server
pub struct LspClient {
    shared: Arc<Shared>,
    root: PathBuf,
    outgoing: mpsc::Sender<Vec<u8>>,
    next_id: AtomicU64,
    open_files: tokio::sync::Mutex<HashMap<PathBuf, i32>>,
    child: tokio::sync::Mutex<Option<Child>>,
    request_timeout: Duration,
    pumps: Vec<JoinHandle<()>>,
}

impl LspClient {
    /// Spawn `config.command` in `root` and wire up its stdio. The client
    /// is left in Starting; call [`LspClient::initialize`] next.
    pub async fn spawn(
        language: &str,
        config: &ServerConfig,
        root: &Path,
        events: Broker<LspEvent>,
    ) -> Result<Self, LspError> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LspError::Spawn(format!("{} {:?}: {}", config.command, config.args, e)))?;

        let stdin = child.stdin.take().ok_or_else(|| LspError::Spawn("no stdin".to_string()))?;
        let stdout = child.stdout.take().ok_or_else(|| LspError::Spawn("no stdout".to_string()))?;
        let stderr = child.stderr.take();

        let mut client = Self::connect(language, root, stdout, stdin, Some(child), events);
        if let Some(stderr) = stderr {
            let language = language.to_string();
            client.pumps.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(language = %language, "stderr: {}", line);
                }
            }));
        }
        Ok(client)
    }

    /// Run the client over an arbitrary byte stream pair
    pub fn connect<R, W>(
        language: &str,
        root: &Path,
        reader: R,
        writer: W,
        child: Option<Child>,
        events: Broker<LspEvent>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            language: language.to_string(),
            state: Mutex::new(ClientState::Starting),
            shutting_down: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            diagnostics: RwLock::new(HashMap::new()),
            diagnostics_changed: Notify::new(),
            events,
        });
        shared.events.publish(LspEvent::StateChanged {
            language: language.to_string(),
            state: ClientState::Starting,
            error: None,
        });

        let (outgoing, outgoing_rx) = mpsc::channel::<Vec<u8>>(100);
        let writer_task = tokio::spawn(write_loop(language.to_string(), writer, outgoing_rx));
        let reader_task = tokio::spawn(read_loop(shared.clone(), BufReader::new(reader), outgoing.clone()));

        Self {
            shared,
            root: root.to_path_buf(),
            outgoing,
            next_id: AtomicU64::new(1),
            open_files: tokio::sync::Mutex::new(HashMap::new()),
            child: tokio::sync::Mutex::new(child),
            request_timeout: REQUEST_TIMEOUT,
            pumps: vec![writer_task, reader_task],
        }
    }

    /// Spawn and handshake. Any failure leaves the client Crashed and is
    /// reported on the bus; there is no retry.
    pub async fn start(
        language: &str,
        config: &ServerConfig,
        root: &Path,
        events: Broker<LspEvent>,
        handshake_timeout: Duration,
    ) -> Result<Self, LspError> {
        let client = match Self::spawn(language, config, root, events.clone()).await {
            Ok(client) => client,
            Err(e) => {
                events.publish(LspEvent::StateChanged {
                    language: language.to_string(),
                    state: ClientState::Crashed,
                    error: Some(e.to_string()),
                });
                return Err(e);
            }
        };

        if let Err(e) = client
            .initialize(config.initialization_options.clone(), handshake_timeout)
            .await
        {
            client.shared.transition(ClientState::Crashed, Some(e.to_string()));
            client.kill().await;
            return Err(e);
        }
        Ok(client)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn language(&self) -> &str {
        &self.shared.language
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// `initialize` request followed by the `initialized` notification
    pub async fn initialize(&self, options: Option<Value>, timeout: Duration) -> Result<(), LspError> {
        let root_uri = path_to_uri(&self.root);
        let name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "workspace".to_string());
        let params = json!({
            "processId": std::process::id(),
            "rootUri": root_uri,
            "rootPath": self.root.display().to_string(),
            "workspaceFolders": [{"uri": root_uri, "name": name}],
            "initializationOptions": options,
            "capabilities": {
                "textDocument": {
                    "synchronization": {"dynamicRegistration": false, "didSave": true},
                    "publishDiagnostics": {"relatedInformation": true, "versionSupport": true}
                },
                "workspace": {"configuration": true, "workspaceFolders": true},
                "window": {"workDoneProgress": true}
            }
        });

        let handshake = async {
            self.request("initialize", params).await?;
            self.notify("initialized", json!({})).await
        };
        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(LspError::Handshake(e.to_string())),
            Err(_) => return Err(LspError::Handshake(format!("no answer within {:?}", timeout))),
        }

        if !self.shared.transition(ClientState::Running, None) {
            return Err(LspError::Handshake("server exited during handshake".to_string()));
        }
        info!(language = %self.shared.language, "language server running");
        Ok(())
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, LspError> {
        if self.state().is_terminal() {
            return Err(LspError::NotRunning(self.shared.language.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let params = (!params.is_null()).then_some(params);
        let frame = transport::encode(&JsonRpcRequest::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);
        if self.outgoing.send(frame).await.is_err() {
            self.shared.pending().remove(&id);
            return Err(LspError::NotRunning(self.shared.language.clone()));
        }
        debug!(language = %self.shared.language, id, method, "request sent");

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(LspError::Response { code: error.code, message: error.message }),
            Ok(Err(_)) => Err(LspError::Protocol(format!("connection closed while waiting for {}", method))),
            Err(_) => {
                self.shared.pending().remove(&id);
                Err(LspError::Timeout(method.to_string()))
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), LspError> {
        if self.state().is_terminal() {
            return Err(LspError::NotRunning(self.shared.language.clone()));
        }
        let params = (!params.is_null()).then_some(params);
        let frame = transport::encode(&JsonRpcNotification::new(method, params))?;
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| LspError::NotRunning(self.shared.language.clone()))
    }

    /// didOpen on first sight of a file, didChange with the full text after
    pub async fn open_file(&self, path: &Path) -> Result<(), LspError> {
        let text = tokio::fs::read_to_string(path).await?;
        let uri = path_to_uri(path);
        let mut open_files = self.open_files.lock().await;

        match open_files.get_mut(path) {
            Some(version) => {
                *version += 1;
                self.notify(
                    "textDocument/didChange",
                    json!({
                        "textDocument": {"uri": uri, "version": *version},
                        "contentChanges": [{"text": text}]
                    }),
                )
                .await
            }
            None => {
                self.notify(
                    "textDocument/didOpen",
                    json!({
                        "textDocument": {
                            "uri": uri,
                            "languageId": language_id(path),
                            "version": 0,
                            "text": text
                        }
                    }),
                )
                .await?;
                open_files.insert(path.to_path_buf(), 0);
                Ok(())
            }
        }
    }

    pub async fn close_file(&self, path: &Path) -> Result<(), LspError> {
        if self.open_files.lock().await.remove(path).is_none() {
            return Ok(());
        }
        self.notify(
            "textDocument/didClose",
            json!({"textDocument": {"uri": path_to_uri(path)}}),
        )
        .await
    }

    /// Point-in-time copy of the cache
    pub fn diagnostics(&self) -> DiagnosticCache {
        self.shared
            .diagnostics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn diagnostics_for(&self, path: &Path) -> Option<Arc<Vec<Diagnostic>>> {
        self.shared
            .diagnostics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    /// Wait until the server publishes for `path` or `timeout` passes.
    /// Returns whether a new push arrived.
    pub async fn wait_for_diagnostics(&self, path: &Path, timeout: Duration) -> bool {
        let before = self.diagnostics_for(path);
        self.wait_for_diagnostics_since(path, before, timeout).await
    }

    /// Like `wait_for_diagnostics`, but a push counts as new when it differs
    /// from `before`, a snapshot taken by the caller earlier
    pub async fn wait_for_diagnostics_since(
        &self,
        path: &Path,
        before: Option<Arc<Vec<Diagnostic>>>,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.diagnostics_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = self.diagnostics_for(path);
            let changed = match (&before, &current) {
                (None, Some(_)) => true,
                (Some(old), Some(new)) => !Arc::ptr_eq(old, new),
                _ => false,
            };
            if changed {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// `shutdown` then `exit`, wait for the process up to `timeout`, then
    /// kill it. Problems are logged, never returned.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        let language = self.shared.language.clone();

        let graceful = async {
            if !self.state().is_terminal() {
                self.request("shutdown", Value::Null).await?;
                self.notify("exit", Value::Null).await?;
            }
            if let Some(child) = self.child.lock().await.as_mut() {
                child.wait().await?;
            }
            Ok::<(), LspError>(())
        };

        match tokio::time::timeout(timeout, graceful).await {
            Ok(Ok(())) => debug!(language = %language, "language server exited"),
            Ok(Err(e)) => warn!(language = %language, "language server did not shut down cleanly: {}", e),
            Err(_) => warn!(language = %language, "language server still running after {:?}, killing it", timeout),
        }

        self.kill().await;
        self.shared.transition(ClientState::Stopped, None);
    }

    async fn kill(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(language = %self.shared.language, "kill failed: {}", e);
            }
        }
    }
}

impl Drop for LspClient {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

async fn write_loop<W>(language: String, mut writer: W, mut outgoing: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outgoing.recv().await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            debug!(language = %language, "write to language server failed: {}", e);
            break;
        }
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: BufReader<R>, outgoing: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        match transport::read_message(&mut reader).await {
            Ok(Some(value)) => match Incoming::parse(value) {
                Some(message) => shared.dispatch(message, &outgoing).await,
                None => debug!(language = %shared.language, "ignoring frame without id or method"),
            },
            Ok(None) => break "server closed its output".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    // Dropping the reply senders fails every outstanding request
    shared.pending().clear();

    if shared.shutting_down.load(Ordering::SeqCst) {
        shared.transition(ClientState::Stopped, None);
    } else if shared.transition(ClientState::Crashed, Some(reason.clone())) {
        warn!(language = %shared.language, "language server crashed: {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, Subscription};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct FakeServer {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn next(&mut self) -> Value {
            transport::read_message(&mut self.reader).await.unwrap().unwrap()
        }

        async fn expect(&mut self, method: &str) -> Value {
            let message = self.next().await;
            assert_eq!(message["method"], method, "unexpected frame {}", message);
            message
        }

        async fn send(&mut self, message: Value) {
            transport::write_message(&mut self.writer, &message).await.unwrap();
        }

        async fn reply(&mut self, request: &Value, result: Value) {
            let id = request["id"].clone();
            self.send(json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
        }

        async fn publish(&mut self, path: &Path, messages: &[&str]) {
            let diagnostics: Vec<Value> = messages
                .iter()
                .map(|m| json!({
                    "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 1}},
                    "severity": 1,
                    "message": m
                }))
                .collect();
            self.send(json!({
                "jsonrpc": "2.0",
                "method": "textDocument/publishDiagnostics",
                "params": {"uri": path_to_uri(path), "diagnostics": diagnostics}
            }))
            .await;
        }
    }

    fn connect_pair(bus: &EventBus) -> (LspClient, FakeServer) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let client = LspClient::connect(
            "rust",
            Path::new("/repo"),
            client_read,
            client_write,
            None,
            bus.lsp.clone(),
        )
        .with_request_timeout(Duration::from_secs(2));
        let server = FakeServer { reader: BufReader::new(server_read), writer: server_write };
        (client, server)
    }

    async fn handshake(client: &LspClient, server: &mut FakeServer) {
        let (result, _) = tokio::join!(client.initialize(None, Duration::from_secs(2)), async {
            let init = server.expect("initialize").await;
            assert_eq!(init["params"]["rootUri"], "file:///repo");
            server.reply(&init, json!({"capabilities": {}})).await;
            server.expect("initialized").await;
        });
        result.unwrap();
    }

    async fn next_state(events: &mut Subscription<LspEvent>) -> ClientState {
        loop {
            if let Some(LspEvent::StateChanged { state, .. }) = events.recv().await {
                return state;
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_moves_to_running() {
        let bus = EventBus::default();
        let mut events = bus.lsp.subscribe();
        let (client, mut server) = connect_pair(&bus);
        assert_eq!(client.state(), ClientState::Starting);

        handshake(&client, &mut server).await;

        assert_eq!(client.state(), ClientState::Running);
        assert_eq!(next_state(&mut events).await, ClientState::Starting);
        assert_eq!(next_state(&mut events).await, ClientState::Running);
    }

    #[tokio::test]
    async fn test_handshake_error_and_timeout() {
        let bus = EventBus::default();
        let (client, mut server) = connect_pair(&bus);
        let (result, _) = tokio::join!(client.initialize(None, Duration::from_secs(2)), async {
            let init = server.expect("initialize").await;
            server
                .send(json!({"jsonrpc": "2.0", "id": init["id"], "error": {"code": -32603, "message": "nope"}}))
                .await;
        });
        assert!(matches!(result, Err(LspError::Handshake(_))));

        let (silent, _server) = connect_pair(&bus);
        let result = silent.initialize(None, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(LspError::Handshake(_))));
        assert_eq!(silent.state(), ClientState::Starting);
    }

    #[tokio::test]
    async fn test_diagnostics_replace_whole_entry() {
        let bus = EventBus::default();
        let (client, mut server) = connect_pair(&bus);
        handshake(&client, &mut server).await;
        let mut events = bus.lsp.subscribe();
        let file = Path::new("/repo/src/lib.rs");

        server.publish(file, &["first", "second"]).await;
        assert!(matches!(
            events.recv().await,
            Some(LspEvent::DiagnosticsUpdated { count: 2, .. })
        ));
        let snapshot = client.diagnostics_for(file).unwrap();
        assert_eq!(snapshot.len(), 2);

        server.publish(file, &["third"]).await;
        assert!(matches!(
            events.recv().await,
            Some(LspEvent::DiagnosticsUpdated { count: 1, .. })
        ));

        // The earlier snapshot is untouched; the cache holds only the new list
        assert_eq!(snapshot.len(), 2);
        let current = client.diagnostics_for(file).unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].message, "third");
        assert_eq!(client.diagnostics().len(), 1);
    }

    #[tokio::test]
    async fn test_answers_server_requests() {
        let bus = EventBus::default();
        let (client, mut server) = connect_pair(&bus);
        handshake(&client, &mut server).await;

        server
            .send(json!({
                "jsonrpc": "2.0", "id": 7, "method": "workspace/configuration",
                "params": {"items": [{"section": "a"}, {"section": "b"}]}
            }))
            .await;
        let reply = server.next().await;
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["result"], json!([{}, {}]));

        server
            .send(json!({"jsonrpc": "2.0", "id": 8, "method": "workspace/applyEdit", "params": {}}))
            .await;
        let reply = server.next().await;
        assert_eq!(reply["id"], 8);
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unexpected_eof_marks_crashed() {
        let bus = EventBus::default();
        let (client, mut server) = connect_pair(&bus);
        handshake(&client, &mut server).await;
        let mut events = bus.lsp.subscribe();

        drop(server);

        assert_eq!(next_state(&mut events).await, ClientState::Crashed);
        assert_eq!(client.state(), ClientState::Crashed);
        assert!(matches!(
            client.request("textDocument/hover", json!({})).await,
            Err(LspError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        let bus = EventBus::default();
        let (client, mut server) = connect_pair(&bus);
        handshake(&client, &mut server).await;
        let mut events = bus.lsp.subscribe();

        tokio::join!(client.shutdown(Duration::from_secs(2)), async {
            let request = server.expect("shutdown").await;
            server.reply(&request, Value::Null).await;
            server.expect("exit").await;
            drop(server);
        });

        assert_eq!(client.state(), ClientState::Stopped);
        assert_eq!(next_state(&mut events).await, ClientState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded_when_server_hangs() {
        let bus = EventBus::default();
        let (client, mut server) = connect_pair(&bus);
        handshake(&client, &mut server).await;

        let started = std::time::Instant::now();
        client.shutdown(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(client.state(), ClientState::Stopped);
    }

    #[tokio::test]
    async fn test_open_file_and_wait_for_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.rs");
        std::fs::write(&file, "fn main() {}").unwrap();

        let bus = EventBus::default();
        let (client, mut server) = connect_pair(&bus);
        handshake(&client, &mut server).await;

        client.open_file(&file).await.unwrap();
        let open = server.expect("textDocument/didOpen").await;
        assert_eq!(open["params"]["textDocument"]["languageId"], "rust");
        assert_eq!(open["params"]["textDocument"]["text"], "fn main() {}");

        assert!(!client.wait_for_diagnostics(&file, Duration::from_millis(50)).await);

        let (arrived, _) = tokio::join!(
            client.wait_for_diagnostics(&file, Duration::from_secs(2)),
            server.publish(&file, &["oops"])
        );
        assert!(arrived);

        client.open_file(&file).await.unwrap();
        let change = server.expect("textDocument/didChange").await;
        assert_eq!(change["params"]["textDocument"]["version"], 1);
    }

    #[tokio::test]
    async fn test_push_before_wait_counts_against_earlier_snapshot() {
        let file = PathBuf::from("/repo/src/lib.rs");
        let bus = EventBus::default();
        let (client, mut server) = connect_pair(&bus);
        handshake(&client, &mut server).await;

        let before = client.diagnostics_for(&file);
        server.publish(&file, &["early"]).await;
        while client.diagnostics_for(&file).is_none() {
            tokio::task::yield_now().await;
        }

        // The push landed before the wait began
        assert!(!client.wait_for_diagnostics(&file, Duration::from_millis(50)).await);
        assert!(client.wait_for_diagnostics_since(&file, before, Duration::from_millis(50)).await);
    }
}
