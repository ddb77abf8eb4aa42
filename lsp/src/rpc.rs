//! JSON-RPC client over a language server's stdio.
//!
//! [`StdioSpawner`] launches the process and performs the `initialize`
//! handshake; the resulting [`RpcClient`] is what the registry holds while the
//! server is Started. Both sit behind the [`Spawner`] / [`ClientHandle`]
//! traits so the registry can be driven without real subprocesses.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter, Incoming};
use crate::error::LspError;
use crate::protocol::{self, Notification, Request};
use crate::types::LanguageServerConfig;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Environment variables never forwarded to language servers.
///
/// Patterns support a leading and/or trailing `*`; matching is on the
/// uppercased variable name.
pub const ENV_SECRET_DENYLIST: &[&str] = &[
    "*_API_KEY",
    "*_APIKEY",
    "*_TOKEN",
    "*_SECRET",
    "*_SECRET_KEY",
    "*_PASSWORD",
    "*_CREDENTIAL*",
    "AWS_*",
    "ANTHROPIC_*",
    "OPENAI_*",
    "GEMINI_*",
];

/// Called for every server→client notification.
pub type NotificationHandler = Arc<dyn Fn(&str, Option<Value>) + Send + Sync>;

/// Called once when the server's output stream ends.
pub type ExitHandler = Arc<dyn Fn(ServerStopReason) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStopReason {
    /// Clean EOF on the server's stdout.
    Exited,
    /// Read error or protocol violation.
    Failed(String),
}

/// A live, initialized connection to one language server.
pub trait ClientHandle: Send + Sync + 'static {
    fn send_notification(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<(), LspError>> + Send;

    /// Replace the notification handler.
    fn on_notification(&self, handler: NotificationHandler);

    /// Set the exit handler. Fires immediately if the server already exited.
    fn on_exit(&self, handler: ExitHandler);

    /// Best-effort `shutdown` + `exit`; never fails.
    fn shutdown(&self) -> impl Future<Output = ()> + Send;

    /// Tear down synchronously. Idempotent; never panics.
    fn dispose(&self);
}

/// Starts language servers and hands back initialized handles.
pub trait Spawner: Send + Sync + 'static {
    type Handle: ClientHandle;

    fn spawn(
        &self,
        config: &LanguageServerConfig,
        root: &Path,
    ) -> impl Future<Output = Result<Self::Handle, LspError>> + Send;
}

/// Minimal glob matcher for env var denylist patterns.
/// Handles `*_SUFFIX`, `PREFIX_*`, `*_INFIX*`, and exact match.
fn env_glob_matches(pattern: &str, key_upper: &str) -> bool {
    let pat = pattern.to_uppercase();
    match (pat.strip_prefix('*'), pat.strip_suffix('*')) {
        (Some(_), Some(_)) if pat.len() >= 2 => key_upper.contains(&pat[1..pat.len() - 1]),
        (Some(suffix), None) => key_upper.ends_with(suffix),
        (None, Some(prefix)) => key_upper.starts_with(prefix),
        _ => key_upper == pat,
    }
}

fn is_secret_env(key: &str) -> bool {
    let upper = key.to_uppercase();
    ENV_SECRET_DENYLIST
        .iter()
        .any(|pat| env_glob_matches(pat, &upper))
}

/// Lock ignoring poison; every critical section here is a plain field swap.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Launches servers as child processes speaking LSP over stdio.
#[derive(Debug, Clone)]
pub struct StdioSpawner {
    handshake_timeout: Duration,
    shutdown_timeout: Duration,
}

impl Default for StdioSpawner {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl StdioSpawner {
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Spawner for StdioSpawner {
    type Handle = RpcClient;

    async fn spawn(
        &self,
        config: &LanguageServerConfig,
        root: &Path,
    ) -> Result<RpcClient, LspError> {
        let spawn_error = |reason: String| LspError::Spawn {
            command: config.command.clone(),
            reason,
        };

        let resolved = which::which(&config.command)
            .map_err(|e| spawn_error(format!("not found in PATH: {e}")))?;
        let mut cmd = Command::new(&resolved);
        cmd.args(&config.args)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, _) in std::env::vars_os() {
            if key.to_str().is_some_and(is_secret_env) {
                cmd.env_remove(&key);
            }
        }

        let mut child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;
        let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
            let _ = child.start_kill();
            return Err(spawn_error("child stdio was not piped".to_string()));
        };

        let client = RpcClient::connect(
            config.id.clone(),
            stdout,
            stdin,
            Some(child),
            self.shutdown_timeout,
        );
        if let Err(e) = client.initialize(root, self.handshake_timeout).await {
            client.dispose();
            return Err(e);
        }
        Ok(client)
    }
}

#[derive(Debug)]
enum RequestError {
    Timeout,
    Closed,
    Serialize(String),
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("request timed out"),
            Self::Closed => f.write_str("connection closed"),
            Self::Serialize(e) => write!(f, "serializing request: {e}"),
        }
    }
}

#[derive(Default)]
struct ExitState {
    reason: Option<ServerStopReason>,
    handler: Option<ExitHandler>,
}

/// State shared between the client and its reader task.
struct Connection {
    server: String,
    writer_tx: mpsc::Sender<Value>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    on_notification: Mutex<Option<NotificationHandler>>,
    exit: Mutex<ExitState>,
}

impl Connection {
    async fn dispatch(&self, message: Incoming) {
        match message {
            Incoming::Response { id, body } => {
                let sender = lock(&self.pending).remove(&id);
                if let Some(tx) = sender {
                    let _ = tx.send(body);
                }
            }
            Incoming::Request { id, method, params } => {
                tracing::debug!(server = %self.server, "Server request: {method}");
                let reply = protocol::reply_to_server_request(&id, &method, params.as_ref());
                let _ = self.writer_tx.send(reply).await;
            }
            Incoming::Notification { method, params } => {
                let handler = lock(&self.on_notification).clone();
                match handler {
                    Some(handler) => handler(&method, params),
                    None => {
                        tracing::trace!(server = %self.server, "Dropping notification {method}");
                    }
                }
            }
        }
    }

    fn mark_exited(&self, reason: ServerStopReason) {
        let handler = {
            let mut exit = lock(&self.exit);
            if exit.reason.is_some() {
                return;
            }
            exit.reason = Some(reason.clone());
            exit.handler.take()
        };
        // Dropping the senders fails every in-flight request.
        lock(&self.pending).clear();
        if let Some(handler) = handler {
            handler(reason);
        }
    }
}

/// Initialized JSON-RPC connection to one language server process.
pub struct RpcClient {
    conn: Arc<Connection>,
    child: Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    disposed: AtomicBool,
    shutdown_timeout: Duration,
}

impl RpcClient {
    /// Wire a client over an arbitrary byte stream pair.
    ///
    /// The reader task starts here, before any request can be sent, so the
    /// `initialize` response cannot be missed.
    pub fn connect<R, W>(
        server: String,
        reader: R,
        writer: W,
        child: Option<Child>,
        shutdown_timeout: Duration,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, mut writer_rx) = mpsc::channel::<Value>(WRITER_CHANNEL_CAPACITY);
        let conn = Arc::new(Connection {
            server,
            writer_tx,
            pending: Mutex::new(HashMap::new()),
            on_notification: Mutex::new(None),
            exit: Mutex::new(ExitState::default()),
        });

        let writer_server = conn.server.clone();
        let writer_task = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(frame) = writer_rx.recv().await {
                if let Err(e) = writer.write_frame(&frame).await {
                    tracing::warn!(server = %writer_server, "LSP write error: {e:#}");
                    break;
                }
            }
        });

        let reader_conn = Arc::clone(&conn);
        let reader_task = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            loop {
                match reader.next_message().await {
                    Ok(Some(message)) => reader_conn.dispatch(message).await,
                    Ok(None) => {
                        tracing::info!(server = %reader_conn.server, "Language server closed stdout");
                        reader_conn.mark_exited(ServerStopReason::Exited);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(server = %reader_conn.server, "LSP reader error: {e:#}");
                        reader_conn.mark_exited(ServerStopReason::Failed(format!("{e:#}")));
                        break;
                    }
                }
            }
        });

        Self {
            conn,
            child: Mutex::new(child),
            tasks: Mutex::new(vec![reader_task, writer_task]),
            next_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
            shutdown_timeout,
        }
    }

    #[must_use]
    pub fn server(&self) -> &str {
        &self.conn.server
    }

    /// Run the `initialize` / `initialized` exchange.
    pub async fn initialize(&self, root: &Path, timeout: Duration) -> Result<(), LspError> {
        let handshake_error = |reason: String| LspError::Handshake {
            server: self.conn.server.clone(),
            reason,
        };

        let root_uri = protocol::path_to_file_uri(root).map_err(|e| handshake_error(e.to_string()))?;
        let root_name = root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("workspace");
        let params = protocol::initialize_params(root_uri.as_str(), root_name);

        let response = match self.request("initialize", Some(params), timeout).await {
            Ok(response) => response,
            Err(RequestError::Timeout) => {
                return Err(LspError::HandshakeTimeout {
                    server: self.conn.server.clone(),
                    timeout,
                });
            }
            Err(e) => return Err(handshake_error(e.to_string())),
        };
        if let Some(error) = response.get("error") {
            return Err(handshake_error(
                error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            ));
        }

        self.notify("initialized", Some(json!({})))
            .await
            .map_err(|e| handshake_error(e.to_string()))
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(RequestError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_value(Request::new(id, method, params))
            .map_err(|e| RequestError::Serialize(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.conn.pending).insert(id, tx);
        // The reader clears `pending` on exit; a request registered after
        // that would otherwise wait out the full timeout.
        if lock(&self.conn.exit).reason.is_some() {
            lock(&self.conn.pending).remove(&id);
            return Err(RequestError::Closed);
        }
        if self.conn.writer_tx.send(frame).await.is_err() {
            lock(&self.conn.pending).remove(&id);
            return Err(RequestError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RequestError::Closed),
            Err(_) => {
                lock(&self.conn.pending).remove(&id);
                Err(RequestError::Timeout)
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RequestError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(RequestError::Closed);
        }
        let frame = serde_json::to_value(Notification::new(method, params))
            .map_err(|e| RequestError::Serialize(e.to_string()))?;
        self.conn
            .writer_tx
            .send(frame)
            .await
            .map_err(|_| RequestError::Closed)
    }
}

impl ClientHandle for RpcClient {
    async fn send_notification(&self, method: &str, params: Value) -> Result<(), LspError> {
        self.notify(method, Some(params))
            .await
            .map_err(|e| LspError::Transport {
                server: self.conn.server.clone(),
                reason: e.to_string(),
            })
    }

    fn on_notification(&self, handler: NotificationHandler) {
        *lock(&self.conn.on_notification) = Some(handler);
    }

    fn on_exit(&self, handler: ExitHandler) {
        let already = {
            let mut exit = lock(&self.conn.exit);
            match &exit.reason {
                Some(reason) => Some(reason.clone()),
                None => {
                    exit.handler = Some(Arc::clone(&handler));
                    None
                }
            }
        };
        if let Some(reason) = already {
            handler(reason);
        }
    }

    async fn shutdown(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        match self.request("shutdown", None, self.shutdown_timeout).await {
            Ok(response) if response.get("error").is_none() => {
                let _ = self.notify("exit", None).await;
            }
            Ok(_) => tracing::debug!(server = %self.conn.server, "shutdown request rejected"),
            Err(e) => tracing::debug!(server = %self.conn.server, "shutdown request failed: {e}"),
        }

        let child = lock(&self.child).take();
        if let Some(mut child) = child
            && tokio::time::timeout(self.shutdown_timeout, child.wait())
                .await
                .is_err()
        {
            tracing::debug!(server = %self.conn.server, "Language server didn't exit in time, killing");
            let _ = child.kill().await;
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        lock(&self.conn.pending).clear();
        *lock(&self.conn.on_notification) = None;
        if let Some(child) = lock(&self.child).as_mut() {
            let _ = child.start_kill();
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type ServerReader = FrameReader<ReadHalf<DuplexStream>>;
    type ServerWriter = FrameWriter<WriteHalf<DuplexStream>>;

    /// Client over an in-memory pipe; returns the server's ends.
    fn pipe_client() -> (RpcClient, ServerReader, ServerWriter) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let client = RpcClient::connect(
            "fake".to_string(),
            client_read,
            client_write,
            None,
            Duration::from_millis(200),
        );
        (
            client,
            FrameReader::new(server_read),
            FrameWriter::new(server_write),
        )
    }

    fn test_root() -> PathBuf {
        #[cfg(windows)]
        return PathBuf::from(r"C:\work\proj");
        #[cfg(not(windows))]
        PathBuf::from("/work/proj")
    }

    /// Answer `initialize` with `reply`, then return the next frame.
    async fn serve_handshake(
        reader: &mut ServerReader,
        writer: &mut ServerWriter,
        reply: Value,
    ) -> Value {
        let request = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(request["method"], "initialize");
        let mut response = reply;
        response["id"] = request["id"].clone();
        writer.write_frame(&response).await.unwrap();
        request
    }

    #[tokio::test]
    async fn test_handshake_sends_initialize_then_initialized() {
        let (client, mut reader, mut writer) = pipe_client();
        let server = tokio::spawn(async move {
            let request = serve_handshake(
                &mut reader,
                &mut writer,
                json!({"jsonrpc": "2.0", "result": {"capabilities": {}}}),
            )
            .await;
            let initialized = reader.read_frame().await.unwrap().unwrap();
            (request, initialized)
        });

        client
            .initialize(&test_root(), Duration::from_secs(5))
            .await
            .unwrap();
        let (request, initialized) = server.await.unwrap();
        assert!(request["params"]["rootUri"].as_str().unwrap().starts_with("file:///"));
        assert_eq!(request["params"]["workspaceFolders"][0]["name"], "proj");
        assert!(request["params"]["processId"].is_number());
        assert_eq!(initialized["method"], "initialized");
    }

    #[tokio::test]
    async fn test_handshake_error_response_is_handshake_failure() {
        let (client, mut reader, mut writer) = pipe_client();
        tokio::spawn(async move {
            serve_handshake(
                &mut reader,
                &mut writer,
                json!({"jsonrpc": "2.0", "error": {"code": -32603, "message": "boom"}}),
            )
            .await;
            // Keep the pipe open until the client gives up.
            let _ = reader.read_frame().await;
        });

        let err = client
            .initialize(&test_root(), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            LspError::Handshake { reason, .. } => assert_eq!(reason, "boom"),
            other => panic!("expected Handshake, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hung_handshake_times_out() {
        let (client, mut reader, _writer) = pipe_client();
        tokio::spawn(async move {
            // Read the request, never answer.
            let _ = reader.read_frame().await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let err = client
            .initialize(&test_root(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::HandshakeTimeout { .. }), "{err:?}");
        assert!(lock(&client.conn.pending).is_empty());
    }

    #[tokio::test]
    async fn test_server_hangup_during_handshake_fails_fast() {
        let (client, reader, writer) = pipe_client();
        drop(reader);
        drop(writer);
        let err = client
            .initialize(&test_root(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::Handshake { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_notifications_reach_handler() {
        let (client, _reader, mut writer) = pipe_client();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on_notification(Arc::new(move |method: &str, params: Option<Value>| {
            let _ = tx.send((method.to_string(), params));
        }));

        writer
            .write_frame(&json!({
                "jsonrpc": "2.0",
                "method": "textDocument/publishDiagnostics",
                "params": {"uri": "file:///a.rs", "diagnostics": []}
            }))
            .await
            .unwrap();

        let (method, params) = rx.recv().await.unwrap();
        assert_eq!(method, "textDocument/publishDiagnostics");
        assert_eq!(params.unwrap()["uri"], "file:///a.rs");
    }

    #[tokio::test]
    async fn test_server_requests_are_answered() {
        let (_client, mut reader, mut writer) = pipe_client();
        writer
            .write_frame(&json!({
                "jsonrpc": "2.0",
                "id": 9,
                "method": "workspace/configuration",
                "params": {"items": [{}]}
            }))
            .await
            .unwrap();

        let reply = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["result"], json!([null]));
    }

    #[tokio::test]
    async fn test_exit_handler_fires_on_eof_and_late_registration() {
        let (client, reader, writer) = pipe_client();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on_exit(Arc::new(move |reason| {
            let _ = tx.send(reason);
        }));
        drop(writer);
        drop(reader);
        assert_eq!(rx.recv().await, Some(ServerStopReason::Exited));

        // Registering after the fact still observes the exit.
        let (late_tx, mut late_rx) = mpsc::unbounded_channel();
        client.on_exit(Arc::new(move |reason| {
            let _ = late_tx.send(reason);
        }));
        assert_eq!(late_rx.recv().await, Some(ServerStopReason::Exited));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_closes_sends() {
        let (client, _reader, _writer) = pipe_client();
        client.dispose();
        client.dispose();
        let err = client
            .send_notification("textDocument/didClose", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::Transport { .. }));
        // Shutdown after dispose is a no-op rather than an error.
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_sends_shutdown_then_exit() {
        let (client, mut reader, mut writer) = pipe_client();
        let server = tokio::spawn(async move {
            let request = reader.read_frame().await.unwrap().unwrap();
            assert_eq!(request["method"], "shutdown");
            writer
                .write_frame(&json!({"jsonrpc": "2.0", "id": request["id"], "result": null}))
                .await
                .unwrap();
            reader.read_frame().await.unwrap().unwrap()
        });

        client.shutdown().await;
        let exit = server.await.unwrap();
        assert_eq!(exit["method"], "exit");
    }

    #[tokio::test]
    async fn test_spawn_missing_executable_is_spawn_error() {
        let config = LanguageServerConfig::new(
            "ghost",
            "anvil-definitely-not-a-real-language-server",
            vec![],
            vec![],
        );
        let dir = tempfile::tempdir().unwrap();
        let err = StdioSpawner::default()
            .spawn(&config, dir.path())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LspError::Spawn { .. }), "{err:?}");
        assert!(!err.is_retryable());
    }

    #[test]
    fn env_glob_patterns() {
        assert!(env_glob_matches("*_KEY", "API_KEY"));
        assert!(!env_glob_matches("*_KEY", "KEYRING"));
        assert!(env_glob_matches("AWS_*", "AWS_SESSION_TOKEN"));
        assert!(!env_glob_matches("AWS_*", "MY_AWS"));
        assert!(env_glob_matches("*_CREDENTIAL*", "DB_CREDENTIALS"));
        assert!(!env_glob_matches("*_CREDENTIAL*", "CREDENTIAL"));
        assert!(env_glob_matches("HOME", "HOME"));
    }

    #[test]
    fn secret_env_detection_is_case_insensitive() {
        assert!(is_secret_env("openai_api_key"));
        assert!(is_secret_env("GITHUB_TOKEN"));
        assert!(!is_secret_env("PATH"));
        assert!(!is_secret_env("CARGO_HOME"));
    }
}
