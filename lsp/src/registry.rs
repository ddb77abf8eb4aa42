//! Client registry: one entry per configured server, started lazily.
//!
//! File events are routed to every server whose selector matches the file.
//! A server is spawned on the first event that needs it; concurrent callers
//! share the single in-flight start. Each entry moves through
//! NotStarted → Starting → Started, falls back to NotStarted when a start
//! fails or the process exits, and is marked unusable for the rest of the
//! session when its executable cannot be spawned at all.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared, join_all};
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;

use crate::diagnostics::{DiagnosticsListener, DiagnosticsStore, DiagnosticsSubscription};
use crate::error::LspError;
use crate::language::detect_language;
use crate::project::detect_project_languages;
use crate::protocol::{self, canonical_uri, path_to_file_uri};
use crate::rpc::{ClientHandle, DEFAULT_HANDSHAKE_TIMEOUT, ServerStopReason, Spawner};
use crate::selector::{SelectorMatcher, selector_languages};
use crate::types::{FileDiagnostics, LanguageServerConfig};
use crate::watch::{FileEvent, WatchFilter};

const DID_OPEN: &str = "textDocument/didOpen";
const DID_CHANGE: &str = "textDocument/didChange";
const DID_CLOSE: &str = "textDocument/didClose";
const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";

pub type CommandExists = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type DetectLanguages = Arc<dyn Fn(&Path) -> BTreeSet<String> + Send + Sync>;

type StartFuture<H> = Shared<BoxFuture<'static, Result<Arc<H>, LspError>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether `command` resolves to an executable on `PATH`.
#[must_use]
pub fn command_on_path(command: &str) -> bool {
    which::which(command).is_ok()
}

/// Collaborators and limits for a [`ClientRegistry`].
#[derive(Clone)]
pub struct RegistryOptions {
    /// Upper bound on spawn + `initialize`; a hung start returns to NotStarted.
    pub handshake_timeout: Duration,
    /// Used by prewarm to skip servers whose executable is absent.
    pub command_exists: CommandExists,
    pub detect_languages: DetectLanguages,
    pub watch_filter: Option<Arc<dyn WatchFilter>>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            command_exists: Arc::new(command_on_path),
            detect_languages: Arc::new(detect_project_languages),
            watch_filter: None,
        }
    }
}

impl std::fmt::Debug for RegistryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryOptions")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("watch_filter", &self.watch_filter.is_some())
            .finish_non_exhaustive()
    }
}

enum EntryState<H> {
    NotStarted,
    Starting(StartFuture<H>),
    Started(Arc<H>),
}

struct Slot<H> {
    state: EntryState<H>,
    /// Bumped on every start attempt and on shutdown; late completions and
    /// exit notifications from an older generation are ignored.
    generation: u64,
    unusable: bool,
}

struct ClientEntry<H> {
    config: LanguageServerConfig,
    matcher: SelectorMatcher,
    slot: Mutex<Slot<H>>,
    /// URIs this server has been sent `didOpen` for since it started.
    opened: Mutex<HashSet<String>>,
}

impl<H: ClientHandle> ClientEntry<H> {
    fn new(config: LanguageServerConfig) -> Self {
        Self {
            matcher: SelectorMatcher::new(&config.selector),
            config,
            slot: Mutex::new(Slot {
                state: EntryState::NotStarted,
                generation: 0,
                unusable: false,
            }),
            opened: Mutex::new(HashSet::new()),
        }
    }

    fn id(&self) -> &str {
        &self.config.id
    }

    fn started_handle(&self) -> Option<Arc<H>> {
        match &lock(&self.slot).state {
            EntryState::Started(handle) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    fn is_idle(&self) -> bool {
        let slot = lock(&self.slot);
        !slot.unusable && matches!(slot.state, EntryState::NotStarted)
    }

    /// Returns `true` if `uri` was not yet open on this server.
    fn mark_opened(&self, uri: &str) -> bool {
        lock(&self.opened).insert(uri.to_string())
    }

    /// Returns `true` if `uri` was open on this server.
    fn mark_closed(&self, uri: &str) -> bool {
        lock(&self.opened).remove(uri)
    }

    fn handle_exit(&self, generation: u64, reason: &ServerStopReason) {
        let handle = {
            let mut slot = lock(&self.slot);
            if slot.generation != generation {
                return;
            }
            match std::mem::replace(&mut slot.state, EntryState::NotStarted) {
                EntryState::Started(handle) => handle,
                other => {
                    slot.state = other;
                    return;
                }
            }
        };
        lock(&self.opened).clear();
        match reason {
            ServerStopReason::Exited => {
                tracing::info!(server = %self.id(), "Language server exited");
            }
            ServerStopReason::Failed(msg) => {
                tracing::warn!(server = %self.id(), error = %msg, "Language server failed");
            }
        }
        handle.dispose();
    }
}

struct Inner<S: Spawner> {
    spawner: S,
    root: PathBuf,
    options: RegistryOptions,
    entries: Vec<Arc<ClientEntry<S::Handle>>>,
    store: DiagnosticsStore,
    /// Last version sent per canonical URI; absent means not open.
    versions: Mutex<HashMap<String, i32>>,
    doc_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: Spawner> Inner<S> {
    fn entry(&self, id: &str) -> Option<&Arc<ClientEntry<S::Handle>>> {
        self.entries.iter().find(|entry| entry.id() == id)
    }

    fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_relative() {
            self.root.join(file)
        } else {
            file.to_path_buf()
        }
    }

    fn uri_for(path: &Path) -> Result<String, LspError> {
        path_to_file_uri(path)
            .map(|uri| uri.to_string())
            .map_err(|e| LspError::Read {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    async fn lock_document(&self, uri: &str) -> OwnedMutexGuard<()> {
        let doc_lock = Arc::clone(lock(&self.doc_locks).entry(uri.to_string()).or_default());
        doc_lock.lock_owned().await
    }

    fn release_document(&self, uri: &str) {
        let mut locks = lock(&self.doc_locks);
        if locks.get(uri).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(uri);
        }
    }

    async fn start_entry(
        self: &Arc<Self>,
        entry: &Arc<ClientEntry<S::Handle>>,
    ) -> Result<Arc<S::Handle>, LspError> {
        let future = {
            let mut guard = lock(&entry.slot);
            let slot = &mut *guard;
            if slot.unusable {
                return Err(LspError::Unusable(entry.id().to_string()));
            }
            match &slot.state {
                EntryState::Started(handle) => return Ok(Arc::clone(handle)),
                EntryState::Starting(future) => future.clone(),
                EntryState::NotStarted => {
                    slot.generation += 1;
                    let future = Arc::clone(self)
                        .run_start(Arc::clone(entry), slot.generation)
                        .boxed()
                        .shared();
                    slot.state = EntryState::Starting(future.clone());
                    // Drive the start to completion even if every awaiter
                    // is cancelled.
                    tokio::spawn(future.clone());
                    future
                }
            }
        };
        future.await
    }

    async fn run_start(
        self: Arc<Self>,
        entry: Arc<ClientEntry<S::Handle>>,
        generation: u64,
    ) -> Result<Arc<S::Handle>, LspError> {
        let id = entry.id().to_string();
        tracing::info!(server = %id, "Starting language server ({})", entry.config.command);

        let timeout = self.options.handshake_timeout;
        let spawned =
            match tokio::time::timeout(timeout, self.spawner.spawn(&entry.config, &self.root))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(LspError::HandshakeTimeout {
                    server: id.clone(),
                    timeout,
                }),
            };

        let handle = match spawned {
            Ok(handle) => Arc::new(handle),
            Err(err) => {
                {
                    let mut slot = lock(&entry.slot);
                    if slot.generation == generation {
                        slot.state = EntryState::NotStarted;
                        slot.unusable = !err.is_retryable();
                    }
                }
                tracing::warn!(server = %id, "Failed to start language server: {err}");
                return Err(err);
            }
        };

        {
            let mut slot = lock(&entry.slot);
            if slot.generation != generation {
                drop(slot);
                tracing::debug!(server = %id, "Registry shut down during startup, discarding server");
                handle.dispose();
                return Err(LspError::Transport {
                    server: id,
                    reason: "registry shut down during startup".to_string(),
                });
            }
            // Clear while still holding the slot: once Started is visible,
            // routed callers start recording opened URIs.
            lock(&entry.opened).clear();
            slot.state = EntryState::Started(Arc::clone(&handle));
        }

        // Handlers go on after Started so an immediate exit callback sees it.
        let store_owner = Arc::downgrade(&self);
        let client_id = id.clone();
        handle.on_notification(Arc::new(move |method: &str, params: Option<Value>| {
            if method != PUBLISH_DIAGNOSTICS {
                tracing::trace!(server = %client_id, "Ignoring notification {method}");
                return;
            }
            if let Some(inner) = store_owner.upgrade() {
                inner.on_publish(&client_id, params);
            }
        }));
        let weak_entry: Weak<ClientEntry<S::Handle>> = Arc::downgrade(&entry);
        handle.on_exit(Arc::new(move |reason: ServerStopReason| {
            if let Some(entry) = weak_entry.upgrade() {
                entry.handle_exit(generation, &reason);
            }
        }));

        tracing::info!(server = %id, "Language server started");
        Ok(handle)
    }

    fn on_publish(&self, client_id: &str, params: Option<Value>) {
        let Some(publish) = protocol::parse_publish_diagnostics(params) else {
            tracing::debug!(server = %client_id, "Ignoring malformed publishDiagnostics");
            return;
        };
        let uri = canonical_uri(&publish.uri);
        let version = publish
            .version
            .or_else(|| lock(&self.versions).get(&uri).copied());
        tracing::debug!(
            server = %client_id,
            uri = %uri,
            count = publish.diagnostics.len(),
            "Diagnostics updated"
        );
        self.store
            .upsert(&uri, client_id, publish.diagnostics, version);
    }

    /// Deliver to every entry whose selector matches `file`, concurrently.
    /// With `start` unset only already-running servers are considered.
    /// Returns how many servers accepted the notification.
    async fn route<F, Fut>(self: &Arc<Self>, file: &Path, start: bool, sender: F) -> usize
    where
        F: Fn(Arc<ClientEntry<S::Handle>>, Arc<S::Handle>) -> Fut,
        Fut: Future<Output = Result<(), LspError>>,
    {
        let matching: Vec<Arc<ClientEntry<S::Handle>>> = self
            .entries
            .iter()
            .filter(|entry| entry.matcher.matches(file, &self.root))
            .cloned()
            .collect();
        if matching.is_empty() {
            tracing::trace!(path = %file.display(), "No language server for file");
            return 0;
        }

        let sender = &sender;
        let deliveries = matching.into_iter().map(|entry| async move {
            let handle = if start {
                match self.start_entry(&entry).await {
                    Ok(handle) => handle,
                    Err(e) => {
                        tracing::debug!(server = %entry.id(), path = %file.display(), "Not routing: {e}");
                        return false;
                    }
                }
            } else {
                match entry.started_handle() {
                    Some(handle) => handle,
                    None => return false,
                }
            };
            let id = entry.config.id.clone();
            match sender(entry, handle).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(server = %id, path = %file.display(), "Failed to notify language server: {e}");
                    false
                }
            }
        });
        join_all(deliveries).await.into_iter().filter(|ok| *ok).count()
    }
}

async fn read_text(path: &Path) -> Result<String, LspError> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        let err = LspError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        tracing::warn!(path = %path.display(), "Skipping LSP notification: {err}");
        err
    })
}

/// Routes document events to lazily started language servers and collects
/// their diagnostics.
pub struct ClientRegistry<S: Spawner> {
    inner: Arc<Inner<S>>,
}

impl<S: Spawner> Clone for ClientRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Spawner> ClientRegistry<S> {
    /// Nothing is spawned here; servers start on the first matching event or
    /// on prewarm. Duplicate ids keep the first configuration.
    pub fn new(
        root: impl Into<PathBuf>,
        configs: Vec<LanguageServerConfig>,
        spawner: S,
        options: RegistryOptions,
    ) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);

        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(configs.len());
        for config in configs {
            if !seen.insert(config.id.clone()) {
                tracing::warn!(server = %config.id, "Duplicate language server id, keeping the first");
                continue;
            }
            entries.push(Arc::new(ClientEntry::new(config)));
        }

        Self {
            inner: Arc::new(Inner {
                spawner,
                root,
                options,
                entries,
                store: DiagnosticsStore::new(),
                versions: Mutex::new(HashMap::new()),
                doc_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Start (or join the in-flight start of) the server with `id`.
    pub async fn start_client(&self, id: &str) -> Result<Arc<S::Handle>, LspError> {
        let entry = self
            .inner
            .entry(id)
            .ok_or_else(|| LspError::UnknownClient(id.to_string()))?;
        self.inner.start_entry(entry).await
    }

    /// Lazily start every server whose selector matches `file` and hand each
    /// handle to `sender`. One server failing does not affect the others.
    pub async fn route_to_clients<F, Fut>(&self, file: &Path, sender: F) -> usize
    where
        F: Fn(Arc<S::Handle>) -> Fut,
        Fut: Future<Output = Result<(), LspError>>,
    {
        let file = self.inner.resolve(file);
        self.inner
            .route(&file, true, |_, handle| sender(handle))
            .await
    }

    /// Send `didOpen` (version 1) to every matching server.
    pub async fn handle_open(&self, file: &Path) -> Result<usize, LspError> {
        let path = self.inner.resolve(file);
        let uri = Inner::<S>::uri_for(&path)?;
        let guard = self.inner.lock_document(&uri).await;

        let text = match read_text(&path).await {
            Ok(text) => text,
            Err(e) => {
                drop(guard);
                self.inner.release_document(&uri);
                return Err(e);
            }
        };
        lock(&self.inner.versions).insert(uri.clone(), 1);
        let language = detect_language(&path);

        let (uri, text) = (uri.as_str(), text.as_str());
        let delivered = self
            .inner
            .route(&path, true, |entry, handle| async move {
                entry.mark_opened(uri);
                let params = protocol::did_open_params(uri, language, 1, text);
                let result = handle.send_notification(DID_OPEN, params).await;
                if result.is_err() {
                    entry.mark_closed(uri);
                }
                result
            })
            .await;
        tracing::debug!(path = %path.display(), servers = delivered, "didOpen routed");
        Ok(delivered)
    }

    /// Bump the version and send the full text. Servers that have not seen
    /// the document yet (including all of them, if it was never opened) get
    /// `didOpen` instead.
    pub async fn handle_change(&self, file: &Path) -> Result<usize, LspError> {
        let path = self.inner.resolve(file);
        let uri = Inner::<S>::uri_for(&path)?;
        let guard = self.inner.lock_document(&uri).await;

        let text = match read_text(&path).await {
            Ok(text) => text,
            Err(e) => {
                drop(guard);
                self.inner.release_document(&uri);
                return Err(e);
            }
        };
        let version = {
            let mut versions = lock(&self.inner.versions);
            let next = versions.get(&uri).map_or(1, |v| v + 1);
            versions.insert(uri.clone(), next);
            next
        };
        let language = detect_language(&path);

        let (uri, text) = (uri.as_str(), text.as_str());
        let delivered = self
            .inner
            .route(&path, true, |entry, handle| async move {
                if entry.mark_opened(uri) {
                    let params = protocol::did_open_params(uri, language, version, text);
                    let result = handle.send_notification(DID_OPEN, params).await;
                    if result.is_err() {
                        entry.mark_closed(uri);
                    }
                    result
                } else {
                    let params = protocol::did_change_params(uri, version, text);
                    handle.send_notification(DID_CHANGE, params).await
                }
            })
            .await;
        tracing::debug!(path = %path.display(), version, servers = delivered, "didChange routed");
        Ok(delivered)
    }

    /// Forget the version and send `didClose` to running servers that had
    /// the document open. Diagnostics are kept.
    pub async fn handle_close(&self, file: &Path) -> Result<usize, LspError> {
        let path = self.inner.resolve(file);
        let uri = Inner::<S>::uri_for(&path)?;
        let delivered = {
            let _guard = self.inner.lock_document(&uri).await;
            lock(&self.inner.versions).remove(&uri);

            let uri = uri.as_str();
            self.inner
                .route(&path, false, |entry, handle| async move {
                    if !entry.mark_closed(uri) {
                        return Ok(());
                    }
                    handle
                        .send_notification(DID_CLOSE, protocol::did_close_params(uri))
                        .await
                })
                .await
        };
        self.inner.release_document(&uri);
        Ok(delivered)
    }

    /// Dispatch an external watcher event, unless the watch filter rejects
    /// its path.
    pub async fn handle_event(&self, event: FileEvent) -> Result<usize, LspError> {
        if let Some(filter) = &self.inner.options.watch_filter
            && !filter.should_watch(event.path())
        {
            tracing::trace!(path = %event.path().display(), "Ignored by watch filter");
            return Ok(0);
        }
        match event {
            FileEvent::Opened(path) => self.handle_open(&path).await,
            FileEvent::Changed(path) => self.handle_change(&path).await,
            FileEvent::Closed(path) => self.handle_close(&path).await,
        }
    }

    /// Start servers the project layout suggests will be needed.
    ///
    /// Candidates are idle entries whose selector languages intersect the
    /// detected project languages and whose command exists. A dry run only
    /// reports them. Start failures are logged and tolerated.
    pub async fn prewarm_heuristics(&self, dry_run: bool) -> Vec<String> {
        let detected = (self.inner.options.detect_languages)(&self.inner.root);
        if detected.is_empty() {
            return Vec::new();
        }

        let candidates: Vec<&Arc<ClientEntry<S::Handle>>> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.is_idle())
            .filter(|entry| !selector_languages(&entry.config.selector).is_disjoint(&detected))
            .filter(|entry| (self.inner.options.command_exists)(&entry.config.command))
            .collect();
        let ids: Vec<String> = candidates.iter().map(|e| e.id().to_string()).collect();

        if dry_run {
            tracing::info!("Prewarm candidates: {}", ids.join(", "));
            return ids;
        }

        let results = join_all(candidates.iter().map(|entry| self.inner.start_entry(entry))).await;
        for (entry, result) in candidates.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(server = %entry.id(), "Prewarm failed: {e}");
            }
        }
        ids
    }

    /// Shut down and dispose every running server. Never fails; in-flight
    /// starts are discarded when they complete.
    pub async fn shutdown_all(&self) {
        let handles: Vec<(String, Arc<S::Handle>)> = self
            .inner
            .entries
            .iter()
            .filter_map(|entry| {
                let state = {
                    let mut slot = lock(&entry.slot);
                    slot.generation += 1;
                    std::mem::replace(&mut slot.state, EntryState::NotStarted)
                };
                lock(&entry.opened).clear();
                match state {
                    EntryState::Started(handle) => Some((entry.id().to_string(), handle)),
                    _ => None,
                }
            })
            .collect();

        join_all(handles.iter().map(|(id, handle)| async move {
            handle.shutdown().await;
            handle.dispose();
            tracing::info!(server = %id, "Language server stopped");
        }))
        .await;
    }

    /// Diagnostics for a `file://` URI or a path (relative paths resolve
    /// against the root).
    #[must_use]
    pub fn get_diagnostics(&self, path_or_uri: &str) -> Option<FileDiagnostics> {
        let uri = if path_or_uri.starts_with("file:") {
            canonical_uri(path_or_uri)
        } else if path_or_uri.contains("://") {
            path_or_uri.to_string()
        } else {
            let path = self.inner.resolve(Path::new(path_or_uri));
            path_to_file_uri(&path).ok()?.to_string()
        };
        self.inner.store.get(&uri)
    }

    pub fn on_diagnostics(&self, listener: DiagnosticsListener) -> DiagnosticsSubscription {
        self.inner.store.subscribe(listener)
    }

    #[must_use]
    pub fn diagnostics(&self) -> &DiagnosticsStore {
        &self.inner.store
    }

    #[must_use]
    pub fn started_client_ids(&self) -> Vec<String> {
        self.inner
            .entries
            .iter()
            .filter(|entry| entry.started_handle().is_some())
            .map(|entry| entry.id().to_string())
            .collect()
    }

    #[must_use]
    pub fn configured_client_ids(&self) -> Vec<String> {
        self.inner
            .entries
            .iter()
            .map(|entry| entry.id().to_string())
            .collect()
    }

    #[must_use]
    pub fn document_version(&self, file: &Path) -> Option<i32> {
        let path = self.inner.resolve(file);
        let uri = Inner::<S>::uri_for(&path).ok()?;
        lock(&self.inner.versions).get(&uri).copied()
    }
}
