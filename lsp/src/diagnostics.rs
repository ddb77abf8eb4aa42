//! Diagnostics store: per-URI, per-client diagnostics with change listeners.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::types::{Diagnostic, FileDiagnostics};

/// Emitted after every mutation. `file` is `None` once the URI has no
/// remaining client slices.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticsEvent {
    pub uri: String,
    pub file: Option<FileDiagnostics>,
}

pub type DiagnosticsListener = Arc<dyn Fn(&DiagnosticsEvent) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, DiagnosticsListener)>>,
}

impl Listeners {
    fn emit(&self, event: &DiagnosticsEvent) {
        // Snapshot so a listener may subscribe/unsubscribe re-entrantly.
        let listeners: Vec<DiagnosticsListener> = lock(&self.entries)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::error!(uri = %event.uri, "Diagnostics listener panicked");
            }
        }
    }
}

/// Handle returned by [`DiagnosticsStore::subscribe`].
///
/// Dropping it leaves the listener registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct DiagnosticsSubscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl DiagnosticsSubscription {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners.entries).retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for DiagnosticsSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticsSubscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct DiagnosticsStore {
    files: Mutex<HashMap<String, FileDiagnostics>>,
    listeners: Arc<Listeners>,
}

impl DiagnosticsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `client_id`'s diagnostics for `uri`.
    ///
    /// An empty list still creates the slice: "this client found nothing" is
    /// distinct from "this client never reported".
    pub fn upsert(
        &self,
        uri: &str,
        client_id: &str,
        diagnostics: Vec<Diagnostic>,
        version: Option<i32>,
    ) {
        let snapshot = {
            let mut files = lock(&self.files);
            let file = files
                .entry(uri.to_string())
                .or_insert_with(|| FileDiagnostics::new(uri.to_string()));
            file.set_client(client_id, diagnostics);
            if let Some(version) = version {
                file.set_version(version);
            }
            file.clone()
        };
        self.listeners.emit(&DiagnosticsEvent {
            uri: uri.to_string(),
            file: Some(snapshot),
        });
    }

    /// Drop one client's slice, or every slice when `client_id` is `None`.
    /// Clearing an unknown URI is a silent no-op.
    pub fn clear(&self, uri: &str, client_id: Option<&str>) {
        let file = {
            let mut files = lock(&self.files);
            let Some(file) = files.get_mut(uri) else {
                return;
            };
            if let Some(id) = client_id {
                if !file.has_client(id) {
                    return;
                }
                file.remove_client(id);
            }
            if client_id.is_none() || file.is_empty() {
                files.remove(uri);
                None
            } else {
                Some(file.clone())
            }
        };
        self.listeners.emit(&DiagnosticsEvent {
            uri: uri.to_string(),
            file,
        });
    }

    #[must_use]
    pub fn get(&self, uri: &str) -> Option<FileDiagnostics> {
        lock(&self.files).get(uri).cloned()
    }

    /// Every URI with at least one client slice, sorted.
    #[must_use]
    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = lock(&self.files).keys().cloned().collect();
        uris.sort();
        uris
    }

    /// All files, those with errors first, then by URI.
    #[must_use]
    pub fn snapshot(&self) -> Vec<FileDiagnostics> {
        let mut files: Vec<FileDiagnostics> = lock(&self.files).values().cloned().collect();
        files.sort_by(|a, b| {
            let a_errors = a.error_count() > 0;
            let b_errors = b.error_count() > 0;
            b_errors.cmp(&a_errors).then_with(|| a.uri().cmp(b.uri()))
        });
        files
    }

    pub fn subscribe(&self, listener: DiagnosticsListener) -> DiagnosticsSubscription {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners.entries).push((id, listener));
        DiagnosticsSubscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }
}
