//! Error taxonomy for the multiplexer.
//!
//! Every variant is scoped to a single client or a single file. None of them
//! is fatal to the host: the registry logs, degrades that client to
//! "diagnostics unavailable", and keeps routing to the rest.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LspError {
    /// The executable is missing or could not be started.
    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    /// The server answered `initialize` with an error or hung up mid-handshake.
    #[error("initialize handshake with '{server}' failed: {reason}")]
    Handshake { server: String, reason: String },

    #[error("initialize handshake with '{server}' timed out after {}s", timeout.as_secs())]
    HandshakeTimeout { server: String, timeout: Duration },

    /// The file vanished (or was unreadable) between the event and the read.
    #[error("cannot read {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },

    /// The JSON-RPC channel to the server is gone.
    #[error("transport to '{server}' failed: {reason}")]
    Transport { server: String, reason: String },

    /// A previous spawn failure marked this client unusable for the session.
    #[error("language server '{0}' is unusable for this session")]
    Unusable(String),

    #[error("no language server configured with id '{0}'")]
    UnknownClient(String),
}

impl LspError {
    /// Whether retrying later can reasonably succeed.
    ///
    /// Spawn failures mean the binary is missing; respawning on every file
    /// event would only hot-loop.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Spawn { .. } | Self::Unusable(_))
    }
}
