//! Language-server multiplexer: routes document events to lazily started
//! LSP servers and aggregates the diagnostics they publish.

pub mod codec;
pub mod diagnostics;
pub mod language;
pub mod project;
pub mod registry;
pub mod rpc;
pub mod selector;
pub mod types;
pub mod watch;

mod error;
pub(crate) mod protocol;

pub use diagnostics::{DiagnosticsEvent, DiagnosticsListener, DiagnosticsStore, DiagnosticsSubscription};
pub use error::LspError;
pub use language::detect_language;
pub use project::detect_project_languages;
pub use protocol::{
    PathToUriError, PublishDiagnostics, canonical_uri, file_uri_to_path, path_to_file_uri,
};
pub use registry::{ClientRegistry, RegistryOptions, command_on_path};
pub use rpc::{ClientHandle, RpcClient, ServerStopReason, Spawner, StdioSpawner};
pub use selector::{SelectorMatcher, glob_to_regex, matches_selector};
pub use types::{
    Diagnostic, DiagnosticCode, DiagnosticSeverity, DocumentFilter, DocumentSelector,
    FileDiagnostics, LanguageServerConfig, Position, Range,
};
pub use watch::{FileEvent, IgnoreFilter, WatchFilter};
