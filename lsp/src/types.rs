//! Public types shared between the registry, the store and their consumers.
//!
//! Consumers build [`LanguageServerConfig`]s, hand them to the registry, and
//! read back [`FileDiagnostics`] views.

use serde::{Deserialize, Serialize};

/// Configuration for a single language server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageServerConfig {
    /// Stable client id (e.g. "typescript", "eslint").
    pub id: String,
    /// Human-readable name for logs and listings.
    #[serde(default)]
    pub display_name: String,
    /// Executable command (e.g. "rust-analyzer").
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Which documents this server receives.
    pub selector: DocumentSelector,
}

impl LanguageServerConfig {
    pub fn new(
        id: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        selector: DocumentSelector,
    ) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            command: command.into(),
            args,
            selector,
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Display name, falling back to the id when none was configured.
    #[must_use]
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }
}

/// Ordered list of filters; a document matches if any filter does.
pub type DocumentSelector = Vec<DocumentFilter>;

/// One entry of a [`DocumentSelector`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentFilter {
    /// Bare language id, e.g. `"rust"`.
    Language(String),
    Filter {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        /// Root-relative glob (`*`, `**`, `?`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scheme: Option<String>,
    },
}

impl DocumentFilter {
    pub fn language(id: impl Into<String>) -> Self {
        Self::Language(id.into())
    }

    /// Filter on language and root-relative glob.
    pub fn pattern(language: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Filter {
            language: Some(language.into()),
            pattern: Some(pattern.into()),
            scheme: None,
        }
    }

    /// The language id this filter names, if any.
    #[must_use]
    pub fn language_id(&self) -> Option<&str> {
        match self {
            Self::Language(id) => Some(id),
            Self::Filter { language, .. } => language.as_deref(),
        }
    }
}

/// Severity level for a diagnostic, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

impl Serialize for DiagnosticSeverity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for DiagnosticSeverity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u64::deserialize(deserializer)?;
        Self::from_lsp(value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid severity {value}")))
    }
}

/// Diagnostic code; servers send either an integer or a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DiagnosticCode {
    Number(i64),
    Text(String),
}

/// Zero-based line/character position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// A single issue reported by a language server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    pub range: Range,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<DiagnosticSeverity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<DiagnosticCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>, range: Range) -> Self {
        Self {
            message: message.into(),
            range,
            severity: None,
            code: None,
            source: None,
        }
    }

    #[must_use]
    pub fn with_severity(mut self, severity: DiagnosticSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Format as `path:line:col: severity: [source] message` (1-indexed).
    #[must_use]
    pub fn display_with_path(&self, path: &std::path::Path) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            path.display(),
            self.range.start.line + 1,
            self.range.start.character + 1,
            self.severity.map_or("warning", DiagnosticSeverity::label),
            self.source.as_deref().unwrap_or("unknown"),
            self.message,
        )
    }
}

/// Aggregated diagnostics for one document across every client.
///
/// `all` is derived from `by_client` and recomputed on each mutation, so the
/// fields stay private; readers use the accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDiagnostics {
    uri: String,
    /// Insertion-ordered; a republishing client keeps its slot.
    by_client: Vec<(String, Vec<Diagnostic>)>,
    all: Vec<Diagnostic>,
    version: Option<i32>,
}

impl FileDiagnostics {
    pub(crate) fn new(uri: String) -> Self {
        Self {
            uri,
            by_client: Vec::new(),
            all: Vec::new(),
            version: None,
        }
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Flattened diagnostics of every client, in client insertion order.
    #[must_use]
    pub fn all(&self) -> &[Diagnostic] {
        &self.all
    }

    #[must_use]
    pub fn version(&self) -> Option<i32> {
        self.version
    }

    pub fn by_client(&self) -> impl Iterator<Item = (&str, &[Diagnostic])> {
        self.by_client
            .iter()
            .map(|(id, items)| (id.as_str(), items.as_slice()))
    }

    #[must_use]
    pub fn for_client(&self, client_id: &str) -> Option<&[Diagnostic]> {
        self.by_client
            .iter()
            .find(|(id, _)| id == client_id)
            .map(|(_, items)| items.as_slice())
    }

    #[must_use]
    pub fn has_client(&self, client_id: &str) -> bool {
        self.for_client(client_id).is_some()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.by_client.len()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.all
            .iter()
            .filter(|d| d.severity.is_some_and(DiagnosticSeverity::is_error))
            .count()
    }

    pub(crate) fn set_client(&mut self, client_id: &str, items: Vec<Diagnostic>) {
        match self.by_client.iter_mut().find(|(id, _)| id == client_id) {
            Some((_, slot)) => *slot = items,
            None => self.by_client.push((client_id.to_string(), items)),
        }
        self.recompute();
    }

    pub(crate) fn remove_client(&mut self, client_id: &str) {
        self.by_client.retain(|(id, _)| id != client_id);
        self.recompute();
    }

    pub(crate) fn set_version(&mut self, version: i32) {
        self.version = Some(version);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }

    fn recompute(&mut self) {
        self.all = self
            .by_client
            .iter()
            .flat_map(|(_, items)| items.iter().cloned())
            .collect();
    }
}
