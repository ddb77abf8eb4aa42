//! Anvil configuration: `~/.anvil/config.toml` and the language server table
//! derived from it.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anvil_lsp::selector::selector_languages;
use anvil_lsp::{DocumentFilter, LanguageServerConfig};
use serde::Deserialize;

// bool::default() is false, so only true needs a fn
const fn default_true() -> bool {
    true
}

const fn default_handshake_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Default, Deserialize)]
pub struct AnvilConfig {
    pub lsp: Option<LspSection>,
}

/// The `[lsp]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct LspSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Optional allowlist of language ids; servers naming none of them are
    /// dropped.
    #[serde(default)]
    pub languages: Option<Vec<String>>,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub prewarm: bool,
    /// Extra ignore globs for file events, relative to the workspace root.
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Additions to, or overrides (by id) of, the built-in servers.
    #[serde(default)]
    pub servers: Vec<LanguageServerConfig>,
}

impl Default for LspSection {
    fn default() -> Self {
        Self {
            enabled: true,
            languages: None,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            prewarm: true,
            ignore: Vec::new(),
            servers: Vec::new(),
        }
    }
}

impl LspSection {
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

impl AnvilConfig {
    /// Load from the default location. `Ok(None)` when there is no config
    /// file (or no home directory).
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// The `[lsp]` section, or its defaults when absent.
    #[must_use]
    pub fn lsp(&self) -> LspSection {
        self.lsp.clone().unwrap_or_default()
    }
}

#[must_use]
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".anvil"))
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Expand `${VAR}` references; unset variables become empty, an unclosed
/// `${` is kept literally.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn languages(ids: &[&str]) -> Vec<DocumentFilter> {
    ids.iter().map(|id| DocumentFilter::language(*id)).collect()
}

fn stdio_args() -> Vec<String> {
    vec!["--stdio".to_string()]
}

/// Built-in server table, before availability filtering.
#[must_use]
pub fn default_servers() -> Vec<LanguageServerConfig> {
    const JS_TS: &[&str] = &[
        "typescript",
        "typescriptreact",
        "javascript",
        "javascriptreact",
    ];
    vec![
        LanguageServerConfig::new(
            "typescript",
            "typescript-language-server",
            stdio_args(),
            languages(JS_TS),
        )
        .with_display_name("TypeScript"),
        LanguageServerConfig::new(
            "eslint",
            "vscode-eslint-language-server",
            stdio_args(),
            languages(JS_TS),
        )
        .with_display_name("ESLint"),
        LanguageServerConfig::new(
            "pyright",
            "pyright-langserver",
            stdio_args(),
            languages(&["python"]),
        )
        .with_display_name("Pyright"),
        LanguageServerConfig::new("rust", "rust-analyzer", vec![], languages(&["rust"]))
            .with_display_name("rust-analyzer"),
        LanguageServerConfig::new("go", "gopls", vec![], languages(&["go"]))
            .with_display_name("gopls"),
        LanguageServerConfig::new("lua", "lua-language-server", vec![], languages(&["lua"]))
            .with_display_name("LuaLS"),
        LanguageServerConfig::new(
            "dockerfile",
            "docker-langserver",
            stdio_args(),
            languages(&["dockerfile"]),
        )
        .with_display_name("Dockerfile"),
        LanguageServerConfig::new(
            "markdown",
            "marksman",
            vec!["server".to_string()],
            languages(&["markdown"]),
        )
        .with_display_name("Marksman"),
        LanguageServerConfig::new(
            "json",
            "vscode-json-language-server",
            stdio_args(),
            languages(&["json", "jsonc"]),
        )
        .with_display_name("JSON"),
    ]
}

/// Final server list for a session.
///
/// User servers replace built-ins with the same id (keeping its position) or
/// are appended. The language allowlist then applies, and servers whose
/// command is not available are dropped.
pub fn resolve_servers(
    section: &LspSection,
    command_exists: impl Fn(&str) -> bool,
) -> Vec<LanguageServerConfig> {
    if !section.enabled {
        return Vec::new();
    }

    let mut servers = default_servers();
    for user in &section.servers {
        let mut user = user.clone();
        user.command = expand_env_vars(&user.command);
        user.args = user.args.iter().map(|a| expand_env_vars(a)).collect();
        match servers.iter_mut().find(|s| s.id == user.id) {
            Some(existing) => *existing = user,
            None => servers.push(user),
        }
    }

    if let Some(allowed) = &section.languages {
        servers.retain(|server| {
            selector_languages(&server.selector)
                .iter()
                .any(|lang| allowed.contains(lang))
        });
    }

    servers.retain(|server| {
        let found = command_exists(&server.command);
        if !found {
            tracing::debug!(server = %server.id, "Skipping language server, '{}' not found", server.command);
        }
        found
    });
    servers
}
