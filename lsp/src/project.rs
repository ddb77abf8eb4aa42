//! Project-language guess from marker files at the workspace root.
//!
//! Only used to pick prewarm candidates. File-driven lazy start stays the
//! source of truth for which servers actually run.

use std::collections::BTreeSet;
use std::path::Path;

/// Marker file → languages it implies.
const MARKERS: &[(&str, &[&str])] = &[
    ("package.json", &["javascript", "typescript", "json"]),
    ("tsconfig.json", &["typescript"]),
    ("Cargo.toml", &["rust"]),
    ("pyproject.toml", &["python"]),
    ("requirements.txt", &["python"]),
    ("setup.cfg", &["python"]),
    ("setup.py", &["python"]),
    ("go.mod", &["go"]),
    ("Dockerfile", &["dockerfile"]),
    (".eslintrc", &["javascript", "typescript"]),
    (".eslintrc.js", &["javascript", "typescript"]),
    (".eslintrc.cjs", &["javascript", "typescript"]),
    (".eslintrc.json", &["javascript", "typescript"]),
    (".eslintrc.yaml", &["javascript", "typescript"]),
    (".eslintrc.yml", &["javascript", "typescript"]),
    ("eslint.config.js", &["javascript", "typescript"]),
    ("eslint.config.mjs", &["javascript", "typescript"]),
    ("eslint.config.cjs", &["javascript", "typescript"]),
    ("eslint.config.ts", &["javascript", "typescript"]),
    (".luarc.json", &["lua"]),
    (".luarc.jsonc", &["lua"]),
    ("README.md", &["markdown"]),
];

/// Guess the languages of the project rooted at `root`.
///
/// Only the root directory itself is inspected; a missing or unreadable root
/// yields an empty set.
#[must_use]
pub fn detect_project_languages(root: &Path) -> BTreeSet<String> {
    MARKERS
        .iter()
        .filter(|(marker, _)| root.join(marker).is_file())
        .flat_map(|(_, languages)| languages.iter().map(|l| (*l).to_string()))
        .collect()
}
