//! File events from an external watcher and the filter that gates them.

use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use regex::Regex;

use crate::selector::{glob_to_regex, relative_path};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Opened(PathBuf),
    Changed(PathBuf),
    Closed(PathBuf),
}

impl FileEvent {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Opened(path) | Self::Changed(path) | Self::Closed(path) => path,
        }
    }
}

/// Decides whether the registry should react to events for `path`.
pub trait WatchFilter: Send + Sync {
    fn should_watch(&self, path: &Path) -> bool;
}

impl<F> WatchFilter for F
where
    F: Fn(&Path) -> bool + Send + Sync,
{
    fn should_watch(&self, path: &Path) -> bool {
        self(path)
    }
}

/// Skips `.git/`, paths matched by the root `.gitignore`, and extra
/// selector-style globs (relative to the root).
#[derive(Debug)]
pub struct IgnoreFilter {
    root: PathBuf,
    gitignore: Gitignore,
    extra: Vec<Regex>,
}

impl IgnoreFilter {
    /// Build from `<root>/.gitignore` (if present) plus `patterns`.
    pub fn new(root: &Path, patterns: &[String]) -> Result<Self, ignore::Error> {
        let mut builder = GitignoreBuilder::new(root);
        let gitignore_path = root.join(".gitignore");
        if gitignore_path.is_file()
            && let Some(err) = builder.add(&gitignore_path)
        {
            // A bad line should not disable the whole file.
            tracing::warn!(path = %gitignore_path.display(), "Partial .gitignore parse: {err}");
        }
        Ok(Self {
            root: root.to_path_buf(),
            gitignore: builder.build()?,
            extra: patterns.iter().map(|p| glob_to_regex(p)).collect(),
        })
    }
}

impl WatchFilter for IgnoreFilter {
    fn should_watch(&self, path: &Path) -> bool {
        let absolute = if path.is_relative() {
            self.root.join(path)
        } else {
            path.to_path_buf()
        };
        // `matched_path_or_any_parents` requires a path under the root.
        if !absolute.starts_with(&self.root) {
            return false;
        }

        let relative = relative_path(&absolute, &self.root);
        if relative == ".git" || relative.starts_with(".git/") {
            return false;
        }
        if self.extra.iter().any(|re| re.is_match(&relative)) {
            return false;
        }
        !self
            .gitignore
            .matched_path_or_any_parents(&absolute, false)
            .is_ignore()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gitignore_and_extra_patterns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "target/\n*.log\n").unwrap();
        let filter = IgnoreFilter::new(dir.path(), &["vendor/**".to_string()]).unwrap();

        assert!(filter.should_watch(&dir.path().join("src/main.rs")));
        assert!(!filter.should_watch(&dir.path().join("target/debug/build.rs")));
        assert!(!filter.should_watch(&dir.path().join("logs/run.log")));
        assert!(!filter.should_watch(&dir.path().join("vendor/lib/a.go")));
        assert!(!filter.should_watch(&dir.path().join(".git/HEAD")));
    }

    #[test]
    fn test_relative_paths_resolve_against_root() {
        let dir = tempfile::tempdir().unwrap();
        let filter = IgnoreFilter::new(dir.path(), &["dist/**".to_string()]).unwrap();
        assert!(filter.should_watch(Path::new("src/index.ts")));
        assert!(!filter.should_watch(Path::new("dist/index.js")));
    }

    #[test]
    fn test_paths_outside_root_are_not_watched() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let filter = IgnoreFilter::new(dir.path(), &[]).unwrap();
        assert!(!filter.should_watch(&other.path().join("a.rs")));
    }

    #[test]
    fn test_closure_filter() {
        let filter = |path: &Path| path.extension().is_some_and(|e| e == "rs");
        assert!(filter.should_watch(Path::new("a.rs")));
        assert!(!filter.should_watch(Path::new("a.py")));
        assert_eq!(
            FileEvent::Closed(PathBuf::from("a.rs")).path(),
            Path::new("a.rs")
        );
    }
}
