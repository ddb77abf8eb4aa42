//! Document-selector evaluation and the glob dialect used to express it.
//!
//! The glob compiler is deliberately tiny: `**`, `*` and `?` are the only
//! metacharacters; everything else is literal. It is the only glob dialect in
//! the workspace.

use std::collections::BTreeSet;
use std::path::{Component, Path};

use regex::Regex;

use crate::language::detect_language;
use crate::types::{DocumentFilter, DocumentSelector};

/// Compile a selector glob into an anchored regex.
///
/// - `**` crosses path segments; `**/` also matches zero segments, so
///   `**/*.ts` accepts a top-level `file.ts`.
/// - `*` matches within a single segment.
/// - `?` matches one non-separator character.
#[must_use]
pub fn glob_to_regex(pattern: &str) -> Regex {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => {
                let mut buf = [0u8; 4];
                out.push_str(&regex::escape(other.encode_utf8(&mut buf)));
            }
        }
    }

    out.push('$');
    // Every non-glob character went through `regex::escape`.
    Regex::new(&out).unwrap_or_else(|_| unreachable!("escaped glob is a valid regex: {out}"))
}

/// `file` relative to `root`, with forward slashes and no leading `./`.
///
/// Files outside `root` keep their full (normalized) path.
#[must_use]
pub fn relative_path(file: &Path, root: &Path) -> String {
    let relative = file.strip_prefix(root).unwrap_or(file);
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::CurDir => None,
            Component::RootDir => Some(String::new()),
            other => Some(other.as_os_str().to_string_lossy().replace('\\', "/")),
        })
        .collect();
    let joined = parts.join("/");
    joined
        .strip_prefix("./")
        .map(str::to_string)
        .unwrap_or(joined)
}

/// Whether `filter` accepts `file`, given its detected `language`.
/// `compiled` is the filter's pattern glob, if it has one.
fn filter_matches(
    filter: &DocumentFilter,
    compiled: Option<&Regex>,
    file: &Path,
    root: &Path,
    language: &str,
) -> bool {
    match filter {
        DocumentFilter::Language(id) => id == language,
        DocumentFilter::Filter {
            language: filter_language,
            scheme,
            ..
        } => {
            if filter_language.as_deref().is_some_and(|l| l != language) {
                return false;
            }
            if scheme.as_deref().is_some_and(|s| s != "file") {
                return false;
            }
            compiled.is_none_or(|re| re.is_match(&relative_path(file, root)))
        }
    }
}

/// A selector with its pattern globs compiled up front, for repeated
/// matching on the routing path.
#[derive(Debug, Clone)]
pub struct SelectorMatcher {
    filters: Vec<(DocumentFilter, Option<Regex>)>,
}

impl SelectorMatcher {
    #[must_use]
    pub fn new(selector: &DocumentSelector) -> Self {
        let filters = selector
            .iter()
            .map(|filter| {
                let compiled = match filter {
                    DocumentFilter::Filter {
                        pattern: Some(pattern),
                        ..
                    } => Some(glob_to_regex(pattern)),
                    _ => None,
                };
                (filter.clone(), compiled)
            })
            .collect();
        Self { filters }
    }

    /// Logical OR over the filters; an empty selector matches nothing.
    #[must_use]
    pub fn matches(&self, file: &Path, root: &Path) -> bool {
        let language = detect_language(file);
        self.filters
            .iter()
            .any(|(filter, compiled)| filter_matches(filter, compiled.as_ref(), file, root, language))
    }
}

/// Whether `file` is in scope for a server with `selector`. Logical OR over
/// the filters; an empty selector matches nothing.
#[must_use]
pub fn matches_selector(file: &Path, root: &Path, selector: &DocumentSelector) -> bool {
    SelectorMatcher::new(selector).matches(file, root)
}

/// Language ids a selector names, for prewarm candidate selection.
#[must_use]
pub fn selector_languages(selector: &DocumentSelector) -> BTreeSet<String> {
    selector
        .iter()
        .filter_map(DocumentFilter::language_id)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_star_crosses_segments() {
        let re = glob_to_regex("**/*.ts");
        assert!(re.is_match("src/deep/file.ts"));
        assert!(re.is_match("file.ts"));
        assert!(!re.is_match("file.tsx"));
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        let re = glob_to_regex("src/*.ts");
        assert!(re.is_match("src/index.ts"));
        assert!(!re.is_match("src/deep/index.ts"));
    }

    #[test]
    fn test_question_mark_is_one_non_separator() {
        let re = glob_to_regex("a?.rs");
        assert!(re.is_match("ab.rs"));
        assert!(!re.is_match("a/.rs"));
        assert!(!re.is_match("abc.rs"));
    }

    #[test]
    fn test_metacharacters_are_literal() {
        let re = glob_to_regex("lib/(v1)+[x].c");
        assert!(re.is_match("lib/(v1)+[x].c"));
        assert!(!re.is_match("lib/v1x.c"));
        // `.` is literal, not "any char".
        assert!(!glob_to_regex("a.ts").is_match("abts"));
    }

    #[test]
    fn test_trailing_double_star() {
        let re = glob_to_regex("vendor/**");
        assert!(re.is_match("vendor/a/b/c.go"));
        assert!(!re.is_match("src/vendor.go"));
    }

    #[test]
    fn test_relative_path_normalization() {
        let root = Path::new("/work");
        assert_eq!(
            relative_path(Path::new("/work/src/a.ts"), root),
            "src/a.ts"
        );
        assert_eq!(relative_path(Path::new("./src/a.ts"), root), "src/a.ts");
    }

    #[test]
    fn test_bare_language_filter() {
        let selector = vec![DocumentFilter::language("rust")];
        let root = Path::new("/work");
        assert!(matches_selector(Path::new("/work/src/main.rs"), root, &selector));
        assert!(!matches_selector(Path::new("/work/main.py"), root, &selector));
    }

    #[test]
    fn test_pattern_filter_scopes_to_subtree() {
        let selector = vec![DocumentFilter::pattern("typescript", "src/deep/**/*.ts")];
        let root = Path::new("/work");
        assert!(matches_selector(
            Path::new("/work/src/deep/a.ts"),
            root,
            &selector
        ));
        assert!(!matches_selector(
            Path::new("/work/src/other/b.ts"),
            root,
            &selector
        ));
    }

    #[test]
    fn test_filter_rejects_language_mismatch_and_foreign_scheme() {
        let root = Path::new("/work");
        let wrong_language = vec![DocumentFilter::pattern("python", "**/*.ts")];
        assert!(!matches_selector(Path::new("/work/a.ts"), root, &wrong_language));

        let untitled = vec![DocumentFilter::Filter {
            language: Some("typescript".to_string()),
            pattern: None,
            scheme: Some("untitled".to_string()),
        }];
        assert!(!matches_selector(Path::new("/work/a.ts"), root, &untitled));
    }

    #[test]
    fn test_any_filter_matches() {
        let selector = vec![
            DocumentFilter::language("javascript"),
            DocumentFilter::language("typescript"),
        ];
        assert!(matches_selector(Path::new("/w/a.ts"), Path::new("/w"), &selector));
        assert!(!matches_selector(Path::new("/w/a.rs"), Path::new("/w"), &Vec::new()));
    }

    #[test]
    fn test_matcher_reuses_compiled_patterns() {
        let selector = vec![
            DocumentFilter::pattern("typescript", "src/**/*.ts"),
            DocumentFilter::language("rust"),
        ];
        let matcher = SelectorMatcher::new(&selector);
        let root = Path::new("/work");
        for _ in 0..3 {
            assert!(matcher.matches(Path::new("/work/src/a/b.ts"), root));
            assert!(matcher.matches(Path::new("/work/main.rs"), root));
            assert!(!matcher.matches(Path::new("/work/test/b.ts"), root));
        }
        assert_eq!(
            matcher.matches(Path::new("/work/test/b.ts"), root),
            matches_selector(Path::new("/work/test/b.ts"), root, &selector)
        );
    }

    #[test]
    fn test_selector_languages() {
        let selector = vec![
            DocumentFilter::language("typescript"),
            DocumentFilter::pattern("javascript", "**/*.js"),
            DocumentFilter::Filter {
                language: None,
                pattern: Some("**/*.md".to_string()),
                scheme: None,
            },
        ];
        let languages = selector_languages(&selector);
        assert_eq!(
            languages.into_iter().collect::<Vec<_>>(),
            vec!["javascript".to_string(), "typescript".to_string()]
        );
    }
}
