//! Path → LSP language id.

use std::path::Path;

/// Fallback id for anything not in the tables.
pub const PLAINTEXT: &str = "plaintext";

/// Basenames that identify a language on their own. Matched case-insensitively;
/// an entry also matches `<name>.<suffix>` (e.g. `Dockerfile.dev`).
const BASENAMES: &[(&str, &str)] = &[
    ("dockerfile", "dockerfile"),
    ("containerfile", "dockerfile"),
    ("makefile", "makefile"),
    ("gnumakefile", "makefile"),
    ("cmakelists.txt", "cmake"),
    ("gemfile", "ruby"),
    ("rakefile", "ruby"),
    ("justfile", "just"),
    ("cargo.lock", "toml"),
];

/// Extension table; the longest matching suffix wins.
const EXTENSIONS: &[(&str, &str)] = &[
    (".ts", "typescript"),
    (".mts", "typescript"),
    (".cts", "typescript"),
    (".d.ts", "typescript"),
    (".tsx", "typescriptreact"),
    (".js", "javascript"),
    (".mjs", "javascript"),
    (".cjs", "javascript"),
    (".jsx", "javascriptreact"),
    (".json", "json"),
    (".jsonc", "jsonc"),
    (".md", "markdown"),
    (".markdown", "markdown"),
    (".mdx", "mdx"),
    (".rs", "rust"),
    (".py", "python"),
    (".pyi", "python"),
    (".go", "go"),
    (".lua", "lua"),
    (".dockerfile", "dockerfile"),
    (".c", "c"),
    (".h", "c"),
    (".cc", "cpp"),
    (".cpp", "cpp"),
    (".cxx", "cpp"),
    (".hpp", "cpp"),
    (".hh", "cpp"),
    (".cs", "csharp"),
    (".java", "java"),
    (".kt", "kotlin"),
    (".kts", "kotlin"),
    (".swift", "swift"),
    (".rb", "ruby"),
    (".php", "php"),
    (".sh", "shellscript"),
    (".bash", "shellscript"),
    (".zsh", "shellscript"),
    (".yaml", "yaml"),
    (".yml", "yaml"),
    (".toml", "toml"),
    (".html", "html"),
    (".htm", "html"),
    (".css", "css"),
    (".scss", "scss"),
    (".less", "less"),
    (".vue", "vue"),
    (".svelte", "svelte"),
    (".zig", "zig"),
    (".ex", "elixir"),
    (".exs", "elixir"),
    (".hs", "haskell"),
    (".ml", "ocaml"),
    (".sql", "sql"),
    (".xml", "xml"),
    (".tf", "terraform"),
];

/// Detect the LSP language id for `path`.
///
/// Order: basename special cases, then the longest matching extension, then
/// [`PLAINTEXT`]. Case-insensitive and pure.
#[must_use]
pub fn detect_language(path: &Path) -> &'static str {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return PLAINTEXT;
    };
    let name = name.to_ascii_lowercase();

    for (basename, language) in BASENAMES {
        if name == *basename
            || name
                .strip_prefix(basename)
                .is_some_and(|rest| rest.starts_with('.'))
        {
            return *language;
        }
    }

    EXTENSIONS
        .iter()
        .filter(|(ext, _)| name.len() > ext.len() && name.ends_with(ext))
        .max_by_key(|(ext, _)| ext.len())
        .map_or(PLAINTEXT, |(_, language)| *language)
}
