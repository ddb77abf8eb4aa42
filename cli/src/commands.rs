//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anvil_config::{LspSection, resolve_servers};
use anvil_lsp::selector::selector_languages;
use anvil_lsp::{
    ClientRegistry, DiagnosticSeverity, DiagnosticsEvent, FileDiagnostics, FileEvent,
    IgnoreFilter, LanguageServerConfig, RegistryOptions, StdioSpawner, WatchFilter,
    command_on_path,
};
use anyhow::{Context as _, Result, bail};
use tokio::sync::Notify;
use tokio::time::Instant;

pub(crate) struct Context {
    pub root: PathBuf,
    pub section: LspSection,
}

impl Context {
    /// Resolve `root` against the working directory once. The registry joins
    /// relative file paths onto the root, so everything handed to it from
    /// here on must already be absolute.
    pub(crate) fn new(root: &Path, section: LspSection) -> Result<Self> {
        let root = std::path::absolute(root)
            .with_context(|| format!("resolving workspace root {}", root.display()))?;
        if !root.is_dir() {
            bail!("workspace root {} is not a directory", root.display());
        }
        Ok(Self { root, section })
    }

    /// `file` as given on the command line, made absolute against the root.
    pub(crate) fn file_path(&self, file: &Path) -> PathBuf {
        if file.is_relative() {
            self.root.join(file)
        } else {
            file.to_path_buf()
        }
    }
}

fn build_registry(ctx: &Context) -> ClientRegistry<StdioSpawner> {
    let servers = resolve_servers(&ctx.section, command_on_path);
    let watch_filter: Option<Arc<dyn WatchFilter>> =
        match IgnoreFilter::new(&ctx.root, &ctx.section.ignore) {
            Ok(filter) => Some(Arc::new(filter)),
            Err(e) => {
                tracing::warn!("Ignore filter disabled: {e}");
                None
            }
        };
    let timeout = ctx.section.handshake_timeout();
    let options = RegistryOptions {
        handshake_timeout: timeout,
        watch_filter,
        ..RegistryOptions::default()
    };
    ClientRegistry::new(
        ctx.root.clone(),
        servers,
        StdioSpawner::default().with_handshake_timeout(timeout),
        options,
    )
}

struct OpenedFile {
    display: PathBuf,
    path: PathBuf,
    servers: usize,
}

fn all_reported(registry: &ClientRegistry<StdioSpawner>, files: &[OpenedFile]) -> bool {
    files.iter().all(|file| {
        registry
            .get_diagnostics(&file.path.to_string_lossy())
            .is_some_and(|diags| diags.client_count() >= file.servers)
    })
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Report {
    pub lines: Vec<String>,
    pub errors: usize,
    pub warnings: usize,
}

pub(crate) fn build_report<'a>(
    files: impl IntoIterator<Item = (&'a Path, &'a FileDiagnostics)>,
) -> Report {
    let mut report = Report::default();
    for (display, diags) in files {
        for diagnostic in diags.all() {
            match diagnostic.severity {
                Some(DiagnosticSeverity::Error) => report.errors += 1,
                Some(DiagnosticSeverity::Warning) | None => report.warnings += 1,
                Some(_) => {}
            }
            report.lines.push(diagnostic.display_with_path(display));
        }
    }
    report
}

/// Open `files`, wait until every server that received a file has reported
/// on it (bounded by `wait`), and print the result. Returns whether any
/// error-level diagnostic was found.
pub(crate) async fn diagnostics(ctx: &Context, files: &[PathBuf], wait: Duration) -> Result<bool> {
    let registry = build_registry(ctx);
    if registry.configured_client_ids().is_empty() {
        eprintln!("No language servers available (see `anvil servers`).");
        return Ok(false);
    }

    let notify = Arc::new(Notify::new());
    let wake = Arc::clone(&notify);
    let subscription = registry.on_diagnostics(Arc::new(move |_: &DiagnosticsEvent| {
        wake.notify_one();
    }));

    let mut opened = Vec::new();
    for file in files {
        let path = ctx.file_path(file);
        match registry.handle_event(FileEvent::Opened(path.clone())).await {
            Ok(0) => eprintln!("{}: no language server", file.display()),
            Ok(servers) => opened.push(OpenedFile {
                display: file.clone(),
                path,
                servers,
            }),
            Err(e) => eprintln!("{e}"),
        }
    }

    let deadline = Instant::now() + wait;
    while !all_reported(&registry, &opened) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::debug!("Diagnostics wait expired");
            break;
        }
        let _ = tokio::time::timeout(remaining, notify.notified()).await;
    }
    subscription.unsubscribe();

    let collected: Vec<(PathBuf, FileDiagnostics)> = opened
        .iter()
        .filter_map(|file| {
            registry
                .get_diagnostics(&file.path.to_string_lossy())
                .map(|diags| (file.display.clone(), diags))
        })
        .collect();
    let report = build_report(collected.iter().map(|(p, d)| (p.as_path(), d)));
    for line in &report.lines {
        println!("{line}");
    }
    eprintln!("{} error(s), {} warning(s)", report.errors, report.warnings);

    registry.shutdown_all().await;
    Ok(report.errors > 0)
}

pub(crate) async fn prewarm(ctx: &Context, dry_run: bool) -> Result<()> {
    if !dry_run && !ctx.section.prewarm {
        println!("Prewarm is disabled in config ([lsp] prewarm = false).");
        return Ok(());
    }

    let registry = build_registry(ctx);
    let ids = registry.prewarm_heuristics(dry_run).await;
    if ids.is_empty() {
        println!("Nothing to prewarm for {}", ctx.root.display());
        return Ok(());
    }
    if dry_run {
        println!("Would start: {}", ids.join(", "));
        return Ok(());
    }

    let started = registry.started_client_ids();
    println!("Started: {}", started.join(", "));
    let failed: Vec<&str> = ids
        .iter()
        .filter(|id| !started.contains(id))
        .map(String::as_str)
        .collect();
    if !failed.is_empty() {
        println!("Failed: {}", failed.join(", "));
    }
    registry.shutdown_all().await;
    Ok(())
}

pub(crate) fn format_server_line(server: &LanguageServerConfig, available: bool) -> String {
    let languages: Vec<String> = selector_languages(&server.selector).into_iter().collect();
    let mut command = server.command.clone();
    for arg in &server.args {
        command.push(' ');
        command.push_str(arg);
    }
    format!(
        "{:<12} {:<9} {:<40} [{}]",
        server.id,
        if available { "available" } else { "missing" },
        command,
        languages.join(", ")
    )
}

pub(crate) fn servers(ctx: &Context) {
    let configured = resolve_servers(&ctx.section, |_| true);
    if configured.is_empty() {
        println!("LSP is disabled in config.");
        return;
    }
    for server in &configured {
        println!(
            "{}",
            format_server_line(server, command_on_path(&server.command))
        );
    }
}
