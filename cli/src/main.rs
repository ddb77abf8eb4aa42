//! Anvil CLI - drives the language server multiplexer from the command line.
//!
//! ```text
//! main() -> parse_args() -> AnvilConfig::load() -> commands::{diagnostics, prewarm, servers}
//! ```
//!
//! Logs go to `~/.anvil/logs/anvil.log`; stdout carries only command output.

mod args;
mod commands;

use std::{
    env,
    fs::{self, OpenOptions},
    path::PathBuf,
    process::ExitCode,
    sync::Mutex,
};

use anvil_config::AnvilConfig;
use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::args::{Command, USAGE};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // No log file: stay silent rather than interleave logs with command output.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, std::fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = anvil_config::config_dir() {
        candidates.push(dir.join("logs").join("anvil.log"));
    }
    // Fallback for read-only homes.
    candidates.push(PathBuf::from(".anvil").join("logs").join("anvil.log"));
    candidates
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();

    let invocation = match args::parse_args(env::args().skip(1)) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("error: {e:#}\n\n{USAGE}");
            return Ok(ExitCode::from(2));
        }
    };
    if invocation.command == Command::Help {
        println!("{USAGE}");
        return Ok(ExitCode::SUCCESS);
    }

    let config = match AnvilConfig::load() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("warning: {e}; using defaults");
            AnvilConfig::default()
        }
    };

    let root = match invocation.root {
        Some(root) => root,
        None => env::current_dir().context("resolving current directory")?,
    };
    let ctx = commands::Context::new(&root, config.lsp())?;

    match invocation.command {
        Command::Diagnostics { files, wait } => {
            if commands::diagnostics(&ctx, &files, wait).await? {
                return Ok(ExitCode::from(1));
            }
        }
        Command::Prewarm { dry_run } => commands::prewarm(&ctx, dry_run).await?,
        Command::Servers => commands::servers(&ctx),
        Command::Help => println!("{USAGE}"),
    }
    Ok(ExitCode::SUCCESS)
}
