//! Command-line parsing.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

pub(crate) const DEFAULT_WAIT: Duration = Duration::from_millis(3000);

pub(crate) const USAGE: &str = "\
Usage: anvil [--root DIR] <command>

Commands:
  diagnostics <files...> [--wait-ms N]   Open files and print diagnostics
  prewarm [--dry-run]                    Start servers the project layout suggests
  servers                                List configured language servers
  help                                   Show this message

Options:
  --root DIR    Workspace root (default: current directory)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Diagnostics { files: Vec<PathBuf>, wait: Duration },
    Prewarm { dry_run: bool },
    Servers,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Invocation {
    pub root: Option<PathBuf>,
    pub command: Command,
}

pub(crate) fn parse_args<I>(args: I) -> Result<Invocation>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut root = None;
    let mut name = None;
    let mut positional = Vec::new();
    let mut wait = DEFAULT_WAIT;
    let mut dry_run = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--root" => {
                let dir = args.next().context("--root needs a directory")?;
                root = Some(PathBuf::from(dir));
            }
            "--wait-ms" => {
                let value = args.next().context("--wait-ms needs a value")?;
                let ms: u64 = value
                    .parse()
                    .with_context(|| format!("invalid --wait-ms value {value:?}"))?;
                wait = Duration::from_millis(ms);
            }
            "--dry-run" => dry_run = true,
            "-h" | "--help" => name = Some("help".to_string()),
            flag if flag.starts_with("--") => bail!("unknown option {flag}"),
            _ if name.is_none() => name = Some(arg),
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    let command = match name.as_deref() {
        None | Some("help") => Command::Help,
        Some("diagnostics") => {
            if positional.is_empty() {
                bail!("diagnostics needs at least one file");
            }
            Command::Diagnostics {
                files: positional,
                wait,
            }
        }
        Some("prewarm") => Command::Prewarm { dry_run },
        Some("servers") => Command::Servers,
        Some(other) => bail!("unknown command {other:?}"),
    };
    Ok(Invocation { root, command })
}
