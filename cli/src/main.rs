//! sayo-host - drive the Sayo language client from a terminal.
//!
//! ```text
//! main() -> activate() --(fire-and-forget start)--> event loop
//!                                                      |
//!                              tick: poll_events -> print diagnostics
//!                              Ctrl-C: deactivate().await -> exit
//! ```

mod host;
mod watcher;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use std::{env, io};

use anyhow::{Context, Result, bail};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use sayo_config::Settings;
use sayo_lsp_client::{
    ExtensionContext, LANGUAGE_ID, SessionManager, TextDocument, Window,
};

use crate::host::HeadlessHost;

const USAGE: &str = "\
Usage: sayo-host [OPTIONS] [FILE]...

Starts the Sayo assembly language server for the given workspaces, opens
FILEs and prints their diagnostics until interrupted with Ctrl-C.

Options:
  --workspace DIR       Workspace folder (repeatable; default: current dir)
  --extension-dir DIR   Install directory holding bin/sayo-lsp
  --debug               Launch the server in debug mode and log at debug
                        level unless RUST_LOG is set
  -h, --help            Print this help
";

const TICK: Duration = Duration::from_millis(50);

/// Max events drained per tick.
const EVENT_BUDGET: usize = 64;

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    workspaces: Vec<PathBuf>,
    extension_dir: Option<PathBuf>,
    debug: bool,
    files: Vec<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run(Args),
    Help,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Command> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "--debug" => parsed.debug = true,
            "--workspace" => {
                let dir = args.next().context("--workspace requires a directory")?;
                parsed.workspaces.push(PathBuf::from(dir));
            }
            "--extension-dir" => {
                let dir = args
                    .next()
                    .context("--extension-dir requires a directory")?;
                parsed.extension_dir = Some(PathBuf::from(dir));
            }
            flag if flag.starts_with("--") => bail!("unknown option {flag}\n\n{USAGE}"),
            _ => parsed.files.push(PathBuf::from(&arg)),
        }
    }
    Ok(Command::Run(parsed))
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

/// The install directory is the parent of the `bin/` holding this binary.
fn default_extension_dir() -> Result<PathBuf> {
    let exe = env::current_exe().context("locating sayo-host executable")?;
    exe.parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .context("sayo-host is not installed under a bin/ directory")
}

fn absolute(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .with_context(|| format!("resolving {}", path.display()))
}

async fn open_files(session: &SessionManager, files: &[PathBuf]) -> Result<()> {
    for file in files {
        let path = absolute(file)?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let document = TextDocument::from_path(&path, LANGUAGE_ID, text)?;
        session.did_open(&document).await?;
        tracing::debug!(path = %path.display(), "Opened document");
    }
    Ok(())
}

fn print_diagnostics(session: &SessionManager) {
    let snapshot = session.snapshot();
    for (path, items) in snapshot.files() {
        for item in items {
            println!("{}", item.display_with_path(path));
        }
    }
    if snapshot.is_empty() {
        println!("no diagnostics");
    } else {
        println!("{}", snapshot.status_string());
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let settings = match Settings::load() {
        Ok(settings) => settings.unwrap_or_default(),
        Err(e) => {
            tracing::warn!("Ignoring settings: {:#}", anyhow::Error::from(e));
            Settings::default()
        }
    };

    let workspaces = if args.workspaces.is_empty() {
        vec![env::current_dir().context("reading current directory")?]
    } else {
        args.workspaces
    };
    let roots = workspaces
        .iter()
        .map(|dir| absolute(dir))
        .collect::<Result<Vec<_>>>()?;
    let extension_dir = match args.extension_dir {
        Some(dir) => dir,
        None => default_extension_dir()?,
    };

    let host = HeadlessHost::new(settings, roots);
    let mut session = SessionManager::new().with_debug_mode(args.debug);
    if let Err(e) = session.activate(&ExtensionContext::new(extension_dir), &host) {
        tracing::debug!(searched = e.searched().len(), "Activation ended without a language client");
        return Ok(ExitCode::FAILURE);
    }

    if let Err(e) = open_files(&session, &args.files).await {
        host.show_error_message(&format!("{e:#}"));
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(TICK);
    let mut last_state = session.state();

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    tracing::warn!("Failed to listen for Ctrl-C: {e}");
                }
                break;
            }
            _ = ticker.tick() => {
                let state = session.state();
                if state != last_state {
                    tracing::info!("Session {last_state:?} -> {state:?}");
                    last_state = state;
                }
                if session.poll_events(EVENT_BUDGET, &host) > 0 {
                    print_diagnostics(&session);
                }
            }
        }
    }

    tracing::info!("Stopping language server...");
    sayo_lsp_client::deactivate(&mut session).await;
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = match parse_args(env::args().skip(1))? {
        Command::Help => {
            print!("{USAGE}");
            return Ok(ExitCode::SUCCESS);
        }
        Command::Run(args) => args,
    };
    init_tracing(args.debug);
    run(args).await
}
