//! Process transport: how the language server executable is launched.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("language server executable not found: {}", command.display())]
    NotFound {
        command: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn language server {}", command.display())]
    Spawn {
        command: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("language server process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// Execution options for the server process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutableOptions {
    /// When false the process is tied to the client and dies with it.
    pub detached: bool,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// A server launched as `command args...` speaking the protocol over stdio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub options: ExecutableOptions,
}

impl Executable {
    /// An attached executable with no arguments.
    #[must_use]
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            options: ExecutableOptions::default(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(!self.options.detached);

        if let Some(cwd) = &self.options.cwd {
            cmd.current_dir(cwd);
        }

        #[cfg(unix)]
        if self.options.detached {
            cmd.process_group(0);
        }

        cmd
    }

    pub(crate) fn spawn(&self) -> Result<SpawnedServer, TransportError> {
        tracing::debug!(
            command = %self.command.display(),
            args = ?self.args,
            detached = self.options.detached,
            "Spawning language server"
        );

        let mut child = self.command().spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                TransportError::NotFound {
                    command: self.command.clone(),
                    source,
                }
            } else {
                TransportError::Spawn {
                    command: self.command.clone(),
                    source,
                }
            }
        })?;

        let stdin = child.stdin.take().ok_or(TransportError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(TransportError::MissingPipe("stderr"))?;

        Ok(SpawnedServer {
            child,
            stdin,
            stdout,
            stderr,
        })
    }
}

/// Run and debug launch descriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub run: Executable,
    pub debug: Executable,
}

impl ServerOptions {
    /// Use the same executable in both modes.
    #[must_use]
    pub fn same(executable: Executable) -> Self {
        Self {
            run: executable.clone(),
            debug: executable,
        }
    }

    #[must_use]
    pub fn select(&self, debug_mode: bool) -> &Executable {
        if debug_mode { &self.debug } else { &self.run }
    }
}

/// A freshly spawned server with its pipes detached from the handle.
pub(crate) struct SpawnedServer {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}
