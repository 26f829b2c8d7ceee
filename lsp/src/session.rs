//! Extension session: server discovery at activation and a single language
//! client per activation.
//!
//! ```text
//! Uninitialized --activate (server found)--> Starting --handshake--> Running
//!       ^                                                              |
//!       +---------------- deactivate, signal complete <-- Stopping <---+
//! ```
//!
//! Discovery failure leaves the session `Uninitialized` after a single
//! user-visible error notification.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use futures_util::FutureExt;
use tokio::sync::mpsc;

use crate::client::{ClientState, LanguageClient, StopSignal};
use crate::diagnostics::DiagnosticsStore;
use crate::host::{ExtensionContext, ExtensionHost, Window};
use crate::locator::{self, Candidate, Resolution};
use crate::options::{ClientOptions, DocumentFilter, DocumentSelector, TraceLevel};
use crate::transport::{Executable, ServerOptions};
use crate::types::{Diagnostic, DiagnosticsSnapshot, LspEvent, ServerStopReason, TextDocument};

/// Setting holding an explicit server executable path.
pub const SERVER_PATH_SETTING: &str = "sayo-asm.languageServer.path";

/// Setting holding the protocol trace level.
pub const TRACE_SETTING: &str = "sayo-asm.trace.server";

pub const LANGUAGE_ID: &str = "sayo-asm";

pub const CLIENT_ID: &str = "sayo-asm";

pub const CLIENT_NAME: &str = "Sayo Assembly Language Server";

pub const TRACE_CHANNEL_NAME: &str = "Sayo Assembly Language Server Trace";

/// Files whose changes are forwarded to the server.
pub const WATCHED_FILES_GLOB: &str = "**/*.{s,asm}";

const NOT_FOUND_MESSAGE: &str = "Sayo LSP server not found. Please install the extension properly or configure \"sayo-asm.languageServer.path\"";

/// No server executable was found at any candidate location.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{NOT_FOUND_MESSAGE}")]
pub struct DiscoveryFailure {
    searched: Vec<Candidate>,
}

impl DiscoveryFailure {
    /// Locations that were checked, in priority order.
    #[must_use]
    pub fn searched(&self) -> &[Candidate] {
        &self.searched
    }
}

/// Lifecycle of the session as seen by the host.
///
/// A client whose start failed, or whose server exited after reaching
/// Running, is still owned by the session and reports `Starting` until
/// deactivated; use [`SessionManager::client_state`] to tell these apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    /// A client exists without a running server.
    Starting,
    Running,
    Stopping,
}

/// Owns at most one language client for the lifetime of an activation.
#[derive(Default)]
pub struct SessionManager {
    client: Option<LanguageClient>,
    resolution: Option<Resolution>,
    events: Option<mpsc::Receiver<LspEvent>>,
    diagnostics: DiagnosticsStore,
    stopping: Arc<AtomicBool>,
    debug_mode: bool,
}

impl SessionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch the server's debug executable on activation.
    #[must_use]
    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    /// Discover the server and begin starting it without waiting.
    ///
    /// The configuration is read once here; later changes need a new
    /// activation. A second activation while a client exists is ignored.
    pub fn activate<H>(&mut self, context: &ExtensionContext, host: &H) -> Result<(), DiscoveryFailure>
    where
        H: ExtensionHost + ?Sized,
    {
        if self.client.is_some() {
            tracing::warn!("Sayo LSP session already active; ignoring activation");
            return Ok(());
        }

        tracing::info!("Sayo Assembly extension activated");
        let configured = host.get(SERVER_PATH_SETTING);
        let roots = host.workspace_roots();
        let Some(resolution) =
            locator::resolve_server_path(configured.as_deref(), context.extension_path(), &roots)
        else {
            let searched = locator::candidates(configured.as_deref(), context.extension_path(), &roots);
            tracing::error!(
                candidates = searched.len(),
                install_dir = %context.extension_path().display(),
                "No Sayo LSP server executable found"
            );
            host.show_error_message(NOT_FOUND_MESSAGE);
            return Err(DiscoveryFailure { searched });
        };

        // Unset means off, so tracing is opt-in. A host with its own default
        // for the setting reports that value through `get`.
        let trace = host
            .get(TRACE_SETTING)
            .map_or(TraceLevel::Off, |value| TraceLevel::from_setting(&value));

        let mut options = ClientOptions::new(DocumentSelector::new(vec![DocumentFilter::file_language(
            LANGUAGE_ID,
        )]));
        options.synchronize.file_events = Some(host.watch(WATCHED_FILES_GLOB));
        options.output_channel = Some(host.create_output_channel(CLIENT_NAME));
        options.trace_output_channel = trace
            .is_enabled()
            .then(|| host.create_output_channel(TRACE_CHANNEL_NAME));
        options.trace = trace;
        options.workspace_folders = roots;

        let server = ServerOptions::same(Executable::new(resolution.path()));
        let mut client =
            LanguageClient::new(CLIENT_ID, CLIENT_NAME, server, options).with_debug_mode(self.debug_mode);
        self.events = client.take_events();
        self.diagnostics.clear();
        client.start();
        tracing::info!("Sayo LSP client started");

        self.resolution = Some(resolution);
        self.client = Some(client);
        Ok(())
    }

    /// Stop the client and return a signal that completes once it is gone.
    ///
    /// Without a client the signal is already complete and no process is
    /// touched. The session is reusable for a new activation immediately.
    pub fn deactivate(&mut self) -> StopSignal {
        let Some(mut client) = self.client.take() else {
            return futures_util::future::ready(()).boxed();
        };
        self.resolution = None;
        self.events = None;

        self.stopping.store(true, Ordering::SeqCst);
        let stopping = Arc::clone(&self.stopping);
        let stop = client.stop();
        async move {
            stop.await;
            drop(client);
            stopping.store(false, Ordering::SeqCst);
        }
        .boxed()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        match &self.client {
            None if self.stopping.load(Ordering::SeqCst) => SessionState::Stopping,
            None => SessionState::Uninitialized,
            Some(client) => match client.state() {
                ClientState::Running => SessionState::Running,
                ClientState::Stopping => SessionState::Stopping,
                ClientState::Stopped | ClientState::Starting | ClientState::StartFailed => {
                    SessionState::Starting
                }
            },
        }
    }

    /// Detailed state of the active client, if any.
    #[must_use]
    pub fn client_state(&self) -> Option<ClientState> {
        self.client.as_ref().map(LanguageClient::state)
    }

    /// The active client, if any.
    #[must_use]
    pub fn client(&self) -> Option<&LanguageClient> {
        self.client.as_ref()
    }

    /// Path of the executable chosen by this activation.
    #[must_use]
    pub fn server_path(&self) -> Option<&Path> {
        self.resolution.as_ref().map(Resolution::path)
    }

    #[must_use]
    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolution.as_ref()
    }

    pub async fn did_open(&self, document: &TextDocument) -> Result<()> {
        match &self.client {
            Some(client) => client.did_open(document).await,
            None => Ok(()),
        }
    }

    pub async fn did_change(&self, document: &TextDocument) -> Result<()> {
        match &self.client {
            Some(client) => client.did_change(document).await,
            None => Ok(()),
        }
    }

    pub async fn did_close(&self, document: &TextDocument) -> Result<()> {
        match &self.client {
            Some(client) => client.did_close(document).await,
            None => Ok(()),
        }
    }

    /// Drain up to `budget` pending client events. Returns how many were handled.
    pub fn poll_events(&mut self, budget: usize, window: &dyn Window) -> usize {
        let Some(events) = self.events.as_mut() else {
            return 0;
        };
        let mut count = 0;
        while count < budget {
            match events.try_recv() {
                Ok(event) => {
                    handle_event(&mut self.diagnostics, event, window);
                    count += 1;
                }
                Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => {
                    break;
                }
            }
        }
        count
    }

    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    #[must_use]
    pub fn diagnostics_for(&self, path: &Path) -> &[Diagnostic] {
        self.diagnostics.for_file(path)
    }

    /// Diagnostics for the given files, skipping files without any.
    #[must_use]
    pub fn diagnostics_for_files(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Vec<Diagnostic>)> {
        paths
            .iter()
            .filter_map(|path| {
                let items = self.diagnostics.for_file(path);
                (!items.is_empty()).then(|| (path.clone(), items.to_vec()))
            })
            .collect()
    }
}

fn handle_event(diagnostics: &mut DiagnosticsStore, event: LspEvent, window: &dyn Window) {
    match event {
        LspEvent::Diagnostics { path, items } => {
            tracing::debug!(
                path = %path.display(),
                count = items.len(),
                "Received diagnostics"
            );
            diagnostics.update(path, items);
        }
        LspEvent::ShowMessage { kind, message } => window.show_message(kind, &message),
        LspEvent::ServerStopped { reason } => {
            match &reason {
                ServerStopReason::Exited => tracing::info!("Sayo LSP server exited"),
                ServerStopReason::Failed(msg) => {
                    tracing::warn!(error = %msg, "Sayo LSP server failed");
                }
            }
            diagnostics.clear();
        }
    }
}

/// Activation entry point: discovery plus a fire-and-forget start.
///
/// A discovery failure has already been shown to the user and leaves the
/// returned session without a client.
pub fn activate<H>(context: &ExtensionContext, host: &H) -> SessionManager
where
    H: ExtensionHost + ?Sized,
{
    let mut session = SessionManager::new();
    if let Err(e) = session.activate(context, host) {
        tracing::debug!("Activation ended without a language client: {e}");
    }
    session
}

/// Deactivation entry point. The host should await the returned signal.
pub fn deactivate(session: &mut SessionManager) -> StopSignal {
    session.deactivate()
}
