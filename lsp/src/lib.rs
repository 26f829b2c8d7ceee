//! Client-side bootstrap for the Sayo assembly language server.
//!
//! [`SessionManager`] locates the server executable, starts a
//! [`LanguageClient`] without blocking activation and stops it on
//! deactivation through an awaitable [`StopSignal`].

pub mod codec;
pub mod host;
pub mod locator;
pub mod options;
pub mod transport;
pub mod types;

mod client;
mod connection;
mod diagnostics;
mod protocol;
mod session;
mod trace;

pub use client::{ClientState, LanguageClient, StopSignal};
pub use host::{
    Configuration, ExtensionContext, ExtensionHost, FileEvents, FileSystemWatcher, OutputChannel,
    Window, Workspace,
};
pub use locator::{
    Candidate, CandidateOrigin, Resolution, SERVER_BINARY_NAME, candidates, resolve_server_path,
};
pub use options::{ClientOptions, DocumentFilter, DocumentSelector, SynchronizeOptions, TraceLevel};
pub use protocol::PathToUriError;
pub use session::{
    CLIENT_ID, CLIENT_NAME, DiscoveryFailure, LANGUAGE_ID, SERVER_PATH_SETTING, SessionManager,
    SessionState, TRACE_CHANNEL_NAME, TRACE_SETTING, WATCHED_FILES_GLOB, activate, deactivate,
};
pub use transport::{Executable, ExecutableOptions, ServerOptions, TransportError};
pub use types::{
    Diagnostic, DiagnosticSeverity, DiagnosticsSnapshot, FileChangeKind, FileEvent, LspEvent,
    MessageType, ServerStopReason, TextDocument,
};
