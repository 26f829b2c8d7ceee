//! The language client: one server process, its handshake, document
//! synchronization and file-event forwarding.
//!
//! [`LanguageClient::start`] returns immediately; the process spawn and the
//! `initialize` handshake run on a background task whose progress is visible
//! through [`LanguageClient::state`]. [`LanguageClient::stop`] hands back a
//! [`StopSignal`] the caller can await for graceful shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::connection::{RpcHandle, Router, ServerProcess};
use crate::host::{FileEvents, OutputChannel};
use crate::options::{ClientOptions, DocumentSelector, TraceLevel};
use crate::protocol;
use crate::trace::Tracer;
use crate::transport::ServerOptions;
use crate::types::{FileEvent, LspEvent, TextDocument};

/// Channel capacity for events flowing from the connection to the host.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Upper bound on file events folded into one `didChangeWatchedFiles`.
const FILE_EVENT_BATCH: usize = 64;

/// Produces the server connection inside the start task.
pub(crate) type Connect = Box<dyn FnOnce(Router) -> Result<ServerProcess> + Send>;

/// Completion signal of [`LanguageClient::stop`].
pub type StopSignal = BoxFuture<'static, ()>;

/// Lifecycle state of the client, as tracked by the client itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Stopped,
    Starting,
    Running,
    StartFailed,
    Stopping,
}

#[derive(Default)]
struct OpenDocument {
    language_id: String,
    version: i32,
    text: String,
}

/// Documents the client has seen opened, replayed once the server is up.
#[derive(Default)]
struct DocumentRegistry {
    open: HashMap<Url, OpenDocument>,
}

/// State reachable from both the client handle and its background task.
struct Shared {
    name: String,
    selector: DocumentSelector,
    workspace_folders: Vec<Url>,
    trace: TraceLevel,
    output: Option<Arc<dyn OutputChannel>>,
    tracer: Tracer,
    state: Arc<watch::Sender<ClientState>>,
    event_tx: mpsc::Sender<LspEvent>,
    server: Mutex<Option<ServerProcess>>,
    documents: Mutex<DocumentRegistry>,
}

impl Shared {
    fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    fn router(&self) -> Router {
        Router {
            server_name: self.name.clone(),
            event_tx: self.event_tx.clone(),
            output: self.output.clone(),
            state: Arc::clone(&self.state),
            tracer: self.tracer.clone(),
        }
    }

    fn log_output(&self, line: &str) {
        if let Some(output) = &self.output {
            output.append_line(line);
        }
    }

    async fn rpc(&self) -> Option<RpcHandle> {
        if self.state() != ClientState::Running {
            return None;
        }
        self.server.lock().await.as_ref().map(|s| s.rpc().clone())
    }

    /// Connect, handshake, replay open documents, then forward file events
    /// until the connection goes away.
    async fn run(&self, connect: Connect, file_events: Option<FileEvents>) -> Result<()> {
        let process = connect(self.router())?;
        let rpc = process.rpc().clone();
        *self.server.lock().await = Some(process);

        rpc.initialize(&self.name, &self.workspace_folders, self.trace)
            .await?;
        self.mark_running(&rpc).await?;
        tracing::info!("LSP server '{}' started successfully", self.name);

        if let Some(events) = file_events {
            forward_file_events(events, &rpc).await;
        }
        Ok(())
    }

    /// Flip to Running and re-send `didOpen` for everything opened so far.
    ///
    /// Holding the registry lock across the flip keeps replayed opens ahead of
    /// any edit sent by a concurrent `did_change`.
    async fn mark_running(&self, rpc: &RpcHandle) -> Result<()> {
        let documents = self.documents.lock().await;
        self.state.send_replace(ClientState::Running);
        for (uri, doc) in &documents.open {
            let params = protocol::did_open_params(uri, &doc.language_id, doc.version, &doc.text);
            rpc.notify("textDocument/didOpen", Some(params)).await?;
        }
        Ok(())
    }

    async fn fail_start(&self, error: &anyhow::Error) {
        tracing::error!("Failed to start LSP server '{}': {error:#}", self.name);
        self.log_output(&format!("Starting client failed: {error:#}"));
        if let Some(process) = self.server.lock().await.take() {
            process.kill().await;
        }
        self.state.send_replace(ClientState::StartFailed);
    }
}

async fn forward_file_events(mut events: FileEvents, rpc: &RpcHandle) {
    while let Some(first) = events.recv().await {
        let mut batch = vec![first];
        while batch.len() < FILE_EVENT_BATCH {
            match events.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        if let Err(e) = notify_watched_files(rpc, &batch).await {
            tracing::debug!("Stopped forwarding file events: {e:#}");
            return;
        }
    }
}

async fn notify_watched_files(rpc: &RpcHandle, events: &[FileEvent]) -> Result<()> {
    let params = protocol::did_change_watched_files_params(events);
    rpc.notify("workspace/didChangeWatchedFiles", Some(params))
        .await
}

/// A protocol client bound to one server executable.
pub struct LanguageClient {
    id: String,
    server_options: ServerOptions,
    debug_mode: bool,
    shared: Arc<Shared>,
    file_events: Option<FileEvents>,
    event_rx: Option<mpsc::Receiver<LspEvent>>,
    start_task: Option<JoinHandle<()>>,
}

impl LanguageClient {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        server_options: ServerOptions,
        options: ClientOptions,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(ClientState::Stopped);
        let ClientOptions {
            document_selector,
            synchronize,
            output_channel,
            trace_output_channel,
            trace,
            workspace_folders,
        } = options;

        let workspace_folders = workspace_folders
            .iter()
            .filter_map(|root| match protocol::path_to_file_uri(root) {
                Ok(uri) => Some(uri),
                Err(e) => {
                    tracing::warn!("Skipping workspace folder: {e}");
                    None
                }
            })
            .collect();

        let shared = Shared {
            name: name.into(),
            selector: document_selector,
            workspace_folders,
            trace,
            output: output_channel,
            tracer: Tracer::new(trace_output_channel, trace),
            state: Arc::new(state_tx),
            event_tx,
            server: Mutex::new(None),
            documents: Mutex::new(DocumentRegistry::default()),
        };

        Self {
            id: id.into(),
            server_options,
            debug_mode: false,
            shared: Arc::new(shared),
            file_events: synchronize.file_events,
            event_rx: Some(event_rx),
            start_task: None,
        }
    }

    /// Launch the `debug` executable instead of `run`.
    #[must_use]
    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    #[must_use]
    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    /// Take the event stream (diagnostics, messages, server exit). Yields once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<LspEvent>> {
        self.event_rx.take()
    }

    /// Begin starting the server without waiting for it.
    ///
    /// Must be called from within a tokio runtime. Failures are reported to
    /// the output channel and through [`ClientState::StartFailed`].
    pub fn start(&mut self) {
        match self.state() {
            ClientState::Stopped | ClientState::StartFailed => {}
            state => {
                tracing::warn!("Ignoring start of '{}' in state {state:?}", self.id);
                return;
            }
        }

        let executable = self.server_options.select(self.debug_mode).clone();
        tracing::info!(
            "Starting LSP server '{}' ({})...",
            self.shared.name,
            executable.command.display()
        );
        self.launch(Box::new(move |router: Router| -> Result<ServerProcess> {
            let spawned = executable.spawn()?;
            Ok(ServerProcess::attach(spawned, router))
        }));
    }

    pub(crate) fn launch(&mut self, connect: Connect) {
        self.shared.state.send_replace(ClientState::Starting);

        let shared = Arc::clone(&self.shared);
        let file_events = self.file_events.take();
        self.start_task = Some(tokio::spawn(async move {
            if let Err(e) = shared.run(connect, file_events).await
                && shared.state() != ClientState::Stopping
            {
                shared.fail_start(&e).await;
            }
        }));
    }

    /// Stop the server and return a signal that completes once it is gone.
    ///
    /// An unfinished start is cancelled first; a process spawned by it is
    /// still terminated. Calling this on a client that never started yields
    /// an already-complete signal.
    pub fn stop(&mut self) -> StopSignal {
        let start_task = self.start_task.take();
        if start_task.is_none() && self.state() == ClientState::Stopped {
            return futures_util::future::ready(()).boxed();
        }

        self.shared.state.send_replace(ClientState::Stopping);
        let shared = Arc::clone(&self.shared);
        async move {
            if let Some(task) = start_task {
                task.abort();
                let _ = task.await;
            }
            let process = shared.server.lock().await.take();
            if let Some(process) = process {
                process.shutdown().await;
            }
            shared.documents.lock().await.open.clear();
            shared.state.send_replace(ClientState::Stopped);
            tracing::info!("LSP client '{}' stopped", shared.name);
        }
        .boxed()
    }

    /// Whether `document` falls under this client's selector.
    #[must_use]
    pub fn handles(&self, document: &TextDocument) -> bool {
        self.shared.selector.matches(document)
    }

    pub async fn did_open(&self, document: &TextDocument) -> Result<()> {
        if !self.handles(document) {
            return Ok(());
        }
        let mut documents = self.shared.documents.lock().await;
        documents.open.insert(
            document.uri().clone(),
            OpenDocument {
                language_id: document.language_id().to_string(),
                version: 1,
                text: document.text().to_string(),
            },
        );
        if let Some(rpc) = self.shared.rpc().await {
            let params = protocol::did_open_params(document.uri(), document.language_id(), 1, document.text());
            rpc.notify("textDocument/didOpen", Some(params))
                .await
                .context("sending didOpen")?;
        }
        Ok(())
    }

    /// Full-text change. A document never opened is opened instead.
    pub async fn did_change(&self, document: &TextDocument) -> Result<()> {
        if !self.handles(document) {
            return Ok(());
        }
        let mut documents = self.shared.documents.lock().await;
        if !documents.open.contains_key(document.uri()) {
            drop(documents);
            return self.did_open(document).await;
        }
        let entry = documents.open.entry(document.uri().clone()).or_default();
        entry.version += 1;
        entry.text = document.text().to_string();
        let version = entry.version;

        if let Some(rpc) = self.shared.rpc().await {
            let params = protocol::did_change_params(document.uri(), version, document.text());
            rpc.notify("textDocument/didChange", Some(params))
                .await
                .context("sending didChange")?;
        }
        Ok(())
    }

    pub async fn did_close(&self, document: &TextDocument) -> Result<()> {
        let mut documents = self.shared.documents.lock().await;
        if documents.open.remove(document.uri()).is_none() {
            return Ok(());
        }
        if let Some(rpc) = self.shared.rpc().await {
            rpc.notify("textDocument/didClose", Some(protocol::did_close_params(document.uri())))
                .await
                .context("sending didClose")?;
        }
        Ok(())
    }

    /// Open document URIs, for diagnostics and tests.
    pub async fn open_documents(&self) -> Vec<Url> {
        self.shared.documents.lock().await.open.keys().cloned().collect()
    }

    /// Current workspace folder URIs sent in `initialize`.
    #[must_use]
    pub fn workspace_folders(&self) -> &[Url] {
        &self.shared.workspace_folders
    }
}

impl Drop for LanguageClient {
    fn drop(&mut self) {
        if let Some(task) = self.start_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use tokio::io::DuplexStream;

    use super::*;
    use crate::codec::{MessageReader, MessageWriter};
    use crate::options::DocumentFilter;
    use crate::transport::Executable;
    use crate::types::FileChangeKind;

    fn client() -> LanguageClient {
        let options = ClientOptions::new(DocumentSelector::new(vec![DocumentFilter::file_language("sayo-asm")]));
        LanguageClient::new(
            "sayo-asm",
            "Sayo Assembly Language Server",
            ServerOptions::same(Executable::new("/definitely/not/here/sayo-lsp")),
            options,
        )
    }

    fn doc(name: &str, language: &str) -> TextDocument {
        #[cfg(windows)]
        let uri = format!("file:///C:/fw/{name}");
        #[cfg(not(windows))]
        let uri = format!("file:///fw/{name}");
        TextDocument::new(Url::parse(&uri).unwrap(), language, "nop")
    }

    #[tokio::test]
    async fn test_new_client_is_stopped() {
        let client = client();
        assert_eq!(client.state(), ClientState::Stopped);
        assert_eq!(client.id(), "sayo-asm");
        assert_eq!(client.name(), "Sayo Assembly Language Server");
    }

    #[tokio::test]
    async fn test_stop_without_start_is_immediately_ready() {
        let mut client = client();
        let signal = client.stop();
        assert!(signal.now_or_never().is_some());
        assert_eq!(client.state(), ClientState::Stopped);
    }

    #[tokio::test]
    async fn test_start_with_missing_binary_fails_in_background() {
        let mut client = client();
        let mut state = client.subscribe();
        client.start();
        assert_ne!(client.state(), ClientState::Stopped);

        let failed = state
            .wait_for(|s| *s == ClientState::StartFailed)
            .await
            .map(|s| *s);
        assert_eq!(failed.unwrap(), ClientState::StartFailed);

        client.stop().await;
        assert_eq!(client.state(), ClientState::Stopped);
    }

    #[tokio::test]
    async fn test_documents_outside_selector_are_ignored() {
        let client = client();
        client.did_open(&doc("notes.txt", "plaintext")).await.unwrap();
        assert!(client.open_documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_documents_are_buffered_until_running() {
        let client = client();
        let main = doc("main.asm", "sayo-asm");
        client.did_open(&main).await.unwrap();
        client.did_change(&main.with_text("halt")).await.unwrap();
        client.did_change(&doc("other.asm", "sayo-asm")).await.unwrap();
        assert_eq!(client.open_documents().await.len(), 2);

        client.did_close(&main).await.unwrap();
        assert_eq!(client.open_documents().await.len(), 1);
    }

    #[tokio::test]
    async fn test_take_events_yields_once() {
        let mut client = client();
        assert!(client.take_events().is_some());
        assert!(client.take_events().is_none());
    }

    /// Answers `initialize` and `shutdown`, publishes one diagnostic for the
    /// first opened document and reports every message it receives.
    async fn fake_server(
        reader: tokio::io::ReadHalf<DuplexStream>,
        writer: tokio::io::WriteHalf<DuplexStream>,
        seen: mpsc::Sender<Value>,
    ) {
        let mut reader = MessageReader::new(reader);
        let mut writer = MessageWriter::new(writer);
        while let Ok(Some(message)) = reader.read_message().await {
            let method = message["method"].as_str().unwrap_or_default().to_string();
            match method.as_str() {
                "initialize" => {
                    let reply = protocol::response_ok(message["id"].clone(), json!({"capabilities": {}}));
                    writer.write_message(&reply).await.unwrap();
                }
                "shutdown" => {
                    let reply = protocol::response_ok(message["id"].clone(), Value::Null);
                    writer.write_message(&reply).await.unwrap();
                }
                "textDocument/didOpen" => {
                    let publish = json!({
                        "jsonrpc": "2.0",
                        "method": "textDocument/publishDiagnostics",
                        "params": {
                            "uri": message["params"]["textDocument"]["uri"],
                            "diagnostics": [{
                                "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 3}},
                                "severity": 1,
                                "message": "unknown mnemonic"
                            }]
                        }
                    });
                    writer.write_message(&publish).await.unwrap();
                }
                _ => {}
            }
            let done = method == "exit";
            let _ = seen.send(message).await;
            if done {
                break;
            }
        }
    }

    async fn next_method(seen: &mut mpsc::Receiver<Value>) -> String {
        let message = seen.recv().await.unwrap();
        message["method"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_handshake_replays_documents_and_forwards_events() {
        let (file_tx, file_rx) = mpsc::channel(8);
        let mut options = ClientOptions::new(DocumentSelector::new(vec![DocumentFilter::file_language("sayo-asm")]));
        options.synchronize.file_events = Some(file_rx);
        let mut client = LanguageClient::new(
            "sayo-asm",
            "Sayo Assembly Language Server",
            ServerOptions::same(Executable::new("unused")),
            options,
        );
        let mut events = client.take_events().unwrap();
        let main = doc("main.asm", "sayo-asm");
        client.did_open(&main).await.unwrap();

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (seen_tx, mut seen) = mpsc::channel(32);
        let server = tokio::spawn(fake_server(server_read, server_write, seen_tx));

        let mut state = client.subscribe();
        client.launch(Box::new(move |router: Router| -> Result<ServerProcess> {
            Ok(ServerProcess::over_streams(client_read, client_write, router))
        }));
        state
            .wait_for(|s| *s == ClientState::Running)
            .await
            .unwrap();

        assert_eq!(next_method(&mut seen).await, "initialize");
        assert_eq!(next_method(&mut seen).await, "initialized");
        assert_eq!(next_method(&mut seen).await, "textDocument/didOpen");

        match events.recv().await {
            Some(LspEvent::Diagnostics { items, .. }) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].message(), "unknown mnemonic");
            }
            other => panic!("expected diagnostics, got {other:?}"),
        }

        let watched = std::env::temp_dir().join("boot.s");
        file_tx
            .send(FileEvent::new(watched, FileChangeKind::Created))
            .await
            .unwrap();
        assert_eq!(next_method(&mut seen).await, "workspace/didChangeWatchedFiles");

        client.did_change(&main.with_text("halt")).await.unwrap();
        assert_eq!(next_method(&mut seen).await, "textDocument/didChange");

        client.stop().await;
        assert_eq!(client.state(), ClientState::Stopped);
        assert_eq!(next_method(&mut seen).await, "shutdown");
        assert_eq!(next_method(&mut seen).await, "exit");
        server.await.unwrap();
        assert!(client.open_documents().await.is_empty());
    }
}
