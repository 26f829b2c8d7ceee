//! A JSON-RPC connection to a running server: writer task, reader task,
//! request/response correlation and inbound message routing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::client::ClientState;
use crate::codec::{MessageReader, MessageWriter};
use crate::host::OutputChannel;
use crate::options::TraceLevel;
use crate::protocol::{self, Incoming, Notification, PublishDiagnosticsParams, Request};
use crate::trace::Tracer;
use crate::transport::SpawnedServer;
use crate::types::{LspEvent, MessageType, ServerStopReason};

pub(crate) const INIT_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

const WRITER_CHANNEL_CAPACITY: usize = 64;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;

enum WriterCommand {
    Send(serde_json::Value),
    Close,
}

/// Where inbound messages go.
#[derive(Clone)]
pub(crate) struct Router {
    pub server_name: String,
    pub event_tx: mpsc::Sender<LspEvent>,
    pub output: Option<Arc<dyn OutputChannel>>,
    pub state: Arc<watch::Sender<ClientState>>,
    pub tracer: Tracer,
}

impl Router {
    fn log_output(&self, line: &str) {
        if let Some(output) = &self.output {
            output.append_line(line);
        }
    }

    async fn server_gone(&self, reason: ServerStopReason) {
        self.state.send_if_modified(|state| {
            if *state == ClientState::Running {
                *state = ClientState::Stopped;
                true
            } else {
                false
            }
        });
        let _ = self.event_tx.send(LspEvent::ServerStopped { reason }).await;
    }

    async fn dispatch(&self, message: &serde_json::Value, pending: &PendingMap, writer_tx: &mpsc::Sender<WriterCommand>) {
        let Some(incoming) = Incoming::classify(message) else {
            tracing::trace!("Ignoring malformed JSON-RPC message from '{}'", self.server_name);
            return;
        };

        match incoming {
            Incoming::Response { id, body } => {
                self.tracer.received_response(id, &body);
                let sender = pending.lock().await.remove(&id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(body);
                    }
                    None => tracing::debug!("Response for unknown request id {id}"),
                }
            }
            Incoming::Request { id, method, params } => {
                self.tracer.received_request(&method, &id, params.as_ref());
                let response = self.answer_server_request(id.clone(), &method, params.as_ref());
                self.tracer
                    .sending_response(&method, &id, response.get("result").or_else(|| response.get("error")));
                let _ = writer_tx.send(WriterCommand::Send(response)).await;
            }
            Incoming::Notification { method, params } => {
                self.tracer.received_notification(&method, params.as_ref());
                self.handle_notification(&method, params).await;
            }
        }
    }

    /// Requests the server may block on get a benign answer; everything else
    /// is "method not found".
    fn answer_server_request(
        &self,
        id: serde_json::Value,
        method: &str,
        params: Option<&serde_json::Value>,
    ) -> serde_json::Value {
        match method {
            "client/registerCapability"
            | "client/unregisterCapability"
            | "window/workDoneProgress/create" => {
                protocol::response_ok(id, serde_json::Value::Null)
            }
            "workspace/configuration" => {
                let items = params
                    .and_then(|p| p.get("items"))
                    .and_then(serde_json::Value::as_array)
                    .map_or(0, Vec::len);
                protocol::response_ok(id, serde_json::Value::Array(vec![serde_json::Value::Null; items]))
            }
            _ => {
                tracing::debug!(
                    "LSP '{}' sent request: {method}, replying method not found",
                    self.server_name
                );
                protocol::response_error(
                    id,
                    protocol::METHOD_NOT_FOUND,
                    &format!("Method not found: {method}"),
                )
            }
        }
    }

    async fn handle_notification(&self, method: &str, params: Option<serde_json::Value>) {
        match method {
            "textDocument/publishDiagnostics" => {
                let Some(params) = params else { return };
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(diag_params) => {
                        let Some(path) = protocol::file_uri_to_path(&diag_params.uri) else {
                            tracing::debug!("Diagnostics for non-file URI {}", diag_params.uri);
                            return;
                        };
                        let items = diag_params
                            .diagnostics
                            .iter()
                            .map(protocol::LspDiagnostic::to_diagnostic)
                            .collect();
                        let _ = self.event_tx.send(LspEvent::Diagnostics { path, items }).await;
                    }
                    Err(e) => {
                        tracing::debug!(
                            "Failed to parse publishDiagnostics from '{}': {e}",
                            self.server_name
                        );
                    }
                }
            }
            "window/logMessage" => {
                if let Some(msg) = params.and_then(|p| serde_json::from_value::<protocol::MessageParams>(p).ok()) {
                    self.log_output(&msg.message);
                }
            }
            "window/showMessage" => {
                if let Some(msg) = params.and_then(|p| serde_json::from_value::<protocol::MessageParams>(p).ok()) {
                    let _ = self
                        .event_tx
                        .send(LspEvent::ShowMessage {
                            kind: MessageType::from_lsp(msg.kind),
                            message: msg.message,
                        })
                        .await;
                }
            }
            _ => {
                tracing::trace!("Ignoring notification from '{}': {method}", self.server_name);
            }
        }
    }
}

/// Cloneable handle for sending requests and notifications.
#[derive(Clone)]
pub(crate) struct RpcHandle {
    writer_tx: mpsc::Sender<WriterCommand>,
    pending: PendingMap,
    next_id: Arc<AtomicU64>,
    tracer: Tracer,
}

impl RpcHandle {
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        self.tracer.sending_request(method, id, params.as_ref());
        let message = serde_json::to_value(Request::new(id, method, params)).context("serializing request")?;
        if self.writer_tx.send(WriterCommand::Send(message)).await.is_err() {
            self.pending.lock().await.remove(&id);
            bail!("writer channel closed");
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                bail!("connection closed before '{method}' was answered");
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                bail!("'{method}' timed out after {}s", timeout.as_secs());
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        self.tracer.sending_notification(method, params.as_ref());
        let message = serde_json::to_value(Notification::new(method, params))
            .context("serializing notification")?;
        self.writer_tx
            .send(WriterCommand::Send(message))
            .await
            .map_err(|_| anyhow!("writer channel closed"))
    }

    /// `initialize` request followed by the `initialized` notification.
    pub async fn initialize(&self, client_name: &str, roots: &[Url], trace: TraceLevel) -> Result<()> {
        let params = protocol::initialize_params(client_name, roots, trace);
        let response = self
            .request("initialize", Some(params), INIT_TIMEOUT)
            .await
            .context("initialize handshake")?;
        if let Some(message) = protocol::response_error_message(&response) {
            bail!("server rejected initialize: {message}");
        }
        self.notify("initialized", Some(serde_json::json!({}))).await
    }

    async fn close(&self) {
        let _ = self.writer_tx.send(WriterCommand::Close).await;
    }
}

/// Reader and writer tasks bound to one pair of streams.
pub(crate) struct Connection {
    rpc: RpcHandle,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl Connection {
    pub fn open<R, W>(reader: R, writer: W, router: Router) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);

        let writer_name = router.server_name.clone();
        let writer_handle = tokio::spawn(async move {
            let mut writer = MessageWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(message) => {
                        if let Err(e) = writer.write_message(&message).await {
                            tracing::warn!("LSP write error for '{writer_name}': {e:#}");
                            break;
                        }
                    }
                    WriterCommand::Close => {
                        let _ = writer.close().await;
                        break;
                    }
                }
            }
        });

        let rpc = RpcHandle {
            writer_tx: writer_tx.clone(),
            pending: pending.clone(),
            next_id: Arc::new(AtomicU64::new(1)),
            tracer: router.tracer.clone(),
        };

        let reader_handle = tokio::spawn(async move {
            let mut reader = MessageReader::new(reader);
            loop {
                match reader.read_message().await {
                    Ok(Some(message)) => router.dispatch(&message, &pending, &writer_tx).await,
                    Ok(None) => {
                        tracing::info!("LSP server '{}' closed stdout", router.server_name);
                        router.server_gone(ServerStopReason::Exited).await;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("LSP reader error for '{}': {e:#}", router.server_name);
                        router.log_output(&format!("Connection to server failed: {e:#}"));
                        router.server_gone(ServerStopReason::Failed(format!("{e:#}"))).await;
                        break;
                    }
                }
            }
            // Fail any request still waiting on this connection.
            pending.lock().await.clear();
        });

        Self {
            rpc,
            reader_handle,
            writer_handle,
        }
    }

    pub fn rpc(&self) -> &RpcHandle {
        &self.rpc
    }

    /// `shutdown` request, `exit` notification, then close our side.
    pub async fn shutdown(self) {
        match self.rpc.request("shutdown", None, SHUTDOWN_TIMEOUT).await {
            Ok(response) if protocol::response_error_message(&response).is_none() => {
                let _ = self.rpc.notify("exit", None).await;
            }
            Ok(_) => tracing::debug!("Server answered shutdown with an error"),
            Err(e) => tracing::debug!("Shutdown request failed: {e:#}"),
        }
        self.rpc.close().await;
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, self.writer_handle).await;
        self.reader_handle.abort();
    }
}

/// A server and its connection. `child` is absent for in-memory servers.
pub(crate) struct ServerProcess {
    name: String,
    child: Option<Child>,
    connection: Connection,
    stderr_handle: Option<JoinHandle<()>>,
}

impl ServerProcess {
    pub fn attach(spawned: SpawnedServer, router: Router) -> Self {
        let SpawnedServer {
            child,
            stdin,
            stdout,
            stderr,
        } = spawned;

        let name = router.server_name.clone();
        let output = router.output.clone();
        let stderr_name = name.clone();
        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "sayo_lsp_client::server_stderr", server = %stderr_name, "{line}");
                if let Some(output) = &output {
                    output.append_line(&line);
                }
            }
        });

        Self {
            name,
            child: Some(child),
            connection: Connection::open(stdout, stdin, router),
            stderr_handle: Some(stderr_handle),
        }
    }

    /// A server reached over arbitrary streams instead of a child process.
    #[cfg(test)]
    pub fn over_streams<R, W>(reader: R, writer: W, router: Router) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            name: router.server_name.clone(),
            child: None,
            connection: Connection::open(reader, writer, router),
            stderr_handle: None,
        }
    }

    pub fn rpc(&self) -> &RpcHandle {
        self.connection.rpc()
    }

    /// Graceful shutdown; kills the process if it outlives the grace period.
    pub async fn shutdown(mut self) {
        tracing::info!("Shutting down LSP server '{}'...", self.name);
        self.connection.shutdown().await;

        if let Some(child) = self.child.as_mut()
            && tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait())
                .await
                .is_err()
        {
            tracing::debug!("LSP '{}' didn't exit in time, killing", self.name);
            let _ = child.kill().await;
        }
        if let Some(handle) = self.stderr_handle {
            handle.abort();
        }
    }

    /// Immediate termination, used when the handshake never completed.
    pub async fn kill(mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill().await;
        }
        self.connection.reader_handle.abort();
        self.connection.writer_handle.abort();
        if let Some(handle) = self.stderr_handle {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        router: Router,
        pending: PendingMap,
        event_rx: mpsc::Receiver<LspEvent>,
        writer_tx: mpsc::Sender<WriterCommand>,
        writer_rx: mpsc::Receiver<WriterCommand>,
        state_rx: watch::Receiver<ClientState>,
    }

    fn fixture() -> Fixture {
        let (event_tx, event_rx) = mpsc::channel(32);
        let (writer_tx, writer_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(ClientState::Running);
        Fixture {
            router: Router {
                server_name: "test".to_string(),
                event_tx,
                output: None,
                state: Arc::new(state_tx),
                tracer: Tracer::default(),
            },
            pending: Arc::new(Mutex::new(HashMap::new())),
            event_rx,
            writer_tx,
            writer_rx,
            state_rx,
        }
    }

    fn sent(cmd: WriterCommand) -> serde_json::Value {
        match cmd {
            WriterCommand::Send(v) => v,
            WriterCommand::Close => panic!("expected Send, got Close"),
        }
    }

    #[tokio::test]
    async fn test_response_routes_to_pending() {
        let f = fixture();
        let (tx, rx) = oneshot::channel();
        f.pending.lock().await.insert(1, tx);

        let msg = serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {"capabilities": {}}});
        f.router.dispatch(&msg, &f.pending, &f.writer_tx).await;

        assert!(rx.await.unwrap()["result"]["capabilities"].is_object());
        assert!(f.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_diagnostics_becomes_event() {
        let mut f = fixture();
        #[cfg(windows)]
        let uri = "file:///C:/fw/main.asm";
        #[cfg(not(windows))]
        let uri = "file:///fw/main.asm";

        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {
                "uri": uri,
                "diagnostics": [{
                    "range": { "start": { "line": 5, "character": 0 }, "end": { "line": 5, "character": 4 } },
                    "severity": 1,
                    "source": "sayo-sema",
                    "message": "undefined label `loop`"
                }]
            }
        });
        f.router.dispatch(&msg, &f.pending, &f.writer_tx).await;

        match f.event_rx.try_recv().unwrap() {
            LspEvent::Diagnostics { path, items } => {
                assert!(path.ends_with("main.asm"));
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].message(), "undefined label `loop`");
                assert!(items[0].severity().is_error());
            }
            other => panic!("expected Diagnostics, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_show_message_becomes_event() {
        let mut f = fixture();
        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "window/showMessage",
            "params": { "type": 2, "message": "device not connected" }
        });
        f.router.dispatch(&msg, &f.pending, &f.writer_tx).await;

        match f.event_rx.try_recv().unwrap() {
            LspEvent::ShowMessage { kind, message } => {
                assert_eq!(kind, MessageType::Warning);
                assert_eq!(message, "device not connected");
            }
            other => panic!("expected ShowMessage, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_server_request_gets_method_not_found() {
        let mut f = fixture();
        let msg = serde_json::json!({"jsonrpc": "2.0", "id": 5, "method": "workspace/applyEdit", "params": {}});
        f.router.dispatch(&msg, &f.pending, &f.writer_tx).await;

        let response = sent(f.writer_rx.try_recv().unwrap());
        assert_eq!(response["id"], 5);
        assert_eq!(response["error"]["code"], protocol::METHOD_NOT_FOUND);
        assert!(
            response["error"]["message"]
                .as_str()
                .unwrap()
                .contains("workspace/applyEdit")
        );
    }

    #[tokio::test]
    async fn test_registration_and_configuration_requests_are_answered() {
        let mut f = fixture();
        let register = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "client/registerCapability", "params": {"registrations": []}});
        f.router.dispatch(&register, &f.pending, &f.writer_tx).await;
        let response = sent(f.writer_rx.try_recv().unwrap());
        assert!(response["result"].is_null());
        assert!(response.get("error").is_none());

        let config = serde_json::json!({
            "jsonrpc": "2.0", "id": 2, "method": "workspace/configuration",
            "params": {"items": [{"section": "sayo-asm"}, {"section": "editor"}]}
        });
        f.router.dispatch(&config, &f.pending, &f.writer_tx).await;
        let response = sent(f.writer_rx.try_recv().unwrap());
        assert_eq!(response["result"], serde_json::json!([null, null]));
    }

    #[tokio::test]
    async fn test_unknown_notification_is_ignored() {
        let mut f = fixture();
        let msg = serde_json::json!({"jsonrpc": "2.0", "method": "$/progress", "params": {}});
        f.router.dispatch(&msg, &f.pending, &f.writer_tx).await;
        assert!(f.event_rx.try_recv().is_err());
        assert!(f.writer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_gone_marks_running_client_stopped() {
        let mut f = fixture();
        f.router.server_gone(ServerStopReason::Exited).await;
        assert_eq!(*f.state_rx.borrow(), ClientState::Stopped);
        assert!(matches!(
            f.event_rx.try_recv().unwrap(),
            LspEvent::ServerStopped {
                reason: ServerStopReason::Exited
            }
        ));
    }

    #[tokio::test]
    async fn test_request_over_duplex_gets_response() {
        let f = fixture();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let connection = Connection::open(client_read, client_write, f.router.clone());

        let server = tokio::spawn(async move {
            let mut reader = MessageReader::new(server_read);
            let mut writer = MessageWriter::new(server_write);
            let request = reader.read_message().await.unwrap().unwrap();
            assert_eq!(request["method"], "sayo/ping");
            writer
                .write_message(&serde_json::json!({"jsonrpc": "2.0", "id": request["id"], "result": "pong"}))
                .await
                .unwrap();
        });

        let response = connection
            .rpc()
            .request("sayo/ping", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response["result"], "pong");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_fails_when_peer_closes() {
        let f = fixture();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let connection = Connection::open(client_read, client_write, f.router.clone());
        drop(server_io);

        let result = connection
            .rpc()
            .request("sayo/ping", None, Duration::from_secs(5))
            .await;
        assert!(result.is_err());
    }
}
