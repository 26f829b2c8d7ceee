//! JSON-RPC envelopes and LSP parameter builders used by the client.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::options::TraceLevel;
use crate::types::{Diagnostic, DiagnosticSeverity, FileEvent};

pub(crate) const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC "method not found".
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// A message received from the server, classified by shape.
#[derive(Debug)]
pub(crate) enum Incoming {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    Request {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

impl Incoming {
    pub fn classify(message: &serde_json::Value) -> Option<Self> {
        let id = message.get("id");
        let method = message
            .get("method")
            .and_then(serde_json::Value::as_str)
            .map(String::from);
        let is_response = message.get("result").is_some() || message.get("error").is_some();
        let params = message.get("params").cloned();

        match (id, method, is_response) {
            (Some(id), None, true) => Some(Self::Response {
                id: id.as_u64()?,
                body: message.clone(),
            }),
            (Some(id), Some(method), _) => Some(Self::Request {
                id: id.clone(),
                method,
                params,
            }),
            (None, Some(method), _) => Some(Self::Notification { method, params }),
            _ => None,
        }
    }
}

pub(crate) fn response_ok(id: serde_json::Value, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

pub(crate) fn response_error(id: serde_json::Value, code: i64, message: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message },
    })
}

/// Error message carried by a response, if it is an error response.
pub(crate) fn response_error_message(response: &serde_json::Value) -> Option<String> {
    let error = response.get("error")?;
    Some(
        error
            .get("message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
    )
}

pub(crate) fn initialize_params(
    client_name: &str,
    roots: &[Url],
    trace: TraceLevel,
) -> serde_json::Value {
    let workspace_folders: Vec<serde_json::Value> = roots
        .iter()
        .map(|uri| {
            let name = uri
                .path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
                .unwrap_or("workspace");
            serde_json::json!({ "uri": uri.as_str(), "name": name })
        })
        .collect();

    serde_json::json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": client_name,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "rootUri": roots.first().map(Url::as_str),
        "workspaceFolders": if workspace_folders.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::Value::Array(workspace_folders)
        },
        "trace": trace.as_str(),
        "capabilities": {
            "workspace": {
                "didChangeWatchedFiles": { "dynamicRegistration": false },
                "workspaceFolders": true,
                "configuration": true
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "publishDiagnostics": { "relatedInformation": false }
            },
            "window": { "workDoneProgress": true }
        }
    })
}

pub(crate) fn did_open_params(uri: &Url, language_id: &str, version: i32, text: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri.as_str(),
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &Url, version: i32, text: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri.as_str(), "version": version },
        "contentChanges": [{ "text": text }]
    })
}

pub(crate) fn did_close_params(uri: &Url) -> serde_json::Value {
    serde_json::json!({ "textDocument": { "uri": uri.as_str() } })
}

/// `workspace/didChangeWatchedFiles` params; events whose path cannot be a URI are dropped.
pub(crate) fn did_change_watched_files_params(events: &[FileEvent]) -> serde_json::Value {
    let changes: Vec<serde_json::Value> = events
        .iter()
        .filter_map(|event| {
            let uri = path_to_file_uri(&event.path).ok()?;
            Some(serde_json::json!({ "uri": uri.as_str(), "type": event.kind as u8 }))
        })
        .collect();
    serde_json::json!({ "changes": changes })
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: LspRange,
    pub severity: Option<u64>,
    pub source: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspRange {
    pub start: LspPosition,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspPosition {
    pub line: u32,
    pub character: u32,
}

impl LspDiagnostic {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::new(
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            self.message.clone(),
            self.range.start.line,
            self.range.start.character,
            self.source.clone().unwrap_or_else(|| String::from("sayo-lsp")),
        )
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageParams {
    #[serde(rename = "type")]
    pub kind: u64,
    pub message: String,
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<Url, PathToUriError> {
    Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    Url::parse(uri).ok().and_then(|u| u.to_file_path().ok())
}
