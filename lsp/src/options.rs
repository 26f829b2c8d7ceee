//! Client-side options: which documents the client handles, which file
//! events it forwards, and where its logs go.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use globset::{Glob, GlobMatcher};

use crate::host::{FileEvents, OutputChannel};
use crate::types::TextDocument;

/// Verbosity of the protocol trace sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TraceLevel {
    #[default]
    Off,
    Messages,
    Verbose,
}

impl TraceLevel {
    /// Parse a trace setting value.
    ///
    /// Only `off` disables tracing; any other value turns it on, with
    /// `verbose` additionally logging message payloads.
    #[must_use]
    pub fn from_setting(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Self::Off,
            "verbose" => Self::Verbose,
            _ => Self::Messages,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Messages => "messages",
            Self::Verbose => "verbose",
        }
    }

    #[must_use]
    pub fn is_enabled(self) -> bool {
        self != Self::Off
    }
}

impl fmt::Display for TraceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a document selector. Unset fields match anything.
#[derive(Debug, Clone)]
pub struct DocumentFilter {
    scheme: Option<String>,
    language: Option<String>,
    pattern: Option<GlobMatcher>,
}

impl DocumentFilter {
    /// Filter matching `file://` documents of the given language.
    #[must_use]
    pub fn file_language(language: impl Into<String>) -> Self {
        Self {
            scheme: Some("file".to_string()),
            language: Some(language.into()),
            pattern: None,
        }
    }

    /// Additionally require the document path to match a glob.
    pub fn with_pattern(mut self, pattern: &str) -> Result<Self, globset::Error> {
        self.pattern = Some(Glob::new(pattern)?.compile_matcher());
        Ok(self)
    }

    #[must_use]
    pub fn matches(&self, document: &TextDocument) -> bool {
        if let Some(scheme) = &self.scheme
            && document.uri().scheme() != scheme
        {
            return false;
        }
        if let Some(language) = &self.language
            && document.language_id() != language
        {
            return false;
        }
        match &self.pattern {
            Some(glob) => document
                .uri()
                .to_file_path()
                .is_ok_and(|path| glob.is_match(path)),
            None => true,
        }
    }
}

/// The set of documents a client is responsible for.
#[derive(Debug, Clone, Default)]
pub struct DocumentSelector(Vec<DocumentFilter>);

impl DocumentSelector {
    #[must_use]
    pub fn new(filters: Vec<DocumentFilter>) -> Self {
        Self(filters)
    }

    /// A document is selected when any filter matches it.
    #[must_use]
    pub fn matches(&self, document: &TextDocument) -> bool {
        self.0.iter().any(|filter| filter.matches(document))
    }
}

/// What the client keeps in sync with the server besides open documents.
#[derive(Default)]
pub struct SynchronizeOptions {
    /// Host watcher stream forwarded as `workspace/didChangeWatchedFiles`.
    pub file_events: Option<FileEvents>,
}

/// Options for a [`LanguageClient`](crate::LanguageClient).
pub struct ClientOptions {
    pub document_selector: DocumentSelector,
    pub synchronize: SynchronizeOptions,
    /// Receives server stderr, `window/logMessage` and start failures.
    pub output_channel: Option<Arc<dyn OutputChannel>>,
    /// Receives the protocol trace; no trace is written without it.
    pub trace_output_channel: Option<Arc<dyn OutputChannel>>,
    pub trace: TraceLevel,
    /// Folders announced to the server in `initialize`.
    pub workspace_folders: Vec<PathBuf>,
}

impl ClientOptions {
    #[must_use]
    pub fn new(document_selector: DocumentSelector) -> Self {
        Self {
            document_selector,
            synchronize: SynchronizeOptions::default(),
            output_channel: None,
            trace_output_channel: None,
            trace: TraceLevel::Off,
            workspace_folders: Vec::new(),
        }
    }
}
