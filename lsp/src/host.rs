//! Capabilities the editor host provides to the extension.
//!
//! The session manager only talks to the host through these traits, so
//! tests can drive activation with in-memory fakes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::types::{FileEvent, MessageType};

/// Stream of file-system changes produced by a host watcher.
pub type FileEvents = mpsc::Receiver<FileEvent>;

/// Read-only access to user/workspace settings by dotted key.
pub trait Configuration {
    fn get(&self, key: &str) -> Option<String>;
}

/// The folders currently open in the editor, in host order.
pub trait Workspace {
    fn workspace_roots(&self) -> Vec<PathBuf>;
}

/// Creates file-system watchers scoped by a glob such as `**/*.{s,asm}`.
pub trait FileSystemWatcher {
    fn watch(&self, glob: &str) -> FileEvents;
}

/// A named, append-only log sink shown to the user.
pub trait OutputChannel: Send + Sync {
    fn name(&self) -> &str;
    fn append_line(&self, line: &str);
}

/// User-facing notifications and output channels.
pub trait Window {
    fn show_error_message(&self, message: &str);

    /// A server-originated message. Hosts without a notification area for
    /// non-errors may rely on this default, which only logs them.
    fn show_message(&self, kind: MessageType, message: &str) {
        match kind {
            MessageType::Error => self.show_error_message(message),
            MessageType::Warning => tracing::warn!("{message}"),
            _ => tracing::info!("{message}"),
        }
    }

    fn create_output_channel(&self, name: &str) -> Arc<dyn OutputChannel>;
}

/// Everything activation needs from the host.
pub trait ExtensionHost: Configuration + Workspace + FileSystemWatcher + Window {}

impl<T: Configuration + Workspace + FileSystemWatcher + Window> ExtensionHost for T {}

/// Per-extension facts supplied at activation.
#[derive(Debug, Clone)]
pub struct ExtensionContext {
    extension_path: PathBuf,
}

impl ExtensionContext {
    #[must_use]
    pub fn new(extension_path: impl Into<PathBuf>) -> Self {
        Self {
            extension_path: extension_path.into(),
        }
    }

    /// Install directory of the extension; bundled binaries live under `bin/`.
    #[must_use]
    pub fn extension_path(&self) -> &Path {
        &self.extension_path
    }
}
