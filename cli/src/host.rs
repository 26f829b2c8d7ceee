//! Terminal implementation of the editor host capabilities.

use std::path::PathBuf;
use std::sync::Arc;

use sayo_config::Settings;
use sayo_lsp_client::{
    Configuration, FileEvents, FileSystemWatcher, OutputChannel, Window, Workspace,
};
use tokio::sync::mpsc;

use crate::watcher::{DEBOUNCE, NotifyWatcher};

/// Output channel forwarding each line to the log.
struct LogChannel {
    name: String,
}

impl OutputChannel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn append_line(&self, line: &str) {
        tracing::info!(target: "sayo_host::output", channel = %self.name, "{line}");
    }
}

pub struct HeadlessHost {
    settings: Settings,
    roots: Vec<PathBuf>,
    watcher: NotifyWatcher,
}

impl HeadlessHost {
    pub fn new(settings: Settings, roots: Vec<PathBuf>) -> Self {
        let watcher = NotifyWatcher::new(roots.clone(), DEBOUNCE);
        Self {
            settings,
            roots,
            watcher,
        }
    }
}

impl Configuration for HeadlessHost {
    fn get(&self, key: &str) -> Option<String> {
        self.settings.get(key)
    }
}

impl Workspace for HeadlessHost {
    fn workspace_roots(&self) -> Vec<PathBuf> {
        self.roots.clone()
    }
}

impl FileSystemWatcher for HeadlessHost {
    fn watch(&self, glob: &str) -> FileEvents {
        match self.watcher.spawn(glob) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!("File watching disabled: {e:#}");
                mpsc::channel(1).1
            }
        }
    }
}

impl Window for HeadlessHost {
    fn show_error_message(&self, message: &str) {
        tracing::error!("{message}");
        eprintln!("error: {message}");
    }

    fn create_output_channel(&self, name: &str) -> Arc<dyn OutputChannel> {
        Arc::new(LogChannel {
            name: name.to_string(),
        })
    }
}
