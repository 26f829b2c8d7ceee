//! File watcher backed by `notify`.
//!
//! `notify-debouncer-mini` folds bursts of kernel events into one event per
//! path. Paths matching the glob (relative to their workspace root) are
//! forwarded on a [`FileEvents`] channel. Debounced events carry no change
//! kind, so the kind is derived from whether the path still exists and
//! whether it was seen before.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobMatcher};
use ignore::WalkBuilder;
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use sayo_lsp_client::{FileChangeKind, FileEvent, FileEvents};
use tokio::sync::mpsc;

/// Quiet period before a burst of changes to one path is reported.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct NotifyWatcher {
    roots: Vec<PathBuf>,
    debounce: Duration,
    active: Mutex<Vec<Debouncer<RecommendedWatcher>>>,
}

impl NotifyWatcher {
    pub fn new(roots: Vec<PathBuf>, debounce: Duration) -> Self {
        Self {
            roots,
            debounce,
            active: Mutex::new(Vec::new()),
        }
    }

    /// Start watching every root for paths matching `glob`.
    ///
    /// The underlying watcher lives as long as `self`; events stop once the
    /// receiver is dropped.
    pub fn spawn(&self, glob: &str) -> Result<FileEvents> {
        let matcher = GlobBuilder::new(glob)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid watch glob {glob:?}"))?
            .compile_matcher();

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut tracker = Tracker::new(self.roots.clone(), matcher);
        tracker.seed();

        let mut debouncer = new_debouncer(self.debounce, move |res: DebounceEventResult| {
            match res {
                Ok(events) => {
                    let paths: Vec<PathBuf> = events.into_iter().map(|e| e.path).collect();
                    for event in tracker.translate(&paths) {
                        // Runs on the debouncer's own thread, outside the runtime.
                        if tx.blocking_send(event).is_err() {
                            tracing::debug!("File event receiver dropped");
                            break;
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "File watch error"),
            }
        })
        .context("creating file watcher")?;

        for root in &self.roots {
            debouncer
                .watcher()
                .watch(root, RecursiveMode::Recursive)
                .with_context(|| format!("watching {}", root.display()))?;
        }
        tracing::debug!(
            glob,
            roots = self.roots.len(),
            debounce_ms = self.debounce.as_millis(),
            "Started file watcher"
        );

        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(debouncer);
        Ok(rx)
    }
}

/// Turns debounced paths into typed file events.
struct Tracker {
    roots: Vec<PathBuf>,
    matcher: GlobMatcher,
    known: HashSet<PathBuf>,
}

impl Tracker {
    fn new(roots: Vec<PathBuf>, matcher: GlobMatcher) -> Self {
        Self {
            roots,
            matcher,
            known: HashSet::new(),
        }
    }

    /// Record the matching files that already exist, honoring `.gitignore`,
    /// so their first write reports `Changed` rather than `Created`.
    fn seed(&mut self) {
        for root in &self.roots {
            for entry in WalkBuilder::new(root).build().flatten() {
                if entry.file_type().is_some_and(|t| t.is_file())
                    && matches_relative(root, entry.path(), &self.matcher)
                {
                    self.known.insert(entry.path().to_path_buf());
                }
            }
        }
        tracing::debug!(files = self.known.len(), "Seeded file watcher");
    }

    fn matches(&self, path: &Path) -> bool {
        self.roots
            .iter()
            .any(|root| path.starts_with(root) && matches_relative(root, path, &self.matcher))
    }

    /// Events for `paths`, ordered by path.
    fn translate(&mut self, paths: &[PathBuf]) -> Vec<FileEvent> {
        let mut events: Vec<FileEvent> = paths
            .iter()
            .filter_map(|path| {
                if !self.matches(path) {
                    return None;
                }
                let kind = self.classify(path)?;
                Some(FileEvent::new(path.clone(), kind))
            })
            .collect();
        events.sort_by(|a, b| a.path.cmp(&b.path));
        events.dedup();
        events
    }

    fn classify(&mut self, path: &Path) -> Option<FileChangeKind> {
        if path.is_file() {
            if self.known.insert(path.to_path_buf()) {
                Some(FileChangeKind::Created)
            } else {
                Some(FileChangeKind::Changed)
            }
        } else if path.exists() {
            None
        } else {
            // Also reported when the file came and went within one debounce window.
            self.known.remove(path);
            Some(FileChangeKind::Deleted)
        }
    }
}

fn matches_relative(root: &Path, path: &Path, matcher: &GlobMatcher) -> bool {
    matcher.is_match(path.strip_prefix(root).unwrap_or(path))
}
