//! File watcher that triggers worker replacement.
//!
//! Reports files under a root directory whose names match a set of patterns.
//! Bursts of events are debounced, and events are dropped while paused.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer, notify::RecursiveMode};
use regex::Regex;
use tokio::sync::mpsc;

use crate::config::WatchOptions;
use crate::error::{Error, Result};

/// Translate a file name pattern into an anchored regex.
///
/// `*` matches zero or more characters, `?` zero or one; everything else is
/// literal.
pub fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push_str(".?"),
            other => regex.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    regex.push('$');
    regex
}

/// File name filter compiled once from glob patterns.
#[derive(Debug, Clone)]
pub struct NameFilter {
    patterns: Vec<Regex>,
}

impl NameFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(&glob_to_regex(p.as_ref())).map_err(|e| {
                    Error::Config(format!("invalid watch pattern {:?}: {}", p.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Whether the file name of `path` matches any pattern.
    pub fn matches(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        self.patterns.iter().any(|p| p.is_match(name))
    }
}

/// File watcher handle.
pub struct FileWatcher {
    /// Debouncer handle (kept alive to maintain the watch).
    debouncer: Debouncer<notify::RecommendedWatcher>,
    root: PathBuf,
    mode: RecursiveMode,
    paused: Arc<AtomicBool>,
    rx: mpsc::UnboundedReceiver<PathBuf>,
}

impl FileWatcher {
    /// Start watching `root` with the patterns and mode from `options`.
    pub fn new(root: impl AsRef<Path>, options: &WatchOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let filter = NameFilter::new(&options.patterns)?;
        let paused = Arc::new(AtomicBool::new(false));
        let mode = if options.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let gate = paused.clone();
        let mut debouncer = new_debouncer(
            Duration::from_millis(options.debounce_ms),
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    if gate.load(Ordering::Acquire) {
                        return;
                    }
                    // One notification per batch; the first matching path names it.
                    if let Some(event) = events.iter().find(|e| filter.matches(&e.path)) {
                        let _ = tx.send(event.path.clone());
                    }
                }
                Err(e) => tracing::warn!("File watch error: {}", e),
            },
        )?;

        debouncer.watcher().watch(&root, mode)?;

        Ok(Self {
            debouncer,
            root,
            mode,
            paused,
            rx,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Receive the next matching change.
    pub async fn recv(&mut self) -> Option<PathBuf> {
        self.rx.recv().await
    }

    /// Stop watching until [`Self::resume`].
    pub fn pause(&mut self) {
        self.paused.store(true, Ordering::Release);
        if let Err(e) = self.debouncer.watcher().unwatch(&self.root) {
            tracing::warn!("Failed to pause watching {}: {}", self.root.display(), e);
        }
    }

    /// Drop changes queued while paused and watch again.
    pub fn resume(&mut self) {
        while self.rx.try_recv().is_ok() {}
        if let Err(e) = self.debouncer.watcher().watch(&self.root, self.mode) {
            tracing::error!("Failed to resume watching {}: {}", self.root.display(), e);
        }
        self.paused.store(false, Ordering::Release);
    }
}
