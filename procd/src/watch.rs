//! Filesystem watching for apps with `watch` enabled
//!
//! The notify callback only forwards changed paths over a channel; the
//! supervisor drains it on every tick and restarts the app once changes
//! have been quiet for the debounce period.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Path fragments that never trigger a restart
const ALWAYS_IGNORED: &[&str] = &["node_modules", ".git"];

/// Watches one app's working directory
pub struct AppWatcher {
    _watcher: RecommendedWatcher,
    rx: Receiver<PathBuf>,
    filter: ChangeFilter,
    debounce: ChangeDebounce,
}

impl AppWatcher {
    /// Start watching `root` recursively
    pub fn start(root: &Path, filter: ChangeFilter) -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => warn!("Watcher error: {e}"),
            })?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        Ok(Self {
            _watcher: watcher,
            rx,
            filter,
            debounce: ChangeDebounce::default(),
        })
    }

    /// Drain pending events; true once a relevant change has settled
    pub fn poll(&mut self, now: Instant, quiet: Duration) -> bool {
        while let Ok(path) = self.rx.try_recv() {
            if self.filter.is_ignored(&path) {
                continue;
            }
            debug!("Change detected: {}", path.display());
            self.debounce.record(now);
        }
        self.debounce.ready(now, quiet)
    }
}

/// Decides which changed paths matter
#[derive(Debug, Clone, Default)]
pub struct ChangeFilter {
    fragments: Vec<String>,
    files: Vec<PathBuf>,
}

impl ChangeFilter {
    /// `fragments` match any path component; `files` match exact paths
    pub fn new(fragments: Vec<String>, files: Vec<PathBuf>) -> Self {
        Self { fragments, files }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        if self.files.iter().any(|file| paths_match(file, path)) {
            return true;
        }
        path.components().any(|component| {
            let part = component.as_os_str().to_string_lossy();
            ALWAYS_IGNORED.contains(&part.as_ref())
                || self.fragments.iter().any(|fragment| part == fragment.as_str())
        })
    }
}

fn paths_match(expected: &Path, actual: &Path) -> bool {
    expected == actual
        || matches!(
            (expected.canonicalize(), actual.canonicalize()),
            (Ok(a), Ok(b)) if a == b
        )
}

/// Coalesces bursts of changes into one restart
#[derive(Debug, Default, Clone, Copy)]
pub struct ChangeDebounce {
    last_change: Option<Instant>,
}

impl ChangeDebounce {
    pub fn record(&mut self, at: Instant) {
        self.last_change = Some(at);
    }

    /// True (once) when the last change is at least `quiet` old
    pub fn ready(&mut self, now: Instant, quiet: Duration) -> bool {
        match self.last_change {
            Some(at) if now.saturating_duration_since(at) >= quiet => {
                self.last_change = None;
                true
            }
            _ => false,
        }
    }
}
