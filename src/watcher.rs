//! Directory change watcher.
//!
//! Watches a list of directories (non-recursively) and reports files that
//! were modified since the previous report. Change bursts are debounced:
//! a report is made once the directories have been quiet for the debounce
//! interval.
//!
//! The watch list is shared with the watcher thread behind a mutex; every
//! change to it wakes the thread, which rebuilds its OS watch set.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

/// Debounce and idle intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchTiming {
    /// Quiet period after a change before reporting.
    pub debounce: Duration,
    /// Wake-up interval when nothing is pending.
    pub idle: Duration,
}

impl Default for WatchTiming {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(150),
            idle: Duration::from_millis(500),
        }
    }
}

enum Wake {
    Fs(notify::Result<Event>),
    ListChanged,
    Stop,
}

/// Reports modified files in watched directories to a callback.
pub struct FileChangeWatcher {
    list: Arc<Mutex<Vec<PathBuf>>>,
    wake: Sender<Wake>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for FileChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChangeWatcher")
            .field("watched", &self.watched())
            .finish_non_exhaustive()
    }
}

impl FileChangeWatcher {
    /// Start the watcher thread with default timing.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS file watcher cannot be initialized.
    pub fn start(on_change: impl Fn(Vec<PathBuf>) + Send + 'static) -> Result<Self> {
        Self::with_timing(WatchTiming::default(), on_change)
    }

    pub fn with_timing(timing: WatchTiming, on_change: impl Fn(Vec<PathBuf>) + Send + 'static) -> Result<Self> {
        let (wake, wakes) = mpsc::channel();
        let fs_wake = wake.clone();
        let watcher = notify::recommended_watcher(move |res| {
            let _ = fs_wake.send(Wake::Fs(res));
        })
        .context("Failed to create file watcher")?;

        let list = Arc::new(Mutex::new(Vec::new()));
        let thread_list = Arc::clone(&list);
        let thread = thread::Builder::new()
            .name("pipebridge-watcher".into())
            .spawn(move || {
                WatchLoop {
                    watcher,
                    list: thread_list,
                    active: Vec::new(),
                    dirty: HashSet::new(),
                    last_update: SystemTime::now(),
                    timing,
                }
                .run(wakes, on_change)
            })
            .context("Failed to spawn watcher thread")?;

        Ok(Self {
            list,
            wake,
            thread: Some(thread),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `dir` to the watch list. Returns false if it was already there.
    pub fn watch(&self, dir: impl AsRef<Path>) -> bool {
        let dir = normalize(dir.as_ref());
        {
            let mut list = self.lock();
            if list.contains(&dir) {
                return false;
            }
            list.push(dir);
        }
        let _ = self.wake.send(Wake::ListChanged);
        true
    }

    /// Remove `dir` from the watch list. Returns false if it was not there.
    pub fn unwatch(&self, dir: impl AsRef<Path>) -> bool {
        let dir = normalize(dir.as_ref());
        {
            let mut list = self.lock();
            let before = list.len();
            list.retain(|watched| *watched != dir);
            if list.len() == before {
                return false;
            }
        }
        let _ = self.wake.send(Wake::ListChanged);
        true
    }

    pub fn watched(&self) -> Vec<PathBuf> {
        self.lock().clone()
    }
}

impl Drop for FileChangeWatcher {
    fn drop(&mut self) {
        let _ = self.wake.send(Wake::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Drop trailing separators and redundant `.` components.
fn normalize(dir: &Path) -> PathBuf {
    dir.components().collect()
}

struct WatchLoop {
    watcher: RecommendedWatcher,
    list: Arc<Mutex<Vec<PathBuf>>>,
    active: Vec<PathBuf>,
    dirty: HashSet<PathBuf>,
    last_update: SystemTime,
    timing: WatchTiming,
}

impl WatchLoop {
    fn run(mut self, wakes: Receiver<Wake>, on_change: impl Fn(Vec<PathBuf>)) {
        loop {
            let timeout = if self.dirty.is_empty() {
                self.timing.idle
            } else {
                self.timing.debounce
            };

            match wakes.recv_timeout(timeout) {
                Ok(Wake::Fs(Ok(event))) => self.note(event),
                Ok(Wake::Fs(Err(e))) => warn!("File watcher error: {}", e),
                Ok(Wake::ListChanged) => self.sync(),
                Ok(Wake::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if !self.dirty.is_empty() {
                        let files = self.scan();
                        if !files.is_empty() {
                            on_change(files);
                        }
                    }
                }
            }
        }
        debug!("Watcher thread stopped");
    }

    /// Rebuild the OS watch set from the shared list.
    fn sync(&mut self) {
        let wanted = self.list.lock().unwrap_or_else(PoisonError::into_inner).clone();

        for dir in self.active.iter().filter(|dir| !wanted.contains(dir)) {
            let _ = self.watcher.unwatch(dir);
        }
        self.active.retain(|dir| wanted.contains(dir));
        self.dirty.retain(|dir| wanted.contains(dir));

        for dir in wanted {
            if self.active.contains(&dir) {
                continue;
            }
            match self.watcher.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    info!("Watching for file changes: {}", dir.display());
                    self.active.push(dir);
                }
                Err(e) => warn!("Failed to watch {}: {}", dir.display(), e),
            }
        }
    }

    fn note(&mut self, event: Event) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }
        for path in event.paths {
            let dir = if self.active.contains(&path) {
                Some(path.as_path())
            } else {
                path.parent()
            };
            if let Some(dir) = dir.filter(|dir| self.active.iter().any(|active| active == dir)) {
                self.dirty.insert(dir.to_path_buf());
            }
        }
    }

    /// Files in dirty directories modified after the previous report.
    fn scan(&mut self) -> Vec<PathBuf> {
        let since = self.last_update;
        self.last_update = SystemTime::now();

        let mut files = Vec::new();
        for dir in self.dirty.drain() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Failed to scan {}: {}", dir.display(), e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                let modified = metadata.modified().is_ok_and(|mtime| mtime > since);
                if metadata.is_file() && modified {
                    files.push(entry.path());
                }
            }
        }
        files.sort();
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn quiet() -> FileChangeWatcher {
        FileChangeWatcher::start(|_| {}).expect("Should create watcher")
    }

    #[test]
    fn test_watch_strips_trailing_separator_and_dedupes() {
        let watcher = quiet();
        assert!(watcher.watch("/tmp/project/"));
        assert!(!watcher.watch("/tmp/project"));
        assert!(!watcher.watch("/tmp//project/"));
        assert_eq!(watcher.watched(), vec![PathBuf::from("/tmp/project")]);
    }

    #[test]
    fn test_unwatch() {
        let watcher = quiet();
        watcher.watch("/tmp/a");
        watcher.watch("/tmp/b");
        assert!(watcher.unwatch("/tmp/a/"));
        assert!(!watcher.unwatch("/tmp/a"));
        assert_eq!(watcher.watched(), vec![PathBuf::from("/tmp/b")]);
    }

    #[test]
    fn test_reports_modified_file() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel();
        let watcher = FileChangeWatcher::start(move |files| {
            let _ = tx.send(files);
        })
        .expect("Should create watcher");

        assert!(watcher.watch(dir.path()));
        // Let the thread register the OS watch.
        thread::sleep(Duration::from_millis(200));

        let file = dir.path().join("data.csv");
        std::fs::write(&file, "a,b\n1,2\n").unwrap();

        let files = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("change reported");
        assert!(files.iter().any(|path| path.file_name() == file.file_name()));
    }
}
