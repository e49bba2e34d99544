//! Working directory watcher
//!
//! Filesystem events from `notify` are coalesced on a dedicated thread: a
//! burst of events becomes one [`ChangeBatch`] once the directory has been
//! quiet for the debounce window. Batches go to a caller-supplied sink.
//!
//! ```text
//! Idle -> Watching -> Debouncing -> CommitTriggered -> Watching
//!                 \______________________________________-> Stopped
//! ```

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::lock::LOCK_FILENAME;
use crate::site::{BUNDLE_FILENAME, PUSH_BUNDLE_FILENAME, SITE_MARKER_FILENAME};

/// Files written by the sync engine itself
const IGNORED_FILES: &[&str] = &[
    LOCK_FILENAME,
    SITE_MARKER_FILENAME,
    BUNDLE_FILENAME,
    PUSH_BUNDLE_FILENAME,
];

/// How often the loop wakes up when nothing is pending
const IDLE_TICK: Duration = Duration::from_millis(500);

/// A steady stream of events still flushes after this many debounce windows
const MAX_DELAY_FACTOR: u32 = 10;

/// Relative paths that changed during one settled burst
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub paths: BTreeSet<PathBuf>,
}

impl ChangeBatch {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Watching,
    Debouncing,
    CommitTriggered,
    Stopped,
}

/// Watches a directory tree and emits debounced change batches
pub struct ChangeWatcher {
    state: Arc<Mutex<WatcherState>>,
    watcher: Option<RecommendedWatcher>,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Start watching `root` recursively
    ///
    /// `sink` runs on the watcher thread, once per settled batch.
    pub fn start<F>(root: &Path, debounce: Duration, sink: F) -> SyncResult<Self>
    where
        F: FnMut(ChangeBatch) + Send + 'static,
    {
        let root = root.canonicalize().map_err(|e| SyncError::io(root, e))?;
        let state = Arc::new(Mutex::new(WatcherState::Idle));

        let (event_tx, event_rx) = bounded::<Vec<PathBuf>>(1024);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => match event.kind {
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
                        let _ = event_tx.send(event.paths);
                    }
                    _ => {}
                },
                Err(e) => warn!("Watch error: {:?}", e),
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        let thread = {
            let state = Arc::clone(&state);
            let thread_root = root.clone();
            std::thread::Builder::new()
                .name("cmscloud-watcher".to_string())
                .spawn(move || run(thread_root, debounce, event_rx, stop_rx, state, sink))
                .map_err(|e| SyncError::io(&root, e))?
        };

        set_state(&state, WatcherState::Watching);
        debug!("Watching {:?} (debounce {:?})", root, debounce);

        Ok(Self {
            state,
            watcher: Some(watcher),
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn state(&self) -> WatcherState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop watching
    ///
    /// Blocks until the watcher thread has exited. Changes seen but not yet
    /// settled are delivered to the sink before this returns.
    pub fn stop(&mut self) {
        // Dropping the notify watcher ends event delivery first
        self.watcher.take();
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Watcher thread panicked");
            }
        }
        set_state(&self.state, WatcherState::Stopped);
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_state(state: &Mutex<WatcherState>, next: WatcherState) {
    *state.lock().unwrap_or_else(|e| e.into_inner()) = next;
}

fn run<F>(
    root: PathBuf,
    debounce: Duration,
    events: Receiver<Vec<PathBuf>>,
    stop: Receiver<()>,
    state: Arc<Mutex<WatcherState>>,
    mut sink: F,
) where
    F: FnMut(ChangeBatch),
{
    let max_delay = debounce * MAX_DELAY_FACTOR;
    let mut pending = ChangeBatch::default();
    let mut first_seen: Option<Instant> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        let timeout = deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_TICK);

        select! {
            recv(events) -> msg => match msg {
                Ok(paths) => {
                    if collect(&root, paths, &mut pending) {
                        let now = Instant::now();
                        let first = *first_seen.get_or_insert(now);
                        deadline = Some((now + debounce).min(first + max_delay));
                        set_state(&state, WatcherState::Debouncing);
                    }
                }
                Err(_) => break,
            },
            recv(stop) -> _ => break,
            default(timeout) => {}
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            deadline = None;
            first_seen = None;
            set_state(&state, WatcherState::CommitTriggered);
            let batch = std::mem::take(&mut pending);
            debug!("Change batch settled with {} path(s)", batch.len());
            sink(batch);
            set_state(&state, WatcherState::Watching);
        }
    }

    // Anything already queued belongs to the final batch
    while let Ok(paths) = events.try_recv() {
        collect(&root, paths, &mut pending);
    }
    if !pending.is_empty() {
        debug!("Flushing {} pending path(s) on stop", pending.len());
        set_state(&state, WatcherState::CommitTriggered);
        sink(pending);
    }
    set_state(&state, WatcherState::Stopped);
}

/// Add the relevant paths of one event; returns whether any were added
fn collect(root: &Path, paths: Vec<PathBuf>, batch: &mut ChangeBatch) -> bool {
    let mut added = false;
    for path in paths {
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        if relative.as_os_str().is_empty() || is_ignored(relative) {
            continue;
        }
        added |= batch.paths.insert(relative.to_path_buf());
    }
    added
}

/// Git internals and the engine's own marker files never trigger a commit
fn is_ignored(relative: &Path) -> bool {
    if relative
        .components()
        .any(|c| matches!(c, Component::Normal(name) if name == ".git"))
    {
        return true;
    }
    relative
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| IGNORED_FILES.contains(&name))
}
