//! Sync handler
//!
//! Owns one running session. Three workers cooperate:
//!
//! - the [`ChangeWatcher`] thread, which turns filesystem bursts into
//!   [`ChangeBatch`]es;
//! - the commit loop, a tokio task that commits each batch and pushes it;
//! - the poll loop, a tokio task that fetches upstream bundles every
//!   `poll_interval` and merges them.
//!
//! All repository access goes through one mutex and runs on the blocking
//! pool. Commit and poll cycles are serialized so a merge never interleaves
//! with a local commit. Errors inside cycles are reported through
//! [`SyncCallbacks`] and never end the session.
//!
//! A merge that fails (conflict or refused protected file) is remembered and
//! not retried, or reported again, until upstream moves. A conflict is also
//! retried once the local branch moves.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::callbacks::SyncCallbacks;
use crate::error::{SyncError, SyncResult, SYNC_NETWORK_ERROR_MESSAGE};
use crate::lock::LockGuard;
use crate::protected::ProtectedFileSet;
use crate::repo::LocalRepository;
use crate::session::{RemoteBundleRef, SessionRegistry, SessionState, SyncSession};
use crate::site::{
    BUNDLE_FILENAME, BUNDLE_REMOTE, DEVELOP_BRANCH, PUSH_BUNDLE_FILENAME, UPSTREAM_REF,
};
use crate::transport::{BundleTransport, FetchOutcome};
use crate::watcher::{ChangeBatch, ChangeWatcher};

/// Commit message for edits picked up right before a merge
const PENDING_CHANGES_MESSAGE: &str = "Sync local changes";

/// Per-session settings
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub sitename: String,
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub protected: ProtectedFileSet,
    pub last_synced_commit: Option<String>,
}

type SharedRepo = Arc<Mutex<Box<dyn LocalRepository>>>;

/// Upstream state whose merge already failed
#[derive(Debug, Clone, PartialEq, Eq)]
struct FailedMerge {
    upstream: String,
    /// Local head it conflicted with; `None` matches any local state
    local: Option<String>,
}

impl FailedMerge {
    fn covers(&self, upstream: &str, local: Option<&str>) -> bool {
        self.upstream == upstream && (self.local.is_none() || self.local.as_deref() == local)
    }
}

pub struct SyncHandler {
    sitename: String,
    local_path: PathBuf,
    poll_interval: Duration,
    debounce: Duration,
    protected: ProtectedFileSet,
    repo: SharedRepo,
    transport: Arc<dyn BundleTransport>,
    callbacks: Arc<dyn SyncCallbacks>,
    registry: Weak<SessionRegistry>,
    state: Mutex<SessionState>,
    last_synced_commit: Mutex<Option<String>>,
    failed_merge: Mutex<Option<FailedMerge>>,
    lock: Mutex<Option<LockGuard>>,
    watcher: Mutex<Option<ChangeWatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    runtime: Mutex<Option<Handle>>,
    stop_tx: watch::Sender<bool>,
    cycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SyncHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandler")
            .field("sitename", &self.sitename)
            .field("local_path", &self.local_path)
            .finish_non_exhaustive()
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SyncHandler {
    /// Build a handler in the `Starting` state
    ///
    /// The handler takes ownership of the directory lock and releases it
    /// when stopped.
    pub fn new(
        options: HandlerOptions,
        repo: Box<dyn LocalRepository>,
        transport: Arc<dyn BundleTransport>,
        callbacks: Arc<dyn SyncCallbacks>,
        lock: LockGuard,
        registry: &Arc<SessionRegistry>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            sitename: options.sitename,
            local_path: repo.workdir().to_path_buf(),
            poll_interval: options.poll_interval,
            debounce: options.debounce,
            protected: options.protected,
            repo: Arc::new(Mutex::new(repo)),
            transport,
            callbacks,
            registry: Arc::downgrade(registry),
            state: Mutex::new(SessionState::Starting),
            last_synced_commit: Mutex::new(options.last_synced_commit),
            failed_merge: Mutex::new(None),
            lock: Mutex::new(Some(lock)),
            watcher: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            runtime: Mutex::new(None),
            stop_tx,
            cycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn sitename(&self) -> &str {
        &self.sitename
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn state(&self) -> SessionState {
        *locked(&self.state)
    }

    pub fn last_synced_commit(&self) -> Option<String> {
        locked(&self.last_synced_commit).clone()
    }

    pub fn remote_ref(&self) -> RemoteBundleRef {
        RemoteBundleRef {
            sitename: self.sitename.clone(),
            last_synced_commit: self.last_synced_commit(),
        }
    }

    pub fn session(&self) -> SyncSession {
        SyncSession {
            sitename: self.sitename.clone(),
            local_path: self.local_path.clone(),
            last_synced_commit: self.last_synced_commit(),
            lock_held: locked(&self.lock).is_some(),
            protected_files: self.protected.iter().map(Path::to_path_buf).collect(),
            state: self.state(),
        }
    }

    fn set_state(&self, next: SessionState) {
        *locked(&self.state) = next;
    }

    /// Move between `from` and `to` unless a stop got there first
    fn transition(&self, from: SessionState, to: SessionState) {
        let mut state = locked(&self.state);
        if *state == from {
            *state = to;
        }
    }

    /// Start the watcher, commit loop and poll loop
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> SyncResult<()> {
        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel::<ChangeBatch>();
        let watcher = ChangeWatcher::start(&self.local_path, self.debounce, move |batch| {
            let _ = batch_tx.send(batch);
        })?;
        *locked(&self.watcher) = Some(watcher);
        *locked(&self.runtime) = Some(Handle::current());

        let commit_loop = {
            let handler = Arc::clone(self);
            tokio::spawn(async move {
                // Ends once the watcher is stopped and its sink dropped
                while let Some(batch) = batch_rx.recv().await {
                    if let Err(e) = handler.commit_cycle(batch).await {
                        handler.report(&e);
                    }
                }
                debug!("Commit loop for {} finished", handler.sitename);
            })
        };

        let poll_loop = {
            let handler = Arc::clone(self);
            let mut stop_rx = self.stop_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(handler.poll_interval) => {}
                        _ = stop_rx.changed() => break,
                    }
                    if *stop_rx.borrow() {
                        break;
                    }
                    if handler.callbacks.should_stop() {
                        info!("Stop requested for {}", handler.sitename);
                        handler.request_stop();
                        break;
                    }
                    if let Err(e) = handler.sync_now().await {
                        handler.report(&e);
                    }
                }
                debug!("Poll loop for {} finished", handler.sitename);
            })
        };

        locked(&self.tasks).extend([commit_loop, poll_loop]);
        self.transition(SessionState::Starting, SessionState::Watching);
        info!("Watching {:?} for {}", self.local_path, self.sitename);
        Ok(())
    }

    /// Run one poll cycle now: fetch, merge, push
    pub async fn sync_now(&self) -> SyncResult<()> {
        let _cycle = self.cycle.lock().await;
        self.transition(SessionState::Watching, SessionState::Syncing);
        self.callbacks.on_sync_indicator(true);

        let result = self.pull_and_push().await;

        self.callbacks.on_sync_indicator(false);
        self.transition(SessionState::Syncing, SessionState::Watching);
        result
    }

    async fn pull_and_push(&self) -> SyncResult<()> {
        let bundle_path = self.local_path.join(BUNDLE_FILENAME);
        let since = self.last_synced_commit();

        match self
            .transport
            .fetch(&self.sitename, since.as_deref(), &bundle_path)
            .await?
        {
            FetchOutcome::NotModified => {
                debug!("No upstream changes for {}", self.sitename);
            }
            FetchOutcome::Bundle { bytes } => {
                debug!("Merging {} byte bundle for {}", bytes, self.sitename);
                let protected = self.protected.clone();
                let callbacks = Arc::clone(&self.callbacks);
                let (upstream, local) = self
                    .with_repo(move |repo| {
                        guard_local_edits(repo, &protected, &*callbacks)?;
                        repo.commit_all(PENDING_CHANGES_MESSAGE)?;
                        repo.fetch_remote(BUNDLE_REMOTE)?;
                        let local = repo.resolve(&format!("refs/heads/{}", DEVELOP_BRANCH))?;
                        Ok((repo.resolve(UPSTREAM_REF)?, local))
                    })
                    .await?;
                let upstream =
                    upstream.ok_or_else(|| SyncError::NoUpstream(self.sitename.clone()))?;

                let already_failed = locked(&self.failed_merge)
                    .as_ref()
                    .is_some_and(|failed| failed.covers(&upstream, local.as_deref()));
                if already_failed {
                    debug!(
                        "Merge of {} for {} failed before, waiting for changes",
                        upstream, self.sitename
                    );
                } else {
                    self.merge_upstream(upstream, local).await?;
                }
            }
        }

        self.push_if_ahead().await
    }

    async fn merge_upstream(&self, upstream: String, local: Option<String>) -> SyncResult<()> {
        let protected = self.protected.clone();
        let callbacks = Arc::clone(&self.callbacks);
        let result = self
            .with_repo(move |repo| {
                check_incoming(repo, &protected, &*callbacks)?;
                repo.merge(UPSTREAM_REF, DEVELOP_BRANCH)
            })
            .await;

        match result {
            Ok(_) => {
                info!("{} synced to {}", self.sitename, upstream);
                locked(&self.failed_merge).take();
                *locked(&self.last_synced_commit) = Some(upstream);
                Ok(())
            }
            Err(e) => {
                let local = match &e {
                    SyncError::MergeConflict { .. } => Some(local),
                    SyncError::ProtectedFileConflict { .. } => Some(None),
                    _ => None,
                };
                if let Some(local) = local {
                    *locked(&self.failed_merge) = Some(FailedMerge { upstream, local });
                }
                Err(e)
            }
        }
    }

    /// Commit one settled batch of local edits, then push it
    async fn commit_cycle(&self, batch: ChangeBatch) -> SyncResult<()> {
        let _cycle = self.cycle.lock().await;
        let message = commit_message(&batch);
        let protected = self.protected.clone();
        let callbacks = Arc::clone(&self.callbacks);
        debug!("Committing {} changed path(s)", batch.len());

        let committed = self
            .with_repo(move |repo| {
                guard_local_edits(repo, &protected, &*callbacks)?;
                repo.commit_all(&message)
            })
            .await?;

        if committed.is_some() {
            self.push_if_ahead().await?;
        }
        Ok(())
    }

    /// Upload local commits the upstream does not have yet
    ///
    /// Nothing is sent while upstream holds commits we have not merged; the
    /// server only accepts fast-forwards.
    async fn push_if_ahead(&self) -> SyncResult<()> {
        let push_path = self.local_path.join(PUSH_BUNDLE_FILENAME);
        let dest = push_path.clone();
        let (ahead, behind) = self
            .with_repo(move |repo| {
                let (ahead, behind) = repo.ahead_behind(DEVELOP_BRANCH, UPSTREAM_REF)?;
                if ahead > 0 && behind == 0 {
                    repo.create_bundle(&dest, UPSTREAM_REF, DEVELOP_BRANCH)?;
                }
                Ok((ahead, behind))
            })
            .await?;
        if ahead == 0 {
            return Ok(());
        }
        if behind > 0 {
            debug!(
                "Holding {} commit(s) for {} until upstream is merged",
                ahead, self.sitename
            );
            return Ok(());
        }

        let result = self.transport.push(&self.sitename, &push_path).await;
        if let Err(e) = tokio::fs::remove_file(&push_path).await {
            debug!("Could not remove {:?}: {}", push_path, e);
        }
        result?;
        info!("Pushed {} commit(s) for {}", ahead, self.sitename);
        Ok(())
    }

    async fn with_repo<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&dyn LocalRepository) -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let repo = Arc::clone(&self.repo);
        tokio::task::spawn_blocking(move || {
            let guard = locked(&repo);
            f(&**guard)
        })
        .await?
    }

    fn report(&self, err: &SyncError) {
        if err.is_network() {
            warn!("Sync of {} failed: {}", self.sitename, err);
            self.callbacks.on_network_error(SYNC_NETWORK_ERROR_MESSAGE);
        } else {
            error!("Sync of {} failed: {}", self.sitename, err);
            self.callbacks.on_sync_error(&err.to_string());
        }
    }

    /// Ask the session to stop without waiting for it
    ///
    /// Safe to call from any thread, including callbacks.
    pub fn request_stop(self: &Arc<Self>) {
        let runtime = locked(&self.runtime).clone();
        match runtime {
            Some(runtime) => {
                let handler = Arc::clone(self);
                runtime.spawn(async move { handler.stop().await });
            }
            None => {
                // Never started: nothing runs, only the lock needs to go
                self.set_state(SessionState::Stopped);
                locked(&self.lock).take();
            }
        }
    }

    /// Stop the session and wait for its workers
    ///
    /// Pending local edits are committed before the lock is released.
    /// Calling this more than once is harmless.
    pub async fn stop(&self) {
        {
            let mut state = locked(&self.state);
            if matches!(*state, SessionState::Stopping | SessionState::Stopped) {
                return;
            }
            *state = SessionState::Stopping;
        }
        info!("Stopping sync of {}", self.sitename);
        self.stop_tx.send_replace(true);

        let watcher = locked(&self.watcher).take();
        if let Some(mut watcher) = watcher {
            if let Err(e) = tokio::task::spawn_blocking(move || watcher.stop()).await {
                warn!("Watcher shutdown failed: {}", e);
            }
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *locked(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Sync task for {} ended abnormally: {}", self.sitename, e);
            }
        }

        locked(&self.lock).take();
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(&self.sitename, self);
        }
        self.set_state(SessionState::Stopped);
        info!("Stopped syncing {}", self.sitename);
    }
}

/// Ask before an incoming merge overwrites protected files
///
/// The callback runs once per affected protected path; the first refusal
/// aborts the merge.
pub(crate) fn check_incoming(
    repo: &dyn LocalRepository,
    protected: &ProtectedFileSet,
    callbacks: &dyn SyncCallbacks,
) -> SyncResult<()> {
    if protected.is_empty() {
        return Ok(());
    }
    let incoming = repo.incoming_changes(UPSTREAM_REF)?;
    for path in protected.affected_by(&incoming) {
        if !callbacks.on_protected_file_change(path) {
            warn!("Incoming change to protected file {:?} rejected", path);
            return Err(SyncError::ProtectedFileConflict {
                path: path.to_path_buf(),
            });
        }
    }
    Ok(())
}

/// Ask before committing local edits to protected files
///
/// Every pending protected path is offered to the callback once; refused
/// edits are reverted so the following commit leaves them out.
fn guard_local_edits(
    repo: &dyn LocalRepository,
    protected: &ProtectedFileSet,
    callbacks: &dyn SyncCallbacks,
) -> SyncResult<()> {
    if protected.is_empty() {
        return Ok(());
    }
    let pending = repo.pending_changes()?;
    for path in protected.affected_by(&pending) {
        if !callbacks.on_protected_file_change(path) {
            warn!("Reverting local edit to protected file {:?}", path);
            repo.restore_path(path)?;
        }
    }
    Ok(())
}

fn commit_message(batch: &ChangeBatch) -> String {
    let mut paths = batch.paths.iter();
    match (batch.len(), paths.next()) {
        (1, Some(path)) => format!("Update {}", path.display()),
        (n, _) => format!("Update {} files", n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_commit_message() {
        let single = ChangeBatch {
            paths: BTreeSet::from([PathBuf::from("templates/base.html")]),
        };
        assert_eq!(commit_message(&single), "Update templates/base.html");

        let several = ChangeBatch {
            paths: BTreeSet::from([PathBuf::from("a"), PathBuf::from("b")]),
        };
        assert_eq!(commit_message(&several), "Update 2 files");
    }

    #[test]
    fn test_failed_merge_covers() {
        let conflict = FailedMerge {
            upstream: "u1".to_string(),
            local: Some("l1".to_string()),
        };
        assert!(conflict.covers("u1", Some("l1")));
        // Retried once either side moves
        assert!(!conflict.covers("u1", Some("l2")));
        assert!(!conflict.covers("u2", Some("l1")));

        let refused = FailedMerge {
            upstream: "u1".to_string(),
            local: None,
        };
        assert!(refused.covers("u1", Some("l1")));
        assert!(refused.covers("u1", Some("l2")));
        assert!(!refused.covers("u2", Some("l1")));
    }
}
