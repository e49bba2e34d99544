//! Session startup
//!
//! [`start_sync`] takes a directory from whatever state it is in to a
//! running [`SyncHandler`]:
//!
//! 1. resolve the sitename and check it against `.cmscloud`
//! 2. open the repository or bootstrap one, and set the commit identity
//! 3. take the directory lock
//! 4. fetch upstream and merge it
//! 5. write the ignore rules and `.cmscloud`
//! 6. register and start the handler
//!
//! Every failure is returned to the caller. The lock is released on any
//! failure after step 3 and nothing is registered.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::callbacks::{Confirm, SyncCallbacks};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::handler::{check_incoming, HandlerOptions, SyncHandler};
use crate::lock::{lock_path, LockGuard};
use crate::protected::ProtectedFileSet;
use crate::repo::{GitRepository, LocalRepository, RepoInit};
use crate::session::SessionRegistry;
use crate::site::{
    resolve_sitename, write_marker, BUNDLE_FILENAME, BUNDLE_REMOTE, DEVELOP_BRANCH,
    IGNORE_PATTERNS, UPSTREAM_REF,
};
use crate::transport::{BundleTransport, FetchOutcome};

/// Question asked when the directory lock is already taken
pub const LOCK_OVERRIDE_QUESTION: &str = "Are you sure you want to start syncing anyway?";

/// Explanation shown before [`LOCK_OVERRIDE_QUESTION`]
pub const LOCK_OVERRIDE_MESSAGE: &str = "It seems that you are already syncing this directory.";

/// What to sync and how
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Site to sync; falls back to the one recorded in the directory
    pub sitename: Option<String>,
    pub path: PathBuf,
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub enforce_protected_files: bool,
}

impl SyncOptions {
    pub fn from_config(config: &Config, sitename: Option<String>, path: PathBuf) -> Self {
        Self {
            sitename,
            path,
            poll_interval: config.poll_interval(),
            debounce: config.debounce(),
            enforce_protected_files: config.enforce_protected_files,
        }
    }
}

/// What to do when another session holds the directory lock
#[derive(Clone, Copy)]
pub enum LockPolicy<'a> {
    /// Ask the operator
    Interactive(&'a dyn Confirm),
    /// Take over the lock only when `force` is set
    NonInteractive { force: bool },
}

/// Shared collaborators of a sync session
#[derive(Clone)]
pub struct SyncContext {
    pub registry: Arc<SessionRegistry>,
    pub transport: Arc<dyn BundleTransport>,
    pub callbacks: Arc<dyn SyncCallbacks>,
    /// Account email used as the commit identity of fresh repositories
    pub email: String,
}

/// Start syncing a directory
///
/// Returns the running handler; it is also tracked in the registry until
/// it stops.
pub async fn start_sync(
    options: SyncOptions,
    policy: LockPolicy<'_>,
    context: &SyncContext,
) -> SyncResult<Arc<SyncHandler>> {
    let sitename = resolve_sitename(&options.path, options.sitename.as_deref())?;
    if context.registry.is_syncing(&sitename) {
        return Err(SyncError::AlreadySyncing(sitename));
    }

    let (repo, init) = GitRepository::ensure(&options.path)?;
    if let RepoInit::Initialized {
        backup: Some(ref backup),
    } = init
    {
        warn!("Existing files were moved to {:?}", backup);
    }
    // Adopted checkouts get the sync identity too
    repo.configure_identity(&context.email)?;
    let dir = repo.workdir().to_path_buf();
    let last_synced_commit = repo.resolve(UPSTREAM_REF)?;

    let lock = acquire_lock(&dir, policy)?;

    let protected = if options.enforce_protected_files {
        let protected = ProtectedFileSet::load(&dir)?;
        debug!("Loaded {} protected file(s)", protected.len());
        protected
    } else {
        ProtectedFileSet::default()
    };

    let bundle_path = dir.join(BUNDLE_FILENAME);
    let outcome = context
        .transport
        .fetch(&sitename, last_synced_commit.as_deref(), &bundle_path)
        .await?;

    match outcome {
        FetchOutcome::Bundle { bytes } => {
            info!("Received {} byte bundle for {}", bytes, sitename);
            if repo.register_remote(BUNDLE_REMOTE, &bundle_path)? {
                debug!("Registered bundle remote for {}", sitename);
            }
            repo.fetch_remote(BUNDLE_REMOTE)?;
            repo.ensure_branch_from_remote(DEVELOP_BRANCH, UPSTREAM_REF)?;
        }
        FetchOutcome::NotModified => debug!("Upstream for {} not modified", sitename),
    }

    // The upstream ref may hold a fetch whose merge was refused last time
    if repo.resolve(UPSTREAM_REF)?.is_some() {
        check_incoming(&repo, &protected, context.callbacks.as_ref())?;
        repo.merge(UPSTREAM_REF, DEVELOP_BRANCH)?;
    }

    repo.update_ignore_rules(IGNORE_PATTERNS)?;
    write_marker(&dir, &sitename)?;

    let upstream = repo
        .resolve(UPSTREAM_REF)?
        .ok_or_else(|| SyncError::NoUpstream(sitename.clone()))?;

    let handler = SyncHandler::new(
        HandlerOptions {
            sitename: sitename.clone(),
            poll_interval: options.poll_interval,
            debounce: options.debounce,
            protected,
            last_synced_commit: Some(upstream),
        },
        Box::new(repo),
        Arc::clone(&context.transport),
        Arc::clone(&context.callbacks),
        lock,
        &context.registry,
    );

    context.registry.insert(Arc::clone(&handler))?;
    if let Err(e) = handler.start() {
        handler.stop().await;
        return Err(e);
    }

    info!("Syncing {} in {:?}", sitename, dir);
    Ok(handler)
}

fn acquire_lock(dir: &Path, policy: LockPolicy<'_>) -> SyncResult<LockGuard> {
    let path = lock_path(dir);
    if let Some(guard) = LockGuard::try_acquire(dir).map_err(|e| SyncError::io(&path, e))? {
        return Ok(guard);
    }

    let take_over = match policy {
        LockPolicy::Interactive(confirm) => {
            if !confirm.confirm(LOCK_OVERRIDE_QUESTION, Some(LOCK_OVERRIDE_MESSAGE), false) {
                return Err(SyncError::Aborted);
            }
            true
        }
        LockPolicy::NonInteractive { force } => force,
    };

    if take_over {
        Ok(LockGuard::adopt(dir))
    } else {
        Err(SyncError::LockHeld { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Answer {
        yes: bool,
        asked: AtomicUsize,
    }

    impl Confirm for Answer {
        fn confirm(&self, question: &str, message: Option<&str>, default: bool) -> bool {
            assert_eq!(question, LOCK_OVERRIDE_QUESTION);
            assert_eq!(message, Some(LOCK_OVERRIDE_MESSAGE));
            assert!(!default);
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.yes
        }
    }

    #[test]
    fn test_free_lock_is_taken_without_asking() {
        let temp_dir = TempDir::new().unwrap();
        let answer = Answer {
            yes: false,
            asked: AtomicUsize::new(0),
        };
        let guard = acquire_lock(temp_dir.path(), LockPolicy::Interactive(&answer)).unwrap();
        assert!(!guard.is_forced());
        assert_eq!(answer.asked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_held_lock_interactive() {
        let temp_dir = TempDir::new().unwrap();
        assert!(lock::acquire(temp_dir.path()).unwrap());

        let decline = Answer {
            yes: false,
            asked: AtomicUsize::new(0),
        };
        assert!(matches!(
            acquire_lock(temp_dir.path(), LockPolicy::Interactive(&decline)),
            Err(SyncError::Aborted)
        ));
        assert_eq!(decline.asked.load(Ordering::SeqCst), 1);
        // Declining leaves the other session's lock alone
        assert!(lock_path(temp_dir.path()).exists());

        let accept = Answer {
            yes: true,
            asked: AtomicUsize::new(0),
        };
        let guard = acquire_lock(temp_dir.path(), LockPolicy::Interactive(&accept)).unwrap();
        assert!(guard.is_forced());
    }

    #[test]
    fn test_held_lock_non_interactive() {
        let temp_dir = TempDir::new().unwrap();
        assert!(lock::acquire(temp_dir.path()).unwrap());

        let err = acquire_lock(temp_dir.path(), LockPolicy::NonInteractive { force: false })
            .unwrap_err();
        assert_eq!(err.to_string(), "Directory already syncing.");

        let guard =
            acquire_lock(temp_dir.path(), LockPolicy::NonInteractive { force: true }).unwrap();
        assert!(guard.is_forced());
        drop(guard);
        assert!(!lock_path(temp_dir.path()).exists());
    }
}
