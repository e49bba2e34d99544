//! Local repository adapter
//!
//! The sync engine talks to the working copy only through
//! [`LocalRepository`]. [`GitRepository`] is the git implementation.
//!
//! Refs named `remote_ref` are remote-tracking refs in `<remote>/<branch>`
//! form, e.g. `develop_bundle/develop`.

mod git;
pub mod ignore;

use std::path::{Path, PathBuf};

use crate::error::SyncResult;

pub use git::{GitRepository, RepoInit, SYNC_AUTHOR_NAME};

/// What a merge did to the branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Branch already contains the remote ref
    UpToDate,
    /// Branch moved forward to this commit
    FastForward(String),
    /// A merge commit was created
    Merged(String),
}

/// Operations the sync engine needs from a version-controlled working copy
pub trait LocalRepository: Send {
    /// Root of the working tree
    fn workdir(&self) -> &Path;

    /// Add a remote pointing at a bundle file; returns `false` if it existed
    fn register_remote(&self, name: &str, bundle_path: &Path) -> SyncResult<bool>;

    /// Fetch refs from a remote without touching the working tree
    fn fetch_remote(&self, name: &str) -> SyncResult<()>;

    /// Create and check out `branch` at `remote_ref` unless it already exists
    fn ensure_branch_from_remote(&self, branch: &str, remote_ref: &str) -> SyncResult<bool>;

    /// Paths changed upstream since the common ancestor with HEAD
    fn incoming_changes(&self, remote_ref: &str) -> SyncResult<Vec<PathBuf>>;

    /// Merge `remote_ref` into `into_branch`; conflicts are an error
    fn merge(&self, remote_ref: &str, into_branch: &str) -> SyncResult<MergeOutcome>;

    /// Set the repository-local commit identity
    fn configure_identity(&self, email: &str) -> SyncResult<()>;

    /// Make sure `.gitignore` contains `patterns`; returns whether it changed
    fn update_ignore_rules(&self, patterns: &[&str]) -> SyncResult<bool>;

    /// Commit id a ref points at, if it exists
    fn resolve(&self, reference: &str) -> SyncResult<Option<String>>;

    /// Stage everything and commit; `None` when there was nothing to commit
    fn commit_all(&self, message: &str) -> SyncResult<Option<String>>;

    /// Commits on `branch` missing from `remote_ref`, and the reverse
    fn ahead_behind(&self, branch: &str, remote_ref: &str) -> SyncResult<(usize, usize)>;

    /// Write a bundle of the commits in `since_ref..branch` to `dest`
    fn create_bundle(&self, dest: &Path, since_ref: &str, branch: &str) -> SyncResult<()>;

    /// Paths with uncommitted changes, untracked files included
    fn pending_changes(&self) -> SyncResult<Vec<PathBuf>>;

    /// Discard working-tree edits to one path, restoring the HEAD version
    ///
    /// A path that HEAD does not track is removed.
    fn restore_path(&self, path: &Path) -> SyncResult<()>;
}
