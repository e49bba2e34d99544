//! [`LocalRepository`] backed by libgit2
//!
//! libgit2 cannot read or write git bundles, so fetching from the bundle
//! remote and creating outgoing bundles go through the `git` binary. Every
//! other operation uses `git2` directly.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Commit, ConfigLevel, ErrorCode, IndexAddOption, Oid, Repository, StatusOptions,
    Tree,
};
use tracing::{debug, info, warn};

use super::ignore::merge_patterns;
use super::{LocalRepository, MergeOutcome};
use crate::error::{SyncError, SyncResult};

/// Author name used for every commit made by the sync engine
pub const SYNC_AUTHOR_NAME: &str = "Git Sync";

/// How [`GitRepository::ensure`] obtained the repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoInit {
    /// An existing repository was opened
    Opened,
    /// A fresh repository was created; earlier contents were moved aside
    Initialized { backup: Option<PathBuf> },
}

/// Git working copy of a synced directory
pub struct GitRepository {
    repo: Repository,
    workdir: PathBuf,
}

impl GitRepository {
    /// Open the repository at `path`, creating one if needed
    ///
    /// A missing directory is created. A directory without `.git` that still
    /// has contents is emptied into a timestamped sibling backup directory
    /// before `git init`, so nothing the user had is lost.
    pub fn ensure(path: &Path) -> SyncResult<(Self, RepoInit)> {
        if !path.exists() {
            fs::create_dir_all(path).map_err(|e| SyncError::io(path, e))?;
        }
        let workdir = path.canonicalize().map_err(|e| SyncError::io(path, e))?;

        if workdir.join(".git").exists() {
            return Ok((Self::open(&workdir)?, RepoInit::Opened));
        }

        let backup = if is_empty_dir(&workdir)? {
            None
        } else {
            let backup = backup_contents(&workdir)?;
            info!("Moved existing contents of {:?} to {:?}", workdir, backup);
            Some(backup)
        };

        let repo = Repository::init(&workdir)?;
        info!("Initialized repository in {:?}", workdir);
        Ok((Self { repo, workdir }, RepoInit::Initialized { backup }))
    }

    /// Open an existing repository
    pub fn open(path: &Path) -> SyncResult<Self> {
        let repo = Repository::open(path)?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| git2::Error::from_str("bare repository not supported"))?
            .to_path_buf();
        Ok(Self { repo, workdir })
    }

    fn remote_ref_name(remote_ref: &str) -> String {
        format!("refs/remotes/{}", remote_ref)
    }

    fn remote_commit(&self, remote_ref: &str) -> SyncResult<Commit<'_>> {
        let reference = self
            .repo
            .find_reference(&Self::remote_ref_name(remote_ref))?;
        Ok(reference.peel_to_commit()?)
    }

    fn head_commit(&self) -> SyncResult<Option<Commit<'_>>> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn checkout(&self, tree: &Tree<'_>) -> SyncResult<()> {
        let mut checkout = CheckoutBuilder::new();
        checkout.safe();
        self.repo.checkout_tree(tree.as_object(), Some(&mut checkout))?;
        Ok(())
    }

    /// Put HEAD on `branch`, checking out its tree if we were elsewhere
    fn switch_to(&self, branch: &str) -> SyncResult<()> {
        let branch_ref = format!("refs/heads/{}", branch);
        let current = self
            .repo
            .head()
            .ok()
            .and_then(|h| h.name().map(str::to_string));
        if current.as_deref() == Some(branch_ref.as_str()) {
            return Ok(());
        }

        if let Ok(reference) = self.repo.find_reference(&branch_ref) {
            let commit = reference.peel_to_commit()?;
            self.checkout(&commit.tree()?)?;
        }
        self.repo.set_head(&branch_ref)?;
        debug!("Switched to {}", branch_ref);
        Ok(())
    }

    fn run_git<I, S>(&self, args: I) -> SyncResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let command = args
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");

        debug!("Running git {}", command);
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.workdir)
            .args(&args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|e| SyncError::GitCommand {
                command: command.clone(),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(SyncError::GitCommand {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl LocalRepository for GitRepository {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn register_remote(&self, name: &str, bundle_path: &Path) -> SyncResult<bool> {
        let exists = self.repo.remotes()?.iter().flatten().any(|r| r == name);
        if exists {
            return Ok(false);
        }

        let url = bundle_path.to_str().ok_or_else(|| {
            SyncError::io(
                bundle_path,
                io::Error::new(io::ErrorKind::InvalidInput, "bundle path is not UTF-8"),
            )
        })?;
        self.repo.remote(name, url)?;
        debug!("Added remote {} -> {}", name, url);
        Ok(true)
    }

    fn fetch_remote(&self, name: &str) -> SyncResult<()> {
        self.run_git(["fetch", "--quiet", name])?;
        Ok(())
    }

    fn ensure_branch_from_remote(&self, branch: &str, remote_ref: &str) -> SyncResult<bool> {
        if self.repo.find_branch(branch, BranchType::Local).is_ok() {
            return Ok(false);
        }

        let commit = self.remote_commit(remote_ref)?;
        self.checkout(&commit.tree()?)?;
        let mut local = self.repo.branch(branch, &commit, false)?;
        local.set_upstream(Some(remote_ref))?;
        self.repo.set_head(&format!("refs/heads/{}", branch))?;
        info!("Created branch {} from {}", branch, remote_ref);
        Ok(true)
    }

    fn incoming_changes(&self, remote_ref: &str) -> SyncResult<Vec<PathBuf>> {
        let theirs = self.remote_commit(remote_ref)?;
        let base_tree = match self.head_commit()? {
            Some(head) => match self.repo.merge_base(head.id(), theirs.id()) {
                Ok(base) => Some(self.repo.find_commit(base)?.tree()?),
                Err(e) if e.code() == ErrorCode::NotFound => None,
                Err(e) => return Err(e.into()),
            },
            None => None,
        };

        let diff = self
            .repo
            .diff_tree_to_tree(base_tree.as_ref(), Some(&theirs.tree()?), None)?;
        let paths = diff
            .deltas()
            .filter_map(|delta| {
                delta
                    .new_file()
                    .path()
                    .or_else(|| delta.old_file().path())
                    .map(Path::to_path_buf)
            })
            .collect();
        Ok(paths)
    }

    fn merge(&self, remote_ref: &str, into_branch: &str) -> SyncResult<MergeOutcome> {
        self.switch_to(into_branch)?;

        let reference = self
            .repo
            .find_reference(&Self::remote_ref_name(remote_ref))?;
        let annotated = self.repo.reference_to_annotated_commit(&reference)?;
        let (analysis, _) = self.repo.merge_analysis(&[&annotated])?;

        if analysis.is_up_to_date() {
            debug!("{} already contains {}", into_branch, remote_ref);
            return Ok(MergeOutcome::UpToDate);
        }

        let theirs = self.repo.find_commit(annotated.id())?;
        let branch_ref = format!("refs/heads/{}", into_branch);
        let message = format!("Merge {} into {}", remote_ref, into_branch);

        if analysis.is_fast_forward() || analysis.is_unborn() {
            self.checkout(&theirs.tree()?)?;
            match self.repo.find_reference(&branch_ref) {
                Ok(mut local) => {
                    local.set_target(theirs.id(), &message)?;
                }
                Err(_) => {
                    self.repo.reference(&branch_ref, theirs.id(), true, &message)?;
                }
            }
            self.repo.set_head(&branch_ref)?;
            info!("Fast-forwarded {} to {}", into_branch, theirs.id());
            return Ok(MergeOutcome::FastForward(theirs.id().to_string()));
        }

        let ours = self
            .head_commit()?
            .ok_or_else(|| git2::Error::from_str("no local commit to merge into"))?;
        let mut index = self.repo.merge_commits(&ours, &theirs, None)?;

        if index.has_conflicts() {
            let paths: Vec<PathBuf> = index
                .conflicts()?
                .filter_map(Result::ok)
                .filter_map(|c| c.our.or(c.their).or(c.ancestor))
                .map(|entry| PathBuf::from(String::from_utf8_lossy(&entry.path).into_owned()))
                .collect();
            warn!("Merge of {} into {} conflicts: {:?}", remote_ref, into_branch, paths);
            return Err(SyncError::MergeConflict { paths });
        }

        let tree_id = index.write_tree_to(&self.repo)?;
        let tree = self.repo.find_tree(tree_id)?;
        self.checkout(&tree)?;

        let signature = self.repo.signature()?;
        let oid = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &message,
            &tree,
            &[&ours, &theirs],
        )?;
        info!("Merged {} into {} as {}", remote_ref, into_branch, oid);
        Ok(MergeOutcome::Merged(oid.to_string()))
    }

    fn configure_identity(&self, email: &str) -> SyncResult<()> {
        let mut config = self.repo.config()?.open_level(ConfigLevel::Local)?;
        config.set_str("user.name", SYNC_AUTHOR_NAME)?;
        config.set_str("user.email", email)?;
        Ok(())
    }

    fn update_ignore_rules(&self, patterns: &[&str]) -> SyncResult<bool> {
        let path = self.workdir.join(".gitignore");
        let existing = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(SyncError::io(path, e)),
        };

        match merge_patterns(&existing, patterns) {
            Some(updated) => {
                fs::write(&path, updated).map_err(|e| SyncError::io(&path, e))?;
                debug!("Updated {:?}", path);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn resolve(&self, reference: &str) -> SyncResult<Option<String>> {
        match self.repo.revparse_single(reference) {
            Ok(object) => Ok(Some(object.peel_to_commit()?.id().to_string())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn commit_all(&self, message: &str) -> SyncResult<Option<String>> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let parent = self.head_commit()?;
        match parent {
            Some(ref p) if p.tree_id() == tree_id => return Ok(None),
            None if index.is_empty() => return Ok(None),
            _ => {}
        }

        let tree = self.repo.find_tree(tree_id)?;
        let signature = self.repo.signature()?;
        let parents: Vec<&Commit<'_>> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
        info!("Committed local changes as {}", oid);
        Ok(Some(oid.to_string()))
    }

    fn ahead_behind(&self, branch: &str, remote_ref: &str) -> SyncResult<(usize, usize)> {
        let local = match self.resolve(&format!("refs/heads/{}", branch))? {
            Some(id) => Oid::from_str(&id)?,
            None => return Ok((0, 0)),
        };
        let upstream = match self.resolve(&Self::remote_ref_name(remote_ref))? {
            Some(id) => Oid::from_str(&id)?,
            None => return Ok((0, 0)),
        };
        Ok(self.repo.graph_ahead_behind(local, upstream)?)
    }

    fn create_bundle(&self, dest: &Path, since_ref: &str, branch: &str) -> SyncResult<()> {
        let range = format!("{}..{}", since_ref, branch);
        self.run_git([
            OsStr::new("bundle"),
            OsStr::new("create"),
            dest.as_os_str(),
            OsStr::new(&range),
        ])?;
        Ok(())
    }

    fn pending_changes(&self) -> SyncResult<Vec<PathBuf>> {
        let mut options = StatusOptions::new();
        options
            .include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = self.repo.statuses(Some(&mut options))?;
        Ok(statuses
            .iter()
            .filter(|entry| !entry.status().is_ignored())
            .filter_map(|entry| entry.path().map(PathBuf::from))
            .collect())
    }

    fn restore_path(&self, path: &Path) -> SyncResult<()> {
        let tracked = match self.head_commit()? {
            Some(head) => match head.tree()?.get_path(path) {
                Ok(_) => true,
                Err(e) if e.code() == ErrorCode::NotFound => false,
                Err(e) => return Err(e.into()),
            },
            None => false,
        };

        if tracked {
            let mut checkout = CheckoutBuilder::new();
            checkout.force().update_index(true).path(path);
            self.repo.checkout_head(Some(&mut checkout))?;
            debug!("Restored {:?} from HEAD", path);
            return Ok(());
        }

        let full = self.workdir.join(path);
        match fs::remove_file(&full) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(SyncError::io(full, e)),
        }
        let mut index = self.repo.index()?;
        if index.get_path(path, 0).is_some() {
            index.remove_path(path)?;
            index.write()?;
        }
        debug!("Removed untracked {:?}", path);
        Ok(())
    }
}

fn is_empty_dir(dir: &Path) -> SyncResult<bool> {
    let mut entries = fs::read_dir(dir).map_err(|e| SyncError::io(dir, e))?;
    Ok(entries.next().is_none())
}

/// Move everything in `dir` into a new sibling `<dir> - <timestamp>.backup`
fn backup_contents(dir: &Path) -> SyncResult<PathBuf> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sync".to_string());
    let parent = dir.parent().ok_or_else(|| {
        SyncError::io(
            dir,
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot back up a directory without a parent",
            ),
        )
    })?;
    let stamp = chrono::Local::now().format("%Y-%m-%d %H-%M-%S%.6f").to_string();

    let mut backup = parent.join(format!("{} - {}.backup", name, stamp));
    let mut attempt = 1;
    while backup.exists() {
        backup = parent.join(format!("{} - {}-{}.backup", name, stamp, attempt));
        attempt += 1;
    }
    fs::create_dir(&backup).map_err(|e| SyncError::io(&backup, e))?;

    for entry in fs::read_dir(dir).map_err(|e| SyncError::io(dir, e))? {
        let entry = entry.map_err(|e| SyncError::io(dir, e))?;
        let target = backup.join(entry.file_name());
        fs::rename(entry.path(), &target).map_err(|e| SyncError::io(entry.path(), e))?;
    }
    Ok(backup)
}
