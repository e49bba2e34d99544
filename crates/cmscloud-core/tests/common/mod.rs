//! Shared fixtures for end-to-end sync tests
//!
//! [`Upstream`] is a plain git repository standing in for the site's
//! repository on the server. [`FakeTransport`] serves bundles cut from it
//! the way the HTTP endpoint does: a full bundle for a fresh directory, an
//! incremental one since `last_synced_commit`, or nothing when up to date.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cmscloud_core::session::SessionRegistry;
use cmscloud_core::sync::{SyncContext, SyncOptions};
use cmscloud_core::{BundleTransport, FetchOutcome, SyncCallbacks, SyncError, SyncResult};
use tempfile::TempDir;

pub const EMAIL: &str = "owner@example.com";

/// Run git in `dir`, panicking on failure
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["-c", "user.name=Upstream", "-c", "user.email=upstream@example.com"])
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

pub fn write_file(dir: &Path, name: &str, content: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

pub fn read_file(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name)).ok()
}

/// The site's repository on the server
pub struct Upstream {
    _dir: TempDir,
    pub path: PathBuf,
}

impl Upstream {
    pub fn new(files: &[(&str, &str)]) -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upstream");
        fs::create_dir(&path).unwrap();
        git(&path, &["init", "--quiet"]);
        git(&path, &["symbolic-ref", "HEAD", "refs/heads/develop"]);

        let upstream = Self { _dir: dir, path };
        upstream.commit(files, "Initial boilerplate");
        upstream
    }

    /// Commit `files` on develop and return the new head
    pub fn commit(&self, files: &[(&str, &str)], message: &str) -> String {
        for (name, content) in files {
            write_file(&self.path, name, content);
        }
        git(&self.path, &["add", "-A"]);
        git(&self.path, &["commit", "--quiet", "-m", message]);
        self.head()
    }

    pub fn head(&self) -> String {
        git(&self.path, &["rev-parse", "develop"])
    }

    /// Write the commits after `since` (everything when `None`) to `dest`
    pub fn bundle(&self, since: Option<&str>, dest: &Path) {
        let range = match since {
            Some(commit) => format!("{}..develop", commit),
            None => "develop".to_string(),
        };
        git(
            &self.path,
            &["bundle", "create", dest.to_str().unwrap(), &range],
        );
    }

    /// Fast-forward develop to the tip of a pushed bundle
    pub fn apply(&self, bundle: &Path) {
        git(
            &self.path,
            &["pull", "--quiet", "--ff-only", bundle.to_str().unwrap(), "develop"],
        );
    }

    pub fn read(&self, name: &str) -> Option<String> {
        read_file(&self.path, name)
    }
}

/// In-process stand-in for the git-sync endpoint
pub struct FakeTransport {
    pub upstream: Upstream,
    lock: Mutex<()>,
    pub offline: AtomicBool,
    pub fetches: Mutex<Vec<Option<String>>>,
    pub pushes: AtomicUsize,
    pub refused_pushes: AtomicUsize,
}

impl FakeTransport {
    pub fn new(upstream: Upstream) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            lock: Mutex::new(()),
            offline: AtomicBool::new(false),
            fetches: Mutex::new(Vec::new()),
            pushes: AtomicUsize::new(0),
            refused_pushes: AtomicUsize::new(0),
        })
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> Vec<Option<String>> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    /// Pushes turned away while offline
    pub fn refused_pushes(&self) -> usize {
        self.refused_pushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BundleTransport for FakeTransport {
    async fn fetch(
        &self,
        _sitename: &str,
        last_synced_commit: Option<&str>,
        dest: &Path,
    ) -> SyncResult<FetchOutcome> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::network(None));
        }
        let _serialized = self.lock.lock().unwrap();
        self.fetches
            .lock()
            .unwrap()
            .push(last_synced_commit.map(str::to_string));

        if last_synced_commit == Some(self.upstream.head().as_str()) {
            return Ok(FetchOutcome::NotModified);
        }
        self.upstream.bundle(last_synced_commit, dest);
        let bytes = fs::metadata(dest).unwrap().len();
        Ok(FetchOutcome::Bundle { bytes })
    }

    async fn push(&self, _sitename: &str, bundle: &Path) -> SyncResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            self.refused_pushes.fetch_add(1, Ordering::SeqCst);
            return Err(SyncError::network(None));
        }
        let _serialized = self.lock.lock().unwrap();
        self.upstream.apply(bundle);
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Callbacks that record everything and answer protected-file prompts
/// with a configurable verdict
#[derive(Default)]
pub struct RecordingCallbacks {
    pub network_errors: Mutex<Vec<String>>,
    pub sync_errors: Mutex<Vec<String>>,
    pub protected_prompts: Mutex<Vec<PathBuf>>,
    pub allow_protected: AtomicBool,
    pub stop: AtomicBool,
}

impl RecordingCallbacks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn protected_prompts(&self) -> Vec<PathBuf> {
        self.protected_prompts.lock().unwrap().clone()
    }
}

impl SyncCallbacks for RecordingCallbacks {
    fn on_network_error(&self, message: &str) {
        self.network_errors.lock().unwrap().push(message.to_string());
    }

    fn on_sync_error(&self, message: &str) {
        self.sync_errors.lock().unwrap().push(message.to_string());
    }

    fn on_protected_file_change(&self, path: &Path) -> bool {
        self.protected_prompts
            .lock()
            .unwrap()
            .push(path.to_path_buf());
        self.allow_protected.load(Ordering::SeqCst)
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

pub fn context(
    transport: &Arc<FakeTransport>,
    callbacks: &Arc<RecordingCallbacks>,
) -> SyncContext {
    SyncContext {
        registry: Arc::new(SessionRegistry::new()),
        transport: Arc::clone(transport) as Arc<dyn BundleTransport>,
        callbacks: Arc::clone(callbacks) as Arc<dyn SyncCallbacks>,
        email: EMAIL.to_string(),
    }
}

/// Options with a poll interval long enough that tests drive polls by hand
pub fn options(sitename: Option<&str>, path: &Path) -> SyncOptions {
    SyncOptions {
        sitename: sitename.map(str::to_string),
        path: path.to_path_buf(),
        poll_interval: Duration::from_secs(3600),
        debounce: Duration::from_millis(200),
        enforce_protected_files: false,
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
