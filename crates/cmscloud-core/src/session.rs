//! Sync sessions and the process-wide registry
//!
//! A [`SessionRegistry`] tracks at most one running [`SyncHandler`] per
//! sitename. The caller owns the registry and passes it to
//! [`start_sync`](crate::sync::start_sync); handlers remove themselves when
//! they stop.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::handler::SyncHandler;

/// Lifecycle of a sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Watching,
    Syncing,
    Stopping,
    Stopped,
}

impl SessionState {
    /// Whether the session is still doing work
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Watching | SessionState::Syncing
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Starting => "starting",
            SessionState::Watching => "watching",
            SessionState::Syncing => "syncing",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of a running session
#[derive(Debug, Clone, Serialize)]
pub struct SyncSession {
    pub sitename: String,
    pub local_path: PathBuf,
    pub last_synced_commit: Option<String>,
    pub lock_held: bool,
    pub protected_files: Vec<PathBuf>,
    pub state: SessionState,
}

/// Upstream position the server compares against
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteBundleRef {
    pub sitename: String,
    pub last_synced_commit: Option<String>,
}

/// Running sessions keyed by sitename
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SyncHandler>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<SyncHandler>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a handler; fails if its sitename is already tracked
    pub fn insert(&self, handler: Arc<SyncHandler>) -> SyncResult<()> {
        let mut sessions = self.sessions();
        let sitename = handler.sitename().to_string();
        if sessions.contains_key(&sitename) {
            return Err(SyncError::AlreadySyncing(sitename));
        }
        debug!("Registered sync session for {}", sitename);
        sessions.insert(sitename, handler);
        Ok(())
    }

    pub fn remove(&self, sitename: &str) -> Option<Arc<SyncHandler>> {
        self.sessions().remove(sitename)
    }

    /// Remove `sitename` only if it still maps to `handler`
    pub(crate) fn unregister(&self, sitename: &str, handler: &SyncHandler) {
        let mut sessions = self.sessions();
        if sessions
            .get(sitename)
            .is_some_and(|h| std::ptr::eq(Arc::as_ptr(h), handler))
        {
            sessions.remove(sitename);
            debug!("Unregistered sync session for {}", sitename);
        }
    }

    pub fn get(&self, sitename: &str) -> Option<Arc<SyncHandler>> {
        self.sessions().get(sitename).cloned()
    }

    /// Whether a session for `sitename` is running in this process
    pub fn is_syncing(&self, sitename: &str) -> bool {
        self.sessions().contains_key(sitename)
    }

    pub fn sitenames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Stop every tracked session
    pub async fn stop_all(&self) {
        let handlers: Vec<Arc<SyncHandler>> = self.sessions().values().cloned().collect();
        for handler in handlers {
            handler.stop().await;
        }
    }
}
