//! Sync error handling
//!
//! Typed errors for the sync engine with the human-readable messages shown
//! to the operator. Errors raised while a session is running are delivered
//! through [`SyncCallbacks`](crate::callbacks::SyncCallbacks); errors raised
//! during startup are returned to the caller.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Shown when the initial sync cannot reach the server
pub const NETWORK_ERROR_MESSAGE: &str =
    "Network error.\nPlease check your connection and try again later.";

/// Shown when a running session cannot reach the server
pub const SYNC_NETWORK_ERROR_MESSAGE: &str =
    "Couldn't sync changes.\nPlease check your connection and try again later.";

/// Shown when another session holds the directory lock
pub const DIRECTORY_ALREADY_SYNCING_MESSAGE: &str = "Directory already syncing.";

/// Errors that can occur while starting or running a sync session
#[derive(Error, Debug)]
pub enum SyncError {
    /// Connectivity failure (refused, timed out, dropped mid-body)
    #[error("{message}")]
    Network {
        message: &'static str,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Directory is bound to a different site
    #[error("This directory is already being synced with website \"{existing}\"")]
    ConfigMismatch { existing: String, requested: String },

    /// No sitename given and none recorded in the directory
    #[error("Please specify a sitename using --sitename.")]
    MissingSitename,

    /// A session for this site is already running in this process
    #[error("Site \"{0}\" is already being synced by this process")]
    AlreadySyncing(String),

    /// Lock file present and no override was given
    #[error("{}", DIRECTORY_ALREADY_SYNCING_MESSAGE)]
    LockHeld { path: PathBuf },

    /// Operator declined to continue
    #[error("Aborted")]
    Aborted,

    /// Upstream changes could not be merged cleanly
    #[error("Merge conflict in: {}", display_paths(.paths))]
    MergeConflict { paths: Vec<PathBuf> },

    /// Operator refused to let a merge overwrite a protected file
    #[error("Incoming change to protected file \"{}\" was rejected", .path.display())]
    ProtectedFileConflict { path: PathBuf },

    /// Server answered with something other than 200/304
    #[error("Unexpected HTTP Response {status}{}", body_suffix(.body))]
    UnexpectedResponse { status: u16, body: Option<String> },

    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Client(#[source] reqwest::Error),

    /// No upstream state could be found after the initial fetch
    #[error("No upstream state found for \"{0}\"")]
    NoUpstream(String),

    /// The git binary failed
    #[error("git {command} failed: {stderr}")]
    GitCommand { command: String, stderr: String },

    /// libgit2 failure
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    /// Filesystem watcher failure
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// A blocking repository task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    /// I/O failure on a specific path
    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SyncError {
    /// Network error carrying the message for the initial sync
    pub fn network(source: Option<reqwest::Error>) -> Self {
        SyncError::Network {
            message: NETWORK_ERROR_MESSAGE,
            source,
        }
    }

    /// Attach a path to an I/O error
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this is a connectivity failure
    ///
    /// Network errors are never retried internally; the next poll cycle or a
    /// fresh `sync` invocation is the retry.
    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Network { .. })
    }

    /// Whether the operator has to change something before syncing again
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::ConfigMismatch { .. }
                | SyncError::MissingSitename
                | SyncError::MergeConflict { .. }
                | SyncError::NoUpstream(_)
        )
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn body_suffix(body: &Option<String>) -> String {
    match body {
        Some(body) if !body.is_empty() => format!("\n{}", body),
        _ => String::new(),
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_message_is_fixed() {
        let err = SyncError::network(None);
        assert_eq!(err.to_string(), NETWORK_ERROR_MESSAGE);
        assert!(err.is_network());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_unexpected_response_includes_body() {
        let err = SyncError::UnexpectedResponse {
            status: 404,
            body: Some("no such site".to_string()),
        };
        assert_eq!(err.to_string(), "Unexpected HTTP Response 404\nno such site");

        let err = SyncError::UnexpectedResponse {
            status: 502,
            body: None,
        };
        assert_eq!(err.to_string(), "Unexpected HTTP Response 502");
    }

    #[test]
    fn test_mismatch_display() {
        let err = SyncError::ConfigMismatch {
            existing: "alpha".to_string(),
            requested: "beta".to_string(),
        };
        assert!(err.to_string().contains("\"alpha\""));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_lock_held_uses_fixed_message() {
        let err = SyncError::LockHeld {
            path: PathBuf::from("/tmp/site"),
        };
        assert_eq!(err.to_string(), DIRECTORY_ALREADY_SYNCING_MESSAGE);
    }

    #[test]
    fn test_merge_conflict_lists_paths() {
        let err = SyncError::MergeConflict {
            paths: vec![PathBuf::from("a.html"), PathBuf::from("css/b.css")],
        };
        assert_eq!(err.to_string(), "Merge conflict in: a.html, css/b.css");
    }
}
