//! Callback interface between a running sync session and its owner
//!
//! A session runs on background tasks, so nothing it does can be returned to
//! the caller. Everything the operator needs to know or decide goes through
//! these hooks instead.

use std::path::Path;

/// Warning shown before a protected file is overwritten
pub fn protected_file_change_message(path: &Path) -> String {
    format!(
        "You are overriding file \"{}\".\nThis file is protected by the boilerplate.",
        path.display()
    )
}

/// Hooks a sync session calls while running
pub trait SyncCallbacks: Send + Sync {
    /// A transport operation failed for lack of connectivity
    fn on_network_error(&self, message: &str);

    /// A non-network sync failure (merge conflict, git error, server error)
    fn on_sync_error(&self, message: &str);

    /// A protected file is about to change
    ///
    /// Called once per protected path, both before an incoming merge would
    /// overwrite it and when a local edit to it is about to be committed.
    /// Return `true` to let the change through; a refused local edit is
    /// reverted.
    fn on_protected_file_change(&self, path: &Path) -> bool;

    /// Sync activity started (`true`) or finished (`false`)
    fn on_sync_indicator(&self, _active: bool) {}

    /// Polled at each cycle boundary; return `true` to stop the session
    fn should_stop(&self) -> bool {
        false
    }
}

/// Callbacks that log and refuse every protected-file overwrite
pub struct LoggingCallbacks;

impl SyncCallbacks for LoggingCallbacks {
    fn on_network_error(&self, message: &str) {
        tracing::warn!("{}", message);
    }

    fn on_sync_error(&self, message: &str) {
        tracing::error!("{}", message);
    }

    fn on_protected_file_change(&self, path: &Path) -> bool {
        tracing::warn!("Refusing change to protected file {:?}", path);
        false
    }
}

/// Operator confirmation used during session startup
pub trait Confirm: Send + Sync {
    /// Ask a yes/no question; `message` is shown before the question
    fn confirm(&self, question: &str, message: Option<&str>, default: bool) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_file_change_message() {
        assert_eq!(
            protected_file_change_message(Path::new("templates/base.html")),
            "You are overriding file \"templates/base.html\".\nThis file is protected by the boilerplate."
        );
    }

    #[test]
    fn test_logging_callbacks_refuse_protected_changes() {
        let callbacks = LoggingCallbacks;
        assert!(!callbacks.on_protected_file_change(Path::new("settings.py")));
        assert!(!callbacks.should_stop());
    }
}
