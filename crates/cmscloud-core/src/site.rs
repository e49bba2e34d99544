//! Site binding for a synced directory
//!
//! A directory is bound to one site through the `.cmscloud` marker, a single
//! line holding the sitename. The marker is written only after the first
//! successful sync.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{SyncError, SyncResult};

/// Marker recording the site a directory is bound to
pub const SITE_MARKER_FILENAME: &str = ".cmscloud";

/// Upstream bundle downloaded from the server
pub const BUNDLE_FILENAME: &str = ".develop.bundle";

/// Outgoing bundle of local commits
pub const PUSH_BUNDLE_FILENAME: &str = ".develop-push.bundle";

/// Files that may not be silently overwritten by incoming merges
pub const PROTECTED_FILES_FILENAME: &str = ".protected_files";

/// Remote alias pointing at the downloaded bundle
pub const BUNDLE_REMOTE: &str = "develop_bundle";

/// Branch tracking the upstream mainline
pub const DEVELOP_BRANCH: &str = "develop";

/// Remote-tracking ref the develop branch is merged from
pub const UPSTREAM_REF: &str = "develop_bundle/develop";

/// Ignore rules enforced in every synced repository
pub const IGNORE_PATTERNS: &[&str] = &[".*", "!.gitignore", "/db_dumps/"];

/// Normalize a sitename: a domain is reduced to its first label
///
/// `"demo.cloud.example.com"` becomes `"demo"`. Returns `None` for empty
/// input.
pub fn normalize_sitename(raw: &str) -> Option<String> {
    let name = raw.trim().split('.').next().unwrap_or("").trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn marker_path(dir: &Path) -> PathBuf {
    dir.join(SITE_MARKER_FILENAME)
}

/// Read the sitename a directory is bound to, if any
pub fn read_marker(dir: &Path) -> SyncResult<Option<String>> {
    let path = marker_path(dir);
    match fs::read_to_string(&path) {
        Ok(content) => {
            let name = content.trim();
            Ok(if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SyncError::io(path, e)),
    }
}

/// Bind a directory to a sitename
pub fn write_marker(dir: &Path, sitename: &str) -> SyncResult<()> {
    let path = marker_path(dir);
    fs::write(&path, sitename).map_err(|e| SyncError::io(path, e))
}

/// Pick the sitename for a sync request and check it against the marker
///
/// An explicit name wins over the recorded one, but the two must agree when
/// both exist.
pub fn resolve_sitename(dir: &Path, requested: Option<&str>) -> SyncResult<String> {
    let recorded = read_marker(dir)?;

    let raw = match requested.filter(|s| !s.trim().is_empty()) {
        Some(name) => name.to_string(),
        None => recorded.clone().ok_or(SyncError::MissingSitename)?,
    };
    let sitename = normalize_sitename(&raw).ok_or(SyncError::MissingSitename)?;

    if let Some(existing) = recorded {
        if existing != sitename {
            return Err(SyncError::ConfigMismatch {
                existing,
                requested: sitename,
            });
        }
    }

    Ok(sitename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_sitename() {
        assert_eq!(normalize_sitename("demo"), Some("demo".to_string()));
        assert_eq!(
            normalize_sitename("demo.cloud.example.com"),
            Some("demo".to_string())
        );
        assert_eq!(normalize_sitename("  demo \n"), Some("demo".to_string()));
        assert_eq!(normalize_sitename(""), None);
        assert_eq!(normalize_sitename(".example.com"), None);
    }

    #[test]
    fn test_marker_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(read_marker(temp_dir.path()).unwrap(), None);

        write_marker(temp_dir.path(), "demo").unwrap();
        assert_eq!(read_marker(temp_dir.path()).unwrap(), Some("demo".to_string()));
    }

    #[test]
    fn test_resolve_requires_a_name() {
        let temp_dir = TempDir::new().unwrap();
        let err = resolve_sitename(temp_dir.path(), None).unwrap_err();
        assert!(matches!(err, SyncError::MissingSitename));
    }

    #[test]
    fn test_resolve_falls_back_to_marker() {
        let temp_dir = TempDir::new().unwrap();
        write_marker(temp_dir.path(), "demo\n").unwrap();
        assert_eq!(resolve_sitename(temp_dir.path(), None).unwrap(), "demo");
    }

    #[test]
    fn test_resolve_accepts_domain_matching_marker() {
        let temp_dir = TempDir::new().unwrap();
        write_marker(temp_dir.path(), "demo").unwrap();
        assert_eq!(
            resolve_sitename(temp_dir.path(), Some("demo.example.com")).unwrap(),
            "demo"
        );
    }

    #[test]
    fn test_resolve_rejects_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        write_marker(temp_dir.path(), "alpha").unwrap();

        let err = resolve_sitename(temp_dir.path(), Some("beta")).unwrap_err();
        match err {
            SyncError::ConfigMismatch { existing, requested } => {
                assert_eq!(existing, "alpha");
                assert_eq!(requested, "beta");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
