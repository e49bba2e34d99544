//! Protected file set
//!
//! Paths listed in `.protected_files` (a JSON array of paths relative to the
//! synced directory) must not be overwritten by an incoming merge without the
//! operator's consent. The set is read once when a session starts.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::site::PROTECTED_FILES_FILENAME;

/// Ordered, duplicate-free list of protected relative paths
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtectedFileSet {
    paths: Vec<PathBuf>,
}

impl ProtectedFileSet {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut set = Self::default();
        for path in paths {
            let path = normalize(path.as_ref());
            if path.as_os_str().is_empty() {
                continue;
            }
            if !set.paths.contains(&path) {
                set.paths.push(path);
            }
        }
        set
    }

    /// Load the set from `.protected_files` in `dir`
    ///
    /// A missing file yields an empty set. Malformed content is reported
    /// rather than ignored.
    pub fn load(dir: &Path) -> SyncResult<Self> {
        let path = dir.join(PROTECTED_FILES_FILENAME);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No protected files list in {:?}", dir);
                return Ok(Self::default());
            }
            Err(e) => return Err(SyncError::io(path, e)),
        };

        let entries: Vec<String> = serde_json::from_str(&content).map_err(|e| {
            warn!("Malformed protected files list {:?}: {}", path, e);
            SyncError::io(
                path.clone(),
                io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
            )
        })?;

        let set = Self::new(entries);
        debug!("Loaded {} protected path(s)", set.len());
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        let path = normalize(path);
        self.paths.iter().any(|p| *p == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().map(PathBuf::as_path)
    }

    /// Protected paths touched by `incoming`, in protected-set order
    pub fn affected_by(&self, incoming: &[PathBuf]) -> Vec<&Path> {
        let incoming: Vec<PathBuf> = incoming.iter().map(|p| normalize(p)).collect();
        self.paths
            .iter()
            .filter(|p| incoming.contains(p))
            .map(PathBuf::as_path)
            .collect()
    }
}

/// Strip `./` prefixes and redundant separators so lookups compare equal
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir | Component::RootDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let set = ProtectedFileSet::load(temp_dir.path()).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_load_dedupes_and_keeps_order() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(PROTECTED_FILES_FILENAME),
            r#"["templates/base.html", "./static/site.css", "templates/base.html"]"#,
        )
        .unwrap();

        let set = ProtectedFileSet::load(temp_dir.path()).unwrap();
        let paths: Vec<_> = set.iter().collect();
        assert_eq!(
            paths,
            vec![Path::new("templates/base.html"), Path::new("static/site.css")]
        );
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(PROTECTED_FILES_FILENAME), "{not json").unwrap();
        assert!(ProtectedFileSet::load(temp_dir.path()).is_err());
    }

    #[test]
    fn test_affected_by() {
        let set = ProtectedFileSet::new(["a.html", "b.html", "c.html"]);
        let incoming = vec![
            PathBuf::from("c.html"),
            PathBuf::from("z.txt"),
            PathBuf::from("./a.html"),
        ];
        assert_eq!(
            set.affected_by(&incoming),
            vec![Path::new("a.html"), Path::new("c.html")]
        );
        assert!(set.contains(Path::new("./b.html")));
    }
}
