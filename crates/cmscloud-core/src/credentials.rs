//! Stored login tokens
//!
//! One credential per control panel host. [`NetrcStore`] keeps them in a
//! netrc file (`machine`/`login`/`password`), the token in the password
//! field, so other tools sharing the file keep working.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Failed to read credentials from '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write credentials to '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Login name and API token for one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub login: String,
    pub token: String,
}

/// Persistent token storage keyed by host name
pub trait CredentialStore: Send + Sync {
    fn get(&self, host: &str) -> Result<Option<Credential>, CredentialError>;

    fn put(&self, host: &str, credential: &Credential) -> Result<(), CredentialError>;

    /// Forget `host`; returns whether anything was stored
    fn remove(&self, host: &str) -> Result<bool, CredentialError>;
}

/// One `machine` (or `default`) block of a netrc file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct NetrcEntry {
    /// `None` for the `default` block
    machine: Option<String>,
    login: Option<String>,
    account: Option<String>,
    password: Option<String>,
}

/// [`CredentialStore`] backed by a netrc file
pub struct NetrcStore {
    path: PathBuf,
}

impl NetrcStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Vec<NetrcEntry>, CredentialError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(parse_netrc(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(CredentialError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn save(&self, entries: &[NetrcEntry]) -> Result<(), CredentialError> {
        let write_err = |source| CredentialError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        // Tokens never hit the disk while the file is readable by others
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path).map_err(write_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))
                .map_err(write_err)?;
        }
        file.set_len(0).map_err(write_err)?;
        file.write_all(render_netrc(entries).as_bytes())
            .map_err(write_err)?;

        debug!("Wrote {} netrc entries to {:?}", entries.len(), self.path);
        Ok(())
    }
}

impl CredentialStore for NetrcStore {
    fn get(&self, host: &str) -> Result<Option<Credential>, CredentialError> {
        let entries = self.load()?;
        let credential = entries
            .into_iter()
            .find(|e| e.machine.as_deref() == Some(host))
            .and_then(|e| {
                Some(Credential {
                    login: e.login.unwrap_or_default(),
                    token: e.password?,
                })
            });
        Ok(credential)
    }

    fn put(&self, host: &str, credential: &Credential) -> Result<(), CredentialError> {
        let mut entries = self.load()?;
        let entry = NetrcEntry {
            machine: Some(host.to_string()),
            login: Some(credential.login.clone()),
            account: None,
            password: Some(credential.token.clone()),
        };
        match entries
            .iter_mut()
            .find(|e| e.machine.as_deref() == Some(host))
        {
            Some(existing) => *existing = entry,
            None => {
                // `default` has to stay last
                let at = entries
                    .iter()
                    .position(|e| e.machine.is_none())
                    .unwrap_or(entries.len());
                entries.insert(at, entry);
            }
        }
        self.save(&entries)
    }

    fn remove(&self, host: &str) -> Result<bool, CredentialError> {
        let mut entries = self.load()?;
        let before = entries.len();
        entries.retain(|e| e.machine.as_deref() != Some(host));
        if entries.len() == before {
            return Ok(false);
        }
        self.save(&entries)?;
        Ok(true)
    }
}

fn parse_netrc(content: &str) -> Vec<NetrcEntry> {
    let mut entries: Vec<NetrcEntry> = Vec::new();
    let mut in_macro = false;

    for line in content.lines() {
        // Macro bodies run until the next blank line
        if in_macro {
            if line.trim().is_empty() {
                in_macro = false;
            }
            continue;
        }
        if line.trim_start().starts_with('#') {
            continue;
        }

        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            match token {
                "machine" => entries.push(NetrcEntry {
                    machine: tokens.next().map(str::to_string),
                    ..NetrcEntry::default()
                }),
                "default" => entries.push(NetrcEntry::default()),
                "login" | "user" | "account" | "password" => {
                    let value = tokens.next().map(str::to_string);
                    if let Some(entry) = entries.last_mut() {
                        match token {
                            "account" => entry.account = value,
                            "password" => entry.password = value,
                            _ => entry.login = value,
                        }
                    }
                }
                "macdef" => {
                    in_macro = true;
                    break;
                }
                _ => {}
            }
        }
    }
    entries
}

fn render_netrc(entries: &[NetrcEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        match entry.machine {
            Some(ref machine) => {
                let _ = writeln!(out, "machine {}", machine);
            }
            None => out.push_str("default\n"),
        }
        if let Some(ref login) = entry.login {
            let _ = writeln!(out, "\tlogin {}", login);
        }
        if let Some(ref account) = entry.account {
            let _ = writeln!(out, "\taccount {}", account);
        }
        if let Some(ref password) = entry.password {
            let _ = writeln!(out, "\tpassword {}", password);
        }
    }
    out
}

/// [`CredentialStore`] that lives only as long as the process
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Credential>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(host: &str, credential: Credential) -> Self {
        let store = Self::default();
        store.lock().insert(host.to_string(), credential);
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Credential>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, host: &str) -> Result<Option<Credential>, CredentialError> {
        Ok(self.lock().get(host).cloned())
    }

    fn put(&self, host: &str, credential: &Credential) -> Result<(), CredentialError> {
        self.lock().insert(host.to_string(), credential.clone());
        Ok(())
    }

    fn remove(&self, host: &str) -> Result<bool, CredentialError> {
        Ok(self.lock().remove(host).is_some())
    }
}
