//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/cmscloud/config.toml)
//! 3. Environment variables (CMSCLOUD_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable prefix
const ENV_PREFIX: &str = "CMSCLOUD";

/// Control panel used when nothing else is configured
pub const DEFAULT_HOST: &str = "https://control.aldryn.com";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Control panel base URL
    #[serde(default = "default_host")]
    pub host: String,

    /// Seconds between upstream polls while syncing
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Quiet period before a burst of local edits is committed
    #[serde(default = "default_debounce")]
    pub debounce_millis: u64,

    /// Timeout for a single HTTP request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Gate incoming merges on the `.protected_files` list
    #[serde(default)]
    pub enforce_protected_files: bool,

    /// Credential file (defaults to ~/.netrc)
    #[serde(default)]
    pub netrc_path: Option<PathBuf>,

    /// Log file (defaults to stderr)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            poll_interval_secs: default_poll_interval(),
            debounce_millis: default_debounce(),
            request_timeout_secs: default_request_timeout(),
            enforce_protected_files: false,
            netrc_path: None,
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (CMSCLOUD_HOST, CMSCLOUD_POLL_INTERVAL, ...)
    /// 2. Config file (~/.config/cmscloud/config.toml or CMSCLOUD_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring an explicit path from the command line
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_HOST", ENV_PREFIX)) {
            if !val.is_empty() {
                self.host = val;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_POLL_INTERVAL", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.poll_interval_secs = secs;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_DEBOUNCE_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.debounce_millis = ms;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_PROTECT_FILES", ENV_PREFIX)) {
            self.enforce_protected_files = val.eq_ignore_ascii_case("true") || val == "1";
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.host.starts_with("http://") || self.host.starts_with("https://")) {
            bail!("Invalid host '{}': expected an http(s) URL", self.host);
        }
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than zero");
        }
        Ok(())
    }

    /// Set a single key from its string form (used by `cmscloud config set`)
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "host" => self.host = value.trim_end_matches('/').to_string(),
            "poll_interval_secs" => {
                self.poll_interval_secs = value.parse().context("Expected a number of seconds")?
            }
            "debounce_millis" => {
                self.debounce_millis = value
                    .parse()
                    .context("Expected a number of milliseconds")?
            }
            "request_timeout_secs" => {
                self.request_timeout_secs =
                    value.parse().context("Expected a number of seconds")?
            }
            "enforce_protected_files" => {
                self.enforce_protected_files = value.eq_ignore_ascii_case("true") || value == "1"
            }
            "netrc_path" => {
                self.netrc_path = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "log_file" => {
                self.log_file = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            _ => bail!(
                "Unknown config key '{}'. Valid keys: host, poll_interval_secs, debounce_millis, \
                 request_timeout_secs, enforce_protected_files, netrc_path, log_file",
                key
            ),
        }
        self.validate()
    }

    /// Save configuration to a file
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with CMSCLOUD_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cmscloud")
            .join("config.toml")
    }

    /// Credential file in use
    pub fn netrc_file(&self) -> PathBuf {
        self.netrc_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".netrc")
        })
    }

    /// Host name (no scheme, no port path) used as the credential key
    pub fn host_key(&self) -> &str {
        let without_scheme = self
            .host
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.host);
        without_scheme.split('/').next().unwrap_or(without_scheme)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_debounce() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "CMSCLOUD_HOST",
        "CMSCLOUD_POLL_INTERVAL",
        "CMSCLOUD_DEBOUNCE_MS",
        "CMSCLOUD_PROTECT_FILES",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, DEFAULT_HOST);
        assert!(!config.enforce_protected_files);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.debounce(), Duration::from_millis(1000));
    }

    #[test]
    fn test_host_key() {
        let mut config = Config::default();
        assert_eq!(config.host_key(), "control.aldryn.com");

        config.host = "http://localhost:8000/".to_string();
        assert_eq!(config.host_key(), "localhost:8000");
    }

    #[test]
    fn test_env_override_host() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("CMSCLOUD_HOST", "http://localhost:8000");
        config.apply_env_overrides();
        assert_eq!(config.host, "http://localhost:8000");
    }

    #[test]
    fn test_env_override_protect_files() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("CMSCLOUD_PROTECT_FILES", "1");
        config.apply_env_overrides();
        assert!(config.enforce_protected_files);

        env::set_var("CMSCLOUD_PROTECT_FILES", "no");
        config.apply_env_overrides();
        assert!(!config.enforce_protected_files);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            host = "https://example.com"
            poll_interval_secs = 3
            enforce_protected_files = true
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.host, "https://example.com");
        assert_eq!(config.poll_interval_secs, 3);
        assert!(config.enforce_protected_files);
        assert_eq!(config.debounce_millis, 1000);
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        let _guard = EnvGuard::new(ENV_VARS);

        let result = Config::load_from_str("poll_interval_secs = 0");
        assert!(result.is_err());
    }

    #[test]
    fn test_set_and_save_round_trip() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.set("host", "http://localhost:8000/").unwrap();
        config.set("debounce_millis", "250").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.host, "http://localhost:8000");
        assert_eq!(loaded.debounce_millis, 250);
    }

    #[test]
    fn test_set_unknown_key() {
        let mut config = Config::default();
        let err = config.set("colour", "blue").unwrap_err();
        assert!(err.to_string().contains("Unknown config key"));
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config::load_from_path(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
    }
}
