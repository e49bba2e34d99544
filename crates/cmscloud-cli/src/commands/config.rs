//! Config command handlers

use std::path::PathBuf;

use anyhow::{Context, Result};

use cmscloud_core::Config;

use crate::output::{Output, OutputFormat};

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(not set)".to_string())
}

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("Failed to serialize config")?
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.host);
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  host:                    {}", config.host);
            println!("  poll_interval_secs:      {}", config.poll_interval_secs);
            println!("  debounce_millis:         {}", config.debounce_millis);
            println!("  request_timeout_secs:    {}", config.request_timeout_secs);
            println!(
                "  enforce_protected_files: {}",
                config.enforce_protected_files
            );
            println!("  netrc_path:              {}", display_path(&config.netrc_path));
            println!("  log_file:                {}", display_path(&config.log_file));
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    config.set(&key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_writes_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        let output = Output::new(OutputFormat::Quiet);

        set(
            "poll_interval_secs".to_string(),
            "30".to_string(),
            Some(&path),
            &output,
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("poll_interval_secs = 30"));
    }

    #[test]
    fn test_set_rejects_unknown_key() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        let output = Output::new(OutputFormat::Quiet);

        assert!(set("colour".to_string(), "blue".to_string(), Some(&path), &output).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_display_path() {
        assert_eq!(display_path(&None), "(not set)");
        assert_eq!(display_path(&Some(PathBuf::from("/tmp/x.log"))), "/tmp/x.log");
    }
}
