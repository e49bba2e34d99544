//! cmscloud CLI
//!
//! Command-line interface for cmscloud - log in to the control panel and
//! keep a local directory in sync with a site's repository.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cmscloud_core::{Config, Confirm};

mod commands;
mod output;
mod prompt;

use commands::sync::SyncArgs;
use output::{Output, OutputFormat};
use prompt::StdinConfirm;

#[derive(Parser)]
#[command(name = "cmscloud")]
#[command(about = "cmscloud - sync local directories with your cloud sites")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Never prompt; refuse protected-file changes and held locks
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Config file to use instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in to the control panel
    Login {
        /// Account email (prompted when omitted)
        #[arg(short, long)]
        email: Option<String>,
        /// Account password (prompted when omitted)
        #[arg(long)]
        password: Option<String>,
    },
    /// Forget the stored login
    Logout,
    /// List the sites you can access
    Sites,
    /// Sync a directory with a site
    Sync {
        /// Site to sync (defaults to the one recorded in the directory)
        #[arg(short, long)]
        sitename: Option<String>,
        /// Directory to sync (defaults to the current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,
        /// Take over the directory lock without asking
        #[arg(short, long)]
        force: bool,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (host, poll_interval_secs, debounce_millis, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let interactive = !cli.non_interactive && output.should_prompt();

    // Config commands work even with a broken config file
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), cli.config.as_ref(), &output);
    }

    let config = Config::load_with_cli_override(cli.config.as_ref())
        .context("Failed to load configuration")?;
    init_logging(&config);

    let api = commands::api_client(&config)?;

    match cli.command {
        Commands::Login { email, password } => {
            commands::auth::login(&api, email, password, interactive, &output).await
        }
        Commands::Logout => {
            let confirm = interactive.then_some(&StdinConfirm as &dyn Confirm);
            commands::auth::logout(&api, confirm, &output)
        }
        Commands::Sites => commands::sites::list(&api, &output).await,
        Commands::Sync {
            sitename,
            path,
            force,
        } => {
            let args = SyncArgs {
                sitename,
                path,
                force,
                interactive,
            };
            commands::sync::sync(&api, &config, args, &output).await
        }
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Initialize logging
///
/// Only initializes if CMSCLOUD_LOG environment variable is set.
/// Logs to config.log_file, or stderr when none is configured.
fn init_logging(config: &Config) {
    let Ok(log_level) = std::env::var("CMSCLOUD_LOG") else {
        return;
    };

    let env_filter = EnvFilter::new(format!(
        "cmscloud_core={},cmscloud_cli={}",
        log_level, log_level
    ));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    // Ignore error if already initialized
    match &config.log_file {
        Some(log_path) => {
            let log_file = match File::create(log_path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Warning: Could not create log file {:?}: {}", log_path, e);
                    return;
                }
            };
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(log_file))
                .try_init();
            info!("Logging to {:?}", log_path);
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_sync_flags() {
        let cli = Cli::parse_from([
            "cmscloud",
            "--non-interactive",
            "sync",
            "--sitename",
            "demo",
            "--path",
            "/tmp/demo",
            "--force",
        ]);
        assert!(cli.non_interactive);
        match cli.command {
            Commands::Sync {
                sitename,
                path,
                force,
            } => {
                assert_eq!(sitename.as_deref(), Some("demo"));
                assert_eq!(path, Some(PathBuf::from("/tmp/demo")));
                assert!(force);
            }
            _ => panic!("expected sync command"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["cmscloud", "sites", "--json"]);
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Sites));
    }
}
