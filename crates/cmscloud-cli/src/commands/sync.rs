//! Sync command handler

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;

use cmscloud_core::{
    start_sync, ApiClient, BundleTransport, Config, LockPolicy, SessionRegistry, SyncCallbacks,
    SyncContext, SyncOptions,
};

use crate::output::Output;
use crate::prompt::{StdinConfirm, TerminalCallbacks};

/// Shown once the session is running in interactive mode
pub const WATCHING_BANNER: &str =
    "Done, now watching for changes. You can stop the sync by hitting Ctrl-c in this shell";

/// How often the foreground loop checks that the session is still running
const LIVENESS_CHECK: Duration = Duration::from_secs(1);

pub struct SyncArgs {
    pub sitename: Option<String>,
    pub path: Option<PathBuf>,
    pub force: bool,
    pub interactive: bool,
}

/// Sync a directory until interrupted or the session ends on its own
pub async fn sync(api: &ApiClient, config: &Config, args: SyncArgs, output: &Output) -> Result<()> {
    let Some(email) = api.login_email()? else {
        bail!("Not logged in. Run `cmscloud login` first.");
    };

    let path = match args.path {
        Some(path) => path,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };

    let registry = Arc::new(SessionRegistry::new());
    let transport: Arc<dyn BundleTransport> = Arc::new(api.bundle_transport()?);
    let callbacks: Arc<dyn SyncCallbacks> =
        Arc::new(TerminalCallbacks::new(args.interactive, output.is_quiet()));
    let context = SyncContext {
        registry: Arc::clone(&registry),
        transport,
        callbacks,
        email,
    };

    let options = SyncOptions::from_config(config, args.sitename, path);
    let confirm = StdinConfirm;
    let policy = if args.interactive {
        LockPolicy::Interactive(&confirm)
    } else {
        LockPolicy::NonInteractive { force: args.force }
    };

    output.message("Syncing...");
    let handler = start_sync(options, policy, &context).await?;
    let sitename = handler.sitename().to_string();

    if output.is_json() {
        println!("{}", serde_json::to_string(&handler.session())?);
    } else {
        output.message(WATCHING_BANNER);
    }

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-c")?;
                info!("Interrupted, stopping {}", sitename);
                handler.stop().await;
                break;
            }
            _ = tokio::time::sleep(LIVENESS_CHECK) => {
                if !registry.is_syncing(&sitename) {
                    break;
                }
            }
        }
    }

    output.success("Stopped syncing");
    Ok(())
}
