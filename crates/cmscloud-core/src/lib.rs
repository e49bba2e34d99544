//! cmscloud Core Library
//!
//! Keeps a local directory in two-way sync with a site's git repository on
//! the control panel. Upstream state arrives as git bundles over HTTP; local
//! edits are committed as they settle and pushed back the same way.
//!
//! # Architecture
//!
//! - **Lock**: one marker file per directory, one session per directory
//! - **Transport**: bundle download/upload behind [`BundleTransport`]
//! - **Repository**: git operations behind [`LocalRepository`]
//! - **Watcher**: debounced filesystem events
//! - **Handler**: the running session, polling and committing
//!
//! # Quick Start
//!
//! ```text
//! let registry = Arc::new(SessionRegistry::new());
//! let context = SyncContext { registry, transport, callbacks, email };
//! let options = SyncOptions::from_config(&config, Some("demo".into()), path);
//!
//! let handler = start_sync(options, LockPolicy::NonInteractive { force: false }, &context).await?;
//! // ... later
//! handler.stop().await;
//! ```
//!
//! # Modules
//!
//! - `sync`: session startup (main entry point)
//! - `handler`: running session
//! - `session`: session registry and snapshots
//! - `lock`, `transport`, `repo`, `watcher`: sync building blocks
//! - `api`, `credentials`: login and site listing
//! - `config`: application configuration

pub mod api;
pub mod callbacks;
pub mod config;
pub mod credentials;
pub mod error;
pub mod handler;
pub mod lock;
pub mod protected;
pub mod repo;
pub mod session;
pub mod site;
pub mod sync;
pub mod transport;
pub mod watcher;

pub use api::{ApiClient, ApiError};
pub use callbacks::{Confirm, LoggingCallbacks, SyncCallbacks};
pub use config::Config;
pub use credentials::{Credential, CredentialStore, MemoryStore, NetrcStore};
pub use error::{SyncError, SyncResult};
pub use handler::{HandlerOptions, SyncHandler};
pub use lock::LockGuard;
pub use protected::ProtectedFileSet;
pub use repo::{GitRepository, LocalRepository, MergeOutcome};
pub use session::{RemoteBundleRef, SessionRegistry, SessionState, SyncSession};
pub use sync::{start_sync, LockPolicy, SyncContext, SyncOptions};
pub use transport::{BundleTransport, FetchOutcome, HttpBundleTransport};
pub use watcher::{ChangeBatch, ChangeWatcher, WatcherState};
