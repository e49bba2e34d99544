//! Command handlers

pub mod auth;
pub mod config;
pub mod sites;
pub mod sync;

use std::sync::Arc;

use anyhow::{Context, Result};
use cmscloud_core::{ApiClient, Config, NetrcStore};

/// Account client backed by the configured netrc file
pub fn api_client(config: &Config) -> Result<ApiClient> {
    let store = NetrcStore::new(config.netrc_file());
    ApiClient::new(config, Arc::new(store)).context("Failed to create HTTP client")
}
