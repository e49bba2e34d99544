//! Site listing handler

use anyhow::{bail, Result};
use cmscloud_core::ApiClient;

use crate::output::Output;

/// List the sites the logged-in account can access
pub async fn list(api: &ApiClient, output: &Output) -> Result<()> {
    if !api.is_logged_in()? {
        bail!("Not logged in. Run `cmscloud login` first.");
    }
    let sites = api.sites().await?;
    output.print_sites(&sites);
    Ok(())
}
