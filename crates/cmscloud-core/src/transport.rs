//! Bundle transport
//!
//! Upstream state is served as a git bundle from
//! `GET /api/v1/git-sync/{sitename}/`. The request carries the last commit
//! we merged; the server answers 304 when nothing changed, so no payload
//! comparison is needed. Bundles can be large, so the body is streamed to
//! disk chunk by chunk.
//!
//! Local commits travel the other way as a bundle `POST`ed to the same URL.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};

/// Result of asking the server for upstream changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Upstream has not moved since `last_synced_commit`
    NotModified,
    /// A bundle of this many bytes was written to the destination
    Bundle { bytes: u64 },
}

/// Moves git bundles between the local directory and the server
#[async_trait]
pub trait BundleTransport: Send + Sync {
    /// Download upstream state newer than `last_synced_commit` into `dest`
    ///
    /// `dest` is only written when the outcome is [`FetchOutcome::Bundle`].
    async fn fetch(
        &self,
        sitename: &str,
        last_synced_commit: Option<&str>,
        dest: &Path,
    ) -> SyncResult<FetchOutcome>;

    /// Upload a bundle of local commits
    async fn push(&self, sitename: &str, bundle: &Path) -> SyncResult<()>;
}

/// [`BundleTransport`] over the control panel's HTTP API
pub struct HttpBundleTransport {
    client: reqwest::Client,
    host: String,
    token: Option<String>,
}

impl HttpBundleTransport {
    /// `timeout` bounds connecting and each idle gap between reads, not the
    /// whole transfer, so large bundles can take as long as they need.
    pub fn new(host: &str, token: Option<String>, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent(concat!("cmscloud/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(SyncError::Client)?;

        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn sync_url(&self, sitename: &str) -> String {
        format!("{}/api/v1/git-sync/{}/", self.host, sitename)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token {
            Some(ref token) => request.header(AUTHORIZATION, format!("Basic {}", token)),
            None => request,
        }
    }
}

#[async_trait]
impl BundleTransport for HttpBundleTransport {
    async fn fetch(
        &self,
        sitename: &str,
        last_synced_commit: Option<&str>,
        dest: &Path,
    ) -> SyncResult<FetchOutcome> {
        let mut request = self
            .client
            .get(self.sync_url(sitename))
            .header(ACCEPT, "application/octet");
        if let Some(commit) = last_synced_commit {
            request = request.query(&[("last_synced_commit", commit)]);
        }

        debug!("Fetching bundle for {} (since {:?})", sitename, last_synced_commit);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| SyncError::network(Some(e)))?;

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                debug!("Upstream for {} not modified", sitename);
                Ok(FetchOutcome::NotModified)
            }
            StatusCode::OK => {
                let bytes = stream_to_file(response, dest).await?;
                info!("Downloaded {} byte bundle for {}", bytes, sitename);
                Ok(FetchOutcome::Bundle { bytes })
            }
            _ => Err(unexpected_response(response).await),
        }
    }

    async fn push(&self, sitename: &str, bundle: &Path) -> SyncResult<()> {
        let body = tokio::fs::read(bundle)
            .await
            .map_err(|e| SyncError::io(bundle, e))?;
        let size = body.len();

        let request = self
            .client
            .post(self.sync_url(sitename))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body);

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| SyncError::network(Some(e)))?;

        if response.status().is_success() {
            info!("Pushed {} byte bundle for {}", size, sitename);
            Ok(())
        } else {
            Err(unexpected_response(response).await)
        }
    }
}

/// Write the response body to `dest` as it arrives
///
/// A partially written file is removed if the stream fails.
async fn stream_to_file(response: Response, dest: &Path) -> SyncResult<u64> {
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| SyncError::io(dest, e))?;

    let result = async {
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SyncError::network(Some(e)))?;
            if chunk.is_empty() {
                break;
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| SyncError::io(dest, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| SyncError::io(dest, e))?;
        Ok(written)
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(dest).await;
    }
    result
}

/// Describe a response that is neither 200 nor 304
///
/// The body is only included for client errors; server error pages are noise.
async fn unexpected_response(response: Response) -> SyncError {
    let status = response.status().as_u16();
    let body = if status < 500 {
        response.text().await.ok().filter(|b| !b.is_empty())
    } else {
        None
    };
    SyncError::UnexpectedResponse { status, body }
}
