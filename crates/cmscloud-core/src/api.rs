//! Control panel account API
//!
//! Login exchanges an email and password for a token, which is kept in the
//! [`CredentialStore`] under the host name and sent as
//! `Authorization: Basic <token>` on later requests.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;
use crate::credentials::{Credential, CredentialError, CredentialStore};
use crate::error::{SyncResult, NETWORK_ERROR_MESSAGE};
use crate::transport::HttpBundleTransport;

/// Shown when the server rejects the credentials without saying why
pub const INVALID_LOGIN_MESSAGE: &str = "Could not log in, invalid email or password";

/// Shown when login fails for any other reason
pub const LOGIN_FAILED_MESSAGE: &str = "There was a problem logging in, please try again later.";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{}", NETWORK_ERROR_MESSAGE)]
    Network(#[source] reqwest::Error),

    /// 403 from the login endpoint; carries the server's explanation
    #[error("{0}")]
    InvalidLogin(String),

    #[error("{}{}", body_prefix(.body), LOGIN_FAILED_MESSAGE)]
    LoginFailed { status: u16, body: Option<String> },

    #[error("Unexpected HTTP Response {status}{}", body_suffix(.body))]
    UnexpectedResponse { status: u16, body: Option<String> },

    #[error("Invalid response from server: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Client(#[source] reqwest::Error),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

fn body_prefix(body: &Option<String>) -> String {
    match body {
        Some(body) if !body.is_empty() => format!("{}\n", body),
        _ => String::new(),
    }
}

fn body_suffix(body: &Option<String>) -> String {
    match body {
        Some(body) if !body.is_empty() => format!("\n{}", body),
        _ => String::new(),
    }
}

/// Client for the login and site listing endpoints
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    host_key: String,
    timeout: Duration,
    credentials: Arc<dyn CredentialStore>,
}

impl ApiClient {
    pub fn new(config: &Config, credentials: Arc<dyn CredentialStore>) -> Result<Self, ApiError> {
        Self::with_host(
            &config.host,
            config.host_key(),
            config.request_timeout(),
            credentials,
        )
    }

    /// Build a client for `base_url`, storing credentials under `host_key`
    pub fn with_host(
        base_url: &str,
        host_key: &str,
        timeout: Duration,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cmscloud/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ApiError::Client)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            host_key: host_key.to_string(),
            timeout,
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn credential(&self) -> Result<Option<Credential>, ApiError> {
        Ok(self.credentials.get(&self.host_key)?)
    }

    pub fn is_logged_in(&self) -> Result<bool, ApiError> {
        Ok(self.credential()?.is_some())
    }

    /// Email of the logged-in account
    pub fn login_email(&self) -> Result<Option<String>, ApiError> {
        Ok(self.credential()?.map(|c| c.login))
    }

    pub fn token(&self) -> Result<Option<String>, ApiError> {
        Ok(self.credential()?.map(|c| c.token))
    }

    fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, ApiError> {
        Ok(match self.token()? {
            Some(token) => request.header(AUTHORIZATION, format!("Basic {}", token)),
            None => request,
        })
    }

    /// Exchange credentials for a token and store it
    ///
    /// Returns the message to show the operator.
    pub async fn login(&self, email: &str, password: &str) -> Result<String, ApiError> {
        debug!("Logging in to {} as {}", self.host_key, email);
        let response = self
            .client
            .post(self.url("/api/v1/login/"))
            .form(&[("email", email), ("password", password)])
            .send()
            .await
            .map_err(ApiError::Network)?;

        let status = response.status();
        if status.is_success() {
            let token = response.text().await.map_err(ApiError::Network)?;
            self.credentials.put(
                &self.host_key,
                &Credential {
                    login: email.to_string(),
                    token: token.trim().to_string(),
                },
            )?;
            info!("Logged in to {} as {}", self.host_key, email);
            return Ok(format!("Logged in as {}", email));
        }

        let body = response.text().await.ok().filter(|b| !b.is_empty());
        if status == StatusCode::FORBIDDEN {
            return Err(ApiError::InvalidLogin(
                body.unwrap_or_else(|| INVALID_LOGIN_MESSAGE.to_string()),
            ));
        }
        Err(ApiError::LoginFailed {
            status: status.as_u16(),
            body: body.filter(|_| status.as_u16() < 500),
        })
    }

    /// Forget the stored token; returns whether one was stored
    pub fn logout(&self) -> Result<bool, ApiError> {
        let removed = self.credentials.remove(&self.host_key)?;
        if removed {
            info!("Logged out of {}", self.host_key);
        }
        Ok(removed)
    }

    /// Sites the logged-in account can access, as returned by the server
    pub async fn sites(&self) -> Result<Value, ApiError> {
        let request = self.authorize(self.client.get(self.url("/api/v1/sites/")))?;
        let response = request.send().await.map_err(ApiError::Network)?;
        if response.status() != StatusCode::OK {
            return Err(unexpected_response(response).await);
        }
        let body = response.text().await.map_err(ApiError::Network)?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Bundle transport authenticated as the logged-in account
    pub fn bundle_transport(&self) -> SyncResult<HttpBundleTransport> {
        // A credential read failure just means an anonymous transport
        let token = self.token().ok().flatten();
        HttpBundleTransport::new(&self.base_url, token, self.timeout)
    }
}

async fn unexpected_response(response: Response) -> ApiError {
    let status = response.status().as_u16();
    let body = if status < 500 {
        response.text().await.ok().filter(|b| !b.is_empty())
    } else {
        None
    };
    ApiError::UnexpectedResponse { status, body }
}
