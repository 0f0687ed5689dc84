//! Auth service client.
//!
//! Tokens are verified by POSTing `{"token": ...}` to `<service>/verify`. A
//! 2xx response carries the user record; any other status is a rejection.

use async_trait::async_trait;
use relay_core::{AuthError, Authenticator};
use relay_protocol::UserId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::AuthConfig;

#[derive(Serialize)]
struct VerifyRequest<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
struct VerifiedUser {
    id: UserId,
}

/// [`Authenticator`] that defers to the external auth service.
#[derive(Debug, Clone)]
pub struct HttpAuthenticator {
    client: reqwest::Client,
    verify_url: String,
}

impl HttpAuthenticator {
    /// Build a client for the configured auth service.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &AuthConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            verify_url: format!("{}/verify", config.service_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn verify(&self, credential: &str) -> Result<UserId, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let response = self
            .client
            .post(&self.verify_url)
            .json(&VerifyRequest { token: credential })
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "Auth service rejected token");
            return Err(AuthError::Rejected(format!("auth service returned {status}")));
        }

        let user: VerifiedUser = response
            .json()
            .await
            .map_err(|e| AuthError::Unavailable(format!("invalid verify response: {e}")))?;
        Ok(user.id)
    }
}
