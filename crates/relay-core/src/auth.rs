//! Credential verification.
//!
//! Connections present an opaque credential. An [`Authenticator`] turns it
//! into a [`UserId`] or rejects it; a session is only created for a verified
//! user.

use async_trait::async_trait;
use relay_protocol::UserId;
use std::collections::HashMap;
use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing credential")]
    MissingCredential,

    #[error("Credential rejected: {0}")]
    Rejected(String),

    #[error("Auth service unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    /// Whether the failure is the client's fault rather than ours.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, AuthError::MissingCredential | AuthError::Rejected(_))
    }
}

/// Verifies connection credentials.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve a credential to the user it belongs to.
    async fn verify(&self, credential: &str) -> Result<UserId, AuthError>;
}

/// Authenticator backed by a fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    tokens: HashMap<String, UserId>,
}

impl StaticAuthenticator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `user_id`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, user_id: UserId) -> Self {
        self.tokens.insert(token.into(), user_id);
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn verify(&self, credential: &str) -> Result<UserId, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        self.tokens
            .get(credential)
            .copied()
            .ok_or_else(|| AuthError::Rejected("unknown token".to_string()))
    }
}
