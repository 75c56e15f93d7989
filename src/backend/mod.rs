//! Identity backend: the remote auth provider and institute lookup.
//!
//! DESIGN
//! ======
//! `IdentityBackend` is the only seam to the outside world. The session store
//! and the institute resolver both hold it as `Arc<dyn IdentityBackend>`, so
//! tests run against [`memory::MemoryIdentityBackend`] and the CLI against
//! [`http::HttpIdentityBackend`].
//!
//! Session transitions are pushed on a `tokio::sync::broadcast` channel.
//! Subscribers that fall behind skip straight to newer events.

pub mod http;
pub mod memory;

use tokio::sync::broadcast;

use crate::institute::InstituteRecord;
use crate::session::{Session, SignUpOutcome, UserMetadata};

pub const AUTH_EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// A session transition reported by the provider.
#[derive(Debug, Clone)]
pub struct AuthChange {
    pub event: AuthEvent,
    pub session: Option<Session>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("no active session")]
    NotSignedIn,
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed backend response: {0}")]
    MalformedResponse(String),
    #[error("failed to build http client: {0}")]
    ClientBuild(String),
}

impl BackendError {
    /// Whether retrying the same request later could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Network(_) => true,
            BackendError::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Remote authentication provider plus the institute table.
#[async_trait::async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Fetch the session the provider currently holds, if any.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Network`] on transport failure.
    async fn get_session(&self) -> Result<Option<Session>, BackendError>;

    /// Subscribe to session transitions pushed by the provider.
    fn subscribe(&self) -> broadcast::Receiver<AuthChange>;

    /// # Errors
    ///
    /// Returns [`BackendError::InvalidCredentials`] on a bad email/password.
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, BackendError>;

    /// # Errors
    ///
    /// Returns [`BackendError::Rejected`] if the provider refuses the account.
    async fn sign_up(&self, email: &str, password: &str, metadata: &UserMetadata)
    -> Result<SignUpOutcome, BackendError>;

    /// # Errors
    ///
    /// Returns [`BackendError::NotSignedIn`] when there is no session to end.
    async fn sign_out(&self) -> Result<(), BackendError>;

    /// Look up a single institute row by id. `Ok(None)` means not found.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup could not be performed.
    async fn fetch_institute(&self, institute_id: &str) -> Result<Option<InstituteRecord>, BackendError>;
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
