use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cookie::SessionCookies;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpOutcome {
    /// The backend mailed a confirmation link; no session yet.
    ConfirmationRequired,
    SignedIn(User),
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity backend unreachable: {0}")]
    Unreachable(String),
    #[error("identity backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("missing PKCE code verifier")]
    MissingCodeVerifier,
    #[error("malformed session: {0}")]
    MalformedSession(String),
}

/// The identity backend as seen from the HTTP boundary.
///
/// Every call receives the request's cookies through [`SessionCookies`];
/// writes the backend wants on the response (refreshed tokens, deletions) go
/// through [`SessionCookies::set_all`] and are never written directly.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Revalidate the session carried by `cookies`, refreshing it if needed.
    async fn get_user(&self, cookies: &mut SessionCookies) -> Result<Option<User>, IdentityError>;

    /// Revoke the session server-side and queue deletion of its cookies.
    async fn sign_out(&self, cookies: &mut SessionCookies) -> Result<(), IdentityError>;

    async fn sign_in_with_password(
        &self,
        cookies: &mut SessionCookies,
        email: &str,
        password: &str,
    ) -> Result<User, IdentityError>;

    async fn sign_up(
        &self,
        cookies: &mut SessionCookies,
        email: &str,
        password: &str,
    ) -> Result<SignUpOutcome, IdentityError>;

    async fn exchange_code_for_session(
        &self,
        cookies: &mut SessionCookies,
        code: &str,
    ) -> Result<User, IdentityError>;
}
