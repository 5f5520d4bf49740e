//! Credential verifier trait for pluggable agent authentication
//!
//! The relay treats agent credentials as opaque strings. Anything that can say
//! yes or no to one (a shared secret, a token service, a database lookup) can
//! sit behind [`CredentialVerifier`].

use async_trait::async_trait;
use thiserror::Error;

/// Authentication errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing credential")]
    MissingCredential,

    #[error("Invalid credential")]
    InvalidCredential,
}

/// Credential verifier trait
///
/// # Example: allow-list verifier
///
/// ```ignore
/// use sshgate_auth::{async_trait, AuthError, CredentialVerifier};
///
/// struct AllowList {
///     tokens: HashSet<String>,
/// }
///
/// #[async_trait]
/// impl CredentialVerifier for AllowList {
///     async fn verify(&self, credential: &str) -> Result<(), AuthError> {
///         if self.tokens.contains(credential) {
///             Ok(())
///         } else {
///             Err(AuthError::InvalidCredential)
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Verify a credential presented by an agent during registration
    ///
    /// Implementations must fail closed: anything they cannot positively
    /// confirm is an error.
    async fn verify(&self, credential: &str) -> Result<(), AuthError>;
}
