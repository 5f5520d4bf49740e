//! Credential verification for agent registration

pub mod shared_secret;
pub mod verifier;

pub use shared_secret::SharedSecretVerifier;
pub use verifier::{AuthError, CredentialVerifier};

// Re-export useful types
pub use async_trait::async_trait;
