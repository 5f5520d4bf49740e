//! Process-wide shared secret verifier

use crate::verifier::{AuthError, CredentialVerifier};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Accepts exactly one token, configured when the relay starts
///
/// Only the SHA-256 digest of the secret is kept. Presented credentials are
/// hashed the same way and the fixed-size digests are compared, so the
/// comparison cost does not depend on where the strings first differ.
#[derive(Clone)]
pub struct SharedSecretVerifier {
    digest: Option<[u8; 32]>,
}

impl SharedSecretVerifier {
    /// Create a verifier for `secret`
    ///
    /// An empty secret produces a verifier that rejects everything.
    pub fn new(secret: impl AsRef<str>) -> Self {
        let secret = secret.as_ref();
        if secret.is_empty() {
            tracing::warn!("Shared secret is empty; every agent registration will be rejected");
            return Self { digest: None };
        }

        Self {
            digest: Some(hash(secret)),
        }
    }

    fn check(&self, credential: &str) -> Result<(), AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let Some(expected) = self.digest else {
            return Err(AuthError::InvalidCredential);
        };

        let presented = hash(credential);
        let diff = expected
            .iter()
            .zip(presented.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));

        if diff == 0 {
            Ok(())
        } else {
            Err(AuthError::InvalidCredential)
        }
    }
}

impl std::fmt::Debug for SharedSecretVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretVerifier")
            .field("configured", &self.digest.is_some())
            .finish()
    }
}

fn hash(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

#[async_trait]
impl CredentialVerifier for SharedSecretVerifier {
    async fn verify(&self, credential: &str) -> Result<(), AuthError> {
        self.check(credential)
    }
}
