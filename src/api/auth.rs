use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{Result, SchedulerError};

/// Shared-secret check for API calls.
///
/// Tokens are compared through their SHA-256 digests with a constant-time
/// equality, so neither the length nor the content of the secret leaks
/// through response timing.
#[derive(Clone, Default)]
pub struct AccessGuard {
    secret_digest: Option<[u8; 32]>,
}

impl std::fmt::Debug for AccessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGuard")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl AccessGuard {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret_digest: secret.map(digest),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret_digest.is_some()
    }

    /// Accept the call when no secret is configured or `token` matches it.
    pub fn check(&self, token: Option<&str>) -> Result<()> {
        let Some(expected) = &self.secret_digest else {
            return Ok(());
        };
        match token {
            Some(token) if bool::from(digest(token)[..].ct_eq(&expected[..])) => Ok(()),
            _ => Err(SchedulerError::Unauthorized),
        }
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}
