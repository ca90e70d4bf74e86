/// Bearer token gate for the embedding API.
///
/// The presented token is compared against the configured secret in constant time: both
/// sides are reduced to SHA-256 digests and the digests are compared without early exit, so
/// neither the position of the first differing byte nor the secret's length leaks through
/// response timing. An absent (or blank) secret rejects every request.
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("server has no API key configured")]
    NotConfigured,

    #[error("missing bearer token")]
    MissingCredential,

    #[error("invalid bearer token")]
    InvalidCredential,
}

#[derive(Clone)]
pub struct AuthGate {
    secret_digest: Option<[u8; 32]>,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("configured", &self.is_configured())
            .finish()
    }
}

impl AuthGate {
    pub fn new(secret: Option<String>) -> Self {
        let secret_digest = secret
            .filter(|s| !s.trim().is_empty())
            .map(|s| digest(&s));
        Self { secret_digest }
    }

    pub fn is_configured(&self) -> bool {
        self.secret_digest.is_some()
    }

    pub fn authorize(&self, presented: &str) -> Result<(), AuthError> {
        let Some(expected) = &self.secret_digest else {
            return Err(AuthError::NotConfigured);
        };
        if constant_time_eq(expected, &digest(presented)) {
            Ok(())
        } else {
            Err(AuthError::InvalidCredential)
        }
    }

    /// Authorize the raw value of an `Authorization` header (`Bearer <token>`).
    pub fn authorize_header(&self, header: Option<&str>) -> Result<(), AuthError> {
        if !self.is_configured() {
            return Err(AuthError::NotConfigured);
        }
        let token = header
            .and_then(bearer_token)
            .ok_or(AuthError::MissingCredential)?;
        self.authorize(token)
    }
}

/// Extract the token from `Bearer <token>`. The scheme is case-insensitive.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
