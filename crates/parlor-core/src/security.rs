use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

/// Upstream API key. The inner secret zeroizes on drop and never shows up
/// in Debug output.
#[derive(Clone)]
pub struct ApiKey(pub SecretString);

impl ApiKey {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(SecretString::from(secret.into()))
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

/// Server-side admin secret. Verification compares SHA-256 digests of both
/// sides, so comparison cost does not depend on where a candidate diverges
/// or on the secret's length.
#[derive(Clone)]
pub struct AdminKey(SecretString);

impl AdminKey {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(SecretString::from(secret.into()))
    }

    pub fn verify(&self, candidate: &str) -> bool {
        let expected = Sha256::digest(self.0.expose_secret().as_bytes());
        let got = Sha256::digest(candidate.as_bytes());
        expected == got
    }
}

impl std::fmt::Debug for AdminKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AdminKey([REDACTED])")
    }
}
