//! API key authentication.
//!
//! Requests carry their credential in the `X-API-Key` header. With no secret
//! configured the gate is open and every request passes.

use crate::errors::AuthFailure;

/// The header the credential is read from.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// A pass/fail credential gate evaluated once per request, before anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyGate {
    secret: Option<String>,
}

impl ApiKeyGate {
    /// Create a gate for `secret`; `None` or an empty secret disables authentication.
    pub fn new(secret: Option<String>) -> Self {
        let secret = secret.filter(|s| !s.is_empty());
        if secret.is_none() {
            tracing::warn!("no API key configured; authentication is disabled");
        }
        Self { secret }
    }

    /// A gate that lets everything through.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Whether a secret is configured.
    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Check the raw credential bytes a request presented.
    ///
    /// The header need not be UTF-8; anything that is not byte-for-byte the
    /// secret is an invalid credential.
    pub fn check(&self, credential: Option<&[u8]>) -> Result<(), AuthFailure> {
        let Some(secret) = &self.secret else {
            tracing::debug!("authentication is disabled; request allowed");
            return Ok(());
        };
        match credential.filter(|c| !c.is_empty()) {
            None => {
                tracing::warn!("request received without API key");
                Err(AuthFailure::MissingCredential)
            }
            Some(presented) if !constant_time_eq(presented, secret.as_bytes()) => {
                tracing::warn!("invalid API key attempt");
                Err(AuthFailure::InvalidCredential)
            }
            Some(_) => Ok(()),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
