use axum::http::{HeaderMap, HeaderValue};
use sha2::{Digest, Sha256};

use super::{
    challenge_header, header_str, new_challenge, ClientSession, ConnectionSecurity, RequestPhase,
    AUTHENTICATION, CHALLENGE,
};
use crate::config::DEFAULT_PASSWORD;
use crate::error::{Result, SyncError};

/// Shared-secret scheme. Both sides hash the same password and compare hashes.
///
/// A challenge is attached to every response so the exchange looks the same as in the signed
/// scheme, but nothing ever checks the answer.
pub struct PasswordSecurity {
    hash: String,
}

impl PasswordSecurity {
    pub fn new(password: &str) -> Result<Self> {
        if password.is_empty() {
            return Err(SyncError::Configuration("no password is set".into()));
        }
        if password == DEFAULT_PASSWORD {
            return Err(SyncError::Configuration(
                "the password is still the placeholder default; set a real one".into(),
            ));
        }
        Ok(PasswordSecurity { hash: hash_password(password) })
    }

    /// Uppercase hex SHA-256 of the secret, as sent on the wire.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

pub fn hash_password(password: &str) -> String {
    hex::encode_upper(Sha256::digest(password.as_bytes()))
}

impl ConnectionSecurity for PasswordSecurity {
    fn name(&self) -> &'static str {
        "password"
    }

    fn needs_handshake(&self) -> bool {
        false
    }

    fn decorate_request(
        &self,
        _session: &ClientSession,
        headers: &mut HeaderMap,
        _phase: RequestPhase,
    ) -> Result<()> {
        let value = HeaderValue::from_str(&format!("Basic {}", self.hash))
            .map_err(|e| SyncError::Authentication(e.to_string()))?;
        headers.insert(AUTHENTICATION, value);
        Ok(())
    }

    fn validate_request(&self, headers: &HeaderMap, _phase: RequestPhase) -> bool {
        let Some(auth) = header_str(headers, &AUTHENTICATION) else {
            tracing::warn!("client sent no authentication header");
            return false;
        };
        let Some(hash) = auth.strip_prefix("Basic ") else {
            tracing::warn!("client tried a different authentication scheme: {}", auth);
            return false;
        };
        if hash != self.hash {
            tracing::warn!("client tried to log in with the wrong password");
            return false;
        }
        true
    }

    fn issue_challenge(&self, _request: &HeaderMap, response: &mut HeaderMap) {
        if let Some(v) = challenge_header(&new_challenge()) {
            response.insert(CHALLENGE, v);
        }
    }
}
