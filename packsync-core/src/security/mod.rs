//! Pluggable request authentication.
//!
//! A [`ConnectionSecurity`] provider plays both roles of the protocol. The client decorates every
//! outgoing request and folds each challenge it receives into an explicit [`ClientSession`]; the
//! server validates incoming requests and attaches a fresh challenge to every response.

pub mod password;
pub mod signed;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use base64::Engine;
use rand::RngCore;
use std::sync::Arc;

use crate::config::SecurityConfig;
use crate::error::{Result, SyncError};

pub use password::PasswordSecurity;
pub use signed::{AllowList, SignedIdentitySecurity, StaticAllowList};

pub const AUTHENTICATION: HeaderName = HeaderName::from_static("authentication");
pub const AUTHENTICATION_ID: HeaderName = HeaderName::from_static("authenticationid");
pub const AUTHENTICATION_SIGNATURE: HeaderName =
    HeaderName::from_static("authenticationsignature");
pub const AUTHENTICATION_KEY: HeaderName = HeaderName::from_static("authenticationkey");
pub const AUTHENTICATION_KEY_EXPIRE: HeaderName =
    HeaderName::from_static("authenticationkeyexpire");
pub const AUTHENTICATION_KEY_EXPIRE_DIGEST: HeaderName =
    HeaderName::from_static("authenticationkeyexpiredigest");
pub const AUTHENTICATION_KEY_SIGNATURE: HeaderName =
    HeaderName::from_static("authenticationkeysignature");
pub const CHALLENGE_SIGNATURE: HeaderName = HeaderName::from_static("challengesignature");
pub const CHALLENGE: HeaderName = HeaderName::from_static("challenge");

pub(crate) const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Which leg of the exchange a request belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestPhase {
    /// The `/authenticate` call. No challenge has been answered yet.
    Handshake,
    /// Any call that must answer the most recent challenge.
    Authenticated,
}

/// Which side of the connection a provider is built for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Client-side protocol state, threaded through every request of one synchronization run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientSession {
    challenge: Option<String>,
}

impl ClientSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent challenge received from the server, decoded.
    pub fn challenge(&self) -> Option<&str> {
        self.challenge.as_deref()
    }
}

pub trait ConnectionSecurity: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether `/authenticate` must be called before protected requests.
    fn needs_handshake(&self) -> bool;

    /// Whether several authenticated requests may be in flight at once.
    fn supports_concurrent_requests(&self) -> bool {
        true
    }

    /// Client role: attach credentials for a request in the given phase.
    fn decorate_request(
        &self,
        session: &ClientSession,
        headers: &mut HeaderMap,
        phase: RequestPhase,
    ) -> Result<()>;

    /// Client role: fold the `Challenge` header value of a response into the session.
    fn absorb_challenge(&self, mut session: ClientSession, token: &str) -> Result<ClientSession> {
        let raw = B64
            .decode(token.trim())
            .map_err(|e| SyncError::Authentication(format!("undecodable challenge: {e}")))?;
        let challenge = String::from_utf8(raw)
            .map_err(|_| SyncError::Authentication("challenge is not UTF-8".into()))?;
        tracing::debug!("received challenge {}", challenge);
        session.challenge = Some(challenge);
        Ok(session)
    }

    /// Server role: accept or reject. Never fails on malformed input; the reason is logged.
    ///
    /// May block (allow-list lookups), so async callers run it on a blocking thread.
    fn validate_request(&self, headers: &HeaderMap, phase: RequestPhase) -> bool;

    /// Server role: attach the next challenge to a response.
    fn issue_challenge(&self, request: &HeaderMap, response: &mut HeaderMap);
}

/// Build the provider described by `config` for one role. Missing or invalid trust material
/// for that role is a configuration error.
pub fn from_config(config: &SecurityConfig, role: Role) -> Result<Arc<dyn ConnectionSecurity>> {
    match config {
        SecurityConfig::Password { password } => Ok(Arc::new(PasswordSecurity::new(password)?)),
        SecurityConfig::SignedIdentity {
            identity_file,
            authority_public_key,
            allow_list,
            allow_any,
        } => match role {
            Role::Client => {
                let path = identity_file.as_deref().ok_or_else(|| {
                    SyncError::Configuration("signed identity mode needs an identity_file".into())
                })?;
                let identity = signed::IdentityMaterial::load(path)?;
                Ok(Arc::new(SignedIdentitySecurity::client(identity)?))
            }
            Role::Server => {
                let key = authority_public_key.as_deref().ok_or_else(|| {
                    SyncError::Configuration(
                        "signed identity mode needs an authority_public_key".into(),
                    )
                })?;
                let authority = signed::decode_verifying_key(key)?;
                let allow = StaticAllowList::new(allow_list.iter().copied(), *allow_any);
                if !*allow_any && allow_list.is_empty() {
                    tracing::warn!("allow list is empty: every signed identity will be rejected");
                }
                Ok(Arc::new(SignedIdentitySecurity::server(authority, Arc::new(allow))))
            }
        },
    }
}

/// A fresh 256-bit random token, hex encoded.
pub fn new_challenge() -> String {
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Header value transporting `challenge`.
pub(crate) fn challenge_header(challenge: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&B64.encode(challenge.as_bytes())).ok()
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
