//! Per-identity signed challenge scheme.
//!
//! Every client holds a UUID and a short-lived ed25519 keypair. An authority, trusted by the
//! server through its public key alone, attests the keypair by signing
//! `uuid (16 bytes) || expiry millis (i64 BE) || public key (32 bytes)`.
//! All other signatures are taken over SHA-256 digests of the signed value.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{
    challenge_header, header_str, new_challenge, ClientSession, ConnectionSecurity, RequestPhase,
    AUTHENTICATION, AUTHENTICATION_ID, AUTHENTICATION_KEY, AUTHENTICATION_KEY_EXPIRE,
    AUTHENTICATION_KEY_EXPIRE_DIGEST, AUTHENTICATION_KEY_SIGNATURE, AUTHENTICATION_SIGNATURE,
    B64, CHALLENGE, CHALLENGE_SIGNATURE,
};
use crate::error::{Result, SyncError};

const SCHEME: &str = "SignedId";

/// External predicate deciding whether an authenticated identity may fetch content.
pub trait AllowList: Send + Sync {
    fn is_allowed(&self, id: Uuid) -> bool;
}

/// Allow-list fixed at startup.
#[derive(Debug, Default)]
pub struct StaticAllowList {
    ids: HashSet<Uuid>,
    allow_any: bool,
}

impl StaticAllowList {
    pub fn new(ids: impl IntoIterator<Item = Uuid>, allow_any: bool) -> Self {
        StaticAllowList { ids: ids.into_iter().collect(), allow_any }
    }
}

impl AllowList for StaticAllowList {
    fn is_allowed(&self, id: Uuid) -> bool {
        self.allow_any || self.ids.contains(&id)
    }
}

/// Client credentials as stored on disk.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct IdentityMaterial {
    pub id: Uuid,
    /// Base64 ed25519 secret key.
    pub signing_key: String,
    /// RFC 3339, millisecond precision.
    pub expires_at: String,
    /// Base64 authority signature over the attested payload.
    pub key_signature: String,
}

impl IdentityMaterial {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Configuration(format!("cannot read identity {}: {e}", path.display()))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            SyncError::Configuration(format!("invalid identity {}: {e}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Configuration(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| SyncError::fs(path, e))
    }
}

/// The attesting authority's keypair.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AuthorityFile {
    pub public_key: String,
    pub secret_key: String,
}

pub struct Authority {
    key: SigningKey,
}

impl Authority {
    pub fn generate() -> Self {
        Authority { key: SigningKey::generate(&mut rand::rngs::OsRng) }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| SyncError::fs(path, e))?;
        let file: AuthorityFile = serde_json::from_str(&data).map_err(|e| {
            SyncError::Configuration(format!("invalid authority file {}: {e}", path.display()))
        })?;
        Ok(Authority { key: decode_signing_key(&file.secret_key)? })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = AuthorityFile {
            public_key: self.public_key_b64(),
            secret_key: B64.encode(self.key.to_bytes()),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| SyncError::Configuration(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| SyncError::fs(path, e))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Value for the server's `authority_public_key` setting.
    pub fn public_key_b64(&self) -> String {
        B64.encode(self.key.verifying_key().as_bytes())
    }

    /// Mint a fresh client keypair for `id` and attest it until `expires_at`.
    pub fn issue(&self, id: Uuid, expires_at: DateTime<Utc>) -> IdentityMaterial {
        let client_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let expiry = format_expiry(expires_at);
        // Round-trip through the string so the attested millis match what the client sends.
        let millis = DateTime::parse_from_rfc3339(&expiry)
            .map(|t| t.timestamp_millis())
            .unwrap_or_else(|_| expires_at.timestamp_millis());
        let payload = attested_payload(id, millis, &client_key.verifying_key());
        let key_signature = self.key.sign(&Sha256::digest(payload));
        IdentityMaterial {
            id,
            signing_key: B64.encode(client_key.to_bytes()),
            expires_at: expiry,
            key_signature: B64.encode(key_signature.to_bytes()),
        }
    }
}

fn format_expiry(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn attested_payload(id: Uuid, expiry_millis: i64, key: &VerifyingKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + 8 + 32);
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(&expiry_millis.to_be_bytes());
    out.extend_from_slice(key.as_bytes());
    out
}

pub fn decode_verifying_key(b64: &str) -> Result<VerifyingKey> {
    let raw = B64
        .decode(b64.trim())
        .map_err(|e| SyncError::Configuration(format!("public key is not base64: {e}")))?;
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| SyncError::Configuration("public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| SyncError::Configuration(format!("invalid public key: {e}")))
}

fn decode_signing_key(b64: &str) -> Result<SigningKey> {
    let raw = B64
        .decode(b64.trim())
        .map_err(|e| SyncError::Configuration(format!("secret key is not base64: {e}")))?;
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| SyncError::Configuration("secret key must be 32 bytes".into()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

fn sign_digest(key: &SigningKey, msg: &[u8]) -> String {
    B64.encode(key.sign(&Sha256::digest(msg)).to_bytes())
}

fn verify_digest(key: &VerifyingKey, msg: &[u8], sig: &Signature) -> bool {
    key.verify(&Sha256::digest(msg), sig).is_ok()
}

struct ClientIdentity {
    id: Uuid,
    key: SigningKey,
    expires_at: String,
    key_signature: String,
}

struct ServerState {
    authority: VerifyingKey,
    allow: Arc<dyn AllowList>,
    challenges: Mutex<HashMap<Uuid, String>>,
}

enum Side {
    Client(ClientIdentity),
    Server(ServerState),
}

pub struct SignedIdentitySecurity {
    side: Side,
}

impl SignedIdentitySecurity {
    /// Fails if the material is malformed or already expired.
    pub fn client(identity: IdentityMaterial) -> Result<Self> {
        let expiry = DateTime::parse_from_rfc3339(&identity.expires_at)
            .map_err(|e| SyncError::Configuration(format!("identity expiry is not RFC 3339: {e}")))?
            .with_timezone(&Utc);
        if expiry < Utc::now() {
            return Err(SyncError::Configuration(format!(
                "identity {} expired at {}",
                identity.id, identity.expires_at
            )));
        }
        B64.decode(identity.key_signature.trim()).map_err(|e| {
            SyncError::Configuration(format!("identity key signature is not base64: {e}"))
        })?;
        Ok(SignedIdentitySecurity {
            side: Side::Client(ClientIdentity {
                id: identity.id,
                key: decode_signing_key(&identity.signing_key)?,
                expires_at: identity.expires_at,
                key_signature: identity.key_signature.trim().to_string(),
            }),
        })
    }

    pub fn server(authority: VerifyingKey, allow: Arc<dyn AllowList>) -> Self {
        SignedIdentitySecurity {
            side: Side::Server(ServerState {
                authority,
                allow,
                challenges: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Headers of one signed request, decoded but not yet verified.
struct Presented {
    id: Uuid,
    id_signature: Signature,
    key: VerifyingKey,
    expiry_text: String,
    expiry: DateTime<Utc>,
    expiry_signature: Signature,
    key_signature: Signature,
}

fn decode_signature(
    headers: &HeaderMap,
    name: &HeaderName,
) -> std::result::Result<Signature, String> {
    let value = header_str(headers, name).ok_or_else(|| format!("missing {name}"))?;
    let raw = B64.decode(value.trim()).map_err(|_| format!("{name} is not base64"))?;
    let bytes: [u8; 64] = raw.try_into().map_err(|_| format!("{name} has the wrong length"))?;
    Ok(Signature::from_bytes(&bytes))
}

fn request_id(headers: &HeaderMap) -> Option<Uuid> {
    header_str(headers, &AUTHENTICATION_ID).and_then(|s| Uuid::parse_str(s.trim()).ok())
}

fn parse_presented(headers: &HeaderMap) -> std::result::Result<Presented, String> {
    if header_str(headers, &AUTHENTICATION) != Some(SCHEME) {
        return Err("missing or foreign authentication scheme".into());
    }
    let id = request_id(headers).ok_or("missing or malformed identity")?;
    let id_signature = decode_signature(headers, &AUTHENTICATION_SIGNATURE)?;
    let key_b64 = header_str(headers, &AUTHENTICATION_KEY).ok_or("missing public key")?;
    let key = decode_verifying_key(key_b64).map_err(|e| e.to_string())?;
    let expiry_b64 = header_str(headers, &AUTHENTICATION_KEY_EXPIRE).ok_or("missing key expiry")?;
    let expiry_raw = B64.decode(expiry_b64.trim()).map_err(|_| "key expiry is not base64")?;
    let expiry_text = String::from_utf8(expiry_raw).map_err(|_| "key expiry is not UTF-8")?;
    let expiry = DateTime::parse_from_rfc3339(&expiry_text)
        .map_err(|_| format!("key expiry is not a timestamp: {expiry_text:?}"))?
        .with_timezone(&Utc);
    let expiry_signature = decode_signature(headers, &AUTHENTICATION_KEY_EXPIRE_DIGEST)?;
    let key_signature = decode_signature(headers, &AUTHENTICATION_KEY_SIGNATURE)?;
    Ok(Presented { id, id_signature, key, expiry_text, expiry, expiry_signature, key_signature })
}

impl ServerState {
    fn check(&self, headers: &HeaderMap, phase: RequestPhase) -> std::result::Result<Uuid, String> {
        let p = parse_presented(headers)?;

        let payload = attested_payload(p.id, p.expiry.timestamp_millis(), &p.key);
        if !verify_digest(&self.authority, &payload, &p.key_signature) {
            return Err(format!("public key of {} is not attested by the authority", p.id));
        }
        if p.expiry < Utc::now() {
            return Err(format!("public key of {} expired at {}", p.id, p.expiry_text));
        }
        if !verify_digest(&p.key, p.id.as_bytes(), &p.id_signature) {
            return Err(format!("invalid identity signature for {}", p.id));
        }
        if !verify_digest(&p.key, p.expiry_text.as_bytes(), &p.expiry_signature) {
            return Err(format!("invalid expiry signature for {}", p.id));
        }
        if phase == RequestPhase::Authenticated {
            let sig = decode_signature(headers, &CHALLENGE_SIGNATURE)?;
            let current = self
                .challenges
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&p.id)
                .cloned()
                .ok_or_else(|| format!("no challenge outstanding for {}", p.id))?;
            if !verify_digest(&p.key, current.as_bytes(), &sig) {
                return Err(format!("invalid challenge signature for {}", p.id));
            }
        }
        if !self.allow.is_allowed(p.id) {
            return Err(format!("{} is not on the allow list", p.id));
        }
        Ok(p.id)
    }
}

impl ConnectionSecurity for SignedIdentitySecurity {
    fn name(&self) -> &'static str {
        "signed_identity"
    }

    fn needs_handshake(&self) -> bool {
        true
    }

    fn supports_concurrent_requests(&self) -> bool {
        false
    }

    fn decorate_request(
        &self,
        session: &ClientSession,
        headers: &mut HeaderMap,
        phase: RequestPhase,
    ) -> Result<()> {
        let Side::Client(me) = &self.side else {
            return Err(SyncError::Configuration(
                "server-side provider cannot sign requests".into(),
            ));
        };
        let mut put = |name: HeaderName, value: String| -> Result<()> {
            let v = HeaderValue::from_str(&value)
                .map_err(|e| SyncError::Authentication(format!("bad header value: {e}")))?;
            headers.insert(name, v);
            Ok(())
        };
        put(AUTHENTICATION, SCHEME.to_string())?;
        put(AUTHENTICATION_ID, me.id.hyphenated().to_string())?;
        put(AUTHENTICATION_SIGNATURE, sign_digest(&me.key, me.id.as_bytes()))?;
        put(AUTHENTICATION_KEY, B64.encode(me.key.verifying_key().as_bytes()))?;
        put(AUTHENTICATION_KEY_EXPIRE, B64.encode(me.expires_at.as_bytes()))?;
        put(AUTHENTICATION_KEY_EXPIRE_DIGEST, sign_digest(&me.key, me.expires_at.as_bytes()))?;
        put(AUTHENTICATION_KEY_SIGNATURE, me.key_signature.clone())?;
        if phase == RequestPhase::Authenticated {
            let challenge = session.challenge().ok_or_else(|| {
                SyncError::Authentication("no challenge has been received yet".into())
            })?;
            put(CHALLENGE_SIGNATURE, sign_digest(&me.key, challenge.as_bytes()))?;
        }
        Ok(())
    }

    fn validate_request(&self, headers: &HeaderMap, phase: RequestPhase) -> bool {
        let Side::Server(state) = &self.side else {
            tracing::warn!("client-side provider asked to validate a request");
            return false;
        };
        match state.check(headers, phase) {
            Ok(id) => {
                tracing::debug!("accepted signed request from {}", id);
                true
            }
            Err(reason) => {
                tracing::warn!("rejected signed request: {}", reason);
                false
            }
        }
    }

    fn issue_challenge(&self, request: &HeaderMap, response: &mut HeaderMap) {
        let Side::Server(state) = &self.side else { return };
        let Some(id) = request_id(request) else { return };
        let challenge = new_challenge();
        let Some(value) = challenge_header(&challenge) else { return };
        state.challenges.lock().unwrap_or_else(|e| e.into_inner()).insert(id, challenge);
        response.insert(CHALLENGE, value);
    }
}
