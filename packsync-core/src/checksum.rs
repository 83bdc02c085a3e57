use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

const READ_BLOCK: usize = 64 * 1024;

/// BLAKE3 content digest, stored as lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Checksum(String);

impl Checksum {
    pub fn of_bytes(data: &[u8]) -> Self {
        Checksum(blake3::hash(data).to_hex().to_string())
    }

    /// Accepts hex in either case; rejects anything that is not a 256-bit digest.
    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Checksum(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.0.get(..16).unwrap_or(&self.0))
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Checksum::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("not a 256-bit hex digest: {s:?}")))
    }
}

/// Hash a file's full content. `None` if it is missing or unreadable.
pub fn compute_checksum(path: &Path) -> Option<Checksum> {
    let mut f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!("failed to open {} for hashing: {}", path.display(), e);
            return None;
        }
    };
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; READ_BLOCK];
    loop {
        match f.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                hasher.update(&buf[..n]);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("failed to compute hash for {}: {}", path.display(), e);
                return None;
            }
        }
    }
    Some(Checksum(hasher.finalize().to_hex().to_string()))
}
