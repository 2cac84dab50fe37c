use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const RAW_LEN: usize = 24;
const ID_PREFIX: &str = "ID";

/// Length of the wire form: `ID` followed by 24 hex characters.
pub const ENCODED_ID_LEN: usize = ID_PREFIX.len() + RAW_LEN;

/// Internal resource identifier: 12 bytes rendered as 24 lowercase hex chars.
///
/// Layout is 4 bytes of seconds since the epoch, 5 bytes of per-process
/// randomness and a 3 byte counter, so ids sort roughly by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

static PROCESS_BYTES: OnceLock<[u8; 5]> = OnceLock::new();
static COUNTER: OnceLock<AtomicU32> = OnceLock::new();

impl ResourceId {
    #[must_use]
    pub fn generate() -> Self {
        let secs = Utc::now().timestamp() as u32;
        let process = PROCESS_BYTES.get_or_init(|| rand::thread_rng().r#gen());
        let counter = COUNTER
            .get_or_init(|| AtomicU32::new(rand::thread_rng().r#gen::<u32>() & 0x00ff_ffff))
            .fetch_add(1, Ordering::Relaxed)
            & 0x00ff_ffff;

        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(process);
        bytes[9..].copy_from_slice(&counter.to_be_bytes()[1..]);
        Self(hex::encode(bytes))
    }

    /// Wraps an internal 24-hex id.
    pub fn from_hex(raw: &str) -> Result<Self> {
        if raw.len() != RAW_LEN || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::BadRequest(format!("invalid id: {raw}")));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    /// Parses the wire form `ID<hex>`.
    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = encoded
            .strip_prefix(ID_PREFIX)
            .ok_or_else(|| Error::BadRequest(format!("invalid id: {encoded}")))?;
        Self::from_hex(raw)
    }

    #[must_use]
    pub fn encode(&self) -> String {
        format!("{ID_PREFIX}{}", self.0)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `s` has the shape of an encoded id.
    #[must_use]
    pub fn is_encoded(s: &str) -> bool {
        s.len() == ENCODED_ID_LEN
            && s.starts_with(ID_PREFIX)
            && s[ID_PREFIX.len()..].bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_shape() {
        let id = ResourceId::generate();
        assert_eq!(id.as_str().len(), 24);
        assert!(ResourceId::is_encoded(&id.encode()));
    }

    #[test]
    fn test_generate_unique() {
        let a = ResourceId::generate();
        let b = ResourceId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decode_encoded() {
        let id = ResourceId::from_hex("5e1b3c9f0a1b2c3d4e5f6a7b").unwrap();
        assert_eq!(id.encode(), "ID5e1b3c9f0a1b2c3d4e5f6a7b");
        assert_eq!(ResourceId::decode("ID5e1b3c9f0a1b2c3d4e5f6a7b").unwrap(), id);
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(ResourceId::decode("5e1b3c9f0a1b2c3d4e5f6a7b").is_err());
        assert!(ResourceId::decode("ID5e1b").is_err());
        assert!(ResourceId::decode("IDzz1b3c9f0a1b2c3d4e5f6a7b").is_err());
    }

    #[test]
    fn test_is_encoded() {
        assert!(ResourceId::is_encoded("ID5e1b3c9f0a1b2c3d4e5f6a7b"));
        assert!(!ResourceId::is_encoded("IDENTITY"));
        assert!(!ResourceId::is_encoded("employees"));
    }
}
