use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Utc};
use rand::Rng;

use crate::error::{Error, Result};
use crate::types::{ResourceId, Token};

const ARGON2_MEMORY: u32 = 64 * 1024; // 64KB
const ARGON2_ITERATIONS: u32 = 1;
const ARGON2_PARALLELISM: u32 = 4;
const ARGON2_OUTPUT_LEN: usize = 32;

const TOKEN_PREFIX: &str = "metaphor";
const LOOKUP_LENGTH: usize = 8;
const SECRET_BYTES: usize = 12;

/// Who a token acts for. Admin tokens bypass grants; user tokens carry the
/// grants of the user's groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOwner {
    Admin,
    User(ResourceId),
}

/// A freshly generated token. `raw` is shown to the caller once and never
/// stored.
#[derive(Debug)]
pub struct Minted {
    pub raw: String,
    pub lookup: String,
    pub hash: String,
}

pub struct TokenGenerator {
    argon2: Argon2<'static>,
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenGenerator {
    #[must_use]
    pub fn new() -> Self {
        let params = Params::new(
            ARGON2_MEMORY,
            ARGON2_ITERATIONS,
            ARGON2_PARALLELISM,
            Some(ARGON2_OUTPUT_LEN),
        )
        .unwrap_or_default();

        Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    /// Generates `metaphor_<lookup>_<secret>` and its hash.
    pub fn mint(&self) -> Result<Minted> {
        let lookup = uuid::Uuid::new_v4().simple().to_string()[..LOOKUP_LENGTH].to_string();
        let mut secret = [0u8; SECRET_BYTES];
        rand::thread_rng().fill(&mut secret);
        let raw = format!("{TOKEN_PREFIX}_{lookup}_{}", hex::encode(secret));
        let hash = self.hash(&raw)?;
        Ok(Minted { raw, lookup, hash })
    }

    /// Mints a token for `owner` and builds the record to store for it.
    pub fn issue(&self, owner: &TokenOwner, expires_at: Option<DateTime<Utc>>) -> Result<(Token, String)> {
        let Minted { raw, lookup, hash } = self.mint()?;
        let token = Token {
            id: uuid::Uuid::new_v4().to_string(),
            token_hash: hash,
            token_lookup: lookup,
            is_admin: *owner == TokenOwner::Admin,
            user_id: match owner {
                TokenOwner::Admin => None,
                TokenOwner::User(id) => Some(id.as_str().to_string()),
            },
            created_at: Utc::now(),
            expires_at,
            last_used_at: None,
        };
        Ok((token, raw))
    }

    pub fn hash(&self, token: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(token.as_bytes(), &salt)
            .map_err(|e| Error::Config(format!("failed to hash token: {e}")))?;
        Ok(hash.to_string())
    }

    pub fn verify(&self, token: &str, hash: &str) -> Result<bool> {
        let parsed_hash = PasswordHash::new(hash)
            .map_err(|e| Error::Config(format!("invalid hash format: {e}")))?;

        match self.argon2.verify_password(token.as_bytes(), &parsed_hash) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Config(format!("failed to verify token: {e}"))),
        }
    }
}

/// Splits a raw token into `(lookup, secret)`.
pub fn parse_token(token: &str) -> Result<(String, String)> {
    let rest = token
        .strip_prefix(TOKEN_PREFIX)
        .and_then(|r| r.strip_prefix('_'))
        .ok_or(Error::InvalidTokenFormat)?;
    let (lookup, secret) = rest.split_once('_').ok_or(Error::InvalidTokenFormat)?;

    let is_hex = |s: &str| s.chars().all(|c| c.is_ascii_hexdigit());
    if lookup.len() != LOOKUP_LENGTH || secret.len() != SECRET_BYTES * 2 || !is_hex(lookup) || !is_hex(secret) {
        return Err(Error::InvalidTokenFormat);
    }

    Ok((lookup.to_string(), secret.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minted_token_format() {
        let generator = TokenGenerator::new();
        let minted = generator.mint().unwrap();

        let parts: Vec<&str> = minted.raw.split('_').collect();
        assert_eq!(parts, vec!["metaphor", minted.lookup.as_str(), parts[2]]);
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 24);
        assert!(minted.hash.starts_with("$argon2id$"));
    }

    #[test]
    fn test_verify() {
        let generator = TokenGenerator::new();
        let minted = generator.mint().unwrap();
        assert!(generator.verify(&minted.raw, &minted.hash).unwrap());

        let other = generator.mint().unwrap();
        assert!(!generator.verify(&other.raw, &minted.hash).unwrap());
    }

    #[test]
    fn test_parse_token() {
        let (lookup, secret) = parse_token("metaphor_1234abcd_0123456789abcdef01234567").unwrap();
        assert_eq!(lookup, "1234abcd");
        assert_eq!(secret, "0123456789abcdef01234567");

        assert!(parse_token("cutter_1234abcd_0123456789abcdef01234567").is_err());
        assert!(parse_token("metaphor_1234abcd").is_err());
        assert!(parse_token("metaphor_1234abcd_0123456789abcdef0123456z").is_err());
        assert!(parse_token("metaphor_1234abcd_0123_456789abcdef01234567").is_err());
    }

    #[test]
    fn test_issue_for_user() {
        let generator = TokenGenerator::new();
        let user = ResourceId::generate();
        let expires = Utc::now() + chrono::Duration::hours(1);
        let (token, raw) = generator.issue(&TokenOwner::User(user.clone()), Some(expires)).unwrap();
        assert!(!token.is_admin);
        assert_eq!(token.user_id.as_deref(), Some(user.as_str()));
        assert_eq!(token.expires_at, Some(expires));
        assert_eq!(parse_token(&raw).unwrap().0, token.token_lookup);
        assert!(generator.verify(&raw, &token.token_hash).unwrap());
    }

    #[test]
    fn test_issue_for_admin() {
        let (token, _) = TokenGenerator::new().issue(&TokenOwner::Admin, None).unwrap();
        assert!(token.is_admin);
        assert_eq!(token.user_id, None);
    }
}
