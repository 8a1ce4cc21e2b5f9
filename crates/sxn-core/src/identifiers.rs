//! Validated newtypes for identifiers that cross component boundaries.
//!
//! Each type parses once, at the boundary, and is a proof of validity from then on —
//! no downstream code re-checks charset or length.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn valid_name_charset(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// A session or project name: letters, digits, `-`, `_`, 1+ chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Name(String);

impl Name {
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if valid_name_charset(&raw) {
            Ok(Self(raw))
        } else {
            Err(Error::Validation {
                message: format!(
                    "name '{raw}' must be 1+ chars of [A-Za-z0-9_-]"
                ),
            })
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Name {
    type Error = Error;
    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<Name> for String {
    fn from(value: Name) -> Self {
        value.0
    }
}

/// A 128-bit opaque session token, stored as a 32-character lowercase hex string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0_u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let valid = raw.len() == 32 && raw.chars().all(|c| c.is_ascii_hexdigit());
        if valid {
            Ok(Self(raw.to_lowercase()))
        } else {
            Err(Error::Validation {
                message: format!("'{raw}' is not a valid 32-char hex session id"),
            })
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = Error;
    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_accepts_charset() {
        assert!(Name::parse("feature-auth_1").is_ok());
    }

    #[test]
    fn name_rejects_empty_and_bad_chars() {
        assert!(Name::parse("").is_err());
        assert!(Name::parse("has space").is_err());
        assert!(Name::parse("slash/es").is_err());
    }

    #[test]
    fn session_id_generate_round_trips() {
        let id = SessionId::generate();
        let parsed = SessionId::parse(id.as_str()).expect("generated id must parse");
        assert_eq!(id, parsed);
        assert_eq!(id.as_str().len(), 32);
    }

    #[test]
    fn session_id_rejects_wrong_length() {
        assert!(SessionId::parse("abc").is_err());
        assert!(SessionId::parse("z".repeat(32)).is_err());
    }
}
