//! SHA-256 content digests.
//!
//! A [`Digest`] is the canonical identity of a blob of bytes. Digests
//! render as `sha256:<hex>` and may be *abbreviated* (fewer than 64 hex
//! digits) when used as query inputs; an abbreviated digest never
//! identifies content, it only matches against full digests via
//! [`Digest::expands`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::errors::{Error, ErrorKind};

/// Number of hex digits in a full SHA-256 digest.
const FULL_HEX_LEN: usize = 64;

/// A SHA-256 content digest, possibly abbreviated.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Digest the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut h = Sha256::new();
        h.update(data);
        Digest(hex::encode(h.finalize()))
    }

    /// Digest a UTF-8 string's bytes.
    pub fn from_str_content(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }

    /// Parse a digest from its string form. Accepts an optional
    /// `sha256:` prefix and abbreviated (short) hex strings.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let hex_part = s.strip_prefix("sha256:").unwrap_or(s);
        if hex_part.is_empty() || hex_part.len() > FULL_HEX_LEN {
            return Err(Error::new(
                ErrorKind::Fatal,
                "digest parse",
                format!("invalid digest length {}", hex_part.len()),
            ));
        }
        if !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::new(
                ErrorKind::Fatal,
                "digest parse",
                format!("invalid digest {s:?}"),
            ));
        }
        Ok(Digest(hex_part.to_ascii_lowercase()))
    }

    /// The full hex string.
    pub fn hex(&self) -> &str {
        &self.0
    }

    /// The first `n` hex digits (or the whole digest if shorter).
    pub fn hex_n(&self, n: usize) -> &str {
        &self.0[..n.min(self.0.len())]
    }

    /// A short display form.
    pub fn short(&self) -> &str {
        self.hex_n(12)
    }

    /// Whether this digest is abbreviated.
    pub fn is_abbrev(&self) -> bool {
        self.0.len() < FULL_HEX_LEN
    }

    /// Whether this (full) digest expands the given abbreviation.
    pub fn expands(&self, abbrev: &Digest) -> bool {
        !self.is_abbrev() && self.0.starts_with(&abbrev.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.short())
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        Digest::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> String {
        d.to_string()
    }
}
