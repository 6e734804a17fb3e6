//! Content digests.
//!
//! Every artifact the pipeline uploads is addressed by the SHA-256 of its bytes,
//! rendered as lowercase hex. Queue messages carry the digest next to the blob
//! location so a consumer can detect corruption before doing any work.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{CoreError, Result};

const HEX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Compute the digest of `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Returns `true` if `bytes` hash to this digest.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        Self::of(bytes) == *self
    }

    /// Check `bytes` against this digest, naming `location` in the error.
    pub fn verify(&self, location: &str, bytes: &[u8]) -> Result<()> {
        let actual = Self::of(bytes);
        if actual == *self {
            Ok(())
        } else {
            Err(CoreError::digest_mismatch(location, &self.0, actual.0))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        if lowered.len() != HEX_LEN || !lowered.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CoreError::invalid_digest(s));
        }
        Ok(Self(lowered))
    }
}

impl TryFrom<String> for Digest {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        let digest = Digest::of(b"abc");
        assert_eq!(
            digest.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_matches_and_verify() {
        let digest = Digest::of(b"payload");
        assert!(digest.matches(b"payload"));
        assert!(!digest.matches(b"payload!"));
        assert!(digest.verify("blob", b"payload").is_ok());

        let err = digest.verify("blob", b"tampered").unwrap_err();
        assert!(matches!(err, CoreError::DigestMismatch { .. }));
    }

    #[test]
    fn test_parse_normalizes_case() {
        let upper = "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD";
        let digest: Digest = upper.parse().unwrap();
        assert_eq!(digest, Digest::of(b"abc"));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("abc".parse::<Digest>().is_err());
        assert!("z".repeat(64).parse::<Digest>().is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let bad: std::result::Result<Digest, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }
}
