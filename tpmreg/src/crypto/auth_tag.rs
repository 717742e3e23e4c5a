// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

use crate::crypto::{hmac, CryptoError, AUTH_TAG_LEN};
use openssl::memcmp;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthTagError {
    /// Invalid authentication tag size
    #[error("auth tag length {0} does not correspond to valid SHA-384 HMAC")]
    InvalidAuthTagSize(usize),

    /// The tag is not a hex string
    #[error("auth tag is not valid hex")]
    Hex(#[from] hex::FromHexError),

    /// HMAC computation failed
    #[error("failed to compute auth tag")]
    Crypto(#[from] CryptoError),
}

/// Proof of possession of the bootstrap secret for a given agent
///
/// The tag is `HMAC-SHA384(secret, agent_id)`, and travels hex encoded.
#[derive(Debug, Clone)]
pub struct AuthTag {
    bytes: Vec<u8>,
}

impl AuthTag {
    pub fn compute(secret: &[u8], agent_id: &str) -> Result<Self, AuthTagError> {
        let bytes = hmac(secret, agent_id.as_bytes())?;
        AuthTag::try_from(bytes.as_slice())
    }

    pub fn from_hex(s: &str) -> Result<Self, AuthTagError> {
        let bytes = hex::decode(s)?;
        AuthTag::try_from(bytes.as_slice())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Constant time comparison of two tags
    pub fn matches(&self, other: &AuthTag) -> bool {
        memcmp::eq(&self.bytes, &other.bytes)
    }
}

impl AsRef<[u8]> for AuthTag {
    fn as_ref(&self) -> &[u8] {
        self.bytes.as_slice()
    }
}

impl TryFrom<&[u8]> for AuthTag {
    type Error = AuthTagError;

    fn try_from(v: &[u8]) -> std::result::Result<Self, Self::Error> {
        match v.len() {
            AUTH_TAG_LEN => Ok(AuthTag { bytes: v.to_vec() }),
            _ => Err(AuthTagError::InvalidAuthTagSize(v.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert() {
        let a: [u8; AUTH_TAG_LEN] = [0xAA; AUTH_TAG_LEN];
        let invalid: [u8; 32] = [0xBB; 32];

        let r = AuthTag::try_from(a.as_ref());
        assert!(r.is_ok());

        let r = AuthTag::try_from(invalid.as_ref());
        assert!(matches!(r, Err(AuthTagError::InvalidAuthTagSize(32))));
    }

    #[test]
    fn test_compute_and_match() {
        let tag = AuthTag::compute(b"mysecret", "hellothere").unwrap(); //#[allow_ci]
        assert_eq!(
            tag.to_hex(),
            "b8558314f515931c8d9b329805978fe77b9bb020b05406c0ef189d89846ff8f5f0ca10e387d2c424358171df7f896f9f"
        );

        let parsed = AuthTag::from_hex(&tag.to_hex()).unwrap(); //#[allow_ci]
        assert!(parsed.matches(&tag));

        let other = AuthTag::compute(b"mysecret", "another-agent").unwrap(); //#[allow_ci]
        assert!(!other.matches(&tag));
    }

    #[test]
    fn test_from_hex_invalid() {
        assert!(matches!(
            AuthTag::from_hex("zz"),
            Err(AuthTagError::Hex(_))
        ));
        assert!(matches!(
            AuthTag::from_hex("abcd"),
            Err(AuthTagError::InvalidAuthTagSize(2))
        ));
    }
}
