// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

use crate::crypto::{
    random_key, xor_combine, CryptoError, InvalidInputError, AES_128_KEY_LEN,
    AES_256_KEY_LEN,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SymmKeyError {
    /// Invalid key size for AES
    #[error("invalid AES key size: {0}")]
    InvalidKeySize(usize),

    /// Incompatible sizes for XOR
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    /// Failed to draw random key material
    #[error("failed to generate key")]
    Generate(#[from] CryptoError),
}

/// A key of length AES_128_KEY_LEN or AES_256_KEY_LEN
///
/// The key bytes are never printed, the Debug output only shows the length.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmKey {
    bytes: Vec<u8>,
}

impl SymmKey {
    /// Draw a fresh random key of `len` bytes
    pub fn generate(len: usize) -> Result<Self, SymmKeyError> {
        match len {
            AES_128_KEY_LEN | AES_256_KEY_LEN => Ok(SymmKey {
                bytes: random_key(len)?,
            }),
            other => Err(SymmKeyError::InvalidKeySize(other)),
        }
    }

    pub fn xor(&self, other: &Self) -> Result<Self, SymmKeyError> {
        let bytes = xor_combine(self.as_ref(), other.as_ref())?;
        Ok(Self { bytes })
    }
}

impl std::fmt::Debug for SymmKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmKey({} bytes)", self.bytes.len())
    }
}

impl AsRef<[u8]> for SymmKey {
    fn as_ref(&self) -> &[u8] {
        self.bytes.as_slice()
    }
}

impl TryFrom<&[u8]> for SymmKey {
    type Error = SymmKeyError;

    fn try_from(v: &[u8]) -> std::result::Result<Self, SymmKeyError> {
        match v.len() {
            AES_128_KEY_LEN | AES_256_KEY_LEN => {
                Ok(SymmKey { bytes: v.to_vec() })
            }
            other => Err(SymmKeyError::InvalidKeySize(other)),
        }
    }
}
