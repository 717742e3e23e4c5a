// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

//! Bootstrap key handling
//!
//! The bootstrap key `K` is split into `U` and `V` with `K = U ^ V`. `U`
//! travels to the agent inside the registrar challenge, `V` reaches it over
//! a separately authenticated channel. Neither half alone reveals `K`.

use crate::crypto::{
    auth_tag::{AuthTag, AuthTagError},
    rsa_decrypt,
    symmkey::{SymmKey, SymmKeyError},
    CryptoError, AES_256_KEY_LEN,
};
use log::*;
use openssl::pkey::{PKey, Private};
use std::path::Path;

/// Size in bytes of the bootstrap key and of each of its halves
pub const BOOTSTRAP_KEY_SIZE: usize = AES_256_KEY_LEN;

/// Split `key` into two random looking halves `(U, V)`
pub fn split_key(key: &SymmKey) -> Result<(SymmKey, SymmKey), SymmKeyError> {
    let u = SymmKey::generate(key.as_ref().len())?;
    let v = key.xor(&u)?;
    Ok((u, v))
}

/// Recombine the halves produced by `split_key`
pub fn combine_key(u: &SymmKey, v: &SymmKey) -> Result<SymmKey, SymmKeyError> {
    u.xor(v)
}

/// Check that a combined key matches the tag derived for `agent_id`
///
/// The tag is `HMAC-SHA384(K, agent_id)`, computed by whoever split the key.
pub fn verify_combined_key(
    key: &SymmKey,
    agent_id: &str,
    tag: &AuthTag,
) -> Result<(), AuthTagError> {
    let expected = AuthTag::compute(key.as_ref(), agent_id)?;
    if expected.matches(tag) {
        Ok(())
    } else {
        debug!("Combined key does not match the tag for agent {agent_id}");
        Err(AuthTagError::Crypto(CryptoError::InvalidHMAC))
    }
}

/// Recovers the registrar challenge secret `U` from the blob returned on
/// registration
///
/// On real deployments this is the TPM ActivateCredential flow. The trait
/// keeps the protocol code independent from the TPM stack.
pub trait SecretRecovery {
    fn recover_secret(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Recovery backed by an EK private key held in software
pub struct SoftwareRecovery {
    ek_private: PKey<Private>,
}

impl SoftwareRecovery {
    pub fn new(ek_private: PKey<Private>) -> Self {
        SoftwareRecovery { ek_private }
    }

    /// Load the EK private key from a PEM file
    pub fn from_key_file(
        path: &Path,
        password: Option<&str>,
    ) -> Result<Self, CryptoError> {
        let (_, ek_private) = crate::crypto::load_key_pair(path, password)?;
        Ok(SoftwareRecovery { ek_private })
    }
}

impl SecretRecovery for SoftwareRecovery {
    fn recover_secret(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        rsa_decrypt(&self.ek_private, blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{rsa_encrypt, rsa_generate_pair};

    #[test]
    fn test_split_combine() {
        let k = SymmKey::generate(BOOTSTRAP_KEY_SIZE).unwrap(); //#[allow_ci]
        let (u, v) = split_key(&k).unwrap(); //#[allow_ci]
        assert_ne!(u, k);
        assert_ne!(v, k);

        let combined = combine_key(&u, &v).unwrap(); //#[allow_ci]
        assert_eq!(combined, k);
        assert_eq!(combine_key(&v, &u).unwrap(), k); //#[allow_ci]
    }

    #[test]
    fn test_combine_mismatched() {
        let u = SymmKey::generate(32).unwrap(); //#[allow_ci]
        let v = SymmKey::generate(16).unwrap(); //#[allow_ci]
        assert!(combine_key(&u, &v).is_err());
    }

    #[test]
    fn test_verify_combined_key() {
        let k = SymmKey::generate(BOOTSTRAP_KEY_SIZE).unwrap(); //#[allow_ci]
        let tag = AuthTag::compute(k.as_ref(), "agent-1").unwrap(); //#[allow_ci]
        let (u, v) = split_key(&k).unwrap(); //#[allow_ci]
        let combined = combine_key(&u, &v).unwrap(); //#[allow_ci]

        assert!(verify_combined_key(&combined, "agent-1", &tag).is_ok());
        assert!(verify_combined_key(&combined, "agent-2", &tag).is_err());
        assert!(verify_combined_key(&u, "agent-1", &tag).is_err());
    }

    #[test]
    fn test_software_recovery() {
        let (ek_pub, ek_priv) = rsa_generate_pair(2048).unwrap(); //#[allow_ci]
        let secret = SymmKey::generate(BOOTSTRAP_KEY_SIZE).unwrap(); //#[allow_ci]
        let blob = rsa_encrypt(&ek_pub, secret.as_ref()).unwrap(); //#[allow_ci]

        let recovery = SoftwareRecovery::new(ek_priv);
        let recovered = recovery.recover_secret(&blob).unwrap(); //#[allow_ci]
        assert_eq!(recovered, secret.as_ref());

        let (_, other) = rsa_generate_pair(2048).unwrap(); //#[allow_ci]
        let recovery = SoftwareRecovery::new(other);
        assert!(recovery.recover_secret(&blob).is_err());
    }

    #[test]
    fn test_software_recovery_from_file() {
        let temp_dir = tempfile::tempdir().unwrap(); //#[allow_ci]
        let path = temp_dir.path().join("ek.pem");
        let (ek_pub, ek_priv) = rsa_generate_pair(2048).unwrap(); //#[allow_ci]
        crate::crypto::write_key_pair(&ek_priv, &path, Some("secret"))
            .unwrap(); //#[allow_ci]

        let recovery =
            SoftwareRecovery::from_key_file(&path, Some("secret")).unwrap(); //#[allow_ci]
        let blob = rsa_encrypt(&ek_pub, b"secret-u").unwrap(); //#[allow_ci]
        assert_eq!(recovery.recover_secret(&blob).unwrap(), b"secret-u"); //#[allow_ci]
    }
}
