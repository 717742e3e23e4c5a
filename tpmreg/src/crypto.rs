// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

pub mod auth_tag;
pub mod symmkey;
#[cfg(any(test, feature = "testing"))]
pub mod x509;

use base64::{engine::general_purpose, Engine as _};
use log::*;
use openssl::{
    encrypt::{Decrypter, Encrypter},
    hash::MessageDigest,
    memcmp,
    pkcs5,
    pkey::{HasPublic, Id, PKey, PKeyRef, Private, Public},
    rsa::{Padding, Rsa},
    sign::{RsaPssSaltlen, Signer, Verifier},
    ssl::{SslAcceptor, SslAcceptorBuilder, SslMethod, SslVerifyMode},
    symm::Cipher,
    x509::store::X509StoreBuilder,
    x509::X509,
};
use std::{
    fs::{set_permissions, Permissions},
    io::Write,
    os::unix::fs::PermissionsExt,
    path::Path,
    string::FromUtf8Error,
};
use thiserror::Error;

pub const AES_128_KEY_LEN: usize = 16;
pub const AES_256_KEY_LEN: usize = 32;
pub const AES_BLOCK_SIZE: usize = 16;
pub const AUTH_TAG_LEN: usize = 48;

/// PBKDF2 parameters shared with the Python tooling
pub const KDF_ITERATIONS: usize = 2000;
pub const KDF_KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum CryptoError {
    /// Error decoding base64
    #[error("failed to decode base64")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// Error decrypting AES GCM encrypted data
    #[error("failed to decrypt AES GCM encrypted data")]
    DecryptAEADError(#[source] openssl::error::ErrorStack),

    /// Error encrypting data with AES GCM
    #[error("failed to encrypt data with AES GCM")]
    EncryptAEADError(#[source] openssl::error::ErrorStack),

    /// Error creating file
    #[error("failed to create file {file}")]
    FSCreateError {
        file: String,
        source: std::io::Error,
    },

    /// Error generating HMAC
    #[error("Failed generating HMAC: {message}")]
    HMACError {
        message: String,
        source: openssl::error::ErrorStack,
    },

    /// Invalid HMAC
    #[error("invalid HMAC")]
    InvalidHMAC,

    /// Invalid input length
    #[error("Invalid input length {length}")]
    InvalidInputLength { length: usize },

    /// Invalid key length
    #[error("Invalid key length {length}")]
    InvalidKeyLength { length: usize },

    /// Read error
    #[error("failed to read {file}")]
    IOReadError {
        file: String,
        source: std::io::Error,
    },

    /// Write error
    #[error("failed to write")]
    IOWriteError(#[source] std::io::Error),

    /// Error setting file permission
    #[error("failed to set file permission")]
    IOSetPermissionError(#[source] std::io::Error),

    /// Error deriving key from password with PBKDF2
    #[error("failed to derive key from password with PBKDF2")]
    PBKDF2Error(#[source] openssl::error::ErrorStack),

    /// Error creating PKey structure from RSA structure
    #[error("failed to create PKey structure from RSA structure")]
    PKeyFromRSAError(#[source] openssl::error::ErrorStack),

    /// Error creating PKey structure for HMAC key
    #[error("failed to create PKey structure for HMAC key")]
    PKeyHMACNewError(#[source] openssl::error::ErrorStack),

    /// Error encoding PKey structure in PKCS#8 format
    #[error("failed to encode PKey structure in PKCS#8 format")]
    PKeyToPKCS8(#[source] openssl::error::ErrorStack),

    /// Error decoding private key from PEM
    #[error("failed to decode private key from PEM")]
    PrivateKeyFromPEMError(#[source] openssl::error::ErrorStack),

    /// Error decoding public key from PEM
    #[error("failed to decode public key from PEM")]
    PublicKeyFromPEMError(#[source] openssl::error::ErrorStack),

    /// Error encoding public key in PEM format
    #[error("failed to encode public key in PEM format")]
    PublicKeyToPEMError(#[source] openssl::error::ErrorStack),

    /// Error generating random bytes
    #[error("failed to generate {length} random bytes")]
    RandomError {
        length: usize,
        source: openssl::error::ErrorStack,
    },

    /// Error composing RSA public key structure from public components
    #[error(
        "failed to compose RSA public key structure from public components"
    )]
    RSAFromComponents(#[source] openssl::error::ErrorStack),

    /// Error generating RSA key pair
    #[error("failed to generate RSA key pair with {bits} bits")]
    RSAGenerateError {
        bits: u32,
        source: openssl::error::ErrorStack,
    },

    /// Error obtaining RSA private key from structure
    #[error("failed to get RSA private key from structure")]
    RSAGetPrivateKeyError(#[source] openssl::error::ErrorStack),

    /// RSA OAEP decrypt error
    #[error("RSA OAEP decrypt error: {message}")]
    RSAOAEPDecryptError {
        message: String,
        source: openssl::error::ErrorStack,
    },

    /// RSA OAEP encrypt error
    #[error("RSA OAEP encrypt error: {message}")]
    RSAOAEPEncryptError {
        message: String,
        source: openssl::error::ErrorStack,
    },

    /// Error signing data
    #[error("failed to sign data: {message}")]
    SignError {
        message: String,
        source: openssl::error::ErrorStack,
    },

    /// Error generating TLS context
    #[error("Failed to generate TLS context: {message}")]
    SSLContextBuilderError {
        message: String,
        source: openssl::error::ErrorStack,
    },

    /// Error getting String from UTF-8 Vec
    #[error("failed to create String from UTF-8 Vec")]
    StringFromVec(#[from] FromUtf8Error),

    /// Error taking object ownership
    #[error("failed to take object ownership")]
    ToOwnedError(#[source] openssl::error::ErrorStack),

    /// Unsupported key algorithm
    #[error("unsupported key algorithm: {id}")]
    UnsupportedKeyAlgorithm { id: String },

    /// Error verifying signature
    #[error("Signature verification failed: {message}")]
    VerifyError {
        message: String,
        source: openssl::error::ErrorStack,
    },

    /// Trusted X509 certificate store builder error
    #[error("Trusted certificate store builder error: {message}")]
    X509StoreBuilderError {
        message: String,
        source: openssl::error::ErrorStack,
    },

    /// Error loading X509 certificate chain from PEM file
    #[error("failed to load X509 certificate chain from PEM file")]
    X509ChainFromPEMError(#[source] openssl::error::ErrorStack),

    /// Error loading X509 certificate from PEM file
    #[error("failed to load X509 certificate from PEM file")]
    X509FromPEMError(#[source] openssl::error::ErrorStack),

    /// Error encoding X509 certificate in PEM format
    #[error("failed to encode X509 certificate in PEM format")]
    X509ToPEMError(#[source] openssl::error::ErrorStack),

    /// No certificate found in the PEM file
    #[error("no X509 certificate found in {file}")]
    X509EmptyChain { file: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InvalidInputError {
    /// The two operands of a byte-wise operation differ in length
    #[error("cannot combine inputs of different lengths: {left} and {right} bytes")]
    LengthMismatch { left: usize, right: usize },
}

/// Load a single X509 certificate from a PEM file
pub fn load_x509_pem(input_cert_path: &Path) -> Result<X509, CryptoError> {
    let contents = std::fs::read(input_cert_path).map_err(|source| {
        CryptoError::IOReadError {
            file: input_cert_path.display().to_string(),
            source,
        }
    })?;

    X509::from_pem(&contents).map_err(CryptoError::X509FromPEMError)
}

/// Load every certificate contained in a PEM file
///
/// Used to load trust anchors, where the file may bundle a chain of CA
/// certificates. An empty file is an error.
pub fn load_x509_pem_chain(path: &Path) -> Result<Vec<X509>, CryptoError> {
    let contents =
        std::fs::read(path).map_err(|source| CryptoError::IOReadError {
            file: path.display().to_string(),
            source,
        })?;

    let certs = X509::stack_from_pem(&contents)
        .map_err(CryptoError::X509ChainFromPEMError)?;

    if certs.is_empty() {
        return Err(CryptoError::X509EmptyChain {
            file: path.display().to_string(),
        });
    }

    Ok(certs)
}

/// Read a PEM file and returns the public and private keys
///
/// An empty password is treated as no password
pub fn load_key_pair(
    key_path: &Path,
    key_password: Option<&str>,
) -> Result<(PKey<Public>, PKey<Private>), CryptoError> {
    let pem =
        std::fs::read(key_path).map_err(|source| CryptoError::IOReadError {
            file: key_path.display().to_string(),
            source,
        })?;
    let private = match key_password {
        Some(pw) if !pw.is_empty() => {
            PKey::private_key_from_pem_passphrase(&pem, pw.as_bytes())
                .map_err(CryptoError::PrivateKeyFromPEMError)?
        }
        _ => PKey::private_key_from_pem(&pem)
            .map_err(CryptoError::PrivateKeyFromPEMError)?,
    };
    let public = pkey_pub_from_priv(&private)?;
    Ok((public, private))
}

/// Write a private key to a file.
///
/// If a passphrase is provided, the key will be stored encrypted using AES-256-CBC
pub fn write_key_pair(
    key: &PKey<Private>,
    file_path: &Path,
    passphrase: Option<&str>,
) -> Result<(), CryptoError> {
    let pem = match passphrase {
        Some(pw) if !pw.is_empty() => key
            .private_key_to_pem_pkcs8_passphrase(
                Cipher::aes_256_cbc(),
                pw.as_bytes(),
            )
            .map_err(CryptoError::PKeyToPKCS8)?,
        _ => key
            .private_key_to_pem_pkcs8()
            .map_err(CryptoError::PKeyToPKCS8)?,
    };

    let mut file = std::fs::File::create(file_path).map_err(|source| {
        CryptoError::FSCreateError {
            file: file_path.display().to_string(),
            source,
        }
    })?;
    file.write_all(&pem).map_err(CryptoError::IOWriteError)?;
    set_permissions(file_path, Permissions::from_mode(0o600))
        .map_err(CryptoError::IOSetPermissionError)?;
    Ok(())
}

/// Generate an RSA private key with the given size in bits
pub fn rsa_generate(bits: u32) -> Result<PKey<Private>, CryptoError> {
    let rsa = Rsa::generate(bits)
        .map_err(|source| CryptoError::RSAGenerateError { bits, source })?;
    PKey::from_rsa(rsa).map_err(CryptoError::PKeyFromRSAError)
}

/// Generate RSA key pair with the given size
///
/// Returns a tuple containing the PKey<Public> and PKey<Private>
pub fn rsa_generate_pair(
    bits: u32,
) -> Result<(PKey<Public>, PKey<Private>), CryptoError> {
    let private = rsa_generate(bits)?;
    let public = pkey_pub_from_priv(&private)?;

    Ok((public, private))
}

pub(crate) fn pkey_pub_from_priv(
    privkey: &PKey<Private>,
) -> Result<PKey<Public>, CryptoError> {
    match privkey.id() {
        Id::RSA => {
            let rsa = privkey
                .rsa()
                .map_err(CryptoError::RSAGetPrivateKeyError)?;
            let public = Rsa::from_public_components(
                rsa.n().to_owned().map_err(CryptoError::ToOwnedError)?,
                rsa.e().to_owned().map_err(CryptoError::ToOwnedError)?,
            )
            .map_err(CryptoError::RSAFromComponents)?;
            PKey::from_rsa(public).map_err(CryptoError::PKeyFromRSAError)
        }
        id => Err(CryptoError::UnsupportedKeyAlgorithm {
            id: format!("{id:?}"),
        }),
    }
}

/// Export the public part of an RSA key (public or private) as PEM
pub fn rsa_export_pubkey<T: HasPublic>(
    key: &PKeyRef<T>,
) -> Result<String, CryptoError> {
    key.public_key_to_pem()
        .map_err(CryptoError::PublicKeyToPEMError)
        .and_then(|s| String::from_utf8(s).map_err(CryptoError::StringFromVec))
}

/// Import an RSA public key from PEM
pub fn rsa_import_pubkey(pem: &str) -> Result<PKey<Public>, CryptoError> {
    let key = PKey::public_key_from_pem(pem.as_bytes())
        .map_err(CryptoError::PublicKeyFromPEMError)?;
    match key.id() {
        Id::RSA => Ok(key),
        id => Err(CryptoError::UnsupportedKeyAlgorithm {
            id: format!("{id:?}"),
        }),
    }
}

/// Export an RSA private key as unencrypted PKCS#8 PEM
pub fn rsa_export_privkey(
    key: &PKey<Private>,
) -> Result<String, CryptoError> {
    key.private_key_to_pem_pkcs8()
        .map_err(CryptoError::PKeyToPKCS8)
        .and_then(|s| String::from_utf8(s).map_err(CryptoError::StringFromVec))
}

/// Import an RSA private key from PEM (PKCS#1 or PKCS#8)
pub fn rsa_import_privkey(pem: &str) -> Result<PKey<Private>, CryptoError> {
    let key = PKey::private_key_from_pem(pem.as_bytes())
        .map_err(CryptoError::PrivateKeyFromPEMError)?;
    match key.id() {
        Id::RSA => Ok(key),
        id => Err(CryptoError::UnsupportedKeyAlgorithm {
            id: format!("{id:?}"),
        }),
    }
}

/*
 * Inputs: RSA public key
 *         plaintext to be encrypted
 * Output: ciphertext
 *
 * Encrypt using PKCS1 OAEP with SHA-1 as both the OAEP and the MGF1 digest,
 * matching the blobs produced by the Python registrar.
 */
pub fn rsa_encrypt<T: HasPublic>(
    pub_key: &PKeyRef<T>,
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut encrypter = Encrypter::new(pub_key).map_err(|source| {
        CryptoError::RSAOAEPEncryptError {
            message: "failed to create RSA encrypter object".into(),
            source,
        }
    })?;

    encrypter
        .set_rsa_padding(Padding::PKCS1_OAEP)
        .map_err(|source| CryptoError::RSAOAEPEncryptError {
            message: "failed to set RSA encrypter padding".into(),
            source,
        })?;
    encrypter
        .set_rsa_mgf1_md(MessageDigest::sha1())
        .map_err(|source| CryptoError::RSAOAEPEncryptError {
            message: "failed to set RSA encrypter Message Digest algorithm"
                .into(),
            source,
        })?;
    encrypter
        .set_rsa_oaep_md(MessageDigest::sha1())
        .map_err(|source| CryptoError::RSAOAEPEncryptError {
            message:
                "failed to set RSA encrypter OAEP Message Digest algorithm"
                    .into(),
            source,
        })?;

    let buffer_len = encrypter.encrypt_len(data).map_err(|source| {
        CryptoError::RSAOAEPEncryptError {
            message: "failed to get RSA encrypter output length".into(),
            source,
        }
    })?;
    let mut encrypted = vec![0; buffer_len];

    let encrypted_len =
        encrypter.encrypt(data, &mut encrypted).map_err(|source| {
            CryptoError::RSAOAEPEncryptError {
                message: "failed to encrypt data with RSA OAEP".into(),
                source,
            }
        })?;
    encrypted.truncate(encrypted_len);

    Ok(encrypted)
}

/*
 * Inputs: OpenSSL RSA key
 *         ciphertext to be decrypted
 * Output: decrypted plaintext
 *
 * Take in an RSA-encrypted ciphertext and an RSA private key and decrypt the
 * ciphertext based on PKCS1 OAEP.
 */
pub fn rsa_decrypt(
    priv_key: &PKey<Private>,
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut decrypter = Decrypter::new(priv_key).map_err(|source| {
        CryptoError::RSAOAEPDecryptError {
            message: "failed to create RSA decrypter object".into(),
            source,
        }
    })?;

    decrypter
        .set_rsa_padding(Padding::PKCS1_OAEP)
        .map_err(|source| CryptoError::RSAOAEPDecryptError {
            message: "failed to set RSA decrypter padding".into(),
            source,
        })?;
    decrypter
        .set_rsa_mgf1_md(MessageDigest::sha1())
        .map_err(|source| CryptoError::RSAOAEPDecryptError {
            message: "failed to set RSA decrypter Message Digest algorithm"
                .into(),
            source,
        })?;
    decrypter
        .set_rsa_oaep_md(MessageDigest::sha1())
        .map_err(|source| CryptoError::RSAOAEPDecryptError {
            message:
                "failed to set RSA decrypter OAEP Message Digest algorithm"
                    .into(),
            source,
        })?;

    // Create an output buffer
    let buffer_len = decrypter.decrypt_len(data).map_err(|source| {
        CryptoError::RSAOAEPDecryptError {
            message: "failed to get RSA decrypter output length".into(),
            source,
        }
    })?;
    let mut decrypted = vec![0; buffer_len];

    // Decrypt and truncate the buffer
    let decrypted_len =
        decrypter.decrypt(data, &mut decrypted).map_err(|source| {
            CryptoError::RSAOAEPDecryptError {
                message: "failed to decrypt data with RSA OAEP".into(),
                source,
            }
        })?;
    decrypted.truncate(decrypted_len);

    Ok(decrypted)
}

/// Sign a message with RSASSA-PSS over SHA-256
pub fn rsa_sign(
    priv_key: &PKey<Private>,
    message: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut signer =
        Signer::new(MessageDigest::sha256(), priv_key).map_err(|source| {
            CryptoError::SignError {
                message: "failed creating Signer object".into(),
                source,
            }
        })?;
    signer
        .set_rsa_padding(Padding::PKCS1_PSS)
        .map_err(|source| CryptoError::SignError {
            message: "failed to set signer padding algorithm".into(),
            source,
        })?;
    signer
        .set_rsa_mgf1_md(MessageDigest::sha256())
        .map_err(|source| CryptoError::SignError {
            message: "failed to set signer MGF1 Message Digest algorithm"
                .into(),
            source,
        })?;
    signer
        .set_rsa_pss_saltlen(RsaPssSaltlen::MAXIMUM_LENGTH)
        .map_err(|source| CryptoError::SignError {
            message: "failed to set signer RSA PSS salt length".into(),
            source,
        })?;
    signer
        .update(message)
        .map_err(|source| CryptoError::SignError {
            message: "failed to add input data to Signer".into(),
            source,
        })?;
    signer
        .sign_to_vec()
        .map_err(|source| CryptoError::SignError {
            message: "failed to generate signature".into(),
            source,
        })
}

/*
 * Input: Trusted public key (or a key pair), message and signature
 * Output: true if they are verified, otherwise false
 *
 * A signature that does not match the message yields Ok(false). Errors are
 * only returned when the verifier itself cannot be set up.
 */
pub fn rsa_verify<T: HasPublic>(
    key: &PKeyRef<T>,
    message: &[u8],
    signature: &[u8],
) -> Result<bool, CryptoError> {
    let mut verifier = Verifier::new(MessageDigest::sha256(), key)
        .map_err(|source| CryptoError::VerifyError {
            message: "failed to create signature verifier object".into(),
            source,
        })?;
    verifier
        .set_rsa_padding(Padding::PKCS1_PSS)
        .map_err(|source| CryptoError::VerifyError {
            message: "failed to set signature verifier padding algorithm"
                .into(),
            source,
        })?;
    verifier
        .set_rsa_mgf1_md(MessageDigest::sha256())
        .map_err(|source| CryptoError::VerifyError {
            message:
                "failed to set signature verifier Message Digest algorithm"
                    .into(),
            source,
        })?;
    verifier
        .set_rsa_pss_saltlen(RsaPssSaltlen::MAXIMUM_LENGTH)
        .map_err(|source| CryptoError::VerifyError {
            message: "failed to set signature verifier RSA PSS salt length"
                .into(),
            source,
        })?;
    verifier
        .update(message)
        .map_err(|source| CryptoError::VerifyError {
            message: "failed adding input data to signature verifier".into(),
            source,
        })?;

    match verifier.verify(signature) {
        Ok(valid) => Ok(valid),
        Err(e) => {
            debug!("Signature rejected by verifier: {e}");
            Ok(false)
        }
    }
}

fn aes_cipher(key: &[u8]) -> Result<Cipher, CryptoError> {
    match key.len() {
        AES_128_KEY_LEN => Ok(Cipher::aes_128_gcm()),
        AES_256_KEY_LEN => Ok(Cipher::aes_256_gcm()),
        other => Err(CryptoError::InvalidKeyLength { length: other }),
    }
}

pub(crate) fn aes_encrypt_with_iv(
    key: &[u8],
    iv: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = aes_cipher(key)?;
    if iv.len() != AES_BLOCK_SIZE {
        return Err(CryptoError::InvalidInputLength { length: iv.len() });
    }

    let mut tag = vec![0u8; AES_BLOCK_SIZE];
    let ciphertext =
        openssl::symm::encrypt_aead(cipher, key, Some(iv), &[], data, &mut tag)
            .map_err(CryptoError::EncryptAEADError)?;

    let mut result =
        Vec::with_capacity(iv.len() + ciphertext.len() + tag.len());
    result.extend(iv);
    result.extend(ciphertext);
    result.extend(tag);
    Ok(result)
}

/// Encrypt data with AES-GCM using a fresh random IV
///
/// The output layout is `IV (16 bytes) || ciphertext || tag (16 bytes)`
pub fn aes_encrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let iv = random_bytes(AES_BLOCK_SIZE)?;
    aes_encrypt_with_iv(key, &iv, data)
}

/// Decrypt data produced by `aes_encrypt`
pub fn aes_decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = aes_cipher(key)?;

    // Parse out payload IV, tag, ciphertext. A 16-byte IV is used for
    // compatibility with existing payloads, while SP 800-38D recommends 12.
    let length = data.len();
    if length < AES_BLOCK_SIZE * 2 {
        return Err(CryptoError::InvalidInputLength { length });
    }
    let (iv, rest) = data.split_at(AES_BLOCK_SIZE);
    let (ciphertext, tag) = rest.split_at(rest.len() - AES_BLOCK_SIZE);

    openssl::symm::decrypt_aead(cipher, key, Some(iv), &[], ciphertext, tag)
        .map_err(CryptoError::DecryptAEADError)
}

/// Decrypt a base64 encoded AES-GCM payload
pub fn aes_decrypt_base64(
    key: &[u8],
    data: &str,
) -> Result<Vec<u8>, CryptoError> {
    let raw = general_purpose::STANDARD.decode(data)?;
    aes_decrypt(key, &raw)
}

/*
 * Inputs: secret key
 *        message to sign
 * Output: signed HMAC result
 *
 * SHA-384 is used as the underlying hash algorithm
 */
pub fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let pkey = PKey::hmac(key).map_err(CryptoError::PKeyHMACNewError)?;
    let mut signer =
        Signer::new(MessageDigest::sha384(), &pkey).map_err(|source| {
            CryptoError::HMACError {
                message: "failed creating Signer object".into(),
                source,
            }
        })?;
    signer
        .update(data)
        .map_err(|source| CryptoError::HMACError {
            message: "failed to add input data to Signer".into(),
            source,
        })?;
    signer
        .sign_to_vec()
        .map_err(|source| CryptoError::HMACError {
            message: "failed to generate HMAC".into(),
            source,
        })
}

/// Check an HMAC in constant time
pub fn verify_hmac(
    key: &[u8],
    data: &[u8],
    expected: &[u8],
) -> Result<(), CryptoError> {
    let computed = hmac(key, data)?;

    if computed.len() != expected.len() || !memcmp::eq(&computed, expected) {
        return Err(CryptoError::InvalidHMAC);
    }

    Ok(())
}

/*
 * Inputs: password to derive key
 *         shared salt
 * Output: derived key
 *
 * PBKDF2-HMAC with SHA-1, 2000 iterations and a 32 bytes output, matching
 * the parameters used by the Python tooling.
 */
pub fn kdf(password: &[u8], salt: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut key = vec![0; KDF_KEY_LEN];
    pkcs5::pbkdf2_hmac(
        password,
        salt,
        KDF_ITERATIONS,
        MessageDigest::sha1(),
        &mut key,
    )
    .map_err(CryptoError::PBKDF2Error)?;
    Ok(key)
}

/// XOR two byte strings of the same length
pub fn xor_combine(a: &[u8], b: &[u8]) -> Result<Vec<u8>, InvalidInputError> {
    if a.len() != b.len() {
        return Err(InvalidInputError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    Ok(a.iter().zip(b).map(|(x, y)| x ^ y).collect())
}

/// Get `length` bytes from the OpenSSL CSPRNG
pub fn random_bytes(length: usize) -> Result<Vec<u8>, CryptoError> {
    let mut buf = vec![0u8; length];
    openssl::rand::rand_bytes(&mut buf)
        .map_err(|source| CryptoError::RandomError { length, source })?;
    Ok(buf)
}

/// Generate a random symmetric key of `length` bytes
pub fn random_key(length: usize) -> Result<Vec<u8>, CryptoError> {
    random_bytes(length)
}

/// Build the server side TLS context requiring client certificates signed by
/// one of the given CA certificates
pub fn generate_tls_context(
    tls_cert: &X509,
    key: &PKey<Private>,
    ca_certs: Vec<X509>,
) -> Result<SslAcceptorBuilder, CryptoError> {
    let mut ssl_context_builder = SslAcceptor::mozilla_intermediate_v5(
        SslMethod::tls(),
    )
    .map_err(|source| CryptoError::SSLContextBuilderError {
        message: "failed to create Context Builder object".into(),
        source,
    })?;
    ssl_context_builder
        .set_certificate(tls_cert)
        .map_err(|source| CryptoError::SSLContextBuilderError {
            message: "failed to set SSL server certificate".into(),
            source,
        })?;
    ssl_context_builder.set_private_key(key).map_err(|source| {
        CryptoError::SSLContextBuilderError {
            message: "failed to set SSL server private key".into(),
            source,
        }
    })?;

    // Build verification cert store.
    let mut mtls_store_builder =
        X509StoreBuilder::new().map_err(|source| {
            CryptoError::X509StoreBuilderError {
                message:
                    "failed to create X509 certificate store builder object"
                        .into(),
                source,
            }
        })?;
    for cert in ca_certs {
        mtls_store_builder
            .add_cert(cert)
            .map_err(|source| CryptoError::X509StoreBuilderError{
                message: "failed to add certificate to X509 trusted certificate store".into(),
                    source,
            })?;
    }

    let mtls_store = mtls_store_builder.build();
    ssl_context_builder
        .set_verify_cert_store(mtls_store)
        .map_err(|source| CryptoError::SSLContextBuilderError {
            message: "failed to set SSL server trusted certificate store"
                .into(),
            source,
        })?;

    // Enable mutual TLS verification
    let mut verify_mode = SslVerifyMode::empty();
    verify_mode.set(SslVerifyMode::PEER, true);
    verify_mode.set(SslVerifyMode::FAIL_IF_NO_PEER_CERT, true);
    ssl_context_builder.set_verify(verify_mode);

    Ok(ssl_context_builder)
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::path::PathBuf;

    #[derive(Error, Debug)]
    pub enum CryptoTestError {
        /// Crypto error
        #[error("CryptoError")]
        CryptoError(#[from] CryptoError),

        /// IO error
        #[error("IOError")]
        IoError(#[from] std::io::Error),

        /// OpenSSL error
        #[error("OpenSSLError")]
        OpenSSLError(#[from] openssl::error::ErrorStack),

        /// Certificate generation error
        #[error("Certificate builder error")]
        CertificateBuilder(#[from] x509::CertificateBuilderError),
    }

    /// Encrypt with a caller chosen IV, to compare against known vectors
    pub fn encrypt_aead(
        key: &[u8],
        iv: &[u8],
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoTestError> {
        aes_encrypt_with_iv(key, iv, data).map_err(CryptoTestError::from)
    }

    /// Paths of the files written by `generate_tls_certs_for_test`
    #[derive(Debug, Clone)]
    pub struct TestTlsFiles {
        pub dir: PathBuf,
        pub ca_cert: PathBuf,
        pub server_cert: PathBuf,
        pub server_key: PathBuf,
        pub client_cert: PathBuf,
        pub client_key: PathBuf,
    }

    fn write_pem(path: &Path, pem: &[u8]) -> Result<(), CryptoTestError> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(pem)?;
        Ok(())
    }

    /// Generates a CA and a server and a client certificate signed by it.
    ///
    /// The file names follow the "default" preset layout, so `temp_dir` can
    /// be used directly as a TLS directory:
    /// `cacert.crt`, `server-cert.crt`, `server-private.pem`,
    /// `client-cert.crt`, `client-private.pem`.
    ///
    /// The client key is written encrypted when `client_key_password` is a
    /// non empty string.
    pub fn generate_tls_certs_for_test(
        temp_dir: &Path,
        client_key_password: Option<&str>,
    ) -> Result<TestTlsFiles, CryptoTestError> {
        let files = TestTlsFiles {
            dir: temp_dir.to_path_buf(),
            ca_cert: temp_dir.join("cacert.crt"),
            server_cert: temp_dir.join("server-cert.crt"),
            server_key: temp_dir.join("server-private.pem"),
            client_cert: temp_dir.join("client-cert.crt"),
            client_key: temp_dir.join("client-private.pem"),
        };

        let ca_key = rsa_generate(2048)?;
        let ca_cert = x509::CertificateBuilder::new()
            .private_key(&ca_key)
            .common_name("tpmreg test CA")
            .certificate_authority(true)
            .build()?;

        let server_key = rsa_generate(2048)?;
        let server_cert = x509::CertificateBuilder::new()
            .private_key(&server_key)
            .common_name("localhost")
            .issuer(&ca_cert, &ca_key)
            .build()?;

        let client_key = rsa_generate(2048)?;
        let client_cert = x509::CertificateBuilder::new()
            .private_key(&client_key)
            .common_name("tpmreg test client")
            .issuer(&ca_cert, &ca_key)
            .build()?;

        write_pem(&files.ca_cert, &ca_cert.to_pem()?)?;
        write_pem(&files.server_cert, &server_cert.to_pem()?)?;
        write_key_pair(&server_key, &files.server_key, None)?;
        write_pem(&files.client_cert, &client_cert.to_pem()?)?;
        write_key_pair(&client_key, &files.client_key, client_key_password)?;

        Ok(files)
    }
}
