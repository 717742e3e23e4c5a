// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

//! Client side mutual TLS context
//!
//! The context is built once per process from the configuration and then
//! shared. It always requires the peer certificate to verify against the
//! configured CA, only hostname checking can be switched off.

use crate::{
    config::{
        resolve_ca_cert, resolve_tls_dir, GeneralConfig,
        RegistrarClientConfig, TpmregConfig, DEFAULT_CLIENT_CERT,
        DEFAULT_CLIENT_KEY,
    },
    crypto::{self, CryptoError},
};
use log::*;
use openssl::{ssl::SslVerifyMode, x509::X509};
use std::{
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TlsError {
    /// Failed to load the trusted CA certificates
    #[error("failed to load CA certificates from {path}")]
    CACertificate {
        path: String,
        #[source]
        source: CryptoError,
    },

    /// Failed to load the client certificate
    #[error("failed to load client certificate from {path}")]
    ClientCertificate {
        path: String,
        #[source]
        source: CryptoError,
    },

    /// Failed to load the client private key
    #[error("failed to load client private key from {path}")]
    ClientKey {
        path: String,
        #[source]
        source: CryptoError,
    },

    /// The client certificate does not belong to the client key
    #[error("client certificate {cert} does not match the private key {key}")]
    KeyMismatch { cert: String, key: String },

    /// Failed to encode certificate or key material
    #[error("failed to encode TLS material")]
    Encode(#[source] CryptoError),

    /// Failed to build the HTTP client
    #[error("failed to build TLS client: {message}")]
    ClientBuilder {
        message: String,
        #[source]
        source: reqwest::Error,
    },

    /// A previous initialization attempt panicked
    #[error("TLS context initialization lock poisoned")]
    Poisoned,
}

/// Resolved locations of the client TLS material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTlsPaths {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

/// Resolve the CA, certificate and key paths for a registrar client
///
/// The `default` and `CV` presets select the `reg_ca` and `cv_ca`
/// directories together with the standard client file names. A `default`
/// certificate or key name also maps to the standard file name.
pub fn client_tls_paths(
    general: &GeneralConfig,
    section: &RegistrarClientConfig,
) -> ClientTlsPaths {
    let tls_dir = resolve_tls_dir(&general.work_dir, &section.registrar_tls_dir);
    let preset = matches!(section.registrar_tls_dir.as_str(), "default" | "CV");

    let cert = match section.registrar_my_cert.as_str() {
        _ if preset => DEFAULT_CLIENT_CERT,
        "default" => DEFAULT_CLIENT_CERT,
        other => other,
    };
    let key = match section.registrar_private_key.as_str() {
        _ if preset => DEFAULT_CLIENT_KEY,
        "default" => DEFAULT_CLIENT_KEY,
        other => other,
    };

    ClientTlsPaths {
        ca_cert: resolve_ca_cert(&tls_dir, &section.registrar_ca_cert),
        client_cert: tls_dir.join(cert),
        client_key: tls_dir.join(key),
    }
}

/// Immutable mutual TLS client state
#[derive(Debug)]
pub struct TlsClientContext {
    ca_certs: Vec<X509>,
    client_cert: X509,
    check_hostname: bool,
    verify_mode: SslVerifyMode,
    http_client: reqwest::Client,
}

impl TlsClientContext {
    /// Load the TLS material and build the HTTP client
    pub fn new(
        paths: &ClientTlsPaths,
        key_password: &str,
        check_hostname: bool,
    ) -> Result<Self, TlsError> {
        let ca_certs =
            crypto::load_x509_pem_chain(&paths.ca_cert).map_err(|source| {
                TlsError::CACertificate {
                    path: paths.ca_cert.display().to_string(),
                    source,
                }
            })?;

        let client_cert =
            crypto::load_x509_pem(&paths.client_cert).map_err(|source| {
                TlsError::ClientCertificate {
                    path: paths.client_cert.display().to_string(),
                    source,
                }
            })?;

        if key_password == "default" {
            warn!("CAUTION: using default password for private key, please set registrar_private_key_pw to a strong password");
        }
        let (public, private) =
            crypto::load_key_pair(&paths.client_key, Some(key_password))
                .map_err(|source| TlsError::ClientKey {
                    path: paths.client_key.display().to_string(),
                    source,
                })?;

        let cert_matches = client_cert
            .public_key()
            .map(|k| k.public_eq(&public))
            .unwrap_or(false);
        if !cert_matches {
            return Err(TlsError::KeyMismatch {
                cert: paths.client_cert.display().to_string(),
                key: paths.client_key.display().to_string(),
            });
        }

        let cert_pem = client_cert
            .to_pem()
            .map_err(|e| TlsError::Encode(CryptoError::X509ToPEMError(e)))?;
        let key_pem = private
            .private_key_to_pem_pkcs8()
            .map_err(|e| TlsError::Encode(CryptoError::PKeyToPKCS8(e)))?;

        let identity = reqwest::Identity::from_pkcs8_pem(&cert_pem, &key_pem)
            .map_err(|source| TlsError::ClientBuilder {
            message: "failed to create client identity".into(),
            source,
        })?;

        let mut builder = reqwest::Client::builder()
            .tls_built_in_root_certs(false)
            .identity(identity)
            .danger_accept_invalid_hostnames(!check_hostname);

        for ca in &ca_certs {
            let pem = ca.to_pem().map_err(|e| {
                TlsError::Encode(CryptoError::X509ToPEMError(e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(
                |source| TlsError::ClientBuilder {
                    message: "failed to parse CA certificate".into(),
                    source,
                },
            )?;
            builder = builder.add_root_certificate(cert);
        }

        let http_client =
            builder.build().map_err(|source| TlsError::ClientBuilder {
                message: "failed to build HTTP client".into(),
                source,
            })?;

        debug!(
            "Loaded {} trusted CA certificate(s) from {}",
            ca_certs.len(),
            paths.ca_cert.display()
        );

        Ok(TlsClientContext {
            ca_certs,
            client_cert,
            check_hostname,
            verify_mode: SslVerifyMode::PEER,
            http_client,
        })
    }

    pub fn ca_certs(&self) -> &[X509] {
        &self.ca_certs
    }

    pub fn client_cert(&self) -> &X509 {
        &self.client_cert
    }

    pub fn check_hostname(&self) -> bool {
        self.check_hostname
    }

    pub fn verify_mode(&self) -> SslVerifyMode {
        self.verify_mode
    }

    /// Whether the context verifies the server certificate
    pub fn requires_peer_cert(&self) -> bool {
        self.verify_mode.contains(SslVerifyMode::PEER)
    }

    /// HTTP client presenting the client certificate and trusting only the
    /// configured CA certificates
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }
}

/// Lazily initialized, process wide TLS context
///
/// The first successful `get_or_init` stores its result, including "TLS
/// disabled", and every later call returns it without touching the
/// filesystem. A failed initialization stores nothing.
pub struct TlsContextCell {
    cell: OnceLock<Option<Arc<TlsClientContext>>>,
    init: Mutex<()>,
}

impl Default for TlsContextCell {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsContextCell {
    pub const fn new() -> Self {
        TlsContextCell {
            cell: OnceLock::new(),
            init: Mutex::new(()),
        }
    }

    /// The stored context, if the cell was initialized with TLS enabled
    pub fn get(&self) -> Option<Arc<TlsClientContext>> {
        self.cell.get().cloned().flatten()
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn get_or_init(
        &self,
        general: &GeneralConfig,
        section: &RegistrarClientConfig,
    ) -> Result<Option<Arc<TlsClientContext>>, TlsError> {
        if let Some(ctx) = self.cell.get() {
            return Ok(ctx.clone());
        }

        let _guard = self.init.lock().map_err(|_| TlsError::Poisoned)?;

        // Another caller may have finished while this one waited
        if let Some(ctx) = self.cell.get() {
            return Ok(ctx.clone());
        }

        let ctx = if general.enable_tls {
            info!("Setting up client TLS...");
            let paths = client_tls_paths(general, section);
            Some(Arc::new(TlsClientContext::new(
                &paths,
                &section.registrar_private_key_pw,
                general.tls_check_hostnames,
            )?))
        } else {
            warn!("TLS is currently disabled, AIKs may not be authentic.");
            None
        };

        // The init lock is held, so the cell is still empty
        let _ = self.cell.set(ctx.clone());
        Ok(ctx)
    }
}

/// TLS context used to reach the registrar
pub static REGISTRAR_TLS: TlsContextCell = TlsContextCell::new();

/// Initialize the registrar TLS context from the configuration
pub fn init_client_tls(
    config: &TpmregConfig,
) -> Result<Option<Arc<TlsClientContext>>, TlsError> {
    REGISTRAR_TLS.get_or_init(&config.general, &config.registrar_client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testing::generate_tls_certs_for_test;
    use std::path::Path;

    fn config_for(dir: &Path, password: &str) -> TpmregConfig {
        let mut config = TpmregConfig::default();
        config.general.work_dir = "/nonexistent".into();
        config.registrar_client.registrar_tls_dir =
            dir.display().to_string();
        config.registrar_client.registrar_private_key_pw =
            password.to_string();
        config
    }

    #[test]
    fn test_client_tls_paths() {
        let general = GeneralConfig {
            work_dir: "/work".into(),
            ..Default::default()
        };

        let mut section = RegistrarClientConfig {
            registrar_my_cert: "mine.crt".into(),
            registrar_private_key: "mine.pem".into(),
            ..Default::default()
        };
        // Presets ignore the configured file names
        assert_eq!(
            client_tls_paths(&general, &section),
            ClientTlsPaths {
                ca_cert: "/work/reg_ca/cacert.crt".into(),
                client_cert: "/work/reg_ca/client-cert.crt".into(),
                client_key: "/work/reg_ca/client-private.pem".into(),
            }
        );

        section.registrar_tls_dir = "CV".into();
        section.registrar_ca_cert = "ca.pem".into();
        assert_eq!(
            client_tls_paths(&general, &section),
            ClientTlsPaths {
                ca_cert: "/work/cv_ca/ca.pem".into(),
                client_cert: "/work/cv_ca/client-cert.crt".into(),
                client_key: "/work/cv_ca/client-private.pem".into(),
            }
        );

        section.registrar_tls_dir = "custom".into();
        assert_eq!(
            client_tls_paths(&general, &section),
            ClientTlsPaths {
                ca_cert: "/work/custom/ca.pem".into(),
                client_cert: "/work/custom/mine.crt".into(),
                client_key: "/work/custom/mine.pem".into(),
            }
        );

        section.registrar_tls_dir = "/etc/tls".into();
        section.registrar_my_cert = "default".into();
        section.registrar_private_key = "default".into();
        assert_eq!(
            client_tls_paths(&general, &section),
            ClientTlsPaths {
                ca_cert: "/etc/tls/ca.pem".into(),
                client_cert: "/etc/tls/client-cert.crt".into(),
                client_key: "/etc/tls/client-private.pem".into(),
            }
        );
    }

    #[test]
    fn test_tls_disabled() {
        let cell = TlsContextCell::new();
        let mut config = TpmregConfig::default();
        config.general.enable_tls = false;

        let r = cell.get_or_init(&config.general, &config.registrar_client);
        assert!(r.unwrap().is_none()); //#[allow_ci]
        assert!(cell.is_initialized());
        assert!(cell.get().is_none());

        // Enabling TLS afterwards has no effect, the cell is settled
        config.general.enable_tls = true;
        let r = cell.get_or_init(&config.general, &config.registrar_client);
        assert!(r.unwrap().is_none()); //#[allow_ci]
    }

    #[test]
    fn test_init_and_reentrant() {
        let tempdir = tempfile::tempdir().unwrap(); //#[allow_ci]
        let _ = generate_tls_certs_for_test(tempdir.path(), None).unwrap(); //#[allow_ci]
        let config = config_for(tempdir.path(), "");

        let cell = TlsContextCell::new();
        let ctx = cell
            .get_or_init(&config.general, &config.registrar_client)
            .unwrap() //#[allow_ci]
            .unwrap(); //#[allow_ci]
        assert!(ctx.requires_peer_cert());
        assert_eq!(ctx.verify_mode(), SslVerifyMode::PEER);
        assert!(ctx.check_hostname());
        assert_eq!(ctx.ca_certs().len(), 1);

        // Remove the material: a second call must not read it again
        drop(tempdir);
        let again = cell
            .get_or_init(&config.general, &config.registrar_client)
            .unwrap() //#[allow_ci]
            .unwrap(); //#[allow_ci]
        assert!(Arc::ptr_eq(&ctx, &again));
    }

    #[test]
    fn test_encrypted_client_key() {
        let tempdir = tempfile::tempdir().unwrap(); //#[allow_ci]
        let _ = generate_tls_certs_for_test(tempdir.path(), Some("secret"))
            .unwrap(); //#[allow_ci]

        let paths = client_tls_paths(
            &config_for(tempdir.path(), "").general,
            &config_for(tempdir.path(), "").registrar_client,
        );
        assert!(TlsClientContext::new(&paths, "secret", true).is_ok());
        assert!(matches!(
            TlsClientContext::new(&paths, "wrong", true),
            Err(TlsError::ClientKey { .. })
        ));
    }

    #[test]
    fn test_missing_material() {
        let tempdir = tempfile::tempdir().unwrap(); //#[allow_ci]
        let config = config_for(tempdir.path(), "");
        let cell = TlsContextCell::new();

        let r = cell.get_or_init(&config.general, &config.registrar_client);
        assert!(matches!(r, Err(TlsError::CACertificate { .. })));
        // A failure leaves the cell empty so the caller can retry
        assert!(!cell.is_initialized());
    }

    #[test]
    fn test_key_mismatch() {
        let tempdir = tempfile::tempdir().unwrap(); //#[allow_ci]
        let files = generate_tls_certs_for_test(tempdir.path(), None).unwrap(); //#[allow_ci]
        // Use the server key with the client certificate
        std::fs::copy(&files.server_key, &files.client_key).unwrap(); //#[allow_ci]

        let config = config_for(tempdir.path(), "");
        let paths =
            client_tls_paths(&config.general, &config.registrar_client);
        assert!(matches!(
            TlsClientContext::new(&paths, "", true),
            Err(TlsError::KeyMismatch { .. })
        ));
    }

    #[test]
    fn test_concurrent_first_use() {
        let tempdir = tempfile::tempdir().unwrap(); //#[allow_ci]
        let _ = generate_tls_certs_for_test(tempdir.path(), None).unwrap(); //#[allow_ci]
        let config = config_for(tempdir.path(), "");
        let cell = TlsContextCell::new();

        let contexts: Vec<Arc<TlsClientContext>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        cell.get_or_init(
                            &config.general,
                            &config.registrar_client,
                        )
                        .unwrap() //#[allow_ci]
                        .unwrap() //#[allow_ci]
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap()) //#[allow_ci]
                .collect()
        });

        for ctx in &contexts[1..] {
            assert!(Arc::ptr_eq(&contexts[0], ctx));
        }
    }
}
