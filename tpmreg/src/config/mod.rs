// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

mod env;
mod error;
mod file_config;

pub use env::*;
pub use error::*;
pub use file_config::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub static DEFAULT_WORK_DIR: &str = "/var/lib/tpmreg";
pub static DEFAULT_TLS_DIR: &str = "reg_ca";
pub static CV_TLS_DIR: &str = "cv_ca";
pub static DEFAULT_CA_CERT: &str = "cacert.crt";
pub static DEFAULT_CLIENT_CERT: &str = "client-cert.crt";
pub static DEFAULT_CLIENT_KEY: &str = "client-private.pem";
pub static DEFAULT_SERVER_CERT: &str = "server-cert.crt";
pub static DEFAULT_SERVER_KEY: &str = "server-private.pem";
pub static DEFAULT_REGISTRAR_IP: &str = "127.0.0.1";
pub const DEFAULT_REGISTRAR_PORT: u16 = 8890;
pub const DEFAULT_REGISTRAR_TLS_PORT: u16 = 8891;
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 100;

/// The complete configuration, built once at startup and then only read
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TpmregConfig {
    pub general: GeneralConfig,
    pub registrar_client: RegistrarClientConfig,
    pub registrar: RegistrarConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GeneralConfig {
    pub work_dir: String,
    pub enable_tls: bool,
    pub tls_check_hostnames: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            work_dir: DEFAULT_WORK_DIR.to_string(),
            enable_tls: true,
            tls_check_hostnames: true,
        }
    }
}

/// Options used to reach a registrar
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegistrarClientConfig {
    pub registrar_ip: String,
    pub registrar_port: u16,
    pub registrar_tls_port: u16,
    pub registrar_tls_dir: String,
    pub registrar_my_cert: String,
    pub registrar_private_key: String,
    pub registrar_private_key_pw: String,
    pub registrar_ca_cert: String,
    /// Request timeout in milliseconds, 0 disables it
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_initial_delay_ms: u64,
}

impl Default for RegistrarClientConfig {
    fn default() -> Self {
        RegistrarClientConfig {
            registrar_ip: DEFAULT_REGISTRAR_IP.to_string(),
            registrar_port: DEFAULT_REGISTRAR_PORT,
            registrar_tls_port: DEFAULT_REGISTRAR_TLS_PORT,
            registrar_tls_dir: "default".to_string(),
            registrar_my_cert: "default".to_string(),
            registrar_private_key: "default".to_string(),
            registrar_private_key_pw: String::new(),
            registrar_ca_cert: "default".to_string(),
            timeout_ms: 0,
            max_retries: 0,
            retry_initial_delay_ms: DEFAULT_RETRY_INITIAL_DELAY_MS,
        }
    }
}

/// Options of the registrar service
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegistrarConfig {
    pub ip: String,
    pub port: u16,
    pub tls_port: u16,
    pub tls_dir: String,
    pub server_cert: String,
    pub server_key: String,
    pub server_key_password: String,
    pub ca_cert: String,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        RegistrarConfig {
            ip: DEFAULT_REGISTRAR_IP.to_string(),
            port: DEFAULT_REGISTRAR_PORT,
            tls_port: DEFAULT_REGISTRAR_TLS_PORT,
            tls_dir: "default".to_string(),
            server_cert: DEFAULT_SERVER_CERT.to_string(),
            server_key: DEFAULT_SERVER_KEY.to_string(),
            server_key_password: String::new(),
            ca_cert: "default".to_string(),
        }
    }
}

/// Resolve a TLS directory option
///
/// `default` maps to `reg_ca` and `CV` to `cv_ca`. Relative paths are
/// resolved under `work_dir`.
pub fn resolve_tls_dir(work_dir: &str, tls_dir: &str) -> PathBuf {
    let dir = match tls_dir {
        "default" => DEFAULT_TLS_DIR,
        "CV" => CV_TLS_DIR,
        other => other,
    };

    let path = Path::new(dir);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        Path::new(work_dir).join(path)
    }
}

/// Resolve a CA certificate option inside `tls_dir`
pub fn resolve_ca_cert(tls_dir: &Path, ca_cert: &str) -> PathBuf {
    match ca_cert {
        "default" => tls_dir.join(DEFAULT_CA_CERT),
        other => tls_dir.join(other),
    }
}

impl RegistrarConfig {
    /// Paths of the server certificate, key and trusted CA certificate
    pub fn tls_paths(&self, general: &GeneralConfig) -> (PathBuf, PathBuf, PathBuf) {
        let dir = resolve_tls_dir(&general.work_dir, &self.tls_dir);
        let cert = dir.join(match self.server_cert.as_str() {
            "default" => DEFAULT_SERVER_CERT,
            other => other,
        });
        let key = dir.join(match self.server_key.as_str() {
            "default" => DEFAULT_SERVER_KEY,
            other => other,
        });
        let ca = resolve_ca_cert(&dir, &self.ca_cert);
        (cert, key, ca)
    }
}
