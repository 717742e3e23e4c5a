// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

use thiserror::Error;
use tpmreg::{
    agent_identity::AgentIdentityBuilderError,
    crypto::CryptoError,
    registrar_client::{RegistrarClientBuilderError, RegistrarClientError},
    tls::TlsError,
};

#[derive(Error, Debug)]
pub(crate) enum Error {
    /// The registrar answered with an error
    #[error("Registrar rejected {operation} with {code}: {status}")]
    Rejected {
        operation: &'static str,
        code: u16,
        status: String,
    },

    #[error("Invalid agent identity: {0}")]
    Identity(#[from] AgentIdentityBuilderError),

    #[error("Registrar client error: {0}")]
    Client(#[from] RegistrarClientError),

    #[error("Registrar client builder error: {0}")]
    ClientBuilder(#[from] RegistrarClientBuilderError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Error reading {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub(crate) type Result<T> = std::result::Result<T, Error>;
