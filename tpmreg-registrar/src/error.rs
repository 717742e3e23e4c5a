// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

use actix_web::{http::StatusCode, HttpResponse};
use thiserror::Error;
use tpmreg::{
    agent_identity::AgentIdentityBuilderError,
    config::TpmregConfigError,
    crypto::{auth_tag::AuthTagError, symmkey::SymmKeyError, CryptoError},
    json_wrapper::JsonWrapper,
};

#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("Agent {0} not found")]
    NotFound(String),
    #[error("Invalid agent identity: {0}")]
    InvalidIdentity(#[from] AgentIdentityBuilderError),
    #[error("Invalid EK for agent {agent_id}: {source}")]
    InvalidEk {
        agent_id: String,
        source: CryptoError,
    },
    #[error("Auth tag for agent {0} is invalid")]
    InvalidAuthTag(String),
    #[error("Agent {0} has no pending activation challenge")]
    NoPendingChallenge(String),
    #[error("Deep quote for agent {0} was rejected")]
    DeepQuoteRejected(String),
    #[error("Auth tag error: {0}")]
    AuthTag(#[from] AuthTagError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] openssl::error::ErrorStack),
    #[error("Key generation error: {0}")]
    SymmKey(#[from] SymmKeyError),
    #[error("Record store error: {0}")]
    Store(String),
    #[error("Configuration error: {0}")]
    Config(#[from] TpmregConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to lock agent {0}")]
    Poisoned(String),
    #[error("Blocking task failed: {0}")]
    Blocking(#[from] actix_web::error::BlockingError),
}

impl Error {
    pub(crate) fn http_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidIdentity(_)
            | Error::InvalidEk { .. }
            | Error::InvalidAuthTag(_)
            | Error::NoPendingChallenge(_)
            | Error::DeepQuoteRejected(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        self.http_code()
    }

    fn error_response(&self) -> HttpResponse {
        let code = self.http_code();
        HttpResponse::build(code)
            .json(JsonWrapper::error(code.as_u16(), self.to_string()))
    }
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{body, ResponseError};
    use serde_json::{json, Value};

    #[actix_rt::test]
    async fn test_error_response() {
        let e = Error::NotFound("uuid".into());
        assert_eq!(e.status_code(), StatusCode::NOT_FOUND);

        let resp = e.error_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let bytes = body::to_bytes(resp.into_body()).await.unwrap(); //#[allow_ci]
        let result: JsonWrapper<Value> = serde_json::from_slice(&bytes).unwrap(); //#[allow_ci]
        assert_eq!(result.code, 404);
        assert_eq!(result.status, "Agent uuid not found");
        assert_eq!(result.results, json!({}));
    }

    #[test]
    fn test_http_code() {
        assert_eq!(
            Error::InvalidAuthTag("a".into()).http_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Store("broken".into()).http_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
