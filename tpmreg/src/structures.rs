// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

//! Request and response bodies of the registrar REST API
//!
//! All records reject unknown fields, so a malformed or unexpected payload
//! fails at deserialization instead of when a field is first used.

use crate::serialization::*;
use serde::{Deserialize, Serialize};

/// Body of `POST /agents/{agent_id}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    /// Public EK in PEM format
    pub ek: String,
    /// DER encoded EK certificate
    #[serde(
        serialize_with = "serialize_maybe_base64",
        deserialize_with = "deserialize_maybe_base64",
        default
    )]
    pub ekcert: Option<Vec<u8>>,
    /// Public AIK
    pub aik: String,
    #[serde(default)]
    pub aik_name: Option<String>,
    /// TPM specific EK data
    #[serde(default)]
    pub ek_tpm: Option<String>,
    pub tpm_version: u8,
}

/// Results of a successful registration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RegisterResults {
    /// The challenge, encrypted to the EK
    #[serde(
        serialize_with = "serialize_as_base64",
        deserialize_with = "deserialize_as_base64"
    )]
    pub blob: Vec<u8>,
}

/// Body of `PUT /agents/{agent_id}/activate`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ActivateRequest {
    /// Hex encoded HMAC-SHA384 of the agent ID keyed with the challenge
    pub auth_tag: String,
}

/// Body of `PUT /agents/{agent_id}/vactivate`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VirtualActivateRequest {
    pub deepquote: String,
}

/// Results of `GET /agents/{agent_id}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentInfo {
    pub aik: String,
    pub ek: String,
    #[serde(
        serialize_with = "serialize_maybe_base64",
        deserialize_with = "deserialize_maybe_base64",
        default
    )]
    pub ekcert: Option<Vec<u8>>,
    #[serde(default)]
    pub aik_name: Option<String>,
    #[serde(default)]
    pub ek_tpm: Option<String>,
    pub tpm_version: u8,
    pub active: bool,
    pub regcount: u32,
}

/// Empty results object, `{}`
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EmptyResults {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_wrapper::JsonWrapper;
    use serde_json::json;

    #[test]
    fn test_register_request() {
        let body = json!({
            "ek": "ek-pem",
            "ekcert": "dGVzdA==",
            "aik": "aik-pem",
            "aik_name": null,
            "ek_tpm": null,
            "tpm_version": 2,
        });
        let req: RegisterRequest = serde_json::from_value(body).unwrap(); //#[allow_ci]
        assert_eq!(req.ekcert, Some(b"test".to_vec()));
        assert_eq!(req.aik_name, None);
        assert_eq!(req.tpm_version, 2);

        // Optional fields may be absent
        let req: RegisterRequest = serde_json::from_value(json!({
            "ek": "ek-pem",
            "aik": "aik-pem",
            "tpm_version": 1,
        }))
        .unwrap(); //#[allow_ci]
        assert_eq!(req.ekcert, None);

        // Extra fields are rejected
        let r: Result<RegisterRequest, _> = serde_json::from_value(json!({
            "ek": "ek-pem",
            "aik": "aik-pem",
            "tpm_version": 2,
            "extra": 1,
        }));
        assert!(r.is_err());

        // Missing required fields are rejected
        let r: Result<RegisterRequest, _> =
            serde_json::from_value(json!({"ek": "ek-pem", "tpm_version": 2}));
        assert!(r.is_err());

        // Mistyped fields are rejected
        let r: Result<RegisterRequest, _> = serde_json::from_value(json!({
            "ek": "ek-pem",
            "aik": "aik-pem",
            "tpm_version": "two",
        }));
        assert!(r.is_err());
    }

    #[test]
    fn test_envelopes() {
        let s = JsonWrapper::success(RegisterResults {
            blob: b"test".to_vec(),
        })
        .to_string();
        assert_eq!(
            s,
            json!({"code": 200, "status": "Success", "results": {"blob": "dGVzdA=="}})
                .to_string()
        );

        let w: JsonWrapper<EmptyResults> = serde_json::from_str(
            "{\"code\":200,\"status\":\"OK\",\"results\":{}}",
        )
        .unwrap(); //#[allow_ci]
        assert_eq!(w.results, EmptyResults {});

        let r: Result<JsonWrapper<RegisterResults>, _> = serde_json::from_str(
            "{\"code\":200,\"status\":\"OK\",\"results\":{}}",
        );
        assert!(r.is_err());

        let r: Result<JsonWrapper<ActivateRequest>, _> =
            serde_json::from_str("{\"code\":200,\"status\":\"OK\",\"results\":{\"auth_tag\":\"00\",\"nonce\":1}}");
        assert!(r.is_err());
    }
}
