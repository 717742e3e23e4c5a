// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::{self, Debug, Display};

/// The `{code, status, results}` envelope wrapping every response
#[derive(Serialize, Deserialize, Debug)]
pub struct JsonWrapper<A> {
    pub code: u16,
    pub status: String,
    pub results: A,
}

/// Reason phrase for a status code, "Unknown" for unregistered codes
pub fn reason_phrase(code: u16) -> String {
    StatusCode::from_u16(code)
        .ok()
        .and_then(|c| c.canonical_reason())
        .unwrap_or("Unknown")
        .to_string()
}

impl JsonWrapper<Value> {
    pub fn error(code: u16, status: impl ToString) -> JsonWrapper<Value> {
        JsonWrapper {
            code,
            status: status.to_string(),
            results: json!({}),
        }
    }
}

impl<A> JsonWrapper<A>
where
    A: Serialize + Debug,
{
    /// Build an envelope. When no status is given, the HTTP reason phrase
    /// for `code` is used.
    pub fn new(code: u16, status: Option<&str>, results: A) -> JsonWrapper<A> {
        JsonWrapper {
            code,
            status: match status {
                Some(s) => s.to_string(),
                None => reason_phrase(code),
            },
            results,
        }
    }

    pub fn success(results: A) -> JsonWrapper<A> {
        JsonWrapper {
            code: 200,
            status: String::from("Success"),
            results,
        }
    }
}

impl<A> Display for JsonWrapper<A>
where
    A: Serialize + Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let out = json!(self).to_string();
        write!(f, "{out}")
    }
}
