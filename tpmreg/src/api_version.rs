// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

use reqwest::Url;
use std::{collections::HashMap, fmt, str::FromStr};
use thiserror::Error;

/// Current REST API version
pub const API_VERSION: &str = "2";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ApiVersionError {
    /// A well formed version that is not the current one
    #[error("API version not supported: {0}")]
    Unsupported(String),

    /// Not a `v<digit>` version marker
    #[error("input '{0}' malformed as an API version")]
    Malformed(String),

    /// The path could not be parsed as a URI path
    #[error("invalid request path '{0}'")]
    InvalidPath(String),
}

/// An API version marker, rendered as `v<major>`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApiVersion(u8);

impl ApiVersion {
    /// The version named by API_VERSION
    pub const fn current() -> Self {
        ApiVersion(2)
    }

    /// The version as used in URL prefixes, e.g. "v2"
    pub fn prefix(&self) -> String {
        format!("v{}", self.0)
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ApiVersion {
    type Err = ApiVersionError;

    /// Accepts "v2" or "2". Any other single digit is well formed but
    /// unsupported.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let number = input.strip_prefix('v').unwrap_or(input);
        let mut chars = number.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_digit() => {
                if number == API_VERSION {
                    Ok(ApiVersion::current())
                } else {
                    Err(ApiVersionError::Unsupported(input.to_string()))
                }
            }
            _ => Err(ApiVersionError::Malformed(input.to_string())),
        }
    }
}

/// Strip an optional API version segment from the front of a path
///
/// A leading segment of two characters starting with 'v' is taken as the
/// version marker and must name the current version. Paths without a
/// marker are served with the current version.
///
/// Returns the version in effect and the rest of the path, without the
/// leading slash.
pub fn split_version_prefix(
    path: &str,
) -> Result<(ApiVersion, &str), ApiVersionError> {
    let trimmed = path.trim_matches('/');
    let (first, rest) = match trimmed.split_once('/') {
        Some((first, rest)) => (first, rest),
        None => (trimmed, ""),
    };

    if first.len() == 2 && first.starts_with('v') {
        return match first.parse::<ApiVersion>() {
            Ok(v) => Ok((v, rest)),
            Err(ApiVersionError::Malformed(m)) => {
                Err(ApiVersionError::Unsupported(m))
            }
            Err(e) => Err(e),
        };
    }

    Ok((ApiVersion::current(), trimmed))
}

/// Pair up the RESTful parameters of a request URI
///
/// Path tokens are grouped as `key/value` pairs, a trailing key without a
/// value maps to `None`. Query parameters are added afterwards, and the
/// `api_version` key carries the version in effect.
///
/// ```
/// use tpmreg::api_version::restful_params;
///
/// let params = restful_params("/v2/agents/D432FBB3?verbose=1").unwrap();
/// assert_eq!(params["agents"].as_deref(), Some("D432FBB3"));
/// assert_eq!(params["verbose"].as_deref(), Some("1"));
/// assert_eq!(params["api_version"].as_deref(), Some("2"));
/// ```
pub fn restful_params(
    uri: &str,
) -> Result<HashMap<String, Option<String>>, ApiVersionError> {
    let base = Url::parse("http://localhost/")
        .map_err(|_| ApiVersionError::InvalidPath(uri.to_string()))?;
    let url = base
        .join(uri.trim_start_matches('/'))
        .map_err(|_| ApiVersionError::InvalidPath(uri.to_string()))?;

    let (version, path) = split_version_prefix(url.path())?;

    let mut params = HashMap::new();
    let tokens: Vec<&str> = path.split('/').filter(|t| !t.is_empty()).collect();
    for pair in tokens.chunks(2) {
        let value = pair.get(1).map(|v| v.to_string());
        let _ = params.insert(pair[0].to_string(), value);
    }
    let _ = params.insert("api_version".to_string(), Some(version.to_string()));
    for (key, value) in url.query_pairs() {
        let _ = params.insert(key.into_owned(), Some(value.into_owned()));
    }

    Ok(params)
}
