// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

use crate::{
    agent_identity::AgentIdentity,
    api_version::ApiVersion,
    crypto::auth_tag::{AuthTag, AuthTagError},
    json_wrapper::{reason_phrase, JsonWrapper},
    resilient_client::{ResilientClient, RetryConfig},
    structures::{
        ActivateRequest, AgentInfo, EmptyResults, RegisterResults,
        VirtualActivateRequest,
    },
    tls::TlsClientContext,
};
use log::*;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Number of cached AIK lookups before the registrar is asked again
pub const MAX_STALE_REGISTRAR_CACHE: u32 = 200;

#[derive(Error, Debug)]
pub enum RegistrarClientBuilderError {
    /// Registrar IP or hostname not set
    #[error("Registrar IP or hostname not set")]
    RegistrarIPNotSet,

    /// Registrar port not set
    #[error("Registrar port not set")]
    RegistrarPortNotSet,
}

/// The registrar answered, but not with the expected payload
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The response is not a valid envelope for the operation
    #[error("Malformed {operation} response from registrar: {source}")]
    MalformedResponse {
        operation: &'static str,
        source: serde_json::Error,
    },

    /// The identity returned by the registrar carries no AIK
    #[error("Registrar returned no AIK for agent {0}")]
    MissingAik(String),
}

#[derive(Error, Debug)]
pub enum RegistrarClientError {
    /// The identity query was attempted without mutual TLS
    #[error("Refusing to fetch identity of agent {0} without mutual TLS")]
    Authorization(String),

    /// Failure to compute the activation proof
    #[error("Failed to compute activation proof: {0}")]
    Crypto(#[from] AuthTagError),

    /// Invalid payload received from the registrar
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Serde error
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Connection, TLS handshake or timeout failure
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest_middleware::Error),
}

impl From<reqwest::Error> for RegistrarClientError {
    fn from(e: reqwest::Error) -> Self {
        RegistrarClientError::Transport(reqwest_middleware::Error::from(e))
    }
}

/// A non-success answer from the registrar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: u16,
    pub status: String,
    pub body: String,
}

/// Result of a registrar round trip that reached the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Accepted(T),
    Rejected(Rejection),
}

impl<T> Outcome<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted(_))
    }

    pub fn accepted(self) -> Option<T> {
        match self {
            Outcome::Accepted(v) => Some(v),
            Outcome::Rejected(_) => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Accepted(v) => Outcome::Accepted(f(v)),
            Outcome::Rejected(r) => Outcome::Rejected(r),
        }
    }
}

#[derive(Debug, Default)]
pub struct RegistrarClientBuilder {
    registrar_address: Option<String>,
    registrar_port: Option<u16>,
    registrar_tls_port: Option<u16>,
    retry_config: Option<RetryConfig>,
    timeout: Option<u64>,
    tls_context: Option<Arc<TlsClientContext>>,
}

impl RegistrarClientBuilder {
    /// Create a new RegistrarClientBuilder object
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the registrar IP address or hostname
    ///
    /// # Arguments:
    ///
    /// * address (String): The registrar IP or hostname
    pub fn registrar_address(mut self, address: String) -> Self {
        let a = RegistrarClientBuilder::parse_registrar_address(address);
        self.registrar_address = Some(a);
        self
    }

    /// Set the port of the plain HTTP listener
    pub fn registrar_port(mut self, port: u16) -> Self {
        self.registrar_port = Some(port);
        self
    }

    /// Set the port of the mutual TLS listener. Defaults to the plain port
    pub fn registrar_tls_port(mut self, port: u16) -> Self {
        self.registrar_tls_port = Some(port);
        self
    }

    /// Set the RetryConfig for the registrar client
    ///
    /// # Arguments:
    ///
    /// * rt: RetryConfig: The retry configuration to use for the registrar client
    pub fn retry_config(mut self, rt: Option<RetryConfig>) -> Self {
        self.retry_config = rt;
        self
    }

    /// Set the request timeout in milliseconds
    pub fn timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the mutual TLS context. Without one, identity queries are
    /// refused
    pub fn tls_context(mut self, ctx: Option<Arc<TlsClientContext>>) -> Self {
        self.tls_context = ctx;
        self
    }

    /// Parse the received address
    fn parse_registrar_address(address: String) -> String {
        match address.parse::<IpAddr>() {
            Ok(addr) => {
                // Add brackets if the address is IPv6
                if addr.is_ipv6() {
                    format!("[{address}]")
                } else {
                    address
                }
            }
            // The registrar_ip option can also be a hostname
            Err(_) => address,
        }
    }

    /// Generate the RegistrarClient object using the previously set options
    pub fn build(self) -> Result<RegistrarClient, RegistrarClientBuilderError> {
        let Some(registrar_ip) = self.registrar_address else {
            return Err(RegistrarClientBuilderError::RegistrarIPNotSet);
        };

        let Some(registrar_port) = self.registrar_port else {
            return Err(RegistrarClientBuilderError::RegistrarPortNotSet);
        };

        // No retry config: every request is sent once
        let retry_config = self.retry_config.unwrap_or(RetryConfig {
            max_retries: 0,
            initial_delay_ms: 100,
            max_delay_ms: None,
        });

        let plain_client = ResilientClient::from_config(None, &retry_config);
        let tls_client = self.tls_context.as_ref().map(|ctx| {
            ResilientClient::from_config(
                Some(ctx.http_client().clone()),
                &retry_config,
            )
        });

        Ok(RegistrarClient {
            registrar_ip,
            registrar_port,
            registrar_tls_port: self.registrar_tls_port.unwrap_or(registrar_port),
            api_version: ApiVersion::current(),
            plain_client,
            tls_client,
            tls_context: self.tls_context,
            timeout: self
                .timeout
                .filter(|t| *t > 0)
                .map(Duration::from_millis),
        })
    }
}

/// Severity used when a rejection is reported
#[derive(Clone, Copy, Debug)]
enum Severity {
    Error,
    Warning,
}

#[derive(Clone, Debug)]
pub struct RegistrarClient {
    registrar_ip: String,
    registrar_port: u16,
    registrar_tls_port: u16,
    api_version: ApiVersion,
    plain_client: ResilientClient,
    tls_client: Option<ResilientClient>,
    tls_context: Option<Arc<TlsClientContext>>,
    timeout: Option<Duration>,
}

impl RegistrarClient {
    /// Whether requests go over mutual TLS
    pub fn uses_tls(&self) -> bool {
        self.tls_client.is_some()
    }

    fn agent_url(&self, tls: bool, agent_id: &str, action: &str) -> String {
        let (scheme, port) = if tls {
            ("https", self.registrar_tls_port)
        } else {
            ("http", self.registrar_port)
        };
        format!(
            "{scheme}://{}:{port}/{}/agents/{agent_id}{action}",
            self.registrar_ip,
            self.api_version.prefix()
        )
    }

    /// Client and URL for the operations allowed on either listener
    fn open_endpoint(
        &self,
        agent_id: &str,
        action: &str,
    ) -> (&ResilientClient, String) {
        match self.tls_client {
            Some(ref c) => (c, self.agent_url(true, agent_id, action)),
            None => (&self.plain_client, self.agent_url(false, agent_id, action)),
        }
    }

    /// Client and URL for the operations only served over mutual TLS
    fn tls_endpoint(
        &self,
        agent_id: &str,
    ) -> Result<(&ResilientClient, String), RegistrarClientError> {
        let authenticated = self
            .tls_context
            .as_ref()
            .map(|ctx| ctx.requires_peer_cert())
            .unwrap_or(false);

        match self.tls_client {
            Some(ref c) if authenticated => {
                Ok((c, self.agent_url(true, agent_id, "")))
            }
            _ => {
                error!("Refusing to query the registrar for agent {agent_id} without mutual TLS");
                Err(RegistrarClientError::Authorization(agent_id.to_string()))
            }
        }
    }

    async fn send(
        &self,
        request: reqwest_middleware::RequestBuilder,
    ) -> Result<(u16, Vec<u8>), RegistrarClientError> {
        let request = match self.timeout {
            Some(t) => request.timeout(t),
            None => request,
        };
        let resp = request.send().await?;
        let code = resp.status().as_u16();
        let body = resp.bytes().await?;
        Ok((code, body.to_vec()))
    }

    async fn send_json<B: Serialize>(
        &self,
        client: &ResilientClient,
        method: Method,
        url: &str,
        body: &B,
    ) -> Result<(u16, Vec<u8>), RegistrarClientError> {
        let request = client.send_json(method, url, body)?;
        self.send(request).await
    }

    /// Turn a raw answer into an outcome, parsing the results on success
    fn parse<T: DeserializeOwned>(
        operation: &'static str,
        severity: Severity,
        url: &str,
        code: u16,
        body: &[u8],
    ) -> Result<Outcome<T>, RegistrarClientError> {
        if (200..300).contains(&code) {
            let wrapper: JsonWrapper<T> = serde_json::from_slice(body)
                .map_err(|source| ProtocolError::MalformedResponse {
                    operation,
                    source,
                })?;
            return Ok(Outcome::Accepted(wrapper.results));
        }

        let text = String::from_utf8_lossy(body).to_string();
        let status = serde_json::from_slice::<JsonWrapper<Value>>(body)
            .map(|w| w.status)
            .unwrap_or_else(|_| reason_phrase(code));

        match severity {
            Severity::Error => error!(
                "Registrar {operation} at {url} failed with {code}: {text}"
            ),
            Severity::Warning => warn!(
                "Registrar {operation} at {url} failed with {code}: {text}"
            ),
        }

        Ok(Outcome::Rejected(Rejection {
            code,
            status,
            body: text,
        }))
    }

    /// Register the agent and receive the challenge blob, encrypted to
    /// the EK
    pub async fn register_agent(
        &self,
        identity: &AgentIdentity,
    ) -> Result<Outcome<Vec<u8>>, RegistrarClientError> {
        let (client, addr) = self.open_endpoint(&identity.agent_id, "");
        let data = identity.to_request();

        info!(
            "Requesting agent registration from {} for {}",
            &addr, &identity.agent_id
        );

        let (code, body) =
            self.send_json(client, Method::POST, &addr, &data).await?;
        let outcome: Outcome<RegisterResults> =
            Self::parse("registration", Severity::Error, &addr, code, &body)?;

        if outcome.is_accepted() {
            info!("Agent {} registered", identity.agent_id);
        }
        Ok(outcome.map(|r| r.blob))
    }

    /// Query the identity stored for the agent. Only allowed over mutual TLS
    pub async fn fetch_identity(
        &self,
        agent_id: &str,
    ) -> Result<Outcome<AgentInfo>, RegistrarClientError> {
        let (client, addr) = self.tls_endpoint(agent_id)?;

        debug!("Requesting identity of agent {agent_id} from {addr}");

        let (code, body) =
            self.send(client.request(Method::GET, &addr)).await?;
        Self::parse("identity query", Severity::Error, &addr, code, &body)
    }

    /// Fetch only the AIK of the agent
    pub async fn get_aik(
        &self,
        agent_id: &str,
    ) -> Result<Outcome<String>, RegistrarClientError> {
        match self.fetch_identity(agent_id).await? {
            Outcome::Accepted(info) => {
                if info.aik.is_empty() {
                    return Err(ProtocolError::MissingAik(
                        agent_id.to_string(),
                    )
                    .into());
                }
                Ok(Outcome::Accepted(info.aik))
            }
            Outcome::Rejected(r) => Ok(Outcome::Rejected(r)),
        }
    }

    /// Fetch the AIK, going through the cache
    pub async fn get_aik_cached(
        &self,
        cache: &mut AikCache,
        agent_id: &str,
    ) -> Result<Outcome<String>, RegistrarClientError> {
        if let Some(aik) = cache.lookup(agent_id) {
            return Ok(Outcome::Accepted(aik));
        }

        let outcome = self.get_aik(agent_id).await?;
        if let Outcome::Accepted(ref aik) = outcome {
            cache.store(agent_id, aik.clone());
        }
        Ok(outcome)
    }

    /// Prove possession of the secret recovered from the challenge blob
    pub async fn activate_agent(
        &self,
        agent_id: &str,
        recovered_secret: &[u8],
    ) -> Result<Outcome<()>, RegistrarClientError> {
        let tag = AuthTag::compute(recovered_secret, agent_id)?;
        let data = ActivateRequest {
            auth_tag: tag.to_hex(),
        };
        let (client, addr) = self.open_endpoint(agent_id, "/activate");

        info!("Requesting activation of agent {agent_id} from {addr}");

        let (code, body) =
            self.send_json(client, Method::PUT, &addr, &data).await?;
        let outcome: Outcome<EmptyResults> =
            Self::parse("activation", Severity::Error, &addr, code, &body)?;

        if outcome.is_accepted() {
            info!("Agent {agent_id} activated");
        }
        Ok(outcome.map(|_| ()))
    }

    /// Activate a virtual agent with a deep quote
    pub async fn activate_virtual_agent(
        &self,
        agent_id: &str,
        deep_quote: &str,
    ) -> Result<Outcome<()>, RegistrarClientError> {
        let data = VirtualActivateRequest {
            deepquote: deep_quote.to_string(),
        };
        let (client, addr) = self.open_endpoint(agent_id, "/vactivate");

        info!("Requesting virtual activation of agent {agent_id} from {addr}");

        let (code, body) =
            self.send_json(client, Method::PUT, &addr, &data).await?;
        let outcome: Outcome<EmptyResults> = Self::parse(
            "virtual activation",
            Severity::Error,
            &addr,
            code,
            &body,
        )?;

        if outcome.is_accepted() {
            info!("Virtual agent {agent_id} activated");
        }
        Ok(outcome.map(|_| ()))
    }

    /// Remove the agent from the registrar
    pub async fn delete_agent(
        &self,
        agent_id: &str,
    ) -> Result<Outcome<()>, RegistrarClientError> {
        let (client, addr) = self.tls_endpoint(agent_id)?;

        info!("Requesting deletion of agent {agent_id} from {addr}");

        let (code, body) =
            self.send(client.request(Method::DELETE, &addr)).await?;
        let outcome: Outcome<EmptyResults> =
            Self::parse("deletion", Severity::Warning, &addr, code, &body)?;
        Ok(outcome.map(|_| ()))
    }
}

#[derive(Debug)]
struct CachedAik {
    aik: String,
    uses: u32,
}

/// AIKs already fetched from the registrar
///
/// An entry is served at most `MAX_STALE_REGISTRAR_CACHE` times before it
/// is dropped and the registrar is asked again.
#[derive(Debug, Default)]
pub struct AikCache {
    entries: HashMap<String, CachedAik>,
}

impl AikCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached AIK for the agent, or None if a fetch is needed
    pub fn lookup(&mut self, agent_id: &str) -> Option<String> {
        let stale = match self.entries.get_mut(agent_id) {
            Some(entry) if entry.uses < MAX_STALE_REGISTRAR_CACHE => {
                entry.uses += 1;
                return Some(entry.aik.clone());
            }
            Some(_) => true,
            None => false,
        };

        if stale {
            debug!("Cached AIK for agent {agent_id} is stale");
            let _ = self.entries.remove(agent_id);
        }
        None
    }

    pub fn store(&mut self, agent_id: &str, aik: String) {
        let _ = self
            .entries
            .insert(agent_id.to_string(), CachedAik { aik, uses: 0 });
    }

    pub fn invalidate(&mut self, agent_id: &str) {
        let _ = self.entries.remove(agent_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
