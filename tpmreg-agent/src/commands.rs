// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

use crate::error::{Error, Result};
use base64::{engine::general_purpose, Engine as _};
use log::*;
use serde_json::{json, Value};
use std::path::Path;
use tpmreg::{
    agent_identity::{AgentIdentity, AgentIdentityBuilder},
    bootstrap::SecretRecovery,
    config::TpmregConfig,
    registrar_client::{Outcome, RegistrarClient, RegistrarClientBuilder},
    resilient_client::RetryConfig,
    tls,
};

/// Where the parts of an agent identity are read from
#[derive(Debug, Clone)]
pub(crate) struct IdentitySource<'a> {
    pub agent_id: Option<&'a str>,
    pub aik: &'a Path,
    pub aik_name: Option<&'a str>,
    pub ek_cert: Option<&'a Path>,
    pub tpm_version: u8,
}

pub(crate) fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| Error::Read {
        path: path.display().to_string(),
        source,
    })
}

pub(crate) fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Build the identity to register. A random UUID is used when no agent ID
/// is given.
pub(crate) fn load_identity(
    source: &IdentitySource<'_>,
    public_ek: &str,
) -> Result<AgentIdentity> {
    let generated;
    let agent_id = match source.agent_id {
        Some(id) => id,
        None => {
            generated = uuid::Uuid::new_v4().to_string();
            info!("No agent ID given, using {generated}");
            &generated
        }
    };

    let aik = read_text(source.aik)?;

    let mut builder = AgentIdentityBuilder::new()
        .agent_id(agent_id)
        .public_ek(public_ek)
        .public_aik(&aik)
        .tpm_version(source.tpm_version);

    if let Some(name) = source.aik_name {
        builder = builder.aik_name(name.to_string());
    }
    if let Some(path) = source.ek_cert {
        builder = builder.ek_cert(read_file(path)?);
    }

    Ok(builder.build()?)
}

/// Registrar client from the configuration, going over mutual TLS when it
/// is enabled
pub(crate) fn registrar_client(
    config: &TpmregConfig,
) -> Result<RegistrarClient> {
    let section = &config.registrar_client;
    let ctx = tls::init_client_tls(config)?;

    let retry = (section.max_retries > 0).then(|| RetryConfig {
        max_retries: section.max_retries,
        initial_delay_ms: section.retry_initial_delay_ms,
        max_delay_ms: None,
    });

    let mut builder = RegistrarClientBuilder::new()
        .registrar_address(section.registrar_ip.clone())
        .registrar_port(section.registrar_port)
        .registrar_tls_port(section.registrar_tls_port)
        .retry_config(retry)
        .tls_context(ctx);

    if section.timeout_ms > 0 {
        builder = builder.timeout(section.timeout_ms);
    }

    Ok(builder.build()?)
}

fn accepted<T>(operation: &'static str, outcome: Outcome<T>) -> Result<T> {
    match outcome {
        Outcome::Accepted(v) => Ok(v),
        Outcome::Rejected(r) => Err(Error::Rejected {
            operation,
            code: r.code,
            status: r.status,
        }),
    }
}

pub(crate) async fn register(
    client: &RegistrarClient,
    identity: &AgentIdentity,
) -> Result<Value> {
    let blob =
        accepted("registration", client.register_agent(identity).await?)?;

    Ok(json!({
        "agent_id": identity.agent_id,
        "blob": general_purpose::STANDARD.encode(blob),
    }))
}

pub(crate) async fn activate<R: SecretRecovery>(
    client: &RegistrarClient,
    agent_id: &str,
    blob: &str,
    recovery: &R,
) -> Result<Value> {
    let blob = general_purpose::STANDARD.decode(blob)?;
    let secret = recovery.recover_secret(&blob)?;

    accepted(
        "activation",
        client.activate_agent(agent_id, &secret).await?,
    )?;

    Ok(json!({"agent_id": agent_id, "active": true}))
}

pub(crate) async fn activate_virtual(
    client: &RegistrarClient,
    agent_id: &str,
    deep_quote_file: &Path,
) -> Result<Value> {
    let deep_quote = read_text(deep_quote_file)?;

    accepted(
        "virtual activation",
        client
            .activate_virtual_agent(agent_id, deep_quote.trim())
            .await?,
    )?;

    Ok(json!({"agent_id": agent_id, "active": true}))
}

/// Register, recover the challenge secret and activate in one go
pub(crate) async fn bootstrap<R: SecretRecovery>(
    client: &RegistrarClient,
    identity: &AgentIdentity,
    recovery: &R,
) -> Result<Value> {
    let agent_id = identity.agent_id.as_str();

    let blob =
        accepted("registration", client.register_agent(identity).await?)?;
    info!("Agent {agent_id} registered, recovering the challenge secret");

    let secret = recovery.recover_secret(&blob)?;
    accepted(
        "activation",
        client.activate_agent(agent_id, &secret).await?,
    )?;

    Ok(json!({"agent_id": agent_id, "active": true}))
}

pub(crate) async fn status(
    client: &RegistrarClient,
    agent_id: &str,
) -> Result<Value> {
    let info =
        accepted("identity query", client.fetch_identity(agent_id).await?)?;
    Ok(serde_json::to_value(info)?)
}

/// Only the AIK of the agent, checked to be present
pub(crate) async fn aik(
    client: &RegistrarClient,
    agent_id: &str,
) -> Result<Value> {
    let aik = accepted("AIK query", client.get_aik(agent_id).await?)?;
    Ok(json!({"agent_id": agent_id, "aik": aik}))
}

pub(crate) async fn delete(
    client: &RegistrarClient,
    agent_id: &str,
) -> Result<Value> {
    accepted("deletion", client.delete_agent(agent_id).await?)?;
    Ok(json!({"agent_id": agent_id, "deleted": true}))
}
