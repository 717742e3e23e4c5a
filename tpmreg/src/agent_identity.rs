// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

use crate::structures::{AgentInfo, RegisterRequest};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentIdentityBuilderError {
    /// Agent ID not set
    #[error("Agent ID not set")]
    AgentIDNotSet,

    /// Agent public AIK not set
    #[error("Agent public AIK not set")]
    AIKPubNotSet,

    /// Agent public EK not set
    #[error("Agent public EK not set")]
    EKPubNotSet,

    /// Only TPM 1.2 and TPM 2.0 agents are known
    #[error("Invalid TPM version {0}, expected 1 or 2")]
    InvalidTPMVersion(u8),
}

/// Builder for the public identity an agent submits on registration
///
/// The TPM version defaults to 2.
#[derive(Debug, Default)]
pub struct AgentIdentityBuilder<'a> {
    agent_id: Option<&'a str>,
    aik_name: Option<String>,
    ek_cert: Option<Vec<u8>>,
    ek_wrapped_blob: Option<String>,
    public_aik: Option<&'a str>,
    public_ek: Option<&'a str>,
    tpm_version: Option<u8>,
}

impl<'a> AgentIdentityBuilder<'a> {
    /// Create a new AgentIdentityBuilder object
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the agent ID
    ///
    /// # Arguments:
    ///
    /// * agent_id (&'a str): The agent identifier, usually a UUID
    pub fn agent_id(mut self, agent_id: &'a str) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    /// Set the TPM name of the AIK
    pub fn aik_name(mut self, aik_name: String) -> Self {
        self.aik_name = Some(aik_name);
        self
    }

    /// Set the EK certificate
    ///
    /// # Arguments:
    ///
    /// * ek_cert (Vec<u8>): The DER encoded certificate
    pub fn ek_cert(mut self, ek_cert: Vec<u8>) -> Self {
        self.ek_cert = Some(ek_cert);
        self
    }

    /// Set the TPM specific EK data, sent as `ek_tpm`
    pub fn ek_wrapped_blob(mut self, blob: String) -> Self {
        self.ek_wrapped_blob = Some(blob);
        self
    }

    /// Set the public Attestation Identity Key (AIK)
    pub fn public_aik(mut self, public_aik: &'a str) -> Self {
        self.public_aik = Some(public_aik);
        self
    }

    /// Set the public Endorsement Key (EK)
    ///
    /// # Arguments:
    ///
    /// * public_ek (&'a str): The public EK in PEM format
    pub fn public_ek(mut self, public_ek: &'a str) -> Self {
        self.public_ek = Some(public_ek);
        self
    }

    pub fn tpm_version(mut self, tpm_version: u8) -> Self {
        self.tpm_version = Some(tpm_version);
        self
    }

    /// Generate the AgentIdentity object using the previously set options
    pub fn build(self) -> Result<AgentIdentity, AgentIdentityBuilderError> {
        let Some(agent_id) = self.agent_id else {
            return Err(AgentIdentityBuilderError::AgentIDNotSet);
        };

        let Some(public_ek) = self.public_ek else {
            return Err(AgentIdentityBuilderError::EKPubNotSet);
        };

        let Some(public_aik) = self.public_aik else {
            return Err(AgentIdentityBuilderError::AIKPubNotSet);
        };

        let tpm_version = self.tpm_version.unwrap_or(2);
        validate_tpm_version(tpm_version)?;

        Ok(AgentIdentity {
            agent_id: agent_id.to_string(),
            aik_name: self.aik_name,
            ek_certificate: self.ek_cert,
            ek_wrapped_blob: self.ek_wrapped_blob,
            public_aik: public_aik.to_string(),
            public_ek: public_ek.to_string(),
            tpm_version,
        })
    }
}

fn validate_tpm_version(v: u8) -> Result<(), AgentIdentityBuilderError> {
    match v {
        1 | 2 => Ok(()),
        other => Err(AgentIdentityBuilderError::InvalidTPMVersion(other)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub aik_name: Option<String>,
    pub ek_certificate: Option<Vec<u8>>,
    pub ek_wrapped_blob: Option<String>,
    pub public_aik: String,
    pub public_ek: String,
    pub tpm_version: u8,
}

impl AgentIdentity {
    /// Rebuild an identity from a registration body received for `agent_id`
    pub fn from_request(
        agent_id: &str,
        req: RegisterRequest,
    ) -> Result<Self, AgentIdentityBuilderError> {
        validate_tpm_version(req.tpm_version)?;
        Ok(AgentIdentity {
            agent_id: agent_id.to_string(),
            aik_name: req.aik_name,
            ek_certificate: req.ekcert,
            ek_wrapped_blob: req.ek_tpm,
            public_aik: req.aik,
            public_ek: req.ek,
            tpm_version: req.tpm_version,
        })
    }

    pub fn to_request(&self) -> RegisterRequest {
        RegisterRequest {
            ek: self.public_ek.clone(),
            ekcert: self.ek_certificate.clone(),
            aik: self.public_aik.clone(),
            aik_name: self.aik_name.clone(),
            ek_tpm: self.ek_wrapped_blob.clone(),
            tpm_version: self.tpm_version,
        }
    }

    /// Public view of a registered identity
    pub fn to_info(&self, active: bool, regcount: u32) -> AgentInfo {
        AgentInfo {
            aik: self.public_aik.clone(),
            ek: self.public_ek.clone(),
            ekcert: self.ek_certificate.clone(),
            aik_name: self.aik_name.clone(),
            ek_tpm: self.ek_wrapped_blob.clone(),
            tpm_version: self.tpm_version,
            active,
            regcount,
        }
    }
}
