// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

//! Registration records and the activation state machine
//!
//! An agent moves from Unregistered to Registered when it submits its
//! identity, and from Registered to Activated once it proves it recovered
//! the challenge secret. Deleting the record returns it to Unregistered.
//!
//! Every operation works on a copy of the stored record and writes it back
//! only when it succeeds, so a failed request leaves the last committed
//! record in place.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use log::*;
use openssl::hash::{hash, MessageDigest};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tpmreg::{
    agent_identity::AgentIdentity,
    bootstrap::BOOTSTRAP_KEY_SIZE,
    crypto::{self, auth_tag::AuthTag, symmkey::SymmKey},
    structures::{AgentInfo, RegisterRequest},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AgentState {
    Registered,
    Activated,
}

/// A pending activation challenge: the blob sent to the agent and the
/// secret it encrypts
#[derive(Clone, Debug)]
pub(crate) struct Challenge {
    pub blob: Vec<u8>,
    secret: SymmKey,
}

#[derive(Clone, Debug)]
pub(crate) struct RegistrationRecord {
    pub identity: AgentIdentity,
    pub state: AgentState,
    pub challenge: Option<Challenge>,
    pub created_at: DateTime<Utc>,
    pub regcount: u32,
}

impl RegistrationRecord {
    fn info(&self) -> AgentInfo {
        self.identity
            .to_info(self.state == AgentState::Activated, self.regcount)
    }

    /// The live challenge, if the record is waiting for activation
    fn pending_challenge(&self) -> Result<&Challenge> {
        match (self.state, &self.challenge) {
            (AgentState::Registered, Some(c)) => Ok(c),
            _ => Err(Error::NoPendingChallenge(
                self.identity.agent_id.clone(),
            )),
        }
    }
}

/// Storage for registration records
pub(crate) trait RecordStore: Send + Sync {
    fn load(&self, agent_id: &str) -> Result<Option<RegistrationRecord>>;
    fn save(&self, record: RegistrationRecord) -> Result<()>;
    /// Returns whether a record was removed
    fn remove(&self, agent_id: &str) -> Result<bool>;
}

#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    records: Mutex<HashMap<String, RegistrationRecord>>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn load(&self, agent_id: &str) -> Result<Option<RegistrationRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| Error::Store("record map poisoned".into()))?;
        Ok(records.get(agent_id).cloned())
    }

    fn save(&self, record: RegistrationRecord) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| Error::Store("record map poisoned".into()))?;
        let _ = records.insert(record.identity.agent_id.clone(), record);
        Ok(())
    }

    fn remove(&self, agent_id: &str) -> Result<bool> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| Error::Store("record map poisoned".into()))?;
        Ok(records.remove(agent_id).is_some())
    }
}

/// Everything a deep quote has to be checked against
#[derive(Debug)]
pub(crate) struct DeepQuoteCheck<'a> {
    pub agent_id: &'a str,
    pub deep_quote: &'a str,
    /// `hex(sha1(U))`
    pub nonce: String,
    /// `agent_id || aik || ek`
    pub data: String,
    pub aik: &'a str,
}

pub(crate) trait DeepQuoteVerifier: Send + Sync {
    fn check_deep_quote(&self, check: &DeepQuoteCheck<'_>) -> bool;
}

/// Verifier used when no quote checking backend is configured. Rejects
/// every deep quote.
#[derive(Debug, Default)]
pub(crate) struct NoDeepQuoteSupport;

impl DeepQuoteVerifier for NoDeepQuoteSupport {
    fn check_deep_quote(&self, check: &DeepQuoteCheck<'_>) -> bool {
        debug!(
            "Deep quote of {} bytes for agent {} bound to nonce {}, {} bytes of data and AIK {}",
            check.deep_quote.len(),
            check.agent_id,
            check.nonce,
            check.data.len(),
            check.aik
        );
        warn!(
            "No deep quote verifier configured, rejecting virtual activation of agent {}",
            check.agent_id
        );
        false
    }
}

pub(crate) struct Registrar {
    store: Box<dyn RecordStore>,
    verifier: Box<dyn DeepQuoteVerifier>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Registrar {
    pub(crate) fn new(
        store: Box<dyn RecordStore>,
        verifier: Box<dyn DeepQuoteVerifier>,
    ) -> Self {
        Registrar {
            store,
            verifier,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn agent_lock(&self, agent_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| Error::Poisoned(agent_id.to_string()))?;
        Ok(locks.entry(agent_id.to_string()).or_default().clone())
    }

    /// Drop the lock entry of the agent once nobody else holds or waits on
    /// it. Clones are only taken under the map lock, so the count is exact.
    fn release_lock(&self, agent_id: &str, lock: &Arc<Mutex<()>>) {
        let Ok(mut locks) = self.locks.lock() else {
            return;
        };
        let unused = locks.get(agent_id).is_some_and(|held| {
            Arc::ptr_eq(held, lock) && Arc::strong_count(held) == 2
        });
        if unused {
            let _ = locks.remove(agent_id);
        }
    }

    /// Run `f` while holding the lock of the agent
    fn with_agent<T>(
        &self,
        agent_id: &str,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let lock = self.agent_lock(agent_id)?;
        let result = match lock.lock() {
            Ok(_guard) => f(),
            Err(_) => Err(Error::Poisoned(agent_id.to_string())),
        };
        self.release_lock(agent_id, &lock);
        result
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(usize::MAX)
    }

    fn load_existing(&self, agent_id: &str) -> Result<RegistrationRecord> {
        self.store
            .load(agent_id)?
            .ok_or_else(|| Error::NotFound(agent_id.to_string()))
    }

    /// Store the identity and return a fresh challenge blob encrypted to
    /// the EK. Any previous record of the agent is replaced.
    pub(crate) fn register(
        &self,
        agent_id: &str,
        request: RegisterRequest,
    ) -> Result<Vec<u8>> {
        let identity = AgentIdentity::from_request(agent_id, request)?;
        let ek = crypto::rsa_import_pubkey(&identity.public_ek).map_err(
            |source| Error::InvalidEk {
                agent_id: agent_id.to_string(),
                source,
            },
        )?;

        self.with_agent(agent_id, || {
            let prior = self.store.load(agent_id)?;
            if let Some(ref p) = prior {
                info!(
                    "Agent {agent_id} re-registering, previous registration from {}",
                    p.created_at
                );
            }

            let secret = SymmKey::generate(BOOTSTRAP_KEY_SIZE)?;
            let blob = crypto::rsa_encrypt(&ek, secret.as_ref())?;

            let regcount = prior
                .map(|p| p.regcount)
                .unwrap_or(0)
                .saturating_add(1);

            self.store.save(RegistrationRecord {
                identity,
                state: AgentState::Registered,
                challenge: Some(Challenge {
                    blob: blob.clone(),
                    secret,
                }),
                created_at: Utc::now(),
                regcount,
            })?;

            info!("Agent {agent_id} registered, registration count {regcount}");
            Ok(blob)
        })
    }

    /// Check the proof of possession of the challenge secret
    pub(crate) fn activate(&self, agent_id: &str, auth_tag: &str) -> Result<()> {
        self.with_agent(agent_id, || {
            let mut record = self.load_existing(agent_id)?;
            let challenge = record.pending_challenge()?;
            debug!(
                "Checking auth tag of agent {agent_id} against a challenge of {} bytes",
                challenge.blob.len()
            );

            let tag = AuthTag::from_hex(auth_tag)
                .map_err(|_| Error::InvalidAuthTag(agent_id.to_string()))?;
            let expected = AuthTag::compute(challenge.secret.as_ref(), agent_id)?;
            if !expected.matches(&tag) {
                warn!("Auth tag for agent {agent_id} does not match the expected value");
                return Err(Error::InvalidAuthTag(agent_id.to_string()));
            }

            record.state = AgentState::Activated;
            record.challenge = None;
            self.store.save(record)?;

            info!("Agent {agent_id} activated");
            Ok(())
        })
    }

    /// Activate an agent whose TPM is virtual, using a deep quote
    pub(crate) fn activate_virtual(
        &self,
        agent_id: &str,
        deep_quote: &str,
    ) -> Result<()> {
        self.with_agent(agent_id, || {
            let mut record = self.load_existing(agent_id)?;
            let challenge = record.pending_challenge()?;

            let digest =
                hash(MessageDigest::sha1(), challenge.secret.as_ref())?;
            let check = DeepQuoteCheck {
                agent_id,
                deep_quote,
                nonce: hex::encode(&*digest),
                data: format!(
                    "{agent_id}{}{}",
                    record.identity.public_aik, record.identity.public_ek
                ),
                aik: &record.identity.public_aik,
            };

            if !self.verifier.check_deep_quote(&check) {
                return Err(Error::DeepQuoteRejected(agent_id.to_string()));
            }

            record.state = AgentState::Activated;
            record.challenge = None;
            self.store.save(record)?;

            info!("Virtual agent {agent_id} activated");
            Ok(())
        })
    }

    pub(crate) fn get(&self, agent_id: &str) -> Result<AgentInfo> {
        self.with_agent(agent_id, || {
            let record = self.load_existing(agent_id)?;
            Ok(record.info())
        })
    }

    pub(crate) fn delete(&self, agent_id: &str) -> Result<()> {
        self.with_agent(agent_id, || {
            if !self.store.remove(agent_id)? {
                return Err(Error::NotFound(agent_id.to_string()));
            }
            info!("Agent {agent_id} deleted");
            Ok(())
        })
    }
}
