// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors
use crate::config::TpmregConfigError;
use config::{ConfigError, Environment, Map, Source, Value};
use log::*;

pub static ENV_PREFIX: &str = "TPMREG";

/// Configuration overrides taken from `TPMREG_<SECTION>__<OPTION>`
/// environment variables
#[derive(Clone, Debug)]
pub struct EnvConfig {
    map: Map<String, Value>,
}

fn environment(source: Option<Map<String, String>>) -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .source(source)
}

impl EnvConfig {
    pub fn new() -> Result<Self, TpmregConfigError> {
        Self::from_source(None)
    }

    /// Collect the overrides from the given variables instead of the
    /// process environment
    pub(crate) fn from_source(
        source: Option<Map<String, String>>,
    ) -> Result<Self, TpmregConfigError> {
        let map = environment(source).collect()?;

        // Log debug message for configuration obtained from environment.
        // Values are left out, they may hold key passwords.
        map.keys()
            .for_each(|c| debug!("Environment configuration override: {c}"));

        Ok(EnvConfig { map })
    }
}

impl Source for EnvConfig {
    fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
        Ok(self.map.clone())
    }

    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }
}
