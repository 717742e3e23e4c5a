// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors
use config::ConfigError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TpmregConfigError {
    // Error from config crate
    #[error("Error from the config crate")]
    Config(#[from] ConfigError),

    // Glob error
    #[error("Glob pattern error")]
    GlobPattern(#[from] glob::PatternError),

    // Invalid value for an option
    #[error("Invalid value '{value}' for option '{option}'")]
    InvalidOption { option: String, value: String },

    // Missing configuration file set in TPMREG_CONFIG
    #[error("Missing file {file} set in 'TPMREG_CONFIG' environment variable")]
    MissingEnvConfigFile { file: String },
}
