// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors
use crate::config::*;
use config::{Config, File, FileFormat};
use glob::glob;
use log::*;
use std::{
    env,
    path::{Path, PathBuf},
};

pub static GLOBAL_CONFIG_OVERRIDE_ENV_VAR: &str = "TPMREG_CONFIG";
pub static DEFAULT_SYS_CONFIG: &str = "/etc/tpmreg/tpmreg.conf";
pub static DEFAULT_SYS_CONFIG_SNIPPETS_DIR: &str = "/etc/tpmreg/tpmreg.conf.d";

// A single file or a directory whose files are all loaded.
#[derive(Debug)]
pub enum ConfigSource {
    File { path: PathBuf, required: bool },
    Directory(PathBuf),
}

/// Layers TOML files over the built-in defaults, then applies the
/// environment overrides
#[derive(Debug, Default)]
pub struct FileConfigBuilder {
    sources: Vec<ConfigSource>,
    skip_env: bool,
}

impl FileConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an optional configuration file. Missing files are skipped.
    pub fn file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.sources.push(ConfigSource::File {
            path: path.into(),
            required: false,
        });
        self
    }

    /// Adds a configuration file that must exist
    pub fn required_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.sources.push(ConfigSource::File {
            path: path.into(),
            required: true,
        });
        self
    }

    /// Adds a directory as a configuration source.
    /// All files within this directory will be loaded through globbing.
    pub fn directory(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.sources.push(ConfigSource::Directory(path.into()));
        self
    }

    /// Load the configuration files from the default locations
    pub fn load_default_locations(&mut self) -> &mut Self {
        self.file(DEFAULT_SYS_CONFIG)
            .directory(DEFAULT_SYS_CONFIG_SNIPPETS_DIR)
    }

    /// Do not apply the `TPMREG_*` environment overrides
    pub fn without_env(&mut self) -> &mut Self {
        self.skip_env = true;
        self
    }

    fn finish(
        &self,
        mut builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<TpmregConfig, TpmregConfigError> {
        if !self.skip_env {
            builder = builder.add_source(EnvConfig::new()?);
        }
        let config: TpmregConfig = builder.build()?.try_deserialize()?;
        debug!("File configuration build process finished.");
        Ok(config)
    }

    /// Consumes the sources and attempts to load the configuration.
    pub fn build(&mut self) -> Result<TpmregConfig, TpmregConfigError> {
        // Use the default config as the base and override with the options from the sources
        let mut builder = Config::builder()
            .add_source(Config::try_from(&TpmregConfig::default())?);

        // If the 'TPMREG_CONFIG' environment variable is set, load the configuration file set
        // and ignore the other files
        if let Ok(env_cfg) = env::var(GLOBAL_CONFIG_OVERRIDE_ENV_VAR) {
            if !env_cfg.is_empty() {
                let path = Path::new(&env_cfg);
                if path.exists() {
                    warn!(
                        "Configuration replaced by {}: {}",
                        GLOBAL_CONFIG_OVERRIDE_ENV_VAR,
                        path.display()
                    );
                    builder = builder.add_source(
                        File::new(&env_cfg, FileFormat::Toml).required(true),
                    );
                    return self.finish(builder);
                } else {
                    warn!("Configuration set in {GLOBAL_CONFIG_OVERRIDE_ENV_VAR} environment variable not found");
                    return Err(TpmregConfigError::MissingEnvConfigFile {
                        file: path.display().to_string(),
                    });
                }
            }
        }

        // Apply the sources in order
        for (index, source) in self.sources.iter().enumerate() {
            match source {
                ConfigSource::File { path, required } => {
                    debug!(
                        "Loading configuration from FILE (#{}): {}",
                        index,
                        path.display()
                    );
                    builder = builder.add_source(
                        File::new(
                            &path.display().to_string(),
                            FileFormat::Toml,
                        )
                        .required(*required),
                    );
                }
                ConfigSource::Directory(path) => {
                    debug!(
                        "Loading configuration from DIRECTORY (#{}): {}",
                        index,
                        path.display()
                    );

                    let mut snippets = glob(&path.join("*").display().to_string())
                        .map_err(TpmregConfigError::GlobPattern)?
                        .filter_map(|entry| entry.ok())
                        .collect::<Vec<_>>();
                    // Snippets are applied in lexical order
                    snippets.sort();

                    builder = builder.add_source(
                        snippets
                            .iter()
                            .map(|path| {
                                File::new(
                                    &path.display().to_string(),
                                    FileFormat::Toml,
                                )
                                .required(false)
                            })
                            .collect::<Vec<_>>(),
                    );
                }
            }
        }

        self.finish(builder)
    }
}

/// Load the configuration from the default locations plus an optional
/// explicit file, which must exist
pub fn load_config(
    explicit: Option<&Path>,
) -> Result<TpmregConfig, TpmregConfigError> {
    let mut builder = FileConfigBuilder::new();
    let _ = builder.load_default_locations();
    if let Some(path) = explicit {
        let _ = builder.required_file(path);
    }
    builder.build()
}
