// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

//! # tpmreg_agent
//!
//! Command line driver for the agent side of the registration protocol.
//! It registers an identity with a tpmreg registrar, recovers the
//! challenge secret and activates the agent.

#![deny(
    nonstandard_style,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    while_true,
    trivial_casts,
    trivial_numeric_casts,
    unused_allocation,
    unused_comparisons,
    unused_parens,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results
)]

mod commands;
mod error;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use commands::IdentitySource;
use log::*;
use serde_json::Value;
use std::{path::PathBuf, process};
use tpmreg::{bootstrap::SoftwareRecovery, config, crypto};

/// Register and activate agent identities with a tpmreg registrar
#[derive(Parser, Debug)]
#[command(
    name = "tpmreg_agent",
    version,
    about = "Register and activate agent identities with a tpmreg registrar",
    after_long_help = "CONFIGURATION SOURCES (highest to lowest priority):\n  \
        1. Command-line arguments (--registrar-ip, --registrar-port, ...)\n  \
        2. Environment variables (TPMREG_REGISTRAR_CLIENT__REGISTRAR_IP, ...)\n  \
        3. Configuration files (/etc/tpmreg/tpmreg.conf and snippets)\n  \
        4. Built-in defaults"
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Registrar IP address [default: 127.0.0.1]
    #[arg(long, value_name = "IP")]
    registrar_ip: Option<String>,

    /// Registrar plain port [default: 8890]
    #[arg(long, value_name = "PORT")]
    registrar_port: Option<u16>,

    /// Registrar mutual TLS port [default: 8891]
    #[arg(long, value_name = "PORT")]
    registrar_tls_port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Register the agent identity and print the challenge blob
    Register {
        #[command(flatten)]
        identity: IdentityArgs,

        /// Public EK file (PEM)
        #[arg(long, value_name = "FILE")]
        ek: PathBuf,
    },
    /// Answer the challenge blob received on registration
    Activate {
        /// Agent identifier
        agent_id: String,

        /// Challenge blob, base64 encoded
        #[arg(long)]
        blob: String,

        #[command(flatten)]
        key: EkKeyArgs,
    },
    /// Activate a virtual agent with a deep quote
    Vactivate {
        /// Agent identifier
        agent_id: String,

        /// File holding the deep quote
        #[arg(long, value_name = "FILE")]
        deepquote_file: PathBuf,
    },
    /// Register and activate in one go, using a software EK
    Bootstrap {
        #[command(flatten)]
        identity: IdentityArgs,

        #[command(flatten)]
        key: EkKeyArgs,
    },
    /// Show the identity the registrar holds for the agent (mutual TLS)
    Status {
        /// Agent identifier
        agent_id: String,
    },
    /// Print the AIK the registrar holds for the agent (mutual TLS)
    Aik {
        /// Agent identifier
        agent_id: String,
    },
    /// Remove the agent from the registrar (mutual TLS)
    Delete {
        /// Agent identifier
        agent_id: String,
    },
}

#[derive(Args, Debug)]
struct IdentityArgs {
    /// Agent identifier, a random UUID when not given
    #[arg(long)]
    agent_id: Option<String>,

    /// Public AIK file
    #[arg(long, value_name = "FILE")]
    aik: PathBuf,

    /// TPM name of the AIK
    #[arg(long)]
    aik_name: Option<String>,

    /// EK certificate file (DER)
    #[arg(long, value_name = "FILE")]
    ek_cert: Option<PathBuf>,

    /// TPM version of the agent
    #[arg(long, default_value_t = 2)]
    tpm_version: u8,
}

impl IdentityArgs {
    fn source(&self) -> IdentitySource<'_> {
        IdentitySource {
            agent_id: self.agent_id.as_deref(),
            aik: &self.aik,
            aik_name: self.aik_name.as_deref(),
            ek_cert: self.ek_cert.as_deref(),
            tpm_version: self.tpm_version,
        }
    }
}

#[derive(Args, Debug)]
struct EkKeyArgs {
    /// EK private key file (PEM)
    #[arg(long, value_name = "FILE")]
    ek_key: PathBuf,

    /// Password protecting the EK private key
    #[arg(long)]
    ek_key_password: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(out) => println!("{out}"),
            Err(e) => {
                error!("Failed to format output: {e}");
                process::exit(1);
            }
        },
        Err(e) => {
            error!("{e:#}");
            process::exit(1);
        }
    }
}

fn load_config(cli: &Cli) -> Result<config::TpmregConfig> {
    let mut config = config::load_config(cli.config.as_deref())
        .context("Failed to load configuration")?;

    let section = &mut config.registrar_client;
    if let Some(ip) = &cli.registrar_ip {
        section.registrar_ip.clone_from(ip);
    }
    if let Some(port) = cli.registrar_port {
        section.registrar_port = port;
    }
    if let Some(port) = cli.registrar_tls_port {
        section.registrar_tls_port = port;
    }

    debug!(
        "Using registrar at {}:{} (TLS port {})",
        section.registrar_ip,
        section.registrar_port,
        section.registrar_tls_port
    );
    Ok(config)
}

async fn run(cli: Cli) -> Result<Value> {
    let config = load_config(&cli)?;
    let client = commands::registrar_client(&config)
        .context("Failed to set up the registrar client")?;

    let value = match &cli.command {
        Commands::Register { identity, ek } => {
            let public_ek = commands::read_text(ek)?;
            let identity =
                commands::load_identity(&identity.source(), &public_ek)?;
            commands::register(&client, &identity).await?
        }
        Commands::Activate {
            agent_id,
            blob,
            key,
        } => {
            let recovery = SoftwareRecovery::from_key_file(
                &key.ek_key,
                key.ek_key_password.as_deref(),
            )
            .context("Failed to load the EK private key")?;
            commands::activate(&client, agent_id, blob, &recovery).await?
        }
        Commands::Vactivate {
            agent_id,
            deepquote_file,
        } => {
            commands::activate_virtual(&client, agent_id, deepquote_file)
                .await?
        }
        Commands::Bootstrap { identity, key } => {
            let (ek_pub, ek_priv) = crypto::load_key_pair(
                &key.ek_key,
                key.ek_key_password.as_deref(),
            )
            .context("Failed to load the EK private key")?;
            let public_ek = crypto::rsa_export_pubkey(&ek_pub)?;
            let identity =
                commands::load_identity(&identity.source(), &public_ek)?;
            commands::bootstrap(
                &client,
                &identity,
                &SoftwareRecovery::new(ek_priv),
            )
            .await?
        }
        Commands::Status { agent_id } => {
            commands::status(&client, agent_id).await?
        }
        Commands::Aik { agent_id } => commands::aik(&client, agent_id).await?,
        Commands::Delete { agent_id } => {
            commands::delete(&client, agent_id).await?
        }
    };

    Ok(value)
}

/// Initialize logging based on the number of `-v` flags. Logs go to stderr
/// so stdout only carries the JSON result.
fn init_logging(verbose: u8) {
    let log_level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    pretty_env_logger::formatted_builder()
        .filter_level(log_level)
        .target(pretty_env_logger::env_logger::Target::Stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register() {
        let cli = Cli::try_parse_from([
            "tpmreg_agent",
            "-vv",
            "--registrar-ip",
            "10.0.0.1",
            "register",
            "--aik",
            "aik.pem",
            "--ek",
            "ek.pem",
        ])
        .unwrap(); //#[allow_ci]

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.registrar_ip.as_deref(), Some("10.0.0.1"));
        match cli.command {
            Commands::Register { identity, ek } => {
                assert_eq!(ek, PathBuf::from("ek.pem"));
                assert_eq!(identity.tpm_version, 2);
                assert!(identity.agent_id.is_none());
                assert!(identity.ek_cert.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_bootstrap() {
        let cli = Cli::try_parse_from([
            "tpmreg_agent",
            "bootstrap",
            "--agent-id",
            "agent",
            "--aik",
            "aik.pem",
            "--ek-key",
            "ek-private.pem",
            "--ek-key-password",
            "secret",
            "--tpm-version",
            "1",
        ])
        .unwrap(); //#[allow_ci]

        match cli.command {
            Commands::Bootstrap { identity, key } => {
                assert_eq!(identity.agent_id.as_deref(), Some("agent"));
                assert_eq!(identity.tpm_version, 1);
                assert_eq!(key.ek_key_password.as_deref(), Some("secret"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_aik() {
        let cli =
            Cli::try_parse_from(["tpmreg_agent", "aik", "agent"]).unwrap(); //#[allow_ci]
        assert!(
            matches!(cli.command, Commands::Aik { agent_id } if agent_id == "agent")
        );
    }

    #[test]
    fn test_parse_errors() {
        // The activate command needs the blob and the EK key
        assert!(
            Cli::try_parse_from(["tpmreg_agent", "activate", "agent"]).is_err()
        );
        // A subcommand is required
        assert!(Cli::try_parse_from(["tpmreg_agent"]).is_err());
        assert!(Cli::try_parse_from([
            "tpmreg_agent",
            "--registrar-port",
            "notaport",
            "status",
            "agent"
        ])
        .is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let dir = tempfile::tempdir().unwrap(); //#[allow_ci]
        let path = dir.path().join("tpmreg.conf");
        std::fs::write(
            &path,
            "[registrar_client]\nregistrar_ip = \"192.168.1.10\"\nregistrar_port = 9000\n",
        )
        .unwrap(); //#[allow_ci]

        let cli = Cli::try_parse_from([
            "tpmreg_agent",
            "-c",
            path.to_str().unwrap(), //#[allow_ci]
            "--registrar-tls-port",
            "9443",
            "status",
            "agent",
        ])
        .unwrap(); //#[allow_ci]

        let config = load_config(&cli).unwrap(); //#[allow_ci]
        assert_eq!(config.registrar_client.registrar_ip, "192.168.1.10");
        assert_eq!(config.registrar_client.registrar_port, 9000);
        assert_eq!(config.registrar_client.registrar_tls_port, 9443);

        let cli = Cli::try_parse_from([
            "tpmreg_agent",
            "-c",
            dir.path().join("missing.conf").to_str().unwrap(), //#[allow_ci]
            "status",
            "agent",
        ])
        .unwrap(); //#[allow_ci]
        assert!(load_config(&cli).is_err());
    }
}
