// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

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
    missing_copy_implementations,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_allocation,
    unused_comparisons,
    unused_parens,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]

//! The registrar keeps the identities submitted by agents and hands each
//! of them a challenge that only the TPM holding the EK can open.
//!
//! Two listeners are started:
//!
//! * a plain HTTP listener accepting registrations and activations
//! * a mutual TLS listener additionally serving identity queries and
//!   deletions, so the AIK of an agent is never handed to an
//!   unauthenticated client

mod agents_handler;
mod api;
mod error;
mod errors_handler;
mod registrar;

use actix_web::{
    body::MessageBody,
    dev::{Server, Service, ServiceFactory, ServiceRequest, ServiceResponse},
    http, middleware, rt, web, App, HttpServer,
};
use agents_handler::Interface;
use clap::Parser;
use error::{Error, Result};
use futures::future::try_join_all;
use log::*;
use openssl::ssl::SslAcceptorBuilder;
use registrar::{MemoryStore, NoDeepQuoteSupport, Registrar};
use std::{net::TcpListener, path::PathBuf};
use tpmreg::{
    config::{load_config, TpmregConfig},
    crypto,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn build_app(
    registrar: web::Data<Registrar>,
    interface: Interface,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl MessageBody>,
        Error = actix_web::Error,
        InitError = (),
    >,
> {
    App::new()
        .wrap(middleware::ErrorHandlers::new().handler(
            http::StatusCode::NOT_FOUND,
            errors_handler::wrap_404,
        ))
        .wrap(middleware::Logger::new(
            "%r from %a result %s (took %D ms)",
        ))
        .wrap_fn(|req, srv| {
            info!(
                "{} invoked from {:?} with uri {}",
                req.head().method,
                req.connection_info().peer_addr().unwrap_or("unknown"),
                req.uri()
            );
            srv.call(req)
        })
        .app_data(registrar)
        .app_data(
            web::JsonConfig::default()
                .error_handler(errors_handler::json_parser_error),
        )
        .app_data(
            web::PathConfig::default()
                .error_handler(errors_handler::path_parser_error),
        )
        .configure(|cfg| api::configure_api(cfg, interface))
}

/// Server side TLS context requiring client certificates issued by the
/// configured CA
fn server_tls_context(config: &TpmregConfig) -> Result<SslAcceptorBuilder> {
    let (cert_path, key_path, ca_path) =
        config.registrar.tls_paths(&config.general);

    let password = config.registrar.server_key_password.as_str();
    if password == "default" {
        warn!("CAUTION: using default password for the registrar private key, please set server_key_password to a strong password");
    }

    let cert = crypto::load_x509_pem(&cert_path)?;
    let (_, key) = crypto::load_key_pair(&key_path, Some(password))?;
    let ca_certs = crypto::load_x509_pem_chain(&ca_path)?;

    info!(
        "Loaded registrar certificate {} trusting {}",
        cert_path.display(),
        ca_path.display()
    );

    crypto::generate_tls_context(&cert, &key, ca_certs).map_err(Error::from)
}

/// Start the plain listener and, when given, the mutual TLS listener
fn start_servers(
    registrar: web::Data<Registrar>,
    plain: TcpListener,
    tls: Option<(TcpListener, SslAcceptorBuilder)>,
) -> Result<Vec<Server>> {
    let mut servers = Vec::new();

    let data = registrar.clone();
    let plain_addr = plain.local_addr()?;
    servers.push(
        HttpServer::new(move || build_app(data.clone(), Interface::Plain))
            // Disable default signal handlers.  See:
            // https://github.com/actix/actix-web/issues/2739
            // for details.
            .disable_signals()
            .listen(plain)?
            .run(),
    );
    info!("Listening on http://{plain_addr}");

    if let Some((listener, acceptor)) = tls {
        let tls_addr = listener.local_addr()?;
        servers.push(
            HttpServer::new(move || {
                build_app(registrar.clone(), Interface::Tls)
            })
            .disable_signals()
            .listen_openssl(listener, acceptor)?
            .run(),
        );
        info!("Listening on https://{tls_addr}");
    }

    Ok(servers)
}

#[actix_web::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let registrar = web::Data::new(Registrar::new(
        Box::new(MemoryStore::new()),
        Box::new(NoDeepQuoteSupport),
    ));

    let ip = config.registrar.ip.as_str();
    let plain = TcpListener::bind((ip, config.registrar.port))?;

    let tls = if config.general.enable_tls {
        let acceptor = server_tls_context(&config)?;
        let listener = TcpListener::bind((ip, config.registrar.tls_port))?;
        Some((listener, acceptor))
    } else {
        warn!("TLS is currently disabled, identity queries will not be served");
        None
    };

    let servers = start_servers(registrar, plain, tls)?;
    let handles: Vec<_> = servers.iter().map(|s| s.handle()).collect();

    let shutdown_task = rt::spawn(async move {
        if let Err(e) = rt::signal::ctrl_c().await {
            error!("Failed to listen for the shutdown signal: {e}");
        }

        info!("Shutting down tpmreg registrar");

        for handle in handles {
            handle.stop(true).await;
        }
    });

    let _ = try_join_all(servers).await?;
    shutdown_task.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tpmreg::{
        agent_identity::AgentIdentityBuilder,
        bootstrap::{SecretRecovery, SoftwareRecovery},
        crypto::testing::generate_tls_certs_for_test,
        json_wrapper::JsonWrapper,
        registrar_client::{
            Outcome, RegistrarClient, RegistrarClientBuilder,
            RegistrarClientError,
        },
        tls::{client_tls_paths, TlsClientContext},
    };

    struct TestRegistrar {
        _dir: tempfile::TempDir,
        config: TpmregConfig,
        plain_port: u16,
        tls_port: u16,
        handles: Vec<actix_web::dev::ServerHandle>,
    }

    impl TestRegistrar {
        async fn stop(self) {
            for handle in self.handles {
                handle.stop(true).await;
            }
        }

        fn client(&self, tls: bool) -> RegistrarClient {
            let ctx = if tls {
                let paths = client_tls_paths(
                    &self.config.general,
                    &self.config.registrar_client,
                );
                Some(Arc::new(
                    TlsClientContext::new(&paths, "", true).unwrap(), //#[allow_ci]
                ))
            } else {
                None
            };

            RegistrarClientBuilder::new()
                .registrar_address("127.0.0.1".to_string())
                .registrar_port(self.plain_port)
                .registrar_tls_port(self.tls_port)
                .tls_context(ctx)
                .build()
                .unwrap() //#[allow_ci]
        }
    }

    fn start_test_registrar() -> TestRegistrar {
        let dir = tempfile::tempdir().unwrap(); //#[allow_ci]
        let _ = generate_tls_certs_for_test(dir.path(), None).unwrap(); //#[allow_ci]

        let mut config = TpmregConfig::default();
        let tls_dir = dir.path().display().to_string();
        config.general.work_dir = tls_dir.clone();
        config.registrar.tls_dir = tls_dir.clone();
        config.registrar_client.registrar_tls_dir = tls_dir;

        let acceptor = server_tls_context(&config).unwrap(); //#[allow_ci]
        let plain = TcpListener::bind("127.0.0.1:0").unwrap(); //#[allow_ci]
        let tls = TcpListener::bind("127.0.0.1:0").unwrap(); //#[allow_ci]
        let plain_port = plain.local_addr().unwrap().port(); //#[allow_ci]
        let tls_port = tls.local_addr().unwrap().port(); //#[allow_ci]

        let registrar = web::Data::new(Registrar::new(
            Box::new(MemoryStore::new()),
            Box::new(NoDeepQuoteSupport),
        ));
        let servers =
            start_servers(registrar, plain, Some((tls, acceptor))).unwrap(); //#[allow_ci]

        let handles = servers.iter().map(|s| s.handle()).collect();
        for server in servers {
            let _ = rt::spawn(server);
        }

        TestRegistrar {
            _dir: dir,
            config,
            plain_port,
            tls_port,
            handles,
        }
    }

    #[actix_rt::test]
    async fn test_register_activate_fetch_over_mtls() {
        let registrar = start_test_registrar();
        let client = registrar.client(true);

        let (ek_pub, ek_priv) = crypto::rsa_generate_pair(2048).unwrap(); //#[allow_ci]
        let ek = crypto::rsa_export_pubkey(&ek_pub).unwrap(); //#[allow_ci]
        let identity = AgentIdentityBuilder::new()
            .agent_id("D432FBB3-D2F1-4A97-9EF7-75BD81C00000")
            .public_ek(&ek)
            .public_aik("aik")
            .aik_name("aik_name".to_string())
            .build()
            .unwrap(); //#[allow_ci]
        let agent_id = identity.agent_id.as_str();

        let blob = match client.register_agent(&identity).await {
            Ok(Outcome::Accepted(blob)) => blob,
            other => panic!("registration failed: {other:?}"),
        };

        let secret = SoftwareRecovery::new(ek_priv)
            .recover_secret(&blob)
            .unwrap(); //#[allow_ci]

        let outcome = client.activate_agent(agent_id, &secret).await.unwrap(); //#[allow_ci]
        assert_eq!(outcome, Outcome::Accepted(()));

        let info = match client.fetch_identity(agent_id).await {
            Ok(Outcome::Accepted(info)) => info,
            other => panic!("identity query failed: {other:?}"),
        };
        assert_eq!(info.aik, "aik");
        assert_eq!(info.ek, ek);
        assert_eq!(info.aik_name.as_deref(), Some("aik_name"));
        assert!(info.active);

        let aik = client.get_aik(agent_id).await.unwrap(); //#[allow_ci]
        assert_eq!(aik, Outcome::Accepted("aik".to_string()));

        // The challenge is single use
        match client.activate_agent(agent_id, &secret).await {
            Ok(Outcome::Rejected(r)) => assert_eq!(r.code, 400),
            other => panic!("repeated activation accepted: {other:?}"),
        }

        let outcome = client.delete_agent(agent_id).await.unwrap(); //#[allow_ci]
        assert_eq!(outcome, Outcome::Accepted(()));

        match client.fetch_identity(agent_id).await {
            Ok(Outcome::Rejected(r)) => assert_eq!(r.code, 404),
            other => panic!("deleted agent still present: {other:?}"),
        }

        registrar.stop().await;
    }

    #[actix_rt::test]
    async fn test_plain_listener() {
        let registrar = start_test_registrar();
        let client = registrar.client(false);

        let (ek_pub, ek_priv) = crypto::rsa_generate_pair(2048).unwrap(); //#[allow_ci]
        let ek = crypto::rsa_export_pubkey(&ek_pub).unwrap(); //#[allow_ci]
        let identity = AgentIdentityBuilder::new()
            .agent_id("plain-agent")
            .public_ek(&ek)
            .public_aik("aik")
            .build()
            .unwrap(); //#[allow_ci]

        // Registration and activation are served without TLS
        let blob = client
            .register_agent(&identity)
            .await
            .unwrap() //#[allow_ci]
            .accepted()
            .unwrap(); //#[allow_ci]
        let recovery = SoftwareRecovery::new(ek_priv);
        let secret = recovery.recover_secret(&blob).unwrap(); //#[allow_ci]

        let outcome = client
            .activate_agent("plain-agent", b"wrong secret")
            .await
            .unwrap(); //#[allow_ci]
        assert!(!outcome.is_accepted());

        let outcome = client
            .activate_agent("plain-agent", &secret)
            .await
            .unwrap(); //#[allow_ci]
        assert!(outcome.is_accepted());

        // The client refuses to query the identity without mutual TLS
        let r = client.fetch_identity("plain-agent").await;
        assert!(matches!(r, Err(RegistrarClientError::Authorization(_))));

        // And the plain listener refuses to answer it
        let url = format!(
            "http://127.0.0.1:{}/v2/agents/plain-agent",
            registrar.plain_port
        );
        let resp = reqwest::get(&url).await.unwrap(); //#[allow_ci]
        assert_eq!(resp.status().as_u16(), 405);
        let result: JsonWrapper<serde_json::Value> = resp.json().await.unwrap(); //#[allow_ci]
        assert_eq!(result.code, 405);

        // Unsupported API versions are rejected before dispatch
        let url = format!(
            "http://127.0.0.1:{}/v1/agents/plain-agent",
            registrar.plain_port
        );
        let resp = reqwest::get(&url).await.unwrap(); //#[allow_ci]
        assert_eq!(resp.status().as_u16(), 400);

        registrar.stop().await;
    }

    #[actix_rt::test]
    async fn test_tls_listener_requires_client_certificate() {
        let registrar = start_test_registrar();

        let ca = std::fs::read(
            std::path::Path::new(&registrar.config.registrar.tls_dir)
                .join("cacert.crt"),
        )
        .unwrap(); //#[allow_ci]
        let http = reqwest::Client::builder()
            .tls_built_in_root_certs(false)
            .add_root_certificate(reqwest::Certificate::from_pem(&ca).unwrap()) //#[allow_ci]
            .build()
            .unwrap(); //#[allow_ci]

        let url = format!(
            "https://127.0.0.1:{}/v2/agents/uuid",
            registrar.tls_port
        );
        assert!(http.get(&url).send().await.is_err());

        registrar.stop().await;
    }
}
