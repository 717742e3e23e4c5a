// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

use crate::{
    error::{Error, Result},
    registrar::Registrar,
};
use actix_web::{http, web, HttpRequest, HttpResponse, Responder};
use log::*;
use tpmreg::{
    json_wrapper::JsonWrapper,
    structures::{
        ActivateRequest, EmptyResults, RegisterRequest, RegisterResults,
        VirtualActivateRequest,
    },
};

/// Which listener a request came in on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Interface {
    Plain,
    Tls,
}

fn failed(req: &HttpRequest, e: Error) -> HttpResponse {
    let code = e.http_code();
    warn!(
        "{} returning {} response. {}",
        req.head().method,
        code.as_u16(),
        e
    );
    HttpResponse::build(code).json(JsonWrapper::error(code.as_u16(), e))
}

/// Registrar operations wait on the agent lock and do RSA work, so they run
/// on the blocking thread pool instead of the worker
async fn blocking<T, F>(registrar: web::Data<Registrar>, f: F) -> Result<T>
where
    F: FnOnce(&Registrar) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    web::block(move || f(registrar.get_ref())).await?
}

async fn register(
    req: HttpRequest,
    agent_id: web::Path<String>,
    body: web::Json<RegisterRequest>,
    registrar: web::Data<Registrar>,
) -> impl Responder {
    let agent_id = agent_id.into_inner();
    let request = body.into_inner();
    let id = agent_id.clone();

    match blocking(registrar, move |r| r.register(&id, request)).await {
        Ok(blob) => {
            info!("POST returning 200 response for agent {agent_id}");
            HttpResponse::Ok()
                .json(JsonWrapper::success(RegisterResults { blob }))
        }
        Err(e) => failed(&req, e),
    }
}

async fn activate(
    req: HttpRequest,
    agent_id: web::Path<String>,
    body: web::Json<ActivateRequest>,
    registrar: web::Data<Registrar>,
) -> impl Responder {
    let agent_id = agent_id.into_inner();
    let auth_tag = body.into_inner().auth_tag;
    let id = agent_id.clone();

    match blocking(registrar, move |r| r.activate(&id, &auth_tag)).await {
        Ok(()) => {
            info!("PUT activate returning 200 response for agent {agent_id}");
            HttpResponse::Ok().json(JsonWrapper::success(EmptyResults {}))
        }
        Err(e) => failed(&req, e),
    }
}

async fn activate_virtual(
    req: HttpRequest,
    agent_id: web::Path<String>,
    body: web::Json<VirtualActivateRequest>,
    registrar: web::Data<Registrar>,
) -> impl Responder {
    let agent_id = agent_id.into_inner();
    let deep_quote = body.into_inner().deepquote;
    let id = agent_id.clone();

    match blocking(registrar, move |r| r.activate_virtual(&id, &deep_quote))
        .await
    {
        Ok(()) => {
            info!("PUT vactivate returning 200 response for agent {agent_id}");
            HttpResponse::Ok().json(JsonWrapper::success(EmptyResults {}))
        }
        Err(e) => failed(&req, e),
    }
}

async fn get_agent(
    req: HttpRequest,
    agent_id: web::Path<String>,
    registrar: web::Data<Registrar>,
) -> impl Responder {
    let agent_id = agent_id.into_inner();
    let id = agent_id.clone();

    match blocking(registrar, move |r| r.get(&id)).await {
        Ok(info) => {
            debug!("GET returning 200 response for agent {agent_id}");
            HttpResponse::Ok().json(JsonWrapper::success(info))
        }
        Err(e) => failed(&req, e),
    }
}

async fn delete_agent(
    req: HttpRequest,
    agent_id: web::Path<String>,
    registrar: web::Data<Registrar>,
) -> impl Responder {
    let agent_id = agent_id.into_inner();
    let id = agent_id.clone();

    match blocking(registrar, move |r| r.delete(&id)).await {
        Ok(()) => {
            info!("DELETE returning 200 response for agent {agent_id}");
            HttpResponse::Ok().json(JsonWrapper::success(EmptyResults {}))
        }
        Err(e) => failed(&req, e),
    }
}

/// Identity queries and deletions are only served over mutual TLS
async fn tls_required(req: HttpRequest) -> impl Responder {
    let message = format!(
        "{} is only supported on the TLS interface",
        req.head().method
    );

    warn!("{} returning 405 response. {}", req.head().method, message);

    HttpResponse::MethodNotAllowed()
        .insert_header(http::header::Allow(vec![http::Method::POST]))
        .json(JsonWrapper::error(405, message))
}

async fn agent_default(req: HttpRequest) -> impl Responder {
    let message = "Method is not supported in /agents/ interface";

    warn!("{} returning 405 response. {}", req.head().method, message);

    HttpResponse::MethodNotAllowed()
        .insert_header(http::header::Allow(vec![
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
        ]))
        .json(JsonWrapper::error(405, message))
}

async fn activate_default(req: HttpRequest) -> impl Responder {
    let message = "Method is not supported, use PUT";

    warn!("{} returning 405 response. {}", req.head().method, message);

    HttpResponse::MethodNotAllowed()
        .insert_header(http::header::Allow(vec![http::Method::PUT]))
        .json(JsonWrapper::error(405, message))
}

async fn agents_default(req: HttpRequest) -> impl Responder {
    let message = "URI not supported, use /agents/{agent_id}";

    warn!("{} returning 400 response. {}", req.head().method, message);

    HttpResponse::BadRequest().json(JsonWrapper::error(400, message))
}

/// Configure the endpoints for the /agents scope
pub(crate) fn configure_agents_endpoints(
    cfg: &mut web::ServiceConfig,
    interface: Interface,
) {
    let agent = web::resource("/{agent_id}")
        .route(web::post().to(register))
        .default_service(web::to(agent_default));

    let agent = match interface {
        Interface::Tls => agent
            .route(web::get().to(get_agent))
            .route(web::delete().to(delete_agent)),
        Interface::Plain => agent
            .route(web::get().to(tls_required))
            .route(web::delete().to(tls_required)),
    };

    _ = cfg
        .service(agent)
        .service(
            web::resource("/{agent_id}/activate")
                .route(web::put().to(activate))
                .default_service(web::to(activate_default)),
        )
        .service(
            web::resource("/{agent_id}/vactivate")
                .route(web::put().to(activate_virtual))
                .default_service(web::to(activate_default)),
        )
        .default_service(web::to(agents_default));
}
