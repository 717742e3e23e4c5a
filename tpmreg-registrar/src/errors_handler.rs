// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

use actix_web::{
    body, dev,
    error::{InternalError, JsonPayloadError, PathError},
    http,
    middleware::ErrorHandlerResponse,
    HttpRequest, HttpResponse, Responder, Result,
};
use log::*;
use tpmreg::{
    api_version::{restful_params, ApiVersion},
    json_wrapper::JsonWrapper,
    structures::EmptyResults,
};

pub(crate) async fn app_default(req: HttpRequest) -> impl Responder {
    let error;
    let response;
    let message;

    match req.head().method {
        http::Method::GET
        | http::Method::POST
        | http::Method::PUT
        | http::Method::DELETE => {
            error = 400;
            message = format!(
                "Not Implemented: Use /{}/agents/ interface",
                ApiVersion::current().prefix()
            );
            response = HttpResponse::BadRequest()
                .json(JsonWrapper::error(error, &message));
        }
        _ => {
            error = 405;
            message = "Method is not supported".to_string();
            response = HttpResponse::MethodNotAllowed()
                .insert_header(http::header::Allow(vec![
                    http::Method::GET,
                    http::Method::POST,
                    http::Method::PUT,
                    http::Method::DELETE,
                ]))
                .json(JsonWrapper::error(error, &message));
        }
    };

    warn!(
        "{} returning {} response. {}",
        req.head().method,
        error,
        message
    );

    response
}

/// Requests whose path starts with a `/v<digit>` marker other than the
/// current version
pub(crate) async fn version_not_supported(req: HttpRequest) -> impl Responder {
    match restful_params(&req.uri().to_string()) {
        Err(e) => {
            let message = e.to_string();
            warn!("{} returning 400 response. {}", req.head().method, message);
            HttpResponse::BadRequest().json(JsonWrapper::error(400, message))
        }
        // Not a version marker after all, e.g. "/v22/..."
        Ok(params) => {
            debug!("No route matches request parameters {params:?}");
            warn!("{} returning 404 response. Not Found", req.head().method);
            HttpResponse::NotFound()
                .json(JsonWrapper::new(404, None, EmptyResults {}))
        }
    }
}

pub(crate) fn json_parser_error(
    err: JsonPayloadError,
    req: &HttpRequest,
) -> actix_web::Error {
    warn!("{} returning 400 response. {}", req.head().method, err);

    let resp = HttpResponse::BadRequest().json(JsonWrapper::error(400, &err));
    InternalError::from_response(err, resp).into()
}

pub(crate) fn path_parser_error(
    err: PathError,
    req: &HttpRequest,
) -> actix_web::Error {
    warn!("{} returning 400 response. {}", req.head().method, err);

    let resp = HttpResponse::BadRequest().json(JsonWrapper::error(400, &err));
    InternalError::from_response(err, resp).into()
}

// There is no easy way to capture the default errors emitted by the server,
// so 404 responses are rebuilt with the JSON envelope here.
// see: https://github.com/actix/actix-web/issues/1604
pub(crate) fn wrap_404<B>(
    res: dev::ServiceResponse<B>,
) -> Result<ErrorHandlerResponse<body::BoxBody>> {
    let status = res.status();

    warn!(
        "{} returning 404 response. {}",
        res.request().head().method,
        status.canonical_reason().unwrap_or("Not Found")
    );

    let response = HttpResponse::build(status).json(JsonWrapper::new(
        status.as_u16(),
        None,
        EmptyResults {},
    ));

    Ok(ErrorHandlerResponse::Response(dev::ServiceResponse::new(
        res.into_parts().0,
        response.map_into_left_body(),
    )))
}
