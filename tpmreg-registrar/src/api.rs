// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

use crate::{
    agents_handler::{self, Interface},
    errors_handler,
};
use actix_web::web;
use tpmreg::api_version::ApiVersion;

/// Configure the routes served on a listener
///
/// The agents endpoints are reachable both with and without the version
/// prefix. Any other version prefix is answered with 400 before reaching
/// the handlers.
pub(crate) fn configure_api(cfg: &mut web::ServiceConfig, interface: Interface) {
    let versioned = format!("/{}/agents", ApiVersion::current().prefix());

    _ = cfg
        .service(web::scope(&versioned).configure(|c| {
            agents_handler::configure_agents_endpoints(c, interface)
        }))
        .service(web::scope("/agents").configure(|c| {
            agents_handler::configure_agents_endpoints(c, interface)
        }))
        .service(
            web::resource(r"/v{major:\d}{tail}*")
                .to(errors_handler::version_not_supported),
        )
        .default_service(web::to(errors_handler::app_default));
}
