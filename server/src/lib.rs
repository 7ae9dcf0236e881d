// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! vaultsyncd: the connection-handling server binary wrapping
//! `vaultsync_core`.

pub mod configurations;
pub mod rest;
pub mod state;
pub mod telemetry;
pub mod ws;

use std::net::TcpListener;
use std::sync::Arc;

use actix_web::{dev::Server, middleware::DefaultHeaders, web, App, HttpServer};
use tracing_actix_web::TracingLogger;

use vaultsync_core::crypto::KeyAgreement;
use vaultsync_core::store::StoreAdapter;

use state::AppState;

/// Two years, in seconds, per §6.2's `Strict-Transport-Security` header.
const HSTS_MAX_AGE: &str = "max-age=63072000; includeSubDomains; preload";

/// Configure and run the server application (§4.6, §6.2). Generic over the
/// store adapter and key-agreement implementation the same way the
/// teacher's `run` is generic over its storage providers.
pub fn run<S, K>(listener: TcpListener, state: Arc<AppState<S, K>>) -> Result<Server, std::io::Error>
where
    S: StoreAdapter + 'static,
    K: KeyAgreement + 'static,
{
    let app_data = web::Data::from(state);

    tracing::info!(
        addr = %listener.local_addr().expect("listener has a local address"),
        "starting server"
    );

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .wrap(DefaultHeaders::new().add(("Strict-Transport-Security", HSTS_MAX_AGE)))
            .app_data(app_data.clone())
            .route("/ping", web::get().to(rest::ping))
            .route("/v1/api/", web::get().to(rest::upgrade_connection::<S, K>))
            .route("/v1/api/auth/sign-up", web::post().to(rest::sign_up::<S, K>))
            .route("/v1/api/auth/sign-in", web::post().to(rest::sign_in::<S, K>))
            .route(
                "/v1/api/auth/sign-in-with-session",
                web::post().to(rest::sign_in_with_session::<S, K>),
            )
            .route(
                "/v1/api/auth/server-public-key",
                web::get().to(rest::server_public_key::<S, K>),
            )
            .route(
                "/v1/api/auth/get-password-salts",
                web::get().to(rest::get_password_salts::<S, K>),
            )
    })
    .listen(listener)?
    .run();
    Ok(server)
}
