// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::net::TcpListener;
use std::sync::Arc;

use vaultsync_core::connection::Core;
use vaultsync_core::crypto::PlaceholderKeyAgreement;
use vaultsync_core::directory::UserDirectory;
use vaultsync_core::dispatcher::SubscriptionDispatcher;
use vaultsync_core::registry::SessionRegistry;
use vaultsync_core::store::memory::MemoryStore;
use vaultsync_core::txlog::LogEngine;

use vaultsyncd::{configurations::get_configuration, run, state::AppState, telemetry};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let subscriber = telemetry::get_subscriber("vaultsyncd".into(), "info".into(), std::io::stdout);
    telemetry::init_subscriber(subscriber);

    let settings = get_configuration("server/").expect("Could not load configuration.");

    if settings.tls.is_some() {
        tracing::warn!(
            "TLS settings configured but this build only binds plaintext HTTP; terminate TLS upstream."
        );
    }

    let store = Arc::new(MemoryStore::new());
    let core = Arc::new(Core {
        log_engine: Arc::new(LogEngine::new(store.clone())),
        store,
        registry: Arc::new(SessionRegistry::new()),
        dispatcher: Arc::new(SubscriptionDispatcher::new()),
        directory: Arc::new(UserDirectory::new()),
        key_agreement: Arc::new(PlaceholderKeyAgreement),
        rate_limiter_config: settings.rate_limit.clone().into(),
    });

    let address = format!("0.0.0.0:{}", settings.http_port);
    let listener = TcpListener::bind(&address)
        .unwrap_or_else(|e| panic!("Failed to bind to {address}: {e}"));
    tracing::info!(%address, "listening");

    let state = Arc::new(AppState { core, settings });

    run(listener, state)?.await
}
