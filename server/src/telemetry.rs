// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use tracing::{subscriber::set_global_default, Subscriber};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt::MakeWriter, layer::SubscriberExt, EnvFilter, Registry};

/// Drops this crate's own noisy dependencies down to `info` so a `trace` or
/// `debug` default filter stays readable: `actix`'s per-frame WebSocket
/// polling and `sqlx`'s per-statement logging otherwise drown out
/// connection-lifecycle and log-engine spans (§6.5). Only applied to the
/// `RUST_LOG`-less default; an explicit `RUST_LOG` is never second-guessed.
fn silence_chatty_modules(env_filter: EnvFilter) -> EnvFilter {
    env_filter
        .add_directive("actix=info".parse().expect("error parsing directive"))
        .add_directive("actix_web=info".parse().expect("error parsing directive"))
        .add_directive(
            "actix_web_actors=info"
                .parse()
                .expect("error parsing directive"),
        )
        .add_directive("sqlx=warn".parse().expect("error parsing directive"))
        .add_directive("mio=info".parse().expect("error parsing directive"))
        .add_directive("want=info".parse().expect("error parsing directive"))
}

/// Build a subscriber for the server's tracing events from multiple layers,
/// structured as bunyan-formatted JSON so every span carries connection and
/// user identifiers (§6.5) without ever including plaintext or key
/// material.
pub fn get_subscriber<Sink>(
    name: String,
    default_filter: String,
    sink: Sink,
) -> impl Subscriber + Send + Sync
where
    Sink: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(env_filter) => env_filter,
        Err(_) => silence_chatty_modules(EnvFilter::new(default_filter)),
    };
    let formatting_layer = BunyanFormattingLayer::new(name, sink);
    Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(formatting_layer)
}

/// Register a subscriber as global default to process span data.
pub fn init_subscriber(subscriber: impl Subscriber + Send + Sync) {
    LogTracer::init().expect("Failed to set logger");
    set_global_default(subscriber).expect("Failed to set subscriber");
}
