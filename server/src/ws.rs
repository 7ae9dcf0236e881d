// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The WebSocket actor (§4.3, §6.1). Grounded in the teacher's
//! `server/src/endpoints/qs/ws/mod.rs` `QsWsConnection`: an
//! `actix::Actor` over `ws::WebsocketContext` that runs its own heartbeat
//! and forwards frames to and from a per-connection core. Generalized from
//! the teacher's single-queue-id actor to wrap the full
//! [`vaultsync_core::ConnectionCore`] state machine instead of a bare
//! queue notifier.
//!
//! `ConnectionCore` is async, but actix actor handlers are synchronous;
//! frames are driven through it via `ctx.spawn`, one at a time, wrapped in
//! a `tokio::sync::Mutex` so the borrow checker doesn't need `act` to be
//! reachable from inside the `await`.

use std::sync::Arc;
use std::time::Duration;

use actix::{Actor, ActorContext, ActorFutureExt, AsyncContext, Running, StreamHandler, WrapFuture};

use actix_web_actors::ws;
use base64::{engine::general_purpose, Engine as _};
use futures_util::StreamExt as _;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;

use vaultsync_core::connection::frame::OutgoingMessage;
use vaultsync_core::connection::{ConnectionCore, FrameOutcome};
use vaultsync_core::crypto::KeyAgreement;
use vaultsync_core::identifiers::{AppId, ClientId, SessionId};
use vaultsync_core::registry::CloseReason;
use vaultsync_core::store::StoreAdapter;

/// Header carrying the parameters needed to construct a connection, as
/// base64-encoded JSON, mirroring the teacher's `QsOpenWsParams` header.
pub const OPEN_PARAMS_HEADER: &str = "VaultSyncOpenParams";

#[derive(Deserialize, Debug)]
pub struct OpenParams {
    #[serde(rename = "appId")]
    pub app_id: AppId,
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    #[serde(rename = "clientId")]
    pub client_id: String,
}

pub fn decode_open_params(header_value: &[u8]) -> Result<OpenParams, String> {
    let decoded = general_purpose::STANDARD
        .decode(header_value)
        .map_err(|e| format!("could not decode {OPEN_PARAMS_HEADER} header: {e}"))?;
    serde_json::from_slice(&decoded)
        .map_err(|e| format!("could not deserialize {OPEN_PARAMS_HEADER} header: {e}"))
}

/// A frame pushed by the registry or the subscription dispatcher, forwarded
/// into the actor's mailbox.
#[derive(actix::Message)]
#[rtype(result = "()")]
struct Push(OutgoingMessage);

/// Forced close requested by the registry, e.g. superseded by a newer
/// connection sharing the same client id (§4.2).
#[derive(actix::Message)]
#[rtype(result = "()")]
struct ForceClose(#[allow(dead_code)] CloseReason);

pub struct ConnectionActor<S: StoreAdapter, K: KeyAgreement> {
    core: Arc<Mutex<ConnectionCore<S, K>>>,
    client_id: ClientId,
    heartbeat_interval: Duration,
    handshake: Option<OutgoingMessage>,
    outbox_rx: Option<mpsc::Receiver<OutgoingMessage>>,
    close_rx: Option<mpsc::Receiver<CloseReason>>,
}

impl<S: StoreAdapter + 'static, K: KeyAgreement + 'static> ConnectionActor<S, K> {
    /// `handshake` is the `Connection` control frame returned by
    /// [`ConnectionCore::new`]; it is written as soon as the actor starts.
    /// The outbox/close channels are registered as streams in `started()`
    /// rather than here, since `actix_web_actors::ws::start` hands this
    /// constructor no `Context` to call `add_stream` on.
    pub fn new(
        core: ConnectionCore<S, K>,
        handshake: OutgoingMessage,
        client_id: ClientId,
        heartbeat_interval: Duration,
        outbox_rx: mpsc::Receiver<OutgoingMessage>,
        close_rx: mpsc::Receiver<CloseReason>,
    ) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
            client_id,
            heartbeat_interval,
            handshake: Some(handshake),
            outbox_rx: Some(outbox_rx),
            close_rx: Some(close_rx),
        }
    }

    fn write(ctx: &mut ws::WebsocketContext<Self>, msg: &OutgoingMessage) {
        match msg.encode() {
            Ok(bytes) => ctx.binary(bytes),
            Err(e) => tracing::error!(error = %e, "failed to encode outgoing frame"),
        }
    }

    fn write_outcome(ctx: &mut ws::WebsocketContext<Self>, outcome: &FrameOutcome) {
        for msg in &outcome.outgoing {
            Self::write(ctx, msg);
        }
        if outcome.close.is_some() {
            ctx.stop();
        }
    }

    fn process_frame(&self, raw: Vec<u8>, ctx: &mut ws::WebsocketContext<Self>) {
        let core = self.core.clone();
        let fut = async move {
            let mut core = core.lock().await;
            core.handle_frame(&raw).await
        };
        ctx.spawn(fut.into_actor(self).map(|outcome, _act, ctx| {
            Self::write_outcome(ctx, &outcome);
        }));
    }
}

impl<S: StoreAdapter + 'static, K: KeyAgreement + 'static> Actor for ConnectionActor<S, K> {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if let Some(outbox_rx) = self.outbox_rx.take() {
            ctx.add_stream(ReceiverStream::new(outbox_rx).map(Push));
        }
        if let Some(close_rx) = self.close_rx.take() {
            ctx.add_stream(ReceiverStream::new(close_rx).map(ForceClose));
        }
        if let Some(handshake) = self.handshake.take() {
            Self::write(ctx, &handshake);
        }
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            let core = act.core.clone();
            let fut = async move {
                let mut core = core.lock().await;
                if core.heartbeat_expired() {
                    None
                } else {
                    core.heartbeat_tick()
                }
            };
            ctx.spawn(fut.into_actor(act).map(|ping, _act, ctx| match ping {
                Some(ping) => Self::write(ctx, &ping),
                None => {
                    tracing::info!("disconnecting websocket: heartbeat timeout");
                    ctx.stop();
                }
            }));
        });
    }

    fn stopping(&mut self, _ctx: &mut Self::Context) -> Running {
        let core = self.core.clone();
        let client_id = self.client_id.clone();
        actix::spawn(async move {
            core.lock().await.teardown(&client_id).await;
        });
        Running::Stop
    }
}

impl<S: StoreAdapter + 'static, K: KeyAgreement + 'static>
    StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConnectionActor<S, K>
{
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => {
                ctx.stop();
                return;
            }
        };
        match msg {
            ws::Message::Binary(bytes) => self.process_frame(bytes.to_vec(), ctx),
            ws::Message::Text(text) => self.process_frame(text.as_bytes().to_vec(), ctx),
            ws::Message::Ping(bytes) => ctx.pong(&bytes),
            ws::Message::Pong(_) => {}
            ws::Message::Close(reason) => {
                tracing::trace!(?reason, "received close");
                ctx.stop();
            }
            ws::Message::Continuation(_) => ctx.stop(),
            ws::Message::Nop => {}
        }
    }
}

impl<S: StoreAdapter + 'static, K: KeyAgreement + 'static> StreamHandler<Push>
    for ConnectionActor<S, K>
{
    fn handle(&mut self, msg: Push, ctx: &mut Self::Context) {
        Self::write(ctx, &msg.0);
    }
}

impl<S: StoreAdapter + 'static, K: KeyAgreement + 'static> StreamHandler<ForceClose>
    for ConnectionActor<S, K>
{
    fn handle(&mut self, _msg: ForceClose, ctx: &mut Self::Context) {
        ctx.stop();
    }
}
