// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The connection core (§4.3): the per-session state machine. One instance
//! is owned by a single logical executor (a WebSocket actor in the server
//! crate), so its fields are mutated without internal locking (§5).

pub mod actions;
pub mod frame;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::crypto::KeyAgreement;
use crate::directory::UserDirectory;
use crate::dispatcher::SubscriptionDispatcher;
use crate::errors::ActionError;
use crate::identifiers::{AppId, ClientId, ConnectionId, DatabaseId, ItemKey, SessionId, UserId};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::registry::{CloseReason, RegisteredConnection, SessionRegistry};
use crate::store::StoreAdapter;
use crate::txlog::{Command, LogEngine};

use actions::{Action, UnknownAction};
use frame::{IncomingFrame, OutgoingMessage, OutgoingResponse, MAX_FRAME_BYTES};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Upgraded,
    AwaitingKeyValidation,
    Active,
    Closing,
    Closed,
}

#[derive(Default, Clone, Copy, Debug)]
pub struct SubscriptionState {
    pub last_delivered_seq: u64,
}

/// Process-wide services shared by every connection, injected once at
/// server start (§9 "global mutable state").
pub struct Core<S: StoreAdapter, K: KeyAgreement> {
    pub store: Arc<S>,
    pub log_engine: Arc<LogEngine<S>>,
    pub registry: Arc<SessionRegistry<OutgoingMessage>>,
    pub dispatcher: Arc<SubscriptionDispatcher<OutgoingMessage>>,
    pub directory: Arc<UserDirectory>,
    pub key_agreement: Arc<K>,
    pub rate_limiter_config: RateLimiterConfig,
}

/// Outcome of feeding one inbound frame (or heartbeat tick) to the
/// connection core: zero or more frames to send, and whether the
/// connection should now be torn down.
#[derive(Default)]
pub struct FrameOutcome {
    pub outgoing: Vec<OutgoingMessage>,
    pub close: Option<CloseReason>,
}

impl FrameOutcome {
    fn send(mut self, msg: OutgoingMessage) -> Self {
        self.outgoing.push(msg);
        self
    }

    fn closing(mut self, reason: CloseReason) -> Self {
        self.close = Some(reason);
        self
    }
}

pub struct ConnectionCore<S: StoreAdapter, K: KeyAgreement> {
    core: Arc<Core<S, K>>,
    registered: Arc<RegisteredConnection<OutgoingMessage>>,
    pub id: ConnectionId,
    pub user_id: UserId,
    pub app_id: AppId,
    pub session_id: SessionId,
    state: ConnectionState,
    key_validated: bool,
    is_alive: bool,
    validation_nonce: Option<Vec<u8>>,
    subscriptions: HashMap<DatabaseId, SubscriptionState>,
    rate_limiter: RateLimiter,
}

impl<S: StoreAdapter, K: KeyAgreement> ConnectionCore<S, K> {
    /// Construct a connection in `Upgraded` state and immediately perform
    /// the handshake transition described in §4.3: emit the `Connection`
    /// control frame and move to `AwaitingKeyValidation`.
    pub fn new(
        core: Arc<Core<S, K>>,
        registered: Arc<RegisteredConnection<OutgoingMessage>>,
        app_id: AppId,
        session_id: SessionId,
        user_public_key: &[u8],
        key_salts: Vec<u8>,
    ) -> (Self, OutgoingMessage) {
        let connection_nonce = registered.id.to_string();
        let (plaintext, encrypted) = core
            .key_agreement
            .generate_validation_challenge(user_public_key, connection_nonce.as_bytes());

        let mut connection = Self {
            id: registered.id,
            user_id: registered.user_id,
            app_id,
            session_id,
            state: ConnectionState::Upgraded,
            key_validated: false,
            is_alive: true,
            validation_nonce: Some(plaintext),
            subscriptions: HashMap::new(),
            rate_limiter: RateLimiter::new(core.rate_limiter_config.clone()),
            core,
            registered,
        };
        connection.state = ConnectionState::AwaitingKeyValidation;
        let handshake = OutgoingMessage::Connection {
            key_salts,
            encrypted_validation_message: encrypted,
        };
        (connection, handshake)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_key_validated(&self) -> bool {
        self.key_validated
    }

    /// §4.3 heartbeat: called once per 30s tick. Returns whether the
    /// transport should now be terminated (the connection missed the
    /// previous tick entirely).
    pub fn heartbeat_tick(&mut self) -> Option<OutgoingMessage> {
        if !self.is_alive {
            return None;
        }
        self.is_alive = false;
        Some(OutgoingMessage::Ping)
    }

    pub fn heartbeat_expired(&self) -> bool {
        !self.is_alive
    }

    fn mark_alive(&mut self) {
        self.is_alive = true;
    }

    /// Release subscriptions and deregister from the session registry. Safe
    /// to call more than once.
    pub async fn teardown(&mut self, client_id: &ClientId) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;
        self.core.dispatcher.unsubscribe_all(self.id).await;
        self.core
            .registry
            .deregister(self.user_id, client_id, self.id)
            .await;
        self.state = ConnectionState::Closed;
    }

    /// Feed one inbound frame (raw bytes as received from the transport)
    /// through size checks, parsing, state-machine gating, rate limiting,
    /// and dispatch (§4.3, §7).
    pub async fn handle_frame(&mut self, raw: &[u8]) -> FrameOutcome {
        self.mark_alive();

        if raw.len() > MAX_FRAME_BYTES {
            return FrameOutcome::default()
                .send(OutgoingMessage::PlainTextError("Message is too large".into()));
        }

        let frame: IncomingFrame = match serde_json::from_slice(raw) {
            Ok(f) => f,
            Err(_) => {
                return FrameOutcome::default()
                    .send(OutgoingMessage::PlainTextError("Malformed frame".into()));
            }
        };

        let action = match Action::parse(&frame.action, frame.params) {
            Ok(action) => action,
            Err(UnknownAction) => {
                return FrameOutcome::default().send(OutgoingMessage::PlainTextError(
                    "Unknown action".into(),
                ));
            }
        };

        if matches!(action, Action::Pong) {
            // §4.3: no response, and not subject to rate limiting — it is
            // the liveness signal itself.
            return FrameOutcome::default();
        }

        if !self
            .rate_limiter
            .allow(self.id.to_string().as_bytes(), action.name().as_bytes())
            .await
        {
            let resp = OutgoingResponse::error(
                frame.request_id,
                action.name(),
                &ActionError::TooManyRequests,
            );
            return FrameOutcome::default()
                .send(OutgoingMessage::Response(Arc::new(resp)));
        }

        let route = action.name();
        let result = self.dispatch(action).await;
        self.respond(frame.request_id, route, result)
    }

    fn respond(
        &mut self,
        request_id: String,
        route: &str,
        result: Result<(serde_json::Value, Option<CloseReason>), ActionError>,
    ) -> FrameOutcome {
        match result {
            Ok((data, close)) => {
                let resp = OutgoingResponse::ok(request_id, route, data);
                let outcome = FrameOutcome::default().send(OutgoingMessage::Response(Arc::new(resp)));
                match close {
                    Some(reason) => outcome.closing(reason),
                    None => outcome,
                }
            }
            Err(err) => {
                let resp = OutgoingResponse::error(request_id, route, &err);
                FrameOutcome::default().send(OutgoingMessage::Response(Arc::new(resp)))
            }
        }
    }

    async fn dispatch(
        &mut self,
        action: Action,
    ) -> Result<(serde_json::Value, Option<CloseReason>), ActionError> {
        use serde_json::json;

        match (self.state, &action) {
            (ConnectionState::AwaitingKeyValidation, Action::ValidateKey(_)) => {}
            (ConnectionState::AwaitingKeyValidation, _) => {
                return Err(ActionError::Forbidden);
            }
            (ConnectionState::Active, Action::ValidateKey(_)) => {
                return Err(ActionError::BadRequest("already key-validated".into()));
            }
            (ConnectionState::Active, _) => {}
            _ => return Err(ActionError::Forbidden),
        }

        match action {
            Action::ValidateKey(params) => {
                let expected = self.validation_nonce.take();
                match expected {
                    Some(expected) if expected == params.decrypted_nonce => {
                        self.key_validated = true;
                        self.state = ConnectionState::Active;
                        Ok((json!({}), None))
                    }
                    Some(expected) => {
                        // Stays in AwaitingKeyValidation; retain the nonce
                        // so the client may retry.
                        self.validation_nonce = Some(expected);
                        Err(ActionError::Unauthorized)
                    }
                    None => Err(ActionError::Unauthorized),
                }
            }
            Action::SignOut => {
                self.core
                    .directory
                    .invalidate_session(self.session_id, Utc::now())
                    .await;
                Ok((json!({}), Some(CloseReason::ClientRequested)))
            }
            Action::UpdateUser(params) => {
                if let Some(new_username) = &params.username {
                    self.core
                        .directory
                        .rename_user(self.user_id, new_username)
                        .await?;
                }
                self.core
                    .directory
                    .update_user(self.user_id, |user| {
                        if let Some(email) = params.email {
                            user.email = Some(email);
                        }
                        if let Some(profile) = params.profile {
                            user.profile = Some(profile);
                        }
                        if let Some(token) = params.new_password_token {
                            user.password_token = token;
                        }
                    })
                    .await?;
                Ok((json!({}), None))
            }
            Action::DeleteUser => {
                self.core.directory.soft_delete_user(self.user_id).await?;
                self.core
                    .directory
                    .invalidate_sessions_for_user(self.user_id, Utc::now())
                    .await;
                Ok((json!({}), Some(CloseReason::ClientRequested)))
            }
            Action::OpenDatabase(params) => {
                let opened = if let Some(reopen_at) = params.reopen_at_seq_no {
                    let records = self
                        .core
                        .log_engine
                        .reopen_at(self.user_id, params.db_id, reopen_at)
                        .await?;
                    let bundle_seq_no = self
                        .core
                        .log_engine
                        .current_bundle_seq_no(self.user_id, params.db_id)
                        .await;
                    (None, records, bundle_seq_no)
                } else {
                    let result = self
                        .core
                        .log_engine
                        .open(self.user_id, params.db_id)
                        .await?;
                    let bundle_seq_no = result.bundle.as_ref().map(|b| b.bundle_seq_no).unwrap_or(0);
                    (result.bundle, result.records, bundle_seq_no)
                };
                let (bundle, records, last_seq_no) = opened;
                let last_seq_no = records.iter().map(|r| r.seq_no).max().unwrap_or(last_seq_no);

                self.core
                    .dispatcher
                    .subscribe(
                        self.user_id,
                        params.db_id,
                        self.registered.clone(),
                        last_seq_no,
                    )
                    .await;
                self.subscriptions
                    .insert(params.db_id, SubscriptionState { last_delivered_seq: last_seq_no });

                Ok((
                    json!({
                        "bundle": bundle.as_ref().map(|b| &b.blob),
                        "bundleSeqNo": bundle.as_ref().map(|b| b.bundle_seq_no),
                        "records": records,
                    }),
                    None,
                ))
            }
            Action::Insert(params) => self.append_one(Command::Insert, params).await,
            Action::Update(params) => self.append_one(Command::Update, params).await,
            Action::Delete(params) => self.append_one(Command::Delete, params).await,
            Action::BatchTransaction(params) => {
                let items = params
                    .items
                    .into_iter()
                    .map(|item| {
                        (
                            item.command,
                            ItemKey::new(item.item_key),
                            item.encrypted_item,
                        )
                    })
                    .collect();
                let records = self
                    .core
                    .log_engine
                    .append_batch(self.user_id, params.db_id, items, self.user_id)
                    .await?;
                self.core
                    .dispatcher
                    .dispatch_records(self.user_id, params.db_id, records.clone())
                    .await;
                Ok((json!({ "records": records }), None))
            }
            Action::Bundle(params) => {
                self.core
                    .log_engine
                    .publish_bundle(self.user_id, params.db_id, params.seq_no, params.bundle.clone())
                    .await?;
                self.core
                    .dispatcher
                    .dispatch_bundle(
                        self.user_id,
                        params.db_id,
                        crate::txlog::Bundle {
                            bundle_seq_no: params.seq_no,
                            blob: params.bundle,
                        },
                    )
                    .await;
                Ok((json!({}), None))
            }
            Action::GetPasswordSalts => {
                let user = self.core.directory.find_by_id(self.user_id).await?;
                Ok((
                    json!({
                        "encryption": user.key_salts.encryption,
                        "diffieHellman": user.key_salts.diffie_hellman,
                        "hmac": user.key_salts.hmac,
                    }),
                    None,
                ))
            }
            Action::Pong => unreachable!("handled before dispatch"),
        }
    }

    async fn append_one(
        &mut self,
        command: Command,
        params: actions::WriteParams,
    ) -> Result<(serde_json::Value, Option<CloseReason>), ActionError> {
        use serde_json::json;
        let record = self
            .core
            .log_engine
            .append(
                self.user_id,
                params.db_id,
                command,
                ItemKey::new(params.item_key),
                params.encrypted_item,
                self.user_id,
            )
            .await?;
        self.core
            .dispatcher
            .dispatch_records(self.user_id, params.db_id, vec![record.clone()])
            .await;
        Ok((json!({ "seqNo": record.seq_no }), None))
    }
}
