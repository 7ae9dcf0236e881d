// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The REST façade (§4.6, §6.2): sign-up/sign-in, server public key,
//! password salts, health check, and the WebSocket upgrade endpoint. Thin
//! by design — the teacher's equivalent handlers in
//! `server/src/endpoints/qs/mod.rs` and `.../ws/mod.rs` are similarly small
//! wrappers over a storage provider, translating HTTP in and out of the
//! domain layer. Full account administration (billing, org provisioning)
//! remains an external collaborator (§1).

use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use vaultsync_core::crypto::KeyAgreement;
use vaultsync_core::directory::{KeySalts, RememberMe, User};
use vaultsync_core::identifiers::{AppId, ClientId, UserId};
use vaultsync_core::store::StoreAdapter;

use crate::state::AppState;
use crate::ws::{decode_open_params, ConnectionActor, OPEN_PARAMS_HEADER};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpRequest {
    pub app_id: AppId,
    pub username: String,
    pub public_key: Vec<u8>,
    pub password_token: Vec<u8>,
    pub encrypted_seed_backup: Vec<u8>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session_id: String,
    user_id: String,
}

pub async fn sign_up<S: StoreAdapter, K: KeyAgreement>(
    state: web::Data<AppState<S, K>>,
    body: web::Json<SignUpRequest>,
) -> impl Responder {
    let body = body.into_inner();
    let user = User {
        user_id: UserId::random(),
        app_id: body.app_id,
        username: body.username,
        public_key: body.public_key,
        key_salts: KeySalts {
            encryption: rand_salt(),
            diffie_hellman: rand_salt(),
            hmac: rand_salt(),
        },
        password_token: body.password_token,
        encrypted_seed_backup: body.encrypted_seed_backup,
        email: body.email,
        profile: None,
        deleted: false,
    };
    let user_id = user.user_id;
    if let Err(err) = state.core.directory.create_user(user).await {
        return HttpResponse::BadRequest().json(json!({ "message": err.to_string() }));
    }
    let session = state
        .core
        .directory
        .create_session(user_id, RememberMe::Session, Utc::now())
        .await;
    HttpResponse::Ok().json(SessionResponse {
        session_id: session.session_id.to_string(),
        user_id: user_id.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInRequest {
    pub app_id: AppId,
    pub username: String,
    pub password_token: Vec<u8>,
    #[serde(default)]
    pub remember_me: bool,
}

/// Verifies the client-submitted `passwordToken` against the stored one.
/// The real opaque password-authenticated key exchange this stands in for
/// is the black-box primitive suite scoped out in §1; this boundary only
/// compares the already-derived token the client presents.
pub async fn sign_in<S: StoreAdapter, K: KeyAgreement>(
    state: web::Data<AppState<S, K>>,
    body: web::Json<SignInRequest>,
) -> impl Responder {
    let body = body.into_inner();
    let user = match state
        .core
        .directory
        .find_by_username(body.app_id, &body.username)
        .await
    {
        Ok(user) => user,
        Err(_) => return HttpResponse::Unauthorized().json(json!({ "message": "unauthorized" })),
    };
    if user.password_token != body.password_token {
        return HttpResponse::Unauthorized().json(json!({ "message": "unauthorized" }));
    }
    let remember_me = if body.remember_me {
        RememberMe::Local
    } else {
        RememberMe::Session
    };
    let session = state
        .core
        .directory
        .create_session(user.user_id, remember_me, Utc::now())
        .await;
    HttpResponse::Ok().json(SessionResponse {
        session_id: session.session_id.to_string(),
        user_id: user.user_id.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInWithSessionRequest {
    pub session_id: vaultsync_core::identifiers::SessionId,
}

pub async fn sign_in_with_session<S: StoreAdapter, K: KeyAgreement>(
    state: web::Data<AppState<S, K>>,
    body: web::Json<SignInWithSessionRequest>,
) -> impl Responder {
    match state.core.directory.find_session(body.session_id).await {
        Ok(session) => HttpResponse::Ok().json(SessionResponse {
            session_id: session.session_id.to_string(),
            user_id: session.user_id.to_string(),
        }),
        Err(_) => HttpResponse::Unauthorized().json(json!({ "message": "unauthorized" })),
    }
}

#[derive(Deserialize)]
pub struct ServerPublicKeyQuery {
    #[allow(dead_code)]
    app_id: Option<AppId>,
}

/// Placeholder server-side public key: the black-box key-agreement suite
/// (§1) owns the real key, not the core.
pub async fn server_public_key<S: StoreAdapter, K: KeyAgreement>(
    _state: web::Data<AppState<S, K>>,
    _query: web::Query<ServerPublicKeyQuery>,
) -> impl Responder {
    HttpResponse::Ok()
        .content_type("application/octet-stream")
        .body(vec![0u8; 32])
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordSaltsQuery {
    app_id: AppId,
    username: String,
}

pub async fn get_password_salts<S: StoreAdapter, K: KeyAgreement>(
    state: web::Data<AppState<S, K>>,
    query: web::Query<PasswordSaltsQuery>,
) -> impl Responder {
    match state
        .core
        .directory
        .find_by_username(query.app_id, &query.username)
        .await
    {
        Ok(user) => HttpResponse::Ok().json(json!({
            "encryption": user.key_salts.encryption,
            "diffieHellman": user.key_salts.diffie_hellman,
            "hmac": user.key_salts.hmac,
        })),
        Err(_) => HttpResponse::NotFound().json(json!({ "message": "not found" })),
    }
}

pub async fn ping() -> impl Responder {
    HttpResponse::Ok().body("Healthy")
}

fn rand_salt() -> Vec<u8> {
    use uuid::Uuid;
    Uuid::new_v4().as_bytes().to_vec()
}

/// Upgrade a HTTP connection to a WebSocket connection (§4.3, §4.6).
/// Authenticates via the session named in the `VaultSyncOpenParams` header
/// before completing the handshake, per §4.6's "unauthenticated upgrades
/// are rejected before the handshake completes".
#[tracing::instrument(name = "upgrade connection to websocket", skip(req, stream, state))]
pub async fn upgrade_connection<S: StoreAdapter + 'static, K: KeyAgreement + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<S, K>>,
) -> actix_web::Result<HttpResponse> {
    let header_value = match req.headers().get(OPEN_PARAMS_HEADER) {
        Some(value) => value.as_bytes(),
        None => {
            return Ok(HttpResponse::BadRequest().body(format!("missing {OPEN_PARAMS_HEADER}")))
        }
    };
    let params = match decode_open_params(header_value) {
        Ok(params) => params,
        Err(e) => return Ok(HttpResponse::BadRequest().body(e)),
    };

    let session = match state.core.directory.find_session(params.session_id).await {
        Ok(session) => session,
        Err(_) => return Ok(HttpResponse::Unauthorized().finish()),
    };
    let user = match state.core.directory.find_by_id(session.user_id).await {
        Ok(user) => user,
        Err(_) => return Ok(HttpResponse::Unauthorized().finish()),
    };

    let client_id = ClientId::new(params.client_id);
    let (outbox_tx, outbox_rx) = tokio::sync::mpsc::channel(256);
    let (close_tx, close_rx) = tokio::sync::mpsc::channel(1);
    let registered = state
        .core
        .registry
        .register(user.user_id, client_id.clone(), outbox_tx, close_tx)
        .await;

    let (connection_core, handshake) = vaultsync_core::connection::ConnectionCore::new(
        Arc::clone(&state.core),
        registered,
        params.app_id,
        session.session_id,
        &user.public_key,
        user.key_salts.encryption.clone(),
    );

    let actor = ConnectionActor::new(
        connection_core,
        handshake,
        client_id,
        state.settings.heartbeat_interval(),
        outbox_rx,
        close_rx,
    );
    actix_web_actors::ws::start(actor, &req, stream)
}
