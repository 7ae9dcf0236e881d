// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The session registry (§4.2): a process-local index from user identity to
//! the set of live connections for that user. Grounded in the teacher's
//! `server/src/ws/dispatch.rs` `Dispatch` struct, generalized from a
//! single-client-per-queue map to a per-user set of connections with
//! client-id supersession.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::identifiers::{ClientId, ConnectionId, UserId};

/// Why a connection was closed by the server, rather than by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Superseded,
    AuthFailed,
    MessageTooLarge,
    HeartbeatTimeout,
    SlowConsumer,
    ClientRequested,
}

/// A handle the registry holds for each live connection: enough to push an
/// outbound frame and to tell it to close. `Msg` is the server's outbound
/// wire-frame type, kept generic so this module has no dependency on the
/// connection/wire layer.
pub struct RegisteredConnection<Msg> {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub client_id: ClientId,
    outbox: mpsc::Sender<Msg>,
    close: mpsc::Sender<CloseReason>,
}

impl<Msg> RegisteredConnection<Msg> {
    /// Best-effort send; a full or closed outbox is reported to the caller
    /// so it can detach the subscription, per §4.5.
    pub fn send(&self, msg: Msg) -> Result<(), ()> {
        self.outbox.try_send(msg).map_err(|_| ())
    }

    pub async fn close(&self, reason: CloseReason) {
        let _ = self.close.send(reason).await;
    }
}

struct UserConnections<Msg> {
    by_client_id: HashMap<ClientId, Arc<RegisteredConnection<Msg>>>,
}

impl<Msg> Default for UserConnections<Msg> {
    fn default() -> Self {
        Self {
            by_client_id: HashMap::new(),
        }
    }
}

/// Process-wide registry of live connections, indexed by user.
pub struct SessionRegistry<Msg> {
    next_connection_id: AtomicU64,
    users: RwLock<HashMap<UserId, UserConnections<Msg>>>,
}

impl<Msg> Default for SessionRegistry<Msg> {
    fn default() -> Self {
        Self {
            next_connection_id: AtomicU64::new(1),
            users: RwLock::new(HashMap::new()),
        }
    }
}

impl<Msg> SessionRegistry<Msg> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection for `user_id`/`client_id`. If a connection
    /// with the same `client_id` for the same user is already registered,
    /// it is closed with [`CloseReason::Superseded`] first (§4.2 policy).
    pub async fn register(
        &self,
        user_id: UserId,
        client_id: ClientId,
        outbox: mpsc::Sender<Msg>,
        close: mpsc::Sender<CloseReason>,
    ) -> Arc<RegisteredConnection<Msg>> {
        let id = ConnectionId::new(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let connection = Arc::new(RegisteredConnection {
            id,
            user_id,
            client_id: client_id.clone(),
            outbox,
            close,
        });

        let mut users = self.users.write().await;
        let entry = users.entry(user_id).or_default();
        if let Some(superseded) = entry.by_client_id.insert(client_id, connection.clone()) {
            // Close outside the registry lock is unnecessary here since
            // `close` only enqueues onto a channel; this keeps the critical
            // section tiny regardless.
            drop(users);
            superseded.close(CloseReason::Superseded).await;
        }
        connection
    }

    /// Idempotent removal; closing twice or closing an already-superseded
    /// connection is a no-op.
    pub async fn deregister(&self, user_id: UserId, client_id: &ClientId, id: ConnectionId) {
        let mut users = self.users.write().await;
        if let Some(entry) = users.get_mut(&user_id) {
            if matches!(entry.by_client_id.get(client_id), Some(c) if c.id == id) {
                entry.by_client_id.remove(client_id);
            }
            if entry.by_client_id.is_empty() {
                users.remove(&user_id);
            }
        }
    }

    /// A consistent snapshot of a user's live connections.
    pub async fn for_user(&self, user_id: UserId) -> Vec<Arc<RegisteredConnection<Msg>>> {
        let users = self.users.read().await;
        users
            .get(&user_id)
            .map(|entry| entry.by_client_id.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn connection_count(&self) -> usize {
        let users = self.users.read().await;
        users.values().map(|e| e.by_client_id.len()).sum()
    }
}

impl<Msg: Clone> SessionRegistry<Msg> {
    /// Snapshot the user's connections under a short lock, then send
    /// outside it (§4.2 concurrency note).
    pub async fn broadcast(&self, user_id: UserId, msg: Msg) {
        let targets = self.for_user(user_id).await;
        for connection in targets {
            let _ = connection.send(msg.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> (mpsc::Sender<u8>, mpsc::Receiver<u8>, mpsc::Sender<CloseReason>, mpsc::Receiver<CloseReason>) {
        let (tx, rx) = mpsc::channel(8);
        let (ctx, crx) = mpsc::channel(8);
        (tx, rx, ctx, crx)
    }

    #[tokio::test]
    async fn register_then_for_user_returns_the_connection() {
        let registry: SessionRegistry<u8> = SessionRegistry::new();
        let user = UserId::random();
        let (tx, _rx, ctx, _crx) = channels();
        registry
            .register(user, ClientId::new("device-1"), tx, ctx)
            .await;
        let conns = registry.for_user(user).await;
        assert_eq!(conns.len(), 1);
    }

    #[tokio::test]
    async fn colliding_client_id_supersedes_the_earlier_connection() {
        let registry: SessionRegistry<u8> = SessionRegistry::new();
        let user = UserId::random();
        let (tx1, _rx1, ctx1, mut crx1) = channels();
        let (tx2, _rx2, ctx2, _crx2) = channels();

        registry
            .register(user, ClientId::new("device-1"), tx1, ctx1)
            .await;
        registry
            .register(user, ClientId::new("device-1"), tx2, ctx2)
            .await;

        let reason = crx1.recv().await.unwrap();
        assert_eq!(reason, CloseReason::Superseded);
        assert_eq!(registry.for_user(user).await.len(), 1);
    }

    #[tokio::test]
    async fn different_client_ids_coexist() {
        let registry: SessionRegistry<u8> = SessionRegistry::new();
        let user = UserId::random();
        let (tx1, _rx1, ctx1, _crx1) = channels();
        let (tx2, _rx2, ctx2, _crx2) = channels();

        registry
            .register(user, ClientId::new("device-1"), tx1, ctx1)
            .await;
        registry
            .register(user, ClientId::new("device-2"), tx2, ctx2)
            .await;

        assert_eq!(registry.for_user(user).await.len(), 2);
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let registry: SessionRegistry<u8> = SessionRegistry::new();
        let user = UserId::random();
        let (tx, _rx, ctx, _crx) = channels();
        let client_id = ClientId::new("device-1");
        let conn = registry.register(user, client_id.clone(), tx, ctx).await;

        registry.deregister(user, &client_id, conn.id).await;
        registry.deregister(user, &client_id, conn.id).await;
        assert_eq!(registry.for_user(user).await.len(), 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection_for_the_user() {
        let registry: SessionRegistry<u8> = SessionRegistry::new();
        let user = UserId::random();
        let (tx1, mut rx1, ctx1, _crx1) = channels();
        let (tx2, mut rx2, ctx2, _crx2) = channels();
        registry
            .register(user, ClientId::new("device-1"), tx1, ctx1)
            .await;
        registry
            .register(user, ClientId::new("device-2"), tx2, ctx2)
            .await;

        registry.broadcast(user, 42).await;
        assert_eq!(rx1.recv().await, Some(42));
        assert_eq!(rx2.recv().await, Some(42));
    }
}
