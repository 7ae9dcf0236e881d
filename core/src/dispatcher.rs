// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The subscription dispatcher (§4.5): couples the transaction log engine
//! to the session registry. Grounded in the teacher's
//! `server/src/ws/dispatch.rs` notify-by-queue-id pattern, generalized to a
//! set of subscribers per database instead of one client per queue.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::identifiers::{ConnectionId, DatabaseId, UserId};
use crate::registry::{CloseReason, RegisteredConnection};
use crate::txlog::{Bundle, TransactionRecord};

/// An outbound unsolicited frame produced by the dispatcher. The connection
/// core's wire encoder turns this into the `route`s named in §6.1.
#[derive(Clone, Debug)]
pub enum DispatchEvent {
    TransactionLog(Vec<TransactionRecord>),
    BundlePublished(Bundle),
}

struct Subscriber<Msg> {
    connection: Arc<RegisteredConnection<Msg>>,
    last_delivered_seq: u64,
}

struct DatabaseSubscribers<Msg> {
    subscribers: Vec<Subscriber<Msg>>,
}

impl<Msg> Default for DatabaseSubscribers<Msg> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

/// Per-connection bound on queued-but-unsent outbound events; exceeding it
/// drops the subscription and closes the connection with `SlowConsumer`
/// (§4.5 backpressure). Enforced here by capping the channel the connection
/// core gives the registry for its outbox, rather than by a second queue
/// inside the dispatcher, so there is exactly one place messages can back
/// up.
pub const SUBSCRIBER_OUTBOX_CAPACITY: usize = 256;

/// Fan-out state for every database with at least one open subscriber.
pub struct SubscriptionDispatcher<Msg> {
    databases: RwLock<HashMap<(UserId, DatabaseId), DatabaseSubscribers<Msg>>>,
}

impl<Msg> Default for SubscriptionDispatcher<Msg> {
    fn default() -> Self {
        Self {
            databases: RwLock::new(HashMap::new()),
        }
    }
}

impl<Msg: From<DispatchEvent> + Clone> SubscriptionDispatcher<Msg> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection` as a subscriber of `(user_id, db_id)`, having
    /// already delivered everything up to and including
    /// `last_delivered_seq` out-of-band (via [`crate::txlog::LogEngine::open`]
    /// or `reopen_at`).
    pub async fn subscribe(
        &self,
        user_id: UserId,
        db_id: DatabaseId,
        connection: Arc<RegisteredConnection<Msg>>,
        last_delivered_seq: u64,
    ) {
        let mut databases = self.databases.write().await;
        let entry = databases.entry((user_id, db_id)).or_default();
        entry.subscribers.retain(|s| s.connection.id != connection.id);
        entry.subscribers.push(Subscriber {
            connection,
            last_delivered_seq,
        });
    }

    /// Detach `connection_id` from every database it is subscribed to (used
    /// on connection close, §5 cancellation).
    pub async fn unsubscribe_all(&self, connection_id: ConnectionId) {
        let mut databases = self.databases.write().await;
        for entry in databases.values_mut() {
            entry
                .subscribers
                .retain(|s| s.connection.id != connection_id);
        }
        databases.retain(|_, entry| !entry.subscribers.is_empty());
    }

    /// Fan out newly appended `records` to every subscriber of `db_id`, in
    /// registration order, advancing each subscriber's watermark. On send
    /// failure the subscriber is detached and its connection scheduled for
    /// close with `SlowConsumer`; other subscribers are unaffected (§4.5).
    pub async fn dispatch_records(
        &self,
        user_id: UserId,
        db_id: DatabaseId,
        records: Vec<TransactionRecord>,
    ) {
        let Some(max_seq) = records.iter().map(|r| r.seq_no).max() else {
            return;
        };
        let mut to_close = Vec::new();
        {
            let mut databases = self.databases.write().await;
            if let Some(entry) = databases.get_mut(&(user_id, db_id)) {
                entry.subscribers.retain_mut(|subscriber| {
                    match subscriber
                        .connection
                        .send(Msg::from(DispatchEvent::TransactionLog(records.clone())))
                    {
                        Ok(()) => {
                            subscriber.last_delivered_seq = max_seq;
                            true
                        }
                        Err(()) => {
                            to_close.push(subscriber.connection.clone());
                            false
                        }
                    }
                });
            }
        }
        for connection in to_close {
            connection.close(CloseReason::SlowConsumer).await;
        }
    }

    /// Notify every subscriber of `db_id` that a new bundle was published,
    /// so they can drop replayed history (§4.5).
    pub async fn dispatch_bundle(&self, user_id: UserId, db_id: DatabaseId, bundle: Bundle) {
        let mut to_close = Vec::new();
        {
            let mut databases = self.databases.write().await;
            if let Some(entry) = databases.get_mut(&(user_id, db_id)) {
                entry.subscribers.retain_mut(|subscriber| {
                    match subscriber
                        .connection
                        .send(Msg::from(DispatchEvent::BundlePublished(bundle.clone())))
                    {
                        Ok(()) => true,
                        Err(()) => {
                            to_close.push(subscriber.connection.clone());
                            false
                        }
                    }
                });
            }
        }
        for connection in to_close {
            connection.close(CloseReason::SlowConsumer).await;
        }
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self, user_id: UserId, db_id: DatabaseId) -> usize {
        let databases = self.databases.read().await;
        databases
            .get(&(user_id, db_id))
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::{ClientId, ItemKey};
    use crate::registry::SessionRegistry;
    use crate::txlog::Command;
    use tokio::sync::mpsc;

    #[derive(Clone, Debug)]
    enum TestMsg {
        Event(DispatchEvent),
    }
    impl From<DispatchEvent> for TestMsg {
        fn from(value: DispatchEvent) -> Self {
            TestMsg::Event(value)
        }
    }

    fn record(seq_no: u64, user: UserId) -> TransactionRecord {
        TransactionRecord {
            seq_no,
            command: Command::Insert,
            item_key: ItemKey::new(vec![seq_no as u8]),
            encrypted_item: vec![1],
            created_by: user,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_records_in_order() {
        let registry: SessionRegistry<TestMsg> = SessionRegistry::new();
        let dispatcher: SubscriptionDispatcher<TestMsg> = SubscriptionDispatcher::new();
        let user = UserId::random();
        let db = DatabaseId::random();

        let (tx, mut rx) = mpsc::channel(8);
        let (ctx, _crx) = mpsc::channel(8);
        let conn = registry
            .register(user, ClientId::new("d1"), tx, ctx)
            .await;
        dispatcher.subscribe(user, db, conn, 0).await;

        dispatcher
            .dispatch_records(user, db, vec![record(1, user), record(2, user)])
            .await;

        match rx.recv().await.unwrap() {
            TestMsg::Event(DispatchEvent::TransactionLog(records)) => {
                assert_eq!(records.iter().map(|r| r.seq_no).collect::<Vec<_>>(), vec![1, 2]);
            }
            _ => panic!("unexpected event"),
        }
    }

    #[tokio::test]
    async fn send_failure_detaches_only_the_failing_subscriber() {
        let registry: SessionRegistry<TestMsg> = SessionRegistry::new();
        let dispatcher: SubscriptionDispatcher<TestMsg> = SubscriptionDispatcher::new();
        let user = UserId::random();
        let db = DatabaseId::random();

        // Capacity-1 channel that we fill, so the next send fails.
        let (tx1, _rx1) = mpsc::channel(1);
        tx1.try_send(TestMsg::Event(DispatchEvent::BundlePublished(Bundle {
            bundle_seq_no: 0,
            blob: vec![],
        })))
        .unwrap();
        let (ctx1, _crx1) = mpsc::channel(8);
        let conn1 = registry
            .register(user, ClientId::new("d1"), tx1, ctx1)
            .await;

        let (tx2, mut rx2) = mpsc::channel(8);
        let (ctx2, _crx2) = mpsc::channel(8);
        let conn2 = registry
            .register(user, ClientId::new("d2"), tx2, ctx2)
            .await;

        dispatcher.subscribe(user, db, conn1, 0).await;
        dispatcher.subscribe(user, db, conn2, 0).await;

        dispatcher
            .dispatch_records(user, db, vec![record(1, user)])
            .await;

        assert_eq!(dispatcher.subscriber_count(user, db).await, 1);
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn unsubscribe_all_removes_connection_from_every_database() {
        let registry: SessionRegistry<TestMsg> = SessionRegistry::new();
        let dispatcher: SubscriptionDispatcher<TestMsg> = SubscriptionDispatcher::new();
        let user = UserId::random();
        let db1 = DatabaseId::random();
        let db2 = DatabaseId::random();

        let (tx, _rx) = mpsc::channel(8);
        let (ctx, _crx) = mpsc::channel(8);
        let conn = registry
            .register(user, ClientId::new("d1"), tx, ctx)
            .await;

        dispatcher.subscribe(user, db1, conn.clone(), 0).await;
        dispatcher.subscribe(user, db2, conn.clone(), 0).await;
        dispatcher.unsubscribe_all(conn.id).await;

        assert_eq!(dispatcher.subscriber_count(user, db1).await, 0);
        assert_eq!(dispatcher.subscriber_count(user, db2).await, 0);
    }
}
