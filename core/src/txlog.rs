// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The transaction log engine (§4.4): per-`(user, database)` append-only
//! logs with server-coordinated bundling. Grounded in the teacher's
//! `backend/src/qs/queue.rs` sequence-number-then-insert idiom, generalized
//! from a single-reader queue to a multi-subscriber ordered log with
//! bundling.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::errors::{LogError, StoreError};
use crate::identifiers::{DatabaseId, ItemKey, UserId};
use crate::store::{BatchPut, StoreAdapter};

/// Individual transaction records are capped at 400 KiB including framing
/// (§3).
pub const MAX_RECORD_BYTES: usize = 400 * 1024;

/// §9: the distilled spec left the batch size bound as a free variable;
/// this expansion fixes it at 128 items.
pub const MAX_BATCH_SIZE: usize = 128;

/// How many times the engine will reallocate a seqNo (or seqNo range) after
/// a conditional-insert collision before giving up.
const MAX_APPEND_RETRIES: u32 = 5;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    Insert,
    Update,
    Delete,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub seq_no: u64,
    pub command: Command,
    pub item_key: ItemKey,
    pub encrypted_item: Vec<u8>,
    pub created_by: UserId,
}

/// A snapshot of a database at `seq_no = bundle_seq_no`, supplied by a
/// client (§3).
#[derive(Clone, Debug)]
pub struct Bundle {
    pub bundle_seq_no: u64,
    pub blob: Vec<u8>,
}

/// What a freshly-opened subscription (or a reconnecting one) should
/// receive, per §4.4 "Open".
pub struct OpenResult {
    pub bundle: Option<Bundle>,
    pub records: Vec<TransactionRecord>,
}

fn partition_key(user_id: UserId, db_id: DatabaseId) -> String {
    format!("{}/{}", user_id, db_id)
}

/// Per-database bookkeeping kept in memory alongside the store: the set of
/// currently-live item keys (for the insert/update/delete invariant) and
/// the current bundle, if any.
#[derive(Default)]
struct DatabaseState {
    live_keys: HashSet<ItemKey>,
    bundle: Option<Bundle>,
    max_seq_no: u64,
}

/// Owns every `(user, database)` log in the process. One instance is shared
/// (behind an `Arc`) by the connection core and the subscription
/// dispatcher.
pub struct LogEngine<S: StoreAdapter> {
    store: Arc<S>,
    databases: RwLock<HashMap<(UserId, DatabaseId), Arc<Mutex<DatabaseState>>>>,
}

impl<S: StoreAdapter> LogEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            databases: RwLock::new(HashMap::new()),
        }
    }

    /// The per-`(user, database)` lock. `append`/`append_batch` hold it for
    /// the full check-allocate-write-apply sequence, not just around the
    /// map lookup, so the key invariant is serialized the same way seqNo
    /// allocation is (§5).
    async fn database_lock(
        &self,
        user_id: UserId,
        db_id: DatabaseId,
    ) -> Arc<Mutex<DatabaseState>> {
        {
            let databases = self.databases.read().await;
            if let Some(lock) = databases.get(&(user_id, db_id)) {
                return lock.clone();
            }
        }
        let mut databases = self.databases.write().await;
        databases
            .entry((user_id, db_id))
            .or_insert_with(|| Arc::new(Mutex::new(DatabaseState::default())))
            .clone()
    }

    async fn with_state<R>(
        &self,
        user_id: UserId,
        db_id: DatabaseId,
        f: impl FnOnce(&mut DatabaseState) -> R,
    ) -> R {
        let lock = self.database_lock(user_id, db_id).await;
        let mut state = lock.lock().await;
        f(&mut state)
    }

    /// Validates the insert/update/delete invariant from §3 without
    /// mutating state; the caller applies the resulting `live_keys` update
    /// only after the store append succeeds.
    fn check_key_invariant(
        state: &DatabaseState,
        command: Command,
        item_key: &ItemKey,
    ) -> Result<(), LogError> {
        let is_live = state.live_keys.contains(item_key);
        match command {
            Command::Insert if is_live => Err(LogError::KeyInvariantViolated),
            Command::Update | Command::Delete if !is_live => Err(LogError::KeyInvariantViolated),
            _ => Ok(()),
        }
    }

    fn apply_key_invariant(state: &mut DatabaseState, command: Command, item_key: &ItemKey) {
        match command {
            Command::Insert => {
                state.live_keys.insert(item_key.clone());
            }
            Command::Delete => {
                state.live_keys.remove(item_key);
            }
            Command::Update => {}
        }
    }

    /// Append a single command (§4.4 "Append (single command)").
    pub async fn append(
        &self,
        user_id: UserId,
        db_id: DatabaseId,
        command: Command,
        item_key: ItemKey,
        encrypted_item: Vec<u8>,
        created_by: UserId,
    ) -> Result<TransactionRecord, LogError> {
        if encrypted_item.len() > MAX_RECORD_BYTES {
            return Err(LogError::RecordTooLarge);
        }

        // Held across the seqNo allocation and store write below: two
        // concurrent appends for the same key (e.g. two connections of the
        // same user) must not both observe the key as not-live.
        let lock = self.database_lock(user_id, db_id).await;
        let mut state = lock.lock().await;
        Self::check_key_invariant(&state, command, &item_key)?;

        let partition = partition_key(user_id, db_id);

        let mut last_err = None;
        for _ in 0..MAX_APPEND_RETRIES {
            let seq_no = self.store.next_seq(&partition).await?;
            let record = TransactionRecord {
                seq_no,
                command,
                item_key: item_key.clone(),
                encrypted_item: encrypted_item.clone(),
                created_by,
            };
            let encoded = encode_record(&record);
            match self.store.put(&partition, seq_no, encoded, true).await {
                Ok(()) => {
                    Self::apply_key_invariant(&mut state, command, &item_key);
                    state.max_seq_no = state.max_seq_no.max(seq_no);
                    return Ok(record);
                }
                Err(StoreError::Conflict) => {
                    last_err = Some(LogError::Store(StoreError::Conflict));
                    continue;
                }
                Err(other) => return Err(LogError::Store(other)),
            }
        }
        tracing::warn!(
            user = %user_id,
            database = %db_id,
            "exhausted seqNo retries appending to transaction log"
        );
        Err(last_err.unwrap_or(LogError::ServiceUnavailable))
    }

    /// Append a batch of commands atomically (§4.4 "Append (batch)", P3).
    pub async fn append_batch(
        &self,
        user_id: UserId,
        db_id: DatabaseId,
        items: Vec<(Command, ItemKey, Vec<u8>)>,
        created_by: UserId,
    ) -> Result<Vec<TransactionRecord>, LogError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        if items.len() > MAX_BATCH_SIZE {
            return Err(LogError::BatchTooLarge);
        }
        for (_, _, encrypted_item) in &items {
            if encrypted_item.len() > MAX_RECORD_BYTES {
                return Err(LogError::RecordTooLarge);
            }
        }

        // Held across seqNo-range allocation and the store batch write, for
        // the same reason as in `append`: the invariant check and its
        // application to `live_keys` must be atomic with respect to other
        // appenders on this database.
        let lock = self.database_lock(user_id, db_id).await;
        let mut state = lock.lock().await;

        let mut live: HashSet<ItemKey> = state.live_keys.clone();
        for (command, item_key, _) in &items {
            let is_live = live.contains(item_key);
            match command {
                Command::Insert if is_live => return Err(LogError::KeyInvariantViolated),
                Command::Update | Command::Delete if !is_live => {
                    return Err(LogError::KeyInvariantViolated);
                }
                _ => {}
            }
            match command {
                Command::Insert => {
                    live.insert(item_key.clone());
                }
                Command::Delete => {
                    live.remove(item_key);
                }
                Command::Update => {}
            }
        }

        let partition = partition_key(user_id, db_id);
        let count = items.len() as u64;

        for _ in 0..MAX_APPEND_RETRIES {
            let first_seq = self.store.next_seq_range(&partition, count).await?;
            let records: Vec<TransactionRecord> = items
                .iter()
                .enumerate()
                .map(|(i, (command, item_key, encrypted_item))| TransactionRecord {
                    seq_no: first_seq + i as u64,
                    command: *command,
                    item_key: item_key.clone(),
                    encrypted_item: encrypted_item.clone(),
                    created_by,
                })
                .collect();
            let ops = records
                .iter()
                .map(|r| BatchPut {
                    partition: partition.clone(),
                    sort: r.seq_no,
                    item: encode_record(r),
                    if_absent: true,
                })
                .collect();

            match self.store.batch(&partition, ops).await {
                Ok(()) => {
                    for (command, item_key, _) in &items {
                        Self::apply_key_invariant(&mut state, *command, item_key);
                    }
                    state.max_seq_no = state.max_seq_no.max(first_seq + count - 1);
                    return Ok(records);
                }
                Err(StoreError::ConditionFailed) | Err(StoreError::TxConflict) => continue,
                Err(other) => return Err(LogError::Store(other)),
            }
        }
        tracing::warn!(
            user = %user_id,
            database = %db_id,
            "exhausted seqNo retries appending batch to transaction log"
        );
        Err(LogError::ServiceUnavailable)
    }

    /// §4.4 "Open": returns the current bundle (if any) followed by every
    /// record after it.
    pub async fn open(
        &self,
        user_id: UserId,
        db_id: DatabaseId,
    ) -> Result<OpenResult, LogError> {
        let bundle = self
            .with_state(user_id, db_id, |state| state.bundle.clone())
            .await;
        let from = bundle.as_ref().map(|b| b.bundle_seq_no + 1).unwrap_or(1);
        let records = self.records_from(user_id, db_id, from).await?;
        Ok(OpenResult { bundle, records })
    }

    /// §4.4 ordering guarantee case (a): reopen at a specific seqNo
    /// baseline, valid only if it is not before the retained bundle.
    pub async fn reopen_at(
        &self,
        user_id: UserId,
        db_id: DatabaseId,
        reopen_at_seq_no: u64,
    ) -> Result<Vec<TransactionRecord>, LogError> {
        let bundle_seq_no = self
            .with_state(user_id, db_id, |state| {
                state.bundle.as_ref().map(|b| b.bundle_seq_no)
            })
            .await;
        if let Some(bundle_seq_no) = bundle_seq_no {
            if reopen_at_seq_no < bundle_seq_no {
                return Err(LogError::SeqNoBelowBundle);
            }
        }
        self.records_from(user_id, db_id, reopen_at_seq_no + 1).await
    }

    async fn records_from(
        &self,
        user_id: UserId,
        db_id: DatabaseId,
        from_seq_no: u64,
    ) -> Result<Vec<TransactionRecord>, LogError> {
        let partition = partition_key(user_id, db_id);
        let raw = self.store.range(&partition, from_seq_no, None).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(_, bytes)| decode_record(&bytes))
            .collect())
    }

    /// §4.4 "Bundle publish".
    pub async fn publish_bundle(
        &self,
        user_id: UserId,
        db_id: DatabaseId,
        seq_no: u64,
        blob: Vec<u8>,
    ) -> Result<(), LogError> {
        self.with_state(user_id, db_id, |state| {
            let prior = state.bundle.as_ref().map(|b| b.bundle_seq_no).unwrap_or(0);
            if seq_no < prior + 1 || seq_no > state.max_seq_no {
                return Err(LogError::InvalidBundleSeqNo);
            }
            state.bundle = Some(Bundle {
                bundle_seq_no: seq_no,
                blob,
            });
            Ok(())
        })
        .await?;

        // Records at or below the new bundle become eligible for async GC;
        // collection is best-effort and never blocks the publishing caller.
        let partition = partition_key(user_id, db_id);
        for sort in 1..=seq_no {
            let _ = self.store.delete(&partition, sort).await;
        }
        Ok(())
    }

    pub async fn current_bundle_seq_no(&self, user_id: UserId, db_id: DatabaseId) -> u64 {
        self.with_state(user_id, db_id, |state| {
            state.bundle.as_ref().map(|b| b.bundle_seq_no).unwrap_or(0)
        })
        .await
    }
}

fn encode_record(record: &TransactionRecord) -> Vec<u8> {
    serde_json::to_vec(record).expect("TransactionRecord is always serializable")
}

fn decode_record(bytes: &[u8]) -> Option<TransactionRecord> {
    serde_json::from_slice(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn setup() -> (LogEngine<MemoryStore>, UserId, DatabaseId) {
        let engine = LogEngine::new(Arc::new(MemoryStore::new()));
        (engine, UserId::random(), DatabaseId::random())
    }

    #[tokio::test]
    async fn append_assigns_increasing_seq_nos() {
        let (engine, user, db) = setup();
        let r1 = engine
            .append(
                user,
                db,
                Command::Insert,
                ItemKey::new(b"k1".to_vec()),
                vec![1],
                user,
            )
            .await
            .unwrap();
        let r2 = engine
            .append(
                user,
                db,
                Command::Insert,
                ItemKey::new(b"k2".to_vec()),
                vec![2],
                user,
            )
            .await
            .unwrap();
        assert_eq!(r1.seq_no, 1);
        assert_eq!(r2.seq_no, 2);
    }

    #[tokio::test]
    async fn duplicate_insert_of_live_key_is_rejected() {
        let (engine, user, db) = setup();
        let key = ItemKey::new(b"k1".to_vec());
        engine
            .append(user, db, Command::Insert, key.clone(), vec![1], user)
            .await
            .unwrap();
        let err = engine
            .append(user, db, Command::Insert, key, vec![2], user)
            .await
            .unwrap_err();
        assert_eq!(err, LogError::KeyInvariantViolated);
    }

    #[tokio::test]
    async fn update_of_unknown_key_is_rejected() {
        let (engine, user, db) = setup();
        let err = engine
            .append(
                user,
                db,
                Command::Update,
                ItemKey::new(b"missing".to_vec()),
                vec![1],
                user,
            )
            .await
            .unwrap_err();
        assert_eq!(err, LogError::KeyInvariantViolated);
    }

    #[tokio::test]
    async fn delete_then_reinsert_is_allowed() {
        let (engine, user, db) = setup();
        let key = ItemKey::new(b"k1".to_vec());
        engine
            .append(user, db, Command::Insert, key.clone(), vec![1], user)
            .await
            .unwrap();
        engine
            .append(user, db, Command::Delete, key.clone(), vec![], user)
            .await
            .unwrap();
        let r = engine
            .append(user, db, Command::Insert, key, vec![2], user)
            .await
            .unwrap();
        assert_eq!(r.seq_no, 3);
    }

    #[tokio::test]
    async fn batch_is_atomic_and_contiguous() {
        let (engine, user, db) = setup();
        let items = vec![
            (Command::Insert, ItemKey::new(b"a".to_vec()), vec![1]),
            (Command::Insert, ItemKey::new(b"b".to_vec()), vec![2]),
            (Command::Insert, ItemKey::new(b"c".to_vec()), vec![3]),
        ];
        let records = engine.append_batch(user, db, items, user).await.unwrap();
        let seq_nos: Vec<u64> = records.iter().map(|r| r.seq_no).collect();
        assert_eq!(seq_nos, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn batch_rejected_wholesale_on_key_invariant_violation() {
        let (engine, user, db) = setup();
        let key = ItemKey::new(b"a".to_vec());
        engine
            .append(user, db, Command::Insert, key.clone(), vec![1], user)
            .await
            .unwrap();
        let items = vec![
            (Command::Insert, ItemKey::new(b"b".to_vec()), vec![2]),
            (Command::Insert, key, vec![3]),
        ];
        let err = engine
            .append_batch(user, db, items, user)
            .await
            .unwrap_err();
        assert_eq!(err, LogError::KeyInvariantViolated);
        // Nothing from the rejected batch should have landed: `b` is not
        // live, so inserting it again must succeed.
        let r = engine
            .append(
                user,
                db,
                Command::Insert,
                ItemKey::new(b"b".to_vec()),
                vec![2],
                user,
            )
            .await
            .unwrap();
        assert_eq!(r.seq_no, 2);
    }

    #[tokio::test]
    async fn open_before_any_bundle_replays_from_one() {
        let (engine, user, db) = setup();
        engine
            .append(
                user,
                db,
                Command::Insert,
                ItemKey::new(b"a".to_vec()),
                vec![1],
                user,
            )
            .await
            .unwrap();
        let opened = engine.open(user, db).await.unwrap();
        assert!(opened.bundle.is_none());
        assert_eq!(opened.records.len(), 1);
    }

    #[tokio::test]
    async fn bundle_publish_then_open_skips_replayed_history() {
        let (engine, user, db) = setup();
        for i in 0..5u8 {
            engine
                .append(
                    user,
                    db,
                    Command::Insert,
                    ItemKey::new(vec![i]),
                    vec![i],
                    user,
                )
                .await
                .unwrap();
        }
        engine
            .publish_bundle(user, db, 3, b"snapshot".to_vec())
            .await
            .unwrap();
        let opened = engine.open(user, db).await.unwrap();
        assert_eq!(opened.bundle.unwrap().bundle_seq_no, 3);
        let seq_nos: Vec<u64> = opened.records.iter().map(|r| r.seq_no).collect();
        assert_eq!(seq_nos, vec![4, 5]);
    }

    #[tokio::test]
    async fn bundle_publish_rejects_non_monotonic_seq_no() {
        let (engine, user, db) = setup();
        for i in 0..5u8 {
            engine
                .append(
                    user,
                    db,
                    Command::Insert,
                    ItemKey::new(vec![i]),
                    vec![i],
                    user,
                )
                .await
                .unwrap();
        }
        engine
            .publish_bundle(user, db, 3, b"a".to_vec())
            .await
            .unwrap();
        let err = engine
            .publish_bundle(user, db, 2, b"b".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err, LogError::InvalidBundleSeqNo);
        let err = engine
            .publish_bundle(user, db, 100, b"c".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err, LogError::InvalidBundleSeqNo);
    }

    #[tokio::test]
    async fn reopen_below_bundle_is_rejected() {
        let (engine, user, db) = setup();
        for i in 0..3u8 {
            engine
                .append(
                    user,
                    db,
                    Command::Insert,
                    ItemKey::new(vec![i]),
                    vec![i],
                    user,
                )
                .await
                .unwrap();
        }
        engine
            .publish_bundle(user, db, 2, b"a".to_vec())
            .await
            .unwrap();
        let err = engine.reopen_at(user, db, 1).await.unwrap_err();
        assert_eq!(err, LogError::SeqNoBelowBundle);
        let records = engine.reopen_at(user, db, 2).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_inserts_of_same_key_resolve_to_exactly_one_winner() {
        let (engine, user, db) = setup();
        let engine = Arc::new(engine);
        let key = ItemKey::new(b"race".to_vec());

        let t1 = {
            let engine = engine.clone();
            let key = key.clone();
            tokio::spawn(
                async move { engine.append(user, db, Command::Insert, key, vec![1], user).await },
            )
        };
        let t2 = {
            let engine = engine.clone();
            let key = key.clone();
            tokio::spawn(
                async move { engine.append(user, db, Command::Insert, key, vec![2], user).await },
            )
        };

        let (r1, r2) = tokio::join!(t1, t2);
        let results = [r1.unwrap(), r2.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(LogError::KeyInvariantViolated)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn oversized_record_is_rejected() {
        let (engine, user, db) = setup();
        let big = vec![0u8; MAX_RECORD_BYTES + 1];
        let err = engine
            .append(
                user,
                db,
                Command::Insert,
                ItemKey::new(b"k".to_vec()),
                big,
                user,
            )
            .await
            .unwrap_err();
        assert_eq!(err, LogError::RecordTooLarge);
    }
}
