// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! An in-memory [`StoreAdapter`], used as the default backend and by the
//! test suite. Mirrors the `RwLock<HashMap<...>>` idiom of the teacher's
//! `storage_provider/memory` implementations.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::errors::StoreError;

use super::{BatchPut, StoreAdapter};

#[derive(Debug, Default)]
struct Partition {
    items: BTreeMap<u64, Vec<u8>>,
    next_seq: u64,
}

/// A thread-safe, in-memory implementation of [`StoreAdapter`] based on
/// `BTreeMap`s keyed by sort key, one per partition.
#[derive(Debug, Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<String, Partition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn put(
        &self,
        partition: &str,
        sort: u64,
        item: Vec<u8>,
        if_absent: bool,
    ) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().unwrap();
        let entry = partitions.entry(partition.to_string()).or_default();
        if if_absent && entry.items.contains_key(&sort) {
            return Err(StoreError::Conflict);
        }
        entry.items.insert(sort, item);
        Ok(())
    }

    async fn get(&self, partition: &str, sort: u64) -> Result<Vec<u8>, StoreError> {
        let partitions = self.partitions.read().unwrap();
        partitions
            .get(partition)
            .and_then(|p| p.items.get(&sort))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn range(
        &self,
        partition: &str,
        from_sort: u64,
        to_sort: Option<u64>,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let partitions = self.partitions.read().unwrap();
        let Some(p) = partitions.get(partition) else {
            return Ok(Vec::new());
        };
        let upper = to_sort.unwrap_or(u64::MAX);
        Ok(p
            .items
            .range(from_sort..=upper)
            .map(|(k, v)| (*k, v.clone()))
            .collect())
    }

    async fn batch(&self, partition: &str, ops: Vec<BatchPut>) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().unwrap();
        let entry = partitions.entry(partition.to_string()).or_default();
        // Validate every precondition before mutating anything, so the
        // batch is all-or-nothing.
        for op in &ops {
            if op.if_absent && entry.items.contains_key(&op.sort) {
                return Err(StoreError::ConditionFailed);
            }
        }
        for op in ops {
            entry.items.insert(op.sort, op.item);
        }
        Ok(())
    }

    async fn next_seq(&self, partition: &str) -> Result<u64, StoreError> {
        let mut partitions = self.partitions.write().unwrap();
        let entry = partitions.entry(partition.to_string()).or_default();
        entry.next_seq += 1;
        Ok(entry.next_seq)
    }

    async fn next_seq_range(&self, partition: &str, count: u64) -> Result<u64, StoreError> {
        if count == 0 {
            return Err(StoreError::Unavailable("empty range requested".into()));
        }
        let mut partitions = self.partitions.write().unwrap();
        let entry = partitions.entry(partition.to_string()).or_default();
        let first = entry.next_seq + 1;
        entry.next_seq += count;
        Ok(first)
    }

    async fn delete(&self, partition: &str, sort: u64) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().unwrap();
        if let Some(p) = partitions.get_mut(partition) {
            p.items.remove(&sort);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_if_absent_conflicts_on_duplicate() {
        let store = MemoryStore::new();
        store.put("p", 1, vec![1], true).await.unwrap();
        let err = store.put("p", 1, vec![2], true).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict);
    }

    #[tokio::test]
    async fn next_seq_is_monotonic_and_starts_at_one() {
        let store = MemoryStore::new();
        assert_eq!(store.next_seq("p").await.unwrap(), 1);
        assert_eq!(store.next_seq("p").await.unwrap(), 2);
        assert_eq!(store.next_seq("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn next_seq_range_is_contiguous_and_reserved() {
        let store = MemoryStore::new();
        let first = store.next_seq_range("p", 5).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(store.next_seq("p").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.put("p", 1, vec![1], true).await.unwrap();
        let ops = vec![
            BatchPut {
                partition: "p".into(),
                sort: 2,
                item: vec![2],
                if_absent: true,
            },
            BatchPut {
                partition: "p".into(),
                sort: 1,
                item: vec![9],
                if_absent: true,
            },
        ];
        let err = store.batch("p", ops).await.unwrap_err();
        assert_eq!(err, StoreError::ConditionFailed);
        // Neither write landed.
        assert_eq!(store.get("p", 2).await.unwrap_err(), StoreError::NotFound);
    }

    #[tokio::test]
    async fn range_is_ordered_ascending() {
        let store = MemoryStore::new();
        store.put("p", 3, vec![3], false).await.unwrap();
        store.put("p", 1, vec![1], false).await.unwrap();
        store.put("p", 2, vec![2], false).await.unwrap();
        let items = store.range("p", 0, None).await.unwrap();
        assert_eq!(items.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
